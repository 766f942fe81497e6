//! Element-wise reduction: the `Operator` seam and the built-in operators.

use crate::error::{Result, StrataError};
use crate::types::{DataType, ReduceOp};

/// A reduction operator applied element-wise to typed byte buffers.
///
/// Implementations must be associative. Non-commutative operators are
/// supported: the engine always passes the lower-ranked partial as the
/// left operand.
pub trait Operator: Send + Sync {
    /// Whether `a ⊕ b == b ⊕ a` for all inputs.
    fn is_commutative(&self) -> bool;

    /// `acc[i] = acc[i] ⊕ rhs[i]` for `count` elements of `dtype`.
    ///
    /// Both slices hold exactly `count * dtype.size_in_bytes()` bytes.
    fn apply(&self, acc: &mut [u8], rhs: &[u8], count: usize, dtype: DataType) -> Result<()>;

    /// Whether `apply` accepts `dtype`. Checked on every rank before any
    /// traffic, so an unsupported call fails everywhere instead of hanging.
    fn supports(&self, _dtype: DataType) -> bool {
        true
    }

    /// Short name for logs.
    fn name(&self) -> &str {
        "user"
    }
}

impl Operator for ReduceOp {
    fn is_commutative(&self) -> bool {
        true
    }

    fn apply(&self, acc: &mut [u8], rhs: &[u8], count: usize, dtype: DataType) -> Result<()> {
        reduce_slice(acc, rhs, count, dtype, *self)
    }

    fn supports(&self, dtype: DataType) -> bool {
        !matches!(dtype, DataType::F16 | DataType::BF16 | DataType::Derived(_))
    }

    fn name(&self) -> &str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Prod => "prod",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
        }
    }
}

/// `acc = lhs ⊕ acc`, for folding a lower-ranked partial into a higher one.
pub(crate) fn apply_left(
    op: &dyn Operator,
    lhs: &[u8],
    acc: &mut [u8],
    count: usize,
    dtype: DataType,
) -> Result<()> {
    if op.is_commutative() {
        return op.apply(acc, lhs, count, dtype);
    }
    let mut out = lhs.to_vec();
    op.apply(&mut out, acc, count, dtype)?;
    acc.copy_from_slice(&out);
    Ok(())
}

/// Element types the built-in operators can combine.
pub(crate) trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// Fold `src` into `dst` element by element, both read as `dtype` values.
///
/// Both slices hold `count` elements of `dtype`, little-endian.
pub(crate) fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    let expected = count * dtype.size_in_bytes();
    if dst.len() != expected || src.len() != expected {
        return Err(StrataError::BufferSizeMismatch {
            expected,
            actual: dst.len().min(src.len()),
        });
    }
    match dtype {
        DataType::F32 => reduce_slice_typed::<f32>(dst, src, count, op),
        DataType::F64 => reduce_slice_typed::<f64>(dst, src, count, op),
        DataType::I32 => reduce_slice_typed::<i32>(dst, src, count, op),
        DataType::I64 => reduce_slice_typed::<i64>(dst, src, count, op),
        DataType::U32 => reduce_slice_typed::<u32>(dst, src, count, op),
        DataType::U64 => reduce_slice_typed::<u64>(dst, src, count, op),
        DataType::I8 => reduce_slice_typed::<i8>(dst, src, count, op),
        DataType::U8 => reduce_slice_typed::<u8>(dst, src, count, op),
        _ => {
            return Err(StrataError::UnsupportedDType {
                dtype,
                op: "reduce",
            });
        }
    }
    Ok(())
}

/// Alignment-free little-endian element access.
trait LeBytes: Sized {
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Self::from_le_bytes(raw)
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64);

fn reduce_slice_typed<T: Reducible + LeBytes>(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    op: ReduceOp,
) {
    let t_size = std::mem::size_of::<T>();
    for i in 0..count {
        let off = i * t_size;
        let a = T::read_le(&dst[off..off + t_size]);
        let b = T::read_le(&src[off..off + t_size]);
        let r = T::reduce(a, b, op);
        r.write_le(&mut dst[off..off + t_size]);
    }
}
