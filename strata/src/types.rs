/// Position of a process within a communicator, from 0.
pub type Rank = u32;

/// Identity of a communicator, shared by every member and distinct from
/// every other live communicator of the same process.
pub type CommId = u64;

/// Point-to-point message tag. Messages between the same pair of ranks on
/// the same communicator and tag are delivered in send order.
pub type Tag = u32;

/// Element types understood by the engine.
///
/// The predefined variants are plain little-endian scalars. `Derived`
/// describes an opaque contiguous element of the given byte size: it can be
/// moved but not reduced, and it keeps broadcast off the shared-memory path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F64,
    F16,
    BF16,
    I8,
    I32,
    I64,
    U8,
    U32,
    U64,
    Derived(u32),
}

impl DataType {
    /// Bytes per element.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
            DataType::Derived(size) => size as usize,
        }
    }

    /// Whether this is one of the built-in scalar types.
    pub const fn is_predefined(self) -> bool {
        !matches!(self, DataType::Derived(_))
    }

    /// Name used in logs and errors.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
            DataType::Derived(_) => "derived",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Derived(size) => write!(f, "derived({size})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Built-in reduction operations. All of them are commutative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum.
    Sum,
    /// Product.
    Prod,
    /// Smaller of each pair.
    Min,
    /// Larger of each pair.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// Source of an allreduce contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBuf {
    /// The receive buffer holds this rank's contribution and is overwritten
    /// with the result.
    InPlace,
    /// Address of a separate send buffer.
    Ptr(u64),
}
