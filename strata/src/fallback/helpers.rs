use crate::comm::{Communicator, Request};
use crate::error::{Result, StrataError};
use crate::types::{Rank, Tag};

/// Rounds needed for a doubling pattern to cover `n` ranks; 0 when there is
/// nothing to cover.
pub(crate) fn ceil_log2(n: u32) -> u32 {
    match n {
        0 | 1 => 0,
        n => u32::BITS - (n - 1).leading_zeros(),
    }
}

/// Largest power of two <= n. Returns 0 for n == 0.
pub(crate) fn floor_pow2(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    1 << (usize::BITS - 1 - n.leading_zeros())
}

/// Start a send, wrapping errors as `CollectiveFailed`.
pub(crate) fn collective_send<C: Communicator>(
    comm: &C,
    dest: Rank,
    tag: Tag,
    data: Vec<u8>,
    operation: &'static str,
) -> Result<Request> {
    comm.isend(dest, tag, data)
        .map_err(|e| e.in_collective(operation, dest))
}

/// Receive exactly `expected` bytes from `src`, wrapping errors as
/// `CollectiveFailed`.
pub(crate) async fn collective_recv<C: Communicator>(
    comm: &C,
    src: Rank,
    tag: Tag,
    expected: usize,
    operation: &'static str,
) -> Result<Vec<u8>> {
    let data = comm
        .recv(src, tag)
        .await
        .map_err(|e| e.in_collective(operation, src))?;
    if data.len() != expected {
        return Err(StrataError::BufferSizeMismatch {
            expected,
            actual: data.len(),
        });
    }
    Ok(data)
}

/// Split `count` elements into `parts` contiguous chunks; the last chunk
/// absorbs the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkLayout {
    count: usize,
    parts: usize,
}

impl ChunkLayout {
    pub(crate) fn new(count: usize, parts: usize) -> Self {
        Self {
            count,
            parts: parts.max(1),
        }
    }

    /// Element offset of chunk `i`.
    pub(crate) fn offset(&self, i: usize) -> usize {
        (self.count / self.parts) * i
    }

    /// Element count of chunk `i`.
    pub(crate) fn chunk_count(&self, i: usize) -> usize {
        let base = self.count / self.parts;
        if i + 1 == self.parts {
            base + self.count % self.parts
        } else {
            base
        }
    }
}
