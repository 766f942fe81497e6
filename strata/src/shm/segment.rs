use crate::error::{Result, StrataError};
use crate::types::CommId;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

/// Segments start on a page boundary.
const SEGMENT_ALIGN: usize = 4096;

/// Names one node-local rank's segment; equal on every rank of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    /// Communicator the segment belongs to.
    pub comm: CommId,
    /// Node the segment lives on.
    pub node: u64,
    /// Node-local slot of the owning rank.
    pub owner: u32,
}

/// A zero-initialized block of memory shared by the ranks of one node.
///
/// Plain byte accesses are unsynchronized; callers order them with the
/// acquire/release flags obtained from [`Segment::atomic_u32`].
pub struct Segment {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The segment is a raw allocation whose accesses are ordered by the flag
// protocol in `sync`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(SEGMENT_ALIGN), SEGMENT_ALIGN)
            .map_err(|e| StrataError::OutOfResources(format!("segment layout: {e}")))?;
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| StrataError::OutOfResources(format!("segment of {len} bytes")))?;
        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Base address, for logs and single-copy tokens.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(StrataError::SharedMemory(format!(
                "access {offset}+{len} outside segment of {} bytes",
                self.len()
            )));
        }
        Ok(())
    }

    /// The 32-bit flag at `offset`.
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check(offset, 4)?;
        if offset % std::mem::align_of::<AtomicU32>() != 0 {
            return Err(StrataError::SharedMemory(format!(
                "flag offset {offset} is misaligned"
            )));
        }
        // In bounds, aligned, zero-initialized and never freed while `self`
        // lives; AtomicU32 has the layout of u32.
        Ok(unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) })
    }

    /// Copy `data` into the segment at `offset`.
    ///
    /// # Safety
    /// No other rank may access the range until a release/acquire flag
    /// handoff publishes it.
    pub unsafe fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy `len` bytes out of the segment at `offset`.
    ///
    /// # Safety
    /// The range must have been published to this rank through a flag
    /// handoff and must not be written concurrently.
    pub unsafe fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Segment(0x{:x}, {}B)", self.addr(), self.len())
    }
}
