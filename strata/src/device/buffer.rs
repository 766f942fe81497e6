use crate::device::DeviceAdapter;
use crate::error::{Result, StrataError};

/// A caller buffer paired with the adapter that knows how to reach it.
///
/// Constructing one is the unsafe step; afterwards every access goes through
/// bounds-checked `load`/`store` calls on the adapter.
#[derive(Clone, Copy)]
pub(crate) struct DeviceBuf<'a> {
    adapter: &'a dyn DeviceAdapter,
    ptr: u64,
    len: usize,
}

impl<'a> DeviceBuf<'a> {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for `'a`, and
    /// nothing outside the running collective may touch it meanwhile.
    pub(crate) unsafe fn new(adapter: &'a dyn DeviceAdapter, ptr: u64, len: usize) -> Self {
        Self { adapter, ptr, len }
    }

    pub(crate) fn addr(&self) -> u64 {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_device(&self) -> bool {
        self.adapter.is_device_ptr(self.ptr)
    }

    pub(crate) fn load(&self) -> Result<Vec<u8>> {
        unsafe { self.adapter.stage_for_send(self.ptr, self.len) }
    }

    pub(crate) fn load_range(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        unsafe { self.adapter.stage_for_send(self.ptr + offset as u64, len) }
    }

    /// Overwrite the whole buffer; `data` must be exactly `len` bytes.
    pub(crate) fn store(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.len {
            return Err(StrataError::BufferSizeMismatch {
                expected: self.len,
                actual: data.len(),
            });
        }
        unsafe { self.adapter.receive_to_device(data, self.ptr) }
    }

    pub(crate) fn store_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        unsafe { self.adapter.receive_to_device(data, self.ptr + offset as u64) }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.len {
            return Err(StrataError::BufferSizeMismatch {
                expected: self.len,
                actual: offset + len,
            });
        }
        Ok(())
    }
}
