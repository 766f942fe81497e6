use crate::device::DeviceAdapter;
use crate::error::Result;

/// Host-memory adapter: every pointer is a plain CPU address.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuAdapter;

impl CpuAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceAdapter for CpuAdapter {
    unsafe fn stage_for_send(&self, ptr: u64, size_bytes: usize) -> Result<Vec<u8>> {
        if size_bytes == 0 {
            return Ok(Vec::new());
        }
        let src = unsafe { std::slice::from_raw_parts(ptr as *const u8, size_bytes) };
        Ok(src.to_vec())
    }

    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst_ptr as *mut u8, data.len());
        }
        Ok(())
    }

    fn is_device_ptr(&self, _ptr: u64) -> bool {
        false
    }
}
