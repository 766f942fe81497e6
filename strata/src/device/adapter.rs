use crate::error::Result;

/// Bridges the caller's buffers with the engine's byte-level data movement.
///
/// The engine operates on raw `u64` pointers + byte counts. The adapter
/// stages data between the caller's memory and host buffers for
/// point-to-point transfers, and tells the engine whether a pointer lives in
/// device memory.
///
/// - `CpuAdapter` reads and writes host memory in place.
/// - Accelerator adapters, provided outside this crate, copy across the bus.
///
/// Device buffers are never touched through shared memory or single-copy
/// mappings; the engine routes them through staged point-to-point paths.
pub trait DeviceAdapter: Send + Sync {
    /// Copy from the caller's memory to a host buffer.
    ///
    /// # Safety
    /// `ptr` must address `size_bytes` readable bytes.
    unsafe fn stage_for_send(&self, ptr: u64, size_bytes: usize) -> Result<Vec<u8>>;

    /// Copy host bytes into the caller's memory.
    ///
    /// # Safety
    /// `dst_ptr` must address `data.len()` writable bytes.
    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()>;

    /// Whether `ptr` addresses device memory.
    fn is_device_ptr(&self, ptr: u64) -> bool;
}
