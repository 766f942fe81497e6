mod adapter;
mod buffer;
mod cpu;

pub use adapter::DeviceAdapter;
pub(crate) use buffer::DeviceBuf;
pub use cpu::CpuAdapter;
