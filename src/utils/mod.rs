//! Utility modules for device management and memory.

mod device;
mod memory;

pub use device::{get_device, is_cpu, is_cuda, parse_dtype, DType, Device};
pub use memory::{clean_memory, format_bytes};
