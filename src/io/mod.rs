// ============================================================================
// I/O Subsystem Module
// ============================================================================
pub mod dma;
pub mod log;
pub mod pci;
pub mod usb;

pub use dma::{DmaAllocator, DmaBuffer, KernelHeapDma};
