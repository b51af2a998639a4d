//! Exposes different memory types that determine where buffer memory should live.

use gpu_allocator::MemoryLocation;

/// The memory type of a buffer indicates where it should live.
/// Backends that allocate through `gpu_allocator` convert it with [`MemoryLocation::from`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemoryType {
    /// Store the allocation in GPU only accessible memory. Acceleration structures, scratch memory
    /// and post-build info live here.
    GpuOnly,
    /// Memory useful for uploading data to the GPU: instance buffers and shader tables.
    CpuToGpu,
    /// Memory useful for CPU readback of data, like compacted sizes.
    GpuToCpu,
}

impl MemoryType {
    /// Whether buffers of this type can be mapped by the CPU.
    pub fn is_mappable(self) -> bool {
        !matches!(MemoryLocation::from(self), MemoryLocation::GpuOnly | MemoryLocation::Unknown)
    }
}

impl From<MemoryType> for MemoryLocation {
    fn from(value: MemoryType) -> Self {
        match value {
            MemoryType::GpuOnly => MemoryLocation::GpuOnly,
            MemoryType::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryType::GpuToCpu => MemoryLocation::GpuToCpu,
        }
    }
}
