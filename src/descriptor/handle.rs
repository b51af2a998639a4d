//! Descriptor handles and the cursor quad handed out by the heap manager.

use ash::vk;

/// Kind of descriptors a heap stores.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// Constant buffer, shader resource, unordered access and acceleration structure views.
    View,
    /// Samplers.
    Sampler,
}

/// Handle used to write a descriptor from the CPU. A plain byte offset into the backend's descriptor storage.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuDescriptorHandle(pub u64);

/// Handle used by shaders to reference a descriptor. Shader records store this value, so it is exactly 8 bytes.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct GpuDescriptorHandle(pub vk::DeviceAddress);

const_assert_eq!(std::mem::size_of::<GpuDescriptorHandle>(), 8);

impl CpuDescriptorHandle {
    /// Handle `count` descriptors of `increment` bytes further.
    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(count) * u64::from(increment))
    }
}

impl GpuDescriptorHandle {
    /// Handle `count` descriptors of `increment` bytes further.
    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(count) * u64::from(increment))
    }

    /// Raw value as stored in shader records.
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

/// Start of a descriptor region in both heaps of a page: `{view cpu, view gpu, sampler cpu, sampler gpu}`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorHandles {
    /// First view descriptor, CPU side
    pub view_cpu: CpuDescriptorHandle,
    /// First view descriptor, GPU side
    pub view_gpu: GpuDescriptorHandle,
    /// First sampler descriptor, CPU side
    pub sampler_cpu: CpuDescriptorHandle,
    /// First sampler descriptor, GPU side
    pub sampler_gpu: GpuDescriptorHandle,
}

impl DescriptorHandles {
    /// Handles `views` view descriptors and `samplers` sampler descriptors further.
    pub fn advance(self, views: u32, view_increment: u32, samplers: u32, sampler_increment: u32) -> Self {
        Self {
            view_cpu: self.view_cpu.offset(views, view_increment),
            view_gpu: self.view_gpu.offset(views, view_increment),
            sampler_cpu: self.sampler_cpu.offset(samplers, sampler_increment),
            sampler_gpu: self.sampler_gpu.offset(samplers, sampler_increment),
        }
    }
}
