//! Global descriptors bound once per dispatch: acceleration structures, constants, outputs and samplers.

use ash::vk;

use crate::descriptor::handle::{CpuDescriptorHandle, GpuDescriptorHandle};

/// Source descriptors for one global region, indexed by register. Sources are descriptors the backend created in
/// CPU-only storage, they are copied into the shader-visible heap by
/// [`DescriptorHeapManager::bind_global()`](crate::DescriptorHeapManager::bind_global).
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct GlobalDescriptorSet {
    /// Constant buffer views for `b0..`
    pub cbv: Vec<CpuDescriptorHandle>,
    /// Shader resource views following the acceleration structures
    pub srv: Vec<CpuDescriptorHandle>,
    /// Unordered access views for `u0..`
    pub uav: Vec<CpuDescriptorHandle>,
    /// Samplers for `s0..`
    pub sampler: Vec<CpuDescriptorHandle>,
}

impl GlobalDescriptorSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a constant buffer view.
    pub fn cbv(mut self, handle: CpuDescriptorHandle) -> Self {
        self.cbv.push(handle);
        self
    }

    /// Append a shader resource view.
    pub fn srv(mut self, handle: CpuDescriptorHandle) -> Self {
        self.srv.push(handle);
        self
    }

    /// Append an unordered access view.
    pub fn uav(mut self, handle: CpuDescriptorHandle) -> Self {
        self.uav.push(handle);
        self
    }

    /// Append a sampler.
    pub fn sampler(mut self, handle: CpuDescriptorHandle) -> Self {
        self.sampler.push(handle);
        self
    }
}

/// A descriptor table inside a shader-visible heap.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorTable {
    /// First descriptor of the table
    pub start: GpuDescriptorHandle,
    /// Number of descriptors in the table
    pub count: u32,
}

/// Everything a dispatch needs to bind the global root signature. Tables are `None` if the layout reserves no
/// descriptors of that kind.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct GlobalBinding {
    /// Addresses passed as root acceleration structure parameters, in register order
    pub acceleration_structures: Vec<vk::DeviceAddress>,
    /// Constant buffer table
    pub cbv: Option<DescriptorTable>,
    /// Shader resource table
    pub srv: Option<DescriptorTable>,
    /// Unordered access table
    pub uav: Option<DescriptorTable>,
    /// Sampler table
    pub sampler: Option<DescriptorTable>,
}
