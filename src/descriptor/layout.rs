//! How many descriptors a heap page reserves and how they are split into regions.
//!
//! A page holds two heaps. The view heap starts with one block of global views per frame slot and global binding,
//! followed by one block of local views per material:
//!
//! ```text
//! | frame 0 global | frame 1 global | ... | material 0 local | material 1 local | ... |
//! ```
//!
//! The sampler heap is laid out the same way. Global blocks are indexed by frame slot, so a frame never writes
//! descriptors that an earlier, possibly still executing frame reads.

use crate::descriptor::handle::{DescriptorHandles, GpuDescriptorHandle};

/// Per-material descriptor slots. The defaults are one constant buffer, three shader resources (index buffer,
/// vertex buffer, texture), one unordered access view and one sampler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LocalSlotLayout {
    /// Constant buffer views per material
    pub cbv: u32,
    /// Shader resource views per material
    pub srv: u32,
    /// Unordered access views per material
    pub uav: u32,
    /// Samplers per material
    pub sampler: u32,
}

impl Default for LocalSlotLayout {
    fn default() -> Self {
        Self {
            cbv: 1,
            srv: 3,
            uav: 1,
            sampler: 1,
        }
    }
}

impl LocalSlotLayout {
    /// View descriptors per material
    pub fn view_count(&self) -> u32 {
        self.cbv + self.srv + self.uav
    }

    /// Sampler descriptors per material
    pub fn sampler_count(&self) -> u32 {
        self.sampler
    }

    /// GPU handles of the four local tables inside `region`, in shader record order: constant buffers, shader
    /// resources, unordered access views and samplers.
    pub fn table_handles(&self, region: &DescriptorHandles, view_increment: u32) -> [GpuDescriptorHandle; 4] {
        [
            region.view_gpu,
            region.view_gpu.offset(self.cbv, view_increment),
            region.view_gpu.offset(self.cbv + self.srv, view_increment),
            region.sampler_gpu,
        ]
    }
}

/// Capacity of a descriptor heap page. Build one with [`DescriptorHeapLayout::new()`] and the chainable setters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorHeapLayout {
    /// Frames that may be in flight at once, each gets its own global region
    pub frame_count: u32,
    /// Global regions each frame may take
    pub binds_per_frame: u32,
    /// Acceleration structure views per global region
    pub acceleration_structure_count: u32,
    /// Constant buffer views per global region
    pub global_cbv: u32,
    /// Shader resource views per global region
    pub global_srv: u32,
    /// Unordered access views per global region
    pub global_uav: u32,
    /// Samplers per global region
    pub global_sampler: u32,
    /// Number of local regions
    pub material_count: u32,
    /// Layout of one local region
    pub local: LocalSlotLayout,
}

impl Default for DescriptorHeapLayout {
    fn default() -> Self {
        Self {
            frame_count: 2,
            binds_per_frame: 1,
            acceleration_structure_count: 1,
            global_cbv: 0,
            global_srv: 0,
            global_uav: 0,
            global_sampler: 0,
            material_count: 0,
            local: LocalSlotLayout::default(),
        }
    }
}

impl DescriptorHeapLayout {
    /// Default layout: two frames, one acceleration structure, no other descriptors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of frames in flight.
    pub fn frame_count(mut self, frame_count: u32) -> Self {
        self.frame_count = frame_count;
        self
    }

    /// Set how many global regions one frame may take.
    pub fn binds_per_frame(mut self, binds: u32) -> Self {
        self.binds_per_frame = binds;
        self
    }

    /// Set the number of acceleration structure views per global region.
    pub fn acceleration_structures(mut self, count: u32) -> Self {
        self.acceleration_structure_count = count;
        self
    }

    /// Set the global descriptor counts.
    pub fn global(mut self, cbv: u32, srv: u32, uav: u32, sampler: u32) -> Self {
        self.global_cbv = cbv;
        self.global_srv = srv;
        self.global_uav = uav;
        self.global_sampler = sampler;
        self
    }

    /// Set the number of local regions.
    pub fn material_count(mut self, count: u32) -> Self {
        self.material_count = count;
        self
    }

    /// Set the layout of a local region.
    pub fn local(mut self, local: LocalSlotLayout) -> Self {
        self.local = local;
        self
    }

    /// View descriptors in one global region. Acceleration structure views come first, then constant buffers,
    /// shader resources and unordered access views.
    pub fn global_view_count(&self) -> u32 {
        self.acceleration_structure_count + self.global_cbv + self.global_srv + self.global_uav
    }

    /// Sampler descriptors in one global region.
    pub fn global_sampler_count(&self) -> u32 {
        self.global_sampler
    }

    /// Number of global regions in the page.
    pub fn global_region_count(&self) -> u32 {
        self.frame_count * self.binds_per_frame
    }

    /// Capacity of the view heap.
    pub fn view_capacity(&self) -> u32 {
        self.global_region_count() * self.global_view_count() + self.material_count * self.local.view_count()
    }

    /// Capacity of the sampler heap.
    pub fn sampler_capacity(&self) -> u32 {
        self.global_region_count() * self.global_sampler_count() + self.material_count * self.local.sampler_count()
    }

    /// First view descriptor of the local regions.
    pub fn local_view_base(&self) -> u32 {
        self.global_region_count() * self.global_view_count()
    }

    /// First sampler descriptor of the local regions.
    pub fn local_sampler_base(&self) -> u32 {
        self.global_region_count() * self.global_sampler_count()
    }
}
