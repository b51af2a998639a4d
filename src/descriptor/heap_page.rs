//! One fixed-capacity pair of shader-visible descriptor heaps.

use anyhow::{bail, Result};

use crate::descriptor::handle::{DescriptorHandles, DescriptorHeapType};
use crate::descriptor::layout::DescriptorHeapLayout;
use crate::{DescriptorHeap, Device, Error};

/// A view heap and a sampler heap sized for a [`DescriptorHeapLayout`]. Regions are addressed by index, the page
/// itself keeps no cursors. Those live in the [`FrameContext`](crate::FrameContext) of the manager.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DescriptorHeapPage<D: Device> {
    view_heap: D::DescriptorHeap,
    sampler_heap: D::DescriptorHeap,
    layout: DescriptorHeapLayout,
    generation: u64,
}

impl<D: Device> DescriptorHeapPage<D> {
    /// Allocate both heaps.
    /// # Errors
    /// * Fails with [`Error::AllocationFailure`] if the backend cannot create a heap.
    pub fn new(device: &D, layout: DescriptorHeapLayout, generation: u64) -> Result<Self> {
        let view_heap = device.create_descriptor_heap(DescriptorHeapType::View, layout.view_capacity())?;
        let sampler_heap = device.create_descriptor_heap(DescriptorHeapType::Sampler, layout.sampler_capacity())?;
        #[cfg(feature = "log-objects")]
        trace!(
            "Created descriptor heap page {generation} ({} views, {} samplers)",
            layout.view_capacity(),
            layout.sampler_capacity()
        );
        Ok(Self {
            view_heap,
            sampler_heap,
            layout,
            generation,
        })
    }

    /// Layout this page was sized for
    pub fn layout(&self) -> &DescriptorHeapLayout {
        &self.layout
    }

    /// Shader-visible view heap
    pub fn view_heap(&self) -> &D::DescriptorHeap {
        &self.view_heap
    }

    /// Shader-visible sampler heap
    pub fn sampler_heap(&self) -> &D::DescriptorHeap {
        &self.sampler_heap
    }

    /// Increases by one for every page a manager allocates
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Byte distance between two view descriptors
    pub fn view_increment(&self) -> u32 {
        self.view_heap.increment_size()
    }

    /// Byte distance between two sampler descriptors
    pub fn sampler_increment(&self) -> u32 {
        self.sampler_heap.increment_size()
    }

    fn handles_at(&self, view: u32, sampler: u32) -> DescriptorHandles {
        DescriptorHandles {
            view_cpu: self.view_heap.cpu_start(),
            view_gpu: self.view_heap.gpu_start(),
            sampler_cpu: self.sampler_heap.cpu_start(),
            sampler_gpu: self.sampler_heap.gpu_start(),
        }
        .advance(view, self.view_increment(), sampler, self.sampler_increment())
    }

    /// Start of global region `region`. Region `slot * binds_per_frame + n` is the `n`th binding of frame slot `slot`.
    /// # Errors
    /// * Fails with [`Error::DescriptorRegionExhausted`] if `region` is out of range.
    pub fn global_region(&self, region: u32) -> Result<DescriptorHandles> {
        let capacity = self.layout.global_region_count();
        if region >= capacity {
            bail!(Error::DescriptorRegionExhausted {
                kind: "global",
                requested: region,
                capacity,
            });
        }
        Ok(self.handles_at(
            region * self.layout.global_view_count(),
            region * self.layout.global_sampler_count(),
        ))
    }

    /// Start of the local region of `material`.
    /// # Errors
    /// * Fails with [`Error::DescriptorRegionExhausted`] if `material` is not below the reserved material count.
    pub fn local_region(&self, material: u32) -> Result<DescriptorHandles> {
        let capacity = self.layout.material_count;
        if material >= capacity {
            bail!(Error::DescriptorRegionExhausted {
                kind: "local",
                requested: material,
                capacity,
            });
        }
        Ok(self.handles_at(
            self.layout.local_view_base() + material * self.layout.local.view_count(),
            self.layout.local_sampler_base() + material * self.layout.local.sampler_count(),
        ))
    }
}

#[cfg(feature = "log-objects")]
impl<D: Device> Drop for DescriptorHeapPage<D> {
    fn drop(&mut self) {
        trace!("Destroying descriptor heap page {}", self.generation);
    }
}
