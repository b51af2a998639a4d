//! Frame-pipelined descriptor heap management.
//!
//! The manager owns one active [`DescriptorHeapPage`]. Each frame starts with
//! [`DescriptorHeapManager::begin_new_frame()`], which returns a [`FrameContext`] token. Regions are handed out
//! through that token, so cursor state is explicit and the borrow checker keeps one cursor set per frame.
//!
//! When the page grows, the old one is retired and kept alive for `frame_count` more frames, the number of frames
//! that may still reference it on the GPU.

use anyhow::{bail, Result};
use ash::vk;

use crate::descriptor::global_set::{DescriptorTable, GlobalBinding, GlobalDescriptorSet};
use crate::descriptor::handle::{CpuDescriptorHandle, DescriptorHandles, DescriptorHeapType};
use crate::descriptor::heap_page::DescriptorHeapPage;
use crate::descriptor::layout::{DescriptorHeapLayout, LocalSlotLayout};
use crate::util::deferred_delete::DeletionQueue;
use crate::{Device, Error};

/// Per-frame cursor state. Only the most recent token returned by
/// [`DescriptorHeapManager::begin_new_frame()`] is accepted.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameContext {
    frame_index: u64,
    slot: u32,
    page_generation: u64,
    global_cursor: u32,
    local_cursor: u32,
}

impl FrameContext {
    /// Number of frames begun so far, this one included
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Round-robin frame slot, in `0..frame_count`
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Global regions taken this frame
    pub fn global_regions_used(&self) -> u32 {
        self.global_cursor
    }

    /// Local regions taken this frame
    pub fn local_regions_used(&self) -> u32 {
        self.local_cursor
    }
}

/// Owns the active descriptor heap page and retires replaced pages after all frames using them completed.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DescriptorHeapManager<D: Device> {
    #[derivative(Debug = "ignore")]
    device: D,
    page: DescriptorHeapPage<D>,
    retired: DeletionQueue<DescriptorHeapPage<D>>,
    frame_index: u64,
    next_generation: u64,
}

impl<D: Device> DescriptorHeapManager<D> {
    /// Create a manager with a page sized for `layout`.
    /// # Errors
    /// * Fails with [`Error::Uncategorized`] if `layout.frame_count` is zero.
    /// * Fails with [`Error::AllocationFailure`] if the heaps cannot be created.
    pub fn new(device: D, layout: DescriptorHeapLayout) -> Result<Self> {
        if layout.frame_count == 0 {
            bail!(Error::Uncategorized("descriptor heap layout needs at least one frame"));
        }
        let page = DescriptorHeapPage::new(&device, layout, 0)?;
        debug!(
            "Created descriptor heap manager: {} frames, {} materials, {} views, {} samplers",
            layout.frame_count,
            layout.material_count,
            layout.view_capacity(),
            layout.sampler_capacity()
        );
        Ok(Self {
            device,
            page,
            retired: DeletionQueue::new(layout.frame_count),
            frame_index: 0,
            next_generation: 1,
        })
    }

    /// Create a manager with the default local slot layout and one global binding per frame.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        device: D,
        frame_count: u32,
        acceleration_structure_count: u32,
        global_cbv: u32,
        global_srv: u32,
        global_uav: u32,
        global_sampler: u32,
        material_count: u32,
    ) -> Result<Self> {
        let layout = DescriptorHeapLayout::new()
            .frame_count(frame_count)
            .acceleration_structures(acceleration_structure_count)
            .global(global_cbv, global_srv, global_uav, global_sampler)
            .material_count(material_count)
            .local(LocalSlotLayout::default());
        Self::new(device, layout)
    }

    /// Advance to the next frame slot. Retired pages count down and are destroyed once `frame_count` frames passed
    /// since their retirement.
    pub fn begin_new_frame(&mut self) -> FrameContext {
        self.frame_index += 1;
        let before = self.retired.len();
        self.retired.next_frame();
        let destroyed = before - self.retired.len();
        if destroyed > 0 {
            debug!("Destroyed {destroyed} retired descriptor heap page(s) at frame {}", self.frame_index);
        }
        FrameContext {
            frame_index: self.frame_index,
            slot: ((self.frame_index - 1) % u64::from(self.page.layout().frame_count)) as u32,
            page_generation: self.page.generation(),
            global_cursor: 0,
            local_cursor: 0,
        }
    }

    fn check_frame(&self, frame: &FrameContext) -> Result<()> {
        if frame.frame_index != self.frame_index || frame.page_generation != self.page.generation() {
            bail!(Error::StaleFrameContext);
        }
        Ok(())
    }

    /// Take the next global region of this frame's slot.
    /// # Errors
    /// * Fails with [`Error::StaleFrameContext`] if `frame` is not the current token.
    /// * Fails with [`Error::DescriptorRegionExhausted`] after `binds_per_frame` regions.
    pub fn increment_global_handle_start(&self, frame: &mut FrameContext) -> Result<DescriptorHandles> {
        self.check_frame(frame)?;
        let layout = self.page.layout();
        if frame.global_cursor >= layout.binds_per_frame {
            bail!(Error::DescriptorRegionExhausted {
                kind: "global",
                requested: frame.global_cursor,
                capacity: layout.binds_per_frame,
            });
        }
        let handles = self.page.global_region(frame.slot * layout.binds_per_frame + frame.global_cursor)?;
        frame.global_cursor += 1;
        Ok(handles)
    }

    /// Take the next local region. Local regions are indexed by material and do not depend on the frame slot, so
    /// the n-th call of every frame returns the region of material n.
    /// # Errors
    /// * Fails with [`Error::StaleFrameContext`] if `frame` is not the current token.
    /// * Fails with [`Error::DescriptorRegionExhausted`] after `material_count` regions.
    pub fn increment_local_handle_start(&self, frame: &mut FrameContext) -> Result<DescriptorHandles> {
        self.check_frame(frame)?;
        let handles = self.page.local_region(frame.local_cursor)?;
        frame.local_cursor += 1;
        Ok(handles)
    }

    /// Make room for `material_count` materials. If the current page is too small, a new page is allocated and the
    /// old one retired. Returns whether the page was replaced, in which case all descriptors must be written again
    /// and the cursors of `frame` start over.
    /// # Errors
    /// * Fails with [`Error::StaleFrameContext`] if `frame` is not the current token.
    /// * Fails with [`Error::AllocationFailure`] if the new heaps cannot be created.
    pub fn resize_material_count(&mut self, frame: &mut FrameContext, material_count: u32) -> Result<bool> {
        self.check_frame(frame)?;
        let layout = *self.page.layout();
        if material_count <= layout.material_count {
            return Ok(false);
        }
        let page = DescriptorHeapPage::new(&self.device, layout.material_count(material_count), self.next_generation)?;
        self.next_generation += 1;
        let old = std::mem::replace(&mut self.page, page);
        debug!(
            "Retiring descriptor heap page {} ({} materials), replaced by page {} ({} materials)",
            old.generation(),
            layout.material_count,
            self.page.generation(),
            material_count
        );
        self.retired.push(old);

        frame.page_generation = self.page.generation();
        frame.global_cursor = 0;
        frame.local_cursor = 0;
        Ok(true)
    }

    /// Take the next global region and fill it: acceleration structure views first, then the source descriptors of
    /// `set`. Returns the tables and root parameters for
    /// [`CommandStream::set_ray_tracing_global_root()`](crate::CommandStream::set_ray_tracing_global_root).
    /// # Errors
    /// * Fails with [`Error::RootSignatureMismatch`] if `set` or `acceleration_structures` hold more descriptors than
    ///   the layout reserves.
    /// * Fails like [`DescriptorHeapManager::increment_global_handle_start()`].
    pub fn bind_global(
        &self,
        frame: &mut FrameContext,
        set: &GlobalDescriptorSet,
        acceleration_structures: &[vk::DeviceAddress],
    ) -> Result<GlobalBinding> {
        let layout = *self.page.layout();
        if acceleration_structures.len() > layout.acceleration_structure_count as usize {
            bail!(Error::RootSignatureMismatch("more acceleration structures than the layout reserves"));
        }
        if set.cbv.len() > layout.global_cbv as usize
            || set.srv.len() > layout.global_srv as usize
            || set.uav.len() > layout.global_uav as usize
            || set.sampler.len() > layout.global_sampler as usize
        {
            bail!(Error::RootSignatureMismatch("more global descriptors than the layout reserves"));
        }

        let start = self.increment_global_handle_start(frame)?;
        let view_increment = self.view_descriptor_size();

        for (i, address) in acceleration_structures.iter().enumerate() {
            self.device
                .write_acceleration_structure_view(start.view_cpu.offset(i as u32, view_increment), *address)?;
        }

        let mut binding = GlobalBinding {
            acceleration_structures: acceleration_structures.to_vec(),
            ..Default::default()
        };
        let mut view = layout.acceleration_structure_count;
        let tables = [
            (layout.global_cbv, &set.cbv, &mut binding.cbv),
            (layout.global_srv, &set.srv, &mut binding.srv),
            (layout.global_uav, &set.uav, &mut binding.uav),
        ];
        for (count, sources, table) in tables {
            self.copy_table(DescriptorHeapType::View, start.view_cpu.offset(view, view_increment), sources)?;
            if count > 0 {
                *table = Some(DescriptorTable {
                    start: start.view_gpu.offset(view, view_increment),
                    count,
                });
            }
            view += count;
        }

        self.copy_table(DescriptorHeapType::Sampler, start.sampler_cpu, &set.sampler)?;
        if layout.global_sampler > 0 {
            binding.sampler = Some(DescriptorTable {
                start: start.sampler_gpu,
                count: layout.global_sampler,
            });
        }
        Ok(binding)
    }

    fn copy_table(&self, ty: DescriptorHeapType, dst: CpuDescriptorHandle, sources: &[CpuDescriptorHandle]) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }
        self.device.copy_descriptors(ty, dst, sources)
    }

    /// The active page
    pub fn page(&self) -> &DescriptorHeapPage<D> {
        &self.page
    }

    /// Layout of the active page
    pub fn layout(&self) -> &DescriptorHeapLayout {
        self.page.layout()
    }

    /// Byte distance between two view descriptors, for addressing slots inside a region
    pub fn view_descriptor_size(&self) -> u32 {
        self.page.view_increment()
    }

    /// Byte distance between two sampler descriptors
    pub fn sampler_descriptor_size(&self) -> u32 {
        self.page.sampler_increment()
    }

    /// Number of retired pages still waiting for in-flight frames
    pub fn retired_page_count(&self) -> usize {
        self.retired.len()
    }

    /// Number of frames begun so far
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }
}
