//! Bottom level acceleration structures: built from triangle or AABB geometry, optionally compacted afterwards.

use std::ops::{Deref, DerefMut};

use anyhow::{bail, Result};
use ash::vk;

use crate::resource::buffer::{read_u64, BufferCreateInfo};
use crate::resource::raytracing::compaction::CompactionStage;
use crate::util::align::align;
use crate::{
    AccelerationStructure, AccelerationStructureType, BuildInput, CommandStream, CompactionState, Device, Error, GpuBuffer,
    MemoryType, ResourceState,
};

/// A bottom level acceleration structure.
///
/// Derefs to [`AccelerationStructure`] for buffer management.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BottomLevelStructure<D: Device> {
    base: AccelerationStructure<D>,
    compaction: CompactionStage<D::Buffer>,
}

impl<D: Device> BottomLevelStructure<D> {
    /// Create an empty bottom level structure.
    pub fn new(device: D) -> Self {
        Self {
            base: AccelerationStructure::new(device, AccelerationStructureType::BottomLevel),
            compaction: CompactionStage::NotRequested,
        }
    }

    /// Record a build or update of this structure.
    ///
    /// Geometry buffer addresses are resolved now, not when `input` was created. If the input allows compaction,
    /// the compacted size is copied into a readback buffer and a UAV barrier is always recorded. Otherwise the
    /// barrier is only recorded if `barrier` is set.
    /// # Errors
    /// * Fails with [`Error::MissingBuffer`] if [`AccelerationStructure::create_buffer()`] was not called.
    /// * Fails with [`Error::InvalidUpdate`] if `input` is an update the previous build does not allow.
    /// * Fails with [`Error::SizeMismatch`] (and asserts in debug builds) if the buffers are too small for `input`.
    pub fn build(&mut self, stream: &mut D::CommandStream, input: &BuildInput<D::Buffer>, barrier: bool) -> Result<()> {
        let compact = input.allows_compaction() && !input.is_update();
        let query = if compact {
            let device = self.base.device();
            let info = device.create_buffer(
                &BufferCreateInfo::new(
                    "compacted size",
                    8,
                    vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
                    MemoryType::GpuOnly,
                )
                .initial_state(ResourceState::UnorderedAccess),
            )?;
            let readback = device.create_buffer(
                &BufferCreateInfo::new("compacted size readback", 8, vk::BufferUsageFlags::TRANSFER_DST, MemoryType::GpuToCpu)
                    .initial_state(ResourceState::CopyDest),
            )?;
            Some((info, readback))
        } else {
            None
        };

        let buffer = self
            .base
            .record_build(stream, input, None, query.as_ref().map(|(info, _)| info))?;

        match query {
            Some((info, readback)) => {
                stream.uav_barrier(&buffer)?;
                stream.transition_barrier(&info, ResourceState::UnorderedAccess, ResourceState::CopySource)?;
                stream.copy_buffer(&readback, &info, 8)?;
                let device = self.base.device();
                device.deferred_delete().push(info);
                if let CompactionStage::Pending {
                    readback: old,
                } = std::mem::replace(
                    &mut self.compaction,
                    CompactionStage::Pending {
                        readback,
                    },
                ) {
                    device.deferred_delete().push(old);
                }
            }
            None => {
                if barrier {
                    stream.uav_barrier(&buffer)?;
                }
                if !input.is_update() {
                    self.retire_readback();
                    self.compaction = CompactionStage::NotRequested;
                }
            }
        }
        Ok(())
    }

    /// Where this structure is in the compaction protocol.
    pub fn compaction_state(&self) -> CompactionState {
        self.compaction.state()
    }

    /// Read back the compacted size. Returns `None` while the GPU has not executed the build yet.
    /// # Errors
    /// * Fails with [`Error::CompactionNotAllowed`] if the last build did not set `ALLOW_COMPACTION`.
    /// * Fails with [`Error::AlreadyCompacted`] after [`BottomLevelStructure::compact()`].
    pub fn query_compacted_size(&mut self) -> Result<Option<vk::DeviceSize>> {
        let compacted_size = match &self.compaction {
            CompactionStage::NotRequested => bail!(Error::CompactionNotAllowed),
            CompactionStage::Compacted { .. } => bail!(Error::AlreadyCompacted),
            CompactionStage::SizeQueried {
                compacted_size,
            } => return Ok(Some(*compacted_size)),
            CompactionStage::Pending {
                readback,
            } => read_u64(readback, 0)?,
        };
        // The readback buffer starts zeroed, a structure is never empty.
        if compacted_size == 0 {
            return Ok(None);
        }
        self.retire_readback();
        self.compaction = CompactionStage::SizeQueried {
            compacted_size,
        };
        Ok(Some(compacted_size))
    }

    /// Record the compacting copy into a right-sized buffer and swap it in. The old buffer is retired through
    /// deferred deletion.
    /// # Errors
    /// * Fails with [`Error::CompactedSizeUnavailable`] if the size has not been written back yet. The state is
    ///   left untouched, try again after the build executed.
    pub fn compact(&mut self, stream: &mut D::CommandStream, barrier: bool) -> Result<()> {
        let Some(compacted_size) = self.query_compacted_size()? else {
            bail!(Error::CompactedSizeUnavailable);
        };
        let src = self.base.buffer().cloned().ok_or(Error::MissingBuffer("result"))?;
        let device = self.base.device().clone();
        let dst = device.create_buffer(&BufferCreateInfo::acceleration_structure(
            "compacted bottom level structure",
            align(compacted_size, AccelerationStructure::<D>::alignment()),
        ))?;

        stream.copy_acceleration_structure(&dst, &src, vk::CopyAccelerationStructureModeKHR::COMPACT)?;
        if barrier {
            stream.uav_barrier(&dst)?;
        }

        let original_size = src.size();
        let compacted_size = dst.size();
        if let Some(old) = self.base.replace_buffer(dst) {
            device.deferred_delete().push(old);
        }
        self.compaction = CompactionStage::Compacted {
            original_size,
            compacted_size,
        };
        debug!("Compacted bottom level structure from {original_size} to {compacted_size} bytes");
        Ok(())
    }

    /// Release all buffers, including a pending readback. Calling this more than once is harmless.
    pub fn destroy(&mut self) {
        self.retire_readback();
        self.compaction = CompactionStage::NotRequested;
        self.base.destroy();
    }

    fn retire_readback(&mut self) {
        if let CompactionStage::Pending {
            readback,
        } = std::mem::replace(&mut self.compaction, CompactionStage::NotRequested)
        {
            self.base.device().deferred_delete().push(readback);
        }
    }
}

impl<D: Device> Deref for BottomLevelStructure<D> {
    type Target = AccelerationStructure<D>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<D: Device> DerefMut for BottomLevelStructure<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}
