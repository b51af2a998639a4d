//! Shared part of bottom and top level acceleration structures: the result buffer and the scratch buffer.

use anyhow::{bail, Result};
use ash::vk;

use crate::resource::buffer::BufferCreateInfo;
use crate::resource::raytracing::build_info::BuildSnapshot;
use crate::util::align::align;
use crate::{AccelerationStructureBuildSize, AccelerationStructureType, BuildCommand, BuildInput, CommandStream, Device, Error, GpuBuffer};

/// Acceleration structure storage must start at a multiple of this.
pub const ACCELERATION_STRUCTURE_ALIGNMENT: vk::DeviceSize = 256;

#[derive(Debug)]
enum ScratchBuffer<B> {
    Owned(B),
    Shared(B),
}

impl<B> ScratchBuffer<B> {
    fn buffer(&self) -> &B {
        match self {
            ScratchBuffer::Owned(buffer) | ScratchBuffer::Shared(buffer) => buffer,
        }
    }
}

/// Owns the result buffer of an acceleration structure and, unless one is shared in, its scratch buffer.
///
/// Buffers that are replaced or destroyed go through the device's deferred deletion, so a build that was recorded
/// but not executed yet never loses its memory.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct AccelerationStructure<D: Device> {
    #[derivative(Debug = "ignore")]
    device: D,
    ty: AccelerationStructureType,
    buffer: Option<D::Buffer>,
    scratch: Option<ScratchBuffer<D::Buffer>>,
    last_build: Option<BuildSnapshot>,
}

impl<D: Device> AccelerationStructure<D> {
    /// Create an empty structure. Call [`AccelerationStructure::create_buffer()`] before building.
    pub fn new(device: D, ty: AccelerationStructureType) -> Self {
        Self {
            device,
            ty,
            buffer: None,
            scratch: None,
            last_build: None,
        }
    }

    /// Required alignment of acceleration structure storage.
    pub fn alignment() -> vk::DeviceSize {
        ACCELERATION_STRUCTURE_ALIGNMENT
    }

    /// Allocate the result buffer and, if `scratch_size` is not zero and no scratch buffer is shared in, a private
    /// scratch buffer. Existing buffers are retired through deferred deletion.
    /// # Errors
    /// * Fails with [`Error::AllocationFailure`] if the device runs out of memory.
    pub fn create_buffer(&mut self, size: vk::DeviceSize, scratch_size: vk::DeviceSize) -> Result<()> {
        let name = match self.ty {
            AccelerationStructureType::TopLevel => "top level structure",
            AccelerationStructureType::BottomLevel => "bottom level structure",
        };
        let buffer = self
            .device
            .create_buffer(&BufferCreateInfo::acceleration_structure(name, align(size, Self::alignment())))?;

        let scratch = match &self.scratch {
            Some(ScratchBuffer::Shared(_)) => None,
            _ if scratch_size == 0 => None,
            _ => {
                let scratch_size = align(scratch_size, self.device.properties().scratch_alignment);
                Some(self.device.create_buffer(&BufferCreateInfo::scratch("acceleration structure scratch", scratch_size))?)
            }
        };

        #[cfg(feature = "log-objects")]
        trace!("Created {:?} acceleration structure storage at {:#x} ({} bytes)", self.ty, buffer.address(), buffer.size());

        if let Some(old) = self.buffer.replace(buffer) {
            self.device.deferred_delete().push(old);
        }
        if let Some(scratch) = scratch {
            self.retire_scratch();
            self.scratch = Some(ScratchBuffer::Owned(scratch));
        }
        self.last_build = None;
        Ok(())
    }

    /// Allocate buffers for the sizes reported by a prebuild query. The scratch buffer is large enough for both
    /// builds and updates.
    pub fn create_buffer_for(&mut self, sizes: &AccelerationStructureBuildSize) -> Result<()> {
        self.create_buffer(sizes.size, sizes.max_scratch_size())
    }

    /// Use an externally owned scratch buffer. It may be shared sequentially by builds on one stream, but never by
    /// two builds executing at the same time.
    pub fn set_scratch_buffer(&mut self, buffer: D::Buffer) {
        self.retire_scratch();
        self.scratch = Some(ScratchBuffer::Shared(buffer));
    }

    /// Release the scratch buffer once no further rebuild is imminent. A shared scratch buffer is only detached.
    pub fn destroy_scratch_buffer(&mut self) {
        self.retire_scratch();
    }

    /// Release all buffers. Calling this more than once is harmless.
    pub fn destroy(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            #[cfg(feature = "log-objects")]
            trace!("Destroying {:?} acceleration structure storage at {:#x}", self.ty, buffer.address());
            self.device.deferred_delete().push(buffer);
        }
        self.retire_scratch();
        self.last_build = None;
    }

    fn retire_scratch(&mut self) {
        if let Some(ScratchBuffer::Owned(scratch)) = self.scratch.take() {
            self.device.deferred_delete().push(scratch);
        }
    }

    /// Structure level
    pub fn ty(&self) -> AccelerationStructureType {
        self.ty
    }

    /// The device this structure allocates from
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The result buffer, if created
    pub fn buffer(&self) -> Option<&D::Buffer> {
        self.buffer.as_ref()
    }

    /// The scratch buffer in use, owned or shared
    pub fn scratch_buffer(&self) -> Option<&D::Buffer> {
        self.scratch.as_ref().map(ScratchBuffer::buffer)
    }

    /// Whether the scratch buffer was shared in with [`AccelerationStructure::set_scratch_buffer()`]
    pub fn is_scratch_shared(&self) -> bool {
        matches!(self.scratch, Some(ScratchBuffer::Shared(_)))
    }

    /// Device address of the structure, the value referenced by instances and dispatches
    pub fn address(&self) -> Option<vk::DeviceAddress> {
        self.buffer.as_ref().map(|buffer| buffer.address())
    }

    /// Size of the result buffer in bytes, zero if not created
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.as_ref().map(|buffer| buffer.size()).unwrap_or_default()
    }

    /// Whether a build has been recorded since the buffers were created
    pub fn is_built(&self) -> bool {
        self.last_build.is_some()
    }

    pub(crate) fn replace_buffer(&mut self, buffer: D::Buffer) -> Option<D::Buffer> {
        self.buffer.replace(buffer)
    }

    fn check_sizes(&self, input: &BuildInput<D::Buffer>, buffer: &D::Buffer, scratch: &D::Buffer) -> Result<()> {
        // Updates happen in place, the result size was checked by the original build.
        if !input.is_update() && buffer.size() < input.sizes().size {
            debug_assert!(false, "result buffer ({} bytes) is smaller than the prebuild size ({} bytes)", buffer.size(), input.sizes().size);
            bail!(Error::SizeMismatch {
                what: "result memory",
                required: input.sizes().size,
                available: buffer.size(),
            });
        }
        if scratch.size() < input.required_scratch_size() {
            debug_assert!(false, "scratch buffer ({} bytes) is smaller than required ({} bytes)", scratch.size(), input.required_scratch_size());
            bail!(Error::SizeMismatch {
                what: "scratch memory",
                required: input.required_scratch_size(),
                available: scratch.size(),
            });
        }
        Ok(())
    }

    /// Validate and record a build into `stream`. Returns the result buffer so callers can add barriers.
    pub(crate) fn record_build(
        &mut self,
        stream: &mut D::CommandStream,
        input: &BuildInput<D::Buffer>,
        instances: Option<&D::Buffer>,
        postbuild_info: Option<&D::Buffer>,
    ) -> Result<D::Buffer> {
        if input.ty() != self.ty {
            bail!(Error::InvalidBuildInput("build input level does not match the structure level"));
        }
        let buffer = self.buffer.clone().ok_or(Error::MissingBuffer("result"))?;
        let scratch = self.scratch_buffer().cloned().ok_or(Error::MissingBuffer("scratch"))?;
        self.check_sizes(input, &buffer, &scratch)?;
        if input.is_update() {
            match &self.last_build {
                None => bail!(Error::InvalidUpdate("structure was never built")),
                Some(snapshot) => snapshot.check_update(input)?,
            }
        }

        stream.build_acceleration_structure(&BuildCommand {
            input,
            dst: &buffer,
            src: input.is_update().then_some(&buffer),
            scratch: &scratch,
            instances,
            postbuild_info,
        })?;

        if !input.is_update() {
            self.last_build = Some(BuildSnapshot::new(input));
        }
        debug!(
            "Recorded {:?} {} ({} bytes, {} bytes scratch)",
            self.ty,
            if input.is_update() { "update" } else { "build" },
            buffer.size(),
            scratch.size()
        );
        Ok(buffer)
    }
}
