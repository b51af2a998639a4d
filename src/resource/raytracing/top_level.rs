//! Top level acceleration structures over instances of bottom level structures.

use std::ops::{Deref, DerefMut};

use anyhow::{bail, Result};
use ash::vk;

use crate::resource::buffer::{write_bytes, BufferCreateInfo};
use crate::{
    AccelerationStructure, AccelerationStructureInstance, AccelerationStructureType, BuildInput, CommandStream, Device,
    Error, Instance, MemoryType, ResourceState,
};

/// A top level acceleration structure. Owns the instance buffer its builds read from.
///
/// Derefs to [`AccelerationStructure`] for buffer management.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TopLevelStructure<D: Device> {
    base: AccelerationStructure<D>,
    instance_buffer: Option<D::Buffer>,
    instance_count: u32,
}

impl<D: Device> TopLevelStructure<D> {
    /// Create an empty top level structure.
    pub fn new(device: D) -> Self {
        Self {
            base: AccelerationStructure::new(device, AccelerationStructureType::TopLevel),
            instance_buffer: None,
            instance_count: 0,
        }
    }

    /// Pack `instances` in order into a new upload buffer. An instance without an explicit hit group offset uses
    /// its index in the slice. A previous instance buffer is retired through deferred deletion.
    /// # Errors
    /// * Fails with [`Error::InvalidBuildInput`] if `instances` is empty.
    /// * Fails with [`Error::MissingBuffer`] if a referenced bottom level structure has no result buffer.
    pub fn create_instance_buffer(&mut self, instances: &[Instance<'_, D>]) -> Result<()> {
        if instances.is_empty() {
            bail!(Error::InvalidBuildInput("instance buffer needs at least one instance"));
        }
        let records = instances
            .iter()
            .enumerate()
            .map(|(index, instance)| instance.to_record(index as u32))
            .collect::<Result<Vec<_>>>()?;

        let record_size = std::mem::size_of::<AccelerationStructureInstance>();
        let buffer = self.base.device().create_buffer(
            &BufferCreateInfo::new(
                "instances",
                (records.len() * record_size) as vk::DeviceSize,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryType::CpuToGpu,
            )
            .stride(record_size as vk::DeviceSize)
            .initial_state(ResourceState::GenericRead),
        )?;
        let bytes = records.iter().flat_map(|record| record.as_bytes().iter().copied()).collect::<Vec<u8>>();
        write_bytes(&buffer, 0, &bytes)?;

        self.destroy_instance_buffer();
        self.instance_buffer = Some(buffer);
        self.instance_count = records.len() as u32;
        Ok(())
    }

    /// Retire the instance buffer through deferred deletion.
    pub fn destroy_instance_buffer(&mut self) {
        if let Some(buffer) = self.instance_buffer.take() {
            self.base.device().deferred_delete().push(buffer);
        }
        self.instance_count = 0;
    }

    /// Hand the instance buffer over to the caller, who becomes responsible for keeping it alive until the last
    /// build reading it has executed.
    pub fn take_instance_buffer(&mut self) -> Option<D::Buffer> {
        self.instance_count = 0;
        self.instance_buffer.take()
    }

    /// The instance buffer, if created
    pub fn instance_buffer(&self) -> Option<&D::Buffer> {
        self.instance_buffer.as_ref()
    }

    /// Number of instances in the instance buffer
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Record a build or update over the current instance buffer.
    ///
    /// An update reuses the result buffer and requires the previous build to allow updates with the same instance
    /// count. Anything else needs a full build.
    /// # Errors
    /// * Fails with [`Error::MissingBuffer`] without result, scratch or instance buffer.
    /// * Fails with [`Error::InvalidBuildInput`] if `input` was sized for a different instance count.
    /// * Fails with [`Error::InvalidUpdate`] if an update is not possible.
    pub fn build(&mut self, stream: &mut D::CommandStream, input: &BuildInput<D::Buffer>, barrier: bool) -> Result<()> {
        let instances = self.instance_buffer.clone().ok_or(Error::MissingBuffer("instance"))?;
        if input.instance_count() != self.instance_count {
            bail!(Error::InvalidBuildInput("build input instance count does not match the instance buffer"));
        }
        let buffer = self.base.record_build(stream, input, Some(&instances), None)?;
        if barrier {
            stream.uav_barrier(&buffer)?;
        }
        Ok(())
    }

    /// Release all buffers. Calling this more than once is harmless.
    pub fn destroy(&mut self) {
        self.destroy_instance_buffer();
        self.base.destroy();
    }
}

impl<D: Device> Deref for TopLevelStructure<D> {
    type Target = AccelerationStructure<D>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<D: Device> DerefMut for TopLevelStructure<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}
