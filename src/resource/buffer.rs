//! Buffer creation parameters and helpers for reading and writing mapped buffers.
//!
//! Buffers themselves are provided by the backend through the [`GpuBuffer`] trait. A buffer can only be mapped
//! if it was created in [`MemoryType::CpuToGpu`] or [`MemoryType::GpuToCpu`] memory.

use anyhow::{bail, Result};
use ash::vk;

use crate::{Error, GpuBuffer, MemoryType, ResourceState};

/// Parameters for [`Device::create_buffer()`](crate::Device::create_buffer).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferCreateInfo {
    /// Debug name of the buffer.
    pub name: String,
    /// Size in bytes.
    pub size: vk::DeviceSize,
    /// Element stride in bytes, zero for raw buffers.
    pub stride: vk::DeviceSize,
    /// How the buffer will be used.
    pub usage: vk::BufferUsageFlags,
    /// Where the memory lives.
    pub memory_type: MemoryType,
    /// State the buffer is in after creation.
    pub initial_state: ResourceState,
    /// Minimum alignment of the buffer address. Zero leaves it to the backend.
    pub alignment: vk::DeviceSize,
}

impl BufferCreateInfo {
    /// Describe a raw buffer of `size` bytes.
    pub fn new(name: impl Into<String>, size: vk::DeviceSize, usage: vk::BufferUsageFlags, memory_type: MemoryType) -> Self {
        Self {
            name: name.into(),
            size,
            stride: 0,
            usage,
            memory_type,
            initial_state: ResourceState::Common,
            alignment: 0,
        }
    }

    /// Storage for an acceleration structure.
    pub fn acceleration_structure(name: impl Into<String>, size: vk::DeviceSize) -> Self {
        Self::new(
            name,
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryType::GpuOnly,
        )
        .initial_state(ResourceState::AccelerationStructure)
    }

    /// Scratch memory for acceleration structure builds.
    pub fn scratch(name: impl Into<String>, size: vk::DeviceSize) -> Self {
        Self::new(
            name,
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryType::GpuOnly,
        )
        .initial_state(ResourceState::UnorderedAccess)
    }

    /// Set the element stride.
    pub fn stride(mut self, stride: vk::DeviceSize) -> Self {
        self.stride = stride;
        self
    }

    /// Require the buffer address to be a multiple of `alignment`.
    pub fn alignment(mut self, alignment: vk::DeviceSize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the initial resource state.
    pub fn initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }
}

/// Copy `data` into a mapped buffer at byte `offset`.
/// # Errors
/// * Fails if the buffer cannot be mapped.
/// * Fails with [`Error::BufferOutOfRange`] if the range does not fit in the buffer.
pub fn write_bytes<B: GpuBuffer>(buffer: &B, offset: usize, data: &[u8]) -> Result<()> {
    let mut mapping = buffer.map()?;
    let Some(dst) = mapping.get_mut(offset..offset + data.len()) else {
        bail!(Error::BufferOutOfRange);
    };
    dst.copy_from_slice(data);
    Ok(())
}

/// Read `len` bytes from a mapped buffer starting at byte `offset`.
pub fn read_bytes<B: GpuBuffer>(buffer: &B, offset: usize, len: usize) -> Result<Vec<u8>> {
    let mapping = buffer.map()?;
    match mapping.get(offset..offset + len) {
        None => bail!(Error::BufferOutOfRange),
        Some(src) => Ok(src.to_vec()),
    }
}

/// Write a slice of plain floats into a mapped buffer, starting at the first byte.
pub fn write_f32<B: GpuBuffer>(buffer: &B, values: &[f32]) -> Result<()> {
    let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
    write_bytes(buffer, 0, &bytes)
}

/// Write a slice of plain `u32` values into a mapped buffer, starting at the first byte.
pub fn write_u32<B: GpuBuffer>(buffer: &B, values: &[u32]) -> Result<()> {
    let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
    write_bytes(buffer, 0, &bytes)
}

/// Read a little-endian `u64` from a mapped buffer.
pub fn read_u64<B: GpuBuffer>(buffer: &B, offset: usize) -> Result<u64> {
    let bytes = read_bytes(buffer, offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(raw))
}

/// Read plain floats from a mapped buffer.
pub fn read_f32<B: GpuBuffer>(buffer: &B, offset: usize, count: usize) -> Result<Vec<f32>> {
    let bytes = read_bytes(buffer, offset, count * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
