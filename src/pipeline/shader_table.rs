//! Shader tables: arrays of fixed-stride shader records.
//!
//! A shader record is a shader identifier followed by the local root arguments, here a fixed number of descriptor
//! table handles:
//!
//! ```text
//! | identifier | padding | handle 0 | handle 1 | ... | padding |
//! 0            identifier_size      handle_offset                 record_size
//! ```
//!
//! `handle_offset` is the identifier size aligned to the handle size, `record_size` is the end of the last handle
//! aligned to the record alignment. Every record of a table has the same size, even records that use fewer handles.

use anyhow::{bail, Result};
use ash::vk;

use crate::descriptor::handle::GpuDescriptorHandle;
use crate::pipeline::identifier::{ShaderIdentifier, ShaderIdentifierSource};
use crate::resource::buffer::{write_bytes, BufferCreateInfo};
use crate::util::align::align;
use crate::util::to_vk::AsVulkanType;
use crate::{Device, DeviceProperties, Error, GpuBuffer, MemoryType, ResourceState};

/// Size of one descriptor handle in a shader record.
pub const SHADER_RECORD_HANDLE_SIZE: u32 = std::mem::size_of::<GpuDescriptorHandle>() as u32;

/// Byte layout shared by all records of a table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ShaderRecordLayout {
    identifier_size: u32,
    slot_count: u32,
    record_alignment: u32,
    handle_offset: u32,
    record_size: u32,
}

impl ShaderRecordLayout {
    /// Compute the layout of records with `slot_count` descriptor handles. An alignment of zero is treated as one.
    pub fn new(identifier_size: u32, slot_count: u32, record_alignment: u32) -> Self {
        let record_alignment = record_alignment.max(1);
        let handle_offset = align(identifier_size, SHADER_RECORD_HANDLE_SIZE);
        let record_size = align(handle_offset + SHADER_RECORD_HANDLE_SIZE * slot_count, record_alignment);
        Self {
            identifier_size,
            slot_count,
            record_alignment,
            handle_offset,
            record_size,
        }
    }

    /// Layout for the identifier size and record alignment of a device.
    pub fn for_device(properties: &DeviceProperties, slot_count: u32) -> Self {
        Self::new(properties.shader_identifier_size, slot_count, properties.shader_record_alignment)
    }

    /// Size of the shader identifier at the start of each record
    pub fn identifier_size(&self) -> u32 {
        self.identifier_size
    }

    /// Number of descriptor handle slots per record
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Record sizes are a multiple of this
    pub fn record_alignment(&self) -> u32 {
        self.record_alignment
    }

    /// Byte offset of the first handle
    pub fn handle_offset(&self) -> u32 {
        self.handle_offset
    }

    /// Stride between two records
    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    /// Size in bytes of a table with `record_count` records.
    pub fn table_size(&self, record_count: u32) -> vk::DeviceSize {
        vk::DeviceSize::from(self.record_size) * vk::DeviceSize::from(record_count)
    }
}

/// Index of a hit group record: hit groups of one material are consecutive.
pub fn hit_group_index(material: u32, variants_per_material: u32, variant: u32) -> u32 {
    material * variants_per_material + variant
}

/// Writes one record. Unwritten bytes stay zero.
pub struct ShaderRecordWriter<'a> {
    layout: &'a ShaderRecordLayout,
    source: &'a dyn ShaderIdentifierSource,
    bytes: &'a mut [u8],
}

impl<'a> ShaderRecordWriter<'a> {
    /// Write the identifier of `export`.
    /// # Errors
    /// * Fails with [`Error::InvalidIdentifier`] if the identifier source does not know `export`.
    pub fn export(&mut self, export: &str) -> Result<()> {
        let Some(identifier) = self.source.shader_identifier(export) else {
            bail!(Error::InvalidIdentifier(format!("unknown export `{export}`")));
        };
        self.identifier(&identifier)
    }

    /// Write a raw identifier.
    /// # Errors
    /// * Fails with [`Error::InvalidIdentifier`] if the identifier has the wrong size.
    pub fn identifier(&mut self, identifier: &ShaderIdentifier) -> Result<()> {
        let size = self.layout.identifier_size as usize;
        if identifier.len() != size {
            bail!(Error::InvalidIdentifier(format!(
                "identifier has {} bytes, records expect {size}",
                identifier.len()
            )));
        }
        self.bytes[..size].copy_from_slice(identifier.as_bytes());
        Ok(())
    }

    /// Write descriptor handles into the first `handles.len()` slots.
    /// # Errors
    /// * Fails with [`Error::TooManyHandles`] if there are more handles than slots.
    pub fn handles(&mut self, handles: &[GpuDescriptorHandle]) -> Result<()> {
        if handles.len() > self.layout.slot_count as usize {
            bail!(Error::TooManyHandles {
                given: handles.len(),
                slots: self.layout.slot_count,
            });
        }
        let mut offset = self.layout.handle_offset as usize;
        for handle in handles {
            self.bytes[offset..offset + SHADER_RECORD_HANDLE_SIZE as usize].copy_from_slice(&handle.to_le_bytes());
            offset += SHADER_RECORD_HANDLE_SIZE as usize;
        }
        Ok(())
    }
}

/// A shader table living in an upload buffer.
#[derive(Debug, Clone)]
pub struct ShaderTable<B: GpuBuffer> {
    buffer: B,
    layout: ShaderRecordLayout,
    record_count: u32,
}

impl<B: GpuBuffer> ShaderTable<B> {
    /// Buffer holding the records
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /// Record layout
    pub fn layout(&self) -> &ShaderRecordLayout {
        &self.layout
    }

    /// Number of records
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Stride between records
    pub fn stride(&self) -> vk::DeviceSize {
        vk::DeviceSize::from(self.layout.record_size())
    }

    /// Size of all records together
    pub fn size(&self) -> vk::DeviceSize {
        self.layout.table_size(self.record_count)
    }

    /// Device address of record `index`
    pub fn record_address(&self, index: u32) -> vk::DeviceAddress {
        self.buffer.address() + self.layout.table_size(index)
    }

    /// Region to pass to a dispatch.
    pub fn region(&self) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: self.buffer.address(),
            stride: self.stride(),
            size: self.size(),
        }
    }
}

impl<B: GpuBuffer> AsVulkanType for ShaderTable<B> {
    type Output = vk::StridedDeviceAddressRegionKHR;

    fn as_vulkan(&self) -> Self::Output {
        self.region()
    }
}

/// Builds shader tables for one record layout from an identifier source.
///
/// The per-record filler gets the record index and a [`ShaderRecordWriter`]. It usually writes an export
/// identifier and the local descriptor handles of the geometry or material the record belongs to.
pub struct ShaderTableBuilder<'a, D: Device> {
    device: &'a D,
    source: &'a dyn ShaderIdentifierSource,
    layout: ShaderRecordLayout,
}

impl<'a, D: Device> ShaderTableBuilder<'a, D> {
    /// Builder for records with `slot_count` handles, laid out for `device`.
    pub fn new(device: &'a D, source: &'a dyn ShaderIdentifierSource, slot_count: u32) -> Self {
        Self {
            device,
            source,
            layout: ShaderRecordLayout::for_device(device.properties(), slot_count),
        }
    }

    /// Builder with an explicit record layout.
    pub fn with_layout(device: &'a D, source: &'a dyn ShaderIdentifierSource, layout: ShaderRecordLayout) -> Self {
        Self {
            device,
            source,
            layout,
        }
    }

    /// Record layout of the tables this builder creates
    pub fn layout(&self) -> &ShaderRecordLayout {
        &self.layout
    }

    /// Allocate a table of `record_count` records and fill each one with `fill`.
    /// # Errors
    /// * Fails with [`Error::EmptyShaderTable`] if `record_count` is zero.
    /// * Fails with [`Error::MisalignedBuffer`] if the backend ignores the table alignment.
    /// * Fails with whatever `fill` or the buffer allocation fails with.
    pub fn build<F>(&self, name: &str, record_count: u32, mut fill: F) -> Result<ShaderTable<D::Buffer>>
    where
        F: FnMut(u32, &mut ShaderRecordWriter<'_>) -> Result<()>, {
        if record_count == 0 {
            bail!(Error::EmptyShaderTable);
        }
        let record_size = self.layout.record_size() as usize;
        let mut bytes = vec![0u8; record_size * record_count as usize];
        for (index, record) in bytes.chunks_exact_mut(record_size).enumerate() {
            let mut writer = ShaderRecordWriter {
                layout: &self.layout,
                source: self.source,
                bytes: record,
            };
            fill(index as u32, &mut writer)?;
        }

        let table_alignment = vk::DeviceSize::from(self.device.properties().shader_table_alignment.max(1));
        let buffer = self.device.create_buffer(
            &BufferCreateInfo::new(
                name,
                self.layout.table_size(record_count),
                vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryType::CpuToGpu,
            )
            .stride(vk::DeviceSize::from(self.layout.record_size()))
            .initial_state(ResourceState::GenericRead)
            .alignment(table_alignment),
        )?;
        if buffer.address() % table_alignment != 0 {
            bail!(Error::MisalignedBuffer {
                address: buffer.address(),
                alignment: table_alignment,
            });
        }
        write_bytes(&buffer, 0, &bytes)?;

        #[cfg(feature = "log-objects")]
        trace!("Created shader table {name}: {record_count} records of {record_size} bytes");

        Ok(ShaderTable {
            buffer,
            layout: self.layout,
            record_count,
        })
    }

    /// Table with one handle-less record per export, for ray generation and miss shaders.
    pub fn build_exports(&self, name: &str, exports: &[&str]) -> Result<ShaderTable<D::Buffer>> {
        self.build(name, exports.len() as u32, |index, record| record.export(exports[index as usize]))
    }

    /// Hit group table with one record per material and variant, variant `v` of material `m` at
    /// [`hit_group_index(m, variants.len(), v)`](hit_group_index). `handles` returns the local descriptor handles
    /// of a material.
    pub fn build_hit_groups<F>(&self, name: &str, material_count: u32, variants: &[&str], mut handles: F) -> Result<ShaderTable<D::Buffer>>
    where
        F: FnMut(u32) -> Result<Vec<GpuDescriptorHandle>>, {
        let variant_count = variants.len() as u32;
        if variant_count == 0 {
            bail!(Error::EmptyShaderTable);
        }
        let mut material_handles = Vec::with_capacity(material_count as usize);
        for material in 0..material_count {
            material_handles.push(handles(material)?);
        }
        self.build(name, material_count * variant_count, |index, record| {
            let material = index / variant_count;
            let variant = index % variant_count;
            debug_assert_eq!(hit_group_index(material, variant_count, variant), index);
            record.export(variants[variant as usize])?;
            record.handles(&material_handles[material as usize])
        })
    }
}

/// Everything a ray dispatch needs besides the bound pipeline and global root.
#[derive(Debug, Default, Copy, Clone)]
pub struct DispatchRaysDesc {
    /// Ray generation record. Its size equals its stride, only the first record is used.
    pub ray_generation: vk::StridedDeviceAddressRegionKHR,
    /// Miss records, indexed by the miss index of a trace call
    pub miss: vk::StridedDeviceAddressRegionKHR,
    /// Hit group records, indexed by instance offset, geometry index and ray contribution
    pub hit_group: vk::StridedDeviceAddressRegionKHR,
    /// Callable records
    pub callable: vk::StridedDeviceAddressRegionKHR,
    /// Launch width
    pub width: u32,
    /// Launch height
    pub height: u32,
    /// Launch depth
    pub depth: u32,
}

impl DispatchRaysDesc {
    /// Dispatch `width * height` rays using the first record of `ray_generation`.
    pub fn new<B: GpuBuffer>(
        ray_generation: &ShaderTable<B>,
        miss: &ShaderTable<B>,
        hit_group: &ShaderTable<B>,
        width: u32,
        height: u32,
    ) -> Self {
        let mut ray_generation = ray_generation.region();
        ray_generation.size = ray_generation.stride;
        Self {
            ray_generation,
            miss: miss.region(),
            hit_group: hit_group.region(),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
            width,
            height,
            depth: 1,
        }
    }

    /// Set the callable table.
    pub fn callable<B: GpuBuffer>(mut self, callable: &ShaderTable<B>) -> Self {
        self.callable = callable.region();
        self
    }

    /// Set the launch depth.
    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }
}
