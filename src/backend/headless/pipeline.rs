//! Ray tracing pipelines of the headless backend. Shaders are Rust closures.
//!
//! A pipeline exports ray generation, miss and hit group shaders by name. Shader tables reference them through the
//! identifiers the pipeline hands out as a [`ShaderIdentifierSource`], exactly like they would reference compiled
//! shaders. A dispatch reads the identifier from each record it visits and calls the matching closure with a
//! [`ShaderContext`] for that record.

use std::sync::Arc;

use anyhow::{bail, Result};
use ash::vk;
use glam::UVec3;

use crate::backend::headless::accel_format::u32_at;
use crate::backend::headless::descriptor::Descriptor;
use crate::backend::headless::traversal::{closest_hit, Hit, Ray};
use crate::backend::headless::HeadlessDevice;
use crate::descriptor::global_set::GlobalBinding;
use crate::descriptor::handle::GpuDescriptorHandle;
use crate::pipeline::identifier::{ShaderIdentifier, ShaderIdentifierSource};
use crate::pipeline::root_signature::DescriptorRangeType;
use crate::pipeline::shader_table::{DispatchRaysDesc, SHADER_RECORD_HANDLE_SIZE};
use crate::util::align::align;
use crate::{Device, Error};

const IDENTIFIER_MAGIC: u32 = u32::from_le_bytes(*b"DMSI");
/// Bytes an identifier needs: magic, pipeline id and export index.
pub(crate) const MIN_IDENTIFIER_SIZE: u32 = 16;
/// Deepest nesting of `trace_ray` calls.
pub const MAX_RECURSION_DEPTH: u32 = 31;

/// Ray payload shared between the tracing shader and the hit or miss shader it invokes.
pub type Payload = [f32; 4];

type RayGenerationFn = dyn Fn(&ShaderContext<'_>) -> Result<()> + Send + Sync;
type MissFn = dyn Fn(&ShaderContext<'_>, &mut Payload) -> Result<()> + Send + Sync;
type ClosestHitFn = dyn Fn(&ShaderContext<'_>, &Hit, &mut Payload) -> Result<()> + Send + Sync;

#[derive(Clone)]
enum Export {
    RayGeneration(Arc<RayGenerationFn>),
    Miss(Arc<MissFn>),
    HitGroup(Arc<ClosestHitFn>),
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Export::RayGeneration(_) => f.write_str("RayGeneration"),
            Export::Miss(_) => f.write_str("Miss"),
            Export::HitGroup(_) => f.write_str("HitGroup"),
        }
    }
}

#[derive(Debug)]
struct PipelineInner {
    id: u64,
    name: String,
    identifier_size: u32,
    exports: Vec<(String, Export)>,
}

/// A ray tracing pipeline of closures. Clones refer to the same pipeline.
#[derive(Debug, Clone)]
pub struct HeadlessPipeline(Arc<PipelineInner>);

/// Collects exports for a [`HeadlessPipeline`].
#[derive(Debug, Default)]
pub struct HeadlessPipelineBuilder {
    name: String,
    exports: Vec<(String, Export)>,
}

impl HeadlessPipelineBuilder {
    /// Start an empty pipeline
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exports: vec![],
        }
    }

    /// Export a ray generation shader.
    pub fn ray_generation<F>(mut self, export: impl Into<String>, shader: F) -> Self
    where
        F: Fn(&ShaderContext<'_>) -> Result<()> + Send + Sync + 'static, {
        self.exports.push((export.into(), Export::RayGeneration(Arc::new(shader))));
        self
    }

    /// Export a miss shader.
    pub fn miss<F>(mut self, export: impl Into<String>, shader: F) -> Self
    where
        F: Fn(&ShaderContext<'_>, &mut Payload) -> Result<()> + Send + Sync + 'static, {
        self.exports.push((export.into(), Export::Miss(Arc::new(shader))));
        self
    }

    /// Export a hit group with a closest hit shader.
    pub fn hit_group<F>(mut self, export: impl Into<String>, shader: F) -> Self
    where
        F: Fn(&ShaderContext<'_>, &Hit, &mut Payload) -> Result<()> + Send + Sync + 'static, {
        self.exports.push((export.into(), Export::HitGroup(Arc::new(shader))));
        self
    }

    /// Create the pipeline.
    /// # Errors
    /// * Fails with [`Error::InvalidIdentifier`] if two exports share a name or the device's identifier size is too
    ///   small to identify exports.
    pub fn build(self, device: &HeadlessDevice) -> Result<HeadlessPipeline> {
        let identifier_size = device.properties().shader_identifier_size;
        if identifier_size < MIN_IDENTIFIER_SIZE {
            bail!(Error::InvalidIdentifier(format!(
                "headless identifiers need at least {MIN_IDENTIFIER_SIZE} bytes, the device uses {identifier_size}"
            )));
        }
        for (i, (name, _)) in self.exports.iter().enumerate() {
            if self.exports[..i].iter().any(|(other, _)| other == name) {
                bail!(Error::InvalidIdentifier(format!("export `{name}` is defined twice")));
            }
        }
        let pipeline = HeadlessPipeline(Arc::new(PipelineInner {
            id: device.next_object_id(),
            name: self.name,
            identifier_size,
            exports: self.exports,
        }));
        #[cfg(feature = "log-objects")]
        trace!("Created pipeline {} with {} exports", pipeline.0.name, pipeline.0.exports.len());
        Ok(pipeline)
    }
}

impl HeadlessPipeline {
    /// Debug name
    pub fn name(&self) -> &str {
        &self.0.name
    }

    fn identify(&self, bytes: &[u8]) -> Option<&Export> {
        if bytes.len() < MIN_IDENTIFIER_SIZE as usize || u32_at(bytes, 0) != IDENTIFIER_MAGIC {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[4..12]);
        if u64::from_le_bytes(id) != self.0.id {
            return None;
        }
        self.0.exports.get(u32_at(bytes, 12) as usize).map(|(_, export)| export)
    }

    fn export_at(&self, device: &HeadlessDevice, record: vk::DeviceAddress) -> Option<&Export> {
        let Some(bytes) = device.read_memory(record, u64::from(self.0.identifier_size)) else {
            error!("Shader record at {record:#x} is not in mapped memory");
            return None;
        };
        let export = self.identify(&bytes);
        if export.is_none() {
            error!("Shader record at {record:#x} holds an identifier unknown to pipeline {}", self.0.name);
        }
        export
    }
}

impl ShaderIdentifierSource for HeadlessPipeline {
    fn shader_identifier(&self, export: &str) -> Option<ShaderIdentifier> {
        let index = self.0.exports.iter().position(|(name, _)| name == export)?;
        let mut bytes = vec![0u8; self.0.identifier_size as usize];
        bytes[0..4].copy_from_slice(&IDENTIFIER_MAGIC.to_le_bytes());
        bytes[4..12].copy_from_slice(&self.0.id.to_le_bytes());
        bytes[12..16].copy_from_slice(&(index as u32).to_le_bytes());
        Some(ShaderIdentifier::new(bytes))
    }
}

/// Parameters of a `trace_ray` call besides the payload.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TraceRay {
    /// Index of the root acceleration structure parameter to trace against
    pub acceleration_structure: u32,
    /// Instances whose mask shares no bit with this are skipped
    pub mask: u8,
    /// Added to the hit group index
    pub contribution: u32,
    /// Multiplied with the geometry index for the hit group index
    pub geometry_multiplier: u32,
    /// Miss record to invoke when nothing is hit
    pub miss_index: u32,
    /// The ray itself
    pub ray: Ray,
}

impl TraceRay {
    /// Trace `ray` against the first acceleration structure with all instances visible.
    pub fn new(ray: Ray) -> Self {
        Self {
            acceleration_structure: 0,
            mask: 0xff,
            contribution: 0,
            geometry_multiplier: 1,
            miss_index: 0,
            ray,
        }
    }

    /// Set the instance mask.
    pub fn mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    /// Set the hit group contribution and geometry multiplier.
    pub fn hit_group(mut self, contribution: u32, geometry_multiplier: u32) -> Self {
        self.contribution = contribution;
        self.geometry_multiplier = geometry_multiplier;
        self
    }

    /// Set the miss record index.
    pub fn miss_index(mut self, index: u32) -> Self {
        self.miss_index = index;
        self
    }
}

/// What a shader closure can see: its launch index, the global root and its own shader record.
pub struct ShaderContext<'a> {
    device: &'a HeadlessDevice,
    pipeline: &'a HeadlessPipeline,
    root: &'a GlobalBinding,
    desc: &'a DispatchRaysDesc,
    launch_index: UVec3,
    record: vk::DeviceAddress,
    record_size: vk::DeviceSize,
    depth: u32,
}

impl<'a> ShaderContext<'a> {
    /// Index of this invocation in the launch grid
    pub fn launch_index(&self) -> UVec3 {
        self.launch_index
    }

    /// Size of the launch grid
    pub fn launch_size(&self) -> UVec3 {
        UVec3::new(self.desc.width, self.desc.height, self.desc.depth)
    }

    /// Number of nested `trace_ray` calls leading to this invocation
    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn nested(&self, record: vk::DeviceAddress, record_size: vk::DeviceSize) -> ShaderContext<'a> {
        ShaderContext {
            device: self.device,
            pipeline: self.pipeline,
            root: self.root,
            desc: self.desc,
            launch_index: self.launch_index,
            record,
            record_size,
            depth: self.depth + 1,
        }
    }

    /// Trace a ray and run the closest hit or miss shader on `payload`.
    /// # Errors
    /// * Fails with [`Error::RootSignatureMismatch`] if the acceleration structure parameter does not exist.
    /// * Fails if the closest hit or miss shader fails.
    pub fn trace_ray(&self, trace: &TraceRay, payload: &mut Payload) -> Result<()> {
        if self.depth >= MAX_RECURSION_DEPTH {
            bail!(Error::Uncategorized("maximum trace recursion depth exceeded"));
        }
        let Some(tlas) = self.root.acceleration_structures.get(trace.acceleration_structure as usize) else {
            bail!(Error::RootSignatureMismatch("acceleration structure parameter out of range"));
        };

        match closest_hit(self.device, *tlas, &trace.ray, trace.mask) {
            Some(hit) => {
                let table = &self.desc.hit_group;
                let index = u64::from(hit.record_offset)
                    + u64::from(hit.geometry_index) * u64::from(trace.geometry_multiplier)
                    + u64::from(trace.contribution);
                let Some(record) = record_in(table, index) else {
                    error!("Hit group record {index} is outside the hit group table ({} bytes)", table.size);
                    return Ok(());
                };
                match self.pipeline.export_at(self.device, record) {
                    Some(Export::HitGroup(shader)) => shader(&self.nested(record, table.stride), &hit, payload),
                    Some(other) => {
                        error!("Hit group record {index} holds a {other:?} export");
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
            None => {
                let table = &self.desc.miss;
                let index = u64::from(trace.miss_index);
                let Some(record) = record_in(table, index) else {
                    error!("Miss record {index} is outside the miss table ({} bytes)", table.size);
                    return Ok(());
                };
                match self.pipeline.export_at(self.device, record) {
                    Some(Export::Miss(shader)) => shader(&self.nested(record, table.stride), payload),
                    Some(other) => {
                        error!("Miss record {index} holds a {other:?} export");
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
        }
    }

    /// Descriptor handle in `slot` of this invocation's shader record.
    /// # Errors
    /// * Fails with [`Error::TooManyHandles`] if the record has no such slot.
    pub fn local_handle(&self, slot: u32) -> Result<GpuDescriptorHandle> {
        let handle_offset = align(u64::from(self.pipeline.0.identifier_size), u64::from(SHADER_RECORD_HANDLE_SIZE));
        let offset = handle_offset + u64::from(slot) * u64::from(SHADER_RECORD_HANDLE_SIZE);
        if offset + u64::from(SHADER_RECORD_HANDLE_SIZE) > self.record_size {
            bail!(Error::TooManyHandles {
                given: slot as usize + 1,
                slots: ((self.record_size.saturating_sub(handle_offset)) / u64::from(SHADER_RECORD_HANDLE_SIZE)) as u32,
            });
        }
        let bytes = self
            .device
            .read_memory(self.record + offset, u64::from(SHADER_RECORD_HANDLE_SIZE))
            .ok_or(Error::BufferOutOfRange)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(GpuDescriptorHandle(u64::from_le_bytes(raw)))
    }

    /// The descriptor `index` entries after `handle`, in the heap `handle` points into.
    pub fn descriptor(&self, handle: GpuDescriptorHandle, index: u32) -> Result<Descriptor> {
        self.device
            .gpu_descriptor(handle, index)
            .ok_or_else(|| Error::Uncategorized("descriptor handle does not point into a live heap").into())
    }

    /// Descriptor `index` of the local table in `slot`.
    pub fn local_descriptor(&self, slot: u32, index: u32) -> Result<Descriptor> {
        self.descriptor(self.local_handle(slot)?, index)
    }

    /// Descriptor `index` of a global table.
    /// # Errors
    /// * Fails with [`Error::RootSignatureMismatch`] if the global root has no such table or `index` is out of range.
    pub fn global_descriptor(&self, range: DescriptorRangeType, index: u32) -> Result<Descriptor> {
        let table = match range {
            DescriptorRangeType::Cbv => self.root.cbv,
            DescriptorRangeType::Srv => self.root.srv,
            DescriptorRangeType::Uav => self.root.uav,
            DescriptorRangeType::Sampler => self.root.sampler,
        };
        match table {
            Some(table) if index < table.count => self.descriptor(table.start, index),
            _ => bail!(Error::RootSignatureMismatch("global descriptor out of range")),
        }
    }

    fn element_address(&self, descriptor: &Descriptor, element: u32, writable: bool) -> Result<vk::DeviceAddress> {
        let (address, size) = match *descriptor {
            Descriptor::UnorderedAccess {
                address,
                size,
                ..
            } => (address, size),
            Descriptor::ConstantBuffer {
                address,
                size,
            }
            | Descriptor::ShaderResource {
                address,
                size,
                ..
            } if !writable => (address, size),
            _ => bail!(Error::Uncategorized("descriptor is not a buffer view that allows this access")),
        };
        if (u64::from(element) + 1) * 4 > size {
            bail!(Error::BufferOutOfRange);
        }
        Ok(address + u64::from(element) * 4)
    }

    /// Load 32 bit element `element` through a buffer view.
    pub fn load_u32(&self, descriptor: &Descriptor, element: u32) -> Result<u32> {
        let address = self.element_address(descriptor, element, false)?;
        let bytes = self.device.read_memory(address, 4).ok_or(Error::BufferOutOfRange)?;
        Ok(u32_at(&bytes, 0))
    }

    /// Load float element `element` through a buffer view.
    pub fn load_f32(&self, descriptor: &Descriptor, element: u32) -> Result<f32> {
        Ok(f32::from_bits(self.load_u32(descriptor, element)?))
    }

    /// Store float element `element` through an unordered access view.
    pub fn store_f32(&self, descriptor: &Descriptor, element: u32, value: f32) -> Result<()> {
        let address = self.element_address(descriptor, element, true)?;
        if !self.device.write_memory(address, &value.to_le_bytes()) {
            bail!(Error::BufferOutOfRange);
        }
        Ok(())
    }
}

fn record_in(table: &vk::StridedDeviceAddressRegionKHR, index: u64) -> Option<vk::DeviceAddress> {
    let offset = index.checked_mul(table.stride)?;
    (offset + table.stride <= table.size).then_some(table.device_address + offset)
}

/// Run every invocation of a dispatch. Shader failures are logged, never returned.
pub(crate) fn dispatch_rays(device: &HeadlessDevice, pipeline: &HeadlessPipeline, root: &GlobalBinding, desc: &DispatchRaysDesc) {
    let record = desc.ray_generation.device_address;
    let shader = match pipeline.export_at(device, record) {
        Some(Export::RayGeneration(shader)) => shader.clone(),
        Some(other) => {
            error!("Ray generation record holds a {other:?} export");
            return;
        }
        None => return,
    };
    debug!("Dispatching {}x{}x{} rays with pipeline {}", desc.width, desc.height, desc.depth, pipeline.name());
    for z in 0..desc.depth {
        for y in 0..desc.height {
            for x in 0..desc.width {
                let context = ShaderContext {
                    device,
                    pipeline,
                    root,
                    desc,
                    launch_index: UVec3::new(x, y, z),
                    record,
                    record_size: desc.ray_generation.stride,
                    depth: 0,
                };
                if let Err(err) = shader(&context) {
                    error!("Ray generation shader failed at ({x}, {y}, {z}): {err}");
                }
            }
        }
    }
}
