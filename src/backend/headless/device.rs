//! The headless device: a ray tracing device simulated on the CPU.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{bail, Result};
use ash::vk;

use crate::backend::headless::accel_format::prebuild_size;
use crate::backend::headless::buffer::{BufferStorage, HeadlessBuffer, MemoryStats};
use crate::backend::headless::descriptor::{Descriptor, DescriptorStore, HeadlessDescriptorHeap};
use crate::backend::headless::pipeline::{HeadlessPipeline, MIN_IDENTIFIER_SIZE};
use crate::backend::headless::queue::{run_until, Queues};
use crate::backend::headless::stream::{HeadlessCommandStream, HeadlessFence};
use crate::backend::headless::traversal::read_instances;
use crate::descriptor::handle::{CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle};
use crate::resource::buffer::BufferCreateInfo;
use crate::util::align::align;
use crate::util::deferred_delete::DeferredDelete;
use crate::{
    AccelerationStructureBuildSize, AccelerationStructureInstance, BuildInput, Device, DeviceProperties, Error, Fence,
    GpuBuffer, QueueType,
};

const FIRST_BUFFER_ADDRESS: vk::DeviceAddress = 0x1000_0000;
const BUFFER_ADDRESS_ALIGNMENT: vk::DeviceAddress = 256;

#[derive(Debug)]
struct BufferRegistry {
    next_address: vk::DeviceAddress,
    buffers: BTreeMap<vk::DeviceAddress, Weak<BufferStorage>>,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct DeviceInner {
    properties: DeviceProperties,
    deferred: DeferredDelete,
    stats: Arc<MemoryStats>,
    next_object_id: AtomicU64,
    #[derivative(Debug = "ignore")]
    registry: Mutex<BufferRegistry>,
    #[derivative(Debug = "ignore")]
    descriptors: Mutex<DescriptorStore>,
    #[derivative(Debug = "ignore")]
    queues: Mutex<Queues>,
    #[derivative(Debug = "ignore")]
    execution: Mutex<()>,
}

/// A ray tracing device that runs everything on the CPU. Clones refer to the same device.
///
/// Buffers get stable fake device addresses that are never reused, so a stale address is always detected.
/// Submitted work runs when the caller blocks in [`Device::wait_idle()`] or [`Device::wait_for_fence()`].
#[derive(Debug, Clone)]
pub struct HeadlessDevice {
    inner: Arc<DeviceInner>,
}

impl HeadlessDevice {
    /// Create a device with the given properties.
    /// # Errors
    /// * Fails with [`Error::InvalidIdentifier`] if the shader identifier size is smaller than 16 bytes.
    pub fn new(properties: DeviceProperties) -> Result<Self> {
        if properties.shader_identifier_size < MIN_IDENTIFIER_SIZE {
            bail!(Error::InvalidIdentifier(format!(
                "headless devices need shader identifiers of at least {MIN_IDENTIFIER_SIZE} bytes"
            )));
        }
        info!(
            "Created headless device: {} byte shader identifiers, {} frames in flight",
            properties.shader_identifier_size, properties.frames_in_flight
        );
        Ok(Self {
            inner: Arc::new(DeviceInner {
                properties,
                deferred: DeferredDelete::new(properties.frames_in_flight),
                stats: Arc::new(MemoryStats::default()),
                next_object_id: AtomicU64::new(1),
                registry: Mutex::new(BufferRegistry {
                    next_address: FIRST_BUFFER_ADDRESS,
                    buffers: BTreeMap::new(),
                }),
                descriptors: Mutex::new(DescriptorStore::new(
                    properties.view_descriptor_size,
                    properties.sampler_descriptor_size,
                )),
                queues: Mutex::new(Queues::default()),
                execution: Mutex::new(()),
            }),
        })
    }

    pub(crate) fn next_object_id(&self) -> u64 {
        self.inner.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn queues(&self) -> MutexGuard<'_, Queues> {
        self.inner.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn execution_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.execution.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn registry(&self) -> MutexGuard<'_, BufferRegistry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn descriptors(&self) -> MutexGuard<'_, DescriptorStore> {
        self.inner.descriptors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Find the live buffer containing `address` and the offset of `address` in it.
    pub fn resolve(&self, address: vk::DeviceAddress) -> Option<(HeadlessBuffer, vk::DeviceSize)> {
        let registry = self.registry();
        let (base, storage) = registry.buffers.range(..=address).next_back()?;
        let storage = storage.upgrade()?;
        let offset = address - base;
        (offset < storage.size).then(|| (HeadlessBuffer(storage), offset))
    }

    /// Read `len` bytes at `address`, regardless of memory type. `None` if the range is not inside one live buffer.
    pub fn read_memory(&self, address: vk::DeviceAddress, len: vk::DeviceSize) -> Option<Vec<u8>> {
        let (buffer, offset) = self.resolve(address)?;
        let data = buffer.lock();
        data.get(offset as usize..(offset + len) as usize).map(<[u8]>::to_vec)
    }

    /// Write `bytes` at `address`, regardless of memory type. Returns false if the range is not inside one live
    /// buffer.
    pub fn write_memory(&self, address: vk::DeviceAddress, bytes: &[u8]) -> bool {
        let Some((buffer, offset)) = self.resolve(address) else {
            return false;
        };
        let mut data = buffer.lock();
        match data.get_mut(offset as usize..offset as usize + bytes.len()) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn create_view(&self, descriptor: Descriptor) -> CpuDescriptorHandle {
        self.descriptors().create_staging(descriptor)
    }

    /// Create a constant buffer view in CPU-only descriptor storage.
    pub fn create_constant_buffer_view(&self, buffer: &HeadlessBuffer) -> CpuDescriptorHandle {
        self.create_view(Descriptor::ConstantBuffer {
            address: buffer.address(),
            size: buffer.size(),
        })
    }

    /// Create a shader resource view in CPU-only descriptor storage.
    pub fn create_shader_resource_view(&self, buffer: &HeadlessBuffer) -> CpuDescriptorHandle {
        self.create_view(Descriptor::ShaderResource {
            address: buffer.address(),
            size: buffer.size(),
            stride: buffer.stride(),
        })
    }

    /// Create an unordered access view in CPU-only descriptor storage.
    pub fn create_unordered_access_view(&self, buffer: &HeadlessBuffer) -> CpuDescriptorHandle {
        self.create_view(Descriptor::UnorderedAccess {
            address: buffer.address(),
            size: buffer.size(),
            stride: buffer.stride(),
        })
    }

    /// Create a sampler in CPU-only descriptor storage.
    pub fn create_sampler(&self, filter: vk::Filter, address_mode: vk::SamplerAddressMode) -> CpuDescriptorHandle {
        self.create_view(Descriptor::Sampler {
            filter,
            address_mode,
        })
    }

    /// Descriptor written at `handle`
    pub fn descriptor(&self, handle: CpuDescriptorHandle) -> Option<Descriptor> {
        self.descriptors().read_cpu(handle)
    }

    /// Descriptor `index` entries after `handle`, as a shader sees it
    pub fn gpu_descriptor(&self, handle: GpuDescriptorHandle, index: u32) -> Option<Descriptor> {
        self.descriptors().read_gpu(handle, index)
    }

    /// Instances stored in the top level structure held by `buffer`, in build order.
    /// # Errors
    /// * Fails with [`Error::Uncategorized`] if the buffer holds no built top level structure.
    pub fn top_level_instances(&self, buffer: &HeadlessBuffer) -> Result<Vec<AccelerationStructureInstance>> {
        read_instances(self, buffer.address())
            .ok_or_else(|| Error::Uncategorized("buffer holds no top level acceleration structure").into())
    }

    /// Bytes allocated by live buffers
    pub fn allocated_bytes(&self) -> vk::DeviceSize {
        self.inner.stats.allocated.load(Ordering::Relaxed)
    }

    /// Number of live buffers
    pub fn live_buffer_count(&self) -> usize {
        self.inner.stats.buffers.load(Ordering::Relaxed)
    }

    /// Commands submitted but not executed yet
    pub fn pending_commands(&self) -> usize {
        self.queues().pending()
    }
}

impl Device for HeadlessDevice {
    type Buffer = HeadlessBuffer;
    type DescriptorHeap = HeadlessDescriptorHeap;
    type Fence = HeadlessFence;
    type Pipeline = HeadlessPipeline;
    type CommandStream = HeadlessCommandStream;

    fn properties(&self) -> &DeviceProperties {
        &self.inner.properties
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<HeadlessBuffer> {
        if info.size == 0 {
            bail!(Error::AllocationFailure(format!("buffer {} has size zero", info.name)));
        }
        let stats = &self.inner.stats;
        let allocated = stats.allocated.fetch_add(info.size, Ordering::Relaxed) + info.size;
        if let Some(budget) = self.inner.properties.memory_budget {
            if allocated > budget {
                stats.allocated.fetch_sub(info.size, Ordering::Relaxed);
                bail!(Error::AllocationFailure(format!(
                    "buffer {} ({} bytes) exceeds the memory budget of {budget} bytes",
                    info.name, info.size
                )));
            }
        }
        stats.buffers.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.registry();
        let address = align(registry.next_address, info.alignment.max(BUFFER_ADDRESS_ALIGNMENT));
        // Leave a gap so that overruns never land in the next buffer.
        registry.next_address = align(address + info.size, BUFFER_ADDRESS_ALIGNMENT) + BUFFER_ADDRESS_ALIGNMENT;
        let storage = Arc::new(BufferStorage {
            name: info.name.clone(),
            address,
            size: info.size,
            stride: info.stride,
            memory_type: info.memory_type,
            data: Mutex::new(vec![0; info.size as usize]),
            stats: stats.clone(),
        });
        registry.buffers.retain(|_, buffer| buffer.strong_count() > 0);
        registry.buffers.insert(address, Arc::downgrade(&storage));

        #[cfg(feature = "log-objects")]
        trace!("Created buffer {} at {address:#x} ({} bytes, {:?})", info.name, info.size, info.memory_type);
        Ok(HeadlessBuffer(storage))
    }

    fn query_prebuild_info(&self, input: &BuildInput<HeadlessBuffer>) -> Result<AccelerationStructureBuildSize> {
        let count = match input.ty() {
            crate::AccelerationStructureType::BottomLevel => input.primitive_counts().iter().sum(),
            crate::AccelerationStructureType::TopLevel => input.instance_count(),
        };
        Ok(prebuild_size(input.ty(), count))
    }

    fn create_descriptor_heap(&self, ty: DescriptorHeapType, capacity: u32) -> Result<HeadlessDescriptorHeap> {
        let increment = match ty {
            DescriptorHeapType::View => self.inner.properties.view_descriptor_size,
            DescriptorHeapType::Sampler => self.inner.properties.sampler_descriptor_size,
        };
        let heap = self.descriptors().create_heap(ty, capacity, increment);
        #[cfg(feature = "log-objects")]
        trace!("Created {ty:?} descriptor heap with {capacity} descriptors");
        Ok(heap)
    }

    fn copy_descriptors(&self, ty: DescriptorHeapType, dst: CpuDescriptorHandle, src: &[CpuDescriptorHandle]) -> Result<()> {
        let increment = match ty {
            DescriptorHeapType::View => self.inner.properties.view_descriptor_size,
            DescriptorHeapType::Sampler => self.inner.properties.sampler_descriptor_size,
        };
        let descriptors = self.descriptors();
        for (i, handle) in src.iter().enumerate() {
            let Some(descriptor) = descriptors.read_cpu(*handle) else {
                bail!(Error::Uncategorized("source descriptor handle does not point into a live heap"));
            };
            if descriptor.heap_type().is_some_and(|descriptor_ty| descriptor_ty != ty) {
                bail!(Error::Uncategorized("source descriptor type does not match the copy type"));
            }
            descriptors.write(dst.offset(i as u32, increment), descriptor)?;
        }
        Ok(())
    }

    fn write_acceleration_structure_view(&self, dst: CpuDescriptorHandle, address: vk::DeviceAddress) -> Result<()> {
        self.descriptors().write(dst, Descriptor::AccelerationStructure {
            address,
        })
    }

    fn create_command_stream(&self, queue: QueueType) -> Result<HeadlessCommandStream> {
        Ok(HeadlessCommandStream::new(self.clone(), queue))
    }

    fn create_fence(&self) -> Result<HeadlessFence> {
        Ok(HeadlessFence::new(self.next_object_id()))
    }

    fn wait_idle(&self) -> Result<()> {
        run_until(self, || self.queues().pending() == 0)
    }

    fn wait_for_fence(&self, fence: &HeadlessFence, value: u64) -> Result<()> {
        run_until(self, || fence.completed_value() >= value)
    }

    fn deferred_delete(&self) -> &DeferredDelete {
        &self.inner.deferred
    }
}
