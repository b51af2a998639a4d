//! Descriptor heaps of the headless backend.
//!
//! Descriptors are stored as plain values. Every heap gets its own range of fake CPU and GPU handle values, so a
//! handle alone is enough to find the heap and slot it refers to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{bail, Result};
use ash::vk;

use crate::descriptor::handle::{CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle};
use crate::{DescriptorHeap, Error};

const CPU_HANDLE_BASE: u64 = 0x0010_0000_0000;
const GPU_HANDLE_BASE: u64 = 0x4000_0000_0000;
// Address space reserved for the device's CPU-only descriptor storage.
const STAGING_RANGE: u64 = 1 << 32;

/// A descriptor as the headless backend stores it.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Descriptor {
    /// Nothing written yet
    #[default]
    Null,
    /// Constant buffer view
    ConstantBuffer {
        /// Buffer address
        address: vk::DeviceAddress,
        /// Viewed bytes
        size: vk::DeviceSize,
    },
    /// Shader resource view of a buffer
    ShaderResource {
        /// Buffer address
        address: vk::DeviceAddress,
        /// Viewed bytes
        size: vk::DeviceSize,
        /// Element stride, zero for raw views
        stride: vk::DeviceSize,
    },
    /// Unordered access view of a buffer
    UnorderedAccess {
        /// Buffer address
        address: vk::DeviceAddress,
        /// Viewed bytes
        size: vk::DeviceSize,
        /// Element stride, zero for raw views
        stride: vk::DeviceSize,
    },
    /// Acceleration structure view
    AccelerationStructure {
        /// Structure address
        address: vk::DeviceAddress,
    },
    /// Sampler
    Sampler {
        /// Filter for minification and magnification
        filter: vk::Filter,
        /// Address mode on all axes
        address_mode: vk::SamplerAddressMode,
    },
}

impl Descriptor {
    /// Heap type this descriptor belongs in
    pub fn heap_type(&self) -> Option<DescriptorHeapType> {
        match self {
            Descriptor::Null => None,
            Descriptor::Sampler {
                ..
            } => Some(DescriptorHeapType::Sampler),
            _ => Some(DescriptorHeapType::View),
        }
    }

    /// Buffer address of a view, `None` for samplers and null descriptors
    pub fn address(&self) -> Option<vk::DeviceAddress> {
        match *self {
            Descriptor::ConstantBuffer {
                address,
                ..
            }
            | Descriptor::ShaderResource {
                address,
                ..
            }
            | Descriptor::UnorderedAccess {
                address,
                ..
            }
            | Descriptor::AccelerationStructure {
                address,
            } => Some(address),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct HeapStorage {
    pub ty: DescriptorHeapType,
    pub capacity: u32,
    pub increment: u32,
    pub cpu_base: u64,
    pub gpu_base: Option<u64>,
    pub slots: Mutex<Vec<Descriptor>>,
}

impl HeapStorage {
    fn lock(&self) -> MutexGuard<'_, Vec<Descriptor>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cpu_slot(&self, handle: CpuDescriptorHandle) -> Option<usize> {
        let offset = handle.0.checked_sub(self.cpu_base)?;
        if offset % u64::from(self.increment) != 0 {
            return None;
        }
        let slot = offset / u64::from(self.increment);
        (slot < u64::from(self.capacity)).then_some(slot as usize)
    }

    fn gpu_slot(&self, handle: GpuDescriptorHandle) -> Option<usize> {
        let offset = handle.0.checked_sub(self.gpu_base?)?;
        if offset % u64::from(self.increment) != 0 {
            return None;
        }
        let slot = offset / u64::from(self.increment);
        (slot < u64::from(self.capacity)).then_some(slot as usize)
    }
}

/// A shader-visible descriptor heap of the headless backend.
#[derive(Debug, Clone)]
pub struct HeadlessDescriptorHeap(pub(crate) Arc<HeapStorage>);

impl HeadlessDescriptorHeap {
    /// Descriptor stored in `slot`
    pub fn get(&self, slot: u32) -> Option<Descriptor> {
        self.0.lock().get(slot as usize).copied()
    }
}

impl DescriptorHeap for HeadlessDescriptorHeap {
    fn heap_type(&self) -> DescriptorHeapType {
        self.0.ty
    }

    fn capacity(&self) -> u32 {
        self.0.capacity
    }

    fn cpu_start(&self) -> CpuDescriptorHandle {
        CpuDescriptorHandle(self.0.cpu_base)
    }

    fn gpu_start(&self) -> GpuDescriptorHandle {
        GpuDescriptorHandle(self.0.gpu_base.unwrap_or_default())
    }

    fn increment_size(&self) -> u32 {
        self.0.increment
    }
}

/// All descriptor storage of a device: its shader-visible heaps and one growable CPU-only heap that views and
/// samplers are created in before being copied into a shader-visible heap.
///
/// Staging descriptors are immutable values, so identical views share one slot. The staging heaps grow with the
/// number of distinct views created over the lifetime of the device.
#[derive(Debug)]
pub(crate) struct DescriptorStore {
    heaps: Vec<Weak<HeapStorage>>,
    staging_views: Arc<HeapStorage>,
    staging_samplers: Arc<HeapStorage>,
    staged: HashMap<Descriptor, CpuDescriptorHandle>,
    next_cpu: u64,
    next_gpu: u64,
}

impl DescriptorStore {
    pub fn new(view_increment: u32, sampler_increment: u32) -> Self {
        let staging = |ty, increment, cpu_base| {
            Arc::new(HeapStorage {
                ty,
                capacity: (STAGING_RANGE / u64::from(increment)).min(u64::from(u32::MAX)) as u32,
                increment,
                cpu_base,
                gpu_base: None,
                slots: Mutex::new(vec![]),
            })
        };
        Self {
            heaps: vec![],
            staging_views: staging(DescriptorHeapType::View, view_increment.max(1), CPU_HANDLE_BASE),
            staging_samplers: staging(DescriptorHeapType::Sampler, sampler_increment.max(1), CPU_HANDLE_BASE + STAGING_RANGE),
            staged: HashMap::new(),
            next_cpu: CPU_HANDLE_BASE + 2 * STAGING_RANGE,
            next_gpu: GPU_HANDLE_BASE,
        }
    }

    pub fn create_heap(&mut self, ty: DescriptorHeapType, capacity: u32, increment: u32) -> HeadlessDescriptorHeap {
        let increment = increment.max(1);
        // Leave a gap between heaps so that running off the end of one never lands in the next.
        let range = (u64::from(capacity) + 1) * u64::from(increment);
        let range = range.next_power_of_two().max(0x1_0000);
        let storage = Arc::new(HeapStorage {
            ty,
            capacity,
            increment,
            cpu_base: self.next_cpu,
            gpu_base: Some(self.next_gpu),
            slots: Mutex::new(vec![Descriptor::Null; capacity as usize]),
        });
        self.next_cpu += range;
        self.next_gpu += range;
        self.heaps.retain(|heap| heap.strong_count() > 0);
        self.heaps.push(Arc::downgrade(&storage));
        HeadlessDescriptorHeap(storage)
    }

    pub fn create_staging(&mut self, descriptor: Descriptor) -> CpuDescriptorHandle {
        if let Some(handle) = self.staged.get(&descriptor) {
            return *handle;
        }
        let staging = match descriptor.heap_type() {
            Some(DescriptorHeapType::Sampler) => &self.staging_samplers,
            _ => &self.staging_views,
        };
        let handle = {
            let mut slots = staging.lock();
            slots.push(descriptor);
            CpuDescriptorHandle(staging.cpu_base).offset(slots.len() as u32 - 1, staging.increment)
        };
        self.staged.insert(descriptor, handle);
        handle
    }

    fn live_heaps(&self) -> impl Iterator<Item = Arc<HeapStorage>> + '_ {
        self.heaps
            .iter()
            .filter_map(Weak::upgrade)
            .chain([self.staging_views.clone(), self.staging_samplers.clone()])
    }

    fn find_cpu(&self, handle: CpuDescriptorHandle) -> Option<(Arc<HeapStorage>, usize)> {
        self.live_heaps()
            .find_map(|heap| heap.cpu_slot(handle).map(|slot| (heap, slot)))
    }

    pub fn read_cpu(&self, handle: CpuDescriptorHandle) -> Option<Descriptor> {
        let (heap, slot) = self.find_cpu(handle)?;
        let slots = heap.lock();
        slots.get(slot).copied()
    }

    /// Descriptor `index` entries after `handle`. Reads never leave the heap `handle` points into.
    pub fn read_gpu(&self, handle: GpuDescriptorHandle, index: u32) -> Option<Descriptor> {
        let (heap, slot) = self
            .live_heaps()
            .find_map(|heap| heap.gpu_slot(handle).map(|slot| (heap, slot)))?;
        let slots = heap.lock();
        slots.get(slot + index as usize).copied()
    }

    pub fn write(&self, handle: CpuDescriptorHandle, descriptor: Descriptor) -> Result<()> {
        let Some((heap, slot)) = self.find_cpu(handle) else {
            bail!(Error::Uncategorized("descriptor handle does not point into a live heap"));
        };
        if heap.gpu_base.is_none() {
            bail!(Error::Uncategorized("descriptors can only be written into shader-visible heaps"));
        }
        if descriptor.heap_type().is_some_and(|ty| ty != heap.ty) {
            bail!(Error::Uncategorized("descriptor type does not match the heap type"));
        }
        let mut slots = heap.lock();
        match slots.get_mut(slot) {
            Some(dst) => *dst = descriptor,
            None => bail!(Error::Uncategorized("descriptor handle is out of range")),
        }
        Ok(())
    }
}
