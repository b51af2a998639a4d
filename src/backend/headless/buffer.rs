//! Buffers of the headless backend: byte vectors at stable fake device addresses.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use ash::vk;

use crate::{Error, GpuBuffer, MemoryType};

/// Allocation counters shared by a device and its buffers.
#[derive(Debug, Default)]
pub(crate) struct MemoryStats {
    pub allocated: AtomicU64,
    pub buffers: AtomicUsize,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct BufferStorage {
    pub name: String,
    pub address: vk::DeviceAddress,
    pub size: vk::DeviceSize,
    pub stride: vk::DeviceSize,
    pub memory_type: MemoryType,
    #[derivative(Debug = "ignore")]
    pub data: Mutex<Vec<u8>>,
    #[derivative(Debug = "ignore")]
    pub stats: Arc<MemoryStats>,
}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying buffer {} at {:#x}", self.name, self.address);
        self.stats.allocated.fetch_sub(self.size, Ordering::Relaxed);
        self.stats.buffers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A buffer of the headless backend. Clones share the same memory, which is released when the last clone drops.
#[derive(Debug, Clone)]
pub struct HeadlessBuffer(pub(crate) Arc<BufferStorage>);

/// CPU mapping of a [`HeadlessBuffer`]. The buffer is locked until the mapping drops.
pub struct Mapping<'a>(MutexGuard<'a, Vec<u8>>);

impl Deref for Mapping<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0.as_slice()
    }
}

impl DerefMut for Mapping<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut_slice()
    }
}

impl HeadlessBuffer {
    /// Debug name given at creation
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Whether `other` refers to the same memory
    pub fn same_buffer(&self, other: &HeadlessBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Copy of the buffer contents, regardless of memory type. GPU-only memory is not mappable, this is how tests
    /// look inside it.
    pub fn read_raw(&self) -> Vec<u8> {
        self.lock().clone()
    }

    // Device side access. A panicking shader closure must not make the memory unreachable.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GpuBuffer for HeadlessBuffer {
    type Mapping<'a> = Mapping<'a>;

    fn address(&self) -> vk::DeviceAddress {
        self.0.address
    }

    fn size(&self) -> vk::DeviceSize {
        self.0.size
    }

    fn stride(&self) -> vk::DeviceSize {
        self.0.stride
    }

    fn memory_type(&self) -> MemoryType {
        self.0.memory_type
    }

    fn map(&self) -> Result<Self::Mapping<'_>> {
        if !self.0.memory_type.is_mappable() {
            bail!(Error::UnmappableBuffer);
        }
        let guard = self.0.data.lock().map_err(|_| Error::PoisonError)?;
        Ok(Mapping(guard))
    }
}
