//! Traits a graphics backend implements to be driven by deimos.
//!
//! deimos never talks to a graphics API directly. Acceleration structures, descriptor heap pages and shader tables
//! are written against these traits, and everything that crosses the seam uses the Vulkan vocabulary from [`ash::vk`].
//! The crate ships one implementation, the software [`headless`](crate::backend::headless) backend.

use std::fmt::Debug;
use std::ops::DerefMut;

use anyhow::Result;
use ash::vk;

use crate::core::properties::DeviceProperties;
use crate::descriptor::global_set::GlobalBinding;
use crate::descriptor::handle::{CpuDescriptorHandle, DescriptorHeapType, GpuDescriptorHandle};
use crate::pipeline::root_signature::RootSignature;
use crate::pipeline::shader_table::DispatchRaysDesc;
use crate::resource::buffer::BufferCreateInfo;
use crate::resource::raytracing::{AccelerationStructureBuildSize, BuildCommand, BuildInput};
use crate::util::deferred_delete::DeferredDelete;
use crate::MemoryType;

/// Queue a command stream submits to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// Graphics queue. Typically renders and dispatches rays.
    Graphics,
    /// Async compute queue. Typically builds acceleration structures for the next frame.
    Compute,
}

/// State of a buffer as seen by the GPU, used for transition barriers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Default state, allows implicit promotion.
    Common,
    /// Read and written by shaders or acceleration structure builds.
    UnorderedAccess,
    /// Source of a copy.
    CopySource,
    /// Destination of a copy.
    CopyDest,
    /// Acceleration structure storage.
    AccelerationStructure,
    /// Read by non-pixel shaders.
    ShaderResource,
    /// Any read-only state.
    GenericRead,
}

/// A GPU buffer with a stable device address. Clones are cheap and refer to the same memory.
pub trait GpuBuffer: Clone + Debug + Send + Sync + 'static {
    /// Guard returned by [`GpuBuffer::map()`]. Dropping it unmaps the buffer.
    type Mapping<'a>: DerefMut<Target = [u8]>
    where
        Self: 'a;

    /// Device address of the first byte of the buffer.
    fn address(&self) -> vk::DeviceAddress;
    /// Size of the buffer in bytes.
    fn size(&self) -> vk::DeviceSize;
    /// Element stride in bytes, zero for raw buffers.
    fn stride(&self) -> vk::DeviceSize;
    /// Where the buffer memory lives.
    fn memory_type(&self) -> MemoryType;
    /// Map the buffer for CPU access.
    /// # Errors
    /// * Fails with [`Error::UnmappableBuffer`](crate::Error::UnmappableBuffer) if the memory is not CPU visible.
    fn map(&self) -> Result<Self::Mapping<'_>>;
}

/// A shader-visible descriptor heap.
pub trait DescriptorHeap: Debug + Send + Sync {
    /// Kind of descriptors stored in this heap.
    fn heap_type(&self) -> DescriptorHeapType;
    /// Number of descriptors that fit in this heap.
    fn capacity(&self) -> u32;
    /// Handle used to write the first descriptor from the CPU.
    fn cpu_start(&self) -> CpuDescriptorHandle;
    /// Handle used to reference the first descriptor from shaders.
    fn gpu_start(&self) -> GpuDescriptorHandle;
    /// Byte distance between two consecutive descriptors.
    fn increment_size(&self) -> u32;
}

/// Monotonic GPU fence used to order work across queues.
pub trait Fence: Debug + Send + Sync {
    /// Highest value signaled so far.
    fn completed_value(&self) -> u64;
}

/// A command stream records GPU work for one queue. Nothing executes until [`CommandStream::execute()`] submits it,
/// and nothing recorded here blocks the caller.
pub trait CommandStream {
    /// Buffer type this stream references.
    type Buffer: GpuBuffer;
    /// Fence type used for cross-queue ordering.
    type Fence: Fence;
    /// Ray tracing pipeline state object.
    type Pipeline;

    /// Queue this stream submits to.
    fn queue_type(&self) -> QueueType;
    /// Discard all recorded commands and start recording again.
    fn reset(&mut self) -> Result<()>;
    /// Finish recording.
    fn close(&mut self) -> Result<()>;
    /// Submit the closed stream to its queue.
    fn execute(&mut self) -> Result<()>;

    /// Transition a buffer between two states.
    fn transition_barrier(&mut self, buffer: &Self::Buffer, before: ResourceState, after: ResourceState) -> Result<()>;
    /// Wait for all unordered access to a buffer to finish before later commands access it.
    fn uav_barrier(&mut self, buffer: &Self::Buffer) -> Result<()>;

    /// Build or update an acceleration structure.
    fn build_acceleration_structure(&mut self, cmd: &BuildCommand<'_, Self::Buffer>) -> Result<()>;
    /// Copy an acceleration structure, optionally compacting it.
    fn copy_acceleration_structure(
        &mut self,
        dst: &Self::Buffer,
        src: &Self::Buffer,
        mode: vk::CopyAccelerationStructureModeKHR,
    ) -> Result<()>;
    /// Copy `size` bytes from the start of `src` to the start of `dst`.
    fn copy_buffer(&mut self, dst: &Self::Buffer, src: &Self::Buffer, size: vk::DeviceSize) -> Result<()>;

    /// Bind a ray tracing pipeline for subsequent dispatches.
    fn set_pipeline(&mut self, pipeline: &Self::Pipeline) -> Result<()>;
    /// Bind the global root signature and its descriptor tables.
    fn set_ray_tracing_global_root(&mut self, root: &RootSignature, binding: &GlobalBinding) -> Result<()>;
    /// Launch rays.
    fn dispatch_rays(&mut self, desc: &DispatchRaysDesc) -> Result<()>;

    /// Signal `fence` to `value` once all previously recorded work completes.
    fn signal_fence(&mut self, fence: &Self::Fence, value: u64) -> Result<()>;
    /// Stall this queue until `fence` reaches `value`.
    fn wait_fence(&mut self, fence: &Self::Fence, value: u64) -> Result<()>;
}

/// A ray tracing capable device.
pub trait Device: Clone + Debug + Send + Sync {
    /// Buffer type.
    type Buffer: GpuBuffer;
    /// Descriptor heap type.
    type DescriptorHeap: DescriptorHeap;
    /// Fence type.
    type Fence: Fence;
    /// Ray tracing pipeline state object.
    type Pipeline;
    /// Command stream type.
    type CommandStream: CommandStream<Buffer = Self::Buffer, Fence = Self::Fence, Pipeline = Self::Pipeline>;

    /// Backend-fixed constants.
    fn properties(&self) -> &DeviceProperties;
    /// Allocate a buffer.
    /// # Errors
    /// * Fails with [`Error::AllocationFailure`](crate::Error::AllocationFailure) when memory is exhausted.
    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<Self::Buffer>;
    /// Query the result and scratch sizes needed to build `input`.
    fn query_prebuild_info(&self, input: &BuildInput<Self::Buffer>) -> Result<AccelerationStructureBuildSize>;
    /// Create a shader-visible descriptor heap.
    fn create_descriptor_heap(&self, ty: DescriptorHeapType, capacity: u32) -> Result<Self::DescriptorHeap>;
    /// Copy descriptors one after another into the contiguous range starting at `dst`.
    fn copy_descriptors(&self, ty: DescriptorHeapType, dst: CpuDescriptorHandle, src: &[CpuDescriptorHandle]) -> Result<()>;
    /// Write an acceleration structure view at `dst`.
    fn write_acceleration_structure_view(&self, dst: CpuDescriptorHandle, address: vk::DeviceAddress) -> Result<()>;
    /// Create a command stream recording for `queue`.
    fn create_command_stream(&self, queue: QueueType) -> Result<Self::CommandStream>;
    /// Create a fence with initial value zero.
    fn create_fence(&self) -> Result<Self::Fence>;
    /// Block until all submitted work finished.
    fn wait_idle(&self) -> Result<()>;
    /// Block until `fence` reaches `value`.
    fn wait_for_fence(&self, fence: &Self::Fence, value: u64) -> Result<()>;
    /// The N-frame deferred deletion facility of this device.
    fn deferred_delete(&self) -> &DeferredDelete;
}
