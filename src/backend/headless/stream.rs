//! Command streams and fences of the headless backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use ash::vk;

use crate::backend::headless::pipeline::HeadlessPipeline;
use crate::backend::headless::queue::{BuildJob, Command, ResolvedGeometry};
use crate::backend::headless::{HeadlessBuffer, HeadlessDevice};
use crate::descriptor::global_set::GlobalBinding;
use crate::pipeline::root_signature::RootSignature;
use crate::pipeline::shader_table::DispatchRaysDesc;
use crate::{BuildCommand, CommandStream, Error, Fence, GeometryDescriptor, GpuBuffer, QueueType, ResourceState};

#[derive(Debug)]
struct FenceInner {
    id: u64,
    value: AtomicU64,
}

/// A monotonic fence. Clones refer to the same fence.
#[derive(Debug, Clone)]
pub struct HeadlessFence(Arc<FenceInner>);

impl HeadlessFence {
    pub(crate) fn new(id: u64) -> Self {
        Self(Arc::new(FenceInner {
            id,
            value: AtomicU64::new(0),
        }))
    }

    pub(crate) fn signal(&self, value: u64) {
        self.0.value.fetch_max(value, Ordering::AcqRel);
    }

    /// Unique id of this fence, for log messages
    pub fn id(&self) -> u64 {
        self.0.id
    }
}

impl Fence for HeadlessFence {
    fn completed_value(&self) -> u64 {
        self.0.value.load(Ordering::Acquire)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum StreamState {
    Recording,
    Closed,
}

/// Records commands for one queue of a [`HeadlessDevice`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct HeadlessCommandStream {
    #[derivative(Debug = "ignore")]
    device: HeadlessDevice,
    queue: QueueType,
    state: StreamState,
    commands: Vec<Command>,
    barriers: usize,
    pipeline_bound: bool,
    root_bound: bool,
}

fn resolve_geometry(geometry: &GeometryDescriptor<HeadlessBuffer>) -> ResolvedGeometry {
    match geometry {
        GeometryDescriptor::Triangles(triangles) => ResolvedGeometry::Triangles {
            vertices: triangles.vertex_buffer.address() + triangles.vertex_offset,
            vertex_stride: triangles.vertex_stride,
            vertex_count: triangles.vertex_count,
            vertex_format: triangles.vertex_format,
            indices: triangles
                .index_buffer
                .as_ref()
                .map(|buffer| buffer.address() + triangles.index_offset),
            index_count: triangles.index_count,
            index_type: triangles.index_type,
            transform: triangles
                .transform_buffer
                .as_ref()
                .map(|buffer| buffer.address() + triangles.transform_offset),
            flags: triangles.flags,
        },
        GeometryDescriptor::Aabbs(aabbs) => ResolvedGeometry::Aabbs {
            address: aabbs.buffer.address() + aabbs.offset,
            stride: aabbs.stride,
            count: aabbs.count,
            flags: aabbs.flags,
        },
    }
}

impl HeadlessCommandStream {
    pub(crate) fn new(device: HeadlessDevice, queue: QueueType) -> Self {
        Self {
            device,
            queue,
            state: StreamState::Recording,
            commands: vec![],
            barriers: 0,
            pipeline_bound: false,
            root_bound: false,
        }
    }

    fn record(&mut self, command: Command) -> Result<()> {
        if self.state != StreamState::Recording {
            bail!(Error::InvalidStreamState("stream is closed, reset it before recording"));
        }
        self.commands.push(command);
        Ok(())
    }

    /// Number of barriers recorded since the last reset
    pub fn barrier_count(&self) -> usize {
        self.barriers
    }

    /// Number of commands recorded since the last reset or submission
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    /// Whether the stream is closed
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

impl CommandStream for HeadlessCommandStream {
    type Buffer = HeadlessBuffer;
    type Fence = HeadlessFence;
    type Pipeline = HeadlessPipeline;

    fn queue_type(&self) -> QueueType {
        self.queue
    }

    fn reset(&mut self) -> Result<()> {
        self.commands.clear();
        self.barriers = 0;
        self.pipeline_bound = false;
        self.root_bound = false;
        self.state = StreamState::Recording;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            bail!(Error::InvalidStreamState("stream is already closed"));
        }
        self.state = StreamState::Closed;
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        if self.state != StreamState::Closed {
            bail!(Error::InvalidStreamState("close the stream before executing it"));
        }
        let commands = std::mem::take(&mut self.commands);
        debug!("Submitting {} commands to the {:?} queue", commands.len(), self.queue);
        self.device.queues().submit(self.queue, commands);
        Ok(())
    }

    fn transition_barrier(&mut self, _buffer: &HeadlessBuffer, before: ResourceState, after: ResourceState) -> Result<()> {
        if self.state != StreamState::Recording {
            bail!(Error::InvalidStreamState("stream is closed, reset it before recording"));
        }
        if before == after {
            warn!("Transition barrier from {before:?} to the same state");
        }
        self.barriers += 1;
        Ok(())
    }

    fn uav_barrier(&mut self, _buffer: &HeadlessBuffer) -> Result<()> {
        if self.state != StreamState::Recording {
            bail!(Error::InvalidStreamState("stream is closed, reset it before recording"));
        }
        self.barriers += 1;
        Ok(())
    }

    fn build_acceleration_structure(&mut self, cmd: &BuildCommand<'_, HeadlessBuffer>) -> Result<()> {
        let input = cmd.input;
        let job = BuildJob {
            ty: input.ty(),
            flags: input.flags(),
            update: input.is_update(),
            dst: cmd.dst.address(),
            result_size: input.sizes().size,
            scratch: cmd.scratch.address(),
            scratch_size: input.required_scratch_size(),
            geometries: input.geometries().iter().map(resolve_geometry).collect(),
            instances: cmd.instances.map(|buffer| (buffer.address(), input.instance_count())),
            postbuild_info: cmd.postbuild_info.map(|buffer| buffer.address()),
        };
        if let Some(src) = cmd.src {
            if src.address() != job.dst {
                bail!(Error::InvalidUpdate("updates must happen in place"));
            }
        }
        self.record(Command::Build(job))
    }

    fn copy_acceleration_structure(
        &mut self,
        dst: &HeadlessBuffer,
        src: &HeadlessBuffer,
        mode: vk::CopyAccelerationStructureModeKHR,
    ) -> Result<()> {
        self.record(Command::CopyAccelerationStructure {
            dst: dst.address(),
            src: src.address(),
            mode,
        })
    }

    fn copy_buffer(&mut self, dst: &HeadlessBuffer, src: &HeadlessBuffer, size: vk::DeviceSize) -> Result<()> {
        if size > dst.size() || size > src.size() {
            bail!(Error::BufferOutOfRange);
        }
        self.record(Command::CopyBuffer {
            dst: dst.address(),
            src: src.address(),
            size,
        })
    }

    fn set_pipeline(&mut self, pipeline: &HeadlessPipeline) -> Result<()> {
        self.record(Command::SetPipeline(pipeline.clone()))?;
        self.pipeline_bound = true;
        Ok(())
    }

    fn set_ray_tracing_global_root(&mut self, root: &RootSignature, binding: &GlobalBinding) -> Result<()> {
        root.validate_binding(binding)?;
        self.record(Command::SetGlobalRoot(binding.clone()))?;
        self.root_bound = true;
        Ok(())
    }

    fn dispatch_rays(&mut self, desc: &DispatchRaysDesc) -> Result<()> {
        if !self.pipeline_bound || !self.root_bound {
            bail!(Error::InvalidStreamState("bind a pipeline and a global root before dispatching rays"));
        }
        self.record(Command::DispatchRays(*desc))
    }

    fn signal_fence(&mut self, fence: &HeadlessFence, value: u64) -> Result<()> {
        self.record(Command::SignalFence {
            fence: fence.clone(),
            value,
        })
    }

    fn wait_fence(&mut self, fence: &HeadlessFence, value: u64) -> Result<()> {
        self.record(Command::WaitFence {
            fence: fence.clone(),
            value,
        })
    }
}
