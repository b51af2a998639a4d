//! Queues of the headless backend and the executor that runs submitted commands.
//!
//! Submitted work sits in per-queue command lists until the caller blocks in
//! [`Device::wait_idle()`](crate::Device::wait_idle) or [`Device::wait_for_fence()`](crate::Device::wait_for_fence).
//! Queues then run in turns, each one until it blocks on a fence wait or runs empty. If no queue can make progress
//! while work is left, the queues are deadlocked.
//!
//! Commands hold device addresses, not buffers. Memory freed before the command executes is reported through the
//! log and the command is skipped, like a GPU reading freed memory.

use std::collections::VecDeque;

use anyhow::{bail, Result};
use ash::vk;
use glam::{Affine3A, Vec3};

use crate::backend::headless::accel_format::{compacted_size, f32_at, Header, Primitive, PrimitiveRecord, HEADER_SIZE, RECORD_SIZE};
use crate::backend::headless::pipeline::{dispatch_rays, HeadlessPipeline};
use crate::backend::headless::stream::HeadlessFence;
use crate::backend::headless::HeadlessDevice;
use crate::descriptor::global_set::GlobalBinding;
use crate::pipeline::shader_table::DispatchRaysDesc;
use crate::util::transform::TransformMatrix;
use crate::{AccelerationStructureType, Error, Fence, QueueType};

/// Geometry of a bottom level build with buffer addresses resolved at record time.
#[derive(Debug, Clone)]
pub(crate) enum ResolvedGeometry {
    Triangles {
        vertices: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        vertex_count: u32,
        vertex_format: vk::Format,
        indices: Option<vk::DeviceAddress>,
        index_count: u32,
        index_type: vk::IndexType,
        transform: Option<vk::DeviceAddress>,
        flags: vk::GeometryFlagsKHR,
    },
    Aabbs {
        address: vk::DeviceAddress,
        stride: vk::DeviceSize,
        count: u32,
        flags: vk::GeometryFlagsKHR,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct BuildJob {
    pub ty: AccelerationStructureType,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub update: bool,
    pub dst: vk::DeviceAddress,
    pub result_size: vk::DeviceSize,
    pub scratch: vk::DeviceAddress,
    pub scratch_size: vk::DeviceSize,
    pub geometries: Vec<ResolvedGeometry>,
    pub instances: Option<(vk::DeviceAddress, u32)>,
    pub postbuild_info: Option<vk::DeviceAddress>,
}

#[derive(Debug, Clone)]
pub(crate) enum Command {
    BeginSubmission,
    Build(BuildJob),
    CopyAccelerationStructure {
        dst: vk::DeviceAddress,
        src: vk::DeviceAddress,
        mode: vk::CopyAccelerationStructureModeKHR,
    },
    CopyBuffer {
        dst: vk::DeviceAddress,
        src: vk::DeviceAddress,
        size: vk::DeviceSize,
    },
    SetPipeline(HeadlessPipeline),
    SetGlobalRoot(GlobalBinding),
    DispatchRays(DispatchRaysDesc),
    SignalFence {
        fence: HeadlessFence,
        value: u64,
    },
    WaitFence {
        fence: HeadlessFence,
        value: u64,
    },
}

#[derive(Debug, Default)]
struct QueueState {
    commands: VecDeque<Command>,
    pipeline: Option<HeadlessPipeline>,
    root: Option<GlobalBinding>,
}

#[derive(Debug, Default)]
pub(crate) struct Queues {
    graphics: QueueState,
    compute: QueueState,
}

impl Queues {
    fn get_mut(&mut self, queue: QueueType) -> &mut QueueState {
        match queue {
            QueueType::Graphics => &mut self.graphics,
            QueueType::Compute => &mut self.compute,
        }
    }

    pub fn submit(&mut self, queue: QueueType, commands: Vec<Command>) {
        let state = self.get_mut(queue);
        state.commands.push_back(Command::BeginSubmission);
        state.commands.extend(commands);
    }

    pub fn pending(&self) -> usize {
        self.graphics.commands.len() + self.compute.commands.len()
    }
}

enum Step {
    Blocked,
    Run(Command, Option<HeadlessPipeline>, Option<GlobalBinding>),
}

fn next_command(device: &HeadlessDevice, queue: QueueType) -> Step {
    let mut queues = device.queues();
    let state = queues.get_mut(queue);
    match state.commands.front() {
        None => return Step::Blocked,
        Some(Command::WaitFence {
            fence,
            value,
        }) if fence.completed_value() < *value => return Step::Blocked,
        _ => {}
    }
    let Some(command) = state.commands.pop_front() else {
        return Step::Blocked;
    };
    match &command {
        Command::BeginSubmission => {
            state.pipeline = None;
            state.root = None;
        }
        Command::SetPipeline(pipeline) => state.pipeline = Some(pipeline.clone()),
        Command::SetGlobalRoot(root) => state.root = Some(root.clone()),
        _ => {}
    }
    Step::Run(command, state.pipeline.clone(), state.root.clone())
}

/// Run queued work until `done` returns true. Fails with [`Error::QueueDeadlock`] if work is stuck.
pub(crate) fn run_until(device: &HeadlessDevice, done: impl Fn() -> bool) -> Result<()> {
    let _execution = device.execution_lock();
    loop {
        if done() {
            return Ok(());
        }
        let mut progress = false;
        for queue in [QueueType::Compute, QueueType::Graphics] {
            while let Step::Run(command, pipeline, root) = next_command(device, queue) {
                progress = true;
                execute(device, queue, command, pipeline.as_ref(), root.as_ref());
            }
        }
        if done() {
            return Ok(());
        }
        // Either a queue waits on a fence nothing will signal, or the caller does.
        if !progress {
            bail!(Error::QueueDeadlock);
        }
    }
}

fn execute(
    device: &HeadlessDevice,
    queue: QueueType,
    command: Command,
    pipeline: Option<&HeadlessPipeline>,
    root: Option<&GlobalBinding>,
) {
    match command {
        Command::BeginSubmission | Command::SetPipeline(_) | Command::SetGlobalRoot(_) | Command::WaitFence { .. } => {}
        Command::Build(job) => build(device, &job),
        Command::CopyAccelerationStructure {
            dst,
            src,
            mode,
        } => copy_acceleration_structure(device, dst, src, mode),
        Command::CopyBuffer {
            dst,
            src,
            size,
        } => match device.read_memory(src, size) {
            Some(bytes) if device.write_memory(dst, &bytes) => {}
            _ => error!("Buffer copy of {size} bytes from {src:#x} to {dst:#x} touches unmapped memory"),
        },
        Command::DispatchRays(desc) => match (pipeline, root) {
            (Some(pipeline), Some(root)) => dispatch_rays(device, pipeline, root, &desc),
            _ => error!("Ray dispatch on the {queue:?} queue without a bound pipeline and global root"),
        },
        Command::SignalFence {
            fence,
            value,
        } => fence.signal(value),
    }
}

fn f16_to_f32(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = i32::from((bits >> 10) & 0x1f);
    let mantissa = f32::from(bits & 0x3ff);
    match exponent {
        0 => sign * mantissa * 2f32.powi(-24),
        0x1f if mantissa == 0.0 => sign * f32::INFINITY,
        0x1f => f32::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f32.powi(exponent - 15),
    }
}

fn read_vertex(device: &HeadlessDevice, address: vk::DeviceAddress, format: vk::Format) -> Option<Vec3> {
    let half = |bytes: &[u8], i: usize| f16_to_f32(u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]));
    match format {
        vk::Format::R32G32B32_SFLOAT | vk::Format::R32G32B32A32_SFLOAT => {
            let bytes = device.read_memory(address, 12)?;
            Some(Vec3::new(f32_at(&bytes, 0), f32_at(&bytes, 4), f32_at(&bytes, 8)))
        }
        vk::Format::R32G32_SFLOAT => {
            let bytes = device.read_memory(address, 8)?;
            Some(Vec3::new(f32_at(&bytes, 0), f32_at(&bytes, 4), 0.0))
        }
        vk::Format::R16G16B16A16_SFLOAT => {
            let bytes = device.read_memory(address, 6)?;
            Some(Vec3::new(half(&bytes, 0), half(&bytes, 1), half(&bytes, 2)))
        }
        vk::Format::R16G16_SFLOAT => {
            let bytes = device.read_memory(address, 4)?;
            Some(Vec3::new(half(&bytes, 0), half(&bytes, 1), 0.0))
        }
        _ => None,
    }
}

fn read_index(device: &HeadlessDevice, base: vk::DeviceAddress, i: u32, ty: vk::IndexType) -> Option<u32> {
    match ty {
        vk::IndexType::UINT16 => {
            let bytes = device.read_memory(base + u64::from(i) * 2, 2)?;
            Some(u32::from(u16::from_le_bytes([bytes[0], bytes[1]])))
        }
        vk::IndexType::UINT32 => {
            let bytes = device.read_memory(base + u64::from(i) * 4, 4)?;
            Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        _ => None,
    }
}

fn gather_primitives(device: &HeadlessDevice, geometries: &[ResolvedGeometry]) -> Option<Vec<PrimitiveRecord>> {
    let mut records = vec![];
    for (geometry_index, geometry) in geometries.iter().enumerate() {
        match *geometry {
            ResolvedGeometry::Triangles {
                vertices,
                vertex_stride,
                vertex_count,
                vertex_format,
                indices,
                index_count,
                index_type,
                transform,
                flags,
            } => {
                let transform = match transform {
                    None => Affine3A::IDENTITY,
                    Some(address) => {
                        let bytes = device.read_memory(address, 48)?;
                        let mut elements = [0.0f32; 12];
                        for (i, e) in elements.iter_mut().enumerate() {
                            *e = f32_at(&bytes, i * 4);
                        }
                        TransformMatrix::from_elements(&elements).to_affine()
                    }
                };
                let corner_count = if indices.is_some() { index_count } else { vertex_count };
                for primitive_index in 0..corner_count / 3 {
                    let mut corners = [Vec3::ZERO; 3];
                    for (corner, position) in corners.iter_mut().enumerate() {
                        let n = primitive_index * 3 + corner as u32;
                        let vertex = match indices {
                            Some(base) => read_index(device, base, n, index_type)?,
                            None => n,
                        };
                        if vertex >= vertex_count {
                            error!("Index {vertex} of geometry {geometry_index} is out of range ({vertex_count} vertices)");
                            return None;
                        }
                        let v = read_vertex(device, vertices + u64::from(vertex) * vertex_stride, vertex_format)?;
                        *position = transform.transform_point3(v);
                    }
                    records.push(PrimitiveRecord {
                        primitive: Primitive::Triangle(corners),
                        geometry_index: geometry_index as u32,
                        primitive_index,
                        flags,
                    });
                }
            }
            ResolvedGeometry::Aabbs {
                address,
                stride,
                count,
                flags,
            } => {
                for primitive_index in 0..count {
                    let bytes = device.read_memory(address + u64::from(primitive_index) * stride, 24)?;
                    let v = |i: usize| Vec3::new(f32_at(&bytes, i * 4), f32_at(&bytes, i * 4 + 4), f32_at(&bytes, i * 4 + 8));
                    records.push(PrimitiveRecord {
                        primitive: Primitive::Aabb {
                            min: v(0),
                            max: v(3),
                        },
                        geometry_index: geometry_index as u32,
                        primitive_index,
                        flags,
                    });
                }
            }
        }
    }
    Some(records)
}

fn build(device: &HeadlessDevice, job: &BuildJob) {
    let Some((dst, dst_offset)) = device.resolve(job.dst) else {
        error!("Acceleration structure build into unmapped memory at {:#x}", job.dst);
        return;
    };
    let capacity = dst.0.size - dst_offset;
    if !job.update && capacity < job.result_size {
        error!("Acceleration structure build needs {} bytes, the result buffer has {capacity}", job.result_size);
        return;
    }
    match device.resolve(job.scratch) {
        Some((scratch, offset)) if scratch.0.size - offset >= job.scratch_size => {
            let mut data = scratch.lock();
            data[offset as usize..(offset + job.scratch_size) as usize].fill(0xa5);
        }
        _ => {
            error!("Acceleration structure build without {} bytes of scratch memory at {:#x}", job.scratch_size, job.scratch);
            return;
        }
    }

    let mut payload = vec![];
    let count = match job.ty {
        AccelerationStructureType::BottomLevel => {
            let Some(records) = gather_primitives(device, &job.geometries) else {
                error!("Bottom level build reads unmapped geometry memory");
                return;
            };
            for record in &records {
                let mut bytes = [0u8; RECORD_SIZE];
                record.write(&mut bytes);
                payload.extend_from_slice(&bytes);
            }
            records.len() as u32
        }
        AccelerationStructureType::TopLevel => {
            let Some((address, count)) = job.instances else {
                error!("Top level build without instances");
                return;
            };
            let Some(bytes) = device.read_memory(address, u64::from(count) * RECORD_SIZE as u64) else {
                error!("Top level build reads unmapped instance memory at {address:#x}");
                return;
            };
            payload = bytes;
            count
        }
    };

    if job.update {
        let existing = device.read_memory(job.dst, HEADER_SIZE as u64).and_then(|bytes| Header::read(&bytes));
        match existing {
            Some(header)
                if header.count == count
                    && header.ty == job.ty
                    && header.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE) => {}
            _ => {
                error!("Acceleration structure update at {:#x} does not match the previous build", job.dst);
                return;
            }
        }
    }

    let header = Header::new(job.ty, job.flags, count);
    if header.used > capacity {
        error!("Acceleration structure needs {} bytes, the result buffer has {capacity}", header.used);
        return;
    }
    let mut bytes = vec![0u8; HEADER_SIZE];
    header.write(&mut bytes);
    bytes.extend_from_slice(&payload);
    device.write_memory(job.dst, &bytes);

    if let Some(info) = job.postbuild_info {
        if !device.write_memory(info, &compacted_size(count).to_le_bytes()) {
            error!("Compacted size written to unmapped memory at {info:#x}");
        }
    }
}

fn copy_acceleration_structure(
    device: &HeadlessDevice,
    dst: vk::DeviceAddress,
    src: vk::DeviceAddress,
    mode: vk::CopyAccelerationStructureModeKHR,
) {
    let Some(header) = device.read_memory(src, HEADER_SIZE as u64).and_then(|bytes| Header::read(&bytes)) else {
        error!("Acceleration structure copy from {src:#x}, which holds no acceleration structure");
        return;
    };
    if mode != vk::CopyAccelerationStructureModeKHR::COMPACT && mode != vk::CopyAccelerationStructureModeKHR::CLONE {
        error!("Unsupported acceleration structure copy mode {mode:?}");
        return;
    }
    let Some(bytes) = device.read_memory(src, header.used) else {
        error!("Acceleration structure at {src:#x} is truncated");
        return;
    };
    if !device.write_memory(dst, &bytes) {
        error!("Acceleration structure copy of {} bytes does not fit at {dst:#x}", header.used);
    }
}
