use anyhow::Result;
use glam::Vec3;

use deimos::backend::headless::{
    HeadlessBuffer, HeadlessCommandStream, HeadlessDevice, HeadlessPipeline, HeadlessPipelineBuilder, Ray, ShaderContext,
    TraceRay,
};
use deimos::resource::buffer::read_f32;
use deimos::{
    create_ray_tracing_root_signatures, vk, BottomLevelStructure, BuildInput, CommandStream, DescriptorHeapLayout,
    DescriptorHeapManager, DescriptorHeapType, DescriptorRangeType, Device, DispatchRaysDesc, Error, Fence, GlobalDescriptorSet, Instance,
    LocalSlotLayout, QueueType, ShaderTableBuilder, TopLevelStructure, TransformMatrix,
};

mod framework;

const FAST_TRACE: vk::BuildAccelerationStructureFlagsKHR = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
const MISS_VALUE: f32 = -1.0;

fn execute(device: &HeadlessDevice, queue: QueueType, record: impl FnOnce(&mut HeadlessCommandStream) -> Result<()>) -> Result<()> {
    let mut stream = device.create_command_stream(queue)?;
    record(&mut stream)?;
    stream.close()?;
    stream.execute()?;
    device.wait_idle()
}

fn build_quad(device: &HeadlessDevice) -> Result<BottomLevelStructure<HeadlessDevice>> {
    build_quad_with(device, FAST_TRACE)
}

fn build_quad_with(device: &HeadlessDevice, flags: vk::BuildAccelerationStructureFlagsKHR) -> Result<BottomLevelStructure<HeadlessDevice>> {
    let input = BuildInput::bottom(device, vec![framework::quad(device)?], flags)?;
    let mut blas = BottomLevelStructure::new(device.clone());
    blas.create_buffer_for(input.sizes())?;
    execute(device, QueueType::Compute, |stream| blas.build(stream, &input, true))?;
    Ok(blas)
}

fn build_scene(device: &HeadlessDevice, instances: &[Instance<'_, HeadlessDevice>]) -> Result<TopLevelStructure<HeadlessDevice>> {
    let input = BuildInput::top(device, instances.len() as u32, FAST_TRACE)?;
    let mut tlas = TopLevelStructure::new(device.clone());
    tlas.create_instance_buffer(instances)?;
    tlas.create_buffer_for(input.sizes())?;
    execute(device, QueueType::Compute, |stream| tlas.build(stream, &input, true))?;
    Ok(tlas)
}

/// Ray generation shader that shoots one ray per launch index straight down +z from `origins[x]` and stores the
/// first payload component into the global output.
fn tracing_pipeline(
    device: &HeadlessDevice,
    origins: Vec<Vec3>,
    hit_value: fn(&ShaderContext<'_>) -> Result<f32>,
) -> Result<HeadlessPipeline> {
    HeadlessPipelineBuilder::new("end to end")
        .ray_generation("raygen", move |ctx| {
            let x = ctx.launch_index().x;
            let mut payload = [0.0; 4];
            let ray = Ray::new(origins[x as usize], Vec3::Z);
            ctx.trace_ray(&TraceRay::new(ray), &mut payload)?;
            let output = ctx.global_descriptor(DescriptorRangeType::Uav, 0)?;
            ctx.store_f32(&output, x, payload[0])
        })
        .miss("miss", |_, payload| {
            payload[0] = MISS_VALUE;
            Ok(())
        })
        .hit_group("hit", move |ctx, _, payload| {
            payload[0] = hit_value(ctx)?;
            Ok(())
        })
        .build(device)
}

fn dispatch(
    device: &HeadlessDevice,
    pipeline: &HeadlessPipeline,
    tlas: &TopLevelStructure<HeadlessDevice>,
    output: &HeadlessBuffer,
    material_constants: &[HeadlessBuffer],
    width: u32,
) -> Result<()> {
    let local = LocalSlotLayout::default();
    let mut manager = DescriptorHeapManager::new(
        device.clone(),
        DescriptorHeapLayout::new()
            .acceleration_structures(1)
            .global(0, 0, 1, 0)
            .material_count(material_constants.len().max(1) as u32)
            .local(local),
    )?;
    let mut frame = manager.begin_new_frame();

    let mut material_tables = vec![];
    for constants in material_constants {
        let region = manager.increment_local_handle_start(&mut frame)?;
        device.copy_descriptors(
            DescriptorHeapType::View,
            region.view_cpu,
            &[device.create_constant_buffer_view(constants)],
        )?;
        material_tables.push(local.table_handles(&region, manager.view_descriptor_size()).to_vec());
    }
    let set = GlobalDescriptorSet::new().uav(device.create_unordered_access_view(output));
    let tlas_address = tlas.address().expect("Scene was built");
    let binding = manager.bind_global(&mut frame, &set, &[tlas_address])?;

    let exports = ShaderTableBuilder::new(device, pipeline, 0);
    let raygen = exports.build_exports("raygen", &["raygen"])?;
    let miss = exports.build_exports("miss", &["miss"])?;
    let material_count = material_tables.len().max(1) as u32;
    let hit = ShaderTableBuilder::new(device, pipeline, local_slot_count()).build_hit_groups(
        "hit groups",
        material_count,
        &["hit"],
        |material| Ok(material_tables.get(material as usize).cloned().unwrap_or_default()),
    )?;

    let (global_root, _) = create_ray_tracing_root_signatures(1, 0, 0, 1, 0, &local);
    execute(device, QueueType::Compute, |stream| {
        stream.set_pipeline(pipeline)?;
        stream.set_ray_tracing_global_root(&global_root, &binding)?;
        stream.dispatch_rays(&DispatchRaysDesc::new(&raygen, &miss, &hit, width, 1))
    })
}

fn local_slot_count() -> u32 {
    let (_, local) = create_ray_tracing_root_signatures(0, 0, 0, 0, 0, &LocalSlotLayout::default());
    local.slot_count()
}

#[test]
pub fn hit_and_miss() -> Result<()> {
    framework::init_logging();
    let device = framework::make_device()?;
    let blas = build_quad(&device)?;
    let tlas = build_scene(&device, &[Instance::new(&blas)])?;
    let output = framework::readback_buffer(&device, "output", 2)?;

    let origins = vec![Vec3::new(0.1, 0.3, -1.0), Vec3::new(3.0, 0.3, -1.0)];
    let pipeline = tracing_pipeline(&device, origins, |_| Ok(1.0))?;
    dispatch(&device, &pipeline, &tlas, &output, &[], 2)?;

    assert_eq!(read_f32(&output, 0, 2)?, vec![1.0, MISS_VALUE], "First ray hits the quad, the second misses");
    Ok(())
}

#[test]
pub fn materials_select_hit_group_records() -> Result<()> {
    framework::init_logging();
    let device = framework::make_device()?;
    let blas = build_quad(&device)?;
    let tlas = build_scene(
        &device,
        &[
            Instance::new(&blas).hit_group_offset(0),
            Instance::new(&blas)
                .transform(TransformMatrix::translation(4.0, 0.0, 0.0))
                .hit_group_offset(1),
        ],
    )?;
    let output = framework::readback_buffer(&device, "output", 3)?;
    let materials = [
        framework::upload_f32(&device, "material 0", &[10.0, 0.0, 0.0, 0.0])?,
        framework::upload_f32(&device, "material 1", &[20.0, 0.0, 0.0, 0.0])?,
    ];

    let origins = vec![Vec3::new(0.1, 0.3, -1.0), Vec3::new(4.1, 0.3, -1.0), Vec3::new(10.0, 0.3, -1.0)];
    let pipeline = tracing_pipeline(&device, origins, |ctx| {
        let constants = ctx.local_descriptor(0, 0)?;
        ctx.load_f32(&constants, 0)
    })?;
    dispatch(&device, &pipeline, &tlas, &output, &materials, 3)?;

    assert_eq!(
        read_f32(&output, 0, 3)?,
        vec![10.0, 20.0, MISS_VALUE],
        "Each instance should shade with the constants of its own material"
    );
    Ok(())
}

#[test]
pub fn instance_mask_hides_geometry() -> Result<()> {
    let device = framework::make_device()?;
    let blas = build_quad(&device)?;
    let tlas = build_scene(&device, &[Instance::new(&blas).mask(0x02)])?;
    let output = framework::readback_buffer(&device, "output", 1)?;

    let pipeline = HeadlessPipelineBuilder::new("masked")
        .ray_generation("raygen", |ctx| {
            let mut payload = [0.0; 4];
            let ray = Ray::new(Vec3::new(0.1, 0.3, -1.0), Vec3::Z);
            ctx.trace_ray(&TraceRay::new(ray).mask(0x01), &mut payload)?;
            let output = ctx.global_descriptor(DescriptorRangeType::Uav, 0)?;
            ctx.store_f32(&output, 0, payload[0])
        })
        .miss("miss", |_, payload| {
            payload[0] = MISS_VALUE;
            Ok(())
        })
        .hit_group("hit", |_, _, payload| {
            payload[0] = 1.0;
            Ok(())
        })
        .build(&device)?;
    dispatch(&device, &pipeline, &tlas, &output, &[], 1)?;

    assert_eq!(read_f32(&output, 0, 1)?, vec![MISS_VALUE], "Masked instance should not be hit");
    Ok(())
}

#[test]
pub fn hit_reports_closest_instance() -> Result<()> {
    let device = framework::make_device()?;
    let blas = build_quad(&device)?;
    let tlas = build_scene(
        &device,
        &[
            Instance::new(&blas).transform(TransformMatrix::translation(0.0, 0.0, 5.0)).id(7),
            Instance::new(&blas).transform(TransformMatrix::translation(0.0, 0.0, 2.0)).id(3),
        ],
    )?;
    let output = framework::readback_buffer(&device, "output", 2)?;

    let pipeline = HeadlessPipelineBuilder::new("closest")
        .ray_generation("raygen", |ctx| {
            let mut payload = [0.0; 4];
            let ray = Ray::new(Vec3::new(0.1, 0.3, -1.0), Vec3::Z);
            ctx.trace_ray(&TraceRay::new(ray), &mut payload)?;
            let output = ctx.global_descriptor(DescriptorRangeType::Uav, 0)?;
            ctx.store_f32(&output, 0, payload[0])?;
            ctx.store_f32(&output, 1, payload[1])
        })
        .miss("miss", |_, payload| {
            payload[0] = MISS_VALUE;
            Ok(())
        })
        .hit_group("hit", |_, hit, payload| {
            payload[0] = hit.instance_id as f32;
            payload[1] = hit.t;
            Ok(())
        })
        .build(&device)?;
    // Both instances use hit group record 0 or 1, give the table two records.
    let materials = [
        framework::upload_f32(&device, "material 0", &[0.0; 4])?,
        framework::upload_f32(&device, "material 1", &[0.0; 4])?,
    ];
    dispatch(&device, &pipeline, &tlas, &output, &materials, 1)?;

    let result = read_f32(&output, 0, 2)?;
    assert_eq!(result[0], 3.0, "Closer instance should be reported");
    assert!((result[1] - 3.0).abs() < 1e-5, "Hit distance should be 3, got {}", result[1]);
    Ok(())
}

#[test]
pub fn fences_order_queues() -> Result<()> {
    let device = framework::make_device()?;
    let source = framework::upload_f32(&device, "source", &[1.0, 2.0, 3.0, 4.0])?;
    let middle = framework::readback_buffer(&device, "middle", 4)?;
    let destination = framework::readback_buffer(&device, "destination", 4)?;
    let fence = device.create_fence()?;

    // The compute queue runs first, so without the wait it would copy zeros.
    let mut consumer = device.create_command_stream(QueueType::Compute)?;
    consumer.wait_fence(&fence, 1)?;
    consumer.copy_buffer(&destination, &middle, 16)?;
    consumer.signal_fence(&fence, 2)?;
    consumer.close()?;
    consumer.execute()?;

    let mut producer = device.create_command_stream(QueueType::Graphics)?;
    producer.copy_buffer(&middle, &source, 16)?;
    producer.signal_fence(&fence, 1)?;
    producer.close()?;
    producer.execute()?;

    assert_eq!(fence.completed_value(), 0, "Nothing runs before the CPU waits");
    device.wait_for_fence(&fence, 2)?;
    assert_eq!(fence.completed_value(), 2, "Consumer should have signaled");
    assert_eq!(read_f32(&destination, 0, 4)?, vec![1.0, 2.0, 3.0, 4.0], "Consumer should copy after the producer");
    assert_eq!(device.pending_commands(), 0, "All work should have executed");
    Ok(())
}

#[test]
pub fn unsignaled_fence_deadlocks() -> Result<()> {
    let device = framework::make_device()?;
    let fence = device.create_fence()?;

    let err = device.wait_for_fence(&fence, 1).expect_err("Nothing will ever signal the fence");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::QueueDeadlock)), "Expected a deadlock, got {err}");

    let mut stream = device.create_command_stream(QueueType::Graphics)?;
    stream.wait_fence(&fence, 1)?;
    stream.close()?;
    stream.execute()?;
    let err = device.wait_idle().expect_err("Queue waits on a fence nothing will signal");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::QueueDeadlock)), "Expected a deadlock, got {err}");
    Ok(())
}

#[test]
pub fn stream_state_is_checked() -> Result<()> {
    let device = framework::make_device()?;
    let mut stream = device.create_command_stream(QueueType::Compute)?;

    let err = stream.execute().expect_err("Open streams cannot execute");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidStreamState(_))), "Expected invalid state, got {err}");
    stream.close()?;
    let fence = device.create_fence()?;
    let err = stream.signal_fence(&fence, 1).expect_err("Closed streams cannot record");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidStreamState(_))), "Expected invalid state, got {err}");
    stream.reset()?;
    stream.signal_fence(&fence, 1)?;
    assert_eq!(stream.command_count(), 1, "Reset stream should record again");

    let pipeline = HeadlessPipelineBuilder::new("empty").build(&device)?;
    stream.set_pipeline(&pipeline)?;
    let err = stream
        .dispatch_rays(&DispatchRaysDesc::default())
        .expect_err("Dispatch without a global root should fail");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidStreamState(_))), "Expected invalid state, got {err}");
    Ok(())
}

#[test]
pub fn compaction_keeps_intersections() -> Result<()> {
    let device = framework::make_device()?;
    let mut blas = build_quad_with(&device, FAST_TRACE | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)?;

    // One ray per triangle of the quad and one that misses.
    let origins = [Vec3::new(0.5, -0.25, -1.0), Vec3::new(-0.25, 0.5, -1.0), Vec3::new(3.0, 0.3, -1.0)];
    let pipeline = HeadlessPipelineBuilder::new("compaction")
        .ray_generation("raygen", move |ctx| {
            let x = ctx.launch_index().x;
            let mut payload = [0.0; 4];
            ctx.trace_ray(&TraceRay::new(Ray::new(origins[x as usize], Vec3::Z)), &mut payload)?;
            let output = ctx.global_descriptor(DescriptorRangeType::Uav, 0)?;
            for (i, value) in payload.iter().enumerate() {
                ctx.store_f32(&output, x * 4 + i as u32, *value)?;
            }
            Ok(())
        })
        .miss("miss", |_, payload| {
            *payload = [MISS_VALUE; 4];
            Ok(())
        })
        .hit_group("hit", |_, hit, payload| {
            *payload = [hit.t, hit.primitive_index as f32, hit.barycentrics.x, hit.barycentrics.y];
            Ok(())
        })
        .build(&device)?;

    let before = framework::readback_buffer(&device, "before compaction", 12)?;
    let tlas = build_scene(&device, &[Instance::new(&blas)])?;
    dispatch(&device, &pipeline, &tlas, &before, &[], 3)?;

    let original_size = blas.size();
    blas.query_compacted_size()?.expect("Build executed, so the size is available");
    execute(&device, QueueType::Compute, |stream| blas.compact(stream, true))?;
    assert!(blas.size() < original_size, "Compaction should shrink the quad structure");

    let after = framework::readback_buffer(&device, "after compaction", 12)?;
    let tlas = build_scene(&device, &[Instance::new(&blas)])?;
    dispatch(&device, &pipeline, &tlas, &after, &[], 3)?;

    let before = read_f32(&before, 0, 12)?;
    assert_eq!(&before[8..], &[MISS_VALUE; 4], "Third ray misses the quad");
    assert_ne!(before[1], before[5], "The first two rays should hit different triangles");
    assert_eq!(read_f32(&after, 0, 12)?, before, "Compaction must not change intersection results");
    Ok(())
}
