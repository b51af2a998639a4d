use anyhow::Result;

use deimos::backend::headless::{Descriptor, HeadlessDevice};
use deimos::{
    create_ray_tracing_root_signatures, vk, DescriptorHeap, DescriptorHeapLayout, DescriptorHeapManager, DescriptorRangeType,
    Device, Error, GlobalDescriptorSet, GpuBuffer, LocalSlotLayout, RootParameter,
};

mod framework;

fn make_manager(device: &HeadlessDevice, material_count: u32) -> Result<DescriptorHeapManager<HeadlessDevice>> {
    DescriptorHeapManager::initialize(device.clone(), 3, 1, 2, 3, 1, 1, material_count)
}

fn is_region_error(err: &anyhow::Error, expected_kind: &str) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::DescriptorRegionExhausted { kind, .. }) if *kind == expected_kind)
}

#[test]
pub fn page_capacity() -> Result<()> {
    let device = framework::make_device()?;
    let manager = make_manager(&device, 10)?;

    // 3 frames * (1 + 2 + 3 + 1) global views + 10 materials * 5 local views
    assert_eq!(manager.layout().view_capacity(), 71, "View heap capacity is wrong");
    // 3 frames * 1 global sampler + 10 materials * 1 local sampler
    assert_eq!(manager.layout().sampler_capacity(), 13, "Sampler heap capacity is wrong");
    assert_eq!(manager.page().view_heap().capacity(), 71, "View heap should be allocated with the layout capacity");
    assert_eq!(manager.page().sampler_heap().capacity(), 13, "Sampler heap should be allocated with the layout capacity");
    assert_eq!(
        manager.view_descriptor_size(),
        device.properties().view_descriptor_size,
        "View increment should come from the device"
    );
    Ok(())
}

#[test]
pub fn zero_frames_is_rejected() -> Result<()> {
    let device = framework::make_device()?;
    let result = DescriptorHeapManager::new(device, DescriptorHeapLayout::new().frame_count(0));
    assert!(result.is_err(), "A layout without frames should be rejected");
    Ok(())
}

#[test]
pub fn local_regions_are_disjoint() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = make_manager(&device, 10)?;
    let local = LocalSlotLayout::default();
    let view_size = u64::from(manager.view_descriptor_size());
    let sampler_size = u64::from(manager.sampler_descriptor_size());
    let view_start = manager.page().view_heap().cpu_start().0;
    let view_end = view_start + 71 * view_size;

    let mut frame = manager.begin_new_frame();
    let mut regions = vec![];
    for _ in 0..10 {
        regions.push(manager.increment_local_handle_start(&mut frame)?);
    }
    assert_eq!(frame.local_regions_used(), 10, "All local regions should be taken");

    for pair in regions.windows(2) {
        assert!(pair[0].view_cpu < pair[1].view_cpu, "Local view regions should be increasing");
        assert!(pair[0].sampler_gpu < pair[1].sampler_gpu, "Local sampler regions should be increasing");
        assert_eq!(
            pair[1].view_cpu.0 - pair[0].view_cpu.0,
            u64::from(local.view_count()) * view_size,
            "Local view regions should be packed without overlap"
        );
        assert_eq!(
            pair[1].sampler_cpu.0 - pair[0].sampler_cpu.0,
            u64::from(local.sampler_count()) * sampler_size,
            "Local sampler regions should be packed without overlap"
        );
    }
    let last = regions.last().expect("Ten regions were taken");
    assert!(
        last.view_cpu.0 + u64::from(local.view_count()) * view_size <= view_end,
        "Last local region should end inside the view heap"
    );

    let err = manager
        .increment_local_handle_start(&mut frame)
        .expect_err("Eleventh local region should not exist");
    assert!(is_region_error(&err, "local"), "Expected local region exhaustion, got {err}");
    Ok(())
}

#[test]
pub fn global_regions_rotate_per_frame() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = make_manager(&device, 2)?;

    let mut starts = vec![];
    for _ in 0..4 {
        let mut frame = manager.begin_new_frame();
        starts.push(manager.increment_global_handle_start(&mut frame)?);
        let err = manager
            .increment_global_handle_start(&mut frame)
            .expect_err("Only one global region per frame is reserved");
        assert!(is_region_error(&err, "global"), "Expected global region exhaustion, got {err}");
    }

    assert_ne!(starts[0], starts[1], "Consecutive frames should use different global regions");
    assert_ne!(starts[1], starts[2], "Consecutive frames should use different global regions");
    assert_eq!(starts[0], starts[3], "Frame slots should repeat after frame_count frames");
    for pair in starts[..3].windows(2) {
        assert_eq!(
            pair[1].view_cpu.0 - pair[0].view_cpu.0,
            7 * u64::from(manager.view_descriptor_size()),
            "Global regions should hold seven views each"
        );
    }
    Ok(())
}

#[test]
pub fn stale_frame_context_is_rejected() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = make_manager(&device, 2)?;

    let mut old = manager.begin_new_frame();
    let mut current = manager.begin_new_frame();
    let err = manager
        .increment_local_handle_start(&mut old)
        .expect_err("Token of a previous frame should be rejected");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::StaleFrameContext)), "Expected stale frame, got {err}");
    assert_eq!(old.local_regions_used(), 0, "Rejected call should not move the cursor");

    manager.increment_local_handle_start(&mut current)?;
    assert_eq!(current.frame_index(), 2, "Second token belongs to frame 2");
    Ok(())
}

#[test]
pub fn resize_retires_page_for_frame_count_frames() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = make_manager(&device, 2)?;
    let mut frame = manager.begin_new_frame();
    manager.increment_local_handle_start(&mut frame)?;

    assert!(!manager.resize_material_count(&mut frame, 2)?, "Resizing to the same count should keep the page");
    assert_eq!(frame.local_regions_used(), 1, "Keeping the page should keep the cursors");

    let old_heap = manager.page().view_heap().clone();
    assert!(manager.resize_material_count(&mut frame, 16)?, "Growing should replace the page");
    assert_eq!(frame.local_regions_used(), 0, "A new page restarts the cursors");
    assert_eq!(manager.layout().material_count, 16, "New page should be sized for the new count");
    assert_eq!(manager.retired_page_count(), 1, "The old page should be retired");
    assert_ne!(manager.page().view_heap().cpu_start(), old_heap.cpu_start(), "The new page needs new heaps");

    for _ in 0..16 {
        manager.increment_local_handle_start(&mut frame)?;
    }

    for n in 1..3 {
        manager.begin_new_frame();
        assert_eq!(manager.retired_page_count(), 1, "Retired page must survive {n} frame(s)");
    }
    manager.begin_new_frame();
    assert_eq!(manager.retired_page_count(), 0, "Retired page should be destroyed after three frames");

    let err = manager
        .increment_local_handle_start(&mut frame)
        .expect_err("Token from before the frames advanced is stale");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::StaleFrameContext)), "Expected stale frame, got {err}");
    Ok(())
}

#[test]
pub fn bind_global_fills_tables() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = DescriptorHeapManager::new(
        device.clone(),
        DescriptorHeapLayout::new()
            .frame_count(2)
            .acceleration_structures(1)
            .global(1, 0, 1, 1)
            .material_count(1),
    )?;
    let constants = framework::upload_f32(&device, "constants", &[1.0, 2.0, 3.0, 4.0])?;
    let output = framework::readback_buffer(&device, "output", 4)?;
    let set = GlobalDescriptorSet::new()
        .cbv(device.create_constant_buffer_view(&constants))
        .uav(device.create_unordered_access_view(&output))
        .sampler(device.create_sampler(vk::Filter::LINEAR, vk::SamplerAddressMode::REPEAT));

    let mut frame = manager.begin_new_frame();
    let binding = manager.bind_global(&mut frame, &set, &[0x1234_0000])?;

    assert_eq!(binding.acceleration_structures, vec![0x1234_0000], "Root acceleration structures should be passed on");
    assert!(binding.srv.is_none(), "No shader resource table is reserved");
    let cbv = binding.cbv.expect("Constant buffer table is reserved");
    let uav = binding.uav.expect("Unordered access table is reserved");
    let sampler = binding.sampler.expect("Sampler table is reserved");
    assert_eq!((cbv.count, uav.count, sampler.count), (1, 1, 1), "Tables should be sized by the layout");

    assert_eq!(
        device.gpu_descriptor(manager.page().view_heap().gpu_start(), 0),
        Some(Descriptor::AccelerationStructure {
            address: 0x1234_0000
        }),
        "Acceleration structure view should come first"
    );
    assert!(
        matches!(device.gpu_descriptor(cbv.start, 0), Some(Descriptor::ConstantBuffer { address, .. }) if address == constants.address()),
        "Constant buffer view should be copied into the table"
    );
    assert!(
        matches!(device.gpu_descriptor(uav.start, 0), Some(Descriptor::UnorderedAccess { .. })),
        "Unordered access view should be copied into the table"
    );
    assert_eq!(
        device.gpu_descriptor(sampler.start, 0),
        Some(Descriptor::Sampler {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT
        }),
        "Sampler should be copied into the table"
    );

    let (global, _) = create_ray_tracing_root_signatures(1, 1, 0, 1, 1, &LocalSlotLayout::default());
    global.validate_binding(&binding)?;
    Ok(())
}

#[test]
pub fn bind_global_rejects_oversized_sets() -> Result<()> {
    let device = framework::make_device()?;
    let mut manager = make_manager(&device, 1)?;
    let constants = framework::upload_f32(&device, "constants", &[0.0; 4])?;
    let view = device.create_constant_buffer_view(&constants);
    let set = GlobalDescriptorSet::new().cbv(view).cbv(view).cbv(view);

    let mut frame = manager.begin_new_frame();
    let err = manager
        .bind_global(&mut frame, &set, &[])
        .expect_err("Three constant buffers do not fit two slots");
    assert!(
        matches!(err.downcast_ref::<Error>(), Some(Error::RootSignatureMismatch(_))),
        "Expected a root signature mismatch, got {err}"
    );
    assert_eq!(frame.global_regions_used(), 0, "Rejected binds should not take a region");

    let err = manager
        .bind_global(&mut frame, &GlobalDescriptorSet::new(), &[1, 2])
        .expect_err("Two acceleration structures do not fit one slot");
    assert!(
        matches!(err.downcast_ref::<Error>(), Some(Error::RootSignatureMismatch(_))),
        "Expected a root signature mismatch, got {err}"
    );
    Ok(())
}

#[test]
pub fn root_signatures_follow_layout() -> Result<()> {
    let local_layout = LocalSlotLayout::default();
    let (global, local) = create_ray_tracing_root_signatures(1, 2, 3, 1, 1, &local_layout);

    assert_eq!(global.acceleration_structure_count(), 1, "One root acceleration structure");
    assert_eq!(global.slot_count(), 5, "Acceleration structure plus four tables");
    assert_eq!(
        global.table(DescriptorRangeType::Srv),
        Some(&RootParameter::DescriptorTable {
            range: DescriptorRangeType::Srv,
            base_register: 1,
            count: 3,
            space: 0
        }),
        "Shader resources start after the acceleration structures"
    );
    assert_eq!(local.slot_count(), 4, "Local signature has one table per kind");
    assert!(
        local
            .parameters()
            .iter()
            .all(|p| matches!(p, RootParameter::DescriptorTable { space: 1, .. })),
        "Local tables live in register space 1"
    );

    let (without_tables, _) = create_ray_tracing_root_signatures(1, 0, 0, 1, 0, &local_layout);
    assert_eq!(without_tables.slot_count(), 2, "Empty tables are left out");
    assert!(without_tables.table(DescriptorRangeType::Cbv).is_none(), "No constant buffer table without constants");
    Ok(())
}

#[test]
pub fn identical_views_share_staging_slots() -> Result<()> {
    let device = framework::make_device()?;
    let constants = framework::upload_f32(&device, "constants", &[1.0; 4])?;
    let other = framework::upload_f32(&device, "other constants", &[2.0; 4])?;

    let first = device.create_constant_buffer_view(&constants);
    for _ in 0..100 {
        assert_eq!(device.create_constant_buffer_view(&constants), first, "Recreating a view should reuse its slot");
    }
    let second = device.create_constant_buffer_view(&other);
    assert_ne!(second, first, "Views of different buffers need their own slots");
    assert_eq!(
        device.descriptor(second),
        Some(Descriptor::ConstantBuffer {
            address: other.address(),
            size: other.size(),
        }),
        "Second slot should hold the view of the other buffer"
    );
    let sampler = device.create_sampler(vk::Filter::LINEAR, vk::SamplerAddressMode::REPEAT);
    assert_eq!(
        device.create_sampler(vk::Filter::LINEAR, vk::SamplerAddressMode::REPEAT),
        sampler,
        "Identical samplers should share a slot"
    );
    Ok(())
}
