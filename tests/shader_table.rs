use std::collections::HashMap;

use anyhow::Result;

use deimos::backend::headless::HeadlessPipelineBuilder;
use deimos::resource::buffer::read_bytes;
use deimos::{
    hit_group_index, vk, BufferCreateInfo, Device, DispatchRaysDesc, Error, GpuBuffer, GpuDescriptorHandle, MemoryType,
    ShaderIdentifier, ShaderIdentifierSource, ShaderRecordLayout, ShaderTableBuilder,
};

mod framework;

fn identifiers(names: &[&str]) -> HashMap<String, ShaderIdentifier> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_string(), ShaderIdentifier::new(vec![i as u8 + 1; 32])))
        .collect()
}

fn material_handles(material: u32) -> Result<Vec<GpuDescriptorHandle>> {
    Ok((0..4).map(|slot| GpuDescriptorHandle(0x1000 * u64::from(material + 1) + 8 * slot)).collect())
}

fn is_error(err: &anyhow::Error, check: impl FnOnce(&Error) -> bool) -> bool {
    err.downcast_ref::<Error>().is_some_and(check)
}

#[test]
pub fn record_layout() -> Result<()> {
    let layout = ShaderRecordLayout::new(32, 4, 32);
    assert_eq!(layout.handle_offset(), 32, "Handles start right after a 32 byte identifier");
    assert_eq!(layout.record_size(), 64, "Identifier plus four handles is 64 bytes");
    assert_eq!(layout.table_size(3), 192, "Tables are records times stride");

    let layout = ShaderRecordLayout::new(32, 1, 32);
    assert_eq!(layout.record_size(), 64, "Record size should be rounded up to the record alignment");

    let layout = ShaderRecordLayout::new(20, 1, 32);
    assert_eq!(layout.handle_offset(), 24, "Handles should be 8 byte aligned");
    assert_eq!(layout.record_size(), 32, "Record size should be rounded up to the record alignment");

    let layout = ShaderRecordLayout::new(32, 0, 0);
    assert_eq!(layout.record_size(), 32, "Handle-less records are just the identifier");
    Ok(())
}

#[test]
pub fn hit_group_records_follow_materials() -> Result<()> {
    let device = framework::make_device()?;
    let source = identifiers(&["radiance", "shadow"]);
    let builder = ShaderTableBuilder::new(&device, &source, 4);
    let table = builder.build_hit_groups("hit groups", 3, &["radiance", "shadow"], material_handles)?;

    assert_eq!(table.record_count(), 6, "Three materials with two variants each");
    assert_eq!(table.stride(), 64, "Stride is the record size");
    assert_eq!(table.size(), 64 * 6, "Table size is record size times materials times variants");
    assert!(table.buffer().size() >= table.size(), "Buffer should hold all records");

    let index = hit_group_index(1, 2, 1);
    assert_eq!(index, 3, "Second variant of the second material");
    let record = read_bytes(table.buffer(), (table.stride() * u64::from(index)) as usize, 64)?;
    assert_eq!(&record[..32], vec![2u8; 32].as_slice(), "Record should start with the shadow identifier");
    let expected = material_handles(1)?
        .iter()
        .flat_map(|handle| handle.to_le_bytes())
        .collect::<Vec<u8>>();
    assert_eq!(&record[32..64], expected.as_slice(), "Record should hold the handles of material 1");
    assert_eq!(table.record_address(index), table.buffer().address() + 192, "Record address follows the stride");
    Ok(())
}

#[test]
pub fn unused_slots_stay_zero() -> Result<()> {
    let device = framework::make_device()?;
    let source = identifiers(&["raygen"]);
    let builder = ShaderTableBuilder::new(&device, &source, 4);
    let table = builder.build("partial", 2, |index, record| {
        record.export("raygen")?;
        if index == 0 {
            record.handles(&[GpuDescriptorHandle(0xabc)])?;
        }
        Ok(())
    })?;

    let bytes = read_bytes(table.buffer(), 0, table.size() as usize)?;
    assert_eq!(&bytes[32..40], &0xabcu64.to_le_bytes(), "First handle should be written");
    assert!(bytes[40..64].iter().all(|b| *b == 0), "Unused slots should be zero");
    assert!(bytes[96..128].iter().all(|b| *b == 0), "Record without handles should have zero slots");
    Ok(())
}

#[test]
pub fn too_many_handles() -> Result<()> {
    let device = framework::make_device()?;
    let source = identifiers(&["hit"]);
    let builder = ShaderTableBuilder::new(&device, &source, 4);
    let err = builder
        .build_hit_groups("hit groups", 1, &["hit"], |_| Ok(vec![GpuDescriptorHandle(0); 5]))
        .expect_err("Five handles do not fit four slots");
    assert!(
        is_error(&err, |e| matches!(e, Error::TooManyHandles { given: 5, slots: 4 })),
        "Expected too many handles, got {err}"
    );
    Ok(())
}

#[test]
pub fn empty_tables_are_rejected() -> Result<()> {
    let device = framework::make_device()?;
    let source = identifiers(&["hit"]);
    let builder = ShaderTableBuilder::new(&device, &source, 4);

    let err = builder.build("empty", 0, |_, _| Ok(())).expect_err("Zero records should be rejected");
    assert!(is_error(&err, |e| matches!(e, Error::EmptyShaderTable)), "Expected empty table, got {err}");
    let err = builder
        .build_hit_groups("no variants", 4, &[], material_handles)
        .expect_err("Hit groups without variants should be rejected");
    assert!(is_error(&err, |e| matches!(e, Error::EmptyShaderTable)), "Expected empty table, got {err}");
    let err = builder.build_exports("no exports", &[]).expect_err("Export table without exports should be rejected");
    assert!(is_error(&err, |e| matches!(e, Error::EmptyShaderTable)), "Expected empty table, got {err}");
    Ok(())
}

#[test]
pub fn invalid_identifiers() -> Result<()> {
    let device = framework::make_device()?;
    let source = identifiers(&["miss"]);
    let builder = ShaderTableBuilder::new(&device, &source, 0);

    let err = builder
        .build_exports("miss", &["miss", "shadow miss"])
        .expect_err("Unknown export should be rejected");
    assert!(is_error(&err, |e| matches!(e, Error::InvalidIdentifier(_))), "Expected invalid identifier, got {err}");

    let err = builder
        .build("short", 1, |_, record| record.identifier(&ShaderIdentifier::new(vec![1u8; 8])))
        .expect_err("Identifier of the wrong size should be rejected");
    assert!(is_error(&err, |e| matches!(e, Error::InvalidIdentifier(_))), "Expected invalid identifier, got {err}");
    Ok(())
}

#[test]
pub fn pipeline_identifiers() -> Result<()> {
    let device = framework::make_device()?;
    let pipeline = HeadlessPipelineBuilder::new("identifiers")
        .ray_generation("raygen", |_| Ok(()))
        .miss("miss", |_, _| Ok(()))
        .hit_group("hit", |_, _, _| Ok(()))
        .build(&device)?;
    let other = HeadlessPipelineBuilder::new("other")
        .ray_generation("raygen", |_| Ok(()))
        .build(&device)?;

    let raygen = pipeline.shader_identifier("raygen").expect("raygen is exported");
    assert_eq!(raygen.len(), 32, "Identifiers have the device identifier size");
    assert_ne!(Some(raygen.clone()), pipeline.shader_identifier("miss"), "Exports have distinct identifiers");
    assert_ne!(Some(raygen), other.shader_identifier("raygen"), "Pipelines have distinct identifiers");
    assert!(pipeline.shader_identifier("callable").is_none(), "Unknown exports have no identifier");

    let err = HeadlessPipelineBuilder::new("duplicate")
        .miss("miss", |_, _| Ok(()))
        .miss("miss", |_, _| Ok(()))
        .build(&device)
        .expect_err("Duplicate exports should be rejected");
    assert!(is_error(&err, |e| matches!(e, Error::InvalidIdentifier(_))), "Expected invalid identifier, got {err}");
    Ok(())
}

#[test]
pub fn small_identifiers_are_rejected() -> Result<()> {
    let err = framework::make_device_with(|properties| properties.shader_identifier_size(8))
        .expect_err("Identifiers shorter than 16 bytes cannot identify exports");
    assert!(is_error(&err, |e| matches!(e, Error::InvalidIdentifier(_))), "Expected invalid identifier, got {err}");
    Ok(())
}

#[test]
pub fn dispatch_regions() -> Result<()> {
    let device = framework::make_device()?;
    let source = identifiers(&["raygen", "miss", "shadow miss", "hit"]);
    let exports = ShaderTableBuilder::new(&device, &source, 0);
    let raygen = exports.build_exports("raygen", &["raygen", "raygen"])?;
    let miss = exports.build_exports("miss", &["miss", "shadow miss"])?;
    let hit = ShaderTableBuilder::new(&device, &source, 4).build_hit_groups("hit", 2, &["hit"], material_handles)?;

    let desc = DispatchRaysDesc::new(&raygen, &miss, &hit, 16, 8);
    assert_eq!(desc.ray_generation.size, desc.ray_generation.stride, "Only one ray generation record is used");
    assert_eq!(desc.ray_generation.device_address, raygen.buffer().address(), "Ray generation starts at the table");
    assert_eq!(desc.miss.size, 64, "Two 32 byte miss records");
    assert_eq!(desc.hit_group.stride, 64, "Hit group stride includes the handles");
    assert_eq!(desc.hit_group.size, 128, "Two materials with one variant");
    assert_eq!(desc.callable.size, 0, "No callable table");
    assert_eq!((desc.width, desc.height, desc.depth), (16, 8, 1), "Launch size");
    Ok(())
}

#[test]
pub fn tables_follow_the_table_alignment() -> Result<()> {
    let device = framework::make_device_with(|properties| properties.shader_table_alignment(512))?;
    let source = identifiers(&["raygen", "miss", "hit"]);
    let exports = ShaderTableBuilder::new(&device, &source, 0);

    let _odd = device.create_buffer(&BufferCreateInfo::new(
        "odd sized",
        300,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        MemoryType::CpuToGpu,
    ))?;
    let raygen = exports.build_exports("raygen", &["raygen"])?;
    let _odd = device.create_buffer(&BufferCreateInfo::new(
        "odd sized",
        300,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        MemoryType::CpuToGpu,
    ))?;
    let miss = exports.build_exports("miss", &["miss"])?;
    let hit = ShaderTableBuilder::new(&device, &source, 4).build_hit_groups("hit", 3, &["hit"], material_handles)?;

    for table in [&raygen, &miss, &hit] {
        assert_eq!(table.buffer().address() % 512, 0, "Table at {:#x} should be 512 byte aligned", table.buffer().address());
    }
    let desc = DispatchRaysDesc::new(&raygen, &miss, &hit, 1, 1);
    assert_eq!(desc.hit_group.device_address % 512, 0, "Dispatch should see the aligned hit group table");
    Ok(())
}
