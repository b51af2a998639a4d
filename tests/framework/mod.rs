#![allow(dead_code)]

use anyhow::Result;

use deimos::backend::headless::{HeadlessBuffer, HeadlessDevice};
use deimos::resource::buffer::{write_f32, write_u32};
use deimos::{
    vk, AabbsGeometry, BufferCreateInfo, Device, DeviceProperties, GeometryDescriptor, MemoryType, TrianglesGeometry,
};

/// Initialize logging once. Set `RUST_LOG` to see output.
pub fn init_logging() {
    let _ = pretty_env_logger::formatted_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()))
        .is_test(true)
        .try_init();
}

/// Creates a headless device with default properties, ready for automated tests
pub fn make_device() -> Result<HeadlessDevice> {
    make_device_with(|properties| properties)
}

/// Create a headless device with customized properties
pub fn make_device_with<F: FnOnce(DeviceProperties) -> DeviceProperties>(callback: F) -> Result<HeadlessDevice> {
    init_logging();
    HeadlessDevice::new(callback(DeviceProperties::default()))
}

/// Upload buffer holding `data`
pub fn upload_f32(device: &HeadlessDevice, name: &str, data: &[f32]) -> Result<HeadlessBuffer> {
    let buffer = device.create_buffer(&BufferCreateInfo::new(
        name,
        (data.len() * 4) as u64,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryType::CpuToGpu,
    ))?;
    write_f32(&buffer, data)?;
    Ok(buffer)
}

/// Upload buffer holding `data`
pub fn upload_u32(device: &HeadlessDevice, name: &str, data: &[u32]) -> Result<HeadlessBuffer> {
    let buffer = device.create_buffer(&BufferCreateInfo::new(
        name,
        (data.len() * 4) as u64,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryType::CpuToGpu,
    ))?;
    write_u32(&buffer, data)?;
    Ok(buffer)
}

/// Buffer the CPU can read back, zero-initialized
pub fn readback_buffer(device: &HeadlessDevice, name: &str, elements: u64) -> Result<HeadlessBuffer> {
    device.create_buffer(
        &BufferCreateInfo::new(name, elements * 4, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryType::GpuToCpu).stride(4),
    )
}

/// Indexed quad spanning `-1..1` in x and y at depth `z`, made of two triangles.
pub fn quad_at(device: &HeadlessDevice, z: f32) -> Result<GeometryDescriptor<HeadlessBuffer>> {
    let vertices = upload_f32(device, "quad vertices", &[
        -1.0, -1.0, z,
         1.0, -1.0, z,
         1.0,  1.0, z,
        -1.0,  1.0, z,
    ])?;
    let indices = upload_u32(device, "quad indices", &[0, 1, 2, 0, 2, 3])?;
    Ok(TrianglesGeometry::new(vertices, 4, 12)
        .indices(indices, 6, vk::IndexType::UINT32)
        .into())
}

/// Quad at depth zero
pub fn quad(device: &HeadlessDevice) -> Result<GeometryDescriptor<HeadlessBuffer>> {
    quad_at(device, 0.0)
}

/// One axis aligned box
pub fn aabb(device: &HeadlessDevice, min: [f32; 3], max: [f32; 3]) -> Result<GeometryDescriptor<HeadlessBuffer>> {
    let buffer = upload_f32(device, "aabbs", &[min[0], min[1], min[2], max[0], max[1], max[2]])?;
    Ok(AabbsGeometry::new(buffer, 1).into())
}
