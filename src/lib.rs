//! Ray tracing scene plumbing: acceleration structures, descriptor heaps and shader tables.
//!
//! deimos sits between a renderer's frame loop and a ray tracing capable device. It owns the GPU memory of
//! acceleration structures, hands out per-frame descriptor regions and packs shader records, while the device
//! itself stays behind the traits in [`core::traits`](crate::core::traits). Every type that crosses that seam uses the Vulkan
//! vocabulary from [`ash::vk`].
//!
//! To get started, import everything at once
//! ```
//! use deimos::prelude::*;
//! ```
//!
//! # Example
//!
//! The crate ships a software backend, [`HeadlessDevice`](crate::backend::headless::HeadlessDevice), which runs
//! builds and ray dispatches on the CPU. A frame with one mesh then looks like this:
//! ```ignore
//! use deimos::prelude::*;
//! use deimos::backend::headless::HeadlessDevice;
//!
//! let device = HeadlessDevice::new(DeviceProperties::default())?;
//!
//! // Describe the mesh and build its bottom level structure.
//! let input = BuildInput::bottom(
//!     &device,
//!     vec![GeometryDescriptor::Triangles(TrianglesGeometry::new(vertices.clone(), 4, 12).indices(indices.clone(), 6, vk::IndexType::UINT32))],
//!     vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
//! )?;
//! let mut blas = BottomLevelStructure::new(device.clone());
//! blas.create_buffer_for(input.sizes())?;
//!
//! // Place it in the scene.
//! let mut tlas = TopLevelStructure::new(device.clone());
//! tlas.create_instance_buffer(&[Instance::new(&blas)])?;
//! let scene = BuildInput::top(&device, 1, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)?;
//! tlas.create_buffer_for(scene.sizes())?;
//!
//! // Record both builds and submit.
//! let mut stream = device.create_command_stream(QueueType::Compute)?;
//! blas.build(&mut stream, &input, true)?;
//! tlas.build(&mut stream, &scene, true)?;
//! stream.close()?;
//! stream.execute()?;
//! ```
//!
//! Descriptors are managed by a [`DescriptorHeapManager`](crate::DescriptorHeapManager): call
//! [`begin_new_frame()`](crate::DescriptorHeapManager::begin_new_frame) once per frame and claim regions from the
//! returned [`FrameContext`](crate::FrameContext). Shader tables are built with a
//! [`ShaderTableBuilder`](crate::ShaderTableBuilder) from any [`ShaderIdentifierSource`](crate::ShaderIdentifierSource).
//!
//! # Features
//! * `log-objects` traces creation and destruction of buffers, heaps and structures.
//! * `geometry-validation` (default) runs structural checks on geometry descriptors when a build input is created.

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod prelude;
pub use crate::prelude::*;

pub mod backend;
pub mod core;
pub mod descriptor;
pub mod pipeline;
pub mod resource;
pub mod scene;
pub mod util;
