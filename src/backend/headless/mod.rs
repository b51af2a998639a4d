//! Software backend that executes acceleration structure builds, descriptor copies and ray dispatches on the CPU.
//!
//! Structures are stored in a flat format that keeps every primitive (or instance) as a record, and traversal is a
//! brute force closest hit search. That is slow but exact, which is what tests of the layers above need.
//! Shaders are Rust closures registered on a [`HeadlessPipelineBuilder`], shader tables select them through
//! identifiers.

pub use buffer::{HeadlessBuffer, Mapping};
pub use descriptor::{Descriptor, HeadlessDescriptorHeap};
pub use device::HeadlessDevice;
pub use pipeline::{HeadlessPipeline, HeadlessPipelineBuilder, Payload, ShaderContext, TraceRay};
pub use stream::{HeadlessCommandStream, HeadlessFence};
pub use traversal::{Hit, HitKind, Ray};

pub(crate) mod accel_format;
pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub(crate) mod queue;
pub mod stream;
pub mod traversal;
