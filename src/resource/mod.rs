//! Exposes GPU resources: buffers, memory placement and ray tracing acceleration structures.

pub mod buffer;
pub mod memory_type;
pub mod raytracing;
