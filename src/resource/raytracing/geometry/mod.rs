//! Exposes different acceleration structure geometry types

use ash::vk;

pub use aabbs::*;
pub use instances::*;
pub use triangles::*;

use crate::GpuBuffer;

pub mod aabbs;
pub mod instances;
pub mod triangles;

/// One geometry of a bottom level acceleration structure. Exactly one variant is populated.
#[derive(Debug, Clone)]
pub enum GeometryDescriptor<B> {
    /// Triangle mesh
    Triangles(TrianglesGeometry<B>),
    /// Procedural boxes
    Aabbs(AabbsGeometry<B>),
}

impl<B: GpuBuffer> GeometryDescriptor<B> {
    /// Number of primitives this geometry contributes
    pub fn primitive_count(&self) -> u32 {
        match self {
            GeometryDescriptor::Triangles(triangles) => triangles.primitive_count(),
            GeometryDescriptor::Aabbs(aabbs) => aabbs.count,
        }
    }

    /// Geometry flags
    pub fn flags(&self) -> vk::GeometryFlagsKHR {
        match self {
            GeometryDescriptor::Triangles(triangles) => triangles.flags,
            GeometryDescriptor::Aabbs(aabbs) => aabbs.flags,
        }
    }

    /// Vulkan geometry type of this descriptor
    pub fn geometry_type(&self) -> vk::GeometryTypeKHR {
        match self {
            GeometryDescriptor::Triangles(_) => vk::GeometryTypeKHR::TRIANGLES,
            GeometryDescriptor::Aabbs(_) => vk::GeometryTypeKHR::AABBS,
        }
    }

    /// Structural sanity check against buffer sizes. Buffer contents are never read.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            GeometryDescriptor::Triangles(triangles) => triangles.validate(),
            GeometryDescriptor::Aabbs(aabbs) => aabbs.validate(),
        }
    }
}

impl<B> From<TrianglesGeometry<B>> for GeometryDescriptor<B> {
    fn from(value: TrianglesGeometry<B>) -> Self {
        GeometryDescriptor::Triangles(value)
    }
}

impl<B> From<AabbsGeometry<B>> for GeometryDescriptor<B> {
    fn from(value: AabbsGeometry<B>) -> Self {
        GeometryDescriptor::Aabbs(value)
    }
}
