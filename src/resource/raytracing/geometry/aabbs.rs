//! Procedural geometry described by axis-aligned bounding boxes

use ash::vk;

use crate::GpuBuffer;

/// Size of one `vk::AabbPositionsKHR` (min xyz, max xyz).
pub const AABB_SIZE: vk::DeviceSize = 24;

/// AABB data in a bottom level acceleration structure
#[derive(Debug, Clone)]
pub struct AabbsGeometry<B> {
    /// Buffer holding the boxes
    pub buffer: B,
    /// Byte offset of the first box
    pub offset: vk::DeviceSize,
    /// Distance between two boxes, at least 24 and a multiple of 8
    pub stride: vk::DeviceSize,
    /// Number of boxes
    pub count: u32,
    /// Geometry flags
    pub flags: vk::GeometryFlagsKHR,
}

impl<B: GpuBuffer> AabbsGeometry<B> {
    /// Tightly packed opaque boxes
    pub fn new(buffer: B, count: u32) -> Self {
        Self {
            buffer,
            offset: 0,
            stride: AABB_SIZE,
            count,
            flags: vk::GeometryFlagsKHR::OPAQUE,
        }
    }

    /// Set the stride between boxes
    pub fn stride(mut self, stride: vk::DeviceSize) -> Self {
        self.stride = stride;
        self
    }

    /// Set the byte offset of the first box
    pub fn offset(mut self, offset: vk::DeviceSize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the geometry flags
    pub fn flags(mut self, flags: vk::GeometryFlagsKHR) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.count == 0 {
            return Err("AABB count is zero".into());
        }
        if self.stride < AABB_SIZE || self.stride % 8 != 0 {
            return Err(format!("AABB stride {} must be at least 24 and a multiple of 8", self.stride));
        }
        let end = self.offset + (self.count as vk::DeviceSize - 1) * self.stride + AABB_SIZE;
        if end > self.buffer.size() {
            return Err(format!("AABB range ends at byte {end}, past the buffer ({} bytes)", self.buffer.size()));
        }
        Ok(())
    }
}
