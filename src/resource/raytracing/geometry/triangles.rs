//! Triangle geometry for bottom level acceleration structures

use ash::vk;

use crate::util::byte_size::ByteSize;
use crate::GpuBuffer;

/// Triangle data in a bottom level acceleration structure.
///
/// Buffers are held as shared handles, their addresses are only read when a build is recorded.
#[derive(Debug, Clone)]
pub struct TrianglesGeometry<B> {
    /// Buffer holding vertex positions
    pub vertex_buffer: B,
    /// Byte offset of the first vertex
    pub vertex_offset: vk::DeviceSize,
    /// Vertex stride in the vertex buffer
    pub vertex_stride: vk::DeviceSize,
    /// Number of vertices
    pub vertex_count: u32,
    /// The vertex position format
    pub vertex_format: vk::Format,
    /// Index buffer, `None` for non-indexed geometry
    pub index_buffer: Option<B>,
    /// Byte offset of the first index
    pub index_offset: vk::DeviceSize,
    /// Number of indices
    pub index_count: u32,
    /// Index type, or `vk::IndexType::NONE_KHR` if no index buffer is used.
    pub index_type: vk::IndexType,
    /// Buffer holding a row-major 3x4 transform applied to the vertices
    pub transform_buffer: Option<B>,
    /// Byte offset of the transform
    pub transform_offset: vk::DeviceSize,
    /// Geometry flags
    pub flags: vk::GeometryFlagsKHR,
}

impl<B: GpuBuffer> TrianglesGeometry<B> {
    /// Non-indexed, opaque `R32G32B32_SFLOAT` triangles.
    pub fn new(vertex_buffer: B, vertex_count: u32, vertex_stride: vk::DeviceSize) -> Self {
        Self {
            vertex_buffer,
            vertex_offset: 0,
            vertex_stride,
            vertex_count,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            index_buffer: None,
            index_offset: 0,
            index_count: 0,
            index_type: vk::IndexType::NONE_KHR,
            transform_buffer: None,
            transform_offset: 0,
            flags: vk::GeometryFlagsKHR::OPAQUE,
        }
    }

    /// Set the vertex data format
    pub fn vertex_format(mut self, format: vk::Format) -> Self {
        self.vertex_format = format;
        self
    }

    /// Set the byte offset of the first vertex
    pub fn vertex_offset(mut self, offset: vk::DeviceSize) -> Self {
        self.vertex_offset = offset;
        self
    }

    /// Use an index buffer
    pub fn indices(mut self, buffer: B, count: u32, ty: vk::IndexType) -> Self {
        self.index_buffer = Some(buffer);
        self.index_count = count;
        self.index_type = ty;
        self
    }

    /// Set the byte offset of the first index
    pub fn index_offset(mut self, offset: vk::DeviceSize) -> Self {
        self.index_offset = offset;
        self
    }

    /// Transform the vertices by a 3x4 matrix stored in `buffer` at `offset`
    pub fn transform(mut self, buffer: B, offset: vk::DeviceSize) -> Self {
        self.transform_buffer = Some(buffer);
        self.transform_offset = offset;
        self
    }

    /// Set the geometry flags
    pub fn flags(mut self, flags: vk::GeometryFlagsKHR) -> Self {
        self.flags = flags;
        self
    }

    /// Whether an index buffer is used
    pub fn is_indexed(&self) -> bool {
        self.index_buffer.is_some()
    }

    /// Number of triangles
    pub fn primitive_count(&self) -> u32 {
        if self.is_indexed() {
            self.index_count / 3
        } else {
            self.vertex_count / 3
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let Some(vertex_size) = self.vertex_format.byte_size() else {
            return Err(format!("unsupported vertex format {:?}", self.vertex_format));
        };
        if self.vertex_count == 0 {
            return Err("vertex count is zero".into());
        }
        if self.vertex_stride < vertex_size as vk::DeviceSize {
            return Err(format!("vertex stride {} is smaller than the vertex format ({vertex_size} bytes)", self.vertex_stride));
        }
        let vertex_end =
            self.vertex_offset + (self.vertex_count as vk::DeviceSize - 1) * self.vertex_stride + vertex_size as vk::DeviceSize;
        if vertex_end > self.vertex_buffer.size() {
            return Err(format!("vertex range ends at byte {vertex_end}, past the vertex buffer ({} bytes)", self.vertex_buffer.size()));
        }

        match (&self.index_buffer, self.index_type) {
            (None, vk::IndexType::NONE_KHR) => {
                if self.vertex_count % 3 != 0 {
                    return Err(format!("non-indexed vertex count {} is not a multiple of 3", self.vertex_count));
                }
            }
            (None, ty) => return Err(format!("index type {ty:?} given without an index buffer")),
            (Some(_), vk::IndexType::NONE_KHR) => return Err("index buffer given with index type NONE".into()),
            (Some(buffer), ty) => {
                let Some(index_size) = ty.byte_size() else {
                    return Err(format!("unsupported index type {ty:?}"));
                };
                if self.index_count == 0 || self.index_count % 3 != 0 {
                    return Err(format!("index count {} is not a positive multiple of 3", self.index_count));
                }
                let index_end = self.index_offset + self.index_count as vk::DeviceSize * index_size as vk::DeviceSize;
                if index_end > buffer.size() {
                    return Err(format!("index range ends at byte {index_end}, past the index buffer ({} bytes)", buffer.size()));
                }
            }
        }

        if let Some(buffer) = &self.transform_buffer {
            // 3x4 floats
            if self.transform_offset + 48 > buffer.size() {
                return Err("transform does not fit in the transform buffer".into());
            }
        }
        Ok(())
    }
}
