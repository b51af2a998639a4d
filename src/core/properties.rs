//! Backend-fixed constants that the structure, descriptor and shader table code depends on.

use ash::vk;

/// Properties of a ray tracing capable device. Backends report these through
/// [`Device::properties()`](crate::Device::properties), the headless backend takes them as its configuration.
///
/// The defaults match common desktop hardware: 32 byte shader identifiers, 32 byte record alignment
/// and 64 byte table base alignment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceProperties {
    /// Size of an opaque shader identifier in bytes.
    pub shader_identifier_size: u32,
    /// Every shader record size must be a multiple of this.
    pub shader_record_alignment: u32,
    /// Start address of each shader table must be a multiple of this.
    pub shader_table_alignment: u32,
    /// Increment between two CBV/SRV/UAV descriptors in a heap.
    pub view_descriptor_size: u32,
    /// Increment between two sampler descriptors in a heap.
    pub sampler_descriptor_size: u32,
    /// Required alignment of scratch buffer addresses and sizes.
    pub scratch_alignment: vk::DeviceSize,
    /// Number of frames that can be in flight at once. Deferred deletions wait this many frames.
    pub frames_in_flight: u32,
    /// Total bytes of buffer memory the device can hand out. `None` means unlimited.
    pub memory_budget: Option<vk::DeviceSize>,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            shader_identifier_size: 32,
            shader_record_alignment: 32,
            shader_table_alignment: 64,
            view_descriptor_size: 32,
            sampler_descriptor_size: 32,
            scratch_alignment: 256,
            frames_in_flight: 2,
            memory_budget: None,
        }
    }
}

impl DeviceProperties {
    /// Set the shader identifier size.
    pub fn shader_identifier_size(mut self, size: u32) -> Self {
        self.shader_identifier_size = size;
        self
    }

    /// Set the shader record alignment.
    pub fn shader_record_alignment(mut self, alignment: u32) -> Self {
        self.shader_record_alignment = alignment;
        self
    }

    /// Set the shader table base alignment.
    pub fn shader_table_alignment(mut self, alignment: u32) -> Self {
        self.shader_table_alignment = alignment;
        self
    }

    /// Set the scratch buffer alignment.
    pub fn scratch_alignment(mut self, alignment: vk::DeviceSize) -> Self {
        self.scratch_alignment = alignment;
        self
    }

    /// Set the number of frames in flight.
    pub fn frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Limit the total amount of buffer memory.
    pub fn memory_budget(mut self, bytes: vk::DeviceSize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }
}
