//! Acceleration structure build sizes

use ash::vk;

use crate::util::align::align;
use crate::resource::raytracing::ACCELERATION_STRUCTURE_ALIGNMENT;

/// Holds the required sizes of buffers for the acceleration structure, as reported by a prebuild query.
#[derive(Debug, Default, Eq, PartialEq, Hash, Copy, Clone)]
pub struct AccelerationStructureBuildSize {
    /// Required size of the acceleration structure
    pub size: vk::DeviceSize,
    /// Required size of the scratch buffer for update operations
    pub update_scratch_size: vk::DeviceSize,
    /// Required size of the scratch buffer for build operations
    pub build_scratch_size: vk::DeviceSize,
}

impl AccelerationStructureBuildSize {
    /// Round the sizes up to the structure alignment and the device's scratch alignment.
    pub fn aligned(self, scratch_alignment: vk::DeviceSize) -> Self {
        Self {
            size: align(self.size, ACCELERATION_STRUCTURE_ALIGNMENT),
            update_scratch_size: align(self.update_scratch_size, scratch_alignment),
            build_scratch_size: align(self.build_scratch_size, scratch_alignment),
        }
    }

    /// Scratch size that serves both builds and updates.
    pub fn max_scratch_size(&self) -> vk::DeviceSize {
        self.build_scratch_size.max(self.update_scratch_size)
    }
}
