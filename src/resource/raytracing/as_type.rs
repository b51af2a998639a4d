use ash::vk;

use crate::util::to_vk::IntoVulkanType;

/// Level of an acceleration structure
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum AccelerationStructureType {
    /// Structure over instances of bottom level structures
    TopLevel,
    /// Structure over triangle or AABB geometry
    BottomLevel,
}

impl IntoVulkanType for AccelerationStructureType {
    type Output = vk::AccelerationStructureTypeKHR;

    fn into_vulkan(self) -> Self::Output {
        match self {
            AccelerationStructureType::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            AccelerationStructureType::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        }
    }
}
