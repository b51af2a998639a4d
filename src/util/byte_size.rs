//! Byte sizes of vertex formats and index types used in geometry descriptors.

use std::mem::size_of;

use ash::vk;

/// Size in bytes of one element of a format or type. `None` if the format is not supported as build input.
pub trait ByteSize {
    fn byte_size(&self) -> Option<usize>;
}

impl ByteSize for vk::Format {
    fn byte_size(&self) -> Option<usize> {
        match *self {
            vk::Format::R32G32_SFLOAT => Some(2 * size_of::<f32>()),
            vk::Format::R32G32B32_SFLOAT => Some(3 * size_of::<f32>()),
            vk::Format::R32G32B32A32_SFLOAT => Some(4 * size_of::<f32>()),
            vk::Format::R16G16_SFLOAT => Some(2 * size_of::<u16>()),
            vk::Format::R16G16B16A16_SFLOAT => Some(4 * size_of::<u16>()),
            vk::Format::R16G16_SNORM => Some(2 * size_of::<u16>()),
            vk::Format::R16G16B16A16_SNORM => Some(4 * size_of::<u16>()),
            _ => None,
        }
    }
}

impl ByteSize for vk::IndexType {
    fn byte_size(&self) -> Option<usize> {
        match *self {
            vk::IndexType::UINT16 => Some(size_of::<u16>()),
            vk::IndexType::UINT32 => Some(size_of::<u32>()),
            vk::IndexType::NONE_KHR => Some(0),
            _ => None,
        }
    }
}
