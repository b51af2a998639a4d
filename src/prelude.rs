pub use ash::vk;

pub use crate::core::error::Error;
pub use crate::core::properties::DeviceProperties;
pub use crate::core::traits::*;

pub use crate::resource::buffer::BufferCreateInfo;
pub use crate::resource::memory_type::MemoryType;
pub use crate::resource::raytracing::*;

pub use crate::descriptor::global_set::*;
pub use crate::descriptor::handle::*;
pub use crate::descriptor::heap_manager::*;
pub use crate::descriptor::heap_page::*;
pub use crate::descriptor::layout::*;

pub use crate::pipeline::identifier::*;
pub use crate::pipeline::root_signature::*;
pub use crate::pipeline::shader_table::*;

pub use crate::scene::arena::{Arena, Handle};
pub use crate::scene::bvh_manager::*;

pub use crate::util::byte_size::ByteSize;
pub use crate::util::deferred_delete::{DeferredDelete, DeletionQueue};
pub use crate::util::to_vk::*;
pub use crate::util::transform::TransformMatrix;
