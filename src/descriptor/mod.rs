//! Shader-visible descriptor heaps for ray tracing.
//!
//! Ray tracing shaders see two kinds of descriptors:
//! - Global descriptors, bound once per dispatch through the global root signature. These change every frame, so
//!   each frame slot gets its own region.
//! - Local descriptors, one region per material, referenced by the handles stored in hit group shader records.
//!
//! [`DescriptorHeapManager`] hands out both kinds of regions from a [`DescriptorHeapPage`] and retires pages only
//! after every frame that may still use them has completed.

pub use global_set::*;
pub use handle::*;
pub use heap_manager::*;
pub use heap_page::*;
pub use layout::*;

pub mod global_set;
pub mod handle;
pub mod heap_manager;
pub mod heap_page;
pub mod layout;
