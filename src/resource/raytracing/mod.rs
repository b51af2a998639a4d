//! Exposes all relevant abstractions for raytracing resources
//!
//! A scene is two levels deep. [`BottomLevelStructure`]s index the primitives of one mesh each, a
//! [`TopLevelStructure`] indexes transformed [`Instance`]s of them. Both are built from a [`BuildInput`], which
//! carries the sizes reported by the device's prebuild query:
//!
//! 1. Describe the geometry and call [`BuildInput::bottom()`].
//! 2. Allocate buffers with [`AccelerationStructure::create_buffer_for()`].
//! 3. Record [`BottomLevelStructure::build()`] into a command stream and submit it.
//! 4. Optionally [`BottomLevelStructure::compact()`] once the compacted size is read back.
//! 5. Pack instances with [`TopLevelStructure::create_instance_buffer()`] and build the top level structure the
//!    same way.

pub use acceleration_structure::*;
pub use as_type::*;
pub use bottom_level::*;
pub use build_info::*;
pub use build_size::*;
pub use compaction::CompactionState;
pub use geometry::*;
pub use top_level::*;

pub mod acceleration_structure;
pub mod as_type;
pub mod bottom_level;
pub mod build_info;
pub mod build_size;
pub mod compaction;
pub mod geometry;
pub mod top_level;
