//! Scene-level management of acceleration structures.

pub use arena::*;
pub use bvh_manager::*;

pub mod arena;
pub mod bvh_manager;
