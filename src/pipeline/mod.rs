//! Ray tracing pipeline plumbing: shader identifiers, shader tables and root signatures.
//!
//! A dispatch needs three shader tables (ray generation, miss and hit groups) whose records share one layout,
//! see [`ShaderRecordLayout`]. The number of handle slots in a record is the parameter count of the local root
//! signature created by [`create_ray_tracing_root_signatures()`].

pub use identifier::*;
pub use root_signature::*;
pub use shader_table::*;

pub mod identifier;
pub mod root_signature;
pub mod shader_table;
