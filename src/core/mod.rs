//! The core module holds the backend seam: the traits a device, command stream and buffer must implement
//! to be driven by deimos, and the error type.

pub mod error;
pub mod properties;
pub mod traits;
