//! Implementations of the [`Device`](crate::Device) traits.

pub mod headless;
