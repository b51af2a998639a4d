//! Conversions from crate types into the `ash` types that backends and tables expose.

/// Converts a value into its `ash` counterpart, consuming it.
pub trait IntoVulkanType {
    /// Matching `ash` type
    type Output;

    fn into_vulkan(self) -> Self::Output;
}

/// Views a value as its `ash` counterpart without consuming it.
pub trait AsVulkanType {
    /// Matching `ash` type
    type Output;

    fn as_vulkan(&self) -> Self::Output;
}
