//! Opaque shader identifiers and where they come from.

use std::collections::HashMap;

/// Opaque identifier of a shader export. Its size is fixed per backend,
/// see [`DeviceProperties::shader_identifier_size`](crate::DeviceProperties::shader_identifier_size).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderIdentifier(Vec<u8>);

impl ShaderIdentifier {
    /// Wrap raw identifier bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the identifier has no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Anything that can map an export name to its shader identifier. Usually a ray tracing pipeline or a shader
/// collection.
pub trait ShaderIdentifierSource {
    /// Identifier of `export`, or `None` if the export does not exist.
    fn shader_identifier(&self, export: &str) -> Option<ShaderIdentifier>;
}

impl ShaderIdentifierSource for HashMap<String, ShaderIdentifier> {
    fn shader_identifier(&self, export: &str) -> Option<ShaderIdentifier> {
        self.get(export).cloned()
    }
}
