//! Exposes the deimos error type

use std::sync::PoisonError;

use ash::vk;
use gpu_allocator::AllocationError;
use thiserror::Error;

/// Error type that deimos can return.
///
/// Fallible functions return [`anyhow::Result`], so match on an error by downcasting it:
/// `err.downcast_ref::<deimos::Error>()`.
#[derive(Error, Debug)]
pub enum Error {
    /// A buffer or descriptor heap could not be created. Fatal at initialization.
    #[error("GPU allocation failed: `{0}`")]
    AllocationFailure(String),
    /// A build was issued against buffers sized for a different prebuild query.
    #[error("Build requires {required} bytes of {what}, but only {available} bytes are available.")]
    SizeMismatch {
        /// Which buffer is too small.
        what: &'static str,
        /// Required size in bytes.
        required: vk::DeviceSize,
        /// Actual size in bytes.
        available: vk::DeviceSize,
    },
    /// The prebuild query or the build input itself is invalid.
    #[error("Invalid build input: {0}")]
    InvalidBuildInput(&'static str),
    /// Structural geometry validation failed.
    #[error("Invalid geometry {index}: {reason}")]
    InvalidGeometry {
        /// Index of the offending geometry in the build input.
        index: usize,
        /// Human readable reason.
        reason: String,
    },
    /// A required buffer was not created before use.
    #[error("Missing {0} buffer. Create it before recording this operation.")]
    MissingBuffer(&'static str),
    /// Update requested on a structure that cannot be updated in place.
    #[error("Acceleration structure cannot be updated in place: {0}. A full rebuild is required.")]
    InvalidUpdate(&'static str),
    /// Compaction requested on a structure that was not built with `ALLOW_COMPACTION`.
    #[error("Acceleration structure was not built with ALLOW_COMPACTION.")]
    CompactionNotAllowed,
    /// The compacted size has not been written back by the GPU yet.
    #[error("Compacted size is not available yet. Wait for the build to finish executing.")]
    CompactedSizeUnavailable,
    /// Compaction requested twice without a rebuild in between.
    #[error("Acceleration structure is already compacted.")]
    AlreadyCompacted,
    /// More descriptor regions requested than the heap page reserves.
    #[error("Descriptor region exhausted: requested {kind} region {requested}, but only {capacity} are reserved.")]
    DescriptorRegionExhausted {
        /// `"global"` or `"local"`.
        kind: &'static str,
        /// Zero-based index of the requested region.
        requested: u32,
        /// Reserved region count.
        capacity: u32,
    },
    /// Frame context token does not belong to the current frame or page.
    #[error("Frame context is stale. Call begin_new_frame() and use the new token.")]
    StaleFrameContext,
    /// Shader record written with more descriptor handles than the layout has slots.
    #[error("Shader record has {slots} handle slots, but {given} handles were given.")]
    TooManyHandles {
        /// Handles given.
        given: usize,
        /// Slots available.
        slots: u32,
    },
    /// Shader identifier has the wrong size or is unknown to the identifier source.
    #[error("Invalid shader identifier: {0}")]
    InvalidIdentifier(String),
    /// Shader table with zero records.
    #[error("Shader tables need at least one record.")]
    EmptyShaderTable,
    /// Global binding does not match the bound root signature.
    #[error("Global descriptor binding does not match the root signature: {0}")]
    RootSignatureMismatch(&'static str),
    /// Mappable buffer expected.
    #[error("Requested mappable buffer, but buffer does not have a memory map")]
    UnmappableBuffer,
    /// A backend returned a buffer whose address does not satisfy the requested alignment.
    #[error("Buffer at {address:#x} is not aligned to {alignment} bytes.")]
    MisalignedBuffer {
        /// Address of the buffer.
        address: vk::DeviceAddress,
        /// Required alignment.
        alignment: vk::DeviceSize,
    },
    /// Access outside of a buffer's range.
    #[error("Range is not valid for the buffer.")]
    BufferOutOfRange,
    /// Command stream used in the wrong state, for example recording into a closed stream.
    #[error("Invalid command stream state: {0}")]
    InvalidStreamState(&'static str),
    /// Queue waits on a fence value that can never be signaled.
    #[error("Queues are deadlocked waiting on fences that are never signaled.")]
    QueueDeadlock,
    /// Arena handle refers to a removed or never existing entry.
    #[error("Handle does not refer to a live entry.")]
    InvalidHandle,
    /// Poisoned mutex
    #[error("Poisoned mutex")]
    PoisonError,
    /// Uncategorized error.
    #[error("Uncategorized error: `{0}`")]
    Uncategorized(&'static str),
}

impl From<AllocationError> for Error {
    fn from(value: AllocationError) -> Self {
        Error::AllocationFailure(value.to_string())
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::PoisonError
    }
}
