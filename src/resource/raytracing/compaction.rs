//! Compaction state machine for bottom level structures.
//!
//! Compaction is a handoff between two GPU passes: the build writes the compacted size, the CPU reads it back, and
//! only then can the compacting copy be recorded. The state only moves forward:
//! `NotRequested -> Pending -> SizeQueried -> Compacted`. A new full build starts over.

use ash::vk;

/// Where a bottom level structure is in the compaction protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompactionState {
    /// The last build did not set `ALLOW_COMPACTION`.
    NotRequested,
    /// The build was recorded together with a compacted size query. The size is not known yet.
    Pending,
    /// The compacted size was read back.
    SizeQueried {
        /// Size the compacted structure needs
        compacted_size: vk::DeviceSize,
    },
    /// The compacting copy was recorded and the structure now lives in the smaller buffer.
    Compacted {
        /// Result buffer size before compaction
        original_size: vk::DeviceSize,
        /// Result buffer size after compaction
        compacted_size: vk::DeviceSize,
    },
}

/// Compaction state together with the readback buffer that carries the size from the GPU.
#[derive(Debug)]
pub(crate) enum CompactionStage<B> {
    NotRequested,
    Pending { readback: B },
    SizeQueried { compacted_size: vk::DeviceSize },
    Compacted { original_size: vk::DeviceSize, compacted_size: vk::DeviceSize },
}

impl<B> CompactionStage<B> {
    pub fn state(&self) -> CompactionState {
        match self {
            CompactionStage::NotRequested => CompactionState::NotRequested,
            CompactionStage::Pending { .. } => CompactionState::Pending,
            CompactionStage::SizeQueried { compacted_size } => CompactionState::SizeQueried {
                compacted_size: *compacted_size,
            },
            CompactionStage::Compacted {
                original_size,
                compacted_size,
            } => CompactionState::Compacted {
                original_size: *original_size,
                compacted_size: *compacted_size,
            },
        }
    }
}
