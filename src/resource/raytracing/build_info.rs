//! Build inputs: what to build, how, and how much memory it takes.

use anyhow::{bail, Result};
use ash::vk;

use crate::{AccelerationStructureBuildSize, AccelerationStructureType, Device, Error, GeometryDescriptor, GpuBuffer};

/// Everything needed to build one acceleration structure: geometry (bottom level) or instance count (top level),
/// build flags, build mode and the sizes reported by the prebuild query.
///
/// Build inputs hold buffer handles, not addresses, so an input can be kept around and reused in later frames.
#[derive(Debug, Clone)]
pub struct BuildInput<B> {
    ty: AccelerationStructureType,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    mode: vk::BuildAccelerationStructureModeKHR,
    geometries: Vec<GeometryDescriptor<B>>,
    instance_count: u32,
    sizes: AccelerationStructureBuildSize,
}

impl<B: GpuBuffer> BuildInput<B> {
    /// Describe a bottom level build over `geometries` and query its sizes.
    /// # Errors
    /// * Fails with [`Error::InvalidGeometry`] if geometry validation is enabled and a descriptor is malformed.
    /// * Fails with [`Error::InvalidBuildInput`] if the prebuild query reports a zero result size.
    pub fn bottom<D: Device<Buffer = B>>(
        device: &D,
        geometries: Vec<GeometryDescriptor<B>>,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<Self> {
        if geometries.is_empty() {
            bail!(Error::InvalidBuildInput("bottom level build without geometry"));
        }
        #[cfg(feature = "geometry-validation")]
        for (index, geometry) in geometries.iter().enumerate() {
            if let Err(reason) = geometry.validate() {
                bail!(Error::InvalidGeometry {
                    index,
                    reason
                });
            }
        }
        Self {
            ty: AccelerationStructureType::BottomLevel,
            flags,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            geometries,
            instance_count: 0,
            sizes: AccelerationStructureBuildSize::default(),
        }
        .query_sizes(device)
    }

    /// Describe a top level build over `instance_count` instances and query its sizes.
    pub fn top<D: Device<Buffer = B>>(device: &D, instance_count: u32, flags: vk::BuildAccelerationStructureFlagsKHR) -> Result<Self> {
        Self {
            ty: AccelerationStructureType::TopLevel,
            flags,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            geometries: vec![],
            instance_count,
            sizes: AccelerationStructureBuildSize::default(),
        }
        .query_sizes(device)
    }

    fn query_sizes<D: Device<Buffer = B>>(mut self, device: &D) -> Result<Self> {
        let sizes = device.query_prebuild_info(&self)?;
        if sizes.size == 0 {
            bail!(Error::InvalidBuildInput("prebuild query reported a zero result size"));
        }
        self.sizes = sizes.aligned(device.properties().scratch_alignment);
        Ok(self)
    }

    /// Turn this into an in-place update of a previous build. The structure must have been built with
    /// `ALLOW_UPDATE` and the same topology.
    pub fn perform_update(mut self) -> Self {
        self.mode = vk::BuildAccelerationStructureModeKHR::UPDATE;
        self
    }

    /// Turn this back into a full build.
    pub fn perform_build(mut self) -> Self {
        self.mode = vk::BuildAccelerationStructureModeKHR::BUILD;
        self
    }

    /// Structure level
    pub fn ty(&self) -> AccelerationStructureType {
        self.ty
    }

    /// Build flags
    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    /// Build mode
    pub fn mode(&self) -> vk::BuildAccelerationStructureModeKHR {
        self.mode
    }

    /// Whether this is an in-place update
    pub fn is_update(&self) -> bool {
        self.mode == vk::BuildAccelerationStructureModeKHR::UPDATE
    }

    /// Whether the flags allow later updates
    pub fn allows_update(&self) -> bool {
        self.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    }

    /// Whether the flags allow compaction
    pub fn allows_compaction(&self) -> bool {
        self.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
    }

    /// Geometry of a bottom level build
    pub fn geometries(&self) -> &[GeometryDescriptor<B>] {
        &self.geometries
    }

    /// Instance count of a top level build
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Primitive count per geometry
    pub fn primitive_counts(&self) -> Vec<u32> {
        self.geometries.iter().map(|g| g.primitive_count()).collect()
    }

    /// Sizes reported by the prebuild query, aligned
    pub fn sizes(&self) -> &AccelerationStructureBuildSize {
        &self.sizes
    }

    /// Scratch bytes this build or update needs
    pub fn required_scratch_size(&self) -> vk::DeviceSize {
        if self.is_update() {
            self.sizes.update_scratch_size
        } else {
            self.sizes.build_scratch_size
        }
    }
}

/// A build as handed to [`CommandStream::build_acceleration_structure()`](crate::CommandStream::build_acceleration_structure).
/// Backends resolve buffer addresses when they record this.
#[derive(Debug)]
pub struct BuildCommand<'a, B> {
    /// What to build
    pub input: &'a BuildInput<B>,
    /// Result buffer
    pub dst: &'a B,
    /// Source structure for updates, `None` for full builds
    pub src: Option<&'a B>,
    /// Scratch memory
    pub scratch: &'a B,
    /// Instance buffer of a top level build
    pub instances: Option<&'a B>,
    /// Receives the compacted size as a little-endian `u64` when set
    pub postbuild_info: Option<&'a B>,
}

/// What a finished build looked like, used to decide whether an update is possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BuildSnapshot {
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub primitive_counts: Vec<u32>,
    pub instance_count: u32,
}

impl BuildSnapshot {
    pub fn new<B: GpuBuffer>(input: &BuildInput<B>) -> Self {
        Self {
            flags: input.flags(),
            primitive_counts: input.primitive_counts(),
            instance_count: input.instance_count(),
        }
    }

    /// Check whether `input` may update a structure last built like this.
    pub fn check_update<B: GpuBuffer>(&self, input: &BuildInput<B>) -> Result<()> {
        if !self.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE) {
            bail!(Error::InvalidUpdate("previous build did not set ALLOW_UPDATE"));
        }
        if !input.allows_update() {
            bail!(Error::InvalidUpdate("update input does not set ALLOW_UPDATE"));
        }
        if self.instance_count != input.instance_count() {
            bail!(Error::InvalidUpdate("instance count changed"));
        }
        if self.primitive_counts != input.primitive_counts() {
            bail!(Error::InvalidUpdate("geometry topology changed"));
        }
        Ok(())
    }
}
