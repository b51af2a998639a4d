//! Keeps the bottom level structures of a scene's meshes and builds the top level structure over them each frame.
//!
//! Geometry is registered once per mesh. Builds are spread over frames, compaction follows a few frames after a
//! build so that the compacted size has long been written back by the time it is read.

use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use ash::vk;

use crate::resource::buffer::BufferCreateInfo;
use crate::scene::arena::{Arena, Handle};
use crate::util::align::align;
use crate::{
    BottomLevelStructure, BuildInput, CommandStream, CompactionState, Device, Error, GeometryDescriptor, GpuBuffer,
    Instance, TopLevelStructure, TransformMatrix,
};

/// Frames between building a structure and compacting it, unless configured otherwise.
pub const DEFAULT_COMPACTION_DELAY: u32 = 3;

/// Per-frame work limits of a [`BvhManager`]. Zero means unlimited.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BvhManagerSettings {
    /// Bottom level structures built per call to [`BvhManager::build_geometry()`]
    pub max_build_per_frame: usize,
    /// Bottom level structures compacted per call to [`BvhManager::build_geometry()`]
    pub max_compact_per_frame: usize,
    /// Calls to [`BvhManager::build_geometry()`] between a build and its compaction
    pub compaction_delay: u32,
}

impl Default for BvhManagerSettings {
    fn default() -> Self {
        Self {
            max_build_per_frame: 0,
            max_compact_per_frame: 0,
            compaction_delay: DEFAULT_COMPACTION_DELAY,
        }
    }
}

impl BvhManagerSettings {
    /// Limit builds per frame.
    pub fn max_build_per_frame(mut self, count: usize) -> Self {
        self.max_build_per_frame = count;
        self
    }

    /// Limit compactions per frame.
    pub fn max_compact_per_frame(mut self, count: usize) -> Self {
        self.max_compact_per_frame = count;
        self
    }

    /// Set the compaction delay.
    pub fn compaction_delay(mut self, frames: u32) -> Self {
        self.compaction_delay = frames;
        self
    }
}

/// A registered mesh: its geometry and the bottom level structure built from it.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct BvhGeometry<D: Device> {
    key: String,
    geometries: Vec<GeometryDescriptor<D::Buffer>>,
    material_count: u32,
    blas: BottomLevelStructure<D>,
    built: bool,
    compaction_delay: u32,
}

impl<D: Device> BvhGeometry<D> {
    /// Key the geometry was registered under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of materials, one per geometry in the mesh
    pub fn material_count(&self) -> u32 {
        self.material_count
    }

    /// Whether the bottom level structure has been built. Only built geometry is placed in scenes.
    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Whether the bottom level structure has been compacted
    pub fn is_compacted(&self) -> bool {
        matches!(self.blas.compaction_state(), CompactionState::Compacted { .. })
    }

    /// The bottom level structure
    pub fn blas(&self) -> &BottomLevelStructure<D> {
        &self.blas
    }
}

/// Handle to geometry registered with a [`BvhManager`]
pub type GeometryHandle<D> = Handle<BvhGeometry<D>>;

/// One placement of registered geometry in a scene.
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct SceneInstance<D: Device> {
    /// Geometry to place
    pub geometry: GeometryHandle<D>,
    /// Object to world transform
    pub transform: TransformMatrix,
    /// Visibility mask
    pub mask: u8,
    /// Custom id visible to shaders
    pub id: u32,
}

impl<D: Device> SceneInstance<D> {
    /// Identity-transformed, fully visible instance of `geometry`.
    pub fn new(geometry: GeometryHandle<D>) -> Self {
        Self {
            geometry,
            transform: TransformMatrix::identity(),
            mask: 0xff,
            id: 0,
        }
    }

    /// Set the transform
    pub fn transform(mut self, transform: TransformMatrix) -> Self {
        self.transform = transform;
        self
    }

    /// Set the visibility mask
    pub fn mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    /// Set the custom id
    pub fn id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }
}

/// Result of [`BvhManager::build_scene()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BvhScene {
    /// Device address of the top level structure
    pub address: vk::DeviceAddress,
    /// Indices into the instance slice that made it into the scene, in instance buffer order
    pub used_instances: Vec<usize>,
    /// Hit group offset given to each used instance
    pub hit_group_offsets: Vec<u32>,
}

/// Owns the bottom level structures of registered geometry and the scene's top level structure.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct BvhManager<D: Device> {
    #[derivative(Debug = "ignore")]
    device: D,
    settings: BvhManagerSettings,
    geometries: Arena<BvhGeometry<D>>,
    keys: HashMap<String, GeometryHandle<D>>,
    waiting: VecDeque<GeometryHandle<D>>,
    scratch: Option<D::Buffer>,
    scene: TopLevelStructure<D>,
}

impl<D: Device> BvhManager<D> {
    /// Create an empty manager.
    pub fn new(device: D, settings: BvhManagerSettings) -> Self {
        Self {
            scene: TopLevelStructure::new(device.clone()),
            device,
            settings,
            geometries: Arena::new(),
            keys: HashMap::new(),
            waiting: VecDeque::new(),
            scratch: None,
        }
    }

    /// Register geometry under `key` and queue it for building. Registering a key twice returns the existing handle
    /// and ignores the new geometry.
    /// # Errors
    /// * Fails with [`Error::InvalidBuildInput`] if `geometries` is empty.
    pub fn add_geometry(
        &mut self,
        key: impl Into<String>,
        geometries: Vec<GeometryDescriptor<D::Buffer>>,
        material_count: u32,
    ) -> Result<GeometryHandle<D>> {
        let key = key.into();
        if let Some(handle) = self.keys.get(&key) {
            return Ok(*handle);
        }
        if geometries.is_empty() {
            return Err(Error::InvalidBuildInput("geometry registered without descriptors").into());
        }
        let handle = self.geometries.insert(BvhGeometry {
            key: key.clone(),
            geometries,
            material_count,
            blas: BottomLevelStructure::new(self.device.clone()),
            built: false,
            compaction_delay: 0,
        });
        self.keys.insert(key, handle);
        self.waiting.push_back(handle);
        Ok(handle)
    }

    /// Unregister geometry. Its buffers go through deferred deletion, so scenes built before still render.
    /// # Errors
    /// * Fails with [`Error::InvalidHandle`] if the geometry was already removed.
    pub fn remove_geometry(&mut self, handle: GeometryHandle<D>) -> Result<()> {
        let mut geometry = self.geometries.remove(handle)?;
        self.keys.remove(&geometry.key);
        self.waiting.retain(|waiting| *waiting != handle);
        geometry.blas.destroy();
        Ok(())
    }

    /// Look up registered geometry.
    /// # Errors
    /// * Fails with [`Error::InvalidHandle`] if the geometry was removed.
    pub fn geometry(&self, handle: GeometryHandle<D>) -> Result<&BvhGeometry<D>> {
        self.geometries.get(handle)
    }

    /// Number of registered geometries
    pub fn geometry_count(&self) -> usize {
        self.geometries.len()
    }

    /// Number of geometries waiting to be built
    pub fn pending_build_count(&self) -> usize {
        self.waiting.len()
    }

    /// The shared scratch buffer, once a build needed one
    pub fn scratch_buffer(&self) -> Option<&D::Buffer> {
        self.scratch.as_ref()
    }

    /// The top level structure of the last scene
    pub fn scene(&self) -> &TopLevelStructure<D> {
        &self.scene
    }

    fn ready_scratch(&mut self, size: vk::DeviceSize) -> Result<D::Buffer> {
        match &self.scratch {
            Some(scratch) if scratch.size() >= size => Ok(scratch.clone()),
            _ => {
                let size = align(size, self.device.properties().scratch_alignment);
                let scratch = self.device.create_buffer(&BufferCreateInfo::scratch("bvh scratch", size))?;
                if let Some(old) = self.scratch.replace(scratch.clone()) {
                    self.device.deferred_delete().push(old);
                }
                debug!("Grew shared acceleration structure scratch buffer to {size} bytes");
                Ok(scratch)
            }
        }
    }

    /// Record builds of waiting geometry, then compactions of geometry whose delay ran out. Call once per frame.
    /// Returns the number of structures built.
    pub fn build_geometry(&mut self, stream: &mut D::CommandStream) -> Result<usize> {
        let flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
        let mut built = 0;
        while self.settings.max_build_per_frame == 0 || built < self.settings.max_build_per_frame {
            let Some(handle) = self.waiting.pop_front() else {
                break;
            };
            let geometries = self.geometries.get(handle)?.geometries.clone();
            let input = BuildInput::bottom(&self.device, geometries, flags)?;
            let scratch = self.ready_scratch(input.sizes().build_scratch_size)?;

            let delay = self.settings.compaction_delay;
            let geometry = self.geometries.get_mut(handle)?;
            geometry.blas.set_scratch_buffer(scratch.clone());
            geometry.blas.create_buffer(input.sizes().size, 0)?;
            geometry.blas.build(stream, &input, true)?;
            geometry.blas.destroy_scratch_buffer();
            geometry.built = true;
            geometry.compaction_delay = delay;
            // The next build reuses the scratch memory.
            stream.uav_barrier(&scratch)?;
            built += 1;
        }

        let candidates = self
            .geometries
            .iter()
            .filter(|(_, geometry)| geometry.built && geometry.blas.compaction_state() != CompactionState::NotRequested)
            .filter(|(_, geometry)| !geometry.is_compacted())
            .map(|(handle, _)| handle)
            .collect::<Vec<_>>();
        let mut compacted = 0;
        for handle in candidates {
            if self.settings.max_compact_per_frame != 0 && compacted >= self.settings.max_compact_per_frame {
                break;
            }
            let geometry = self.geometries.get_mut(handle)?;
            if geometry.compaction_delay > 0 {
                geometry.compaction_delay -= 1;
                continue;
            }
            match geometry.blas.compact(stream, true) {
                Ok(()) => compacted += 1,
                Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::CompactedSizeUnavailable)) => {
                    warn!("Compacted size of {} is not available yet, trying again next frame", geometry.key);
                }
                Err(err) => return Err(err),
            }
        }
        if built > 0 || compacted > 0 {
            debug!("Recorded {built} bottom level builds and {compacted} compactions");
        }
        Ok(built)
    }

    /// Record a build of the top level structure over `instances`. Instances of geometry that is not built yet are
    /// skipped. Each instance's hit group offset is the number of materials placed before it times
    /// `hit_groups_per_material`. Returns `None` if no instance could be placed.
    pub fn build_scene(
        &mut self,
        stream: &mut D::CommandStream,
        instances: &[SceneInstance<D>],
        hit_groups_per_material: u32,
    ) -> Result<Option<BvhScene>> {
        let mut material_total = 0;
        let mut used_instances = vec![];
        let mut hit_group_offsets = vec![];
        let mut placed = vec![];
        for (index, instance) in instances.iter().enumerate() {
            let Ok(geometry) = self.geometries.get(instance.geometry) else {
                warn!("Scene instance {index} refers to removed geometry, skipping it");
                continue;
            };
            if !geometry.built {
                debug!("Scene instance {index} uses geometry {} that is not built yet, skipping it", geometry.key);
                continue;
            }
            let offset = material_total * hit_groups_per_material;
            placed.push(
                Instance::new(&geometry.blas)
                    .transform(instance.transform)
                    .mask(instance.mask)
                    .id(instance.id)
                    .hit_group_offset(offset),
            );
            used_instances.push(index);
            hit_group_offsets.push(offset);
            material_total += geometry.material_count;
        }
        if placed.is_empty() {
            return Ok(None);
        }

        let input = BuildInput::top(
            &self.device,
            placed.len() as u32,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        )?;
        self.scene.create_instance_buffer(&placed)?;
        drop(placed);
        let scratch = self.ready_scratch(input.sizes().build_scratch_size)?;
        self.scene.set_scratch_buffer(scratch);
        self.scene.create_buffer(input.sizes().size, 0)?;
        self.scene.build(stream, &input, true)?;
        self.scene.destroy_scratch_buffer();

        let address = self.scene.address().ok_or(Error::MissingBuffer("result"))?;
        Ok(Some(BvhScene {
            address,
            used_instances,
            hit_group_offsets,
        }))
    }

    /// Release every structure and the scratch buffer through deferred deletion.
    pub fn destroy(&mut self) {
        let handles = self.geometries.iter().map(|(handle, _)| handle).collect::<Vec<_>>();
        for handle in handles {
            if let Ok(mut geometry) = self.geometries.remove(handle) {
                geometry.blas.destroy();
            }
        }
        self.keys.clear();
        self.waiting.clear();
        if let Some(scratch) = self.scratch.take() {
            self.device.deferred_delete().push(scratch);
        }
        self.scene.destroy();
    }
}
