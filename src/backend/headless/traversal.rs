//! Brute force ray traversal over the serialized acceleration structures.

use ash::vk;
use glam::{Affine3A, Vec2, Vec3};

use crate::backend::headless::accel_format::{Header, Primitive, PrimitiveRecord, HEADER_SIZE, RECORD_SIZE};
use crate::backend::headless::HeadlessDevice;
use crate::{AccelerationStructureInstance, AccelerationStructureType};

const PARALLEL_EPSILON: f32 = 1e-8;

/// A ray segment `origin + t * direction` for `t` in `t_min..=t_max`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Ray {
    /// Start point
    pub origin: Vec3,
    /// Direction, not necessarily normalized
    pub direction: Vec3,
    /// Closest accepted hit distance
    pub t_min: f32,
    /// Farthest accepted hit distance
    pub t_max: f32,
}

impl Ray {
    /// Ray from `origin` along `direction` with `t` in `0..=f32::MAX`.
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            t_min: 0.0,
            t_max: f32::MAX,
        }
    }

    /// Set the accepted distance range.
    pub fn range(mut self, t_min: f32, t_max: f32) -> Self {
        self.t_min = t_min;
        self.t_max = t_max;
        self
    }
}

/// What a ray hit.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum HitKind {
    /// A triangle, with barycentrics
    Triangle,
    /// A procedural box
    Procedural,
}

/// The closest intersection of a ray.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Hit {
    /// Ray parameter of the hit
    pub t: f32,
    /// Barycentrics of the second and third vertex, zero for procedural hits
    pub barycentrics: Vec2,
    /// Kind of primitive hit
    pub kind: HitKind,
    /// Index of the instance in the top level structure
    pub instance_index: u32,
    /// Custom index of the instance
    pub instance_id: u32,
    /// Index of the geometry in the bottom level structure
    pub geometry_index: u32,
    /// Index of the primitive in its geometry
    pub primitive_index: u32,
    /// Hit position in world space
    pub world_position: Vec3,
    /// Transform of the instance
    pub object_to_world: Affine3A,
    pub(crate) record_offset: u32,
}

pub(crate) fn intersect_triangle(origin: Vec3, direction: Vec3, v: &[Vec3; 3]) -> Option<(f32, Vec2)> {
    let e1 = v[1] - v[0];
    let e2 = v[2] - v[0];
    let p = direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < PARALLEL_EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - v[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let w = direction.dot(q) * inv_det;
    if w < 0.0 || u + w > 1.0 {
        return None;
    }
    Some((e2.dot(q) * inv_det, Vec2::new(u, w)))
}

pub(crate) fn intersect_aabb(origin: Vec3, direction: Vec3, min: Vec3, max: Vec3) -> Option<(f32, f32)> {
    let inv = direction.recip();
    let t0 = (min - origin) * inv;
    let t1 = (max - origin) * inv;
    let near = t0.min(t1).max_element();
    let far = t0.max(t1).min_element();
    (near <= far).then_some((near, far))
}

fn read_structure(device: &HeadlessDevice, address: vk::DeviceAddress, ty: AccelerationStructureType) -> Option<(Header, Vec<u8>)> {
    let header = Header::read(&device.read_memory(address, HEADER_SIZE as u64)?)?;
    if header.ty != ty {
        return None;
    }
    let bytes = device.read_memory(address, header.used)?;
    Some((header, bytes))
}

/// Instances of the top level structure at `address`, `None` if no top level structure lives there.
pub(crate) fn read_instances(device: &HeadlessDevice, address: vk::DeviceAddress) -> Option<Vec<AccelerationStructureInstance>> {
    let (header, bytes) = read_structure(device, address, AccelerationStructureType::TopLevel)?;
    (0..header.count as usize)
        .map(|i| AccelerationStructureInstance::from_bytes(&bytes[HEADER_SIZE + i * RECORD_SIZE..]))
        .collect()
}

/// Primitives of the bottom level structure at `address`, `None` if no bottom level structure lives there.
pub(crate) fn read_primitives(device: &HeadlessDevice, address: vk::DeviceAddress) -> Option<Vec<PrimitiveRecord>> {
    let (header, bytes) = read_structure(device, address, AccelerationStructureType::BottomLevel)?;
    (0..header.count as usize)
        .map(|i| PrimitiveRecord::read(&bytes[HEADER_SIZE + i * RECORD_SIZE..]))
        .collect()
}

/// Find the closest hit of `ray` among the instances of the top level structure at `tlas` whose mask shares a bit
/// with `mask`. Malformed structures are reported through the log and treated as empty.
pub(crate) fn closest_hit(device: &HeadlessDevice, tlas: vk::DeviceAddress, ray: &Ray, mask: u8) -> Option<Hit> {
    let Some(instances) = read_instances(device, tlas) else {
        error!("Ray traced against {tlas:#x}, which holds no top level acceleration structure");
        return None;
    };

    let mut closest: Option<Hit> = None;
    for (instance_index, instance) in instances.iter().enumerate() {
        if instance.instance_mask() & mask == 0 {
            continue;
        }
        let Some(primitives) = read_primitives(device, instance.reference()) else {
            error!(
                "Instance {instance_index} references {:#x}, which holds no bottom level acceleration structure",
                instance.reference()
            );
            continue;
        };
        let object_to_world = instance.transform_matrix().to_affine();
        let world_to_object = object_to_world.inverse();
        let origin = world_to_object.transform_point3(ray.origin);
        let direction = world_to_object.transform_vector3(ray.direction);
        let t_max = closest.as_ref().map_or(ray.t_max, |hit| hit.t);

        for record in &primitives {
            let candidate = match record.primitive {
                Primitive::Triangle(v) => intersect_triangle(origin, direction, &v)
                    .filter(|(t, _)| *t >= ray.t_min && *t < t_max)
                    .map(|(t, bary)| (t, bary, HitKind::Triangle)),
                Primitive::Aabb {
                    min,
                    max,
                } => intersect_aabb(origin, direction, min, max).and_then(|(near, far)| {
                    [near, far]
                        .into_iter()
                        .find(|t| *t >= ray.t_min && *t < t_max)
                        .map(|t| (t, Vec2::ZERO, HitKind::Procedural))
                }),
            };
            let Some((t, barycentrics, kind)) = candidate else {
                continue;
            };
            if closest.as_ref().is_some_and(|hit| hit.t <= t) {
                continue;
            }
            closest = Some(Hit {
                t,
                barycentrics,
                kind,
                instance_index: instance_index as u32,
                instance_id: instance.instance_custom_index(),
                geometry_index: record.geometry_index,
                primitive_index: record.primitive_index,
                world_position: ray.origin + ray.direction * t,
                object_to_world,
                record_offset: instance.record_offset(),
            });
        }
    }
    closest
}
