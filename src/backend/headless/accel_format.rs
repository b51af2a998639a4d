//! Serialized form of acceleration structures in the headless backend.
//!
//! Every structure starts with a 32 byte header followed by 64 byte records:
//!
//! | Offset | Size | Contents                                   |
//! |--------|------|--------------------------------------------|
//! | 0      | 4    | magic, `DMAS`                              |
//! | 4      | 4    | level, 0 for bottom and 1 for top          |
//! | 8      | 4    | build flags                                |
//! | 12     | 4    | record count                               |
//! | 16     | 8    | bytes used, header included                |
//! | 24     | 8    | reserved                                   |
//!
//! Bottom level records hold one primitive each, top level records are verbatim copies of the instance records.
//! Result buffers are sized for twice the records so that compaction has something to remove.

use ash::vk;
use glam::Vec3;

use crate::util::align::align;
use crate::{AccelerationStructureBuildSize, AccelerationStructureType};

pub(crate) const MAGIC: u32 = u32::from_le_bytes(*b"DMAS");
pub(crate) const HEADER_SIZE: usize = 32;
pub(crate) const RECORD_SIZE: usize = 64;

pub(crate) const PRIMITIVE_TRIANGLE: u32 = 0;
pub(crate) const PRIMITIVE_AABB: u32 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub ty: AccelerationStructureType,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub count: u32,
    pub used: u64,
}

impl Header {
    pub fn new(ty: AccelerationStructureType, flags: vk::BuildAccelerationStructureFlagsKHR, count: u32) -> Self {
        Self {
            ty,
            flags,
            count,
            used: (HEADER_SIZE + count as usize * RECORD_SIZE) as u64,
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        let level: u32 = match self.ty {
            AccelerationStructureType::BottomLevel => 0,
            AccelerationStructureType::TopLevel => 1,
        };
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&level.to_le_bytes());
        out[8..12].copy_from_slice(&self.flags.as_raw().to_le_bytes());
        out[12..16].copy_from_slice(&self.count.to_le_bytes());
        out[16..24].copy_from_slice(&self.used.to_le_bytes());
        out[24..32].fill(0);
    }

    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE || u32_at(bytes, 0) != MAGIC {
            return None;
        }
        let ty = match u32_at(bytes, 4) {
            0 => AccelerationStructureType::BottomLevel,
            1 => AccelerationStructureType::TopLevel,
            _ => return None,
        };
        let header = Self {
            ty,
            flags: vk::BuildAccelerationStructureFlagsKHR::from_raw(u32_at(bytes, 8)),
            count: u32_at(bytes, 12),
            used: u64::from_le_bytes(bytes[16..24].try_into().ok()?),
        };
        (header.used as usize == HEADER_SIZE + header.count as usize * RECORD_SIZE).then_some(header)
    }
}

/// One primitive of a bottom level structure.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum Primitive {
    Triangle([Vec3; 3]),
    Aabb { min: Vec3, max: Vec3 },
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct PrimitiveRecord {
    pub primitive: Primitive,
    pub geometry_index: u32,
    pub primitive_index: u32,
    pub flags: vk::GeometryFlagsKHR,
}

impl PrimitiveRecord {
    pub fn write(&self, out: &mut [u8]) {
        out[..RECORD_SIZE].fill(0);
        let (floats, kind): (Vec<f32>, u32) = match self.primitive {
            Primitive::Triangle(v) => (v.iter().flat_map(|p| p.to_array()).collect(), PRIMITIVE_TRIANGLE),
            Primitive::Aabb {
                min,
                max,
            } => (min.to_array().into_iter().chain(max.to_array()).collect(), PRIMITIVE_AABB),
        };
        for (i, f) in floats.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
        }
        out[36..40].copy_from_slice(&self.geometry_index.to_le_bytes());
        out[40..44].copy_from_slice(&self.primitive_index.to_le_bytes());
        out[44..48].copy_from_slice(&self.flags.as_raw().to_le_bytes());
        out[48..52].copy_from_slice(&kind.to_le_bytes());
    }

    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_SIZE {
            return None;
        }
        let f = |i: usize| f32_at(bytes, i * 4);
        let v = |i: usize| Vec3::new(f(i), f(i + 1), f(i + 2));
        let primitive = match u32_at(bytes, 48) {
            PRIMITIVE_TRIANGLE => Primitive::Triangle([v(0), v(3), v(6)]),
            PRIMITIVE_AABB => Primitive::Aabb {
                min: v(0),
                max: v(3),
            },
            _ => return None,
        };
        Some(Self {
            primitive,
            geometry_index: u32_at(bytes, 36),
            primitive_index: u32_at(bytes, 40),
            flags: vk::GeometryFlagsKHR::from_raw(u32_at(bytes, 44)),
        })
    }
}

pub(crate) fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn f32_at(bytes: &[u8], offset: usize) -> f32 {
    f32::from_bits(u32_at(bytes, offset))
}

/// Sizes reported by the prebuild query for `count` primitives or instances.
pub(crate) fn prebuild_size(ty: AccelerationStructureType, count: u32) -> AccelerationStructureBuildSize {
    let records = count as u64 * RECORD_SIZE as u64;
    let size = match ty {
        AccelerationStructureType::BottomLevel => HEADER_SIZE as u64 + 2 * records,
        AccelerationStructureType::TopLevel => HEADER_SIZE as u64 + records,
    };
    AccelerationStructureBuildSize {
        size: align(size, 256),
        build_scratch_size: count as u64 * 32 + 256,
        update_scratch_size: count as u64 * 16 + 256,
    }
}

/// Bytes a structure with `count` records occupies after compaction.
pub(crate) fn compacted_size(count: u32) -> u64 {
    (HEADER_SIZE + count as usize * RECORD_SIZE) as u64
}

