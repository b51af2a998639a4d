//! Instances of bottom level structures, and their packed 64 byte record layout

use anyhow::{bail, Result};
use ash::vk;
use ash::vk::Packed24_8;

use crate::util::to_vk::IntoVulkanType;
use crate::util::transform::TransformMatrix;
use crate::{BottomLevelStructure, Device, Error};

/// Largest value that fits in the 24 bit custom index and record offset fields.
pub const MAX_INSTANCE_FIELD: u32 = 0x00ff_ffff;

/// An instance in the acceleration structure instance buffer
#[derive(Copy, Clone)]
#[repr(transparent)]
pub struct AccelerationStructureInstance(vk::AccelerationStructureInstanceKHR);

const_assert_eq!(std::mem::size_of::<AccelerationStructureInstance>(), 64);

impl Default for AccelerationStructureInstance {
    /// Create a default instance: identity transform, full mask, no structure reference.
    fn default() -> Self {
        Self(vk::AccelerationStructureInstanceKHR {
            transform: TransformMatrix::identity().into_vulkan(),
            instance_custom_index_and_mask: Packed24_8::new(0, 0xff),
            instance_shader_binding_table_record_offset_and_flags: Packed24_8::new(0, 0),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: 0,
            },
        })
    }
}

impl AccelerationStructureInstance {
    /// Set the custom index of this instance. Only 24 bits of precision are supported.
    pub fn custom_index(mut self, idx: u32) -> Result<Self> {
        if idx > MAX_INSTANCE_FIELD {
            bail!(Error::InvalidBuildInput("instance custom index does not fit in 24 bits"));
        }
        self.0.instance_custom_index_and_mask = Packed24_8::new(idx, self.0.instance_custom_index_and_mask.high_8());
        Ok(self)
    }

    /// Set the mask of this instance, used to disable specific instances when tracing
    pub fn mask(mut self, mask: u8) -> Self {
        self.0.instance_custom_index_and_mask = Packed24_8::new(self.0.instance_custom_index_and_mask.low_24(), mask);
        self
    }

    /// Set the hit group offset into the shader binding table for this instance
    pub fn sbt_record_offset(mut self, offset: u32) -> Result<Self> {
        if offset > MAX_INSTANCE_FIELD {
            bail!(Error::InvalidBuildInput("instance hit group offset does not fit in 24 bits"));
        }
        self.0.instance_shader_binding_table_record_offset_and_flags = Packed24_8::new(
            offset,
            self.0.instance_shader_binding_table_record_offset_and_flags.high_8(),
        );
        Ok(self)
    }

    /// Set the instance flags
    pub fn flags(mut self, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.0.instance_shader_binding_table_record_offset_and_flags = Packed24_8::new(
            self.0.instance_shader_binding_table_record_offset_and_flags.low_24(),
            flags.as_raw() as u8,
        );
        self
    }

    /// Set the device address of the bottom level structure this instance refers to
    pub fn acceleration_structure(mut self, address: vk::DeviceAddress) -> Self {
        self.0.acceleration_structure_reference = vk::AccelerationStructureReferenceKHR {
            device_handle: address,
        };
        self
    }

    /// Set this instance's transform matrix
    pub fn transform(mut self, transform: TransformMatrix) -> Self {
        self.0.transform = transform.into_vulkan();
        self
    }

    /// The 24 bit custom index
    pub fn instance_custom_index(&self) -> u32 {
        self.0.instance_custom_index_and_mask.low_24()
    }

    /// The visibility mask
    pub fn instance_mask(&self) -> u8 {
        self.0.instance_custom_index_and_mask.high_8()
    }

    /// The hit group offset
    pub fn record_offset(&self) -> u32 {
        self.0.instance_shader_binding_table_record_offset_and_flags.low_24()
    }

    /// The instance flags
    pub fn instance_flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(u32::from(
            self.0.instance_shader_binding_table_record_offset_and_flags.high_8(),
        ))
    }

    /// Device address of the referenced bottom level structure
    pub fn reference(&self) -> vk::DeviceAddress {
        // SAFETY: Instances are only ever written with device addresses.
        unsafe { self.0.acceleration_structure_reference.device_handle }
    }

    /// The object to world transform
    pub fn transform_matrix(&self) -> TransformMatrix {
        TransformMatrix::from(self.0.transform)
    }

    /// View the record as the bytes the GPU reads.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: The record is repr(C), 64 bytes large and contains no padding.
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, std::mem::size_of::<Self>()) }
    }

    /// Read a record from the first 64 bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < std::mem::size_of::<Self>() {
            return None;
        }
        // SAFETY: Length checked above, every bit pattern is a valid record.
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

impl std::fmt::Debug for AccelerationStructureInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructureInstance")
            .field("transform", &self.transform_matrix())
            .field("custom_index", &self.instance_custom_index())
            .field("mask", &self.instance_mask())
            .field("record_offset", &self.record_offset())
            .field("flags", &self.instance_flags())
            .field("reference", &self.reference())
            .finish()
    }
}

impl IntoVulkanType for AccelerationStructureInstance {
    type Output = vk::AccelerationStructureInstanceKHR;

    fn into_vulkan(self) -> Self::Output {
        self.0
    }
}

/// An instance of a bottom level structure placed in a top level structure.
///
/// The instance borrows its bottom level structure, it never owns it. The structure's address is read when the
/// instance buffer is packed.
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct Instance<'a, D: Device> {
    /// Bottom level structure this instance places in the scene
    pub blas: &'a BottomLevelStructure<D>,
    /// Object to world transform
    pub transform: TransformMatrix,
    /// Custom id visible to shaders, 24 bits
    pub id: u32,
    /// Visibility mask
    pub mask: u8,
    /// Hit group table offset. `None` uses the instance's index in the instance buffer.
    pub hit_group_offset: Option<u32>,
    /// Instance flags
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl<'a, D: Device> Instance<'a, D> {
    /// Identity-transformed, fully visible instance of `blas`.
    pub fn new(blas: &'a BottomLevelStructure<D>) -> Self {
        Self {
            blas,
            transform: TransformMatrix::identity(),
            id: 0,
            mask: 0xff,
            hit_group_offset: None,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
        }
    }

    /// Set the transform
    pub fn transform(mut self, transform: TransformMatrix) -> Self {
        self.transform = transform;
        self
    }

    /// Set the custom id
    pub fn id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Set the visibility mask
    pub fn mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    /// Override the hit group offset
    pub fn hit_group_offset(mut self, offset: u32) -> Self {
        self.hit_group_offset = Some(offset);
        self
    }

    /// Set the instance flags
    pub fn flags(mut self, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.flags = flags;
        self
    }

    /// Pack into the record stored at `index` in the instance buffer.
    pub fn to_record(&self, index: u32) -> Result<AccelerationStructureInstance> {
        let address = self.blas.address().ok_or(Error::MissingBuffer("bottom level result"))?;
        AccelerationStructureInstance::default()
            .transform(self.transform)
            .custom_index(self.id)?
            .mask(self.mask)
            .sbt_record_offset(self.hit_group_offset.unwrap_or(index))
            .map(|record| record.flags(self.flags).acceleration_structure(address))
    }
}
