//! Wrapper around `VkTransformMatrixKHR` for easy usage

use ash::vk;
use glam::{Affine3A, Vec3};

use crate::util::to_vk::IntoVulkanType;

/// Represents a row-major 3x4 affine transformation matrix, the layout stored in instance records.
#[derive(Copy, Clone)]
#[repr(transparent)]
pub struct TransformMatrix(vk::TransformMatrixKHR);

impl TransformMatrix {
    /// Create an identity matrix
    pub fn identity() -> Self {
        Self(vk::TransformMatrixKHR {
            matrix: [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        })
    }

    /// Create a pure translation
    pub fn translation(x: f32, y: f32, z: f32) -> Self {
        Self(vk::TransformMatrixKHR {
            matrix: [1.0, 0.0, 0.0, x, 0.0, 1.0, 0.0, y, 0.0, 0.0, 1.0, z],
        })
    }

    /// Build a 3x4 transform matrix from 12 elements, specified in row-major order.
    pub fn from_elements(elements: &[f32; 12]) -> Self {
        Self(vk::TransformMatrixKHR {
            matrix: *elements,
        })
    }

    /// Build a 3x4 transform matrix from 3 rows of 4 elements.
    pub fn from_rows(rows: &[[f32; 4]; 3]) -> Self {
        Self(vk::TransformMatrixKHR {
            matrix: [
                rows[0][0], rows[0][1], rows[0][2], rows[0][3], rows[1][0], rows[1][1], rows[1][2],
                rows[1][3], rows[2][0], rows[2][1], rows[2][2], rows[2][3],
            ],
        })
    }

    /// The 12 elements in row-major order.
    pub fn elements(&self) -> &[f32; 12] {
        &self.0.matrix
    }

    /// Translation column.
    pub fn translation_part(&self) -> Vec3 {
        let m = &self.0.matrix;
        Vec3::new(m[3], m[7], m[11])
    }

    /// Convert to a glam affine transform.
    pub fn to_affine(&self) -> Affine3A {
        let m = &self.0.matrix;
        // glam expects column-major order
        Affine3A::from_cols_array(&[m[0], m[4], m[8], m[1], m[5], m[9], m[2], m[6], m[10], m[3], m[7], m[11]])
    }
}

impl Default for TransformMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::fmt::Debug for TransformMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TransformMatrix").field(&self.0.matrix).finish()
    }
}

impl PartialEq for TransformMatrix {
    fn eq(&self, other: &Self) -> bool {
        self.0.matrix == other.0.matrix
    }
}

impl From<Affine3A> for TransformMatrix {
    fn from(value: Affine3A) -> Self {
        let c = value.to_cols_array();
        Self::from_elements(&[c[0], c[3], c[6], c[9], c[1], c[4], c[7], c[10], c[2], c[5], c[8], c[11]])
    }
}

impl From<vk::TransformMatrixKHR> for TransformMatrix {
    fn from(value: vk::TransformMatrixKHR) -> Self {
        Self(value)
    }
}

impl IntoVulkanType for TransformMatrix {
    type Output = vk::TransformMatrixKHR;

    fn into_vulkan(self) -> Self::Output {
        self.0
    }
}
