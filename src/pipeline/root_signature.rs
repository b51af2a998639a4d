//! Root signature descriptions for ray tracing pipelines.
//!
//! The global root signature is bound once per dispatch, the local root signature describes the handles stored in
//! each shader record. Both are plain descriptions: backends translate them into their own pipeline layout objects.

use anyhow::{bail, Result};

use crate::descriptor::global_set::{DescriptorTable, GlobalBinding};
use crate::descriptor::layout::LocalSlotLayout;
use crate::Error;

/// Register space of local root arguments.
pub const LOCAL_REGISTER_SPACE: u32 = 1;

/// Kind of descriptors in a descriptor table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DescriptorRangeType {
    /// Constant buffers, registers `b`
    Cbv,
    /// Shader resources, registers `t`
    Srv,
    /// Unordered access views, registers `u`
    Uav,
    /// Samplers, registers `s`
    Sampler,
}

/// One root parameter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RootParameter {
    /// An acceleration structure passed by address as a root shader resource.
    AccelerationStructure {
        /// Shader register `t`
        register: u32,
        /// Register space
        space: u32,
    },
    /// A table of consecutive descriptors in a heap.
    DescriptorTable {
        /// Descriptor kind
        range: DescriptorRangeType,
        /// First shader register
        base_register: u32,
        /// Number of descriptors
        count: u32,
        /// Register space
        space: u32,
    },
}

/// Whether a root signature is bound per dispatch or per shader record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RootSignatureKind {
    /// Bound with [`CommandStream::set_ray_tracing_global_root()`](crate::CommandStream::set_ray_tracing_global_root)
    Global,
    /// Stored in shader records
    Local,
}

/// Ordered list of root parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootSignature {
    kind: RootSignatureKind,
    parameters: Vec<RootParameter>,
}

impl RootSignature {
    /// Global or local
    pub fn kind(&self) -> RootSignatureKind {
        self.kind
    }

    /// Parameters in binding order
    pub fn parameters(&self) -> &[RootParameter] {
        &self.parameters
    }

    /// Number of parameters. For a local root signature this is the number of handle slots in a shader record.
    pub fn slot_count(&self) -> u32 {
        self.parameters.len() as u32
    }

    /// Number of root acceleration structure parameters
    pub fn acceleration_structure_count(&self) -> u32 {
        self.parameters
            .iter()
            .filter(|p| matches!(p, RootParameter::AccelerationStructure { .. }))
            .count() as u32
    }

    /// The descriptor table parameter of kind `range`, if any.
    pub fn table(&self, range: DescriptorRangeType) -> Option<&RootParameter> {
        self.parameters.iter().find(|p| {
            matches!(p, RootParameter::DescriptorTable { range: r, .. } if *r == range)
        })
    }

    /// Check that `binding` provides exactly the parameters of this global root signature.
    /// # Errors
    /// * Fails with [`Error::RootSignatureMismatch`] on any difference.
    pub fn validate_binding(&self, binding: &GlobalBinding) -> Result<()> {
        if self.kind != RootSignatureKind::Global {
            bail!(Error::RootSignatureMismatch("local root signatures cannot be bound per dispatch"));
        }
        if binding.acceleration_structures.len() != self.acceleration_structure_count() as usize {
            bail!(Error::RootSignatureMismatch("acceleration structure count differs"));
        }
        let tables = [
            (DescriptorRangeType::Cbv, binding.cbv, "constant buffer table differs"),
            (DescriptorRangeType::Srv, binding.srv, "shader resource table differs"),
            (DescriptorRangeType::Uav, binding.uav, "unordered access table differs"),
            (DescriptorRangeType::Sampler, binding.sampler, "sampler table differs"),
        ];
        for (range, table, reason) in tables {
            let expected = match self.table(range) {
                Some(RootParameter::DescriptorTable { count, .. }) => Some(*count),
                _ => None,
            };
            if expected != table.map(|t: DescriptorTable| t.count) {
                bail!(Error::RootSignatureMismatch(reason));
            }
        }
        Ok(())
    }
}

/// Describe the global and local root signatures of a ray tracing pipeline.
///
/// The global signature starts with `acceleration_structure_count` root acceleration structures in `t0..`,
/// followed by one table each for constant buffers (`b0..`), shader resources (starting after the acceleration
/// structures), unordered access views (`u0..`) and samplers (`s0..`). Tables without descriptors are left out.
///
/// The local signature lives in register space 1 and always has four tables, one per kind, sized by `local`.
pub fn create_ray_tracing_root_signatures(
    acceleration_structure_count: u32,
    global_cbv: u32,
    global_srv: u32,
    global_uav: u32,
    global_sampler: u32,
    local: &LocalSlotLayout,
) -> (RootSignature, RootSignature) {
    let mut parameters = (0..acceleration_structure_count)
        .map(|register| RootParameter::AccelerationStructure {
            register,
            space: 0,
        })
        .collect::<Vec<_>>();
    let tables = [
        (DescriptorRangeType::Cbv, 0, global_cbv),
        (DescriptorRangeType::Srv, acceleration_structure_count, global_srv),
        (DescriptorRangeType::Uav, 0, global_uav),
        (DescriptorRangeType::Sampler, 0, global_sampler),
    ];
    parameters.extend(tables.into_iter().filter(|(_, _, count)| *count > 0).map(|(range, base_register, count)| {
        RootParameter::DescriptorTable {
            range,
            base_register,
            count,
            space: 0,
        }
    }));
    let global = RootSignature {
        kind: RootSignatureKind::Global,
        parameters,
    };

    let local = RootSignature {
        kind: RootSignatureKind::Local,
        parameters: [
            (DescriptorRangeType::Cbv, local.cbv),
            (DescriptorRangeType::Srv, local.srv),
            (DescriptorRangeType::Uav, local.uav),
            (DescriptorRangeType::Sampler, local.sampler),
        ]
        .into_iter()
        .map(|(range, count)| RootParameter::DescriptorTable {
            range,
            base_register: 0,
            count,
            space: LOCAL_REGISTER_SPACE,
        })
        .collect(),
    };
    (global, local)
}
