//! Degrees of freedom: dof types, pdof hosts and the dof manager.
use crate::comm::Communicator;
use crate::error::{Result, SystemError};
use crate::mesh::AdofId;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod host;
pub mod manager;

pub use host::{Pdof, PdofHost};
pub use manager::DofManager;

/// Category of physical unknown.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DofType {
    Ux,
    Uy,
    Uz,
    Temp,
    P,
    Vx,
    Vy,
    Vz,
    LevelSet,
    Other(u16),
}

impl DofType {
    fn code(&self) -> u64 {
        match *self {
            DofType::Ux => 1,
            DofType::Uy => 2,
            DofType::Uz => 3,
            DofType::Temp => 4,
            DofType::P => 5,
            DofType::Vx => 6,
            DofType::Vy => 7,
            DofType::Vz => 8,
            DofType::LevelSet => 9,
            DofType::Other(id) => 1000 + u64::from(id),
        }
    }
}

impl fmt::Display for DofType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DofType::Other(id) => write!(f, "Other({})", id),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Ordered union of dof types, mapping each type to a dense index.
///
/// The order is first-seen over the declarations it was built from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DofTypeMap {
    types: Vec<DofType>,
    index: FxHashMap<DofType, usize>,
}

impl DofTypeMap {
    pub fn from_declarations<'a, I>(declarations: I) -> Self
    where
        I: IntoIterator<Item = &'a [DofType]>,
    {
        let mut map = Self::default();
        for &dof_type in declarations.into_iter().flatten() {
            if !map.index.contains_key(&dof_type) {
                map.index.insert(dof_type, map.types.len());
                map.types.push(dof_type);
            }
        }
        map
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn types(&self) -> &[DofType] {
        &self.types
    }

    pub fn index_of(&self, dof_type: DofType) -> Option<usize> {
        self.index.get(&dof_type).copied()
    }

    pub fn dof_type(&self, index: usize) -> Option<DofType> {
        self.types.get(index).copied()
    }

    /// Order-sensitive hash of the type list.
    pub fn fingerprint(&self) -> u64 {
        // FNV-1a over the type codes
        self.types.iter().fold(0xcbf29ce484222325, |hash, dof_type| {
            (hash ^ dof_type.code()).wrapping_mul(0x100000001b3)
        })
    }

    /// Collectively compares the type list of all ranks.
    ///
    /// Reports disagreement, but never attempts to reconcile it.
    pub fn check_consistency(&self, comm: &dyn Communicator) -> Result<()> {
        let fingerprints = comm.all_gather_u64(&[self.fingerprint(), self.len() as u64])?;
        let mine = [self.fingerprint(), self.len() as u64];
        match fingerprints.iter().position(|other| other.as_slice() != &mine[..]) {
            Some(rank) => Err(SystemError::ParallelInconsistency(format!(
                "dof type list {:?} on rank {} differs from the list on rank {}",
                self.types,
                comm.rank(),
                rank
            ))),
            None => Ok(()),
        }
    }
}

/// Identifies an adof independently of its numbering.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdofKey {
    /// Basis function or, when adofs are created per entity, entity ID.
    pub basis_id: u64,
    pub dof_type: usize,
    pub time_level: usize,
}

/// An assembled, globally numbered dof as seen by one process.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Adof {
    pub global_id: AdofId,
    pub owner: usize,
    pub key: AdofKey,
}

impl Adof {
    pub fn dof_type(&self) -> usize {
        self.key.dof_type
    }

    pub fn time_level(&self) -> usize {
        self.key.time_level
    }
}
