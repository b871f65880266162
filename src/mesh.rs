//! Plain-data view of the distributed mesh consumed by the dof layer.
use crate::error::{Result, SystemError};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub type EntityId = u64;

/// Global identifier of an assembled dof.
pub type AdofId = u64;

/// One coefficient of an entity's value in terms of a pre-existing basis.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasisCoefficient {
    pub basis_id: u64,
    /// Rank owning the basis function.
    pub owner: usize,
    pub weight: f64,
}

impl BasisCoefficient {
    pub fn new(basis_id: u64, owner: usize, weight: f64) -> Self {
        Self {
            basis_id,
            owner,
            weight,
        }
    }
}

/// A mesh entity (node, vertex, basis support) that can carry pdofs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub owner: usize,
    /// Expansion in an existing basis. Unused when adofs are created per entity.
    pub basis: Vec<BasisCoefficient>,
}

impl Entity {
    pub fn new(id: EntityId, owner: usize) -> Self {
        Self {
            id,
            owner,
            basis: Vec::new(),
        }
    }

    pub fn with_basis(self, basis: Vec<BasisCoefficient>) -> Self {
        Self { basis, ..self }
    }
}

/// The process-local part of a mesh: owned entities plus any ghost entities referenced by local
/// equation objects, together with the communication table.
#[derive(Debug, Clone)]
pub struct EntityMesh {
    entities: Vec<Entity>,
    index: FxHashMap<EntityId, usize>,
    neighbors: Vec<usize>,
}

impl EntityMesh {
    /// `neighbors` is the communication table: the ranks this process exchanges data with.
    pub fn new(entities: Vec<Entity>, mut neighbors: Vec<usize>) -> Result<Self> {
        let mut index = FxHashMap::default();
        for (i, entity) in entities.iter().enumerate() {
            if index.insert(entity.id, i).is_some() {
                return Err(SystemError::precondition(format!(
                    "duplicate entity id {} in mesh",
                    entity.id
                )));
            }
        }
        neighbors.sort_unstable();
        neighbors.dedup();
        Ok(Self {
            entities,
            index,
            neighbors,
        })
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.index.get(&id).map(|&i| &self.entities[i])
    }

    /// Sorted, de-duplicated neighbor ranks.
    pub fn neighbors(&self) -> &[usize] {
        &self.neighbors
    }

    pub fn is_neighbor(&self, rank: usize) -> bool {
        self.neighbors.binary_search(&rank).is_ok()
    }
}

/// A coarse basis function expressed in terms of the next finer level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoarseBasis {
    pub id: u64,
    /// `(fine basis id, weight)` pairs.
    pub children: Vec<(u64, f64)>,
}

/// Refinement relation between basis levels, shared identically by all ranks.
///
/// Level 0 is the basis the adofs are created from (entity IDs when adofs are created per
/// entity). `coarsening[l]` lists the basis functions of level `l + 1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasisHierarchy {
    coarsening: Vec<Vec<CoarseBasis>>,
}

impl BasisHierarchy {
    pub fn new(mut coarsening: Vec<Vec<CoarseBasis>>) -> Self {
        for level in &mut coarsening {
            level.sort_by_key(|basis| basis.id);
        }
        Self { coarsening }
    }

    /// The number of levels including the finest.
    pub fn num_levels(&self) -> usize {
        self.coarsening.len() + 1
    }

    /// Basis functions of level `level + 1`, sorted by ID.
    pub fn coarse_basis(&self, level: usize) -> &[CoarseBasis] {
        &self.coarsening[level]
    }
}
