use crate::error::{Result, SystemError};
use crate::mesh::{AdofId, EntityId};

/// Process-local dof identified by (entity, dof type, time level).
#[derive(Debug, Clone, PartialEq)]
pub struct Pdof {
    pub dof_type: usize,
    pub time_level: usize,
    /// Adofs this pdof depends on. Set by [`DofManager::create_adofs`](super::DofManager::create_adofs).
    pub adof_ids: Vec<AdofId>,
    /// Coefficients of the pdof value in terms of `adof_ids`.
    pub t_matrix: Vec<f64>,
}

/// All pdofs of one entity, indexed by `[dof type][time level]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PdofHost {
    entity: EntityId,
    pdofs: Vec<Vec<Pdof>>,
    t_matrix_built: bool,
}

impl PdofHost {
    pub fn new(entity: EntityId, num_dof_types: usize) -> Self {
        Self {
            entity,
            pdofs: vec![Vec::new(); num_dof_types],
            t_matrix_built: false,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Creates the pdofs of `dof_type` unless they already exist.
    ///
    /// The number of time levels of a dof type is fixed once it has been set.
    pub fn get_or_create_pdofs(&mut self, dof_type: usize, time_levels: usize) -> Result<&[Pdof]> {
        if time_levels == 0 {
            return Err(SystemError::precondition(format!(
                "dof type {} requested with zero time levels on entity {}",
                dof_type, self.entity
            )));
        }
        let entity = self.entity;
        let pdofs = self.pdofs.get_mut(dof_type).ok_or_else(|| {
            SystemError::precondition(format!("unknown dof type index {} on entity {}", dof_type, entity))
        })?;
        if pdofs.is_empty() {
            pdofs.extend((0..time_levels).map(|time_level| Pdof {
                dof_type,
                time_level,
                adof_ids: Vec::new(),
                t_matrix: Vec::new(),
            }));
        } else if pdofs.len() != time_levels {
            return Err(SystemError::precondition(format!(
                "dof type {} on entity {} already has {} time levels, {} requested",
                dof_type,
                entity,
                pdofs.len(),
                time_levels
            )));
        }
        Ok(pdofs.as_slice())
    }

    pub fn has_dof_type(&self, dof_type: usize) -> bool {
        self.pdofs.get(dof_type).map_or(false, |p| !p.is_empty())
    }

    pub fn num_time_levels(&self, dof_type: usize) -> usize {
        self.pdofs.get(dof_type).map_or(0, Vec::len)
    }

    pub fn pdof(&self, dof_type: usize, time_level: usize) -> Option<&Pdof> {
        self.pdofs.get(dof_type)?.get(time_level)
    }

    /// Iterates over all pdofs in `[dof type][time level]` order.
    pub fn pdofs(&self) -> impl Iterator<Item = &Pdof> {
        self.pdofs.iter().flatten()
    }

    pub(crate) fn pdofs_mut(&mut self) -> impl Iterator<Item = &mut Pdof> {
        self.pdofs.iter_mut().flatten()
    }

    pub(crate) fn mark_t_matrix_built(&mut self) {
        self.t_matrix_built = true;
    }

    pub fn is_t_matrix_built(&self) -> bool {
        self.t_matrix_built
    }

    /// Returns the adof dependencies and T-matrix coefficients of a pdof.
    ///
    /// Fails if the T-matrix has not been set for this host.
    pub fn t_matrix(&self, dof_type: usize, time_level: usize) -> Result<(&[AdofId], &[f64])> {
        if !self.t_matrix_built {
            return Err(SystemError::precondition(format!(
                "T-matrix requested on entity {} before it was built",
                self.entity
            )));
        }
        let pdof = self.pdof(dof_type, time_level).ok_or_else(|| {
            SystemError::precondition(format!(
                "entity {} has no pdof of type {} at time level {}",
                self.entity, dof_type, time_level
            ))
        })?;
        Ok((&pdof.adof_ids, &pdof.t_matrix))
    }
}
