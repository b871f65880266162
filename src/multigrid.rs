//! Geometric multigrid hierarchy over adofs.
//!
//! The hierarchy is a pure function of the per-level dof maps produced by
//! [`DofManager::multigrid_levels`](crate::dof::DofManager::multigrid_levels) and the basis
//! refinement relation. It only exposes an ordered list of prolongation operators, which the
//! linear backend turns into a V-cycle preconditioner.
use crate::error::{Result, SystemError};
use crate::mesh::BasisHierarchy;
use log::debug;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rustc_hash::FxHashMap;

/// A dof on some multigrid level.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LevelDof {
    pub basis_id: u64,
    pub dof_type: usize,
    pub time_level: usize,
}

/// Maps the dofs of one level (external identifiers) to dense internal indices.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelMap {
    dofs: Vec<LevelDof>,
    index: FxHashMap<LevelDof, usize>,
    by_basis: FxHashMap<u64, Vec<usize>>,
}

impl LevelMap {
    /// The internal index of each dof is its position in `dofs`.
    pub fn new(dofs: Vec<LevelDof>) -> Self {
        let index = dofs.iter().enumerate().map(|(i, &d)| (d, i)).collect();
        let mut by_basis: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
        for (i, dof) in dofs.iter().enumerate() {
            by_basis.entry(dof.basis_id).or_default().push(i);
        }
        Self { dofs, index, by_basis }
    }

    pub fn len(&self) -> usize {
        self.dofs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dofs.is_empty()
    }

    pub fn dofs(&self) -> &[LevelDof] {
        &self.dofs
    }

    pub fn index_of(&self, dof: &LevelDof) -> Option<usize> {
        self.index.get(dof).copied()
    }

    /// The (dof type, time level) pairs carried by a basis function on this level.
    pub fn type_time_pairs(&self, basis_id: u64) -> Vec<(usize, usize)> {
        self.by_basis
            .get(&basis_id)
            .map(|indices| {
                indices
                    .iter()
                    .map(|&i| (self.dofs[i].dof_type, self.dofs[i].time_level))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct GeometricMultigrid {
    prolongations: Vec<CsrMatrix<f64>>,
}

impl GeometricMultigrid {
    /// Builds one prolongation per level transition.
    ///
    /// A coarse dof only interpolates to fine dofs of the same dof type and time level.
    pub fn new(levels: &[LevelMap], hierarchy: &BasisHierarchy) -> Result<Self> {
        if levels.len() != hierarchy.num_levels() {
            return Err(SystemError::precondition(format!(
                "{} level maps given for a hierarchy with {} levels",
                levels.len(),
                hierarchy.num_levels()
            )));
        }

        let mut prolongations = Vec::with_capacity(levels.len().saturating_sub(1));
        for (l, pair) in levels.windows(2).enumerate() {
            let (fine, coarse) = (&pair[0], &pair[1]);
            let mut coo = CooMatrix::new(fine.len(), coarse.len());
            for basis in hierarchy.coarse_basis(l) {
                for (dof_type, time_level) in coarse.type_time_pairs(basis.id) {
                    let lookup = |basis_id| LevelDof {
                        basis_id,
                        dof_type,
                        time_level,
                    };
                    let j = coarse.index_of(&lookup(basis.id)).ok_or_else(|| {
                        SystemError::precondition(format!("coarse basis {} missing from level {}", basis.id, l + 1))
                    })?;
                    for &(child, weight) in &basis.children {
                        if let Some(i) = fine.index_of(&lookup(child)) {
                            coo.push(i, j, weight);
                        }
                    }
                }
            }
            let prolongation = CsrMatrix::from(&coo);
            debug!(
                "Prolongation {}: {}x{} with {} entries",
                l,
                prolongation.nrows(),
                prolongation.ncols(),
                prolongation.nnz()
            );
            prolongations.push(prolongation);
        }
        Ok(Self { prolongations })
    }

    pub fn num_levels(&self) -> usize {
        self.prolongations.len() + 1
    }

    /// Prolongations ordered from the finest level transition to the coarsest.
    pub fn prolongations(&self) -> &[CsrMatrix<f64>] {
        &self.prolongations
    }

    /// Restricts the hierarchy to a subset of finest-level dofs.
    ///
    /// `active` lists finest-level indices in the order of the subsystem. Coarse dofs that lose
    /// all support are dropped, level by level.
    pub fn restricted(&self, active: &[usize]) -> Vec<CsrMatrix<f64>> {
        let mut rows: Vec<usize> = active.to_vec();
        let mut restricted = Vec::with_capacity(self.prolongations.len());
        for prolongation in &self.prolongations {
            let mut supported = vec![false; prolongation.ncols()];
            for &row in &rows {
                let row = prolongation.row(row);
                for (&j, &v) in row.col_indices().iter().zip(row.values()) {
                    if v != 0.0 {
                        supported[j] = true;
                    }
                }
            }
            let columns: Vec<usize> = (0..prolongation.ncols()).filter(|&j| supported[j]).collect();
            if columns.is_empty() {
                break;
            }
            let mut column_index = vec![None; prolongation.ncols()];
            for (new, &old) in columns.iter().enumerate() {
                column_index[old] = Some(new);
            }

            let mut coo = CooMatrix::new(rows.len(), columns.len());
            for (i, &row) in rows.iter().enumerate() {
                let row = prolongation.row(row);
                for (&j, &v) in row.col_indices().iter().zip(row.values()) {
                    if let Some(new_j) = column_index[j] {
                        coo.push(i, new_j, v);
                    }
                }
            }
            restricted.push(CsrMatrix::from(&coo));
            rows = columns;
        }
        restricted
    }
}
