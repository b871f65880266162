//! The linear-algebra backend.
//!
//! Distributed systems are gathered on every rank and solved redundantly with one of the solvers
//! of `fenris-sparse`, or with a dense LU factorization.
use crate::comm::Communicator;
use crate::dof::DofManager;
use crate::error::{Result, SystemError};
use crate::mesh::AdofId;
use crate::multigrid::GeometricMultigrid;
use crate::settings::{LinearSolverKind, LinearSolverSettings, PreconditionerKind};
use crate::vector::DistributedVector;
use fenris_sparse::bicgstab::BiCgStab;
use fenris_sparse::cg::{ConjugateGradient, RelativeResidualCriterion, SolveError};
use fenris_sparse::multigrid::{MultigridPreconditioner, VCycleSettings};
use fenris_sparse::{IdentityOperator, JacobiPreconditioner, LinearOperator};
use log::debug;
use nalgebra::{DMatrix, DVector, DVectorView};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rustc_hash::FxHashMap;
use std::ops::Range;
use std::sync::Arc;

/// Numbering of the adofs of a set of active dof types.
///
/// Every rank holds the full list of active global IDs. Sub-indices follow increasing global ID,
/// so the entries owned by one rank form a contiguous range.
#[derive(Debug, Clone)]
pub struct SubsystemMap {
    active_types: Vec<usize>,
    ids: Vec<AdofId>,
    index: FxHashMap<AdofId, usize>,
    owned: Range<usize>,
}

impl SubsystemMap {
    /// Collective.
    pub fn new(dofs: &DofManager, active_types: &[usize]) -> Result<Self> {
        let owned_ids: Vec<AdofId> = dofs
            .owned_adofs()
            .iter()
            .filter(|a| active_types.contains(&a.dof_type()))
            .map(|a| a.global_id)
            .collect();
        let gathered = dofs.comm().all_gather_u64(&owned_ids)?;
        let rank = dofs.comm().rank();
        let start: usize = gathered[..rank].iter().map(Vec::len).sum();
        let ids: Vec<AdofId> = gathered.into_iter().flatten().collect();
        let index = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let mut active_types = active_types.to_vec();
        active_types.sort_unstable();
        Ok(Self {
            active_types,
            ids,
            index,
            owned: start..start + owned_ids.len(),
        })
    }

    /// The subsystem of all dof types.
    pub fn all(dofs: &DofManager) -> Result<Self> {
        let types: Vec<usize> = (0..dofs.dof_types().len()).collect();
        Self::new(dofs, &types)
    }

    pub fn active_types(&self) -> &[usize] {
        &self.active_types
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[AdofId] {
        &self.ids
    }

    pub fn sub_index(&self, id: AdofId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// Sub-indices of the entries owned by this rank.
    pub fn owned_range(&self) -> Range<usize> {
        self.owned.clone()
    }

    pub fn num_owned(&self) -> usize {
        self.owned.len()
    }

    pub fn owned_ids(&self) -> &[AdofId] {
        &self.ids[self.owned.clone()]
    }

    /// Owned active entries of a distributed vector.
    pub fn extract_owned(&self, vector: &DistributedVector) -> Result<DVector<f64>> {
        let values = self
            .owned_ids()
            .iter()
            .map(|&id| vector.get(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(DVector::from_vec(values))
    }

    /// Writes owned active entries. Ghosts are not refreshed.
    pub fn insert_owned(&self, vector: &mut DistributedVector, values: DVectorView<f64>) -> Result<()> {
        for (&id, &value) in self.owned_ids().iter().zip(values.iter()) {
            vector.set(id, value)?;
        }
        Ok(())
    }

    /// Gathers owned active entries of all ranks into a full subsystem vector.
    pub fn gather(&self, comm: &dyn Communicator, owned: DVectorView<f64>) -> Result<DVector<f64>> {
        let local: Vec<f64> = owned.iter().copied().collect();
        let full: Vec<f64> = comm.all_gather_f64(&local)?.into_iter().flatten().collect();
        if full.len() != self.len() {
            return Err(SystemError::ParallelInconsistency(format!(
                "gathered {} subsystem entries, expected {}",
                full.len(),
                self.len()
            )));
        }
        Ok(DVector::from_vec(full))
    }
}

/// Process-local matrix contributions in subsystem numbering.
#[derive(Debug, Clone, Default)]
pub struct Triplets {
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
}

impl Triplets {
    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        self.rows.push(row);
        self.cols.push(col);
        self.values.push(value);
    }

    pub fn append(&mut self, other: Triplets) {
        self.rows.extend(other.rows);
        self.cols.extend(other.cols);
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Collectively sums the contributions of all ranks into an `n x n` matrix.
    pub fn gather(self, comm: &dyn Communicator, n: usize) -> Result<CsrMatrix<f64>> {
        let indices: Vec<u64> = self
            .rows
            .iter()
            .zip(&self.cols)
            .flat_map(|(&i, &j)| [i as u64, j as u64])
            .collect();
        let all_indices = comm.all_gather_u64(&indices)?;
        let all_values = comm.all_gather_f64(&self.values)?;

        let mut coo = CooMatrix::new(n, n);
        for (indices, values) in all_indices.iter().zip(&all_values) {
            if indices.len() != 2 * values.len() {
                return Err(SystemError::Communication("mismatched triplet gather".to_string()));
            }
            for (ij, &v) in indices.chunks_exact(2).zip(values) {
                let (i, j) = (ij[0] as usize, ij[1] as usize);
                if i >= n || j >= n {
                    return Err(SystemError::precondition(format!(
                        "matrix entry ({}, {}) outside of {}x{} system",
                        i, j, n, n
                    )));
                }
                coo.push(i, j, v);
            }
        }
        Ok(CsrMatrix::from(&coo))
    }
}

#[derive(Debug, Clone)]
pub struct LinearSolver {
    settings: LinearSolverSettings,
    multigrid: Option<Arc<GeometricMultigrid>>,
}

fn linear_error<T>(error: SolveError<T>) -> SystemError {
    SystemError::LinearSolve(format!(
        "{} after {} iterations",
        error.kind, error.output.num_iterations
    ))
}

impl LinearSolver {
    pub fn new(settings: LinearSolverSettings) -> Self {
        Self {
            settings,
            multigrid: None,
        }
    }

    pub fn with_multigrid(self, multigrid: Arc<GeometricMultigrid>) -> Self {
        Self {
            multigrid: Some(multigrid),
            ..self
        }
    }

    pub fn settings(&self) -> &LinearSolverSettings {
        &self.settings
    }

    /// Solves `A x = b` on the full (gathered) subsystem.
    pub fn solve(&self, matrix: &CsrMatrix<f64>, rhs: &DVector<f64>, subsystem: &SubsystemMap) -> Result<DVector<f64>> {
        if matrix.nrows() != rhs.len() || matrix.ncols() != rhs.len() {
            return Err(SystemError::precondition(format!(
                "cannot solve {}x{} system with right-hand side of length {}",
                matrix.nrows(),
                matrix.ncols(),
                rhs.len()
            )));
        }
        match self.settings.preconditioner {
            PreconditionerKind::None => self.solve_preconditioned(matrix, rhs, IdentityOperator),
            PreconditionerKind::Jacobi => {
                let jacobi = JacobiPreconditioner::from_csr(matrix)
                    .map_err(|err| SystemError::LinearSolve(err.to_string()))?;
                self.solve_preconditioned(matrix, rhs, jacobi)
            }
            PreconditionerKind::Multigrid => {
                let multigrid = self.multigrid.as_ref().ok_or_else(|| {
                    SystemError::precondition("multigrid preconditioner requested without a multigrid hierarchy")
                })?;
                let active: Vec<usize> = subsystem.ids().iter().map(|&id| id as usize).collect();
                let config = self.settings.multigrid;
                let preconditioner = MultigridPreconditioner::new(
                    matrix.clone(),
                    multigrid.restricted(&active),
                    VCycleSettings {
                        pre_smoothing: config.pre_smoothing,
                        post_smoothing: config.post_smoothing,
                        damping: config.damping,
                    },
                )
                .map_err(|err| SystemError::LinearSolve(err.to_string()))?;
                self.solve_preconditioned(matrix, rhs, preconditioner)
            }
        }
    }

    fn solve_preconditioned<P>(
        &self,
        matrix: &CsrMatrix<f64>,
        rhs: &DVector<f64>,
        preconditioner: P,
    ) -> Result<DVector<f64>>
    where
        P: LinearOperator<f64>,
    {
        let criterion = RelativeResidualCriterion::new(self.settings.relative_tolerance);
        let mut x = DVector::zeros(rhs.len());
        match self.settings.kind {
            LinearSolverKind::Direct => {
                let lu = DMatrix::from(matrix).lu();
                x = lu
                    .solve(rhs)
                    .ok_or_else(|| SystemError::LinearSolve("singular system matrix".to_string()))?;
            }
            LinearSolverKind::Cg => {
                let output = ConjugateGradient::new()
                    .with_operator(matrix)
                    .with_preconditioner(preconditioner)
                    .with_stopping_criterion(criterion)
                    .with_max_iter(self.settings.max_iterations)
                    .solve_with_guess(rhs, &mut x)
                    .map_err(linear_error)?;
                debug!("CG: {} iterations", output.num_iterations);
            }
            LinearSolverKind::BiCgStab => {
                let output = BiCgStab::new()
                    .with_operator(matrix)
                    .with_preconditioner(preconditioner)
                    .with_stopping_criterion(criterion)
                    .with_max_iter(self.settings.max_iterations)
                    .solve_with_guess(rhs, &mut x)
                    .map_err(linear_error)?;
                debug!("BiCGSTAB: {} iterations", output.num_iterations);
            }
        }
        if x.iter().all(|v| v.is_finite()) {
            Ok(x)
        } else {
            Err(SystemError::LinearSolve("solution is not finite".to_string()))
        }
    }
}
