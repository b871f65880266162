//! Equation objects: units of local assembly and their projection into adof space.
//!
//! A physics kernel only ever sees pdof space. The equation object pulls global values into
//! pdof space through its local-to-global map `T` and pushes kernel output back with `Tᵀ`:
//!
//! ```text
//! u_pdof = T u_adof,    R_adof = Tᵀ R_pdof,    J_adof = Tᵀ J_pdof T
//! ```
use crate::dof::{DofManager, DofType};
use crate::error::{Result, SystemError};
use crate::mesh::{AdofId, EntityId};
use crate::vector::DistributedVector;
use eyre::WrapErr;
use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorViewMut};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Element,
    InterfaceCluster,
    GhostFacet,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Side {
    Master,
    Slave,
}

/// Description of one row of an object's local pdof system.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LocalRow {
    pub dof_type: DofType,
    pub dof_type_index: usize,
    pub time_level: usize,
    pub side: Side,
    /// Position of the entity within the master or slave list.
    pub position: usize,
    /// Index of the pdof host in the dof manager.
    pub host: usize,
}

/// Row layout of the local pdof system.
///
/// Rows are ordered by requested dof type (in global type order), then time level, then host
/// with all master hosts before all slave hosts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalLayout {
    rows: Vec<LocalRow>,
}

impl LocalLayout {
    pub(crate) fn new(rows: Vec<LocalRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[LocalRow] {
        &self.rows
    }

    pub fn row(&self, dof_type: DofType, time_level: usize, side: Side, position: usize) -> Option<usize> {
        self.rows.iter().position(|row| {
            row.dof_type == dof_type && row.time_level == time_level && row.side == side && row.position == position
        })
    }

    /// Local rows of the given dof type at the given time level, masters first.
    pub fn rows_of(&self, dof_type: DofType, time_level: usize) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.dof_type == dof_type && row.time_level == time_level)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Everything a kernel may read when evaluating one equation object.
#[derive(Debug)]
pub struct KernelInput<'a> {
    pub kind: ObjectKind,
    pub layout: &'a LocalLayout,
    pub master: &'a [EntityId],
    pub slave: &'a [EntityId],
    /// Pdof values of the current solution, in layout order.
    pub values: DVector<f64>,
    /// Pdof values of the solution at the start of the slab.
    pub previous_values: DVector<f64>,
    pub time: f64,
    pub previous_time: f64,
    pub parameters: &'a DVector<f64>,
}

impl<'a> KernelInput<'a> {
    pub fn time_step(&self) -> f64 {
        self.time - self.previous_time
    }
}

/// Solution state bound on the model for one assembly.
#[derive(Debug, Copy, Clone)]
pub struct SlabState<'a> {
    pub previous_time: f64,
    pub time: f64,
    pub previous: &'a DistributedVector,
    pub current: &'a DistributedVector,
    pub parameters: &'a DVector<f64>,
}

/// Physics of one equation set, evaluated in pdof space.
///
/// Output buffers are zeroed and sized by the caller: `n` is the number of layout rows and `p`
/// the number of design parameters.
pub trait EquationKernel: Send + Sync {
    /// `n x n` derivative of the residual with respect to the current pdof values.
    fn compute_jacobian(&self, input: &KernelInput, jacobian: DMatrixViewMut<f64>) -> eyre::Result<()>;

    fn compute_residual(&self, input: &KernelInput, residual: DVectorViewMut<f64>) -> eyre::Result<()>;

    fn num_qi(&self) -> usize {
        0
    }

    /// Adds this object's contribution to each quantity of interest.
    fn compute_qi(&self, _input: &KernelInput, _qi: &mut [f64]) -> eyre::Result<()> {
        Ok(())
    }

    fn compute_dqidu(&self, _input: &KernelInput, _qi: usize, _dqidu: DVectorViewMut<f64>) -> eyre::Result<()> {
        Ok(())
    }

    /// Explicit derivative of a quantity of interest with respect to the `p` design parameters.
    fn compute_dqidp_explicit(
        &self,
        _input: &KernelInput,
        _qi: usize,
        _dqidp: DVectorViewMut<f64>,
    ) -> eyre::Result<()> {
        Ok(())
    }

    /// `n x p` derivative of the residual with respect to the design parameters.
    fn compute_drdp(&self, _input: &KernelInput, _drdp: DMatrixViewMut<f64>) -> eyre::Result<()> {
        Ok(())
    }

    /// `n x n` derivative of the residual with respect to the pdof values of the previous slab.
    fn compute_previous_jacobian(&self, _input: &KernelInput, _jacobian: DMatrixViewMut<f64>) -> eyre::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectState {
    Uninitialized,
    PdofsBuilt,
    AdofListBuilt,
    MapBuilt,
}

#[derive(Debug, Clone)]
pub struct EquationObject {
    kind: ObjectKind,
    master: Vec<EntityId>,
    slave: Vec<EntityId>,
    dof_types: Vec<DofType>,
    state: ObjectState,
    layout: LocalLayout,
    unique_adofs: Vec<AdofId>,
    t_map: DMatrix<f64>,
}

impl EquationObject {
    pub fn new(kind: ObjectKind, master: Vec<EntityId>, slave: Vec<EntityId>, dof_types: Vec<DofType>) -> Self {
        Self {
            kind,
            master,
            slave,
            dof_types,
            state: ObjectState::Uninitialized,
            layout: LocalLayout::default(),
            unique_adofs: Vec::new(),
            t_map: DMatrix::zeros(0, 0),
        }
    }

    pub fn element(entities: Vec<EntityId>, dof_types: Vec<DofType>) -> Self {
        Self::new(ObjectKind::Element, entities, Vec::new(), dof_types)
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn master(&self) -> &[EntityId] {
        &self.master
    }

    pub fn slave(&self) -> &[EntityId] {
        &self.slave
    }

    /// Dof types requested by this object, in declaration order.
    pub fn dof_types(&self) -> &[DofType] {
        &self.dof_types
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn layout(&self) -> &LocalLayout {
        &self.layout
    }

    /// Sorted, unique adof IDs referenced by this object.
    pub fn unique_adofs(&self) -> &[AdofId] {
        &self.unique_adofs
    }

    /// The `(local pdof rows) x (unique adofs)` map `T`.
    pub fn local_to_global_map(&self) -> Result<&DMatrix<f64>> {
        self.require(ObjectState::MapBuilt, "the local-to-global map")?;
        Ok(&self.t_map)
    }

    pub(crate) fn set_pdof_layout(&mut self, layout: LocalLayout) {
        self.layout = layout;
        self.unique_adofs.clear();
        self.t_map = DMatrix::zeros(0, 0);
        self.state = ObjectState::PdofsBuilt;
    }

    fn require(&self, state: ObjectState, what: &str) -> Result<()> {
        if self.state < state {
            Err(SystemError::precondition(format!(
                "{} requested on equation object in state {:?}, requires {:?}",
                what, self.state, state
            )))
        } else {
            Ok(())
        }
    }

    fn t_matrix_rows<'a>(&'a self, dofs: &'a DofManager) -> impl Iterator<Item = Result<(&'a [AdofId], &'a [f64])>> {
        self.layout.rows().iter().map(move |row| {
            dofs.host(row.host)
                .and_then(|host| host.t_matrix(row.dof_type_index, row.time_level))
        })
    }

    /// Collects the sorted, de-duplicated adof IDs of all rows.
    pub fn build_adof_list(&mut self, dofs: &DofManager) -> Result<()> {
        self.require(ObjectState::PdofsBuilt, "the adof list")?;
        let mut ids = Vec::new();
        for row in self.t_matrix_rows(dofs) {
            ids.extend_from_slice(row?.0);
        }
        ids.sort_unstable();
        ids.dedup();
        self.unique_adofs = ids;
        self.state = self.state.max(ObjectState::AdofListBuilt);
        Ok(())
    }

    /// Builds `T`, whose columns follow the sorted unique adof list.
    ///
    /// Calling this again on an unchanged object reproduces the same map.
    pub fn build_local_to_global_map(&mut self, dofs: &DofManager) -> Result<()> {
        self.require(ObjectState::AdofListBuilt, "the local-to-global map")?;
        let mut t_map = DMatrix::zeros(self.layout.len(), self.unique_adofs.len());
        for (i, row) in self.t_matrix_rows(dofs).enumerate() {
            let (ids, coefficients) = row?;
            for (id, &c) in ids.iter().zip(coefficients) {
                let j = self.unique_adofs.binary_search(id).map_err(|_| {
                    SystemError::precondition(format!(
                        "adof {} is not in the adof list of the equation object; rebuild the list first",
                        id
                    ))
                })?;
                t_map[(i, j)] += c;
            }
        }
        self.t_map = t_map;
        self.state = ObjectState::MapBuilt;
        Ok(())
    }

    /// Values of the unique adofs of this object.
    pub fn gather_adof_values(&self, vector: &DistributedVector) -> Result<DVector<f64>> {
        self.require(ObjectState::AdofListBuilt, "adof values")?;
        let values = self
            .unique_adofs
            .iter()
            .map(|&id| vector.get(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(DVector::from_vec(values))
    }

    /// Pulls the values of a global vector into local pdof space.
    pub fn get_local_values(&self, vector: &DistributedVector) -> Result<DVector<f64>> {
        self.require(ObjectState::MapBuilt, "local values")?;
        Ok(&self.t_map * self.gather_adof_values(vector)?)
    }

    pub fn kernel_input<'a>(&'a self, slab: &SlabState<'a>) -> Result<KernelInput<'a>> {
        Ok(KernelInput {
            kind: self.kind,
            layout: &self.layout,
            master: &self.master,
            slave: &self.slave,
            values: self.get_local_values(slab.current)?,
            previous_values: self.get_local_values(slab.previous)?,
            time: slab.time,
            previous_time: slab.previous_time,
            parameters: slab.parameters,
        })
    }

    /// `J_adof = Tᵀ J_pdof T`.
    pub fn get_jacobian(&self, kernel: &dyn EquationKernel, input: &KernelInput) -> Result<DMatrix<f64>> {
        self.require(ObjectState::MapBuilt, "the jacobian")?;
        let n = self.layout.len();
        let mut jacobian = DMatrix::zeros(n, n);
        kernel
            .compute_jacobian(input, DMatrixViewMut::from(&mut jacobian))
            .wrap_err("failed to compute jacobian")
            .map_err(SystemError::Kernel)?;
        Ok(self.project_matrix(&jacobian))
    }

    /// `R_adof = Tᵀ R_pdof`.
    pub fn get_residual(&self, kernel: &dyn EquationKernel, input: &KernelInput) -> Result<DVector<f64>> {
        self.require(ObjectState::MapBuilt, "the residual")?;
        let mut residual = DVector::zeros(self.layout.len());
        kernel
            .compute_residual(input, DVectorViewMut::from(&mut residual))
            .wrap_err("failed to compute residual")
            .map_err(SystemError::Kernel)?;
        Ok(self.t_map.tr_mul(&residual))
    }

    /// Projected derivative of the residual with respect to the previous slab's solution.
    pub fn get_previous_jacobian(&self, kernel: &dyn EquationKernel, input: &KernelInput) -> Result<DMatrix<f64>> {
        self.require(ObjectState::MapBuilt, "the previous jacobian")?;
        let n = self.layout.len();
        let mut jacobian = DMatrix::zeros(n, n);
        kernel
            .compute_previous_jacobian(input, DMatrixViewMut::from(&mut jacobian))
            .wrap_err("failed to compute previous jacobian")
            .map_err(SystemError::Kernel)?;
        Ok(self.project_matrix(&jacobian))
    }

    /// Adds this object's contributions to the quantities of interest.
    pub fn compute_qi(&self, kernel: &dyn EquationKernel, input: &KernelInput, qi: &mut [f64]) -> Result<()> {
        self.require(ObjectState::MapBuilt, "quantities of interest")?;
        kernel
            .compute_qi(input, qi)
            .wrap_err("failed to compute quantities of interest")
            .map_err(SystemError::Kernel)
    }

    /// `Tᵀ dQ/du_pdof` for one quantity of interest.
    pub fn compute_dqidu(&self, kernel: &dyn EquationKernel, input: &KernelInput, qi: usize) -> Result<DVector<f64>> {
        self.require(ObjectState::MapBuilt, "dQI/du")?;
        let mut dqidu = DVector::zeros(self.layout.len());
        kernel
            .compute_dqidu(input, qi, DVectorViewMut::from(&mut dqidu))
            .wrap_err("failed to compute dQI/du")
            .map_err(SystemError::Kernel)?;
        Ok(self.t_map.tr_mul(&dqidu))
    }

    /// Explicit design sensitivity of one quantity of interest.
    pub fn compute_dqidp_explicit(
        &self,
        kernel: &dyn EquationKernel,
        input: &KernelInput,
        qi: usize,
    ) -> Result<DVector<f64>> {
        self.require(ObjectState::MapBuilt, "explicit dQI/dp")?;
        let mut dqidp = DVector::zeros(input.parameters.len());
        kernel
            .compute_dqidp_explicit(input, qi, DVectorViewMut::from(&mut dqidp))
            .wrap_err("failed to compute explicit dQI/dp")
            .map_err(SystemError::Kernel)?;
        Ok(dqidp)
    }

    /// Implicit design sensitivity `λᵀ dR/dp`, where `adjoint` holds the values of the unique
    /// adofs of this object.
    pub fn compute_dqidp_implicit(
        &self,
        kernel: &dyn EquationKernel,
        input: &KernelInput,
        adjoint: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        self.require(ObjectState::MapBuilt, "implicit dQI/dp")?;
        let mut drdp = DMatrix::zeros(self.layout.len(), input.parameters.len());
        kernel
            .compute_drdp(input, DMatrixViewMut::from(&mut drdp))
            .wrap_err("failed to compute dR/dp")
            .map_err(SystemError::Kernel)?;
        // (Tᵀ dR/dp)ᵀ λ = dR/dpᵀ (T λ)
        Ok(drdp.tr_mul(&(&self.t_map * adjoint)))
    }

    fn project_matrix(&self, pdof_matrix: &DMatrix<f64>) -> DMatrix<f64> {
        self.t_map.tr_mul(&(pdof_matrix * &self.t_map))
    }
}
