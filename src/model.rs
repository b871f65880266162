//! The equation model: equation sets over one dof manager, assembled into adof space.
//!
//! All assembly operations are collective. Local contributions are computed in parallel over
//! the equation objects of each set and summed across ranks afterwards.
use crate::comm::agree;
use crate::dof::{DofManager, DofType};
use crate::equation::{EquationKernel, EquationObject, SlabState};
use crate::error::{Result, SystemError};
use crate::linear::{SubsystemMap, Triplets};
use crate::vector::{DistributedMap, DistributedVector};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;

/// Equation objects sharing one physics kernel.
#[derive(Clone)]
pub struct EquationSet {
    name: String,
    kernel: Arc<dyn EquationKernel>,
    objects: Vec<EquationObject>,
}

impl fmt::Debug for EquationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EquationSet")
            .field("name", &self.name)
            .field("num_objects", &self.objects.len())
            .finish()
    }
}

impl EquationSet {
    pub fn new(name: impl Into<String>, kernel: Arc<dyn EquationKernel>, objects: Vec<EquationObject>) -> Self {
        Self {
            name: name.into(),
            kernel,
            objects,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self) -> &dyn EquationKernel {
        self.kernel.as_ref()
    }

    pub fn objects(&self) -> &[EquationObject] {
        &self.objects
    }
}

#[derive(Debug)]
pub struct EquationModel {
    dofs: DofManager,
    sets: Vec<EquationSet>,
    map: Option<Arc<DistributedMap>>,
    parameters: DVector<f64>,
}

impl EquationModel {
    pub fn new(dofs: DofManager, sets: Vec<EquationSet>) -> Self {
        Self {
            dofs,
            sets,
            map: None,
            parameters: DVector::zeros(0),
        }
    }

    pub fn with_parameters(self, parameters: DVector<f64>) -> Self {
        Self { parameters, ..self }
    }

    pub fn parameters(&self) -> &DVector<f64> {
        &self.parameters
    }

    /// Replaces the design parameters. The dof layout is unaffected.
    pub fn set_parameters(&mut self, parameters: DVector<f64>) {
        self.parameters = parameters;
    }

    pub fn dof_manager(&self) -> &DofManager {
        &self.dofs
    }

    pub fn sets(&self) -> &[EquationSet] {
        &self.sets
    }

    pub fn is_initialized(&self) -> bool {
        self.map.is_some()
    }

    /// Runs all build steps of the dof manager and the equation objects in order. Collective.
    pub fn initialize(&mut self) -> Result<()> {
        if self.is_initialized() {
            return Err(SystemError::precondition("equation model is already initialized"));
        }
        self.dofs
            .initialize_pdof_type_list(self.sets.iter().flat_map(|set| set.objects.iter()))?;
        self.dofs
            .initialize_pdof_host_list(self.sets.iter_mut().flat_map(|set| set.objects.iter_mut()))?;
        self.dofs.create_adofs()?;
        self.dofs.set_pdof_t_matrix()?;
        for object in self.sets.iter_mut().flat_map(|set| set.objects.iter_mut()) {
            object.build_adof_list(&self.dofs)?;
            object.build_local_to_global_map(&self.dofs)?;
        }
        self.map = Some(Arc::new(self.dofs.distributed_map()?));
        info!(
            "Initialized equation model: {} sets, {} objects, {} global adofs",
            self.sets.len(),
            self.num_objects(),
            self.dofs.num_global_adofs()
        );
        Ok(())
    }

    pub fn num_objects(&self) -> usize {
        self.sets.iter().map(|set| set.objects.len()).sum()
    }

    pub fn map(&self) -> Result<&Arc<DistributedMap>> {
        self.map
            .as_ref()
            .ok_or_else(|| SystemError::precondition("equation model is not initialized"))
    }

    pub fn zeros(&self) -> Result<DistributedVector> {
        Ok(DistributedVector::zeros(Arc::clone(self.map()?)))
    }

    /// Number of quantities of interest, the largest count reported by any kernel.
    pub fn num_qi(&self) -> usize {
        self.sets
            .iter()
            .map(|set| set.kernel.num_qi())
            .max()
            .unwrap_or(0)
    }

    /// Subsystem of the given dof types. Collective.
    pub fn subsystem(&self, dof_types: &[DofType]) -> Result<SubsystemMap> {
        self.map()?;
        let indices = dof_types
            .iter()
            .map(|&t| {
                self.dofs
                    .dof_types()
                    .index_of(t)
                    .ok_or_else(|| SystemError::precondition(format!("dof type {} is not used by the model", t)))
            })
            .collect::<Result<Vec<_>>>()?;
        SubsystemMap::new(&self.dofs, &indices)
    }

    /// Subsystem of all dof types. Collective.
    pub fn full_subsystem(&self) -> Result<SubsystemMap> {
        self.map()?;
        SubsystemMap::all(&self.dofs)
    }

    fn check_slab(&self, slab: &SlabState) -> Result<()> {
        let map = self.map()?;
        if !Arc::ptr_eq(map, slab.current.map()) || !Arc::ptr_eq(map, slab.previous.map()) {
            return Err(SystemError::precondition(
                "solution vectors were not created from this model's distributed map",
            ));
        }
        Ok(())
    }

    /// Evaluates `f` for every equation object, in parallel within each set. Collective.
    ///
    /// Fails on every rank if it fails on any rank.
    fn map_objects<'a, R, F>(&'a self, f: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(&'a EquationSet, &'a EquationObject) -> Result<R> + Sync,
    {
        let comm = self.map()?.comm();
        let local = self.sets.iter().try_fold(
            Vec::with_capacity(self.num_objects()),
            |mut results, set| -> Result<Vec<R>> {
                let set_results = set
                    .objects
                    .par_iter()
                    .with_min_len(16)
                    .map(|object| f(set, object))
                    .collect::<Result<Vec<_>>>()?;
                results.extend(set_results);
                Ok(results)
            },
        );
        agree(comm, local)
    }

    fn add_to_vector(
        &self,
        target: &mut DistributedVector,
        contributions: Vec<(&[u64], DVector<f64>)>,
    ) -> Result<()> {
        let local = contributions.into_iter().try_for_each(|(ids, values)| {
            ids.iter()
                .zip(values.iter())
                .try_for_each(|(&id, &value)| target.add(id, value))
        });
        agree(self.map()?.comm(), local)?;
        target.global_assemble()
    }

    /// Globally assembled residual in adof space.
    pub fn assemble_residual_vector(&self, slab: &SlabState) -> Result<DistributedVector> {
        self.check_slab(slab)?;
        let contributions = self.map_objects(|set, object| {
            let input = object.kernel_input(slab)?;
            Ok((object.unique_adofs(), object.get_residual(set.kernel(), &input)?))
        })?;
        let mut residual = self.zeros()?;
        self.add_to_vector(&mut residual, contributions)?;
        Ok(residual)
    }

    /// Residual entries of the locally owned adofs of a subsystem.
    pub fn assemble_residual(&self, slab: &SlabState, subsystem: &SubsystemMap) -> Result<DVector<f64>> {
        subsystem.extract_owned(&self.assemble_residual_vector(slab)?)
    }

    fn jacobian_triplets(&self, slab: &SlabState, subsystem: &SubsystemMap, transpose: bool) -> Result<Triplets> {
        self.check_slab(slab)?;
        let local = self.map_objects(|set, object| {
            let input = object.kernel_input(slab)?;
            let jacobian = object.get_jacobian(set.kernel(), &input)?;
            let sub: Vec<Option<usize>> = object
                .unique_adofs()
                .iter()
                .map(|&id| subsystem.sub_index(id))
                .collect();
            let mut triplets = Triplets::default();
            for (a, row) in sub.iter().enumerate() {
                for (b, col) in sub.iter().enumerate() {
                    if let (Some(i), Some(j)) = (row, col) {
                        let (i, j) = if transpose { (*j, *i) } else { (*i, *j) };
                        triplets.push(i, j, jacobian[(a, b)]);
                    }
                }
            }
            Ok(triplets)
        })?;
        let mut triplets = Triplets::default();
        for t in local {
            triplets.append(t);
        }
        Ok(triplets)
    }

    /// Jacobian of the subsystem with respect to its own adofs, gathered on every rank.
    ///
    /// Adofs outside of the subsystem are held fixed.
    pub fn assemble_jacobian(&self, slab: &SlabState, subsystem: &SubsystemMap) -> Result<CsrMatrix<f64>> {
        let triplets = self.jacobian_triplets(slab, subsystem, false)?;
        debug!("Assembling jacobian from {} local triplets", triplets.len());
        triplets.gather(self.map()?.comm(), subsystem.len())
    }

    /// Transposed jacobian, as needed by the adjoint solve.
    pub fn assemble_jacobian_transpose(&self, slab: &SlabState, subsystem: &SubsystemMap) -> Result<CsrMatrix<f64>> {
        let triplets = self.jacobian_triplets(slab, subsystem, true)?;
        triplets.gather(self.map()?.comm(), subsystem.len())
    }

    /// Quantities of interest summed over all objects of all ranks.
    pub fn compute_qi(&self, slab: &SlabState) -> Result<DVector<f64>> {
        self.check_slab(slab)?;
        let num_qi = self.num_qi();
        let local = self.map_objects(|set, object| {
            let input = object.kernel_input(slab)?;
            let mut qi = vec![0.0; num_qi];
            object.compute_qi(set.kernel(), &input, &mut qi)?;
            Ok(qi)
        })?;
        let mut total = vec![0.0; num_qi];
        for qi in &local {
            for (t, q) in total.iter_mut().zip(qi) {
                *t += q;
            }
        }
        self.map()?.comm().all_reduce_sum_slice(&mut total)?;
        Ok(DVector::from_vec(total))
    }

    /// Globally assembled `dQ/du` of one quantity of interest.
    pub fn assemble_dqidu(&self, slab: &SlabState, qi: usize) -> Result<DistributedVector> {
        self.check_qi(qi)?;
        self.check_slab(slab)?;
        let contributions = self.map_objects(|set, object| {
            let input = object.kernel_input(slab)?;
            Ok((object.unique_adofs(), object.compute_dqidu(set.kernel(), &input, qi)?))
        })?;
        let mut dqidu = self.zeros()?;
        self.add_to_vector(&mut dqidu, contributions)?;
        Ok(dqidu)
    }

    fn check_qi(&self, qi: usize) -> Result<()> {
        if qi < self.num_qi() {
            Ok(())
        } else {
            Err(SystemError::precondition(format!(
                "quantity of interest {} requested, the model has {}",
                qi,
                self.num_qi()
            )))
        }
    }

    fn sum_parameter_vectors(&self, local: Vec<DVector<f64>>) -> Result<DVector<f64>> {
        let mut total = DVector::zeros(self.parameters.len());
        for v in &local {
            total += v;
        }
        self.map()?.comm().all_reduce_sum_slice(total.as_mut_slice())?;
        Ok(total)
    }

    /// Explicit design sensitivity `∂Q/∂p` of one quantity of interest.
    pub fn assemble_dqidp_explicit(&self, slab: &SlabState, qi: usize) -> Result<DVector<f64>> {
        self.check_qi(qi)?;
        self.check_slab(slab)?;
        let local = self.map_objects(|set, object| {
            let input = object.kernel_input(slab)?;
            object.compute_dqidp_explicit(set.kernel(), &input, qi)
        })?;
        self.sum_parameter_vectors(local)
    }

    /// Implicit design sensitivity `λᵀ ∂R/∂p` for an adjoint vector with current ghosts.
    pub fn assemble_dqidp_implicit(&self, slab: &SlabState, adjoint: &DistributedVector) -> Result<DVector<f64>> {
        self.check_slab(slab)?;
        let local = self.map_objects(|set, object| {
            let input = object.kernel_input(slab)?;
            let lambda = object.gather_adof_values(adjoint)?;
            object.compute_dqidp_implicit(set.kernel(), &input, &lambda)
        })?;
        self.sum_parameter_vectors(local)
    }

    /// Globally assembled `(∂R/∂u_previous)ᵀ λ`, the adjoint load carried to the preceding slab.
    pub fn assemble_previous_jacobian_transpose_product(
        &self,
        slab: &SlabState,
        adjoint: &DistributedVector,
    ) -> Result<DistributedVector> {
        self.check_slab(slab)?;
        let contributions = self.map_objects(|set, object| {
            let input = object.kernel_input(slab)?;
            let jacobian: DMatrix<f64> = object.get_previous_jacobian(set.kernel(), &input)?;
            let lambda = object.gather_adof_values(adjoint)?;
            Ok((object.unique_adofs(), jacobian.tr_mul(&lambda)))
        })?;
        let mut carry = self.zeros()?;
        self.add_to_vector(&mut carry, contributions)?;
        Ok(carry)
    }
}
