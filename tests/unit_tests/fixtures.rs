//! Chain meshes and small physics kernels shared by the tests.
use eyre::eyre;
use fenris_system::comm::Communicator;
use fenris_system::dof::{DofManager, DofType};
use fenris_system::equation::{EquationKernel, EquationObject, KernelInput, Side};
use fenris_system::mesh::{Entity, EntityMesh};
use fenris_system::model::{EquationModel, EquationSet};
use fenris_system::settings::DofSettings;
use nalgebra::{DMatrixViewMut, DVector, DVectorViewMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// The rank owning element `e` of a chain with `num_elements` elements split over `num_ranks`.
pub fn element_rank(e: usize, num_elements: usize, num_ranks: usize) -> usize {
    e * num_ranks / num_elements
}

/// Entity `i` is owned by the rank of the element to its left (element 0 for entity 0).
pub fn entity_owner(i: usize, num_elements: usize, num_ranks: usize) -> usize {
    element_rank(i.saturating_sub(1), num_elements, num_ranks)
}

/// The local part of a chain of `num_elements + 1` entities with one element per link.
pub fn chain_partition(
    rank: usize,
    num_ranks: usize,
    num_elements: usize,
    dof_types: &[DofType],
) -> (EntityMesh, Vec<EquationObject>) {
    let elements: Vec<usize> = (0..num_elements)
        .filter(|&e| element_rank(e, num_elements, num_ranks) == rank)
        .collect();
    let mut entity_ids: Vec<usize> = elements.iter().flat_map(|&e| [e, e + 1]).collect();
    entity_ids.sort_unstable();
    entity_ids.dedup();
    let entities = entity_ids
        .iter()
        .map(|&i| Entity::new(i as u64, entity_owner(i, num_elements, num_ranks)))
        .collect();
    let neighbors = [rank.checked_sub(1), Some(rank + 1).filter(|&r| r < num_ranks)]
        .into_iter()
        .flatten()
        .collect();
    let mesh = EntityMesh::new(entities, neighbors).unwrap();
    let objects = elements
        .iter()
        .map(|&e| EquationObject::element(vec![e as u64, e as u64 + 1], dof_types.to_vec()))
        .collect();
    (mesh, objects)
}

/// An initialized model over a partitioned chain.
pub fn chain_model(
    comm: Arc<dyn Communicator>,
    num_elements: usize,
    kernel: Arc<dyn EquationKernel>,
    dof_types: &[DofType],
    parameters: DVector<f64>,
) -> EquationModel {
    let (mesh, objects) = chain_partition(comm.rank(), comm.num_ranks(), num_elements, dof_types);
    let dofs = DofManager::new(Arc::new(mesh), comm, DofSettings::default());
    let sets = vec![EquationSet::new("chain", kernel, objects)];
    let mut model = EquationModel::new(dofs, sets).with_parameters(parameters);
    model.initialize().unwrap();
    model
}

/// Transient reaction-diffusion on two-entity elements with a single `Temp` field.
///
/// Per element, with `m = 1 / (2 dt)` and `d = u_a - u_b`:
///
/// ```text
/// R_a = m (u_a - u_a⁻) + p₁ k d + α u_a³ / 2 - p₀ / 2
/// R_b = m (u_b - u_b⁻) - p₁ k d + α u_b³ / 2 - p₀ / 2
/// Q   = (u_a² + u_b²) / 4 + p₁ / 10
/// ```
#[derive(Debug, Clone)]
pub struct ReactionDiffusion {
    pub stiffness: f64,
    pub alpha: f64,
}

impl ReactionDiffusion {
    pub fn linear() -> Self {
        Self {
            stiffness: 1.0,
            alpha: 0.0,
        }
    }

    pub fn nonlinear(alpha: f64) -> Self {
        Self { stiffness: 1.0, alpha }
    }

    fn rows(input: &KernelInput) -> (usize, usize) {
        let a = input.layout.row(DofType::Temp, 0, Side::Master, 0).unwrap();
        let b = input.layout.row(DofType::Temp, 0, Side::Master, 1).unwrap();
        (a, b)
    }

    fn mass(input: &KernelInput) -> f64 {
        0.5 / input.time_step()
    }
}

impl EquationKernel for ReactionDiffusion {
    fn compute_jacobian(&self, input: &KernelInput, mut jacobian: DMatrixViewMut<f64>) -> eyre::Result<()> {
        let (a, b) = Self::rows(input);
        let (m, p1, k) = (Self::mass(input), input.parameters[1], self.stiffness);
        let u = &input.values;
        jacobian[(a, a)] = m + p1 * k + 1.5 * self.alpha * u[a] * u[a];
        jacobian[(a, b)] = -p1 * k;
        jacobian[(b, a)] = -p1 * k;
        jacobian[(b, b)] = m + p1 * k + 1.5 * self.alpha * u[b] * u[b];
        Ok(())
    }

    fn compute_residual(&self, input: &KernelInput, mut residual: DVectorViewMut<f64>) -> eyre::Result<()> {
        let (a, b) = Self::rows(input);
        let (m, p0, p1, k) = (
            Self::mass(input),
            input.parameters[0],
            input.parameters[1],
            self.stiffness,
        );
        let (u, u_prev) = (&input.values, &input.previous_values);
        let d = u[a] - u[b];
        residual[a] = m * (u[a] - u_prev[a]) + p1 * k * d + 0.5 * self.alpha * u[a].powi(3) - 0.5 * p0;
        residual[b] = m * (u[b] - u_prev[b]) - p1 * k * d + 0.5 * self.alpha * u[b].powi(3) - 0.5 * p0;
        Ok(())
    }

    fn num_qi(&self) -> usize {
        1
    }

    fn compute_qi(&self, input: &KernelInput, qi: &mut [f64]) -> eyre::Result<()> {
        let (a, b) = Self::rows(input);
        let u = &input.values;
        qi[0] += 0.25 * (u[a] * u[a] + u[b] * u[b]) + 0.1 * input.parameters[1];
        Ok(())
    }

    fn compute_dqidu(&self, input: &KernelInput, _qi: usize, mut dqidu: DVectorViewMut<f64>) -> eyre::Result<()> {
        let (a, b) = Self::rows(input);
        dqidu[a] = 0.5 * input.values[a];
        dqidu[b] = 0.5 * input.values[b];
        Ok(())
    }

    fn compute_dqidp_explicit(
        &self,
        _input: &KernelInput,
        _qi: usize,
        mut dqidp: DVectorViewMut<f64>,
    ) -> eyre::Result<()> {
        dqidp[1] = 0.1;
        Ok(())
    }

    fn compute_drdp(&self, input: &KernelInput, mut drdp: DMatrixViewMut<f64>) -> eyre::Result<()> {
        let (a, b) = Self::rows(input);
        let d = input.values[a] - input.values[b];
        drdp[(a, 0)] = -0.5;
        drdp[(b, 0)] = -0.5;
        drdp[(a, 1)] = self.stiffness * d;
        drdp[(b, 1)] = -self.stiffness * d;
        Ok(())
    }

    fn compute_previous_jacobian(&self, input: &KernelInput, mut jacobian: DMatrixViewMut<f64>) -> eyre::Result<()> {
        let (a, b) = Self::rows(input);
        let m = Self::mass(input);
        jacobian[(a, a)] = -m;
        jacobian[(b, b)] = -m;
        Ok(())
    }
}

/// Two weakly coupled fields `u` (`Temp`) and `v` (`P`) on two-entity elements:
///
/// ```text
/// R_u = (u_a - u_b) [1, -1] + (u + β u³ - c v - 1/2) / 2
/// R_v = (v_a - v_b) [1, -1] + (v - c u - 1/4) / 2
/// ```
#[derive(Debug, Clone)]
pub struct CoupledFields {
    pub coupling: f64,
    pub beta: f64,
}

impl Default for CoupledFields {
    fn default() -> Self {
        Self {
            coupling: 0.1,
            beta: 0.05,
        }
    }
}

impl CoupledFields {
    fn rows(input: &KernelInput, dof_type: DofType) -> [usize; 2] {
        [0, 1].map(|position| input.layout.row(dof_type, 0, Side::Master, position).unwrap())
    }
}

impl EquationKernel for CoupledFields {
    fn compute_jacobian(&self, input: &KernelInput, mut jacobian: DMatrixViewMut<f64>) -> eyre::Result<()> {
        let (u, v) = (Self::rows(input, DofType::Temp), Self::rows(input, DofType::P));
        for rows in [u, v] {
            jacobian[(rows[0], rows[0])] += 1.0;
            jacobian[(rows[0], rows[1])] -= 1.0;
            jacobian[(rows[1], rows[0])] -= 1.0;
            jacobian[(rows[1], rows[1])] += 1.0;
        }
        for i in 0..2 {
            let value = input.values[u[i]];
            jacobian[(u[i], u[i])] += 0.5 * (1.0 + 3.0 * self.beta * value * value);
            jacobian[(u[i], v[i])] -= 0.5 * self.coupling;
            jacobian[(v[i], v[i])] += 0.5;
            jacobian[(v[i], u[i])] -= 0.5 * self.coupling;
        }
        Ok(())
    }

    fn compute_residual(&self, input: &KernelInput, mut residual: DVectorViewMut<f64>) -> eyre::Result<()> {
        let (u, v) = (Self::rows(input, DofType::Temp), Self::rows(input, DofType::P));
        let x = &input.values;
        let (du, dv) = (x[u[0]] - x[u[1]], x[v[0]] - x[v[1]]);
        for (i, sign) in [(0, 1.0), (1, -1.0)] {
            let (ui, vi) = (x[u[i]], x[v[i]]);
            residual[u[i]] = sign * du + 0.5 * (ui + self.beta * ui.powi(3) - self.coupling * vi - 0.5);
            residual[v[i]] = sign * dv + 0.5 * (vi - self.coupling * ui - 0.25);
        }
        Ok(())
    }
}

/// A kernel whose evaluation always fails.
#[derive(Debug, Clone)]
pub struct FailingKernel;

impl EquationKernel for FailingKernel {
    fn compute_jacobian(&self, _input: &KernelInput, _jacobian: DMatrixViewMut<f64>) -> eyre::Result<()> {
        Err(eyre!("material law undefined"))
    }

    fn compute_residual(&self, _input: &KernelInput, _residual: DVectorViewMut<f64>) -> eyre::Result<()> {
        Err(eyre!("material law undefined"))
    }
}

/// Pdof values seen by a kernel in one residual evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub time: f64,
    pub master: Vec<u64>,
    pub values: DVector<f64>,
    pub previous_values: DVector<f64>,
}

/// Records the input of every residual evaluation and delegates to an inner kernel.
#[derive(Debug)]
pub struct RecordingKernel<K> {
    pub inner: K,
    pub observations: Mutex<Vec<Observation>>,
}

impl<K> RecordingKernel<K> {
    pub fn new(inner: K) -> Self {
        Self {
            inner,
            observations: Mutex::new(Vec::new()),
        }
    }
}

impl<K: EquationKernel> EquationKernel for RecordingKernel<K> {
    fn compute_jacobian(&self, input: &KernelInput, jacobian: DMatrixViewMut<f64>) -> eyre::Result<()> {
        self.inner.compute_jacobian(input, jacobian)
    }

    fn compute_residual(&self, input: &KernelInput, residual: DVectorViewMut<f64>) -> eyre::Result<()> {
        self.observations.lock().unwrap().push(Observation {
            time: input.time,
            master: input.master.to_vec(),
            values: input.values.clone(),
            previous_values: input.previous_values.clone(),
        });
        self.inner.compute_residual(input, residual)
    }
}

/// Fails the residual of elements touching `entity` for the first `failures` evaluations,
/// then delegates to an inner kernel. On a partitioned chain this fails on a single rank.
#[derive(Debug)]
pub struct LocalFailure<K> {
    pub inner: K,
    pub entity: u64,
    remaining: AtomicUsize,
}

impl<K> LocalFailure<K> {
    pub fn new(inner: K, entity: u64, failures: usize) -> Self {
        Self {
            inner,
            entity,
            remaining: AtomicUsize::new(failures),
        }
    }
}

impl<K: EquationKernel> EquationKernel for LocalFailure<K> {
    fn compute_jacobian(&self, input: &KernelInput, jacobian: DMatrixViewMut<f64>) -> eyre::Result<()> {
        self.inner.compute_jacobian(input, jacobian)
    }

    fn compute_residual(&self, input: &KernelInput, residual: DVectorViewMut<f64>) -> eyre::Result<()> {
        let fails = input.master.contains(&self.entity)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fails {
            return Err(eyre!("material law undefined at entity {}", self.entity));
        }
        self.inner.compute_residual(input, residual)
    }
}
