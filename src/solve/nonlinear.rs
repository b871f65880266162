//! Newton and nonlinear block Gauss-Seidel iterations over a model.
use crate::comm::CollectiveReduction;
use crate::equation::SlabState;
use crate::error::{AttemptDiagnostics, Result, SystemError};
use crate::linear::{LinearSolver, SubsystemMap};
use crate::model::EquationModel;
use crate::settings::{Algorithm, NewtonConfig, NlbgsConfig};
use crate::vector::DistributedVector;
use fenris_optimize::calculus::{DifferentiableVectorFunction, FunctionError, VectorFunction};
use fenris_optimize::newton::{
    newton_line_search, BacktrackingLineSearch, NewtonError, NewtonOutput, NewtonSettings, NoLineSearch,
};
use fenris_sparse::LinearOperator;
use fenris_traits::Reduction;
use log::{debug, info, warn};
use nalgebra::{DVector, DVectorView, DVectorViewMut};
use nalgebra_sparse::CsrMatrix;

/// Time interval and start-of-slab solution of one nonlinear solve.
#[derive(Debug, Copy, Clone)]
pub struct Slab<'a> {
    pub previous_time: f64,
    pub time: f64,
    pub previous: &'a DistributedVector,
}

/// Summary of a converged nonlinear solve.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceReport {
    pub algorithm: String,
    pub iterations: usize,
    pub initial_residual_norm: f64,
    pub residual_norm: f64,
}

/// Outcome of one nonlinear solve. Errors that cannot be recovered from by retrying are
/// returned as `Err` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Converged(ConvergenceReport),
    Diverged(AttemptDiagnostics),
}

impl Advance {
    pub fn is_converged(&self) -> bool {
        matches!(self, Advance::Converged(_))
    }
}

fn newton_settings(config: &NewtonConfig) -> NewtonSettings<f64> {
    NewtonSettings {
        max_iterations: Some(config.max_iterations),
        tolerance: config.absolute_tolerance,
        relative_tolerance: Some(config.relative_tolerance),
        divergence_limit: config.divergence_limit,
    }
}

/// The residual of a model restricted to a subsystem, seen as a function of the owned
/// subsystem entries.
struct ModelFunction<'a> {
    model: &'a EquationModel,
    linear: &'a LinearSolver,
    subsystem: &'a SubsystemMap,
    slab: Slab<'a>,
    current: &'a mut DistributedVector,
    reduction: CollectiveReduction<'a>,
}

impl<'a> ModelFunction<'a> {
    fn bind(&mut self, x: &DVectorView<f64>) -> Result<()> {
        self.subsystem.insert_owned(self.current, x.rows(0, x.len()))?;
        self.current.import_ghosts()
    }

    fn slab_state(&self) -> SlabState<'_> {
        SlabState {
            previous_time: self.slab.previous_time,
            time: self.slab.time,
            previous: self.slab.previous,
            current: &*self.current,
            parameters: self.model.parameters(),
        }
    }
}

impl<'a> VectorFunction<f64> for ModelFunction<'a> {
    fn dimension(&self) -> usize {
        self.subsystem.num_owned()
    }

    fn eval_into(
        &mut self,
        f: &mut DVectorViewMut<f64>,
        x: &DVectorView<f64>,
    ) -> std::result::Result<(), FunctionError> {
        self.bind(x)?;
        let residual = self.model.assemble_residual(&self.slab_state(), self.subsystem)?;
        f.copy_from(&residual);
        Ok(())
    }

    fn norm(&self, f: &DVectorView<f64>) -> f64 {
        self.reduction.norm(DVectorView::from(f))
    }
}

impl<'a> DifferentiableVectorFunction<f64> for ModelFunction<'a> {
    fn solve_jacobian_system(
        &mut self,
        sol: &mut DVectorViewMut<f64>,
        x: &DVectorView<f64>,
        rhs: &DVectorView<f64>,
    ) -> std::result::Result<(), FunctionError> {
        self.bind(x)?;
        let jacobian = self
            .model
            .assemble_jacobian(&self.slab_state(), self.subsystem)?;
        let comm = self.model.map()?.comm();
        let rhs = self.subsystem.gather(comm, rhs.rows(0, rhs.len()))?;
        let full = self.linear.solve(&jacobian, &rhs, self.subsystem)?;
        let owned = self.subsystem.owned_range();
        sol.copy_from(&full.rows(owned.start, owned.len()));
        Ok(())
    }
}

/// The linear adjoint residual `F(λ) = Aᵀ λ - b` for a gathered, transposed jacobian.
struct AdjointFunction<'a> {
    model: &'a EquationModel,
    linear: &'a LinearSolver,
    subsystem: &'a SubsystemMap,
    transposed_jacobian: &'a CsrMatrix<f64>,
    rhs: &'a DVector<f64>,
    reduction: CollectiveReduction<'a>,
}

impl<'a> VectorFunction<f64> for AdjointFunction<'a> {
    fn dimension(&self) -> usize {
        self.subsystem.num_owned()
    }

    fn eval_into(
        &mut self,
        f: &mut DVectorViewMut<f64>,
        x: &DVectorView<f64>,
    ) -> std::result::Result<(), FunctionError> {
        let comm = self.model.map()?.comm();
        let lambda = self.subsystem.gather(comm, x.rows(0, x.len()))?;
        let mut product = DVector::zeros(lambda.len());
        self.transposed_jacobian
            .apply(DVectorViewMut::from(&mut product), DVectorView::from(&lambda))?;
        let owned = self.subsystem.owned_range();
        f.copy_from(&product.rows(owned.start, owned.len()));
        *f -= self.rhs;
        Ok(())
    }

    fn norm(&self, f: &DVectorView<f64>) -> f64 {
        self.reduction.norm(DVectorView::from(f))
    }
}

impl<'a> DifferentiableVectorFunction<f64> for AdjointFunction<'a> {
    fn solve_jacobian_system(
        &mut self,
        sol: &mut DVectorViewMut<f64>,
        _x: &DVectorView<f64>,
        rhs: &DVectorView<f64>,
    ) -> std::result::Result<(), FunctionError> {
        let comm = self.model.map()?.comm();
        let rhs = self.subsystem.gather(comm, rhs.rows(0, rhs.len()))?;
        let full = self
            .linear
            .solve(self.transposed_jacobian, &rhs, self.subsystem)?;
        let owned = self.subsystem.owned_range();
        sol.copy_from(&full.rows(owned.start, owned.len()));
        Ok(())
    }
}

/// Sorts a Newton failure into a recoverable divergence or a fatal error.
fn classify_failure(algorithm: &str, error: NewtonError) -> Result<AttemptDiagnostics> {
    let (iterations, residual_norm) = match &error {
        NewtonError::MaximumIterationsReached {
            iterations,
            residual_norm,
        }
        | NewtonError::Diverged {
            iterations,
            residual_norm,
        } => (*iterations, *residual_norm),
        _ => (0, f64::NAN),
    };
    let reason = match error {
        NewtonError::FunctionError(inner) | NewtonError::JacobianError(inner) | NewtonError::LineSearchError(inner) => {
            match inner.downcast::<SystemError>() {
                Ok(system_error) if !system_error.is_recoverable() => return Err(*system_error),
                Ok(system_error) => system_error.to_string(),
                Err(other) => other.to_string(),
            }
        }
        other => other.to_string(),
    };
    Ok(AttemptDiagnostics {
        algorithm: algorithm.to_string(),
        iterations,
        residual_norm,
        reason,
    })
}

/// Runs the registered nonlinear algorithms against a model.
#[derive(Debug, Clone)]
pub struct NonlinearSolver {
    algorithms: Vec<Algorithm>,
    linear: LinearSolver,
}

impl NonlinearSolver {
    pub fn new(algorithms: Vec<Algorithm>, linear: LinearSolver) -> Result<Self> {
        if algorithms.is_empty() {
            return Err(SystemError::precondition("at least one nonlinear algorithm must be registered"));
        }
        Ok(Self { algorithms, linear })
    }

    /// The registration table: the primary algorithm first, restart alternates after it.
    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algorithms
    }

    pub fn linear_solver(&self) -> &LinearSolver {
        &self.linear
    }

    /// Solves `R(u) = 0` for the owned entries of `subsystem`, starting from `current`.
    ///
    /// Entries outside of the subsystem are held fixed. On divergence, `current` holds the last
    /// iterate.
    pub fn solve(
        &self,
        algorithm: &Algorithm,
        model: &EquationModel,
        slab: Slab,
        current: &mut DistributedVector,
        subsystem: &SubsystemMap,
    ) -> Result<Advance> {
        debug!("Running {} on {} unknowns", algorithm.name(), subsystem.len());
        match algorithm {
            Algorithm::Newton(config) => self.newton(config, model, slab, current, subsystem),
            Algorithm::Nlbgs(config) => self.nlbgs(config, model, slab, current, subsystem),
        }
    }

    fn newton(
        &self,
        config: &NewtonConfig,
        model: &EquationModel,
        slab: Slab,
        current: &mut DistributedVector,
        subsystem: &SubsystemMap,
    ) -> Result<Advance> {
        let mut x = subsystem.extract_owned(current)?;
        let mut f = DVector::zeros(x.len());
        let mut dx = DVector::zeros(x.len());
        let mut function = ModelFunction {
            model,
            linear: &self.linear,
            subsystem,
            slab,
            current,
            reduction: CollectiveReduction::new(model.map()?.comm()),
        };
        let settings = newton_settings(config);
        let result = if config.line_search {
            newton_line_search(&mut function, &mut x, &mut f, &mut dx, settings, &mut BacktrackingLineSearch)
        } else {
            newton_line_search(&mut function, &mut x, &mut f, &mut dx, settings, &mut NoLineSearch)
        };
        // A broken collective is fatal, even though the iteration only saw a NaN norm
        if let Some(failure) = function.reduction.failure() {
            return Err(failure);
        }
        match result {
            Ok(NewtonOutput {
                iterations,
                initial_residual_norm,
                residual_norm,
            }) => Ok(Advance::Converged(ConvergenceReport {
                algorithm: "Newton".to_string(),
                iterations,
                initial_residual_norm,
                residual_norm,
            })),
            Err(error) => Ok(Advance::Diverged(classify_failure("Newton", error)?)),
        }
    }

    fn residual_norm(
        model: &EquationModel,
        slab: Slab,
        current: &DistributedVector,
        subsystem: &SubsystemMap,
    ) -> Result<f64> {
        let state = SlabState {
            previous_time: slab.previous_time,
            time: slab.time,
            previous: slab.previous,
            current,
            parameters: model.parameters(),
        };
        let residual = model.assemble_residual(&state, subsystem)?;
        Ok(model.map()?.comm().all_reduce_sum(residual.norm_squared())?.sqrt())
    }

    fn nlbgs(
        &self,
        config: &NlbgsConfig,
        model: &EquationModel,
        slab: Slab,
        current: &mut DistributedVector,
        subsystem: &SubsystemMap,
    ) -> Result<Advance> {
        // Groups are intersected with the active dof types of the subsystem, which they must
        // partition
        let dof_types = model.dof_manager().dof_types();
        let mut covered = Vec::new();
        let mut blocks = Vec::new();
        for group in &config.groups {
            let mut types = Vec::new();
            for &dof_type in group {
                let index = match dof_types.index_of(dof_type) {
                    Some(index) if subsystem.active_types().contains(&index) => index,
                    _ => continue,
                };
                if covered.contains(&index) {
                    return Err(SystemError::precondition(format!(
                        "dof type {} appears in more than one NLBGS group",
                        dof_type
                    )));
                }
                covered.push(index);
                types.push(dof_type);
            }
            if !types.is_empty() {
                blocks.push(model.subsystem(&types)?);
            }
        }
        if blocks.is_empty() {
            return Err(SystemError::precondition("NLBGS requires at least one non-empty dof type group"));
        }
        if let Some(&missing) = subsystem.active_types().iter().find(|&i| !covered.contains(i)) {
            let name = dof_types
                .dof_type(missing)
                .map_or_else(|| missing.to_string(), |t| t.to_string());
            return Err(SystemError::precondition(format!(
                "dof type {} is not part of any NLBGS group",
                name
            )));
        }

        let diverged = |iterations: usize, residual_norm: f64, reason: String| {
            Advance::Diverged(AttemptDiagnostics {
                algorithm: "NLBGS".to_string(),
                iterations,
                residual_norm,
                reason,
            })
        };

        // Ghosts of `current` must be up to date on entry
        let initial_residual_norm = match Self::residual_norm(model, slab, current, subsystem) {
            Ok(norm) => norm,
            Err(err) if err.is_recoverable() => return Ok(diverged(0, f64::NAN, err.to_string())),
            Err(err) => return Err(err),
        };
        let converged_norm = f64::max(
            config.absolute_tolerance,
            config.relative_tolerance * initial_residual_norm,
        );
        let mut residual_norm = initial_residual_norm;
        let mut iterations = 0;
        while !(residual_norm <= converged_norm) {
            if !residual_norm.is_finite()
                || config
                    .divergence_limit
                    .map_or(false, |limit| residual_norm > limit * initial_residual_norm)
            {
                return Ok(diverged(iterations, residual_norm, "residual norm diverged".to_string()));
            }
            if iterations == config.max_outer_iterations {
                return Ok(diverged(
                    iterations,
                    residual_norm,
                    "maximum number of outer iterations reached".to_string(),
                ));
            }
            for (b, block) in blocks.iter().enumerate() {
                if let Advance::Diverged(inner) = self.newton(&config.inner, model, slab, current, block)? {
                    return Ok(diverged(
                        iterations,
                        inner.residual_norm,
                        format!("block {} failed: {}", b, inner.reason),
                    ));
                }
            }
            iterations += 1;
            residual_norm = match Self::residual_norm(model, slab, current, subsystem) {
                Ok(norm) => norm,
                Err(err) if err.is_recoverable() => return Ok(diverged(iterations, f64::NAN, err.to_string())),
                Err(err) => return Err(err),
            };
            debug!("NLBGS iter {}: residual norm {}", iterations, residual_norm);
        }
        info!("NLBGS converged after {} outer iterations", iterations);
        Ok(Advance::Converged(ConvergenceReport {
            algorithm: "NLBGS".to_string(),
            iterations,
            initial_residual_norm,
            residual_norm,
        }))
    }

    /// Solves the adjoint system `Aᵀ λ = b` with Newton, given the gathered transposed jacobian
    /// and the owned entries of `b`. Returns the owned entries of `λ`.
    pub fn solve_adjoint(
        &self,
        config: &NewtonConfig,
        model: &EquationModel,
        transposed_jacobian: &CsrMatrix<f64>,
        rhs: &DVector<f64>,
        subsystem: &SubsystemMap,
    ) -> Result<DVector<f64>> {
        let mut lambda = DVector::zeros(rhs.len());
        let mut f = DVector::zeros(rhs.len());
        let mut dx = DVector::zeros(rhs.len());
        let mut function = AdjointFunction {
            model,
            linear: &self.linear,
            subsystem,
            transposed_jacobian,
            rhs,
            reduction: CollectiveReduction::new(model.map()?.comm()),
        };
        let result = newton_line_search(
            &mut function,
            &mut lambda,
            &mut f,
            &mut dx,
            newton_settings(config),
            &mut NoLineSearch,
        );
        if let Some(failure) = function.reduction.failure() {
            return Err(failure);
        }
        match result {
            Ok(output) => {
                debug!("Adjoint solve: {} iterations", output.iterations);
                Ok(lambda)
            }
            Err(error) => {
                let diagnostics = classify_failure("adjoint Newton", error)?;
                warn!("Adjoint solve failed: {}", diagnostics);
                Err(SystemError::LinearSolve(diagnostics.to_string()))
            }
        }
    }
}
