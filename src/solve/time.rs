//! Time stepping over a sequence of slabs and the reverse adjoint sweep.
use crate::dof::DofType;
use crate::equation::SlabState;
use crate::error::{AttemptDiagnostics, Result, SystemError};
use crate::linear::{LinearSolver, SubsystemMap};
use crate::model::EquationModel;
use crate::settings::{NewtonConfig, SystemSettings, TimeScheme, TimeSettings};
use crate::solve::nonlinear::{Advance, NonlinearSolver, Slab};
use crate::vector::DistributedVector;
use log::{debug, info, warn};
use nalgebra::DVector;
use std::fmt;
use std::path::Path;

/// Solver state visible to output predicates after a step has converged.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct StepInfo {
    /// Step index, starting at 1.
    pub step: usize,
    pub num_steps: usize,
    pub previous_time: f64,
    pub time: f64,
}

impl StepInfo {
    pub fn is_final(&self) -> bool {
        self.step == self.num_steps
    }
}

pub type OutputPredicate = Box<dyn Fn(&StepInfo) -> bool + Send + Sync>;

/// A named output request, triggered after every step for which the predicate holds.
pub struct OutputRule {
    name: String,
    predicate: OutputPredicate,
}

impl fmt::Debug for OutputRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRule").field("name", &self.name).finish()
    }
}

impl OutputRule {
    pub fn new(name: impl Into<String>, predicate: impl Fn(&StepInfo) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
        }
    }

    /// Output after every `n`-th step and after the final step.
    pub fn every(name: impl Into<String>, n: usize) -> Self {
        Self::new(name, move |info: &StepInfo| {
            info.is_final() || (n > 0 && info.step % n == 0)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    pub name: String,
    pub step: usize,
    pub time: f64,
}

/// How one time step was solved.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub time: f64,
    /// Algorithm and iteration count of the converged solve of each dof type group.
    pub solves: Vec<(String, usize)>,
    /// Failed attempts that preceded convergence.
    pub failed_attempts: Vec<AttemptDiagnostics>,
}

/// Design sensitivity of one quantity of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct Sensitivity {
    pub qi: usize,
    pub value: f64,
    pub explicit: DVector<f64>,
    pub implicit: DVector<f64>,
    /// Steps in the order the adjoint sweep visited them.
    pub visited_steps: Vec<usize>,
}

impl Sensitivity {
    /// `dQ/dp`, the sum of the explicit and implicit parts.
    pub fn total(&self) -> DVector<f64> {
        &self.explicit + &self.implicit
    }
}

/// Advances a model over the slabs `[t_{k-1}, t_k]` of a sequence of time frames.
///
/// The history holds the initial solution at index 0 and the converged solution of step `k`
/// at index `k`. Each step starts from a copy of its predecessor.
#[derive(Debug)]
pub struct TimeSolver {
    model: EquationModel,
    settings: TimeSettings,
    nonlinear: NonlinearSolver,
    adjoint: NewtonConfig,
    initial: Option<DistributedVector>,
    history: Vec<DistributedVector>,
    reports: Vec<StepReport>,
    outputs: Vec<OutputRule>,
    events: Vec<OutputEvent>,
    qi: Option<DVector<f64>>,
}

impl TimeSolver {
    /// Creates a solver for an initialized model.
    pub fn new(model: EquationModel, settings: &SystemSettings) -> Result<Self> {
        Self::with_linear_solver(model, settings, LinearSolver::new(settings.linear))
    }

    pub fn with_linear_solver(model: EquationModel, settings: &SystemSettings, linear: LinearSolver) -> Result<Self> {
        model.map()?;
        let frames = &settings.time.time_frames;
        if frames.len() < 2 || frames.windows(2).any(|w| !(w[0] < w[1])) {
            return Err(SystemError::precondition(format!(
                "time frames must contain at least two strictly increasing values, got {:?}",
                frames
            )));
        }
        if let TimeScheme::Staggered { groups } = &settings.time.scheme {
            if groups.iter().all(Vec::is_empty) {
                return Err(SystemError::precondition("staggered scheme without dof type groups"));
            }
        }
        Ok(Self {
            model,
            settings: settings.time.clone(),
            nonlinear: NonlinearSolver::new(settings.nonlinear.algorithms.clone(), linear)?,
            adjoint: settings.nonlinear.adjoint,
            initial: None,
            history: Vec::new(),
            reports: Vec::new(),
            outputs: Vec::new(),
            events: Vec::new(),
            qi: None,
        })
    }

    pub fn model(&self) -> &EquationModel {
        &self.model
    }

    /// Mutable access to the model, e.g. to change design parameters. Clears all results.
    pub fn model_mut(&mut self) -> &mut EquationModel {
        self.clear_results();
        &mut self.model
    }

    fn clear_results(&mut self) {
        self.history.clear();
        self.reports.clear();
        self.events.clear();
        self.qi = None;
    }

    pub fn num_steps(&self) -> usize {
        self.settings.time_frames.len() - 1
    }

    pub fn time_frames(&self) -> &[f64] {
        &self.settings.time_frames
    }

    pub fn add_output(&mut self, rule: OutputRule) {
        self.outputs.push(rule);
    }

    /// Sets the solution at the first time frame. Defaults to zero.
    pub fn set_initial_solution(&mut self, mut initial: DistributedVector) -> Result<()> {
        if !std::sync::Arc::ptr_eq(initial.map(), self.model.map()?) {
            return Err(SystemError::precondition(
                "initial solution was not created from the model's distributed map",
            ));
        }
        initial.import_ghosts()?;
        self.clear_results();
        self.initial = Some(initial);
        Ok(())
    }

    /// Reads the initial solution from a checkpoint. Collective.
    pub fn load_initial_solution(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let initial = DistributedVector::read_checkpoint(std::sync::Arc::clone(self.model.map()?), path)?;
        self.set_initial_solution(initial)
    }

    /// Solves all time steps in order. Collective.
    pub fn solve(&mut self) -> Result<()> {
        self.clear_results();
        let initial = match &self.initial {
            Some(initial) => initial.clone(),
            None => self.model.zeros()?,
        };
        self.history.push(initial);

        let groups = self.scheme_subsystems()?;
        let num_steps = self.num_steps();
        for step in 1..=num_steps {
            let info = StepInfo {
                step,
                num_steps,
                previous_time: self.settings.time_frames[step - 1],
                time: self.settings.time_frames[step],
            };
            let (current, report) = self.solve_step(&info, &groups)?;
            self.history.push(current);
            self.reports.push(report);

            for rule in &self.outputs {
                if (rule.predicate)(&info) {
                    debug!("Output '{}' triggered at step {}", rule.name, step);
                    self.events.push(OutputEvent {
                        name: rule.name.clone(),
                        step,
                        time: info.time,
                    });
                }
            }
        }

        let qi = self.model.compute_qi(&self.slab_state(num_steps)?)?;
        info!("Completed {} time steps, quantities of interest: {:?}", num_steps, qi.as_slice());
        self.qi = Some(qi);
        Ok(())
    }

    fn scheme_subsystems(&self) -> Result<Vec<SubsystemMap>> {
        match &self.settings.scheme {
            TimeScheme::Monolithic => Ok(vec![self.model.full_subsystem()?]),
            TimeScheme::Staggered { groups } => groups
                .iter()
                .filter(|group| !group.is_empty())
                .map(|group: &Vec<DofType>| self.model.subsystem(group))
                .collect(),
        }
    }

    fn solve_step(&self, info: &StepInfo, groups: &[SubsystemMap]) -> Result<(DistributedVector, StepReport)> {
        let previous = &self.history[info.step - 1];
        let slab = Slab {
            previous_time: info.previous_time,
            time: info.time,
            previous,
        };
        let mut current = previous.clone();
        let mut report = StepReport {
            step: info.step,
            time: info.time,
            solves: Vec::new(),
            failed_attempts: Vec::new(),
        };

        for subsystem in groups {
            let algorithms = self.nonlinear.algorithms();
            let max_attempts = self.settings.max_restarts + 1;
            let seed = current.clone();
            let mut converged = None;
            for attempt in 0..max_attempts {
                let algorithm = &algorithms[attempt % algorithms.len()];
                match self
                    .nonlinear
                    .solve(algorithm, &self.model, slab, &mut current, subsystem)?
                {
                    Advance::Converged(convergence) => {
                        converged = Some(convergence);
                        break;
                    }
                    Advance::Diverged(diagnostics) => {
                        warn!("Step {}: attempt {} failed: {}", info.step, attempt + 1, diagnostics);
                        report.failed_attempts.push(diagnostics);
                        current = seed.clone();
                    }
                }
            }
            match converged {
                Some(convergence) => {
                    debug!(
                        "Step {}: {} converged in {} iterations",
                        info.step, convergence.algorithm, convergence.iterations
                    );
                    report
                        .solves
                        .push((convergence.algorithm, convergence.iterations));
                }
                None => {
                    return Err(SystemError::NotConverged {
                        step: info.step,
                        attempts: report.failed_attempts,
                    })
                }
            }
        }
        Ok((current, report))
    }

    fn require_solved(&self) -> Result<()> {
        if self.history.len() == self.num_steps() + 1 {
            Ok(())
        } else {
            Err(SystemError::precondition("time solver has not completed a forward solve"))
        }
    }

    fn slab_state(&self, step: usize) -> Result<SlabState<'_>> {
        if step == 0 || step >= self.history.len() {
            return Err(SystemError::precondition(format!("no solution for time step {}", step)));
        }
        Ok(SlabState {
            previous_time: self.settings.time_frames[step - 1],
            time: self.settings.time_frames[step],
            previous: &self.history[step - 1],
            current: &self.history[step],
            parameters: self.model.parameters(),
        })
    }

    /// Solution after `step`, where step 0 is the initial solution.
    pub fn solution(&self, step: usize) -> Result<&DistributedVector> {
        self.history
            .get(step)
            .ok_or_else(|| SystemError::precondition(format!("no solution for time step {}", step)))
    }

    pub fn history(&self) -> &[DistributedVector] {
        &self.history
    }

    /// The complete solution after `step`, indexed by adof global ID, on every rank. Collective.
    pub fn get_full_solution(&self, step: usize) -> Result<DVector<f64>> {
        self.solution(step)?.gather_full()
    }

    /// Writes the solution after `step` to a checkpoint file. Collective.
    pub fn write_checkpoint(&self, step: usize, path: impl AsRef<Path>) -> Result<()> {
        self.solution(step)?.write_checkpoint(path)
    }

    pub fn reports(&self) -> &[StepReport] {
        &self.reports
    }

    pub fn output_events(&self) -> &[OutputEvent] {
        &self.events
    }

    /// Quantities of interest evaluated on the final step.
    pub fn quantities_of_interest(&self) -> Result<&DVector<f64>> {
        self.qi
            .as_ref()
            .ok_or_else(|| SystemError::precondition("quantities of interest are only available after a forward solve"))
    }

    /// Runs one adjoint sweep per quantity of interest over the stored forward history. Collective.
    pub fn solve_sensitivity(&self) -> Result<Vec<Sensitivity>> {
        self.require_solved()?;
        let values = self.quantities_of_interest()?;
        let subsystem = self.model.full_subsystem()?;
        (0..self.model.num_qi())
            .map(|qi| self.adjoint_sweep(qi, values[qi], &subsystem))
            .collect()
    }

    fn adjoint_sweep(&self, qi: usize, value: f64, subsystem: &SubsystemMap) -> Result<Sensitivity> {
        let num_steps = self.num_steps();
        let mut carry = self.model.zeros()?;
        let mut implicit = DVector::zeros(self.model.parameters().len());
        let mut visited_steps = Vec::with_capacity(num_steps);

        for step in (1..=num_steps).rev() {
            let slab = self.slab_state(step)?;
            let mut load = subsystem.extract_owned(&carry)?;
            if step == num_steps {
                load += subsystem.extract_owned(&self.model.assemble_dqidu(&slab, qi)?)?;
            }
            let rhs = -load;

            let transposed = self.model.assemble_jacobian_transpose(&slab, subsystem)?;
            let owned = self
                .nonlinear
                .solve_adjoint(&self.adjoint, &self.model, &transposed, &rhs, subsystem)?;
            let mut lambda = self.model.zeros()?;
            subsystem.insert_owned(&mut lambda, owned.rows(0, owned.len()))?;
            lambda.import_ghosts()?;

            implicit += self.model.assemble_dqidp_implicit(&slab, &lambda)?;
            carry = self
                .model
                .assemble_previous_jacobian_transpose_product(&slab, &lambda)?;
            visited_steps.push(step);
            debug!("Adjoint sweep for QI {}: finished step {}", qi, step);
        }

        let explicit = self
            .model
            .assemble_dqidp_explicit(&self.slab_state(num_steps)?, qi)?;
        Ok(Sensitivity {
            qi,
            value,
            explicit,
            implicit,
            visited_steps,
        })
    }
}
