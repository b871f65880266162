//! Configuration of the dof layer and the solvers.
//!
//! All settings have defaults and can be loaded from JSON, where missing fields take their
//! default values.
use crate::dof::DofType;
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub dofs: DofSettings,
    pub nonlinear: NonlinearSettings,
    pub linear: LinearSolverSettings,
    pub time: TimeSettings,
}

impl SystemSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// How adofs are obtained from pdofs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdofStrategy {
    /// Copy IDs and T-matrix rows from the basis coefficients of each entity.
    ExistingBasis,
    /// One adof per (entity, dof type, time level) with an identity T-matrix.
    Nodal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DofSettings {
    pub strategy: AdofStrategy,
    /// Time levels per dof type. Types not listed use `default_time_levels`.
    pub time_levels: Vec<(DofType, usize)>,
    pub default_time_levels: usize,
    /// Collectively verify that all ranks declare the same dof type list.
    pub check_dof_type_consistency: bool,
}

impl Default for DofSettings {
    fn default() -> Self {
        Self {
            strategy: AdofStrategy::Nodal,
            time_levels: Vec::new(),
            default_time_levels: 1,
            check_dof_type_consistency: false,
        }
    }
}

impl DofSettings {
    pub fn time_levels_for(&self, dof_type: DofType) -> usize {
        self.time_levels
            .iter()
            .find(|(t, _)| *t == dof_type)
            .map_or(self.default_time_levels, |(_, levels)| *levels)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonConfig {
    pub max_iterations: usize,
    /// Convergence once the residual norm drops below this fraction of the initial norm.
    pub relative_tolerance: f64,
    /// Convergence once the residual norm drops below this value.
    pub absolute_tolerance: f64,
    /// Divergence once the residual norm exceeds this multiple of the initial norm.
    pub divergence_limit: Option<f64>,
    pub line_search: bool,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            relative_tolerance: 1e-8,
            absolute_tolerance: 1e-12,
            divergence_limit: Some(1e6),
            line_search: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NlbgsConfig {
    /// Disjoint dof type groups, solved in order within each outer iteration.
    pub groups: Vec<Vec<DofType>>,
    pub max_outer_iterations: usize,
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
    pub divergence_limit: Option<f64>,
    /// Settings of the Newton solve of each group.
    pub inner: NewtonConfig,
}

impl Default for NlbgsConfig {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            max_outer_iterations: 20,
            relative_tolerance: 1e-8,
            absolute_tolerance: 1e-12,
            divergence_limit: Some(1e6),
            inner: NewtonConfig::default(),
        }
    }
}

/// A nonlinear algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Algorithm {
    Newton(NewtonConfig),
    Nlbgs(NlbgsConfig),
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Newton(_) => "Newton",
            Algorithm::Nlbgs(_) => "NLBGS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonlinearSettings {
    /// Registration table: the first algorithm is primary, the others are restart alternates.
    pub algorithms: Vec<Algorithm>,
    /// Newton settings of the adjoint solve.
    pub adjoint: NewtonConfig,
}

impl Default for NonlinearSettings {
    fn default() -> Self {
        Self {
            algorithms: vec![Algorithm::Newton(NewtonConfig::default())],
            adjoint: NewtonConfig::default(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearSolverKind {
    Direct,
    Cg,
    BiCgStab,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreconditionerKind {
    None,
    Jacobi,
    Multigrid,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultigridConfig {
    pub pre_smoothing: usize,
    pub post_smoothing: usize,
    pub damping: f64,
}

impl Default for MultigridConfig {
    fn default() -> Self {
        Self {
            pre_smoothing: 2,
            post_smoothing: 2,
            damping: 2.0 / 3.0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearSolverSettings {
    pub kind: LinearSolverKind,
    pub preconditioner: PreconditionerKind,
    pub relative_tolerance: f64,
    pub max_iterations: usize,
    pub multigrid: MultigridConfig,
}

impl Default for LinearSolverSettings {
    fn default() -> Self {
        Self {
            kind: LinearSolverKind::Direct,
            preconditioner: PreconditionerKind::None,
            relative_tolerance: 1e-12,
            max_iterations: 1000,
            multigrid: MultigridConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimeScheme {
    /// All dof types are solved together by the nonlinear solver in every step.
    Monolithic,
    /// Each group is solved once per step, in order, with the other groups frozen.
    Staggered { groups: Vec<Vec<DofType>> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSettings {
    /// Slab endpoints `t_0 < t_1 < ... < t_N`.
    pub time_frames: Vec<f64>,
    pub scheme: TimeScheme,
    /// Number of retries with alternate algorithms after a failed attempt.
    pub max_restarts: usize,
}

impl Default for TimeSettings {
    fn default() -> Self {
        Self {
            time_frames: vec![0.0, 1.0],
            scheme: TimeScheme::Monolithic,
            max_restarts: 2,
        }
    }
}
