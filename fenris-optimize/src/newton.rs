use crate::calculus::{DifferentiableVectorFunction, FunctionError, VectorFunction};
use fenris_traits::Real;
use itertools::iterate;
use log::debug;
use nalgebra::{DVectorView, DVectorViewMut, Scalar};
use numeric_literals::replace_float_literals;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NewtonSettings<T> {
    pub max_iterations: Option<usize>,
    /// Absolute tolerance: the iteration has converged once `|F(u)| <= tolerance`.
    pub tolerance: T,
    /// Relative tolerance with respect to the residual norm of the initial guess.
    pub relative_tolerance: Option<T>,
    /// The iteration is declared diverged once `|F(u)| > divergence_limit * |F(u_0)|`.
    pub divergence_limit: Option<T>,
}

/// Summary of a converged Newton iteration.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NewtonOutput<T> {
    pub iterations: usize,
    pub initial_residual_norm: T,
    pub residual_norm: T,
}

#[derive(Debug)]
pub enum NewtonError {
    /// The procedure failed because the maximum number of iterations was reached.
    MaximumIterationsReached { iterations: usize, residual_norm: f64 },
    /// The residual grew beyond the divergence limit or became non-finite.
    Diverged { iterations: usize, residual_norm: f64 },
    /// Evaluating the function failed.
    FunctionError(FunctionError),
    /// The procedure failed because solving the Jacobian system failed.
    JacobianError(FunctionError),
    // The line search failed to produce a valid step direction.
    LineSearchError(FunctionError),
}

impl NewtonError {
    /// The number of completed iterations, if the failure was numerical.
    pub fn iterations(&self) -> Option<usize> {
        match self {
            Self::MaximumIterationsReached { iterations, .. } | Self::Diverged { iterations, .. } => Some(*iterations),
            _ => None,
        }
    }
}

impl Display for NewtonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            NewtonError::MaximumIterationsReached {
                iterations,
                residual_norm,
            } => {
                write!(
                    f,
                    "Failed to converge within maximum number of iterations ({}). Residual norm: {:e}",
                    iterations, residual_norm
                )
            }
            NewtonError::Diverged {
                iterations,
                residual_norm,
            } => {
                write!(
                    f,
                    "Diverged after {} iterations. Residual norm: {:e}",
                    iterations, residual_norm
                )
            }
            NewtonError::FunctionError(err) => {
                write!(f, "Failed to evaluate function. Error: {}", err)
            }
            NewtonError::JacobianError(err) => {
                write!(f, "Failed to solve Jacobian system. Error: {}", err)
            }
            NewtonError::LineSearchError(err) => {
                write!(f, "Line search failed to produce valid step direction. Error: {}", err)
            }
        }
    }
}

impl Error for NewtonError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NewtonError::FunctionError(err) | NewtonError::JacobianError(err) | NewtonError::LineSearchError(err) => {
                Some(err.as_ref())
            }
            _ => None,
        }
    }
}

/// Attempts to solve the non-linear equation F(u) = 0.
///
/// No heap allocation is performed. The solution is said to have converged if
/// ```|F(u)| <= tolerance``` or, if a relative tolerance is given,
/// ```|F(u)| <= relative_tolerance * |F(u_0)|```, where the norm is the one reported by
/// [`VectorFunction::norm`].
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn newton<'a, T, F>(
    function: F,
    x: impl Into<DVectorViewMut<'a, T>>,
    f: impl Into<DVectorViewMut<'a, T>>,
    dx: impl Into<DVectorViewMut<'a, T>>,
    settings: NewtonSettings<T>,
) -> Result<NewtonOutput<T>, NewtonError>
where
    T: Real,
    F: DifferentiableVectorFunction<T>,
{
    newton_line_search(function, x, f, dx, settings, &mut NoLineSearch {})
}

/// Same as `newton`, but allows specifying a line search.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn newton_line_search<'a, T, F>(
    mut function: F,
    x: impl Into<DVectorViewMut<'a, T>>,
    f: impl Into<DVectorViewMut<'a, T>>,
    dx: impl Into<DVectorViewMut<'a, T>>,
    settings: NewtonSettings<T>,
    line_search: &mut impl LineSearch<T, F>,
) -> Result<NewtonOutput<T>, NewtonError>
where
    T: Real,
    F: DifferentiableVectorFunction<T>,
{
    let mut x = x.into();
    let mut f = f.into();
    let mut minus_dx = dx.into();

    assert_eq!(x.nrows(), f.nrows());
    assert_eq!(minus_dx.nrows(), f.nrows());

    function
        .eval_into(&mut f, &DVectorView::from(&x))
        .map_err(NewtonError::FunctionError)?;

    let initial_residual_norm = function.norm(&DVectorView::from(&f));
    let mut residual_norm = initial_residual_norm;
    let converged_norm = match settings.relative_tolerance {
        Some(relative) => T::max(settings.tolerance, relative * initial_residual_norm),
        None => settings.tolerance,
    };
    debug!("Newton initial residual norm: {}", initial_residual_norm);

    let mut iter = 0;

    while !(residual_norm <= converged_norm) {
        let to_f64 = |value: T| value.to_subset().unwrap_or(f64::NAN);
        if !residual_norm.is_finite()
            || settings
                .divergence_limit
                .map(|limit| residual_norm > limit * initial_residual_norm)
                .unwrap_or(false)
        {
            return Err(NewtonError::Diverged {
                iterations: iter,
                residual_norm: to_f64(residual_norm),
            });
        }

        if settings
            .max_iterations
            .map(|max_iter| iter == max_iter)
            .unwrap_or(false)
        {
            return Err(NewtonError::MaximumIterationsReached {
                iterations: iter,
                residual_norm: to_f64(residual_norm),
            });
        }

        // Solve the system J dx = -f   <=>   J (-dx) = f
        function
            .solve_jacobian_system(&mut minus_dx, &DVectorView::from(&x), &DVectorView::from(&f))
            .map_err(NewtonError::JacobianError)?;

        // Flip sign to make it consistent with line search
        minus_dx *= -1.0;
        let dx = &minus_dx;

        let step_length = line_search
            .step(
                &mut function,
                DVectorViewMut::from(&mut f),
                DVectorViewMut::from(&mut x),
                DVectorView::from(dx),
            )
            .map_err(NewtonError::LineSearchError)?;
        iter += 1;
        residual_norm = function.norm(&DVectorView::from(&f));
        debug!(
            "Newton iter {}: step length {}, residual norm {}",
            iter, step_length, residual_norm
        );
    }

    Ok(NewtonOutput {
        iterations: iter,
        initial_residual_norm,
        residual_norm,
    })
}

pub trait LineSearch<T: Scalar, F: VectorFunction<T>> {
    fn step(
        &mut self,
        function: &mut F,
        f: DVectorViewMut<T>,
        x: DVectorViewMut<T>,
        direction: DVectorView<T>,
    ) -> Result<T, FunctionError>;
}

/// Trivial implementation of line search. Equivalent to a single, full Newton step.
#[derive(Clone, Debug)]
pub struct NoLineSearch;

impl<T, F> LineSearch<T, F> for NoLineSearch
where
    T: Real,
    F: VectorFunction<T>,
{
    fn step(
        &mut self,
        function: &mut F,
        mut f: DVectorViewMut<T>,
        mut x: DVectorViewMut<T>,
        direction: DVectorView<T>,
    ) -> Result<T, FunctionError> {
        let p = direction;
        x.axpy(T::one(), &p, T::one());
        function.eval_into(&mut f, &DVectorView::from(&x))?;
        Ok(T::one())
    }
}

/// Standard backtracking line search using the Armijo condition.
///
/// See Jorge & Nocedal (2006), Numerical Optimization, Chapter 3.1.
#[derive(Clone, Debug)]
pub struct BacktrackingLineSearch;

impl<T, F> LineSearch<T, F> for BacktrackingLineSearch
where
    T: Real,
    F: VectorFunction<T>,
{
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn step(
        &mut self,
        function: &mut F,
        mut f: DVectorViewMut<T>,
        mut x: DVectorViewMut<T>,
        direction: DVectorView<T>,
    ) -> Result<T, FunctionError> {
        // We seek to solve
        //  F(x) = 0
        // by minimizing
        //  g(x) = (1/2) || F(x) ||^2
        // and the sufficient decrease condition becomes
        //  g(x_k + alpha * p_k) <= (1 - c * alpha) * g(x_k)
        // under the assumption that p_k (approximately) solves the Newton step equation.
        // The norm is the one reported by the function, so that distributed functions
        // agree on the step length on every process.
        let c = 1e-4;
        let alpha_min = 1e-6;

        let p = direction;
        let norm_initial = function.norm(&DVectorView::from(&f));
        let g_initial = 0.5 * norm_initial * norm_initial;

        // Start out with some alphas that don't decrease too quickly, then
        // start decreasing them much faster if the first few iterations don't let us
        // take a step.
        let initial_alphas = [0.0, 1.0, 0.75, 0.5];
        let mut alpha_iter = initial_alphas
            .iter()
            .copied()
            .chain(iterate(0.25, |alpha_i| 0.25 * *alpha_i));

        let mut alpha_prev = 0.0;
        let mut alpha = 1.0;
        alpha_iter.nth(1);

        loop {
            let delta_alpha = alpha - alpha_prev;

            // We have that x^{k + 1} = x^0 + alpha^k * p,
            // hence x^{k + 1} = x^k + (alpha^k - alpha^{k - 1}) * p.
            x.axpy(delta_alpha, &p, T::one());
            function.eval_into(&mut f, &DVectorView::from(&x))?;

            let norm = function.norm(&DVectorView::from(&f));
            let g = 0.5 * norm * norm;
            if g <= (1.0 - c * alpha) * g_initial {
                break;
            } else if alpha < alpha_min {
                return Err(Box::from(format!(
                    "Failed to produce valid step direction. \
                    Alpha {} is smaller than minimum allowed alpha {}.",
                    alpha, alpha_min
                )));
            } else {
                alpha_prev = alpha;
                alpha = match alpha_iter.next() {
                    Some(next) => next,
                    None => return Err(Box::from("Line search exhausted its step lengths")),
                };
            }
        }

        Ok(alpha)
    }
}
