//! Right-preconditioned BiCGSTAB for general (nonsymmetric) operators.
use crate::cg::{SolveError, SolveErrorKind, SolverOutput, StoppingCriterion};
use crate::operator::{IdentityOperator, LinearOperator};
use fenris_traits::Real;
use log::debug;
use nalgebra::{DVector, DVectorView, DVectorViewMut};

/// Builder-style BiCGSTAB solver, configured like [`ConjugateGradient`](crate::cg::ConjugateGradient).
#[derive(Debug)]
pub struct BiCgStab<A, P, Criterion> {
    operator: A,
    preconditioner: P,
    stopping_criterion: Criterion,
    max_iter: Option<usize>,
}

impl BiCgStab<(), IdentityOperator, ()> {
    pub fn new() -> Self {
        Self {
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            max_iter: None,
        }
    }
}

impl<P, Criterion> BiCgStab<(), P, Criterion> {
    pub fn with_operator<A>(self, operator: A) -> BiCgStab<A, P, Criterion> {
        BiCgStab {
            operator,
            preconditioner: self.preconditioner,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }
}

impl<A, P> BiCgStab<A, P, ()> {
    pub fn with_stopping_criterion<Criterion>(self, stopping_criterion: Criterion) -> BiCgStab<A, P, Criterion> {
        BiCgStab {
            operator: self.operator,
            preconditioner: self.preconditioner,
            stopping_criterion,
            max_iter: self.max_iter,
        }
    }
}

impl<A, P, Criterion> BiCgStab<A, P, Criterion> {
    pub fn with_preconditioner<P2>(self, preconditioner: P2) -> BiCgStab<A, P2, Criterion> {
        BiCgStab {
            operator: self.operator,
            preconditioner,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }

    pub fn with_max_iter(self, max_iter: usize) -> Self {
        Self {
            max_iter: Some(max_iter),
            ..self
        }
    }
}

impl<A, P, Criterion> BiCgStab<A, P, Criterion> {
    /// Solves `Ax = b` starting from the initial guess stored in `x`.
    pub fn solve_with_guess<'b, T>(
        &self,
        b: impl Into<DVectorView<'b, T>>,
        x: impl Into<DVectorViewMut<'b, T>>,
    ) -> Result<SolverOutput<T>, SolveError<T>>
    where
        T: Real,
        A: LinearOperator<T>,
        P: LinearOperator<T>,
        Criterion: StoppingCriterion<T>,
    {
        use SolveErrorKind::*;
        let b = b.into();
        let mut x = x.into();
        assert_eq!(b.len(), x.len());
        let n = b.len();

        let mut output = SolverOutput {
            num_iterations: 0,
            residual_norm: T::zero(),
        };
        let b_norm = b.norm();
        if b_norm == T::zero() {
            x.fill(T::zero());
            return Ok(output);
        }

        let apply = |op: &dyn LinearOperator<T>, y: &mut DVector<T>, v: &DVector<T>| {
            op.apply(DVectorViewMut::from(y), DVectorView::from(v))
        };

        // r = b - A x
        let mut r = DVector::zeros(n);
        if let Err(err) = self.operator.apply(DVectorViewMut::from(&mut r), DVectorView::from(&x)) {
            return Err(SolveError::new(output, OperatorError(err)));
        }
        r.axpy(T::one(), &b, -T::one());
        let r_hat = r.clone();

        let mut p = DVector::zeros(n);
        let mut v = DVector::zeros(n);
        let mut s = DVector::zeros(n);
        let mut t = DVector::zeros(n);
        let mut p_hat = DVector::zeros(n);
        let mut s_hat = DVector::zeros(n);

        let mut rho = T::one();
        let mut alpha = T::one();
        let mut omega = T::one();

        loop {
            output.residual_norm = r.norm();
            match self
                .stopping_criterion
                .has_converged(b_norm, output.num_iterations, DVectorView::from(&r))
            {
                Ok(true) => break,
                Ok(false) => {}
                Err(kind) => return Err(SolveError::new(output, kind)),
            }
            if let Some(max_iter) = self.max_iter {
                if output.num_iterations >= max_iter {
                    return Err(SolveError::new(output, MaxIterationsReached { max_iter }));
                }
            }

            let rho_next = r_hat.dot(&r);
            if rho_next == T::zero() {
                return Err(SolveError::new(output, Breakdown("rho")));
            }
            let beta = (rho_next / rho) * (alpha / omega);
            rho = rho_next;

            // p = r + beta * (p - omega * v)
            p.axpy(-omega, &v, T::one());
            p.axpy(T::one(), &r, beta);

            if let Err(err) = apply(&self.preconditioner, &mut p_hat, &p) {
                return Err(SolveError::new(output, PreconditionerError(err)));
            }
            if let Err(err) = apply(&self.operator, &mut v, &p_hat) {
                return Err(SolveError::new(output, OperatorError(err)));
            }

            let r_hat_v = r_hat.dot(&v);
            if r_hat_v == T::zero() {
                return Err(SolveError::new(output, Breakdown("r_hat . v")));
            }
            alpha = rho / r_hat_v;

            // s = r - alpha * v
            s.copy_from(&r);
            s.axpy(-alpha, &v, T::one());

            if let Ok(true) = self
                .stopping_criterion
                .has_converged(b_norm, output.num_iterations, DVectorView::from(&s))
            {
                x.axpy(alpha, &p_hat, T::one());
                output.num_iterations += 1;
                output.residual_norm = s.norm();
                break;
            }

            if let Err(err) = apply(&self.preconditioner, &mut s_hat, &s) {
                return Err(SolveError::new(output, PreconditionerError(err)));
            }
            if let Err(err) = apply(&self.operator, &mut t, &s_hat) {
                return Err(SolveError::new(output, OperatorError(err)));
            }

            let t_t = t.dot(&t);
            if t_t == T::zero() {
                return Err(SolveError::new(output, Breakdown("t . t")));
            }
            omega = t.dot(&s) / t_t;

            x.axpy(alpha, &p_hat, T::one());
            x.axpy(omega, &s_hat, T::one());

            r.copy_from(&s);
            r.axpy(-omega, &t, T::one());
            output.num_iterations += 1;

            if omega == T::zero() {
                return Err(SolveError::new(output, Breakdown("omega")));
            }
        }

        debug!(
            "BiCGSTAB converged in {} iterations, residual norm {}",
            output.num_iterations, output.residual_norm
        );
        Ok(output)
    }
}
