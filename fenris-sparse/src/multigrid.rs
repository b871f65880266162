//! Geometric multigrid V-cycle used as a preconditioner.
//!
//! The hierarchy is described by an ordered list of prolongation operators, finest first:
//! `prolongations[l]` maps coefficients on level `l + 1` to level `l`. Coarse operators are
//! formed with the Galerkin product `Pᵀ A P`.
use crate::operator::{inverse_diagonal, LinearOperator, OperatorError};
use fenris_traits::Real;
use log::debug;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut, Dyn, LU};
use nalgebra_sparse::CsrMatrix;
use numeric_literals::replace_float_literals;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct VCycleSettings<T> {
    pub pre_smoothing: usize,
    pub post_smoothing: usize,
    /// Damping factor of the Jacobi smoother.
    pub damping: T,
}

impl Default for VCycleSettings<f64> {
    fn default() -> Self {
        Self {
            pre_smoothing: 2,
            post_smoothing: 2,
            damping: 2.0 / 3.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Level<T: Real> {
    operator: CsrMatrix<T>,
    inverse_diagonal: DVector<T>,
}

#[derive(Debug)]
pub struct MultigridPreconditioner<T: Real> {
    levels: Vec<Level<T>>,
    prolongations: Vec<CsrMatrix<T>>,
    restrictions: Vec<CsrMatrix<T>>,
    coarse_solver: LU<T, Dyn, Dyn>,
    settings: VCycleSettings<T>,
}

impl<T: Real> MultigridPreconditioner<T> {
    pub fn new(
        fine_operator: CsrMatrix<T>,
        prolongations: Vec<CsrMatrix<T>>,
        settings: VCycleSettings<T>,
    ) -> Result<Self, OperatorError> {
        if fine_operator.nrows() != fine_operator.ncols() {
            return Err("Multigrid requires a square fine-level operator".into());
        }

        let mut operators = vec![fine_operator];
        for (l, prolongation) in prolongations.iter().enumerate() {
            let fine = &operators[l];
            if prolongation.nrows() != fine.nrows() {
                return Err(format!(
                    "Prolongation {} has {} rows, but level {} has {} unknowns",
                    l,
                    prolongation.nrows(),
                    l,
                    fine.nrows()
                )
                .into());
            }
            let coarse = &prolongation.transpose() * &(fine * prolongation);
            operators.push(coarse);
        }

        let coarsest = operators
            .last()
            .ok_or("Multigrid hierarchy has no levels")?;
        let coarse_solver = DMatrix::from(coarsest).lu();
        if !coarse_solver.is_invertible() {
            return Err("Coarsest multigrid operator is singular".into());
        }

        let levels = operators
            .into_iter()
            .map(|operator| {
                let inverse_diagonal = DVector::from_vec(inverse_diagonal(&operator)?);
                Ok(Level {
                    operator,
                    inverse_diagonal,
                })
            })
            .collect::<Result<Vec<_>, OperatorError>>()?;
        let restrictions = prolongations.iter().map(CsrMatrix::transpose).collect();

        debug!(
            "Built multigrid hierarchy with level sizes {:?}",
            levels.iter().map(|l| l.operator.nrows()).collect::<Vec<_>>()
        );

        Ok(Self {
            levels,
            prolongations,
            restrictions,
            coarse_solver,
            settings,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// The Galerkin operator on the given level, where level 0 is the finest.
    pub fn level_operator(&self, level: usize) -> &CsrMatrix<T> {
        &self.levels[level].operator
    }

    pub fn prolongations(&self) -> &[CsrMatrix<T>] {
        &self.prolongations
    }

    fn smooth(&self, level: &Level<T>, x: &mut DVector<T>, b: &DVector<T>, sweeps: usize) -> Result<(), OperatorError> {
        let mut r = DVector::zeros(b.len());
        for _ in 0..sweeps {
            residual_into(&level.operator, &mut r, x, b)?;
            r.component_mul_assign(&level.inverse_diagonal);
            x.axpy(self.settings.damping, &r, T::one());
        }
        Ok(())
    }

    fn v_cycle(&self, l: usize, b: &DVector<T>) -> Result<DVector<T>, OperatorError> {
        if l + 1 == self.levels.len() {
            return self
                .coarse_solver
                .solve(b)
                .ok_or_else(|| "Coarse multigrid solve failed".into());
        }

        let level = &self.levels[l];
        let mut x = DVector::zeros(b.len());
        self.smooth(level, &mut x, b, self.settings.pre_smoothing)?;

        let mut r = DVector::zeros(b.len());
        residual_into(&level.operator, &mut r, &x, b)?;
        let restriction = &self.restrictions[l];
        let mut r_coarse = DVector::zeros(restriction.nrows());
        restriction.apply(DVectorViewMut::from(&mut r_coarse), DVectorView::from(&r))?;

        let e_coarse = self.v_cycle(l + 1, &r_coarse)?;
        let mut e = DVector::zeros(b.len());
        self.prolongations[l].apply(DVectorViewMut::from(&mut e), DVectorView::from(&e_coarse))?;
        x += e;

        self.smooth(level, &mut x, b, self.settings.post_smoothing)?;
        Ok(x)
    }
}

/// r = b - A x
#[replace_float_literals(T::from_f64(literal).unwrap())]
fn residual_into<T: Real>(
    a: &CsrMatrix<T>,
    r: &mut DVector<T>,
    x: &DVector<T>,
    b: &DVector<T>,
) -> Result<(), OperatorError> {
    a.apply(DVectorViewMut::from(&mut *r), DVectorView::from(x))?;
    r.axpy(1.0, b, -1.0);
    Ok(())
}

impl<T: Real> LinearOperator<T> for MultigridPreconditioner<T> {
    /// Applies one V-cycle with zero initial guess.
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        let b = x.clone_owned();
        let result = self.v_cycle(0, &b)?;
        y.copy_from(&result);
        Ok(())
    }
}
