use fenris_traits::Real;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut, Scalar};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::CsrMatrix;
use std::error::Error;

pub type OperatorError = Box<dyn Error + Send + Sync>;

/// A linear map `y = A x` on process-local vectors.
///
/// Preconditioners implement the same trait, in which case `apply` computes `y = M^{-1} x`.
pub trait LinearOperator<T: Scalar> {
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Scalar,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        <A as LinearOperator<T>>::apply(self, y, x)
    }
}

impl<T: Real> LinearOperator<T> for DMatrix<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        check_dimensions(self.nrows(), self.ncols(), &y, &x)?;
        y.gemv(T::one(), self, &x, T::zero());
        Ok(())
    }
}

impl<T: Real> LinearOperator<T> for CsrMatrix<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        check_dimensions(self.nrows(), self.ncols(), &y, &x)?;
        spmm_csr_dense(T::zero(), &mut y, T::one(), Op::NoOp(self), Op::NoOp(&x));
        Ok(())
    }
}

fn check_dimensions<T: Scalar>(
    nrows: usize,
    ncols: usize,
    y: &DVectorViewMut<T>,
    x: &DVectorView<T>,
) -> Result<(), OperatorError> {
    if y.len() != nrows || x.len() != ncols {
        Err(format!(
            "Cannot apply {}x{} operator to vector of length {} with output of length {}",
            nrows,
            ncols,
            x.len(),
            y.len()
        )
        .into())
    } else {
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct IdentityOperator;

impl<T: Scalar> LinearOperator<T> for IdentityOperator {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        y.copy_from(&x);
        Ok(())
    }
}

/// Diagonal (Jacobi) preconditioner `M = diag(A)`.
#[derive(Debug, Clone)]
pub struct JacobiPreconditioner<T: Scalar> {
    inverse_diagonal: DVector<T>,
}

impl<T: Real> JacobiPreconditioner<T> {
    /// Fails if the matrix is not square or some diagonal entry is zero or missing.
    pub fn from_csr(matrix: &CsrMatrix<T>) -> Result<Self, OperatorError> {
        if matrix.nrows() != matrix.ncols() {
            return Err("Jacobi preconditioner requires a square matrix".into());
        }
        let inverse_diagonal = DVector::from_vec(inverse_diagonal(matrix)?);
        Ok(Self { inverse_diagonal })
    }

    pub fn inverse_diagonal(&self) -> &DVector<T> {
        &self.inverse_diagonal
    }
}

pub(crate) fn inverse_diagonal<T: Real>(matrix: &CsrMatrix<T>) -> Result<Vec<T>, OperatorError> {
    matrix
        .row_iter()
        .enumerate()
        .map(|(i, row)| {
            let diagonal = row
                .col_indices()
                .iter()
                .zip(row.values())
                .filter(|(&j, _)| j == i)
                .fold(T::zero(), |acc, (_, &v)| acc + v);
            if diagonal == T::zero() {
                Err(format!("Zero diagonal entry in row {}", i).into())
            } else {
                Ok(T::one() / diagonal)
            }
        })
        .collect()
}

impl<T: Real> LinearOperator<T> for JacobiPreconditioner<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        if x.len() != self.inverse_diagonal.len() || y.len() != x.len() {
            return Err("Dimension mismatch in Jacobi preconditioner".into());
        }
        y.copy_from(&x.component_mul(&self.inverse_diagonal));
        Ok(())
    }
}
