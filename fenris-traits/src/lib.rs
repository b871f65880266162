use nalgebra::{DVectorView, RealField};

pub use nalgebra;

pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}

/// Reduction of process-local vector data into global quantities.
///
/// Iterative solvers only ever see the locally owned part of a distributed vector. Any
/// quantity that must agree across processes, such as a residual norm used in a convergence
/// check, has to go through a reduction.
pub trait Reduction<T: Real> {
    /// Sum a local scalar over all participating processes.
    fn sum(&self, local: T) -> T;

    fn dot(&self, a: DVectorView<T>, b: DVectorView<T>) -> T {
        self.sum(a.dot(&b))
    }

    fn norm(&self, a: DVectorView<T>) -> T {
        self.sum(a.norm_squared()).sqrt()
    }
}

impl<'a, T: Real, R: ?Sized + Reduction<T>> Reduction<T> for &'a R {
    fn sum(&self, local: T) -> T {
        R::sum(self, local)
    }
}

/// The trivial reduction for data that is not distributed.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LocalReduction;

impl<T: Real> Reduction<T> for LocalReduction {
    fn sum(&self, local: T) -> T {
        local
    }
}
