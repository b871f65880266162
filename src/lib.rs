pub mod comm;
pub mod dof;
pub mod equation;
pub mod error;
pub mod linear;
pub mod mesh;
pub mod model;
pub mod multigrid;
pub mod settings;
pub mod solve;
pub mod vector;

pub mod optimize {
    pub use fenris_optimize::*;
}

pub mod sparse {
    pub use fenris_sparse::*;
}

#[cfg(feature = "proptest")]
pub mod proptest;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
