//! # hetla
//!
//! **Heterogeneous linear algebra for Rust: one expression API over host, CUDA and WebGPU.**
//!
//! hetla provides scalars, vectors, dense and sparse matrices bound to an
//! execution context, a lazy expression graph that fuses elementwise work into
//! single kernels, and iterative solvers that run unchanged on every backend.
//!
//! ## Why hetla?
//!
//! - **One code path**: Containers carry their context; solvers are written once
//! - **Fusion**: `a + 2*b - c` launches one kernel, not three
//! - **Sparse formats**: CSR, COO, ELL and HYB with format-specific SpMV kernels
//! - **Generated kernels**: WGSL and CUDA C are emitted per signature and cached
//!
//! ## Features
//!
//! - **Containers**: Scalar, Vector, row- and column-major dense matrices, strided views
//! - **Expressions**: Elementwise math, reductions, dot products, norms, products
//! - **Solvers**: CG, BiCGSTAB, GMRES(m), triangular solves, power iteration, Lanczos
//! - **Dtypes**: f64, f32, i64, i32
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hetla::prelude::*;
//!
//! let ctx = Context::host();
//! let a = DenseMatrix::from_slice(&ctx, &[4.0, 1.0, 1.0, 3.0], 2, 2, DenseLayout::RowMajor)?;
//! let b = Vector::from_slice(&ctx, &[1.0, 2.0])?;
//!
//! let r = Expr::from(&b).sub(Expr::from(&a).mat_vec(&b)?)?;
//! let norm = r.norm_2()?.evaluate()?.into_scalar()?.to_f64()?;
//!
//! let solved = cg(&a, &b, None, &CgOptions::default())?;
//! assert!(solved.status.is_converged());
//! ```
//!
//! ## Feature Flags
//!
//! - `rayon` (default): Host kernels split across the rayon pool
//! - `wgpu`: Cross-platform GPU via WebGPU (f32 and i32)
//! - `cuda`: NVIDIA GPU via the driver API and NVRTC (all dtypes)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod algorithm;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod dtype;
pub mod error;
pub mod expr;
pub mod runtime;
pub mod sparse;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::container::{Container, DenseLayout, DenseMatrix, Scalar, Span, Vector};
    pub use crate::dispatch::Dispatcher;
    pub use crate::dtype::DType;
    pub use crate::error::{Error, Result};
    pub use crate::expr::Expr;
    pub use crate::runtime::{BackendKind, Context, ContextOptions, DeviceKind, DeviceSelector};
    pub use crate::sparse::{SparseFormat, SparseMatrix};

    pub use crate::algorithm::{
        BiCgStabOptions, CancellationToken, CgOptions, EigenOptions, GmresOptions, SolverStatus,
        bicgstab, cg, gmres, lanczos, power_iteration, solve_triangular,
    };
}
