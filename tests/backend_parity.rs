//! Backend parity tests: GPU backends against the host backend
//!
//! Every case runs on the host first, then on each GPU context that can be
//! acquired. Without a device (or without the `cuda` / `wgpu` features) the
//! GPU half of a case is skipped.

mod common;

mod backend_parity {
    pub mod expression;
    pub mod helpers;
    pub mod solvers;
    pub mod sparse;
}
