//! Kernel source generation for the GPU backends
//!
//! Every [`KernelSignature`] lowers to one self-contained compute kernel in
//! the target dialect: WGSL for WebGPU and CUDA C for NVRTC. Fused programs
//! become straight-line code over named temporaries, so a chain of `k`
//! elementwise operators costs one load per input and one store.
//!
//! Binding order is the same in both dialects:
//!
//! ```text
//! in0 .. in{n-1}    kernel inputs (see [`input_slots`])
//! out0              the output (read-write)
//! dims              sizes, offsets and strides (KernelArgs::dims)
//! params            host scalars of fused programs (Elementwise / Reduce only)
//! ```
//!
//! Reductions run in a single work group; every other kernel maps one
//! invocation to one output element, row or right-hand side column.

#![cfg_attr(not(any(feature = "wgpu", feature = "cuda")), allow(dead_code))]

mod cuda;
mod wgsl;

#[cfg(feature = "cuda")]
pub(crate) use cuda::{ENTRY_POINT as CUDA_ENTRY_POINT, generate as cuda_source};
#[cfg(feature = "wgpu")]
pub(crate) use wgsl::{ENTRY_POINT as WGSL_ENTRY_POINT, generate as wgsl_source};

use crate::error::{Error, Result};
use crate::runtime::kernel::{BinaryOp, Instr, KernelArgs, KernelOp, Program, UnaryOp};
use crate::sparse::SparseFormat;

/// Invocations per work group (WGSL) or threads per block (CUDA)
pub(crate) const GROUP_SIZE: u32 = 256;

/// Element type of one kernel input binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Matrix or vector values in the signature dtype
    Value,
    /// Sparse structure (`i32`)
    Index,
}

/// Input bindings of a kernel, in order
pub(crate) fn input_slots(op: &KernelOp) -> Vec<Slot> {
    use Slot::{Index, Value};
    match op {
        KernelOp::Elementwise { program } | KernelOp::Reduce { program, .. } => {
            vec![Value; program.input_count()]
        }
        KernelOp::MatVec { .. } | KernelOp::MatMul { .. } => vec![Value, Value],
        KernelOp::SpMV { format } => match format {
            SparseFormat::Csr => vec![Index, Index, Value, Value],
            SparseFormat::Coo => vec![Index, Index, Index, Value, Value],
            SparseFormat::Ell => vec![Index, Value, Value],
            SparseFormat::Hyb => vec![Index, Value, Index, Index, Value, Value],
        },
        KernelOp::TriangularSolve { .. } => vec![Value],
    }
}

/// Whether the kernel binds a parameter buffer
pub(crate) fn uses_params(op: &KernelOp) -> bool {
    matches!(op, KernelOp::Elementwise { .. } | KernelOp::Reduce { .. })
}

/// How many invocations a submission needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkSize {
    /// One invocation per item, rounded up to whole groups
    Items(usize),
    /// Exactly one group (reductions)
    SingleGroup,
}

impl WorkSize {
    /// Number of groups to launch
    pub(crate) fn groups(self) -> usize {
        match self {
            Self::Items(n) => n.div_ceil(GROUP_SIZE as usize),
            Self::SingleGroup => 1,
        }
    }
}

/// Launch size for a submission, read from its dims
pub(crate) fn work_size(op: &KernelOp, args: &KernelArgs) -> Result<WorkSize> {
    Ok(match op {
        KernelOp::Elementwise { .. } => WorkSize::Items(args.dim(0)? * args.dim(1)?),
        KernelOp::Reduce { .. } => WorkSize::SingleGroup,
        KernelOp::MatVec { .. } | KernelOp::SpMV { .. } => WorkSize::Items(args.dim(0)?),
        KernelOp::MatMul { .. } => WorkSize::Items(args.dim(0)? * args.dim(1)?),
        KernelOp::TriangularSolve { .. } => WorkSize::Items(args.dim(1)?),
    })
}

/// Syntax of one target language for fused programs
trait Dialect {
    /// Value of input `input` at the current `(r, c)`
    fn load(&self, input: usize) -> String;

    /// Host parameter `index`
    fn param(&self, index: usize) -> String;

    fn unary(&self, op: UnaryOp, a: &str) -> String;

    fn binary(&self, op: BinaryOp, a: &str, b: &str) -> String;

    /// Immutable local binding statement
    fn bind(&self, name: &str, value: &str) -> String;
}

/// Dims index of the `(off, rs, cs)` triple of program input `i`
fn input_dims(i: usize) -> usize {
    5 + 3 * i
}

/// Lower a postfix program to statements; returns the code and the name of
/// the temporary holding the result
fn lower_program(program: &Program, dialect: &impl Dialect, indent: &str) -> Result<(String, String)> {
    let mut code = String::new();
    let mut stack: Vec<String> = Vec::new();
    let underflow = || Error::Internal("fused program underflows its stack".into());
    for (k, instr) in program.instrs().iter().enumerate() {
        let value = match *instr {
            Instr::Input(i) => dialect.load(i as usize),
            Instr::Param(i) => dialect.param(i as usize),
            Instr::Unary(op) => {
                let a = stack.pop().ok_or_else(underflow)?;
                dialect.unary(op, &a)
            }
            Instr::Binary(op) => {
                let b = stack.pop().ok_or_else(underflow)?;
                let a = stack.pop().ok_or_else(underflow)?;
                dialect.binary(op, &a, &b)
            }
        };
        let name = format!("t{k}");
        code.push_str(indent);
        code.push_str(&dialect.bind(&name, &value));
        code.push('\n');
        stack.push(name);
    }
    match (stack.pop(), stack.is_empty()) {
        (Some(result), true) => Ok((code, result)),
        _ => Err(Error::Internal("fused program must leave one value".into())),
    }
}
