//! Kernel signatures, fused programs and the per-context kernel cache
//!
//! A [`KernelSignature`] is the cache key for compiled kernels: the operation
//! (including any fused elementwise program), the element dtype and the
//! layout tags of the operands. Backends turn a signature into an executable
//! kernel once (`compile_or_fetch`); all runtime quantities (sizes, offsets,
//! strides, host scalars) travel in [`KernelArgs`] so that one compiled kernel
//! serves every call with the same structure.
//!
//! # Argument conventions
//!
//! | Op              | inputs                                        | outputs | dims |
//! |-----------------|-----------------------------------------------|---------|------|
//! | Elementwise     | program inputs                                | out     | `rows, cols, out(off, rs, cs), in_i(off, rs, cs)...` |
//! | Reduce          | program inputs                                | scalar  | same as elementwise |
//! | MatVec          | a, x                                          | y       | `rows, cols, a(off, rs, cs), x(off, inc), y(off, inc)` |
//! | MatMul          | a, b                                          | c       | `m, n, k, a(off, rs, cs), b(off, rs, cs), c(off, rs, cs)` |
//! | SpMV Csr        | row_ptrs, col_indices, values, x              | y       | `rows, width(0), x(off, inc), y(off, inc)` |
//! | SpMV Coo        | group_ptrs, perm, col_indices, values, x      | y       | same as Csr |
//! | SpMV Ell        | col_indices, values, x                        | y       | `rows, width, x(off, inc), y(off, inc)` |
//! | SpMV Hyb        | ell cols, ell values, csr ptrs, csr cols, csr values, x | y | same as Ell |
//! | TriangularSolve | a                                             | x (in/out) | `n, nrhs, a(off, rs, cs), x(off, rs, cs)` |
//!
//! Offsets and strides are in elements. ELL arrays are stored column-major
//! (`slot * rows + row`); a column index of `-1` marks padding.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::Buffer;
use crate::container::DenseLayout;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::sparse::SparseFormat;

/// Maximum operand stack depth a fused program may need
pub const MAX_STACK_DEPTH: usize = 16;

/// Maximum number of instructions in one fused program
pub const MAX_PROGRAM_LEN: usize = 64;

// ============================================================================
// Operators
// ============================================================================

/// Elementwise unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `|x|`
    Abs,
    /// `sqrt(x)`
    Sqrt,
    /// `e^x`
    Exp,
    /// `ln(x)`
    Log,
    /// `sin(x)`
    Sin,
    /// `cos(x)`
    Cos,
    /// `tanh(x)`
    Tanh,
    /// `x * x`
    Square,
}

impl UnaryOp {
    /// Operator name
    pub fn name(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tanh => "tanh",
            Self::Square => "square",
        }
    }

    /// Transcendental operators are only defined for float dtypes
    pub fn requires_float(self) -> bool {
        !matches!(self, Self::Neg | Self::Abs | Self::Square)
    }
}

/// Elementwise binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b` (elementwise)
    Mul,
    /// `a / b` (elementwise; integer division by zero yields 0)
    Div,
    /// `a ^ b`
    Pow,
    /// `max(a, b)`
    Max,
    /// `min(a, b)`
    Min,
}

impl BinaryOp {
    /// Operator name
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Pow => "pow",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    /// Whether the operator is only defined for float dtypes
    pub fn requires_float(self) -> bool {
        matches!(self, Self::Pow)
    }
}

/// Reduction operators (full reduction to a scalar)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum of all elements (0 for empty input)
    Sum,
    /// Maximum element
    Max,
    /// Minimum element
    Min,
}

impl ReduceOp {
    /// Operator name
    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
        }
    }
}

/// Which triangle of a matrix a solve uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Triangle {
    /// Lower triangle (forward substitution)
    Lower,
    /// Upper triangle (back substitution)
    Upper,
}

// ============================================================================
// Fused programs
// ============================================================================

/// One instruction of a fused elementwise program (postfix order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instr {
    /// Push element of input `i` at the current position
    Input(u8),
    /// Push host scalar parameter `i`
    Param(u8),
    /// Pop one value, push `op(value)`
    Unary(UnaryOp),
    /// Pop `b`, pop `a`, push `op(a, b)`
    Binary(BinaryOp),
}

/// A fused elementwise computation in postfix form
///
/// Constants never appear in the program itself; they are parameters, so
/// programs that differ only in their constants share one compiled kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Program {
    instrs: SmallVec<[Instr; 16]>,
    inputs: u8,
    params: u8,
}

impl Program {
    /// Create an empty program
    pub fn new() -> Self {
        Self::default()
    }

    /// The single-input copy program `out = in0`
    pub fn identity() -> Self {
        let mut program = Self::new();
        program.push(Instr::Input(0));
        program
    }

    /// Append an instruction, tracking input and parameter counts
    pub fn push(&mut self, instr: Instr) {
        match instr {
            Instr::Input(i) => self.inputs = self.inputs.max(i + 1),
            Instr::Param(i) => self.params = self.params.max(i + 1),
            Instr::Unary(_) | Instr::Binary(_) => {}
        }
        self.instrs.push(instr);
    }

    /// Instructions in postfix order
    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// Number of distinct inputs referenced
    pub fn input_count(&self) -> usize {
        self.inputs as usize
    }

    /// Number of host parameters referenced
    pub fn param_count(&self) -> usize {
        self.params as usize
    }

    /// Number of fused operators (instructions that are not loads)
    pub fn op_count(&self) -> usize {
        self.instrs
            .iter()
            .filter(|i| matches!(i, Instr::Unary(_) | Instr::Binary(_)))
            .count()
    }

    /// Maximum stack depth reached while executing the program
    pub fn max_stack_depth(&self) -> usize {
        let mut depth = 0usize;
        let mut max = 0usize;
        for instr in &self.instrs {
            match instr {
                Instr::Input(_) | Instr::Param(_) => depth += 1,
                Instr::Unary(_) => {}
                Instr::Binary(_) => depth = depth.saturating_sub(1),
            }
            max = max.max(depth);
        }
        max
    }

    /// Check that the program is well formed and leaves exactly one value
    pub fn validate(&self) -> Result<()> {
        if self.instrs.len() > MAX_PROGRAM_LEN {
            return Err(Error::Internal(format!(
                "fused program has {} instructions (limit {})",
                self.instrs.len(),
                MAX_PROGRAM_LEN
            )));
        }
        let mut depth = 0usize;
        for instr in &self.instrs {
            match instr {
                Instr::Input(_) | Instr::Param(_) => depth += 1,
                Instr::Unary(_) => {
                    if depth < 1 {
                        return Err(Error::Internal("unary op on empty stack".into()));
                    }
                }
                Instr::Binary(_) => {
                    if depth < 2 {
                        return Err(Error::Internal("binary op with fewer than 2 operands".into()));
                    }
                    depth -= 1;
                }
            }
            if depth > MAX_STACK_DEPTH {
                return Err(Error::Internal(format!(
                    "fused program needs stack depth > {}",
                    MAX_STACK_DEPTH
                )));
            }
        }
        if depth != 1 {
            return Err(Error::Internal(format!(
                "fused program leaves {} values on the stack",
                depth
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Signatures
// ============================================================================

/// Operation part of a kernel signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KernelOp {
    /// Fused elementwise map over a 2D index space
    Elementwise {
        /// The fused program
        program: Program,
    },
    /// Fused elementwise map followed by a full reduction
    Reduce {
        /// Map applied before reducing
        program: Program,
        /// Reduction operator
        op: ReduceOp,
    },
    /// Dense matrix-vector product
    MatVec {
        /// Storage order of the matrix operand
        layout: DenseLayout,
    },
    /// Dense matrix-matrix product
    MatMul {
        /// Storage order of the left operand
        a_layout: DenseLayout,
        /// Storage order of the right operand
        b_layout: DenseLayout,
    },
    /// Sparse matrix-vector product
    SpMV {
        /// Sparse storage format of the matrix
        format: SparseFormat,
    },
    /// Dense triangular solve with one or more right-hand sides
    TriangularSolve {
        /// Triangle used
        triangle: Triangle,
        /// Treat the diagonal as all ones
        unit_diagonal: bool,
    },
}

impl KernelOp {
    /// Short name for logs and kernel entry points
    pub fn name(&self) -> &'static str {
        match self {
            Self::Elementwise { .. } => "elementwise",
            Self::Reduce { .. } => "reduce",
            Self::MatVec { .. } => "matvec",
            Self::MatMul { .. } => "matmul",
            Self::SpMV { .. } => "spmv",
            Self::TriangularSolve { .. } => "trsv",
        }
    }
}

/// Cache key for compiled kernels: operation + dtype + layout combination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelSignature {
    /// Operation (with fused program and layout tags)
    pub op: KernelOp,
    /// Element dtype of all value operands
    pub dtype: DType,
}

impl KernelSignature {
    /// Create a signature
    pub fn new(op: KernelOp, dtype: DType) -> Self {
        Self { op, dtype }
    }

    /// Validate structural properties before compiling
    pub fn validate(&self) -> Result<()> {
        match &self.op {
            KernelOp::Elementwise { program } | KernelOp::Reduce { program, .. } => {
                program.validate()?;
                if self.dtype.is_int() {
                    for instr in program.instrs() {
                        let float_only = match instr {
                            Instr::Unary(op) => op.requires_float(),
                            Instr::Binary(op) => op.requires_float(),
                            _ => false,
                        };
                        if float_only {
                            return Err(Error::unsupported_dtype(self.dtype, self.op.name()));
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for KernelSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            KernelOp::Elementwise { program } => write!(
                f,
                "elementwise[{} ops, {} inputs]<{}>",
                program.op_count(),
                program.input_count(),
                self.dtype
            ),
            KernelOp::Reduce { program, op } => write!(
                f,
                "reduce_{}[{} ops, {} inputs]<{}>",
                op.name(),
                program.op_count(),
                program.input_count(),
                self.dtype
            ),
            KernelOp::MatVec { layout } => write!(f, "matvec[{:?}]<{}>", layout, self.dtype),
            KernelOp::MatMul { a_layout, b_layout } => {
                write!(f, "matmul[{:?}x{:?}]<{}>", a_layout, b_layout, self.dtype)
            }
            KernelOp::SpMV { format } => write!(f, "spmv[{}]<{}>", format, self.dtype),
            KernelOp::TriangularSolve {
                triangle,
                unit_diagonal,
            } => write!(
                f,
                "trsv[{:?}{}]<{}>",
                triangle,
                if *unit_diagonal { ",unit" } else { "" },
                self.dtype
            ),
        }
    }
}

// ============================================================================
// Compiled kernels and arguments
// ============================================================================

/// A compiled kernel handle owned by one context
///
/// The executable payload is backend-specific; each backend downcasts it to
/// its own representation at submission time.
#[derive(Clone)]
pub struct Kernel {
    signature: Arc<KernelSignature>,
    compiled: Arc<dyn Any + Send + Sync>,
    context_id: u64,
}

impl Kernel {
    pub(crate) fn new(
        signature: KernelSignature,
        compiled: Arc<dyn Any + Send + Sync>,
        context_id: u64,
    ) -> Self {
        Self {
            signature: Arc::new(signature),
            compiled,
            context_id,
        }
    }

    /// The signature this kernel was compiled for
    pub fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    /// Id of the owning context
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    /// Backend payload, if it has the expected type
    pub(crate) fn compiled<T: Any>(&self) -> Option<&T> {
        self.compiled.downcast_ref::<T>()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("signature", &self.signature.to_string())
            .field("context", &self.context_id)
            .finish()
    }
}

/// Runtime arguments for one kernel submission
#[derive(Debug, Clone, Default)]
pub struct KernelArgs {
    /// Buffers read by the kernel
    pub inputs: Vec<Buffer>,
    /// Buffers written by the kernel (read-write for in-place kernels)
    pub outputs: Vec<Buffer>,
    /// Sizes, offsets and strides in elements (see module docs)
    pub dims: Vec<u64>,
    /// Host scalar parameters of fused programs
    pub params: Vec<f64>,
}

impl KernelArgs {
    /// Create empty arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input buffer
    pub fn input(mut self, buffer: &Buffer) -> Self {
        self.inputs.push(buffer.clone());
        self
    }

    /// Add an output buffer
    pub fn output(mut self, buffer: &Buffer) -> Self {
        self.outputs.push(buffer.clone());
        self
    }

    /// Append dimension values
    pub fn dims(mut self, dims: &[u64]) -> Self {
        self.dims.extend_from_slice(dims);
        self
    }

    /// Append host parameters
    pub fn params(mut self, params: &[f64]) -> Self {
        self.params.extend_from_slice(params);
        self
    }

    /// Read a dimension value as usize
    pub(crate) fn dim(&self, index: usize) -> Result<usize> {
        self.dims
            .get(index)
            .map(|&d| d as usize)
            .ok_or_else(|| Error::Internal(format!("missing kernel dim {}", index)))
    }
}

// ============================================================================
// Kernel cache
// ============================================================================

/// Per-context cache of compiled kernels
///
/// Populated on demand and never evicted; dropped with its context. The lock
/// is held across compilation so concurrent requests for the same signature
/// compile it once.
#[derive(Default)]
pub struct KernelCache {
    kernels: Mutex<HashMap<KernelSignature, Kernel>>,
}

impl KernelCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a signature, compiling it with `compile` on a miss
    ///
    /// Returns the kernel and whether it was freshly compiled.
    pub fn get_or_compile<F>(&self, signature: &KernelSignature, compile: F) -> Result<(Kernel, bool)>
    where
        F: FnOnce() -> Result<Kernel>,
    {
        let mut kernels = self.kernels.lock();
        if let Some(kernel) = kernels.get(signature) {
            return Ok((kernel.clone(), false));
        }
        let kernel = compile()?;
        kernels.insert(signature.clone(), kernel.clone());
        Ok((kernel, true))
    }

    /// Number of cached kernels
    pub fn len(&self) -> usize {
        self.kernels.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.kernels.lock().is_empty()
    }
}

impl fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCache")
            .field("kernels", &self.len())
            .finish()
    }
}
