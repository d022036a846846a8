//! CUDA C kernels for NVRTC
//!
//! Every dtype is supported. Integer kernels accumulate in `long long` and
//! wrap through unsigned arithmetic; float kernels accumulate in their own
//! precision.

use std::fmt::Write;

use super::{Dialect, GROUP_SIZE, Slot, input_dims, input_slots, lower_program, uses_params};
use crate::dtype::DType;
use crate::error::Result;
use crate::runtime::kernel::{
    BinaryOp, KernelOp, KernelSignature, Program, ReduceOp, Triangle, UnaryOp,
};
use crate::sparse::SparseFormat;

/// Entry point of every generated kernel
pub(crate) const ENTRY_POINT: &str = "hetla_kernel";

const PRELUDE: &str = r#"typedef unsigned long long u64;

__device__ __forceinline__ u64 at(u64 off, u64 rs, u64 cs, u64 r, u64 c) {
    return off + r * rs + c * cs;
}
__device__ __forceinline__ long long wrap_add(long long a, long long b) {
    return (long long)((u64)a + (u64)b);
}
__device__ __forceinline__ long long wrap_sub(long long a, long long b) {
    return (long long)((u64)a - (u64)b);
}
__device__ __forceinline__ long long wrap_mul(long long a, long long b) {
    return (long long)((u64)a * (u64)b);
}
__device__ __forceinline__ long long int_div(long long a, long long b) {
    return (b == 0 || (a == (-9223372036854775807LL - 1) && b == -1)) ? 0 : a / b;
}
__device__ __forceinline__ long long int_max(long long a, long long b) {
    return a > b ? a : b;
}
__device__ __forceinline__ long long int_min(long long a, long long b) {
    return a < b ? a : b;
}
"#;

struct Cuda {
    elem: &'static str,
    acc: &'static str,
    kind: Kind,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    F32,
    F64,
    Int,
}

impl Cuda {
    fn new(dtype: DType) -> Self {
        match dtype {
            DType::F32 => Self {
                elem: "float",
                acc: "float",
                kind: Kind::F32,
            },
            DType::F64 => Self {
                elem: "double",
                acc: "double",
                kind: Kind::F64,
            },
            DType::I32 => Self {
                elem: "int",
                acc: "long long",
                kind: Kind::Int,
            },
            DType::I64 => Self {
                elem: "long long",
                acc: "long long",
                kind: Kind::Int,
            },
        }
    }

    /// Float math function name for the accumulator precision
    fn math(&self, name: &str) -> String {
        match self.kind {
            Kind::F32 => format!("{name}f"),
            _ => name.to_string(),
        }
    }

    fn add(&self, a: &str, b: &str) -> String {
        match self.kind {
            Kind::Int => format!("wrap_add({a}, {b})"),
            _ => format!("({a} + {b})"),
        }
    }

    fn mul(&self, a: &str, b: &str) -> String {
        match self.kind {
            Kind::Int => format!("wrap_mul({a}, {b})"),
            _ => format!("({a} * {b})"),
        }
    }

    /// `acc + a * b` as the accumulator statement expression
    fn mul_add(&self, acc: &str, a: &str, b: &str) -> String {
        self.add(acc, &self.mul(a, b))
    }

    fn identity(&self, op: ReduceOp) -> &'static str {
        match (op, self.kind) {
            (ReduceOp::Sum, _) => "0",
            (ReduceOp::Max, Kind::F32) => "__int_as_float(0xff800000)",
            (ReduceOp::Min, Kind::F32) => "__int_as_float(0x7f800000)",
            (ReduceOp::Max, Kind::F64) => "__longlong_as_double(0xfff0000000000000ULL)",
            (ReduceOp::Min, Kind::F64) => "__longlong_as_double(0x7ff0000000000000ULL)",
            (ReduceOp::Max, Kind::Int) => "(-9223372036854775807LL - 1)",
            (ReduceOp::Min, Kind::Int) => "9223372036854775807LL",
        }
    }

    fn combine(&self, op: ReduceOp, a: &str, b: &str) -> String {
        match op {
            ReduceOp::Sum => self.add(a, b),
            ReduceOp::Max => self.binary(BinaryOp::Max, a, b),
            ReduceOp::Min => self.binary(BinaryOp::Min, a, b),
        }
    }
}

impl Dialect for Cuda {
    fn load(&self, input: usize) -> String {
        let d = input_dims(input);
        format!(
            "({})in{input}[at(dims[{}], dims[{}], dims[{}], r, c)]",
            self.acc,
            d,
            d + 1,
            d + 2
        )
    }

    fn param(&self, index: usize) -> String {
        format!("({})params[{index}]", self.acc)
    }

    fn unary(&self, op: UnaryOp, a: &str) -> String {
        if self.kind == Kind::Int {
            return match op {
                UnaryOp::Neg => format!("wrap_sub(0, {a})"),
                UnaryOp::Abs => format!("({a} < 0 ? wrap_sub(0, {a}) : {a})"),
                UnaryOp::Square => format!("wrap_mul({a}, {a})"),
                // Rejected by signature validation
                _ => a.to_string(),
            };
        }
        match op {
            UnaryOp::Neg => format!("(-{a})"),
            UnaryOp::Abs => format!("{}({a})", self.math("fabs")),
            UnaryOp::Square => format!("({a} * {a})"),
            other => format!("{}({a})", self.math(other.name())),
        }
    }

    fn binary(&self, op: BinaryOp, a: &str, b: &str) -> String {
        if self.kind == Kind::Int {
            return match op {
                BinaryOp::Add => format!("wrap_add({a}, {b})"),
                BinaryOp::Sub => format!("wrap_sub({a}, {b})"),
                BinaryOp::Mul => format!("wrap_mul({a}, {b})"),
                BinaryOp::Div => format!("int_div({a}, {b})"),
                BinaryOp::Max => format!("int_max({a}, {b})"),
                BinaryOp::Min => format!("int_min({a}, {b})"),
                BinaryOp::Pow => "0".to_string(),
            };
        }
        match op {
            BinaryOp::Add => format!("({a} + {b})"),
            BinaryOp::Sub => format!("({a} - {b})"),
            BinaryOp::Mul => format!("({a} * {b})"),
            BinaryOp::Div => format!("({a} / {b})"),
            BinaryOp::Pow => format!("{}({a}, {b})", self.math("pow")),
            BinaryOp::Max => format!("{}({a}, {b})", self.math("fmax")),
            BinaryOp::Min => format!("{}({a}, {b})", self.math("fmin")),
        }
    }

    fn bind(&self, name: &str, value: &str) -> String {
        format!("const {} {name} = {value};", self.acc)
    }
}

/// Generate the CUDA C source for a signature
pub(crate) fn generate(signature: &KernelSignature) -> Result<String> {
    signature.validate()?;
    let cu = Cuda::new(signature.dtype);
    let mut src = String::from(PRELUDE);
    let _ = writeln!(src, "typedef {} elem_t;\ntypedef {} acc_t;\n", cu.elem, cu.acc);

    let mut params: Vec<String> = input_slots(&signature.op)
        .iter()
        .enumerate()
        .map(|(i, slot)| match slot {
            Slot::Value => format!("const elem_t* __restrict__ in{i}"),
            Slot::Index => format!("const int* __restrict__ in{i}"),
        })
        .collect();
    params.push("elem_t* __restrict__ out0".to_string());
    params.push("const u64* __restrict__ dims".to_string());
    if uses_params(&signature.op) {
        params.push("const double* __restrict__ params".to_string());
    }

    let body = match &signature.op {
        KernelOp::Elementwise { program } => elementwise(&cu, program)?,
        KernelOp::Reduce { program, op } => reduce(&cu, program, *op)?,
        KernelOp::MatVec { .. } => format!(
            "    const u64 rows = dims[0], cols = dims[1];\n    if (idx >= rows) return;\n    acc_t acc = 0;\n    for (u64 c = 0; c < cols; ++c) {{\n        acc = {};\n    }}\n    out0[dims[7] + idx * dims[8]] = (elem_t)acc;\n",
            cu.mul_add(
                "acc",
                "(acc_t)in0[at(dims[2], dims[3], dims[4], idx, c)]",
                "(acc_t)in1[dims[5] + c * dims[6]]"
            )
        ),
        KernelOp::MatMul { .. } => format!(
            "    const u64 m = dims[0], n = dims[1], k = dims[2];\n    if (idx >= m * n) return;\n    const u64 i = idx / n, j = idx % n;\n    acc_t acc = 0;\n    for (u64 p = 0; p < k; ++p) {{\n        acc = {};\n    }}\n    out0[at(dims[9], dims[10], dims[11], i, j)] = (elem_t)acc;\n",
            cu.mul_add(
                "acc",
                "(acc_t)in0[at(dims[3], dims[4], dims[5], i, p)]",
                "(acc_t)in1[at(dims[6], dims[7], dims[8], p, j)]"
            )
        ),
        KernelOp::SpMV { format } => spmv(&cu, *format),
        KernelOp::TriangularSolve {
            triangle,
            unit_diagonal,
        } => triangular(*triangle, *unit_diagonal),
    };

    let _ = write!(
        src,
        "extern \"C\" __global__ void {ENTRY_POINT}(\n    {}\n) {{\n    const u64 idx = (u64)blockIdx.x * blockDim.x + threadIdx.x;\n{body}}}\n",
        params.join(",\n    ")
    );
    Ok(src)
}

fn elementwise(cu: &Cuda, program: &Program) -> Result<String> {
    let (code, result) = lower_program(program, cu, "    ")?;
    Ok(format!(
        "    const u64 rows = dims[0], cols = dims[1];\n    if (idx >= rows * cols) return;\n    const u64 r = idx / cols, c = idx % cols;\n{code}    out0[at(dims[2], dims[3], dims[4], r, c)] = (elem_t){result};\n"
    ))
}

fn reduce(cu: &Cuda, program: &Program, op: ReduceOp) -> Result<String> {
    let (code, result) = lower_program(program, cu, "        ")?;
    let step = cu.combine(op, "acc", &result);
    let fold = cu.combine(op, "partial[threadIdx.x]", "partial[threadIdx.x + s]");
    Ok(format!(
        "    __shared__ acc_t partial[{GROUP_SIZE}];\n    const u64 rows = dims[0], cols = dims[1];\n    const u64 total = rows * cols;\n    acc_t acc = {identity};\n    for (u64 i = threadIdx.x; i < total; i += blockDim.x) {{\n        const u64 r = i / cols, c = i % cols;\n{code}        acc = {step};\n    }}\n    partial[threadIdx.x] = acc;\n    __syncthreads();\n    for (unsigned int s = blockDim.x / 2; s > 0; s >>= 1) {{\n        if (threadIdx.x < s) {{\n            partial[threadIdx.x] = {fold};\n        }}\n        __syncthreads();\n    }}\n    if (idx == 0) {{\n        out0[dims[2]] = (elem_t)partial[0];\n    }}\n",
        identity = cu.identity(op)
    ))
}

fn spmv(cu: &Cuda, format: SparseFormat) -> String {
    let x = |input: usize, col: &str| format!("(acc_t)in{input}[dims[2] + (u64){col} * dims[3]]");
    let csr = |ptrs: usize, cols: usize, vals: usize, xin: usize| {
        format!(
            "    for (int k = in{ptrs}[idx]; k < in{ptrs}[idx + 1]; ++k) {{\n        acc = {};\n    }}\n",
            cu.mul_add("acc", &format!("(acc_t)in{vals}[k]"), &x(xin, &format!("in{cols}[k]")))
        )
    };
    let ell = |cols: usize, vals: usize, xin: usize| {
        format!(
            "    for (u64 slot = 0; slot < width; ++slot) {{\n        const u64 e = slot * rows + idx;\n        const int col = in{cols}[e];\n        if (col >= 0) {{\n            acc = {};\n        }}\n    }}\n",
            cu.mul_add("acc", &format!("(acc_t)in{vals}[e]"), &x(xin, "col"))
        )
    };
    let body = match format {
        SparseFormat::Csr => csr(0, 1, 2, 3),
        SparseFormat::Coo => format!(
            "    for (int k = in0[idx]; k < in0[idx + 1]; ++k) {{\n        const int j = in1[k];\n        acc = {};\n    }}\n",
            cu.mul_add("acc", "(acc_t)in3[j]", &x(4, "in2[j]"))
        ),
        SparseFormat::Ell => ell(0, 1, 2),
        SparseFormat::Hyb => ell(0, 1, 5) + &csr(2, 3, 4, 5),
    };
    format!(
        "    const u64 rows = dims[0], width = dims[1];\n    (void)width;\n    if (idx >= rows) return;\n    acc_t acc = 0;\n{body}    out0[dims[4] + idx * dims[5]] = (elem_t)acc;\n"
    )
}

fn triangular(triangle: Triangle, unit_diagonal: bool) -> String {
    let (row, inner) = match triangle {
        Triangle::Lower => ("ii", "for (u64 k = 0; k < i; ++k)"),
        Triangle::Upper => ("n - 1 - ii", "for (u64 k = i + 1; k < n; ++k)"),
    };
    let store = if unit_diagonal {
        "s"
    } else {
        "s / (acc_t)in0[at(dims[2], dims[3], dims[4], i, i)]"
    };
    format!(
        "    const u64 n = dims[0], nrhs = dims[1];\n    if (idx >= nrhs) return;\n    for (u64 ii = 0; ii < n; ++ii) {{\n        const u64 i = {row};\n        acc_t s = (acc_t)out0[at(dims[5], dims[6], dims[7], i, idx)];\n        {inner} {{\n            s -= (acc_t)in0[at(dims[2], dims[3], dims[4], i, k)] * (acc_t)out0[at(dims[5], dims[6], dims[7], k, idx)];\n        }}\n        out0[at(dims[5], dims[6], dims[7], i, idx)] = (elem_t)({store});\n    }}\n"
    )
}
