//! WGSL kernels
//!
//! WGSL has no 64-bit types, so only `f32` and `i32` kernels exist and they
//! accumulate in their own type. Integer arithmetic wraps; integer division
//! by zero yields 0.

use std::fmt::Write;

use super::{Dialect, GROUP_SIZE, Slot, input_dims, input_slots, lower_program, uses_params};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::kernel::{
    BinaryOp, KernelOp, KernelSignature, Program, ReduceOp, Triangle, UnaryOp,
};
use crate::sparse::SparseFormat;

/// Entry point of every generated shader
pub(crate) const ENTRY_POINT: &str = "main";

struct Wgsl {
    elem: &'static str,
    float: bool,
}

impl Wgsl {
    fn new(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F32 => Ok(Self {
                elem: "f32",
                float: true,
            }),
            DType::I32 => Ok(Self {
                elem: "i32",
                float: false,
            }),
            other => Err(Error::unsupported_dtype(other, "wgsl kernel")),
        }
    }

    fn zero(&self) -> &'static str {
        if self.float { "0.0" } else { "0i" }
    }
}

impl Dialect for Wgsl {
    fn load(&self, input: usize) -> String {
        let d = input_dims(input);
        format!(
            "in{input}[at(dims[{}u], dims[{}u], dims[{}u], r, c)]",
            d,
            d + 1,
            d + 2
        )
    }

    fn param(&self, index: usize) -> String {
        if self.float {
            format!("params[{index}u]")
        } else {
            format!("i32(params[{index}u])")
        }
    }

    fn unary(&self, op: UnaryOp, a: &str) -> String {
        match op {
            UnaryOp::Neg => format!("(-{a})"),
            UnaryOp::Abs => format!("abs({a})"),
            UnaryOp::Sqrt => format!("sqrt({a})"),
            UnaryOp::Exp => format!("exp({a})"),
            UnaryOp::Log => format!("log({a})"),
            UnaryOp::Sin => format!("sin({a})"),
            UnaryOp::Cos => format!("cos({a})"),
            UnaryOp::Tanh => format!("tanh({a})"),
            UnaryOp::Square => format!("({a} * {a})"),
        }
    }

    fn binary(&self, op: BinaryOp, a: &str, b: &str) -> String {
        match op {
            BinaryOp::Add => format!("({a} + {b})"),
            BinaryOp::Sub => format!("({a} - {b})"),
            BinaryOp::Mul => format!("({a} * {b})"),
            BinaryOp::Div if self.float => format!("({a} / {b})"),
            BinaryOp::Div => format!("select({a} / {b}, 0i, {b} == 0i)"),
            BinaryOp::Pow => format!("pow({a}, {b})"),
            BinaryOp::Max => format!("max({a}, {b})"),
            BinaryOp::Min => format!("min({a}, {b})"),
        }
    }

    fn bind(&self, name: &str, value: &str) -> String {
        format!("let {name} = {value};")
    }
}

fn combine(op: ReduceOp, a: &str, b: &str) -> String {
    match op {
        ReduceOp::Sum => format!("{a} + {b}"),
        ReduceOp::Max => format!("max({a}, {b})"),
        ReduceOp::Min => format!("min({a}, {b})"),
    }
}

/// Generate the WGSL source for a signature
pub(crate) fn generate(signature: &KernelSignature) -> Result<String> {
    signature.validate()?;
    let w = Wgsl::new(signature.dtype)?;
    let mut src = String::new();

    // Bindings
    let slots = input_slots(&signature.op);
    for (i, slot) in slots.iter().enumerate() {
        let ty = match slot {
            Slot::Value => w.elem,
            Slot::Index => "i32",
        };
        let _ = writeln!(src, "@group(0) @binding({i}) var<storage, read> in{i}: array<{ty}>;");
    }
    let n = slots.len();
    let _ = writeln!(
        src,
        "@group(0) @binding({n}) var<storage, read_write> out0: array<{}>;",
        w.elem
    );
    let _ = writeln!(src, "@group(0) @binding({}) var<storage, read> dims: array<u32>;", n + 1);
    if uses_params(&signature.op) {
        let _ = writeln!(src, "@group(0) @binding({}) var<storage, read> params: array<f32>;", n + 2);
    }
    src.push_str(
        "\nfn at(off: u32, rs: u32, cs: u32, r: u32, c: u32) -> u32 {\n    return off + r * rs + c * cs;\n}\n\n",
    );

    let body = match &signature.op {
        KernelOp::Reduce { program, op } => {
            return Ok(src + &reduce(&w, program, *op)?);
        }
        KernelOp::Elementwise { program } => {
            let (code, result) = lower_program(program, &w, "    ")?;
            format!(
                "    let rows = dims[0]; let cols = dims[1];\n    if (idx >= rows * cols) {{ return; }}\n    let r = idx / cols; let c = idx % cols;\n{code}    out0[at(dims[2], dims[3], dims[4], r, c)] = {result};\n"
            )
        }
        KernelOp::MatVec { .. } => format!(
            "    let rows = dims[0]; let cols = dims[1];\n    if (idx >= rows) {{ return; }}\n    var acc: {t} = {z};\n    for (var c = 0u; c < cols; c = c + 1u) {{\n        acc = acc + in0[at(dims[2], dims[3], dims[4], idx, c)] * in1[dims[5] + c * dims[6]];\n    }}\n    out0[dims[7] + idx * dims[8]] = acc;\n",
            t = w.elem,
            z = w.zero()
        ),
        KernelOp::MatMul { .. } => format!(
            "    let m = dims[0]; let n = dims[1]; let k = dims[2];\n    if (idx >= m * n) {{ return; }}\n    let i = idx / n; let j = idx % n;\n    var acc: {t} = {z};\n    for (var p = 0u; p < k; p = p + 1u) {{\n        acc = acc + in0[at(dims[3], dims[4], dims[5], i, p)] * in1[at(dims[6], dims[7], dims[8], p, j)];\n    }}\n    out0[at(dims[9], dims[10], dims[11], i, j)] = acc;\n",
            t = w.elem,
            z = w.zero()
        ),
        KernelOp::SpMV { format } => spmv(&w, *format),
        KernelOp::TriangularSolve {
            triangle,
            unit_diagonal,
        } => triangular(*triangle, *unit_diagonal),
    };

    let _ = write!(
        src,
        "@compute @workgroup_size({GROUP_SIZE})\nfn {ENTRY_POINT}(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {{\n    let idx = gid.x + gid.y * groups.x * {GROUP_SIZE}u;\n{body}}}\n"
    );
    Ok(src)
}

fn reduce(w: &Wgsl, program: &Program, op: ReduceOp) -> Result<String> {
    let (code, result) = lower_program(program, w, "        ")?;
    // Float max/min identities (+-inf) have no WGSL literal; the backend
    // appends the identity after the program parameters
    let identity = match (op, w.float) {
        (ReduceOp::Sum, _) => w.zero().to_string(),
        (_, true) => format!("params[{}u]", program.param_count()),
        (ReduceOp::Max, false) => "(-2147483647i - 1i)".to_string(),
        (ReduceOp::Min, false) => "2147483647i".to_string(),
    };
    let step = combine(op, "acc", &result);
    let fold = combine(op, "partial[lid.x]", "partial[lid.x + stride]");
    let half = GROUP_SIZE / 2;
    Ok(format!(
        "var<workgroup> partial: array<{t}, {GROUP_SIZE}>;\n\n@compute @workgroup_size({GROUP_SIZE})\nfn {ENTRY_POINT}(@builtin(local_invocation_id) lid: vec3<u32>) {{\n    let rows = dims[0]; let cols = dims[1];\n    let total = rows * cols;\n    var acc: {t} = {identity};\n    for (var i = lid.x; i < total; i = i + {GROUP_SIZE}u) {{\n        let r = i / cols; let c = i % cols;\n{code}        acc = {step};\n    }}\n    partial[lid.x] = acc;\n    workgroupBarrier();\n    for (var stride = {half}u; stride > 0u; stride = stride / 2u) {{\n        if (lid.x < stride) {{\n            partial[lid.x] = {fold};\n        }}\n        workgroupBarrier();\n    }}\n    if (lid.x == 0u) {{\n        out0[dims[2]] = partial[0];\n    }}\n}}\n",
        t = w.elem
    ))
}

fn spmv(w: &Wgsl, format: SparseFormat) -> String {
    let head = format!(
        "    let rows = dims[0]; let width = dims[1];\n    if (idx >= rows) {{ return; }}\n    var acc: {} = {};\n",
        w.elem,
        w.zero()
    );
    let csr = |ptrs: usize, cols: usize, vals: usize, x: usize| {
        format!(
            "    for (var k = u32(in{ptrs}[idx]); k < u32(in{ptrs}[idx + 1u]); k = k + 1u) {{\n        acc = acc + in{vals}[k] * in{x}[dims[2] + u32(in{cols}[k]) * dims[3]];\n    }}\n"
        )
    };
    let ell = |cols: usize, vals: usize, x: usize| {
        format!(
            "    for (var slot = 0u; slot < width; slot = slot + 1u) {{\n        let e = slot * rows + idx;\n        let col = in{cols}[e];\n        if (col >= 0i) {{\n            acc = acc + in{vals}[e] * in{x}[dims[2] + u32(col) * dims[3]];\n        }}\n    }}\n"
        )
    };
    let body = match format {
        SparseFormat::Csr => csr(0, 1, 2, 3),
        SparseFormat::Coo => "    for (var k = u32(in0[idx]); k < u32(in0[idx + 1u]); k = k + 1u) {\n        let j = u32(in1[k]);\n        acc = acc + in3[j] * in4[dims[2] + u32(in2[j]) * dims[3]];\n    }\n".to_string(),
        SparseFormat::Ell => ell(0, 1, 2),
        SparseFormat::Hyb => ell(0, 1, 5) + &csr(2, 3, 4, 5),
    };
    format!("{head}{body}    out0[dims[4] + idx * dims[5]] = acc;\n")
}

fn triangular(triangle: Triangle, unit_diagonal: bool) -> String {
    let (row, inner) = match triangle {
        Triangle::Lower => ("ii", "for (var k = 0u; k < i; k = k + 1u)"),
        Triangle::Upper => ("n - 1u - ii", "for (var k = i + 1u; k < n; k = k + 1u)"),
    };
    let store = if unit_diagonal {
        "s".to_string()
    } else {
        "s / in0[at(dims[2], dims[3], dims[4], i, i)]".to_string()
    };
    format!(
        "    let n = dims[0]; let nrhs = dims[1];\n    if (idx >= nrhs) {{ return; }}\n    for (var ii = 0u; ii < n; ii = ii + 1u) {{\n        let i = {row};\n        var s = out0[at(dims[5], dims[6], dims[7], i, idx)];\n        {inner} {{\n            s = s - in0[at(dims[2], dims[3], dims[4], i, k)] * out0[at(dims[5], dims[6], dims[7], k, idx)];\n        }}\n        out0[at(dims[5], dims[6], dims[7], i, idx)] = {store};\n    }}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::kernel::Instr;

    fn axpy() -> Program {
        let mut program = Program::new();
        program.push(Instr::Input(0));
        program.push(Instr::Param(0));
        program.push(Instr::Binary(BinaryOp::Mul));
        program.push(Instr::Input(1));
        program.push(Instr::Binary(BinaryOp::Add));
        program
    }

    #[test]
    fn test_fused_elementwise_is_one_store() {
        let sig = KernelSignature::new(KernelOp::Elementwise { program: axpy() }, DType::F32);
        let src = generate(&sig).unwrap();
        assert!(src.contains("var<storage, read> in1: array<f32>"));
        assert!(src.contains("@binding(4) var<storage, read> params"));
        assert!(src.contains("let t4 = (t2 + t3);"));
        assert_eq!(src.matches("out0[").count(), 1);
    }

    #[test]
    fn test_rejects_64_bit_dtypes() {
        let sig = KernelSignature::new(KernelOp::Elementwise { program: axpy() }, DType::F64);
        assert!(matches!(generate(&sig), Err(Error::UnsupportedDType { .. })));
    }

    #[test]
    fn test_integer_division_guard() {
        let mut program = Program::new();
        program.push(Instr::Input(0));
        program.push(Instr::Input(1));
        program.push(Instr::Binary(BinaryOp::Div));
        let sig = KernelSignature::new(KernelOp::Elementwise { program }, DType::I32);
        let src = generate(&sig).unwrap();
        assert!(src.contains("select(t0 / t1, 0i, t1 == 0i)"));
    }

    #[test]
    fn test_reduce_uses_workgroup_tree() {
        let sig = KernelSignature::new(
            KernelOp::Reduce {
                program: Program::identity(),
                op: ReduceOp::Max,
            },
            DType::F32,
        );
        let src = generate(&sig).unwrap();
        assert!(src.contains("var<workgroup> partial"));
        assert!(src.contains("var acc: f32 = params[0u];"));
    }

    #[test]
    fn test_hyb_binds_six_inputs_without_params() {
        let sig = KernelSignature::new(
            KernelOp::SpMV {
                format: SparseFormat::Hyb,
            },
            DType::F32,
        );
        let src = generate(&sig).unwrap();
        assert!(src.contains("@binding(5) var<storage, read> in5: array<f32>"));
        assert!(src.contains("@binding(7) var<storage, read> dims"));
        assert!(!src.contains("params"));
    }
}
