//! Host kernel implementations
//!
//! Every kernel reads operands through strided 2D views described by the
//! submission's `dims` (see [`crate::runtime::kernel`] for the layout) and
//! computes in the dtype's accumulator type. Contiguous outputs are split
//! into rows or columns and processed in parallel with rayon when large
//! enough.

use parking_lot::RwLockReadGuard;

use super::memory::{HostMemory, typed, typed_mut};
use super::program::{Accum, eval};
use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::runtime::kernel::{
    BinaryOp, KernelArgs, KernelOp, KernelSignature, Program, ReduceOp, Triangle,
};
use crate::runtime::{Buffer, DeviceMemory};
use crate::sparse::SparseFormat;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Minimum amount of work before host kernels go parallel
#[cfg(feature = "rayon")]
const PARALLEL_THRESHOLD: usize = 1 << 14;

/// Execute one kernel synchronously on the calling thread
pub(crate) fn run(signature: &KernelSignature, args: &KernelArgs) -> Result<()> {
    match &signature.op {
        KernelOp::Elementwise { program } => {
            crate::dispatch_dtype!(signature.dtype, T, A => { elementwise::<T, A>(program, args) })
        }
        KernelOp::Reduce { program, op } => {
            crate::dispatch_dtype!(signature.dtype, T, A => { reduce::<T, A>(program, *op, args) })
        }
        KernelOp::MatVec { .. } => {
            crate::dispatch_dtype!(signature.dtype, T, A => { mat_vec::<T, A>(args) })
        }
        KernelOp::MatMul { .. } => {
            crate::dispatch_dtype!(signature.dtype, T, A => { mat_mul::<T, A>(args) })
        }
        KernelOp::SpMV { format } => {
            crate::dispatch_dtype!(signature.dtype, T, A => { spmv::<T, A>(*format, args) })
        }
        KernelOp::TriangularSolve {
            triangle,
            unit_diagonal,
        } => crate::dispatch_dtype!(signature.dtype, T, A => {
            triangular_solve::<T, A>(*triangle, *unit_diagonal, args)
        }),
    }
}

// ============================================================================
// Operand plumbing
// ============================================================================

/// Element offset and strides of a 2D operand
#[derive(Debug, Clone, Copy)]
struct Strided {
    off: usize,
    rs: usize,
    cs: usize,
}

impl Strided {
    #[inline]
    fn at(&self, r: usize, c: usize) -> usize {
        self.off + r * self.rs + c * self.cs
    }

    /// Row-major contiguous over a `rows x cols` extent
    fn is_row_major(&self, rows: usize, cols: usize) -> bool {
        (cols <= 1 || self.cs == 1) && (rows <= 1 || self.rs == cols)
    }

    /// Column-major contiguous over a `rows x cols` extent
    fn is_col_major(&self, rows: usize, cols: usize) -> bool {
        (rows <= 1 || self.rs == 1) && (cols <= 1 || self.cs == rows)
    }
}

fn strided(args: &KernelArgs, at: usize) -> Result<Strided> {
    Ok(Strided {
        off: args.dim(at)?,
        rs: args.dim(at + 1)?,
        cs: args.dim(at + 2)?,
    })
}

fn vector_strided(args: &KernelArgs, at: usize) -> Result<Strided> {
    Ok(Strided {
        off: args.dim(at)?,
        rs: args.dim(at + 1)?,
        cs: 0,
    })
}

fn check_extent(what: &str, view: &Strided, rows: usize, cols: usize, len: usize) -> Result<()> {
    if rows == 0 || cols == 0 {
        return Ok(());
    }
    let last = view.at(rows - 1, cols - 1);
    if last >= len {
        return Err(Error::Internal(format!(
            "{} view reaches element {} of a {}-element buffer",
            what, last, len
        )));
    }
    Ok(())
}

fn host_memory(buffer: &Buffer) -> Result<&HostMemory> {
    match buffer.memory() {
        DeviceMemory::Host(memory) => Ok(memory),
        #[allow(unreachable_patterns)]
        _ => Err(Error::Internal(format!(
            "buffer {} is not host memory",
            buffer.id()
        ))),
    }
}

fn expect_buffers(args: &KernelArgs, inputs: usize, outputs: usize) -> Result<()> {
    if args.inputs.len() != inputs || args.outputs.len() != outputs {
        return Err(Error::Internal(format!(
            "kernel expects {} inputs/{} outputs, got {}/{}",
            inputs,
            outputs,
            args.inputs.len(),
            args.outputs.len()
        )));
    }
    for output in &args.outputs {
        if args.inputs.iter().any(|input| input.same_buffer(output)) {
            return Err(Error::Internal(format!(
                "buffer {} is both read and written by one kernel",
                output.id()
            )));
        }
    }
    Ok(())
}

/// Read locks over the input buffers, one per distinct buffer
struct LockedInputs<'a> {
    buffers: &'a [Buffer],
    guards: Vec<RwLockReadGuard<'a, Vec<u64>>>,
    slots: Vec<usize>,
}

impl<'a> LockedInputs<'a> {
    fn new(buffers: &'a [Buffer]) -> Result<Self> {
        let mut guards = Vec::with_capacity(buffers.len());
        let mut owners: Vec<&Buffer> = Vec::with_capacity(buffers.len());
        let mut slots = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            match owners.iter().position(|b| b.same_buffer(buffer)) {
                Some(slot) => slots.push(slot),
                None => {
                    slots.push(guards.len());
                    guards.push(host_memory(buffer)?.lock_read());
                    owners.push(buffer);
                }
            }
        }
        Ok(Self {
            buffers,
            guards,
            slots,
        })
    }

    fn slice<T: Element>(&self, index: usize) -> Result<&[T]> {
        let buffer = &self.buffers[index];
        if buffer.dtype() != T::DTYPE {
            return Err(Error::Internal(format!(
                "kernel input {} has dtype {}, expected {}",
                index,
                buffer.dtype(),
                T::DTYPE
            )));
        }
        Ok(typed::<T>(&self.guards[self.slots[index]], buffer.len()))
    }
}

fn load_params<A: Accum>(program: &Program, args: &KernelArgs) -> Result<Vec<A>> {
    if args.params.len() < program.param_count() {
        return Err(Error::Internal(format!(
            "program needs {} params, got {}",
            program.param_count(),
            args.params.len()
        )));
    }
    Ok(args.params.iter().map(|&p| A::param(p)).collect())
}

/// Run `f(chunk_index, chunk)` over `chunk`-sized pieces of `data`
fn for_each_chunk<T, F>(data: &mut [T], chunk: usize, work: usize, f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Send + Sync,
{
    #[cfg(feature = "rayon")]
    {
        if work >= PARALLEL_THRESHOLD {
            data.par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(i, c)| f(i, c));
            return;
        }
    }
    #[cfg(not(feature = "rayon"))]
    let _ = work;
    for (i, c) in data.chunks_mut(chunk).enumerate() {
        f(i, c);
    }
}

/// Reduce `f(0..total)` with `op`
fn reduce_range<A, F>(total: usize, op: ReduceOp, f: F) -> A
where
    A: Accum,
    F: Fn(usize) -> A + Send + Sync,
{
    #[cfg(feature = "rayon")]
    {
        if total >= PARALLEL_THRESHOLD {
            return (0..total)
                .into_par_iter()
                .map(&f)
                .reduce(|| A::identity(op), |a, b| A::combine(op, a, b));
        }
    }
    (0..total).fold(A::identity(op), |acc, i| A::combine(op, acc, f(i)))
}

// ============================================================================
// Elementwise and reductions
// ============================================================================

fn elementwise<T: Element, A: Accum>(program: &Program, args: &KernelArgs) -> Result<()> {
    let rows = args.dim(0)?;
    let cols = args.dim(1)?;
    let out_view = strided(args, 2)?;
    let n = program.input_count();
    expect_buffers(args, n, 1)?;
    let views = (0..n)
        .map(|i| strided(args, 5 + 3 * i))
        .collect::<Result<Vec<_>>>()?;
    let params = load_params::<A>(program, args)?;

    let locked = LockedInputs::new(&args.inputs)?;
    let inputs = (0..n)
        .map(|i| locked.slice::<T>(i))
        .collect::<Result<Vec<_>>>()?;
    for (view, input) in views.iter().zip(&inputs) {
        check_extent("input", view, rows, cols, input.len())?;
    }

    let output = &args.outputs[0];
    let mut guard = host_memory(output)?.lock_write();
    let out = typed_mut::<T>(&mut guard, output.len());
    check_extent("output", &out_view, rows, cols, out.len())?;
    if rows == 0 || cols == 0 {
        return Ok(());
    }

    let instrs = program.instrs();
    let value = |r: usize, c: usize| -> T {
        eval::<A>(instrs, &params, |i| A::load(inputs[i][views[i].at(r, c)])).store::<T>()
    };

    let total = rows * cols;
    if out_view.is_row_major(rows, cols) {
        let dst = &mut out[out_view.off..out_view.off + total];
        for_each_chunk(dst, cols, total, |r, chunk| {
            for (c, slot) in chunk.iter_mut().enumerate() {
                *slot = value(r, c);
            }
        });
    } else if out_view.is_col_major(rows, cols) {
        let dst = &mut out[out_view.off..out_view.off + total];
        for_each_chunk(dst, rows, total, |c, chunk| {
            for (r, slot) in chunk.iter_mut().enumerate() {
                *slot = value(r, c);
            }
        });
    } else {
        for r in 0..rows {
            for c in 0..cols {
                out[out_view.at(r, c)] = value(r, c);
            }
        }
    }
    Ok(())
}

fn reduce<T: Element, A: Accum>(program: &Program, op: ReduceOp, args: &KernelArgs) -> Result<()> {
    let rows = args.dim(0)?;
    let cols = args.dim(1)?;
    let out_off = args.dim(2)?;
    let n = program.input_count();
    expect_buffers(args, n, 1)?;
    let views = (0..n)
        .map(|i| strided(args, 5 + 3 * i))
        .collect::<Result<Vec<_>>>()?;
    let params = load_params::<A>(program, args)?;

    let locked = LockedInputs::new(&args.inputs)?;
    let inputs = (0..n)
        .map(|i| locked.slice::<T>(i))
        .collect::<Result<Vec<_>>>()?;
    for (view, input) in views.iter().zip(&inputs) {
        check_extent("input", view, rows, cols, input.len())?;
    }

    let instrs = program.instrs();
    let total = rows * cols;
    let result = if total == 0 {
        A::identity(op)
    } else {
        reduce_range(total, op, |i| {
            let (r, c) = (i / cols, i % cols);
            eval::<A>(instrs, &params, |k| A::load(inputs[k][views[k].at(r, c)]))
        })
    };

    let output = &args.outputs[0];
    let mut guard = host_memory(output)?.lock_write();
    let out = typed_mut::<T>(&mut guard, output.len());
    let slot = out
        .get_mut(out_off)
        .ok_or(Error::IndexOutOfBounds {
            index: out_off,
            size: output.len(),
        })?;
    *slot = result.store::<T>();
    Ok(())
}

// ============================================================================
// Dense products
// ============================================================================

fn mat_vec<T: Element, A: Accum>(args: &KernelArgs) -> Result<()> {
    let rows = args.dim(0)?;
    let cols = args.dim(1)?;
    let a_view = strided(args, 2)?;
    let x_view = vector_strided(args, 5)?;
    let y_view = vector_strided(args, 7)?;
    expect_buffers(args, 2, 1)?;

    let locked = LockedInputs::new(&args.inputs)?;
    let a = locked.slice::<T>(0)?;
    let x = locked.slice::<T>(1)?;
    check_extent("matrix", &a_view, rows, cols, a.len())?;
    check_extent("x", &x_view, cols, 1, x.len())?;

    let output = &args.outputs[0];
    let mut guard = host_memory(output)?.lock_write();
    let y = typed_mut::<T>(&mut guard, output.len());
    check_extent("y", &y_view, rows, 1, y.len())?;

    let row_value = |r: usize| -> T {
        let mut acc = A::zero();
        for c in 0..cols {
            acc = A::mul_add(acc, A::load(a[a_view.at(r, c)]), A::load(x[x_view.at(c, 0)]));
        }
        acc.store::<T>()
    };

    if rows == 0 {
        return Ok(());
    }
    if y_view.rs == 1 {
        let dst = &mut y[y_view.off..y_view.off + rows];
        for_each_chunk(dst, 1, rows * cols, |r, slot| slot[0] = row_value(r));
    } else {
        for r in 0..rows {
            y[y_view.at(r, 0)] = row_value(r);
        }
    }
    Ok(())
}

fn mat_mul<T: Element, A: Accum>(args: &KernelArgs) -> Result<()> {
    let m = args.dim(0)?;
    let n = args.dim(1)?;
    let k = args.dim(2)?;
    let a_view = strided(args, 3)?;
    let b_view = strided(args, 6)?;
    let c_view = strided(args, 9)?;
    expect_buffers(args, 2, 1)?;

    let locked = LockedInputs::new(&args.inputs)?;
    let a = locked.slice::<T>(0)?;
    let b = locked.slice::<T>(1)?;
    check_extent("lhs", &a_view, m, k, a.len())?;
    check_extent("rhs", &b_view, k, n, b.len())?;

    let output = &args.outputs[0];
    let mut guard = host_memory(output)?.lock_write();
    let c = typed_mut::<T>(&mut guard, output.len());
    check_extent("output", &c_view, m, n, c.len())?;
    if m == 0 || n == 0 {
        return Ok(());
    }

    let value = |i: usize, j: usize| -> T {
        let mut acc = A::zero();
        for p in 0..k {
            acc = A::mul_add(acc, A::load(a[a_view.at(i, p)]), A::load(b[b_view.at(p, j)]));
        }
        acc.store::<T>()
    };

    let total = m * n;
    let work = total * k.max(1);
    if c_view.is_row_major(m, n) {
        let dst = &mut c[c_view.off..c_view.off + total];
        for_each_chunk(dst, n, work, |i, row| {
            for (j, slot) in row.iter_mut().enumerate() {
                *slot = value(i, j);
            }
        });
    } else if c_view.is_col_major(m, n) {
        let dst = &mut c[c_view.off..c_view.off + total];
        for_each_chunk(dst, m, work, |j, col| {
            for (i, slot) in col.iter_mut().enumerate() {
                *slot = value(i, j);
            }
        });
    } else {
        for i in 0..m {
            for j in 0..n {
                c[c_view.at(i, j)] = value(i, j);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Sparse matrix-vector products
// ============================================================================

#[inline]
fn csr_row<T: Element, A: Accum>(
    ptrs: &[i32],
    cols: &[i32],
    vals: &[T],
    x: &[T],
    x_view: Strided,
    row: usize,
) -> A {
    let (start, end) = (ptrs[row] as usize, ptrs[row + 1] as usize);
    let mut acc = A::zero();
    for k in start..end {
        let col = cols[k] as usize;
        acc = A::mul_add(acc, A::load(vals[k]), A::load(x[x_view.at(col, 0)]));
    }
    acc
}

#[inline]
fn ell_row<T: Element, A: Accum>(
    cols: &[i32],
    vals: &[T],
    rows: usize,
    width: usize,
    x: &[T],
    x_view: Strided,
    row: usize,
) -> A {
    let mut acc = A::zero();
    for slot in 0..width {
        let idx = slot * rows + row;
        let col = cols[idx];
        if col >= 0 {
            acc = A::mul_add(acc, A::load(vals[idx]), A::load(x[x_view.at(col as usize, 0)]));
        }
    }
    acc
}

fn write_rows<T, A, F>(args: &KernelArgs, rows: usize, y_view: Strided, work: usize, row: F) -> Result<()>
where
    T: Element,
    A: Accum,
    F: Fn(usize) -> A + Send + Sync,
{
    let output = &args.outputs[0];
    let mut guard = host_memory(output)?.lock_write();
    let y = typed_mut::<T>(&mut guard, output.len());
    check_extent("y", &y_view, rows, 1, y.len())?;
    if rows == 0 {
        return Ok(());
    }
    if y_view.rs == 1 {
        let dst = &mut y[y_view.off..y_view.off + rows];
        for_each_chunk(dst, 1, work, |r, slot| slot[0] = row(r).store::<T>());
    } else {
        for r in 0..rows {
            y[y_view.at(r, 0)] = row(r).store::<T>();
        }
    }
    Ok(())
}

fn spmv<T: Element, A: Accum>(format: SparseFormat, args: &KernelArgs) -> Result<()> {
    let rows = args.dim(0)?;
    let width = args.dim(1)?;
    let x_view = vector_strided(args, 2)?;
    let y_view = vector_strided(args, 4)?;

    match format {
        SparseFormat::Csr => {
            expect_buffers(args, 4, 1)?;
            let locked = LockedInputs::new(&args.inputs)?;
            let ptrs = locked.slice::<i32>(0)?;
            let cols = locked.slice::<i32>(1)?;
            let vals = locked.slice::<T>(2)?;
            let x = locked.slice::<T>(3)?;
            write_rows::<T, A, _>(args, rows, y_view, vals.len(), |r| {
                csr_row::<T, A>(ptrs, cols, vals, x, x_view, r)
            })
        }
        SparseFormat::Coo => {
            expect_buffers(args, 5, 1)?;
            let locked = LockedInputs::new(&args.inputs)?;
            let groups = locked.slice::<i32>(0)?;
            let perm = locked.slice::<i32>(1)?;
            let cols = locked.slice::<i32>(2)?;
            let vals = locked.slice::<T>(3)?;
            let x = locked.slice::<T>(4)?;
            write_rows::<T, A, _>(args, rows, y_view, vals.len(), |r| {
                let mut acc = A::zero();
                for k in groups[r] as usize..groups[r + 1] as usize {
                    let j = perm[k] as usize;
                    let col = cols[j] as usize;
                    acc = A::mul_add(acc, A::load(vals[j]), A::load(x[x_view.at(col, 0)]));
                }
                acc
            })
        }
        SparseFormat::Ell => {
            expect_buffers(args, 3, 1)?;
            let locked = LockedInputs::new(&args.inputs)?;
            let cols = locked.slice::<i32>(0)?;
            let vals = locked.slice::<T>(1)?;
            let x = locked.slice::<T>(2)?;
            write_rows::<T, A, _>(args, rows, y_view, rows * width, |r| {
                ell_row::<T, A>(cols, vals, rows, width, x, x_view, r)
            })
        }
        SparseFormat::Hyb => {
            expect_buffers(args, 6, 1)?;
            let locked = LockedInputs::new(&args.inputs)?;
            let ell_cols = locked.slice::<i32>(0)?;
            let ell_vals = locked.slice::<T>(1)?;
            let ptrs = locked.slice::<i32>(2)?;
            let csr_cols = locked.slice::<i32>(3)?;
            let csr_vals = locked.slice::<T>(4)?;
            let x = locked.slice::<T>(5)?;
            write_rows::<T, A, _>(args, rows, y_view, rows * width + csr_vals.len(), |r| {
                let ell = ell_row::<T, A>(ell_cols, ell_vals, rows, width, x, x_view, r);
                let csr = csr_row::<T, A>(ptrs, csr_cols, csr_vals, x, x_view, r);
                A::binary(BinaryOp::Add, ell, csr)
            })
        }
    }
}

// ============================================================================
// Triangular solve
// ============================================================================

fn triangular_solve<T: Element, A: Accum>(
    triangle: Triangle,
    unit_diagonal: bool,
    args: &KernelArgs,
) -> Result<()> {
    let n = args.dim(0)?;
    let nrhs = args.dim(1)?;
    let a_view = strided(args, 2)?;
    let x_view = strided(args, 5)?;
    expect_buffers(args, 1, 1)?;

    let locked = LockedInputs::new(&args.inputs)?;
    let a = locked.slice::<T>(0)?;
    check_extent("matrix", &a_view, n, n, a.len())?;

    let output = &args.outputs[0];
    let mut guard = host_memory(output)?.lock_write();
    let x = typed_mut::<T>(&mut guard, output.len());
    check_extent("rhs", &x_view, n, nrhs, x.len())?;
    if n == 0 || nrhs == 0 {
        return Ok(());
    }

    let at = |i: usize, j: usize| A::load(a[a_view.at(i, j)]);
    let divide = |i: usize, s: A| -> Result<A> {
        if unit_diagonal {
            return Ok(s);
        }
        let d = at(i, i);
        if d == A::zero() {
            return Err(Error::SingularSystem {
                index: i,
                value: 0.0,
            });
        }
        Ok(A::binary(BinaryOp::Div, s, d))
    };
    let rhs: &[T] = &*x;
    let solve = |j: usize| -> Result<Vec<A>> {
        let mut v = vec![A::zero(); n];
        match triangle {
            Triangle::Lower => {
                for i in 0..n {
                    let mut s = A::load(rhs[x_view.at(i, j)]);
                    for k in 0..i {
                        s = A::binary(BinaryOp::Sub, s, A::binary(BinaryOp::Mul, at(i, k), v[k]));
                    }
                    v[i] = divide(i, s)?;
                }
            }
            Triangle::Upper => {
                for i in (0..n).rev() {
                    let mut s = A::load(rhs[x_view.at(i, j)]);
                    for k in i + 1..n {
                        s = A::binary(BinaryOp::Sub, s, A::binary(BinaryOp::Mul, at(i, k), v[k]));
                    }
                    v[i] = divide(i, s)?;
                }
            }
        }
        Ok(v)
    };

    #[cfg(feature = "rayon")]
    let columns: Vec<Vec<A>> = if n * n * nrhs >= PARALLEL_THRESHOLD && nrhs > 1 {
        (0..nrhs).into_par_iter().map(solve).collect::<Result<Vec<_>>>()?
    } else {
        (0..nrhs).map(solve).collect::<Result<Vec<_>>>()?
    };
    #[cfg(not(feature = "rayon"))]
    let columns: Vec<Vec<A>> = (0..nrhs).map(solve).collect::<Result<Vec<_>>>()?;

    for (j, column) in columns.iter().enumerate() {
        for (i, value) in column.iter().enumerate() {
            x[x_view.at(i, j)] = value.store::<T>();
        }
    }
    Ok(())
}
