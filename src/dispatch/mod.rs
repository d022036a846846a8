//! Kernel dispatcher: lowers expression graphs to kernel submissions
//!
//! Lowering is a bottom-up traversal:
//!
//! - leaves, transposes and slices of leaves become views (no kernel)
//! - elementwise regions become one fused `Elementwise` kernel, split by the
//!   backend's input budget (see [`fusion`])
//! - a reduction absorbs the elementwise map feeding it
//! - products and sparse products get dedicated kernels writing temporaries
//!
//! Submissions are ordered by buffer hazards ([`Context::launch`]), so the
//! dispatcher never waits between kernels. Shared subexpressions (the same
//! `Expr` node referenced twice) are computed once per dispatch.

mod fusion;
mod operand;

use log::trace;
use std::collections::HashMap;

use self::fusion::{Cluster, plan_operands};
use self::operand::Operand;
use crate::container::{Container, DenseLayout};
use crate::error::{Error, Result};
use crate::expr::{Expr, ExprShape, NodeKind};
use crate::runtime::Context;
use crate::runtime::kernel::{Instr, KernelArgs, KernelOp, KernelSignature, Program, ReduceOp};

/// Lowers one expression graph onto a context
pub struct Dispatcher<'a> {
    context: &'a Context,
    fusion: bool,
    max_inputs: usize,
    memo: HashMap<usize, Operand>,
    kernels: usize,
}

impl<'a> Dispatcher<'a> {
    /// Dispatcher honouring the context's fusion settings
    pub fn new(context: &'a Context) -> Self {
        Self {
            context,
            fusion: context.fusion_enabled(),
            max_inputs: context.max_kernel_inputs(),
            memo: HashMap::new(),
            kernels: 0,
        }
    }

    /// Override fusion for this dispatcher only
    pub fn with_fusion(mut self, fusion: bool) -> Self {
        self.fusion = fusion && self.context.fusion_enabled();
        self
    }

    /// Kernels submitted so far
    pub fn kernels_launched(&self) -> usize {
        self.kernels
    }

    fn check_owner(&self, op: &'static str, expr: &Expr) -> Result<()> {
        if expr.context() != self.context {
            return Err(Error::CrossContextOperation {
                op,
                lhs: self.context.id(),
                rhs: expr.context().id(),
            });
        }
        Ok(())
    }

    /// Lower `expr` into a fresh container without waiting for the result
    pub fn enqueue(&mut self, expr: &Expr) -> Result<Container> {
        self.check_owner("enqueue", expr)?;
        if let NodeKind::Leaf(Container::Sparse(s)) = expr.kind() {
            return Ok(Container::Sparse(s.clone()));
        }
        let result = self.compute(expr, None)?;
        result.into_container(expr.shape())
    }

    /// Lower `expr` into a fresh container and wait for it
    pub fn evaluate(&mut self, expr: &Expr) -> Result<Container> {
        let result = self.enqueue(expr)?;
        if let Some((buffer, _, _)) = result.dense_parts() {
            buffer.wait_written()?;
        }
        Ok(result)
    }

    /// Evaluate `expr` into the dense view `target` and wait for it
    ///
    /// A target whose buffer the expression also reads is written through a
    /// temporary.
    pub fn assign(&mut self, target: &Container, expr: &Expr) -> Result<()> {
        self.check_owner("assign", expr)?;
        if target.context() != self.context {
            return Err(Error::CrossContextOperation {
                op: "assign",
                lhs: self.context.id(),
                rhs: target.context().id(),
            });
        }
        let dest = Operand::from_container(target)
            .ok_or_else(|| Error::unsupported("assign", "sparse matrices are immutable"))?;
        expr.check_dense("assign")?;
        if target.dtype() != expr.dtype() {
            return Err(Error::dtype_mismatch("assign", target.dtype(), expr.dtype()));
        }
        if target.shape() != expr.shape() {
            return Err(Error::shape_mismatch(
                "assign",
                &target.shape().extents(),
                &expr.shape().extents(),
            ));
        }

        let mut aliased = false;
        expr.for_each_leaf(&mut |c| match c {
            Container::Sparse(_) => {}
            other => {
                if let Some((buffer, _, _)) = other.dense_parts() {
                    aliased |= buffer.same_buffer(&dest.buffer);
                }
            }
        });

        let buffer = dest.buffer.clone();
        if aliased {
            let temp = self.compute(expr, None)?;
            self.copy(temp, dest, expr.shape())?;
        } else {
            self.compute(expr, Some(dest))?;
        }
        buffer.wait_written()
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Result of `expr` as an operand: a view for leaves, a temporary otherwise
    fn materialize(&mut self, expr: &Expr) -> Result<Operand> {
        match expr.kind() {
            NodeKind::Leaf(c) => Operand::from_container(c).ok_or_else(|| {
                Error::unsupported(
                    "evaluate",
                    "sparse matrices are only supported as the matrix operand of mat_vec",
                )
            }),
            NodeKind::Transpose(e) => Ok(self.materialize(e)?.transposed()),
            NodeKind::Slice { source, rows, cols } => self.materialize(source)?.select(*rows, *cols),
            _ => {
                if let Some(op) = self.memo.get(&expr.id()) {
                    return Ok(op.clone());
                }
                let op = self.compute(expr, None)?;
                self.memo.insert(expr.id(), op.clone());
                Ok(op)
            }
        }
    }

    /// Compute `expr` into `dest` (or a fresh temporary)
    fn compute(&mut self, expr: &Expr, dest: Option<Operand>) -> Result<Operand> {
        match expr.kind() {
            NodeKind::Leaf(_) | NodeKind::Transpose(_) | NodeKind::Slice { .. } => {
                if expr.is_view() || dest.is_some() {
                    let src = self.materialize(expr)?;
                    let dest = match dest {
                        Some(d) => d,
                        None => self.allocate(expr, expr.preferred_layout())?,
                    };
                    self.copy(src, dest, expr.shape())
                } else {
                    // a view over a temporary is already private to the caller
                    self.materialize(expr)
                }
            }
            NodeKind::Constant(_) | NodeKind::Unary(..) | NodeKind::Binary(..) => {
                let dest = match dest {
                    Some(d) => d,
                    None => self.allocate(expr, expr.preferred_layout())?,
                };
                let mut cluster = Cluster::new();
                self.emit_root(expr, &mut cluster)?;
                self.launch_cluster(expr, expr.shape(), cluster, None, dest)
            }
            NodeKind::Reduce(op, source) => {
                let dest = match dest {
                    Some(d) => d,
                    None => self.allocate(expr, DenseLayout::RowMajor)?,
                };
                let mut cluster = Cluster::new();
                if self.fusion && source.is_elementwise() {
                    self.emit_root(source, &mut cluster)?;
                } else {
                    let input = self.materialize(source)?;
                    cluster.push_input(input)?;
                }
                self.launch_cluster(expr, source.shape(), cluster, Some(*op), dest)
            }
            NodeKind::MatVec(a, x) => self.mat_vec(expr, a, x, dest),
            NodeKind::MatMul(a, b) => self.mat_mul(expr, a, b, dest),
        }
    }

    fn allocate(&self, expr: &Expr, layout: DenseLayout) -> Result<Operand> {
        Operand::allocate(self.context, expr.shape(), expr.dtype(), layout)
    }

    // ========================================================================
    // Elementwise emission
    // ========================================================================

    /// Emit an elementwise node as the root of `cluster`
    fn emit_root(&mut self, expr: &Expr, cluster: &mut Cluster) -> Result<()> {
        let fuse = plan_operands(expr, self.fusion, self.max_inputs);
        match expr.kind() {
            NodeKind::Constant(v) => cluster.push_param(*v),
            NodeKind::Unary(op, a) => {
                self.emit_operand(a, fuse[0], cluster)?;
                cluster.push(Instr::Unary(*op));
                Ok(())
            }
            NodeKind::Binary(op, a, b) => {
                self.emit_operand(a, fuse[0], cluster)?;
                self.emit_operand(b, fuse[1], cluster)?;
                cluster.push(Instr::Binary(*op));
                Ok(())
            }
            _ => {
                let input = self.materialize(expr)?;
                cluster.push_input(input)
            }
        }
    }

    fn emit_operand(&mut self, expr: &Expr, fuse: bool, cluster: &mut Cluster) -> Result<()> {
        if fuse {
            return self.emit_region(expr, cluster);
        }
        match expr.kind() {
            NodeKind::Constant(v) => cluster.push_param(*v),
            _ => {
                let input = self.materialize(expr)?;
                cluster.push_input(input)
            }
        }
    }

    /// Emit a whole elementwise region into `cluster`
    fn emit_region(&mut self, expr: &Expr, cluster: &mut Cluster) -> Result<()> {
        match expr.kind() {
            NodeKind::Constant(v) => cluster.push_param(*v),
            NodeKind::Unary(op, a) => {
                self.emit_region(a, cluster)?;
                cluster.push(Instr::Unary(*op));
                Ok(())
            }
            NodeKind::Binary(op, a, b) => {
                self.emit_region(a, cluster)?;
                self.emit_region(b, cluster)?;
                cluster.push(Instr::Binary(*op));
                Ok(())
            }
            _ => {
                let input = self.materialize(expr)?;
                cluster.push_input(input)
            }
        }
    }

    /// Submit an elementwise (or reducing, with `reduce`) kernel over `space`
    fn launch_cluster(
        &mut self,
        expr: &Expr,
        space: ExprShape,
        cluster: Cluster,
        reduce: Option<ReduceOp>,
        dest: Operand,
    ) -> Result<Operand> {
        let (rows, cols) = space.dims();
        let Cluster {
            program,
            inputs,
            params,
            ..
        } = cluster;
        trace!(
            "lowering {:?}: {} ops over {} inputs",
            expr,
            program.op_count(),
            inputs.len()
        );
        let op = match reduce {
            Some(op) => KernelOp::Reduce { program, op },
            None => KernelOp::Elementwise { program },
        };

        let mut dims = vec![rows as u64, cols as u64];
        dims.extend(dest.dims());
        let mut args = KernelArgs::new().output(&dest.buffer).params(&params);
        for input in &inputs {
            dims.extend(input.dims());
            args = args.input(&input.buffer);
        }
        self.launch(KernelSignature::new(op, expr.dtype()), args.dims(&dims))?;
        Ok(dest)
    }

    fn copy(&mut self, src: Operand, dest: Operand, shape: ExprShape) -> Result<Operand> {
        let (rows, cols) = shape.dims();
        let mut dims = vec![rows as u64, cols as u64];
        dims.extend(dest.dims());
        dims.extend(src.dims());
        let args = KernelArgs::new()
            .input(&src.buffer)
            .output(&dest.buffer)
            .dims(&dims);
        let signature = KernelSignature::new(
            KernelOp::Elementwise {
                program: Program::identity(),
            },
            src.buffer.dtype(),
        );
        self.launch(signature, args)?;
        Ok(dest)
    }

    // ========================================================================
    // Products
    // ========================================================================

    fn mat_vec(&mut self, expr: &Expr, a: &Expr, x: &Expr, dest: Option<Operand>) -> Result<Operand> {
        let (rows, cols) = a.shape().dims();
        let x_op = self.materialize(x)?;
        let y = match dest {
            Some(d) => d,
            None => self.allocate(expr, DenseLayout::RowMajor)?,
        };

        if let NodeKind::Leaf(Container::Sparse(s)) = a.kind() {
            let mut args = KernelArgs::new();
            for buffer in s.spmv_inputs() {
                args = args.input(&buffer);
            }
            let mut dims = vec![rows as u64, s.ell_width() as u64];
            dims.extend(x_op.vector_dims());
            dims.extend(y.vector_dims());
            let args = args.input(&x_op.buffer).output(&y.buffer).dims(&dims);
            let op = KernelOp::SpMV { format: s.format() };
            self.launch(KernelSignature::new(op, expr.dtype()), args)?;
            return Ok(y);
        }

        let a_op = self.materialize(a)?;
        let mut dims = vec![rows as u64, cols as u64];
        dims.extend(a_op.dims());
        dims.extend(x_op.vector_dims());
        dims.extend(y.vector_dims());
        let args = KernelArgs::new()
            .input(&a_op.buffer)
            .input(&x_op.buffer)
            .output(&y.buffer)
            .dims(&dims);
        let op = KernelOp::MatVec {
            layout: a_op.layout_of_view(),
        };
        self.launch(KernelSignature::new(op, expr.dtype()), args)?;
        Ok(y)
    }

    fn mat_mul(&mut self, expr: &Expr, a: &Expr, b: &Expr, dest: Option<Operand>) -> Result<Operand> {
        let (m, k) = a.shape().dims();
        let (_, n) = b.shape().dims();
        let a_op = self.materialize(a)?;
        let b_op = self.materialize(b)?;
        let c = match dest {
            Some(d) => d,
            None => self.allocate(expr, DenseLayout::RowMajor)?,
        };
        let mut dims = vec![m as u64, n as u64, k as u64];
        dims.extend(a_op.dims());
        dims.extend(b_op.dims());
        dims.extend(c.dims());
        let args = KernelArgs::new()
            .input(&a_op.buffer)
            .input(&b_op.buffer)
            .output(&c.buffer)
            .dims(&dims);
        let op = KernelOp::MatMul {
            a_layout: a_op.layout_of_view(),
            b_layout: b_op.layout_of_view(),
        };
        self.launch(KernelSignature::new(op, expr.dtype()), args)?;
        Ok(c)
    }

    fn launch(&mut self, signature: KernelSignature, args: KernelArgs) -> Result<()> {
        let kernel = self.context.compile_or_fetch(&signature)?;
        self.context.launch(&kernel, args)?;
        self.kernels += 1;
        Ok(())
    }
}

impl Context {
    /// Evaluate an expression into a fresh container, blocking until done
    pub fn evaluate(&self, expr: &Expr) -> Result<Container> {
        Dispatcher::new(self).evaluate(expr)
    }

    /// Submit an expression without waiting; the result is ordered after its
    /// producers through buffer dependency tracking
    pub fn enqueue(&self, expr: &Expr) -> Result<Container> {
        Dispatcher::new(self).enqueue(expr)
    }

    /// Evaluate an expression into an existing dense container or view
    pub fn assign(&self, target: &Container, expr: &Expr) -> Result<()> {
        Dispatcher::new(self).assign(target, expr)
    }
}
