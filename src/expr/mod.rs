//! Expression graph
//!
//! An [`Expr`] is an immutable tree of operations over containers. Nodes are
//! shared through `Arc`, so cloning an expression or reusing it as an operand
//! of several parents is free and the dispatcher can recognise shared
//! subexpressions by identity.
//!
//! Building a node checks shapes, dtypes and contexts immediately and touches
//! no device state:
//!
//! ```ignore
//! let r = b.sub(a.mat_vec(&x)?)?;      // ShapeMismatch raised here, if any
//! let n = r.norm_2()?;
//! let value = ctx.evaluate(&n)?.into_scalar()?.to_f64()?;
//! ```

mod ops;
mod shape;

pub use shape::ExprShape;

use std::fmt;
use std::sync::Arc;

use crate::container::{Container, DenseLayout, DenseMatrix, Scalar, Span, Vector};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::Context;
use crate::runtime::kernel::{BinaryOp, ReduceOp, UnaryOp};
use crate::sparse::SparseMatrix;

/// Operator tag and operands of an expression node
#[derive(Debug)]
pub(crate) enum NodeKind {
    /// A container
    Leaf(Container),
    /// A host scalar, passed to kernels as a parameter
    Constant(f64),
    Unary(UnaryOp, Expr),
    Binary(BinaryOp, Expr, Expr),
    /// Full reduction to a scalar
    Reduce(ReduceOp, Expr),
    MatVec(Expr, Expr),
    MatMul(Expr, Expr),
    Transpose(Expr),
    Slice { source: Expr, rows: Span, cols: Span },
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) shape: ExprShape,
    pub(crate) dtype: DType,
    pub(crate) context: Context,
}

/// A lazily evaluated linear-algebra expression
#[derive(Clone)]
pub struct Expr {
    node: Arc<Node>,
}

impl Expr {
    pub(crate) fn from_node(kind: NodeKind, shape: ExprShape, dtype: DType, context: Context) -> Self {
        Self {
            node: Arc::new(Node {
                kind,
                shape,
                dtype,
                context,
            }),
        }
    }

    /// Leaf expression over a container
    pub fn leaf(container: Container) -> Self {
        let shape = container.shape();
        let dtype = container.dtype();
        let context = container.context().clone();
        Self::from_node(NodeKind::Leaf(container), shape, dtype, context)
    }

    /// A host constant of `dtype` on `context`
    pub fn constant(context: &Context, value: f64, dtype: DType) -> Self {
        Self::from_node(NodeKind::Constant(value), ExprShape::Scalar, dtype, context.clone())
    }

    /// Result shape
    pub fn shape(&self) -> ExprShape {
        self.node.shape
    }

    /// Result dtype
    pub fn dtype(&self) -> DType {
        self.node.dtype
    }

    /// Context all operands live on
    pub fn context(&self) -> &Context {
        &self.node.context
    }

    /// The container, if this is a leaf
    pub fn as_container(&self) -> Option<&Container> {
        match &self.node.kind {
            NodeKind::Leaf(c) => Some(c),
            _ => None,
        }
    }

    /// Evaluate on the owning context, blocking until the result is ready
    pub fn evaluate(&self) -> Result<Container> {
        self.context().evaluate(self)
    }

    #[inline]
    pub(crate) fn kind(&self) -> &NodeKind {
        &self.node.kind
    }

    /// Identity of the shared node
    #[inline]
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.node) as usize
    }

    pub(crate) fn is_sparse_leaf(&self) -> bool {
        matches!(self.kind(), NodeKind::Leaf(Container::Sparse(_)))
    }

    /// Whether the node is an elementwise operator or constant
    pub(crate) fn is_elementwise(&self) -> bool {
        matches!(
            self.kind(),
            NodeKind::Unary(..) | NodeKind::Binary(..) | NodeKind::Constant(_)
        )
    }

    /// Whether the node only re-indexes a leaf (leaf, transpose, slice chain)
    pub(crate) fn is_view(&self) -> bool {
        match self.kind() {
            NodeKind::Leaf(c) => !matches!(c, Container::Sparse(_)),
            NodeKind::Transpose(e) => e.is_view(),
            NodeKind::Slice { source, .. } => source.is_view(),
            _ => false,
        }
    }

    /// Storage order a materialised matrix result should use
    pub(crate) fn preferred_layout(&self) -> DenseLayout {
        match self.kind() {
            NodeKind::Leaf(Container::Matrix(m)) => m.layout(),
            NodeKind::Transpose(e) => e.preferred_layout().transposed(),
            NodeKind::Slice { source, .. } => source.preferred_layout(),
            NodeKind::Unary(_, e) => e.preferred_layout(),
            NodeKind::Binary(_, a, b) => {
                if matches!(a.shape(), ExprShape::Matrix(..)) {
                    a.preferred_layout()
                } else {
                    b.preferred_layout()
                }
            }
            _ => DenseLayout::RowMajor,
        }
    }

    /// Visit every container referenced by the tree
    pub(crate) fn for_each_leaf<F: FnMut(&Container)>(&self, f: &mut F) {
        match self.kind() {
            NodeKind::Leaf(c) => f(c),
            NodeKind::Constant(_) => {}
            NodeKind::Unary(_, a)
            | NodeKind::Reduce(_, a)
            | NodeKind::Transpose(a)
            | NodeKind::Slice { source: a, .. } => a.for_each_leaf(f),
            NodeKind::Binary(_, a, b) | NodeKind::MatVec(a, b) | NodeKind::MatMul(a, b) => {
                a.for_each_leaf(f);
                b.for_each_leaf(f);
            }
        }
    }

    /// Operands must share one context
    pub(crate) fn check_context(&self, op: &'static str, other: &Expr) -> Result<()> {
        if self.context() != other.context() {
            return Err(Error::CrossContextOperation {
                op,
                lhs: self.context().id(),
                rhs: other.context().id(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_dtype(&self, op: &'static str, other: &Expr) -> Result<()> {
        if self.dtype() != other.dtype() {
            return Err(Error::dtype_mismatch(op, self.dtype(), other.dtype()));
        }
        Ok(())
    }

    pub(crate) fn check_dense(&self, op: &'static str) -> Result<()> {
        if self.is_sparse_leaf() {
            return Err(Error::unsupported(
                op,
                "sparse matrices are only supported as the matrix operand of mat_vec",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            NodeKind::Leaf(c) => write!(f, "{}[{}; {}]", c.kind_name(), self.shape(), self.dtype()),
            NodeKind::Constant(v) => write!(f, "{}", v),
            NodeKind::Unary(op, a) => write!(f, "{}({:?})", op.name(), a),
            NodeKind::Binary(op, a, b) => write!(f, "{}({:?}, {:?})", op.name(), a, b),
            NodeKind::Reduce(op, a) => write!(f, "reduce_{}({:?})", op.name(), a),
            NodeKind::MatVec(a, x) => write!(f, "mat_vec({:?}, {:?})", a, x),
            NodeKind::MatMul(a, b) => write!(f, "mat_mul({:?}, {:?})", a, b),
            NodeKind::Transpose(a) => write!(f, "transpose({:?})", a),
            NodeKind::Slice { source, .. } => write!(f, "slice({:?}) -> {}", source, self.shape()),
        }
    }
}

impl From<Container> for Expr {
    fn from(c: Container) -> Self {
        Self::leaf(c)
    }
}

impl From<&Container> for Expr {
    fn from(c: &Container) -> Self {
        Self::leaf(c.clone())
    }
}

impl From<&Expr> for Expr {
    fn from(e: &Expr) -> Self {
        e.clone()
    }
}

macro_rules! impl_leaf_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Expr {
                fn from(c: $ty) -> Self {
                    Self::leaf(Container::$variant(c))
                }
            }

            impl From<&$ty> for Expr {
                fn from(c: &$ty) -> Self {
                    Self::leaf(Container::$variant(c.clone()))
                }
            }
        )*
    };
}

impl_leaf_from!(
    Scalar => Scalar,
    Vector => Vector,
    DenseMatrix => Matrix,
    SparseMatrix => Sparse,
);
