//! Interpreter for fused elementwise programs on the host

use crate::dtype::Element;
use crate::runtime::kernel::{BinaryOp, Instr, MAX_STACK_DEPTH, ReduceOp, UnaryOp};

/// Accumulator type host kernels compute in
///
/// `f64` for float dtypes, `i64` for integer dtypes. Integer arithmetic wraps
/// and integer division by zero yields 0, matching the generated GPU code.
pub(crate) trait Accum: Copy + Default + Send + Sync + PartialOrd + 'static {
    fn load<T: Element>(value: T) -> Self;
    fn store<T: Element>(self) -> T;
    fn param(value: f64) -> Self;
    fn unary(op: UnaryOp, a: Self) -> Self;
    fn binary(op: BinaryOp, a: Self, b: Self) -> Self;
    fn zero() -> Self;

    fn identity(op: ReduceOp) -> Self;

    #[inline]
    fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
        match op {
            ReduceOp::Sum => Self::binary(BinaryOp::Add, a, b),
            ReduceOp::Max => {
                if b > a {
                    b
                } else {
                    a
                }
            }
            ReduceOp::Min => {
                if b < a {
                    b
                } else {
                    a
                }
            }
        }
    }

    #[inline]
    fn mul_add(acc: Self, a: Self, b: Self) -> Self {
        Self::binary(BinaryOp::Add, acc, Self::binary(BinaryOp::Mul, a, b))
    }
}

impl Accum for f64 {
    #[inline]
    fn load<T: Element>(value: T) -> Self {
        value.to_f64()
    }

    #[inline]
    fn store<T: Element>(self) -> T {
        T::from_f64(self)
    }

    #[inline]
    fn param(value: f64) -> Self {
        value
    }

    #[inline]
    fn unary(op: UnaryOp, a: Self) -> Self {
        match op {
            UnaryOp::Neg => -a,
            UnaryOp::Abs => a.abs(),
            UnaryOp::Sqrt => a.sqrt(),
            UnaryOp::Exp => a.exp(),
            UnaryOp::Log => a.ln(),
            UnaryOp::Sin => a.sin(),
            UnaryOp::Cos => a.cos(),
            UnaryOp::Tanh => a.tanh(),
            UnaryOp::Square => a * a,
        }
    }

    #[inline]
    fn binary(op: BinaryOp, a: Self, b: Self) -> Self {
        match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Max => a.max(b),
            BinaryOp::Min => a.min(b),
        }
    }

    #[inline]
    fn zero() -> Self {
        0.0
    }

    fn identity(op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        }
    }
}

impl Accum for i64 {
    #[inline]
    fn load<T: Element>(value: T) -> Self {
        value.to_i64()
    }

    #[inline]
    fn store<T: Element>(self) -> T {
        T::from_i64(self)
    }

    #[inline]
    fn param(value: f64) -> Self {
        value as i64
    }

    #[inline]
    fn unary(op: UnaryOp, a: Self) -> Self {
        match op {
            UnaryOp::Neg => a.wrapping_neg(),
            UnaryOp::Abs => a.wrapping_abs(),
            UnaryOp::Square => a.wrapping_mul(a),
            // Rejected for integer dtypes when the signature is validated
            UnaryOp::Sqrt
            | UnaryOp::Exp
            | UnaryOp::Log
            | UnaryOp::Sin
            | UnaryOp::Cos
            | UnaryOp::Tanh => 0,
        }
    }

    #[inline]
    fn binary(op: BinaryOp, a: Self, b: Self) -> Self {
        match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => a.checked_div(b).unwrap_or(0),
            BinaryOp::Pow => 0,
            BinaryOp::Max => a.max(b),
            BinaryOp::Min => a.min(b),
        }
    }

    #[inline]
    fn zero() -> Self {
        0
    }

    fn identity(op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => 0,
            ReduceOp::Max => i64::MIN,
            ReduceOp::Min => i64::MAX,
        }
    }
}

/// Evaluate a validated postfix program for one element
///
/// `load(i)` fetches input `i` at the current position.
#[inline]
pub(crate) fn eval<A: Accum>(instrs: &[Instr], params: &[A], load: impl Fn(usize) -> A) -> A {
    let mut stack = [A::default(); MAX_STACK_DEPTH];
    let mut sp = 0usize;
    for instr in instrs {
        match *instr {
            Instr::Input(i) => {
                stack[sp] = load(i as usize);
                sp += 1;
            }
            Instr::Param(i) => {
                stack[sp] = params[i as usize];
                sp += 1;
            }
            Instr::Unary(op) => {
                stack[sp - 1] = A::unary(op, stack[sp - 1]);
            }
            Instr::Binary(op) => {
                let b = stack[sp - 1];
                let a = stack[sp - 2];
                stack[sp - 2] = A::binary(op, a, b);
                sp -= 1;
            }
        }
    }
    stack[0]
}
