//! Fusion planning for elementwise regions
//!
//! A fusion region is a maximal elementwise subtree. Its cost is counted as
//! if fully fused: every non-elementwise operand becomes one input load.
//! When a node's operands cannot all join its kernel, the most expensive
//! fusible operand is split off into its own kernel until the rest fits.

use super::operand::Operand;
use crate::container::View2D;
use crate::error::{Error, Result};
use crate::expr::{Expr, NodeKind};
use crate::runtime::kernel::{Instr, MAX_PROGRAM_LEN, MAX_STACK_DEPTH, Program};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cost {
    /// Input loads (an upper bound: duplicates are counted)
    pub(crate) inputs: usize,
    pub(crate) instrs: usize,
    pub(crate) depth: usize,
}

impl Cost {
    const LOAD: Cost = Cost {
        inputs: 1,
        instrs: 1,
        depth: 1,
    };
    const PARAM: Cost = Cost {
        inputs: 0,
        instrs: 1,
        depth: 1,
    };

    fn unary(self) -> Cost {
        Cost {
            instrs: self.instrs + 1,
            ..self
        }
    }

    fn binary(a: Cost, b: Cost) -> Cost {
        Cost {
            inputs: a.inputs + b.inputs,
            instrs: a.instrs + b.instrs + 1,
            depth: a.depth.max(b.depth + 1),
        }
    }

    pub(crate) fn fits(&self, max_inputs: usize) -> bool {
        self.inputs <= max_inputs && self.instrs <= MAX_PROGRAM_LEN && self.depth <= MAX_STACK_DEPTH
    }
}

/// Cost of fusing the whole elementwise region rooted at `expr`
pub(crate) fn region_cost(expr: &Expr) -> Cost {
    match expr.kind() {
        NodeKind::Constant(_) => Cost::PARAM,
        NodeKind::Unary(_, a) => region_cost(a).unary(),
        NodeKind::Binary(_, a, b) => Cost::binary(region_cost(a), region_cost(b)),
        _ => Cost::LOAD,
    }
}

fn unfused_cost(expr: &Expr) -> Cost {
    match expr.kind() {
        NodeKind::Constant(_) => Cost::PARAM,
        _ => Cost::LOAD,
    }
}

/// Decide which operands of an elementwise node join its kernel
pub(crate) fn plan_operands(node: &Expr, fusion: bool, max_inputs: usize) -> Vec<bool> {
    let operands: Vec<&Expr> = match node.kind() {
        NodeKind::Unary(_, a) => vec![a],
        NodeKind::Binary(_, a, b) => vec![a, b],
        _ => return Vec::new(),
    };
    let mut fuse: Vec<bool> = operands
        .iter()
        .map(|e| fusion && e.is_elementwise() && !matches!(e.kind(), NodeKind::Constant(_)))
        .collect();

    loop {
        let costs: Vec<Cost> = operands
            .iter()
            .zip(&fuse)
            .map(|(e, &f)| if f { region_cost(e) } else { unfused_cost(e) })
            .collect();
        let total = match costs.as_slice() {
            [a] => a.unary(),
            [a, b] => Cost::binary(*a, *b),
            _ => return fuse,
        };
        if total.fits(max_inputs) {
            return fuse;
        }
        let heaviest = costs
            .iter()
            .enumerate()
            .filter(|(i, _)| fuse[*i])
            .max_by_key(|(_, c)| c.instrs)
            .map(|(i, _)| i);
        match heaviest {
            Some(i) => fuse[i] = false,
            None => return fuse,
        }
    }
}

/// Program, inputs and parameters of one elementwise or reduction kernel
#[derive(Debug, Default)]
pub(crate) struct Cluster {
    pub(crate) program: Program,
    pub(crate) inputs: Vec<Operand>,
    keys: Vec<(u64, View2D)>,
    pub(crate) params: Vec<f64>,
}

impl Cluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Load `operand`, reusing the slot of an identical earlier load
    pub(crate) fn push_input(&mut self, operand: Operand) -> Result<()> {
        let key = operand.key();
        let slot = match self.keys.iter().position(|k| *k == key) {
            Some(slot) => slot,
            None => {
                self.keys.push(key);
                self.inputs.push(operand);
                self.inputs.len() - 1
            }
        };
        let slot = u8::try_from(slot)
            .map_err(|_| Error::Internal("fused kernel exceeds 255 inputs".into()))?;
        self.program.push(Instr::Input(slot));
        Ok(())
    }

    pub(crate) fn push_param(&mut self, value: f64) -> Result<()> {
        let slot = u8::try_from(self.params.len())
            .map_err(|_| Error::Internal("fused kernel exceeds 255 parameters".into()))?;
        self.params.push(value);
        self.program.push(Instr::Param(slot));
        Ok(())
    }

    pub(crate) fn push(&mut self, instr: Instr) {
        self.program.push(instr);
    }
}
