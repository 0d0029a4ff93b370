// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::indices::{FuncIndex, GlobalIndex};
use crate::values::Val;
use crate::wasm_unsupported;
use smallvec::SmallVec;

/// A constant expression.
///
/// These are used to initialize globals and to compute data and element
/// segment offsets.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConstExpr {
    ops: SmallVec<[ConstOp; 2]>,
}

impl ConstExpr {
    /// Create a new const expression from a `wasmparser` const expression.
    pub(crate) fn from_wasmparser(expr: &wasmparser::ConstExpr<'_>) -> crate::Result<Self> {
        let mut iter = expr
            .get_operators_reader()
            .into_iter_with_offsets()
            .peekable();

        let mut ops = SmallVec::<[ConstOp; 2]>::new();
        while let Some(res) = iter.next() {
            let (op, offset) = res?;

            if matches!(op, wasmparser::Operator::End) && iter.peek().is_none() {
                break;
            }

            ops.push(ConstOp::from_wasmparser(op, offset)?);
        }
        Ok(Self { ops })
    }

    pub fn i32(value: i32) -> Self {
        Self {
            ops: SmallVec::from_slice(&[ConstOp::I32Const(value)]),
        }
    }

    pub fn ops(&self) -> impl ExactSizeIterator<Item = ConstOp> + use<'_> {
        self.ops.iter().copied()
    }

    /// If this expression is a single `ref.func` or `ref.null`, returns the
    /// function it refers to.
    pub fn as_func_ref(&self) -> Option<Option<FuncIndex>> {
        match self.ops.as_slice() {
            [ConstOp::RefFunc(index)] => Some(Some(*index)),
            [ConstOp::RefNull] => Some(None),
            _ => None,
        }
    }
}

/// The subset of Wasm opcodes that are constant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConstOp {
    I32Const(i32),
    I64Const(i64),
    F32Const(u32),
    F64Const(u64),
    GlobalGet(GlobalIndex),
    RefNull,
    RefFunc(FuncIndex),
    I32Add,
    I32Sub,
    I32Mul,
    I64Add,
    I64Sub,
    I64Mul,
}

impl ConstOp {
    /// Convert a `wasmparser::Operator` to a `ConstOp`.
    pub(crate) fn from_wasmparser(op: wasmparser::Operator<'_>, offset: usize) -> crate::Result<Self> {
        use wasmparser::Operator as O;
        Ok(match op {
            O::I32Const { value } => Self::I32Const(value),
            O::I64Const { value } => Self::I64Const(value),
            O::F32Const { value } => Self::F32Const(value.bits()),
            O::F64Const { value } => Self::F64Const(value.bits()),
            O::RefNull { hty: _ } => Self::RefNull,
            O::RefFunc { function_index } => Self::RefFunc(FuncIndex::from_u32(function_index)),
            O::GlobalGet { global_index } => Self::GlobalGet(GlobalIndex::from_u32(global_index)),
            O::I32Add => Self::I32Add,
            O::I32Sub => Self::I32Sub,
            O::I32Mul => Self::I32Mul,
            O::I64Add => Self::I64Add,
            O::I64Sub => Self::I64Sub,
            O::I64Mul => Self::I64Mul,
            op => {
                return Err(wasm_unsupported!(
                    "unsupported opcode in const expression at offset {offset:#x}: {op:?}",
                ));
            }
        })
    }
}

/// Simple interpreter for numeric constant expressions.
#[derive(Debug, Default)]
pub struct ConstExprEvaluator {
    stack: SmallVec<[Val; 2]>,
}

impl ConstExprEvaluator {
    /// Evaluate `expr`, resolving `global.get` through `global`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`](crate::Error::Unsupported) for reference
    /// producing expressions or when the expression does not produce exactly
    /// one value.
    pub fn eval(
        &mut self,
        expr: &ConstExpr,
        mut global: impl FnMut(GlobalIndex) -> Val,
    ) -> crate::Result<Val> {
        self.stack.clear();

        for op in expr.ops() {
            match op {
                ConstOp::I32Const(value) => self.stack.push(Val::I32(value)),
                ConstOp::I64Const(value) => self.stack.push(Val::I64(value)),
                ConstOp::F32Const(value) => self.stack.push(Val::F32(value)),
                ConstOp::F64Const(value) => self.stack.push(Val::F64(value)),
                ConstOp::GlobalGet(index) => self.stack.push(global(index)),
                ConstOp::RefNull | ConstOp::RefFunc(_) => {
                    return Err(wasm_unsupported!("reference in numeric constant expression"));
                }
                ConstOp::I32Add => self.binop_i32(i32::wrapping_add)?,
                ConstOp::I32Sub => self.binop_i32(i32::wrapping_sub)?,
                ConstOp::I32Mul => self.binop_i32(i32::wrapping_mul)?,
                ConstOp::I64Add => self.binop_i64(i64::wrapping_add)?,
                ConstOp::I64Sub => self.binop_i64(i64::wrapping_sub)?,
                ConstOp::I64Mul => self.binop_i64(i64::wrapping_mul)?,
            }
        }

        match (self.stack.pop(), self.stack.is_empty()) {
            (Some(val), true) => Ok(val),
            _ => Err(wasm_unsupported!("constant expression must produce one value")),
        }
    }

    fn pop2(&mut self) -> crate::Result<(Val, Val)> {
        let rhs = self.stack.pop();
        let lhs = self.stack.pop();
        lhs.zip(rhs)
            .ok_or_else(|| wasm_unsupported!("constant expression stack underflow"))
    }

    fn binop_i32(&mut self, f: fn(i32, i32) -> i32) -> crate::Result<()> {
        match self.pop2()? {
            (Val::I32(lhs), Val::I32(rhs)) => {
                self.stack.push(Val::I32(f(lhs, rhs)));
                Ok(())
            }
            _ => Err(wasm_unsupported!("type mismatch in constant expression")),
        }
    }

    fn binop_i64(&mut self, f: fn(i64, i64) -> i64) -> crate::Result<()> {
        match self.pop2()? {
            (Val::I64(lhs), Val::I64(rhs)) => {
                self.stack.push(Val::I64(f(lhs, rhs)));
                Ok(())
            }
            _ => Err(wasm_unsupported!("type mismatch in constant expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_with_globals() {
        let expr = ConstExpr {
            ops: SmallVec::from_slice(&[
                ConstOp::GlobalGet(GlobalIndex::from_u32(0)),
                ConstOp::I32Const(5),
                ConstOp::I32Add,
            ]),
        };

        let mut eval = ConstExprEvaluator::default();
        let val = eval.eval(&expr, |_| Val::I32(37)).unwrap();
        assert_eq!(val, Val::I32(42));
    }

    #[test]
    fn func_refs() {
        let expr = ConstExpr {
            ops: SmallVec::from_slice(&[ConstOp::RefFunc(FuncIndex::from_u32(3))]),
        };
        assert_eq!(expr.as_func_ref(), Some(Some(FuncIndex::from_u32(3))));
        assert!(ConstExprEvaluator::default().eval(&expr, |_| Val::I32(0)).is_err());
        assert_eq!(ConstExpr::i32(1).as_func_ref(), None);
    }
}
