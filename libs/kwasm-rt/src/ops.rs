// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Numeric semantics shared by the lowered-code executor and the interpreter.
//!
//! Operands are assumed to be well typed; function bodies are validated before
//! either tier runs them.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::float_cmp,
    reason = "wasm numeric instructions are defined in terms of these casts"
)]

use crate::trap::Trap;
use crate::values::Val;
use wasmparser::Operator;

/// Size of a wasm page in bytes.
pub const WASM_PAGE_SIZE: usize = 0x10000;
/// The largest number of pages a 32-bit memory can address.
pub const WASM32_MAX_PAGES: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    I32Eqz,
    I32Clz,
    I32Ctz,
    I32Popcnt,
    I64Eqz,
    I64Clz,
    I64Ctz,
    I64Popcnt,
    F32Abs,
    F32Neg,
    F32Ceil,
    F32Floor,
    F32Trunc,
    F32Nearest,
    F32Sqrt,
    F64Abs,
    F64Neg,
    F64Ceil,
    F64Floor,
    F64Trunc,
    F64Nearest,
    F64Sqrt,
    I32WrapI64,
    I32TruncF32S,
    I32TruncF32U,
    I32TruncF64S,
    I32TruncF64U,
    I64ExtendI32S,
    I64ExtendI32U,
    I64TruncF32S,
    I64TruncF32U,
    I64TruncF64S,
    I64TruncF64U,
    F32ConvertI32S,
    F32ConvertI32U,
    F32ConvertI64S,
    F32ConvertI64U,
    F32DemoteF64,
    F64ConvertI32S,
    F64ConvertI32U,
    F64ConvertI64S,
    F64ConvertI64U,
    F64PromoteF32,
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,
    I32Extend8S,
    I32Extend16S,
    I64Extend8S,
    I64Extend16S,
    I64Extend32S,
    I32TruncSatF32S,
    I32TruncSatF32U,
    I32TruncSatF64S,
    I32TruncSatF64U,
    I64TruncSatF32S,
    I64TruncSatF32U,
    I64TruncSatF64S,
    I64TruncSatF64U,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    I32Eq,
    I32Ne,
    I32LtS,
    I32LtU,
    I32GtS,
    I32GtU,
    I32LeS,
    I32LeU,
    I32GeS,
    I32GeU,
    I64Eq,
    I64Ne,
    I64LtS,
    I64LtU,
    I64GtS,
    I64GtU,
    I64LeS,
    I64LeU,
    I64GeS,
    I64GeU,
    F32Eq,
    F32Ne,
    F32Lt,
    F32Gt,
    F32Le,
    F32Ge,
    F64Eq,
    F64Ne,
    F64Lt,
    F64Gt,
    F64Le,
    F64Ge,
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32DivU,
    I32RemS,
    I32RemU,
    I32And,
    I32Or,
    I32Xor,
    I32Shl,
    I32ShrS,
    I32ShrU,
    I32Rotl,
    I32Rotr,
    I64Add,
    I64Sub,
    I64Mul,
    I64DivS,
    I64DivU,
    I64RemS,
    I64RemU,
    I64And,
    I64Or,
    I64Xor,
    I64Shl,
    I64ShrS,
    I64ShrU,
    I64Rotl,
    I64Rotr,
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    F32Min,
    F32Max,
    F32Copysign,
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    F64Min,
    F64Max,
    F64Copysign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    I32,
    I64,
    F32,
    F64,
    I32S8,
    I32U8,
    I32S16,
    I32U16,
    I64S8,
    I64U8,
    I64S16,
    I64U16,
    I64S32,
    I64U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    I32,
    I64,
    F32,
    F64,
    I32N8,
    I32N16,
    I64N8,
    I64N16,
    I64N32,
}

impl LoadKind {
    pub(crate) const fn size(self) -> usize {
        match self {
            Self::I32S8 | Self::I32U8 | Self::I64S8 | Self::I64U8 => 1,
            Self::I32S16 | Self::I32U16 | Self::I64S16 | Self::I64U16 => 2,
            Self::I32 | Self::F32 | Self::I64S32 | Self::I64U32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

impl StoreKind {
    pub(crate) const fn size(self) -> usize {
        match self {
            Self::I32N8 | Self::I64N8 => 1,
            Self::I32N16 | Self::I64N16 => 2,
            Self::I32 | Self::F32 | Self::I64N32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

/// Instructions whose semantics do not depend on control flow, calls, locals,
/// globals or memory sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Simple {
    Unary(UnOp),
    Binary(BinOp),
    Load(LoadKind, u32),
    Store(StoreKind, u32),
}

impl Simple {
    /// Classifies `op`, returning `None` for anything that is not a plain
    /// numeric or memory access instruction.
    pub(crate) fn from_operator(op: &Operator<'_>) -> Option<Self> {
        macro_rules! unop {
            ($($name:ident)*) => {
                match op {
                    $(Operator::$name => return Some(Self::Unary(UnOp::$name)),)*
                    _ => {}
                }
            };
        }
        macro_rules! binop {
            ($($name:ident)*) => {
                match op {
                    $(Operator::$name => return Some(Self::Binary(BinOp::$name)),)*
                    _ => {}
                }
            };
        }

        unop! {
            I32Eqz I32Clz I32Ctz I32Popcnt I64Eqz I64Clz I64Ctz I64Popcnt
            F32Abs F32Neg F32Ceil F32Floor F32Trunc F32Nearest F32Sqrt
            F64Abs F64Neg F64Ceil F64Floor F64Trunc F64Nearest F64Sqrt
            I32WrapI64 I32TruncF32S I32TruncF32U I32TruncF64S I32TruncF64U
            I64ExtendI32S I64ExtendI32U I64TruncF32S I64TruncF32U I64TruncF64S I64TruncF64U
            F32ConvertI32S F32ConvertI32U F32ConvertI64S F32ConvertI64U F32DemoteF64
            F64ConvertI32S F64ConvertI32U F64ConvertI64S F64ConvertI64U F64PromoteF32
            I32ReinterpretF32 I64ReinterpretF64 F32ReinterpretI32 F64ReinterpretI64
            I32Extend8S I32Extend16S I64Extend8S I64Extend16S I64Extend32S
            I32TruncSatF32S I32TruncSatF32U I32TruncSatF64S I32TruncSatF64U
            I64TruncSatF32S I64TruncSatF32U I64TruncSatF64S I64TruncSatF64U
        }

        binop! {
            I32Eq I32Ne I32LtS I32LtU I32GtS I32GtU I32LeS I32LeU I32GeS I32GeU
            I64Eq I64Ne I64LtS I64LtU I64GtS I64GtU I64LeS I64LeU I64GeS I64GeU
            F32Eq F32Ne F32Lt F32Gt F32Le F32Ge F64Eq F64Ne F64Lt F64Gt F64Le F64Ge
            I32Add I32Sub I32Mul I32DivS I32DivU I32RemS I32RemU I32And I32Or I32Xor
            I32Shl I32ShrS I32ShrU I32Rotl I32Rotr
            I64Add I64Sub I64Mul I64DivS I64DivU I64RemS I64RemU I64And I64Or I64Xor
            I64Shl I64ShrS I64ShrU I64Rotl I64Rotr
            F32Add F32Sub F32Mul F32Div F32Min F32Max F32Copysign
            F64Add F64Sub F64Mul F64Div F64Min F64Max F64Copysign
        }

        let (load, store) = match *op {
            Operator::I32Load { memarg } => (Some(LoadKind::I32), memarg),
            Operator::I64Load { memarg } => (Some(LoadKind::I64), memarg),
            Operator::F32Load { memarg } => (Some(LoadKind::F32), memarg),
            Operator::F64Load { memarg } => (Some(LoadKind::F64), memarg),
            Operator::I32Load8S { memarg } => (Some(LoadKind::I32S8), memarg),
            Operator::I32Load8U { memarg } => (Some(LoadKind::I32U8), memarg),
            Operator::I32Load16S { memarg } => (Some(LoadKind::I32S16), memarg),
            Operator::I32Load16U { memarg } => (Some(LoadKind::I32U16), memarg),
            Operator::I64Load8S { memarg } => (Some(LoadKind::I64S8), memarg),
            Operator::I64Load8U { memarg } => (Some(LoadKind::I64U8), memarg),
            Operator::I64Load16S { memarg } => (Some(LoadKind::I64S16), memarg),
            Operator::I64Load16U { memarg } => (Some(LoadKind::I64U16), memarg),
            Operator::I64Load32S { memarg } => (Some(LoadKind::I64S32), memarg),
            Operator::I64Load32U { memarg } => (Some(LoadKind::I64U32), memarg),
            Operator::I32Store { memarg } => return store_op(StoreKind::I32, memarg.offset),
            Operator::I64Store { memarg } => return store_op(StoreKind::I64, memarg.offset),
            Operator::F32Store { memarg } => return store_op(StoreKind::F32, memarg.offset),
            Operator::F64Store { memarg } => return store_op(StoreKind::F64, memarg.offset),
            Operator::I32Store8 { memarg } => return store_op(StoreKind::I32N8, memarg.offset),
            Operator::I32Store16 { memarg } => return store_op(StoreKind::I32N16, memarg.offset),
            Operator::I64Store8 { memarg } => return store_op(StoreKind::I64N8, memarg.offset),
            Operator::I64Store16 { memarg } => return store_op(StoreKind::I64N16, memarg.offset),
            Operator::I64Store32 { memarg } => return store_op(StoreKind::I64N32, memarg.offset),
            _ => return None,
        };

        Some(Self::Load(load?, u32::try_from(store.offset).ok()?))
    }
}

fn store_op(kind: StoreKind, offset: u64) -> Option<Simple> {
    Some(Simple::Store(kind, u32::try_from(offset).ok()?))
}

/// Evaluates a unary instruction.
pub(crate) fn unary(op: UnOp, v: Val) -> Result<Val, Trap> {
    use UnOp::*;

    Ok(match op {
        I32Eqz => Val::I32(i32::from(v.unwrap_i32() == 0)),
        I32Clz => Val::I32(v.unwrap_i32().leading_zeros() as i32),
        I32Ctz => Val::I32(v.unwrap_i32().trailing_zeros() as i32),
        I32Popcnt => Val::I32(v.unwrap_i32().count_ones() as i32),
        I64Eqz => Val::I32(i32::from(v.unwrap_i64() == 0)),
        I64Clz => Val::I64(i64::from(v.unwrap_i64().leading_zeros())),
        I64Ctz => Val::I64(i64::from(v.unwrap_i64().trailing_zeros())),
        I64Popcnt => Val::I64(i64::from(v.unwrap_i64().count_ones())),

        F32Abs => Val::F32(f32_bits(v) & 0x7fff_ffff),
        F32Neg => Val::F32(f32_bits(v) ^ 0x8000_0000),
        F32Ceil => Val::from_f32(v.unwrap_f32().ceil()),
        F32Floor => Val::from_f32(v.unwrap_f32().floor()),
        F32Trunc => Val::from_f32(v.unwrap_f32().trunc()),
        F32Nearest => Val::from_f32(v.unwrap_f32().round_ties_even()),
        F32Sqrt => Val::from_f32(v.unwrap_f32().sqrt()),
        F64Abs => Val::F64(f64_bits(v) & 0x7fff_ffff_ffff_ffff),
        F64Neg => Val::F64(f64_bits(v) ^ 0x8000_0000_0000_0000),
        F64Ceil => Val::from_f64(v.unwrap_f64().ceil()),
        F64Floor => Val::from_f64(v.unwrap_f64().floor()),
        F64Trunc => Val::from_f64(v.unwrap_f64().trunc()),
        F64Nearest => Val::from_f64(v.unwrap_f64().round_ties_even()),
        F64Sqrt => Val::from_f64(v.unwrap_f64().sqrt()),

        I32WrapI64 => Val::I32(v.unwrap_i64() as i32),
        I32TruncF32S => Val::I32(trunc_checked(
            f64::from(v.unwrap_f32()),
            -2_147_483_649.0,
            2_147_483_648.0,
        )? as i32),
        I32TruncF32U => Val::I32(trunc_checked(f64::from(v.unwrap_f32()), -1.0, 4_294_967_296.0)?
            as u32 as i32),
        I32TruncF64S => Val::I32(
            trunc_checked(v.unwrap_f64(), -2_147_483_649.0, 2_147_483_648.0)? as i32,
        ),
        I32TruncF64U => {
            Val::I32(trunc_checked(v.unwrap_f64(), -1.0, 4_294_967_296.0)? as u32 as i32)
        }
        I64ExtendI32S => Val::I64(i64::from(v.unwrap_i32())),
        I64ExtendI32U => Val::I64(i64::from(v.unwrap_i32() as u32)),
        I64TruncF32S => Val::I64(trunc_i64(f64::from(v.unwrap_f32()))?),
        I64TruncF32U => Val::I64(trunc_u64(f64::from(v.unwrap_f32()))? as i64),
        I64TruncF64S => Val::I64(trunc_i64(v.unwrap_f64())?),
        I64TruncF64U => Val::I64(trunc_u64(v.unwrap_f64())? as i64),

        F32ConvertI32S => Val::from_f32(v.unwrap_i32() as f32),
        F32ConvertI32U => Val::from_f32(v.unwrap_i32() as u32 as f32),
        F32ConvertI64S => Val::from_f32(v.unwrap_i64() as f32),
        F32ConvertI64U => Val::from_f32(v.unwrap_i64() as u64 as f32),
        F32DemoteF64 => Val::from_f32(v.unwrap_f64() as f32),
        F64ConvertI32S => Val::from_f64(f64::from(v.unwrap_i32())),
        F64ConvertI32U => Val::from_f64(f64::from(v.unwrap_i32() as u32)),
        F64ConvertI64S => Val::from_f64(v.unwrap_i64() as f64),
        F64ConvertI64U => Val::from_f64(v.unwrap_i64() as u64 as f64),
        F64PromoteF32 => Val::from_f64(f64::from(v.unwrap_f32())),

        I32ReinterpretF32 => Val::I32(f32_bits(v) as i32),
        I64ReinterpretF64 => Val::I64(f64_bits(v) as i64),
        F32ReinterpretI32 => Val::F32(v.unwrap_i32() as u32),
        F64ReinterpretI64 => Val::F64(v.unwrap_i64() as u64),

        I32Extend8S => Val::I32(i32::from(v.unwrap_i32() as i8)),
        I32Extend16S => Val::I32(i32::from(v.unwrap_i32() as i16)),
        I64Extend8S => Val::I64(i64::from(v.unwrap_i64() as i8)),
        I64Extend16S => Val::I64(i64::from(v.unwrap_i64() as i16)),
        I64Extend32S => Val::I64(i64::from(v.unwrap_i64() as i32)),

        // `as` float to int casts saturate and map NaN to zero
        I32TruncSatF32S => Val::I32(v.unwrap_f32() as i32),
        I32TruncSatF32U => Val::I32(v.unwrap_f32() as u32 as i32),
        I32TruncSatF64S => Val::I32(v.unwrap_f64() as i32),
        I32TruncSatF64U => Val::I32(v.unwrap_f64() as u32 as i32),
        I64TruncSatF32S => Val::I64(v.unwrap_f32() as i64),
        I64TruncSatF32U => Val::I64(v.unwrap_f32() as u64 as i64),
        I64TruncSatF64S => Val::I64(v.unwrap_f64() as i64),
        I64TruncSatF64U => Val::I64(v.unwrap_f64() as u64 as i64),
    })
}

/// Evaluates a binary instruction.
pub(crate) fn binary(op: BinOp, lhs: Val, rhs: Val) -> Result<Val, Trap> {
    use BinOp::*;

    macro_rules! cmp {
        ($get:ident, $cvt:ty, $op:tt) => {
            Val::I32(i32::from((lhs.$get() as $cvt) $op (rhs.$get() as $cvt)))
        };
    }

    Ok(match op {
        I32Eq => cmp!(unwrap_i32, i32, ==),
        I32Ne => cmp!(unwrap_i32, i32, !=),
        I32LtS => cmp!(unwrap_i32, i32, <),
        I32LtU => cmp!(unwrap_i32, u32, <),
        I32GtS => cmp!(unwrap_i32, i32, >),
        I32GtU => cmp!(unwrap_i32, u32, >),
        I32LeS => cmp!(unwrap_i32, i32, <=),
        I32LeU => cmp!(unwrap_i32, u32, <=),
        I32GeS => cmp!(unwrap_i32, i32, >=),
        I32GeU => cmp!(unwrap_i32, u32, >=),
        I64Eq => cmp!(unwrap_i64, i64, ==),
        I64Ne => cmp!(unwrap_i64, i64, !=),
        I64LtS => cmp!(unwrap_i64, i64, <),
        I64LtU => cmp!(unwrap_i64, u64, <),
        I64GtS => cmp!(unwrap_i64, i64, >),
        I64GtU => cmp!(unwrap_i64, u64, >),
        I64LeS => cmp!(unwrap_i64, i64, <=),
        I64LeU => cmp!(unwrap_i64, u64, <=),
        I64GeS => cmp!(unwrap_i64, i64, >=),
        I64GeU => cmp!(unwrap_i64, u64, >=),
        F32Eq => cmp!(unwrap_f32, f32, ==),
        F32Ne => cmp!(unwrap_f32, f32, !=),
        F32Lt => cmp!(unwrap_f32, f32, <),
        F32Gt => cmp!(unwrap_f32, f32, >),
        F32Le => cmp!(unwrap_f32, f32, <=),
        F32Ge => cmp!(unwrap_f32, f32, >=),
        F64Eq => cmp!(unwrap_f64, f64, ==),
        F64Ne => cmp!(unwrap_f64, f64, !=),
        F64Lt => cmp!(unwrap_f64, f64, <),
        F64Gt => cmp!(unwrap_f64, f64, >),
        F64Le => cmp!(unwrap_f64, f64, <=),
        F64Ge => cmp!(unwrap_f64, f64, >=),

        I32Add => Val::I32(lhs.unwrap_i32().wrapping_add(rhs.unwrap_i32())),
        I32Sub => Val::I32(lhs.unwrap_i32().wrapping_sub(rhs.unwrap_i32())),
        I32Mul => Val::I32(lhs.unwrap_i32().wrapping_mul(rhs.unwrap_i32())),
        I32DivS => {
            let (a, b) = (lhs.unwrap_i32(), rhs.unwrap_i32());
            if b == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            Val::I32(a.checked_div(b).ok_or(Trap::IntegerOverflow)?)
        }
        I32DivU => {
            let (a, b) = (lhs.unwrap_i32() as u32, rhs.unwrap_i32() as u32);
            Val::I32(a.checked_div(b).ok_or(Trap::IntegerDivisionByZero)? as i32)
        }
        I32RemS => {
            let (a, b) = (lhs.unwrap_i32(), rhs.unwrap_i32());
            if b == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            Val::I32(a.wrapping_rem(b))
        }
        I32RemU => {
            let (a, b) = (lhs.unwrap_i32() as u32, rhs.unwrap_i32() as u32);
            Val::I32(a.checked_rem(b).ok_or(Trap::IntegerDivisionByZero)? as i32)
        }
        I32And => Val::I32(lhs.unwrap_i32() & rhs.unwrap_i32()),
        I32Or => Val::I32(lhs.unwrap_i32() | rhs.unwrap_i32()),
        I32Xor => Val::I32(lhs.unwrap_i32() ^ rhs.unwrap_i32()),
        I32Shl => Val::I32(lhs.unwrap_i32().wrapping_shl(rhs.unwrap_i32() as u32)),
        I32ShrS => Val::I32(lhs.unwrap_i32().wrapping_shr(rhs.unwrap_i32() as u32)),
        I32ShrU => Val::I32((lhs.unwrap_i32() as u32).wrapping_shr(rhs.unwrap_i32() as u32) as i32),
        I32Rotl => Val::I32(lhs.unwrap_i32().rotate_left(rhs.unwrap_i32() as u32)),
        I32Rotr => Val::I32(lhs.unwrap_i32().rotate_right(rhs.unwrap_i32() as u32)),

        I64Add => Val::I64(lhs.unwrap_i64().wrapping_add(rhs.unwrap_i64())),
        I64Sub => Val::I64(lhs.unwrap_i64().wrapping_sub(rhs.unwrap_i64())),
        I64Mul => Val::I64(lhs.unwrap_i64().wrapping_mul(rhs.unwrap_i64())),
        I64DivS => {
            let (a, b) = (lhs.unwrap_i64(), rhs.unwrap_i64());
            if b == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            Val::I64(a.checked_div(b).ok_or(Trap::IntegerOverflow)?)
        }
        I64DivU => {
            let (a, b) = (lhs.unwrap_i64() as u64, rhs.unwrap_i64() as u64);
            Val::I64(a.checked_div(b).ok_or(Trap::IntegerDivisionByZero)? as i64)
        }
        I64RemS => {
            let (a, b) = (lhs.unwrap_i64(), rhs.unwrap_i64());
            if b == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            Val::I64(a.wrapping_rem(b))
        }
        I64RemU => {
            let (a, b) = (lhs.unwrap_i64() as u64, rhs.unwrap_i64() as u64);
            Val::I64(a.checked_rem(b).ok_or(Trap::IntegerDivisionByZero)? as i64)
        }
        I64And => Val::I64(lhs.unwrap_i64() & rhs.unwrap_i64()),
        I64Or => Val::I64(lhs.unwrap_i64() | rhs.unwrap_i64()),
        I64Xor => Val::I64(lhs.unwrap_i64() ^ rhs.unwrap_i64()),
        I64Shl => Val::I64(lhs.unwrap_i64().wrapping_shl(rhs.unwrap_i64() as u32)),
        I64ShrS => Val::I64(lhs.unwrap_i64().wrapping_shr(rhs.unwrap_i64() as u32)),
        I64ShrU => Val::I64((lhs.unwrap_i64() as u64).wrapping_shr(rhs.unwrap_i64() as u32) as i64),
        I64Rotl => Val::I64(lhs.unwrap_i64().rotate_left((rhs.unwrap_i64() & 63) as u32)),
        I64Rotr => Val::I64(lhs.unwrap_i64().rotate_right((rhs.unwrap_i64() & 63) as u32)),

        F32Add => Val::from_f32(lhs.unwrap_f32() + rhs.unwrap_f32()),
        F32Sub => Val::from_f32(lhs.unwrap_f32() - rhs.unwrap_f32()),
        F32Mul => Val::from_f32(lhs.unwrap_f32() * rhs.unwrap_f32()),
        F32Div => Val::from_f32(lhs.unwrap_f32() / rhs.unwrap_f32()),
        F32Min => Val::from_f32(wasm_min_f32(lhs.unwrap_f32(), rhs.unwrap_f32())),
        F32Max => Val::from_f32(wasm_max_f32(lhs.unwrap_f32(), rhs.unwrap_f32())),
        F32Copysign => Val::F32((f32_bits(lhs) & 0x7fff_ffff) | (f32_bits(rhs) & 0x8000_0000)),
        F64Add => Val::from_f64(lhs.unwrap_f64() + rhs.unwrap_f64()),
        F64Sub => Val::from_f64(lhs.unwrap_f64() - rhs.unwrap_f64()),
        F64Mul => Val::from_f64(lhs.unwrap_f64() * rhs.unwrap_f64()),
        F64Div => Val::from_f64(lhs.unwrap_f64() / rhs.unwrap_f64()),
        F64Min => Val::from_f64(wasm_min_f64(lhs.unwrap_f64(), rhs.unwrap_f64())),
        F64Max => Val::from_f64(wasm_max_f64(lhs.unwrap_f64(), rhs.unwrap_f64())),
        F64Copysign => Val::F64(
            (f64_bits(lhs) & 0x7fff_ffff_ffff_ffff) | (f64_bits(rhs) & 0x8000_0000_0000_0000),
        ),
    })
}

/// Computes `addr + offset` and checks that `size` bytes starting there fit
/// in a memory of `mem_len` bytes.
fn effective_address(mem_len: usize, addr: Val, offset: u32, size: usize) -> Result<usize, Trap> {
    let start = u64::from(addr.unwrap_i32() as u32) + u64::from(offset);
    let start = usize::try_from(start).map_err(|_| Trap::MemoryOutOfBounds)?;
    match start.checked_add(size) {
        Some(end) if end <= mem_len => Ok(start),
        _ => Err(Trap::MemoryOutOfBounds),
    }
}

/// Loads a value of `kind` from linear memory, trapping if any accessed byte
/// lies outside `mem`.
pub(crate) fn load(kind: LoadKind, mem: &[u8], addr: Val, offset: u32) -> Result<Val, Trap> {
    let start = effective_address(mem.len(), addr, offset, kind.size())?;
    let bytes = &mem[start..start + kind.size()];

    macro_rules! read {
        ($ty:ty) => {
            <$ty>::from_le_bytes(bytes.try_into().map_err(|_| Trap::MemoryOutOfBounds)?)
        };
    }

    Ok(match kind {
        LoadKind::I32 => Val::I32(read!(i32)),
        LoadKind::I64 => Val::I64(read!(i64)),
        LoadKind::F32 => Val::F32(read!(u32)),
        LoadKind::F64 => Val::F64(read!(u64)),
        LoadKind::I32S8 => Val::I32(i32::from(read!(i8))),
        LoadKind::I32U8 => Val::I32(i32::from(read!(u8))),
        LoadKind::I32S16 => Val::I32(i32::from(read!(i16))),
        LoadKind::I32U16 => Val::I32(i32::from(read!(u16))),
        LoadKind::I64S8 => Val::I64(i64::from(read!(i8))),
        LoadKind::I64U8 => Val::I64(i64::from(read!(u8))),
        LoadKind::I64S16 => Val::I64(i64::from(read!(i16))),
        LoadKind::I64U16 => Val::I64(i64::from(read!(u16))),
        LoadKind::I64S32 => Val::I64(i64::from(read!(i32))),
        LoadKind::I64U32 => Val::I64(i64::from(read!(u32))),
    })
}

/// Stores `val` to linear memory, trapping without writing anything if any
/// accessed byte lies outside `mem`.
pub(crate) fn store(
    kind: StoreKind,
    mem: &mut [u8],
    addr: Val,
    offset: u32,
    val: Val,
) -> Result<(), Trap> {
    let start = effective_address(mem.len(), addr, offset, kind.size())?;
    let dst = &mut mem[start..start + kind.size()];

    match kind {
        StoreKind::I32 => dst.copy_from_slice(&val.unwrap_i32().to_le_bytes()),
        StoreKind::I64 => dst.copy_from_slice(&val.unwrap_i64().to_le_bytes()),
        StoreKind::F32 => dst.copy_from_slice(&f32_bits(val).to_le_bytes()),
        StoreKind::F64 => dst.copy_from_slice(&f64_bits(val).to_le_bytes()),
        StoreKind::I32N8 => dst.copy_from_slice(&(val.unwrap_i32() as u8).to_le_bytes()),
        StoreKind::I32N16 => dst.copy_from_slice(&(val.unwrap_i32() as u16).to_le_bytes()),
        StoreKind::I64N8 => dst.copy_from_slice(&(val.unwrap_i64() as u8).to_le_bytes()),
        StoreKind::I64N16 => dst.copy_from_slice(&(val.unwrap_i64() as u16).to_le_bytes()),
        StoreKind::I64N32 => dst.copy_from_slice(&(val.unwrap_i64() as u32).to_le_bytes()),
    }
    Ok(())
}

fn f32_bits(v: Val) -> u32 {
    match v {
        Val::F32(bits) => bits,
        other => panic!("expected f32, found {other:?}"),
    }
}

fn f64_bits(v: Val) -> u64 {
    match v {
        Val::F64(bits) => bits,
        other => panic!("expected f64, found {other:?}"),
    }
}

/// Truncates `x` towards zero, requiring the result to lie strictly between
/// `lower` and `upper`.
fn trunc_checked(x: f64, lower: f64, upper: f64) -> Result<f64, Trap> {
    if x.is_nan() {
        return Err(Trap::BadConversionToInteger);
    }
    let t = x.trunc();
    if t <= lower || t >= upper {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t)
}

fn trunc_i64(x: f64) -> Result<i64, Trap> {
    if x.is_nan() {
        return Err(Trap::BadConversionToInteger);
    }
    let t = x.trunc();
    if !(-9_223_372_036_854_775_808.0..9_223_372_036_854_775_808.0).contains(&t) {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as i64)
}

fn trunc_u64(x: f64) -> Result<u64, Trap> {
    if x.is_nan() {
        return Err(Trap::BadConversionToInteger);
    }
    let t = x.trunc();
    if t <= -1.0 || t >= 18_446_744_073_709_551_616.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as u64)
}

fn wasm_min_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        // -0.0 == 0.0, prefer the negative zero
        if a.is_sign_negative() { a } else { b }
    } else {
        a.min(b)
    }
}

fn wasm_max_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        if a.is_sign_positive() { a } else { b }
    } else {
        a.max(b)
    }
}

fn wasm_min_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_negative() { a } else { b }
    } else {
        a.min(b)
    }
}

fn wasm_max_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_positive() { a } else { b }
    } else {
        a.max(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn integer_traps() {
        assert_eq!(
            binary(BinOp::I32DivS, Val::I32(1), Val::I32(0)),
            Err(Trap::IntegerDivisionByZero)
        );
        assert_eq!(
            binary(BinOp::I32DivS, Val::I32(i32::MIN), Val::I32(-1)),
            Err(Trap::IntegerOverflow)
        );
        assert_eq!(
            binary(BinOp::I32RemS, Val::I32(i32::MIN), Val::I32(-1)),
            Ok(Val::I32(0))
        );
        assert_eq!(
            binary(BinOp::I64RemU, Val::I64(5), Val::I64(0)),
            Err(Trap::IntegerDivisionByZero)
        );
        assert_eq!(
            binary(BinOp::I32DivU, Val::I32(-1), Val::I32(2)),
            Ok(Val::I32(i32::MAX))
        );
    }

    #[test]
    fn float_to_int() {
        assert_eq!(
            unary(UnOp::I32TruncF32S, Val::from_f32(f32::NAN)),
            Err(Trap::BadConversionToInteger)
        );
        assert_eq!(
            unary(UnOp::I32TruncF64S, Val::from_f64(2_147_483_648.0)),
            Err(Trap::IntegerOverflow)
        );
        assert_eq!(
            unary(UnOp::I32TruncF64S, Val::from_f64(-2_147_483_648.9)),
            Ok(Val::I32(i32::MIN))
        );
        assert_eq!(
            unary(UnOp::I32TruncF64U, Val::from_f64(-0.9)),
            Ok(Val::I32(0))
        );
        assert_eq!(
            unary(UnOp::I64TruncF64U, Val::from_f64(-1.0)),
            Err(Trap::IntegerOverflow)
        );
        assert_eq!(
            unary(UnOp::I32TruncSatF32U, Val::from_f32(-5.0)),
            Ok(Val::I32(0))
        );
    }

    #[test]
    fn float_min_max() {
        let min = binary(BinOp::F64Min, Val::from_f64(0.0), Val::from_f64(-0.0)).unwrap();
        assert!(min.unwrap_f64().is_sign_negative());
        let max = binary(BinOp::F32Max, Val::from_f32(-0.0), Val::from_f32(0.0)).unwrap();
        assert!(max.unwrap_f32().is_sign_positive());
        let nan = binary(BinOp::F32Min, Val::from_f32(f32::NAN), Val::from_f32(1.0)).unwrap();
        assert!(nan.unwrap_f32().is_nan());
        assert_eq!(
            unary(UnOp::F64Nearest, Val::from_f64(2.5)),
            Ok(Val::from_f64(2.0))
        );
    }

    #[test]
    fn memory_bounds() {
        let mut mem = vec![0; 16];
        store(StoreKind::I32, &mut mem, Val::I32(12), 0, Val::I32(-1)).unwrap();
        assert_eq!(
            store(StoreKind::I32, &mut mem, Val::I32(13), 0, Val::I32(7)),
            Err(Trap::MemoryOutOfBounds)
        );
        assert_eq!(&mem[12..], &[0xff; 4]);
        assert_eq!(
            load(LoadKind::I64, &mem, Val::I32(-1), 0),
            Err(Trap::MemoryOutOfBounds)
        );
        assert_eq!(
            load(LoadKind::I32U8, &mem, Val::I32(0), 15),
            Ok(Val::I32(0xff))
        );
    }

    proptest! {
        #[test]
        fn store_load_round_trip(addr in 0u32..64, offset in 0u32..64, bits: u64) {
            let mut mem = vec![0; 128];
            let cases = [
                (StoreKind::I32, LoadKind::I32, Val::I32(bits as i32)),
                (StoreKind::I64, LoadKind::I64, Val::I64(bits as i64)),
                (StoreKind::F32, LoadKind::F32, Val::F32(bits as u32)),
                (StoreKind::F64, LoadKind::F64, Val::F64(bits)),
                (StoreKind::I32N8, LoadKind::I32U8, Val::I32(i32::from(bits as u8))),
                (StoreKind::I64N16, LoadKind::I64S16, Val::I64(i64::from(bits as i16))),
                (StoreKind::I64N32, LoadKind::I64U32, Val::I64(i64::from(bits as u32))),
            ];
            for (store_kind, load_kind, val) in cases {
                store(store_kind, &mut mem, Val::I32(addr as i32), offset, val).unwrap();
                prop_assert_eq!(load(load_kind, &mem, Val::I32(addr as i32), offset), Ok(val));
            }
        }

        #[test]
        fn out_of_bounds_always_traps(addr in 0u32..256, offset in 0u32..256) {
            let mut mem = vec![0; 128];
            let kinds = [(StoreKind::I32, LoadKind::I32), (StoreKind::F64, LoadKind::F64), (StoreKind::I32N8, LoadKind::I32S8)];
            for (store_kind, load_kind) in kinds {
                let in_bounds = u64::from(addr) + u64::from(offset) + load_kind.size() as u64 <= 128;
                let loaded = load(load_kind, &mem, Val::I32(addr as i32), offset);
                prop_assert_eq!(loaded.is_ok(), in_bounds);
                let stored = store(store_kind, &mut mem, Val::I32(addr as i32), offset, Val::default_for_ty(match store_kind {
                    StoreKind::F64 => crate::types::ValType::F64,
                    _ => crate::types::ValType::I32,
                }));
                prop_assert_eq!(stored.is_ok(), in_bounds);
            }
        }
    }
}
