// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    reason = "numeric coercions follow the host number conversion rules"
)]

use crate::types::ValType;
use crate::utils::enum_accessors;

/// Possible runtime values that a WebAssembly module can either consume or
/// produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    /// A 32-bit integer.
    I32(i32),

    /// A 64-bit integer.
    I64(i64),

    /// A 32-bit float.
    ///
    /// Note that the raw bits of the float are stored here, and you can use
    /// `f32::from_bits` to create an `f32` value.
    F32(u32),

    /// A 64-bit float.
    ///
    /// Note that the raw bits of the float are stored here, and you can use
    /// `f64::from_bits` to create an `f64` value.
    F64(u64),
}

// ===== impl Val =====

impl Val {
    /// Returns the default value for the given type.
    pub const fn default_for_ty(ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
        }
    }

    /// Returns the corresponding [`ValType`] for this `Val`.
    pub const fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
        }
    }

    pub fn from_f32(v: f32) -> Val {
        Val::F32(v.to_bits())
    }

    pub fn from_f64(v: f64) -> Val {
        Val::F64(v.to_bits())
    }

    enum_accessors! {
        e
        (I32(i32) is_i32 i32 unwrap_i32 *e)
        (I64(i64) is_i64 i64 unwrap_i64 *e)
        (F32(f32) is_f32 f32 unwrap_f32 f32::from_bits(*e))
        (F64(f64) is_f64 f64 unwrap_f64 f64::from_bits(*e))
    }

    /// Host `ToNumber` of this value.
    ///
    /// Returns `None` for `i64`, which has no faithful host number
    /// representation.
    pub fn to_number(&self) -> Option<f64> {
        match *self {
            Val::I32(v) => Some(f64::from(v)),
            Val::I64(_) => None,
            Val::F32(bits) => Some(f64::from(f32::from_bits(bits))),
            Val::F64(bits) => Some(f64::from_bits(bits)),
        }
    }

    /// Converts a host number to a value of type `ty`, applying `ToInt32` for
    /// integers and rounding for `f32`.
    ///
    /// Returns `None` when `ty` is `i64`.
    pub fn from_number(n: f64, ty: ValType) -> Option<Val> {
        match ty {
            ValType::I32 => Some(Val::I32(to_int32(n))),
            ValType::I64 => None,
            ValType::F32 => Some(Val::from_f32(n as f32)),
            ValType::F64 => Some(Val::from_f64(n)),
        }
    }

    /// Coerces this value to `ty` through the host number conversion rules.
    pub fn coerce(self, ty: ValType) -> Option<Val> {
        if self.ty() == ty {
            return Some(self);
        }
        Val::from_number(self.to_number()?, ty)
    }

    pub(crate) fn to_le_bytes(self) -> ([u8; 8], usize) {
        let mut buf = [0; 8];
        match self {
            Val::I32(v) => {
                buf[..4].copy_from_slice(&v.to_le_bytes());
                (buf, 4)
            }
            Val::F32(v) => {
                buf[..4].copy_from_slice(&v.to_le_bytes());
                (buf, 4)
            }
            Val::I64(v) => (v.to_le_bytes(), 8),
            Val::F64(v) => (v.to_le_bytes(), 8),
        }
    }

    pub(crate) fn from_le_bytes(ty: ValType, bytes: &[u8]) -> Option<Val> {
        Some(match ty {
            ValType::I32 => Val::I32(i32::from_le_bytes(bytes.get(..4)?.try_into().ok()?)),
            ValType::F32 => Val::F32(u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?)),
            ValType::I64 => Val::I64(i64::from_le_bytes(bytes.get(..8)?.try_into().ok()?)),
            ValType::F64 => Val::F64(u64::from_le_bytes(bytes.get(..8)?.try_into().ok()?)),
        })
    }
}

impl From<i32> for Val {
    fn from(v: i32) -> Self {
        Val::I32(v)
    }
}

impl From<i64> for Val {
    fn from(v: i64) -> Self {
        Val::I64(v)
    }
}

impl From<f32> for Val {
    fn from(v: f32) -> Self {
        Val::from_f32(v)
    }
}

impl From<f64> for Val {
    fn from(v: f64) -> Self {
        Val::from_f64(v)
    }
}

/// The host `ToInt32` conversion: truncate towards zero, then wrap modulo 2^32.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let n = n.trunc();
    let m = n.rem_euclid(4_294_967_296.0);
    (m as u32) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_conversion() {
        assert_eq!(to_int32(3.7), 3);
        assert_eq!(to_int32(-3.7), -3);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(f64::INFINITY), 0);
        assert_eq!(to_int32(4_294_967_297.0), 1);
        assert_eq!(to_int32(2_147_483_648.0), i32::MIN);
    }

    #[test]
    fn coercion() {
        assert_eq!(Val::F64(7.9f64.to_bits()).coerce(ValType::I32), Some(Val::I32(7)));
        assert_eq!(Val::I32(2).coerce(ValType::F64), Some(Val::from_f64(2.0)));
        assert_eq!(Val::I64(1).coerce(ValType::I32), None);
        assert_eq!(Val::I32(1).coerce(ValType::I64), None);
        assert_eq!(Val::I64(5).coerce(ValType::I64), Some(Val::I64(5)));
    }

    #[test]
    fn le_bytes() {
        let (buf, len) = Val::I32(0x0403_0201).to_le_bytes();
        assert_eq!(&buf[..len], &[1, 2, 3, 4]);
        assert_eq!(
            Val::from_le_bytes(ValType::I32, &buf[..len]),
            Some(Val::I32(0x0403_0201))
        );
        assert_eq!(Val::from_le_bytes(ValType::I64, &buf[..4]), None);
    }
}
