// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// A runtime fault raised while executing WebAssembly code.
///
/// Traps never corrupt the instance that raised them, they abort the current
/// call and surface to the host as [`Error::Trap`](crate::Error::Trap).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Trap {
    /// Code that was supposed to have been unreachable was reached.
    UnreachableCodeReached,
    /// An out-of-bounds memory access.
    MemoryOutOfBounds,
    /// An integer division or remainder by zero.
    IntegerDivisionByZero,
    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow,
    /// Failed float-to-int conversion.
    BadConversionToInteger,
    /// An indirect call through a table slot that is out of bounds or empty.
    InvalidFunction,
    /// An indirect call whose declared signature differs from the callee's.
    SignatureMismatch,
    /// The call stack was exhausted.
    StackOverflow,
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::UnreachableCodeReached => f.write_str("unreachable code executed"),
            Trap::MemoryOutOfBounds => f.write_str("out of bounds memory access"),
            Trap::IntegerDivisionByZero => f.write_str("integer divide by zero"),
            Trap::IntegerOverflow => f.write_str("integer overflow"),
            Trap::BadConversionToInteger => f.write_str("invalid conversion to integer"),
            Trap::InvalidFunction => f.write_str("invalid function"),
            Trap::SignatureMismatch => f.write_str("signature mismatch"),
            Trap::StackOverflow => f.write_str("call stack exhausted"),
        }
    }
}

impl core::error::Error for Trap {}
