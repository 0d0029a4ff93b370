// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::indices::FuncIndex;
use crate::instance::Instance;
use crate::trap::Trap;
use core::fmt;

/// Convenience macro for creating an `Error::Unsupported` variant.
#[macro_export]
macro_rules! wasm_unsupported {
    ($($arg:tt)*) => { $crate::Error::Unsupported(::std::format!($($arg)*)) }
}

/// Error type for the crate
#[derive(Debug)]
pub enum Error {
    /// The input WebAssembly code is invalid.
    InvalidWebAssembly {
        /// A string describing the validation error.
        message: String,
        /// The bytecode offset where the error occurred.
        offset: usize,
    },
    /// The WebAssembly code used an unsupported feature.
    Unsupported(String),
    /// Failed to compile a function.
    Compile {
        /// The function that failed to compile, if the failure is attributable to one.
        func_index: Option<FuncIndex>,
        /// A human-readable description of the error.
        message: String,
    },
    /// Binding imports or exports failed during instantiation.
    Link(String),
    /// An argument passed across the host boundary has the wrong shape.
    Type(String),
    /// A size or count exceeded an engine limit.
    Range(String),
    /// A WebAssembly trap occurred.
    Trap {
        /// The trap that occurred.
        trap: Trap,
        /// The function executing when the trap was raised.
        func_index: Option<FuncIndex>,
        /// Byte offset of the trapping instruction inside the function body.
        offset: Option<usize>,
    },
    /// A host function returned an error.
    Host(anyhow::Error),
    /// The name is already defined.
    AlreadyDefined {
        /// The defined module name.
        module: String,
        /// The defined field name.
        field: String,
    },
    /// The start function failed. The instance has already been linked into
    /// its module's instance chain and is handed back so it can be disposed.
    StartFunction {
        /// The partially initialized instance.
        instance: Instance,
        /// The error raised by the start function.
        source: Box<Error>,
    },
    /// An asynchronous compilation job was aborted.
    Aborted,
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Compile,
    Link,
    Runtime,
    Type,
    Range,
    Host,
    Aborted,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidWebAssembly { .. } | Self::Unsupported(_) | Self::Compile { .. } => {
                ErrorKind::Compile
            }
            Self::Link(_) => ErrorKind::Link,
            Self::Type(_) | Self::AlreadyDefined { .. } => ErrorKind::Type,
            Self::Range(_) => ErrorKind::Range,
            Self::Trap { .. } => ErrorKind::Runtime,
            Self::Host(_) => ErrorKind::Host,
            Self::StartFunction { source, .. } => source.kind(),
            Self::Aborted => ErrorKind::Aborted,
        }
    }

    /// Returns the trap that caused this error, if any.
    pub fn trap(&self) -> Option<Trap> {
        match self {
            Self::Trap { trap, .. } => Some(*trap),
            Self::StartFunction { source, .. } => source.trap(),
            _ => None,
        }
    }

    pub(crate) fn trap_in(trap: Trap, func_index: FuncIndex, offset: usize) -> Self {
        Self::Trap {
            trap,
            func_index: Some(func_index),
            offset: Some(offset),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWebAssembly { message, offset } => {
                f.write_fmt(format_args!("invalid WASM input at {offset}: {message}"))
            }
            Self::Unsupported(feature) => f.write_fmt(format_args!(
                "Feature used by the WebAssembly code is not supported: {feature}"
            )),
            Self::Compile { message, .. } => f.write_fmt(format_args!("CompileError: {message}")),
            Self::Link(message) => f.write_fmt(format_args!("LinkError: {message}")),
            Self::Type(message) => f.write_fmt(format_args!("TypeError: {message}")),
            Self::Range(message) => f.write_fmt(format_args!("RangeError: {message}")),
            Self::Trap {
                trap,
                func_index,
                offset,
            } => {
                f.write_fmt(format_args!("RuntimeError: {trap}"))?;
                if let (Some(func_index), Some(offset)) = (func_index, offset) {
                    f.write_fmt(format_args!(
                        " (function #{} @+{offset})",
                        func_index.as_u32()
                    ))?;
                }
                Ok(())
            }
            Self::Host(e) => f.write_fmt(format_args!("host function failed: {e}")),
            Self::AlreadyDefined { module, field } => {
                f.write_fmt(format_args!("Name {module}::{field} is already defined"))
            }
            Self::StartFunction { source, .. } => {
                f.write_fmt(format_args!("start function failed: {source}"))
            }
            Self::Aborted => f.write_str("compilation aborted"),
        }
    }
}

impl From<wasmparser::BinaryReaderError> for Error {
    fn from(e: wasmparser::BinaryReaderError) -> Self {
        Self::InvalidWebAssembly {
            message: e.message().into(),
            offset: e.offset(),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Host(e) => Some(e.as_ref()),
            Self::StartFunction { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
