// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A WebAssembly MVP runtime with two execution tiers.
//!
//! Modules are compiled into lowered code, either eagerly (in parallel on a
//! background worker pool or sequentially) or lazily on first call, and can
//! be redirected to an interpreter that supports breakpoints and stepping.
//! Every runtime object lives in a [`Store`] and is referred to by small
//! copyable handles.

#[macro_use]
mod errors;

mod async_job;
mod code;
mod compile;
mod const_expr;
mod debug;
mod engine;
mod func;
mod global;
mod indices;
mod instance;
mod interpreter;
mod lazy;
mod linker;
mod loom;
mod machine;
mod memory;
mod module;
mod ops;
mod platform;
mod specialize;
mod store;
mod table;
mod thrower;
mod translate;
mod trap;
mod types;
mod utils;
mod values;

use crate::utils::enum_accessors;

pub use async_job::{JobId, Promise};
pub use const_expr::{ConstExpr, ConstExprEvaluator};
pub use debug::{DebugDelegate, Location, PauseInfo, PauseReason, StepAction};
pub use engine::{CompilationMode, Config, Engine};
pub use errors::{Error, ErrorKind};
pub use func::Func;
pub use indices::{EntityIndex, FuncIndex, GlobalIndex, MemoryIndex, SigId, TableIndex, TypeIndex};
pub use instance::Instance;
pub use interpreter::ThreadState;
pub use linker::Linker;
pub use memory::{Memory, MemoryAccessError};
pub use module::Module;
pub use ops::{WASM_PAGE_SIZE, WASM32_MAX_PAGES};
pub use store::{Store, Stored};
pub use table::Table;
pub use translate::Import;
pub use trap::Trap;
pub use types::{FuncType, GlobalType, MemoryType, SignatureRegistry, TableType, ValType};
pub use values::{Val, to_int32};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A value that can be imported into or exported from an instance.
///
/// Globals are exported by value: an exported global is a snapshot of its
/// value at instantiation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Extern {
    Func(Func),
    Table(Table),
    Memory(Memory),
    Global(Val),
}

impl Extern {
    enum_accessors! {
        e
        (Func(Func) is_func func unwrap_func *e)
        (Table(Table) is_table table unwrap_table *e)
        (Memory(Memory) is_memory memory unwrap_memory *e)
        (Global(Val) is_global global unwrap_global *e)
    }
}

impl From<Func> for Extern {
    fn from(f: Func) -> Self {
        Extern::Func(f)
    }
}

impl From<Table> for Extern {
    fn from(t: Table) -> Self {
        Extern::Table(t)
    }
}

impl From<Memory> for Extern {
    fn from(m: Memory) -> Self {
        Extern::Memory(m)
    }
}

impl From<Val> for Extern {
    fn from(v: Val) -> Self {
        Extern::Global(v)
    }
}
