// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Code objects.
//!
//! Every code table slot points at a [`Code`] object owned by the [`Store`].
//! Defined functions are lowered into [`CompiledFunction`]s: a flat,
//! relocatable instruction sequence whose branch targets are resolved at
//! compile time and whose instance-specific operands (memory, globals buffer,
//! dispatch tables, direct call targets) start out as placeholders and are
//! patched by [`CodeSpecialization`](crate::specialize::CodeSpecialization).
//!
//! [`Store`]: crate::store::Store

use crate::func::Func;
use crate::global::GlobalsAddr;
use crate::indices::{FuncIndex, SigId, TableIndex};
use crate::instance::Instance;
use crate::memory::Memory;
use crate::module::CompiledModule;
use crate::ops::{BinOp, LoadKind, StoreKind, UnOp};
use crate::store::Stored;
use crate::table::DispatchTableAddr;
use crate::types::ValType;
use crate::values::Val;
use std::sync::Arc;

pub type CodeAddr = Stored<Code>;

#[derive(Debug)]
pub enum Code {
    /// Lowered code of a defined function, owned by the code table of
    /// `module`.
    Function {
        func: Arc<CompiledFunction>,
        module: Option<CompiledModule>,
    },
    /// Placeholder that compiles its function on first call. The shared stub
    /// carries no metadata; stubs reachable from exports or tables do.
    LazyStub(Option<LazyStubMetadata>),
    /// Marshals calls into an imported host function.
    ImportWrapper(Func),
    /// Redirects calls into the interpreter of `instance`.
    Interpreted {
        instance: Instance,
        func_index: FuncIndex,
    },
    /// Import slot of a code table that has not been linked yet.
    Illegal,
}

/// Everything a lazy stub needs to find out what it has to compile and which
/// slots to patch once it has.
#[derive(Debug, Clone)]
pub struct LazyStubMetadata {
    pub module: CompiledModule,
    pub func_index: FuncIndex,
    /// Dispatch table slots that currently hold this stub.
    pub table_refs: Vec<(DispatchTableAddr, u32)>,
}

impl Code {
    pub(crate) fn is_lazy_stub(&self) -> bool {
        matches!(self, Self::LazyStub(_))
    }

    pub(crate) fn as_function(&self) -> Option<&Arc<CompiledFunction>> {
        match self {
            Self::Function { func, .. } => Some(func),
            _ => None,
        }
    }

    /// Function index and owning compiled module, if this code object belongs
    /// to a code table.
    pub(crate) fn owner(&self) -> Option<(CompiledModule, FuncIndex)> {
        match self {
            Self::Function {
                func,
                module: Some(module),
            } => Some((*module, func.func_index)),
            Self::LazyStub(Some(meta)) => Some((meta.module, meta.func_index)),
            _ => None,
        }
    }
}

/// Host-callable trampoline for one exported function.
#[derive(Debug, Clone)]
pub struct ExportWrapper {
    pub func_index: FuncIndex,
    pub sig: SigId,
    /// Signatures containing `i64` cannot cross the host boundary.
    pub has_i64: bool,
    pub target: CodeAddr,
}

/// A branch destination inside a [`CompiledFunction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    /// Instruction to continue at.
    pub ip: u32,
    /// Operand stack height of the target label.
    pub height: u32,
    /// Number of values carried over to the target.
    pub arity: u8,
}

impl Branch {
    pub(crate) const PLACEHOLDER: Self = Self {
        ip: u32::MAX,
        height: 0,
        arity: 0,
    };
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Unreachable,
    Br(Branch),
    BrIf(Branch),
    BrIfEqz(Branch),
    /// The last target is the default.
    BrTable(Box<[Branch]>),
    Return,
    Call {
        func_index: FuncIndex,
        params: u32,
        target: Option<CodeAddr>,
    },
    CallIndirect {
        sig: SigId,
        params: u32,
        table: TableIndex,
        dispatch: Option<DispatchTableAddr>,
    },
    Drop,
    Select,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet {
        globals: Option<GlobalsAddr>,
        offset: u32,
        ty: ValType,
    },
    GlobalSet {
        globals: Option<GlobalsAddr>,
        offset: u32,
    },
    Load {
        kind: LoadKind,
        offset: u32,
        memory: Option<Memory>,
    },
    Store {
        kind: StoreKind,
        offset: u32,
        memory: Option<Memory>,
    },
    MemorySize(Option<Memory>),
    MemoryGrow(Option<Memory>),
    Const(Val),
    Unary(UnOp),
    Binary(BinOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    Memory,
    Globals,
    Table(TableIndex),
    DirectCall,
}

/// Records an instruction with an instance-specific operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub inst: u32,
    pub kind: RelocationKind,
}

/// The lowered form of one function body.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub func_index: FuncIndex,
    pub insts: Vec<Inst>,
    /// Body relative byte offset of the operator each instruction was
    /// lowered from, parallel to `insts`.
    pub offsets: Vec<u32>,
    /// Types of the declared locals, parameters excluded.
    pub locals: Vec<ValType>,
    pub relocations: Vec<Relocation>,
    pub max_height: u32,
    /// Number of values returned, zero or one.
    pub results: u8,
}

impl CompiledFunction {
    /// Approximate number of bytes held by this function.
    pub(crate) fn memory_cost(&self) -> usize {
        self.insts.len() * (size_of::<Inst>() + size_of::<u32>())
            + self.relocations.len() * size_of::<Relocation>()
    }

    /// Direct call sites as `(instruction, callee)` pairs.
    pub(crate) fn direct_calls(&self) -> impl Iterator<Item = (usize, FuncIndex)> + '_ {
        self.relocations.iter().filter_map(|reloc| {
            if reloc.kind != RelocationKind::DirectCall {
                return None;
            }
            match self.insts[reloc.inst as usize] {
                Inst::Call { func_index, .. } => Some((reloc.inst as usize, func_index)),
                _ => None,
            }
        })
    }
}
