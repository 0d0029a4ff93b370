// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Rewriting of the instance specific operands embedded in lowered code.
//!
//! Each [`Relocation`](crate::code::Relocation) of a [`CompiledFunction`]
//! names an instruction that embeds the memory, the globals buffer, a
//! dispatch table or a direct call target. A [`CodeSpecialization`] collects
//! `old -> new` replacements for these roles and applies them to one function
//! or a whole code table. Only operands equal to `old` are rewritten, so
//! applying a specialization twice is harmless.

use crate::code::{Code, CodeAddr, CompiledFunction, Inst, RelocationKind};
use crate::global::GlobalsAddr;
use crate::indices::TableIndex;
use crate::memory::Memory;
use crate::module::CompiledModule;
use crate::store::Store;
use cranelift_entity::EntityRef;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct CodeSpecialization {
    memory: Option<(Option<Memory>, Option<Memory>)>,
    globals: Option<(Option<GlobalsAddr>, Option<GlobalsAddr>)>,
    tables: Vec<(TableIndex, Option<crate::table::DispatchTableAddr>, Option<crate::table::DispatchTableAddr>)>,
    direct_calls: Option<Vec<CodeAddr>>,
}

impl CodeSpecialization {
    pub(crate) fn relocate_memory(&mut self, old: Option<Memory>, new: Option<Memory>) {
        self.memory = Some((old, new));
    }

    pub(crate) fn relocate_globals(&mut self, old: Option<GlobalsAddr>, new: Option<GlobalsAddr>) {
        self.globals = Some((old, new));
    }

    pub(crate) fn relocate_table(
        &mut self,
        index: TableIndex,
        old: Option<crate::table::DispatchTableAddr>,
        new: Option<crate::table::DispatchTableAddr>,
    ) {
        self.tables.push((index, old, new));
    }

    /// Points every direct call at the entry for its callee in `code_table`.
    pub(crate) fn relocate_direct_calls(&mut self, code_table: Vec<CodeAddr>) {
        self.direct_calls = Some(code_table);
    }

    /// Applies the replacements to one function. Returns whether anything
    /// changed.
    pub(crate) fn apply_to_function(&self, func: &mut CompiledFunction) -> bool {
        let mut changed = false;
        for reloc in &func.relocations {
            let inst = &mut func.insts[reloc.inst as usize];
            match (reloc.kind, inst) {
                (
                    RelocationKind::Memory,
                    Inst::Load { memory, .. }
                    | Inst::Store { memory, .. }
                    | Inst::MemorySize(memory)
                    | Inst::MemoryGrow(memory),
                ) => {
                    if let Some((old, new)) = self.memory
                        && *memory == old
                    {
                        changed |= *memory != new;
                        *memory = new;
                    }
                }
                (
                    RelocationKind::Globals,
                    Inst::GlobalGet { globals, .. } | Inst::GlobalSet { globals, .. },
                ) => {
                    if let Some((old, new)) = self.globals
                        && *globals == old
                    {
                        changed |= *globals != new;
                        *globals = new;
                    }
                }
                (RelocationKind::Table(index), Inst::CallIndirect { dispatch, .. }) => {
                    if let Some((_, old, new)) = self.tables.iter().find(|(i, _, _)| *i == index)
                        && *dispatch == *old
                    {
                        changed |= *dispatch != *new;
                        *dispatch = *new;
                    }
                }
                (RelocationKind::DirectCall, Inst::Call { func_index, target, .. }) => {
                    if let Some(code_table) = &self.direct_calls {
                        let new = code_table.get(func_index.index()).copied();
                        changed |= *target != new;
                        *target = new;
                    }
                }
                (kind, inst) => {
                    tracing::warn!("relocation {kind:?} does not apply to {inst:?}");
                }
            }
        }
        changed
    }

    /// Applies the replacements to every defined function of `module` and
    /// records the new state on it.
    pub(crate) fn apply_to_whole_module(&self, store: &mut Store, module: CompiledModule) {
        let shared = store[module.0].shared.clone();
        let mut patched = 0;
        for func_index in shared.translated().defined_functions() {
            let addr = store[module.0].code_table[func_index.index()];
            if let Some(Code::Function { func, .. }) = store.code_mut(addr)
                && self.apply_to_function(Arc::make_mut(func))
            {
                patched += 1;
            }
        }

        let state = &mut store[module.0].specialization;
        if let Some((_, new)) = self.memory {
            state.memory = new;
        }
        if let Some((_, new)) = self.globals {
            state.globals = new;
        }
        for (index, _, new) in &self.tables {
            if let Some(slot) = state.tables.get_mut(index.index()) {
                *slot = *new;
            }
        }
        tracing::trace!("specialized {patched} functions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Branch, Relocation};
    use crate::indices::{FuncIndex, SigId};
    use crate::ops::LoadKind;
    use crate::store::Stored;

    fn function() -> CompiledFunction {
        CompiledFunction {
            func_index: FuncIndex::new(0),
            insts: vec![
                Inst::Load {
                    kind: LoadKind::I32,
                    offset: 0,
                    memory: None,
                },
                Inst::CallIndirect {
                    sig: SigId::new(0),
                    params: 0,
                    table: TableIndex::new(0),
                    dispatch: None,
                },
                Inst::Call {
                    func_index: FuncIndex::new(1),
                    params: 0,
                    target: None,
                },
                Inst::Br(Branch::PLACEHOLDER),
            ],
            offsets: vec![0, 1, 2, 3],
            locals: Vec::new(),
            relocations: vec![
                Relocation {
                    inst: 0,
                    kind: RelocationKind::Memory,
                },
                Relocation {
                    inst: 1,
                    kind: RelocationKind::Table(TableIndex::new(0)),
                },
                Relocation {
                    inst: 2,
                    kind: RelocationKind::DirectCall,
                },
            ],
            max_height: 1,
            results: 0,
        }
    }

    #[test]
    fn only_matching_operands_move() {
        let memory = Memory(Stored::new(3));
        let other = Memory(Stored::new(4));
        let dispatch = Stored::new(7);

        let mut spec = CodeSpecialization::default();
        spec.relocate_memory(None, Some(memory));
        spec.relocate_table(TableIndex::new(0), None, Some(dispatch));
        spec.relocate_direct_calls(vec![Stored::new(10), Stored::new(11)]);

        let mut func = function();
        assert!(spec.apply_to_function(&mut func));
        assert!(matches!(func.insts[0], Inst::Load { memory: Some(m), .. } if m == memory));
        assert!(matches!(func.insts[1], Inst::CallIndirect { dispatch: Some(d), .. } if d == dispatch));
        assert!(matches!(func.insts[2], Inst::Call { target: Some(t), .. } if t == Stored::new(11)));

        // reapplying changes nothing
        assert!(!spec.apply_to_function(&mut func));

        // a specialization for another memory leaves this one alone
        let mut spec = CodeSpecialization::default();
        spec.relocate_memory(Some(other), None);
        assert!(!spec.apply_to_function(&mut func));
        assert!(matches!(func.insts[0], Inst::Load { memory: Some(m), .. } if m == memory));
    }
}
