// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compilation of functions on their first call.
//!
//! Every defined slot of a lazily compiled code table starts out as the
//! store's shared lazy stub. Slots that become reachable from outside the
//! module (exports, dispatch tables, other instances) get a stub of their own
//! carrying [`LazyStubMetadata`], so calling it reveals which function to
//! compile. Calls through the shared stub can only come from direct call
//! sites, whose callee is read off the calling instruction.

use crate::code::{Code, CodeAddr, Inst, LazyStubMetadata};
use crate::compile::lower_function;
use crate::errors::Error;
use crate::indices::FuncIndex;
use crate::module::CompiledModule;
use crate::specialize::CodeSpecialization;
use crate::store::Store;
use cranelift_entity::EntityRef;
use std::sync::Arc;

/// Where a call into a lazy stub came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LazyCaller {
    /// A direct call instruction of lowered code.
    Wasm { caller: CodeAddr, call_site: u32 },
    /// The host, an indirect call or the interpreter.
    External,
}

/// Compiles the function behind `stub`, patches the slots that referenced the
/// stub and returns the code to invoke instead.
///
/// # Panics
///
/// Panics if a function that passed validation fails to lower, or if the
/// shared stub is reached from anywhere but a direct call site.
pub(crate) fn compile_lazy(
    store: &mut Store,
    stub: CodeAddr,
    caller: LazyCaller,
) -> crate::Result<CodeAddr> {
    let (module, func_index, table_refs) = resolve_target(store, stub, caller);

    let Some(data) = store.compiled_module(module.0) else {
        return Err(Error::Type(
            "function of a disposed instance cannot be compiled".to_string(),
        ));
    };
    let current = data.code_table[func_index.index()];

    let code = if store[current].is_lazy_stub() {
        compile_into_table(store, module, func_index)
    } else {
        current
    };

    // the stub's own references
    module.set_wrapper_target(store, func_index, code);
    for (table, slot) in table_refs {
        if store.dispatch_table(table).and_then(|t| t.code_at(slot)) == Some(stub) {
            tracing::trace!("patching dispatch slot {slot} for function #{}", func_index.as_u32());
            store[table].replace_code_at(slot, code);
        }
    }

    if let LazyCaller::Wasm { caller, .. } = caller {
        patch_call_sites(store, caller, module);
    }

    Ok(code)
}

fn resolve_target(
    store: &Store,
    stub: CodeAddr,
    caller: LazyCaller,
) -> (CompiledModule, FuncIndex, Vec<(crate::table::DispatchTableAddr, u32)>) {
    if let Code::LazyStub(Some(meta)) = &store[stub] {
        return (meta.module, meta.func_index, meta.table_refs.clone());
    }

    let LazyCaller::Wasm { caller, call_site } = caller else {
        panic!("lazy stub {stub:?} without metadata called from outside of wasm");
    };
    let (module, _) = store[caller]
        .owner()
        .unwrap_or_else(|| panic!("lazy call from unowned code {caller:?}"));
    let func = store[caller]
        .as_function()
        .unwrap_or_else(|| panic!("lazy call from non-function code {caller:?}"));
    match func.insts.get(call_site as usize) {
        Some(Inst::Call { func_index, .. }) => (module, *func_index, Vec::new()),
        inst => panic!("lazy call site {call_site} is not a direct call: {inst:?}"),
    }
}

fn compile_into_table(store: &mut Store, module: CompiledModule, func_index: FuncIndex) -> CodeAddr {
    let data = &store[module.0];
    let shared = data.shared.clone();
    let state = data.specialization.clone();
    let code_table = data.code_table.clone();

    let mut func = lower_function(shared.translated(), shared.wire_bytes(), func_index, None)
        .unwrap_or_else(|err| {
            panic!(
                "lazy compilation of validated function #{}:{} failed: {err}",
                func_index.as_u32(),
                shared.translated().func_display_name(func_index)
            )
        });

    let mut spec = CodeSpecialization::default();
    spec.relocate_memory(None, state.memory);
    spec.relocate_globals(None, state.globals);
    for (i, table) in state.tables.iter().enumerate() {
        spec.relocate_table(crate::indices::TableIndex::new(i), None, *table);
    }
    spec.relocate_direct_calls(code_table);
    spec.apply_to_function(&mut func);

    let addr = store.add_code(Code::Function {
        func: Arc::new(func),
        module: Some(module),
    });
    store[module.0].code_table[func_index.index()] = addr;
    tracing::trace!(
        "lazily compiled function #{}:{}",
        func_index.as_u32(),
        shared.translated().func_display_name(func_index)
    );
    addr
}

/// Points every direct call site of `caller` whose callee has been compiled
/// by now at the compiled code.
fn patch_call_sites(store: &mut Store, caller: CodeAddr, module: CompiledModule) {
    let Some((owner, _)) = store[caller].owner() else {
        return;
    };
    if owner != module {
        return;
    }
    let Some(func) = store[caller].as_function() else {
        return;
    };

    let code_table = &store[module.0].code_table;
    let patches: Vec<(usize, CodeAddr)> = func
        .direct_calls()
        .filter_map(|(inst, callee)| {
            let Inst::Call { target, .. } = &func.insts[inst] else {
                return None;
            };
            let entry = code_table[callee.index()];
            let stale = target.is_none_or(|target| store[target].is_lazy_stub());
            (stale && !store[entry].is_lazy_stub() && *target != Some(entry)).then_some((inst, entry))
        })
        .collect();
    if patches.is_empty() {
        return;
    }

    tracing::trace!("patching {} call sites", patches.len());
    if let Some(Code::Function { func, .. }) = store.code_mut(caller) {
        let func = Arc::make_mut(func);
        for (inst, entry) in patches {
            if let Inst::Call { target, .. } = &mut func.insts[inst] {
                *target = Some(entry);
            }
        }
    }
}

/// Returns the code to expose for `func_index` outside of its module,
/// replacing the shared lazy stub with one that knows its function.
pub(crate) fn ensure_exported_stub(
    store: &mut Store,
    module: CompiledModule,
    func_index: FuncIndex,
) -> CodeAddr {
    let current = store[module.0].code_table[func_index.index()];
    if current != store.lazy_stub() {
        return current;
    }

    let stub = store.add_code(Code::LazyStub(Some(LazyStubMetadata {
        module,
        func_index,
        table_refs: Vec::new(),
    })));
    store[module.0].code_table[func_index.index()] = stub;
    module.set_wrapper_target(store, func_index, stub);
    stub
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CompilationMode, Config, Engine};
    use crate::instance::Instance;
    use crate::module::Module;
    use crate::values::Val;

    fn lazy_store() -> Store {
        let mut config = Config::new();
        config.compilation_mode(CompilationMode::Lazy);
        Store::new(&Engine::new(config))
    }

    fn instantiate(store: &mut Store, wat: &str) -> Instance {
        let bytes = wat::parse_str(wat).unwrap();
        let module = Module::new(store, &bytes).unwrap();
        Instance::new(store, module, None).unwrap()
    }

    fn slot(store: &Store, instance: Instance, index: u32) -> CodeAddr {
        let module = store[instance.0].compiled_module;
        store[module.0].code_table[index as usize]
    }

    #[test_log::test]
    fn compiles_on_first_call() {
        let mut store = lazy_store();
        let instance = instantiate(
            &mut store,
            r#"
                (module
                    (func $double (param i32) (result i32)
                        local.get 0
                        i32.const 2
                        i32.mul)
                    (func (export "quad") (param i32) (result i32)
                        local.get 0
                        call $double
                        call $double))
            "#,
        );

        assert_eq!(slot(&store, instance, 0), store.lazy_stub());
        let exported = slot(&store, instance, 1);
        assert!(matches!(&store[exported], Code::LazyStub(Some(meta)) if meta.func_index.as_u32() == 1));

        let quad = instance.get_func(&store, "quad").unwrap();
        assert_eq!(quad.call(&mut store, &[Val::I32(3)]).unwrap(), Some(Val::I32(12)));

        let double = slot(&store, instance, 0);
        let quad = slot(&store, instance, 1);
        assert!(!store[double].is_lazy_stub());
        assert!(!store[quad].is_lazy_stub());

        let func = store[quad].as_function().unwrap();
        let targets: Vec<_> = func
            .direct_calls()
            .map(|(inst, _)| match &func.insts[inst] {
                Inst::Call { target, .. } => *target,
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec![Some(double), Some(double)]);
    }

    #[test_log::test]
    fn patches_dispatch_tables() {
        let mut store = lazy_store();
        let instance = instantiate(
            &mut store,
            r#"
                (module
                    (type $thunk (func (result i32)))
                    (table 1 funcref)
                    (func $five (result i32)
                        i32.const 5)
                    (elem (i32.const 0) $five)
                    (func (export "run") (result i32)
                        i32.const 0
                        call_indirect (type $thunk)))
            "#,
        );

        let dispatch = store[instance.0].tables[0].dispatch;
        let stub = store[dispatch].code_at(0).unwrap();
        assert!(matches!(&store[stub], Code::LazyStub(Some(meta)) if meta.table_refs == vec![(dispatch, 0)]));

        let run = instance.get_func(&store, "run").unwrap();
        assert_eq!(run.call(&mut store, &[]).unwrap(), Some(Val::I32(5)));

        let compiled = slot(&store, instance, 0);
        assert!(!store[compiled].is_lazy_stub());
        assert_eq!(store[dispatch].code_at(0), Some(compiled));
    }
}
