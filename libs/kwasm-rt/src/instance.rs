// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod builder;

use crate::Extern;
use crate::func::Func;
use crate::global::GlobalsAddr;
use crate::indices::{EntityIndex, FuncIndex, TableIndex};
use crate::interpreter::{self, Interpreter, ThreadState};
use crate::linker::Linker;
use crate::memory::Memory;
use crate::module::{CompiledModule, Module};
use crate::specialize::CodeSpecialization;
use crate::store::{Store, Stored};
use crate::table::{DispatchTableAddr, Table};
use crate::values::Val;
use cranelift_entity::EntityRef;
use hashbrown::HashMap;

pub(crate) use builder::InstanceBuilder;

/// An instantiated WebAssembly module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instance(pub(crate) Stored<InstanceData>);

#[derive(Debug)]
pub struct InstanceData {
    pub(crate) module: Module,
    pub(crate) compiled_module: CompiledModule,
    pub(crate) memory: Option<Memory>,
    pub(crate) globals: Option<GlobalsAddr>,
    pub(crate) tables: Vec<TableInstance>,
    /// Function objects handed out for this instance's function index
    /// space, imports included.
    pub(crate) functions: HashMap<FuncIndex, Func>,
    /// Exports in declaration order.
    pub(crate) exports: Vec<(String, Extern)>,
    pub(crate) interpreter: Option<Box<Interpreter>>,
    /// Set once the host released the instance while code of it may still
    /// be reachable from other instances or tables.
    pub(crate) disposed: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TableInstance {
    pub(crate) dispatch: DispatchTableAddr,
    /// The host object backing this table, if it is imported or exported.
    pub(crate) host: Option<Table>,
}

// ===== impl Instance =====

impl Instance {
    /// Instantiates `module`, resolving its imports through `imports`.
    ///
    /// # Errors
    ///
    /// Returns a type error if the module has imports but `imports` is
    /// `None`, a link error for imports that are missing or do not match, a
    /// range error when memory or tables exceed engine limits and
    /// [`Error::StartFunction`](crate::Error::StartFunction) if the start
    /// function fails.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(store: &mut Store, module: Module, imports: Option<&Linker>) -> crate::Result<Self> {
        InstanceBuilder::new(store, module, imports, None).build()
    }

    /// Like [`Instance::new`], but uses `memory` as the instance's memory
    /// unless the module imports one.
    ///
    /// # Errors
    ///
    /// See [`Instance::new`].
    pub fn new_with_memory(
        store: &mut Store,
        module: Module,
        imports: Option<&Linker>,
        memory: Memory,
    ) -> crate::Result<Self> {
        InstanceBuilder::new(store, module, imports, Some(memory)).build()
    }

    pub fn module(&self, store: &Store) -> Module {
        store[self.0].module
    }

    /// Returns whether the instance is still alive.
    pub fn is_alive(&self, store: &Store) -> bool {
        live(store, *self).is_some()
    }

    /// Exports in declaration order, none once the instance is disposed.
    pub fn exports<'a>(&self, store: &'a Store) -> impl Iterator<Item = (&'a str, Extern)> + 'a {
        live(store, *self)
            .into_iter()
            .flat_map(|data| data.exports.iter())
            .map(|(name, export)| (name.as_str(), *export))
    }

    pub fn get_export(&self, store: &Store, name: &str) -> Option<Extern> {
        live(store, *self)?
            .exports
            .iter()
            .find(|(export, _)| export == name)
            .map(|(_, export)| *export)
    }

    pub fn get_func(&self, store: &Store, name: &str) -> Option<Func> {
        self.get_export(store, name)?.func()
    }

    pub fn get_table(&self, store: &Store, name: &str) -> Option<Table> {
        self.get_export(store, name)?.table()
    }

    pub fn get_memory(&self, store: &Store, name: &str) -> Option<Memory> {
        self.get_export(store, name)?.memory()
    }

    /// The value of an exported global at export time.
    pub fn get_global(&self, store: &Store, name: &str) -> Option<Val> {
        self.get_export(store, name)?.global()
    }

    /// The memory of this instance, whether imported, exported or neither.
    pub fn memory(&self, store: &Store) -> Option<Memory> {
        live(store, *self)?.memory
    }

    /// State of the instance's interpreter, `None` if none of its functions
    /// has been interpreted yet.
    pub fn interpreter_state(&self, store: &Store) -> Option<ThreadState> {
        interpreter::thread_state(store, *self)
    }

    /// Releases the instance.
    ///
    /// The compiled module is unlinked from its instance chain. If it was the
    /// one referenced by the module object, the module moves on to a sibling,
    /// or, without siblings, to a fresh unspecialized copy of the code so the
    /// next instantiation can reuse it.
    ///
    /// When the module exports functions or tables, or imports a table, its
    /// code may be reachable from other instances. The instance state then
    /// stays in the store and only stops being visible through this handle.
    /// Otherwise it is removed together with its compiled module.
    pub fn dispose(self, store: &mut Store) {
        let Some(data) = live(store, self) else {
            return;
        };
        tracing::debug!("disposing {self:?}");
        let module = data.module;
        let compiled = data.compiled_module;

        let escaped = code_escaped(store, compiled);
        if escaped {
            store[self.0].disposed = true;
        } else if let Some(data) = store.remove_instance(self.0) {
            for table in &data.tables {
                if let Some(host) = table.host {
                    host.unregister_dispatch_table(store, table.dispatch);
                }
            }
        }

        let Some(cm) = store.compiled_module(compiled.0) else {
            return;
        };
        let (prev, next) = (cm.prev, cm.next);
        if let Some(prev) = prev {
            store[prev.0].next = next;
        }
        if let Some(next) = next {
            store[next.0].prev = prev;
        }
        let cm = &mut store[compiled.0];
        cm.prev = None;
        cm.next = None;

        let is_template = store.module(module.0).is_some_and(|m| m.template == compiled);
        if is_template {
            let template = match next.or(prev) {
                Some(sibling) => sibling,
                None => unspecialized_copy(store, module, compiled),
            };
            store[module.0].template = template;
        }
        if !escaped {
            store.remove_compiled_module(compiled.0);
        }
    }
}

/// Instance data of an instance the host has not disposed.
fn live(store: &Store, instance: Instance) -> Option<&InstanceData> {
    store.instance(instance.0).filter(|data| !data.disposed)
}

/// Whether code of `compiled` may be referenced from outside its instance.
fn code_escaped(store: &Store, compiled: CompiledModule) -> bool {
    let translated = store[compiled.0].shared.translated();
    let exports_code = translated
        .exports
        .iter()
        .any(|export| matches!(export.index, EntityIndex::Function(_) | EntityIndex::Table(_)));
    let imports_table = translated
        .imports
        .iter()
        .any(|import| matches!(import.index, EntityIndex::Table(_)));
    exports_code || imports_table
}

/// Copies the code of `compiled`, whose only instance went away, and turns
/// the copy back into the state a freshly compiled module is in. The code
/// entries of `compiled` are left untouched for whoever still calls them.
fn unspecialized_copy(store: &mut Store, module: Module, compiled: CompiledModule) -> CompiledModule {
    tracing::trace!("replacing {compiled:?} by unspecialized code");
    let copy = builder::clone_compiled_module(store, module, compiled);
    let state = store[copy.0].specialization.clone();

    let mut specialization = CodeSpecialization::default();
    specialization.relocate_memory(state.memory, None);
    specialization.relocate_globals(state.globals, None);
    for (index, table) in state.tables.iter().enumerate() {
        specialization.relocate_table(TableIndex::new(index), *table, None);
    }
    specialization.relocate_direct_calls(store[copy.0].code_table.clone());
    specialization.apply_to_whole_module(store, copy);
    copy
}
