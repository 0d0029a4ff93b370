// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The instantiation pipeline.
//!
//! [`InstanceBuilder::build`] runs a fixed sequence of stages. Stages up to
//! and including the segment bounds checks only record errors on the
//! thrower; nothing observable outside the new instance is modified before
//! they all passed, except that table and memory imports are shared. Later
//! stages write segments into possibly shared tables and memories, patch
//! code and finally run the start function.

use super::{Instance, InstanceData, TableInstance};
use crate::Extern;
use crate::code::{Code, CodeAddr, LazyStubMetadata};
use crate::const_expr::{ConstExpr, ConstExprEvaluator};
use crate::errors::Error;
use crate::func::Func;
use crate::global::{GlobalsAddr, GlobalsBuffer};
use crate::indices::{EntityIndex, FuncIndex, GlobalIndex, SigId, TableIndex};
use crate::interpreter;
use crate::lazy::{LazyCaller, ensure_exported_stub};
use crate::linker::Linker;
use crate::machine;
use crate::memory::Memory;
use crate::module::{CompiledModule, CompiledModuleData, Module, SharedModule};
use crate::ops::WASM_PAGE_SIZE;
use crate::specialize::CodeSpecialization;
use crate::store::Store;
use crate::table::{DispatchTable, DispatchTableAddr, Table, write_dispatch_entry};
use crate::thrower::ErrorThrower;
use crate::translate::Import;
use crate::types::ValType;
use crate::values::Val;
use core::fmt;
use cranelift_entity::EntityRef;
use hashbrown::HashMap;
use std::sync::Arc;

pub(crate) struct InstanceBuilder<'a> {
    store: &'a mut Store,
    module: Module,
    shared: SharedModule,
    imports: Option<&'a Linker>,
    /// Memory handed in by the caller, replaced by an imported one.
    memory: Option<Memory>,
    thrower: ErrorThrower,
    const_eval: ConstExprEvaluator,
}

/// What the stages produce, in the order they produce it.
struct Building {
    instance: Instance,
    compiled: CompiledModule,
    /// Whether `compiled` is a fresh clone rather than the template.
    cloned: bool,
    globals: Option<GlobalsAddr>,
    /// Memory allocated for the instance, not imported or handed in.
    memory: Option<Memory>,
    dispatch_tables: Vec<DispatchTableAddr>,
    import_wrappers: Vec<CodeAddr>,
}

impl<'a> InstanceBuilder<'a> {
    pub(crate) fn new(
        store: &'a mut Store,
        module: Module,
        imports: Option<&'a Linker>,
        memory: Option<Memory>,
    ) -> Self {
        let shared = module.shared(store).clone();
        Self {
            store,
            module,
            shared,
            imports,
            memory,
            thrower: ErrorThrower::new("WebAssembly.Instance()"),
            const_eval: ConstExprEvaluator::default(),
        }
    }

    pub(crate) fn build(mut self) -> crate::Result<Instance> {
        tracing::trace!("checking imports object");
        if self.imports.is_none() && !self.shared.translated().imports.is_empty() {
            self.thrower.type_error(format_args!(
                "Imports argument must be present and must be an object"
            ));
        }
        self.check()?;

        let mut building = self.reuse_or_clone();
        if let Err(err) = self.link(&mut building) {
            self.abort(&building);
            return Err(err);
        }

        self.load_segments(&building);
        self.build_exports(&building);
        if let Some(err) = self.thrower.take() {
            self.abort(&building);
            return Err(err);
        }
        self.load_table_segments(&building);
        self.specialize(&building);
        self.link_into_chain(&building);

        let shared = &self.shared;
        if self.store.engine().config().interpret_all || shared.has_breakpoints() {
            tracing::trace!("redirecting to the interpreter");
            interpreter::redirect_to_interpreter(self.store, building.instance)?;
        }

        self.run_start_function(&building)?;
        Ok(building.instance)
    }

    /// Every stage that can fail without touching anything shared.
    fn link(&mut self, building: &mut Building) -> crate::Result<()> {
        tracing::trace!("allocating globals");
        let size = self.shared.translated().globals_size;
        if size > 0 {
            let globals = self.store.add_globals(GlobalsBuffer::new(size));
            building.globals = Some(globals);
            self.store[building.instance.0].globals = Some(globals);
        }

        tracing::trace!("processing imports");
        self.process_imports(building);
        self.check()?;

        tracing::trace!("initializing globals");
        self.init_globals(building)?;

        tracing::trace!("allocating dispatch tables");
        self.allocate_tables(building);
        self.check()?;

        tracing::trace!("allocating memory");
        self.allocate_memory(building);
        self.check()?;

        tracing::trace!("checking segment bounds");
        self.check_segment_bounds(building)?;
        self.check()
    }

    fn check(&mut self) -> crate::Result<()> {
        match self.thrower.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Undoes the bookkeeping of a failed instantiation and releases what
    /// it allocated.
    fn abort(&mut self, building: &Building) {
        tracing::debug!("instantiation failed, releasing {:?}", building.instance);
        let Some(data) = self.store.remove_instance(building.instance.0) else {
            return;
        };
        for table in data.tables {
            if let Some(host) = table.host {
                host.unregister_dispatch_table(self.store, table.dispatch);
            }
        }
        for func in data.functions.values() {
            if func.wasm_target(self.store).is_some_and(|(owner, _)| owner == building.instance) {
                self.store.remove_func(func.0);
            }
        }

        if building.cloned {
            self.store.remove_compiled_module(building.compiled.0);
        } else {
            let illegal = self.store.illegal_code();
            let translated = self.shared.translated();
            for index in 0..translated.num_functions() {
                if translated.is_imported_function(FuncIndex::new(index)) {
                    self.store[building.compiled.0].code_table[index] = illegal;
                }
            }
        }
        for code in &building.import_wrappers {
            self.store.remove_code(*code);
        }
        for dispatch in &building.dispatch_tables {
            self.store.remove_dispatch_table(*dispatch);
        }
        if let Some(memory) = building.memory {
            self.store.remove_memory(memory.0);
        }
        if let Some(globals) = building.globals {
            self.store.remove_globals(globals);
        }
    }

    // ===== stages =====

    /// Picks the code table to specialize: the template if no instance owns
    /// it yet, a copy of it otherwise.
    fn reuse_or_clone(&mut self) -> Building {
        let template = self.module.template(self.store);
        let (compiled, cloned) = if self.store[template.0].owning_instance.is_some() {
            tracing::trace!("cloning {template:?}");
            (clone_compiled_module(self.store, self.module, template), true)
        } else {
            tracing::trace!("reusing {template:?}");
            (template, false)
        };

        let num_tables = self.shared.translated().tables.len();
        let instance = Instance(self.store.add_instance(InstanceData {
            module: self.module,
            compiled_module: compiled,
            memory: None,
            globals: None,
            tables: Vec::with_capacity(num_tables),
            functions: HashMap::new(),
            exports: Vec::new(),
            interpreter: None,
            disposed: false,
        }));

        Building {
            instance,
            compiled,
            cloned,
            globals: None,
            memory: None,
            dispatch_tables: Vec::new(),
            import_wrappers: Vec::new(),
        }
    }

    fn process_imports(&mut self, building: &mut Building) {
        let Some(linker) = self.imports else {
            return;
        };
        let shared = self.shared.clone();
        let translated = shared.translated();

        for (i, import) in translated.imports.iter().enumerate() {
            let error = |thrower: &mut ErrorThrower, message: fmt::Arguments<'_>| {
                import_error(thrower, i, import, message);
            };
            let Some(value) = linker.get(&import.module, &import.field) else {
                error(&mut self.thrower, format_args!("import not found"));
                continue;
            };

            match import.index {
                EntityIndex::Function(func_index) => {
                    let Extern::Func(func) = value else {
                        error(&mut self.thrower, format_args!("function import requires a callable"));
                        continue;
                    };
                    let expected = &translated.functions[func_index];
                    let code = if func.wasm_target(self.store).is_some() {
                        if func.sig(self.store) != expected.sig_id {
                            error(
                                &mut self.thrower,
                                format_args!("imported function does not match the expected type"),
                            );
                            continue;
                        }
                        match func.table_entry(self.store) {
                            Some((code, _)) => code,
                            None => {
                                error(&mut self.thrower, format_args!("imported function has been disposed"));
                                continue;
                            }
                        }
                    } else {
                        let ty = translated.func_type(func_index);
                        if ty.has_i64() {
                            error(
                                &mut self.thrower,
                                format_args!("imported function signature contains illegal type"),
                            );
                            continue;
                        }
                        if func.ty(self.store) != ty {
                            error(
                                &mut self.thrower,
                                format_args!("imported function does not match the expected type"),
                            );
                            continue;
                        }
                        let wrapper = self.store.add_code(Code::ImportWrapper(func));
                        building.import_wrappers.push(wrapper);
                        wrapper
                    };
                    self.store[building.compiled.0].code_table[func_index.index()] = code;
                    self.store[building.instance.0]
                        .functions
                        .insert(func_index, func);
                }
                EntityIndex::Table(table_index) => {
                    let Extern::Table(table) = value else {
                        error(&mut self.thrower, format_args!("table import requires a WebAssembly.Table"));
                        continue;
                    };
                    let expected = translated.tables[table_index];
                    let actual = table.ty(self.store);
                    if actual.initial < expected.initial {
                        error(
                            &mut self.thrower,
                            format_args!(
                                "table import has {} elements, need at least {}",
                                actual.initial, expected.initial
                            ),
                        );
                        continue;
                    }
                    if let Some(max) = expected.maximum {
                        match actual.maximum {
                            None => {
                                error(
                                    &mut self.thrower,
                                    format_args!("table import has no maximum length, expected {max}"),
                                );
                                continue;
                            }
                            Some(actual_max) if actual_max > max => {
                                error(
                                    &mut self.thrower,
                                    format_args!(
                                        "table import has a larger maximum size {actual_max} than the module's declared maximum {max}"
                                    ),
                                );
                                continue;
                            }
                            Some(_) => {}
                        }
                    }
                    let foreign = (0..actual.initial).find(|index| {
                        matches!(table.get(self.store, *index), Ok(Some(func)) if func.wasm_target(self.store).is_none())
                    });
                    if let Some(index) = foreign {
                        error(
                            &mut self.thrower,
                            format_args!("table import entry {index} is not a wasm function"),
                        );
                        continue;
                    }
                    import_table(self.store, building, table_index, table);
                }
                EntityIndex::Memory(memory_index) => {
                    let Extern::Memory(memory) = value else {
                        error(
                            &mut self.thrower,
                            format_args!("memory import must be a WebAssembly.Memory object"),
                        );
                        continue;
                    };
                    let expected = translated.memories[memory_index];
                    let actual = memory.ty(self.store);
                    if actual.initial < expected.initial {
                        error(
                            &mut self.thrower,
                            format_args!(
                                "memory import has {} pages which is smaller than the declared initial of {}",
                                actual.initial, expected.initial
                            ),
                        );
                        continue;
                    }
                    if let Some(max) = expected.maximum {
                        match actual.maximum {
                            None => {
                                error(
                                    &mut self.thrower,
                                    format_args!("memory import has no maximum limit, expected at most {max}"),
                                );
                                continue;
                            }
                            Some(actual_max) if actual_max > max => {
                                error(
                                    &mut self.thrower,
                                    format_args!(
                                        "memory import has a larger maximum size {actual_max} than the module's declared maximum {max}"
                                    ),
                                );
                                continue;
                            }
                            Some(_) => {}
                        }
                    }
                    if actual.shared != expected.shared {
                        error(
                            &mut self.thrower,
                            format_args!("mismatch in shared state of memory declaration and import"),
                        );
                        continue;
                    }
                    self.memory = Some(memory);
                }
                EntityIndex::Global(global_index) => {
                    let desc = &translated.globals[global_index];
                    let ty = desc.ty.content_type;
                    if ty == ValType::I64 {
                        error(&mut self.thrower, format_args!("global import cannot have type i64"));
                        continue;
                    }
                    let number = match value {
                        Extern::Global(val) => val.to_number(),
                        _ => None,
                    };
                    let Some(val) = number.and_then(|n| Val::from_number(n, ty)) else {
                        error(&mut self.thrower, format_args!("global import must be a number"));
                        continue;
                    };
                    write_global(self.store, building.globals, desc.offset, val);
                }
            }
        }
    }

    fn init_globals(&mut self, building: &Building) -> crate::Result<()> {
        let shared = self.shared.clone();
        for (_, desc) in shared.translated().globals.iter() {
            let Some(init) = &desc.init else {
                continue;
            };
            let val = self.eval(building, init)?;
            write_global(self.store, building.globals, desc.offset, val);
        }
        Ok(())
    }

    fn eval(&mut self, building: &Building, expr: &ConstExpr) -> crate::Result<Val> {
        let store = &*self.store;
        let translated = self.shared.translated();
        self.const_eval.eval(expr, |index: GlobalIndex| {
            let desc = &translated.globals[index];
            building
                .globals
                .and_then(|globals| store.globals(globals))
                .and_then(|buffer| buffer.read(desc.offset, desc.ty.content_type))
                .unwrap_or(Val::default_for_ty(desc.ty.content_type))
        })
    }

    fn allocate_memory(&mut self, building: &mut Building) {
        let Some((_, ty)) = self.shared.translated().memories.iter().next() else {
            return;
        };
        let ty = *ty;
        let memory = match self.memory {
            Some(memory) => {
                if memory.size(self.store) < ty.initial {
                    self.thrower.range_error(format_args!(
                        "memory of {} pages is smaller than the declared initial of {}",
                        memory.size(self.store),
                        ty.initial
                    ));
                    return;
                }
                memory
            }
            None => match Memory::new(self.store, ty) {
                Ok(memory) => {
                    building.memory = Some(memory);
                    memory
                }
                Err(Error::Range(message)) => {
                    self.thrower.range_error(format_args!("{message}"));
                    return;
                }
                Err(err) => {
                    self.thrower.set(err);
                    return;
                }
            },
        };
        self.memory = Some(memory);
        self.store[building.instance.0].memory = Some(memory);
    }

    fn allocate_tables(&mut self, building: &mut Building) {
        let shared = self.shared.clone();
        let limit = self.store.engine().config().max_table_size;
        for (table_index, ty) in shared.translated().tables.iter() {
            if table_index.index() < self.store[building.instance.0].tables.len() {
                // imported, set up while processing imports
                continue;
            }
            if ty.initial > limit {
                self.thrower.range_error(format_args!(
                    "table of {} elements exceeds the limit of {limit}",
                    ty.initial
                ));
                return;
            }
            let dispatch = self.store.add_dispatch_table(DispatchTable::new(ty.initial));
            building.dispatch_tables.push(dispatch);
            self.store[building.instance.0].tables.push(TableInstance {
                dispatch,
                host: None,
            });
        }
    }

    fn check_segment_bounds(&mut self, building: &Building) -> crate::Result<()> {
        let shared = self.shared.clone();
        let translated = shared.translated();

        for segment in &translated.element_segments {
            let base = offset(self.eval(building, &segment.offset)?);
            let size = self.store[building.instance.0].tables[segment.table_index.index()]
                .dispatch;
            let size = self.store[size].len();
            let len = u32::try_from(segment.elements.len()).unwrap_or(u32::MAX);
            if base.checked_add(len).is_none_or(|end| end > size) {
                self.thrower
                    .link_error(format_args!("table initializer is out of bounds"));
                return Ok(());
            }
        }

        let mem_size = self
            .memory
            .map_or(0, |memory| memory.size(self.store) as usize * WASM_PAGE_SIZE);
        for segment in &translated.data_segments {
            if segment.data.is_empty() {
                continue;
            }
            let base = offset(self.eval(building, &segment.offset)?) as usize;
            if base
                .checked_add(segment.data.len())
                .is_none_or(|end| end > mem_size)
            {
                self.thrower
                    .link_error(format_args!("data segment is out of bounds"));
                return Ok(());
            }
        }
        Ok(())
    }

    fn load_segments(&mut self, building: &Building) {
        tracing::trace!("loading data segments");
        let shared = self.shared.clone();
        let Some(memory) = self.memory else {
            return;
        };
        for segment in &shared.translated().data_segments {
            if segment.data.is_empty() {
                continue;
            }
            let Ok(base) = self.eval(building, &segment.offset) else {
                continue;
            };
            let base = offset(base) as usize;
            if memory.write(self.store, base, &segment.data).is_err() {
                self.thrower
                    .link_error(format_args!("data segment is out of bounds"));
                return;
            }
        }
    }

    /// The function object for `func_index`, created on first request.
    fn func_object(&mut self, building: &Building, func_index: FuncIndex) -> Func {
        if let Some(func) = self.store[building.instance.0].functions.get(&func_index) {
            return *func;
        }
        let translated = self.shared.translated();
        let ty = translated.func_type(func_index).clone();
        let sig = translated.functions[func_index].sig_id;
        let func = Func::new_wasm(self.store, building.instance, func_index, ty, sig);
        self.store[building.instance.0]
            .functions
            .insert(func_index, func);
        func
    }

    /// The host table of `table_index`, created on first request and kept in
    /// sync with the instance's dispatch table.
    fn host_table(&mut self, building: &Building, table_index: TableIndex) -> Table {
        let table = self.store[building.instance.0].tables[table_index.index()];
        if let Some(host) = table.host {
            return host;
        }
        let len = self.store[table.dispatch].len();
        let maximum = self.shared.translated().tables[table_index].maximum;
        let host = Table::from_parts(self.store, vec![None; len as usize], maximum);
        host.register_dispatch_table(self.store, table.dispatch);
        self.store[building.instance.0].tables[table_index.index()].host = Some(host);
        host
    }

    fn build_exports(&mut self, building: &Building) {
        tracing::trace!("building exports");
        let shared = self.shared.clone();
        let translated = shared.translated();

        let mut exports = Vec::with_capacity(translated.exports.len());
        for export in &translated.exports {
            let value = match export.index {
                EntityIndex::Function(func_index) => {
                    if !translated.is_imported_function(func_index) {
                        ensure_exported_stub(self.store, building.compiled, func_index);
                    }
                    Extern::Func(self.func_object(building, func_index))
                }
                EntityIndex::Table(table_index) => {
                    Extern::Table(self.host_table(building, table_index))
                }
                EntityIndex::Memory(_) => match self.memory {
                    Some(memory) => Extern::Memory(memory),
                    None => {
                        self.thrower
                            .link_error(format_args!("exported memory {:?} is missing", export.name));
                        return;
                    }
                },
                EntityIndex::Global(global_index) => {
                    let desc = &translated.globals[global_index];
                    if desc.ty.content_type == ValType::I64 {
                        self.thrower.link_error(format_args!(
                            "export of globals of type I64 is not allowed."
                        ));
                        return;
                    }
                    let val = building
                        .globals
                        .and_then(|globals| self.store.globals(globals))
                        .and_then(|buffer| buffer.read(desc.offset, desc.ty.content_type))
                        .unwrap_or(Val::default_for_ty(desc.ty.content_type));
                    Extern::Global(val)
                }
            };
            exports.push((export.name.clone(), value));
        }
        self.store[building.instance.0].exports = exports;
    }

    fn load_table_segments(&mut self, building: &Building) {
        tracing::trace!("loading table segments");
        let shared = self.shared.clone();
        let translated = shared.translated();

        for segment in &translated.element_segments {
            let Ok(base) = self.eval(building, &segment.offset) else {
                continue;
            };
            let base = offset(base);
            let table = self.store[building.instance.0].tables[segment.table_index.index()];

            for (i, element) in segment.elements.iter().enumerate() {
                let index = base + u32::try_from(i).unwrap_or(u32::MAX);
                let entry = element.map(|func_index| self.table_entry(building, func_index));
                write_dispatch_entry(self.store, table.dispatch, index, entry);

                if let Some(host) = table.host {
                    let func = element.map(|func_index| self.func_object(building, func_index));
                    host.set_wrapper(self.store, index, func);
                    for other in host.dispatch_tables(self.store).to_vec() {
                        if other != table.dispatch {
                            write_dispatch_entry(self.store, other, index, entry);
                        }
                    }
                }
            }
        }
    }

    /// Dispatch table entry for `func_index`. Imports keep the code they were
    /// linked with, defined functions get an exported stub.
    fn table_entry(&mut self, building: &Building, func_index: FuncIndex) -> (CodeAddr, SigId) {
        let translated = self.shared.translated();
        let sig = translated.functions[func_index].sig_id;
        let code = if translated.is_imported_function(func_index) {
            self.store[building.compiled.0].code_table[func_index.index()]
        } else {
            ensure_exported_stub(self.store, building.compiled, func_index)
        };
        (code, sig)
    }

    /// Rewrites the embedded memory, globals, dispatch tables and direct
    /// call targets of the code to this instance's.
    fn specialize(&mut self, building: &Building) {
        tracing::trace!("specializing code");
        let state = self.store[building.compiled.0].specialization.clone();
        let data = &self.store[building.instance.0];

        let mut specialization = CodeSpecialization::default();
        specialization.relocate_memory(state.memory, data.memory);
        specialization.relocate_globals(state.globals, data.globals);
        for (index, table) in data.tables.iter().enumerate() {
            let old = state.tables.get(index).copied().flatten();
            specialization.relocate_table(TableIndex::new(index), old, Some(table.dispatch));
        }
        specialization.relocate_direct_calls(self.store[building.compiled.0].code_table.clone());
        specialization.apply_to_whole_module(self.store, building.compiled);
    }

    /// Makes the new compiled module the head of the chain and the one the
    /// module object hands out next.
    fn link_into_chain(&mut self, building: &Building) {
        tracing::trace!("linking into the instance chain");
        let template = self.module.template(self.store);
        if building.cloned {
            self.store[building.compiled.0].next = Some(template);
            self.store[template.0].prev = Some(building.compiled);
        }
        let data = &mut self.store[building.compiled.0];
        data.owning_instance = Some(building.instance);
        data.module_object = Some(self.module);
        self.store[self.module.0].template = building.compiled;
    }

    fn run_start_function(&mut self, building: &Building) -> crate::Result<()> {
        let Some(start) = self.shared.translated().start else {
            return Ok(());
        };
        tracing::trace!("running start function #{}", start.index());
        let target = self.store[building.compiled.0].code_table[start.index()];
        machine::call(self.store, target, &[], LazyCaller::External)
            .map(|_| ())
            .map_err(|source| Error::StartFunction {
                instance: building.instance,
                source: Box::new(source),
            })
    }
}

fn import_table(store: &mut Store, building: &Building, table_index: TableIndex, table: Table) {
    debug_assert_eq!(table_index.index(), store[building.instance.0].tables.len());
    let len = table.size(store);
    let dispatch = store.add_dispatch_table(DispatchTable::new(len));
    for index in 0..len {
        let entry = match table.get(store, index) {
            Ok(Some(func)) => func.table_entry(store),
            _ => None,
        };
        write_dispatch_entry(store, dispatch, index, entry);
    }
    table.register_dispatch_table(store, dispatch);
    store[building.instance.0].tables.push(TableInstance {
        dispatch,
        host: Some(table),
    });
}

fn import_error(thrower: &mut ErrorThrower, i: usize, import: &Import, message: fmt::Arguments<'_>) {
    thrower.link_error(format_args!(
        "Import #{i} module=\"{}\" function=\"{}\" error: {message}",
        import.module, import.field
    ));
}

/// Segment offsets are `i32` constants reinterpreted as unsigned.
fn offset(val: Val) -> u32 {
    val.i32().unwrap_or_default().cast_unsigned()
}

fn write_global(store: &mut Store, globals: Option<GlobalsAddr>, offset: u32, val: Val) {
    if let Some(buffer) = globals.and_then(|globals| store.globals_mut(globals)) {
        buffer.write(offset, val);
    }
}

/// Copies the code table of `template` into a new compiled module of
/// `module`. Function code is shared until specialization modifies it.
/// Import slots are left unlinked.
pub(super) fn clone_compiled_module(
    store: &mut Store,
    module: Module,
    template: CompiledModule,
) -> CompiledModule {
    let data = &store[template.0];
    let shared = data.shared.clone();
    let specialization = data.specialization.clone();
    let old_table = data.code_table.clone();

    let compiled = CompiledModule(store.add_compiled_module(CompiledModuleData {
        shared: shared.clone(),
        code_table: Vec::new(),
        export_wrappers: Vec::new(),
        specialization,
        owning_instance: None,
        prev: None,
        next: None,
        module_object: Some(module),
    }));

    let translated = shared.translated();
    let mut code_table = Vec::with_capacity(old_table.len());
    for (index, old) in old_table.into_iter().enumerate() {
        let func_index = FuncIndex::new(index);
        let code = if translated.is_imported_function(func_index) {
            store.illegal_code()
        } else {
            match &store[old] {
                Code::Function { func, .. } => {
                    let func = Arc::clone(func);
                    store.add_code(Code::Function {
                        func,
                        module: Some(compiled),
                    })
                }
                Code::LazyStub(Some(_)) => store.add_code(Code::LazyStub(Some(LazyStubMetadata {
                    module: compiled,
                    func_index,
                    table_refs: Vec::new(),
                }))),
                _ => store.lazy_stub(),
            }
        };
        code_table.push(code);
    }
    store[compiled.0].code_table = code_table;
    compiled.compile_wrappers(store);
    compiled
}
