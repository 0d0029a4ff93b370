// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::code::{Code, CodeAddr, ExportWrapper};
use crate::compile::{self, FunctionBodies};
use crate::engine::Engine;
use crate::global::GlobalsAddr;
use crate::indices::{EntityIndex, FuncIndex};
use crate::instance::Instance;
use crate::memory::Memory;
use crate::store::{Store, Stored};
use crate::table::DispatchTableAddr;
use crate::translate::{Import, ModuleTranslator, TranslatedModule};
use cranelift_entity::EntityRef;
use parking_lot::Mutex;
use std::sync::Arc;

/// A compiled WebAssembly module, ready to be instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Module(pub(crate) Stored<ModuleData>);

#[derive(Debug)]
pub struct ModuleData {
    pub(crate) shared: SharedModule,
    /// The compiled module whose code table is handed to the next
    /// instantiation.
    pub(crate) template: CompiledModule,
}

/// Decoded module and its bytes, shared by every compiled module and
/// interpreter created from them. Safe to use from background threads.
#[derive(Debug, Clone)]
pub(crate) struct SharedModule(Arc<SharedModuleInner>);

#[derive(Debug)]
struct SharedModuleInner {
    translated: TranslatedModule,
    wire_bytes: Box<[u8]>,
    /// Breakpoints as `(function, body offset)` pairs.
    breakpoints: Mutex<Vec<(FuncIndex, u32)>>,
}

/// The code table, export wrappers and instance specific state of one
/// instantiation of a module.
///
/// Compiled modules of the same [`Module`] form a doubly linked chain, one
/// per live instance, so disposing an instance can hand the template role to
/// a sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompiledModule(pub(crate) Stored<CompiledModuleData>);

#[derive(Debug)]
pub struct CompiledModuleData {
    pub(crate) shared: SharedModule,
    /// One entry per function index, imports included.
    pub(crate) code_table: Vec<CodeAddr>,
    pub(crate) export_wrappers: Vec<ExportWrapper>,
    /// What the code in `code_table` is currently specialized to.
    pub(crate) specialization: SpecializationState,
    pub(crate) owning_instance: Option<Instance>,
    pub(crate) prev: Option<CompiledModule>,
    pub(crate) next: Option<CompiledModule>,
    pub(crate) module_object: Option<Module>,
}

/// Addresses embedded in specialized code. `None` is the placeholder every
/// unspecialized code table starts with.
#[derive(Debug, Clone, Default)]
pub(crate) struct SpecializationState {
    pub(crate) memory: Option<Memory>,
    pub(crate) globals: Option<GlobalsAddr>,
    pub(crate) tables: Vec<Option<DispatchTableAddr>>,
}

// ===== impl SharedModule =====

impl SharedModule {
    pub(crate) fn new(translated: TranslatedModule, wire_bytes: Box<[u8]>) -> Self {
        Self(Arc::new(SharedModuleInner {
            translated,
            wire_bytes,
            breakpoints: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn translated(&self) -> &TranslatedModule {
        &self.0.translated
    }

    pub(crate) fn wire_bytes(&self) -> &[u8] {
        &self.0.wire_bytes
    }

    /// Records a breakpoint, returns `false` if it was already set.
    pub(crate) fn add_breakpoint(&self, func_index: FuncIndex, offset: u32) -> bool {
        let mut breakpoints = self.0.breakpoints.lock();
        if breakpoints.contains(&(func_index, offset)) {
            return false;
        }
        breakpoints.push((func_index, offset));
        true
    }

    pub(crate) fn breakpoints(&self) -> Vec<(FuncIndex, u32)> {
        self.0.breakpoints.lock().clone()
    }

    pub(crate) fn has_breakpoints(&self) -> bool {
        !self.0.breakpoints.lock().is_empty()
    }
}

// ===== impl Module =====

impl Module {
    /// Decodes, validates and compiles `bytes` on the calling thread (and the
    /// engine's background workers in parallel mode).
    ///
    /// # Errors
    ///
    /// Returns a compile error if the bytes are not a valid module or use
    /// unsupported features.
    #[tracing::instrument(level = "debug", skip_all, fields(len = bytes.len()))]
    pub fn new(store: &mut Store, bytes: &[u8]) -> crate::Result<Self> {
        let (shared, bodies) = Self::translate(store.engine(), bytes)?;
        let code_table = compile::compile_module(store, &shared, bodies)?;
        Ok(Self::from_code_table(store, shared, code_table))
    }

    /// Returns whether `bytes` is a module this engine can compile.
    pub fn validate(engine: &Engine, bytes: &[u8]) -> bool {
        let Ok((shared, bodies)) = Self::translate(engine, bytes) else {
            return false;
        };
        let mut thrower = crate::thrower::ErrorThrower::new("WebAssembly.validate()");
        compile::validate_sequentially(&shared, bodies, &mut thrower);
        !thrower.error()
    }

    pub(crate) fn translate(
        engine: &Engine,
        bytes: &[u8],
    ) -> crate::Result<(SharedModule, FunctionBodies)> {
        let translation = ModuleTranslator::new(engine.signatures()).translate(bytes)?;
        Ok((
            SharedModule::new(translation.module, bytes.into()),
            translation.function_bodies,
        ))
    }

    /// Wraps a finished code table into a compiled module and the module
    /// object referencing it.
    pub(crate) fn from_code_table(
        store: &mut Store,
        shared: SharedModule,
        code_table: Vec<CodeAddr>,
    ) -> Self {
        let cm = CompiledModule(store.add_compiled_module(CompiledModuleData {
            specialization: SpecializationState {
                tables: vec![None; shared.translated().tables.len()],
                ..SpecializationState::default()
            },
            shared: shared.clone(),
            code_table,
            export_wrappers: Vec::new(),
            owning_instance: None,
            prev: None,
            next: None,
            module_object: None,
        }));
        cm.claim_code(store);
        cm.compile_wrappers(store);

        let module = Self(store.add_module(ModuleData {
            shared,
            template: cm,
        }));
        store[cm.0].module_object = Some(module);
        module
    }

    pub fn imports<'a>(&self, store: &'a Store) -> impl ExactSizeIterator<Item = &'a Import> + 'a {
        store[self.0].shared.translated().imports.iter()
    }

    pub fn exports<'a>(
        &self,
        store: &'a Store,
    ) -> impl ExactSizeIterator<Item = (&'a str, EntityIndex)> + 'a {
        store[self.0]
            .shared
            .translated()
            .exports
            .iter()
            .map(|export| (export.name.as_str(), export.index))
    }

    pub(crate) fn shared<'a>(&self, store: &'a Store) -> &'a SharedModule {
        &store[self.0].shared
    }

    pub(crate) fn template(&self, store: &Store) -> CompiledModule {
        store[self.0].template
    }

    /// Live instances of this module, most recently created first.
    pub fn instances(&self, store: &Store) -> Vec<Instance> {
        self.template(store)
            .chain(store)
            .into_iter()
            .filter_map(|cm| store[cm.0].owning_instance)
            .collect()
    }
}

// ===== impl CompiledModule =====

impl CompiledModule {
    /// Every compiled module linked with this one, from the head of the
    /// chain.
    pub(crate) fn chain(self, store: &Store) -> Vec<CompiledModule> {
        let mut head = self;
        while let Some(prev) = store[head.0].prev {
            head = prev;
        }
        let mut chain = vec![head];
        let mut current = head;
        while let Some(next) = store[current.0].next {
            chain.push(next);
            current = next;
        }
        chain
    }

    /// Marks the function code of every defined slot as owned by this
    /// compiled module.
    pub(crate) fn claim_code(self, store: &mut Store) {
        let shared = store[self.0].shared.clone();
        for func_index in shared.translated().defined_functions() {
            let addr = store[self.0].code_table[func_index.index()];
            if let Some(Code::Function { module, .. }) = store.code_mut(addr) {
                *module = Some(self);
            }
        }
    }

    /// Builds one host-callable wrapper per exported function.
    pub(crate) fn compile_wrappers(self, store: &mut Store) {
        let shared = store[self.0].shared.clone();
        let translated = shared.translated();

        let mut wrappers: Vec<ExportWrapper> = Vec::new();
        for (_, func_index) in translated.exported_functions() {
            if wrappers.iter().any(|w| w.func_index == func_index) {
                continue;
            }
            wrappers.push(ExportWrapper {
                func_index,
                sig: translated.functions[func_index].sig_id,
                has_i64: translated.func_type(func_index).has_i64(),
                target: store[self.0].code_table[func_index.index()],
            });
        }
        tracing::trace!("compiled {} export wrappers", wrappers.len());
        store[self.0].export_wrappers = wrappers;
    }

    /// Points the wrappers of `func_index` at `target`.
    pub(crate) fn set_wrapper_target(self, store: &mut Store, func_index: FuncIndex, target: CodeAddr) {
        for wrapper in &mut store[self.0].export_wrappers {
            if wrapper.func_index == func_index {
                wrapper.target = target;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CompilationMode, Config};

    fn store(mode: CompilationMode) -> Store {
        let mut config = Config::new();
        config.compilation_mode(mode);
        Store::new(&Engine::new(config))
    }

    const WAT: &str = r#"
        (module
            (import "env" "f" (func $f))
            (func $a (export "a") (result i32) i32.const 1)
            (func $b (export "b") (result i32) call $a)
            (export "a2" (func $a)))
    "#;

    #[test_log::test]
    fn code_table_layout() {
        let bytes = wat::parse_str(WAT).unwrap();
        let mut store = store(CompilationMode::Sequential);
        let module = Module::new(&mut store, &bytes).unwrap();

        let cm = module.template(&store);
        let data = &store[cm.0];
        assert_eq!(data.code_table.len(), 3);
        assert_eq!(data.code_table[0], store.illegal_code());
        for addr in &data.code_table[1..] {
            let owner = store[*addr].owner().unwrap();
            assert_eq!(owner.0, cm);
        }
        // duplicate exports share a wrapper
        assert_eq!(data.export_wrappers.len(), 2);
        assert_eq!(data.module_object, Some(module));
        assert!(module.instances(&store).is_empty());
    }

    #[test_log::test]
    fn lazy_code_table() {
        let bytes = wat::parse_str(WAT).unwrap();
        let mut store = store(CompilationMode::Lazy);
        let module = Module::new(&mut store, &bytes).unwrap();

        let data = &store[module.template(&store).0];
        assert_eq!(data.code_table[0], store.illegal_code());
        assert!(data.code_table[1..].iter().all(|addr| *addr == store.lazy_stub()));
    }

    #[test_log::test]
    fn validate() {
        let engine = Engine::default();
        assert!(Module::validate(&engine, &wat::parse_str(WAT).unwrap()));
        assert!(!Module::validate(&engine, b"\0asm\x01\0\0\0\x01"));

        let bad = wat::parse_str(r#"(module (func (result i32) i64.const 1))"#).unwrap();
        assert!(!Module::validate(&engine, &bad));
    }

    #[test_log::test]
    fn sequential_error_names_the_function() {
        let bytes = wat::parse_str(
            r#"(module
                (func $ok (result i32) i32.const 1)
                (func $bad (result i32) i64.const 1))"#,
        )
        .unwrap();
        let mut store = store(CompilationMode::Sequential);
        let err = Module::new(&mut store, &bytes).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Compile);
        let message = err.to_string();
        assert!(message.contains("Compilation of #1:bad failed."), "{message}");
    }
}
