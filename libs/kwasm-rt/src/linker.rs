// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::errors::Error;
use crate::func::Func;
use crate::instance::Instance;
use crate::module::Module;
use crate::store::Store;
use crate::types::FuncType;
use crate::values::Val;
use crate::Extern;
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use std::sync::Arc;

/// The import object handed to instantiation: a two level namespace of
/// module and field names.
///
/// Lookups happen by name only; whether a definition fits the import it
/// satisfies is checked during instantiation.
#[derive(Debug, Default)]
pub struct Linker {
    string2idx: HashMap<Arc<str>, usize>,
    strings: Vec<Arc<str>>,
    map: HashMap<ImportKey, Extern>,
}

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
struct ImportKey {
    name: usize,
    module: usize,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines `module::name` as `def`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyDefined`] if the name is already taken.
    pub fn define(
        &mut self,
        module: &str,
        name: &str,
        def: impl Into<Extern>,
    ) -> crate::Result<&mut Self> {
        let key = self.import_key(module, name);
        self.insert(key, def.into())?;
        Ok(self)
    }

    /// Defines `module::name` as a host function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyDefined`] if the name is already taken.
    pub fn func_new(
        &mut self,
        store: &mut Store,
        module: &str,
        name: &str,
        ty: FuncType,
        func: impl Fn(&mut Store, &[Val]) -> anyhow::Result<Option<Val>> + Send + Sync + 'static,
    ) -> crate::Result<&mut Self> {
        let func = Func::new(store, ty, func);
        self.define(module, name, func)
    }

    /// Attempt to retrieve a definition from this linker.
    pub fn get(&self, module: &str, name: &str) -> Option<Extern> {
        let key = ImportKey {
            module: *self.string2idx.get(module)?,
            name: *self.string2idx.get(name)?,
        };
        self.map.get(&key).copied()
    }

    /// Alias all definitions of `module` under the name `as_module`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyDefined`] if one of the aliased names is
    /// already taken.
    pub fn alias_module(&mut self, module: &str, as_module: &str) -> crate::Result<&mut Self> {
        let module = self.intern_str(module);
        let as_module = self.intern_str(as_module);
        let items = self
            .map
            .iter()
            .filter(|(key, _)| key.module == module)
            .map(|(key, def)| (key.name, *def))
            .collect::<Vec<_>>();
        for (name, item) in items {
            self.insert(
                ImportKey {
                    module: as_module,
                    name,
                },
                item,
            )?;
        }
        Ok(self)
    }

    /// Define all exports of `instance` under the module name `module_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyDefined`] if one of the export names is
    /// already taken.
    pub fn define_instance(
        &mut self,
        store: &Store,
        module_name: &str,
        instance: Instance,
    ) -> crate::Result<&mut Self> {
        for (name, ext) in instance.exports(store) {
            let key = self.import_key(module_name, name);
            self.insert(key, ext)?;
        }
        Ok(self)
    }

    /// Instantiates `module` with this linker as its import object.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Instance::new`].
    pub fn instantiate(&self, store: &mut Store, module: Module) -> crate::Result<Instance> {
        Instance::new(store, module, Some(self))
    }

    fn insert(&mut self, key: ImportKey, item: Extern) -> crate::Result<()> {
        match self.map.entry(key) {
            Entry::Occupied(_) => Err(Error::AlreadyDefined {
                module: self.strings[key.module].to_string(),
                field: self.strings[key.name].to_string(),
            }),
            Entry::Vacant(v) => {
                v.insert(item);
                Ok(())
            }
        }
    }

    fn import_key(&mut self, module: &str, name: &str) -> ImportKey {
        ImportKey {
            module: self.intern_str(module),
            name: self.intern_str(name),
        }
    }

    fn intern_str(&mut self, string: &str) -> usize {
        if let Some(idx) = self.string2idx.get(string) {
            return *idx;
        }
        let string: Arc<str> = string.into();
        let idx = self.strings.len();
        self.strings.push(string.clone());
        self.string2idx.insert(string, idx);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Engine, ErrorKind};

    #[test_log::test]
    fn define_and_alias() {
        let mut store = Store::new(&Engine::default());
        let mut linker = Linker::new();
        linker.define("env", "answer", Val::I32(42)).unwrap();
        linker.alias_module("env", "other").unwrap();

        assert_eq!(linker.get("other", "answer"), Some(Extern::Global(Val::I32(42))));
        assert_eq!(linker.get("env", "missing"), None);
        assert_eq!(linker.get("missing", "answer"), None);

        let ty = FuncType::new([], []);
        linker
            .func_new(&mut store, "env", "nop", ty, |_, _| Ok(None))
            .unwrap();
        assert!(linker.get("env", "nop").and_then(|e| e.func()).is_some());
    }

    #[test_log::test]
    fn redefinition_is_rejected() {
        let mut linker = Linker::new();
        linker.define("env", "x", Val::I32(1)).unwrap();
        let err = linker.define("env", "x", Val::I32(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
        assert_eq!(err.to_string(), "Name env::x is already defined");
    }
}
