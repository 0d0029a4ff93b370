// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::code::{Code, CodeAddr};
use crate::errors::Error;
use crate::func::Func;
use crate::indices::SigId;
use crate::store::{Store, Stored};
use crate::types::TableType;

pub type DispatchTableAddr = Stored<DispatchTable>;

/// Per-instance table storage consulted by `call_indirect`: parallel arrays
/// of code and canonical signature.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    functions: Vec<Option<CodeAddr>>,
    signatures: Vec<Option<SigId>>,
}

impl DispatchTable {
    pub(crate) fn new(len: u32) -> Self {
        Self {
            functions: vec![None; len as usize],
            signatures: vec![None; len as usize],
        }
    }

    pub(crate) fn len(&self) -> u32 {
        u32::try_from(self.functions.len()).unwrap_or(u32::MAX)
    }

    pub(crate) fn get(&self, index: u32) -> Option<(CodeAddr, SigId)> {
        let index = index as usize;
        Some((
            (*self.functions.get(index)?)?,
            (*self.signatures.get(index)?)?,
        ))
    }

    pub(crate) fn code_at(&self, index: u32) -> Option<CodeAddr> {
        *self.functions.get(index as usize)?
    }

    fn set(&mut self, index: u32, entry: Option<(CodeAddr, SigId)>) {
        let index = index as usize;
        if index >= self.functions.len() {
            return;
        }
        self.functions[index] = entry.map(|(code, _)| code);
        self.signatures[index] = entry.map(|(_, sig)| sig);
    }

    /// Replaces the code of every slot holding `old`, keeping signatures.
    pub(crate) fn replace_code(&mut self, old: CodeAddr, new: CodeAddr) -> usize {
        let mut count = 0;
        for slot in self.functions.iter_mut().filter(|slot| **slot == Some(old)) {
            *slot = Some(new);
            count += 1;
        }
        count
    }

    pub(crate) fn replace_code_at(&mut self, index: u32, code: CodeAddr) {
        if let Some(slot) = self.functions.get_mut(index as usize)
            && slot.is_some()
        {
            *slot = Some(code);
        }
    }

    fn grow(&mut self, len: u32) {
        self.functions.resize(len as usize, None);
        self.signatures.resize(len as usize, None);
    }
}

/// Writes one dispatch table slot, recording the slot on the lazy stub it
/// points at so compiling the stub's function can patch it.
pub(crate) fn write_dispatch_entry(
    store: &mut Store,
    table: DispatchTableAddr,
    index: u32,
    entry: Option<(CodeAddr, SigId)>,
) {
    if let Some((code, _)) = entry
        && let Some(Code::LazyStub(Some(meta))) = store.code_mut(code)
        && !meta.table_refs.contains(&(table, index))
    {
        meta.table_refs.push((table, index));
    }
    store[table].set(index, entry);
}

/// A table exposed to the host, backed by a wrapper array of function objects
/// and mirrored into the dispatch table of every instance using it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Table(pub(crate) Stored<TableData>);

#[derive(Debug)]
pub struct TableData {
    functions: Vec<Option<Func>>,
    maximum: Option<u32>,
    dispatch_tables: Vec<DispatchTableAddr>,
}

impl Table {
    /// Creates an empty table of `ty.initial` slots.
    ///
    /// # Errors
    ///
    /// Returns a range error if the initial size exceeds the engine limit.
    pub fn new(store: &mut Store, ty: TableType) -> crate::Result<Self> {
        let limit = store.engine().config().max_table_size;
        if ty.initial > limit {
            return Err(Error::Range(format!(
                "table size {} exceeds the limit of {limit}",
                ty.initial
            )));
        }
        Ok(Self::from_parts(store, vec![None; ty.initial as usize], ty.maximum))
    }

    pub(crate) fn from_parts(
        store: &mut Store,
        functions: Vec<Option<Func>>,
        maximum: Option<u32>,
    ) -> Self {
        Self(store.add_table(TableData {
            functions,
            maximum,
            dispatch_tables: Vec::new(),
        }))
    }

    pub fn ty(&self, store: &Store) -> TableType {
        TableType {
            initial: self.size(store),
            maximum: store[self.0].maximum,
        }
    }

    pub fn size(&self, store: &Store) -> u32 {
        u32::try_from(store[self.0].functions.len()).unwrap_or(u32::MAX)
    }

    /// # Errors
    ///
    /// Returns a range error if `index` is out of bounds.
    pub fn get(&self, store: &Store, index: u32) -> crate::Result<Option<Func>> {
        store[self.0]
            .functions
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::Range(format!("table index {index} is out of bounds")))
    }

    /// Stores `func` at `index` and updates every dispatch table backed by
    /// this table.
    ///
    /// # Errors
    ///
    /// Returns a range error if `index` is out of bounds and a type error if
    /// `func` is not a WebAssembly function.
    pub fn set(&self, store: &mut Store, index: u32, func: Option<Func>) -> crate::Result<()> {
        if index >= self.size(store) {
            return Err(Error::Range(format!("table index {index} is out of bounds")));
        }
        let entry = match func {
            Some(func) => Some(func.table_entry(store).ok_or_else(|| {
                Error::Type("Argument 2 must be null or a WebAssembly function".to_string())
            })?),
            None => None,
        };

        store[self.0].functions[index as usize] = func;
        for dispatch in store[self.0].dispatch_tables.clone() {
            write_dispatch_entry(store, dispatch, index, entry);
        }
        Ok(())
    }

    /// Grows the table by `delta` empty slots and returns the previous size.
    ///
    /// # Errors
    ///
    /// Returns a range error if the new size exceeds the maximum.
    pub fn grow(&self, store: &mut Store, delta: u32) -> crate::Result<u32> {
        let engine_limit = store.engine().config().max_table_size;
        let old = self.size(store);
        let data = &mut store[self.0];
        let limit = data.maximum.map_or(engine_limit, |max| max.min(engine_limit));
        let new = old
            .checked_add(delta)
            .filter(|new| *new <= limit)
            .ok_or_else(|| Error::Range("Unable to grow instance table.".to_string()))?;

        data.functions.resize(new as usize, None);
        for dispatch in data.dispatch_tables.clone() {
            store[dispatch].grow(new);
        }
        Ok(old)
    }

    /// Stores `func` in the wrapper array only, the caller keeps the dispatch
    /// tables up to date.
    pub(crate) fn set_wrapper(&self, store: &mut Store, index: u32, func: Option<Func>) {
        if let Some(slot) = store[self.0].functions.get_mut(index as usize) {
            *slot = func;
        }
    }

    pub(crate) fn dispatch_tables<'a>(&self, store: &'a Store) -> &'a [DispatchTableAddr] {
        &store[self.0].dispatch_tables
    }

    pub(crate) fn register_dispatch_table(&self, store: &mut Store, dispatch: DispatchTableAddr) {
        let data = &mut store[self.0];
        if !data.dispatch_tables.contains(&dispatch) {
            data.dispatch_tables.push(dispatch);
        }
    }

    pub(crate) fn unregister_dispatch_table(&self, store: &mut Store, dispatch: DispatchTableAddr) {
        if let Some(data) = store.table_mut(self.0) {
            data.dispatch_tables.retain(|d| *d != dispatch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use crate::types::FuncType;

    fn table(store: &mut Store, initial: u32, maximum: Option<u32>) -> Table {
        Table::new(store, TableType { initial, maximum }).unwrap()
    }

    #[test_log::test]
    fn grow_propagates_to_dispatch_tables() {
        let mut store = Store::new(&Engine::default());
        let table = table(&mut store, 1, Some(3));
        let dispatch = store.add_dispatch_table(DispatchTable::new(1));
        table.register_dispatch_table(&mut store, dispatch);

        assert_eq!(table.grow(&mut store, 2).unwrap(), 1);
        assert_eq!(table.size(&store), 3);
        assert_eq!(store[dispatch].len(), 3);
        assert!(table.grow(&mut store, 1).is_err());
    }

    #[test_log::test]
    fn set_rejects_host_functions() {
        let mut store = Store::new(&Engine::default());
        let table = table(&mut store, 2, None);
        let host = Func::new(&mut store, FuncType::new([], []), |_, _| Ok(None));

        let err = table.set(&mut store, 0, Some(host)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Type);
        assert!(table.set(&mut store, 2, None).is_err());
        table.set(&mut store, 1, None).unwrap();
        assert_eq!(table.get(&store, 1).unwrap(), None);
    }

    #[test_log::test]
    fn dispatch_entries_record_lazy_stub_slots() {
        let mut store = Store::new(&Engine::default());
        let dispatch = store.add_dispatch_table(DispatchTable::new(2));
        let sig = store
            .engine()
            .signatures()
            .register(&FuncType::new([], []));

        // the shared stub carries no metadata and records nothing
        let shared = store.lazy_stub();
        write_dispatch_entry(&mut store, dispatch, 0, Some((shared, sig)));
        assert_eq!(store[dispatch].get(0), Some((shared, sig)));
        assert_eq!(store[dispatch].get(1), None);

        let illegal = store.illegal_code();
        assert_eq!(store[dispatch].replace_code(shared, illegal), 1);
        assert_eq!(store[dispatch].code_at(0), Some(illegal));
    }
}
