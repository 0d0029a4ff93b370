// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

use crate::code::Code;
use crate::func::FuncData;
use crate::global::GlobalsBuffer;
use crate::instance::InstanceData;
use crate::memory::MemoryData;
use crate::module::{CompiledModuleData, ModuleData};
use crate::table::{DispatchTable, TableData};

/// Backing storage of every runtime object in a [`Store`](super::Store).
///
/// Slots are never reused: removing an object leaves a tombstone so stale
/// handles observe its absence instead of aliasing a newer object.
#[derive(Default)]
pub struct StoredData {
    pub(super) modules: Vec<Option<ModuleData>>,
    pub(super) compiled_modules: Vec<Option<CompiledModuleData>>,
    pub(super) instances: Vec<Option<InstanceData>>,
    pub(super) code: Vec<Option<Code>>,
    pub(super) memories: Vec<Option<MemoryData>>,
    pub(super) globals: Vec<Option<GlobalsBuffer>>,
    pub(super) dispatch_tables: Vec<Option<DispatchTable>>,
    pub(super) tables: Vec<Option<TableData>>,
    pub(super) funcs: Vec<Option<FuncData>>,
}

#[cfg(test)]
impl StoredData {
    /// Entries not removed yet, as memories, globals, dispatch tables, code
    /// and functions.
    pub(crate) fn live_counts(&self) -> [usize; 5] {
        fn live<T>(entries: &[Option<T>]) -> usize {
            entries.iter().filter(|entry| entry.is_some()).count()
        }
        [
            live(&self.memories),
            live(&self.globals),
            live(&self.dispatch_tables),
            live(&self.code),
            live(&self.funcs),
        ]
    }
}

pub struct Stored<T> {
    index: usize,
    _m: PhantomData<fn() -> T>,
}

// ===== impl Stored =====

impl<T> Stored<T> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            _m: PhantomData,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.index
    }
}

impl<T> Clone for Stored<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Stored<T> {}

impl<T> PartialEq for Stored<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Stored<T> {}

impl<T> Hash for Stored<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Stored<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Stored").field(&self.index).finish()
    }
}

macro_rules! stored_impls {
    ($bind:ident $(($ty:path, $add:ident, $has:ident, $get:ident, $get_mut:ident, $remove:ident, $field:expr))*) => {
        $(
            impl super::Store {
                pub(crate) fn $add(&mut self, val: $ty) -> Stored<$ty> {
                    let $bind = self;
                    let index = $field.len();
                    $field.push(Some(val));
                    Stored::new(index)
                }

                #[allow(dead_code, reason = "generated for every stored type")]
                pub(crate) fn $has(&self, index: Stored<$ty>) -> bool {
                    let $bind = self;
                    matches!($field.get(index.index), Some(Some(_)))
                }

                pub(crate) fn $get(&self, index: Stored<$ty>) -> Option<&$ty> {
                    let $bind = self;
                    $field.get(index.index)?.as_ref()
                }

                pub(crate) fn $get_mut(&mut self, index: Stored<$ty>) -> Option<&mut $ty> {
                    let $bind = self;
                    $field.get_mut(index.index)?.as_mut()
                }

                #[allow(dead_code, reason = "generated for every stored type")]
                pub(crate) fn $remove(&mut self, index: Stored<$ty>) -> Option<$ty> {
                    let $bind = self;
                    $field.get_mut(index.index)?.take()
                }
            }

            impl core::ops::Index<Stored<$ty>> for super::Store {
                type Output = $ty;

                fn index(&self, index: Stored<$ty>) -> &Self::Output {
                    match self.$get(index) {
                        Some(val) => val,
                        None => panic!(concat!("use of a removed ", stringify!($ty), " {:?}"), index),
                    }
                }
            }

            impl core::ops::IndexMut<Stored<$ty>> for super::Store {
                fn index_mut(&mut self, index: Stored<$ty>) -> &mut Self::Output {
                    match self.$get_mut(index) {
                        Some(val) => val,
                        None => panic!(concat!("use of a removed ", stringify!($ty), " {:?}"), index),
                    }
                }
            }
        )*
    };
}

stored_impls! {
    s
    (ModuleData, add_module, has_module, module, module_mut, remove_module, s.stored.modules)
    (CompiledModuleData, add_compiled_module, has_compiled_module, compiled_module, compiled_module_mut, remove_compiled_module, s.stored.compiled_modules)
    (InstanceData, add_instance, has_instance, instance, instance_mut, remove_instance, s.stored.instances)
    (Code, add_code, has_code, code, code_mut, remove_code, s.stored.code)
    (MemoryData, add_memory, has_memory, memory, memory_mut, remove_memory, s.stored.memories)
    (GlobalsBuffer, add_globals, has_globals, globals, globals_mut, remove_globals, s.stored.globals)
    (DispatchTable, add_dispatch_table, has_dispatch_table, dispatch_table, dispatch_table_mut, remove_dispatch_table, s.stored.dispatch_tables)
    (TableData, add_table, has_table, table, table_mut, remove_table, s.stored.tables)
    (FuncData, add_func, has_func, func, func_mut, remove_func, s.stored.funcs)
}
