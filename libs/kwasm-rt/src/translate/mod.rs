// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Decoded, immutable description of a WebAssembly module.

mod module_translator;

use crate::const_expr::ConstExpr;
use crate::indices::{
    DefinedFuncIndex, EntityIndex, FuncIndex, GlobalIndex, MemoryIndex, SigId, TableIndex,
    TypeIndex,
};
use crate::types::{FuncType, GlobalType, MemoryType, TableType};
use core::ops::Range;
use cranelift_entity::{EntityRef, PrimaryMap};
use hashbrown::HashMap;
use wasmparser::{FuncToValidate, ValidatorResources};

pub(crate) use module_translator::ModuleTranslator;

/// The result of translating a module's bytes.
pub(crate) struct ModuleTranslation {
    pub module: TranslatedModule,
    /// One validator per defined function, in definition order.
    pub function_bodies: PrimaryMap<DefinedFuncIndex, FuncToValidate<ValidatorResources>>,
}

#[derive(Debug, Default)]
pub struct TranslatedModule {
    pub types: PrimaryMap<TypeIndex, FuncType>,
    /// Canonical signature id for each entry of `types`.
    pub sig_ids: PrimaryMap<TypeIndex, SigId>,
    pub functions: PrimaryMap<FuncIndex, FunctionDesc>,
    pub tables: PrimaryMap<TableIndex, TableType>,
    pub memories: PrimaryMap<MemoryIndex, MemoryType>,
    pub globals: PrimaryMap<GlobalIndex, GlobalDesc>,
    /// Total size of the globals buffer in bytes.
    pub globals_size: u32,

    pub num_imported_functions: u32,
    pub num_imported_tables: u32,
    pub num_imported_memories: u32,
    pub num_imported_globals: u32,

    pub imports: Vec<Import>,
    /// Exports in declaration order.
    pub exports: Vec<Export>,
    pub data_segments: Vec<DataSegment>,
    pub element_segments: Vec<ElementSegment>,
    pub start: Option<FuncIndex>,
    pub func_names: HashMap<FuncIndex, String>,
}

#[derive(Debug, Clone)]
pub struct FunctionDesc {
    pub signature: TypeIndex,
    pub sig_id: SigId,
    /// Byte range of the body in the module's wire bytes, `None` for imports.
    pub body: Option<Range<usize>>,
}

#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub index: EntityIndex,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub index: EntityIndex,
}

#[derive(Debug, Clone)]
pub struct GlobalDesc {
    pub ty: GlobalType,
    /// Initializer, `None` for imported globals.
    pub init: Option<ConstExpr>,
    /// Byte offset inside the globals buffer.
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub memory_index: MemoryIndex,
    pub offset: ConstExpr,
    pub data: Box<[u8]>,
}

#[derive(Debug, Clone)]
pub struct ElementSegment {
    pub table_index: TableIndex,
    pub offset: ConstExpr,
    pub elements: Box<[Option<FuncIndex>]>,
}

impl TranslatedModule {
    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    pub fn num_defined_functions(&self) -> usize {
        self.functions.len() - self.num_imported_functions as usize
    }

    pub fn is_imported_function(&self, index: FuncIndex) -> bool {
        index.as_u32() < self.num_imported_functions
    }

    pub fn func_index(&self, index: DefinedFuncIndex) -> FuncIndex {
        FuncIndex::from_u32(self.num_imported_functions + index.as_u32())
    }

    pub fn defined_functions(&self) -> impl ExactSizeIterator<Item = FuncIndex> + '_ {
        (0..self.num_defined_functions()).map(|i| self.func_index(DefinedFuncIndex::new(i)))
    }

    pub fn func_type(&self, index: FuncIndex) -> &FuncType {
        &self.types[self.functions[index].signature]
    }

    pub fn func_name(&self, index: FuncIndex) -> Option<&str> {
        self.func_names.get(&index).map(String::as_str)
    }

    /// Human readable function name for error messages: the name section
    /// entry, or `<WASM UNNAMED>`.
    pub fn func_display_name(&self, index: FuncIndex) -> &str {
        self.func_name(index).unwrap_or("<WASM UNNAMED>")
    }

    /// Body range relative to the start of the module bytes.
    pub fn func_body(&self, index: FuncIndex) -> Option<Range<usize>> {
        self.functions[index].body.clone()
    }

    pub fn has_memory(&self) -> bool {
        !self.memories.is_empty()
    }

    /// Exported functions in export order, paired with their export name.
    pub fn exported_functions(&self) -> impl Iterator<Item = (&str, FuncIndex)> + '_ {
        self.exports
            .iter()
            .filter_map(|export| Some((export.name.as_str(), export.index.func()?)))
    }

    /// Lays out all globals in one buffer, each aligned to its own size.
    pub(crate) fn compute_global_offsets(&mut self) {
        let mut offset = 0;
        for global in self.globals.values_mut() {
            let size = global.ty.content_type.byte_size();
            offset = crate::utils::align_up(offset, size);
            global.offset = offset;
            offset += size;
        }
        self.globals_size = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValType;

    #[test]
    fn global_layout() {
        let mut module = TranslatedModule::default();
        for ty in [ValType::I32, ValType::F64, ValType::F32, ValType::I64] {
            module.globals.push(GlobalDesc {
                ty: GlobalType {
                    content_type: ty,
                    mutable: false,
                },
                init: None,
                offset: 0,
            });
        }
        module.compute_global_offsets();

        let offsets = module
            .globals
            .values()
            .map(|g| g.offset)
            .collect::<Vec<_>>();
        assert_eq!(offsets, [0, 8, 16, 24]);
        assert_eq!(module.globals_size, 32);
    }
}
