// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::const_expr::ConstExpr;
use crate::indices::{DefinedFuncIndex, EntityIndex, FuncIndex, GlobalIndex, MemoryIndex, TableIndex, TypeIndex};
use crate::translate::{
    DataSegment, ElementSegment, Export, FunctionDesc, GlobalDesc, Import, ModuleTranslation,
    TranslatedModule,
};
use crate::types::{FuncType, GlobalType, MemoryType, SignatureRegistry, TableType, ValType};
use crate::wasm_unsupported;
use cranelift_entity::PrimaryMap;
use wasmparser::{
    BinaryReader, DataKind, DataSectionReader, ElementItems, ElementKind, ElementSectionReader,
    Encoding, ExportSectionReader, ExternalKind, FuncToValidate, FunctionSectionReader,
    GlobalSectionReader, ImportSectionReader, MemorySectionReader, Name, NameSectionReader,
    Parser, Payload, TableInit, TableSectionReader, TypeRef, TypeSectionReader, Validator,
    ValidatorResources, WasmFeatures,
};

/// A translator for converting the output of `wasmparser` into types used by this crate.
pub(crate) struct ModuleTranslator<'a> {
    result: TranslatedModule,
    function_bodies: PrimaryMap<DefinedFuncIndex, FuncToValidate<ValidatorResources>>,
    validator: Validator,
    signatures: &'a SignatureRegistry,
}

impl<'a> ModuleTranslator<'a> {
    pub(crate) fn new(signatures: &'a SignatureRegistry) -> Self {
        Self {
            result: TranslatedModule::default(),
            function_bodies: PrimaryMap::new(),
            validator: Validator::new_with_features(WasmFeatures::default()),
            signatures,
        }
    }

    /// Decode and validate the module structure of `data`.
    ///
    /// Function bodies are not validated here; a validator for each body is
    /// returned alongside the module so compilation can check it.
    pub(crate) fn translate(mut self, data: &[u8]) -> crate::Result<ModuleTranslation> {
        let parser = Parser::new(0);

        for payload in parser.parse_all(data) {
            self.translate_payload(payload?)?;
        }

        self.result.compute_global_offsets();

        debug_assert_eq!(
            self.function_bodies.len(),
            self.result.num_defined_functions()
        );

        tracing::trace!(
            "translated module: {} functions ({} imported), {} exports",
            self.result.num_functions(),
            self.result.num_imported_functions,
            self.result.exports.len()
        );

        Ok(ModuleTranslation {
            module: self.result,
            function_bodies: self.function_bodies,
        })
    }

    fn translate_payload(&mut self, payload: Payload<'_>) -> crate::Result<()> {
        match payload {
            Payload::Version {
                num,
                encoding,
                range,
            } => {
                if encoding != Encoding::Module {
                    return Err(wasm_unsupported!("component model"));
                }
                self.validator.version(num, encoding, &range)?;
            }
            Payload::TypeSection(types) => {
                self.validator.type_section(&types)?;
                self.translate_type_section(types)?;
            }
            Payload::ImportSection(imports) => {
                self.validator.import_section(&imports)?;
                self.translate_import_section(imports)?;
            }
            Payload::FunctionSection(functions) => {
                self.validator.function_section(&functions)?;
                self.translate_function_section(functions)?;
            }
            Payload::TableSection(tables) => {
                self.validator.table_section(&tables)?;
                self.translate_table_section(tables)?;
            }
            Payload::MemorySection(memories) => {
                self.validator.memory_section(&memories)?;
                self.translate_memory_section(memories)?;
            }
            Payload::TagSection(_) => return Err(wasm_unsupported!("exception handling")),
            Payload::GlobalSection(globals) => {
                self.validator.global_section(&globals)?;
                self.translate_global_section(globals)?;
            }
            Payload::ExportSection(exports) => {
                self.validator.export_section(&exports)?;
                self.translate_export_section(exports)?;
            }
            Payload::StartSection { func, range } => {
                self.validator.start_section(func, &range)?;
                self.result.start = Some(FuncIndex::from_u32(func));
            }
            Payload::ElementSection(elements) => {
                self.validator.element_section(&elements)?;
                self.translate_element_section(elements)?;
            }
            Payload::DataCountSection { count, range } => {
                self.validator.data_count_section(count, &range)?;
            }
            Payload::DataSection(data) => {
                self.validator.data_section(&data)?;
                self.translate_data_section(data)?;
            }
            Payload::CodeSectionStart { count, range, .. } => {
                self.validator.code_section_start(count, &range)?;
                self.function_bodies.reserve_exact(count as usize);
            }
            Payload::CodeSectionEntry(body) => {
                let validator = self.validator.code_section_entry(&body)?;
                let defined = self.function_bodies.push(validator);
                let func_index = self.result.func_index(defined);
                self.result.functions[func_index].body = Some(body.range());
            }
            Payload::CustomSection(section) => {
                if section.name() == "name" {
                    let reader = NameSectionReader::new(BinaryReader::new(
                        section.data(),
                        section.data_offset(),
                    ));
                    // malformed names never fail the module
                    if let Err(err) = self.translate_name_section(reader) {
                        tracing::debug!("ignoring malformed name section: {err}");
                    }
                } else {
                    tracing::trace!("skipping custom section {}", section.name());
                }
            }
            Payload::End(offset) => {
                self.validator.end(offset)?;
            }
            p => tracing::warn!("unknown section {p:?}"),
        }
        Ok(())
    }

    #[expect(
        clippy::needless_pass_by_value,
        reason = "translate_ methods consume their readers"
    )]
    fn translate_type_section(&mut self, types: TypeSectionReader<'_>) -> crate::Result<()> {
        for ty in types.into_iter_err_on_gc_types() {
            let ty = FuncType::from_wasmparser(&ty?)?;
            let sig_id = self.signatures.register(&ty);
            self.result.types.push(ty);
            self.result.sig_ids.push(sig_id);
        }
        Ok(())
    }

    fn translate_import_section(&mut self, imports: ImportSectionReader<'_>) -> crate::Result<()> {
        self.result.imports.reserve_exact(imports.count() as usize);

        for import in imports {
            let import = import?;

            let index = match import.ty {
                TypeRef::Func(index) => {
                    self.result.num_imported_functions += 1;
                    let signature = TypeIndex::from_u32(index);
                    EntityIndex::Function(self.result.functions.push(FunctionDesc {
                        signature,
                        sig_id: self.result.sig_ids[signature],
                        body: None,
                    }))
                }
                TypeRef::Table(ty) => {
                    self.result.num_imported_tables += 1;
                    EntityIndex::Table(self.result.tables.push(TableType::from_wasmparser(&ty)?))
                }
                TypeRef::Memory(ty) => {
                    self.result.num_imported_memories += 1;
                    EntityIndex::Memory(self.push_memory(MemoryType::from_wasmparser(&ty)?)?)
                }
                TypeRef::Global(ty) => {
                    if ty.mutable {
                        return Err(wasm_unsupported!("import of mutable global"));
                    }
                    self.result.num_imported_globals += 1;
                    EntityIndex::Global(self.result.globals.push(GlobalDesc {
                        ty: GlobalType {
                            content_type: ValType::from_wasmparser(ty.content_type)?,
                            mutable: false,
                        },
                        init: None,
                        offset: 0,
                    }))
                }
                ty => return Err(wasm_unsupported!("import of {ty:?}")),
            };

            self.result.imports.push(Import {
                module: import.module.to_string(),
                field: import.name.to_string(),
                index,
            });
        }

        Ok(())
    }

    fn translate_function_section(
        &mut self,
        functions: FunctionSectionReader<'_>,
    ) -> crate::Result<()> {
        self.result
            .functions
            .reserve_exact(functions.count() as usize);

        for index in functions {
            let signature = TypeIndex::from_u32(index?);
            self.result.functions.push(FunctionDesc {
                signature,
                sig_id: self.result.sig_ids[signature],
                body: None,
            });
        }

        Ok(())
    }

    fn translate_table_section(&mut self, tables: TableSectionReader<'_>) -> crate::Result<()> {
        for table in tables {
            let table = table?;
            if !matches!(table.init, TableInit::RefNull) {
                return Err(wasm_unsupported!("table initializer expressions"));
            }
            self.result.tables.push(TableType::from_wasmparser(&table.ty)?);
        }
        Ok(())
    }

    fn translate_memory_section(&mut self, memories: MemorySectionReader<'_>) -> crate::Result<()> {
        for ty in memories {
            self.push_memory(MemoryType::from_wasmparser(&ty?)?)?;
        }
        Ok(())
    }

    fn push_memory(&mut self, ty: MemoryType) -> crate::Result<MemoryIndex> {
        if !self.result.memories.is_empty() {
            return Err(wasm_unsupported!("multiple memories"));
        }
        Ok(self.result.memories.push(ty))
    }

    fn translate_global_section(&mut self, globals: GlobalSectionReader<'_>) -> crate::Result<()> {
        for global in globals {
            let global = global?;
            self.result.globals.push(GlobalDesc {
                ty: GlobalType {
                    content_type: ValType::from_wasmparser(global.ty.content_type)?,
                    mutable: global.ty.mutable,
                },
                init: Some(ConstExpr::from_wasmparser(&global.init_expr)?),
                offset: 0,
            });
        }
        Ok(())
    }

    fn translate_export_section(&mut self, exports: ExportSectionReader<'_>) -> crate::Result<()> {
        for export in exports {
            let export = export?;
            let index = match export.kind {
                ExternalKind::Func => EntityIndex::Function(FuncIndex::from_u32(export.index)),
                ExternalKind::Table => EntityIndex::Table(TableIndex::from_u32(export.index)),
                ExternalKind::Memory => EntityIndex::Memory(MemoryIndex::from_u32(export.index)),
                ExternalKind::Global => {
                    let index = GlobalIndex::from_u32(export.index);
                    if self.result.globals[index].ty.mutable {
                        return Err(wasm_unsupported!("export of mutable global"));
                    }
                    EntityIndex::Global(index)
                }
                kind => return Err(wasm_unsupported!("export of {kind:?}")),
            };

            self.result.exports.push(Export {
                name: export.name.to_string(),
                index,
            });
        }

        Ok(())
    }

    fn translate_element_section(&mut self, elements: ElementSectionReader<'_>) -> crate::Result<()> {
        for element in elements {
            let element = element?;

            let ElementKind::Active {
                table_index,
                offset_expr,
            } = element.kind
            else {
                // passive and declared segments have no effect without bulk table operations
                continue;
            };

            let elements = match element.items {
                ElementItems::Functions(funcs) => funcs
                    .into_iter()
                    .map(|func| Ok(Some(FuncIndex::from_u32(func?))))
                    .collect::<crate::Result<Box<[_]>>>()?,
                ElementItems::Expressions(_, exprs) => exprs
                    .into_iter()
                    .map(|expr| {
                        ConstExpr::from_wasmparser(&expr?)?
                            .as_func_ref()
                            .ok_or_else(|| wasm_unsupported!("non-constant element expression"))
                    })
                    .collect::<crate::Result<Box<[_]>>>()?,
            };

            self.result.element_segments.push(ElementSegment {
                table_index: TableIndex::from_u32(table_index.unwrap_or(0)),
                offset: ConstExpr::from_wasmparser(&offset_expr)?,
                elements,
            });
        }

        Ok(())
    }

    fn translate_data_section(&mut self, section: DataSectionReader<'_>) -> crate::Result<()> {
        for entry in section {
            let entry = entry?;

            match entry.kind {
                DataKind::Active {
                    memory_index,
                    offset_expr,
                } => {
                    self.result.data_segments.push(DataSegment {
                        memory_index: MemoryIndex::from_u32(memory_index),
                        offset: ConstExpr::from_wasmparser(&offset_expr)?,
                        data: entry.data.into(),
                    });
                }
                DataKind::Passive => {
                    tracing::trace!("skipping passive data segment");
                }
            }
        }

        Ok(())
    }

    fn translate_name_section(&mut self, names: NameSectionReader<'_>) -> crate::Result<()> {
        for subsection in names {
            if let Name::Function(names) = subsection? {
                for name in names {
                    let name = name?;
                    self.result
                        .func_names
                        .insert(FuncIndex::from_u32(name.index), name.name.to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(wat: &str) -> crate::Result<ModuleTranslation> {
        let bytes = wat::parse_str(wat).unwrap();
        let registry = SignatureRegistry::default();
        ModuleTranslator::new(&registry).translate(&bytes)
    }

    #[test_log::test]
    fn imports_exports_and_segments() {
        let translation = translate(
            r#"
            (module
                (import "env" "f" (func $f (param i32) (result i32)))
                (import "env" "g" (global $g i32))
                (memory (export "mem") 1)
                (table 2 funcref)
                (global $h (mut f64) (f64.const 1.5))
                (func $add (export "add") (param i32 i32) (result i32)
                    local.get 0 local.get 1 i32.add)
                (elem (i32.const 1) $add)
                (data (global.get $g) "\01\02"))
            "#,
        )
        .unwrap();
        let module = &translation.module;

        assert_eq!(module.num_imported_functions, 1);
        assert_eq!(module.num_defined_functions(), 1);
        assert_eq!(translation.function_bodies.len(), 1);
        assert!(module.is_imported_function(FuncIndex::from_u32(0)));
        assert!(module.func_body(FuncIndex::from_u32(1)).is_some());
        assert_eq!(module.func_display_name(FuncIndex::from_u32(1)), "add");

        assert_eq!(module.exports.len(), 2);
        assert_eq!(module.exports[0].name, "mem");
        assert_eq!(
            module.exported_functions().collect::<Vec<_>>(),
            [("add", FuncIndex::from_u32(1))]
        );

        assert_eq!(module.globals_size, 16);
        assert_eq!(module.element_segments[0].elements[..], [Some(FuncIndex::from_u32(1))]);
        assert_eq!(&*module.data_segments[0].data, &[1, 2]);
    }

    #[test_log::test]
    fn rejects_invalid_and_unsupported() {
        assert!(matches!(
            translate("(module (memory 1) (memory 1))"),
            Err(crate::Error::InvalidWebAssembly { .. } | crate::Error::Unsupported(_))
        ));
        assert!(matches!(
            translate(r#"(module (import "a" "b" (global (mut i32))))"#),
            Err(crate::Error::Unsupported(_))
        ));
        assert!(matches!(
            translate("(module (func (result i32 i32) i32.const 0 i32.const 1))"),
            Err(crate::Error::Unsupported(_))
        ));
    }
}
