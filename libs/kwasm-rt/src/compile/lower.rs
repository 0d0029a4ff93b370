// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lowering of validated function bodies into [`CompiledFunction`]s.
//!
//! Branch targets are resolved with a control stack of pending labels, the
//! same way the interpreter's control transfer map is built, except that the
//! targets are instruction indices of the lowered code and every branch also
//! records the operand stack height and arity of its label.

use crate::code::{Branch, CompiledFunction, Inst, Relocation, RelocationKind};
use crate::indices::{FuncIndex, GlobalIndex, TableIndex, TypeIndex};
use crate::ops::Simple;
use crate::translate::TranslatedModule;
use crate::types::ValType;
use crate::values::Val;
use crate::wasm_unsupported;
use core::ops::Range;
use cranelift_entity::EntityRef;
use wasmparser::{BinaryReader, BlockType, FuncValidator, Operator, ValidatorResources};

/// Lowers the body of `func_index`, validating it along the way when a
/// validator is given.
pub(crate) fn lower_function(
    module: &TranslatedModule,
    wire_bytes: &[u8],
    func_index: FuncIndex,
    mut validator: Option<&mut FuncValidator<ValidatorResources>>,
) -> crate::Result<CompiledFunction> {
    let body = module
        .func_body(func_index)
        .ok_or_else(|| wasm_unsupported!("cannot lower imported function {func_index:?}"))?;
    let mut reader = body_reader(wire_bytes, &body);

    let mut locals = Vec::new();
    let local_count = reader.read_var_u32()?;
    for _ in 0..local_count {
        let pos = reader.original_position();
        let count = reader.read_var_u32()?;
        let ty = reader.read()?;
        if let Some(validator) = validator.as_deref_mut() {
            validator.define_locals(pos, count, ty)?;
        }
        let ty = ValType::from_wasmparser(ty)?;
        locals.extend((0..count).map(|_| ty));
    }

    let results = module.func_type(func_index).results().len();
    let mut lowerer = Lowerer::new(module, func_index, locals, arity(results)?);

    while !reader.eof() {
        let pos = reader.original_position();
        let op = reader.read_operator()?;
        if let Some(validator) = validator.as_deref_mut() {
            validator.op(pos, &op)?;
        }
        lowerer.current_offset = offset_in_body(pos, &body);
        lowerer.lower_operator(op)?;
    }
    if let Some(validator) = validator {
        validator.finish(reader.original_position())?;
    }

    Ok(lowerer.func)
}

/// Validates a function body without lowering it, also rejecting operators
/// the runtime does not implement.
pub(crate) fn validate_function(
    wire_bytes: &[u8],
    body: &Range<usize>,
    validator: &mut FuncValidator<ValidatorResources>,
) -> crate::Result<()> {
    let mut reader = body_reader(wire_bytes, body);

    let local_count = reader.read_var_u32()?;
    for _ in 0..local_count {
        let pos = reader.original_position();
        let count = reader.read_var_u32()?;
        let ty = reader.read()?;
        validator.define_locals(pos, count, ty)?;
        ValType::from_wasmparser(ty)?;
    }

    while !reader.eof() {
        let pos = reader.original_position();
        let op = reader.read_operator()?;
        validator.op(pos, &op)?;
        check_operator(&op)?;
    }
    validator.finish(reader.original_position())?;
    Ok(())
}

pub(crate) fn body_reader<'a>(wire_bytes: &'a [u8], body: &Range<usize>) -> BinaryReader<'a> {
    BinaryReader::new(&wire_bytes[body.clone()], body.start)
}

fn offset_in_body(pos: usize, body: &Range<usize>) -> u32 {
    u32::try_from(pos - body.start).unwrap_or(u32::MAX)
}

/// Rejects operators outside the supported instruction set.
pub(crate) fn check_operator(op: &Operator<'_>) -> crate::Result<()> {
    use Operator as O;

    let supported = match op {
        O::Unreachable
        | O::Nop
        | O::Else
        | O::End
        | O::Br { .. }
        | O::BrIf { .. }
        | O::BrTable { .. }
        | O::Return
        | O::Call { .. }
        | O::CallIndirect { .. }
        | O::Drop
        | O::Select
        | O::LocalGet { .. }
        | O::LocalSet { .. }
        | O::LocalTee { .. }
        | O::GlobalGet { .. }
        | O::GlobalSet { .. }
        | O::I32Const { .. }
        | O::I64Const { .. }
        | O::F32Const { .. }
        | O::F64Const { .. } => true,
        O::Block { blockty } | O::Loop { blockty } | O::If { blockty } => {
            block_arity(*blockty).is_ok()
        }
        O::TypedSelect { ty } => ValType::from_wasmparser(*ty).is_ok(),
        O::MemorySize { mem } | O::MemoryGrow { mem } => *mem == 0,
        op => Simple::from_operator(op).is_some(),
    };

    if supported {
        Ok(())
    } else {
        Err(wasm_unsupported!("operator {op:?}"))
    }
}

fn arity(results: usize) -> crate::Result<u8> {
    match results {
        0 => Ok(0),
        1 => Ok(1),
        n => Err(wasm_unsupported!("{n} results (multi-value)")),
    }
}

fn block_arity(ty: BlockType) -> crate::Result<u8> {
    match ty {
        BlockType::Empty => Ok(0),
        BlockType::Type(_) => Ok(1),
        BlockType::FuncType(_) => Err(wasm_unsupported!("block with a function type (multi-value)")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If,
    Else,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    /// Operand stack height on entry.
    height: u32,
    /// Values left on the stack when the construct ends.
    arity: u8,
    /// Loop header.
    start: u32,
    /// Branches waiting for the end of this construct.
    fixups: Vec<Fixup>,
    /// `br_if_eqz` of an `if` still waiting for its `else`.
    else_fixup: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    inst: usize,
    /// Position inside a `br_table`.
    slot: Option<usize>,
}

struct Lowerer<'a> {
    module: &'a TranslatedModule,
    func: CompiledFunction,
    frames: Vec<Frame>,
    height: u32,
    reachable: bool,
    /// Constructs opened while unreachable, skipped wholesale.
    unreachable_depth: u32,
    current_offset: u32,
}

impl<'a> Lowerer<'a> {
    fn new(
        module: &'a TranslatedModule,
        func_index: FuncIndex,
        locals: Vec<ValType>,
        results: u8,
    ) -> Self {
        Self {
            module,
            func: CompiledFunction {
                func_index,
                insts: Vec::new(),
                offsets: Vec::new(),
                locals,
                relocations: Vec::new(),
                max_height: 0,
                results,
            },
            frames: vec![Frame {
                kind: FrameKind::Function,
                height: 0,
                arity: results,
                start: 0,
                fixups: Vec::new(),
                else_fixup: None,
            }],
            height: 0,
            reachable: true,
            unreachable_depth: 0,
            current_offset: 0,
        }
    }

    fn ip(&self) -> u32 {
        u32::try_from(self.func.insts.len()).unwrap_or(u32::MAX)
    }

    fn emit(&mut self, inst: Inst) -> usize {
        self.func.insts.push(inst);
        self.func.offsets.push(self.current_offset);
        self.func.insts.len() - 1
    }

    fn emit_relocated(&mut self, inst: Inst, kind: RelocationKind) {
        let at = self.ip();
        self.emit(inst);
        self.func.relocations.push(Relocation { inst: at, kind });
    }

    fn push(&mut self, n: u32) {
        self.height += n;
        self.func.max_height = self.func.max_height.max(self.height);
    }

    fn pop(&mut self, n: u32) {
        self.height = self.height.saturating_sub(n);
    }

    fn push_frame(&mut self, kind: FrameKind, arity: u8, else_fixup: Option<usize>) {
        let start = self.ip();
        self.frames.push(Frame {
            kind,
            height: self.height,
            arity,
            start,
            fixups: Vec::new(),
            else_fixup,
        });
    }

    /// Resolves the label `depth` frames up. Forward labels record a fixup.
    fn branch_target(&mut self, depth: u32, inst: usize, slot: Option<usize>) -> Branch {
        let index = self.frames.len() - 1 - depth as usize;
        let frame = &mut self.frames[index];
        if frame.kind == FrameKind::Loop {
            Branch {
                ip: frame.start,
                height: frame.height,
                arity: 0,
            }
        } else {
            frame.fixups.push(Fixup { inst, slot });
            Branch {
                ip: Branch::PLACEHOLDER.ip,
                height: frame.height,
                arity: frame.arity,
            }
        }
    }

    fn patch(&mut self, fixup: Fixup, ip: u32) {
        match (&mut self.func.insts[fixup.inst], fixup.slot) {
            (Inst::Br(branch) | Inst::BrIf(branch) | Inst::BrIfEqz(branch), None) => {
                branch.ip = ip;
            }
            (Inst::BrTable(targets), Some(slot)) => targets[slot].ip = ip,
            (inst, _) => unreachable!("not a branch: {inst:?}"),
        }
    }

    fn lower_operator(&mut self, op: Operator<'_>) -> crate::Result<()> {
        if !self.reachable {
            match op {
                Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => {
                    self.unreachable_depth += 1;
                    return Ok(());
                }
                Operator::Else if self.unreachable_depth == 0 => {}
                Operator::End if self.unreachable_depth == 0 => {}
                Operator::End => {
                    self.unreachable_depth -= 1;
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }

        match op {
            Operator::Unreachable => {
                self.emit(Inst::Unreachable);
                self.reachable = false;
            }
            Operator::Nop => {}
            Operator::Block { blockty } => self.push_frame(FrameKind::Block, block_arity(blockty)?, None),
            Operator::Loop { blockty } => self.push_frame(FrameKind::Loop, block_arity(blockty)?, None),
            Operator::If { blockty } => {
                let arity = block_arity(blockty)?;
                self.pop(1);
                let at = self.emit(Inst::BrIfEqz(Branch {
                    height: self.height,
                    ..Branch::PLACEHOLDER
                }));
                self.push_frame(FrameKind::If, arity, Some(at));
            }
            Operator::Else => self.lower_else(),
            Operator::End => self.lower_end(),
            Operator::Br { relative_depth } => {
                let at = self.func.insts.len();
                let target = self.branch_target(relative_depth, at, None);
                self.emit(Inst::Br(target));
                self.reachable = false;
            }
            Operator::BrIf { relative_depth } => {
                self.pop(1);
                let at = self.func.insts.len();
                let target = self.branch_target(relative_depth, at, None);
                self.emit(Inst::BrIf(target));
            }
            Operator::BrTable { targets } => {
                self.pop(1);
                let at = self.func.insts.len();
                let depths = targets
                    .targets()
                    .chain(core::iter::once(Ok(targets.default())))
                    .collect::<Result<Vec<_>, _>>()?;
                let branches = depths
                    .into_iter()
                    .enumerate()
                    .map(|(slot, depth)| self.branch_target(depth, at, Some(slot)))
                    .collect();
                self.emit(Inst::BrTable(branches));
                self.reachable = false;
            }
            Operator::Return => {
                self.emit(Inst::Return);
                self.reachable = false;
            }
            Operator::Call { function_index } => {
                let func_index = FuncIndex::from_u32(function_index);
                let ty = self.module.func_type(func_index);
                let (params, results) = (ty.params().len(), ty.results().len());
                let params = u32::try_from(params).unwrap_or(u32::MAX);
                self.pop(params);
                self.push(u32::from(arity(results)?));
                self.emit_relocated(
                    Inst::Call {
                        func_index,
                        params,
                        target: None,
                    },
                    RelocationKind::DirectCall,
                );
            }
            Operator::CallIndirect {
                type_index,
                table_index,
            } => {
                let type_index = TypeIndex::from_u32(type_index);
                let table = TableIndex::from_u32(table_index);
                let ty = &self.module.types[type_index];
                let (params, results) = (ty.params().len(), ty.results().len());
                let params = u32::try_from(params).unwrap_or(u32::MAX);
                self.pop(params + 1);
                self.push(u32::from(arity(results)?));
                self.emit_relocated(
                    Inst::CallIndirect {
                        sig: self.module.sig_ids[type_index],
                        params,
                        table,
                        dispatch: None,
                    },
                    RelocationKind::Table(table),
                );
            }
            Operator::Drop => {
                self.pop(1);
                self.emit(Inst::Drop);
            }
            Operator::Select | Operator::TypedSelect { .. } => {
                self.pop(2);
                self.emit(Inst::Select);
            }
            Operator::LocalGet { local_index } => {
                self.push(1);
                self.emit(Inst::LocalGet(local_index));
            }
            Operator::LocalSet { local_index } => {
                self.pop(1);
                self.emit(Inst::LocalSet(local_index));
            }
            Operator::LocalTee { local_index } => {
                self.emit(Inst::LocalTee(local_index));
            }
            Operator::GlobalGet { global_index } => {
                let global = &self.module.globals[GlobalIndex::from_u32(global_index)];
                let (offset, ty) = (global.offset, global.ty.content_type);
                self.push(1);
                self.emit_relocated(
                    Inst::GlobalGet {
                        globals: None,
                        offset,
                        ty,
                    },
                    RelocationKind::Globals,
                );
            }
            Operator::GlobalSet { global_index } => {
                let offset = self.module.globals[GlobalIndex::from_u32(global_index)].offset;
                self.pop(1);
                self.emit_relocated(
                    Inst::GlobalSet {
                        globals: None,
                        offset,
                    },
                    RelocationKind::Globals,
                );
            }
            Operator::MemorySize { mem: 0, .. } => {
                self.push(1);
                self.emit_relocated(Inst::MemorySize(None), RelocationKind::Memory);
            }
            Operator::MemoryGrow { mem: 0, .. } => {
                self.emit_relocated(Inst::MemoryGrow(None), RelocationKind::Memory);
            }
            Operator::I32Const { value } => self.constant(Val::I32(value)),
            Operator::I64Const { value } => self.constant(Val::I64(value)),
            Operator::F32Const { value } => self.constant(Val::F32(value.bits())),
            Operator::F64Const { value } => self.constant(Val::F64(value.bits())),
            op => match Simple::from_operator(&op) {
                Some(Simple::Unary(op)) => {
                    self.emit(Inst::Unary(op));
                }
                Some(Simple::Binary(op)) => {
                    self.pop(1);
                    self.emit(Inst::Binary(op));
                }
                Some(Simple::Load(kind, offset)) => {
                    self.emit_relocated(
                        Inst::Load {
                            kind,
                            offset,
                            memory: None,
                        },
                        RelocationKind::Memory,
                    );
                }
                Some(Simple::Store(kind, offset)) => {
                    self.pop(2);
                    self.emit_relocated(
                        Inst::Store {
                            kind,
                            offset,
                            memory: None,
                        },
                        RelocationKind::Memory,
                    );
                }
                None => return Err(wasm_unsupported!("operator {op:?}")),
            },
        }

        Ok(())
    }

    fn constant(&mut self, val: Val) {
        self.push(1);
        self.emit(Inst::Const(val));
    }

    fn lower_else(&mut self) {
        let reachable = self.reachable;
        let at = self.func.insts.len();
        let Some(frame) = self.frames.last_mut() else {
            return;
        };

        let end_branch = Branch {
            ip: Branch::PLACEHOLDER.ip,
            height: frame.height,
            arity: frame.arity,
        };
        if reachable {
            frame.fixups.push(Fixup { inst: at, slot: None });
        }
        let else_fixup = frame.else_fixup.take();
        frame.kind = FrameKind::Else;
        self.height = frame.height;

        if reachable {
            self.emit(Inst::Br(end_branch));
        }
        if let Some(inst) = else_fixup {
            let ip = self.ip();
            self.patch(Fixup { inst, slot: None }, ip);
        }
        self.reachable = true;
    }

    fn lower_end(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };

        let end = self.ip();
        if let Some(inst) = frame.else_fixup {
            self.patch(Fixup { inst, slot: None }, end);
        }
        for fixup in frame.fixups {
            self.patch(fixup, end);
        }

        self.height = frame.height + u32::from(frame.arity);
        self.func.max_height = self.func.max_height.max(self.height);
        self.reachable = true;

        if frame.kind == FrameKind::Function {
            self.emit(Inst::Return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{ModuleTranslation, ModuleTranslator};
    use crate::types::SignatureRegistry;

    fn lower(wat: &str) -> CompiledFunction {
        let wasm = wat::parse_str(wat).unwrap();
        let registry = SignatureRegistry::default();
        let ModuleTranslation {
            module,
            function_bodies,
        } = ModuleTranslator::new(&registry).translate(&wasm).unwrap();
        let (index, body) = function_bodies.into_iter().next().unwrap();
        let mut validator = body.into_validator(Default::default());
        lower_function(&module, &wasm, module.func_index(index), Some(&mut validator)).unwrap()
    }

    #[test]
    fn resolves_block_and_loop_targets() {
        let func = lower(
            r#"(module (func (param i32) (result i32)
                (block (result i32)
                    (loop
                        local.get 0
                        br_if 0)
                    i32.const 7
                    br 0)))"#,
        );

        assert_eq!(
            func.insts,
            [
                Inst::LocalGet(0),
                Inst::BrIf(Branch {
                    ip: 0,
                    height: 0,
                    arity: 0
                }),
                Inst::Const(Val::I32(7)),
                Inst::Br(Branch {
                    ip: 4,
                    height: 0,
                    arity: 1
                }),
                Inst::Return,
            ]
        );
        assert_eq!(func.max_height, 1);
    }

    #[test]
    fn if_else_and_dead_code() {
        let func = lower(
            r#"(module (func (param i32) (result i32)
                local.get 0
                if (result i32)
                    i32.const 1
                    return
                    i32.const 5
                    drop
                else
                    i32.const 2
                end))"#,
        );

        assert_eq!(
            func.insts,
            [
                Inst::LocalGet(0),
                Inst::BrIfEqz(Branch {
                    ip: 4,
                    height: 0,
                    arity: 0
                }),
                Inst::Const(Val::I32(1)),
                Inst::Return,
                Inst::Const(Val::I32(2)),
                Inst::Return,
            ]
        );
    }

    #[test]
    fn records_relocations() {
        let func = lower(
            r#"(module
                (memory 1)
                (global (mut i32) (i32.const 0))
                (table 1 funcref)
                (type $t (func))
                (func
                    i32.const 0
                    i32.load offset=4
                    global.set 0
                    i32.const 0
                    call_indirect (type $t)
                    call 0))"#,
        );

        let kinds = func.relocations.iter().map(|r| r.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            [
                RelocationKind::Memory,
                RelocationKind::Globals,
                RelocationKind::Table(TableIndex::new(0)),
                RelocationKind::DirectCall,
            ]
        );
        assert_eq!(func.direct_calls().collect::<Vec<_>>(), [(5, FuncIndex::new(0))]);
    }
}
