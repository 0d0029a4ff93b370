// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::control_transfers::ControlTransferMap;
use crate::compile::body_reader;
use crate::indices::FuncIndex;
use crate::module::SharedModule;
use crate::types::ValType;
use core::ops::Range;
use std::sync::Arc;
use wasmparser::{BinaryReader, Operator};

/// Byte woven into a body copy at positions with an active breakpoint. It is
/// not a valid opcode, so it can never collide with real code.
pub(crate) const BREAKPOINT_OPCODE: u8 = 0xFF;

/// A function body prepared for interpretation.
#[derive(Debug, Clone)]
pub(crate) struct InterpreterCode {
    module: SharedModule,
    pub(crate) func_index: FuncIndex,
    /// Absolute range of the body in the wire bytes.
    body: Range<usize>,
    pub(crate) params: u32,
    pub(crate) results: u8,
    pub(crate) locals: Vec<ValType>,
    /// Where the instructions begin, after the local declarations.
    pub(crate) start: u32,
    pub(crate) targets: Arc<ControlTransferMap>,
    /// Body copy with breakpoints woven in, created on the first breakpoint.
    patched: Option<Box<[u8]>>,
}

impl InterpreterCode {
    fn new(module: &SharedModule, func_index: FuncIndex) -> crate::Result<Self> {
        let translated = module.translated();
        let body = translated.func_body(func_index).ok_or_else(|| {
            wasm_unsupported!("cannot interpret imported function {func_index:?}")
        })?;
        let mut reader = body_reader(module.wire_bytes(), &body);

        let mut locals = Vec::new();
        for _ in 0..reader.read_var_u32()? {
            let count = reader.read_var_u32()?;
            let ty = ValType::from_wasmparser(reader.read()?)?;
            locals.extend((0..count).map(|_| ty));
        }
        let start = reader.original_position() - body.start;
        let targets = ControlTransferMap::new(&module.wire_bytes()[body.clone()], start)?;

        let ty = translated.func_type(func_index);
        Ok(Self {
            module: module.clone(),
            func_index,
            params: u32::try_from(ty.params().len()).unwrap_or(u32::MAX),
            results: u8::from(ty.result().is_some()),
            locals,
            start: u32::try_from(start).unwrap_or(u32::MAX),
            targets: Arc::new(targets),
            body,
            patched: None,
        })
    }

    /// The unpatched body bytes.
    pub(crate) fn original(&self) -> &[u8] {
        &self.module.wire_bytes()[self.body.clone()]
    }

    /// Length of the body, execution finishes when reaching it.
    pub(crate) fn limit(&self) -> u32 {
        u32::try_from(self.body.len()).unwrap_or(u32::MAX)
    }

    pub(crate) fn is_breakpoint(&self, pc: u32) -> bool {
        self.patched
            .as_ref()
            .and_then(|bytes| bytes.get(pc as usize))
            .is_some_and(|byte| *byte == BREAKPOINT_OPCODE)
    }

    /// Decodes the instruction at `pc`, returning it with its length.
    pub(crate) fn decode(&self, pc: u32) -> crate::Result<(Operator<'_>, u32)> {
        let original = self.original();
        let mut reader = BinaryReader::new(&original[pc as usize..], pc as usize);
        let op = reader.read_operator()?;
        let len = reader.original_position() - pc as usize;
        Ok((op, u32::try_from(len).unwrap_or(u32::MAX)))
    }

    /// Position of the instruction following the one at `pc`.
    pub(crate) fn next_pc(&self, pc: u32) -> crate::Result<u32> {
        let (_, len) = self.decode(pc)?;
        Ok(pc + len)
    }

    /// Whether `pc` is the start of an instruction.
    pub(crate) fn is_instruction_start(&self, pc: u32) -> bool {
        self.instruction_starts().any(|start| start == pc)
    }

    /// Positions of every instruction of the body, in order.
    pub(crate) fn instruction_starts(&self) -> impl Iterator<Item = u32> + '_ {
        let mut pc = self.start;
        core::iter::from_fn(move || {
            if pc >= self.limit() {
                return None;
            }
            let current = pc;
            pc = self.next_pc(pc).ok()?;
            Some(current)
        })
    }

    fn set_breakpoint(&mut self, pc: u32, enabled: bool) -> bool {
        let original = self.original()[pc as usize];
        if self.patched.is_none() {
            self.patched = Some(self.original().into());
        }
        let Some(patched) = self.patched.as_mut() else {
            return false;
        };
        let was_enabled = patched[pc as usize] == BREAKPOINT_OPCODE;
        patched[pc as usize] = if enabled { BREAKPOINT_OPCODE } else { original };
        was_enabled
    }
}

/// Interpreter-ready bodies of one module's functions, prepared on first use.
#[derive(Debug)]
pub(crate) struct CodeMap {
    module: SharedModule,
    codes: Vec<Option<Arc<InterpreterCode>>>,
}

impl CodeMap {
    pub(crate) fn new(module: SharedModule) -> Self {
        let len = module.translated().num_functions();
        Self {
            module,
            codes: vec![None; len],
        }
    }

    pub(crate) fn module(&self) -> &SharedModule {
        &self.module
    }

    pub(crate) fn get(&mut self, func_index: FuncIndex) -> crate::Result<Arc<InterpreterCode>> {
        let slot = self
            .codes
            .get_mut(func_index.as_u32() as usize)
            .ok_or_else(|| wasm_unsupported!("function index out of range: {func_index:?}"))?;
        if let Some(code) = slot {
            return Ok(Arc::clone(code));
        }
        let code = Arc::new(InterpreterCode::new(&self.module, func_index)?);
        *slot = Some(Arc::clone(&code));
        Ok(code)
    }

    /// Enables or disables the breakpoint at `pc`, which must be the start
    /// of an instruction. Returns the previous state.
    pub(crate) fn set_breakpoint(
        &mut self,
        func_index: FuncIndex,
        pc: u32,
        enabled: bool,
    ) -> crate::Result<bool> {
        let code = self.get(func_index)?;
        if pc < code.start || pc >= code.limit() || !code.is_instruction_start(pc) {
            return Err(crate::Error::Range(format!(
                "no instruction at offset {pc} in function #{}",
                func_index.as_u32()
            )));
        }
        drop(code);
        let slot = self.codes[func_index.as_u32() as usize]
            .as_mut()
            .ok_or_else(|| wasm_unsupported!("function index out of range: {func_index:?}"))?;
        Ok(Arc::make_mut(slot).set_breakpoint(pc, enabled))
    }

    #[cfg(test)]
    pub(crate) fn get_breakpoint(&self, func_index: FuncIndex, pc: u32) -> bool {
        self.codes
            .get(func_index.as_u32() as usize)
            .and_then(Option::as_ref)
            .is_some_and(|code| code.is_breakpoint(pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::module::Module;

    fn module(wat: &str) -> SharedModule {
        let engine = Engine::default();
        let bytes = wat::parse_str(wat).unwrap();
        let (shared, _) = Module::translate(&engine, &bytes).unwrap();
        shared
    }

    #[test]
    fn prepares_bodies_lazily() {
        let module = module(
            r#"(module
                (func $a (param i32) (result i32) (local i64 f32)
                    local.get 0)
                (func $b nop))"#,
        );
        let mut map = CodeMap::new(module);
        let a = map.get(FuncIndex::from_u32(0)).unwrap();
        assert_eq!(a.params, 1);
        assert_eq!(a.results, 1);
        assert_eq!(a.locals, vec![ValType::I64, ValType::F32]);
        // local.get 0, end
        assert_eq!(a.instruction_starts().count(), 2);
        assert!(Arc::ptr_eq(&a, &map.get(FuncIndex::from_u32(0)).unwrap()));
    }

    #[test]
    fn breakpoints_patch_a_copy() {
        let module = module("(module (func nop nop))");
        let mut map = CodeMap::new(module);
        let f = FuncIndex::from_u32(0);
        let start = map.get(f).unwrap().start;

        assert!(!map.set_breakpoint(f, start + 1, true).unwrap());
        assert!(map.get_breakpoint(f, start + 1));
        let code = map.get(f).unwrap();
        assert_eq!(code.original()[start as usize + 1], 0x01);
        assert!(matches!(code.decode(start + 1).unwrap().0, Operator::Nop));

        assert!(map.set_breakpoint(f, start + 1, false).unwrap());
        assert!(!map.get_breakpoint(f, start + 1));
        // local declarations are not instructions
        assert!(map.set_breakpoint(f, 0, true).is_err());
    }
}
