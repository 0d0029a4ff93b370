// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Execution state of the interpreter.
//!
//! The thread owns one value stack shared by all frames. A frame's parameters
//! and locals sit at the bottom of its section of the stack, starting at
//! `Frame::sp`. Every entry into the interpreter from outside starts an
//! activation, which lets host and lowered code call back into it while an
//! outer activation is suspended on an external call.

#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    reason = "i32 operands are reinterpreted as table indices and page counts"
)]

use super::code_map::{CodeMap, InterpreterCode};
use crate::code::{Code, CodeAddr};
use crate::indices::{FuncIndex, GlobalIndex, TypeIndex};
use crate::instance::Instance;
use crate::ops::{self, Simple};
use crate::store::Store;
use crate::trap::Trap;
use crate::values::Val;
use bitflags::bitflags;
use cranelift_entity::EntityRef;
use std::sync::Arc;
use wasmparser::{BlockType, Operator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Stopped,
    Running,
    Paused,
    Finished,
    Trapped,
}

bitflags! {
    /// Conditions under which a running thread pauses on its own.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BreakFlags: u8 {
        /// After a function returns into an interpreted caller.
        const AFTER_RETURN = 1 << 0;
        /// After entering an interpreted callee.
        const AFTER_CALL = 1 << 1;
    }
}

/// Why [`Thread::run`] handed control back.
#[derive(Debug)]
pub(crate) enum Exit {
    Finished,
    Paused,
    /// See [`Thread::trap_reason`].
    Trapped,
    /// The thread is suspended on a call leaving the interpreter. Resume it
    /// with [`Thread::complete_external_call`].
    Call { target: CodeAddr, args: Vec<Val> },
}

/// What the thread runs against.
pub(crate) struct Context<'a> {
    pub(crate) store: &'a mut Store,
    pub(crate) instance: Instance,
    pub(crate) codes: &'a mut CodeMap,
}

#[derive(Debug, Clone)]
struct Frame {
    func_index: FuncIndex,
    /// Where execution continues once this frame is on top again.
    pc: u32,
    /// Stack index of the first parameter.
    sp: usize,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    /// Stack height at entry, branches unwind to it.
    sp: usize,
    /// Number of frames, the owning one included.
    fp: usize,
    /// Values carried by a branch to this block.
    arity: u8,
}

#[derive(Debug, Clone, Copy)]
struct Activation {
    fp: usize,
    sp: usize,
}

#[derive(Debug)]
pub(crate) struct Thread {
    state: ThreadState,
    stack: Vec<Val>,
    frames: Vec<Frame>,
    blocks: Vec<Block>,
    activations: Vec<Activation>,
    /// Breakpoint the thread is paused at, skipped once when resuming.
    break_pc: Option<u32>,
    break_flags: BreakFlags,
    trap_reason: Option<Trap>,
    max_frames: usize,
}

impl Thread {
    pub(crate) fn new(max_frames: usize) -> Self {
        Self {
            state: ThreadState::Stopped,
            stack: Vec::new(),
            frames: Vec::new(),
            blocks: Vec::new(),
            activations: Vec::new(),
            break_pc: None,
            break_flags: BreakFlags::empty(),
            trap_reason: None,
            max_frames,
        }
    }

    pub(crate) fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn break_pc(&self) -> Option<u32> {
        self.break_pc
    }

    pub(crate) fn trap_reason(&self) -> Option<Trap> {
        self.trap_reason
    }

    pub(crate) fn set_break_flags(&mut self, flags: BreakFlags) {
        self.break_flags = flags;
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Frames belonging to the innermost activation.
    pub(crate) fn activation_frame_count(&self) -> usize {
        self.frames.len() - self.activation_base().fp
    }

    /// Function and position of the topmost frame.
    pub(crate) fn location(&self) -> Option<(FuncIndex, u32)> {
        self.frames.last().map(|frame| (frame.func_index, frame.pc))
    }

    pub(crate) fn start_activation(&mut self) -> usize {
        self.activations.push(Activation {
            fp: self.frames.len(),
            sp: self.stack.len(),
        });
        self.state = ThreadState::Stopped;
        self.activations.len() - 1
    }

    /// Drops everything the activation left on the stack.
    pub(crate) fn finish_activation(&mut self, id: usize) {
        debug_assert_eq!(id + 1, self.activations.len(), "activations finish in order");
        if let Some(activation) = self.activations.pop() {
            self.unwind_to(activation);
        }
        self.break_pc = None;
        self.state = if self.activations.is_empty() {
            ThreadState::Stopped
        } else {
            // the outer activation is suspended on the call that got us here
            ThreadState::Running
        };
    }

    /// Unwinds the frames of the current activation after a trap or a
    /// failed external call.
    pub(crate) fn handle_exception(&mut self) {
        let activation = self.activation_base();
        self.unwind_to(activation);
        self.state = ThreadState::Stopped;
    }

    fn unwind_to(&mut self, activation: Activation) {
        self.frames.truncate(activation.fp);
        self.blocks.retain(|block| block.fp <= activation.fp);
        self.stack.truncate(activation.sp);
    }

    fn activation_base(&self) -> Activation {
        self.activations
            .last()
            .copied()
            .unwrap_or(Activation { fp: 0, sp: 0 })
    }

    /// Pushes `args` and the frame for `func_index`.
    pub(crate) fn init_frame(
        &mut self,
        codes: &mut CodeMap,
        func_index: FuncIndex,
        args: &[Val],
    ) -> crate::Result<()> {
        self.stack.extend_from_slice(args);
        self.push_frame(codes, func_index)
    }

    /// The value the finished activation returned, if any.
    pub(crate) fn get_return_value(&self) -> Option<Val> {
        let base = self.activation_base().sp;
        self.stack.get(base).copied()
    }

    /// Resumes after an external call returned `result`.
    pub(crate) fn complete_external_call(&mut self, result: Option<Val>) {
        if let Some(val) = result {
            self.stack.push(val);
        }
    }

    fn push_frame(&mut self, codes: &mut CodeMap, func_index: FuncIndex) -> crate::Result<()> {
        let code = codes.get(func_index)?;
        let sp = self.stack.len().saturating_sub(code.params as usize);
        self.stack
            .extend(code.locals.iter().map(|ty| Val::default_for_ty(*ty)));
        self.frames.push(Frame {
            func_index,
            pc: code.start,
            sp,
        });
        self.blocks.push(Block {
            sp: self.stack.len(),
            fp: self.frames.len(),
            arity: code.results,
        });
        Ok(())
    }

    /// Pops the top frame, moving its results to where its parameters were.
    /// Returns `false` once the activation has no frames left.
    fn do_return(&mut self, arity: u8) -> bool {
        let Some(frame) = self.frames.pop() else {
            return false;
        };
        let fp = self.frames.len();
        while self.blocks.last().is_some_and(|block| block.fp > fp) {
            self.blocks.pop();
        }
        self.stack_transfer(frame.sp, arity);
        fp > self.activation_base().fp
    }

    /// Leaves `depth + 1` blocks and returns the position to continue at.
    fn do_break(&mut self, code: &InterpreterCode, key: u32, depth: u32) -> Option<u32> {
        let index = self.blocks.len().checked_sub(depth as usize + 1)?;
        let target = self.blocks[index];
        self.stack_transfer(target.sp, target.arity);
        self.blocks.truncate(index);
        code.targets.target(key)
    }

    /// Moves the top `arity` values down to `dest` and drops everything in
    /// between.
    fn stack_transfer(&mut self, dest: usize, arity: u8) {
        let keep = usize::from(arity);
        let top = self.stack.len().saturating_sub(keep);
        if top > dest {
            self.stack.drain(dest..top);
        }
    }

    /// Executes a single instruction.
    pub(crate) fn step(&mut self, cx: &mut Context<'_>) -> crate::Result<Exit> {
        self.run(cx, Some(1))
    }

    /// Runs until the activation finishes, traps, leaves the interpreter or
    /// pauses. With `steps` set the thread pauses after that many
    /// instructions.
    pub(crate) fn run(&mut self, cx: &mut Context<'_>, mut steps: Option<u32>) -> crate::Result<Exit> {
        let Some(frame) = self.frames.last() else {
            self.state = ThreadState::Finished;
            return Ok(Exit::Finished);
        };
        self.state = ThreadState::Running;
        self.trap_reason = None;

        let mut code = cx.codes.get(frame.func_index)?;
        let mut pc = frame.pc;
        let mut sp = frame.sp;

        macro_rules! commit {
            ($pc:expr) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.pc = $pc;
                }
            };
        }
        macro_rules! reload {
            () => {
                let Some(frame) = self.frames.last() else {
                    self.state = ThreadState::Finished;
                    return Ok(Exit::Finished);
                };
                code = cx.codes.get(frame.func_index)?;
                pc = frame.pc;
                sp = frame.sp;
            };
        }
        macro_rules! trap {
            ($trap:expr) => {{
                commit!(pc);
                self.state = ThreadState::Trapped;
                self.trap_reason = Some($trap);
                return Ok(Exit::Trapped);
            }};
        }
        macro_rules! pause {
            () => {{
                commit!(pc);
                self.state = ThreadState::Paused;
                return Ok(Exit::Paused);
            }};
        }
        macro_rules! pop {
            () => {
                match self.stack.pop() {
                    Some(val) => val,
                    None => trap!(Trap::UnreachableCodeReached),
                }
            };
        }
        macro_rules! pop_i32 {
            () => {
                match pop!() {
                    Val::I32(v) => v,
                    _ => trap!(Trap::UnreachableCodeReached),
                }
            };
        }
        macro_rules! try_op {
            ($e:expr) => {
                match $e {
                    Ok(val) => val,
                    Err(trap) => trap!(trap),
                }
            };
        }
        macro_rules! branch {
            ($key:expr, $depth:expr) => {
                match self.do_break(&code, $key, $depth) {
                    Some(target) => pc = target,
                    None => trap!(Trap::UnreachableCodeReached),
                }
            };
        }

        loop {
            if pc >= code.limit() {
                if !self.do_return(code.results) {
                    self.state = ThreadState::Finished;
                    return Ok(Exit::Finished);
                }
                reload!();
                if self.break_flags.contains(BreakFlags::AFTER_RETURN) {
                    pause!();
                }
                continue;
            }

            // a breakpoint pauses before the step budget is charged
            if code.is_breakpoint(pc) && self.break_pc != Some(pc) {
                self.break_pc = Some(pc);
                pause!();
            }

            if let Some(remaining) = steps.as_mut() {
                if *remaining == 0 {
                    pause!();
                }
                *remaining -= 1;
            }
            if self.break_pc == Some(pc) {
                self.break_pc = None;
            }

            let current = Arc::clone(&code);
            let (op, len) = current.decode(pc)?;
            let next = pc + len;

            if let Some(simple) = Simple::from_operator(&op) {
                match self.simple(cx, simple) {
                    Ok(()) => {}
                    Err(trap) => trap!(trap),
                }
                pc = next;
                continue;
            }

            match op {
                Operator::Unreachable => trap!(Trap::UnreachableCodeReached),
                Operator::Nop => pc = next,
                Operator::Block { blockty } => {
                    self.push_block(block_arity(blockty));
                    pc = next;
                }
                Operator::Loop { .. } => {
                    self.push_block(0);
                    pc = next;
                }
                Operator::If { blockty } => {
                    let cond = pop_i32!();
                    self.push_block(block_arity(blockty));
                    if cond != 0 {
                        pc = next;
                    } else {
                        match code.targets.target(pc) {
                            Some(target) => pc = target,
                            None => trap!(Trap::UnreachableCodeReached),
                        }
                    }
                }
                Operator::Else => {
                    self.blocks.pop();
                    match code.targets.target(pc) {
                        Some(target) => pc = target,
                        None => trap!(Trap::UnreachableCodeReached),
                    }
                }
                Operator::End => {
                    self.blocks.pop();
                    pc = next;
                }
                Operator::Br { relative_depth } => branch!(pc, relative_depth),
                Operator::BrIf { relative_depth } => {
                    if pop_i32!() != 0 {
                        branch!(pc, relative_depth);
                    } else {
                        pc = next;
                    }
                }
                Operator::BrTable { targets } => {
                    let index = pop_i32!() as u32;
                    let entry = index.min(targets.len());
                    let depth = match targets.targets().nth(entry as usize) {
                        Some(depth) => depth?,
                        None => targets.default(),
                    };
                    branch!(pc + entry, depth);
                }
                Operator::Return => {
                    if !self.do_return(code.results) {
                        self.state = ThreadState::Finished;
                        return Ok(Exit::Finished);
                    }
                    reload!();
                    if self.break_flags.contains(BreakFlags::AFTER_RETURN) {
                        pause!();
                    }
                }
                Operator::Call { function_index } => {
                    let callee = FuncIndex::from_u32(function_index);
                    let module = cx.codes.module();
                    if module.translated().is_imported_function(callee) {
                        let params = module.translated().func_type(callee).params().len();
                        let compiled = cx.store[cx.instance.0].compiled_module;
                        let target = cx.store[compiled.0].code_table[callee.index()];
                        commit!(next);
                        let args = self.stack.split_off(self.stack.len().saturating_sub(params));
                        return Ok(Exit::Call { target, args });
                    }
                    if self.frames.len() >= self.max_frames {
                        trap!(Trap::StackOverflow);
                    }
                    commit!(next);
                    self.push_frame(cx.codes, callee)?;
                    reload!();
                    if self.break_flags.contains(BreakFlags::AFTER_CALL) {
                        pause!();
                    }
                }
                Operator::CallIndirect {
                    type_index,
                    table_index,
                } => {
                    let index = pop_i32!() as u32;
                    let translated = cx.codes.module().translated();
                    let type_index = TypeIndex::from_u32(type_index);
                    let sig = translated.sig_ids[type_index];
                    let params = translated.types[type_index].params().len();

                    let data = &cx.store[cx.instance.0];
                    let Some(dispatch) = data.tables.get(table_index as usize).map(|t| t.dispatch)
                    else {
                        trap!(Trap::InvalidFunction)
                    };
                    let Some((target, actual)) =
                        cx.store.dispatch_table(dispatch).and_then(|table| table.get(index))
                    else {
                        trap!(Trap::InvalidFunction)
                    };
                    if actual != sig {
                        trap!(Trap::SignatureMismatch);
                    }

                    match self.in_place_target(cx, target) {
                        Some(callee) => {
                            if self.frames.len() >= self.max_frames {
                                trap!(Trap::StackOverflow);
                            }
                            commit!(next);
                            self.push_frame(cx.codes, callee)?;
                            reload!();
                            if self.break_flags.contains(BreakFlags::AFTER_CALL) {
                                pause!();
                            }
                        }
                        None => {
                            commit!(next);
                            let args =
                                self.stack.split_off(self.stack.len().saturating_sub(params));
                            return Ok(Exit::Call { target, args });
                        }
                    }
                }
                Operator::Drop => {
                    pop!();
                    pc = next;
                }
                Operator::Select | Operator::TypedSelect { .. } => {
                    let cond = pop_i32!();
                    let rhs = pop!();
                    let lhs = pop!();
                    self.stack.push(if cond != 0 { lhs } else { rhs });
                    pc = next;
                }
                Operator::LocalGet { local_index } => {
                    let Some(val) = self.stack.get(sp + local_index as usize).copied() else {
                        trap!(Trap::UnreachableCodeReached)
                    };
                    self.stack.push(val);
                    pc = next;
                }
                Operator::LocalSet { local_index } => {
                    let val = pop!();
                    self.stack[sp + local_index as usize] = val;
                    pc = next;
                }
                Operator::LocalTee { local_index } => {
                    let Some(val) = self.stack.last().copied() else {
                        trap!(Trap::UnreachableCodeReached)
                    };
                    self.stack[sp + local_index as usize] = val;
                    pc = next;
                }
                Operator::GlobalGet { global_index } => {
                    let global = &cx.codes.module().translated().globals
                        [GlobalIndex::from_u32(global_index)];
                    let (offset, ty) = (global.offset, global.ty.content_type);
                    let val = cx.store[cx.instance.0]
                        .globals
                        .and_then(|globals| cx.store.globals(globals))
                        .and_then(|buffer| buffer.read(offset, ty));
                    match val {
                        Some(val) => self.stack.push(val),
                        None => trap!(Trap::MemoryOutOfBounds),
                    }
                    pc = next;
                }
                Operator::GlobalSet { global_index } => {
                    let offset = cx.codes.module().translated().globals
                        [GlobalIndex::from_u32(global_index)]
                    .offset;
                    let val = pop!();
                    let globals = cx.store[cx.instance.0].globals;
                    let written = globals
                        .and_then(|globals| cx.store.globals_mut(globals))
                        .is_some_and(|buffer| buffer.write(offset, val));
                    if !written {
                        trap!(Trap::MemoryOutOfBounds);
                    }
                    pc = next;
                }
                Operator::MemorySize { .. } => {
                    let pages = cx.store[cx.instance.0]
                        .memory
                        .and_then(|memory| cx.store.memory(memory.0))
                        .map_or(0, |data| data.pages());
                    self.stack.push(Val::I32(pages as i32));
                    pc = next;
                }
                Operator::MemoryGrow { .. } => {
                    let delta = pop_i32!() as u32;
                    let memory = cx.store[cx.instance.0].memory;
                    let old = memory.and_then(|memory| memory.grow_pages(cx.store, delta));
                    self.stack
                        .push(Val::I32(old.map_or(-1, |pages| pages as i32)));
                    pc = next;
                }
                Operator::I32Const { value } => {
                    self.stack.push(Val::I32(value));
                    pc = next;
                }
                Operator::I64Const { value } => {
                    self.stack.push(Val::I64(value));
                    pc = next;
                }
                Operator::F32Const { value } => {
                    self.stack.push(Val::F32(value.bits()));
                    pc = next;
                }
                Operator::F64Const { value } => {
                    self.stack.push(Val::F64(value.bits()));
                    pc = next;
                }
                other => {
                    return Err(wasm_unsupported!("interpreting {other:?}"));
                }
            }
        }
    }

    fn push_block(&mut self, arity: u8) {
        self.blocks.push(Block {
            sp: self.stack.len(),
            fp: self.frames.len(),
            arity,
        });
    }

    /// Executes a numeric or memory access instruction.
    fn simple(&mut self, cx: &mut Context<'_>, simple: Simple) -> Result<(), Trap> {
        let memory = cx.store[cx.instance.0].memory;
        let mut pop = || self.stack.pop().ok_or(Trap::UnreachableCodeReached);
        let result = match simple {
            Simple::Unary(op) => Some(ops::unary(op, pop()?)?),
            Simple::Binary(op) => {
                let rhs = pop()?;
                let lhs = pop()?;
                Some(ops::binary(op, lhs, rhs)?)
            }
            Simple::Load(kind, offset) => {
                let addr = pop()?;
                let bytes = memory
                    .and_then(|memory| cx.store.memory(memory.0))
                    .map_or(&[][..], |data| data.bytes());
                Some(ops::load(kind, bytes, addr, offset)?)
            }
            Simple::Store(kind, offset) => {
                let val = pop()?;
                let addr = pop()?;
                let mut empty = [];
                let bytes = match memory.and_then(|memory| cx.store.memory_mut(memory.0)) {
                    Some(data) => data.bytes_mut(),
                    None => &mut empty[..],
                };
                ops::store(kind, bytes, addr, offset, val)?;
                None
            }
        };
        if let Some(val) = result {
            self.stack.push(val);
        }
        Ok(())
    }

    /// The function to run in this thread for a call through `target`, if
    /// it is one of this module's defined functions.
    fn in_place_target(&self, cx: &Context<'_>, target: CodeAddr) -> Option<FuncIndex> {
        let compiled = cx.store[cx.instance.0].compiled_module;
        let translated = cx.codes.module().translated();
        let func_index = match &cx.store[target] {
            Code::Interpreted {
                instance,
                func_index,
            } => (*instance == cx.instance).then_some(*func_index)?,
            other => match other.owner() {
                Some((module, func_index)) if module == compiled => func_index,
                _ => return None,
            },
        };
        (!translated.is_imported_function(func_index)).then_some(func_index)
    }
}

fn block_arity(blockty: BlockType) -> u8 {
    match blockty {
        BlockType::Empty => 0,
        BlockType::Type(_) | BlockType::FuncType(_) => 1,
    }
}
