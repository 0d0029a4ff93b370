// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bytecode interpreter.
//!
//! Interprets function bodies straight from the wire bytes, using a
//! precomputed control transfer map per function for branches. Each
//! instance has at most one interpreter, created the first time one of its
//! functions is redirected to it. Unlike lowered code the interpreter can
//! pause, so breakpoints and stepping are implemented here.

mod code_map;
mod control_transfers;
mod thread;

use crate::code::{Code, CodeAddr, Inst};
use crate::debug::{Location, PauseInfo, PauseReason, StepAction};
use crate::errors::Error;
use crate::indices::FuncIndex;
use crate::instance::Instance;
use crate::machine;
use crate::lazy::LazyCaller;
use crate::module::SharedModule;
use crate::store::Store;
use crate::trap::Trap;
use crate::values::Val;
use cranelift_entity::EntityRef;
use hashbrown::HashMap;
use std::sync::Arc;

use code_map::CodeMap;
use thread::{BreakFlags, Context, Exit, Thread};
pub use thread::ThreadState;

#[derive(Debug)]
pub(crate) struct Interpreter {
    codes: CodeMap,
    thread: Thread,
}

impl Interpreter {
    /// Creates the interpreter with every breakpoint recorded on `module`
    /// already set.
    pub(crate) fn new(module: SharedModule, max_frames: usize) -> crate::Result<Self> {
        let breakpoints = module.breakpoints();
        let mut codes = CodeMap::new(module);
        for (func_index, offset) in breakpoints {
            codes.set_breakpoint(func_index, offset, true)?;
        }
        Ok(Self {
            codes,
            thread: Thread::new(max_frames),
        })
    }

    pub(crate) fn thread_state(&self) -> ThreadState {
        self.thread.state()
    }
}

/// Offsets of every instruction in the body of `func_index`.
pub(crate) fn instruction_starts(
    module: &SharedModule,
    func_index: FuncIndex,
) -> crate::Result<Vec<u32>> {
    let mut codes = CodeMap::new(module.clone());
    let code = codes.get(func_index)?;
    Ok(code.instruction_starts().collect())
}

fn disposed() -> Error {
    Error::Type("instance has been disposed".to_string())
}

/// Runs `f` with the interpreter of `instance` moved out of the store, so
/// that it can run against the store. The interpreter is created on first
/// use.
fn with_interpreter<R>(
    store: &mut Store,
    instance: Instance,
    f: impl FnOnce(&mut Interpreter, &mut Store) -> R,
) -> crate::Result<R> {
    let data = store.instance_mut(instance.0).ok_or_else(disposed)?;
    let compiled = data.compiled_module;
    let mut interpreter = match data.interpreter.take() {
        Some(interpreter) => interpreter,
        None => {
            let shared = store[compiled.0].shared.clone();
            let max_frames = store.engine().config().max_interpreted_stack;
            Box::new(Interpreter::new(shared, max_frames)?)
        }
    };

    let result = f(&mut interpreter, store);

    let data = store.instance_mut(instance.0).ok_or_else(disposed)?;
    data.interpreter = Some(interpreter);
    Ok(result)
}

/// Calls `func_index` of `instance` in its interpreter.
pub(crate) fn call_interpreted(
    store: &mut Store,
    instance: Instance,
    func_index: FuncIndex,
    args: &[Val],
) -> crate::Result<Option<Val>> {
    tracing::trace!("interpreting #{}", func_index.index());
    let activation = with_interpreter(store, instance, |interpreter, _| {
        let activation = interpreter.thread.start_activation();
        interpreter
            .thread
            .init_frame(&mut interpreter.codes, func_index, args)
            .map(|()| activation)
    })??;

    let result = drive(store, instance);

    with_interpreter(store, instance, |interpreter, _| {
        let value = match result {
            Ok(()) => Ok(interpreter.thread.get_return_value()),
            Err(err) => {
                interpreter.thread.handle_exception();
                Err(err)
            }
        };
        interpreter.thread.finish_activation(activation);
        value
    })?
}

/// How the current activation is being run.
#[derive(Debug, Clone, Copy)]
enum Mode {
    Run,
    StepIn,
    /// Stepping without descending below `depth` frames.
    StepOver { depth: usize },
    /// Running until fewer than `depth` frames are left.
    StepOut { depth: usize },
}

impl Mode {
    fn new(action: StepAction, depth: usize) -> Self {
        match action {
            StepAction::Continue => Self::Run,
            StepAction::StepIn => Self::StepIn,
            StepAction::StepOver => Self::StepOver { depth },
            StepAction::StepOut => Self::StepOut { depth },
        }
    }

    fn single_step(self) -> bool {
        matches!(self, Self::StepIn | Self::StepOver { .. })
    }

    fn break_flags(self) -> BreakFlags {
        match self {
            Self::StepIn => BreakFlags::AFTER_CALL,
            Self::StepOut { .. } => BreakFlags::AFTER_RETURN,
            Self::Run | Self::StepOver { .. } => BreakFlags::empty(),
        }
    }

    /// Whether a completed step at `depth` frames should be reported.
    fn reports(self, depth: usize) -> bool {
        match self {
            Self::Run | Self::StepIn => true,
            Self::StepOver { depth: limit } => depth <= limit,
            Self::StepOut { depth: limit } => depth < limit,
        }
    }
}

fn drive(store: &mut Store, instance: Instance) -> crate::Result<()> {
    let mut mode = Mode::Run;
    // the external call just completed counts as the step
    let mut step_taken = false;

    loop {
        let pause_now = core::mem::take(&mut step_taken);
        let (exit, location, depth, frame_count, trap, at_breakpoint) =
            with_interpreter(store, instance, |interpreter, store| {
                interpreter.thread.set_break_flags(mode.break_flags());
                let mut cx = Context {
                    store,
                    instance,
                    codes: &mut interpreter.codes,
                };
                let exit = if pause_now {
                    interpreter.thread.run(&mut cx, Some(0))
                } else if mode.single_step() {
                    interpreter.thread.step(&mut cx)
                } else {
                    interpreter.thread.run(&mut cx, None)
                };
                let location = interpreter.thread.location();
                let at_breakpoint = location
                    .is_some_and(|(_, pc)| interpreter.thread.break_pc() == Some(pc));
                let depth = interpreter.thread.activation_frame_count();
                let frame_count = interpreter.thread.frame_count();
                let trap = interpreter.thread.trap_reason();
                (exit, location, depth, frame_count, trap, at_breakpoint)
            })?;

        match exit? {
            Exit::Finished => return Ok(()),
            Exit::Trapped => {
                let trap = trap.unwrap_or(Trap::UnreachableCodeReached);
                let (func_index, pc) = location.unwrap_or((FuncIndex::new(0), 0));
                return Err(Error::trap_in(trap, func_index, pc as usize));
            }
            Exit::Call { target, args } => {
                let result = machine::call(store, target, &args, LazyCaller::External)?;
                with_interpreter(store, instance, |interpreter, _| {
                    interpreter.thread.complete_external_call(result);
                })?;
                step_taken = !matches!(mode, Mode::Run | Mode::StepOut { .. });
            }
            Exit::Paused => {
                let Some((func_index, offset)) = location else {
                    continue;
                };
                let reason = if at_breakpoint {
                    PauseReason::Breakpoint
                } else {
                    PauseReason::Step
                };
                if reason == PauseReason::Step && !mode.reports(depth) {
                    continue;
                }

                let info = PauseInfo {
                    instance,
                    location: Location { func_index, offset },
                    reason,
                    frame_count,
                };
                tracing::debug!("paused: {info:?}");
                let action = match store.take_debug_delegate() {
                    Some(mut delegate) => {
                        let action = delegate.on_pause(store, &info);
                        store.restore_debug_delegate(Some(delegate));
                        action
                    }
                    None => StepAction::Continue,
                };
                mode = Mode::new(action, depth);
            }
        }
    }
}

/// Points every defined function of `instance` at its interpreter.
///
/// Updates the code table, the export wrappers, the instance's dispatch
/// tables and direct calls in lowered code of the module.
pub(crate) fn redirect_to_interpreter(store: &mut Store, instance: Instance) -> crate::Result<()> {
    let data = store.instance(instance.0).ok_or_else(disposed)?;
    let compiled = data.compiled_module;
    let dispatch: Vec<_> = data.tables.iter().map(|table| table.dispatch).collect();
    // make sure breakpoints are in place before anything can run
    with_interpreter(store, instance, |_, _| ())?;

    let functions: Vec<FuncIndex> = store[compiled.0]
        .shared
        .translated()
        .defined_functions()
        .collect();

    let mut redirected: HashMap<FuncIndex, CodeAddr> = HashMap::new();
    let mut displaced = Vec::new();
    for func_index in functions {
        let old = store[compiled.0].code_table[func_index.index()];
        if matches!(store[old], Code::Interpreted { .. }) {
            continue;
        }
        let new = store.add_code(Code::Interpreted {
            instance,
            func_index,
        });
        store[compiled.0].code_table[func_index.index()] = new;
        compiled.set_wrapper_target(store, func_index, new);
        if old != store.lazy_stub() {
            for table in &dispatch {
                if let Some(table) = store.dispatch_table_mut(*table) {
                    table.replace_code(old, new);
                }
            }
        }
        if matches!(&store[old], Code::Function { module: Some(owner), .. } if *owner == compiled) {
            displaced.push(old);
        }
        redirected.insert(func_index, new);
    }

    for addr in displaced {
        if let Some(Code::Function { func, .. }) = store.code_mut(addr) {
            let func = Arc::make_mut(func);
            for inst in &mut func.insts {
                if let Inst::Call {
                    func_index, target, ..
                } = inst
                    && let Some(new) = redirected.get(func_index)
                {
                    *target = Some(*new);
                }
            }
        }
    }

    tracing::debug!(
        "redirected {} functions of {instance:?} to the interpreter",
        redirected.len()
    );
    Ok(())
}

pub(crate) fn set_breakpoint(
    store: &mut Store,
    instance: Instance,
    location: Location,
) -> crate::Result<()> {
    with_interpreter(store, instance, |interpreter, _| {
        interpreter
            .codes
            .set_breakpoint(location.func_index, location.offset, true)
            .map(|_| ())
    })?
}

/// State of the interpreter of `instance`, `None` if it has none.
pub(crate) fn thread_state(store: &Store, instance: Instance) -> Option<ThreadState> {
    store
        .instance(instance.0)?
        .interpreter
        .as_ref()
        .map(|interpreter| interpreter.thread_state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Config, Engine};
    use crate::linker::Linker;
    use crate::module::Module;
    use crate::types::{FuncType, ValType};
    use crate::{Error, ErrorKind};

    fn interpreted_engine(max_frames: usize) -> Engine {
        let mut config = Config::new();
        config.interpret_all(true).max_interpreted_stack(max_frames);
        Engine::new(config)
    }

    fn instantiate(store: &mut Store, wat: &str, linker: Option<&Linker>) -> Instance {
        let bytes = wat::parse_str(wat).unwrap();
        let module = Module::new(store, &bytes).unwrap();
        Instance::new(store, module, linker).unwrap()
    }

    fn call(store: &mut Store, instance: Instance, name: &str, args: &[Val]) -> crate::Result<Option<Val>> {
        instance.get_func(store, name).unwrap().call(store, args)
    }

    const CONTROL: &str = r#"
        (module
            (func $fac (export "fac") (param i64) (result i64)
                local.get 0
                i64.eqz
                if (result i64)
                    i64.const 1
                else
                    local.get 0
                    local.get 0
                    i64.const 1
                    i64.sub
                    call $fac
                    i64.mul
                end)
            (func (export "sum") (param i32) (result i32) (local i32)
                block
                    loop
                        local.get 0
                        i32.eqz
                        br_if 1
                        local.get 1
                        local.get 0
                        i32.add
                        local.set 1
                        local.get 0
                        i32.const 1
                        i32.sub
                        local.set 0
                        br 0
                    end
                end
                local.get 1)
            (func (export "classify") (param i32) (result i32)
                block
                    block
                        block
                            local.get 0
                            br_table 0 1 2
                        end
                        i32.const 10
                        return
                    end
                    i32.const 20
                    return
                end
                i32.const 30))
    "#;

    #[test_log::test]
    fn control_flow() {
        let mut store = Store::new(&interpreted_engine(1024));
        let instance = instantiate(&mut store, CONTROL, None);

        // the fac export takes an i64, which only works from the inside
        let sum = call(&mut store, instance, "sum", &[Val::I32(10)]).unwrap();
        assert_eq!(sum, Some(Val::I32(55)));

        for (input, expected) in [(0, 10), (1, 20), (2, 30), (7, 30), (-1, 30)] {
            let result = call(&mut store, instance, "classify", &[Val::I32(input)]).unwrap();
            assert_eq!(result, Some(Val::I32(expected)), "classify({input})");
        }
        assert_eq!(instance.interpreter_state(&store), Some(ThreadState::Stopped));
    }

    #[test_log::test]
    fn recursion_runs_in_place() {
        let mut store = Store::new(&interpreted_engine(1024));
        let instance = instantiate(&mut store, CONTROL, None);
        let func_index = FuncIndex::from_u32(0);

        let result = with_interpreter(&mut store, instance, |interpreter, store| {
            let activation = interpreter.thread.start_activation();
            interpreter
                .thread
                .init_frame(&mut interpreter.codes, func_index, &[Val::I64(5)])
                .unwrap();
            let mut cx = Context {
                store,
                instance,
                codes: &mut interpreter.codes,
            };
            let mut max_frames = 0;
            let mut steps = 0;
            loop {
                match interpreter.thread.step(&mut cx).unwrap() {
                    Exit::Paused => {
                        assert_eq!(interpreter.thread.state(), ThreadState::Paused);
                        max_frames = max_frames.max(interpreter.thread.frame_count());
                        steps += 1;
                    }
                    Exit::Finished => break,
                    other => panic!("unexpected exit {other:?}"),
                }
            }
            assert_eq!(interpreter.thread.state(), ThreadState::Finished);
            assert_eq!(max_frames, 6);
            assert!(steps > 6 * 3);

            let value = interpreter.thread.get_return_value();
            interpreter.thread.finish_activation(activation);
            value
        })
        .unwrap();
        assert_eq!(result, Some(Val::I64(120)));
    }

    #[test_log::test]
    fn breakpoints_do_not_use_up_steps() {
        let mut store = Store::new(&interpreted_engine(1024));
        let instance = instantiate(
            &mut store,
            r#"(module
                (func (export "three") (result i32)
                    i32.const 1
                    i32.const 2
                    i32.add))"#,
            None,
        );
        let func_index = FuncIndex::from_u32(0);

        let result = with_interpreter(&mut store, instance, |interpreter, store| -> crate::Result<_> {
            let starts: Vec<u32> = interpreter.codes.get(func_index)?.instruction_starts().collect();
            let add = starts[2];
            interpreter.codes.set_breakpoint(func_index, add, true)?;

            let activation = interpreter.thread.start_activation();
            interpreter.thread.init_frame(&mut interpreter.codes, func_index, &[])?;
            let mut cx = Context {
                store,
                instance,
                codes: &mut interpreter.codes,
            };

            // both constants fit the budget, the breakpoint is reported
            assert!(matches!(interpreter.thread.run(&mut cx, Some(2))?, Exit::Paused));
            assert_eq!(interpreter.thread.location(), Some((func_index, add)));
            assert_eq!(interpreter.thread.break_pc(), Some(add));

            // resuming with no budget stays at the breakpoint
            assert!(matches!(interpreter.thread.run(&mut cx, Some(0))?, Exit::Paused));
            assert_eq!(interpreter.thread.location(), Some((func_index, add)));
            assert_eq!(interpreter.thread.break_pc(), Some(add));

            assert!(matches!(interpreter.thread.run(&mut cx, None)?, Exit::Finished));
            assert_eq!(interpreter.thread.break_pc(), None);
            let value = interpreter.thread.get_return_value();
            interpreter.thread.finish_activation(activation);
            Ok(value)
        })
        .unwrap()
        .unwrap();
        assert_eq!(result, Some(Val::I32(3)));
    }

    #[test_log::test]
    fn traps_carry_their_location() {
        let mut store = Store::new(&interpreted_engine(1024));
        let instance = instantiate(
            &mut store,
            r#"(module
                (func (export "div") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.div_s))"#,
            None,
        );
        assert_eq!(
            call(&mut store, instance, "div", &[Val::I32(7), Val::I32(2)]).unwrap(),
            Some(Val::I32(3))
        );

        let err = call(&mut store, instance, "div", &[Val::I32(7), Val::I32(0)]).unwrap_err();
        let Error::Trap {
            trap,
            func_index,
            offset,
        } = err
        else {
            panic!("expected a trap, got {err}");
        };
        assert_eq!(trap, Trap::IntegerDivisionByZero);
        assert_eq!(func_index, Some(FuncIndex::from_u32(0)));
        assert!(offset.is_some());

        // the thread recovered
        assert_eq!(
            call(&mut store, instance, "div", &[Val::I32(-8), Val::I32(2)]).unwrap(),
            Some(Val::I32(-4))
        );
    }

    #[test_log::test]
    fn deep_recursion_overflows() {
        let mut store = Store::new(&interpreted_engine(64));
        let instance = instantiate(
            &mut store,
            r#"(module
                (func $f (export "f") (param i32) (result i32)
                    local.get 0
                    i32.const 1
                    i32.add
                    call $f))"#,
            None,
        );
        let err = call(&mut store, instance, "f", &[Val::I32(0)]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::StackOverflow));
    }

    #[test_log::test]
    fn calls_leave_and_reenter() {
        let mut store = Store::new(&interpreted_engine(1024));
        let mut linker = Linker::new();
        linker
            .func_new(
                &mut store,
                "env",
                "twice",
                FuncType::new([ValType::I32], [ValType::I32]),
                |_, args| Ok(Some(Val::I32(args[0].unwrap_i32() * 2))),
            )
            .unwrap();
        let instance = instantiate(
            &mut store,
            r#"(module
                (import "env" "twice" (func $twice (param i32) (result i32)))
                (type $unary (func (param i32) (result i32)))
                (table 2 funcref)
                (elem (i32.const 0) $twice $inc)
                (func $inc (param i32) (result i32)
                    local.get 0
                    i32.const 1
                    i32.add)
                (func (export "run") (param i32) (result i32)
                    local.get 0
                    call $twice
                    i32.const 1
                    call_indirect (type $unary)
                    i32.const 0
                    call_indirect (type $unary))
                (func (export "bad") (result i32)
                    i32.const 5
                    call_indirect (type $unary)))"#,
            Some(&linker),
        );

        // ((3 * 2) + 1) * 2
        assert_eq!(
            call(&mut store, instance, "run", &[Val::I32(3)]).unwrap(),
            Some(Val::I32(14))
        );
        let err = call(&mut store, instance, "bad", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(err.trap(), Some(Trap::InvalidFunction));
    }

    #[test_log::test]
    fn memory_and_globals() {
        let mut store = Store::new(&interpreted_engine(1024));
        let instance = instantiate(
            &mut store,
            r#"(module
                (memory 1 3)
                (global $counter (mut i32) (i32.const 0))
                (func (export "bump") (result i32)
                    global.get $counter
                    i32.const 1
                    i32.add
                    global.set $counter
                    i32.const 16
                    global.get $counter
                    i32.store
                    i32.const 16
                    i32.load)
                (func (export "grow") (param i32) (result i32)
                    local.get 0
                    memory.grow)
                (func (export "size") (result i32)
                    memory.size))"#,
            None,
        );
        assert_eq!(call(&mut store, instance, "bump", &[]).unwrap(), Some(Val::I32(1)));
        assert_eq!(call(&mut store, instance, "bump", &[]).unwrap(), Some(Val::I32(2)));
        assert_eq!(
            call(&mut store, instance, "grow", &[Val::I32(2)]).unwrap(),
            Some(Val::I32(1))
        );
        assert_eq!(
            call(&mut store, instance, "grow", &[Val::I32(1)]).unwrap(),
            Some(Val::I32(-1))
        );
        assert_eq!(call(&mut store, instance, "size", &[]).unwrap(), Some(Val::I32(3)));
    }
}
