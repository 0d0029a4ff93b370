// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executor for lowered code.
//!
//! This is the tier the code table normally points at. Calls between tiers,
//! into the host and through lazy stubs all go through [`call`], which also
//! bounds the nesting depth.

#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    reason = "i32 operands are reinterpreted as table indices and page counts"
)]

use crate::code::{Branch, Code, CodeAddr, CompiledFunction, Inst};
use crate::errors::Error;
use crate::func;
use crate::lazy::{self, LazyCaller};
use crate::ops;
use crate::store::Store;
use crate::trap::Trap;
use crate::values::Val;
use cranelift_entity::EntityRef;
use std::sync::Arc;

/// Invokes the code at `target` with `args`.
pub(crate) fn call(
    store: &mut Store,
    target: CodeAddr,
    args: &[Val],
    caller: LazyCaller,
) -> crate::Result<Option<Val>> {
    if store.call_depth >= store.engine().config().max_call_depth {
        return Err(Error::Trap {
            trap: Trap::StackOverflow,
            func_index: None,
            offset: None,
        });
    }

    store.call_depth += 1;
    let result = dispatch(store, target, args, caller);
    store.call_depth -= 1;
    result
}

fn dispatch(
    store: &mut Store,
    target: CodeAddr,
    args: &[Val],
    caller: LazyCaller,
) -> crate::Result<Option<Val>> {
    match &store[target] {
        Code::Function { func, .. } => {
            let func = Arc::clone(func);
            execute(store, target, func, args)
        }
        Code::LazyStub(_) => {
            let code = lazy::compile_lazy(store, target, caller)?;
            if store[code].is_lazy_stub() {
                return Err(Error::Trap {
                    trap: Trap::InvalidFunction,
                    func_index: None,
                    offset: None,
                });
            }
            dispatch(store, code, args, caller)
        }
        Code::ImportWrapper(func) => {
            let func = *func;
            func::call_import(store, func, args)
        }
        Code::Interpreted {
            instance,
            func_index,
        } => {
            let (instance, func_index) = (*instance, *func_index);
            crate::interpreter::call_interpreted(store, instance, func_index, args)
        }
        Code::Illegal => Err(Error::Trap {
            trap: Trap::InvalidFunction,
            func_index: None,
            offset: None,
        }),
    }
}

fn execute(
    store: &mut Store,
    addr: CodeAddr,
    mut func: Arc<CompiledFunction>,
    args: &[Val],
) -> crate::Result<Option<Val>> {
    let mut locals: Vec<Val> = Vec::with_capacity(args.len() + func.locals.len());
    locals.extend_from_slice(args);
    locals.extend(func.locals.iter().map(|ty| Val::default_for_ty(*ty)));

    let mut stack: Vec<Val> = Vec::with_capacity(func.max_height as usize);
    let mut ip = 0;

    macro_rules! trap {
        ($trap:expr) => {
            return Err(Error::trap_in(
                $trap,
                func.func_index,
                func.offsets.get(ip.wrapping_sub(1)).copied().unwrap_or(0) as usize,
            ))
        };
    }
    macro_rules! pop {
        () => {
            match stack.pop() {
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

    while let Some(inst) = func.insts.get(ip) {
        ip += 1;
        match inst {
            Inst::Unreachable => trap!(Trap::UnreachableCodeReached),
            Inst::Br(branch) => ip = take_branch(&mut stack, *branch),
            Inst::BrIf(branch) => {
                if pop_i32!() != 0 {
                    ip = take_branch(&mut stack, *branch);
                }
            }
            Inst::BrIfEqz(branch) => {
                if pop_i32!() == 0 {
                    ip = take_branch(&mut stack, *branch);
                }
            }
            Inst::BrTable(targets) => {
                let index = pop_i32!() as u32 as usize;
                let Some(branch) = targets.get(index).or(targets.last()).copied() else {
                    trap!(Trap::UnreachableCodeReached)
                };
                ip = take_branch(&mut stack, branch);
            }
            Inst::Return => break,
            Inst::Call {
                func_index,
                params,
                target,
            } => {
                let target = match target {
                    Some(target) => *target,
                    None => store.illegal_code(),
                };
                tracing::trace!("call #{} -> {target:?}", func_index.as_u32());
                let args = stack.split_off(stack.len().saturating_sub(*params as usize));
                let caller = LazyCaller::Wasm {
                    caller: addr,
                    call_site: u32::try_from(ip - 1).unwrap_or(u32::MAX),
                };
                if let Some(result) = call(store, target, &args, caller)? {
                    stack.push(result);
                }
                // call sites may have been patched meanwhile
                if let Some(patched) = store[addr].as_function() {
                    func = Arc::clone(patched);
                }
            }
            Inst::CallIndirect {
                sig,
                params,
                dispatch,
                ..
            } => {
                let index = pop_i32!() as u32;
                let Some(table) = dispatch.and_then(|table| store.dispatch_table(table)) else {
                    trap!(Trap::InvalidFunction)
                };
                let Some(code) = table.code_at(index) else {
                    trap!(Trap::InvalidFunction)
                };
                match table.get(index) {
                    Some((_, actual)) if actual == *sig => {}
                    _ => trap!(Trap::SignatureMismatch),
                }
                let args = stack.split_off(stack.len().saturating_sub(*params as usize));
                if let Some(result) = call(store, code, &args, LazyCaller::External)? {
                    stack.push(result);
                }
                if let Some(patched) = store[addr].as_function() {
                    func = Arc::clone(patched);
                }
            }
            Inst::Drop => {
                pop!();
            }
            Inst::Select => {
                let cond = pop_i32!();
                let rhs = pop!();
                let lhs = pop!();
                stack.push(if cond != 0 { lhs } else { rhs });
            }
            Inst::LocalGet(index) => stack.push(locals[*index as usize]),
            Inst::LocalSet(index) => locals[*index as usize] = pop!(),
            Inst::LocalTee(index) => {
                let Some(val) = stack.last() else {
                    trap!(Trap::UnreachableCodeReached)
                };
                locals[*index as usize] = *val;
            }
            Inst::GlobalGet {
                globals,
                offset,
                ty,
            } => {
                let val = globals
                    .and_then(|globals| store.globals(globals))
                    .and_then(|buffer| buffer.read(*offset, *ty));
                match val {
                    Some(val) => stack.push(val),
                    None => trap!(Trap::MemoryOutOfBounds),
                }
            }
            Inst::GlobalSet { globals, offset } => {
                let val = pop!();
                let written = globals
                    .and_then(|globals| store.globals_mut(globals))
                    .is_some_and(|buffer| buffer.write(*offset, val));
                if !written {
                    trap!(Trap::MemoryOutOfBounds);
                }
            }
            Inst::Load {
                kind,
                offset,
                memory,
            } => {
                let addr = pop!();
                let bytes = memory
                    .and_then(|memory| store.memory(memory.0))
                    .map_or(&[][..], |data| data.bytes());
                stack.push(try_op!(ops::load(*kind, bytes, addr, *offset)));
            }
            Inst::Store {
                kind,
                offset,
                memory,
            } => {
                let val = pop!();
                let addr = pop!();
                let mut empty = [];
                let bytes = match memory.and_then(|memory| store.memory_mut(memory.0)) {
                    Some(data) => data.bytes_mut(),
                    None => &mut empty[..],
                };
                try_op!(ops::store(*kind, bytes, addr, *offset, val));
            }
            Inst::MemorySize(memory) => {
                let pages = memory
                    .and_then(|memory| store.memory(memory.0))
                    .map_or(0, |data| data.pages());
                stack.push(Val::I32(pages as i32));
            }
            Inst::MemoryGrow(memory) => {
                let delta = pop_i32!() as u32;
                let old = memory.and_then(|memory| memory.grow_pages(store, delta));
                stack.push(Val::I32(old.map_or(-1, |pages| pages as i32)));
            }
            Inst::Const(val) => stack.push(*val),
            Inst::Unary(op) => {
                let val = pop!();
                stack.push(try_op!(ops::unary(*op, val)));
            }
            Inst::Binary(op) => {
                let rhs = pop!();
                let lhs = pop!();
                stack.push(try_op!(ops::binary(*op, lhs, rhs)));
            }
        }
    }

    Ok(if func.results > 0 { stack.pop() } else { None })
}

/// Moves the branch's result values down to the label height and returns the
/// instruction to continue at.
fn take_branch(stack: &mut Vec<Val>, branch: Branch) -> usize {
    let keep = usize::from(branch.arity);
    let base = branch.height as usize;
    let top = stack.len().saturating_sub(keep);
    if top > base {
        stack.drain(base..top);
    }
    branch.ip as usize
}
