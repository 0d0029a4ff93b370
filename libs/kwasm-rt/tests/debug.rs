// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::{call_i32, instantiate, module};
use kwasm_rt::{
    Engine, ErrorKind, FuncIndex, Instance, Location, PauseInfo, PauseReason, StepAction, Store,
};
use std::cell::RefCell;
use std::rc::Rc;

const NESTED: &str = r#"
    (module
        (func $inner (param i32) (result i32)
            local.get 0
            i32.const 1
            i32.add)
        (func (export "outer") (param i32) (result i32)
            local.get 0
            call $inner
            i32.const 10
            i32.mul))
"#;

fn whole_function(func: u32) -> (Location, Location) {
    let func_index = FuncIndex::from_u32(func);
    (
        Location {
            func_index,
            offset: 0,
        },
        Location {
            func_index,
            offset: u32::MAX,
        },
    )
}

/// Installs a delegate answering every pause with `respond` and returns the
/// pauses it saw.
fn record(
    store: &mut Store,
    mut respond: impl FnMut(&PauseInfo) -> StepAction + 'static,
) -> Rc<RefCell<Vec<PauseInfo>>> {
    let pauses = Rc::new(RefCell::new(Vec::new()));
    let seen = pauses.clone();
    store.set_debug_delegate(move |_: &Store, info: &PauseInfo| {
        seen.borrow_mut().push(*info);
        assert!(seen.borrow().len() < 1000, "runaway stepping");
        respond(info)
    });
    pauses
}

#[test_log::test]
fn breakpoint_positions() {
    let engine = Engine::default();
    let mut store = Store::new(&engine);
    let module = module(&mut store, NESTED);

    let (start, end) = whole_function(0);
    let positions = module.possible_breakpoints(&store, start, end).unwrap();
    assert!(positions.len() >= 3, "{positions:?}");
    assert!(positions.is_sorted());
    assert!(positions.iter().all(|l| l.func_index == start.func_index));

    let placed = module
        .set_breakpoint(&mut store, start.func_index, positions[1].offset)
        .unwrap();
    assert_eq!(placed, positions[1]);

    let between = module
        .set_breakpoint(&mut store, start.func_index, positions[1].offset + 1)
        .unwrap();
    assert_eq!(between, positions[2]);

    let err = module
        .set_breakpoint(&mut store, start.func_index, u32::MAX)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Range);

    let (_, outside) = whole_function(2);
    let err = module.possible_breakpoints(&store, start, outside).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Range);
}

#[test_log::test]
fn imported_functions_have_no_body() {
    let engine = Engine::default();
    let mut store = Store::new(&engine);
    let module = module(
        &mut store,
        r#"(module (import "env" "f" (func)) (func nop))"#,
    );
    let err = module
        .set_breakpoint(&mut store, FuncIndex::from_u32(0), 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Range);
    assert!(module.set_breakpoint(&mut store, FuncIndex::from_u32(1), 0).is_ok());
}

#[test_log::test]
fn breakpoints_redirect_live_instances() {
    let engine = Engine::default();
    let mut store = Store::new(&engine);
    let instance = instantiate(&mut store, NESTED, None);
    let module = instance.module(&store);

    assert_eq!(call_i32(&mut store, instance, "outer", &[1]), 20);
    assert!(instance.interpreter_state(&store).is_none());

    let location = module
        .set_breakpoint(&mut store, FuncIndex::from_u32(0), 0)
        .unwrap();
    assert!(instance.interpreter_state(&store).is_some());

    let pauses = record(&mut store, |_| StepAction::Continue);
    assert_eq!(call_i32(&mut store, instance, "outer", &[2]), 30);
    assert_eq!(call_i32(&mut store, instance, "outer", &[3]), 40);

    let pauses = pauses.borrow();
    assert_eq!(pauses.len(), 2);
    for pause in pauses.iter() {
        assert_eq!(pause.instance, instance);
        assert_eq!(pause.location, location);
        assert_eq!(pause.reason, PauseReason::Breakpoint);
        assert_eq!(pause.frame_count, 2);
    }
}

#[test_log::test]
fn later_instances_inherit_breakpoints() {
    let engine = Engine::default();
    let mut store = Store::new(&engine);
    let module = module(&mut store, NESTED);
    module
        .set_breakpoint(&mut store, FuncIndex::from_u32(1), 0)
        .unwrap();

    let pauses = record(&mut store, |_| StepAction::Continue);
    let instance = Instance::new(&mut store, module, None).unwrap();
    assert_eq!(call_i32(&mut store, instance, "outer", &[0]), 10);

    let pauses = pauses.borrow();
    assert_eq!(pauses.len(), 1);
    assert_eq!(pauses[0].location.func_index, FuncIndex::from_u32(1));
    assert_eq!(pauses[0].frame_count, 1);
}

#[test_log::test]
fn stepping_in_walks_every_instruction() {
    let engine = Engine::default();
    let mut store = Store::new(&engine);
    let instance = instantiate(&mut store, NESTED, None);
    let module = instance.module(&store);
    let outer = FuncIndex::from_u32(1);
    module.set_breakpoint(&mut store, outer, 0).unwrap();

    let pauses = record(&mut store, |_| StepAction::StepIn);
    assert_eq!(call_i32(&mut store, instance, "outer", &[4]), 50);

    let pauses = pauses.borrow();
    assert_eq!(pauses[0].reason, PauseReason::Breakpoint);
    assert!(pauses[1..].iter().all(|p| p.reason == PauseReason::Step));
    assert!(
        pauses.iter().any(|p| p.location.func_index == FuncIndex::from_u32(0) && p.frame_count == 2),
        "stepping in never entered the callee: {pauses:?}"
    );

    let (start, end) = whole_function(1);
    let positions = module.possible_breakpoints(&store, start, end).unwrap();
    for pause in pauses.iter().filter(|p| p.location.func_index == outer) {
        assert!(positions.contains(&pause.location), "{pause:?}");
    }
}

#[test_log::test]
fn stepping_over_stays_in_the_caller() {
    let engine = Engine::default();
    let mut store = Store::new(&engine);
    let instance = instantiate(&mut store, NESTED, None);
    let module = instance.module(&store);
    module
        .set_breakpoint(&mut store, FuncIndex::from_u32(1), 0)
        .unwrap();

    let pauses = record(&mut store, |_| StepAction::StepOver);
    assert_eq!(call_i32(&mut store, instance, "outer", &[5]), 60);

    let pauses = pauses.borrow();
    assert!(pauses.len() > 1);
    assert!(pauses.iter().all(|p| p.frame_count == 1), "{pauses:?}");
}

#[test_log::test]
fn stepping_out_returns_to_the_caller() {
    let engine = Engine::default();
    let mut store = Store::new(&engine);
    let instance = instantiate(&mut store, NESTED, None);
    let module = instance.module(&store);
    module
        .set_breakpoint(&mut store, FuncIndex::from_u32(0), 0)
        .unwrap();

    let pauses = record(&mut store, |info| {
        if info.reason == PauseReason::Breakpoint {
            StepAction::StepOut
        } else {
            StepAction::Continue
        }
    });
    assert_eq!(call_i32(&mut store, instance, "outer", &[6]), 70);

    let pauses = pauses.borrow();
    assert_eq!(pauses.len(), 2, "{pauses:?}");
    assert_eq!(pauses[0].frame_count, 2);
    assert_eq!(pauses[1].reason, PauseReason::Step);
    assert_eq!(pauses[1].location.func_index, FuncIndex::from_u32(1));
    assert_eq!(pauses[1].frame_count, 1);
}
