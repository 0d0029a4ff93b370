// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::{call_i32, engines};
use kwasm_rt::{Error, ErrorKind, FuncIndex, Instance, Linker, Module, Store};
use std::fmt::Write;

/// `count` functions returning their index, with the bodies at `broken`
/// returning the wrong type.
fn module_with_broken(count: u32, broken: &[u32]) -> Vec<u8> {
    let mut wat = String::from("(module\n");
    for i in 0..count {
        if broken.contains(&i) {
            writeln!(wat, "(func (export \"f{i}\") (result i32) i64.const {i})").unwrap();
        } else {
            writeln!(wat, "(func (export \"f{i}\") (result i32) i32.const {i})").unwrap();
        }
    }
    wat.push(')');
    wat::parse_str(&wat).unwrap()
}

#[test_log::test]
fn first_failing_function_is_reported() {
    let bytes = module_with_broken(40, &[17, 31, 38]);
    for (name, engine) in engines() {
        let mut store = Store::new(&engine);
        let err = Module::new(&mut store, &bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compile, "{name}");
        match &err {
            Error::Compile { func_index, .. } => {
                assert_eq!(*func_index, Some(FuncIndex::from_u32(17)), "{name}: {err}");
            }
            _ => panic!("{name}: expected a compile error, got {err}"),
        }
        let message = err.to_string();
        assert!(message.starts_with("CompileError: WebAssembly.Module(): "), "{message}");
        assert!(message.contains("#17:"), "{message}");
    }
}

#[test_log::test]
fn validation() {
    for (name, engine) in engines() {
        assert!(Module::validate(&engine, &module_with_broken(8, &[])), "{name}");
        assert!(!Module::validate(&engine, &module_with_broken(8, &[5])), "{name}");
        assert!(!Module::validate(&engine, b"\0asm\x02\0\0\0"), "{name}");
    }
}

#[test_log::test]
fn malformed_and_unsupported_input() {
    let engine = kwasm_rt::Engine::default();
    let mut store = Store::new(&engine);

    let err = Module::new(&mut store, b"\0asm\x02\0\0\0").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compile);
    assert!(err.to_string().starts_with("invalid WASM input at"), "{err}");

    let mutable_export = wat::parse_str(r#"(module (global (export "g") (mut i32) (i32.const 0)))"#).unwrap();
    let err = Module::new(&mut store, &mutable_export).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)), "{err}");
    assert_eq!(err.kind(), ErrorKind::Compile);
    assert!(!Module::validate(&engine, &mutable_export));
}

#[test_log::test]
fn many_functions_in_every_mode() {
    let bytes = module_with_broken(300, &[]);
    for (name, engine) in engines() {
        let mut store = Store::new(&engine);
        let module = Module::new(&mut store, &bytes).unwrap();
        let instance = Instance::new(&mut store, module, None).unwrap();
        for i in [0, 1, 150, 299] {
            assert_eq!(call_i32(&mut store, instance, &format!("f{i}"), &[]), i, "{name}");
        }
    }
}

#[test_log::test]
fn asynchronous_compilation() {
    let bytes = module_with_broken(64, &[]);
    for (name, engine) in engines() {
        let mut store = Store::new(&engine);
        let promise = store.compile_async(&bytes);
        let module = store.run_until_settled(&promise).unwrap();
        let instance = Instance::new(&mut store, module, None).unwrap();
        assert_eq!(call_i32(&mut store, instance, "f63", &[]), 63, "{name}");

        let promise = store.instantiate_async(&bytes, Some(Linker::new()), None);
        let (module, instance) = store.run_until_settled(&promise).unwrap();
        assert_eq!(module.instances(&store), vec![instance], "{name}");
        assert_eq!(call_i32(&mut store, instance, "f7", &[]), 7, "{name}");

        let promise = store.compile_async(&module_with_broken(64, &[40, 12]));
        let err = store.run_until_settled(&promise).unwrap_err();
        assert!(
            matches!(err, Error::Compile { func_index: Some(i), .. } if i == FuncIndex::from_u32(12)),
            "{name}: {err}"
        );
    }
}
