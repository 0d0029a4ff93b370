// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::{call_i32, instantiate};
use kwasm_rt::{CompilationMode, Config, Engine, Linker, Store};

const PROVIDER: &str = r#"
    (module
        (func $square (param i32) (result i32)
            local.get 0
            local.get 0
            i32.mul)
        (func (export "square") (param i32) (result i32)
            local.get 0
            call $square)
        (table (export "table") 1 funcref)
        (elem (i32.const 0) $square))
"#;

const CONSUMER: &str = r#"
    (module
        (type $unary (func (param i32) (result i32)))
        (import "provider" "square" (func $square (param i32) (result i32)))
        (import "provider" "table" (table 1 funcref))
        (func (export "direct") (param i32) (result i32)
            local.get 0
            call $square)
        (func (export "indirect") (param i32) (result i32)
            local.get 0
            i32.const 0
            call_indirect (type $unary)))
"#;

fn engine(mode: CompilationMode) -> Engine {
    let mut config = Config::new();
    config.compilation_mode(mode);
    Engine::new(config)
}

#[test_log::test]
fn cross_instance_calls_compile_lazily() {
    let engine = engine(CompilationMode::Lazy);
    let mut store = Store::new(&engine);
    let provider = instantiate(&mut store, PROVIDER, None);

    let mut linker = Linker::new();
    linker.define_instance(&store, "provider", provider).unwrap();
    let consumer = instantiate(&mut store, CONSUMER, Some(&linker));

    assert_eq!(call_i32(&mut store, consumer, "indirect", &[7]), 49);
    assert_eq!(call_i32(&mut store, consumer, "direct", &[9]), 81);
    assert_eq!(call_i32(&mut store, provider, "square", &[-3]), 9);
}

#[test_log::test]
fn skipped_functions_compile_on_demand() {
    for mode in [CompilationMode::Parallel, CompilationMode::Sequential] {
        let mut config = Config::new();
        config.compilation_mode(mode).skip_compiling_functions(1);
        let engine = Engine::new(config);
        let mut store = Store::new(&engine);

        let provider = instantiate(&mut store, PROVIDER, None);
        assert_eq!(call_i32(&mut store, provider, "square", &[12]), 144, "{mode:?}");
    }
}

#[test_log::test]
fn lazy_instances_share_compiled_code() {
    let engine = engine(CompilationMode::Lazy);
    let mut store = Store::new(&engine);
    let module = common::module(&mut store, PROVIDER);

    let first = kwasm_rt::Instance::new(&mut store, module, None).unwrap();
    assert_eq!(call_i32(&mut store, first, "square", &[3]), 9);

    let second = kwasm_rt::Instance::new(&mut store, module, None).unwrap();
    assert_eq!(call_i32(&mut store, second, "square", &[6]), 36);
    assert_eq!(call_i32(&mut store, first, "square", &[2]), 4);

    first.dispose(&mut store);
    assert_eq!(call_i32(&mut store, second, "square", &[5]), 25);
}
