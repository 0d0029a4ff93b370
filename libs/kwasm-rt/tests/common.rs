// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(unused, reason = "not used by all tests")]

use kwasm_rt::{CompilationMode, Config, Engine, Instance, Linker, Module, Store, Val};

/// One engine per way of getting code to run.
pub fn engines() -> Vec<(&'static str, Engine)> {
    let mut parallel = Config::new();
    parallel.compilation_mode(CompilationMode::Parallel);
    let mut sequential = Config::new();
    sequential.compilation_mode(CompilationMode::Sequential);
    let mut lazy = Config::new();
    lazy.compilation_mode(CompilationMode::Lazy);
    let mut interpreted = Config::new();
    interpreted.interpret_all(true);

    vec![
        ("parallel", Engine::new(parallel)),
        ("sequential", Engine::new(sequential)),
        ("lazy", Engine::new(lazy)),
        ("interpreted", Engine::new(interpreted)),
    ]
}

pub fn module(store: &mut Store, wat: &str) -> Module {
    let bytes = wat::parse_str(wat).unwrap();
    Module::new(store, &bytes).unwrap()
}

pub fn instantiate(store: &mut Store, wat: &str, linker: Option<&Linker>) -> Instance {
    let module = module(store, wat);
    Instance::new(store, module, linker).unwrap()
}

pub fn call(store: &mut Store, instance: Instance, name: &str, args: &[Val]) -> kwasm_rt::Result<Option<Val>> {
    let func = instance
        .get_func(store, name)
        .unwrap_or_else(|| panic!("missing export {name}"));
    func.call(store, args)
}

pub fn call_i32(store: &mut Store, instance: Instance, name: &str, args: &[i32]) -> i32 {
    let args: Vec<Val> = args.iter().copied().map(Val::I32).collect();
    call(store, instance, name, &args)
        .unwrap()
        .and_then(|val| val.i32())
        .unwrap_or_else(|| panic!("{name} returned no i32"))
}
