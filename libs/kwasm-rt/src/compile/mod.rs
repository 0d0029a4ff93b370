// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compilation of function bodies into a code table.
//!
//! A [`ModuleCompiler`] turns every defined function of a module into a
//! [`CompilationUnit`]. Units are *executed* (lowered) on any thread and then
//! *finished* (turned into a code object) on the thread owning the [`Store`].
//! In parallel mode background tasks and the calling thread both execute
//! units while the calling thread finishes them; at most one finisher runs at
//! a time, gated by a flag that lives under the same lock as the executed
//! units.

mod lower;
mod schedule;
mod unit;

pub(crate) use lower::{body_reader, check_operator, lower_function, validate_function};
pub(crate) use unit::{CompilationUnit, ExecutedUnit, compile_error};

use crate::async_job::CancelableTaskManager;
use crate::code::CodeAddr;
use crate::engine::{CompilationMode, Engine};
use crate::errors::Error;
use crate::indices::{DefinedFuncIndex, FuncIndex};
use crate::loom::Mutex;
use crate::module::SharedModule;
use crate::platform::Platform;
use crate::store::Store;
use crate::thrower::ErrorThrower;
use cranelift_entity::{EntityRef, PrimaryMap};
use schedule::CodeGenerationSchedule;
use std::sync::Arc;
use std::time::Instant;
use wasmparser::{FuncToValidate, ValidatorResources};

pub(crate) type FunctionBodies = PrimaryMap<DefinedFuncIndex, FuncToValidate<ValidatorResources>>;

/// Invoked by a background task that claimed the finisher role.
pub(crate) type FinisherCallback = Arc<dyn Fn() + Send + Sync>;

/// Compiles all function bodies of `module` according to the engine's
/// compilation mode and returns the resulting code table.
///
/// # Errors
///
/// Returns a compile error naming the offending function if any body fails
/// to validate or lower.
#[tracing::instrument(level = "debug", skip_all)]
pub(crate) fn compile_module(
    store: &mut Store,
    module: &SharedModule,
    bodies: FunctionBodies,
) -> crate::Result<Vec<CodeAddr>> {
    let engine = store.engine().clone();
    let config = engine.config();
    let mut thrower = ErrorThrower::new("WebAssembly.Module()");

    if config.compilation_mode == CompilationMode::Lazy || config.interpret_all {
        tracing::debug!(
            "validating {} functions for lazy compilation",
            bodies.len()
        );
        validate_sequentially(module, bodies, &mut thrower);
        thrower.into_result()?;
        return Ok(lazy_code_table(store, module));
    }

    let mut compiler = ModuleCompiler::new(&engine, module.clone());
    let count = compiler.initialize_compilation_units(bodies);

    if config.compilation_mode == CompilationMode::Parallel
        && compiler.num_background_tasks > 0
        && count > 1
    {
        tracing::debug!(
            "compiling {count} functions with {} background tasks",
            compiler.num_background_tasks
        );
        compiler.compile_in_parallel(store);
    } else {
        tracing::debug!("compiling {count} functions sequentially");
        compiler.compile_sequentially(store, &mut thrower);
    }
    compiler.report_errors(&mut thrower);
    thrower.into_result()?;

    Ok(compiler.into_code_table(store))
}

/// Validates every body in function index order, stopping at the first
/// failure.
pub(crate) fn validate_sequentially(
    module: &SharedModule,
    bodies: FunctionBodies,
    thrower: &mut ErrorThrower,
) {
    let translated = module.translated();
    for (index, body) in bodies {
        let func_index = translated.func_index(index);
        let Some(range) = translated.func_body(func_index) else {
            continue;
        };
        let mut validator = body.into_validator(Default::default());
        if let Err(err) = validate_function(module.wire_bytes(), &range, &mut validator) {
            let err = compile_error(translated, func_index, err);
            thrower.compile_error(Some(func_index), format_args!("{}", compile_message(err)));
            return;
        }
    }
}

/// Code table with the shared lazy stub in every defined slot.
pub(crate) fn lazy_code_table(store: &Store, module: &SharedModule) -> Vec<CodeAddr> {
    let translated = module.translated();
    (0..translated.num_functions())
        .map(|i| {
            if translated.is_imported_function(FuncIndex::new(i)) {
                store.illegal_code()
            } else {
                store.lazy_stub()
            }
        })
        .collect()
}

fn compile_message(err: Error) -> String {
    match err {
        Error::Compile { message, .. } => message,
        err => err.to_string(),
    }
}

/// State shared between the foreground and the background tasks of one
/// compilation.
pub(crate) struct CompilationState {
    module: SharedModule,
    compilation_units: Mutex<Vec<CompilationUnit>>,
    executed_units: Mutex<ExecutedUnits>,
    stopped_compilation_tasks: Mutex<usize>,
    task_manager: CancelableTaskManager,
}

struct ExecutedUnits {
    schedule: CodeGenerationSchedule<ExecutedUnit>,
    finisher_is_running: bool,
}

impl CompilationState {
    pub(crate) fn new(module: SharedModule, seed: u64, max_memory: usize, tasks: usize) -> Self {
        Self {
            module,
            compilation_units: Mutex::new(Vec::new()),
            executed_units: Mutex::new(ExecutedUnits {
                schedule: CodeGenerationSchedule::new(seed, max_memory),
                finisher_is_running: false,
            }),
            stopped_compilation_tasks: Mutex::new(tasks),
            task_manager: CancelableTaskManager::default(),
        }
    }

    pub(crate) fn module(&self) -> &SharedModule {
        &self.module
    }

    pub(crate) fn task_manager(&self) -> &CancelableTaskManager {
        &self.task_manager
    }

    /// Pops one unit off the queue and executes it. Returns `false` once the
    /// queue is empty.
    ///
    /// When `on_executed` is given and no finisher is running the caller
    /// becomes the finisher and the callback is invoked.
    pub(crate) fn fetch_and_execute_compilation_unit(
        &self,
        on_executed: Option<&(dyn Fn() + Send + Sync)>,
    ) -> bool {
        // the queue lock is released before the result lock is taken
        let Some(unit) = self.compilation_units.lock().pop() else {
            return false;
        };

        let executed = unit.execute(&self.module);
        let cost = executed.memory_cost();

        let claimed = {
            let mut executed_units = self.executed_units.lock();
            executed_units.schedule.schedule(executed, cost);
            if on_executed.is_some() && !executed_units.finisher_is_running {
                executed_units.finisher_is_running = true;
                true
            } else {
                false
            }
        };
        if claimed && let Some(callback) = on_executed {
            callback();
        }

        true
    }

    pub(crate) fn next_executed_unit(&self) -> Option<ExecutedUnit> {
        self.executed_units.lock().schedule.get_next()
    }

    /// Gives up the finisher role, unless units arrived since the last drain,
    /// in which case the role is kept and `true` returned.
    pub(crate) fn release_finisher(&self) -> bool {
        let mut executed_units = self.executed_units.lock();
        if executed_units.schedule.is_empty() {
            executed_units.finisher_is_running = false;
            false
        } else {
            true
        }
    }

    /// Claims the finisher role if nobody holds it.
    #[cfg(all(test, loom))]
    fn try_claim_finisher(&self) -> bool {
        let mut executed_units = self.executed_units.lock();
        !core::mem::replace(&mut executed_units.finisher_is_running, true)
    }

    pub(crate) fn can_accept_work(&self) -> bool {
        self.executed_units.lock().schedule.can_accept_work()
    }

    pub(crate) fn should_increase_workload(&self) -> bool {
        self.executed_units.lock().schedule.should_increase_workload()
    }

    pub(crate) fn on_background_task_stopped(&self) {
        *self.stopped_compilation_tasks.lock() += 1;
    }

    /// Body of a background compilation task.
    pub(crate) fn run_compilation_task(&self, on_executed: Option<&(dyn Fn() + Send + Sync)>) {
        while self.can_accept_work() {
            if !self.fetch_and_execute_compilation_unit(on_executed) {
                break;
            }
        }
        self.on_background_task_stopped();
    }

    /// Respawns every background task that has stopped so far.
    pub(crate) fn restart_compilation_tasks(
        self: &Arc<Self>,
        platform: &Platform,
        on_executed: Option<&FinisherCallback>,
    ) {
        // taken out under the lock, tasks may run inline and report back
        let stopped = core::mem::take(&mut *self.stopped_compilation_tasks.lock());
        for _ in 0..stopped {
            let Some(id) = self.task_manager.register() else {
                return;
            };
            let state = Arc::clone(self);
            let on_executed = on_executed.cloned();
            platform.call_on_background_thread(Box::new(move || {
                if state.task_manager.try_run(id) {
                    state.run_compilation_task(on_executed.as_deref());
                    state.task_manager.finished(id);
                }
            }));
        }
    }
}

/// Outcome of a budget limited finishing round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishProgress {
    Drained,
    OutOfTime,
}

/// Foreground half of a compilation: owns the results and drives the
/// background tasks.
pub(crate) struct ModuleCompiler {
    engine: Engine,
    state: Arc<CompilationState>,
    code_table: Vec<Option<CodeAddr>>,
    errors: Vec<(FuncIndex, Error)>,
    num_background_tasks: usize,
    submitted: usize,
    finished: usize,
}

impl ModuleCompiler {
    pub(crate) fn new(engine: &Engine, module: SharedModule) -> Self {
        let config = engine.config();
        let num_background_tasks = engine.num_background_tasks();
        let num_functions = module.translated().num_functions();
        Self {
            engine: engine.clone(),
            state: Arc::new(CompilationState::new(
                module,
                config.random_seed,
                config.code_space_capacity / 2,
                num_background_tasks,
            )),
            code_table: vec![None; num_functions],
            errors: Vec::new(),
            num_background_tasks,
            submitted: 0,
            finished: 0,
        }
    }

    pub(crate) fn state(&self) -> &Arc<CompilationState> {
        &self.state
    }

    pub(crate) fn outstanding_units(&self) -> usize {
        self.submitted - self.finished
    }

    /// Queues one unit per defined function, leaving the configured prefix
    /// uncompiled. Returns the number of queued units.
    pub(crate) fn initialize_compilation_units(&mut self, bodies: FunctionBodies) -> usize {
        let skip = self.engine.config().skip_compiling_functions as usize;
        let module = self.state.module.clone();
        let translated = module.translated();

        let mut units = Vec::with_capacity(bodies.len());
        for (index, body) in bodies {
            let func_index = translated.func_index(index);
            if index.index() < skip {
                // skipped functions become lazy stubs, which must not fail later
                let mut validator = body.into_validator(Default::default());
                if let Some(range) = translated.func_body(func_index)
                    && let Err(err) = validate_function(module.wire_bytes(), &range, &mut validator)
                {
                    self.errors
                        .push((func_index, compile_error(translated, func_index, err)));
                }
                continue;
            }
            units.push(CompilationUnit::new(func_index, Some(body)));
        }

        // popped from the back, lowest index first
        units.reverse();
        let count = units.len();
        self.state.compilation_units.lock().extend(units);
        self.submitted += count;
        count
    }

    pub(crate) fn compile_in_parallel(&mut self, store: &mut Store) {
        let engine = self.engine.clone();
        self.state
            .executed_units
            .lock()
            .schedule
            .enable_throttling();

        self.state.restart_compilation_tasks(engine.platform(), None);

        while self.state.fetch_and_execute_compilation_unit(None) {
            self.finish_compilation_units(store);
            if self.state.should_increase_workload() {
                self.state.restart_compilation_tasks(engine.platform(), None);
            }
        }

        self.state.task_manager.cancel_and_wait();
        self.finish_compilation_units(store);

        assert_eq!(
            self.finished, self.submitted,
            "parallel compilation lost compilation units"
        );
    }

    /// Compiles the queued units in function index order, stopping at the
    /// first failure.
    pub(crate) fn compile_sequentially(&mut self, store: &mut Store, thrower: &mut ErrorThrower) {
        loop {
            let Some(unit) = self.state.compilation_units.lock().pop() else {
                break;
            };
            let func_index = unit.func_index();
            let result = unit.execute(&self.state.module).finish(store);
            self.finished += 1;

            match result {
                Ok(addr) => self.code_table[func_index.index()] = Some(addr),
                Err(err) => {
                    let translated = self.state.module.translated();
                    thrower.compile_error(
                        Some(func_index),
                        format_args!(
                            "Compilation of #{}:{} failed. {}",
                            func_index.as_u32(),
                            translated.func_display_name(func_index),
                            compile_message(err)
                        ),
                    );
                    break;
                }
            }
        }
    }

    /// Finishes every executed unit. Returns the number of finished units.
    pub(crate) fn finish_compilation_units(&mut self, store: &mut Store) -> usize {
        let mut count = 0;
        while let Some(unit) = self.state.next_executed_unit() {
            self.finish_unit(store, unit);
            count += 1;
        }
        count
    }

    /// Finishes executed units until none are left or `deadline` passes.
    pub(crate) fn finish_compilation_units_until(
        &mut self,
        store: &mut Store,
        deadline: Instant,
    ) -> FinishProgress {
        while let Some(unit) = self.state.next_executed_unit() {
            self.finish_unit(store, unit);
            if Instant::now() >= deadline {
                return FinishProgress::OutOfTime;
            }
        }
        FinishProgress::Drained
    }

    fn finish_unit(&mut self, store: &mut Store, unit: ExecutedUnit) {
        let func_index = unit.func_index();
        match unit.finish(store) {
            Ok(addr) => self.code_table[func_index.index()] = Some(addr),
            Err(err) => {
                tracing::debug!("function #{} failed to compile: {err}", func_index.as_u32());
                self.errors.push((func_index, err));
            }
        }
        self.finished += 1;
    }

    /// Records the failure of the lowest function index on `thrower`.
    pub(crate) fn report_errors(&mut self, thrower: &mut ErrorThrower) {
        let Some(pos) = self
            .errors
            .iter()
            .enumerate()
            .min_by_key(|(_, (func_index, _))| *func_index)
            .map(|(pos, _)| pos)
        else {
            return;
        };
        let (func_index, err) = self.errors.swap_remove(pos);
        self.errors.clear();
        thrower.compile_error(Some(func_index), format_args!("{}", compile_message(err)));
    }

    /// Completes the code table: imports get the illegal placeholder and
    /// uncompiled defined functions the shared lazy stub.
    pub(crate) fn into_code_table(self, store: &Store) -> Vec<CodeAddr> {
        let translated = self.state.module.translated();
        self.code_table
            .iter()
            .enumerate()
            .map(|(i, addr)| match addr {
                Some(addr) => *addr,
                None if translated.is_imported_function(FuncIndex::new(i)) => store.illegal_code(),
                None => store.lazy_stub(),
            })
            .collect()
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::sync::atomic::{AtomicUsize, Ordering};
    use crate::translate::ModuleTranslator;
    use crate::types::SignatureRegistry;

    fn module(num_functions: usize) -> SharedModule {
        let mut wat = String::from("(module");
        for i in 0..num_functions {
            wat.push_str(&format!(" (func (result i32) i32.const {i})"));
        }
        wat.push(')');
        let bytes = wat::parse_str(&wat).unwrap();
        let signatures = SignatureRegistry::default();
        let translation = ModuleTranslator::new(&signatures).translate(&bytes).unwrap();
        SharedModule::new(translation.module, bytes.into())
    }

    fn drain(state: &CompilationState, finished: &AtomicUsize) {
        loop {
            while state.next_executed_unit().is_some() {
                finished.fetch_add(1, Ordering::SeqCst);
            }
            if !state.release_finisher() {
                break;
            }
        }
    }

    fn worker(state: &CompilationState, finished: &AtomicUsize) {
        while state.fetch_and_execute_compilation_unit(None) {
            if state.try_claim_finisher() {
                drain(state, finished);
            }
        }
    }

    #[test]
    fn no_executed_unit_is_left_behind() {
        let module = module(2);
        crate::loom::model(move || {
            let state = crate::loom::sync::Arc::new(CompilationState::new(module.clone(), 0, usize::MAX, 1));
            {
                let mut units = state.compilation_units.lock();
                units.push(CompilationUnit::new(FuncIndex::new(1), None));
                units.push(CompilationUnit::new(FuncIndex::new(0), None));
            }
            let finished = crate::loom::sync::Arc::new(AtomicUsize::new(0));

            let handle = {
                let state = state.clone();
                let finished = finished.clone();
                crate::loom::thread::spawn(move || worker(&state, &finished))
            };
            worker(&state, &finished);
            handle.join().unwrap();

            assert_eq!(finished.load(Ordering::SeqCst), 2);
            // the last finisher released the gate
            assert!(state.try_claim_finisher());
        });
    }
}
