// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous compilation and instantiation.
//!
//! An [`AsyncCompileJob`] walks a fixed sequence of steps. Foreground steps
//! run on the thread owning the [`Store`] and may touch store objects;
//! background steps run on the engine's worker pool and only see the
//! decoded module. Background steps hand control back by posting a
//! continuation to the store's foreground queue, which
//! [`Store::run_until_settled`] drains.
//!
//! ```text
//! Decode (bg) -> PrepareAndStartCompile (fg) -> ExecuteCompilationUnits (bg)
//!   <-> FinishCompilationUnits (fg) -> FinishCompile (fg)
//!   -> CompileWrappers (fg) -> FinishModule (fg) [-> Instantiate (fg)]
//! ```

use crate::compile::{
    self, FinishProgress, FinisherCallback, FunctionBodies, ModuleCompiler,
};
use crate::engine::{CompilationMode, Engine};
use crate::errors::Error;
use crate::instance::Instance;
use crate::linker::Linker;
use crate::memory::Memory;
use crate::module::{Module, SharedModule};
use crate::platform::ForegroundQueue;
use crate::store::Store;
use crate::thrower::ErrorThrower;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

/// Identifies one asynchronous job within its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub(crate) u64);

/// Completion handle of an asynchronous job.
///
/// The job settles the promise exactly once, either with its result or with
/// an error. Settlement only happens while the store runs foreground tasks,
/// see [`Store::run_until_settled`] and [`Store::run_pending_tasks`].
#[derive(Debug)]
pub struct Promise<T> {
    id: JobId,
    slot: Arc<Mutex<Option<crate::Result<T>>>>,
}

impl<T> Promise<T> {
    fn new(id: JobId) -> Self {
        Self {
            id,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Takes the result out of a settled promise.
    pub fn try_take(&self) -> Option<crate::Result<T>> {
        self.slot.lock().take()
    }

    /// Cancels the job. Its promise is rejected with [`Error::Aborted`]
    /// unless it already settled.
    pub fn abort(&self, store: &mut Store) {
        store.abort_job(self.id);
    }

    fn resolver(&self) -> Resolver<T> {
        Resolver(Arc::clone(&self.slot))
    }
}

#[derive(Debug)]
struct Resolver<T>(Arc<Mutex<Option<crate::Result<T>>>>);

impl<T> Resolver<T> {
    fn settle(&self, result: crate::Result<T>) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
    }
}

/// What a job produces once it finishes.
#[derive(Debug)]
enum Outcome {
    Compile(Resolver<Module>),
    Instantiate {
        resolver: Resolver<(Module, Instance)>,
        imports: Option<Linker>,
        memory: Option<Memory>,
    },
}

impl Outcome {
    fn reject(&self, err: Error) {
        match self {
            Outcome::Compile(resolver) => resolver.settle(Err(err)),
            Outcome::Instantiate { resolver, .. } => resolver.settle(Err(err)),
        }
    }
}

/// Tracks background tasks so they can be cancelled as a group.
///
/// Tasks are registered before they are posted and have to call
/// [`try_run`](Self::try_run) before doing any work. After
/// [`cancel_and_wait`](Self::cancel_and_wait) no registered task starts and
/// every task that already started has called [`finished`](Self::finished).
#[derive(Debug, Default)]
pub(crate) struct CancelableTaskManager {
    state: Mutex<TaskManagerState>,
    all_finished: Condvar,
}

#[derive(Debug, Default)]
struct TaskManagerState {
    next_id: u64,
    /// Registered tasks and whether they are running.
    tasks: HashMap<u64, bool>,
    canceled: bool,
}

impl CancelableTaskManager {
    /// Returns `None` once the manager was cancelled.
    pub(crate) fn register(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.canceled {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(id, false);
        Some(id)
    }

    /// Marks task `id` as running. Returns `false` if it was cancelled.
    pub(crate) fn try_run(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        if state.canceled {
            state.tasks.remove(&id);
            return false;
        }
        match state.tasks.get_mut(&id) {
            Some(running) => {
                *running = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn finished(&self, id: u64) {
        let mut state = self.state.lock();
        state.tasks.remove(&id);
        if state.tasks.values().all(|running| !running) {
            self.all_finished.notify_all();
        }
    }

    /// Cancels every task that has not started yet and blocks until the
    /// running ones finished.
    pub(crate) fn cancel_and_wait(&self) {
        let mut state = self.state.lock();
        state.canceled = true;
        state.tasks.retain(|_, running| *running);
        while !state.tasks.is_empty() {
            self.all_finished.wait(&mut state);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Decode,
    PrepareAndStartCompile,
    ExecuteCompilationUnits,
    FinishCompilationUnits,
    FinishCompile,
    CompileWrappers,
    FinishModule,
    Instantiate,
}

/// Result of the background decode step.
type Decoded = crate::Result<(SharedModule, Option<FunctionBodies>)>;

pub(crate) struct AsyncCompileJob {
    id: JobId,
    engine: Engine,
    step: Step,
    outcome: Outcome,
    /// Tasks this job posted itself.
    background: Arc<CancelableTaskManager>,
    decoded: Option<SharedModule>,
    /// Code table of a lazily compiled module, skipping the compile steps.
    lazy_code_table: bool,
    compiler: Option<ModuleCompiler>,
    code_table: Option<Vec<crate::code::CodeAddr>>,
    module: Option<Module>,
    thrower: ErrorThrower,
}

impl core::fmt::Debug for AsyncCompileJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncCompileJob")
            .field("id", &self.id)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

/// The job whose foreground step is currently running.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunningJob {
    id: JobId,
    abort_pending: bool,
}

/// What a foreground step asks the driver to do next.
enum Next {
    /// Run the given foreground step right away.
    Foreground(Step),
    /// Wait for a continuation posted by background work.
    Wait,
    Done,
}

impl AsyncCompileJob {
    fn insert(store: &mut Store, id: JobId, outcome: Outcome, thrower: &'static str) {
        let job = Self {
            id,
            engine: store.engine().clone(),
            step: Step::Decode,
            outcome,
            background: Arc::new(CancelableTaskManager::default()),
            decoded: None,
            lazy_code_table: false,
            compiler: None,
            code_table: None,
            module: None,
            thrower: ErrorThrower::new(thrower),
        };
        store.jobs.insert(id, job);
    }

    fn start(store: &mut Store, id: JobId, bytes: Vec<u8>) {
        let queue = Arc::clone(store.foreground_queue());
        let Some(job) = store.jobs.get(&id) else {
            return;
        };
        tracing::debug!("job {id:?}: {:?}", Step::Decode);
        let engine = job.engine.clone();
        let background = Arc::clone(&job.background);

        let Some(task) = background.register() else {
            return;
        };
        let worker_engine = engine.clone();
        engine.platform().call_on_background_thread(Box::new(move || {
            if !background.try_run(task) {
                return;
            }
            let decoded = decode(&worker_engine, &bytes);
            queue.post(Box::new(move |store: &mut Store| {
                store.resume_job(id, move |job, _| job.on_decoded(decoded));
            }));
            background.finished(task);
        }));
    }

    fn on_decoded(&mut self, decoded: Decoded) -> crate::Result<Next> {
        let (shared, bodies) = decoded?;
        match bodies {
            Some(bodies) => {
                let mut compiler = ModuleCompiler::new(&self.engine, shared.clone());
                compiler.initialize_compilation_units(bodies);
                self.compiler = Some(compiler);
            }
            None => self.lazy_code_table = true,
        }
        self.decoded = Some(shared);
        Ok(Next::Foreground(Step::PrepareAndStartCompile))
    }

    fn run_step(&mut self, store: &mut Store, step: Step) -> crate::Result<Next> {
        tracing::debug!("job {:?}: {step:?}", self.id);
        self.step = step;
        match step {
            Step::Decode => Ok(Next::Wait),
            Step::PrepareAndStartCompile => self.prepare_and_start_compile(store),
            Step::ExecuteCompilationUnits => self.execute_compilation_units(store),
            Step::FinishCompilationUnits => self.finish_compilation_units(store),
            Step::FinishCompile => self.finish_compile(store),
            Step::CompileWrappers => self.compile_wrappers(store),
            Step::FinishModule => self.finish_module(),
            Step::Instantiate => self.instantiate(store),
        }
    }

    fn prepare_and_start_compile(&mut self, store: &mut Store) -> crate::Result<Next> {
        let Some(shared) = &self.decoded else {
            return Ok(Next::Wait);
        };
        if self.lazy_code_table {
            self.code_table = Some(compile::lazy_code_table(store, shared));
            return Ok(Next::Foreground(Step::CompileWrappers));
        }
        match &self.compiler {
            Some(compiler) if compiler.outstanding_units() > 0 => {
                Ok(Next::Foreground(Step::ExecuteCompilationUnits))
            }
            _ => Ok(Next::Foreground(Step::FinishCompile)),
        }
    }

    /// Posts one background task per stopped worker. Every task that claims
    /// the finisher role posts a `FinishCompilationUnits` continuation.
    fn execute_compilation_units(&mut self, store: &mut Store) -> crate::Result<Next> {
        let Some(compiler) = &self.compiler else {
            return Ok(Next::Foreground(Step::FinishCompile));
        };
        let callback = self.finisher_callback(store.foreground_queue());
        let state = Arc::clone(compiler.state());
        if self.engine.num_background_tasks() == 0 {
            // nobody else executes units, do it here
            while state.fetch_and_execute_compilation_unit(None) {}
            return Ok(Next::Foreground(Step::FinishCompilationUnits));
        }
        state.restart_compilation_tasks(self.engine.platform(), Some(&callback));
        Ok(Next::Wait)
    }

    fn finisher_callback(&self, queue: &Arc<ForegroundQueue>) -> FinisherCallback {
        let id = self.id;
        let queue = Arc::clone(queue);
        Arc::new(move || {
            queue.post(Box::new(move |store: &mut Store| {
                store.resume_job(id, |job, store| {
                    job.run_step(store, Step::FinishCompilationUnits)
                });
            }));
        })
    }

    /// Finishes executed units until the budget runs out, keeping the
    /// finisher role while there is more to do.
    fn finish_compilation_units(&mut self, store: &mut Store) -> crate::Result<Next> {
        let Some(compiler) = &mut self.compiler else {
            return Ok(Next::Foreground(Step::FinishCompile));
        };
        let deadline = Instant::now() + self.engine.config().async_finisher_budget;
        if compiler.finish_compilation_units_until(store, deadline) == FinishProgress::OutOfTime {
            self.repost(store, Step::FinishCompilationUnits);
            return Ok(Next::Wait);
        }
        if compiler.outstanding_units() == 0 {
            return Ok(Next::Foreground(Step::FinishCompile));
        }
        if compiler.state().release_finisher() {
            self.repost(store, Step::FinishCompilationUnits);
            return Ok(Next::Wait);
        }
        // workers that stopped for memory pressure can continue now
        Ok(Next::Foreground(Step::ExecuteCompilationUnits))
    }

    fn repost(&self, store: &Store, step: Step) {
        let id = self.id;
        store.foreground_queue().post(Box::new(move |store: &mut Store| {
            store.resume_job(id, move |job, store| job.run_step(store, step));
        }));
    }

    fn finish_compile(&mut self, store: &mut Store) -> crate::Result<Next> {
        let Some(mut compiler) = self.compiler.take() else {
            return Ok(Next::Foreground(Step::CompileWrappers));
        };
        compiler.state().task_manager().cancel_and_wait();
        compiler.finish_compilation_units(store);
        compiler.report_errors(&mut self.thrower);
        if let Some(err) = self.thrower.take() {
            return Err(err);
        }
        self.code_table = Some(compiler.into_code_table(store));
        Ok(Next::Foreground(Step::CompileWrappers))
    }

    fn compile_wrappers(&mut self, store: &mut Store) -> crate::Result<Next> {
        let (Some(shared), Some(code_table)) = (self.decoded.take(), self.code_table.take()) else {
            return Ok(Next::Done);
        };
        self.module = Some(Module::from_code_table(store, shared, code_table));
        Ok(Next::Foreground(Step::FinishModule))
    }

    fn finish_module(&mut self) -> crate::Result<Next> {
        let Some(module) = self.module else {
            return Ok(Next::Done);
        };
        match &self.outcome {
            Outcome::Compile(resolver) => {
                resolver.settle(Ok(module));
                Ok(Next::Done)
            }
            Outcome::Instantiate { .. } => Ok(Next::Foreground(Step::Instantiate)),
        }
    }

    fn instantiate(&mut self, store: &mut Store) -> crate::Result<Next> {
        let Some(module) = self.module else {
            return Ok(Next::Done);
        };
        if let Outcome::Instantiate {
            resolver,
            imports,
            memory,
        } = &self.outcome
        {
            let instance = match memory {
                Some(memory) => Instance::new_with_memory(store, module, imports.as_ref(), *memory),
                None => Instance::new(store, module, imports.as_ref()),
            }?;
            resolver.settle(Ok((module, instance)));
        }
        Ok(Next::Done)
    }

    fn cancel_background(&self) {
        self.background.cancel_and_wait();
        if let Some(compiler) = &self.compiler {
            compiler.state().task_manager().cancel_and_wait();
        }
    }
}

/// Decodes `bytes`. In lazy mode the bodies are validated right away and
/// dropped, lazily compiled modules never fail on first call.
fn decode(engine: &Engine, bytes: &[u8]) -> Decoded {
    let (shared, bodies) = Module::translate(engine, bytes)?;
    let config = engine.config();
    if config.compilation_mode == CompilationMode::Lazy || config.interpret_all {
        let mut thrower = ErrorThrower::new("WebAssembly.compile()");
        compile::validate_sequentially(&shared, bodies, &mut thrower);
        thrower.into_result()?;
        return Ok((shared, None));
    }
    Ok((shared, Some(bodies)))
}

impl Store {
    /// Starts compiling `bytes` in the background.
    pub fn compile_async(&mut self, bytes: &[u8]) -> Promise<Module> {
        let id = self.next_job_id();
        let promise = Promise::new(id);
        AsyncCompileJob::insert(
            self,
            id,
            Outcome::Compile(promise.resolver()),
            "WebAssembly.compile()",
        );
        AsyncCompileJob::start(self, id, bytes.to_vec());
        promise
    }

    /// Compiles `bytes` in the background and instantiates the result with
    /// `imports` once it is ready.
    pub fn instantiate_async(
        &mut self,
        bytes: &[u8],
        imports: Option<Linker>,
        memory: Option<Memory>,
    ) -> Promise<(Module, Instance)> {
        let id = self.next_job_id();
        let promise = Promise::new(id);
        AsyncCompileJob::insert(
            self,
            id,
            Outcome::Instantiate {
                resolver: promise.resolver(),
                imports,
                memory,
            },
            "WebAssembly.instantiate()",
        );
        AsyncCompileJob::start(self, id, bytes.to_vec());
        promise
    }

    /// Runs foreground tasks until `promise` settles and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the error the job was rejected with.
    pub fn run_until_settled<T>(&mut self, promise: &Promise<T>) -> crate::Result<T> {
        loop {
            if let Some(result) = promise.try_take() {
                return result;
            }
            if !self.jobs.contains_key(&promise.id) {
                // the result was taken before
                return Err(Error::Aborted);
            }
            self.run_next_task();
        }
    }

    /// Cancels job `id`. A job in the middle of a foreground step finishes
    /// that step first.
    pub(crate) fn abort_job(&mut self, id: JobId) {
        if let Some(running) = &mut self.running_job
            && running.id == id
        {
            tracing::debug!("job {id:?}: abort pending");
            running.abort_pending = true;
            return;
        }
        if let Some(job) = self.jobs.remove(&id) {
            tracing::debug!("job {id:?}: aborted in {:?}", job.step);
            job.cancel_background();
            job.outcome.reject(Error::Aborted);
        }
    }

    /// Runs `f` on job `id` and keeps driving its foreground steps until it
    /// waits for background work or finishes. Continuations of discarded jobs
    /// are ignored.
    fn resume_job(
        &mut self,
        id: JobId,
        f: impl FnOnce(&mut AsyncCompileJob, &mut Store) -> crate::Result<Next>,
    ) {
        let Some(mut job) = self.jobs.remove(&id) else {
            return;
        };
        let outer = self.running_job.replace(RunningJob {
            id,
            abort_pending: false,
        });

        let mut next = f(&mut job, self);
        while let Ok(Next::Foreground(step)) = next {
            if self.running_job.is_some_and(|running| running.abort_pending) {
                break;
            }
            next = job.run_step(self, step);
        }

        let aborted = self
            .running_job
            .is_some_and(|running| running.abort_pending);
        self.running_job = outer;

        if aborted {
            tracing::debug!("job {id:?}: aborted in {:?}", job.step);
            job.cancel_background();
            job.outcome.reject(Error::Aborted);
            return;
        }
        match next {
            Ok(Next::Wait) => {
                self.jobs.insert(id, job);
            }
            Ok(Next::Foreground(_) | Next::Done) => {
                tracing::debug!("job {id:?}: done");
                job.cancel_background();
            }
            Err(err) => {
                tracing::debug!("job {id:?}: failed in {:?}: {err}", job.step);
                job.cancel_background();
                job.outcome.reject(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Config;
    use crate::values::Val;

    fn engine(mode: CompilationMode, tasks: usize) -> Engine {
        let mut config = Config::new();
        config.compilation_mode(mode).num_compilation_tasks(tasks);
        Engine::new(config)
    }

    const ADD: &str = r#"
        (module
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add)
            (func (export "sub") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.sub))
    "#;

    #[test_log::test]
    fn compiles_in_every_mode() {
        let bytes = wat::parse_str(ADD).unwrap();
        for (mode, tasks) in [
            (CompilationMode::Parallel, 4),
            (CompilationMode::Parallel, 0),
            (CompilationMode::Sequential, 1),
            (CompilationMode::Lazy, 1),
        ] {
            let mut store = Store::new(&engine(mode, tasks));
            let promise = store.compile_async(&bytes);
            let module = store.run_until_settled(&promise).unwrap();

            let instance = Instance::new(&mut store, module, None).unwrap();
            let add = instance.get_func(&store, "add").unwrap();
            assert_eq!(
                add.call(&mut store, &[Val::I32(2), Val::I32(3)]).unwrap(),
                Some(Val::I32(5))
            );
        }
    }

    #[test_log::test]
    fn instantiate_resolves_both() {
        let bytes = wat::parse_str(ADD).unwrap();
        let mut store = Store::new(&Engine::default());
        let promise = store.instantiate_async(&bytes, None, None);
        let (module, instance) = store.run_until_settled(&promise).unwrap();
        assert_eq!(module.instances(&store), vec![instance]);
    }

    #[test_log::test]
    fn decode_errors_reject() {
        let mut store = Store::new(&Engine::default());
        let promise = store.compile_async(b"\0asm\x02\0\0\0");
        let err = store.run_until_settled(&promise).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Compile);
    }

    #[test_log::test]
    fn abort_rejects_once() {
        let bytes = wat::parse_str(ADD).unwrap();
        let mut store = Store::new(&Engine::default());
        let promise = store.compile_async(&bytes);
        promise.abort(&mut store);
        assert!(matches!(promise.try_take(), Some(Err(Error::Aborted))));

        // continuations of the discarded job are ignored
        store.run_pending_tasks();
        assert!(!promise.is_settled());
        assert!(store.jobs.is_empty());
    }

    #[test]
    fn cancel_skips_unstarted_tasks() {
        let manager = CancelableTaskManager::default();
        let started = manager.register().unwrap();
        let pending = manager.register().unwrap();
        assert!(manager.try_run(started));

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                manager.finished(started);
            });
            manager.cancel_and_wait();
        });

        assert!(!manager.try_run(pending));
        assert!(manager.register().is_none());
    }
}
