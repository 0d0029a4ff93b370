// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod stored;

pub use stored::Stored;
pub(crate) use stored::StoredData;

use crate::async_job::{AsyncCompileJob, JobId, RunningJob};
use crate::code::{Code, CodeAddr};
use crate::debug::DebugDelegate;
use crate::engine::Engine;
use crate::platform::ForegroundQueue;
use core::fmt;
use hashbrown::HashMap;
use std::sync::Arc;

/// Owns every module, instance and host object created against an
/// [`Engine`] and runs the foreground half of asynchronous jobs.
///
/// All handles ([`Module`](crate::Module), [`Instance`](crate::Instance),
/// [`Func`](crate::Func), ...) are indices into a store and only meaningful
/// together with the store that created them.
pub struct Store {
    engine: Engine,
    pub(crate) stored: StoredData,
    foreground: Arc<ForegroundQueue>,
    pub(crate) jobs: HashMap<JobId, AsyncCompileJob>,
    /// The job whose foreground step is on the stack.
    pub(crate) running_job: Option<RunningJob>,
    next_job_id: u64,
    debug_delegate: Option<Box<dyn DebugDelegate>>,
    /// Nesting of calls that crossed a tier or the host boundary.
    pub(crate) call_depth: usize,
    lazy_stub: CodeAddr,
    illegal_code: CodeAddr,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("engine", &self.engine)
            .field("jobs", &self.jobs.len())
            .field("call_depth", &self.call_depth)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(engine: &Engine) -> Self {
        let mut store = Self {
            engine: engine.clone(),
            stored: StoredData::default(),
            foreground: Arc::new(ForegroundQueue::default()),
            jobs: HashMap::new(),
            running_job: None,
            next_job_id: 0,
            debug_delegate: None,
            call_depth: 0,
            lazy_stub: Stored::new(0),
            illegal_code: Stored::new(0),
        };
        store.lazy_stub = store.add_code(Code::LazyStub(None));
        store.illegal_code = store.add_code(Code::Illegal);
        store
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The lazy stub shared by all code table slots that have no exported or
    /// table references.
    pub(crate) fn lazy_stub(&self) -> CodeAddr {
        self.lazy_stub
    }

    /// Placeholder for code table slots of imports that are not linked yet.
    pub(crate) fn illegal_code(&self) -> CodeAddr {
        self.illegal_code
    }

    pub(crate) fn foreground_queue(&self) -> &Arc<ForegroundQueue> {
        &self.foreground
    }

    pub(crate) fn next_job_id(&mut self) -> JobId {
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;
        id
    }

    /// Installs the delegate consulted whenever interpreted code pauses at a
    /// breakpoint.
    pub fn set_debug_delegate(&mut self, delegate: impl DebugDelegate + 'static) {
        self.debug_delegate = Some(Box::new(delegate));
    }

    pub fn clear_debug_delegate(&mut self) {
        self.debug_delegate = None;
    }

    pub(crate) fn take_debug_delegate(&mut self) -> Option<Box<dyn DebugDelegate>> {
        self.debug_delegate.take()
    }

    pub(crate) fn restore_debug_delegate(&mut self, delegate: Option<Box<dyn DebugDelegate>>) {
        if self.debug_delegate.is_none() {
            self.debug_delegate = delegate;
        }
    }

    /// Runs every foreground task that is currently queued without blocking.
    /// Returns the number of tasks run.
    pub fn run_pending_tasks(&mut self) -> usize {
        let mut count = 0;
        while let Some(task) = self.foreground.try_pop() {
            task(self);
            count += 1;
        }
        count
    }

    /// Blocks until a foreground task is queued and runs it.
    pub(crate) fn run_next_task(&mut self) {
        let task = self.foreground.pop_blocking();
        task(self);
    }
}
