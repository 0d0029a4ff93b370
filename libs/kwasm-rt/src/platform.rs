// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::store::Store;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

pub(crate) type BackgroundTask = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type ForegroundTask = Box<dyn FnOnce(&mut Store) + Send + 'static>;

/// A small fixed pool of OS worker threads running pure CPU tasks.
#[derive(Debug)]
pub(crate) struct Platform {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_available: Condvar,
}

#[derive(Default)]
struct PoolState {
    tasks: VecDeque<BackgroundTask>,
    shutdown: bool,
}

impl core::fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PoolShared")
            .field("queued", &state.tasks.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl Platform {
    pub(crate) fn new(requested: usize) -> Self {
        let available = std::thread::available_parallelism().map_or(1, usize::from);
        let num_threads = requested.min(available);

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            work_available: Condvar::new(),
        });

        let workers = (0..num_threads)
            .filter_map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("kwasm-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .inspect_err(|err| tracing::warn!("failed to spawn worker thread {i}: {err}"))
                    .ok()
            })
            .collect();

        Self { shared, workers }
    }

    pub(crate) fn num_background_threads(&self) -> usize {
        self.workers.len()
    }

    /// Posts `task` to the worker pool. Without any worker threads the task
    /// runs on the calling thread before this returns.
    pub(crate) fn call_on_background_thread(&self, task: BackgroundTask) {
        if self.workers.is_empty() {
            task();
            return;
        }

        let mut state = self.shared.state.lock();
        state.tasks.push_back(task);
        drop(state);
        self.shared.work_available.notify_one();
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_available.notify_all();

        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            // the last engine handle may be released by a task on a worker
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                if state.shutdown {
                    return;
                }
                shared.work_available.wait(&mut state);
            }
        };

        task();
    }
}

/// Continuations that must run on the thread owning a [`Store`].
///
/// Background tasks post here; [`Store::run_until_settled`] drains the queue.
#[derive(Default)]
pub(crate) struct ForegroundQueue {
    tasks: Mutex<VecDeque<ForegroundTask>>,
    posted: Condvar,
}

impl core::fmt::Debug for ForegroundQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ForegroundQueue")
            .field("queued", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

impl ForegroundQueue {
    pub(crate) fn post(&self, task: ForegroundTask) {
        self.tasks.lock().push_back(task);
        self.posted.notify_all();
    }

    pub(crate) fn try_pop(&self) -> Option<ForegroundTask> {
        self.tasks.lock().pop_front()
    }

    /// Blocks until a task is available and pops it.
    pub(crate) fn pop_blocking(&self) -> ForegroundTask {
        let mut tasks = self.tasks.lock();
        loop {
            if let Some(task) = tasks.pop_front() {
                return task;
            }
            self.posted.wait(&mut tasks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test_log::test]
    fn runs_background_tasks() {
        let platform = Platform::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..8 {
            let counter = counter.clone();
            let tx = tx.clone();
            platform.call_on_background_thread(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }));
        }

        for _ in 0..8 {
            rx.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test_log::test]
    fn no_workers_runs_inline() {
        let platform = Platform::new(0);
        assert_eq!(platform.num_background_threads(), 0);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        platform.call_on_background_thread(Box::new(move || {
            ran2.store(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
