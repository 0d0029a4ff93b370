// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::platform::Platform;
use crate::types::SignatureRegistry;
use core::time::Duration;
use static_assertions::assert_impl_all;
use std::sync::Arc;

/// How the module compiler populates a module's code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilationMode {
    /// Compile every function up front, spreading the work over the
    /// background worker pool and the calling thread.
    #[default]
    Parallel,
    /// Compile every function up front, in function index order, on the
    /// calling thread.
    Sequential,
    /// Seed every code table slot with a lazy stub and compile a function on
    /// its first call.
    Lazy,
}

/// Engine-wide configuration.
///
/// These settings are environment level: they are fixed when the [`Engine`]
/// is created and never appear on the compile or instantiate entry points.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) compilation_mode: CompilationMode,
    pub(crate) num_compilation_tasks: usize,
    pub(crate) skip_compiling_functions: u32,
    pub(crate) max_mem_pages: u32,
    pub(crate) max_table_size: u32,
    pub(crate) code_space_capacity: usize,
    pub(crate) interpret_all: bool,
    pub(crate) max_interpreted_stack: usize,
    pub(crate) max_call_depth: usize,
    pub(crate) async_finisher_budget: Duration,
    pub(crate) random_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compilation_mode: CompilationMode::default(),
            num_compilation_tasks: 10,
            skip_compiling_functions: 0,
            max_mem_pages: 16384,
            max_table_size: 10_000_000,
            code_space_capacity: 256 * 1024 * 1024,
            interpret_all: false,
            max_interpreted_stack: 16 * 1024,
            max_call_depth: 256,
            async_finisher_budget: Duration::from_millis(1),
            random_seed: 0x5eed,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlays `KWASM_*` environment variables on the default configuration.
    ///
    /// Unknown or unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        fn var<T: core::str::FromStr>(name: &str) -> Option<T> {
            let value = std::env::var(name).ok()?;
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("ignoring unparsable {name}={value}");
                    None
                }
            }
        }

        if let Some(mode) = std::env::var("KWASM_COMPILATION_MODE").ok() {
            match mode.as_str() {
                "parallel" => config.compilation_mode = CompilationMode::Parallel,
                "sequential" => config.compilation_mode = CompilationMode::Sequential,
                "lazy" => config.compilation_mode = CompilationMode::Lazy,
                other => tracing::warn!("ignoring unknown KWASM_COMPILATION_MODE={other}"),
            }
        }
        if let Some(n) = var("KWASM_NUM_COMPILATION_TASKS") {
            config.num_compilation_tasks = n;
        }
        if let Some(n) = var("KWASM_SKIP_COMPILING_FUNCTIONS") {
            config.skip_compiling_functions = n;
        }
        if let Some(n) = var("KWASM_MAX_MEM_PAGES") {
            config.max_mem_pages = n;
        }
        if let Some(n) = var("KWASM_MAX_TABLE_SIZE") {
            config.max_table_size = n;
        }
        if let Some(b) = var("KWASM_INTERPRET_ALL") {
            config.interpret_all = b;
        }
        if let Some(seed) = var("KWASM_RANDOM_SEED") {
            config.random_seed = seed;
        }

        config
    }

    pub fn compilation_mode(&mut self, mode: CompilationMode) -> &mut Self {
        self.compilation_mode = mode;
        self
    }

    /// Number of background compilation tasks, `0` compiles on the calling
    /// thread only.
    pub fn num_compilation_tasks(&mut self, n: usize) -> &mut Self {
        self.num_compilation_tasks = n;
        self
    }

    /// Leaves the first `n` defined functions as lazy stubs. Testing only.
    pub fn skip_compiling_functions(&mut self, n: u32) -> &mut Self {
        self.skip_compiling_functions = n;
        self
    }

    pub fn max_mem_pages(&mut self, pages: u32) -> &mut Self {
        self.max_mem_pages = pages;
        self
    }

    pub fn max_table_size(&mut self, size: u32) -> &mut Self {
        self.max_table_size = size;
        self
    }

    /// Capacity of the code region, half of which bounds the memory held by
    /// executed but unfinished compilation units.
    pub fn code_space_capacity(&mut self, bytes: usize) -> &mut Self {
        self.code_space_capacity = bytes;
        self
    }

    /// Route every defined function through the interpreter.
    pub fn interpret_all(&mut self, enable: bool) -> &mut Self {
        self.interpret_all = enable;
        self
    }

    pub fn max_interpreted_stack(&mut self, frames: usize) -> &mut Self {
        self.max_interpreted_stack = frames;
        self
    }

    /// Maximum nesting of calls that cross between execution tiers or the host.
    pub fn max_call_depth(&mut self, depth: usize) -> &mut Self {
        self.max_call_depth = depth;
        self
    }

    pub fn async_finisher_budget(&mut self, budget: Duration) -> &mut Self {
        self.async_finisher_budget = budget;
        self
    }

    pub fn random_seed(&mut self, seed: u64) -> &mut Self {
        self.random_seed = seed;
        self
    }
}

/// Global context for the runtime.
///
/// An engine can be safely shared across threads and is a cheap cloneable
/// handle to the actual engine. The engine itself will be deallocated once all
/// references to it have gone away.
#[derive(Debug, Clone)]
pub struct Engine(Arc<EngineInner>);

assert_impl_all!(Engine: Send, Sync);

#[derive(Debug)]
struct EngineInner {
    config: Config,
    signatures: Arc<SignatureRegistry>,
    platform: Platform,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let platform = Platform::new(config.num_compilation_tasks);
        tracing::debug!(
            "created engine: mode={:?} background_threads={}",
            config.compilation_mode,
            platform.num_background_threads()
        );

        Self(Arc::new(EngineInner {
            config,
            signatures: Arc::new(SignatureRegistry::default()),
            platform,
        }))
    }

    pub fn same(lhs: &Engine, rhs: &Engine) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Returns the signature registry of this engine, used to canonicalize
    /// function types for indirect calls.
    pub fn signatures(&self) -> &SignatureRegistry {
        &self.0.signatures
    }

    pub(crate) fn platform(&self) -> &Platform {
        &self.0.platform
    }

    /// Number of background tasks a parallel compile may use.
    pub(crate) fn num_background_tasks(&self) -> usize {
        self.0
            .config
            .num_compilation_tasks
            .min(self.0.platform.num_background_threads())
    }
}
