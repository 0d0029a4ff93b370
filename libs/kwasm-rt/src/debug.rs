// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Breakpoints and stepping.
//!
//! Setting a breakpoint switches every instance of the module to the
//! interpreter, which is the only tier that can pause. Instances created
//! afterwards start out interpreted.

use crate::errors::Error;
use crate::indices::FuncIndex;
use crate::instance::Instance;
use crate::interpreter;
use crate::module::Module;
use crate::store::Store;
use cranelift_entity::EntityRef;

/// A position in a function body, as a byte offset from the start of the
/// body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub func_index: FuncIndex,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    Breakpoint,
    /// A step requested by the previous [`StepAction`] completed.
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseInfo {
    pub instance: Instance,
    pub location: Location,
    pub reason: PauseReason,
    /// Interpreted frames on the thread, suspended outer entries included.
    pub frame_count: usize,
}

/// How execution continues after a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepAction {
    /// Run until the next breakpoint.
    #[default]
    Continue,
    /// Pause before the next instruction, entering calls.
    StepIn,
    /// Pause before the next instruction of this function or its caller.
    StepOver,
    /// Pause once the current function has returned.
    StepOut,
}

/// Receives control whenever interpreted code pauses.
pub trait DebugDelegate {
    fn on_pause(&mut self, store: &Store, info: &PauseInfo) -> StepAction;
}

impl<F> DebugDelegate for F
where
    F: FnMut(&Store, &PauseInfo) -> StepAction,
{
    fn on_pause(&mut self, store: &Store, info: &PauseInfo) -> StepAction {
        self(store, info)
    }
}

impl Module {
    /// Sets a breakpoint at the first instruction at or after `offset` in
    /// the body of `func_index` and returns where it was placed.
    ///
    /// # Errors
    ///
    /// Returns a [`RangeError`](crate::ErrorKind::Range) if the function is
    /// imported or no instruction follows `offset`.
    pub fn set_breakpoint(
        &self,
        store: &mut Store,
        func_index: FuncIndex,
        offset: u32,
    ) -> crate::Result<Location> {
        let shared = self.shared(store).clone();
        let location = possible_breakpoints(store, *self, func_index)?
            .into_iter()
            .find(|location| location.offset >= offset)
            .ok_or_else(|| {
                Error::Range(format!(
                    "no breakable position at or after offset {offset} in function #{}",
                    func_index.index()
                ))
            })?;

        if shared.add_breakpoint(location.func_index, location.offset) {
            tracing::debug!(
                "breakpoint at #{}+{}",
                location.func_index.index(),
                location.offset
            );
            for instance in self.instances(store) {
                interpreter::redirect_to_interpreter(store, instance)?;
                interpreter::set_breakpoint(store, instance, location)?;
            }
        }
        Ok(location)
    }

    /// Every position in `start..end` a breakpoint can be placed at, in
    /// order. Functions overlapping the range contribute their instructions
    /// inside it.
    ///
    /// # Errors
    ///
    /// Returns a range error if either endpoint names a function the module
    /// does not have, or an error if a function body cannot be decoded.
    pub fn possible_breakpoints(
        &self,
        store: &Store,
        start: Location,
        end: Location,
    ) -> crate::Result<Vec<Location>> {
        let translated = self.shared(store).translated();
        for endpoint in [start, end] {
            if endpoint.func_index.index() >= translated.num_functions() {
                return Err(Error::Range(format!(
                    "location #{}+{} is outside of the module",
                    endpoint.func_index.index(),
                    endpoint.offset
                )));
            }
        }
        let mut locations = Vec::new();
        for func_index in translated.defined_functions() {
            if func_index < start.func_index || func_index > end.func_index {
                continue;
            }
            locations.extend(
                possible_breakpoints(store, *self, func_index)?
                    .into_iter()
                    .filter(|location| *location >= start && *location < end),
            );
        }
        Ok(locations)
    }
}

fn possible_breakpoints(
    store: &Store,
    module: Module,
    func_index: FuncIndex,
) -> crate::Result<Vec<Location>> {
    let shared = module.shared(store);
    if func_index.index() >= shared.translated().num_functions()
        || shared.translated().is_imported_function(func_index)
    {
        return Err(Error::Range(format!(
            "function #{} has no body",
            func_index.index()
        )));
    }
    interpreter::instruction_starts(shared, func_index).map(|starts| {
        starts
            .into_iter()
            .map(|offset| Location { func_index, offset })
            .collect()
    })
}
