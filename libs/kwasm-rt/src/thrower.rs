// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::errors::Error;
use crate::indices::FuncIndex;
use core::fmt;

/// Accumulates the outcome of a compile or link phase.
///
/// Every phase boundary consults [`ErrorThrower::error`] before moving on; the
/// first recorded error wins and later ones are dropped. Messages are prefixed
/// with the context the thrower was created for, e.g. `WebAssembly.Instance()`.
#[derive(Debug)]
pub struct ErrorThrower {
    context: &'static str,
    error: Option<Error>,
}

impl ErrorThrower {
    pub fn new(context: &'static str) -> Self {
        Self {
            context,
            error: None,
        }
    }

    pub fn context(&self) -> &'static str {
        self.context
    }

    /// Returns true once any error has been recorded.
    pub fn error(&self) -> bool {
        self.error.is_some()
    }

    pub fn compile_error(&mut self, func_index: Option<FuncIndex>, message: fmt::Arguments<'_>) {
        if self.error.is_none() {
            self.error = Some(Error::Compile {
                func_index,
                message: format!("{}: {message}", self.context),
            });
        }
    }

    pub fn link_error(&mut self, message: fmt::Arguments<'_>) {
        if self.error.is_none() {
            tracing::debug!("{}: link error: {message}", self.context);
            self.error = Some(Error::Link(format!("{}: {message}", self.context)));
        }
    }

    pub fn type_error(&mut self, message: fmt::Arguments<'_>) {
        if self.error.is_none() {
            self.error = Some(Error::Type(format!("{}: {message}", self.context)));
        }
    }

    pub fn range_error(&mut self, message: fmt::Arguments<'_>) {
        if self.error.is_none() {
            self.error = Some(Error::Range(format!("{}: {message}", self.context)));
        }
    }

    /// Records an already constructed error.
    pub fn set(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Converts the thrower state into a `Result`, consuming it.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded on this thrower.
    pub fn into_result(self) -> Result<(), Error> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Takes the recorded error out of the thrower, leaving it clean.
    pub fn take(&mut self) -> Option<Error> {
        self.error.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn first_error_wins() {
        let mut thrower = ErrorThrower::new("test");
        assert!(!thrower.error());

        thrower.link_error(format_args!("first"));
        thrower.type_error(format_args!("second"));
        assert!(thrower.error());

        let err = thrower.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Link);
        assert_eq!(err.to_string(), "LinkError: test: first");
    }

    #[test]
    fn take_resets() {
        let mut thrower = ErrorThrower::new("test");
        thrower.range_error(format_args!("too large"));
        assert!(thrower.take().is_some());
        assert!(!thrower.error());
        thrower.into_result().unwrap();
    }
}
