// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::code::{Code, CodeAddr, CompiledFunction};
use crate::compile::lower::lower_function;
use crate::errors::Error;
use crate::indices::FuncIndex;
use crate::module::SharedModule;
use crate::store::Store;
use crate::translate::TranslatedModule;
use std::sync::Arc;
use wasmparser::{FuncToValidate, ValidatorResources};

/// One function's compile job.
///
/// Executing a unit is pure CPU work over the shared module and may happen on
/// any thread, finishing it allocates the code object in the [`Store`] and
/// must happen on the store's thread.
pub(crate) struct CompilationUnit {
    func_index: FuncIndex,
    validator: Option<FuncToValidate<ValidatorResources>>,
}

impl CompilationUnit {
    pub(crate) fn new(
        func_index: FuncIndex,
        validator: Option<FuncToValidate<ValidatorResources>>,
    ) -> Self {
        Self {
            func_index,
            validator,
        }
    }

    pub(crate) fn func_index(&self) -> FuncIndex {
        self.func_index
    }

    pub(crate) fn execute(self, module: &SharedModule) -> ExecutedUnit {
        let mut validator = self
            .validator
            .map(|v| v.into_validator(Default::default()));
        let result = lower_function(
            module.translated(),
            module.wire_bytes(),
            self.func_index,
            validator.as_mut(),
        )
        .map_err(|err| compile_error(module.translated(), self.func_index, err));

        ExecutedUnit {
            func_index: self.func_index,
            result,
        }
    }
}

pub(crate) struct ExecutedUnit {
    func_index: FuncIndex,
    result: crate::Result<CompiledFunction>,
}

impl ExecutedUnit {
    pub(crate) fn func_index(&self) -> FuncIndex {
        self.func_index
    }

    /// Bytes held by this unit until it is finished.
    pub(crate) fn memory_cost(&self) -> usize {
        match &self.result {
            Ok(func) => func.memory_cost(),
            Err(_) => size_of::<Error>(),
        }
    }

    pub(crate) fn finish(self, store: &mut Store) -> crate::Result<CodeAddr> {
        let func = self.result?;
        Ok(store.add_code(Code::Function {
            func: Arc::new(func),
            module: None,
        }))
    }
}

/// Attaches the function index and name to a failure of one function body.
pub(crate) fn compile_error(module: &TranslatedModule, func_index: FuncIndex, err: Error) -> Error {
    let name = module.func_display_name(func_index);
    let message = match err {
        Error::InvalidWebAssembly { message, offset } => format!(
            "Compiling function #{}:{name} failed: {message} @+{offset}",
            func_index.as_u32()
        ),
        Error::Compile { message, .. } => message,
        err => format!(
            "Compiling function #{}:{name} failed: {err}",
            func_index.as_u32()
        ),
    };
    Error::Compile {
        func_index: Some(func_index),
        message,
    }
}
