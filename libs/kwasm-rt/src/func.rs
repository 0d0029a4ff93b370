// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::code::CodeAddr;
use crate::errors::Error;
use crate::indices::{FuncIndex, SigId};
use crate::instance::Instance;
use crate::lazy::{LazyCaller, ensure_exported_stub};
use crate::store::{Store, Stored};
use crate::types::FuncType;
use crate::values::Val;
use core::fmt;
use cranelift_entity::EntityRef;
use std::sync::Arc;

/// Signature of host functions. Arguments arrive already converted to the
/// declared parameter types, the result is converted to the declared result
/// type.
pub type HostFunc = dyn Fn(&mut Store, &[Val]) -> anyhow::Result<Option<Val>> + Send + Sync;

/// A function callable from the host: either a host closure or an exported
/// WebAssembly function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Func(pub(crate) Stored<FuncData>);

pub struct FuncData {
    ty: FuncType,
    sig: SigId,
    kind: FuncKind,
}

#[derive(Clone)]
pub(crate) enum FuncKind {
    Host(Arc<HostFunc>),
    Wasm {
        instance: Instance,
        func_index: FuncIndex,
    },
}

impl fmt::Debug for FuncData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("FuncData");
        s.field("ty", &self.ty).field("sig", &self.sig);
        match &self.kind {
            FuncKind::Host(_) => s.field("kind", &"host"),
            FuncKind::Wasm {
                instance,
                func_index,
            } => s.field("instance", instance).field("func_index", func_index),
        };
        s.finish()
    }
}

impl Func {
    /// Wraps a host closure.
    pub fn new(
        store: &mut Store,
        ty: FuncType,
        func: impl Fn(&mut Store, &[Val]) -> anyhow::Result<Option<Val>> + Send + Sync + 'static,
    ) -> Self {
        let sig = store.engine().signatures().register(&ty);
        Self(store.add_func(FuncData {
            ty,
            sig,
            kind: FuncKind::Host(Arc::new(func)),
        }))
    }

    pub(crate) fn new_wasm(
        store: &mut Store,
        instance: Instance,
        func_index: FuncIndex,
        ty: FuncType,
        sig: SigId,
    ) -> Self {
        Self(store.add_func(FuncData {
            ty,
            sig,
            kind: FuncKind::Wasm {
                instance,
                func_index,
            },
        }))
    }

    pub fn ty<'a>(&self, store: &'a Store) -> &'a FuncType {
        &store[self.0].ty
    }

    pub(crate) fn sig(&self, store: &Store) -> SigId {
        store[self.0].sig
    }

    pub(crate) fn kind(&self, store: &Store) -> FuncKind {
        store[self.0].kind.clone()
    }

    /// Instance and function index of an exported WebAssembly function.
    pub(crate) fn wasm_target(&self, store: &Store) -> Option<(Instance, FuncIndex)> {
        match store[self.0].kind {
            FuncKind::Wasm {
                instance,
                func_index,
            } => Some((instance, func_index)),
            FuncKind::Host(_) => None,
        }
    }

    /// Code and canonical signature to store in a dispatch table, `None` for
    /// host functions.
    pub(crate) fn table_entry(&self, store: &mut Store) -> Option<(CodeAddr, SigId)> {
        let (instance, func_index) = self.wasm_target(store)?;
        let module = store.instance(instance.0)?.compiled_module;
        let code = ensure_exported_stub(store, module, func_index);
        Some((code, self.sig(store)))
    }

    /// Calls the function, converting `params` to the declared parameter
    /// types.
    ///
    /// # Errors
    ///
    /// Returns a type error for mismatched arguments or signatures containing
    /// `i64`, and any trap or host error raised by the callee.
    pub fn call(&self, store: &mut Store, params: &[Val]) -> crate::Result<Option<Val>> {
        let ty = self.ty(store).clone();
        let args = coerce_args(&ty, params)?;

        match self.kind(store) {
            FuncKind::Host(func) => {
                let result = func(store, &args).map_err(Error::Host)?;
                coerce_result(&ty, result)
            }
            FuncKind::Wasm {
                instance,
                func_index,
            } => {
                let module = store
                    .instance(instance.0)
                    .ok_or_else(|| Error::Type("function of a disposed instance".to_string()))?
                    .compiled_module;
                let (target, has_i64) = match store[module.0]
                    .export_wrappers
                    .iter()
                    .find(|wrapper| wrapper.func_index == func_index)
                {
                    Some(wrapper) => (wrapper.target, wrapper.has_i64),
                    None => (
                        store[module.0].code_table[func_index.index()],
                        ty.has_i64(),
                    ),
                };
                if has_i64 {
                    return Err(Error::Type(
                        "wasm function signature contains illegal type".to_string(),
                    ));
                }
                crate::machine::call(store, target, &args, LazyCaller::External)
            }
        }
    }
}

/// Calls an imported host function from WebAssembly code.
pub(crate) fn call_import(store: &mut Store, func: Func, args: &[Val]) -> crate::Result<Option<Val>> {
    let ty = func.ty(store).clone();
    match func.kind(store) {
        FuncKind::Host(host) => {
            let result = host(store, args).map_err(Error::Host)?;
            coerce_result(&ty, result)
        }
        FuncKind::Wasm { .. } => func.call(store, args),
    }
}

fn coerce_args(ty: &FuncType, params: &[Val]) -> crate::Result<Vec<Val>> {
    if params.len() != ty.params().len() {
        return Err(Error::Type(format!(
            "expected {} arguments, got {}",
            ty.params().len(),
            params.len()
        )));
    }
    params
        .iter()
        .zip(ty.params())
        .enumerate()
        .map(|(i, (val, expected))| {
            val.coerce(*expected).ok_or_else(|| {
                Error::Type(format!(
                    "argument {i} of type {} cannot be converted to {expected}",
                    val.ty()
                ))
            })
        })
        .collect()
}

/// Converts a host result to the declared result type. A missing result
/// converts like an undefined host value.
fn coerce_result(ty: &FuncType, result: Option<Val>) -> crate::Result<Option<Val>> {
    let Some(expected) = ty.result() else {
        return Ok(None);
    };
    let converted = match result {
        Some(val) => val.coerce(expected),
        None => Val::from_number(f64::NAN, expected),
    };
    converted.map(Some).ok_or_else(|| {
        Error::Type(format!(
            "host result cannot be converted to {expected}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use crate::types::ValType;

    #[test_log::test]
    fn host_call_coerces() {
        let mut store = Store::new(&Engine::default());
        let ty = FuncType::new([ValType::I32], [ValType::F64]);
        let func = Func::new(&mut store, ty, |_, args| {
            Ok(Some(Val::I32(args[0].unwrap_i32() * 2)))
        });

        let result = func.call(&mut store, &[Val::from_f64(3.9)]).unwrap();
        assert_eq!(result, Some(Val::from_f64(6.0)));

        let err = func.call(&mut store, &[]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Type);
    }

    #[test_log::test]
    fn missing_result_is_undefined() {
        let mut store = Store::new(&Engine::default());
        let ty = FuncType::new([], [ValType::I32]);
        let func = Func::new(&mut store, ty, |_, _| Ok(None));
        assert_eq!(func.call(&mut store, &[]).unwrap(), Some(Val::I32(0)));
    }

    #[test_log::test]
    fn host_errors_are_wrapped() {
        let mut store = Store::new(&Engine::default());
        let func = Func::new(&mut store, FuncType::new([], []), |_, _| {
            anyhow::bail!("boom")
        });
        let err = func.call(&mut store, &[]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Host);
        assert!(err.to_string().contains("boom"));
    }
}
