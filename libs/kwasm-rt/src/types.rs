// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::indices::SigId;
use crate::wasm_unsupported;
use core::fmt;
use cranelift_entity::PrimaryMap;
use hashbrown::HashMap;
use parking_lot::RwLock;

/// WebAssembly value types supported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    /// Converts a `wasmparser` value type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`](crate::Error::Unsupported) for vector and
    /// reference types.
    pub fn from_wasmparser(ty: wasmparser::ValType) -> crate::Result<Self> {
        match ty {
            wasmparser::ValType::I32 => Ok(Self::I32),
            wasmparser::ValType::I64 => Ok(Self::I64),
            wasmparser::ValType::F32 => Ok(Self::F32),
            wasmparser::ValType::F64 => Ok(Self::F64),
            ty => Err(wasm_unsupported!("value type {ty:?}")),
        }
    }

    /// Size in bytes of a value of this type in a globals buffer.
    pub const fn byte_size(self) -> u32 {
        match self {
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => f.write_str("i32"),
            ValType::I64 => f.write_str("i64"),
            ValType::F32 => f.write_str("f32"),
            ValType::F64 => f.write_str("f64"),
        }
    }
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    params: Box<[ValType]>,
    results: Box<[ValType]>,
}

impl FuncType {
    pub fn new(
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    pub(crate) fn from_wasmparser(ty: &wasmparser::FuncType) -> crate::Result<Self> {
        let params = ty
            .params()
            .iter()
            .map(|ty| ValType::from_wasmparser(*ty))
            .collect::<crate::Result<Box<[_]>>>()?;
        let results = ty
            .results()
            .iter()
            .map(|ty| ValType::from_wasmparser(*ty))
            .collect::<crate::Result<Box<[_]>>>()?;

        if results.len() > 1 {
            return Err(wasm_unsupported!("multi-value returns"));
        }

        Ok(Self { params, results })
    }

    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    pub fn results(&self) -> &[ValType] {
        &self.results
    }

    /// The single result type, if any.
    pub fn result(&self) -> Option<ValType> {
        self.results.first().copied()
    }

    /// Whether a host boundary crossing with this signature is forbidden.
    pub fn has_i64(&self) -> bool {
        self.params
            .iter()
            .chain(self.results.iter())
            .any(|ty| *ty == ValType::I64)
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, ty) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            fmt::Display::fmt(ty, f)?;
        }
        f.write_str(") -> (")?;
        for (i, ty) in self.results.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            fmt::Display::fmt(ty, f)?;
        }
        f.write_str(")")
    }
}

/// Limits of a function table, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub initial: u32,
    pub maximum: Option<u32>,
}

impl TableType {
    pub(crate) fn from_wasmparser(ty: &wasmparser::TableType) -> crate::Result<Self> {
        if !ty.element_type.is_func_ref() {
            return Err(wasm_unsupported!("table element type {:?}", ty.element_type));
        }
        Ok(Self {
            initial: u32::try_from(ty.initial)
                .map_err(|_| wasm_unsupported!("64-bit table sizes"))?,
            maximum: ty
                .maximum
                .map(u32::try_from)
                .transpose()
                .map_err(|_| wasm_unsupported!("64-bit table sizes"))?,
        })
    }
}

/// Limits of a linear memory, in 64 KiB pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub initial: u32,
    pub maximum: Option<u32>,
    pub shared: bool,
}

impl MemoryType {
    pub(crate) fn from_wasmparser(ty: &wasmparser::MemoryType) -> crate::Result<Self> {
        if ty.memory64 {
            return Err(wasm_unsupported!("64-bit memories"));
        }
        Ok(Self {
            initial: u32::try_from(ty.initial)
                .map_err(|_| wasm_unsupported!("memory larger than 4GiB"))?,
            maximum: ty
                .maximum
                .map(u32::try_from)
                .transpose()
                .map_err(|_| wasm_unsupported!("memory larger than 4GiB"))?,
            shared: ty.shared,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub content_type: ValType,
    pub mutable: bool,
}

/// Engine-wide registry assigning each distinct signature a [`SigId`].
#[derive(Debug, Default)]
pub struct SignatureRegistry {
    inner: RwLock<SignatureRegistryInner>,
}

#[derive(Debug, Default)]
struct SignatureRegistryInner {
    map: HashMap<FuncType, SigId>,
    types: PrimaryMap<SigId, FuncType>,
}

impl SignatureRegistry {
    /// Returns the canonical index of `ty`, registering it on first use.
    pub fn register(&self, ty: &FuncType) -> SigId {
        if let Some(id) = self.inner.read().map.get(ty) {
            return *id;
        }

        let mut inner = self.inner.write();
        if let Some(id) = inner.map.get(ty) {
            return *id;
        }
        let id = inner.types.push(ty.clone());
        inner.map.insert(ty.clone(), id);
        id
    }

    pub fn lookup(&self, id: SigId) -> Option<FuncType> {
        self.inner.read().types.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_signatures() {
        let registry = SignatureRegistry::default();
        let a = registry.register(&FuncType::new([ValType::I32], [ValType::I32]));
        let b = registry.register(&FuncType::new([ValType::I64], []));
        let c = registry.register(&FuncType::new([ValType::I32], [ValType::I32]));

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.lookup(b),
            Some(FuncType::new([ValType::I64], []))
        );
    }

    #[test]
    fn display() {
        let ty = FuncType::new([ValType::I32, ValType::F64], [ValType::I64]);
        assert_eq!(ty.to_string(), "(i32, f64) -> (i64)");
        assert!(ty.has_i64());
    }
}
