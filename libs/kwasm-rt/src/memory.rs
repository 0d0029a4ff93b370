// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::errors::Error;
use crate::ops::{WASM32_MAX_PAGES, WASM_PAGE_SIZE};
use crate::store::{Store, Stored};
use crate::types::MemoryType;
use core::fmt;

/// A WebAssembly linear memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Memory(pub(crate) Stored<MemoryData>);

/// Error for out of bounds [`Memory`] access.
#[derive(Debug)]
#[non_exhaustive]
pub struct MemoryAccessError {
    // Keep struct internals private for future extensibility.
    _private: (),
}

impl fmt::Display for MemoryAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of bounds memory access")
    }
}

impl core::error::Error for MemoryAccessError {}

#[derive(Debug)]
pub struct MemoryData {
    bytes: Vec<u8>,
    maximum: Option<u32>,
    shared: bool,
}

impl MemoryData {
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub(crate) fn pages(&self) -> u32 {
        u32::try_from(self.bytes.len() / WASM_PAGE_SIZE).unwrap_or(u32::MAX)
    }

    pub(crate) fn maximum(&self) -> Option<u32> {
        self.maximum
    }

    pub(crate) fn shared(&self) -> bool {
        self.shared
    }

    /// Grows by `delta` pages, staying within `limit`. Returns the previous
    /// size in pages.
    fn grow(&mut self, delta: u32, limit: u32) -> Option<u32> {
        let old = self.pages();
        let new = old.checked_add(delta)?;
        if new > limit {
            return None;
        }
        self.bytes.resize(new as usize * WASM_PAGE_SIZE, 0);
        Some(old)
    }
}

// ===== impl Memory =====

impl Memory {
    /// Allocates a zeroed memory of `ty.initial` pages.
    ///
    /// # Errors
    ///
    /// Returns a range error if the initial size exceeds the engine limit or
    /// the declared maximum.
    pub fn new(store: &mut Store, ty: MemoryType) -> crate::Result<Self> {
        let limit = store.engine().config().max_mem_pages.min(WASM32_MAX_PAGES);
        if ty.initial > limit {
            return Err(Error::Range(
                "Out of memory: wasm memory too large".to_string(),
            ));
        }
        if let Some(maximum) = ty.maximum
            && maximum < ty.initial
        {
            return Err(Error::Range(format!(
                "memory maximum {maximum} is below its initial size {}",
                ty.initial
            )));
        }

        tracing::trace!("allocating memory of {} pages", ty.initial);
        let data = MemoryData {
            bytes: vec![0; ty.initial as usize * WASM_PAGE_SIZE],
            maximum: ty.maximum,
            shared: ty.shared,
        };
        Ok(Self(store.add_memory(data)))
    }

    pub fn ty(&self, store: &Store) -> MemoryType {
        let data = &store[self.0];
        MemoryType {
            initial: data.pages(),
            maximum: data.maximum,
            shared: data.shared,
        }
    }

    /// Current size in pages.
    pub fn size(&self, store: &Store) -> u32 {
        store[self.0].pages()
    }

    /// Grows the memory by `delta` pages and returns the previous size.
    ///
    /// # Errors
    ///
    /// Returns a range error if the new size exceeds the maximum.
    pub fn grow(&self, store: &mut Store, delta: u32) -> crate::Result<u32> {
        self.grow_pages(store, delta)
            .ok_or_else(|| Error::Range("Unable to grow instance memory.".to_string()))
    }

    pub(crate) fn grow_pages(&self, store: &mut Store, delta: u32) -> Option<u32> {
        let engine_limit = store.engine().config().max_mem_pages.min(WASM32_MAX_PAGES);
        let data = &mut store[self.0];
        let limit = data.maximum.map_or(engine_limit, |max| max.min(engine_limit));
        data.grow(delta, limit)
    }

    /// Copies `buffer.len()` bytes starting at `offset` into `buffer`.
    ///
    /// # Errors
    ///
    /// Fails if the range is not entirely within the memory.
    pub fn read(
        &self,
        store: &Store,
        offset: usize,
        buffer: &mut [u8],
    ) -> Result<(), MemoryAccessError> {
        let data = self.data(store);
        let src = offset
            .checked_add(buffer.len())
            .and_then(|end| data.get(offset..end))
            .ok_or(MemoryAccessError { _private: () })?;
        buffer.copy_from_slice(src);
        Ok(())
    }

    /// Copies `buffer` into the memory starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the range is not entirely within the memory.
    pub fn write(
        &self,
        store: &mut Store,
        offset: usize,
        buffer: &[u8],
    ) -> Result<(), MemoryAccessError> {
        let data = self.data_mut(store);
        let dst = offset
            .checked_add(buffer.len())
            .and_then(|end| data.get_mut(offset..end))
            .ok_or(MemoryAccessError { _private: () })?;
        dst.copy_from_slice(buffer);
        Ok(())
    }

    pub fn data<'a>(&self, store: &'a Store) -> &'a [u8] {
        store[self.0].bytes()
    }

    pub fn data_mut<'a>(&self, store: &'a mut Store) -> &'a mut [u8] {
        store[self.0].bytes_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Engine};

    #[test_log::test]
    fn grow_respects_maximum() {
        let mut store = Store::new(&Engine::default());
        let memory = Memory::new(
            &mut store,
            MemoryType {
                initial: 1,
                maximum: Some(2),
                shared: false,
            },
        )
        .unwrap();

        assert_eq!(memory.size(&store), 1);
        assert_eq!(memory.grow(&mut store, 1).unwrap(), 1);
        assert_eq!(memory.data(&store).len(), 2 * WASM_PAGE_SIZE);
        assert!(memory.grow(&mut store, 1).is_err());
        assert_eq!(memory.grow(&mut store, 0).unwrap(), 2);
    }

    #[test_log::test]
    fn engine_page_limit() {
        let mut config = Config::new();
        config.max_mem_pages(4);
        let mut store = Store::new(&Engine::new(config));

        let ty = MemoryType {
            initial: 5,
            maximum: None,
            shared: false,
        };
        let err = Memory::new(&mut store, ty).unwrap_err();
        assert_eq!(
            err.to_string(),
            "RangeError: Out of memory: wasm memory too large"
        );

        let memory = Memory::new(&mut store, MemoryType { initial: 3, ..ty }).unwrap();
        assert!(memory.grow(&mut store, 2).is_err());
        assert_eq!(memory.grow(&mut store, 1).unwrap(), 3);
    }

    #[test_log::test]
    fn read_write_bounds() {
        let mut store = Store::new(&Engine::default());
        let ty = MemoryType {
            initial: 1,
            maximum: None,
            shared: false,
        };
        let memory = Memory::new(&mut store, ty).unwrap();

        memory.write(&mut store, 8, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0; 4];
        memory.read(&store, 8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        assert!(memory.write(&mut store, WASM_PAGE_SIZE - 2, &[0; 4]).is_err());
        assert!(memory.read(&store, usize::MAX, &mut buf).is_err());
    }
}
