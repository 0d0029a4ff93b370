// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::store::Stored;
use crate::types::ValType;
use crate::values::Val;

pub type GlobalsAddr = Stored<GlobalsBuffer>;

/// Backing storage for all globals of one instance, each global at the offset
/// assigned to it during translation.
#[derive(Debug, Default)]
pub struct GlobalsBuffer {
    bytes: Vec<u8>,
}

impl GlobalsBuffer {
    pub(crate) fn new(size: u32) -> Self {
        Self {
            bytes: vec![0; size as usize],
        }
    }

    pub(crate) fn read(&self, offset: u32, ty: ValType) -> Option<Val> {
        Val::from_le_bytes(ty, self.bytes.get(offset as usize..)?)
    }

    /// Returns `false` if the value does not fit at `offset`.
    pub(crate) fn write(&mut self, offset: u32, val: Val) -> bool {
        let (bytes, len) = val.to_le_bytes();
        let start = offset as usize;
        match self.bytes.get_mut(start..start + len) {
            Some(dst) => {
                dst.copy_from_slice(&bytes[..len]);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_globals() {
        let mut buffer = GlobalsBuffer::new(16);
        assert!(buffer.write(0, Val::I32(-7)));
        assert!(buffer.write(8, Val::from_f64(1.5)));

        assert_eq!(buffer.read(0, ValType::I32), Some(Val::I32(-7)));
        assert_eq!(buffer.read(8, ValType::F64), Some(Val::from_f64(1.5)));
        assert_eq!(buffer.read(12, ValType::F64), None);
        assert!(!buffer.write(12, Val::I64(1)));
    }

    #[test]
    fn empty_buffer_rejects_access() {
        let mut buffer = GlobalsBuffer::default();
        assert_eq!(buffer.read(0, ValType::I32), None);
        assert!(!buffer.write(0, Val::I32(1)));
    }
}
