//! Host-side values handed to compiled code

use crate::error::{JitError, Result};

/// C layout of a `buffer` argument: `struct { int size; char *data; }`.
#[repr(C)]
#[derive(Debug)]
pub struct RawBuffer {
    /// Number of bytes
    pub size: i32,
    /// First byte
    pub data: *mut u8,
}

/// A byte buffer owned by the host and passed to compiled code by pointer.
///
/// The header is boxed so its address stays fixed while the buffer lives.
#[derive(Debug)]
pub struct HostBuffer {
    raw: Box<RawBuffer>,
    bytes: Vec<u8>,
}

impl HostBuffer {
    /// Wrap `bytes`
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let mut bytes = bytes.into();
        let size = i32::try_from(bytes.len()).map_err(|_| JitError::BufferTooLarge(bytes.len()))?;
        let raw = Box::new(RawBuffer {
            size,
            data: bytes.as_mut_ptr(),
        });
        Ok(Self { raw, bytes })
    }

    /// Argument word for [`crate::JitCompiler::invoke`]
    pub fn as_arg(&mut self) -> i64 {
        &mut *self.raw as *mut RawBuffer as usize as i64
    }

    /// Current contents
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferType;
    use cranelift_codegen::ir::types;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_layout_matches_compiled_buffer() {
        let pointer = if cfg!(target_pointer_width = "64") {
            types::I64
        } else {
            types::I32
        };
        let compiled = BufferType::new(pointer);
        assert_eq!(offset_of!(RawBuffer, size), compiled.size_offset as usize);
        assert_eq!(offset_of!(RawBuffer, data), compiled.data_offset as usize);
        assert_eq!(size_of::<RawBuffer>(), compiled.size as usize);
    }

    #[test]
    fn test_from_bytes() {
        let mut buffer = HostBuffer::from_bytes(b"abc".to_vec()).unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.bytes(), b"abc");
        assert_ne!(buffer.as_arg(), 0);
        assert!(HostBuffer::from_bytes(Vec::new()).unwrap().is_empty());
    }
}
