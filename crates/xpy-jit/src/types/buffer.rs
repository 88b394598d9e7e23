//! Buffers: `struct { int size; char *data; }` passed by pointer

use cranelift_codegen::ir::{self, InstBuilder, MemFlags, types};

use crate::error::Result;
use crate::helpers::GeneratedHelper;
use crate::translator::FunctionTranslator;
use crate::types::{MethodType, SubscriptableType, TypeId};
use crate::value::ValueId;

/// Layout of the buffer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferType {
    /// Offset of the `int size` field
    pub size_offset: i32,
    /// Offset of the `char *data` field
    pub data_offset: i32,
    /// Size of the header in bytes
    pub size: u32,
    pointer: ir::Type,
}

impl BufferType {
    /// C layout for a target with the given pointer type
    pub fn new(pointer: ir::Type) -> Self {
        let ptr_bytes = pointer.bytes();
        let data_offset = types::I32.bytes().next_multiple_of(ptr_bytes);
        Self {
            size_offset: 0,
            data_offset: data_offset as i32,
            size: data_offset + ptr_bytes,
            pointer,
        }
    }

    /// Address of `container[index]` after the bound check
    fn element_address(
        &self,
        cx: &mut FunctionTranslator<'_>,
        container: ValueId,
        index: ValueId,
    ) -> Result<ir::Value> {
        let buffer = cx.value(container)?;
        let (index, signed) = cx.wide_int(index)?;
        cx.call_generated(GeneratedHelper::BoundCheck { signed }, &[buffer, index])?;

        let data = cx
            .ins()
            .load(self.pointer, MemFlags::trusted(), buffer, self.data_offset);
        // past the check the index is below `size`, so it fits a pointer
        let offset = if self.pointer.bits() < types::I64.bits() {
            cx.ins().ireduce(self.pointer, index)
        } else {
            index
        };
        Ok(cx.ins().iadd(data, offset))
    }
}

impl SubscriptableType for BufferType {
    fn load_item(
        &self,
        cx: &mut FunctionTranslator<'_>,
        container: ValueId,
        index: ValueId,
    ) -> Result<ValueId> {
        let address = self.element_address(cx, container, index)?;
        let byte = cx.ins().load(types::I8, MemFlags::trusted(), address, 0);
        cx.temporary(TypeId::BYTE, byte)
    }

    fn store_item(
        &self,
        cx: &mut FunctionTranslator<'_>,
        container: ValueId,
        index: ValueId,
        value: ValueId,
    ) -> Result<()> {
        let value = cx.coerce(value, TypeId::BYTE)?;
        let byte = cx.value(value)?;
        let address = self.element_address(cx, container, index)?;
        cx.ins().store(MemFlags::trusted(), byte, address, 0);
        Ok(())
    }
}

impl MethodType for BufferType {
    fn call_method(
        &self,
        cx: &mut FunctionTranslator<'_>,
        method: &str,
        receiver: ValueId,
    ) -> Result<Option<ValueId>> {
        match method {
            "len" => {
                let buffer = cx.value(receiver)?;
                let size = cx
                    .ins()
                    .load(types::I32, MemFlags::trusted(), buffer, self.size_offset);
                Ok(Some(cx.computed(size, TypeId::INT)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_64() {
        let b = BufferType::new(types::I64);
        assert_eq!(b.size_offset, 0);
        assert_eq!(b.data_offset, 8);
        assert_eq!(b.size, 16);
    }

    #[test]
    fn test_layout_32() {
        let b = BufferType::new(types::I32);
        assert_eq!(b.data_offset, 4);
        assert_eq!(b.size, 8);
    }
}
