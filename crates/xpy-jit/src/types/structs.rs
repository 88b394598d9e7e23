//! Structs with C layout
//!
//! A struct value is an address. For `Name` types the address is passed
//! around as a pointer; for `Name.value` types it is the address of storage
//! owned by the enclosing object (a global or an embedding struct).

use cranelift_codegen::ir::{InstBuilder, MemFlags};

use crate::error::{JitError, Result};
use crate::translator::FunctionTranslator;
use crate::types::{FieldAccessType, Type, TypeId};
use crate::value::{Rvalue, ValueId};

/// A struct field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name
    pub name: String,
    /// Field type
    pub ty: TypeId,
    /// Byte offset from the struct address
    pub offset: u32,
}

/// A struct layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructType {
    /// Struct name
    pub name: String,
    /// Fields in declaration order
    pub fields: Vec<Field>,
    /// Size in bytes, padded to the alignment
    pub size: u32,
    /// Alignment in bytes
    pub align: u32,
}

impl StructType {
    /// Slot reserved before the fields are resolved
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            size: 0,
            align: 1,
        }
    }

    /// Lay out fields given as `(name, type, size, align)`
    pub fn layout(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (String, TypeId, u32, u32)>,
    ) -> Self {
        let mut offset = 0u32;
        let mut align = 1u32;
        let fields = fields
            .into_iter()
            .map(|(name, ty, field_size, field_align)| {
                let field_offset = offset.next_multiple_of(field_align);
                offset = field_offset + field_size;
                align = align.max(field_align);
                Field {
                    name,
                    ty,
                    offset: field_offset,
                }
            })
            .collect();
        Self {
            name: name.into(),
            fields,
            size: offset.next_multiple_of(align),
            align,
        }
    }

    /// Look up a field
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn require_field(&self, name: &str) -> Result<&Field> {
        self.field(name).ok_or_else(|| JitError::UnknownField {
            ty: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// Store the default value (zero or null) into every field, recursing
    /// into embedded value structs
    pub(crate) fn store_defaults(
        &self,
        cx: &mut FunctionTranslator<'_>,
        object: ValueId,
    ) -> Result<()> {
        for field in &self.fields {
            match cx.types().get(field.ty).clone() {
                Type::ValueStruct(nested) => {
                    let inner = self.load_field(cx, object, &field.name)?;
                    nested.store_defaults(cx, inner)?;
                }
                other => {
                    let ir = other
                        .ir_type(cx.pointer_type())
                        .ok_or_else(|| JitError::mismatch("field type", other.name()))?;
                    let base = cx.value(object)?;
                    let zero = cx.ins().iconst(ir, 0);
                    cx.ins()
                        .store(MemFlags::trusted(), zero, base, field.offset as i32);
                }
            }
        }
        Ok(())
    }
}

impl FieldAccessType for StructType {
    fn load_field(
        &self,
        cx: &mut FunctionTranslator<'_>,
        object: ValueId,
        field: &str,
    ) -> Result<ValueId> {
        let field = self.require_field(field)?;
        let base = cx.value(object)?;
        let ty = cx.types().get(field.ty).clone();
        match ty {
            Type::ValueStruct(_) => {
                let address = cx.ins().iadd_imm(base, i64::from(field.offset));
                Ok(cx.alloc(Rvalue::address(address, field.ty)))
            }
            other => {
                let ir = other
                    .ir_type(cx.pointer_type())
                    .ok_or_else(|| JitError::mismatch("field type", other.name()))?;
                let loaded = cx
                    .ins()
                    .load(ir, MemFlags::trusted(), base, field.offset as i32);
                if other.is_by_copy() {
                    cx.temporary(field.ty, loaded)
                } else {
                    Ok(cx.computed(loaded, field.ty))
                }
            }
        }
    }

    fn store_field(
        &self,
        cx: &mut FunctionTranslator<'_>,
        object: ValueId,
        field: &str,
        value: ValueId,
    ) -> Result<()> {
        let field = self.require_field(field)?;
        if let Type::ValueStruct(nested) = cx.types().get(field.ty) {
            return Err(JitError::mismatch(
                format!("assignable field of {}", self.name),
                format!("{}.value", nested.name),
            ));
        }
        let value = cx.coerce(value, field.ty)?;
        let v = cx.value(value)?;
        let base = cx.value(object)?;
        cx.ins()
            .store(MemFlags::trusted(), v, base, field.offset as i32);
        Ok(())
    }
}
