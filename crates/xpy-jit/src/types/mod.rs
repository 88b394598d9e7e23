//! Type registry
//!
//! The set of types is closed: void, bool, a handful of fixed-width
//! integers, raw pointers, buffers and structs. Each type knows its backend
//! representation, whether it is copied or referenced, and (through the
//! capability traits below) which operations it supports.
//!
//! Types live in an arena owned by [`TypeRegistry`]; a [`TypeId`] is an index
//! into it. Named types are inserted once and never change afterwards.

mod buffer;
mod integer;
mod pointer;
mod structs;

use cranelift_codegen::ir::{self, types};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use xpy_bytecode::{CompareOp, Constant, StructDef, TypeTag};

use crate::error::{JitError, Result};
use crate::translator::FunctionTranslator;
use crate::value::ValueId;

pub use buffer::BufferType;
pub use integer::{ArithOp, IntType};
pub use pointer::PointerKind;
pub(crate) use pointer::compare_addresses;
pub use structs::{Field, StructType};

/// Index of a type in its [`TypeRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    /// `void`
    pub const VOID: Self = Self(0);
    /// `bool` (comparison results)
    pub const BOOL: Self = Self(1);
    /// `int`, the default integer
    pub const INT: Self = Self(2);
    /// `byte`
    pub const BYTE: Self = Self(3);
    /// `ushort`
    pub const USHORT: Self = Self(4);
    /// `uint`
    pub const UINT: Self = Self(5);
    /// `unsigned`
    pub const UNSIGNED: Self = Self(6);
    /// `ssize`
    pub const SSIZE: Self = Self(7);
    /// `opaque`
    pub const OPAQUE: Self = Self(8);
    /// `cstr`
    pub const CSTR: Self = Self(9);
    /// `memory`
    pub const MEMORY: Self = Self(10);
    /// `buffer`
    pub const BUFFER: Self = Self(11);

    /// Type at arena index `index`
    pub fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// No value
    Void,
    /// Result of a comparison
    Bool,
    /// Fixed-width integer
    Int(IntType),
    /// Raw pointer
    Pointer(PointerKind),
    /// Buffer passed by pointer
    Buffer(BufferType),
    /// Struct accessed through a pointer
    Struct(StructType),
    /// Struct accessed by address
    ValueStruct(StructType),
}

impl Type {
    /// Type name as written in type tags
    pub fn name(&self) -> String {
        match self {
            Self::Void => "void".to_string(),
            Self::Bool => "bool".to_string(),
            Self::Int(int) => int.name.to_string(),
            Self::Pointer(kind) => kind.name().to_string(),
            Self::Buffer(_) => "buffer".to_string(),
            Self::Struct(s) => s.name.clone(),
            Self::ValueStruct(s) => format!("{}.value", s.name),
        }
    }

    /// Backend representation; `None` for void
    pub fn ir_type(&self, pointer: ir::Type) -> Option<ir::Type> {
        match self {
            Self::Void => None,
            Self::Bool => Some(types::I8),
            Self::Int(int) => Some(int.ir),
            Self::Pointer(_) | Self::Buffer(_) | Self::Struct(_) | Self::ValueStruct(_) => {
                Some(pointer)
            }
        }
    }

    /// Copied on load (integers, bool); everything else is referenced
    pub fn is_by_copy(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Bool)
    }

    /// Size and alignment when stored as a struct field
    pub fn storage(&self, pointer: ir::Type) -> Option<(u32, u32)> {
        match self {
            Self::Void => None,
            Self::ValueStruct(s) => Some((s.size, s.align)),
            other => other.ir_type(pointer).map(|ty| (ty.bytes(), ty.bytes())),
        }
    }

    /// Integer view
    pub fn as_int(&self) -> Option<&IntType> {
        match self {
            Self::Int(int) => Some(int),
            _ => None,
        }
    }

    /// Struct layout of struct and value-struct types
    pub fn as_struct(&self) -> Option<&StructType> {
        match self {
            Self::Struct(s) | Self::ValueStruct(s) => Some(s),
            _ => None,
        }
    }

    /// Arithmetic capability
    pub fn as_arithmetic(&self) -> Option<&dyn ArithmeticType> {
        match self {
            Self::Int(int) => Some(int),
            _ => None,
        }
    }

    /// Element access capability
    pub fn as_subscriptable(&self) -> Option<&dyn SubscriptableType> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Field access capability
    pub fn as_field_access(&self) -> Option<&dyn FieldAccessType> {
        match self {
            Self::Struct(s) | Self::ValueStruct(s) => Some(s),
            _ => None,
        }
    }

    /// Method capability
    pub fn as_method(&self) -> Option<&dyn MethodType> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }
}

/// Types with `+ - * //` and ordered comparison.
pub trait ArithmeticType {
    /// Emit `lhs <op> rhs`; both operands already have type `ty`
    fn binary_op(
        &self,
        cx: &mut FunctionTranslator<'_>,
        op: ArithOp,
        ty: TypeId,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<ValueId>;

    /// Emit a comparison producing a `bool`
    fn compare(
        &self,
        cx: &mut FunctionTranslator<'_>,
        op: CompareOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<ValueId>;
}

/// Types with `container[index]`.
pub trait SubscriptableType {
    /// Emit `container[index]`
    fn load_item(
        &self,
        cx: &mut FunctionTranslator<'_>,
        container: ValueId,
        index: ValueId,
    ) -> Result<ValueId>;

    /// Emit `container[index] = value`
    fn store_item(
        &self,
        cx: &mut FunctionTranslator<'_>,
        container: ValueId,
        index: ValueId,
        value: ValueId,
    ) -> Result<()>;
}

/// Types with named fields.
pub trait FieldAccessType {
    /// Emit `object.field`
    fn load_field(
        &self,
        cx: &mut FunctionTranslator<'_>,
        object: ValueId,
        field: &str,
    ) -> Result<ValueId>;

    /// Emit `object.field = value`
    fn store_field(
        &self,
        cx: &mut FunctionTranslator<'_>,
        object: ValueId,
        field: &str,
        value: ValueId,
    ) -> Result<()>;
}

/// Types with single-argument builtin calls (`len(x)`).
pub trait MethodType {
    /// Emit `method(receiver)`; `Ok(None)` when the type has no such method
    fn call_method(
        &self,
        cx: &mut FunctionTranslator<'_>,
        method: &str,
        receiver: ValueId,
    ) -> Result<Option<ValueId>>;
}

/// Arena of types with a name index.
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<Type>,
    names: FxHashMap<String, TypeId>,
    pointer: ir::Type,
}

impl TypeRegistry {
    /// Registry with the primitive types for a target with the given pointer type
    pub fn new(pointer: ir::Type) -> Self {
        let mut registry = Self {
            types: Vec::new(),
            names: FxHashMap::default(),
            pointer,
        };
        let primitives = [
            (TypeId::VOID, Type::Void),
            (TypeId::BOOL, Type::Bool),
            (TypeId::INT, Type::Int(IntType::new("int", types::I32, true))),
            (TypeId::BYTE, Type::Int(IntType::new("byte", types::I8, false))),
            (TypeId::USHORT, Type::Int(IntType::new("ushort", types::I16, false))),
            (TypeId::UINT, Type::Int(IntType::new("uint", types::I32, false))),
            (TypeId::UNSIGNED, Type::Int(IntType::new("unsigned", types::I64, false))),
            (TypeId::SSIZE, Type::Int(IntType::new("ssize", pointer, true))),
            (TypeId::OPAQUE, Type::Pointer(PointerKind::Opaque)),
            (TypeId::CSTR, Type::Pointer(PointerKind::CStr)),
            (TypeId::MEMORY, Type::Pointer(PointerKind::Memory)),
            (TypeId::BUFFER, Type::Buffer(BufferType::new(pointer))),
        ];
        for (expected, ty) in primitives {
            let id = registry.insert(ty.name(), ty);
            debug_assert_eq!(id, expected);
        }
        registry
    }

    /// Host pointer type
    pub fn pointer_type(&self) -> ir::Type {
        self.pointer
    }

    /// Borrow a type
    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.index()]
    }

    /// Name of a type
    pub fn name(&self, id: TypeId) -> String {
        self.get(id).name()
    }

    /// Integer view of a type
    pub fn int(&self, id: TypeId) -> Option<IntType> {
        self.get(id).as_int().copied()
    }

    /// Look up a type by name
    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.names.get(name).copied()
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Insert a named type unless the name is taken; returns the cached id
    pub fn insert(&mut self, name: impl Into<String>, ty: Type) -> TypeId {
        let name = name.into();
        if let Some(&id) = self.names.get(&name) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        self.names.insert(name, id);
        id
    }

    /// Type of a literal: integers are `int`, strings `cstr`, `None` is a
    /// null `opaque`; tuples are untyped
    pub fn literal_type(&self, constant: &Constant) -> Option<TypeId> {
        match constant {
            Constant::Int(_) => Some(TypeId::INT),
            Constant::Str(_) => Some(TypeId::CSTR),
            Constant::None => Some(TypeId::OPAQUE),
            Constant::Tuple(_) => None,
        }
    }

    /// Resolve a type tag
    pub fn resolve(&mut self, tag: &TypeTag) -> Result<TypeId> {
        let id = match tag {
            TypeTag::Void => TypeId::VOID,
            TypeTag::Int => TypeId::INT,
            TypeTag::Byte => TypeId::BYTE,
            TypeTag::UShort => TypeId::USHORT,
            TypeTag::UInt => TypeId::UINT,
            TypeTag::Unsigned => TypeId::UNSIGNED,
            TypeTag::SSize => TypeId::SSIZE,
            TypeTag::Opaque => TypeId::OPAQUE,
            TypeTag::CStr => TypeId::CSTR,
            TypeTag::Memory => TypeId::MEMORY,
            TypeTag::Buffer => TypeId::BUFFER,
            TypeTag::Struct(name) => self.struct_id(name)?,
            TypeTag::ValueStruct(name) => {
                let value_name = format!("{name}.value");
                if let Some(id) = self.lookup(&value_name) {
                    return Ok(id);
                }
                let layout = self.get(self.struct_id(name)?).as_struct().cloned();
                let layout = layout.ok_or_else(|| JitError::UnknownType(tag.to_string()))?;
                self.insert(value_name, Type::ValueStruct(layout))
            }
        };
        Ok(id)
    }

    fn struct_id(&self, name: &str) -> Result<TypeId> {
        match self.lookup(name) {
            Some(id) if matches!(self.get(id), Type::Struct(_)) => Ok(id),
            _ => Err(JitError::UnknownType(name.to_string())),
        }
    }

    /// Register struct definitions.
    ///
    /// Every name is reserved before any field is resolved, so structs may
    /// point at each other (and at themselves) in any order. Embedding a
    /// value struct requires its layout first; a cycle of embeddings is an
    /// error.
    pub fn declare_structs(&mut self, defs: &[StructDef]) -> Result<()> {
        for def in defs {
            if self.lookup(&def.name).is_some() {
                return Err(JitError::DuplicateDefinition(def.name.clone()));
            }
            self.insert(def.name.clone(), Type::Struct(StructType::placeholder(&def.name)));
        }

        let pending: FxHashMap<&str, &StructDef> =
            defs.iter().map(|def| (def.name.as_str(), def)).collect();
        let mut visiting = FxHashSet::default();
        let mut done = FxHashSet::default();
        for def in defs {
            self.resolve_struct(def, &pending, &mut visiting, &mut done)?;
        }
        Ok(())
    }

    fn resolve_struct(
        &mut self,
        def: &StructDef,
        pending: &FxHashMap<&str, &StructDef>,
        visiting: &mut FxHashSet<String>,
        done: &mut FxHashSet<String>,
    ) -> Result<TypeId> {
        let id = self.struct_id(&def.name)?;
        if done.contains(&def.name) {
            return Ok(id);
        }
        if !visiting.insert(def.name.clone()) {
            return Err(JitError::RecursiveValueStruct(def.name.clone()));
        }

        let mut fields = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            if let TypeTag::ValueStruct(inner) = &field.ty {
                if let Some(inner_def) = pending.get(inner.as_str()) {
                    self.resolve_struct(inner_def, pending, visiting, done)?;
                }
            }
            let ty = self.resolve(&field.ty)?;
            let (size, align) = self
                .get(ty)
                .storage(self.pointer)
                .ok_or_else(|| JitError::UnknownType(format!("{}.{}: void", def.name, field.name)))?;
            fields.push((field.name.clone(), ty, size, align));
        }

        let layout = StructType::layout(def.name.clone(), fields);
        debug!(
            name = %def.name,
            size = layout.size,
            align = layout.align,
            "struct layout"
        );
        self.types[id.index()] = Type::Struct(layout);
        visiting.remove(&def.name);
        done.insert(def.name.clone());
        Ok(id)
    }
}
