//! IR values
//!
//! Every entry of the simulated operand stack and every local slot is an
//! [`Rvalue`] in a per-function [`ValueArena`]. The backend handle of a value
//! is produced on first use and memoized.

use std::cell::OnceCell;

use cranelift_codegen::ir;
use cranelift_frontend::Variable;
use xpy_bytecode::Constant;

use crate::types::TypeId;

/// Index of a value in its [`ValueArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(u32);

impl ValueId {
    /// Arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Backend handle of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
    /// A frontend variable (parameters, locals, temporaries); read with `use_var`
    Var(Variable),
    /// An SSA value
    Value(ir::Value),
    /// Address of a memory object
    Address(ir::Value),
}

/// What a value is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// A literal
    Constant(Constant),
    /// Function parameter `n`
    Param(u16),
    /// Local slot `n`
    Local(u16),
    /// Materialized copy of a by-copy value
    Temporary(u32),
    /// Top-level name (callee, value-struct global)
    Global(String),
    /// Result of a call that never returns
    Unreachable,
    /// Result of an emitted operation
    Computed,
}

/// An IR value.
#[derive(Debug, Clone)]
pub struct Rvalue {
    /// Kind
    pub kind: ValueKind,
    /// Type; `None` only for untyped locals, tuples and global callee names
    pub ty: Option<TypeId>,
    /// Display tag (local name, temporary name)
    pub tag: Option<String>,
    handle: OnceCell<Handle>,
}

impl Rvalue {
    fn new(kind: ValueKind, ty: Option<TypeId>) -> Self {
        Self {
            kind,
            ty,
            tag: None,
            handle: OnceCell::new(),
        }
    }

    /// Literal value
    pub fn constant(constant: Constant, ty: Option<TypeId>) -> Self {
        Self::new(ValueKind::Constant(constant), ty)
    }

    /// Parameter slot, bound to its variable
    pub fn param(index: u16, ty: TypeId, name: impl Into<String>, var: Variable) -> Self {
        Self::new(ValueKind::Param(index), Some(ty))
            .with_tag(name)
            .with_handle(Handle::Var(var))
    }

    /// Untyped local slot
    pub fn local(index: u16, name: impl Into<String>) -> Self {
        Self::new(ValueKind::Local(index), None).with_tag(name)
    }

    /// Temporary bound to its variable
    pub fn temporary(index: u32, ty: TypeId, var: Variable) -> Self {
        Self::new(ValueKind::Temporary(index), Some(ty))
            .with_tag(format!("tmp{index}"))
            .with_handle(Handle::Var(var))
    }

    /// Top-level name
    pub fn global(name: impl Into<String>, ty: Option<TypeId>) -> Self {
        let name = name.into();
        Self::new(ValueKind::Global(name.clone()), ty).with_tag(name)
    }

    /// Marker for the result of `abort()`
    pub fn unreachable() -> Self {
        Self::new(ValueKind::Unreachable, None)
    }

    /// Result of an emitted operation
    pub fn computed(value: ir::Value, ty: TypeId) -> Self {
        Self::new(ValueKind::Computed, Some(ty)).with_handle(Handle::Value(value))
    }

    /// Address of a memory object
    pub fn address(value: ir::Value, ty: TypeId) -> Self {
        Self::new(ValueKind::Computed, Some(ty)).with_handle(Handle::Address(value))
    }

    /// Set the display tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    fn with_handle(self, handle: Handle) -> Self {
        // Fresh cell, cannot be set yet.
        let _ = self.handle.set(handle);
        self
    }

    /// Memoized backend handle
    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    /// Memoize the backend handle. Returns `false` if one was already set.
    pub fn set_handle(&self, handle: Handle) -> bool {
        self.handle.set(handle).is_ok()
    }

    /// Integer literal value
    pub fn int_literal(&self) -> Option<i128> {
        match &self.kind {
            ValueKind::Constant(c) => c.as_int(),
            _ => None,
        }
    }

    /// Name for diagnostics
    pub fn describe(&self) -> String {
        match (&self.kind, &self.tag) {
            (_, Some(tag)) => tag.clone(),
            (ValueKind::Constant(c), None) => c.to_string(),
            (ValueKind::Unreachable, None) => "<unreachable>".to_string(),
            _ => "<value>".to_string(),
        }
    }
}

/// Per-function storage of values.
#[derive(Debug, Default)]
pub struct ValueArena {
    values: Vec<Rvalue>,
}

impl ValueArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value
    pub fn alloc(&mut self, value: Rvalue) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(value);
        id
    }

    /// Borrow a value
    pub fn get(&self, id: ValueId) -> &Rvalue {
        &self.values[id.index()]
    }

    /// Mutably borrow a value
    pub fn get_mut(&mut self, id: ValueId) -> &mut Rvalue {
        &mut self.values[id.index()]
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
