//! Top-level names of one compiled module
//!
//! A [`Namespace`] maps names to functions (declared before any body is
//! translated, so functions may call each other in any order), value-struct
//! globals backed by zero-initialized data objects, and named integer
//! constants. String literals are interned as anonymous data objects.

use cranelift_codegen::ir::{AbiParam, Signature};
use cranelift_jit::JITModule;
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use tracing::debug;
use xpy_bytecode::{ConstantDef, FunctionDef, GlobalDef};

use crate::error::{JitError, Result};
use crate::types::{Type, TypeId, TypeRegistry};

/// Names the compiler provides without a definition.
pub const BUILTINS: [&str; 9] = [
    "abort", "print", "default", "len", "byte", "ushort", "uint", "unsigned", "ssize",
];

/// A declared function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionEntry {
    /// Source name
    pub name: String,
    /// Module function id
    pub id: FuncId,
    /// Parameter types
    pub params: Vec<TypeId>,
    /// Return type
    pub returns: TypeId,
}

/// A global value struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalEntry {
    /// Backing data object
    pub data: DataId,
    /// Value-struct type
    pub ty: TypeId,
}

/// A named integer constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedConstant {
    /// Integer type
    pub ty: TypeId,
    /// Value, range checked against `ty`
    pub value: i128,
}

/// Top-level names.
#[derive(Debug, Default)]
pub struct Namespace {
    functions: IndexMap<String, FunctionEntry>,
    globals: IndexMap<String, GlobalEntry>,
    constants: IndexMap<String, NamedConstant>,
    strings: FxHashMap<String, DataId>,
}

impl Namespace {
    /// Empty namespace
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is bound to a function, global or constant
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
            || self.globals.contains_key(name)
            || self.constants.contains_key(name)
    }

    fn claim(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            return Err(JitError::DuplicateDefinition(name.to_string()));
        }
        Ok(())
    }

    /// Native signature of a function with the given types
    pub fn signature(
        module: &JITModule,
        types: &TypeRegistry,
        params: &[TypeId],
        returns: TypeId,
    ) -> Signature {
        let pointer = types.pointer_type();
        let mut sig = module.make_signature();
        sig.params.extend(
            params
                .iter()
                .filter_map(|ty| types.get(*ty).ir_type(pointer))
                .map(AbiParam::new),
        );
        if let Some(ir) = types.get(returns).ir_type(pointer) {
            sig.returns.push(AbiParam::new(ir));
        }
        sig
    }

    /// Declare a function so calls to it can be emitted before its body
    pub fn declare_function(
        &mut self,
        module: &mut JITModule,
        types: &mut TypeRegistry,
        def: &FunctionDef,
    ) -> Result<FunctionEntry> {
        self.claim(&def.name)?;

        let mut params = Vec::with_capacity(def.params.len());
        for tag in &def.params {
            let ty = types.resolve(tag)?;
            if ty == TypeId::VOID {
                return Err(JitError::mismatch("parameter type", "void"));
            }
            params.push(ty);
        }
        let returns = types.resolve(&def.returns)?;

        let sig = Self::signature(module, types, &params, returns);
        let id = module.declare_function(&format!("xpy_fn_{}", def.name), Linkage::Local, &sig)?;
        let entry = FunctionEntry {
            name: def.name.clone(),
            id,
            params,
            returns,
        };
        debug!(function = %def.name, params = entry.params.len(), "declared function");
        self.functions.insert(def.name.clone(), entry.clone());
        Ok(entry)
    }

    /// Look up a function
    pub fn function(&self, name: &str) -> Option<&FunctionEntry> {
        self.functions.get(name)
    }

    /// Declared functions in declaration order
    pub fn functions(&self) -> impl Iterator<Item = &FunctionEntry> {
        self.functions.values()
    }

    /// Allocate a zero-initialized global value struct
    pub fn declare_global(
        &mut self,
        module: &mut JITModule,
        types: &mut TypeRegistry,
        def: &GlobalDef,
    ) -> Result<GlobalEntry> {
        self.claim(&def.name)?;

        let ty = types.resolve(&def.ty)?;
        let Type::ValueStruct(layout) = types.get(ty) else {
            return Err(JitError::mismatch("value struct", types.name(ty)));
        };

        let data = module.declare_data(&format!("xpy_global_{}", def.name), Linkage::Local, true, false)?;
        let mut description = DataDescription::new();
        description.define_zeroinit(layout.size.max(1) as usize);
        description.set_align(u64::from(layout.align));
        module.define_data(data, &description)?;

        debug!(global = %def.name, size = layout.size, "allocated global");
        let entry = GlobalEntry { data, ty };
        self.globals.insert(def.name.clone(), entry);
        Ok(entry)
    }

    /// Look up a global
    pub fn global(&self, name: &str) -> Option<&GlobalEntry> {
        self.globals.get(name)
    }

    /// Bind a named integer constant
    pub fn declare_constant(&mut self, types: &mut TypeRegistry, def: &ConstantDef) -> Result<NamedConstant> {
        self.claim(&def.name)?;

        let ty = types.resolve(&def.ty)?;
        let int = types
            .int(ty)
            .ok_or_else(|| JitError::mismatch("integer type", types.name(ty)))?;
        int.immediate(def.value)?;

        let constant = NamedConstant { ty, value: def.value };
        self.constants.insert(def.name.clone(), constant);
        Ok(constant)
    }

    /// Look up a named constant
    pub fn constant(&self, name: &str) -> Option<&NamedConstant> {
        self.constants.get(name)
    }

    /// Data object holding `text` followed by a NUL, created once per string
    pub fn string_data(&mut self, module: &mut JITModule, text: &str) -> Result<DataId> {
        if let Some(&data) = self.strings.get(text) {
            return Ok(data);
        }
        let data = module.declare_anonymous_data(false, false)?;
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        let mut description = DataDescription::new();
        description.define(bytes.into_boxed_slice());
        module.define_data(data, &description)?;
        self.strings.insert(text.to_string(), data);
        Ok(data)
    }

    /// Whether `name` resolves to something callable or loadable
    pub fn resolves(&self, name: &str) -> bool {
        self.contains(name) || BUILTINS.contains(&name)
    }
}
