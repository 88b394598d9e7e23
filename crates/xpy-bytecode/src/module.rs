//! Module format: the top-level namespace handed to the compiler
//!
//! A module is a JSON document listing struct definitions, value-struct
//! globals, named integer constants and functions with their signatures.
//! Function bodies are either assembly text or an explicit [`CodeUnit`].

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::asm::assemble;
use crate::code::CodeUnit;
use crate::error::{BytecodeError, Result};

/// Type tag used by signatures, struct fields, globals and constants
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeTag {
    /// No value
    Void,
    /// Default signed integer (`int` or `default`)
    Int,
    /// Unsigned 8-bit
    Byte,
    /// Unsigned 16-bit
    UShort,
    /// Unsigned 32-bit
    UInt,
    /// Unsigned 64-bit
    Unsigned,
    /// Pointer-width signed size
    SSize,
    /// Opaque pointer
    Opaque,
    /// Pointer to a NUL-terminated string
    CStr,
    /// Pointer to raw memory
    Memory,
    /// `{ int size; char *data; }` passed by pointer
    Buffer,
    /// Named struct accessed through a pointer
    Struct(String),
    /// Named struct accessed by address (`Name.value`)
    ValueStruct(String),
}

impl TypeTag {
    /// Struct name for struct tags
    pub fn struct_name(&self) -> Option<&str> {
        match self {
            Self::Struct(name) | Self::ValueStruct(name) => Some(name),
            _ => None,
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for TypeTag {
    type Err = BytecodeError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "void" => Self::Void,
            "int" | "default" => Self::Int,
            "byte" => Self::Byte,
            "ushort" => Self::UShort,
            "uint" => Self::UInt,
            "unsigned" => Self::Unsigned,
            "ssize" => Self::SSize,
            "opaque" => Self::Opaque,
            "cstr" => Self::CStr,
            "memory" => Self::Memory,
            "buffer" => Self::Buffer,
            other => match other.strip_suffix(".value") {
                Some(name) if is_identifier(name) => Self::ValueStruct(name.to_string()),
                None if is_identifier(other) => Self::Struct(other.to_string()),
                _ => return Err(BytecodeError::InvalidTypeTag(other.to_string())),
            },
        })
    }
}

impl TryFrom<String> for TypeTag {
    type Error = BytecodeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TypeTag> for String {
    fn from(tag: TypeTag) -> Self {
        tag.to_string()
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Int => f.write_str("int"),
            Self::Byte => f.write_str("byte"),
            Self::UShort => f.write_str("ushort"),
            Self::UInt => f.write_str("uint"),
            Self::Unsigned => f.write_str("unsigned"),
            Self::SSize => f.write_str("ssize"),
            Self::Opaque => f.write_str("opaque"),
            Self::CStr => f.write_str("cstr"),
            Self::Memory => f.write_str("memory"),
            Self::Buffer => f.write_str("buffer"),
            Self::Struct(name) => f.write_str(name),
            Self::ValueStruct(name) => write!(f, "{name}.value"),
        }
    }
}

/// A struct field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    #[serde(rename = "type")]
    pub ty: TypeTag,
}

/// A struct definition (ordered fields, C layout)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDef {
    /// Struct name
    pub name: String,
    /// Fields in declaration order
    pub fields: Vec<FieldDef>,
}

impl StructDef {
    /// Create a struct definition from `(name, type)` pairs
    pub fn new<N: Into<String>>(name: impl Into<String>, fields: impl IntoIterator<Item = (N, TypeTag)>) -> Self {
        Self {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(name, ty)| FieldDef {
                    name: name.into(),
                    ty,
                })
                .collect(),
        }
    }
}

/// A zero-initialized global of value-struct type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDef {
    /// Global name
    pub name: String,
    /// Global type
    #[serde(rename = "type")]
    pub ty: TypeTag,
}

/// A named integer constant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantDef {
    /// Constant name
    pub name: String,
    /// Constant type (integer tags only)
    #[serde(rename = "type", default = "default_int")]
    pub ty: TypeTag,
    /// Value
    pub value: i128,
}

fn default_int() -> TypeTag {
    TypeTag::Int
}

/// Function body: assembly text or a ready code unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunctionBody {
    /// Assembly text (see [`crate::asm`])
    Assembly(String),
    /// Explicit code unit
    Code(CodeUnit),
}

/// A function with its signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Function name
    pub name: String,
    /// Return type
    pub returns: TypeTag,
    /// Parameter types in order
    #[serde(default)]
    pub params: Vec<TypeTag>,
    /// Body
    pub code: FunctionBody,
}

impl FunctionDef {
    /// Create a function from a code unit
    pub fn new(name: impl Into<String>, returns: TypeTag, params: Vec<TypeTag>, code: CodeUnit) -> Self {
        Self {
            name: name.into(),
            returns,
            params,
            code: FunctionBody::Code(code),
        }
    }

    /// Create a function from assembly text
    pub fn asm(
        name: impl Into<String>,
        returns: TypeTag,
        params: Vec<TypeTag>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            returns,
            params,
            code: FunctionBody::Assembly(source.into()),
        }
    }

    /// Code unit of the body, assembling it if necessary
    pub fn code_unit(&self) -> Result<CodeUnit> {
        match &self.code {
            FunctionBody::Assembly(source) => assemble(&self.name, source),
            FunctionBody::Code(code) => Ok(code.clone()),
        }
    }
}

/// A module: everything one namespace defines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Struct definitions
    #[serde(default)]
    pub structs: Vec<StructDef>,
    /// Value-struct globals
    #[serde(default)]
    pub globals: Vec<GlobalDef>,
    /// Named integer constants
    #[serde(default)]
    pub constants: Vec<ConstantDef>,
    /// Functions
    #[serde(default)]
    pub functions: Vec<FunctionDef>,
}

impl Module {
    /// Create an empty module
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a module from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let module: Self = serde_json::from_str(json)?;
        module.validate()?;
        Ok(module)
    }

    /// Read a module from a JSON stream
    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        let module: Self = serde_json::from_reader(reader)?;
        module.validate()?;
        Ok(module)
    }

    /// Load a module file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::read_from(std::io::BufReader::new(file))
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check that every top-level name is defined once
    pub fn validate(&self) -> Result<()> {
        let mut seen = FxHashSet::default();
        let names = self
            .structs
            .iter()
            .map(|s| &s.name)
            .chain(self.globals.iter().map(|g| &g.name))
            .chain(self.constants.iter().map(|c| &c.name))
            .chain(self.functions.iter().map(|f| &f.name));
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(BytecodeError::DuplicateDefinition(name.clone()));
            }
        }
        Ok(())
    }

    /// Look up a function by name
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Add a function
    pub fn add_function(&mut self, function: FunctionDef) -> &mut Self {
        self.functions.push(function);
        self
    }

    /// Add a struct definition
    pub fn add_struct(&mut self, def: StructDef) -> &mut Self {
        self.structs.push(def);
        self
    }

    /// Add a value-struct global
    pub fn add_global(&mut self, name: impl Into<String>, ty: TypeTag) -> &mut Self {
        self.globals.push(GlobalDef {
            name: name.into(),
            ty,
        });
        self
    }

    /// Add a named integer constant
    pub fn add_constant(&mut self, name: impl Into<String>, ty: TypeTag, value: i128) -> &mut Self {
        self.constants.push(ConstantDef {
            name: name.into(),
            ty,
            value,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_parse() {
        assert_eq!("default".parse::<TypeTag>().unwrap(), TypeTag::Int);
        assert_eq!("ssize".parse::<TypeTag>().unwrap(), TypeTag::SSize);
        assert_eq!(
            "Point.value".parse::<TypeTag>().unwrap(),
            TypeTag::ValueStruct("Point".into())
        );
        assert_eq!(
            "Point".parse::<TypeTag>().unwrap(),
            TypeTag::Struct("Point".into())
        );
        assert!("not a type".parse::<TypeTag>().is_err());
        assert!(".value".parse::<TypeTag>().is_err());
    }

    #[test]
    fn test_type_tag_display_roundtrip() {
        for tag in ["void", "int", "byte", "buffer", "Point", "Point.value"] {
            assert_eq!(tag.parse::<TypeTag>().unwrap().to_string(), tag);
        }
    }

    #[test]
    fn test_module_from_json() {
        let json = r#"{
            "structs": [{"name": "Point", "fields": [{"name": "x", "type": "int"}, {"name": "y", "type": "int"}]}],
            "globals": [{"name": "origin", "type": "Point.value"}],
            "constants": [{"name": "LIMIT", "value": 10}],
            "functions": [{
                "name": "add",
                "returns": "int",
                "params": ["int", "int"],
                "code": ".args a b\nLOAD_FAST a\nLOAD_FAST b\nBINARY_ADD\nRETURN_VALUE\n"
            }]
        }"#;
        let module = Module::from_json(json).unwrap();
        assert_eq!(module.structs[0].fields.len(), 2);
        assert_eq!(module.constants[0].ty, TypeTag::Int);
        let add = module.function("add").unwrap();
        let code = add.code_unit().unwrap();
        assert_eq!(code.arg_count, 2);
        assert_eq!(code.instructions.len(), 4);
    }

    #[test]
    fn test_duplicate_definition() {
        let mut module = Module::new();
        module
            .add_constant("x", TypeTag::Int, 1)
            .add_global("x", TypeTag::ValueStruct("P".into()));
        assert!(matches!(
            module.validate(),
            Err(BytecodeError::DuplicateDefinition(name)) if name == "x"
        ));
    }

    #[test]
    fn test_bad_type_tag_in_json() {
        let json = r#"{"functions": [{"name": "f", "returns": "float", "code": "RETURN_VALUE"}]}"#;
        assert!(Module::from_json(json).is_err());
    }
}
