//! # xpy Bytecode
//!
//! Code units for the xpy ahead-of-time compiler.
//!
//! ## Design Principles
//!
//! - **Stack-based**: Instructions consume and produce values on an operand stack
//! - **Word-sized**: Every instruction occupies two bytes, so offsets are `index * 2`
//! - **Typed at the edges**: Signatures and struct fields carry type tags; bodies do not
//! - **Serializable**: Modules round-trip through JSON

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod asm;
pub mod code;
pub mod constant;
pub mod error;
pub mod instruction;
pub mod module;
pub mod operand;

pub use asm::assemble;
pub use code::{CodeUnit, CodeUnitBuilder};
pub use constant::Constant;
pub use error::BytecodeError;
pub use instruction::{CompareOp, Instruction, Opcode, Operand, OperandKind};
pub use module::{
    ConstantDef, FieldDef, FunctionBody, FunctionDef, GlobalDef, Module, StructDef, TypeTag,
};
pub use operand::LocalIndex;

/// Width of a single instruction in bytes.
pub const INSTRUCTION_SIZE: u32 = 2;
