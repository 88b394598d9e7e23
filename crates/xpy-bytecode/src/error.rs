//! Bytecode errors

use thiserror::Error;

/// Errors that can occur while building, assembling or loading bytecode
#[derive(Debug, Error)]
pub enum BytecodeError {
    /// Opcode name not part of the instruction set
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(String),

    /// Operand does not fit the opcode's operand kind
    #[error("Invalid operand for {opcode} on line {line}: {message}")]
    InvalidOperand {
        /// Opcode name
        opcode: String,
        /// Assembly line (1-indexed)
        line: usize,
        /// Description of the problem
        message: String,
    },

    /// Label referenced but never defined
    #[error("Undefined label: {0}")]
    UndefinedLabel(String),

    /// Label defined twice
    #[error("Duplicate label: {0}")]
    DuplicateLabel(String),

    /// Relative jump pointing backwards
    #[error("Relative jump at offset {offset} cannot reach {target}")]
    BackwardDelta {
        /// Offset of the jumping instruction
        offset: u32,
        /// Requested target
        target: u32,
    },

    /// Unknown type tag
    #[error("Invalid type tag: {0:?}")]
    InvalidTypeTag(String),

    /// Unknown comparison operator
    #[error("Invalid comparison operator: {0:?}")]
    InvalidCompareOp(String),

    /// A definition name was used twice in one module
    #[error("Duplicate definition: {0}")]
    DuplicateDefinition(String),

    /// JSON error while loading or saving a module
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error while loading or saving a module
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
