//! Compile errors

use cranelift_module::ModuleError;
use xpy_bytecode::{BytecodeError, Opcode};

/// Errors produced while compiling a namespace.
///
/// Every variant is fatal for the function being compiled.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// Cranelift module-level error.
    #[error("cranelift module error: {0}")]
    Module(Box<ModuleError>),

    /// Failed to create the JIT builder or target ISA.
    #[error("jit builder initialization failed: {0}")]
    Builder(String),

    /// Malformed bytecode input.
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),

    /// Opcode with no handler in the stack compiler.
    #[error("unsupported instruction at offset {offset}: {opcode}")]
    UnsupportedInstruction {
        /// Offset of the instruction
        offset: u32,
        /// The opcode
        opcode: Opcode,
    },

    /// Jump operand that does not land on an instruction.
    #[error("invalid jump target {target} from offset {offset} (code length {code_len})")]
    InvalidJumpTarget {
        /// Offset of the jumping instruction
        offset: u32,
        /// Requested target
        target: u32,
        /// Length of the code in bytes
        code_len: u32,
    },

    /// Instruction whose operand has the wrong shape.
    #[error("missing or malformed operand for {0}")]
    InvalidOperand(Opcode),

    /// Pop from an empty operand stack.
    #[error("operand stack underflow")]
    StackUnderflow,

    /// Values left on the operand stack when a block ends.
    #[error("operand stack not drained at block boundary ({depth} values left)")]
    StackNotDrained {
        /// Number of values left
        depth: usize,
    },

    /// Operand types disagree.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected type name
        expected: String,
        /// Actual type name
        found: String,
    },

    /// Integer literal outside the range of its type.
    #[error("constant {value} out of range for {ty}")]
    ConstantOutOfRange {
        /// The literal
        value: i128,
        /// Target type name
        ty: String,
    },

    /// Literal that has no value representation in this position.
    #[error("constant {0} cannot be used as a value here")]
    UnsupportedConstant(String),

    /// Call target that is neither a builtin, a namespace function nor a type method.
    #[error("unknown callee {name} with {argc} arguments")]
    UnknownCallee {
        /// Callee name
        name: String,
        /// Number of arguments
        argc: usize,
    },

    /// Global name not defined in the namespace.
    #[error("unknown name {0}")]
    UnknownName(String),

    /// Type tag naming no known type.
    #[error("unknown type {0}")]
    UnknownType(String),

    /// Attribute not present on a struct.
    #[error("type {ty} has no field {field}")]
    UnknownField {
        /// Struct type name
        ty: String,
        /// Requested field
        field: String,
    },

    /// Subscript on a type without element access.
    #[error("type {0} is not subscriptable")]
    NotSubscriptable(String),

    /// Arithmetic on a type without arithmetic.
    #[error("type {0} does not support arithmetic")]
    NoArithmetic(String),

    /// Attribute access on a type without fields.
    #[error("type {0} has no attributes")]
    NoAttributes(String),

    /// Local read before any store.
    #[error("local {0} used before assignment")]
    UnboundLocal(String),

    /// The last block of a function has no terminator.
    #[error("function {0} falls off the end of its last block")]
    FallsOffEnd(String),

    /// A block was requested after the last one was consumed.
    #[error("no block left for the instruction at offset {0}")]
    BlockCursorExhausted(u32),

    /// `BREAK_LOOP` or `POP_BLOCK` outside a loop.
    #[error("loop exit stack is empty")]
    LoopStackEmpty,

    /// Generated IR failed verification.
    #[error("IR verification failed:\n{0}")]
    Verifier(String),

    /// Call or invocation with the wrong number of arguments.
    #[error("{function} expects {expected} arguments, got {found}")]
    ArgumentCount {
        /// Function name
        function: String,
        /// Declared parameter count
        expected: usize,
        /// Supplied argument count
        found: usize,
    },

    /// Code unit with more locals than a local index can address.
    #[error("{function} has {count} locals, more than a local index can address")]
    TooManyLocals {
        /// Function name
        function: String,
        /// Number of locals
        count: usize,
    },

    /// Invocation of a function that was never compiled.
    #[error("unknown function {0}")]
    UnknownFunction(String),

    /// Name defined twice in one namespace.
    #[error("duplicate definition {0}")]
    DuplicateDefinition(String),

    /// Value struct that embeds itself.
    #[error("value struct {0} contains itself")]
    RecursiveValueStruct(String),

    /// Host buffer whose length does not fit the buffer size field.
    #[error("buffer of {0} bytes exceeds the size field")]
    BufferTooLarge(usize),

    /// Error raised while translating one instruction.
    #[error("{function}:{line}: {opcode} at offset {offset}: {source}")]
    Instruction {
        /// Function name
        function: String,
        /// Instruction offset
        offset: u32,
        /// Opcode
        opcode: Opcode,
        /// Source line
        line: u32,
        /// Underlying error
        source: Box<JitError>,
    },
}

impl JitError {
    /// Innermost error, skipping instruction context.
    pub fn root(&self) -> &JitError {
        match self {
            Self::Instruction { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

impl From<ModuleError> for JitError {
    fn from(value: ModuleError) -> Self {
        Self::Module(Box::new(value))
    }
}

/// Result type for compilation.
pub type Result<T> = std::result::Result<T, JitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_skips_context() {
        let err = JitError::Instruction {
            function: "f".into(),
            offset: 4,
            opcode: Opcode::BinaryAdd,
            line: 3,
            source: Box::new(JitError::StackUnderflow),
        };
        assert!(matches!(err.root(), JitError::StackUnderflow));
        assert_eq!(
            err.to_string(),
            "f:3: BINARY_ADD at offset 4: operand stack underflow"
        );
    }
}
