//! Bytecode instructions (opcodes and operands)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constant::Constant;
use crate::error::BytecodeError;
use crate::operand::LocalIndex;

/// Bytecode opcodes
///
/// Stack-based instruction set. Names follow the interpreter convention
/// (`LOAD_FAST`, `BINARY_ADD`, ...) and are used verbatim in listings,
/// assembly text and JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // ==================== Stack ====================
    /// Do nothing
    Nop,
    /// Discard TOS
    PopTop,
    /// Swap TOS and TOS1
    RotTwo,
    /// Lift TOS1 and TOS2 one position up, move TOS down to position three
    RotThree,
    /// Duplicate TOS
    DupTop,

    // ==================== Constants and variables ====================
    /// Push `constants[arg]`
    LoadConst,
    /// Push local variable
    LoadFast,
    /// Pop into local variable
    StoreFast,
    /// Push global name
    LoadGlobal,
    /// Unpack a tuple into `arg` values
    UnpackSequence,
    /// Build a tuple from `arg` values
    BuildTuple,

    // ==================== Arithmetic ====================
    /// TOS = TOS1 + TOS
    BinaryAdd,
    /// TOS = TOS1 - TOS
    BinarySubtract,
    /// TOS = TOS1 * TOS
    BinaryMultiply,
    /// TOS = TOS1 // TOS
    BinaryFloorDivide,
    /// TOS = TOS1 / TOS
    BinaryTrueDivide,
    /// TOS = TOS1 % TOS
    BinaryModulo,
    /// In-place `+=`
    InplaceAdd,
    /// In-place `-=`
    InplaceSubtract,
    /// In-place `*=`
    InplaceMultiply,
    /// In-place `//=`
    InplaceFloorDivide,
    /// TOS = -TOS
    UnaryNegative,
    /// TOS = TOS1 <op> TOS
    CompareOp,

    // ==================== Subscript and attributes ====================
    /// TOS = TOS1\[TOS\]
    BinarySubscr,
    /// TOS1\[TOS\] = TOS2
    StoreSubscr,
    /// TOS = TOS.name
    LoadAttr,
    /// TOS.name = TOS1
    StoreAttr,

    // ==================== Calls ====================
    /// Call with `arg` positional arguments
    CallFunction,
    /// Return TOS
    ReturnValue,

    // ==================== Control flow ====================
    /// Jump to absolute offset
    JumpAbsolute,
    /// Jump forward by a delta relative to this instruction
    JumpForward,
    /// Pop TOS, jump to absolute offset if false
    PopJumpIfFalse,
    /// Pop TOS, jump to absolute offset if true
    PopJumpIfTrue,
    /// Enter a loop whose exit lies at this offset plus the delta
    SetupLoop,
    /// Leave the innermost loop
    BreakLoop,
    /// Leave the innermost loop scope at its natural end
    PopBlock,
    /// Push an iterator for TOS
    GetIter,
    /// Advance the iterator at TOS, jump forward by the delta when exhausted
    ForIter,
}

/// Shape of the operand an opcode expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand
    None,
    /// Literal constant
    Const,
    /// Local variable index
    Local,
    /// Global or attribute name
    Name,
    /// Argument or item count
    Count,
    /// Absolute jump target
    Absolute,
    /// Jump delta relative to the instruction's own offset
    Relative,
    /// Comparison operator
    Compare,
}

impl Opcode {
    /// Every opcode, in declaration order
    pub const ALL: &'static [Opcode] = &[
        Self::Nop,
        Self::PopTop,
        Self::RotTwo,
        Self::RotThree,
        Self::DupTop,
        Self::LoadConst,
        Self::LoadFast,
        Self::StoreFast,
        Self::LoadGlobal,
        Self::UnpackSequence,
        Self::BuildTuple,
        Self::BinaryAdd,
        Self::BinarySubtract,
        Self::BinaryMultiply,
        Self::BinaryFloorDivide,
        Self::BinaryTrueDivide,
        Self::BinaryModulo,
        Self::InplaceAdd,
        Self::InplaceSubtract,
        Self::InplaceMultiply,
        Self::InplaceFloorDivide,
        Self::UnaryNegative,
        Self::CompareOp,
        Self::BinarySubscr,
        Self::StoreSubscr,
        Self::LoadAttr,
        Self::StoreAttr,
        Self::CallFunction,
        Self::ReturnValue,
        Self::JumpAbsolute,
        Self::JumpForward,
        Self::PopJumpIfFalse,
        Self::PopJumpIfTrue,
        Self::SetupLoop,
        Self::BreakLoop,
        Self::PopBlock,
        Self::GetIter,
        Self::ForIter,
    ];

    /// Get the name of this opcode
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::PopTop => "POP_TOP",
            Self::RotTwo => "ROT_TWO",
            Self::RotThree => "ROT_THREE",
            Self::DupTop => "DUP_TOP",
            Self::LoadConst => "LOAD_CONST",
            Self::LoadFast => "LOAD_FAST",
            Self::StoreFast => "STORE_FAST",
            Self::LoadGlobal => "LOAD_GLOBAL",
            Self::UnpackSequence => "UNPACK_SEQUENCE",
            Self::BuildTuple => "BUILD_TUPLE",
            Self::BinaryAdd => "BINARY_ADD",
            Self::BinarySubtract => "BINARY_SUBTRACT",
            Self::BinaryMultiply => "BINARY_MULTIPLY",
            Self::BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
            Self::BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
            Self::BinaryModulo => "BINARY_MODULO",
            Self::InplaceAdd => "INPLACE_ADD",
            Self::InplaceSubtract => "INPLACE_SUBTRACT",
            Self::InplaceMultiply => "INPLACE_MULTIPLY",
            Self::InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE",
            Self::UnaryNegative => "UNARY_NEGATIVE",
            Self::CompareOp => "COMPARE_OP",
            Self::BinarySubscr => "BINARY_SUBSCR",
            Self::StoreSubscr => "STORE_SUBSCR",
            Self::LoadAttr => "LOAD_ATTR",
            Self::StoreAttr => "STORE_ATTR",
            Self::CallFunction => "CALL_FUNCTION",
            Self::ReturnValue => "RETURN_VALUE",
            Self::JumpAbsolute => "JUMP_ABSOLUTE",
            Self::JumpForward => "JUMP_FORWARD",
            Self::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Self::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Self::SetupLoop => "SETUP_LOOP",
            Self::BreakLoop => "BREAK_LOOP",
            Self::PopBlock => "POP_BLOCK",
            Self::GetIter => "GET_ITER",
            Self::ForIter => "FOR_ITER",
        }
    }

    /// Look up an opcode by its name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Operand shape expected by this opcode
    pub const fn operand_kind(self) -> OperandKind {
        match self {
            Self::LoadConst => OperandKind::Const,
            Self::LoadFast | Self::StoreFast => OperandKind::Local,
            Self::LoadGlobal | Self::LoadAttr | Self::StoreAttr => OperandKind::Name,
            Self::UnpackSequence | Self::BuildTuple | Self::CallFunction => OperandKind::Count,
            Self::JumpAbsolute | Self::PopJumpIfFalse | Self::PopJumpIfTrue => {
                OperandKind::Absolute
            }
            Self::JumpForward | Self::SetupLoop | Self::ForIter => OperandKind::Relative,
            Self::CompareOp => OperandKind::Compare,
            _ => OperandKind::None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Opcode {
    type Err = BytecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| BytecodeError::UnknownOpcode(s.to_string()))
    }
}

/// Comparison operator of `COMPARE_OP`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    /// `<`
    #[serde(rename = "<")]
    Lt,
    /// `<=`
    #[serde(rename = "<=")]
    Le,
    /// `==`
    #[serde(rename = "==")]
    Eq,
    /// `!=`
    #[serde(rename = "!=")]
    Ne,
    /// `>`
    #[serde(rename = ">")]
    Gt,
    /// `>=`
    #[serde(rename = ">=")]
    Ge,
}

impl CompareOp {
    /// Source symbol of the operator
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

impl FromStr for CompareOp {
    type Err = BytecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "<" => Self::Lt,
            "<=" => Self::Le,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            other => return Err(BytecodeError::InvalidCompareOp(other.to_string())),
        })
    }
}

/// Instruction operand
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// No operand
    #[default]
    None,
    /// Literal constant
    Const(Constant),
    /// Local variable index
    Local(LocalIndex),
    /// Global or attribute name
    Name(String),
    /// Argument or item count
    Count(u32),
    /// Absolute jump target offset
    Target(u32),
    /// Jump delta relative to the instruction's own offset
    Delta(u32),
    /// Comparison operator
    Compare(CompareOp),
}

impl Operand {
    /// Operand shape
    pub fn kind(&self) -> OperandKind {
        match self {
            Self::None => OperandKind::None,
            Self::Const(_) => OperandKind::Const,
            Self::Local(_) => OperandKind::Local,
            Self::Name(_) => OperandKind::Name,
            Self::Count(_) => OperandKind::Count,
            Self::Target(_) => OperandKind::Absolute,
            Self::Delta(_) => OperandKind::Relative,
            Self::Compare(_) => OperandKind::Compare,
        }
    }
}

/// A single decoded instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Byte offset within the code unit
    pub offset: u32,
    /// Opcode
    pub opcode: Opcode,
    /// Operand (shape given by [`Opcode::operand_kind`])
    #[serde(default)]
    pub operand: Operand,
    /// Source line this instruction starts, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Instruction {
    /// Create an instruction
    pub fn new(offset: u32, opcode: Opcode, operand: Operand) -> Self {
        Self {
            offset,
            opcode,
            operand,
            line: None,
        }
    }

    /// Resolved jump target for absolute and relative jumps.
    ///
    /// `None` for a relative jump whose target overflows the offset range.
    pub fn jump_target(&self) -> Option<u32> {
        match self.operand {
            Operand::Target(target) => Some(target),
            Operand::Delta(delta) => self.offset.checked_add(delta),
            _ => None,
        }
    }

    /// Local index operand
    pub fn local(&self) -> Option<LocalIndex> {
        match self.operand {
            Operand::Local(idx) => Some(idx),
            _ => None,
        }
    }

    /// Name operand
    pub fn name(&self) -> Option<&str> {
        match &self.operand {
            Operand::Name(name) => Some(name),
            _ => None,
        }
    }

    /// Count operand
    pub fn count(&self) -> Option<u32> {
        match self.operand {
            Operand::Count(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>6} {:<20}", self.offset, self.opcode.name())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Const(c) => write!(f, " {c}"),
            Operand::Local(idx) => write!(f, " {}", idx.index()),
            Operand::Name(name) => write!(f, " {name}"),
            Operand::Count(n) => write!(f, " {n}"),
            Operand::Target(target) => write!(f, " {target}"),
            Operand::Delta(delta) => match self.offset.checked_add(*delta) {
                Some(target) => write!(f, " {delta} (to {target})"),
                None => write!(f, " {delta} (out of range)"),
            },
            Operand::Compare(op) => write!(f, " {}", op.symbol()),
        }
    }
}
