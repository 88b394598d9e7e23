//! Fixed-width integers

use std::cmp::Ordering;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, InstBuilder};
use cranelift_frontend::FunctionBuilder;
use xpy_bytecode::{CompareOp, Opcode};

use crate::error::{JitError, Result};
use crate::helpers::GeneratedHelper;
use crate::translator::FunctionTranslator;
use crate::types::{ArithmeticType, TypeId};
use crate::value::ValueId;

/// Binary arithmetic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `//`
    FloorDiv,
}

impl ArithOp {
    /// Operation performed by a binary or in-place opcode
    pub fn from_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::BinaryAdd | Opcode::InplaceAdd => Some(Self::Add),
            Opcode::BinarySubtract | Opcode::InplaceSubtract => Some(Self::Sub),
            Opcode::BinaryMultiply | Opcode::InplaceMultiply => Some(Self::Mul),
            Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => Some(Self::FloorDiv),
            _ => None,
        }
    }

    /// Short name used in helper symbols
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::FloorDiv => "floordiv",
        }
    }
}

/// A fixed-width integer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntType {
    /// Type name
    pub name: &'static str,
    /// Backend representation
    pub ir: ir::Type,
    /// Signedness
    pub signed: bool,
}

impl IntType {
    /// Create an integer type
    pub const fn new(name: &'static str, ir: ir::Type, signed: bool) -> Self {
        Self { name, ir, signed }
    }

    /// Width in bits
    pub fn bits(&self) -> u32 {
        self.ir.bits()
    }

    /// Smallest representable value
    pub fn min(&self) -> i128 {
        if self.signed {
            -(1i128 << (self.bits() - 1))
        } else {
            0
        }
    }

    /// Largest representable value
    pub fn max(&self) -> i128 {
        if self.signed {
            (1i128 << (self.bits() - 1)) - 1
        } else {
            (1i128 << self.bits()) - 1
        }
    }

    /// Whether `value` is representable
    pub fn fits(&self, value: i128) -> bool {
        (self.min()..=self.max()).contains(&value)
    }

    /// `iconst` immediate for `value`, range checked and masked to the type width
    pub fn immediate(&self, value: i128) -> Result<i64> {
        if !self.fits(value) {
            return Err(JitError::ConstantOutOfRange {
                value,
                ty: self.name.to_string(),
            });
        }
        let raw = value as i64;
        Ok(if self.bits() < 64 {
            (raw as u64 & ((1u64 << self.bits()) - 1)) as i64
        } else {
            raw
        })
    }

    /// Condition code for a comparison
    pub fn condition(&self, op: CompareOp) -> IntCC {
        match (op, self.signed) {
            (CompareOp::Eq, _) => IntCC::Equal,
            (CompareOp::Ne, _) => IntCC::NotEqual,
            (CompareOp::Lt, true) => IntCC::SignedLessThan,
            (CompareOp::Le, true) => IntCC::SignedLessThanOrEqual,
            (CompareOp::Gt, true) => IntCC::SignedGreaterThan,
            (CompareOp::Ge, true) => IntCC::SignedGreaterThanOrEqual,
            (CompareOp::Lt, false) => IntCC::UnsignedLessThan,
            (CompareOp::Le, false) => IntCC::UnsignedLessThanOrEqual,
            (CompareOp::Gt, false) => IntCC::UnsignedGreaterThan,
            (CompareOp::Ge, false) => IntCC::UnsignedGreaterThanOrEqual,
        }
    }

    /// Widen or narrow `value` of this type to `to`
    pub fn convert(&self, builder: &mut FunctionBuilder<'_>, value: ir::Value, to: &IntType) -> ir::Value {
        match self.bits().cmp(&to.bits()) {
            Ordering::Equal => value,
            Ordering::Greater => builder.ins().ireduce(to.ir, value),
            Ordering::Less if self.signed => builder.ins().sextend(to.ir, value),
            Ordering::Less => builder.ins().uextend(to.ir, value),
        }
    }
}

impl ArithmeticType for IntType {
    fn binary_op(
        &self,
        cx: &mut FunctionTranslator<'_>,
        op: ArithOp,
        ty: TypeId,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<ValueId> {
        let a = cx.value(lhs)?;
        let b = cx.value(rhs)?;
        let result = cx
            .call_generated(GeneratedHelper::Arith { op, int: *self }, &[a, b])?
            .ok_or_else(|| JitError::mismatch(self.name, "void"))?;
        Ok(cx.computed(result, ty))
    }

    fn compare(
        &self,
        cx: &mut FunctionTranslator<'_>,
        op: CompareOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<ValueId> {
        let a = cx.value(lhs)?;
        let b = cx.value(rhs)?;
        let flag = cx.ins().icmp(self.condition(op), a, b);
        Ok(cx.computed(flag, TypeId::BOOL))
    }
}
