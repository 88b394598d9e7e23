//! Raw pointers: opaque handles, C strings and untyped memory

use cranelift_codegen::ir::InstBuilder;
use cranelift_codegen::ir::condcodes::IntCC;
use xpy_bytecode::CompareOp;

use crate::error::{JitError, Result};
use crate::translator::FunctionTranslator;
use crate::types::TypeId;
use crate::value::ValueId;

/// What a pointer points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    /// Opaque handle (`None` is its null)
    Opaque,
    /// NUL-terminated string
    CStr,
    /// Untyped memory
    Memory,
}

impl PointerKind {
    /// Type name
    pub fn name(self) -> &'static str {
        match self {
            Self::Opaque => "opaque",
            Self::CStr => "cstr",
            Self::Memory => "memory",
        }
    }
}

/// Pointers only support identity comparison.
pub(crate) fn compare_addresses(
    cx: &mut FunctionTranslator<'_>,
    name: &str,
    op: CompareOp,
    lhs: ValueId,
    rhs: ValueId,
) -> Result<ValueId> {
    let cc = match op {
        CompareOp::Eq => IntCC::Equal,
        CompareOp::Ne => IntCC::NotEqual,
        _ => return Err(JitError::NoArithmetic(name.to_string())),
    };
    let a = cx.value(lhs)?;
    let b = cx.value(rhs)?;
    let flag = cx.ins().icmp(cc, a, b);
    Ok(cx.computed(flag, TypeId::BOOL))
}
