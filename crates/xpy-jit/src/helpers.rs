//! Runtime helpers
//!
//! Two kinds of helper are called from compiled code:
//!
//! - **Imports**: host functions (`abort`, the `print` family) registered as
//!   JIT symbols and declared with `Linkage::Import`.
//! - **Generated helpers**: small IR functions built on first use, one per
//!   integer type and operation (overflow-checked arithmetic) plus the
//!   buffer bound check. Each one calls the abort import when its check
//!   fails.

use std::ffi::{CStr, c_char};
use std::io::Write;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::instructions::BlockArg;
use cranelift_codegen::ir::{self, AbiParam, InstBuilder, MemFlags, UserFuncName, types};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::Result;
use crate::types::{ArithOp, IntType};

// ---------------------------------------------------------------------------
// Host functions
// ---------------------------------------------------------------------------

extern "C" fn xpy_abort() {
    let _ = std::io::stdout().flush();
    std::process::abort();
}

extern "C" fn xpy_print_int(value: i64) {
    print!("{value}");
}

extern "C" fn xpy_print_unsigned(value: u64) {
    print!("{value}");
}

extern "C" fn xpy_print_cstr(value: *const c_char) {
    if value.is_null() {
        print!("None");
        return;
    }
    // SAFETY: non-null `cstr` values are string literals emitted as
    // NUL-terminated data objects, or host strings with the same contract.
    let text = unsafe { CStr::from_ptr(value) };
    print!("{}", text.to_string_lossy());
}

extern "C" fn xpy_print_separator() {
    print!(" ");
}

extern "C" fn xpy_print_newline() {
    println!();
}

/// A host function callable from compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Import {
    /// `() -> !`, process abort
    Abort,
    /// `(i64)`, print a signed integer
    PrintInt,
    /// `(u64)`, print an unsigned integer
    PrintUnsigned,
    /// `(ptr)`, print a C string
    PrintCStr,
    /// `()`, print the argument separator
    PrintSeparator,
    /// `()`, end the line
    PrintNewline,
}

impl Import {
    /// Every import
    pub const ALL: [Import; 6] = [
        Self::Abort,
        Self::PrintInt,
        Self::PrintUnsigned,
        Self::PrintCStr,
        Self::PrintSeparator,
        Self::PrintNewline,
    ];

    /// Symbol name
    pub fn symbol_name(self) -> &'static str {
        match self {
            Self::Abort => "xpy_abort",
            Self::PrintInt => "xpy_print_int",
            Self::PrintUnsigned => "xpy_print_unsigned",
            Self::PrintCStr => "xpy_print_cstr",
            Self::PrintSeparator => "xpy_print_separator",
            Self::PrintNewline => "xpy_print_newline",
        }
    }

    fn address(self) -> *const u8 {
        match self {
            Self::Abort => xpy_abort as *const u8,
            Self::PrintInt => xpy_print_int as *const u8,
            Self::PrintUnsigned => xpy_print_unsigned as *const u8,
            Self::PrintCStr => xpy_print_cstr as *const u8,
            Self::PrintSeparator => xpy_print_separator as *const u8,
            Self::PrintNewline => xpy_print_newline as *const u8,
        }
    }

    fn signature(self, module: &JITModule, pointer: ir::Type) -> ir::Signature {
        let mut sig = module.make_signature();
        match self {
            Self::PrintInt | Self::PrintUnsigned => sig.params.push(AbiParam::new(types::I64)),
            Self::PrintCStr => sig.params.push(AbiParam::new(pointer)),
            Self::Abort | Self::PrintSeparator | Self::PrintNewline => {}
        }
        sig
    }
}

/// Register every import as a JIT symbol.
pub fn register_symbols(builder: &mut JITBuilder) {
    for import in Import::ALL {
        builder.symbol(import.symbol_name(), import.address());
    }
}

// ---------------------------------------------------------------------------
// Generated helpers
// ---------------------------------------------------------------------------

/// A helper routine emitted as IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneratedHelper {
    /// `(a, b) -> a <op> b`, aborting on overflow or a bad divisor
    Arith {
        /// Operation
        op: ArithOp,
        /// Operand type
        int: IntType,
    },
    /// `(buffer, index: i64)`, aborting when `index >= buffer.size`.
    /// The index is compared in 64 bits with its own signedness.
    BoundCheck {
        /// Compare as signed
        signed: bool,
    },
}

impl GeneratedHelper {
    /// Symbol name
    pub fn symbol_name(&self) -> String {
        match self {
            Self::Arith { op, int } => format!("xpy_{}_{}", op.name(), int.name),
            Self::BoundCheck { signed: true } => "xpy_bound_check_buffer".to_string(),
            Self::BoundCheck { signed: false } => "xpy_bound_check_buffer_unsigned".to_string(),
        }
    }

    fn signature(&self, module: &JITModule, pointer: ir::Type) -> ir::Signature {
        let mut sig = module.make_signature();
        match self {
            Self::Arith { int, .. } => {
                sig.params.push(AbiParam::new(int.ir));
                sig.params.push(AbiParam::new(int.ir));
                sig.returns.push(AbiParam::new(int.ir));
            }
            Self::BoundCheck { .. } => {
                sig.params.push(AbiParam::new(pointer));
                sig.params.push(AbiParam::new(types::I64));
            }
        }
        sig
    }
}

/// Declared imports and the cache of generated helpers.
pub struct Helpers {
    imports: FxHashMap<Import, FuncId>,
    generated: FxHashMap<GeneratedHelper, FuncId>,
    context: cranelift_codegen::Context,
    builder_ctx: FunctionBuilderContext,
    pointer: ir::Type,
}

impl Helpers {
    /// Declare every import on `module`.
    pub fn declare(module: &mut JITModule, pointer: ir::Type) -> Result<Self> {
        let mut imports = FxHashMap::default();
        for import in Import::ALL {
            let sig = import.signature(module, pointer);
            let id = module.declare_function(import.symbol_name(), Linkage::Import, &sig)?;
            imports.insert(import, id);
        }
        Ok(Self {
            imports,
            generated: FxHashMap::default(),
            context: cranelift_codegen::Context::new(),
            builder_ctx: FunctionBuilderContext::new(),
            pointer,
        })
    }

    /// Function id of an import
    pub fn import(&self, import: Import) -> FuncId {
        self.imports[&import]
    }

    /// Number of helpers generated so far
    pub fn generated_count(&self) -> usize {
        self.generated.len()
    }

    /// Function id of a generated helper, defining it on first use
    pub fn generated(&mut self, module: &mut JITModule, helper: GeneratedHelper) -> Result<FuncId> {
        if let Some(&id) = self.generated.get(&helper) {
            return Ok(id);
        }

        let name = helper.symbol_name();
        let sig = helper.signature(module, self.pointer);
        let id = module.declare_function(&name, Linkage::Local, &sig)?;
        self.context.func =
            ir::Function::with_name_signature(UserFuncName::user(1, id.as_u32()), sig);

        let abort_id = self.import(Import::Abort);
        {
            let mut builder = FunctionBuilder::new(&mut self.context.func, &mut self.builder_ctx);
            let abort = module.declare_func_in_func(abort_id, builder.func);
            match helper {
                GeneratedHelper::Arith { op, int } => emit_checked_arith(&mut builder, abort, op, int)?,
                GeneratedHelper::BoundCheck { signed } => emit_bound_check(&mut builder, abort, signed),
            }
            builder.seal_all_blocks();
            builder.finalize();
        }

        module.define_function(id, &mut self.context)?;
        module.clear_context(&mut self.context);
        debug!(helper = %name, "generated runtime helper");

        self.generated.insert(helper, id);
        Ok(id)
    }
}

/// `done(result)` returns; `trap` calls abort.
fn emit_checked_arith(
    builder: &mut FunctionBuilder<'_>,
    abort: ir::FuncRef,
    op: ArithOp,
    int: IntType,
) -> Result<()> {
    let entry = builder.create_block();
    let trap = builder.create_block();
    let done = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.append_block_param(done, int.ir);

    builder.switch_to_block(entry);
    let params = builder.block_params(entry);
    let (x, y) = (params[0], params[1]);

    match op {
        ArithOp::FloorDiv => {
            // Truncating division; zero and MIN / -1 abort.
            let mut bad = builder.ins().icmp_imm(IntCC::Equal, y, 0);
            if int.signed {
                let min = builder.ins().iconst(int.ir, int.immediate(int.min())?);
                let minus_one = builder.ins().iconst(int.ir, int.immediate(-1)?);
                let is_min = builder.ins().icmp(IntCC::Equal, x, min);
                let is_minus_one = builder.ins().icmp(IntCC::Equal, y, minus_one);
                let overflow = builder.ins().band(is_min, is_minus_one);
                bad = builder.ins().bor(bad, overflow);
            }
            let divide = builder.create_block();
            builder.ins().brif(bad, trap, &[], divide, &[]);

            builder.switch_to_block(divide);
            let quotient = if int.signed {
                builder.ins().sdiv(x, y)
            } else {
                builder.ins().udiv(x, y)
            };
            builder.ins().jump(done, &[BlockArg::Value(quotient)]);
        }
        _ if int.bits() >= 32 => {
            let (result, overflow) = match (op, int.signed) {
                (ArithOp::Add, true) => builder.ins().sadd_overflow(x, y),
                (ArithOp::Add, false) => builder.ins().uadd_overflow(x, y),
                (ArithOp::Sub, true) => builder.ins().ssub_overflow(x, y),
                (ArithOp::Sub, false) => builder.ins().usub_overflow(x, y),
                (ArithOp::Mul, true) => builder.ins().smul_overflow(x, y),
                (ArithOp::Mul, false) => builder.ins().umul_overflow(x, y),
                (ArithOp::FloorDiv, _) => unreachable!("handled above"),
            };
            builder
                .ins()
                .brif(overflow, trap, &[], done, &[BlockArg::Value(result)]);
        }
        _ => {
            // Narrow integers: compute in 64 bits and check that the
            // truncated result extends back to the same value.
            let extend = |builder: &mut FunctionBuilder<'_>, v| {
                if int.signed {
                    builder.ins().sextend(types::I64, v)
                } else {
                    builder.ins().uextend(types::I64, v)
                }
            };
            let wide_x = extend(builder, x);
            let wide_y = extend(builder, y);
            let wide = match op {
                ArithOp::Add => builder.ins().iadd(wide_x, wide_y),
                ArithOp::Sub => builder.ins().isub(wide_x, wide_y),
                _ => builder.ins().imul(wide_x, wide_y),
            };
            let result = builder.ins().ireduce(int.ir, wide);
            let round_trip = extend(builder, result);
            let fits = builder.ins().icmp(IntCC::Equal, round_trip, wide);
            builder
                .ins()
                .brif(fits, done, &[BlockArg::Value(result)], trap, &[]);
        }
    }

    builder.switch_to_block(trap);
    builder.ins().call(abort, &[]);
    let zero = builder.ins().iconst(int.ir, 0);
    builder.ins().return_(&[zero]);

    builder.switch_to_block(done);
    let result = builder.block_params(done)[0];
    builder.ins().return_(&[result]);
    Ok(())
}

fn emit_bound_check(builder: &mut FunctionBuilder<'_>, abort: ir::FuncRef, signed: bool) {
    let entry = builder.create_block();
    let trap = builder.create_block();
    let ok = builder.create_block();
    builder.append_block_params_for_function_params(entry);

    builder.switch_to_block(entry);
    let params = builder.block_params(entry);
    let (buffer, index) = (params[0], params[1]);
    let size = builder.ins().load(types::I32, MemFlags::trusted(), buffer, 0);
    let size = builder.ins().sextend(types::I64, size);
    let cc = if signed {
        IntCC::SignedGreaterThanOrEqual
    } else {
        IntCC::UnsignedGreaterThanOrEqual
    };
    let out_of_bounds = builder.ins().icmp(cc, index, size);
    builder.ins().brif(out_of_bounds, trap, &[], ok, &[]);

    builder.switch_to_block(trap);
    builder.ins().call(abort, &[]);
    builder.ins().return_(&[]);

    builder.switch_to_block(ok);
    builder.ins().return_(&[]);
}
