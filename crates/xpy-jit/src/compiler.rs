//! JIT session wrapper around Cranelift.
//!
//! A [`JitCompiler`] owns one `JITModule` and one namespace. Functions are
//! declared before any body is translated, defined one at a time, and become
//! callable after `finalize_definitions`. Every function also gets a uniform
//! trampoline `extern "C" fn(*const i64) -> i64` so the host can invoke it
//! without knowing its native signature.

use cranelift_codegen::ir::{self, AbiParam, InstBuilder, MemFlags, UserFuncName, types};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::verifier::verify_function;
use cranelift_codegen::print_errors::pretty_verifier_error;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module, default_libcall_names};
use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::debug;
use xpy_bytecode::{CodeUnit, FunctionDef, Module as ModuleDef};

use crate::config::JitConfig;
use crate::error::{JitError, Result};
use crate::helpers::{self, Helpers};
use crate::namespace::{FunctionEntry, Namespace};
use crate::translator::FunctionTranslator;
use crate::types::{Type, TypeId, TypeRegistry};

pub use crate::translator::{BlockSummary, TerminatorKind};

/// A compiled function.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    /// Source name
    pub name: String,
    /// Parameter types
    pub params: Vec<TypeId>,
    /// Return type
    pub returns: TypeId,
    /// Native entry point with the function's own signature
    pub code_ptr: *const u8,
    /// Entry point of the `extern "C" fn(*const i64) -> i64` trampoline
    pub trampoline: *const u8,
    /// Blocks in fall-through order with their terminators
    pub blocks: Vec<BlockSummary>,
    /// Textual IR, when [`JitConfig::keep_ir`] is set
    pub ir: Option<String>,
}

impl CompiledFunction {
    /// Terminator kinds in block order
    pub fn terminators(&self) -> Vec<TerminatorKind> {
        self.blocks.iter().map(|block| block.terminator).collect()
    }
}

/// Function defined but not yet finalized.
struct PendingFunction {
    entry: FunctionEntry,
    trampoline: FuncId,
    blocks: Vec<BlockSummary>,
    ir: Option<String>,
}

/// Cranelift-backed compiler for one namespace.
///
/// A failed compile leaves the session partially populated; start a new
/// compiler afterwards.
pub struct JitCompiler {
    config: JitConfig,
    module: JITModule,
    context: cranelift_codegen::Context,
    function_builder_ctx: FunctionBuilderContext,
    types: TypeRegistry,
    helpers: Helpers,
    namespace: Namespace,
    functions: IndexMap<String, CompiledFunction>,
}

impl JitCompiler {
    /// Create a compiler with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(JitConfig::default())
    }

    /// Create a compiler for the host ISA.
    pub fn with_config(config: JitConfig) -> Result<Self> {
        let builder_error = |e: settings::SetError| JitError::Builder(e.to_string());
        let mut flags = settings::builder();
        flags
            .set("opt_level", config.opt_level.as_setting())
            .map_err(builder_error)?;
        flags
            .set("enable_verifier", if config.verify { "true" } else { "false" })
            .map_err(builder_error)?;
        flags.set("use_colocated_libcalls", "false").map_err(builder_error)?;
        flags.set("is_pic", "false").map_err(builder_error)?;

        let isa = cranelift_native::builder()
            .map_err(|detail| JitError::Builder(format!("host ISA not supported: {detail}")))?
            .finish(settings::Flags::new(flags))
            .map_err(|e| JitError::Builder(e.to_string()))?;
        let pointer = isa.pointer_type();

        let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
        helpers::register_symbols(&mut builder);
        let mut module = JITModule::new(builder);
        let helpers = Helpers::declare(&mut module, pointer)?;

        debug!(?config, pointer = %pointer, "jit session");
        Ok(Self {
            config,
            module,
            context: cranelift_codegen::Context::new(),
            function_builder_ctx: FunctionBuilderContext::new(),
            types: TypeRegistry::new(pointer),
            helpers,
            namespace: Namespace::new(),
            functions: IndexMap::new(),
        })
    }

    /// Configuration
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Type registry
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Top-level names
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Number of generated runtime helpers
    pub fn helper_count(&self) -> usize {
        self.helpers.generated_count()
    }

    /// Compile every definition of `module`.
    ///
    /// Structs, constants and globals are bound first, then every function
    /// is declared, so bodies may refer to any name in any order.
    pub fn compile_module(&mut self, module: &ModuleDef) -> Result<()> {
        module.validate()?;
        self.types.declare_structs(&module.structs)?;
        for constant in &module.constants {
            self.namespace.declare_constant(&mut self.types, constant)?;
        }
        for global in &module.globals {
            self.namespace
                .declare_global(&mut self.module, &mut self.types, global)?;
        }

        let mut declared = Vec::with_capacity(module.functions.len());
        for def in &module.functions {
            let code = def.code_unit()?;
            let entry = self
                .namespace
                .declare_function(&mut self.module, &mut self.types, def)?;
            declared.push((code, entry));
        }

        let mut pending = Vec::with_capacity(declared.len());
        for (code, entry) in &declared {
            pending.push(self.define(code, entry)?);
        }
        self.finalize(pending)
    }

    /// Compile one function into the current namespace.
    pub fn compile_function(&mut self, def: &FunctionDef) -> Result<&CompiledFunction> {
        let code = def.code_unit()?;
        let entry = self
            .namespace
            .declare_function(&mut self.module, &mut self.types, def)?;
        let pending = self.define(&code, &entry)?;
        self.finalize(vec![pending])?;
        self.artifact(&def.name)
    }

    /// Look up a compiled function
    pub fn get(&self, name: &str) -> Option<&CompiledFunction> {
        self.functions.get(name)
    }

    /// Look up a compiled function, failing if it does not exist
    pub fn artifact(&self, name: &str) -> Result<&CompiledFunction> {
        self.get(name)
            .ok_or_else(|| JitError::UnknownFunction(name.to_string()))
    }

    /// Compiled functions in compilation order
    pub fn functions(&self) -> impl Iterator<Item = &CompiledFunction> {
        self.functions.values()
    }

    /// Call a compiled function through its trampoline.
    ///
    /// Integer arguments are passed as their value, pointer-typed arguments
    /// (buffers, structs, strings) as an address. Narrow integer results are
    /// sign- or zero-extended to 64 bits; void functions return 0.
    ///
    /// # Safety
    ///
    /// Every pointer-typed argument must point at a live object with the
    /// layout its parameter type expects (see [`crate::host`]).
    pub unsafe fn invoke(&self, name: &str, args: &[i64]) -> Result<i64> {
        let function = self.artifact(name)?;
        if args.len() != function.params.len() {
            return Err(JitError::ArgumentCount {
                function: name.to_string(),
                expected: function.params.len(),
                found: args.len(),
            });
        }
        let entry: extern "C" fn(*const i64) -> i64 = unsafe {
            // SAFETY: trampolines are generated by `define_trampoline` with
            // signature `(*const i64) -> i64` and read exactly `params.len()`
            // words from the argument pointer.
            std::mem::transmute(function.trampoline)
        };
        Ok(entry(args.as_ptr()))
    }

    fn define(&mut self, code: &CodeUnit, entry: &FunctionEntry) -> Result<PendingFunction> {
        let result = self.define_body(code, entry);
        if result.is_err() {
            self.module.clear_context(&mut self.context);
            self.function_builder_ctx = FunctionBuilderContext::new();
        }
        result
    }

    fn define_body(&mut self, code: &CodeUnit, entry: &FunctionEntry) -> Result<PendingFunction> {
        let signature = Namespace::signature(&self.module, &self.types, &entry.params, entry.returns);
        self.context.func =
            ir::Function::with_name_signature(UserFuncName::user(0, entry.id.as_u32()), signature);

        let blocks = {
            let builder = FunctionBuilder::new(&mut self.context.func, &mut self.function_builder_ctx);
            FunctionTranslator::new(
                builder,
                &mut self.module,
                &self.types,
                &mut self.helpers,
                &mut self.namespace,
                code,
                entry.clone(),
            )
            .translate()?
        };

        if self.config.verify {
            verify_function(&self.context.func, self.module.isa()).map_err(|errors| {
                JitError::Verifier(pretty_verifier_error(&self.context.func, None, errors))
            })?;
        }
        let ir = self
            .config
            .keep_ir
            .then(|| self.context.func.display().to_string());

        self.module.define_function(entry.id, &mut self.context)?;
        self.module.clear_context(&mut self.context);

        let trampoline = self.define_trampoline(entry)?;
        debug!(function = %entry.name, blocks = blocks.len(), "compiled function");
        Ok(PendingFunction {
            entry: entry.clone(),
            trampoline,
            blocks,
            ir,
        })
    }

    /// `extern "C" fn(args: *const i64) -> i64` calling `entry`.
    fn define_trampoline(&mut self, entry: &FunctionEntry) -> Result<FuncId> {
        let pointer = self.types.pointer_type();
        let mut signature = self.module.make_signature();
        signature.params.push(AbiParam::new(pointer));
        signature.returns.push(AbiParam::new(types::I64));
        let id = self.module.declare_function(
            &format!("xpy_entry_{}", entry.name),
            Linkage::Local,
            &signature,
        )?;
        self.context.func =
            ir::Function::with_name_signature(UserFuncName::user(2, id.as_u32()), signature);

        {
            let mut builder =
                FunctionBuilder::new(&mut self.context.func, &mut self.function_builder_ctx);
            let block = builder.create_block();
            builder.append_block_params_for_function_params(block);
            builder.switch_to_block(block);
            let args = builder.block_params(block)[0];

            let mut values: SmallVec<[ir::Value; 4]> = SmallVec::new();
            for (i, ty) in entry.params.iter().enumerate() {
                let word = builder
                    .ins()
                    .load(types::I64, MemFlags::trusted(), args, (i * 8) as i32);
                let ir = self.types.get(*ty).ir_type(pointer).unwrap_or(types::I64);
                values.push(if ir == types::I64 {
                    word
                } else {
                    builder.ins().ireduce(ir, word)
                });
            }

            let callee = self.module.declare_func_in_func(entry.id, builder.func);
            let call = builder.ins().call(callee, &values);
            let result = match builder.inst_results(call).first().copied() {
                None => builder.ins().iconst(types::I64, 0),
                Some(value) if builder.func.dfg.value_type(value) == types::I64 => value,
                Some(value) => match self.types.get(entry.returns) {
                    Type::Int(int) if int.signed => builder.ins().sextend(types::I64, value),
                    _ => builder.ins().uextend(types::I64, value),
                },
            };
            builder.ins().return_(&[result]);
            builder.seal_all_blocks();
            builder.finalize();
        }

        self.module.define_function(id, &mut self.context)?;
        self.module.clear_context(&mut self.context);
        Ok(id)
    }

    fn finalize(&mut self, pending: Vec<PendingFunction>) -> Result<()> {
        self.module.finalize_definitions()?;
        for function in pending {
            let code_ptr = self.module.get_finalized_function(function.entry.id);
            let trampoline = self.module.get_finalized_function(function.trampoline);
            let name = function.entry.name.clone();
            self.functions.insert(
                name.clone(),
                CompiledFunction {
                    name,
                    params: function.entry.params,
                    returns: function.entry.returns,
                    code_ptr,
                    trampoline,
                    blocks: function.blocks,
                    ir: function.ir,
                },
            );
        }
        Ok(())
    }
}
