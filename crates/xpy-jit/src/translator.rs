//! Bytecode to Cranelift IR translation.
//!
//! [`FunctionTranslator`] walks a code unit once, in program order, with a
//! simulated operand stack of [`ValueId`]s. Instructions emit IR into the
//! current block; terminators close it and the next block is taken from the
//! forward-only cursor over the block map built by [`crate::cfg`].
//!
//! Operations that depend on operand types are dispatched through the
//! capability traits in [`crate::types`].

use cranelift_codegen::ir::{self, Block, FuncRef, GlobalValue, InstBuilder, types};
use cranelift_frontend::{FuncInstBuilder, FunctionBuilder};
use cranelift_jit::JITModule;
use cranelift_module::{DataId, FuncId, Module};
use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{Level, debug, enabled, trace};
use xpy_bytecode::{CodeUnit, Constant, INSTRUCTION_SIZE, Instruction, LocalIndex, Opcode, Operand};

use crate::cfg::{BlockCursor, BlockMap, build_block_map};
use crate::error::{JitError, Result};
use crate::helpers::{GeneratedHelper, Helpers, Import};
use crate::namespace::{FunctionEntry, Namespace};
use crate::types::{
    ArithOp, ArithmeticType, IntType, PointerKind, Type, TypeId, TypeRegistry, compare_addresses,
};
use crate::value::{Handle, Rvalue, ValueArena, ValueId, ValueKind};

const WIDE_SIGNED: IntType = IntType::new("i64", types::I64, true);
const WIDE_UNSIGNED: IntType = IntType::new("u64", types::I64, false);

/// Whether the stack compiler has a handler for `opcode`.
pub fn is_supported_opcode(opcode: Opcode) -> bool {
    !matches!(
        opcode,
        Opcode::BinaryModulo
            | Opcode::BinaryTrueDivide
            | Opcode::UnaryNegative
            | Opcode::BuildTuple
            | Opcode::GetIter
            | Opcode::ForIter
    )
}

/// How a block ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatorKind {
    /// `return value`
    Return,
    /// `return`
    VoidReturn,
    /// Unconditional jump (explicit or fall-through)
    Jump,
    /// Two-way conditional branch
    Branch,
}

/// Structural summary of one emitted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockSummary {
    /// Offset of the block's first instruction
    pub offset: u32,
    /// How the block ends
    pub terminator: TerminatorKind,
}

/// Compilation state of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompileState {
    /// Signature known, nothing emitted
    Declared,
    /// Block map built
    BlocksBuilt,
    /// Instructions being translated
    Emitting,
    /// Every block terminated and the function finalized
    Compiled,
}

/// Translates one code unit into the function held by its builder.
pub struct FunctionTranslator<'a> {
    builder: FunctionBuilder<'a>,
    module: &'a mut JITModule,
    types: &'a TypeRegistry,
    helpers: &'a mut Helpers,
    namespace: &'a mut Namespace,
    code: &'a CodeUnit,
    entry: FunctionEntry,
    state: CompileState,
    values: ValueArena,
    stack: Vec<ValueId>,
    locals: Vec<ValueId>,
    blocks: BlockMap<Block>,
    cursor: BlockCursor,
    current: Option<(u32, Block)>,
    loop_exits: Vec<Block>,
    temporaries: u32,
    func_refs: FxHashMap<FuncId, FuncRef>,
    data_refs: FxHashMap<DataId, GlobalValue>,
    summary: Vec<BlockSummary>,
    line: u32,
}

impl<'a> FunctionTranslator<'a> {
    /// Prepare to translate `code` as the body of `entry`.
    pub fn new(
        builder: FunctionBuilder<'a>,
        module: &'a mut JITModule,
        types: &'a TypeRegistry,
        helpers: &'a mut Helpers,
        namespace: &'a mut Namespace,
        code: &'a CodeUnit,
        entry: FunctionEntry,
    ) -> Self {
        debug!(function = %entry.name, state = ?CompileState::Declared, "function state");
        Self {
            builder,
            module,
            types,
            helpers,
            namespace,
            code,
            entry,
            state: CompileState::Declared,
            values: ValueArena::new(),
            stack: Vec::new(),
            locals: Vec::new(),
            blocks: BlockMap::default(),
            cursor: BlockCursor::default(),
            current: None,
            loop_exits: Vec::new(),
            temporaries: 0,
            func_refs: FxHashMap::default(),
            data_refs: FxHashMap::default(),
            summary: Vec::new(),
            line: code.first_line,
        }
    }

    /// Translate the whole body and finalize the function.
    pub fn translate(mut self) -> Result<Vec<BlockSummary>> {
        let code = self.code;

        let builder = &mut self.builder;
        self.blocks = build_block_map(code, |_| builder.create_block())?;
        self.cursor = self.blocks.cursor();
        debug!(
            function = %code.name,
            blocks = ?self.blocks.offsets().collect::<Vec<_>>(),
            "block map"
        );
        self.transition(CompileState::BlocksBuilt);

        self.prologue()?;
        self.transition(CompileState::Emitting);

        for instruction in &code.instructions {
            self.step(instruction)
                .map_err(|source| JitError::Instruction {
                    function: code.name.clone(),
                    offset: instruction.offset,
                    opcode: instruction.opcode,
                    line: self.line,
                    source: Box::new(source),
                })?;
        }

        if self.current.is_some() {
            return Err(JitError::FallsOffEnd(code.name.clone()));
        }
        if !self.stack.is_empty() {
            return Err(JitError::StackNotDrained {
                depth: self.stack.len(),
            });
        }

        self.builder.seal_all_blocks();
        self.transition(CompileState::Compiled);
        let summary = std::mem::take(&mut self.summary);
        self.builder.finalize();
        Ok(summary)
    }

    fn transition(&mut self, next: CompileState) {
        debug_assert!(next > self.state);
        debug!(function = %self.code.name, from = ?self.state, to = ?next, "function state");
        self.state = next;
    }

    /// Bind parameters to variables and jump to the first block.
    fn prologue(&mut self) -> Result<()> {
        let code = self.code;
        let arg_count = usize::from(code.arg_count);
        if arg_count != self.entry.params.len() {
            return Err(JitError::ArgumentCount {
                function: code.name.clone(),
                expected: self.entry.params.len(),
                found: arg_count,
            });
        }

        let entry = self.builder.create_block();
        self.builder.append_block_params_for_function_params(entry);
        self.builder.switch_to_block(entry);
        let params = self.builder.block_params(entry).to_vec();

        let pointer = self.types.pointer_type();
        for index in 0..code.local_count() {
            let slot = u16::try_from(index).map_err(|_| JitError::TooManyLocals {
                function: code.name.clone(),
                count: code.local_count(),
            })?;
            let name = code.local_name(LocalIndex::new(slot));
            let local = match (self.entry.params.get(index), params.get(index)) {
                (Some(&ty), Some(&param)) => {
                    let ir = self
                        .types
                        .get(ty)
                        .ir_type(pointer)
                        .ok_or_else(|| JitError::mismatch("parameter type", "void"))?;
                    let var = self.builder.declare_var(ir);
                    self.builder.def_var(var, param);
                    Rvalue::param(slot, ty, name, var)
                }
                _ => Rvalue::local(slot, name),
            };
            let id = self.values.alloc(local);
            self.locals.push(id);
        }

        let (offset, first) = self
            .cursor
            .next_block(&self.blocks)
            .ok_or(JitError::BlockCursorExhausted(0))?;
        self.builder.ins().jump(first, &[]);
        self.builder.switch_to_block(first);
        self.current = Some((offset, first));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------------

    /// Take the block starting at `offset` from the cursor, closing the
    /// current block with a fall-through jump if it is still open.
    fn enter_block(&mut self, offset: u32) -> Result<()> {
        if !self.stack.is_empty() {
            return Err(JitError::StackNotDrained {
                depth: self.stack.len(),
            });
        }
        let (start, block) = self
            .cursor
            .next_block(&self.blocks)
            .filter(|(start, _)| *start == offset)
            .ok_or(JitError::BlockCursorExhausted(offset))?;

        if self.current.is_some() {
            self.builder.ins().jump(block, &[]);
            self.terminate(TerminatorKind::Jump);
        }
        self.builder.switch_to_block(block);
        self.current = Some((start, block));
        trace!(function = %self.code.name, offset, "enter block");
        Ok(())
    }

    /// Record the terminator of the current block and close it.
    fn terminate(&mut self, terminator: TerminatorKind) {
        if let Some((offset, _)) = self.current.take() {
            self.summary.push(BlockSummary { offset, terminator });
        }
    }

    fn block_at(&self, target: u32, from: u32) -> Result<Block> {
        self.blocks.get(target).ok_or(JitError::InvalidJumpTarget {
            offset: from,
            target,
            code_len: self.code.code_len(),
        })
    }

    fn fall_through(&self, instruction: &Instruction) -> Result<Block> {
        self.block_at(instruction.offset + INSTRUCTION_SIZE, instruction.offset)
    }

    fn jump_target(&self, instruction: &Instruction) -> Result<Block> {
        let target = instruction
            .jump_target()
            .ok_or(JitError::InvalidOperand(instruction.opcode))?;
        self.block_at(target, instruction.offset)
    }

    // -----------------------------------------------------------------------
    // Operand stack
    // -----------------------------------------------------------------------

    fn push(&mut self, value: ValueId) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<ValueId> {
        self.stack.pop().ok_or(JitError::StackUnderflow)
    }

    fn require(&self, depth: usize) -> Result<()> {
        if self.stack.len() < depth {
            return Err(JitError::StackUnderflow);
        }
        Ok(())
    }

    fn none(&mut self) -> ValueId {
        self.alloc(Rvalue::constant(Constant::None, Some(TypeId::OPAQUE)))
    }

    // -----------------------------------------------------------------------
    // Instructions
    // -----------------------------------------------------------------------

    fn step(&mut self, instruction: &Instruction) -> Result<()> {
        let offset = instruction.offset;
        if let Some(line) = instruction.line {
            self.line = line;
        }
        let current = self.current.map(|(start, _)| start);
        if self.blocks.starts_block(offset) && current != Some(offset) {
            self.enter_block(offset)?;
        }
        if self.current.is_none() {
            return Err(JitError::BlockCursorExhausted(offset));
        }

        if enabled!(Level::TRACE) {
            let stack: Vec<String> = self
                .stack
                .iter()
                .map(|id| self.values.get(*id).describe())
                .collect();
            trace!(
                block = ?self.current.map(|(start, _)| start),
                stack = ?stack,
                "{instruction}"
            );
        }

        let opcode = instruction.opcode;
        match opcode {
            Opcode::Nop => {}
            Opcode::PopTop => {
                self.pop()?;
            }
            Opcode::RotTwo => {
                self.require(2)?;
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Opcode::RotThree => {
                self.require(3)?;
                let top = self.pop()?;
                let at = self.stack.len() - 2;
                self.stack.insert(at, top);
            }
            Opcode::DupTop => {
                let top = *self.stack.last().ok_or(JitError::StackUnderflow)?;
                self.push(top);
            }
            Opcode::LoadConst => {
                let Operand::Const(constant) = &instruction.operand else {
                    return Err(JitError::InvalidOperand(opcode));
                };
                let ty = self.types.literal_type(constant);
                let value = self.alloc(Rvalue::constant(constant.clone(), ty));
                self.push(value);
            }
            Opcode::LoadFast => {
                let slot = self.local_slot(instruction)?;
                let value = self.load_local(slot)?;
                self.push(value);
            }
            Opcode::StoreFast => {
                let slot = self.local_slot(instruction)?;
                let value = self.pop()?;
                self.store_local(slot, value)?;
            }
            Opcode::LoadGlobal => {
                let name = instruction
                    .name()
                    .ok_or(JitError::InvalidOperand(opcode))?;
                let value = self.load_global(name)?;
                self.push(value);
            }
            Opcode::UnpackSequence => {
                let count = instruction.count().ok_or(JitError::InvalidOperand(opcode))?;
                let sequence = self.pop()?;
                let items = match &self.values.get(sequence).kind {
                    ValueKind::Constant(Constant::Tuple(items)) if items.len() == count as usize => {
                        items.clone()
                    }
                    _ => {
                        return Err(JitError::mismatch(
                            format!("tuple of {count}"),
                            self.values.get(sequence).describe(),
                        ));
                    }
                };
                for item in items.into_iter().rev() {
                    let ty = self.types.literal_type(&item);
                    let value = self.alloc(Rvalue::constant(item, ty));
                    self.push(value);
                }
            }
            Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryMultiply
            | Opcode::BinaryFloorDivide
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceFloorDivide => {
                let op = ArithOp::from_opcode(opcode).ok_or(JitError::UnsupportedInstruction {
                    offset,
                    opcode,
                })?;
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = self.binary_op(op, lhs, rhs)?;
                self.push(result);
            }
            Opcode::CompareOp => {
                let Operand::Compare(op) = instruction.operand else {
                    return Err(JitError::InvalidOperand(opcode));
                };
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let (lhs, rhs, ty) = self.unify(lhs, rhs)?;
                let types = self.types;
                let result = match types.get(ty) {
                    Type::Int(int) => int.compare(self, op, lhs, rhs)?,
                    Type::Void => return Err(JitError::NoArithmetic(types.name(ty))),
                    other => compare_addresses(self, &other.name(), op, lhs, rhs)?,
                };
                self.push(result);
            }
            Opcode::BinarySubscr => {
                let index = self.pop()?;
                let container = self.pop()?;
                let types = self.types;
                let ty = self.type_of(container)?;
                let subscript = types
                    .get(ty)
                    .as_subscriptable()
                    .ok_or_else(|| JitError::NotSubscriptable(types.name(ty)))?;
                let item = subscript.load_item(self, container, index)?;
                self.push(item);
            }
            Opcode::StoreSubscr => {
                let index = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                let types = self.types;
                let ty = self.type_of(container)?;
                let subscript = types
                    .get(ty)
                    .as_subscriptable()
                    .ok_or_else(|| JitError::NotSubscriptable(types.name(ty)))?;
                subscript.store_item(self, container, index, value)?;
            }
            Opcode::LoadAttr => {
                let field = instruction.name().ok_or(JitError::InvalidOperand(opcode))?;
                let object = self.pop()?;
                let types = self.types;
                let ty = self.type_of(object)?;
                let access = types
                    .get(ty)
                    .as_field_access()
                    .ok_or_else(|| JitError::NoAttributes(types.name(ty)))?;
                let value = access.load_field(self, object, field)?;
                self.push(value);
            }
            Opcode::StoreAttr => {
                let field = instruction.name().ok_or(JitError::InvalidOperand(opcode))?;
                let object = self.pop()?;
                let value = self.pop()?;
                let types = self.types;
                let ty = self.type_of(object)?;
                let access = types
                    .get(ty)
                    .as_field_access()
                    .ok_or_else(|| JitError::NoAttributes(types.name(ty)))?;
                access.store_field(self, object, field, value)?;
            }
            Opcode::CallFunction => {
                let argc = instruction.count().ok_or(JitError::InvalidOperand(opcode))? as usize;
                self.require(argc + 1)?;
                let args = self.stack.split_off(self.stack.len() - argc);
                let callee = self.pop()?;
                let result = self.call(callee, &args)?;
                self.push(result);
            }
            Opcode::ReturnValue => {
                let value = self.pop()?;
                if self.entry.returns == TypeId::VOID {
                    self.builder.ins().return_(&[]);
                    self.terminate(TerminatorKind::VoidReturn);
                } else {
                    let value = self.coerce(value, self.entry.returns)?;
                    let v = self.value(value)?;
                    self.builder.ins().return_(&[v]);
                    self.terminate(TerminatorKind::Return);
                }
            }
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let target = self.jump_target(instruction)?;
                let next = self.fall_through(instruction)?;
                let condition = self.pop()?;
                let c = self.value(condition)?;
                if opcode == Opcode::PopJumpIfFalse {
                    self.builder.ins().brif(c, next, &[], target, &[]);
                } else {
                    self.builder.ins().brif(c, target, &[], next, &[]);
                }
                self.terminate(TerminatorKind::Branch);
            }
            Opcode::JumpAbsolute | Opcode::JumpForward => {
                let target = self.jump_target(instruction)?;
                self.builder.ins().jump(target, &[]);
                self.terminate(TerminatorKind::Jump);
            }
            Opcode::SetupLoop => {
                let exit = self.jump_target(instruction)?;
                let body = self.fall_through(instruction)?;
                self.loop_exits.push(exit);
                self.builder.ins().jump(body, &[]);
                self.terminate(TerminatorKind::Jump);
            }
            Opcode::BreakLoop => {
                let exit = *self.loop_exits.last().ok_or(JitError::LoopStackEmpty)?;
                self.builder.ins().jump(exit, &[]);
                self.terminate(TerminatorKind::Jump);
            }
            Opcode::PopBlock => {
                self.loop_exits.pop().ok_or(JitError::LoopStackEmpty)?;
                let next = offset + INSTRUCTION_SIZE;
                if let Some(block) = self.blocks.get(next) {
                    self.builder.ins().jump(block, &[]);
                    self.terminate(TerminatorKind::Jump);
                }
            }
            Opcode::BinaryModulo
            | Opcode::BinaryTrueDivide
            | Opcode::UnaryNegative
            | Opcode::BuildTuple
            | Opcode::GetIter
            | Opcode::ForIter => {
                return Err(JitError::UnsupportedInstruction { offset, opcode });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Locals and globals
    // -----------------------------------------------------------------------

    fn local_slot(&self, instruction: &Instruction) -> Result<ValueId> {
        let index = instruction
            .local()
            .ok_or(JitError::InvalidOperand(instruction.opcode))?;
        self.locals
            .get(usize::from(index.index()))
            .copied()
            .ok_or_else(|| JitError::UnboundLocal(self.code.local_name(index)))
    }

    /// By-copy slots are copied into a fresh temporary; anything else is
    /// pushed as the slot itself.
    fn load_local(&mut self, slot: ValueId) -> Result<ValueId> {
        let local = self.values.get(slot);
        let (Some(ty), Some(Handle::Var(var))) = (local.ty, local.handle()) else {
            return Err(JitError::UnboundLocal(local.describe()));
        };
        if self.types.get(ty).is_by_copy() {
            let v = self.builder.use_var(var);
            self.temporary(ty, v)
        } else {
            Ok(slot)
        }
    }

    /// The first store fixes the slot type; later stores must agree.
    fn store_local(&mut self, slot: ValueId, value: ValueId) -> Result<()> {
        let value_ty = self.type_of(value)?;
        let var = match (self.values.get(slot).ty, self.values.get(slot).handle()) {
            (Some(slot_ty), Some(Handle::Var(var))) => {
                let value = self.coerce(value, slot_ty)?;
                let v = self.value(value)?;
                self.builder.def_var(var, v);
                return Ok(());
            }
            _ => {
                let ir = self
                    .types
                    .get(value_ty)
                    .ir_type(self.types.pointer_type())
                    .ok_or_else(|| JitError::mismatch("storable value", "void"))?;
                self.builder.declare_var(ir)
            }
        };

        let local = self.values.get_mut(slot);
        local.ty = Some(value_ty);
        local.set_handle(Handle::Var(var));
        let v = self.value(value)?;
        self.builder.def_var(var, v);
        Ok(())
    }

    fn load_global(&mut self, name: &str) -> Result<ValueId> {
        if let Some(constant) = self.namespace.constant(name).copied() {
            let value = Rvalue::constant(Constant::Int(constant.value), Some(constant.ty)).with_tag(name);
            return Ok(self.alloc(value));
        }
        if let Some(global) = self.namespace.global(name).copied() {
            return Ok(self.alloc(Rvalue::global(name, Some(global.ty))));
        }
        if self.namespace.resolves(name) {
            return Ok(self.alloc(Rvalue::global(name, None)));
        }
        Err(JitError::UnknownName(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Arithmetic
    // -----------------------------------------------------------------------

    /// Bring both operands to one type. A default-integer literal adopts the
    /// other operand's type; otherwise the top operand's type wins.
    fn unify(&mut self, lhs: ValueId, rhs: ValueId) -> Result<(ValueId, ValueId, TypeId)> {
        let lhs_ty = self.type_of(lhs)?;
        let rhs_ty = self.type_of(rhs)?;
        if lhs_ty == rhs_ty {
            return Ok((lhs, rhs, lhs_ty));
        }
        if self.is_adoptable(rhs) {
            let rhs = self.coerce(rhs, lhs_ty)?;
            return Ok((lhs, rhs, lhs_ty));
        }
        let lhs = self.coerce(lhs, rhs_ty)?;
        Ok((lhs, rhs, rhs_ty))
    }

    fn is_adoptable(&self, id: ValueId) -> bool {
        let value = self.values.get(id);
        match &value.kind {
            ValueKind::Constant(Constant::Int(_)) => value.ty == Some(TypeId::INT),
            ValueKind::Constant(Constant::None) => true,
            _ => false,
        }
    }

    fn binary_op(&mut self, op: ArithOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let (lhs, rhs, ty) = self.unify(lhs, rhs)?;
        let types = self.types;
        let arithmetic = types
            .get(ty)
            .as_arithmetic()
            .ok_or_else(|| JitError::NoArithmetic(types.name(ty)))?;
        arithmetic.binary_op(self, op, ty, lhs, rhs)
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn call(&mut self, callee: ValueId, args: &[ValueId]) -> Result<ValueId> {
        let name = match &self.values.get(callee).kind {
            ValueKind::Global(name) => name.clone(),
            _ => {
                return Err(JitError::UnknownCallee {
                    name: self.values.get(callee).describe(),
                    argc: args.len(),
                });
            }
        };
        let unknown = || JitError::UnknownCallee {
            name: name.clone(),
            argc: args.len(),
        };

        if let Some(entry) = self.namespace.function(&name).cloned() {
            return self.call_direct(&entry, args);
        }

        match (name.as_str(), args) {
            ("abort", []) => {
                self.call_import(Import::Abort, &[])?;
                Ok(self.alloc(Rvalue::unreachable()))
            }
            ("byte" | "ushort" | "uint" | "unsigned" | "ssize", [arg]) => self.narrow(&name, *arg),
            ("print", _) => self.print(args),
            ("default", [object]) => {
                let types = self.types;
                let ty = self.type_of(*object)?;
                let layout = types
                    .get(ty)
                    .as_struct()
                    .ok_or_else(|| JitError::mismatch("struct", types.name(ty)))?;
                layout.store_defaults(self, *object)?;
                Ok(self.none())
            }
            (_, [receiver]) => {
                let types = self.types;
                let ty = self.type_of(*receiver)?;
                let Some(methods) = types.get(ty).as_method() else {
                    return Err(unknown());
                };
                methods.call_method(self, &name, *receiver)?.ok_or_else(unknown)
            }
            _ => Err(unknown()),
        }
    }

    fn call_direct(&mut self, entry: &FunctionEntry, args: &[ValueId]) -> Result<ValueId> {
        if args.len() != entry.params.len() {
            return Err(JitError::ArgumentCount {
                function: entry.name.clone(),
                expected: entry.params.len(),
                found: args.len(),
            });
        }
        let mut values: SmallVec<[ir::Value; 4]> = SmallVec::new();
        for (arg, ty) in args.iter().zip(&entry.params) {
            let arg = self.coerce(*arg, *ty)?;
            values.push(self.value(arg)?);
        }

        let callee = self.func_ref(entry.id);
        let call = self.builder.ins().call(callee, &values);
        if entry.returns == TypeId::VOID {
            return Ok(self.none());
        }
        let result = self
            .builder
            .inst_results(call)
            .first()
            .copied()
            .ok_or_else(|| JitError::mismatch(self.types.name(entry.returns), "void"))?;
        Ok(self.computed(result, entry.returns))
    }

    /// `byte(200)` and friends: a literal retyped after a range check.
    fn narrow(&mut self, name: &str, arg: ValueId) -> Result<ValueId> {
        let target = self
            .types
            .lookup(name)
            .ok_or_else(|| JitError::UnknownType(name.to_string()))?;
        let int = self
            .types
            .int(target)
            .ok_or_else(|| JitError::mismatch("integer type", name))?;
        let literal = self
            .values
            .get(arg)
            .int_literal()
            .ok_or_else(|| JitError::mismatch("integer constant", self.values.get(arg).describe()))?;
        int.immediate(literal)?;
        Ok(self.alloc(Rvalue::constant(Constant::Int(literal), Some(target))))
    }

    fn print(&mut self, args: &[ValueId]) -> Result<ValueId> {
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                self.call_import(Import::PrintSeparator, &[])?;
            }
            let registry = self.types;
            let ty = self.type_of(*arg)?;
            let v = self.value(*arg)?;
            match registry.get(ty) {
                Type::Int(int) => {
                    let (wide, import) = if int.signed {
                        (WIDE_SIGNED, Import::PrintInt)
                    } else {
                        (WIDE_UNSIGNED, Import::PrintUnsigned)
                    };
                    let v = int.convert(&mut self.builder, v, &wide);
                    self.call_import(import, &[v])?;
                }
                Type::Bool => {
                    let v = self.builder.ins().uextend(types::I64, v);
                    self.call_import(Import::PrintInt, &[v])?;
                }
                Type::Pointer(PointerKind::CStr) => {
                    self.call_import(Import::PrintCStr, &[v])?;
                }
                other => return Err(JitError::mismatch("printable value", other.name())),
            }
        }
        self.call_import(Import::PrintNewline, &[])?;
        Ok(self.none())
    }

    fn func_ref(&mut self, id: FuncId) -> FuncRef {
        if let Some(&func_ref) = self.func_refs.get(&id) {
            return func_ref;
        }
        let func_ref = self.module.declare_func_in_func(id, self.builder.func);
        self.func_refs.insert(id, func_ref);
        func_ref
    }

    fn call_import(&mut self, import: Import, args: &[ir::Value]) -> Result<()> {
        let callee = self.func_ref(self.helpers.import(import));
        self.builder.ins().call(callee, args);
        Ok(())
    }

    /// Call a generated helper, defining it on first use.
    pub(crate) fn call_generated(
        &mut self,
        helper: GeneratedHelper,
        args: &[ir::Value],
    ) -> Result<Option<ir::Value>> {
        let id = self.helpers.generated(self.module, helper)?;
        let callee = self.func_ref(id);
        let call = self.builder.ins().call(callee, args);
        Ok(self.builder.inst_results(call).first().copied())
    }

    // -----------------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------------

    /// Type registry
    pub(crate) fn types(&self) -> &'a TypeRegistry {
        self.types
    }

    /// Host pointer type
    pub(crate) fn pointer_type(&self) -> ir::Type {
        self.types.pointer_type()
    }

    /// Instruction builder for the current block
    pub(crate) fn ins(&mut self) -> FuncInstBuilder<'_, 'a> {
        self.builder.ins()
    }

    /// Add a value to the arena
    pub(crate) fn alloc(&mut self, value: Rvalue) -> ValueId {
        self.values.alloc(value)
    }

    /// Wrap the result of an emitted operation
    pub(crate) fn computed(&mut self, value: ir::Value, ty: TypeId) -> ValueId {
        self.alloc(Rvalue::computed(value, ty))
    }

    /// Copy a by-copy value into a fresh temporary
    pub(crate) fn temporary(&mut self, ty: TypeId, value: ir::Value) -> Result<ValueId> {
        let ir = self
            .types
            .get(ty)
            .ir_type(self.types.pointer_type())
            .ok_or_else(|| JitError::mismatch("value", "void"))?;
        let var = self.builder.declare_var(ir);
        self.builder.def_var(var, value);
        let index = self.temporaries;
        self.temporaries += 1;
        Ok(self.alloc(Rvalue::temporary(index, ty, var)))
    }

    fn type_of(&self, id: ValueId) -> Result<TypeId> {
        let value = self.values.get(id);
        value
            .ty
            .ok_or_else(|| JitError::mismatch("typed value", value.describe()))
    }

    /// Value `id` converted to type `target`.
    ///
    /// Equal types pass through; a default-integer literal takes any integer
    /// type it fits; `None` takes any pointer type; a `bool` widens to an
    /// integer. Everything else is a type mismatch.
    pub(crate) fn coerce(&mut self, id: ValueId, target: TypeId) -> Result<ValueId> {
        let found = self.type_of(id)?;
        if found == target {
            return Ok(id);
        }
        let registry = self.types;
        let kind = self.values.get(id).kind.clone();
        match (kind, registry.get(target)) {
            (ValueKind::Constant(Constant::Int(literal)), Type::Int(int)) if found == TypeId::INT => {
                int.immediate(literal)?;
                Ok(self.alloc(Rvalue::constant(Constant::Int(literal), Some(target))))
            }
            (ValueKind::Constant(Constant::None), ty) if !ty.is_by_copy() && *ty != Type::Void => {
                Ok(self.alloc(Rvalue::constant(Constant::None, Some(target))))
            }
            (_, Type::Int(int)) if found == TypeId::BOOL => {
                let flag = self.value(id)?;
                let widened = if int.ir == types::I8 {
                    flag
                } else {
                    self.builder.ins().uextend(int.ir, flag)
                };
                Ok(self.computed(widened, target))
            }
            _ => Err(JitError::mismatch(registry.name(target), registry.name(found))),
        }
    }

    /// Integer value `id` extended to 64 bits by its own signedness.
    ///
    /// A default-integer literal is taken as `int`. Returns the widened value
    /// and whether it is signed.
    pub(crate) fn wide_int(&mut self, id: ValueId) -> Result<(ir::Value, bool)> {
        let types = self.types;
        let id = if self.is_adoptable(id) {
            self.coerce(id, TypeId::INT)?
        } else {
            id
        };
        let found = self.type_of(id)?;
        let from = types
            .int(found)
            .ok_or_else(|| JitError::mismatch("integer", types.name(found)))?;
        let value = self.value(id)?;
        let wide = if from.signed { WIDE_SIGNED } else { WIDE_UNSIGNED };
        Ok((from.convert(&mut self.builder, value, &wide), from.signed))
    }

    /// Backend value of `id`, materialized on first use.
    pub(crate) fn value(&mut self, id: ValueId) -> Result<ir::Value> {
        if let Some(handle) = self.values.get(id).handle() {
            return Ok(match handle {
                Handle::Var(var) => self.builder.use_var(var),
                Handle::Value(value) | Handle::Address(value) => value,
            });
        }

        let rvalue = self.values.get(id);
        let (kind, ty) = (rvalue.kind.clone(), rvalue.ty);
        let handle = match kind {
            ValueKind::Constant(constant) => Handle::Value(self.materialize(&constant, ty)?),
            ValueKind::Global(name) => {
                let global = self
                    .namespace
                    .global(&name)
                    .copied()
                    .ok_or_else(|| JitError::mismatch("value", name.clone()))?;
                Handle::Address(self.data_address(global.data))
            }
            ValueKind::Param(_) | ValueKind::Local(_) => {
                return Err(JitError::UnboundLocal(self.values.get(id).describe()));
            }
            ValueKind::Unreachable | ValueKind::Temporary(_) | ValueKind::Computed => {
                return Err(JitError::mismatch("value", self.values.get(id).describe()));
            }
        };
        self.values.get(id).set_handle(handle);
        Ok(match handle {
            Handle::Var(var) => self.builder.use_var(var),
            Handle::Value(value) | Handle::Address(value) => value,
        })
    }

    fn materialize(&mut self, constant: &Constant, ty: Option<TypeId>) -> Result<ir::Value> {
        match constant {
            Constant::Int(literal) => {
                let ty = ty.unwrap_or(TypeId::INT);
                let int = self
                    .types
                    .int(ty)
                    .ok_or_else(|| JitError::mismatch(self.types.name(ty), "int"))?;
                let imm = int.immediate(*literal)?;
                Ok(self.builder.ins().iconst(int.ir, imm))
            }
            Constant::Str(text) => {
                let data = self.namespace.string_data(self.module, text)?;
                Ok(self.data_address(data))
            }
            Constant::None => {
                let pointer = self.types.pointer_type();
                Ok(self.builder.ins().iconst(pointer, 0))
            }
            Constant::Tuple(_) => Err(JitError::UnsupportedConstant(constant.to_string())),
        }
    }

    fn data_address(&mut self, data: DataId) -> ir::Value {
        let global = match self.data_refs.get(&data) {
            Some(&global) => global,
            None => {
                let global = self.module.declare_data_in_func(data, self.builder.func);
                self.data_refs.insert(data, global);
                global
            }
        };
        let pointer = self.types.pointer_type();
        self.builder.ins().symbol_value(pointer, global)
    }
}
