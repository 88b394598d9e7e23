//! Code units (one compiled function body)

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::INSTRUCTION_SIZE;
use crate::instruction::{Instruction, Opcode, Operand};
use crate::operand::LocalIndex;

/// A function body in bytecode form
///
/// Immutable input to compilation. Instruction `n` sits at offset
/// `n * INSTRUCTION_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    /// Function name
    pub name: String,

    /// Source file name
    #[serde(default)]
    pub filename: String,

    /// First source line
    #[serde(default)]
    pub first_line: u32,

    /// Number of positional parameters (the first locals)
    pub arg_count: u16,

    /// Local variable names (parameters first)
    #[serde(default)]
    pub var_names: Vec<String>,

    /// Bytecode instructions
    pub instructions: Vec<Instruction>,
}

impl CodeUnit {
    /// Create a new code unit builder
    pub fn builder(name: impl Into<String>) -> CodeUnitBuilder {
        CodeUnitBuilder::new(name)
    }

    /// Length of the code in bytes
    #[inline]
    pub fn code_len(&self) -> u32 {
        self.instructions.len() as u32 * INSTRUCTION_SIZE
    }

    /// Number of local variables (at least the parameters)
    pub fn local_count(&self) -> usize {
        self.var_names.len().max(self.arg_count as usize)
    }

    /// Instruction starting at `offset`
    pub fn instruction_at(&self, offset: u32) -> Option<&Instruction> {
        self.index_of(offset).map(|idx| &self.instructions[idx])
    }

    /// Index of the instruction starting at `offset`
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        if offset % INSTRUCTION_SIZE != 0 {
            return None;
        }
        let idx = (offset / INSTRUCTION_SIZE) as usize;
        self.instructions
            .get(idx)
            .filter(|i| i.offset == offset)
            .map(|_| idx)
    }

    /// Display name of a local
    pub fn local_name(&self, idx: LocalIndex) -> String {
        self.var_names
            .get(idx.index() as usize)
            .cloned()
            .unwrap_or_else(|| format!("${}", idx.index()))
    }
}

impl fmt::Display for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Disassembly of {} ({}:{}, {} args):",
            self.name, self.filename, self.first_line, self.arg_count
        )?;
        for instr in &self.instructions {
            match instr.line {
                Some(line) => write!(f, "{line:>4}")?,
                None => f.write_str("    ")?,
            }
            write!(f, "{instr}")?;
            if let Operand::Local(idx) = instr.operand {
                write!(f, " ({})", self.local_name(idx))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Builder for creating code units
///
/// Offsets are assigned in insertion order.
#[derive(Debug, Default)]
pub struct CodeUnitBuilder {
    name: String,
    filename: String,
    first_line: u32,
    arg_count: u16,
    var_names: Vec<String>,
    instructions: Vec<Instruction>,
    pending_line: Option<u32>,
}

impl CodeUnitBuilder {
    /// Create a new builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: "<input>".to_string(),
            first_line: 1,
            ..Self::default()
        }
    }

    /// Set source file name
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Set first source line
    pub fn first_line(mut self, line: u32) -> Self {
        self.first_line = line;
        self
    }

    /// Set parameter count
    pub fn arg_count(mut self, count: u16) -> Self {
        self.arg_count = count;
        self
    }

    /// Add a local variable name
    pub fn var(mut self, name: impl Into<String>) -> Self {
        self.var_names.push(name.into());
        self
    }

    /// Mark the next instruction as the start of a source line
    pub fn line(mut self, line: u32) -> Self {
        self.pending_line = Some(line);
        self
    }

    /// Append an instruction without an operand
    pub fn op(self, opcode: Opcode) -> Self {
        self.instruction(opcode, Operand::None)
    }

    /// Append an instruction
    pub fn instruction(mut self, opcode: Opcode, operand: Operand) -> Self {
        self.push(opcode, operand);
        self
    }

    /// Append an instruction in place, returning its offset
    pub fn push(&mut self, opcode: Opcode, operand: Operand) -> u32 {
        let offset = self.next_offset();
        let mut instr = Instruction::new(offset, opcode, operand);
        instr.line = self.pending_line.take();
        self.instructions.push(instr);
        offset
    }

    /// Offset the next instruction will receive
    pub fn next_offset(&self) -> u32 {
        self.instructions.len() as u32 * INSTRUCTION_SIZE
    }

    /// Replace the operand of an already pushed instruction
    pub fn patch(&mut self, offset: u32, operand: Operand) {
        if let Some(instr) = self
            .instructions
            .get_mut((offset / INSTRUCTION_SIZE) as usize)
        {
            instr.operand = operand;
        }
    }

    /// Add a local variable name in place
    pub fn push_var(&mut self, name: impl Into<String>) {
        self.var_names.push(name.into());
    }

    /// Set parameter count in place
    pub fn set_arg_count(&mut self, count: u16) {
        self.arg_count = count;
    }

    /// Build the code unit
    pub fn build(self) -> CodeUnit {
        CodeUnit {
            name: self.name,
            filename: self.filename,
            first_line: self.first_line,
            arg_count: self.arg_count,
            var_names: self.var_names,
            instructions: self.instructions,
        }
    }
}
