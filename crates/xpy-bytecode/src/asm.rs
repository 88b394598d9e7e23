//! Text assembler for code units
//!
//! One instruction per line:
//!
//! ```text
//! # count down from n
//! .args n
//!     SETUP_LOOP done
//! top:
//!     LOAD_FAST n
//!     LOAD_CONST 0
//!     COMPARE_OP >
//!     POP_JUMP_IF_FALSE exit
//!     LOAD_FAST n
//!     LOAD_CONST 1
//!     INPLACE_SUBTRACT
//!     STORE_FAST n
//!     JUMP_ABSOLUTE top
//! exit:
//!     POP_BLOCK
//! done:
//!     LOAD_FAST n
//!     RETURN_VALUE
//! ```
//!
//! Directives: `.args a b` names the parameters, `.locals x y` names extra
//! locals, `.line N` marks the next instruction as starting source line `N`,
//! `.file name` sets the file name. Locals may be referenced by name or index;
//! unknown names become new locals. Jump operands may be labels or numbers
//! (absolute offsets for `JUMP_ABSOLUTE`/`POP_JUMP_IF_*`, deltas for
//! `JUMP_FORWARD`/`SETUP_LOOP`/`FOR_ITER`).

use rustc_hash::FxHashMap;

use crate::INSTRUCTION_SIZE;
use crate::code::{CodeUnit, CodeUnitBuilder};
use crate::constant::Constant;
use crate::error::{BytecodeError, Result};
use crate::instruction::{Opcode, Operand, OperandKind};
use crate::operand::LocalIndex;

/// A source line with comments stripped and its label split off
struct Line<'a> {
    number: usize,
    label: Option<&'a str>,
    body: &'a str,
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

fn split_label(line: &str) -> (Option<&str>, &str) {
    let trimmed = line.trim();
    if let Some((head, rest)) = trimmed.split_once(':') {
        let head = head.trim();
        let is_label = !head.is_empty()
            && !head.starts_with('.')
            && head.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if is_label {
            return (Some(head), rest.trim());
        }
    }
    (None, trimmed)
}

fn lines(source: &str) -> impl Iterator<Item = Line<'_>> {
    source.lines().enumerate().map(|(i, raw)| {
        let (label, body) = split_label(strip_comment(raw));
        Line {
            number: i + 1,
            label,
            body,
        }
    })
}

/// Assemble `source` into a code unit named `name`
pub fn assemble(name: &str, source: &str) -> Result<CodeUnit> {
    // Pass 1: label offsets
    let mut labels = FxHashMap::default();
    let mut offset = 0u32;
    for line in lines(source) {
        if let Some(label) = line.label {
            if labels.insert(label.to_string(), offset).is_some() {
                return Err(BytecodeError::DuplicateLabel(label.to_string()));
            }
        }
        if !line.body.is_empty() && !line.body.starts_with('.') {
            offset += INSTRUCTION_SIZE;
        }
    }

    // Pass 2: instructions
    let mut asm = Assembler {
        builder: CodeUnitBuilder::new(name),
        locals: FxHashMap::default(),
        labels,
    };
    for line in lines(source) {
        if line.body.is_empty() {
            continue;
        }
        if let Some(directive) = line.body.strip_prefix('.') {
            asm.directive(directive, line.number)?;
        } else {
            asm.instruction(line.body, line.number)?;
        }
    }
    Ok(asm.builder.build())
}

struct Assembler {
    builder: CodeUnitBuilder,
    locals: FxHashMap<String, u16>,
    labels: FxHashMap<String, u32>,
}

impl Assembler {
    fn directive(&mut self, directive: &str, line: usize) -> Result<()> {
        let (name, rest) = directive
            .split_once(char::is_whitespace)
            .unwrap_or((directive, ""));
        let invalid = |message: String| BytecodeError::InvalidOperand {
            opcode: format!(".{name}"),
            line,
            message,
        };
        match name {
            "args" => {
                for arg in rest.split_whitespace() {
                    self.local(arg);
                }
                let count = self.locals.len() as u16;
                self.builder.set_arg_count(count);
            }
            "locals" => {
                for local in rest.split_whitespace() {
                    self.local(local);
                }
            }
            "line" => {
                let n = rest
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("expected a line number, got {rest:?}")))?;
                let builder = std::mem::take(&mut self.builder);
                self.builder = builder.line(n);
            }
            "file" => {
                let builder = std::mem::take(&mut self.builder);
                self.builder = builder.filename(rest.trim());
            }
            other => return Err(invalid(format!("unknown directive .{other}"))),
        }
        Ok(())
    }

    fn local(&mut self, name: &str) -> LocalIndex {
        if let Some(&idx) = self.locals.get(name) {
            return LocalIndex(idx);
        }
        let idx = self.locals.len() as u16;
        self.locals.insert(name.to_string(), idx);
        self.builder.push_var(name);
        LocalIndex(idx)
    }

    fn instruction(&mut self, body: &str, line: usize) -> Result<()> {
        let (mnemonic, arg) = body
            .split_once(char::is_whitespace)
            .map(|(m, a)| (m, a.trim()))
            .unwrap_or((body, ""));
        let opcode: Opcode = mnemonic.parse()?;
        let offset = self.builder.next_offset();
        let invalid = |message: String| BytecodeError::InvalidOperand {
            opcode: opcode.name().to_string(),
            line,
            message,
        };

        let kind = opcode.operand_kind();
        if kind == OperandKind::None {
            if !arg.is_empty() {
                return Err(invalid(format!("unexpected operand {arg:?}")));
            }
            self.builder.push(opcode, Operand::None);
            return Ok(());
        }
        if arg.is_empty() {
            return Err(invalid("missing operand".to_string()));
        }

        let operand = match kind {
            OperandKind::None => Operand::None,
            OperandKind::Const => Operand::Const(parse_constant(arg).map_err(invalid)?),
            OperandKind::Local => match arg.parse::<u16>() {
                Ok(idx) => Operand::Local(LocalIndex(idx)),
                Err(_) => Operand::Local(self.local(arg)),
            },
            OperandKind::Name => Operand::Name(arg.to_string()),
            OperandKind::Count => Operand::Count(
                arg.parse()
                    .map_err(|_| invalid(format!("expected a count, got {arg:?}")))?,
            ),
            OperandKind::Absolute => Operand::Target(self.target(arg).map_err(|e| match e {
                Some(e) => e,
                None => invalid(format!("expected a label or offset, got {arg:?}")),
            })?),
            OperandKind::Relative => {
                let delta = match arg.parse::<u32>() {
                    Ok(delta) => delta,
                    Err(_) => {
                        let target = self.target(arg).map_err(|e| match e {
                            Some(e) => e,
                            None => invalid(format!("expected a label or delta, got {arg:?}")),
                        })?;
                        target
                            .checked_sub(offset)
                            .ok_or(BytecodeError::BackwardDelta { offset, target })?
                    }
                };
                Operand::Delta(delta)
            }
            OperandKind::Compare => Operand::Compare(arg.parse()?),
        };
        self.builder.push(opcode, operand);
        Ok(())
    }

    /// Resolve a label or a numeric offset. `Err(None)` means malformed.
    fn target(&self, arg: &str) -> std::result::Result<u32, Option<BytecodeError>> {
        if let Ok(offset) = arg.parse::<u32>() {
            return Ok(offset);
        }
        if !arg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(None);
        }
        self.labels
            .get(arg)
            .copied()
            .ok_or_else(|| Some(BytecodeError::UndefinedLabel(arg.to_string())))
    }
}

/// Parse a constant literal: integers, strings, `None` and tuples
fn parse_constant(text: &str) -> std::result::Result<Constant, String> {
    let mut parser = ConstParser {
        chars: text.chars().collect(),
        pos: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(format!("trailing input in constant {text:?}"));
    }
    Ok(value)
}

struct ConstParser {
    chars: Vec<char>,
    pos: usize,
}

impl ConstParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> std::result::Result<Constant, String> {
        self.skip_ws();
        match self.peek() {
            Some('"') => self.string(),
            Some('(') => self.tuple(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.int(),
            Some(_) => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
                    self.pos += 1;
                }
                let word: String = self.chars[start..self.pos].iter().collect();
                match word.as_str() {
                    "None" => Ok(Constant::None),
                    "" => Err(format!("unexpected character {:?}", self.chars[start])),
                    other => Err(format!("unknown literal {other:?}")),
                }
            }
            None => Err("expected a constant".to_string()),
        }
    }

    fn int(&mut self) -> std::result::Result<Constant, String> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().filter(|c| **c != '_').collect();
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.as_str()),
        };
        let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            Some(hex) => i128::from_str_radix(hex, 16),
            None => digits.parse::<i128>(),
        }
        .map_err(|_| format!("invalid integer literal {text:?}"))?;
        Ok(Constant::Int(if negative { -magnitude } else { magnitude }))
    }

    fn string(&mut self) -> std::result::Result<Constant, String> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let c = self.peek().ok_or("unterminated string literal")?;
            self.pos += 1;
            match c {
                '"' => return Ok(Constant::Str(out)),
                '\\' => {
                    let esc = self.peek().ok_or("unterminated escape")?;
                    self.pos += 1;
                    out.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        '0' => '\0',
                        '\\' => '\\',
                        '"' => '"',
                        other => return Err(format!("unknown escape \\{other}")),
                    });
                }
                c => out.push(c),
            }
        }
    }

    fn tuple(&mut self) -> std::result::Result<Constant, String> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(')') {
                self.pos += 1;
                return Ok(Constant::Tuple(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(')') => {}
                _ => return Err("expected ',' or ')' in tuple".to_string()),
            }
        }
    }
}
