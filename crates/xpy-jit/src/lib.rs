//! # xpy JIT
//!
//! Ahead-of-time compiler from xpy stack bytecode to native code.
//!
//! A code unit goes through three stages:
//!
//! 1. [`cfg`] partitions the instruction stream into basic blocks.
//! 2. [`translator`] walks the instructions with a simulated operand stack
//!    and emits Cranelift IR into those blocks.
//! 3. [`compiler`] hands the finished function to the Cranelift JIT module
//!    and exposes the native entry point.
//!
//! Value representation and per-type operations live in [`types`] and
//! [`value`]; top-level names are resolved by [`namespace`].

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cfg;
pub mod compiler;
pub mod config;
pub mod error;
pub mod helpers;
pub mod host;
pub mod namespace;
pub mod translator;
pub mod types;
pub mod value;

pub use compiler::{BlockSummary, CompiledFunction, JitCompiler, TerminatorKind};
pub use config::{JitConfig, OptLevel};
pub use error::{JitError, Result};
pub use host::{HostBuffer, RawBuffer};
pub use types::{Type, TypeId, TypeRegistry};
