//! The Flow virtual machine.
//!
//! # Data Flow
//! ```text
//! bytecode image ──▶ bytecode.rs (load + validate)
//!     or ProgramBuilder (assemble + validate)
//!         ──▶ Program (immutable, Arc-shared)
//!             ──▶ Handler (named entry point)
//!                 ──▶ Runner (registers + string arena, one execution)
//!                     ──▶ natives (host callbacks via CALL/HANDLER)
//! ```
//!
//! # Design Decisions
//! - Programs are immutable after build; sharing is `Arc`, never locks
//! - Runners are exclusively owned; `run(&mut self)` makes concurrent
//!   reentry unrepresentable
//! - Match tables hold instruction offsets, not references into the code

pub mod bytecode;
pub mod instruction;
pub mod matcher;
pub mod natives;
pub mod program;
pub mod runner;
pub mod value;

use thiserror::Error;

pub use instruction::{Instruction, Opcode};
pub use matcher::{MatchCase, MatchKind, MatchPattern, MatchTable};
pub use natives::{NativeEntry, NativeFn, NativeRegistry, Params};
pub use program::{Handler, Program, ProgramBuilder, ProgramError};
pub use runner::Runner;
pub use value::{Cidr, FlowNumber, Slot, StrRef, StringArena};

/// Execution faults. Any of these terminates the run with result `false`
/// and is left on the runner for the host to inspect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("division by zero at pc {pc}")]
    DivisionByZero { pc: usize },

    #[error("branch target out of range at pc {pc}")]
    BadBranch { pc: usize },

    #[error("constant index {index} out of range at pc {pc}")]
    BadConstantIndex { pc: usize, index: usize },

    #[error("unknown native id {id} at pc {pc}")]
    UnknownNative { pc: usize, id: usize },

    #[error("instruction budget exhausted")]
    StackExhausted,
}
