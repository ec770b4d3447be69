//! Compiled Flow programs: instructions, constant pools, match tables,
//! native tables and handler entry points.
//!
//! A `Program` is immutable once built and shared via `Arc` across any
//! number of runners and threads. Construction goes through
//! [`ProgramBuilder`], which validates the whole artifact: every branch and
//! match target must land on a real instruction, every pool index must be
//! in range, and every register index must fit the declared register count
//! of each handler that can reach it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::vm::instruction::{
    self, Instruction, Opcode, operand_a, operand_b, operand_c, raw_opcode,
};
use crate::vm::matcher::{MatchCase, MatchKind, MatchPattern, MatchTable};
use crate::vm::natives::{NativeEntry, NativeRegistry};
use crate::vm::runner::Runner;
use crate::vm::value::Cidr;

/// Structural defects detected while building or loading a program.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("branch target {target} out of range at pc {pc}")]
    BadBranch { pc: usize, target: usize },

    #[error("constant index {index} out of range at pc {pc}")]
    BadConstantIndex { pc: usize, index: usize },

    #[error("register r{register} out of range at pc {pc}: handler '{handler}' declares {count}")]
    BadRegister {
        pc: usize,
        register: usize,
        handler: String,
        count: usize,
    },

    #[error("native id {index} out of range at pc {pc}")]
    BadNativeIndex { pc: usize, index: usize },

    #[error("unknown native '{0}'")]
    UnknownNative(String),

    #[error("unsupported opcode {op} at pc {pc}")]
    UnsupportedOpcode { pc: usize, op: String },

    #[error("invalid regex '{pattern}': {error}")]
    BadRegex { pattern: String, error: String },

    #[error("duplicate handler '{0}'")]
    DuplicateHandler(String),

    #[error("handler '{name}' entry {entry} out of range")]
    BadHandlerEntry { name: String, entry: usize },
}

/// The constant pools of a program.
#[derive(Debug, Default)]
pub struct ConstantPool {
    pub(crate) integers: Vec<i64>,
    pub(crate) strings: Vec<String>,
    pub(crate) ipaddrs: Vec<IpAddr>,
    pub(crate) cidrs: Vec<Cidr>,
    pub(crate) regexes: Vec<Regex>,
    pub(crate) int_arrays: Vec<Vec<i64>>,
    pub(crate) string_arrays: Vec<Vec<String>>,
    pub(crate) ip_arrays: Vec<Vec<IpAddr>>,
    pub(crate) cidr_arrays: Vec<Vec<Cidr>>,
}

impl ConstantPool {
    pub fn integer(&self, index: u32) -> Option<i64> {
        self.integers.get(index as usize).copied()
    }

    pub fn string(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    pub fn ipaddr(&self, index: u32) -> Option<IpAddr> {
        self.ipaddrs.get(index as usize).copied()
    }

    pub fn cidr(&self, index: u32) -> Option<Cidr> {
        self.cidrs.get(index as usize).copied()
    }

    pub fn regex(&self, index: u32) -> Option<&Regex> {
        self.regexes.get(index as usize)
    }

    pub fn int_array(&self, index: u32) -> Option<&[i64]> {
        self.int_arrays.get(index as usize).map(Vec::as_slice)
    }

    pub fn string_array(&self, index: u32) -> Option<&[String]> {
        self.string_arrays.get(index as usize).map(Vec::as_slice)
    }

    pub fn ip_array(&self, index: u32) -> Option<&[IpAddr]> {
        self.ip_arrays.get(index as usize).map(Vec::as_slice)
    }

    pub fn cidr_array(&self, index: u32) -> Option<&[Cidr]> {
        self.cidr_arrays.get(index as usize).map(Vec::as_slice)
    }
}

/// One named entry point into the program.
#[derive(Debug, Clone)]
pub struct HandlerDef {
    pub name: String,
    pub entry: usize,
    pub register_count: usize,
}

pub struct Program {
    code: Vec<Instruction>,
    constants: ConstantPool,
    matches: Vec<MatchTable>,
    functions: Vec<NativeEntry>,
    native_handlers: Vec<NativeEntry>,
    handlers: Vec<HandlerDef>,
}

impl Program {
    /// Assemble a program from already-decoded parts, running the same
    /// validation as the builder. Used by the bytecode loader, where pool
    /// indices must be preserved exactly as persisted.
    pub(crate) fn from_parts(
        code: Vec<Instruction>,
        constants: ConstantPool,
        matches: Vec<MatchTable>,
        functions: Vec<NativeEntry>,
        native_handlers: Vec<NativeEntry>,
        handlers: Vec<HandlerDef>,
    ) -> Result<Arc<Program>, ProgramError> {
        let mut seen = HashMap::new();
        for handler in &handlers {
            if seen.insert(handler.name.clone(), ()).is_some() {
                return Err(ProgramError::DuplicateHandler(handler.name.clone()));
            }
        }
        let program = Program {
            code,
            constants,
            matches,
            functions,
            native_handlers,
            handlers,
        };
        validate(&program)?;
        Ok(Arc::new(program))
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    pub fn constants(&self) -> &ConstantPool {
        &self.constants
    }

    pub fn match_table(&self, index: u32) -> Option<&MatchTable> {
        self.matches.get(index as usize)
    }

    pub fn match_tables(&self) -> &[MatchTable] {
        &self.matches
    }

    pub fn native_function(&self, index: usize) -> Option<&NativeEntry> {
        self.functions.get(index)
    }

    pub fn native_functions(&self) -> &[NativeEntry] {
        &self.functions
    }

    pub fn native_handler(&self, index: usize) -> Option<&NativeEntry> {
        self.native_handlers.get(index)
    }

    pub fn native_handlers(&self) -> &[NativeEntry] {
        &self.native_handlers
    }

    pub fn handler_defs(&self) -> &[HandlerDef] {
        &self.handlers
    }

    /// Look up a named handler, yielding a cheap handle that can mint
    /// runners.
    pub fn handler(self: &Arc<Self>, name: &str) -> Option<Handler> {
        let index = self.handlers.iter().position(|h| h.name == name)?;
        Some(Handler {
            program: Arc::clone(self),
            index,
        })
    }

    /// Full program listing for diagnostics.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (pc, insn) in self.code.iter().enumerate() {
            out.push_str(&format!("{pc:6}  {}\n", instruction::disassemble(*insn)));
        }
        out
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("instructions", &self.code.len())
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// A named entry point bound to its program.
#[derive(Clone)]
pub struct Handler {
    program: Arc<Program>,
    index: usize,
}

impl Handler {
    pub fn name(&self) -> &str {
        &self.program.handlers[self.index].name
    }

    pub fn entry(&self) -> usize {
        self.program.handlers[self.index].entry
    }

    pub fn register_count(&self) -> usize {
        self.program.handlers[self.index].register_count
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn create_runner(&self) -> Runner {
        Runner::new(Arc::clone(&self.program), self.index)
    }
}

/// Assembles and validates a [`Program`].
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    code: Vec<Instruction>,
    integers: Vec<i64>,
    strings: Vec<String>,
    ipaddrs: Vec<IpAddr>,
    cidrs: Vec<Cidr>,
    regex_patterns: Vec<String>,
    int_arrays: Vec<Vec<i64>>,
    string_arrays: Vec<Vec<String>>,
    ip_arrays: Vec<Vec<IpAddr>>,
    cidr_arrays: Vec<Vec<Cidr>>,
    matches: Vec<(MatchKind, usize, Vec<MatchCase>)>,
    functions: Vec<(String, String)>,
    native_handlers: Vec<(String, String)>,
    handlers: Vec<HandlerDef>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an instruction, returning its offset.
    pub fn emit(&mut self, op: Opcode, a: u16, b: u16, c: u16) -> usize {
        self.code.push(instruction::encode(op, a, b, c));
        self.code.len() - 1
    }

    /// Rewrite a previously emitted instruction (forward branches).
    pub fn patch(&mut self, pc: usize, op: Opcode, a: u16, b: u16, c: u16) {
        self.code[pc] = instruction::encode(op, a, b, c);
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn add_integer(&mut self, value: i64) -> u16 {
        intern(&mut self.integers, value)
    }

    pub fn add_string(&mut self, value: &str) -> u16 {
        match self.strings.iter().position(|s| s == value) {
            Some(i) => i as u16,
            None => {
                self.strings.push(value.to_string());
                (self.strings.len() - 1) as u16
            }
        }
    }

    pub fn add_ipaddr(&mut self, value: IpAddr) -> u16 {
        intern(&mut self.ipaddrs, value)
    }

    pub fn add_cidr(&mut self, value: Cidr) -> u16 {
        intern(&mut self.cidrs, value)
    }

    pub fn add_regex(&mut self, pattern: &str) -> u16 {
        match self.regex_patterns.iter().position(|p| p == pattern) {
            Some(i) => i as u16,
            None => {
                self.regex_patterns.push(pattern.to_string());
                (self.regex_patterns.len() - 1) as u16
            }
        }
    }

    pub fn add_int_array(&mut self, values: Vec<i64>) -> u16 {
        self.int_arrays.push(values);
        (self.int_arrays.len() - 1) as u16
    }

    pub fn add_string_array(&mut self, values: Vec<String>) -> u16 {
        self.string_arrays.push(values);
        (self.string_arrays.len() - 1) as u16
    }

    pub fn add_ip_array(&mut self, values: Vec<IpAddr>) -> u16 {
        self.ip_arrays.push(values);
        (self.ip_arrays.len() - 1) as u16
    }

    pub fn add_cidr_array(&mut self, values: Vec<Cidr>) -> u16 {
        self.cidr_arrays.push(values);
        (self.cidr_arrays.len() - 1) as u16
    }

    pub fn add_match_table(
        &mut self,
        kind: MatchKind,
        default_target: usize,
        cases: Vec<MatchCase>,
    ) -> u16 {
        self.matches.push((kind, default_target, cases));
        (self.matches.len() - 1) as u16
    }

    pub fn add_native_function(&mut self, name: &str, signature: &str) -> u16 {
        add_native_ref(&mut self.functions, name, signature)
    }

    pub fn add_native_handler(&mut self, name: &str, signature: &str) -> u16 {
        add_native_ref(&mut self.native_handlers, name, signature)
    }

    /// Declare a handler whose entry point is the current pc.
    pub fn add_handler(&mut self, name: &str, register_count: usize) {
        let entry = self.code.len();
        self.handlers.push(HandlerDef {
            name: name.to_string(),
            entry,
            register_count,
        });
    }

    pub fn add_handler_at(&mut self, name: &str, entry: usize, register_count: usize) {
        self.handlers.push(HandlerDef {
            name: name.to_string(),
            entry,
            register_count,
        });
    }

    /// Resolve natives against `registry`, compile regexes, build match
    /// indices and validate the whole artifact.
    pub fn build(self, registry: &NativeRegistry) -> Result<Arc<Program>, ProgramError> {
        let mut regexes = Vec::with_capacity(self.regex_patterns.len());
        for pattern in &self.regex_patterns {
            let re = Regex::new(pattern).map_err(|e| ProgramError::BadRegex {
                pattern: pattern.clone(),
                error: e.to_string(),
            })?;
            regexes.push(re);
        }

        let mut seen = HashMap::new();
        for handler in &self.handlers {
            if seen.insert(handler.name.clone(), ()).is_some() {
                return Err(ProgramError::DuplicateHandler(handler.name.clone()));
            }
        }

        let functions = self
            .functions
            .iter()
            .map(|(name, sig)| {
                registry
                    .function(name)
                    .map(|cb| NativeEntry::new(name, sig, cb))
                    .ok_or_else(|| ProgramError::UnknownNative(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let native_handlers = self
            .native_handlers
            .iter()
            .map(|(name, sig)| {
                registry
                    .handler(name)
                    .map(|cb| NativeEntry::new(name, sig, cb))
                    .ok_or_else(|| ProgramError::UnknownNative(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let matches = self
            .matches
            .into_iter()
            .map(|(kind, default, cases)| MatchTable::build(kind, default, cases))
            .collect();

        let program = Program {
            code: self.code,
            constants: ConstantPool {
                integers: self.integers,
                strings: self.strings,
                ipaddrs: self.ipaddrs,
                cidrs: self.cidrs,
                regexes,
                int_arrays: self.int_arrays,
                string_arrays: self.string_arrays,
                ip_arrays: self.ip_arrays,
                cidr_arrays: self.cidr_arrays,
            },
            matches,
            functions,
            native_handlers,
            handlers: self.handlers,
        };

        validate(&program)?;
        Ok(Arc::new(program))
    }
}

fn intern<T: PartialEq + Copy>(pool: &mut Vec<T>, value: T) -> u16 {
    match pool.iter().position(|v| *v == value) {
        Some(i) => i as u16,
        None => {
            pool.push(value);
            (pool.len() - 1) as u16
        }
    }
}

fn add_native_ref(refs: &mut Vec<(String, String)>, name: &str, signature: &str) -> u16 {
    match refs.iter().position(|(n, _)| n == name) {
        Some(i) => i as u16,
        None => {
            refs.push((name.to_string(), signature.to_string()));
            (refs.len() - 1) as u16
        }
    }
}

/// Walk every handler's reachable code and check all structural invariants.
pub(crate) fn validate(program: &Program) -> Result<(), ProgramError> {
    for handler in &program.handlers {
        if handler.entry >= program.code.len() {
            return Err(ProgramError::BadHandlerEntry {
                name: handler.name.clone(),
                entry: handler.entry,
            });
        }
        validate_handler(program, handler)?;
    }
    Ok(())
}

fn validate_handler(program: &Program, handler: &HandlerDef) -> Result<(), ProgramError> {
    let code = &program.code;
    let nregs = handler.register_count;
    let mut visited = vec![false; code.len()];
    let mut work = vec![handler.entry];

    let check_reg = |pc: usize, r: usize| -> Result<(), ProgramError> {
        if r >= nregs {
            return Err(ProgramError::BadRegister {
                pc,
                register: r,
                handler: handler.name.clone(),
                count: nregs,
            });
        }
        Ok(())
    };
    let check_target = |pc: usize, target: usize| -> Result<(), ProgramError> {
        if target >= code.len() {
            return Err(ProgramError::BadBranch { pc, target });
        }
        Ok(())
    };

    while let Some(pc) = work.pop() {
        if visited[pc] {
            continue;
        }
        visited[pc] = true;

        let insn = code[pc];
        let op = Opcode::from_u16(raw_opcode(insn)).ok_or(ProgramError::UnsupportedOpcode {
            pc,
            op: format!("{:#06x}", raw_opcode(insn)),
        })?;
        let a = operand_a(insn) as usize;
        let b = operand_b(insn) as usize;
        let c = operand_c(insn) as usize;

        let pool = &program.constants;
        let mut fallthrough = true;

        match op {
            Opcode::Nop | Opcode::NTicks => {
                if op == Opcode::NTicks {
                    check_reg(pc, a)?;
                }
            }
            Opcode::Exit => fallthrough = false,
            Opcode::Jmp => {
                check_target(pc, a)?;
                work.push(a);
                fallthrough = false;
            }
            Opcode::Jn | Opcode::Jz => {
                check_reg(pc, a)?;
                check_target(pc, b)?;
                work.push(b);
            }
            Opcode::NDumpN => {
                if b > 0 {
                    check_reg(pc, a)?;
                    check_reg(pc, a + b - 1)?;
                }
            }
            Opcode::Mov => {
                check_reg(pc, a)?;
                check_reg(pc, b)?;
            }
            Opcode::IMov => check_reg(pc, a)?,
            Opcode::ITConst => {
                check_reg(pc, a)?;
                check_pool(pc, b, pool.int_arrays.len())?;
            }
            Opcode::STConst => {
                check_reg(pc, a)?;
                check_pool(pc, b, pool.string_arrays.len())?;
            }
            Opcode::PTConst => {
                check_reg(pc, a)?;
                check_pool(pc, b, pool.ip_arrays.len())?;
            }
            Opcode::CTConst => {
                check_reg(pc, a)?;
                check_pool(pc, b, pool.cidr_arrays.len())?;
            }
            Opcode::NConst => {
                check_reg(pc, a)?;
                check_pool(pc, b, pool.integers.len())?;
            }
            Opcode::SConst => {
                check_reg(pc, a)?;
                check_pool(pc, b, pool.strings.len())?;
            }
            Opcode::PConst => {
                check_reg(pc, a)?;
                check_pool(pc, b, pool.ipaddrs.len())?;
            }
            Opcode::CConst => {
                check_reg(pc, a)?;
                check_pool(pc, b, pool.cidrs.len())?;
            }
            Opcode::NNeg | Opcode::BNot | Opcode::NCmpZ | Opcode::SLen | Opcode::SIsEmpty
            | Opcode::I2S | Opcode::P2S | Opcode::C2S | Opcode::R2S | Opcode::S2I
            | Opcode::SUrlEnc | Opcode::SUrlDec | Opcode::PCmpEq | Opcode::PCmpNe => {
                check_reg(pc, a)?;
                check_reg(pc, b)?;
                if matches!(op, Opcode::PCmpEq | Opcode::PCmpNe) {
                    check_reg(pc, c)?;
                }
            }
            Opcode::NAdd | Opcode::NSub | Opcode::NMul | Opcode::NDiv | Opcode::NRem
            | Opcode::NShl | Opcode::NShr | Opcode::NPow | Opcode::NAnd | Opcode::NOr
            | Opcode::NXor | Opcode::NCmpEq | Opcode::NCmpNe | Opcode::NCmpLe
            | Opcode::NCmpGe | Opcode::NCmpLt | Opcode::NCmpGt | Opcode::BAnd
            | Opcode::BOr | Opcode::BXor | Opcode::SAdd | Opcode::SCmpEq | Opcode::SCmpNe
            | Opcode::SCmpLe | Opcode::SCmpGe | Opcode::SCmpLt | Opcode::SCmpGt
            | Opcode::SCmpBeg | Opcode::SCmpEnd | Opcode::SContains | Opcode::PInCidr => {
                check_reg(pc, a)?;
                check_reg(pc, b)?;
                check_reg(pc, c)?;
            }
            Opcode::NIAdd | Opcode::NISub | Opcode::NIMul | Opcode::NIDiv | Opcode::NIRem
            | Opcode::NIShl | Opcode::NIShr | Opcode::NIPow | Opcode::NIAnd | Opcode::NIOr
            | Opcode::NIXor | Opcode::NICmpEq | Opcode::NICmpNe | Opcode::NICmpLe
            | Opcode::NICmpGe | Opcode::NICmpLt | Opcode::NICmpGt => {
                check_reg(pc, a)?;
                check_reg(pc, b)?;
            }
            Opcode::SSubStr => {
                check_reg(pc, a)?;
                check_reg(pc, b)?;
                check_reg(pc, c)?;
                check_reg(pc, c + 1)?;
            }
            Opcode::SAddMulti => {
                // Reserved in the numbering; semantics unconfirmed.
                return Err(ProgramError::UnsupportedOpcode {
                    pc,
                    op: "SADDMULTI".into(),
                });
            }
            Opcode::SPrint => check_reg(pc, a)?,
            Opcode::SMatchEq | Opcode::SMatchBeg | Opcode::SMatchEnd | Opcode::SMatchR => {
                check_reg(pc, a)?;
                let table = program
                    .match_table(b as u32)
                    .ok_or(ProgramError::BadConstantIndex { pc, index: b })?;
                check_target(pc, table.default_target())?;
                work.push(table.default_target());
                for case in table.cases() {
                    check_target(pc, case.target)?;
                    work.push(case.target);
                    if let MatchPattern::Regex(idx) = case.pattern {
                        check_pool(pc, idx as usize, pool.regexes.len())?;
                    }
                }
                fallthrough = false;
            }
            Opcode::SRegMatch => {
                check_reg(pc, a)?;
                check_reg(pc, b)?;
                check_pool(pc, c, pool.regexes.len())?;
            }
            Opcode::SRegGroup => {
                check_reg(pc, a)?;
                check_reg(pc, b)?;
            }
            Opcode::Call => {
                if a >= program.functions.len() {
                    return Err(ProgramError::BadNativeIndex { pc, index: a });
                }
                check_reg(pc, c)?;
                check_reg(pc, c + b)?;
            }
            Opcode::Handler => {
                if a >= program.native_handlers.len() {
                    return Err(ProgramError::BadNativeIndex { pc, index: a });
                }
                check_reg(pc, c)?;
                check_reg(pc, c + b)?;
            }
        }

        if fallthrough {
            let next = pc + 1;
            check_target(pc, next)?;
            work.push(next);
        }
    }

    Ok(())
}

fn check_pool(pc: usize, index: usize, len: usize) -> Result<(), ProgramError> {
    if index >= len {
        return Err(ProgramError::BadConstantIndex { pc, index });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_branch_past_end() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 1);
        b.emit(Opcode::Jmp, 99, 0, 0);
        let err = b.build(&NativeRegistry::new()).unwrap_err();
        assert!(matches!(err, ProgramError::BadBranch { pc: 0, target: 99 }));
    }

    #[test]
    fn rejects_missing_exit_fallthrough() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 1);
        b.emit(Opcode::Nop, 0, 0, 0);
        // falls off the end of the code
        let err = b.build(&NativeRegistry::new()).unwrap_err();
        assert!(matches!(err, ProgramError::BadBranch { .. }));
    }

    #[test]
    fn rejects_register_out_of_range() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 2);
        let idx = b.add_integer(5);
        b.emit(Opcode::NConst, 4, idx, 0);
        b.emit(Opcode::Exit, 1, 0, 0);
        let err = b.build(&NativeRegistry::new()).unwrap_err();
        assert!(matches!(err, ProgramError::BadRegister { register: 4, .. }));
    }

    #[test]
    fn rejects_saddmulti() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 4);
        b.emit(Opcode::SAddMulti, 0, 1, 2);
        b.emit(Opcode::Exit, 1, 0, 0);
        let err = b.build(&NativeRegistry::new()).unwrap_err();
        assert!(matches!(err, ProgramError::UnsupportedOpcode { .. }));
    }

    #[test]
    fn rejects_unknown_native() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 2);
        let id = b.add_native_function("no.such.native", "I");
        b.emit(Opcode::Call, id, 0, 0);
        b.emit(Opcode::Exit, 1, 0, 0);
        let err = b.build(&NativeRegistry::new()).unwrap_err();
        assert!(matches!(err, ProgramError::UnknownNative(_)));
    }

    #[test]
    fn constants_are_interned() {
        let mut b = ProgramBuilder::new();
        assert_eq!(b.add_integer(42), b.add_integer(42));
        assert_eq!(b.add_string("x"), b.add_string("x"));
        assert_ne!(b.add_string("x"), b.add_string("y"));
    }

    #[test]
    fn handler_lookup() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 1);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&NativeRegistry::new()).unwrap();
        assert!(program.handler("main").is_some());
        assert!(program.handler("missing").is_none());
        assert_eq!(program.handler("main").unwrap().register_count(), 1);
    }
}
