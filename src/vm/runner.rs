//! The Flow interpreter.
//!
//! One `Runner` is one execution of a handler: a register file sized to the
//! handler's declaration, a string arena for every string the run produces,
//! and an opaque user-data slot the host's natives can reach. The dispatch
//! loop is a single `match` over the opcode — constant-cost per instruction
//! and allocation-free except for the ops that genuinely produce strings.

use std::any::Any;
use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::vm::instruction::{operand_a, operand_b, operand_c, raw_opcode, Opcode};
use crate::vm::natives::Params;
use crate::vm::program::Program;
use crate::vm::value::{Slot, StrRef, StringArena};
use crate::vm::VmError;

/// RFC 3986: everything outside the unreserved set is escaped.
const URL_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Ceiling on instructions per run. A program that hits it is faulted
/// rather than allowed to spin forever.
const DEFAULT_INSTRUCTION_BUDGET: u64 = 1 << 24;

pub struct Runner {
    program: Arc<Program>,
    handler: usize,
    regs: Vec<Slot>,
    arena: StringArena,
    userdata: Option<Box<dyn Any + Send>>,
    fault: Option<VmError>,
    /// Capture groups of the most recent SREGMATCH hit.
    last_match: Vec<Option<String>>,
    budget: u64,
}

impl Runner {
    pub(crate) fn new(program: Arc<Program>, handler: usize) -> Self {
        let register_count = program.handler_defs()[handler].register_count;
        Runner {
            program,
            handler,
            regs: vec![Slot::default(); register_count],
            arena: StringArena::new(),
            userdata: None,
            fault: None,
            last_match: Vec::new(),
            budget: DEFAULT_INSTRUCTION_BUDGET,
        }
    }

    pub fn set_userdata(&mut self, data: Box<dyn Any + Send>) {
        self.userdata = Some(data);
    }

    pub fn take_userdata(&mut self) -> Option<Box<dyn Any + Send>> {
        self.userdata.take()
    }

    pub fn userdata_ref<T: 'static>(&self) -> Option<&T> {
        self.userdata.as_ref()?.downcast_ref::<T>()
    }

    pub fn set_instruction_budget(&mut self, budget: u64) {
        self.budget = budget;
    }

    /// The fault that terminated the last run, if any.
    pub fn fault(&self) -> Option<&VmError> {
        self.fault.as_ref()
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Read a register; test hook and host-side inspection.
    pub fn register(&self, index: usize) -> Slot {
        self.regs.get(index).copied().unwrap_or_default()
    }

    /// Resolve a string-valued register to its text.
    pub fn register_str(&self, index: usize) -> &str {
        str_of(self.register(index), &self.program, &self.arena)
    }

    fn fail(&mut self, error: VmError) -> bool {
        tracing::debug!(target: "flow", error = %error, "runner faulted");
        self.fault = Some(error);
        false
    }

    /// Execute the handler to completion. Returns the handler verdict;
    /// `false` with a recorded fault when the run was terminated by an
    /// execution error.
    pub fn run(&mut self) -> bool {
        self.fault = None;
        let program = Arc::clone(&self.program);
        let code = program.code();
        let mut pc = program.handler_defs()[self.handler].entry;
        let mut ticks: u64 = 0;

        loop {
            if pc >= code.len() {
                return self.fail(VmError::BadBranch { pc });
            }
            ticks += 1;
            if ticks > self.budget {
                return self.fail(VmError::StackExhausted);
            }

            let insn = code[pc];
            let op = match Opcode::from_u16(raw_opcode(insn)) {
                Some(op) => op,
                None => return self.fail(VmError::BadBranch { pc }),
            };
            let a = operand_a(insn) as usize;
            let b = operand_b(insn) as usize;
            let c = operand_c(insn) as usize;

            match op {
                Opcode::Nop => {}

                Opcode::Exit => return a != 0,
                Opcode::Jmp => {
                    pc = a;
                    continue;
                }
                Opcode::Jn => {
                    if self.regs[a].truthy() {
                        pc = b;
                        continue;
                    }
                }
                Opcode::Jz => {
                    if !self.regs[a].truthy() {
                        pc = b;
                        continue;
                    }
                }

                Opcode::NTicks => self.regs[a] = Slot::Int(ticks as i64),
                Opcode::NDumpN => {
                    let dump: Vec<String> = (a..a + b)
                        .map(|r| format!("r{r} = {}", self.regs[r].as_int()))
                        .collect();
                    tracing::debug!(target: "flow", "regdump: {}", dump.join(", "));
                }

                Opcode::Mov => self.regs[a] = self.regs[b],
                Opcode::IMov => self.regs[a] = Slot::Int(b as i64),

                Opcode::ITConst => match checked(program.constants().int_array(b as u32), pc, b) {
                    Ok(_) => self.regs[a] = Slot::IntArray(b as u32),
                    Err(e) => return self.fail(e),
                },
                Opcode::STConst => {
                    match checked(program.constants().string_array(b as u32), pc, b) {
                        Ok(_) => self.regs[a] = Slot::StrArray(b as u32),
                        Err(e) => return self.fail(e),
                    }
                }
                Opcode::PTConst => match checked(program.constants().ip_array(b as u32), pc, b) {
                    Ok(_) => self.regs[a] = Slot::IpArray(b as u32),
                    Err(e) => return self.fail(e),
                },
                Opcode::CTConst => match checked(program.constants().cidr_array(b as u32), pc, b) {
                    Ok(_) => self.regs[a] = Slot::CidrArray(b as u32),
                    Err(e) => return self.fail(e),
                },

                Opcode::NConst => match checked(program.constants().integer(b as u32), pc, b) {
                    Ok(v) => self.regs[a] = Slot::Int(v),
                    Err(e) => return self.fail(e),
                },
                Opcode::SConst => match checked(program.constants().string(b as u32), pc, b) {
                    Ok(_) => self.regs[a] = Slot::Str(StrRef::Pool(b as u32)),
                    Err(e) => return self.fail(e),
                },
                Opcode::PConst => match checked(program.constants().ipaddr(b as u32), pc, b) {
                    Ok(v) => self.regs[a] = Slot::Ip(v),
                    Err(e) => return self.fail(e),
                },
                Opcode::CConst => match checked(program.constants().cidr(b as u32), pc, b) {
                    Ok(v) => self.regs[a] = Slot::Cidr(v),
                    Err(e) => return self.fail(e),
                },

                Opcode::NNeg => self.regs[a] = Slot::Int(self.regs[b].as_int().wrapping_neg()),
                Opcode::NAdd => self.num_bin(a, b, c, i64::wrapping_add),
                Opcode::NSub => self.num_bin(a, b, c, i64::wrapping_sub),
                Opcode::NMul => self.num_bin(a, b, c, i64::wrapping_mul),
                Opcode::NDiv => {
                    let divisor = self.regs[c].as_int();
                    if divisor == 0 {
                        return self.fail(VmError::DivisionByZero { pc });
                    }
                    self.regs[a] = Slot::Int(self.regs[b].as_int().wrapping_div(divisor));
                }
                Opcode::NRem => {
                    let divisor = self.regs[c].as_int();
                    if divisor == 0 {
                        return self.fail(VmError::DivisionByZero { pc });
                    }
                    self.regs[a] = Slot::Int(self.regs[b].as_int().wrapping_rem(divisor));
                }
                Opcode::NShl => {
                    let shift = (self.regs[c].as_int() as u32) & 63;
                    self.regs[a] = Slot::Int(self.regs[b].as_int().wrapping_shl(shift));
                }
                Opcode::NShr => {
                    let shift = (self.regs[c].as_int() as u32) & 63;
                    self.regs[a] = Slot::Int(self.regs[b].as_int().wrapping_shr(shift));
                }
                Opcode::NPow => {
                    let v = int_pow(self.regs[b].as_int(), self.regs[c].as_int());
                    self.regs[a] = Slot::Int(v);
                }
                Opcode::NAnd => self.num_bin(a, b, c, |x, y| x & y),
                Opcode::NOr => self.num_bin(a, b, c, |x, y| x | y),
                Opcode::NXor => self.num_bin(a, b, c, |x, y| x ^ y),
                Opcode::NCmpZ => self.regs[a] = Slot::from_bool(self.regs[b].as_int() == 0),
                Opcode::NCmpEq => self.num_cmp(a, b, c, |x, y| x == y),
                Opcode::NCmpNe => self.num_cmp(a, b, c, |x, y| x != y),
                Opcode::NCmpLe => self.num_cmp(a, b, c, |x, y| x <= y),
                Opcode::NCmpGe => self.num_cmp(a, b, c, |x, y| x >= y),
                Opcode::NCmpLt => self.num_cmp(a, b, c, |x, y| x < y),
                Opcode::NCmpGt => self.num_cmp(a, b, c, |x, y| x > y),

                Opcode::NIAdd => self.num_imm(a, b, c, i64::wrapping_add),
                Opcode::NISub => self.num_imm(a, b, c, i64::wrapping_sub),
                Opcode::NIMul => self.num_imm(a, b, c, i64::wrapping_mul),
                Opcode::NIDiv => {
                    if c == 0 {
                        return self.fail(VmError::DivisionByZero { pc });
                    }
                    self.regs[a] = Slot::Int(self.regs[b].as_int().wrapping_div(c as i64));
                }
                Opcode::NIRem => {
                    if c == 0 {
                        return self.fail(VmError::DivisionByZero { pc });
                    }
                    self.regs[a] = Slot::Int(self.regs[b].as_int().wrapping_rem(c as i64));
                }
                Opcode::NIShl => {
                    let shift = (c as u32) & 63;
                    self.regs[a] = Slot::Int(self.regs[b].as_int().wrapping_shl(shift));
                }
                Opcode::NIShr => {
                    let shift = (c as u32) & 63;
                    self.regs[a] = Slot::Int(self.regs[b].as_int().wrapping_shr(shift));
                }
                Opcode::NIPow => {
                    self.regs[a] = Slot::Int(int_pow(self.regs[b].as_int(), c as i64));
                }
                Opcode::NIAnd => self.num_imm(a, b, c, |x, y| x & y),
                Opcode::NIOr => self.num_imm(a, b, c, |x, y| x | y),
                Opcode::NIXor => self.num_imm(a, b, c, |x, y| x ^ y),
                Opcode::NICmpEq => self.num_imm_cmp(a, b, c, |x, y| x == y),
                Opcode::NICmpNe => self.num_imm_cmp(a, b, c, |x, y| x != y),
                Opcode::NICmpLe => self.num_imm_cmp(a, b, c, |x, y| x <= y),
                Opcode::NICmpGe => self.num_imm_cmp(a, b, c, |x, y| x >= y),
                Opcode::NICmpLt => self.num_imm_cmp(a, b, c, |x, y| x < y),
                Opcode::NICmpGt => self.num_imm_cmp(a, b, c, |x, y| x > y),

                Opcode::BNot => self.regs[a] = Slot::from_bool(!self.regs[b].truthy()),
                Opcode::BAnd => {
                    self.regs[a] = Slot::from_bool(self.regs[b].truthy() && self.regs[c].truthy())
                }
                Opcode::BOr => {
                    self.regs[a] = Slot::from_bool(self.regs[b].truthy() || self.regs[c].truthy())
                }
                Opcode::BXor => {
                    self.regs[a] = Slot::from_bool(self.regs[b].truthy() != self.regs[c].truthy())
                }

                Opcode::SAdd => {
                    let joined = {
                        let lhs = str_of(self.regs[b], &program, &self.arena);
                        let rhs = str_of(self.regs[c], &program, &self.arena);
                        let mut out = String::with_capacity(lhs.len() + rhs.len());
                        out.push_str(lhs);
                        out.push_str(rhs);
                        out
                    };
                    self.regs[a] = Slot::Str(self.arena.alloc(joined));
                }
                Opcode::SAddMulti => {
                    // Rejected at validation; never reached in a validated
                    // program.
                    return self.fail(VmError::BadBranch { pc });
                }
                Opcode::SSubStr => {
                    // offset and count address bytes; a slice that cuts a
                    // multi-byte sequence reassembles lossily
                    let offset = self.regs[c].as_int().max(0) as usize;
                    let count = self.regs[c + 1].as_int().max(0) as usize;
                    let sub = {
                        let src = str_of(self.regs[b], &program, &self.arena).as_bytes();
                        let start = offset.min(src.len());
                        let end = start.saturating_add(count).min(src.len());
                        String::from_utf8_lossy(&src[start..end]).into_owned()
                    };
                    self.regs[a] = Slot::Str(self.arena.alloc(sub));
                }
                Opcode::SCmpEq => self.str_cmp(&program, a, b, c, |x, y| x == y),
                Opcode::SCmpNe => self.str_cmp(&program, a, b, c, |x, y| x != y),
                Opcode::SCmpLe => self.str_cmp(&program, a, b, c, |x, y| x <= y),
                Opcode::SCmpGe => self.str_cmp(&program, a, b, c, |x, y| x >= y),
                Opcode::SCmpLt => self.str_cmp(&program, a, b, c, |x, y| x < y),
                Opcode::SCmpGt => self.str_cmp(&program, a, b, c, |x, y| x > y),
                Opcode::SCmpBeg => self.str_cmp(&program, a, b, c, |x, y| x.starts_with(y)),
                Opcode::SCmpEnd => self.str_cmp(&program, a, b, c, |x, y| x.ends_with(y)),
                Opcode::SContains => self.str_cmp(&program, a, b, c, |x, y| x.contains(y)),
                Opcode::SLen => {
                    // byte length, consistent with SSUBSTR addressing
                    let len = str_of(self.regs[b], &program, &self.arena).len();
                    self.regs[a] = Slot::Int(len as i64);
                }
                Opcode::SIsEmpty => {
                    let empty = str_of(self.regs[b], &program, &self.arena).is_empty();
                    self.regs[a] = Slot::from_bool(empty);
                }
                Opcode::SPrint => {
                    let text = str_of(self.regs[a], &program, &self.arena);
                    tracing::info!(target: "flow", "{text}");
                }

                Opcode::SMatchEq | Opcode::SMatchBeg | Opcode::SMatchEnd | Opcode::SMatchR => {
                    let table = match program.match_table(b as u32) {
                        Some(t) => t,
                        None => return self.fail(VmError::BadConstantIndex { pc, index: b }),
                    };
                    let subject = str_of(self.regs[a], &program, &self.arena);
                    pc = table.evaluate(subject, program.constants());
                    continue;
                }

                Opcode::PCmpEq => {
                    self.regs[a] = Slot::from_bool(self.regs[b].as_ip() == self.regs[c].as_ip())
                }
                Opcode::PCmpNe => {
                    self.regs[a] = Slot::from_bool(self.regs[b].as_ip() != self.regs[c].as_ip())
                }
                Opcode::PInCidr => {
                    let ip = self.regs[b].as_ip();
                    let cidr = self.regs[c].as_cidr();
                    self.regs[a] = Slot::from_bool(cidr.contains(&ip));
                }

                Opcode::SRegMatch => {
                    let re = match program.constants().regex(c as u32) {
                        Some(re) => re,
                        None => return self.fail(VmError::BadConstantIndex { pc, index: c }),
                    };
                    let groups = {
                        let subject = str_of(self.regs[b], &program, &self.arena);
                        re.captures(subject).map(|caps| {
                            caps.iter()
                                .map(|m| m.map(|m| m.as_str().to_string()))
                                .collect::<Vec<_>>()
                        })
                    };
                    self.regs[a] = Slot::from_bool(groups.is_some());
                    if let Some(groups) = groups {
                        self.last_match = groups;
                    }
                }
                Opcode::SRegGroup => {
                    let index = self.regs[b].as_int().max(0) as usize;
                    let group = self
                        .last_match
                        .get(index)
                        .and_then(|g| g.clone())
                        .unwrap_or_default();
                    self.regs[a] = Slot::Str(self.arena.alloc(group));
                }

                Opcode::I2S => {
                    let text = self.regs[b].as_int().to_string();
                    self.regs[a] = Slot::Str(self.arena.alloc(text));
                }
                Opcode::P2S => {
                    let text = self.regs[b].as_ip().to_string();
                    self.regs[a] = Slot::Str(self.arena.alloc(text));
                }
                Opcode::C2S => {
                    let text = self.regs[b].as_cidr().to_string();
                    self.regs[a] = Slot::Str(self.arena.alloc(text));
                }
                Opcode::R2S => {
                    let text = match self.regs[b] {
                        Slot::Regex(i) => program
                            .constants()
                            .regex(i)
                            .map(|re| re.as_str().to_string())
                            .unwrap_or_default(),
                        _ => String::new(),
                    };
                    self.regs[a] = Slot::Str(self.arena.alloc(text));
                }
                Opcode::S2I => {
                    let value = str_of(self.regs[b], &program, &self.arena)
                        .trim()
                        .parse::<i64>()
                        .unwrap_or(0);
                    self.regs[a] = Slot::Int(value);
                }
                Opcode::SUrlEnc => {
                    let encoded = {
                        let raw = str_of(self.regs[b], &program, &self.arena);
                        utf8_percent_encode(raw, URL_ESCAPE).to_string()
                    };
                    self.regs[a] = Slot::Str(self.arena.alloc(encoded));
                }
                Opcode::SUrlDec => {
                    let decoded = {
                        let raw = str_of(self.regs[b], &program, &self.arena);
                        percent_encoding::percent_decode_str(raw)
                            .decode_utf8_lossy()
                            .into_owned()
                    };
                    self.regs[a] = Slot::Str(self.arena.alloc(decoded));
                }

                Opcode::Call => {
                    let callback = match program.native_function(a) {
                        Some(entry) => entry.callback(),
                        None => return self.fail(VmError::UnknownNative { pc, id: a }),
                    };
                    let mut params = Params {
                        argv: &mut self.regs[c..=c + b],
                        program: &program,
                        arena: &mut self.arena,
                        userdata: &mut self.userdata,
                    };
                    callback(&mut params);
                }
                Opcode::Handler => {
                    let callback = match program.native_handler(a) {
                        Some(entry) => entry.callback(),
                        None => return self.fail(VmError::UnknownNative { pc, id: a }),
                    };
                    let mut params = Params {
                        argv: &mut self.regs[c..=c + b],
                        program: &program,
                        arena: &mut self.arena,
                        userdata: &mut self.userdata,
                    };
                    callback(&mut params);
                    if self.regs[c].truthy() {
                        return true;
                    }
                }
            }

            pc += 1;
        }
    }

    fn num_bin(&mut self, a: usize, b: usize, c: usize, f: impl Fn(i64, i64) -> i64) {
        self.regs[a] = Slot::Int(f(self.regs[b].as_int(), self.regs[c].as_int()));
    }

    fn num_imm(&mut self, a: usize, b: usize, c: usize, f: impl Fn(i64, i64) -> i64) {
        self.regs[a] = Slot::Int(f(self.regs[b].as_int(), c as i64));
    }

    fn num_cmp(&mut self, a: usize, b: usize, c: usize, f: impl Fn(i64, i64) -> bool) {
        self.regs[a] = Slot::from_bool(f(self.regs[b].as_int(), self.regs[c].as_int()));
    }

    fn num_imm_cmp(&mut self, a: usize, b: usize, c: usize, f: impl Fn(i64, i64) -> bool) {
        self.regs[a] = Slot::from_bool(f(self.regs[b].as_int(), c as i64));
    }

    fn str_cmp(
        &mut self,
        program: &Program,
        a: usize,
        b: usize,
        c: usize,
        f: impl Fn(&str, &str) -> bool,
    ) {
        let result = {
            let lhs = str_of(self.regs[b], program, &self.arena);
            let rhs = str_of(self.regs[c], program, &self.arena);
            f(lhs, rhs)
        };
        self.regs[a] = Slot::from_bool(result);
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("handler", &self.program.handler_defs()[self.handler].name)
            .field("registers", &self.regs.len())
            .field("arena", &self.arena.len())
            .field("fault", &self.fault)
            .finish()
    }
}

fn str_of<'a>(slot: Slot, program: &'a Program, arena: &'a StringArena) -> &'a str {
    match slot {
        Slot::Str(StrRef::Pool(i)) => program.constants().string(i).unwrap_or(""),
        Slot::Str(StrRef::Arena(i)) => arena.get(i),
        _ => "",
    }
}

fn checked<T>(value: Option<T>, pc: usize, index: usize) -> Result<T, VmError> {
    value.ok_or(VmError::BadConstantIndex { pc, index })
}

fn int_pow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return 0;
    }
    base.wrapping_pow(exp.min(u32::MAX as i64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::matcher::{MatchCase, MatchKind, MatchPattern};
    use crate::vm::natives::NativeRegistry;
    use crate::vm::program::ProgramBuilder;

    fn registry() -> NativeRegistry {
        NativeRegistry::new()
    }

    #[test]
    fn arithmetic_terminates_true() {
        // NCONST r0, 10; NCONST r1, 20; NADD r2, r0, r1; EXIT 2
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 3);
        let ten = b.add_integer(10);
        let twenty = b.add_integer(20);
        b.emit(Opcode::NConst, 0, ten, 0);
        b.emit(Opcode::NConst, 1, twenty, 0);
        b.emit(Opcode::NAdd, 2, 0, 1);
        b.emit(Opcode::Exit, 2, 0, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(runner.run());
        assert_eq!(runner.register(2).as_int(), 30);
        assert!(runner.fault().is_none());
    }

    #[test]
    fn exit_zero_terminates_false() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 1);
        let zero = b.add_integer(0);
        b.emit(Opcode::NConst, 0, zero, 0);
        b.emit(Opcode::Exit, 0, 0, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(!runner.run());
        assert!(runner.fault().is_none());
    }

    #[test]
    fn mov_copies_registers() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 3);
        let v = b.add_integer(1234);
        b.emit(Opcode::NConst, 2, v, 0);
        b.emit(Opcode::Mov, 1, 2, 0);
        b.emit(Opcode::NCmpEq, 0, 1, 2);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(runner.run());
        assert_eq!(runner.register(1).as_int(), 1234);
        assert_eq!(runner.register(0).as_int(), 1);
    }

    #[test]
    fn division_by_zero_faults() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 2);
        let one = b.add_integer(1);
        let zero = b.add_integer(0);
        b.emit(Opcode::NConst, 0, one, 0);
        b.emit(Opcode::NConst, 1, zero, 0);
        b.emit(Opcode::NDiv, 0, 0, 1);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(!runner.run());
        assert!(matches!(
            runner.fault(),
            Some(VmError::DivisionByZero { pc: 2 })
        ));
    }

    #[test]
    fn sadd_is_referentially_pure() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 3);
        let hello = b.add_string("hello, ");
        let world = b.add_string("world");
        b.emit(Opcode::SConst, 0, hello, 0);
        b.emit(Opcode::SConst, 1, world, 0);
        b.emit(Opcode::SAdd, 2, 0, 1);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(runner.run());
        assert_eq!(runner.register_str(2), "hello, world");

        // same inputs, second run, same result
        assert!(runner.run());
        assert_eq!(runner.register_str(2), "hello, world");
    }

    #[test]
    fn match_table_dispatch() {
        // r0 holds the subject; SMATCHEQ jumps to the case target or the
        // default. Targets load a marker value into r1.
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 2);
        let subject = b.add_string("/about");
        let m1 = b.add_integer(1);
        let m2 = b.add_integer(2);
        let md = b.add_integer(99);
        b.emit(Opcode::SConst, 0, subject, 0); // 0
        b.emit(Opcode::Nop, 0, 0, 0); // 1: SMATCHEQ patched below
        let t_index = b.emit(Opcode::NConst, 1, m1, 0); // 2
        b.emit(Opcode::Exit, 1, 0, 0); // 3
        let t_about = b.emit(Opcode::NConst, 1, m2, 0); // 4
        b.emit(Opcode::Exit, 1, 0, 0); // 5
        let t_default = b.emit(Opcode::NConst, 1, md, 0); // 6
        b.emit(Opcode::Exit, 1, 0, 0); // 7
        let table = b.add_match_table(
            MatchKind::Equal,
            t_default,
            vec![
                MatchCase {
                    pattern: MatchPattern::Literal("/index".into()),
                    target: t_index,
                },
                MatchCase {
                    pattern: MatchPattern::Literal("/about".into()),
                    target: t_about,
                },
            ],
        );
        b.patch(1, Opcode::SMatchEq, 0, table, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(runner.run());
        assert_eq!(runner.register(1).as_int(), 2);
    }

    #[test]
    fn pincidr_checks_membership() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 3);
        let ip = b.add_ipaddr("10.1.2.3".parse().unwrap());
        let net = b.add_cidr("10.0.0.0/8".parse().unwrap());
        b.emit(Opcode::PConst, 0, ip, 0);
        b.emit(Opcode::CConst, 1, net, 0);
        b.emit(Opcode::PInCidr, 2, 0, 1);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(runner.run());
        assert_eq!(runner.register(2).as_int(), 1);
    }

    #[test]
    fn instruction_budget_faults_infinite_loop() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 1);
        b.emit(Opcode::Jmp, 0, 0, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        runner.set_instruction_budget(10_000);
        assert!(!runner.run());
        assert!(matches!(runner.fault(), Some(VmError::StackExhausted)));
    }

    #[test]
    fn native_function_call() {
        let mut registry = NativeRegistry::new();
        registry.register_function("math.double", |p| {
            let v = p.int(1);
            p.set_result(v * 2);
        });

        let mut b = ProgramBuilder::new();
        b.add_handler("main", 2);
        let v = b.add_integer(21);
        let double = b.add_native_function("math.double", "II");
        b.emit(Opcode::NConst, 1, v, 0);
        b.emit(Opcode::Call, double, 1, 0); // argv = r0..=r1
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(runner.run());
        assert_eq!(runner.register(0).as_int(), 42);
    }

    #[test]
    fn native_handler_terminates_run() {
        let mut registry = NativeRegistry::new();
        registry.register_handler("always.handle", |p| {
            p.set_result_bool(true);
        });
        registry.register_handler("never.handle", |p| {
            p.set_result_bool(false);
        });

        let mut b = ProgramBuilder::new();
        b.add_handler("main", 1);
        let never = b.add_native_handler("never.handle", "B");
        let always = b.add_native_handler("always.handle", "B");
        b.emit(Opcode::Handler, never, 0, 0);
        b.emit(Opcode::Handler, always, 0, 0);
        b.emit(Opcode::Exit, 0, 0, 0);
        let program = b.build(&registry).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(runner.run());
    }

    #[test]
    fn regex_match_and_group() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 4);
        let subject = b.add_string("/user/1234/profile");
        let re = b.add_regex(r"^/user/(\d+)/");
        b.emit(Opcode::SConst, 0, subject, 0);
        b.emit(Opcode::SRegMatch, 1, 0, re);
        b.emit(Opcode::IMov, 2, 1, 0);
        b.emit(Opcode::SRegGroup, 3, 2, 0);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(runner.run());
        assert_eq!(runner.register(1).as_int(), 1);
        assert_eq!(runner.register_str(3), "1234");
    }

    #[test]
    fn url_encode_decode() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 3);
        let raw = b.add_string("a b/c?d=e");
        b.emit(Opcode::SConst, 0, raw, 0);
        b.emit(Opcode::SUrlEnc, 1, 0, 0);
        b.emit(Opcode::SUrlDec, 2, 1, 0);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry()).unwrap();

        let mut runner = program.handler("main").unwrap().create_runner();
        assert!(runner.run());
        assert_eq!(runner.register_str(1), "a%20b%2Fc%3Fd%3De");
        assert_eq!(runner.register_str(2), "a b/c?d=e");
    }
}
