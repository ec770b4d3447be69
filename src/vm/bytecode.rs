//! Persisted program images.
//!
//! Layout: magic `FGBC`, format version, then length-prefixed sections in
//! fixed order — instructions (64-bit little-endian words), the constant
//! pools, match tables, native-reference tables (by name; resolved against
//! a [`NativeRegistry`] at load), and the handler table. The loader runs
//! the same structural validation as the builder, so a loaded program
//! upholds every invariant a built one does.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::vm::matcher::{MatchCase, MatchKind, MatchPattern, MatchTable};
use crate::vm::natives::{NativeEntry, NativeRegistry};
use crate::vm::program::{ConstantPool, HandlerDef, Program, ProgramError};
use crate::vm::value::Cidr;

const MAGIC: &[u8; 4] = b"FGBC";
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("not a flow bytecode image")]
    BadMagic,

    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated bytecode image at offset {0}")]
    UnexpectedEof(usize),

    #[error("malformed string data at offset {0}")]
    BadUtf8(usize),

    #[error("unknown tag {tag} at offset {offset}")]
    BadTag { tag: u8, offset: usize },

    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serialize a program. The image is self-contained except for native
/// callbacks, which are stored by name.
pub fn save(program: &Program) -> Vec<u8> {
    let mut w = Writer::default();
    w.bytes(MAGIC);
    w.u32(VERSION);

    w.u32(program.code().len() as u32);
    for insn in program.code() {
        w.u64(*insn);
    }

    let pool = program.constants();
    w.u32(pool.integers.len() as u32);
    for v in &pool.integers {
        w.u64(*v as u64);
    }
    w.u32(pool.strings.len() as u32);
    for s in &pool.strings {
        w.string(s);
    }
    w.u32(pool.ipaddrs.len() as u32);
    for ip in &pool.ipaddrs {
        w.ipaddr(*ip);
    }
    w.u32(pool.cidrs.len() as u32);
    for cidr in &pool.cidrs {
        w.ipaddr(cidr.addr);
        w.u8(cidr.prefix);
    }
    w.u32(pool.regexes.len() as u32);
    for re in &pool.regexes {
        w.string(re.as_str());
    }
    w.u32(pool.int_arrays.len() as u32);
    for array in &pool.int_arrays {
        w.u32(array.len() as u32);
        for v in array {
            w.u64(*v as u64);
        }
    }
    w.u32(pool.string_arrays.len() as u32);
    for array in &pool.string_arrays {
        w.u32(array.len() as u32);
        for s in array {
            w.string(s);
        }
    }
    w.u32(pool.ip_arrays.len() as u32);
    for array in &pool.ip_arrays {
        w.u32(array.len() as u32);
        for ip in array {
            w.ipaddr(*ip);
        }
    }
    w.u32(pool.cidr_arrays.len() as u32);
    for array in &pool.cidr_arrays {
        w.u32(array.len() as u32);
        for cidr in array {
            w.ipaddr(cidr.addr);
            w.u8(cidr.prefix);
        }
    }

    w.u32(program.match_tables().len() as u32);
    for table in program.match_tables() {
        w.u8(match table.kind() {
            MatchKind::Equal => 0,
            MatchKind::Prefix => 1,
            MatchKind::Suffix => 2,
            MatchKind::Regex => 3,
        });
        w.u64(table.default_target() as u64);
        w.u32(table.cases().len() as u32);
        for case in table.cases() {
            match &case.pattern {
                MatchPattern::Literal(p) => {
                    w.u8(0);
                    w.string(p);
                }
                MatchPattern::Regex(idx) => {
                    w.u8(1);
                    w.u32(*idx);
                }
            }
            w.u64(case.target as u64);
        }
    }

    for natives in [program.native_functions(), program.native_handlers()] {
        w.u32(natives.len() as u32);
        for entry in natives {
            w.string(entry.name());
            w.string(entry.signature());
        }
    }

    w.u32(program.handler_defs().len() as u32);
    for handler in program.handler_defs() {
        w.string(&handler.name);
        w.u64(handler.entry as u64);
        w.u32(handler.register_count as u32);
    }

    w.out
}

pub fn save_file(program: &Program, path: &Path) -> Result<(), BytecodeError> {
    std::fs::write(path, save(program))?;
    Ok(())
}

/// Deserialize, resolve natives against `registry`, and validate.
pub fn load(image: &[u8], registry: &NativeRegistry) -> Result<Arc<Program>, BytecodeError> {
    let mut r = Reader { data: image, pos: 0 };

    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(BytecodeError::BadMagic);
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(BytecodeError::UnsupportedVersion(version));
    }

    let ninsns = r.u32()? as usize;
    let mut code = Vec::with_capacity(ninsns);
    for _ in 0..ninsns {
        code.push(r.u64()?);
    }

    let mut pool = ConstantPool::default();
    for _ in 0..r.u32()? {
        pool.integers.push(r.u64()? as i64);
    }
    for _ in 0..r.u32()? {
        pool.strings.push(r.string()?);
    }
    for _ in 0..r.u32()? {
        pool.ipaddrs.push(r.ipaddr()?);
    }
    for _ in 0..r.u32()? {
        let addr = r.ipaddr()?;
        let prefix = r.u8()?;
        pool.cidrs.push(Cidr::new(addr, prefix));
    }
    for _ in 0..r.u32()? {
        let pattern = r.string()?;
        let re = Regex::new(&pattern).map_err(|e| {
            BytecodeError::Program(ProgramError::BadRegex {
                pattern,
                error: e.to_string(),
            })
        })?;
        pool.regexes.push(re);
    }
    for _ in 0..r.u32()? {
        let n = r.u32()? as usize;
        let mut array = Vec::with_capacity(n);
        for _ in 0..n {
            array.push(r.u64()? as i64);
        }
        pool.int_arrays.push(array);
    }
    for _ in 0..r.u32()? {
        let n = r.u32()? as usize;
        let mut array = Vec::with_capacity(n);
        for _ in 0..n {
            array.push(r.string()?);
        }
        pool.string_arrays.push(array);
    }
    for _ in 0..r.u32()? {
        let n = r.u32()? as usize;
        let mut array = Vec::with_capacity(n);
        for _ in 0..n {
            array.push(r.ipaddr()?);
        }
        pool.ip_arrays.push(array);
    }
    for _ in 0..r.u32()? {
        let n = r.u32()? as usize;
        let mut array = Vec::with_capacity(n);
        for _ in 0..n {
            let addr = r.ipaddr()?;
            let prefix = r.u8()?;
            array.push(Cidr::new(addr, prefix));
        }
        pool.cidr_arrays.push(array);
    }

    let mut matches = Vec::new();
    for _ in 0..r.u32()? {
        let offset = r.pos;
        let kind = match r.u8()? {
            0 => MatchKind::Equal,
            1 => MatchKind::Prefix,
            2 => MatchKind::Suffix,
            3 => MatchKind::Regex,
            tag => return Err(BytecodeError::BadTag { tag, offset }),
        };
        let default_target = r.u64()? as usize;
        let ncases = r.u32()? as usize;
        let mut cases = Vec::with_capacity(ncases);
        for _ in 0..ncases {
            let offset = r.pos;
            let pattern = match r.u8()? {
                0 => MatchPattern::Literal(r.string()?),
                1 => MatchPattern::Regex(r.u32()?),
                tag => return Err(BytecodeError::BadTag { tag, offset }),
            };
            let target = r.u64()? as usize;
            cases.push(MatchCase { pattern, target });
        }
        matches.push(MatchTable::build(kind, default_target, cases));
    }

    let mut functions = Vec::new();
    for _ in 0..r.u32()? {
        let name = r.string()?;
        let signature = r.string()?;
        let callback = registry
            .function(&name)
            .ok_or_else(|| BytecodeError::Program(ProgramError::UnknownNative(name.clone())))?;
        functions.push(NativeEntry::new(&name, &signature, callback));
    }
    let mut native_handlers = Vec::new();
    for _ in 0..r.u32()? {
        let name = r.string()?;
        let signature = r.string()?;
        let callback = registry
            .handler(&name)
            .ok_or_else(|| BytecodeError::Program(ProgramError::UnknownNative(name.clone())))?;
        native_handlers.push(NativeEntry::new(&name, &signature, callback));
    }

    let mut handlers = Vec::new();
    for _ in 0..r.u32()? {
        let name = r.string()?;
        let entry = r.u64()? as usize;
        let register_count = r.u32()? as usize;
        handlers.push(HandlerDef {
            name,
            entry,
            register_count,
        });
    }

    Ok(Program::from_parts(
        code,
        pool,
        matches,
        functions,
        native_handlers,
        handlers,
    )?)
}

pub fn load_file(path: &Path, registry: &NativeRegistry) -> Result<Arc<Program>, BytecodeError> {
    let image = std::fs::read(path)?;
    load(&image, registry)
}

#[derive(Default)]
struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn bytes(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
    }

    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
    }

    fn ipaddr(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => {
                self.u8(4);
                self.bytes(&v4.octets());
            }
            IpAddr::V6(v6) => {
                self.u8(6);
                self.bytes(&v6.octets());
            }
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BytecodeError> {
        if self.pos + n > self.data.len() {
            return Err(BytecodeError::UnexpectedEof(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BytecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, BytecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, BytecodeError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn string(&mut self) -> Result<String, BytecodeError> {
        let offset = self.pos;
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BytecodeError::BadUtf8(offset))
    }

    fn ipaddr(&mut self) -> Result<IpAddr, BytecodeError> {
        let offset = self.pos;
        match self.u8()? {
            4 => {
                let bytes = self.take(4)?;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(bytes);
                Ok(IpAddr::from(buf))
            }
            6 => {
                let bytes = self.take(16)?;
                let mut buf = [0u8; 16];
                buf.copy_from_slice(bytes);
                Ok(IpAddr::from(buf))
            }
            tag => Err(BytecodeError::BadTag { tag, offset }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::instruction::Opcode;
    use crate::vm::program::ProgramBuilder;

    #[test]
    fn saved_program_loads_and_runs() {
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
        b.emit(Opcode::Call, double, 1, 0);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry).unwrap();

        let image = save(&program);
        let loaded = load(&image, &registry).unwrap();

        let mut runner = loaded.handler("main").unwrap().create_runner();
        assert!(runner.run());
        assert_eq!(runner.register(0).as_int(), 42);
    }

    #[test]
    fn load_rejects_bad_magic() {
        let err = load(b"NOPE", &NativeRegistry::new()).unwrap_err();
        assert!(matches!(err, BytecodeError::BadMagic));
    }

    #[test]
    fn load_rejects_unresolved_native() {
        let mut registry = NativeRegistry::new();
        registry.register_function("present", |p| p.set_result(0));

        let mut b = ProgramBuilder::new();
        b.add_handler("main", 1);
        let id = b.add_native_function("present", "I");
        b.emit(Opcode::Call, id, 0, 0);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&registry).unwrap();

        let image = save(&program);
        let err = load(&image, &NativeRegistry::new()).unwrap_err();
        assert!(matches!(
            err,
            BytecodeError::Program(ProgramError::UnknownNative(_))
        ));
    }

    #[test]
    fn load_rejects_truncated_image() {
        let mut b = ProgramBuilder::new();
        b.add_handler("main", 1);
        b.emit(Opcode::Exit, 1, 0, 0);
        let program = b.build(&NativeRegistry::new()).unwrap();

        let mut image = save(&program);
        image.truncate(image.len() - 3);
        let err = load(&image, &NativeRegistry::new()).unwrap_err();
        assert!(matches!(err, BytecodeError::UnexpectedEof(_)));
    }
}
