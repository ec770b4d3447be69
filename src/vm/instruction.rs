//! Instruction word encoding and the opcode set.
//!
//! One instruction is a single 64-bit word: opcode in the low 16 bits, then
//! the A, B and C operand fields, 16 bits each. A is the destination
//! register for value-producing opcodes or the flow target for control
//! opcodes; B and C are source registers or immediates depending on the
//! opcode. The numbering is part of the persisted bytecode format and must
//! not be reordered.

use std::fmt;

/// One encoded instruction word.
pub type Instruction = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    // misc
    Nop = 0,

    // control
    Exit,
    Jmp,
    Jn,
    Jz,

    // debug
    NTicks,
    NDumpN,

    // copy
    Mov,

    // constant arrays
    ITConst,
    STConst,
    PTConst,
    CTConst,

    // numeric
    IMov,
    NConst,
    NNeg,
    NAdd,
    NSub,
    NMul,
    NDiv,
    NRem,
    NShl,
    NShr,
    NPow,
    NAnd,
    NOr,
    NXor,
    NCmpZ,
    NCmpEq,
    NCmpNe,
    NCmpLe,
    NCmpGe,
    NCmpLt,
    NCmpGt,

    // numeric with C as immediate
    NIAdd,
    NISub,
    NIMul,
    NIDiv,
    NIRem,
    NIShl,
    NIShr,
    NIPow,
    NIAnd,
    NIOr,
    NIXor,
    NICmpEq,
    NICmpNe,
    NICmpLe,
    NICmpGe,
    NICmpLt,
    NICmpGt,

    // boolean
    BNot,
    BAnd,
    BOr,
    BXor,

    // string
    SConst,
    SAdd,
    SAddMulti,
    SSubStr,
    SCmpEq,
    SCmpNe,
    SCmpLe,
    SCmpGe,
    SCmpLt,
    SCmpGt,
    SCmpBeg,
    SCmpEnd,
    SContains,
    SLen,
    SIsEmpty,
    SPrint,
    SMatchEq,
    SMatchBeg,
    SMatchEnd,
    SMatchR,

    // ip
    PConst,
    PCmpEq,
    PCmpNe,
    PInCidr,

    // cidr
    CConst,

    // regex
    SRegMatch,
    SRegGroup,

    // conversion
    I2S,
    P2S,
    C2S,
    R2S,
    S2I,
    SUrlEnc,
    SUrlDec,

    // invocation
    Call,
    Handler,
}

/// Highest valid opcode value, used by the decoder.
const OPCODE_MAX: u16 = Opcode::Handler as u16;

impl TryFrom<u16> for Opcode {
    type Error = ();

    fn try_from(raw: u16) -> Result<Opcode, ()> {
        use Opcode::*;
        Ok(match raw {
            0 => Nop,
            1 => Exit,
            2 => Jmp,
            3 => Jn,
            4 => Jz,
            5 => NTicks,
            6 => NDumpN,
            7 => Mov,
            8 => ITConst,
            9 => STConst,
            10 => PTConst,
            11 => CTConst,
            12 => IMov,
            13 => NConst,
            14 => NNeg,
            15 => NAdd,
            16 => NSub,
            17 => NMul,
            18 => NDiv,
            19 => NRem,
            20 => NShl,
            21 => NShr,
            22 => NPow,
            23 => NAnd,
            24 => NOr,
            25 => NXor,
            26 => NCmpZ,
            27 => NCmpEq,
            28 => NCmpNe,
            29 => NCmpLe,
            30 => NCmpGe,
            31 => NCmpLt,
            32 => NCmpGt,
            33 => NIAdd,
            34 => NISub,
            35 => NIMul,
            36 => NIDiv,
            37 => NIRem,
            38 => NIShl,
            39 => NIShr,
            40 => NIPow,
            41 => NIAnd,
            42 => NIOr,
            43 => NIXor,
            44 => NICmpEq,
            45 => NICmpNe,
            46 => NICmpLe,
            47 => NICmpGe,
            48 => NICmpLt,
            49 => NICmpGt,
            50 => BNot,
            51 => BAnd,
            52 => BOr,
            53 => BXor,
            54 => SConst,
            55 => SAdd,
            56 => SAddMulti,
            57 => SSubStr,
            58 => SCmpEq,
            59 => SCmpNe,
            60 => SCmpLe,
            61 => SCmpGe,
            62 => SCmpLt,
            63 => SCmpGt,
            64 => SCmpBeg,
            65 => SCmpEnd,
            66 => SContains,
            67 => SLen,
            68 => SIsEmpty,
            69 => SPrint,
            70 => SMatchEq,
            71 => SMatchBeg,
            72 => SMatchEnd,
            73 => SMatchR,
            74 => PConst,
            75 => PCmpEq,
            76 => PCmpNe,
            77 => PInCidr,
            78 => CConst,
            79 => SRegMatch,
            80 => SRegGroup,
            81 => I2S,
            82 => P2S,
            83 => C2S,
            84 => R2S,
            85 => S2I,
            86 => SUrlEnc,
            87 => SUrlDec,
            88 => Call,
            89 => Handler,
            _ => return Err(()),
        })
    }
}

impl Opcode {
    pub fn from_u16(raw: u16) -> Option<Opcode> {
        Opcode::try_from(raw).ok()
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Exit => "EXIT",
            Opcode::Jmp => "JMP",
            Opcode::Jn => "JN",
            Opcode::Jz => "JZ",
            Opcode::NTicks => "NTICKS",
            Opcode::NDumpN => "NDUMPN",
            Opcode::Mov => "MOV",
            Opcode::ITConst => "ITCONST",
            Opcode::STConst => "STCONST",
            Opcode::PTConst => "PTCONST",
            Opcode::CTConst => "CTCONST",
            Opcode::IMov => "IMOV",
            Opcode::NConst => "NCONST",
            Opcode::NNeg => "NNEG",
            Opcode::NAdd => "NADD",
            Opcode::NSub => "NSUB",
            Opcode::NMul => "NMUL",
            Opcode::NDiv => "NDIV",
            Opcode::NRem => "NREM",
            Opcode::NShl => "NSHL",
            Opcode::NShr => "NSHR",
            Opcode::NPow => "NPOW",
            Opcode::NAnd => "NAND",
            Opcode::NOr => "NOR",
            Opcode::NXor => "NXOR",
            Opcode::NCmpZ => "NCMPZ",
            Opcode::NCmpEq => "NCMPEQ",
            Opcode::NCmpNe => "NCMPNE",
            Opcode::NCmpLe => "NCMPLE",
            Opcode::NCmpGe => "NCMPGE",
            Opcode::NCmpLt => "NCMPLT",
            Opcode::NCmpGt => "NCMPGT",
            Opcode::NIAdd => "NIADD",
            Opcode::NISub => "NISUB",
            Opcode::NIMul => "NIMUL",
            Opcode::NIDiv => "NIDIV",
            Opcode::NIRem => "NIREM",
            Opcode::NIShl => "NISHL",
            Opcode::NIShr => "NISHR",
            Opcode::NIPow => "NIPOW",
            Opcode::NIAnd => "NIAND",
            Opcode::NIOr => "NIOR",
            Opcode::NIXor => "NIXOR",
            Opcode::NICmpEq => "NICMPEQ",
            Opcode::NICmpNe => "NICMPNE",
            Opcode::NICmpLe => "NICMPLE",
            Opcode::NICmpGe => "NICMPGE",
            Opcode::NICmpLt => "NICMPLT",
            Opcode::NICmpGt => "NICMPGT",
            Opcode::BNot => "BNOT",
            Opcode::BAnd => "BAND",
            Opcode::BOr => "BOR",
            Opcode::BXor => "BXOR",
            Opcode::SConst => "SCONST",
            Opcode::SAdd => "SADD",
            Opcode::SAddMulti => "SADDMULTI",
            Opcode::SSubStr => "SSUBSTR",
            Opcode::SCmpEq => "SCMPEQ",
            Opcode::SCmpNe => "SCMPNE",
            Opcode::SCmpLe => "SCMPLE",
            Opcode::SCmpGe => "SCMPGE",
            Opcode::SCmpLt => "SCMPLT",
            Opcode::SCmpGt => "SCMPGT",
            Opcode::SCmpBeg => "SCMPBEG",
            Opcode::SCmpEnd => "SCMPEND",
            Opcode::SContains => "SCONTAINS",
            Opcode::SLen => "SLEN",
            Opcode::SIsEmpty => "SISEMPTY",
            Opcode::SPrint => "SPRINT",
            Opcode::SMatchEq => "SMATCHEQ",
            Opcode::SMatchBeg => "SMATCHBEG",
            Opcode::SMatchEnd => "SMATCHEND",
            Opcode::SMatchR => "SMATCHR",
            Opcode::PConst => "PCONST",
            Opcode::PCmpEq => "PCMPEQ",
            Opcode::PCmpNe => "PCMPNE",
            Opcode::PInCidr => "PINCIDR",
            Opcode::CConst => "CCONST",
            Opcode::SRegMatch => "SREGMATCH",
            Opcode::SRegGroup => "SREGGROUP",
            Opcode::I2S => "I2S",
            Opcode::P2S => "P2S",
            Opcode::C2S => "C2S",
            Opcode::R2S => "R2S",
            Opcode::S2I => "S2I",
            Opcode::SUrlEnc => "SURLENC",
            Opcode::SUrlDec => "SURLDEC",
            Opcode::Call => "CALL",
            Opcode::Handler => "HANDLER",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

pub fn encode(op: Opcode, a: u16, b: u16, c: u16) -> Instruction {
    (op as u64) | ((a as u64) << 16) | ((b as u64) << 32) | ((c as u64) << 48)
}

pub fn raw_opcode(insn: Instruction) -> u16 {
    insn as u16
}

pub fn operand_a(insn: Instruction) -> u16 {
    (insn >> 16) as u16
}

pub fn operand_b(insn: Instruction) -> u16 {
    (insn >> 32) as u16
}

pub fn operand_c(insn: Instruction) -> u16 {
    (insn >> 48) as u16
}

/// Render one instruction for diagnostics.
pub fn disassemble(insn: Instruction) -> String {
    let a = operand_a(insn);
    let b = operand_b(insn);
    let c = operand_c(insn);
    match Opcode::from_u16(raw_opcode(insn)) {
        Some(op) => format!("{} {}, {}, {}", op.mnemonic(), a, b, c),
        None => format!("<bad:{:#06x}> {}, {}, {}", raw_opcode(insn), a, b, c),
    }
}
