pub const MAGIC: [u8; 4] = *b"PARX";
pub const VERSION: u16 = 3;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    PushImm64 = 0x01,
    Add = 0x02,
    Dup = 0x06,
    StoreLocal = 0x10,
    LoadLocal = 0x11,
    Ret = 0x21,
    Max = 0x30,
    Min = 0x31,
    CmpGt = 0x32,
    CmpLt = 0x33,
    CmpEq = 0x34,
    CmpNe = 0x35,
    CmpGe = 0x36,
    CmpLe = 0x37,
    ArrNew = 0x40,
    ArrGet = 0x41,
    ArrSet = 0x42,
    JzAbs = 0x70,
    JmpAbs = 0x71,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParxFormatError {
    UnexpectedEof,
    InvalidUtf8,
    UnknownOpcode(u8),
    BadMagic,
    BranchTargetOutOfRange { target: usize, count: usize },
    SectionTooLarge(&'static str),
}

impl core::fmt::Display for ParxFormatError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ParxFormatError::UnexpectedEof => write!(f, "unexpected EOF"),
            ParxFormatError::InvalidUtf8 => write!(f, "invalid utf8"),
            ParxFormatError::UnknownOpcode(v) => write!(f, "unknown opcode 0x{:02x}", v),
            ParxFormatError::BadMagic => write!(f, "bad PARX header"),
            ParxFormatError::BranchTargetOutOfRange { target, count } => {
                write!(f, "branch target {} out of range ({} instructions)", target, count)
            }
            ParxFormatError::SectionTooLarge(what) => write!(f, "{} too large", what),
        }
    }
}

impl std::error::Error for ParxFormatError {}

impl Opcode {
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(v: u8) -> Result<Self, ParxFormatError> {
        match v {
            x if x == Self::PushImm64 as u8 => Ok(Self::PushImm64),
            x if x == Self::Add as u8 => Ok(Self::Add),
            x if x == Self::Dup as u8 => Ok(Self::Dup),
            x if x == Self::StoreLocal as u8 => Ok(Self::StoreLocal),
            x if x == Self::LoadLocal as u8 => Ok(Self::LoadLocal),
            x if x == Self::Ret as u8 => Ok(Self::Ret),
            x if x == Self::Max as u8 => Ok(Self::Max),
            x if x == Self::Min as u8 => Ok(Self::Min),
            x if x == Self::CmpGt as u8 => Ok(Self::CmpGt),
            x if x == Self::CmpLt as u8 => Ok(Self::CmpLt),
            x if x == Self::CmpEq as u8 => Ok(Self::CmpEq),
            x if x == Self::CmpNe as u8 => Ok(Self::CmpNe),
            x if x == Self::CmpGe as u8 => Ok(Self::CmpGe),
            x if x == Self::CmpLe as u8 => Ok(Self::CmpLe),
            x if x == Self::ArrNew as u8 => Ok(Self::ArrNew),
            x if x == Self::ArrGet as u8 => Ok(Self::ArrGet),
            x if x == Self::ArrSet as u8 => Ok(Self::ArrSet),
            x if x == Self::JzAbs as u8 => Ok(Self::JzAbs),
            x if x == Self::JmpAbs as u8 => Ok(Self::JmpAbs),
            _ => Err(ParxFormatError::UnknownOpcode(v)),
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::PushImm64 => "PUSH_IMM64",
            Self::Add => "ADD",
            Self::Dup => "DUP",
            Self::StoreLocal => "STORE_LOCAL",
            Self::LoadLocal => "LOAD_LOCAL",
            Self::Ret => "RET",
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::CmpGt => "CMP_GT",
            Self::CmpLt => "CMP_LT",
            Self::CmpEq => "CMP_EQ",
            Self::CmpNe => "CMP_NE",
            Self::CmpGe => "CMP_GE",
            Self::CmpLe => "CMP_LE",
            Self::ArrNew => "ARR_NEW",
            Self::ArrGet => "ARR_GET",
            Self::ArrSet => "ARR_SET",
            Self::JzAbs => "JZ_ABS",
            Self::JmpAbs => "JMP_ABS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Gt,
    Lt,
    Eq,
    Ne,
    Ge,
    Le,
}

impl CmpOp {
    pub fn opcode(self) -> Opcode {
        match self {
            CmpOp::Gt => Opcode::CmpGt,
            CmpOp::Lt => Opcode::CmpLt,
            CmpOp::Eq => Opcode::CmpEq,
            CmpOp::Ne => Opcode::CmpNe,
            CmpOp::Ge => Opcode::CmpGe,
            CmpOp::Le => Opcode::CmpLe,
        }
    }

    // shared by the constant folder and the VM
    pub fn eval(self, a: i64, b: i64) -> bool {
        match self {
            CmpOp::Gt => a > b,
            CmpOp::Lt => a < b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Ge => a >= b,
            CmpOp::Le => a <= b,
        }
    }
}

// branch payloads are instruction indices until finalize rewrites them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    PushImm64(u64),
    Add,
    Dup,
    StoreLocal(u16),
    LoadLocal(u16),
    Ret,
    Max,
    Min,
    Cmp(CmpOp),
    ArrNew,
    ArrGet,
    ArrSet,
    JzAbs(usize),
    JmpAbs(usize),
}

impl Instr {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instr::PushImm64(_) => Opcode::PushImm64,
            Instr::Add => Opcode::Add,
            Instr::Dup => Opcode::Dup,
            Instr::StoreLocal(_) => Opcode::StoreLocal,
            Instr::LoadLocal(_) => Opcode::LoadLocal,
            Instr::Ret => Opcode::Ret,
            Instr::Max => Opcode::Max,
            Instr::Min => Opcode::Min,
            Instr::Cmp(op) => op.opcode(),
            Instr::ArrNew => Opcode::ArrNew,
            Instr::ArrGet => Opcode::ArrGet,
            Instr::ArrSet => Opcode::ArrSet,
            Instr::JzAbs(_) => Opcode::JzAbs,
            Instr::JmpAbs(_) => Opcode::JmpAbs,
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            Instr::PushImm64(_) => 1 + 8,
            Instr::StoreLocal(_) | Instr::LoadLocal(_) => 1 + 2,
            Instr::JzAbs(_) | Instr::JmpAbs(_) => 1 + 4,
            _ => 1,
        }
    }
}

// one entry per instruction plus the total encoded length
pub fn byte_offsets(instrs: &[Instr]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(instrs.len() + 1);
    let mut pos = 0usize;
    for instr in instrs {
        offsets.push(pos);
        pos += instr.encoded_size();
    }
    offsets.push(pos);
    offsets
}

// a target equal to the instruction count resolves to the buffer length;
// such a branch comes from an if whose arms both return and is never taken
pub fn finalize(instrs: &[Instr]) -> Result<Vec<u8>, ParxFormatError> {
    let offsets = byte_offsets(instrs);
    let mut out = Vec::with_capacity(offsets[instrs.len()]);
    for instr in instrs {
        out.push(instr.opcode().byte());
        match instr {
            Instr::PushImm64(v) => write_u64_le(&mut out, *v),
            Instr::StoreLocal(idx) | Instr::LoadLocal(idx) => write_u16_le(&mut out, *idx),
            Instr::JzAbs(target) | Instr::JmpAbs(target) => {
                let byte_target =
                    *offsets
                        .get(*target)
                        .ok_or(ParxFormatError::BranchTargetOutOfRange {
                            target: *target,
                            count: instrs.len(),
                        })?;
                let word = u32::try_from(byte_target)
                    .map_err(|_| ParxFormatError::SectionTooLarge("code segment"))?;
                write_u32_le(&mut out, word);
            }
            _ => {}
        }
    }
    Ok(out)
}

pub fn write_u16_le(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u32_le(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u64_le(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u8(bytes: &[u8], i: &mut usize) -> Result<u8, ParxFormatError> {
    if *i >= bytes.len() {
        return Err(ParxFormatError::UnexpectedEof);
    }
    let v = bytes[*i];
    *i += 1;
    Ok(v)
}

pub fn read_u16_le(bytes: &[u8], i: &mut usize) -> Result<u16, ParxFormatError> {
    if *i + 2 > bytes.len() {
        return Err(ParxFormatError::UnexpectedEof);
    }
    let v = u16::from_le_bytes([bytes[*i], bytes[*i + 1]]);
    *i += 2;
    Ok(v)
}

pub fn read_u32_le(bytes: &[u8], i: &mut usize) -> Result<u32, ParxFormatError> {
    if *i + 4 > bytes.len() {
        return Err(ParxFormatError::UnexpectedEof);
    }
    let v = u32::from_le_bytes([bytes[*i], bytes[*i + 1], bytes[*i + 2], bytes[*i + 3]]);
    *i += 4;
    Ok(v)
}

pub fn read_u64_le(bytes: &[u8], i: &mut usize) -> Result<u64, ParxFormatError> {
    if *i + 8 > bytes.len() {
        return Err(ParxFormatError::UnexpectedEof);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[*i..*i + 8]);
    *i += 8;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_utf8(bytes: &[u8], i: &mut usize, len: usize) -> Result<String, ParxFormatError> {
    if *i + len > bytes.len() {
        return Err(ParxFormatError::UnexpectedEof);
    }
    let s = std::str::from_utf8(&bytes[*i..*i + len])
        .map_err(|_| ParxFormatError::InvalidUtf8)?
        .to_string();
    *i += len;
    Ok(s)
}

// ---------------------------------------------------------------------------
// .parx container (prospective; sections besides the code segment may change)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParxSymbol {
    pub name: String,
    pub is_array: bool,
    pub index: u16,
    pub line: u32,
    pub explicit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParxModule {
    pub version: u16,
    pub constants: Vec<u64>,
    pub code: Vec<u8>,
    pub symbols: Vec<ParxSymbol>,
    pub ranges: Vec<String>,
}

pub fn write_parx(
    code: &[u8],
    constants: &[u64],
    symbols: &[ParxSymbol],
    ranges: &[String],
) -> Result<Vec<u8>, ParxFormatError> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    write_u16_le(&mut out, VERSION);

    let const_count = u16::try_from(constants.len())
        .map_err(|_| ParxFormatError::SectionTooLarge("constant pool"))?;
    write_u16_le(&mut out, const_count);
    for c in constants {
        write_u64_le(&mut out, *c);
    }

    let code_len =
        u32::try_from(code.len()).map_err(|_| ParxFormatError::SectionTooLarge("code segment"))?;
    write_u32_le(&mut out, code_len);
    out.extend_from_slice(code);

    let sym_count = u16::try_from(symbols.len())
        .map_err(|_| ParxFormatError::SectionTooLarge("symbol table"))?;
    write_u16_le(&mut out, sym_count);
    for sym in symbols {
        let name_len = u16::try_from(sym.name.len())
            .map_err(|_| ParxFormatError::SectionTooLarge("symbol name"))?;
        write_u16_le(&mut out, name_len);
        out.extend_from_slice(sym.name.as_bytes());
        out.push(if sym.is_array { 1 } else { 0 });
        write_u16_le(&mut out, sym.index);
        write_u32_le(&mut out, sym.line);
        out.push(if sym.explicit { 1 } else { 0 });
    }

    let range_count =
        u16::try_from(ranges.len()).map_err(|_| ParxFormatError::SectionTooLarge("range table"))?;
    write_u16_le(&mut out, range_count);
    for range in ranges {
        let len = u16::try_from(range.len())
            .map_err(|_| ParxFormatError::SectionTooLarge("range name"))?;
        write_u16_le(&mut out, len);
        out.extend_from_slice(range.as_bytes());
    }

    Ok(out)
}

pub fn read_parx(bytes: &[u8]) -> Result<ParxModule, ParxFormatError> {
    if bytes.len() < MAGIC.len() || bytes[0..4] != MAGIC {
        return Err(ParxFormatError::BadMagic);
    }
    let mut i = MAGIC.len();
    let version = read_u16_le(bytes, &mut i)?;

    let const_count = read_u16_le(bytes, &mut i)? as usize;
    let mut constants = Vec::with_capacity(const_count);
    for _ in 0..const_count {
        constants.push(read_u64_le(bytes, &mut i)?);
    }

    let code_len = read_u32_le(bytes, &mut i)? as usize;
    if i + code_len > bytes.len() {
        return Err(ParxFormatError::UnexpectedEof);
    }
    let code = bytes[i..i + code_len].to_vec();
    i += code_len;

    let sym_count = read_u16_le(bytes, &mut i)? as usize;
    let mut symbols = Vec::with_capacity(sym_count);
    for _ in 0..sym_count {
        let name_len = read_u16_le(bytes, &mut i)? as usize;
        let name = read_utf8(bytes, &mut i, name_len)?;
        let is_array = read_u8(bytes, &mut i)? != 0;
        let index = read_u16_le(bytes, &mut i)?;
        let line = read_u32_le(bytes, &mut i)?;
        let explicit = read_u8(bytes, &mut i)? != 0;
        symbols.push(ParxSymbol {
            name,
            is_array,
            index,
            line,
            explicit,
        });
    }

    let range_count = read_u16_le(bytes, &mut i)? as usize;
    let mut ranges = Vec::with_capacity(range_count);
    for _ in 0..range_count {
        let len = read_u16_le(bytes, &mut i)? as usize;
        ranges.push(read_utf8(bytes, &mut i, len)?);
    }

    Ok(ParxModule {
        version,
        constants,
        code,
        symbols,
        ranges,
    })
}
