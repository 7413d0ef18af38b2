//! Bytecode: opcodes, the compiled-program container, constant
//! deduplication, and the persistence codec.
//!
//! # Encoding
//!
//! Each instruction is one opcode byte followed by its operands; operand
//! widths come from [`Opcode::operand_widths`] (1 or 2 bytes), and two-byte
//! operands are big-endian.  Jump targets are absolute instruction offsets.
//!
//! # Persistence
//!
//! [`Bytecode::encode`]/[`Bytecode::decode`] write a self-describing binary
//! form: one tag byte per value with fixed-width big-endian integers and
//! length-prefixed payloads.  Decoding re-binds the shared singletons and
//! replaces any `ImmutableMap` carrying `__module_name__` with the builtin
//! module of the same name from the current registry.

use std::fmt::Write as _;
use std::io::{Read, Write};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::modules::{infer_module_name, ModuleMap};
use crate::position::{Pos, SourceFileSet};
use crate::value::{CompiledFunction, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Opcode
// ─────────────────────────────────────────────────────────────────────────────

/// Every instruction the VM can execute.  Discriminants are the wire
/// encoding and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Push `constants[u16]`.
    Const = 0,
    /// Bitwise complement of an Int.
    BComplement,
    /// Discard the top of stack.
    Pop,
    /// Push the `doğru` singleton.
    True,
    /// Push the `yanlış` singleton.
    False,
    /// Pop b, a; push `a == b`.
    Equal,
    /// Pop b, a; push `a != b`.
    NotEqual,
    /// Numeric negation.
    Minus,
    /// Logical not via falsiness.
    LNot,
    /// Pop; jump to the absolute u16 offset when falsy.
    JumpFalsy,
    /// Short-circuit `&&`: jump keeping a falsy top, else pop.
    AndJump,
    /// Short-circuit `||`: jump keeping a truthy top, else pop.
    OrJump,
    /// Unconditional absolute jump.
    Jump,
    /// Push the `tanımsız` singleton.
    Null,
    /// Build an Array from the top u16 elements.
    Array,
    /// Build a Map from the top u16 stack values (key, value pairs).
    Map,
    /// Wrap the top of stack in an Error.
    Error,
    /// Convert Array→ImmutableArray or Map→ImmutableMap.
    Immutable,
    /// Pop index, receiver; push `receiver[index]`.
    Index,
    /// Pop high, low, receiver; push `receiver[low:high]`.
    SliceIndex,
    /// Call with u8 argument count; second u8 set means spread the last arg.
    Call,
    /// Return; u8 flag selects value or `tanımsız`.
    Return,
    /// Push global slot u16.
    GetGlobal,
    /// Pop into global slot u16.
    SetGlobal,
    /// Selector-chain store into global u16 through u8 selectors.
    SetSelGlobal,
    /// Push local slot u8.
    GetLocal,
    /// Pop into local slot u8.
    SetLocal,
    /// Define local slot u8 (first assignment).
    DefineLocal,
    /// Selector-chain store into local u8 through u8 selectors.
    SetSelLocal,
    /// Push the cell of free variable u8 (for re-capture).
    GetFreePtr,
    /// Push the value of free variable u8.
    GetFree,
    /// Pop into free variable u8.
    SetFree,
    /// Box local slot u8 in place and push the cell.
    GetLocalPtr,
    /// Selector-chain store into free variable u8 through u8 selectors.
    SetSelFree,
    /// Push builtin u8.
    GetBuiltin,
    /// Build a closure from `constants[u16]` binding u8 cells.
    Closure,
    /// Pop an iterable, push a fresh iterator.
    IteratorInit,
    /// Pop an iterator, advance it, push `doğru`/`yanlış`.
    IteratorNext,
    /// Read the current key of the iterator on top (does not pop).
    IteratorKey,
    /// Read the current value of the iterator on top (does not pop).
    IteratorValue,
    /// Pop b, a; push `a <op> b` where u8 is the operator token.
    BinaryOp,
    /// Cooperative yield: exit the dispatch loop gracefully.
    Suspend,
}

impl Opcode {
    /// Mnemonic used by the disassembler.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Const => "CONST",
            Opcode::BComplement => "NEG",
            Opcode::Pop => "POP",
            Opcode::True => "TRUE",
            Opcode::False => "FALSE",
            Opcode::Equal => "EQL",
            Opcode::NotEqual => "NEQ",
            Opcode::Minus => "NEG",
            Opcode::LNot => "NOT",
            Opcode::JumpFalsy => "JMPF",
            Opcode::AndJump => "ANDJMP",
            Opcode::OrJump => "ORJMP",
            Opcode::Jump => "JMP",
            Opcode::Null => "NULL",
            Opcode::Array => "ARR",
            Opcode::Map => "MAP",
            Opcode::Error => "ERROR",
            Opcode::Immutable => "IMMUT",
            Opcode::Index => "INDEX",
            Opcode::SliceIndex => "SLICE",
            Opcode::Call => "CALL",
            Opcode::Return => "RET",
            Opcode::GetGlobal => "GETG",
            Opcode::SetGlobal => "SETG",
            Opcode::SetSelGlobal => "SETSG",
            Opcode::GetLocal => "GETL",
            Opcode::SetLocal => "SETL",
            Opcode::DefineLocal => "DEFL",
            Opcode::SetSelLocal => "SETSL",
            Opcode::GetFreePtr => "GETFP",
            Opcode::GetFree => "GETF",
            Opcode::SetFree => "SETF",
            Opcode::GetLocalPtr => "GETLP",
            Opcode::SetSelFree => "SETSF",
            Opcode::GetBuiltin => "BUILTIN",
            Opcode::Closure => "CLOSURE",
            Opcode::IteratorInit => "ITER",
            Opcode::IteratorNext => "ITNXT",
            Opcode::IteratorKey => "ITKEY",
            Opcode::IteratorValue => "ITVAL",
            Opcode::BinaryOp => "BINARYOP",
            Opcode::Suspend => "SUSPEND",
        }
    }

    /// Operand widths in bytes, in operand order.
    pub fn operand_widths(self) -> &'static [usize] {
        match self {
            Opcode::Const | Opcode::GetGlobal | Opcode::SetGlobal => &[2],
            Opcode::JumpFalsy
            | Opcode::AndJump
            | Opcode::OrJump
            | Opcode::Jump
            | Opcode::Array
            | Opcode::Map => &[2],
            Opcode::SetSelGlobal => &[2, 1],
            Opcode::Call => &[1, 1],
            Opcode::Return
            | Opcode::GetLocal
            | Opcode::SetLocal
            | Opcode::DefineLocal
            | Opcode::GetFreePtr
            | Opcode::GetFree
            | Opcode::SetFree
            | Opcode::GetLocalPtr
            | Opcode::GetBuiltin
            | Opcode::BinaryOp => &[1],
            Opcode::SetSelLocal | Opcode::SetSelFree => &[1, 1],
            Opcode::Closure => &[2, 1],
            _ => &[],
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Opcode, u8> {
        if byte <= Opcode::Suspend as u8 {
            // The enum is dense from 0 to Suspend.
            Ok(unsafe { std::mem::transmute::<u8, Opcode>(byte) })
        } else {
            Err(byte)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instruction helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Assemble one instruction.
pub fn make_instruction(op: Opcode, operands: &[usize]) -> Vec<u8> {
    let widths = op.operand_widths();
    let mut out = Vec::with_capacity(1 + widths.iter().sum::<usize>());
    out.push(op as u8);
    for (operand, width) in operands.iter().zip(widths) {
        match width {
            1 => out.push(*operand as u8),
            2 => out.extend_from_slice(&(*operand as u16).to_be_bytes()),
            _ => unreachable!("unsupported operand width"),
        }
    }
    out
}

/// Decode the operands at `ins` for the given widths.  Returns the operand
/// values and the number of bytes consumed.
pub fn read_operands(widths: &[usize], ins: &[u8]) -> (Vec<usize>, usize) {
    let mut operands = Vec::with_capacity(widths.len());
    let mut offset = 0;
    for width in widths {
        match width {
            1 => operands.push(ins[offset] as usize),
            2 => operands.push(u16::from_be_bytes([ins[offset], ins[offset + 1]]) as usize),
            _ => unreachable!("unsupported operand width"),
        }
        offset += width;
    }
    (operands, offset)
}

/// Disassemble an instruction buffer, one line per instruction.
pub fn format_instructions(ins: &[u8], posoffset: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < ins.len() {
        let op = match Opcode::try_from(ins[i]) {
            Ok(op) => op,
            Err(b) => {
                out.push(format!("{:04} ?{b:#04x}", posoffset + i));
                i += 1;
                continue;
            }
        };
        let (operands, read) = read_operands(op.operand_widths(), &ins[i + 1..]);
        let mut line = format!("{:04} {:<7}", posoffset + i, op.name());
        for operand in &operands {
            let _ = write!(line, " {operand:<5}");
        }
        out.push(line.trim_end().to_string());
        i += 1 + read;
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Bytecode container
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled program: source positions, entry function, constant pool.
#[derive(Debug)]
pub struct Bytecode {
    pub file_set: SourceFileSet,
    pub main_function: Rc<CompiledFunction>,
    pub constants: Vec<Value>,
}

impl Bytecode {
    /// Total number of objects reachable from the constant pool (the
    /// `set_max_const_objects` guard).
    pub fn count_objects(&self) -> usize {
        self.constants.iter().map(count_objects).sum()
    }

    /// Disassembly of the main function.
    pub fn format_instructions(&self) -> Vec<String> {
        format_instructions(&self.main_function.instructions, 0)
    }

    /// Display form of the constant pool, functions expanded.
    pub fn format_constants(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (i, c) in self.constants.iter().enumerate() {
            match c {
                Value::Function(f) => {
                    out.push(format!("[{i:3}] (compiled function)"));
                    for line in format_instructions(&f.instructions, 0) {
                        out.push(format!("     {line}"));
                    }
                }
                other => out.push(format!("[{i:3}] {other} ({})", other.type_name())),
            }
        }
        out
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Constant deduplication
    // ─────────────────────────────────────────────────────────────────────────

    /// Coalesce duplicate constants and rewrite every `CONST`/`CLOSURE`
    /// instruction (in the main function and in all function constants) to
    /// the new indices.
    ///
    /// Identity per category: functions by pointer, builtin-module maps by
    /// `__module_name__`, `Int`/`Float`/`Char`/`String` by value.
    pub fn remove_duplicates(&mut self) {
        let mut deduped: Vec<Value> = Vec::new();
        let mut index_map: FxHashMap<usize, usize> = FxHashMap::default();

        let mut fns: FxHashMap<*const CompiledFunction, usize> = FxHashMap::default();
        let mut ints: FxHashMap<i64, usize> = FxHashMap::default();
        let mut floats: FxHashMap<u64, usize> = FxHashMap::default();
        let mut chars: FxHashMap<char, usize> = FxHashMap::default();
        let mut strings: FxHashMap<String, usize> = FxHashMap::default();
        let mut module_maps: FxHashMap<String, usize> = FxHashMap::default();

        for (cur_idx, c) in self.constants.drain(..).enumerate() {
            let new_idx = match &c {
                Value::Function(f) => match fns.get(&Rc::as_ptr(f)) {
                    Some(&idx) => idx,
                    None => {
                        fns.insert(Rc::as_ptr(f), deduped.len());
                        deduped.push(c.clone());
                        deduped.len() - 1
                    }
                },
                Value::ImmutableMap(m) => {
                    let mod_name = infer_module_name(m).map(str::to_string);
                    match mod_name.as_ref().and_then(|n| module_maps.get(n)) {
                        Some(&idx) => idx,
                        None => {
                            if let Some(name) = mod_name {
                                module_maps.insert(name, deduped.len());
                            }
                            deduped.push(c.clone());
                            deduped.len() - 1
                        }
                    }
                }
                Value::Int(v) => *ints.entry(*v).or_insert_with(|| {
                    deduped.push(c.clone());
                    deduped.len() - 1
                }),
                Value::Float(v) => *floats.entry(v.to_bits()).or_insert_with(|| {
                    deduped.push(c.clone());
                    deduped.len() - 1
                }),
                Value::Char(v) => *chars.entry(*v).or_insert_with(|| {
                    deduped.push(c.clone());
                    deduped.len() - 1
                }),
                Value::Str(s) => *strings.entry(s.value.clone()).or_insert_with(|| {
                    deduped.push(c.clone());
                    deduped.len() - 1
                }),
                other => panic!("invalid constant pool entry: {}", other.type_name()),
            };
            index_map.insert(cur_idx, new_idx);
        }

        self.constants = deduped;

        let main = Rc::make_mut(&mut self.main_function);
        update_const_indexes(Rc::make_mut(&mut main.instructions), &index_map);

        for c in &mut self.constants {
            if let Value::Function(f) = c {
                let f = Rc::make_mut(f);
                update_const_indexes(Rc::make_mut(&mut f.instructions), &index_map);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    /// Serialize to `w`.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), CodecError> {
        w.write_all(MAGIC)?;

        // File set.
        write_u32(w, self.file_set.base)?;
        write_u32(w, self.file_set.files.len() as u32)?;
        for file in &self.file_set.files {
            write_bytes(w, file.name.as_bytes())?;
            write_u32(w, file.size)?;
            let lines = file.lines();
            write_u32(w, lines.len() as u32)?;
            for line in lines {
                write_u32(w, line as u32)?;
            }
        }

        encode_function(w, &self.main_function)?;

        write_u32(w, self.constants.len() as u32)?;
        for c in &self.constants {
            encode_value(w, c)?;
        }
        Ok(())
    }

    /// Deserialize from `r`, rebinding singletons and builtin modules
    /// against `modules`.
    pub fn decode(r: &mut impl Read, modules: &ModuleMap) -> Result<Bytecode, CodecError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(CodecError::Invalid("bad magic".to_string()));
        }

        let base = read_u32(r)?;
        let num_files = read_u32(r)? as usize;
        let mut file_set = SourceFileSet::new();
        for _ in 0..num_files {
            let name = String::from_utf8(read_bytes(r)?)
                .map_err(|_| CodecError::Invalid("file name is not UTF-8".to_string()))?;
            let size = read_u32(r)? as usize;
            let num_lines = read_u32(r)? as usize;
            let mut lines = Vec::with_capacity(num_lines);
            for _ in 0..num_lines {
                lines.push(read_u32(r)? as usize);
            }
            file_set.add_file_with_lines(&name, size, lines);
        }
        file_set.base = base;

        let main_function = Rc::new(decode_function(r)?);

        let num_constants = read_u32(r)? as usize;
        let mut constants = Vec::with_capacity(num_constants);
        for _ in 0..num_constants {
            let v = decode_value(r)?;
            constants.push(fix_decoded(v, modules)?);
        }

        Ok(Bytecode {
            file_set,
            main_function,
            constants,
        })
    }
}

/// Rewrite `CONST` and `CLOSURE` operands through the dedup index map.
fn update_const_indexes(ins: &mut Vec<u8>, index_map: &FxHashMap<usize, usize>) {
    let mut i = 0;
    while i < ins.len() {
        let op = Opcode::try_from(ins[i]).expect("invalid opcode in instruction stream");
        let (operands, read) = read_operands(op.operand_widths(), &ins[i + 1..]);

        match op {
            Opcode::Const => {
                let new_idx = *index_map
                    .get(&operands[0])
                    .unwrap_or_else(|| panic!("constant index not found: {}", operands[0]));
                ins[i + 1..i + 3].copy_from_slice(&(new_idx as u16).to_be_bytes());
            }
            Opcode::Closure => {
                let new_idx = *index_map
                    .get(&operands[0])
                    .unwrap_or_else(|| panic!("constant index not found: {}", operands[0]));
                ins[i + 1..i + 3].copy_from_slice(&(new_idx as u16).to_be_bytes());
            }
            _ => {}
        }
        i += 1 + read;
    }
}

/// Count a value and everything reachable from it.
fn count_objects(v: &Value) -> usize {
    match v {
        Value::Array(a) => 1 + a.borrow().iter().map(count_objects).sum::<usize>(),
        Value::ImmutableArray(a) => 1 + a.iter().map(count_objects).sum::<usize>(),
        Value::Map(m) => 1 + m.borrow().values().map(count_objects).sum::<usize>(),
        Value::ImmutableMap(m) => 1 + m.values().map(count_objects).sum::<usize>(),
        Value::Error(e) => 1 + count_objects(e),
        _ => 1,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec internals
// ─────────────────────────────────────────────────────────────────────────────

const MAGIC: &[u8; 4] = b"LKB1";

/// Codec failure: framing, unsupported values, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid bytecode: {0}")]
    Invalid(String),
}

// Value tags.  Appending is fine; renumbering breaks old files.
const TAG_UNDEFINED: u8 = 0;
const TAG_TRUE: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_CHAR: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_BYTES: u8 = 7;
const TAG_ARRAY: u8 = 8;
const TAG_IMMUTABLE_ARRAY: u8 = 9;
const TAG_MAP: u8 = 10;
const TAG_IMMUTABLE_MAP: u8 = 11;
const TAG_ERROR: u8 = 12;
const TAG_TIME: u8 = 13;
const TAG_FUNCTION: u8 = 14;

fn write_u8(w: &mut impl Write, v: u8) -> Result<(), CodecError> {
    w.write_all(&[v])?;
    Ok(())
}

fn write_u32(w: &mut impl Write, v: u32) -> Result<(), CodecError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

fn write_u64(w: &mut impl Write, v: u64) -> Result<(), CodecError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

fn write_bytes(w: &mut impl Write, b: &[u8]) -> Result<(), CodecError> {
    write_u32(w, b.len() as u32)?;
    w.write_all(b)?;
    Ok(())
}

fn read_u8(r: &mut impl Read) -> Result<u8, CodecError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32, CodecError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64(r: &mut impl Read) -> Result<u64, CodecError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, CodecError> {
    let len = read_u32(r)? as usize;
    let mut b = vec![0u8; len];
    r.read_exact(&mut b)?;
    Ok(b)
}

fn encode_value(w: &mut impl Write, v: &Value) -> Result<(), CodecError> {
    match v {
        Value::Undefined => write_u8(w, TAG_UNDEFINED),
        Value::Bool(true) => write_u8(w, TAG_TRUE),
        Value::Bool(false) => write_u8(w, TAG_FALSE),
        Value::Int(i) => {
            write_u8(w, TAG_INT)?;
            write_u64(w, *i as u64)
        }
        Value::Float(f) => {
            write_u8(w, TAG_FLOAT)?;
            write_u64(w, f.to_bits())
        }
        Value::Char(c) => {
            write_u8(w, TAG_CHAR)?;
            write_u32(w, *c as u32)
        }
        Value::Str(s) => {
            write_u8(w, TAG_STRING)?;
            write_bytes(w, s.value.as_bytes())
        }
        Value::Bytes(b) => {
            write_u8(w, TAG_BYTES)?;
            write_bytes(w, b)
        }
        Value::Array(a) => {
            write_u8(w, TAG_ARRAY)?;
            let items = a.borrow();
            write_u32(w, items.len() as u32)?;
            for item in items.iter() {
                encode_value(w, item)?;
            }
            Ok(())
        }
        Value::ImmutableArray(a) => {
            write_u8(w, TAG_IMMUTABLE_ARRAY)?;
            write_u32(w, a.len() as u32)?;
            for item in a.iter() {
                encode_value(w, item)?;
            }
            Ok(())
        }
        Value::Map(m) => {
            write_u8(w, TAG_MAP)?;
            encode_map_entries(w, &m.borrow())
        }
        Value::ImmutableMap(m) => {
            write_u8(w, TAG_IMMUTABLE_MAP)?;
            encode_map_entries(w, m)
        }
        Value::Error(e) => {
            write_u8(w, TAG_ERROR)?;
            encode_value(w, e)
        }
        Value::Time(t) => {
            write_u8(w, TAG_TIME)?;
            let ns = match t.duration_since(std::time::UNIX_EPOCH) {
                Ok(d) => d.as_nanos() as i64,
                Err(e) => -(e.duration().as_nanos() as i64),
            };
            write_u64(w, ns as u64)
        }
        Value::Function(f) => {
            write_u8(w, TAG_FUNCTION)?;
            encode_function(w, f)
        }
        other => Err(CodecError::Invalid(format!(
            "value of type {} cannot be serialized",
            other.type_name()
        ))),
    }
}

fn encode_map_entries(
    w: &mut impl Write,
    entries: &FxHashMap<String, Value>,
) -> Result<(), CodecError> {
    write_u32(w, entries.len() as u32)?;
    // Sort for a deterministic byte stream.
    let mut keys: Vec<&String> = entries.keys().collect();
    keys.sort();
    for key in keys {
        write_bytes(w, key.as_bytes())?;
        encode_value(w, &entries[key])?;
    }
    Ok(())
}

fn encode_function(w: &mut impl Write, f: &CompiledFunction) -> Result<(), CodecError> {
    if !f.free.is_empty() {
        return Err(CodecError::Invalid(
            "function constant has bound free variables".to_string(),
        ));
    }
    write_bytes(w, &f.instructions)?;
    write_u32(w, f.num_locals as u32)?;
    write_u32(w, f.num_parameters as u32)?;
    write_u8(w, f.var_args as u8)?;
    write_u32(w, f.source_map.len() as u32)?;
    for &(offset, pos) in &f.source_map {
        write_u32(w, offset as u32)?;
        write_u32(w, pos.0)?;
    }
    Ok(())
}

fn decode_value(r: &mut impl Read) -> Result<Value, CodecError> {
    let tag = read_u8(r)?;
    Ok(match tag {
        TAG_UNDEFINED => Value::Undefined,
        TAG_TRUE => Value::Bool(true),
        TAG_FALSE => Value::Bool(false),
        TAG_INT => Value::Int(read_u64(r)? as i64),
        TAG_FLOAT => Value::Float(f64::from_bits(read_u64(r)?)),
        TAG_CHAR => {
            let code = read_u32(r)?;
            Value::Char(
                char::from_u32(code)
                    .ok_or_else(|| CodecError::Invalid(format!("bad char: {code:#x}")))?,
            )
        }
        TAG_STRING => Value::string(
            String::from_utf8(read_bytes(r)?)
                .map_err(|_| CodecError::Invalid("string is not UTF-8".to_string()))?,
        ),
        TAG_BYTES => Value::bytes(read_bytes(r)?),
        TAG_ARRAY | TAG_IMMUTABLE_ARRAY => {
            let len = read_u32(r)? as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_value(r)?);
            }
            if tag == TAG_ARRAY {
                Value::array(items)
            } else {
                Value::ImmutableArray(Rc::new(items))
            }
        }
        TAG_MAP | TAG_IMMUTABLE_MAP => {
            let len = read_u32(r)? as usize;
            let mut entries = FxHashMap::default();
            for _ in 0..len {
                let key = String::from_utf8(read_bytes(r)?)
                    .map_err(|_| CodecError::Invalid("map key is not UTF-8".to_string()))?;
                entries.insert(key, decode_value(r)?);
            }
            if tag == TAG_MAP {
                Value::map(entries)
            } else {
                Value::ImmutableMap(Rc::new(entries))
            }
        }
        TAG_ERROR => Value::error(decode_value(r)?),
        TAG_TIME => {
            let ns = read_u64(r)? as i64;
            let t = if ns >= 0 {
                std::time::UNIX_EPOCH + std::time::Duration::from_nanos(ns as u64)
            } else {
                std::time::UNIX_EPOCH - std::time::Duration::from_nanos(ns.unsigned_abs())
            };
            Value::Time(t)
        }
        TAG_FUNCTION => Value::Function(Rc::new(decode_function(r)?)),
        other => return Err(CodecError::Invalid(format!("unknown value tag: {other}"))),
    })
}

fn decode_function(r: &mut impl Read) -> Result<CompiledFunction, CodecError> {
    let instructions = read_bytes(r)?;
    let num_locals = read_u32(r)? as usize;
    let num_parameters = read_u32(r)? as usize;
    let var_args = read_u8(r)? != 0;
    let num_entries = read_u32(r)? as usize;
    let mut source_map = Vec::with_capacity(num_entries);
    for _ in 0..num_entries {
        let offset = read_u32(r)? as usize;
        let pos = Pos(read_u32(r)?);
        source_map.push((offset, pos));
    }
    Ok(CompiledFunction {
        instructions: Rc::new(instructions),
        num_locals,
        num_parameters,
        var_args,
        source_map,
        free: Vec::new(),
    })
}

/// Post-decode fix-up: rebind builtin modules by `__module_name__` and
/// reject host callables, recursing through containers.
fn fix_decoded(v: Value, modules: &ModuleMap) -> Result<Value, CodecError> {
    match v {
        Value::Array(a) => {
            let items: Result<Vec<Value>, CodecError> = a
                .borrow()
                .iter()
                .map(|item| fix_decoded(item.clone(), modules))
                .collect();
            Ok(Value::array(items?))
        }
        Value::ImmutableArray(a) => {
            let items: Result<Vec<Value>, CodecError> = a
                .iter()
                .map(|item| fix_decoded(item.clone(), modules))
                .collect();
            Ok(Value::ImmutableArray(Rc::new(items?)))
        }
        Value::Map(m) => {
            let entries: Result<FxHashMap<String, Value>, CodecError> = m
                .borrow()
                .iter()
                .map(|(k, item)| Ok((k.clone(), fix_decoded(item.clone(), modules)?)))
                .collect();
            Ok(Value::map(entries?))
        }
        Value::ImmutableMap(m) => {
            if let Some(name) = infer_module_name(&m) {
                if let Some(module) = modules.get_builtin_module(name) {
                    return Ok(module.as_immutable_map(name));
                }
            }
            let mut entries = FxHashMap::default();
            for (k, item) in m.iter() {
                if matches!(item, Value::UserFn(_)) {
                    return Err(CodecError::Invalid(
                        "user function in serialized module".to_string(),
                    ));
                }
                entries.insert(k.clone(), fix_decoded(item.clone(), modules)?);
            }
            Ok(Value::ImmutableMap(Rc::new(entries)))
        }
        other => Ok(other),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn func_with(ins: Vec<u8>) -> Rc<CompiledFunction> {
        Rc::new(CompiledFunction {
            instructions: Rc::new(ins),
            num_locals: 0,
            num_parameters: 0,
            var_args: false,
            source_map: Vec::new(),
            free: Vec::new(),
        })
    }

    #[test]
    fn test_make_and_read_instruction() {
        let ins = make_instruction(Opcode::Const, &[0x1234]);
        assert_eq!(ins, vec![Opcode::Const as u8, 0x12, 0x34]);

        let (operands, read) = read_operands(Opcode::Const.operand_widths(), &ins[1..]);
        assert_eq!(operands, vec![0x1234]);
        assert_eq!(read, 2);

        let ins = make_instruction(Opcode::Closure, &[7, 2]);
        assert_eq!(ins, vec![Opcode::Closure as u8, 0, 7, 2]);

        let ins = make_instruction(Opcode::Call, &[3, 1]);
        assert_eq!(ins, vec![Opcode::Call as u8, 3, 1]);
    }

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0..=Opcode::Suspend as u8 {
            let op = Opcode::try_from(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert!(Opcode::try_from(200).is_err());
    }

    #[test]
    fn test_format_instructions() {
        let mut ins = make_instruction(Opcode::Const, &[1]);
        ins.extend(make_instruction(Opcode::Pop, &[]));
        let lines = format_instructions(&ins, 0);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000 CONST"));
        assert!(lines[1].starts_with("0003 POP"));
    }

    #[test]
    fn test_remove_duplicates_rewrites_indexes() {
        // main: CONST 0; CONST 1; CONST 2; POP
        let mut ins = make_instruction(Opcode::Const, &[0]);
        ins.extend(make_instruction(Opcode::Const, &[1]));
        ins.extend(make_instruction(Opcode::Const, &[2]));
        ins.extend(make_instruction(Opcode::Pop, &[]));

        let mut bc = Bytecode {
            file_set: SourceFileSet::new(),
            main_function: func_with(ins),
            constants: vec![Value::Int(5), Value::string("a"), Value::Int(5)],
        };
        bc.remove_duplicates();

        assert_eq!(bc.constants.len(), 2);
        let lines = bc.format_instructions();
        // Third CONST now points at the deduplicated Int(5) slot 0.
        assert!(lines[0].contains("CONST   0"));
        assert!(lines[1].contains("CONST   1"));
        assert!(lines[2].contains("CONST   0"));
    }

    #[test]
    fn test_dedup_functions_by_identity() {
        let f1 = Value::Function(func_with(make_instruction(Opcode::Null, &[])));
        let f2 = Value::Function(func_with(make_instruction(Opcode::Null, &[])));
        let mut bc = Bytecode {
            file_set: SourceFileSet::new(),
            main_function: func_with(make_instruction(Opcode::Suspend, &[])),
            constants: vec![f1.clone(), f2, f1],
        };
        bc.remove_duplicates();
        // Same pointer deduped, equal-but-distinct function kept.
        assert_eq!(bc.constants.len(), 2);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut ins = make_instruction(Opcode::Const, &[0]);
        ins.extend(make_instruction(Opcode::Pop, &[]));
        ins.extend(make_instruction(Opcode::Suspend, &[]));

        let mut file_set = SourceFileSet::new();
        file_set.add_file("main.lokum", 12);

        let constants = vec![
            Value::Int(-3),
            Value::Float(2.5),
            Value::string("selam"),
            Value::Char('ç'),
            Value::Bool(true),
            Value::Undefined,
            Value::bytes(vec![1, 2, 3]),
            Value::ImmutableArray(Rc::new(vec![Value::Int(1), Value::string("x")])),
            Value::Function(func_with(make_instruction(Opcode::Null, &[]))),
        ];

        let bc = Bytecode {
            file_set,
            main_function: Rc::new(CompiledFunction {
                instructions: Rc::new(ins),
                num_locals: 2,
                num_parameters: 1,
                var_args: true,
                source_map: vec![(0, Pos(1)), (3, Pos(7))],
                free: Vec::new(),
            }),
            constants,
        };

        let mut buf = Vec::new();
        bc.encode(&mut buf).unwrap();
        let decoded = Bytecode::decode(&mut buf.as_slice(), &ModuleMap::new()).unwrap();

        assert_eq!(
            decoded.main_function.instructions,
            bc.main_function.instructions
        );
        assert_eq!(decoded.main_function.num_locals, 2);
        assert_eq!(decoded.main_function.num_parameters, 1);
        assert!(decoded.main_function.var_args);
        assert_eq!(decoded.main_function.source_map, bc.main_function.source_map);
        assert_eq!(decoded.constants.len(), bc.constants.len());
        for (a, b) in decoded.constants.iter().zip(&bc.constants) {
            if !matches!(a, Value::Function(_)) {
                assert!(a.value_equals(b), "mismatch: {a} vs {b}");
            }
        }
        assert_eq!(decoded.file_set.files[0].name, "main.lokum");
    }

    #[test]
    fn test_decode_rebinds_builtin_module() {
        let mut attrs = FxHashMap::default();
        attrs.insert("x".to_string(), Value::Int(1));
        let mut modules = ModuleMap::new();
        modules.add_builtin_module("m", attrs.clone());

        // A stale copy of the module (different attr value).
        let mut stale = attrs;
        stale.insert("x".to_string(), Value::Int(99));
        stale.insert(
            crate::modules::MODULE_NAME_KEY.to_string(),
            Value::string("m"),
        );

        let bc = Bytecode {
            file_set: SourceFileSet::new(),
            main_function: func_with(make_instruction(Opcode::Suspend, &[])),
            constants: vec![Value::ImmutableMap(Rc::new(stale))],
        };
        let mut buf = Vec::new();
        bc.encode(&mut buf).unwrap();
        let decoded = Bytecode::decode(&mut buf.as_slice(), &modules).unwrap();

        match &decoded.constants[0] {
            Value::ImmutableMap(m) => {
                // Rebound to the registry's current attributes.
                assert!(m.get("x").unwrap().value_equals(&Value::Int(1)));
            }
            other => panic!("expected immutable map, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_encode_rejects_host_functions() {
        let bc = Bytecode {
            file_set: SourceFileSet::new(),
            main_function: func_with(make_instruction(Opcode::Suspend, &[])),
            constants: vec![Value::user_function("h", |_| Ok(Value::Undefined))],
        };
        let mut buf = Vec::new();
        assert!(bc.encode(&mut buf).is_err());
    }

    #[test]
    fn test_count_objects() {
        let bc = Bytecode {
            file_set: SourceFileSet::new(),
            main_function: func_with(Vec::new()),
            constants: vec![
                Value::Int(1),
                Value::array(vec![Value::Int(2), Value::Int(3)]),
            ],
        };
        assert_eq!(bc.count_objects(), 4);
    }
}
