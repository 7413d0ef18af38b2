//! The stack-based virtual machine.
//!
//! The VM executes a [`Bytecode`] against a caller-provided global slot
//! array.  One flat operand stack of [`STACK_SIZE`](crate::STACK_SIZE) is
//! shared by all call frames; each [`Frame`] records its function, its
//! instruction pointer, and the base pointer where its locals start.
//!
//! # Captured locals
//!
//! A local slot normally holds its value directly.  When a closure captures
//! it, `GETLP` boxes the slot in place: the slot then holds the shared cell
//! and every local read/write (`GETL`/`SETL`/`DEFL`) dereferences it, so
//! mutations are visible on both sides of the capture.
//!
//! # Cancellation
//!
//! [`AbortFlag`] is a clonable atomic handle; any thread may trip it and the
//! dispatch loop observes it on the next instruction boundary, surfacing
//! [`RuntimeError::Cancelled`].  `SUSPEND` ends the loop gracefully instead
//! (it terminates the main function and lets the host re-enter).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bytecode::{Bytecode, Opcode};
use crate::position::{Pos, SourceFilePos};
use crate::token::Token;
use crate::value::{CompiledFunction, RuntimeError, Value, FALSE, TRUE};
use crate::{MAX_FRAMES, STACK_SIZE};

// ─────────────────────────────────────────────────────────────────────────────
// Errors and cancellation
// ─────────────────────────────────────────────────────────────────────────────

/// A runtime error with the source position of the failing statement.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Runtime Error: {error}\n\tat {pos}")]
pub struct VmError {
    pub error: RuntimeError,
    pub pos: SourceFilePos,
}

/// Clonable cooperative-abort handle.  Tripping it makes the VM return
/// [`RuntimeError::Cancelled`] at the next instruction boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> AbortFlag {
        AbortFlag::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame
// ─────────────────────────────────────────────────────────────────────────────

/// One call activation: the function, its instruction pointer, and the stack
/// index where its locals begin.
struct Frame {
    func: Rc<CompiledFunction>,
    ip: usize,
    bp: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Vm
// ─────────────────────────────────────────────────────────────────────────────

/// The virtual machine.  Construct one per run with [`Vm::new`].
pub struct Vm<'a> {
    bytecode: &'a Bytecode,
    globals: &'a mut [Value],
    stack: Vec<Value>,
    sp: usize,
    frames: Vec<Frame>,
    /// Remaining allocation budget plus one; 0 on creation disables nothing,
    /// reaching exactly 0 by decrement raises the limit error.
    allocs: i64,
    abort: AbortFlag,
    /// Offset of the opcode currently executing (for error positions).
    curr_ip: usize,
}

impl<'a> Vm<'a> {
    /// Create a VM over `bytecode` and `globals`.  A negative `max_allocs`
    /// disables the allocation budget.
    pub fn new(bytecode: &'a Bytecode, globals: &'a mut [Value], max_allocs: i64) -> Vm<'a> {
        Vm {
            bytecode,
            globals,
            stack: vec![Value::Undefined; STACK_SIZE],
            sp: 0,
            frames: Vec::with_capacity(64),
            allocs: max_allocs + 1,
            abort: AbortFlag::new(),
            curr_ip: 0,
        }
    }

    /// The VM's abort handle; clone it into another thread to cancel.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Replace the abort handle (used when the host owns the flag).
    pub fn set_abort_flag(&mut self, flag: AbortFlag) {
        self.abort = flag;
    }

    /// Execute the main function to completion, `SUSPEND`, or error.
    pub fn run(&mut self) -> Result<(), VmError> {
        self.frames.push(Frame {
            func: Rc::clone(&self.bytecode.main_function),
            ip: 0,
            bp: 0,
        });
        self.sp = 0;
        self.dispatch().map_err(|error| self.located(error))
    }

    fn located(&self, error: RuntimeError) -> VmError {
        let pos = self
            .frames
            .last()
            .map(|f| f.func.source_pos(self.curr_ip))
            .unwrap_or(Pos::NONE);
        VmError {
            error,
            pos: self.bytecode.file_set.position(pos),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch loop
    // ─────────────────────────────────────────────────────────────────────────

    fn dispatch(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.abort.is_aborted() {
                return Err(RuntimeError::Cancelled);
            }

            let op = {
                let frame = self.frames.last_mut().expect("no active frame");
                if frame.ip >= frame.func.instructions.len() {
                    return Ok(());
                }
                self.curr_ip = frame.ip;
                let byte = frame.func.instructions[frame.ip];
                frame.ip += 1;
                Opcode::try_from(byte)
                    .map_err(|b| RuntimeError::Message(format!("unknown opcode: {b:#04x}")))?
            };

            match op {
                Opcode::Const => {
                    let idx = self.read_u16();
                    let value = self.bytecode.constants[idx].clone();
                    self.push(value)?;
                }
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::True => self.push(TRUE)?,
                Opcode::False => self.push(FALSE)?,
                Opcode::Null => self.push(Value::Undefined)?,

                Opcode::Equal => {
                    let (a, b) = self.pop2();
                    self.push(Value::Bool(a.value_equals(&b)))?;
                }
                Opcode::NotEqual => {
                    let (a, b) = self.pop2();
                    self.push(Value::Bool(!a.value_equals(&b)))?;
                }
                Opcode::Minus => {
                    let a = self.pop();
                    let value = match a {
                        Value::Int(v) => Value::Int(v.wrapping_neg()),
                        Value::Float(v) => Value::Float(-v),
                        _ => return Err(RuntimeError::InvalidOperator),
                    };
                    self.push(value)?;
                }
                Opcode::BComplement => {
                    let a = self.pop();
                    let value = match a {
                        Value::Int(v) => Value::Int(!v),
                        _ => return Err(RuntimeError::InvalidOperator),
                    };
                    self.push(value)?;
                }
                Opcode::LNot => {
                    let a = self.pop();
                    self.push(Value::Bool(a.is_falsy()))?;
                }
                Opcode::BinaryOp => {
                    let tok_byte = self.read_u8();
                    let tok = Token::from_byte(tok_byte as u8)
                        .ok_or(RuntimeError::InvalidOperator)?;
                    let (a, b) = self.pop2();
                    let value = a.binary_op(tok, &b)?;
                    self.count_alloc()?;
                    self.push(value)?;
                }

                Opcode::JumpFalsy => {
                    let target = self.read_u16();
                    let cond = self.pop();
                    if cond.is_falsy() {
                        self.frames.last_mut().unwrap().ip = target;
                    }
                }
                Opcode::AndJump => {
                    let target = self.read_u16();
                    if self.stack[self.sp - 1].is_falsy() {
                        self.frames.last_mut().unwrap().ip = target;
                    } else {
                        self.sp -= 1;
                    }
                }
                Opcode::OrJump => {
                    let target = self.read_u16();
                    if self.stack[self.sp - 1].is_falsy() {
                        self.sp -= 1;
                    } else {
                        self.frames.last_mut().unwrap().ip = target;
                    }
                }
                Opcode::Jump => {
                    let target = self.read_u16();
                    self.frames.last_mut().unwrap().ip = target;
                }

                Opcode::Array => {
                    let n = self.read_u16();
                    let items = self.stack[self.sp - n..self.sp].to_vec();
                    self.sp -= n;
                    self.count_alloc()?;
                    self.push(Value::array(items))?;
                }
                Opcode::Map => {
                    let n = self.read_u16();
                    let mut entries = rustc_hash::FxHashMap::default();
                    let base = self.sp - n;
                    for i in (0..n).step_by(2) {
                        let key = match &self.stack[base + i] {
                            Value::Str(s) => s.value.clone(),
                            other => other.to_string(),
                        };
                        entries.insert(key, self.stack[base + i + 1].clone());
                    }
                    self.sp = base;
                    self.count_alloc()?;
                    self.push(Value::map(entries))?;
                }
                Opcode::Error => {
                    let value = self.pop();
                    self.count_alloc()?;
                    self.push(Value::error(value))?;
                }
                Opcode::Immutable => {
                    let value = self.pop();
                    let frozen = match value {
                        Value::Array(a) => {
                            self.count_alloc()?;
                            Value::ImmutableArray(Rc::new(a.borrow().clone()))
                        }
                        Value::Map(m) => {
                            self.count_alloc()?;
                            Value::ImmutableMap(Rc::new(m.borrow().clone()))
                        }
                        other => other,
                    };
                    self.push(frozen)?;
                }

                Opcode::Index => {
                    let index = self.pop();
                    let recv = self.pop();
                    let value = recv.index_get(&index)?;
                    self.push(value)?;
                }
                Opcode::SliceIndex => {
                    let high = self.pop();
                    let low = self.pop();
                    let recv = self.pop();
                    let value = self.slice_value(recv, low, high)?;
                    self.count_alloc()?;
                    self.push(value)?;
                }

                Opcode::Call => {
                    let num_args = self.read_u8();
                    let spread = self.read_u8();
                    self.call_value(num_args, spread != 0)?;
                }
                Opcode::Return => {
                    let has_value = self.read_u8();
                    let ret = if has_value == 1 {
                        self.pop()
                    } else {
                        Value::Undefined
                    };
                    let frame = self.frames.pop().expect("return without frame");
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.sp = frame.bp - 1;
                    self.push(ret)?;
                }

                Opcode::GetGlobal => {
                    let idx = self.read_u16();
                    let value = self.globals[idx].clone();
                    self.push(value)?;
                }
                Opcode::SetGlobal => {
                    let idx = self.read_u16();
                    self.globals[idx] = self.pop();
                }
                Opcode::SetSelGlobal => {
                    let idx = self.read_u16();
                    let num_sel = self.read_u8();
                    let root = self.globals[idx].clone();
                    self.selector_assign(root, num_sel)?;
                }

                Opcode::GetLocal => {
                    let idx = self.read_u8();
                    let bp = self.frames.last().unwrap().bp;
                    let value = match &self.stack[bp + idx] {
                        Value::Ptr(cell) => cell.borrow().clone(),
                        other => other.clone(),
                    };
                    self.push(value)?;
                }
                Opcode::SetLocal | Opcode::DefineLocal => {
                    let idx = self.read_u8();
                    let bp = self.frames.last().unwrap().bp;
                    let value = self.pop();
                    // Captured slots hold their cell; write through it.
                    if let Value::Ptr(cell) = &self.stack[bp + idx] {
                        *cell.borrow_mut() = value;
                    } else {
                        self.stack[bp + idx] = value;
                    }
                }
                Opcode::SetSelLocal => {
                    let idx = self.read_u8();
                    let num_sel = self.read_u8();
                    let bp = self.frames.last().unwrap().bp;
                    let root = match &self.stack[bp + idx] {
                        Value::Ptr(cell) => cell.borrow().clone(),
                        other => other.clone(),
                    };
                    self.selector_assign(root, num_sel)?;
                }
                Opcode::GetLocalPtr => {
                    let idx = self.read_u8();
                    let bp = self.frames.last().unwrap().bp;
                    let cell = match &self.stack[bp + idx] {
                        Value::Ptr(cell) => Rc::clone(cell),
                        other => {
                            let cell = Rc::new(RefCell::new(other.clone()));
                            self.stack[bp + idx] = Value::Ptr(Rc::clone(&cell));
                            cell
                        }
                    };
                    self.push(Value::Ptr(cell))?;
                }

                Opcode::GetFree => {
                    let idx = self.read_u8();
                    let value = self.frames.last().unwrap().func.free[idx].borrow().clone();
                    self.push(value)?;
                }
                Opcode::SetFree => {
                    let idx = self.read_u8();
                    let value = self.pop();
                    *self.frames.last().unwrap().func.free[idx].borrow_mut() = value;
                }
                Opcode::GetFreePtr => {
                    let idx = self.read_u8();
                    let cell = Rc::clone(&self.frames.last().unwrap().func.free[idx]);
                    self.push(Value::Ptr(cell))?;
                }
                Opcode::SetSelFree => {
                    let idx = self.read_u8();
                    let num_sel = self.read_u8();
                    let root = self.frames.last().unwrap().func.free[idx].borrow().clone();
                    self.selector_assign(root, num_sel)?;
                }

                Opcode::GetBuiltin => {
                    let idx = self.read_u8();
                    self.push(Value::Builtin(&crate::builtins::BUILTINS[idx]))?;
                }

                Opcode::Closure => {
                    let const_idx = self.read_u16();
                    let num_free = self.read_u8();
                    let func = match &self.bytecode.constants[const_idx] {
                        Value::Function(f) => Rc::clone(f),
                        other => {
                            return Err(RuntimeError::Message(format!(
                                "closure over non-function: {}",
                                other.type_name()
                            )))
                        }
                    };
                    let mut free = Vec::with_capacity(num_free);
                    for i in 0..num_free {
                        match &self.stack[self.sp - num_free + i] {
                            Value::Ptr(cell) => free.push(Rc::clone(cell)),
                            other => {
                                return Err(RuntimeError::Message(format!(
                                    "closure capture is not a cell: {}",
                                    other.type_name()
                                )))
                            }
                        }
                    }
                    self.sp -= num_free;
                    let closure = CompiledFunction {
                        instructions: Rc::clone(&func.instructions),
                        num_locals: func.num_locals,
                        num_parameters: func.num_parameters,
                        var_args: func.var_args,
                        source_map: func.source_map.clone(),
                        free,
                    };
                    self.count_alloc()?;
                    self.push(Value::Function(Rc::new(closure)))?;
                }

                Opcode::IteratorInit => {
                    let value = self.pop();
                    let iterator = value.iterate().ok_or_else(|| {
                        RuntimeError::Message(format!("not iterable: {}", value.type_name()))
                    })?;
                    self.count_alloc()?;
                    self.push(iterator)?;
                }
                Opcode::IteratorNext => {
                    let iterator = self.pop();
                    let more = match &iterator {
                        Value::ArrayIter(it) => it.borrow_mut().next(),
                        Value::BytesIter(it) => it.borrow_mut().next(),
                        Value::MapIter(it) => it.borrow_mut().next(),
                        Value::StrIter(it) => it.borrow_mut().next(),
                        Value::Undefined => false,
                        other => {
                            return Err(RuntimeError::Message(format!(
                                "not an iterator: {}",
                                other.type_name()
                            )))
                        }
                    };
                    self.push(Value::Bool(more))?;
                }
                Opcode::IteratorKey => {
                    let iterator = self.pop();
                    let key = match &iterator {
                        Value::ArrayIter(it) => it.borrow().key(),
                        Value::BytesIter(it) => it.borrow().key(),
                        Value::MapIter(it) => it.borrow().key(),
                        Value::StrIter(it) => it.borrow().key(),
                        _ => Value::Undefined,
                    };
                    self.push(key)?;
                }
                Opcode::IteratorValue => {
                    let iterator = self.pop();
                    let value = match &iterator {
                        Value::ArrayIter(it) => it.borrow().value(),
                        Value::BytesIter(it) => it.borrow().value(),
                        Value::MapIter(it) => it.borrow().value(),
                        Value::StrIter(it) => it.borrow().value(),
                        _ => Value::Undefined,
                    };
                    self.push(value)?;
                }

                Opcode::Suspend => return Ok(()),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────────────────

    fn call_value(&mut self, num_args: usize, spread: bool) -> Result<(), RuntimeError> {
        let mut num_args = num_args;

        if spread {
            // The last argument must be an array; expand it in place.
            let last = self.pop();
            let items = match last {
                Value::Array(a) => a.borrow().clone(),
                Value::ImmutableArray(a) => a.as_ref().clone(),
                other => {
                    return Err(RuntimeError::Message(format!(
                        "cannot spread: not an array: {}",
                        other.type_name()
                    )))
                }
            };
            num_args = num_args - 1 + items.len();
            for item in items {
                self.push(item)?;
            }
        }

        let callee = self.stack[self.sp - 1 - num_args].clone();
        match callee {
            Value::Function(func) => self.call_function(func, num_args),
            Value::Builtin(builtin) => {
                let args = self.stack[self.sp - num_args..self.sp].to_vec();
                self.sp -= num_args + 1;
                let result = (builtin.func)(&args)?;
                self.push(result)
            }
            Value::UserFn(user) => {
                let args = self.stack[self.sp - num_args..self.sp].to_vec();
                self.sp -= num_args + 1;
                let result = (user.func)(&args)?;
                self.push(result)
            }
            other => Err(RuntimeError::NotCallable {
                type_name: other.type_name(),
            }),
        }
    }

    fn call_function(
        &mut self,
        func: Rc<CompiledFunction>,
        mut num_args: usize,
    ) -> Result<(), RuntimeError> {
        if func.var_args {
            // The last parameter collects every excess argument.
            let num_fixed = func.num_parameters - 1;
            if num_args < num_fixed {
                return Err(RuntimeError::WrongArity {
                    want: format!(">={num_fixed}"),
                    got: num_args,
                });
            }
            let num_rest = num_args - num_fixed;
            let rest = self.stack[self.sp - num_rest..self.sp].to_vec();
            self.sp -= num_rest;
            self.count_alloc()?;
            self.push(Value::array(rest))?;
            num_args = num_fixed + 1;
        }

        if num_args != func.num_parameters {
            return Err(RuntimeError::WrongArity {
                want: func.num_parameters.to_string(),
                got: num_args,
            });
        }

        if self.frames.len() >= MAX_FRAMES {
            return Err(RuntimeError::FramesExceeded);
        }

        let bp = self.sp - func.num_parameters;
        let new_sp = bp + func.num_locals;
        if new_sp >= STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }
        // Locals beyond the parameters start out undefined; stale stack
        // contents (including old capture cells) must not leak in.
        for slot in &mut self.stack[self.sp..new_sp] {
            *slot = Value::Undefined;
        }
        self.sp = new_sp;

        self.frames.push(Frame { func, ip: 0, bp });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Selector-chain assignment
    // ─────────────────────────────────────────────────────────────────────────

    /// Pop `num_sel` selectors plus the value below them and assign
    /// `root[sel0][sel1]…[selN-1] = value`.
    fn selector_assign(&mut self, root: Value, num_sel: usize) -> Result<(), RuntimeError> {
        let base = self.sp - num_sel;
        let value = self.stack[base - 1].clone();
        let mut dst = root;
        for i in 0..num_sel - 1 {
            dst = dst.index_get(&self.stack[base + i])?;
        }
        let result = dst.index_set(&self.stack[base + num_sel - 1], value);
        self.sp = base - 1;
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Slicing
    // ─────────────────────────────────────────────────────────────────────────

    fn slice_value(&self, recv: Value, low: Value, high: Value) -> Result<Value, RuntimeError> {
        let low_idx = match low {
            Value::Undefined => 0,
            Value::Int(v) => v,
            _ => return Err(RuntimeError::InvalidIndexType),
        };

        fn bounds(low: i64, high: i64, len: usize) -> Result<(usize, usize), RuntimeError> {
            let n = len as i64;
            if low > high || low < 0 || low > n || high < 0 || high > n {
                return Err(RuntimeError::IndexOutOfBounds);
            }
            Ok((low as usize, high as usize))
        }

        fn high_idx(high: Value, len: usize) -> Result<i64, RuntimeError> {
            match high {
                Value::Undefined => Ok(len as i64),
                Value::Int(v) => Ok(v),
                _ => Err(RuntimeError::InvalidIndexType),
            }
        }

        match recv {
            Value::Array(a) => {
                let items = a.borrow();
                let (lo, hi) = bounds(low_idx, high_idx(high, items.len())?, items.len())?;
                Ok(Value::array(items[lo..hi].to_vec()))
            }
            Value::ImmutableArray(items) => {
                let (lo, hi) = bounds(low_idx, high_idx(high, items.len())?, items.len())?;
                Ok(Value::array(items[lo..hi].to_vec()))
            }
            Value::Str(s) => {
                let chars = s.chars();
                let (lo, hi) = bounds(low_idx, high_idx(high, chars.len())?, chars.len())?;
                Ok(Value::string(chars[lo..hi].iter().collect::<String>()))
            }
            Value::Bytes(b) => {
                let (lo, hi) = bounds(low_idx, high_idx(high, b.len())?, b.len())?;
                Ok(Value::bytes(b[lo..hi].to_vec()))
            }
            other => Err(RuntimeError::Message(format!(
                "not sliceable: {}",
                other.type_name()
            ))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stack and operand plumbing
    // ─────────────────────────────────────────────────────────────────────────

    fn read_u8(&mut self) -> usize {
        let frame = self.frames.last_mut().unwrap();
        let v = frame.func.instructions[frame.ip];
        frame.ip += 1;
        v as usize
    }

    fn read_u16(&mut self) -> usize {
        let frame = self.frames.last_mut().unwrap();
        let ins = &frame.func.instructions;
        let v = u16::from_be_bytes([ins[frame.ip], ins[frame.ip + 1]]);
        frame.ip += 2;
        v as usize
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.sp >= STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.sp -= 1;
        std::mem::replace(&mut self.stack[self.sp], Value::Undefined)
    }

    fn pop2(&mut self) -> (Value, Value) {
        let b = self.pop();
        let a = self.pop();
        (a, b)
    }

    fn count_alloc(&mut self) -> Result<(), RuntimeError> {
        self.allocs -= 1;
        if self.allocs == 0 {
            return Err(RuntimeError::ObjectAllocLimit);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::modules::ModuleMap;
    use crate::parser::parse_source;
    use crate::position::SourceFileSet;
    use crate::symbol_table::SymbolScope;
    use crate::GLOBALS_SIZE;

    /// Compile and run `src`; return a lookup from global names to final
    /// values.
    fn run_src(src: &str) -> Result<impl Fn(&str) -> Value, VmError> {
        run_src_with(src, ModuleMap::new(), -1)
    }

    fn run_src_with(
        src: &str,
        modules: ModuleMap,
        max_allocs: i64,
    ) -> Result<impl Fn(&str) -> Value, VmError> {
        let mut file_set = SourceFileSet::new();
        let file = parse_source(&mut file_set, "test", src.as_bytes()).expect("parse failed");
        let mut compiler = Compiler::new(file_set, None, Vec::new(), modules);
        compiler.compile(&file).expect("compile failed");
        let (mut bytecode, mut symbol_table) = compiler.bytecode();
        bytecode.remove_duplicates();

        let mut globals = vec![Value::Undefined; GLOBALS_SIZE];
        Vm::new(&bytecode, &mut globals, max_allocs).run()?;

        let mut by_name = rustc_hash::FxHashMap::default();
        for name in symbol_table.names() {
            if let Some((symbol, _)) = symbol_table.resolve(&name, false) {
                let s = symbol.borrow();
                if s.scope == SymbolScope::Global {
                    by_name.insert(name.clone(), globals[s.index].clone());
                }
            }
        }
        Ok(move |name: &str| by_name.get(name).cloned().unwrap_or(Value::Undefined))
    }

    fn expect_int(src: &str, name: &str, want: i64) {
        let globals = run_src(src).expect("run failed");
        let got = globals(name);
        assert!(
            got.value_equals(&Value::Int(want)),
            "{name} = {got}, want {want} (src: {src})"
        );
    }

    #[test]
    fn test_arithmetic() {
        expect_int("x := 1 + 2 * 3", "x", 7);
        expect_int("x := (1 + 2) * 3", "x", 9);
        expect_int("x := 10 / 3", "x", 3);
        expect_int("x := -7 % 3", "x", -1);
        expect_int("x := 1 << 4", "x", 16);
        expect_int("x := 12 &^ 10", "x", 4);
        expect_int("x := ^0", "x", -1);
    }

    #[test]
    fn test_comparisons_and_logic() {
        expect_int("x := 3 > 2 ? 1 : 0", "x", 1);
        expect_int("x := 2 >= 3 ? 1 : 0", "x", 0);
        expect_int("x := doğru && yanlış ? 1 : 0", "x", 0);
        expect_int("x := yanlış || doğru ? 1 : 0", "x", 1);
        // Short-circuit keeps the deciding operand as the result.
        expect_int("x := 0 && 5", "x", 0);
        expect_int("x := 0 || 5", "x", 5);
    }

    #[test]
    fn test_if_else_chain() {
        expect_int(
            "a := 5; x := 0; eğer a < 3 { x = 1 } yoksa eğer a < 10 { x = 2 } yoksa { x = 3 }",
            "x",
            2,
        );
    }

    #[test]
    fn test_for_loop() {
        expect_int("s := 0; tekrarla i := 0; i < 5; i++ { s += i }", "s", 10);
        expect_int(
            "s := 0; tekrarla i := 0; i < 10; i++ { eğer i == 3 { dur }; s += i }",
            "s",
            3,
        );
        expect_int(
            "s := 0; tekrarla i := 0; i < 5; i++ { eğer i % 2 == 0 { devam }; s += i }",
            "s",
            4,
        );
    }

    #[test]
    fn test_for_in_array() {
        expect_int("s := 0; tekrarla i in aralık(0, 5) { s = s + i }", "s", 10);
        expect_int(
            "s := 0; tekrarla _, v in [10, 20, 30] { s += v }",
            "s",
            60,
        );
    }

    #[test]
    fn test_for_in_map_visits_each_key_once() {
        expect_int(
            "n := 0; s := 0; tekrarla k, v in {a: 1, b: 2, c: 3} { n++; s += v }",
            "n",
            3,
        );
        expect_int(
            "s := 0; tekrarla k, v in {a: 1, b: 2, c: 3} { s += v }",
            "s",
            6,
        );
    }

    #[test]
    fn test_functions_and_calls() {
        expect_int("f := fn(a, b) { dön a + b }; x := f(2, 3)", "x", 5);
        expect_int("f := fn() {}; x := f() == tanımsız ? 1 : 0", "x", 1);
    }

    #[test]
    fn test_variadic_and_spread() {
        expect_int(
            "f := fn(a, ...rest) { dön a + uzunluk(rest) }; x := f(10, 1, 2, 3)",
            "x",
            13,
        );
        expect_int(
            "f := fn(a, ...rest) { dön uzunluk(rest) }; x := f(1)",
            "x",
            0,
        );
        expect_int(
            "f := fn(a, b, c) { dön a + b + c }; args := [1, 2, 3]; x := f(args...)",
            "x",
            6,
        );
    }

    #[test]
    fn test_wrong_arity() {
        let err = run_src("f := fn(a) { dön a }; f(1, 2)").err().unwrap();
        assert!(matches!(err.error, RuntimeError::WrongArity { .. }));
    }

    #[test]
    fn test_closure_counter() {
        let src = "
            make_counter := fn() { c := 0; dön fn() { c = c + 1; dön c } }
            ctr := make_counter()
            r1 := ctr()
            r2 := ctr()
            r3 := ctr()
            diğer := make_counter()
            r4 := diğer()
        ";
        let globals = run_src(src).expect("run failed");
        assert!(globals("r1").value_equals(&Value::Int(1)));
        assert!(globals("r2").value_equals(&Value::Int(2)));
        assert!(globals("r3").value_equals(&Value::Int(3)));
        // A fresh counter starts over.
        assert!(globals("r4").value_equals(&Value::Int(1)));
    }

    #[test]
    fn test_closure_sharing_both_directions() {
        let src = "
            x := 0
            kapan := tanımsız
            kur := fn() {
                y := 10
                kapan = fn() { y += 1; dön y }
                y = 20
                dön kapan()
            }
            ilk := kur()
            iki := kapan()
        ";
        let globals = run_src(src).expect("run failed");
        // Outer mutation (y = 20) is visible inside the closure…
        assert!(globals("ilk").value_equals(&Value::Int(21)));
        // …and the closure's mutation persists after the frame is gone.
        assert!(globals("iki").value_equals(&Value::Int(22)));
    }

    #[test]
    fn test_local_recursion_through_cell() {
        let src = "
            wrap := fn() {
                fakt := fn(n) { eğer n == 0 { dön 1 }; dön n * fakt(n - 1) }
                dön fakt(5)
            }
            x := wrap()
        ";
        expect_int(src, "x", 120);
    }

    #[test]
    fn test_shadowing_initializer_sees_outer() {
        // The shadowing `x :=` reads the outer x in its own initializer.
        let src = "y := 0; x := 10; eğer doğru { x := x + 1; y = x }";
        expect_int(src, "y", 11);
    }

    #[test]
    fn test_string_indexing_and_concat() {
        expect_int("s := \"aşk\"; x := s[1] == 'ş' ? 1 : 0", "x", 1);
        expect_int("s := \"ab\" + 1; x := s == \"ab1\" ? 1 : 0", "x", 1);
        expect_int("s := \"abcd\"[1:3]; x := s == \"bc\" ? 1 : 0", "x", 1);
    }

    #[test]
    fn test_index_and_slice_edges() {
        expect_int("a := [1, 2]; x := a[5] == tanımsız ? 1 : 0", "x", 1);
        expect_int("a := [1, 2, 3]; x := uzunluk(a[1:])", "x", 2);
        expect_int("a := [1, 2, 3]; x := uzunluk(a[:0])", "x", 0);

        let err = run_src("a := [1]; a[3] = 5").err().unwrap();
        assert_eq!(err.error, RuntimeError::IndexOutOfBounds);
    }

    #[test]
    fn test_selector_chain_assignment() {
        expect_int("m := {a: {b: 0}}; m.a.b = 7; x := m.a.b", "x", 7);
        expect_int("m := {v: [1, 2]}; m.v[1] = 9; x := m.v[1]", "x", 9);
        expect_int("m := {c: 1}; m.c += 4; x := m.c", "x", 5);
    }

    #[test]
    fn test_immutable_map_rejects_write() {
        let err = run_src("m := sabit({a: 1}); m[\"a\"] = 2").err().unwrap();
        assert_eq!(err.error, RuntimeError::NotIndexAssignable);
        // Reads still work.
        expect_int("m := sabit({a: 1}); x := m.a", "x", 1);
    }

    #[test]
    fn test_error_values_flow() {
        let src = "e := hata(\"kötü\"); x := e == e ? 1 : 0; v := e.value";
        let globals = run_src(src).expect("run failed");
        assert!(globals("x").value_equals(&Value::Int(1)));
        assert!(globals("v").value_equals(&Value::string("kötü")));
    }

    #[test]
    fn test_division_by_zero_halts() {
        let err = run_src("a := 0; x := 1 / a").err().unwrap();
        assert_eq!(err.error, RuntimeError::DivisionByZero);
        // The error carries a source position.
        assert!(err.pos.is_valid());
    }

    #[test]
    fn test_integer_overflow_wraps() {
        let src = format!("x := {} + 1", i64::MAX);
        let globals = run_src(&src).expect("run failed");
        assert!(globals("x").value_equals(&Value::Int(i64::MIN)));
    }

    #[test]
    fn test_source_module_import() {
        let mut modules = ModuleMap::new();
        modules.add_source_module("x", "paylaş {add: fn(a, b) { dön a + b }}".as_bytes());
        let globals =
            run_src_with("t := kullan(\"x\").add(2, 3)", modules, -1).expect("run failed");
        assert!(globals("t").value_equals(&Value::Int(5)));
    }

    #[test]
    fn test_builtin_module_import() {
        let mut attrs = rustc_hash::FxHashMap::default();
        attrs.insert("sabit_deger".to_string(), Value::Int(42));
        let mut modules = ModuleMap::new();
        modules.add_builtin_module("m", attrs);
        let globals =
            run_src_with("x := kullan(\"m\").sabit_deger", modules, -1).expect("run failed");
        assert!(globals("x").value_equals(&Value::Int(42)));
    }

    #[test]
    fn test_allocation_budget() {
        let err = run_src_with(
            "tekrarla i := 0; i < 10000; i++ { a := [i] }",
            ModuleMap::new(),
            16,
        )
        .err().unwrap();
        assert_eq!(err.error, RuntimeError::ObjectAllocLimit);
    }

    #[test]
    fn test_frames_limit() {
        let err = run_src("f := fn(n) { dön f(n + 1) }; f(0)").err().unwrap();
        assert!(matches!(
            err.error,
            RuntimeError::FramesExceeded | RuntimeError::StackOverflow
        ));
    }

    #[test]
    fn test_not_callable() {
        let err = run_src("x := 1; x()").err().unwrap();
        assert!(matches!(err.error, RuntimeError::NotCallable { .. }));
    }

    #[test]
    fn test_abort_from_another_thread() {
        use std::time::Duration;

        let src = "tekrarla { }";
        let mut file_set = SourceFileSet::new();
        let file = parse_source(&mut file_set, "test", src.as_bytes()).unwrap();
        let mut compiler = Compiler::new(file_set, None, Vec::new(), ModuleMap::new());
        compiler.compile(&file).unwrap();
        let (bytecode, _) = compiler.bytecode();

        let mut globals = vec![Value::Undefined; GLOBALS_SIZE];
        let mut vm = Vm::new(&bytecode, &mut globals, -1);
        let flag = vm.abort_flag();

        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            flag.abort();
        });
        let err = vm.run().unwrap_err();
        killer.join().unwrap();
        assert_eq!(err.error, RuntimeError::Cancelled);
    }

    #[test]
    fn test_dedup_preserves_behavior() {
        let src = "a := 1 + 1; b := 1 + 1; c := \"s\" + \"s\"; d := a + b";
        // Without dedup.
        let mut file_set = SourceFileSet::new();
        let file = parse_source(&mut file_set, "test", src.as_bytes()).unwrap();
        let mut compiler = Compiler::new(file_set, None, Vec::new(), ModuleMap::new());
        compiler.compile(&file).unwrap();
        let (bytecode, mut table) = compiler.bytecode();

        let mut plain = vec![Value::Undefined; GLOBALS_SIZE];
        Vm::new(&bytecode, &mut plain, -1).run().unwrap();

        // With dedup.
        let mut deduped_bc = bytecode;
        deduped_bc.remove_duplicates();
        let mut deduped = vec![Value::Undefined; GLOBALS_SIZE];
        Vm::new(&deduped_bc, &mut deduped, -1).run().unwrap();

        for name in table.names() {
            if let Some((symbol, _)) = table.resolve(&name, false) {
                let s = symbol.borrow();
                if s.scope == SymbolScope::Global {
                    assert!(
                        plain[s.index].value_equals(&deduped[s.index]),
                        "global '{name}' differs after dedup"
                    );
                }
            }
        }
    }

    #[test]
    fn test_range_builtin_edges() {
        expect_int("x := uzunluk(aralık(0, 0))", "x", 0);
        expect_int("x := uzunluk(aralık(5, 0))", "x", 5);
        expect_int("x := uzunluk(aralık(0, 10, 3))", "x", 4);
    }
}
