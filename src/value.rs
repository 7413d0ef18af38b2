//! Runtime values.
//!
//! [`Value`] is a tagged enum covering every runtime type.  Scalars (`Int`,
//! `Float`, `Bool`, `Char`, `Undefined`) are stored inline; containers and
//! functions sit behind `Rc` so assignment aliases instead of copying, and
//! mutable containers add a `RefCell`.  Operations are inherent methods
//! dispatched with a `match`, which keeps the VM's hot path free of virtual
//! calls.
//!
//! The immutable variants (`ImmutableArray`, `ImmutableMap`, produced by
//! `sabit(x)`) read exactly like their mutable siblings but reject
//! `index_set`.
//!
//! [`Value::deep_copy`] produces a fully independent value: copying a
//! mutable container and mutating the copy never affects the original.  An
//! immutable container copies into a *mutable* one.

use std::cell::{OnceCell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;

use crate::iterator::{ArrayIterator, BytesIterator, MapIterator, StringIterator};
use crate::position::Pos;
use crate::token::Token;
use crate::{MAX_BYTES_LEN, MAX_STRING_LEN};

// ─────────────────────────────────────────────────────────────────────────────
// Runtime errors
// ─────────────────────────────────────────────────────────────────────────────

/// Every error the runtime can raise.  User-level `hata(x)` values are *not*
/// errors in this sense: they are ordinary [`Value::Error`] data and never
/// unwind the VM.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("stack overflow")]
    StackOverflow,
    #[error("call frame limit exceeded")]
    FramesExceeded,
    #[error("object allocation limit exceeded")]
    ObjectAllocLimit,
    #[error("bytes size limit exceeded")]
    BytesLimit,
    #[error("string size limit exceeded")]
    StringLimit,
    #[error("index out of bounds")]
    IndexOutOfBounds,
    #[error("invalid index type")]
    InvalidIndexType,
    #[error("invalid index value type")]
    InvalidIndexValueType,
    #[error("invalid index on error")]
    InvalidIndexOnError,
    #[error("invalid operator")]
    InvalidOperator,
    #[error("not indexable")]
    NotIndexable,
    #[error("not index-assignable")]
    NotIndexAssignable,
    #[error("range step must be greater than zero")]
    InvalidRangeStep,
    #[error("wrong number of arguments")]
    WrongNumArguments,
    #[error("wrong number of arguments: want={want}, got={got}")]
    WrongArity { want: String, got: usize },
    #[error("invalid type for argument '{name}': expected {expected}, found {found}")]
    InvalidArgumentType {
        name: String,
        expected: String,
        found: String,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("not callable: {type_name}")]
    NotCallable { type_name: String },
    #[error("execution cancelled")]
    Cancelled,
    #[error("{0}")]
    Message(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Supporting types
// ─────────────────────────────────────────────────────────────────────────────

/// A shared mutable cell used for free-variable capture: the enclosing
/// frame's local slot and every closure that captured it hold the same cell.
pub type ObjectPtr = Rc<RefCell<Value>>;

/// String payload with a lazily built, cached code-point view.  Indexing and
/// iteration address the n-th code point, not the n-th byte.
#[derive(Debug, PartialEq)]
pub struct StrValue {
    pub value: String,
    chars: OnceCell<Vec<char>>,
}

impl StrValue {
    pub fn new(value: String) -> StrValue {
        StrValue {
            value,
            chars: OnceCell::new(),
        }
    }

    /// The cached code-point view, built on first use.
    pub fn chars(&self) -> &[char] {
        self.chars.get_or_init(|| self.value.chars().collect())
    }
}

/// A compiled function: the unit of execution.  Closures are compiled
/// functions whose `free` list was bound by the `CLOSURE` instruction; the
/// instruction buffer itself is shared between a function constant and every
/// closure made from it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    pub instructions: Rc<Vec<u8>>,
    pub num_locals: usize,
    pub num_parameters: usize,
    pub var_args: bool,
    /// `(instruction offset, source position)` pairs, sorted by offset, one
    /// per statement start.
    pub source_map: Vec<(usize, Pos)>,
    pub free: Vec<ObjectPtr>,
}

impl CompiledFunction {
    /// The source position of the statement containing `ip`: the nearest
    /// mapped offset at or before it.
    pub fn source_pos(&self, ip: usize) -> Pos {
        match self.source_map.partition_point(|&(off, _)| off <= ip) {
            0 => Pos::NONE,
            i => self.source_map[i - 1].1,
        }
    }
}

/// Signature shared by builtin and host-provided functions.
pub type CallableFn = fn(&[Value]) -> Result<Value, RuntimeError>;

/// An entry in the builtin function table.
#[derive(PartialEq)]
pub struct BuiltinFunc {
    pub name: &'static str,
    pub func: CallableFn,
}

impl fmt::Debug for BuiltinFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin-function:{}>", self.name)
    }
}

/// A host-provided callable injected through the embedding API.
pub struct UserFunction {
    pub name: String,
    pub func: Box<dyn Fn(&[Value]) -> Result<Value, RuntimeError>>,
}

impl fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<user-function:{}>", self.name)
    }
}

impl PartialEq for UserFunction {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value
// ─────────────────────────────────────────────────────────────────────────────

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Char(char),
    Undefined,
    Str(Rc<StrValue>),
    Bytes(Rc<Vec<u8>>),
    Array(Rc<RefCell<Vec<Value>>>),
    ImmutableArray(Rc<Vec<Value>>),
    Map(Rc<RefCell<FxHashMap<String, Value>>>),
    ImmutableMap(Rc<FxHashMap<String, Value>>),
    Error(Rc<Value>),
    Time(SystemTime),
    Function(Rc<CompiledFunction>),
    Builtin(&'static BuiltinFunc),
    UserFn(Rc<UserFunction>),
    /// Free-variable cell; only ever observed by the closure opcodes.
    Ptr(ObjectPtr),
    ArrayIter(Rc<RefCell<ArrayIterator>>),
    BytesIter(Rc<RefCell<BytesIterator>>),
    MapIter(Rc<RefCell<MapIterator>>),
    StrIter(Rc<RefCell<StringIterator>>),
}

/// The shared `doğru` value.
pub const TRUE: Value = Value::Bool(true);
/// The shared `yanlış` value.
pub const FALSE: Value = Value::Bool(false);
/// The shared `tanımsız` value.
pub const UNDEFINED: Value = Value::Undefined;

impl Value {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn string(s: impl Into<String>) -> Value {
        Value::Str(Rc::new(StrValue::new(s.into())))
    }

    pub fn bytes(b: Vec<u8>) -> Value {
        Value::Bytes(Rc::new(b))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn map(entries: FxHashMap<String, Value>) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn error(value: Value) -> Value {
        Value::Error(Rc::new(value))
    }

    pub fn user_function(
        name: impl Into<String>,
        func: impl Fn(&[Value]) -> Result<Value, RuntimeError> + 'static,
    ) -> Value {
        Value::UserFn(Rc::new(UserFunction {
            name: name.into(),
            func: Box::new(func),
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Classification
    // ─────────────────────────────────────────────────────────────────────────

    /// The runtime type name used in error messages and by `sınıf`.
    pub fn type_name(&self) -> String {
        match self {
            Value::Int(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Char(_) => "char".to_string(),
            Value::Undefined => "undefined".to_string(),
            Value::Str(_) => "string".to_string(),
            Value::Bytes(_) => "bytes".to_string(),
            Value::Array(_) => "array".to_string(),
            Value::ImmutableArray(_) => "immutable-array".to_string(),
            Value::Map(_) => "map".to_string(),
            Value::ImmutableMap(_) => "immutable-map".to_string(),
            Value::Error(_) => "error".to_string(),
            Value::Time(_) => "time".to_string(),
            Value::Function(_) => "compiled-function".to_string(),
            Value::Builtin(b) => format!("builtin-function:{}", b.name),
            Value::UserFn(u) => format!("user-function:{}", u.name),
            Value::Ptr(_) => "<free-var>".to_string(),
            Value::ArrayIter(_) => "array-iterator".to_string(),
            Value::BytesIter(_) => "bytes-iterator".to_string(),
            Value::MapIter(_) => "map-iterator".to_string(),
            Value::StrIter(_) => "string-iterator".to_string(),
        }
    }

    /// Falsiness drives `JMPF`, `!`, and the short-circuit jumps.
    pub fn is_falsy(&self) -> bool {
        match self {
            Value::Int(v) => *v == 0,
            Value::Float(v) => v.is_nan(),
            Value::Bool(v) => !v,
            Value::Char(c) => *c == '\u{0}',
            Value::Undefined => true,
            Value::Str(s) => s.value.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Array(a) => a.borrow().is_empty(),
            Value::ImmutableArray(a) => a.is_empty(),
            Value::Map(m) => m.borrow().is_empty(),
            Value::ImmutableMap(m) => m.is_empty(),
            Value::Error(_) => true,
            Value::Time(t) => *t == UNIX_EPOCH,
            Value::ArrayIter(_) | Value::MapIter(_) | Value::StrIter(_) => true,
            _ => false,
        }
    }

    pub fn can_call(&self) -> bool {
        matches!(
            self,
            Value::Function(_) | Value::Builtin(_) | Value::UserFn(_)
        )
    }

    pub fn can_iterate(&self) -> bool {
        matches!(
            self,
            Value::Array(_)
                | Value::ImmutableArray(_)
                | Value::Bytes(_)
                | Value::Map(_)
                | Value::ImmutableMap(_)
                | Value::Str(_)
                | Value::Undefined
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Equality and copying
    // ─────────────────────────────────────────────────────────────────────────

    /// Structural equality for data; identity for errors, pointers and
    /// functions (functions never compare equal).
    pub fn value_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Str(a), Value::Str(b)) => a.value == b.value,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => Rc::ptr_eq(a, b),
            (Value::Ptr(a), Value::Ptr(b)) => Rc::ptr_eq(a, b),
            (Value::Array(_) | Value::ImmutableArray(_), Value::Array(_) | Value::ImmutableArray(_)) => {
                let a = self.array_items();
                let b = other.array_items();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.value_equals(y))
            }
            (Value::Map(_) | Value::ImmutableMap(_), Value::Map(_) | Value::ImmutableMap(_)) => {
                self.with_map_entries(|a| {
                    other.with_map_entries(|b| {
                        a.len() == b.len()
                            && a.iter().all(|(k, v)| {
                                b.get(k).map_or(false, |bv| v.value_equals(bv))
                            })
                    })
                })
            }
            _ => false,
        }
    }

    /// Deep copy: mutating the result never affects the original.  Immutable
    /// containers copy into mutable ones.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Array(a) => {
                Value::array(a.borrow().iter().map(|v| v.deep_copy()).collect())
            }
            Value::ImmutableArray(a) => {
                Value::array(a.iter().map(|v| v.deep_copy()).collect())
            }
            Value::Map(m) => Value::map(
                m.borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            ),
            Value::ImmutableMap(m) => Value::map(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            ),
            Value::Str(s) => Value::string(s.value.clone()),
            Value::Bytes(b) => Value::bytes(b.as_ref().clone()),
            Value::Error(e) => Value::error(e.deep_copy()),
            Value::Function(f) => Value::Function(Rc::new(f.as_ref().clone())),
            // Scalars, singletons, callables and cells copy by handle.
            other => other.clone(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Binary operators
    // ─────────────────────────────────────────────────────────────────────────

    /// Dispatch a binary operator.  Comparison operators return the shared
    /// `TRUE`/`FALSE`; unsupported combinations fail with
    /// [`RuntimeError::InvalidOperator`].
    pub fn binary_op(&self, op: Token, rhs: &Value) -> Result<Value, RuntimeError> {
        match self {
            Value::Int(a) => int_binary_op(*a, op, rhs),
            Value::Float(a) => float_binary_op(*a, op, rhs),
            Value::Char(a) => char_binary_op(*a, op, rhs),
            Value::Str(a) => str_binary_op(a, op, rhs),
            Value::Bytes(a) => {
                if let (Token::Add, Value::Bytes(b)) = (op, rhs) {
                    if a.len() + b.len() > MAX_BYTES_LEN {
                        return Err(RuntimeError::BytesLimit);
                    }
                    let mut out = a.as_ref().clone();
                    out.extend_from_slice(b);
                    return Ok(Value::bytes(out));
                }
                Err(RuntimeError::InvalidOperator)
            }
            Value::Array(a) => {
                if let (Token::Add, Value::Array(b)) = (op, rhs) {
                    let mut out = a.borrow().clone();
                    out.extend(b.borrow().iter().cloned());
                    return Ok(Value::array(out));
                }
                Err(RuntimeError::InvalidOperator)
            }
            Value::ImmutableArray(a) => {
                if let (Token::Add, Value::ImmutableArray(b)) = (op, rhs) {
                    let mut out = a.as_ref().clone();
                    out.extend(b.iter().cloned());
                    return Ok(Value::array(out));
                }
                Err(RuntimeError::InvalidOperator)
            }
            Value::Time(a) => time_binary_op(*a, op, rhs),
            _ => Err(RuntimeError::InvalidOperator),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Indexing and slicing
    // ─────────────────────────────────────────────────────────────────────────

    /// `recv[idx]`.  Out-of-range reads on sequences yield `tanımsız`.
    pub fn index_get(&self, index: &Value) -> Result<Value, RuntimeError> {
        match self {
            Value::Array(a) => {
                let idx = int_index(index)?;
                Ok(array_get(&a.borrow(), idx))
            }
            Value::ImmutableArray(a) => {
                let idx = int_index(index)?;
                Ok(array_get(a, idx))
            }
            Value::Map(m) => {
                let key = to_string_lossy(index).ok_or(RuntimeError::InvalidIndexType)?;
                Ok(m.borrow().get(&key).cloned().unwrap_or(Value::Undefined))
            }
            Value::ImmutableMap(m) => {
                let key = to_string_lossy(index).ok_or(RuntimeError::InvalidIndexType)?;
                Ok(m.get(&key).cloned().unwrap_or(Value::Undefined))
            }
            Value::Str(s) => {
                let idx = int_index(index)?;
                let chars = s.chars();
                Ok(match usize::try_from(idx).ok().and_then(|i| chars.get(i)) {
                    Some(&ch) => Value::Char(ch),
                    None => Value::Undefined,
                })
            }
            Value::Bytes(b) => {
                let idx = int_index(index)?;
                Ok(match usize::try_from(idx).ok().and_then(|i| b.get(i)) {
                    Some(&byte) => Value::Int(byte as i64),
                    None => Value::Undefined,
                })
            }
            Value::Error(e) => {
                if to_string_lossy(index).as_deref() == Some("value") {
                    Ok(e.as_ref().clone())
                } else {
                    Err(RuntimeError::InvalidIndexOnError)
                }
            }
            Value::Undefined => Ok(Value::Undefined),
            _ => Err(RuntimeError::NotIndexable),
        }
    }

    /// `recv[idx] = value`.  Writing past the end of an array is an error;
    /// immutable containers reject all writes.
    pub fn index_set(&self, index: &Value, value: Value) -> Result<(), RuntimeError> {
        match self {
            Value::Array(a) => {
                let idx = to_int64(index).ok_or(RuntimeError::InvalidIndexType)?;
                let mut items = a.borrow_mut();
                let slot = usize::try_from(idx)
                    .ok()
                    .filter(|&i| i < items.len())
                    .ok_or(RuntimeError::IndexOutOfBounds)?;
                items[slot] = value;
                Ok(())
            }
            Value::Map(m) => {
                let key = to_string_lossy(index).ok_or(RuntimeError::InvalidIndexType)?;
                m.borrow_mut().insert(key, value);
                Ok(())
            }
            _ => Err(RuntimeError::NotIndexAssignable),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Iteration
    // ─────────────────────────────────────────────────────────────────────────

    /// Build a fresh iterator positioned before the first element, or `None`
    /// when the value is not iterable.
    pub fn iterate(&self) -> Option<Value> {
        match self {
            Value::Array(a) => Some(Value::ArrayIter(Rc::new(RefCell::new(
                ArrayIterator::new(a.borrow().clone()),
            )))),
            Value::ImmutableArray(a) => Some(Value::ArrayIter(Rc::new(RefCell::new(
                ArrayIterator::new(a.as_ref().clone()),
            )))),
            Value::Bytes(b) => Some(Value::BytesIter(Rc::new(RefCell::new(
                BytesIterator::new(Rc::clone(b)),
            )))),
            Value::Map(m) => Some(Value::MapIter(Rc::new(RefCell::new(MapIterator::new(
                Rc::clone(m),
            ))))),
            Value::ImmutableMap(m) => Some(Value::MapIter(Rc::new(RefCell::new(
                MapIterator::from_immutable(m),
            )))),
            Value::Str(s) => Some(Value::StrIter(Rc::new(RefCell::new(
                StringIterator::new(s.chars().to_vec()),
            )))),
            // `tanımsız` iterates as an empty sequence.
            Value::Undefined => Some(Value::Undefined),
            _ => None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn array_items(&self) -> Vec<Value> {
        match self {
            Value::Array(a) => a.borrow().clone(),
            Value::ImmutableArray(a) => a.as_ref().clone(),
            _ => Vec::new(),
        }
    }

    fn with_map_entries<R>(&self, f: impl FnOnce(&FxHashMap<String, Value>) -> R) -> R {
        match self {
            Value::Map(m) => f(&m.borrow()),
            Value::ImmutableMap(m) => f(m),
            _ => f(&FxHashMap::default()),
        }
    }
}

fn array_get(items: &[Value], idx: i64) -> Value {
    usize::try_from(idx)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .unwrap_or(Value::Undefined)
}

fn int_index(index: &Value) -> Result<i64, RuntimeError> {
    match index {
        Value::Int(i) => Ok(*i),
        _ => Err(RuntimeError::InvalidIndexType),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operator implementations per receiver type
// ─────────────────────────────────────────────────────────────────────────────

fn bool_value(b: bool) -> Value {
    if b {
        TRUE
    } else {
        FALSE
    }
}

fn int_binary_op(a: i64, op: Token, rhs: &Value) -> Result<Value, RuntimeError> {
    match rhs {
        Value::Int(b) => {
            let b = *b;
            let v = match op {
                Token::Add => a.wrapping_add(b),
                Token::Sub => a.wrapping_sub(b),
                Token::Mul => a.wrapping_mul(b),
                Token::Quo => {
                    if b == 0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    a.wrapping_div(b)
                }
                Token::Rem => {
                    if b == 0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    a.wrapping_rem(b)
                }
                Token::And => a & b,
                Token::Or => a | b,
                Token::Xor => a ^ b,
                Token::AndNot => a & !b,
                // Out-of-range shift counts behave like shifting every bit
                // out, not like the masked hardware shift.
                Token::Shl => {
                    if (0..64).contains(&b) {
                        a.wrapping_shl(b as u32)
                    } else {
                        0
                    }
                }
                Token::Shr => {
                    if (0..64).contains(&b) {
                        a.wrapping_shr(b as u32)
                    } else if a < 0 {
                        -1
                    } else {
                        0
                    }
                }
                Token::Less => return Ok(bool_value(a < b)),
                Token::Greater => return Ok(bool_value(a > b)),
                Token::LessEq => return Ok(bool_value(a <= b)),
                Token::GreaterEq => return Ok(bool_value(a >= b)),
                _ => return Err(RuntimeError::InvalidOperator),
            };
            Ok(Value::Int(v))
        }
        Value::Float(b) => {
            let a = a as f64;
            let b = *b;
            match op {
                Token::Add => Ok(Value::Float(a + b)),
                Token::Sub => Ok(Value::Float(a - b)),
                Token::Mul => Ok(Value::Float(a * b)),
                Token::Quo => Ok(Value::Float(a / b)),
                Token::Less => Ok(bool_value(a < b)),
                Token::Greater => Ok(bool_value(a > b)),
                Token::LessEq => Ok(bool_value(a <= b)),
                Token::GreaterEq => Ok(bool_value(a >= b)),
                _ => Err(RuntimeError::InvalidOperator),
            }
        }
        Value::Char(b) => {
            let bc = *b as i64;
            match op {
                Token::Add => Ok(Value::Char(char_from_i64(a.wrapping_add(bc)))),
                Token::Sub => Ok(Value::Char(char_from_i64(a.wrapping_sub(bc)))),
                Token::Less => Ok(bool_value(a < bc)),
                Token::Greater => Ok(bool_value(a > bc)),
                Token::LessEq => Ok(bool_value(a <= bc)),
                Token::GreaterEq => Ok(bool_value(a >= bc)),
                _ => Err(RuntimeError::InvalidOperator),
            }
        }
        _ => Err(RuntimeError::InvalidOperator),
    }
}

fn float_binary_op(a: f64, op: Token, rhs: &Value) -> Result<Value, RuntimeError> {
    let b = match rhs {
        Value::Float(b) => *b,
        Value::Int(b) => *b as f64,
        _ => return Err(RuntimeError::InvalidOperator),
    };
    match op {
        Token::Add => Ok(Value::Float(a + b)),
        Token::Sub => Ok(Value::Float(a - b)),
        Token::Mul => Ok(Value::Float(a * b)),
        Token::Quo => Ok(Value::Float(a / b)),
        Token::Less => Ok(bool_value(a < b)),
        Token::Greater => Ok(bool_value(a > b)),
        Token::LessEq => Ok(bool_value(a <= b)),
        Token::GreaterEq => Ok(bool_value(a >= b)),
        _ => Err(RuntimeError::InvalidOperator),
    }
}

fn char_binary_op(a: char, op: Token, rhs: &Value) -> Result<Value, RuntimeError> {
    let ac = a as i64;
    match rhs {
        // Char stays Char under arithmetic, including Char - Char.
        Value::Char(b) => {
            let bc = *b as i64;
            match op {
                Token::Add => Ok(Value::Char(char_from_i64(ac.wrapping_add(bc)))),
                Token::Sub => Ok(Value::Char(char_from_i64(ac.wrapping_sub(bc)))),
                Token::Less => Ok(bool_value(ac < bc)),
                Token::Greater => Ok(bool_value(ac > bc)),
                Token::LessEq => Ok(bool_value(ac <= bc)),
                Token::GreaterEq => Ok(bool_value(ac >= bc)),
                _ => Err(RuntimeError::InvalidOperator),
            }
        }
        Value::Int(b) => {
            let b = *b;
            match op {
                Token::Add => Ok(Value::Char(char_from_i64(ac.wrapping_add(b)))),
                Token::Sub => Ok(Value::Char(char_from_i64(ac.wrapping_sub(b)))),
                Token::Less => Ok(bool_value(ac < b)),
                Token::Greater => Ok(bool_value(ac > b)),
                Token::LessEq => Ok(bool_value(ac <= b)),
                Token::GreaterEq => Ok(bool_value(ac >= b)),
                _ => Err(RuntimeError::InvalidOperator),
            }
        }
        _ => Err(RuntimeError::InvalidOperator),
    }
}

fn char_from_i64(v: i64) -> char {
    u32::try_from(v)
        .ok()
        .and_then(char::from_u32)
        .unwrap_or('\u{FFFD}')
}

fn str_binary_op(a: &Rc<StrValue>, op: Token, rhs: &Value) -> Result<Value, RuntimeError> {
    match op {
        Token::Add => {
            // Non-string operands are coerced through their display form.
            let rhs_str = match rhs {
                Value::Str(b) => b.value.clone(),
                other => other.to_string(),
            };
            if a.value.len() + rhs_str.len() > MAX_STRING_LEN {
                return Err(RuntimeError::StringLimit);
            }
            Ok(Value::string(format!("{}{}", a.value, rhs_str)))
        }
        Token::Less | Token::LessEq | Token::Greater | Token::GreaterEq => match rhs {
            Value::Str(b) => {
                let r = match op {
                    Token::Less => a.value < b.value,
                    Token::LessEq => a.value <= b.value,
                    Token::Greater => a.value > b.value,
                    _ => a.value >= b.value,
                };
                Ok(bool_value(r))
            }
            _ => Err(RuntimeError::InvalidOperator),
        },
        _ => Err(RuntimeError::InvalidOperator),
    }
}

fn time_binary_op(a: SystemTime, op: Token, rhs: &Value) -> Result<Value, RuntimeError> {
    match rhs {
        // Time ± Int shifts by nanoseconds.
        Value::Int(ns) => match op {
            Token::Add => Ok(Value::Time(shift_time(a, *ns, false))),
            Token::Sub => Ok(Value::Time(shift_time(a, *ns, true))),
            _ => Err(RuntimeError::InvalidOperator),
        },
        Value::Time(b) => match op {
            // Time − Time yields the signed difference in nanoseconds.
            Token::Sub => {
                let diff = match a.duration_since(*b) {
                    Ok(d) => d.as_nanos() as i64,
                    Err(e) => -(e.duration().as_nanos() as i64),
                };
                Ok(Value::Int(diff))
            }
            Token::Less => Ok(bool_value(a < *b)),
            Token::Greater => Ok(bool_value(a > *b)),
            Token::LessEq => Ok(bool_value(a <= *b)),
            Token::GreaterEq => Ok(bool_value(a >= *b)),
            _ => Err(RuntimeError::InvalidOperator),
        },
        _ => Err(RuntimeError::InvalidOperator),
    }
}

fn shift_time(t: SystemTime, ns: i64, negate: bool) -> SystemTime {
    let forward = (ns >= 0) != negate;
    let magnitude = Duration::from_nanos(ns.unsigned_abs());
    if forward {
        t + magnitude
    } else {
        t - magnitude
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Display
// ─────────────────────────────────────────────────────────────────────────────

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => f.write_str(if *v { "true" } else { "false" }),
            Value::Char(c) => write!(f, "{c}"),
            Value::Undefined => f.write_str("<undefined>"),
            Value::Str(s) => f.write_str(&quote_string(&s.value)),
            Value::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::Array(a) => {
                let items: Vec<String> = a.borrow().iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::ImmutableArray(a) => {
                let items: Vec<String> = a.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Map(m) => {
                let pairs: Vec<String> =
                    m.borrow().iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", pairs.join(", "))
            }
            Value::ImmutableMap(m) => {
                let pairs: Vec<String> = m.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", pairs.join(", "))
            }
            Value::Error(e) => write!(f, "error: {e}"),
            Value::Time(t) => match t.duration_since(UNIX_EPOCH) {
                Ok(d) => write!(f, "{}", d.as_nanos()),
                Err(e) => write!(f, "-{}", e.duration().as_nanos()),
            },
            Value::Function(_) => f.write_str("<compiled-function>"),
            Value::Builtin(_) => f.write_str("<builtin-function>"),
            Value::UserFn(_) => f.write_str("<user-function>"),
            Value::Ptr(_) => f.write_str("free-var"),
            Value::ArrayIter(_) => f.write_str("<array-iterator>"),
            Value::BytesIter(_) => f.write_str("<bytes-iterator>"),
            Value::MapIter(_) => f.write_str("<map-iterator>"),
            Value::StrIter(_) => f.write_str("<string-iterator>"),
        }
    }
}

/// Quote a string the way the `%q` verb and string display do: double
/// quotes, standard escapes, `\u`/`\U` for non-printable code points.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{7}' => out.push_str("\\a"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\u{b}' => out.push_str("\\v"),
            ch if (ch as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02x}", ch as u32));
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversions
// ─────────────────────────────────────────────────────────────────────────────

/// Convert to a display string.  `tanımsız` does not convert; a `Str`
/// yields its raw (unquoted) contents.
pub fn to_string_lossy(v: &Value) -> Option<String> {
    match v {
        Value::Undefined => None,
        Value::Str(s) => Some(s.value.clone()),
        other => Some(other.to_string()),
    }
}

/// Convert to `i64`: numeric types truncate, `Bool` maps to 0/1, strings
/// parse in base 10.
pub fn to_int64(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Float(f) => Some(*f as i64),
        Value::Char(c) => Some(*c as i64),
        Value::Bool(b) => Some(*b as i64),
        Value::Str(s) => s.value.parse().ok(),
        _ => None,
    }
}

/// Convert to `f64`: `Int` widens, strings parse.
pub fn to_float64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Str(s) => s.value.parse().ok(),
        _ => None,
    }
}

/// Convert to `char`: an `Int` is taken as a code point.
pub fn to_char(v: &Value) -> Option<char> {
    match v {
        Value::Char(c) => Some(*c),
        Value::Int(i) => u32::try_from(*i).ok().and_then(char::from_u32),
        _ => None,
    }
}

/// Convert to `bool` via falsiness; never fails.
pub fn to_bool(v: &Value) -> bool {
    !v.is_falsy()
}

/// Convert to a byte vector: `Bytes` clones, `Str` yields its UTF-8 bytes.
pub fn to_byte_vec(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::Bytes(b) => Some(b.as_ref().clone()),
        Value::Str(s) => Some(s.value.clone().into_bytes()),
        _ => None,
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        bool_value(v)
    }
}

impl From<char> for Value {
    fn from(v: char) -> Value {
        Value::Char(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::string(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::array(v)
    }
}

impl From<FxHashMap<String, Value>> for Value {
    fn from(v: FxHashMap<String, Value>) -> Value {
        Value::map(v)
    }
}

impl From<SystemTime> for Value {
    fn from(v: SystemTime) -> Value {
        Value::Time(v)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Value {
        Value::Undefined
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Variable
// ─────────────────────────────────────────────────────────────────────────────

/// A named value handed across the embedding boundary by
/// [`crate::script::Compiled::get`] and friends.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    value: Value,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: Value) -> Variable {
        Variable {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn value_type(&self) -> String {
        self.value.type_name()
    }

    pub fn as_int(&self) -> i64 {
        to_int64(&self.value).unwrap_or_default()
    }

    pub fn as_float(&self) -> f64 {
        to_float64(&self.value).unwrap_or_default()
    }

    pub fn as_char(&self) -> char {
        to_char(&self.value).unwrap_or('\u{0}')
    }

    pub fn as_bool(&self) -> bool {
        to_bool(&self.value)
    }

    pub fn as_string(&self) -> String {
        to_string_lossy(&self.value).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        to_byte_vec(&self.value).unwrap_or_default()
    }

    pub fn as_array(&self) -> Option<Vec<Value>> {
        match &self.value {
            Value::Array(a) => Some(a.borrow().clone()),
            Value::ImmutableArray(a) => Some(a.as_ref().clone()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<FxHashMap<String, Value>> {
        match &self.value {
            Value::Map(m) => Some(m.borrow().clone()),
            Value::ImmutableMap(m) => Some(m.as_ref().clone()),
            _ => None,
        }
    }

    /// The wrapped error message, if the value is an `hata(x)`.
    pub fn as_error(&self) -> Option<String> {
        match &self.value {
            Value::Error(_) => Some(self.value.to_string()),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.value, Value::Undefined)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arithmetic_wraps() {
        let r = Value::Int(i64::MAX)
            .binary_op(Token::Add, &Value::Int(1))
            .unwrap();
        assert!(r.value_equals(&Value::Int(i64::MIN)));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            Value::Int(1).binary_op(Token::Quo, &Value::Int(0)),
            Err(RuntimeError::DivisionByZero)
        );
        assert_eq!(
            Value::Int(1).binary_op(Token::Rem, &Value::Int(0)),
            Err(RuntimeError::DivisionByZero)
        );
    }

    #[test]
    fn test_rem_sign_follows_dividend() {
        let r = Value::Int(-7).binary_op(Token::Rem, &Value::Int(3)).unwrap();
        assert!(r.value_equals(&Value::Int(-1)));
        let r = Value::Int(7).binary_op(Token::Rem, &Value::Int(-3)).unwrap();
        assert!(r.value_equals(&Value::Int(1)));
    }

    #[test]
    fn test_mixed_numeric_promotes_to_float() {
        let r = Value::Int(1).binary_op(Token::Add, &Value::Float(0.5)).unwrap();
        assert!(r.value_equals(&Value::Float(1.5)));
        let r = Value::Float(1.0).binary_op(Token::Quo, &Value::Int(4)).unwrap();
        assert!(r.value_equals(&Value::Float(0.25)));
    }

    #[test]
    fn test_char_arithmetic_stays_char() {
        let r = Value::Char('a').binary_op(Token::Add, &Value::Int(1)).unwrap();
        assert!(r.value_equals(&Value::Char('b')));
        let r = Value::Char('b').binary_op(Token::Sub, &Value::Char('a')).unwrap();
        assert!(r.value_equals(&Value::Char('\u{1}')));
    }

    #[test]
    fn test_shift_out_of_range() {
        let r = Value::Int(1).binary_op(Token::Shl, &Value::Int(64)).unwrap();
        assert!(r.value_equals(&Value::Int(0)));
        let r = Value::Int(-8).binary_op(Token::Shr, &Value::Int(99)).unwrap();
        assert!(r.value_equals(&Value::Int(-1)));
    }

    #[test]
    fn test_string_concat_coercion() {
        let r = Value::string("x=")
            .binary_op(Token::Add, &Value::Int(3))
            .unwrap();
        assert!(r.value_equals(&Value::string("x=3")));
        let r = Value::string("a")
            .binary_op(Token::Add, &Value::string("b"))
            .unwrap();
        assert!(r.value_equals(&Value::string("ab")));
    }

    #[test]
    fn test_string_index_is_code_point() {
        let s = Value::string("aşk");
        let r = s.index_get(&Value::Int(1)).unwrap();
        assert!(r.value_equals(&Value::Char('ş')));
        // Past the end reads as undefined.
        assert!(s
            .index_get(&Value::Int(99))
            .unwrap()
            .value_equals(&Value::Undefined));
    }

    #[test]
    fn test_array_index_set_bounds() {
        let a = Value::array(vec![Value::Int(1)]);
        a.index_set(&Value::Int(0), Value::Int(9)).unwrap();
        assert!(a
            .index_get(&Value::Int(0))
            .unwrap()
            .value_equals(&Value::Int(9)));
        assert_eq!(
            a.index_set(&Value::Int(1), Value::Int(5)),
            Err(RuntimeError::IndexOutOfBounds)
        );
    }

    #[test]
    fn test_immutable_rejects_writes() {
        let m = Value::ImmutableMap(Rc::new(FxHashMap::default()));
        assert_eq!(
            m.index_set(&Value::string("a"), Value::Int(1)),
            Err(RuntimeError::NotIndexAssignable)
        );
        let a = Value::ImmutableArray(Rc::new(vec![Value::Int(1)]));
        assert_eq!(
            a.index_set(&Value::Int(0), Value::Int(2)),
            Err(RuntimeError::NotIndexAssignable)
        );
        // Reads work exactly like the mutable variant.
        assert!(a
            .index_get(&Value::Int(0))
            .unwrap()
            .value_equals(&Value::Int(1)));
    }

    #[test]
    fn test_deep_copy_isolation() {
        let orig = Value::array(vec![Value::array(vec![Value::Int(1)]), Value::Int(2)]);
        let copy = orig.deep_copy();
        assert!(copy.value_equals(&orig));

        // Mutate the copy's inner array.
        if let Value::Array(outer) = &copy {
            if let Value::Array(inner) = &outer.borrow()[0] {
                inner.borrow_mut()[0] = Value::Int(99);
            }
        }
        if let Value::Array(outer) = &orig {
            if let Value::Array(inner) = &outer.borrow()[0] {
                assert!(inner.borrow()[0].value_equals(&Value::Int(1)));
            }
        }
    }

    #[test]
    fn test_immutable_copies_to_mutable() {
        let m = Value::ImmutableArray(Rc::new(vec![Value::Int(1)]));
        assert!(matches!(m.deep_copy(), Value::Array(_)));
    }

    #[test]
    fn test_cross_mutability_equality() {
        let a = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::ImmutableArray(Rc::new(vec![Value::Int(1), Value::Int(2)]));
        assert!(a.value_equals(&b));

        let mut entries = FxHashMap::default();
        entries.insert("x".to_string(), Value::Int(1));
        let m1 = Value::map(entries.clone());
        let m2 = Value::ImmutableMap(Rc::new(entries));
        assert!(m1.value_equals(&m2));
    }

    #[test]
    fn test_error_identity_equality() {
        let e1 = Value::error(Value::string("kaboom"));
        let e2 = Value::error(Value::string("kaboom"));
        assert!(!e1.value_equals(&e2));
        assert!(e1.value_equals(&e1.clone()));
    }

    #[test]
    fn test_falsiness() {
        assert!(Value::Int(0).is_falsy());
        assert!(!Value::Int(1).is_falsy());
        assert!(Value::Float(f64::NAN).is_falsy());
        assert!(!Value::Float(0.0).is_falsy());
        assert!(Value::string("").is_falsy());
        assert!(Value::Undefined.is_falsy());
        assert!(Value::error(Value::Int(1)).is_falsy());
        assert!(Value::array(Vec::new()).is_falsy());
    }

    #[test]
    fn test_error_index_get() {
        let e = Value::error(Value::string("sebep"));
        let inner = e.index_get(&Value::string("value")).unwrap();
        assert!(inner.value_equals(&Value::string("sebep")));
        assert_eq!(
            e.index_get(&Value::string("other")),
            Err(RuntimeError::InvalidIndexOnError)
        );
    }

    #[test]
    fn test_time_arithmetic() {
        let t = UNIX_EPOCH + Duration::from_secs(100);
        let shifted = Value::Time(t)
            .binary_op(Token::Add, &Value::Int(1_000_000_000))
            .unwrap();
        match shifted {
            Value::Time(t2) => {
                let diff = Value::Time(t2).binary_op(Token::Sub, &Value::Time(t)).unwrap();
                assert!(diff.value_equals(&Value::Int(1_000_000_000)));
            }
            other => panic!("expected time, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_conversions() {
        assert_eq!(to_int64(&Value::string("42")), Some(42));
        assert_eq!(to_int64(&Value::Bool(true)), Some(1));
        assert_eq!(to_float64(&Value::Int(2)), Some(2.0));
        assert_eq!(to_char(&Value::Int(97)), Some('a'));
        assert_eq!(to_string_lossy(&Value::Undefined), None);
        assert_eq!(to_string_lossy(&Value::string("s")).as_deref(), Some("s"));
        assert_eq!(to_byte_vec(&Value::string("ab")), Some(vec![97, 98]));
    }

    #[test]
    fn test_quote_string() {
        assert_eq!(quote_string("a\"b\n"), "\"a\\\"b\\n\"");
        assert_eq!(quote_string("düz"), "\"düz\"");
    }

    #[test]
    fn test_source_map_lookup() {
        let func = CompiledFunction {
            instructions: Rc::new(vec![0; 10]),
            num_locals: 0,
            num_parameters: 0,
            var_args: false,
            source_map: vec![(0, Pos(5)), (4, Pos(9)), (8, Pos(13))],
            free: Vec::new(),
        };
        assert_eq!(func.source_pos(0), Pos(5));
        assert_eq!(func.source_pos(3), Pos(5));
        assert_eq!(func.source_pos(4), Pos(9));
        assert_eq!(func.source_pos(9), Pos(13));
    }
}
