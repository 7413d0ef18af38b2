//! The builtin function table.
//!
//! Builtins live in a fixed static table; the compiler registers each name
//! at its table index and `GETBUILTIN` pushes entries by index.  Every
//! builtin takes a value slice and returns a value or a runtime error, the
//! same shape host functions use.

use crate::value::{
    to_bool, to_byte_vec, to_char, to_float64, to_int64, to_string_lossy, BuiltinFunc,
    RuntimeError, Value, FALSE, TRUE,
};
use crate::{MAX_BYTES_LEN, MAX_STRING_LEN};

/// All builtins, in registration order.  Indices are baked into compiled
/// bytecode, so entries must not be reordered.
pub static BUILTINS: &[BuiltinFunc] = &[
    BuiltinFunc {
        name: "yazdır",
        func: builtin_print,
    },
    BuiltinFunc {
        name: "uzunluk",
        func: builtin_len,
    },
    BuiltinFunc {
        name: "kopyala",
        func: builtin_copy,
    },
    BuiltinFunc {
        name: "ekle",
        func: builtin_append,
    },
    BuiltinFunc {
        name: "sil",
        func: builtin_delete,
    },
    BuiltinFunc {
        name: "birleştir",
        func: builtin_splice,
    },
    BuiltinFunc {
        name: "yazı",
        func: builtin_string,
    },
    BuiltinFunc {
        name: "sayı",
        func: builtin_int,
    },
    BuiltinFunc {
        name: "mantıksal",
        func: builtin_bool,
    },
    BuiltinFunc {
        name: "float",
        func: builtin_float,
    },
    BuiltinFunc {
        name: "karakter",
        func: builtin_char,
    },
    BuiltinFunc {
        name: "bytes",
        func: builtin_bytes,
    },
    BuiltinFunc {
        name: "sayı_mı",
        func: builtin_is_int,
    },
    BuiltinFunc {
        name: "float_mı",
        func: builtin_is_float,
    },
    BuiltinFunc {
        name: "yazı_mı",
        func: builtin_is_string,
    },
    BuiltinFunc {
        name: "mantıksal_mı",
        func: builtin_is_bool,
    },
    BuiltinFunc {
        name: "liste_mi",
        func: builtin_is_array,
    },
    BuiltinFunc {
        name: "harita_mı",
        func: builtin_is_map,
    },
    BuiltinFunc {
        name: "tanımsız_mı",
        func: builtin_is_undefined,
    },
    BuiltinFunc {
        name: "sınıf",
        func: builtin_type_name,
    },
    BuiltinFunc {
        name: "f",
        func: builtin_format,
    },
    BuiltinFunc {
        name: "aralık",
        func: builtin_range,
    },
];

fn arg_type_error(name: &str, expected: &str, found: &Value) -> RuntimeError {
    RuntimeError::InvalidArgumentType {
        name: name.to_string(),
        expected: expected.to_string(),
        found: found.type_name(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Core
// ─────────────────────────────────────────────────────────────────────────────

fn builtin_print(args: &[Value]) -> Result<Value, RuntimeError> {
    for arg in args {
        println!("{arg}");
    }
    Ok(Value::Undefined)
}

fn builtin_len(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::WrongNumArguments);
    }
    let len = match &args[0] {
        Value::Array(a) => a.borrow().len(),
        Value::ImmutableArray(a) => a.len(),
        Value::Str(s) => s.value.len(),
        Value::Bytes(b) => b.len(),
        Value::Map(m) => m.borrow().len(),
        Value::ImmutableMap(m) => m.len(),
        other => return Err(arg_type_error("first", "array/string/bytes/map", other)),
    };
    Ok(Value::Int(len as i64))
}

fn builtin_copy(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::WrongNumArguments);
    }
    Ok(args[0].deep_copy())
}

fn builtin_append(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() < 2 {
        return Err(RuntimeError::WrongNumArguments);
    }
    let mut items = match &args[0] {
        Value::Array(a) => a.borrow().clone(),
        Value::ImmutableArray(a) => a.as_ref().clone(),
        other => return Err(arg_type_error("first", "array", other)),
    };
    items.extend(args[1..].iter().cloned());
    Ok(Value::array(items))
}

fn builtin_delete(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 2 {
        return Err(RuntimeError::WrongNumArguments);
    }
    match &args[0] {
        Value::Map(m) => match &args[1] {
            Value::Str(key) => {
                m.borrow_mut().remove(&key.value);
                Ok(Value::Undefined)
            }
            other => Err(arg_type_error("second", "string", other)),
        },
        other => Err(arg_type_error("first", "map", other)),
    }
}

/// `birleştir(dizi, başlangıç?, sayı?, eleman...)` — remove `sayı` elements
/// at `başlangıç`, insert the given elements there, and return the removed
/// elements.  The array is modified in place.
fn builtin_splice(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() {
        return Err(RuntimeError::WrongNumArguments);
    }
    let array = match &args[0] {
        Value::Array(a) => a,
        other => return Err(arg_type_error("first", "array", other)),
    };
    let array_len = array.borrow().len();

    let start_idx = if args.len() > 1 {
        match &args[1] {
            Value::Int(v) => {
                if *v < 0 || *v > array_len as i64 {
                    return Err(RuntimeError::IndexOutOfBounds);
                }
                *v as usize
            }
            other => return Err(arg_type_error("second", "int", other)),
        }
    } else {
        0
    };

    let mut del_count = if args.len() > 2 {
        match &args[2] {
            Value::Int(v) => {
                if *v < 0 {
                    return Err(RuntimeError::IndexOutOfBounds);
                }
                *v as usize
            }
            other => return Err(arg_type_error("third", "int", other)),
        }
    } else {
        array_len
    };
    if start_idx + del_count > array_len {
        del_count = array_len - start_idx;
    }

    let inserted = args.get(3..).unwrap_or(&[]);
    let mut items = array.borrow_mut();
    let deleted: Vec<Value> = items
        .splice(start_idx..start_idx + del_count, inserted.iter().cloned())
        .collect();
    drop(items);

    Ok(Value::array(deleted))
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversions
// ─────────────────────────────────────────────────────────────────────────────

/// Conversion builtins share a shape: same-type values pass through, a
/// convertible value converts, and otherwise the optional second argument
/// (or `tanımsız`) is returned.
fn builtin_string(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() || args.len() > 2 {
        return Err(RuntimeError::WrongNumArguments);
    }
    if matches!(args[0], Value::Str(_)) {
        return Ok(args[0].clone());
    }
    match to_string_lossy(&args[0]) {
        Some(v) => {
            if v.len() > MAX_STRING_LEN {
                return Err(RuntimeError::StringLimit);
            }
            Ok(Value::string(v))
        }
        None => Ok(args.get(1).cloned().unwrap_or(Value::Undefined)),
    }
}

fn builtin_int(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() || args.len() > 2 {
        return Err(RuntimeError::WrongNumArguments);
    }
    if matches!(args[0], Value::Int(_)) {
        return Ok(args[0].clone());
    }
    match to_int64(&args[0]) {
        Some(v) => Ok(Value::Int(v)),
        None => Ok(args.get(1).cloned().unwrap_or(Value::Undefined)),
    }
}

fn builtin_bool(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::WrongNumArguments);
    }
    if matches!(args[0], Value::Bool(_)) {
        return Ok(args[0].clone());
    }
    Ok(if to_bool(&args[0]) { TRUE } else { FALSE })
}

fn builtin_float(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() || args.len() > 2 {
        return Err(RuntimeError::WrongNumArguments);
    }
    if matches!(args[0], Value::Float(_)) {
        return Ok(args[0].clone());
    }
    match to_float64(&args[0]) {
        Some(v) => Ok(Value::Float(v)),
        None => Ok(args.get(1).cloned().unwrap_or(Value::Undefined)),
    }
}

fn builtin_char(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() || args.len() > 2 {
        return Err(RuntimeError::WrongNumArguments);
    }
    if matches!(args[0], Value::Char(_)) {
        return Ok(args[0].clone());
    }
    match to_char(&args[0]) {
        Some(v) => Ok(Value::Char(v)),
        None => Ok(args.get(1).cloned().unwrap_or(Value::Undefined)),
    }
}

fn builtin_bytes(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() || args.len() > 2 {
        return Err(RuntimeError::WrongNumArguments);
    }
    // An integer argument allocates a zeroed buffer of that size.
    if let Value::Int(n) = &args[0] {
        if *n > MAX_BYTES_LEN as i64 {
            return Err(RuntimeError::BytesLimit);
        }
        return Ok(Value::bytes(vec![0u8; (*n).max(0) as usize]));
    }
    match to_byte_vec(&args[0]) {
        Some(v) => {
            if v.len() > MAX_BYTES_LEN {
                return Err(RuntimeError::BytesLimit);
            }
            Ok(Value::bytes(v))
        }
        None => Ok(args.get(1).cloned().unwrap_or(Value::Undefined)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Type predicates
// ─────────────────────────────────────────────────────────────────────────────

fn predicate(args: &[Value], test: impl Fn(&Value) -> bool) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::WrongNumArguments);
    }
    Ok(if test(&args[0]) { TRUE } else { FALSE })
}

fn builtin_is_int(args: &[Value]) -> Result<Value, RuntimeError> {
    predicate(args, |v| matches!(v, Value::Int(_)))
}

fn builtin_is_float(args: &[Value]) -> Result<Value, RuntimeError> {
    predicate(args, |v| matches!(v, Value::Float(_)))
}

fn builtin_is_string(args: &[Value]) -> Result<Value, RuntimeError> {
    predicate(args, |v| matches!(v, Value::Str(_)))
}

fn builtin_is_bool(args: &[Value]) -> Result<Value, RuntimeError> {
    predicate(args, |v| matches!(v, Value::Bool(_)))
}

fn builtin_is_array(args: &[Value]) -> Result<Value, RuntimeError> {
    predicate(args, |v| matches!(v, Value::Array(_)))
}

fn builtin_is_map(args: &[Value]) -> Result<Value, RuntimeError> {
    predicate(args, |v| matches!(v, Value::Map(_)))
}

fn builtin_is_undefined(args: &[Value]) -> Result<Value, RuntimeError> {
    predicate(args, |v| matches!(v, Value::Undefined))
}

fn builtin_type_name(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::WrongNumArguments);
    }
    Ok(Value::string(args[0].type_name()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Formatting and ranges
// ─────────────────────────────────────────────────────────────────────────────

fn builtin_format(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() {
        return Err(RuntimeError::WrongNumArguments);
    }
    let format = match &args[0] {
        Value::Str(s) => s,
        other => return Err(arg_type_error("format", "string", other)),
    };
    if args.len() == 1 {
        // A format with no arguments is returned as-is.
        return Ok(args[0].clone());
    }
    let out = crate::format::format(&format.value, &args[1..])?;
    Ok(Value::string(out))
}

fn builtin_range(args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() < 2 || args.len() > 3 {
        return Err(RuntimeError::WrongNumArguments);
    }
    let names = ["start", "stop", "step"];
    let mut parts = [0i64; 3];
    for (i, arg) in args.iter().enumerate() {
        match arg {
            Value::Int(v) => parts[i] = *v,
            other => return Err(arg_type_error(names[i], "int", other)),
        }
    }
    let (start, stop) = (parts[0], parts[1]);
    let step = if args.len() == 3 { parts[2] } else { 1 };
    if step <= 0 {
        return Err(RuntimeError::InvalidRangeStep);
    }

    let mut items = Vec::new();
    if start <= stop {
        let mut i = start;
        while i < stop {
            items.push(Value::Int(i));
            i += step;
        }
    } else {
        let mut i = start;
        while i > stop {
            items.push(Value::Int(i));
            i -= step;
        }
    }
    Ok(Value::array(items))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len() {
        assert!(builtin_len(&[Value::string("abc")])
            .unwrap()
            .value_equals(&Value::Int(3)));
        assert!(builtin_len(&[Value::array(vec![Value::Int(1)])])
            .unwrap()
            .value_equals(&Value::Int(1)));
        assert!(matches!(
            builtin_len(&[Value::Int(1)]),
            Err(RuntimeError::InvalidArgumentType { .. })
        ));
        assert_eq!(builtin_len(&[]), Err(RuntimeError::WrongNumArguments));
    }

    #[test]
    fn test_append_returns_new_array() {
        let base = Value::array(vec![Value::Int(1)]);
        let out = builtin_append(&[base.clone(), Value::Int(2)]).unwrap();
        assert!(out.value_equals(&Value::array(vec![Value::Int(1), Value::Int(2)])));
        // Original untouched.
        assert!(base.value_equals(&Value::array(vec![Value::Int(1)])));
    }

    #[test]
    fn test_delete() {
        let mut entries = rustc_hash::FxHashMap::default();
        entries.insert("k".to_string(), Value::Int(1));
        let map = Value::map(entries);
        builtin_delete(&[map.clone(), Value::string("k")]).unwrap();
        assert!(map
            .index_get(&Value::string("k"))
            .unwrap()
            .value_equals(&Value::Undefined));
    }

    #[test]
    fn test_splice() {
        let arr = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let deleted =
            builtin_splice(&[arr.clone(), Value::Int(1), Value::Int(1), Value::Int(9)]).unwrap();
        assert!(deleted.value_equals(&Value::array(vec![Value::Int(2)])));
        assert!(arr.value_equals(&Value::array(vec![
            Value::Int(1),
            Value::Int(9),
            Value::Int(3)
        ])));

        assert_eq!(
            builtin_splice(&[arr, Value::Int(99)]),
            Err(RuntimeError::IndexOutOfBounds)
        );
    }

    #[test]
    fn test_conversions_with_default() {
        assert!(builtin_int(&[Value::string("42")])
            .unwrap()
            .value_equals(&Value::Int(42)));
        assert!(builtin_int(&[Value::array(Vec::new()), Value::Int(-1)])
            .unwrap()
            .value_equals(&Value::Int(-1)));
        assert!(builtin_string(&[Value::Int(7)])
            .unwrap()
            .value_equals(&Value::string("7")));
        assert!(builtin_char(&[Value::Int(97)])
            .unwrap()
            .value_equals(&Value::Char('a')));
        assert!(builtin_bytes(&[Value::Int(3)])
            .unwrap()
            .value_equals(&Value::bytes(vec![0, 0, 0])));
    }

    #[test]
    fn test_predicates() {
        assert!(builtin_is_int(&[Value::Int(1)]).unwrap().value_equals(&TRUE));
        assert!(builtin_is_map(&[Value::Int(1)])
            .unwrap()
            .value_equals(&FALSE));
        assert!(builtin_is_undefined(&[Value::Undefined])
            .unwrap()
            .value_equals(&TRUE));
    }

    #[test]
    fn test_type_name() {
        assert!(builtin_type_name(&[Value::Float(1.0)])
            .unwrap()
            .value_equals(&Value::string("float")));
    }

    #[test]
    fn test_range() {
        let r = builtin_range(&[Value::Int(0), Value::Int(0)]).unwrap();
        assert!(r.value_equals(&Value::array(Vec::new())));

        let r = builtin_range(&[Value::Int(0), Value::Int(3)]).unwrap();
        assert!(r.value_equals(&Value::array(vec![
            Value::Int(0),
            Value::Int(1),
            Value::Int(2)
        ])));

        // Counts down when start > stop.
        let r = builtin_range(&[Value::Int(3), Value::Int(0)]).unwrap();
        assert!(r.value_equals(&Value::array(vec![
            Value::Int(3),
            Value::Int(2),
            Value::Int(1)
        ])));

        assert_eq!(
            builtin_range(&[Value::Int(0), Value::Int(5), Value::Int(0)]),
            Err(RuntimeError::InvalidRangeStep)
        );
    }

    #[test]
    fn test_format_builtin() {
        let out = builtin_format(&[
            Value::string("%d-%s"),
            Value::Int(3),
            Value::string("a"),
        ])
        .unwrap();
        assert!(out.value_equals(&Value::string("3-a")));

        // No arguments: the format is returned untouched.
        let out = builtin_format(&[Value::string("%d")]).unwrap();
        assert!(out.value_equals(&Value::string("%d")));
    }
}
