//! Standard-library module registry.
//!
//! The full standard library lives outside the language core; this registry
//! carries the two modules the core itself ships — `fmt`, a builtin module
//! over the format runtime, and `enum`, a source module of enumerable
//! helpers — and demonstrates both import kinds the compiler supports.

use rustc_hash::FxHashMap;

use crate::modules::ModuleMap;
use crate::value::{to_string_lossy, RuntimeError, Value};

/// Names of every module this registry can provide.
pub fn all_module_names() -> Vec<&'static str> {
    vec!["fmt", "enum"]
}

/// Build a [`ModuleMap`] containing the requested modules; unknown names
/// are ignored.
pub fn get_module_map(names: &[&str]) -> ModuleMap {
    let mut modules = ModuleMap::new();
    for &name in names {
        match name {
            "fmt" => modules.add_builtin_module("fmt", fmt_module()),
            "enum" => modules.add_source_module("enum", ENUM_MODULE_SRC.as_bytes()),
            _ => {}
        }
    }
    modules
}

// ─────────────────────────────────────────────────────────────────────────────
// fmt
// ─────────────────────────────────────────────────────────────────────────────

fn fmt_module() -> FxHashMap<String, Value> {
    let mut attrs = FxHashMap::default();
    attrs.insert(
        "yazdır".to_string(),
        Value::user_function("yazdır", fmt_println),
    );
    attrs.insert(
        "yazdırnf".to_string(),
        Value::user_function("yazdırnf", fmt_print),
    );
    attrs.insert(
        "yazdırf".to_string(),
        Value::user_function("yazdırf", fmt_printf),
    );
    attrs.insert(
        "sprintf".to_string(),
        Value::user_function("sprintf", fmt_sprintf),
    );
    attrs
}

fn print_args(args: &[Value]) -> Vec<String> {
    args.iter()
        .map(|arg| to_string_lossy(arg).unwrap_or_else(|| "<undefined>".to_string()))
        .collect()
}

fn fmt_print(args: &[Value]) -> Result<Value, RuntimeError> {
    print!("{}", print_args(args).join(" "));
    Ok(Value::Undefined)
}

fn fmt_println(args: &[Value]) -> Result<Value, RuntimeError> {
    println!("{}", print_args(args).join(" "));
    Ok(Value::Undefined)
}

fn fmt_printf(args: &[Value]) -> Result<Value, RuntimeError> {
    let rendered = sprintf_impl(args)?;
    print!("{rendered}");
    Ok(Value::Undefined)
}

fn fmt_sprintf(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::string(sprintf_impl(args)?))
}

fn sprintf_impl(args: &[Value]) -> Result<String, RuntimeError> {
    let format = match args.first() {
        Some(Value::Str(s)) => s,
        Some(other) => {
            return Err(RuntimeError::InvalidArgumentType {
                name: "format".to_string(),
                expected: "string".to_string(),
                found: other.type_name(),
            })
        }
        None => return Err(RuntimeError::WrongNumArguments),
    };
    if args.len() == 1 {
        return Ok(format.value.clone());
    }
    crate::format::format(&format.value, &args[1..])
}

// ─────────────────────────────────────────────────────────────────────────────
// enum
// ─────────────────────────────────────────────────────────────────────────────

/// Enumerable helpers, written in the language itself.
const ENUM_MODULE_SRC: &str = r#"
liste_gibi := fn(x) {
  dön liste_mi(x) || sınıf(x) == "immutable-array"
}

sayılabilir := fn(x) {
  dön liste_gibi(x) || harita_mı(x) || sınıf(x) == "immutable-map"
}

paylaş {
  all: fn(x, f) {
    eğer !sayılabilir(x) { dön tanımsız }
    tekrarla k, v in x {
      eğer !f(k, v) { dön yanlış }
    }
    dön doğru
  },
  any: fn(x, f) {
    eğer !sayılabilir(x) { dön tanımsız }
    tekrarla k, v in x {
      eğer f(k, v) { dön doğru }
    }
    dön yanlış
  },
  each: fn(x, f) {
    eğer !sayılabilir(x) { dön tanımsız }
    tekrarla k, v in x {
      f(k, v)
    }
  },
  filter: fn(x, f) {
    eğer !liste_gibi(x) { dön tanımsız }
    dst := []
    tekrarla k, v in x {
      eğer f(k, v) { dst = ekle(dst, v) }
    }
    dön dst
  },
  map: fn(x, f) {
    eğer !sayılabilir(x) { dön tanımsız }
    dst := []
    tekrarla k, v in x {
      dst = ekle(dst, f(k, v))
    }
    dön dst
  },
  find: fn(x, f) {
    eğer !sayılabilir(x) { dön tanımsız }
    tekrarla k, v in x {
      eğer f(k, v) { dön v }
    }
  },
  find_key: fn(x, f) {
    eğer !sayılabilir(x) { dön tanımsız }
    tekrarla k, v in x {
      eğer f(k, v) { dön k }
    }
  },
  key: fn(k, _) { dön k },
  value: fn(_, v) { dön v }
}
"#;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;

    #[test]
    fn test_fmt_sprintf() {
        let mut script = Script::new("s := kullan(\"fmt\").sprintf(\"%d/%s\", 4, \"x\")");
        script.set_imports(get_module_map(&all_module_names()));
        let compiled = script.run().unwrap();
        assert_eq!(compiled.get("s").as_string(), "4/x");
    }

    #[test]
    fn test_enum_module() {
        let src = "
            e := kullan(\"enum\")
            doubled := e.map([1, 2, 3], fn(k, v) { dön v * 2 })
            evens := e.filter([1, 2, 3, 4], fn(k, v) { dön v % 2 == 0 })
            hepsi := e.all([1, 2], fn(k, v) { dön v > 0 })
        ";
        let mut script = Script::new(src);
        script.set_imports(get_module_map(&all_module_names()));
        let compiled = script.run().unwrap();
        assert!(compiled.get("doubled").value().value_equals(&Value::array(vec![
            Value::Int(2),
            Value::Int(4),
            Value::Int(6)
        ])));
        assert!(compiled.get("evens").value().value_equals(&Value::array(vec![
            Value::Int(2),
            Value::Int(4)
        ])));
        assert!(compiled.get("hepsi").as_bool());
    }

    #[test]
    fn test_unknown_module_name_ignored() {
        let modules = get_module_map(&["fmt", "yok"]);
        assert_eq!(modules.len(), 1);
    }
}
