//! Module registry for `kullan("…")` imports.
//!
//! The compiler resolves imports against a [`ModuleMap`]: builtin modules
//! surface as `ImmutableMap` constants carrying a `__module_name__` entry
//! (which the bytecode codec later uses to rebind them), while source
//! modules are compiled on the fly as zero-parameter functions whose
//! `paylaş` value becomes the import result.

use rustc_hash::FxHashMap;

use crate::value::Value;

/// The reserved map key identifying a builtin module instance.
pub const MODULE_NAME_KEY: &str = "__module_name__";

// ─────────────────────────────────────────────────────────────────────────────
// Importable
// ─────────────────────────────────────────────────────────────────────────────

/// What an import resolves to.
#[derive(Debug, Clone)]
pub enum Importable {
    /// A named attribute map provided by the host.
    Builtin(BuiltinModule),
    /// Script source text, compiled on import.
    Source(Vec<u8>),
}

/// A builtin module: named host values.
#[derive(Debug, Clone, Default)]
pub struct BuiltinModule {
    pub attrs: FxHashMap<String, Value>,
}

impl BuiltinModule {
    /// Materialize as the `ImmutableMap` the `CONST` instruction pushes:
    /// a deep copy of the attributes plus the `__module_name__` marker.
    pub fn as_immutable_map(&self, module_name: &str) -> Value {
        let mut attrs: FxHashMap<String, Value> = self
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.deep_copy()))
            .collect();
        attrs.insert(MODULE_NAME_KEY.to_string(), Value::string(module_name));
        Value::ImmutableMap(std::rc::Rc::new(attrs))
    }
}

/// Read the `__module_name__` marker out of an immutable map, if present.
pub fn infer_module_name(map: &FxHashMap<String, Value>) -> Option<&str> {
    match map.get(MODULE_NAME_KEY) {
        Some(Value::Str(s)) => Some(&s.value),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ModuleMap
// ─────────────────────────────────────────────────────────────────────────────

/// Name → module registry.  Read-only for the lifetime of a VM.
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    modules: FxHashMap<String, Importable>,
}

impl ModuleMap {
    pub fn new() -> ModuleMap {
        ModuleMap::default()
    }

    pub fn add(&mut self, name: &str, module: Importable) {
        self.modules.insert(name.to_string(), module);
    }

    pub fn add_builtin_module(&mut self, name: &str, attrs: FxHashMap<String, Value>) {
        self.modules
            .insert(name.to_string(), Importable::Builtin(BuiltinModule { attrs }));
    }

    pub fn add_source_module(&mut self, name: &str, src: impl Into<Vec<u8>>) {
        self.modules
            .insert(name.to_string(), Importable::Source(src.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.modules.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<&Importable> {
        self.modules.get(name)
    }

    pub fn get_builtin_module(&self, name: &str) -> Option<&BuiltinModule> {
        match self.modules.get(name) {
            Some(Importable::Builtin(m)) => Some(m),
            _ => None,
        }
    }

    pub fn get_source_module(&self, name: &str) -> Option<&[u8]> {
        match self.modules.get(name) {
            Some(Importable::Source(src)) => Some(src),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Merge another registry into this one; collisions take the other side.
    pub fn add_map(&mut self, other: &ModuleMap) {
        for (name, module) in &other.modules {
            self.modules.insert(name.clone(), module.clone());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_module_tagging() {
        let mut attrs = FxHashMap::default();
        attrs.insert("x".to_string(), Value::Int(1));
        let module = BuiltinModule { attrs };

        let map = module.as_immutable_map("math");
        match &map {
            Value::ImmutableMap(m) => {
                assert_eq!(infer_module_name(m), Some("math"));
                assert!(m.get("x").unwrap().value_equals(&Value::Int(1)));
            }
            other => panic!("expected immutable map, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_registry_kinds() {
        let mut map = ModuleMap::new();
        map.add_builtin_module("a", FxHashMap::default());
        map.add_source_module("b", "paylaş 1".as_bytes());

        assert!(map.get_builtin_module("a").is_some());
        assert!(map.get_builtin_module("b").is_none());
        assert_eq!(map.get_source_module("b"), Some("paylaş 1".as_bytes()));
        assert_eq!(map.len(), 2);

        map.remove("a");
        assert!(map.get("a").is_none());
    }
}
