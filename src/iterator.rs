//! Iterator state machines behind the `ITER`/`ITNXT`/`ITKEY`/`ITVAL`
//! opcodes.
//!
//! An iterator starts positioned *before* the first element: the first
//! `next()` moves onto element 0.  `key()`/`value()` read the current
//! element without advancing.
//!
//! Map iterators snapshot the key set when they are built, so mutating the
//! map during iteration is allowed but keys added later are not visited and
//! the visit order is stable within one run.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::value::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Array
// ─────────────────────────────────────────────────────────────────────────────

/// Iterates an array snapshot; keys are the element indices.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayIterator {
    items: Vec<Value>,
    current: usize,
}

impl ArrayIterator {
    pub fn new(items: Vec<Value>) -> ArrayIterator {
        ArrayIterator { items, current: 0 }
    }

    pub fn next(&mut self) -> bool {
        self.current += 1;
        self.current <= self.items.len()
    }

    pub fn key(&self) -> Value {
        Value::Int(self.current as i64 - 1)
    }

    pub fn value(&self) -> Value {
        self.items[self.current - 1].clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bytes
// ─────────────────────────────────────────────────────────────────────────────

/// Iterates a byte string; values are the bytes as `Int`.
#[derive(Debug, Clone, PartialEq)]
pub struct BytesIterator {
    bytes: Rc<Vec<u8>>,
    current: usize,
}

impl BytesIterator {
    pub fn new(bytes: Rc<Vec<u8>>) -> BytesIterator {
        BytesIterator { bytes, current: 0 }
    }

    pub fn next(&mut self) -> bool {
        self.current += 1;
        self.current <= self.bytes.len()
    }

    pub fn key(&self) -> Value {
        Value::Int(self.current as i64 - 1)
    }

    pub fn value(&self) -> Value {
        Value::Int(self.bytes[self.current - 1] as i64)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Map
// ─────────────────────────────────────────────────────────────────────────────

/// Iterates a map through a key snapshot taken at construction time.
#[derive(Debug, Clone, PartialEq)]
pub struct MapIterator {
    map: Rc<RefCell<FxHashMap<String, Value>>>,
    keys: Vec<String>,
    current: usize,
}

impl MapIterator {
    pub fn new(map: Rc<RefCell<FxHashMap<String, Value>>>) -> MapIterator {
        let keys = map.borrow().keys().cloned().collect();
        MapIterator {
            map,
            keys,
            current: 0,
        }
    }

    /// Snapshot an immutable map; entries cannot change, but the key list is
    /// still materialized for deterministic order.
    pub fn from_immutable(map: &FxHashMap<String, Value>) -> MapIterator {
        MapIterator {
            map: Rc::new(RefCell::new(map.clone())),
            keys: map.keys().cloned().collect(),
            current: 0,
        }
    }

    pub fn next(&mut self) -> bool {
        self.current += 1;
        self.current <= self.keys.len()
    }

    pub fn key(&self) -> Value {
        Value::from(self.keys[self.current - 1].as_str())
    }

    pub fn value(&self) -> Value {
        let key = &self.keys[self.current - 1];
        self.map
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or(Value::Undefined)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// String
// ─────────────────────────────────────────────────────────────────────────────

/// Iterates the code points of a string; values are `Char`.
#[derive(Debug, Clone, PartialEq)]
pub struct StringIterator {
    chars: Vec<char>,
    current: usize,
}

impl StringIterator {
    pub fn new(chars: Vec<char>) -> StringIterator {
        StringIterator { chars, current: 0 }
    }

    pub fn next(&mut self) -> bool {
        self.current += 1;
        self.current <= self.chars.len()
    }

    pub fn key(&self) -> Value {
        Value::Int(self.current as i64 - 1)
    }

    pub fn value(&self) -> Value {
        Value::Char(self.chars[self.current - 1])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_iterator_walks_all() {
        let mut it = ArrayIterator::new(vec![Value::Int(10), Value::Int(20)]);
        assert!(it.next());
        assert!(it.key().value_equals(&Value::Int(0)));
        assert!(it.value().value_equals(&Value::Int(10)));
        assert!(it.next());
        assert!(it.value().value_equals(&Value::Int(20)));
        assert!(!it.next());
    }

    #[test]
    fn test_empty_array_iterator() {
        let mut it = ArrayIterator::new(Vec::new());
        assert!(!it.next());
    }

    #[test]
    fn test_map_iterator_snapshot() {
        let mut m = FxHashMap::default();
        m.insert("a".to_string(), Value::Int(1));
        let shared = Rc::new(RefCell::new(m));
        let mut it = MapIterator::new(Rc::clone(&shared));

        // Insert during iteration: the new key must not be visited.
        shared.borrow_mut().insert("b".to_string(), Value::Int(2));

        let mut visited = Vec::new();
        while it.next() {
            if let Value::Str(s) = it.key() {
                visited.push(s.value.clone());
            }
        }
        assert_eq!(visited, vec!["a".to_string()]);
    }

    #[test]
    fn test_string_iterator_code_points() {
        let mut it = StringIterator::new("aş".chars().collect());
        assert!(it.next());
        assert!(it.value().value_equals(&Value::Char('a')));
        assert!(it.next());
        assert!(it.value().value_equals(&Value::Char('ş')));
        assert!(!it.next());
    }

    #[test]
    fn test_bytes_iterator() {
        let mut it = BytesIterator::new(Rc::new(vec![7, 8]));
        assert!(it.next());
        assert!(it.value().value_equals(&Value::Int(7)));
        assert!(it.next());
        assert!(it.next() == false);
    }
}
