//! Compile-time scope analysis.
//!
//! A [`SymbolTable`] is a tree of scopes.  The root table holds globals and
//! builtins; each function literal forks a fresh child table and each
//! block (`eğer`/`tekrarla` body) forks a *block* table that shares its
//! function's local slot space.
//!
//! Resolving a name that lives in an enclosing function (crossing at least
//! one non-block fork) promotes it to a **free** symbol in the inner table,
//! re-indexed from zero; the compiler turns those into closure captures.
//!
//! Symbols are shared `Rc<RefCell<_>>` handles so that a `local_assigned`
//! update made through one table is observed by every scope that resolved the
//! same symbol.  A local that has not been assigned yet is invisible to plain
//! resolution in its own block, which is what makes `x := x + 1` at block
//! scope read the outer `x`.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

// ─────────────────────────────────────────────────────────────────────────────
// Symbol
// ─────────────────────────────────────────────────────────────────────────────

/// Which storage class a resolved name belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    Builtin,
    Free,
}

/// A named slot resolved at compile time.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
    /// Set once the local has been assigned; unassigned locals do not shadow
    /// outer bindings inside their own initializer.
    pub local_assigned: bool,
}

/// Shared handle to a symbol; tables that resolve the same name observe the
/// same flags.
pub type SymbolRef = Rc<RefCell<Symbol>>;

// ─────────────────────────────────────────────────────────────────────────────
// SymbolTable
// ─────────────────────────────────────────────────────────────────────────────

/// One scope in the table tree.
#[derive(Debug, Default)]
pub struct SymbolTable {
    parent: Option<Box<SymbolTable>>,
    /// Block forks share the enclosing function's slot space.
    block: bool,
    store: FxHashMap<String, SymbolRef>,
    num_definition: usize,
    max_definition: usize,
    free_symbols: Vec<SymbolRef>,
    builtin_symbols: Vec<SymbolRef>,
}

impl SymbolTable {
    /// Create a root table.
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Define `name` in this scope: global in the root (even when reached
    /// through block forks of the root), local otherwise.
    pub fn define(&mut self, name: &str) -> SymbolRef {
        let index = self.next_index();
        self.num_definition += 1;

        let scope = if self.parent(true).is_none() {
            // Defining a global through a block fork of the root: the slot
            // count belongs to the root table.
            if self.parent.is_some() {
                self.num_definition -= 1;
                self.root_mut().num_definition += 1;
            }
            SymbolScope::Global
        } else {
            SymbolScope::Local
        };

        let symbol = Rc::new(RefCell::new(Symbol {
            name: name.to_string(),
            scope,
            index,
            local_assigned: false,
        }));
        self.store.insert(name.to_string(), Rc::clone(&symbol));
        self.update_max_defs(index + 1);
        symbol
    }

    /// Register a builtin at a fixed index in the root table.
    pub fn define_builtin(&mut self, index: usize, name: &str) -> SymbolRef {
        if self.parent.is_some() {
            return self.parent.as_mut().unwrap().define_builtin(index, name);
        }
        let symbol = Rc::new(RefCell::new(Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
            local_assigned: false,
        }));
        self.store.insert(name.to_string(), Rc::clone(&symbol));
        self.builtin_symbols.push(Rc::clone(&symbol));
        symbol
    }

    /// Resolve `name`, walking parent scopes.  Returns the symbol and the
    /// number of scope hops it took.  `recur` is set on recursive (parent)
    /// lookups; it lets an unassigned local satisfy a child's resolution
    /// while staying invisible inside its own block.
    pub fn resolve(&mut self, name: &str, recur: bool) -> Option<(SymbolRef, usize)> {
        if let Some(symbol) = self.store.get(name) {
            let visible = {
                let s = symbol.borrow();
                s.scope != SymbolScope::Local || s.local_assigned || recur
            };
            if visible {
                return Some((Rc::clone(symbol), 0));
            }
        }

        let parent = self.parent.as_mut()?;
        let (symbol, depth) = parent.resolve(name, true)?;
        let depth = depth + 1;

        let scope = symbol.borrow().scope;
        if !self.block && scope != SymbolScope::Global && scope != SymbolScope::Builtin {
            return Some((self.define_free(symbol), depth));
        }
        Some((symbol, depth))
    }

    /// Fork a child scope; `block` forks share the local slot space.
    pub fn fork(self, block: bool) -> SymbolTable {
        SymbolTable {
            parent: Some(Box::new(self)),
            block,
            ..SymbolTable::default()
        }
    }

    /// Drop this scope and return its parent.  Panics on the root, which
    /// indicates a compiler bug (unbalanced fork/unfork).
    pub fn unfork(self) -> SymbolTable {
        *self.parent.expect("unfork on root symbol table")
    }

    /// The enclosing scope; with `skip_block` set, the enclosing *function*
    /// scope.
    pub fn parent(&self, skip_block: bool) -> Option<&SymbolTable> {
        match &self.parent {
            Some(parent) if skip_block && self.block => parent.parent(skip_block),
            Some(parent) => Some(parent),
            None => None,
        }
    }

    /// Peak number of simultaneously live definitions; drives `num_locals`.
    pub fn max_symbols(&self) -> usize {
        self.max_definition
    }

    /// Free symbols recorded in this scope, in capture order.
    pub fn free_symbols(&self) -> Vec<SymbolRef> {
        self.free_symbols.clone()
    }

    /// Builtins registered on the root.
    pub fn builtin_symbols(&self) -> Vec<SymbolRef> {
        match &self.parent {
            Some(parent) => parent.builtin_symbols(),
            None => self.builtin_symbols.clone(),
        }
    }

    /// Names defined directly in this scope.
    pub fn names(&self) -> Vec<String> {
        self.store.keys().cloned().collect()
    }

    fn root_mut(&mut self) -> &mut SymbolTable {
        if self.parent.is_some() {
            self.parent.as_mut().unwrap().root_mut()
        } else {
            self
        }
    }

    fn next_index(&self) -> usize {
        if self.block {
            self.parent.as_ref().unwrap().next_index() + self.num_definition
        } else {
            self.num_definition
        }
    }

    fn update_max_defs(&mut self, num_defs: usize) {
        if num_defs > self.max_definition {
            self.max_definition = num_defs;
        }
        if self.block {
            self.parent.as_mut().unwrap().update_max_defs(num_defs);
        }
    }

    fn define_free(&mut self, original: SymbolRef) -> SymbolRef {
        self.free_symbols.push(Rc::clone(&original));
        let name = original.borrow().name.clone();
        let symbol = Rc::new(RefCell::new(Symbol {
            name: name.clone(),
            scope: SymbolScope::Free,
            index: self.free_symbols.len() - 1,
            local_assigned: false,
        }));
        self.store.insert(name, Rc::clone(&symbol));
        symbol
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn assigned(sym: &SymbolRef) {
        sym.borrow_mut().local_assigned = true;
    }

    #[test]
    fn test_root_defines_globals() {
        let mut table = SymbolTable::new();
        let a = table.define("a");
        let b = table.define("b");
        assert_eq!(a.borrow().scope, SymbolScope::Global);
        assert_eq!(a.borrow().index, 0);
        assert_eq!(b.borrow().index, 1);
    }

    #[test]
    fn test_function_fork_defines_locals() {
        let table = SymbolTable::new();
        let mut table = table.fork(false);
        let x = table.define("x");
        assert_eq!(x.borrow().scope, SymbolScope::Local);
        assert_eq!(x.borrow().index, 0);
    }

    #[test]
    fn test_block_fork_shares_slot_space() {
        let mut table = SymbolTable::new().fork(false);
        let a = table.define("a");
        assigned(&a);
        let mut block = table.fork(true);
        let b = block.define("b");
        assert_eq!(b.borrow().scope, SymbolScope::Local);
        // The block continues the function's slot numbering.
        assert_eq!(b.borrow().index, 1);
        assert_eq!(block.max_symbols(), 2);

        let table = block.unfork();
        assert_eq!(table.max_symbols(), 2);
    }

    #[test]
    fn test_global_resolution_through_blocks() {
        let mut root = SymbolTable::new();
        root.define("g");
        let mut block = root.fork(true);
        let (sym, _) = block.resolve("g", false).unwrap();
        assert_eq!(sym.borrow().scope, SymbolScope::Global);
        assert!(block.free_symbols().is_empty());
    }

    #[test]
    fn test_free_promotion_across_function() {
        let mut root = SymbolTable::new();
        root.define("g");
        let mut outer = root.fork(false);
        let x = outer.define("x");
        assigned(&x);

        let mut inner = outer.fork(false);
        // Global stays global.
        let (g, _) = inner.resolve("g", false).unwrap();
        assert_eq!(g.borrow().scope, SymbolScope::Global);
        // The outer local becomes free in the inner function.
        let (x_in, depth) = inner.resolve("x", false).unwrap();
        assert_eq!(x_in.borrow().scope, SymbolScope::Free);
        assert_eq!(x_in.borrow().index, 0);
        assert_eq!(depth, 1);
        assert_eq!(inner.free_symbols().len(), 1);
    }

    #[test]
    fn test_free_of_free_renumbering() {
        let mut level1 = SymbolTable::new().fork(false);
        let a = level1.define("a");
        assigned(&a);
        let b = level1.define("b");
        assigned(&b);

        let mut level2 = level1.fork(false);
        level2.resolve("b", false).unwrap();

        let mut level3 = level2.fork(false);
        let (b3, _) = level3.resolve("b", false).unwrap();
        let (a3, _) = level3.resolve("a", false).unwrap();
        assert_eq!(b3.borrow().scope, SymbolScope::Free);
        assert_eq!(b3.borrow().index, 0);
        assert_eq!(a3.borrow().scope, SymbolScope::Free);
        assert_eq!(a3.borrow().index, 1);
    }

    #[test]
    fn test_unassigned_local_resolves_outer() {
        // x := x + 1 at block scope: the RHS `x` must see the outer binding
        // until the new local is assigned.
        let mut root = SymbolTable::new();
        let outer_x = root.define("x");
        assigned(&outer_x);

        let mut block = root.fork(true);
        let _inner_x = block.define("x"); // not yet assigned
        let (resolved, _) = block.resolve("x", false).unwrap();
        assert_eq!(resolved.borrow().scope, SymbolScope::Global);
        assert_eq!(resolved.borrow().index, outer_x.borrow().index);
    }

    #[test]
    fn test_builtins_live_on_root() {
        let mut root = SymbolTable::new();
        root.define_builtin(0, "yazdır");
        let mut inner = root.fork(false).fork(true);
        let (sym, _) = inner.resolve("yazdır", false).unwrap();
        assert_eq!(sym.borrow().scope, SymbolScope::Builtin);
        assert_eq!(sym.borrow().index, 0);
        assert_eq!(inner.builtin_symbols().len(), 1);
    }
}
