//! Host embedding API.
//!
//! [`Script`] holds source text plus injected globals and limits;
//! [`Script::compile`] produces a [`Compiled`] program that can run any
//! number of times and be inspected through [`Variable`]s.  [`Compiled`]
//! values share their bytecode; [`Compiled::clone`] deep-copies the global
//! slots so two clones execute independently.
//!
//! [`eval`] is the one-expression convenience wrapper: it compiles
//! `__res__ := (expr)`, runs it, and returns `__res__`.

use std::path::PathBuf;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::bytecode::Bytecode;
use crate::compiler::Compiler;
use crate::modules::ModuleMap;
use crate::parser::Parser;
use crate::position::SourceFileSet;
use crate::symbol_table::{SymbolScope, SymbolTable};
use crate::value::{Value, Variable};
use crate::vm::{AbortFlag, Vm};
use crate::{LokumError, GLOBALS_SIZE};

// ─────────────────────────────────────────────────────────────────────────────
// Script
// ─────────────────────────────────────────────────────────────────────────────

/// A script: source text, injected variables, module registry and limits.
pub struct Script {
    variables: FxHashMap<String, Value>,
    modules: ModuleMap,
    input: Vec<u8>,
    max_allocs: i64,
    max_const_objects: i64,
    enable_file_import: bool,
    import_dir: PathBuf,
}

impl Script {
    /// Create a script from source text.
    pub fn new(input: impl Into<Vec<u8>>) -> Script {
        Script {
            variables: FxHashMap::default(),
            modules: ModuleMap::new(),
            input: input.into(),
            max_allocs: -1,
            max_const_objects: -1,
            enable_file_import: false,
            import_dir: PathBuf::new(),
        }
    }

    /// Inject a named global visible to the script.
    pub fn add(&mut self, name: &str, value: impl Into<Value>) {
        self.variables.insert(name.to_string(), value.into());
    }

    /// Remove an injected global; returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.variables.remove(name).is_some()
    }

    /// Set the module registry used by `kullan`.
    pub fn set_imports(&mut self, modules: ModuleMap) {
        self.modules = modules;
    }

    /// Set the directory file imports resolve against (made absolute).
    pub fn set_import_dir(&mut self, dir: impl Into<PathBuf>) -> std::io::Result<()> {
        let dir = dir.into();
        self.import_dir = if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir()?.join(dir)
        };
        Ok(())
    }

    /// Allow `kullan` to read `.lokum` files.
    pub fn enable_file_import(&mut self, enable: bool) {
        self.enable_file_import = enable;
    }

    /// Cap runtime allocations; negative disables the check.
    pub fn set_max_allocs(&mut self, n: i64) {
        self.max_allocs = n;
    }

    /// Cap the number of objects in the compiled constant pool; negative
    /// disables the check.
    pub fn set_max_const_objects(&mut self, n: i64) {
        self.max_const_objects = n;
    }

    /// Compile the script into a runnable [`Compiled`].
    pub fn compile(&self) -> Result<Compiled, LokumError> {
        let (symbol_table, mut globals) = self.prep_compile();

        let mut file_set = SourceFileSet::new();
        let src_file = file_set.add_file("(main)", self.input.len());
        let ast = Parser::new(src_file, &self.input).parse_file()?;

        let mut compiler = Compiler::new(
            file_set,
            Some(symbol_table),
            Vec::new(),
            self.modules.clone(),
        );
        compiler.enable_file_import(self.enable_file_import);
        compiler.set_import_dir(self.import_dir.clone());
        compiler.compile(&ast)?;
        let (mut bytecode, mut symbol_table) = compiler.bytecode();

        globals.truncate(symbol_table.max_symbols() + 1);

        let mut global_indexes = FxHashMap::default();
        for name in symbol_table.names() {
            if let Some((symbol, _)) = symbol_table.resolve(&name, false) {
                let s = symbol.borrow();
                if s.scope == SymbolScope::Global {
                    global_indexes.insert(name.clone(), s.index);
                }
            }
        }

        bytecode.remove_duplicates();

        if self.max_const_objects >= 0 {
            let count = bytecode.count_objects();
            if count as i64 > self.max_const_objects {
                return Err(LokumError::Script(format!(
                    "constant object limit exceeded: {count}"
                )));
            }
        }

        Ok(Compiled {
            global_indexes,
            bytecode: Rc::new(bytecode),
            globals,
            max_allocs: self.max_allocs,
        })
    }

    /// Compile and run in one step.
    pub fn run(&self) -> Result<Compiled, LokumError> {
        let mut compiled = self.compile()?;
        compiled.run()?;
        Ok(compiled)
    }

    /// Compile and run under an external abort flag.
    pub fn run_with_flag(&self, flag: &AbortFlag) -> Result<Compiled, LokumError> {
        let mut compiled = self.compile()?;
        compiled.run_with_flag(flag)?;
        Ok(compiled)
    }

    /// Builtin-aware symbol table plus the initial global slots for the
    /// injected variables.
    fn prep_compile(&self) -> (SymbolTable, Vec<Value>) {
        let mut symbol_table = SymbolTable::new();
        for (idx, b) in crate::builtins::BUILTINS.iter().enumerate() {
            symbol_table.define_builtin(idx, b.name);
        }

        let mut globals = vec![Value::Undefined; GLOBALS_SIZE];

        // Sorted for deterministic slot assignment.
        let mut names: Vec<&String> = self.variables.keys().collect();
        names.sort();
        for name in names {
            let symbol = symbol_table.define(name);
            globals[symbol.borrow().index] = self.variables[name].clone();
        }
        (symbol_table, globals)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled program plus its global slots.  Bytecode and constants are
/// shared between clones; globals are deep-copied.
#[derive(Debug)]
pub struct Compiled {
    global_indexes: FxHashMap<String, usize>,
    bytecode: Rc<Bytecode>,
    globals: Vec<Value>,
    max_allocs: i64,
}

impl Compiled {
    /// Execute (or re-execute) the program against the current globals.
    pub fn run(&mut self) -> Result<(), LokumError> {
        let mut vm = Vm::new(&self.bytecode, &mut self.globals, self.max_allocs);
        vm.run()?;
        Ok(())
    }

    /// Execute under an external abort flag; tripping the flag from any
    /// thread cancels at the next instruction boundary.
    pub fn run_with_flag(&mut self, flag: &AbortFlag) -> Result<(), LokumError> {
        let mut vm = Vm::new(&self.bytecode, &mut self.globals, self.max_allocs);
        vm.set_abort_flag(flag.clone());
        vm.run()?;
        Ok(())
    }

    /// Is `name` a defined, non-`tanımsız` global?
    pub fn is_defined(&self, name: &str) -> bool {
        match self.global_indexes.get(name) {
            Some(&idx) => !matches!(self.globals.get(idx), None | Some(Value::Undefined)),
            None => false,
        }
    }

    /// Look up a global by name; unknown names yield a `tanımsız` variable.
    pub fn get(&self, name: &str) -> Variable {
        let value = self
            .global_indexes
            .get(name)
            .and_then(|&idx| self.globals.get(idx))
            .cloned()
            .unwrap_or(Value::Undefined);
        Variable::new(name, value)
    }

    /// All named globals.
    pub fn get_all(&self) -> Vec<Variable> {
        self.global_indexes
            .iter()
            .map(|(name, &idx)| {
                let value = self.globals.get(idx).cloned().unwrap_or(Value::Undefined);
                Variable::new(name.clone(), value)
            })
            .collect()
    }

    /// Overwrite a global that the compiled program defines.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), LokumError> {
        match self.global_indexes.get(name) {
            Some(&idx) => {
                self.globals[idx] = value.into();
                Ok(())
            }
            None => Err(LokumError::Script(format!("'{name}' is not defined"))),
        }
    }
}

impl Clone for Compiled {
    /// Clone for independent execution: bytecode is shared, every global is
    /// deep-copied.
    fn clone(&self) -> Compiled {
        Compiled {
            global_indexes: self.global_indexes.clone(),
            bytecode: Rc::clone(&self.bytecode),
            globals: self.globals.iter().map(|g| g.deep_copy()).collect(),
            max_allocs: self.max_allocs,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// eval
// ─────────────────────────────────────────────────────────────────────────────

/// Evaluate a single expression with the given parameters.
pub fn eval(expr: &str, params: &[(&str, Value)]) -> Result<Value, LokumError> {
    eval_with_flag(expr, params, None)
}

/// [`eval`] with an optional abort flag.
pub fn eval_with_flag(
    expr: &str,
    params: &[(&str, Value)],
    flag: Option<&AbortFlag>,
) -> Result<Value, LokumError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(LokumError::Script("empty expression".to_string()));
    }

    let mut script = Script::new(format!("__res__ := ({expr})"));
    for (name, value) in params {
        script.add(name, value.clone());
    }
    let compiled = match flag {
        Some(flag) => script.run_with_flag(flag)?,
        None => script.run()?,
    };
    Ok(compiled.get("__res__").into_value())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RuntimeError;
    use std::time::Duration;

    #[test]
    fn test_compile_run_get() {
        let mut script = Script::new("toplam := a + b");
        script.add("a", 2i64);
        script.add("b", 40i64);
        let compiled = script.run().unwrap();
        assert_eq!(compiled.get("toplam").as_int(), 42);
        assert!(compiled.is_defined("toplam"));
        assert!(!compiled.is_defined("yok"));
    }

    #[test]
    fn test_set_and_rerun() {
        let mut script = Script::new("y := x * 2");
        script.add("x", 3i64);
        let mut compiled = script.run().unwrap();
        assert_eq!(compiled.get("y").as_int(), 6);

        compiled.set("x", 10i64).unwrap();
        compiled.run().unwrap();
        assert_eq!(compiled.get("y").as_int(), 20);

        assert!(compiled.set("z", 1i64).is_err());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut script = Script::new("l := [1, 2, 3]; tekrarla i := 0; i < uzunluk(l); i++ { l[i] = l[i] + ek }");
        script.add("ek", 0i64);
        let compiled = script.compile().unwrap();

        let mut a = compiled.clone();
        let mut b = compiled.clone();
        a.set("ek", 10i64).unwrap();
        b.set("ek", 100i64).unwrap();
        a.run().unwrap();
        b.run().unwrap();

        let la = a.get("l").as_array().unwrap();
        let lb = b.get("l").as_array().unwrap();
        assert!(la[0].value_equals(&Value::Int(11)));
        assert!(lb[0].value_equals(&Value::Int(101)));
    }

    #[test]
    fn test_get_all() {
        let script = Script::new("a := 1; b := 2");
        let compiled = script.run().unwrap();
        let names: Vec<String> = compiled
            .get_all()
            .into_iter()
            .map(|v| v.name().to_string())
            .collect();
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
    }

    #[test]
    fn test_max_const_objects() {
        let mut script = Script::new("a := [1, 2, 3, 4, 5]");
        script.set_max_const_objects(2);
        assert!(matches!(script.compile(), Err(LokumError::Script(_))));
    }

    #[test]
    fn test_max_allocs() {
        let mut script = Script::new("tekrarla i := 0; i < 100000; i++ { x := [i] }");
        script.set_max_allocs(32);
        let err = script.run().unwrap_err();
        match err {
            LokumError::Runtime(e) => assert_eq!(e.error, RuntimeError::ObjectAllocLimit),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_eval() {
        let out = eval("5 + a", &[("a", Value::Int(7))]).unwrap();
        assert!(out.value_equals(&Value::Int(12)));
        assert!(eval("   ", &[]).is_err());
    }

    #[test]
    fn test_run_with_flag_cancels() {
        let script = Script::new("tekrarla { }");
        let flag = AbortFlag::new();
        let remote = flag.clone();
        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.abort();
        });
        let err = script.run_with_flag(&flag).unwrap_err();
        killer.join().unwrap();
        match err {
            LokumError::Runtime(e) => assert_eq!(e.error, RuntimeError::Cancelled),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_injected_containers() {
        let mut script = Script::new("n := uzunluk(liste) + uzunluk(ad)");
        script.add(
            "liste",
            Value::array(vec![Value::Int(1), Value::Int(2)]),
        );
        script.add("ad", "abc");
        let compiled = script.run().unwrap();
        assert_eq!(compiled.get("n").as_int(), 5);
    }
}
