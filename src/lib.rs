//! The lokum language: compiler, bytecode VM and embedding API.
//!
//! The pipeline, leaves first:
//!
//! 1. **Positions** (`position`) — the file-set model every diagnostic
//!    resolves against.
//! 2. **Tokens** (`token`) and **scanner** (`scanner`) — tokenization with
//!    automatic semicolon insertion.
//! 3. **Parser** (`parser`) — precedence climbing into a typed [`ast`].
//! 4. **Symbol table** (`symbol_table`) — global/local/builtin/free scope
//!    analysis.
//! 5. **Values** (`value`) — the runtime [`Value`] enum and its operators.
//! 6. **Compiler** (`compiler`) — AST to byte-encoded instructions plus a
//!    constant pool.
//! 7. **VM** (`vm`) — the stack machine with frames, iterators and
//!    cooperative abort.
//! 8. **Codec** (`bytecode`) — persistence for compiled programs.
//!
//! # Entry points
//!
//! Most hosts use the [`Script`] API:
//!
//! ```rust,ignore
//! let mut script = lokum::Script::new("toplam := a + 1");
//! script.add("a", 41i64);
//! let compiled = script.run()?;
//! assert_eq!(compiled.get("toplam").as_int(), 42);
//! ```
//!
//! One-off expressions go through [`eval`]; the `lokum` binary wires the
//! same pieces into a CLI and REPL.

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod format;
pub mod iterator;
pub mod modules;
pub mod parser;
pub mod position;
pub mod scanner;
pub mod script;
pub mod stdlib;
pub mod symbol_table;
pub mod token;
pub mod value;
pub mod vm;

pub use modules::ModuleMap;
pub use script::{eval, Compiled, Script};
pub use value::{RuntimeError, Value, Variable};
pub use vm::{AbortFlag, Vm, VmError};

// ─────────────────────────────────────────────────────────────────────────────
// Limits
// ─────────────────────────────────────────────────────────────────────────────

/// Global slot array size per compiled program.
pub const GLOBALS_SIZE: usize = 1024;

/// Operand stack size.
pub const STACK_SIZE: usize = 2048;

/// Call frame limit.
pub const MAX_FRAMES: usize = 1024;

/// Longest representable string in bytes.
pub const MAX_STRING_LEN: usize = 2_147_483_647;

/// Longest representable byte string.
pub const MAX_BYTES_LEN: usize = 2_147_483_647;

// ─────────────────────────────────────────────────────────────────────────────
// Unified error type
// ─────────────────────────────────────────────────────────────────────────────

/// The unified error for every pipeline stage, so hosts can handle failures
/// uniformly or match on the stage.
#[derive(Debug, thiserror::Error)]
pub enum LokumError {
    /// Scanner/parser errors, reported as a batch.
    #[error("{0}")]
    Parse(#[from] parser::ErrorList),

    /// A compile-time error (name resolution, imports, structure).
    #[error("{0}")]
    Compile(#[from] compiler::CompileError),

    /// A positioned runtime error from the VM.
    #[error("{0}")]
    Runtime(#[from] vm::VmError),

    /// Bytecode persistence failure.
    #[error("{0}")]
    Codec(#[from] bytecode::CodecError),

    /// An embedding-API misuse (limits, undefined names, empty input).
    #[error("{0}")]
    Script(String),

    /// File access failure (imports, CLI input).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline helpers
// ─────────────────────────────────────────────────────────────────────────────

use std::path::Path;

/// Parse and compile `src` with file imports enabled, the way the CLI does.
/// `import_dir` is the base for file-relative imports when set.
pub fn compile_source(
    modules: &ModuleMap,
    src: &[u8],
    input_name: &str,
    import_dir: Option<&Path>,
) -> Result<bytecode::Bytecode, LokumError> {
    let mut file_set = position::SourceFileSet::new();
    let src_file = file_set.add_file(input_name, src.len());
    let ast = parser::Parser::new(src_file, src).parse_file()?;

    let mut compiler = compiler::Compiler::new(file_set, None, Vec::new(), modules.clone());
    compiler.enable_file_import(true);
    if let Some(dir) = import_dir {
        compiler.set_import_dir(dir);
    }
    compiler.compile(&ast)?;

    let (mut bytecode, _) = compiler.bytecode();
    bytecode.remove_duplicates();
    Ok(bytecode)
}

/// Compile and execute `src` in one step.
pub fn run_source(modules: &ModuleMap, src: &[u8], input_name: &str) -> Result<(), LokumError> {
    let bytecode = compile_source(modules, src, input_name, None)?;
    let mut globals = vec![Value::Undefined; GLOBALS_SIZE];
    Vm::new(&bytecode, &mut globals, -1).run()?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_source() {
        assert!(run_source(&ModuleMap::new(), b"a := 1 + 2", "t").is_ok());
        assert!(matches!(
            run_source(&ModuleMap::new(), b"a := ][", "t"),
            Err(LokumError::Parse(_))
        ));
        assert!(matches!(
            run_source(&ModuleMap::new(), b"a := bilinmeyen", "t"),
            Err(LokumError::Compile(_))
        ));
        assert!(matches!(
            run_source(&ModuleMap::new(), b"z := 0; a := 1 / z", "t"),
            Err(LokumError::Runtime(_))
        ));
    }

    #[test]
    fn test_codec_roundtrip_runs_identically() {
        let modules = ModuleMap::new();
        let bc = compile_source(
            &modules,
            b"s := 0; tekrarla i in aralik { s = s + i }",
            "t",
            None,
        );
        // `aralik` is undefined on purpose: verify compile error shape only.
        assert!(bc.is_err());

        let bc = compile_source(
            &modules,
            b"s := 0; tekrarla i in aral\xc4\xb1k(0, 5) { s = s + i }",
            "t",
            None,
        )
        .unwrap();

        let mut buf = Vec::new();
        bc.encode(&mut buf).unwrap();
        let decoded = bytecode::Bytecode::decode(&mut buf.as_slice(), &modules).unwrap();

        let mut g1 = vec![Value::Undefined; GLOBALS_SIZE];
        Vm::new(&bc, &mut g1, -1).run().unwrap();
        let mut g2 = vec![Value::Undefined; GLOBALS_SIZE];
        Vm::new(&decoded, &mut g2, -1).run().unwrap();

        for (a, b) in g1.iter().zip(&g2) {
            assert!(a.value_equals(b));
        }
    }
}
