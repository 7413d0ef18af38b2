//! The `lokum` command-line driver and REPL.
//!
//! ```text
//! lokum [seçenekler] [dosya]
//! ```
//!
//! Without a file the REPL starts.  A `.lokum` file is compiled and run;
//! any other file is treated as serialized bytecode.  `-o` compiles to a
//! bytecode file instead of running.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};

use lokum::ast::{CallExpr, Expr, ExprStmt, File, Ident, Stmt};
use lokum::bytecode::Bytecode;
use lokum::compiler::{Compiler, SOURCE_FILE_EXT};
use lokum::parser::Parser;
use lokum::position::SourceFileSet;
use lokum::symbol_table::SymbolTable;
use lokum::value::{to_string_lossy, Value};
use lokum::{ModuleMap, Vm, GLOBALS_SIZE};

const REPL_PROMPT: &str = ">> ";
const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Argument handling
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Args {
    compile_output: Option<String>,
    show_help: bool,
    show_version: bool,
    resolve_path: bool,
    input_file: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "-yardım" | "--yardım" | "-help" | "--help" => args.show_help = true,
            "-sürüm" | "--sürüm" | "-version" | "--version" => args.show_version = true,
            "-resolve" | "--resolve" => args.resolve_path = true,
            "-o" => {
                args.compile_output =
                    Some(argv.next().ok_or_else(|| anyhow!("-o requires a path"))?);
            }
            other if other.starts_with('-') => {
                return Err(anyhow!("unknown flag: {other}"));
            }
            other => {
                args.input_file = Some(other.to_string());
            }
        }
    }
    Ok(args)
}

fn print_usage() {
    println!("kullanım: lokum [seçenekler] [dosya]");
    println!();
    println!("  -o ÇIKTI    derle ve bytecode olarak yaz");
    println!("  -resolve    dosya importlarını script dizinine göre çöz");
    println!("  -sürüm      sürümü göster");
    println!("  -yardım     bu yardımı göster");
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry point
// ─────────────────────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };

    if args.show_help {
        print_usage();
        return ExitCode::from(2);
    }
    if args.show_version {
        println!("{VERSION}");
        return ExitCode::SUCCESS;
    }

    let modules = lokum::stdlib::get_module_map(&lokum::stdlib::all_module_names());

    let Some(ref input_file) = args.input_file else {
        run_repl(&modules);
        return ExitCode::SUCCESS;
    };

    let result = run_file(&args, &modules, &input_file);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run_file(args: &Args, modules: &ModuleMap, input_file: &str) -> Result<()> {
    let mut data = std::fs::read(input_file)
        .with_context(|| format!("cannot read file: {input_file}"))?;
    let input_path = std::fs::canonicalize(input_file)
        .with_context(|| format!("cannot resolve file: {input_file}"))?;

    // A shebang line becomes a comment.
    if data.starts_with(b"#!") {
        data[0] = b'/';
        data[1] = b'/';
    }

    if let Some(output) = &args.compile_output {
        compile_only(args, modules, &data, &input_path, output)
    } else if input_path
        .extension()
        .map_or(false, |ext| ext == SOURCE_FILE_EXT.trim_start_matches('.'))
    {
        compile_and_run(args, modules, &data, &input_path)
    } else {
        run_compiled(modules, &data)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Modes
// ─────────────────────────────────────────────────────────────────────────────

fn compile_src(
    args: &Args,
    modules: &ModuleMap,
    data: &[u8],
    input_path: &Path,
) -> Result<Bytecode> {
    let name = input_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "(main)".to_string());
    let import_dir = args
        .resolve_path
        .then(|| input_path.parent().map(Path::to_path_buf))
        .flatten();
    lokum::compile_source(modules, data, &name, import_dir.as_deref())
        .map_err(|err| anyhow!("{err}"))
}

fn compile_only(
    args: &Args,
    modules: &ModuleMap,
    data: &[u8],
    input_path: &Path,
    output: &str,
) -> Result<()> {
    let bytecode = compile_src(args, modules, data, input_path)?;

    let output_path = if output.is_empty() {
        default_output_path(input_path)
    } else {
        PathBuf::from(output)
    };
    let mut out = std::fs::File::create(&output_path)
        .with_context(|| format!("cannot create output: {}", output_path.display()))?;
    bytecode.encode(&mut out)?;
    println!("{}", output_path.display());
    Ok(())
}

fn compile_and_run(
    args: &Args,
    modules: &ModuleMap,
    data: &[u8],
    input_path: &Path,
) -> Result<()> {
    let bytecode = compile_src(args, modules, data, input_path)?;
    let mut globals = vec![Value::Undefined; GLOBALS_SIZE];
    Vm::new(&bytecode, &mut globals, -1).run()?;
    Ok(())
}

fn run_compiled(modules: &ModuleMap, data: &[u8]) -> Result<()> {
    let bytecode = Bytecode::decode(&mut &data[..], modules)?;
    let mut globals = vec![Value::Undefined; GLOBALS_SIZE];
    Vm::new(&bytecode, &mut globals, -1).run()?;
    Ok(())
}

fn default_output_path(input_path: &Path) -> PathBuf {
    let stem = input_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    PathBuf::from(format!("{stem}.out"))
}

// ─────────────────────────────────────────────────────────────────────────────
// REPL
// ─────────────────────────────────────────────────────────────────────────────

/// The hidden function every REPL result is printed through.
const REPL_PRINTLN: &str = "__repl_println__";

fn run_repl(modules: &ModuleMap) {
    let stdin = std::io::stdin();
    let mut file_set = SourceFileSet::new();
    let mut globals = vec![Value::Undefined; GLOBALS_SIZE];
    let mut constants: Vec<Value> = Vec::new();

    let mut symbol_table = SymbolTable::new();
    for (idx, b) in lokum::builtins::BUILTINS.iter().enumerate() {
        symbol_table.define_builtin(idx, b.name);
    }
    let println_symbol = symbol_table.define(REPL_PRINTLN);
    globals[println_symbol.borrow().index] = Value::user_function(REPL_PRINTLN, |args| {
        let parts: Vec<String> = args
            .iter()
            .map(|arg| to_string_lossy(arg).unwrap_or_else(|| "<undefined>".to_string()))
            .collect();
        println!("{}", parts.join(" "));
        Ok(Value::Undefined)
    });

    let mut symbol_table = Some(symbol_table);

    loop {
        print!("{REPL_PROMPT}");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end_matches(['\n', '\r']);

        let src_file = file_set.add_file("repl", line.len());
        let ast = match Parser::new(src_file, line.as_bytes()).parse_file() {
            Ok(ast) => ast,
            Err(errs) => {
                eprintln!("{errs}");
                continue;
            }
        };
        let ast = add_prints(ast);

        let mut compiler = Compiler::new(
            std::mem::take(&mut file_set),
            symbol_table.take(),
            std::mem::take(&mut constants),
            modules.clone(),
        );
        let compile_result = compiler.compile(&ast);
        let (bytecode, table) = compiler.bytecode();
        symbol_table = Some(table);

        if let Err(err) = compile_result {
            eprintln!("{err}");
        } else if let Err(err) = Vm::new(&bytecode, &mut globals, -1).run() {
            eprintln!("{err}");
        }

        // State carries over to the next line.
        file_set = bytecode.file_set;
        constants = bytecode.constants;
    }
}

/// Wrap every top-level expression and assignment so its value is printed
/// through the hidden `__repl_println__` global.
fn add_prints(file: File) -> File {
    let mut stmts = Vec::with_capacity(file.stmts.len());
    for stmt in file.stmts {
        match stmt {
            Stmt::Expr(s) => {
                stmts.push(Stmt::Expr(ExprStmt {
                    expr: repl_println_call(vec![s.expr]),
                }));
            }
            Stmt::Assign(s) => {
                let lhs = s.lhs.clone();
                stmts.push(Stmt::Assign(s));
                stmts.push(Stmt::Expr(ExprStmt {
                    expr: repl_println_call(lhs),
                }));
            }
            other => stmts.push(other),
        }
    }
    File {
        input_file: file.input_file,
        stmts,
    }
}

fn repl_println_call(args: Vec<Expr>) -> Expr {
    let pos = args
        .first()
        .map(|a| a.pos())
        .unwrap_or(lokum::position::Pos::NONE);
    Expr::Call(CallExpr {
        func: Box::new(Expr::Ident(Ident {
            name: REPL_PRINTLN.to_string(),
            name_pos: pos,
        })),
        lparen: pos,
        args,
        ellipsis: lokum::position::Pos::NONE,
        rparen: pos,
    })
}
