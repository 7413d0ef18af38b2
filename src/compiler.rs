//! AST → bytecode compiler.
//!
//! The compiler walks statements in one pass, maintaining a stack of
//! compilation scopes (one per function literal being compiled), a
//! [`SymbolTable`] tree for name resolution, and a loop stack for
//! `dur`/`devam` patching.  Jumps are emitted with placeholder operands and
//! patched once the target offset is known.
//!
//! # Source map
//!
//! One `(offset, position)` entry is recorded per statement start; runtime
//! errors resolve an `ip` to the nearest entry at or before it.
//!
//! # Closures
//!
//! A function literal compiles its body in a fresh scope and a non-block
//! symbol-table fork.  Free symbols collected by the fork are materialized
//! in the *enclosing* function with `GETLP`/`GETFP` and bound with
//! `CLOSURE idx, n`; capture-free literals are plain `CONST` loads.
//!
//! # Imports
//!
//! `kullan("name")` resolves against the [`ModuleMap`]: builtin modules
//! become `ImmutableMap` constants, source modules compile (once per run)
//! into zero-parameter functions that are called immediately, and — when
//! file imports are enabled — unknown names are read from the import
//! directory as `.lokum` files.

use std::path::PathBuf;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::ast::*;
use crate::bytecode::{make_instruction, Bytecode, Opcode};
use crate::modules::{Importable, ModuleMap};
use crate::parser::Parser;
use crate::position::{Pos, SourceFileSet, SourceFilePos};
use crate::symbol_table::{SymbolRef, SymbolScope, SymbolTable};
use crate::token::Token;
use crate::value::{CompiledFunction, Value};

/// Source file extension used for file imports.
pub const SOURCE_FILE_EXT: &str = ".lokum";

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// A compile-time error; compilation halts at the first one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Compile Error: {message}\n\tat {pos}")]
pub struct CompileError {
    pub pos: SourceFilePos,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Scopes
// ─────────────────────────────────────────────────────────────────────────────

/// Instruction buffer for one function being compiled.
#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Vec<u8>,
    /// Per-statement `(offset, pos)` entries, offsets ascending.
    source_map: Vec<(usize, Pos)>,
    /// Opcode of the most recently emitted instruction.
    last_op: Option<Opcode>,
}

/// Patch lists for one active loop.
#[derive(Debug, Default)]
struct LoopScope {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiler
// ─────────────────────────────────────────────────────────────────────────────

/// The bytecode compiler.  Create with [`Compiler::new`], feed it a parsed
/// [`File`] via [`Compiler::compile`], then call [`Compiler::bytecode`].
pub struct Compiler {
    file_set: SourceFileSet,
    symbol_table: SymbolTable,
    constants: Vec<Value>,
    scopes: Vec<CompilationScope>,
    loops: Vec<LoopScope>,
    modules: ModuleMap,
    /// Source modules already compiled in this run.
    compiled_modules: FxHashMap<String, Rc<CompiledFunction>>,
    /// Non-empty while compiling a module body; gates `paylaş`.
    module_name: String,
    allow_file_import: bool,
    import_dir: PathBuf,
}

impl Compiler {
    /// Create a compiler over a file set whose last added file is the one
    /// being compiled.
    ///
    /// Passing an existing `symbol_table` and `constants` continues a
    /// previous compilation (the REPL does this); `None` starts fresh with
    /// all builtins registered.
    pub fn new(
        file_set: SourceFileSet,
        symbol_table: Option<SymbolTable>,
        constants: Vec<Value>,
        modules: ModuleMap,
    ) -> Compiler {
        let symbol_table = symbol_table.unwrap_or_else(|| {
            let mut table = SymbolTable::new();
            for (idx, b) in crate::builtins::BUILTINS.iter().enumerate() {
                table.define_builtin(idx, b.name);
            }
            table
        });
        Compiler {
            file_set,
            symbol_table,
            constants,
            scopes: vec![CompilationScope::default()],
            loops: Vec::new(),
            modules,
            compiled_modules: FxHashMap::default(),
            module_name: String::new(),
            allow_file_import: false,
            import_dir: PathBuf::new(),
        }
    }

    /// Allow `kullan` to read `.lokum` files from the import directory.
    pub fn enable_file_import(&mut self, enable: bool) {
        self.allow_file_import = enable;
    }

    /// Base directory for file imports.
    pub fn set_import_dir(&mut self, dir: impl Into<PathBuf>) {
        self.import_dir = dir.into();
    }

    /// Compile a parsed file into the current scope.
    pub fn compile(&mut self, file: &File) -> Result<(), CompileError> {
        for stmt in &file.stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    /// Finish: build the [`Bytecode`] (main function gains a trailing
    /// `SUSPEND` so the VM exits cleanly) and hand the symbol table back for
    /// reuse.
    pub fn bytecode(mut self) -> (Bytecode, SymbolTable) {
        let mut scope = self.scopes.pop().expect("no compilation scope");
        scope
            .instructions
            .extend(make_instruction(Opcode::Suspend, &[]));
        let main_function = Rc::new(CompiledFunction {
            instructions: Rc::new(scope.instructions),
            num_locals: 0,
            num_parameters: 0,
            var_args: false,
            source_map: scope.source_map,
            free: Vec::new(),
        });
        (
            Bytecode {
                file_set: self.file_set,
                main_function,
                constants: self.constants,
            },
            self.symbol_table,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────────

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        self.record_source_pos(stmt.pos());

        match stmt {
            Stmt::Expr(s) => {
                self.compile_expr(&s.expr)?;
                self.emit(Opcode::Pop, &[]);
            }
            Stmt::Assign(s) => {
                self.compile_assign(s.token_pos, &s.lhs, &s.rhs, s.token)?;
            }
            Stmt::IncDec(s) => {
                let op = if s.token == Token::Inc {
                    Token::AddAssign
                } else {
                    Token::SubAssign
                };
                let one = Expr::Int(IntLit {
                    value: 1,
                    value_pos: s.token_pos,
                    literal: "1".to_string(),
                });
                self.compile_assign(
                    s.token_pos,
                    std::slice::from_ref(&s.expr),
                    std::slice::from_ref(&one),
                    op,
                )?;
            }
            Stmt::Block(s) => self.compile_block(s)?,
            Stmt::If(s) => self.compile_if_stmt(s)?,
            Stmt::For(s) => self.compile_for_stmt(s)?,
            Stmt::ForIn(s) => self.compile_for_in_stmt(s)?,
            Stmt::Return(s) => {
                if self.scopes.len() == 1 && self.module_name.is_empty() {
                    return Err(self.error_at(s.return_pos, "'dön' not allowed outside a function"));
                }
                match &s.result {
                    Some(result) => {
                        self.compile_expr(result)?;
                        self.emit(Opcode::Return, &[1]);
                    }
                    None => {
                        self.emit(Opcode::Return, &[0]);
                    }
                }
            }
            Stmt::Export(s) => {
                if self.module_name.is_empty() {
                    return Err(
                        self.error_at(s.export_pos, "'paylaş' not allowed outside a module")
                    );
                }
                self.compile_expr(&s.result)?;
                self.emit(Opcode::Immutable, &[]);
                self.emit(Opcode::Return, &[1]);
            }
            Stmt::Branch(s) => {
                let jump_pos = self.emit(Opcode::Jump, &[0]);
                let Some(current) = self.loops.last_mut() else {
                    let what = s.token.text();
                    return Err(self.error_at(s.token_pos, format!("'{what}' outside a loop")));
                };
                if s.token == Token::Break {
                    current.breaks.push(jump_pos);
                } else {
                    current.continues.push(jump_pos);
                }
            }
            Stmt::Empty(_) => {}
            Stmt::Bad(s) => return Err(self.error_at(s.from, "invalid statement")),
        }
        Ok(())
    }

    fn compile_block(&mut self, block: &BlockStmt) -> Result<(), CompileError> {
        if block.stmts.is_empty() {
            return Ok(());
        }
        self.fork_symbol_table(true);
        let result = block.stmts.iter().try_for_each(|s| self.compile_stmt(s));
        self.unfork_symbol_table();
        result
    }

    fn compile_if_stmt(&mut self, stmt: &IfStmt) -> Result<(), CompileError> {
        self.fork_symbol_table(true);
        let result = self.compile_if_inner(stmt);
        self.unfork_symbol_table();
        result
    }

    fn compile_if_inner(&mut self, stmt: &IfStmt) -> Result<(), CompileError> {
        if let Some(init) = &stmt.init {
            self.compile_stmt(init)?;
        }
        self.compile_expr(&stmt.cond)?;

        let jump_to_else = self.emit(Opcode::JumpFalsy, &[0]);
        self.compile_block(&stmt.body)?;

        match &stmt.else_stmt {
            Some(else_stmt) => {
                let jump_to_end = self.emit(Opcode::Jump, &[0]);
                self.patch_jump(jump_to_else);
                self.compile_stmt(else_stmt)?;
                self.patch_jump(jump_to_end);
            }
            None => self.patch_jump(jump_to_else),
        }
        Ok(())
    }

    fn compile_for_stmt(&mut self, stmt: &ForStmt) -> Result<(), CompileError> {
        self.fork_symbol_table(true);
        let result = self.compile_for_inner(stmt);
        self.unfork_symbol_table();
        result
    }

    fn compile_for_inner(&mut self, stmt: &ForStmt) -> Result<(), CompileError> {
        if let Some(init) = &stmt.init {
            self.compile_stmt(init)?;
        }

        let pre_cond_pos = self.current_offset();
        let post_cond_jump = match &stmt.cond {
            Some(cond) => {
                self.compile_expr(cond)?;
                Some(self.emit(Opcode::JumpFalsy, &[0]))
            }
            None => None,
        };

        self.loops.push(LoopScope::default());
        let body_result = self.compile_block(&stmt.body);
        let loop_scope = self.loops.pop().expect("loop stack unbalanced");
        body_result?;

        // `devam` targets the post statement.
        let post_body_pos = self.current_offset();
        if let Some(post) = &stmt.post {
            self.compile_stmt(post)?;
        }
        self.emit(Opcode::Jump, &[pre_cond_pos]);

        let post_stmt_pos = self.current_offset();
        if let Some(jump) = post_cond_jump {
            self.change_operand(jump, post_stmt_pos);
        }
        for pos in loop_scope.breaks {
            self.change_operand(pos, post_stmt_pos);
        }
        for pos in loop_scope.continues {
            self.change_operand(pos, post_body_pos);
        }
        Ok(())
    }

    fn compile_for_in_stmt(&mut self, stmt: &ForInStmt) -> Result<(), CompileError> {
        self.fork_symbol_table(true);
        let result = self.compile_for_in_inner(stmt);
        self.unfork_symbol_table();
        result
    }

    /// Lower `tekrarla k, v in x { … }` to explicit iterator opcodes over a
    /// hidden `:it` variable.
    fn compile_for_in_inner(&mut self, stmt: &ForInStmt) -> Result<(), CompileError> {
        let it_symbol = self.symbol_table.define(":it");

        self.compile_expr(&stmt.iterable)?;
        self.emit(Opcode::IteratorInit, &[]);
        self.store_symbol(&it_symbol, true);

        let pre_cond_pos = self.current_offset();
        self.load_symbol(&it_symbol);
        self.emit(Opcode::IteratorNext, &[]);
        let post_cond_jump = self.emit(Opcode::JumpFalsy, &[0]);

        self.loops.push(LoopScope::default());
        let body_result = (|| {
            if stmt.key.name != "_" {
                let key_symbol = self.symbol_table.define(&stmt.key.name);
                self.load_symbol(&it_symbol);
                self.emit(Opcode::IteratorKey, &[]);
                self.store_symbol(&key_symbol, true);
            }
            if let Some(value) = &stmt.value {
                if value.name != "_" {
                    let value_symbol = self.symbol_table.define(&value.name);
                    self.load_symbol(&it_symbol);
                    self.emit(Opcode::IteratorValue, &[]);
                    self.store_symbol(&value_symbol, true);
                }
            }
            self.compile_block(&stmt.body)
        })();
        let loop_scope = self.loops.pop().expect("loop stack unbalanced");
        body_result?;

        let post_body_pos = self.current_offset();
        self.emit(Opcode::Jump, &[pre_cond_pos]);

        let post_stmt_pos = self.current_offset();
        self.change_operand(post_cond_jump, post_stmt_pos);
        for pos in loop_scope.breaks {
            self.change_operand(pos, post_stmt_pos);
        }
        for pos in loop_scope.continues {
            self.change_operand(pos, post_body_pos);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Assignment
    // ─────────────────────────────────────────────────────────────────────────

    fn compile_assign(
        &mut self,
        pos: Pos,
        lhs: &[Expr],
        rhs: &[Expr],
        op: Token,
    ) -> Result<(), CompileError> {
        if lhs.len() != 1 || rhs.len() != 1 {
            return Err(self.error_at(pos, "tuple assignment not allowed"));
        }

        let (ident, selectors) = match resolve_assign_lhs(&lhs[0]) {
            Some(parts) => parts,
            None => return Err(self.error_at(lhs[0].pos(), "cannot assign to this expression")),
        };
        let num_sel = selectors.len();

        if op == Token::Define && num_sel > 0 {
            return Err(self.error_at(pos, "operator ':=' not allowed with selector"));
        }

        let is_func = matches!(rhs[0], Expr::Func(_));
        let resolved = self.symbol_table.resolve(&ident.name, false);
        let mut symbol: Option<SymbolRef> = None;

        if op == Token::Define {
            if let Some((_, 0)) = &resolved {
                return Err(self.error_at(
                    pos,
                    format!("'{}' redeclared in this block", ident.name),
                ));
            }
            // A named function is defined before its body compiles, so it
            // can capture itself recursively.
            if is_func {
                symbol = Some(self.symbol_table.define(&ident.name));
            }
        } else {
            match resolved {
                Some((sym, _)) => symbol = Some(sym),
                None => {
                    return Err(self.error_at(
                        pos,
                        format!("unresolved reference '{}'", ident.name),
                    ))
                }
            }
        }

        // Compound assignment loads the old value first.
        let binary_token = match op {
            Token::AddAssign => Some(Token::Add),
            Token::SubAssign => Some(Token::Sub),
            Token::MulAssign => Some(Token::Mul),
            Token::QuoAssign => Some(Token::Quo),
            Token::RemAssign => Some(Token::Rem),
            Token::AndAssign => Some(Token::And),
            Token::OrAssign => Some(Token::Or),
            Token::XorAssign => Some(Token::Xor),
            Token::ShlAssign => Some(Token::Shl),
            Token::ShrAssign => Some(Token::Shr),
            Token::AndNotAssign => Some(Token::AndNot),
            _ => None,
        };
        if binary_token.is_some() {
            self.compile_expr(&lhs[0])?;
        }

        self.compile_expr(&rhs[0])?;

        if let Some(tok) = binary_token {
            self.emit(Opcode::BinaryOp, &[tok.as_byte() as usize]);
        }

        let symbol = match symbol {
            Some(symbol) => symbol,
            // Plain `x := value` defines after the RHS compiled, so the RHS
            // still sees any outer `x`.
            None => self.symbol_table.define(&ident.name),
        };

        let (scope, index) = {
            let s = symbol.borrow();
            (s.scope, s.index)
        };
        match scope {
            SymbolScope::Global => {
                if num_sel > 0 {
                    for sel in &selectors {
                        self.compile_expr(sel)?;
                    }
                    self.emit(Opcode::SetSelGlobal, &[index, num_sel]);
                } else {
                    self.emit(Opcode::SetGlobal, &[index]);
                }
            }
            SymbolScope::Local => {
                if num_sel > 0 {
                    for sel in &selectors {
                        self.compile_expr(sel)?;
                    }
                    self.emit(Opcode::SetSelLocal, &[index, num_sel]);
                } else if op == Token::Define && !symbol.borrow().local_assigned {
                    self.emit(Opcode::DefineLocal, &[index]);
                } else {
                    self.emit(Opcode::SetLocal, &[index]);
                }
                symbol.borrow_mut().local_assigned = true;
            }
            SymbolScope::Free => {
                if num_sel > 0 {
                    for sel in &selectors {
                        self.compile_expr(sel)?;
                    }
                    self.emit(Opcode::SetSelFree, &[index, num_sel]);
                } else {
                    self.emit(Opcode::SetFree, &[index]);
                }
            }
            SymbolScope::Builtin => {
                return Err(
                    self.error_at(pos, format!("cannot assign to builtin '{}'", ident.name))
                );
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Expressions
    // ─────────────────────────────────────────────────────────────────────────

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Binary(e) => self.compile_binary_expr(e)?,
            Expr::Unary(e) => {
                self.compile_expr(&e.expr)?;
                match e.token {
                    Token::Not => {
                        self.emit(Opcode::LNot, &[]);
                    }
                    Token::Sub => {
                        self.emit(Opcode::Minus, &[]);
                    }
                    Token::Xor => {
                        self.emit(Opcode::BComplement, &[]);
                    }
                    // Unary plus is the identity.
                    Token::Add => {}
                    _ => return Err(self.error_at(e.token_pos, "invalid unary operator")),
                }
            }
            Expr::Int(e) => {
                let idx = self.add_constant(Value::Int(e.value));
                self.emit(Opcode::Const, &[idx]);
            }
            Expr::Float(e) => {
                let idx = self.add_constant(Value::Float(e.value));
                self.emit(Opcode::Const, &[idx]);
            }
            Expr::Char(e) => {
                let idx = self.add_constant(Value::Char(e.value));
                self.emit(Opcode::Const, &[idx]);
            }
            Expr::String(e) => {
                let idx = self.add_constant(Value::string(e.value.clone()));
                self.emit(Opcode::Const, &[idx]);
            }
            Expr::Bool(e) => {
                self.emit(if e.value { Opcode::True } else { Opcode::False }, &[]);
            }
            Expr::Undefined(_) => {
                self.emit(Opcode::Null, &[]);
            }
            Expr::Ident(e) => {
                let Some((symbol, _)) = self.symbol_table.resolve(&e.name, false) else {
                    return Err(
                        self.error_at(e.name_pos, format!("unresolved reference '{}'", e.name))
                    );
                };
                self.load_symbol(&symbol);
            }
            Expr::Array(e) => {
                for element in &e.elements {
                    self.compile_expr(element)?;
                }
                self.emit(Opcode::Array, &[e.elements.len()]);
            }
            Expr::Map(e) => {
                for element in &e.elements {
                    let idx = self.add_constant(Value::string(element.key.clone()));
                    self.emit(Opcode::Const, &[idx]);
                    self.compile_expr(&element.value)?;
                }
                self.emit(Opcode::Map, &[e.elements.len() * 2]);
            }
            Expr::Selector(e) => {
                self.compile_expr(&e.expr)?;
                let idx = self.add_constant(Value::string(e.sel.value.clone()));
                self.emit(Opcode::Const, &[idx]);
                self.emit(Opcode::Index, &[]);
            }
            Expr::Index(e) => {
                self.compile_expr(&e.expr)?;
                self.compile_expr(&e.index)?;
                self.emit(Opcode::Index, &[]);
            }
            Expr::Slice(e) => {
                self.compile_expr(&e.expr)?;
                match &e.low {
                    Some(low) => self.compile_expr(low)?,
                    None => {
                        self.emit(Opcode::Null, &[]);
                    }
                }
                match &e.high {
                    Some(high) => self.compile_expr(high)?,
                    None => {
                        self.emit(Opcode::Null, &[]);
                    }
                }
                self.emit(Opcode::SliceIndex, &[]);
            }
            Expr::Cond(e) => {
                self.compile_expr(&e.cond)?;
                let jump_to_false = self.emit(Opcode::JumpFalsy, &[0]);
                self.compile_expr(&e.true_expr)?;
                let jump_to_end = self.emit(Opcode::Jump, &[0]);
                self.patch_jump(jump_to_false);
                self.compile_expr(&e.false_expr)?;
                self.patch_jump(jump_to_end);
            }
            Expr::Call(e) => {
                self.compile_expr(&e.func)?;
                for arg in &e.args {
                    self.compile_expr(arg)?;
                }
                let spread = e.ellipsis.is_valid() as usize;
                self.emit(Opcode::Call, &[e.args.len(), spread]);
            }
            Expr::Error(e) => {
                self.compile_expr(&e.expr)?;
                self.emit(Opcode::Error, &[]);
            }
            Expr::Immutable(e) => {
                self.compile_expr(&e.expr)?;
                self.emit(Opcode::Immutable, &[]);
            }
            Expr::Func(e) => self.compile_func_lit(e)?,
            Expr::Import(e) => self.compile_import(e)?,
            Expr::Paren(e) => self.compile_expr(&e.expr)?,
            Expr::Bad(e) => return Err(self.error_at(e.from, "invalid expression")),
        }
        Ok(())
    }

    fn compile_binary_expr(&mut self, e: &BinaryExpr) -> Result<(), CompileError> {
        if e.token == Token::LAnd || e.token == Token::LOr {
            // Short-circuit: the jump keeps a deciding LHS on the stack and
            // skips the RHS entirely.
            self.compile_expr(&e.lhs)?;
            let op = if e.token == Token::LAnd {
                Opcode::AndJump
            } else {
                Opcode::OrJump
            };
            let jump_pos = self.emit(op, &[0]);
            self.compile_expr(&e.rhs)?;
            self.patch_jump(jump_pos);
            return Ok(());
        }

        // `a > b` is compiled as `b < a`.
        if e.token == Token::Greater || e.token == Token::GreaterEq {
            self.compile_expr(&e.rhs)?;
            self.compile_expr(&e.lhs)?;
            let tok = if e.token == Token::Greater {
                Token::Less
            } else {
                Token::LessEq
            };
            self.emit(Opcode::BinaryOp, &[tok.as_byte() as usize]);
            return Ok(());
        }

        self.compile_expr(&e.lhs)?;
        self.compile_expr(&e.rhs)?;
        match e.token {
            Token::Equal => {
                self.emit(Opcode::Equal, &[]);
            }
            Token::NotEqual => {
                self.emit(Opcode::NotEqual, &[]);
            }
            Token::Add
            | Token::Sub
            | Token::Mul
            | Token::Quo
            | Token::Rem
            | Token::And
            | Token::Or
            | Token::Xor
            | Token::Shl
            | Token::Shr
            | Token::AndNot
            | Token::Less
            | Token::LessEq => {
                self.emit(Opcode::BinaryOp, &[e.token.as_byte() as usize]);
            }
            _ => return Err(self.error_at(e.token_pos, "invalid binary operator")),
        }
        Ok(())
    }

    fn compile_func_lit(&mut self, lit: &FuncLit) -> Result<(), CompileError> {
        self.enter_scope();

        for param in &lit.params.list {
            let symbol = self.symbol_table.define(&param.name);
            // Parameters are assigned by the calling convention.
            symbol.borrow_mut().local_assigned = true;
        }

        let body_result = lit.body.stmts.iter().try_for_each(|s| self.compile_stmt(s));
        if body_result.is_ok() && self.current_scope().last_op != Some(Opcode::Return) {
            self.emit(Opcode::Return, &[0]);
        }

        let free_symbols = self.symbol_table.free_symbols();
        let num_locals = self.symbol_table.max_symbols();
        let scope = self.leave_scope();
        body_result?;

        for symbol in &free_symbols {
            let (scope_kind, index, assigned) = {
                let s = symbol.borrow();
                (s.scope, s.index, s.local_assigned)
            };
            match scope_kind {
                SymbolScope::Local => {
                    if !assigned {
                        // Capturing a local that has no value yet (a local
                        // recursive function): give the slot a cell now.
                        self.emit(Opcode::Null, &[]);
                        self.emit(Opcode::DefineLocal, &[index]);
                        symbol.borrow_mut().local_assigned = true;
                    }
                    self.emit(Opcode::GetLocalPtr, &[index]);
                }
                SymbolScope::Free => {
                    self.emit(Opcode::GetFreePtr, &[index]);
                }
                _ => {
                    return Err(self.error_at(
                        lit.func_pos,
                        "free variable resolved to a non-capturable scope",
                    ))
                }
            }
        }

        let func = Value::Function(Rc::new(CompiledFunction {
            instructions: Rc::new(scope.instructions),
            num_locals,
            num_parameters: lit.params.list.len(),
            var_args: lit.params.var_args,
            source_map: scope.source_map,
            free: Vec::new(),
        }));
        let idx = self.add_constant(func);

        if free_symbols.is_empty() {
            self.emit(Opcode::Const, &[idx]);
        } else {
            self.emit(Opcode::Closure, &[idx, free_symbols.len()]);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Imports
    // ─────────────────────────────────────────────────────────────────────────

    fn compile_import(&mut self, e: &ImportExpr) -> Result<(), CompileError> {
        if e.module_name.is_empty() {
            return Err(self.error_at(e.token_pos, "empty module name"));
        }

        match self.modules.get(&e.module_name).cloned() {
            Some(Importable::Builtin(module)) => {
                let map = module.as_immutable_map(&e.module_name);
                let idx = self.add_constant(map);
                self.emit(Opcode::Const, &[idx]);
            }
            Some(Importable::Source(src)) => {
                let compiled = self.compile_module(e.token_pos, &e.module_name, &src)?;
                let idx = self.add_constant(Value::Function(compiled));
                self.emit(Opcode::Const, &[idx]);
                self.emit(Opcode::Call, &[0, 0]);
            }
            None if self.allow_file_import => {
                let mut module_name = e.module_name.clone();
                if !module_name.ends_with(SOURCE_FILE_EXT) {
                    module_name.push_str(SOURCE_FILE_EXT);
                }
                let module_path = self.import_dir.join(&module_name);
                let src = std::fs::read(&module_path).map_err(|err| {
                    self.error_at(
                        e.token_pos,
                        format!("module file read error: {}: {err}", module_path.display()),
                    )
                })?;
                let path_key = module_path.to_string_lossy().into_owned();
                let compiled = self.compile_module(e.token_pos, &path_key, &src)?;
                let idx = self.add_constant(Value::Function(compiled));
                self.emit(Opcode::Const, &[idx]);
                self.emit(Opcode::Call, &[0, 0]);
            }
            None => {
                return Err(self.error_at(
                    e.token_pos,
                    format!("module '{}' not found", e.module_name),
                ))
            }
        }
        Ok(())
    }

    /// Compile a source module into a zero-parameter function.  Each module
    /// compiles once per run; later imports reuse the cached function.
    fn compile_module(
        &mut self,
        pos: Pos,
        module_name: &str,
        src: &[u8],
    ) -> Result<Rc<CompiledFunction>, CompileError> {
        if let Some(compiled) = self.compiled_modules.get(module_name) {
            return Ok(Rc::clone(compiled));
        }

        let mod_file = self.file_set.add_file(module_name, src.len());
        let ast = Parser::new(mod_file, src)
            .parse_file()
            .map_err(|errs| self.error_at(pos, errs.to_string()))?;

        // Modules see builtins but nothing else from the importing scope.
        let mut mod_table = SymbolTable::new();
        for symbol in self.symbol_table.builtin_symbols() {
            let s = symbol.borrow();
            mod_table.define_builtin(s.index, &s.name);
        }
        let mod_table = mod_table.fork(false);

        let saved_table = std::mem::replace(&mut self.symbol_table, mod_table);
        let saved_scopes = std::mem::replace(&mut self.scopes, vec![CompilationScope::default()]);
        let saved_loops = std::mem::take(&mut self.loops);
        let saved_module = std::mem::replace(&mut self.module_name, module_name.to_string());

        let result = self.compile(&ast);
        if result.is_ok() && self.current_scope().last_op != Some(Opcode::Return) {
            self.emit(Opcode::Return, &[0]);
        }
        let num_locals = self.symbol_table.max_symbols();
        let scope = self.scopes.pop().expect("module scope missing");

        self.symbol_table = saved_table;
        self.scopes = saved_scopes;
        self.loops = saved_loops;
        self.module_name = saved_module;
        result?;

        let compiled = Rc::new(CompiledFunction {
            instructions: Rc::new(scope.instructions),
            num_locals,
            num_parameters: 0,
            var_args: false,
            source_map: scope.source_map,
            free: Vec::new(),
        });
        self.compiled_modules
            .insert(module_name.to_string(), Rc::clone(&compiled));
        Ok(compiled)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Symbol load/store
    // ─────────────────────────────────────────────────────────────────────────

    fn load_symbol(&mut self, symbol: &SymbolRef) {
        let (scope, index) = {
            let s = symbol.borrow();
            (s.scope, s.index)
        };
        match scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[index]),
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[index]),
            SymbolScope::Builtin => self.emit(Opcode::GetBuiltin, &[index]),
            SymbolScope::Free => self.emit(Opcode::GetFree, &[index]),
        };
    }

    /// Store the top of stack into `symbol`; `define` marks the defining
    /// assignment of a local.
    fn store_symbol(&mut self, symbol: &SymbolRef, define: bool) {
        let (scope, index) = {
            let s = symbol.borrow();
            (s.scope, s.index)
        };
        match scope {
            SymbolScope::Global => {
                self.emit(Opcode::SetGlobal, &[index]);
            }
            SymbolScope::Local => {
                if define && !symbol.borrow().local_assigned {
                    self.emit(Opcode::DefineLocal, &[index]);
                } else {
                    self.emit(Opcode::SetLocal, &[index]);
                }
                symbol.borrow_mut().local_assigned = true;
            }
            SymbolScope::Free => {
                self.emit(Opcode::SetFree, &[index]);
            }
            SymbolScope::Builtin => unreachable!("store into builtin"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Emission plumbing
    // ─────────────────────────────────────────────────────────────────────────

    fn current_scope(&self) -> &CompilationScope {
        self.scopes.last().expect("no compilation scope")
    }

    fn current_scope_mut(&mut self) -> &mut CompilationScope {
        self.scopes.last_mut().expect("no compilation scope")
    }

    fn current_offset(&self) -> usize {
        self.current_scope().instructions.len()
    }

    /// Append one instruction; returns its offset.
    fn emit(&mut self, op: Opcode, operands: &[usize]) -> usize {
        let ins = make_instruction(op, operands);
        let scope = self.current_scope_mut();
        let pos = scope.instructions.len();
        scope.instructions.extend(ins);
        scope.last_op = Some(op);
        pos
    }

    /// Point the jump at `op_pos` to the current end of the buffer.
    fn patch_jump(&mut self, op_pos: usize) {
        let target = self.current_offset();
        self.change_operand(op_pos, target);
    }

    /// Rewrite the (single) operand of the instruction at `op_pos`.
    fn change_operand(&mut self, op_pos: usize, operand: usize) {
        let scope = self.current_scope_mut();
        let op = Opcode::try_from(scope.instructions[op_pos]).expect("bad opcode at patch site");
        let ins = make_instruction(op, &[operand]);
        scope.instructions[op_pos..op_pos + ins.len()].copy_from_slice(&ins);
    }

    fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn record_source_pos(&mut self, pos: Pos) {
        let offset = self.current_offset();
        let scope = self.current_scope_mut();
        match scope.source_map.last_mut() {
            Some(last) if last.0 == offset => last.1 = pos,
            _ => scope.source_map.push((offset, pos)),
        }
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        self.fork_symbol_table(false);
    }

    fn leave_scope(&mut self) -> CompilationScope {
        let scope = self.scopes.pop().expect("leave_scope on root");
        self.unfork_symbol_table();
        scope
    }

    fn fork_symbol_table(&mut self, block: bool) {
        let table = std::mem::take(&mut self.symbol_table);
        self.symbol_table = table.fork(block);
    }

    fn unfork_symbol_table(&mut self) {
        let table = std::mem::take(&mut self.symbol_table);
        self.symbol_table = table.unfork();
    }

    fn error_at(&self, pos: Pos, message: impl Into<String>) -> CompileError {
        CompileError {
            pos: self.file_set.position(pos),
            message: message.into(),
        }
    }
}

/// Split an assignable expression into its base identifier and the selector
/// chain applied to it (`a.b[0].c` → `a`, `["b", 0, "c"]`).
fn resolve_assign_lhs(expr: &Expr) -> Option<(&Ident, Vec<Expr>)> {
    match expr {
        Expr::Ident(ident) => Some((ident, Vec::new())),
        Expr::Selector(sel) => {
            let (ident, mut selectors) = resolve_assign_lhs(&sel.expr)?;
            selectors.push(Expr::String(sel.sel.clone()));
            Some((ident, selectors))
        }
        Expr::Index(index) => {
            let (ident, mut selectors) = resolve_assign_lhs(&index.expr)?;
            selectors.push((*index.index).clone());
            Some((ident, selectors))
        }
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn compile_src(src: &str) -> Bytecode {
        try_compile(src).expect("compile failed")
    }

    fn try_compile(src: &str) -> Result<Bytecode, CompileError> {
        let mut file_set = SourceFileSet::new();
        let file = parse_source(&mut file_set, "test", src.as_bytes()).expect("parse failed");
        let mut compiler = Compiler::new(file_set, None, Vec::new(), ModuleMap::new());
        compiler.compile(&file)?;
        Ok(compiler.bytecode().0)
    }

    fn disasm(src: &str) -> Vec<String> {
        compile_src(src).format_instructions()
    }

    #[test]
    fn test_constant_expression() {
        let lines = disasm("1 + 2");
        assert!(lines[0].contains("CONST"));
        assert!(lines[1].contains("CONST"));
        assert!(lines[2].contains("BINARYOP"));
        assert!(lines[3].contains("POP"));
        assert!(lines.last().unwrap().contains("SUSPEND"));
    }

    #[test]
    fn test_global_define_and_load() {
        let lines = disasm("a := 5; b := a");
        let text = lines.join("\n");
        assert!(text.contains("SETG"));
        assert!(text.contains("GETG"));
    }

    #[test]
    fn test_greater_swaps_operands() {
        let bc = compile_src("1 > 2");
        // Constants pushed in swapped order: 2 first.
        assert!(bc.constants[0].value_equals(&Value::Int(2)));
        assert!(bc.constants[1].value_equals(&Value::Int(1)));
    }

    #[test]
    fn test_short_circuit_jumps() {
        let text = disasm("doğru && yanlış").join("\n");
        assert!(text.contains("ANDJMP"));
        let text = disasm("doğru || yanlış").join("\n");
        assert!(text.contains("ORJMP"));
    }

    #[test]
    fn test_if_patches_forward() {
        let lines = disasm("eğer 1 { 2 } yoksa { 3 }");
        let text = lines.join("\n");
        assert!(text.contains("JMPF"));
        assert!(text.contains("JMP"));
    }

    #[test]
    fn test_function_literal_and_call() {
        let bc = compile_src("f := fn(a) { dön a }; f(1)");
        assert!(bc
            .constants
            .iter()
            .any(|c| matches!(c, Value::Function(_))));
        let text = bc.format_instructions().join("\n");
        assert!(text.contains("CALL"));
    }

    #[test]
    fn test_variadic_function() {
        let bc = compile_src("f := fn(a, ...rest) { dön rest }");
        let func = bc
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) => Some(f),
                _ => None,
            })
            .unwrap();
        assert!(func.var_args);
        assert_eq!(func.num_parameters, 2);
    }

    #[test]
    fn test_closure_emission() {
        let bc = compile_src("f := fn() { c := 0; dön fn() { c = c + 1; dön c } }");
        // The outer function body must capture `c` with GETLP + CLOSURE.
        let outer = bc
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(f) if f.num_locals > 0 => Some(f),
                _ => None,
            })
            .expect("outer function not found");
        let text = crate::bytecode::format_instructions(&outer.instructions, 0).join("\n");
        assert!(text.contains("GETLP"), "missing GETLP in:\n{text}");
        assert!(text.contains("CLOSURE"), "missing CLOSURE in:\n{text}");
    }

    #[test]
    fn test_for_in_lowering() {
        let text = disasm("tekrarla i in [1, 2] { i }").join("\n");
        assert!(text.contains("ITER"));
        assert!(text.contains("ITNXT"));
        assert!(text.contains("ITKEY"));
        assert!(text.contains("JMPF"));
    }

    #[test]
    fn test_selector_store() {
        let text = disasm("a := {}; a.b = 1").join("\n");
        assert!(text.contains("SETSG"));
        let text = disasm("a := {}; a.b.c = 1").join("\n");
        assert!(text.contains("SETSG"));
    }

    #[test]
    fn test_break_continue_require_loop() {
        assert!(try_compile("dur").is_err());
        assert!(try_compile("devam").is_err());
        assert!(try_compile("tekrarla { dur }").is_ok());
    }

    #[test]
    fn test_return_outside_function_rejected() {
        assert!(try_compile("dön 1").is_err());
    }

    #[test]
    fn test_export_outside_module_rejected() {
        assert!(try_compile("paylaş 1").is_err());
    }

    #[test]
    fn test_unresolved_reference() {
        let err = try_compile("yok_boyle_birsey + 1").unwrap_err();
        assert!(err.message.contains("unresolved reference"));
    }

    #[test]
    fn test_redeclaration_rejected() {
        assert!(try_compile("a := 1; a := 2").is_err());
        // Shadowing in an inner block is fine.
        assert!(try_compile("a := 1; eğer doğru { a := 2; a }").is_ok());
    }

    #[test]
    fn test_define_with_selector_rejected() {
        assert!(try_compile("m := {}; m.x := 1").is_err());
    }

    #[test]
    fn test_builtin_module_import() {
        let mut modules = ModuleMap::new();
        modules.add_builtin_module("m", FxHashMap::default());

        let src = "x := kullan(\"m\")";
        let mut file_set = SourceFileSet::new();
        let file = parse_source(&mut file_set, "test", src.as_bytes()).unwrap();
        let mut compiler = Compiler::new(file_set, None, Vec::new(), modules);
        compiler.compile(&file).unwrap();
        let (bc, _) = compiler.bytecode();
        assert!(bc
            .constants
            .iter()
            .any(|c| matches!(c, Value::ImmutableMap(_))));
    }

    #[test]
    fn test_source_module_import_compiles_once() {
        let mut modules = ModuleMap::new();
        modules.add_source_module("x", "paylaş fn(a, b) { dön a + b }".as_bytes());

        let src = "a := kullan(\"x\"); b := kullan(\"x\")";
        let mut file_set = SourceFileSet::new();
        let file = parse_source(&mut file_set, "test", src.as_bytes()).unwrap();
        let mut compiler = Compiler::new(file_set, None, Vec::new(), modules);
        compiler.compile(&file).unwrap();
        let (bc, _) = compiler.bytecode();

        // The module function appears, and the cache makes both imports
        // share one compiled function (deduplicable by pointer).
        let module_fns: Vec<_> = bc
            .constants
            .iter()
            .filter_map(|c| match c {
                Value::Function(f) if f.num_parameters == 0 => Some(Rc::as_ptr(f)),
                _ => None,
            })
            .collect();
        assert_eq!(module_fns.len(), 2);
        assert_eq!(module_fns[0], module_fns[1]);
    }

    #[test]
    fn test_missing_module() {
        let err = try_compile("kullan(\"yok\")").unwrap_err();
        assert!(err.message.contains("not found"));
    }

    #[test]
    fn test_remove_duplicates_after_compile() {
        let mut bc = compile_src("a := 1; b := 1; c := \"s\"; d := \"s\"");
        let before = bc.constants.len();
        bc.remove_duplicates();
        assert!(bc.constants.len() < before);
    }

    #[test]
    fn test_source_map_records_statements() {
        let bc = compile_src("a := 1\nb := 2");
        assert!(bc.main_function.source_map.len() >= 2);
        let positions: Vec<_> = bc.main_function.source_map.iter().map(|&(o, _)| o).collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }
}
