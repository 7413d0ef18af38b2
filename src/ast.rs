//! Abstract syntax tree node types.
//!
//! The AST is the output of the parser and the input to the compiler.  Every
//! node carries [`Pos`] fields pointing back into the [`crate::position::SourceFileSet`]
//! so later stages can report positioned errors.
//!
//! `Display` implementations re-print each node as parseable source text;
//! re-parsing a printed tree yields an equivalent tree (modulo positions),
//! which the parser tests rely on.

use std::fmt;
use std::rc::Rc;

use crate::position::{Pos, SourceFile};
use crate::token::Token;

// ─────────────────────────────────────────────────────────────────────────────
// File
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed source file: a flat statement list.
#[derive(Debug, Clone)]
pub struct File {
    pub input_file: Rc<SourceFile>,
    pub stmts: Vec<Stmt>,
}

impl File {
    pub fn pos(&self) -> Pos {
        Pos(self.input_file.base)
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stmts: Vec<String> = self.stmts.iter().map(|s| s.to_string()).collect();
        f.write_str(&stmts.join("; "))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Expressions
// ─────────────────────────────────────────────────────────────────────────────

/// Every expression form in the language.
#[derive(Debug, Clone)]
pub enum Expr {
    Array(ArrayLit),
    Bad(BadExpr),
    Binary(BinaryExpr),
    Bool(BoolLit),
    Call(CallExpr),
    Char(CharLit),
    Cond(CondExpr),
    Error(ErrorExpr),
    Float(FloatLit),
    Func(Box<FuncLit>),
    Ident(Ident),
    Immutable(ImmutableExpr),
    Import(ImportExpr),
    Index(IndexExpr),
    Int(IntLit),
    Map(MapLit),
    Paren(ParenExpr),
    Selector(SelectorExpr),
    Slice(SliceExpr),
    String(StringLit),
    Unary(UnaryExpr),
    Undefined(UndefinedLit),
}

impl Expr {
    /// Position of the first character of the expression.
    pub fn pos(&self) -> Pos {
        match self {
            Expr::Array(e) => e.lbrack,
            Expr::Bad(e) => e.from,
            Expr::Binary(e) => e.lhs.pos(),
            Expr::Bool(e) => e.value_pos,
            Expr::Call(e) => e.func.pos(),
            Expr::Char(e) => e.value_pos,
            Expr::Cond(e) => e.cond.pos(),
            Expr::Error(e) => e.error_pos,
            Expr::Float(e) => e.value_pos,
            Expr::Func(e) => e.func_pos,
            Expr::Ident(e) => e.name_pos,
            Expr::Immutable(e) => e.immutable_pos,
            Expr::Import(e) => e.token_pos,
            Expr::Index(e) => e.expr.pos(),
            Expr::Int(e) => e.value_pos,
            Expr::Map(e) => e.lbrace,
            Expr::Paren(e) => e.lparen,
            Expr::Selector(e) => e.expr.pos(),
            Expr::Slice(e) => e.expr.pos(),
            Expr::String(e) => e.value_pos,
            Expr::Unary(e) => e.token_pos,
            Expr::Undefined(e) => e.token_pos,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Array(e) => {
                let els: Vec<String> = e.elements.iter().map(|x| x.to_string()).collect();
                write!(f, "[{}]", els.join(", "))
            }
            Expr::Bad(_) => f.write_str("<kötü ifade>"),
            Expr::Binary(e) => write!(f, "({} {} {})", e.lhs, e.token, e.rhs),
            Expr::Bool(e) => f.write_str(&e.literal),
            Expr::Call(e) => {
                let mut args: Vec<String> = e.args.iter().map(|x| x.to_string()).collect();
                if e.ellipsis.is_valid() {
                    if let Some(last) = args.last_mut() {
                        last.push_str("...");
                    }
                }
                write!(f, "{}({})", e.func, args.join(", "))
            }
            Expr::Char(e) => f.write_str(&e.literal),
            Expr::Cond(e) => write!(f, "({} ? {} : {})", e.cond, e.true_expr, e.false_expr),
            Expr::Error(e) => write!(f, "hata({})", e.expr),
            Expr::Float(e) => f.write_str(&e.literal),
            Expr::Func(e) => write!(f, "fn{} {}", e.params, e.body),
            Expr::Ident(e) => f.write_str(&e.name),
            Expr::Immutable(e) => write!(f, "sabit({})", e.expr),
            Expr::Import(e) => write!(f, "kullan(\"{}\")", e.module_name),
            Expr::Index(e) => write!(f, "{}[{}]", e.expr, e.index),
            Expr::Int(e) => f.write_str(&e.literal),
            Expr::Map(e) => {
                let els: Vec<String> = e.elements.iter().map(|x| x.to_string()).collect();
                write!(f, "{{{}}}", els.join(", "))
            }
            // Grouping is implied by the printed forms of the nodes inside,
            // so parens re-print transparently and printing is stable under
            // re-parsing.
            Expr::Paren(e) => e.expr.fmt(f),
            Expr::Selector(e) => write!(f, "{}.{}", e.expr, e.sel.value),
            Expr::Slice(e) => {
                let low = e.low.as_ref().map(|x| x.to_string()).unwrap_or_default();
                let high = e.high.as_ref().map(|x| x.to_string()).unwrap_or_default();
                write!(f, "{}[{}:{}]", e.expr, low, high)
            }
            Expr::String(e) => f.write_str(&e.literal),
            Expr::Unary(e) => write!(f, "({}{})", e.token, e.expr),
            Expr::Undefined(_) => f.write_str("tanımsız"),
        }
    }
}

/// `[a, b, c]`
#[derive(Debug, Clone)]
pub struct ArrayLit {
    pub elements: Vec<Expr>,
    pub lbrack: Pos,
    pub rbrack: Pos,
}

/// Placeholder produced when parsing fails; never reaches the compiler on a
/// clean parse.
#[derive(Debug, Clone)]
pub struct BadExpr {
    pub from: Pos,
    pub to: Pos,
}

/// `lhs op rhs`
#[derive(Debug, Clone)]
pub struct BinaryExpr {
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub token: Token,
    pub token_pos: Pos,
}

/// `doğru` / `yanlış`
#[derive(Debug, Clone)]
pub struct BoolLit {
    pub value: bool,
    pub value_pos: Pos,
    pub literal: String,
}

/// `f(a, b)` — with `ellipsis` set when the last argument is spread
/// (`f(args...)`).
#[derive(Debug, Clone)]
pub struct CallExpr {
    pub func: Box<Expr>,
    pub lparen: Pos,
    pub args: Vec<Expr>,
    pub ellipsis: Pos,
    pub rparen: Pos,
}

/// `'x'`
#[derive(Debug, Clone)]
pub struct CharLit {
    pub value: char,
    pub value_pos: Pos,
    pub literal: String,
}

/// `cond ? a : b` (right-associative).
#[derive(Debug, Clone)]
pub struct CondExpr {
    pub cond: Box<Expr>,
    pub true_expr: Box<Expr>,
    pub false_expr: Box<Expr>,
    pub question_pos: Pos,
    pub colon_pos: Pos,
}

/// `hata(x)`
#[derive(Debug, Clone)]
pub struct ErrorExpr {
    pub expr: Box<Expr>,
    pub error_pos: Pos,
    pub lparen: Pos,
    pub rparen: Pos,
}

/// `3.14`
#[derive(Debug, Clone)]
pub struct FloatLit {
    pub value: f64,
    pub value_pos: Pos,
    pub literal: String,
}

/// `fn(a, b) { … }` with an optional variadic last parameter `...rest`.
#[derive(Debug, Clone)]
pub struct FuncLit {
    pub func_pos: Pos,
    pub params: IdentList,
    pub body: BlockStmt,
}

/// A plain identifier reference.
#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub name_pos: Pos,
}

/// `sabit(x)`
#[derive(Debug, Clone)]
pub struct ImmutableExpr {
    pub expr: Box<Expr>,
    pub immutable_pos: Pos,
    pub lparen: Pos,
    pub rparen: Pos,
}

/// `kullan("name")`
#[derive(Debug, Clone)]
pub struct ImportExpr {
    pub module_name: String,
    pub token_pos: Pos,
}

/// `recv[idx]`
#[derive(Debug, Clone)]
pub struct IndexExpr {
    pub expr: Box<Expr>,
    pub lbrack: Pos,
    pub index: Box<Expr>,
    pub rbrack: Pos,
}

/// `42`, `0xff`, `0b1010`, …
#[derive(Debug, Clone)]
pub struct IntLit {
    pub value: i64,
    pub value_pos: Pos,
    pub literal: String,
}

/// One `key: value` entry of a map literal.
#[derive(Debug, Clone)]
pub struct MapElementLit {
    pub key: String,
    pub key_pos: Pos,
    pub colon_pos: Pos,
    pub value: Expr,
}

impl fmt::Display for MapElementLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.value)
    }
}

/// `{a: 1, b: 2}`
#[derive(Debug, Clone)]
pub struct MapLit {
    pub lbrace: Pos,
    pub elements: Vec<MapElementLit>,
    pub rbrace: Pos,
}

/// `(x)`
#[derive(Debug, Clone)]
pub struct ParenExpr {
    pub expr: Box<Expr>,
    pub lparen: Pos,
    pub rparen: Pos,
}

/// `a.b` — sugar for `a["b"]`; `sel` always holds the member name as a
/// string literal.
#[derive(Debug, Clone)]
pub struct SelectorExpr {
    pub expr: Box<Expr>,
    pub sel: StringLit,
}

/// `a[lo:hi]` with either bound optional.
#[derive(Debug, Clone)]
pub struct SliceExpr {
    pub expr: Box<Expr>,
    pub lbrack: Pos,
    pub low: Option<Box<Expr>>,
    pub high: Option<Box<Expr>>,
    pub rbrack: Pos,
}

/// `"metin"` — `value` is unquoted, `literal` keeps the source form.
#[derive(Debug, Clone)]
pub struct StringLit {
    pub value: String,
    pub value_pos: Pos,
    pub literal: String,
}

/// `-x`, `!x`, `^x`
#[derive(Debug, Clone)]
pub struct UnaryExpr {
    pub expr: Box<Expr>,
    pub token: Token,
    pub token_pos: Pos,
}

/// `tanımsız`
#[derive(Debug, Clone)]
pub struct UndefinedLit {
    pub token_pos: Pos,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameter lists
// ─────────────────────────────────────────────────────────────────────────────

/// A parenthesized identifier list; `var_args` marks a trailing `...name`.
#[derive(Debug, Clone, Default)]
pub struct IdentList {
    pub lparen: Pos,
    pub var_args: bool,
    pub list: Vec<Ident>,
    pub rparen: Pos,
}

impl IdentList {
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl fmt::Display for IdentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.list.iter().map(|i| i.name.clone()).collect();
        if self.var_args {
            if let Some(last) = names.last_mut() {
                last.insert_str(0, "...");
            }
        }
        write!(f, "({})", names.join(", "))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Statements
// ─────────────────────────────────────────────────────────────────────────────

/// Every statement form in the language.
#[derive(Debug, Clone)]
pub enum Stmt {
    Assign(AssignStmt),
    Bad(BadStmt),
    Block(BlockStmt),
    Branch(BranchStmt),
    Empty(EmptyStmt),
    Export(ExportStmt),
    Expr(ExprStmt),
    For(ForStmt),
    ForIn(ForInStmt),
    If(IfStmt),
    IncDec(IncDecStmt),
    Return(ReturnStmt),
}

impl Stmt {
    /// Position of the first character of the statement.
    pub fn pos(&self) -> Pos {
        match self {
            Stmt::Assign(s) => s.lhs[0].pos(),
            Stmt::Bad(s) => s.from,
            Stmt::Block(s) => s.lbrace,
            Stmt::Branch(s) => s.token_pos,
            Stmt::Empty(s) => s.semicolon,
            Stmt::Export(s) => s.export_pos,
            Stmt::Expr(s) => s.expr.pos(),
            Stmt::For(s) => s.for_pos,
            Stmt::ForIn(s) => s.for_pos,
            Stmt::If(s) => s.if_pos,
            Stmt::IncDec(s) => s.expr.pos(),
            Stmt::Return(s) => s.return_pos,
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Assign(s) => {
                let lhs: Vec<String> = s.lhs.iter().map(|e| e.to_string()).collect();
                let rhs: Vec<String> = s.rhs.iter().map(|e| e.to_string()).collect();
                write!(f, "{} {} {}", lhs.join(", "), s.token, rhs.join(", "))
            }
            Stmt::Bad(_) => f.write_str("<kötü ifade>"),
            Stmt::Block(s) => {
                let list: Vec<String> = s.stmts.iter().map(|e| e.to_string()).collect();
                write!(f, "{{{}}}", list.join("; "))
            }
            Stmt::Branch(s) => f.write_str(s.token.text()),
            Stmt::Empty(_) => f.write_str(";"),
            Stmt::Export(s) => write!(f, "paylaş {}", s.result),
            Stmt::Expr(s) => s.expr.fmt(f),
            Stmt::For(s) => {
                let init = s.init.as_ref().map(|x| x.to_string()).unwrap_or_default();
                let cond = s
                    .cond
                    .as_ref()
                    .map(|x| format!("{x} "))
                    .unwrap_or_default();
                let post = s.post.as_ref().map(|x| x.to_string()).unwrap_or_default();
                if !init.is_empty() || !post.is_empty() {
                    write!(f, "tekrarla {init} ; {cond}; {post}{}", s.body)
                } else {
                    write!(f, "tekrarla {cond}{}", s.body)
                }
            }
            Stmt::ForIn(s) => {
                if let Some(value) = &s.value {
                    write!(
                        f,
                        "tekrarla {}, {} in {} {}",
                        s.key.name, value.name, s.iterable, s.body
                    )
                } else {
                    write!(f, "tekrarla {} in {} {}", s.key.name, s.iterable, s.body)
                }
            }
            Stmt::If(s) => {
                let init = s
                    .init
                    .as_ref()
                    .map(|x| format!("{x}; "))
                    .unwrap_or_default();
                write!(f, "eğer {init}{} {}", s.cond, s.body)?;
                if let Some(els) = &s.else_stmt {
                    write!(f, " yoksa {els}")?;
                }
                Ok(())
            }
            Stmt::IncDec(s) => write!(f, "{}{}", s.expr, s.token),
            Stmt::Return(s) => match &s.result {
                Some(result) => write!(f, "dön {result}"),
                None => f.write_str("dön"),
            },
        }
    }
}

/// Assignment (`=`, compound ops) or short declaration (`:=`).
#[derive(Debug, Clone)]
pub struct AssignStmt {
    pub lhs: Vec<Expr>,
    pub rhs: Vec<Expr>,
    pub token: Token,
    pub token_pos: Pos,
}

/// Placeholder for an unparseable statement.
#[derive(Debug, Clone)]
pub struct BadStmt {
    pub from: Pos,
    pub to: Pos,
}

/// `{ … }`
#[derive(Debug, Clone)]
pub struct BlockStmt {
    pub stmts: Vec<Stmt>,
    pub lbrace: Pos,
    pub rbrace: Pos,
}

impl fmt::Display for BlockStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list: Vec<String> = self.stmts.iter().map(|e| e.to_string()).collect();
        write!(f, "{{{}}}", list.join("; "))
    }
}

/// `dur` or `devam`.
#[derive(Debug, Clone)]
pub struct BranchStmt {
    pub token: Token,
    pub token_pos: Pos,
}

/// A bare `;`.
#[derive(Debug, Clone)]
pub struct EmptyStmt {
    pub semicolon: Pos,
    pub implicit: bool,
}

/// `paylaş expr` — only valid in modules.
#[derive(Debug, Clone)]
pub struct ExportStmt {
    pub export_pos: Pos,
    pub result: Expr,
}

/// An expression evaluated for its side effects.
#[derive(Debug, Clone)]
pub struct ExprStmt {
    pub expr: Expr,
}

/// C-style loop: `tekrarla init; cond; post { … }`, every header part
/// optional.
#[derive(Debug, Clone)]
pub struct ForStmt {
    pub for_pos: Pos,
    pub init: Option<Box<Stmt>>,
    pub cond: Option<Expr>,
    pub post: Option<Box<Stmt>>,
    pub body: BlockStmt,
}

/// `tekrarla k in x { … }` / `tekrarla k, v in x { … }`.
#[derive(Debug, Clone)]
pub struct ForInStmt {
    pub for_pos: Pos,
    pub key: Ident,
    pub value: Option<Ident>,
    pub iterable: Expr,
    pub body: BlockStmt,
}

/// `eğer init; cond { … } yoksa …`
#[derive(Debug, Clone)]
pub struct IfStmt {
    pub if_pos: Pos,
    pub init: Option<Box<Stmt>>,
    pub cond: Expr,
    pub body: BlockStmt,
    pub else_stmt: Option<Box<Stmt>>,
}

/// `x++` / `x--` (statement only, never an expression).
#[derive(Debug, Clone)]
pub struct IncDecStmt {
    pub expr: Expr,
    pub token: Token,
    pub token_pos: Pos,
}

/// `dön` / `dön expr`.
#[derive(Debug, Clone)]
pub struct ReturnStmt {
    pub return_pos: Pos,
    pub result: Option<Expr>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Expr {
        Expr::Ident(Ident {
            name: name.to_string(),
            name_pos: Pos(1),
        })
    }

    fn int(v: i64) -> Expr {
        Expr::Int(IntLit {
            value: v,
            value_pos: Pos(1),
            literal: v.to_string(),
        })
    }

    #[test]
    fn test_expr_display() {
        let bin = Expr::Binary(BinaryExpr {
            lhs: Box::new(int(1)),
            rhs: Box::new(ident("x")),
            token: Token::Add,
            token_pos: Pos(1),
        });
        assert_eq!(bin.to_string(), "(1 + x)");

        let sel = Expr::Selector(SelectorExpr {
            expr: Box::new(ident("a")),
            sel: StringLit {
                value: "b".to_string(),
                value_pos: Pos(1),
                literal: "b".to_string(),
            },
        });
        assert_eq!(sel.to_string(), "a.b");
    }

    #[test]
    fn test_stmt_display() {
        let assign = Stmt::Assign(AssignStmt {
            lhs: vec![ident("x")],
            rhs: vec![int(5)],
            token: Token::Define,
            token_pos: Pos(1),
        });
        assert_eq!(assign.to_string(), "x := 5");

        let ret = Stmt::Return(ReturnStmt {
            return_pos: Pos(1),
            result: Some(int(3)),
        });
        assert_eq!(ret.to_string(), "dön 3");
    }

    #[test]
    fn test_ident_list_display() {
        let list = IdentList {
            lparen: Pos(1),
            var_args: true,
            list: vec![
                Ident {
                    name: "a".to_string(),
                    name_pos: Pos(1),
                },
                Ident {
                    name: "rest".to_string(),
                    name_pos: Pos(2),
                },
            ],
            rparen: Pos(3),
        };
        assert_eq!(list.to_string(), "(a, ...rest)");
    }
}
