//! Precedence-climbing parser.
//!
//! The parser pulls tokens straight from the [`Scanner`] (so semicolon
//! insertion happens mid-parse, exactly where the grammar expects statement
//! terminators) and produces a typed [`File`] AST.
//!
//! Errors are collected, not thrown: on a malformed construct the parser
//! records a [`ParseError`], skips to a synchronization point and keeps
//! going, so one run reports as many problems as possible.  A parse is fatal
//! if either the scanner or the parser recorded anything.
//!
//! Binary operators use token precedence (see [`Token::precedence`]); the
//! ternary `?:` is right-associative and handled above the binary levels;
//! unary `-`/`!`/`^` bind tighter than any binary operator.

use std::fmt;
use std::rc::Rc;

use crate::ast::*;
use crate::position::{Pos, SourceFile, SourceFilePos};
use crate::scanner::{ScanMode, Scanner};
use crate::token::{Token, LOWEST_PREC};

/// Give up after this many parse errors; the rest of the input is unlikely to
/// produce anything but noise.
const MAX_ERRORS: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// A single positioned parse (or scan) error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Parse Error: {message}\n\tat {pos}")]
pub struct ParseError {
    pub pos: SourceFilePos,
    pub message: String,
}

/// The full batch of errors from one parse.
#[derive(Debug, Clone, Default)]
pub struct ErrorList(pub Vec<ParseError>);

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            0 => f.write_str("no errors"),
            1 => self.0[0].fmt(f),
            n => write!(f, "{} (and {} more errors)", self.0[0], n - 1),
        }
    }
}

impl std::error::Error for ErrorList {}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

/// The parser.  Create with [`Parser::new`] and call [`Parser::parse_file`].
pub struct Parser<'s> {
    file: Rc<SourceFile>,
    scanner: Scanner<'s>,
    errors: Vec<ParseError>,

    // Current token.
    token: Token,
    literal: String,
    pos: Pos,
}

impl<'s> Parser<'s> {
    /// Create a parser over `src`, which must match the registered size of
    /// `file`.
    pub fn new(file: Rc<SourceFile>, src: &'s [u8]) -> Parser<'s> {
        let scanner = Scanner::new(Rc::clone(&file), src, ScanMode::default());
        let mut p = Parser {
            file,
            scanner,
            errors: Vec::new(),
            token: Token::Eof,
            literal: String::new(),
            pos: Pos::NONE,
        };
        p.next();
        p
    }

    /// Parse the whole input.  Returns the AST only when neither the scanner
    /// nor the parser recorded an error.
    pub fn parse_file(mut self) -> Result<File, ErrorList> {
        let mut stmts = Vec::new();
        while self.token != Token::Eof && self.errors.len() < MAX_ERRORS {
            stmts.push(self.parse_stmt());
        }

        let mut errors: Vec<ParseError> = self
            .scanner
            .take_errors()
            .into_iter()
            .map(|e| ParseError {
                pos: e.pos,
                message: e.message,
            })
            .collect();
        errors.extend(self.errors);
        if !errors.is_empty() {
            return Err(ErrorList(errors));
        }
        Ok(File {
            input_file: self.file,
            stmts,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Token plumbing
    // ─────────────────────────────────────────────────────────────────────────

    fn next(&mut self) {
        let (token, literal, pos) = self.scanner.scan();
        self.token = token;
        self.literal = literal;
        self.pos = pos;
    }

    fn error(&mut self, pos: Pos, message: impl Into<String>) {
        self.errors.push(ParseError {
            pos: self.file.position(pos),
            message: message.into(),
        });
    }

    fn error_expected(&mut self, pos: Pos, what: &str) {
        let mut message = format!("expected {what}");
        if pos == self.pos {
            // Make the message more specific for the current token.
            if self.token == Token::Semicolon && self.literal == "\n" {
                message += ", found newline";
            } else if self.token.is_literal() {
                message += &format!(", found {}", self.literal);
            } else {
                message += &format!(", found '{}'", self.token.text());
            }
        }
        self.error(pos, message);
    }

    fn expect(&mut self, token: Token) -> Pos {
        let pos = self.pos;
        if self.token != token {
            self.error_expected(pos, &format!("'{}'", token.text()));
        }
        self.next();
        pos
    }

    fn expect_semi(&mut self) {
        match self.token {
            // Semicolon is optional before a closing ')' or '}'.
            Token::RParen | Token::RBrace => {}
            Token::Semicolon => self.next(),
            _ => {
                self.error_expected(self.pos, "';'");
                self.sync_stmt();
            }
        }
    }

    /// Skip forward to a likely statement boundary after an error.
    fn sync_stmt(&mut self) {
        while !matches!(self.token, Token::Semicolon | Token::RBrace | Token::Eof) {
            self.next();
        }
        if self.token == Token::Semicolon {
            self.next();
        }
    }

    /// Consume the comma between list elements.  An inserted newline
    /// semicolon before the closing token is skipped; a trailing comma right
    /// before the closing token is an error.
    fn expect_comma(&mut self, closing: Token, want: &str) -> bool {
        if self.token == Token::Comma {
            self.next();
            if self.token == closing {
                self.error_expected(self.pos, want);
                return false;
            }
            return true;
        }
        if self.token == Token::Semicolon && self.literal == "\n" {
            self.next();
        }
        false
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────────

    fn parse_stmt(&mut self) -> Stmt {
        match self.token {
            // Anything that can begin an expression begins a simple statement.
            Token::Ident
            | Token::Int
            | Token::Float
            | Token::Char
            | Token::String
            | Token::True
            | Token::False
            | Token::Undefined
            | Token::Import
            | Token::Error
            | Token::Immutable
            | Token::Func
            | Token::LParen
            | Token::LBrack
            | Token::Add
            | Token::Sub
            | Token::Not
            | Token::Xor => {
                let s = self.parse_simple_stmt(false);
                self.expect_semi();
                s
            }
            Token::Return => self.parse_return_stmt(),
            Token::Export => self.parse_export_stmt(),
            Token::If => self.parse_if_stmt(),
            Token::For => self.parse_for_stmt(),
            Token::Break | Token::Continue => {
                let s = Stmt::Branch(BranchStmt {
                    token: self.token,
                    token_pos: self.pos,
                });
                self.next();
                self.expect_semi();
                s
            }
            Token::Semicolon => {
                let s = Stmt::Empty(EmptyStmt {
                    semicolon: self.pos,
                    implicit: self.literal == "\n",
                });
                self.next();
                s
            }
            Token::LBrace => {
                let block = self.parse_block_stmt();
                self.expect_semi();
                Stmt::Block(block)
            }
            _ => {
                let pos = self.pos;
                self.error_expected(pos, "statement");
                self.sync_stmt();
                Stmt::Bad(BadStmt {
                    from: pos,
                    to: self.pos,
                })
            }
        }
    }

    /// Parse an expression statement, assignment, `++`/`--`, or (when
    /// `for_in` is set) the `k[, v] in …` head of a for-in loop.
    fn parse_simple_stmt(&mut self, for_in: bool) -> Stmt {
        let lhs = self.parse_expr_list();

        match self.token {
            Token::Assign
            | Token::Define
            | Token::AddAssign
            | Token::SubAssign
            | Token::MulAssign
            | Token::QuoAssign
            | Token::RemAssign
            | Token::AndAssign
            | Token::OrAssign
            | Token::XorAssign
            | Token::ShlAssign
            | Token::ShrAssign
            | Token::AndNotAssign => {
                let (token, token_pos) = (self.token, self.pos);
                self.next();
                let rhs = self.parse_expr_list();
                if lhs.len() != rhs.len() || lhs.len() != 1 {
                    self.error(token_pos, "assignment takes exactly one value");
                }
                return Stmt::Assign(AssignStmt {
                    lhs,
                    rhs,
                    token,
                    token_pos,
                });
            }
            Token::In if for_in => {
                self.next();
                let iterable = self.parse_expr();

                let mut idents = Vec::new();
                for expr in &lhs {
                    match expr {
                        Expr::Ident(id) => idents.push(id.clone()),
                        _ => self.error(expr.pos(), "expected an identifier"),
                    }
                }
                let (key, value) = match idents.len() {
                    1 => (idents.remove(0), None),
                    2 => {
                        let v = idents.pop();
                        (idents.remove(0), v)
                    }
                    _ => {
                        self.error(self.pos, "expected at most 2 identifiers before 'in'");
                        (
                            Ident {
                                name: "_".to_string(),
                                name_pos: self.pos,
                            },
                            None,
                        )
                    }
                };
                return Stmt::ForIn(ForInStmt {
                    for_pos: Pos::NONE, // patched by parse_for_stmt
                    key,
                    value,
                    iterable,
                    body: BlockStmt {
                        stmts: Vec::new(),
                        lbrace: Pos::NONE,
                        rbrace: Pos::NONE,
                    },
                });
            }
            Token::Inc | Token::Dec => {
                let (token, token_pos) = (self.token, self.pos);
                self.next();
                let mut lhs = lhs;
                return Stmt::IncDec(IncDecStmt {
                    expr: lhs.remove(0),
                    token,
                    token_pos,
                });
            }
            _ => {}
        }

        let mut lhs = lhs;
        if lhs.len() > 1 {
            self.error(lhs[0].pos(), "expected one expression");
        }
        Stmt::Expr(ExprStmt {
            expr: lhs.remove(0),
        })
    }

    fn parse_expr_list(&mut self) -> Vec<Expr> {
        let mut list = vec![self.parse_expr()];
        while self.token == Token::Comma {
            self.next();
            list.push(self.parse_expr());
        }
        list
    }

    fn parse_return_stmt(&mut self) -> Stmt {
        let return_pos = self.expect(Token::Return);
        let result = if matches!(self.token, Token::Semicolon | Token::RBrace | Token::Eof) {
            None
        } else {
            Some(self.parse_expr())
        };
        self.expect_semi();
        Stmt::Return(ReturnStmt { return_pos, result })
    }

    fn parse_export_stmt(&mut self) -> Stmt {
        let export_pos = self.expect(Token::Export);
        let result = self.parse_expr();
        self.expect_semi();
        Stmt::Export(ExportStmt { export_pos, result })
    }

    fn parse_if_stmt(&mut self) -> Stmt {
        let if_pos = self.expect(Token::If);
        let (init, cond) = self.parse_if_header();
        let body = self.parse_block_stmt();

        let else_stmt = if self.token == Token::Else {
            self.next();
            match self.token {
                Token::If => Some(Box::new(self.parse_if_stmt())),
                Token::LBrace => {
                    let block = self.parse_block_stmt();
                    self.expect_semi();
                    Some(Box::new(Stmt::Block(block)))
                }
                _ => {
                    let pos = self.pos;
                    self.error_expected(pos, "'eğer' or '{'");
                    Some(Box::new(Stmt::Bad(BadStmt {
                        from: pos,
                        to: self.pos,
                    })))
                }
            }
        } else {
            self.expect_semi();
            None
        };

        Stmt::If(IfStmt {
            if_pos,
            init,
            cond,
            body,
            else_stmt,
        })
    }

    fn parse_if_header(&mut self) -> (Option<Box<Stmt>>, Expr) {
        if self.token == Token::LBrace {
            self.error(self.pos, "missing condition in 'eğer' statement");
            return (
                None,
                Expr::Bad(BadExpr {
                    from: self.pos,
                    to: self.pos,
                }),
            );
        }

        let s = self.parse_simple_stmt(false);
        if self.token == Token::Semicolon {
            self.next();
            let s2 = self.parse_simple_stmt(false);
            let cond = self.make_expr(s2, "condition expression");
            (Some(Box::new(s)), cond)
        } else {
            let cond = self.make_expr(s, "condition expression");
            (None, cond)
        }
    }

    fn parse_for_stmt(&mut self) -> Stmt {
        let for_pos = self.expect(Token::For);

        // tekrarla { … } — infinite loop.
        if self.token == Token::LBrace {
            let body = self.parse_block_stmt();
            self.expect_semi();
            return Stmt::For(ForStmt {
                for_pos,
                init: None,
                cond: None,
                post: None,
                body,
            });
        }

        let s2 = if self.token != Token::Semicolon {
            Some(self.parse_simple_stmt(true))
        } else {
            None
        };

        // tekrarla k[, v] in iterable { … }
        let mut s2 = match s2 {
            Some(Stmt::ForIn(mut for_in)) => {
                for_in.for_pos = for_pos;
                for_in.body = self.parse_block_stmt();
                self.expect_semi();
                return Stmt::ForIn(for_in);
            }
            other => other,
        };

        let (init, cond_stmt, post) = if self.token == Token::Semicolon {
            self.next();
            let init = s2.take();
            let cond_stmt = if self.token != Token::Semicolon {
                Some(self.parse_simple_stmt(false))
            } else {
                None
            };
            self.expect(Token::Semicolon);
            let post = if self.token != Token::LBrace {
                Some(Box::new(self.parse_simple_stmt(false)))
            } else {
                None
            };
            (init.map(Box::new), cond_stmt, post)
        } else {
            (None, s2.take(), None)
        };

        let body = self.parse_block_stmt();
        self.expect_semi();
        let cond = cond_stmt.map(|s| self.make_expr(s, "condition expression"));

        Stmt::For(ForStmt {
            for_pos,
            init,
            cond,
            post,
            body,
        })
    }

    fn make_expr(&mut self, stmt: Stmt, what: &str) -> Expr {
        match stmt {
            Stmt::Expr(s) => s.expr,
            other => {
                let pos = other.pos();
                self.error(pos, format!("expected {what}, found statement"));
                Expr::Bad(BadExpr { from: pos, to: pos })
            }
        }
    }

    fn parse_block_stmt(&mut self) -> BlockStmt {
        let lbrace = self.expect(Token::LBrace);
        let mut stmts = Vec::new();
        while !matches!(self.token, Token::RBrace | Token::Eof)
            && self.errors.len() < MAX_ERRORS
        {
            stmts.push(self.parse_stmt());
        }
        let rbrace = self.expect(Token::RBrace);
        BlockStmt {
            stmts,
            lbrace,
            rbrace,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Expressions
    // ─────────────────────────────────────────────────────────────────────────

    fn parse_expr(&mut self) -> Expr {
        let expr = self.parse_binary_expr(LOWEST_PREC + 1);
        if self.token == Token::Question {
            return self.parse_cond_expr(expr);
        }
        expr
    }

    /// Right-associative ternary: both arms re-enter [`Parser::parse_expr`].
    fn parse_cond_expr(&mut self, cond: Expr) -> Expr {
        let question_pos = self.expect(Token::Question);
        let true_expr = self.parse_expr();
        let colon_pos = self.expect(Token::Colon);
        let false_expr = self.parse_expr();
        Expr::Cond(CondExpr {
            cond: Box::new(cond),
            true_expr: Box::new(true_expr),
            false_expr: Box::new(false_expr),
            question_pos,
            colon_pos,
        })
    }

    fn parse_binary_expr(&mut self, min_prec: usize) -> Expr {
        let mut lhs = self.parse_unary_expr();
        loop {
            let (op, prec) = (self.token, self.token.precedence());
            if prec < min_prec {
                return lhs;
            }
            let token_pos = self.expect(op);
            let rhs = self.parse_binary_expr(prec + 1);
            lhs = Expr::Binary(BinaryExpr {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                token: op,
                token_pos,
            });
        }
    }

    fn parse_unary_expr(&mut self) -> Expr {
        match self.token {
            Token::Add | Token::Sub | Token::Not | Token::Xor => {
                let (token, token_pos) = (self.token, self.pos);
                self.next();
                let expr = self.parse_unary_expr();
                Expr::Unary(UnaryExpr {
                    expr: Box::new(expr),
                    token,
                    token_pos,
                })
            }
            _ => self.parse_primary_expr(),
        }
    }

    fn parse_primary_expr(&mut self) -> Expr {
        let mut x = self.parse_operand();
        loop {
            match self.token {
                Token::Period => {
                    self.next();
                    match self.token {
                        Token::Ident => {
                            let sel = StringLit {
                                value: self.literal.clone(),
                                value_pos: self.pos,
                                literal: self.literal.clone(),
                            };
                            self.next();
                            x = Expr::Selector(SelectorExpr {
                                expr: Box::new(x),
                                sel,
                            });
                        }
                        _ => {
                            let pos = self.pos;
                            self.error_expected(pos, "selector");
                            self.next();
                            x = Expr::Bad(BadExpr { from: pos, to: self.pos });
                        }
                    }
                }
                Token::LBrack => x = self.parse_index_or_slice(x),
                Token::LParen => x = self.parse_call(x),
                _ => return x,
            }
        }
    }

    fn parse_call(&mut self, func: Expr) -> Expr {
        let lparen = self.expect(Token::LParen);
        let mut args = Vec::new();
        let mut ellipsis = Pos::NONE;
        while !matches!(self.token, Token::RParen | Token::Eof) && !ellipsis.is_valid() {
            args.push(self.parse_expr());
            if self.token == Token::Ellipsis {
                ellipsis = self.pos;
                self.next();
            }
            if !self.expect_comma(Token::RParen, "call argument") {
                break;
            }
        }
        let rparen = self.expect(Token::RParen);
        Expr::Call(CallExpr {
            func: Box::new(func),
            lparen,
            args,
            ellipsis,
            rparen,
        })
    }

    fn parse_index_or_slice(&mut self, expr: Expr) -> Expr {
        let lbrack = self.expect(Token::LBrack);

        let low = if self.token != Token::Colon {
            Some(self.parse_expr())
        } else {
            None
        };

        if self.token == Token::Colon {
            self.next();
            let high = if self.token != Token::RBrack {
                Some(self.parse_expr())
            } else {
                None
            };
            let rbrack = self.expect(Token::RBrack);
            return Expr::Slice(SliceExpr {
                expr: Box::new(expr),
                lbrack,
                low: low.map(Box::new),
                high: high.map(Box::new),
                rbrack,
            });
        }

        let rbrack = self.expect(Token::RBrack);
        let index = match low {
            Some(index) => index,
            None => {
                self.error(lbrack, "missing index expression");
                Expr::Bad(BadExpr {
                    from: lbrack,
                    to: rbrack,
                })
            }
        };
        Expr::Index(IndexExpr {
            expr: Box::new(expr),
            lbrack,
            index: Box::new(index),
            rbrack,
        })
    }

    fn parse_operand(&mut self) -> Expr {
        match self.token {
            Token::Ident => {
                let ident = Ident {
                    name: self.literal.clone(),
                    name_pos: self.pos,
                };
                self.next();
                Expr::Ident(ident)
            }
            Token::Int => {
                let (pos, literal) = (self.pos, self.literal.clone());
                let value = match parse_int_literal(&literal) {
                    Some(v) => v,
                    None => {
                        self.error(pos, format!("invalid integer literal: {literal}"));
                        0
                    }
                };
                self.next();
                Expr::Int(IntLit {
                    value,
                    value_pos: pos,
                    literal,
                })
            }
            Token::Float => {
                let (pos, literal) = (self.pos, self.literal.clone());
                let value = match parse_float_literal(&literal) {
                    Some(v) => v,
                    None => {
                        self.error(pos, format!("invalid float literal: {literal}"));
                        0.0
                    }
                };
                self.next();
                Expr::Float(FloatLit {
                    value,
                    value_pos: pos,
                    literal,
                })
            }
            Token::Char => {
                let (pos, literal) = (self.pos, self.literal.clone());
                let value = match unquote_char(&literal) {
                    Some(v) => v,
                    None => {
                        self.error(pos, format!("invalid char literal: {literal}"));
                        '\u{0}'
                    }
                };
                self.next();
                Expr::Char(CharLit {
                    value,
                    value_pos: pos,
                    literal,
                })
            }
            Token::String => {
                let (pos, literal) = (self.pos, self.literal.clone());
                let value = match unquote_string(&literal) {
                    Some(v) => v,
                    None => {
                        self.error(pos, format!("invalid string literal: {literal}"));
                        String::new()
                    }
                };
                self.next();
                Expr::String(StringLit {
                    value,
                    value_pos: pos,
                    literal,
                })
            }
            Token::True | Token::False => {
                let lit = Expr::Bool(BoolLit {
                    value: self.token == Token::True,
                    value_pos: self.pos,
                    literal: self.literal_or_keyword(),
                });
                self.next();
                lit
            }
            Token::Undefined => {
                let lit = Expr::Undefined(UndefinedLit {
                    token_pos: self.pos,
                });
                self.next();
                lit
            }
            Token::Import => self.parse_import_expr(),
            Token::Error => {
                let error_pos = self.expect(Token::Error);
                let lparen = self.expect(Token::LParen);
                let expr = self.parse_expr();
                let rparen = self.expect(Token::RParen);
                Expr::Error(ErrorExpr {
                    expr: Box::new(expr),
                    error_pos,
                    lparen,
                    rparen,
                })
            }
            Token::Immutable => {
                let immutable_pos = self.expect(Token::Immutable);
                let lparen = self.expect(Token::LParen);
                let expr = self.parse_expr();
                let rparen = self.expect(Token::RParen);
                Expr::Immutable(ImmutableExpr {
                    expr: Box::new(expr),
                    immutable_pos,
                    lparen,
                    rparen,
                })
            }
            Token::LParen => {
                let lparen = self.expect(Token::LParen);
                let expr = self.parse_expr();
                let rparen = self.expect(Token::RParen);
                Expr::Paren(ParenExpr {
                    expr: Box::new(expr),
                    lparen,
                    rparen,
                })
            }
            Token::LBrack => self.parse_array_lit(),
            Token::LBrace => self.parse_map_lit(),
            Token::Func => self.parse_func_lit(),
            _ => {
                let pos = self.pos;
                self.error_expected(pos, "operand");
                self.sync_stmt();
                Expr::Bad(BadExpr {
                    from: pos,
                    to: self.pos,
                })
            }
        }
    }

    /// Keyword tokens carry their literal in the token itself.
    fn literal_or_keyword(&self) -> String {
        if self.literal.is_empty() {
            self.token.text().to_string()
        } else {
            self.literal.clone()
        }
    }

    fn parse_import_expr(&mut self) -> Expr {
        let token_pos = self.pos;
        self.next();
        self.expect(Token::LParen);
        let module_name = if self.token == Token::String {
            let name = unquote_string(&self.literal).unwrap_or_default();
            self.next();
            name
        } else {
            self.error_expected(self.pos, "module name (string literal)");
            String::new()
        };
        self.expect(Token::RParen);
        Expr::Import(ImportExpr {
            module_name,
            token_pos,
        })
    }

    fn parse_array_lit(&mut self) -> Expr {
        let lbrack = self.expect(Token::LBrack);
        let mut elements = Vec::new();
        while !matches!(self.token, Token::RBrack | Token::Eof) {
            elements.push(self.parse_expr());
            if !self.expect_comma(Token::RBrack, "array element") {
                break;
            }
        }
        let rbrack = self.expect(Token::RBrack);
        Expr::Array(ArrayLit {
            elements,
            lbrack,
            rbrack,
        })
    }

    fn parse_map_lit(&mut self) -> Expr {
        let lbrace = self.expect(Token::LBrace);
        let mut elements = Vec::new();
        while !matches!(self.token, Token::RBrace | Token::Eof) {
            elements.push(self.parse_map_element());
            if !self.expect_comma(Token::RBrace, "map element") {
                break;
            }
        }
        let rbrace = self.expect(Token::RBrace);
        Expr::Map(MapLit {
            lbrace,
            elements,
            rbrace,
        })
    }

    fn parse_map_element(&mut self) -> MapElementLit {
        let key_pos = self.pos;
        let key = match self.token {
            Token::Ident | Token::Int => self.literal.clone(),
            Token::String => unquote_string(&self.literal).unwrap_or_default(),
            _ => {
                self.error_expected(key_pos, "map key");
                String::new()
            }
        };
        self.next();
        let colon_pos = self.expect(Token::Colon);
        let value = self.parse_expr();
        MapElementLit {
            key,
            key_pos,
            colon_pos,
            value,
        }
    }

    fn parse_func_lit(&mut self) -> Expr {
        let func_pos = self.expect(Token::Func);
        let params = self.parse_ident_list();
        let body = self.parse_block_stmt();
        Expr::Func(Box::new(FuncLit {
            func_pos,
            params,
            body,
        }))
    }

    fn parse_ident_list(&mut self) -> IdentList {
        let lparen = self.expect(Token::LParen);
        let mut list = Vec::new();
        let mut var_args = false;

        if !matches!(self.token, Token::RParen | Token::Eof) {
            if self.token == Token::Ellipsis {
                var_args = true;
                self.next();
            }
            list.push(self.parse_ident());
            while !var_args && self.token == Token::Comma {
                self.next();
                if self.token == Token::Ellipsis {
                    var_args = true;
                    self.next();
                }
                list.push(self.parse_ident());
            }
        }

        let rparen = self.expect(Token::RParen);
        IdentList {
            lparen,
            var_args,
            list,
            rparen,
        }
    }

    fn parse_ident(&mut self) -> Ident {
        let pos = self.pos;
        let name = if self.token == Token::Ident {
            let name = self.literal.clone();
            self.next();
            name
        } else {
            self.error_expected(pos, "identifier");
            self.next();
            "_".to_string()
        };
        Ident {
            name,
            name_pos: pos,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Literal decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Parse an integer literal with optional `0b`/`0o`/`0x` prefix (a bare
/// leading zero means octal) and `_` digit separators.
pub fn parse_int_literal(literal: &str) -> Option<i64> {
    let digits: String = literal.chars().filter(|&c| c != '_').collect();
    let (radix, rest) = match digits.as_bytes() {
        [b'0', b'b' | b'B', ..] => (2, &digits[2..]),
        [b'0', b'o' | b'O', ..] => (8, &digits[2..]),
        [b'0', b'x' | b'X', ..] => (16, &digits[2..]),
        [b'0', _, ..] => (8, &digits[1..]),
        _ => (10, digits.as_str()),
    };
    i64::from_str_radix(rest, radix).ok()
}

/// Parse a float literal: decimal with optional `e`/`E` exponent, or a hex
/// float (`0x1.8p3`) with a mandatory binary `p`/`P` exponent.
pub fn parse_float_literal(literal: &str) -> Option<f64> {
    let digits: String = literal.chars().filter(|&c| c != '_').collect();

    if let Some(rest) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        // Hex float: mantissa in base 16, exponent in base 2.
        let p = rest.find(['p', 'P'])?;
        let (mantissa, exp) = (&rest[..p], &rest[p + 1..]);
        let exp: i32 = exp.parse().ok()?;
        let (int_part, frac_part) = match mantissa.find('.') {
            Some(dot) => (&mantissa[..dot], &mantissa[dot + 1..]),
            None => (mantissa, ""),
        };
        let mut value = 0.0f64;
        for ch in int_part.chars() {
            value = value * 16.0 + ch.to_digit(16)? as f64;
        }
        let mut scale = 1.0 / 16.0;
        for ch in frac_part.chars() {
            value += ch.to_digit(16)? as f64 * scale;
            scale /= 16.0;
        }
        return Some(value * (exp as f64).exp2());
    }

    digits.parse().ok()
}

/// Decode a quoted string literal (including the surrounding quotes) into its
/// value.  Backtick strings are raw: no escape processing.
pub fn unquote_string(literal: &str) -> Option<String> {
    let bytes = literal.as_bytes();
    if bytes.len() >= 2 && bytes[0] == b'`' && bytes[bytes.len() - 1] == b'`' {
        return Some(literal[1..literal.len() - 1].to_string());
    }
    if bytes.len() < 2 || bytes[0] != b'"' || bytes[bytes.len() - 1] != b'"' {
        return None;
    }

    let inner = &literal[1..literal.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        out.push(unescape(&mut chars, '"')?);
    }
    Some(out)
}

/// Decode a rune literal (including the surrounding quotes).
pub fn unquote_char(literal: &str) -> Option<char> {
    let bytes = literal.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'\'' || bytes[bytes.len() - 1] != b'\'' {
        return None;
    }
    let inner = &literal[1..literal.len() - 1];
    let mut chars = inner.chars();
    let ch = match chars.next()? {
        '\\' => unescape(&mut chars, '\'')?,
        ch => ch,
    };
    chars.next().is_none().then_some(ch)
}

/// Decode one escape sequence; the backslash has been consumed.
fn unescape(chars: &mut std::str::Chars<'_>, quote: char) -> Option<char> {
    let ch = chars.next()?;
    let (n, base) = match ch {
        'a' => return Some('\u{7}'),
        'b' => return Some('\u{8}'),
        'f' => return Some('\u{c}'),
        'n' => return Some('\n'),
        'r' => return Some('\r'),
        't' => return Some('\t'),
        'v' => return Some('\u{b}'),
        '\\' => return Some('\\'),
        ch if ch == quote => return Some(quote),
        '\'' => return Some('\''),
        '"' => return Some('"'),
        '0'..='7' => {
            // Three octal digits, the first already read.
            let mut x = ch.to_digit(8)?;
            for _ in 0..2 {
                x = x * 8 + chars.next()?.to_digit(8)?;
            }
            return char::from_u32(x);
        }
        'x' => (2, 16),
        'u' => (4, 16),
        'U' => (8, 16),
        _ => return None,
    };
    let mut x = 0u32;
    for _ in 0..n {
        x = x * base + chars.next()?.to_digit(base)?;
    }
    char::from_u32(x)
}

// ─────────────────────────────────────────────────────────────────────────────
// Convenience entry point
// ─────────────────────────────────────────────────────────────────────────────

/// Parse `src` as a fresh single-file program.
pub fn parse_source(
    file_set: &mut crate::position::SourceFileSet,
    name: &str,
    src: &[u8],
) -> Result<File, ErrorList> {
    let file = file_set.add_file(name, src.len());
    Parser::new(file, src).parse_file()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::SourceFileSet;

    fn parse(src: &str) -> File {
        let mut set = SourceFileSet::new();
        parse_source(&mut set, "test", src.as_bytes()).expect("parse failed")
    }

    fn parse_err(src: &str) -> ErrorList {
        let mut set = SourceFileSet::new();
        parse_source(&mut set, "test", src.as_bytes()).expect_err("parse should fail")
    }

    fn first_stmt_string(src: &str) -> String {
        parse(src).stmts[0].to_string()
    }

    #[test]
    fn test_precedence() {
        assert_eq!(first_stmt_string("a + b * c"), "(a + (b * c))");
        assert_eq!(first_stmt_string("a * b + c"), "((a * b) + c)");
        assert_eq!(first_stmt_string("a || b && c"), "(a || (b && c))");
        assert_eq!(first_stmt_string("a == b | c"), "(a == (b | c))");
        assert_eq!(first_stmt_string("a << b + c"), "((a << b) + c)");
        assert_eq!(first_stmt_string("-a * b"), "((-a) * b)");
        assert_eq!(first_stmt_string("!a == b"), "((!a) == b)");
    }

    #[test]
    fn test_ternary_right_assoc() {
        assert_eq!(
            first_stmt_string("a ? b : c ? d : e"),
            "(a ? b : (c ? d : e))"
        );
    }

    #[test]
    fn test_selector_and_index() {
        assert_eq!(first_stmt_string("a.b.c"), "a.b.c");
        assert_eq!(first_stmt_string("a[1][2]"), "a[1][2]");
        assert_eq!(first_stmt_string("a[1:2]"), "a[1:2]");
        assert_eq!(first_stmt_string("a[:2]"), "a[:2]");
        assert_eq!(first_stmt_string("a[1:]"), "a[1:]");
        assert_eq!(first_stmt_string("a[:]"), "a[:]");
    }

    #[test]
    fn test_call_with_spread() {
        assert_eq!(first_stmt_string("f(a, b...)"), "f(a, b...)");
        assert_eq!(first_stmt_string("f()"), "f()");
    }

    #[test]
    fn test_statements() {
        assert_eq!(first_stmt_string("x := 1"), "x := 1");
        assert_eq!(first_stmt_string("x += 2"), "x += 2");
        assert_eq!(first_stmt_string("x++"), "x++");
        assert_eq!(
            first_stmt_string("eğer a { b = 1 } yoksa { b = 2 }"),
            "eğer a {b = 1} yoksa {b = 2}"
        );
        assert_eq!(
            first_stmt_string("tekrarla i := 0; i < 5; i++ { s = s + i }"),
            "tekrarla i := 0 ; (i < 5) ; i++{s = s + i}"
        );
        assert_eq!(
            first_stmt_string("tekrarla k, v in m { yazdır(k) }"),
            "tekrarla k, v in m {yazdır(k)}"
        );
        assert_eq!(first_stmt_string("dön 42"), "dön 42");
        assert_eq!(first_stmt_string("paylaş {a: 1}"), "paylaş {a: 1}");
    }

    #[test]
    fn test_func_literal() {
        assert_eq!(
            first_stmt_string("f := fn(a, ...rest) { dön a }"),
            "f := fn(a, ...rest) {dön a}"
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(first_stmt_string("0x10"), "0x10");
        let file = parse("x := 0b101 + 0o17 + 0x1F + 017");
        match &file.stmts[0] {
            Stmt::Assign(_) => {}
            other => panic!("expected assign, got {other}"),
        }
        assert_eq!(first_stmt_string("kullan(\"fmt\")"), "kullan(\"fmt\")");
        assert_eq!(first_stmt_string("hata(\"k\")"), "hata(\"k\")");
        assert_eq!(first_stmt_string("sabit([1, 2])"), "sabit([1, 2])");
    }

    #[test]
    fn test_int_literal_parsing() {
        assert_eq!(parse_int_literal("42"), Some(42));
        assert_eq!(parse_int_literal("0x1F"), Some(31));
        assert_eq!(parse_int_literal("0b101"), Some(5));
        assert_eq!(parse_int_literal("0o17"), Some(15));
        assert_eq!(parse_int_literal("017"), Some(15));
        assert_eq!(parse_int_literal("1_000_000"), Some(1_000_000));
        assert_eq!(parse_int_literal("abc"), None);
    }

    #[test]
    fn test_float_literal_parsing() {
        assert_eq!(parse_float_literal("3.14"), Some(3.14));
        assert_eq!(parse_float_literal("1e3"), Some(1000.0));
        assert_eq!(parse_float_literal("0x1p4"), Some(16.0));
        assert_eq!(parse_float_literal("0x1.8p1"), Some(3.0));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(
            unquote_string(r#""a\tb\n""#).as_deref(),
            Some("a\tb\n")
        );
        assert_eq!(unquote_string(r#""\x41é""#).as_deref(), Some("Aé"));
        assert_eq!(unquote_string(r"`a\tb`").as_deref(), Some(r"a\tb"));
        assert_eq!(unquote_char(r"'\n'"), Some('\n'));
        assert_eq!(unquote_char("'ş'"), Some('ş'));
        assert_eq!(unquote_char("'ab'"), None);
    }

    #[test]
    fn test_reprint_reparse_equivalence() {
        let sources = [
            "a := 1 + 2 * 3",
            "eğer a < b { c = 1 } yoksa eğer a > b { c = 2 } yoksa { c = 3 }",
            "tekrarla i := 0; i < 10; i++ { toplam += i }",
            "tekrarla k, v in {a: 1, b: 2} { yazdır(k, v) }",
            "f := fn(x, ...xs) { dön x ? xs : [] }",
            "m := sabit({a: [1, 2], b: \"s\"})",
            "x = a.b[1][2:3].c(d, e...)",
        ];
        for src in sources {
            let printed = parse(src).to_string();
            let reprinted = parse(&printed).to_string();
            assert_eq!(printed, reprinted, "source: {src}");
        }
    }

    #[test]
    fn test_multiline_literals() {
        // A newline before the closing brace/bracket must not break the
        // literal, even though it inserts a semicolon.
        let src = "m := {\n  a: fn() { dön 1 },\n  b: 2\n}";
        assert_eq!(first_stmt_string(src), "m := {a: fn() {dön 1}, b: 2}");

        let src = "l := [\n  1,\n  2\n]";
        assert_eq!(first_stmt_string(src), "l := [1, 2]");

        // Trailing comma before the closing token is rejected.
        let errs = parse_err("l := [1, 2,]");
        assert!(!errs.0.is_empty());
    }

    #[test]
    fn test_errors_are_collected() {
        let errs = parse_err("a := ][\nb := )(");
        assert!(errs.0.len() >= 2, "want multiple errors, got {:?}", errs.0);
    }

    #[test]
    fn test_missing_condition() {
        let errs = parse_err("eğer { a = 1 }");
        assert!(errs.0[0].message.contains("condition"));
    }
}
