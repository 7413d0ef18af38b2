//! Lexical scanner with automatic semicolon insertion.
//!
//! The scanner is pull-based: each call to [`Scanner::scan`] returns one
//! `(Token, literal, Pos)` triple, ending with [`Token::Eof`].  Literals keep
//! the raw source text (including quotes); unquoting happens in the parser.
//!
//! # Semicolon insertion
//!
//! A newline terminates a statement when the previous token could end one
//! (identifiers, literals, `dur`/`devam`/`dön`/`paylaş`, `doğru`/`yanlış`/
//! `tanımsız`, `++`/`--`, and the closing brackets).  In that state the
//! scanner emits `Token::Semicolon` with literal `"\n"` instead of skipping
//! the newline.  End of input behaves like a final newline.  A comment that
//! spans or ends a line triggers the same insertion at the comment's start,
//! which requires bounded lookahead ([`Scanner::find_line_end`]).
//!
//! # Errors
//!
//! Scanning never aborts: invalid input produces [`Token::Illegal`] and an
//! entry in the collected error list, so the parser can report everything in
//! one pass.

use std::rc::Rc;

use crate::position::{Pos, SourceFile, SourceFilePos};
use crate::token::{lookup_ident, Token};

/// The byte-order mark, tolerated only at offset 0.
const BOM: char = '\u{FEFF}';

// ─────────────────────────────────────────────────────────────────────────────
// Errors and modes
// ─────────────────────────────────────────────────────────────────────────────

/// A non-fatal scanning error; scanning continues after recording it.
#[derive(Debug, Clone)]
pub struct ScanError {
    pub pos: SourceFilePos,
    pub message: String,
}

/// Scanner behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanMode {
    /// Surface comments as [`Token::Comment`] instead of skipping them.
    pub scan_comments: bool,
    /// Disable automatic semicolon insertion (token-dump tooling).
    pub dont_insert_semis: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Scanner
// ─────────────────────────────────────────────────────────────────────────────

/// The lexical scanner.  Construct with [`Scanner::new`], then call
/// [`Scanner::scan`] until it returns [`Token::Eof`].
pub struct Scanner<'s> {
    file: Rc<SourceFile>,
    src: &'s [u8],
    /// Current character, or `None` at end of input.
    ch: Option<char>,
    /// Byte offset of `ch`.
    offset: usize,
    /// Byte offset of the character after `ch`.
    read_offset: usize,
    /// Whether a newline in this state should become a semicolon.
    insert_semi: bool,
    errors: Vec<ScanError>,
    mode: ScanMode,
}

impl<'s> Scanner<'s> {
    /// Create a scanner over `src`, which must match the registered size of
    /// `file`.
    pub fn new(file: Rc<SourceFile>, src: &'s [u8], mode: ScanMode) -> Scanner<'s> {
        debug_assert_eq!(file.size as usize, src.len(), "file size mismatch");
        let mut s = Scanner {
            file,
            src,
            ch: Some(' '),
            offset: 0,
            read_offset: 0,
            insert_semi: false,
            errors: Vec::new(),
            mode,
        };
        s.next();
        if s.ch == Some(BOM) {
            s.next();
        }
        s
    }

    /// Number of errors recorded so far.
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Drain the collected errors.
    pub fn take_errors(&mut self) -> Vec<ScanError> {
        std::mem::take(&mut self.errors)
    }

    /// Produce the next token.
    pub fn scan(&mut self) -> (Token, String, Pos) {
        self.skip_whitespace();

        let pos = self.file.file_set_pos(self.offset);
        let mut tok = Token::Illegal;
        let mut literal = String::new();
        let mut insert_semi = false;

        match self.ch {
            Some(ch) if is_letter(ch) => {
                literal = self.scan_identifier();
                tok = lookup_ident(&literal);
                insert_semi = matches!(
                    tok,
                    Token::Ident
                        | Token::Break
                        | Token::Continue
                        | Token::Return
                        | Token::Export
                        | Token::True
                        | Token::False
                        | Token::Undefined
                );
            }
            Some(ch)
                if ch.is_ascii_digit()
                    || (ch == '.' && self.peek_byte().is_ascii_digit()) =>
            {
                insert_semi = true;
                let (t, lit) = self.scan_number();
                tok = t;
                literal = lit;
            }
            cur => {
                self.next();
                match cur {
                    None => {
                        if self.insert_semi {
                            self.insert_semi = false;
                            return (Token::Semicolon, "\n".to_string(), pos);
                        }
                        tok = Token::Eof;
                    }
                    Some('\n') => {
                        // Only reachable when insert_semi is set; whitespace
                        // skipping consumes all other newlines.
                        self.insert_semi = false;
                        return (Token::Semicolon, "\n".to_string(), pos);
                    }
                    Some('"') => {
                        insert_semi = true;
                        tok = Token::String;
                        literal = self.scan_string();
                    }
                    Some('\'') => {
                        insert_semi = true;
                        tok = Token::Char;
                        literal = self.scan_rune();
                    }
                    Some('`') => {
                        insert_semi = true;
                        tok = Token::String;
                        literal = self.scan_raw_string();
                    }
                    Some(':') => tok = self.switch2(Token::Colon, Token::Define),
                    Some('.') => {
                        tok = Token::Period;
                        if self.ch == Some('.') && self.peek_byte() == b'.' {
                            self.next();
                            self.next();
                            tok = Token::Ellipsis;
                        }
                    }
                    Some(',') => tok = Token::Comma,
                    Some('?') => tok = Token::Question,
                    Some(';') => {
                        tok = Token::Semicolon;
                        literal = ";".to_string();
                    }
                    Some('(') => tok = Token::LParen,
                    Some(')') => {
                        insert_semi = true;
                        tok = Token::RParen;
                    }
                    Some('[') => tok = Token::LBrack,
                    Some(']') => {
                        insert_semi = true;
                        tok = Token::RBrack;
                    }
                    Some('{') => tok = Token::LBrace,
                    Some('}') => {
                        insert_semi = true;
                        tok = Token::RBrace;
                    }
                    Some('+') => {
                        tok = self.switch3(Token::Add, Token::AddAssign, '+', Token::Inc);
                        insert_semi = tok == Token::Inc;
                    }
                    Some('-') => {
                        tok = self.switch3(Token::Sub, Token::SubAssign, '-', Token::Dec);
                        insert_semi = tok == Token::Dec;
                    }
                    Some('*') => tok = self.switch2(Token::Mul, Token::MulAssign),
                    Some('/') => {
                        if self.ch == Some('/') || self.ch == Some('*') {
                            if self.insert_semi && self.find_line_end() {
                                // The comment ends the line: rewind to the
                                // first `/` and deliver the semicolon first.
                                self.ch = Some('/');
                                self.offset = self.file.offset(pos);
                                self.read_offset = self.offset + 1;
                                self.insert_semi = false;
                                return (Token::Semicolon, "\n".to_string(), pos);
                            }
                            let comment = self.scan_comment();
                            if !self.mode.scan_comments {
                                self.insert_semi = false;
                                return self.scan();
                            }
                            tok = Token::Comment;
                            literal = comment;
                        } else {
                            tok = self.switch2(Token::Quo, Token::QuoAssign);
                        }
                    }
                    Some('%') => tok = self.switch2(Token::Rem, Token::RemAssign),
                    Some('^') => tok = self.switch2(Token::Xor, Token::XorAssign),
                    Some('<') => {
                        tok = self.switch4(Token::Less, Token::LessEq, '<', Token::Shl, Token::ShlAssign)
                    }
                    Some('>') => {
                        tok = self.switch4(
                            Token::Greater,
                            Token::GreaterEq,
                            '>',
                            Token::Shr,
                            Token::ShrAssign,
                        )
                    }
                    Some('=') => tok = self.switch2(Token::Assign, Token::Equal),
                    Some('!') => tok = self.switch2(Token::Not, Token::NotEqual),
                    Some('&') => {
                        if self.ch == Some('^') {
                            self.next();
                            tok = self.switch2(Token::AndNot, Token::AndNotAssign);
                        } else {
                            tok = self.switch3(Token::And, Token::AndAssign, '&', Token::LAnd);
                        }
                    }
                    Some('|') => tok = self.switch3(Token::Or, Token::OrAssign, '|', Token::LOr),
                    Some(other) => {
                        if other != BOM {
                            self.error(
                                self.file.offset(pos),
                                format!("invalid character {other:?}"),
                            );
                        }
                        insert_semi = self.insert_semi;
                        tok = Token::Illegal;
                        literal = other.to_string();
                    }
                }
            }
        }

        if !self.mode.dont_insert_semis {
            self.insert_semi = insert_semi;
        }
        (tok, literal, pos)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cursor
    // ─────────────────────────────────────────────────────────────────────────

    fn next(&mut self) {
        if self.read_offset < self.src.len() {
            self.offset = self.read_offset;
            if self.ch == Some('\n') {
                self.file.add_line(self.offset);
            }
            let b = self.src[self.read_offset];
            let (r, w) = if b == 0 {
                self.error(self.offset, "invalid character NUL".to_string());
                (Some('\u{0}'), 1)
            } else if b < 0x80 {
                (Some(b as char), 1)
            } else {
                match next_utf8(&self.src[self.read_offset..]) {
                    Some((c, w)) => {
                        if c == BOM && self.offset > 0 {
                            self.error(self.offset, "invalid byte order mark".to_string());
                        }
                        (Some(c), w)
                    }
                    None => {
                        self.error(self.offset, "invalid UTF-8 encoding".to_string());
                        (Some('\u{FFFD}'), 1)
                    }
                }
            };
            self.read_offset += w;
            self.ch = r;
        } else {
            self.offset = self.src.len();
            if self.ch == Some('\n') {
                self.file.add_line(self.offset);
            }
            self.ch = None;
        }
    }

    /// Peek at the next raw byte without consuming it (0 at end of input).
    fn peek_byte(&self) -> u8 {
        self.src.get(self.read_offset).copied().unwrap_or(0)
    }

    fn error(&mut self, offset: usize, message: String) {
        let pos = self.file.position(self.file.file_set_pos(offset));
        self.errors.push(ScanError { pos, message });
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.ch {
                Some(' ') | Some('\t') | Some('\r') => self.next(),
                Some('\n') if !self.insert_semi => self.next(),
                _ => break,
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Comments
    // ─────────────────────────────────────────────────────────────────────────

    /// Scan a comment; the leading `/` has been consumed and `self.ch` holds
    /// the second `/` or the `*`.
    fn scan_comment(&mut self) -> String {
        let offs = self.offset - 1;

        if self.ch == Some('/') {
            self.next();
            while self.ch.is_some() && self.ch != Some('\n') {
                self.next();
            }
        } else {
            self.next();
            let mut terminated = false;
            while let Some(ch) = self.ch {
                self.next();
                if ch == '*' && self.ch == Some('/') {
                    self.next();
                    terminated = true;
                    break;
                }
            }
            if !terminated {
                self.error(offs, "comment not terminated".to_string());
            }
        }

        String::from_utf8_lossy(&self.src[offs..self.offset])
            .replace('\r', "")
    }

    /// Decide whether a semicolon should be inserted before the comment the
    /// cursor is sitting on: true if the comment (plus any comments chained
    /// after it) runs to a line end.  The cursor is restored afterwards.
    fn find_line_end(&mut self) -> bool {
        // Offset of the `/` that opened the comment.
        let offs = self.offset - 1;
        let found = self.find_line_end_inner();

        // Rewind so the comment can be scanned again for real.
        self.ch = Some('/');
        self.offset = offs;
        self.read_offset = offs + 1;
        self.next();
        found
    }

    fn find_line_end_inner(&mut self) -> bool {
        while self.ch == Some('/') || self.ch == Some('*') {
            if self.ch == Some('/') {
                return true; // line comments always run to the line end
            }
            // Block comment: scan to `*/`, watching for embedded newlines.
            self.next();
            while let Some(ch) = self.ch {
                if ch == '\n' {
                    return true;
                }
                self.next();
                if ch == '*' && self.ch == Some('/') {
                    self.next();
                    break;
                }
            }
            self.skip_whitespace(); // insert_semi is set, so `\n` stops here
            if self.ch.is_none() || self.ch == Some('\n') {
                return true;
            }
            if self.ch != Some('/') {
                // Non-comment token on the same line.
                return false;
            }
            self.next(); // consume the `/` of the next comment candidate
        }
        false
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Identifiers and numbers
    // ─────────────────────────────────────────────────────────────────────────

    fn scan_identifier(&mut self) -> String {
        let offs = self.offset;
        while matches!(self.ch, Some(ch) if is_letter(ch) || is_digit(ch)) {
            self.next();
        }
        String::from_utf8_lossy(&self.src[offs..self.offset]).into_owned()
    }

    fn scan_digits(&mut self, base: u32) {
        while matches!(self.ch, Some(ch) if ch == '_' || digit_val(ch) < base) {
            self.next();
        }
    }

    fn scan_number(&mut self) -> (Token, String) {
        let offs = self.offset;
        let mut tok = Token::Int;
        let mut base = 10;

        if self.ch == Some('0') {
            match self.peek_byte().to_ascii_lowercase() {
                b'b' => {
                    base = 2;
                    self.next();
                    self.next();
                }
                b'o' => {
                    base = 8;
                    self.next();
                    self.next();
                }
                b'x' => {
                    base = 16;
                    self.next();
                    self.next();
                }
                _ => {}
            }
        }

        self.scan_digits(base);

        if self.ch == Some('.') && (base == 10 || base == 16) {
            tok = Token::Float;
            self.next();
            self.scan_digits(base);
        }

        if matches!(self.ch, Some('e' | 'E' | 'p' | 'P')) {
            tok = Token::Float;
            self.next();
            if matches!(self.ch, Some('-' | '+')) {
                self.next();
            }
            let exp_offs = self.offset;
            self.scan_digits(10);
            if exp_offs == self.offset {
                self.error(exp_offs, "exponent has no digits".to_string());
            }
        }

        (
            tok,
            String::from_utf8_lossy(&self.src[offs..self.offset]).into_owned(),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Strings, runes, escapes
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate one escape sequence after a `\`; `quote` is the surrounding
    /// quote character.  Returns false (and records an error) when malformed.
    fn scan_escape(&mut self, quote: char) -> bool {
        let offs = self.offset;

        let (n, base, max): (u32, u32, u32) = match self.ch {
            Some('a' | 'b' | 'f' | 'n' | 'r' | 't' | 'v' | '\\') => {
                self.next();
                return true;
            }
            Some(ch) if ch == quote => {
                self.next();
                return true;
            }
            Some('0'..='7') => (3, 8, 255),
            Some('x') => {
                self.next();
                (2, 16, 255)
            }
            Some('u') => {
                self.next();
                (4, 16, char::MAX as u32)
            }
            Some('U') => {
                self.next();
                (8, 16, char::MAX as u32)
            }
            _ => {
                let msg = if self.ch.is_none() {
                    "escape sequence not terminated"
                } else {
                    "unknown escape sequence"
                };
                self.error(offs, msg.to_string());
                return false;
            }
        };

        let mut x: u32 = 0;
        for _ in 0..n {
            let d = self.ch.map(digit_val).unwrap_or(16);
            if d >= base {
                let msg = match self.ch {
                    Some(ch) => format!("invalid character {ch:?} in escape sequence"),
                    None => "escape sequence not terminated".to_string(),
                };
                self.error(self.offset, msg);
                return false;
            }
            x = x * base + d;
            self.next();
        }

        if x > max || (0xD800..0xE000).contains(&x) {
            self.error(offs, "invalid Unicode code point in escape".to_string());
            return false;
        }
        true
    }

    fn scan_rune(&mut self) -> String {
        // The opening quote has been consumed.
        let offs = self.offset - 1;

        let mut valid = true;
        let mut n = 0;
        loop {
            let ch = self.ch;
            if ch == Some('\n') || ch.is_none() {
                if valid {
                    self.error(offs, "rune literal not terminated".to_string());
                    valid = false;
                }
                break;
            }
            self.next();
            if ch == Some('\'') {
                break;
            }
            n += 1;
            if ch == Some('\\') && !self.scan_escape('\'') {
                valid = false;
            }
        }

        if valid && n != 1 {
            self.error(offs, "rune literal must contain exactly one character".to_string());
        }
        String::from_utf8_lossy(&self.src[offs..self.offset]).into_owned()
    }

    fn scan_string(&mut self) -> String {
        let offs = self.offset - 1;

        loop {
            let ch = self.ch;
            if ch == Some('\n') || ch.is_none() {
                self.error(offs, "string literal not terminated".to_string());
                break;
            }
            self.next();
            if ch == Some('"') {
                break;
            }
            if ch == Some('\\') {
                self.scan_escape('"');
            }
        }
        String::from_utf8_lossy(&self.src[offs..self.offset]).into_owned()
    }

    fn scan_raw_string(&mut self) -> String {
        let offs = self.offset - 1;

        loop {
            let ch = self.ch;
            if ch.is_none() {
                self.error(offs, "raw string literal not terminated".to_string());
                break;
            }
            self.next();
            if ch == Some('`') {
                break;
            }
        }
        String::from_utf8_lossy(&self.src[offs..self.offset]).replace('\r', "")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Multi-character operator helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn switch2(&mut self, tok0: Token, tok1: Token) -> Token {
        if self.ch == Some('=') {
            self.next();
            return tok1;
        }
        tok0
    }

    fn switch3(&mut self, tok0: Token, tok1: Token, ch2: char, tok2: Token) -> Token {
        if self.ch == Some('=') {
            self.next();
            return tok1;
        }
        if self.ch == Some(ch2) {
            self.next();
            return tok2;
        }
        tok0
    }

    fn switch4(&mut self, tok0: Token, tok1: Token, ch2: char, tok2: Token, tok3: Token) -> Token {
        if self.ch == Some('=') {
            self.next();
            return tok1;
        }
        if self.ch == Some(ch2) {
            self.next();
            if self.ch == Some('=') {
                self.next();
                return tok3;
            }
            return tok2;
        }
        tok0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Character classes
// ─────────────────────────────────────────────────────────────────────────────

fn is_letter(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || (!ch.is_ascii() && ch.is_alphabetic())
}

fn is_digit(ch: char) -> bool {
    ch.is_ascii_digit() || (!ch.is_ascii() && ch.is_numeric())
}

fn digit_val(ch: char) -> u32 {
    match ch {
        '0'..='9' => ch as u32 - '0' as u32,
        'a'..='f' => ch as u32 - 'a' as u32 + 10,
        'A'..='F' => ch as u32 - 'A' as u32 + 10,
        _ => 16,
    }
}

/// Decode the first UTF-8 scalar in `bytes`, returning the char and its width.
fn next_utf8(bytes: &[u8]) -> Option<(char, usize)> {
    let width = match bytes[0] {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => return None,
    };
    if bytes.len() < width {
        return None;
    }
    let s = std::str::from_utf8(&bytes[..width]).ok()?;
    s.chars().next().map(|c| (c, width))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::SourceFileSet;

    fn scan_all(src: &str) -> Vec<(Token, String)> {
        let mut set = SourceFileSet::new();
        let file = set.add_file("test", src.len());
        let mut s = Scanner::new(file, src.as_bytes(), ScanMode::default());
        let mut out = Vec::new();
        loop {
            let (tok, lit, _) = s.scan();
            if tok == Token::Eof {
                break;
            }
            out.push((tok, lit));
        }
        assert_eq!(s.error_count(), 0, "unexpected scan errors");
        out
    }

    fn kinds(src: &str) -> Vec<Token> {
        scan_all(src).into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_operators_and_keywords() {
        assert_eq!(
            kinds("a := 1 + 2 * 3"),
            vec![
                Token::Ident,
                Token::Define,
                Token::Int,
                Token::Add,
                Token::Int,
                Token::Mul,
                Token::Int,
                Token::Semicolon, // EOF after `3` inserts one
            ]
        );
        // No newline between `dön` and `}`, so no inserted semicolon there;
        // the final `}` gets one at end of input.
        assert_eq!(
            kinds("eğer doğru { dön }"),
            vec![
                Token::If,
                Token::True,
                Token::LBrace,
                Token::Return,
                Token::RBrace,
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_semicolon_insertion_at_newlines() {
        let toks = kinds("a = 1\nb = 2\n");
        let semis = toks.iter().filter(|&&t| t == Token::Semicolon).count();
        assert_eq!(semis, 2);

        // No insertion after an operator.
        let toks = kinds("a = 1 +\n2");
        assert!(!toks.contains(&Token::Illegal));
        assert_eq!(
            toks.iter().filter(|&&t| t == Token::Semicolon).count(),
            1 // only the EOF-inserted one after `2`
        );
    }

    #[test]
    fn test_comment_triggers_insertion() {
        // The block comment contains a newline, so a semicolon is inserted at
        // the comment's start.
        let toks = kinds("a /* yorum\n */ b");
        assert_eq!(
            toks,
            vec![
                Token::Ident,
                Token::Semicolon,
                Token::Ident,
                Token::Semicolon,
            ]
        );

        // Same-line block comment does not break the statement.
        let toks = kinds("a /* yorum */ + b");
        assert_eq!(
            toks,
            vec![
                Token::Ident,
                Token::Add,
                Token::Ident,
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_number_literals() {
        let all = scan_all("0b1010 0o17 0x_1F 12 3.14 1e9 0x1p4");
        let toks: Vec<Token> = all.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            toks,
            vec![
                Token::Int,
                Token::Int,
                Token::Int,
                Token::Int,
                Token::Float,
                Token::Float,
                Token::Float,
                Token::Semicolon,
            ]
        );
        assert_eq!(all[0].1, "0b1010");
        assert_eq!(all[4].1, "3.14");
    }

    #[test]
    fn test_string_and_rune_literals() {
        let all = scan_all(r#""merhaba \n dünya" 'x' `ham\n`"#);
        assert_eq!(all[0].0, Token::String);
        assert_eq!(all[0].1, r#""merhaba \n dünya""#);
        assert_eq!(all[1].0, Token::Char);
        assert_eq!(all[2].0, Token::String);
        assert_eq!(all[2].1, r"`ham\n`");
    }

    #[test]
    fn test_multi_char_operators() {
        assert_eq!(
            kinds("a &^= b >>= c ... d"),
            vec![
                Token::Ident,
                Token::AndNotAssign,
                Token::Ident,
                Token::ShrAssign,
                Token::Ident,
                Token::Ellipsis,
                Token::Ident,
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_invalid_character_is_collected() {
        let mut set = SourceFileSet::new();
        let src = "a $ b";
        let file = set.add_file("test", src.len());
        let mut s = Scanner::new(file, src.as_bytes(), ScanMode::default());
        let mut illegal = 0;
        loop {
            let (tok, _, _) = s.scan();
            if tok == Token::Eof {
                break;
            }
            if tok == Token::Illegal {
                illegal += 1;
            }
        }
        assert_eq!(illegal, 1);
        assert_eq!(s.error_count(), 1);
    }

    #[test]
    fn test_nul_byte_rejected() {
        let mut set = SourceFileSet::new();
        let src = b"a\x00b";
        let file = set.add_file("test", src.len());
        let mut s = Scanner::new(file, src, ScanMode::default());
        while s.scan().0 != Token::Eof {}
        assert!(s.error_count() > 0);
    }

    #[test]
    fn test_line_table_populated() {
        let mut set = SourceFileSet::new();
        let src = "a\nb\nc";
        let file = set.add_file("test", src.len());
        let mut s = Scanner::new(Rc::clone(&file), src.as_bytes(), ScanMode::default());
        let mut last = Pos::NONE;
        loop {
            let (tok, _, pos) = s.scan();
            if tok == Token::Eof {
                break;
            }
            last = pos;
        }
        assert_eq!(file.line_count(), 3);
        assert_eq!(set.position(last).line, 3);
    }
}
