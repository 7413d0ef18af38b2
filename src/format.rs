//! The `printf`-style format runtime behind the `f` builtin and the `fmt`
//! module.
//!
//! Supported verbs: `v s q d b o O x X c U t f F e E g G T %`.  Flags
//! `#`, `0`, `-`, `+` and space are honored where they make sense; width
//! and precision may be given literally or as `*` (consumed from the
//! argument list); `%[n]v` selects the n-th (1-based) argument explicitly.
//!
//! A mismatched verb does not fail the whole format: it renders a
//! `%!verb(type=value)` marker, so a bad format string still produces
//! output.  The final string is bounded by
//! [`MAX_STRING_LEN`](crate::MAX_STRING_LEN).

use crate::value::{quote_string, RuntimeError, Value};
use crate::MAX_STRING_LEN;

// ─────────────────────────────────────────────────────────────────────────────
// Spec
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    alternate: bool,   // '#'
    zero_pad: bool,    // '0'
    left_align: bool,  // '-'
    plus: bool,        // '+'
    space: bool,       // ' '
}

#[derive(Debug, Default, Clone, Copy)]
struct Spec {
    flags: Flags,
    width: Option<usize>,
    precision: Option<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry point
// ─────────────────────────────────────────────────────────────────────────────

/// Render `format` with `args`.
pub fn format(format: &str, args: &[Value]) -> Result<String, RuntimeError> {
    let mut out = String::with_capacity(format.len() + 16 * args.len());
    let mut chars = format.chars().peekable();
    let mut arg_index = 0usize;

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }

        let mut spec = Spec::default();

        // Flags.
        while let Some(&flag) = chars.peek() {
            match flag {
                '#' => spec.flags.alternate = true,
                '0' => spec.flags.zero_pad = true,
                '-' => spec.flags.left_align = true,
                '+' => spec.flags.plus = true,
                ' ' => spec.flags.space = true,
                _ => break,
            }
            chars.next();
        }

        // Explicit argument index: %[n]v.
        if chars.peek() == Some(&'[') {
            chars.next();
            let mut n = 0usize;
            let mut any = false;
            while let Some(&d) = chars.peek() {
                match d.to_digit(10) {
                    Some(d) => {
                        n = n * 10 + d as usize;
                        any = true;
                        chars.next();
                    }
                    None => break,
                }
            }
            if chars.peek() == Some(&']') && any && n >= 1 {
                chars.next();
                arg_index = n - 1;
            } else {
                out.push_str("%!(BADINDEX)");
                // Skip to the verb to stay aligned.
                while chars.peek().map_or(false, |&c| c != ']') {
                    chars.next();
                }
                chars.next();
                continue;
            }
        }

        // Width.
        if chars.peek() == Some(&'*') {
            chars.next();
            spec.width = take_star_operand(args, &mut arg_index);
        } else {
            spec.width = take_number(&mut chars);
        }

        // Precision.
        if chars.peek() == Some(&'.') {
            chars.next();
            if chars.peek() == Some(&'*') {
                chars.next();
                spec.precision = take_star_operand(args, &mut arg_index);
            } else {
                spec.precision = Some(take_number(&mut chars).unwrap_or(0));
            }
        }

        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };

        if verb == '%' {
            out.push('%');
            continue;
        }

        match args.get(arg_index) {
            Some(arg) => {
                out.push_str(&format_one(verb, spec, arg));
                arg_index += 1;
            }
            None => {
                out.push_str(&format!("%!{verb}(MISSING)"));
            }
        }

        if out.len() > MAX_STRING_LEN {
            return Err(RuntimeError::StringLimit);
        }
    }

    if out.len() > MAX_STRING_LEN {
        return Err(RuntimeError::StringLimit);
    }
    Ok(out)
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut n = 0usize;
    let mut any = false;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        n = n * 10 + d as usize;
        any = true;
        chars.next();
    }
    any.then_some(n)
}

fn take_star_operand(args: &[Value], arg_index: &mut usize) -> Option<usize> {
    let v = args.get(*arg_index)?;
    *arg_index += 1;
    match v {
        Value::Int(n) if *n >= 0 => Some(*n as usize),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-verb rendering
// ─────────────────────────────────────────────────────────────────────────────

fn format_one(verb: char, spec: Spec, arg: &Value) -> String {
    let body = match verb {
        'v' => Some(display_value(arg)),
        's' => Some(string_value(arg, spec)),
        'q' => Some(quoted_value(arg)),
        'd' => int_arg(arg).map(|v| signed_decimal(v, spec)),
        'b' => int_arg(arg).map(|v| radix_form(v, 2, false, spec, "0b")),
        'o' => int_arg(arg).map(|v| radix_form(v, 8, false, spec, "0")),
        // %O always carries the 0o prefix.
        'O' => int_arg(arg).map(|v| {
            let mut forced = spec;
            forced.flags.alternate = true;
            radix_form(v, 8, false, forced, "0o")
        }),
        'x' => hex_form(arg, false, spec),
        'X' => hex_form(arg, true, spec),
        'c' => match arg {
            Value::Char(c) => Some(c.to_string()),
            Value::Int(n) => u32::try_from(*n)
                .ok()
                .and_then(char::from_u32)
                .map(|c| c.to_string()),
            _ => None,
        },
        'U' => match arg {
            Value::Char(c) => Some(format!("U+{:04X}", *c as u32)),
            Value::Int(n) => Some(format!("U+{:04X}", *n)),
            _ => None,
        },
        't' => match arg {
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        },
        'f' | 'F' => float_arg(arg).map(|v| {
            let prec = spec.precision.unwrap_or(6);
            sign_prefix(v.is_sign_negative(), spec, format!("{:.prec$}", v.abs()))
        }),
        'e' | 'E' => float_arg(arg).map(|v| exponent_form(v, spec, verb == 'E')),
        'g' | 'G' => float_arg(arg).map(|v| general_form(v, spec, verb == 'G')),
        'T' => Some(arg.type_name()),
        _ => None,
    };

    match body {
        Some(body) => pad(body, spec),
        None => format!("%!{verb}({}={})", arg.type_name(), display_value(arg)),
    }
}

/// `%v`/`%s` rendering: strings appear raw, everything else uses its
/// display form.
fn display_value(v: &Value) -> String {
    match v {
        Value::Str(s) => s.value.clone(),
        other => other.to_string(),
    }
}

fn string_value(v: &Value, spec: Spec) -> String {
    let mut s = display_value(v);
    if let Some(prec) = spec.precision {
        // Precision truncates strings at a code-point boundary.
        s = s.chars().take(prec).collect();
    }
    s
}

fn quoted_value(v: &Value) -> String {
    match v {
        Value::Char(c) => format!("'{c}'"),
        other => quote_string(&display_value(other)),
    }
}

fn int_arg(v: &Value) -> Option<i64> {
    match v {
        Value::Int(n) => Some(*n),
        Value::Char(c) => Some(*c as i64),
        _ => None,
    }
}

fn float_arg(v: &Value) -> Option<f64> {
    match v {
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn signed_decimal(v: i64, spec: Spec) -> String {
    sign_prefix(v < 0, spec, v.unsigned_abs().to_string())
}

/// Render `v` in the given radix; `#` prepends the alternate-form prefix.
fn radix_form(v: i64, radix: u32, upper: bool, spec: Spec, prefix: &str) -> String {
    let magnitude = v.unsigned_abs();
    let mut digits = match radix {
        2 => format!("{magnitude:b}"),
        8 => format!("{magnitude:o}"),
        16 if upper => format!("{magnitude:X}"),
        16 => format!("{magnitude:x}"),
        _ => magnitude.to_string(),
    };
    if spec.flags.alternate {
        digits = format!("{prefix}{digits}");
    }
    sign_prefix(v < 0, spec, digits)
}

fn hex_form(arg: &Value, upper: bool, spec: Spec) -> Option<String> {
    match arg {
        Value::Int(_) | Value::Char(_) => {
            int_arg(arg).map(|v| radix_form(v, 16, upper, spec, if upper { "0X" } else { "0x" }))
        }
        // Strings and byte strings hex-dump their bytes.
        Value::Str(s) => Some(hex_bytes(s.value.as_bytes(), upper)),
        Value::Bytes(b) => Some(hex_bytes(b, upper)),
        _ => None,
    }
}

fn hex_bytes(bytes: &[u8], upper: bool) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        if upper {
            out.push_str(&format!("{b:02X}"));
        } else {
            out.push_str(&format!("{b:02x}"));
        }
    }
    out
}

/// Go-style exponent notation: `1.500000e+02`.
fn exponent_form(v: f64, spec: Spec, upper: bool) -> String {
    let prec = spec.precision.unwrap_or(6);
    let (mantissa, exp) = split_exponent(v.abs());
    let e = if upper { 'E' } else { 'e' };
    let sign = if exp < 0 { '-' } else { '+' };
    let body = format!("{:.prec$}{e}{sign}{:02}", mantissa, exp.abs());
    sign_prefix(v.is_sign_negative(), spec, body)
}

/// `%g`: exponent form for very large or very small magnitudes, plain
/// decimal otherwise (the shortest representation when no precision is
/// given).
fn general_form(v: f64, spec: Spec, upper: bool) -> String {
    if v == 0.0 || v.is_nan() || v.is_infinite() {
        return sign_prefix(v.is_sign_negative() && v != 0.0, spec, format!("{}", v.abs()));
    }
    let exp = v.abs().log10().floor() as i32;
    let threshold = spec.precision.unwrap_or(21) as i32;
    if exp < -4 || exp >= threshold {
        exponent_form(v, spec, upper)
    } else {
        match spec.precision {
            Some(prec) => {
                let decimals = (prec as i32 - 1 - exp).max(0) as usize;
                sign_prefix(v.is_sign_negative(), spec, format!("{:.decimals$}", v.abs()))
            }
            None => format!("{v}"),
        }
    }
}

fn split_exponent(v: f64) -> (f64, i32) {
    if v == 0.0 || !v.is_finite() {
        return (v, 0);
    }
    let exp = v.log10().floor() as i32;
    (v / 10f64.powi(exp), exp)
}

fn sign_prefix(negative: bool, spec: Spec, body: String) -> String {
    if negative {
        format!("-{body}")
    } else if spec.flags.plus {
        format!("+{body}")
    } else if spec.flags.space {
        format!(" {body}")
    } else {
        body
    }
}

/// Apply width padding: spaces by default, zeros after the sign for
/// right-aligned numerics with the `0` flag.
fn pad(body: String, spec: Spec) -> String {
    let Some(width) = spec.width else { return body };
    let len = body.chars().count();
    if len >= width {
        return body;
    }
    let fill = width - len;
    if spec.flags.left_align {
        let mut out = body;
        out.extend(std::iter::repeat(' ').take(fill));
        out
    } else if spec.flags.zero_pad {
        // Zeros go between the sign and the digits.
        let (sign, rest) = match body.strip_prefix(['-', '+']) {
            Some(rest) => (&body[..1], rest),
            None => ("", body.as_str()),
        };
        format!("{sign}{}{rest}", "0".repeat(fill))
    } else {
        format!("{}{body}", " ".repeat(fill))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(f: &str, args: &[Value]) -> String {
        format(f, args).unwrap()
    }

    #[test]
    fn test_basic_verbs() {
        assert_eq!(fmt("%d", &[Value::Int(42)]), "42");
        assert_eq!(fmt("%s", &[Value::string("ab")]), "ab");
        assert_eq!(fmt("%v", &[Value::Int(-3)]), "-3");
        assert_eq!(fmt("%t", &[Value::Bool(true)]), "true");
        assert_eq!(fmt("%c", &[Value::Int(97)]), "a");
        assert_eq!(fmt("%T", &[Value::string("x")]), "string");
        assert_eq!(fmt("%%d", &[]), "%d");
    }

    #[test]
    fn test_radix_verbs() {
        assert_eq!(fmt("%b", &[Value::Int(5)]), "101");
        assert_eq!(fmt("%o", &[Value::Int(8)]), "10");
        assert_eq!(fmt("%x", &[Value::Int(255)]), "ff");
        assert_eq!(fmt("%X", &[Value::Int(255)]), "FF");
        assert_eq!(fmt("%#x", &[Value::Int(255)]), "0xff");
        assert_eq!(fmt("%x", &[Value::string("ab")]), "6162");
        assert_eq!(fmt("%U", &[Value::Char('ş')]), "U+015F");
    }

    #[test]
    fn test_float_verbs() {
        assert_eq!(fmt("%f", &[Value::Float(1.5)]), "1.500000");
        assert_eq!(fmt("%.2f", &[Value::Float(1.567)]), "1.57");
        assert_eq!(fmt("%e", &[Value::Float(150.0)]), "1.500000e+02");
        assert_eq!(fmt("%E", &[Value::Float(0.015)]), "1.500000E-02");
        assert_eq!(fmt("%g", &[Value::Float(0.5)]), "0.5");
    }

    #[test]
    fn test_quote_verb() {
        assert_eq!(fmt("%q", &[Value::string("a\"b")]), "\"a\\\"b\"");
        assert_eq!(fmt("%q", &[Value::Char('x')]), "'x'");
    }

    #[test]
    fn test_width_and_alignment() {
        assert_eq!(fmt("%5d", &[Value::Int(42)]), "   42");
        assert_eq!(fmt("%-5d|", &[Value::Int(42)]), "42   |");
        assert_eq!(fmt("%05d", &[Value::Int(-42)]), "-0042");
        assert_eq!(fmt("%+d", &[Value::Int(42)]), "+42");
        assert_eq!(fmt("%6.2f", &[Value::Float(3.14159)]), "  3.14");
    }

    #[test]
    fn test_star_and_indexed_args() {
        assert_eq!(fmt("%*d", &[Value::Int(5), Value::Int(7)]), "    7");
        assert_eq!(
            fmt("%[2]d %[1]d", &[Value::Int(1), Value::Int(2)]),
            "2 1"
        );
        assert_eq!(fmt("%.*f", &[Value::Int(1), Value::Float(2.75)]), "2.8");
    }

    #[test]
    fn test_string_precision_truncates() {
        assert_eq!(fmt("%.2s", &[Value::string("merhaba")]), "me");
    }

    #[test]
    fn test_bad_verb_markers() {
        assert_eq!(fmt("%d", &[Value::string("x")]), "%!d(string=x)");
        assert!(fmt("%d", &[]).contains("MISSING"));
    }

    #[test]
    fn test_containers_via_v() {
        let arr = Value::array(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(fmt("%v", &[arr]), "[1, 2]");
    }
}
