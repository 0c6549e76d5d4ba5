//! Client-side literal escaping and `?` interpolation for the text protocol.

use std::fmt::Write as _;

use sqlwire_core::{Error, Value};

use crate::error::config_error;

/// Quote and escape a string literal.
///
/// With `no_backslash_escapes` (the server's `NO_BACKSLASH_ESCAPES` mode)
/// only quotes are doubled; otherwise control characters and backslashes
/// get backslash escapes.
pub fn escape_string(s: &str, no_backslash_escapes: bool) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('\'');
    if no_backslash_escapes {
        for ch in s.chars() {
            if ch == '\'' {
                result.push('\'');
            }
            result.push(ch);
        }
    } else {
        for ch in s.chars() {
            match ch {
                '\'' => result.push_str("\\'"),
                '"' => result.push_str("\\\""),
                '\\' => result.push_str("\\\\"),
                '\0' => result.push_str("\\0"),
                '\n' => result.push_str("\\n"),
                '\r' => result.push_str("\\r"),
                '\x1a' => result.push_str("\\Z"),
                _ => result.push(ch),
            }
        }
    }
    result.push('\'');
    result
}

/// `X'..'` hex literal.
pub fn escape_bytes(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2 + 3);
    result.push_str("X'");
    for byte in data {
        let _ = write!(result, "{byte:02X}");
    }
    result.push('\'');
    result
}

/// Quote an identifier with backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn format_float(f: f64) -> String {
    if f.is_finite() {
        let s = f.to_string();
        // keep it a float literal so `1` does not round-trip as an integer
        if s.contains(['.', 'e', 'E']) {
            s
        } else {
            format!("{s}e0")
        }
    } else {
        "NULL".to_string()
    }
}

/// Render a value as a SQL literal.
pub fn format_value_for_sql(value: &Value, no_backslash_escapes: bool) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => format_float(f64::from(*f)),
        Value::Double(f) => format_float(*f),
        Value::Decimal(s) => escape_string(s, no_backslash_escapes),
        Value::Text(s) => escape_string(s, no_backslash_escapes),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => escape_string(&j.to_string(), no_backslash_escapes),
        Value::Date(d) => format!("'{d}'"),
        Value::DateTime(dt) => format!("'{dt}'"),
        Value::Time(t) => format!("'{t}'"),
    }
}

/// Replace each `?` outside quoted strings, identifiers and comments with
/// the next parameter rendered as a literal.
///
/// The number of placeholders must match `params.len()`.
pub fn interpolate_params(
    sql: &str,
    params: &[Value],
    no_backslash_escapes: bool,
) -> Result<String, Error> {
    if params.is_empty() && !sql.contains('?') {
        return Ok(sql.to_string());
    }

    let mut result = String::with_capacity(sql.len() + params.len() * 16);
    let mut chars = sql.chars().peekable();
    let mut next_param = params.iter();
    let mut used = 0usize;

    while let Some(ch) = chars.next() {
        match ch {
            '?' => {
                let value = next_param.next().ok_or_else(|| {
                    config_error(format!(
                        "Not enough parameters: statement has more than {} placeholders",
                        params.len()
                    ))
                })?;
                used += 1;
                result.push_str(&format_value_for_sql(value, no_backslash_escapes));
            }
            '\'' | '"' | '`' => {
                result.push(ch);
                let quote = ch;
                while let Some(c) = chars.next() {
                    result.push(c);
                    if c == '\\' && quote != '`' && !no_backslash_escapes {
                        if let Some(escaped) = chars.next() {
                            result.push(escaped);
                        }
                    } else if c == quote {
                        if chars.peek() == Some(&quote) {
                            result.push(quote);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                result.push(ch);
                copy_line_comment(&mut chars, &mut result);
            }
            '#' => {
                result.push(ch);
                copy_line_comment(&mut chars, &mut result);
            }
            '/' if chars.peek() == Some(&'*') => {
                result.push(ch);
                let mut prev = '\0';
                for c in chars.by_ref() {
                    result.push(c);
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            _ => result.push(ch),
        }
    }

    if used != params.len() {
        return Err(config_error(format!(
            "Too many parameters: statement has {used} placeholders, {} given",
            params.len()
        )));
    }
    Ok(result)
}

fn copy_line_comment(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, out: &mut String) {
    for c in chars.by_ref() {
        out.push(c);
        if c == '\n' {
            break;
        }
    }
}
