//! Placeholder resolution for header and environment templates.
//!
//! Three forms are recognized in any string:
//! - `${NAME}` — fails with [`Error::MissingEnvVar`] when `NAME` is unset.
//! - `${NAME:-default}` — the variable when set and non-empty, otherwise the
//!   literal default (which may be empty).
//! - `$env:NAME` — raw read; unset yields an empty string (legacy shape).
//!
//! `$$` produces a literal `$`. Resolution is a single pass: substituted
//! values are never rescanned. The resolver is pure over an injected lookup;
//! its only ambient input is the process environment at call time.

use crate::error::{Error, Result};

/// Resolve placeholders against the process environment.
pub fn resolve(template: &str) -> Result<String> {
    resolve_with(template, |name| std::env::var(name).ok())
}

/// Resolve placeholders against an arbitrary lookup.
pub fn resolve_with<F>(template: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            let start = i;
            while i < bytes.len() && bytes[i] != b'$' {
                i += 1;
            }
            out.push_str(&template[start..i]);
            continue;
        }

        // bytes[i] == '$'
        if bytes.get(i + 1) == Some(&b'$') {
            out.push('$');
            i += 2;
        } else if bytes.get(i + 1) == Some(&b'{') {
            match template[i + 2..].find('}') {
                Some(rel) => {
                    let token = &template[i + 2..i + 2 + rel];
                    if token.is_empty() {
                        // `${}` carries no variable name; keep it literal.
                        out.push_str("${}");
                    } else {
                        out.push_str(&substitute(token, &lookup)?);
                    }
                    i += 2 + rel + 1;
                }
                None => {
                    // Unterminated `${`; keep the rest literal.
                    out.push_str(&template[i..]);
                    break;
                }
            }
        } else if template[i + 1..].starts_with("env:") {
            let start = i + 1 + 4;
            let mut end = start;
            while end < bytes.len() && (bytes[end] == b'_' || bytes[end].is_ascii_alphanumeric()) {
                end += 1;
            }
            if end == start {
                out.push_str("$env:");
            } else {
                let name = &template[start..end];
                out.push_str(&lookup(name).unwrap_or_default());
            }
            i = end.max(start);
        } else {
            out.push('$');
            i += 1;
        }
    }

    Ok(out)
}

fn substitute<F>(token: &str, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match token.split_once(":-") {
        Some((name, default)) => match lookup(name) {
            Some(value) if !value.is_empty() => Ok(value),
            // Unset and set-to-empty both take the literal default.
            _ => Ok(default.to_string()),
        },
        None => lookup(token).ok_or_else(|| Error::MissingEnvVar(token.to_string())),
    }
}
