//! The primary mcporter config file.
//!
//! JSON (UTF-8) with two top-level keys: a `mcpServers` map of raw entries
//! and an optional `imports` list naming foreign editor configs to merge.
//! `.jsonc` files (and, tolerantly, `.json` files) may carry `//` and
//! `/* */` comments, which are stripped before parsing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use mcporter_domain::RawEntry;

/// Parsed shape of the primary config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrimaryConfig {
    pub mcp_servers: BTreeMap<String, RawEntry>,
    /// `None` — use the default import order. `Some([])` — imports are
    /// disabled. Otherwise the declared order, with unmentioned default
    /// kinds appended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imports: Option<Vec<String>>,
}

/// Strip `//` line comments and `/* */` block comments outside of strings.
///
/// Comment bytes are replaced with spaces (newlines preserved) so that
/// serde_json error positions still line up with the file.
pub fn strip_jsonc(input: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Str,
        StrEscape,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Code;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '"' => {
                    state = State::Str;
                    out.push(c);
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                    out.push_str("  ");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                    out.push_str("  ");
                }
                _ => out.push(c),
            },
            State::Str => {
                out.push(c);
                match c {
                    '\\' => state = State::StrEscape,
                    '"' => state = State::Code,
                    _ => {}
                }
            }
            State::StrEscape => {
                out.push(c);
                state = State::Str;
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                    out.push_str("  ");
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
        }
    }

    out
}
