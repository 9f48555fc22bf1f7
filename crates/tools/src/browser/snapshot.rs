//! Structured accessibility snapshot.
//!
//! The inspection server returns the page's accessibility tree as indented
//! text, one node per line:
//!
//! ```text
//! ## Latest page snapshot
//! uid=1_0 RootWebArea "Example Domain" url="https://example.com/"
//!   uid=1_1 heading "Example Domain" level="1"
//!   uid=1_2 link "More information..." focusable
//! ```
//!
//! Each line becomes a [`SnapshotNode`] with its depth preserved, so callers
//! can rebuild the tree or address elements by `uid`.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotNode {
    pub uid: String,
    pub role: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub depth: usize,
    /// `key="value"` attributes; bare flags map to `"true"`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub nodes: Vec<SnapshotNode>,
    /// The server's text, kept for callers that want to show it verbatim.
    pub text: String,
}

impl Snapshot {
    /// Parse the server's reply. Non-string replies are rendered as JSON text
    /// and yield no nodes.
    pub fn from_tool_output(output: &Value) -> Self {
        match output {
            Value::String(text) => Self::parse(text),
            other => Self {
                nodes: Vec::new(),
                text: other.to_string(),
            },
        }
    }

    pub fn parse(text: &str) -> Self {
        let nodes = text.lines().filter_map(parse_line).collect();
        Self {
            nodes,
            text: text.to_string(),
        }
    }
}

fn parse_line(line: &str) -> Option<SnapshotNode> {
    let trimmed = line.trim_start();
    let indent = line.len() - trimmed.len();
    let rest = trimmed.strip_prefix("uid=")?;

    let (uid, rest) = split_token(rest);
    if uid.is_empty() {
        return None;
    }
    let (role, rest) = split_token(rest);
    let mut rest = rest.trim_start();

    let mut name = String::new();
    if rest.starts_with('"') {
        let (quoted, tail) = take_quoted(rest);
        name = quoted;
        rest = tail;
    }

    let mut attributes = BTreeMap::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let key_end = rest
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(rest.len());
        let key = rest[..key_end].to_string();
        rest = &rest[key_end..];
        if let Some(after_eq) = rest.strip_prefix('=') {
            if after_eq.starts_with('"') {
                let (value, tail) = take_quoted(after_eq);
                attributes.insert(key, value);
                rest = tail;
            } else {
                let (value, tail) = split_token(after_eq);
                attributes.insert(key, value.to_string());
                rest = tail;
            }
        } else if !key.is_empty() {
            attributes.insert(key, "true".to_string());
        }
    }

    Some(SnapshotNode {
        uid: uid.to_string(),
        role: role.to_string(),
        name,
        depth: indent / 2,
        attributes,
    })
}

fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

/// Read a `"..."` string with backslash escapes; returns the unescaped text
/// and the remainder after the closing quote.
fn take_quoted(s: &str) -> (String, &str) {
    let mut out = String::new();
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return (out, &s[i + 1..]);
        } else {
            out.push(c);
        }
    }
    (out, "")
}
