//! The serialized node form.
//!
//! ```text
//! [-]<permission>[=true|=false][(<key>=<value>[,<key>=<value>]*)][$<expiry-unix-seconds>]
//! ```
//!
//! Serialization never emits the `=` value marker: a false value is written
//! as the leading `-`. The characters `\ ( ) = , $` are backslash-escaped
//! wherever they occur inside the permission, a key or a value.

use super::{MutableContextSet, Node};
use crate::error::{PermsError, Result};
use chrono::{TimeZone, Utc};

const SPECIAL: [char; 6] = ['\\', '(', ')', '=', ',', '$'];

/// Escape the special characters of the serialized form.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Canonical form of a serialized node.
pub fn normalize(input: &str) -> Result<String> {
    parse(input).map(|node| serialize(&node))
}

pub(crate) fn serialize(node: &Node) -> String {
    let mut out = String::with_capacity(node.permission.len() + 8);
    if !node.value {
        out.push('-');
    }
    out.push_str(&escape(&node.permission));

    if !node.contexts.is_empty() {
        out.push('(');
        for (i, (key, value)) in node.contexts.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&escape(key));
            out.push('=');
            out.push_str(&escape(value));
        }
        out.push(')');
    }

    if let Some(expiry) = node.expiry {
        out.push('$');
        out.push_str(&expiry.timestamp().to_string());
    }
    out
}

pub(crate) fn parse(input: &str) -> Result<Node> {
    let mut cursor = Cursor::new(input);

    let negated = cursor.eat('-');
    let permission = cursor.segment(&['=', '(', '$'])?;
    if permission.trim().is_empty() {
        return Err(PermsError::malformed_node(input, "empty permission"));
    }
    if permission.starts_with('-') {
        return Err(PermsError::malformed_node(input, "repeated negation"));
    }

    let mut value = !negated;
    if cursor.eat('=') {
        if negated {
            return Err(PermsError::malformed_node(
                input,
                "negation combined with an explicit value",
            ));
        }
        let marker = cursor.segment(&['(', '$'])?;
        value = match marker.to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => {
                return Err(PermsError::malformed_node(
                    input,
                    format!("invalid value marker '{}'", marker),
                ))
            }
        };
    }

    let mut contexts = MutableContextSet::new();
    if cursor.eat('(') {
        loop {
            let key = cursor.segment(&['=', ',', ')'])?;
            if !cursor.eat('=') {
                return Err(PermsError::malformed_node(input, "context entry without '='"));
            }
            let val = cursor.segment(&[',', ')'])?;
            if key.trim().is_empty() || val.trim().is_empty() {
                return Err(PermsError::malformed_node(input, "empty context key or value"));
            }
            contexts.add(&key, &val);

            if cursor.eat(',') {
                continue;
            }
            if cursor.eat(')') {
                break;
            }
            return Err(PermsError::malformed_node(input, "unterminated context block"));
        }
    }

    let mut builder = Node::builder(permission)
        .value(value)
        .with_contexts(&contexts.build());

    if cursor.eat('$') {
        let digits = cursor.rest();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(PermsError::malformed_node(input, "expiry is not a unix timestamp"));
        }
        let seconds: i64 = digits
            .parse()
            .map_err(|_| PermsError::malformed_node(input, "expiry out of range"))?;
        let at = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| PermsError::malformed_node(input, "expiry out of range"))?;
        builder = builder.expiry(at);
    }

    if !cursor.at_end() {
        return Err(PermsError::malformed_node(input, "trailing characters"));
    }

    Ok(builder.build())
}

/// Character cursor over the input that understands escapes.
struct Cursor<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.get(self.pos) == Some(&expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn rest(&mut self) -> String {
        let rest: String = self.chars[self.pos..].iter().collect();
        self.pos = self.chars.len();
        rest
    }

    /// Read and unescape up to the next unescaped stop character.
    ///
    /// Any other unescaped special character is an error.
    fn segment(&mut self, stops: &[char]) -> Result<String> {
        let mut out = String::new();
        while let Some(&c) = self.chars.get(self.pos) {
            if c == '\\' {
                match self.chars.get(self.pos + 1) {
                    Some(&escaped) => {
                        out.push(escaped);
                        self.pos += 2;
                        continue;
                    }
                    None => return Err(PermsError::malformed_node(self.input, "dangling escape")),
                }
            }
            if stops.contains(&c) {
                break;
            }
            if SPECIAL.contains(&c) {
                return Err(PermsError::malformed_node(
                    self.input,
                    format!("unexpected '{}' at position {}", c, self.pos),
                ));
            }
            out.push(c);
            self.pos += 1;
        }
        Ok(out)
    }
}
