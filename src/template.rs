//! Path and command templates with `{name}` placeholders.
//!
//! A placeholder is a left brace, one or more non-brace characters, and a
//! right brace. Braces are not escapable; anything that does not form a
//! placeholder is kept verbatim.

use std::collections::BTreeSet;
use std::fmt;

use crate::params::Binding;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template, ready to be rendered under any number of bindings.
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses a template. This never fails: malformed braces are literals.
    pub fn parse(raw: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;

        while let Some(open) = rest.find('{') {
            let tail = &rest[open + 1..];
            match tail.find(['{', '}']) {
                // A well-formed, non-empty placeholder.
                Some(close) if tail.as_bytes()[close] == b'}' && close > 0 => {
                    literal.push_str(&rest[..open]);
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(tail[..close].to_string()));
                    rest = &tail[close + 1..];
                }
                // `{}`, `{...{` or an unclosed brace; emit up to and
                // including the brace and rescan from the next character.
                _ => {
                    literal.push_str(&rest[..=open]);
                    rest = tail;
                }
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            raw: raw.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The set of parameter names referenced by this template.
    pub fn parameters(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Substitutes every placeholder with its bound value. Parameters bound
    /// but not referenced are ignored; referenced but unbound parameters are
    /// returned as the error set.
    pub fn render(&self, binding: &Binding) -> Result<String, Vec<String>> {
        let missing: Vec<String> = self
            .parameters()
            .into_iter()
            .filter(|name| binding.get(name).is_none())
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }

        let mut acc = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => acc.push_str(text),
                Segment::Placeholder(name) => match binding.get(name) {
                    Some(value) => acc.push_str(value),
                    None => unreachable!("missing parameters are rejected above"),
                },
            }
        }
        Ok(acc)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
