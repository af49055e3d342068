//! Variable paths.
//!
//! A path string addresses a value reachable from a variable's parent:
//! components separated by `.`, `[n]` for 1-based indices, `name()` for
//! callables, `@name` for a root lookup, and runs of dots for up-traversal
//! (each dot beyond the separator ascends one level).
//!
//! A path beginning with a `module.name` pair compiles to a
//! `(module, name)` component referencing an ambient binding, the same
//! component a qualified declaration head produces (see [`crate::name`]).
//! Resolution prefers the ambient binding and falls back to ordinary field
//! traversal when no root of that name exists.

use std::fmt;

use crate::error::{EngineError, Result};
use crate::name::validate_ident;

/// One compiled path component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    /// Field lookup on a map-like or structured value.
    Field(String),
    /// 1-based index into a sequence.
    Index(usize),
    /// Ambient root lookup: `@name`.
    Root(String),
    /// Module-qualified ambient binding.
    Qualified(String, String),
    /// Ascend one level in the traversal.
    Up,
    /// Callable element, used as getter, setter, or action.
    Call(String),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStep::Field(name) => write!(f, "{}", name),
            PathStep::Index(i) => write!(f, "[{}]", i),
            PathStep::Root(name) => write!(f, "@{}", name),
            PathStep::Qualified(module, name) => write!(f, "{}.{}", module, name),
            PathStep::Up => write!(f, ".."),
            PathStep::Call(name) => write!(f, "{}()", name),
        }
    }
}

/// Render a compiled path back to its string form.
pub fn path_to_string(steps: &[PathStep]) -> String {
    let mut out = String::new();
    for step in steps {
        match step {
            PathStep::Index(_) | PathStep::Up => {}
            _ if !out.is_empty() => out.push('.'),
            _ => {}
        }
        out.push_str(&step.to_string());
    }
    out
}

/// Compile a path string into its component sequence.
pub fn parse_path(s: &str) -> Result<Vec<PathStep>> {
    let mut steps = Vec::new();
    let mut chars = s.chars().peekable();

    // A leading `module.name` pair is a path-string-level construct like
    // `@name`: it compiles to a qualified ambient binding. A single dot
    // only, and neither side may be a call.
    if chars.peek().is_some_and(|&c| c != '@' && c != '.' && c != '[') {
        let mut ahead = chars.clone();
        let module = take_ident(&mut ahead);
        if !module.is_empty() && ahead.peek() == Some(&'.') {
            ahead.next();
            if ahead.peek() != Some(&'.') {
                let name = take_ident(&mut ahead);
                if !name.is_empty() && ahead.peek() != Some(&'(') {
                    validate_ident(&module, s)?;
                    validate_ident(&name, s)?;
                    steps.push(PathStep::Qualified(module, name));
                    chars = ahead;
                }
            }
        }
    }

    while let Some(&c) = chars.peek() {
        match c {
            '.' => {
                // A run of k dots is a separator plus k-1 up-traversals.
                let mut dots = 0;
                while chars.peek() == Some(&'.') {
                    chars.next();
                    dots += 1;
                }
                for _ in 1..dots {
                    steps.push(PathStep::Up);
                }
            }
            '[' => {
                chars.next();
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d == ']' {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                if chars.next() != Some(']') {
                    return Err(EngineError::path(s, "unterminated index"));
                }
                let index: usize = digits
                    .parse()
                    .map_err(|_| EngineError::path(s, format!("invalid index '{}'", digits)))?;
                if index == 0 {
                    return Err(EngineError::path(s, "indices are 1-based"));
                }
                steps.push(PathStep::Index(index));
            }
            '@' => {
                chars.next();
                let name = take_ident(&mut chars);
                validate_ident(&name, s)?;
                steps.push(PathStep::Root(name));
            }
            _ => {
                let name = take_ident(&mut chars);
                if name.is_empty() {
                    return Err(EngineError::path(
                        s,
                        format!("unexpected character '{}'", c),
                    ));
                }
                validate_ident(&name, s)?;
                if chars.peek() == Some(&'(') {
                    chars.next();
                    if chars.next() != Some(')') {
                        return Err(EngineError::path(s, "malformed call, expected '()'"));
                    }
                    steps.push(PathStep::Call(name));
                } else {
                    steps.push(PathStep::Field(name));
                }
            }
        }
    }

    Ok(steps)
}

fn take_ident(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if c == '.' || c == '[' || c == '(' || c == ')' || c == '@' || c == ']' {
            break;
        }
        out.push(c);
        chars.next();
    }
    out
}
