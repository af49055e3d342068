//! Variable declaration names.
//!
//! A declaration string is `head ( "?" meta-list )?`. The head is an
//! integer, or an identifier with optional dotted qualification, with a
//! trailing `()` marking a callable. The meta-list is
//! `key ("=" value)? ("," ...)*` with `\,`-escapable values.
//!
//! Examples: `name`, `number?path=number`, `Main.counter`, `reset()`,
//! `3?type=int`.

use std::collections::BTreeMap;

use crate::error::{EngineError, Result};

/// A parsed variable declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullName {
    /// The original declaration string.
    pub full: String,
    /// Short symbol: the head without qualifier, parens, or metadata.
    pub name: String,
    /// Module qualifier for `module.name` heads.
    pub qualifier: Option<String>,
    /// Integer head, when the declaration addresses an index.
    pub index: Option<usize>,
    /// Whether the head carried a trailing `()`.
    pub callable: bool,
    /// Declaration metadata. Reserved keys: `path`, `type`, `level`,
    /// `create`.
    pub metadata: BTreeMap<String, String>,
}

impl FullName {
    /// Parse a declaration string.
    pub fn parse(s: &str) -> Result<FullName> {
        if s.is_empty() {
            return Err(EngineError::path(s, "empty variable name"));
        }

        let (head, meta) = match s.split_once('?') {
            Some((h, m)) => (h, Some(m)),
            None => (s, None),
        };

        let (head, callable) = match head.strip_suffix("()") {
            Some(stripped) => (stripped, true),
            None => (head, false),
        };
        if head.is_empty() {
            return Err(EngineError::path(s, "empty head"));
        }

        let mut qualifier = None;
        let mut index = None;
        let name;

        if head.chars().all(|c| c.is_ascii_digit()) {
            index = Some(head.parse::<usize>().map_err(|e| {
                EngineError::path(s, format!("integer head out of range: {}", e))
            })?);
            name = head.to_string();
        } else {
            let segments: Vec<&str> = head.split('.').collect();
            for segment in &segments {
                validate_ident(segment, s)?;
            }
            name = segments[segments.len() - 1].to_string();
            if segments.len() > 1 {
                qualifier = Some(segments[..segments.len() - 1].join("."));
            }
        }

        let metadata = match meta {
            Some(m) => parse_meta(m, s)?,
            None => BTreeMap::new(),
        };

        Ok(FullName {
            full: s.to_string(),
            name,
            qualifier,
            index,
            callable,
            metadata,
        })
    }
}

/// Validate an identifier component (UAX#31, leading underscore allowed).
pub(crate) fn validate_ident(component: &str, context: &str) -> Result<()> {
    if component.is_empty() {
        return Err(EngineError::path(context, "empty identifier"));
    }
    let mut chars = component.chars();
    let first = chars.next().unwrap_or('\0');
    let valid_start = unicode_ident::is_xid_start(first) || first == '_';
    if !valid_start {
        return Err(EngineError::path(
            context,
            format!("identifier '{}' must start with a letter or underscore", component),
        ));
    }
    for c in chars {
        if !unicode_ident::is_xid_continue(c) {
            return Err(EngineError::path(
                context,
                format!("invalid character '{}' in identifier '{}'", c, component),
            ));
        }
    }
    Ok(())
}

/// Parse `key ("=" value)? ("," ...)*` with `\`-escapes in values.
fn parse_meta(meta: &str, context: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for item in split_unescaped(meta) {
        if item.is_empty() {
            continue;
        }
        let (key, value) = match item.split_once('=') {
            Some((k, v)) => (k, unescape(v)),
            None => (item.as_str(), String::new()),
        };
        validate_ident(key, context)?;
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

/// Split on commas that are not preceded by a backslash.
fn split_unescaped(s: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ',' {
            items.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    items.push(current);
    items
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    if escaped {
        out.push('\\');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name() {
        let n = FullName::parse("name").unwrap();
        assert_eq!(n.name, "name");
        assert!(n.qualifier.is_none());
        assert!(n.index.is_none());
        assert!(!n.callable);
        assert!(n.metadata.is_empty());
    }

    #[test]
    fn name_with_metadata() {
        let n = FullName::parse("number?path=number").unwrap();
        assert_eq!(n.name, "number");
        assert_eq!(n.metadata.get("path").map(String::as_str), Some("number"));
    }

    #[test]
    fn flag_metadata_has_empty_value() {
        let n = FullName::parse("x?create").unwrap();
        assert_eq!(n.metadata.get("create").map(String::as_str), Some(""));
    }

    #[test]
    fn multiple_metadata_entries() {
        let n = FullName::parse("x?path=a.b,type=int,level=2").unwrap();
        assert_eq!(n.metadata.len(), 3);
        assert_eq!(n.metadata.get("type").map(String::as_str), Some("int"));
        assert_eq!(n.metadata.get("level").map(String::as_str), Some("2"));
    }

    #[test]
    fn escaped_comma_in_value() {
        let n = FullName::parse(r"x?label=a\,b,type=string").unwrap();
        assert_eq!(n.metadata.get("label").map(String::as_str), Some("a,b"));
        assert_eq!(n.metadata.get("type").map(String::as_str), Some("string"));
    }

    #[test]
    fn callable_head() {
        let n = FullName::parse("reset()").unwrap();
        assert_eq!(n.name, "reset");
        assert!(n.callable);
    }

    #[test]
    fn integer_head() {
        let n = FullName::parse("3?type=int").unwrap();
        assert_eq!(n.index, Some(3));
        assert_eq!(n.name, "3");
    }

    #[test]
    fn qualified_head() {
        let n = FullName::parse("Main.counter").unwrap();
        assert_eq!(n.name, "counter");
        assert_eq!(n.qualifier.as_deref(), Some("Main"));
    }

    #[test]
    fn invalid_heads_rejected() {
        assert!(FullName::parse("").is_err());
        assert!(FullName::parse("?x=1").is_err());
        assert!(FullName::parse("a b").is_err());
        assert!(FullName::parse("1abc").is_err());
    }

    #[test]
    fn unicode_names_allowed() {
        let n = FullName::parse("名前?path=名前").unwrap();
        assert_eq!(n.name, "名前");
    }
}
