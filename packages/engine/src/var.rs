//! Variables: the runtime objects bound to host values.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as JsonValue;

use crate::host::HostValue;
use crate::name::FullName;
use crate::path::PathStep;

/// Stable variable id, unique within an environment. Ids are monotone and
/// never reused within a connection lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub u64);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A variable bound to a host value via a path.
#[derive(Debug, Clone)]
pub struct Var {
    pub id: VarId,
    pub parent: Option<VarId>,
    /// Short symbol: the declaration head.
    pub name: String,
    /// Original declaration string, metadata included.
    pub full_name: String,
    /// Declaration metadata. Reserved keys: `path`, `type`, `level`,
    /// `create`.
    pub metadata: BTreeMap<String, String>,
    /// Compiled path, walked from the parent's value.
    pub path: Vec<PathStep>,
    /// Live value from the last successful refresh or set.
    pub value: HostValue,
    /// Detached copy used for change detection.
    pub internal_value: HostValue,
    /// JSON form of the internal value.
    pub json_value: JsonValue,
    pub readable: bool,
    pub writeable: bool,
    pub action: bool,
    /// Participates in refresh passes.
    pub active: bool,
    /// Refresh priority; lower is outer.
    pub level: i64,
    pub children: BTreeMap<String, VarId>,
    pub error_count: u64,
    pub refresh_error: Option<String>,
}

impl Var {
    /// Build a variable from a parsed declaration.
    ///
    /// The path defaults to a single field step named after the head;
    /// `path` metadata replaces it, a callable head compiles to a call
    /// step, an integer head to an index step, and a qualified head to an
    /// ambient-binding step.
    pub(crate) fn from_decl(
        id: VarId,
        parent: Option<VarId>,
        decl: &FullName,
        path: Vec<PathStep>,
        parent_level: Option<i64>,
    ) -> Var {
        let action = decl.callable || decl.metadata.contains_key("action");
        let readable = match decl.metadata.get("readable").map(String::as_str) {
            Some("false") => false,
            Some(_) => true,
            None => !action,
        };
        let writeable = !matches!(
            decl.metadata.get("writeable").map(String::as_str),
            Some("false")
        );
        let level = decl
            .metadata
            .get("level")
            .and_then(|l| l.parse::<i64>().ok())
            .unwrap_or_else(|| parent_level.map(|l| l + 1).unwrap_or(0));

        Var {
            id,
            parent,
            name: decl.name.clone(),
            full_name: decl.full.clone(),
            metadata: decl.metadata.clone(),
            path,
            value: HostValue::Null,
            internal_value: HostValue::Null,
            json_value: JsonValue::Null,
            readable,
            writeable,
            action,
            active: true,
            level,
            children: BTreeMap::new(),
            error_count: 0,
            refresh_error: None,
        }
    }

    /// Whether `..` appears anywhere in the path; actions prefer the
    /// parent-bearing arities when it does.
    pub fn uses_up(&self) -> bool {
        self.path.iter().any(|s| matches!(s, PathStep::Up))
    }
}
