//! JSON walking and reference substitution.
//!
//! `walk` converts a host value to JSON-safe form, substituting shared
//! mutable values with `{"ref": oid}` records (plus a `"repr"` hint when
//! verbose OIDs are enabled). `deref` reverses the substitution on inbound
//! payloads, resolving OIDs back to live host objects through weak handles;
//! stale OIDs resolve to null.
//!
//! OIDs are allocated from a monotone counter through two tables: OID →
//! weak handle, and identity → OID. Entries for collected host objects are
//! pruned lazily, so the engine never pins host state.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::host::{HostValue, ObjKey, WeakHost};

/// Weak object-identity table backing `{"ref"}` substitution.
#[derive(Default)]
pub struct OidTable {
    oids: HashMap<u64, WeakHost>,
    obj_oids: HashMap<ObjKey, u64>,
    cur_oid: u64,
    /// Emit `"repr"` alongside `"ref"`.
    pub verbose: bool,
}

impl OidTable {
    pub fn new() -> Self {
        OidTable::default()
    }

    /// OID for a shared value, allocating on first sight. `None` for plain
    /// data. A previously assigned OID is reused only while its weak handle
    /// is still live; a dead entry whose address was reused is replaced.
    pub fn oid_for(&mut self, value: &HostValue) -> Option<u64> {
        let key = value.obj_key()?;
        if let Some(&oid) = self.obj_oids.get(&key) {
            if self.oids.get(&oid).is_some_and(WeakHost::is_alive) {
                return Some(oid);
            }
            self.obj_oids.remove(&key);
            self.oids.remove(&oid);
        }
        let weak = value.downgrade()?;
        self.cur_oid += 1;
        let oid = self.cur_oid;
        self.oids.insert(oid, weak);
        self.obj_oids.insert(key, oid);
        Some(oid)
    }

    /// Resolve an OID to its live host object, or `None` when stale.
    pub fn get(&self, oid: u64) -> Option<HostValue> {
        self.oids.get(&oid).and_then(WeakHost::upgrade)
    }

    /// Whether the OID maps to a live host object.
    pub fn is_live(&self, oid: u64) -> bool {
        self.oids.get(&oid).is_some_and(WeakHost::is_alive)
    }

    /// Drop entries whose host objects have been collected.
    pub fn prune(&mut self) {
        self.oids.retain(|_, weak| weak.is_alive());
        let oids = &self.oids;
        self.obj_oids.retain(|_, oid| oids.contains_key(oid));
    }

    /// Number of tracked objects, live or not yet pruned.
    pub fn len(&self) -> usize {
        self.oids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }
}

/// Convert a host value to JSON-safe form.
pub fn walk(table: &mut OidTable, value: &HostValue) -> JsonValue {
    match value {
        HostValue::Str(s) => JsonValue::String(s.clone()),
        HostValue::Bool(b) => JsonValue::Bool(*b),
        HostValue::Int(i) => json!(i),
        HostValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        HostValue::Null => JsonValue::Null,
        shared if shared.is_shared() => match table.oid_for(shared) {
            Some(oid) if table.verbose => json!({"ref": oid, "repr": shared.repr()}),
            Some(oid) => json!({"ref": oid}),
            None => JsonValue::Null,
        },
        HostValue::Tuple(items) => {
            JsonValue::Array(items.iter().map(|v| walk(table, v)).collect())
        }
        HostValue::Entries(entries) => {
            let all_string_keys = entries
                .iter()
                .all(|(k, _)| matches!(k, HostValue::Str(_)));
            if all_string_keys {
                let mut map = serde_json::Map::new();
                for (k, v) in entries.iter() {
                    if let HostValue::Str(key) = k {
                        map.insert(key.clone(), walk(table, v));
                    }
                }
                JsonValue::Object(map)
            } else {
                JsonValue::Array(
                    entries
                        .iter()
                        .map(|(k, v)| JsonValue::Array(vec![walk(table, k), walk(table, v)]))
                        .collect(),
                )
            }
        }
        // All variants are covered above; shared ones by the guard arm.
        _ => JsonValue::Null,
    }
}

/// Whether a JSON value is a `{"ref": oid}` record.
pub fn is_reference(value: &JsonValue) -> bool {
    reference_oid(value).is_some()
}

/// Extract the OID of a reference record.
pub fn reference_oid(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Object(map) => map.get("ref").and_then(JsonValue::as_u64),
        _ => None,
    }
}

/// Reverse reference substitution on an inbound JSON payload.
///
/// `{"ref": oid}` records resolve to the live host object; stale OIDs
/// resolve to null. Everything else converts to plain host data, so walking
/// the result reproduces the original JSON.
pub fn deref(table: &OidTable, value: &JsonValue) -> HostValue {
    match value {
        JsonValue::Null => HostValue::Null,
        JsonValue::Bool(b) => HostValue::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                HostValue::Int(i)
            } else {
                HostValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => HostValue::Str(s.clone()),
        JsonValue::Array(items) => {
            HostValue::Tuple(Arc::new(items.iter().map(|v| deref(table, v)).collect()))
        }
        JsonValue::Object(map) => {
            if let Some(oid) = reference_oid(value) {
                return table.get(oid).unwrap_or(HostValue::Null);
            }
            HostValue::Entries(Arc::new(
                map.iter()
                    .map(|(k, v)| (HostValue::Str(k.clone()), deref(table, v)))
                    .collect(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::is_same;

    #[test]
    fn primitives_walk_to_themselves() {
        let mut table = OidTable::new();
        assert_eq!(walk(&mut table, &HostValue::Str("x".to_string())), json!("x"));
        assert_eq!(walk(&mut table, &HostValue::Int(3)), json!(3));
        assert_eq!(walk(&mut table, &HostValue::Bool(true)), json!(true));
        assert_eq!(walk(&mut table, &HostValue::Null), JsonValue::Null);
        assert!(table.is_empty());
    }

    #[test]
    fn shared_values_walk_to_refs() {
        let mut table = OidTable::new();
        let list = HostValue::list(vec![HostValue::Int(1)]);

        let first = walk(&mut table, &list);
        let second = walk(&mut table, &list);
        assert_eq!(first, second);
        assert_eq!(reference_oid(&first), Some(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_objects_get_distinct_oids() {
        let mut table = OidTable::new();
        let a = HostValue::list(vec![]);
        let b = HostValue::list(vec![]);
        let ja = walk(&mut table, &a);
        let jb = walk(&mut table, &b);
        assert_ne!(reference_oid(&ja), reference_oid(&jb));
    }

    #[test]
    fn verbose_refs_carry_repr() {
        let mut table = OidTable::new();
        table.verbose = true;
        let cell = HostValue::cell(None);
        let j = walk(&mut table, &cell);
        assert_eq!(j.get("repr"), Some(&json!("cell()")));
        assert!(reference_oid(&j).is_some());
    }

    #[test]
    fn entries_with_string_keys_walk_to_object() {
        let mut table = OidTable::new();
        let v = HostValue::Entries(Arc::new(vec![
            (HostValue::Str("b".to_string()), HostValue::Int(2)),
            (HostValue::Str("a".to_string()), HostValue::Int(1)),
        ]));
        // Insertion order is preserved in the JSON object.
        assert_eq!(
            serde_json::to_string(&walk(&mut table, &v)).unwrap(),
            r#"{"b":2,"a":1}"#
        );
    }

    #[test]
    fn entries_with_other_keys_walk_to_pairs() {
        let mut table = OidTable::new();
        let v = HostValue::Entries(Arc::new(vec![(HostValue::Int(1), HostValue::Str("x".to_string()))]));
        assert_eq!(walk(&mut table, &v), json!([[1, "x"]]));
    }

    #[test]
    fn deref_resolves_live_refs_to_same_object() {
        let mut table = OidTable::new();
        let list = HostValue::list(vec![HostValue::Int(1)]);
        let j = walk(&mut table, &list);

        let back = deref(&table, &j);
        assert_eq!(back.obj_key(), list.obj_key());
    }

    #[test]
    fn deref_stale_ref_is_null() {
        let mut table = OidTable::new();
        let j = {
            let list = HostValue::list(vec![]);
            walk(&mut table, &list)
        };
        assert!(matches!(deref(&table, &j), HostValue::Null));
        assert!(!table.is_live(reference_oid(&j).unwrap_or(0)));
    }

    #[test]
    fn walk_deref_roundtrip() {
        // walk(deref(x)) == walk(x) for reference-bearing JSON with live OIDs.
        let mut table = OidTable::new();
        let cell = HostValue::cell(Some(HostValue::Int(9)));
        let r = walk(&mut table, &cell);
        let x = json!({"plain": 1, "nested": {"r": r}, "items": [1, "two", null]});

        let host = deref(&table, &x);
        assert_eq!(walk(&mut table, &host), x);
        let _keep = cell;
    }

    #[test]
    fn deref_plain_data_is_structural() {
        let table = OidTable::new();
        let x = json!({"a": [1, 2.5], "b": "s"});
        let host = deref(&table, &x);
        assert!(is_same(
            &host,
            &HostValue::Entries(Arc::new(vec![
                (
                    HostValue::Str("a".to_string()),
                    HostValue::Tuple(Arc::new(vec![HostValue::Int(1), HostValue::Float(2.5)]))
                ),
                (HostValue::Str("b".to_string()), HostValue::Str("s".to_string())),
            ]))
        ));
    }

    #[test]
    fn prune_drops_dead_entries() {
        let mut table = OidTable::new();
        {
            let temp = HostValue::list(vec![]);
            walk(&mut table, &temp);
        }
        let keep = HostValue::list(vec![]);
        walk(&mut table, &keep);

        assert_eq!(table.len(), 2);
        table.prune();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn dead_identity_reuse_allocates_fresh_oid() {
        let mut table = OidTable::new();
        let a = HostValue::list(vec![]);
        let ja = walk(&mut table, &a);
        drop(a);

        // A new allocation may land on the same address; even then the
        // stale table entry must not be reused for it.
        let b = HostValue::list(vec![]);
        let jb = walk(&mut table, &b);
        assert_ne!(reference_oid(&ja), reference_oid(&jb));
    }
}
