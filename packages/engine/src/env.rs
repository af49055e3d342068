//! The variable environment: registry, traversal, and refresh.
//!
//! Variables are registered by declaration string, linked into a graph
//! under their parents, and bound to host state through compiled paths.
//! Refreshing a variable recomputes its value from the host, caches the
//! JSON form, and records a change when the new value differs structurally
//! from the previous one.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value as JsonValue;

use crate::error::{EngineError, Result};
use crate::host::{is_same, Arity, CallCtx, HostFn, HostValue, Roots};
use crate::name::FullName;
use crate::path::{parse_path, PathStep};
use crate::var::{Var, VarId};
use crate::walk::{walk, OidTable};

/// Registry of variables and the object-identity table.
pub struct VarEnv {
    vars: BTreeMap<VarId, Var>,
    by_name: HashMap<String, VarId>,
    by_full_name: HashMap<String, VarId>,
    /// Ambient values referenced by `@name` and qualified components.
    pub roots: Roots,
    /// Weak object-identity table for `{"ref"}` substitution.
    pub oids: OidTable,
    /// Ids changed during the current refresh pass.
    pub changed: BTreeSet<VarId>,
    /// Last refresh error per variable.
    pub errors: BTreeMap<VarId, String>,
    cur_vid: u64,
    connection: String,
}

impl VarEnv {
    pub fn new(connection: impl Into<String>, roots: Roots) -> Self {
        VarEnv {
            vars: BTreeMap::new(),
            by_name: HashMap::new(),
            by_full_name: HashMap::new(),
            roots,
            oids: OidTable::new(),
            changed: BTreeSet::new(),
            errors: BTreeMap::new(),
            cur_vid: 0,
            connection: connection.into(),
        }
    }

    /// Context handed to host callables.
    pub fn call_ctx(&self) -> CallCtx {
        CallCtx {
            connection: self.connection.clone(),
            roots: self.roots.clone(),
        }
    }

    pub fn var(&self, id: VarId) -> Option<&Var> {
        self.vars.get(&id)
    }

    pub(crate) fn var_mut(&mut self, id: VarId) -> Option<&mut Var> {
        self.vars.get_mut(&id)
    }

    /// Look up a variable by its full declaration string.
    pub fn lookup_full(&self, full_name: &str) -> Option<VarId> {
        self.by_full_name.get(full_name).copied()
    }

    /// Look up a variable by its short symbol.
    pub fn lookup_name(&self, name: &str) -> Option<VarId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Register a variable by declaration string, reusing it when the same
    /// declaration was seen before. A reused variable is relinked under the
    /// given parent.
    pub fn ensure(&mut self, full_name: &str, parent: Option<VarId>) -> Result<VarId> {
        if let Some(&id) = self.by_full_name.get(full_name) {
            self.relink(id, parent);
            return Ok(id);
        }

        let decl = FullName::parse(full_name)?;
        let mut steps = Vec::new();
        if let Some(qualifier) = &decl.qualifier {
            steps.push(PathStep::Qualified(qualifier.clone(), decl.name.clone()));
        } else if let Some(index) = decl.index {
            steps.push(PathStep::Index(index));
        } else if decl.callable {
            steps.push(PathStep::Call(decl.name.clone()));
        }
        if let Some(path_str) = decl.metadata.get("path") {
            steps.extend(parse_path(path_str)?);
        } else if steps.is_empty() && parent.is_some() {
            steps.push(PathStep::Field(decl.name.clone()));
        }

        let parent_level = parent.and_then(|p| self.vars.get(&p)).map(|p| p.level);
        self.cur_vid += 1;
        let id = VarId(self.cur_vid);
        let var = Var::from_decl(id, parent, &decl, steps, parent_level);

        if let Some(pid) = parent {
            if let Some(p) = self.vars.get_mut(&pid) {
                p.children.insert(var.name.clone(), id);
            }
        }
        self.by_name.insert(var.name.clone(), id);
        self.by_full_name.insert(full_name.to_string(), id);
        self.vars.insert(id, var);
        Ok(id)
    }

    fn relink(&mut self, id: VarId, parent: Option<VarId>) {
        let (old_parent, name) = match self.vars.get(&id) {
            Some(v) => (v.parent, v.name.clone()),
            None => return,
        };
        if old_parent != parent {
            if let Some(op) = old_parent {
                if let Some(p) = self.vars.get_mut(&op) {
                    if p.children.get(&name) == Some(&id) {
                        p.children.remove(&name);
                    }
                }
            }
            if let Some(v) = self.vars.get_mut(&id) {
                v.parent = parent;
            }
        }
        if let Some(pid) = parent {
            if let Some(p) = self.vars.get_mut(&pid) {
                p.children.insert(name, id);
            }
        }
    }

    /// Register a root variable from a path expression such as `@person`.
    pub fn ensure_root(&mut self, path_str: &str) -> Result<VarId> {
        if let Some(&id) = self.by_full_name.get(path_str) {
            return Ok(id);
        }
        let steps = parse_path(path_str)?;
        self.cur_vid += 1;
        let id = VarId(self.cur_vid);
        let var = Var {
            id,
            parent: None,
            name: path_str.to_string(),
            full_name: path_str.to_string(),
            metadata: BTreeMap::new(),
            path: steps,
            value: HostValue::Null,
            internal_value: HostValue::Null,
            json_value: JsonValue::Null,
            readable: true,
            writeable: false,
            action: false,
            active: true,
            level: 0,
            children: BTreeMap::new(),
            error_count: 0,
            refresh_error: None,
        };
        self.by_name.insert(var.name.clone(), id);
        self.by_full_name.insert(path_str.to_string(), id);
        self.vars.insert(id, var);
        Ok(id)
    }

    /// Point an existing root variable at a new path expression, keeping
    /// its id, level, and current value.
    pub fn reroot(&mut self, id: VarId, new_path: &str) -> Result<()> {
        let steps = parse_path(new_path)?;
        let old_full = match self.vars.get(&id) {
            Some(v) => v.full_name.clone(),
            None => {
                return Err(EngineError::path(new_path, "unknown variable to re-root"));
            }
        };
        if self.by_full_name.get(&old_full) == Some(&id) {
            self.by_full_name.remove(&old_full);
        }
        if self.by_name.get(&old_full) == Some(&id) {
            self.by_name.remove(&old_full);
        }
        if let Some(v) = self.vars.get_mut(&id) {
            v.full_name = new_path.to_string();
            v.name = new_path.to_string();
            v.path = steps;
        }
        self.by_full_name.insert(new_path.to_string(), id);
        self.by_name.insert(new_path.to_string(), id);
        Ok(())
    }

    /// Drop the parent → child link without removing the child variable.
    /// A link that was already replaced by another variable is left alone.
    pub(crate) fn unlink_child(&mut self, parent: VarId, name: &str, id: VarId) {
        if let Some(p) = self.vars.get_mut(&parent) {
            if p.children.get(name) == Some(&id) {
                p.children.remove(name);
            }
        }
    }

    /// Drop a variable and unlink it from its parent. Children are left in
    /// the environment; callers remove them explicitly.
    pub fn remove(&mut self, id: VarId) {
        let Some(var) = self.vars.remove(&id) else {
            return;
        };
        if let Some(pid) = var.parent {
            if let Some(p) = self.vars.get_mut(&pid) {
                if p.children.get(&var.name) == Some(&id) {
                    p.children.remove(&var.name);
                }
            }
        }
        if self.by_full_name.get(&var.full_name) == Some(&id) {
            self.by_full_name.remove(&var.full_name);
        }
        if self.by_name.get(&var.name) == Some(&id) {
            self.by_name.remove(&var.name);
        }
        self.changed.remove(&id);
        self.errors.remove(&id);
    }

    fn ancestor_chain(&self, id: VarId) -> Vec<VarId> {
        let mut chain = vec![id];
        let mut cursor = id;
        while let Some(parent) = self.vars.get(&cursor).and_then(|v| v.parent) {
            chain.push(parent);
            cursor = parent;
        }
        chain.reverse();
        chain
    }

    fn ancestor_values(&self, id: VarId) -> Vec<HostValue> {
        let chain = self.ancestor_chain(id);
        chain[..chain.len() - 1]
            .iter()
            .filter_map(|a| self.vars.get(a).map(|v| v.value.clone()))
            .collect()
    }

    /// Walk a path from a variable's parent value.
    pub fn get_path(&self, id: VarId, steps: &[PathStep]) -> Result<HostValue> {
        let var = self
            .vars
            .get(&id)
            .ok_or_else(|| EngineError::path(id.to_string(), "unknown variable"))?;
        let seed = self.ancestor_values(id);
        let trail = self.traverse(&var.full_name, seed, steps)?;
        Ok(trail.last().cloned().unwrap_or(HostValue::Null))
    }

    fn traverse(
        &self,
        var_name: &str,
        seed: Vec<HostValue>,
        steps: &[PathStep],
    ) -> Result<Vec<HostValue>> {
        let mut trail = seed;
        for step in steps {
            match step {
                PathStep::Root(name) => {
                    let v = self.roots.get(name).ok_or_else(|| {
                        EngineError::path(var_name, format!("no root '@{}'", name))
                    })?;
                    trail.push(v);
                }
                PathStep::Qualified(module, name) => {
                    // Prefer the ambient module binding. A leading pair
                    // naming no root walks as two ordinary fields from the
                    // current value instead.
                    if let Some(binding) = self.roots.get(module) {
                        let v = binding.get_field(name).ok_or_else(|| {
                            EngineError::path(
                                var_name,
                                format!("no binding '{}' in module '{}'", name, module),
                            )
                        })?;
                        trail.push(v);
                    } else {
                        let cur = trail.last().cloned().unwrap_or(HostValue::Null);
                        if matches!(cur, HostValue::Null) {
                            return Err(EngineError::path(
                                var_name,
                                format!("no module '{}'", module),
                            ));
                        }
                        let outer = cur.get_field(module).ok_or_else(|| {
                            EngineError::path(
                                var_name,
                                format!("no module or field '{}' on {}", module, cur.kind_name()),
                            )
                        })?;
                        let v = outer.get_field(name).ok_or_else(|| {
                            EngineError::path(
                                var_name,
                                format!("no field '{}' on {}", name, outer.kind_name()),
                            )
                        })?;
                        trail.push(outer);
                        trail.push(v);
                    }
                }
                PathStep::Field(field) => {
                    let cur = trail.last().cloned().unwrap_or(HostValue::Null);
                    if matches!(cur, HostValue::Null) {
                        return Err(EngineError::path(
                            var_name,
                            format!("null container while looking up '{}'", field),
                        ));
                    }
                    let v = cur.get_field(field).ok_or_else(|| {
                        EngineError::path(
                            var_name,
                            format!("no field '{}' on {}", field, cur.kind_name()),
                        )
                    })?;
                    trail.push(v);
                }
                PathStep::Index(index) => {
                    let cur = trail.last().cloned().unwrap_or(HostValue::Null);
                    let v = cur.index_get(*index).ok_or_else(|| {
                        EngineError::path(
                            var_name,
                            format!("index {} out of bounds on {}", index, cur.kind_name()),
                        )
                    })?;
                    trail.push(v);
                }
                PathStep::Up => {
                    if trail.len() < 2 {
                        return Err(EngineError::path(var_name, "up-traversal above root"));
                    }
                    trail.pop();
                }
                PathStep::Call(name) => {
                    let cur = trail.last().cloned().unwrap_or(HostValue::Null);
                    let func = self.lookup_callable(var_name, &cur, name)?;
                    let arity = [Arity::CtxCur, Arity::Cur]
                        .into_iter()
                        .find(|a| func.supports(*a))
                        .ok_or_else(|| {
                            EngineError::path(
                                var_name,
                                format!("getter '{}' supports no matching arity", name),
                            )
                        })?;
                    let parent = (trail.len() >= 2).then(|| trail[trail.len() - 2].clone());
                    let v = func
                        .call(arity, &self.call_ctx(), cur, parent, None)
                        .map_err(|m| EngineError::program(name.clone(), m))?;
                    trail.push(v);
                }
            }
        }
        Ok(trail)
    }

    fn lookup_callable(&self, var_name: &str, cur: &HostValue, name: &str) -> Result<HostFn> {
        match cur.get_field(name) {
            Some(HostValue::Func(f)) => Ok(f),
            Some(other) => Err(EngineError::path(
                var_name,
                format!("'{}' is {}, not callable", name, other.kind_name()),
            )),
            None => Err(EngineError::path(
                var_name,
                format!("no callable '{}' on {}", name, cur.kind_name()),
            )),
        }
    }

    /// Write a value through a variable's path into the host.
    ///
    /// With `creating` set (first-time monitor install), variables carrying
    /// `create` metadata, actions, and path-bound variables are left
    /// untouched. Writes to non-writeable variables are rejected.
    pub fn set_value(&mut self, id: VarId, value: HostValue, creating: bool) -> Result<()> {
        let (full_name, path, writeable, action, has_create, declared_type, uses_up) = {
            let var = self
                .vars
                .get(&id)
                .ok_or_else(|| EngineError::path(id.to_string(), "unknown variable"))?;
            (
                var.full_name.clone(),
                var.path.clone(),
                var.writeable,
                var.action,
                var.metadata.contains_key("create"),
                var.metadata.get("type").cloned(),
                var.uses_up(),
            )
        };

        if creating && (has_create || action || !path.is_empty()) {
            return Ok(());
        }
        if !writeable {
            return Err(EngineError::NotWriteable { name: full_name });
        }
        if path.is_empty() {
            self.use_value(id, value);
            return Ok(());
        }

        let seed = self.ancestor_values(id);
        let trail = self.traverse(&full_name, seed, &path[..path.len() - 1])?;
        let container = trail.last().cloned().unwrap_or(HostValue::Null);
        let parent_val = (trail.len() >= 2).then(|| trail[trail.len() - 2].clone());

        match &path[path.len() - 1] {
            PathStep::Field(field) => {
                let coerced = match &declared_type {
                    Some(ty) => coerce(value, ty).map_err(|m| {
                        EngineError::path(&full_name, format!("cannot convert for '{}': {}", field, m))
                    })?,
                    None => value,
                };
                container
                    .set_field(field, coerced.clone())
                    .map_err(|m| EngineError::path(&full_name, m))?;
                self.use_value(id, coerced);
                Ok(())
            }
            PathStep::Index(index) => {
                container
                    .index_set(*index, value.clone())
                    .map_err(|m| EngineError::path(&full_name, m))?;
                self.use_value(id, value);
                Ok(())
            }
            PathStep::Call(name) => {
                let func = self.lookup_callable(&full_name, &container, name)?;
                if action {
                    let preference: &[Arity] = if uses_up {
                        &[Arity::CtxCurParent, Arity::CtxCur, Arity::CurParent, Arity::Cur]
                    } else {
                        &[Arity::CtxCur, Arity::Cur]
                    };
                    let arity = preference
                        .iter()
                        .copied()
                        .find(|a| func.supports(*a))
                        .ok_or_else(|| {
                            EngineError::path(
                                &full_name,
                                format!("action '{}' supports no matching arity", name),
                            )
                        })?;
                    func.call(arity, &self.call_ctx(), container, parent_val, None)
                        .map_err(|m| EngineError::program(name.clone(), m))?;
                    Ok(())
                } else {
                    let arity = [Arity::CtxCurValue, Arity::CurValue]
                        .into_iter()
                        .find(|a| func.supports(*a))
                        .ok_or_else(|| {
                            EngineError::path(
                                &full_name,
                                format!("setter '{}' supports no matching arity", name),
                            )
                        })?;
                    func.call(arity, &self.call_ctx(), container, parent_val, Some(value.clone()))
                        .map_err(|m| EngineError::program(name.clone(), m))?;
                    self.use_value(id, value);
                    Ok(())
                }
            }
            other => Err(EngineError::path(
                &full_name,
                format!("cannot assign through '{}'", other),
            )),
        }
    }

    /// Adopt a freshly computed value: update the live value, detach a
    /// comparison copy when it differs, and cache the JSON form. Returns
    /// whether the value changed.
    fn use_value(&mut self, id: VarId, value: HostValue) -> bool {
        let json = walk(&mut self.oids, &value);
        let Some(var) = self.vars.get_mut(&id) else {
            return false;
        };
        let changed = !is_same(&var.internal_value, &value);
        if changed {
            var.internal_value = value.snapshot();
        }
        var.value = value;
        var.json_value = json;
        changed
    }

    /// Recompute a variable's value from the host. No-op for path-less
    /// variables; rejected for non-readable ones. Returns whether the value
    /// changed.
    pub fn compute_value(&mut self, id: VarId) -> Result<bool> {
        let (path, readable, full_name) = {
            let var = self
                .vars
                .get(&id)
                .ok_or_else(|| EngineError::path(id.to_string(), "unknown variable"))?;
            (var.path.clone(), var.readable, var.full_name.clone())
        };
        if path.is_empty() {
            return Ok(false);
        }
        if !readable {
            return Err(EngineError::NotReadable { name: full_name });
        }
        let value = self.get_path(id, &path)?;
        Ok(self.use_value(id, value))
    }

    /// Refresh variables in order, ancestors before descendants.
    ///
    /// With `track`, changed ids are recorded in `changed` (ids under
    /// refresh are cleared first, so the set reflects this pass). Errors
    /// are recorded per-variable unless `throw` is set; a successful
    /// refresh clears the variable's error slot.
    pub fn refresh(&mut self, ids: &[VarId], track: bool, throw: bool) -> Result<()> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        for &id in ids {
            for ancestor in self.ancestor_chain(id) {
                if seen.insert(ancestor) {
                    order.push(ancestor);
                }
            }
        }

        if track {
            for id in &order {
                self.changed.remove(id);
            }
        }

        for id in order {
            let skip = match self.vars.get(&id) {
                Some(v) => !v.active || !v.readable || v.path.is_empty(),
                None => true,
            };
            if skip {
                continue;
            }
            match self.compute_value(id) {
                Ok(value_changed) => {
                    self.errors.remove(&id);
                    if let Some(v) = self.vars.get_mut(&id) {
                        v.refresh_error = None;
                    }
                    if track && value_changed {
                        self.changed.insert(id);
                    }
                }
                Err(e) => {
                    if throw {
                        let var = self
                            .vars
                            .get(&id)
                            .map(|v| v.full_name.clone())
                            .unwrap_or_else(|| id.to_string());
                        return Err(EngineError::Refresh {
                            var,
                            message: e.to_string(),
                        });
                    }
                    let message = e.to_string();
                    log::debug!("refresh failed: {}", message);
                    self.errors.insert(id, message.clone());
                    if let Some(v) = self.vars.get_mut(&id) {
                        v.error_count += 1;
                        v.refresh_error = Some(message);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Convert a value to a declared metadata type.
fn coerce(value: HostValue, ty: &str) -> std::result::Result<HostValue, String> {
    match ty {
        "string" => Ok(match value {
            HostValue::Str(s) => HostValue::Str(s),
            HostValue::Int(i) => HostValue::Str(i.to_string()),
            HostValue::Float(f) => HostValue::Str(f.to_string()),
            HostValue::Bool(b) => HostValue::Str(b.to_string()),
            other => return Err(format!("cannot convert {} to string", other.kind_name())),
        }),
        "int" | "integer" => Ok(match value {
            HostValue::Int(i) => HostValue::Int(i),
            HostValue::Float(f) if f.fract() == 0.0 => HostValue::Int(f as i64),
            HostValue::Str(s) => HostValue::Int(
                s.parse::<i64>()
                    .map_err(|_| format!("cannot convert '{}' to int", s))?,
            ),
            other => return Err(format!("cannot convert {} to int", other.kind_name())),
        }),
        "float" | "number" => Ok(match value {
            HostValue::Float(f) => HostValue::Float(f),
            HostValue::Int(i) => HostValue::Float(i as f64),
            HostValue::Str(s) => HostValue::Float(
                s.parse::<f64>()
                    .map_err(|_| format!("cannot convert '{}' to float", s))?,
            ),
            other => return Err(format!("cannot convert {} to float", other.kind_name())),
        }),
        "bool" | "boolean" => Ok(match value {
            HostValue::Bool(b) => HostValue::Bool(b),
            HostValue::Str(s) => match s.as_str() {
                "true" => HostValue::Bool(true),
                "false" => HostValue::Bool(false),
                _ => return Err(format!("cannot convert '{}' to bool", s)),
            },
            other => return Err(format!("cannot convert {} to bool", other.kind_name())),
        }),
        _ => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FnArgs;

    fn person_roots() -> Roots {
        Roots::from_entries([(
            "person".to_string(),
            HostValue::map([
                ("name".to_string(), HostValue::Str("Herman".to_string())),
                ("number".to_string(), HostValue::Str("1313".to_string())),
            ]),
        )])
    }

    fn env_with_person() -> (VarEnv, VarId, VarId) {
        let mut env = VarEnv::new("test", person_roots());
        let root = env.ensure_root("@person").unwrap();
        let name = env.ensure("name", Some(root)).unwrap();
        (env, root, name)
    }

    #[test]
    fn ensure_registers_and_indexes() {
        let (env, root, name) = env_with_person();
        assert_eq!(env.lookup_full("name"), Some(name));
        assert_eq!(env.lookup_full("@person"), Some(root));
        assert_eq!(env.var(root).unwrap().children.get("name"), Some(&name));
        assert_eq!(env.var(name).unwrap().parent, Some(root));
        assert_eq!(env.var(name).unwrap().level, 1);
    }

    #[test]
    fn ensure_reuses_existing_declaration() {
        let (mut env, root, name) = env_with_person();
        let again = env.ensure("name", Some(root)).unwrap();
        assert_eq!(again, name);
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn ids_are_monotone_and_not_reused() {
        let (mut env, _, name) = env_with_person();
        env.remove(name);
        let other = env.ensure("other", None).unwrap();
        assert!(other.0 > name.0);
    }

    #[test]
    fn refresh_computes_values_outer_first() {
        let (mut env, root, name) = env_with_person();
        env.refresh(&[name], true, false).unwrap();

        assert_eq!(env.var(name).unwrap().json_value, serde_json::json!("Herman"));
        assert!(env.changed.contains(&name));
        // The root refreshed first and holds the live person map.
        assert!(matches!(env.var(root).unwrap().value, HostValue::Map(_)));
    }

    #[test]
    fn refresh_marks_changed_only_when_different() {
        let (mut env, _, name) = env_with_person();
        env.refresh(&[name], true, false).unwrap();
        assert!(env.changed.contains(&name));

        // Unchanged host value: the next pass clears the flag.
        env.refresh(&[name], true, false).unwrap();
        assert!(!env.changed.contains(&name));

        // External mutation shows up on the following pass.
        if let Some(person) = env.roots.get("person") {
            person.set_field("name", HostValue::Str("Lily".to_string())).unwrap();
        }
        env.refresh(&[name], true, false).unwrap();
        assert!(env.changed.contains(&name));
    }

    #[test]
    fn set_value_writes_through_to_host() {
        let (mut env, _, name) = env_with_person();
        env.refresh(&[name], true, false).unwrap();

        env.set_value(name, HostValue::Str("Freddy".to_string()), false)
            .unwrap();
        let person = env.roots.get("person").unwrap();
        assert!(matches!(person.get_field("name"), Some(HostValue::Str(s)) if s == "Freddy"));

        // Write-then-read of the same value is a no-op.
        env.refresh(&[name], true, false).unwrap();
        assert!(!env.changed.contains(&name));
    }

    #[test]
    fn set_value_rejects_non_writeable() {
        let (mut env, root, _) = env_with_person();
        let frozen = env.ensure("name?writeable=false", Some(root)).unwrap();
        let err = env
            .set_value(frozen, HostValue::Str("x".to_string()), false)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotWriteable { .. }));
    }

    #[test]
    fn creating_skips_path_bound_vars() {
        let (mut env, _, name) = env_with_person();
        env.set_value(name, HostValue::Str("Freddy".to_string()), true)
            .unwrap();
        let person = env.roots.get("person").unwrap();
        assert!(matches!(person.get_field("name"), Some(HostValue::Str(s)) if s == "Herman"));
    }

    #[test]
    fn creating_sets_rootless_value_holders() {
        let mut env = VarEnv::new("test", Roots::new());
        let holder = env.ensure("note", None).unwrap();
        env.set_value(holder, HostValue::Str("hi".to_string()), true)
            .unwrap();
        assert_eq!(env.var(holder).unwrap().json_value, serde_json::json!("hi"));
    }

    #[test]
    fn type_coercion_applies_on_set() {
        let (mut env, root, _) = env_with_person();
        let typed = env.ensure("number?type=int,path=number", Some(root)).unwrap();
        env.refresh(&[typed], false, false).unwrap();

        env.set_value(typed, HostValue::Str("42".to_string()), false)
            .unwrap();
        let person = env.roots.get("person").unwrap();
        assert!(matches!(person.get_field("number"), Some(HostValue::Int(42))));

        let err = env
            .set_value(typed, HostValue::Str("nope".to_string()), false)
            .unwrap_err();
        assert!(matches!(err, EngineError::Path { .. }));
    }

    #[test]
    fn index_set_appends_at_len_plus_one_only() {
        let roots = Roots::from_entries([(
            "items".to_string(),
            HostValue::list(vec![HostValue::Int(1)]),
        )]);
        let mut env = VarEnv::new("test", roots);
        let root = env.ensure_root("@items").unwrap();
        env.refresh(&[root], false, false).unwrap();

        let second = env.ensure("2", Some(root)).unwrap();
        env.set_value(second, HostValue::Int(2), false).unwrap();
        assert_eq!(env.roots.get("items").unwrap().seq_len(), Some(2));

        let fourth = env.ensure("4", Some(root)).unwrap();
        let err = env.set_value(fourth, HostValue::Int(4), false).unwrap_err();
        assert!(matches!(err, EngineError::Path { .. }));
    }

    #[test]
    fn up_traversal_stops_at_root() {
        let (mut env, root, _) = env_with_person();
        let bad = env.ensure("x?path=..name", Some(root)).unwrap();
        env.refresh(&[root], false, false).unwrap();
        let err = env.compute_value(bad).unwrap_err();
        assert!(matches!(err, EngineError::Path { .. }));
    }

    #[test]
    fn up_traversal_reaches_sibling() {
        let roots = Roots::from_entries([(
            "app".to_string(),
            HostValue::map([
                (
                    "user".to_string(),
                    HostValue::map([("id".to_string(), HostValue::Int(7))]),
                ),
                ("mode".to_string(), HostValue::Str("on".to_string())),
            ]),
        )]);
        let mut env = VarEnv::new("test", roots);
        let root = env.ensure_root("@app").unwrap();
        let user = env.ensure("user", Some(root)).unwrap();
        let mode = env.ensure("mode?path=..mode", Some(user)).unwrap();
        env.refresh(&[mode], true, false).unwrap();
        assert_eq!(env.var(mode).unwrap().json_value, serde_json::json!("on"));
        let _ = user;
    }

    #[test]
    fn missing_field_is_path_error_and_clears_on_success() {
        let (mut env, root, _) = env_with_person();
        let ghost = env.ensure("ghost", Some(root)).unwrap();
        env.refresh(&[ghost], true, false).unwrap();
        assert!(env.errors.contains_key(&ghost));
        assert_eq!(env.var(ghost).unwrap().error_count, 1);

        // Field appears; the next pass clears the error slot.
        env.roots
            .get("person")
            .unwrap()
            .set_field("ghost", HostValue::Bool(true))
            .unwrap();
        env.refresh(&[ghost], true, false).unwrap();
        assert!(!env.errors.contains_key(&ghost));
        assert!(env.var(ghost).unwrap().refresh_error.is_none());
    }

    #[test]
    fn refresh_throw_propagates() {
        let (mut env, root, _) = env_with_person();
        let ghost = env.ensure("ghost", Some(root)).unwrap();
        assert!(env.refresh(&[ghost], true, true).is_err());
    }

    #[test]
    fn getter_callable_refreshes_through_call() {
        let double = HostFn::new("double", vec![Arity::Cur], |args: FnArgs| {
            match args.current.get_field("base") {
                Some(HostValue::Int(i)) => Ok(HostValue::Int(i * 2)),
                _ => Err("no base".to_string()),
            }
        });
        let roots = Roots::from_entries([(
            "calc".to_string(),
            HostValue::map([
                ("base".to_string(), HostValue::Int(21)),
                ("double".to_string(), HostValue::Func(double)),
            ]),
        )]);
        let mut env = VarEnv::new("test", roots);
        let root = env.ensure_root("@calc").unwrap();
        let var = env.ensure("result?path=double()", Some(root)).unwrap();
        env.refresh(&[var], true, false).unwrap();
        assert_eq!(env.var(var).unwrap().json_value, serde_json::json!(42));
    }

    #[test]
    fn action_invocation_prefers_richest_arity() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = seen.clone();
        let bump = HostFn::new("bump", vec![Arity::CtxCur, Arity::Cur], move |args: FnArgs| {
            record
                .lock()
                .unwrap()
                .push(args.ctx.map(|c| c.connection).unwrap_or_default());
            Ok(HostValue::Null)
        });
        let roots = Roots::from_entries([(
            "ctl".to_string(),
            HostValue::map([("bump".to_string(), HostValue::Func(bump))]),
        )]);
        let mut env = VarEnv::new("conn1", roots);
        let root = env.ensure_root("@ctl").unwrap();
        let action = env.ensure("bump()", Some(root)).unwrap();
        env.refresh(&[root], false, false).unwrap();

        env.set_value(action, HostValue::Null, false).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["conn1"]);
    }

    #[test]
    fn setter_callable_receives_value() {
        let sink = std::sync::Arc::new(std::sync::Mutex::new(None));
        let store = sink.clone();
        let set = HostFn::new("set", vec![Arity::CurValue], move |args: FnArgs| {
            *store.lock().unwrap() = args.value;
            Ok(HostValue::Null)
        });
        let roots = Roots::from_entries([(
            "ctl".to_string(),
            HostValue::map([("set".to_string(), HostValue::Func(set))]),
        )]);
        let mut env = VarEnv::new("test", roots);
        let root = env.ensure_root("@ctl").unwrap();
        let var = env.ensure("x?path=set()", Some(root)).unwrap();
        env.refresh(&[root], false, false).unwrap();

        env.set_value(var, HostValue::Int(5), false).unwrap();
        assert!(matches!(*sink.lock().unwrap(), Some(HostValue::Int(5))));
    }

    #[test]
    fn qualified_binding_resolves_through_roots() {
        let roots = Roots::from_entries([(
            "Main".to_string(),
            HostValue::map([("counter".to_string(), HostValue::Int(3))]),
        )]);
        let mut env = VarEnv::new("test", roots);
        let var = env.ensure("Main.counter", None).unwrap();
        env.refresh(&[var], true, false).unwrap();
        assert_eq!(env.var(var).unwrap().json_value, serde_json::json!(3));
    }

    #[test]
    fn qualified_path_metadata_resolves_through_roots() {
        let roots = Roots::from_entries([(
            "Main".to_string(),
            HostValue::map([("counter".to_string(), HostValue::Int(5))]),
        )]);
        let mut env = VarEnv::new("test", roots);
        let var = env.ensure("x?path=Main.counter", None).unwrap();
        env.refresh(&[var], true, false).unwrap();
        assert_eq!(env.var(var).unwrap().json_value, serde_json::json!(5));
    }

    #[test]
    fn leading_pair_without_module_walks_as_fields() {
        let roots = Roots::from_entries([(
            "person".to_string(),
            HostValue::map([(
                "address".to_string(),
                HostValue::map([("city".to_string(), HostValue::Str("Mockingbird Heights".to_string()))]),
            )]),
        )]);
        let mut env = VarEnv::new("test", roots);
        let root = env.ensure_root("@person").unwrap();
        let var = env.ensure("city?path=address.city", Some(root)).unwrap();
        env.refresh(&[var], true, false).unwrap();
        assert_eq!(
            env.var(var).unwrap().json_value,
            serde_json::json!("Mockingbird Heights")
        );
    }

    #[test]
    fn reroot_keeps_id_and_value() {
        let roots = Roots::from_entries([
            ("a".to_string(), HostValue::map([("x".to_string(), HostValue::Int(1))])),
            ("b".to_string(), HostValue::map([("x".to_string(), HostValue::Int(2))])),
        ]);
        let mut env = VarEnv::new("test", roots);
        let root = env.ensure_root("@a").unwrap();
        env.refresh(&[root], false, false).unwrap();
        let before = env.var(root).unwrap().value.clone();

        env.reroot(root, "@b").unwrap();
        assert_eq!(env.var(root).unwrap().full_name, "@b");
        assert_eq!(env.lookup_full("@b"), Some(root));
        assert_eq!(env.lookup_full("@a"), None);
        assert!(is_same(&env.var(root).unwrap().value, &before));

        env.refresh(&[root], false, false).unwrap();
        assert!(matches!(
            env.var(root).unwrap().value.get_field("x"),
            Some(HostValue::Int(2))
        ));
    }

    #[test]
    fn remove_unlinks_from_parent() {
        let (mut env, root, name) = env_with_person();
        env.remove(name);
        assert!(env.var(name).is_none());
        assert!(env.var(root).unwrap().children.is_empty());
        assert_eq!(env.lookup_full("name"), None);
    }

    #[test]
    fn coerce_rules() {
        assert!(matches!(
            coerce(HostValue::Str("7".to_string()), "int"),
            Ok(HostValue::Int(7))
        ));
        assert!(matches!(
            coerce(HostValue::Int(7), "string"),
            Ok(HostValue::Str(s)) if s == "7"
        ));
        assert!(matches!(
            coerce(HostValue::Float(2.0), "int"),
            Ok(HostValue::Int(2))
        ));
        assert!(coerce(HostValue::Float(2.5), "int").is_err());
        assert!(matches!(
            coerce(HostValue::Str("true".to_string()), "bool"),
            Ok(HostValue::Bool(true))
        ));
        // Unknown declared types pass the value through.
        assert!(matches!(
            coerce(HostValue::Int(1), "widget"),
            Ok(HostValue::Int(1))
        ));
    }
}
