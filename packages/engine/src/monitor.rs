//! Monitors: watched variable sets and their publish cycle.
//!
//! A `monitor` block declares a set of variables rooted at a path
//! expression. Ingest installs or updates the monitor's variables and
//! applies inbound values that differ from the current ones; the outgoing
//! side refreshes due monitors on their cadence and assembles blocks from
//! the changed values.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde_json::{json, Value as JsonValue};

use crate::block::{Block, BlockType, StringList};
use crate::env::VarEnv;
use crate::error::{EngineError, Result};
use crate::host::is_same;
use crate::name::FullName;
use crate::var::VarId;
use crate::walk::deref;

/// Block keys consumed by the monitor machinery; everything else is
/// preserved verbatim in outgoing blocks.
const RESERVED_KEYS: [&str; 5] = ["root", "update", "quiet", "updatetopics", "rename"];

/// Per-monitor state.
#[derive(Debug, Clone)]
pub struct MonitorData {
    pub name: String,
    /// Root variable the monitor's variables hang off.
    pub root: VarId,
    pub root_path: String,
    /// Refresh period in seconds.
    pub update: f64,
    /// Refresh but never publish.
    pub quiet: bool,
    pub disabled: bool,
    pub topics: BTreeSet<String>,
    pub update_topics: BTreeSet<String>,
    /// Block key → last applied JSON.
    pub data: IndexMap<String, JsonValue>,
    /// `(block key, var full name)` pairs preserving block order.
    pub data_keys: Vec<(String, String)>,
    /// Short symbol → variable.
    pub vars: BTreeMap<String, VarId>,
    /// Last inbound block, source of preserved keys.
    pub original: Block,
    /// Variable whose current JSON value names the outgoing block.
    pub rename: Option<VarId>,
    pub last_check: f64,
    /// Publish on the next tick regardless of cadence and changes.
    pub forced: bool,
}

impl MonitorData {
    fn new(name: String, root: VarId, root_path: String, default_update: f64) -> MonitorData {
        MonitorData {
            name,
            root,
            root_path,
            update: default_update,
            quiet: false,
            disabled: false,
            topics: BTreeSet::new(),
            update_topics: BTreeSet::new(),
            data: IndexMap::new(),
            data_keys: Vec::new(),
            vars: BTreeMap::new(),
            original: Block::new(BlockType::Monitor, String::new()),
            rename: None,
            last_check: 0.0,
            forced: true,
        }
    }

    /// Whether the monitor's next scheduled tick has arrived.
    pub fn due(&self, now: f64) -> bool {
        if self.forced {
            return true;
        }
        let update = if self.update > 0.0 { self.update } else { f64::MIN_POSITIVE };
        now - (self.last_check / update).floor() * update >= update
    }

    /// Union of `topics` and `update_topics`, the outbound destinations.
    fn outbound_topics(&self) -> StringList {
        let mut out: Vec<String> = self.topics.iter().cloned().collect();
        for t in &self.update_topics {
            if !out.contains(t) {
                out.push(t.clone());
            }
        }
        StringList(out)
    }
}

/// The monitor table, keyed by block name.
pub type MonitorTable = BTreeMap<String, MonitorData>;

fn string_set(value: Option<&JsonValue>) -> BTreeSet<String> {
    let Some(value) = value else {
        return BTreeSet::new();
    };
    serde_json::from_value::<StringList>(value.clone())
        .map(|l| l.0.into_iter().collect())
        .unwrap_or_default()
}

/// Look up or create the monitor for a block, re-rooting when the root
/// expression changed. Returns whether the monitor is new.
fn monitor_from(
    env: &mut VarEnv,
    monitors: &mut MonitorTable,
    name: &str,
    root_path: &str,
    default_update: f64,
) -> Result<bool> {
    if let Some(mon) = monitors.get_mut(name) {
        if mon.root_path != root_path {
            // Keep the root variable's id, level, and value; only the
            // binding moves. A root already registered under the new
            // expression is shared instead.
            match env.lookup_full(root_path) {
                Some(existing) => mon.root = existing,
                None => env.reroot(mon.root, root_path)?,
            }
            mon.root_path = root_path.to_string();
        }
        return Ok(false);
    }
    let root = env.ensure_root(root_path)?;
    monitors.insert(
        name.to_string(),
        MonitorData::new(name.to_string(), root, root_path.to_string(), default_update),
    );
    Ok(true)
}

/// Apply a `monitor` block: derive or reuse monitor state, rebuild the
/// variable set, and write inbound values that differ into the host.
pub fn ingest_monitor_block(
    env: &mut VarEnv,
    monitors: &mut MonitorTable,
    block: Block,
    default_update: f64,
) -> Result<()> {
    let root_path = block
        .extra_str("root")
        .ok_or_else(|| EngineError::protocol(format!("monitor '{}' without root", block.name)))?
        .to_string();
    let value = block
        .value
        .as_object()
        .ok_or_else(|| EngineError::protocol(format!("monitor '{}' without value", block.name)))?
        .clone();

    let is_new = monitor_from(env, monitors, &block.name, &root_path, default_update)?;

    // Parse declarations up front so a bad key drops the block before any
    // state is touched.
    let mut decls: Vec<(FullName, JsonValue)> = Vec::with_capacity(value.len());
    for (key, val) in &value {
        decls.push((FullName::parse(key)?, val.clone()));
    }
    let rename_decl = match block.extra_str("rename") {
        Some(r) => Some(FullName::parse(r)?),
        None => None,
    };

    let disabled = block.extra_bool("disabled").unwrap_or(false);
    let Some(mon) = monitors.get_mut(&block.name) else {
        return Ok(());
    };
    let root_id = mon.root;
    let old_vars = std::mem::take(&mut mon.vars);
    mon.data_keys.clear();
    mon.rename = None;
    mon.update = block.extra_f64("update").unwrap_or(default_update);
    mon.quiet = block.extra_bool("quiet").unwrap_or(false);
    mon.disabled = disabled;
    mon.topics = block.topics.iter().cloned().collect();
    mon.update_topics = string_set(block.extra.get("updatetopics"));

    if disabled {
        for (_, id) in old_vars {
            env.remove(id);
        }
        mon.data.clear();
        mon.original = block;
        return Ok(());
    }

    for (decl, _) in &decls {
        // A bare re-send of a known symbol keeps the declared variable and
        // its metadata; anything else registers by full declaration.
        let bare = decl.metadata.is_empty()
            && decl.qualifier.is_none()
            && decl.index.is_none()
            && !decl.callable;
        let vid = match old_vars.get(&decl.name) {
            Some(&old) if bare && env.var(old).is_some() => old,
            _ => env.ensure(&decl.full, Some(root_id))?,
        };
        mon.vars.insert(decl.name.clone(), vid);
        mon.data_keys.push((decl.name.clone(), decl.full.clone()));
    }
    if let Some(rdecl) = rename_decl {
        let rid = env.ensure(&rdecl.full, Some(root_id))?;
        mon.rename = Some(rid);
    }

    // Children no longer referenced drop their link from the root but stay
    // registered until an explicit delete.
    let kept: BTreeSet<VarId> = mon.vars.values().copied().collect();
    for (name, id) in old_vars {
        if !kept.contains(&id) {
            env.unlink_child(root_id, &name, id);
        }
    }

    let var_ids: BTreeMap<String, VarId> = mon.vars.clone();
    for (decl, val) in &decls {
        if let Some(&vid) = var_ids.get(&decl.name) {
            if let Some(m) = monitors.get_mut(&block.name) {
                m.data.insert(decl.name.clone(), val.clone());
            }
            apply_inbound(env, vid, val, is_new);
        }
    }

    if let Some(mon) = monitors.get_mut(&block.name) {
        mon.original = block;
        if is_new {
            mon.forced = true;
        }
    }
    Ok(())
}

/// Write one inbound value into the host when it differs from the current
/// one, suppressing the echo. First-time installs do not mutate host state.
fn apply_inbound(env: &mut VarEnv, vid: VarId, val: &JsonValue, is_new: bool) {
    let incoming = deref(&env.oids, val);
    if is_new {
        if let Err(e) = env.set_value(vid, incoming, true) {
            log::warn!("initial set failed: {}", e);
        }
        return;
    }
    let differs = match env.var(vid) {
        Some(var) => !is_same(&incoming, &var.value),
        None => return,
    };
    if differs {
        match env.set_value(vid, incoming, false) {
            Ok(()) => {
                env.changed.remove(&vid);
            }
            Err(e) => log::warn!("inbound set failed: {}", e),
        }
    }
}

/// Refresh due monitors and assemble their outgoing blocks.
///
/// Quiet monitors refresh (their changed flags land in `env.changed`) but
/// never publish. The emitted block preserves the inbound block's
/// non-reserved keys, then injects `root`, `rename`, a non-default
/// `update`, `updatetopics`, and finally the ordered `value` object.
pub fn outgoing_blocks(
    env: &mut VarEnv,
    monitors: &mut MonitorTable,
    now: f64,
    force: bool,
    default_update: f64,
) -> Vec<(String, Block)> {
    let mut out = Vec::new();
    for mon in monitors.values_mut() {
        if mon.disabled {
            continue;
        }
        if !force && !mon.due(now) {
            continue;
        }

        let mut ids: Vec<VarId> = mon.vars.values().copied().collect();
        ids.push(mon.root);
        if let Some(rid) = mon.rename {
            ids.push(rid);
        }
        if let Err(e) = env.refresh(&ids, true, false) {
            log::warn!("refresh of monitor '{}' failed: {}", mon.name, e);
        }

        let was_forced = mon.forced;
        mon.forced = false;
        mon.last_check = now;

        let has_changes = mon.vars.values().any(|id| env.changed.contains(id));
        if !has_changes && !was_forced {
            continue;
        }
        if mon.quiet {
            continue;
        }

        let mut block = Block::new(BlockType::Monitor, mon.name.clone());
        block.topics = mon.outbound_topics();
        block.origin = mon.original.origin.clone();
        block.targets = mon.original.targets.clone();
        block.tags = mon.original.tags.clone();
        for (key, val) in &mon.original.extra {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                block.extra.insert(key.clone(), val.clone());
            }
        }
        block.extra.insert("root".to_string(), json!(mon.root_path));
        if let Some(rid) = mon.rename {
            if let Some(var) = env.var(rid) {
                let rename_json = var.json_value.clone();
                if let Some(name) = rename_json.as_str() {
                    if !name.is_empty() {
                        block.name = name.to_string();
                    }
                }
                block.extra.insert("rename".to_string(), rename_json);
            }
        }
        if mon.update != default_update {
            block.extra.insert("update".to_string(), json!(mon.update));
        }
        if !mon.update_topics.is_empty() {
            let topics: Vec<&String> = mon.update_topics.iter().collect();
            block.extra.insert("updatetopics".to_string(), json!(topics));
        }

        let mut value = serde_json::Map::new();
        for (key, _full) in &mon.data_keys {
            if let Some(&vid) = mon.vars.get(key) {
                if let Some(var) = env.var(vid) {
                    value.insert(key.clone(), var.json_value.clone());
                    mon.data.insert(key.clone(), var.json_value.clone());
                }
            }
        }
        block.value = JsonValue::Object(value);

        out.push((block.name.clone(), block));
    }
    out
}

/// Remove a monitor's variables (root included) from the environment.
pub fn remove_monitor_vars(env: &mut VarEnv, mon: &MonitorData) {
    for id in mon.vars.values() {
        env.remove(*id);
    }
    if let Some(rid) = mon.rename {
        env.remove(rid);
    }
    env.remove(mon.root);
}
