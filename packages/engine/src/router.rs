//! Block routing: dispatch of inbound batches to the type handlers.
//!
//! Within a batch, blocks are handled in lexicographic name order for
//! deterministic replay. A block is consumed only when its `targets` allow
//! this subscriber; identical re-sends of `monitor` and `data` blocks are
//! no-ops (dedup through the data-block cache). Malformed blocks are warned
//! about and skipped; the rest of the batch proceeds.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::block::{Block, BlockMap, BlockType, StringList};
use crate::env::VarEnv;
use crate::error::{EngineError, Result};
use crate::monitor::{ingest_monitor_block, remove_monitor_vars, MonitorTable};

/// A reducer installed by a `code` block: aggregates inbound blocks under
/// its name, optionally producing a replacement value to publish.
pub type ReducerFn = Arc<dyn Fn(&Block) -> Option<JsonValue> + Send + Sync>;

/// Result of evaluating a `code` block.
pub enum Evaluated {
    /// The evaluation produced nothing to keep.
    None,
    /// A plain value; published as a `data` block when `return` is set.
    Value(JsonValue),
    /// A callable; installed as a reducer keyed by the block name.
    Reducer(ReducerFn),
}

/// Language execution hook for `code` blocks. The engine treats evaluation
/// as opaque; wire in an implementation per embedded language.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, language: &str, text: &str) -> Result<Evaluated>;
}

/// Mutable state a dispatch pass operates over.
pub struct RouterCtx<'a> {
    pub env: &'a mut VarEnv,
    pub monitors: &'a mut MonitorTable,
    pub data_blocks: &'a mut BTreeMap<String, Block>,
    pub reducers: &'a mut BTreeMap<String, ReducerFn>,
    pub evaluator: Option<&'a dyn Evaluator>,
    /// Subscriber id used for `targets` filtering (the connection name).
    pub subscriber: &'a str,
    pub default_update: f64,
    /// Outgoing map; `code` results and reducer output land here.
    pub outgoing: &'a mut IndexMap<String, Block>,
}

/// Dispatch one inbound batch. Returns the number of blocks handled.
pub fn dispatch_batch(ctx: &mut RouterCtx<'_>, batch: BlockMap) -> usize {
    let mut names: Vec<String> = batch.keys().cloned().collect();
    names.sort();

    let mut handled = 0;
    let mut blocks = batch;
    for name in names {
        let Some(block) = blocks.shift_remove(&name) else {
            continue;
        };
        if !block.targeted_at(ctx.subscriber) {
            continue;
        }
        if matches!(block.kind, BlockType::Monitor | BlockType::Data)
            && ctx.data_blocks.get(&block.name) == Some(&block)
        {
            continue;
        }
        match dispatch_block(ctx, block) {
            Ok(()) => handled += 1,
            Err(e) => log::warn!("dropping block '{}': {}", name, e),
        }
    }
    handled
}

fn dispatch_block(ctx: &mut RouterCtx<'_>, block: Block) -> Result<()> {
    match block.kind {
        BlockType::Monitor => {
            ingest_monitor_block(ctx.env, ctx.monitors, block.clone(), ctx.default_update)?;
            ctx.data_blocks.insert(block.name.clone(), block);
            Ok(())
        }
        BlockType::Code => handle_code(ctx, block),
        BlockType::Data => {
            if let Some(reducer) = ctx.reducers.get(&block.name) {
                if let Some(reduced) = reducer(&block) {
                    let mut out = Block::data(block.name.clone(), reduced);
                    out.topics = block.topics.clone();
                    ctx.outgoing.insert(out.name.clone(), out);
                }
            }
            ctx.data_blocks.insert(block.name.clone(), block);
            Ok(())
        }
        BlockType::Delete => handle_delete(ctx, block),
    }
}

fn handle_code(ctx: &mut RouterCtx<'_>, block: Block) -> Result<()> {
    let text = block
        .value
        .as_str()
        .ok_or_else(|| EngineError::protocol(format!("code '{}' without text", block.name)))?;
    let Some(evaluator) = ctx.evaluator else {
        log::warn!("no evaluator configured, ignoring code block '{}'", block.name);
        return Ok(());
    };
    let language = block.extra_str("language").unwrap_or("");
    match evaluator.evaluate(language, text)? {
        Evaluated::None => {}
        Evaluated::Value(value) => {
            if block.extra_bool("return").unwrap_or(false) {
                let mut out = Block::data(block.name.clone(), value);
                out.topics = block.topics.clone();
                ctx.outgoing.insert(out.name.clone(), out);
            }
        }
        Evaluated::Reducer(reducer) => {
            ctx.reducers.insert(block.name.clone(), reducer);
        }
    }
    Ok(())
}

fn handle_delete(ctx: &mut RouterCtx<'_>, block: Block) -> Result<()> {
    let names = delete_targets(ctx, &block.value)?;
    for name in names {
        ctx.data_blocks.remove(&name);
        ctx.reducers.remove(&name);
        if let Some(mon) = ctx.monitors.remove(&name) {
            remove_monitor_vars(ctx.env, &mon);
        }
    }
    Ok(())
}

/// Resolve a `delete` value to concrete block names: a name, a list of
/// names, or `{"tagged": tag | [tags]}` selecting every cached block or
/// monitor whose `tags` contain one of the given tags.
fn delete_targets(ctx: &RouterCtx<'_>, value: &JsonValue) -> Result<Vec<String>> {
    match value {
        JsonValue::String(s) => Ok(vec![s.clone()]),
        JsonValue::Array(items) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => names.push(s.to_string()),
                    None => {
                        return Err(EngineError::protocol("delete list entries must be strings"))
                    }
                }
            }
            Ok(names)
        }
        JsonValue::Object(map) => {
            let tags = map
                .get("tagged")
                .ok_or_else(|| EngineError::protocol("delete object requires 'tagged'"))?;
            let tags: StringList = serde_json::from_value(tags.clone())
                .map_err(|e| EngineError::protocol(format!("illegal delete tags: {}", e)))?;
            let mut names = Vec::new();
            for (name, cached) in ctx.data_blocks.iter() {
                if tags.iter().any(|t| cached.tags.contains(t)) {
                    names.push(name.clone());
                }
            }
            for (name, mon) in ctx.monitors.iter() {
                if tags.iter().any(|t| mon.original.tags.contains(t)) && !names.contains(name) {
                    names.push(name.clone());
                }
            }
            Ok(names)
        }
        _ => Err(EngineError::protocol("illegal delete value")),
    }
}
