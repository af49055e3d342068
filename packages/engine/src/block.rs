//! Block JSON: the messages exchanged with subscribers.
//!
//! Every block is a JSON object with a `type` (`monitor`, `code`, `data`,
//! `delete`), a `name`, optional routing keys (`origin`, `topics`,
//! `targets`, `tags`), a type-specific `value`, and arbitrary further keys.
//! Keys the engine does not interpret ride along in `extra` and are
//! preserved verbatim when a monitor's outgoing block is assembled.

use std::fmt;

use indexmap::IndexMap;
use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::error::{EngineError, Result};

/// Ordered name → block map. Ingest batches and outgoing publishes keep
/// insertion order.
pub type BlockMap = IndexMap<String, Block>;

/// The four block types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Monitor,
    Code,
    Data,
    Delete,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockType::Monitor => "monitor",
            BlockType::Code => "code",
            BlockType::Data => "data",
            BlockType::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// A string-or-array-of-strings JSON field (`topics`, `targets`, `tags`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringList(pub Vec<String>);

impl StringList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, s: &str) -> bool {
        self.0.iter().any(|x| x == s)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl From<Vec<String>> for StringList {
    fn from(v: Vec<String>) -> Self {
        StringList(v)
    }
}

impl From<&str> for StringList {
    fn from(s: &str) -> Self {
        StringList(vec![s.to_string()])
    }
}

impl Serialize for StringList {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.0.len() == 1 {
            serializer.serialize_str(&self.0[0])
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for StringList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ListVisitor;

        impl<'de> Visitor<'de> for ListVisitor {
            type Value = StringList;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or an array of strings")
            }

            fn visit_str<E: serde::de::Error>(self, s: &str) -> std::result::Result<StringList, E> {
                Ok(StringList(vec![s.to_string()]))
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<StringList, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<String>()? {
                    items.push(item);
                }
                Ok(StringList(items))
            }

            fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<StringList, E> {
                Ok(StringList::default())
            }
        }

        deserializer.deserialize_any(ListVisitor)
    }
}

/// A block: one JSON message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub kind: BlockType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "StringList::is_empty")]
    pub topics: StringList,
    #[serde(default, skip_serializing_if = "StringList::is_empty")]
    pub targets: StringList,
    #[serde(default, skip_serializing_if = "StringList::is_empty")]
    pub tags: StringList,
    /// Keys the engine does not interpret; preserved in block order.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub value: JsonValue,
}

impl Block {
    pub fn new(kind: BlockType, name: impl Into<String>) -> Block {
        Block {
            kind,
            name: name.into(),
            origin: None,
            topics: StringList::default(),
            targets: StringList::default(),
            tags: StringList::default(),
            extra: serde_json::Map::new(),
            value: JsonValue::Null,
        }
    }

    /// Build a `data` block carrying a value.
    pub fn data(name: impl Into<String>, value: JsonValue) -> Block {
        let mut block = Block::new(BlockType::Data, name);
        block.value = value;
        block
    }

    /// Parse a block from JSON, reporting malformed input as a protocol
    /// error.
    pub fn parse(json: JsonValue) -> Result<Block> {
        serde_json::from_value(json)
            .map_err(|e| EngineError::protocol(format!("malformed block: {}", e)))
    }

    /// Serialize back to a JSON object.
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Whether a subscriber consumes this block: `targets` absent, or the
    /// subscriber listed.
    pub fn targeted_at(&self, subscriber: &str) -> bool {
        self.targets.is_empty() || self.targets.contains(subscriber)
    }

    /// Whether this block is delivered to a topic: the topic listed in
    /// `topics`, or `topics` empty and the topic being the sender's default
    /// output stream.
    pub fn topic_matches(&self, topic: &str, default_topic: &str) -> bool {
        if self.topics.is_empty() {
            topic == default_topic
        } else {
            self.topics.contains(topic)
        }
    }

    /// String-valued key from the uninterpreted extras.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(JsonValue::as_str)
    }

    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(JsonValue::as_bool)
    }

    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(JsonValue::as_f64)
    }
}
