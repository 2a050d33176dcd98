// SPDX-License-Identifier: GPL-3.0-only

//! Data model and lenient decoding for ChatGPT conversation exports.
//!
//! A ChatGPT export is a JSON array of conversation objects. Each
//! conversation stores its history as a tree: a `mapping` from node id to
//! node, where every node points back at its parent, plus a `current_node`
//! id naming the leaf of the visible branch. The export format is only
//! loosely specified and has changed over time, so decoding here is
//! defensive: every field is optional and an absent or oddly-shaped field
//! degrades to a default instead of failing the record.
//!
//! # Example
//!
//! ```
//! use gpt2md::parser::ConversationRecord;
//!
//! let value: serde_json::Value = serde_json::from_str(r#"{
//!     "title": "Hello",
//!     "mapping": {
//!         "a": {
//!             "message": {
//!                 "author": { "role": "user" },
//!                 "content": { "content_type": "text", "parts": ["Hi"] }
//!             },
//!             "parent": null
//!         }
//!     },
//!     "current_node": "a"
//! }"#).unwrap();
//!
//! let record = ConversationRecord::from_value(&value);
//! assert_eq!(record.title.as_deref(), Some("Hello"));
//! assert_eq!(record.mapping.len(), 1);
//! ```

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// One exported conversation, as found in the top-level array.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationRecord {
    /// Conversation identifier (a UUID in recent exports).
    pub id: Option<String>,

    /// User-visible conversation title.
    pub title: Option<String>,

    /// Creation time, seconds since the Unix epoch.
    pub create_time: Option<f64>,

    /// Last-update time, seconds since the Unix epoch.
    pub update_time: Option<f64>,

    /// Model slug used for the conversation (e.g. "gpt-4o").
    pub model_slug: Option<String>,

    /// The history tree: node id to node. Traversal order is determined
    /// by parent links, never by map order.
    pub mapping: HashMap<String, HistoryNode>,

    /// Node id of the leaf of the visible branch.
    pub current_node: Option<String>,
}

/// A node in a conversation's history tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryNode {
    /// The message carried by this node. Structural nodes (e.g. the
    /// system root) carry none.
    pub message: Option<Message>,

    /// Parent node id. Back-reference only; the root has none.
    pub parent: Option<String>,

    /// Child node ids. Part of the export shape but unused when
    /// linearizing (the walk follows parent links).
    pub children: Vec<String>,
}

/// A single message within a history node.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Author role ("user", "assistant", "system", "tool", ...).
    pub role: String,

    /// Creation time, seconds since the Unix epoch.
    pub create_time: Option<f64>,

    /// The message content.
    pub content: Content,
}

/// Message content: a list of typed parts, with a raw-text fallback.
///
/// When `parts` yields no non-empty rendered fragments, callers fall back
/// to `text` before declaring the message empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Content {
    /// The typed content parts, if the export carried a parts array.
    pub parts: Option<Vec<ContentPart>>,

    /// Raw text fallback, present in some older export shapes.
    pub text: Option<String>,
}

/// One element of a content parts array, tagged by `content_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    /// Plain text (a bare string part, or a `"text"`-typed object).
    Text(String),

    /// A pointer to an image attachment (e.g. `file-service://file-...`).
    ///
    /// The pointer may be absent when the export is truncated; rendering
    /// then shows a placeholder without touching the filesystem.
    ImagePointer {
        /// The opaque pointer string used to locate the asset file.
        pointer: Option<String>,
    },

    /// Any other `content_type`, rendered as a placeholder naming it.
    Unsupported(String),
}

impl ConversationRecord {
    /// Decodes a conversation record from one top-level array element.
    ///
    /// Never fails: a non-object element (a bare string or number in the
    /// array) decodes to an empty record with no title and no mapping,
    /// which flows through the pipeline as a placeholder conversation.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let Some(map) = value.as_object() else {
            return Self::default();
        };

        let mapping = map
            .get("mapping")
            .and_then(Value::as_object)
            .map(|nodes| {
                nodes
                    .iter()
                    .map(|(id, node)| (id.clone(), HistoryNode::from_value(node)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: get_string(value, &["id"]),
            title: get_string(value, &["title"]),
            create_time: get_f64(value, &["create_time"]),
            update_time: get_f64(value, &["update_time"]),
            model_slug: get_string(value, &["default_model_slug"])
                .or_else(|| get_string(value, &["model_slug"])),
            mapping,
            current_node: get_string(value, &["current_node"]),
        }
    }
}

impl HistoryNode {
    fn from_value(value: &Value) -> Self {
        let children = value
            .get("children")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            message: value
                .get("message")
                .filter(|m| m.is_object())
                .map(Message::from_value),
            parent: get_string(value, &["parent"]),
            children,
        }
    }
}

impl Message {
    fn from_value(value: &Value) -> Self {
        Self {
            role: get_string(value, &["author", "role"]).unwrap_or_else(|| "unknown".to_owned()),
            create_time: get_f64(value, &["create_time"]),
            content: value
                .get("content")
                .map(Content::from_value)
                .unwrap_or_default(),
        }
    }
}

impl Content {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(text) => Self {
                parts: None,
                text: Some(text.clone()),
            },
            Value::Object(map) => {
                let parts = map
                    .get("parts")
                    .and_then(Value::as_array)
                    .map(|parts| parts.iter().map(ContentPart::from_value).collect());
                Self {
                    parts,
                    text: map.get("text").and_then(Value::as_str).map(str::to_owned),
                }
            }
            _ => Self::default(),
        }
    }
}

impl ContentPart {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text.clone()),
            Value::Object(_) => match get_str(value, &["content_type"]) {
                Some("text") => Self::Text(get_string(value, &["text"]).unwrap_or_default()),
                Some("image_asset_pointer") => Self::ImagePointer {
                    pointer: get_string(value, &["asset_pointer"]),
                },
                Some(other) => Self::Unsupported(other.to_owned()),
                None => Self::Unsupported("unknown".to_owned()),
            },
            other => Self::Unsupported(json_type_name(other).to_owned()),
        }
    }
}

impl<'de> Deserialize<'de> for ConversationRecord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

/// Navigates a JSON path and returns the string value at the end.
fn get_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str()
}

/// Like [`get_str`] but returns an owned `String`.
fn get_string(value: &Value, path: &[&str]) -> Option<String> {
    get_str(value, path).map(str::to_owned)
}

/// Navigates a JSON path and returns the number at the end as `f64`.
fn get_f64(value: &Value, path: &[&str]) -> Option<f64> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_f64()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
