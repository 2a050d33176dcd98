// SPDX-License-Identifier: GPL-3.0-only

//! Reconstruction of the visible transcript from a history tree.
//!
//! ChatGPT keeps edited and regenerated branches in the mapping; only the
//! branch ending at `current_node` is visible. Linearization walks parent
//! links from that leaf up to the root and reverses the path. The walk is
//! bounded to `|mapping| + 2` steps so a corrupted export with a parent
//! cycle terminates instead of looping forever.
//!
//! When the walk yields nothing (missing or unknown `current_node`, empty
//! mapping), all message-carrying nodes are used instead, sorted by
//! message creation time ascending; a missing timestamp sorts as zero.

use crate::parser::{HistoryNode, Message};
use std::collections::HashMap;

/// Produces the ordered messages of a conversation's visible branch.
///
/// Nodes without a message (structural nodes such as the hidden system
/// root) are dropped. An empty mapping yields an empty sequence; callers
/// render a "no transcript" placeholder in that case.
#[must_use]
pub fn linearize<'a>(
    mapping: &'a HashMap<String, HistoryNode>,
    current_node: Option<&str>,
) -> Vec<&'a Message> {
    let mut ordered: Vec<&str> = Vec::new();

    if let Some(leaf) = current_node.filter(|id| !id.is_empty()) {
        let max_steps = mapping.len() + 2;
        let mut cursor = Some(leaf);
        let mut steps = 0;
        while let Some(id) = cursor {
            steps += 1;
            if steps > max_steps {
                // Parent cycle; keep what was collected so far.
                break;
            }
            let Some(node) = mapping.get(id) else {
                break;
            };
            ordered.push(id);
            cursor = node.parent.as_deref().filter(|p| !p.is_empty());
        }
        ordered.reverse();
    }

    if ordered.is_empty() {
        let mut nodes: Vec<(&str, f64)> = mapping
            .iter()
            .map(|(id, node)| {
                let ts = node
                    .message
                    .as_ref()
                    .and_then(|m| m.create_time)
                    .unwrap_or(0.0);
                (id.as_str(), ts)
            })
            .collect();
        nodes.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        ordered = nodes.into_iter().map(|(id, _)| id).collect();
    }

    ordered
        .into_iter()
        .filter_map(|id| mapping.get(id).and_then(|node| node.message.as_ref()))
        .collect()
}
