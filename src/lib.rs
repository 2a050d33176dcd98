// SPDX-License-Identifier: GPL-3.0-only

//! Convert ChatGPT conversation exports to Markdown and PDF.
//!
//! This crate turns the `conversations.json` file from a ChatGPT data
//! export into one readable document per conversation, with referenced
//! image attachments copied alongside and thumbnailed.
//!
//! # Overview
//!
//! A ChatGPT export stores every conversation's history as a tree of
//! nodes; edits and regenerations create branches, and `current_node`
//! marks the leaf of the path the user last saw. This crate:
//!
//! 1. Streams the top-level JSON array one conversation at a time, so
//!    multi-gigabyte exports never load fully into memory
//! 2. Parses each conversation leniently into typed representations
//! 3. Linearizes the node tree into the active message path
//! 4. Renders the messages as Markdown, resolving image attachment
//!    pointers against the export's asset files
//! 5. Writes Markdown and/or a paginated PDF derived from it
//!
//! # Example
//!
//! ```no_run
//! use gpt2md::{parser, renderer, stream};
//! use std::path::Path;
//!
//! let records = stream::RecordStream::open(Path::new("conversations.json")).unwrap();
//! for (i, record) in records.enumerate() {
//!     let record = parser::ConversationRecord::from_value(&record.unwrap());
//!
//!     let options = renderer::RenderOptions::default();
//!     let mut cache = gpt2md::assets::AssetCache::new();
//!     let mut ctx = renderer::RenderContext {
//!         output_path: Path::new("out/chat.md"),
//!         asset_source: None,
//!         conversation_assets: "out/chat_assets".into(),
//!         cache: &mut cache,
//!         options: &options,
//!         warnings: Vec::new(),
//!     };
//!
//!     let markdown = renderer::render_conversation(&record, i + 1, &mut ctx);
//!     println!("{markdown}");
//! }
//! ```
//!
//! # Modules
//!
//! - [`stream`]: incremental reader over the export's top-level JSON array
//! - [`parser`]: lenient typed representations of conversation records
//! - [`history`]: tree-to-path linearization of a conversation's nodes
//! - [`renderer`]: Markdown generation for a linearized conversation
//! - [`assets`]: attachment pointer resolution, copying, and thumbnails
//! - [`paths`]: slugs, collision-free output names, and link encoding
//! - [`emit`]: Markdown/PDF output writing

#![deny(missing_docs)]

pub mod assets;
pub mod emit;
pub mod history;
pub mod parser;
pub mod paths;
pub mod renderer;
pub mod stream;
