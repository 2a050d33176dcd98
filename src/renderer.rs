// SPDX-License-Identifier: GPL-3.0-only

//! Markdown rendering for linearized conversations.
//!
//! This module turns one [`ConversationRecord`] into a complete Markdown
//! document: a title heading, an optional metadata line, then one
//! `## Role (timestamp)` section per message. Image parts are resolved
//! through [`crate::assets`] and embedded as relative links; every
//! attachment failure degrades to a placeholder or to the original path
//! instead of aborting the conversation.
//!
//! # Output Format
//!
//! ```markdown
//! # Trip planning
//!
//! *Created 2024-05-04 18:20 UTC · gpt-4o*
//!
//! ## User (2024-05-04 18:20 UTC)
//!
//! Here is the photo:
//!
//! [![file-AbC-pic.png](chat_assets/thumbnails/file-AbC-pic.png)](chat_assets/file-AbC-pic.png)
//! ```

use crate::assets::{self, AssetCache};
use crate::history;
use crate::parser::{ContentPart, ConversationRecord, Message};
use crate::paths;
use chrono::DateTime;
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// What to do with resolved attachment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentMode {
    /// Copy attachments into the conversation's asset folder and link the
    /// copies.
    #[default]
    Copy,

    /// Link the resolved originals in place without copying.
    Reference,
}

/// Configuration options for Markdown rendering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderOptions {
    /// How resolved attachments are linked.
    pub attachments: AttachmentMode,

    /// Maximum thumbnail width in pixels; zero disables thumbnails.
    pub thumb_width: u32,
}

/// Everything one conversation's rendering needs to touch the filesystem.
///
/// The cache outlives the conversation (it is per-run); the output path
/// and asset folder are per-conversation.
#[derive(Debug)]
pub struct RenderContext<'a> {
    /// The conversation's primary output file; embedded links are made
    /// relative to its directory.
    pub output_path: &'a Path,

    /// Where attachment source files live. `None` degrades every image
    /// to pointer-only display.
    pub asset_source: Option<&'a Path>,

    /// The conversation's `<stem>_assets` folder, created lazily on first
    /// copied asset.
    pub conversation_assets: PathBuf,

    /// Per-run copied-asset and thumbnail memory.
    pub cache: &'a mut AssetCache,

    /// Rendering options.
    pub options: &'a RenderOptions,

    /// Non-fatal asset trouble accumulated while rendering. The library
    /// does no I/O of its own; the caller decides how to report these.
    pub warnings: Vec<String>,
}

/// Renders one conversation as a Markdown document.
///
/// `sequence` is the conversation's position in the stream, used for the
/// fallback title of untitled conversations.
#[must_use]
pub fn render_conversation(
    record: &ConversationRecord,
    sequence: usize,
    ctx: &mut RenderContext<'_>,
) -> String {
    let mut out = String::new();

    let title = record
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map_or_else(|| format!("Conversation {sequence}"), str::to_owned);
    writeln!(out, "# {}\n", escape_xml_tags(&title)).unwrap();

    let created = record.create_time.and_then(format_timestamp);
    let metadata = match (&created, &record.model_slug) {
        (Some(ts), Some(model)) => format!("*Created {ts} · {model}*"),
        (Some(ts), None) => format!("*Created {ts}*"),
        (None, Some(model)) => format!("*{model}*"),
        (None, None) => String::new(),
    };
    if !metadata.is_empty() {
        writeln!(out, "{metadata}\n").unwrap();
    }

    let messages = history::linearize(&record.mapping, record.current_node.as_deref());
    if messages.is_empty() {
        writeln!(out, "*No transcript was available for this conversation.*\n").unwrap();
        return out;
    }

    for message in messages {
        render_message(&mut out, message, ctx);
    }

    out
}

fn render_message(out: &mut String, message: &Message, ctx: &mut RenderContext<'_>) {
    match message.create_time.and_then(format_timestamp) {
        Some(ts) => writeln!(out, "## {} ({ts})\n", capitalize(&message.role)).unwrap(),
        None => writeln!(out, "## {}\n", capitalize(&message.role)).unwrap(),
    }

    writeln!(out, "{}\n", render_body(message, ctx)).unwrap();
}

fn render_body(message: &Message, ctx: &mut RenderContext<'_>) -> String {
    let mut fragments: Vec<String> = Vec::new();

    if let Some(parts) = &message.content.parts {
        for part in parts {
            let fragment = match part {
                ContentPart::Text(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    escape_xml_tags(trimmed)
                }
                ContentPart::ImagePointer { pointer } => render_image(pointer.as_deref(), ctx),
                ContentPart::Unsupported(kind) => {
                    format!("*(unsupported part omitted: {kind})*")
                }
            };
            if !fragment.is_empty() {
                fragments.push(fragment);
            }
        }
    }

    if !fragments.is_empty() {
        return fragments.join("\n\n");
    }

    // The parts array yielded nothing visible; the raw text field is the
    // last resort before the empty placeholder.
    if let Some(text) = &message.content.text
        && !text.trim().is_empty()
    {
        return escape_xml_tags(text.trim());
    }

    "*(no visible content)*".to_owned()
}

/// Renders one image part, degrading through the documented fallbacks.
fn render_image(pointer: Option<&str>, ctx: &mut RenderContext<'_>) -> String {
    let Some(pointer) = pointer.filter(|p| !p.is_empty()) else {
        return "*(image attachment: pointer missing)*".to_owned();
    };

    let resolved = ctx
        .asset_source
        .and_then(|dir| assets::resolve_pointer(pointer, dir));
    let Some(resolved) = resolved else {
        return format!("*(image not found: `{}`)*", escape_for_inline_code(pointer));
    };

    let display = match ctx.options.attachments {
        AttachmentMode::Reference => resolved.clone(),
        AttachmentMode::Copy => {
            match ctx
                .cache
                .copy_to_assets(&resolved, &ctx.conversation_assets)
            {
                Ok(copied) => copied,
                Err(e) => {
                    ctx.warnings.push(format!("{e}; linking original file"));
                    resolved.clone()
                }
            }
        }
    };

    let thumbnail = if ctx.options.thumb_width > 0 {
        match ctx
            .cache
            .make_thumbnail(&display, &ctx.conversation_assets, ctx.options.thumb_width)
        {
            Ok(thumb) => thumb,
            Err(e) => {
                ctx.warnings.push(e.to_string());
                None
            }
        }
    } else {
        None
    };

    let alt = display
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_owned());
    let full = embed_link(ctx.output_path, &display);

    match thumbnail {
        Some(thumb) => {
            let thumb = embed_link(ctx.output_path, &thumb);
            format!("[![{alt}]({thumb})]({full})")
        }
        None => format!("![{alt}]({full})"),
    }
}

/// Path form used inside the Markdown document: relative to the output
/// file, forward slashes, spaces percent-encoded.
fn embed_link(output_path: &Path, target: &Path) -> String {
    paths::encode_for_embedding(&paths::relative_path(output_path, target))
}

fn format_timestamp(seconds: f64) -> Option<String> {
    if !seconds.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    DateTime::from_timestamp(seconds.trunc() as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
}

fn capitalize(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Escapes backticks in a string for use inside inline code spans.
fn escape_for_inline_code(s: &str) -> String {
    s.replace('`', "'")
}

/// Escapes XML/HTML-like tags so they render literally in Markdown.
///
/// Uses HTML entities (`&lt;` `&gt;`) which are more reliably rendered
/// across markdown viewers. Only escapes `<` when followed by a letter,
/// `/`, or `!` to avoid false positives on comparisons like `x < 5`.
fn escape_xml_tags(s: &str) -> String {
    let mut result = String::with_capacity(s.len() * 2);
    let mut chars = s.chars().peekable();
    let mut in_tag = false;

    while let Some(c) = chars.next() {
        if c == '<' {
            let is_tag_start = chars
                .peek()
                .is_some_and(|&next| next.is_ascii_alphabetic() || next == '/' || next == '!');

            if is_tag_start {
                result.push_str("&lt;");
                in_tag = true;
            } else {
                result.push(c);
            }
        } else if c == '>' && in_tag {
            result.push_str("&gt;");
            in_tag = false;
        } else {
            result.push(c);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Content, HistoryNode};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn text_message(role: &str, text: &str) -> Message {
        Message {
            role: role.into(),
            create_time: Some(1_714_846_800.0), // 2024-05-04 18:20 UTC
            content: Content {
                parts: Some(vec![ContentPart::Text(text.into())]),
                text: None,
            },
        }
    }

    fn image_message(pointer: Option<&str>) -> Message {
        Message {
            role: "user".into(),
            create_time: None,
            content: Content {
                parts: Some(vec![ContentPart::ImagePointer {
                    pointer: pointer.map(str::to_owned),
                }]),
                text: None,
            },
        }
    }

    fn single_node_record(title: Option<&str>, message: Message) -> ConversationRecord {
        ConversationRecord {
            title: title.map(str::to_owned),
            mapping: HashMap::from([(
                "a".to_owned(),
                HistoryNode {
                    message: Some(message),
                    parent: None,
                    children: Vec::new(),
                },
            )]),
            current_node: Some("a".to_owned()),
            ..Default::default()
        }
    }

    struct Fixture {
        _dir: TempDir,
        output_path: PathBuf,
        asset_source: Option<PathBuf>,
        conversation_assets: PathBuf,
        cache: AssetCache,
        options: RenderOptions,
        warnings: Vec<String>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let output_path = dir.path().join("out/chat.md");
            let conversation_assets = dir.path().join("out/chat_assets");
            std::fs::create_dir_all(dir.path().join("out")).unwrap();
            Self {
                _dir: dir,
                output_path,
                asset_source: None,
                conversation_assets,
                cache: AssetCache::new(),
                options: RenderOptions::default(),
                warnings: Vec::new(),
            }
        }

        fn with_asset_source(root: &TempDir) -> Self {
            let mut fixture = Self::new();
            fixture.asset_source = Some(root.path().to_path_buf());
            fixture
        }

        fn render(&mut self, record: &ConversationRecord) -> String {
            let mut ctx = RenderContext {
                output_path: &self.output_path,
                asset_source: self.asset_source.as_deref(),
                conversation_assets: self.conversation_assets.clone(),
                cache: &mut self.cache,
                options: &self.options,
                warnings: Vec::new(),
            };
            let output = render_conversation(record, 1, &mut ctx);
            self.warnings = ctx.warnings;
            output
        }
    }

    #[test]
    fn renders_title_and_role_sections() {
        let record = single_node_record(Some("Hello"), text_message("user", "Hi"));
        let output = Fixture::new().render(&record);

        assert!(output.starts_with("# Hello\n"));
        assert!(output.contains("## User (2024-05-04 18:20 UTC)\n"));
        assert!(output.contains("\nHi\n"));
    }

    #[test]
    fn untitled_conversation_uses_sequence_title() {
        let record = single_node_record(None, text_message("user", "Hi"));
        let output = Fixture::new().render(&record);
        assert!(output.starts_with("# Conversation 1\n"));
    }

    #[test]
    fn message_without_timestamp_shows_role_alone() {
        let mut message = text_message("assistant", "Sure");
        message.create_time = None;
        let record = single_node_record(Some("T"), message);
        let output = Fixture::new().render(&record);

        assert!(output.contains("## Assistant\n"));
        assert!(!output.contains("## Assistant ("));
    }

    #[test]
    fn metadata_line_shows_created_and_model() {
        let mut record = single_node_record(Some("T"), text_message("user", "Hi"));
        record.create_time = Some(1_714_846_800.0);
        record.model_slug = Some("gpt-4o".into());
        let output = Fixture::new().render(&record);

        assert!(output.contains("*Created 2024-05-04 18:20 UTC · gpt-4o*"));
    }

    #[test]
    fn empty_mapping_renders_no_transcript_placeholder() {
        let record = ConversationRecord {
            title: Some("Empty".into()),
            ..Default::default()
        };
        let output = Fixture::new().render(&record);

        assert!(output.contains("*No transcript was available for this conversation.*"));
    }

    #[test]
    fn empty_parts_fall_back_to_raw_text() {
        let message = Message {
            role: "user".into(),
            create_time: None,
            content: Content {
                parts: Some(vec![ContentPart::Text("   ".into())]),
                text: Some("raw fallback".into()),
            },
        };
        let record = single_node_record(Some("T"), message);
        let output = Fixture::new().render(&record);

        assert!(output.contains("raw fallback"));
    }

    #[test]
    fn fully_empty_message_gets_placeholder() {
        let message = Message {
            role: "user".into(),
            create_time: None,
            content: Content::default(),
        };
        let record = single_node_record(Some("T"), message);
        let output = Fixture::new().render(&record);

        assert!(output.contains("*(no visible content)*"));
    }

    #[test]
    fn unsupported_part_names_its_type() {
        let message = Message {
            role: "assistant".into(),
            create_time: None,
            content: Content {
                parts: Some(vec![
                    ContentPart::Unsupported("audio_transcription".into()),
                    ContentPart::Text("after".into()),
                ]),
                text: None,
            },
        };
        let record = single_node_record(Some("T"), message);
        let output = Fixture::new().render(&record);

        assert!(output.contains("*(unsupported part omitted: audio_transcription)*"));
        assert!(output.contains("after"));
    }

    #[test]
    fn missing_pointer_renders_placeholder_without_fs_access() {
        let record = single_node_record(Some("T"), image_message(None));
        let output = Fixture::new().render(&record);

        assert!(output.contains("*(image attachment: pointer missing)*"));
    }

    #[test]
    fn unresolved_pointer_falls_back_to_pointer_text() {
        let record = single_node_record(
            Some("T"),
            image_message(Some("file-service://file-Gone")),
        );
        let output = Fixture::new().render(&record);

        assert!(output.contains("*(image not found: `file-service://file-Gone`)*"));
    }

    #[test]
    fn copy_mode_copies_asset_and_links_relative_path() {
        let source_root = TempDir::new().unwrap();
        std::fs::write(source_root.path().join("file-AbC-pic.png"), "bytes").unwrap();

        let record = single_node_record(
            Some("T"),
            image_message(Some("file-service://file-AbC")),
        );

        let mut fixture = Fixture::with_asset_source(&source_root);
        let output = fixture.render(&record);

        assert!(output.contains("![file-AbC-pic.png](chat_assets/file-AbC-pic.png)"));
        assert!(fixture.conversation_assets.join("file-AbC-pic.png").exists());
    }

    #[test]
    fn reference_mode_links_original_without_copying() {
        let source_root = TempDir::new().unwrap();
        std::fs::write(source_root.path().join("file-AbC-pic.png"), "bytes").unwrap();

        let record = single_node_record(
            Some("T"),
            image_message(Some("file-service://file-AbC")),
        );

        let mut fixture = Fixture::with_asset_source(&source_root);
        fixture.options.attachments = AttachmentMode::Reference;
        let output = fixture.render(&record);

        assert!(output.contains("file-AbC-pic.png"));
        assert!(!fixture.conversation_assets.exists());
    }

    #[test]
    fn copy_failure_degrades_to_linking_the_original() {
        let source_root = TempDir::new().unwrap();
        std::fs::write(source_root.path().join("file-AbC-pic.png"), "bytes").unwrap();

        let record = single_node_record(
            Some("T"),
            image_message(Some("file-service://file-AbC")),
        );

        let mut fixture = Fixture::with_asset_source(&source_root);
        // A file squatting on the asset dir name makes the copy fail.
        std::fs::write(&fixture.conversation_assets, "in the way").unwrap();
        let output = fixture.render(&record);

        assert!(output.contains("file-AbC-pic.png)"));
        assert!(!output.contains("chat_assets/file-AbC-pic.png"));
        assert!(
            fixture.warnings.iter().any(|w| w.contains("asset directory")),
            "copy failure must be surfaced: {:?}",
            fixture.warnings
        );
    }

    #[test]
    fn thumbnail_failure_degrades_to_the_full_image() {
        let source_root = TempDir::new().unwrap();
        std::fs::write(source_root.path().join("file-AbC-pic.png"), "not a real png").unwrap();

        let record = single_node_record(
            Some("T"),
            image_message(Some("file-service://file-AbC")),
        );

        let mut fixture = Fixture::with_asset_source(&source_root);
        fixture.options.thumb_width = 50;
        let output = fixture.render(&record);

        assert!(output.contains("![file-AbC-pic.png](chat_assets/file-AbC-pic.png)"));
        assert!(!output.contains("thumbnails"));
        assert!(
            fixture.warnings.iter().any(|w| w.contains("decode")),
            "decode failure must be surfaced: {:?}",
            fixture.warnings
        );
    }

    #[test]
    fn thumbnail_becomes_clickable_link_to_full_image() {
        let source_root = TempDir::new().unwrap();
        let img = image::RgbImage::from_pixel(200, 100, image::Rgb([1, 2, 3]));
        img.save(source_root.path().join("file-AbC-pic.png")).unwrap();

        let record = single_node_record(
            Some("T"),
            image_message(Some("file-service://file-AbC")),
        );

        let mut fixture = Fixture::with_asset_source(&source_root);
        fixture.options.thumb_width = 50;
        let output = fixture.render(&record);

        assert!(output.contains(
            "[![file-AbC-pic.png](chat_assets/thumbnails/file-AbC-pic.png)](chat_assets/file-AbC-pic.png)"
        ));
    }

    #[test]
    fn spaces_in_linked_paths_are_percent_encoded() {
        let source_root = TempDir::new().unwrap();
        std::fs::write(source_root.path().join("file-AbC my pic.png"), "bytes").unwrap();

        let record = single_node_record(
            Some("T"),
            image_message(Some("file-service://file-AbC")),
        );

        let mut fixture = Fixture::with_asset_source(&source_root);
        let output = fixture.render(&record);

        assert!(output.contains("chat_assets/file-AbC%20my%20pic.png"));
    }

    #[test]
    fn escapes_xml_tags_in_text() {
        let record = single_node_record(Some("T"), text_message("user", "<tool>run</tool>"));
        let output = Fixture::new().render(&record);

        assert!(output.contains("&lt;tool&gt;run&lt;/tool&gt;"));
    }

    #[test]
    fn preserves_non_tag_less_than() {
        assert_eq!(escape_xml_tags("a < b"), "a < b");
        assert_eq!(escape_xml_tags("x<5"), "x<5");
        assert_eq!(escape_xml_tags("<div>"), "&lt;div&gt;");
    }
}
