// SPDX-License-Identifier: GPL-3.0-only

//! Writing rendered conversations to disk in one or both output formats.
//!
//! The Markdown document produced by [`crate::renderer`] is the single
//! source of truth. The primary format writes it verbatim. The paginated
//! format derives from it: the Markdown is converted to a sanitized HTML
//! subset (raw HTML stripped, unsafe link schemes rejected), every local
//! image `src` and anchor `href` is rewritten to an absolute `file://`
//! reference resolved against the primary output's directory, and the
//! result is laid out onto fixed-size A4 pages.
//!
//! Conversion and link rewriting are pure functions of the markup and a
//! base directory, so they are unit-testable without any file I/O; only
//! [`write_markdown`] and [`render_pdf`] touch the filesystem.

use crate::paths;
use printpdf::{BuiltinFont, Image, ImageTransform, Mm, PdfDocument, image_crate};
use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd, html};
use snafu::prelude::*;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

/// Error type for output emission failures.
#[derive(Debug, Snafu)]
pub enum EmitError {
    /// The primary Markdown file could not be written.
    #[snafu(display("failed to write {}: {source}", path.display()))]
    WriteMarkdown {
        /// The file that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The paginated document file could not be created.
    #[snafu(display("failed to create {}: {source}", path.display()))]
    CreatePdfFile {
        /// The file that could not be created.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Laying out or saving the paginated document failed.
    #[snafu(display("failed to render {}: {detail}", path.display()))]
    RenderFailed {
        /// The document that could not be rendered.
        path: PathBuf,
        /// What went wrong.
        detail: String,
    },
}

/// Which rendered formats a run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Markdown only.
    #[default]
    Markdown,
    /// PDF only.
    Pdf,
    /// Both formats from the same markup.
    Both,
}

impl OutputFormat {
    /// Whether the primary Markdown file is written.
    #[must_use]
    pub const fn wants_markdown(self) -> bool {
        matches!(self, Self::Markdown | Self::Both)
    }

    /// Whether the paginated document is written.
    #[must_use]
    pub const fn wants_pdf(self) -> bool {
        matches!(self, Self::Pdf | Self::Both)
    }
}

/// Page and layout constants for the paginated output.
const PAGE_WIDTH_MM: f64 = 210.0;
const PAGE_HEIGHT_MM: f64 = 297.0;
const MARGIN_MM: f64 = 20.0;
const TEXT_WIDTH_MM: f64 = PAGE_WIDTH_MM - 2.0 * MARGIN_MM;
const BODY_PT: f64 = 11.0;
const CODE_PT: f64 = 9.5;

/// Fixed stylesheet wrapped around every converted document.
const STYLESHEET: &str = "body { font-family: sans-serif; max-width: 46em; margin: 2em auto; } \
     img { max-width: 100%; } \
     pre { background: #f4f4f4; padding: 0.8em; overflow-x: auto; } \
     blockquote { border-left: 3px solid #ccc; padding-left: 1em; color: #555; }";

/// Writes the primary Markdown document.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_markdown(path: &Path, markdown: &str) -> Result<(), EmitError> {
    std::fs::write(path, markdown).context(WriteMarkdownSnafu { path })
}

/// Converts Markdown into a complete sanitized HTML document.
///
/// Raw HTML blocks and inline HTML are stripped; links and images with
/// unsafe schemes (`javascript:`, `data:`, `vbscript:`) lose their
/// wrapper but keep their inner text. The body is wrapped in a minimal
/// fixed-stylesheet page.
#[must_use]
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    // Unsafe links are elided as a pair: the Start is dropped here and a
    // counter tells us to drop the matching End.
    let mut unsafe_links = 0_usize;
    let mut unsafe_images = 0_usize;
    let events = Parser::new_ext(markdown, options).filter(move |event| match event {
        Event::Html(_) | Event::InlineHtml(_) => false,
        Event::Start(Tag::Link { dest_url, .. }) if !is_safe_target(dest_url) => {
            unsafe_links += 1;
            false
        }
        Event::End(TagEnd::Link) if unsafe_links > 0 => {
            unsafe_links -= 1;
            false
        }
        Event::Start(Tag::Image { dest_url, .. }) if !is_safe_target(dest_url) => {
            unsafe_images += 1;
            false
        }
        Event::End(TagEnd::Image) if unsafe_images > 0 => {
            unsafe_images -= 1;
            false
        }
        _ => true,
    });

    let mut body = String::new();
    html::push_html(&mut body, events);

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <style>{STYLESHEET}</style>\n</head>\n<body>\n{body}</body>\n</html>\n"
    )
}

/// Returns whether a link target may survive sanitization.
///
/// Relative paths, fragments, and the common benign schemes pass; script
/// and data URLs do not.
fn is_safe_target(target: &str) -> bool {
    match target.split(':').next() {
        Some(scheme) if target.contains(':') && !scheme.contains('/') => matches!(
            scheme.to_ascii_lowercase().as_str(),
            "http" | "https" | "mailto" | "file"
        ),
        _ => true,
    }
}

/// Rewrites every local `src` and `href` attribute into an absolute
/// `file://` reference resolved against `base_dir`.
///
/// Scheme-qualified targets and bare fragments are left untouched.
/// Spaces in rewritten paths are percent-encoded. Pure string rewriting;
/// no filesystem access.
#[must_use]
pub fn absolutize_links(html: &str, base_dir: &Path) -> String {
    let rewritten = rewrite_attribute(html, "src", base_dir);
    rewrite_attribute(&rewritten, "href", base_dir)
}

fn rewrite_attribute(html: &str, attr: &str, base_dir: &Path) -> String {
    let needle = format!("{attr}=\"");
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find(&needle) {
        let value_start = start + needle.len();
        let Some(len) = rest[value_start..].find('"') else {
            break;
        };
        let value = &rest[value_start..value_start + len];

        out.push_str(&rest[..value_start]);
        out.push_str(&absolutize_target(value, base_dir));
        out.push('"');
        rest = &rest[value_start + len + 1..];
    }
    out.push_str(rest);
    out
}

fn absolutize_target(target: &str, base_dir: &Path) -> String {
    if target.is_empty() || target.starts_with('#') || has_scheme(target) {
        return target.to_owned();
    }

    // Targets come out of our own Markdown with spaces already encoded;
    // decode before joining so the filesystem path is real, then
    // re-encode the final form.
    let decoded = percent_encoding::percent_decode_str(target)
        .decode_utf8_lossy()
        .into_owned();
    let absolute = base_dir.join(decoded);
    format!("file://{}", paths::encode_for_embedding(&absolute))
}

fn has_scheme(target: &str) -> bool {
    let Some((scheme, _)) = target.split_once(':') else {
        return false;
    };
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// A flattened block of the sanitized HTML, ready for page layout.
#[derive(Debug, PartialEq)]
enum Block {
    Heading(u8, String),
    Paragraph(String),
    Code(String),
    Quote(String),
    ListItem(String),
    Image { src: String },
    Rule,
}

/// Renders sanitized HTML into a fixed-page-size PDF at `path`.
///
/// Layout is deliberately modest: headings, paragraphs, list items,
/// block quotes, code blocks, horizontal rules, and embedded images
/// scaled to the text width (never upscaled). Anything else degrades to
/// plain text.
///
/// # Errors
///
/// Returns an error when the file cannot be created or the document
/// cannot be laid out or saved; callers treat this as "PDF not produced
/// for this conversation" and keep the run going.
pub fn render_pdf(html: &str, path: &Path) -> Result<(), EmitError> {
    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "conversation".to_owned());

    let (doc, first_page, first_layer) =
        PdfDocument::new(&title, Mm(PAGE_WIDTH_MM as f32), Mm(PAGE_HEIGHT_MM as f32), "content");
    let body_font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| render_failed(path, &e))?;
    let bold_font = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| render_failed(path, &e))?;
    let code_font = doc
        .add_builtin_font(BuiltinFont::Courier)
        .map_err(|e| render_failed(path, &e))?;

    let mut layer = doc.get_page(first_page).get_layer(first_layer);
    let mut cursor = PAGE_HEIGHT_MM - MARGIN_MM;

    for block in html_blocks(html) {
        let (font, size, lines, gap) = match &block {
            Block::Heading(level, text) => {
                let size = match *level {
                    1 => 18.0,
                    2 => 15.0,
                    _ => 12.5,
                };
                (&bold_font, size, wrap_text(text, size), 3.0)
            }
            Block::Paragraph(text) | Block::Quote(text) => {
                (&body_font, BODY_PT, wrap_text(text, BODY_PT), 2.5)
            }
            Block::ListItem(text) => {
                let bulleted = format!("• {text}");
                (&body_font, BODY_PT, wrap_text(&bulleted, BODY_PT), 1.0)
            }
            Block::Code(text) => {
                let lines = text
                    .lines()
                    .flat_map(|line| wrap_text(line, CODE_PT))
                    .collect();
                (&code_font, CODE_PT, lines, 2.5)
            }
            Block::Rule => {
                cursor -= 6.0;
                continue;
            }
            Block::Image { src } => {
                cursor = place_image(&doc, &mut layer, &body_font, src, cursor);
                continue;
            }
        };

        let line_height = size * 0.42; // pt to mm, plus leading
        for line in lines {
            if cursor < MARGIN_MM + line_height {
                let (page, new_layer) =
                    doc.add_page(Mm(PAGE_WIDTH_MM as f32), Mm(PAGE_HEIGHT_MM as f32), "content");
                layer = doc.get_page(page).get_layer(new_layer);
                cursor = PAGE_HEIGHT_MM - MARGIN_MM;
            }
            layer.use_text(line, size as f32, Mm(MARGIN_MM as f32), Mm(cursor as f32), font);
            cursor -= line_height;
        }
        cursor -= gap;
    }

    let file = File::create(path).context(CreatePdfFileSnafu { path })?;
    doc.save(&mut BufWriter::new(file))
        .map_err(|e| render_failed(path, &e))
}

fn render_failed(path: &Path, error: &dyn std::fmt::Display) -> EmitError {
    EmitError::RenderFailed {
        path: path.to_path_buf(),
        detail: error.to_string(),
    }
}

/// Embeds an image scaled to the text width, returning the new cursor.
///
/// A missing or undecodable image degrades to its file reference as a
/// text line rather than failing the document.
fn place_image(
    doc: &printpdf::PdfDocumentReference,
    layer: &mut printpdf::PdfLayerReference,
    font: &printpdf::IndirectFontRef,
    src: &str,
    mut cursor: f64,
) -> f64 {
    const DPI: f64 = 96.0;

    let file_path = src.strip_prefix("file://").unwrap_or(src);
    let file_path = percent_encoding::percent_decode_str(file_path)
        .decode_utf8_lossy()
        .into_owned();

    let Ok(decoded) = image_crate::open(&file_path) else {
        layer.use_text(
            format!("[image: {src}]"),
            BODY_PT as f32,
            Mm(MARGIN_MM as f32),
            Mm(cursor as f32),
            font,
        );
        return cursor - BODY_PT * 0.42 - 2.5;
    };

    let (width_px, height_px) = image_crate::GenericImageView::dimensions(&decoded);
    let width_mm = f64::from(width_px) * 25.4 / DPI;
    let height_mm = f64::from(height_px) * 25.4 / DPI;

    // Fit to the text column; never upscale.
    let scale = (TEXT_WIDTH_MM / width_mm).min(1.0);
    let drawn_height = height_mm * scale;

    if cursor - drawn_height < MARGIN_MM {
        let (page, new_layer) =
            doc.add_page(Mm(PAGE_WIDTH_MM as f32), Mm(PAGE_HEIGHT_MM as f32), "content");
        *layer = doc.get_page(page).get_layer(new_layer);
        cursor = PAGE_HEIGHT_MM - MARGIN_MM;
    }

    let image = Image::from_dynamic_image(&decoded);
    image.add_to_layer(
        layer.clone(),
        ImageTransform {
            translate_x: Some(Mm(MARGIN_MM as f32)),
            translate_y: Some(Mm((cursor - drawn_height) as f32)),
            scale_x: Some(scale as f32),
            scale_y: Some(scale as f32),
            dpi: Some(DPI as f32),
            ..Default::default()
        },
    );

    cursor - drawn_height - 4.0
}

/// Flattens sanitized HTML into layout blocks.
///
/// Only the tags our own converter emits are recognized; unknown markup
/// contributes its text content to the surrounding block.
fn html_blocks(html: &str) -> Vec<Block> {
    let body = html
        .split_once("<body>")
        .map_or(html, |(_, rest)| rest)
        .split_once("</body>")
        .map_or(html, |(body, _)| body);

    let mut blocks = Vec::new();
    let mut rest = body;

    while let Some(open) = rest.find('<') {
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        let tag = &rest[open + 1..open + close];
        rest = &rest[open + close + 1..];

        let (name, attrs) = tag
            .split_once(char::is_whitespace)
            .map_or((tag, ""), |(n, a)| (n, a));

        match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name.as_bytes()[1] - b'0';
                let (text, after) = take_until_close(rest, name);
                rest = after;
                blocks.push(Block::Heading(level, text));
            }
            "p" => {
                let (raw, after) = raw_until_close(rest, "p");
                rest = after;
                let text = flatten_text(raw);
                // A paragraph that was only an image wrapper contributes
                // nothing textual.
                if !text.is_empty() {
                    blocks.push(Block::Paragraph(text));
                }
                push_nested_images(raw, &mut blocks);
            }
            "li" => {
                let (raw, after) = raw_until_close(rest, "li");
                rest = after;
                let text = flatten_text(raw);
                if !text.is_empty() {
                    blocks.push(Block::ListItem(text));
                }
                push_nested_images(raw, &mut blocks);
            }
            "blockquote" => {
                let (raw, after) = raw_until_close(rest, "blockquote");
                rest = after;
                let text = flatten_text(raw);
                if !text.is_empty() {
                    blocks.push(Block::Quote(text));
                }
                push_nested_images(raw, &mut blocks);
            }
            "pre" => {
                let (raw, after) = raw_until_close(rest, "pre");
                rest = after;
                blocks.push(Block::Code(decode_entities(&strip_tags(raw))));
            }
            "img" => {
                if let Some(src) = attribute_value(attrs, "src") {
                    blocks.push(Block::Image {
                        src: decode_entities(&src),
                    });
                }
            }
            "hr" | "hr/" | "hr /" => blocks.push(Block::Rule),
            _ => {}
        }
    }

    blocks
}

/// Collects flattened text up to the matching close tag.
fn take_until_close<'a>(rest: &'a str, name: &str) -> (String, &'a str) {
    let (raw, after) = raw_until_close(rest, name);
    (flatten_text(raw), after)
}

fn flatten_text(raw: &str) -> String {
    decode_entities(&strip_tags(raw)).trim().to_owned()
}

/// Images nested inside a text block become their own layout blocks,
/// placed after the block's text.
fn push_nested_images(raw: &str, blocks: &mut Vec<Block>) {
    let mut rest = raw;
    while let Some(pos) = rest.find("<img ") {
        rest = &rest[pos + 5..];
        let Some(end) = rest.find('>') else {
            break;
        };
        if let Some(src) = attribute_value(&rest[..end], "src") {
            blocks.push(Block::Image {
                src: decode_entities(&src),
            });
        }
        rest = &rest[end + 1..];
    }
}

fn raw_until_close<'a>(rest: &'a str, name: &str) -> (&'a str, &'a str) {
    let close = format!("</{name}>");
    match rest.find(&close) {
        Some(pos) => (&rest[..pos], &rest[pos + close.len()..]),
        None => (rest, ""),
    }
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn attribute_value(attrs: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = attrs.find(&needle)? + needle.len();
    let len = attrs[start..].find('"')?;
    Some(attrs[start..start + len].to_owned())
}

/// Greedy word wrap against an approximate character budget for the
/// column width at the given point size.
fn wrap_text(text: &str, point_size: f64) -> Vec<String> {
    // Average glyph width for Helvetica runs about half the point size;
    // one pt is 0.3528 mm.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let max_chars = ((TEXT_WIDTH_MM / (point_size * 0.5 * 0.3528)) as usize).max(8);

    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        // A single over-long word is hard-split rather than overflowing.
        if word.chars().count() > max_chars {
            for chunk in word
                .chars()
                .collect::<Vec<_>>()
                .chunks(max_chars)
                .map(|c| c.iter().collect::<String>())
            {
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
                current = chunk;
            }
        } else {
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn converts_headings_and_paragraphs() {
        let html = markdown_to_html("# Title\n\nSome text.\n");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<p>Some text.</p>"));
        assert!(html.contains("<style>"));
    }

    #[test]
    fn strips_raw_html() {
        let html = markdown_to_html("before\n\n<script>alert(1)</script>\n\nafter\n");
        assert!(!html.contains("<script>"));
        assert!(html.contains("before"));
        assert!(html.contains("after"));
    }

    #[test]
    fn strips_inline_html() {
        let html = markdown_to_html("a <b onclick=\"x\">bold</b> word\n");
        assert!(!html.contains("onclick"));
        assert!(html.contains("bold"));
    }

    #[test]
    fn drops_javascript_links_but_keeps_text() {
        let html = markdown_to_html("[click me](javascript:alert(1))\n");
        assert!(!html.contains("javascript:"));
        assert!(html.contains("click me"));
    }

    #[test]
    fn keeps_https_links() {
        let html = markdown_to_html("[docs](https://example.com/docs)\n");
        assert!(html.contains("href=\"https://example.com/docs\""));
    }

    #[test]
    fn keeps_relative_image_sources() {
        let html = markdown_to_html("![pic](chat_assets/pic.png)\n");
        assert!(html.contains("src=\"chat_assets/pic.png\""));
    }

    #[test]
    fn absolutizes_relative_src_and_href() {
        let html = r#"<img src="chat_assets/pic.png" alt="p"><a href="chat_assets/pic.png">x</a>"#;
        let out = absolutize_links(html, Path::new("/out"));
        assert!(out.contains(r#"src="file:///out/chat_assets/pic.png""#));
        assert!(out.contains(r#"href="file:///out/chat_assets/pic.png""#));
    }

    #[test]
    fn leaves_external_and_fragment_links_alone() {
        let html = r##"<a href="https://example.com">x</a><a href="#top">y</a>"##;
        let out = absolutize_links(html, Path::new("/out"));
        assert_eq!(out, html);
    }

    #[test]
    fn percent_encodes_spaces_when_absolutizing() {
        let html = r#"<img src="chat_assets/my%20pic.png">"#;
        let out = absolutize_links(html, Path::new("/out dir"));
        assert!(out.contains(r#"src="file:///out%20dir/chat_assets/my%20pic.png""#));
    }

    #[test]
    fn absolutize_is_pure_of_missing_files() {
        // None of these paths exist; the rewrite must not care.
        let html = r#"<img src="nowhere/gone.png">"#;
        let out = absolutize_links(html, Path::new("/void"));
        assert!(out.contains("file:///void/nowhere/gone.png"));
    }

    #[test]
    fn html_blocks_flattens_structure() {
        let html = "<h2>Role</h2>\n<p>Hello <em>there</em></p>\n<pre><code>let x = 1;\n</code></pre>";
        let blocks = html_blocks(html);
        assert_eq!(blocks[0], Block::Heading(2, "Role".into()));
        assert_eq!(blocks[1], Block::Paragraph("Hello there".into()));
        assert_eq!(blocks[2], Block::Code("let x = 1;\n".into()));
    }

    #[test]
    fn html_blocks_extracts_image_sources() {
        let blocks = html_blocks(r#"<p><img src="file:///a/b.png" alt="b" /></p>"#);
        assert!(blocks.contains(&Block::Image {
            src: "file:///a/b.png".into()
        }));
    }

    #[test]
    fn wrap_text_respects_line_width() {
        let lines = wrap_text(&"word ".repeat(50), BODY_PT);
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.chars().count() <= 100);
        }
    }

    #[test]
    fn wrap_text_hard_splits_long_words() {
        let lines = wrap_text(&"x".repeat(400), BODY_PT);
        assert!(lines.len() > 2);
    }

    #[test]
    fn renders_a_pdf_file() {
        let dir = TempDir::new().unwrap();
        let pdf_path = dir.path().join("chat.pdf");
        let html = markdown_to_html("# Hello\n\nBody text.\n");

        render_pdf(&html, &pdf_path).unwrap();

        let bytes = std::fs::read(&pdf_path).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn pdf_survives_missing_images() {
        let dir = TempDir::new().unwrap();
        let pdf_path = dir.path().join("chat.pdf");
        let html = r#"<p>text</p><img src="file:///not/here.png">"#;

        render_pdf(html, &pdf_path).unwrap();
        assert!(pdf_path.exists());
    }

    #[test]
    fn markdown_format_flags() {
        assert!(OutputFormat::Markdown.wants_markdown());
        assert!(!OutputFormat::Markdown.wants_pdf());
        assert!(OutputFormat::Pdf.wants_pdf());
        assert!(OutputFormat::Both.wants_markdown());
        assert!(OutputFormat::Both.wants_pdf());
    }
}
