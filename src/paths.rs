// SPDX-License-Identifier: GPL-3.0-only

//! Filename and path derivation for exported documents.
//!
//! Conversation titles come from users and contain arbitrary text;
//! [`slugify`] turns them into filesystem-safe stems. [`unique_path`] and
//! [`unique_dir`] add numeric suffixes so a re-run into a non-empty output
//! directory never overwrites previous output. [`relative_path`] produces
//! the link targets embedded in Markdown, relative to the document that
//! references them.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::path::{Component, Path, PathBuf};

/// Maximum length of a slug derived from a title.
const MAX_SLUG_LEN: usize = 120;

/// Characters percent-encoded when a path is embedded in markup.
const EMBED_SET: &AsciiSet = &CONTROLS.add(b' ');

/// Derives a filesystem-safe stem from a conversation title.
///
/// Lowercases, collapses every run of non-alphanumeric characters to a
/// single `-`, and caps the result at 120 characters. A title that leaves
/// nothing usable falls back to `conversation-<sequence>`.
#[must_use]
pub fn slugify(title: &str, sequence: usize) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;

    for c in title.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            for lower in c.to_lowercase() {
                slug.push(lower);
            }
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }

    // Pop rather than truncate: the cap may land inside a multi-byte char.
    while slug.len() > MAX_SLUG_LEN {
        slug.pop();
    }
    if slug.is_empty() {
        format!("conversation-{sequence}")
    } else {
        slug
    }
}

/// Returns a path in `directory` for `stem` + `extension` that does not
/// exist yet, appending `-1`, `-2`, ... as needed.
///
/// Racy against concurrent writers; acceptable for a single-threaded,
/// single-process run.
#[must_use]
pub fn unique_path(directory: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = directory.join(format!("{stem}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }
    for n in 1.. {
        let candidate = directory.join(format!("{stem}-{n}.{extension}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

/// Returns a directory path at `base`, suffixing `-1`, `-2`, ... while a
/// non-directory occupies the candidate name.
///
/// An existing directory is returned as-is so repeated assets of one
/// conversation land together. The directory itself is not created here.
#[must_use]
pub fn unique_dir(base: &Path) -> PathBuf {
    if !base.exists() || base.is_dir() {
        return base.to_path_buf();
    }
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = base.parent().unwrap_or_else(|| Path::new(""));
    for n in 1.. {
        let candidate = parent.join(format!("{name}-{n}"));
        if !candidate.exists() || candidate.is_dir() {
            return candidate;
        }
    }
    unreachable!()
}

/// Computes a relative path from `from_file`'s directory to `to_file`.
///
/// Strips the common prefix, emits one `..` per remaining ancestor of the
/// source directory, then the remaining descent. Falls back to the
/// target's base name when no relation can be computed (different roots,
/// no file name).
#[must_use]
pub fn relative_path(from_file: &Path, to_file: &Path) -> PathBuf {
    let from_dir = from_file.parent().unwrap_or_else(|| Path::new(""));

    let from_components: Vec<Component<'_>> = from_dir.components().collect();
    let to_components: Vec<Component<'_>> = to_file.components().collect();

    let common = from_components
        .iter()
        .zip(&to_components)
        .take_while(|(a, b)| a == b)
        .count();

    // Absolute paths that share no component live on unrelated roots.
    if common == 0 && (from_dir.is_absolute() || to_file.is_absolute()) {
        return to_file
            .file_name()
            .map_or_else(|| to_file.to_path_buf(), PathBuf::from);
    }

    let mut relative = PathBuf::new();
    for _ in common..from_components.len() {
        relative.push("..");
    }
    for component in &to_components[common..] {
        relative.push(component);
    }

    if relative.as_os_str().is_empty() {
        return to_file
            .file_name()
            .map_or_else(|| to_file.to_path_buf(), PathBuf::from);
    }
    relative
}

/// Percent-encodes a path for embedding in Markdown or HTML (spaces and
/// control characters).
#[must_use]
pub fn encode_for_embedding(path: &Path) -> String {
    let text = path.to_string_lossy();
    // Keep `/` separators; Markdown links use forward slashes throughout.
    let normalized = text.replace('\\', "/");
    utf8_percent_encode(&normalized, EMBED_SET).to_string()
}
