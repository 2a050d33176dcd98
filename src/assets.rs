// SPDX-License-Identifier: GPL-3.0-only

//! Attachment resolution, copying, and thumbnail generation.
//!
//! An export references attachments through opaque pointers like
//! `file-service://file-AbC123`; the actual files sit next to the export
//! with that base name plus an unknown suffix (the original filename and
//! extension). [`resolve_pointer`] finds the file; [`AssetCache`]
//! remembers what has already been copied or thumbnailed in this run so a
//! source referenced from several messages lands in the output exactly
//! once.
//!
//! All failures here are non-fatal to the export: callers degrade to the
//! original path (copy failure) or to no thumbnail (decode/encode
//! failure) and keep going.

use image::GenericImageView;
use image::imageops::FilterType;
use snafu::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Error type for attachment handling failures.
#[derive(Debug, Snafu)]
pub enum AssetError {
    /// A per-conversation asset directory could not be created.
    #[snafu(display("failed to create asset directory {}: {source}", path.display()))]
    CreateAssetDir {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Copying an attachment into the asset directory failed.
    #[snafu(display("failed to copy {}: {source}", path.display()))]
    CopyFailed {
        /// The source file that could not be copied.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Decoding a source image for thumbnailing failed.
    #[snafu(display("failed to decode image {}: {source}", path.display()))]
    ThumbnailDecode {
        /// The image that could not be decoded.
        path: PathBuf,
        /// The underlying image error.
        source: image::ImageError,
    },

    /// Writing a generated thumbnail failed.
    #[snafu(display("failed to write thumbnail {}: {source}", path.display()))]
    ThumbnailEncode {
        /// The thumbnail that could not be written.
        path: PathBuf,
        /// The underlying image error.
        source: image::ImageError,
    },
}

/// Per-run memory of copied assets and generated thumbnails.
///
/// Both maps key on the source path and are owned by the single export
/// pass; tests construct a fresh cache per run so state never leaks
/// between invocations. A cached destination is trusted only while it
/// still exists on disk.
#[derive(Debug, Default)]
pub struct AssetCache {
    copied: HashMap<PathBuf, PathBuf>,
    thumbnails: HashMap<PathBuf, PathBuf>,
}

/// Locates the attachment file a pointer refers to.
///
/// The pointer's base name is its final `/`-separated segment; the match
/// is any file in `asset_dir` whose name starts with that base. When
/// several files match, the lexicographically smallest name wins, so
/// resolution is deterministic across filesystems.
#[must_use]
pub fn resolve_pointer(pointer: &str, asset_dir: &Path) -> Option<PathBuf> {
    let base = pointer.rsplit('/').next().unwrap_or(pointer);
    if base.is_empty() || !asset_dir.is_dir() {
        return None;
    }

    let mut best: Option<(String, PathBuf)> = None;
    for entry in fs::read_dir(asset_dir).ok()?.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(base) && best.as_ref().is_none_or(|(current, _)| name < current.as_str()) {
            best = Some((name.to_owned(), path));
        }
    }
    best.map(|(_, path)| path)
}

impl AssetCache {
    /// Creates an empty cache for one export run.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `source` into `asset_dir`, reusing an earlier copy of the
    /// same source when it still exists on disk.
    ///
    /// The destination keeps the source's file name, suffixed `-1`, `-2`,
    /// ... if taken. The directory is created on first use.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or the copy
    /// fails; callers fall back to the original path.
    pub fn copy_to_assets(
        &mut self,
        source: &Path,
        asset_dir: &Path,
    ) -> Result<PathBuf, AssetError> {
        if let Some(dest) = self.copied.get(source)
            && dest.exists()
        {
            return Ok(dest.clone());
        }

        fs::create_dir_all(asset_dir).context(CreateAssetDirSnafu { path: asset_dir })?;

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_owned());
        let dest = unique_destination(asset_dir, &name);

        fs::copy(source, &dest).context(CopyFailedSnafu { path: source })?;
        self.copied.insert(source.to_path_buf(), dest.clone());
        Ok(dest)
    }

    /// Generates a width-capped thumbnail of `source` under
    /// `asset_dir/thumbnails`, reusing a cached one when possible.
    ///
    /// Returns `Ok(None)` without touching the filesystem when
    /// `max_width` is zero or the source is missing. Images narrower than
    /// `max_width` are written at their original size, never upscaled.
    /// Orientation metadata is applied before scaling. Thumbnails are
    /// always encoded as PNG.
    ///
    /// # Errors
    ///
    /// Returns an error when decode or encode fails; callers treat that
    /// as "no thumbnail" and embed the full image instead.
    #[allow(clippy::cast_possible_truncation)]
    pub fn make_thumbnail(
        &mut self,
        source: &Path,
        asset_dir: &Path,
        max_width: u32,
    ) -> Result<Option<PathBuf>, AssetError> {
        if max_width == 0 || !source.exists() {
            return Ok(None);
        }

        if let Some(dest) = self.thumbnails.get(source)
            && dest.exists()
        {
            return Ok(Some(dest.clone()));
        }

        let decoded = image::open(source).context(ThumbnailDecodeSnafu { path: source })?;
        let oriented = apply_orientation(decoded, source);

        let (width, height) = oriented.dimensions();
        let scaled = if width > max_width {
            let target_height =
                ((u64::from(height) * u64::from(max_width)) / u64::from(width)).max(1) as u32;
            oriented.resize_exact(max_width, target_height, FilterType::Lanczos3)
        } else {
            oriented
        };

        let thumb_dir = asset_dir.join("thumbnails");
        fs::create_dir_all(&thumb_dir).context(CreateAssetDirSnafu { path: &thumb_dir })?;

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "thumbnail".to_owned());
        let dest = unique_destination(&thumb_dir, &format!("{stem}.png"));

        scaled
            .save(&dest)
            .context(ThumbnailEncodeSnafu { path: &dest })?;
        self.thumbnails.insert(source.to_path_buf(), dest.clone());
        Ok(Some(dest))
    }
}

/// Applies EXIF orientation correction, if the source carries any.
fn apply_orientation(img: image::DynamicImage, source: &Path) -> image::DynamicImage {
    let Ok(file) = fs::File::open(source) else {
        return img;
    };
    let mut reader = io::BufReader::new(file);
    let Ok(metadata) = exif::Reader::new().read_from_container(&mut reader) else {
        return img;
    };
    let Some(field) = metadata.get_field(exif::Tag::Orientation, exif::In::PRIMARY) else {
        return img;
    };

    match field.value.get_uint(0) {
        Some(2) => img.fliph(),
        Some(3) => img.rotate180(),
        Some(4) => img.flipv(),
        Some(5) => img.rotate90().fliph(),
        Some(6) => img.rotate90(),
        Some(7) => img.rotate270().fliph(),
        Some(8) => img.rotate270(),
        _ => img,
    }
}

/// Picks a name in `dir` for `file_name` that is not taken, using the
/// `name-N.ext` scheme.
fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };
    for n in 1.. {
        let name = match ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}
