// SPDX-License-Identifier: GPL-3.0-only

//! Command-line interface for gpt2md.
//!
//! This binary provides the `gpt2md` command for converting ChatGPT
//! conversation exports into per-conversation Markdown and PDF files.

use gpt2md::{
    assets::AssetCache,
    emit::{self, OutputFormat},
    parser::ConversationRecord,
    paths, renderer,
    renderer::{AttachmentMode, RenderContext, RenderOptions},
    stream::RecordStream,
};
use lexopt::prelude::*;
use snafu::{ensure, prelude::*};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

struct Cli {
    input: PathBuf,
    output: PathBuf,
    assets: Option<PathBuf>,
    format: OutputFormat,
    attachments: AttachmentMode,
    thumb_width: u32,
    quiet: bool,
    dry_run: bool,
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to parse arguments: {source}"))]
    ParseArgs { source: lexopt::Error },

    #[snafu(display("an input file or export directory is required"))]
    NoInput,

    #[snafu(display("no conversations.json found under {}", path.display()))]
    NoExportFile { path: PathBuf },

    #[snafu(display("output path {} exists and is not a directory", path.display()))]
    OutputNotDirectory { path: PathBuf },

    #[snafu(display("failed to create output directory: {source}"))]
    CreateOutputDir { source: std::io::Error },

    #[snafu(display("failed to read {}: {source}", path.display()))]
    OpenExport {
        path: PathBuf,
        source: gpt2md::stream::StreamError,
    },

    #[snafu(display("malformed export: {source}"))]
    MalformedExport { source: gpt2md::stream::StreamError },
}

fn print_help() {
    println!(
        "\
{name} {version}
Convert ChatGPT conversation exports to Markdown and PDF

Usage: {name} [OPTIONS] -o <OUTPUT> <INPUT>

Arguments:
  <INPUT>  conversations.json, or an export directory containing one

Options:
  -o, --output <DIR>       Output directory (created if absent)
      --assets <DIR>       Attachment source directory (default: input's directory)
      --format <FORMAT>    Output format: md, pdf, or both (default: md)
      --attachments <M>    Attachment handling: copy or reference (default: copy)
      --thumb-width <N>    Max thumbnail width in pixels, 0 disables (default: 0)
  -q, --quiet              Suppress per-conversation progress messages
  -n, --dry-run            Show what would be written without writing
  -h, --help               Print help
  -V, --version            Print version",
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
    );
}

fn parse_args() -> Result<Cli, lexopt::Error> {
    // Show help if no arguments provided
    if std::env::args().len() == 1 {
        print_help();
        std::process::exit(0);
    }

    let mut input: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut assets = None;
    let mut format = OutputFormat::Markdown;
    let mut attachments = AttachmentMode::Copy;
    let mut thumb_width: u32 = 0;
    let mut quiet = false;
    let mut dry_run = false;

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Short('o') | Long("output") => output = Some(parser.value()?.parse()?),
            Long("assets") => assets = Some(parser.value()?.parse()?),
            Long("format") => {
                format = match parser.value()?.string()?.as_str() {
                    "md" => OutputFormat::Markdown,
                    "pdf" => OutputFormat::Pdf,
                    "both" => OutputFormat::Both,
                    _ => return Err("format must be md, pdf, or both".into()),
                };
            }
            Long("attachments") => {
                attachments = match parser.value()?.string()?.as_str() {
                    "copy" => AttachmentMode::Copy,
                    "reference" => AttachmentMode::Reference,
                    _ => return Err("attachments must be copy or reference".into()),
                };
            }
            Long("thumb-width") => {
                thumb_width = parser
                    .value()?
                    .parse()
                    .map_err(|_| "thumb-width must be a number")?;
            }
            Short('q') | Long("quiet") => quiet = true,
            Short('n') | Long("dry-run") => dry_run = true,
            Short('h') | Long("help") => {
                print_help();
                std::process::exit(0);
            }
            Short('V') | Long("version") => {
                println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            Value(val) if input.is_none() => input = Some(val.parse()?),
            _ => return Err(arg.unexpected()),
        }
    }

    Ok(Cli {
        input: input.ok_or("missing required input path")?,
        output: output.ok_or("missing required option: --output")?,
        assets,
        format,
        attachments,
        thumb_width,
        quiet,
        dry_run,
    })
}

fn main() -> Result<(), Error> {
    let cli = parse_args().context(ParseArgsSnafu)?;

    ensure!(!cli.input.as_os_str().is_empty(), NoInputSnafu);

    let export_file = locate_export_file(&cli.input)?;

    // Attachments default to living next to the export file.
    let asset_source = cli
        .assets
        .clone()
        .or_else(|| export_file.parent().map(Path::to_path_buf));

    if cli.output.exists() {
        ensure!(
            cli.output.is_dir(),
            OutputNotDirectorySnafu { path: &cli.output }
        );
    } else if !cli.dry_run {
        std::fs::create_dir_all(&cli.output).context(CreateOutputDirSnafu)?;
    }

    let records = RecordStream::open(&export_file).context(OpenExportSnafu {
        path: &export_file,
    })?;

    let mut cache = AssetCache::new();
    let options = RenderOptions {
        attachments: cli.attachments,
        thumb_width: cli.thumb_width,
    };

    let mut discovered = 0_usize;
    let mut exported = 0_usize;

    for value in records {
        let value = value.context(MalformedExportSnafu)?;
        discovered += 1;

        if !value.is_object() {
            eprintln!("Warning: conversation {discovered} is not an object, emitting placeholder");
        }
        let record = ConversationRecord::from_value(&value);

        if export_conversation(
            &record,
            discovered,
            asset_source.as_deref(),
            &mut cache,
            &options,
            &cli,
        ) {
            exported += 1;
        }
    }

    // The final count prints regardless of --quiet.
    eprintln!("Exported {exported} of {discovered} conversations");
    Ok(())
}

/// Finds the export's conversations.json.
///
/// A file input is used as-is; a directory input is searched recursively,
/// preferring the shallowest match.
fn locate_export_file(input: &Path) -> Result<PathBuf, Error> {
    if !input.is_dir() {
        return Ok(input.to_path_buf());
    }

    let direct = input.join("conversations.json");
    if direct.is_file() {
        return Ok(direct);
    }

    WalkDir::new(input)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|e| e.file_type().is_file() && e.file_name() == "conversations.json")
        .map(|e| e.path().to_path_buf())
        .context(NoExportFileSnafu { path: input })
}

/// Writes one conversation's requested output formats.
///
/// Returns whether the conversation counts as exported. Asset and PDF
/// trouble degrades with a warning; only failing to write the primary
/// Markdown file (or, for `--format pdf`, the PDF) loses the conversation.
fn export_conversation(
    record: &ConversationRecord,
    sequence: usize,
    asset_source: Option<&Path>,
    cache: &mut AssetCache,
    options: &RenderOptions,
    cli: &Cli,
) -> bool {
    let slug = paths::slugify(record.title.as_deref().unwrap_or(""), sequence);

    if cli.dry_run {
        eprintln!("Would write {}", cli.output.join(format!("{slug}.md")).display());
        return true;
    }

    let md_path = paths::unique_path(&cli.output, &slug, "md");
    let stem = md_path
        .file_stem()
        .map_or_else(|| slug.clone(), |s| s.to_string_lossy().into_owned());
    let conversation_assets = paths::unique_dir(&cli.output.join(format!("{stem}_assets")));

    let mut ctx = RenderContext {
        output_path: &md_path,
        asset_source,
        conversation_assets,
        cache,
        options,
        warnings: Vec::new(),
    };
    let markdown = renderer::render_conversation(record, sequence, &mut ctx);
    for warning in &ctx.warnings {
        eprintln!("Warning: {warning}");
    }

    if cli.format.wants_markdown() {
        if let Err(e) = emit::write_markdown(&md_path, &markdown) {
            eprintln!("Warning: {e}");
            return false;
        }
        if !cli.quiet {
            eprintln!("Wrote {}", md_path.display());
        }
    }

    if cli.format.wants_pdf() {
        // file:// references need absolute paths.
        let base_dir = md_path.parent().unwrap_or(Path::new("."));
        let base_dir = std::fs::canonicalize(base_dir).unwrap_or_else(|_| base_dir.to_path_buf());
        let html = emit::absolutize_links(&emit::markdown_to_html(&markdown), &base_dir);
        let pdf_path = paths::unique_path(&cli.output, &stem, "pdf");

        if let Err(e) = emit::render_pdf(&html, &pdf_path) {
            eprintln!("Warning: {e}");
            // PDF-only runs have produced nothing for this conversation.
            return cli.format.wants_markdown();
        }
        if !cli.quiet {
            eprintln!("Wrote {}", pdf_path.display());
        }
    }

    true
}
