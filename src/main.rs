use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use colored::*;
use lofty::config::{ParseOptions, WriteOptions};
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, ItemValue, Tag, TagItem, TagType};
use rayon::prelude::*;
use reqwest::blocking::Client;
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "ncm-tagfix", about = "Restore tags on FLAC/MP3 files decrypted from NCM containers")]
struct Args {
    /// Files or directories to process (directories are not recursed into)
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Number of parallel workers
    #[arg(long, default_value = "16")]
    threads: usize,

    /// Skip cover art download and embedding
    #[arg(long)]
    skip_covers: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
enum TagfixError {
    #[error("base64 decode failed: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("cipher error: {0}")]
    Cipher(&'static str),

    /// The file never went through an NCM container; nothing to recover.
    #[error("no embedded key comment found")]
    KeyNotFound,

    #[error("unexpected payload format: {0}")]
    Format(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tag error: {0}")]
    Tag(#[from] lofty::error::LoftyError),
}

// ---------------------------------------------------------------------------
// Key comment decryption
// ---------------------------------------------------------------------------

/// AES-128 key the NCM tooling uses for the leftover tag comment. Publicly
/// known (shipped in every ncmdump variant); it only reverses obfuscation.
const META_KEY: [u8; 16] = [
    0x23, 0x31, 0x34, 0x6C, 0x6A, 0x6B, 0x5F, 0x21, 0x5C, 0x5D, 0x26, 0x30, 0x55, 0x3C, 0x27,
    0x28,
];

const KEY_COMMENT_MARKER: &str = "163 key";
const KEY_COMMENT_PREFIX: &str = "163 key(Don't modify):";

/// Decrypted payloads start with a fixed "music:" header before the JSON.
const PAYLOAD_HEADER_LEN: usize = 6;

const AES_BLOCK_LEN: usize = 16;

fn strip_pkcs7(mut buf: Vec<u8>) -> Result<Vec<u8>, TagfixError> {
    let pad = *buf.last().ok_or(TagfixError::Cipher("empty plaintext"))? as usize;
    if pad == 0 || pad > AES_BLOCK_LEN || pad > buf.len() {
        return Err(TagfixError::Cipher("invalid PKCS#7 padding"));
    }
    buf.truncate(buf.len() - pad);
    Ok(buf)
}

/// Base64-decode and AES-128-ECB-decrypt an embedded key comment blob,
/// returning the padding-stripped plaintext.
fn decrypt_key_blob(blob: &str) -> Result<Vec<u8>, TagfixError> {
    let ciphertext = BASE64.decode(blob.trim())?;
    if ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(TagfixError::Cipher("ciphertext is not block-aligned"));
    }

    let cipher = Aes128::new(GenericArray::from_slice(&META_KEY));
    let mut plain = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks_exact(AES_BLOCK_LEN) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        plain.extend_from_slice(&block);
    }

    strip_pkcs7(plain)
}

// ---------------------------------------------------------------------------
// Recovered metadata
// ---------------------------------------------------------------------------

/// Canonical record recovered from the key comment. Every field is
/// absent-or-non-empty; an empty string never stands in for "missing".
#[derive(Debug, Clone, Default)]
struct RecoveredMeta {
    title: Option<String>,
    album: Option<String>,
    artists: Vec<String>,
    cover_url: Option<String>,
}

fn string_field(
    obj: &serde_json::Map<String, JsonValue>,
    key: &str,
) -> Result<Option<String>, TagfixError> {
    match obj.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.is_empty() => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(TagfixError::Format(format!(
            "field '{}' is not a string",
            key
        ))),
    }
}

/// The `artist` field is a list of `[name, id]` pairs; only the names are
/// kept, in their original order. A malformed entry is an error for this
/// file, not something to silently drop.
fn artist_names(value: Option<&JsonValue>) -> Result<Vec<String>, TagfixError> {
    let entries = match value {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(JsonValue::Array(entries)) => entries,
        Some(_) => return Err(TagfixError::Format("field 'artist' is not a list".into())),
    };

    let mut names = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry
            .as_array()
            .and_then(|pair| pair.first())
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                TagfixError::Format("artist entry is not a [name, id] pair".into())
            })?;
        if !name.is_empty() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn project_meta(doc: &JsonValue) -> Result<RecoveredMeta, TagfixError> {
    let obj = doc
        .as_object()
        .ok_or_else(|| TagfixError::Format("payload is not a JSON object".into()))?;

    Ok(RecoveredMeta {
        title: string_field(obj, "musicName")?,
        album: string_field(obj, "album")?,
        artists: artist_names(obj.get("artist"))?,
        cover_url: string_field(obj, "albumPic")?,
    })
}

fn parse_key_comment(comment: &str) -> Result<RecoveredMeta, TagfixError> {
    let blob = comment.strip_prefix(KEY_COMMENT_PREFIX).unwrap_or(comment);
    let plain = decrypt_key_blob(blob)?;
    if plain.len() <= PAYLOAD_HEADER_LEN {
        return Err(TagfixError::Format("payload shorter than its header".into()));
    }

    let doc: JsonValue = serde_json::from_slice(&plain[PAYLOAD_HEADER_LEN..])
        .map_err(|e| TagfixError::Format(e.to_string()))?;
    project_meta(&doc)
}

// ---------------------------------------------------------------------------
// Container handling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerKind {
    Flac,
    Mp3,
}

impl ContainerKind {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "flac" => Some(ContainerKind::Flac),
            "mp3" => Some(ContainerKind::Mp3),
            _ => None,
        }
    }

    /// Where the NCM tooling leaves the key comment in this format.
    fn comment_key(self) -> ItemKey {
        match self {
            ContainerKind::Flac => ItemKey::Description,
            ContainerKind::Mp3 => ItemKey::Comment,
        }
    }
}

/// The `.ncm` companion convention: if the source container still sits next
/// to the audio file, the file is not ours to touch.
fn has_ncm_sibling(path: &Path) -> bool {
    path.with_extension("ncm").exists()
}

fn find_key_comment<'a>(tags: &'a [Tag], key: &ItemKey) -> Option<&'a str> {
    for tag in tags {
        for item in tag.items() {
            if item.key() != key {
                continue;
            }
            if let ItemValue::Text(text) = item.value() {
                if text.starts_with(KEY_COMMENT_MARKER) {
                    return Some(text);
                }
            }
        }
    }
    None
}

fn recover_meta(tags: &[Tag], kind: ContainerKind) -> Result<RecoveredMeta, TagfixError> {
    let comment =
        find_key_comment(tags, &kind.comment_key()).ok_or(TagfixError::KeyNotFound)?;
    parse_key_comment(comment)
}

// ---------------------------------------------------------------------------
// Cover art fetching
// ---------------------------------------------------------------------------

const COVER_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const PNG_MAGIC: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

/// MIME sentinel meaning "the picture payload is a URL, not image bytes".
const URL_MIME_SENTINEL: &str = "-->";

#[derive(Debug, Clone, PartialEq)]
enum CoverPayload {
    Image { data: Vec<u8>, mime: MimeType },
    UrlReference { url: Vec<u8> },
}

fn has_png_magic(data: &[u8]) -> bool {
    data.len() >= PNG_MAGIC.len() && data[..PNG_MAGIC.len()] == PNG_MAGIC
}

fn http_get(client: &Client, url: &str) -> Result<Vec<u8>, TagfixError> {
    let resp = client
        .get(url)
        .send()
        .map_err(|e| TagfixError::Fetch(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(TagfixError::Fetch(format!("remote returned {}", resp.status())));
    }
    let body = resp.bytes().map_err(|e| TagfixError::Fetch(e.to_string()))?;
    Ok(body.to_vec())
}

/// Download a cover image. Failures degrade to a URL reference so the
/// picture slot still records where the art lives.
fn fetch_cover(client: &Client, url: &str) -> CoverPayload {
    match http_get(client, url) {
        Ok(data) => {
            let mime = if has_png_magic(&data) {
                MimeType::Png
            } else {
                MimeType::Jpeg
            };
            CoverPayload::Image { data, mime }
        }
        Err(e) => {
            eprintln!(
                "  {} cover fetch failed ({}), keeping URL reference",
                "→".yellow(),
                e
            );
            CoverPayload::UrlReference {
                url: url.as_bytes().to_vec(),
            }
        }
    }
}

fn cover_picture(payload: CoverPayload) -> Picture {
    match payload {
        CoverPayload::Image { data, mime } => Picture::new_unchecked(
            PictureType::CoverFront,
            Some(mime),
            Some("Front cover".to_string()),
            data,
        ),
        CoverPayload::UrlReference { url } => Picture::new_unchecked(
            PictureType::CoverFront,
            Some(MimeType::Unknown(URL_MIME_SENTINEL.to_string())),
            Some("Front cover".to_string()),
            url,
        ),
    }
}

// ---------------------------------------------------------------------------
// Tag backfill
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum CoverNote {
    Embedded,
    UrlReference,
}

#[derive(Debug, Clone, Copy, Default)]
struct BackfillReport {
    title: bool,
    album: bool,
    artists: bool,
    cover: Option<CoverNote>,
}

impl BackfillReport {
    fn changed(&self) -> bool {
        self.title || self.album || self.artists || self.cover.is_some()
    }

    fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.title {
            parts.push("title");
        }
        if self.album {
            parts.push("album");
        }
        if self.artists {
            parts.push("artist");
        }
        match self.cover {
            Some(CoverNote::Embedded) => parts.push("cover"),
            Some(CoverNote::UrlReference) => parts.push("cover URL"),
            None => {}
        }
        parts.join(", ")
    }
}

fn text_missing(tag: &Tag, key: &ItemKey) -> bool {
    tag.get_string(key).map(str::trim).map_or(true, str::is_empty)
}

fn has_artist_entries(tag: &Tag) -> bool {
    tag.items().any(|item| {
        item.key() == &ItemKey::TrackArtist
            && matches!(item.value(), ItemValue::Text(text) if !text.trim().is_empty())
    })
}

/// Fill in whatever the existing tags are missing. Existing values are never
/// overwritten; when nothing is missing, the file is not rewritten at all.
fn backfill_tags(
    path: &Path,
    tags: &[Tag],
    primary_type: TagType,
    meta: &RecoveredMeta,
    client: &Client,
    skip_covers: bool,
) -> Result<BackfillReport, TagfixError> {
    let mut tag = tags
        .iter()
        .find(|t| t.tag_type() == primary_type)
        .cloned()
        .unwrap_or_else(|| Tag::new(primary_type));

    let mut report = BackfillReport::default();

    if text_missing(&tag, &ItemKey::TrackTitle) {
        if let Some(title) = &meta.title {
            tag.insert_text(ItemKey::TrackTitle, title.clone());
            report.title = true;
        }
    }

    if text_missing(&tag, &ItemKey::AlbumTitle) {
        if let Some(album) = &meta.album {
            tag.insert_text(ItemKey::AlbumTitle, album.clone());
            report.album = true;
        }
    }

    if !has_artist_entries(&tag) && !meta.artists.is_empty() {
        for name in &meta.artists {
            tag.push(TagItem::new(
                ItemKey::TrackArtist,
                ItemValue::Text(name.clone()),
            ));
        }
        report.artists = true;
    }

    // Pictures can live in any tag layer of the file, not just the primary.
    let has_picture = tags.iter().any(|t| !t.pictures().is_empty());
    if !has_picture && !skip_covers {
        if let Some(url) = &meta.cover_url {
            let payload = fetch_cover(client, url);
            report.cover = Some(match payload {
                CoverPayload::Image { .. } => CoverNote::Embedded,
                CoverPayload::UrlReference { .. } => CoverNote::UrlReference,
            });
            tag.push_picture(cover_picture(payload));
        }
    }

    if report.changed() {
        tag.save_to_path(path, WriteOptions::default())?;
    }

    Ok(report)
}

// ---------------------------------------------------------------------------
// Per-file unit of work
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum FileOutcome {
    /// Not a .flac/.mp3 file; silently ignored.
    Unsupported,
    /// A `.ncm` companion file is present; left untouched.
    Marker,
    /// Every recovered field was already present.
    Untouched,
    Fixed(BackfillReport),
}

fn process_file(
    path: &Path,
    client: &Client,
    skip_covers: bool,
) -> Result<FileOutcome, TagfixError> {
    let Some(kind) = ContainerKind::from_path(path) else {
        return Ok(FileOutcome::Unsupported);
    };

    if has_ncm_sibling(path) {
        return Ok(FileOutcome::Marker);
    }

    let tagged = Probe::open(path)?
        .options(ParseOptions::new().read_properties(false))
        .read()?;

    let meta = recover_meta(tagged.tags(), kind)?;
    let report = backfill_tags(
        path,
        tagged.tags(),
        tagged.primary_tag_type(),
        &meta,
        client,
        skip_covers,
    )?;

    if report.changed() {
        Ok(FileOutcome::Fixed(report))
    } else {
        Ok(FileOutcome::Untouched)
    }
}

// ---------------------------------------------------------------------------
// Batch scheduling
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunStats {
    fixed: AtomicU64,
    untouched: AtomicU64,
    skipped: AtomicU64,
    no_key: AtomicU64,
    unsupported: AtomicU64,
    failed: AtomicU64,
}

/// Expand CLI paths: a directory contributes its immediate child files (no
/// recursion), a file contributes itself. A missing path is fatal.
fn expand_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, String> {
    let mut files = Vec::new();

    for input in inputs {
        let info = fs::metadata(input)
            .map_err(|e| format!("Path {} is not accessible: {}", input.display(), e))?;

        if info.is_dir() {
            let entries = fs::read_dir(input)
                .map_err(|e| format!("Error while reading {}: {}", input.display(), e))?;
            let mut children: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|entry| entry.path())
                .collect();
            children.sort();
            files.extend(children);
        } else {
            files.push(input.clone());
        }
    }

    Ok(files)
}

fn run_batch(files: &[PathBuf], client: &Client, skip_covers: bool) -> RunStats {
    let stats = RunStats::default();

    files.par_iter().for_each(|path| {
        match process_file(path, client, skip_covers) {
            Ok(FileOutcome::Unsupported) => {
                stats.unsupported.fetch_add(1, Ordering::Relaxed);
            }
            Ok(FileOutcome::Marker) => {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                println!(
                    "  {} {} {}",
                    "→".bright_black(),
                    path.display(),
                    "skipped (.ncm companion present)".bright_black()
                );
            }
            Ok(FileOutcome::Untouched) => {
                stats.untouched.fetch_add(1, Ordering::Relaxed);
                println!(
                    "  {} {} {}",
                    "○".cyan(),
                    path.display(),
                    "nothing to add".bright_black()
                );
            }
            Ok(FileOutcome::Fixed(report)) => {
                stats.fixed.fetch_add(1, Ordering::Relaxed);
                println!(
                    "  {} {} {}",
                    "✓".green(),
                    path.display(),
                    format!("({})", report.summary()).bright_black()
                );
            }
            Err(TagfixError::KeyNotFound) => {
                stats.no_key.fetch_add(1, Ordering::Relaxed);
                println!(
                    "  {} {} {}",
                    "→".bright_black(),
                    path.display(),
                    "no embedded key comment".bright_black()
                );
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                eprintln!("  {} {} {}", "✗".red(), path.display(), e.to_string().red());
            }
        }
    });

    stats
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let args = Args::parse();

    println!("{}", "NCM Tag Fix".bright_cyan().bold());
    println!("{}", "===========".bright_black());
    println!("Threads : {}", args.threads.to_string().bright_white());
    if args.skip_covers {
        println!("Covers  : {}", "skipped".yellow());
    }
    println!();

    let files = match expand_paths(&args.paths) {
        Ok(files) => files,
        Err(msg) => {
            eprintln!("{} {}", "✗".red(), msg.red());
            std::process::exit(1);
        }
    };

    if files.is_empty() {
        println!("Nothing to process.");
        return;
    }

    println!(
        "  {} Found {} file(s)",
        "→".bright_black(),
        files.len().to_string().bright_white()
    );
    println!();

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build_global()
        .ok();

    let client = Client::builder()
        .timeout(COVER_FETCH_TIMEOUT)
        .build()
        .expect("Failed to build HTTP client");

    let start = Instant::now();
    let stats = run_batch(&files, &client, args.skip_covers);

    let fixed = stats.fixed.load(Ordering::Relaxed);
    let untouched = stats.untouched.load(Ordering::Relaxed);
    let skipped = stats.skipped.load(Ordering::Relaxed);
    let no_key = stats.no_key.load(Ordering::Relaxed);
    let unsupported = stats.unsupported.load(Ordering::Relaxed);
    let failed = stats.failed.load(Ordering::Relaxed);

    println!();
    println!("{}", "═".repeat(60).bright_black());
    println!();
    println!(
        "{} {:.1}s",
        "Completed in:".white().bold(),
        start.elapsed().as_secs_f64()
    );
    println!("  {} {}", "Fixed:".green(), fixed);
    println!("  {} {}", "Already tagged:".bright_black(), untouched);
    println!("  {} {}", "Skipped (.ncm):".bright_black(), skipped);
    println!("  {} {}", "No key comment:".bright_black(), no_key);
    if unsupported > 0 {
        println!("  {} {}", "Not FLAC/MP3:".bright_black(), unsupported);
    }
    if failed > 0 {
        println!("  {} {}", "Failed:".red(), failed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
