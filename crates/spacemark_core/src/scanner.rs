use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::LayoutSection;
use crate::model::{ReferenceKind, TitleSource};

static ID_ONLY: LazyLock<Regex> = LazyLock::new(|| compile(r"^(\d{4,})$"));
static ID_PREFIX: LazyLock<Regex> = LazyLock::new(|| compile(r"^(\d{4,})-(.+)$"));
static ID_SUFFIX: LazyLock<Regex> = LazyLock::new(|| compile(r"^(.+)_(\d{4,})$"));
static PAGE_ID_META: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r#"(?i)<meta\s[^>]*name\s*=\s*["'](?:ajs-page-id|confluence-page-id)["'][^>]*>"#,
    )
});
static CONTENT_ATTR: LazyLock<Regex> =
    LazyLock::new(|| compile(r#"(?i)\bcontent\s*=\s*["'](\d+)["']"#));
static HEADING: LazyLock<Regex> = LazyLock::new(|| compile(r"(?is)<h1\b[^>]*>(.*?)</h1>"));
static TITLE: LazyLock<Regex> = LazyLock::new(|| compile(r"(?is)<title\b[^>]*>(.*?)</title>"));
static TAG: LazyLock<Regex> = LazyLock::new(|| compile(r"(?s)<[^>]*>"));
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    compile(r#"(?is)<(a|img)\b[^>]*?\s(href|src)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
});

fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(error) => panic!("invalid built-in pattern {pattern}: {error}"),
    }
}

/// One outbound reference exactly as it appears in the source HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReference {
    pub kind: ReferenceKind,
    pub target: String,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct ScannedDocument {
    pub id: String,
    pub raw_title: String,
    pub title_source: TitleSource,
    /// Input-root relative, `/`-separated.
    pub original_path: String,
    pub source_file: PathBuf,
    pub file_stem: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct SpaceScan {
    pub space: String,
    pub documents: Vec<ScannedDocument>,
    /// Documents or directories that could not be read: (path, error).
    pub failures: Vec<(String, String)>,
    /// Documents whose id was already taken: (original path, id).
    pub duplicate_ids: Vec<(String, String)>,
}

/// Walks one space directory with an explicit work queue.
pub fn scan_space(input_root: &Path, space: &str, layout: &LayoutSection) -> Result<SpaceScan> {
    let space_dir = input_root.join(space);
    let mut scan = SpaceScan {
        space: space.to_string(),
        ..SpaceScan::default()
    };
    let mut seen_ids = HashSet::new();
    let mut queue = VecDeque::from([space_dir.clone()]);

    while let Some(dir) = queue.pop_front() {
        let entries = match read_sorted_dir(&dir) {
            Ok(entries) => entries,
            Err(error) => {
                let path = relative_path(input_root, &dir);
                warn!(space, path = %path, error = %format!("{error:#}"), "failed to read directory");
                scan.failures.push((path, format!("{error:#}")));
                continue;
            }
        };

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(error) => {
                    let path = relative_path(input_root, &path);
                    warn!(space, path = %path, %error, "failed to inspect entry");
                    scan.failures.push((path, error.to_string()));
                    continue;
                }
            };
            if file_type.is_dir() {
                if dir == space_dir && layout.is_reserved_dir(&name) {
                    debug!(space, dir = %name, "skipping reserved directory");
                    continue;
                }
                if name == layout.styles_dir {
                    continue;
                }
                queue.push_back(path);
                continue;
            }
            if !is_html_file(&path) {
                continue;
            }

            let original_path = relative_path(input_root, &path);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(space, path = %original_path, %error, "failed to read document");
                    scan.failures.push((original_path, error.to_string()));
                    continue;
                }
            };
            let html = String::from_utf8_lossy(&bytes);
            let mut document = scan_document(&html, &original_path, &path);
            if !seen_ids.insert(document.id.clone()) {
                scan.duplicate_ids
                    .push((original_path.clone(), document.id.clone()));
                document.id = synthetic_id(space, &original_path);
                seen_ids.insert(document.id.clone());
            }
            scan.documents.push(document);
        }
    }

    debug!(space, documents = scan.documents.len(), "scanned space");
    Ok(scan)
}

fn read_sorted_dir(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to list {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());
    Ok(entries)
}

/// Extracts identity facts from one document without changing it.
pub fn scan_document(html: &str, original_path: &str, source_file: &Path) -> ScannedDocument {
    let file_name = original_path.rsplit('/').next().unwrap_or(original_path);
    let file_stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name)
        .to_string();

    let id = id_from_stem(&file_stem)
        .or_else(|| id_from_marker(html))
        .unwrap_or_else(|| {
            let space = original_path.split('/').next().unwrap_or_default();
            synthetic_id(space, original_path)
        });

    let (raw_title, title_source) = match extract_title(html) {
        Some(title) => (title, TitleSource::Heading),
        None => (strip_id(&file_stem).replace(['-', '_'], " "), TitleSource::Filename),
    };

    ScannedDocument {
        id,
        raw_title,
        title_source,
        original_path: original_path.to_string(),
        source_file: source_file.to_path_buf(),
        file_stem,
        content_hash: compute_hash(html),
    }
}

/// Id embedded in a file stem: `12345`, `12345-Slug`, or `Slug_12345`.
pub fn id_from_stem(stem: &str) -> Option<String> {
    if let Some(captures) = ID_ONLY.captures(stem) {
        return Some(captures[1].to_string());
    }
    if let Some(captures) = ID_PREFIX.captures(stem) {
        return Some(captures[1].to_string());
    }
    ID_SUFFIX
        .captures(stem)
        .map(|captures| captures[2].to_string())
}

/// The stem with any embedded id removed; empty for id-only stems.
pub fn strip_id(stem: &str) -> String {
    if ID_ONLY.is_match(stem) {
        return String::new();
    }
    if let Some(captures) = ID_PREFIX.captures(stem) {
        return captures[2].to_string();
    }
    if let Some(captures) = ID_SUFFIX.captures(stem) {
        return captures[1].to_string();
    }
    stem.to_string()
}

/// Slug of a `Slug_12345` stem, the only form cleaned without rename-all.
pub fn suffix_slug(stem: &str) -> Option<(String, String)> {
    ID_SUFFIX
        .captures(stem)
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
}

pub fn synthetic_id(space: &str, original_path: &str) -> String {
    let within_space = original_path
        .strip_prefix(space)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(original_path);
    format!("doc:{space}/{within_space}")
}

fn id_from_marker(html: &str) -> Option<String> {
    let tag = PAGE_ID_META.find(html)?;
    CONTENT_ATTR
        .captures(tag.as_str())
        .map(|captures| captures[1].to_string())
}

fn extract_title(html: &str) -> Option<String> {
    let from = |regex: &Regex| {
        regex
            .captures(html)
            .map(|captures| clean_title(&captures[1]))
            .filter(|title| !title.is_empty())
    };
    from(&HEADING).or_else(|| from(&TITLE))
}

/// Strips tags and the `Space Name : ` prefix exported page titles carry.
fn clean_title(fragment: &str) -> String {
    let text = decode_entities(&TAG.replace_all(fragment, ""));
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match text.split_once(" : ") {
        Some((_, title)) if !title.trim().is_empty() => title.trim().to_string(),
        _ => text,
    }
}

pub fn extract_references(html: &str) -> Vec<RawReference> {
    let mut references = Vec::new();
    for captures in REFERENCE.captures_iter(html) {
        let tag = captures[1].to_ascii_lowercase();
        let attr = captures[2].to_ascii_lowercase();
        let kind = match (tag.as_str(), attr.as_str()) {
            ("a", "href") => ReferenceKind::Link,
            ("img", "src") => ReferenceKind::Image,
            _ => continue,
        };
        let Some(value) = captures.get(3).or_else(|| captures.get(4)) else {
            continue;
        };
        let target = decode_entities(value.as_str()).trim().to_string();
        if target.is_empty() {
            continue;
        }
        let offset = captures.get(0).map_or(0, |whole| whole.start());
        references.push(RawReference {
            kind,
            target,
            offset,
        });
    }
    references
}

pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        output.push_str(&rest[..start]);
        let candidate = &rest[start + 1..];
        let decoded = candidate.find(';').filter(|end| *end <= 10).and_then(|end| {
            let entity = &candidate[..end];
            let value = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity.strip_prefix('#').and_then(|numeric| {
                    let code = match numeric.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => numeric.parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            value.map(|ch| (ch, end))
        });
        match decoded {
            Some((ch, end)) => {
                output.push(ch);
                rest = &candidate[end + 1..];
            }
            None => {
                output.push('&');
                rest = candidate;
            }
        }
    }
    output.push_str(rest);
    output
}

fn is_html_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
}

pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    normalize_path(relative)
}

pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

pub fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
