//! Ordered reference matchers. Each matcher recognizes one link form and
//! extracts a lookup key; the rewriter tries them by ascending rank.

use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::scanner::id_from_stem;

static SCHEME: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:") {
    Ok(regex) => regex,
    Err(error) => panic!("invalid built-in scheme pattern: {error}"),
});

/// What a matcher extracted from a reference target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKey {
    Id(String),
    OriginalPath(String),
    Attachment { owner: String, file: String },
    Title { space: String, title: String },
    Homepage { space: String },
}

impl TargetKey {
    /// Whether the key can only name an attachment.
    pub fn is_attachment(&self) -> bool {
        matches!(self, Self::Attachment { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Id(id) => format!("id {id}"),
            Self::OriginalPath(path) => format!("path {path}"),
            Self::Attachment { owner, file } => format!("attachment {owner}/{file}"),
            Self::Title { space, title } => format!("title {space}/{title}"),
            Self::Homepage { space } => format!("homepage of {space}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOrigin {
    /// Path part of a source-site URL, `/`-prefixed, context path included.
    Site(String),
    /// Export path joined onto the referring document's directory.
    Relative(String),
    External,
}

/// A reference target split into its parts once, before matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTarget {
    pub origin: TargetOrigin,
    pub query: Option<String>,
    pub fragment: Option<String>,
}

impl ParsedTarget {
    pub fn parse(raw: &str, source_dir: &str, base_url: &str) -> Self {
        let raw = raw.trim();
        let (rest, fragment) = match raw.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment.to_string()).filter(|f| !f.is_empty())),
            None => (raw, None),
        };
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (rest, None),
        };

        let origin = if let Some(site_path) = strip_base_url(path, base_url) {
            TargetOrigin::Site(site_path)
        } else if path.starts_with('/') && !path.starts_with("//") {
            TargetOrigin::Site(path.to_string())
        } else if path.is_empty() || path.starts_with("//") || SCHEME.is_match(path) {
            TargetOrigin::External
        } else {
            TargetOrigin::Relative(join_relative(source_dir, &decode(path)))
        };

        Self {
            origin,
            query,
            fragment,
        }
    }

    fn site_segments(&self) -> Option<Vec<&str>> {
        match &self.origin {
            TargetOrigin::Site(path) => Some(path.split('/').filter(|s| !s.is_empty()).collect()),
            _ => None,
        }
    }

    fn relative_path(&self) -> Option<&str> {
        match &self.origin {
            TargetOrigin::Relative(path) => Some(path),
            _ => None,
        }
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then_some(value)
        })
    }
}

pub trait ReferenceMatcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn rank(&self) -> u8;
    fn extract(&self, target: &ParsedTarget) -> Option<TargetKey>;
}

/// `/pages/viewpage.action?pageId=N`, `/pages/editblogpost.action?pageId=N`
/// and `/spaces/KEY/pages/N/...`.
pub struct PageIdUrl;

impl ReferenceMatcher for PageIdUrl {
    fn name(&self) -> &'static str {
        "page_id_url"
    }

    fn rank(&self) -> u8 {
        1
    }

    fn extract(&self, target: &ParsedTarget) -> Option<TargetKey> {
        let segments = target.site_segments()?;
        let last = segments.last()?;
        if last.ends_with(".action")
            && let Some(id) = target.query_param("pageId")
            && is_numeric(id)
        {
            return Some(TargetKey::Id(id.to_string()));
        }
        segments
            .windows(4)
            .find(|window| window[0] == "spaces" && matches!(window[2], "pages" | "blog"))
            .map(|window| window[3])
            .filter(|id| is_numeric(id))
            .map(|id| TargetKey::Id(id.to_string()))
    }
}

/// `/download/attachments/<owner>/<file>` and the thumbnail variant.
pub struct AttachmentUrl;

impl ReferenceMatcher for AttachmentUrl {
    fn name(&self) -> &'static str {
        "attachment_url"
    }

    fn rank(&self) -> u8 {
        2
    }

    fn extract(&self, target: &ParsedTarget) -> Option<TargetKey> {
        let segments = target.site_segments()?;
        let start = segments.iter().position(|segment| *segment == "download")?;
        match &segments[start + 1..] {
            [kind, owner, .., file] if matches!(*kind, "attachments" | "thumbnails") => {
                Some(TargetKey::Attachment {
                    owner: (*owner).to_string(),
                    file: decode(file),
                })
            }
            _ => None,
        }
    }
}

/// `/display/SPACE/Title` by title, `/display/SPACE` as the homepage.
/// Personal spaces (`~user`) are profiles, not content.
pub struct DisplayUrl;

impl ReferenceMatcher for DisplayUrl {
    fn name(&self) -> &'static str {
        "display_url"
    }

    fn rank(&self) -> u8 {
        3
    }

    fn extract(&self, target: &ParsedTarget) -> Option<TargetKey> {
        let segments = target.site_segments()?;
        let start = segments.iter().position(|segment| *segment == "display")?;
        match &segments[start + 1..] {
            [space, ..] if space.starts_with('~') => None,
            [space] => Some(TargetKey::Homepage {
                space: (*space).to_string(),
            }),
            [space, .., title] => Some(TargetKey::Title {
                space: (*space).to_string(),
                title: decode(&title.replace('+', " ")),
            }),
            [] => None,
        }
    }
}

/// Any relative path, matched against original export paths.
pub struct ExportPath;

impl ReferenceMatcher for ExportPath {
    fn name(&self) -> &'static str {
        "export_path"
    }

    fn rank(&self) -> u8 {
        4
    }

    fn extract(&self, target: &ParsedTarget) -> Option<TargetKey> {
        target
            .relative_path()
            .filter(|path| !path.is_empty())
            .map(|path| TargetKey::OriginalPath(path.to_string()))
    }
}

/// `<slug>_<id>.html`, `<id>-<slug>.html` and `<id>.html` by id.
pub struct ExportFilenameId;

impl ReferenceMatcher for ExportFilenameId {
    fn name(&self) -> &'static str {
        "export_filename_id"
    }

    fn rank(&self) -> u8 {
        5
    }

    fn extract(&self, target: &ParsedTarget) -> Option<TargetKey> {
        let file = target.relative_path()?.rsplit('/').next()?;
        let (stem, extension) = file.rsplit_once('.')?;
        if !(extension.eq_ignore_ascii_case("html") || extension.eq_ignore_ascii_case("htm")) {
            return None;
        }
        id_from_stem(stem).map(TargetKey::Id)
    }
}

/// `<dir>/<owner>/<file>` and `<dir>/<owner>/<id>/<version>`, where `<dir>`
/// is the export's attachments directory name.
pub struct AttachmentPath {
    dir: String,
}

impl AttachmentPath {
    pub fn new(dir: &str) -> Self {
        Self {
            dir: dir.trim_matches('/').to_string(),
        }
    }
}

impl ReferenceMatcher for AttachmentPath {
    fn name(&self) -> &'static str {
        "attachment_path"
    }

    fn rank(&self) -> u8 {
        6
    }

    fn extract(&self, target: &ParsedTarget) -> Option<TargetKey> {
        let segments = target.relative_path()?.split('/').collect::<Vec<_>>();
        let start = segments.iter().position(|segment| *segment == self.dir)?;
        match &segments[start + 1..] {
            [owner, file, ..] if !owner.is_empty() && !file.is_empty() => {
                Some(TargetKey::Attachment {
                    owner: (*owner).to_string(),
                    file: (*file).to_string(),
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub matcher: &'static str,
    pub key: TargetKey,
}

pub struct MatcherSet {
    base_url: String,
    matchers: Vec<Box<dyn ReferenceMatcher>>,
}

impl MatcherSet {
    pub fn standard(base_url: &str, attachments_dir: &str) -> Self {
        Self::with_matchers(
            base_url,
            vec![
                Box::new(PageIdUrl),
                Box::new(AttachmentUrl),
                Box::new(DisplayUrl),
                Box::new(ExportPath),
                Box::new(ExportFilenameId),
                Box::new(AttachmentPath::new(attachments_dir)),
            ],
        )
    }

    pub fn with_matchers(base_url: &str, mut matchers: Vec<Box<dyn ReferenceMatcher>>) -> Self {
        matchers.sort_by_key(|matcher| matcher.rank());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            matchers,
        }
    }

    /// Every matcher hit for `raw`, in rank order. Empty means external.
    pub fn classify(&self, raw: &str, source_dir: &str) -> (ParsedTarget, Vec<Classification>) {
        let target = ParsedTarget::parse(raw, source_dir, &self.base_url);
        let hits = self
            .matchers
            .iter()
            .filter_map(|matcher| {
                matcher.extract(&target).map(|key| Classification {
                    matcher: matcher.name(),
                    key,
                })
            })
            .collect();
        (target, hits)
    }
}

fn strip_base_url(path: &str, base_url: &str) -> Option<String> {
    let without_scheme = |value: &str| -> Option<String> {
        let (_, rest) = value.split_once("://")?;
        Some(rest.to_ascii_lowercase())
    };
    let base = without_scheme(base_url)?;
    let (_, rest) = path.split_once("://")?;
    if rest.len() < base.len() || !rest.is_char_boundary(base.len()) {
        return None;
    }
    let (host_part, remainder) = rest.split_at(base.len());
    if host_part.to_ascii_lowercase() != base {
        return None;
    }
    if remainder.is_empty() {
        return Some("/".to_string());
    }
    remainder.starts_with('/').then(|| remainder.to_string())
}

fn decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().to_string()
}

/// Joins a relative export path onto a directory and folds `.`/`..`.
/// Segments climbing above the input root are dropped.
pub fn join_relative(dir: &str, relative: &str) -> String {
    let mut parts = dir
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    for part in relative.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit())
}
