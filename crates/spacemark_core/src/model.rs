use std::cmp::Ordering;
use std::ops::Range;
use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::Serialize;

use crate::issues::IssueKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Page,
    BlogPost,
    Attachment,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::BlogPost => "blog_post",
            Self::Attachment => "attachment",
        }
    }

    pub fn is_document(self) -> bool {
        matches!(self, Self::Page | Self::BlogPost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Present in the export tree.
    Exported,
    /// Known from metadata only; gets a stub landing page.
    Placeholder,
    /// Attachment known from metadata whose binary is absent on disk.
    MissingFile,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exported => "exported",
            Self::Placeholder => "placeholder",
            Self::MissingFile => "missing_file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleSource {
    Metadata,
    Heading,
    Filename,
}

impl TitleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Heading => "heading",
            Self::Filename => "filename",
        }
    }
}

/// One page, blog post, or attachment. The output path is written once by the
/// resolver and is read-only afterwards.
#[derive(Debug, Clone)]
pub struct ContentItem {
    pub id: String,
    pub kind: ContentKind,
    pub space: String,
    pub raw_title: String,
    pub title_source: TitleSource,
    pub parent_id: Option<String>,
    /// Input-root relative, `/`-separated.
    pub original_path: Option<String>,
    pub source_file: Option<PathBuf>,
    pub owner_id: Option<String>,
    pub content_type: Option<String>,
    pub content_hash: Option<String>,
    pub status: ItemStatus,
    pub is_homepage: bool,
    output_path: Option<String>,
    collision: bool,
}

impl ContentItem {
    pub fn new(
        id: impl Into<String>,
        kind: ContentKind,
        space: impl Into<String>,
        raw_title: impl Into<String>,
        title_source: TitleSource,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            space: space.into(),
            raw_title: raw_title.into(),
            title_source,
            parent_id: None,
            original_path: None,
            source_file: None,
            owner_id: None,
            content_type: None,
            content_hash: None,
            status: ItemStatus::Exported,
            is_homepage: false,
            output_path: None,
            collision: false,
        }
    }

    pub fn output_path(&self) -> Option<&str> {
        self.output_path.as_deref()
    }

    pub fn is_resolved(&self) -> bool {
        self.output_path.is_some()
    }

    pub fn had_collision(&self) -> bool {
        self.collision
    }

    /// Directory part of the output path, empty at the output root.
    pub fn output_dir(&self) -> Option<&str> {
        self.output_path
            .as_deref()
            .map(|path| path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(""))
    }

    pub(crate) fn assign_output(&mut self, path: String, collision: bool) -> Result<()> {
        if let Some(existing) = &self.output_path {
            bail!(
                "item {} in space {} is already resolved to {existing}",
                self.id,
                self.space
            );
        }
        self.output_path = Some(path);
        self.collision = collision;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Link,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Unresolved,
    ResolvedInternal,
    ResolvedExternal,
    Broken,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::ResolvedInternal => "resolved_internal",
            Self::ResolvedExternal => "resolved_external",
            Self::Broken => "broken",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Unresolved)
    }
}

/// One hyperlink or image reference inside a draft document.
#[derive(Debug, Clone)]
pub struct LinkReference {
    pub source_item_id: String,
    pub raw_target: String,
    pub label: String,
    pub kind: ReferenceKind,
    /// Byte range of the whole reference in the draft.
    pub position: Range<usize>,
    pub state: LinkState,
    pub final_target: Option<String>,
    pub target_id: Option<String>,
    pub matcher: Option<&'static str>,
    pub detail: Option<String>,
    /// Issue raised by a broken resolution.
    pub issue: Option<IssueKind>,
}

impl LinkReference {
    pub fn new(
        source_item_id: impl Into<String>,
        raw_target: impl Into<String>,
        label: impl Into<String>,
        kind: ReferenceKind,
        position: Range<usize>,
    ) -> Self {
        Self {
            source_item_id: source_item_id.into(),
            raw_target: raw_target.into(),
            label: label.into(),
            kind,
            position,
            state: LinkState::Unresolved,
            final_target: None,
            target_id: None,
            matcher: None,
            detail: None,
            issue: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Space {
    pub key: String,
    pub name: Option<String>,
    pub item_ids: Vec<String>,
    pub homepage_id: Option<String>,
}

impl Space {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }
}

/// Numeric ids order by value, everything else lexically after them.
pub fn compare_ids(left: &str, right: &str) -> Ordering {
    let left_numeric = !left.is_empty() && left.bytes().all(|byte| byte.is_ascii_digit());
    let right_numeric = !right.is_empty() && right.bytes().all(|byte| byte.is_ascii_digit());
    match (left_numeric, right_numeric) {
        (true, true) => {
            let left = left.trim_start_matches('0');
            let right = right.trim_start_matches('0');
            left.len().cmp(&right.len()).then_with(|| left.cmp(right))
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.cmp(right),
    }
}
