use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::LayoutSection;
use crate::identity::SpaceIdentity;
use crate::model::{ContentItem, ContentKind, ItemStatus, compare_ids};
use crate::sanitize::sanitize_file_name;
use crate::scanner::normalize_path;

/// A binary asset found on disk under a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFile {
    pub id: String,
    /// Owning page id; `None` for files under the images tree.
    pub owner_id: Option<String>,
    pub file_name: String,
    /// Input-root relative, `/`-separated.
    pub original_path: String,
    pub source_file: PathBuf,
}

/// Attachment files of one space plus the paths that could not be walked.
#[derive(Debug, Clone, Default)]
pub struct AttachmentInventory {
    pub files: Vec<AttachmentFile>,
    /// Unreadable entries: (input-root relative path, error).
    pub failures: Vec<(String, String)>,
}

impl AttachmentInventory {
    fn record_failure(&mut self, input_root: &Path, space: &str, error: walkdir::Error) {
        let path = error
            .path()
            .map(|path| crate::scanner::relative_path(input_root, path))
            .unwrap_or_else(|| space.to_string());
        warn!(space, path = %path, %error, "failed to walk attachment entry");
        self.failures.push((path, error.to_string()));
    }
}

/// Proposed location for one attachment, claimed later by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPlan {
    pub id: String,
    pub dir: String,
    pub file_name: String,
}

/// Lists attachment and image files of one space.
///
/// Attachments live at `attachments/<page>/<file>` in HTML exports and at
/// `attachments/<page>/<attachment>/<version>` in XML exports, where only the
/// highest numeric version is kept. Unreadable entries are recorded and
/// skipped.
pub fn inventory(input_root: &Path, space: &str, layout: &LayoutSection) -> AttachmentInventory {
    let mut inventory = AttachmentInventory::default();
    let mut files = Vec::new();

    let attachments_dir = input_root.join(space).join(&layout.attachments_dir);
    if attachments_dir.is_dir() {
        let mut versioned: BTreeMap<(String, String), (u64, PathBuf)> = BTreeMap::new();
        for entry in WalkDir::new(&attachments_dir)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    inventory.record_failure(input_root, space, error);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&attachments_dir).unwrap_or(path);
            let parts = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>();

            match parts.as_slice() {
                [owner, file] => {
                    let stem = file.rsplit_once('.').map_or(file.as_str(), |(stem, _)| stem);
                    let id = if is_numeric(stem) {
                        stem.to_string()
                    } else {
                        format!("att:{owner}/{file}")
                    };
                    files.push(AttachmentFile {
                        id,
                        owner_id: Some(owner.clone()),
                        file_name: file.clone(),
                        original_path: crate::scanner::relative_path(input_root, path),
                        source_file: path.to_path_buf(),
                    });
                }
                [owner, attachment, version] if is_numeric(attachment) && is_numeric(version) => {
                    let version = version.parse::<u64>().unwrap_or(0);
                    let key = (owner.clone(), attachment.clone());
                    let newer = versioned
                        .get(&key)
                        .is_none_or(|(existing, _)| version > *existing);
                    if newer {
                        versioned.insert(key, (version, path.to_path_buf()));
                    }
                }
                [owner, .., file] => {
                    files.push(AttachmentFile {
                        id: format!("att:{}", normalize_path(relative)),
                        owner_id: Some(owner.clone()),
                        file_name: file.clone(),
                        original_path: crate::scanner::relative_path(input_root, path),
                        source_file: path.to_path_buf(),
                    });
                }
                _ => debug!(space, path = %path.display(), "ignoring loose attachment file"),
            }
        }

        for ((owner, attachment), (_, path)) in versioned {
            files.push(AttachmentFile {
                id: attachment.clone(),
                owner_id: Some(owner),
                file_name: attachment,
                original_path: crate::scanner::relative_path(input_root, &path),
                source_file: path,
            });
        }
    }

    let images_dir = input_root.join(space).join(&layout.images_dir);
    if images_dir.is_dir() {
        for entry in WalkDir::new(&images_dir).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    inventory.record_failure(input_root, space, error);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let original_path = crate::scanner::relative_path(input_root, path);
            files.push(AttachmentFile {
                id: format!("img:{original_path}"),
                owner_id: None,
                file_name: entry.file_name().to_string_lossy().to_string(),
                original_path,
                source_file: path.to_path_buf(),
            });
        }
    }

    files.sort_by(|left, right| {
        left.owner_id
            .cmp(&right.owner_id)
            .then_with(|| compare_ids(&left.id, &right.id))
    });
    inventory.files = files;
    inventory
}

/// Proposes output locations for every attachment item of a space. Page
/// attachments go under `<space>/<attachments>/<owner>/`; images keep their
/// original relative path. Names never lose numeric ids.
pub fn plan_attachment_paths(identity: &SpaceIdentity, layout: &LayoutSection) -> Vec<AttachmentPlan> {
    let mut items = identity
        .items()
        .filter(|item| item.kind == ContentKind::Attachment)
        .collect::<Vec<_>>();
    items.sort_by(|left, right| {
        left.owner_id
            .cmp(&right.owner_id)
            .then_with(|| compare_ids(&left.id, &right.id))
    });

    items
        .into_iter()
        .map(|item| plan_for(item, &identity.space.key, layout))
        .collect()
}

fn plan_for(item: &ContentItem, space: &str, layout: &LayoutSection) -> AttachmentPlan {
    match &item.owner_id {
        Some(owner) => {
            let mut file_name = sanitize_file_name(&item.raw_title);
            if !has_extension(&file_name)
                && let Some(content_type) = item.content_type.as_deref()
            {
                file_name = format!("{file_name}.{}", extension_for_content_type(content_type));
            }
            AttachmentPlan {
                id: item.id.clone(),
                dir: format!("{space}/{}/{owner}", layout.attachments_dir),
                file_name,
            }
        }
        None => {
            let original = item.original_path.clone().unwrap_or_default();
            let (dir, file_name) = original
                .rsplit_once('/')
                .map(|(dir, name)| (dir.to_string(), name.to_string()))
                .unwrap_or_else(|| (format!("{space}/{}", layout.images_dir), original.clone()));
            AttachmentPlan {
                id: item.id.clone(),
                dir,
                file_name,
            }
        }
    }
}

pub fn extension_for_content_type(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/zip" => "zip",
        _ => "bin",
    }
}

fn has_extension(file_name: &str) -> bool {
    file_name
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit())
}

/// Whether an attachment item can be copied; missing binaries are reported.
pub fn is_available(item: &ContentItem) -> bool {
    item.kind == ContentKind::Attachment
        && item.status == ItemStatus::Exported
        && item.source_file.as_ref().is_some_and(|path| path.is_file())
}

/// Copies unless the destination already matches by size and is not older.
pub fn copy_attachment(source: &Path, destination: &Path) -> Result<bool> {
    let source_meta = fs::metadata(source)
        .with_context(|| format!("failed to inspect {}", source.display()))?;
    if let Ok(existing) = fs::metadata(destination)
        && existing.len() == source_meta.len()
        && let (Ok(existing_time), Ok(source_time)) = (existing.modified(), source_meta.modified())
        && existing_time >= source_time
    {
        return Ok(false);
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(source, destination).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    Ok(true)
}
