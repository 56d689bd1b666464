use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, bail};
use tracing::debug;

use crate::attachments::AttachmentFile;
use crate::issues::{Issue, IssueKind};
use crate::metadata::SpaceMetadata;
use crate::model::{ContentItem, ContentKind, ItemStatus, Space, TitleSource, compare_ids};
use crate::scanner::SpaceScan;

/// Identity table of one space. Mutable only during Phase 1.
#[derive(Debug, Clone)]
pub struct SpaceIdentity {
    pub space: Space,
    items: BTreeMap<String, ContentItem>,
    aliases: BTreeMap<String, String>,
}

impl SpaceIdentity {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            space: Space::new(key),
            items: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    /// Adds an item; the first item with a given id wins.
    pub fn insert(&mut self, item: ContentItem) -> bool {
        if self.items.contains_key(&item.id) {
            return false;
        }
        self.space.item_ids.push(item.id.clone());
        self.items.insert(item.id.clone(), item);
        true
    }

    pub fn add_alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        let target = target.into();
        if self.items.contains_key(&target) {
            self.aliases.insert(alias.into(), target);
        }
    }

    pub fn get(&self, id: &str) -> Option<&ContentItem> {
        self.items
            .get(id)
            .or_else(|| self.aliases.get(id).and_then(|target| self.items.get(target)))
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut ContentItem> {
        self.items.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Items in the space's canonical order.
    pub fn items(&self) -> impl Iterator<Item = &ContentItem> {
        self.space
            .item_ids
            .iter()
            .filter_map(|id| self.items.get(id))
    }

    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn homepage(&self) -> Option<&ContentItem> {
        self.space
            .homepage_id
            .as_deref()
            .and_then(|id| self.items.get(id))
    }

    pub fn unresolved_ids(&self) -> Vec<&str> {
        self.items()
            .filter(|item| !item.is_resolved())
            .map(|item| item.id.as_str())
            .collect()
    }

    /// Orders items by kind, then by id.
    pub fn sort_items(&mut self) {
        let items = &self.items;
        self.space.item_ids.sort_by(|left, right| {
            let left_kind = items.get(left).map(|item| item.kind);
            let right_kind = items.get(right).map(|item| item.kind);
            left_kind
                .cmp(&right_kind)
                .then_with(|| compare_ids(left, right))
        });
    }
}

/// Merges the scan and the optional metadata of one space. Metadata wins on
/// titles and parents; the scan wins on existence.
pub fn reconcile(
    space_key: &str,
    metadata: Option<&SpaceMetadata>,
    scan: &SpaceScan,
    files: &[AttachmentFile],
) -> (SpaceIdentity, Vec<Issue>) {
    let mut identity = SpaceIdentity::new(space_key);
    let mut issues = Vec::new();
    identity.space.name = metadata.and_then(|metadata| metadata.space_name.clone());

    for document in &scan.documents {
        let node = metadata
            .and_then(|metadata| metadata.node(&document.id))
            .filter(|node| node.kind.is_document());
        let kind = node.map_or(ContentKind::Page, |node| node.kind);
        let mut item = ContentItem::new(
            document.id.clone(),
            kind,
            space_key,
            document.raw_title.clone(),
            document.title_source,
        );
        if let Some(node) = node {
            if !node.title.trim().is_empty() {
                item.raw_title = node.title.clone();
                item.title_source = TitleSource::Metadata;
            }
            item.parent_id = node.parent_id.clone();
        }
        item.original_path = Some(document.original_path.clone());
        item.source_file = Some(document.source_file.clone());
        item.content_hash = Some(document.content_hash.clone());
        identity.insert(item);
    }

    if let Some(metadata) = metadata {
        for node in metadata.nodes.values() {
            if !node.kind.is_document() || identity.contains(&node.id) {
                continue;
            }
            let mut item = ContentItem::new(
                node.id.clone(),
                node.kind,
                space_key,
                node.title.clone(),
                TitleSource::Metadata,
            );
            item.parent_id = node.parent_id.clone();
            if node.kind == ContentKind::BlogPost && metadata.blog_bodies.contains_key(&node.id) {
                item.status = ItemStatus::Exported;
            } else {
                item.status = ItemStatus::Placeholder;
                issues.push(Issue::new(
                    IssueKind::ConsistencyWarning,
                    space_key,
                    node.id.clone(),
                    format!(
                        "`{}` is listed in metadata but was not exported; placeholder created",
                        node.title
                    ),
                ));
            }
            identity.insert(item);
        }
    }

    for file in files {
        let node = metadata
            .and_then(|metadata| metadata.node(&file.id))
            .filter(|node| node.kind == ContentKind::Attachment);
        let title = node
            .map(|node| node.title.clone())
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| file.file_name.clone());
        let title_source = if node.is_some() {
            TitleSource::Metadata
        } else {
            TitleSource::Filename
        };
        let mut item = ContentItem::new(
            file.id.clone(),
            ContentKind::Attachment,
            space_key,
            title,
            title_source,
        );
        item.owner_id = node
            .and_then(|node| node.container_id.clone())
            .or_else(|| file.owner_id.clone());
        item.content_type = node.and_then(|node| node.content_type.clone());
        item.original_path = Some(file.original_path.clone());
        item.source_file = Some(file.source_file.clone());
        if !identity.insert(item) {
            issues.push(Issue::new(
                IssueKind::ConsistencyWarning,
                space_key,
                file.id.clone(),
                format!("attachment {} reuses an existing id", file.original_path),
            ));
        }
    }

    if let Some(metadata) = metadata {
        for node in metadata.nodes.values() {
            if node.kind != ContentKind::Attachment || identity.contains(&node.id) {
                continue;
            }
            let mut item = ContentItem::new(
                node.id.clone(),
                ContentKind::Attachment,
                space_key,
                node.title.clone(),
                TitleSource::Metadata,
            );
            item.owner_id = node.container_id.clone();
            item.content_type = node.content_type.clone();
            item.status = ItemStatus::MissingFile;
            issues.push(Issue::new(
                IssueKind::MissingAttachment,
                space_key,
                node.id.clone(),
                format!(
                    "attachment `{}` of page {} is not present on disk",
                    node.title,
                    node.container_id.as_deref().unwrap_or("?")
                ),
            ));
            identity.insert(item);
        }

        for (alias, target) in &metadata.aliases {
            identity.add_alias(alias.clone(), target.clone());
        }
        for warning in &metadata.warnings {
            issues.push(Issue::new(
                IssueKind::ConsistencyWarning,
                space_key,
                space_key,
                warning.clone(),
            ));
        }
    }

    for (path, id) in &scan.duplicate_ids {
        issues.push(Issue::new(
            IssueKind::ConsistencyWarning,
            space_key,
            path.clone(),
            format!("id {id} already used by another document; synthetic id assigned"),
        ));
    }
    for (path, error) in &scan.failures {
        issues.push(Issue::new(
            IssueKind::DocumentFailed,
            space_key,
            path.clone(),
            format!("failed to read: {error}"),
        ));
    }

    let homepage = metadata
        .and_then(|metadata| metadata.homepage_id.clone())
        .filter(|id| identity.contains(id))
        .or_else(|| {
            scan.documents
                .iter()
                .find(|document| document.file_stem.eq_ignore_ascii_case("index"))
                .map(|document| document.id.clone())
        });
    if let Some(id) = homepage
        && let Some(item) = identity.get_mut(&id)
    {
        item.is_homepage = true;
        identity.space.homepage_id = Some(id);
    }

    identity.sort_items();
    debug!(
        space = space_key,
        items = identity.len(),
        aliases = identity.aliases().len(),
        "reconciled identity table"
    );
    (identity, issues)
}

type ItemKey = (String, String);

/// Read-only union of every space's identity table, used by Phase 2.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    spaces: BTreeMap<String, SpaceIdentity>,
    by_id: HashMap<String, ItemKey>,
    by_path: HashMap<String, ItemKey>,
    by_title: HashMap<ItemKey, String>,
    by_attachment: HashMap<ItemKey, ItemKey>,
}

impl IdentityIndex {
    /// Fails when any item is still unresolved: Phase 2 needs every path.
    pub fn build(spaces: Vec<SpaceIdentity>) -> Result<(Self, Vec<Issue>)> {
        let mut index = Self::default();
        let mut issues = Vec::new();

        for identity in spaces {
            let unresolved = identity.unresolved_ids();
            if !unresolved.is_empty() {
                bail!(
                    "space {} has {} unresolved items (first: {})",
                    identity.space.key,
                    unresolved.len(),
                    unresolved[0]
                );
            }
            index
                .spaces
                .insert(identity.space.key.clone(), identity);
        }

        for (key, identity) in &index.spaces {
            for item in identity.items() {
                let item_key = (key.clone(), item.id.clone());
                if let Some((existing_space, _)) = index.by_id.get(&item.id) {
                    issues.push(Issue::new(
                        IssueKind::ConsistencyWarning,
                        key.clone(),
                        item.id.clone(),
                        format!("id also present in space {existing_space}; id lookups resolve there"),
                    ));
                } else {
                    index.by_id.insert(item.id.clone(), item_key.clone());
                }

                if let Some(path) = &item.original_path {
                    index
                        .by_path
                        .entry(path.to_lowercase())
                        .or_insert_with(|| item_key.clone());
                }

                if item.kind.is_document() {
                    index
                        .by_title
                        .entry((key.clone(), item.raw_title.to_lowercase()))
                        .or_insert_with(|| item.id.clone());
                }

                if item.kind == ContentKind::Attachment
                    && let Some(owner) = &item.owner_id
                {
                    let mut names = vec![item.raw_title.to_lowercase(), item.id.to_lowercase()];
                    if let Some(path) = &item.original_path
                        && let Some(file_name) = path.rsplit('/').next()
                    {
                        names.push(file_name.to_lowercase());
                    }
                    for name in names {
                        index
                            .by_attachment
                            .entry((owner.clone(), name))
                            .or_insert_with(|| item_key.clone());
                    }
                }
            }
            for (alias, target) in identity.aliases() {
                index
                    .by_id
                    .entry(alias.clone())
                    .or_insert_with(|| (key.clone(), target.clone()));
            }
        }

        Ok((index, issues))
    }

    pub fn space(&self, key: &str) -> Option<&SpaceIdentity> {
        self.spaces.get(key)
    }

    pub fn spaces(&self) -> impl Iterator<Item = &SpaceIdentity> {
        self.spaces.values()
    }

    pub fn items(&self) -> impl Iterator<Item = &ContentItem> {
        self.spaces.values().flat_map(|identity| identity.items())
    }

    pub fn item(&self, space: &str, id: &str) -> Option<&ContentItem> {
        self.spaces.get(space).and_then(|identity| identity.get(id))
    }

    /// Looks up an export id, preferring the given space.
    pub fn find_by_id(&self, preferred_space: &str, id: &str) -> Option<&ContentItem> {
        self.item(preferred_space, id).or_else(|| {
            self.by_id
                .get(id)
                .and_then(|(space, id)| self.item(space, id))
        })
    }

    pub fn find_by_path(&self, original_path: &str) -> Option<&ContentItem> {
        self.by_path
            .get(&original_path.to_lowercase())
            .and_then(|(space, id)| self.item(space, id))
    }

    pub fn find_by_title(&self, space: &str, title: &str) -> Option<&ContentItem> {
        self.by_title
            .get(&(space.to_string(), title.trim().to_lowercase()))
            .and_then(|id| self.item(space, id))
    }

    pub fn find_attachment(&self, owner_id: &str, file_name: &str) -> Option<&ContentItem> {
        self.by_attachment
            .get(&(owner_id.to_string(), file_name.to_lowercase()))
            .and_then(|(space, id)| self.item(space, id))
    }

    pub fn homepage(&self, space: &str) -> Option<&ContentItem> {
        self.spaces.get(space).and_then(SpaceIdentity::homepage)
    }
}
