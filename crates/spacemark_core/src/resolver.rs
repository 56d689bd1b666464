use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{Result, bail};
use tracing::{debug, info};

use crate::attachments::plan_attachment_paths;
use crate::config::{LayoutSection, MigrationConfig, NamingSection};
use crate::identity::SpaceIdentity;
use crate::issues::{Issue, IssueKind};
use crate::model::{ContentItem, ContentKind, ItemStatus, TitleSource, compare_ids};
use crate::sanitize::sanitize_name;
use crate::scanner::{strip_id, suffix_slug};

pub const DOCUMENT_EXTENSION: &str = "md";

/// Claimed file names per output directory, compared case-insensitively.
#[derive(Debug, Default)]
pub struct FilenameRegistry {
    claimed: BTreeMap<String, BTreeSet<String>>,
}

impl FilenameRegistry {
    /// Returns false when the name is already taken in `dir`.
    pub fn claim(&mut self, dir: &str, name: &str) -> bool {
        self.claimed
            .entry(dir.to_string())
            .or_default()
            .insert(name.to_lowercase())
    }
}

/// Assigns every item of a space its final output path, exactly once.
pub struct Resolver<'a> {
    naming: &'a NamingSection,
    layout: &'a LayoutSection,
    registry: FilenameRegistry,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a MigrationConfig) -> Self {
        Self {
            naming: &config.naming,
            layout: &config.layout,
            registry: FilenameRegistry::default(),
        }
    }

    pub fn resolve_space(mut self, identity: &mut SpaceIdentity) -> Result<Vec<Issue>> {
        let space = identity.space.key.clone();
        let mut issues = Vec::new();

        let owners = identity
            .items()
            .filter(|item| item.kind == ContentKind::Attachment)
            .filter_map(|item| item.owner_id.clone())
            .collect::<HashSet<_>>();

        let mut documents = identity
            .items()
            .filter(|item| item.kind.is_document())
            .map(|item| {
                let dir = match item.kind {
                    ContentKind::BlogPost => format!("{space}/{}", self.layout.blogposts_dir),
                    _ => space.clone(),
                };
                let stem = page_stem(item, self.naming, owners.contains(&item.id));
                (
                    item.is_homepage,
                    item.status,
                    item.id.clone(),
                    dir,
                    stem,
                )
            })
            .collect::<Vec<_>>();
        documents.sort_by(|left, right| {
            right
                .0
                .cmp(&left.0)
                .then_with(|| status_rank(left.1).cmp(&status_rank(right.1)))
                .then_with(|| compare_ids(&left.2, &right.2))
        });

        for (_, _, id, dir, stem) in documents {
            let (name, collision) = self.claim_unique(&dir, &stem, Some(DOCUMENT_EXTENSION), &id);
            if collision {
                issues.push(collision_issue(&space, &id, &dir, &stem, &name));
            }
            self.assign(identity, &id, format!("{dir}/{name}"), collision)?;
        }

        for plan in plan_attachment_paths(identity, self.layout) {
            let (stem, extension) = split_extension(&plan.file_name);
            let (name, collision) = self.claim_unique(&plan.dir, stem, extension, &plan.id);
            if collision {
                issues.push(collision_issue(&space, &plan.id, &plan.dir, stem, &name));
            }
            self.assign(identity, &plan.id, format!("{}/{name}", plan.dir), collision)?;
        }

        let unresolved = identity.unresolved_ids();
        if !unresolved.is_empty() {
            bail!(
                "resolver left {} items unresolved in space {space}",
                unresolved.len()
            );
        }
        debug!(space = %space, items = identity.len(), "resolved output paths");
        Ok(issues)
    }

    fn assign(
        &self,
        identity: &mut SpaceIdentity,
        id: &str,
        path: String,
        collision: bool,
    ) -> Result<()> {
        let Some(item) = identity.get_mut(id) else {
            bail!("unknown item {id} in space {}", identity.space.key);
        };
        item.assign_output(path, collision)
    }

    fn claim_unique(
        &mut self,
        dir: &str,
        stem: &str,
        extension: Option<&str>,
        id: &str,
    ) -> (String, bool) {
        let file_name = |stem: &str| match extension {
            Some(extension) => format!("{stem}.{extension}"),
            None => stem.to_string(),
        };

        let first = file_name(stem);
        if self.registry.claim(dir, &first) {
            return (first, false);
        }

        let suffixed = format!("{stem}-{}", disambiguator(id));
        let candidate = file_name(&suffixed);
        if self.registry.claim(dir, &candidate) {
            return (candidate, true);
        }
        let mut counter = 2usize;
        loop {
            let candidate = file_name(&format!("{suffixed}-{counter}"));
            if self.registry.claim(dir, &candidate) {
                return (candidate, true);
            }
            counter += 1;
        }
    }
}

/// File stem for a page or blog post under the naming policy.
pub fn page_stem(item: &ContentItem, naming: &NamingSection, owns_attachments: bool) -> String {
    let file_stem = item.original_path.as_deref().map(|path| {
        let name = path.rsplit('/').next().unwrap_or(path);
        name.rsplit_once('.').map_or(name, |(stem, _)| stem)
    });

    let base = match file_stem {
        None => item.raw_title.clone(),
        Some(_) if naming.rename_all && item.title_source == TitleSource::Metadata => {
            item.raw_title.clone()
        }
        Some(stem) if naming.rename_all => {
            let stripped = strip_id(stem);
            if stripped.is_empty() {
                item.raw_title.clone()
            } else {
                stripped
            }
        }
        Some(stem) => match suffix_slug(stem) {
            Some((slug, _)) if owns_attachments => slug,
            _ => stem.to_string(),
        },
    };

    let stem = sanitize_name(&base, naming.use_underscore);
    if item.is_homepage
        && !naming.homepage_marker.is_empty()
        && !stem.starts_with(&naming.homepage_marker)
    {
        format!("{}{stem}", naming.homepage_marker)
    } else {
        stem
    }
}

fn status_rank(status: ItemStatus) -> u8 {
    match status {
        ItemStatus::Exported => 0,
        ItemStatus::Placeholder => 1,
        ItemStatus::MissingFile => 2,
    }
}

/// Stable suffix derived from an item id.
fn disambiguator(id: &str) -> String {
    let bare = ["doc:", "att:", "img:"]
        .iter()
        .find_map(|prefix| id.strip_prefix(prefix))
        .unwrap_or(id);
    let bare = bare.rsplit('/').next().unwrap_or(bare);
    let bare = bare.rsplit_once('.').map_or(bare, |(stem, _)| stem);
    sanitize_name(bare, true)
}

fn split_extension(file_name: &str) -> (&str, Option<&str>) {
    match file_name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() && !extension.is_empty() => {
            (stem, Some(extension))
        }
        _ => (file_name, None),
    }
}

fn collision_issue(space: &str, id: &str, dir: &str, stem: &str, name: &str) -> Issue {
    info!(space, item = id, dir, assigned = name, "filename collision");
    Issue::new(
        IssueKind::FilenameCollision,
        space,
        id,
        format!("`{stem}` already claimed in {dir}; assigned {name}"),
    )
}
