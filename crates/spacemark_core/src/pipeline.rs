//! Two-phase run: every space is scanned and resolved in parallel, then the
//! union of identity tables is frozen and every document is rewritten.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::attachments::{copy_attachment, inventory, is_available};
use crate::config::MigrationConfig;
use crate::draft::DraftConverter;
use crate::external::check_external_links;
use crate::identity::{IdentityIndex, SpaceIdentity, reconcile};
use crate::issues::{Issue, IssueKind, IssueLog};
use crate::metadata::{SpaceMetadata, load_space_metadata, locate_entities_file};
use crate::model::{ContentItem, ContentKind, ItemStatus, LinkState};
use crate::report::{ItemRow, LinkRow, MigrationReport, RunActivity};
use crate::resolver::Resolver;
use crate::rewriter::{LinkRewriter, record_dropped, relative_link};
use crate::runtime::ResolvedPaths;
use crate::scanner::{extract_references, scan_space};
use crate::storage::expand_storage_markup;

/// Space directories under the input root, sorted by name.
pub fn discover_spaces(input_root: &Path, config: &MigrationConfig) -> Result<Vec<String>> {
    let entries = fs::read_dir(input_root)
        .with_context(|| format!("failed to read input root {}", input_root.display()))?;
    let mut spaces = Vec::new();
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to list {}", input_root.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || config.layout.is_reserved_dir(&name) {
            continue;
        }
        spaces.push(name);
    }
    spaces.sort();
    Ok(spaces)
}

/// Phase 1 result for one space.
struct PreparedSpace {
    identity: SpaceIdentity,
    blog_bodies: BTreeMap<String, String>,
    issues: Vec<Issue>,
}

#[derive(Default)]
struct SpaceOutcome {
    links: Vec<LinkRow>,
    issues: Vec<Issue>,
    activity: RunActivity,
}

pub fn run_migration(
    paths: &ResolvedPaths,
    config: &MigrationConfig,
    converter: &dyn DraftConverter,
) -> Result<MigrationReport> {
    let spaces = discover_spaces(&paths.input_root, config)?;
    if spaces.is_empty() {
        warn!(input = %paths.input_root.display(), "no space directories found");
    }
    info!(spaces = spaces.len(), "phase 1: scan and resolve");

    let single_space = spaces.len() == 1;
    let prepared = spaces
        .par_iter()
        .map(|space| {
            (
                space.clone(),
                prepare_space(paths, config, space, single_space),
            )
        })
        .collect::<Vec<_>>();

    let mut issues = IssueLog::default();
    let mut identities = Vec::new();
    let mut blog_bodies = BTreeMap::new();
    for (space, outcome) in prepared {
        match outcome {
            Ok(prepared) => {
                issues.extend(prepared.issues);
                blog_bodies.insert(space, prepared.blog_bodies);
                identities.push(prepared.identity);
            }
            Err(error) => issues.push(Issue::new(
                IssueKind::DocumentFailed,
                space.clone(),
                space,
                format!("space skipped: {error:#}"),
            )),
        }
    }

    let (index, index_issues) = IdentityIndex::build(identities)?;
    issues.extend(index_issues);
    log_identity_table(&index);

    info!(spaces = index.spaces().count(), "phase 2: rewrite and copy");
    let rewriter = LinkRewriter::new(&index, config);
    let outcomes = index
        .spaces()
        .collect::<Vec<_>>()
        .par_iter()
        .map(|identity| {
            let bodies = blog_bodies.get(&identity.space.key);
            migrate_space(paths, config, converter, &index, &rewriter, identity, bodies)
        })
        .collect::<Vec<_>>();

    let mut links = Vec::new();
    let mut activity = RunActivity::default();
    for outcome in outcomes {
        links.extend(outcome.links);
        issues.extend(outcome.issues);
        activity.documents_written += outcome.activity.documents_written;
        activity.placeholders_written += outcome.activity.placeholders_written;
        activity.attachments_written += outcome.activity.attachments_written;
    }

    if config.external.check {
        annotate_external_checks(&mut links, config);
    }

    let items = index.items().map(ItemRow::from_item).collect();
    let report = MigrationReport::assemble(
        index.spaces().count(),
        items,
        links,
        issues.into_vec(),
        activity,
    );
    if config.output.reports {
        report.write_to(&paths.reports_dir())?;
    }
    info!(
        items = report.summary.items,
        links = report.summary.links,
        broken = report.summary.broken_links,
        "migration finished"
    );
    Ok(report)
}

fn prepare_space(
    paths: &ResolvedPaths,
    config: &MigrationConfig,
    space: &str,
    single_space: bool,
) -> Result<PreparedSpace> {
    let mut issues = Vec::new();
    let metadata = load_metadata(paths, config, space, single_space, &mut issues);

    let scan = scan_space(&paths.input_root, space, &config.layout)?;
    let inventory = inventory(&paths.input_root, space, &config.layout);
    for (path, error) in &inventory.failures {
        issues.push(Issue::new(
            IssueKind::DocumentFailed,
            space,
            path.clone(),
            format!("failed to read attachment: {error}"),
        ));
    }
    let (mut identity, reconcile_issues) =
        reconcile(space, metadata.as_ref(), &scan, &inventory.files);
    issues.extend(reconcile_issues);

    issues.extend(Resolver::new(config).resolve_space(&mut identity)?);
    debug!(space, items = identity.len(), "space prepared");

    Ok(PreparedSpace {
        identity,
        blog_bodies: metadata.map(|metadata| metadata.blog_bodies).unwrap_or_default(),
        issues,
    })
}

/// Metadata problems degrade the space; they never fail it.
fn load_metadata(
    paths: &ResolvedPaths,
    config: &MigrationConfig,
    space: &str,
    single_space: bool,
    issues: &mut Vec<Issue>,
) -> Option<SpaceMetadata> {
    let xml_root = paths.input_xml_root.as_deref()?;
    let Some(path) = locate_entities_file(xml_root, space, &config.layout, single_space) else {
        issues.push(Issue::new(
            IssueKind::MissingMetadata,
            space,
            space,
            format!(
                "no {} found under {}; using export names",
                config.layout.entities_file,
                xml_root.display()
            ),
        ));
        return None;
    };
    match load_space_metadata(&path, space) {
        Ok(metadata) => Some(metadata),
        Err(error) => {
            issues.push(Issue::new(
                IssueKind::CorruptXml,
                space,
                space,
                format!("{error:#}"),
            ));
            None
        }
    }
}

/// One mapping record per item, so the run log alone rebuilds the mapping.
fn log_identity_table(index: &IdentityIndex) {
    for item in index.items() {
        info!(
            space = %item.space,
            item = %item.id,
            kind = item.kind.as_str(),
            status = item.status.as_str(),
            original = item.original_path.as_deref().unwrap_or(""),
            output = item.output_path().unwrap_or(""),
            "identity mapping"
        );
    }
}

fn migrate_space(
    paths: &ResolvedPaths,
    config: &MigrationConfig,
    converter: &dyn DraftConverter,
    index: &IdentityIndex,
    rewriter: &LinkRewriter<'_>,
    identity: &SpaceIdentity,
    blog_bodies: Option<&BTreeMap<String, String>>,
) -> SpaceOutcome {
    let mut outcome = SpaceOutcome::default();
    for item in identity.items() {
        let result = match (item.kind, item.status) {
            (ContentKind::Attachment, ItemStatus::Exported) => {
                copy_item(paths, item, &mut outcome.activity)
            }
            (ContentKind::Attachment, _) => Ok(()),
            (_, ItemStatus::Placeholder) if config.output.placeholder_pages => {
                write_placeholder(paths, config, index, item).map(|()| {
                    outcome.activity.placeholders_written += 1;
                })
            }
            (_, ItemStatus::Placeholder) => Ok(()),
            _ => migrate_document(paths, config, converter, index, rewriter, item, blog_bodies)
                .map(|(links, issues)| {
                    outcome.links.extend(links);
                    outcome.issues.extend(issues);
                    outcome.activity.documents_written += 1;
                }),
        };
        if let Err(error) = result {
            outcome.issues.push(Issue::new(
                IssueKind::DocumentFailed,
                item.space.clone(),
                item.id.clone(),
                format!("{error:#}"),
            ));
        }
    }
    outcome
}

fn migrate_document(
    paths: &ResolvedPaths,
    config: &MigrationConfig,
    converter: &dyn DraftConverter,
    index: &IdentityIndex,
    rewriter: &LinkRewriter<'_>,
    item: &ContentItem,
    blog_bodies: Option<&BTreeMap<String, String>>,
) -> Result<(Vec<LinkRow>, Vec<Issue>)> {
    let html = match &item.source_file {
        Some(source) => {
            let bytes = fs::read(source)
                .with_context(|| format!("failed to read {}", source.display()))?;
            String::from_utf8_lossy(&bytes).to_string()
        }
        None => blog_bodies
            .and_then(|bodies| bodies.get(&item.id))
            .map(|body| {
                expand_storage_markup(body, &item.space, &item.id, &config.layout.attachments_dir)
            })
            .unwrap_or_default(),
    };

    let draft = converter
        .convert(&html)
        .with_context(|| format!("failed to convert item {}", item.id))?;
    let mut document = rewriter.rewrite(item, &draft);
    record_dropped(item, &extract_references(&html), &mut document);

    let output_path = item.output_path().unwrap_or_default();
    let content = compose(config, index, item, &document.content)?;
    write_output(&paths.output_root, output_path, &content)?;
    info!(
        space = %item.space,
        item = %item.id,
        output = output_path,
        links = document.references.len(),
        "document written"
    );

    let links = document
        .references
        .iter()
        .map(|reference| LinkRow::from_reference(reference, output_path))
        .collect();
    Ok((links, document.issues))
}

fn write_placeholder(
    paths: &ResolvedPaths,
    config: &MigrationConfig,
    index: &IdentityIndex,
    item: &ContentItem,
) -> Result<()> {
    let body = format!(
        "# {}\n\n> This page was not part of the export. It is listed in the space metadata only (source id {}).\n",
        item.raw_title.trim(),
        item.id
    );
    let content = compose(config, index, item, &body)?;
    let output_path = item.output_path().unwrap_or_default();
    write_output(&paths.output_root, output_path, &content)?;
    info!(space = %item.space, item = %item.id, output = output_path, "placeholder written");
    Ok(())
}

fn copy_item(paths: &ResolvedPaths, item: &ContentItem, activity: &mut RunActivity) -> Result<()> {
    let (Some(source), Some(output_path)) = (item.source_file.as_deref(), item.output_path()) else {
        return Ok(());
    };
    if !is_available(item) {
        warn!(space = %item.space, item = %item.id, "attachment vanished before copy");
        return Ok(());
    }
    let copied = copy_attachment(source, &paths.output_root.join(output_path))?;
    info!(space = %item.space, item = %item.id, output = output_path, copied, "attachment written");
    activity.attachments_written += 1;
    Ok(())
}

#[derive(Serialize)]
struct FrontMatter<'a> {
    title: &'a str,
    source_id: &'a str,
    space: &'a str,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    up: Option<String>,
}

fn compose(
    config: &MigrationConfig,
    index: &IdentityIndex,
    item: &ContentItem,
    body: &str,
) -> Result<String> {
    let body = body.trim_start_matches('\n');
    if !config.output.front_matter {
        return Ok(ensure_trailing_newline(body));
    }

    let up = item
        .parent_id
        .as_deref()
        .and_then(|parent| index.find_by_id(&item.space, parent))
        .and_then(ContentItem::output_path)
        .map(|parent| relative_link(item.output_dir().unwrap_or_default(), parent));
    let front_matter = FrontMatter {
        title: item.raw_title.trim(),
        source_id: &item.id,
        space: &item.space,
        kind: item.kind.as_str(),
        up,
    };
    let yaml = serde_yaml::to_string(&front_matter)
        .with_context(|| format!("failed to render front matter for {}", item.id))?;
    Ok(format!("---\n{yaml}---\n\n{}", ensure_trailing_newline(body)))
}

fn ensure_trailing_newline(body: &str) -> String {
    let mut body = body.trim_end().to_string();
    body.push('\n');
    body
}

fn write_output(output_root: &Path, output_path: &str, content: &str) -> Result<()> {
    let path = output_root.join(output_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))
}

fn annotate_external_checks(links: &mut [LinkRow], config: &MigrationConfig) {
    let targets = links
        .iter()
        .filter(|link| link.state == LinkState::ResolvedExternal)
        .map(|link| link.final_target.as_str())
        .collect::<Vec<_>>();
    let results = check_external_links(targets, &config.external);
    for link in links.iter_mut() {
        if link.state != LinkState::ResolvedExternal {
            continue;
        }
        if let Some(outcome) = results.get(&link.final_target)
            && !outcome.is_reachable()
        {
            link.detail = outcome.describe();
        }
    }
}
