use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::issues::{Issue, IssueKind};
use crate::model::{ContentItem, ContentKind, ItemStatus, LinkReference, LinkState};

pub const ITEMS_REPORT: &str = "items.csv";
pub const LINKS_REPORT: &str = "links.csv";
pub const ISSUES_REPORT: &str = "issues.csv";
pub const SUMMARY_REPORT: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemRow {
    pub id: String,
    pub space: String,
    pub kind: ContentKind,
    pub original_path: String,
    pub final_path: String,
    pub status: ItemStatus,
    pub collision: bool,
    pub content_hash: String,
}

impl ItemRow {
    pub fn from_item(item: &ContentItem) -> Self {
        Self {
            id: item.id.clone(),
            space: item.space.clone(),
            kind: item.kind,
            original_path: item.original_path.clone().unwrap_or_default(),
            final_path: item.output_path().unwrap_or_default().to_string(),
            status: item.status,
            collision: item.had_collision(),
            content_hash: item.content_hash.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkRow {
    pub source_id: String,
    pub source_path: String,
    pub raw_target: String,
    pub final_target: String,
    pub state: LinkState,
    pub matcher: String,
    pub detail: String,
    /// Item the reference named, if any; not written to `links.csv`.
    pub target_id: String,
    pub issue: Option<IssueKind>,
}

impl LinkRow {
    pub fn from_reference(reference: &LinkReference, source_path: &str) -> Self {
        Self {
            source_id: reference.source_item_id.clone(),
            source_path: source_path.to_string(),
            raw_target: reference.raw_target.clone(),
            final_target: reference.final_target.clone().unwrap_or_default(),
            state: reference.state,
            matcher: reference.matcher.unwrap_or_default().to_string(),
            detail: reference.detail.clone().unwrap_or_default(),
            target_id: reference.target_id.clone().unwrap_or_default(),
            issue: reference.issue,
        }
    }
}

/// Work done outside the identity table, counted by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunActivity {
    pub documents_written: usize,
    pub placeholders_written: usize,
    /// Attachments present at their output path, copied or already current.
    pub attachments_written: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub spaces: usize,
    pub items: usize,
    pub pages: usize,
    pub blog_posts: usize,
    pub attachments: usize,
    pub placeholders: usize,
    pub missing_files: usize,
    pub collisions: usize,
    pub links: usize,
    pub links_by_state: BTreeMap<String, usize>,
    pub issues_by_kind: BTreeMap<String, usize>,
    pub broken_links: usize,
    /// Distinct attachments that are missing, however many links name them.
    pub missing_attachments: usize,
    pub activity: RunActivity,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub summary: MigrationSummary,
    pub items: Vec<ItemRow>,
    pub links: Vec<LinkRow>,
    pub issues: Vec<Issue>,
}

impl MigrationReport {
    /// Sorts every table and derives the summary counts.
    pub fn assemble(
        spaces: usize,
        mut items: Vec<ItemRow>,
        mut links: Vec<LinkRow>,
        mut issues: Vec<Issue>,
        activity: RunActivity,
    ) -> Self {
        items.sort_by(|left, right| {
            left.space
                .cmp(&right.space)
                .then_with(|| left.final_path.cmp(&right.final_path))
                .then_with(|| left.id.cmp(&right.id))
        });
        links.sort_by(|left, right| {
            left.source_path
                .cmp(&right.source_path)
                .then_with(|| left.source_id.cmp(&right.source_id))
                .then_with(|| left.raw_target.cmp(&right.raw_target))
                .then_with(|| left.final_target.cmp(&right.final_target))
        });
        issues.sort_by(|left, right| {
            left.space
                .cmp(&right.space)
                .then_with(|| left.kind.cmp(&right.kind))
                .then_with(|| left.subject.cmp(&right.subject))
                .then_with(|| left.detail.cmp(&right.detail))
        });
        issues.dedup();

        let mut summary = MigrationSummary {
            spaces,
            items: items.len(),
            links: links.len(),
            activity,
            ..MigrationSummary::default()
        };
        for item in &items {
            match item.kind {
                ContentKind::Page => summary.pages += 1,
                ContentKind::BlogPost => summary.blog_posts += 1,
                ContentKind::Attachment => summary.attachments += 1,
            }
            match item.status {
                ItemStatus::Placeholder => summary.placeholders += 1,
                ItemStatus::MissingFile => summary.missing_files += 1,
                ItemStatus::Exported => {}
            }
            if item.collision {
                summary.collisions += 1;
            }
        }
        for link in &links {
            *summary
                .links_by_state
                .entry(link.state.as_str().to_string())
                .or_default() += 1;
            if link.state == LinkState::Broken {
                summary.broken_links += 1;
            }
        }
        for issue in &issues {
            *summary
                .issues_by_kind
                .entry(issue.kind.as_str().to_string())
                .or_default() += 1;
        }
        summary.missing_attachments = count_missing_attachments(&items, &links);

        Self {
            summary,
            items,
            links,
            issues,
        }
    }

    /// Broken links or missing attachments make the run exit non-zero.
    pub fn has_unresolved(&self) -> bool {
        self.summary.broken_links > 0 || self.summary.missing_attachments > 0
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create report directory {}", dir.display()))?;

        let items = render_csv(
            &[
                "id",
                "space",
                "kind",
                "original_path",
                "final_path",
                "status",
                "collision",
                "content_hash",
            ],
            self.items.iter().map(|row| {
                vec![
                    row.id.clone(),
                    row.space.clone(),
                    row.kind.as_str().to_string(),
                    row.original_path.clone(),
                    row.final_path.clone(),
                    row.status.as_str().to_string(),
                    row.collision.to_string(),
                    row.content_hash.clone(),
                ]
            }),
        );
        write_report(&dir.join(ITEMS_REPORT), &items)?;

        let links = render_csv(
            &[
                "source_id",
                "source_path",
                "raw_target",
                "final_target",
                "state",
                "matcher",
                "detail",
            ],
            self.links.iter().map(|row| {
                vec![
                    row.source_id.clone(),
                    row.source_path.clone(),
                    row.raw_target.clone(),
                    row.final_target.clone(),
                    row.state.as_str().to_string(),
                    row.matcher.clone(),
                    row.detail.clone(),
                ]
            }),
        );
        write_report(&dir.join(LINKS_REPORT), &links)?;

        let issues = render_csv(
            &["severity", "kind", "space", "subject", "detail"],
            self.issues.iter().map(|issue| {
                vec![
                    issue.severity.as_str().to_string(),
                    issue.kind.as_str().to_string(),
                    issue.space.clone(),
                    issue.subject.clone(),
                    issue.detail.clone(),
                ]
            }),
        );
        write_report(&dir.join(ISSUES_REPORT), &issues)?;

        let summary = serde_json::to_string_pretty(&self.summary)
            .context("failed to serialize run summary")?;
        write_report(&dir.join(SUMMARY_REPORT), &format!("{summary}\n"))
    }
}

fn render_csv(header: &[&str], rows: impl Iterator<Item = Vec<String>>) -> String {
    let mut output = header.join(",");
    output.push('\n');
    for row in rows {
        let line = row
            .iter()
            .map(|field| csv_field(field))
            .collect::<Vec<_>>()
            .join(",");
        output.push_str(&line);
        output.push('\n');
    }
    output
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_report(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

/// Missing-file attachment items, plus attachment targets no item names.
fn count_missing_attachments(items: &[ItemRow], links: &[LinkRow]) -> usize {
    let known = items
        .iter()
        .filter(|item| item.kind == ContentKind::Attachment && item.status == ItemStatus::MissingFile)
        .map(|item| (item.space.as_str(), item.id.as_str()))
        .collect::<BTreeSet<_>>();
    let known_ids = known.iter().map(|(_, id)| *id).collect::<BTreeSet<_>>();
    let unknown = links
        .iter()
        .filter(|link| link.issue == Some(IssueKind::MissingAttachment))
        .filter(|link| !known_ids.contains(link.target_id.as_str()))
        .map(|link| link.detail.as_str())
        .collect::<BTreeSet<_>>();
    known.len() + unknown.len()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{ItemRow, LinkRow, MigrationReport, RunActivity, csv_field};
    use crate::issues::{Issue, IssueKind};
    use crate::model::{ContentKind, ItemStatus, LinkState};

    fn item(id: &str, path: &str, status: ItemStatus) -> ItemRow {
        ItemRow {
            id: id.to_string(),
            space: "A".to_string(),
            kind: ContentKind::Page,
            original_path: String::new(),
            final_path: path.to_string(),
            status,
            collision: false,
            content_hash: String::new(),
        }
    }

    fn link(target: &str, state: LinkState) -> LinkRow {
        LinkRow {
            source_id: "1".to_string(),
            source_path: "A/Home.md".to_string(),
            raw_target: target.to_string(),
            final_target: String::new(),
            state,
            matcher: String::new(),
            detail: String::new(),
            target_id: String::new(),
            issue: None,
        }
    }

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn assemble_sorts_and_counts() {
        let report = MigrationReport::assemble(
            1,
            vec![
                item("2", "A/b.md", ItemStatus::Placeholder),
                item("1", "A/a.md", ItemStatus::Exported),
            ],
            vec![
                link("z.html", LinkState::Broken),
                link("a.html", LinkState::ResolvedInternal),
            ],
            vec![Issue::new(IssueKind::UnresolvableLink, "A", "1", "gone")],
            RunActivity::default(),
        );
        assert_eq!(report.items[0].id, "1");
        assert_eq!(report.links[0].raw_target, "a.html");
        assert_eq!(report.summary.placeholders, 1);
        assert_eq!(report.summary.broken_links, 1);
        assert_eq!(report.summary.missing_attachments, 0);
        assert_eq!(report.summary.links_by_state.get("broken"), Some(&1));
        assert!(report.has_unresolved());
    }

    #[test]
    fn write_to_produces_all_reports() {
        let temp = tempdir().expect("tempdir");
        let report = MigrationReport::assemble(
            1,
            vec![item("1", "A/a.md", ItemStatus::Exported)],
            Vec::new(),
            Vec::new(),
            RunActivity::default(),
        );
        report.write_to(temp.path()).expect("write reports");

        let items = fs::read_to_string(temp.path().join("items.csv")).expect("items");
        assert_eq!(
            items,
            "id,space,kind,original_path,final_path,status,collision,content_hash\n\
             1,A,page,,A/a.md,exported,false,\n"
        );
        let summary = fs::read_to_string(temp.path().join("summary.json")).expect("summary");
        assert!(summary.contains("\"items\": 1"));
        assert!(temp.path().join("links.csv").is_file());
        assert!(temp.path().join("issues.csv").is_file());
        assert!(!report.has_unresolved());
    }

    #[test]
    fn missing_attachments_are_counted_once_each() {
        let mut lost = item("5002", "A/attachments/100/plan.pdf", ItemStatus::MissingFile);
        lost.kind = ContentKind::Attachment;
        let mut first = link("attachments/100/plan.pdf", LinkState::Broken);
        first.target_id = "5002".to_string();
        first.issue = Some(IssueKind::MissingAttachment);
        let mut second = first.clone();
        second.source_id = "2".to_string();
        second.source_path = "A/Other.md".to_string();
        let mut unknown = link("attachments/100/none.zip", LinkState::Broken);
        unknown.issue = Some(IssueKind::MissingAttachment);
        unknown.detail = "no exported item for attachment 100/none.zip".to_string();
        let mut unknown_again = unknown.clone();
        unknown_again.source_path = "A/Other.md".to_string();

        let report = MigrationReport::assemble(
            1,
            vec![lost],
            vec![first, second, unknown, unknown_again],
            vec![
                Issue::new(IssueKind::MissingAttachment, "A", "5002", "not present on disk"),
                Issue::new(IssueKind::MissingAttachment, "A", "1", "plan.pdf"),
                Issue::new(IssueKind::MissingAttachment, "A", "2", "plan.pdf"),
            ],
            RunActivity::default(),
        );
        assert_eq!(report.summary.missing_attachments, 2);
        assert_eq!(report.summary.broken_links, 4);
        assert_eq!(report.summary.issues_by_kind.get("missing_attachment"), Some(&3));
    }
}
