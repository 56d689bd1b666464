use std::collections::BTreeMap;
use std::ops::Range;

use percent_encoding::percent_decode_str;
use tracing::{debug, info, warn};

use crate::config::{LinkSection, LinkStyle, MigrationConfig, WikiPipeEscape};
use crate::draft::{Draft, DraftReference};
use crate::identity::IdentityIndex;
use crate::issues::{Issue, IssueKind};
use crate::matchers::{MatcherSet, TargetKey};
use crate::model::{ContentItem, ContentKind, ItemStatus, LinkReference, LinkState, ReferenceKind};
use crate::scanner::RawReference;

/// Outcome of resolving one raw target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub state: LinkState,
    /// Rewritten destination; the raw target for external links, `None` when broken.
    pub target: Option<String>,
    pub target_id: Option<String>,
    pub target_kind: Option<ContentKind>,
    pub matcher: Option<&'static str>,
    pub detail: Option<String>,
    pub issue: Option<IssueKind>,
}

impl Resolution {
    fn external(raw: &str) -> Self {
        Self {
            state: LinkState::ResolvedExternal,
            target: Some(raw.to_string()),
            target_id: None,
            target_kind: None,
            matcher: None,
            detail: None,
            issue: None,
        }
    }

    fn broken(matcher: &'static str, issue: IssueKind, detail: String) -> Self {
        Self {
            state: LinkState::Broken,
            target: None,
            target_id: None,
            target_kind: None,
            matcher: Some(matcher),
            detail: Some(detail),
            issue: Some(issue),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RewrittenDocument {
    pub content: String,
    pub references: Vec<LinkReference>,
    pub issues: Vec<Issue>,
}

/// Rewrites draft references against the read-only identity index.
pub struct LinkRewriter<'a> {
    index: &'a IdentityIndex,
    matchers: MatcherSet,
    links: &'a LinkSection,
    placeholder_pages: bool,
}

impl<'a> LinkRewriter<'a> {
    pub fn new(index: &'a IdentityIndex, config: &'a MigrationConfig) -> Self {
        Self {
            index,
            matchers: MatcherSet::standard(config.base_url(), &config.layout.attachments_dir),
            links: &config.links,
            placeholder_pages: config.output.placeholder_pages,
        }
    }

    /// Classifies `raw` and looks it up; matchers are tried by rank until one
    /// names a known item.
    pub fn resolve(&self, source: &ContentItem, raw: &str) -> Resolution {
        let (target, hits) = self.matchers.classify(raw, &source_dir(source));
        let Some(first) = hits.first() else {
            return Resolution::external(raw);
        };

        for hit in &hits {
            let Some(item) = self.lookup(&hit.key, &source.space) else {
                continue;
            };
            if item.kind == ContentKind::Attachment && item.status == ItemStatus::MissingFile {
                return Resolution {
                    target_id: Some(item.id.clone()),
                    target_kind: Some(item.kind),
                    ..Resolution::broken(
                        hit.matcher,
                        IssueKind::MissingAttachment,
                        format!("attachment {} is missing on disk", item.id),
                    )
                };
            }
            if item.status == ItemStatus::Placeholder && !self.placeholder_pages {
                return Resolution {
                    target_id: Some(item.id.clone()),
                    target_kind: Some(item.kind),
                    ..Resolution::broken(
                        hit.matcher,
                        IssueKind::UnresolvableLink,
                        format!("{} {} was not exported", item.kind.as_str(), item.id),
                    )
                };
            }
            let Some(output_path) = item.output_path() else {
                continue;
            };
            let mut link = relative_link(source.output_dir().unwrap_or_default(), output_path);
            if item.kind.is_document()
                && let Some(fragment) = &target.fragment
            {
                link.push('#');
                link.push_str(fragment);
            }
            return Resolution {
                state: LinkState::ResolvedInternal,
                target: Some(link),
                target_id: Some(item.id.clone()),
                target_kind: Some(item.kind),
                matcher: Some(hit.matcher),
                detail: None,
                issue: None,
            };
        }

        let issue = if hits.iter().any(|hit| hit.key.is_attachment()) {
            IssueKind::MissingAttachment
        } else {
            IssueKind::UnresolvableLink
        };
        Resolution::broken(
            first.matcher,
            issue,
            format!("no exported item for {}", first.key.describe()),
        )
    }

    fn lookup(&self, key: &TargetKey, source_space: &str) -> Option<&'a ContentItem> {
        match key {
            TargetKey::Id(id) => self.index.find_by_id(source_space, id),
            TargetKey::OriginalPath(path) => self.index.find_by_path(path),
            TargetKey::Attachment { owner, file } => self.index.find_attachment(owner, file),
            TargetKey::Title { space, title } => self.index.find_by_title(space, title),
            TargetKey::Homepage { space } => self.index.homepage(space),
        }
    }

    /// Produces the final document text; every reference ends terminal.
    pub fn rewrite(&self, source: &ContentItem, draft: &Draft) -> RewrittenDocument {
        let resolved = draft
            .references
            .iter()
            .map(|reference| (reference, self.resolve(source, &reference.raw_target)))
            .collect::<Vec<_>>();

        let mut issues = Vec::new();
        let mut references = Vec::with_capacity(resolved.len());
        for (reference, resolution) in &resolved {
            info!(
                space = %source.space,
                item = %source.id,
                target = %reference.raw_target,
                state = resolution.state.as_str(),
                matcher = resolution.matcher.unwrap_or("none"),
                final_target = resolution.target.as_deref().unwrap_or(""),
                "link"
            );
            if let Some(kind) = resolution.issue {
                issues.push(Issue::new(
                    kind,
                    source.space.clone(),
                    source.id.clone(),
                    format!(
                        "{} -> {}",
                        reference.raw_target,
                        resolution.detail.as_deref().unwrap_or("broken")
                    ),
                ));
            }

            let mut link = LinkReference::new(
                source.id.clone(),
                reference.raw_target.clone(),
                reference.label.clone(),
                reference.kind,
                reference.span.clone(),
            );
            link.state = resolution.state;
            link.final_target = resolution.target.clone();
            link.target_id = resolution.target_id.clone();
            link.matcher = resolution.matcher;
            link.detail = resolution.detail.clone();
            link.issue = resolution.issue;
            references.push(link);
        }

        let content = self.render_range(
            &draft.content,
            0..draft.content.len(),
            &resolved,
        );
        debug!(item = %source.id, references = references.len(), "rewrote document");
        RewrittenDocument {
            content,
            references,
            issues,
        }
    }

    fn render_range(
        &self,
        content: &str,
        range: Range<usize>,
        resolved: &[(&DraftReference, Resolution)],
    ) -> String {
        let mut output = String::with_capacity(range.len());
        let mut cursor = range.start;
        let mut index = 0;
        while index < resolved.len() {
            let (reference, resolution) = &resolved[index];
            let span = reference.span.clone();
            let nested_end = resolved[index + 1..]
                .iter()
                .position(|(inner, _)| inner.span.start >= span.end)
                .map_or(resolved.len(), |offset| index + 1 + offset);
            let nested = &resolved[index + 1..nested_end];

            output.push_str(&content[cursor..span.start]);
            let label = self.render_range(content, reference.label_span.clone(), nested);
            let in_table = line_of(content, span.start).trim_start().starts_with('|');
            output.push_str(&self.render_reference(
                reference,
                resolution,
                &label,
                !nested.is_empty(),
                in_table,
            ));
            cursor = span.end;
            index = nested_end;
        }
        output.push_str(&content[cursor..range.end]);
        output
    }

    fn render_reference(
        &self,
        reference: &DraftReference,
        resolution: &Resolution,
        label: &str,
        has_nested: bool,
        in_table: bool,
    ) -> String {
        let title = reference
            .title
            .as_deref()
            .map(|title| format!(" \"{}\"", title.replace('"', "\\\"")))
            .unwrap_or_default();

        let Some(target) = resolution.target.as_deref() else {
            let noun = match reference.kind {
                ReferenceKind::Link => "broken link",
                ReferenceKind::Image => "broken image",
            };
            let label = if has_nested {
                label.to_string()
            } else {
                strip_delimiters(label)
            };
            let subject = strip_delimiters(
                resolution
                    .target_id
                    .as_deref()
                    .unwrap_or(&reference.raw_target),
            );
            return if label.trim().is_empty() {
                format!("({noun}: {subject})")
            } else {
                format!("{} ({noun}: {subject})", label.trim_end())
            };
        };

        match reference.kind {
            ReferenceKind::Image => format!("![{label}]({}{title})", destination(target)),
            ReferenceKind::Link
                if self.links.style == LinkStyle::Wiki
                    && resolution.state == LinkState::ResolvedInternal
                    && !has_nested =>
            {
                let escape = match self.links.wiki_pipe_escape {
                    WikiPipeEscape::Always => true,
                    WikiPipeEscape::InTables => in_table,
                    WikiPipeEscape::Never => false,
                };
                let separator = if escape { "\\|" } else { "|" };
                let label = if escape {
                    label.replace('|', "\\|")
                } else {
                    label.to_string()
                };
                let target = wiki_target(target, resolution.target_kind);
                format!("[[{target}{separator}{label}]]")
            }
            ReferenceKind::Link => format!("[{label}]({}{title})", destination(target)),
        }
    }
}

/// Adds a broken reference for every source reference the converter dropped,
/// so no target disappears without a row and an issue.
pub fn record_dropped(
    source: &ContentItem,
    raw: &[RawReference],
    document: &mut RewrittenDocument,
) {
    let mut kept = BTreeMap::<String, usize>::new();
    for reference in &document.references {
        *kept.entry(comparable(&reference.raw_target)).or_default() += 1;
    }
    for reference in raw {
        if let Some(count) = kept.get_mut(&comparable(&reference.target))
            && *count > 0
        {
            *count -= 1;
            continue;
        }
        let detail = "reference lost during conversion";
        warn!(
            space = %source.space,
            item = %source.id,
            target = %reference.target,
            "reference lost during conversion"
        );
        document.issues.push(Issue::new(
            IssueKind::UnresolvableLink,
            source.space.clone(),
            source.id.clone(),
            format!("{} -> {detail}", reference.target),
        ));
        let mut link = LinkReference::new(
            source.id.clone(),
            reference.target.clone(),
            String::new(),
            reference.kind,
            reference.offset..reference.offset,
        );
        link.state = LinkState::Broken;
        link.detail = Some(detail.to_string());
        link.issue = Some(IssueKind::UnresolvableLink);
        document.references.push(link);
    }
}

fn comparable(target: &str) -> String {
    let target = target.trim();
    let target = target
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .unwrap_or(target);
    percent_decode_str(target).decode_utf8_lossy().into_owned()
}

fn source_dir(source: &ContentItem) -> String {
    match source.original_path.as_deref() {
        Some(path) => path
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default(),
        None => source.space.clone(),
    }
}

/// Path from a document directory to another output path, both relative to
/// the output root.
pub fn relative_link(from_dir: &str, to: &str) -> String {
    let from = from_dir
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    let to_parts = to.split('/').filter(|part| !part.is_empty()).collect::<Vec<_>>();
    let Some((_, to_dir)) = to_parts.split_last() else {
        return to.to_string();
    };
    let common = from
        .iter()
        .zip(to_dir.iter())
        .take_while(|(left, right)| left == right)
        .count();

    let mut parts = vec![".."; from.len() - common];
    parts.extend(to_parts[common..].iter().copied());
    parts.join("/")
}

fn wiki_target(target: &str, kind: Option<ContentKind>) -> String {
    let (path, fragment) = match target.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (target, None),
    };
    let path = match kind {
        Some(kind) if kind.is_document() => path.strip_suffix(".md").unwrap_or(path),
        _ => path,
    };
    match fragment {
        Some(fragment) => format!("{path}#{fragment}"),
        None => path.to_string(),
    }
}

/// Markdown destination, angle-wrapped when it would not parse bare.
fn destination(target: &str) -> String {
    let mut depth = 0i32;
    let mut balanced = true;
    for ch in target.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    balanced = false;
                }
            }
            _ => {}
        }
    }
    if target.contains(char::is_whitespace) || !balanced || depth != 0 || target.contains('<') {
        format!("<{}>", target.replace('<', "%3C").replace('>', "%3E"))
    } else {
        target.to_string()
    }
}

/// Drops Markdown link delimiters so fallback text cannot open a link or
/// leave a parenthesis unbalanced.
fn strip_delimiters(text: &str) -> String {
    text.chars()
        .filter(|ch| !matches!(ch, '[' | ']' | '(' | ')'))
        .collect()
}

fn line_of(content: &str, at: usize) -> &str {
    let start = content[..at].rfind('\n').map_or(0, |newline| newline + 1);
    let end = content[at..].find('\n').map_or(content.len(), |newline| at + newline);
    &content[start..end]
}

#[cfg(test)]
mod tests {
    use super::{LinkRewriter, record_dropped, relative_link};
    use crate::config::{LinkStyle, MigrationConfig, WikiPipeEscape};
    use crate::draft::Draft;
    use crate::identity::{IdentityIndex, SpaceIdentity};
    use crate::issues::IssueKind;
    use crate::model::{ContentItem, ContentKind, ItemStatus, LinkState, ReferenceKind, TitleSource};
    use crate::scanner::RawReference;

    fn item(id: &str, kind: ContentKind, space: &str, original: &str, output: &str) -> ContentItem {
        let mut item = ContentItem::new(id, kind, space, id, TitleSource::Heading);
        item.original_path = Some(original.to_string());
        item.assign_output(output.to_string(), false).expect("assign");
        item
    }

    fn index() -> IdentityIndex {
        let mut a = SpaceIdentity::new("A");
        a.insert(item("100", ContentKind::Page, "A", "A/Home_100.html", "A/_Home.md"));
        a.insert(item("200", ContentKind::Page, "A", "A/Guide_200.html", "A/Guide Setup.md"));
        let mut chart = item(
            "5001",
            ContentKind::Attachment,
            "A",
            "A/attachments/100/5001.png",
            "A/attachments/100/chart.png",
        );
        chart.owner_id = Some("100".to_string());
        a.insert(chart);
        let mut lost = ContentItem::new("5002", ContentKind::Attachment, "A", "plan.pdf", TitleSource::Metadata);
        lost.owner_id = Some("100".to_string());
        lost.status = ItemStatus::MissingFile;
        lost.assign_output("A/attachments/100/plan.pdf".to_string(), false)
            .expect("assign");
        a.insert(lost);
        let mut questions =
            ContentItem::new("101", ContentKind::Page, "A", "Questions", TitleSource::Metadata);
        questions.status = ItemStatus::Placeholder;
        questions
            .assign_output("A/Questions.md".to_string(), false)
            .expect("assign");
        a.insert(questions);

        let mut b = SpaceIdentity::new("B");
        let mut target = item("777", ContentKind::Page, "B", "B/777.html", "B/Target Page.md");
        target.raw_title = "Target Page".to_string();
        b.insert(target);

        IdentityIndex::build(vec![a, b]).expect("index").0
    }

    fn source(index: &IdentityIndex) -> ContentItem {
        index.item("A", "100").expect("source").clone()
    }

    #[test]
    fn relative_links_climb_to_common_directory() {
        assert_eq!(relative_link("A", "A/Guide.md"), "Guide.md");
        assert_eq!(relative_link("A", "B/Target.md"), "../B/Target.md");
        assert_eq!(relative_link("A/blogposts", "A/attachments/1/x.png"), "../attachments/1/x.png");
        assert_eq!(relative_link("", "A/x.md"), "A/x.md");
    }

    #[test]
    fn cross_space_base_url_link_resolves() {
        let index = index();
        let config = MigrationConfig::default();
        let rewriter = LinkRewriter::new(&index, &config);
        let draft = Draft::from_markdown(
            "See [target](https://confluence.example.com/pages/viewpage.action?pageId=777#part).",
        );
        let document = rewriter.rewrite(&source(&index), &draft);
        assert_eq!(document.content, "See [target](<../B/Target Page.md#part>).");
        assert_eq!(document.references[0].state, LinkState::ResolvedInternal);
        assert_eq!(document.references[0].matcher, Some("page_id_url"));
        assert!(document.issues.is_empty());
    }

    #[test]
    fn broken_links_keep_markdown_balanced() {
        let index = index();
        let config = MigrationConfig::default();
        let rewriter = LinkRewriter::new(&index, &config);
        let draft = Draft::from_markdown("Old [[draft] page](Gone_99999.html) here.");
        let document = rewriter.rewrite(&source(&index), &draft);
        assert_eq!(document.references[0].state, LinkState::Broken);
        assert_eq!(document.issues[0].kind, IssueKind::UnresolvableLink);
        assert_eq!(
            document.content,
            "Old draft page (broken link: Gone_99999.html) here."
        );
        let opens = document.content.matches('[').count();
        let closes = document.content.matches(']').count();
        assert_eq!(opens, closes);
    }

    #[test]
    fn missing_attachment_is_broken_with_issue() {
        let index = index();
        let config = MigrationConfig::default();
        let rewriter = LinkRewriter::new(&index, &config);
        let draft = Draft::from_markdown(
            "[plan](https://confluence.example.com/download/attachments/100/plan.pdf) \
             [other](attachments/100/nothing.zip)",
        );
        let document = rewriter.rewrite(&source(&index), &draft);
        let kinds = document.issues.iter().map(|issue| issue.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![IssueKind::MissingAttachment, IssueKind::MissingAttachment]
        );
        assert_eq!(
            document.content,
            "plan (broken link: 5002) other (broken link: attachments/100/nothing.zip)"
        );
    }

    #[test]
    fn external_links_and_nested_images() {
        let index = index();
        let config = MigrationConfig::default();
        let rewriter = LinkRewriter::new(&index, &config);
        let draft = Draft::from_markdown(
            "[![chart](attachments/100/5001.png)](Guide_200.html) [web](https://example.org/x)",
        );
        let document = rewriter.rewrite(&source(&index), &draft);
        assert_eq!(
            document.content,
            "[![chart](attachments/100/chart.png)](<Guide Setup.md>) [web](https://example.org/x)"
        );
        let states = document
            .references
            .iter()
            .map(|reference| reference.state)
            .collect::<Vec<_>>();
        assert_eq!(
            states,
            vec![
                LinkState::ResolvedInternal,
                LinkState::ResolvedInternal,
                LinkState::ResolvedExternal
            ]
        );
    }

    #[test]
    fn wiki_links_escape_pipes_inside_tables() {
        let index = index();
        let mut config = MigrationConfig::default();
        config.links.style = LinkStyle::Wiki;
        config.links.wiki_pipe_escape = WikiPipeEscape::InTables;
        let rewriter = LinkRewriter::new(&index, &config);
        let draft = Draft::from_markdown(
            "| [a|b](Guide_200.html) | ![c](attachments/100/5001.png) |\n[Target](/display/B/Target+Page)",
        );
        let document = rewriter.rewrite(&source(&index), &draft);
        assert_eq!(
            document.content,
            "| [[Guide Setup\\|a\\|b]] | ![c](attachments/100/chart.png) |\n[[../B/Target Page|Target]]"
        );
    }

    #[test]
    fn broken_fallback_balances_parentheses() {
        let index = index();
        let config = MigrationConfig::default();
        let rewriter = LinkRewriter::new(&index, &config);
        let draft = Draft::from_markdown("x [old (v1](<Plan_(draft_99999.html>) y");
        let document = rewriter.rewrite(&source(&index), &draft);
        assert_eq!(document.references[0].state, LinkState::Broken);
        assert_eq!(
            document.content,
            "x old v1 (broken link: Plan_draft_99999.html) y"
        );
        assert_eq!(
            document.content.matches('(').count(),
            document.content.matches(')').count()
        );
    }

    #[test]
    fn placeholder_targets_follow_placeholder_pages_setting() {
        let index = index();
        let draft = Draft::from_markdown("[faq](/pages/viewpage.action?pageId=101)");

        let config = MigrationConfig::default();
        let rewriter = LinkRewriter::new(&index, &config);
        let document = rewriter.rewrite(&source(&index), &draft);
        assert_eq!(document.references[0].state, LinkState::ResolvedInternal);
        assert_eq!(document.content, "[faq](Questions.md)");

        let mut config = MigrationConfig::default();
        config.output.placeholder_pages = false;
        let rewriter = LinkRewriter::new(&index, &config);
        let document = rewriter.rewrite(&source(&index), &draft);
        assert_eq!(document.references[0].state, LinkState::Broken);
        assert_eq!(document.references[0].target_id.as_deref(), Some("101"));
        assert_eq!(document.issues[0].kind, IssueKind::UnresolvableLink);
        assert_eq!(document.content, "faq (broken link: 101)");
    }

    #[test]
    fn references_dropped_by_conversion_become_broken() {
        let index = index();
        let config = MigrationConfig::default();
        let rewriter = LinkRewriter::new(&index, &config);
        let draft = Draft::from_markdown("[guide](Guide_200.html) and [guide again](Guide_200.html)");
        let mut document = rewriter.rewrite(&source(&index), &draft);
        let raw = ["Guide_200.html", "Guide%5F200.html", "Lost_300.html"]
            .iter()
            .enumerate()
            .map(|(offset, target)| RawReference {
                kind: ReferenceKind::Link,
                target: target.to_string(),
                offset: offset * 10,
            })
            .collect::<Vec<_>>();

        record_dropped(&source(&index), &raw, &mut document);
        assert_eq!(document.references.len(), 3);
        let lost = &document.references[2];
        assert_eq!(lost.raw_target, "Lost_300.html");
        assert_eq!(lost.state, LinkState::Broken);
        assert_eq!(lost.issue, Some(IssueKind::UnresolvableLink));
        assert_eq!(document.issues.len(), 1);
        assert!(document.issues[0].detail.contains("lost during conversion"));
    }
}
