use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Failure taxonomy. Every kind is scoped to one link, item, or space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingMetadata,
    UnresolvableLink,
    FilenameCollision,
    MissingAttachment,
    CorruptXml,
    ConsistencyWarning,
    DocumentFailed,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingMetadata => "missing_metadata",
            Self::UnresolvableLink => "unresolvable_link",
            Self::FilenameCollision => "filename_collision",
            Self::MissingAttachment => "missing_attachment",
            Self::CorruptXml => "corrupt_xml",
            Self::ConsistencyWarning => "consistency_warning",
            Self::DocumentFailed => "document_failed",
        }
    }

    pub fn default_severity(self) -> Severity {
        match self {
            Self::FilenameCollision => Severity::Info,
            Self::CorruptXml | Self::DocumentFailed => Severity::Error,
            Self::MissingMetadata
            | Self::UnresolvableLink
            | Self::MissingAttachment
            | Self::ConsistencyWarning => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub space: String,
    pub subject: String,
    pub detail: String,
}

impl Issue {
    pub fn new(
        kind: IssueKind,
        space: impl Into<String>,
        subject: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            severity: kind.default_severity(),
            kind,
            space: space.into(),
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    /// Records the issue in the run log at its severity.
    pub fn emit(&self) {
        let kind = self.kind.as_str();
        match self.severity {
            Severity::Info => info!(
                kind,
                space = %self.space,
                subject = %self.subject,
                "{}",
                self.detail
            ),
            Severity::Warning => warn!(
                kind,
                space = %self.space,
                subject = %self.subject,
                "{}",
                self.detail
            ),
            Severity::Error => error!(
                kind,
                space = %self.space,
                subject = %self.subject,
                "{}",
                self.detail
            ),
        }
    }
}

/// Collects issues and logs each one as it arrives.
#[derive(Debug, Default)]
pub struct IssueLog {
    issues: Vec<Issue>,
}

impl IssueLog {
    pub fn push(&mut self, issue: Issue) {
        issue.emit();
        self.issues.push(issue);
    }

    pub fn extend(&mut self, issues: impl IntoIterator<Item = Issue>) {
        for issue in issues {
            self.push(issue);
        }
    }

    pub fn into_vec(self) -> Vec<Issue> {
        self.issues
    }
}
