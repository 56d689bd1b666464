use std::ops::Range;

use anyhow::{Context, Result};

use crate::model::ReferenceKind;

/// A hyperlink or image located in draft Markdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftReference {
    pub kind: ReferenceKind,
    pub label: String,
    /// Byte range of the label text, between the brackets.
    pub label_span: Range<usize>,
    pub raw_target: String,
    pub title: Option<String>,
    /// Byte range of the whole reference, `!` included for images.
    pub span: Range<usize>,
}

/// Markdown produced from one HTML document, with every reference located.
/// References are ordered by start offset; an image nested inside a link
/// label follows the link.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub content: String,
    pub references: Vec<DraftReference>,
}

impl Draft {
    pub fn from_markdown(content: impl Into<String>) -> Self {
        let content = content.into();
        let references = locate_references(&content);
        Self {
            content,
            references,
        }
    }
}

/// HTML to Markdown conversion seam. Implementations must be pure.
pub trait DraftConverter: Send + Sync {
    fn convert(&self, html: &str) -> Result<Draft>;
}

#[derive(Debug, Clone)]
pub struct HtmdConverter {
    skip_tags: Vec<&'static str>,
}

impl Default for HtmdConverter {
    fn default() -> Self {
        Self {
            skip_tags: vec!["head", "script", "style", "noscript"],
        }
    }
}

impl DraftConverter for HtmdConverter {
    fn convert(&self, html: &str) -> Result<Draft> {
        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(self.skip_tags.clone())
            .build();
        let markdown = converter
            .convert(html)
            .context("failed to convert HTML to Markdown")?;
        Ok(Draft::from_markdown(markdown))
    }
}

/// Finds inline links and images, skipping escaped brackets and code spans.
pub fn locate_references(markdown: &str) -> Vec<DraftReference> {
    let mut references = Vec::new();
    scan_range(markdown, 0..markdown.len(), &mut references);
    references.sort_by_key(|reference| reference.span.start);
    references
}

fn scan_range(markdown: &str, range: Range<usize>, references: &mut Vec<DraftReference>) {
    let bytes = markdown.as_bytes();
    let mut index = range.start;
    while index < range.end {
        match bytes[index] {
            b'\\' => index += 2,
            b'`' => index = skip_code_span(bytes, index, range.end),
            b'[' => match parse_reference(markdown, index, range.end) {
                Some(reference) => {
                    let end = reference.span.end;
                    let label_span = reference.label_span.clone();
                    references.push(reference);
                    scan_range(markdown, label_span, references);
                    index = end;
                }
                None => index += 1,
            },
            _ => index += 1,
        }
    }
}

fn skip_code_span(bytes: &[u8], start: usize, end: usize) -> usize {
    let run = count_run(bytes, start, end, b'`');
    let mut cursor = start + run;
    while cursor < end {
        if bytes[cursor] == b'`' {
            let closing = count_run(bytes, cursor, end, b'`');
            if closing == run {
                return cursor + closing;
            }
            cursor += closing;
        } else {
            cursor += 1;
        }
    }
    // Unmatched backticks are literal text.
    start + run
}

fn count_run(bytes: &[u8], start: usize, end: usize, byte: u8) -> usize {
    bytes[start..end].iter().take_while(|b| **b == byte).count()
}

fn parse_reference(markdown: &str, open: usize, end: usize) -> Option<DraftReference> {
    let bytes = markdown.as_bytes();
    let is_image = open > 0 && bytes[open - 1] == b'!' && !is_escaped(bytes, open - 1);
    let close = matching_bracket(bytes, open, end)?;
    if close + 1 >= end || bytes[close + 1] != b'(' {
        return None;
    }

    let mut cursor = skip_spaces(bytes, close + 2, end);
    let mut title = None;
    let (raw_target, after_target) = if bytes.get(cursor) == Some(&b'<') {
        let close_angle = (cursor + 1..end).find(|at| bytes[*at] == b'>' && !is_escaped(bytes, *at))?;
        let inner = &markdown[cursor + 1..close_angle];
        // The converter puts the title inside the angle brackets when the
        // destination has spaces.
        let target = match inner.strip_suffix('"').and_then(|rest| rest.rsplit_once(" \"")) {
            Some((target, quoted)) => {
                title = Some(quoted.to_string());
                target
            }
            None => inner,
        };
        (target.to_string(), close_angle + 1)
    } else {
        let start = cursor;
        let mut depth = 0usize;
        while cursor < end {
            match bytes[cursor] {
                b'\\' => cursor += 1,
                b'(' => depth += 1,
                b')' if depth == 0 => break,
                b')' => depth -= 1,
                byte if byte.is_ascii_whitespace() => break,
                _ => {}
            }
            cursor += 1;
        }
        (markdown[start..cursor.min(end)].to_string(), cursor.min(end))
    };

    cursor = skip_spaces(bytes, after_target, end);
    if let Some(&quote) = bytes.get(cursor)
        && cursor < end
        && matches!(quote, b'"' | b'\'')
    {
        let close_quote =
            (cursor + 1..end).find(|at| bytes[*at] == quote && !is_escaped(bytes, *at))?;
        title = Some(markdown[cursor + 1..close_quote].to_string());
        cursor = skip_spaces(bytes, close_quote + 1, end);
    }
    if cursor >= end || bytes[cursor] != b')' {
        return None;
    }

    let start = if is_image { open - 1 } else { open };
    Some(DraftReference {
        kind: if is_image {
            ReferenceKind::Image
        } else {
            ReferenceKind::Link
        },
        label: markdown[open + 1..close].to_string(),
        label_span: open + 1..close,
        raw_target: unescape(&raw_target),
        title,
        span: start..cursor + 1,
    })
}

fn matching_bracket(bytes: &[u8], open: usize, end: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut cursor = open;
    while cursor < end {
        match bytes[cursor] {
            b'\\' => cursor += 1,
            b'`' => {
                cursor = skip_code_span(bytes, cursor, end);
                continue;
            }
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(cursor);
                }
            }
            _ => {}
        }
        cursor += 1;
    }
    None
}

fn skip_spaces(bytes: &[u8], mut cursor: usize, end: usize) -> usize {
    while cursor < end && matches!(bytes[cursor], b' ' | b'\t' | b'\n') {
        cursor += 1;
    }
    cursor
}

/// Removes backslash escapes in front of ASCII punctuation.
pub fn unescape(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\'
            && let Some(next) = chars.peek().copied()
            && next.is_ascii_punctuation()
        {
            output.push(next);
            chars.next();
            continue;
        }
        output.push(ch);
    }
    output
}

fn is_escaped(bytes: &[u8], at: usize) -> bool {
    let backslashes = bytes[..at].iter().rev().take_while(|b| **b == b'\\').count();
    backslashes % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::{Draft, DraftConverter, HtmdConverter, locate_references};
    use crate::model::ReferenceKind;

    #[test]
    fn locates_links_images_and_titles() {
        let markdown = "See [Guide](12345-Guide.html \"Read me\") and ![chart](attachments/1/2.png).";
        let references = locate_references(markdown);
        assert_eq!(references.len(), 2);

        let link = &references[0];
        assert_eq!(link.kind, ReferenceKind::Link);
        assert_eq!(link.label, "Guide");
        assert_eq!(link.raw_target, "12345-Guide.html");
        assert_eq!(link.title.as_deref(), Some("Read me"));
        assert_eq!(&markdown[link.span.clone()], "[Guide](12345-Guide.html \"Read me\")");

        let image = &references[1];
        assert_eq!(image.kind, ReferenceKind::Image);
        assert_eq!(&markdown[image.span.clone()], "![chart](attachments/1/2.png)");
    }

    #[test]
    fn nested_image_inside_link_label() {
        let markdown = "[![logo](images/logo.png) Home](index.html)";
        let references = locate_references(markdown);
        assert_eq!(references.len(), 2);
        assert_eq!(references[0].kind, ReferenceKind::Link);
        assert_eq!(references[0].raw_target, "index.html");
        assert_eq!(references[1].kind, ReferenceKind::Image);
        assert_eq!(references[1].raw_target, "images/logo.png");
        assert!(references[0].span.start <= references[1].span.start);
        assert!(references[1].span.end <= references[0].label_span.end);
    }

    #[test]
    fn skips_code_spans_escapes_and_plain_brackets() {
        let markdown = "`[not](a.html)` \\[nor](b.html) [just brackets] [ok](<my page.html>)";
        let references = locate_references(markdown);
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].raw_target, "my page.html");
    }

    #[test]
    fn keeps_balanced_parentheses_in_targets() {
        let references = locate_references("[wiki](https://host/Foo_(bar)) tail");
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].raw_target, "https://host/Foo_(bar)");
    }

    #[test]
    fn htmd_converter_produces_located_references() {
        let html = "<html><head><title>x</title></head><body>\
            <p>Go to <a href=\"Target_12345.html\">Target</a>.</p>\
            <script>var a = '[x](y)';</script></body></html>";
        let draft = HtmdConverter::default().convert(html).expect("convert");
        assert!(!draft.content.contains("var a"));
        assert_eq!(draft.references.len(), 1);
        assert_eq!(draft.references[0].raw_target, "Target_12345.html");
        assert_eq!(draft.references[0].label, "Target");
    }

    #[test]
    fn from_markdown_is_empty_without_references() {
        let draft = Draft::from_markdown("plain text");
        assert!(draft.references.is_empty());
    }

    #[test]
    fn converter_escapes_are_removed_from_targets() {
        let draft = HtmdConverter::default()
            .convert(r#"<p><a href="Plan_(draft)_12345.html">plan</a> <a href="my page.html" title="Doc">doc</a></p>"#)
            .expect("convert");
        let targets = draft
            .references
            .iter()
            .map(|reference| reference.raw_target.as_str())
            .collect::<Vec<_>>();
        assert_eq!(targets, vec!["Plan_(draft)_12345.html", "my page.html"]);
        assert_eq!(draft.references[1].title.as_deref(), Some("Doc"));
    }
}
