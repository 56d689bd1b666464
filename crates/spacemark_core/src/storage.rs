//! Storage-format markup found in blog bodies of the XML export.
//!
//! Links and images there are `ac:`/`ri:` elements that an HTML converter
//! drops together with their text. [`expand_storage_markup`] turns them into
//! plain `<a href>` and `<img src>` elements whose targets the reference
//! matchers already understand: `/display/<space>/<title>` for pages and blog
//! posts, `<attachments>/<owner>/<file>` for attachments.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use regex::{Captures, Regex};

use crate::scanner::decode_entities;

const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'+')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'`');

static LINK: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?is)<ac:link(\s[^>]*?)?(?:/>|>(.*?)</ac:link>)"));
static IMAGE: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?is)<ac:image(\s[^>]*?)?(?:/>|>(.*?)</ac:image>)"));
static RESOURCE: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"(?is)<ri:(page|blog-post|attachment|url|space|user)\b([^>]*?)/?>")
});
static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| compile(r#"([\w:.-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#));
static PLAIN_BODY: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"(?is)<ac:plain-text-link-body>(.*?)</ac:plain-text-link-body>")
});
static RICH_BODY: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?is)<ac:link-body>(.*?)</ac:link-body>"));
static CDATA: LazyLock<Regex> = LazyLock::new(|| compile(r"(?s)<!\[CDATA\[(.*?)\]\]>"));

fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(error) => panic!("invalid built-in pattern {pattern}: {error}"),
    }
}

/// Rewrites `ac:link` and `ac:image` elements of one body into HTML.
///
/// `owner_id` is the item the body belongs to; attachments named without a
/// container are looked up under it.
pub fn expand_storage_markup(
    body: &str,
    space: &str,
    owner_id: &str,
    attachments_dir: &str,
) -> String {
    if !body.contains("<ac:") {
        return body.to_string();
    }
    let context = Context {
        space,
        owner_id,
        attachments_dir: attachments_dir.trim_matches('/'),
    };
    let linked = LINK.replace_all(body, |caps: &Captures<'_>| context.render_link(caps));
    IMAGE
        .replace_all(&linked, |caps: &Captures<'_>| context.render_image(caps))
        .into_owned()
}

struct Context<'a> {
    space: &'a str,
    owner_id: &'a str,
    attachments_dir: &'a str,
}

/// The first `ri:` element inside a link or image.
struct Resource {
    kind: String,
    attributes: BTreeMap<String, String>,
}

impl Resource {
    fn find(inner: &str) -> Option<Self> {
        let caps = RESOURCE.captures(inner)?;
        Some(Self {
            kind: caps[1].to_ascii_lowercase(),
            attributes: attributes(&caps[2]),
        })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Text shown when the link has no body of its own.
    fn fallback_label(&self) -> Option<&str> {
        self.get("ri:content-title")
            .or_else(|| self.get("ri:filename"))
            .or_else(|| self.get("ri:value"))
            .or_else(|| self.get("ri:space-key"))
    }
}

impl Context<'_> {
    fn href(&self, resource: &Resource) -> Option<String> {
        match resource.kind.as_str() {
            "page" | "blog-post" => {
                let title = resource.get("ri:content-title")?;
                let space = resource.get("ri:space-key").unwrap_or(self.space);
                Some(format!("/display/{space}/{}", encode(title)))
            }
            "attachment" => {
                let file = resource.get("ri:filename")?;
                Some(format!(
                    "{}/{}/{}",
                    self.attachments_dir,
                    self.owner_id,
                    encode(file)
                ))
            }
            "url" => resource.get("ri:value").map(ToString::to_string),
            "space" => resource
                .get("ri:space-key")
                .map(|space| format!("/display/{space}")),
            _ => None,
        }
    }

    fn render_link(&self, caps: &Captures<'_>) -> String {
        let attributes = attributes(caps.get(1).map_or("", |group| group.as_str()));
        let inner = caps.get(2).map_or("", |group| group.as_str());
        let resource = Resource::find(inner);
        let anchor = attributes
            .get("ac:anchor")
            .filter(|anchor| !anchor.is_empty());

        let href = match (resource.as_ref().and_then(|resource| self.href(resource)), anchor) {
            (Some(href), Some(anchor)) => Some(format!("{href}#{}", encode(anchor))),
            (Some(href), None) => Some(href),
            (None, Some(anchor)) if resource.is_none() => Some(format!("#{}", encode(anchor))),
            (None, _) => None,
        };

        let label = if let Some(body) = RICH_BODY.captures(inner) {
            body[1].to_string()
        } else if let Some(body) = PLAIN_BODY.captures(inner) {
            escape_text(&unwrap_cdata(&body[1]))
        } else {
            resource
                .as_ref()
                .and_then(Resource::fallback_label)
                .or(anchor.map(String::as_str))
                .map(escape_text)
                .unwrap_or_default()
        };

        match href {
            Some(href) => format!("<a href=\"{}\">{label}</a>", escape_attribute(&href)),
            None => label,
        }
    }

    fn render_image(&self, caps: &Captures<'_>) -> String {
        let attributes = attributes(caps.get(1).map_or("", |group| group.as_str()));
        let inner = caps.get(2).map_or("", |group| group.as_str());
        let resource = Resource::find(inner);
        let alt = attributes
            .get("ac:alt")
            .map(String::as_str)
            .filter(|alt| !alt.is_empty())
            .or_else(|| resource.as_ref().and_then(|resource| resource.get("ri:filename")))
            .unwrap_or_default();

        match resource.as_ref().and_then(|resource| self.href(resource)) {
            Some(src) => format!(
                "<img src=\"{}\" alt=\"{}\">",
                escape_attribute(&src),
                escape_attribute(alt)
            ),
            None => escape_text(alt),
        }
    }
}

fn attributes(text: &str) -> BTreeMap<String, String> {
    ATTRIBUTE
        .captures_iter(text)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map_or("", |group| group.as_str());
            (caps[1].to_ascii_lowercase(), decode_entities(value))
        })
        .collect()
}

fn unwrap_cdata(text: &str) -> String {
    if CDATA.is_match(text) {
        CDATA.replace_all(text, "$1").into_owned()
    } else {
        decode_entities(text)
    }
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, SEGMENT).to_string()
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attribute(text: &str) -> String {
    escape_text(text).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::expand_storage_markup;
    use crate::matchers::{MatcherSet, TargetKey};

    #[test]
    fn page_links_become_display_urls() {
        let body = r#"<p>See <ac:link><ri:page ri:content-title="Q&amp;A (2024)"/><ac:plain-text-link-body><![CDATA[the <FAQ>]]></ac:plain-text-link-body></ac:link> now.</p>"#;
        assert_eq!(
            expand_storage_markup(body, "DOC", "9001", "attachments"),
            r#"<p>See <a href="/display/DOC/Q%26A%20%282024%29">the &lt;FAQ&gt;</a> now.</p>"#
        );

        let keys = MatcherSet::standard("https://wiki.example.com", "attachments")
            .classify("/display/DOC/Q%26A%20%282024%29", "DOC")
            .1;
        assert_eq!(
            keys[0].key,
            TargetKey::Title {
                space: "DOC".to_string(),
                title: "Q&A (2024)".to_string()
            }
        );
    }

    #[test]
    fn other_spaces_anchors_and_urls() {
        let body = concat!(
            r#"<ac:link ac:anchor="Setup"><ri:page ri:space-key="ENG" ri:content-title="Build+Run"/></ac:link> "#,
            r#"<ac:link><ri:url ri:value="https://example.org/a?b=1&amp;c=2"/><ac:link-body><strong>web</strong></ac:link-body></ac:link> "#,
            r#"<ac:link ac:anchor="top"><ac:plain-text-link-body>up</ac:plain-text-link-body></ac:link> "#,
            r#"<ac:link><ri:user ri:userkey="abc"/><ac:plain-text-link-body>Ann</ac:plain-text-link-body></ac:link>"#,
        );
        assert_eq!(
            expand_storage_markup(body, "DOC", "9001", "attachments"),
            concat!(
                r#"<a href="/display/ENG/Build%2BRun#Setup">Build+Run</a> "#,
                r#"<a href="https://example.org/a?b=1&amp;c=2"><strong>web</strong></a> "#,
                r##"<a href="#top">up</a> "##,
                "Ann",
            )
        );
    }

    #[test]
    fn attachments_and_images_use_the_owner_directory() {
        let body = concat!(
            r#"<ac:image ac:alt="Sales"><ri:attachment ri:filename="chart 1.png"/></ac:image>"#,
            r#"<ac:link><ri:attachment ri:filename="plan.pdf"/></ac:link>"#,
            r#"<ac:image><ri:url ri:value="https://cdn.example.org/x.png"/></ac:image>"#,
        );
        assert_eq!(
            expand_storage_markup(body, "DOC", "9001", "files/"),
            concat!(
                r#"<img src="files/9001/chart%201.png" alt="Sales">"#,
                r#"<a href="files/9001/plan.pdf">plan.pdf</a>"#,
                r#"<img src="https://cdn.example.org/x.png" alt="">"#,
            )
        );
    }

    #[test]
    fn plain_html_is_left_alone() {
        let body = "<p><a href=\"Home_100.html\">home</a></p>";
        assert_eq!(expand_storage_markup(body, "DOC", "1", "attachments"), body);
    }
}
