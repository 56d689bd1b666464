use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use spacemark_core::config::MigrationConfig;
use spacemark_core::draft::HtmdConverter;
use spacemark_core::issues::IssueKind;
use spacemark_core::model::LinkState;
use spacemark_core::pipeline::run_migration;
use spacemark_core::report::MigrationReport;
use spacemark_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, resolve_paths_with_lookup,
};
use tempfile::tempdir;

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, content).expect("write file");
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<html><head><title>Space : {title}</title></head>\
         <body><h1 id=\"title-heading\"><span id=\"title-text\">Space : {title}</span></h1>\
         <div id=\"main-content\">{body}</div></body></html>"
    )
}

fn paths_for(root: &Path, input_xml: Option<PathBuf>) -> ResolvedPaths {
    let context = ResolutionContext {
        cwd: root.to_path_buf(),
    };
    let overrides = PathOverrides {
        input: Some(root.join("input")),
        input_xml,
        output: Some(root.join("output")),
        ..PathOverrides::default()
    };
    resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve paths")
}

fn renamed_config() -> MigrationConfig {
    let mut config = MigrationConfig::default();
    config.naming.rename_all = true;
    config
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|error| panic!("read {}: {error}", path.display()))
}

fn has_issue(report: &MigrationReport, kind: IssueKind) -> bool {
    report.issues.iter().any(|issue| issue.kind == kind)
}

fn seed_html_export(root: &Path) {
    let input = root.join("input");
    write_file(
        &input.join("A/Home_10001.html"),
        &page(
            "Home",
            "<p><a href=\"https://confluence.example.com/pages/viewpage.action?pageId=777\">Cross</a></p>\
             <p><a href=\"Overview_10002.html\">first</a> and <a href=\"Overview_10003.html\">second</a></p>\
             <p><a href=\"Gone_99999.html\">gone</a></p>\
             <p><img src=\"attachments/10001/50001.png\"></p>\
             <p><a href=\"attachments/10001/missing.pdf\">plan</a></p>\
             <p><a href=\"https://example.org/x\">outside</a></p>",
        ),
    );
    write_file(&input.join("A/Overview_10002.html"), &page("Overview", "<p>one</p>"));
    write_file(&input.join("A/Overview_10003.html"), &page("Overview", "<p>two</p>"));
    write_file(
        &input.join("A/12345-Getting-Started.html"),
        &page("Getting Started", "<p>Start here.</p>"),
    );
    write_file(&input.join("A/attachments/10001/50001.png"), "png-bytes");
    write_file(
        &input.join("B/Target.html"),
        "<html><head><meta name=\"ajs-page-id\" content=\"777\"><title>B : Target</title></head>\
         <body><h1>Target</h1><p>Landing.</p></body></html>",
    );
}

#[test]
fn migrates_spaces_and_rewrites_links_across_them() {
    let temp = tempdir().expect("tempdir");
    seed_html_export(temp.path());
    let paths = paths_for(temp.path(), None);
    let config = renamed_config();

    let report = run_migration(&paths, &config, &HtmdConverter::default()).expect("migrate");
    let output = temp.path().join("output");

    assert!(output.join("A/Home.md").is_file());
    assert!(output.join("A/Overview.md").is_file());
    assert!(output.join("A/Overview-10003.md").is_file());
    assert!(output.join("A/Getting-Started.md").is_file());
    assert!(output.join("B/Target.md").is_file());
    assert_eq!(read(&output.join("A/attachments/10001/50001.png")), "png-bytes");

    let home = read(&output.join("A/Home.md"));
    assert!(home.starts_with("---\n"));
    assert!(home.contains("[Cross](../B/Target.md)"), "{home}");
    assert!(home.contains("[first](Overview.md)"), "{home}");
    assert!(home.contains("[second](Overview-10003.md)"), "{home}");
    assert!(home.contains("(attachments/10001/50001.png)"), "{home}");
    assert!(home.contains("gone (broken link: Gone_99999.html)"), "{home}");
    assert!(
        home.contains("plan (broken link: attachments/10001/missing.pdf)"),
        "{home}"
    );
    assert!(home.contains("(https://example.org/x)"), "{home}");
    assert_eq!(home.matches('[').count(), home.matches(']').count());

    assert!(report.links.iter().all(|link| link.state.is_terminal()));
    assert_eq!(report.summary.broken_links, 2);
    assert_eq!(report.summary.spaces, 2);
    assert_eq!(report.summary.collisions, 1);
    assert!(has_issue(&report, IssueKind::FilenameCollision));
    assert!(has_issue(&report, IssueKind::MissingAttachment));
    assert!(has_issue(&report, IssueKind::UnresolvableLink));
    assert!(!has_issue(&report, IssueKind::MissingMetadata));
    assert!(report.has_unresolved());

    let cross = report
        .links
        .iter()
        .find(|link| link.raw_target.contains("pageId=777"))
        .expect("cross-space link row");
    assert_eq!(cross.state, LinkState::ResolvedInternal);
    assert_eq!(cross.final_target, "../B/Target.md");
    assert_eq!(cross.matcher, "page_id_url");

    let external = report
        .links
        .iter()
        .find(|link| link.raw_target == "https://example.org/x")
        .expect("external link row");
    assert_eq!(external.state, LinkState::ResolvedExternal);
}

#[test]
fn reruns_produce_identical_reports_and_documents() {
    let temp = tempdir().expect("tempdir");
    seed_html_export(temp.path());
    let paths = paths_for(temp.path(), None);
    let config = renamed_config();
    let reports = paths.reports_dir();

    run_migration(&paths, &config, &HtmdConverter::default()).expect("first run");
    let first = ["items.csv", "links.csv", "issues.csv", "summary.json"]
        .map(|name| read(&reports.join(name)));
    let first_home = read(&temp.path().join("output/A/Home.md"));

    run_migration(&paths, &config, &HtmdConverter::default()).expect("second run");
    let second = ["items.csv", "links.csv", "issues.csv", "summary.json"]
        .map(|name| read(&reports.join(name)));

    assert_eq!(first, second);
    assert_eq!(first_home, read(&temp.path().join("output/A/Home.md")));
}

#[test]
fn default_naming_keeps_ids_out_of_suffix_slugs_only() {
    let temp = tempdir().expect("tempdir");
    seed_html_export(temp.path());
    let paths = paths_for(temp.path(), None);

    run_migration(&paths, &MigrationConfig::default(), &HtmdConverter::default())
        .expect("migrate");
    let output = temp.path().join("output");

    assert!(output.join("A/12345-Getting-Started.md").is_file());
    assert!(output.join("A/Overview_10002.md").is_file());
    assert!(output.join("A/Overview_10003.md").is_file());
    // Home owns attachments, so its slug drops the id.
    assert!(output.join("A/Home.md").is_file());
}

const ENTITIES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<hibernate-generic datetime="2024-01-01 00:00:00">
  <object class="Space" package="com.atlassian.confluence.spaces">
    <id name="id">10</id>
    <property name="key"><![CDATA[DOC]]></property>
    <property name="name"><![CDATA[Documentation]]></property>
    <property name="homePage" class="Page" package="com.atlassian.confluence.pages"><id name="id">100</id></property>
  </object>
  <object class="Page" package="com.atlassian.confluence.pages">
    <id name="id">100</id>
    <property name="title"><![CDATA[Home]]></property>
    <property name="space" class="Space"><id name="id">10</id></property>
    <property name="contentStatus"><![CDATA[current]]></property>
  </object>
  <object class="Page" package="com.atlassian.confluence.pages">
    <id name="id">101</id>
    <property name="title"><![CDATA[Questions]]></property>
    <property name="parent" class="Page"><id name="id">100</id></property>
    <property name="space" class="Space"><id name="id">10</id></property>
    <property name="contentStatus"><![CDATA[current]]></property>
  </object>
  <object class="Page" package="com.atlassian.confluence.pages">
    <id name="id">99</id>
    <property name="title"><![CDATA[Questions]]></property>
    <property name="originalVersion" class="Page"><id name="id">101</id></property>
    <property name="contentStatus"><![CDATA[current]]></property>
  </object>
  <object class="BlogPost" package="com.atlassian.confluence.pages">
    <id name="id">200</id>
    <property name="title"><![CDATA[Launch]]></property>
    <property name="space" class="Space"><id name="id">10</id></property>
    <property name="contentStatus"><![CDATA[current]]></property>
  </object>
  <object class="BodyContent" package="com.atlassian.confluence.core">
    <id name="id">900</id>
    <property name="body"><![CDATA[<p>We launched.</p>]]></property>
    <property name="content" class="BlogPost"><id name="id">200</id></property>
  </object>
  <object class="Attachment" package="com.atlassian.confluence.pages">
    <id name="id">300</id>
    <property name="title"><![CDATA[diagram.png]]></property>
    <property name="contentType"><![CDATA[image/png]]></property>
    <property name="containerContent" class="Page"><id name="id">101</id></property>
    <property name="contentStatus"><![CDATA[current]]></property>
  </object>
</hibernate-generic>
"#;

#[test]
fn metadata_supplies_titles_placeholders_and_blog_bodies() {
    let temp = tempdir().expect("tempdir");
    let root = temp.path();
    write_file(
        &root.join("input/DOC/Home_100.html"),
        "<html><head><meta name=\"ajs-page-id\" content=\"100\"><title>DOC : Old Home</title></head>\
         <body><h1>Old Home</h1>\
         <p><a href=\"https://confluence.example.com/pages/viewpage.action?pageId=99\">questions</a></p>\
         <p><img src=\"attachments/101/300.png\"></p></body></html>",
    );
    write_file(&root.join("input/DOC/attachments/101/300.png"), "diagram-bytes");
    write_file(&root.join("xml/DOC/entities.xml"), ENTITIES);

    let paths = paths_for(root, Some(root.join("xml")));
    let report =
        run_migration(&paths, &renamed_config(), &HtmdConverter::default()).expect("migrate");
    let output = root.join("output");

    let home = read(&output.join("DOC/_Home.md"));
    assert!(home.contains("title: Home"), "{home}");
    assert!(home.contains("(attachments/101/diagram.png)"), "{home}");
    assert_eq!(
        read(&output.join("DOC/attachments/101/diagram.png")),
        "diagram-bytes"
    );

    let questions = read(&output.join("DOC/Questions.md"));
    assert!(questions.contains("not part of the export"), "{questions}");
    assert!(questions.contains("up: _Home.md"), "{questions}");

    let launch = read(&output.join("DOC/blogposts/Launch.md"));
    assert!(launch.contains("kind: blog_post"), "{launch}");
    assert!(launch.contains("We launched."), "{launch}");

    let alias = report
        .links
        .iter()
        .find(|link| link.raw_target.contains("pageId=99"))
        .expect("alias link row");
    assert_eq!(alias.state, LinkState::ResolvedInternal);
    assert_eq!(alias.final_target, "Questions.md");

    assert_eq!(report.summary.placeholders, 1);
    assert_eq!(report.summary.blog_posts, 1);
    assert!(!has_issue(&report, IssueKind::MissingMetadata));
    assert!(!report.has_unresolved());
}

#[test]
fn missing_metadata_degrades_to_export_names() {
    let temp = tempdir().expect("tempdir");
    let root = temp.path();
    write_file(&root.join("input/DOC/Home_100.html"), &page("Home", "<p>hi</p>"));
    fs::create_dir_all(root.join("xml")).expect("xml root");
    write_file(&root.join("input/OPS/Runbook_200.html"), &page("Runbook", "<p>ops</p>"));

    let paths = paths_for(root, Some(root.join("xml")));
    let report = run_migration(&paths, &MigrationConfig::default(), &HtmdConverter::default())
        .expect("migrate");

    assert!(has_issue(&report, IssueKind::MissingMetadata));
    assert!(root.join("output/DOC/Home_100.md").is_file());
    assert!(root.join("output/OPS/Runbook_200.md").is_file());
    assert!(!report.has_unresolved());
}

#[test]
fn corrupt_metadata_is_reported_and_space_still_migrates() {
    let temp = tempdir().expect("tempdir");
    let root = temp.path();
    write_file(&root.join("input/DOC/Home_100.html"), &page("Home", "<p>hi</p>"));
    write_file(
        &root.join("xml/DOC/entities.xml"),
        "<hibernate-generic><object class=\"Page\"><id name=\"id\">1</id></broken>",
    );

    let paths = paths_for(root, Some(root.join("xml")));
    let report = run_migration(&paths, &MigrationConfig::default(), &HtmdConverter::default())
        .expect("migrate");

    assert!(has_issue(&report, IssueKind::CorruptXml));
    assert!(root.join("output/DOC/Home_100.md").is_file());
}

fn seed_metadata_export(root: &Path, blog_body: &str) {
    write_file(
        &root.join("input/DOC/Home_100.html"),
        "<html><head><meta name=\"ajs-page-id\" content=\"100\"><title>DOC : Old Home</title></head>\
         <body><h1>Old Home</h1>\
         <p><a href=\"https://confluence.example.com/pages/viewpage.action?pageId=99\">questions</a></p>\
         <p><img src=\"attachments/101/300.png\"></p></body></html>",
    );
    write_file(&root.join("input/DOC/attachments/101/300.png"), "diagram-bytes");
    write_file(
        &root.join("xml/DOC/entities.xml"),
        &ENTITIES.replace("<p>We launched.</p>", blog_body),
    );
}

#[test]
fn storage_format_blog_links_are_rewritten_or_reported() {
    let temp = tempdir().expect("tempdir");
    let root = temp.path();
    seed_metadata_export(
        root,
        "<p>See <ac:link><ri:page ri:content-title=\"Home\"/>\
         <ac:plain-text-link-body>home page</ac:plain-text-link-body></ac:link> and \
         <ac:link><ri:page ri:content-title=\"Nowhere\"/></ac:link>.</p>\
         <ac:image><ri:attachment ri:filename=\"chart.png\"/></ac:image>",
    );

    let paths = paths_for(root, Some(root.join("xml")));
    let report =
        run_migration(&paths, &renamed_config(), &HtmdConverter::default()).expect("migrate");

    let launch = read(&root.join("output/DOC/blogposts/Launch.md"));
    assert!(launch.contains("[home page](../_Home.md)"), "{launch}");
    assert!(launch.contains("Nowhere (broken link: /display/DOC/Nowhere)"), "{launch}");
    assert!(
        launch.contains("chart.png (broken image: attachments/200/chart.png)"),
        "{launch}"
    );

    let rows = report
        .links
        .iter()
        .filter(|link| link.source_id == "200")
        .collect::<Vec<_>>();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|link| link.state.is_terminal()));
    assert_eq!(
        rows.iter()
            .filter(|link| link.state == LinkState::ResolvedInternal)
            .count(),
        1
    );
    assert!(has_issue(&report, IssueKind::MissingAttachment));
    assert_eq!(report.summary.missing_attachments, 1);
}

#[test]
fn links_to_unwritten_placeholders_are_broken() {
    let temp = tempdir().expect("tempdir");
    let root = temp.path();
    seed_metadata_export(root, "<p>We launched.</p>");
    let mut config = renamed_config();
    config.output.placeholder_pages = false;

    let paths = paths_for(root, Some(root.join("xml")));
    let report = run_migration(&paths, &config, &HtmdConverter::default()).expect("migrate");

    assert!(!root.join("output/DOC/Questions.md").exists());
    let alias = report
        .links
        .iter()
        .find(|link| link.raw_target.contains("pageId=99"))
        .expect("alias link row");
    assert_eq!(alias.state, LinkState::Broken);
    assert!(alias.final_target.is_empty());
    let home = read(&root.join("output/DOC/_Home.md"));
    assert!(home.contains("questions (broken link: 101)"), "{home}");
    assert!(report.has_unresolved());
}

#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log buffer").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn run_log_records_every_item_mapping() {
    let temp = tempdir().expect("tempdir");
    let root = temp.path();
    seed_metadata_export(root, "<p>We launched.</p>");
    let mut config = renamed_config();
    config.output.placeholder_pages = false;
    let paths = paths_for(root, Some(root.join("xml")));

    let log = CapturedLog::default();
    let writer = log.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::INFO)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        run_migration(&paths, &config, &HtmdConverter::default())
    })
    .expect("migrate");

    let text = String::from_utf8(log.0.lock().expect("log buffer").clone()).expect("utf8 log");
    let mappings = text
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter(|record| record["fields"]["message"] == "identity mapping")
        .map(|record| {
            (
                record["fields"]["item"].as_str().unwrap_or_default().to_string(),
                record["fields"]["output"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect::<Vec<_>>();

    assert!(mappings.contains(&("101".to_string(), "DOC/Questions.md".to_string())));
    assert!(mappings.contains(&("100".to_string(), "DOC/_Home.md".to_string())));
    assert!(mappings.iter().any(|(item, _)| item == "300"));
    assert!(mappings.iter().any(|(item, _)| item == "200"));
}
