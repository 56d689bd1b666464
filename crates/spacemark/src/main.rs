use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use spacemark_core::config::{ConfigOverrides, LinkStyle, MigrationConfig};
use spacemark_core::draft::HtmdConverter;
use spacemark_core::pipeline::run_migration;
use spacemark_core::report::MigrationReport;
use spacemark_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, ensure_ready, resolve_paths,
};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

const EXIT_UNRESOLVED: u8 = 2;
const EXIT_SETUP_FAILURE: u8 = 1;

#[derive(Debug, Parser)]
#[command(
    name = "spacemark",
    version,
    about = "Migrate wiki space HTML exports to a Markdown tree with rewritten links"
)]
struct Cli {
    #[arg(long, value_name = "DIR", help = "HTML export root (one directory per space)")]
    input: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "XML export root with entities.xml per space")]
    input_xml: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
    #[arg(long, value_name = "URL", help = "Source site base URL used to recognize internal links")]
    base_url: Option<String>,
    #[arg(long, help = "Strip numeric ids from every page name")]
    rename_all: bool,
    #[arg(long, help = "Replace spaces with underscores in names")]
    use_underscore: bool,
    #[arg(long, help = "Log every link resolution and the full identity table")]
    debug_link_mapping: bool,
    #[arg(long, help = "Write [[wiki]] links instead of Markdown links")]
    wiki_links: bool,
    #[arg(long, help = "Probe external http(s) links after rewriting")]
    check_external: bool,
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
    #[arg(long, help = "Print the run summary as JSON")]
    json: bool,
    #[arg(long, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(report) if report.has_unresolved() => ExitCode::from(EXIT_UNRESOLVED),
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(EXIT_SETUP_FAILURE)
        }
    }
}

fn run(cli: &Cli) -> Result<MigrationReport> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        input: cli.input.clone(),
        input_xml: cli.input_xml.clone(),
        output: cli.output.clone(),
        config: cli.config.clone(),
        log_file: cli.log_file.clone(),
    };
    let paths = resolve_paths(&context, &overrides)?;

    let config_overrides = ConfigOverrides {
        base_url: cli.base_url.clone(),
        rename_all: cli.rename_all,
        use_underscore: cli.use_underscore,
        link_style: cli.wiki_links.then_some(LinkStyle::Wiki),
        debug_link_mapping: cli.debug_link_mapping,
        check_external: cli.check_external,
    };
    let config = MigrationConfig::build(&paths.config_path, &config_overrides, |key| {
        env::var(key).ok()
    })?;

    ensure_ready(&paths)?;
    init_logging(&paths.log_path, config.links.debug_link_mapping)?;
    if cli.diagnostics {
        println!("[diagnostics]\n{}", paths.diagnostics());
    }

    let report = run_migration(&paths, &config, &HtmdConverter::default())?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report.summary)?);
    } else {
        print_summary(&paths, &config, &report);
    }
    Ok(report)
}

fn init_logging(log_path: &Path, debug_link_mapping: bool) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let log_file = File::create(log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    let default_filter = if debug_link_mapping {
        "warn,spacemark=debug,spacemark_core=debug"
    } else {
        "warn"
    };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);
    let file_layer = fmt::layer()
        .json()
        .with_writer(Mutex::new(log_file))
        .with_filter(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install log subscriber")
}

fn print_summary(paths: &ResolvedPaths, config: &MigrationConfig, report: &MigrationReport) {
    let summary = &report.summary;
    println!("input: {}", normalize_path(&paths.input_root));
    println!(
        "input_xml: {}",
        paths
            .input_xml_root
            .as_deref()
            .map(normalize_path)
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("output: {}", normalize_path(&paths.output_root));
    println!("rename_all: {}", format_flag(config.naming.rename_all));
    println!("use_underscore: {}", format_flag(config.naming.use_underscore));
    println!("spaces: {}", summary.spaces);
    println!("items: {}", summary.items);
    println!("items.pages: {}", summary.pages);
    println!("items.blog_posts: {}", summary.blog_posts);
    println!("items.attachments: {}", summary.attachments);
    println!("items.placeholders: {}", summary.placeholders);
    println!("items.missing_files: {}", summary.missing_files);
    println!("items.collisions: {}", summary.collisions);
    println!("documents_written: {}", summary.activity.documents_written);
    println!("attachments_written: {}", summary.activity.attachments_written);
    println!("links: {}", summary.links);
    for (state, count) in &summary.links_by_state {
        println!("links.{state}: {count}");
    }
    if summary.issues_by_kind.is_empty() {
        println!("issues: <none>");
    } else {
        for (kind, count) in &summary.issues_by_kind {
            println!("issues.{kind}: {count}");
        }
    }
    if config.output.reports {
        println!("reports: {}", normalize_path(&paths.reports_dir()));
    } else {
        println!("reports: disabled");
    }
    println!("log: {}", normalize_path(&paths.log_path));
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
