use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://confluence.example.com";
pub const DEFAULT_USER_AGENT: &str = "spacemark/0.1";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_HTTP_RETRIES: usize = 1;

/// Run configuration. Built once at startup and passed by reference.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct MigrationConfig {
    pub source: SourceSection,
    pub naming: NamingSection,
    pub links: LinkSection,
    pub layout: LayoutSection,
    pub output: OutputSection,
    pub external: ExternalSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourceSection {
    pub base_url: String,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct NamingSection {
    pub rename_all: bool,
    pub use_underscore: bool,
    /// Prefix for the space homepage file name; empty disables it.
    pub homepage_marker: String,
}

impl Default for NamingSection {
    fn default() -> Self {
        Self {
            rename_all: false,
            use_underscore: false,
            homepage_marker: "_".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkStyle {
    #[default]
    Markdown,
    Wiki,
}

impl LinkStyle {
    pub fn parse(value: &str) -> Result<Self> {
        if value.eq_ignore_ascii_case("markdown") || value.eq_ignore_ascii_case("md") {
            return Ok(Self::Markdown);
        }
        if value.eq_ignore_ascii_case("wiki") || value.eq_ignore_ascii_case("wikilink") {
            return Ok(Self::Wiki);
        }
        bail!("unsupported link style: {value} (expected markdown|wiki)")
    }
}

/// When pipes inside wiki links are written as `\|`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WikiPipeEscape {
    Always,
    #[default]
    InTables,
    Never,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LinkSection {
    pub style: LinkStyle,
    pub wiki_pipe_escape: WikiPipeEscape,
    pub debug_link_mapping: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LayoutSection {
    pub attachments_dir: String,
    pub images_dir: String,
    pub styles_dir: String,
    pub blogposts_dir: String,
    pub entities_file: String,
    /// Extra directory names ignored while scanning a space.
    pub skip_dirs: Vec<String>,
}

impl Default for LayoutSection {
    fn default() -> Self {
        Self {
            attachments_dir: "attachments".to_string(),
            images_dir: "images".to_string(),
            styles_dir: "styles".to_string(),
            blogposts_dir: "blogposts".to_string(),
            entities_file: "entities.xml".to_string(),
            skip_dirs: Vec::new(),
        }
    }
}

impl LayoutSection {
    /// Directories the document scan never descends into.
    pub fn is_reserved_dir(&self, name: &str) -> bool {
        name == self.styles_dir
            || name == self.attachments_dir
            || name == self.images_dir
            || self.skip_dirs.iter().any(|dir| dir == name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputSection {
    pub front_matter: bool,
    pub placeholder_pages: bool,
    pub reports: bool,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            front_matter: true,
            placeholder_pages: true,
            reports: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExternalSection {
    pub check: bool,
    pub timeout_ms: u64,
    pub retries: usize,
    pub user_agent: String,
}

impl Default for ExternalSection {
    fn default() -> Self {
        Self {
            check: false,
            timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            retries: DEFAULT_HTTP_RETRIES,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Values supplied on the command line. Unset fields leave the config alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub rename_all: bool,
    pub use_underscore: bool,
    pub link_style: Option<LinkStyle>,
    pub debug_link_mapping: bool,
    pub check_external: bool,
}

impl MigrationConfig {
    /// File, then environment, then flags.
    pub fn build<F>(config_path: &Path, overrides: &ConfigOverrides, lookup_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = load_config(config_path)?;
        config.apply_env(lookup_env)?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup_env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = lookup("SPACEMARK_BASE_URL") {
            self.source.base_url = value;
        }
        if let Some(value) = lookup("SPACEMARK_RENAME_ALL") {
            self.naming.rename_all = parse_bool("SPACEMARK_RENAME_ALL", &value)?;
        }
        if let Some(value) = lookup("SPACEMARK_USE_UNDERSCORE") {
            self.naming.use_underscore = parse_bool("SPACEMARK_USE_UNDERSCORE", &value)?;
        }
        if let Some(value) = lookup("SPACEMARK_LINK_STYLE") {
            self.links.style = LinkStyle::parse(&value)?;
        }
        if let Some(value) = lookup("SPACEMARK_HTTP_TIMEOUT_MS") {
            self.external.timeout_ms = value
                .parse()
                .with_context(|| format!("invalid SPACEMARK_HTTP_TIMEOUT_MS: {value}"))?;
        }
        if let Some(value) = lookup("SPACEMARK_HTTP_RETRIES") {
            self.external.retries = value
                .parse()
                .with_context(|| format!("invalid SPACEMARK_HTTP_RETRIES: {value}"))?;
        }
        if let Some(value) = lookup("SPACEMARK_USER_AGENT") {
            self.external.user_agent = value;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(base_url) = &overrides.base_url {
            self.source.base_url = base_url.trim().to_string();
        }
        if overrides.rename_all {
            self.naming.rename_all = true;
        }
        if overrides.use_underscore {
            self.naming.use_underscore = true;
        }
        if let Some(style) = overrides.link_style {
            self.links.style = style;
        }
        if overrides.debug_link_mapping {
            self.links.debug_link_mapping = true;
        }
        if overrides.check_external {
            self.external.check = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let base_url = self.source.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            bail!("base_url must be an http(s) URL, got `{base_url}`");
        }
        for (key, value) in [
            ("layout.attachments_dir", &self.layout.attachments_dir),
            ("layout.images_dir", &self.layout.images_dir),
            ("layout.styles_dir", &self.layout.styles_dir),
            ("layout.blogposts_dir", &self.layout.blogposts_dir),
            ("layout.entities_file", &self.layout.entities_file),
        ] {
            if value.trim().is_empty() || value.contains(['/', '\\']) {
                bail!("{key} must be a plain directory or file name, got `{value}`");
            }
        }
        Ok(())
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.source.base_url.trim().trim_end_matches('/')
    }
}

/// Load and parse a MigrationConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrationConfig> {
    if !config_path.exists() {
        return Ok(MigrationConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrationConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid boolean for {key}: {value}"),
    }
}
