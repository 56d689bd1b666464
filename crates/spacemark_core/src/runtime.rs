use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const DEFAULT_INPUT_DIR: &str = "input";
pub const DEFAULT_INPUT_XML_DIR: &str = "input-xml";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_CONFIG_FILENAME: &str = "spacemark.toml";
pub const REPORTS_DIRNAME: &str = "_reports";
pub const LOGS_DIRNAME: &str = "logs";
pub const LOG_FILENAME: &str = "spacemark.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub input: Option<PathBuf>,
    pub input_xml: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub input_root: PathBuf,
    pub input_xml_root: Option<PathBuf>,
    pub output_root: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub input_source: ValueSource,
    pub input_xml_source: ValueSource,
    pub output_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn reports_dir(&self) -> PathBuf {
        self.output_root.join(REPORTS_DIRNAME)
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "input_root={} ({})\ninput_xml_root={} ({})\noutput_root={} ({})\nconfig_path={} ({})\nlog_path={}",
            normalize_for_display(&self.input_root),
            self.input_source.as_str(),
            self.input_xml_root
                .as_deref()
                .map(normalize_for_display)
                .unwrap_or_else(|| "<none>".to_string()),
            self.input_xml_source.as_str(),
            normalize_for_display(&self.output_root),
            self.output_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.log_path),
        )
    }
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

pub fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (input_root, input_source) = pick_path(
        context,
        overrides.input.as_deref(),
        lookup_env("SPACEMARK_INPUT"),
        DEFAULT_INPUT_DIR,
    );
    let (output_root, output_source) = pick_path(
        context,
        overrides.output.as_deref(),
        lookup_env("SPACEMARK_OUTPUT"),
        DEFAULT_OUTPUT_DIR,
    );
    let (config_path, config_source) = pick_path(
        context,
        overrides.config.as_deref(),
        lookup_env("SPACEMARK_CONFIG"),
        DEFAULT_CONFIG_FILENAME,
    );

    let (input_xml_root, input_xml_source) = if let Some(path) = overrides.input_xml.as_deref() {
        (Some(absolutize(path, &context.cwd)), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("SPACEMARK_INPUT_XML")) {
        (
            Some(absolutize(Path::new(&value), &context.cwd)),
            ValueSource::Env,
        )
    } else {
        let candidate = context.cwd.join(DEFAULT_INPUT_XML_DIR);
        if candidate.is_dir() {
            (Some(candidate), ValueSource::Heuristic)
        } else {
            (None, ValueSource::Default)
        }
    };

    let log_path = if let Some(path) = overrides.log_file.as_deref() {
        absolutize(path, &context.cwd)
    } else if let Some(value) = non_empty(lookup_env("SPACEMARK_LOG_FILE")) {
        absolutize(Path::new(&value), &context.cwd)
    } else {
        output_root.join(LOGS_DIRNAME).join(LOG_FILENAME)
    };

    if input_root == output_root {
        bail!(
            "input and output roots must differ: {}",
            normalize_for_display(&input_root)
        );
    }

    Ok(ResolvedPaths {
        input_root,
        input_xml_root,
        output_root,
        config_path,
        log_path,
        input_source,
        input_xml_source,
        output_source,
        config_source,
    })
}

/// Checks the input tree exists and the output root can be created.
pub fn ensure_ready(paths: &ResolvedPaths) -> Result<()> {
    if !paths.input_root.is_dir() {
        bail!(
            "Input root does not exist: {}\nPass --input <dir> or set SPACEMARK_INPUT",
            normalize_for_display(&paths.input_root)
        );
    }
    if let Some(xml_root) = &paths.input_xml_root
        && !xml_root.is_dir()
    {
        bail!(
            "XML export root does not exist: {}",
            normalize_for_display(xml_root)
        );
    }
    fs::create_dir_all(&paths.output_root)
        .with_context(|| format!("failed to create {}", paths.output_root.display()))?;
    Ok(())
}

fn pick_path(
    context: &ResolutionContext,
    flag: Option<&Path>,
    env_value: Option<String>,
    default: &str,
) -> (PathBuf, ValueSource) {
    if let Some(path) = flag {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = non_empty(env_value) {
        return (
            absolutize(Path::new(&value), &context.cwd),
            ValueSource::Env,
        );
    }
    (context.cwd.join(default), ValueSource::Default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        LOG_FILENAME, PathOverrides, ResolutionContext, ValueSource, ensure_ready,
        resolve_paths_with_lookup,
    };

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let overrides = PathOverrides {
            input: Some(temp.path().join("from-flag")),
            ..PathOverrides::default()
        };
        let env = HashMap::from([
            ("SPACEMARK_INPUT".to_string(), "from-env".to_string()),
            ("SPACEMARK_OUTPUT".to_string(), "out-env".to_string()),
        ]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.input_root, temp.path().join("from-flag"));
        assert_eq!(resolved.input_source, ValueSource::Flag);
        assert_eq!(resolved.output_root, temp.path().join("out-env"));
        assert_eq!(resolved.output_source, ValueSource::Env);
        assert_eq!(resolved.config_source, ValueSource::Default);
        assert!(resolved.log_path.ends_with(LOG_FILENAME));
    }

    #[test]
    fn xml_root_is_detected_when_present() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert!(resolved.input_xml_root.is_none());
        assert_eq!(resolved.input_xml_source, ValueSource::Default);

        fs::create_dir_all(temp.path().join("input-xml")).expect("xml dir");
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert_eq!(
            resolved.input_xml_root,
            Some(temp.path().join("input-xml"))
        );
        assert_eq!(resolved.input_xml_source, ValueSource::Heuristic);
    }

    #[test]
    fn identical_input_and_output_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let overrides = PathOverrides {
            input: Some(temp.path().join("same")),
            output: Some(temp.path().join("same")),
            ..PathOverrides::default()
        };
        let err = resolve_paths_with_lookup(&context, &overrides, |_| None).expect_err("must fail");
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn ensure_ready_requires_input_root() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let paths = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        let err = ensure_ready(&paths).expect_err("must fail");
        assert!(err.to_string().contains("Input root does not exist"));

        fs::create_dir_all(&paths.input_root).expect("input root");
        ensure_ready(&paths).expect("ready");
        assert!(paths.output_root.is_dir());
    }
}
