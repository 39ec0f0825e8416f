use crate::render::DEFAULT_RENDER_TIMEOUT;
use crate::scheduler::DEFAULT_TASK_TIMEOUT;
use crate::types::{KindFilter, RunConfig};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_OUTPUT_DIR: &str = "rendered_images";
pub const DEFAULT_RENDERER: &str = "latex-fragment-render";
pub const DEFAULT_DPI: u32 = 300;
pub const DEFAULT_BLANK_PIXEL_THRESHOLD: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Optional YAML config; every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlConfig {
    pub output_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub dpi: Option<u32>,
    pub workers: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub render_timeout_secs: Option<u64>,
    pub kinds: Option<KindFilter>,
    /// Either a whitespace-separated command line or a list of arguments.
    pub renderer: Option<RendererSpec>,
    pub blank_pixel_threshold: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RendererSpec {
    Line(String),
    Argv(Vec<String>),
}

impl RendererSpec {
    fn into_argv(self) -> Vec<String> {
        match self {
            RendererSpec::Line(s) => split_command(&s),
            RendererSpec::Argv(v) => v,
        }
    }
}

pub fn load_yaml(path: &Path) -> Result<YamlConfig, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_reader(file).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Values given on the command line. `None` defers to the YAML file, then to
/// the built-in default.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub output_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub dpi: Option<u32>,
    pub workers: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub render_timeout_secs: Option<u64>,
    pub kinds: Option<KindFilter>,
    pub renderer: Option<String>,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub run: RunConfig,
    /// `None` lets the caller pick a hardware-based default.
    pub workers: Option<usize>,
    pub task_timeout: Duration,
    /// Shared with workers through `--log-file`, not through their tasks.
    pub log_file: Option<PathBuf>,
}

pub fn split_command(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

/// Merge CLI > YAML > defaults into one immutable run configuration.
pub fn resolve(yaml: YamlConfig, cli: CliOverrides) -> Result<ResolvedConfig, ConfigError> {
    let output_dir = cli
        .output_dir
        .or(yaml.output_dir)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));

    // `<output>_cache` next to the output directory
    let cache_dir = cli.cache_dir.or(yaml.cache_dir).unwrap_or_else(|| {
        let mut s = output_dir.as_os_str().to_owned();
        s.push("_cache");
        PathBuf::from(s)
    });

    let dpi = cli.dpi.or(yaml.dpi).unwrap_or(DEFAULT_DPI);
    if dpi == 0 {
        return Err(ConfigError::Invalid {
            key: "dpi",
            reason: "must be greater than 0".into(),
        });
    }

    let renderer = match cli.renderer {
        Some(line) => split_command(&line),
        None => yaml
            .renderer
            .map(RendererSpec::into_argv)
            .unwrap_or_else(|| vec![DEFAULT_RENDERER.to_string()]),
    };
    if renderer.is_empty() || renderer[0].trim().is_empty() {
        return Err(ConfigError::Invalid {
            key: "renderer",
            reason: "command is empty".into(),
        });
    }

    let render_timeout_secs = cli
        .render_timeout_secs
        .or(yaml.render_timeout_secs)
        .unwrap_or(DEFAULT_RENDER_TIMEOUT.as_secs());
    if render_timeout_secs == 0 {
        return Err(ConfigError::Invalid {
            key: "render_timeout_secs",
            reason: "must be greater than 0".into(),
        });
    }

    let task_timeout_secs = cli
        .task_timeout_secs
        .or(yaml.task_timeout_secs)
        .unwrap_or(DEFAULT_TASK_TIMEOUT.as_secs());
    if task_timeout_secs == 0 {
        return Err(ConfigError::Invalid {
            key: "task_timeout_secs",
            reason: "must be greater than 0".into(),
        });
    }

    Ok(ResolvedConfig {
        run: RunConfig {
            output_dir,
            cache_dir,
            dpi,
            kinds: cli.kinds.or(yaml.kinds).unwrap_or_default(),
            renderer,
            render_timeout_secs,
            blank_pixel_threshold: yaml
                .blank_pixel_threshold
                .unwrap_or(DEFAULT_BLANK_PIXEL_THRESHOLD),
        },
        workers: cli.workers.or(yaml.workers),
        task_timeout: Duration::from_secs(task_timeout_secs),
        log_file: cli.log_file,
    })
}

/// Load `path` if given, then resolve.
pub fn load(path: Option<&Path>, cli: CliOverrides) -> Result<ResolvedConfig, ConfigError> {
    let yaml = match path {
        Some(p) => load_yaml(p)?,
        None => YamlConfig::default(),
    };
    resolve(yaml, cli)
}
