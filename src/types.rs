use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    Formula,
    Text,
    Table,
}

impl FragmentKind {
    /// Document order in which kinds are visited inside one document.
    pub const ALL: [FragmentKind; 3] = [FragmentKind::Formula, FragmentKind::Text, FragmentKind::Table];

    /// Label passed to the renderer and used in output file names.
    pub fn as_str(self) -> &'static str {
        match self {
            FragmentKind::Formula => "formula",
            FragmentKind::Text => "text",
            FragmentKind::Table => "table",
        }
    }

    /// `item_type` written into error records.
    pub fn item_type(self) -> &'static str {
        match self {
            FragmentKind::Formula => "display_formula",
            FragmentKind::Text => "inline_text",
            FragmentKind::Table => "table",
        }
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which fragment kinds a run renders.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum KindFilter {
    Formula,
    Text,
    Table,
    #[default]
    All,
    /// formula + text, kept for old file lists and scripts
    #[value(hide = true)]
    Both,
}

impl KindFilter {
    pub fn includes(self, kind: FragmentKind) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::Both => kind != FragmentKind::Table,
            KindFilter::Formula => kind == FragmentKind::Formula,
            KindFilter::Text => kind == FragmentKind::Text,
            KindFilter::Table => kind == FragmentKind::Table,
        }
    }
}

/// Run parameters shared by every task of a batch.
///
/// Built once at startup and handed to each worker process as part of its
/// [`Task`]; nothing in a worker reads process-global settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub dpi: u32,
    pub kinds: KindFilter,

    /// Renderer program followed by any leading arguments.
    pub renderer: Vec<String>,

    pub render_timeout_secs: u64,

    /// Fewer non-white pixels than this marks a rendered image as blank.
    pub blank_pixel_threshold: u64,
}

impl RunConfig {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }
}

/// One input document plus the run parameters; consumed by exactly one worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub input: PathBuf,
    pub config: RunConfig,
}

/// Invoker-level failure classification of a single fragment.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    RenderingError,
    BlankImageError,
    ProcessCrash,
    ProtocolError,
    Timeout,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RenderingError => "RenderingError",
            FailureKind::BlankImageError => "BlankImageError",
            FailureKind::ProcessCrash => "ProcessCrash",
            FailureKind::ProtocolError => "ProtocolError",
            FailureKind::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of handling one fragment inside a file task.
#[derive(Clone, Debug, PartialEq)]
pub enum FragmentOutcome {
    Rendered { content: String, image: PathBuf },
    Skipped { content: String, reason: String },
    Failed { content: String, kind: FailureKind, message: String },
}

/// Per-file counters; also summed across a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub formulas_count: usize,
    pub texts_count: usize,
    #[serde(default)]
    pub tables_count: usize,
    pub errors_count: usize,
    #[serde(default)]
    pub skipped_count: usize,
}

impl FileStats {
    pub fn rendered(&self) -> usize {
        self.formulas_count + self.texts_count + self.tables_count
    }

    /// Render attempts; skipped fragments never reach the renderer.
    pub fn attempted(&self) -> usize {
        self.rendered() + self.errors_count
    }

    pub fn record_rendered(&mut self, kind: FragmentKind) {
        match kind {
            FragmentKind::Formula => self.formulas_count += 1,
            FragmentKind::Text => self.texts_count += 1,
            FragmentKind::Table => self.tables_count += 1,
        }
    }

    pub fn absorb(&mut self, other: &FileStats) {
        self.formulas_count += other.formulas_count;
        self.texts_count += other.texts_count;
        self.tables_count += other.tables_count;
        self.errors_count += other.errors_count;
        self.skipped_count += other.skipped_count;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub error_type: String,
    pub error_message: String,
}

/// What a worker reports back for one task: `(path, success, stats)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub success: bool,
    pub stats: FileStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FileFailure>,
}

impl FileOutcome {
    pub fn succeeded(path: PathBuf, stats: FileStats) -> Self {
        Self {
            path,
            success: true,
            stats,
            failure: None,
        }
    }

    pub fn failed(path: PathBuf, failure: FileFailure) -> Self {
        Self {
            path,
            success: false,
            stats: FileStats {
                errors_count: 1,
                ..FileStats::default()
            },
            failure: Some(failure),
        }
    }
}
