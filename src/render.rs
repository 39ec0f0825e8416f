//! Render Invoker: one isolated renderer process per fragment.
//!
//! The renderer is an external program called as
//! `<renderer...> <kind> <json-content> <output_path> <dpi>` which must print
//! exactly one JSON line `{"success", "output_path", "error"}` on stdout.
//! A fresh process per fragment keeps the typesetter's memory from growing
//! across a file and turns its crashes and hangs into ordinary failures.

use crate::process::{self, Supervised, Waited};
use crate::trim::{PostProcess, Verdict, WhitespaceTrim};
use crate::types::{FailureKind, FragmentKind, RunConfig};
use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(30);

const STDERR_TAIL_CHARS: usize = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RenderFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RenderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Anything that turns one fragment into an image file.
pub trait Render {
    fn render(
        &self,
        content: &str,
        kind: FragmentKind,
        output: &Path,
        dpi: u32,
    ) -> Result<PathBuf, RenderFailure>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    output_path: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct RenderInvoker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    post: Box<dyn PostProcess>,
}

impl RenderInvoker {
    pub fn new(renderer: &[String]) -> Result<Self> {
        let (program, args) = renderer
            .split_first()
            .ok_or_else(|| anyhow!("renderer command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: DEFAULT_RENDER_TIMEOUT,
            post: Box::new(WhitespaceTrim::default()),
        })
    }

    pub fn from_config(cfg: &RunConfig) -> Result<Self> {
        Ok(Self::new(&cfg.renderer)?
            .with_timeout(cfg.render_timeout())
            .with_post_process(WhitespaceTrim::with_threshold(cfg.blank_pixel_threshold)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_post_process(mut self, post: impl PostProcess + 'static) -> Self {
        self.post = Box::new(post);
        self
    }

    fn command(&self, content_json: &str, kind: FragmentKind, output: &Path, dpi: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(kind.as_str())
            .arg(content_json)
            .arg(output)
            .arg(dpi.to_string());
        cmd
    }
}

impl Render for RenderInvoker {
    fn render(
        &self,
        content: &str,
        kind: FragmentKind,
        output: &Path,
        dpi: u32,
    ) -> Result<PathBuf, RenderFailure> {
        let content_json = serde_json::to_string(content).map_err(|e| {
            RenderFailure::new(FailureKind::ProtocolError, format!("cannot encode content: {e}"))
        })?;

        let child = Supervised::spawn(&mut self.command(&content_json, kind, output, dpi), true)
            .map_err(|e| {
                RenderFailure::new(
                    FailureKind::ProcessCrash,
                    format!("failed to start renderer '{}': {e}", self.program),
                )
            })?;

        let finished = match child.wait_timeout(self.timeout) {
            Ok(Waited::Finished(f)) => f,
            Ok(Waited::TimedOut) => {
                warn!(output = %output.display(), timeout_secs = self.timeout.as_secs_f64(), "renderer timed out");
                return Err(RenderFailure::new(
                    FailureKind::Timeout,
                    format!("renderer exceeded {:.1}s", self.timeout.as_secs_f64()),
                ));
            }
            Err(e) => {
                return Err(RenderFailure::new(
                    FailureKind::ProcessCrash,
                    format!("lost track of renderer process: {e}"),
                ));
            }
        };

        if !finished.status.success() {
            let mut message = format!("renderer exited with {}", process::describe_status(&finished.status));
            let stderr = process::tail(&finished.stderr, STDERR_TAIL_CHARS);
            if !stderr.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr);
            }
            return Err(RenderFailure::new(FailureKind::ProcessCrash, message));
        }

        let envelope = parse_envelope(&finished.stdout)?;
        if !envelope.success {
            return Err(RenderFailure::new(
                FailureKind::RenderingError,
                envelope
                    .error
                    .unwrap_or_else(|| "renderer reported failure without a message".to_string()),
            ));
        }

        let image = envelope.output_path.map(PathBuf::from).ok_or_else(|| {
            RenderFailure::new(FailureKind::ProtocolError, "success reported without output_path")
        })?;

        match self.post.finish(&image) {
            Verdict::Kept => {
                debug!(image = %image.display(), "fragment rendered");
                Ok(image)
            }
            Verdict::Blank { non_white } => {
                if let Err(e) = std::fs::remove_file(&image) {
                    warn!(image = %image.display(), error = %e, "failed to delete blank image");
                }
                Err(RenderFailure::new(
                    FailureKind::BlankImageError,
                    format!("blank image ({non_white} non-white pixels)"),
                ))
            }
        }
    }
}

/// Exactly one non-empty line holding the envelope; anything else is a
/// protocol violation.
fn parse_envelope(stdout: &str) -> Result<Envelope, RenderFailure> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let (Some(line), None) = (lines.next(), lines.next()) else {
        return Err(RenderFailure::new(
            FailureKind::ProtocolError,
            format!(
                "expected one JSON line on stdout, got: {}",
                process::tail(stdout, STDERR_TAIL_CHARS)
            ),
        ));
    };

    serde_json::from_str(line).map_err(|e| {
        RenderFailure::new(
            FailureKind::ProtocolError,
            format!("unparsable renderer output ({e}): {}", process::tail(line, STDERR_TAIL_CHARS)),
        )
    })
}
