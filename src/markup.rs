//! Markup inspection that doesn't need the typesetter: spotting fragments
//! that only define macros, and naming the toolchain's error messages.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

fn definition_head() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\\(?:re)?newcommand\*?\{[^}]+\}(?:\[[0-9]+\])?\{")
            .expect("definition pattern is valid")
    })
}

/// True when `content` is nothing but `\newcommand` / `\renewcommand`
/// definitions. Such fragments produce no output and are skipped.
pub fn is_pure_definition(content: &str) -> bool {
    let mut rest = content.trim().to_string();
    if !(rest.starts_with(r"\newcommand") || rest.starts_with(r"\renewcommand")) {
        return false;
    }

    while let Some(m) = definition_head().find(&rest) {
        // m.end() sits just past the body's opening brace
        let mut depth = 1usize;
        let mut end = None;
        for (i, ch) in rest[m.end()..].char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(m.end() + i + 1);
                        break;
                    }
                }
                _ => {}
            }
        }
        let Some(end) = end else {
            break;
        };
        rest.replace_range(m.start()..end, "");
    }

    rest.trim().is_empty()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MarkupErrorKind {
    UndefinedCommand,
    MathModeError,
    AlignmentError,
    BraceError,
    PackageError,
    TimeoutError,
    EncodingError,
    MemoryError,
    #[serde(rename = "LaTeXSyntaxError")]
    SyntaxError,
}

impl MarkupErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkupErrorKind::UndefinedCommand => "UndefinedCommand",
            MarkupErrorKind::MathModeError => "MathModeError",
            MarkupErrorKind::AlignmentError => "AlignmentError",
            MarkupErrorKind::BraceError => "BraceError",
            MarkupErrorKind::PackageError => "PackageError",
            MarkupErrorKind::TimeoutError => "TimeoutError",
            MarkupErrorKind::EncodingError => "EncodingError",
            MarkupErrorKind::MemoryError => "MemoryError",
            MarkupErrorKind::SyntaxError => "LaTeXSyntaxError",
        }
    }
}

impl fmt::Display for MarkupErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a typesetter error message onto a markup error class. First match wins.
pub fn classify_error(message: &str) -> MarkupErrorKind {
    let msg = message.to_lowercase();
    let has = |needle: &str| msg.contains(needle);

    if has("undefined control sequence") {
        MarkupErrorKind::UndefinedCommand
    } else if has("missing") && (has("$") || has("math")) {
        MarkupErrorKind::MathModeError
    } else if has("extra") && (has("alignment") || has("&")) {
        MarkupErrorKind::AlignmentError
    } else if has("missing") && (has("{") || has("}")) {
        MarkupErrorKind::BraceError
    } else if has("package") && has("not found") {
        MarkupErrorKind::PackageError
    } else if has("timeout") || has("time") {
        MarkupErrorKind::TimeoutError
    } else if has("unicode") || has("encoding") {
        MarkupErrorKind::EncodingError
    } else if has("memory") || has("capacity") {
        MarkupErrorKind::MemoryError
    } else {
        MarkupErrorKind::SyntaxError
    }
}
