use crate::error::BatchError;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Input documents are JSON
fn is_json_file(p: &Path) -> bool {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// One path per line; blank lines and `#` comments are ignored.
pub fn read_file_list(list: &Path) -> Result<Vec<PathBuf>, BatchError> {
    let raw = fs::read_to_string(list).map_err(|source| {
        if source.kind() == ErrorKind::NotFound {
            BatchError::FileListMissing(list.to_path_buf())
        } else {
            BatchError::FileListUnreadable {
                path: list.to_path_buf(),
                source,
            }
        }
    })?;

    let entries: Vec<PathBuf> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(PathBuf::from)
        .collect();

    if entries.is_empty() {
        return Err(BatchError::EmptyFileList(list.to_path_buf()));
    }
    Ok(entries)
}

/// All `*.json` files beneath `dir`, sorted.
fn expand_dir(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_json_file(p))
        .collect();
    out.sort();
    out
}

fn absolutize(p: &Path, cwd: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    }
}

/// Drop missing paths (with a warning), expand directories, make paths
/// absolute and remove duplicates keeping the first occurrence.
///
/// `list` only names the source in the error when nothing survives.
pub fn validate(entries: &[PathBuf], list: &Path) -> Result<Vec<PathBuf>, BatchError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut out = Vec::with_capacity(entries.len());

    for entry in entries {
        let p = absolutize(entry, &cwd);
        let candidates = if p.is_dir() {
            let found = expand_dir(&p);
            debug!(dir = %p.display(), files = found.len(), "expanded input directory");
            found
        } else if p.is_file() {
            vec![p]
        } else {
            warn!(path = %entry.display(), "input file not found, skipping");
            continue;
        };

        for c in candidates {
            let identity = fs::canonicalize(&c).unwrap_or_else(|_| c.clone());
            if seen.insert(identity) {
                out.push(c);
            } else {
                debug!(path = %c.display(), "duplicate input path dropped");
            }
        }
    }

    if out.is_empty() {
        return Err(BatchError::NoValidFiles(list.to_path_buf()));
    }
    Ok(out)
}

/// `read_file_list` followed by `validate`.
pub fn load_inputs(list: &Path) -> Result<Vec<PathBuf>, BatchError> {
    let entries = read_file_list(list)?;
    validate(&entries, list)
}
