use crate::types::{FileStats, FragmentKind};
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const FILE_CACHES_DIR: &str = "file_caches";
const CACHE_EXT: &str = "cache";
const SUMMARY_FILE: &str = "summary.json";

/// Cache key: `<stem>_<first 8 hex of blake3(path)>`.
///
/// The stem keeps keys readable; the hash separates equal stems in different
/// directories.
pub fn cache_key(source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    let safe: String = stem
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ' ') { '_' } else { c })
        .collect();

    let digest = blake3::hash(source.to_string_lossy().as_bytes());
    let hex = digest.to_hex();
    format!("{}_{}", safe, &hex.as_str()[..8])
}

pub fn now_iso8601() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&Rfc3339).unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/* =========================
   Record shape
   ========================= */

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderedFragment {
    pub content: String,
    pub image: String,
    pub document_index: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputFiles {
    pub formulas: Vec<RenderedFragment>,
    pub texts: Vec<RenderedFragment>,
    #[serde(default)]
    pub tables: Vec<RenderedFragment>,
}

impl OutputFiles {
    pub fn push(&mut self, kind: FragmentKind, fragment: RenderedFragment) {
        match kind {
            FragmentKind::Formula => self.formulas.push(fragment),
            FragmentKind::Text => self.texts.push(fragment),
            FragmentKind::Table => self.tables.push(fragment),
        }
    }
}

/// One failed fragment, positioned within its document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentError {
    pub error_message: String,
    /// Markup classification for renderer-reported errors, invoker kind otherwise.
    pub error_type: String,
    /// Invoker classification (RenderingError, Timeout, ...).
    pub source_error_type: String,
    pub content_preview: String,
    pub item_index: usize,
    pub item_type: String,
    pub document_index: usize,
}

/// Fragment that was never sent to the renderer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkippedFragment {
    pub error_type: String,
    pub skip_reason: String,
    pub content_preview: String,
    pub item_index: usize,
    pub item_type: String,
    pub document_index: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderedPayload {
    pub output_files: OutputFiles,
    pub stats: FileStats,
    #[serde(default)]
    pub errors: Vec<FragmentError>,
    #[serde(default)]
    pub skipped: Vec<SkippedFragment>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedPayload {
    pub error: String,
    pub error_type: String,
    pub error_traceback: String,
    pub file_path: String,
}

/// Success and failure records carry different keys; `status` tells them apart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CachePayload {
    Ok(RenderedPayload),
    Failed(FailedPayload),
}

impl CachePayload {
    pub fn is_failed(&self) -> bool {
        matches!(self, CachePayload::Failed(_))
    }

    pub fn status(&self) -> &'static str {
        match self {
            CachePayload::Ok(_) => "ok",
            CachePayload::Failed(_) => "failed",
        }
    }
}

/// What a producer hands to [`CacheStore::write`]; the store adds the
/// path and `cached_at` metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub timestamp: String,
    pub process_id: u32,
    pub payload: CachePayload,
}

impl CacheEntry {
    pub fn now(payload: CachePayload) -> Self {
        Self {
            timestamp: now_iso8601(),
            process_id: std::process::id(),
            payload,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub original_file_path: String,
    pub cache_file: String,
    pub cached_at: String,
    pub timestamp: String,
    pub process_id: u32,
    #[serde(flatten)]
    pub payload: CachePayload,
}

/* =========================
   Store
   ========================= */

/// One JSON file per source document under `<root>/file_caches/`.
///
/// There is no lock and no shared index. Writers never collide because a run
/// dispatches each source path (and therefore each key) to exactly one task.
#[derive(Clone, Debug)]
pub struct CacheStore {
    root: PathBuf,
    file_caches: PathBuf,
}

impl CacheStore {
    pub fn open(root: &Path) -> Result<Self> {
        let file_caches = root.join(FILE_CACHES_DIR);
        std::fs::create_dir_all(&file_caches)
            .with_context(|| format!("create cache dir {}", file_caches.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            file_caches,
        })
    }

    /// cache file path: <root>/file_caches/<key>.cache
    pub fn cache_path(&self, source: &Path) -> PathBuf {
        self.file_caches
            .join(format!("{}.{}", cache_key(source), CACHE_EXT))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }

    pub fn has(&self, source: &Path) -> bool {
        self.cache_path(source).exists()
    }

    /// Overwrite the record for `source`. Errors are logged, never returned:
    /// one lost record must not take down the task that produced it.
    pub fn write(&self, source: &Path, entry: CacheEntry) -> bool {
        let path = self.cache_path(source);
        let record = CacheRecord {
            original_file_path: source.to_string_lossy().into_owned(),
            cache_file: path.to_string_lossy().into_owned(),
            cached_at: now_iso8601(),
            timestamp: entry.timestamp,
            process_id: entry.process_id,
            payload: entry.payload,
        };

        match write_json(&path, &record) {
            Ok(()) => {
                debug!(cache_file = %path.display(), status = record.payload.status(), "cache record written");
                true
            }
            Err(e) => {
                warn!(cache_file = %path.display(), error = %format!("{e:#}"), "failed to write cache record");
                false
            }
        }
    }

    /// Missing, unreadable and corrupt files all read as absent.
    pub fn read(&self, source: &Path) -> Option<CacheRecord> {
        load_record(&self.cache_path(source))
    }

    /// Every readable record; corrupt or half-written files are skipped.
    pub fn list(&self) -> Vec<CacheRecord> {
        self.record_paths()
            .par_iter()
            .filter_map(|p| {
                let rec = load_record(p);
                if rec.is_none() {
                    debug!(cache_file = %p.display(), "skipping unreadable cache file");
                }
                rec
            })
            .collect()
    }

    /// Remove one record (by source path) or all of them. Best effort; returns
    /// how many files were deleted.
    pub fn clear(&self, source: Option<&Path>) -> usize {
        let targets = match source {
            Some(src) => vec![self.cache_path(src)],
            None => self.record_paths(),
        };

        let mut removed = 0usize;
        for p in targets {
            match std::fs::remove_file(&p) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(cache_file = %p.display(), error = %e, "failed to remove cache file"),
            }
        }

        match source {
            Some(src) => info!(source = %src.display(), removed, "cleared file cache"),
            None => info!(removed, "cleared all cache files"),
        }
        removed
    }

    pub fn write_summary<T: Serialize>(&self, summary: &T) -> bool {
        let path = self.summary_path();
        match write_json(&path, summary) {
            Ok(()) => true,
            Err(e) => {
                warn!(summary = %path.display(), error = %format!("{e:#}"), "failed to write summary");
                false
            }
        }
    }

    fn record_paths(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = WalkDir::new(&self.file_caches)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().map(|x| x == CACHE_EXT).unwrap_or(false))
            .collect();
        out.sort();
        out
    }
}

fn load_record(path: &Path) -> Option<CacheRecord> {
    let s = std::fs::read_to_string(path).ok()?;
    let rec: CacheRecord = serde_json::from_str(&s).ok()?;
    if rec.original_file_path.is_empty() {
        return None;
    }
    Some(rec)
}

/// Serialize to a sibling temp file, then rename over the target so readers
/// see either the old or the new document.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let s = serde_json::to_string_pretty(value)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, s).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn ok_payload(formulas: usize) -> CachePayload {
        CachePayload::Ok(RenderedPayload {
            stats: FileStats {
                formulas_count: formulas,
                ..FileStats::default()
            },
            ..RenderedPayload::default()
        })
    }

    #[test]
    fn key_uses_stem_and_hash() {
        let key = cache_key(Path::new("/data/batch one/paper 01.json"));
        assert!(key.starts_with("paper_01_"));
        assert_eq!(key.len(), "paper_01_".len() + 8);
        assert_eq!(key, cache_key(Path::new("/data/batch one/paper 01.json")));
    }

    #[test]
    fn colliding_stems_get_distinct_keys() {
        let keys: HashSet<String> = (0..10_000)
            .map(|i| cache_key(&PathBuf::from(format!("/corpus/shard_{i}/doc.json"))))
            .collect();
        assert_eq!(keys.len(), 10_000);
    }

    #[test]
    fn write_then_read_adds_metadata() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let src = Path::new("/inputs/a.json");

        assert!(!store.has(src));
        assert!(store.write(src, CacheEntry::now(ok_payload(2))));
        assert!(store.has(src));

        let rec = store.read(src).unwrap();
        assert_eq!(rec.original_file_path, "/inputs/a.json");
        assert_eq!(PathBuf::from(&rec.cache_file), store.cache_path(src));
        assert_eq!(rec.process_id, std::process::id());
        assert!(!rec.cached_at.is_empty());
        assert_eq!(rec.payload, ok_payload(2));
    }

    #[test]
    fn record_json_carries_status_discriminant() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let src = Path::new("/inputs/broken.json");
        store.write(
            src,
            CacheEntry::now(CachePayload::Failed(FailedPayload {
                error: "EOF while parsing".into(),
                error_type: "JsonError".into(),
                error_traceback: "EOF while parsing".into(),
                file_path: "/inputs/broken.json".into(),
            })),
        );

        let raw = std::fs::read_to_string(store.cache_path(src)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["error_type"], "JsonError");
        assert!(v.get("output_files").is_none());

        assert!(store.read(src).unwrap().payload.is_failed());
    }

    #[test]
    fn corrupt_files_read_as_absent_and_are_skipped_by_list() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        store.write(Path::new("/in/good.json"), CacheEntry::now(ok_payload(1)));

        let bad = Path::new("/in/bad.json");
        std::fs::write(store.cache_path(bad), "{\"original_file_path\": \"/in/b").unwrap();
        std::fs::write(dir.path().join("file_caches/notes.txt"), "ignored").unwrap();

        assert!(store.read(bad).is_none());
        assert!(store.has(bad));

        let all = store.list();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].original_file_path, "/in/good.json");
    }

    #[test]
    fn rewrite_overwrites_wholesale() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let src = Path::new("/in/a.json");
        store.write(src, CacheEntry::now(ok_payload(1)));
        store.write(src, CacheEntry::now(ok_payload(7)));

        assert_eq!(store.list().len(), 1);
        assert_eq!(store.read(src).unwrap().payload, ok_payload(7));
    }

    #[test]
    fn clear_one_and_all() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        for name in ["/in/a.json", "/in/b.json", "/in/c.json"] {
            store.write(Path::new(name), CacheEntry::now(ok_payload(1)));
        }

        assert_eq!(store.clear(Some(Path::new("/in/b.json"))), 1);
        assert_eq!(store.clear(Some(Path::new("/in/b.json"))), 0);
        assert_eq!(store.list().len(), 2);

        assert_eq!(store.clear(None), 2);
        assert!(store.list().is_empty());
    }

    #[test]
    fn write_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let src = Path::new("/in/a.json");
        // a directory squatting on the target makes the rename fail
        std::fs::create_dir_all(store.cache_path(src).join("x")).unwrap();

        assert!(!store.write(src, CacheEntry::now(ok_payload(1))));
    }
}
