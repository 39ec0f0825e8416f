use crate::cache::{CachePayload, CacheStore, now_iso8601};
use crate::types::FileStats;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheFileEntry {
    pub file_path: String,
    pub cache_file: String,
    pub timestamp: String,
    pub status: String,
}

/// Rollup of every record in the cache. Derived data: it can always be
/// regenerated from `file_caches/`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_cached_files: usize,
    pub total_formulas: usize,
    pub total_texts: usize,
    pub total_tables: usize,
    pub total_errors: usize,
    pub total_skipped: usize,
    pub total_failed_files: usize,
    pub cache_files: Vec<CacheFileEntry>,
    pub generated_at: String,
}

impl RunSummary {
    pub fn stats(&self) -> FileStats {
        FileStats {
            formulas_count: self.total_formulas,
            texts_count: self.total_texts,
            tables_count: self.total_tables,
            errors_count: self.total_errors,
            skipped_count: self.total_skipped,
        }
    }
}

pub fn aggregate(store: &CacheStore) -> RunSummary {
    let records = store.list();

    let (stats, failed_files) = records
        .par_iter()
        .map(|rec| match &rec.payload {
            CachePayload::Ok(ok) => (ok.stats.clone(), 0usize),
            CachePayload::Failed(_) => (
                FileStats {
                    errors_count: 1,
                    ..FileStats::default()
                },
                1,
            ),
        })
        .reduce(
            || (FileStats::default(), 0),
            |(mut acc, fa), (s, fb)| {
                acc.absorb(&s);
                (acc, fa + fb)
            },
        );

    let mut cache_files: Vec<CacheFileEntry> = records
        .iter()
        .map(|rec| CacheFileEntry {
            file_path: rec.original_file_path.clone(),
            cache_file: rec.cache_file.clone(),
            timestamp: rec.timestamp.clone(),
            status: rec.payload.status().to_string(),
        })
        .collect();
    cache_files.sort_by(|a, b| a.file_path.cmp(&b.file_path));

    RunSummary {
        total_cached_files: records.len(),
        total_formulas: stats.formulas_count,
        total_texts: stats.texts_count,
        total_tables: stats.tables_count,
        total_errors: stats.errors_count,
        total_skipped: stats.skipped_count,
        total_failed_files: failed_files,
        cache_files,
        generated_at: now_iso8601(),
    }
}

/// Aggregate and write `summary.json` next to `file_caches/`.
pub fn save(store: &CacheStore) -> RunSummary {
    let summary = aggregate(store);
    if store.write_summary(&summary) {
        info!(
            summary = %store.summary_path().display(),
            files = summary.total_cached_files,
            "summary written"
        );
    }
    summary
}

/// Percentage of render attempts that produced an image. Skipped fragments
/// are not attempts. `None` when nothing was attempted.
pub fn success_rate(stats: &FileStats) -> Option<f64> {
    let attempted = stats.attempted();
    if attempted == 0 {
        return None;
    }
    Some(stats.rendered() as f64 / attempted as f64 * 100.0)
}
