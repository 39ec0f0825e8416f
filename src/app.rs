use crate::autotune;
use crate::cache::CacheStore;
use crate::config::ResolvedConfig;
use crate::error::BatchError;
use crate::fs_scan;
use crate::scheduler::{self, Event, Launcher, RunReport, SchedulerOptions, SelfExeLauncher, TaskStatus};
use crate::summary::{self, RunSummary};
use crate::task_unit;
use crate::types::{FileOutcome, RunConfig, Task};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct BatchOptions {
    pub file_list: PathBuf,
    pub config: ResolvedConfig,
    pub resume: bool,
    /// With `resume`, re-queue files whose record says `failed`.
    pub retry_failed: bool,
    pub max_files: Option<usize>,
    pub verbose: bool,
}

#[derive(Debug)]
pub struct BatchReport {
    pub queued: usize,
    pub skipped_cached: usize,
    pub run: RunReport,
    pub summary: RunSummary,
}

/* =========================
   Batch run
   ========================= */

pub fn run_batch(opts: &BatchOptions) -> Result<BatchReport> {
    let launcher = SelfExeLauncher::current(opts.config.log_file.clone(), opts.verbose)?;
    run_batch_with(&launcher, opts)
}

pub fn run_batch_with<L: Launcher>(launcher: &L, opts: &BatchOptions) -> Result<BatchReport> {
    if let Some(0) = opts.config.workers {
        return Err(BatchError::InvalidWorkerCount(0).into());
    }
    let cfg = &opts.config.run;

    let mut inputs = fs_scan::load_inputs(&opts.file_list)?;
    info!(list = %opts.file_list.display(), files = inputs.len(), "loaded file list");

    if let Some(n) = opts.max_files {
        if inputs.len() > n {
            inputs.truncate(n);
            info!(max_files = n, "file list truncated");
        }
    }

    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("create output dir {}", cfg.output_dir.display()))?;
    let store = CacheStore::open(&cfg.cache_dir)?;

    let (pending, skipped_cached) = if opts.resume {
        let (pending, skipped) = pending_inputs(&store, inputs, opts.retry_failed);
        info!(pending = pending.len(), "resume: skipped {skipped} cached file(s)");
        (pending, skipped)
    } else {
        (inputs, 0)
    };

    let cpus = autotune::logical_cpus();
    let workers = opts
        .config
        .workers
        .unwrap_or_else(|| autotune::default_workers(cpus, pending.len()));
    for w in autotune::worker_warnings(workers, cpus) {
        warn!("{w}");
    }

    info!(
        output_dir = %cfg.output_dir.display(),
        cache_dir = %cfg.cache_dir.display(),
        workers,
        kinds = ?cfg.kinds,
        dpi = cfg.dpi,
        "starting batch"
    );

    let queued = pending.len();
    let tasks: Vec<Task> = pending
        .into_iter()
        .map(|input| Task {
            input,
            config: cfg.clone(),
        })
        .collect();

    let sched = SchedulerOptions::new(workers, opts.config.task_timeout);
    let run = scheduler::run(launcher, tasks, &sched, &store, log_event);
    let summary = summary::save(&store);

    let report = BatchReport {
        queued,
        skipped_cached,
        run,
        summary,
    };
    log_report(&report, &store, opts.config.log_file.as_deref());
    Ok(report)
}

/// Files that still need work: no record yet, or (with `retry_failed`) a
/// failed or unreadable one. Returns the pending list and the skip count.
fn pending_inputs(
    store: &CacheStore,
    inputs: Vec<PathBuf>,
    retry_failed: bool,
) -> (Vec<PathBuf>, usize) {
    let before = inputs.len();
    let pending: Vec<PathBuf> = inputs
        .into_iter()
        .filter(|p| {
            if !store.has(p) {
                return true;
            }
            retry_failed
                && store
                    .read(p)
                    .map(|rec| rec.payload.is_failed())
                    .unwrap_or(true)
        })
        .collect();
    let skipped = before - pending.len();
    (pending, skipped)
}

fn log_event(ev: &Event) {
    let Event::Completed(done) = ev else {
        return;
    };
    let progress = format!("[{}/{}]", done.completed, done.total);
    let file = done.path.display();
    match &done.status {
        TaskStatus::Completed(outcome) if outcome.success => info!(
            elapsed_ms = done.elapsed.as_millis() as u64,
            in_flight = done.in_flight,
            queued = done.queued,
            "{progress} done {file}: {} formulas, {} texts, {} tables, {} errors",
            outcome.stats.formulas_count,
            outcome.stats.texts_count,
            outcome.stats.tables_count,
            outcome.stats.errors_count
        ),
        TaskStatus::Completed(outcome) => warn!(
            error_type = outcome.failure.as_ref().map(|f| f.error_type.as_str()).unwrap_or("unknown"),
            "{progress} failed {file}"
        ),
        TaskStatus::Crashed { message } => warn!("{progress} crashed {file}: {message}"),
        TaskStatus::TimedOut { elapsed } => {
            warn!("{progress} timed out {file} after {:.1}s", elapsed.as_secs_f64())
        }
    }
}

fn log_report(report: &BatchReport, store: &CacheStore, log_file: Option<&Path>) {
    let run = &report.run;
    let totals = report.summary.stats();

    info!("=== BATCH DONE ===");
    info!(
        "this run: {} files dispatched, {} ok, {} failed, {} crashed, {} timed out (peak {} workers)",
        run.dispatched, run.succeeded, run.failed_files, run.crashed, run.timed_out, run.peak_in_flight
    );
    info!(
        "this run: {} formulas, {} texts, {} tables, {} errors, {} skipped",
        run.stats.formulas_count,
        run.stats.texts_count,
        run.stats.tables_count,
        run.stats.errors_count,
        run.stats.skipped_count
    );
    info!(
        "cache: {} files, {} formulas, {} texts, {} tables, {} errors, {} failed files",
        report.summary.total_cached_files,
        totals.formulas_count,
        totals.texts_count,
        totals.tables_count,
        totals.errors_count,
        report.summary.total_failed_files
    );
    match summary::success_rate(&totals) {
        Some(rate) => info!("success rate: {rate:.1}%"),
        None => info!("success rate: n/a (nothing rendered)"),
    }
    info!(summary = %store.summary_path().display(), "summary file");
    if let Some(log) = log_file {
        info!(log = %log.display(), "log file");
    }
}

/* =========================
   Single file / maintenance
   ========================= */

/// Render one document in-process and print where its images went.
pub fn render_file(cfg: &RunConfig, path: &Path) -> Result<FileOutcome> {
    let cwd = std::env::current_dir().context("resolve working directory")?;
    let input = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    let task = Task {
        input,
        config: cfg.clone(),
    };

    let (outcome, record) = task_unit::render_single(&task)?;
    if let Some(record) = record {
        println!("{}", serde_json::to_string_pretty(&record)?);
    }
    match summary::success_rate(&outcome.stats) {
        Some(rate) => info!(file = %task.input.display(), "success rate: {rate:.1}%"),
        None => info!(file = %task.input.display(), "nothing rendered"),
    }
    Ok(outcome)
}

pub fn summary_cmd(cache_dir: &Path) -> Result<RunSummary> {
    let store = CacheStore::open(cache_dir)?;
    let summary = summary::save(&store);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary)
}

pub fn clear_cmd(cache_dir: &Path, file: Option<&Path>) -> Result<usize> {
    let store = CacheStore::open(cache_dir)?;
    let target = match file {
        Some(p) if p.is_relative() => Some(std::env::current_dir()?.join(p)),
        Some(p) => Some(p.to_path_buf()),
        None => None,
    };
    let removed = store.clear(target.as_deref());
    println!("removed {removed} cache file(s)");
    Ok(removed)
}

/// Body of the hidden `worker` subcommand.
pub fn worker(task_json: &str) -> Result<FileOutcome> {
    let task: Task = serde_json::from_str(task_json).context("decode worker task")?;
    Ok(task_unit::run_task(&task))
}
