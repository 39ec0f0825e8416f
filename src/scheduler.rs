//! Worker Pool Scheduler: one OS process per file task, at most `max_workers`
//! of them alive at once, refilled as soon as any of them finishes.
//!
//! Workers are polled without blocking; whichever exits first is collected
//! first. A worker that crashes, prints garbage or outlives the per-file
//! ceiling is recorded as a failed file (including a failure record in the
//! cache on its behalf) and the queue keeps draining.

use crate::cache::{CacheEntry, CachePayload, CacheStore, FailedPayload};
use crate::process::{Finished, Supervised, Waited, describe_status, tail};
use crate::types::{FileOutcome, FileStats, Task};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Builds the command that runs one task in a fresh process.
pub trait Launcher {
    fn command(&self, task: &Task) -> Result<Command>;
}

/// Re-executes the running binary with the hidden `worker` subcommand.
#[derive(Clone, Debug)]
pub struct SelfExeLauncher {
    exe: PathBuf,
    log_file: Option<PathBuf>,
    verbose: bool,
}

impl SelfExeLauncher {
    pub fn current(log_file: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let exe = std::env::current_exe().context("locate current executable")?;
        Ok(Self::new(exe, log_file, verbose))
    }

    pub fn new(exe: PathBuf, log_file: Option<PathBuf>, verbose: bool) -> Self {
        Self {
            exe,
            log_file,
            verbose,
        }
    }
}

impl Launcher for SelfExeLauncher {
    fn command(&self, task: &Task) -> Result<Command> {
        let encoded = serde_json::to_string(task).context("encode task")?;
        let mut cmd = Command::new(&self.exe);
        if let Some(log) = &self.log_file {
            cmd.arg("--log-file").arg(log);
        }
        if self.verbose {
            cmd.arg("--verbose");
        }
        cmd.arg("worker").arg("--task").arg(encoded);
        Ok(cmd)
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    pub max_workers: usize,
    /// Whole-file ceiling, measured from dispatch.
    pub task_timeout: Duration,
    pub poll_interval: Duration,
}

impl SchedulerOptions {
    pub fn new(max_workers: usize, task_timeout: Duration) -> Self {
        Self {
            max_workers: max_workers.max(1),
            task_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskStatus {
    /// Worker exited cleanly and reported an outcome (which may itself be a
    /// file-level failure).
    Completed(FileOutcome),
    Crashed { message: String },
    TimedOut { elapsed: Duration },
}

#[derive(Clone, Debug)]
pub struct Completion {
    pub path: PathBuf,
    pub status: TaskStatus,
    pub elapsed: Duration,
    pub completed: usize,
    pub total: usize,
    pub in_flight: usize,
    pub queued: usize,
}

#[derive(Clone, Debug)]
pub enum Event {
    Dispatched { path: PathBuf, in_flight: usize },
    Completed(Completion),
    /// Nothing finished during a pass; the scheduler is about to sleep.
    Waiting { in_flight: usize, queued: usize },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed_files: usize,
    pub crashed: usize,
    pub timed_out: usize,
    pub stats: FileStats,
    pub peak_in_flight: usize,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed_files + self.crashed + self.timed_out
    }
}

struct Running {
    path: PathBuf,
    child: Supervised,
}

/// Drain `tasks` through at most `opts.max_workers` worker processes.
pub fn run<L, F>(
    launcher: &L,
    tasks: Vec<Task>,
    opts: &SchedulerOptions,
    store: &CacheStore,
    mut observer: F,
) -> RunReport
where
    L: Launcher,
    F: FnMut(&Event),
{
    let total = tasks.len();
    let max_workers = opts.max_workers.max(1);
    let mut queue: VecDeque<Task> = tasks.into();
    let mut running: Vec<Running> = Vec::with_capacity(max_workers);
    let mut report = RunReport::default();

    info!(total, max_workers, task_timeout_secs = opts.task_timeout.as_secs(), "scheduling file tasks");

    while !queue.is_empty() || !running.is_empty() {
        while running.len() < max_workers {
            let Some(task) = queue.pop_front() else {
                break;
            };
            report.dispatched += 1;

            match spawn(launcher, &task) {
                Ok(child) => {
                    debug!(file = %task.input.display(), pid = ?child.id(), "worker started");
                    running.push(Running {
                        path: task.input.clone(),
                        child,
                    });
                    report.peak_in_flight = report.peak_in_flight.max(running.len());
                    observer(&Event::Dispatched {
                        path: task.input,
                        in_flight: running.len(),
                    });
                }
                Err(e) => {
                    let status = TaskStatus::Crashed {
                        message: format!("failed to start worker: {e:#}"),
                    };
                    let done = settle(
                        store,
                        &mut report,
                        task.input,
                        status,
                        Duration::ZERO,
                        (total, running.len(), queue.len()),
                    );
                    observer(&Event::Completed(done));
                }
            }
        }

        let mut progressed = false;
        let mut i = 0usize;
        while i < running.len() {
            // exit is checked before the ceiling
            let status = match running[i].child.poll(opts.task_timeout) {
                Ok(None) => {
                    i += 1;
                    continue;
                }
                Ok(Some(Waited::Finished(finished))) => interpret(finished),
                Ok(Some(Waited::TimedOut)) => TaskStatus::TimedOut {
                    elapsed: running[i].child.elapsed(),
                },
                Err(e) => TaskStatus::Crashed {
                    message: format!("failed to poll worker: {e}"),
                },
            };

            let entry = running.swap_remove(i);
            let elapsed = entry.child.elapsed();
            progressed = true;
            let done = settle(
                store,
                &mut report,
                entry.path,
                status,
                elapsed,
                (total, running.len(), queue.len()),
            );
            observer(&Event::Completed(done));
        }

        if !progressed && !running.is_empty() {
            observer(&Event::Waiting {
                in_flight: running.len(),
                queued: queue.len(),
            });
            std::thread::sleep(opts.poll_interval);
        }
    }

    info!(
        dispatched = report.dispatched,
        succeeded = report.succeeded,
        failed_files = report.failed_files,
        crashed = report.crashed,
        timed_out = report.timed_out,
        peak_in_flight = report.peak_in_flight,
        "all file tasks finished"
    );
    report
}

fn spawn<L: Launcher>(launcher: &L, task: &Task) -> Result<Supervised> {
    let mut cmd = launcher.command(task)?;
    Supervised::spawn(&mut cmd, false).context("spawn worker process")
}

/// A clean exit must come with an outcome line; anything else is a crash.
fn interpret(finished: Finished) -> TaskStatus {
    if !finished.status.success() {
        return TaskStatus::Crashed {
            message: format!("worker exited with {}", describe_status(&finished.status)),
        };
    }

    let line = finished
        .stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty());

    match line.map(serde_json::from_str::<FileOutcome>) {
        Some(Ok(outcome)) => TaskStatus::Completed(outcome),
        Some(Err(e)) => TaskStatus::Crashed {
            message: format!("unparsable worker output ({e}): {}", tail(&finished.stdout, 200)),
        },
        None => TaskStatus::Crashed {
            message: "worker exited without reporting an outcome".to_string(),
        },
    }
}

fn settle(
    store: &CacheStore,
    report: &mut RunReport,
    path: PathBuf,
    status: TaskStatus,
    elapsed: Duration,
    (total, in_flight, queued): (usize, usize, usize),
) -> Completion {
    match &status {
        TaskStatus::Completed(outcome) => {
            report.stats.absorb(&outcome.stats);
            if outcome.success {
                report.succeeded += 1;
            } else {
                report.failed_files += 1;
            }
        }
        TaskStatus::Crashed { message } => {
            warn!(file = %path.display(), error = %message, "worker crashed");
            report.crashed += 1;
            report.stats.errors_count += 1;
            record_failure(store, &path, "WorkerCrash", message);
        }
        TaskStatus::TimedOut { elapsed } => {
            let message = format!("file task exceeded {:.1}s and was killed", elapsed.as_secs_f64());
            warn!(file = %path.display(), error = %message, "worker timed out");
            report.timed_out += 1;
            report.stats.errors_count += 1;
            record_failure(store, &path, "TaskTimeout", &message);
        }
    }

    Completion {
        path,
        status,
        elapsed,
        completed: report.completed(),
        total,
        in_flight,
        queued,
    }
}

fn record_failure(store: &CacheStore, path: &Path, error_type: &str, message: &str) {
    store.write(
        path,
        CacheEntry::now(CachePayload::Failed(FailedPayload {
            error: message.to_string(),
            error_type: error_type.to_string(),
            error_traceback: message.to_string(),
            file_path: path.to_string_lossy().into_owned(),
        })),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KindFilter, RunConfig};
    use tempfile::TempDir;

    fn config(dir: &Path) -> RunConfig {
        RunConfig {
            output_dir: dir.join("out"),
            cache_dir: dir.join("cache"),
            dpi: 300,
            kinds: KindFilter::All,
            renderer: vec!["unused".into()],
            render_timeout_secs: 30,
            blank_pixel_threshold: 100,
        }
    }

    fn tasks(dir: &Path, names: &[&str]) -> Vec<Task> {
        names
            .iter()
            .map(|n| Task {
                input: dir.join(n),
                config: config(dir),
            })
            .collect()
    }

    #[test]
    fn self_exe_launcher_passes_the_task() {
        let dir = TempDir::new().unwrap();
        let task = tasks(dir.path(), &["a.json"]).remove(0);
        let launcher = SelfExeLauncher::new(
            PathBuf::from("/usr/bin/renderer-batch"),
            Some(PathBuf::from("run.log")),
            false,
        );

        let cmd = launcher.command(&task).unwrap();
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(&args[..4], &["--log-file", "run.log", "worker", "--task"]);
        let decoded: Task = serde_json::from_str(&args[4]).unwrap();
        assert_eq!(decoded, task);
        // logging is set up from the flag alone
        assert!(!args[4].contains("log_file"));
    }

    #[cfg(unix)]
    mod workers {
        use super::*;
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;
        use std::time::Instant;

        /// Runs a script under `sh -c` with the task's input path as `$1`.
        struct ShellLauncher(String);

        impl Launcher for ShellLauncher {
            fn command(&self, task: &Task) -> Result<Command> {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&self.0).arg("sh").arg(&task.input);
                Ok(cmd)
            }
        }

        struct MissingLauncher;

        impl Launcher for MissingLauncher {
            fn command(&self, _task: &Task) -> Result<Command> {
                Ok(Command::new("/nonexistent/worker-binary"))
            }
        }

        const REPORT: &str = r#"printf '{"path":"%s","success":true,"stats":{"formulas_count":1,"texts_count":2,"errors_count":0}}\n' "$1""#;

        fn script(prefix: &str) -> String {
            format!("{prefix}\n{REPORT}")
        }

        fn opts(max_workers: usize, timeout: Duration) -> SchedulerOptions {
            SchedulerOptions {
                max_workers,
                task_timeout: timeout,
                poll_interval: Duration::from_millis(5),
            }
        }

        #[test]
        fn clean_exit_without_outcome_is_a_crash() {
            let finished = Finished {
                status: ExitStatus::from_raw(0),
                stdout: "progress...\nnot json\n".into(),
                stderr: String::new(),
            };
            assert!(matches!(interpret(finished), TaskStatus::Crashed { .. }));

            let silent = Finished {
                status: ExitStatus::from_raw(0),
                stdout: "\n".into(),
                stderr: String::new(),
            };
            assert!(matches!(interpret(silent), TaskStatus::Crashed { .. }));
        }

        #[test]
        fn concurrency_stays_bounded_and_refills() {
            let dir = TempDir::new().unwrap();
            let store = CacheStore::open(&dir.path().join("cache")).unwrap();
            let names: Vec<String> = (0..7).map(|i| format!("doc{i}.json")).collect();
            let names: Vec<&str> = names.iter().map(String::as_str).collect();

            let mut max_seen = 0usize;
            let mut completions = 0usize;
            let report = run(
                &ShellLauncher(script("sleep 0.2")),
                tasks(dir.path(), &names),
                &opts(3, Duration::from_secs(60)),
                &store,
                |ev| match ev {
                    Event::Dispatched { in_flight, .. } => max_seen = max_seen.max(*in_flight),
                    Event::Waiting { in_flight, queued } => {
                        assert!(*in_flight <= 3);
                        // never idle while work is queued
                        assert!(*in_flight == 3 || *queued == 0);
                    }
                    Event::Completed(c) => {
                        completions += 1;
                        assert_eq!(c.completed, completions);
                        assert_eq!(c.total, 7);
                    }
                },
            );

            assert_eq!(max_seen, 3);
            assert_eq!(report.peak_in_flight, 3);
            assert_eq!(report.dispatched, 7);
            assert_eq!(report.succeeded, 7);
            assert_eq!(report.stats.formulas_count, 7);
            assert_eq!(report.stats.texts_count, 14);
            // the fake workers write nothing to the cache
            assert!(store.list().is_empty());
        }

        #[test]
        fn crashes_are_contained() {
            let dir = TempDir::new().unwrap();
            let store = CacheStore::open(&dir.path().join("cache")).unwrap();
            let work = tasks(dir.path(), &["a.json", "bad.json", "garbage.json", "c.json"]);
            let bad = work[1].input.clone();

            let report = run(
                &ShellLauncher(script(
                    "case \"$1\" in *bad*) exit 3;; *garbage*) echo nope; exit 0;; esac",
                )),
                work,
                &opts(2, Duration::from_secs(60)),
                &store,
                |_| {},
            );

            assert_eq!(report.succeeded, 2);
            assert_eq!(report.crashed, 2);
            assert_eq!(report.stats.errors_count, 2);

            let rec = store.read(&bad).unwrap();
            let CachePayload::Failed(failed) = rec.payload else {
                panic!("expected a failure record for the crashed worker");
            };
            assert_eq!(failed.error_type, "WorkerCrash");
            assert!(failed.error.contains("exit code 3"));
            assert_eq!(store.list().len(), 2);
        }

        #[test]
        fn hung_worker_is_killed_and_recorded() {
            let dir = TempDir::new().unwrap();
            let store = CacheStore::open(&dir.path().join("cache")).unwrap();
            let work = tasks(dir.path(), &["slow.json", "fast.json"]);
            let slow = work[0].input.clone();

            let start = Instant::now();
            let report = run(
                &ShellLauncher(script("case \"$1\" in *slow*) exec sleep 30;; esac")),
                work,
                &opts(2, Duration::from_millis(500)),
                &store,
                |_| {},
            );

            assert!(start.elapsed() < Duration::from_secs(10));
            assert_eq!(report.timed_out, 1);
            assert_eq!(report.succeeded, 1);
            let rec = store.read(&slow).unwrap();
            assert!(rec.payload.is_failed());
            assert!(matches!(
                rec.payload,
                CachePayload::Failed(FailedPayload { ref error_type, .. }) if error_type == "TaskTimeout"
            ));
        }

        #[test]
        fn worker_done_before_the_ceiling_but_seen_after_it_succeeds() {
            let dir = TempDir::new().unwrap();
            let store = CacheStore::open(&dir.path().join("cache")).unwrap();
            let opts = SchedulerOptions {
                max_workers: 1,
                task_timeout: Duration::from_millis(200),
                // the second pass lands well past the ceiling
                poll_interval: Duration::from_millis(600),
            };

            let report = run(
                &ShellLauncher(script(":")),
                tasks(dir.path(), &["quick.json"]),
                &opts,
                &store,
                |_| {},
            );

            assert_eq!(report.timed_out, 0);
            assert_eq!(report.succeeded, 1);
            assert!(store.list().is_empty());
        }

        #[test]
        fn unlaunchable_worker_counts_as_crash() {
            let dir = TempDir::new().unwrap();
            let store = CacheStore::open(&dir.path().join("cache")).unwrap();

            let report = run(
                &MissingLauncher,
                tasks(dir.path(), &["a.json", "b.json"]),
                &opts(4, Duration::from_secs(5)),
                &store,
                |_| {},
            );

            assert_eq!(report.dispatched, 2);
            assert_eq!(report.crashed, 2);
            assert_eq!(report.peak_in_flight, 0);
            assert_eq!(store.list().len(), 2);
        }

        #[test]
        fn empty_queue_returns_immediately() {
            let dir = TempDir::new().unwrap();
            let store = CacheStore::open(&dir.path().join("cache")).unwrap();
            let report = run(
                &MissingLauncher,
                Vec::new(),
                &opts(4, Duration::from_secs(5)),
                &store,
                |_| panic!("no events expected"),
            );
            assert_eq!(report, RunReport::default());
        }
    }
}
