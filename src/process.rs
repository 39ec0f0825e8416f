//! Child processes with captured output and guaranteed cleanup.
//!
//! Every [`Supervised`] child leads its own process group. Killing it takes
//! down anything it started, and output collection is bounded by the same
//! deadline as the child itself: a grandchild that inherits the pipes can't
//! stretch a timeout. A child dropped without having been waited on is
//! killed and reaped.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum Waited {
    Finished(Finished),
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub struct Supervised {
    /// `None` once reaped.
    child: Option<Child>,
    pid: u32,
    exit: Option<ExitStatus>,
    output: Receiver<(Stream, Vec<u8>)>,
    open_pipes: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    started: Instant,
}

impl Supervised {
    /// Spawn with stdin closed and stdout captured. Stderr is captured too when
    /// `capture_stderr` is set, otherwise inherited.
    pub fn spawn(cmd: &mut Command, capture_stderr: bool) -> io::Result<Self> {
        cmd.stdin(Stdio::null()).stdout(Stdio::piped());
        if capture_stderr {
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stderr(Stdio::inherit());
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let (tx, output) = mpsc::channel();
        let mut open_pipes = 0usize;
        // Pipes are drained on their own threads so a chatty child can't block
        // on a full pipe while we poll it.
        if let Some(out) = child.stdout.take() {
            drain(out, Stream::Stdout, tx.clone());
            open_pipes += 1;
        }
        if let Some(err) = child.stderr.take() {
            drain(err, Stream::Stderr, tx);
            open_pipes += 1;
        }

        Ok(Self {
            pid: child.id(),
            child: Some(child),
            exit: None,
            output,
            open_pipes,
            stdout: Vec::new(),
            stderr: Vec::new(),
            started: Instant::now(),
        })
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Non-blocking. `Finished` once the child has exited and its output is
    /// fully collected; `TimedOut` (after killing the group) when that hasn't
    /// happened within `limit` of spawning; `None` otherwise.
    ///
    /// Exit is checked before the deadline, so a child that finished in time
    /// but is polled late still counts as finished.
    pub fn poll(&mut self, limit: Duration) -> io::Result<Option<Waited>> {
        if self.exit.is_none() {
            let Some(child) = self.child.as_mut() else {
                return Err(io::Error::other("child already killed"));
            };
            if let Some(status) = child.try_wait()? {
                self.exit = Some(status);
                self.child = None;
            }
        }

        while self.open_pipes > 0 {
            match self.output.try_recv() {
                Ok(msg) => self.receive(msg),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.open_pipes = 0,
            }
        }

        if let Some(status) = self.exit {
            if self.open_pipes == 0 {
                return Ok(Some(Waited::Finished(Finished {
                    status,
                    stdout: String::from_utf8_lossy(&std::mem::take(&mut self.stdout)).into_owned(),
                    stderr: String::from_utf8_lossy(&std::mem::take(&mut self.stderr)).into_owned(),
                })));
            }
        }

        if self.elapsed() >= limit {
            self.kill();
            return Ok(Some(Waited::TimedOut));
        }
        Ok(None)
    }

    /// Block until [`poll`](Self::poll) settles.
    pub fn wait_timeout(mut self, timeout: Duration) -> io::Result<Waited> {
        loop {
            if let Some(done) = self.poll(timeout)? {
                return Ok(done);
            }
            let remaining = timeout.saturating_sub(self.elapsed());
            let nap = POLL_INTERVAL.min(remaining).max(Duration::from_millis(1));
            if self.open_pipes == 0 {
                thread::sleep(nap);
                continue;
            }
            // wakes early when output arrives
            match self.output.recv_timeout(nap) {
                Ok(msg) => self.receive(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.open_pipes = 0,
            }
        }
    }

    /// Kill the whole process group and reap the child. Best effort.
    pub fn kill(&mut self) {
        let leftovers = self.child.is_some() || self.open_pipes > 0;
        #[cfg(unix)]
        if leftovers {
            // SAFETY: plain syscall; the group id is our child's pid.
            unsafe {
                libc::killpg(self.pid as libc::pid_t, libc::SIGKILL);
            }
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if leftovers {
            // readers finish on their own once the group is gone
            self.open_pipes = 0;
        }
    }

    fn receive(&mut self, (stream, bytes): (Stream, Vec<u8>)) {
        match stream {
            Stream::Stdout => self.stdout = bytes,
            Stream::Stderr => self.stderr = bytes,
        }
        self.open_pipes = self.open_pipes.saturating_sub(1);
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        self.kill();
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R, stream: Stream, tx: Sender<(Stream, Vec<u8>)>) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send((stream, buf));
    });
}

pub fn describe_status(status: &ExitStatus) -> String {
    #[cfg(unix)]
    let signal = status.signal();
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    match (status.code(), signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(sig)) => format!("signal {sig}"),
        (None, None) => "unknown status".to_string(),
    }
}

/// Last `max_chars` characters of `s`, trimmed.
pub fn tail(s: &str, max_chars: usize) -> String {
    let s = s.trim();
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}
