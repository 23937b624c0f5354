//! The external encoder process and the seam used to launch it.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bytes of stderr kept for the failure diagnostic.
const STDERR_TAIL: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Tail of the process' stderr.
    pub diagnostics: String,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait EncodeProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Waits for the process to exit. Cancel safe: dropping the future and
    /// calling `wait` again loses nothing.
    async fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Asks the process to stop (SIGTERM). Does not wait.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcibly stops the process and reaps it.
    async fn kill(&mut self) -> io::Result<()>;
}

pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, args: &[String]) -> io::Result<Box<dyn EncodeProcess>>;
}

/// Runs `program` as a child process with stderr captured.
#[derive(Debug, Clone)]
pub struct TokioLauncher {
    program: PathBuf,
}

impl TokioLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ProcessLauncher for TokioLauncher {
    fn spawn(&self, args: &[String]) -> io::Result<Box<dyn EncodeProcess>> {
        debug!("Running: {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let tail = Arc::new(Mutex::new(StderrTail::new(STDERR_TAIL)));
        let reader = child.stderr.take().map(|stderr| {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "vidq::ffmpeg", "{}", line);
                    if let Ok(mut tail) = tail.lock() {
                        tail.push(&line);
                    }
                }
            })
        });

        Ok(Box::new(TokioProcess {
            child,
            reader,
            tail,
        }))
    }
}

struct TokioProcess {
    child: Child,
    reader: Option<JoinHandle<()>>,
    tail: Arc<Mutex<StderrTail>>,
}

#[async_trait]
impl EncodeProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let status = self.child.wait().await?;

        // Drain stderr so the diagnostic is complete.
        if let Some(reader) = self.reader.as_mut() {
            if let Err(err) = reader.await {
                warn!(message = "stderr reader failed", error = ?err);
            }
            self.reader = None;
        }

        let diagnostics = self
            .tail
            .lock()
            .map(|tail| tail.as_str().to_string())
            .unwrap_or_default();

        Ok(ProcessExit {
            code: status.code(),
            diagnostics,
        })
    }

    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Keeps the last `limit` bytes of line-oriented output.
#[derive(Debug)]
struct StderrTail {
    buf: String,
    limit: usize,
}

impl StderrTail {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
        }
    }

    fn push(&mut self, line: &str) {
        if !self.buf.is_empty() {
            self.buf.push('\n');
        }
        self.buf.push_str(line);

        if self.buf.len() > self.limit {
            let mut cut = self.buf.len() - self.limit;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    fn as_str(&self) -> &str {
        &self.buf
    }
}
