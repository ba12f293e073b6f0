//! Launcher abstraction for worker processes.
//!
//! [`WorkerLauncher`] is the seam between the supervisors and the operating
//! system. The production implementation is [`ProcessLauncher`], which spawns
//! the worker with `tokio::process` and controls it through POSIX signals.
//! [`MockLauncher`] swaps the process for in-memory pipes so supervisor
//! behaviour can be driven step by step from tests.
//!
//! A launch yields a [`WorkerIo`]: raw stdin/stdout/stderr streams plus a
//! [`WorkerControl`] that can signal and reap the worker. The supervisors own
//! the reader tasks; the launcher only creates the I/O.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};

/// Capacity of each in-memory pipe created by [`MockLauncher`].
const MOCK_PIPE_CAPACITY: usize = 64 * 1024;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A fully built command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// The last argument, if any.
    pub fn trailing_arg(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Signals a supervisor can deliver to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the worker to exit (SIGTERM)
    Terminate,
    /// Forcefully end the worker (SIGKILL)
    Kill,
    /// Suspend without terminating (SIGSTOP)
    Suspend,
    /// Resume a suspended worker (SIGCONT)
    Continue,
}

/// How a worker terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExitInfo {
    /// Exit code, if the worker exited normally
    pub code: Option<i32>,
    /// Terminating signal number, if the worker was killed by a signal
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Signal and reap access to a launched worker.
///
/// `wait` must be cancel safe: callers race it against incoming signal
/// requests in a `select!` loop and re-create the future on every iteration.
#[async_trait]
pub trait WorkerControl: Send {
    /// Deliver a signal. Fails with [`io::ErrorKind::Unsupported`] when the
    /// platform has no equivalent.
    fn signal(&mut self, signal: ProcessSignal) -> io::Result<()>;

    /// Wait for the worker to terminate.
    async fn wait(&mut self) -> io::Result<ExitInfo>;
}

/// Raw I/O handles produced by a successful [`WorkerLauncher::launch`].
pub struct WorkerIo {
    /// OS process id, when there is a real process
    pub pid: Option<u32>,
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub control: Box<dyn WorkerControl>,
    /// When true, suspend/resume have no OS signal and must be requested
    /// through the worker's stdin instead.
    pub cooperative_pause: bool,
}

impl fmt::Debug for WorkerIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerIo")
            .field("pid", &self.pid)
            .field("stdin", &"<AsyncWrite>")
            .field("stdout", &"<AsyncRead>")
            .field("stderr", &self.stderr.as_ref().map(|_| "<AsyncRead>"))
            .field("control", &"<WorkerControl>")
            .field("cooperative_pause", &self.cooperative_pause)
            .finish()
    }
}

/// Starts worker processes.
///
/// Object safe so supervisors can hold an `Arc<dyn WorkerLauncher>`.
pub trait WorkerLauncher: Send + Sync + fmt::Debug {
    /// Spawn the worker. Returning `Ok` is the spawn acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the process cannot be started.
    fn launch(&self, invocation: &Invocation) -> io::Result<WorkerIo>;
}

// ── Real processes ───────────────────────────────────────────────────────────

/// Launcher that spawns real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, invocation: &Invocation) -> io::Result<WorkerIo> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = invocation.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout was not piped"))?;
        let stderr = child.stderr.take();

        tracing::debug!(pid, command = %invocation, "spawned worker process");

        Ok(WorkerIo {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            control: Box::new(ChildControl { child, pid }),
            cooperative_pause: !cfg!(unix),
        })
    }
}

struct ChildControl {
    child: Child,
    pid: Option<u32>,
}

impl ChildControl {
    #[cfg(unix)]
    fn send_posix(&self, sig: libc::c_int) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "worker has already been reaped",
            ));
        };
        // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
        // to a child we have not reaped yet, so it cannot have been reused.
        let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[async_trait]
impl WorkerControl for ChildControl {
    fn signal(&mut self, signal: ProcessSignal) -> io::Result<()> {
        match signal {
            ProcessSignal::Kill => self.child.start_kill(),
            #[cfg(unix)]
            ProcessSignal::Terminate => self.send_posix(libc::SIGTERM),
            #[cfg(unix)]
            ProcessSignal::Suspend => self.send_posix(libc::SIGSTOP),
            #[cfg(unix)]
            ProcessSignal::Continue => self.send_posix(libc::SIGCONT),
            #[cfg(not(unix))]
            ProcessSignal::Terminate => self.child.start_kill(),
            #[cfg(not(unix))]
            ProcessSignal::Suspend | ProcessSignal::Continue => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "suspend/resume signals are not available on this platform",
            )),
        }
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        let status = self.child.wait().await?;
        self.pid = None;
        Ok(status.into())
    }
}

// ── In-memory workers ────────────────────────────────────────────────────────

/// Launcher backed by in-memory pipes.
///
/// Every successful launch produces a [`MockWorker`] that the test retrieves
/// with [`MockLauncher::next_worker`] to write output, read input, inspect
/// delivered signals, and end the "process".
#[derive(Debug, Clone)]
pub struct MockLauncher {
    launches: Arc<std::sync::Mutex<Vec<Invocation>>>,
    fail_with: Arc<std::sync::Mutex<Option<io::ErrorKind>>>,
    worker_tx: mpsc::UnboundedSender<MockWorker>,
    worker_rx: Arc<Mutex<mpsc::UnboundedReceiver<MockWorker>>>,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    pub fn new() -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        Self {
            launches: Arc::new(std::sync::Mutex::new(Vec::new())),
            fail_with: Arc::new(std::sync::Mutex::new(None)),
            worker_tx,
            worker_rx: Arc::new(Mutex::new(worker_rx)),
        }
    }

    /// Make every subsequent launch fail with `kind` (until cleared with `None`).
    pub fn fail_launches(&self, kind: Option<io::ErrorKind>) {
        if let Ok(mut guard) = self.fail_with.lock() {
            *guard = kind;
        }
    }

    /// Every invocation seen so far, including failed ones.
    pub fn launches(&self) -> Vec<Invocation> {
        self.launches
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Wait for the next launched worker.
    pub async fn next_worker(&self) -> Option<MockWorker> {
        self.worker_rx.lock().await.recv().await
    }
}

impl WorkerLauncher for MockLauncher {
    fn launch(&self, invocation: &Invocation) -> io::Result<WorkerIo> {
        if let Ok(mut guard) = self.launches.lock() {
            guard.push(invocation.clone());
        }
        let failure = self.fail_with.lock().ok().and_then(|guard| *guard);
        if let Some(kind) = failure {
            return Err(io::Error::new(kind, "mock launch failure"));
        }

        let (stdin_sup, stdin_worker) = tokio::io::duplex(MOCK_PIPE_CAPACITY);
        let (stdout_worker, stdout_sup) = tokio::io::duplex(MOCK_PIPE_CAPACITY);
        let (stderr_worker, stderr_sup) = tokio::io::duplex(MOCK_PIPE_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let worker = MockWorker {
            invocation: invocation.clone(),
            stdin: BufReader::new(stdin_worker),
            stdout: stdout_worker,
            stderr: stderr_worker,
            signals: signal_rx,
            exit_tx: exit_tx.clone(),
        };
        let _ = self.worker_tx.send(worker);

        Ok(WorkerIo {
            pid: None,
            stdin: Box::new(stdin_sup),
            stdout: Box::new(stdout_sup),
            stderr: Some(Box::new(stderr_sup)),
            control: Box::new(MockControl {
                signal_tx,
                exit_tx,
                exit_rx,
            }),
            cooperative_pause: false,
        })
    }
}

struct MockControl {
    signal_tx: mpsc::UnboundedSender<ProcessSignal>,
    exit_tx: mpsc::UnboundedSender<ExitInfo>,
    exit_rx: mpsc::UnboundedReceiver<ExitInfo>,
}

/// Signal number reported for a killed mock worker.
const MOCK_SIGKILL: i32 = 9;

#[async_trait]
impl WorkerControl for MockControl {
    fn signal(&mut self, signal: ProcessSignal) -> io::Result<()> {
        let _ = self.signal_tx.send(signal);
        if signal == ProcessSignal::Kill {
            let _ = self.exit_tx.send(ExitInfo::signaled(MOCK_SIGKILL));
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        self.exit_rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "mock worker vanished"))
    }
}

/// Test-side handle of a worker launched by [`MockLauncher`].
///
/// The mock ignores `Terminate`; only [`MockWorker::exit`] or a `Kill` signal
/// end it.
pub struct MockWorker {
    pub invocation: Invocation,
    stdin: BufReader<DuplexStream>,
    stdout: DuplexStream,
    stderr: DuplexStream,
    signals: mpsc::UnboundedReceiver<ProcessSignal>,
    exit_tx: mpsc::UnboundedSender<ExitInfo>,
}

impl fmt::Debug for MockWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockWorker")
            .field("invocation", &self.invocation)
            .finish_non_exhaustive()
    }
}

impl MockWorker {
    /// Write raw bytes to the worker's stdout.
    pub async fn write_stdout(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stdout.write_all(bytes).await?;
        self.stdout.flush().await
    }

    /// Write raw bytes to the worker's stderr.
    pub async fn write_stderr(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stderr.write_all(bytes).await?;
        self.stderr.flush().await
    }

    /// Read the next line the supervisor wrote to stdin, without the newline.
    pub async fn read_stdin_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.stdin.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Wait for the next delivered signal.
    pub async fn next_signal(&mut self) -> Option<ProcessSignal> {
        self.signals.recv().await
    }

    /// Signals delivered so far that have not been observed yet.
    pub fn pending_signals(&mut self) -> Vec<ProcessSignal> {
        let mut out = Vec::new();
        while let Ok(sig) = self.signals.try_recv() {
            out.push(sig);
        }
        out
    }

    /// Terminate the worker with `info`, closing its output streams.
    pub fn exit(self, info: ExitInfo) {
        let _ = self.exit_tx.send(info);
    }
}
