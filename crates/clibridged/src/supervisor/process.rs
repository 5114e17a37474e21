//! Spawned process handle and output stream.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use clibridge_core::{ExitInfo, LaunchSpec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{SpawnError, WriteError};

/// Size of a single read from stdout/stderr.
const READ_CHUNK: usize = 8 * 1024;

/// Buffered output chunks between the readers and the consumer of
/// [`ProcessOutput`].
const OUTPUT_BUFFER: usize = 256;

/// How long the readers may keep draining after the process exited.
///
/// A grandchild that inherited the pipes can hold them open forever; the
/// readers are abandoned after this long so `Exited` is still reported.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One unit of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// The process ended and both streams are drained. Always last.
    Exited(ExitInfo),
}

// ============================================================================
// Supervisor
// ============================================================================

/// Spawns CLI processes with supervised stdio.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSupervisor {
    drain_timeout: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(drain_timeout: Duration) -> Self {
        Self { drain_timeout }
    }

    /// Spawns a process for `spec`.
    ///
    /// The child runs in its own process group so termination also reaches
    /// anything it started.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the OS refuses to start the process. No
    /// tasks are left running in that case.
    pub fn spawn(&self, spec: &LaunchSpec) -> Result<(ProcessHandle, ProcessOutput), SpawnError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            command.env(key, value);
        }
        for key in &spec.env_remove {
            command.env_remove(key);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| SpawnError::from_io(&spec.program, &e))?;

        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(SpawnError::Resource {
                command: spec.program.clone(),
                reason: "stdio pipes unavailable".to_string(),
            });
        };

        info!(
            pid = ?pid,
            command = %spec.program,
            args = spec.args.len(),
            "Process spawned"
        );

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (terminate_tx, terminate_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(write_stdin(stdin, input_rx, pid));
        let stdout_task = tokio::spawn(read_stream(stdout, output_tx.clone(), OutputChunk::Stdout));
        let stderr_task = tokio::spawn(read_stream(stderr, output_tx.clone(), OutputChunk::Stderr));

        tokio::spawn(reap(Reaper {
            child,
            pid,
            terminate_rx,
            exit_tx,
            output_tx,
            readers: [stdout_task, stderr_task],
            drain_timeout: self.drain_timeout,
        }));

        let handle = ProcessHandle {
            pid,
            command: spec.program.clone(),
            input: input_tx,
            terminate: terminate_tx,
            exit: exit_rx,
        };

        Ok((handle, ProcessOutput { receiver: output_rx }))
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Exclusive handle to a running process.
///
/// Not `Clone`: exactly one session owns it. Dropping the handle closes
/// stdin and kills the process if it is still running.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    command: String,
    input: mpsc::UnboundedSender<Vec<u8>>,
    terminate: mpsc::UnboundedSender<Duration>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    /// OS process id (None only if the OS reported none at spawn).
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Queues bytes for the process stdin.
    ///
    /// Writes are delivered in call order by a dedicated task, so this never
    /// blocks on a slow reader on the other end of the pipe.
    ///
    /// # Errors
    ///
    /// `WriteError::ProcessExited` once the process has exited or its stdin
    /// writer has stopped.
    pub fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        if self.has_exited() {
            return Err(WriteError::ProcessExited);
        }
        self.input
            .send(bytes.to_vec())
            .map_err(|_| WriteError::ProcessExited)
    }

    /// Requests termination without waiting: SIGTERM, then SIGKILL once
    /// `grace` has elapsed. Repeated requests are harmless.
    pub fn signal_terminate(&self, grace: Duration) {
        if self.terminate.send(grace).is_err() {
            debug!(pid = ?self.pid, "Terminate requested for already reaped process");
        }
    }

    /// Terminates the process and waits for it to be reaped.
    pub async fn terminate(&self, grace: Duration) -> ExitInfo {
        self.signal_terminate(grace);
        self.wait().await
    }

    /// Waits until the process has exited and its output is drained.
    pub async fn wait(&self) -> ExitInfo {
        let mut exit = self.exit.clone();
        loop {
            if let Some(info) = *exit.borrow_and_update() {
                return info;
            }
            if exit.changed().await.is_err() {
                return exit.borrow().unwrap_or_default();
            }
        }
    }

    /// Exit status, once known.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }
}

/// Receiving end of a process's output.
#[derive(Debug)]
pub struct ProcessOutput {
    receiver: mpsc::Receiver<OutputChunk>,
}

impl ProcessOutput {
    /// Returns the next chunk; `None` after `Exited` has been delivered.
    pub async fn poll(&mut self) -> Option<OutputChunk> {
        self.receiver.recv().await
    }
}

// ============================================================================
// Tasks
// ============================================================================

async fn write_stdin(
    mut stdin: ChildStdin,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
    pid: Option<u32>,
) {
    while let Some(bytes) = input.recv().await {
        let result = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = result {
            debug!(pid = ?pid, error = %e, "Stdin write failed, closing writer");
            break;
        }
    }
    // Dropping stdin delivers EOF to the child.
}

async fn read_stream<R, F>(mut stream: R, output: mpsc::Sender<OutputChunk>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(Vec<u8>) -> OutputChunk,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = buf.get(..n).map(<[u8]>::to_vec).unwrap_or_default();
                if output.send(wrap(chunk)).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Output read failed");
                break;
            }
        }
    }
}

struct Reaper {
    child: Child,
    pid: Option<u32>,
    terminate_rx: mpsc::UnboundedReceiver<Duration>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    output_tx: mpsc::Sender<OutputChunk>,
    readers: [JoinHandle<()>; 2],
    drain_timeout: Duration,
}

async fn reap(mut reaper: Reaper) {
    let status = tokio::select! {
        status = reaper.child.wait() => status,
        request = reaper.terminate_rx.recv() => {
            // A closed channel means the handle was dropped: no grace.
            let grace = request.unwrap_or(Duration::ZERO);
            terminate_child(&mut reaper.child, reaper.pid, grace).await
        }
    };

    let exit = exit_info(status);

    let [mut stdout_task, mut stderr_task] = reaper.readers;
    let drained = timeout(reaper.drain_timeout, async {
        let _ = (&mut stdout_task).await;
        let _ = (&mut stderr_task).await;
    })
    .await;
    if drained.is_err() {
        warn!(pid = ?reaper.pid, "Output still open after exit, abandoning readers");
        stdout_task.abort();
        stderr_task.abort();
    }

    info!(pid = ?reaper.pid, exit = %exit, "Process reaped");

    reaper.exit_tx.send_replace(Some(exit));
    let _ = reaper.output_tx.send(OutputChunk::Exited(exit)).await;
}

async fn terminate_child(child: &mut Child, pid: Option<u32>, grace: Duration) -> io::Result<ExitStatus> {
    if !grace.is_zero() {
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGTERM);
        }
        match timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => {
                warn!(pid = ?pid, grace_ms = grace.as_millis() as u64, "Grace period elapsed, killing process");
            }
        }
    }

    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
    if let Err(e) = child.kill().await {
        debug!(pid = ?pid, error = %e, "Kill failed");
    }
    child.wait().await
}

/// Sends `signal` to the process group led by `pid`.
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a stale group id
    // yields ESRCH, which is ignored.
    let result = unsafe { libc::kill(-pgid, signal) };
    if result != 0 {
        debug!(pid = pid, signal = signal, "Signal delivery failed (process likely gone)");
    }
}

fn exit_info(status: io::Result<ExitStatus>) -> ExitInfo {
    match status {
        Ok(status) => {
            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(&status);
            #[cfg(not(unix))]
            let signal = None;
            ExitInfo {
                code: status.code(),
                signal,
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to collect exit status");
            ExitInfo::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("sh", ["-c", script])
    }

    async fn collect(mut output: ProcessOutput) -> (Vec<u8>, Vec<u8>, Option<ExitInfo>) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut exit = None;
        while let Some(chunk) = timeout(Duration::from_secs(10), output.poll()).await.unwrap() {
            match chunk {
                OutputChunk::Stdout(b) => out.extend(b),
                OutputChunk::Stderr(b) => err.extend(b),
                OutputChunk::Exited(info) => {
                    assert!(exit.is_none(), "Exited must be delivered once");
                    exit = Some(info);
                }
            }
        }
        (out, err, exit)
    }

    #[tokio::test]
    async fn test_stdout_stderr_and_exit_code() {
        let supervisor = ProcessSupervisor::default();
        let (handle, output) = supervisor
            .spawn(&sh("printf out; printf err >&2; exit 3"))
            .unwrap();

        let (out, err, exit) = collect(output).await;
        assert_eq!(out, b"out");
        assert_eq!(err, b"err");
        assert_eq!(exit, Some(ExitInfo::from_code(3)));
        assert_eq!(handle.exit_status(), Some(ExitInfo::from_code(3)));
    }

    #[tokio::test]
    async fn test_write_roundtrip_through_cat() {
        let supervisor = ProcessSupervisor::default();
        let (handle, mut output) = supervisor.spawn(&LaunchSpec::new("cat", Vec::<String>::new())).unwrap();
        assert!(handle.pid().is_some());

        handle.write(b"hello\n").unwrap();
        let chunk = timeout(Duration::from_secs(5), output.poll()).await.unwrap();
        assert_eq!(chunk, Some(OutputChunk::Stdout(b"hello\n".to_vec())));

        let exit = handle.terminate(Duration::from_secs(2)).await;
        assert_eq!(exit.signal, Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_write_after_exit_fails() {
        let supervisor = ProcessSupervisor::default();
        let (handle, output) = supervisor.spawn(&sh("exit 0")).unwrap();
        let _ = collect(output).await;

        assert_eq!(handle.write(b"late"), Err(WriteError::ProcessExited));
    }

    #[tokio::test]
    async fn test_missing_command_is_not_found() {
        let supervisor = ProcessSupervisor::default();
        let result = supervisor.spawn(&LaunchSpec::new(
            "/nonexistent/clibridge-test-binary",
            Vec::<String>::new(),
        ));
        assert!(matches!(result, Err(SpawnError::CommandNotFound { .. })));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let supervisor = ProcessSupervisor::default();
        let (handle, output) = supervisor
            .spawn(&sh("trap '' TERM; while true; do sleep 0.1; done"))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let exit = timeout(
            Duration::from_secs(5),
            handle.terminate(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));

        let (_, _, reported) = collect(output).await;
        assert_eq!(reported, Some(exit));
    }

    #[tokio::test]
    async fn test_env_is_applied_and_scrubbed() {
        std::env::set_var("CLIBRIDGE_SUPERVISOR_TEST_SECRET", "leak");
        let mut spec = sh("printf '%s|%s' \"$GREETING\" \"$CLIBRIDGE_SUPERVISOR_TEST_SECRET\"");
        spec.env.push(("GREETING".to_string(), "hi".to_string()));
        spec.env_remove.push("CLIBRIDGE_SUPERVISOR_TEST_SECRET".to_string());

        let (_handle, output) = ProcessSupervisor::default().spawn(&spec).unwrap();
        let (out, _, _) = collect(output).await;
        assert_eq!(out, b"hi|");
    }

    #[tokio::test]
    async fn test_drop_kills_process() {
        let supervisor = ProcessSupervisor::default();
        let (handle, output) = supervisor.spawn(&sh("sleep 30")).unwrap();
        drop(handle);

        let (_, _, exit) = collect(output).await;
        assert_eq!(exit.and_then(|e| e.signal), Some(libc::SIGKILL));
    }
}
