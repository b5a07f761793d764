//! Supervised external processes
//!
//! Capture, encoder, mic playback and recorder are all external programs.
//! Each one runs as a [`SupervisedProcess`]: spawned from a [`ProcessSpec`],
//! with its stderr drained by a background task, a liveness query, and a
//! stop sequence of graceful request, bounded wait, then kill.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ProcessError;

/// What happens to the child's stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrMode {
    /// Sent to /dev/null
    Discard,
    /// Every line logged at debug
    Debug,
    /// Progress lines dropped, everything else logged as a warning
    Diagnostics,
}

/// How a process is asked to stop before it is killed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMethod {
    Kill,
    /// Close stdin so the process sees end of input
    CloseStdin,
    /// Send `q` on stdin (ffmpeg's interactive quit), then close it
    Quit,
}

/// Everything needed to launch one external program
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Name used in logs and errors
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: StderrMode,
    pub stop: StopMethod,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: false,
            stdout: false,
            stderr: StderrMode::Debug,
            stop: StopMethod::Kill,
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

    pub fn envs(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn piped_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    pub fn piped_stdout(mut self) -> Self {
        self.stdout = true;
        self
    }

    pub fn stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }

    pub fn stop_with(mut self, stop: StopMethod) -> Self {
        self.stop = stop;
        self
    }

    /// Program and arguments joined for logging
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn piped_or_null(piped: bool) -> Stdio {
    if piped {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// A running external process owned by the component that spawned it.
///
/// The child is killed if this handle is dropped without [`terminate`].
///
/// [`terminate`]: SupervisedProcess::terminate
pub struct SupervisedProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stop: StopMethod,
    stderr_task: Option<JoinHandle<()>>,
}

impl SupervisedProcess {
    /// Launch the process described by `spec`
    pub fn spawn(spec: ProcessSpec) -> Result<Self, ProcessError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(piped_or_null(spec.stdin))
            .stdout(piped_or_null(spec.stdout))
            .stderr(piped_or_null(spec.stderr != StderrMode::Discard))
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ProcessError::SpawnFailure {
            name: spec.name.clone(),
            source,
        })?;

        let pid = child.id();
        info!(process = %spec.name, pid = ?pid, command = %spec.command_line(), "Spawned process");

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| drain_stderr(spec.name.clone(), stderr, spec.stderr));

        Ok(Self {
            name: spec.name,
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            pid,
            stop: spec.stop,
            stderr_task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take ownership of the write end of stdin
    pub fn take_stdin(&mut self) -> Result<ChildStdin, ProcessError> {
        self.stdin.take().ok_or_else(|| ProcessError::MissingPipe {
            name: self.name.clone(),
            pipe: "stdin",
        })
    }

    /// Take ownership of the read end of stdout
    pub fn take_stdout(&mut self) -> Result<ChildStdout, ProcessError> {
        self.stdout.take().ok_or_else(|| ProcessError::MissingPipe {
            name: self.name.clone(),
            pipe: "stdout",
        })
    }

    /// Whether the process has not exited yet
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        self.child.wait().await.map_err(|source| ProcessError::Io {
            name: self.name.clone(),
            source,
        })
    }

    /// Stop the process: graceful request, wait up to `timeout`, then kill.
    pub async fn terminate(&mut self, timeout: Duration) -> Result<ExitStatus, ProcessError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            self.stdin = None;
            return Ok(status);
        }

        match self.stop {
            StopMethod::Kill => {
                let _ = self.child.start_kill();
            }
            StopMethod::CloseStdin => {
                self.stdin = None;
            }
            StopMethod::Quit => {
                if let Some(mut stdin) = self.stdin.take() {
                    // A closed pipe means the process is already on its way out
                    let _ = stdin.write_all(b"q\n").await;
                    let _ = stdin.flush().await;
                }
            }
        }

        let status = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(result) => result.map_err(|source| ProcessError::Io {
                name: self.name.clone(),
                source,
            })?,
            Err(_) => {
                warn!(process = %self.name, pid = ?self.pid, "Did not exit in {:?}, killing", timeout);
                let _ = self.child.start_kill();
                self.wait().await?
            }
        };

        if let Some(task) = self.stderr_task.take() {
            // stderr hits EOF once the process is gone
            let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
        }

        debug!(process = %self.name, %status, "Process stopped");
        Ok(status)
    }
}

/// `Crash` unless the process exited successfully
pub fn check_exit(name: &str, status: ExitStatus) -> Result<(), ProcessError> {
    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::Crash {
            name: name.to_string(),
            status: status.to_string(),
        })
    }
}

/// Routine ffmpeg progress output
pub fn is_progress_line(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("frame=") || line.starts_with("size=")
}

fn drain_stderr(name: String, stderr: ChildStderr, mode: StderrMode) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    // ffmpeg rewrites progress in place with carriage returns
                    for part in line.split('\r').map(str::trim_end).filter(|p| !p.is_empty()) {
                        match mode {
                            StderrMode::Diagnostics if is_progress_line(part) => {}
                            StderrMode::Diagnostics => warn!(process = %name, "{}", part),
                            _ => debug!(process = %name, "{}", part),
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(process = %name, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_pipes_round_trip() {
        let spec = ProcessSpec::new("echo", "cat").piped_stdin().piped_stdout();
        let mut process = SupervisedProcess::spawn(spec).unwrap();
        assert!(process.pid().is_some());

        let mut stdin = process.take_stdin().unwrap();
        let mut stdout = process.take_stdout().unwrap();
        stdin.write_all(b"hello").await.unwrap();
        drop(stdin);

        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");

        let status = process.wait().await.unwrap();
        assert!(check_exit("echo", status).is_ok());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let spec = ProcessSpec::new("ghost", "/nonexistent/program-that-is-not-there");
        match SupervisedProcess::spawn(spec) {
            Err(ProcessError::SpawnFailure { name, .. }) => assert_eq!(name, "ghost"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[tokio::test]
    async fn test_missing_pipe() {
        let mut process = SupervisedProcess::spawn(ProcessSpec::new("sleeper", "sleep").arg("5")).unwrap();
        assert!(matches!(
            process.take_stdout(),
            Err(ProcessError::MissingPipe { pipe: "stdout", .. })
        ));
        process.terminate(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_stdin_stops_cat() {
        let spec = ProcessSpec::new("cat", "cat")
            .piped_stdin()
            .stop_with(StopMethod::CloseStdin);
        let mut process = SupervisedProcess::spawn(spec).unwrap();
        assert!(process.is_alive());

        let status = process.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_quit_is_written_to_stdin() {
        let spec = ProcessSpec::new("quitter", "sh")
            .args(["-c", "read cmd; [ \"$cmd\" = q ]"])
            .piped_stdin()
            .stop_with(StopMethod::Quit);
        let mut process = SupervisedProcess::spawn(spec).unwrap();

        let status = process.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_kill_after_timeout() {
        // sleep ignores stdin, so the graceful step never works
        let spec = ProcessSpec::new("stubborn", "sleep")
            .arg("30")
            .piped_stdin()
            .stop_with(StopMethod::CloseStdin);
        let mut process = SupervisedProcess::spawn(spec).unwrap();

        let started = std::time::Instant::now();
        let status = process.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_crash_is_reported() {
        let spec = ProcessSpec::new("failing", "sh").args(["-c", "exit 3"]);
        let mut process = SupervisedProcess::spawn(spec).unwrap();
        let status = process.wait().await.unwrap();
        assert!(matches!(
            check_exit("failing", status),
            Err(ProcessError::Crash { .. })
        ));
    }

    #[tokio::test]
    async fn test_env_is_applied() {
        let spec = ProcessSpec::new("env", "sh")
            .args(["-c", "printf %s \"$RELAY_TEST_VAR\""])
            .envs(vec![("RELAY_TEST_VAR".to_string(), "value".to_string())])
            .piped_stdout();
        let mut process = SupervisedProcess::spawn(spec).unwrap();
        let mut out = String::new();
        process.take_stdout().unwrap().read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "value");
    }

    #[test]
    fn test_progress_lines() {
        assert!(is_progress_line("frame=  120 fps= 30 q=23.0 size=    512kB"));
        assert!(is_progress_line("  size=    1024kB time=00:00:04.00"));
        assert!(!is_progress_line("[x11grab @ 0x55] Stream #0: Video"));
    }

    #[test]
    fn test_command_line() {
        let spec = ProcessSpec::new("capture", "pacat").args(["--record", "-d", "sink.monitor"]);
        assert_eq!(spec.command_line(), "pacat --record -d sink.monitor");
    }
}
