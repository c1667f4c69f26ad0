//! Persistent `rrdtool -` process
//!
//! ```text
//! NotStarted --run--> Running --stop--> Stopped
//!     ^                  |
//!     +---cancelled run--+
//! ```
//!
//! Every command is one line on stdin. Output is read until rrdtool prints
//! an `OK u:... s:... r:...` or an `ERROR: ...` line. Methods take
//! `&mut self`; sharing a process between tasks needs a mutex.
//!
//! The pipes are held outside `self` while a command is in flight. A `run`
//! future dropped before the sentinel drops the child with them, and the
//! next command starts a fresh process instead of reading stale output.

use super::error::RrdError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

const OK_SENTINEL: &str = "OK u:";
const ERROR_PREFIX: &str = "ERROR: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopped,
}

struct Pipes {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub struct RrdProcess {
    binary: String,
    state: ProcessState,
    pipes: Option<Pipes>,
}

impl RrdProcess {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            state: ProcessState::NotStarted,
            pipes: None,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    async fn start(&mut self) -> Result<(), RrdError> {
        let mut child = Command::new(&self.binary)
            .arg("-")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RrdError::ProcessState("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RrdError::ProcessState("stdout not captured".to_string()))?;

        self.pipes = Some(Pipes {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        });
        self.state = ProcessState::Running;
        tracing::debug!(driver = "rrdtool", binary = %self.binary, "Started persistent rrdtool");
        Ok(())
    }

    /// Spawn the process if it is not running yet
    pub async fn ensure_started(&mut self) -> Result<(), RrdError> {
        match self.state {
            ProcessState::Stopped => {
                Err(RrdError::ProcessState("process has been stopped".to_string()))
            }
            ProcessState::NotStarted => self.start().await,
            ProcessState::Running => Ok(()),
        }
    }

    /// Run one command line and return its output, sentinel excluded.
    /// Starts the process on first use.
    pub async fn run(&mut self, line: &str) -> Result<String, RrdError> {
        self.ensure_started().await?;

        let mut pipes = self
            .pipes
            .take()
            .ok_or_else(|| RrdError::ProcessState("process is not running".to_string()))?;
        self.state = ProcessState::NotStarted;

        match exchange(&mut pipes, line).await {
            Ok(Reply::Output(output)) => {
                self.restore(pipes);
                Ok(output)
            }
            Ok(Reply::Error(message)) => {
                self.restore(pipes);
                Err(RrdError::from_message(&message))
            }
            Ok(Reply::Exited) => {
                self.state = ProcessState::Stopped;
                Err(RrdError::ProcessState("rrdtool exited unexpectedly".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn restore(&mut self, pipes: Pipes) {
        self.pipes = Some(pipes);
        self.state = ProcessState::Running;
    }

    /// Send `quit` and wait for exit
    pub async fn stop(&mut self) -> Result<(), RrdError> {
        if let Some(mut pipes) = self.pipes.take() {
            pipes.stdin.write_all(b"quit\n").await?;
            pipes.stdin.flush().await?;
            drop(pipes.stdin);
            pipes.child.wait().await?;
            tracing::debug!(driver = "rrdtool", "Stopped persistent rrdtool");
        }
        self.state = ProcessState::Stopped;
        Ok(())
    }
}

enum Reply {
    Output(String),
    Error(String),
    Exited,
}

/// Write one command and read up to its sentinel
async fn exchange(pipes: &mut Pipes, line: &str) -> Result<Reply, RrdError> {
    pipes.stdin.write_all(line.as_bytes()).await?;
    pipes.stdin.write_all(b"\n").await?;
    pipes.stdin.flush().await?;

    let mut output = String::new();
    loop {
        let mut buf = String::new();
        if pipes.stdout.read_line(&mut buf).await? == 0 {
            return Ok(Reply::Exited);
        }
        if buf.starts_with(OK_SENTINEL) {
            return Ok(Reply::Output(output));
        }
        if buf.starts_with(ERROR_PREFIX) {
            return Ok(Reply::Error(buf));
        }
        output.push_str(&buf);
    }
}
