//! Native Snapshot Engine
//!
//! Builds engine command lines and runs them through a `ProcessRunner`,
//! so tests can stand in for the real binary.

use std::fmt;
use std::process::Stdio;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// `fromSnapshot` value requesting a full send
pub const START: &str = "START";

/// An engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Engine subcommand (`send`, `recv`, `snapshot`)
    pub fn verb(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// A started process. Pipes are taken by whoever drives it.
pub struct RunningProcess {
    pub stdin: Option<ProcessInput>,
    pub stdout: Option<ProcessOutput>,
    pub stderr: Option<ProcessOutput>,
    exit: BoxFuture<'static, Result<ProcessExit>>,
}

impl RunningProcess {
    pub fn new(
        stdin: Option<ProcessInput>,
        stdout: Option<ProcessOutput>,
        stderr: Option<ProcessOutput>,
        exit: BoxFuture<'static, Result<ProcessExit>>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            exit,
        }
    }

    /// Wait for the process to exit
    pub async fn wait(self) -> Result<ProcessExit> {
        self.exit.await
    }
}

/// Starts engine processes
pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, command: &EngineCommand) -> Result<RunningProcess>;
}

/// Runs commands as real child processes
#[derive(Debug, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn spawn(&self, command: &EngineCommand) -> Result<RunningProcess> {
        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Started {}", command);

        let stdin = child.stdin.take().map(|s| Box::new(s) as ProcessInput);
        let stdout = child.stdout.take().map(|s| Box::new(s) as ProcessOutput);
        let stderr = child.stderr.take().map(|s| Box::new(s) as ProcessOutput);
        let exit = async move {
            let status = child.wait().await?;
            Ok::<_, Error>(ProcessExit { code: status.code() })
        }
        .boxed();

        Ok(RunningProcess::new(stdin, stdout, stderr, exit))
    }
}

/// The base of a send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendBase {
    /// Full replication stream
    Start,
    /// `<fs>@<snap>`, used as given below the pool prefix
    Qualified(String),
    /// Snapshot of the volume being sent
    Relative(String),
}

impl SendBase {
    pub fn parse(from: &str) -> Self {
        if from == START {
            SendBase::Start
        } else if from.contains('@') {
            SendBase::Qualified(from.to_string())
        } else {
            SendBase::Relative(from.to_string())
        }
    }
}

/// Command builder for the engine's dataset layout
#[derive(Debug, Clone)]
pub struct SnapshotEngine {
    binary: String,
    pool: String,
    prefix: String,
}

impl SnapshotEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            pool: config.pool.clone(),
            prefix: config.prefix.clone(),
        }
    }

    /// Dataset path below the pool for `name` (a volume or `fs@snap`)
    pub fn dataset(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            format!("{}/{}", self.pool, name)
        } else {
            format!("{}/{}/{}", self.pool, self.prefix, name)
        }
    }

    pub fn send_command(&self, filesystem: &str, from: &str, to: &str) -> EngineCommand {
        let target = self.dataset(&format!("{}@{}", filesystem, to));
        match SendBase::parse(from) {
            SendBase::Start => EngineCommand::new(&self.binary, &["send", "-p", "-R", &target]),
            SendBase::Qualified(reference) => {
                let base = self.dataset(&reference);
                EngineCommand::new(&self.binary, &["send", "-p", "-I", &base, &target])
            }
            SendBase::Relative(snapshot) => {
                let base = self.dataset(&format!("{}@{}", filesystem, snapshot));
                EngineCommand::new(&self.binary, &["send", "-p", "-I", &base, &target])
            }
        }
    }

    pub fn receive_command(&self, filesystem: &str) -> EngineCommand {
        EngineCommand::new(&self.binary, &["recv", &self.dataset(filesystem)])
    }

    pub fn snapshot_command(&self, filesystem: &str, snapshot: &str) -> EngineCommand {
        let name = self.dataset(&format!("{}@{}", filesystem, snapshot));
        EngineCommand::new(&self.binary, &["snapshot", &name])
    }

    /// Take a snapshot and wait for the engine to finish
    pub async fn snapshot(&self, runner: &dyn ProcessRunner, filesystem: &str, snapshot: &str) -> Result<()> {
        let command = self.snapshot_command(filesystem, snapshot);
        let mut process = runner.spawn(&command)?;
        drop(process.stdin.take());

        let stderr = match process.stderr.take() {
            Some(stderr) => read_all(stderr).await,
            None => Ok(String::new()),
        };
        let exit = process.wait().await?;
        if !exit.success() {
            return Err(Error::SubprocessFailed {
                command: command.to_string(),
                code: exit.code,
                stderr: stderr.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Read a process pipe to the end as lossy UTF-8
pub async fn read_all(mut pipe: ProcessOutput) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    pipe.read_to_end(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
