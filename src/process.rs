//! Subprocess execution for the backends.

use std::{
    path::PathBuf,
    process::Stdio,
};
use async_trait::async_trait;
use log::debug;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
};

// how much of stderr is kept for error messages
const STDERR_TAIL_BYTES: usize = 4096;
// stdout beyond this is dropped from the front; lines are still streamed
const STDOUT_KEEP_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
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

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    // for log lines
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    // -1 when terminated by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// The last few KB of stderr, for error reports.
    pub fn stderr_tail(&self) -> &str {
        let stderr = self.stderr.trim_end();
        if stderr.len() <= STDERR_TAIL_BYTES {
            return stderr;
        }
        let mut start = stderr.len() - STDERR_TAIL_BYTES;
        while !stderr.is_char_boundary(start) {
            start += 1;
        }
        &stderr[start..]
    }
}

/// Runs external commands on behalf of the backends.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion. When `lines` is given every stdout line is
    /// also sent there as it is produced.
    async fn run(
        &self,
        spec: &CommandSpec,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> std::io::Result<CommandOutput> {
        debug!("Running `{}`", spec.display());
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        let mut child = cmd.spawn()?;

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;
        // drain stderr concurrently so a chatty child never blocks on a full pipe
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut collected = String::new();
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            // launchers may print arbitrary bytes; they must not fail the run
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(tx) = &lines {
                let _ = tx.send(line.to_string());
            }
            collected.push_str(line);
            collected.push('\n');
            keep_tail(&mut collected, STDOUT_KEEP_BYTES);
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            stdout: collected,
            stderr: stderr,
        })
    }
}

// trims `text` to roughly its last `keep` bytes once it grows past twice that
fn keep_tail(text: &mut String, keep: usize) {
    if text.len() <= keep * 2 {
        return;
    }
    let mut start = text.len() - keep;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text.drain(..start);
}
