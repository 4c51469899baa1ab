//! Process-backed coding agent.
//!
//! Spawns a configured external command, feeds the rendered session
//! context through stdin, and scans stdout for the final JSON report
//! line. The process is opaque: it is never signalled mid-run, and its
//! stdout may contain arbitrary logging around the report.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{AgentReport, CodingAgent, SessionContext};
use crate::errors::AgentError;

pub struct ProcessAgent {
    command: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
}

impl ProcessAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            workdir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

#[async_trait]
impl CodingAgent for ProcessAgent {
    async fn run(&self, ctx: &SessionContext) -> Result<AgentReport, AgentError> {
        let prompt = ctx.render_prompt();
        let start = Instant::now();

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(AgentError::Spawn)?;
        tracing::debug!(
            session = %ctx.session_id,
            command = %self.command,
            pid = child.id().unwrap_or(0),
            "agent invocation started"
        );

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(AgentError::Io)?;
            stdin.shutdown().await.map_err(AgentError::Io)?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Io(std::io::Error::other("agent stdout not captured")))?;
        let mut reader = BufReader::new(stdout).lines();

        // The report is the last JSON object line on stdout; everything
        // else is agent chatter.
        let mut report: Option<AgentReport> = None;
        let mut last_parse_error: Option<serde_json::Error> = None;
        while let Some(line) = reader.next_line().await.map_err(AgentError::Io)? {
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                continue;
            }
            match serde_json::from_str::<AgentReport>(trimmed) {
                Ok(parsed) => {
                    report = Some(parsed);
                    last_parse_error = None;
                }
                Err(source) => last_parse_error = Some(source),
            }
        }

        let status = child.wait().await.map_err(AgentError::Io)?;
        tracing::debug!(
            session = %ctx.session_id,
            elapsed_secs = start.elapsed().as_secs_f64(),
            exit = status.code().unwrap_or(-1),
            "agent invocation finished"
        );

        if !status.success() {
            return Err(AgentError::NonZeroExit {
                code: status.code().unwrap_or(-1),
            });
        }

        match (report, last_parse_error) {
            (Some(report), _) => Ok(report),
            (None, Some(source)) => Err(AgentError::MalformedReport { source }),
            (None, None) => Err(AgentError::MissingReport),
        }
    }
}
