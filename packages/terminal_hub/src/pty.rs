use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{ErrorKind, Read, Write};
use tracing::{debug, error, info};

use crate::error::TerminalError;

/// Default PTY height in rows
pub const DEFAULT_ROWS: u16 = 24;
/// Default PTY width in columns
pub const DEFAULT_COLS: u16 = 80;

/// Command to run attached to a new pseudo-terminal.
///
/// The terminal does not decide what runs; callers build this and hand it over.
#[derive(Clone, Debug)]
pub struct PtyCommand {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyCommand {
    fn default() -> Self {
        Self {
            command: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

impl PtyCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
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

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.command);
        for arg in &self.args {
            cmd.arg(arg);
        }
        if let Some(dir) = &self.working_dir {
            cmd.cwd(dir);
        }

        // Set environment for proper terminal behavior
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// How a process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, when the platform reports one
    pub code: Option<i32>,
    pub success: bool,
}

impl From<portable_pty::ExitStatus> for ExitOutcome {
    fn from(status: portable_pty::ExitStatus) -> Self {
        Self {
            code: Some(status.exit_code() as i32),
            success: status.success(),
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// A freshly spawned PTY child with its I/O ends split out.
pub(crate) struct SpawnedPty {
    pub master: Box<dyn MasterPty + Send>,
    pub input: Box<dyn Write + Send>,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

pub(crate) fn spawn_pty(command: &PtyCommand) -> Result<SpawnedPty, TerminalError> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: command.rows,
            cols: command.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| TerminalError::Spawn(format!("failed to open PTY: {e}")))?;

    info!(
        "Spawning PTY command: {} with args: {:?}",
        command.command, command.args
    );

    let child = pair.slave.spawn_command(command.to_builder()).map_err(|e| {
        error!("Failed to spawn command '{}': {}", command.command, e);
        TerminalError::Spawn(e.to_string())
    })?;
    // Our copy of the slave must go, otherwise the reader never sees EOF.
    drop(pair.slave);

    debug!("PTY process started with PID: {:?}", child.process_id());

    let reader = pair.master.try_clone_reader()?;
    let input = pair
        .master
        .take_writer()
        .map_err(|e| TerminalError::Spawn(format!("failed to take PTY writer: {e}")))?;

    Ok(SpawnedPty {
        master: pair.master,
        input,
        reader,
        child,
    })
}

/// Read until EOF or error, handing every chunk to `sink`.
///
/// A PTY master reports EIO once the child side is gone, so any read error
/// is treated as end of stream.
pub(crate) fn pump(mut reader: impl Read, mut sink: impl FnMut(&[u8])) {
    let mut buffer = [0u8; 4096];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => sink(&buffer[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Output stream ended: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_command_is_80_by_24() {
        let cmd = PtyCommand::default();
        assert_eq!(cmd.rows, 24);
        assert_eq!(cmd.cols, 80);
    }

    #[test]
    fn builder_helpers_accumulate() {
        let cmd = PtyCommand::new("docker")
            .arg("compose")
            .args(["up", "-d"])
            .working_dir("/opt/stacks/web")
            .env("COMPOSE_PROJECT_NAME", "web")
            .size(40, 120);

        assert_eq!(cmd.command, "docker");
        assert_eq!(cmd.args, vec!["compose", "up", "-d"]);
        assert_eq!(cmd.working_dir.as_deref(), Some("/opt/stacks/web"));
        assert_eq!(cmd.env, vec![("COMPOSE_PROJECT_NAME".into(), "web".into())]);
        assert_eq!((cmd.rows, cmd.cols), (40, 120));
    }

    #[test]
    fn pump_forwards_all_chunks() {
        let data = vec![7u8; 10_000];
        let mut seen = Vec::new();
        pump(&data[..], |chunk| seen.extend_from_slice(chunk));
        assert_eq!(seen, data);
    }

    #[test]
    fn exit_outcome_from_std_status() {
        #[cfg(unix)]
        {
            let status = std::process::Command::new("true").status().unwrap();
            let outcome = ExitOutcome::from(status);
            assert!(outcome.success);
            assert_eq!(outcome.code, Some(0));
        }
    }
}
