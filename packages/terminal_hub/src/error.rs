/// Errors that can occur during terminal operations
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    /// The terminal was closed and accepts no further work
    #[error("terminal is closed: {0}")]
    Closed(String),
    /// A process is already attached to the terminal
    #[error("terminal already has a running process: {0}")]
    AlreadyRunning(String),
    /// The operation requires a different terminal kind
    #[error("terminal {name} is {actual}, operation requires {expected}")]
    WrongKind {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    /// Failed to open a PTY or spawn the command
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    /// Failed to write input to the attached process
    #[error("failed to write to terminal: {0}")]
    Write(String),
    /// Failed to resize the PTY
    #[error("failed to resize terminal: {0}")]
    Resize(String),
    /// Waiting on the process or joining its reader failed
    #[error("failed to wait for process: {0}")]
    Wait(String),
}

impl From<anyhow::Error> for TerminalError {
    fn from(err: anyhow::Error) -> Self {
        TerminalError::Spawn(err.to_string())
    }
}
