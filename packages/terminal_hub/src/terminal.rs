//! A single named output channel.
//!
//! A terminal is fed either by the standard streams of a spawned process
//! (pipe kind) or by a pseudo-terminal (pty kind). Everything written to it
//! lands in a bounded scrollback and is fanned out, in order, to every writer
//! registered at the time of the write. Closing is permanent.

use portable_pty::{Child, ChildKiller, MasterPty, PtySize};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::buffer::OutputBuffer;
use crate::error::TerminalError;
use crate::pty::{ExitOutcome, PtyCommand, pump, spawn_pty};

/// Identity of a subscriber (normally one client connection)
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Per-subscriber output callback.
///
/// Called with the terminal's lock held, so it must not call back into the
/// same terminal.
pub type Writer = Arc<dyn Fn(&[u8]) + Send + Sync>;

type CancelFn = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalKind {
    /// Captured process output; bare LF is rewritten to CRLF
    Pipe,
    /// Pseudo-terminal; bytes pass through untouched
    Pty,
}

impl TerminalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalKind::Pipe => "pipe",
            TerminalKind::Pty => "pty",
        }
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Killer {
    Pty(Box<dyn ChildKiller + Send + Sync>),
    Pid(u32),
}

impl Killer {
    fn kill(self) {
        match self {
            Killer::Pty(mut killer) => {
                if let Err(e) = killer.kill() {
                    debug!("Failed to kill PTY process (likely already exited): {}", e);
                }
            }
            Killer::Pid(pid) => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        debug!("Failed to signal process {} (likely already exited): {}", pid, e);
                    }
                }
                #[cfg(not(unix))]
                {
                    warn!("Cannot terminate piped process {} on this platform", pid);
                }
            }
        }
    }
}

struct AttachedProcess {
    /// Distinguishes successive processes so a stale reader never detaches a newer one
    generation: u64,
    pid: Option<u32>,
    pty: Option<PtyIo>,
    killer: Killer,
}

struct PtyIo {
    master: Box<dyn MasterPty + Send>,
    input: Box<dyn Write + Send>,
}

#[derive(Default)]
struct TerminalState {
    buffer: OutputBuffer,
    writers: HashMap<SubscriberId, Writer>,
    process: Option<AttachedProcess>,
    generations: u64,
    cancel: Option<CancelFn>,
    closed: bool,
    /// Last pipe byte written was CR, so a leading LF in the next chunk is already paired
    trailing_cr: bool,
}

/// Everything a closed terminal still has to release once its lock is dropped.
#[must_use]
pub(crate) struct Teardown {
    cancel: Option<CancelFn>,
    process: Option<AttachedProcess>,
}

impl Teardown {
    pub(crate) fn run(self, name: &str) {
        if let Some(cancel) = self.cancel {
            debug!(terminal = %name, "Running cancel callback");
            cancel();
        }
        if let Some(process) = self.process {
            info!(terminal = %name, pid = ?process.pid, "Terminating attached process");
            process.killer.kill();
        }
    }
}

pub struct Terminal {
    name: String,
    kind: TerminalKind,
    state: Mutex<TerminalState>,
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Terminal {
    pub fn new(name: impl Into<String>, kind: TerminalKind) -> Self {
        Self {
            name: name.into(),
            kind,
            state: Mutex::new(TerminalState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TerminalKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, TerminalState> {
        // A panicking writer must not take the whole channel down with it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Whether a process is currently attached.
    pub fn is_running(&self) -> bool {
        self.lock().process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().process.as_ref().and_then(|p| p.pid)
    }

    /// Snapshot of the buffered output.
    pub fn buffer(&self) -> Vec<u8> {
        self.lock().buffer.as_bytes().to_vec()
    }

    pub fn writer_count(&self) -> usize {
        self.lock().writers.len()
    }

    pub fn has_writer(&self, id: SubscriberId) -> bool {
        self.lock().writers.contains_key(&id)
    }

    /// Buffer and fan out a chunk of output. Dropped silently once closed.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.lock();
        if state.closed {
            return;
        }

        let normalized;
        let chunk: &[u8] = match self.kind {
            TerminalKind::Pty => data,
            TerminalKind::Pipe => {
                normalized = normalize_line_endings(data, state.trailing_cr);
                state.trailing_cr = data.last() == Some(&b'\r');
                &normalized
            }
        };

        state.buffer.push(chunk);
        for writer in state.writers.values() {
            writer(chunk);
        }
    }

    /// Register a writer. Ignored (returns false) once the terminal is closed.
    pub fn add_writer(&self, id: SubscriberId, writer: Writer) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.writers.insert(id, writer);
        true
    }

    /// Register a writer and return the scrollback as of that moment, taken
    /// under the same lock so the writer sees exactly what follows it.
    /// Returns None once the terminal is closed.
    pub fn attach_writer(&self, id: SubscriberId, writer: Writer) -> Option<Vec<u8>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.writers.insert(id, writer);
        Some(state.buffer.as_bytes().to_vec())
    }

    /// Unregister a writer. Safe to call for ids that were never added.
    pub fn remove_writer(&self, id: SubscriberId) -> bool {
        self.lock().writers.remove(&id).is_some()
    }

    /// Store a cleanup callback run exactly once when the terminal closes.
    ///
    /// If the terminal is already closed the callback runs immediately.
    /// A previously stored callback is replaced without being run.
    pub fn set_cancel(&self, cancel: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            cancel();
            return;
        }
        state.cancel = Some(Box::new(cancel));
    }

    /// Forward keystrokes to the attached PTY. No-op for pipe terminals or
    /// when nothing is attached.
    pub fn input(&self, data: &[u8]) -> Result<(), TerminalError> {
        let mut state = self.lock();
        let Some(pty) = state.process.as_mut().and_then(|p| p.pty.as_mut()) else {
            return Ok(());
        };
        pty.input
            .write_all(data)
            .and_then(|_| pty.input.flush())
            .map_err(|e| TerminalError::Write(e.to_string()))
    }

    /// Resize the attached PTY. No-op for pipe terminals or when nothing is attached.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), TerminalError> {
        let state = self.lock();
        let Some(pty) = state.process.as_ref().and_then(|p| p.pty.as_ref()) else {
            return Ok(());
        };
        pty.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Resize(e.to_string()))
    }

    /// Close the terminal: detach all writers, run the cancel callback and
    /// terminate any attached process. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        let Some(teardown) = self.retire() else {
            return false;
        };
        debug!(terminal = %self.name, "Terminal closed");
        teardown.run(&self.name);
        true
    }

    /// Mark the terminal closed and drop its writers, leaving the cancel
    /// callback and process for the caller to release. None if already closed.
    pub(crate) fn retire(&self) -> Option<Teardown> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        state.writers.clear();
        Some(Teardown {
            cancel: state.cancel.take(),
            process: state.process.take(),
        })
    }

    /// Close this terminal and move its writers onto `successor`.
    ///
    /// Both locks are held while the writers move, so no subscriber is ever
    /// registered on neither instance. Lock order is always predecessor then
    /// successor. Writers are dropped if `successor` is already closed.
    pub(crate) fn hand_off(&self, successor: &Terminal) -> Option<Teardown> {
        let mut state = self.lock();
        let writers = std::mem::take(&mut state.writers);
        let was_closed = state.closed;
        state.closed = true;
        {
            let mut next = successor.lock();
            if !next.closed {
                for (id, writer) in writers {
                    next.writers.entry(id).or_insert(writer);
                }
            }
        }
        if was_closed {
            return None;
        }
        Some(Teardown {
            cancel: state.cancel.take(),
            process: state.process.take(),
        })
    }

    fn require_kind(&self, expected: TerminalKind) -> Result<(), TerminalError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(TerminalError::WrongKind {
                name: self.name.clone(),
                expected: expected.as_str(),
                actual: self.kind.as_str(),
            })
        }
    }

    /// Register a freshly spawned process, or hand it back if the terminal
    /// cannot take it.
    fn attach(
        &self,
        pid: Option<u32>,
        pty: Option<PtyIo>,
        killer: Killer,
    ) -> Result<u64, (TerminalError, Killer)> {
        let mut state = self.lock();
        if state.closed {
            return Err((TerminalError::Closed(self.name.clone()), killer));
        }
        if state.process.is_some() {
            return Err((TerminalError::AlreadyRunning(self.name.clone()), killer));
        }
        state.generations += 1;
        let generation = state.generations;
        state.process = Some(AttachedProcess {
            generation,
            pid,
            pty,
            killer,
        });
        Ok(generation)
    }

    /// Forget the process started as `generation`, if it is still the attached one.
    fn detach(&self, generation: u64) -> Option<AttachedProcess> {
        let mut state = self.lock();
        if state
            .process
            .as_ref()
            .is_some_and(|p| p.generation == generation)
        {
            state.process.take()
        } else {
            None
        }
    }

    fn check_startable(&self) -> Result<(), TerminalError> {
        let state = self.lock();
        if state.closed {
            return Err(TerminalError::Closed(self.name.clone()));
        }
        if state.process.is_some() {
            return Err(TerminalError::AlreadyRunning(self.name.clone()));
        }
        Ok(())
    }

    /// Spawn `command` on a new PTY and stream its output in the background.
    ///
    /// Returns once the process is running; a dedicated reader thread forwards
    /// output and clears the process handle after the child exits.
    pub fn start_pty(self: &Arc<Self>, command: &PtyCommand) -> Result<(), TerminalError> {
        let (generation, reader, child) = self.spawn_attached_pty(command)?;

        // The thread takes its handles from here; if it never starts they are
        // still reachable for cleanup.
        let handles = Arc::new(Mutex::new(Some((reader, child))));
        let slot = Arc::clone(&handles);
        let terminal = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("pty-{}", self.name))
            .spawn(move || {
                let Some((reader, mut child)) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() else {
                    return;
                };
                pump(reader, |chunk| terminal.write(chunk));
                terminal.detach(generation);
                match child.wait() {
                    Ok(status) => {
                        info!(terminal = %terminal.name, "PTY process exited with status: {:?}", status)
                    }
                    Err(e) => warn!(terminal = %terminal.name, "Failed to wait for PTY process: {}", e),
                }
            });

        if let Err(e) = spawned {
            let child = handles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .map(|(_, child)| child);
            self.abandon(generation, child);
            return Err(TerminalError::Spawn(format!("failed to start reader thread: {e}")));
        }
        Ok(())
    }

    /// Kill and reap a process whose output will never be read, leaving the
    /// terminal free for another start.
    fn abandon(&self, generation: u64, child: Option<Box<dyn Child + Send + Sync>>) {
        if let Some(process) = self.detach(generation) {
            warn!(terminal = %self.name, pid = ?process.pid, "Abandoning PTY process");
            process.killer.kill();
        }
        if let Some(mut child) = child {
            if let Err(e) = child.wait() {
                warn!(terminal = %self.name, "Failed to wait for PTY process: {}", e);
            }
        }
    }

    /// Spawn `command` on a new PTY and drain its output before returning.
    ///
    /// Resolves with the exit outcome once the stream is exhausted and the
    /// child has been reaped.
    pub async fn run_pty(self: &Arc<Self>, command: &PtyCommand) -> Result<ExitOutcome, TerminalError> {
        let (generation, reader, mut child) = self.spawn_attached_pty(command)?;

        let terminal = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || {
            pump(reader, |chunk| terminal.write(chunk));
            terminal.detach(generation);
            child.wait()
        })
        .await
        .map_err(|e| TerminalError::Wait(e.to_string()))?;

        let outcome = ExitOutcome::from(result.map_err(|e| TerminalError::Wait(e.to_string()))?);
        info!(terminal = %self.name, code = ?outcome.code, "PTY command finished");
        Ok(outcome)
    }

    fn spawn_attached_pty(
        &self,
        command: &PtyCommand,
    ) -> Result<(u64, Box<dyn Read + Send>, Box<dyn Child + Send + Sync>), TerminalError> {
        self.require_kind(TerminalKind::Pty)?;
        self.check_startable()?;

        let spawned = spawn_pty(command)?;
        let pid = spawned.child.process_id();
        let killer = Killer::Pty(spawned.child.clone_killer());
        let pty = PtyIo {
            master: spawned.master,
            input: spawned.input,
        };

        match self.attach(pid, Some(pty), killer) {
            Ok(generation) => Ok((generation, spawned.reader, spawned.child)),
            Err((err, killer)) => {
                // Lost a race with close or another start.
                killer.kill();
                Err(err)
            }
        }
    }

    /// Run a non-interactive command with stdout and stderr captured into
    /// this pipe terminal, resolving with its exit outcome.
    pub async fn run_piped(self: &Arc<Self>, mut command: Command) -> Result<ExitOutcome, TerminalError> {
        self.require_kind(TerminalKind::Pipe)?;
        self.check_startable()?;

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let generation = match self.attach(Some(pid), None, Killer::Pid(pid)) {
            Ok(generation) => generation,
            Err((err, _)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };
        debug!(terminal = %self.name, pid, "Piped process started");

        let terminal = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || {
            let stderr_reader = stderr.map(|stderr| {
                let terminal = Arc::clone(&terminal);
                std::thread::spawn(move || pump(stderr, |chunk| terminal.write(chunk)))
            });
            if let Some(stdout) = stdout {
                pump(stdout, |chunk| terminal.write(chunk));
            }
            if let Some(handle) = stderr_reader {
                let _ = handle.join();
            }
            // Detach first: once reaped, the pid may belong to someone else.
            terminal.detach(generation);
            child.wait()
        })
        .await
        .map_err(|e| TerminalError::Wait(e.to_string()))?;

        let outcome = ExitOutcome::from(result.map_err(|e| TerminalError::Wait(e.to_string()))?);
        info!(terminal = %self.name, code = ?outcome.code, "Piped command finished");
        Ok(outcome)
    }
}

/// Rewrite bare LF to CRLF. `after_cr` says whether the byte preceding this
/// chunk was a CR.
pub fn normalize_line_endings(data: &[u8], after_cr: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    let mut prev_cr = after_cr;
    for &byte in data {
        if byte == b'\n' && !prev_cr {
            out.push(b'\r');
        }
        out.push(byte);
        prev_cr = byte == b'\r';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collector() -> (Writer, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let writer: Writer = Arc::new(move |chunk: &[u8]| {
            sink.lock().unwrap().extend_from_slice(chunk);
        });
        (writer, seen)
    }

    #[test]
    fn pipe_rewrites_bare_lf() {
        let term = Terminal::new("build", TerminalKind::Pipe);
        term.write(b"a\nb\r\nc");
        assert_eq!(term.buffer(), b"a\r\nb\r\nc");
    }

    #[test]
    fn pty_passes_bytes_through() {
        let term = Terminal::new("shell", TerminalKind::Pty);
        term.write(b"a\nb\r\nc");
        assert_eq!(term.buffer(), b"a\nb\r\nc");
    }

    #[test]
    fn pipe_crlf_split_across_writes_is_not_doubled() {
        let term = Terminal::new("build", TerminalKind::Pipe);
        term.write(b"line\r");
        term.write(b"\nnext\n");
        assert_eq!(term.buffer(), b"line\r\nnext\r\n");
    }

    #[test]
    fn fan_out_reaches_every_writer_in_order() {
        let term = Terminal::new("logs", TerminalKind::Pty);
        let (w1, seen1) = collector();
        let (w2, seen2) = collector();
        assert!(term.add_writer(SubscriberId(1), w1));
        assert!(term.add_writer(SubscriberId(2), w2));

        term.write(b"one ");
        term.write(b"two");

        assert_eq!(*seen1.lock().unwrap(), b"one two");
        assert_eq!(*seen2.lock().unwrap(), b"one two");
    }

    #[test]
    fn late_writer_gets_no_replay() {
        let term = Terminal::new("logs", TerminalKind::Pty);
        term.write(b"before");
        let (w, seen) = collector();
        term.add_writer(SubscriberId(1), w);
        term.write(b"after");
        assert_eq!(*seen.lock().unwrap(), b"after");
        assert_eq!(term.buffer(), b"beforeafter");
    }

    #[test]
    fn attach_writer_snapshot_has_no_gap_or_overlap() {
        let term = Terminal::new("logs", TerminalKind::Pipe);
        term.write(b"first\n");
        let (w, seen) = collector();
        let snapshot = term.attach_writer(SubscriberId(1), w).unwrap();
        term.write(b"second\n");

        assert_eq!(snapshot, b"first\r\n");
        assert_eq!(*seen.lock().unwrap(), b"second\r\n");

        term.close();
        let (late, _) = collector();
        assert!(term.attach_writer(SubscriberId(2), late).is_none());
    }

    #[test]
    fn remove_writer_is_always_safe() {
        let term = Terminal::new("logs", TerminalKind::Pipe);
        assert!(!term.remove_writer(SubscriberId(9)));

        let (w, seen) = collector();
        term.add_writer(SubscriberId(1), w);
        assert!(term.remove_writer(SubscriberId(1)));
        term.write(b"x");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn closed_terminal_drops_writes_and_writers() {
        let term = Terminal::new("logs", TerminalKind::Pty);
        let (w, seen) = collector();
        term.add_writer(SubscriberId(1), w);
        term.write(b"kept");

        assert!(term.close());
        assert!(!term.close());
        assert_eq!(term.writer_count(), 0);

        term.write(b"dropped");
        assert_eq!(term.buffer(), b"kept");
        assert_eq!(*seen.lock().unwrap(), b"kept");
    }

    #[test]
    fn add_writer_after_close_never_invokes_it() {
        let term = Terminal::new("logs", TerminalKind::Pipe);
        term.close();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let writer: Writer = Arc::new(move |_: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!term.add_writer(SubscriberId(1), writer));
        term.write(b"anything");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!term.has_writer(SubscriberId(1)));
    }

    #[test]
    fn cancel_runs_exactly_once_on_close() {
        let term = Terminal::new("tail", TerminalKind::Pipe);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        term.set_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        term.close();
        term.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_set_after_close_runs_immediately() {
        let term = Terminal::new("tail", TerminalKind::Pipe);
        term.close();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        term.set_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn input_and_resize_are_noops_without_pty() {
        let pipe = Terminal::new("build", TerminalKind::Pipe);
        assert!(pipe.input(b"ls\n").is_ok());
        assert!(pipe.resize(40, 100).is_ok());

        let idle_pty = Terminal::new("shell", TerminalKind::Pty);
        assert!(idle_pty.input(b"ls\n").is_ok());
        assert!(idle_pty.resize(40, 100).is_ok());
    }

    #[test]
    fn hand_off_moves_writers_and_closes() {
        let old = Terminal::new("stack", TerminalKind::Pty);
        let new = Terminal::new("stack", TerminalKind::Pty);
        let (w1, seen1) = collector();
        let (w2, seen2) = collector();
        old.add_writer(SubscriberId(1), w1);
        old.add_writer(SubscriberId(2), w2);

        if let Some(teardown) = old.hand_off(&new) {
            teardown.run(old.name());
        }

        assert!(old.is_closed());
        assert_eq!(old.writer_count(), 0);
        assert_eq!(new.writer_count(), 2);

        old.write(b"stale");
        new.write(b"hello");
        assert_eq!(*seen1.lock().unwrap(), b"hello");
        assert_eq!(*seen2.lock().unwrap(), b"hello");
    }

    #[test]
    fn start_pty_on_pipe_terminal_is_rejected() {
        let term = Arc::new(Terminal::new("build", TerminalKind::Pipe));
        let err = term.start_pty(&PtyCommand::new("true")).unwrap_err();
        assert!(matches!(err, TerminalError::WrongKind { .. }));
        assert!(!term.is_running());
    }

    #[test]
    fn start_pty_spawn_failure_leaves_state_untouched() {
        let term = Arc::new(Terminal::new("shell", TerminalKind::Pty));
        let result = term.start_pty(&PtyCommand::new("/definitely/not/a/real/binary"));
        assert!(result.is_err());
        assert!(!term.is_running());
        assert!(!term.is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_pty_streams_output_and_reports_exit() {
        let term = Arc::new(Terminal::new("job", TerminalKind::Pty));
        let (w, seen) = collector();
        term.add_writer(SubscriberId(1), w);

        let outcome = term
            .run_pty(&PtyCommand::new("sh").args(["-c", "printf ready; exit 3"]))
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.code, Some(3));
        assert!(!term.is_running());
        let output = String::from_utf8_lossy(&seen.lock().unwrap()).to_string();
        assert!(output.contains("ready"), "got {output:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_piped_normalizes_and_captures_stderr() {
        let term = Arc::new(Terminal::new("compose", TerminalKind::Pipe));
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'out\\n'; printf 'err\\n' >&2"]);

        let outcome = term.run_piped(cmd).await.unwrap();
        assert!(outcome.success);

        let buffered = term.buffer();
        let text = String::from_utf8_lossy(&buffered);
        assert!(text.contains("out\r\n"), "got {text:?}");
        assert!(text.contains("err\r\n"), "got {text:?}");
        assert!(!term.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn abandoned_pty_is_killed_and_frees_the_terminal() {
        let term = Arc::new(Terminal::new("shell", TerminalKind::Pty));
        let (generation, reader, child) = term
            .spawn_attached_pty(&PtyCommand::new("sleep").arg("30"))
            .unwrap();
        drop(reader);
        assert!(term.is_running());

        term.abandon(generation, Some(child));
        assert!(!term.is_running());
        assert!(!term.is_closed());

        term.start_pty(&PtyCommand::new("true")).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_piped_lets_go_of_the_process_before_reaping_it() {
        let term = Arc::new(Terminal::new("job", TerminalKind::Pipe));
        let mut cmd = Command::new("sh");
        // Output ends long before the process does
        cmd.args(["-c", "exec >&- 2>&-; sleep 1"]);

        let runner = {
            let term = term.clone();
            tokio::spawn(async move { term.run_piped(cmd).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        assert!(!runner.is_finished());
        assert!(!term.is_running());
        assert_eq!(term.pid(), None);

        let outcome = runner.await.unwrap().unwrap();
        assert!(outcome.success);
    }

    #[cfg(unix)]
    #[test]
    fn close_terminates_running_pty() {
        let term = Arc::new(Terminal::new("shell", TerminalKind::Pty));
        term.start_pty(&PtyCommand::new("sleep").arg("30")).unwrap();
        assert!(term.is_running());
        assert!(matches!(
            term.start_pty(&PtyCommand::new("sleep").arg("30")),
            Err(TerminalError::AlreadyRunning(_))
        ));

        term.close();
        assert!(!term.is_running());
        assert!(matches!(
            term.start_pty(&PtyCommand::new("true")),
            Err(TerminalError::Closed(_))
        ));
    }
}
