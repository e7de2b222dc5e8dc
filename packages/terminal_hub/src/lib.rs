//! Terminal Hub - named, buffered, multi-subscriber output channels
//!
//! A [`Terminal`] collects the output of a spawned process (captured pipes or
//! a pseudo-terminal), keeps a bounded scrollback, and fans every chunk out to
//! the writers currently subscribed to it. A [`TerminalRegistry`] maps names to
//! terminals and can swap the producer behind a name without dropping its
//! subscribers.
//!
//! This crate has no HTTP dependencies and no knowledge of what is being run.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use terminal_hub::{PtyCommand, SubscriberId, TerminalKind, TerminalRegistry, Writer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = TerminalRegistry::new();
//!
//!     // A client subscribes before anything is producing output
//!     let writer: Writer = Arc::new(|chunk: &[u8]| {
//!         print!("{}", String::from_utf8_lossy(chunk));
//!     });
//!     registry.get_or_create("deploy").add_writer(SubscriberId(1), writer);
//!
//!     // The action swaps in a PTY terminal; the subscriber comes along
//!     let terminal = registry.recreate("deploy", TerminalKind::Pty);
//!     let outcome = terminal
//!         .run_pty(&PtyCommand::new("docker").args(["compose", "up", "-d"]))
//!         .await
//!         .unwrap();
//!     println!("exit: {:?}", outcome.code);
//! }
//! ```

mod buffer;
mod error;
mod pty;
mod registry;
mod terminal;

pub use buffer::{BUFFER_CAPACITY, BUFFER_RETAIN, OutputBuffer};
pub use error::TerminalError;
pub use pty::{DEFAULT_COLS, DEFAULT_ROWS, ExitOutcome, PtyCommand};
pub use registry::TerminalRegistry;
pub use terminal::{SubscriberId, Terminal, TerminalKind, Writer, normalize_line_endings};
