use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::terminal::{SubscriberId, Teardown, Terminal, TerminalKind, Writer};

/// Directory of live terminals keyed by name.
///
/// The registry lock only guards the name map. Terminal state is always
/// touched after the map lock is released, so the two are never nested.
/// Replacements additionally take `swaps` around the insert and the writer
/// move, so one replacement finishes handing off before the next begins.
#[derive(Debug, Default)]
pub struct TerminalRegistry {
    terminals: RwLock<HashMap<String, Arc<Terminal>>>,
    swaps: Mutex<()>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Terminal>>> {
        self.terminals.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Terminal>>> {
        self.terminals.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Terminal>> {
        self.read().get(name).cloned()
    }

    /// Existing terminal, or a new pipe terminal registered under `name`.
    pub fn get_or_create(&self, name: &str) -> Arc<Terminal> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        self.write()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(terminal = %name, "Creating terminal on first reference");
                Arc::new(Terminal::new(name, TerminalKind::Pipe))
            })
            .clone()
    }

    /// Attach `writer` to the live terminal named `name`, creating it if
    /// absent. Returns the terminal and its scrollback at attach time.
    ///
    /// A lookup can race a replace and return an instance that closes before
    /// the writer lands; in that case the lookup is retried against the
    /// instance that replaced it. A closed instance that is still registered
    /// is swapped for a fresh pipe terminal.
    pub fn subscribe(
        &self,
        name: &str,
        id: SubscriberId,
        writer: Writer,
    ) -> (Arc<Terminal>, Vec<u8>) {
        loop {
            let terminal = self.get_or_create(name);
            if let Some(snapshot) = terminal.attach_writer(id, writer.clone()) {
                return (terminal, snapshot);
            }
            debug!(terminal = %name, subscriber = %id, "Terminal closed during subscribe, retrying");
            self.replace_if_current(name, &terminal);
        }
    }

    fn replace_if_current(&self, name: &str, stale: &Arc<Terminal>) {
        let mut terminals = self.write();
        match terminals.get_mut(name) {
            Some(current) if Arc::ptr_eq(current, stale) => {
                debug!(terminal = %name, "Replacing closed terminal left in the registry");
                *current = Arc::new(Terminal::new(name, TerminalKind::Pipe));
            }
            _ => {}
        }
    }

    /// Install a fresh terminal, closing whatever was registered before.
    pub fn create(&self, name: &str, kind: TerminalKind) -> Arc<Terminal> {
        self.swap(name, kind, |previous, _| {
            debug!(terminal = %name, "Closing replaced terminal");
            previous.retire()
        })
    }

    /// Install a fresh terminal that inherits the previous instance's writers.
    ///
    /// Clients may subscribe before the producing action exists; carrying the
    /// writers over keeps them attached across the swap. The previous instance
    /// runs its cancel callback and is closed.
    pub fn recreate(&self, name: &str, kind: TerminalKind) -> Arc<Terminal> {
        self.swap(name, kind, |previous, terminal| {
            let teardown = previous.hand_off(terminal);
            debug!(
                terminal = %name,
                writers = terminal.writer_count(),
                "Recreated terminal"
            );
            teardown
        })
    }

    /// Register a new instance under `name` and let `displace` close the one
    /// it pushed out. The displaced instance's teardown runs after every registry
    /// lock is released, so cancel callbacks may call back into the registry.
    fn swap(
        &self,
        name: &str,
        kind: TerminalKind,
        displace: impl FnOnce(&Terminal, &Terminal) -> Option<Teardown>,
    ) -> Arc<Terminal> {
        let terminal = Arc::new(Terminal::new(name, kind));
        let teardown = {
            let _swap = self.swaps.lock().unwrap_or_else(|e| e.into_inner());
            let previous = self.write().insert(name.to_string(), terminal.clone());
            previous.and_then(|previous| displace(previous.as_ref(), terminal.as_ref()))
        };
        if let Some(teardown) = teardown {
            teardown.run(name);
        }
        terminal
    }

    /// Unregister and close. Returns the closed terminal, if there was one.
    pub fn remove(&self, name: &str) -> Option<Arc<Terminal>> {
        let removed = self.write().remove(name);
        if let Some(terminal) = &removed {
            terminal.close();
        }
        removed
    }

    /// Detach a subscriber from every terminal (used when a client disconnects).
    pub fn remove_writer_from_all(&self, id: SubscriberId) -> usize {
        let snapshot: Vec<Arc<Terminal>> = self.read().values().cloned().collect();
        snapshot
            .iter()
            .filter(|terminal| terminal.remove_writer(id))
            .count()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Close and forget every terminal (server shutdown).
    pub fn close_all(&self) {
        let drained: Vec<Arc<Terminal>> = self.write().drain().map(|(_, t)| t).collect();
        for terminal in drained {
            terminal.close();
        }
    }
}
