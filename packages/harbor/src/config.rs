use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [websocket]
//                    write_timeout_secs = 5
//
//   env var:         HARBOR_WEBSOCKET__WRITE_TIMEOUT_SECS=5   (double underscore = nesting)
//
//   (single underscore stays within field names: HARBOR_AUTH__PASSWORD_HASH)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub terminal: TerminalFileConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Socket tunables (lives under `[websocket]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    #[serde(default = "default_max_message_kb")]
    pub max_message_kb: usize,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            max_message_kb: default_max_message_kb(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

/// Single-account credentials (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default = "default_username")]
    pub username: String,
    /// Argon2 PHC string, as printed by `harbor hash-password`.
    /// Login always fails while this is unset.
    #[serde(default)]
    pub password_hash: Option<String>,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password_hash: None,
        }
    }
}

/// Interactive shell settings (lives under `[terminal]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalFileConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

impl Default for TerminalFileConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

/// A named command the UI may run (`[[tasks]]` in config.toml).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Run on a PTY instead of captured pipes
    #[serde(default)]
    pub pty: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5001
}
fn default_max_message_kb() -> usize {
    1024
}
fn default_write_timeout_secs() -> u64 {
    10
}
fn default_username() -> String {
    "admin".to_string()
}
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}
fn default_rows() -> u16 {
    terminal_hub::DEFAULT_ROWS
}
fn default_cols() -> u16 {
    terminal_hub::DEFAULT_COLS
}

/// Build a figment that layers: defaults → config.toml → HARBOR_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `HARBOR_SERVER__PORT=8080`  →  `server.port = 8080`
///   `HARBOR_AUTH__USERNAME=ops`  →  `auth.username = "ops"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("HARBOR_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the server)
// =============================================================================

/// Resolved server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub websocket: WebSocketConfig,
    pub auth: AuthConfig,
    pub terminal: TerminalConfig,
    pub tasks: Vec<TaskConfig>,
}

#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    /// Largest inbound message (and frame) accepted by the upgrade
    pub max_message_bytes: usize,
    /// A single outbound write that takes longer than this closes the connection
    pub write_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::from_file(&WebSocketFileConfig::default())
    }
}

impl WebSocketConfig {
    pub fn from_file(fc: &WebSocketFileConfig) -> Self {
        Self {
            max_message_bytes: fc.max_message_kb * 1024,
            write_timeout: Duration::from_secs(fc.write_timeout_secs),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    pub username: String,
    pub password_hash: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TerminalConfig {
    pub shell: String,
    pub rows: u16,
    pub cols: u16,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let bind_addr = format!("{}:{}", fc.server.host, fc.server.port)
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "Invalid listen address {}:{}",
                    fc.server.host, fc.server.port
                )
            })?;

        Ok(Self {
            bind_addr,
            websocket: WebSocketConfig::from_file(&fc.websocket),
            auth: AuthConfig {
                username: fc.auth.username.clone(),
                password_hash: fc.auth.password_hash.clone().filter(|h| !h.is_empty()),
            },
            terminal: TerminalConfig {
                shell: fc.terminal.shell.clone(),
                rows: fc.terminal.rows,
                cols: fc.terminal.cols,
            },
            tasks: fc.tasks.clone(),
        })
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], default_port()).into(),
            websocket: WebSocketConfig::default(),
            auth: AuthConfig {
                username: default_username(),
                password_hash: None,
            },
            terminal: TerminalConfig {
                shell: default_shell(),
                rows: default_rows(),
                cols: default_cols(),
            },
            tasks: Vec::new(),
        }
    }
}

// =============================================================================
// Directory layout (derived from --data-dir, not layered through figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HarborDirs {
    pub data_dir: PathBuf,
}

impl HarborDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".harbor"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_server_file_config_defaults() {
        let d = ServerFileConfig::default();
        assert_eq!(d.host, "127.0.0.1");
        assert_eq!(d.port, 5001);
    }

    #[test]
    fn test_websocket_defaults() {
        let ws = WebSocketConfig::default();
        assert_eq!(ws.max_message_bytes, 1024 * 1024);
        assert_eq!(ws.write_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_terminal_defaults() {
        let d = TerminalFileConfig::default();
        assert_eq!((d.rows, d.cols), (24, 80));
        assert!(!d.shell.is_empty());
    }

    // ── ServerConfig::from_file ─────────────────────────────────────────

    #[test]
    fn test_server_config_from_file() {
        let fc = FileConfig {
            server: ServerFileConfig {
                host: "0.0.0.0".into(),
                port: 8080,
            },
            websocket: WebSocketFileConfig {
                max_message_kb: 64,
                write_timeout_secs: 3,
            },
            auth: AuthFileConfig {
                username: "ops".into(),
                password_hash: Some(String::new()),
            },
            ..Default::default()
        };
        let sc = ServerConfig::from_file(&fc).unwrap();
        assert_eq!(sc.bind_addr.port(), 8080);
        assert_eq!(sc.websocket.max_message_bytes, 64 * 1024);
        assert_eq!(sc.websocket.write_timeout, Duration::from_secs(3));
        assert_eq!(sc.auth.username, "ops");
        // An empty hash is the same as no hash
        assert!(sc.auth.password_hash.is_none());
    }

    #[test]
    fn test_bad_host_is_rejected() {
        let fc = FileConfig {
            server: ServerFileConfig {
                host: "not an address".into(),
                port: 1,
            },
            ..Default::default()
        };
        assert!(ServerConfig::from_file(&fc).is_err());
    }

    // ── figment layering ────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults_without_file() {
        figment::Jail::expect_with(|jail| {
            let fc: FileConfig = load_config(jail.directory()).extract()?;
            assert_eq!(fc.server.port, 5001);
            assert_eq!(fc.auth.username, "admin");
            assert!(fc.tasks.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_toml_then_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [server]
                port = 7000

                [websocket]
                write_timeout_secs = 30

                [[tasks]]
                name = "deploy"
                command = "docker"
                args = ["compose", "up", "-d"]
                pty = true
                "#,
            )?;
            jail.set_env("HARBOR_WEBSOCKET__WRITE_TIMEOUT_SECS", "5");

            let fc: FileConfig = load_config(jail.directory()).extract()?;
            assert_eq!(fc.server.port, 7000);
            assert_eq!(fc.server.host, "127.0.0.1");
            assert_eq!(fc.websocket.write_timeout_secs, 5);
            assert_eq!(fc.tasks.len(), 1);
            assert_eq!(fc.tasks[0].args, vec!["compose", "up", "-d"]);
            assert!(fc.tasks[0].pty);

            let sc = ServerConfig::from_file(&fc).map_err(|e| e.to_string())?;
            assert!(sc.task("deploy").is_some());
            assert!(sc.task("missing").is_none());
            Ok(())
        });
    }

    // ── HarborDirs ──────────────────────────────────────────────────────

    #[test]
    fn test_dirs_creates_custom_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("nested").join("harbor");
        let dirs = HarborDirs::new(Some(target.clone())).unwrap();
        assert!(target.is_dir());
        assert_eq!(dirs.config_toml_path(), target.join("config.toml"));
    }
}
