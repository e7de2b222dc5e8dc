//! Socket event handlers: login and the terminal controls the UI drives.
//!
//! Every handler except the login family requires an authenticated
//! connection and fails with [`NOT_LOGGED_IN`] otherwise.

use anyhow::Context;
use serde_json::{Value, json};
use std::future::Future;
use std::process::Command;
use std::sync::{Arc, Mutex};
use terminal_hub::{PtyCommand, TerminalKind, TerminalRegistry, Writer};
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::auth::{self, ADMIN_USER_ID, SessionStore};
use crate::config::ServerConfig;
use crate::ws::{
    CONNECT_EVENT, Connection, ConnectionRegistry, EventContext, HandlerError, HandlerResult,
    ResultPayload, UserId, Utf8StreamDecoder,
};

/// Push event carrying terminal output to subscribers
pub const TERMINAL_OUTPUT_EVENT: &str = "terminalOutput";
/// Translation key for the auth failure every guarded handler returns
pub const NOT_LOGGED_IN: &str = "notLoggedIn";

const DEFAULT_SHELL_TERMINAL: &str = "shell";

/// What the handlers need. The connection registry arrives per call in the
/// event context, so nothing here points back at it.
struct Services {
    config: Arc<ServerConfig>,
    terminals: Arc<TerminalRegistry>,
    sessions: Arc<SessionStore>,
}

fn route<F, Fut>(registry: &ConnectionRegistry, services: &Arc<Services>, event: &str, handler: F)
where
    F: Fn(Arc<Services>, EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let services = services.clone();
    registry.handle(event, move |ctx| handler(services.clone(), ctx));
}

/// Install every socket event handler plus the disconnect cleanup.
pub fn register_events(state: &AppState) {
    let services = Arc::new(Services {
        config: state.config.clone(),
        terminals: state.terminals.clone(),
        sessions: state.sessions.clone(),
    });
    let registry = &state.connections;

    route(registry, &services, CONNECT_EVENT, on_connect);
    route(registry, &services, "login", login);
    route(registry, &services, "loginByToken", login_by_token);
    route(registry, &services, "logout", logout);
    route(
        registry,
        &services,
        "disconnectOtherSocketClients",
        disconnect_other_socket_clients,
    );
    route(registry, &services, "listTerminals", list_terminals);
    route(registry, &services, "subscribeTerminal", subscribe_terminal);
    route(registry, &services, "unsubscribeTerminal", unsubscribe_terminal);
    route(registry, &services, "terminalInput", terminal_input);
    route(registry, &services, "terminalResize", terminal_resize);
    route(registry, &services, "openShell", open_shell);
    route(registry, &services, "runTask", run_task);
    route(registry, &services, "closeTerminal", close_terminal);

    let terminals = state.terminals.clone();
    registry.on_disconnect(move |conn| {
        let detached = terminals.remove_writer_from_all(conn.id().into());
        if detached > 0 {
            debug!(conn = %conn.id(), detached, "Detached writers of closed connection");
        }
    });
}

/// Writer that forwards a terminal's output to one connection as
/// `terminalOutput` pushes.
///
/// Holds the connection weakly: a writer that outlives its connection is
/// inert rather than keeping it alive.
pub fn terminal_writer(conn: &Arc<Connection>, terminal: &str) -> Writer {
    let conn = Arc::downgrade(conn);
    let terminal = terminal.to_string();
    let decoder = Mutex::new(Utf8StreamDecoder::new());

    Arc::new(move |chunk: &[u8]| {
        let Some(conn) = conn.upgrade() else { return };
        let data = decoder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .decode(chunk);
        if !data.is_empty() {
            conn.send_event(
                TERMINAL_OUTPUT_EVENT,
                json!({ "terminalName": terminal, "data": data }),
            );
        }
    })
}

fn require_login(ctx: &EventContext) -> Result<UserId, HandlerError> {
    ctx.conn
        .user_id()
        .ok_or_else(|| HandlerError::I18n(NOT_LOGGED_IN.to_string()))
}

fn terminal_not_found() -> HandlerError {
    HandlerError::I18n("terminalNotFound".to_string())
}

// =============================================================================
// Connection / auth
// =============================================================================

async fn on_connect(_services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    ctx.conn.send_event(
        "info",
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "authenticated": false,
        }),
    );
    Ok(Value::Null)
}

async fn login(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    let username: String = ctx.arg(0)?;
    let password: String = ctx.arg(1)?;

    let auth_config = services.config.auth.clone();
    let user = username.clone();
    let valid = tokio::task::spawn_blocking(move || {
        auth::check_credentials(&auth_config, &user, &password)
    })
    .await
    .context("password check task failed")??;

    if !valid {
        warn!(conn = %ctx.conn.id(), username = %username, "Incorrect login");
        return Ok(ResultPayload::error_i18n("authIncorrectCreds").into_value());
    }

    ctx.conn.set_user(Some(ADMIN_USER_ID));
    let token = services.sessions.issue(ADMIN_USER_ID);
    info!(conn = %ctx.conn.id(), username = %username, "Logged in");
    Ok(ResultPayload::ok().with_token(token).into_value())
}

async fn login_by_token(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    let token: String = ctx.arg(0)?;
    match services.sessions.validate(&token) {
        Some(user) => {
            ctx.conn.set_user(Some(user));
            debug!(conn = %ctx.conn.id(), "Resumed session from token");
            Ok(ResultPayload::ok().into_value())
        }
        None => Ok(ResultPayload::error_i18n("authInvalidToken").into_value()),
    }
}

async fn logout(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    if let Some(token) = ctx.opt_arg::<String>(0)? {
        services.sessions.revoke(&token);
    }
    ctx.conn.set_user(None);
    Ok(ResultPayload::ok().into_value())
}

async fn disconnect_other_socket_clients(
    _services: Arc<Services>,
    ctx: EventContext,
) -> HandlerResult {
    require_login(&ctx)?;
    let closed = ctx.registry.disconnect_others(ctx.conn.id());
    Ok(json!({ "ok": true, "closed": closed }))
}

// =============================================================================
// Terminals
// =============================================================================

async fn list_terminals(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    require_login(&ctx)?;
    let terminals: Vec<Value> = services
        .terminals
        .names()
        .into_iter()
        .filter_map(|name| services.terminals.get(&name))
        .map(|t| {
            json!({
                "name": t.name(),
                "kind": t.kind().as_str(),
                "running": t.is_running(),
                "subscribers": t.writer_count(),
            })
        })
        .collect();
    Ok(json!({ "ok": true, "terminals": terminals }))
}

async fn subscribe_terminal(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    require_login(&ctx)?;
    let name: String = ctx.arg(0)?;

    let writer = terminal_writer(&ctx.conn, &name);
    let (terminal, snapshot) = services
        .terminals
        .subscribe(&name, ctx.conn.id().into(), writer);
    debug!(conn = %ctx.conn.id(), terminal = %name, "Subscribed");

    Ok(json!({
        "ok": true,
        "buffer": String::from_utf8_lossy(&snapshot),
        "kind": terminal.kind().as_str(),
        "running": terminal.is_running(),
    }))
}

async fn unsubscribe_terminal(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    let name: String = ctx.arg(0)?;
    if let Some(terminal) = services.terminals.get(&name) {
        terminal.remove_writer(ctx.conn.id().into());
    }
    Ok(ResultPayload::ok().into_value())
}

async fn terminal_input(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    require_login(&ctx)?;
    let name: String = ctx.arg(0)?;
    let data: String = ctx.arg(1)?;

    let terminal = services
        .terminals
        .get(&name)
        .ok_or_else(terminal_not_found)?;
    terminal.input(data.as_bytes())?;
    Ok(ResultPayload::ok().into_value())
}

async fn terminal_resize(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    require_login(&ctx)?;
    let name: String = ctx.arg(0)?;
    let rows: u16 = ctx.arg(1)?;
    let cols: u16 = ctx.arg(2)?;

    let terminal = services
        .terminals
        .get(&name)
        .ok_or_else(terminal_not_found)?;
    terminal.resize(rows, cols)?;
    Ok(ResultPayload::ok().into_value())
}

/// Start an interactive shell on a PTY terminal. An already running shell
/// under the same name is reused.
async fn open_shell(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    require_login(&ctx)?;
    let name = ctx
        .opt_arg::<String>(0)?
        .unwrap_or_else(|| DEFAULT_SHELL_TERMINAL.to_string());

    if let Some(existing) = services.terminals.get(&name) {
        if existing.kind() == TerminalKind::Pty && existing.is_running() {
            return Ok(ResultPayload::ok().into_value());
        }
    }

    let shell = &services.config.terminal;
    let command = PtyCommand::new(shell.shell.clone()).size(shell.rows, shell.cols);
    let terminal = services.terminals.recreate(&name, TerminalKind::Pty);
    terminal.start_pty(&command)?;
    info!(conn = %ctx.conn.id(), terminal = %name, shell = %shell.shell, "Opened shell");
    Ok(ResultPayload::ok().into_value())
}

/// Run a configured task to completion on its own terminal, then tell every
/// logged-in client how it ended.
async fn run_task(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    require_login(&ctx)?;
    let name: String = ctx.arg(0)?;
    let task = services
        .config
        .task(&name)
        .cloned()
        .ok_or_else(|| HandlerError::I18n("taskNotFound".to_string()))?;

    info!(conn = %ctx.conn.id(), task = %task.name, command = %task.command, "Running task");
    let outcome = if task.pty {
        let mut command = PtyCommand::new(task.command.clone())
            .args(task.args.iter().cloned())
            .size(services.config.terminal.rows, services.config.terminal.cols);
        if let Some(dir) = &task.working_dir {
            command = command.working_dir(dir.clone());
        }
        let terminal = services.terminals.recreate(&task.name, TerminalKind::Pty);
        terminal.run_pty(&command).await?
    } else {
        let mut command = Command::new(&task.command);
        command.args(&task.args);
        if let Some(dir) = &task.working_dir {
            command.current_dir(dir);
        }
        let terminal = services.terminals.recreate(&task.name, TerminalKind::Pipe);
        terminal.run_piped(command).await?
    };

    info!(task = %task.name, code = ?outcome.code, success = outcome.success, "Task finished");
    ctx.registry.broadcast_authenticated(
        "taskFinished",
        json!({ "name": task.name, "code": outcome.code, "success": outcome.success }),
    );

    Ok(json!({
        "ok": outcome.success,
        "code": outcome.code,
    }))
}

async fn close_terminal(services: Arc<Services>, ctx: EventContext) -> HandlerResult {
    require_login(&ctx)?;
    let name: String = ctx.arg(0)?;
    services
        .terminals
        .remove(&name)
        .ok_or_else(terminal_not_found)?;
    info!(conn = %ctx.conn.id(), terminal = %name, "Closed terminal");
    Ok(ResultPayload::ok().into_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, TaskConfig};
    use crate::ws::Request;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn state_with(config: ServerConfig) -> AppState {
        AppState::new(config)
    }

    fn frame(rx: &mut UnboundedReceiver<Message>) -> Value {
        match rx.try_recv().expect("expected a queued frame") {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn call(
        state: &AppState,
        conn: &Arc<Connection>,
        rx: &mut UnboundedReceiver<Message>,
        id: u64,
        event: &str,
        args: Value,
    ) -> Value {
        state
            .connections
            .dispatch(conn, Request::new(event, args).with_id(id))
            .expect("handler registered")
            .await
            .unwrap();
        // Skip pushes that were queued ahead of the ack
        loop {
            let f = frame(rx);
            if f.get("id").is_some() {
                assert_eq!(f["id"], id);
                return f["data"].clone();
            }
        }
    }

    #[tokio::test]
    async fn guarded_events_require_login() {
        let state = state_with(ServerConfig::default());
        let (conn, mut rx) = state.connections.open();

        for event in ["subscribeTerminal", "terminalInput", "openShell", "runTask"] {
            let data = call(&state, &conn, &mut rx, 1, event, json!(["x"])).await;
            assert_eq!(
                data,
                json!({"ok": false, "msg": "notLoggedIn", "msgI18n": true}),
                "{event}"
            );
        }
    }

    #[tokio::test]
    async fn login_sets_principal_and_issues_token() {
        let config = ServerConfig {
            auth: AuthConfig {
                username: "admin".into(),
                password_hash: Some(auth::hash_password("s3cret").unwrap()),
            },
            ..Default::default()
        };
        let state = state_with(config);
        let (conn, mut rx) = state.connections.open();

        let bad = call(&state, &conn, &mut rx, 1, "login", json!(["admin", "nope"])).await;
        assert_eq!(bad["ok"], false);
        assert!(!conn.is_authenticated());

        let good = call(&state, &conn, &mut rx, 2, "login", json!(["admin", "s3cret"])).await;
        assert_eq!(good["ok"], true);
        let token = good["token"].as_str().unwrap().to_string();
        assert!(conn.is_authenticated());

        // A second connection resumes with the token
        let (other, mut other_rx) = state.connections.open();
        let resumed = call(&state, &other, &mut other_rx, 1, "loginByToken", json!([token])).await;
        assert_eq!(resumed, json!({"ok": true}));
        assert!(other.is_authenticated());
    }

    #[tokio::test]
    async fn subscribe_returns_snapshot_and_streams_output() {
        let state = state_with(ServerConfig::default());
        let (conn, mut rx) = state.connections.open();
        conn.set_user(Some(ADMIN_USER_ID));

        state.terminals.get_or_create("build-x").write(b"earlier\n");
        let ack = call(&state, &conn, &mut rx, 3, "subscribeTerminal", json!(["build-x"])).await;
        assert_eq!(ack["ok"], true);
        assert_eq!(ack["buffer"], "earlier\r\n");

        state.terminals.get("build-x").unwrap().write(b"later\n");
        assert_eq!(
            frame(&mut rx),
            json!({"event": "terminalOutput", "data": {"terminalName": "build-x", "data": "later\r\n"}})
        );
    }

    #[tokio::test]
    async fn disconnect_detaches_writers_everywhere() {
        let state = state_with(ServerConfig::default());
        let (conn, mut rx) = state.connections.open();
        conn.set_user(Some(ADMIN_USER_ID));
        call(&state, &conn, &mut rx, 1, "subscribeTerminal", json!(["a"])).await;
        call(&state, &conn, &mut rx, 2, "subscribeTerminal", json!(["b"])).await;

        state.connections.finish(&conn);
        assert_eq!(state.terminals.get("a").unwrap().writer_count(), 0);
        assert_eq!(state.terminals.get("b").unwrap().writer_count(), 0);
    }

    #[test]
    fn writer_for_dropped_connection_is_inert() {
        let state = state_with(ServerConfig::default());
        let (conn, rx) = state.connections.open();
        let writer = terminal_writer(&conn, "t");
        state.connections.finish(&conn);
        drop(conn);
        drop(rx);
        // Must not panic or resurrect anything
        writer(&b"late output"[..]);
        assert_eq!(state.connections.connection_count(), 0);
    }

    #[tokio::test]
    async fn input_to_missing_terminal_is_reported() {
        let state = state_with(ServerConfig::default());
        let (conn, mut rx) = state.connections.open();
        conn.set_user(Some(ADMIN_USER_ID));

        let data = call(&state, &conn, &mut rx, 1, "terminalInput", json!(["ghost", "ls\r"])).await;
        assert_eq!(data["msg"], "terminalNotFound");
        let data = call(&state, &conn, &mut rx, 2, "closeTerminal", json!(["ghost"])).await;
        assert_eq!(data["msg"], "terminalNotFound");
    }

    #[tokio::test]
    async fn unknown_task_is_reported() {
        let state = state_with(ServerConfig::default());
        let (conn, mut rx) = state.connections.open();
        conn.set_user(Some(ADMIN_USER_ID));
        let data = call(&state, &conn, &mut rx, 1, "runTask", json!(["deploy"])).await;
        assert_eq!(data, json!({"ok": false, "msg": "taskNotFound", "msgI18n": true}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn piped_task_streams_to_early_subscriber_and_reports_exit() {
        let config = ServerConfig {
            tasks: vec![TaskConfig {
                name: "greet".into(),
                command: "sh".into(),
                args: vec!["-c".into(), "echo hi; exit 3".into()],
                working_dir: None,
                pty: false,
            }],
            ..Default::default()
        };
        let state = state_with(config);
        let (conn, mut rx) = state.connections.open();
        conn.set_user(Some(ADMIN_USER_ID));

        // Subscribe before the task exists; recreate carries the writer over
        call(&state, &conn, &mut rx, 1, "subscribeTerminal", json!(["greet"])).await;

        state
            .connections
            .dispatch(&conn, Request::new("runTask", json!(["greet"])).with_id(2))
            .unwrap()
            .await
            .unwrap();

        let mut output = String::new();
        let mut finished = None;
        let mut ack = None;
        while let Ok(Message::Text(text)) = rx.try_recv() {
            let f: Value = serde_json::from_str(text.as_str()).unwrap();
            match f.get("event").and_then(Value::as_str) {
                Some("terminalOutput") => output.push_str(f["data"]["data"].as_str().unwrap()),
                Some("taskFinished") => finished = Some(f["data"].clone()),
                _ => ack = Some(f),
            }
        }

        assert_eq!(output, "hi\r\n");
        assert_eq!(finished.unwrap()["code"], 3);
        assert_eq!(ack.unwrap(), json!({"id": 2, "data": {"ok": false, "code": 3}}));
    }
}
