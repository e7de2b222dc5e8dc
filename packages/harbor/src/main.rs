use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use harbor::{AppState, FileConfig, HarborDirs, ServerConfig, build_router, load_config};

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Event socket server with live terminal streaming")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.harbor)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Serve(ServeArgs),

    /// Read a password from stdin and print its argon2 hash for `[auth].password_hash`
    HashPassword,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::HashPassword) => hash_password_command(),
        Some(Commands::Serve(args)) => run_server(args, cli.data_dir).await,
        None => run_server(ServeArgs::default(), cli.data_dir).await,
    }
}

fn hash_password_command() -> Result<()> {
    eprint!("Password: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }
    println!("{}", harbor::auth::hash_password(password)?);
    Ok(())
}

async fn run_server(args: ServeArgs, data_dir: Option<PathBuf>) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "harbor=debug,terminal_hub=debug,tower_http=debug,info"
    } else {
        "harbor=info,terminal_hub=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Harbor");

    let dirs = HarborDirs::new(data_dir)?;
    let mut file_config: FileConfig = load_config(&dirs.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", dirs.config_toml_path().display()))?;

    // CLI flags win over config.toml and env
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }

    let config = ServerConfig::from_file(&file_config)?;
    if config.auth.password_hash.is_none() {
        info!("No password hash configured; logins will be refused (see `harbor hash-password`)");
    }
    info!(
        "Socket config: max_message={}KB, write_timeout={:?}, tasks={}",
        config.websocket.max_message_bytes / 1024,
        config.websocket.write_timeout,
        config.tasks.len()
    );

    let bind_addr = config.bind_addr;
    let state = AppState::new(config);
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Harbor listening on http://{}", actual_addr);
    info!("  GET /socket      - event WebSocket");
    info!("  GET /health      - health status");
    info!("  GET /metrics     - server metrics");

    let shutdown_state = state.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
        // Open sockets would otherwise hold graceful shutdown forever
        shutdown_state.connections.close_all();
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Stopping terminals...");
    let terminals = state.terminals.len();
    state.shutdown();
    info!("Closed {} terminals", terminals);

    info!("Shutdown complete");
    server_result
}
