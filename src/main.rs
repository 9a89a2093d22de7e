//! formsync: real-time collaborative form filling server.
//!
//! Clients connect over WebSocket, join forms, and see each other's field
//! edits live. Every edit is persisted before it is shown to anyone else.
//!
//! Usage:
//!   formsync                                   # Port 3001, in-memory store
//!   formsync --store sqlite                    # Persist to ~/.local/share/formsync/fields.db
//!   formsync --store postgres --database-url postgres://...
//!   formsync --auth                            # Require a random shared token
//!   formsync --token mysecret                  # Require a given token

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use formsync_server::{CollaborationGateway, GatewayConfig};
use formsync_store::{FieldStore, MemoryFieldStore, PostgresFieldStore, SqliteFieldStore};
use formsync_transport::{AuthConfig, TransportConfig, TransportServer};
use secrecy::{ExposeSecret, SecretString};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Parser, Debug)]
#[command(name = "formsync", about = "Real-time collaborative form sync server")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Where field values are persisted
    #[arg(long, value_enum, default_value = "memory")]
    store: StoreKind,

    /// SQLite database file (defaults to <data dir>/formsync/fields.db)
    #[arg(long)]
    sqlite_path: Option<PathBuf>,

    /// PostgreSQL connection string
    #[arg(long)]
    database_url: Option<String>,

    /// Require this shared token in the handshake
    #[arg(long)]
    token: Option<String>,

    /// Require a shared token, generated at startup unless --token is given
    #[arg(long)]
    auth: bool,

    /// Origin allowed by CORS (repeatable)
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "256")]
    max_connections: usize,

    /// Events buffered per connection before deliveries are dropped
    #[arg(long, default_value = "256")]
    outbox_capacity: usize,

    /// Give up on a field write after this many milliseconds
    #[arg(long, default_value = "5000")]
    persist_timeout_ms: u64,

    /// Ping interval in seconds (0 disables heartbeats)
    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if let Some(ref log_path) = cli.log_file {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", log_path.display());
                std::process::exit(1);
            }
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Shared token for the handshake, if one is required.
fn resolve_token(cli: &Cli) -> Option<SecretString> {
    match (&cli.token, cli.auth) {
        (Some(token), _) => Some(SecretString::from(token.clone())),
        (None, true) => {
            use rand::Rng;
            let bytes: [u8; 32] = rand::rng().random();
            Some(SecretString::from(hex::encode(bytes)))
        }
        (None, false) => None,
    }
}

fn default_sqlite_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("formsync/fields.db")
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.store {
        StoreKind::Memory => run(MemoryFieldStore::new(), cli).await,
        StoreKind::Sqlite => {
            let path = cli.sqlite_path.clone().unwrap_or_else(default_sqlite_path);
            match SqliteFieldStore::open(&path) {
                Ok(store) => {
                    info!("Field values stored in {}", path.display());
                    run(store, cli).await
                }
                Err(e) => {
                    error!("Failed to open SQLite store at {}: {e}", path.display());
                    std::process::exit(1);
                }
            }
        }
        StoreKind::Postgres => {
            let Some(url) = cli.database_url.clone().map(SecretString::from) else {
                error!("--store postgres requires --database-url");
                std::process::exit(1);
            };
            match PostgresFieldStore::connect(url.expose_secret()).await {
                Ok(store) => run(store, cli).await,
                Err(e) => {
                    error!("Failed to connect to PostgreSQL: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

async fn run<S: FieldStore>(store: S, cli: Cli) {
    let gateway = Arc::new(CollaborationGateway::new(
        Arc::new(store),
        GatewayConfig {
            persist_timeout: Duration::from_millis(cli.persist_timeout_ms),
            ..Default::default()
        },
    ));

    if let Err(e) = gateway.initialize().await {
        error!("Failed to initialize field store: {e}");
        std::process::exit(1);
    }

    let token = resolve_token(&cli);
    // A generated token has to be shown in full or nobody can connect.
    let token_hint = token.as_ref().map(|t| match cli.token {
        Some(_) => "(as given)".to_string(),
        None => t.expose_secret().to_string(),
    });

    let transport_config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        auth: token.map(|token| AuthConfig {
            token,
            handshake_timeout: Duration::from_secs(10),
        }),
        cors_origins: cli.cors_origins.clone(),
        max_connections: Some(cli.max_connections),
        outbox_capacity: cli.outbox_capacity,
        heartbeat_interval: (cli.heartbeat_secs > 0).then(|| Duration::from_secs(cli.heartbeat_secs)),
    };

    let mut transport = match TransportServer::start(transport_config, gateway.clone()).await {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to start transport: {e}");
            std::process::exit(1);
        }
    };

    println!();
    println!("  formsync {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  WebSocket:  ws://{}:{}/ws", cli.hostname, transport.port());
    println!("  Health:     http://{}:{}/health", cli.hostname, transport.port());
    println!("  Store:      {}", gateway.store().backend());
    match token_hint {
        Some(hint) => println!("  Auth token: {hint}"),
        None => println!("  Auth:       disabled"),
    }
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {e}");
    }

    println!("  Shutting down...");
    transport.stop().await;
    gateway.shutdown();
    println!("  Server stopped.");
}
