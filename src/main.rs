/*
 * Copyright (c) 2026 DoppelDB contributors. All rights reserved.
 *
 * DoppelDB - MongoDB wire-compatible proxy over relational storage
 *
 * @file main.rs
 * @brief CLI entry point: `run` (default) and `ping`
 */

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bson::doc;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

use doppeldb::authentication::UserStore;
use doppeldb::backend::Backend;
use doppeldb::command_processor::{CommandRegistry, ServerContext};
use doppeldb::config::{Config, Mode, TelemetryState};
use doppeldb::cursor_registry::CursorRegistry;
use doppeldb::postgres_backend::PostgresBackend;
use doppeldb::session_registry::SessionRegistry;
use doppeldb::sqlite_backend::SqliteBackend;
use doppeldb::state::StateStore;
use doppeldb::wire_protocol::{self, OpMsg, OP_MSG};
use doppeldb::{capped_janitor, health, logger, Server, ShutdownManager};

#[derive(Parser, Debug)]
#[command(
    name = "doppeldb",
    version,
    about = "MongoDB wire-compatible proxy executing command semantics on PostgreSQL or SQLite"
)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[arg(long = "listen-addr")]
    listen_addr: Option<String>,
    #[arg(long = "listen-unix")]
    listen_unix: Option<String>,
    #[arg(long = "listen-tls")]
    listen_tls: bool,
    #[arg(long = "listen-tls-cert-file")]
    listen_tls_cert_file: Option<String>,
    #[arg(long = "listen-tls-key-file")]
    listen_tls_key_file: Option<String>,
    #[arg(long = "listen-tls-ca-file")]
    listen_tls_ca_file: Option<String>,

    #[arg(long = "proxy-addr")]
    proxy_addr: Option<String>,
    /// normal | proxy | diff-normal | diff-proxy
    #[arg(long)]
    mode: Option<String>,

    #[arg(long = "postgresql-url", env = "DOPPELDB_POSTGRESQL_URL")]
    postgresql_url: Option<String>,
    #[arg(long = "sqlite-url", env = "DOPPELDB_SQLITE_URL")]
    sqlite_url: Option<String>,

    #[arg(long = "state-dir")]
    state_dir: Option<String>,
    #[arg(long = "repl-set-name")]
    repl_set_name: Option<String>,
    #[arg(long)]
    auth: bool,
    #[arg(long = "log-level")]
    log_level: Option<String>,
    #[arg(long = "log-format")]
    log_format: Option<String>,
    /// enabled | disabled | undecided
    #[arg(long)]
    telemetry: Option<String>,
    #[arg(long = "debug-addr")]
    debug_addr: Option<String>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the server (the default when no sub-command is given)
    #[command(hide = true)]
    Run,
    /// Probe a running server with a wire-protocol ping
    Ping,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match build_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("doppeldb: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Some(Cmd::Ping) => ping(&config).await,
        _ => run(config).await,
    };
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("doppeldb: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(v) = &cli.listen_addr {
        config.listen.addr = v.clone();
    }
    if cli.listen_unix.is_some() {
        config.listen.unix = cli.listen_unix.clone();
    }
    if cli.listen_tls {
        config.listen.tls = true;
    }
    if cli.listen_tls_cert_file.is_some() {
        config.listen.tls_cert_file = cli.listen_tls_cert_file.clone();
    }
    if cli.listen_tls_key_file.is_some() {
        config.listen.tls_key_file = cli.listen_tls_key_file.clone();
    }
    if cli.listen_tls_ca_file.is_some() {
        config.listen.tls_ca_file = cli.listen_tls_ca_file.clone();
    }
    if cli.proxy_addr.is_some() {
        config.proxy.addr = cli.proxy_addr.clone();
    }
    if let Some(mode) = &cli.mode {
        config.mode = mode.parse::<Mode>().map_err(anyhow::Error::msg)?;
    }
    if cli.postgresql_url.is_some() {
        config.backend.postgresql_url = cli.postgresql_url.clone();
    }
    if cli.sqlite_url.is_some() {
        config.backend.sqlite_url = cli.sqlite_url.clone();
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    if cli.repl_set_name.is_some() {
        config.repl_set_name = cli.repl_set_name.clone();
    }
    if cli.auth {
        config.auth = true;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    if let Some(telemetry) = &cli.telemetry {
        config.telemetry = telemetry
            .parse::<TelemetryState>()
            .map_err(anyhow::Error::msg)?;
    }
    if cli.debug_addr.is_some() {
        config.debug_addr = cli.debug_addr.clone();
    }
    if config.state_dir.is_empty() {
        config.state_dir = ".".to_string();
    }

    if matches!(cli.command, Some(Cmd::Ping)) {
        // The probe only needs an address; backend validation is the
        // server's business.
        return Ok(config);
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: Config) -> anyhow::Result<()> {
    logger::init(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "DoppelDB starting");

    let state = StateStore::open(std::path::Path::new(&config.state_dir), config.telemetry)
        .context("failed to open state directory")?;
    info!(uuid = %state.get().uuid, "instance state loaded");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let backend: Arc<dyn Backend> = match (&config.backend.postgresql_url, &config.backend.sqlite_url)
    {
        (Some(url), _) => {
            info!(url = %logger::redact_url(url), "connecting to PostgreSQL backend");
            Arc::new(
                PostgresBackend::connect(url, config.backend.pool_size)
                    .await
                    .context("PostgreSQL backend initialization failed")?,
            )
        }
        (None, Some(url)) => {
            info!(url = %logger::redact_url(url), "opening SQLite backend");
            Arc::new(SqliteBackend::open(url).context("SQLite backend initialization failed")?)
        }
        (None, None) => unreachable!("validated at startup"),
    };

    let users = UserStore::from_config(&config.users).context("invalid user configuration")?;
    if config.auth && users.is_empty() {
        warn!("authentication is enabled but no users are configured");
    }

    let config = Arc::new(config);
    let ctx = Arc::new(ServerContext {
        config: config.clone(),
        backend: backend.clone(),
        cursors: Arc::new(CursorRegistry::new(Duration::from_secs(
            config.cursors.idle_timeout_secs,
        ))),
        sessions: Arc::new(SessionRegistry::new()),
        users: Arc::new(users),
        registry: CommandRegistry::new(),
        start_time: Instant::now(),
        connections_current: AtomicI64::new(0),
        connections_total: AtomicU64::new(0),
    });

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    if let Some(debug_addr) = &config.debug_addr {
        let addr = debug_addr
            .parse()
            .context("invalid debug-addr")?;
        health::spawn(addr, prometheus, shutdown.subscribe());
    }

    tokio::spawn(capped_janitor::cursor_expiry(
        ctx.cursors.clone(),
        config.cursors.tick_interval_secs,
        shutdown.subscribe(),
    ));
    tokio::spawn(capped_janitor::run(
        backend,
        config.capped_cleanup.clone(),
        shutdown.subscribe(),
    ));

    let server = Server::bind(ctx.clone()).await?;
    server.run(&shutdown).await;

    // Listener is closed; destroy what is left and let the pool drop.
    ctx.cursors.kill_all();
    ctx.sessions.kill_all();
    info!("shutdown complete");
    Ok(())
}

async fn ping(config: &Config) -> anyhow::Result<()> {
    let addr = &config.listen.addr;
    let mut stream = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(addr))
        .await
        .context("connect timed out")?
        .with_context(|| format!("cannot connect to {}", addr))?;

    let cmd = doc! {"ping": 1, "$db": "admin"};
    let bytes = wire_protocol::encode_op_msg(&cmd, 1, 0)?;
    stream.write_all(&bytes).await?;

    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        wire_protocol::read_message(&mut stream),
    )
    .await
    .context("ping timed out")??;

    let (header, payload) = reply.context("server closed the connection")?;
    anyhow::ensure!(header.op_code == OP_MSG, "unexpected opcode {}", header.op_code);
    let doc = OpMsg::parse(&payload)?.into_command();
    anyhow::ensure!(
        doc.get_f64("ok").unwrap_or(0.0) == 1.0,
        "ping failed: {:?}",
        doc
    );
    println!("ok: pinged {}", addr);
    Ok(())
}
