//! repl-gateway CLI.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gate_protocol::descriptor;
use rgw::http::router;
use rgw::{BrokerConfig, BrokerContext};
use rgw_auth::{load_security_config, SecurityConfig};

#[derive(Parser)]
#[command(name = "repl-gateway", version, about = "Broker exposing interpreter sessions over MCP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker.
    Serve {
        /// Port to listen on; overrides the security config.
        #[arg(long, env = "RGW_PORT")]
        port: Option<u16>,

        /// Bind address.
        #[arg(long, env = "RGW_BIND", default_value = "127.0.0.1")]
        bind: IpAddr,

        /// Security configuration file.
        #[arg(long, env = "RGW_SECURITY_CONFIG")]
        config: Option<PathBuf>,

        /// Gate descriptor directory.
        #[arg(long, env = "RGW_GATES_DIR")]
        gates_dir: Option<PathBuf>,

        /// Retention window for persisted MCP sessions, in days.
        #[arg(long, env = "RGW_SESSION_RETENTION_DAYS", default_value_t = 30)]
        session_retention_days: u64,
    },
    /// Print the live gate sessions found in the descriptor directory.
    Status {
        /// Gate descriptor directory.
        #[arg(long, env = "RGW_GATES_DIR")]
        gates_dir: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RGW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            bind,
            config,
            gates_dir,
            session_retention_days,
        } => serve(port, bind, config, gates_dir, session_retention_days).await,
        Command::Status { gates_dir } => {
            status(gates_dir.unwrap_or_else(descriptor::default_gates_dir));
            Ok(())
        }
    }
}

async fn serve(
    port: Option<u16>,
    bind: IpAddr,
    security_path: Option<PathBuf>,
    gates_dir: Option<PathBuf>,
    session_retention_days: u64,
) -> anyhow::Result<()> {
    let security = match &security_path {
        Some(path) => load_security_config(path)
            .with_context(|| format!("loading security config {}", path.display()))?,
        None => SecurityConfig::default(),
    };

    let mut config = BrokerConfig::default();
    config.bind_addr = bind;
    config.port = port.unwrap_or(security.port);
    if let Some(dir) = gates_dir {
        config.gates_dir = dir;
    }
    config.session_retention = Duration::from_secs(session_retention_days * 24 * 60 * 60);

    let addr = SocketAddr::new(config.bind_addr, config.port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "could not bind");
            std::process::exit(1);
        }
    };

    let ctx = BrokerContext::new(config, security);
    ctx.start_background();
    info!(%addr, gates_dir = %ctx.config.gates_dir.display(), "repl-gateway listening");

    let app = router(Arc::clone(&ctx));
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await
    .context("http server failed")?;

    ctx.shutdown().await;
    info!("repl-gateway stopped");
    Ok(())
}

fn status(gates_dir: PathBuf) {
    let descriptors = rgw::broker::discovery::scan(&gates_dir);
    if descriptors.is_empty() {
        println!("no live gate sessions in {}", gates_dir.display());
        return;
    }
    for d in descriptors {
        println!(
            "{}  {:<20} pid {:<8} {}  {}",
            d.short_key(),
            d.name,
            d.pid,
            d.interpreter_version,
            d.project_path,
        );
    }
}
