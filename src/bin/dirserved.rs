//! Demonstration driver for `dirserve`. Wire transport is out of scope
//! (spec.md §1 Non-goals), so this binary is not a network listener: it
//! boots a [`server::Server`] for the configured server user, runs a
//! self-check (`make_root` plus a `watch-current` of its own `Group`
//! subtree), logs readiness, and idles until it receives a shutdown
//! signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dirserve::config::Config;
use dirserve::content::MemoryContentStore;
use dirserve::event::{EventManager, WATCH_CURRENT};
use dirserve::path;
use dirserve::server::Server;
use dirserve::store::Store;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dirserved", about = "In-memory directory server demonstration driver")]
struct Args {
    /// Path to a TOML config file (see `dirserve::config::Config`).
    #[arg(long)]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = Config::load(&args.config)?;
    tracing::info!(server_user = %config.server_user, "loading configuration");

    let content = Arc::new(MemoryContentStore::new());
    let events = EventManager::spawn(config.watch_deadline());
    let store = Arc::new(Store::new(content, events));

    let server = Server::start(store, config.server_user.clone(), config.gate_retry_backoff()).await?;
    tracing::info!(server_user = server.server_user(), "server started");

    self_check(&server).await?;
    tracing::info!("self-check passed, server ready");

    shutdown_signal().await;
    tracing::info!("shutdown signal received, exiting");
    Ok(())
}

/// Exercise `make_root` and `watch-current` against the server's own tree
/// before declaring readiness, so a misconfigured `server_user` or a dead
/// event manager task fails fast at startup rather than on first real use.
async fn self_check(server: &Server) -> Result<(), Box<dyn std::error::Error>> {
    let group_dir = path::parse(&format!("{}/Group", server.server_user()))?;
    match server.make_directory(server.server_user(), group_dir.clone(), dirserve::store::entry::SEQ_NOT_EXIST).await {
        Ok(_) => {}
        Err(e) if e.kind() == dirserve::error::Kind::Exist => {}
        Err(e) => return Err(e.into()),
    }

    let mut sub = server.watch(server.server_user().to_string(), group_dir, WATCH_CURRENT).await?;
    drop(sub.recv().await);
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
