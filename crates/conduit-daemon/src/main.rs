//! conduit-daemon binary: serve the channel with a demo registry.
//!
//! Thin process wrapper around [`conduit_daemon::Server`]: argument
//! parsing, logging setup, key loading (with first-run generation for the
//! server key), and ctrl-c shutdown. The registered operations are demo
//! probes; real deployments embed the daemon crate and register their own.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use conduit_core::identity::KeyPair;
use conduit_core::wire::CapabilityLevel;
use conduit_daemon::{AuthorizedKeys, CommandRegistry, Server, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "conduit-daemon", about = "Conduit remote-execution daemon")]
struct Args {
    /// Listen address.
    #[arg(long, default_value = conduit_daemon::DEFAULT_BIND_ADDR)]
    bind: String,

    /// Server identity key file; generated on first run if absent.
    #[arg(long)]
    key: PathBuf,

    /// Registered client keys (JSON array of public keys and rights).
    #[arg(long)]
    authorized_keys: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let keypair = if args.key.exists() {
        KeyPair::load(&args.key)
            .with_context(|| format!("loading server key {}", args.key.display()))?
    } else {
        info!(path = %args.key.display(), "generating server identity key");
        let keypair = KeyPair::generate();
        keypair
            .save(&args.key)
            .with_context(|| format!("saving server key {}", args.key.display()))?;
        keypair
    };

    let keys = AuthorizedKeys::load(&args.authorized_keys).with_context(|| {
        format!(
            "loading authorized keys {}",
            args.authorized_keys.display()
        )
    })?;

    let mut registry = CommandRegistry::new();
    registry.register_fn(
        "server.info",
        CapabilityLevel::Restricted,
        |_ctx, _args| async move {
            Ok(serde_json::json!({
                "server": concat!("conduit-daemon/", env!("CARGO_PKG_VERSION")),
            }))
        },
    );
    registry.register_fn("echo", CapabilityLevel::Restricted, |_ctx, args| async move {
        Ok(args)
    });
    registry.register_fn("admin.echo", CapabilityLevel::Full, |_ctx, args| async move {
        Ok(args)
    });

    let server = Server::bind(ServerConfig::new(&args.bind), keypair, keys, registry)
        .await
        .context("binding server")?;

    tokio::select! {
        result = server.run() => result.context("serving connections")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
