#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use base64::Engine;
use clap::Parser;
use ed25519_dalek::SigningKey;
use mrps::config::{Args, ServerConfig};
use mrps::metrics::start_metrics_server;
use mrps::password::PasswordHasher;
use mrps::run_with_shutdown;
use mrps::server::ServerState;
use mrps::store::MemoryStore;
use rand::rngs::OsRng;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let keypair_path = args.keypair.clone();
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let signing_key = if let Some(ref path) = keypair_path {
        load_keypair(path)?
    } else {
        generate_keypair()
    };
    let pubkey = signing_key.verifying_key().to_bytes();
    info!(
        "server public key: {}",
        base64::engine::general_purpose::STANDARD.encode(pubkey)
    );

    if config.admin_password == "admin" {
        warn!("admin account uses the default password");
    }
    let hasher = PasswordHasher::new(config.hash_memory_kib, config.hash_iterations)
        .map_err(|e| anyhow::anyhow!("invalid password hashing cost: {}", e))?;
    let store = MemoryStore::new(config.max_users, hasher, config.admin_password.as_bytes())
        .context("failed to seed the user directory")?;

    let state = Arc::new(ServerState::new(config.clone(), signing_key, Arc::new(store)));

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("bound to {}", config.listen);

    tokio::spawn({
        let metrics_addr = config.metrics_addr;
        let health_state = state.health.clone();
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    run_with_shutdown(listener, state, ctrl_c).await?;
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_keypair(path: &Path) -> Result<SigningKey> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path)?;
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            anyhow::bail!(
                "keypair file permissions too open: {:o}. Expected 0600",
                mode
            );
        }
    }

    let data = Zeroizing::new(std::fs::read(path)?);
    if data.len() < 32 {
        anyhow::bail!("keypair file too short, expected at least 32 bytes");
    }
    let mut seed = Zeroizing::new([0u8; 32]);
    seed.copy_from_slice(&data[..32]);
    let signing_key = SigningKey::from_bytes(&seed);
    info!("loaded keypair from {}", path.display());
    Ok(signing_key)
}

fn generate_keypair() -> SigningKey {
    let signing_key = SigningKey::generate(&mut OsRng);
    warn!("using ephemeral keypair (not persisted)");
    signing_key
}
