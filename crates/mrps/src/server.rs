use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::MrpsError;
use crate::handshake;
use crate::id_pool::IdPool;
use crate::metrics::{counters, HealthState};
use crate::registry::Registry;
use crate::store::Store;
use crate::token::TokenCipher;
use ed25519_dalek::SigningKey;
use mrp_common::crypto::{self, KeyPair};
use mrp_common::types::Token;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How often the registry is scanned for connections past their lifetime.
pub const LIFETIME_WATCH_PERIOD: Duration = Duration::from_millis(100);

/// Shared state for the relay server.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Live connections and their bound users.
    pub registry: Registry,
    /// Connection id allocator; its capacity is the connection limit.
    pub conn_ids: IdPool,
    /// User directory and buffered messages.
    pub store: Arc<dyn Store>,
    /// Ed25519 key signing the handshake.
    pub signing_key: SigningKey,
    /// Static key exchange key pair for this process.
    pub kx: KeyPair,
    /// Mints and opens client session tokens.
    pub tokens: TokenCipher,
    /// Token carried by every server-originated message.
    pub server_token: Token,
    /// Readiness reported on the metrics endpoint.
    pub health: HealthState,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerState {
    /// Builds the state with fresh per-process key exchange and token keys.
    #[must_use]
    pub fn new(config: ServerConfig, signing_key: SigningKey, store: Arc<dyn Store>) -> Self {
        let server_token = crypto::server_token(&signing_key);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: Registry::new(config.lifetime()),
            conn_ids: IdPool::new(config.max_conns),
            config,
            store,
            signing_key,
            kx: KeyPair::generate(),
            tokens: TokenCipher::generate(),
            server_token,
            health: HealthState::new(),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Returns `true` once shutdown began; every further request is refused.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Refuses every further request without stopping the accept loop yet.
    pub fn mark_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Refuses further requests and stops the accept loop.
    pub fn request_shutdown(&self) {
        self.mark_shutting_down();
        self.shutdown_tx.send_replace(true);
    }
}

/// Gives a connection id back to the pool when dropped.
pub(crate) struct ConnIdLease {
    state: Arc<ServerState>,
    id: u32,
}

impl ConnIdLease {
    fn take(state: &Arc<ServerState>) -> Option<Self> {
        let id = state.conn_ids.take()?;
        Some(Self {
            state: Arc::clone(state),
            id,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for ConnIdLease {
    fn drop(&mut self) {
        self.state.conn_ids.give_back(self.id);
    }
}

/// Runs the server until an admin shuts it down.
///
/// # Errors
///
/// Returns an error if the listener has no local address.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), MrpsError> {
    run_with_shutdown(listener, state, std::future::pending()).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// The loop stops when `signal` completes or an admin requests shutdown,
/// then waits up to the configured drain timeout for in-flight connections.
///
/// # Errors
///
/// Returns an error if the listener has no local address.
pub async fn run_with_shutdown<F>(
    listener: TcpListener,
    state: Arc<ServerState>,
    signal: F,
) -> Result<(), MrpsError>
where
    F: Future<Output = ()>,
{
    let local_addr = listener.local_addr().map_err(MrpsError::Io)?;
    info!("server listening on {}", local_addr);
    state.health.mark_ready();

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let watcher = tokio::spawn(watch_lifetimes(Arc::clone(&state)));
    let mut tasks = JoinSet::new();
    tokio::pin!(signal);

    while !state.is_shutting_down() {
        // The id is taken before accepting so a full server still answers.
        let lease = ConnIdLease::take(&state);

        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => match lease {
                        Some(lease) => {
                            debug!(conn_id = lease.id(), "accepted {}", addr);
                            let state = Arc::clone(&state);
                            tasks.spawn(async move {
                                if let Err(e) = handle_connection(stream, lease, state).await {
                                    debug!("connection from {} closed: {}", addr, e);
                                }
                            });
                        }
                        None => {
                            warn!("max connections reached, rejecting {}", addr);
                            counters::admissions_total("rejected_full");
                            tasks.spawn(refuse(stream, Arc::clone(&state)));
                        }
                    },
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = shutdown_rx.changed() => {}
            () = &mut signal => {
                info!("received shutdown signal");
                state.request_shutdown();
            }
        }
    }

    state.health.mark_draining();
    info!("shutdown signal received, draining {} connections", tasks.len());
    let drain_timeout = Duration::from_secs(state.config.drain_timeout);
    let drained = tokio::time::timeout(drain_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            tasks.len()
        );
        tasks.shutdown().await;
    }

    watcher.abort();
    info!("server shut down gracefully");
    Ok(())
}

async fn refuse(mut stream: TcpStream, state: Arc<ServerState>) {
    if let Err(e) = handshake::reject(&mut stream, &state.signing_key, state.config.part_timeout()).await {
        debug!("rejection not delivered: {}", e);
    }
}

/// Wakes every connection past its lifetime so its reader closes it.
async fn watch_lifetimes(state: Arc<ServerState>) {
    let mut ticker = tokio::time::interval(LIFETIME_WATCH_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        state.registry.check_connection_timeouts(|conn_id, handle| {
            debug!(conn_id, "connection lifetime exceeded");
            handle.closer.notify_one();
        });
    }
}
