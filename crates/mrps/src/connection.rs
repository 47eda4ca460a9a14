use crate::error::MrpsError;
use crate::handshake::{self, Session};
use crate::metrics::{counters, gauges, histograms};
use crate::registry::ConnHandle;
use crate::router::{self, Outcome};
use crate::server::{ConnIdLease, ServerState};
use crate::transport;
use mrp_common::crypto::{StreamDecoder, StreamEncoder};
use mrp_common::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Capacity of a connection's outbound queue. Relays to a full queue are
/// dropped.
const OUTBOUND_QUEUE: usize = 64;

/// Removes the registry entry when the worker ends, however it ends.
struct RegistryEntry {
    state: Arc<ServerState>,
    id: u32,
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        self.state.registry.delete_connection(self.id);
        gauges::dec_connections_active();
    }
}

/// Time of the last successful read or write, shared by both halves.
struct Activity {
    origin: Instant,
    elapsed_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.elapsed_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_deadline(&self, idle: Duration) -> Instant {
        self.origin + Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed)) + idle
    }
}

/// Serves one accepted socket from handshake to close.
///
/// The registry entry is purged before the connection id goes back to the
/// pool.
pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    lease: ConnIdLease,
    state: Arc<ServerState>,
) -> Result<(), MrpsError> {
    let conn_id = lease.id();
    let _ = stream.set_nodelay(true);

    let session = match handshake::perform(
        &mut stream,
        &state.signing_key,
        &state.kx,
        state.config.idle_timeout(),
    )
    .await
    {
        Ok(session) => {
            counters::admissions_total("admitted");
            session
        }
        Err(e) => {
            counters::admissions_total("handshake_failed");
            return Err(e);
        }
    };
    let Session { encoder, decoder } = session;

    let (handle, outbound) = ConnHandle::new(OUTBOUND_QUEUE);
    state.registry.add_connection(conn_id, handle.clone());
    gauges::inc_connections_active();
    let entry = RegistryEntry {
        state: Arc::clone(&state),
        id: conn_id,
    };
    debug!(conn_id, "session established");

    let activity = Arc::new(Activity::new());
    let (reader, writer) = stream.into_split();
    let mut writer_task = tokio::spawn(write_loop(
        writer,
        encoder,
        outbound,
        Arc::clone(&handle.closer),
        Arc::clone(&activity),
        state.config.idle_timeout(),
        state.config.part_timeout(),
    ));

    let result = read_loop(reader, decoder, &state, conn_id, &handle, &activity).await;

    drop(entry);
    drop(handle);
    // The writer flushes queued replies and exits once every sender is gone.
    let flush_limit = state.config.idle_timeout() + state.config.part_timeout();
    if !join_or_abort(&mut writer_task, flush_limit).await {
        debug!(conn_id, "writer did not finish in time");
    }

    match result {
        Ok(Outcome::Shutdown) => {
            state.request_shutdown();
            Ok(())
        }
        Ok(outcome) => {
            debug!(conn_id, ?outcome, "connection finished");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    mut decoder: StreamDecoder,
    state: &ServerState,
    conn_id: u32,
    handle: &ConnHandle,
    activity: &Activity,
) -> Result<Outcome, MrpsError> {
    let idle = state.config.idle_timeout();
    let part = state.config.part_timeout();
    let mut replies = Vec::new();

    loop {
        // The idle deadline moves with writes too, so it is enforced here
        // rather than inside the read.
        let read = transport::read_frame(&mut reader, Duration::MAX, part);
        tokio::pin!(read);
        let frame = loop {
            tokio::select! {
                () = handle.closer.notified() => return Err(MrpsError::ConnectionClosed),
                frame = &mut read => break frame?,
                () = tokio::time::sleep_until(activity.idle_deadline(idle)) => {
                    if activity.idle_deadline(idle) <= Instant::now() {
                        return Err(MrpsError::Timeout("idle"));
                    }
                }
            }
        };
        activity.touch();
        let started = Instant::now();

        let plain = decoder.decrypt(&frame)?;
        let outcome = match Message::unpack(&plain) {
            Ok(message) => router::route(state, conn_id, message, &mut replies).await,
            Err(e) => {
                debug!(conn_id, "malformed message: {}", e);
                state.registry.delete_connection(conn_id);
                replies.push(router::malformed_reply(state));
                Outcome::FinishWithError
            }
        };

        for reply in replies.drain(..) {
            if handle.tx.send(reply).await.is_err() {
                return Err(MrpsError::ConnectionClosed);
            }
        }
        histograms::frame_latency_seconds(started.elapsed().as_secs_f64());

        if outcome.closes() {
            return Ok(outcome);
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut encoder: StreamEncoder,
    mut outbound: mpsc::Receiver<Message>,
    closer: Arc<Notify>,
    activity: Arc<Activity>,
    idle: Duration,
    part: Duration,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = transport::send(&mut writer, &mut encoder, &message, idle, part).await {
            debug!("send failed: {}", e);
            closer.notify_one();
            return;
        }
        activity.touch();
    }
    let _ = writer.shutdown().await;
}

/// Waits up to `limit` for the writer, aborting it if it is still running.
/// Returns `true` if it finished on its own.
async fn join_or_abort(task: &mut JoinHandle<()>, limit: Duration) -> bool {
    if tokio::time::timeout(limit, &mut *task).await.is_ok() {
        return true;
    }
    task.abort();
    false
}
