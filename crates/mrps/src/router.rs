//! Per-connection state machine and command dispatch.
//!
//! [`route`] authorizes one decoded message, performs the command and
//! collects the replies for the calling connection into `out`. Messages for
//! other connections go straight to their outbound queues.

use crate::metrics::counters;
use crate::registry::ConnState;
use crate::server::ServerState;
use crate::store::{MessageQuery, Password, User, Username};
use mrp_common::crypto::unix_now_millis;
use mrp_common::frame::{UserInfo, USER_INFOS_PER_MESSAGE, USER_INFO_SIZE};
use mrp_common::types::{flag, sentinel, EMPTY_TOKEN, MIN_CREDENTIAL_SIZE, PASSWORD_SIZE, USERNAME_SIZE};
use mrp_common::Message;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

const CREDENTIALS_SIZE: usize = USERNAME_SIZE + PASSWORD_SIZE;
const FETCH_TO_ME: u8 = 0;
const FETCH_FROM_USER: u8 = 1;
const FETCH_HEAD_SIZE: usize = 1 + 8;
const FETCH_MARKER_SIZE: usize = FETCH_HEAD_SIZE + 4;

/// What the connection worker does after a message was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep reading.
    Continue,
    /// The client asked to close.
    Finish,
    /// Close after an error reply.
    FinishWithError,
    /// Close after registration; the client logs in on a new connection.
    FinishToReconnect,
    /// Close, then stop the server.
    Shutdown,
}

impl Outcome {
    /// Returns `true` unless the worker should keep reading.
    #[must_use]
    pub fn closes(self) -> bool {
        self != Self::Continue
    }
}

/// Builds a message from the server carrying the server token.
#[must_use]
pub fn server_message(state: &ServerState, flag: i32, to: u32) -> Message {
    Message::new(flag, unix_now_millis(), sentinel::FROM_SERVER, to, state.server_token)
}

/// The reply to a frame that decrypted but could not be decoded.
#[must_use]
pub fn malformed_reply(state: &ServerState) -> Message {
    server_message(state, flag::ERROR, sentinel::TO_ANONYMOUS)
}

fn error_reply(state: &ServerState, offending: i32, to: u32) -> Message {
    server_message(state, flag::ERROR, to).with_body(offending.to_le_bytes())
}

/// Queues `reply`, purges the connection and closes with an error.
fn interrupt(state: &ServerState, conn_id: u32, reply: Message, out: &mut Vec<Message>) -> Outcome {
    out.push(reply);
    state.registry.delete_connection(conn_id);
    Outcome::FinishWithError
}

fn operation(flag: i32) -> &'static str {
    match flag {
        flag::PROCEED => "proceed",
        flag::BROADCAST => "broadcast",
        flag::FINISH => "finish",
        flag::LOG_IN => "log_in",
        flag::REGISTER => "register",
        flag::FETCH_USERS => "fetch_users",
        flag::FETCH_MESSAGES => "fetch_messages",
        flag::SHUTDOWN => "shutdown",
        f if flag::is_relayed(f) => "relay_signal",
        _ => "unknown",
    }
}

/// Authorizes and executes one message received on `conn_id`.
///
/// Replies for the sender are appended to `out` in send order.
pub async fn route(state: &ServerState, conn_id: u32, msg: Message, out: &mut Vec<Message>) -> Outcome {
    let op = msg.flag;
    counters::dispatch_total(operation(op));

    let Some(conn_state) = state.registry.get_state(conn_id) else {
        debug!(conn_id, "message for a purged connection");
        return Outcome::FinishWithError;
    };

    let user = if op == flag::LOG_IN || op == flag::REGISTER {
        let preamble = conn_state == ConnState::Connected
            && msg.from == sentinel::FROM_ANONYMOUS
            && msg.token == EMPTY_TOKEN
            && msg.to == sentinel::TO_SERVER;
        if !preamble {
            debug!(conn_id, flag = op, "credentials outside the preamble");
            return interrupt(state, conn_id, error_reply(state, op, sentinel::TO_ANONYMOUS), out);
        }
        state.registry.set_state(conn_id, ConnState::SecureEstablished);
        None
    } else {
        let bound = state.registry.get_user(conn_id).filter(|_| {
            conn_state > ConnState::Connected
                && msg.from != sentinel::FROM_ANONYMOUS
                && msg.from != sentinel::FROM_SERVER
        });
        let Some(user) = bound else {
            debug!(conn_id, flag = op, "request before log in");
            return interrupt(state, conn_id, error_reply(state, op, msg.from), out);
        };
        match state.tokens.open(&msg.token) {
            Some((c, u)) if c == conn_id && u == user.id && msg.from == u => {}
            _ => {
                debug!(conn_id, user = user.id, "token rejected");
                let reply = server_message(state, flag::UNAUTHENTICATED, sentinel::TO_ANONYMOUS);
                return interrupt(state, conn_id, reply, out);
            }
        }
        Some(user)
    };

    if state.is_shutting_down() {
        return interrupt(state, conn_id, error_reply(state, op, msg.from), out);
    }

    let to_server_only = matches!(
        op,
        flag::LOG_IN
            | flag::REGISTER
            | flag::FINISH
            | flag::FETCH_USERS
            | flag::FETCH_MESSAGES
            | flag::BROADCAST
            | flag::SHUTDOWN
    );
    if to_server_only && msg.to != sentinel::TO_SERVER {
        return interrupt(state, conn_id, error_reply(state, op, msg.from), out);
    }

    match (op, user) {
        (flag::LOG_IN, None) => log_in(state, conn_id, &msg, out).await,
        (flag::REGISTER, None) => register(state, conn_id, &msg, out).await,
        (flag::FINISH, Some(_)) => {
            state.registry.delete_connection(conn_id);
            Outcome::Finish
        }
        (flag::SHUTDOWN, Some(user)) => shutdown(state, conn_id, &user, out).await,
        (flag::BROADCAST, Some(user)) => broadcast(state, conn_id, &user, &msg, out).await,
        (flag::FETCH_USERS, Some(user)) => fetch_users(state, conn_id, &user, out).await,
        (flag::FETCH_MESSAGES, Some(user)) => fetch_messages(state, conn_id, &user, &msg, out).await,
        (f, Some(_)) if flag::is_relayed(f) => proceed(state, conn_id, msg, out).await,
        _ => interrupt(state, conn_id, error_reply(state, op, msg.from), out),
    }
}

fn credentials(body: &[u8]) -> Option<(Username, Password)> {
    let body = body.get(..CREDENTIALS_SIZE)?;
    let (name, password) = body.split_at(USERNAME_SIZE);
    Some((name.try_into().ok()?, password.try_into().ok()?))
}

fn non_blank(field: &[u8]) -> usize {
    field.iter().filter(|b| **b != 0 && **b != b' ').count()
}

async fn log_in(state: &ServerState, conn_id: u32, msg: &Message, out: &mut Vec<Message>) -> Outcome {
    let Some((name, password)) = credentials(&msg.body) else {
        return interrupt(state, conn_id, error_reply(state, msg.flag, sentinel::TO_ANONYMOUS), out);
    };

    let user = match state.store.find_user(&name, &password).await {
        Ok(user) => user,
        Err(e) => {
            error!(conn_id, "user lookup failed: {}", e);
            return interrupt(state, conn_id, error_reply(state, msg.flag, sentinel::TO_ANONYMOUS), out);
        }
    };
    let unauthenticated = || server_message(state, flag::UNAUTHENTICATED, sentinel::TO_ANONYMOUS);

    let Some(user) = user else {
        debug!(conn_id, "bad credentials");
        return interrupt(state, conn_id, unauthenticated(), out);
    };
    let user_id = user.id;
    if let Err(e) = state.registry.bind_user(conn_id, user) {
        debug!(conn_id, user = user_id, "log in refused: {}", e);
        return interrupt(state, conn_id, unauthenticated(), out);
    }
    state.registry.set_state(conn_id, ConnState::LoggedIn);

    let Some(token) = state.tokens.mint(conn_id, user_id) else {
        error!(conn_id, "token sealing failed");
        return interrupt(state, conn_id, error_reply(state, msg.flag, sentinel::TO_ANONYMOUS), out);
    };
    info!(conn_id, user = user_id, "logged in");
    out.push(server_message(state, flag::LOGGED_IN, user_id).with_body(token));
    Outcome::Continue
}

async fn register(state: &ServerState, conn_id: u32, msg: &Message, out: &mut Vec<Message>) -> Outcome {
    let refuse = |out: &mut Vec<Message>| interrupt(state, conn_id, error_reply(state, msg.flag, sentinel::TO_ANONYMOUS), out);

    match state.store.users_count().await {
        Ok(count) if count < state.config.max_users => {}
        Ok(_) => {
            warn!(conn_id, "registration refused: user directory full");
            return refuse(out);
        }
        Err(e) => {
            error!(conn_id, "user count failed: {}", e);
            return refuse(out);
        }
    }

    let Some((name, password)) = credentials(&msg.body) else {
        return refuse(out);
    };
    if non_blank(&name) < MIN_CREDENTIAL_SIZE || non_blank(&password) < MIN_CREDENTIAL_SIZE {
        debug!(conn_id, "registration refused: blank credentials");
        return refuse(out);
    }

    match state.store.add_user(&name, &password).await {
        Ok(user) => {
            info!(conn_id, user = user.id, "registered");
            out.push(server_message(state, flag::REGISTERED, user.id));
            state.registry.delete_connection(conn_id);
            Outcome::FinishToReconnect
        }
        Err(e) => {
            debug!(conn_id, "registration refused: {}", e);
            refuse(out)
        }
    }
}

async fn proceed(state: &ServerState, conn_id: u32, msg: Message, out: &mut Vec<Message>) -> Outcome {
    if msg.body.is_empty() || msg.to == msg.from {
        return interrupt(state, conn_id, error_reply(state, msg.flag, msg.from), out);
    }

    // Nothing is stored for a recipient that can never fetch it.
    match state.store.user_exists(msg.to).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(conn_id, to = msg.to, "relay to unknown user");
            counters::messages_dropped_total("unknown_recipient");
            out.push(error_reply(state, msg.flag, msg.from));
            return Outcome::Continue;
        }
        Err(e) => {
            error!(conn_id, "user lookup failed: {}", e);
            return interrupt(state, conn_id, error_reply(state, msg.flag, msg.from), out);
        }
    }

    if msg.flag == flag::PROCEED {
        if let Err(e) = state
            .store
            .add_message(msg.timestamp, msg.from, msg.to, &msg.body)
            .await
        {
            error!(conn_id, "message not persisted: {}", e);
        }
    }

    match state.registry.get_authorized_connected_user(msg.to) {
        Some((_, handle)) => match handle.tx.try_send(msg) {
            Ok(()) => counters::messages_relayed_total(),
            Err(TrySendError::Full(_)) => counters::messages_dropped_total("queue_full"),
            Err(TrySendError::Closed(_)) => counters::messages_dropped_total("offline"),
        },
        None => counters::messages_dropped_total("offline"),
    }
    Outcome::Continue
}

async fn is_admin(state: &ServerState, user: &User) -> bool {
    match state.store.is_admin(user.id).await {
        Ok(admin) => admin,
        Err(e) => {
            error!(user = user.id, "admin check failed: {}", e);
            false
        }
    }
}

fn access_denied(state: &ServerState, conn_id: u32, user: &User, out: &mut Vec<Message>) -> Outcome {
    warn!(conn_id, user = user.id, "admin operation refused");
    interrupt(state, conn_id, server_message(state, flag::ACCESS_DENIED, user.id), out)
}

async fn broadcast(
    state: &ServerState,
    conn_id: u32,
    user: &User,
    msg: &Message,
    out: &mut Vec<Message>,
) -> Outcome {
    if !is_admin(state, user).await {
        return access_denied(state, conn_id, user, out);
    }
    if msg.body.is_empty() {
        return interrupt(state, conn_id, error_reply(state, msg.flag, msg.from), out);
    }

    for (recipient, handle) in state.registry.authorized_connections() {
        if recipient == user.id {
            continue;
        }
        let copy = server_message(state, flag::BROADCAST, recipient).with_body(msg.body.clone());
        match handle.tx.try_send(copy) {
            Ok(()) => counters::messages_relayed_total(),
            Err(_) => counters::messages_dropped_total("queue_full"),
        }
    }
    Outcome::Continue
}

#[allow(clippy::cast_possible_truncation)]
async fn fetch_users(state: &ServerState, conn_id: u32, user: &User, out: &mut Vec<Message>) -> Outcome {
    let users = match state.store.users().await {
        Ok(users) => users,
        Err(e) => {
            error!(conn_id, "user listing failed: {}", e);
            return interrupt(state, conn_id, error_reply(state, flag::FETCH_USERS, user.id), out);
        }
    };

    let count = users.len().div_ceil(USER_INFOS_PER_MESSAGE) as u32;
    for (index, page) in users.chunks(USER_INFOS_PER_MESSAGE).enumerate() {
        let mut body = Vec::with_capacity(page.len() * USER_INFO_SIZE);
        for u in page {
            UserInfo {
                id: u.id,
                connected: state.registry.is_user_connected(u.id),
                name: u.name,
            }
            .pack_into(&mut body);
        }
        out.push(
            server_message(state, flag::FETCH_USERS, user.id)
                .with_body(body)
                .with_position(index as u32, count),
        );
    }
    Outcome::Continue
}

#[allow(clippy::cast_possible_truncation)]
async fn fetch_messages(
    state: &ServerState,
    conn_id: u32,
    user: &User,
    msg: &Message,
    out: &mut Vec<Message>,
) -> Outcome {
    let body = &msg.body;
    let mode = body.first().copied();
    let after = body
        .get(1..FETCH_HEAD_SIZE)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes);
    let target = match mode {
        Some(FETCH_TO_ME) => Some(user.id),
        Some(FETCH_FROM_USER) => body
            .get(FETCH_HEAD_SIZE..FETCH_MARKER_SIZE)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes),
        _ => None,
    };
    let (Some(mode), Some(after), Some(target)) = (mode, after, target) else {
        return interrupt(state, conn_id, error_reply(state, msg.flag, msg.from), out);
    };

    if after >= unix_now_millis() {
        out.push(error_reply(state, msg.flag, user.id));
        return Outcome::Continue;
    }
    match state.store.user_exists(target).await {
        Ok(true) => {}
        Ok(false) => {
            out.push(error_reply(state, msg.flag, user.id));
            return Outcome::Continue;
        }
        Err(e) => {
            error!(conn_id, "user lookup failed: {}", e);
            return interrupt(state, conn_id, error_reply(state, msg.flag, user.id), out);
        }
    }

    let query = if mode == FETCH_TO_ME {
        MessageQuery::AddressedTo { user: user.id, after }
    } else {
        MessageQuery::AuthoredBy {
            author: target,
            viewer: user.id,
            after,
        }
    };
    let messages = match state.store.messages(query).await {
        Ok(messages) => messages,
        Err(e) => {
            error!(conn_id, "message fetch failed: {}", e);
            return interrupt(state, conn_id, error_reply(state, msg.flag, user.id), out);
        }
    };

    if messages.is_empty() {
        let mut marker = Vec::with_capacity(FETCH_MARKER_SIZE);
        marker.push(mode);
        marker.extend_from_slice(&after.to_le_bytes());
        marker.extend_from_slice(&target.to_le_bytes());
        out.push(server_message(state, flag::FETCH_MESSAGES, user.id).with_body(marker));
        return Outcome::Continue;
    }

    let count = messages.len() as u32;
    let mut consumed = Vec::new();
    for (index, stored) in messages.into_iter().enumerate() {
        if stored.to == user.id {
            consumed.push(stored.id);
        }
        let reply = Message::new(
            flag::FETCH_MESSAGES,
            stored.timestamp,
            stored.from,
            user.id,
            state.server_token,
        )
        .with_body(stored.body)
        .with_position(index as u32, count);
        out.push(reply);
    }

    // Only the recipient's fetch consumes; an author listing its own
    // messages leaves them for delivery.
    if let Err(e) = state.store.delete_messages(&consumed).await {
        error!(conn_id, "fetched messages not deleted: {}", e);
    }
    Outcome::Continue
}

async fn shutdown(state: &ServerState, conn_id: u32, user: &User, out: &mut Vec<Message>) -> Outcome {
    if !is_admin(state, user).await {
        return access_denied(state, conn_id, user, out);
    }
    info!(conn_id, "shutdown requested by admin");
    state.mark_shutting_down();
    if let Err(e) = state.store.delete_all_messages().await {
        error!("buffered messages not purged: {}", e);
    }
    state.registry.delete_connection(conn_id);
    Outcome::Shutdown
}
