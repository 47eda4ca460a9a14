#![allow(dead_code)]

use ed25519_dalek::{SigningKey, VerifyingKey};
use mrp_common::crypto::{self, KeyPair, StreamDecoder, StreamEncoder, HEADER_SIZE, KEY_SIZE, SIGNATURE_SIZE};
use mrp_common::frame::padded;
use mrp_common::types::{flag, sentinel, Token, EMPTY_TOKEN, PASSWORD_SIZE, USERNAME_SIZE};
use mrp_common::Message;
use mrps::config::ServerConfig;
use mrps::error::MrpsError;
use mrps::password::PasswordHasher;
use mrps::server::ServerState;
use mrps::store::MemoryStore;
use mrps::transport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub const IDLE: Duration = Duration::from_secs(5);
pub const PART: Duration = Duration::from_secs(1);

pub fn test_config(max_conns: u32, max_users: u32) -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns,
        max_users,
        admin_password: "admin".to_string(),
        idle_timeout_ms: 5_000,
        part_timeout_ms: 1_000,
        lifetime_ms: 60_000,
        drain_timeout: 1,
        hash_memory_kib: 8,
        hash_iterations: 1,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub verifying_key: VerifyingKey,
    pub task: JoinHandle<Result<(), MrpsError>>,
}

pub async fn start_server(config: ServerConfig) -> TestServer {
    let hasher = PasswordHasher::new(config.hash_memory_kib, config.hash_iterations).unwrap();
    let store = MemoryStore::new(config.max_users, hasher, config.admin_password.as_bytes()).unwrap();
    let signing_key = SigningKey::from_bytes(&[42u8; 32]);
    let verifying_key = signing_key.verifying_key();
    let state = Arc::new(ServerState::new(config, signing_key, Arc::new(store)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(mrps::run(listener, Arc::clone(&state)));
    TestServer {
        addr,
        state,
        verifying_key,
        task,
    }
}

pub fn credentials(name: &[u8], password: &[u8]) -> Vec<u8> {
    let mut body = padded::<USERNAME_SIZE>(name).to_vec();
    body.extend_from_slice(&padded::<PASSWORD_SIZE>(password));
    body
}

pub struct TestClient {
    stream: TcpStream,
    encoder: StreamEncoder,
    decoder: StreamDecoder,
    pub user_id: u32,
    pub token: Token,
}

impl TestClient {
    /// Connects and completes the handshake, verifying every signature.
    pub async fn connect(server: &TestServer) -> Self {
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        let mut hello = [0u8; SIGNATURE_SIZE + KEY_SIZE];
        stream.read_exact(&mut hello).await.unwrap();
        let server_public: [u8; KEY_SIZE] = crypto::open_signed(&server.verifying_key, &hello)
            .expect("server key signature")
            .try_into()
            .unwrap();
        assert_ne!(server_public, [0u8; KEY_SIZE], "server refused the connection");

        let kx = KeyPair::generate();
        stream.write_all(&kx.public_bytes()).await.unwrap();
        let keys = kx.client_session_keys(&server_public).unwrap();

        let mut signed_header = [0u8; SIGNATURE_SIZE + HEADER_SIZE];
        stream.read_exact(&mut signed_header).await.unwrap();
        let header = crypto::open_signed(&server.verifying_key, &signed_header).expect("header signature");
        let decoder = StreamDecoder::new(&keys.rx, header).unwrap();

        let (encoder, client_header) = StreamEncoder::new(&keys.tx).unwrap();
        stream.write_all(&client_header).await.unwrap();

        Self {
            stream,
            encoder,
            decoder,
            user_id: sentinel::FROM_ANONYMOUS,
            token: EMPTY_TOKEN,
        }
    }

    pub async fn log_in(server: &TestServer, name: &[u8], password: &[u8]) -> Self {
        let mut client = Self::connect(server).await;
        client.send_anonymous(flag::LOG_IN, credentials(name, password)).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.flag, flag::LOGGED_IN, "log in as {:?} refused", String::from_utf8_lossy(name));
        client.user_id = reply.to;
        client.token = reply.body.as_slice().try_into().unwrap();
        client
    }

    /// Registers a user on a throwaway connection and returns its id.
    pub async fn register(server: &TestServer, name: &[u8], password: &[u8]) -> u32 {
        let mut client = Self::connect(server).await;
        client.send_anonymous(flag::REGISTER, credentials(name, password)).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.flag, flag::REGISTERED);
        client.expect_closed().await;
        reply.to
    }

    pub async fn send(&mut self, message: &Message) {
        transport::send(&mut self.stream, &mut self.encoder, message, IDLE, PART)
            .await
            .unwrap();
    }

    /// Encrypts and sends bytes that need not be a valid message.
    pub async fn send_plain(&mut self, plain: &[u8]) {
        let frame = self.encoder.encrypt(plain).unwrap();
        transport::write_frame(&mut self.stream, &frame, IDLE, PART).await.unwrap();
    }

    /// Writes a bare length prefix with no body behind it.
    pub async fn send_length_prefix(&mut self, len: u32) {
        self.stream.write_all(&len.to_le_bytes()).await.unwrap();
    }

    pub async fn send_anonymous(&mut self, op: i32, body: Vec<u8>) {
        let msg = Message::new(
            op,
            crypto::unix_now_millis(),
            sentinel::FROM_ANONYMOUS,
            sentinel::TO_SERVER,
            EMPTY_TOKEN,
        )
        .with_body(body);
        self.send(&msg).await;
    }

    /// Sends an authenticated message from the logged in user.
    pub async fn send_as_user(&mut self, op: i32, to: u32, body: Vec<u8>) {
        let msg = Message::new(op, crypto::unix_now_millis(), self.user_id, to, self.token).with_body(body);
        self.send(&msg).await;
    }

    pub async fn recv(&mut self) -> Result<Message, MrpsError> {
        transport::receive(&mut self.stream, &mut self.decoder, IDLE, PART).await
    }

    pub async fn expect_closed(&mut self) {
        match self.recv().await {
            Err(MrpsError::ConnectionClosed | MrpsError::Io(_)) => {}
            other => panic!("expected the server to close, got {other:?}"),
        }
    }

    /// Asserts nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(wait, self.stream.peek(&mut byte)).await;
        assert!(read.is_err(), "unexpected data from the server");
    }
}

/// Completes the signed server hello and returns its key payload.
pub async fn read_server_hello(server: &TestServer) -> [u8; KEY_SIZE] {
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut hello = [0u8; SIGNATURE_SIZE + KEY_SIZE];
    stream.read_exact(&mut hello).await.unwrap();
    crypto::open_signed(&server.verifying_key, &hello)
        .expect("server key signature")
        .try_into()
        .unwrap()
}

pub fn fetch_body(mode: u8, after: u64, target: Option<u32>) -> Vec<u8> {
    let mut body = vec![mode];
    body.extend_from_slice(&after.to_le_bytes());
    if let Some(target) = target {
        body.extend_from_slice(&target.to_le_bytes());
    }
    body
}
