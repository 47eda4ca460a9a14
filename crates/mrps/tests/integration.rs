mod common;

use common::*;
use mrp_common::crypto::{self, KEY_SIZE};
use mrp_common::frame::{UserInfo, USER_INFOS_PER_MESSAGE, USER_INFO_SIZE};
use mrp_common::types::{flag, sentinel, ADMIN_ID};
use mrp_common::Message;
use mrps::store::Store;
use std::time::Duration;

#[tokio::test]
async fn online_users_exchange_messages() {
    let server = start_server(test_config(8, 8)).await;
    let bob_id = TestClient::register(&server, b"bob1", b"hunter2").await;

    let mut admin = TestClient::log_in(&server, b"admin", b"admin").await;
    let mut bob = TestClient::log_in(&server, b"bob1", b"hunter2").await;
    assert_eq!(admin.user_id, ADMIN_ID);
    assert_eq!(bob.user_id, bob_id);

    admin.send_as_user(flag::PROCEED, bob_id, b"hello bob".to_vec()).await;
    let got = bob.recv().await.unwrap();
    assert_eq!(got.flag, flag::PROCEED);
    assert_eq!(got.from, ADMIN_ID);
    assert_eq!(got.body, b"hello bob");

    bob.send_as_user(flag::EXCHANGE_KEYS, ADMIN_ID, vec![7; KEY_SIZE]).await;
    let got = admin.recv().await.unwrap();
    assert_eq!(got.flag, flag::EXCHANGE_KEYS);
    assert_eq!(got.from, bob_id);
    assert_eq!(got.body, vec![7; KEY_SIZE]);
}

#[tokio::test]
async fn offline_message_is_delivered_once_by_fetch() {
    let server = start_server(test_config(8, 8)).await;
    let bob_id = TestClient::register(&server, b"bob1", b"hunter2").await;

    let mut admin = TestClient::log_in(&server, b"admin", b"admin").await;
    admin.send_as_user(flag::PROCEED, bob_id, b"first".to_vec()).await;
    admin.send_as_user(flag::PROCEED, bob_id, b"second".to_vec()).await;
    // Signals are relayed only; nothing is buffered for an offline peer.
    admin.send_as_user(flag::EXCHANGE_KEYS, bob_id, vec![1; KEY_SIZE]).await;
    admin.expect_silence(Duration::from_millis(100)).await;

    let mut bob = TestClient::log_in(&server, b"bob1", b"hunter2").await;
    bob.send_as_user(flag::FETCH_MESSAGES, sentinel::TO_SERVER, fetch_body(0, 0, None)).await;
    let first = bob.recv().await.unwrap();
    let second = bob.recv().await.unwrap();
    assert_eq!(first.flag, flag::FETCH_MESSAGES);
    assert_eq!((first.index, first.count, first.from), (0, 2, ADMIN_ID));
    assert_eq!(first.body, b"first");
    assert_eq!((second.index, second.count), (1, 2));
    assert_eq!(second.body, b"second");
    assert!(crypto::verify_server_token(&server.verifying_key, &first.token));

    bob.send_as_user(flag::FETCH_MESSAGES, sentinel::TO_SERVER, fetch_body(0, 0, None)).await;
    let marker = bob.recv().await.unwrap();
    assert_eq!(marker.flag, flag::FETCH_MESSAGES);
    assert_eq!(marker.body, fetch_body(0, 0, Some(bob_id)));
}

#[tokio::test]
async fn author_listing_keeps_messages_for_the_recipient() {
    let server = start_server(test_config(8, 8)).await;
    let bob_id = TestClient::register(&server, b"bob1", b"hunter2").await;

    let mut admin = TestClient::log_in(&server, b"admin", b"admin").await;
    admin.send_as_user(flag::PROCEED, bob_id, b"kept".to_vec()).await;

    admin
        .send_as_user(flag::FETCH_MESSAGES, sentinel::TO_SERVER, fetch_body(1, 0, Some(ADMIN_ID)))
        .await;
    let listed = admin.recv().await.unwrap();
    assert_eq!(listed.body, b"kept");
    assert_eq!((listed.index, listed.count), (0, 1));

    let mut bob = TestClient::log_in(&server, b"bob1", b"hunter2").await;
    bob.send_as_user(flag::FETCH_MESSAGES, sentinel::TO_SERVER, fetch_body(0, 0, None)).await;
    assert_eq!(bob.recv().await.unwrap().body, b"kept");
}

#[tokio::test]
async fn fetch_with_future_watermark_keeps_connection() {
    let server = start_server(test_config(8, 8)).await;
    let mut admin = TestClient::log_in(&server, b"admin", b"admin").await;

    let future = crypto::unix_now_millis() + 60_000;
    admin.send_as_user(flag::FETCH_MESSAGES, sentinel::TO_SERVER, fetch_body(0, future, None)).await;
    let reply = admin.recv().await.unwrap();
    assert_eq!(reply.flag, flag::ERROR);
    assert_eq!(reply.body, flag::FETCH_MESSAGES.to_le_bytes());

    admin.send_as_user(flag::FETCH_USERS, sentinel::TO_SERVER, Vec::new()).await;
    assert_eq!(admin.recv().await.unwrap().flag, flag::FETCH_USERS);
}

#[tokio::test]
async fn registered_user_logs_in_on_a_new_connection() {
    let server = start_server(test_config(8, 8)).await;
    let carol_id = TestClient::register(&server, b"carol", b"secret").await;
    assert_eq!(carol_id, 1);

    let carol = TestClient::log_in(&server, b"carol", b"secret").await;
    assert_eq!(carol.user_id, carol_id);
}

#[tokio::test]
async fn duplicate_name_is_refused() {
    let server = start_server(test_config(8, 8)).await;
    TestClient::register(&server, b"carol", b"secret").await;

    let mut again = TestClient::connect(&server).await;
    again.send_anonymous(flag::REGISTER, credentials(b"carol", b"other")).await;
    let reply = again.recv().await.unwrap();
    assert_eq!(reply.flag, flag::ERROR);
    assert_eq!(reply.to, sentinel::TO_ANONYMOUS);
    again.expect_closed().await;
}

#[tokio::test]
async fn short_username_is_refused() {
    let server = start_server(test_config(8, 8)).await;
    let mut client = TestClient::connect(&server).await;
    client.send_anonymous(flag::REGISTER, credentials(b"bob", b"hunter2")).await;

    let reply = client.recv().await.unwrap();
    assert_eq!(reply.flag, flag::ERROR);
    assert_eq!(reply.to, sentinel::TO_ANONYMOUS);
    assert_eq!(reply.body, flag::REGISTER.to_le_bytes());
    client.expect_closed().await;

    let directory = server.state.store.users_count().await.unwrap();
    assert_eq!(directory, 1);
}

#[tokio::test]
async fn wrong_password_is_unauthenticated() {
    let server = start_server(test_config(8, 8)).await;
    let mut client = TestClient::connect(&server).await;
    client.send_anonymous(flag::LOG_IN, credentials(b"admin", b"wrong")).await;

    let reply = client.recv().await.unwrap();
    assert_eq!(reply.flag, flag::UNAUTHENTICATED);
    assert_eq!(reply.from, sentinel::FROM_SERVER);
    assert!(crypto::verify_server_token(&server.verifying_key, &reply.token));
    client.expect_closed().await;
}

#[tokio::test]
async fn second_session_for_a_user_is_refused() {
    let server = start_server(test_config(8, 8)).await;
    let mut first = TestClient::log_in(&server, b"admin", b"admin").await;

    let mut second = TestClient::connect(&server).await;
    second.send_anonymous(flag::LOG_IN, credentials(b"admin", b"admin")).await;
    assert_eq!(second.recv().await.unwrap().flag, flag::UNAUTHENTICATED);
    second.expect_closed().await;

    first.send_as_user(flag::FETCH_USERS, sentinel::TO_SERVER, Vec::new()).await;
    assert_eq!(first.recv().await.unwrap().flag, flag::FETCH_USERS);
}

#[tokio::test]
async fn token_from_another_session_is_rejected() {
    let server = start_server(test_config(8, 8)).await;
    TestClient::register(&server, b"bob1", b"hunter2").await;
    let admin = TestClient::log_in(&server, b"admin", b"admin").await;
    let mut bob = TestClient::log_in(&server, b"bob1", b"hunter2").await;

    let forged = Message::new(
        flag::FETCH_USERS,
        crypto::unix_now_millis(),
        bob.user_id,
        sentinel::TO_SERVER,
        admin.token,
    );
    bob.send(&forged).await;
    let reply = bob.recv().await.unwrap();
    assert_eq!(reply.flag, flag::UNAUTHENTICATED);
    assert_eq!(reply.to, sentinel::TO_ANONYMOUS);
    bob.expect_closed().await;
}

#[tokio::test]
async fn request_before_log_in_is_refused() {
    let server = start_server(test_config(8, 8)).await;
    let mut client = TestClient::connect(&server).await;
    client.send_anonymous(flag::FETCH_USERS, Vec::new()).await;

    let reply = client.recv().await.unwrap();
    assert_eq!(reply.flag, flag::ERROR);
    assert_eq!(reply.body, flag::FETCH_USERS.to_le_bytes());
    client.expect_closed().await;
}

#[tokio::test]
async fn malformed_message_gets_error_then_close() {
    let server = start_server(test_config(8, 8)).await;
    let mut client = TestClient::connect(&server).await;
    client.send_plain(&[0xAB; 10]).await;

    let reply = client.recv().await.unwrap();
    assert_eq!(reply.flag, flag::ERROR);
    assert_eq!(reply.to, sentinel::TO_ANONYMOUS);
    assert!(reply.body.is_empty());
    client.expect_closed().await;
}

#[tokio::test]
async fn oversized_frame_closes_silently() {
    let server = start_server(test_config(8, 8)).await;
    let mut client = TestClient::connect(&server).await;
    client.send_length_prefix(10_000).await;
    client.expect_closed().await;
}

#[tokio::test]
async fn fetch_users_pages_the_directory() {
    let server = start_server(test_config(8, 16)).await;
    for i in 1..=8u8 {
        let name = format!("user{i}");
        TestClient::register(&server, name.as_bytes(), b"password").await;
    }

    let mut admin = TestClient::log_in(&server, b"admin", b"admin").await;
    admin.send_as_user(flag::FETCH_USERS, sentinel::TO_SERVER, Vec::new()).await;

    let first = admin.recv().await.unwrap();
    let second = admin.recv().await.unwrap();
    assert_eq!((first.index, first.count), (0, 2));
    assert_eq!((second.index, second.count), (1, 2));
    assert_eq!(first.body.len(), USER_INFOS_PER_MESSAGE * USER_INFO_SIZE);
    assert_eq!(second.body.len(), 2 * USER_INFO_SIZE);

    let admin_info = UserInfo::unpack(&first.body).unwrap();
    assert_eq!(admin_info.id, ADMIN_ID);
    assert!(admin_info.connected);
    let last = UserInfo::unpack(&second.body[USER_INFO_SIZE..]).unwrap();
    assert_eq!(last.id, 8);
    assert!(!last.connected);
    assert_eq!(&last.name[..5], b"user8");
}

#[tokio::test]
async fn full_server_answers_with_signed_zero_key() {
    let server = start_server(test_config(1, 8)).await;
    let _held = TestClient::connect(&server).await;

    let refusal = read_server_hello(&server).await;
    assert_eq!(refusal, [0u8; KEY_SIZE]);
}

#[tokio::test]
async fn connection_id_is_reused_after_close() {
    let server = start_server(test_config(1, 8)).await;
    {
        let mut client = TestClient::log_in(&server, b"admin", b"admin").await;
        client.send_as_user(flag::FINISH, sentinel::TO_SERVER, Vec::new()).await;
        client.expect_closed().await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let again = TestClient::log_in(&server, b"admin", b"admin").await;
    assert_eq!(again.user_id, ADMIN_ID);
}

#[tokio::test]
async fn admin_broadcast_reaches_other_users() {
    let server = start_server(test_config(8, 8)).await;
    TestClient::register(&server, b"bob1", b"hunter2").await;
    TestClient::register(&server, b"carol", b"secret").await;
    let mut admin = TestClient::log_in(&server, b"admin", b"admin").await;
    let mut bob = TestClient::log_in(&server, b"bob1", b"hunter2").await;
    let mut carol = TestClient::log_in(&server, b"carol", b"secret").await;

    admin.send_as_user(flag::BROADCAST, sentinel::TO_SERVER, b"maintenance".to_vec()).await;
    for client in [&mut bob, &mut carol] {
        let got = client.recv().await.unwrap();
        assert_eq!(got.flag, flag::BROADCAST);
        assert_eq!(got.from, sentinel::FROM_SERVER);
        assert_eq!(got.to, client.user_id);
        assert_eq!(got.body, b"maintenance");
    }
    admin.expect_silence(Duration::from_millis(100)).await;

    bob.send_as_user(flag::BROADCAST, sentinel::TO_SERVER, b"spam".to_vec()).await;
    let denied = bob.recv().await.unwrap();
    assert_eq!(denied.flag, flag::ACCESS_DENIED);
    bob.expect_closed().await;
}

#[tokio::test]
async fn admin_shutdown_stops_the_server() {
    let server = start_server(test_config(8, 8)).await;
    TestClient::register(&server, b"bob1", b"hunter2").await;
    let mut bob = TestClient::log_in(&server, b"bob1", b"hunter2").await;

    bob.send_as_user(flag::SHUTDOWN, sentinel::TO_SERVER, Vec::new()).await;
    assert_eq!(bob.recv().await.unwrap().flag, flag::ACCESS_DENIED);
    bob.expect_closed().await;

    let mut bob = TestClient::log_in(&server, b"bob1", b"hunter2").await;
    let mut admin = TestClient::log_in(&server, b"admin", b"admin").await;
    admin.send_as_user(flag::SHUTDOWN, sentinel::TO_SERVER, Vec::new()).await;
    admin.expect_closed().await;

    bob.send_as_user(flag::FETCH_USERS, sentinel::TO_SERVER, Vec::new()).await;
    let refused = bob.recv().await.unwrap();
    assert_eq!(refused.flag, flag::ERROR);
    bob.expect_closed().await;

    tokio::time::timeout(Duration::from_secs(3), server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert!(server.state.is_shutting_down());
}

#[tokio::test]
async fn connection_past_its_lifetime_is_closed() {
    let mut config = test_config(8, 8);
    config.lifetime_ms = 300;
    let server = start_server(config).await;
    let mut admin = TestClient::log_in(&server, b"admin", b"admin").await;

    let closed = tokio::time::timeout(Duration::from_secs(3), admin.expect_closed()).await;
    assert!(closed.is_ok(), "connection outlived its lifetime");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn outbound_traffic_keeps_a_quiet_reader_alive() {
    let mut config = test_config(8, 8);
    config.idle_timeout_ms = 400;
    config.part_timeout_ms = 200;
    let server = start_server(config).await;
    let bob_id = TestClient::register(&server, b"bob1", b"hunter2").await;
    let mut admin = TestClient::log_in(&server, b"admin", b"admin").await;
    let mut bob = TestClient::log_in(&server, b"bob1", b"hunter2").await;

    // Bob only receives for well past the idle window.
    for i in 0..10u8 {
        admin.send_as_user(flag::EXCHANGE_KEYS, bob_id, vec![i; KEY_SIZE]).await;
        assert_eq!(bob.recv().await.unwrap().body, vec![i; KEY_SIZE]);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    bob.send_as_user(flag::FETCH_USERS, sentinel::TO_SERVER, Vec::new()).await;
    assert_eq!(bob.recv().await.unwrap().flag, flag::FETCH_USERS);
}

#[tokio::test]
async fn silent_connection_hits_idle_timeout() {
    let mut config = test_config(8, 8);
    config.idle_timeout_ms = 300;
    config.part_timeout_ms = 200;
    let server = start_server(config).await;
    let mut admin = TestClient::log_in(&server, b"admin", b"admin").await;

    let closed = tokio::time::timeout(Duration::from_secs(3), admin.expect_closed()).await;
    assert!(closed.is_ok(), "idle connection was not closed");
}
