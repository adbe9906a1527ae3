//! Proxy end-to-end scenarios.

use std::time::Duration;

use crate::mock::MockBackend;
use crate::{TestClient, TestProxy, TEST_PASSWORD, TEST_USER};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_handshake_and_select_roundtrip() {
    let backend = MockBackend::start().await;
    let proxy = TestProxy::start(backend.addr, false).await;

    let mut client = TestClient::connect(proxy.addr, TEST_USER, TEST_PASSWORD)
        .await
        .expect("login should succeed");

    let packets = client.query("SELECT 1").await;
    assert_eq!(packets.len(), 5);
    assert_eq!(&packets[0].payload[..], &[0x01]); // one column
    assert_eq!(packets[1].payload.as_ref(), b"coldef");
    assert_eq!(packets[2].payload[0], 0xfe);
    assert_eq!(&packets[3].payload[..], &[0x01, b'1']);
    assert_eq!(packets[4].payload[0], 0xfe);

    // The proxy forwarded the COM_QUERY verbatim.
    settle().await;
    let requests = backend.requests();
    assert!(requests
        .iter()
        .any(|r| r.first() == Some(&0x03) && &r[1..] == b"SELECT 1"));
}

#[tokio::test]
async fn test_login_with_wrong_password_is_rejected() {
    let backend = MockBackend::start().await;
    let proxy = TestProxy::start(backend.addr, false).await;

    let err = TestClient::connect(proxy.addr, TEST_USER, "wrong")
        .await
        .expect_err("login must fail");
    assert_eq!(err[0], 0xff);
    let code = u16::from_le_bytes([err[1], err[2]]);
    assert_eq!(code, 1045);

    // The proxy never touched the backend for a failed login.
    settle().await;
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn test_unknown_user_is_rejected() {
    let backend = MockBackend::start().await;
    let proxy = TestProxy::start(backend.addr, false).await;

    let err = TestClient::connect(proxy.addr, "intruder", TEST_PASSWORD)
        .await
        .expect_err("login must fail");
    assert_eq!(err[0], 0xff);
}

#[tokio::test]
async fn test_pooled_connection_is_reused_with_change_user() {
    let backend = MockBackend::start().await;
    let proxy = TestProxy::start(backend.addr, true).await;

    // First session opens the backend connection and leaves cleanly.
    let mut first = TestClient::connect(proxy.addr, TEST_USER, TEST_PASSWORD)
        .await
        .unwrap();
    let packets = first.query("SELECT 1").await;
    assert_eq!(packets.len(), 5);
    first.quit().await;

    settle().await;
    assert_eq!(proxy.pool.idle_count(), 1);
    assert_eq!(backend.connection_count(), 1);

    // Second session adopts the pooled connection; the backend sees a
    // COM_CHANGE_USER before the new session's first statement, on the
    // same connection.
    let mut second = TestClient::connect(proxy.addr, TEST_USER, TEST_PASSWORD)
        .await
        .unwrap();
    let packets = second.query("SHOW DATABASES").await;
    assert_eq!(packets.len(), 5);

    settle().await;
    assert_eq!(backend.connection_count(), 1);

    let requests = backend.requests();
    let change_user_pos = requests.iter().position(|r| r.first() == Some(&0x11));
    let show_pos = requests
        .iter()
        .position(|r| r.first() == Some(&0x03) && r[1..].starts_with(b"SHOW"));
    let change_user_pos = change_user_pos.expect("backend must see a COM_CHANGE_USER");
    let show_pos = show_pos.expect("backend must see the stored query");
    assert!(change_user_pos < show_pos);
}

#[tokio::test]
async fn test_sessions_multiplex_without_pooling() {
    let backend = MockBackend::start().await;
    let proxy = TestProxy::start(backend.addr, false).await;

    let mut first = TestClient::connect(proxy.addr, TEST_USER, TEST_PASSWORD)
        .await
        .unwrap();
    let mut second = TestClient::connect(proxy.addr, TEST_USER, TEST_PASSWORD)
        .await
        .unwrap();

    let a = first.query("SELECT 1").await;
    let b = second.query("SELECT 1").await;
    assert_eq!(a.len(), 5);
    assert_eq!(b.len(), 5);

    settle().await;
    assert_eq!(backend.connection_count(), 2);
}
