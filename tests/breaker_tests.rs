//! Integration tests for the circuit breaker and resilient HTTP client.
//!
//! These run the real client against throwaway local TCP servers so the
//! breaker sees genuine HTTP statuses, connection failures and timeouts.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use addonsync::net::{
    BreakerRegistry, BreakerState, CircuitBreaker, NetError, NetSettings, ResilientHttpClient,
};

/// Spawns a server answering every request with the given status and body.
/// Returns the base URL and a hit counter.
async fn spawn_status_server(status: u16, body: &'static str) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let server_hits = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            server_hits.fetch_add(1, Ordering::SeqCst);

            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await;

            let response = format!(
                "HTTP/1.1 {status} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (format!("http://{addr}/"), hits)
}

/// Spawns a server that accepts connections but never answers.
async fn spawn_silent_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });

    format!("http://{addr}/")
}

fn client(threshold: u32, reset: Duration) -> ResilientHttpClient {
    ResilientHttpClient::new(
        CircuitBreaker::new("test", threshold, reset),
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn test_server_faults_open_breaker_and_fail_fast() {
    let (url, hits) = spawn_status_server(500, "{}").await;
    let client = client(3, Duration::from_secs(60));

    for _ in 0..3 {
        let result = client.get_text(&url, None).await;
        assert!(matches!(result, Err(NetError::Status { code: 500 })));
    }
    assert_eq!(client.breaker().state(), BreakerState::Open);
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    // Open breaker: immediate failure, no network access attempted.
    let result = client.get_text(&url, None).await;
    assert!(matches!(result, Err(NetError::CircuitOpen(_))));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_half_open_probe_closes_after_success() {
    let (bad_url, _) = spawn_status_server(500, "{}").await;
    let (good_url, good_hits) = spawn_status_server(200, "\"ok\"").await;
    let client = client(2, Duration::from_millis(100));

    for _ in 0..2 {
        let _ = client.get_text(&bad_url, None).await;
    }
    assert_eq!(client.breaker().state(), BreakerState::Open);

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Exactly one probe is let through; success closes the breaker.
    let result: String = client.get_json(&good_url, &[], None).await.unwrap();
    assert_eq!(result, "ok");
    assert_eq!(client.breaker().state(), BreakerState::Closed);
    assert_eq!(good_hits.load(Ordering::SeqCst), 1);

    // Closed again: calls flow normally.
    let _: String = client.get_json(&good_url, &[], None).await.unwrap();
    assert_eq!(good_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_half_open_probe_failure_restarts_timer() {
    let (url, hits) = spawn_status_server(503, "{}").await;
    let client = client(1, Duration::from_millis(100));

    let _ = client.get_text(&url, None).await;
    assert_eq!(client.breaker().state(), BreakerState::Open);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;

    // The probe runs and fails; the breaker re-opens.
    let result = client.get_text(&url, None).await;
    assert!(matches!(result, Err(NetError::Status { code: 503 })));
    assert_eq!(client.breaker().state(), BreakerState::Open);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // Within the restarted cooldown, calls fail fast again.
    let result = client.get_text(&url, None).await;
    assert!(matches!(result, Err(NetError::CircuitOpen(_))));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_404_does_not_trip_breaker() {
    let (url, hits) = spawn_status_server(404, "{}").await;
    let client = client(1, Duration::from_secs(60));

    for _ in 0..3 {
        let result = client.get_text(&url, None).await;
        assert!(matches!(result, Err(NetError::Status { code: 404 })));
    }
    assert_eq!(client.breaker().state(), BreakerState::Closed);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_timeout_does_not_trip_breaker_by_default() {
    let url = spawn_silent_server().await;
    let client = client(1, Duration::from_secs(60));

    let result = client
        .get_text(&url, Some(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(NetError::Timeout(_))));
    assert_eq!(client.breaker().state(), BreakerState::Closed);
}

#[tokio::test]
async fn test_registry_emits_breaker_events() {
    let (url, _) = spawn_status_server(500, "{}").await;
    let registry = BreakerRegistry::new(NetSettings {
        http_timeout: Duration::from_secs(5),
        reset_timeout: Duration::from_millis(100),
        failure_threshold: 1,
    });
    let mut events = registry.subscribe();

    let client = registry.client_for("flaky");
    let _ = client.get_text(&url, None).await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.name, "flaky");
    assert_eq!(event.state, BreakerState::Open);
    assert_eq!(registry.breaker_state("flaky"), Some(BreakerState::Open));
}

#[tokio::test]
async fn test_get_json_decodes_payload() {
    let (url, _) = spawn_status_server(200, r#"{"tag_name":"v1.2.3"}"#).await;
    let client = client(3, Duration::from_secs(60));

    #[derive(serde::Deserialize)]
    struct Release {
        tag_name: String,
    }

    let release: Release = client.get_json(&url, &[], None).await.unwrap();
    assert_eq!(release.tag_name, "v1.2.3");
}

#[tokio::test]
async fn test_post_delete_and_bytes_share_the_breaker() {
    let (url, hits) = spawn_status_server(200, r#"{"ok":true}"#).await;
    let client = client(3, Duration::from_secs(60));

    #[derive(serde::Deserialize)]
    struct Ack {
        ok: bool,
    }

    let ack: Ack = client
        .post_json(&url, &serde_json::json!({"token": "t"}), &[], None)
        .await
        .unwrap();
    assert!(ack.ok);

    let ack: Ack = client.delete_json(&url, &[], None).await.unwrap();
    assert!(ack.ok);

    let bytes = client.get_bytes(&url, None).await.unwrap();
    assert_eq!(bytes, br#"{"ok":true}"#);

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(client.breaker().state(), BreakerState::Closed);
}

#[tokio::test]
async fn test_connection_refused_counts_toward_trip() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client(2, Duration::from_secs(60));
    let url = format!("http://{addr}/");

    for _ in 0..2 {
        let result = client.get_text(&url, None).await;
        assert!(matches!(result, Err(NetError::Request(_))));
    }
    assert_eq!(client.breaker().state(), BreakerState::Open);
}
