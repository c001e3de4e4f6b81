//! Exercises [`meshline_core::relay_client::RelayClient`] against a real HTTP
//! server (`tiny_http`) instead of mocking `reqwest`, so the request shapes,
//! status-code classification, and retry behavior are all covered together.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use meshline_core::relay_client::{RelayClient, RelayClientConfig, TlsOptions};
use meshline_core::retry::RetryPolicy;
use meshline_core::Error;
use tiny_http::{Response, Server};
use tokio_util::sync::CancellationToken;

/// One scripted HTTP response, consumed in order as requests arrive.
struct Scripted {
    status: u16,
    body: String,
}

/// Starts a `tiny_http` server on a background thread that replies to each
/// incoming request with the next entry in `responses`, then shuts down once
/// the script is exhausted. Returns the bound address.
fn spawn_scripted_server(responses: Vec<Scripted>) -> SocketAddr {
    let server = Server::http("127.0.0.1:0").expect("bind ephemeral port");
    let addr = match server.server_addr() {
        tiny_http::ListenAddr::IP(addr) => addr,
        tiny_http::ListenAddr::Unix(_) => unreachable!("bound a TCP socket"),
    };

    std::thread::spawn(move || {
        let responses = Mutex::new(responses.into_iter());
        for request in server.incoming_requests() {
            let mut body = String::new();
            let mut request = request;
            let _ = request.as_reader().read_to_string(&mut body);
            let Some(next) = responses.lock().unwrap().next() else {
                let _ = request.respond(Response::from_string("exhausted script").with_status_code(500));
                continue;
            };
            let response = Response::from_string(next.body).with_status_code(next.status);
            let _ = request.respond(response);
        }
    });

    addr
}

fn client_for(addr: SocketAddr) -> RelayClient {
    let base_url = format!("http://{addr}").parse().unwrap();
    let config = RelayClientConfig {
        base_url,
        tenant_id: "tenant-a".into(),
        tls: TlsOptions { tls_insecure: true, ca_path: None, server_name_override: None },
        retry: RetryPolicy { max_retries: 2, base_delay: Duration::from_millis(10), backoff_multiplier: 2.0, max_backoff: Duration::from_millis(200) },
    };
    RelayClient::new(config, "token-123".into(), CancellationToken::new()).unwrap()
}

#[tokio::test]
async fn register_treats_conflict_as_success() {
    let addr = spawn_scripted_server(vec![Scripted {
        status: 409,
        body: r#"{"peer_id":"peer-a","relay_session_id":"sess-1","registered_at":"2026-01-01T00:00:00Z"}"#.into(),
    }]);
    let client = client_for(addr);

    let resp = client.register("pubkey-a", &["10.0.0.1/32".to_string()], None).await.unwrap();
    assert_eq!(resp.peer_id, "peer-a");
    assert_eq!(resp.relay_session_id, "sess-1");
}

#[tokio::test]
async fn register_retries_transient_server_errors_then_succeeds() {
    let addr = spawn_scripted_server(vec![
        Scripted { status: 503, body: "try again".into() },
        Scripted {
            status: 200,
            body: r#"{"peer_id":"peer-b","relay_session_id":"sess-2","registered_at":"2026-01-01T00:00:00Z"}"#.into(),
        },
    ]);
    let client = client_for(addr);

    let resp = client.register("pubkey-b", &[], None).await.unwrap();
    assert_eq!(resp.peer_id, "peer-b");
}

#[tokio::test]
async fn register_rejects_unauthorized_without_retrying() {
    let addr = spawn_scripted_server(vec![Scripted { status: 401, body: "bad token".into() }]);
    let client = client_for(addr);

    let err = client.register("pubkey-c", &[], None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidToken(_)));
}

#[tokio::test]
async fn heartbeat_parses_response_body() {
    let addr = spawn_scripted_server(vec![Scripted {
        status: 200,
        body: r#"{"success":true,"status":"active","last_seen":"2026-01-01T00:00:05Z"}"#.into(),
    }]);
    let client = client_for(addr);

    let resp = client.heartbeat("peer-a", "active", "sess-1").await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.status, "active");
}

#[tokio::test]
async fn discover_parses_peer_records() {
    let addr = spawn_scripted_server(vec![Scripted {
        status: 200,
        body: r#"{"peers":[{"peer_id":"peer-b","public_key":"pk-b","allowed_ips":["10.0.0.2/32"],"endpoint":"1.2.3.4:51820","is_online":true,"last_seen":"2026-01-01T00:00:00Z","latency_ms":12.5,"mesh_status":"connected"}]}"#.into(),
    }]);
    let client = client_for(addr);

    let peers = client.discover().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, "peer-b");
    assert_eq!(peers[0].latency_ms, Some(12.5));
}

#[tokio::test]
async fn ice_signal_fetch_until_polls_past_empty_responses() {
    let addr = spawn_scripted_server(vec![
        Scripted { status: 200, body: r#"{"candidates":[]}"#.into() },
        Scripted { status: 200, body: r#"{"candidates":[]}"#.into() },
        Scripted {
            status: 200,
            body: r#"{"candidates":["candidate:f0 1 udp 100 10.0.0.5 51820 typ host"]}"#.into(),
        },
    ]);
    let client = client_for(addr);

    let candidates = client
        .ice_signal_fetch_until("peer-a", "sess-1", "peer-b", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(candidates[0].starts_with("candidate:f0"));
}

#[tokio::test]
async fn ice_signal_fetch_until_times_out_to_empty() {
    let addr = spawn_scripted_server(
        std::iter::repeat_with(|| Scripted { status: 200, body: r#"{"candidates":[]}"#.into() }).take(8).collect(),
    );
    let client = client_for(addr);

    let candidates = client
        .ice_signal_fetch_until("peer-a", "sess-1", "peer-b", Duration::from_millis(300))
        .await
        .unwrap();
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn deregister_succeeds_on_expected_body() {
    let addr = spawn_scripted_server(vec![Scripted { status: 200, body: r#"{"success":true}"#.into() }]);
    let client = client_for(addr);

    client.deregister("peer-a").await.unwrap();
}
