//! End-to-end gateway scenarios: a real listener, a mock agent speaking the
//! frame protocol over a websocket, and a public HTTP client routed by the
//! Host header.

use std::net::SocketAddr;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use portico_gateway::app;
use portico_gateway::config::Config;
use portico_gateway::state::GatewayContext;

const BASE_DOMAIN: &str = "example.dev";

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_gateway(extra_args: &[&str]) -> (SocketAddr, GatewayContext) {
    let mut args = vec!["portico-gateway", "--base-domain", BASE_DOMAIN];
    args.extend_from_slice(extra_args);
    let config = Config::try_parse_from(args).expect("test config parses");

    let ctx = GatewayContext::new(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().unwrap();

    let router = app::build_router(ctx.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve test app");
    });

    (addr, ctx)
}

/// Read frames until the next JSON one; skips websocket control messages.
async fn next_frame(ws: &mut AgentSocket) -> Option<Value> {
    while let Some(msg) = ws.next().await {
        match msg.ok()? {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn send_frame(ws: &mut AgentSocket, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("agent write");
}

/// Connect an agent and consume the handshake frame.
async fn connect_agent(addr: SocketAddr, query: &str) -> (AgentSocket, Value) {
    let url = format!("ws://{addr}/tunnel/ws/connect?{query}");
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("agent connects");
    let handshake = next_frame(&mut ws).await.expect("handshake frame");
    assert_eq!(handshake["type"], "handshake");
    (ws, handshake)
}

/// Mock agent: answers every request frame with 200 and a body of "pong"
/// for `/ping`, echoing the request body otherwise. Echoes heartbeats.
fn spawn_echo_agent(mut ws: AgentSocket) {
    tokio::spawn(async move {
        while let Some(frame) = next_frame(&mut ws).await {
            match frame["type"].as_str() {
                Some("request") => {
                    let body = if frame["data"]["path"] == "/ping" {
                        "pong".to_string()
                    } else {
                        frame["data"]["body"].as_str().unwrap_or_default().to_string()
                    };
                    let reply = json!({
                        "id": frame["id"],
                        "type": "response",
                        "headers": { "Content-Type": "text/plain" },
                        "data": { "status_code": 200, "body": body },
                    });
                    send_frame(&mut ws, reply).await;
                }
                Some("heartbeat") => {
                    let reply = json!({
                        "id": uuid::Uuid::new_v4().to_string(),
                        "type": "heartbeat",
                        "data": { "timestamp": 0 },
                    });
                    send_frame(&mut ws, reply).await;
                }
                Some("disconnect") => break,
                _ => {}
            }
        }
    });
}

fn public_host(subdomain: &str) -> String {
    format!("{subdomain}.{BASE_DOMAIN}")
}

#[tokio::test]
async fn happy_path_round_trip() {
    let (addr, _ctx) = start_gateway(&[]).await;
    let (ws, handshake) = connect_agent(addr, "user_id=alice&local_port=3000").await;

    let subdomain = handshake["data"]["subdomain"].as_str().unwrap().to_string();
    let suffix = subdomain.strip_prefix("alice-").expect("user-derived subdomain");
    assert_eq!(suffix.len(), 8);
    assert_eq!(
        handshake["data"]["public_url"],
        format!("https://{subdomain}.{BASE_DOMAIN}")
    );
    spawn_echo_agent(ws);

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/ping"))
        .header(reqwest::header::HOST, public_host(&subdomain))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let timing = response
        .headers()
        .get("x-tunnel-response-time")
        .expect("round-trip header")
        .to_str()
        .unwrap()
        .to_string();
    assert!(timing.ends_with("ms"));
    assert_eq!(response.text().await.unwrap(), "pong");

    // the tunnel shows up as active and healthy
    let health: Value = client
        .get(format!("http://{addr}/tunnel/health/{subdomain}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["healthy"], true);

    let active: Value = client
        .get(format!("http://{addr}/tunnel/active"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active["count"], 1);
}

#[tokio::test]
async fn utf8_bodies_echo_unchanged() {
    let (addr, _ctx) = start_gateway(&[]).await;
    let (ws, handshake) = connect_agent(addr, "user_id=alice&local_port=3000").await;
    let subdomain = handshake["data"]["subdomain"].as_str().unwrap().to_string();
    spawn_echo_agent(ws);

    let body = "grüße from the public internet — ⛩";
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/echo"))
        .header(reqwest::header::HOST, public_host(&subdomain))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), body);
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let (addr, _ctx) = start_gateway(&[]).await;
    let (mut ws, handshake) = connect_agent(addr, "user_id=alice&local_port=3000").await;
    let subdomain = handshake["data"]["subdomain"].as_str().unwrap().to_string();

    // Collect two request frames, then answer them in reverse order.
    tokio::spawn(async move {
        let mut requests = Vec::new();
        while requests.len() < 2 {
            let frame = next_frame(&mut ws).await.expect("request frame");
            if frame["type"] == "request" {
                requests.push(frame);
            }
        }
        requests.reverse();
        for frame in requests {
            let reply = json!({
                "id": frame["id"],
                "type": "response",
                "data": {
                    "status_code": 200,
                    "body": frame["data"]["body"],
                },
            });
            send_frame(&mut ws, reply).await;
        }
    });

    let client = reqwest::Client::new();
    let host = public_host(&subdomain);
    let first = client
        .post(format!("http://{addr}/a"))
        .header(reqwest::header::HOST, &host)
        .body("one")
        .send();
    let second = client
        .post(format!("http://{addr}/b"))
        .header(reqwest::header::HOST, &host)
        .body("two")
        .send();

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap().text().await.unwrap(), "one");
    assert_eq!(second.unwrap().text().await.unwrap(), "two");
}

#[tokio::test]
async fn unknown_subdomain_is_not_found() {
    let (addr, _ctx) = start_gateway(&[]).await;
    let response = reqwest::Client::new()
        .get(format!("http://{addr}/"))
        .header(reqwest::header::HOST, public_host("nobody-00000000"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn agent_disconnect_fails_in_flight_requests() {
    let (addr, ctx) = start_gateway(&[]).await;
    let (mut ws, handshake) = connect_agent(addr, "user_id=alice&local_port=3000").await;
    let subdomain = handshake["data"]["subdomain"].as_str().unwrap().to_string();

    // Agent reads the request and hangs up without answering.
    tokio::spawn(async move {
        loop {
            let Some(frame) = next_frame(&mut ws).await else { break };
            if frame["type"] == "request" {
                break;
            }
        }
        let _ = ws.close(None).await;
    });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/ping"))
        .header(reqwest::header::HOST, public_host(&subdomain))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    // the session removed itself before the failure surfaced
    assert!(ctx.registry.by_subdomain(&subdomain).is_none());
    let response = client
        .get(format!("http://{addr}/ping"))
        .header(reqwest::header::HOST, public_host(&subdomain))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn silent_agent_hits_the_deadline() {
    let (addr, ctx) = start_gateway(&["--request-deadline", "1"]).await;
    let (mut ws, handshake) = connect_agent(addr, "user_id=alice&local_port=3000").await;
    let subdomain = handshake["data"]["subdomain"].as_str().unwrap().to_string();

    // Keep the socket open, never respond.
    tokio::spawn(async move { while next_frame(&mut ws).await.is_some() {} });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/slow"))
        .header(reqwest::header::HOST, public_host(&subdomain))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);

    // the tunnel survives a deadline
    assert!(ctx.registry.by_subdomain(&subdomain).is_some());
    let health: Value = client
        .get(format!("http://{addr}/tunnel/health/{subdomain}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["healthy"], true);
}

#[tokio::test]
async fn per_user_cap_rejects_the_extra_tunnel() {
    let (addr, _ctx) = start_gateway(&["--max-tunnels-per-user", "2"]).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let response = client
            .post(format!("http://{addr}/tunnel/create"))
            .json(&json!({ "user_id": "alice", "local_port": 3000 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }

    let response = client
        .post(format!("http://{addr}/tunnel/create"))
        .json(&json!({ "user_id": "alice", "local_port": 3000 }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_client_error());
    let body: Value = response.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("maximum number of tunnels exceeded"));
}

#[tokio::test]
async fn port_rules_gate_creation() {
    let (addr, _ctx) = start_gateway(&[]).await;
    let client = reqwest::Client::new();

    let restricted = client
        .post(format!("http://{addr}/tunnel/create"))
        .json(&json!({ "user_id": "alice", "local_port": 22 }))
        .send()
        .await
        .unwrap();
    assert_eq!(restricted.status(), 400);
    let body: Value = restricted.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("restricted"));

    let out_of_range = client
        .post(format!("http://{addr}/tunnel/create"))
        .json(&json!({ "user_id": "alice", "local_port": 70000 }))
        .send()
        .await
        .unwrap();
    assert_eq!(out_of_range.status(), 400);

    let allowed = client
        .post(format!("http://{addr}/tunnel/create"))
        .json(&json!({ "user_id": "alice", "local_port": 3000 }))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 201);
}

#[tokio::test]
async fn precreated_tunnel_activates_when_the_agent_attaches() {
    let (addr, _ctx) = start_gateway(&[]).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("http://{addr}/tunnel/create"))
        .json(&json!({ "user_id": "alice", "local_port": 3000 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tunnel_id = created["data"]["tunnel_id"].as_str().unwrap().to_string();
    let subdomain = created["data"]["subdomain"].as_str().unwrap().to_string();
    assert_eq!(created["data"]["status"], "connecting");

    let (ws, handshake) = connect_agent(
        addr,
        &format!("user_id=alice&local_port=3000&tunnel_id={tunnel_id}"),
    )
    .await;
    assert_eq!(handshake["data"]["tunnel_id"], tunnel_id.as_str());
    assert_eq!(handshake["data"]["subdomain"], subdomain.as_str());
    spawn_echo_agent(ws);

    let fetched: Value = client
        .get(format!("http://{addr}/tunnel/{tunnel_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["data"]["status"], "active");

    // proxying works against the pre-created subdomain
    let response = client
        .get(format!("http://{addr}/ping"))
        .header(reqwest::header::HOST, public_host(&subdomain))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "pong");
}

#[tokio::test]
async fn terminated_tunnels_disappear() {
    let (addr, ctx) = start_gateway(&[]).await;
    let (ws, handshake) = connect_agent(addr, "user_id=alice&local_port=3000").await;
    let tunnel_id = handshake["data"]["tunnel_id"].as_str().unwrap().to_string();
    let subdomain = handshake["data"]["subdomain"].as_str().unwrap().to_string();
    spawn_echo_agent(ws);

    let client = reqwest::Client::new();
    let response = client
        .delete(format!("http://{addr}/tunnel/{tunnel_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(ctx.registry.by_subdomain(&subdomain).is_none());

    let response = client
        .delete(format!("http://{addr}/tunnel/{tunnel_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .get(format!("http://{addr}/ping"))
        .header(reqwest::header::HOST, public_host(&subdomain))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn ws_connect_requires_a_user_and_a_sane_port() {
    let (addr, _ctx) = start_gateway(&[]).await;

    let url = format!("ws://{addr}/tunnel/ws/connect?user_id=&local_port=3000");
    assert!(tokio_tungstenite::connect_async(url).await.is_err());

    let url = format!("ws://{addr}/tunnel/ws/connect?user_id=alice&local_port=22");
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
}

#[tokio::test]
async fn stats_reflect_proxied_traffic() {
    let (addr, _ctx) = start_gateway(&[]).await;
    let (ws, handshake) = connect_agent(addr, "user_id=alice&local_port=3000").await;
    let subdomain = handshake["data"]["subdomain"].as_str().unwrap().to_string();
    spawn_echo_agent(ws);

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let response = client
            .get(format!("http://{addr}/ping"))
            .header(reqwest::header::HOST, public_host(&subdomain))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    // analytics are fire-and-forget; give the spawned updates a beat
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let stats: Value = client
        .get(format!("http://{addr}/tunnel/stats/{subdomain}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let data = &stats["data"];
    assert_eq!(data["healthy"], true);
    assert_eq!(data["analytics"]["request_count"], 3);
    assert_eq!(data["analytics"]["status_codes"]["200"], 3);
    assert_eq!(data["analytics"]["endpoints"]["/ping"], 3);
    assert!(data["uptime_seconds"].as_i64().unwrap() >= 0);
}
