use futures::{SinkExt, StreamExt};
use platecall::{
    app::{create_router, AppState, AppStateBuilder},
    config::{Config, MediaConfig, SignalingConfig},
    models::{CallStatus, NewCallSession, Vehicle},
    store::{Backends, MemoryStore},
};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

async fn serve() -> (SocketAddr, AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::with_vehicles(vec![Vehicle::new(
        "UP14AB1234",
        "U1",
    )]));
    let state = AppStateBuilder::new()
        .with_config(Config {
            media: MediaConfig {
                app_id: Some("app".to_string()),
                app_certificate: Some("cert".to_string()),
                ..Default::default()
            },
            signaling: SignalingConfig {
                poll_interval_ms: 200,
                ..Default::default()
            },
            ..Default::default()
        })
        .with_backends(Backends::memory(store.clone()))
        .build()
        .await
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .ok();
    });
    (addr, state, store)
}

/// Test client for a console socket. State snapshots and media instructions
/// race each other, so events that don't match the current expectation are
/// kept for later ones instead of being dropped.
struct Console {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    backlog: Vec<Value>,
}

impl Console {
    async fn connect(addr: SocketAddr, path: &str) -> Self {
        let (ws, _) = connect_async(format!("ws://{}{}", addr, path))
            .await
            .unwrap();
        Self {
            ws,
            backlog: Vec::new(),
        }
    }

    async fn send(&mut self, command: Value) {
        self.ws
            .send(Message::text(command.to_string()))
            .await
            .unwrap();
    }

    async fn expect(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        if let Some(pos) = self.backlog.iter().position(|e| pred(e)) {
            return self.backlog.remove(pos);
        }
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for console event")
                .expect("console closed")
                .unwrap();
            let Some(event) = msg
                .to_text()
                .ok()
                .and_then(|text| serde_json::from_str::<Value>(text).ok())
            else {
                continue;
            };
            if pred(&event) {
                return event;
            }
            self.backlog.push(event);
        }
    }

    async fn closed(&mut self) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(msg)) = self.ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}

fn media(action: &'static str) -> impl Fn(&Value) -> bool {
    move |e| e["type"] == "media" && e["instruction"]["action"] == action
}

fn phase(phase: &'static str) -> impl Fn(&Value) -> bool {
    move |e| e["type"] == "state" && e["state"]["phase"] == phase
}

async fn wait_for_status(store: &MemoryStore, id: &str, status: CallStatus) {
    for _ in 0..50 {
        let rows = store.sessions().await;
        if rows.iter().any(|row| row.id == id && row.status == status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("call {} never reached {:?}", id, status);
}

#[tokio::test]
async fn test_scan_ring_accept_hangup() {
    let (addr, _state, store) = serve().await;

    let mut owner = Console::connect(addr, "/api/owner/ws?owner_id=U1").await;
    owner.expect(|e| e["type"] == "connected").await;
    owner.expect(phase("waiting")).await;

    let mut caller = Console::connect(addr, "/api/caller/ws?plate=up14ab1234").await;
    caller.expect(phase("idle")).await;
    caller.send(json!({"command": "start", "via": "qr"})).await;

    let join = caller.expect(media("join")).await;
    assert_eq!(join["instruction"]["credentials"]["channel"], "UP14AB1234");
    assert!(join["instruction"]["credentials"]["token"]
        .as_str()
        .unwrap()
        .starts_with("006app"));
    caller
        .send(json!({"command": "joined", "remote_uids": []}))
        .await;
    caller.expect(media("publish")).await;
    let connected = caller.expect(phase("connected")).await;
    assert_eq!(
        connected["state"]["call"]["caller_info"],
        json!({"via": "qr"})
    );
    let id = connected["state"]["call"]["id"].as_str().unwrap().to_string();

    let incoming = owner.expect(|e| e["type"] == "incoming").await;
    assert_eq!(incoming["call"]["id"], id.as_str());
    owner.send(json!({"command": "accept"})).await;
    owner.expect(media("join")).await;
    owner
        .send(json!({"command": "joined", "remote_uids": [7]}))
        .await;
    owner.expect(media("publish")).await;
    let subscribe = owner.expect(media("subscribe")).await;
    assert_eq!(subscribe["instruction"]["uid"], 7);
    owner.expect(phase("connected")).await;
    wait_for_status(&store, &id, CallStatus::Accepted).await;

    owner.send(json!({"command": "hangup"})).await;
    owner.expect(media("leave")).await;
    owner.expect(phase("waiting")).await;
    wait_for_status(&store, &id, CallStatus::Ended).await;

    caller.send(json!({"command": "hangup"})).await;
    caller.expect(media("leave")).await;
    caller.expect(phase("idle")).await;
}

#[tokio::test]
async fn test_permission_denied_then_decline() {
    let (addr, _state, store) = serve().await;
    let mut owner = Console::connect(addr, "/api/owner/ws?owner_id=U1").await;
    owner.expect(phase("waiting")).await;

    let mut caller = Console::connect(addr, "/api/caller/ws?plate=UP14AB1234").await;
    caller.send(json!({"command": "start"})).await;
    let calling = caller
        .expect(|e| phase("calling")(e) && e["state"]["call"].is_object())
        .await;
    let first = calling["state"]["call"]["id"].as_str().unwrap().to_string();
    caller.expect(media("join")).await;
    caller
        .send(json!({
            "command": "join_failed",
            "reason": "NotAllowedError",
            "permission_denied": true,
        }))
        .await;
    let idle = caller
        .expect(|e| phase("idle")(e) && e["state"]["error"].is_string())
        .await;
    assert!(idle["state"]["error"]
        .as_str()
        .unwrap()
        .contains("Microphone"));
    caller.expect(|e| e["type"] == "error").await;
    // the failed start closes its own row
    wait_for_status(&store, &first, CallStatus::Ended).await;

    caller.send(json!({"command": "start"})).await;
    let calling = caller
        .expect(|e| phase("calling")(e) && e["state"]["call"]["id"].is_string())
        .await;
    let second = calling["state"]["call"]["id"].as_str().unwrap().to_string();
    assert_ne!(first, second);

    let second_id = second.clone();
    owner
        .expect(move |e| e["type"] == "incoming" && e["call"]["id"] == second_id.as_str())
        .await;
    owner.send(json!({"command": "decline"})).await;
    wait_for_status(&store, &second, CallStatus::Declined).await;
}

#[tokio::test]
async fn test_disconnect_and_kill_tear_down() {
    let (addr, state, store) = serve().await;
    let mut owner = Console::connect(addr, "/api/owner/ws?owner_id=U1").await;
    owner.expect(phase("waiting")).await;
    assert_eq!(state.consoles.list().await.len(), 1);

    // written behind the change feed's back, so only the poll can find it
    let row = NewCallSession {
        plate: "UP14AB1234".to_string(),
        owner_id: "U1".to_string(),
        caller_info: json!({"via": "api"}),
    }
    .into_session(chrono::Utc::now());
    store.seed_session(row.clone()).await;

    owner.expect(|e| e["type"] == "incoming").await;
    owner.send(json!({"command": "accept"})).await;
    owner.expect(media("join")).await;
    owner.send(json!({"command": "joined"})).await;
    owner.expect(phase("connected")).await;

    // closing the socket runs the same cleanup as hangup
    owner.ws.close(None).await.ok();
    drop(owner);
    wait_for_status(&store, &row.id, CallStatus::Ended).await;
    for _ in 0..50 {
        if state.consoles.list().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(state.consoles.list().await.is_empty());

    let mut caller = Console::connect(addr, "/api/caller/ws?plate=UP14AB1234").await;
    caller.expect(phase("idle")).await;
    let consoles = state.consoles.list().await;
    assert_eq!(consoles.len(), 1);
    assert!(state.consoles.kill(&consoles[0].id).await);
    assert!(caller.closed().await);
}
