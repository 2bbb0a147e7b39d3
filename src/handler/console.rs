use super::error::ApiError;
use super::middleware::clientaddr::ClientAddr;
use crate::app::AppState;
use crate::media::relay::{RelayInstruction, RelayMediaAdapter, RelayReport};
use crate::models::CallSession;
use crate::signaling::{
    CallerCommand, CallerEngine, CallerSnapshot, OwnerCommand, OwnerEngine, OwnerSnapshot,
    StartCallRequest,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleKind {
    Owner,
    Caller,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConsoleInfo {
    pub id: String,
    pub kind: ConsoleKind,
    /// Owner id for owner consoles, plate for caller consoles.
    pub subject: String,
    pub client: String,
    pub connected_at: DateTime<Utc>,
}

struct ConsoleEntry {
    info: ConsoleInfo,
    cancel: CancellationToken,
}

/// Live console connections, each with the token that stops its engine.
#[derive(Default)]
pub struct ConsoleRegistry {
    entries: Mutex<HashMap<String, ConsoleEntry>>,
}

impl ConsoleRegistry {
    pub async fn register(&self, info: ConsoleInfo, cancel: CancellationToken) {
        self.entries
            .lock()
            .await
            .insert(info.id.clone(), ConsoleEntry { info, cancel });
    }

    pub async fn remove(&self, id: &str) {
        self.entries.lock().await.remove(id);
    }

    pub async fn list(&self) -> Vec<ConsoleInfo> {
        let mut consoles: Vec<ConsoleInfo> = self
            .entries
            .lock()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        consoles.sort_by_key(|info| info.connected_at);
        consoles
    }

    pub async fn kill(&self, id: &str) -> bool {
        match self.entries.lock().await.remove(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Server to client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleEvent<S> {
    Connected { console_id: String },
    State { state: S },
    Incoming { call: CallSession },
    Media { instruction: RelayInstruction },
    Error { message: String },
}

/// Client to server. UI actions go to the engine; media reports go to the
/// relay adapter backing the engine's media handle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ConsoleCommand {
    Accept,
    Decline,
    Hangup,
    Start {
        #[serde(default)]
        via: Option<String>,
        #[serde(default, alias = "callerInfo")]
        caller_info: Option<Value>,
    },
    Joined {
        #[serde(default)]
        remote_uids: Vec<u32>,
    },
    JoinFailed {
        #[serde(default)]
        reason: String,
        #[serde(default)]
        permission_denied: bool,
    },
    RemotePublished {
        uid: u32,
    },
    RemoteLeft {
        uid: u32,
    },
    TokenWillExpire,
}

impl ConsoleCommand {
    fn relay_report(&self) -> Option<RelayReport> {
        match self {
            ConsoleCommand::Joined { remote_uids } => Some(RelayReport::Joined {
                remote_uids: remote_uids.clone(),
            }),
            ConsoleCommand::JoinFailed {
                reason,
                permission_denied,
            } => Some(RelayReport::JoinFailed {
                reason: reason.clone(),
                permission_denied: *permission_denied,
            }),
            ConsoleCommand::RemotePublished { uid } => {
                Some(RelayReport::RemotePublished { uid: *uid })
            }
            ConsoleCommand::RemoteLeft { uid } => Some(RelayReport::RemoteLeft { uid: *uid }),
            ConsoleCommand::TokenWillExpire => Some(RelayReport::TokenWillExpire),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OwnerConsoleParams {
    #[serde(default)]
    pub owner_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CallerConsoleParams {
    #[serde(default)]
    pub plate: String,
}

/// Returns the new error when it differs from the last one seen.
fn error_transition(last: &mut Option<String>, current: &Option<String>) -> Option<String> {
    if last == current {
        return None;
    }
    *last = current.clone();
    current.clone()
}

fn owner_events() -> impl FnMut(&OwnerSnapshot) -> Vec<ConsoleEvent<OwnerSnapshot>> {
    let mut last_incoming: Option<String> = None;
    let mut last_error: Option<String> = None;
    move |snapshot| {
        let mut events = vec![ConsoleEvent::State {
            state: snapshot.clone(),
        }];
        let incoming_id = snapshot.incoming.as_ref().map(|call| call.id.clone());
        if incoming_id != last_incoming {
            if let Some(call) = &snapshot.incoming {
                events.push(ConsoleEvent::Incoming { call: call.clone() });
            }
            last_incoming = incoming_id;
        }
        if let Some(message) = error_transition(&mut last_error, &snapshot.error) {
            events.push(ConsoleEvent::Error { message });
        }
        events
    }
}

fn caller_events() -> impl FnMut(&CallerSnapshot) -> Vec<ConsoleEvent<CallerSnapshot>> {
    let mut last_error: Option<String> = None;
    move |snapshot| {
        let mut events = vec![ConsoleEvent::State {
            state: snapshot.clone(),
        }];
        if let Some(message) = error_transition(&mut last_error, &snapshot.error) {
            events.push(ConsoleEvent::Error { message });
        }
        events
    }
}

pub async fn list_consoles(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "consoles": state.consoles.list().await,
    }))
    .into_response()
}

pub async fn kill_console(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let killed = state.consoles.kill(&id).await;
    if killed {
        info!(console_id = id, "console killed");
    }
    Json(killed).into_response()
}

/// `GET /api/owner/ws?owner_id=U`
pub async fn owner_console(
    client: ClientAddr,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<OwnerConsoleParams>,
) -> Response {
    let owner_id = params.owner_id.trim().to_string();
    if owner_id.is_empty() {
        return ApiError::bad_request("Missing 'owner_id'").into_response();
    }
    ws.on_upgrade(move |socket| async move {
        let console_id = Uuid::new_v4().to_string();
        info!(console_id, owner_id, client = %client, "owner console connected");
        serve_owner(socket, state, &console_id, &owner_id, client).await;
        info!(console_id, owner_id, "owner console closed");
    })
}

/// `GET /api/caller/ws?plate=P`
pub async fn caller_console(
    client: ClientAddr,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<CallerConsoleParams>,
) -> Response {
    let plate = crate::models::normalize_plate(&params.plate);
    if plate.is_empty() {
        return ApiError::bad_request("Missing plate").into_response();
    }
    ws.on_upgrade(move |socket| async move {
        let console_id = Uuid::new_v4().to_string();
        info!(console_id, plate, client = %client, "caller console connected");
        serve_caller(socket, state, &console_id, &plate, client).await;
        info!(console_id, plate, "caller console closed");
    })
}

async fn serve_owner(
    socket: WebSocket,
    state: AppState,
    console_id: &str,
    owner_id: &str,
    client: ClientAddr,
) {
    let (instructions_tx, instructions) = mpsc::unbounded_channel();
    let relay = RelayMediaAdapter::new(instructions_tx);
    let engine = match OwnerEngine::builder(owner_id)
        .with_calls(state.backends.calls.clone())
        .with_feed(state.backends.feed.clone())
        .with_admission(state.admission.clone())
        .with_media(Arc::new(relay.clone()))
        .with_signaling(state.config.signaling.clone())
        .build()
    {
        Ok(engine) => engine,
        Err(e) => {
            warn!(console_id, "failed to build owner engine: {}", e);
            reject(socket, e.to_string()).await;
            return;
        }
    };

    let cancel = state.token.child_token();
    state
        .consoles
        .register(
            ConsoleInfo {
                id: console_id.to_string(),
                kind: ConsoleKind::Owner,
                subject: owner_id.to_string(),
                client: client.to_string(),
                connected_at: Utc::now(),
            },
            cancel.clone(),
        )
        .await;

    let snapshots = engine.subscribe_state();
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let engine_task = tokio::spawn(engine.run(commands_rx, cancel.clone()));

    let dispatch = move |command: ConsoleCommand| {
        if let Some(report) = command.relay_report() {
            relay.report(report);
            return;
        }
        let command = match command {
            ConsoleCommand::Accept => OwnerCommand::Accept,
            ConsoleCommand::Decline => OwnerCommand::Decline,
            ConsoleCommand::Hangup => OwnerCommand::Hangup,
            other => {
                debug!("owner console ignored {:?}", other);
                return;
            }
        };
        commands.send(command).ok();
    };

    pump(
        socket,
        console_id,
        snapshots,
        instructions,
        owner_events(),
        dispatch,
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    if let Err(e) = engine_task.await {
        warn!(console_id, "owner engine task failed: {}", e);
    }
    state.consoles.remove(console_id).await;
}

async fn serve_caller(
    socket: WebSocket,
    state: AppState,
    console_id: &str,
    plate: &str,
    client: ClientAddr,
) {
    let (instructions_tx, instructions) = mpsc::unbounded_channel();
    let relay = RelayMediaAdapter::new(instructions_tx);
    let engine = CallerEngine::new(
        plate,
        state.starter.clone(),
        state.admission.clone(),
        Arc::new(relay.clone()),
    );

    let cancel = state.token.child_token();
    state
        .consoles
        .register(
            ConsoleInfo {
                id: console_id.to_string(),
                kind: ConsoleKind::Caller,
                subject: plate.to_string(),
                client: client.to_string(),
                connected_at: Utc::now(),
            },
            cancel.clone(),
        )
        .await;

    let snapshots = engine.subscribe_state();
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let engine_task = tokio::spawn(engine.run(commands_rx, cancel.clone()));

    let dispatch = move |command: ConsoleCommand| {
        if let Some(report) = command.relay_report() {
            relay.report(report);
            return;
        }
        let command = match command {
            ConsoleCommand::Start { via, caller_info } => CallerCommand::Start(StartCallRequest {
                // the engine fills in its own plate
                plate: String::new(),
                via,
                caller_info,
            }),
            ConsoleCommand::Hangup => CallerCommand::Hangup,
            other => {
                debug!("caller console ignored {:?}", other);
                return;
            }
        };
        commands.send(command).ok();
    };

    pump(
        socket,
        console_id,
        snapshots,
        instructions,
        caller_events(),
        dispatch,
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    if let Err(e) = engine_task.await {
        warn!(console_id, "caller engine task failed: {}", e);
    }
    state.consoles.remove(console_id).await;
}

async fn send_event<S: Serialize>(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ConsoleEvent<S>,
) -> bool {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to serialize console event: {}", e);
            return true;
        }
    };
    match sender.send(Message::Text(json.into())).await {
        Ok(_) => true,
        Err(e) => {
            debug!("failed to send console event: {}", e);
            false
        }
    }
}

async fn reject(socket: WebSocket, message: String) {
    let (mut sender, _) = socket.split();
    send_event::<()>(&mut sender, &ConsoleEvent::Error { message }).await;
    sender.close().await.ok();
}

/// Runs the socket until the client goes away or `cancel` fires: snapshots and
/// relay instructions flow out, commands flow in.
async fn pump<S, E, D>(
    socket: WebSocket,
    console_id: &str,
    mut snapshots: watch::Receiver<S>,
    mut instructions: mpsc::UnboundedReceiver<RelayInstruction>,
    mut events_for: E,
    dispatch: D,
    cancel: CancellationToken,
) where
    S: Serialize + Clone + Send + Sync + 'static,
    E: FnMut(&S) -> Vec<ConsoleEvent<S>> + Send + 'static,
    D: Fn(ConsoleCommand) + Send + 'static,
{
    let (mut sender, mut receiver) = socket.split();

    let outbound_cancel = cancel.clone();
    let connected = ConsoleEvent::<S>::Connected {
        console_id: console_id.to_string(),
    };
    let mut outbound = tokio::spawn(async move {
        if !send_event(&mut sender, &connected).await {
            return;
        }
        let initial = snapshots.borrow_and_update().clone();
        for event in events_for(&initial) {
            if !send_event(&mut sender, &event).await {
                return;
            }
        }
        loop {
            let events = tokio::select! {
                _ = outbound_cancel.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    events_for(&snapshot)
                }
                Some(instruction) = instructions.recv() => {
                    vec![ConsoleEvent::Media { instruction }]
                }
            };
            for event in events {
                if !send_event(&mut sender, &event).await {
                    return;
                }
            }
        }
        sender.close().await.ok();
    });

    let inbound_console = console_id.to_string();
    let mut inbound = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ConsoleCommand>(text.as_str()) {
                        Ok(command) => dispatch(command),
                        Err(e) => {
                            warn!(console_id = inbound_console, "bad console command: {}", e)
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(console_id = inbound_console, "console closed by client");
                    break;
                }
                Err(e) => {
                    debug!(console_id = inbound_console, "console socket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut inbound => {}
        _ = &mut outbound => {}
    }
    inbound.abort();
    outbound.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{CallerPhase, OwnerPhase};
    use serde_json::json;

    fn ringing_row(id: &str) -> CallSession {
        serde_json::from_value(json!({
            "id": id,
            "plate": "UP14AB1234",
            "channel": "UP14AB1234",
            "owner_id": "U1",
            "status": "ringing",
            "caller_info": {"via": "qr"},
            "created_at": "2026-01-01T00:00:00Z",
            "accepted_at": null,
            "ended_at": null,
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_commands() {
        let parse = |v: Value| serde_json::from_value::<ConsoleCommand>(v).unwrap();
        assert_eq!(parse(json!({"command": "accept"})), ConsoleCommand::Accept);
        assert_eq!(
            parse(json!({"command": "start", "via": "qr"})),
            ConsoleCommand::Start {
                via: Some("qr".to_string()),
                caller_info: None,
            }
        );
        assert_eq!(
            parse(json!({"command": "joined"})),
            ConsoleCommand::Joined {
                remote_uids: vec![]
            }
        );
        let failed = parse(json!({
            "command": "join_failed",
            "reason": "NotAllowedError",
            "permission_denied": true,
        }));
        assert_eq!(
            failed.relay_report(),
            Some(RelayReport::JoinFailed {
                reason: "NotAllowedError".to_string(),
                permission_denied: true,
            })
        );
        assert!(ConsoleCommand::Hangup.relay_report().is_none());
        assert!(serde_json::from_value::<ConsoleCommand>(json!({"command": "dial"})).is_err());
    }

    #[test]
    fn test_owner_events_announce_incoming_once() {
        let mut events_for = owner_events();
        let mut snapshot = OwnerSnapshot {
            owner_id: "U1".to_string(),
            phase: OwnerPhase::Waiting,
            incoming: None,
            error: None,
        };
        assert_eq!(events_for(&snapshot).len(), 1);

        snapshot.phase = OwnerPhase::Ringing;
        snapshot.incoming = Some(ringing_row("c1"));
        let events = events_for(&snapshot);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], ConsoleEvent::Incoming { call } if call.id == "c1"));

        snapshot.phase = OwnerPhase::Connecting;
        assert_eq!(events_for(&snapshot).len(), 1);

        snapshot.phase = OwnerPhase::Waiting;
        snapshot.incoming = None;
        snapshot.error = Some("Audio connection failed".to_string());
        let events = events_for(&snapshot);
        assert!(matches!(&events[1], ConsoleEvent::Error { message } if message.contains("Audio")));
        // same error is not repeated
        assert_eq!(events_for(&snapshot).len(), 1);
    }

    #[test]
    fn test_event_wire_shape() {
        let mut events_for = caller_events();
        let events = events_for(&CallerSnapshot {
            plate: "UP14AB1234".to_string(),
            phase: CallerPhase::Calling,
            call: None,
            error: None,
        });
        let value = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(value["type"], "state");
        assert_eq!(value["state"]["phase"], "calling");

        let media = ConsoleEvent::<()>::Media {
            instruction: RelayInstruction::Leave {
                channel: "UP14AB1234".to_string(),
            },
        };
        let value = serde_json::to_value(&media).unwrap();
        assert_eq!(value["type"], "media");
        assert_eq!(value["instruction"]["action"], "leave");
    }

    #[tokio::test]
    async fn test_registry_kill_cancels() {
        let registry = ConsoleRegistry::default();
        let cancel = CancellationToken::new();
        registry
            .register(
                ConsoleInfo {
                    id: "c1".to_string(),
                    kind: ConsoleKind::Owner,
                    subject: "U1".to_string(),
                    client: "127.0.0.1:1".to_string(),
                    connected_at: Utc::now(),
                },
                cancel.clone(),
            )
            .await;
        assert_eq!(registry.list().await.len(), 1);
        assert!(!registry.kill("nope").await);
        assert!(registry.kill("c1").await);
        assert!(cancel.is_cancelled());
        assert_eq!(registry.len().await, 0);
    }
}
