//! WebSocket gateway for live combat views
//!
//! A client joins sessions by id. Each join gets a snapshot followed by the
//! session's delta events, forwarded by a task per joined session into the
//! connection's outbound queue. When a subscriber lags, it is told to
//! re-fetch instead of receiving a partial stream.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast::error::RecvError, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AppState, Caller, RollRequest};
use crate::auth::Identity;
use crate::combat::{CombatError, CombatEvent, DiceRoll, SessionSnapshot};

/// Outbound queue size per connection
const OUTBOUND_BUFFER: usize = 64;

/// Registry of open WebSocket connections
#[derive(Default)]
pub struct ConnectionManager {
    /// connection id -> account id
    connections: RwLock<HashMap<String, String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, connection_id: &str, account_id: &str) {
        self.connections
            .write()
            .await
            .insert(connection_id.to_string(), account_id.to_string());
    }

    async fn unregister(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Distinct accounts with at least one open connection
    pub async fn account_count(&self) -> usize {
        let connections = self.connections.read().await;
        let mut accounts: Vec<&String> = connections.values().collect();
        accounts.sort();
        accounts.dedup();
        accounts.len()
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Welcome {
        account_id: String,
        username: String,
    },
    /// Full state on join
    Snapshot { snapshot: SessionSnapshot },
    /// A delta event for a joined session
    Combat(CombatEvent),
    /// Deltas were lost; re-fetch the session
    Resync { session_id: String },
    DiceRollResult { roll: DiceRoll },
    Error {
        error: &'static str,
        message: String,
    },
}

impl From<CombatError> for ServerMessage {
    fn from(e: CombatError) -> Self {
        ServerMessage::Error {
            error: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Messages sent from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    JoinCombat {
        session_id: String,
    },
    LeaveCombat {
        session_id: String,
    },
    RollDice {
        /// Joined session to show a public roll in
        #[serde(default)]
        session_id: Option<String>,
        #[serde(flatten)]
        roll: RollRequest,
    },
    Ping,
}

/// Handle WebSocket upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Caller(identity): Caller,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// Per-connection state
struct Client {
    identity: Identity,
    sender: mpsc::Sender<ServerMessage>,
    joined: HashMap<String, JoinHandle<()>>,
}

impl Client {
    /// Stop forwarding a session and let its channel go if we were the last viewer
    async fn leave(&mut self, state: &AppState, session_id: &str) -> bool {
        match self.joined.remove(session_id) {
            Some(task) => {
                task.abort();
                // the receiver is dropped once the aborted task finishes
                let _ = task.await;
                state.combat.unsubscribe(session_id);
                true
            }
            None => false,
        }
    }

    async fn leave_all(&mut self, state: &AppState) {
        let session_ids: Vec<String> = self.joined.keys().cloned().collect();
        for session_id in session_ids {
            self.leave(state, &session_id).await;
        }
    }
}

async fn send_json(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode server message");
            true
        }
    }
}

/// Handle an individual WebSocket connection
async fn handle_socket(mut socket: WebSocket, state: AppState, identity: Identity) {
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);
    let connection_id = uuid::Uuid::new_v4().to_string();

    info!(connection = %connection_id, user = %identity.username, "WebSocket connected");
    state
        .connections
        .register(&connection_id, &identity.account_id)
        .await;

    let welcome = ServerMessage::Welcome {
        account_id: identity.account_id.clone(),
        username: identity.username.clone(),
    };
    send_json(&mut socket, &welcome).await;

    let mut client = Client {
        identity,
        sender: tx,
        joined: HashMap::new(),
    };

    // replies go straight to the socket; the queue only carries forwarded events
    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                if !send_json(&mut socket, &msg).await {
                    break;
                }
            }
            result = socket.recv() => {
                let reply = match result {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => handle_client_message(&state, &mut client, client_msg).await,
                        Err(e) => Some(ServerMessage::Error {
                            error: "validation",
                            message: format!("bad message: {}", e),
                        }),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection = %connection_id, error = %e, "WebSocket receive failed");
                        break;
                    }
                    _ => None,
                };
                if let Some(reply) = reply {
                    if !send_json(&mut socket, &reply).await {
                        break;
                    }
                }
            }
        }
    }

    client.leave_all(&state).await;
    state.connections.unregister(&connection_id).await;
    info!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle a message from the client, returning the direct reply if any
async fn handle_client_message(
    state: &AppState,
    client: &mut Client,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::JoinCombat { session_id } => match join(state, client, &session_id).await {
            Ok(snapshot) => Some(ServerMessage::Snapshot { snapshot }),
            Err(e) => Some(e.into()),
        },
        ClientMessage::LeaveCombat { session_id } => {
            if client.leave(state, &session_id).await {
                debug!(user = %client.identity.username, session = %session_id, "Left combat");
            }
            None
        }
        ClientMessage::RollDice { session_id, roll } => {
            match roll_dice(state, client, session_id.as_deref(), roll).await {
                Ok(roll) => Some(ServerMessage::DiceRollResult { roll }),
                Err(e) => Some(e.into()),
            }
        }
        ClientMessage::Ping => None,
    }
}

async fn join(
    state: &AppState,
    client: &mut Client,
    session_id: &str,
) -> Result<SessionSnapshot, CombatError> {
    // fails with NotFound before any channel exists for an unknown id
    state.combat.is_controller(&client.identity, session_id).await?;

    // subscribe before the snapshot so nothing committed in between is missed
    let mut events = state.combat.subscribe(session_id);
    let (snapshot, mut filter) = match state.combat.get_view(&client.identity, session_id).await {
        Ok(view) => view,
        Err(e) => {
            drop(events);
            state.combat.unsubscribe(session_id);
            return Err(e);
        }
    };

    client.leave(state, session_id).await;

    let sender = client.sender.clone();
    let id = session_id.to_string();
    let task = tokio::spawn(async move {
        loop {
            let msg = match events.recv().await {
                Ok(event) => match filter.apply(&event) {
                    Some(event) => ServerMessage::Combat(event),
                    None => continue,
                },
                Err(RecvError::Lagged(missed)) => {
                    debug!(session = %id, missed, "Subscriber lagged");
                    ServerMessage::Resync {
                        session_id: id.clone(),
                    }
                }
                Err(RecvError::Closed) => break,
            };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });
    client.joined.insert(session_id.to_string(), task);
    debug!(user = %client.identity.username, session = %session_id, "Joined combat");
    Ok(snapshot)
}

async fn roll_dice(
    state: &AppState,
    client: &Client,
    session_id: Option<&str>,
    roll: RollRequest,
) -> Result<DiceRoll, CombatError> {
    let (request, labels) = roll.into_parts()?;
    let roll = state.combat.roll_dice(&client.identity, &request, labels)?;
    if let Some(session_id) = session_id {
        if client.joined.contains_key(session_id) {
            state.combat.share_roll(session_id, &roll).await?;
        }
    }
    Ok(roll)
}
