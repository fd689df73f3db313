use axum::{
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use dockyard_common::{Event, Topic};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::SharedState;
use crate::events::{EventBus, EventReceiver};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// `/ws?container=<id>&task=<id>`. Both filters are optional.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub container: Option<String>,
    pub task: Option<String>,
}

/// A bus receiver plus the topics the client asked for. An empty filter
/// passes everything through.
pub struct Subscription {
    rx: EventReceiver,
    filter: Vec<Topic>,
}

impl Subscription {
    /// A single filter uses the bus topic channel directly; both filters
    /// fall back to the global stream and filter locally.
    pub fn open(bus: &EventBus, query: WsQuery) -> Self {
        match (query.container, query.task) {
            (None, None) => Self {
                rx: bus.subscribe_all(),
                filter: Vec::new(),
            },
            (Some(container), None) => Self {
                rx: bus.subscribe(Topic::Container(container)),
                filter: Vec::new(),
            },
            (None, Some(task)) => Self {
                rx: bus.subscribe(Topic::Task(task)),
                filter: Vec::new(),
            },
            (Some(container), Some(task)) => Self {
                rx: bus.subscribe_all(),
                filter: vec![Topic::Container(container), Topic::Task(task)],
            },
        }
    }

    pub fn wants(&self, event: &Event) -> bool {
        self.filter.is_empty() || event.topics().iter().any(|t| self.filter.contains(t))
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let subscription = Subscription::open(state.orchestrator.events(), query);
    ws.on_upgrade(move |socket| handle_socket(socket, subscription))
}

async fn handle_socket(socket: WebSocket, subscription: Subscription) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, subscription).await;
}

/// Forward bus events to the client while keeping the connection alive
/// with ping/pong. No Pong within [`PONG_TIMEOUT`] of a Ping closes it.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: Subscription,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("websocket client missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Event forwarding ────────────────────────────────────
            result = subscription.rx.recv() => {
                match result {
                    Ok(event) => {
                        if !subscription.wants(&event) {
                            continue;
                        }
                        let Some(json) = encode(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "websocket client lagged behind the event bus");
                        continue;
                    }
                }
            }

            // ── Client messages (pong, close, etc.) ─────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

fn encode(event: &Event) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "failed to serialize event");
            None
        }
    }
}
