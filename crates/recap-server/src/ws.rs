//! Live job subscription over WebSocket.
//!
//! Delivery order per connection: one `initial` message with the current
//! snapshot, then `update` deltas, then one `terminal` message, after
//! which the channel closes. Clients reconnecting after a drop present
//! their last seen sequence to skip replay. A subscriber that lags
//! behind the bus is resynced from a fresh snapshot instead of
//! backpressuring the controller.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

use recap_models::{JobId, JobSnapshot, ProgressEvent, WsEvent};
use recap_store::JobStore as _;

use crate::error::ApiResult;
use crate::handlers::jobs::owned_snapshot;
use crate::state::{owner_id, AppState};

const WS_SEND_BUFFER_SIZE: usize = 32;
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    /// Last sequence the client saw before reconnecting
    #[serde(default)]
    pub last_seq: Option<u64>,
}

/// GET /api/jobs/{id}/events
pub async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    Query(params): Query<SubscribeParams>,
) -> ApiResult<Response> {
    let owner = owner_id(&headers)?;
    let job_id = JobId::from_string(job_id);
    // Ownership is checked before the upgrade; a bad job id fails the
    // handshake with a regular HTTP error.
    owned_snapshot(&state, &owner, &job_id).await?;

    Ok(ws.on_upgrade(move |socket| handle_events_socket(socket, state, job_id, params.last_seq)))
}

/// Synthesize the terminal message for a job that is already finished.
fn terminal_event(snapshot: &JobSnapshot) -> ProgressEvent {
    ProgressEvent {
        job_id: snapshot.id.clone(),
        sequence: snapshot.event_seq,
        stage: snapshot.stage,
        progress: snapshot.progress,
        current_step: snapshot.current_step.clone(),
        segments_completed: snapshot.segments_completed,
        segments_planned: snapshot.segments_planned,
        terminal_error: snapshot.error.clone(),
    }
}

async fn send_event(tx: &mpsc::Sender<Message>, event: &WsEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => tx.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize ws event");
            false
        }
    }
}

async fn handle_events_socket(
    socket: WebSocket,
    state: AppState,
    job_id: JobId,
    last_seq: Option<u64>,
) {
    let (ws_sender, mut receiver) = socket.split();

    // Bounded send channel: the forwarding task absorbs bursts, the
    // handler never blocks the bus.
    let (tx, mut rx) = mpsc::channel::<Message>(WS_SEND_BUFFER_SIZE);
    let send_task = tokio::spawn(async move {
        let mut ws_sender = ws_sender;
        while let Some(message) = rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // Subscribe before reading the snapshot so no event falls between.
    let snapshot = match state.store.get_snapshot(&job_id).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Snapshot failed for ws subscriber");
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };
    state.bus.ensure(&job_id, snapshot.event_seq);
    let subscription = state.bus.subscribe(&job_id, last_seq);

    if !send_event(&tx, &WsEvent::Initial { snapshot: snapshot.clone() }).await {
        drop(tx);
        let _ = send_task.await;
        return;
    }

    if snapshot.is_terminal() {
        let event = terminal_event(&snapshot);
        send_event(&tx, &WsEvent::Terminal { event }).await;
        drop(tx);
        let _ = send_task.await;
        return;
    }

    let Some((replay, mut live)) = subscription else {
        drop(tx);
        let _ = send_task.await;
        return;
    };

    info!(job_id = %job_id, replayed = replay.len(), "WebSocket subscriber attached");
    for event in replay {
        let terminal = event.is_terminal();
        let message = if terminal {
            WsEvent::Terminal { event }
        } else {
            WsEvent::Update { event }
        };
        if !send_event(&tx, &message).await || terminal {
            drop(tx);
            let _ = send_task.await;
            return;
        }
    }

    let mut heartbeat = interval(WS_HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            event = live.recv() => {
                match event {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        let message = if terminal {
                            WsEvent::Terminal { event }
                        } else {
                            WsEvent::Update { event }
                        };
                        if !send_event(&tx, &message).await || terminal {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropped subscriber: resync from the snapshot.
                        debug!(job_id = %job_id, missed, "Subscriber lagged, resyncing");
                        match state.store.get_snapshot(&job_id).await {
                            Ok(snapshot) => {
                                let terminal = snapshot.is_terminal();
                                if !send_event(&tx, &WsEvent::Initial { snapshot: snapshot.clone() }).await {
                                    break;
                                }
                                if terminal {
                                    send_event(&tx, &WsEvent::Terminal { event: terminal_event(&snapshot) }).await;
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Channel pruned at terminal publish; make sure the
                        // client still gets the terminal message.
                        if let Ok(snapshot) = state.store.get_snapshot(&job_id).await {
                            if snapshot.is_terminal() {
                                send_event(&tx, &WsEvent::Terminal { event: terminal_event(&snapshot) }).await;
                            }
                        }
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                // Ping, and catch a terminal state the bus may have pruned
                // before this subscriber attached.
                if let Ok(snapshot) = state.store.get_snapshot(&job_id).await {
                    if snapshot.is_terminal() {
                        send_event(&tx, &WsEvent::Terminal { event: terminal_event(&snapshot) }).await;
                        break;
                    }
                }
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            client = receiver.next() => {
                match client {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(job_id = %job_id, "Client closed subscription");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    drop(tx);
    let _ = send_task.await;
    info!(job_id = %job_id, "WebSocket subscriber detached");
}
