//! Per-agent duplex connection handler.
//!
//! Each accepted WebSocket owns a bounded send buffer and two concurrent
//! activities: this read loop, which unmarshals envelopes and dispatches
//! to handlers, and a writer task that drains the buffer onto the socket.
//! Overflowing the buffer is fatal for the connection — dropping control
//! frames silently would desynchronize both sides.
//!
//! Handling a frame is sequential within a connection; the dispatcher and
//! reconciler run on this read loop, which serializes per-agent admission
//! decisions.

use super::{auth, dispatch, lock_or_recover, reconcile, AppState};
use crate::protocol::{Envelope, Heartbeat, HeartbeatAck, Payload, Register, RegisterAck};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bound on frames queued toward one agent.
pub const SEND_BUFFER_FRAMES: usize = 256;

/// The send buffer is full; the connection must close.
#[derive(Debug)]
pub struct SendBufferFull;

/// Handle for enqueueing outbound frames onto a connection's send buffer.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<String>,
}

impl OutboundSender {
    pub fn enqueue(&self, frame: String) -> Result<(), SendBufferFull> {
        self.tx.try_send(frame).map_err(|_| SendBufferFull)
    }

    /// Test constructor: a sender paired with a receiver the test inspects.
    #[cfg(test)]
    pub(crate) fn test_pair(capacity: usize) -> (OutboundSender, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (OutboundSender { tx }, rx)
    }
}

pub(super) async fn handler_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| connection_loop(socket, state))
}

async fn connection_loop(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(SEND_BUFFER_FRAMES);
    let out = OutboundSender { tx };

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // The agent id this connection authenticated as; set by Register.
    let mut bound: Option<String> = None;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(raw)) => {
                if handle_frame(&state, &mut bound, &out, raw.as_str())
                    .await
                    .is_break()
                {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // Pings are answered by the protocol layer; binary frames are
            // not part of this protocol.
            Ok(_) => {}
        }
    }

    if let Some(agent_id) = bound.take() {
        lock_or_recover(&state.registry).unregister(&agent_id);
        info!(agent_id, "agent disconnected");
    }
    drop(out);
    writer.abort();
}

/// Resolve the connection's bound agent id for a post-registration frame,
/// enforcing that the envelope agrees with it.
fn bound_agent<'a>(
    state: &AppState,
    bound: &'a Option<String>,
    envelope: &Envelope,
) -> Option<&'a str> {
    match bound {
        None => {
            warn!(
                kind = envelope.payload.kind(),
                "frame from unregistered connection discarded"
            );
            state.metrics.record_discard("not_registered");
            None
        }
        Some(id) if *id != envelope.agent_id => {
            warn!(
                bound = %id,
                envelope = %envelope.agent_id,
                "envelope agent_id does not match connection binding"
            );
            state.metrics.record_discard("protocol_mismatch");
            None
        }
        Some(id) => Some(id),
    }
}

async fn handle_frame(
    state: &Arc<AppState>,
    bound: &mut Option<String>,
    out: &OutboundSender,
    raw: &str,
) -> ControlFlow<()> {
    let envelope = match Envelope::unmarshal(raw) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "undecodable control frame discarded");
            state.metrics.record_discard("decode");
            return ControlFlow::Continue(());
        }
    };
    if let Err(e) = envelope.validate() {
        warn!(error = %e, "inconsistent control frame discarded");
        state.metrics.record_discard("protocol_mismatch");
        return ControlFlow::Continue(());
    }

    match &envelope.payload {
        Payload::Register(reg) => handle_register(state, bound, out, reg),
        Payload::Heartbeat(hb) => {
            let Some(agent_id) = bound_agent(state, bound, &envelope) else {
                return ControlFlow::Continue(());
            };
            handle_heartbeat(state, out, agent_id, hb)
        }
        Payload::RequestJob(_) => {
            let Some(agent_id) = bound_agent(state, bound, &envelope) else {
                return ControlFlow::Continue(());
            };
            match dispatch::handle_request_job(state, agent_id, out).await {
                Ok(()) => ControlFlow::Continue(()),
                Err(SendBufferFull) => {
                    warn!(agent_id, "send buffer overflow, closing connection");
                    ControlFlow::Break(())
                }
            }
        }
        Payload::JobStatus(report) => {
            let Some(agent_id) = bound_agent(state, bound, &envelope) else {
                return ControlFlow::Continue(());
            };
            let agent_id = agent_id.to_string();
            reconcile::handle_status_report(state, &agent_id, report).await;
            ControlFlow::Continue(())
        }
        Payload::Unknown => {
            warn!("control frame with unknown payload tag discarded");
            state.metrics.record_discard("unknown_payload");
            ControlFlow::Continue(())
        }
        Payload::RegisterAck(_) | Payload::HeartbeatAck(_) | Payload::JobAssigned(_) => {
            warn!(
                kind = envelope.payload.kind(),
                "gateway-bound frame carried an agent-bound payload"
            );
            state.metrics.record_discard("wrong_direction");
            ControlFlow::Continue(())
        }
    }
}

fn handle_register(
    state: &Arc<AppState>,
    bound: &mut Option<String>,
    out: &OutboundSender,
    reg: &Register,
) -> ControlFlow<()> {
    let reject = |message: String| -> ControlFlow<()> {
        warn!(agent_id = %reg.agent_id, reason = %message, "registration rejected");
        let ack = Payload::RegisterAck(RegisterAck {
            success: false,
            message,
            heartbeat_interval_sec: 0,
        });
        let _ = Envelope::new(reg.agent_id.clone(), ack)
            .marshal()
            .map(|frame| out.enqueue(frame));
        // The agent disconnects on a rejected registration; close our side.
        ControlFlow::Break(())
    };

    if reg.agent_id.is_empty() {
        return reject("agent_id is required".to_string());
    }
    if let Err(reason) =
        auth::validate_agent_token(state.config.jwt_secret.as_deref(), &reg.agent_id, &reg.agent_token)
    {
        return reject(reason);
    }

    lock_or_recover(&state.registry).register(
        reg.agent_id.clone(),
        reg.hostname.clone(),
        reg.max_concurrency,
    );
    *bound = Some(reg.agent_id.clone());
    info!(
        agent_id = %reg.agent_id,
        hostname = %reg.hostname,
        max_concurrency = reg.max_concurrency,
        "agent registered"
    );

    let ack = Payload::RegisterAck(RegisterAck {
        success: true,
        message: String::new(),
        heartbeat_interval_sec: state.config.heartbeat_interval_sec,
    });
    send_or_break(out, Envelope::new(reg.agent_id.clone(), ack))
}

fn handle_heartbeat(
    state: &Arc<AppState>,
    out: &OutboundSender,
    agent_id: &str,
    hb: &Heartbeat,
) -> ControlFlow<()> {
    let known = lock_or_recover(&state.registry).update_heartbeat(
        agent_id,
        hb.paused,
        hb.running_jobs,
    );
    if !known {
        // Connection bound but the entry was pruned; force a re-register.
        warn!(agent_id, "heartbeat from pruned agent");
        return ControlFlow::Break(());
    }
    debug!(agent_id, paused = hb.paused, running = hb.running_jobs, "heartbeat");
    send_or_break(
        out,
        Envelope::new(agent_id, Payload::HeartbeatAck(HeartbeatAck { success: true })),
    )
}

fn send_or_break(out: &OutboundSender, envelope: Envelope) -> ControlFlow<()> {
    match envelope.marshal() {
        Ok(frame) => match out.enqueue(frame) {
            Ok(()) => ControlFlow::Continue(()),
            Err(SendBufferFull) => {
                warn!("send buffer overflow, closing connection");
                ControlFlow::Break(())
            }
        },
        Err(e) => {
            warn!(error = %e, "failed to marshal reply");
            ControlFlow::Continue(())
        }
    }
}
