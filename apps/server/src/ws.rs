use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use call_proto::{CallEndReason, ClientEvent, Role, ServerEvent};

use crate::auth::{self, AuthError, Principal};
use crate::presence::{ConnId, Tx};
use crate::relay;
use crate::session::{
    AcceptOutcome, CallSession, CallTarget, CancelOutcome, EndOutcome, RejectOutcome,
};
use crate::state::AppState;

/// Role group rung by a broadcast call.
const BROADCAST_RING_ROLES: [Role; 2] = [Role::Admin, Role::Staff];

/// Faults surfaced to the sender as an `error` event. Race losses and offline
/// relay targets are deliberately not in here.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("register before sending call events")]
    NotRegistered,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("tenant does not match registration")]
    TenantMismatch,
    #[error("call session not found")]
    SessionNotFound,
    #[error("not permitted")]
    Forbidden,
    #[error("already in a call")]
    Busy,
}

impl EventError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotRegistered => "validation",
            Self::Auth(_) => "auth",
            Self::TenantMismatch | Self::Forbidden => "forbidden",
            Self::SessionNotFound => "not-found",
            Self::Busy => "busy",
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id: ConnId = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    tracing::debug!(conn = %conn_id, "socket connected");

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    if let Err(err) = dispatch(&state, conn_id, &tx, event) {
                        send(&tx, &ServerEvent::Error {
                            code: err.code().to_string(),
                            message: err.to_string(),
                        });
                    }
                }
                Err(err) => send(&tx, &ServerEvent::Error {
                    code: "validation".to_string(),
                    message: format!("malformed event: {err}"),
                }),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Presence must be gone before the sweep so no relay can resolve the dead
    // handle in between.
    state.presence.unregister(conn_id);
    for session in state.sessions.disconnect_sweep(conn_id) {
        notify_swept(&state, conn_id, &session);
    }
    writer.abort();
    tracing::debug!(conn = %conn_id, "socket disconnected");
}

fn dispatch(
    state: &AppState,
    conn_id: ConnId,
    tx: &Tx,
    event: ClientEvent,
) -> Result<(), EventError> {
    if let ClientEvent::Register { token } = &event {
        return handle_register(state, conn_id, tx, token);
    }

    let principal = state
        .presence
        .principal(conn_id)
        .ok_or(EventError::NotRegistered)?;

    match event {
        ClientEvent::Register { .. } => Ok(()), // handled above
        ClientEvent::CallInitiate {
            tenant_id,
            target_user_id,
        } => handle_initiate(state, conn_id, &principal, tenant_id, target_user_id),
        ClientEvent::CallAccept { session_id } => {
            handle_accept(state, conn_id, &principal, session_id)
        }
        ClientEvent::CallReject { session_id } => {
            handle_reject(state, conn_id, &principal, session_id)
        }
        ClientEvent::CallCancel { session_id } => handle_cancel(state, &principal, session_id),
        ClientEvent::CallEnd { session_id } => handle_end(state, &principal, session_id),
        ClientEvent::WebrtcOffer {
            session_id,
            target_handle,
            sdp,
        } => {
            relay::forward(&state.presence, target_handle, &ServerEvent::WebrtcOffer {
                session_id,
                sender_handle: conn_id,
                sdp,
            });
            Ok(())
        }
        ClientEvent::WebrtcAnswer {
            session_id,
            target_handle,
            sdp,
        } => {
            relay::forward(&state.presence, target_handle, &ServerEvent::WebrtcAnswer {
                session_id,
                sender_handle: conn_id,
                sdp,
            });
            Ok(())
        }
        ClientEvent::WebrtcIceCandidate {
            session_id,
            target_handle,
            candidate,
        } => {
            relay::forward(&state.presence, target_handle, &ServerEvent::WebrtcIceCandidate {
                session_id,
                sender_handle: conn_id,
                candidate,
            });
            Ok(())
        }
    }
}

fn handle_register(
    state: &AppState,
    conn_id: ConnId,
    tx: &Tx,
    token: &str,
) -> Result<(), EventError> {
    let principal = auth::verify_token(token)?;
    tracing::info!(
        conn = %conn_id,
        user = %principal.user_id,
        role = ?principal.role,
        tenant = %principal.tenant_id,
        "📡 registered on signaling socket"
    );
    state.presence.register(conn_id, principal, tx.clone());
    send(tx, &ServerEvent::Registered { handle: conn_id });
    Ok(())
}

fn handle_initiate(
    state: &AppState,
    conn_id: ConnId,
    principal: &Principal,
    tenant_id: Uuid,
    target_user_id: Option<Uuid>,
) -> Result<(), EventError> {
    if tenant_id != principal.tenant_id {
        return Err(EventError::TenantMismatch);
    }
    if state.sessions.is_busy(principal.user_id) {
        return Err(EventError::Busy);
    }

    let session = match target_user_id {
        Some(target) => state
            .sessions
            .create_direct(principal.user_id, conn_id, tenant_id, target),
        None => state.sessions.create_broadcast(
            principal.user_id,
            conn_id,
            tenant_id,
            BROADCAST_RING_ROLES.to_vec(),
        ),
    };
    let session_id = session.session_id;

    let invite = ServerEvent::IncomingCall {
        session_id,
        caller_user_id: principal.user_id,
        caller_display_name: principal.display_name.clone(),
    };
    let mut notified_users = Vec::new();
    match &session.target {
        CallTarget::Direct { user_id } => {
            if let Some(handle) = state.presence.lookup(*user_id) {
                if state.presence.send_to(handle, &invite) {
                    notified_users.push(*user_id);
                }
            }
        }
        CallTarget::Broadcast { roles } => {
            for handle in state.presence.list_by_tenant_and_roles(tenant_id, roles) {
                if handle == conn_id {
                    continue;
                }
                let Some(peer) = state.presence.principal(handle) else {
                    continue;
                };
                if peer.user_id == principal.user_id {
                    continue;
                }
                if state.presence.send_to(handle, &invite) {
                    notified_users.push(peer.user_id);
                }
            }
        }
    }
    state
        .sessions
        .record_fanout(session_id, notified_users.iter().copied());

    state
        .presence
        .send_to(conn_id, &ServerEvent::CallRinging { session_id });

    // Armed after fan-out; an accept racing the deadline is resolved by the
    // store's state gate.
    let expiring = state.clone();
    state
        .sessions
        .arm_expiry(session_id, async move { expire_session(expiring, session_id) });

    tracing::info!(
        %session_id,
        caller = %principal.user_id,
        call_type = session.target.call_type(),
        notified = notified_users.len(),
        "📞 call ringing"
    );
    Ok(())
}

fn handle_accept(
    state: &AppState,
    conn_id: ConnId,
    principal: &Principal,
    session_id: Uuid,
) -> Result<(), EventError> {
    let Some(session) = state.sessions.get(session_id) else {
        // already resolved and gone; a defined outcome for the loser
        state
            .presence
            .send_to(conn_id, &ServerEvent::CallUnavailable { session_id });
        return Ok(());
    };
    if session.tenant_id != principal.tenant_id {
        return Err(EventError::Forbidden);
    }
    if state.sessions.is_busy(principal.user_id) {
        return Err(EventError::Busy);
    }

    match state
        .sessions
        .try_accept(session_id, principal.user_id, conn_id)
    {
        AcceptOutcome::Accepted(session) => {
            let caller_name = state
                .presence
                .principal(session.caller_handle)
                .map(|caller| caller.display_name)
                .unwrap_or_default();

            state.presence.send_to(session.caller_handle, &ServerEvent::CallAccepted {
                session_id,
                peer_handle: conn_id,
                peer_user_id: principal.user_id,
                peer_display_name: principal.display_name.clone(),
            });
            state.presence.send_to(conn_id, &ServerEvent::CallConnected {
                session_id,
                peer_handle: session.caller_handle,
                peer_user_id: session.caller_user_id,
                peer_display_name: caller_name,
            });
            tracing::info!(%session_id, receiver = %principal.user_id, "✅ call accepted");
            Ok(())
        }
        AcceptOutcome::AlreadyResolved | AcceptOutcome::NotFound => {
            state
                .presence
                .send_to(conn_id, &ServerEvent::CallUnavailable { session_id });
            Ok(())
        }
    }
}

fn handle_reject(
    state: &AppState,
    conn_id: ConnId,
    principal: &Principal,
    session_id: Uuid,
) -> Result<(), EventError> {
    let session = state
        .sessions
        .get(session_id)
        .ok_or(EventError::SessionNotFound)?;
    if session.tenant_id != principal.tenant_id {
        return Err(EventError::Forbidden);
    }

    match state.sessions.reject(session_id, principal.user_id) {
        RejectOutcome::NotFound => Err(EventError::SessionNotFound),
        RejectOutcome::Acknowledged => {
            state
                .presence
                .send_to(conn_id, &ServerEvent::CallRejectedAck { session_id });
            Ok(())
        }
        RejectOutcome::Exhausted(session) => {
            state
                .presence
                .send_to(conn_id, &ServerEvent::CallRejectedAck { session_id });
            state.presence.send_to(session.caller_handle, &ServerEvent::CallEnded {
                session_id,
                reason: CallEndReason::NoAnswer,
                duration_seconds: 0,
            });
            notify_ring_group(
                state,
                &session,
                &ServerEvent::CallCancelled { session_id },
                &[session.caller_handle, conn_id],
            );
            tracing::info!(%session_id, "call rejected by every notified receiver");
            Ok(())
        }
    }
}

fn handle_cancel(state: &AppState, principal: &Principal, session_id: Uuid) -> Result<(), EventError> {
    match state.sessions.cancel(session_id, principal.user_id) {
        CancelOutcome::NotFound => Err(EventError::SessionNotFound),
        CancelOutcome::Forbidden => Err(EventError::Forbidden),
        CancelOutcome::Ended(session) => {
            state.presence.send_to(session.caller_handle, &ServerEvent::CallEnded {
                session_id,
                reason: CallEndReason::Ended,
                duration_seconds: 0,
            });
            notify_ring_group(
                state,
                &session,
                &ServerEvent::CallCancelled { session_id },
                &[session.caller_handle],
            );
            tracing::info!(%session_id, "🚫 call cancelled by caller");
            Ok(())
        }
    }
}

fn handle_end(state: &AppState, principal: &Principal, session_id: Uuid) -> Result<(), EventError> {
    match state.sessions.end(session_id, principal.user_id) {
        EndOutcome::NotFound => Err(EventError::SessionNotFound),
        EndOutcome::Forbidden => Err(EventError::Forbidden),
        EndOutcome::Ended(session) => {
            if let Some(receiver_handle) = session.receiver_handle {
                let duration_seconds = session.duration_seconds();
                let ended = ServerEvent::CallEnded {
                    session_id,
                    reason: CallEndReason::Ended,
                    duration_seconds,
                };
                state.presence.send_to(session.caller_handle, &ended);
                state.presence.send_to(receiver_handle, &ended);
                tracing::info!(%session_id, duration_seconds, "📴 call ended");
            } else {
                // caller hung up while the call was still ringing
                state.presence.send_to(session.caller_handle, &ServerEvent::CallEnded {
                    session_id,
                    reason: CallEndReason::Ended,
                    duration_seconds: 0,
                });
                notify_ring_group(
                    state,
                    &session,
                    &ServerEvent::CallCancelled { session_id },
                    &[session.caller_handle],
                );
                tracing::info!(%session_id, "📴 ringing call ended by caller");
            }
            Ok(())
        }
    }
}

/// Ring deadline callback. The store's state gate guarantees this is a no-op
/// when an accept or cancel got there first.
fn expire_session(state: AppState, session_id: Uuid) {
    let Some(session) = state.sessions.expire(session_id) else {
        return;
    };
    tracing::info!(%session_id, "call rang out unanswered");
    state.presence.send_to(session.caller_handle, &ServerEvent::CallEnded {
        session_id,
        reason: CallEndReason::NoAnswer,
        duration_seconds: 0,
    });
    notify_ring_group(
        &state,
        &session,
        &ServerEvent::CallCancelled { session_id },
        &[session.caller_handle],
    );
}

fn notify_swept(state: &AppState, dropped: ConnId, session: &CallSession) {
    let session_id = session.session_id;
    if let Some(receiver_handle) = session.receiver_handle {
        // connected call: the surviving peer learns the line dropped
        let peer = if session.caller_handle == dropped {
            receiver_handle
        } else {
            session.caller_handle
        };
        state.presence.send_to(peer, &ServerEvent::CallEnded {
            session_id,
            reason: CallEndReason::Disconnected,
            duration_seconds: session.duration_seconds(),
        });
    } else {
        // caller vanished mid-ring
        notify_ring_group(
            state,
            session,
            &ServerEvent::CallCancelled { session_id },
            &[session.caller_handle],
        );
    }
    tracing::info!(%session_id, conn = %dropped, "session swept after disconnect");
}

/// Re-resolve the session's ring group and deliver `event` to every member
/// except the handles in `skip`. Receivers that went offline since fan-out
/// simply drop out of the set.
fn notify_ring_group(state: &AppState, session: &CallSession, event: &ServerEvent, skip: &[ConnId]) {
    match &session.target {
        CallTarget::Direct { user_id } => {
            if let Some(handle) = state.presence.lookup(*user_id) {
                if !skip.contains(&handle) {
                    state.presence.send_to(handle, event);
                }
            }
        }
        CallTarget::Broadcast { roles } => {
            for handle in state
                .presence
                .list_by_tenant_and_roles(session.tenant_id, roles)
            {
                if !skip.contains(&handle) {
                    state.presence.send_to(handle, event);
                }
            }
        }
    }
}

fn send(tx: &Tx, event: &ServerEvent) {
    if let Ok(text) = serde_json::to_string(event) {
        let _ = tx.send(Message::Text(text));
    }
}
