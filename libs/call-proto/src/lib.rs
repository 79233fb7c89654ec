use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role carried in a principal's token claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Staff,
    Customer,
}

/// Why a call left the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallEndReason {
    Ended,
    NoAnswer,
    Disconnected,
}

/// Events a client sends over the signaling socket.
///
/// SDP and ICE payloads are opaque blobs understood only by the two media
/// endpoints; the server forwards them verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Register {
        token: String,
    },
    CallInitiate {
        tenant_id: Uuid,
        #[serde(default)]
        target_user_id: Option<Uuid>,
    },
    CallAccept {
        session_id: Uuid,
    },
    CallReject {
        session_id: Uuid,
    },
    CallCancel {
        session_id: Uuid,
    },
    CallEnd {
        session_id: Uuid,
    },
    WebrtcOffer {
        session_id: Uuid,
        target_handle: Uuid,
        sdp: Value,
    },
    WebrtcAnswer {
        session_id: Uuid,
        target_handle: Uuid,
        sdp: Value,
    },
    WebrtcIceCandidate {
        session_id: Uuid,
        target_handle: Uuid,
        candidate: Value,
    },
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Registered {
        handle: Uuid,
    },
    IncomingCall {
        session_id: Uuid,
        caller_user_id: Uuid,
        caller_display_name: String,
    },
    CallRinging {
        session_id: Uuid,
    },
    /// Sent to the caller once a receiver wins the accept race.
    CallAccepted {
        session_id: Uuid,
        peer_handle: Uuid,
        peer_user_id: Uuid,
        peer_display_name: String,
    },
    /// Sent to the accepting receiver, mirror of `CallAccepted`.
    CallConnected {
        session_id: Uuid,
        peer_handle: Uuid,
        peer_user_id: Uuid,
        peer_display_name: String,
    },
    CallRejectedAck {
        session_id: Uuid,
    },
    /// Informational outcome for a losing acceptor, never an error.
    CallUnavailable {
        session_id: Uuid,
    },
    CallCancelled {
        session_id: Uuid,
    },
    CallEnded {
        session_id: Uuid,
        reason: CallEndReason,
        duration_seconds: i64,
    },
    WebrtcOffer {
        session_id: Uuid,
        sender_handle: Uuid,
        sdp: Value,
    },
    WebrtcAnswer {
        session_id: Uuid,
        sender_handle: Uuid,
        sdp: Value,
    },
    WebrtcIceCandidate {
        session_id: Uuid,
        sender_handle: Uuid,
        candidate: Value,
    },
    Error {
        code: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_use_kebab_case_tags_and_camel_case_fields() {
        let event = ServerEvent::CallEnded {
            session_id: Uuid::nil(),
            reason: CallEndReason::NoAnswer,
            duration_seconds: 0,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "call-ended");
        assert_eq!(value["reason"], "no-answer");
        assert!(value.get("durationSeconds").is_some());

        let parsed: ClientEvent = serde_json::from_value(json!({
            "type": "call-initiate",
            "tenantId": Uuid::nil(),
        }))
        .unwrap();
        match parsed {
            ClientEvent::CallInitiate { target_user_id, .. } => {
                assert!(target_user_id.is_none())
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
