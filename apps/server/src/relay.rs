use call_proto::ServerEvent;

use crate::presence::{ConnId, PresenceRegistry};

/// Forward a signaling message to the named target handle.
///
/// The payload is opaque; it is passed through verbatim, already tagged with
/// the sender's handle so the receiving side knows which peer connection it
/// belongs to. An offline target is a silent drop: the relay has no delivery
/// guarantee or buffering, peers recover by restarting the handshake.
pub fn forward(presence: &PresenceRegistry, target: ConnId, event: &ServerEvent) -> bool {
    let delivered = presence.send_to(target, event);
    if !delivered {
        tracing::debug!(handle = %target, "dropped signaling message for offline handle");
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use axum::extract::ws::Message;
    use call_proto::Role;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn forwards_payload_verbatim_with_sender_tag() {
        let presence = PresenceRegistry::new();
        let target = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        presence.register(
            target,
            Principal {
                user_id: Uuid::new_v4(),
                display_name: "callee".to_string(),
                role: Role::Customer,
                tenant_id: Uuid::new_v4(),
            },
            tx,
        );

        let sender = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let sdp = json!({"type": "offer", "sdp": "v=0\r\n..."});
        let delivered = forward(
            &presence,
            target,
            &ServerEvent::WebrtcOffer {
                session_id,
                sender_handle: sender,
                sdp: sdp.clone(),
            },
        );
        assert!(delivered);

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "webrtc-offer");
        assert_eq!(value["senderHandle"], sender.to_string());
        assert_eq!(value["sdp"], sdp);
    }

    #[tokio::test]
    async fn offline_target_is_a_silent_drop() {
        let presence = PresenceRegistry::new();
        let delivered = forward(
            &presence,
            Uuid::new_v4(),
            &ServerEvent::WebrtcIceCandidate {
                session_id: Uuid::new_v4(),
                sender_handle: Uuid::new_v4(),
                candidate: json!({"candidate": "candidate:0 1 UDP ..."}),
            },
        );
        assert!(!delivered);
    }
}
