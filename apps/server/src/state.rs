use std::sync::Arc;
use std::time::Duration;

use crate::presence::PresenceRegistry;
use crate::records::{CallRecordBridge, CallRecordStore};
use crate::session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub presence: PresenceRegistry,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(records: Arc<dyn CallRecordStore>, ring_timeout: Duration) -> Self {
        Self {
            presence: PresenceRegistry::new(),
            sessions: SessionStore::new(CallRecordBridge::new(records), ring_timeout),
        }
    }
}
