use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use call_proto::Role;

use crate::presence::ConnId;
use crate::records::{CallRecordBridge, RecordStatus};
use crate::timeout::TimeoutSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Connected,
    Ended,
}

/// Who a ringing session is addressed to. Broadcast rings a role group of the
/// tenant, direct dial rings one specific user.
#[derive(Debug, Clone)]
pub enum CallTarget {
    Broadcast { roles: Vec<Role> },
    Direct { user_id: Uuid },
}

impl CallTarget {
    pub fn call_type(&self) -> &'static str {
        match self {
            Self::Broadcast { .. } => "broadcast",
            Self::Direct { .. } => "direct",
        }
    }
}

/// One attempted-or-active call. Owned exclusively by the [`SessionStore`];
/// snapshots handed out by store operations are detached copies.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub session_id: Uuid,
    pub caller_user_id: Uuid,
    pub caller_handle: ConnId,
    pub receiver_user_id: Option<Uuid>,
    pub receiver_handle: Option<ConnId>,
    pub tenant_id: Uuid,
    pub target: CallTarget,
    /// Receivers actually rung at fan-out time; drives reject-exhaustion.
    pub notified_user_ids: HashSet<Uuid>,
    pub rejected_user_ids: HashSet<Uuid>,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub external_record_id: Option<Uuid>,
}

impl CallSession {
    pub fn duration_seconds(&self) -> i64 {
        match (self.connected_at, self.ended_at) {
            (Some(connected), Some(ended)) => (ended - connected).num_seconds().max(0),
            _ => 0,
        }
    }

    fn references_handle(&self, handle: ConnId) -> bool {
        self.caller_handle == handle || self.receiver_handle == Some(handle)
    }
}

#[derive(Debug)]
pub enum AcceptOutcome {
    Accepted(CallSession),
    /// The race was already won, or this receiver had rejected. A defined
    /// outcome for the loser, never a fault.
    AlreadyResolved,
    NotFound,
}

#[derive(Debug)]
pub enum CancelOutcome {
    Ended(CallSession),
    NotFound,
    Forbidden,
}

#[derive(Debug)]
pub enum EndOutcome {
    Ended(CallSession),
    NotFound,
    Forbidden,
}

#[derive(Debug)]
pub enum RejectOutcome {
    Acknowledged,
    /// Every notified receiver has rejected; the session just ended.
    Exhausted(CallSession),
    NotFound,
}

/// In-memory table of live call sessions. The single correctness-critical
/// lock boundary of the subsystem: every state transition goes through a
/// per-key entry guard, which makes the check-and-set in [`try_accept`]
/// atomic with respect to all other mutators of the same session.
///
/// [`try_accept`]: SessionStore::try_accept
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<Uuid, CallSession>>,
    timeouts: TimeoutSupervisor,
    records: CallRecordBridge,
    ring_timeout: Duration,
}

impl SessionStore {
    pub fn new(records: CallRecordBridge, ring_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            timeouts: TimeoutSupervisor::new(),
            records,
            ring_timeout,
        }
    }

    /// Ring every connected member of a role group in the tenant.
    pub fn create_broadcast(
        &self,
        caller_user_id: Uuid,
        caller_handle: ConnId,
        tenant_id: Uuid,
        roles: Vec<Role>,
    ) -> CallSession {
        self.create(caller_user_id, caller_handle, tenant_id, CallTarget::Broadcast { roles })
    }

    /// Ring one specific user.
    pub fn create_direct(
        &self,
        caller_user_id: Uuid,
        caller_handle: ConnId,
        tenant_id: Uuid,
        target_user_id: Uuid,
    ) -> CallSession {
        self.create(
            caller_user_id,
            caller_handle,
            tenant_id,
            CallTarget::Direct {
                user_id: target_user_id,
            },
        )
    }

    fn create(
        &self,
        caller_user_id: Uuid,
        caller_handle: ConnId,
        tenant_id: Uuid,
        target: CallTarget,
    ) -> CallSession {
        let session = CallSession {
            session_id: Uuid::new_v4(),
            caller_user_id,
            caller_handle,
            receiver_user_id: None,
            receiver_handle: None,
            tenant_id,
            target,
            notified_user_ids: HashSet::new(),
            rejected_user_ids: HashSet::new(),
            state: CallState::Ringing,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            external_record_id: Some(Uuid::new_v4()),
        };
        self.sessions.insert(session.session_id, session.clone());
        self.records.on_initiated(&session);
        session
    }

    /// Arm the ring deadline. Safe to call after a racing resolution: the
    /// fired callback goes through [`expire`](SessionStore::expire), which is
    /// gated on the session still ringing.
    pub fn arm_expiry<F>(&self, session_id: Uuid, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.timeouts.arm(session_id, self.ring_timeout, on_expire);
    }

    /// Remember who was actually rung, for reject-exhaustion.
    pub fn record_fanout(&self, session_id: Uuid, user_ids: impl IntoIterator<Item = Uuid>) {
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            if session.state == CallState::Ringing {
                session.notified_user_ids.extend(user_ids);
            }
        }
    }

    /// The race-critical operation: first committer wins, everyone after
    /// observes `AlreadyResolved`.
    pub fn try_accept(
        &self,
        session_id: Uuid,
        receiver_user_id: Uuid,
        receiver_handle: ConnId,
    ) -> AcceptOutcome {
        let snapshot = match self.sessions.get_mut(&session_id) {
            None => return AcceptOutcome::NotFound,
            Some(mut session) => {
                if session.state != CallState::Ringing
                    || session.rejected_user_ids.contains(&receiver_user_id)
                {
                    return AcceptOutcome::AlreadyResolved;
                }
                session.receiver_user_id = Some(receiver_user_id);
                session.receiver_handle = Some(receiver_handle);
                session.state = CallState::Connected;
                session.connected_at = Some(Utc::now());
                session.clone()
            }
        };

        self.timeouts.disarm(&session_id);
        self.records.on_connected(&snapshot);
        AcceptOutcome::Accepted(snapshot)
    }

    /// Caller withdraws a still-ringing call.
    pub fn cancel(&self, session_id: Uuid, by_user: Uuid) -> CancelOutcome {
        let snapshot = match self.sessions.entry(session_id) {
            Entry::Vacant(_) => return CancelOutcome::NotFound,
            Entry::Occupied(entry) => {
                let session = entry.get();
                if session.caller_user_id != by_user || session.state != CallState::Ringing {
                    return CancelOutcome::Forbidden;
                }
                Self::finish(entry.remove())
            }
        };

        self.timeouts.disarm(&session_id);
        self.records.on_ended(&snapshot, RecordStatus::Cancelled, 0);
        CancelOutcome::Ended(snapshot)
    }

    /// Either party hangs up. A caller ending a still-ringing call takes the
    /// cancel path.
    pub fn end(&self, session_id: Uuid, by_user: Uuid) -> EndOutcome {
        let (snapshot, status, duration) = match self.sessions.entry(session_id) {
            Entry::Vacant(_) => return EndOutcome::NotFound,
            Entry::Occupied(entry) => {
                let session = entry.get();
                match session.state {
                    CallState::Ringing if session.caller_user_id == by_user => {
                        (Self::finish(entry.remove()), RecordStatus::Cancelled, 0)
                    }
                    CallState::Connected
                        if session.caller_user_id == by_user
                            || session.receiver_user_id == Some(by_user) =>
                    {
                        let snapshot = Self::finish(entry.remove());
                        let duration = snapshot.duration_seconds();
                        (snapshot, RecordStatus::Completed, duration)
                    }
                    _ => return EndOutcome::Forbidden,
                }
            }
        };

        self.timeouts.disarm(&session_id);
        self.records.on_ended(&snapshot, status, duration);
        EndOutcome::Ended(snapshot)
    }

    /// Invoked only by the ring deadline. Not identity-gated; gated on the
    /// session still ringing, which resolves the timeout/accept race.
    pub fn expire(&self, session_id: Uuid) -> Option<CallSession> {
        let snapshot = match self.sessions.entry(session_id) {
            Entry::Vacant(_) => return None,
            Entry::Occupied(entry) => {
                if entry.get().state != CallState::Ringing {
                    return None;
                }
                Self::finish(entry.remove())
            }
        };

        self.timeouts.disarm(&session_id);
        self.records.on_ended(&snapshot, RecordStatus::Missed, 0);
        Some(snapshot)
    }

    /// Advisory decline from one notified receiver. The session keeps ringing
    /// for the others until every notified receiver has declined.
    pub fn reject(&self, session_id: Uuid, by_user: Uuid) -> RejectOutcome {
        let snapshot = match self.sessions.entry(session_id) {
            Entry::Vacant(_) => return RejectOutcome::NotFound,
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                if session.state != CallState::Ringing {
                    return RejectOutcome::Acknowledged;
                }
                session.rejected_user_ids.insert(by_user);
                let exhausted = !session.notified_user_ids.is_empty()
                    && session
                        .notified_user_ids
                        .is_subset(&session.rejected_user_ids);
                if !exhausted {
                    return RejectOutcome::Acknowledged;
                }
                Self::finish(entry.remove())
            }
        };

        self.timeouts.disarm(&session_id);
        self.records.on_ended(&snapshot, RecordStatus::Rejected, 0);
        RejectOutcome::Exhausted(snapshot)
    }

    /// Tear down every live session referencing a dropped connection handle.
    /// Returns the ended snapshots so the caller can notify surviving peers.
    pub fn disconnect_sweep(&self, handle: ConnId) -> Vec<CallSession> {
        let affected: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|session| session.references_handle(handle))
            .map(|session| session.session_id)
            .collect();

        let mut swept = Vec::new();
        for session_id in affected {
            let snapshot = match self.sessions.entry(session_id) {
                Entry::Vacant(_) => continue,
                Entry::Occupied(entry) => {
                    if !entry.get().references_handle(handle) {
                        continue;
                    }
                    Self::finish(entry.remove())
                }
            };

            self.timeouts.disarm(&session_id);
            let (status, duration) = if snapshot.connected_at.is_some() {
                (RecordStatus::Completed, snapshot.duration_seconds())
            } else {
                (RecordStatus::Cancelled, 0)
            };
            self.records.on_ended(&snapshot, status, duration);
            swept.push(snapshot);
        }
        swept
    }

    /// A user already party to a live session cannot start or take another.
    pub fn is_busy(&self, user_id: Uuid) -> bool {
        self.sessions.iter().any(|session| {
            session.caller_user_id == user_id || session.receiver_user_id == Some(user_id)
        })
    }

    pub fn get(&self, session_id: Uuid) -> Option<CallSession> {
        self.sessions.get(&session_id).map(|session| session.clone())
    }

    pub fn live_count(&self) -> usize {
        self.sessions.len()
    }

    fn finish(mut session: CallSession) -> CallSession {
        session.state = CallState::Ended;
        session.ended_at = Some(Utc::now());
        session
    }
}
