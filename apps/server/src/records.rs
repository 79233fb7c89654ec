use axum::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::session::CallSession;

/// Status written to the persistent call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Initiated,
    Connected,
    Cancelled,
    Missed,
    Completed,
    Rejected,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Connected => "CONNECTED",
            Self::Cancelled => "CANCELLED",
            Self::Missed => "MISSED",
            Self::Completed => "COMPLETED",
            Self::Rejected => "REJECTED",
        }
    }
}

/// Row written once when a call is initiated.
#[derive(Debug, Clone)]
pub struct NewCallRecord {
    pub record_id: Uuid,
    pub tenant_id: Uuid,
    pub session_id: Uuid,
    pub caller_user_id: Uuid,
    pub call_type: &'static str,
    pub status: RecordStatus,
    pub start_time: DateTime<Utc>,
}

/// Partial update applied on connect and on terminal transitions.
#[derive(Debug, Clone)]
pub struct CallRecordPatch {
    pub status: RecordStatus,
    pub callee_user_id: Option<Uuid>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

/// The persistence collaborator. The bridge is the only caller; nothing else
/// in the subsystem touches storage.
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn create(&self, record: NewCallRecord) -> Result<(), sqlx::Error>;
    async fn update(&self, record_id: Uuid, patch: CallRecordPatch) -> Result<(), sqlx::Error>;
}

/// Postgres-backed call log.
pub struct PgCallRecords {
    pool: PgPool,
}

impl PgCallRecords {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallRecordStore for PgCallRecords {
    async fn create(&self, record: NewCallRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO call_records (id, tenant_id, session_id, caller_user_id, call_type, status, start_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.record_id)
        .bind(record.tenant_id)
        .bind(record.session_id)
        .bind(record.caller_user_id)
        .bind(record.call_type)
        .bind(record.status.as_str())
        .bind(record.start_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, record_id: Uuid, patch: CallRecordPatch) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE call_records
            SET status = $2,
                callee_user_id = COALESCE($3, callee_user_id),
                answer_time = COALESCE($4, answer_time),
                end_time = COALESCE($5, end_time),
                duration_seconds = COALESCE($6, duration_seconds)
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(patch.status.as_str())
        .bind(patch.callee_user_id)
        .bind(patch.answer_time)
        .bind(patch.end_time)
        .bind(patch.duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-process call log. Used when no DATABASE_URL is configured, and by tests
/// asserting on what the bridge wrote.
#[derive(Default)]
pub struct MemoryCallRecords {
    records: Mutex<HashMap<Uuid, StoredCallRecord>>,
}

#[derive(Debug, Clone)]
pub struct StoredCallRecord {
    pub record_id: Uuid,
    pub tenant_id: Uuid,
    pub session_id: Uuid,
    pub caller_user_id: Uuid,
    pub callee_user_id: Option<Uuid>,
    pub call_type: &'static str,
    pub status: RecordStatus,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl MemoryCallRecords {
    pub fn by_session(&self, session_id: Uuid) -> Option<StoredCallRecord> {
        self.records
            .lock()
            .unwrap()
            .values()
            .find(|record| record.session_id == session_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CallRecordStore for MemoryCallRecords {
    async fn create(&self, record: NewCallRecord) -> Result<(), sqlx::Error> {
        let stored = StoredCallRecord {
            record_id: record.record_id,
            tenant_id: record.tenant_id,
            session_id: record.session_id,
            caller_user_id: record.caller_user_id,
            callee_user_id: None,
            call_type: record.call_type,
            status: record.status,
            start_time: record.start_time,
            answer_time: None,
            end_time: None,
            duration_seconds: None,
        };
        self.records.lock().unwrap().insert(record.record_id, stored);
        Ok(())
    }

    async fn update(&self, record_id: Uuid, patch: CallRecordPatch) -> Result<(), sqlx::Error> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&record_id).ok_or(sqlx::Error::RowNotFound)?;
        record.status = patch.status;
        if patch.callee_user_id.is_some() {
            record.callee_user_id = patch.callee_user_id;
        }
        if patch.answer_time.is_some() {
            record.answer_time = patch.answer_time;
        }
        if patch.end_time.is_some() {
            record.end_time = patch.end_time;
        }
        if patch.duration_seconds.is_some() {
            record.duration_seconds = patch.duration_seconds;
        }
        Ok(())
    }
}

/// Mirrors session lifecycle transitions into the call log. Every write is
/// dispatched fire-and-forget; a failure is logged and never reaches the live
/// call path.
#[derive(Clone)]
pub struct CallRecordBridge {
    store: Arc<dyn CallRecordStore>,
}

impl CallRecordBridge {
    pub fn new(store: Arc<dyn CallRecordStore>) -> Self {
        Self { store }
    }

    pub fn on_initiated(&self, session: &CallSession) {
        let Some(record_id) = session.external_record_id else {
            return;
        };
        let record = NewCallRecord {
            record_id,
            tenant_id: session.tenant_id,
            session_id: session.session_id,
            caller_user_id: session.caller_user_id,
            call_type: session.target.call_type(),
            status: RecordStatus::Initiated,
            start_time: session.created_at,
        };
        let store = Arc::clone(&self.store);
        let session_id = session.session_id;
        tokio::spawn(async move {
            if let Err(err) = store.create(record).await {
                tracing::warn!(%session_id, error = %err, "failed to persist call record");
            }
        });
    }

    pub fn on_connected(&self, session: &CallSession) {
        self.dispatch_update(
            session,
            CallRecordPatch {
                status: RecordStatus::Connected,
                callee_user_id: session.receiver_user_id,
                answer_time: session.connected_at,
                end_time: None,
                duration_seconds: None,
            },
        );
    }

    pub fn on_ended(&self, session: &CallSession, status: RecordStatus, duration_seconds: i64) {
        self.dispatch_update(
            session,
            CallRecordPatch {
                status,
                callee_user_id: session.receiver_user_id,
                answer_time: session.connected_at,
                end_time: session.ended_at,
                duration_seconds: Some(duration_seconds),
            },
        );
    }

    fn dispatch_update(&self, session: &CallSession, patch: CallRecordPatch) {
        let Some(record_id) = session.external_record_id else {
            return;
        };
        let store = Arc::clone(&self.store);
        let session_id = session.session_id;
        tokio::spawn(async move {
            if let Err(err) = store.update(record_id, patch).await {
                tracing::warn!(%session_id, error = %err, "failed to update call record");
            }
        });
    }
}
