use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// One-shot ring deadlines, keyed by session id.
///
/// `disarm` must stay idempotent and race-safe against a concurrently firing
/// timer: the expiry callback it races against is gated on session state, so
/// whichever side loses becomes a no-op.
#[derive(Clone)]
pub struct TimeoutSupervisor {
    armed: Arc<DashMap<Uuid, AbortHandle>>,
}

impl TimeoutSupervisor {
    pub fn new() -> Self {
        Self {
            armed: Arc::new(DashMap::new()),
        }
    }

    /// Schedule `on_expire` to run after `deadline` unless disarmed first.
    /// Arming the same session id again replaces the previous timer.
    pub fn arm<F>(&self, session_id: Uuid, deadline: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let armed = Arc::clone(&self.armed);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            armed.remove(&session_id);
            on_expire.await;
        });

        if let Some(prev) = self.armed.insert(session_id, handle.abort_handle()) {
            prev.abort();
        }
    }

    /// Cancel a pending deadline. No-op if it already fired or was never armed.
    pub fn disarm(&self, session_id: &Uuid) {
        if let Some((_, handle)) = self.armed.remove(session_id) {
            handle.abort();
        }
    }
}

impl Default for TimeoutSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn armed_deadline_fires_once() {
        let supervisor = TimeoutSupervisor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        supervisor.arm(Uuid::new_v4(), Duration::from_secs(60), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_firing() {
        let supervisor = TimeoutSupervisor::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let session_id = Uuid::new_v4();

        let counter = Arc::clone(&fired);
        supervisor.arm(session_id, Duration::from_secs(60), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        supervisor.disarm(&session_id);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_is_idempotent_even_after_firing() {
        let supervisor = TimeoutSupervisor::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let session_id = Uuid::new_v4();

        let counter = Arc::clone(&fired);
        supervisor.arm(session_id, Duration::from_secs(60), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // already fired, both must be harmless no-ops
        supervisor.disarm(&session_id);
        supervisor.disarm(&session_id);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_previous_timer() {
        let supervisor = TimeoutSupervisor::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let session_id = Uuid::new_v4();

        let first = Arc::clone(&fired);
        supervisor.arm(session_id, Duration::from_secs(10), async move {
            first.fetch_add(10, Ordering::SeqCst);
        });
        let second = Arc::clone(&fired);
        supervisor.arm(session_id, Duration::from_secs(30), async move {
            second.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
