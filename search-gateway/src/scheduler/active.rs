//! Registry of pipeline executions currently in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::request::{DeliveryMode, SearchRequest};

/// One in-flight execution.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRequestEntry {
    pub request_id: String,
    /// Truncated query, for operators.
    pub query: String,
    pub mode: DeliveryMode,
    pub started_at: DateTime<Utc>,
}

impl ActiveRequestEntry {
    pub fn for_request(request: &SearchRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            query: request.query_preview(),
            mode: request.mode,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    entries: HashMap<String, ActiveRequestEntry>,
    /// Admitted streaming sessions still waiting for a limiter permit.
    reserved: usize,
}

/// Set of in-flight executions keyed by request id.
///
/// Only holders of a limiter permit have an entry, so the entry count never
/// exceeds the permit count. Streaming sessions are admitted earlier through
/// [`ActiveRequests::try_reserve`] and turn their place into an entry once
/// they hold a permit.
#[derive(Debug, Default)]
pub struct ActiveRequests {
    inner: Mutex<Registry>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // The registry stays consistent even if a holder panicked mid-insert.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an execution as in flight until the returned guard is dropped.
    ///
    /// Callers must already hold a limiter permit.
    pub fn register(self: &Arc<Self>, entry: ActiveRequestEntry) -> ActiveRequestGuard {
        let request_id = entry.request_id.clone();
        self.lock().entries.insert(request_id.clone(), entry);
        ActiveRequestGuard {
            registry: Arc::clone(self),
            request_id,
        }
    }

    /// Hold a place for a session that will run later, if in-flight entries
    /// plus other held places are below `limit`.
    ///
    /// The check and the increment happen under one lock, so concurrent
    /// callers cannot both take the last place.
    pub fn try_reserve(self: &Arc<Self>, limit: usize) -> Option<Reservation> {
        let mut inner = self.lock();
        if inner.entries.len() + inner.reserved >= limit {
            return None;
        }
        inner.reserved += 1;
        Some(Reservation {
            registry: Arc::clone(self),
            held: true,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Places held by sessions not yet running.
    pub fn reserved(&self) -> usize {
        self.lock().reserved
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().entries.contains_key(request_id)
    }

    /// Copy of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<ActiveRequestEntry> {
        let mut entries: Vec<_> = self.lock().entries.values().cloned().collect();
        entries.sort_by_key(|e| e.started_at);
        entries
    }
}

/// A held admission place. Dropping it unused gives the place back.
#[derive(Debug)]
pub struct Reservation {
    registry: Arc<ActiveRequests>,
    held: bool,
}

impl Reservation {
    /// Swap the place for an entry. Call once the limiter permit is held.
    pub fn activate(mut self, entry: ActiveRequestEntry) -> ActiveRequestGuard {
        let request_id = entry.request_id.clone();
        {
            let mut inner = self.registry.lock();
            inner.reserved = inner.reserved.saturating_sub(1);
            inner.entries.insert(request_id.clone(), entry);
        }
        self.held = false;
        ActiveRequestGuard {
            registry: Arc::clone(&self.registry),
            request_id,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.held {
            let mut inner = self.registry.lock();
            inner.reserved = inner.reserved.saturating_sub(1);
        }
    }
}

/// Removes its entry from the registry on drop.
#[derive(Debug)]
pub struct ActiveRequestGuard {
    registry: Arc<ActiveRequests>,
    request_id: String,
}

impl ActiveRequestGuard {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.registry.lock().entries.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> ActiveRequestEntry {
        ActiveRequestEntry {
            request_id: id.to_string(),
            query: "q".to_string(),
            mode: DeliveryMode::Json,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_guard_deregisters_on_drop() {
        let active = Arc::new(ActiveRequests::new());
        let a = active.register(entry("json-a"));
        let b = active.register(entry("sse-b"));
        assert_eq!(active.len(), 2);
        assert!(active.contains("json-a"));

        drop(a);
        assert_eq!(active.len(), 1);
        assert!(!active.contains("json-a"));
        assert_eq!(b.request_id(), "sse-b");

        drop(b);
        assert!(active.is_empty());
    }

    #[test]
    fn test_reservations_respect_limit() {
        let active = Arc::new(ActiveRequests::new());
        let a = active.try_reserve(2).unwrap();
        let _b = active.try_reserve(2).unwrap();
        assert!(active.try_reserve(2).is_none());
        assert_eq!(active.reserved(), 2);
        assert!(active.is_empty());

        drop(a);
        assert_eq!(active.reserved(), 1);
        assert!(active.try_reserve(2).is_some());
    }

    #[test]
    fn test_running_entries_count_against_reservations() {
        let active = Arc::new(ActiveRequests::new());
        let _running = active.register(entry("json-a"));
        let _waiting = active.try_reserve(2).unwrap();
        assert!(active.try_reserve(2).is_none());
    }

    #[test]
    fn test_activate_turns_place_into_entry() {
        let active = Arc::new(ActiveRequests::new());
        let reservation = active.try_reserve(1).unwrap();
        assert_eq!(active.len(), 0);

        let guard = reservation.activate(entry("sse-a"));
        assert_eq!(active.reserved(), 0);
        assert!(active.contains("sse-a"));
        assert!(active.try_reserve(1).is_none());

        drop(guard);
        assert!(active.is_empty());
        assert!(active.try_reserve(1).is_some());
    }

    #[tokio::test]
    async fn test_guard_released_when_task_aborted() {
        let active = Arc::new(ActiveRequests::new());
        let handle = {
            let active = active.clone();
            tokio::spawn(async move {
                let _guard = active.register(entry("sse-abort"));
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(active.len(), 1);

        handle.abort();
        let _ = handle.await;
        assert!(active.is_empty());
    }
}
