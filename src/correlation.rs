//! Correlation Registry (C3).
//!
//! Tracks pending engine commands keyed by a monotonic correlation id and
//! completes each one exactly once, either with the matched response or with
//! an error on timeout/shutdown. Grounded on Zed's `PendingRequests` map
//! (insert/remove/flush/shutdown) for the "fail everything exactly once on
//! shutdown, then reject new registrations" shape.

use crate::error::AdapterError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

pub type CorrelationId = i64;

struct Entry {
    sender: oneshot::Sender<Result<Value, AdapterError>>,
}

/// Pending-request map. `None` in `inner` means the registry has shut down
/// and rejects further registrations.
pub struct CorrelationRegistry {
    next_id: AtomicI64,
    inner: Mutex<Option<HashMap<CorrelationId, Entry>>>,
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            inner: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Registers a new pending command, returning its id and a receiver that
    /// resolves when the registry completes it.
    pub fn register(&self) -> Option<(CorrelationId, oneshot::Receiver<Result<Value, AdapterError>>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut guard = self.inner.lock().expect("correlation registry mutex poisoned");
        let map = guard.as_mut()?;
        map.insert(id, Entry { sender: tx });
        Some((id, rx))
    }

    /// Completes a pending request with a successful payload. No-op if the id
    /// is unknown (already completed, timed out, or shut down).
    pub fn complete(&self, id: CorrelationId, payload: Value) {
        self.resolve(id, Ok(payload));
    }

    /// Completes a pending request with an error.
    pub fn fail(&self, id: CorrelationId, err: AdapterError) {
        self.resolve(id, Err(err));
    }

    fn resolve(&self, id: CorrelationId, result: Result<Value, AdapterError>) {
        let entry = {
            let mut guard = self.inner.lock().expect("correlation registry mutex poisoned");
            guard.as_mut().and_then(|m| m.remove(&id))
        };
        if let Some(entry) = entry {
            let _ = entry.sender.send(result);
        }
    }

    /// Awaits completion of `rx` with an optional deadline. On timeout, the
    /// corresponding registry entry (if still present) is removed.
    pub async fn await_completion(
        &self,
        id: CorrelationId,
        rx: oneshot::Receiver<Result<Value, AdapterError>>,
        deadline: Option<Duration>,
    ) -> Result<Value, AdapterError> {
        let awaited = match deadline {
            Some(d) => match timeout(d, rx).await {
                Ok(inner) => inner,
                Err(_) => {
                    self.resolve(id, Err(AdapterError::Timeout(d)));
                    return Err(AdapterError::Timeout(d));
                }
            },
            None => rx.await,
        };
        awaited.unwrap_or_else(|_| {
            Err(AdapterError::Internal(
                "correlation sender dropped without completing".into(),
            ))
        })
    }

    /// Fails every outstanding request exactly once, then rejects future
    /// registrations. Idempotent.
    pub fn shutdown(&self, err_factory: impl Fn() -> AdapterError) {
        let drained = {
            let mut guard = self.inner.lock().expect("correlation registry mutex poisoned");
            guard.take()
        };
        if let Some(map) = drained {
            for (_, entry) in map {
                let _ = entry.sender.send(Err(err_factory()));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .expect("correlation registry mutex poisoned")
            .as_ref()
            .map(|m| m.len())
            .unwrap_or(0)
    }
}
