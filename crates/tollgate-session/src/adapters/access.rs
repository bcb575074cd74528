use async_trait::async_trait;
use chrono::TimeDelta;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::SessionError;
use crate::traits::AccessController;

/// Access controller for hosts without a captive portal. Only logs.
#[derive(Debug, Default)]
pub struct NoopAccessController;

#[async_trait]
impl AccessController for NoopAccessController {
    async fn authorize(&self, device: &str, duration: TimeDelta) -> Result<(), SessionError> {
        tracing::debug!(device, minutes = duration.num_minutes(), "Authorize (no-op)");
        Ok(())
    }

    async fn deauthorize(&self, device: &str) -> Result<(), SessionError> {
        tracing::debug!(device, "Deauthorize (no-op)");
        Ok(())
    }
}

/// One call made to a [`RecordingAccessController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessEvent {
    Authorized { device: String, duration: TimeDelta },
    Deauthorized { device: String },
}

/// Records every call; can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingAccessController {
    events: Mutex<Vec<AccessEvent>>,
    failing: AtomicU32,
}

impl RecordingAccessController {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, Vec<AccessEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<AccessEvent> {
        self.log().clone()
    }

    /// Number of revocations issued for `device`.
    pub fn deauthorizations(&self, device: &str) -> usize {
        self.log()
            .iter()
            .filter(|e| matches!(e, AccessEvent::Deauthorized { device: d } if d == device))
            .count()
    }

    pub fn authorizations(&self, device: &str) -> usize {
        self.log()
            .iter()
            .filter(|e| matches!(e, AccessEvent::Authorized { device: d, .. } if d == device))
            .count()
    }

    /// Make the next `n` calls fail after being recorded.
    pub fn fail_next(&self, n: u32) {
        self.failing.store(n, Ordering::SeqCst);
    }

    fn result(&self) -> Result<(), SessionError> {
        let failed = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SessionError::Access("router unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccessController for RecordingAccessController {
    async fn authorize(&self, device: &str, duration: TimeDelta) -> Result<(), SessionError> {
        self.log().push(AccessEvent::Authorized {
            device: device.to_string(),
            duration,
        });
        self.result()
    }

    async fn deauthorize(&self, device: &str) -> Result<(), SessionError> {
        self.log().push(AccessEvent::Deauthorized {
            device: device.to_string(),
        });
        self.result()
    }
}
