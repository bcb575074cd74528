//! Shared node state for the HTTP handlers.

use std::sync::Arc;
use std::time::Instant;

use tollgate_session::{SessionRegistry, SessionService};

/// Shared state for the running node, accessible from HTTP handlers.
pub struct NodeState {
    /// Session lifecycle operations.
    pub service: Arc<SessionService>,
    /// Live sessions, for status reporting.
    pub registry: Arc<SessionRegistry>,
    /// Encoded address of the host side of every channel.
    pub host_address: String,
    /// Whole CKB held back from every wallet for channel setup.
    pub channel_setup_ckb: u64,
    /// When the node started.
    pub start_time: Instant,
}

impl NodeState {
    pub fn new(
        service: Arc<SessionService>,
        registry: Arc<SessionRegistry>,
        host_address: String,
        channel_setup_ckb: u64,
    ) -> Self {
        Self {
            service,
            registry,
            host_address,
            channel_setup_ckb,
            start_time: Instant::now(),
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.registry.list_active().await.len()
    }
}
