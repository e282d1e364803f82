//! Pending device-flow tracking.
//!
//! Each initiated flow is held in memory keyed by `device_code` until it
//! completes, fails, or expires. Entries are swept on every access and by a
//! one-minute janitor tick so abandoned flows cannot accumulate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// An in-flight device authorization.
#[derive(Debug, Clone)]
pub struct PendingDeviceFlow {
    pub target_account_id: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub code_verifier: String,
    pub expires_at: DateTime<Utc>,
    pub poll_interval: u64,
    pub created_by: String,
}

/// Map of pending flows keyed by device code.
#[derive(Debug, Default)]
pub struct DeviceFlowStore {
    flows: Mutex<HashMap<String, PendingDeviceFlow>>,
}

impl DeviceFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, device_code: String, flow: PendingDeviceFlow) {
        let mut flows = self.flows.lock().await;
        Self::sweep(&mut flows);
        flows.insert(device_code, flow);
    }

    pub async fn get(&self, device_code: &str) -> Option<PendingDeviceFlow> {
        let mut flows = self.flows.lock().await;
        Self::sweep(&mut flows);
        flows.get(device_code).cloned()
    }

    /// Remove a flow (on completion, denial, or expiry).
    pub async fn remove(&self, device_code: &str) -> Option<PendingDeviceFlow> {
        let mut flows = self.flows.lock().await;
        flows.remove(device_code)
    }

    pub async fn len(&self) -> usize {
        let mut flows = self.flows.lock().await;
        Self::sweep(&mut flows);
        flows.len()
    }

    fn sweep(flows: &mut HashMap<String, PendingDeviceFlow>) {
        let now = Utc::now();
        flows.retain(|_, flow| flow.expires_at > now);
    }

    /// Spawn the janitor task that sweeps expired flows once a minute.
    pub fn start_janitor(self: Arc<Self>, cancel: CancellationToken) {
        let store = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let mut flows = store.flows.lock().await;
                        let before = flows.len();
                        Self::sweep(&mut flows);
                        let removed = before - flows.len();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired device flows");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}
