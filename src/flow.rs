//! Flow store interface
//!
//! Flows serialize concurrent demands on the same logical operation (an
//! interactive authorization, a token-store read) through a deterministic id.
//! The creator drives the work; every other caller attaches and receives the
//! same outcome. The store itself is an external collaborator; the in-memory
//! implementation here backs tests and single-process embedders.

use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Flow kind for interactive authorization exchanges.
pub const FLOW_KIND_OAUTH: &str = "mcp_oauth";
/// Flow kind serializing token-store reads for a principal+server pair.
pub const FLOW_KIND_TOKENS: &str = "mcp_get_tokens";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct FlowState {
    pub status: FlowStatus,
    pub metadata: Option<Value>,
}

#[async_trait]
pub trait FlowManager: Send + Sync {
    /// Current state of a flow, if one exists.
    async fn get_flow_state(&self, id: &str, kind: &str) -> Option<FlowState>;

    /// Create the flow if absent. Returns true when this caller created it;
    /// false means a flow already exists and the caller should attach.
    async fn begin_flow(&self, id: &str, kind: &str, metadata: Option<Value>) -> Result<bool>;

    /// Block until the flow resolves (or its time-to-live elapses).
    async fn await_flow(&self, id: &str, kind: &str) -> Result<Value>;

    async fn complete_flow(&self, id: &str, kind: &str, result: Value) -> Result<()>;

    async fn fail_flow(&self, id: &str, kind: &str, reason: String) -> Result<()>;

    /// Single-flight execution: the creator runs `handler` and its outcome
    /// resolves the flow; concurrent callers attach and share the result.
    async fn create_flow_with_handler(
        &self,
        id: &str,
        kind: &str,
        handler: BoxFuture<'static, Result<Value>>,
    ) -> Result<Value>;

    /// Create-or-attach, then wait for the externally driven resolution.
    async fn create_flow(&self, id: &str, kind: &str, metadata: Option<Value>) -> Result<Value> {
        self.begin_flow(id, kind, metadata).await?;
        self.await_flow(id, kind).await
    }
}

struct FlowEntry {
    status: RwLock<FlowStatus>,
    metadata: RwLock<Option<Value>>,
    result: RwLock<Option<std::result::Result<Value, String>>>,
    notify: Notify,
}

impl FlowEntry {
    fn pending(metadata: Option<Value>) -> Arc<Self> {
        Arc::new(Self {
            status: RwLock::new(FlowStatus::Pending),
            metadata: RwLock::new(metadata),
            result: RwLock::new(None),
            notify: Notify::new(),
        })
    }
}

/// In-memory flow store with wait-for-completion semantics and a bounded
/// flow lifetime.
pub struct InMemoryFlowManager {
    flows: Arc<DashMap<String, Arc<FlowEntry>>>,
    ttl: Duration,
}

const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(180);

fn flow_key(id: &str, kind: &str) -> String {
    format!("{}:{}", kind, id)
}

impl Default for InMemoryFlowManager {
    fn default() -> Self {
        Self::new(DEFAULT_FLOW_TTL)
    }
}

impl InMemoryFlowManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            flows: Arc::new(DashMap::new()),
            ttl,
        }
    }

    fn resolve(&self, id: &str, kind: &str, outcome: std::result::Result<Value, String>) {
        let key = flow_key(id, kind);
        if let Some(entry) = self.flows.get(&key).map(|e| e.value().clone()) {
            *entry.status.write() = match outcome {
                Ok(_) => FlowStatus::Completed,
                Err(_) => FlowStatus::Failed,
            };
            *entry.result.write() = Some(outcome);
            entry.notify.notify_waiters();

            // Resolved entries are only kept long enough for attachers to
            // read the outcome.
            let flows = self.flows.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                flows.remove_if(&key, |_, v| Arc::ptr_eq(v, &entry));
            });
        }
    }
}

#[async_trait]
impl FlowManager for InMemoryFlowManager {
    async fn get_flow_state(&self, id: &str, kind: &str) -> Option<FlowState> {
        self.flows.get(&flow_key(id, kind)).map(|entry| FlowState {
            status: *entry.status.read(),
            metadata: entry.metadata.read().clone(),
        })
    }

    async fn begin_flow(&self, id: &str, kind: &str, metadata: Option<Value>) -> Result<bool> {
        let key = flow_key(id, kind);
        match self.flows.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                // Only a pending flow can be attached to; a resolved leftover
                // is replaced so callers never observe a stale outcome.
                if *slot.get().status.read() == FlowStatus::Pending {
                    Ok(false)
                } else {
                    debug!("Replacing resolved flow {}", key);
                    slot.insert(FlowEntry::pending(metadata));
                    Ok(true)
                }
            },
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!("Created flow {}", key);
                slot.insert(FlowEntry::pending(metadata));
                Ok(true)
            },
        }
    }

    async fn await_flow(&self, id: &str, kind: &str) -> Result<Value> {
        let key = flow_key(id, kind);
        let entry = self
            .flows
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::Internal(format!("no such flow: {}", key)))?;

        let deadline = tokio::time::Instant::now() + self.ttl;
        loop {
            // Register interest before checking, so a resolution between the
            // check and the wait cannot be missed.
            let notified = entry.notify.notified();

            if let Some(outcome) = entry.result.read().clone() {
                return outcome.map_err(Error::Internal);
            }

            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(deadline) => {
                    // Fail the flow so every other waiter resolves too.
                    *entry.status.write() = FlowStatus::Failed;
                    *entry.result.write() = Some(Err("flow timed out".to_string()));
                    entry.notify.notify_waiters();
                    return Err(Error::Timeout(
                        self.ttl.as_millis() as u64,
                        format!("flow {}", key),
                    ));
                },
            }
        }
    }

    async fn complete_flow(&self, id: &str, kind: &str, result: Value) -> Result<()> {
        self.resolve(id, kind, Ok(result));
        Ok(())
    }

    async fn fail_flow(&self, id: &str, kind: &str, reason: String) -> Result<()> {
        self.resolve(id, kind, Err(reason));
        Ok(())
    }

    async fn create_flow_with_handler(
        &self,
        id: &str,
        kind: &str,
        handler: BoxFuture<'static, Result<Value>>,
    ) -> Result<Value> {
        let created = self.begin_flow(id, kind, None).await?;
        if !created {
            return self.await_flow(id, kind).await;
        }

        match handler.await {
            Ok(value) => {
                self.complete_flow(id, kind, value.clone()).await?;
                // Leave the resolved entry for attachers; they drop it as
                // they read the result.
                Ok(value)
            },
            Err(e) => {
                self.fail_flow(id, kind, e.to_string()).await?;
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn attaches_to_pending_flow() {
        let flows = Arc::new(InMemoryFlowManager::default());

        assert!(flows.begin_flow("u1:gh", FLOW_KIND_OAUTH, None).await.unwrap());
        assert!(!flows.begin_flow("u1:gh", FLOW_KIND_OAUTH, None).await.unwrap());

        let waiter = tokio::spawn({
            let flows = flows.clone();
            async move { flows.await_flow("u1:gh", FLOW_KIND_OAUTH).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        flows
            .complete_flow("u1:gh", FLOW_KIND_OAUTH, json!({"access_token": "t"}))
            .await
            .unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result["access_token"], "t");
    }

    #[tokio::test]
    async fn handler_runs_single_flight() {
        let flows = Arc::new(InMemoryFlowManager::default());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let flows = flows.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                flows
                    .create_flow_with_handler(
                        "u1:gh",
                        FLOW_KIND_TOKENS,
                        Box::pin(async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(json!({"access_token": "shared"}))
                        }),
                    )
                    .await
            }));
        }

        for task in tasks {
            let value = task.await.unwrap().unwrap();
            assert_eq!(value["access_token"], "shared");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_flow_propagates_reason() {
        let flows = Arc::new(InMemoryFlowManager::default());
        flows.begin_flow("u2:gh", FLOW_KIND_OAUTH, None).await.unwrap();

        let waiter = tokio::spawn({
            let flows = flows.clone();
            async move { flows.await_flow("u2:gh", FLOW_KIND_OAUTH).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        flows
            .fail_flow("u2:gh", FLOW_KIND_OAUTH, "user declined".into())
            .await
            .unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("user declined"));
    }

    #[tokio::test]
    async fn flow_times_out() {
        let flows = InMemoryFlowManager::new(Duration::from_millis(50));
        flows.begin_flow("u3:gh", FLOW_KIND_OAUTH, None).await.unwrap();

        let err = flows.await_flow("u3:gh", FLOW_KIND_OAUTH).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(..)));
    }

    #[tokio::test]
    async fn flow_state_reflects_metadata() {
        let flows = InMemoryFlowManager::default();
        flows
            .begin_flow("u4:gh", FLOW_KIND_OAUTH, Some(json!({"url": "https://auth"})))
            .await
            .unwrap();

        let state = flows.get_flow_state("u4:gh", FLOW_KIND_OAUTH).await.unwrap();
        assert_eq!(state.status, FlowStatus::Pending);
        assert_eq!(state.metadata.unwrap()["url"], "https://auth");
    }
}
