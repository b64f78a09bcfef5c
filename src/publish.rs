//! Hand-off of derived configuration to the posting agent.
//!
//! The worker publishes a numbered, deep-copied [Declaration] whenever its
//! queue drains with the store dirty. Declarations ride a latest-wins
//! channel: the agent only ever posts the newest one, and a declaration
//! superseded while a post is in flight is simply skipped.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::model::{GtmConfig, LtmConfig};
use crate::store::ResourceStore;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Declaration {
    pub req_id: u64,
    pub ltm_config: LtmConfig,
    pub gtm_config: GtmConfig,
    pub share_nodes: bool,
    pub default_route_domain: i32,
}

/// Where declarations go. The device-facing agent implements this; tests
/// and dry runs use [LogAgent].
#[async_trait]
pub(crate) trait AgentSink: Send + Sync {
    async fn post(&self, decl: &Declaration) -> anyhow::Result<()>;
}

/// Serializes each declaration as one JSON document into the log stream.
#[derive(Default)]
pub(crate) struct LogAgent;

#[async_trait]
impl AgentSink for LogAgent {
    async fn post(&self, decl: &Declaration) -> anyhow::Result<()> {
        let body = serde_json::to_string(decl)?;
        info!(req_id = decl.req_id, %body, "declaration posted");
        Ok(())
    }
}

pub(crate) fn channel() -> (Publisher, DeclarationRx) {
    let (tx, rx) = watch::channel(None);
    (
        Publisher {
            tx,
            req_id: AtomicU64::new(0),
        },
        rx,
    )
}

pub(crate) type DeclarationRx = watch::Receiver<Option<Declaration>>;

pub(crate) struct Publisher {
    tx: watch::Sender<Option<Declaration>>,
    req_id: AtomicU64,
}

impl Publisher {
    /// Snapshot the store and hand it to the agent. Marks the store clean.
    pub(crate) fn publish(&self, store: &mut ResourceStore) -> u64 {
        let req_id = self.req_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (ltm_config, gtm_config) = store.snapshot();
        let decl = Declaration {
            req_id,
            ltm_config,
            gtm_config,
            share_nodes: store.share_nodes,
            default_route_domain: store.default_route_domain,
        };
        store.update_caches();
        metrics::counter!("declarations.posted").increment(1);
        debug!(req_id, "declaration queued");
        // receiver gone means we are shutting down
        let _ = self.tx.send(Some(decl));
        req_id
    }
}

/// Drives the agent: waits for a new declaration and posts it. A failed
/// post is logged and dropped; every declaration carries the full state, so
/// the next one repairs the device regardless.
pub(crate) async fn run_agent(mut rx: DeclarationRx, sink: impl AgentSink) {
    loop {
        if rx.changed().await.is_err() {
            debug!("publisher closed, agent exiting");
            return;
        }
        let Some(decl) = rx.borrow_and_update().clone() else {
            continue;
        };
        if let Err(e) = sink.post(&decl).await {
            error!(req_id = decl.req_id, err = %e, "declaration post failed");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{PartitionConfig, ResourceConfig};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingAgent {
        posted: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl AgentSink for RecordingAgent {
        async fn post(&self, decl: &Declaration) -> anyhow::Result<()> {
            self.posted.lock().push(decl.req_id);
            Ok(())
        }
    }

    fn dirty_store() -> ResourceStore {
        let mut store = ResourceStore::new("test");
        store.ltm.insert(
            "test".to_string(),
            PartitionConfig {
                resources: [("vs_80".to_string(), ResourceConfig::default())]
                    .into_iter()
                    .collect(),
                priority: 0,
            },
        );
        store
    }

    #[test]
    fn test_publish_increments_req_id_and_cleans_store() {
        let (publisher, _rx) = channel();
        let mut store = dirty_store();

        assert!(store.is_dirty());
        assert_eq!(publisher.publish(&mut store), 1);
        assert!(!store.is_dirty());

        store.ltm.clear();
        assert!(store.is_dirty());
        assert_eq!(publisher.publish(&mut store), 2);
    }

    #[tokio::test]
    async fn test_agent_sees_latest_declaration() {
        let (publisher, rx) = channel();
        let agent = RecordingAgent::default();
        let posted = agent.posted.clone();

        let mut store = dirty_store();
        publisher.publish(&mut store);
        store.ltm.clear();
        publisher.publish(&mut store);

        let handle = tokio::spawn(run_agent(rx, agent));
        tokio::task::yield_now().await;
        drop(publisher);
        let _ = handle.await;

        // both publishes happened before the agent ran, so only the newest
        // declaration is posted
        assert_eq!(posted.lock().clone(), vec![2]);
    }
}
