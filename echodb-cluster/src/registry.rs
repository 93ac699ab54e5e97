//! # Leader Registry
//!
//! Per-node leader records under `cluster/leaders/<node_id>` for
//! designated-leader deployments, where followers are told which node to
//! watch instead of contending. Same JSON encoding as the election record.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use echodb_core::Result;
use echodb_store::ObjectStore;

use crate::election::LeaderRecord;

const LEADER_PREFIX: &str = "cluster/leaders/";

pub struct LeaderRegistry {
    store: Arc<dyn ObjectStore>,
    lease_duration: Duration,
}

impl LeaderRegistry {
    pub fn new(store: Arc<dyn ObjectStore>, lease_duration: Duration) -> Self {
        Self {
            store,
            lease_duration,
        }
    }

    /// Register this node as a designated leader.
    pub async fn register(&self, node_id: &str) -> Result<()> {
        self.publish(node_id).await?;
        info!(node = %node_id, "registered as designated leader");
        Ok(())
    }

    /// Refresh the node's lease.
    pub async fn heartbeat(&self, node_id: &str) -> Result<()> {
        self.publish(node_id).await
    }

    /// The registry record for `node_id`, if one exists and parses. An
    /// unreadable record is treated as absent.
    pub async fn leader_info(&self, node_id: &str) -> Result<Option<LeaderRecord>> {
        let blob = match self.store.get(&Self::key_for(node_id)).await? {
            Some(blob) => blob,
            None => return Ok(None),
        };
        match serde_json::from_slice(&blob) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(node = %node_id, error = %e, "unreadable registry record");
                Ok(None)
            }
        }
    }

    /// Remove the node's record.
    pub async fn step_down(&self, node_id: &str) -> Result<()> {
        self.store.delete(&Self::key_for(node_id)).await?;
        info!(node = %node_id, "removed from leader registry");
        Ok(())
    }

    async fn publish(&self, node_id: &str) -> Result<()> {
        let record = LeaderRecord::claim(node_id, self.lease_duration);
        let payload = serde_json::to_vec(&record).map_err(|e| {
            echodb_core::Error::Internal {
                message: format!("failed to encode registry record: {}", e),
            }
        })?;
        self.store.put(&Self::key_for(node_id), payload.into()).await
    }

    fn key_for(node_id: &str) -> String {
        format!("{}{}", LEADER_PREFIX, node_id)
    }
}
