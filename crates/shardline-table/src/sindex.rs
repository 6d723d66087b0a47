//! Secondary-index status.
//!
//! The index runtime follows the committed table config and answers
//! status queries. Index builds themselves belong to the storage engine;
//! `SindexManager` reports every index in the committed config and
//! remembers when each was first seen, so a reader can tell a freshly
//! added index from one that has been around.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardline_cluster::View;
use shardline_core::{CommittedState, SindexConfig, TableConfig};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SindexStatus {
    pub blocks_processed: u64,
    pub blocks_total: u64,
    pub ready: bool,
    /// Unix seconds when this server first saw the index.
    pub start_time: u64,
}

pub type SindexStatusMap = BTreeMap<String, (SindexConfig, SindexStatus)>;

#[async_trait]
pub trait IndexRuntime: Send + Sync {
    /// Status of every index, or `None` if `cancel` fired first.
    async fn get_status(&self, cancel: &CancellationToken) -> Option<SindexStatusMap>;
}

pub trait IndexRuntimeFactory: Send + Sync + 'static {
    fn build(&self, config: View<CommittedState, TableConfig>) -> Arc<dyn IndexRuntime>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SindexManagerFactory;

impl IndexRuntimeFactory for SindexManagerFactory {
    fn build(&self, config: View<CommittedState, TableConfig>) -> Arc<dyn IndexRuntime> {
        Arc::new(SindexManager::new(config))
    }
}

pub struct SindexManager {
    config: View<CommittedState, TableConfig>,
    /// (config, first seen) per index name.
    seen: Mutex<BTreeMap<String, (SindexConfig, u64)>>,
}

impl SindexManager {
    pub fn new(config: View<CommittedState, TableConfig>) -> Self {
        Self {
            config,
            seen: Mutex::new(BTreeMap::new()),
        }
    }

    fn status_now(&self) -> SindexStatusMap {
        let config = self.config.get();
        let now = unix_now();
        let mut seen = self.seen.lock();
        seen.retain(|name, _| config.sindexes.contains_key(name));

        config
            .sindexes
            .into_iter()
            .map(|(name, sindex)| {
                let entry = seen.entry(name.clone()).or_insert_with(|| (sindex.clone(), now));
                // A redefined index counts as new.
                if entry.0 != sindex {
                    *entry = (sindex.clone(), now);
                }
                let status = SindexStatus {
                    blocks_processed: 0,
                    blocks_total: 0,
                    ready: true,
                    start_time: entry.1,
                };
                (name, (sindex, status))
            })
            .collect()
    }
}

#[async_trait]
impl IndexRuntime for SindexManager {
    async fn get_status(&self, cancel: &CancellationToken) -> Option<SindexStatusMap> {
        if cancel.is_cancelled() {
            return None;
        }
        Some(self.status_now())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
