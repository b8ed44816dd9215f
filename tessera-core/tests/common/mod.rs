#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tessera_core::{
    BlobTransferClient, BlobTransferConfig, ChangeRecord, InMemoryChangeLog, Operation,
    PartitionKey, PartitionReplica, PartitionState, Result, SnapshotSource, StoreRepository,
    TesseraError, TransferManifest, encode_put,
};

/// In-process stand-in for the HTTP session protocol, one `SnapshotSource`
/// per peer URL.
#[derive(Default)]
pub struct LocalTransferClient {
    peers: HashMap<String, Peer>,
    fetched: Mutex<HashMap<String, usize>>,
}

struct Peer {
    source: Arc<SnapshotSource>,
    /// Drop the connection once this share of the manifest's files was sent.
    disconnect_after: Option<f64>,
}

impl LocalTransferClient {
    pub fn with_peer(mut self, url: &str, source: Arc<SnapshotSource>) -> Self {
        self.peers.insert(
            url.to_string(),
            Peer {
                source,
                disconnect_after: None,
            },
        );
        self
    }

    pub fn with_flaky_peer(
        mut self,
        url: &str,
        source: Arc<SnapshotSource>,
        disconnect_after: f64,
    ) -> Self {
        self.peers.insert(
            url.to_string(),
            Peer {
                source,
                disconnect_after: Some(disconnect_after),
            },
        );
        self
    }

    pub fn files_fetched(&self, session_id: &str) -> usize {
        self.fetched
            .lock()
            .unwrap()
            .get(session_id)
            .copied()
            .unwrap_or_default()
    }

    fn peer(&self, url: &str) -> Result<&Peer> {
        self.peers
            .get(url)
            .ok_or_else(|| TesseraError::Http(format!("{} unreachable", url)))
    }
}

#[async_trait]
impl BlobTransferClient for LocalTransferClient {
    async fn open_session(
        &self,
        peer_url: &str,
        partition: &PartitionKey,
    ) -> Result<TransferManifest> {
        self.peer(peer_url)?.source.create_session(partition).await
    }

    async fn fetch_file(&self, peer_url: &str, session_id: &str, name: &str) -> Result<Bytes> {
        let peer = self.peer(peer_url)?;

        if let Some(share) = peer.disconnect_after {
            let manifest = peer
                .source
                .manifest(session_id)
                .await
                .ok_or_else(|| TesseraError::Http("session gone".to_string()))?;
            let limit = (manifest.files.len() as f64 * share).ceil() as usize;
            if self.files_fetched(session_id) >= limit {
                return Err(TesseraError::Http(format!(
                    "{} closed the connection",
                    peer_url
                )));
            }
        }

        let data = peer.source.read_file(session_id, name).await?;
        *self
            .fetched
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default() += 1;
        Ok(data)
    }

    async fn close_session(&self, peer_url: &str, session_id: &str) -> Result<()> {
        self.peer(peer_url)?.source.release_session(session_id).await?;
        Ok(())
    }
}

pub fn small_parts() -> BlobTransferConfig {
    BlobTransferConfig {
        part_size_bytes: 4096,
        ..BlobTransferConfig::default()
    }
}

pub fn put(offset: u64, key: &str, value: &str) -> ChangeRecord {
    ChangeRecord {
        offset,
        key: Bytes::from(key.to_string()),
        operation: Operation::Put(Bytes::from(value.to_string())),
    }
}

pub fn delete(offset: u64, key: &str) -> ChangeRecord {
    ChangeRecord {
        offset,
        key: Bytes::from(key.to_string()),
        operation: Operation::Delete,
    }
}

/// Appends `count` puts of `key-NNNN` to the partition's topic.
pub fn append_puts(log: &InMemoryChangeLog, key: &PartitionKey, from: u64, count: u64) {
    let topic = key.store_version.topic_name();
    for i in from..from + count {
        let payload = encode_put(format!("key-{:04}", i).as_bytes(), &vec![b'v'; 200]);
        log.append(&topic, key.partition, payload).unwrap();
    }
}

/// A READY partition holding `count` rows, committed through `count - 1`.
pub async fn ready_partition(
    repository: &StoreRepository,
    key: &PartitionKey,
    count: u64,
) -> Arc<PartitionReplica> {
    let engine = repository.open(&key.store_version).await.unwrap();
    let replica = engine.open_partition(key.partition).unwrap();
    replica.transition(PartitionState::Ingesting).unwrap();

    let records: Vec<ChangeRecord> = (0..count)
        .map(|i| ChangeRecord {
            offset: i,
            key: Bytes::from(format!("key-{:04}", i)),
            operation: Operation::Put(Bytes::from(vec![b'v'; 200])),
        })
        .collect();
    replica.apply_batch(&records).unwrap();
    replica.transition(PartitionState::Ready).unwrap();
    replica
}

pub async fn wait_for_state(replica: &PartitionReplica, state: PartitionState, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while replica.state().unwrap() != state {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} stuck in {:?}, expected {:?}",
            replica.key(),
            replica.state().unwrap(),
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
