use super::task::{ConsumerTask, IngestionProgress};
use crate::changelog::ChangeLog;
use crate::config::IngestionConfig;
use crate::error::{Result, TesseraError};
use crate::meta::{PartitionKey, PartitionState};
use crate::orchestrator::NodeService;
use crate::storage::StoreRepository;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct TaskHandle {
    shutdown: watch::Sender<bool>,
    progress: watch::Receiver<IngestionProgress>,
    join: JoinHandle<()>,
}

/// Runs one consumer task per INGESTING or READY partition.
pub struct IngestionService {
    repository: Arc<StoreRepository>,
    log: Arc<dyn ChangeLog>,
    config: IngestionConfig,
    tasks: Mutex<HashMap<PartitionKey, TaskHandle>>,
}

impl IngestionService {
    pub fn new(
        repository: Arc<StoreRepository>,
        log: Arc<dyn ChangeLog>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            repository,
            log,
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the consumer for an INGESTING partition. Returns `false` when a
    /// live task already exists.
    pub async fn start_consumption(&self, key: &PartitionKey) -> Result<bool> {
        let engine = self
            .repository
            .engine(&key.store_version)
            .await
            .ok_or_else(|| TesseraError::PartitionNotHosted {
                partition: key.clone(),
            })?;
        let replica = engine
            .partition(key.partition)
            .ok_or_else(|| TesseraError::PartitionNotHosted {
                partition: key.clone(),
            })?;

        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.get(key) {
            if !handle.join.is_finished() {
                return Ok(false);
            }
        }

        let state = replica.state()?;
        if state != PartitionState::Ingesting {
            return Err(TesseraError::PartitionUnavailable {
                partition: key.clone(),
                state,
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(IngestionProgress::default());
        let task = ConsumerTask {
            replica,
            engine,
            log: self.log.clone(),
            config: self.config.clone(),
            shutdown: shutdown_rx,
            progress: progress_tx,
        };

        let join = tokio::spawn(task.run());
        tasks.insert(
            key.clone(),
            TaskHandle {
                shutdown: shutdown_tx,
                progress: progress_rx,
                join,
            },
        );
        Ok(true)
    }

    /// Gracefully stops one consumer: the in-flight batch and its checkpoint
    /// finish first. The task is aborted after the shutdown timeout.
    pub async fn stop_consumption(&self, key: &PartitionKey) -> Result<()> {
        let handle = self.tasks.lock().await.remove(key);
        match handle {
            Some(handle) => self.shutdown_task(key, handle).await,
            None => Ok(()),
        }
    }

    async fn shutdown_task(&self, key: &PartitionKey, handle: TaskHandle) -> Result<()> {
        let TaskHandle {
            shutdown, mut join, ..
        } = handle;
        let _ = shutdown.send(true);

        match tokio::time::timeout(self.config.shutdown_timeout(), &mut join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TesseraError::Internal(format!(
                "consumer for {} panicked: {}",
                key, e
            ))),
            Err(_) => {
                warn!(
                    "Consumer for {} did not stop within {:?}, aborting",
                    key,
                    self.config.shutdown_timeout()
                );
                join.abort();
                let replica = self.repository.replica(key).await?;
                if replica.state()?.is_consuming() {
                    replica.transition(PartitionState::Unassigned)?;
                }
                Ok(())
            }
        }
    }

    /// Moves an ERROR partition back to INGESTING and consumes again from its
    /// last committed offset.
    pub async fn restart_consumption(&self, key: &PartitionKey) -> Result<()> {
        let replica = self.repository.replica(key).await?;
        let state = replica.state()?;
        if state != PartitionState::Error {
            return Err(TesseraError::InvalidStateTransition {
                partition: key.clone(),
                from: state,
                to: PartitionState::Ingesting,
            });
        }

        if let Some(handle) = self.tasks.lock().await.remove(key) {
            // The halted task has already returned.
            let _ = handle.join.await;
        }

        replica.transition(PartitionState::Ingesting)?;
        info!("Restarting consumption of {}", key);
        self.start_consumption(key).await?;
        Ok(())
    }

    pub async fn progress(&self, key: &PartitionKey) -> Option<IngestionProgress> {
        self.tasks
            .lock()
            .await
            .get(key)
            .map(|handle| handle.progress.borrow().clone())
    }

    pub async fn is_consuming(&self, key: &PartitionKey) -> bool {
        self.tasks
            .lock()
            .await
            .get(key)
            .is_some_and(|handle| !handle.join.is_finished())
    }

    pub async fn active_partitions(&self) -> Vec<PartitionKey> {
        let tasks = self.tasks.lock().await;
        let mut keys: Vec<PartitionKey> = tasks
            .iter()
            .filter(|(_, handle)| !handle.join.is_finished())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Waits until the partition's committed offset reaches `offset`.
    ///
    /// Fails when the task halts first or the timeout elapses.
    pub async fn wait_for_offset(
        &self,
        key: &PartitionKey,
        offset: u64,
        timeout: Duration,
    ) -> Result<IngestionProgress> {
        let mut progress = self
            .tasks
            .lock()
            .await
            .get(key)
            .map(|handle| handle.progress.clone())
            .ok_or_else(|| TesseraError::PartitionNotHosted {
                partition: key.clone(),
            })?;

        let reached = tokio::time::timeout(
            timeout,
            progress.wait_for(|p| p.committed.is_some_and(|committed| committed >= offset)),
        )
        .await
        .map(|waited| waited.map(|current| current.clone()));

        match reached {
            Ok(Ok(current)) => Ok(current),
            Ok(Err(_)) => {
                let state = self.repository.replica(key).await?.state()?;
                Err(TesseraError::PartitionUnavailable {
                    partition: key.clone(),
                    state,
                })
            }
            Err(_) => Err(TesseraError::Internal(format!(
                "timed out waiting for {} to reach offset {}",
                key, offset
            ))),
        }
    }
}

#[async_trait]
impl NodeService for IngestionService {
    fn name(&self) -> &str {
        "ingestion"
    }

    async fn start(&self) -> Result<()> {
        let mut started = 0;
        for replica in self.repository.replicas().await {
            if replica.state()? == PartitionState::Ingesting
                && self.start_consumption(replica.key()).await?
            {
                started += 1;
            }
        }
        info!("Ingestion service started {} consumers", started);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let handles: Vec<(PartitionKey, TaskHandle)> =
            self.tasks.lock().await.drain().collect();
        let count = handles.len();

        let results = join_all(
            handles
                .into_iter()
                .map(|(key, handle)| async move { self.shutdown_task(&key, handle).await }),
        )
        .await;

        info!("Ingestion service stopped {} consumers", count);
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}
