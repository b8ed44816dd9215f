use super::retry::retry_with_backoff;
use crate::changelog::{ChangeLog, ChangeRecord, LogSubscription, decode_record};
use crate::config::IngestionConfig;
use crate::error::{Result, TesseraError};
use crate::meta::PartitionState;
use crate::storage::{PartitionReplica, StorageEngine};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Progress published by a consumer task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionProgress {
    /// Offset the subscription started from.
    pub start_offset: u64,
    /// First offset this task actually applied.
    pub first_applied: Option<u64>,
    pub committed: Option<u64>,
    pub records_applied: u64,
    pub caught_up: bool,
}

/// Applies one partition's log to its replica, strictly in order, one batch
/// at a time.
pub(crate) struct ConsumerTask {
    pub(crate) replica: Arc<PartitionReplica>,
    pub(crate) engine: Arc<StorageEngine>,
    pub(crate) log: Arc<dyn ChangeLog>,
    pub(crate) config: IngestionConfig,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) progress: watch::Sender<IngestionProgress>,
}

enum Step {
    Continue,
    Halt,
}

impl ConsumerTask {
    pub(crate) async fn run(mut self) {
        let key = self.replica.key().clone();

        let start_offset = match self.replica.status() {
            Ok(status) => status.resume_offset(),
            Err(e) => {
                self.halt(format!("cannot read status: {}", e));
                return;
            }
        };
        self.progress.send_modify(|progress| {
            progress.start_offset = start_offset;
            progress.committed = start_offset.checked_sub(1);
        });

        let topic = key.store_version.topic_name();
        let mut subscription = match self.log.subscribe(&topic, key.partition, start_offset).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.halt(format!("subscribe to {} failed: {}", topic, e));
                return;
            }
        };
        info!("Consuming {} from offset {}", key, start_offset);

        loop {
            // A dropped sender counts as a stop request.
            if *self.shutdown.borrow() || self.shutdown.has_changed().is_err() {
                break;
            }

            match self.step(&mut subscription).await {
                Step::Continue => {}
                Step::Halt => return,
            }
        }

        if let Err(e) = self.replica.transition(PartitionState::Unassigned) {
            warn!("Failed to release {} after stop: {}", key, e);
        }
        info!(
            "Stopped consuming {} at committed offset {:?}",
            key,
            self.progress.borrow().committed
        );
    }

    async fn step(&mut self, subscription: &mut Box<dyn LogSubscription>) -> Step {
        let entries = match subscription.poll(self.config.max_batch_records).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Poll failed for {}: {}", self.replica.key(), e);
                self.idle().await;
                return Step::Continue;
            }
        };

        if entries.is_empty() {
            self.check_caught_up(subscription.position()).await;
            self.idle().await;
            return Step::Continue;
        }

        let mut records = Vec::with_capacity(entries.len());
        let mut decode_failure = None;
        for entry in &entries {
            match decode_record(entry) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    decode_failure = Some((entry.offset, reason));
                    break;
                }
            }
        }

        // Records before a malformed one are still applied.
        if !records.is_empty() {
            if let Err(e) = self.apply(&records).await {
                self.halt(format!("apply failed after retries: {}", e));
                return Step::Halt;
            }
        }

        if let Some((offset, reason)) = decode_failure {
            let error = TesseraError::Consumption {
                partition: self.replica.key().clone(),
                offset,
                reason,
            };
            self.halt(error.to_string());
            return Step::Halt;
        }

        if entries.len() < self.config.max_batch_records {
            self.check_caught_up(subscription.position()).await;
        }
        Step::Continue
    }

    async fn apply(&self, records: &[ChangeRecord]) -> Result<()> {
        let before = self.replica.committed_offset()?;
        let replica = &self.replica;
        let engine = &self.engine;

        let committed = retry_with_backoff(&self.config.retry, || async move {
            let _writer = engine.begin_write()?;
            replica.apply_batch(records)
        })
        .await?;

        let applied: Vec<u64> = records
            .iter()
            .map(|record| record.offset)
            .filter(|offset| before.is_none_or(|before| *offset > before))
            .collect();

        self.progress.send_modify(|progress| {
            if progress.first_applied.is_none() {
                progress.first_applied = applied.first().copied();
            }
            progress.committed = committed;
            progress.records_applied += applied.len() as u64;
        });
        debug!(
            "Applied {} records to {}, committed {:?}",
            applied.len(),
            self.replica.key(),
            committed
        );
        Ok(())
    }

    async fn check_caught_up(&self, position: u64) {
        if self.progress.borrow().caught_up {
            return;
        }

        let key = self.replica.key();
        let end = match self.log.end_offset(&key.store_version.topic_name(), key.partition).await {
            Ok(end) => end,
            Err(e) => {
                debug!("Cannot read end offset of {}: {}", key, e);
                return;
            }
        };

        if position >= end {
            match self.replica.transition(PartitionState::Ready) {
                Ok(_) => self.progress.send_modify(|progress| progress.caught_up = true),
                Err(e) => warn!("Failed to mark {} ready: {}", key, e),
            }
        }
    }

    async fn idle(&mut self) {
        let interval = self.config.idle_poll_interval();
        tokio::select! {
            _ = sleep(interval) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    fn halt(&self, reason: String) {
        if let Err(e) = self.replica.fail(reason) {
            warn!("Failed to mark {} as errored: {}", self.replica.key(), e);
        }
    }
}
