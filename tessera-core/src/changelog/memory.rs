use super::{ChangeLog, LogEntry, LogSubscription};
use crate::error::{Result, TesseraError, lock_poisoned};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type Partitions = HashMap<(String, u32), Vec<LogEntry>>;

/// Process-local change-log. Offsets of each partition start at 0.
#[derive(Clone, Default)]
pub struct InMemoryChangeLog {
    partitions: Arc<RwLock<Partitions>>,
}

impl InMemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw payload and returns its offset.
    pub fn append(&self, topic: &str, partition: u32, payload: Bytes) -> Result<u64> {
        let mut partitions = self
            .partitions
            .write()
            .map_err(|_| lock_poisoned("changelog"))?;
        let entries = partitions
            .entry((topic.to_string(), partition))
            .or_default();
        let offset = entries.len() as u64;
        entries.push(LogEntry { offset, payload });
        Ok(offset)
    }

    pub fn append_all<I>(&self, topic: &str, partition: u32, payloads: I) -> Result<u64>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut last = None;
        for payload in payloads {
            last = Some(self.append(topic, partition, payload)?);
        }
        last.ok_or_else(|| TesseraError::InvalidRequest("no payloads".to_string()))
    }

    fn read(&self, topic: &str, partition: u32, from: u64, max: usize) -> Result<Vec<LogEntry>> {
        let partitions = self
            .partitions
            .read()
            .map_err(|_| lock_poisoned("changelog"))?;
        let Some(entries) = partitions.get(&(topic.to_string(), partition)) else {
            return Ok(Vec::new());
        };

        let start = (from as usize).min(entries.len());
        let end = start.saturating_add(max).min(entries.len());
        Ok(entries[start..end].to_vec())
    }

    fn len(&self, topic: &str, partition: u32) -> Result<u64> {
        let partitions = self
            .partitions
            .read()
            .map_err(|_| lock_poisoned("changelog"))?;
        Ok(partitions
            .get(&(topic.to_string(), partition))
            .map(|entries| entries.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl ChangeLog for InMemoryChangeLog {
    async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
    ) -> Result<Box<dyn LogSubscription>> {
        Ok(Box::new(MemorySubscription {
            log: self.clone(),
            topic: topic.to_string(),
            partition,
            position: from_offset,
        }))
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64> {
        self.len(topic, partition)
    }
}

struct MemorySubscription {
    log: InMemoryChangeLog,
    topic: String,
    partition: u32,
    position: u64,
}

#[async_trait]
impl LogSubscription for MemorySubscription {
    async fn poll(&mut self, max_records: usize) -> Result<Vec<LogEntry>> {
        let entries = self
            .log
            .read(&self.topic, self.partition, self.position, max_records)?;
        if let Some(last) = entries.last() {
            self.position = last.offset + 1;
        }
        Ok(entries)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::encode_put;

    #[tokio::test]
    async fn test_offsets_start_at_zero_and_poll_in_order() {
        let log = InMemoryChangeLog::new();
        for i in 0..5u8 {
            let offset = log.append("users_v1", 0, encode_put(&[i], b"v")).unwrap();
            assert_eq!(offset, i as u64);
        }
        assert_eq!(log.end_offset("users_v1", 0).await.unwrap(), 5);
        assert_eq!(log.end_offset("users_v1", 1).await.unwrap(), 0);

        let mut subscription = log.subscribe("users_v1", 0, 2).await.unwrap();
        let batch = subscription.poll(2).await.unwrap();
        assert_eq!(batch.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(subscription.position(), 4);

        let batch = subscription.poll(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(subscription.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_sees_later_appends() {
        let log = InMemoryChangeLog::new();
        let mut subscription = log.subscribe("t", 3, 0).await.unwrap();
        assert!(subscription.poll(10).await.unwrap().is_empty());

        log.append("t", 3, encode_put(b"a", b"1")).unwrap();
        let batch = subscription.poll(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 0);
    }
}
