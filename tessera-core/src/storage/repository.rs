use super::partition::PartitionReplica;
use crate::error::{Result, TesseraError, lock_poisoned};
use crate::meta::{PartitionKey, StoreVersion};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::RwLock as AsyncRwLock;

/// Storage engine of one store-version: a directory holding one database per
/// locally hosted partition.
pub struct StorageEngine {
    store_version: StoreVersion,
    dir: PathBuf,
    partitions: RwLock<BTreeMap<u32, Arc<PartitionReplica>>>,
    writers: Arc<AtomicUsize>,
    closed: AtomicBool,
}

/// Counts one in-flight write against its engine until dropped.
pub struct WriterGuard {
    writers: Arc<AtomicUsize>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StorageEngine {
    fn open(store_version: StoreVersion, dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            store_version,
            dir,
            partitions: RwLock::new(BTreeMap::new()),
            writers: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn store_version(&self) -> &StoreVersion {
        &self.store_version
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partition_dir(&self, partition: u32) -> PathBuf {
        self.dir.join(format!("p{}", partition))
    }

    /// Opens the partition's database, or returns the already open replica.
    pub fn open_partition(&self, partition: u32) -> Result<Arc<PartitionReplica>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TesseraError::Storage(format!(
                "engine {} is closed",
                self.store_version
            )));
        }

        let mut partitions = self
            .partitions
            .write()
            .map_err(|_| lock_poisoned("engine partitions"))?;
        if let Some(replica) = partitions.get(&partition) {
            return Ok(replica.clone());
        }

        let replica = Arc::new(PartitionReplica::open(
            self.store_version.partition(partition),
            self.partition_dir(partition),
        )?);
        partitions.insert(partition, replica.clone());
        Ok(replica)
    }

    pub fn partition(&self, partition: u32) -> Option<Arc<PartitionReplica>> {
        self.partitions
            .read()
            .ok()
            .and_then(|partitions| partitions.get(&partition).cloned())
    }

    pub fn partitions(&self) -> Vec<Arc<PartitionReplica>> {
        self.partitions
            .read()
            .map(|partitions| partitions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn partition_ids(&self) -> Vec<u32> {
        self.partitions
            .read()
            .map(|partitions| partitions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drops the partition from the engine; its files stay on disk.
    pub fn release_partition(&self, partition: u32) -> Result<Option<Arc<PartitionReplica>>> {
        let released = self
            .partitions
            .write()
            .map_err(|_| lock_poisoned("engine partitions"))?
            .remove(&partition);
        if let Some(replica) = &released {
            replica.flush()?;
        }
        Ok(released)
    }

    fn replica(&self, partition: u32) -> Result<Arc<PartitionReplica>> {
        self.partition(partition)
            .ok_or_else(|| TesseraError::PartitionNotHosted {
                partition: self.store_version.partition(partition),
            })
    }

    /// Registers a writer. Fails once the engine is closed.
    pub fn begin_write(&self) -> Result<WriterGuard> {
        // Register before checking `closed`; `close` does the reverse.
        self.writers.fetch_add(1, Ordering::SeqCst);
        let guard = WriterGuard {
            writers: self.writers.clone(),
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(TesseraError::Storage(format!(
                "engine {} is closed",
                self.store_version
            )));
        }
        Ok(guard)
    }

    pub fn in_flight_writers(&self) -> usize {
        self.writers.load(Ordering::SeqCst)
    }

    pub fn get(&self, partition: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.replica(partition)?.get(key)
    }

    pub fn put(&self, partition: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.begin_write()?;
        self.replica(partition)?.put(key, value)
    }

    pub fn delete(&self, partition: u32, key: &[u8]) -> Result<bool> {
        let _guard = self.begin_write()?;
        self.replica(partition)?.delete(key)
    }

    /// Flushes every partition and rejects further writes. Fails while writers
    /// are still in flight.
    pub fn close(&self) -> Result<()> {
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        let writers = self.in_flight_writers();
        if writers > 0 {
            if !was_closed {
                self.closed.store(false, Ordering::SeqCst);
            }
            return Err(TesseraError::Storage(format!(
                "engine {} has {} in-flight writers",
                self.store_version, writers
            )));
        }

        for replica in self.partitions() {
            replica.flush()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Registry of open storage engines keyed by store-version.
pub struct StoreRepository {
    data_dir: PathBuf,
    engines: AsyncRwLock<HashMap<StoreVersion, Arc<StorageEngine>>>,
}

impl StoreRepository {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            engines: AsyncRwLock::new(HashMap::new()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn engine_dir(&self, store_version: &StoreVersion) -> PathBuf {
        self.data_dir
            .join(&store_version.store)
            .join(format!("v{}", store_version.version))
    }

    /// Creates the engine on first call; later calls return the same handle.
    pub async fn open(&self, store_version: &StoreVersion) -> Result<Arc<StorageEngine>> {
        if let Some(engine) = self.engines.read().await.get(store_version) {
            return Ok(engine.clone());
        }

        let mut engines = self.engines.write().await;
        if let Some(engine) = engines.get(store_version) {
            return Ok(engine.clone());
        }

        let engine = Arc::new(StorageEngine::open(
            store_version.clone(),
            self.engine_dir(store_version),
        )?);
        engines.insert(store_version.clone(), engine.clone());
        tracing::info!("Opened storage engine {}", store_version);
        Ok(engine)
    }

    pub async fn engine(&self, store_version: &StoreVersion) -> Option<Arc<StorageEngine>> {
        self.engines.read().await.get(store_version).cloned()
    }

    pub async fn engines(&self) -> Vec<Arc<StorageEngine>> {
        self.engines.read().await.values().cloned().collect()
    }

    /// Flushes and releases the engine. Closing an unknown engine is a no-op.
    pub async fn close(&self, store_version: &StoreVersion) -> Result<()> {
        let mut engines = self.engines.write().await;
        let Some(engine) = engines.get(store_version) else {
            return Ok(());
        };

        engine.close()?;
        engines.remove(store_version);
        tracing::info!("Closed storage engine {}", store_version);
        Ok(())
    }

    /// Closes the engine and deletes its directory.
    pub async fn remove(&self, store_version: &StoreVersion) -> Result<()> {
        self.close(store_version).await?;

        let dir = self.engine_dir(store_version);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tracing::info!("Removed data of {} at {:?}", store_version, dir);
        Ok(())
    }

    pub async fn replica(&self, key: &PartitionKey) -> Result<Arc<PartitionReplica>> {
        self.engine(&key.store_version)
            .await
            .and_then(|engine| engine.partition(key.partition))
            .ok_or_else(|| TesseraError::PartitionNotHosted {
                partition: key.clone(),
            })
    }

    pub async fn replicas(&self) -> Vec<Arc<PartitionReplica>> {
        let mut replicas: Vec<Arc<PartitionReplica>> = self
            .engines()
            .await
            .iter()
            .flat_map(|engine| engine.partitions())
            .collect();
        replicas.sort_by(|a, b| a.key().cmp(b.key()));
        replicas
    }

    pub async fn get(&self, key: &PartitionKey, item: &[u8]) -> Result<Vec<u8>> {
        let engine = self.hosted_engine(key).await?;
        engine
            .get(key.partition, item)?
            .ok_or_else(|| TesseraError::NotFound(String::from_utf8_lossy(item).into_owned()))
    }

    pub async fn put(&self, key: &PartitionKey, item: &[u8], value: &[u8]) -> Result<()> {
        self.hosted_engine(key).await?.put(key.partition, item, value)
    }

    pub async fn delete(&self, key: &PartitionKey, item: &[u8]) -> Result<()> {
        if self.hosted_engine(key).await?.delete(key.partition, item)? {
            Ok(())
        } else {
            Err(TesseraError::NotFound(String::from_utf8_lossy(item).into_owned()))
        }
    }

    async fn hosted_engine(&self, key: &PartitionKey) -> Result<Arc<StorageEngine>> {
        self.engine(&key.store_version)
            .await
            .ok_or_else(|| TesseraError::PartitionNotHosted {
                partition: key.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::PartitionState;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let repository = StoreRepository::new(dir.path().to_path_buf()).unwrap();
        let version = StoreVersion::new("users", 1);

        let first = repository.open(&version).await.unwrap();
        let second = repository.open(&version).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let a = first.open_partition(2).unwrap();
        let b = second.open_partition(2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let entries: Vec<_> = std::fs::read_dir(repository.engine_dir(&version))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_get_put_delete_delegate_to_partition() {
        let dir = TempDir::new().unwrap();
        let repository = StoreRepository::new(dir.path().to_path_buf()).unwrap();
        let version = StoreVersion::new("users", 1);
        let engine = repository.open(&version).await.unwrap();
        let replica = engine.open_partition(0).unwrap();
        replica.transition(PartitionState::Ingesting).unwrap();

        let key = version.partition(0);
        repository.put(&key, b"k", b"v").await.unwrap();
        assert_eq!(repository.get(&key, b"k").await.unwrap(), b"v".to_vec());

        repository.delete(&key, b"k").await.unwrap();
        assert!(repository.get(&key, b"k").await.unwrap_err().is_not_found());
        assert!(repository.delete(&key, b"k").await.unwrap_err().is_not_found());

        let missing = version.partition(9);
        assert!(repository.get(&missing, b"k").await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_close_refuses_in_flight_writers() {
        let dir = TempDir::new().unwrap();
        let repository = StoreRepository::new(dir.path().to_path_buf()).unwrap();
        let version = StoreVersion::new("users", 1);
        let engine = repository.open(&version).await.unwrap();

        let guard = engine.begin_write().unwrap();
        assert!(matches!(
            repository.close(&version).await,
            Err(TesseraError::Storage(_))
        ));
        assert!(repository.engine(&version).await.is_some());
        assert!(!engine.is_closed());
        assert_eq!(engine.in_flight_writers(), 1);

        drop(guard);
        repository.close(&version).await.unwrap();
        assert!(repository.engine(&version).await.is_none());
        assert!(engine.begin_write().is_err());
    }

    #[test]
    fn test_rejected_writer_does_not_hold_the_engine_open() {
        let dir = TempDir::new().unwrap();
        let engine =
            StorageEngine::open(StoreVersion::new("users", 1), dir.path().to_path_buf()).unwrap();

        engine.close().unwrap();
        assert!(engine.begin_write().is_err());
        assert_eq!(engine.in_flight_writers(), 0);
        engine.close().unwrap();
    }

    #[tokio::test]
    async fn test_close_keeps_data_and_remove_deletes_it() {
        let dir = TempDir::new().unwrap();
        let repository = StoreRepository::new(dir.path().to_path_buf()).unwrap();
        let version = StoreVersion::new("users", 1);
        let engine = repository.open(&version).await.unwrap();
        engine.open_partition(0).unwrap();

        repository.close(&version).await.unwrap();
        assert!(repository.engine_dir(&version).join("p0").exists());

        repository.open(&version).await.unwrap();
        repository.remove(&version).await.unwrap();
        assert!(!repository.engine_dir(&version).exists());
    }
}
