use super::{ManifestFile, TransferManifest, part_name};
use crate::config::BlobTransferConfig;
use crate::error::{Result, TesseraError};
use crate::meta::{PartitionKey, PartitionState};
use crate::orchestrator::NodeService;
use crate::storage::StoreRepository;
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

const SNAPSHOT_FILE_NAME: &str = "snapshot.sqlite3";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

struct SourceSession {
    dir: PathBuf,
    manifest: TransferManifest,
    last_access: Instant,
}

type Sessions = Arc<Mutex<HashMap<String, SourceSession>>>;

/// Serves snapshots of local READY partitions to peers.
///
/// Each session owns a directory of part files cut from a `VACUUM INTO` copy,
/// so the partition keeps serving and ingesting while peers download.
/// Sessions live until released or idle for longer than the TTL.
pub struct SnapshotSource {
    repository: Arc<StoreRepository>,
    work_dir: PathBuf,
    part_size: u64,
    session_ttl: Duration,
    sessions: Sessions,
    sweeper: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl SnapshotSource {
    /// Clears `work_dir`; sessions do not survive a restart.
    pub fn new(
        repository: Arc<StoreRepository>,
        work_dir: PathBuf,
        config: &BlobTransferConfig,
    ) -> Result<Self> {
        if work_dir.exists() {
            std::fs::remove_dir_all(&work_dir)?;
        }
        std::fs::create_dir_all(&work_dir)?;

        Ok(Self {
            repository,
            work_dir,
            part_size: config.part_size_bytes.max(1),
            session_ttl: config.session_ttl(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Mutex::new(None),
        })
    }

    /// Snapshots the partition and returns the manifest of the new session.
    pub async fn create_session(&self, key: &PartitionKey) -> Result<TransferManifest> {
        let replica = self.repository.replica(key).await?;
        let state = replica.state()?;
        if state != PartitionState::Ready {
            return Err(TesseraError::PartitionUnavailable {
                partition: key.clone(),
                state,
            });
        }

        let session_id = Ulid::new().to_string();
        let dir = self.work_dir.join(&session_id);
        let part_size = self.part_size;

        let export_dir = dir.clone();
        let exported = tokio::task::spawn_blocking(move || -> Result<_> {
            let snapshot = export_dir.join(SNAPSHOT_FILE_NAME);
            let offset = replica.export_snapshot(&snapshot)?;
            let files = split_into_parts(&snapshot, &export_dir, part_size)?;
            std::fs::remove_file(&snapshot)?;
            Ok((offset, files))
        })
        .await
        .map_err(|e| TesseraError::Internal(format!("snapshot export task failed: {}", e)))
        .and_then(|result| result);

        let (snapshot_offset, files) = match exported {
            Ok(exported) => exported,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    debug!("Cleanup of {:?} failed: {}", dir, cleanup);
                }
                return Err(e);
            }
        };

        let manifest = TransferManifest {
            session_id: session_id.clone(),
            partition: key.clone(),
            snapshot_offset,
            files,
        };
        info!(
            "Opened transfer session {} for {}: {} files, {} bytes, offset {:?}",
            session_id,
            key,
            manifest.files.len(),
            manifest.total_size(),
            snapshot_offset
        );

        self.sessions.lock().await.insert(
            session_id,
            SourceSession {
                dir,
                manifest: manifest.clone(),
                last_access: Instant::now(),
            },
        );
        Ok(manifest)
    }

    /// Bytes of one manifest file.
    pub async fn read_file(&self, session_id: &str, name: &str) -> Result<Bytes> {
        let path = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| TesseraError::NotFound(format!("session {}", session_id)))?;
            if !session.manifest.files.iter().any(|file| file.name == name) {
                return Err(TesseraError::NotFound(format!(
                    "file {} in session {}",
                    name, session_id
                )));
            }
            session.last_access = Instant::now();
            session.dir.join(name)
        };

        let data = tokio::fs::read(&path).await?;
        Ok(Bytes::from(data))
    }

    pub async fn manifest(&self, session_id: &str) -> Option<TransferManifest> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|session| session.manifest.clone())
    }

    /// Drops the session and its files. Returns whether it existed.
    pub async fn release_session(&self, session_id: &str) -> Result<bool> {
        let removed = self.sessions.lock().await.remove(session_id);
        match removed {
            Some(session) => {
                remove_session_dir(&session.dir).await;
                debug!("Released transfer session {}", session_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Releases sessions idle for longer than the TTL.
    pub async fn sweep_expired(&self) -> usize {
        sweep(&self.sessions, self.session_ttl).await
    }
}

async fn sweep(sessions: &Sessions, ttl: Duration) -> usize {
    let expired: Vec<(String, SourceSession)> = {
        let mut sessions = sessions.lock().await;
        let ids: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.last_access.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| sessions.remove(&id).map(|session| (id, session)))
            .collect()
    };

    for (id, session) in &expired {
        info!("Transfer session {} expired", id);
        remove_session_dir(&session.dir).await;
    }
    expired.len()
}

async fn remove_session_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!("Failed to remove session dir {:?}: {}", dir, e);
    }
}

fn split_into_parts(snapshot: &Path, dir: &Path, part_size: u64) -> Result<Vec<ManifestFile>> {
    let mut input = std::fs::File::open(snapshot)?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut files = Vec::new();

    loop {
        let mut read = read_chunk(&mut input, &mut buf, part_size)?;
        if read == 0 {
            break;
        }

        let name = part_name(files.len());
        let mut out = std::fs::File::create(dir.join(&name))?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        while read > 0 {
            out.write_all(&buf[..read])?;
            hasher.update(&buf[..read]);
            size += read as u64;
            read = read_chunk(&mut input, &mut buf, part_size - size)?;
        }
        out.sync_all()?;

        files.push(ManifestFile {
            name,
            size,
            sha256: hex::encode(hasher.finalize()),
        });
    }

    Ok(files)
}

/// Reads at most `remaining` bytes into `buf`; 0 means end of part or file.
fn read_chunk(input: &mut std::fs::File, buf: &mut [u8], remaining: u64) -> Result<usize> {
    let want = remaining.min(buf.len() as u64) as usize;
    loop {
        match input.read(&mut buf[..want]) {
            Ok(read) => return Ok(read),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl NodeService for SnapshotSource {
    fn name(&self) -> &str {
        "snapshot-source"
    }

    async fn start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let sessions = self.sessions.clone();
        let ttl = self.session_ttl;
        let interval = (ttl / 4).clamp(Duration::from_millis(10), Duration::from_secs(60));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&sessions, ttl).await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *self.sweeper.lock().await = Some((shutdown_tx, handle));
        info!("Snapshot source ready at {:?}", self.work_dir);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some((shutdown, handle)) = self.sweeper.lock().await.take() {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                warn!("Session sweeper ended abnormally: {}", e);
            }
        }

        let sessions: Vec<SourceSession> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in &sessions {
            remove_session_dir(&session.dir).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{ChangeRecord, Operation};
    use crate::storage::PartitionReplica;
    use tempfile::TempDir;

    async fn ready_partition(repository: &StoreRepository, rows: u64) -> Arc<PartitionReplica> {
        let key = PartitionKey::new("users", 1, 0);
        let engine = repository.open(&key.store_version).await.unwrap();
        let replica = engine.open_partition(0).unwrap();
        replica.transition(PartitionState::Ingesting).unwrap();

        let records: Vec<ChangeRecord> = (0..rows)
            .map(|offset| ChangeRecord {
                offset,
                key: Bytes::from(format!("key-{:04}", offset)),
                operation: Operation::Put(Bytes::from(vec![b'x'; 256])),
            })
            .collect();
        replica.apply_batch(&records).unwrap();
        replica.transition(PartitionState::Ready).unwrap();
        replica
    }

    fn source(dir: &TempDir, repository: Arc<StoreRepository>, ttl_secs: u64) -> SnapshotSource {
        let config = BlobTransferConfig {
            part_size_bytes: 4096,
            session_ttl_secs: ttl_secs,
            ..BlobTransferConfig::default()
        };
        SnapshotSource::new(repository, dir.path().join("sessions"), &config).unwrap()
    }

    #[tokio::test]
    async fn test_session_parts_match_manifest() {
        let dir = TempDir::new().unwrap();
        let repository = Arc::new(StoreRepository::new(dir.path().join("data")).unwrap());
        ready_partition(&repository, 200).await;
        let source = source(&dir, repository, 600);
        source.start().await.unwrap();

        let key = PartitionKey::new("users", 1, 0);
        let manifest = source.create_session(&key).await.unwrap();
        assert_eq!(manifest.snapshot_offset, Some(199));
        assert!(manifest.files.len() > 1);
        assert_eq!(manifest.files[1].name, "part.00000001");

        for file in &manifest.files {
            let data = source.read_file(&manifest.session_id, &file.name).await.unwrap();
            crate::transfer::verify_file(file, &data).unwrap();
        }
        assert!(
            source
                .read_file(&manifest.session_id, "../data")
                .await
                .unwrap_err()
                .is_not_found()
        );

        assert!(source.release_session(&manifest.session_id).await.unwrap());
        assert!(!source.release_session(&manifest.session_id).await.unwrap());
        assert!(!dir.path().join("sessions").join(&manifest.session_id).exists());
        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_only_ready_partitions_are_served() {
        let dir = TempDir::new().unwrap();
        let repository = Arc::new(StoreRepository::new(dir.path().join("data")).unwrap());
        let replica = ready_partition(&repository, 3).await;
        replica.fail("broken").unwrap();

        let source = source(&dir, repository, 600);
        let result = source.create_session(replica.key()).await;
        assert!(result.unwrap_err().is_unavailable());

        let missing = PartitionKey::new("users", 1, 5);
        assert!(source.create_session(&missing).await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let dir = TempDir::new().unwrap();
        let repository = Arc::new(StoreRepository::new(dir.path().join("data")).unwrap());
        ready_partition(&repository, 3).await;
        let source = source(&dir, repository, 0);
        source.start().await.unwrap();

        let key = PartitionKey::new("users", 1, 0);
        let manifest = source.create_session(&key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(source.session_count().await, 0);
        assert!(source.manifest(&manifest.session_id).await.is_none());
        source.stop().await.unwrap();
    }

    #[test]
    fn test_split_streams_fixed_size_parts() {
        let dir = TempDir::new().unwrap();
        let snapshot = dir.path().join("snapshot");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&snapshot, &data).unwrap();

        for (part_size, expected) in [
            (4096u64, vec![4096usize; 48].into_iter().chain([3392]).collect::<Vec<_>>()),
            (100_000, vec![100_000, 100_000]),
            (1 << 20, vec![200_000]),
        ] {
            let out = dir.path().join(format!("parts-{}", part_size));
            std::fs::create_dir_all(&out).unwrap();
            let files = split_into_parts(&snapshot, &out, part_size).unwrap();

            let sizes: Vec<usize> = files.iter().map(|file| file.size as usize).collect();
            assert_eq!(sizes, expected);

            let mut offset = 0;
            for file in &files {
                let chunk = &data[offset..offset + file.size as usize];
                assert_eq!(file.sha256, crate::transfer::compute_hash(chunk));
                assert_eq!(std::fs::read(out.join(&file.name)).unwrap(), chunk);
                offset += file.size as usize;
            }
        }
    }

    #[tokio::test]
    async fn test_start_keeps_sessions_opened_before_it() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("sessions").join("old-session");
        std::fs::create_dir_all(&stale).unwrap();

        let repository = Arc::new(StoreRepository::new(dir.path().join("data")).unwrap());
        ready_partition(&repository, 20).await;
        let source = source(&dir, repository, 600);
        assert!(!stale.exists());

        let key = PartitionKey::new("users", 1, 0);
        let manifest = source.create_session(&key).await.unwrap();
        source.start().await.unwrap();

        assert_eq!(source.session_count().await, 1);
        let data = source
            .read_file(&manifest.session_id, &manifest.files[0].name)
            .await
            .unwrap();
        crate::transfer::verify_file(&manifest.files[0], &data).unwrap();
        source.stop().await.unwrap();
    }
}
