mod handlers;
pub mod types;

use crate::config::{ChangeLogBackend, Config};
use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tessera_core::{
    BlobTransferManager, HttpBlobTransferClient, HttpPeerDiscovery, InMemoryChangeLog,
    IngestionService, NodeService, Result, ServiceOrchestrator, SnapshotSource,
    StaticClusterMetadata, StorageService, StoreRepository, TesseraError,
};
use tower_http::trace::TraceLayer;

/// Directory under the data dir holding outgoing transfer sessions.
const TRANSFER_DIR: &str = "_transfer";

pub struct ServerState {
    pub node_id: String,
    pub advertise_url: String,
    pub repository: Arc<StoreRepository>,
    pub ingestion: Arc<IngestionService>,
    pub source: Arc<SnapshotSource>,
    pub changelog: Arc<InMemoryChangeLog>,
}

/// A wired but not yet started node.
pub struct Node {
    pub state: Arc<ServerState>,
    pub orchestrator: ServiceOrchestrator,
}

pub fn build_node(config: &Config) -> Result<Node> {
    let advertise_url = config.effective_advertise_url();
    let repository = Arc::new(StoreRepository::new(config.storage.data_dir.clone())?);
    let metadata = Arc::new(StaticClusterMetadata::new(
        config.cluster.live_nodes.clone(),
        config.cluster.stores.clone(),
    ));

    let changelog = match config.changelog.backend {
        ChangeLogBackend::Memory => Arc::new(InMemoryChangeLog::new()),
    };

    let mut storage = StorageService::new(
        config.node_id.clone(),
        repository.clone(),
        metadata,
        config.cluster.assignment_strategy,
    );
    if config.blob_transfer.enabled {
        let timeout = config.blob_transfer.request_timeout();
        let discovery = HttpPeerDiscovery::new(config.peer_urls(), timeout)?;
        let client = HttpBlobTransferClient::new(timeout)?;
        let manager = BlobTransferManager::new(
            Arc::new(discovery),
            Arc::new(client),
            config.blob_transfer.clone(),
        )
        .with_self_url(advertise_url.clone());
        storage = storage.with_blob_transfer(Arc::new(manager));
    }

    let ingestion = Arc::new(IngestionService::new(
        repository.clone(),
        changelog.clone(),
        config.ingestion.clone(),
    ));
    let source = Arc::new(SnapshotSource::new(
        repository.clone(),
        config.storage.data_dir.join(TRANSFER_DIR),
        &config.blob_transfer,
    )?);

    let services: Vec<Arc<dyn NodeService>> =
        vec![Arc::new(storage), ingestion.clone(), source.clone()];
    let orchestrator = ServiceOrchestrator::new(services);

    let state = Arc::new(ServerState {
        node_id: config.node_id.clone(),
        advertise_url,
        repository,
        ingestion,
        source,
        changelog,
    });

    Ok(Node {
        state,
        orchestrator,
    })
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/blob_discovery/:store/:version/:partition",
            get(handlers::blob_discovery),
        )
        .route(
            "/internal/v1/transfer/:store/:version/:partition/sessions",
            post(handlers::create_transfer_session),
        )
        .route(
            "/internal/v1/transfer/sessions/:session_id",
            delete(handlers::release_transfer_session),
        )
        .route(
            "/internal/v1/transfer/sessions/:session_id/files/:name",
            get(handlers::fetch_transfer_file),
        )
        .route(
            "/storage/:store/:version/:partition/:key",
            get(handlers::get_value),
        )
        .route("/partitions", get(handlers::list_partitions))
        .route(
            "/partitions/:store/:version/:partition/restart",
            post(handlers::restart_partition),
        )
        .route(
            "/changelog/:store/:version/:partition",
            post(handlers::append_record),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let node = build_node(&config)?;
    let app = build_router(node.state.clone());

    // Bind before starting services so peers can reach the discovery endpoint.
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(
        "Server listening on {} (advertised as {})",
        config.bind_addr,
        node.state.advertise_url
    );

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    let started = node.orchestrator.start().await;
    if let Err(e) = &started {
        tracing::error!("Node {} failed to start: {}", config.node_id, e);
        server.abort();
    }

    let served = match started {
        Ok(()) => server
            .await
            .map_err(|e| TesseraError::Internal(e.to_string()))
            .and_then(|result| result.map_err(TesseraError::from)),
        Err(e) => Err(e),
    };

    node.orchestrator.stop().await?;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChangeLogConfig, ClusterConfig};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tempfile::TempDir;
    use tessera_core::{
        BlobDiscoveryResponse, LiveNode, PartitionKey, PartitionState, StoreDefinition,
        TransferManifest, VersionDefinition, VersionStatus,
    };
    use tower::ServiceExt;

    fn config(dir: &TempDir) -> Config {
        Config {
            node_id: "node-a".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            advertise_url: Some("http://node-a:7070".to_string()),
            storage: tessera_core::StorageConfig {
                data_dir: dir.path().to_path_buf(),
            },
            cluster: ClusterConfig {
                assignment_strategy: Default::default(),
                live_nodes: vec![LiveNode {
                    node_id: "node-a".to_string(),
                    url: "http://node-a:7070".to_string(),
                }],
                stores: vec![StoreDefinition {
                    name: "users".to_string(),
                    replication_factor: 1,
                    partition_count: 2,
                    versions: vec![VersionDefinition {
                        version: 1,
                        status: VersionStatus::Online,
                    }],
                }],
            },
            ingestion: Default::default(),
            blob_transfer: Default::default(),
            changelog: ChangeLogConfig::default(),
        }
    }

    async fn started(dir: &TempDir) -> Node {
        let node = build_node(&config(dir)).unwrap();
        node.orchestrator.start().await.unwrap();
        node
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_append_then_read() {
        let dir = TempDir::new().unwrap();
        let node = started(&dir).await;
        let app = build_router(node.state.clone());

        let (status, _) = send(
            &app,
            "POST",
            "/changelog/users/1/0",
            Body::from(r#"{"key":"alice","value":"1"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let key = PartitionKey::new("users", 1, 0);
        node.state
            .ingestion
            .wait_for_offset(&key, 0, Duration::from_secs(5))
            .await
            .unwrap();

        let (status, body) = send(&app, "GET", "/storage/users/1/0/alice", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"1");

        let (status, _) = send(&app, "GET", "/storage/users/1/0/bob", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/storage/users/1/7/alice", Body::empty()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        node.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_partition_rejects_reads() {
        let dir = TempDir::new().unwrap();
        let node = started(&dir).await;
        let app = build_router(node.state.clone());

        let key = PartitionKey::new("users", 1, 1);
        let replica = node.state.repository.replica(&key).await.unwrap();
        node.state.ingestion.stop_consumption(&key).await.unwrap();
        replica.transition(PartitionState::Ingesting).unwrap();
        replica.fail("disk gone").unwrap();

        let (status, body) = send(&app, "GET", "/storage/users/1/1/alice", Body::empty()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(String::from_utf8(body).unwrap().contains("ERROR"));

        let (status, _) = send(&app, "POST", "/partitions/users/1/1/restart", Body::empty()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(replica.state().unwrap().is_consuming());

        let (status, _) = send(&app, "POST", "/partitions/users/1/1/restart", Body::empty()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        node.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_and_transfer_session() {
        let dir = TempDir::new().unwrap();
        let node = started(&dir).await;
        let app = build_router(node.state.clone());
        let key = PartitionKey::new("users", 1, 0);
        let replica = node.state.repository.replica(&key).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while replica.state().unwrap() != PartitionState::Ready {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (status, body) = send(&app, "GET", "/blob_discovery/users/1/0", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let discovery: BlobDiscoveryResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(discovery.available_nodes, vec!["http://node-a:7070"]);

        let (_, body) = send(&app, "GET", "/blob_discovery/users/1/9", Body::empty()).await;
        let discovery: BlobDiscoveryResponse = serde_json::from_slice(&body).unwrap();
        assert!(!discovery.is_error);
        assert!(discovery.available_nodes.is_empty());

        let (status, body) = send(
            &app,
            "POST",
            "/internal/v1/transfer/users/1/0/sessions",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let manifest: TransferManifest = serde_json::from_slice(&body).unwrap();
        assert_eq!(manifest.partition, key);
        assert!(!manifest.files.is_empty());

        let uri = format!(
            "/internal/v1/transfer/sessions/{}/files/{}",
            manifest.session_id, manifest.files[0].name
        );
        let (status, body) = send(&app, "GET", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        tessera_core::transfer::verify_file(&manifest.files[0], &body).unwrap();

        let uri = format!("/internal/v1/transfer/sessions/{}", manifest.session_id);
        let (status, _) = send(&app, "DELETE", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, "GET", "/partitions", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let listing: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(listing["data"].as_array().unwrap().len(), 2);

        node.orchestrator.stop().await.unwrap();
    }
}
