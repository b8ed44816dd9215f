use super::ServerState;
use super::types::{
    ApiError, ApiResponse, AppendRecordRequest, AppendRecordResponse, HealthResponse,
    PartitionView,
};
use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use std::sync::Arc;
use tessera_core::{BlobDiscoveryResponse, PartitionKey, PartitionState, encode_delete, encode_put};

type ApiResult<T> = std::result::Result<T, ApiError>;

pub async fn health(State(state): State<Arc<ServerState>>) -> ApiResult<Json<HealthResponse>> {
    let replicas = state.repository.replicas().await;
    let mut ready = 0;
    for replica in &replicas {
        if replica.state()? == PartitionState::Ready {
            ready += 1;
        }
    }

    Ok(Json(HealthResponse {
        node_id: state.node_id.clone(),
        advertise_url: state.advertise_url.clone(),
        status: "ok".to_string(),
        partitions: replicas.len(),
        ready_partitions: ready,
        checked_at: chrono::Utc::now(),
    }))
}

/// Lists this node when its copy of the partition is READY.
pub async fn blob_discovery(
    State(state): State<Arc<ServerState>>,
    Path((store, version, partition)): Path<(String, u32, u32)>,
) -> Json<BlobDiscoveryResponse> {
    let key = PartitionKey::new(store, version, partition);
    let response = match state.repository.replica(&key).await {
        Ok(replica) => match replica.state() {
            Ok(PartitionState::Ready) => BlobDiscoveryResponse {
                is_error: false,
                available_nodes: vec![state.advertise_url.clone()],
                message: None,
            },
            Ok(_) => BlobDiscoveryResponse::default(),
            Err(e) => BlobDiscoveryResponse {
                is_error: true,
                available_nodes: Vec::new(),
                message: Some(e.to_string()),
            },
        },
        Err(_) => BlobDiscoveryResponse::default(),
    };
    Json(response)
}

pub async fn create_transfer_session(
    State(state): State<Arc<ServerState>>,
    Path((store, version, partition)): Path<(String, u32, u32)>,
) -> ApiResult<impl IntoResponse> {
    let key = PartitionKey::new(store, version, partition);
    let manifest = state.source.create_session(&key).await?;
    Ok((StatusCode::CREATED, Json(manifest)))
}

pub async fn fetch_transfer_file(
    State(state): State<Arc<ServerState>>,
    Path((session_id, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let data = state.source.read_file(&session_id, &name).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    ))
}

pub async fn release_transfer_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.source.release_session(&session_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

pub async fn get_value(
    State(state): State<Arc<ServerState>>,
    Path((store, version, partition, key)): Path<(String, u32, u32, String)>,
) -> ApiResult<impl IntoResponse> {
    let partition = PartitionKey::new(store, version, partition);
    let value = state.repository.get(&partition, key.as_bytes()).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        value,
    ))
}

pub async fn list_partitions(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<ApiResponse<Vec<PartitionView>>>> {
    let mut views = Vec::new();
    for replica in state.repository.replicas().await {
        let key = replica.key().clone();
        views.push(PartitionView {
            status: replica.status()?,
            consuming: state.ingestion.is_consuming(&key).await,
            progress: state.ingestion.progress(&key).await,
            partition: key,
        });
    }
    Ok(Json(ApiResponse::ok(views)))
}

/// Operator recovery of an ERROR partition.
pub async fn restart_partition(
    State(state): State<Arc<ServerState>>,
    Path((store, version, partition)): Path<(String, u32, u32)>,
) -> ApiResult<StatusCode> {
    let key = PartitionKey::new(store, version, partition);
    state.ingestion.restart_consumption(&key).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Appends one record to the in-process change-log.
pub async fn append_record(
    State(state): State<Arc<ServerState>>,
    Path((store, version, partition)): Path<(String, u32, u32)>,
    Json(request): Json<AppendRecordRequest>,
) -> ApiResult<(StatusCode, Json<AppendRecordResponse>)> {
    let key = PartitionKey::new(store, version, partition);
    let payload = match &request.value {
        Some(value) => encode_put(request.key.as_bytes(), value.as_bytes()),
        None => encode_delete(request.key.as_bytes()),
    };

    let topic = key.store_version.topic_name();
    let offset = state.changelog.append(&topic, partition, payload)?;
    Ok((
        StatusCode::CREATED,
        Json(AppendRecordResponse {
            topic,
            partition,
            offset,
        }),
    ))
}
