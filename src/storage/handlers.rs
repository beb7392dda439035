use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::node::StorageNode;
use super::protocol::{
    DeleteFileRequest, ENDPOINT_BUCKET, ENDPOINT_DELETE, ENDPOINT_FILES, ENDPOINT_QUERY,
    ENDPOINT_REPLICATE, ENDPOINT_TAGS, PutFileRequest, QueryLocalRequest, QueryLocalResponse,
    ReplicateRequest, ReplicateResponse, TagUpdateRequest,
};
use super::types::{BucketDump, FileContent, FileSummary, MutationOutcome};
use crate::error::{ErrorBody, TagFsError};

type Reply<T> = Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

/// Node-to-node routes; the storage node is injected as an extension.
pub fn internal_routes(node: Arc<StorageNode>) -> Router {
    Router::new()
        .route(ENDPOINT_FILES, post(handle_put))
        .route(&format!("{}/:id", ENDPOINT_FILES), get(handle_get))
        .route(&format!("{}/:id/meta", ENDPOINT_FILES), get(handle_stat))
        .route(ENDPOINT_TAGS, post(handle_update_tags))
        .route(ENDPOINT_DELETE, post(handle_delete))
        .route(ENDPOINT_QUERY, post(handle_query))
        .route(ENDPOINT_REPLICATE, post(handle_replicate))
        .route(&format!("{}/:bucket", ENDPOINT_BUCKET), get(handle_bucket_dump))
        .layer(Extension(node))
}

fn reject(e: TagFsError) -> (StatusCode, Json<ErrorBody>) {
    if e.kind().is_internal() {
        tracing::error!("Internal request failed: {}", e);
    } else {
        tracing::debug!("Internal request rejected: {}", e);
    }
    (e.status(), Json(ErrorBody::from(&e)))
}

pub async fn handle_put(
    Extension(node): Extension<Arc<StorageNode>>,
    Json(req): Json<PutFileRequest>,
) -> Reply<MutationOutcome> {
    node.put(req).await.map(Json).map_err(reject)
}

pub async fn handle_get(
    Extension(node): Extension<Arc<StorageNode>>,
    Path(file_id): Path<String>,
) -> Reply<FileContent> {
    node.get(&file_id).await.map(Json).map_err(reject)
}

pub async fn handle_stat(
    Extension(node): Extension<Arc<StorageNode>>,
    Path(file_id): Path<String>,
) -> Reply<FileSummary> {
    node.stat(&file_id).await.map(Json).map_err(reject)
}

pub async fn handle_update_tags(
    Extension(node): Extension<Arc<StorageNode>>,
    Json(req): Json<TagUpdateRequest>,
) -> Reply<MutationOutcome> {
    node.update_tags(req).await.map(Json).map_err(reject)
}

pub async fn handle_delete(
    Extension(node): Extension<Arc<StorageNode>>,
    Json(req): Json<DeleteFileRequest>,
) -> Reply<MutationOutcome> {
    node.delete(req).await.map(Json).map_err(reject)
}

pub async fn handle_query(
    Extension(node): Extension<Arc<StorageNode>>,
    Json(req): Json<QueryLocalRequest>,
) -> Reply<QueryLocalResponse> {
    node.query_local(&req).map(Json).map_err(reject)
}

pub async fn handle_replicate(
    Extension(node): Extension<Arc<StorageNode>>,
    Json(req): Json<ReplicateRequest>,
) -> Reply<ReplicateResponse> {
    node.apply_replica(req)
        .await
        .map(|applied| Json(ReplicateResponse { applied }))
        .map_err(reject)
}

pub async fn handle_bucket_dump(
    Extension(node): Extension<Arc<StorageNode>>,
    Path(bucket): Path<u32>,
) -> Reply<BucketDump> {
    node.dump_bucket(bucket).await.map(Json).map_err(reject)
}
