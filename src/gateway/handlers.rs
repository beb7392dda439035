use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use std::sync::Arc;

use super::types::{
    AddTagRequest, ClusterView, DeleteMatchingRequest, Envelope, HEADER_FILE_DIGEST,
    HEADER_FILE_TAGS, HEADER_FILE_VERSION, Health, PutParams, QueryParams, RetagRequest,
};
use super::{Gateway, Reply, reject, respond};
use crate::router::TagExpr;
use crate::storage::types::{TagSet, normalize_tags};

/// The client API; the gateway is injected as an extension.
pub fn routes(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/files", post(handle_put))
        .route("/files/:id", get(handle_get).delete(handle_delete))
        .route("/files/:id/meta", get(handle_stat))
        .route("/files/:id/tags", post(handle_add_tag))
        .route("/files/:id/tags/:tag", delete(handle_remove_tag))
        .route("/query", get(handle_query))
        .route("/query/tags", post(handle_retag))
        .route("/query/delete", post(handle_delete_matching))
        .route("/cluster", get(handle_cluster))
        .route("/health", get(handle_health))
        .layer(Extension(gateway))
}

// --- Files ---

pub async fn handle_put(
    Extension(gw): Extension<Arc<Gateway>>,
    Query(params): Query<PutParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let tags = match parse_tag_list(&params.tags) {
        Ok(tags) => tags,
        Err(e) => return reject(e),
    };

    let router = gw.router.clone();
    gw.idempotent(&headers, |op| async move {
        let result = router.put(op, tags, body.to_vec()).await;
        if let Ok(outcome) = &result {
            tracing::info!("Stored file {} (version {})", outcome.file_id, outcome.version);
        }
        respond(StatusCode::CREATED, result)
    })
    .await
}

/// Raw bytes on success, an error envelope otherwise.
pub async fn handle_get(Extension(gw): Extension<Arc<Gateway>>, Path(file_id): Path<String>) -> Response {
    match gw.router.get(&file_id).await {
        Ok(content) => {
            let summary = &content.summary;
            let tags = summary.tags.iter().cloned().collect::<Vec<_>>().join(",");
            let headers = [
                ("content-type", "application/octet-stream".to_string()),
                (HEADER_FILE_VERSION, summary.version.to_string()),
                (HEADER_FILE_DIGEST, summary.digest.clone()),
                (HEADER_FILE_TAGS, tags),
            ];
            (StatusCode::OK, headers, content.payload).into_response()
        }
        Err(e) => reject(e).into_response(),
    }
}

pub async fn handle_stat(Extension(gw): Extension<Arc<Gateway>>, Path(file_id): Path<String>) -> Reply {
    respond(StatusCode::OK, gw.router.stat(&file_id).await)
}

pub async fn handle_add_tag(
    Extension(gw): Extension<Arc<Gateway>>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AddTagRequest>,
) -> Reply {
    let router = gw.router.clone();
    gw.idempotent(&headers, |op| async move {
        respond(StatusCode::OK, router.add_tag(op, &file_id, &req.tag).await)
    })
    .await
}

pub async fn handle_remove_tag(
    Extension(gw): Extension<Arc<Gateway>>,
    Path((file_id, tag)): Path<(String, String)>,
    headers: HeaderMap,
) -> Reply {
    let router = gw.router.clone();
    gw.idempotent(&headers, |op| async move {
        respond(StatusCode::OK, router.remove_tag(op, &file_id, &tag).await)
    })
    .await
}

pub async fn handle_delete(
    Extension(gw): Extension<Arc<Gateway>>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    let router = gw.router.clone();
    gw.idempotent(&headers, |op| async move {
        respond(StatusCode::OK, router.delete(op, &file_id).await)
    })
    .await
}

// --- Queries ---

pub async fn handle_query(Extension(gw): Extension<Arc<Gateway>>, Query(params): Query<QueryParams>) -> Reply {
    let expr = match TagExpr::parse(&params.q) {
        Ok(expr) => expr,
        Err(e) => return reject(e),
    };

    let cancel = gw.request_token();
    let outcome = match gw.router.query(&expr, &cancel).await {
        Ok(outcome) => outcome,
        Err(e) => return reject(e),
    };
    if outcome.partial {
        tracing::info!("Query '{}' answered without {:?}", expr, outcome.unreachable);
    }

    match Envelope::data(&outcome.files) {
        Ok(envelope) => (
            StatusCode::OK,
            Json(envelope.with_unreachable(outcome.partial, outcome.unreachable)),
        ),
        Err(e) => reject(e),
    }
}

pub async fn handle_retag(
    Extension(gw): Extension<Arc<Gateway>>,
    headers: HeaderMap,
    Json(req): Json<RetagRequest>,
) -> Reply {
    let expr = match TagExpr::parse(&req.query) {
        Ok(expr) => expr,
        Err(e) => return reject(e),
    };
    let (add, remove) = match (normalize_tags(&req.add), normalize_tags(&req.remove)) {
        (Ok(add), Ok(remove)) => (add, remove),
        (Err(e), _) | (_, Err(e)) => return reject(e),
    };

    let router = gw.router.clone();
    let cancel = gw.request_token();
    gw.idempotent(&headers, |op| async move {
        match router.retag(&op, &expr, add, remove, &cancel).await {
            Ok(outcome) => {
                let (partial, unreachable) = (outcome.partial, outcome.unreachable.clone());
                match Envelope::data(&outcome) {
                    Ok(envelope) => (StatusCode::OK, Json(envelope.with_unreachable(partial, unreachable))),
                    Err(e) => reject(e),
                }
            }
            Err(e) => reject(e),
        }
    })
    .await
}

pub async fn handle_delete_matching(
    Extension(gw): Extension<Arc<Gateway>>,
    headers: HeaderMap,
    Json(req): Json<DeleteMatchingRequest>,
) -> Reply {
    let expr = match TagExpr::parse(&req.query) {
        Ok(expr) => expr,
        Err(e) => return reject(e),
    };

    let router = gw.router.clone();
    let cancel = gw.request_token();
    gw.idempotent(&headers, |op| async move {
        match router.delete_matching(&op, &expr, &cancel).await {
            Ok(outcome) => {
                let (partial, unreachable) = (outcome.partial, outcome.unreachable.clone());
                match Envelope::data(&outcome) {
                    Ok(envelope) => (StatusCode::OK, Json(envelope.with_unreachable(partial, unreachable))),
                    Err(e) => reject(e),
                }
            }
            Err(e) => reject(e),
        }
    })
    .await
}

// --- Cluster ---

pub async fn handle_cluster(Extension(gw): Extension<Arc<Gateway>>) -> Reply {
    let view = gw.membership.get_view();
    let cluster = ClusterView {
        local_id: view.local_id.clone(),
        version: view.version,
        members: view.members.clone(),
    };
    respond(StatusCode::OK, Ok(cluster))
}

pub async fn handle_health(Extension(gw): Extension<Arc<Gateway>>) -> Reply {
    let health = Health {
        status: "ok".to_string(),
        node: gw.membership.local_id.clone(),
        alive_members: gw.membership.get_alive_members().len(),
        files: gw.storage.file_count(),
    };
    respond(StatusCode::OK, Ok(health))
}

fn parse_tag_list(raw: &str) -> crate::error::TagFsResult<TagSet> {
    normalize_tags(raw.split(',').map(str::trim).filter(|t| !t.is_empty()))
}
