//! Client Gateway
//!
//! The public HTTP/JSON API. Every node serves it; requests are handed to the
//! local [`QueryRouter`], which reaches whichever nodes hold the data.
//!
//! ## Core Concepts
//! - **Envelope**: every JSON response is an [`types::Envelope`] carrying either data or an
//!   error, plus the nodes that could not be reached.
//! - **Idempotent retry**: a client tags mutating requests with `x-client-id` and
//!   `x-request-seq`. The pair becomes the op id passed down to storage nodes, and the
//!   gateway remembers the response so a retried request gets the first answer back.
//!   A duplicate that arrives while the first is still running waits for it.

pub mod handlers;
pub mod types;

#[cfg(test)]
mod tests;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::error::{TagFsError, TagFsResult};
use crate::membership::service::MembershipService;
use crate::router::QueryRouter;
use crate::storage::ledger::{DEFAULT_MAX_ORIGINS, DEFAULT_WINDOW, OpLedger};
use crate::storage::node::StorageNode;
use crate::storage::protocol::OpId;
use types::{Envelope, HEADER_CLIENT_ID, HEADER_REQUEST_SEQ};

pub type Reply = (StatusCode, Json<Envelope>);

pub struct Gateway {
    router: Arc<QueryRouter>,
    membership: Arc<MembershipService>,
    storage: Arc<StorageNode>,
    responses: OpLedger<(StatusCode, Envelope)>,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        router: Arc<QueryRouter>,
        membership: Arc<MembershipService>,
        storage: Arc<StorageNode>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            membership,
            storage,
            responses: OpLedger::new(DEFAULT_WINDOW, DEFAULT_MAX_ORIGINS),
            next_seq: AtomicU64::new(1),
            shutdown,
        })
    }

    /// Token for one request; fires when the node shuts down.
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Runs a mutating request at most once per `(client, seq)`.
    ///
    /// Requests without client headers get a gateway-local op id and are not
    /// remembered. Server-side failures are not remembered either, so a
    /// retry after `Unreachable` really retries.
    pub async fn idempotent<F, Fut>(&self, headers: &HeaderMap, run: F) -> Reply
    where
        F: FnOnce(OpId) -> Fut,
        Fut: Future<Output = Reply>,
    {
        let op = match client_key(headers) {
            Ok(Some((client, seq))) => OpId::new(format!("client:{}", client), seq),
            Ok(None) => {
                let op = OpId::new(
                    format!("gateway:{}", self.membership.local_id),
                    self.next_seq.fetch_add(1, Ordering::Relaxed),
                );
                return run(op).await;
            }
            Err(e) => return reject(e),
        };

        let slot = match self.responses.slot(&op) {
            Ok(slot) => slot,
            Err(e) => return reject(e),
        };
        if let Some((status, envelope)) = slot.get() {
            tracing::debug!("Replaying response for {}", op);
            return (*status, Json(envelope.clone()));
        }

        let first = slot
            .get_or_try_init(|| async move {
                let (status, Json(envelope)) = run(op).await;
                if status.is_server_error() {
                    Err((status, envelope))
                } else {
                    Ok((status, envelope))
                }
            })
            .await;
        match first {
            Ok((status, envelope)) => (*status, Json(envelope.clone())),
            Err((status, envelope)) => (status, Json(envelope)),
        }
    }
}

fn client_key(headers: &HeaderMap) -> TagFsResult<Option<(String, u64)>> {
    let header = |name: &str| -> TagFsResult<Option<String>> {
        headers
            .get(name)
            .map(|v| {
                v.to_str()
                    .map(str::to_string)
                    .map_err(|_| TagFsError::InvalidQuery(format!("{} is not valid text", name)))
            })
            .transpose()
    };

    match (header(HEADER_CLIENT_ID)?, header(HEADER_REQUEST_SEQ)?) {
        (Some(client), Some(seq)) => {
            let seq = seq.trim().parse::<u64>().map_err(|_| {
                TagFsError::InvalidQuery(format!("{} must be an unsigned integer", HEADER_REQUEST_SEQ))
            })?;
            Ok(Some((client, seq)))
        }
        (None, None) => Ok(None),
        _ => Err(TagFsError::InvalidQuery(format!(
            "{} and {} must be sent together",
            HEADER_CLIENT_ID, HEADER_REQUEST_SEQ
        ))),
    }
}

/// Error response; logs what the operator should see.
pub fn reject(e: TagFsError) -> Reply {
    if e.status().is_server_error() {
        tracing::warn!("Request failed: {}", e);
    } else {
        tracing::debug!("Request rejected: {}", e);
    }
    (e.status(), Json(Envelope::error(&e)))
}

pub fn respond<T: serde::Serialize>(status: StatusCode, result: TagFsResult<T>) -> Reply {
    match result.and_then(|data| Envelope::data(&data)) {
        Ok(envelope) => (status, Json(envelope)),
        Err(e) => reject(e),
    }
}
