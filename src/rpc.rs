//! Node-to-node RPC.
//!
//! [`NodeClient`] is the seam between the components that decide *where* a
//! request goes (router, gateway, bucket adoption) and the transport that
//! gets it there. [`HttpNodeClient`] speaks the `/internal` HTTP API with
//! bounded retries; [`ClusterClient`] short-circuits calls addressed to the
//! local node.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RouterConfig;
use crate::error::{ErrorBody, TagFsError, TagFsResult};
use crate::placement::shard_map::Candidate;
use crate::storage::node::StorageNode;
use crate::storage::protocol::{
    DeleteFileRequest, ENDPOINT_BUCKET, ENDPOINT_DELETE, ENDPOINT_FILES, ENDPOINT_QUERY,
    ENDPOINT_REPLICATE, ENDPOINT_TAGS, PutFileRequest, QueryLocalRequest, QueryLocalResponse,
    ReplicateRequest, ReplicateResponse, TagUpdateRequest,
};
use crate::storage::types::{BucketDump, FileContent, FileSummary, MutationOutcome};

/// Boxed future returned by [`NodeClient`] methods.
pub type RpcFuture<'a, T> = Pin<Box<dyn Future<Output = TagFsResult<T>> + Send + 'a>>;

pub trait NodeClient: Send + Sync + 'static {
    fn put<'a>(&'a self, target: &'a Candidate, req: PutFileRequest) -> RpcFuture<'a, MutationOutcome>;

    fn get<'a>(&'a self, target: &'a Candidate, file_id: &'a str) -> RpcFuture<'a, FileContent>;

    fn stat<'a>(&'a self, target: &'a Candidate, file_id: &'a str) -> RpcFuture<'a, FileSummary>;

    fn update_tags<'a>(
        &'a self,
        target: &'a Candidate,
        req: TagUpdateRequest,
    ) -> RpcFuture<'a, MutationOutcome>;

    fn delete<'a>(&'a self, target: &'a Candidate, req: DeleteFileRequest) -> RpcFuture<'a, MutationOutcome>;

    fn query<'a>(
        &'a self,
        target: &'a Candidate,
        req: QueryLocalRequest,
    ) -> RpcFuture<'a, QueryLocalResponse>;

    fn replicate<'a>(
        &'a self,
        target: &'a Candidate,
        req: ReplicateRequest,
    ) -> RpcFuture<'a, ReplicateResponse>;

    fn dump_bucket<'a>(&'a self, target: &'a Candidate, bucket: u32) -> RpcFuture<'a, BucketDump>;
}

// ============================================================
// HTTP transport
// ============================================================

pub struct HttpNodeClient {
    http: reqwest::Client,
    timeout: Duration,
    attempts: usize,
}

impl HttpNodeClient {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout: config.rpc_timeout(),
            attempts: config.rpc_attempts.max(1),
        }
    }

    /// Transport failures are retried with capped exponential backoff; any
    /// HTTP response, success or not, ends the loop.
    async fn post_with_retry<T: Serialize>(
        &self,
        target: &Candidate,
        path: &str,
        payload: &T,
    ) -> TagFsResult<reqwest::Response> {
        let url = format!("http://{}{}", target.http_addr, path);
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http
                .post(url.clone())
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(unreachable(target, e));
                    }
                    tracing::debug!("POST {} failed (attempt {}): {}", url, attempt + 1, e);
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(TagFsError::Unreachable {
            node: target.id.clone(),
            reason: "retry attempts exhausted".to_string(),
        })
    }

    async fn get_with_retry(&self, target: &Candidate, path: &str) -> TagFsResult<reqwest::Response> {
        let url = format!("http://{}{}", target.http_addr, path);
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http
                .get(url.clone())
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(unreachable(target, e));
                    }
                    tracing::debug!("GET {} failed (attempt {}): {}", url, attempt + 1, e);
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(TagFsError::Unreachable {
            node: target.id.clone(),
            reason: "retry attempts exhausted".to_string(),
        })
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        target: &Candidate,
        path: &str,
        payload: &Req,
    ) -> TagFsResult<Resp> {
        let resp = self.post_with_retry(target, path, payload).await?;
        decode(target, resp).await
    }

    async fn get_json<Resp: DeserializeOwned>(&self, target: &Candidate, path: &str) -> TagFsResult<Resp> {
        let resp = self.get_with_retry(target, path).await?;
        decode(target, resp).await
    }
}

fn unreachable(target: &Candidate, e: reqwest::Error) -> TagFsError {
    TagFsError::Unreachable {
        node: target.id.clone(),
        reason: e.to_string(),
    }
}

/// Successful bodies decode as `T`; error bodies carry an [`ErrorBody`].
async fn decode<T: DeserializeOwned>(target: &Candidate, resp: reqwest::Response) -> TagFsResult<T> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| TagFsError::Codec(e.to_string()));
    }

    match resp.json::<ErrorBody>().await {
        Ok(body) => Err(TagFsError::from_body(body)),
        Err(_) => Err(TagFsError::Unreachable {
            node: target.id.clone(),
            reason: format!("HTTP {}", status),
        }),
    }
}

impl NodeClient for HttpNodeClient {
    fn put<'a>(&'a self, target: &'a Candidate, req: PutFileRequest) -> RpcFuture<'a, MutationOutcome> {
        Box::pin(async move { self.post_json(target, ENDPOINT_FILES, &req).await })
    }

    fn get<'a>(&'a self, target: &'a Candidate, file_id: &'a str) -> RpcFuture<'a, FileContent> {
        Box::pin(async move {
            self.get_json(target, &format!("{}/{}", ENDPOINT_FILES, file_id))
                .await
        })
    }

    fn stat<'a>(&'a self, target: &'a Candidate, file_id: &'a str) -> RpcFuture<'a, FileSummary> {
        Box::pin(async move {
            self.get_json(target, &format!("{}/{}/meta", ENDPOINT_FILES, file_id))
                .await
        })
    }

    fn update_tags<'a>(
        &'a self,
        target: &'a Candidate,
        req: TagUpdateRequest,
    ) -> RpcFuture<'a, MutationOutcome> {
        Box::pin(async move { self.post_json(target, ENDPOINT_TAGS, &req).await })
    }

    fn delete<'a>(&'a self, target: &'a Candidate, req: DeleteFileRequest) -> RpcFuture<'a, MutationOutcome> {
        Box::pin(async move { self.post_json(target, ENDPOINT_DELETE, &req).await })
    }

    fn query<'a>(
        &'a self,
        target: &'a Candidate,
        req: QueryLocalRequest,
    ) -> RpcFuture<'a, QueryLocalResponse> {
        Box::pin(async move { self.post_json(target, ENDPOINT_QUERY, &req).await })
    }

    fn replicate<'a>(
        &'a self,
        target: &'a Candidate,
        req: ReplicateRequest,
    ) -> RpcFuture<'a, ReplicateResponse> {
        Box::pin(async move { self.post_json(target, ENDPOINT_REPLICATE, &req).await })
    }

    fn dump_bucket<'a>(&'a self, target: &'a Candidate, bucket: u32) -> RpcFuture<'a, BucketDump> {
        Box::pin(async move {
            self.get_json(target, &format!("{}/{}", ENDPOINT_BUCKET, bucket))
                .await
        })
    }
}

// ============================================================
// Local short-circuit
// ============================================================

/// Serves calls addressed to this node in-process and forwards the rest.
pub struct ClusterClient {
    local: Arc<StorageNode>,
    remote: Arc<dyn NodeClient>,
}

impl ClusterClient {
    pub fn new(local: Arc<StorageNode>, remote: Arc<dyn NodeClient>) -> Self {
        Self { local, remote }
    }

    fn is_local(&self, target: &Candidate) -> bool {
        &target.id == self.local.local_id()
    }
}

impl NodeClient for ClusterClient {
    fn put<'a>(&'a self, target: &'a Candidate, req: PutFileRequest) -> RpcFuture<'a, MutationOutcome> {
        if self.is_local(target) {
            return Box::pin(self.local.put(req));
        }
        self.remote.put(target, req)
    }

    fn get<'a>(&'a self, target: &'a Candidate, file_id: &'a str) -> RpcFuture<'a, FileContent> {
        if self.is_local(target) {
            return Box::pin(self.local.get(file_id));
        }
        self.remote.get(target, file_id)
    }

    fn stat<'a>(&'a self, target: &'a Candidate, file_id: &'a str) -> RpcFuture<'a, FileSummary> {
        if self.is_local(target) {
            return Box::pin(self.local.stat(file_id));
        }
        self.remote.stat(target, file_id)
    }

    fn update_tags<'a>(
        &'a self,
        target: &'a Candidate,
        req: TagUpdateRequest,
    ) -> RpcFuture<'a, MutationOutcome> {
        if self.is_local(target) {
            return Box::pin(self.local.update_tags(req));
        }
        self.remote.update_tags(target, req)
    }

    fn delete<'a>(&'a self, target: &'a Candidate, req: DeleteFileRequest) -> RpcFuture<'a, MutationOutcome> {
        if self.is_local(target) {
            return Box::pin(self.local.delete(req));
        }
        self.remote.delete(target, req)
    }

    fn query<'a>(
        &'a self,
        target: &'a Candidate,
        req: QueryLocalRequest,
    ) -> RpcFuture<'a, QueryLocalResponse> {
        if self.is_local(target) {
            return Box::pin(async move { self.local.query_local(&req) });
        }
        self.remote.query(target, req)
    }

    fn replicate<'a>(
        &'a self,
        target: &'a Candidate,
        req: ReplicateRequest,
    ) -> RpcFuture<'a, ReplicateResponse> {
        if self.is_local(target) {
            return Box::pin(async move {
                let applied = self.local.apply_replica(req).await?;
                Ok(ReplicateResponse { applied })
            });
        }
        self.remote.replicate(target, req)
    }

    fn dump_bucket<'a>(&'a self, target: &'a Candidate, bucket: u32) -> RpcFuture<'a, BucketDump> {
        if self.is_local(target) {
            return Box::pin(self.local.dump_bucket(bucket));
        }
        self.remote.dump_bucket(target, bucket)
    }
}
