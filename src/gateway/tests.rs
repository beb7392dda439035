//! Gateway Module Tests
//!
//! ## Test Scopes
//! - **Client API**: every route of a single assembled node, driven through the axum router
//!   without a socket.
//! - **Envelope**: error kinds and HTTP statuses as clients see them.
//! - **Idempotency**: replayed `(x-client-id, x-request-seq)` pairs return the first answer.

#[cfg(test)]
mod tests {
    use crate::config::NodeConfig;
    use crate::gateway::types::{
        ClusterView, Envelope, HEADER_CLIENT_ID, HEADER_FILE_DIGEST, HEADER_FILE_VERSION,
        HEADER_REQUEST_SEQ, Health,
    };
    use crate::node::Node;
    use crate::storage::types::{FileSummary, MutationOutcome, digest_of};
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde::de::DeserializeOwned;
    use tempfile::TempDir;
    use tower::ServiceExt;

    // ============================================================
    // HELPERS
    // ============================================================

    async fn start_node() -> (Node, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.bind = "127.0.0.1:0".parse().unwrap();
        config.http = Some("127.0.0.1:0".parse().unwrap());
        config.data_dir = dir.path().to_path_buf();
        config.membership.heartbeat_interval_ms = 100;
        config.membership.dead_timeout_ms = 1_000;
        (Node::start(config).await.unwrap(), dir)
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Envelope) {
        let (status, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn data<T: DeserializeOwned>(envelope: &Envelope) -> T {
        serde_json::from_value(envelope.data.clone().expect("envelope without data")).unwrap()
    }

    fn put_request(tags: &str, payload: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/files?tags={}", tags))
            .body(Body::from(payload))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn put(app: &Router, tags: &str, payload: &'static [u8]) -> MutationOutcome {
        let (status, envelope) = call(app, put_request(tags, payload)).await;
        assert_eq!(status, StatusCode::CREATED, "{:?}", envelope.error);
        data(&envelope)
    }

    async fn query(app: &Router, q: &str) -> Vec<FileSummary> {
        let uri = format!("/query?q={}", q.replace(' ', "%20"));
        let (status, envelope) = call(app, get_request(&uri)).await;
        assert_eq!(status, StatusCode::OK, "{:?}", envelope.error);
        assert!(!envelope.partial);
        data(&envelope)
    }

    // ============================================================
    // FILES
    // ============================================================

    #[tokio::test]
    async fn test_put_then_get_returns_payload_and_headers() {
        let (node, _dir) = start_node().await;
        let app = node.app();

        let out = put(&app, "red,small", b"blob1").await;
        assert_eq!(out.version, 1);

        let (status, body) = send(&app, get_request(&format!("/files/{}", out.file_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"blob1");

        let resp = app
            .clone()
            .oneshot(get_request(&format!("/files/{}", out.file_id)))
            .await
            .unwrap();
        assert_eq!(resp.headers()[HEADER_FILE_VERSION], "1");
        assert_eq!(resp.headers()[HEADER_FILE_DIGEST], digest_of(b"blob1").as_str());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_finds_file_by_conjunction() {
        let (node, _dir) = start_node().await;
        let app = node.app();

        let f1 = put(&app, "red,small", b"blob1").await;
        put(&app, "red,big", b"blob2").await;

        let files = query(&app, "red AND small").await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_id, f1.file_id);
        assert_eq!(files[0].digest, digest_of(b"blob1"));

        assert_eq!(query(&app, "small OR big").await.len(), 2);
        assert!(query(&app, "red AND blue").await.is_empty());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_tag_add_remove_and_meta() {
        let (node, _dir) = start_node().await;
        let app = node.app();
        let f = put(&app, "red", b"x").await;

        let uri = format!("/files/{}/tags", f.file_id);
        let (status, envelope) = call(&app, json_request("POST", &uri, serde_json::json!({"tag": "Urgent"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(data::<MutationOutcome>(&envelope).version, 2);

        // Adding the same tag again changes nothing.
        let (_, envelope) = call(&app, json_request("POST", &uri, serde_json::json!({"tag": "urgent"}))).await;
        assert_eq!(data::<MutationOutcome>(&envelope).version, 2);
        assert_eq!(query(&app, "urgent").await.len(), 1);

        let del = Request::builder()
            .method("DELETE")
            .uri(format!("/files/{}/tags/red", f.file_id))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&app, del).await;
        assert_eq!(status, StatusCode::OK);
        assert!(query(&app, "red").await.is_empty());

        let (status, envelope) = call(&app, get_request(&format!("/files/{}/meta", f.file_id))).await;
        assert_eq!(status, StatusCode::OK);
        let meta: FileSummary = data(&envelope);
        assert_eq!(meta.version, 3);
        assert!(meta.tags.contains("urgent"));
        assert!(!meta.tags.contains("red"));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let (node, _dir) = start_node().await;
        let app = node.app();
        let f = put(&app, "tmp", b"x").await;

        let del = Request::builder()
            .method("DELETE")
            .uri(format!("/files/{}", f.file_id))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&app, del).await;
        assert_eq!(status, StatusCode::OK);

        let (status, envelope) = call(&app, get_request(&format!("/files/{}", f.file_id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!envelope.ok);
        assert!(query(&app, "tmp").await.is_empty());

        node.shutdown().await;
    }

    // ============================================================
    // ERRORS
    // ============================================================

    #[tokio::test]
    async fn test_bad_input_is_bad_request() {
        let (node, _dir) = start_node().await;
        let app = node.app();

        let (status, envelope) = call(&app, get_request("/query?q=red%20AND")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!envelope.ok);

        let (status, _) = call(&app, get_request("/files/not-a-uuid/meta")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, put_request("has%20space", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let half_idempotent = Request::builder()
            .method("POST")
            .uri("/files?tags=red")
            .header(HEADER_CLIENT_ID, "c1")
            .body(Body::from("x"))
            .unwrap();
        let (status, _) = call(&app, half_idempotent).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        node.shutdown().await;
    }

    // ============================================================
    // IDEMPOTENCY
    // ============================================================

    #[tokio::test]
    async fn test_retried_put_is_applied_once() {
        let (node, _dir) = start_node().await;
        let app = node.app();

        let request = || {
            Request::builder()
                .method("POST")
                .uri("/files?tags=once")
                .header(HEADER_CLIENT_ID, "client-1")
                .header(HEADER_REQUEST_SEQ, "42")
                .body(Body::from("payload"))
                .unwrap()
        };

        let (_, first) = call(&app, request()).await;
        let (status, second) = call(&app, request()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            data::<MutationOutcome>(&first).file_id,
            data::<MutationOutcome>(&second).file_id
        );
        assert_eq!(query(&app, "once").await.len(), 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_put_is_applied_once() {
        let (node, _dir) = start_node().await;
        let app = node.app();

        let request = || {
            Request::builder()
                .method("POST")
                .uri("/files?tags=twice")
                .header(HEADER_CLIENT_ID, "client-2")
                .header(HEADER_REQUEST_SEQ, "7")
                .body(Body::from("payload"))
                .unwrap()
        };

        let ((s1, first), (s2, second)) = tokio::join!(call(&app, request()), call(&app, request()));
        assert_eq!((s1, s2), (StatusCode::CREATED, StatusCode::CREATED));
        assert_eq!(
            data::<MutationOutcome>(&first).file_id,
            data::<MutationOutcome>(&second).file_id
        );
        assert_eq!(query(&app, "twice").await.len(), 1);

        node.shutdown().await;
    }

    // ============================================================
    // BULK & CLUSTER
    // ============================================================

    #[tokio::test]
    async fn test_bulk_retag_and_delete() {
        let (node, _dir) = start_node().await;
        let app = node.app();
        put(&app, "draft,a", b"1").await;
        put(&app, "draft,b", b"2").await;
        put(&app, "final", b"3").await;

        let (status, envelope) = call(
            &app,
            json_request(
                "POST",
                "/query/tags",
                serde_json::json!({"query": "draft", "add": ["review"], "remove": ["draft"]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(envelope.ok);
        assert!(query(&app, "draft").await.is_empty());
        assert_eq!(query(&app, "review").await.len(), 2);

        let (status, _) = call(
            &app,
            json_request("POST", "/query/delete", serde_json::json!({"query": "review OR final"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(query(&app, "review OR final").await.is_empty());
        assert_eq!(node.storage().file_count(), 0);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_cluster_and_health() {
        let (node, _dir) = start_node().await;
        let app = node.app();

        let (status, envelope) = call(&app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let health: Health = data(&envelope);
        assert_eq!(health.node, node.id);
        assert_eq!(health.alive_members, 1);

        let (_, envelope) = call(&app, get_request("/cluster")).await;
        let cluster: ClusterView = data(&envelope);
        assert_eq!(cluster.local_id, node.id);
        assert_eq!(cluster.members.len(), 1);

        node.shutdown().await;
    }
}
