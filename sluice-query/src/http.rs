//! The query HTTP surface.
//!
//! - `GET /store/{name}/{key}` -> `200 {"value": ...}` | `404`
//! - `GET /store/{name}/count` -> `200 {"count": n}` across the fleet
//! - `GET /store/{name}/count/local` -> `200 {"count": n}` this instance only
//! - `GET /store/{name}` -> every local entry as one JSON object
//! - `GET /metrics` -> prometheus text
//!
//! A key literally named `count` is shadowed by the count route.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{ErrorResponse, QueryError};
use crate::router::QueryRouter;

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

pub fn router(query: Arc<QueryRouter>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/store/{name}", get(all_local))
        .route("/store/{name}/count", get(count))
        .route("/store/{name}/count/local", get(count_local))
        .route("/store/{name}/{key}", get(lookup))
        .with_state(query)
}

/// Serves [`router`] on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, query: Arc<QueryRouter>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("serving queries on {}", addr);
    }
    axum::serve(listener, router(query)).await
}

async fn metrics() -> String {
    sluice_core::metrics::render_prometheus()
}

async fn lookup(
    State(query): State<Arc<QueryRouter>>,
    Path((name, key)): Path<(String, String)>,
) -> Result<Response, QueryError> {
    match query.lookup(&name, &key).await? {
        Some(value) => Ok(Json(serde_json::json!({ "value": value })).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("NOT_FOUND", "key not found")),
        )
            .into_response()),
    }
}

async fn count(
    State(query): State<Arc<QueryRouter>>,
    Path(name): Path<String>,
) -> Result<Json<CountResponse>, QueryError> {
    let count = query.count_across_fleet(&name).await?;
    Ok(Json(CountResponse { count }))
}

async fn count_local(
    State(query): State<Arc<QueryRouter>>,
    Path(name): Path<String>,
) -> Result<Json<CountResponse>, QueryError> {
    let count = query.count_local(&name).await?;
    Ok(Json(CountResponse { count }))
}

async fn all_local(
    State(query): State<Arc<QueryRouter>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Map<String, serde_json::Value>>, QueryError> {
    Ok(Json(query.all_local(&name).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ClusterMetadata, HostInfo, InstanceMetadata};
    use crate::remote::{HttpRemote, RemoteQuery};
    use axum::body::{self, Body};
    use axum::http::Request;
    use sluice_core::{KvState, PartitionAssigner};
    use sluice_state::InMemoryState;
    use std::time::Duration;
    use tower::util::ServiceExt;

    async fn seeded() -> Arc<InMemoryState> {
        let st = Arc::new(InMemoryState::new());
        st.put(b"p1", serde_json::to_vec(&serde_json::json!({"score": 90})).unwrap())
            .await
            .unwrap();
        st.put(b"p2", serde_json::to_vec(&serde_json::json!({"score": 70})).unwrap())
            .await
            .unwrap();
        st
    }

    fn single(store: Arc<InMemoryState>) -> Arc<QueryRouter> {
        let meta = Arc::new(ClusterMetadata::single(
            HostInfo::new("127.0.0.1", 0),
            PartitionAssigner::new(4),
        ));
        let remote = Arc::new(HttpRemote::new(Duration::from_secs(1)).unwrap());
        Arc::new(QueryRouter::new(meta, remote).store("high-scores", store))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let res = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = body::to_bytes(res.into_body(), 1_048_576).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn point_lookup_and_not_found() {
        let app = router(single(seeded().await));
        let (status, body) = get_json(app.clone(), "/store/high-scores/p1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"]["score"], 90);

        let (status, body) = get_json(app, "/store/high-scores/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn counts_and_scan() {
        let app = router(single(seeded().await));
        let (_, body) = get_json(app.clone(), "/store/high-scores/count").await;
        assert_eq!(body["count"], 2);
        let (_, body) = get_json(app.clone(), "/store/high-scores/count/local").await;
        assert_eq!(body["count"], 2);
        let (status, body) = get_json(app, "/store/high-scores").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["p2"]["score"], 70);
    }

    #[tokio::test]
    async fn unknown_store_is_404() {
        let app = router(single(seeded().await));
        let (status, body) = get_json(app, "/store/missing/count").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_STORE");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_text() {
        let app = router(single(seeded().await));
        sluice_core::metrics::OP_THROUGHPUT.with_label_values(&["Test", "emit"]).inc();
        let res = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(res.status().is_success());
        let body = body::to_bytes(res.into_body(), 1_048_576).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("sluice_operator_records_total"));
    }

    /// Two live instances on ephemeral ports plus one that is down, talking through `HttpRemote`.
    #[tokio::test]
    async fn lookup_and_count_span_live_instances() {
        let a_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = HostInfo::new("127.0.0.1", a_listener.local_addr().unwrap().port());
        let b = HostInfo::new("127.0.0.1", b_listener.local_addr().unwrap().port());
        let dead = HostInfo::new("127.0.0.1", dead_listener.local_addr().unwrap().port());
        drop(dead_listener);

        let assigner = PartitionAssigner::new(3);
        let key_on = |p: u32| {
            (0..)
                .map(|i| format!("player-{i}"))
                .find(|k| assigner.assign(k.as_bytes()) == p)
                .unwrap()
        };
        let roster = vec![
            InstanceMetadata::new(a.clone(), [0]),
            InstanceMetadata::new(b.clone(), [1]),
            InstanceMetadata::new(dead, [2]),
        ];

        let a_store = Arc::new(InMemoryState::new());
        a_store.put(b"local-only", b"1".to_vec()).await.unwrap();
        let b_store = Arc::new(InMemoryState::new());
        b_store
            .put(key_on(1).as_bytes(), serde_json::to_vec(&serde_json::json!({"name": "bob"})).unwrap())
            .await
            .unwrap();

        let remote: Arc<dyn RemoteQuery> = Arc::new(HttpRemote::new(Duration::from_secs(2)).unwrap());
        let router_a = Arc::new(
            QueryRouter::new(Arc::new(ClusterMetadata::new(a, assigner, roster.clone())), remote.clone())
                .store("players", a_store),
        );
        let router_b = Arc::new(
            QueryRouter::new(Arc::new(ClusterMetadata::new(b, assigner, roster)), remote).store("players", b_store),
        );
        let sa = tokio::spawn(serve(a_listener, router_a.clone()));
        let sb = tokio::spawn(serve(b_listener, router_b));

        let found = router_a.lookup("players", &key_on(1)).await.unwrap();
        assert_eq!(found, Some(serde_json::json!({"name": "bob"})));
        let ghost = (0..)
            .map(|i| format!("ghost-{i}"))
            .find(|k| assigner.assign(k.as_bytes()) == 1)
            .unwrap();
        // the owner's 404 comes back as an absent value
        assert_eq!(router_a.lookup("players", &ghost).await.unwrap(), None);
        // the dead instance contributes nothing to the count and fails point queries
        assert_eq!(router_a.count_across_fleet("players").await.unwrap(), 2);
        assert!(router_a.lookup("players", &key_on(2)).await.is_err());

        // through a's HTTP surface the same failure is a 5xx, not a crash
        let (status, _) = get_json(router(router_a.clone()), &format!("/store/players/{}", key_on(2))).await;
        assert!(status.is_server_error());
        sa.abort();
        sb.abort();
    }
}
