use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Failures of an interactive query.
///
/// An absent key is not an error; lookups return `Ok(None)` for it.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("unknown store: {0}")]
    UnknownStore(String),
    #[error("no instance owns partition {0}")]
    NoOwner(u32),
    #[error("remote instance {host} failed: {reason}")]
    Remote { host: String, reason: String },
    #[error("remote instance {0} timed out")]
    Timeout(String),
    #[error("malformed response from {host}: {reason}")]
    MalformedResponse { host: String, reason: String },
    #[error(transparent)]
    Store(#[from] sluice_core::Error),
}

impl QueryError {
    /// Short label used for the remote failure counter.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::UnknownStore(_) => "unknown_store",
            QueryError::NoOwner(_) => "no_owner",
            QueryError::Remote { .. } => "remote",
            QueryError::Timeout(_) => "timeout",
            QueryError::MalformedResponse { .. } => "malformed",
            QueryError::Store(_) => "store",
        }
    }
}

/// JSON body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            QueryError::UnknownStore(name) => {
                let body = Json(ErrorResponse::new("UNKNOWN_STORE", format!("unknown store: {name}")));
                return (StatusCode::NOT_FOUND, body).into_response();
            }
            QueryError::NoOwner(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NO_OWNER",
                "Key owner is not known yet",
            ),
            QueryError::Remote { .. } | QueryError::MalformedResponse { .. } => {
                tracing::warn!(error = %self, "remote query failed");
                (StatusCode::BAD_GATEWAY, "REMOTE_FAILURE", "Owning instance could not answer")
            }
            QueryError::Timeout(_) => {
                tracing::warn!(error = %self, "remote query timed out");
                (StatusCode::GATEWAY_TIMEOUT, "REMOTE_TIMEOUT", "Owning instance timed out")
            }
            QueryError::Store(e) => {
                tracing::error!("store error while serving query: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Internal server error")
            }
        };
        (status, Json(ErrorResponse::new(code, message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body;

    async fn body_of(res: Response) -> ErrorResponse {
        let bytes = body::to_bytes(res.into_body(), 65_536).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn remote_failures_are_server_errors() {
        let res = QueryError::Remote {
            host: "10.0.0.2:8080".into(),
            reason: "connection refused".into(),
        }
        .into_response();
        assert!(res.status().is_server_error());
        let body = body_of(res).await;
        assert_eq!(body.code, "REMOTE_FAILURE");
        assert!(!body.error.contains("refused"));

        let res = QueryError::Timeout("10.0.0.2:8080".into()).into_response();
        assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn store_errors_do_not_leak() {
        let res = QueryError::Store(sluice_core::Error::Store("disk on fire at /var/lib/x".into())).into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(res).await;
        assert_eq!(body.error, "Internal server error");
    }

    #[tokio::test]
    async fn unknown_store_is_not_found() {
        let res = QueryError::UnknownStore("nope".into()).into_response();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_of(res).await.code, "UNKNOWN_STORE");
    }
}
