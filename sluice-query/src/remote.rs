//! Instance-to-instance query calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::error::QueryError;
use crate::metadata::HostInfo;

/// Queries another instance's local state.
#[async_trait]
pub trait RemoteQuery: Send + Sync {
    /// `Ok(None)` when the owner has no value for `key`.
    async fn get(&self, host: &HostInfo, store: &str, key: &str) -> Result<Option<serde_json::Value>, QueryError>;

    /// Number of entries in the owner's local copy of `store`.
    async fn count_local(&self, host: &HostInfo, store: &str) -> Result<u64, QueryError>;
}

#[derive(Debug, Deserialize)]
struct ValueBody {
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CountBody {
    count: u64,
}

/// `RemoteQuery` over the HTTP surface served by [`crate::http::router`].
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
}

impl HttpRemote {
    pub fn new(timeout: Duration) -> Result<Self, QueryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueryError::Remote {
                host: "local".into(),
                reason: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { client })
    }

    fn url(host: &HostInfo, segments: &[&str]) -> Result<Url, QueryError> {
        let mut url = Url::parse(&format!("http://{host}/")).map_err(|e| QueryError::Remote {
            host: host.to_string(),
            reason: format!("bad endpoint: {e}"),
        })?;
        url.path_segments_mut()
            .map_err(|_| QueryError::Remote {
                host: host.to_string(),
                reason: "endpoint cannot carry a path".into(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch(&self, host: &HostInfo, url: Url) -> Result<Option<reqwest::Response>, QueryError> {
        debug!(%url, "remote query");
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                QueryError::Timeout(host.to_string())
            } else {
                QueryError::Remote {
                    host: host.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response)),
            s => Err(QueryError::Remote {
                host: host.to_string(),
                reason: format!("status {s}"),
            }),
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(host: &HostInfo, response: reqwest::Response) -> Result<T, QueryError> {
        response.json().await.map_err(|e| {
            if e.is_timeout() {
                QueryError::Timeout(host.to_string())
            } else {
                QueryError::MalformedResponse {
                    host: host.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }
}

#[async_trait]
impl RemoteQuery for HttpRemote {
    async fn get(&self, host: &HostInfo, store: &str, key: &str) -> Result<Option<serde_json::Value>, QueryError> {
        let url = Self::url(host, &["store", store, key])?;
        match self.fetch(host, url).await? {
            Some(response) => Ok(Some(Self::decode::<ValueBody>(host, response).await?.value)),
            None => Ok(None),
        }
    }

    async fn count_local(&self, host: &HostInfo, store: &str) -> Result<u64, QueryError> {
        let url = Self::url(host, &["store", store, "count", "local"])?;
        match self.fetch(host, url).await? {
            Some(response) => Ok(Self::decode::<CountBody>(host, response).await?.count),
            // a 404 here means the peer does not serve this store at all
            None => Err(QueryError::UnknownStore(store.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_percent_encoded_into_one_segment() {
        let url = HttpRemote::url(&HostInfo::new("10.0.0.7", 8080), &["store", "scores", "a/b c"]).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.7:8080/store/scores/a%2Fb%20c");
    }

    #[tokio::test]
    async fn refused_connection_is_a_remote_error() {
        // bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let remote = HttpRemote::new(Duration::from_millis(500)).unwrap();
        let err = remote
            .count_local(&HostInfo::new("127.0.0.1", port), "scores")
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Remote { .. } | QueryError::Timeout(_)));
    }
}
