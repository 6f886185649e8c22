//! Where the client fetches scrape configs from.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const USER_AGENT: &str = concat!("scrapegrid-sync/", env!("CARGO_PKG_VERSION"));

/// Returns the raw job-map body served by the allocator.
pub trait ScrapeConfigSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, SyncResult<String>>;
}

/// `GET <allocator>/scrape_configs` over plain HTTP.
pub struct HttpConfigSource {
    uri: http::Uri,
    timeout: Duration,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpConfigSource {
    pub fn new(allocator_url: &str, timeout: Duration) -> SyncResult<Self> {
        let invalid = |reason: String| SyncError::InvalidUrl {
            url: allocator_url.to_string(),
            reason,
        };
        let base = url::Url::parse(allocator_url).map_err(|e| invalid(e.to_string()))?;
        if base.scheme() != "http" {
            return Err(invalid(format!("unsupported scheme {:?}", base.scheme())));
        }
        let endpoint = format!("{}/scrape_configs", base.as_str().trim_end_matches('/'));
        let uri = endpoint
            .parse::<http::Uri>()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            uri,
            timeout,
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    pub fn uri(&self) -> &http::Uri {
        &self.uri
    }

    async fn get(&self) -> SyncResult<Bytes> {
        let req = http::Request::builder()
            .method("GET")
            .uri(self.uri.clone())
            .header("user-agent", USER_AGENT)
            .body(Empty::<Bytes>::new())
            .map_err(|e| SyncError::Fetch(e.to_string()))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SyncError::Status(resp.status()));
        }
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?
            .to_bytes();
        debug!(uri = %self.uri, bytes = body.len(), "fetched scrape configs");
        Ok(body)
    }
}

impl ScrapeConfigSource for HttpConfigSource {
    fn fetch(&self) -> BoxFuture<'_, SyncResult<String>> {
        Box::pin(async move {
            let body = tokio::time::timeout(self.timeout, self.get())
                .await
                .map_err(|_| SyncError::Timeout)??;
            String::from_utf8(body.to_vec()).map_err(|_| SyncError::NotUtf8)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_derived_from_base_url() {
        let source = HttpConfigSource::new("http://allocator:8080", Duration::from_secs(5)).unwrap();
        assert_eq!(source.uri().to_string(), "http://allocator:8080/scrape_configs");

        let source = HttpConfigSource::new("http://allocator:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(source.uri().to_string(), "http://allocator:8080/scrape_configs");
    }

    #[test]
    fn rejects_unusable_urls() {
        assert!(matches!(
            HttpConfigSource::new("not a url", Duration::from_secs(5)),
            Err(SyncError::InvalidUrl { .. })
        ));
        assert!(matches!(
            HttpConfigSource::new("https://allocator", Duration::from_secs(5)),
            Err(SyncError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_allocator_is_a_fetch_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let source = HttpConfigSource::new("http://127.0.0.1:9", Duration::from_secs(5)).unwrap();
        assert!(matches!(
            source.fetch().await,
            Err(SyncError::Fetch(_) | SyncError::Timeout)
        ));
    }
}
