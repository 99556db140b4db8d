//! Reference-data retrieval: remote first, local file as fallback
//!
//! A source URL may be an HTTP resource or a plain filesystem path. The
//! remote attempt runs first; any failure (build, transport, non-200) falls
//! through to reading the URL as a local path.

use reqwest::Client;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::FetchError;

/// Client for retrieving reference-data documents.
pub struct Fetcher {
    client: Client,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// Fetch raw bytes from `source_url`, trying HTTP first and the local
    /// filesystem second. Both failing yields a uniform error.
    pub async fn fetch(
        &self,
        source_url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Vec<u8>, FetchError> {
        match self.download(source_url, headers).await {
            Ok(bytes) => {
                info!(source_url = %source_url, bytes = bytes.len(), "Downloaded reference data");
                Ok(bytes)
            }
            Err(e) => {
                warn!(source_url = %source_url, error = %e, "Download failed, trying local file");
                self.read_local(source_url).await
            }
        }
    }

    async fn download(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Vec<u8>, FetchError> {
        let mut request = self.client.get(url);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Download(format!(
                "request returned status {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Download(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn read_local(&self, source_url: &str) -> Result<Vec<u8>, FetchError> {
        let path = Path::new(source_url);
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                info!(path = %source_url, "Found reference data on local disk");
                Ok(bytes)
            }
            Err(e) => {
                warn!(path = %source_url, error = %e, "Reference data not readable from disk");
                Err(FetchError::Unavailable(source_url.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_remote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new();
        let bytes = fetcher
            .fetch(&format!("{}/orgs.json", server.uri()), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(bytes, br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_fetch_sends_auth_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geo.json"))
            .and(header("gis-api-password", "hunter2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HashMap::new();
        headers.insert("gis-api-password".to_string(), "hunter2".to_string());

        let fetcher = Fetcher::new();
        let bytes = fetcher
            .fetch(&format!("{}/geo.json", server.uri()), &headers)
            .await
            .unwrap();
        assert_eq!(bytes, b"[]");
    }

    #[tokio::test]
    async fn test_fetch_falls_back_to_local_file() {
        // a plain filesystem path is no downloadable URL; the fallback
        // reads it from disk
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "local-copy").unwrap();

        let fetcher = Fetcher::new();
        let bytes = fetcher
            .fetch(file.path().to_str().unwrap(), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(bytes, b"local-copy");
    }

    #[tokio::test]
    async fn test_fetch_unavailable_when_both_fail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new();
        let err = fetcher
            .fetch(&format!("{}/orgs.json", server.uri()), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unavailable(_)));
    }
}
