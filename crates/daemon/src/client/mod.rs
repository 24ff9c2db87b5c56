//! HTTPS client for the secret server.
//!
//! Authentication is mutual TLS. The inner `reqwest` client is rebuilt on an
//! interval and swapped atomically so rotated certificates are picked up
//! without a remount. Plain `http` URLs skip the TLS identity entirely,
//! which is what the integration tests use.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use common::backend::{BackendError, SecretBackend};
use common::secret::Secret;

/// How often the inner HTTP client is rebuilt from the credential files.
const CLIENT_REFRESH: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server url cannot be used as a base: {0}")]
    BadUrl(Url),
    #[error("failed to read {}: {source}", path.display())]
    Credentials {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
}

/// PEM files the TLS identity is built from.
#[derive(Debug, Clone)]
struct TlsParams {
    cert_file: PathBuf,
    key_file: PathBuf,
    ca_file: PathBuf,
}

#[derive(Debug)]
pub struct SecretClient {
    url: Url,
    http: RwLock<reqwest::Client>,
    tls: Option<TlsParams>,
    timeout: Duration,
}

impl SecretClient {
    /// A client with mutual TLS from PEM-encoded certificate, key, and CA
    /// bundle files. The certificate and key may live in the same file.
    pub fn new(
        url: Url,
        cert_file: &Path,
        key_file: &Path,
        ca_file: &Path,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let tls = TlsParams {
            cert_file: cert_file.to_path_buf(),
            key_file: key_file.to_path_buf(),
            ca_file: ca_file.to_path_buf(),
        };
        Self::build(url, Some(tls), timeout)
    }

    /// A client without a TLS identity, for plain-http servers.
    pub fn new_plain(url: Url, timeout: Duration) -> Result<Self, ClientError> {
        Self::build(url, None, timeout)
    }

    fn build(url: Url, tls: Option<TlsParams>, timeout: Duration) -> Result<Self, ClientError> {
        if url.cannot_be_a_base() {
            return Err(ClientError::BadUrl(url));
        }
        let http = build_http_client(tls.as_ref(), timeout)?;
        Ok(Self {
            url,
            http: RwLock::new(http),
            tls,
            timeout,
        })
    }

    /// Rebuilds the inner client on an interval, picking up rotated
    /// credential files. Failures keep the previous client and retry on the
    /// next tick.
    pub fn spawn_refresh(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLIENT_REFRESH);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                match build_http_client(client.tls.as_ref(), client.timeout) {
                    Ok(http) => {
                        tracing::info!("refreshed http client");
                        *client
                            .http
                            .write()
                            .unwrap_or_else(PoisonError::into_inner) = http;
                    }
                    Err(err) => tracing::error!(error = %err, "error refreshing http client"),
                }
            }
        })
    }

    fn http(&self) -> reqwest::Client {
        self.http
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.url.clone();
        // new() rejected cannot-be-a-base urls, so path_segments_mut is safe.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Raw JSON bytes for one secret. 404 means the server no longer has it.
    pub async fn raw_secret(&self, name: &str) -> Result<Vec<u8>, BackendError> {
        let started = Instant::now();
        let url = self.endpoint(["secret", name]);
        let response = self
            .http()
            .get(url)
            .send()
            .await
            .map_err(|err| transient(format!("error retrieving secret {name}: {err}")))?;

        let status = response.status();
        tracing::info!(name, %status, elapsed = ?started.elapsed(), "GET /secret");

        let body = response
            .bytes()
            .await
            .map_err(|err| transient(format!("error reading response body for {name}: {err}")))?;

        match status {
            StatusCode::OK => Ok(body.to_vec()),
            StatusCode::NOT_FOUND => {
                tracing::warn!(name, "secret not found on server");
                Err(BackendError::Deleted)
            }
            _ => Err(transient(format!(
                "bad response code getting secret {name}: {status}"
            ))),
        }
    }

    /// Raw JSON bytes for the full listing.
    pub async fn raw_secret_list(&self) -> Result<Vec<u8>, BackendError> {
        let started = Instant::now();
        let url = self.endpoint(["secrets"]);
        let response = self
            .http()
            .get(url)
            .send()
            .await
            .map_err(|err| transient(format!("error retrieving secret listing: {err}")))?;

        let status = response.status();
        tracing::info!(%status, elapsed = ?started.elapsed(), "GET /secrets");

        let body = response
            .bytes()
            .await
            .map_err(|err| transient(format!("error reading secret listing body: {err}")))?;

        if status != StatusCode::OK {
            return Err(transient(format!(
                "bad response code getting secret listing: {status}"
            )));
        }
        Ok(body.to_vec())
    }
}

#[async_trait]
impl SecretBackend for SecretClient {
    async fn fetch_secret(&self, name: &str) -> Result<Secret, BackendError> {
        let body = self.raw_secret(name).await?;
        serde_json::from_slice(&body)
            .map_err(|err| transient(format!("error decoding secret {name}: {err}")))
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>, BackendError> {
        let body = self.raw_secret_list().await?;
        serde_json::from_slice(&body)
            .map_err(|err| transient(format!("error decoding secret listing: {err}")))
    }
}

fn transient(message: String) -> BackendError {
    BackendError::Transient(anyhow::anyhow!(message))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|source| ClientError::Credentials {
        path: path.to_path_buf(),
        source,
    })
}

/// Builds the inner client. TLS 1.2 is the floor; rustls supplies the
/// modern ECDHE cipher set.
fn build_http_client(
    tls: Option<&TlsParams>,
    timeout: Duration,
) -> Result<reqwest::Client, ClientError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .timeout(timeout);

    if let Some(params) = tls {
        // reqwest wants certificate and key in a single PEM. They commonly
        // already share a file, in which case one read suffices.
        let mut identity_pem = read_pem(&params.cert_file)?;
        if params.cert_file != params.key_file {
            identity_pem.extend_from_slice(&read_pem(&params.key_file)?);
        }
        let identity = reqwest::Identity::from_pem(&identity_pem)?;

        let ca_pem = read_pem(&params.ca_file)?;
        builder = builder.identity(identity).tls_built_in_root_certs(false);
        for cert in reqwest::Certificate::from_pem_bundle(&ca_pem)? {
            builder = builder.add_root_certificate(cert);
        }
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_and_escapes_segments() {
        let client = SecretClient::new_plain(
            Url::parse("http://localhost:4444/base/").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();

        assert_eq!(
            client.endpoint(["secrets"]).as_str(),
            "http://localhost:4444/base/secrets"
        );
        assert_eq!(
            client.endpoint(["secret", "general_password"]).as_str(),
            "http://localhost:4444/base/secret/general_password"
        );
        // Names with url-significant characters stay a single segment.
        assert_eq!(
            client.endpoint(["secret", "oddball?#name"]).as_str(),
            "http://localhost:4444/base/secret/oddball%3F%23name"
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        let result = SecretClient::new_plain(
            Url::parse("mailto:user@example.com").unwrap(),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(ClientError::BadUrl(_))));
    }
}
