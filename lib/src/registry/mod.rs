//! Client for the Docker Registry HTTP API v2 / OCI Distribution protocol.
//!
//! One client value targets one `(registry, repository)` pair with one
//! scope (`pull` or `pull,push`).  Requests go out anonymously or with the
//! configured credential; on a `401` the client performs the bearer
//! handshake once (parse the challenge, fetch a token from the realm,
//! replay) and fails with [`RegistryError::AuthenticationFailed`] if the
//! registry still refuses.  Transient transport failures are retried by
//! middleware with exponential backoff; HTTP error statuses are not.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use openssl::hash::{Hasher, MessageDigest};
use reqwest::header;
use reqwest::{Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::blob::{BlobDescriptor, DescriptorDigest};
use crate::image::json::{self, ManifestJson};

pub mod auth;
use auth::{fetch_token, parse_bearer_challenge, Authorization};

/// Default connect timeout for registry requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// Default read timeout for registry requests.
const READ_TIMEOUT: Duration = Duration::from_secs(20);

fn base_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .build()
        .expect("constructing HTTP client")
}

/// Process-wide client with transient retry: at most 3 attempts beyond the
/// first, exponential backoff starting at 100 ms with jitter.  Connect
/// failures and 5xx are retried; 4xx are not.
pub(crate) static CLIENT: Lazy<ClientWithMiddleware> = Lazy::new(|| {
    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(Duration::from_millis(100), Duration::from_secs(2))
        .build_with_max_retries(3);
    ClientBuilder::new(base_client())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
});

/// Client without retry middleware.  Streamed upload bodies cannot be
/// replayed, so PATCH requests carrying blob bytes bypass the retry layer.
static UPLOAD_CLIENT: Lazy<ClientWithMiddleware> =
    Lazy::new(|| ClientBuilder::new(base_client()).build());

/// One entry of a registry error payload (`{"errors":[{code,message}]}`).
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEntry {
    /// The registry's error code, e.g. `BLOB_UNKNOWN`.
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

fn format_entries(entries: &[ErrorEntry]) -> String {
    let rendered: Vec<String> = entries
        .iter()
        .map(|e| {
            format!(
                "{}: {}",
                e.code.as_deref().unwrap_or("UNKNOWN"),
                e.message.as_deref().unwrap_or("(no message)")
            )
        })
        .collect();
    rendered.join("; ")
}

/// A failed registry interaction.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry answered with a structured error payload.
    #[error("{context}: registry answered {status}: {}", format_entries(.errors))]
    ErrorResponse {
        /// What the client was doing.
        context: String,
        /// The HTTP status.
        status: u16,
        /// All error entries from the payload.
        errors: Vec<ErrorEntry>,
    },
    /// Still `401` after the bearer handshake; not retried.
    #[error("authentication failed for {repository} on {registry}")]
    AuthenticationFailed {
        /// The registry host.
        registry: String,
        /// The repository within it.
        repository: String,
    },
    /// The token endpoint refused or returned no token.
    #[error("token request to {realm} failed (status {status})")]
    TokenRequestFailed {
        /// The realm URL from the challenge.
        realm: String,
        /// The HTTP status.
        status: u16,
    },
    /// A pulled blob hashed differently than its descriptor promised.
    #[error("blob {expected} arrived with digest {actual}")]
    UnexpectedDigest {
        /// The digest that was requested.
        expected: DescriptorDigest,
        /// The digest of the bytes that arrived.
        actual: DescriptorDigest,
    },
    /// A status the protocol does not account for, without error payload.
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus {
        /// The HTTP status.
        status: u16,
        /// The request URL.
        url: String,
    },
    /// An upload initiation response without a `Location` header.
    #[error("blob upload did not return a Location header")]
    MissingUploadLocation,
    /// Transport-level failure (after retries).
    #[error(transparent)]
    Http(#[from] reqwest_middleware::Error),
    /// Transport-level failure from the underlying client.
    #[error(transparent)]
    HttpTransport(#[from] reqwest::Error),
    /// Local I/O failure while streaming.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The fetched manifest could not be understood.
    #[error(transparent)]
    Manifest(#[from] json::TranslationError),
}

/// Parse an error response body, falling back to the bare status.
fn parse_error_payload(context: &str, status: u16, url: &str, body: &[u8]) -> RegistryError {
    #[derive(Deserialize)]
    struct Payload {
        #[serde(default)]
        errors: Vec<ErrorEntry>,
    }
    match serde_json::from_slice::<Payload>(body) {
        Ok(payload) if !payload.errors.is_empty() => RegistryError::ErrorResponse {
            context: context.to_string(),
            status,
            errors: payload.errors,
        },
        _ => RegistryError::UnexpectedStatus {
            status,
            url: url.to_string(),
        },
    }
}

/// Restartable bytes for one blob upload.  The auth handshake may replay a
/// request, so the body must be producible more than once.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// In-memory bytes.
    Bytes(Bytes),
    /// Streamed from a file.
    File(Utf8PathBuf),
}

impl UploadSource {
    fn content_length(&self) -> io::Result<u64> {
        match self {
            UploadSource::Bytes(b) => Ok(b.len() as u64),
            UploadSource::File(p) => Ok(std::fs::metadata(p.as_std_path())?.len()),
        }
    }

    fn to_body(&self) -> io::Result<reqwest::Body> {
        match self {
            UploadSource::Bytes(b) => Ok(b.clone().into()),
            UploadSource::File(p) => {
                let file = std::fs::File::open(p.as_std_path())?;
                let file = tokio::fs::File::from_std(file);
                Ok(reqwest::Body::wrap_stream(
                    tokio_util::io::ReaderStream::new(file),
                ))
            }
        }
    }
}

/// A client scoped to one repository on one registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    registry: String,
    repository: String,
    actions: &'static str,
    credential: Option<Authorization>,
    bearer: Arc<tokio::sync::RwLock<Option<Authorization>>>,
    allow_insecure: bool,
    use_http: Arc<AtomicBool>,
}

impl RegistryClient {
    /// A client for pull operations (`repository:<name>:pull` scope).
    pub fn for_pull(registry: impl Into<String>, repository: impl Into<String>) -> Self {
        Self::new(registry, repository, "pull")
    }

    /// A client for push operations (`repository:<name>:pull,push` scope).
    pub fn for_push(registry: impl Into<String>, repository: impl Into<String>) -> Self {
        Self::new(registry, repository, "pull,push")
    }

    fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        actions: &'static str,
    ) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            actions,
            credential: None,
            bearer: Arc::new(tokio::sync::RwLock::new(None)),
            allow_insecure: false,
            use_http: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a credential (or none, for anonymous access).
    pub fn with_credential(mut self, credential: Option<Authorization>) -> Self {
        self.credential = credential;
        self
    }

    /// Permit falling back to plain HTTP after an HTTPS connection failure.
    pub fn with_allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    /// The repository this client addresses.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The registry host this client addresses.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Fetch the manifest for a tag or digest reference.  Returns the
    /// parsed manifest and the raw bytes it was parsed from.
    #[instrument(skip(self), fields(registry = %self.registry, repository = %self.repository))]
    pub async fn pull_manifest(
        &self,
        reference: &str,
    ) -> Result<(ManifestJson, Vec<u8>), RegistryError> {
        let accept = [
            json::DOCKER_TYPE_MANIFEST_V22,
            json::OCI_TYPE_MANIFEST,
            json::DOCKER_TYPE_MANIFEST_V21,
        ]
        .join(", ");
        let path = self.v2_path(&format!("manifests/{reference}"));
        let response = self
            .send(&CLIENT, Method::GET, &path, move |b| {
                Ok(b.header(header::ACCEPT, accept.clone()))
            })
            .await?;
        let response = self.expect_success("pulling manifest", response).await?;
        let bytes = response.bytes().await?;
        let manifest = json::parse_manifest(&bytes)?;
        debug!(reference, len = bytes.len(), "pulled manifest");
        Ok((manifest, bytes.to_vec()))
    }

    /// `HEAD` a blob: `Some(descriptor)` if present, `None` on 404.
    pub async fn check_blob(
        &self,
        digest: &DescriptorDigest,
    ) -> Result<Option<BlobDescriptor>, RegistryError> {
        let path = self.v2_path(&format!("blobs/{digest}"));
        let response = self.send(&CLIENT, Method::HEAD, &path, Ok).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status().is_success() {
            let size = response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(-1);
            return Ok(Some(BlobDescriptor::new(size, digest.clone())));
        }
        Err(self.registry_error("checking blob", response).await)
    }

    /// Stream a blob to `dest`, verifying its digest.  On mismatch the
    /// file is removed and nothing must be cached.
    #[instrument(skip(self), fields(repository = %self.repository))]
    pub async fn pull_blob(
        &self,
        digest: &DescriptorDigest,
        dest: &Utf8Path,
    ) -> Result<BlobDescriptor, RegistryError> {
        let path = self.v2_path(&format!("blobs/{digest}"));
        let response = self.send(&CLIENT, Method::GET, &path, Ok).await?;
        let mut response = self.expect_success("pulling blob", response).await?;

        let mut hasher = Hasher::new(MessageDigest::sha256()).map_err(io::Error::from)?;
        let mut file = tokio::fs::File::create(dest.as_std_path()).await?;
        let mut size: i64 = 0;
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk).map_err(io::Error::from)?;
            file.write_all(&chunk).await?;
            size += chunk.len() as i64;
        }
        file.sync_all().await?;
        drop(file);

        let actual = digest_from_hasher(&mut hasher)?;
        if &actual != digest {
            // Never leave unverified bytes around
            let _ = tokio::fs::remove_file(dest.as_std_path()).await;
            return Err(RegistryError::UnexpectedDigest {
                expected: digest.clone(),
                actual,
            });
        }
        Ok(BlobDescriptor::new(size, actual))
    }

    /// Fetch a small blob (e.g. a container configuration) into memory,
    /// verifying its digest.
    pub async fn pull_blob_bytes(
        &self,
        digest: &DescriptorDigest,
    ) -> Result<Vec<u8>, RegistryError> {
        let path = self.v2_path(&format!("blobs/{digest}"));
        let response = self.send(&CLIENT, Method::GET, &path, Ok).await?;
        let response = self.expect_success("pulling blob", response).await?;
        let bytes = response.bytes().await?;

        let mut hasher = Hasher::new(MessageDigest::sha256()).map_err(io::Error::from)?;
        hasher.update(&bytes).map_err(io::Error::from)?;
        let actual = digest_from_hasher(&mut hasher)?;
        if &actual != digest {
            return Err(RegistryError::UnexpectedDigest {
                expected: digest.clone(),
                actual,
            });
        }
        Ok(bytes.to_vec())
    }

    /// Upload a blob, preferring the paths that move no bytes: skip when
    /// the registry already has the digest, then attempt a cross-repo
    /// mount from `mount_from`, then fall back to a monolithic upload
    /// (one PATCH with the whole blob, one PUT to commit).
    ///
    /// Returns `true` when no bytes were transferred.
    #[instrument(skip(self, source), fields(repository = %self.repository))]
    pub async fn push_blob(
        &self,
        digest: &DescriptorDigest,
        source: UploadSource,
        mount_from: Option<&str>,
    ) -> Result<bool, RegistryError> {
        if self.check_blob(digest).await?.is_some() {
            debug!(%digest, "blob already present, skipping push");
            return Ok(true);
        }

        let initiate = match mount_from {
            Some(from) => self.v2_path(&format!("blobs/uploads/?mount={digest}&from={from}")),
            None => self.v2_path("blobs/uploads/"),
        };
        let response = self
            .send(&CLIENT, Method::POST, &initiate, |b| {
                Ok(b.header(header::CONTENT_LENGTH, 0))
            })
            .await?;
        let location = match response.status() {
            StatusCode::CREATED => {
                debug!(%digest, from = mount_from, "cross-repo mounted blob");
                return Ok(true);
            }
            StatusCode::ACCEPTED => response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or(RegistryError::MissingUploadLocation)?,
            _ => return Err(self.registry_error("initiating blob upload", response).await),
        };
        let upload_url = self.resolve_location(&location);

        let content_length = source.content_length()?;
        let response = self
            .send(&UPLOAD_CLIENT, Method::PATCH, &upload_url, move |b| {
                Ok(b.header(header::CONTENT_TYPE, "application/octet-stream")
                    .header(header::CONTENT_LENGTH, content_length)
                    .body(source.to_body()?))
            })
            .await?;
        let commit_url = match response.status() {
            StatusCode::ACCEPTED | StatusCode::CREATED | StatusCode::NO_CONTENT => response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|l| self.resolve_location(l))
                .unwrap_or(upload_url),
            _ => return Err(self.registry_error("uploading blob", response).await),
        };

        let commit_url = append_digest_query(&commit_url, digest);
        let response = self
            .send(&CLIENT, Method::PUT, &commit_url, |b| {
                Ok(b.header(header::CONTENT_LENGTH, 0))
            })
            .await?;
        if response.status() == StatusCode::CREATED {
            debug!(%digest, bytes = content_length, "pushed blob");
            Ok(false)
        } else {
            Err(self.registry_error("finalizing blob upload", response).await)
        }
    }

    /// `PUT` manifest bytes under a tag with their declared media type.
    #[instrument(skip(self, manifest), fields(repository = %self.repository))]
    pub async fn push_manifest(
        &self,
        manifest: Vec<u8>,
        media_type: &str,
        tag: &str,
    ) -> Result<(), RegistryError> {
        let path = self.v2_path(&format!("manifests/{tag}"));
        let media_type = media_type.to_string();
        let body = Bytes::from(manifest);
        let response = self
            .send(&CLIENT, Method::PUT, &path, move |b| {
                Ok(b.header(header::CONTENT_TYPE, media_type.clone())
                    .body(body.clone()))
            })
            .await?;
        if response.status().is_success() {
            debug!(tag, "pushed manifest");
            Ok(())
        } else {
            Err(self.registry_error("pushing manifest", response).await)
        }
    }

    /// Send a request, handling the bearer handshake and (when explicitly
    /// allowed) the one-time fallback to plain HTTP.
    async fn send<F>(
        &self,
        client: &ClientWithMiddleware,
        method: Method,
        target: &str,
        prepare: F,
    ) -> Result<reqwest::Response, RegistryError>
    where
        F: Fn(RequestBuilder) -> Result<RequestBuilder, RegistryError>,
    {
        let mut authed_retry = false;
        loop {
            let url = self.resolve_url(target);
            let mut builder = client.request(method.clone(), &url);
            if let Some(authorization) = self.current_authorization().await {
                builder = builder.header(header::AUTHORIZATION, authorization.header_value());
            }
            let builder = prepare(builder)?;
            match builder.send().await {
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    if authed_retry {
                        return Err(self.authentication_failed());
                    }
                    let challenge = response
                        .headers()
                        .get(header::WWW_AUTHENTICATE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_bearer_challenge);
                    let Some(challenge) = challenge else {
                        return Err(self.authentication_failed());
                    };
                    let basic = self.credential.as_ref().filter(|c| !c.is_bearer());
                    let token = fetch_token(&challenge, basic, &self.scope()).await?;
                    *self.bearer.write().await = Some(token);
                    authed_retry = true;
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    if self.allow_insecure
                        && !self.use_http.load(Ordering::Relaxed)
                        && is_connect_error(&e)
                    {
                        warn!(
                            registry = %self.registry,
                            "HTTPS connection failed; falling back to HTTP (allow-insecure)"
                        );
                        self.use_http.store(true, Ordering::Relaxed);
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    async fn current_authorization(&self) -> Option<Authorization> {
        if let Some(bearer) = self.bearer.read().await.clone() {
            return Some(bearer);
        }
        self.credential.clone()
    }

    fn authentication_failed(&self) -> RegistryError {
        RegistryError::AuthenticationFailed {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
        }
    }

    /// Consume an error response into a typed error.
    async fn registry_error(&self, context: &str, response: reqwest::Response) -> RegistryError {
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.bytes().await.unwrap_or_default();
        parse_error_payload(context, status, &url, &body)
    }

    async fn expect_success(
        &self,
        context: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RegistryError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(self.registry_error(context, response).await)
        }
    }

    fn scope(&self) -> String {
        format!("repository:{}:{}", self.repository, self.actions)
    }

    fn scheme(&self) -> &'static str {
        if self.use_http.load(Ordering::Relaxed) {
            "http"
        } else {
            "https"
        }
    }

    fn v2_path(&self, suffix: &str) -> String {
        format!("/v2/{}/{}", self.repository, suffix)
    }

    /// Absolute URLs pass through; paths are joined onto the registry.
    fn resolve_url(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("{}://{}{}", self.scheme(), self.registry, target)
        }
    }

    /// A `Location` header may be absolute or registry-relative.
    fn resolve_location(&self, location: &str) -> String {
        self.resolve_url(location)
    }
}

fn is_connect_error(e: &reqwest_middleware::Error) -> bool {
    match e {
        reqwest_middleware::Error::Reqwest(e) => e.is_connect(),
        reqwest_middleware::Error::Middleware(_) => false,
    }
}

fn digest_from_hasher(hasher: &mut Hasher) -> Result<DescriptorDigest, RegistryError> {
    let hex = hex::encode(hasher.finish().map_err(io::Error::from)?);
    Ok(DescriptorDigest::from_hash(&hex).expect("sha256 output is 64 hex characters"))
}

/// Append `digest=<digest>` to an upload URL that may already carry query
/// parameters.
fn append_digest_query(url: &str, digest: &DescriptorDigest) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}digest={digest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> DescriptorDigest {
        DescriptorDigest::from_hash(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn test_resolve_url() {
        let client = RegistryClient::for_pull("registry.example.com", "library/app");
        assert_eq!(
            client.resolve_url("/v2/library/app/manifests/latest"),
            "https://registry.example.com/v2/library/app/manifests/latest"
        );
        assert_eq!(
            client.resolve_url("https://elsewhere/upload/1"),
            "https://elsewhere/upload/1"
        );
    }

    #[test]
    fn test_http_fallback_changes_scheme() {
        let client = RegistryClient::for_pull("localhost:5000", "app").with_allow_insecure(true);
        assert_eq!(client.scheme(), "https");
        client.use_http.store(true, Ordering::Relaxed);
        assert_eq!(client.resolve_url("/v2/"), "http://localhost:5000/v2/");
    }

    #[test]
    fn test_scope() {
        let pull = RegistryClient::for_pull("r", "library/app");
        assert_eq!(pull.scope(), "repository:library/app:pull");
        let push = RegistryClient::for_push("r", "library/app");
        assert_eq!(push.scope(), "repository:library/app:pull,push");
    }

    #[test]
    fn test_append_digest_query() {
        let d = digest();
        assert_eq!(
            append_digest_query("https://r/upload/1", &d),
            format!("https://r/upload/1?digest={d}")
        );
        assert_eq!(
            append_digest_query("https://r/upload/1?state=x", &d),
            format!("https://r/upload/1?state=x&digest={d}")
        );
    }

    #[test]
    fn test_parse_error_payload() {
        let body = br#"{"errors":[{"code":"BLOB_UNKNOWN","message":"blob unknown to registry"},{"code":"DENIED","message":"forbidden"}]}"#;
        let err = parse_error_payload("pushing blob", 400, "https://r/v2/x", body);
        match err {
            RegistryError::ErrorResponse { status, errors, .. } => {
                assert_eq!(status, 400);
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0].code.as_deref(), Some("BLOB_UNKNOWN"));
                assert_eq!(errors[1].code.as_deref(), Some("DENIED"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // All entries surface in the rendered message
        let err = parse_error_payload("pushing blob", 400, "https://r/v2/x", body);
        let message = err.to_string();
        assert!(message.contains("BLOB_UNKNOWN"));
        assert!(message.contains("DENIED"));
    }

    #[test]
    fn test_unparseable_error_payload_keeps_status() {
        let err = parse_error_payload("checking blob", 503, "https://r/v2/x", b"<html>");
        assert!(matches!(
            err,
            RegistryError::UnexpectedStatus { status: 503, .. }
        ));
    }

    #[test]
    fn test_upload_source_bytes() {
        let source = UploadSource::Bytes(Bytes::from_static(b"payload"));
        assert_eq!(source.content_length().unwrap(), 7);
    }
}
