//! HTTP client with TLS rotation and connection max-age.
//!
//! The client watches its TLS material on disk: whenever a CA bundle, client
//! certificate or key file is modified after the current transport was
//! built, the transport is discarded and rebuilt before the next request.
//! Independently, a configurable connection max-age periodically drops
//! pooled connections so load balancers can rebalance and rotated server
//! certificates are picked up without interrupting in-flight requests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use quarry_core::config::RunnerConfig;
use quarry_core::version;

use crate::envelope;
use crate::retry::RetryPolicy;

pub(crate) const JSON_MIME: &str = "application/json";
pub(crate) const TEXT_PLAIN_MIME: &str = "text/plain";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid coordinator url {url:?}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("only http or https scheme supported")]
    UnsupportedScheme,

    #[error("failed to load TLS material from {path}: {source}")]
    TlsMaterial {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid TLS material in {path}: {message}")]
    TlsParse { path: PathBuf, message: String },

    #[error("failed to marshal request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default)]
struct TlsFiles {
    ca_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
}

struct ClientState {
    http: reqwest::Client,
    /// When the current transport was built; newer file mtimes invalidate it.
    update_time: SystemTime,
    /// Last idle-connection refresh, for the max-age rotation.
    last_refresh: Instant,
}

/// An HTTP response with its envelope already inspected.
#[derive(Debug)]
pub(crate) struct ApiResponse<T> {
    pub status: StatusCode,
    /// Status text or the decoded server error message.
    pub message: String,
    pub body: Option<T>,
    pub headers: HeaderMap,
}

/// One client per (url, token, TLS material) tuple.
pub struct TransportClient {
    base_url: Url,
    token: String,
    tls: TlsFiles,
    connection_max_age: Option<Duration>,
    user_agent: HeaderValue,
    retry: RetryPolicy,

    state: Mutex<ClientState>,
    /// Opaque coordinator marker echoed on the next job request.
    last_update: Mutex<Option<String>>,
}

impl TransportClient {
    pub fn new(config: &RunnerConfig) -> Result<Self, TransportError> {
        let base_url = parse_base_url(&config.url)?;

        let tls = TlsFiles {
            ca_file: config.tls_ca_file.clone(),
            cert_file: config.tls_cert_file.clone(),
            key_file: config.tls_key_file.clone(),
        };
        let http = build_http_client(&tls)?;

        let user_agent = HeaderValue::from_str(&version::user_agent())
            .unwrap_or_else(|_| HeaderValue::from_static(version::NAME));

        Ok(Self {
            base_url,
            token: config.token.clone(),
            tls,
            connection_max_age: config.connection_max_age(),
            user_agent,
            retry: RetryPolicy::default(),
            state: Mutex::new(ClientState {
                http,
                update_time: SystemTime::now(),
                last_refresh: Instant::now(),
            }),
            last_update: Mutex::new(None),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// The marker from the most recent `X-GitLab-Last-Update` header.
    pub fn last_update(&self) -> Option<String> {
        self.last_update.lock().unwrap().clone()
    }

    fn set_last_update(&self, headers: &HeaderMap) {
        if let Some(value) = headers
            .get("X-GitLab-Last-Update")
            .and_then(|v| v.to_str().ok())
        {
            if !value.is_empty() {
                *self.last_update.lock().unwrap() = Some(value.to_string());
            }
        }
    }

    /// The client used for the next request, rebuilt when TLS material
    /// changed on disk or pooled connections outlived the max-age.
    fn ensure_client(&self) -> Result<reqwest::Client, TransportError> {
        let mut state = self.state.lock().unwrap();

        let mut rebuild = false;
        for path in [&self.tls.ca_file, &self.tls.cert_file, &self.tls.key_file]
            .into_iter()
            .flatten()
        {
            if modified_after(path, state.update_time) {
                debug!(path = %path.display(), "TLS material changed, rebuilding transport");
                rebuild = true;
            }
        }

        if let Some(max_age) = self.connection_max_age {
            if state.last_refresh.elapsed() > max_age {
                debug!("Connection max-age exceeded, rotating idle connections");
                rebuild = true;
            }
        }

        if rebuild {
            state.http = build_http_client(&self.tls)?;
            state.update_time = SystemTime::now();
            state.last_refresh = Instant::now();
        }

        Ok(state.http.clone())
    }

    /// JSON-envelope request: marshals `request`, expects `expected_status`
    /// and decodes the body only on match. Error payloads are decoded into a
    /// readable message.
    pub(crate) async fn do_json<Req, Resp>(
        &self,
        method: Method,
        path: &str,
        expected_status: StatusCode,
        request: Option<&Req>,
        extra_headers: HeaderMap,
    ) -> Result<ApiResponse<Resp>, TransportError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut headers = extra_headers;
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_MIME));

        let body = match request {
            Some(request) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_MIME));
                Some(Bytes::from(serde_json::to_vec(request)?))
            }
            None => None,
        };

        let response = self.dispatch(method, path, headers, body).await?;

        let status = response.status();
        let response_headers = response.headers().clone();
        self.set_last_update(&response_headers);

        if status == expected_status {
            let bytes = response.bytes().await?;
            let body = if bytes.is_empty() {
                None
            } else {
                match serde_json::from_slice(&bytes) {
                    Ok(decoded) => Some(decoded),
                    Err(err) => {
                        warn!(path, error = %err, "Error decoding json payload");
                        None
                    }
                }
            };
            return Ok(ApiResponse {
                status,
                message: status.to_string(),
                body,
                headers: response_headers,
            });
        }

        let message = envelope::error_message(response).await;
        Ok(ApiResponse {
            status,
            message,
            body: None,
            headers: response_headers,
        })
    }

    /// Raw-body request (trace patches). The caller owns header layout; the
    /// response body is left untouched for status-driven handling.
    pub(crate) async fn do_raw(
        &self,
        method: Method,
        path: &str,
        content_type: &'static str,
        body: Bytes,
        extra_headers: HeaderMap,
    ) -> Result<reqwest::Response, TransportError> {
        let mut headers = extra_headers;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.dispatch(method, path, headers, Some(body)).await
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        mut headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, TransportError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| TransportError::InvalidUrl {
                url: path.to_string(),
                message: err.to_string(),
            })?;

        headers.insert(USER_AGENT, self.user_agent.clone());

        let client = self.ensure_client()?;
        self.retry
            .execute(|| {
                let mut builder = client.request(method.clone(), url.clone());
                builder = builder.headers(headers.clone());
                if let Some(body) = &body {
                    builder = builder.body(body.clone());
                }
                builder
            })
            .await
    }
}

fn parse_base_url(raw: &str) -> Result<Url, TransportError> {
    let trimmed = raw.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/ci").unwrap_or(trimmed);

    let url = Url::parse(&format!("{trimmed}/api/v4/")).map_err(|err| {
        TransportError::InvalidUrl {
            url: raw.to_string(),
            message: err.to_string(),
        }
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(TransportError::UnsupportedScheme);
    }

    Ok(url)
}

fn modified_after(path: &Path, reference: SystemTime) -> bool {
    match std::fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(mtime) => mtime > reference,
        Err(_) => false,
    }
}

fn build_http_client(tls: &TlsFiles) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .use_rustls_tls()
        .min_tls_version(reqwest::tls::Version::TLS_1_2);

    if let Some(path) = &tls.ca_file {
        match std::fs::read(path) {
            Ok(data) => {
                let certs = reqwest::Certificate::from_pem_bundle(&data).map_err(|err| {
                    TransportError::TlsParse {
                        path: path.clone(),
                        message: err.to_string(),
                    }
                })?;
                for cert in certs {
                    builder = builder.add_root_certificate(cert);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // The file may appear later; the mtime watch rebuilds then.
            }
            Err(err) => {
                return Err(TransportError::TlsMaterial {
                    path: path.clone(),
                    source: err,
                });
            }
        }
    }

    if let (Some(cert_path), Some(key_path)) = (&tls.cert_file, &tls.key_file) {
        let mut pem = match std::fs::read(cert_path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(TransportError::TlsMaterial {
                    path: cert_path.clone(),
                    source: err,
                });
            }
        };
        if !pem.is_empty() {
            let key = std::fs::read(key_path).map_err(|err| TransportError::TlsMaterial {
                path: key_path.clone(),
                source: err,
            })?;
            pem.extend_from_slice(&key);
            let identity =
                reqwest::Identity::from_pem(&pem).map_err(|err| TransportError::TlsParse {
                    path: cert_path.clone(),
                    message: err.to_string(),
                })?;
            builder = builder.identity(identity);
        }
    }

    Ok(builder.build()?)
}
