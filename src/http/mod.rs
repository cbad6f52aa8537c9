use crate::auth::TokenStore;
use crate::config::Config;
use bytes::Bytes;
use log::{debug, warn};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// One outgoing call as seen by observers. Exists only for the duration of
/// a request/response cycle.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Correlation id for log lines; not sent on the wire.
    pub id: Uuid,
    pub method: Method,
    pub url: Url,
}

/// A completed response. The body is fully buffered so observers and the
/// caller share one cheaply-cloned buffer; observers get a borrow of the
/// exact bytes the caller receives.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: for<'de> serde::Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Lower-cased `content-type`, empty when the header is missing.
    pub fn content_type(&self) -> String {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase()
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid request url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("request body encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Hooks run around every request the client dispatches. Both hooks are
/// synchronous and must not block; implementors spawn tasks for anything
/// that needs I/O. `after_response` is not run when the transport itself
/// fails, since there is no response to observe.
pub trait NetworkObserver: Send + Sync {
    fn before_request(&self, _req: &RequestInfo) {}
    fn after_response(&self, _req: &RequestInfo, _resp: &ApiResponse) {}
}

pub fn build_client(cfg: &Config) -> reqwest::Result<Client> {
    let mut default_headers = HeaderMap::new();
    if let Ok(ua) = HeaderValue::from_str(&cfg.user_agent) {
        default_headers.insert(USER_AGENT, ua);
    }
    // Authorization header is injected per request so token rotation takes
    // effect immediately.
    let builder = Client::builder()
        .default_headers(default_headers)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .use_rustls_tls();
    builder.build()
}

/// The process-wide API client. All dashboard traffic goes through
/// `dispatch`, which is where the single registered observer sees every
/// request and response. The observer slot is the one shared primitive
/// binding in the crate: at most one observer is installed, installing into
/// an occupied slot is a no-op, and removal restores plain dispatch.
pub struct ApiClient {
    inner: Client,
    cfg: Config,
    auth: Arc<TokenStore>,
    observer: RwLock<Option<Arc<dyn NetworkObserver>>>,
}

impl ApiClient {
    pub fn new(cfg: Config) -> reqwest::Result<Self> {
        let inner = build_client(&cfg)?;
        let auth = Arc::new(TokenStore::new(cfg.token.clone()));
        Ok(Self {
            inner,
            cfg,
            auth,
            observer: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn auth(&self) -> &Arc<TokenStore> {
        &self.auth
    }

    /// Install `observer` if the slot is free. Returns false (and changes
    /// nothing) when an observer is already installed; this is the guard
    /// that keeps credit updates and gating checks from running twice per
    /// call.
    pub fn install_observer(&self, observer: Arc<dyn NetworkObserver>) -> bool {
        let mut slot = self.observer.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(observer);
        true
    }

    /// Remove the installed observer. Returns whether one was present.
    pub fn remove_observer(&self) -> bool {
        self.observer.write().take().is_some()
    }

    pub fn observer_installed(&self) -> bool {
        self.observer.read().is_some()
    }

    // Clone the observer out of the lock so hooks never run under it.
    fn current_observer(&self) -> Option<Arc<dyn NetworkObserver>> {
        self.observer.read().clone()
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.dispatch(Method::GET, path, None).await
    }

    pub async fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse, ApiError> {
        let body = serde_json::to_value(body)?;
        self.dispatch(Method::POST, path, Some(body)).await
    }

    fn request_url(&self, path: &str) -> Result<Url, ApiError> {
        let raw = format!("{}{}", self.cfg.api_url.trim_end_matches('/'), path);
        Url::parse(&raw).map_err(|source| ApiError::InvalidUrl { url: raw, source })
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.request_url(path)?;
        let req = RequestInfo {
            id: Uuid::new_v4(),
            method: method.clone(),
            url: url.clone(),
        };
        debug!("dispatch {} {} ({})", req.method, req.url, req.id);

        if let Some(obs) = self.current_observer() {
            obs.before_request(&req);
        }

        let mut builder = self
            .inner
            .request(method, url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(bearer) = self.auth.bearer() {
            builder = builder.header(AUTHORIZATION, bearer);
        }
        if let Some(b) = &body {
            builder = builder.json(b);
        }

        let res = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("dispatch {} failed: {}", req.id, e);
                return Err(ApiError::Transport(e));
            }
        };

        let status = res.status();
        let headers = res.headers().clone();
        let bytes = res.bytes().await.map_err(ApiError::Transport)?;
        let resp = ApiResponse {
            status,
            headers,
            body: bytes,
        };

        if let Some(obs) = self.current_observer() {
            obs.after_response(&req, &resp);
        }
        Ok(resp)
    }
}

/// Percent-encode a single path segment (RFC 3986 unreserved set kept).
pub fn encode_path_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}
