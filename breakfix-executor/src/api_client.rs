//! Minimal JSON-over-HTTPS client for the hypervisor control plane.
//!
//! Built on hyper's legacy pooled client with a native-tls connector, so a
//! lab control plane with a self-signed certificate can be reached when
//! explicitly allowed.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;

use crate::HypervisorError;

/// Every control-plane path lives under this prefix.
pub const API_PREFIX: &str = "/api2/json";

/// Extra headers attached to a request, produced by a credential strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthHeaders(pub Vec<(&'static str, String)>);

/// Pooled HTTPS client bound to one control-plane base URL.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a client for `base_url` (scheme, host and port only).
    ///
    /// # Errors
    /// Returns [`HypervisorError::Api`] if the TLS connector cannot be built.
    pub fn new(base_url: &str, insecure_tls: bool) -> Result<Self, HypervisorError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(insecure_tls)
            .danger_accept_invalid_hostnames(insecure_tls)
            .build()
            .map_err(|e| HypervisorError::Api(format!("TLS setup: {e}")))?;
        let https = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: Client::builder(TokioExecutor::new()).build(https),
        })
    }

    /// The base URL this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a request and return the `data` member of the response envelope.
    ///
    /// `path` is relative to [`API_PREFIX`] (e.g. `/cluster/nextid`).
    ///
    /// # Errors
    /// Returns [`HypervisorError::Authentication`] on HTTP 401,
    /// [`HypervisorError::Api`] on transport errors and other non-2xx
    /// statuses, and [`HypervisorError::InvalidResponse`] if the body is not a
    /// JSON envelope.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        auth: &AuthHeaders,
        body: Option<&Value>,
    ) -> Result<Value, HypervisorError> {
        let url = format!("{}{API_PREFIX}{path}", self.base_url);
        let uri: Uri = url
            .parse()
            .map_err(|e| HypervisorError::Api(format!("invalid URI {url}: {e}")))?;

        let body_bytes = body.map(|b| Bytes::from(b.to_string())).unwrap_or_default();

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("Accept", "application/json");
        if !body_bytes.is_empty() {
            builder = builder.header("Content-Type", "application/json");
        }
        for (name, value) in &auth.0 {
            builder = builder.header(*name, value.as_str());
        }

        let req = builder
            .body(Full::new(body_bytes))
            .map_err(|e| HypervisorError::Api(format!("build request: {e}")))?;

        tracing::debug!(%method, path, "control-plane request");

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| HypervisorError::Api(format!("send {method} {path}: {e}")))?;

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| HypervisorError::Api(format!("read response body: {e}")))?
            .to_bytes();

        decode_envelope(status, path, &bytes)
    }
}

/// Map an HTTP status and body to the envelope's `data` member.
pub(crate) fn decode_envelope(
    status: StatusCode,
    path: &str,
    bytes: &[u8],
) -> Result<Value, HypervisorError> {
    let body_str = String::from_utf8_lossy(bytes);

    if status == StatusCode::UNAUTHORIZED {
        return Err(HypervisorError::Authentication(format!(
            "HTTP {status} from {path}: {body_str}"
        )));
    }
    if !status.is_success() {
        return Err(HypervisorError::Api(format!(
            "HTTP {status} from {path}: {}",
            body_str.trim()
        )));
    }

    let mut envelope: Value = serde_json::from_slice(bytes)
        .map_err(|e| HypervisorError::InvalidResponse(format!("{path}: {e}")))?;
    match envelope.get_mut("data") {
        Some(data) => Ok(data.take()),
        None => Err(HypervisorError::InvalidResponse(format!(
            "{path}: response has no data member"
        ))),
    }
}
