//! The HTTP adapter seam.
//!
//! The engine consumes [`HttpClient`]: one operation that turns a
//! [`Request`] into a [`Response`] or a [`TransportError`]. The default
//! implementation is reqwest-backed. Because reqwest fixes proxy and TLS
//! policy per client, [`ReqwestClient`] keeps a small cache of clients keyed
//! on the effective (proxy, verify) pair and picks one per dispatch, so
//! per-request overrides behave as documented: the request wins over the
//! session.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::config::{HttpBackend, SessionConfig, TlsConfig};
use crate::error::{TransportError, TransportKind};
use crate::request::{Body, Request};
use crate::response::Response;

/// Dispatches one request and produces a response.
///
/// Implementations must report the final post-redirect URL, surface status
/// and headers as-is, read the body exactly once, and honor the request's
/// proxy, TLS, and timeout options.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn dispatch(&self, request: &Request) -> Result<Response, TransportError>;
}

/// Builds the configured adapter for a session.
pub fn build_http_client(session: &SessionConfig) -> Arc<dyn HttpClient> {
    match session.http_backend {
        Some(HttpBackend::Reqwest) | None => Arc::new(ReqwestClient::new(session.clone())),
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<String>,
    verify: bool,
}

/// The default adapter.
pub struct ReqwestClient {
    session: SessionConfig,
    clients: DashMap<ClientKey, reqwest::Client>,
}

impl ReqwestClient {
    pub fn new(session: SessionConfig) -> Self {
        ReqwestClient {
            session,
            clients: DashMap::new(),
        }
    }

    fn client_for(&self, request: &Request) -> Result<reqwest::Client, TransportError> {
        let proxy = request.proxy.clone().or_else(|| {
            self.session
                .proxy
                .as_ref()
                .and_then(|p| p.for_scheme(request.url.scheme()))
                .map(str::to_string)
        });
        let verify = request
            .verify_tls
            .unwrap_or(!matches!(self.session.tls, TlsConfig::NoVerify));
        let key = ClientKey { proxy, verify };

        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let client = self.build_client(&key)?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    fn build_client(&self, key: &ClientKey) -> Result<reqwest::Client, TransportError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.session.timeout)
            .gzip(true);

        if !key.verify {
            builder = builder.danger_accept_invalid_certs(true);
        } else if let TlsConfig::CaBundle(path) = &self.session.tls {
            let pem = std::fs::read(path).map_err(|e| {
                TransportError::Connect(format!("cannot read CA bundle {}: {e}", path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| TransportError::Connect(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(proxy_url) = &key.proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| TransportError::Connect(format!("invalid proxy {proxy_url}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        debug!(
            proxy = key.proxy.as_deref().unwrap_or("none"),
            verify = key.verify,
            "building http client"
        );
        builder
            .build()
            .map_err(|e| TransportError::Connect(format!("client build failed: {e}")))
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn dispatch(&self, request: &Request) -> Result<Response, TransportError> {
        let client = self.client_for(request)?;

        let mut builder = client.request(request.method.clone(), request.url.clone());

        let pairs = request.query_pairs();
        if !pairs.is_empty() {
            builder = builder.query(&pairs);
        }
        if !request.headers.is_empty() {
            builder = builder.headers(request.headers.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        builder = match &request.body {
            None => builder,
            Some(Body::Bytes(bytes)) => builder.body(bytes.clone()),
            Some(Body::Json(value)) => builder.json(value),
            Some(Body::Form(fields)) => builder.form(fields),
            Some(Body::Multipart(parts)) => {
                let mut form = reqwest::multipart::Form::new();
                for part in parts {
                    let mut piece = reqwest::multipart::Part::bytes(part.content.to_vec());
                    if let Some(filename) = &part.filename {
                        piece = piece.file_name(filename.clone());
                    }
                    if let Some(content_type) = &part.content_type {
                        piece = piece.mime_str(content_type).map_err(|e| {
                            TransportError::Protocol(format!(
                                "invalid multipart content type {content_type}: {e}"
                            ))
                        })?;
                    }
                    form = form.part(part.name.clone(), piece);
                }
                builder.multipart(form)
            }
        };

        trace!(id = request.meta.id, method = %request.method, url = %request.url, "dispatching");
        let response = builder.send().await.map_err(map_error)?;

        let final_url = response.url().clone();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_error)?;

        Ok(Response::new(
            request.method.clone(),
            request.url.clone(),
            final_url,
            status,
            headers,
            body,
        ))
    }
}

fn map_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Protocol(error.to_string())
    }
}
