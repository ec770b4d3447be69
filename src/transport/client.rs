//! Single-exchange HTTP client.
//!
//! A thin facade over the hyper legacy client: one `send` drives one
//! request/response exchange against one endpoint and resolves to buffered
//! status/headers/body accessors. Connection management, wire parsing and
//! framing belong to hyper; this layer contributes the timeout policy and
//! the error taxonomy the cluster's retry loop is written against.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method, Request, StatusCode, Uri, Version};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

/// Transport-level failures, local to one dispatch attempt.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("exchange timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("peer closed before a complete response")]
    PeerClosed,
}

/// What to send: the request line and headers, body carried separately.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    /// Path and query, e.g. `/search?q=x`.
    pub path: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub body_len: usize,
}

impl RequestInfo {
    pub fn get(path: &str) -> Self {
        RequestInfo {
            method: Method::GET,
            path: path.to_string(),
            version: Version::HTTP_11,
            headers: Vec::new(),
            body_len: 0,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A completed exchange: buffered response message.
#[derive(Debug)]
pub struct Exchange {
    version: Version,
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Exchange {
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Headers that describe one hop and never travel further upstream.
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
    "close",
];

pub fn is_connection_header(name: &str) -> bool {
    CONNECTION_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    exchange_timeout: Duration,
}

impl HttpTransport {
    /// Connect timeout is enforced by the connector; write and read
    /// timeouts bound the rest of the exchange together.
    pub fn new(connect_timeout: Duration, read_timeout: Duration, write_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        let client = Client::builder(TokioExecutor::new()).build(connector);
        HttpTransport {
            client,
            exchange_timeout: read_timeout + write_timeout,
        }
    }

    /// Drive one exchange against `addr`.
    pub async fn send(
        &self,
        addr: SocketAddr,
        info: &RequestInfo,
        body: Bytes,
    ) -> Result<Exchange, TransportError> {
        let uri: Uri = format!("http://{}{}", addr, info.path)
            .parse()
            .map_err(|e| TransportError::ProtocolError(format!("bad request uri: {e}")))?;

        let mut builder = Request::builder().method(info.method.clone()).uri(uri);
        let mut has_host = false;
        for (name, value) in &info.headers {
            if name.eq_ignore_ascii_case("host") {
                has_host = true;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::ProtocolError(format!("bad header name: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::ProtocolError(format!("bad header value: {e}")))?;
            builder = builder.header(name, value);
        }
        if !has_host {
            builder = builder.header("host", addr.to_string());
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        let response = tokio::time::timeout(self.exchange_timeout, self.client.request(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(classify_client_error)?;

        let (parts, incoming) = response.into_parts();
        let collected = tokio::time::timeout(self.exchange_timeout, incoming.collect())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(classify_body_error)?;

        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Ok(Exchange {
            version: parts.version,
            status: parts.status,
            headers,
            body: collected.to_bytes(),
        })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("exchange_timeout", &self.exchange_timeout)
            .finish()
    }
}

fn classify_client_error(error: hyper_util::client::legacy::Error) -> TransportError {
    if error.is_connect() {
        return TransportError::ConnectFailed(error.to_string());
    }
    if let Some(inner) = find_hyper_error(&error) {
        if inner.is_incomplete_message() {
            return TransportError::PeerClosed;
        }
    }
    TransportError::ProtocolError(error.to_string())
}

fn classify_body_error(error: hyper::Error) -> TransportError {
    if error.is_incomplete_message() {
        return TransportError::PeerClosed;
    }
    TransportError::ProtocolError(error.to_string())
}

fn find_hyper_error(error: &dyn std::error::Error) -> Option<&hyper::Error> {
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            return Some(hyper_err);
        }
        source = err.source();
    }
    None
}
