//! HTTP transport: the single-exchange client used by cluster dispatch and
//! health probing.

pub mod client;

pub use client::{is_connection_header, Exchange, HttpTransport, RequestInfo, TransportError};
