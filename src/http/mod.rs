//! HTTP server edge: the axum router and the gateway handler.

pub mod server;

pub use server::{HttpServer, ServerError};
