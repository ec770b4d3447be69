//! flowgate: a programmable HTTP gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────┐
//!                  │                    FLOWGATE                      │
//!                  │                                                  │
//!   Client ───────▶│  http::server ──▶ context ──▶ vm::Runner        │
//!                  │                     │            (Flow program)  │
//!                  │                     ▼                            │
//!                  │             Action::{Respond, Proxy}            │
//!                  │                     │                            │
//!                  │                     ▼                            │
//!                  │  cluster ──▶ shaper ──▶ scheduler ──▶ member     │
//!                  │     │                                   │       │
//!                  │   health ◀── probes ── transport::client┘       │
//!                  │                                                  │
//!                  │  config · observability · lifecycle              │
//!                  └──────────────────────────────────────────────────┘
//! ```
//!
//! Two cores do the real work: the Flow VM (`vm`), a register-based
//! bytecode interpreter for per-request policy, and the cluster subsystem
//! (`cluster`), a load-balancing reverse proxy with token-bucket admission
//! control, bounded queueing, health monitoring and retries. Everything
//! else is glue around them.

// Core subsystems
pub mod cluster;
pub mod config;
pub mod context;
pub mod http;
pub mod transport;
pub mod vm;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
