//! HTTP server setup and the gateway handler.
//!
//! # Responsibilities
//! - Create the Axum router with all handlers
//! - Wire up middleware (tracing, timeout, request id)
//! - Run the configured Flow handler for every request
//! - Execute the recorded action: direct response or cluster dispatch
//! - Bridge cluster listener events back into an HTTP response

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, Version},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use bytes::Bytes;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::cluster::{Cluster, ClusterRequest, ResponseListener};
use crate::config::GatewayConfig;
use crate::context::{register_natives, Action, RequestContext};
use crate::observability::metrics;
use crate::transport::{is_connection_header, RequestInfo};
use crate::vm::{bytecode, NativeRegistry, Opcode, Program, ProgramBuilder};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to load flow program: {0}")]
    Bytecode(#[from] bytecode::BytecodeError),

    #[error("failed to assemble flow program: {0}")]
    Program(#[from] crate::vm::ProgramError),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    program: Arc<Program>,
    entry: String,
    clusters: Arc<HashMap<String, Arc<Cluster>>>,
    local_ip: IpAddr,
    max_body_size: usize,
}

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    config: GatewayConfig,
    clusters: Arc<HashMap<String, Arc<Cluster>>>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration. Builds the
    /// clusters, registers the gateway natives, and loads (or assembles)
    /// the Flow program.
    pub fn new(config: GatewayConfig) -> Result<Self, ServerError> {
        let mut registry = NativeRegistry::new();
        register_natives(&mut registry);

        let mut clusters = HashMap::new();
        for cluster_config in &config.clusters {
            let cluster = Cluster::from_config(cluster_config);
            clusters.insert(cluster_config.name.clone(), cluster);
        }
        let clusters = Arc::new(clusters);

        let program = match &config.flow.program {
            Some(path) => bytecode::load_file(path, &registry)?,
            None => default_program(&registry, config.clusters.first().map(|c| c.name.as_str()))?,
        };

        let local_ip = config
            .listener
            .bind_address
            .parse::<SocketAddr>()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let state = AppState {
            program,
            entry: config.flow.handler.clone(),
            clusters: Arc::clone(&clusters),
            local_ip,
            max_body_size: config.listener.max_body_size,
        };

        let router = Self::build_router(&config, state);
        Ok(Self {
            router,
            config,
            clusters,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &GatewayConfig, state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(gateway_handler))
            .route("/", any(gateway_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(
                config.listener.request_timeout_secs,
            )))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server, accepting connections on the given listener, until
    /// the shutdown signal fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            clusters = self.clusters.len(),
            "HTTP server starting"
        );

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).cloned()
    }
}

/// The built-in program used when no bytecode image is configured: balance
/// everything onto the first cluster, or decline when there is none.
fn default_program(
    registry: &NativeRegistry,
    cluster: Option<&str>,
) -> Result<Arc<Program>, crate::vm::ProgramError> {
    let mut b = ProgramBuilder::new();
    b.add_handler("main", 2);
    match cluster {
        Some(name) => {
            let balance = b.add_native_handler("balance.cluster", "BS");
            let name = b.add_string(name);
            b.emit(Opcode::SConst, 1, name, 0);
            b.emit(Opcode::Handler, balance, 1, 0);
            b.emit(Opcode::Exit, 0, 0, 0);
        }
        None => {
            b.emit(Opcode::Exit, 0, 0, 0);
        }
    }
    b.build(registry)
}

/// Main gateway handler: run the Flow program, then perform its decision.
async fn gateway_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let started = Instant::now();
    let request_id = uuid::Uuid::new_v4();

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return respond(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large", started);
        }
    };

    let Some(handler) = state.program.handler(&state.entry) else {
        tracing::error!(handler = %state.entry, "configured flow handler does not exist");
        return respond(StatusCode::INTERNAL_SERVER_ERROR, "Misconfigured gateway", started);
    };

    let context = RequestContext::new(&parts, remote.ip(), state.local_ip, body.len());
    tracing::debug!(
        request_id = %request_id,
        method = %context.method,
        path = %context.path,
        "running flow handler"
    );

    let mut runner = handler.create_runner();
    runner.set_userdata(Box::new(context));
    let handled = runner.run();

    if let Some(fault) = runner.fault() {
        tracing::warn!(request_id = %request_id, fault = %fault, "flow run faulted");
        metrics::record_vm_fault(fault_label(fault));
        return respond(StatusCode::INTERNAL_SERVER_ERROR, "Policy execution failed", started);
    }

    let context = runner
        .take_userdata()
        .and_then(|data| data.downcast::<RequestContext>().ok())
        .map(|boxed| *boxed);
    let Some(context) = context else {
        tracing::error!(request_id = %request_id, "request context lost during flow run");
        return respond(StatusCode::INTERNAL_SERVER_ERROR, "Policy execution failed", started);
    };

    if !handled {
        return respond(StatusCode::NOT_FOUND, "No handler accepted the request", started);
    }

    match context.action {
        Some(Action::Respond { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            let mut response = (status, body).into_response();
            attach_request_id(&mut response, request_id);
            metrics::record_gateway_request(status.as_u16(), started);
            response
        }
        Some(Action::Proxy { cluster, bucket }) => {
            let Some(cluster) = state.clusters.get(&cluster) else {
                tracing::error!(request_id = %request_id, cluster = %cluster, "flow program named an unknown cluster");
                return respond(StatusCode::SERVICE_UNAVAILABLE, "Unknown cluster", started);
            };

            let info = RequestInfo {
                method: parts.method.clone(),
                path: context.path.clone(),
                version: Version::HTTP_11,
                headers: context
                    .headers
                    .iter()
                    .filter(|(name, _)| !is_connection_header(name))
                    .cloned()
                    .collect(),
                body_len: body.len(),
            };

            let (listener, rx) = ChannelListener::new();
            let req = ClusterRequest::new(info, body, Box::new(listener));

            let bucket = bucket
                .and_then(|name| cluster.find_bucket(&name))
                .unwrap_or_else(|| cluster.root_bucket());
            cluster.schedule_in(req, bucket);

            match rx.await {
                Ok(assembled) => {
                    let mut response = assembled.into_response();
                    attach_request_id(&mut response, request_id);
                    metrics::record_gateway_request(response.status().as_u16(), started);
                    response
                }
                Err(_) => {
                    tracing::error!(request_id = %request_id, "cluster dropped the request without a response");
                    respond(StatusCode::BAD_GATEWAY, "Upstream request failed", started)
                }
            }
        }
        None => {
            tracing::error!(request_id = %request_id, "flow handler terminated without recording an action");
            respond(StatusCode::INTERNAL_SERVER_ERROR, "Policy produced no action", started)
        }
    }
}

fn respond(status: StatusCode, message: &'static str, started: Instant) -> Response {
    metrics::record_gateway_request(status.as_u16(), started);
    (status, message).into_response()
}

fn attach_request_id(response: &mut Response, request_id: uuid::Uuid) {
    if let Ok(value) = request_id.to_string().parse() {
        response.headers_mut().insert("x-request-id", value);
    }
}

fn fault_label(fault: &crate::vm::VmError) -> &'static str {
    use crate::vm::VmError;
    match fault {
        VmError::DivisionByZero { .. } => "division-by-zero",
        VmError::BadBranch { .. } => "bad-branch",
        VmError::BadConstantIndex { .. } => "bad-constant-index",
        VmError::UnknownNative { .. } => "unknown-native",
        VmError::StackExhausted => "budget-exhausted",
    }
}

/// Response message assembled from listener events.
#[derive(Debug)]
struct AssembledResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Default for AssembledResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

impl IntoResponse for AssembledResponse {
    fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(Body::from(Bytes::from(self.body)))
            .unwrap_or_else(|_| {
                (StatusCode::BAD_GATEWAY, "Malformed upstream response").into_response()
            })
    }
}

/// Listener that buffers the response message and resolves a oneshot when
/// the message ends.
struct ChannelListener {
    response: AssembledResponse,
    tx: Option<oneshot::Sender<AssembledResponse>>,
}

impl ChannelListener {
    fn new() -> (Self, oneshot::Receiver<AssembledResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                response: AssembledResponse::default(),
                tx: Some(tx),
            },
            rx,
        )
    }
}

impl ResponseListener for ChannelListener {
    fn on_message_begin(&mut self, _version: Version, status: StatusCode, _reason: &str) {
        self.response.status = status;
    }

    fn on_message_header(&mut self, name: &str, value: &str) {
        self.response
            .headers
            .push((name.to_string(), value.to_string()));
    }

    fn on_message_header_end(&mut self) {}

    fn on_message_content(&mut self, chunk: &[u8]) {
        self.response.body.extend_from_slice(chunk);
    }

    fn on_message_end(&mut self) {
        if let Some(tx) = self.tx.take() {
            let assembled = std::mem::take(&mut self.response);
            let _ = tx.send(assembled);
        }
    }
}
