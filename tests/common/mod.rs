//! Shared utilities for integration testing: raw-TCP mock backends and a
//! buffering response listener.

// not every test binary uses every helper
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use flowgate::cluster::ResponseListener;

/// Start a mock backend that answers every request (health probes
/// included) with 200 and a fixed body. Returns its address.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_programmable_backend(move |_path| async move { (200, response.to_string()) }).await
}

/// Start a mock backend whose reply depends on the request path. Returning
/// status 0 closes the connection without writing a response.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let _ = serve_one(socket, f).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

async fn serve_one<F, Fut>(mut socket: TcpStream, f: Arc<F>) -> std::io::Result<()>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    // read until the end of the request headers
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 64 * 1024 {
            return Ok(());
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    let (status, body) = f(path).await;
    if status == 0 {
        // simulate a backend dying mid-exchange
        return socket.shutdown().await;
    }

    let status_text = match status {
        200 => "200 OK",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_text,
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

/// The response one cluster request produced, as seen by its listener.
#[derive(Debug)]
pub struct CollectedResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub finished_at: Instant,
}

impl CollectedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Listener that buffers everything and resolves a oneshot on message end.
pub struct TestListener {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    tx: Option<oneshot::Sender<CollectedResponse>>,
}

impl TestListener {
    pub fn create() -> (Box<TestListener>, oneshot::Receiver<CollectedResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Box::new(TestListener {
                status: StatusCode::OK,
                headers: Vec::new(),
                body: Vec::new(),
                tx: Some(tx),
            }),
            rx,
        )
    }
}

impl ResponseListener for TestListener {
    fn on_message_begin(&mut self, _version: Version, status: StatusCode, _reason: &str) {
        self.status = status;
    }

    fn on_message_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn on_message_header_end(&mut self) {}

    fn on_message_content(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    fn on_message_end(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(CollectedResponse {
                status: self.status,
                headers: std::mem::take(&mut self.headers),
                body: std::mem::take(&mut self.body),
                finished_at: Instant::now(),
            });
        }
    }
}

/// Poll until `predicate` holds, panicking after `deadline`.
pub async fn wait_for(deadline: Duration, what: &str, mut predicate: impl FnMut() -> bool) {
    let start = Instant::now();
    while !predicate() {
        if start.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
