#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rss_broadcaster::{BroadcastError, BroadcastSource, HttpTransport, Item, Result, TransportResponse};
use std::sync::{Mutex, Once};
use std::time::Duration;
use tokio::time::Instant;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub fn at(hour: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, min, 0).unwrap()
}

/// Source that serves a canned batch, optionally after a delay or as an error.
pub struct FakeSource {
    name: String,
    items: Mutex<Vec<Item>>,
    delay: Option<Duration>,
    fail: bool,
}

impl FakeSource {
    pub fn new(name: &str, items: Vec<Item>) -> Self {
        Self {
            name: name.to_string(),
            items: Mutex::new(items),
            delay: None,
            fail: false,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, Vec::new())
        }
    }

    pub fn slow(name: &str, items: Vec<Item>, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(name, items)
        }
    }

    pub fn replace(&self, items: Vec<Item>) {
        *self.items.lock().unwrap() = items;
    }
}

#[async_trait]
impl BroadcastSource for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_recent(&self) -> Result<Vec<Item>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(BroadcastError::General(format!("{} is down", self.name)));
        }
        Ok(self.items.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub url: String,
    pub body: serde_json::Value,
    pub at: Instant,
}

/// Transport that records every request and answers with a fixed status.
pub struct RecordingTransport {
    pub requests: Mutex<Vec<Recorded>>,
    status: u16,
}

impl RecordingTransport {
    pub fn ok() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            status,
        }
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn post_json(&self, url: &str, body: Vec<u8>, _timeout: Duration) -> Result<TransportResponse> {
        self.requests.lock().unwrap().push(Recorded {
            url: url.to_string(),
            body: serde_json::from_slice(&body)?,
            at: Instant::now(),
        });
        Ok(TransportResponse {
            status: self.status,
            body: r#"{"code":0,"msg":"success"}"#.to_string(),
        })
    }
}

/// A request as seen by [`TestServer`].
#[derive(Debug, Clone)]
pub struct ServedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub at: Instant,
}

impl ServedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal HTTP/1.1 server on a loopback port. Each connection carries one
/// request; `respond` gets the request and its 0-based arrival index and
/// returns the raw response bytes.
pub struct TestServer {
    pub base: String,
    requests: std::sync::Arc<Mutex<Vec<ServedRequest>>>,
}

impl TestServer {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&ServedRequest, usize) -> Vec<u8> + Send + Sync + 'static,
    {
        use std::sync::Arc;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let requests: Arc<Mutex<Vec<ServedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(respond);

        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                let respond = Arc::clone(&respond);
                tokio::spawn(async move {
                    let _ = serve_one(stream, seen, respond).await;
                });
            }
        });

        Self { base, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn requests(&self) -> Vec<ServedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_one<F>(
    mut stream: tokio::net::TcpStream,
    seen: std::sync::Arc<Mutex<Vec<ServedRequest>>>,
    respond: std::sync::Arc<F>,
) -> std::io::Result<()>
where
    F: Fn(&ServedRequest, usize) -> Vec<u8>,
{
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let request = ServedRequest {
        method,
        target,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
        at: Instant::now(),
    };
    let index = {
        let mut seen = seen.lock().unwrap();
        seen.push(request.clone());
        seen.len() - 1
    };

    stream.write_all(&respond(&request, index)).await?;
    stream.shutdown().await
}

/// A complete response with a fixed length body.
pub fn http_response(status: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n", status, body.len());
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out.into_bytes()
}

/// A 200 response streaming `total` bytes in chunked encoding, with no
/// declared length.
pub fn chunked_response(total: usize) -> Vec<u8> {
    let mut out = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
    let piece = vec![b'a'; 64 * 1024];
    let mut left = total;
    while left > 0 {
        let n = left.min(piece.len());
        out.extend_from_slice(format!("{:x}\r\n", n).as_bytes());
        out.extend_from_slice(&piece[..n]);
        out.extend_from_slice(b"\r\n");
        left -= n;
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}
