//! In-process HTTP stub server for async tests
//!
//! A minimal HTTP/1.1 responder over a raw tokio listener, so engine
//! tests can exercise real sockets without external processes.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use url::Url;

use crate::models::{Expectation, RequestBody, Testcase};

/// A parsed inbound request handed to the responder.
#[derive(Clone, Debug)]
pub struct StubRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StubRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Response the stub will write back.
#[derive(Clone, Debug)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl StubResponse {
    pub fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: value.to_string().into_bytes(),
            delay: Duration::ZERO,
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: body.as_bytes().to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Stub server bound to an ephemeral localhost port.
pub struct StubServer {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl StubServer {
    /// Spawn with a responder called once per request.
    pub async fn spawn<F>(responder: F) -> Self
    where
        F: Fn(StubRequest) -> StubResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let responder = Arc::new(responder);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let responder = responder.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(socket, responder).await;
                });
            }
        });

        Self { addr, handle }
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{}", self.addr, path)).expect("stub url")
    }

    pub fn base_url(&self) -> Url {
        self.url("/")
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    responder: Arc<dyn Fn(StubRequest) -> StubResponse + Send + Sync>,
) -> std::io::Result<()> {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 4096];

    loop {
        // Accumulate until the header block is complete.
        let header_end = loop {
            if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                break pos;
            }
            let n = socket.read(&mut tmp).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&tmp[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or_default().to_string();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("GET").to_string();
        let path = parts.next().unwrap_or("/").to_string();

        let headers: Vec<(String, String)> = lines
            .filter_map(|line| {
                line.split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect();

        let content_length: usize = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);

        let body_start = header_end + 4;
        while buf.len() < body_start + content_length {
            let n = socket.read(&mut tmp).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&tmp[..n]);
        }
        let body = buf[body_start..body_start + content_length].to_vec();
        buf.drain(..body_start + content_length);

        let response = responder(StubRequest {
            method,
            path,
            headers,
            body,
        });

        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }

        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n",
            response.status,
            reason(response.status),
            response.body.len()
        );
        for (name, value) in &response.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");

        socket.write_all(out.as_bytes()).await?;
        socket.write_all(&response.body).await?;
        socket.flush().await?;
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Build a minimal testcase pointing at a stub server.
pub fn stub_testcase(
    server: &StubServer,
    name: &str,
    method: &str,
    path: &str,
    expected_status: u16,
) -> Testcase {
    Testcase {
        name: name.to_string(),
        endpoint: name.to_string(),
        method: method.to_string(),
        url: server.url(path),
        headers: indexmap::IndexMap::new(),
        body: RequestBody::None,
        expect: Expectation {
            status: expected_status,
            ..Default::default()
        },
    }
}

// Builder-style tweaks used only from tests.
impl Testcase {
    pub fn with_expected_body(mut self, body: Value) -> Self {
        self.expect.body = Some(body);
        self
    }

    pub fn with_expected_text(mut self, text: &str) -> Self {
        self.expect.text = Some(text.to_string());
        self
    }

    pub fn with_expected_header(mut self, name: &str, value: &str) -> Self {
        self.expect
            .headers
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_json_body(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stub_round_trip() {
        let server = StubServer::spawn(|req| {
            if req.path == "/echo" && req.method == "POST" {
                StubResponse::json(200, req.json().unwrap_or(Value::Null))
            } else {
                StubResponse::text(404, "nope")
            }
        })
        .await;

        let client = reqwest::Client::new();
        let resp = client
            .post(server.url("/echo"))
            .json(&json!({"a": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"a": 1}));

        let resp = client.get(server.url("/missing")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }
}
