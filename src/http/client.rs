//! HTTP client for benchmark dispatch
//!
//! Builds the per-server reqwest client and issues pre-resolved
//! testcase requests with a bounded response read.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method};
use thiserror::Error;

use crate::models::{RequestBody, Testcase};

/// Responses are read up to this many bytes, then discarded.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Idle connections are dropped after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// HTTP dispatch errors.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("connection refused to {0}")]
    ConnectionRefused(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Build a client sized for a worker pool.
///
/// Connection pool holds `workers * 2` idle connections per host;
/// HTTP/2 is disabled so multiplexing does not skew per-request
/// latencies.
pub fn build_client(workers: usize, request_timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(request_timeout)
        .pool_max_idle_per_host(workers.max(1) * 2)
        .pool_idle_timeout(IDLE_TIMEOUT)
        .http1_only()
        .build()
        .context("Failed to create HTTP client")
}

/// A captured response: status, headers, and a body truncated at
/// [`MAX_BODY_BYTES`].
#[derive(Clone, Debug)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedResponse {
    /// Look up a header value, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Issue one pre-resolved testcase and capture the response.
///
/// The per-request timeout is applied here on top of the client-level
/// timeout so every call is individually bounded.
pub async fn issue(
    client: &Client,
    tc: &Testcase,
    request_timeout: Duration,
) -> Result<CapturedResponse, HttpError> {
    let method = Method::from_bytes(tc.method.as_bytes())
        .map_err(|_| HttpError::InvalidRequest(format!("invalid method {}", tc.method)))?;

    let mut headers = HeaderMap::with_capacity(tc.headers.len() + 2);
    for (name, value) in &tc.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HttpError::InvalidRequest(format!("invalid header name {name}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| HttpError::InvalidRequest(format!("invalid header value for {name}")))?;
        headers.insert(header_name, header_value);
    }

    if let Some(ct) = tc.body.content_type() {
        if !headers.contains_key(CONTENT_TYPE) {
            let value = HeaderValue::from_str(ct)
                .map_err(|_| HttpError::InvalidRequest(format!("invalid content type {ct}")))?;
            headers.insert(CONTENT_TYPE, value);
        }
    }
    if let Some(accept) = tc.expect.accept() {
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static(accept));
        }
    }

    let mut builder = client
        .request(method, tc.url.clone())
        .headers(headers)
        .timeout(request_timeout);

    builder = match &tc.body {
        RequestBody::None => builder,
        RequestBody::Json(body) => builder.body(body.clone()),
        RequestBody::Form(body) => builder.body(body.clone()),
        RequestBody::Multipart { body, .. } => builder.body(body.clone()),
    };

    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            HttpError::Timeout(request_timeout)
        } else if e.is_connect() {
            HttpError::ConnectionRefused(tc.url.to_string())
        } else {
            HttpError::RequestFailed(e.to_string())
        }
    })?;

    let status = response.status().as_u16();
    let response_headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();

    let body = read_capped(response, request_timeout).await?;

    Ok(CapturedResponse {
        status,
        headers: response_headers,
        body,
    })
}

/// Read the response body in chunks, stopping at [`MAX_BODY_BYTES`].
/// Oversized tails are drained and discarded so the connection can be
/// reused.
async fn read_capped(
    mut response: reqwest::Response,
    request_timeout: Duration,
) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if body.len() < MAX_BODY_BYTES {
                    let take = (MAX_BODY_BYTES - body.len()).min(chunk.len());
                    body.extend_from_slice(&chunk[..take]);
                }
            }
            Ok(None) => break,
            Err(e) => {
                if e.is_timeout() {
                    return Err(HttpError::Timeout(request_timeout));
                }
                return Err(HttpError::RequestFailed(e.to_string()));
            }
        }
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client() {
        assert!(build_client(8, Duration::from_secs(5)).is_ok());
        // Zero workers still yields a usable pool.
        assert!(build_client(0, Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_captured_response_header_lookup() {
        let resp = CapturedResponse {
            status: 200,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: b"{}".to_vec(),
        };
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.header("X-Missing"), None);
        assert_eq!(resp.text(), "{}");
    }
}
