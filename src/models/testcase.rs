//! Resolved test cases
//!
//! A `Testcase` is a fully pre-built request: URL resolved against the
//! server base, headers canonicalized, body serialized once. Workers
//! clone nothing but cheap references from it on the hot path.

use indexmap::IndexMap;
use serde_json::Value;
use url::Url;

/// Pre-computed request payload.
///
/// Bodies are serialized at resolution time so the dispatch loop never
/// re-encodes per request.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    /// No payload.
    None,
    /// JSON payload, already serialized.
    Json(String),
    /// `application/x-www-form-urlencoded` payload, already encoded.
    Form(String),
    /// Multipart payload with its boundary-bearing content type.
    Multipart { content_type: String, body: Vec<u8> },
}

impl RequestBody {
    /// Short tag for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestBody::None => "none",
            RequestBody::Json(_) => "json",
            RequestBody::Form(_) => "form",
            RequestBody::Multipart { .. } => "multipart",
        }
    }

    /// Content-Type header implied by the payload, if any.
    pub fn content_type(&self) -> Option<&str> {
        match self {
            RequestBody::None => None,
            RequestBody::Json(_) => Some("application/json"),
            RequestBody::Form(_) => Some("application/x-www-form-urlencoded"),
            RequestBody::Multipart { content_type, .. } => Some(content_type),
        }
    }
}

/// Expected response shape.
#[derive(Clone, Debug, Default)]
pub struct Expectation {
    /// Expected HTTP status code (100-599).
    pub status: u16,

    /// Expected headers. `Content-Type` matches by substring, all
    /// others by equality after trimming.
    pub headers: IndexMap<String, String>,

    /// Expected JSON body. Objects match as a recursive subset of the
    /// actual body; arrays and primitives match exactly.
    pub body: Option<Value>,

    /// Expected plain-text body, compared after trimming.
    pub text: Option<String>,
}

impl Expectation {
    /// Default `Accept` header value derived from the expected body.
    pub fn accept(&self) -> Option<&'static str> {
        if self.body.is_some() {
            Some("application/json")
        } else if self.text.is_some() {
            Some("text/plain")
        } else {
            None
        }
    }
}

/// A fully resolved, immutable request ready to dispatch.
#[derive(Clone, Debug)]
pub struct Testcase {
    /// Report name: endpoint name plus database/variation suffixes.
    pub name: String,

    /// Declared endpoint name this testcase was expanded from.
    pub endpoint: String,

    /// Uppercased HTTP method.
    pub method: String,

    /// Absolute URL with the query string already encoded.
    pub url: Url,

    /// Canonicalized request headers.
    pub headers: IndexMap<String, String>,

    /// Pre-built payload.
    pub body: RequestBody,

    /// Expected response.
    pub expect: Expectation,
}

impl Testcase {
    /// Path component of the resolved URL.
    pub fn path(&self) -> &str {
        self.url.path()
    }
}

/// Canonicalize a header name: trimmed, each dash-separated segment
/// capitalized (`x-api-key` -> `X-Api-Key`). Idempotent.
pub fn canonical_header_name(name: &str) -> String {
    name.trim()
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonicalize a full header map: names canonicalized, values trimmed.
pub fn canonicalize_headers(headers: &IndexMap<String, String>) -> IndexMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (canonical_header_name(k), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("  x-api-key "), "X-Api-Key");
        assert_eq!(canonical_header_name("ACCEPT"), "Accept");
    }

    #[test]
    fn test_canonicalize_idempotent() {
        let mut headers = IndexMap::new();
        headers.insert(" x-version ".to_string(), " v1 ".to_string());
        headers.insert("CONTENT-type".to_string(), "application/json".to_string());

        let once = canonicalize_headers(&headers);
        let twice = canonicalize_headers(&once);
        assert_eq!(once, twice);
        assert_eq!(once.get("X-Version").map(String::as_str), Some("v1"));
    }

    #[test]
    fn test_request_body_content_type() {
        assert_eq!(RequestBody::None.content_type(), None);
        assert_eq!(
            RequestBody::Json("{}".into()).content_type(),
            Some("application/json")
        );
        let mp = RequestBody::Multipart {
            content_type: "multipart/form-data; boundary=abc".into(),
            body: Vec::new(),
        };
        assert_eq!(mp.content_type(), Some("multipart/form-data; boundary=abc"));
    }

    #[test]
    fn test_expectation_accept() {
        let json = Expectation {
            status: 200,
            body: Some(serde_json::json!({"ok": true})),
            ..Default::default()
        };
        assert_eq!(json.accept(), Some("application/json"));

        let text = Expectation {
            status: 200,
            text: Some("pong".into()),
            ..Default::default()
        };
        assert_eq!(text.accept(), Some("text/plain"));

        assert_eq!(Expectation::default().accept(), None);
    }
}
