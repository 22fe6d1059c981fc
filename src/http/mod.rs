//! HTTP client module
//!
//! Provides client construction and request dispatch for the load
//! engine.

mod client;

pub use client::{build_client, issue, CapturedResponse, HttpError, MAX_BODY_BYTES};
