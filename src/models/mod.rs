//! Data models for the benchmarking harness
//!
//! This module contains all data structures used throughout the
//! application: resolved testcases, server definitions, and report
//! records.

mod report;
mod server;
mod testcase;

pub use report::{
    nearest_rank, CapacityReport, ConfigSummary, EndpointReport, GaugeStats, MetaInfo, MetaReport,
    MetaSummary, ResourceStats, SequenceReport, ServerReport, Stats, StepStats, TimedLatency,
};
pub use server::{
    CapacitySettings, LoadBound, ResolvedSequence, ResolvedServer, SequenceStep, VarKind, VarSpec,
    WarmupSettings,
};
pub use testcase::{
    canonical_header_name, canonicalize_headers, Expectation, RequestBody, Testcase,
};
