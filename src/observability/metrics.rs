//! # Cache Metrics
//!
//! Counters for cache decisions and for every soft failure the cache swallows. Nothing
//! in the serving path fails because of a store error, so these counters are how an
//! operator finds out that it happened.
//!
//! Recording goes through the `metrics` facade. Without an installed recorder every
//! call is a no-op, which keeps tests and library users free of exporter setup.

use metrics::{counter, describe_counter};
use std::net::SocketAddr;

use crate::core::error::{ServiceError, ServiceResult};

pub const LOOKUPS_TOTAL: &str = "response_cache_lookups_total";
pub const FILLS_TOTAL: &str = "response_cache_fills_total";
pub const STORE_ERRORS_TOTAL: &str = "response_cache_store_errors_total";
pub const INVALIDATIONS_TOTAL: &str = "response_cache_invalidations_total";
pub const WRITE_BACK_COMMITS_TOTAL: &str = "response_cache_write_back_commits_total";
pub const WRITE_BACK_LOST_WRITES_TOTAL: &str = "response_cache_write_back_lost_writes_total";
pub const COALESCED_READS_TOTAL: &str = "response_cache_coalesced_reads_total";

/// How a cached route resolved a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// No namespace, cache skipped
    Bypass,
    /// Validator matched, 304 sent
    NotModified,
    /// Stored body served
    Hit,
    /// Handler executed
    Miss,
}

impl LookupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupOutcome::Bypass => "bypass",
            LookupOutcome::NotModified => "not_modified",
            LookupOutcome::Hit => "hit",
            LookupOutcome::Miss => "miss",
        }
    }
}

/// Store operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Get,
    Put,
    Del,
    DelGroup,
    Compress,
    Decompress,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::Get => "get",
            StoreOperation::Put => "put",
            StoreOperation::Del => "del",
            StoreOperation::DelGroup => "del_group",
            StoreOperation::Compress => "compress",
            StoreOperation::Decompress => "decompress",
        }
    }
}

pub fn record_lookup(outcome: LookupOutcome) {
    counter!(LOOKUPS_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

pub fn record_fill() {
    counter!(FILLS_TOTAL).increment(1);
}

pub fn record_store_error(operation: StoreOperation) {
    counter!(STORE_ERRORS_TOTAL, "operation" => operation.as_str()).increment(1);
}

pub fn record_invalidation(groups: usize) {
    counter!(INVALIDATIONS_TOTAL).increment(groups as u64);
}

pub fn record_coalesced_read() {
    counter!(COALESCED_READS_TOTAL).increment(1);
}

/// Record the outcome of one write-back commit
pub fn record_commit(writes: usize, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!(WRITE_BACK_COMMITS_TOTAL, "result" => result).increment(1);
    if !ok {
        counter!(WRITE_BACK_LOST_WRITES_TOTAL).increment(writes as u64);
    }
}

/// Register descriptions for every counter above
pub fn describe_metrics() {
    describe_counter!(LOOKUPS_TOTAL, "Cached route lookups by outcome");
    describe_counter!(FILLS_TOTAL, "Responses written to the cache");
    describe_counter!(STORE_ERRORS_TOTAL, "Soft cache failures by operation");
    describe_counter!(INVALIDATIONS_TOTAL, "Cache groups invalidated");
    describe_counter!(WRITE_BACK_COMMITS_TOTAL, "Write-back batch commits by result");
    describe_counter!(
        WRITE_BACK_LOST_WRITES_TOTAL,
        "Writes discarded because their batch failed to commit"
    );
    describe_counter!(COALESCED_READS_TOTAL, "Reads served by another caller's in-flight read");
}

/// Install the Prometheus exporter with its own HTTP listener
pub fn install_prometheus_exporter(address: &str) -> ServiceResult<()> {
    let address: SocketAddr = address
        .parse()
        .map_err(|e| {
            ServiceError::config(format!("Invalid metrics_address '{}': {}", address, e))
        })?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| {
            ServiceError::observability(format!("Failed to install Prometheus exporter: {}", e))
        })?;

    describe_metrics();
    Ok(())
}
