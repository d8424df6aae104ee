//! Process-wide counters.
//!
//! Created once at startup and shared by every worker through an `Arc`.
//! Counters are only ever updated with atomic increments; they are an
//! observability side channel and never drive engine decisions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate statistics shared across workers.
#[derive(Debug, Default)]
pub struct Stats {
    accepted: AtomicU64,
    closed: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    io_errors: AtomicU64,
    protocol_errors: AtomicU64,
    accept_errors: AtomicU64,
    submit_retries: AtomicU64,
}

/// Point-in-time copy of `Stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub closed: u64,
    pub requests: u64,
    pub responses: u64,
    pub io_errors: u64,
    pub protocol_errors: u64,
    pub accept_errors: u64,
    pub submit_retries: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn connection_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a parsed request, returning the new total.
    #[inline]
    pub fn request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn response_sent(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn submit_retry(&self) {
        self.submit_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections accepted and not yet closed.
    pub fn active(&self) -> u64 {
        let closed = self.closed.load(Ordering::Relaxed);
        self.accepted.load(Ordering::Relaxed).saturating_sub(closed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let accepted = self.accepted.load(Ordering::Relaxed);
        let closed = self.closed.load(Ordering::Relaxed);
        StatsSnapshot {
            accepted,
            active: accepted.saturating_sub(closed),
            closed,
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            submit_retries: self.submit_retries.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Render as a JSON object.
    pub fn to_json(&self) -> String {
        format!(
            "{{\"accepted\":{},\"active\":{},\"closed\":{},\"requests\":{},\"responses\":{},\
             \"io_errors\":{},\"protocol_errors\":{},\"accept_errors\":{},\"submit_retries\":{}}}",
            self.accepted,
            self.active,
            self.closed,
            self.requests,
            self.responses,
            self.io_errors,
            self.protocol_errors,
            self.accept_errors,
            self.submit_retries,
        )
    }
}
