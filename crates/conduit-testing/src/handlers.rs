//! Scripted event handlers for exercising delivery paths.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use async_trait::async_trait;
use conduit_bus::{EventHandler, HandlerError};
use conduit_core::envelope::Envelope;

/// Handler that records every envelope it receives.
#[derive(Default)]
pub struct CountingHandler {
    received: Mutex<Vec<Envelope>>,
}

impl CountingHandler {
    /// Creates an empty counting handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes handled so far.
    pub fn count(&self) -> usize {
        self.received.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Snapshot of everything handled so far, in arrival order.
    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        if let Ok(mut received) = self.received.lock() {
            received.push(envelope.clone());
        }
        Ok(())
    }
}

enum FailureMode {
    /// Always fails with a transient error.
    AlwaysTransient,
    /// Always fails with a permanent error.
    AlwaysPermanent,
    /// Fails transiently for the first N deliveries, then succeeds.
    TransientFirst(usize),
}

/// Handler that fails according to a script, for retry and DLQ tests.
pub struct FailingHandler {
    mode: FailureMode,
    attempts: AtomicUsize,
}

impl FailingHandler {
    /// Fails every delivery with a transient error.
    pub fn transient() -> Self {
        Self { mode: FailureMode::AlwaysTransient, attempts: AtomicUsize::new(0) }
    }

    /// Fails every delivery with a permanent error.
    pub fn permanent() -> Self {
        Self { mode: FailureMode::AlwaysPermanent, attempts: AtomicUsize::new(0) }
    }

    /// Fails the first `n` deliveries transiently, then succeeds.
    pub fn transient_first(n: usize) -> Self {
        Self { mode: FailureMode::TransientFirst(n), attempts: AtomicUsize::new(0) }
    }

    /// Number of deliveries attempted against this handler.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FailingHandler {
    async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.mode {
            FailureMode::AlwaysTransient => {
                Err(HandlerError::transient(format!("scripted failure on attempt {attempt}")))
            },
            FailureMode::AlwaysPermanent => {
                Err(HandlerError::permanent(format!("scripted failure on attempt {attempt}")))
            },
            FailureMode::TransientFirst(n) if attempt <= n => {
                Err(HandlerError::transient(format!("scripted failure on attempt {attempt}")))
            },
            FailureMode::TransientFirst(_) => Ok(()),
        }
    }
}
