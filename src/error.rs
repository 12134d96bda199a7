//! Link-scoped error accumulation.
//!
//! Configuration and consistency problems are recoverable: they are reported
//! here and counted, and the link keeps going so that one pass surfaces as
//! many diagnostics as possible. A non-zero count suppresses the output file
//! and the ABI. I/O failures are fatal and propagate as `anyhow::Error`.

use std::cell::Cell;
use std::fmt::Display;

/// Collects recoverable link errors. Threaded explicitly through the writer
/// rather than living in a process-wide singleton, so tests stay
/// deterministic.
#[derive(Default)]
pub struct ErrorSink {
    count: Cell<u32>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a recoverable error and keep linking.
    pub fn error(&self, msg: impl Display) {
        tracing::error!("{msg}");
        self.count.set(self.count.get() + 1);
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn ok(&self) -> bool {
        self.count.get() == 0
    }
}
