//! Guest abort reporting.
//!
//! An abort is not a value and is never handed back to the guest. It is
//! reported once to a [`DiagnosticSink`] and the instance is treated as dead.

use alloc::string::String;
use core::fmt;

/// Source position reported by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// An unrecoverable guest signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    pub location: Option<Location>,
    pub message: Option<String>,
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("abort")?;
        if let Some(location) = &self.location {
            write!(f, " at {}", location)?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

/// Receiver of guest aborts.
pub trait DiagnosticSink {
    fn report(&self, abort: &Abort);
}

impl<F: Fn(&Abort)> DiagnosticSink for F {
    fn report(&self, abort: &Abort) {
        self(abort)
    }
}

/// Sink that writes aborts to the error log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, abort: &Abort) {
        log::error!("[Bridge] guest {}", abort);
    }
}

// ── Tests ────────────────────────────────────────────────────────────
