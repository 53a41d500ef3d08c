//! Bounded privilege elevation for fault diagnostics.
//!
//! Some faults can only be described in detail with capabilities the failing
//! unit was denied (inspecting its call stack, for instance). The
//! [`FaultEscalator`] elevates to the unrestricted set just long enough to
//! extract that detail and reverts before returning. It never recovers from
//! or replaces the fault.

use crate::error::{FaultKind, SandboxError, SandboxResult};
use chrono::{DateTime, Utc};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Elevation flag shared between a context's gate and its escalator.
#[derive(Debug, Clone, Default)]
pub struct ElevationState {
    elevated: Arc<AtomicBool>,
}

impl ElevationState {
    pub fn is_elevated(&self) -> bool {
        self.elevated.load(Ordering::SeqCst)
    }

    /// Elevate to the unrestricted set until the guard is reverted or dropped.
    ///
    /// If already elevated, the returned guard is inert and leaves the outer
    /// elevation in place.
    pub fn elevate(&self) -> ElevationGuard {
        let acquired = !self.elevated.swap(true, Ordering::SeqCst);
        ElevationGuard {
            state: self.clone(),
            active: acquired,
        }
    }

    /// Drop any elevation. No-op when nothing is elevated.
    pub fn revert(&self) {
        self.elevated.store(false, Ordering::SeqCst);
    }
}

/// Scoped elevation. Reverts on [`revert`](Self::revert) or drop.
#[derive(Debug)]
pub struct ElevationGuard {
    state: ElevationState,
    active: bool,
}

impl ElevationGuard {
    /// Revert now. Calling it again is a no-op.
    pub fn revert(&mut self) {
        if self.active {
            self.state.revert();
            self.active = false;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for ElevationGuard {
    fn drop(&mut self) {
        self.revert();
    }
}

/// Enriched information about a fault.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: FaultKind,
    pub message: String,
    /// Denied demand, for capability violations.
    pub demand: Option<String>,
    /// Unit call stack at the fault, innermost last.
    pub stack: Vec<String>,
    /// Policy in force when the fault was raised.
    pub policy: String,
    /// Set when the stack could not be extracted.
    pub extraction_error: Option<String>,
    pub raised_at: DateTime<Utc>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(demand) = &self.demand {
            writeln!(f, "  denied demand: {}", demand)?;
        }
        writeln!(f, "  policy: {}", self.policy)?;
        for frame in self.stack.iter().rev() {
            writeln!(f, "  at {}", frame)?;
        }
        if let Some(err) = &self.extraction_error {
            writeln!(f, "  (stack unavailable: {})", err)?;
        }
        write!(f, "  raised at {}", self.raised_at.to_rfc3339())
    }
}

/// Produces diagnostics under a short, always-reverted elevation.
#[derive(Debug, Clone)]
pub struct FaultEscalator {
    elevation: ElevationState,
}

impl FaultEscalator {
    pub fn new(elevation: ElevationState) -> Self {
        Self { elevation }
    }

    pub fn elevation(&self) -> &ElevationState {
        &self.elevation
    }

    /// Build a diagnostic for `fault`.
    ///
    /// `extract` runs while elevated and returns the rendered call stack. The
    /// elevation is reverted before this returns, whether the extraction succeeds,
    /// fails or panics. `fault` itself is only read.
    pub fn enrich<F>(&self, fault: &SandboxError, policy: &str, extract: F) -> Diagnostic
    where
        F: FnOnce() -> SandboxResult<Vec<String>>,
    {
        let mut guard = self.elevation.elevate();
        debug!("Elevated for fault diagnostics");
        let extracted = panic::catch_unwind(AssertUnwindSafe(extract));
        guard.revert();
        debug!("Reverted fault diagnostics elevation");

        let (stack, extraction_error) = match extracted {
            Ok(Ok(stack)) => (stack, None),
            Ok(Err(e)) => (Vec::new(), Some(e.to_string())),
            Err(_) => (Vec::new(), Some("stack extraction panicked".to_string())),
        };

        let diagnostic = Diagnostic {
            kind: fault.kind(),
            message: fault.to_string(),
            demand: fault.demand().map(|d| d.to_string()),
            stack,
            policy: policy.to_string(),
            extraction_error,
            raised_at: Utc::now(),
        };
        warn!("Unit fault: {}", diagnostic);
        diagnostic
    }
}
