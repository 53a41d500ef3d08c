//! Error types for the sandbox core.

use crate::policy::Demand;
use thiserror::Error;

/// Errors that can occur while loading, running or tearing down a sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The resolved unit has no runnable entry point (it is a library).
    #[error("There is no entry point in {0}; it seems to be a library, not an application")]
    MissingEntryPoint(String),

    /// Untrusted code attempted an action outside its restriction policy.
    #[error("Capability violation: {demand} was denied ({detail})")]
    CapabilityViolation { demand: Demand, detail: String },

    /// Any other fault raised by the untrusted code itself.
    #[error("Unhandled fault in unit: {0}")]
    UnhandledUnitFault(String),

    /// Execution stopped because the boundary was torn down.
    #[error("Execution aborted: the sandbox was destroyed")]
    Aborted,

    /// Unit file not found at the specified path.
    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    /// Unit image failed to parse or validate.
    #[error("Invalid unit: {0}")]
    InvalidUnit(String),

    /// A policy value does not match the catalog's value kind.
    #[error("Policy mismatch: {0}")]
    PolicyMismatch(String),

    /// A capability name is not in the catalog.
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// The context already holds an executable unit.
    #[error("Context already bound to unit {0}")]
    ContextAlreadyBound(String),

    /// The context was destroyed and cannot be used.
    #[error("Context has been destroyed")]
    ContextDestroyed,

    /// The boundary could not be created.
    #[error("Invalid boundary: {0}")]
    InvalidBoundary(String),

    /// The worker behind a handle is gone.
    #[error("Sandbox boundary closed")]
    BoundaryClosed,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse classification of a [`SandboxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    MissingEntryPoint,
    CapabilityViolation,
    UnhandledUnitFault,
    Aborted,
    Load,
    Policy,
    Lifecycle,
    Config,
    Io,
}

impl SandboxError {
    /// Classify this error.
    pub fn kind(&self) -> FaultKind {
        match self {
            SandboxError::MissingEntryPoint(_) => FaultKind::MissingEntryPoint,
            SandboxError::CapabilityViolation { .. } => FaultKind::CapabilityViolation,
            SandboxError::UnhandledUnitFault(_) => FaultKind::UnhandledUnitFault,
            SandboxError::Aborted => FaultKind::Aborted,
            SandboxError::UnitNotFound(_) | SandboxError::InvalidUnit(_) => FaultKind::Load,
            SandboxError::PolicyMismatch(_) | SandboxError::UnknownCapability(_) => {
                FaultKind::Policy
            }
            SandboxError::ContextAlreadyBound(_)
            | SandboxError::ContextDestroyed
            | SandboxError::InvalidBoundary(_)
            | SandboxError::BoundaryClosed => FaultKind::Lifecycle,
            SandboxError::Config(_) | SandboxError::Toml(_) => FaultKind::Config,
            SandboxError::Io(_) | SandboxError::Json(_) => FaultKind::Io,
        }
    }

    /// Whether this fault was raised by untrusted code during invocation.
    pub fn is_unit_fault(&self) -> bool {
        matches!(
            self.kind(),
            FaultKind::CapabilityViolation | FaultKind::UnhandledUnitFault | FaultKind::Aborted
        )
    }

    /// The denied demand, for capability violations.
    pub fn demand(&self) -> Option<&Demand> {
        match self {
            SandboxError::CapabilityViolation { demand, .. } => Some(demand),
            _ => None,
        }
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
