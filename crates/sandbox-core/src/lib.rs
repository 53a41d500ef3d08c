//! # sandbox-core
//!
//! Isolated, capability-restricted execution of untrusted units.
//!
//! This crate provides:
//! - A catalog of restrictable capabilities and the restriction policies built from them
//! - Unit loading, validation and entry point resolution
//! - A small interpreter that reaches the host only through a capability gate
//! - Isolated contexts that run a unit's entry point exactly once
//! - Bounded, always-reverted elevation for fault diagnostics
//! - A factory that places each context on its own worker thread
//!
//! ## Unit Structure
//!
//! A unit is a JSON image, optionally prefixed with the `SBU\x01` magic:
//! metadata, a constant pool, functions made of instructions, and the name of
//! an entry function taking either no parameters or a single argument array.
//!
//! ## Security Model
//!
//! Every host call states a demand. The gate checks it against the context's
//! restriction policy and raises a capability violation when it is not
//! covered. Anything not granted is denied. Only the fault escalator may
//! briefly lift this while it extracts a diagnostic, and it always reverts.
//!
//! ```no_run
//! use sandbox_core::{BoundarySpec, ContextFactory, InvocationArguments, SandboxConfig};
//!
//! # async fn run() -> sandbox_core::SandboxResult<()> {
//! let factory = ContextFactory::new(SandboxConfig::load_default()?);
//! let handle = factory.create(BoundarySpec::for_unit("/srv/units/hello.sbu"))?;
//! let result = handle
//!     .load_and_run("hello.sbu", InvocationArguments::from(vec!["--verbose".to_string()]))
//!     .await;
//! factory.destroy(handle).await?;
//! println!("exit code {}", result?.exit_code);
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod escalator;
pub mod factory;
pub mod host;
pub mod policy;
pub mod unit;
pub mod vm;

pub use capability::{CapabilityKind, GrantState, RestrictionValue, RestrictionValueKind};
pub use catalog::CapabilityCatalog;
pub use config::{SandboxConfig, SandboxSettings};
pub use context::{ContextReport, ContextState, InvocationArguments, IsolatedContext, RunOutcome};
pub use error::{FaultKind, SandboxError, SandboxResult};
pub use escalator::{Diagnostic, ElevationGuard, ElevationState, FaultEscalator};
pub use factory::{BoundarySpec, ConfigSource, ContextFactory, SandboxHandle};
pub use host::{HostFunctions, HostGate};
pub use policy::{Demand, RestrictionPolicy};
pub use unit::{EntryPoint, ExecutableUnit, UnitImage, UnitLoader};
pub use vm::{Interpreter, StackFrame, Value};
