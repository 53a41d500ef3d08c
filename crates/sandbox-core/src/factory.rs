//! Creation and teardown of isolation boundaries.
//!
//! Each boundary gets a dedicated worker thread that constructs and owns its
//! [`IsolatedContext`]. Callers talk to it only through a [`SandboxHandle`],
//! which forwards requests over a channel and awaits the replies. Nothing
//! belonging to the context is shared with the caller.

use crate::config::SandboxConfig;
use crate::context::{ContextReport, InvocationArguments, IsolatedContext, RunOutcome};
use crate::error::{SandboxError, SandboxResult};
use crate::policy::RestrictionPolicy;
use crate::unit::UnitLoader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Where a boundary takes its configuration from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// The creating factory's configuration.
    #[default]
    Inherit,
    /// A configuration file of its own.
    File(PathBuf),
}

/// Parameters for a new boundary.
#[derive(Debug, Clone)]
pub struct BoundarySpec {
    pub name: String,
    /// Falls back to the configured `default_base_dir` when unset.
    pub base_dir: Option<PathBuf>,
    /// Falls back to the configured default policy when unset.
    pub policy: Option<RestrictionPolicy>,
    pub config: ConfigSource,
}

impl BoundarySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_dir: None,
            policy: None,
            config: ConfigSource::Inherit,
        }
    }

    /// Boundary named after a unit file, rooted at the file's directory.
    pub fn for_unit(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sandbox".to_string());
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::new(name).with_base_dir(base_dir)
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn with_policy(mut self, policy: RestrictionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_config(mut self, config: ConfigSource) -> Self {
        self.config = config;
        self
    }
}

/// Requests forwarded to a boundary's worker.
enum Request {
    LoadAndRun {
        path: PathBuf,
        args: InvocationArguments,
        reply: oneshot::Sender<SandboxResult<RunOutcome>>,
    },
    Describe {
        reply: oneshot::Sender<ContextReport>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

/// Creates boundaries from a shared base configuration.
#[derive(Debug, Clone, Default)]
pub struct ContextFactory {
    config: SandboxConfig,
}

impl ContextFactory {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Create a boundary and start its worker.
    pub fn create(&self, spec: BoundarySpec) -> SandboxResult<SandboxHandle> {
        let config = match &spec.config {
            ConfigSource::Inherit => self.config.clone(),
            ConfigSource::File(path) => SandboxConfig::load(path)?,
        };

        let base_dir = spec
            .base_dir
            .or_else(|| config.sandbox.default_base_dir.clone())
            .ok_or_else(|| {
                SandboxError::InvalidBoundary(format!("sandbox '{}' has no base directory", spec.name))
            })?;
        if !base_dir.is_dir() {
            return Err(SandboxError::InvalidBoundary(format!(
                "base directory {} does not exist",
                base_dir.display()
            )));
        }

        let policy = spec.policy.unwrap_or_else(|| config.policy.clone());
        let max_call_depth = config.sandbox.max_call_depth;
        let id = Uuid::new_v4();
        let name = spec.name;
        let abort = Arc::new(AtomicBool::new(false));
        let (requests, receiver) = mpsc::unbounded_channel();

        let worker = {
            let name = name.clone();
            let base_dir = base_dir.clone();
            let abort = Arc::clone(&abort);
            thread::Builder::new()
                .name(format!("sandbox-{}", name))
                .spawn(move || {
                    let context = IsolatedContext::with_id(id, name, base_dir, policy)
                        .with_max_call_depth(max_call_depth)
                        .with_abort_flag(abort);
                    run_worker(context, receiver);
                })?
        };

        info!(sandbox = %id, "Created sandbox '{}' at {}", name, base_dir.display());

        Ok(SandboxHandle {
            id,
            name,
            base_dir,
            requests,
            abort,
            worker: Some(worker),
        })
    }

    /// Tear a boundary down and wait for its worker to exit.
    pub async fn destroy(&self, mut handle: SandboxHandle) -> SandboxResult<()> {
        handle.shutdown().await
    }
}

fn run_worker(mut context: IsolatedContext, mut requests: mpsc::UnboundedReceiver<Request>) {
    debug!(sandbox = %context.id(), "Sandbox worker started");

    while let Some(request) = requests.blocking_recv() {
        match request {
            Request::LoadAndRun { path, args, reply } => {
                let path = if path.is_absolute() {
                    path
                } else {
                    context.base_dir().join(path)
                };
                let result =
                    UnitLoader::resolve(&path).and_then(|unit| context.load_and_run(unit, args));
                let _ = reply.send(result);
            }
            Request::Describe { reply } => {
                let _ = reply.send(context.report());
            }
            Request::Destroy { reply } => {
                context.destroy();
                let _ = reply.send(());
                break;
            }
        }
    }

    // Also reached when every handle is gone without a destroy.
    context.destroy();
    debug!(sandbox = %context.id(), "Sandbox worker exited");
}

/// Proxy to a boundary. Dropping it tears the boundary down.
pub struct SandboxHandle {
    id: Uuid,
    name: String,
    base_dir: PathBuf,
    requests: mpsc::UnboundedSender<Request>,
    abort: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SandboxHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Load the unit at `path` inside the boundary and run it.
    ///
    /// Relative paths resolve against the boundary's base directory.
    pub async fn load_and_run(
        &self,
        path: impl Into<PathBuf>,
        args: impl Into<InvocationArguments>,
    ) -> SandboxResult<RunOutcome> {
        let (reply, response) = oneshot::channel();
        self.send(Request::LoadAndRun {
            path: path.into(),
            args: args.into(),
            reply,
        })?;
        response.await.map_err(|_| SandboxError::BoundaryClosed)?
    }

    /// Current state of the boundary's context.
    pub async fn report(&self) -> SandboxResult<ContextReport> {
        let (reply, response) = oneshot::channel();
        self.send(Request::Describe { reply })?;
        response.await.map_err(|_| SandboxError::BoundaryClosed)
    }

    fn send(&self, request: Request) -> SandboxResult<()> {
        self.requests
            .send(request)
            .map_err(|_| SandboxError::BoundaryClosed)
    }

    async fn shutdown(&mut self) -> SandboxResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        // Interrupts a running unit so the worker can reach the destroy.
        self.abort.store(true, Ordering::SeqCst);
        let (reply, ack) = oneshot::channel();
        if self.requests.send(Request::Destroy { reply }).is_ok() {
            let _ = ack.await;
        }

        let joined = tokio::task::spawn_blocking(move || worker.join())
            .await
            .map_err(|_| SandboxError::BoundaryClosed)?;
        if joined.is_err() {
            error!(sandbox = %self.id, "Sandbox worker panicked");
            return Err(SandboxError::BoundaryClosed);
        }

        info!(sandbox = %self.id, "Destroyed sandbox '{}'", self.name);
        Ok(())
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.worker.take().is_some() {
            self.abort.store(true, Ordering::SeqCst);
            let (reply, _ack) = oneshot::channel();
            let _ = self.requests.send(Request::Destroy { reply });
            debug!(sandbox = %self.id, "Sandbox handle dropped; worker detached");
        }
    }
}
