//! Host functions exposed to units.
//!
//! Units can only affect the outside world through these calls. Every
//! sensitive call is checked against the context's restriction policy before
//! it runs; a failed check raises [`SandboxError::CapabilityViolation`].

use crate::capability::{CapabilityKind, ReflectionFlags, SecurityFlags, SecurityZone};
use crate::error::{SandboxError, SandboxResult};
use crate::escalator::ElevationState;
use crate::policy::{Demand, RestrictionPolicy};
use crate::vm::{StackFrame, Value};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Directory under the base directory holding per-context isolated storage.
pub const ISOLATED_STORAGE_DIR: &str = ".isolated-storage";

/// Host functions available to units.
pub trait HostFunctions {
    /// Dispatch a host call by name.
    ///
    /// `stack` is the unit's call stack at the point of the call.
    fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        stack: &[StackFrame],
    ) -> SandboxResult<Value>;
}

/// Default host functions implementation with capability checking.
pub struct HostGate {
    /// Context identifier, used for isolated storage and logging.
    context: String,

    /// Directory file access is confined to.
    base_dir: PathBuf,

    /// Restrictions applied to every demand.
    policy: RestrictionPolicy,

    /// Shared with the fault escalator.
    elevation: ElevationState,

    /// Per-context registry hive.
    registry: BTreeMap<String, String>,

    /// Lines printed by the unit.
    output: Vec<String>,

    /// HTTP client, built on first granted web request.
    http_client: Option<reqwest::blocking::Client>,
}

impl HostGate {
    /// Create new host functions for a context.
    pub fn new(
        context: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        policy: RestrictionPolicy,
        elevation: ElevationState,
    ) -> Self {
        Self {
            context: context.into(),
            base_dir: base_dir.into(),
            policy,
            elevation,
            registry: BTreeMap::new(),
            output: Vec::new(),
            http_client: None,
        }
    }

    pub fn policy(&self) -> &RestrictionPolicy {
        &self.policy
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Lines printed so far.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Check a demand against the policy, or pass while elevated.
    pub fn demand(&self, demand: Demand, operation: &str) -> SandboxResult<()> {
        if self.elevation.is_elevated() || self.policy.permits(&demand) {
            return Ok(());
        }
        warn!(
            context = %self.context,
            "Denied {} for {}",
            demand, operation
        );
        Err(SandboxError::CapabilityViolation {
            demand,
            detail: operation.to_string(),
        })
    }

    /// Render a call stack. Requires reflection member access.
    pub fn inspect_stack(&self, stack: &[StackFrame]) -> SandboxResult<Vec<String>> {
        self.demand(
            Demand::reflection(ReflectionFlags::MEMBER_ACCESS),
            "reflect.stack",
        )?;
        Ok(stack.iter().map(|frame| frame.to_string()).collect())
    }

    /// Release everything bound to the context and deny all further demands.
    pub fn reset(&mut self) {
        self.policy = RestrictionPolicy::deny_all();
        self.registry.clear();
        self.output.clear();
        self.http_client = None;
    }

    /// Resolve a unit-supplied path inside the base directory.
    fn confine(&self, operation: &str, path: &str) -> SandboxResult<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        let demand = Demand::granted(CapabilityKind::FileIo);
        if escapes {
            return Err(self.escape(operation, path, demand));
        }
        self.contain(operation, path, demand, self.base_dir.join(relative))
    }

    fn storage_path(&self, operation: &str, key: &str) -> SandboxResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(unit_fault(format!("invalid storage key '{}'", key)));
        }
        let target = self
            .base_dir
            .join(ISOLATED_STORAGE_DIR)
            .join(&self.context)
            .join(key);
        self.contain(
            operation,
            key,
            Demand::granted(CapabilityKind::IsolatedStorage),
            target,
        )
    }

    /// Resolve symlinks in `target` and require the result to stay under the
    /// base directory.
    ///
    /// Components that do not exist yet are appended to their nearest
    /// existing ancestor. A dangling symlink counts as an escape.
    fn contain(
        &self,
        operation: &str,
        shown: &str,
        demand: Demand,
        target: PathBuf,
    ) -> SandboxResult<PathBuf> {
        let root = self
            .base_dir
            .canonicalize()
            .map_err(|e| unit_fault(format!("{}: base directory: {}", operation, e)))?;

        let mut existing = target.as_path();
        let mut missing = Vec::new();
        let resolved = loop {
            match existing.canonicalize() {
                Ok(real) => break missing.iter().rev().fold(real, |acc, part| acc.join(part)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if existing.symlink_metadata().is_ok() {
                        return Err(self.escape(operation, shown, demand));
                    }
                    let (Some(parent), Some(name)) = (existing.parent(), existing.file_name())
                    else {
                        return Err(unit_fault(format!("{}: {}", operation, e)));
                    };
                    missing.push(name);
                    existing = parent;
                }
                Err(e) => return Err(unit_fault(format!("{}: {}", operation, e))),
            }
        };

        if !resolved.starts_with(&root) {
            return Err(self.escape(operation, shown, demand));
        }
        Ok(resolved)
    }

    fn escape(&self, operation: &str, path: &str, demand: Demand) -> SandboxError {
        warn!(context = %self.context, "Path {:?} escapes the base directory", path);
        SandboxError::CapabilityViolation {
            demand,
            detail: format!("{}: '{}' is outside the base directory", operation, path),
        }
    }

    fn http_get(&mut self, url: &str) -> SandboxResult<Value> {
        let client = match self.http_client.take() {
            Some(client) => client,
            None => reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| unit_fault(format!("net.get: failed to build client: {}", e)))?,
        };
        let result = client.get(url).send();
        self.http_client = Some(client);

        let response = result.map_err(|e| unit_fault(format!("net.get failed: {}", e)))?;
        Ok(Value::Int(response.status().as_u16() as i64))
    }
}

impl HostFunctions for HostGate {
    fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        stack: &[StackFrame],
    ) -> SandboxResult<Value> {
        debug!(context = %self.context, "Host call {} ({} args)", name, args.len());

        match name {
            "print" => {
                let line = args
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.output.push(line);
                Ok(Value::Null)
            }
            "file.read" => {
                let path = str_arg(name, &args, 0, 1)?;
                self.demand(Demand::granted(CapabilityKind::FileIo), name)?;
                let path = self.confine(name, path)?;
                std::fs::read_to_string(&path)
                    .map(Value::Str)
                    .map_err(|e| unit_fault(format!("{}: {}", name, e)))
            }
            "file.write" => {
                let path = str_arg(name, &args, 0, 2)?;
                self.demand(Demand::granted(CapabilityKind::FileIo), name)?;
                let path = self.confine(name, path)?;
                let content = args[1].to_string();
                std::fs::write(&path, content)
                    .map(|_| Value::Null)
                    .map_err(|e| unit_fault(format!("{}: {}", name, e)))
            }
            "file.exists" => {
                let path = str_arg(name, &args, 0, 1)?;
                self.demand(Demand::granted(CapabilityKind::FileIo), name)?;
                let path = self.confine(name, path)?;
                Ok(Value::Bool(path.exists()))
            }
            "env.get" => {
                let var = str_arg(name, &args, 0, 1)?;
                self.demand(Demand::granted(CapabilityKind::Environment), name)?;
                Ok(std::env::var(var).map(Value::Str).unwrap_or(Value::Null))
            }
            "net.get" => {
                let url = str_arg(name, &args, 0, 1)?.to_string();
                self.demand(Demand::granted(CapabilityKind::Web), name)?;
                self.http_get(&url)
            }
            "registry.get" => {
                let key = str_arg(name, &args, 0, 1)?;
                self.demand(Demand::granted(CapabilityKind::Registry), name)?;
                Ok(self
                    .registry
                    .get(key)
                    .cloned()
                    .map(Value::Str)
                    .unwrap_or(Value::Null))
            }
            "registry.set" => {
                let key = str_arg(name, &args, 0, 2)?.to_string();
                self.demand(Demand::granted(CapabilityKind::Registry), name)?;
                self.registry.insert(key, args[1].to_string());
                Ok(Value::Null)
            }
            "storage.get" => {
                let key = str_arg(name, &args, 0, 1)?;
                self.demand(Demand::granted(CapabilityKind::IsolatedStorage), name)?;
                let path = self.storage_path(name, key)?;
                match std::fs::read_to_string(&path) {
                    Ok(content) => Ok(Value::Str(content)),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(Value::Null),
                    Err(e) => Err(unit_fault(format!("{}: {}", name, e))),
                }
            }
            "storage.set" => {
                let key = str_arg(name, &args, 0, 2)?;
                self.demand(Demand::granted(CapabilityKind::IsolatedStorage), name)?;
                let path = self.storage_path(name, key)?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| unit_fault(format!("{}: {}", name, e)))?;
                }
                std::fs::write(&path, args[1].to_string())
                    .map(|_| Value::Null)
                    .map_err(|e| unit_fault(format!("{}: {}", name, e)))
            }
            "ui.alert" => {
                let message = str_arg(name, &args, 0, 1)?;
                self.demand(Demand::granted(CapabilityKind::Ui), name)?;
                info!(context = %self.context, "Unit alert: {}", message);
                self.output.push(format!("[alert] {}", message));
                Ok(Value::Null)
            }
            "reflect.stack" => {
                expect_args(name, &args, 0)?;
                let frames = self.inspect_stack(stack)?;
                Ok(Value::Array(frames.into_iter().map(Value::Str).collect()))
            }
            "security.unmanaged" => {
                expect_args(name, &args, 0)?;
                self.demand(Demand::security(SecurityFlags::UNMANAGED_CODE), name)?;
                Ok(Value::Bool(true))
            }
            "identity.zone" => {
                let zone = str_arg(name, &args, 0, 1)?;
                let zone = SecurityZone::parse(zone)
                    .ok_or_else(|| unit_fault(format!("{}: unknown zone '{}'", name, zone)))?;
                self.demand(Demand::zone(zone), name)?;
                Ok(Value::Bool(true))
            }
            other => Err(unit_fault(format!("unknown host function '{}'", other))),
        }
    }
}

fn unit_fault(message: String) -> SandboxError {
    SandboxError::UnhandledUnitFault(message)
}

fn expect_args(name: &str, args: &[Value], count: usize) -> SandboxResult<()> {
    if args.len() != count {
        return Err(unit_fault(format!(
            "{} expects {} arguments, got {}",
            name,
            count,
            args.len()
        )));
    }
    Ok(())
}

/// Check the argument count and return argument `index` as a string.
fn str_arg<'a>(
    name: &str,
    args: &'a [Value],
    index: usize,
    count: usize,
) -> SandboxResult<&'a str> {
    expect_args(name, args, count)?;
    args[index].as_str().ok_or_else(|| {
        unit_fault(format!(
            "{}: argument {} must be a string, got {}",
            name,
            index,
            args[index].type_name()
        ))
    })
}
