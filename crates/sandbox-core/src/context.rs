//! The isolated execution context.
//!
//! An [`IsolatedContext`] owns one base directory, one restriction policy and
//! at most one executable unit. It runs that unit's entry point exactly once:
//!
//! ```text
//! Created -> Bound -> Running -> Completed | Faulted -> Destroyed
//! ```
//!
//! Transitions only move forward. A faulted context still has to be
//! destroyed by its owner.

use crate::error::{SandboxError, SandboxResult};
use crate::escalator::{Diagnostic, ElevationState, FaultEscalator};
use crate::host::HostGate;
use crate::policy::RestrictionPolicy;
use crate::unit::{EntryPoint, ExecutableUnit};
use crate::vm::{Interpreter, StackFrame, Value, DEFAULT_MAX_CALL_DEPTH};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Bound,
    Running,
    Completed,
    Faulted,
    Destroyed,
}

/// Ordered string arguments for an entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationArguments(Vec<String>);

impl InvocationArguments {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

impl From<Vec<String>> for InvocationArguments {
    fn from(args: Vec<String>) -> Self {
        Self(args)
    }
}

impl From<&[&str]> for InvocationArguments {
    fn from(args: &[&str]) -> Self {
        Self(args.iter().map(|s| s.to_string()).collect())
    }
}

impl<S: Into<String>> FromIterator<S> for InvocationArguments {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Arguments actually passed to the entry function.
///
/// `main()` receives nothing; `main(args)` receives the whole sequence,
/// possibly empty, as its single array argument.
pub fn entry_arguments(entry: EntryPoint, args: &InvocationArguments) -> Vec<Value> {
    match entry {
        EntryPoint::NoArgs { .. } => Vec::new(),
        EntryPoint::WithArgs { .. } => vec![Value::Array(
            args.as_slice().iter().cloned().map(Value::Str).collect(),
        )],
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i64,
    /// Lines the unit printed.
    pub output: Vec<String>,
}

/// Snapshot of a context, safe to hand across the boundary.
#[derive(Debug, Clone)]
pub struct ContextReport {
    pub id: Uuid,
    pub name: String,
    pub base_dir: PathBuf,
    pub state: ContextState,
    /// Name of the bound unit, if any.
    pub unit: Option<String>,
    pub policy: String,
    pub output: Vec<String>,
    pub diagnostic: Option<Diagnostic>,
}

/// One isolation boundary.
pub struct IsolatedContext {
    id: Uuid,
    name: String,
    base_dir: PathBuf,
    state: ContextState,
    unit: Option<ExecutableUnit>,
    gate: HostGate,
    escalator: FaultEscalator,
    abort: Arc<AtomicBool>,
    max_call_depth: usize,
    last_diagnostic: Option<Diagnostic>,
}

impl IsolatedContext {
    /// Create a context with its own base directory and policy.
    pub fn new(
        name: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        policy: RestrictionPolicy,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), name, base_dir, policy)
    }

    /// Like [`new`](Self::new), with a caller-chosen id.
    pub fn with_id(
        id: Uuid,
        name: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        policy: RestrictionPolicy,
    ) -> Self {
        let base_dir = base_dir.into();
        let elevation = ElevationState::default();
        Self {
            id,
            name: name.into(),
            gate: HostGate::new(id.to_string(), base_dir.clone(), policy, elevation.clone()),
            escalator: FaultEscalator::new(elevation),
            base_dir,
            state: ContextState::Created,
            unit: None,
            abort: Arc::new(AtomicBool::new(false)),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            last_diagnostic: None,
        }
    }

    /// Use a caller-owned abort flag.
    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn policy(&self) -> &RestrictionPolicy {
        self.gate.policy()
    }

    pub fn unit(&self) -> Option<&ExecutableUnit> {
        self.unit.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.unit.is_some()
    }

    /// Diagnostic produced for the last fault.
    pub fn last_diagnostic(&self) -> Option<&Diagnostic> {
        self.last_diagnostic.as_ref()
    }

    /// Lines printed by the unit so far.
    pub fn output(&self) -> &[String] {
        self.gate.output()
    }

    /// Whether the escalator currently holds an elevation.
    pub fn is_elevated(&self) -> bool {
        self.escalator.elevation().is_elevated()
    }

    /// Bind `unit` to this context and run its entry point once.
    ///
    /// Any fault from the unit is enriched with a diagnostic and then
    /// returned unchanged.
    pub fn load_and_run(
        &mut self,
        unit: ExecutableUnit,
        args: InvocationArguments,
    ) -> SandboxResult<RunOutcome> {
        self.bind(unit)?;

        let Some(unit) = self.unit.as_ref() else {
            return Err(SandboxError::ContextDestroyed);
        };
        let entry = unit.entry_point();
        let call_args = entry_arguments(entry, &args);
        info!(
            context = %self.id,
            "Running unit '{}' entry '{}' with {} argument(s)",
            unit.name(),
            unit.entry_name(),
            args.len()
        );

        self.state = ContextState::Running;
        let mut interpreter = Interpreter::new(unit.image(), Arc::clone(&self.abort))
            .with_max_call_depth(self.max_call_depth);
        let result = interpreter
            .invoke(entry.function(), call_args, &mut self.gate)
            .and_then(exit_code);
        let frames: Vec<StackFrame> = interpreter.fault_frames().to_vec();

        match result {
            Ok(exit_code) => {
                self.state = ContextState::Completed;
                info!(context = %self.id, "Unit completed with exit code {}", exit_code);
                Ok(RunOutcome {
                    exit_code,
                    output: self.gate.output().to_vec(),
                })
            }
            Err(fault) => {
                self.state = ContextState::Faulted;
                let gate = &self.gate;
                let diagnostic =
                    self.escalator
                        .enrich(&fault, &gate.policy().summary(), || gate.inspect_stack(&frames));
                self.last_diagnostic = Some(diagnostic);
                Err(fault)
            }
        }
    }

    fn bind(&mut self, unit: ExecutableUnit) -> SandboxResult<()> {
        if self.state == ContextState::Destroyed {
            return Err(SandboxError::ContextDestroyed);
        }
        if let Some(bound) = &self.unit {
            return Err(SandboxError::ContextAlreadyBound(bound.name().to_string()));
        }
        debug!(
            context = %self.id,
            "Binding unit '{}' from {:?}",
            unit.name(),
            unit.origin()
        );
        self.unit = Some(unit);
        self.state = ContextState::Bound;
        Ok(())
    }

    /// Snapshot this context.
    pub fn report(&self) -> ContextReport {
        ContextReport {
            id: self.id,
            name: self.name.clone(),
            base_dir: self.base_dir.clone(),
            state: self.state,
            unit: self.unit.as_ref().map(|u| u.name().to_string()),
            policy: self.gate.policy().summary(),
            output: self.gate.output().to_vec(),
            diagnostic: self.last_diagnostic.clone(),
        }
    }

    /// Tear the context down, releasing the unit, policy and host state.
    ///
    /// Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.state == ContextState::Destroyed {
            return;
        }
        self.abort.store(true, Ordering::SeqCst);
        self.escalator.elevation().revert();
        self.unit = None;
        self.gate.reset();
        self.last_diagnostic = None;
        self.state = ContextState::Destroyed;
        info!(context = %self.id, "Destroyed sandbox '{}'", self.name);
    }
}

/// Map the entry function's return value to an exit code.
fn exit_code(value: Value) -> SandboxResult<i64> {
    match value {
        Value::Int(code) => Ok(code),
        Value::Null => Ok(0),
        other => Err(SandboxError::UnhandledUnitFault(format!(
            "entry point returned {}; expected an integer exit code",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityKind, GrantState, ReflectionFlags, RestrictionValue};
    use crate::error::FaultKind;
    use crate::unit::{Constant, Function, Instruction, UnitImage, UnitLoader, UnitMetadata};
    use tempfile::TempDir;

    fn unit(params: &[&str], constants: Vec<Constant>, instructions: Vec<Instruction>) -> ExecutableUnit {
        let image = UnitImage {
            version: 1,
            metadata: UnitMetadata {
                name: "ctx-test".to_string(),
                version: "0.1.0".to_string(),
                compiled_at: None,
                compiler: None,
            },
            constants,
            functions: vec![Function {
                name: "main".to_string(),
                params: params.iter().map(|p| p.to_string()).collect(),
                instructions,
                local_count: 0,
            }],
            entry_point: Some("main".to_string()),
        };
        let bytes = serde_json::to_vec(&image).unwrap();
        UnitLoader::parse(&bytes, Path::new("ctx-test.sbu")).unwrap()
    }

    /// `main(args)`: print(args); return len(args)
    fn echo_args_unit() -> ExecutableUnit {
        unit(
            &["args"],
            vec![],
            vec![
                Instruction::LoadLocal { index: 0 },
                Instruction::Call {
                    name: "print".to_string(),
                    arg_count: 1,
                },
                Instruction::Pop,
                Instruction::LoadLocal { index: 0 },
                Instruction::Len,
                Instruction::Return,
            ],
        )
    }

    /// `main()`: file.write("out.txt", "x")
    fn writer_unit() -> ExecutableUnit {
        unit(
            &[],
            vec![
                Constant::String("out.txt".to_string()),
                Constant::String("x".to_string()),
            ],
            vec![
                Instruction::LoadConst { index: 0 },
                Instruction::LoadConst { index: 1 },
                Instruction::Call {
                    name: "file.write".to_string(),
                    arg_count: 2,
                },
                Instruction::Return,
            ],
        )
    }

    fn context(dir: &TempDir, policy: RestrictionPolicy) -> IsolatedContext {
        IsolatedContext::new("test", dir.path(), policy)
    }

    #[test]
    fn test_entry_arguments_shape() {
        let args: InvocationArguments = ["--verbose", "x"].into_iter().collect();
        assert!(entry_arguments(EntryPoint::NoArgs { function: 0 }, &args).is_empty());
        assert_eq!(
            entry_arguments(EntryPoint::WithArgs { function: 0 }, &args),
            vec![Value::Array(vec![
                Value::Str("--verbose".to_string()),
                Value::Str("x".to_string()),
            ])]
        );
        assert_eq!(
            entry_arguments(EntryPoint::WithArgs { function: 0 }, &InvocationArguments::new()),
            vec![Value::Array(vec![])]
        );
    }

    #[test]
    fn test_invocation_arguments_keep_order() {
        let args = InvocationArguments::from(vec!["b".to_string(), String::new(), "a".to_string()]);
        assert_eq!(args.len(), 3);
        assert_eq!(args.into_inner(), vec!["b", "", "a"]);
    }

    #[test]
    fn test_no_args_entry_runs() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::deny_all());
        let main = unit(
            &[],
            vec![Constant::Int(7)],
            vec![Instruction::LoadConst { index: 0 }, Instruction::Return],
        );

        let outcome = ctx
            .load_and_run(main, ["ignored"].into_iter().collect())
            .unwrap();
        assert_eq!(outcome.exit_code, 7);
        assert_eq!(ctx.state(), ContextState::Completed);
    }

    #[test]
    fn test_args_entry_receives_sequence() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::deny_all());
        let outcome = ctx
            .load_and_run(echo_args_unit(), ["--verbose", "x"].into_iter().collect())
            .unwrap();
        assert_eq!(outcome.exit_code, 2);
        assert_eq!(outcome.output, vec!["[--verbose, x]".to_string()]);
    }

    #[test]
    fn test_args_entry_receives_empty_sequence() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::deny_all());
        let outcome = ctx
            .load_and_run(echo_args_unit(), InvocationArguments::new())
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output, vec!["[]".to_string()]);
    }

    #[test]
    fn test_extra_entry_params_are_null() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::deny_all());
        // main(args, extra): print(extra); return len(args)
        let main = unit(
            &["args", "extra"],
            vec![],
            vec![
                Instruction::LoadLocal { index: 1 },
                Instruction::Call {
                    name: "print".to_string(),
                    arg_count: 1,
                },
                Instruction::Pop,
                Instruction::LoadLocal { index: 0 },
                Instruction::Len,
                Instruction::Return,
            ],
        );
        let outcome = ctx
            .load_and_run(main, ["a", "b", "c"].into_iter().collect())
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.output, vec!["null".to_string()]);
    }

    #[test]
    fn test_violation_is_returned_unchanged_with_diagnostic() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::deny_all());

        let err = ctx
            .load_and_run(writer_unit(), InvocationArguments::new())
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::CapabilityViolation);
        assert_eq!(ctx.state(), ContextState::Faulted);
        assert!(!ctx.is_elevated());
        assert!(!dir.path().join("out.txt").exists());

        let diagnostic = ctx.last_diagnostic().unwrap();
        assert_eq!(diagnostic.message, err.to_string());
        assert_eq!(diagnostic.stack, vec!["main@2".to_string()]);
        assert_eq!(diagnostic.demand.as_deref(), Some("file_io"));
    }

    #[test]
    fn test_granted_policy_allows_write() {
        let dir = TempDir::new().unwrap();
        let policy = RestrictionPolicy::deny_all()
            .with(
                CapabilityKind::FileIo,
                RestrictionValue::State(GrantState::Granted),
            )
            .unwrap();
        let mut ctx = context(&dir, policy);
        ctx.load_and_run(writer_unit(), InvocationArguments::new())
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "x");
    }

    #[test]
    fn test_unit_cannot_read_own_stack_after_enrichment() {
        // The diagnostic elevation must not leak into later demands.
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::deny_all());
        let _ = ctx.load_and_run(writer_unit(), InvocationArguments::new());
        assert!(!ctx
            .policy()
            .permits(&crate::policy::Demand::reflection(ReflectionFlags::MEMBER_ACCESS)));
        assert!(ctx.gate.inspect_stack(&[]).is_err());
    }

    #[test]
    fn test_bad_exit_value_is_fault() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::deny_all());
        let main = unit(
            &[],
            vec![Constant::String("nope".to_string())],
            vec![Instruction::LoadConst { index: 0 }, Instruction::Return],
        );
        let err = ctx.load_and_run(main, InvocationArguments::new()).unwrap_err();
        assert_eq!(err.kind(), FaultKind::UnhandledUnitFault);
        assert_eq!(ctx.state(), ContextState::Faulted);
    }

    #[test]
    fn test_context_runs_at_most_one_unit() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::deny_all());
        ctx.load_and_run(echo_args_unit(), InvocationArguments::new())
            .unwrap();

        let err = ctx
            .load_and_run(echo_args_unit(), InvocationArguments::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::ContextAlreadyBound(_)));
        assert_eq!(ctx.state(), ContextState::Completed);
    }

    #[test]
    fn test_create_then_destroy_releases_everything() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::unrestricted());
        ctx.destroy();

        assert_eq!(ctx.state(), ContextState::Destroyed);
        assert!(!ctx.is_bound());
        assert!(ctx.policy().is_empty());
        assert!(ctx.last_diagnostic().is_none());

        ctx.destroy();
        assert_eq!(ctx.state(), ContextState::Destroyed);
    }

    #[test]
    fn test_destroy_after_fault() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::deny_all());
        let _ = ctx.load_and_run(writer_unit(), InvocationArguments::new());
        ctx.destroy();

        assert!(!ctx.is_bound());
        assert!(ctx.output().is_empty());
        let err = ctx
            .load_and_run(echo_args_unit(), InvocationArguments::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::ContextDestroyed));
    }

    #[test]
    fn test_report() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, RestrictionPolicy::deny_all());
        let report = ctx.report();
        assert_eq!(report.state, ContextState::Created);
        assert!(report.unit.is_none());
        assert_eq!(report.policy, "deny-all");

        ctx.load_and_run(echo_args_unit(), InvocationArguments::new())
            .unwrap();
        let report = ctx.report();
        assert_eq!(report.unit.as_deref(), Some("ctx-test"));
        assert_eq!(report.output, vec!["[]".to_string()]);
    }
}
