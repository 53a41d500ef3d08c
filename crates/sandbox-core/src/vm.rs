//! Stack interpreter for executable units.
//!
//! Runs synchronously on the calling thread. Calls between unit functions
//! push activations onto a heap-allocated call stack, so native stack use does
//! not grow with unit recursion. Every other call goes to the
//! [`HostFunctions`] implementation, which is where capability checks happen.

use crate::error::{SandboxError, SandboxResult};
use crate::host::HostFunctions;
use crate::unit::{Constant, Instruction, UnitImage};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default maximum call depth.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
        }
    }

    /// Falsy values are null, false, 0, "" and [].
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&Constant> for Value {
    fn from(constant: &Constant) -> Self {
        match constant {
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::String(s) => Value::Str(s.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => f.write_str(s),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// One active call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub pc: usize,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.function, self.pc)
    }
}

fn fault(message: impl Into<String>) -> SandboxError {
    SandboxError::UnhandledUnitFault(message.into())
}

fn pop(stack: &mut Vec<Value>) -> SandboxResult<Value> {
    stack.pop().ok_or_else(|| fault("stack underflow"))
}

fn pop_int(stack: &mut Vec<Value>) -> SandboxResult<i64> {
    match pop(stack)? {
        Value::Int(i) => Ok(i),
        other => Err(fault(format!("expected int, got {}", other.type_name()))),
    }
}

/// Interpreter over one unit image.
pub struct Interpreter<'u> {
    image: &'u UnitImage,
    abort: Arc<AtomicBool>,
    max_call_depth: usize,
    frames: Vec<StackFrame>,
    fault_frames: Vec<StackFrame>,
}

impl<'u> Interpreter<'u> {
    pub fn new(image: &'u UnitImage, abort: Arc<AtomicBool>) -> Self {
        Self {
            image,
            abort,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            frames: Vec::new(),
            fault_frames: Vec::new(),
        }
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Call stack captured at the innermost point of the last fault.
    pub fn fault_frames(&self) -> &[StackFrame] {
        &self.fault_frames
    }

    /// Invoke a function by index with the given arguments.
    ///
    /// Missing trailing arguments are passed as null.
    pub fn invoke<H: HostFunctions>(
        &mut self,
        function: usize,
        mut args: Vec<Value>,
        host: &mut H,
    ) -> SandboxResult<Value> {
        self.frames.clear();
        self.fault_frames.clear();
        let Some(target) = self.image.functions.get(function) else {
            return Err(fault(format!("no function at index {}", function)));
        };
        if args.len() < target.params.len() {
            args.resize(target.params.len(), Value::Null);
        }

        let result = self.run(function, args, host);
        if result.is_err() {
            self.fault_frames = self.frames.clone();
        }
        self.frames.clear();
        result
    }

    /// Run until the entry activation returns.
    ///
    /// Unit-to-unit calls push an [`Activation`] instead of recursing, so the
    /// call depth is bounded by `max_call_depth` alone.
    fn run<H: HostFunctions>(
        &mut self,
        entry: usize,
        args: Vec<Value>,
        host: &mut H,
    ) -> SandboxResult<Value> {
        let image = self.image;
        let mut activations: Vec<Activation> = Vec::new();
        self.enter(&mut activations, entry, args)?;

        loop {
            if self.abort.load(Ordering::Relaxed) {
                return Err(SandboxError::Aborted);
            }

            let current = top(&mut activations)?;
            let step = match image.functions[current.function].instructions.get(current.pc) {
                None => Step::Return(Value::Null),
                Some(instruction) => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.pc = current.pc;
                    }
                    self.step(instruction, current, host)?
                }
            };

            match step {
                Step::Next => top(&mut activations)?.pc += 1,
                Step::Jump(target) => top(&mut activations)?.pc = target,
                Step::Call(callee, args) => {
                    top(&mut activations)?.pc += 1;
                    self.enter(&mut activations, callee, args)?;
                }
                Step::Return(value) => {
                    activations.pop();
                    self.frames.pop();
                    match activations.last_mut() {
                        Some(caller) => caller.stack.push(value),
                        None => return Ok(value),
                    }
                }
            }
        }
    }

    /// Push a new activation for `index`, enforcing depth and arity.
    fn enter(
        &mut self,
        activations: &mut Vec<Activation>,
        index: usize,
        args: Vec<Value>,
    ) -> SandboxResult<()> {
        let function = &self.image.functions[index];
        if self.frames.len() >= self.max_call_depth {
            return Err(fault(format!(
                "call depth exceeded {} calling '{}'",
                self.max_call_depth, function.name
            )));
        }
        if args.len() != function.params.len() {
            return Err(fault(format!(
                "'{}' expects {} arguments, got {}",
                function.name,
                function.params.len(),
                args.len()
            )));
        }

        let mut locals = args;
        locals.resize(function.slot_count(), Value::Null);
        self.frames.push(StackFrame {
            function: function.name.clone(),
            pc: 0,
        });
        activations.push(Activation {
            function: index,
            pc: 0,
            locals,
            stack: Vec::new(),
        });
        Ok(())
    }

    /// Execute one instruction of the current activation.
    fn step<H: HostFunctions>(
        &self,
        instruction: &Instruction,
        current: &mut Activation,
        host: &mut H,
    ) -> SandboxResult<Step> {
        let image = self.image;
        let pc = current.pc;
        let stack = &mut current.stack;
        let locals = &mut current.locals;

        match instruction {
            Instruction::LoadConst { index } => stack.push(Value::from(&image.constants[*index])),
            Instruction::LoadLocal { index } => stack.push(locals[*index].clone()),
            Instruction::StoreLocal { index } => locals[*index] = pop(stack)?,
            Instruction::Call { name, arg_count } => {
                if stack.len() < *arg_count {
                    return Err(fault("stack underflow"));
                }
                let args = stack.split_off(stack.len() - arg_count);
                match image.functions.iter().position(|f| &f.name == name) {
                    Some(callee) => return Ok(Step::Call(callee, args)),
                    None => stack.push(host.call(name, args, &self.frames)?),
                }
            }
            Instruction::Return => return Ok(Step::Return(stack.pop().unwrap_or(Value::Null))),
            Instruction::Jump { offset } => return Ok(Step::Jump(jump_target(pc, *offset))),
            Instruction::JumpIfFalse { offset } => {
                if !pop(stack)?.is_truthy() {
                    return Ok(Step::Jump(jump_target(pc, *offset)));
                }
            }
            Instruction::Pop => {
                pop(stack)?;
            }
            Instruction::Dup => {
                let top = stack.last().cloned().ok_or_else(|| fault("stack underflow"))?;
                stack.push(top);
            }
            Instruction::Add => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                stack.push(add(a, b)?);
            }
            Instruction::Sub => {
                let b = pop_int(stack)?;
                let a = pop_int(stack)?;
                stack.push(Value::Int(a.wrapping_sub(b)));
            }
            Instruction::Mul => {
                let b = pop_int(stack)?;
                let a = pop_int(stack)?;
                stack.push(Value::Int(a.wrapping_mul(b)));
            }
            Instruction::Div => {
                let b = pop_int(stack)?;
                let a = pop_int(stack)?;
                if b == 0 {
                    return Err(fault("division by zero"));
                }
                stack.push(Value::Int(a.wrapping_div(b)));
            }
            Instruction::Eq => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                stack.push(Value::Bool(a == b));
            }
            Instruction::Ne => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                stack.push(Value::Bool(a != b));
            }
            Instruction::Lt => {
                let b = pop_int(stack)?;
                let a = pop_int(stack)?;
                stack.push(Value::Bool(a < b));
            }
            Instruction::Gt => {
                let b = pop_int(stack)?;
                let a = pop_int(stack)?;
                stack.push(Value::Bool(a > b));
            }
            Instruction::Not => {
                let v = pop(stack)?;
                stack.push(Value::Bool(!v.is_truthy()));
            }
            Instruction::MakeArray { count } => {
                if stack.len() < *count {
                    return Err(fault("stack underflow"));
                }
                let items = stack.split_off(stack.len() - count);
                stack.push(Value::Array(items));
            }
            Instruction::GetIndex => {
                let index = pop_int(stack)?;
                let target = pop(stack)?;
                stack.push(get_index(target, index)?);
            }
            Instruction::Len => {
                let len = match pop(stack)? {
                    Value::Array(items) => items.len(),
                    Value::Str(s) => s.chars().count(),
                    other => return Err(fault(format!("len of {}", other.type_name()))),
                };
                stack.push(Value::Int(len as i64));
            }
            Instruction::Throw => {
                let message = pop(stack)?;
                return Err(fault(message.to_string()));
            }
            Instruction::Nop => {}
        }

        Ok(Step::Next)
    }
}

/// One active unit function call.
struct Activation {
    function: usize,
    /// Next instruction to execute.
    pc: usize,
    locals: Vec<Value>,
    stack: Vec<Value>,
}

/// What the run loop does after an instruction.
enum Step {
    Next,
    Jump(usize),
    Call(usize, Vec<Value>),
    Return(Value),
}

fn top(activations: &mut [Activation]) -> SandboxResult<&mut Activation> {
    activations
        .last_mut()
        .ok_or_else(|| fault("empty call stack"))
}

fn jump_target(pc: usize, offset: i32) -> usize {
    (pc as i64 + offset as i64) as usize
}

fn add(a: Value, b: Value) -> SandboxResult<Value> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(b))),
        (Value::Str(a), b) => Ok(Value::Str(format!("{}{}", a, b))),
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (a, b) => Err(fault(format!(
            "cannot add {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn get_index(target: Value, index: i64) -> SandboxResult<Value> {
    let out_of_range = || fault(format!("index {} out of range", index));
    let index = usize::try_from(index).map_err(|_| out_of_range())?;
    match target {
        Value::Array(items) => items.into_iter().nth(index).ok_or_else(out_of_range),
        Value::Str(s) => s
            .chars()
            .nth(index)
            .map(|c| Value::Str(c.to_string()))
            .ok_or_else(out_of_range),
        other => Err(fault(format!("cannot index {}", other.type_name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_CALL_DEPTH_LIMIT;
    use crate::unit::{Function, UnitMetadata};

    /// Host that records calls and answers `echo` with its first argument.
    #[derive(Default)]
    struct RecordingHost {
        calls: Vec<(String, Vec<Value>, Vec<StackFrame>)>,
    }

    impl HostFunctions for RecordingHost {
        fn call(
            &mut self,
            name: &str,
            args: Vec<Value>,
            stack: &[StackFrame],
        ) -> SandboxResult<Value> {
            self.calls
                .push((name.to_string(), args.clone(), stack.to_vec()));
            match name {
                "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
                other => Err(fault(format!("unknown host function '{}'", other))),
            }
        }
    }

    fn image(constants: Vec<Constant>, functions: Vec<Function>) -> UnitImage {
        UnitImage {
            version: 1,
            metadata: UnitMetadata {
                name: "vm-test".to_string(),
                version: "0.1.0".to_string(),
                compiled_at: None,
                compiler: None,
            },
            constants,
            functions,
            entry_point: Some("main".to_string()),
        }
    }

    fn func(
        name: &str,
        params: &[&str],
        local_count: usize,
        instructions: Vec<Instruction>,
    ) -> Function {
        Function {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            instructions,
            local_count,
        }
    }

    fn run(image: &UnitImage, args: Vec<Value>) -> (SandboxResult<Value>, RecordingHost) {
        let mut host = RecordingHost::default();
        let mut vm = Interpreter::new(image, Arc::new(AtomicBool::new(false)));
        let result = vm.invoke(0, args, &mut host);
        (result, host)
    }

    #[test]
    fn test_arithmetic_and_return() {
        let img = image(
            vec![Constant::Int(6), Constant::Int(7)],
            vec![func(
                "main",
                &[],
                0,
                vec![
                    Instruction::LoadConst { index: 0 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::Mul,
                    Instruction::Return,
                ],
            )],
        );
        let (result, _) = run(&img, vec![]);
        assert_eq!(result.unwrap(), Value::Int(42));
    }

    #[test]
    fn test_loop_counts_to_three() {
        // i = 0; while i < 3 { i = i + 1 }; return i
        let img = image(
            vec![Constant::Int(0), Constant::Int(3), Constant::Int(1)],
            vec![func(
                "main",
                &[],
                1,
                vec![
                    Instruction::LoadConst { index: 0 },
                    Instruction::StoreLocal { index: 0 },
                    Instruction::LoadLocal { index: 0 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::Lt,
                    Instruction::JumpIfFalse { offset: 6 },
                    Instruction::LoadLocal { index: 0 },
                    Instruction::LoadConst { index: 2 },
                    Instruction::Add,
                    Instruction::StoreLocal { index: 0 },
                    Instruction::Jump { offset: -8 },
                    Instruction::LoadLocal { index: 0 },
                    Instruction::Return,
                ],
            )],
        );
        let (result, _) = run(&img, vec![]);
        assert_eq!(result.unwrap(), Value::Int(3));
    }

    #[test]
    fn test_unit_function_call_and_host_call() {
        let img = image(
            vec![Constant::String("hi".to_string())],
            vec![
                func(
                    "main",
                    &[],
                    0,
                    vec![
                        Instruction::LoadConst { index: 0 },
                        Instruction::Call {
                            name: "shout".to_string(),
                            arg_count: 1,
                        },
                        Instruction::Return,
                    ],
                ),
                func(
                    "shout",
                    &["s"],
                    0,
                    vec![
                        Instruction::LoadLocal { index: 0 },
                        Instruction::Call {
                            name: "echo".to_string(),
                            arg_count: 1,
                        },
                        Instruction::Return,
                    ],
                ),
            ],
        );
        let (result, host) = run(&img, vec![]);
        assert_eq!(result.unwrap(), Value::Str("hi".to_string()));
        assert_eq!(host.calls.len(), 1);
        let (name, args, stack) = &host.calls[0];
        assert_eq!(name, "echo");
        assert_eq!(args, &vec![Value::Str("hi".to_string())]);
        let names: Vec<_> = stack.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, vec!["main", "shout"]);
    }

    #[test]
    fn test_throw_captures_fault_frames() {
        let img = image(
            vec![Constant::String("boom".to_string())],
            vec![
                func(
                    "main",
                    &[],
                    0,
                    vec![
                        Instruction::Call {
                            name: "explode".to_string(),
                            arg_count: 0,
                        },
                        Instruction::Return,
                    ],
                ),
                func(
                    "explode",
                    &[],
                    0,
                    vec![Instruction::Nop, Instruction::LoadConst { index: 0 }, Instruction::Throw],
                ),
            ],
        );
        let mut host = RecordingHost::default();
        let mut vm = Interpreter::new(&img, Arc::new(AtomicBool::new(false)));
        let err = vm.invoke(0, vec![], &mut host).unwrap_err();
        assert!(matches!(err, SandboxError::UnhandledUnitFault(ref m) if m == "boom"));
        assert_eq!(
            vm.fault_frames(),
            &[
                StackFrame { function: "main".to_string(), pc: 0 },
                StackFrame { function: "explode".to_string(), pc: 2 },
            ]
        );
    }

    #[test]
    fn test_division_by_zero() {
        let img = image(
            vec![Constant::Int(1), Constant::Int(0)],
            vec![func(
                "main",
                &[],
                0,
                vec![
                    Instruction::LoadConst { index: 0 },
                    Instruction::LoadConst { index: 1 },
                    Instruction::Div,
                ],
            )],
        );
        let (result, _) = run(&img, vec![]);
        assert!(matches!(result, Err(SandboxError::UnhandledUnitFault(_))));
    }

    #[test]
    fn test_recursion_depth_limited() {
        let img = image(
            vec![],
            vec![func(
                "main",
                &[],
                0,
                vec![Instruction::Call {
                    name: "main".to_string(),
                    arg_count: 0,
                }],
            )],
        );
        let mut host = RecordingHost::default();
        let mut vm = Interpreter::new(&img, Arc::new(AtomicBool::new(false))).with_max_call_depth(16);
        let err = vm.invoke(0, vec![], &mut host).unwrap_err();
        assert!(err.to_string().contains("call depth"));
        assert_eq!(vm.fault_frames().len(), 16);
    }

    #[test]
    fn test_deepest_configurable_recursion_faults_cleanly() {
        let img = image(
            vec![],
            vec![func(
                "main",
                &[],
                0,
                vec![
                    Instruction::Call {
                        name: "main".to_string(),
                        arg_count: 0,
                    },
                    Instruction::Return,
                ],
            )],
        );
        let mut host = RecordingHost::default();
        let mut vm = Interpreter::new(&img, Arc::new(AtomicBool::new(false)))
            .with_max_call_depth(MAX_CALL_DEPTH_LIMIT);
        let err = vm.invoke(0, vec![], &mut host).unwrap_err();
        assert!(
            matches!(err, SandboxError::UnhandledUnitFault(ref m) if m.starts_with("call depth exceeded"))
        );
        assert_eq!(vm.fault_frames().len(), MAX_CALL_DEPTH_LIMIT);
    }

    #[test]
    fn test_nested_calls_return_to_caller() {
        // main: return inc(inc(1)); inc(x): return x + 1
        let img = image(
            vec![Constant::Int(1)],
            vec![
                func(
                    "main",
                    &[],
                    0,
                    vec![
                        Instruction::LoadConst { index: 0 },
                        Instruction::Call {
                            name: "inc".to_string(),
                            arg_count: 1,
                        },
                        Instruction::Call {
                            name: "inc".to_string(),
                            arg_count: 1,
                        },
                        Instruction::Return,
                    ],
                ),
                func(
                    "inc",
                    &["x"],
                    0,
                    vec![
                        Instruction::LoadLocal { index: 0 },
                        Instruction::LoadConst { index: 0 },
                        Instruction::Add,
                        Instruction::Return,
                    ],
                ),
            ],
        );
        let (result, _) = run(&img, vec![]);
        assert_eq!(result.unwrap(), Value::Int(3));
    }

    #[test]
    fn test_abort_flag_stops_execution() {
        let img = image(
            vec![],
            vec![func("main", &[], 0, vec![Instruction::Jump { offset: 0 }])],
        );
        let mut host = RecordingHost::default();
        let mut vm = Interpreter::new(&img, Arc::new(AtomicBool::new(true)));
        let err = vm.invoke(0, vec![], &mut host).unwrap_err();
        assert!(matches!(err, SandboxError::Aborted));
    }

    #[test]
    fn test_index_and_len() {
        let img = image(
            vec![Constant::Int(1)],
            vec![func(
                "main",
                &["args"],
                0,
                vec![
                    Instruction::LoadLocal { index: 0 },
                    Instruction::Dup,
                    Instruction::Len,
                    Instruction::Pop,
                    Instruction::LoadConst { index: 0 },
                    Instruction::GetIndex,
                    Instruction::Return,
                ],
            )],
        );
        let args = Value::Array(vec![Value::Str("a".to_string()), Value::Str("b".to_string())]);
        let (result, _) = run(&img, vec![args]);
        assert_eq!(result.unwrap(), Value::Str("b".to_string()));

        let (result, _) = run(&img, vec![Value::Array(vec![])]);
        assert!(result.is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Array(vec![Value::Null]).is_truthy());
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::Str("x".to_string())]).to_string(),
            "[1, x]"
        );
    }
}
