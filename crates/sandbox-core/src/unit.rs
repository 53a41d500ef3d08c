//! Executable unit format and loader.
//!
//! A unit (`.sbu`) is a small program for the sandbox interpreter.
//!
//! ## Format
//!
//! ```text
//! +----------------+
//! | Magic (4 bytes)|  "SBU\x01" (version 1, optional)
//! +----------------+
//! | JSON document  |  metadata, constants, functions, entry_point
//! +----------------+
//! ```
//!
//! Without the magic prefix the file is read as the bare JSON document
//! (development format).
//!
//! A unit without an `entry_point` is a library and cannot be run. The entry
//! function is `main()` or `main(args, ...)`; its arity is detected once here
//! and carried as an [`EntryPoint`] variant. Parameters after the first are
//! left null.

use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes for unit files.
pub const MAGIC: &[u8; 4] = b"SBU\x01";

/// Parsed unit image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitImage {
    /// Version of the unit format.
    pub version: u8,

    /// Unit metadata.
    pub metadata: UnitMetadata,

    /// Constant pool.
    #[serde(default)]
    pub constants: Vec<Constant>,

    /// Function definitions.
    pub functions: Vec<Function>,

    /// Entry point function name. `None` for libraries.
    #[serde(default)]
    pub entry_point: Option<String>,
}

/// Metadata embedded in a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitMetadata {
    /// Unit name.
    pub name: String,

    /// Unit version.
    pub version: String,

    /// Compilation timestamp.
    #[serde(default)]
    pub compiled_at: Option<String>,

    /// Compiler that produced the unit.
    #[serde(default)]
    pub compiler: Option<String>,
}

/// A constant value in the constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
}

/// A function definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Function name.
    pub name: String,

    /// Parameter names. Parameters occupy the first local slots.
    #[serde(default)]
    pub params: Vec<String>,

    /// Instructions.
    pub instructions: Vec<Instruction>,

    /// Local variable count, in addition to parameters.
    #[serde(default)]
    pub local_count: usize,
}

impl Function {
    /// Total local slots (parameters + locals).
    pub fn slot_count(&self) -> usize {
        self.params.len() + self.local_count
    }
}

/// An interpreter instruction.
///
/// Jump offsets are relative to the jump instruction itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Instruction {
    /// Push a constant from the pool.
    LoadConst { index: usize },

    /// Push a local slot.
    LoadLocal { index: usize },

    /// Pop into a local slot.
    StoreLocal { index: usize },

    /// Call a unit function, or a host function through the gate.
    Call { name: String, arg_count: usize },

    /// Return top of stack (or null when empty).
    Return,

    /// Unconditional jump.
    Jump { offset: i32 },

    /// Pop; jump if falsy.
    JumpIfFalse { offset: i32 },

    /// Pop and discard.
    Pop,

    /// Duplicate top of stack.
    Dup,

    /// Integer add, or string/array concatenation.
    Add,

    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Gt,
    Not,

    /// Build an array from the top `count` values.
    MakeArray { count: usize },

    /// Pop index and array (or string); push element.
    GetIndex,

    /// Pop array or string; push its length.
    Len,

    /// Pop a message and raise a fault.
    Throw,

    Nop,
}

/// How the entry point is invoked, detected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// `main()`: invoked with no arguments.
    NoArgs { function: usize },
    /// `main(args)`: invoked with the whole argument sequence as one array.
    WithArgs { function: usize },
}

impl EntryPoint {
    /// Index of the entry function in the image.
    pub fn function(&self) -> usize {
        match self {
            EntryPoint::NoArgs { function } | EntryPoint::WithArgs { function } => *function,
        }
    }

    /// Number of arguments the entry function is invoked with.
    pub fn arity(&self) -> usize {
        match self {
            EntryPoint::NoArgs { .. } => 0,
            EntryPoint::WithArgs { .. } => 1,
        }
    }
}

/// A loaded unit with a validated entry point.
#[derive(Debug, Clone)]
pub struct ExecutableUnit {
    origin: PathBuf,
    image: UnitImage,
    entry: EntryPoint,
}

impl ExecutableUnit {
    /// Path the unit was loaded from.
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn image(&self) -> &UnitImage {
        &self.image
    }

    pub fn entry_point(&self) -> EntryPoint {
        self.entry
    }

    /// Unit name from metadata.
    pub fn name(&self) -> &str {
        &self.image.metadata.name
    }

    /// Number of arguments the entry point is invoked with.
    pub fn arity(&self) -> usize {
        self.entry.arity()
    }

    /// Name of the entry function.
    pub fn entry_name(&self) -> &str {
        &self.image.functions[self.entry.function()].name
    }
}

/// Unit loader.
pub struct UnitLoader;

impl UnitLoader {
    /// Load a unit from a file and resolve its entry point.
    pub fn resolve(path: &Path) -> SandboxResult<ExecutableUnit> {
        if !path.is_file() {
            return Err(SandboxError::UnitNotFound(path.display().to_string()));
        }
        debug!("Loading unit from {:?}", path);
        let content = std::fs::read(path)?;
        Self::parse(&content, path)
    }

    /// Parse unit bytes and resolve the entry point.
    pub fn parse(bytes: &[u8], origin: &Path) -> SandboxResult<ExecutableUnit> {
        let image = Self::decode(bytes)?;
        Self::validate(&image)?;

        let entry_name = image
            .entry_point
            .as_deref()
            .ok_or_else(|| SandboxError::MissingEntryPoint(origin.display().to_string()))?;

        let index = image
            .functions
            .iter()
            .position(|f| f.name == entry_name)
            .ok_or_else(|| {
                SandboxError::InvalidUnit(format!(
                    "Entry point function '{}' not found",
                    entry_name
                ))
            })?;

        let entry = if image.functions[index].params.is_empty() {
            EntryPoint::NoArgs { function: index }
        } else {
            EntryPoint::WithArgs { function: index }
        };

        debug!(
            "Resolved entry point '{}' ({} params) in unit '{}'",
            entry_name,
            entry.arity(),
            image.metadata.name
        );

        Ok(ExecutableUnit {
            origin: origin.to_path_buf(),
            image,
            entry,
        })
    }

    /// Decode unit bytes into an image without validating it.
    pub fn decode(bytes: &[u8]) -> SandboxResult<UnitImage> {
        if bytes.len() < 4 {
            return Err(SandboxError::InvalidUnit(
                "File too small to be a valid unit".to_string(),
            ));
        }

        let body = if &bytes[0..4] == MAGIC {
            &bytes[4..]
        } else {
            bytes
        };

        let content = std::str::from_utf8(body)
            .map_err(|e| SandboxError::InvalidUnit(format!("Invalid UTF-8: {}", e)))?;

        serde_json::from_str(content)
            .map_err(|e| SandboxError::InvalidUnit(format!("Invalid unit JSON: {}", e)))
    }

    /// Validate image structure: version, unique names, indices and jumps.
    pub fn validate(image: &UnitImage) -> SandboxResult<()> {
        if image.version != 1 {
            return Err(SandboxError::InvalidUnit(format!(
                "Unsupported unit version: {}",
                image.version
            )));
        }

        let mut names = HashSet::new();
        for function in &image.functions {
            if !names.insert(function.name.as_str()) {
                return Err(SandboxError::InvalidUnit(format!(
                    "Duplicate function '{}'",
                    function.name
                )));
            }
            Self::validate_function(image, function)?;
        }

        Ok(())
    }

    fn validate_function(image: &UnitImage, function: &Function) -> SandboxResult<()> {
        let len = function.instructions.len();
        let invalid = |pc: usize, what: String| {
            SandboxError::InvalidUnit(format!("{}@{}: {}", function.name, pc, what))
        };

        for (pc, instruction) in function.instructions.iter().enumerate() {
            match instruction {
                Instruction::LoadConst { index } if *index >= image.constants.len() => {
                    return Err(invalid(pc, format!("constant {} out of range", index)));
                }
                Instruction::LoadLocal { index } | Instruction::StoreLocal { index }
                    if *index >= function.slot_count() =>
                {
                    return Err(invalid(pc, format!("local {} out of range", index)));
                }
                Instruction::Jump { offset } | Instruction::JumpIfFalse { offset } => {
                    let target = pc as i64 + *offset as i64;
                    if target < 0 || target > len as i64 {
                        return Err(invalid(pc, format!("jump target {} out of range", target)));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> UnitImage {
        UnitImage {
            version: 1,
            metadata: UnitMetadata {
                name: "hello".to_string(),
                version: "0.1.0".to_string(),
                compiled_at: None,
                compiler: None,
            },
            constants: vec![Constant::String("Hello".to_string()), Constant::Int(0)],
            functions: vec![Function {
                name: "main".to_string(),
                params: vec![],
                instructions: vec![
                    Instruction::LoadConst { index: 0 },
                    Instruction::Call {
                        name: "print".to_string(),
                        arg_count: 1,
                    },
                    Instruction::LoadConst { index: 1 },
                    Instruction::Return,
                ],
                local_count: 0,
            }],
            entry_point: Some("main".to_string()),
        }
    }

    fn parse(image: &UnitImage) -> SandboxResult<ExecutableUnit> {
        let json = serde_json::to_vec(image).unwrap();
        UnitLoader::parse(&json, Path::new("test.sbu"))
    }

    #[test]
    fn test_serialize_image() {
        let json = serde_json::to_string_pretty(&sample_image()).unwrap();
        assert!(json.contains("\"version\": 1"));
        assert!(json.contains("\"entry_point\": \"main\""));
        assert!(json.contains("\"op\": \"LoadConst\""));
    }

    #[test]
    fn test_parse_no_args_entry() {
        let unit = parse(&sample_image()).unwrap();
        assert_eq!(unit.entry_point(), EntryPoint::NoArgs { function: 0 });
        assert_eq!(unit.arity(), 0);
        assert_eq!(unit.entry_name(), "main");
        assert_eq!(unit.origin(), Path::new("test.sbu"));
    }

    #[test]
    fn test_parse_with_args_entry() {
        let mut image = sample_image();
        image.functions[0].params = vec!["args".to_string()];
        let unit = parse(&image).unwrap();
        assert_eq!(unit.entry_point(), EntryPoint::WithArgs { function: 0 });
        assert_eq!(unit.arity(), 1);
    }

    #[test]
    fn test_parse_with_magic() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend(serde_json::to_vec(&sample_image()).unwrap());
        let unit = UnitLoader::parse(&bytes, Path::new("magic.sbu")).unwrap();
        assert_eq!(unit.name(), "hello");
    }

    #[test]
    fn test_library_has_no_entry_point() {
        let mut image = sample_image();
        image.entry_point = None;
        let result = parse(&image);
        assert!(matches!(result, Err(SandboxError::MissingEntryPoint(_))));
    }

    #[test]
    fn test_dangling_entry_point() {
        let mut image = sample_image();
        image.entry_point = Some("nonexistent".to_string());
        assert!(matches!(parse(&image), Err(SandboxError::InvalidUnit(_))));
    }

    #[test]
    fn test_extra_params_still_take_one_argument() {
        let mut image = sample_image();
        image.functions[0].params = vec!["args".to_string(), "verbose".to_string()];
        let unit = parse(&image).unwrap();
        assert_eq!(unit.entry_point(), EntryPoint::WithArgs { function: 0 });
        assert_eq!(unit.arity(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_indices() {
        let mut image = sample_image();
        image.functions[0].instructions[0] = Instruction::LoadConst { index: 9 };
        assert!(UnitLoader::validate(&image).is_err());

        let mut image = sample_image();
        image.functions[0].instructions[0] = Instruction::LoadLocal { index: 0 };
        assert!(UnitLoader::validate(&image).is_err());

        let mut image = sample_image();
        image.functions[0].instructions[0] = Instruction::Jump { offset: -1 };
        assert!(UnitLoader::validate(&image).is_err());
    }

    #[test]
    fn test_validate_rejects_version_and_duplicates() {
        let mut image = sample_image();
        image.version = 2;
        assert!(UnitLoader::validate(&image).is_err());

        let mut image = sample_image();
        let dup = image.functions[0].clone();
        image.functions.push(dup);
        assert!(UnitLoader::validate(&image).is_err());
    }

    #[test]
    fn test_too_small() {
        let result = UnitLoader::decode(b"{}");
        assert!(matches!(result, Err(SandboxError::InvalidUnit(_))));
    }
}
