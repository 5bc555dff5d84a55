//! Error types for the binding runtime
//!
//! Recoverable conditions are ordinary `Result` errors. Contract violations
//! between the extension and the host are [`AbiViolation`]s and go through
//! [`fatal`], which never returns.

use std::path::PathBuf;

use thiserror::Error;

use tether_sys::{AbiVersion, CallError, CallErrorKind, InstanceId, VariantType};

// ============================================================================
// Variant conversion
// ============================================================================

/// What went wrong while converting a value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionErrorKind {
    /// Discriminant did not match the requested kind
    #[error("expected {expected:?}, found {actual:?}")]
    TypeMismatch {
        /// Kind the caller asked for
        expected: VariantType,
        /// Kind the value actually has
        actual: VariantType,
    },

    /// Integer does not fit the requested Rust type
    #[error("integer {value} out of range for {target}")]
    OutOfRange {
        /// Value as carried by the variant
        value: i64,
        /// Rust type name
        target: &'static str,
    },

    /// Raw variant carries a tag this runtime does not know
    #[error("unknown variant tag {0}")]
    UnknownTag(u32),

    /// Packed array element kind differs from the requested element type
    #[error("packed array holds {actual}, expected {expected}")]
    PackedElementMismatch {
        /// Requested element type
        expected: &'static str,
        /// Element type reported by the host
        actual: &'static str,
    },

    /// Boxed payload pointer is null
    #[error("null payload for {0:?}")]
    NullPayload(VariantType),

    /// Containers nested deeper than the conversion limit
    #[error("maximum nesting depth exceeded")]
    MaxDepthExceeded,
}

/// Recoverable failure converting between a variant and a Rust value.
///
/// `path` locates the failing element inside nested containers, e.g.
/// `[2].name`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}", render_path(.path))]
pub struct ConversionError {
    kind: ConversionErrorKind,
    path: Vec<PathSegment>,
}

/// One step into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Array position
    Index(usize),
    /// Dictionary key, rendered for display
    Key(String),
}

fn render_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut out = String::from(" at ");
    for segment in path {
        match segment {
            PathSegment::Index(i) => out.push_str(&format!("[{}]", i)),
            PathSegment::Key(k) => {
                out.push('.');
                out.push_str(k);
            }
        }
    }
    out
}

impl ConversionError {
    /// Error with an empty path
    pub fn new(kind: ConversionErrorKind) -> Self {
        Self {
            kind,
            path: Vec::new(),
        }
    }

    /// Type mismatch between two kinds
    pub fn mismatch(expected: VariantType, actual: VariantType) -> Self {
        Self::new(ConversionErrorKind::TypeMismatch { expected, actual })
    }

    /// Integer range failure
    pub fn out_of_range(value: i64, target: &'static str) -> Self {
        Self::new(ConversionErrorKind::OutOfRange { value, target })
    }

    /// Prefix the path with an array index
    pub fn at_index(mut self, index: usize) -> Self {
        self.path.insert(0, PathSegment::Index(index));
        self
    }

    /// Prefix the path with a dictionary key
    pub fn at_key(mut self, key: impl Into<String>) -> Self {
        self.path.insert(0, PathSegment::Key(key.into()));
        self
    }

    /// What went wrong
    pub fn kind(&self) -> &ConversionErrorKind {
        &self.kind
    }

    /// Location inside nested containers
    pub fn path(&self) -> &[PathSegment] {
        &self.path
    }

    /// Location rendered as `[2].key`
    pub fn path_string(&self) -> String {
        render_path(&self.path).trim_start_matches(" at ").to_string()
    }
}

// ============================================================================
// Ownership
// ============================================================================

/// Misuse of a managed handle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OwnershipError {
    /// Null pointer where an object was required
    #[error("null object handle")]
    NullHandle,

    /// Borrowed handles come from `HandleRegistry::borrow` with a scope
    #[error("borrowed handles must be created with a call scope")]
    BorrowRequiresScope,

    /// Borrowed result cannot leave the frame that produced it
    #[error("borrowed object at {addr:#x} cannot outlive its call frame")]
    BorrowEscapes {
        /// Object address
        addr: usize,
    },

    /// Handle was already released (or never acquired)
    #[error("double release of object at {addr:#x}")]
    DoubleRelease {
        /// Object address
        addr: usize,
    },

    /// A transferred object already has an owner
    #[error("object at {addr:#x} is already exclusively owned")]
    AlreadyOwned {
        /// Object address
        addr: usize,
    },

    /// Object does not support intrusive reference counting
    #[error("object at {addr:#x} is not reference counted")]
    NotRefCounted {
        /// Object address
        addr: usize,
    },

    /// Engine freed the object
    #[error("object {id:?} was freed by the engine")]
    Freed {
        /// Id recorded at acquisition
        id: InstanceId,
    },
}

// ============================================================================
// Registration and lifecycle
// ============================================================================

/// Class registration failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// A class with this name was already registered by this runtime
    #[error("class '{0}' is already registered")]
    AlreadyRegistered(String),

    /// Host refused the class (unknown parent or name taken by the engine)
    #[error("host rejected class '{class}' with parent '{parent}'")]
    HostRejected {
        /// Class name
        class: String,
        /// Parent class name
        parent: String,
    },

    /// Class is not registered
    #[error("class '{0}' is not registered")]
    UnknownClass(String),

    /// Host failed to construct the object
    #[error("failed to construct '{0}'")]
    ConstructionFailed(String),

    /// Host refused a method, property, signal or constant of the class
    #[error("host rejected member '{member}' of class '{class}'")]
    MemberRejected {
        /// Class name
        class: String,
        /// Member name
        member: String,
    },

    /// Property accessor names a method the class does not declare
    #[error("property '{property}' of '{class}' uses undeclared method '{method}'")]
    UnknownAccessor {
        /// Class name
        class: String,
        /// Property name
        property: String,
        /// Missing getter or setter
        method: String,
    },

    /// The runtime was dropped
    #[error("runtime is gone")]
    RuntimeGone,
}

/// Configuration failure
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading the file
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Value outside its allowed range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime startup and lifecycle failure
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Host passed a null interface pointer
    #[error("host interface pointer is null")]
    NullInterface,

    /// Required host function is missing
    #[error("host function '{0}' is missing")]
    MissingHostFunction(&'static str),

    /// Host implements an incompatible interface version
    #[error("incompatible host interface {found:?}, need {required:?}")]
    IncompatibleHost {
        /// Host version
        found: AbiVersion,
        /// Version this runtime needs
        required: AbiVersion,
    },

    /// Process-wide runtime already installed
    #[error("runtime already initialized")]
    AlreadyInitialized,

    /// No process-wide runtime installed
    #[error("runtime not initialized")]
    NotInitialized,

    /// Class registration failed during initialization
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Configuration failed to load
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ============================================================================
// Variant calls
// ============================================================================

/// Variant call that the callee refused, or whose result did not decode
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VarcallError {
    /// Callee reported an error; nothing was returned
    #[error("call failed: {}", describe_call_error(.0))]
    Rejected(CallError),

    /// Result could not be decoded
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

impl VarcallError {
    /// Decoded callee error, if the callee refused the call
    pub fn call_error(&self) -> Option<CallErrorKind> {
        match self {
            VarcallError::Rejected(e) => e.kind(),
            VarcallError::Conversion(_) => None,
        }
    }
}

fn describe_call_error(error: &CallError) -> String {
    let expected_kind = || {
        u32::try_from(error.expected)
            .ok()
            .and_then(VariantType::from_u32)
            .map_or_else(|| error.expected.to_string(), |t| format!("{:?}", t))
    };
    match error.kind() {
        Some(CallErrorKind::Ok) => "no error".to_string(),
        Some(CallErrorKind::InvalidMethod) => "invalid method".to_string(),
        Some(CallErrorKind::InvalidArgument) => format!(
            "argument {} should be {}",
            error.argument,
            expected_kind()
        ),
        Some(CallErrorKind::TooManyArguments) => {
            format!("too many arguments, expected {}", error.expected)
        }
        Some(CallErrorKind::TooFewArguments) => {
            format!("too few arguments, expected {}", error.expected)
        }
        Some(CallErrorKind::InstanceIsNull) => "instance is null".to_string(),
        Some(CallErrorKind::MethodNotConst) => "method is not const".to_string(),
        None => format!("unknown error {}", error.error),
    }
}

// ============================================================================
// Fatal contract violations
// ============================================================================

/// Extension and host disagree about the ABI. There is no way to continue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiViolation {
    /// Method bind lookup failed: bindings and engine versions differ
    #[error("method bind not found: {class}::{method} (hash {hash})")]
    MethodBindMissing {
        /// Class name
        class: String,
        /// Method name
        method: String,
        /// Method hash
        hash: i64,
    },

    /// Call needs more argument slots than a frame holds
    #[error("frame of {requested} arguments exceeds capacity {capacity}")]
    FrameOverflow {
        /// Arguments requested
        requested: usize,
        /// Frame capacity
        capacity: usize,
    },

    /// Argument written outside the declared arity
    #[error("argument index {index} out of range for arity {arity}")]
    ArgumentIndex {
        /// Index written
        index: usize,
        /// Declared arity
        arity: usize,
    },

    /// Frame invoked before every declared argument was written
    #[error("argument {index} of {arity} was never written")]
    MissingArgument {
        /// First unwritten index
        index: usize,
        /// Declared arity
        arity: usize,
    },

    /// Frame result read before invoke or read twice
    #[error("frame result {0}")]
    ResultState(&'static str),

    /// Method invoked on an engine-owned object the engine already freed
    #[error("use after free of object {id:?}")]
    UseAfterFree {
        /// Id recorded at acquisition
        id: InstanceId,
    },

    /// Host table entry vanished after validation
    #[error("host function '{0}' is missing")]
    MissingHostFunction(&'static str),
}

/// Log and raise a fatal ABI violation.
///
/// Release builds abort on panic; tests unwind so the violation can be
/// observed with `catch_unwind`.
#[cold]
pub fn fatal(violation: AbiViolation) -> ! {
    log::error!("fatal ABI violation: {}", violation);
    std::panic::panic_any(violation)
}

/// Result alias for conversions
pub type ConversionResult<T> = Result<T, ConversionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_error_path() {
        let err = ConversionError::mismatch(VariantType::Int, VariantType::String)
            .at_key("name")
            .at_index(2);
        assert_eq!(err.path_string(), "[2].name");
        assert_eq!(err.to_string(), "expected Int, found String at [2].name");
    }

    #[test]
    fn test_conversion_error_without_path() {
        let err = ConversionError::out_of_range(300, "u8");
        assert_eq!(err.to_string(), "integer 300 out of range for u8");
        assert!(err.path().is_empty());
    }

    #[test]
    fn test_varcall_error_names_the_argument() {
        let err = VarcallError::Rejected(CallError::new(
            CallErrorKind::InvalidArgument,
            1,
            VariantType::Int as i32,
        ));
        assert_eq!(err.to_string(), "call failed: argument 1 should be Int");
        assert_eq!(err.call_error(), Some(CallErrorKind::InvalidArgument));
        let err = VarcallError::Rejected(CallError::new(CallErrorKind::TooFewArguments, 0, 2));
        assert_eq!(err.to_string(), "call failed: too few arguments, expected 2");
    }

    #[test]
    fn test_fatal_panics_with_violation() {
        let result = std::panic::catch_unwind(|| {
            fatal(AbiViolation::ResultState("read twice"));
        });
        let payload = result.unwrap_err();
        let violation = payload.downcast_ref::<AbiViolation>().unwrap();
        assert_eq!(*violation, AbiViolation::ResultState("read twice"));
    }
}
