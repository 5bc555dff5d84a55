//! Variant calls and custom callables

use std::ffi::c_void;

use crate::handles::{InstanceId, RawStringName};
use crate::variant::RawVariant;

/// Argument array of a variant call: one pointer per argument variant
pub type RawVariantArgs = *const *const RawVariant;

/// Why a variant call did not run
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallErrorKind {
    /// The call ran
    Ok = 0,
    /// No such method, or the callee failed
    InvalidMethod = 1,
    /// Argument `argument` is not of kind `expected`
    InvalidArgument = 2,
    /// More than `expected` arguments
    TooManyArguments = 3,
    /// Fewer than `expected` arguments
    TooFewArguments = 4,
    /// Receiver is null or freed
    InstanceIsNull = 5,
    /// Non-const method called on a const receiver
    MethodNotConst = 6,
}

impl CallErrorKind {
    /// Decode a raw error value
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::InvalidMethod,
            2 => Self::InvalidArgument,
            3 => Self::TooManyArguments,
            4 => Self::TooFewArguments,
            5 => Self::InstanceIsNull,
            6 => Self::MethodNotConst,
            _ => return None,
        })
    }
}

/// Outcome of a variant call, written by the callee
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallError {
    /// `CallErrorKind` discriminant
    pub error: i32,
    /// Offending argument index
    pub argument: i32,
    /// Expected variant type or argument count
    pub expected: i32,
}

impl CallError {
    /// Success
    pub const OK: Self = Self {
        error: 0,
        argument: 0,
        expected: 0,
    };

    /// Build an error
    pub fn new(kind: CallErrorKind, argument: i32, expected: i32) -> Self {
        Self {
            error: kind as i32,
            argument,
            expected,
        }
    }

    /// Decoded kind; `None` for values this crate does not know
    pub fn kind(&self) -> Option<CallErrorKind> {
        CallErrorKind::from_i32(self.error)
    }

    /// Whether the call ran
    pub fn is_ok(&self) -> bool {
        self.error == CallErrorKind::Ok as i32
    }
}

/// Invoke a custom callable. `ret` is uninitialized and is always written.
pub type CallableCallFn = unsafe extern "C" fn(
    callable_userdata: *mut c_void,
    args: RawVariantArgs,
    count: i64,
    ret: *mut RawVariant,
    error: *mut CallError,
);

/// Whether a custom callable can still be called
pub type CallableIsValidFn = unsafe extern "C" fn(callable_userdata: *mut c_void) -> bool;

/// Release a custom callable once the host drops its last reference
pub type CallableFreeFn = unsafe extern "C" fn(callable_userdata: *mut c_void);

/// Callable backed by extension code, handed to `callable_custom_create`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CallableCustomInfo {
    /// Extension data passed back to every callback
    pub callable_userdata: *mut c_void,
    /// Library token of the creating extension
    pub token: *mut c_void,
    /// Object the callable is bound to, or `InstanceId::NONE`
    pub object_id: InstanceId,
    /// Name shown by the engine
    pub name: RawStringName,
    /// Call path
    pub call: Option<CallableCallFn>,
    /// Validity check; always valid when null
    pub is_valid: Option<CallableIsValidFn>,
    /// Release
    pub free: Option<CallableFreeFn>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_kind_round_trips_known_values() {
        let err = CallError::new(CallErrorKind::TooFewArguments, 0, 2);
        assert_eq!(err.kind(), Some(CallErrorKind::TooFewArguments));
        assert!(!err.is_ok());
        assert!(CallError::OK.is_ok());
        assert_eq!(CallError { error: 42, ..CallError::OK }.kind(), None);
    }
}
