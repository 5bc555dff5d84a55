//! Tether Core - extension binding runtime
//!
//! This crate is the layer every generated engine wrapper calls into:
//! - Handle registry: ownership-tagged object handles with RAII release
//! - Call frames: typed argument encoding and result decoding for ptrcalls
//! - Variant bridge: the engine's tagged union as a Rust enum
//! - Method bind table: lazily resolved, process-lifetime method binds
//! - Virtual dispatch: engine calls into Rust overrides, never unwinding
//! - Class registrar: Rust classes registered with the engine's class database,
//!   with methods callable through ptrcall and variant calls, properties,
//!   signals and integer constants
//! - Variant calls and custom callables: dynamic calls in both directions
//!
//! Everything hangs off a [`Runtime`] built from the host's function table.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod callable;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handle;
pub mod host;
pub mod logging;
mod members;
pub mod method_bind;
pub mod name;
pub mod registrar;
pub mod runtime;
pub mod variant;

pub use tether_sys as sys;

pub use callable::{CallableFn, CallableHandle};
pub use config::RuntimeConfig;
pub use dispatch::{DispatchError, MethodArgs, VirtualArgs, VirtualCallData, VirtualTable};
pub use error::{
    AbiViolation, ConfigError, ConversionError, ConversionErrorKind, ConversionResult,
    OwnershipError, RegistrationError, RuntimeError, VarcallError,
};
pub use frame::{Frame, PtrArg, PtrCall, Receiver, MAX_FRAME_ARGS};
pub use handle::{
    BorrowScope, CallScope, Class, HandleRegistry, HandleStats, Inherits, ManagedHandle, Object,
    Ownership, RefCounted,
};
pub use host::HostApi;
pub use logging::init_logging;
pub use method_bind::{MethodBindEntry, MethodBindTable, MethodSpec, ReturnOwnership};
pub use name::{NameInterner, StringName};
pub use registrar::{ClassDescriptor, ClassRegistrar, ExtensionClass};
pub use runtime::{Runtime, RuntimeStats, StatsSnapshot, EMIT_SIGNAL};
pub use variant::bridge::{PackedCodec, VariantBridge};
pub use variant::{Dictionary, FromVariant, ObjectRef, ToVariant, Variant, VariantKind};
