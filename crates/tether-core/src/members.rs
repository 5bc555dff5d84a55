//! Class Members
//!
//! Methods, properties, signals and integer constants declared on a
//! [`ClassDescriptor`](crate::registrar::ClassDescriptor).
//!
//! Every method gets both engine call paths. The ptrcall path reuses the
//! slot codecs and failure handling of virtual overrides. The variant call
//! path checks the argument count, decodes each argument with
//! [`FromVariant`](crate::variant::FromVariant) and reports problems through
//! the `CallError` out-parameter instead of unwinding:
//!
//! | problem                      | reported as                                 |
//! |------------------------------|---------------------------------------------|
//! | wrong argument count         | `TooFewArguments` / `TooManyArguments`      |
//! | argument of the wrong kind   | `InvalidArgument` with index and kind       |
//! | panic or re-entrant call     | `InvalidMethod`, logged                     |
//! | runtime gone or null receiver| `InstanceIsNull`                            |
//!
//! Properties name a getter and optional setter among the declared methods;
//! they are checked before the class reaches the host.

use std::any::TypeId;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tether_sys::{
    CallError, CallErrorKind, ClassMethodInfo, MethodFlags, PropertyInfo, RawArgs, RawInstance,
    RawRet, RawString, RawStringName, RawVariant, RawVariantArgs,
};

use crate::dispatch::{recover_panic, run_entry, InstanceStorage, MethodArgs, VirtualEntry};
use crate::error::RegistrationError;
use crate::frame::PtrCall;
use crate::host::HostApi;
use crate::name::{NameInterner, StringName};
use crate::variant::{ToVariant, Variant, VariantKind};

type VarThunk<T> = dyn Fn(&mut T, &[Variant]) -> Result<Variant, CallError> + Send + Sync;

/// One method: both call paths and the signature the engine is told about
pub(crate) struct MethodEntry<T> {
    ptr: VirtualEntry<T>,
    var: Box<VarThunk<T>>,
    args: Vec<(String, VariantKind)>,
    ret: Option<VariantKind>,
    flags: MethodFlags,
}

impl<T: 'static> MethodEntry<T> {
    pub(crate) fn new<A, R, F>(name: &str, arg_names: &[&str], flags: MethodFlags, f: F) -> Self
    where
        A: MethodArgs + 'static,
        R: PtrCall + ToVariant + Default + 'static,
        F: Fn(&mut T, A) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let ptr_f = Arc::clone(&f);
        let kinds = A::kinds();
        let args = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                let name = arg_names
                    .get(i)
                    .map_or_else(|| format!("arg{}", i), |n| n.to_string());
                (name, *kind)
            })
            .collect();
        let var = move |this: &mut T, args: &[Variant]| -> Result<Variant, CallError> {
            let args = A::from_variants(args).map_err(|(index, e)| {
                log::debug!("argument {} rejected: {}", index, e);
                CallError::new(CallErrorKind::InvalidArgument, index as i32, kinds[index] as i32)
            })?;
            Ok(f(this, args).to_variant())
        };
        let ret = (TypeId::of::<R>() != TypeId::of::<()>()).then_some(R::KIND);
        Self {
            ptr: VirtualEntry::new(name, move |this: &mut T, args: A| ptr_f(this, args)),
            var: Box::new(var),
            args,
            ret,
            flags,
        }
    }
}

impl<T> MethodEntry<T> {
    pub(crate) fn name(&self) -> &str {
        self.ptr.name()
    }

    fn arity(&self) -> usize {
        self.args.len()
    }

    /// # Safety
    /// `instance` must be null or the storage attached for `T`, and `args`
    /// must hold `count` pointers to valid variants.
    unsafe fn varcall(
        &self,
        instance: RawInstance,
        args: RawVariantArgs,
        count: i64,
        ret: *mut RawVariant,
    ) -> Result<(), CallError> {
        let null_instance = || CallError::new(CallErrorKind::InstanceIsNull, 0, 0);
        if instance.is_null() {
            return Err(null_instance());
        }
        let storage = &*(instance.0 as *const InstanceStorage<T>);
        let Some(rt) = storage.rt.upgrade() else {
            log::error!("method '{}' called after the runtime shut down", self.name());
            return Err(null_instance());
        };
        rt.stats().record_method_call();

        let count = usize::try_from(count).unwrap_or(0);
        let expected = self.arity() as i32;
        if count < self.arity() {
            return Err(CallError::new(CallErrorKind::TooFewArguments, 0, expected));
        }
        if count > self.arity() {
            return Err(CallError::new(CallErrorKind::TooManyArguments, 0, expected));
        }

        let bridge = rt.bridge();
        let mut values = Vec::with_capacity(count);
        for (index, (_, kind)) in self.args.iter().enumerate() {
            match (*args.add(index)).as_ref().map(|raw| bridge.from_raw_borrowed(raw)) {
                Some(Ok(value)) => values.push(value),
                _ => {
                    return Err(CallError::new(
                        CallErrorKind::InvalidArgument,
                        index as i32,
                        *kind as i32,
                    ))
                }
            }
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            storage.with_mut(|value| (self.var)(value, &values))
        }));
        let failure = match outcome {
            Ok(Ok(Ok(result))) => {
                ret.write(bridge.to_raw(&result));
                return Ok(());
            }
            Ok(Ok(Err(rejected))) => return Err(rejected),
            Ok(Err(e)) => e.to_string(),
            Err(payload) => recover_panic(payload, self.name()),
        };
        log::error!(
            "method '{}' on object {:#x} failed: {}",
            self.name(),
            storage.base.addr(),
            failure
        );
        rt.stats().record_method_failure();
        Err(CallError::new(CallErrorKind::InvalidMethod, 0, 0))
    }
}

pub(crate) unsafe extern "C" fn call_method<T: Send + 'static>(
    userdata: *mut c_void,
    instance: RawInstance,
    args: RawVariantArgs,
    count: i64,
    ret: *mut RawVariant,
    error: *mut CallError,
) {
    let entry = &*(userdata as *const MethodEntry<T>);
    ret.write(RawVariant::NIL);
    let outcome = entry.varcall(instance, args, count, ret);
    error.write(match outcome {
        Ok(()) => CallError::OK,
        Err(e) => e,
    });
}

pub(crate) unsafe extern "C" fn ptrcall_method<T: Send + 'static>(
    userdata: *mut c_void,
    instance: RawInstance,
    args: RawArgs,
    ret: RawRet,
) {
    let entry = &*(userdata as *const MethodEntry<T>);
    if instance.is_null() {
        log::error!("method '{}' ptrcalled without an instance", entry.name());
        entry.ptr.write_zeroed(ret);
        return;
    }
    let storage = &*(instance.0 as *const InstanceStorage<T>);
    let Some(rt) = storage.rt.upgrade() else {
        log::error!("method '{}' called after the runtime shut down", entry.name());
        entry.ptr.write_zeroed(ret);
        return;
    };
    rt.stats().record_method_call();
    if !run_entry(&rt, storage, &entry.ptr, args, ret) {
        rt.stats().record_method_failure();
    }
}

// ============================================================================
// Declarations
// ============================================================================

struct PropertyDecl {
    name: String,
    getter: String,
    setter: Option<String>,
}

struct SignalDecl {
    name: String,
    args: Vec<(String, VariantKind)>,
}

struct ConstantDecl {
    enum_name: Option<String>,
    name: String,
    value: i64,
    is_bitfield: bool,
}

/// Everything a class declares besides its constructor and virtual overrides
pub(crate) struct Members<T> {
    methods: Vec<MethodEntry<T>>,
    declarations: Declarations,
}

/// Members that need no callbacks once registered
#[derive(Default)]
pub(crate) struct Declarations {
    properties: Vec<PropertyDecl>,
    signals: Vec<SignalDecl>,
    constants: Vec<ConstantDecl>,
}

impl<T> Default for Members<T> {
    fn default() -> Self {
        Self {
            methods: Vec::new(),
            declarations: Declarations::default(),
        }
    }
}

impl<T> Members<T> {
    pub(crate) fn add_method(&mut self, entry: MethodEntry<T>) {
        self.methods.retain(|m| m.name() != entry.name());
        self.methods.push(entry);
    }

    pub(crate) fn add_property(&mut self, name: &str, getter: &str, setter: Option<&str>) {
        let properties = &mut self.declarations.properties;
        properties.retain(|p| p.name != name);
        properties.push(PropertyDecl {
            name: name.to_string(),
            getter: getter.to_string(),
            setter: setter.map(str::to_string),
        });
    }

    pub(crate) fn add_signal(&mut self, name: &str, args: &[(&str, VariantKind)]) {
        let signals = &mut self.declarations.signals;
        signals.retain(|s| s.name != name);
        signals.push(SignalDecl {
            name: name.to_string(),
            args: args.iter().map(|(n, k)| (n.to_string(), *k)).collect(),
        });
    }

    pub(crate) fn add_constant(&mut self, enum_name: Option<&str>, name: &str, value: i64, is_bitfield: bool) {
        let constants = &mut self.declarations.constants;
        constants.retain(|c| c.name != name);
        constants.push(ConstantDecl {
            enum_name: enum_name.map(str::to_string),
            name: name.to_string(),
            value,
            is_bitfield,
        });
    }

    /// Declared method names in declaration order
    pub(crate) fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|m| m.name())
    }

    /// Property accessors must be declared methods: a getter taking nothing
    /// and returning a value, a setter taking one argument
    pub(crate) fn validate(&self, class: &str) -> Result<(), RegistrationError> {
        let find = |name: &str| self.methods.iter().find(|m| m.name() == name);
        for property in &self.declarations.properties {
            let unknown = |method: &str| RegistrationError::UnknownAccessor {
                class: class.to_string(),
                property: property.name.clone(),
                method: method.to_string(),
            };
            match find(&property.getter) {
                Some(getter) if getter.arity() == 0 && getter.ret.is_some() => {}
                _ => return Err(unknown(&property.getter)),
            }
            if let Some(setter) = &property.setter {
                match find(setter) {
                    Some(m) if m.arity() == 1 => {}
                    _ => return Err(unknown(setter)),
                }
            }
        }
        Ok(())
    }

    pub(crate) fn split(self) -> (Vec<Box<MethodEntry<T>>>, Declarations) {
        let methods = self.methods.into_iter().map(Box::new).collect();
        (methods, self.declarations)
    }
}

fn describe(host: &HostApi, names: &NameInterner, name: &str, kind: VariantKind) -> PropertyInfo {
    PropertyInfo {
        variant_type: kind as u32,
        name: names.to_raw(&names.intern(name), host),
        class_name: RawStringName::NULL,
        hint: 0,
        hint_string: RawString::NULL,
        usage: PropertyInfo::USAGE_DEFAULT,
    }
}

/// Register each method with the host. The boxed entries become the method
/// userdata, so they must live as long as the class registration.
///
/// Returns the name of the first method the host refused.
pub(crate) fn register_methods<T: Send + 'static>(
    host: &HostApi,
    names: &NameInterner,
    class: &StringName,
    methods: &[Box<MethodEntry<T>>],
) -> Result<(), String> {
    let raw_class = names.to_raw(class, host);
    for entry in methods {
        let args: Vec<PropertyInfo> = entry
            .args
            .iter()
            .map(|(name, kind)| describe(host, names, name, *kind))
            .collect();
        let ret = entry.ret.map(|kind| describe(host, names, "", kind));
        let info = ClassMethodInfo {
            name: names.to_raw(&names.intern(entry.name()), host),
            method_userdata: &**entry as *const MethodEntry<T> as *mut c_void,
            call: Some(call_method::<T>),
            ptrcall: Some(ptrcall_method::<T>),
            flags: entry.flags,
            has_return_value: ret.is_some(),
            return_value_info: ret.as_ref().map_or(std::ptr::null(), |r| r as *const PropertyInfo),
            argument_count: args.len() as u32,
            arguments_info: if args.is_empty() {
                std::ptr::null()
            } else {
                args.as_ptr()
            },
        };
        // SAFETY: the entry is boxed in the class binding, which outlives
        // the registration; the info arrays live until the call returns
        if !unsafe { host.register_method(raw_class, &info) } {
            return Err(entry.name().to_string());
        }
        log::trace!("registered method {}::{}", class, entry.name());
    }
    Ok(())
}

impl Declarations {
    /// Register properties, signals and constants, in that order. Returns
    /// the name of the first member the host refused.
    pub(crate) fn register<T>(
        &self,
        host: &HostApi,
        names: &NameInterner,
        class: &StringName,
        methods: &[Box<MethodEntry<T>>],
    ) -> Result<(), String> {
        let raw_class = names.to_raw(class, host);
        let raw_name = |text: &str| names.to_raw(&names.intern(text), host);

        for property in &self.properties {
            let kind = methods
                .iter()
                .find(|m| m.name() == property.getter)
                .and_then(|m| m.ret)
                .unwrap_or(VariantKind::Nil);
            let info = describe(host, names, &property.name, kind);
            let setter = raw_name(property.setter.as_deref().unwrap_or(""));
            if !host.register_property(raw_class, &info, setter, raw_name(&property.getter)) {
                return Err(property.name.clone());
            }
        }

        for signal in &self.signals {
            let args: Vec<PropertyInfo> = signal
                .args
                .iter()
                .map(|(name, kind)| describe(host, names, name, *kind))
                .collect();
            if !host.register_signal(raw_class, raw_name(&signal.name), &args) {
                return Err(signal.name.clone());
            }
        }

        for constant in &self.constants {
            let enum_name = constant
                .enum_name
                .as_deref()
                .map_or(RawStringName::NULL, raw_name);
            let accepted = host.register_constant(
                raw_class,
                enum_name,
                raw_name(&constant.name),
                constant.value,
                constant.is_bitfield,
            );
            if !accepted {
                return Err(constant.name.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Door {
        open: bool,
    }

    fn members() -> Members<Door> {
        let mut members = Members::default();
        members.add_method(MethodEntry::new(
            "is_open",
            &[],
            MethodFlags::CONST,
            |d: &mut Door, (): ()| d.open,
        ));
        members.add_method(MethodEntry::new(
            "set_open",
            &["open"],
            MethodFlags::NORMAL,
            |d: &mut Door, (open,): (bool,)| d.open = open,
        ));
        members
    }

    #[test]
    fn test_method_signature_is_recorded() {
        let members = members();
        let names: Vec<_> = members.method_names().collect();
        assert_eq!(names, vec!["is_open", "set_open"]);
        let setter = &members.methods[1];
        assert_eq!(setter.args, vec![("open".to_string(), VariantKind::Bool)]);
        assert_eq!(setter.ret, None);
        assert_eq!(members.methods[0].ret, Some(VariantKind::Bool));
    }

    #[test]
    fn test_unnamed_arguments_get_positional_names() {
        let entry = MethodEntry::new(
            "mix",
            &["a"],
            MethodFlags::NORMAL,
            |_: &mut Door, (a, b): (i64, f64)| a as f64 + b,
        );
        assert_eq!(entry.args[1], ("arg1".to_string(), VariantKind::Float));
    }

    #[test]
    fn test_property_accessors_must_be_declared() {
        let mut members = members();
        members.add_property("open", "is_open", Some("set_open"));
        assert!(members.validate("Door").is_ok());

        members.add_property("locked", "is_locked", None);
        let err = members.validate("Door").unwrap_err();
        assert_eq!(
            err,
            RegistrationError::UnknownAccessor {
                class: "Door".to_string(),
                property: "locked".to_string(),
                method: "is_locked".to_string(),
            }
        );
    }

    #[test]
    fn test_setter_cannot_serve_as_getter() {
        let mut members = members();
        members.add_property("open", "set_open", None);
        assert!(members.validate("Door").is_err());
    }
}
