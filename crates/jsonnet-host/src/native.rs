//! Native Callback Bridge
//!
//! Host functions become callable from evaluated code as
//! `std.native(name)(args...)`. Each registration owns its handler and its
//! parameter list; the engine passes the registration back as `ctx`, so no
//! global lookup table exists.

use crate::codec::{self, NativeValue};
use crate::config::ConfigError;
use crate::error::CallbackError;
use crate::ffi::{self, JsonnetJsonValue, JsonnetVm};
use crate::import::panic_message;
use crate::value::Value;
use std::ffi::{c_int, c_void, CString};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace, warn};

type HostFn = dyn Fn(&[Value]) -> Result<Value, CallbackError> + Send + Sync;

/// A host function together with its declared parameter names
///
/// The engine enforces arity against the parameter list, so the handler
/// always receives exactly `params().len()` arguments, in order.
#[derive(Clone)]
pub struct NativeCallback {
    params: Vec<String>,
    func: Arc<HostFn>,
}

impl NativeCallback {
    pub fn new<I, S, F>(params: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&[Value]) -> Result<Value, CallbackError> + Send + Sync + 'static,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            func: Arc::new(func),
        }
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Call the handler directly, outside any engine
    pub fn call(&self, args: &[Value]) -> Result<Value, CallbackError> {
        (self.func)(args)
    }

    /// Check the registration name and parameter list
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if name.is_empty() || name.contains('\0') {
            return Err(ConfigError::InvalidCallbackName(name.to_string()));
        }

        for (i, param) in self.params.iter().enumerate() {
            if !is_identifier(param) {
                return Err(ConfigError::InvalidParameterName {
                    callback: name.to_string(),
                    param: param.clone(),
                });
            }
            if self.params[..i].contains(param) {
                return Err(ConfigError::DuplicateParameter {
                    callback: name.to_string(),
                    param: param.clone(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for NativeCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCallback")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Registration context handed to the engine as the callback's `ctx`
pub(crate) struct NativeBridge {
    vm_id: u64,
    vm: *mut JsonnetVm,
    name: String,
    callback: NativeCallback,
}

impl NativeBridge {
    pub(crate) fn new(vm_id: u64, vm: *mut JsonnetVm, name: &str, callback: NativeCallback) -> Self {
        Self {
            vm_id,
            vm,
            name: name.to_string(),
            callback,
        }
    }

    /// Decode the arguments, run the handler, encode its result
    ///
    /// # Safety
    ///
    /// `argv` must hold one valid handle per declared parameter.
    unsafe fn invoke(
        &self,
        argv: *const *const JsonnetJsonValue,
    ) -> Result<NativeValue, CallbackError> {
        let params = self.callback.params();
        let mut args = Vec::with_capacity(params.len());
        for (i, param) in params.iter().enumerate() {
            let arg = unsafe { *argv.add(i) };
            args.push(unsafe { codec::decode_argument(self.vm, arg, param) }?);
        }

        let result = self.callback.call(&args)?;
        Ok(unsafe { codec::encode_value(self.vm, &result) }?)
    }

    fn failure_value(&self, message: &str) -> *mut JsonnetJsonValue {
        let clean = CString::new(message.replace('\0', " ")).unwrap_or_default();
        // SAFETY: the VM outlives its registrations.
        let value = unsafe { ffi::jsonnet_json_make_string(self.vm, clean.as_ptr()) };
        if value.is_null() {
            error!(vm_id = self.vm_id, name = %self.name, "Cannot report native failure");
        }
        value
    }
}

/// Engine-facing native callback
///
/// # Safety
///
/// `ctx` must point to a live [`NativeBridge`], `argv` must hold one handle
/// per declared parameter and `success` must be writable.
pub(crate) unsafe extern "C" fn native_trampoline(
    ctx: *mut c_void,
    argv: *const *const JsonnetJsonValue,
    success: *mut c_int,
) -> *mut JsonnetJsonValue {
    let bridge = unsafe { &*(ctx as *const NativeBridge) };
    trace!(vm_id = bridge.vm_id, name = %bridge.name, "Native call");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { bridge.invoke(argv) }));

    let message = match outcome {
        Ok(Ok(value)) => {
            unsafe { *success = 1 };
            return value.into_raw();
        }
        Ok(Err(e)) => {
            warn!(vm_id = bridge.vm_id, name = %bridge.name, "Native call failed: {}", e);
            e.message().to_string()
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!(vm_id = bridge.vm_id, name = %bridge.name, "Native call panicked: {}", msg);
            format!("native function '{}' panicked: {}", bridge.name, msg)
        }
    };

    unsafe { *success = 0 };
    bridge.failure_value(&message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    fn concat() -> NativeCallback {
        NativeCallback::new(["a", "b"], |args| {
            match (args[0].as_str(), args[1].as_str()) {
                (Some(a), Some(b)) => Ok(Value::from(format!("{a}{b}"))),
                _ => Err(CallbackError::new("concat expects two strings")),
            }
        })
    }

    #[test]
    fn test_validate_parameters() {
        assert!(concat().validate("concat").is_ok());
        assert!(NativeCallback::new(Vec::<String>::new(), |_| Ok(Value::Null))
            .validate("zero")
            .is_ok());

        assert_eq!(
            concat().validate(""),
            Err(ConfigError::InvalidCallbackName(String::new()))
        );
        assert!(matches!(
            NativeCallback::new(["x", "x"], |_| Ok(Value::Null)).validate("f"),
            Err(ConfigError::DuplicateParameter { .. })
        ));
        assert!(matches!(
            NativeCallback::new(["1x"], |_| Ok(Value::Null)).validate("f"),
            Err(ConfigError::InvalidParameterName { .. })
        ));
    }

    #[test]
    fn test_direct_call() {
        let cb = concat();
        assert_eq!(cb.call(&[Value::from("a"), Value::from("b")]), Ok(Value::from("ab")));
        assert!(cb.call(&[Value::from(1), Value::from("b")]).is_err());
    }

    #[test]
    fn test_concat_from_evaluated_code() {
        let mut vm = Vm::new();
        vm.register_native("concat", concat()).unwrap();
        let out = vm
            .evaluate_snippet(
                "snippet",
                "std.assertEqual(std.native('concat')('foo', 'bar'), 'foobar')",
            )
            .unwrap();
        assert_eq!(out, "true\n");
    }

    #[test]
    fn test_primitive_arguments_decode() {
        let mut vm = Vm::new();
        vm.register_native(
            "describe",
            NativeCallback::new(["a", "b", "c", "d"], |args| {
                Ok(Value::from(
                    args.iter().map(|v| Value::from(v.kind())).collect::<Vec<_>>(),
                ))
            }),
        )
        .unwrap();
        let out = vm
            .evaluate_snippet("snippet", "std.native('describe')(null, true, 1.5, 's')")
            .unwrap();
        assert_eq!(
            Value::from_json(&out).unwrap(),
            Value::from(vec![
                Value::from("null"),
                Value::from("boolean"),
                Value::from("number"),
                Value::from("string"),
            ])
        );
    }

    #[test]
    fn test_structured_result() {
        let mut vm = Vm::new();
        vm.register_native(
            "config",
            NativeCallback::new(["port"], |args| {
                Value::from_json(&format!(
                    r#"{{"port": {}, "hosts": ["a", "b"], "tls": null}}"#,
                    args[0]
                ))
                .map_err(CallbackError::from)
            }),
        )
        .unwrap();
        let out = vm
            .evaluate_snippet("snippet", "local c = std.native('config')(8080); [c.port, c.hosts[1]]")
            .unwrap();
        assert_eq!(
            Value::from_json(&out).unwrap(),
            Value::from(vec![Value::from(8080), Value::from("b")])
        );
    }

    #[test]
    fn test_panic_becomes_evaluation_error() {
        let mut vm = Vm::new();
        vm.register_native(
            "boom",
            NativeCallback::new(["x"], |_| -> Result<Value, CallbackError> { panic!("kaboom") }),
        )
        .unwrap();
        let err = vm.evaluate_snippet("snippet", "std.native('boom')(1)").unwrap_err();
        let message = err.evaluation_message().unwrap();
        assert!(message.contains("kaboom"));
    }

    #[test]
    fn test_unencodable_result_becomes_failure() {
        let mut vm = Vm::new();
        vm.register_native(
            "inf",
            NativeCallback::new(["x"], |_| Ok(Value::Number(f64::INFINITY))),
        )
        .unwrap();
        let err = vm.evaluate_snippet("snippet", "std.native('inf')(1)").unwrap_err();
        assert!(err.to_string().contains("no JSON representation"));
    }
}
