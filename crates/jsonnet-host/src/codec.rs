//! Native Value Codec
//!
//! Converts between [`Value`] and the engine's JSON value handles used by
//! native callbacks. The engine only passes primitives as arguments, so
//! decoding covers null, booleans, numbers and strings; encoding builds any
//! value, arrays and objects included.

use crate::error::CodecError;
use crate::ffi::{self, JsonnetJsonValue, JsonnetVm};
use crate::value::Value;
use std::ffi::{CStr, CString};
use std::ptr::NonNull;

/// Decode one argument handle passed by the engine
///
/// # Safety
///
/// `vm` must be live and `arg` must be a handle the engine passed to the
/// current callback invocation.
pub(crate) unsafe fn decode_argument(
    vm: *mut JsonnetVm,
    arg: *const JsonnetJsonValue,
    param: &str,
) -> Result<Value, CodecError> {
    if arg.is_null() {
        return Err(CodecError::UnsupportedNativeValue(param.to_string()));
    }

    unsafe {
        let s = ffi::jsonnet_json_extract_string(vm, arg);
        if !s.is_null() {
            let text = CStr::from_ptr(s)
                .to_str()
                .map_err(|_| CodecError::InvalidUtf8)?;
            return Ok(Value::String(text.to_string()));
        }

        let mut n = 0.0;
        if ffi::jsonnet_json_extract_number(vm, arg, &mut n) != 0 {
            return Ok(Value::Number(n));
        }

        match ffi::jsonnet_json_extract_bool(vm, arg) {
            0 => return Ok(Value::Bool(false)),
            1 => return Ok(Value::Bool(true)),
            _ => {}
        }

        if ffi::jsonnet_json_extract_null(vm, arg) != 0 {
            return Ok(Value::Null);
        }
    }

    Err(CodecError::UnsupportedNativeValue(param.to_string()))
}

/// An engine JSON value handle not yet handed to the engine
///
/// Destroyed on drop, which also frees any children already appended.
pub(crate) struct NativeValue {
    vm: *mut JsonnetVm,
    ptr: NonNull<JsonnetJsonValue>,
}

impl NativeValue {
    fn wrap(vm: *mut JsonnetVm, raw: *mut JsonnetJsonValue) -> Result<Self, CodecError> {
        NonNull::new(raw)
            .map(|ptr| Self { vm, ptr })
            .ok_or(CodecError::MalformedOutput("engine returned a NULL value handle"))
    }

    /// Hand the handle to the engine
    pub(crate) fn into_raw(self) -> *mut JsonnetJsonValue {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl Drop for NativeValue {
    fn drop(&mut self) {
        // SAFETY: the handle was created on `vm` and not handed off.
        unsafe { ffi::jsonnet_json_destroy(self.vm, self.ptr.as_ptr()) };
    }
}

/// Build an engine-side handle tree for `value`
///
/// # Safety
///
/// `vm` must be live for the lifetime of the returned handle.
pub(crate) unsafe fn encode_value(
    vm: *mut JsonnetVm,
    value: &Value,
) -> Result<NativeValue, CodecError> {
    unsafe {
        match value {
            Value::Null => NativeValue::wrap(vm, ffi::jsonnet_json_make_null(vm)),
            Value::Bool(b) => NativeValue::wrap(vm, ffi::jsonnet_json_make_bool(vm, i32::from(*b))),
            Value::Number(n) => {
                if !n.is_finite() {
                    return Err(CodecError::NonFiniteNumber(*n));
                }
                NativeValue::wrap(vm, ffi::jsonnet_json_make_number(vm, *n))
            }
            Value::String(s) => {
                let c = CString::new(s.as_str())?;
                NativeValue::wrap(vm, ffi::jsonnet_json_make_string(vm, c.as_ptr()))
            }
            Value::Array(items) => {
                let arr = NativeValue::wrap(vm, ffi::jsonnet_json_make_array(vm))?;
                for item in items {
                    let child = encode_value(vm, item)?;
                    ffi::jsonnet_json_array_append(vm, arr.ptr.as_ptr(), child.into_raw());
                }
                Ok(arr)
            }
            Value::Object(fields) => {
                let obj = NativeValue::wrap(vm, ffi::jsonnet_json_make_object(vm))?;
                for (key, field) in fields {
                    let key = CString::new(key.as_str())?;
                    let child = encode_value(vm, field)?;
                    ffi::jsonnet_json_object_append(vm, obj.ptr.as_ptr(), key.as_ptr(), child.into_raw());
                }
                Ok(obj)
            }
        }
    }
}
