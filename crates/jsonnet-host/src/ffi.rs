//! Raw libjsonnet C ABI
//!
//! Declarations for the subset of `libjsonnet.h` the boundary layer drives.
//! The library itself is compiled and linked by `jsonnet-sys`; these
//! declarations are kept local so the exact pointer types used by the
//! bridges are visible in one place.

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_double, c_int, c_uint, c_void};

// Pulls the static library into the final link.
use jsonnet_sys as _;

/// Opaque engine instance.
#[repr(C)]
pub struct JsonnetVm {
    _private: [u8; 0],
}

/// Opaque engine-side JSON value handle.
#[repr(C)]
pub struct JsonnetJsonValue {
    _private: [u8; 0],
}

/// Import resolver signature.
///
/// Returns a buffer allocated with `jsonnet_realloc` holding the file
/// contents on success, or an error message on failure. `found_here` must
/// only be written on success.
pub type JsonnetImportCallback = unsafe extern "C" fn(
    ctx: *mut c_void,
    base: *const c_char,
    rel: *const c_char,
    found_here: *mut *mut c_char,
    success: *mut c_int,
) -> *mut c_char;

/// Native function signature.
///
/// `argv` holds exactly as many entries as parameters were registered.
/// The returned value is owned by the engine afterwards.
pub type JsonnetNativeCallback = unsafe extern "C" fn(
    ctx: *mut c_void,
    argv: *const *const JsonnetJsonValue,
    success: *mut c_int,
) -> *mut JsonnetJsonValue;

unsafe extern "C" {
    pub fn jsonnet_version() -> *const c_char;

    pub fn jsonnet_make() -> *mut JsonnetVm;
    pub fn jsonnet_destroy(vm: *mut JsonnetVm);
    pub fn jsonnet_realloc(vm: *mut JsonnetVm, buf: *mut c_char, sz: usize) -> *mut c_char;

    pub fn jsonnet_max_stack(vm: *mut JsonnetVm, v: c_uint);
    pub fn jsonnet_gc_min_objects(vm: *mut JsonnetVm, v: c_uint);
    pub fn jsonnet_gc_growth_trigger(vm: *mut JsonnetVm, v: c_double);
    pub fn jsonnet_max_trace(vm: *mut JsonnetVm, v: c_uint);
    pub fn jsonnet_string_output(vm: *mut JsonnetVm, v: c_int);
    pub fn jsonnet_jpath_add(vm: *mut JsonnetVm, v: *const c_char);

    pub fn jsonnet_ext_var(vm: *mut JsonnetVm, key: *const c_char, val: *const c_char);
    pub fn jsonnet_ext_code(vm: *mut JsonnetVm, key: *const c_char, val: *const c_char);
    pub fn jsonnet_tla_var(vm: *mut JsonnetVm, key: *const c_char, val: *const c_char);
    pub fn jsonnet_tla_code(vm: *mut JsonnetVm, key: *const c_char, val: *const c_char);

    pub fn jsonnet_import_callback(
        vm: *mut JsonnetVm,
        cb: JsonnetImportCallback,
        ctx: *mut c_void,
    );
    pub fn jsonnet_native_callback(
        vm: *mut JsonnetVm,
        name: *const c_char,
        cb: JsonnetNativeCallback,
        ctx: *mut c_void,
        params: *const *const c_char,
    );

    pub fn jsonnet_evaluate_snippet(
        vm: *mut JsonnetVm,
        filename: *const c_char,
        snippet: *const c_char,
        error: *mut c_int,
    ) -> *mut c_char;
    pub fn jsonnet_evaluate_file(
        vm: *mut JsonnetVm,
        filename: *const c_char,
        error: *mut c_int,
    ) -> *mut c_char;
    pub fn jsonnet_evaluate_snippet_multi(
        vm: *mut JsonnetVm,
        filename: *const c_char,
        snippet: *const c_char,
        error: *mut c_int,
    ) -> *mut c_char;
    pub fn jsonnet_evaluate_file_multi(
        vm: *mut JsonnetVm,
        filename: *const c_char,
        error: *mut c_int,
    ) -> *mut c_char;
    pub fn jsonnet_evaluate_snippet_stream(
        vm: *mut JsonnetVm,
        filename: *const c_char,
        snippet: *const c_char,
        error: *mut c_int,
    ) -> *mut c_char;
    pub fn jsonnet_evaluate_file_stream(
        vm: *mut JsonnetVm,
        filename: *const c_char,
        error: *mut c_int,
    ) -> *mut c_char;

    pub fn jsonnet_json_extract_string(
        vm: *mut JsonnetVm,
        v: *const JsonnetJsonValue,
    ) -> *const c_char;
    pub fn jsonnet_json_extract_number(
        vm: *mut JsonnetVm,
        v: *const JsonnetJsonValue,
        out: *mut c_double,
    ) -> c_int;
    /// Returns 0 or 1 for a boolean, 2 when the value is not a boolean.
    pub fn jsonnet_json_extract_bool(vm: *mut JsonnetVm, v: *const JsonnetJsonValue) -> c_int;
    pub fn jsonnet_json_extract_null(vm: *mut JsonnetVm, v: *const JsonnetJsonValue) -> c_int;

    pub fn jsonnet_json_make_string(vm: *mut JsonnetVm, v: *const c_char) -> *mut JsonnetJsonValue;
    pub fn jsonnet_json_make_number(vm: *mut JsonnetVm, v: c_double) -> *mut JsonnetJsonValue;
    pub fn jsonnet_json_make_bool(vm: *mut JsonnetVm, v: c_int) -> *mut JsonnetJsonValue;
    pub fn jsonnet_json_make_null(vm: *mut JsonnetVm) -> *mut JsonnetJsonValue;
    pub fn jsonnet_json_make_array(vm: *mut JsonnetVm) -> *mut JsonnetJsonValue;
    pub fn jsonnet_json_array_append(
        vm: *mut JsonnetVm,
        arr: *mut JsonnetJsonValue,
        v: *mut JsonnetJsonValue,
    );
    pub fn jsonnet_json_make_object(vm: *mut JsonnetVm) -> *mut JsonnetJsonValue;
    pub fn jsonnet_json_object_append(
        vm: *mut JsonnetVm,
        obj: *mut JsonnetJsonValue,
        f: *const c_char,
        v: *mut JsonnetJsonValue,
    );
    pub fn jsonnet_json_destroy(vm: *mut JsonnetVm, v: *mut JsonnetJsonValue);
}
