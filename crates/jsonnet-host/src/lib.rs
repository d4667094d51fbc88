//! Jsonnet Host Boundary
//!
//! Drives the native libjsonnet evaluation engine through its C ABI and
//! lets host code take part in evaluation through import resolvers and
//! native functions.
//!
//! # Key Pieces
//!
//! 1. **Value codec**: [`Value`] to and from JSON text, and to and from the
//!    engine's JSON value handles used by native callbacks.
//!
//! 2. **Buffer ownership**: everything that crosses the boundary is
//!    allocated by the owning VM's allocator and released exactly once
//!    through [`NativeBuffer`].
//!
//! 3. **Callback bridges**: host resolvers and functions run inside the
//!    engine's evaluate call; their failures and panics are converted into
//!    the engine's failure protocol and never unwind into native code.
//!
//! # Example
//!
//! ```rust,no_run
//! use jsonnet_host::{evaluate_snippet, Configuration, NativeCallback, Value};
//!
//! let config = Configuration::new()
//!     .ext_var("env", "prod")
//!     .native_callback(
//!         "upper",
//!         NativeCallback::new(["s"], |args| {
//!             let s = args[0].as_str().ok_or("expected a string")?;
//!             Ok(Value::from(s.to_uppercase()))
//!         }),
//!     );
//!
//! let out = evaluate_snippet("main", "std.native('upper')(std.extVar('env'))", &config)?;
//! assert_eq!(out, "\"PROD\"\n");
//! # Ok::<(), jsonnet_host::Error>(())
//! ```

mod buffer;
mod codec;
mod config;
mod error;
mod eval;
mod ffi;
mod import;
mod native;
mod value;
mod vm;

pub use buffer::{BufferStats, NativeBuffer};
pub use config::{ConfigError, Configuration};
pub use error::{CallbackError, CodecError, Error, Result};
pub use eval::{
    evaluate_file, evaluate_file_multi, evaluate_file_stream, evaluate_snippet,
    evaluate_snippet_multi, evaluate_snippet_stream, evaluate_snippet_value,
};
pub use import::{FileImporter, ImportResolver, ResolvedImport};
pub use native::NativeCallback;
pub use value::Value;
pub use vm::Vm;

/// Version string of the linked engine
pub fn version() -> String {
    // SAFETY: returns a pointer to a static NUL-terminated string.
    let raw = unsafe { ffi::jsonnet_version() };
    if raw.is_null() {
        return String::new();
    }
    unsafe { std::ffi::CStr::from_ptr(raw) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_version_reported() {
        assert!(super::version().starts_with('v'));
    }
}
