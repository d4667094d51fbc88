//! VM Handle
//!
//! Owns one native engine instance together with everything whose lifetime
//! is tied to it: the allocator ledger and the callback registrations. The
//! engine is destroyed exactly once, on drop, before the registrations it
//! points into are freed.

use crate::buffer::{BufferStats, EngineAllocator, NativeBuffer};
use crate::error::{CodecError, Error, Result};
use crate::ffi;
use crate::import::{ImportBridge, ImportResolver};
use crate::native::{NativeBridge, NativeCallback};
use crate::value::Value;
use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_void, CString};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// One native engine instance
///
/// Not thread-safe: configuration, evaluation and the callbacks they
/// trigger all run on the thread that owns the handle. Independent handles
/// share nothing and may live on different threads.
pub struct Vm {
    id: u64,
    raw: NonNull<ffi::JsonnetVm>,
    alloc: EngineAllocator,
    import: Option<Box<ImportBridge>>,
    natives: BTreeMap<String, Box<NativeBridge>>,
    string_output: bool,
}

impl Vm {
    /// Create a fresh engine instance with engine defaults
    pub fn new() -> Self {
        let id = NEXT_VM_ID.fetch_add(1, Ordering::Relaxed);

        // SAFETY: no preconditions.
        let raw = unsafe { ffi::jsonnet_make() };
        // jsonnet_make only yields NULL when the engine's operator new fails.
        let Some(raw) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(std::alloc::Layout::new::<usize>());
        };

        info!(vm_id = id, "Creating jsonnet VM");

        Self {
            id,
            raw,
            alloc: EngineAllocator::new(raw),
            import: None,
            natives: BTreeMap::new(),
            string_output: false,
        }
    }

    /// Identifier used in log output
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn raw(&self) -> *mut ffi::JsonnetVm {
        self.raw.as_ptr()
    }

    /// Release the engine now instead of at end of scope
    pub fn dispose(self) {
        drop(self);
    }

    /// Current buffer accounting
    pub fn buffer_stats(&self) -> BufferStats {
        self.alloc.stats()
    }

    /// Copy `bytes` into a buffer owned by this VM's allocator
    pub fn allocate(&self, bytes: &[u8]) -> Result<NativeBuffer<'_>> {
        self.alloc.allocate(bytes)
    }

    pub fn max_stack(&mut self, frames: u32) {
        debug!(vm_id = self.id, frames, "Setting max stack");
        unsafe { ffi::jsonnet_max_stack(self.raw(), frames) };
    }

    pub fn gc_min_objects(&mut self, objects: u32) {
        debug!(vm_id = self.id, objects, "Setting GC min objects");
        unsafe { ffi::jsonnet_gc_min_objects(self.raw(), objects) };
    }

    pub fn gc_growth_trigger(&mut self, factor: f64) {
        debug!(vm_id = self.id, factor, "Setting GC growth trigger");
        unsafe { ffi::jsonnet_gc_growth_trigger(self.raw(), factor) };
    }

    pub fn max_trace(&mut self, frames: u32) {
        debug!(vm_id = self.id, frames, "Setting max trace");
        unsafe { ffi::jsonnet_max_trace(self.raw(), frames) };
    }

    /// Expect a string result and emit it raw instead of as JSON
    pub fn string_output(&mut self, enabled: bool) {
        debug!(vm_id = self.id, enabled, "Setting string output");
        unsafe { ffi::jsonnet_string_output(self.raw(), c_int::from(enabled)) };
        self.string_output = enabled;
    }

    /// Add a library search path for the engine's built-in importer
    ///
    /// Ignored once an import callback is installed; the callback replaces
    /// the built-in importer.
    pub fn jpath_add(&mut self, path: &Path) -> Result<()> {
        let path = path_to_cstring(path)?;
        unsafe { ffi::jsonnet_jpath_add(self.raw(), path.as_ptr()) };
        Ok(())
    }

    pub fn ext_var(&mut self, name: &str, value: &str) -> Result<()> {
        self.bind(ffi::jsonnet_ext_var, "ext var", name, value)
    }

    pub fn ext_code(&mut self, name: &str, code: &str) -> Result<()> {
        self.bind(ffi::jsonnet_ext_code, "ext code", name, code)
    }

    pub fn tla_var(&mut self, name: &str, value: &str) -> Result<()> {
        self.bind(ffi::jsonnet_tla_var, "tla var", name, value)
    }

    pub fn tla_code(&mut self, name: &str, code: &str) -> Result<()> {
        self.bind(ffi::jsonnet_tla_code, "tla code", name, code)
    }

    fn bind(
        &mut self,
        setter: unsafe extern "C" fn(*mut ffi::JsonnetVm, *const c_char, *const c_char),
        what: &str,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let key = CString::new(name).map_err(CodecError::from)?;
        let val = CString::new(value).map_err(CodecError::from)?;
        debug!(vm_id = self.id, name, "Binding {}", what);
        // SAFETY: the engine copies both strings.
        unsafe { setter(self.raw(), key.as_ptr(), val.as_ptr()) };
        Ok(())
    }

    /// Install the import resolver, replacing any previous one
    pub fn set_import_callback(&mut self, resolver: Arc<dyn ImportResolver>) {
        let bridge = Box::new(ImportBridge::new(self.id, self.alloc.clone(), resolver));
        let ctx = &*bridge as *const ImportBridge as *mut c_void;
        // SAFETY: the bridge is boxed and kept until the engine is destroyed
        // or the callback is replaced.
        unsafe { ffi::jsonnet_import_callback(self.raw(), crate::import::import_trampoline, ctx) };
        self.import = Some(bridge);
        debug!(vm_id = self.id, "Registered import callback");
    }

    pub fn has_import_callback(&self) -> bool {
        self.import.is_some()
    }

    /// Names of the registered native callbacks
    pub fn native_names(&self) -> impl Iterator<Item = &str> {
        self.natives.keys().map(String::as_str)
    }

    /// Register a host function callable as `std.native(name)`
    pub fn register_native(&mut self, name: &str, callback: NativeCallback) -> Result<()> {
        callback.validate(name)?;

        let c_name = CString::new(name).map_err(CodecError::from)?;
        let c_params = callback
            .params()
            .iter()
            .map(|p| CString::new(p.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(CodecError::from)?;
        let mut param_ptrs: Vec<*const c_char> = c_params.iter().map(|p| p.as_ptr()).collect();
        param_ptrs.push(std::ptr::null());

        let bridge = Box::new(NativeBridge::new(self.id, self.raw(), name, callback));
        let ctx = &*bridge as *const NativeBridge as *mut c_void;
        // SAFETY: the engine copies the name and parameter list; the bridge
        // is boxed and outlives its registration.
        unsafe {
            ffi::jsonnet_native_callback(
                self.raw(),
                c_name.as_ptr(),
                crate::native::native_trampoline,
                ctx,
                param_ptrs.as_ptr(),
            )
        };
        self.natives.insert(name.to_string(), bridge);
        debug!(vm_id = self.id, name, "Registered native callback");
        Ok(())
    }

    /// Evaluate source text; `label` names it in diagnostics
    pub fn evaluate_snippet(&self, label: &str, text: &str) -> Result<String> {
        let label = CString::new(label).map_err(CodecError::from)?;
        let text = CString::new(text).map_err(CodecError::from)?;
        let out = self.run("snippet", |err| unsafe {
            ffi::jsonnet_evaluate_snippet(self.raw(), label.as_ptr(), text.as_ptr(), err)
        })?;
        Ok(out.to_str()?.to_string())
    }

    /// Evaluate the file at `path`
    pub fn evaluate_file(&self, path: &Path) -> Result<String> {
        let c_path = path_to_cstring(path)?;
        let out = self.run("file", |err| unsafe {
            ffi::jsonnet_evaluate_file(self.raw(), c_path.as_ptr(), err)
        })?;
        Ok(out.to_str()?.to_string())
    }

    /// Evaluate source text whose result is an object of filename to document
    pub fn evaluate_snippet_multi(&self, label: &str, text: &str) -> Result<BTreeMap<String, String>> {
        let c_label = CString::new(label).map_err(CodecError::from)?;
        let c_text = CString::new(text).map_err(CodecError::from)?;
        let out = self.run("snippet multi", |err| unsafe {
            ffi::jsonnet_evaluate_snippet_multi(self.raw(), c_label.as_ptr(), c_text.as_ptr(), err)
        })?;
        let files = parse_multi(&out)?;
        self.check_multi_names(&files, || self.evaluate_snippet(label, text))?;
        Ok(files)
    }

    pub fn evaluate_file_multi(&self, path: &Path) -> Result<BTreeMap<String, String>> {
        let c_path = path_to_cstring(path)?;
        let out = self.run("file multi", |err| unsafe {
            ffi::jsonnet_evaluate_file_multi(self.raw(), c_path.as_ptr(), err)
        })?;
        let files = parse_multi(&out)?;
        self.check_multi_names(&files, || self.evaluate_file(path))?;
        Ok(files)
    }

    /// Reject a multi result whose first file name is empty
    ///
    /// Names arrive sorted, so an empty name is always first, and in the
    /// packed output it looks exactly like the terminator of an empty
    /// result. An empty map is therefore confirmed by rendering the result
    /// once more as a whole.
    fn check_multi_names(
        &self,
        files: &BTreeMap<String, String>,
        render: impl FnOnce() -> Result<String>,
    ) -> Result<()> {
        if !files.is_empty() {
            return Ok(());
        }

        if self.string_output {
            unsafe { ffi::jsonnet_string_output(self.raw(), 0) };
        }
        let rendered = render();
        if self.string_output {
            unsafe { ffi::jsonnet_string_output(self.raw(), 1) };
        }

        match Value::from_json(&rendered?)? {
            Value::Object(fields) if fields.is_empty() => Ok(()),
            _ => {
                warn!(vm_id = self.id, "Multi output has an empty file name");
                Err(CodecError::MalformedOutput("multi output has an empty file name").into())
            }
        }
    }

    /// Evaluate source text whose result is an array of documents
    pub fn evaluate_snippet_stream(&self, label: &str, text: &str) -> Result<Vec<String>> {
        let label = CString::new(label).map_err(CodecError::from)?;
        let text = CString::new(text).map_err(CodecError::from)?;
        let out = self.run("snippet stream", |err| unsafe {
            ffi::jsonnet_evaluate_snippet_stream(self.raw(), label.as_ptr(), text.as_ptr(), err)
        })?;
        parse_stream(&out)
    }

    pub fn evaluate_file_stream(&self, path: &Path) -> Result<Vec<String>> {
        let c_path = path_to_cstring(path)?;
        let out = self.run("file stream", |err| unsafe {
            ffi::jsonnet_evaluate_file_stream(self.raw(), c_path.as_ptr(), err)
        })?;
        parse_stream(&out)
    }

    /// Run one native evaluate call and take ownership of its output
    ///
    /// The output buffer is released when the returned guard drops, on the
    /// error path included.
    fn run(
        &self,
        kind: &str,
        call: impl FnOnce(*mut c_int) -> *mut c_char,
    ) -> Result<NativeBuffer<'_>> {
        let mut error: c_int = 0;
        let raw = call(&mut error);
        // SAFETY: evaluate calls return a buffer from this VM's allocator.
        let out = unsafe { self.alloc.adopt(raw) }
            .ok_or(CodecError::MalformedOutput("engine returned a NULL result"))?;

        if error != 0 {
            let message = String::from_utf8_lossy(out.as_bytes()).into_owned();
            debug!(vm_id = self.id, kind, "Evaluation failed");
            return Err(Error::Evaluation(message));
        }

        debug!(vm_id = self.id, kind, bytes = out.len(), "Evaluation succeeded");
        Ok(out)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // SAFETY: destroyed exactly once; the callback contexts are freed
        // after this, when the fields drop.
        unsafe { ffi::jsonnet_destroy(self.raw()) };
        info!(vm_id = self.id, "{}", self.alloc.stats().format());
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    let s = path.to_str().ok_or(CodecError::InvalidUtf8)?;
    Ok(CString::new(s).map_err(CodecError::from)?)
}

fn parse_multi(out: &NativeBuffer<'_>) -> Result<BTreeMap<String, String>> {
    // SAFETY: multi output is `name\0doc\0...\0\0`.
    let parts = unsafe { out.nul_separated() };
    if parts.len() % 2 != 0 {
        return Err(CodecError::MalformedOutput("multi output has a name without a document").into());
    }

    parts
        .chunks_exact(2)
        .map(|pair| -> Result<(String, String)> {
            let name = std::str::from_utf8(pair[0]).map_err(|_| CodecError::InvalidUtf8)?;
            let doc = std::str::from_utf8(pair[1]).map_err(|_| CodecError::InvalidUtf8)?;
            Ok((name.to_string(), doc.to_string()))
        })
        .collect()
}

fn parse_stream(out: &NativeBuffer<'_>) -> Result<Vec<String>> {
    // SAFETY: stream output is `doc\0doc\0...\0\0`.
    let parts = unsafe { out.nul_separated() };
    parts
        .into_iter()
        .map(|doc| {
            std::str::from_utf8(doc)
                .map(str::to_string)
                .map_err(|_| Error::from(CodecError::InvalidUtf8))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;

    #[test]
    fn test_vm_ids_are_unique() {
        let a = Vm::new();
        let b = Vm::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_result_buffer_is_released() {
        let vm = Vm::new();
        let out = vm.evaluate_snippet("snippet", "1 + 1").unwrap();
        assert_eq!(out, "2\n");

        let stats = vm.buffer_stats();
        assert_eq!(stats.adopted, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_error_buffer_is_released() {
        let vm = Vm::new();
        let err = vm.evaluate_snippet("snippet", "error 'nope'").unwrap_err();
        assert!(err.to_string().starts_with("RUNTIME ERROR: nope"));
        assert_eq!(vm.buffer_stats().live(), 0);
    }

    #[test]
    fn test_allocate_and_release() {
        let vm = Vm::new();
        let buf = vm.allocate(b"hello").unwrap();
        assert_eq!(buf.to_str().unwrap(), "hello");
        assert_eq!(buf.len(), 5);
        assert_eq!(vm.buffer_stats().live(), 1);

        buf.release();
        let stats = vm.buffer_stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.bytes_allocated, 6);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_allocate_rejects_interior_nul() {
        let vm = Vm::new();
        assert!(matches!(
            vm.allocate(b"a\0b"),
            Err(Error::Codec(CodecError::InteriorNul(1)))
        ));
        assert_eq!(vm.buffer_stats().allocated, 0);
    }

    #[test]
    fn test_reusable_vm_with_bindings() {
        let mut vm = Vm::new();
        vm.ext_var("who", "world").unwrap();
        vm.ext_code("n", "2 + 3").unwrap();

        assert_eq!(
            vm.evaluate_snippet("a", "'hello ' + std.extVar('who')").unwrap(),
            "\"hello world\"\n"
        );
        assert_eq!(vm.evaluate_snippet("b", "std.extVar('n') * 2").unwrap(), "10\n");
    }

    #[test]
    fn test_tla_bindings() {
        let mut vm = Vm::new();
        vm.tla_var("name", "x").unwrap();
        vm.tla_code("count", "3").unwrap();
        let out = vm
            .evaluate_snippet("snippet", "function(name, count) std.makeArray(count, function(i) name)")
            .unwrap();
        assert_eq!(Value::from_json(&out).unwrap().as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_string_output() {
        let mut vm = Vm::new();
        vm.string_output(true);
        assert_eq!(vm.evaluate_snippet("snippet", "'plain'").unwrap(), "plain\n");
    }

    #[test]
    fn test_multi_output() {
        let vm = Vm::new();
        let files = vm
            .evaluate_snippet_multi("snippet", "{ 'a.json': { x: 1 }, 'b.json': [true] }")
            .unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(Value::from_json(&files["b.json"]).unwrap(), Value::Array(vec![Value::Bool(true)]));
        assert_eq!(vm.buffer_stats().live(), 0);
    }

    #[test]
    fn test_multi_output_rejects_empty_file_name() {
        let vm = Vm::new();
        let err = vm
            .evaluate_snippet_multi("snippet", "{ '': 1, 'a.json': 2 }")
            .unwrap_err();
        assert!(matches!(err, Error::Codec(CodecError::MalformedOutput(_))));

        let files = vm.evaluate_snippet_multi("snippet", "{}").unwrap();
        assert!(files.is_empty());
        assert_eq!(vm.buffer_stats().live(), 0);
    }

    #[test]
    fn test_multi_empty_name_check_keeps_string_output() {
        let mut vm = Vm::new();
        vm.string_output(true);
        let err = vm.evaluate_snippet_multi("snippet", "{ '': 'x' }").unwrap_err();
        assert!(matches!(err, Error::Codec(CodecError::MalformedOutput(_))));

        let files = vm.evaluate_snippet_multi("snippet", "{ 'a.txt': 'raw' }").unwrap();
        assert_eq!(files["a.txt"], "raw\n");
        assert_eq!(vm.evaluate_snippet("snippet", "'plain'").unwrap(), "plain\n");
    }

    #[test]
    fn test_stream_output() {
        let vm = Vm::new();
        let docs = vm.evaluate_snippet_stream("snippet", "[1, 'two', null]").unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[1].trim(), "\"two\"");

        let err = vm.evaluate_snippet_stream("snippet", "{}").unwrap_err();
        assert!(err.evaluation_message().is_some());
    }

    #[test]
    fn test_native_registration_replaces_previous() {
        let mut vm = Vm::new();
        vm.register_native("f", NativeCallback::new(["x"], |_| Ok(Value::from(1))))
            .unwrap();
        vm.register_native("f", NativeCallback::new(["x"], |_| Ok(Value::from(2))))
            .unwrap();
        assert_eq!(vm.native_names().collect::<Vec<_>>(), ["f"]);
        assert_eq!(vm.evaluate_snippet("snippet", "std.native('f')(0)").unwrap(), "2\n");
    }

    #[test]
    fn test_callback_error_text_reaches_diagnostic() {
        let mut vm = Vm::new();
        vm.register_native(
            "fail",
            NativeCallback::new(["x"], |_| Err(CallbackError::new("host said no"))),
        )
        .unwrap();
        let err = vm.evaluate_snippet("snippet", "std.native('fail')(1)").unwrap_err();
        assert!(err.to_string().contains("host said no"));
    }

    #[test]
    fn test_dispose_leaves_other_vm_intact() {
        let keep = Vm::new();
        let gone = Vm::new();
        let _ = gone.evaluate_snippet("snippet", "[1, 2, 3]").unwrap();
        gone.dispose();

        assert_eq!(keep.evaluate_snippet("snippet", "{ a: 1 }.a").unwrap(), "1\n");
        assert_eq!(keep.buffer_stats().live(), 0);
    }
}
