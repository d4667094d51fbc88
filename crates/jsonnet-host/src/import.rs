//! Import Callback Bridge
//!
//! The engine calls [`import_trampoline`] synchronously, once per import
//! it has not resolved before, while an evaluate call is in progress. The
//! bridge dispatches to the host [`ImportResolver`] and writes the outcome
//! back through the engine's allocator. Failures of any kind, panics
//! included, become the engine's failure protocol: an error message buffer,
//! `success = 0` and a NULL found-here path.

use crate::buffer::{EngineAllocator, NativeBuffer};
use crate::error::CallbackError;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// A successfully resolved import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImport {
    /// Source text of the imported unit
    pub contents: String,
    /// Path the engine reports for the unit and resolves nested imports against
    pub found_here: PathBuf,
}

impl ResolvedImport {
    pub fn new(contents: impl Into<String>, found_here: impl Into<PathBuf>) -> Self {
        Self {
            contents: contents.into(),
            found_here: found_here.into(),
        }
    }
}

/// Host-side resolver for import statements
///
/// `base` is the directory of the importing unit, `rel` the path as written
/// in the source.
pub trait ImportResolver: Send + Sync {
    fn resolve(&self, base: &Path, rel: &str) -> Result<ResolvedImport, CallbackError>;
}

impl<F> ImportResolver for F
where
    F: Fn(&Path, &str) -> Result<ResolvedImport, CallbackError> + Send + Sync,
{
    fn resolve(&self, base: &Path, rel: &str) -> Result<ResolvedImport, CallbackError> {
        self(base, rel)
    }
}

/// Resolves imports from the filesystem
///
/// Looks next to the importing unit first, then in each search path in
/// order. Absolute import paths are used as-is. The reported path is
/// canonical, so the engine caches each file once however it was reached.
#[derive(Debug, Clone, Default)]
pub struct FileImporter {
    search_paths: Vec<PathBuf>,
}

impl FileImporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    fn candidates(&self, base: &Path, rel: &str) -> Vec<PathBuf> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            return vec![rel_path.to_path_buf()];
        }

        std::iter::once(base.join(rel_path))
            .chain(self.search_paths.iter().map(|dir| dir.join(rel_path)))
            .collect()
    }
}

impl ImportResolver for FileImporter {
    fn resolve(&self, base: &Path, rel: &str) -> Result<ResolvedImport, CallbackError> {
        for candidate in self.candidates(base, rel) {
            if !candidate.is_file() {
                continue;
            }
            let found = std::fs::canonicalize(&candidate).map_err(|e| {
                CallbackError::new(format!("{}: {}", candidate.display(), e))
            })?;
            let contents = std::fs::read_to_string(&found).map_err(|e| {
                CallbackError::new(format!("{}: {}", found.display(), e))
            })?;
            return Ok(ResolvedImport::new(contents, found));
        }

        Err(CallbackError::new(
            "no match locally or in the library search paths",
        ))
    }
}

/// Registration context handed to the engine as the callback's `ctx`
pub(crate) struct ImportBridge {
    vm_id: u64,
    alloc: EngineAllocator,
    resolver: Arc<dyn ImportResolver>,
}

impl ImportBridge {
    pub(crate) fn new(vm_id: u64, alloc: EngineAllocator, resolver: Arc<dyn ImportResolver>) -> Self {
        Self {
            vm_id,
            alloc,
            resolver,
        }
    }

    /// Resolve and encode a success. Any `Err` here is reported to the
    /// engine as a failed import.
    fn resolve_encoded(
        &self,
        base: &Path,
        rel: &str,
    ) -> Result<(*mut c_char, *mut c_char), CallbackError> {
        let resolved = self.resolver.resolve(base, rel)?;
        let found = resolved
            .found_here
            .to_str()
            .ok_or_else(|| CallbackError::new("resolved path is not valid UTF-8"))?;

        let contents = self
            .alloc
            .allocate(resolved.contents.as_bytes())
            .map_err(|e| CallbackError::new(e.to_string()))?;
        let found = self
            .alloc
            .allocate(found.as_bytes())
            .map_err(|e| CallbackError::new(e.to_string()))?;

        Ok((contents.into_raw(), found.into_raw()))
    }

    /// Engine-owned failure text; the engine reads it unconditionally, so
    /// running out of memory here is fatal.
    fn failure_message(&self, message: &str) -> *mut c_char {
        let clean = message.replace('\0', " ");
        match first_allocated(&self.alloc, [clean.as_bytes(), IMPORT_FAILED.as_bytes()]) {
            Some(buf) => buf.into_raw(),
            None => {
                error!(vm_id = self.vm_id, "Cannot allocate import failure message");
                std::process::abort();
            }
        }
    }
}

const IMPORT_FAILED: &str = "import failed";

/// Allocate the first candidate the allocator accepts
fn first_allocated<'a, 'b>(
    alloc: &'a EngineAllocator,
    candidates: impl IntoIterator<Item = &'b [u8]>,
) -> Option<NativeBuffer<'a>> {
    candidates.into_iter().find_map(|bytes| match alloc.allocate(bytes) {
        Ok(buf) => Some(buf),
        Err(e) => {
            warn!("Engine buffer allocation failed: {}", e);
            None
        }
    })
}

/// Engine-facing import callback
///
/// # Safety
///
/// `ctx` must point to a live [`ImportBridge`]; `base` and `rel` must be
/// NUL-terminated; `found_here` and `success` must be writable.
pub(crate) unsafe extern "C" fn import_trampoline(
    ctx: *mut c_void,
    base: *const c_char,
    rel: *const c_char,
    found_here: *mut *mut c_char,
    success: *mut c_int,
) -> *mut c_char {
    let bridge = unsafe { &*(ctx as *const ImportBridge) };
    let base = unsafe { CStr::from_ptr(base) }.to_string_lossy();
    let rel = unsafe { CStr::from_ptr(rel) }.to_string_lossy();
    trace!(vm_id = bridge.vm_id, base = %base, rel = %rel, "Import requested");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        bridge.resolve_encoded(Path::new(&*base), &rel)
    }));

    let message = match outcome {
        Ok(Ok((contents, found))) => {
            unsafe {
                *found_here = found;
                *success = 1;
            }
            return contents;
        }
        Ok(Err(e)) => {
            warn!(vm_id = bridge.vm_id, rel = %rel, "Import failed: {}", e);
            e.message().to_string()
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!(vm_id = bridge.vm_id, rel = %rel, "Import resolver panicked: {}", msg);
            format!("import resolver panicked: {msg}")
        }
    };

    unsafe {
        *found_here = std::ptr::null_mut();
        *success = 0;
    }
    bridge.failure_message(&message)
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;
    use std::ffi::CString;

    struct Outcome {
        text: String,
        found: Option<String>,
        success: c_int,
    }

    // Drives the trampoline the way the engine does and frees what it
    // returns through the same allocator.
    fn invoke(vm: &Vm, resolver: Arc<dyn ImportResolver>, base: &str, rel: &str) -> Outcome {
        let alloc = EngineAllocator::new(std::ptr::NonNull::new(vm.raw()).unwrap());
        let bridge = ImportBridge::new(vm.id(), alloc.clone(), resolver);
        let base = CString::new(base).unwrap();
        let rel = CString::new(rel).unwrap();
        let mut found: *mut c_char = std::ptr::null_mut();
        let mut success: c_int = -1;

        let out = unsafe {
            import_trampoline(
                &bridge as *const ImportBridge as *mut c_void,
                base.as_ptr(),
                rel.as_ptr(),
                &mut found,
                &mut success,
            )
        };

        let text = unsafe { alloc.adopt(out) }.unwrap().to_str().unwrap().to_string();
        let found = unsafe { alloc.adopt(found) }.map(|b| b.to_str().unwrap().to_string());
        assert_eq!(alloc.stats().live(), 0);
        Outcome { text, found, success }
    }

    #[test]
    fn test_success_returns_contents_and_path() {
        let vm = Vm::new();
        let resolver: Arc<dyn ImportResolver> = Arc::new(|base: &Path, rel: &str| -> Result<ResolvedImport, CallbackError> {
            Ok(ResolvedImport::new("{ a: 1 }", base.join(rel)))
        });

        let outcome = invoke(&vm, resolver, "/lib", "a.libsonnet");
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.text, "{ a: 1 }");
        assert_eq!(outcome.found.as_deref(), Some("/lib/a.libsonnet"));
    }

    #[test]
    fn test_failure_never_yields_path() {
        let vm = Vm::new();
        let resolver: Arc<dyn ImportResolver> =
            Arc::new(|_: &Path, rel: &str| -> Result<ResolvedImport, CallbackError> {
                Err(CallbackError::new(format!("{rel} not found")))
            });

        let outcome = invoke(&vm, resolver, "", "missing.libsonnet");
        assert_eq!(outcome.success, 0);
        assert_eq!(outcome.text, "missing.libsonnet not found");
        assert!(outcome.found.is_none());
    }

    #[test]
    fn test_panic_is_contained() {
        let vm = Vm::new();
        let resolver: Arc<dyn ImportResolver> =
            Arc::new(|_: &Path, _: &str| -> Result<ResolvedImport, CallbackError> {
                panic!("resolver exploded")
            });

        let outcome = invoke(&vm, resolver, "", "x.libsonnet");
        assert_eq!(outcome.success, 0);
        assert!(outcome.text.contains("resolver exploded"));
        assert!(outcome.found.is_none());
    }

    #[test]
    fn test_nul_in_contents_becomes_failure() {
        let vm = Vm::new();
        let resolver: Arc<dyn ImportResolver> =
            Arc::new(|_: &Path, _: &str| -> Result<ResolvedImport, CallbackError> {
                Ok(ResolvedImport::new("a\0b", "x"))
            });

        let outcome = invoke(&vm, resolver, "", "x");
        assert_eq!(outcome.success, 0);
        assert!(outcome.text.contains("NUL"));
        assert!(outcome.found.is_none());
    }

    #[test]
    fn test_file_importer_reports_canonical_path() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("app")).unwrap();
        std::fs::create_dir(root.path().join("lib")).unwrap();
        std::fs::write(root.path().join("lib/x.libsonnet"), "{}").unwrap();

        let importer = FileImporter::new();
        let direct = importer.resolve(&root.path().join("lib"), "x.libsonnet").unwrap();
        let dotted = importer
            .resolve(&root.path().join("app"), "../lib/x.libsonnet")
            .unwrap();

        assert_eq!(direct.found_here, dotted.found_here);
        assert!(!dotted.found_here.to_string_lossy().contains(".."));
    }

    #[test]
    fn test_failure_message_falls_back() {
        let vm = Vm::new();
        let alloc = EngineAllocator::new(std::ptr::NonNull::new(vm.raw()).unwrap());

        let buf = first_allocated(&alloc, [&b"a\0b"[..], IMPORT_FAILED.as_bytes()]).unwrap();
        assert_eq!(buf.to_str().unwrap(), IMPORT_FAILED);
        drop(buf);

        assert!(first_allocated(&alloc, [&b"\0"[..]]).is_none());
        assert_eq!(alloc.stats().live(), 0);
    }

    #[test]
    fn test_file_importer_search_order() {
        let local = tempfile::tempdir().unwrap();
        let lib = tempfile::tempdir().unwrap();
        std::fs::write(lib.path().join("shared.libsonnet"), "'from lib'").unwrap();
        std::fs::write(local.path().join("both.libsonnet"), "'local'").unwrap();
        std::fs::write(lib.path().join("both.libsonnet"), "'lib'").unwrap();

        let importer = FileImporter::with_search_paths([lib.path()]);

        let shared = importer.resolve(local.path(), "shared.libsonnet").unwrap();
        assert_eq!(shared.contents, "'from lib'");
        assert_eq!(
            shared.found_here,
            std::fs::canonicalize(lib.path().join("shared.libsonnet")).unwrap()
        );

        let both = importer.resolve(local.path(), "both.libsonnet").unwrap();
        assert_eq!(both.contents, "'local'");

        assert!(importer.resolve(local.path(), "nope.libsonnet").is_err());
    }
}
