//! Evaluation Configuration
//!
//! Declarative options for one evaluation and the applier that turns them
//! into native configuration calls on a [`Vm`]. Every option is optional;
//! absent options leave the engine defaults untouched.

use crate::error::{CodecError, Result};
use crate::import::ImportResolver;
use crate::native::NativeCallback;
use crate::value::Value;
use crate::vm::Vm;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Complete evaluation configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Maximum call-stack depth
    pub max_stack: Option<u32>,

    /// Number of live objects below which the GC never runs
    pub gc_min_objects: Option<u32>,

    /// Heap growth factor since the last collection that triggers a GC
    pub gc_growth_trigger: Option<f64>,

    /// Maximum number of frames in an error stack trace (0 = unlimited)
    pub max_trace: Option<u32>,

    /// Expect a string result and emit it raw instead of as JSON
    pub string_output: Option<bool>,

    /// Library search paths for the engine's own importer
    ///
    /// Cannot be combined with `import_callback`, which replaces that
    /// importer; give the paths to the resolver instead, e.g.
    /// [`FileImporter::with_search_paths`](crate::FileImporter::with_search_paths).
    pub jpaths: Vec<PathBuf>,

    /// External variables bound to literal strings
    pub ext_vars: BTreeMap<String, String>,

    /// External variables bound to source code
    pub ext_codes: BTreeMap<String, String>,

    /// Top-level arguments bound to literal strings
    pub tla_vars: BTreeMap<String, String>,

    /// Top-level arguments bound to source code
    pub tla_codes: BTreeMap<String, String>,

    /// Host resolver for import statements
    #[serde(skip)]
    pub import_callback: Option<Arc<dyn ImportResolver>>,

    /// Host functions callable as `std.native(name)`
    #[serde(skip)]
    pub native_callbacks: BTreeMap<String, NativeCallback>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_stack(mut self, frames: u32) -> Self {
        self.max_stack = Some(frames);
        self
    }

    pub fn with_gc_min_objects(mut self, objects: u32) -> Self {
        self.gc_min_objects = Some(objects);
        self
    }

    pub fn with_gc_growth_trigger(mut self, factor: f64) -> Self {
        self.gc_growth_trigger = Some(factor);
        self
    }

    pub fn with_max_trace(mut self, frames: u32) -> Self {
        self.max_trace = Some(frames);
        self
    }

    pub fn with_string_output(mut self, enabled: bool) -> Self {
        self.string_output = Some(enabled);
        self
    }

    pub fn with_jpath(mut self, path: impl Into<PathBuf>) -> Self {
        self.jpaths.push(path.into());
        self
    }

    pub fn ext_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext_vars.insert(name.into(), value.into());
        self
    }

    pub fn ext_code(mut self, name: impl Into<String>, code: impl Into<String>) -> Self {
        self.ext_codes.insert(name.into(), code.into());
        self
    }

    /// Bind a structured value as an external variable
    pub fn ext_json(self, name: impl Into<String>, value: &Value) -> std::result::Result<Self, CodecError> {
        let code = value.to_json()?;
        Ok(self.ext_code(name, code))
    }

    pub fn tla_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tla_vars.insert(name.into(), value.into());
        self
    }

    pub fn tla_code(mut self, name: impl Into<String>, code: impl Into<String>) -> Self {
        self.tla_codes.insert(name.into(), code.into());
        self
    }

    /// Bind a structured value as a top-level argument
    pub fn tla_json(self, name: impl Into<String>, value: &Value) -> std::result::Result<Self, CodecError> {
        let code = value.to_json()?;
        Ok(self.tla_code(name, code))
    }

    pub fn import_callback(mut self, resolver: impl ImportResolver + 'static) -> Self {
        self.import_callback = Some(Arc::new(resolver));
        self
    }

    pub fn native_callback(mut self, name: impl Into<String>, callback: NativeCallback) -> Self {
        self.native_callbacks.insert(name.into(), callback);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if let Some(factor) = self.gc_growth_trigger {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(ConfigError::InvalidGcGrowthTrigger);
            }
        }

        if !self.jpaths.is_empty() && self.import_callback.is_some() {
            return Err(ConfigError::JpathsWithImportCallback);
        }

        let names = self
            .ext_vars
            .keys()
            .chain(self.ext_codes.keys())
            .chain(self.tla_vars.keys())
            .chain(self.tla_codes.keys());
        for name in names {
            if name.is_empty() || name.contains('\0') {
                return Err(ConfigError::InvalidVariableName(name.clone()));
            }
        }

        for (name, callback) in &self.native_callbacks {
            callback.validate(name)?;
        }
        Ok(())
    }

    /// Issue the native configuration calls for every present option
    ///
    /// Order: stack, GC, trace, output mode, search paths, external
    /// variables, top-level arguments, import callback, native callbacks.
    pub fn apply(&self, vm: &mut Vm) -> Result<()> {
        self.validate()?;

        if let Some(frames) = self.max_stack {
            vm.max_stack(frames);
        }
        if let Some(objects) = self.gc_min_objects {
            vm.gc_min_objects(objects);
        }
        if let Some(factor) = self.gc_growth_trigger {
            vm.gc_growth_trigger(factor);
        }
        if let Some(frames) = self.max_trace {
            vm.max_trace(frames);
        }
        if let Some(enabled) = self.string_output {
            vm.string_output(enabled);
        }
        for path in &self.jpaths {
            vm.jpath_add(path)?;
        }

        for (name, value) in &self.ext_vars {
            vm.ext_var(name, value)?;
        }
        for (name, code) in &self.ext_codes {
            vm.ext_code(name, code)?;
        }
        for (name, value) in &self.tla_vars {
            vm.tla_var(name, value)?;
        }
        for (name, code) in &self.tla_codes {
            vm.tla_code(name, code)?;
        }

        if let Some(resolver) = &self.import_callback {
            vm.set_import_callback(Arc::clone(resolver));
        }
        for (name, callback) in &self.native_callbacks {
            vm.register_native(name, callback.clone())?;
        }

        debug!(vm_id = vm.id(), "Configuration applied");
        Ok(())
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("max_stack", &self.max_stack)
            .field("gc_min_objects", &self.gc_min_objects)
            .field("gc_growth_trigger", &self.gc_growth_trigger)
            .field("max_trace", &self.max_trace)
            .field("string_output", &self.string_output)
            .field("jpaths", &self.jpaths)
            .field("ext_vars", &self.ext_vars)
            .field("ext_codes", &self.ext_codes)
            .field("tla_vars", &self.tla_vars)
            .field("tla_codes", &self.tla_codes)
            .field("import_callback", &self.import_callback.is_some())
            .field("native_callbacks", &self.native_callbacks)
            .finish()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Native callback name '{0}' is empty or contains a NUL byte")]
    InvalidCallbackName(String),

    #[error("Native callback '{callback}' has invalid parameter name '{param}'")]
    InvalidParameterName { callback: String, param: String },

    #[error("Native callback '{callback}' declares parameter '{param}' twice")]
    DuplicateParameter { callback: String, param: String },

    #[error("GC growth trigger must be a finite positive number")]
    InvalidGcGrowthTrigger,

    #[error("Variable name '{0}' is empty or contains a NUL byte")]
    InvalidVariableName(String),

    #[error("Library search paths are ignored by an import callback; pass them to the resolver")]
    JpathsWithImportCallback,
}
