//! Evaluation entry points
//!
//! One-shot evaluation: build a VM, apply the configuration, evaluate, and
//! dispose of the VM on every exit path.

use crate::config::Configuration;
use crate::error::Result;
use crate::value::Value;
use crate::vm::Vm;
use std::collections::BTreeMap;
use std::path::Path;

fn configured_vm(config: &Configuration) -> Result<Vm> {
    let mut vm = Vm::new();
    config.apply(&mut vm)?;
    Ok(vm)
}

/// Evaluate source text; `label` names it in diagnostics
pub fn evaluate_snippet(label: &str, text: &str, config: &Configuration) -> Result<String> {
    configured_vm(config)?.evaluate_snippet(label, text)
}

/// Evaluate the file at `path`
pub fn evaluate_file(path: impl AsRef<Path>, config: &Configuration) -> Result<String> {
    configured_vm(config)?.evaluate_file(path.as_ref())
}

/// Evaluate source text and decode the rendered JSON
pub fn evaluate_snippet_value(label: &str, text: &str, config: &Configuration) -> Result<Value> {
    let out = evaluate_snippet(label, text, config)?;
    Ok(Value::from_json(&out)?)
}

/// Evaluate source text into several named documents
pub fn evaluate_snippet_multi(
    label: &str,
    text: &str,
    config: &Configuration,
) -> Result<BTreeMap<String, String>> {
    configured_vm(config)?.evaluate_snippet_multi(label, text)
}

pub fn evaluate_file_multi(
    path: impl AsRef<Path>,
    config: &Configuration,
) -> Result<BTreeMap<String, String>> {
    configured_vm(config)?.evaluate_file_multi(path.as_ref())
}

/// Evaluate source text into a sequence of documents
pub fn evaluate_snippet_stream(label: &str, text: &str, config: &Configuration) -> Result<Vec<String>> {
    configured_vm(config)?.evaluate_snippet_stream(label, text)
}

pub fn evaluate_file_stream(path: impl AsRef<Path>, config: &Configuration) -> Result<Vec<String>> {
    configured_vm(config)?.evaluate_file_stream(path.as_ref())
}
