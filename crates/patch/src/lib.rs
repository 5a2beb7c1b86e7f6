//! Keel patch engine: deterministic diffs and guarded patch application.
//!
//! Pure transforms over `serde_json::Value`; no I/O. The repository and
//! admission layers both lean on `diff`/`apply`, and the repository's patch
//! scope guard is built from `touched_paths` + `within`.

#![forbid(unsafe_code)]

use json_patch::PatchOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use keel_core::{Error, Resource, Result};

/// A typed patch document. JSON Patch is the only representation today; the
/// tag keeps room for merge-patch variants without breaking the wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "document")]
pub enum Patch {
    JsonPatch(json_patch::Patch),
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        match self {
            Patch::JsonPatch(p) => p.0.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Patch::JsonPatch(p) => p.0.len(),
        }
    }
}

/// Minimal deterministic patch turning `original` into `updated`.
pub fn diff(original: &Value, updated: &Value) -> Patch {
    Patch::JsonPatch(json_patch::diff(original, updated))
}

/// Apply `patch` to a copy of `target`. Missing paths and failed `test`
/// guards surface as [`Error::Patch`].
pub fn apply(patch: &Patch, target: &Value) -> Result<Value> {
    let mut doc = target.clone();
    match patch {
        Patch::JsonPatch(ops) => {
            json_patch::patch(&mut doc, ops).map_err(|e| Error::Patch(e.to_string()))?;
        }
    }
    Ok(doc)
}

/// Convenience: diff two resources by value.
pub fn diff_resources(original: &Resource, updated: &Resource) -> Result<Patch> {
    Ok(diff(&original.to_value()?, &updated.to_value()?))
}

/// Apply a patch to a resource, yielding the patched resource.
pub fn apply_to_resource(patch: &Patch, target: &Resource) -> Result<Resource> {
    Resource::from_value(apply(patch, &target.to_value()?)?)
}

/// Every JSON-pointer path a patch touches. `move`/`copy` contribute both
/// their `from` and `path` ends.
pub fn touched_paths(patch: &Patch) -> Vec<String> {
    let Patch::JsonPatch(ops) = patch;
    let mut out = Vec::with_capacity(ops.0.len());
    for op in &ops.0 {
        match op {
            PatchOperation::Add(o) => out.push(o.path.clone()),
            PatchOperation::Remove(o) => out.push(o.path.clone()),
            PatchOperation::Replace(o) => out.push(o.path.clone()),
            PatchOperation::Test(o) => out.push(o.path.clone()),
            PatchOperation::Move(o) => {
                out.push(o.from.clone());
                out.push(o.path.clone());
            }
            PatchOperation::Copy(o) => {
                out.push(o.from.clone());
                out.push(o.path.clone());
            }
        }
    }
    out
}

/// True when `path` equals one of the allowed prefixes or lies under it.
pub fn within(path: &str, allowed: &[&str]) -> bool {
    allowed.iter().any(|prefix| {
        path == *prefix || path.strip_prefix(prefix).map(|rest| rest.starts_with('/')).unwrap_or(false)
    })
}

/// Paths of `patch` falling outside the allowed prefixes. Empty means the
/// patch passes the scope guard.
pub fn paths_outside(patch: &Patch, allowed: &[&str]) -> Vec<String> {
    touched_paths(patch).into_iter().filter(|p| !within(p, allowed)).collect()
}
