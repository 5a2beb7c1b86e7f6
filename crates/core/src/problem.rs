//! Structured problem details and the shared error type.
//!
//! Domain-level failures (not-found, denied admission, invalid patches) are
//! expressed as RFC-7807-style [`ProblemDetails`]; infrastructure faults
//! (bad arguments, serialization, webhook transport) use plain variants.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ResourceReference, SubResourceReference};

/// Machine-readable problem payload returned to callers on domain failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Per-source error messages, keyed by the reporting component.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, Vec<String>>,
}

impl ProblemDetails {
    pub fn new(type_uri: &str, title: &str, status: u16, detail: impl Into<String>) -> Self {
        Self {
            type_uri: type_uri.to_string(),
            title: title.to_string(),
            status,
            detail: Some(detail.into()),
            errors: BTreeMap::new(),
        }
    }

    pub fn with_error(mut self, source: impl Into<String>, message: impl Into<String>) -> Self {
        self.errors.entry(source.into()).or_default().push(message.into());
        self
    }

    /// Fold another problem's error map into this one.
    pub fn merge_errors(&mut self, other: &ProblemDetails) {
        for (source, messages) in &other.errors {
            self.errors.entry(source.clone()).or_default().extend(messages.iter().cloned());
        }
        if self.errors.is_empty() {
            if let Some(detail) = &other.detail {
                self.errors.entry(other.title.clone()).or_default().push(detail.clone());
            }
        }
    }
}

impl fmt::Display for ProblemDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "{} ({}): {}", self.title, self.status, d),
            None => write!(f, "{} ({})", self.title, self.status),
        }
    }
}

const PROBLEM_BASE: &str = "https://keel.io/problems";

/// Typed constructors for every problem the control plane raises.
pub mod problems {
    use super::*;

    pub fn resource_not_found(reference: &ResourceReference) -> ProblemDetails {
        ProblemDetails::new(
            &format!("{PROBLEM_BASE}/resource-not-found"),
            "Resource not found",
            404,
            format!("no resource matches '{reference}'"),
        )
    }

    pub fn resource_definition_not_found(group: &str, plural: &str) -> ProblemDetails {
        let coords = if group.is_empty() { plural.to_string() } else { format!("{plural}.{group}") };
        ProblemDetails::new(
            &format!("{PROBLEM_BASE}/resource-definition-not-found"),
            "Resource definition not found",
            404,
            format!("no resource definition registered for '{coords}'"),
        )
    }

    pub fn resource_version_not_found(reference: &ResourceReference, version: &str) -> ProblemDetails {
        ProblemDetails::new(
            &format!("{PROBLEM_BASE}/resource-version-not-found"),
            "Resource version not found",
            404,
            format!("version '{version}' of '{reference}' is not declared by its resource definition"),
        )
    }

    pub fn storage_version_not_found(group: &str, plural: &str) -> ProblemDetails {
        ProblemDetails::new(
            &format!("{PROBLEM_BASE}/storage-version-not-found"),
            "Storage version not found",
            500,
            format!("resource definition '{plural}.{group}' designates no storage version"),
        )
    }

    pub fn resource_version_required(reference: &ResourceReference) -> ProblemDetails {
        ProblemDetails::new(
            &format!("{PROBLEM_BASE}/resource-version-required"),
            "Resource version required",
            422,
            format!("replacing '{reference}' requires metadata.resourceVersion to be set"),
        )
    }

    pub fn resource_conversion_failed(reference: &ResourceReference, to_version: &str, errors: &[String]) -> ProblemDetails {
        let mut p = ProblemDetails::new(
            &format!("{PROBLEM_BASE}/resource-conversion-failed"),
            "Resource conversion failed",
            500,
            format!("failed converting '{reference}' to version '{to_version}'"),
        );
        for e in errors {
            p = p.with_error("conversion-webhook", e.clone());
        }
        p
    }

    pub fn resource_admission_failed(operation: crate::Operation, reference: &ResourceReference) -> ProblemDetails {
        ProblemDetails::new(
            &format!("{PROBLEM_BASE}/resource-admission-failed"),
            "Resource admission failed",
            400,
            format!("admission denied {operation} of '{reference}'"),
        )
    }

    pub fn invalid_resource_patch(reference: &ResourceReference, offending: &[String]) -> ProblemDetails {
        ProblemDetails::new(
            &format!("{PROBLEM_BASE}/invalid-resource-patch"),
            "Invalid resource patch",
            422,
            format!(
                "patch of '{reference}' touches paths outside /spec, /metadata/labels, /metadata/annotations: {}",
                offending.join(", ")
            ),
        )
    }

    pub fn invalid_sub_resource_patch(reference: &SubResourceReference, offending: &[String]) -> ProblemDetails {
        ProblemDetails::new(
            &format!("{PROBLEM_BASE}/invalid-sub-resource-patch"),
            "Invalid sub-resource patch",
            422,
            format!(
                "patch of '{reference}' touches paths outside /{}: {}",
                reference.sub_resource,
                offending.join(", ")
            ),
        )
    }
}

/// Errors suitable for transport across crate boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input shape; raised before any I/O.
    #[error("validation: {0}")]
    Validation(String),
    /// Domain-level failure carrying a structured problem payload.
    #[error("{0}")]
    Problem(ProblemDetails),
    /// Optimistic concurrency conflict surfaced by the storage layer.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Patch application failure (missing path, failed test guard).
    #[error("patch: {0}")]
    Patch(String),
    /// Webhook transport failure (non-success HTTP status, send error).
    #[error("webhook: {0}")]
    Webhook(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn problem(p: ProblemDetails) -> Self {
        Error::Problem(p)
    }

    /// The structured payload, when this is a domain-level failure.
    pub fn as_problem(&self) -> Option<&ProblemDetails> {
        match self {
            Error::Problem(p) => Some(p),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub use problems::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Operation;

    #[test]
    fn merge_errors_aggregates_sources() {
        let mut denial = problems::resource_admission_failed(
            Operation::Create,
            &ResourceReference::new("apps.keel.io", "v1", "deployments", "web", Some("prod")),
        );
        let a = ProblemDetails::new("a", "quota exceeded", 400, "too many replicas").with_error("quota", "too many replicas");
        let b = ProblemDetails::new("b", "label missing", 400, "team label required").with_error("labels", "team label required");
        denial.merge_errors(&a);
        denial.merge_errors(&b);
        assert_eq!(denial.errors.len(), 2);
        assert_eq!(denial.errors["quota"], vec!["too many replicas"]);
        assert_eq!(denial.errors["labels"], vec!["team label required"]);
    }

    #[test]
    fn merge_errors_falls_back_to_detail() {
        let mut denial = ProblemDetails::new("x", "denied", 400, "denied");
        let bare = ProblemDetails::new("y", "policy", 400, "not allowed on weekends");
        denial.merge_errors(&bare);
        assert_eq!(denial.errors["policy"], vec!["not allowed on weekends"]);
    }

    #[test]
    fn problem_serializes_with_type_field() {
        let p = problems::resource_definition_not_found("apps.keel.io", "deployments");
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "https://keel.io/problems/resource-definition-not-found");
        assert_eq!(v["status"], 404);
    }
}
