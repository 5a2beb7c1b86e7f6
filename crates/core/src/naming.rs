//! Naming-convention checks, enforced before any I/O.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::problem::{Error, Result};
use crate::ResourceScope;

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Resource names must be DNS-1123 subdomains: dot-separated lowercase
/// alphanumeric labels (dashes allowed inside), 253 chars max.
pub fn validate_resource_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("resource name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "resource name '{name}' exceeds {MAX_NAME_LEN} characters"
        )));
    }
    for segment in name.split('.') {
        if segment.len() > MAX_LABEL_LEN || !DNS_LABEL.is_match(segment) {
            return Err(Error::Validation(format!(
                "resource name '{name}' is not a valid DNS-1123 subdomain (offending segment: '{segment}')"
            )));
        }
    }
    Ok(())
}

/// Namespace names are single DNS-1123 labels, 63 chars max.
pub fn validate_namespace_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("namespace name must not be empty".into()));
    }
    if name.len() > MAX_LABEL_LEN || !DNS_LABEL.is_match(name) {
        return Err(Error::Validation(format!(
            "namespace name '{name}' is not a valid DNS-1123 label"
        )));
    }
    Ok(())
}

/// Namespace must be empty iff the definition is cluster-scoped.
pub fn validate_scope(scope: ResourceScope, namespace: Option<&str>) -> Result<()> {
    let ns = namespace.filter(|s| !s.is_empty());
    match (scope, ns) {
        (ResourceScope::Cluster, Some(ns)) => Err(Error::Validation(format!(
            "cluster-scoped resources must not carry a namespace (got '{ns}')"
        ))),
        (ResourceScope::Namespaced, None) => {
            Err(Error::Validation("namespaced resources require a namespace".into()))
        }
        (ResourceScope::Namespaced, Some(ns)) => validate_namespace_name(ns),
        (ResourceScope::Cluster, None) => Ok(()),
    }
}
