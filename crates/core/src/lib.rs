//! Keel core types: the resource model shared by every other crate.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod naming;
pub mod problem;
pub mod selector;

pub use problem::{Error, ProblemDetails, Result};
pub use selector::{LabelSelector, LabelSelectorOperator};

/// Well-known groups, plurals and kinds the control plane itself depends on.
pub mod well_known {
    /// API group of keel's own built-in resource types.
    pub const API_GROUP: &str = "keel.io";
    pub const API_VERSION: &str = "v1";

    pub const RESOURCE_DEFINITION_PLURAL: &str = "resourcedefinitions";
    pub const RESOURCE_DEFINITION_KIND: &str = "ResourceDefinition";

    /// Namespaces live in the core (empty) group, like upstream Kubernetes.
    pub const NAMESPACE_GROUP: &str = "";
    pub const NAMESPACE_PLURAL: &str = "namespaces";
    pub const NAMESPACE_KIND: &str = "Namespace";
    pub const NAMESPACE_VERSION: &str = "v1";

    pub const MUTATING_WEBHOOK_PLURAL: &str = "mutatingwebhooks";
    pub const VALIDATING_WEBHOOK_PLURAL: &str = "validatingwebhooks";

    pub const DEFAULT_NAMESPACE: &str = "default";
}

/// Builds an `apiVersion` string from a group and version (`group/version`,
/// or the bare version for the core group).
pub fn api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}

/// Splits an `apiVersion` string into (group, version).
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Standard object metadata carried by every resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Opaque token compared by the storage layer on replace/patch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// A single typed, versioned, optionally namespaced resource instance.
///
/// `spec`, `status` and any other top-level payload fields are kept as raw
/// JSON under `content` so one type serves every resource definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    pub metadata: ResourceMetadata,
    #[serde(flatten)]
    pub content: serde_json::Map<String, Value>,
}

impl Resource {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, metadata: ResourceMetadata) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), metadata, content: serde_json::Map::new() }
    }

    pub fn group(&self) -> &str {
        split_api_version(&self.api_version).0
    }

    pub fn version(&self) -> &str {
        split_api_version(&self.api_version).1
    }

    pub fn spec(&self) -> Option<&Value> {
        self.content.get("spec")
    }

    /// Named sub-resource payload (e.g. `status`), if present.
    pub fn sub_resource(&self, name: &str) -> Option<&Value> {
        self.content.get(name)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Composite cache/storage key: `namespace/name`, or the bare name for
    /// cluster-scoped resources.
    pub fn qualified_name(&self) -> String {
        match self.metadata.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, self.metadata.name),
            _ => self.metadata.name.clone(),
        }
    }
}

/// Identifies a single resource by type coordinates and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceReference {
    pub fn new(group: &str, version: &str, plural: &str, name: &str, namespace: Option<&str>) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
            name: name.to_string(),
            namespace: namespace.map(|s| s.to_string()),
        }
    }

    pub fn api_version(&self) -> String {
        api_version(&self.group, &self.version)
    }
}

impl fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let type_part = if self.group.is_empty() {
            format!("{}/{}", self.version, self.plural)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.plural)
        };
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{}: {}/{}", type_part, ns, self.name),
            None => write!(f, "{}: {}", type_part, self.name),
        }
    }
}

/// Identifies a named sub-resource (e.g. `status`) of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubResourceReference {
    #[serde(flatten)]
    pub resource: ResourceReference,
    pub sub_resource: String,
}

impl fmt::Display for SubResourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.sub_resource)
    }
}

/// Mutating operations a resource change can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Replace,
    Patch,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Replace => "replace",
            Operation::Patch => "patch",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// The user on whose behalf an operation runs. Threaded explicitly through
/// repository and admission calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl Default for UserInfo {
    fn default() -> Self {
        Self {
            username: "system:anonymous".to_string(),
            uid: None,
            groups: vec!["system:unauthenticated".to_string()],
        }
    }
}

// ---- Resource definitions ----

/// Whether instances of a type live inside a namespace or at cluster level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceScope {
    Cluster,
    Namespaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinitionNames {
    pub plural: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singular: Option<String>,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinitionVersion {
    pub name: String,
    /// Exactly one version per definition carries `storage == true`.
    #[serde(default)]
    pub storage: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionStrategy {
    None,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookClientConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConversion {
    pub strategy: ConversionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookClientConfig>,
}

/// The `spec` of a resource definition: everything the control plane needs
/// to know about a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinitionSpec {
    pub group: String,
    pub names: ResourceDefinitionNames,
    pub scope: ResourceScope,
    pub versions: Vec<ResourceDefinitionVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ResourceConversion>,
}

impl ResourceDefinitionSpec {
    /// The version designated for persistence.
    pub fn storage_version(&self) -> Option<&ResourceDefinitionVersion> {
        self.versions.iter().find(|v| v.storage)
    }

    pub fn version(&self, name: &str) -> Option<&ResourceDefinitionVersion> {
        self.versions.iter().find(|v| v.name == name)
    }

    pub fn storage_api_version(&self) -> Option<String> {
        self.storage_version().map(|v| api_version(&self.group, &v.name))
    }

    /// Conventional name of the definition resource: `plural.group`
    /// (bare plural for the core group).
    pub fn qualified_plural(&self) -> String {
        if self.group.is_empty() {
            self.names.plural.clone()
        } else {
            format!("{}.{}", self.names.plural, self.group)
        }
    }

    /// Decode from a stored `ResourceDefinition` resource.
    pub fn from_resource(resource: &Resource) -> Result<Self> {
        let spec = resource
            .spec()
            .ok_or_else(|| Error::Validation(format!("resource definition {} has no spec", resource.metadata.name)))?;
        Ok(serde_json::from_value(spec.clone())?)
    }
}

// ---- Watch events ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceWatchEventType {
    Created,
    Updated,
    Deleted,
}

/// One entry of a watch stream: what happened, and to which resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceWatchEvent {
    #[serde(rename = "type")]
    pub event_type: ResourceWatchEventType,
    pub resource: Resource,
}

impl ResourceWatchEvent {
    pub fn created(resource: Resource) -> Self {
        Self { event_type: ResourceWatchEventType::Created, resource }
    }
    pub fn updated(resource: Resource) -> Self {
        Self { event_type: ResourceWatchEventType::Updated, resource }
    }
    pub fn deleted(resource: Resource) -> Self {
        Self { event_type: ResourceWatchEventType::Deleted, resource }
    }
}
