//! Webhook-backed admission: dynamic resolution of `MutatingWebhook` /
//! `ValidatingWebhook` resources from the store, and the JSON-over-HTTP
//! review exchange.
//!
//! Resolution is best-effort by design: a store failure degrades to "no
//! additional webhooks" with a warning. Invocation failures are fatal to
//! the review.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use keel_core::{well_known, Error, Operation, ProblemDetails, Result};
use keel_store::Database;

use crate::{AdmissionReviewRequest, AdmissionReviewResponse, ResourceMutator, ResourceValidator};

const ADMISSION_API_VERSION: &str = "admission.keel.io/v1";
const ADMISSION_KIND: &str = "AdmissionReview";

/// Wire envelope POSTed to webhook endpoints and echoed back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionReviewRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionReviewResponse>,
}

/// Scoping rule of a webhook resource. Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleWithOperations {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plurals: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

impl RuleWithOperations {
    pub fn matches(&self, request: &AdmissionReviewRequest) -> bool {
        if !self.operations.is_empty() && !self.operations.contains(&request.operation) {
            return false;
        }
        if !self.groups.is_empty() && !self.groups.iter().any(|g| g == &request.resource.group) {
            return false;
        }
        if !self.plurals.is_empty() && !self.plurals.iter().any(|p| p == &request.resource.plural) {
            return false;
        }
        if !self.namespaces.is_empty() {
            match request.resource.namespace.as_deref() {
                Some(ns) => {
                    if !self.namespaces.iter().any(|n| n == ns) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// `spec` of a `MutatingWebhook` / `ValidatingWebhook` resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSpec {
    pub client: keel_core::WebhookClientConfig,
    /// Mutating webhooks run in ascending priority order; unset sorts last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleWithOperations>,
}

/// A webhook endpoint acting as a mutator or validator; constructed fresh
/// per review, never cached.
pub struct AdmissionWebhook {
    name: String,
    priority: Option<i64>,
    url: String,
    rules: Vec<RuleWithOperations>,
    http: reqwest::Client,
}

impl AdmissionWebhook {
    pub fn new(name: &str, spec: WebhookSpec, http: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            priority: spec.priority,
            url: spec.client.url,
            rules: spec.rules,
            http,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Option<i64> {
        self.priority
    }

    fn matches(&self, request: &AdmissionReviewRequest) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|r| r.matches(request))
    }

    async fn call(&self, request: &AdmissionReviewRequest) -> Result<AdmissionReviewResponse> {
        let review = AdmissionReview {
            api_version: ADMISSION_API_VERSION.to_string(),
            kind: ADMISSION_KIND.to_string(),
            request: Some(request.clone()),
            response: None,
        };
        let response = self
            .http
            .post(&self.url)
            .json(&review)
            .send()
            .await
            .map_err(|e| Error::Webhook(format!("posting admission review to '{}': {e}", self.url)))?;
        if !response.status().is_success() {
            return Err(Error::Webhook(format!(
                "webhook '{}' answered admission review '{}' with status {}",
                self.name,
                request.uid,
                response.status()
            )));
        }
        let body: AdmissionReview = response
            .json()
            .await
            .map_err(|e| Error::Webhook(format!("decoding admission review from '{}': {e}", self.name)))?;
        match body.response {
            Some(r) if r.uid == request.uid => Ok(r),
            // Success status but no usable response: a webhook-level denial.
            _ => Ok(AdmissionReviewResponse::deny(
                &request.uid,
                ProblemDetails::new(
                    "https://keel.io/problems/invalid-webhook-response",
                    "Invalid webhook response",
                    400,
                    format!("webhook '{}' returned no response matching review '{}'", self.name, request.uid),
                )
                .with_error(self.name.clone(), "missing or mismatched review response"),
            )),
        }
    }
}

#[async_trait]
impl ResourceMutator for AdmissionWebhook {
    fn applies_to(&self, request: &AdmissionReviewRequest) -> bool {
        self.matches(request)
    }

    async fn mutate(&self, request: &AdmissionReviewRequest) -> Result<AdmissionReviewResponse> {
        self.call(request).await
    }
}

#[async_trait]
impl ResourceValidator for AdmissionWebhook {
    fn applies_to(&self, request: &AdmissionReviewRequest) -> bool {
        self.matches(request)
    }

    async fn validate(&self, request: &AdmissionReviewRequest) -> Result<AdmissionReviewResponse> {
        self.call(request).await
    }
}

/// Ascending priority; unset priorities sort last; name breaks ties so the
/// order is stable across reviews.
pub(crate) fn sort_by_priority(hooks: &mut [AdmissionWebhook]) {
    hooks.sort_by(|a, b| {
        match (a.priority, b.priority) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.name.cmp(&b.name)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        }
    });
}

/// Resolves webhook admission resources from the store, best-effort.
pub struct WebhookResolver {
    db: Arc<dyn Database>,
    http: reqwest::Client,
}

impl WebhookResolver {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db, http: reqwest::Client::new() }
    }

    pub async fn mutating_webhooks(&self, request: &AdmissionReviewRequest) -> Vec<AdmissionWebhook> {
        let mut hooks = self.resolve(well_known::MUTATING_WEBHOOK_PLURAL, request).await;
        sort_by_priority(&mut hooks);
        hooks
    }

    pub async fn validating_webhooks(&self, request: &AdmissionReviewRequest) -> Vec<AdmissionWebhook> {
        self.resolve(well_known::VALIDATING_WEBHOOK_PLURAL, request).await
    }

    /// Never fails the review: store errors and unparsable specs degrade to
    /// an empty/partial list with a warning.
    async fn resolve(&self, plural: &str, request: &AdmissionReviewRequest) -> Vec<AdmissionWebhook> {
        let listed = self
            .db
            .list_resources(well_known::API_GROUP, well_known::API_VERSION, plural, None, &[], None, None)
            .await;
        let resources = match listed {
            Ok(list) => list.items,
            Err(e) => {
                warn!(plural, error = %e, "admission: webhook resolution failed; continuing without webhooks");
                return Vec::new();
            }
        };
        let mut hooks = Vec::new();
        for resource in resources {
            let spec = match resource.spec() {
                Some(spec) => spec.clone(),
                None => continue,
            };
            match serde_json::from_value::<WebhookSpec>(spec) {
                Ok(spec) => {
                    let hook = AdmissionWebhook::new(&resource.metadata.name, spec, self.http.clone());
                    if hook.matches(request) {
                        hooks.push(hook);
                    }
                }
                Err(e) => {
                    warn!(webhook = %resource.metadata.name, error = %e, "admission: skipping malformed webhook spec");
                }
            }
        }
        hooks
    }
}
