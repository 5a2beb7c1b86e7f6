//! Keel admission control: the mutate-then-validate pipeline every proposed
//! resource change passes through before the repository commits it.
//!
//! Outcomes are values (`allowed`/denied + problem), never errors; a review
//! only fails with `Err` on infrastructure faults (webhook transport, patch
//! application, programming errors).

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_core::problem::problems;
use keel_core::{Error, Operation, ProblemDetails, Resource, ResourceReference, Result, UserInfo};
use keel_patch::Patch;

mod webhook;

pub use webhook::{AdmissionWebhook, RuleWithOperations, WebhookResolver, WebhookSpec};

/// A proposed resource change under review. `updated_state` is rewritten in
/// place as successive mutators apply their patches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewRequest {
    pub uid: String,
    pub operation: Operation,
    pub resource: ResourceReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,
    /// The caller-submitted patch, for `Patch` operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_state: Option<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_state: Option<Resource>,
    pub user: UserInfo,
    #[serde(default)]
    pub dry_run: bool,
}

impl AdmissionReviewRequest {
    pub fn new(operation: Operation, resource: ResourceReference, user: UserInfo) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            operation,
            resource,
            sub_resource: None,
            patch: None,
            updated_state: None,
            original_state: None,
            user,
            dry_run: false,
        }
    }

    pub fn with_sub_resource(mut self, sub_resource: &str) -> Self {
        self.sub_resource = Some(sub_resource.to_string());
        self
    }

    pub fn with_patch(mut self, patch: Patch) -> Self {
        self.patch = Some(patch);
        self
    }

    pub fn with_updated_state(mut self, state: Resource) -> Self {
        self.updated_state = Some(state);
        self
    }

    pub fn with_original_state(mut self, state: Resource) -> Self {
        self.original_state = Some(state);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Review outcome, correlated by uid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<ProblemDetails>,
}

impl AdmissionReviewResponse {
    pub fn allow(uid: &str) -> Self {
        Self { uid: uid.to_string(), allowed: true, patch: None, problem: None }
    }

    pub fn allow_with_patch(uid: &str, patch: Option<Patch>) -> Self {
        Self { uid: uid.to_string(), allowed: true, patch, problem: None }
    }

    pub fn deny(uid: &str, problem: ProblemDetails) -> Self {
        Self { uid: uid.to_string(), allowed: false, patch: None, problem: Some(problem) }
    }
}

/// Rewrites proposed changes before validation. Runs strictly sequentially;
/// each mutator sees the cumulative effect of the ones before it.
#[async_trait]
pub trait ResourceMutator: Send + Sync {
    fn applies_to(&self, request: &AdmissionReviewRequest) -> bool;
    async fn mutate(&self, request: &AdmissionReviewRequest) -> Result<AdmissionReviewResponse>;
}

/// Approves or denies proposed changes. Validators run concurrently; a
/// review succeeds only on unanimous approval.
#[async_trait]
pub trait ResourceValidator: Send + Sync {
    fn applies_to(&self, request: &AdmissionReviewRequest) -> bool;
    async fn validate(&self, request: &AdmissionReviewRequest) -> Result<AdmissionReviewResponse>;
}

/// Orchestrates the two-phase review: in-process mutators/validators in
/// registration order, webhook-backed ones resolved per review and appended
/// (mutating webhooks ordered by their declared priority).
#[derive(Default)]
pub struct AdmissionReviewer {
    mutators: Vec<Arc<dyn ResourceMutator>>,
    validators: Vec<Arc<dyn ResourceValidator>>,
    webhooks: Option<WebhookResolver>,
}

impl AdmissionReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mutator(mut self, mutator: Arc<dyn ResourceMutator>) -> Self {
        self.mutators.push(mutator);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ResourceValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_webhook_resolver(mut self, resolver: WebhookResolver) -> Self {
        self.webhooks = Some(resolver);
        self
    }

    /// Run the full review: mutate, then validate, then return `allowed`
    /// with the diff between the pre-mutation state and the final state.
    pub async fn review(&self, request: &mut AdmissionReviewRequest) -> Result<AdmissionReviewResponse> {
        let pre_mutation = request.updated_state.clone();

        let mutation = self.mutate(request).await?;
        if !mutation.allowed {
            return Ok(mutation);
        }

        let validation = self.validate(request).await?;
        if !validation.allowed {
            return Ok(validation);
        }

        let patch = match (&pre_mutation, &request.updated_state) {
            (Some(before), Some(after)) => {
                let p = keel_patch::diff_resources(before, after)?;
                if p.is_empty() { None } else { Some(p) }
            }
            _ => None,
        };
        Ok(AdmissionReviewResponse::allow_with_patch(&request.uid, patch))
    }

    /// Mutation phase; applicable to create/replace/patch only.
    async fn mutate(&self, request: &mut AdmissionReviewRequest) -> Result<AdmissionReviewResponse> {
        if request.operation == Operation::Delete {
            return Ok(AdmissionReviewResponse::allow(&request.uid));
        }
        let pre_mutation = request.updated_state.clone();

        let webhooks = match &self.webhooks {
            Some(resolver) => resolver.mutating_webhooks(request).await,
            None => Vec::new(),
        };
        let webhook_mutators: Vec<Arc<dyn ResourceMutator>> =
            webhooks.into_iter().map(|w| Arc::new(w) as Arc<dyn ResourceMutator>).collect();

        for mutator in self.mutators.iter().chain(webhook_mutators.iter()) {
            if !mutator.applies_to(request) {
                continue;
            }
            let response = mutator.mutate(request).await?;
            if !response.allowed {
                debug!(uid = %request.uid, "admission: mutation denied");
                return Ok(response);
            }
            if let Some(patch) = &response.patch {
                let current = request
                    .updated_state
                    .take()
                    .ok_or_else(|| Error::Internal("mutator returned a patch but the request has no updated state".into()))?;
                request.updated_state = Some(keel_patch::apply_to_resource(patch, &current)?);
            }
        }

        let patch = match (&pre_mutation, &request.updated_state) {
            (Some(before), Some(after)) => {
                let p = keel_patch::diff_resources(before, after)?;
                if p.is_empty() { None } else { Some(p) }
            }
            _ => None,
        };
        Ok(AdmissionReviewResponse::allow_with_patch(&request.uid, patch))
    }

    /// Validation phase: all applicable validators run concurrently; denials
    /// aggregate into a single problem.
    async fn validate(&self, request: &AdmissionReviewRequest) -> Result<AdmissionReviewResponse> {
        let webhooks = match &self.webhooks {
            Some(resolver) => resolver.validating_webhooks(request).await,
            None => Vec::new(),
        };
        let webhook_validators: Vec<Arc<dyn ResourceValidator>> =
            webhooks.into_iter().map(|w| Arc::new(w) as Arc<dyn ResourceValidator>).collect();

        let applicable: Vec<&Arc<dyn ResourceValidator>> = self
            .validators
            .iter()
            .chain(webhook_validators.iter())
            .filter(|v| v.applies_to(request))
            .collect();
        if applicable.is_empty() {
            return Ok(AdmissionReviewResponse::allow(&request.uid));
        }

        let results = futures::future::join_all(applicable.iter().map(|v| v.validate(request))).await;

        let mut denial: Option<ProblemDetails> = None;
        for result in results {
            let response = result?;
            if response.allowed {
                continue;
            }
            let aggregated = denial.get_or_insert_with(|| {
                problems::resource_admission_failed(request.operation, &request.resource)
            });
            if let Some(problem) = &response.problem {
                aggregated.merge_errors(problem);
            }
        }
        match denial {
            Some(problem) => {
                debug!(uid = %request.uid, sources = problem.errors.len(), "admission: validation denied");
                Ok(AdmissionReviewResponse::deny(&request.uid, problem))
            }
            None => Ok(AdmissionReviewResponse::allow(&request.uid)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn request(operation: Operation) -> AdmissionReviewRequest {
        let reference = ResourceReference::new("apps.keel.io", "v1", "deployments", "web", Some("prod"));
        let state: Resource = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps.keel.io/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod" },
            "spec": { "replicas": 1 }
        }))
        .unwrap();
        AdmissionReviewRequest::new(operation, reference, UserInfo::default()).with_updated_state(state)
    }

    /// Mutator adding one label through a patch.
    struct LabelMutator {
        key: &'static str,
        invoked: AtomicBool,
    }

    impl LabelMutator {
        fn new(key: &'static str) -> Self {
            Self { key, invoked: AtomicBool::new(false) }
        }
    }

    #[async_trait]
    impl ResourceMutator for LabelMutator {
        fn applies_to(&self, _request: &AdmissionReviewRequest) -> bool {
            true
        }

        async fn mutate(&self, request: &AdmissionReviewRequest) -> Result<AdmissionReviewResponse> {
            self.invoked.store(true, Ordering::SeqCst);
            let before = request.updated_state.clone().unwrap();
            let mut after = before.clone();
            after.metadata.labels.insert(self.key.to_string(), "true".into());
            let patch = keel_patch::diff_resources(&before, &after)?;
            Ok(AdmissionReviewResponse::allow_with_patch(&request.uid, Some(patch)))
        }
    }

    struct DenyMutator;

    #[async_trait]
    impl ResourceMutator for DenyMutator {
        fn applies_to(&self, _request: &AdmissionReviewRequest) -> bool {
            true
        }

        async fn mutate(&self, request: &AdmissionReviewRequest) -> Result<AdmissionReviewResponse> {
            Ok(AdmissionReviewResponse::deny(
                &request.uid,
                ProblemDetails::new("test", "denied by mutator", 400, "nope").with_error("mutator", "nope"),
            ))
        }
    }

    struct FixedValidator {
        allowed: bool,
        source: &'static str,
        message: &'static str,
    }

    #[async_trait]
    impl ResourceValidator for FixedValidator {
        fn applies_to(&self, _request: &AdmissionReviewRequest) -> bool {
            true
        }

        async fn validate(&self, request: &AdmissionReviewRequest) -> Result<AdmissionReviewResponse> {
            if self.allowed {
                Ok(AdmissionReviewResponse::allow(&request.uid))
            } else {
                Ok(AdmissionReviewResponse::deny(
                    &request.uid,
                    ProblemDetails::new("test", self.source, 400, self.message).with_error(self.source, self.message),
                ))
            }
        }
    }

    #[tokio::test]
    async fn mutators_chain_cumulatively() {
        let reviewer = AdmissionReviewer::new()
            .with_mutator(Arc::new(LabelMutator::new("a")))
            .with_mutator(Arc::new(LabelMutator::new("b")));
        let mut req = request(Operation::Create);
        let resp = reviewer.review(&mut req).await.unwrap();
        assert!(resp.allowed);
        let state = req.updated_state.as_ref().unwrap();
        assert_eq!(state.metadata.labels.get("a").map(String::as_str), Some("true"));
        assert_eq!(state.metadata.labels.get("b").map(String::as_str), Some("true"));
        // response patch reproduces the full mutation when applied to the original
        let patch = resp.patch.expect("diff patch");
        assert!(!patch.is_empty());
    }

    #[tokio::test]
    async fn denying_mutator_short_circuits() {
        let m2 = Arc::new(LabelMutator::new("b"));
        let reviewer = AdmissionReviewer::new()
            .with_mutator(Arc::new(DenyMutator))
            .with_mutator(m2.clone());
        let mut req = request(Operation::Create);
        let resp = reviewer.review(&mut req).await.unwrap();
        assert!(!resp.allowed);
        assert!(resp.patch.is_none());
        assert!(!m2.invoked.load(Ordering::SeqCst), "later mutators must not run");
    }

    #[tokio::test]
    async fn validators_aggregate_all_denials() {
        let reviewer = AdmissionReviewer::new()
            .with_validator(Arc::new(FixedValidator { allowed: true, source: "ok", message: "" }))
            .with_validator(Arc::new(FixedValidator { allowed: false, source: "quota", message: "too many replicas" }))
            .with_validator(Arc::new(FixedValidator { allowed: false, source: "labels", message: "team label required" }));
        let mut req = request(Operation::Create);
        let resp = reviewer.review(&mut req).await.unwrap();
        assert!(!resp.allowed);
        let problem = resp.problem.unwrap();
        assert_eq!(problem.status, 400);
        assert_eq!(problem.errors["quota"], vec!["too many replicas"]);
        assert_eq!(problem.errors["labels"], vec!["team label required"]);
    }

    #[tokio::test]
    async fn delete_skips_mutation() {
        let m = Arc::new(LabelMutator::new("a"));
        let reviewer = AdmissionReviewer::new().with_mutator(m.clone());
        let mut req = request(Operation::Delete);
        req.updated_state = None;
        req.original_state = Some(request(Operation::Delete).updated_state.unwrap());
        let resp = reviewer.review(&mut req).await.unwrap();
        assert!(resp.allowed);
        assert!(resp.patch.is_none());
        assert!(!m.invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn clean_review_returns_empty_patch_as_none() {
        let reviewer = AdmissionReviewer::new()
            .with_validator(Arc::new(FixedValidator { allowed: true, source: "ok", message: "" }));
        let mut req = request(Operation::Replace);
        let resp = reviewer.review(&mut req).await.unwrap();
        assert!(resp.allowed);
        assert!(resp.patch.is_none());
    }
}
