//! Keel resource repository: the transactional façade every caller goes
//! through to mutate resources.
//!
//! Each mutating operation follows one template: validate arguments, run
//! the admission review, apply the admission patch, convert to the storage
//! version when needed, and only then commit through the [`Database`].
//! Reads, watches and monitors pass through; watch/monitor ownership moves
//! to the caller.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info};

use keel_admission::{AdmissionReviewRequest, AdmissionReviewResponse, AdmissionReviewer};
use keel_convert::{VersionConverter, VersioningContext};
use keel_core::problem::problems;
use keel_core::{
    naming, well_known, Error, LabelSelector, Operation, Resource, ResourceDefinitionSpec,
    ResourceReference, ResourceWatchEvent, Result, SubResourceReference, UserInfo,
};
use keel_patch::Patch;
use keel_store::{CancelHandle, Database, ResourceList, ResourceWatch, StreamHandle};

/// Paths a whole-resource patch may touch.
const RESOURCE_PATCH_SCOPE: [&str; 3] = ["/spec", "/metadata/labels", "/metadata/annotations"];

/// Couples a resource's last-known state with a watch filtered to exactly
/// that resource. Dispose by dropping (or cancelling) the handle.
pub struct ResourceMonitor {
    state: Arc<ArcSwap<Resource>>,
    pub rx: mpsc::Receiver<ResourceWatchEvent>,
    pub cancel: CancelHandle,
}

impl ResourceMonitor {
    pub fn state(&self) -> Arc<Resource> {
        self.state.load_full()
    }
}

pub struct Repository {
    db: Arc<dyn Database>,
    admission: Arc<AdmissionReviewer>,
    converter: VersionConverter,
}

impl Repository {
    pub fn new(db: Arc<dyn Database>, admission: Arc<AdmissionReviewer>) -> Self {
        Self { db, admission, converter: VersionConverter::new() }
    }

    /// Bootstrap types are persisted without admission: reviewing the very
    /// types admission configuration lives in would chase its own tail.
    fn is_bootstrap(group: &str, plural: &str) -> bool {
        (group == well_known::API_GROUP && plural == well_known::RESOURCE_DEFINITION_PLURAL)
            || (group == well_known::NAMESPACE_GROUP && plural == well_known::NAMESPACE_PLURAL)
    }

    fn require(value: &str, what: &str) -> Result<()> {
        if value.is_empty() {
            return Err(Error::Validation(format!("{what} must not be empty")));
        }
        Ok(())
    }

    async fn definition_for(&self, group: &str, plural: &str) -> Result<ResourceDefinitionSpec> {
        let name = if group.is_empty() { plural.to_string() } else { format!("{plural}.{group}") };
        let stored = self
            .db
            .get_resource(
                well_known::API_GROUP,
                well_known::API_VERSION,
                well_known::RESOURCE_DEFINITION_PLURAL,
                &name,
                None,
            )
            .await?;
        let resource =
            stored.ok_or_else(|| Error::Problem(problems::resource_definition_not_found(group, plural)))?;
        ResourceDefinitionSpec::from_resource(&resource)
    }

    async fn fetch_original(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Resource> {
        self.db.get_resource(group, version, plural, name, namespace).await?.ok_or_else(|| {
            Error::Problem(problems::resource_not_found(&ResourceReference::new(
                group, version, plural, name, namespace,
            )))
        })
    }

    fn denial_to_error(
        operation: Operation,
        reference: &ResourceReference,
        response: AdmissionReviewResponse,
    ) -> Error {
        let mut problem = problems::resource_admission_failed(operation, reference);
        if let Some(p) = response.problem {
            if p.type_uri == problem.type_uri {
                problem = p;
            } else {
                problem.merge_errors(&p);
            }
        }
        Error::Problem(problem)
    }

    /// Converts `resource` to the definition's storage version when its
    /// declared api version differs.
    async fn to_storage_version(
        &self,
        definition: &ResourceDefinitionSpec,
        reference: &ResourceReference,
        resource: Resource,
    ) -> Result<Resource> {
        let storage_api = definition.storage_api_version().ok_or_else(|| {
            Error::Problem(problems::storage_version_not_found(&definition.group, &definition.names.plural))
        })?;
        if resource.api_version == storage_api {
            return Ok(resource);
        }
        debug!(reference = %reference, from = %resource.api_version, to = %storage_api, "repo: converting to storage version");
        let mut ctx = VersioningContext::new(reference.clone(), definition.clone(), resource);
        self.converter.convert_to_storage_version(&mut ctx).await
    }

    /// Create a resource. Resource definitions and namespaces skip
    /// admission entirely; everything else goes through the full review.
    #[allow(clippy::too_many_arguments)]
    pub async fn add(
        &self,
        resource: Resource,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        user: &UserInfo,
        dry_run: bool,
    ) -> Result<Resource> {
        let t0 = Instant::now();
        Self::require(version, "version")?;
        Self::require(plural, "plural")?;
        naming::validate_resource_name(&resource.metadata.name)?;
        if resource.metadata.namespace.as_deref() != namespace {
            return Err(Error::Validation(format!(
                "resource namespace '{:?}' does not match the requested namespace '{:?}'",
                resource.metadata.namespace, namespace
            )));
        }
        counter!("keel_repo_add_total", 1u64);
        let reference = ResourceReference::new(group, version, plural, &resource.metadata.name, namespace);
        info!(reference = %reference, dry_run, "repo: add start");

        if Self::is_bootstrap(group, plural) {
            let created = self.db.create_resource(resource, group, version, plural, namespace, dry_run).await?;
            info!(reference = %reference, took_ms = %t0.elapsed().as_millis(), "repo: add ok (bootstrap)");
            return Ok(created);
        }

        let definition = self.definition_for(group, plural).await?;
        naming::validate_scope(definition.scope, namespace)?;

        let mut request = AdmissionReviewRequest::new(Operation::Create, reference.clone(), user.clone())
            .with_updated_state(resource.clone())
            .with_dry_run(dry_run);
        let response = self.admission.review(&mut request).await?;
        if !response.allowed {
            counter!("keel_repo_admission_denied_total", 1u64);
            return Err(Self::denial_to_error(Operation::Create, &reference, response));
        }
        let mut admitted = resource;
        if let Some(patch) = &response.patch {
            admitted = keel_patch::apply_to_resource(patch, &admitted)?;
        }
        let stored = self.to_storage_version(&definition, &reference, admitted).await?;
        let created = self.db.create_resource(stored, group, version, plural, namespace, dry_run).await?;
        histogram!("keel_repo_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(reference = %reference, took_ms = %t0.elapsed().as_millis(), "repo: add ok");
        Ok(created)
    }

    /// Replace a resource whole. The caller-supplied resource version is
    /// the optimistic concurrency guard; the store detects staleness.
    #[allow(clippy::too_many_arguments)]
    pub async fn replace(
        &self,
        resource: Resource,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        user: &UserInfo,
        dry_run: bool,
    ) -> Result<Resource> {
        let t0 = Instant::now();
        Self::require(version, "version")?;
        Self::require(plural, "plural")?;
        naming::validate_resource_name(&resource.metadata.name)?;
        let reference = ResourceReference::new(group, version, plural, &resource.metadata.name, namespace);
        let supplied_version = resource.metadata.resource_version.clone().filter(|v| !v.is_empty());
        let supplied_version =
            supplied_version.ok_or_else(|| Error::Problem(problems::resource_version_required(&reference)))?;
        counter!("keel_repo_replace_total", 1u64);
        info!(reference = %reference, dry_run, "repo: replace start");

        let original =
            self.fetch_original(group, version, plural, &resource.metadata.name, namespace).await?;
        let definition = self.definition_for(group, plural).await?;
        naming::validate_scope(definition.scope, namespace)?;

        let mut request = AdmissionReviewRequest::new(Operation::Replace, reference.clone(), user.clone())
            .with_updated_state(resource.clone())
            .with_original_state(original)
            .with_dry_run(dry_run);
        let response = self.admission.review(&mut request).await?;
        if !response.allowed {
            counter!("keel_repo_admission_denied_total", 1u64);
            return Err(Self::denial_to_error(Operation::Replace, &reference, response));
        }
        let mut admitted = resource;
        if let Some(patch) = &response.patch {
            admitted = keel_patch::apply_to_resource(patch, &admitted)?;
        }
        let mut stored = self.to_storage_version(&definition, &reference, admitted).await?;
        // The store compares this stamp against the live version on commit.
        stored.metadata.resource_version = Some(supplied_version);
        let replaced = self.db.replace_resource(stored, group, version, plural, namespace, dry_run).await?;
        histogram!("keel_repo_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(reference = %reference, took_ms = %t0.elapsed().as_millis(), "repo: replace ok");
        Ok(replaced)
    }

    /// Replace one named sub-resource (e.g. `status`), leaving the rest of
    /// the resource untouched.
    #[allow(clippy::too_many_arguments)]
    pub async fn replace_sub_resource(
        &self,
        resource: Resource,
        group: &str,
        version: &str,
        plural: &str,
        sub_resource: &str,
        namespace: Option<&str>,
        user: &UserInfo,
        dry_run: bool,
    ) -> Result<Resource> {
        let t0 = Instant::now();
        Self::require(version, "version")?;
        Self::require(plural, "plural")?;
        Self::require(sub_resource, "sub-resource")?;
        naming::validate_resource_name(&resource.metadata.name)?;
        let reference = ResourceReference::new(group, version, plural, &resource.metadata.name, namespace);
        let supplied_version = resource.metadata.resource_version.clone().filter(|v| !v.is_empty());
        let supplied_version =
            supplied_version.ok_or_else(|| Error::Problem(problems::resource_version_required(&reference)))?;
        counter!("keel_repo_replace_total", 1u64);
        info!(reference = %reference, sub = %sub_resource, dry_run, "repo: replace sub-resource start");

        let original =
            self.fetch_original(group, version, plural, &resource.metadata.name, namespace).await?;
        let definition = self.definition_for(group, plural).await?;
        naming::validate_scope(definition.scope, namespace)?;

        let mut request = AdmissionReviewRequest::new(Operation::Replace, reference.clone(), user.clone())
            .with_sub_resource(sub_resource)
            .with_updated_state(resource.clone())
            .with_original_state(original)
            .with_dry_run(dry_run);
        let response = self.admission.review(&mut request).await?;
        if !response.allowed {
            counter!("keel_repo_admission_denied_total", 1u64);
            return Err(Self::denial_to_error(Operation::Replace, &reference, response));
        }
        let mut admitted = resource;
        if let Some(patch) = &response.patch {
            admitted = keel_patch::apply_to_resource(patch, &admitted)?;
        }
        let mut stored = self.to_storage_version(&definition, &reference, admitted).await?;
        stored.metadata.resource_version = Some(supplied_version);
        let replaced = self
            .db
            .replace_sub_resource(stored, group, version, plural, sub_resource, namespace, dry_run)
            .await?;
        histogram!("keel_repo_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(reference = %reference, sub = %sub_resource, took_ms = %t0.elapsed().as_millis(), "repo: replace sub-resource ok");
        Ok(replaced)
    }

    /// Apply a patch to a resource. The effective diff (submitted patch
    /// plus any mutator additions) may only touch `/spec`,
    /// `/metadata/labels` and `/metadata/annotations`.
    #[allow(clippy::too_many_arguments)]
    pub async fn patch(
        &self,
        patch: Patch,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        namespace: Option<&str>,
        user: &UserInfo,
        dry_run: bool,
    ) -> Result<Resource> {
        let t0 = Instant::now();
        Self::require(version, "version")?;
        Self::require(plural, "plural")?;
        Self::require(name, "name")?;
        counter!("keel_repo_patch_total", 1u64);
        let reference = ResourceReference::new(group, version, plural, name, namespace);
        info!(reference = %reference, ops = patch.len(), dry_run, "repo: patch start");

        let original = self.fetch_original(group, version, plural, name, namespace).await?;
        let updated = keel_patch::apply_to_resource(&patch, &original)?;

        let mut request = AdmissionReviewRequest::new(Operation::Patch, reference.clone(), user.clone())
            .with_patch(patch.clone())
            .with_updated_state(updated)
            .with_original_state(original.clone())
            .with_dry_run(dry_run);
        let response = self.admission.review(&mut request).await?;
        if !response.allowed {
            counter!("keel_repo_admission_denied_total", 1u64);
            return Err(Self::denial_to_error(Operation::Patch, &reference, response));
        }

        // Submitted patch first, then whatever the mutators added on top.
        let mut patched = keel_patch::apply_to_resource(&patch, &original)?;
        if let Some(p) = &response.patch {
            patched = keel_patch::apply_to_resource(p, &patched)?;
        }
        let delta = keel_patch::diff_resources(&original, &patched)?;
        let offending = keel_patch::paths_outside(&delta, &RESOURCE_PATCH_SCOPE);
        if !offending.is_empty() {
            counter!("keel_repo_patch_rejected_total", 1u64);
            return Err(Error::Problem(problems::invalid_resource_patch(&reference, &offending)));
        }
        let result = self
            .db
            .patch_resource(
                &delta,
                group,
                version,
                plural,
                name,
                namespace,
                original.metadata.resource_version.as_deref(),
                dry_run,
            )
            .await?;
        histogram!("keel_repo_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(reference = %reference, took_ms = %t0.elapsed().as_millis(), "repo: patch ok");
        Ok(result)
    }

    /// Patch a named sub-resource; the effective diff may only touch paths
    /// under that sub-resource.
    #[allow(clippy::too_many_arguments)]
    pub async fn patch_sub_resource(
        &self,
        patch: Patch,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        sub_resource: &str,
        namespace: Option<&str>,
        user: &UserInfo,
        dry_run: bool,
    ) -> Result<Resource> {
        let t0 = Instant::now();
        Self::require(version, "version")?;
        Self::require(plural, "plural")?;
        Self::require(name, "name")?;
        Self::require(sub_resource, "sub-resource")?;
        counter!("keel_repo_patch_total", 1u64);
        let reference = ResourceReference::new(group, version, plural, name, namespace);
        let sub_reference =
            SubResourceReference { resource: reference.clone(), sub_resource: sub_resource.to_string() };
        info!(reference = %sub_reference, ops = patch.len(), dry_run, "repo: patch sub-resource start");

        let original = self.fetch_original(group, version, plural, name, namespace).await?;
        let updated = keel_patch::apply_to_resource(&patch, &original)?;

        let mut request = AdmissionReviewRequest::new(Operation::Patch, reference.clone(), user.clone())
            .with_sub_resource(sub_resource)
            .with_patch(patch.clone())
            .with_updated_state(updated)
            .with_original_state(original.clone())
            .with_dry_run(dry_run);
        let response = self.admission.review(&mut request).await?;
        if !response.allowed {
            counter!("keel_repo_admission_denied_total", 1u64);
            return Err(Self::denial_to_error(Operation::Patch, &reference, response));
        }

        let mut patched = keel_patch::apply_to_resource(&patch, &original)?;
        if let Some(p) = &response.patch {
            patched = keel_patch::apply_to_resource(p, &patched)?;
        }
        let delta = keel_patch::diff_resources(&original, &patched)?;
        let scope = format!("/{sub_resource}");
        let offending = keel_patch::paths_outside(&delta, &[scope.as_str()]);
        if !offending.is_empty() {
            counter!("keel_repo_patch_rejected_total", 1u64);
            return Err(Error::Problem(problems::invalid_sub_resource_patch(&sub_reference, &offending)));
        }
        let result = self
            .db
            .patch_sub_resource(
                &delta,
                group,
                version,
                plural,
                name,
                sub_resource,
                namespace,
                original.metadata.resource_version.as_deref(),
                dry_run,
            )
            .await?;
        histogram!("keel_repo_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(reference = %sub_reference, took_ms = %t0.elapsed().as_millis(), "repo: patch sub-resource ok");
        Ok(result)
    }

    /// Delete a resource, returning its pre-deletion snapshot.
    #[allow(clippy::too_many_arguments)]
    pub async fn remove(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        namespace: Option<&str>,
        user: &UserInfo,
        dry_run: bool,
    ) -> Result<Resource> {
        let t0 = Instant::now();
        Self::require(version, "version")?;
        Self::require(plural, "plural")?;
        Self::require(name, "name")?;
        counter!("keel_repo_remove_total", 1u64);
        let reference = ResourceReference::new(group, version, plural, name, namespace);
        info!(reference = %reference, dry_run, "repo: remove start");

        let original = self.fetch_original(group, version, plural, name, namespace).await?;
        let mut request = AdmissionReviewRequest::new(Operation::Delete, reference.clone(), user.clone())
            .with_original_state(original)
            .with_dry_run(dry_run);
        let response = self.admission.review(&mut request).await?;
        if !response.allowed {
            counter!("keel_repo_admission_denied_total", 1u64);
            return Err(Self::denial_to_error(Operation::Delete, &reference, response));
        }
        let removed = self.db.delete_resource(group, version, plural, name, namespace, dry_run).await?;
        histogram!("keel_repo_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(reference = %reference, took_ms = %t0.elapsed().as_millis(), "repo: remove ok");
        Ok(removed)
    }

    pub async fn get(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Resource>> {
        Self::require(version, "version")?;
        Self::require(plural, "plural")?;
        Self::require(name, "name")?;
        self.db.get_resource(group, version, plural, name, namespace).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn list(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        label_selectors: &[LabelSelector],
        max_results: Option<usize>,
        continuation: Option<&str>,
    ) -> Result<ResourceList> {
        Self::require(version, "version")?;
        Self::require(plural, "plural")?;
        self.db
            .list_resources(group, version, plural, namespace, label_selectors, max_results, continuation)
            .await
    }

    /// Stream every matching resource without paging.
    pub async fn stream(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        label_selectors: &[LabelSelector],
    ) -> Result<StreamHandle<Resource>> {
        Self::require(version, "version")?;
        Self::require(plural, "plural")?;
        self.db.stream_resources(group, version, plural, namespace, label_selectors).await
    }

    /// Open a watch; ownership of the stream passes to the caller.
    pub async fn watch(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        label_selectors: &[LabelSelector],
    ) -> Result<ResourceWatch> {
        Self::require(version, "version")?;
        Self::require(plural, "plural")?;
        counter!("keel_repo_watch_total", 1u64);
        self.db.watch_resources(group, version, plural, namespace, label_selectors).await
    }

    /// Fetch a resource's current state and couple it with a watch filtered
    /// to that single resource.
    pub async fn monitor(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<ResourceMonitor> {
        let current = self.fetch_original(group, version, plural, name, namespace).await?;
        let watch = self.db.watch_resources(group, version, plural, namespace, &[]).await?;
        let state = Arc::new(ArcSwap::from_pointee(current));
        let (tx, rx) = mpsc::channel(64);
        let state_writer = Arc::clone(&state);
        let target = name.to_string();
        let task = tokio::spawn(async move {
            // Bind the whole handle so disjoint capture doesn't drop the
            // watch's CancelHandle (which would abort the forwarder task).
            let mut watch = watch;
            while let Some(event) = watch.rx.recv().await {
                if event.resource.metadata.name != target {
                    continue;
                }
                state_writer.store(Arc::new(event.resource.clone()));
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(ResourceMonitor { state, rx, cancel: CancelHandle::new(task) })
    }
}
