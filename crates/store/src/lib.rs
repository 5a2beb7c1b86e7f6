//! Keel storage contract: raw CRUD, paged listing and watch-stream
//! primitives over (group, version, plural, namespace) collections.
//!
//! The repository layer is the only writer that should sit on top of this;
//! it runs admission and version conversion before delegating here.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use tokio::sync::mpsc;

use keel_core::{LabelSelector, Resource, ResourceWatchEvent, Result};

mod memory;

pub use memory::InMemoryDatabase;

/// Cancellation handle that aborts the underlying forwarder task.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Handle for streams without a backing task (tests, mocks).
    pub fn noop() -> Self {
        Self { task: None }
    }

    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Generic stream handle; ownership passes to the caller, dropping it ends
/// the stream.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Live subscription to create/update/delete events for a collection scope.
pub type ResourceWatch = StreamHandle<ResourceWatchEvent>;

/// One page of a listing, with the token for the next page (if any).
#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    pub items: Vec<Resource>,
    pub continuation: Option<String>,
}

/// The storage engine contract the repository builds on.
///
/// Implementations must be internally thread-safe and must surface stale
/// resource-version writes on replace/patch as `Error::Conflict`.
#[async_trait]
pub trait Database: Send + Sync {
    async fn create_resource(
        &self,
        resource: Resource,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<Resource>;

    async fn get_resource(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Resource>>;

    async fn list_resources(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        label_selectors: &[LabelSelector],
        max_results: Option<usize>,
        continuation: Option<&str>,
    ) -> Result<ResourceList>;

    /// Stream every matching resource without paging.
    async fn stream_resources(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        label_selectors: &[LabelSelector],
    ) -> Result<StreamHandle<Resource>>;

    async fn replace_resource(
        &self,
        resource: Resource,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<Resource>;

    async fn replace_sub_resource(
        &self,
        resource: Resource,
        group: &str,
        version: &str,
        plural: &str,
        sub_resource: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<Resource>;

    /// `expected_version` is the resource version the patch was computed
    /// against; a mismatch with the stored version fails `Error::Conflict`.
    async fn patch_resource(
        &self,
        patch: &keel_patch::Patch,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        namespace: Option<&str>,
        expected_version: Option<&str>,
        dry_run: bool,
    ) -> Result<Resource>;

    async fn patch_sub_resource(
        &self,
        patch: &keel_patch::Patch,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        sub_resource: &str,
        namespace: Option<&str>,
        expected_version: Option<&str>,
        dry_run: bool,
    ) -> Result<Resource>;

    /// Returns the deleted resource snapshot.
    async fn delete_resource(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<Resource>;

    async fn watch_resources(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        label_selectors: &[LabelSelector],
    ) -> Result<ResourceWatch>;
}
