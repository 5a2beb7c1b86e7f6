//! In-memory storage engine: collections keyed by `plural.group`, a
//! process-wide broadcast bus for watch fan-out, and a monotonic revision
//! counter backing optimistic concurrency.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

use keel_core::problem::problems;
use keel_core::selector::match_all;
use keel_core::{Error, LabelSelector, Resource, ResourceReference, ResourceWatchEvent, Result};

use crate::{CancelHandle, Database, ResourceList, ResourceWatch, StreamHandle};

fn queue_cap() -> usize {
    std::env::var("KEEL_WATCH_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048)
}

/// Watch bus payload: collection key + the event itself.
#[derive(Debug, Clone)]
struct BusEvent {
    collection: String,
    event: ResourceWatchEvent,
}

fn collection_key(group: &str, plural: &str) -> String {
    if group.is_empty() {
        plural.to_string()
    } else {
        format!("{plural}.{group}")
    }
}

fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace.filter(|s| !s.is_empty()) {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

pub struct InMemoryDatabase {
    collections: RwLock<FxHashMap<String, FxHashMap<String, Resource>>>,
    revision: AtomicU64,
    bus: broadcast::Sender<BusEvent>,
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(queue_cap());
        Self { collections: RwLock::new(FxHashMap::default()), revision: AtomicU64::new(0), bus }
    }

    fn next_version(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, collection: &str, event: ResourceWatchEvent) {
        // No receivers is fine; watches come and go.
        let _ = self.bus.send(BusEvent { collection: collection.to_string(), event });
    }

    fn not_found(group: &str, version: &str, plural: &str, name: &str, namespace: Option<&str>) -> Error {
        Error::Problem(problems::resource_not_found(&ResourceReference::new(
            group, version, plural, name, namespace,
        )))
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn create_resource(
        &self,
        mut resource: Resource,
        group: &str,
        _version: &str,
        plural: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<Resource> {
        let collection = collection_key(group, plural);
        let key = object_key(namespace, &resource.metadata.name);
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection.clone()).or_default();
        if entries.contains_key(&key) {
            return Err(Error::Conflict(format!("resource '{key}' already exists in '{collection}'")));
        }
        resource.metadata.resource_version = Some(self.next_version());
        if resource.metadata.uid.is_none() {
            resource.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if resource.metadata.creation_timestamp.is_none() {
            resource.metadata.creation_timestamp = Some(chrono::Utc::now());
        }
        if dry_run {
            return Ok(resource);
        }
        entries.insert(key.clone(), resource.clone());
        drop(collections);
        debug!(collection = %collection, key = %key, "store: created");
        self.publish(&collection, ResourceWatchEvent::created(resource.clone()));
        Ok(resource)
    }

    async fn get_resource(
        &self,
        group: &str,
        _version: &str,
        plural: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Resource>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&collection_key(group, plural))
            .and_then(|entries| entries.get(&object_key(namespace, name)))
            .cloned())
    }

    async fn list_resources(
        &self,
        group: &str,
        _version: &str,
        plural: &str,
        namespace: Option<&str>,
        label_selectors: &[LabelSelector],
        max_results: Option<usize>,
        continuation: Option<&str>,
    ) -> Result<ResourceList> {
        let offset = match continuation {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::Validation(format!("invalid continuation token '{token}'")))?,
            None => 0,
        };
        let collections = self.collections.read().await;
        let mut items: Vec<Resource> = collections
            .get(&collection_key(group, plural))
            .map(|entries| {
                entries
                    .values()
                    .filter(|r| namespace.map_or(true, |ns| r.metadata.namespace.as_deref() == Some(ns)))
                    .filter(|r| match_all(label_selectors, &r.metadata.labels))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // Deterministic page order.
        items.sort_by_key(|r| r.qualified_name());
        let total = items.len();
        let page: Vec<Resource> = match max_results {
            Some(max) => items.into_iter().skip(offset).take(max).collect(),
            None => items.into_iter().skip(offset).collect(),
        };
        let next = offset + page.len();
        let continuation = if next < total { Some(next.to_string()) } else { None };
        Ok(ResourceList { items: page, continuation })
    }

    async fn stream_resources(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        label_selectors: &[LabelSelector],
    ) -> Result<StreamHandle<Resource>> {
        let all = self
            .list_resources(group, version, plural, namespace, label_selectors, None, None)
            .await?
            .items;
        let (tx, rx) = mpsc::channel(queue_cap());
        let task = tokio::spawn(async move {
            for r in all {
                if tx.send(r).await.is_err() {
                    break;
                }
            }
        });
        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }

    async fn replace_resource(
        &self,
        mut resource: Resource,
        group: &str,
        version: &str,
        plural: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<Resource> {
        let collection = collection_key(group, plural);
        let key = object_key(namespace, &resource.metadata.name);
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection.clone()).or_default();
        let current = entries
            .get(&key)
            .ok_or_else(|| Self::not_found(group, version, plural, &resource.metadata.name, namespace))?;
        let current_version = current.metadata.resource_version.clone().unwrap_or_default();
        let supplied = resource.metadata.resource_version.clone().unwrap_or_default();
        if supplied != current_version {
            return Err(Error::Conflict(format!(
                "stale resource version '{supplied}' for '{key}' (current '{current_version}')"
            )));
        }
        resource.metadata.uid = current.metadata.uid.clone();
        resource.metadata.creation_timestamp = current.metadata.creation_timestamp;
        resource.metadata.resource_version = Some(self.next_version());
        if dry_run {
            return Ok(resource);
        }
        entries.insert(key.clone(), resource.clone());
        drop(collections);
        debug!(collection = %collection, key = %key, "store: replaced");
        self.publish(&collection, ResourceWatchEvent::updated(resource.clone()));
        Ok(resource)
    }

    async fn replace_sub_resource(
        &self,
        resource: Resource,
        group: &str,
        version: &str,
        plural: &str,
        sub_resource: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<Resource> {
        let collection = collection_key(group, plural);
        let key = object_key(namespace, &resource.metadata.name);
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection.clone()).or_default();
        let current = entries
            .get(&key)
            .ok_or_else(|| Self::not_found(group, version, plural, &resource.metadata.name, namespace))?;
        let current_version = current.metadata.resource_version.clone().unwrap_or_default();
        let supplied = resource.metadata.resource_version.clone().unwrap_or_default();
        if supplied != current_version {
            return Err(Error::Conflict(format!(
                "stale resource version '{supplied}' for '{key}/{sub_resource}' (current '{current_version}')"
            )));
        }
        let mut next = current.clone();
        match resource.content.get(sub_resource) {
            Some(value) => {
                next.content.insert(sub_resource.to_string(), value.clone());
            }
            None => {
                next.content.remove(sub_resource);
            }
        }
        next.metadata.resource_version = Some(self.next_version());
        if dry_run {
            return Ok(next);
        }
        entries.insert(key.clone(), next.clone());
        drop(collections);
        debug!(collection = %collection, key = %key, sub = %sub_resource, "store: sub-resource replaced");
        self.publish(&collection, ResourceWatchEvent::updated(next.clone()));
        Ok(next)
    }

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
    ) -> Result<Resource> {
        let collection = collection_key(group, plural);
        let key = object_key(namespace, name);
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection.clone()).or_default();
        let current = entries
            .get(&key)
            .ok_or_else(|| Self::not_found(group, version, plural, name, namespace))?;
        if let Some(expected) = expected_version {
            let current_version = current.metadata.resource_version.as_deref().unwrap_or_default();
            if expected != current_version {
                return Err(Error::Conflict(format!(
                    "patch of '{key}' computed against stale resource version '{expected}' (current '{current_version}')"
                )));
            }
        }
        let mut patched = keel_patch::apply_to_resource(patch, current)?;
        // A patch that rewrites resourceVersion is a stale-write guard tripping.
        if patched.metadata.resource_version != current.metadata.resource_version {
            return Err(Error::Conflict(format!(
                "patch of '{key}' carries stale resource version '{}'",
                patched.metadata.resource_version.unwrap_or_default()
            )));
        }
        patched.metadata.uid = current.metadata.uid.clone();
        patched.metadata.creation_timestamp = current.metadata.creation_timestamp;
        patched.metadata.resource_version = Some(self.next_version());
        if dry_run {
            return Ok(patched);
        }
        entries.insert(key.clone(), patched.clone());
        drop(collections);
        debug!(collection = %collection, key = %key, ops = patch.len(), "store: patched");
        self.publish(&collection, ResourceWatchEvent::updated(patched.clone()));
        Ok(patched)
    }

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
    ) -> Result<Resource> {
        // Scope enforcement happens in the repository; at this layer a
        // sub-resource patch is an ordinary patch against the full document.
        let _ = sub_resource;
        self.patch_resource(patch, group, version, plural, name, namespace, expected_version, dry_run)
            .await
    }

    async fn delete_resource(
        &self,
        group: &str,
        version: &str,
        plural: &str,
        name: &str,
        namespace: Option<&str>,
        dry_run: bool,
    ) -> Result<Resource> {
        let collection = collection_key(group, plural);
        let key = object_key(namespace, name);
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection.clone()).or_default();
        if dry_run {
            return entries
                .get(&key)
                .cloned()
                .ok_or_else(|| Self::not_found(group, version, plural, name, namespace));
        }
        let removed = entries
            .remove(&key)
            .ok_or_else(|| Self::not_found(group, version, plural, name, namespace))?;
        drop(collections);
        debug!(collection = %collection, key = %key, "store: deleted");
        self.publish(&collection, ResourceWatchEvent::deleted(removed.clone()));
        Ok(removed)
    }

    async fn watch_resources(
        &self,
        group: &str,
        _version: &str,
        plural: &str,
        namespace: Option<&str>,
        label_selectors: &[LabelSelector],
    ) -> Result<ResourceWatch> {
        let collection = collection_key(group, plural);
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(queue_cap());
        let ns = namespace.map(|s| s.to_string());
        let selectors = label_selectors.to_vec();
        let task = tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(BusEvent { collection: c, event }) => {
                        if c != collection {
                            continue;
                        }
                        if let Some(ns) = ns.as_deref() {
                            if event.resource.metadata.namespace.as_deref() != Some(ns) {
                                continue;
                            }
                        }
                        if !match_all(&selectors, &event.resource.metadata.labels) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, collection = %collection, "watch lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResourceMetadata;
    use serde_json::json;

    fn res(name: &str, ns: Option<&str>, labels: &[(&str, &str)]) -> Resource {
        let mut metadata = ResourceMetadata { name: name.into(), namespace: ns.map(|s| s.into()), ..Default::default() };
        metadata.labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut r = Resource::new("apps.keel.io/v1", "Deployment", metadata);
        r.content.insert("spec".into(), json!({ "replicas": 1 }));
        r
    }

    const G: &str = "apps.keel.io";
    const V: &str = "v1";
    const P: &str = "deployments";

    #[tokio::test]
    async fn create_stamps_version_uid_and_timestamp() {
        let db = InMemoryDatabase::new();
        let created = db.create_resource(res("web", Some("prod"), &[]), G, V, P, Some("prod"), false).await.unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());
        // duplicate create conflicts
        let err = db.create_resource(res("web", Some("prod"), &[]), G, V, P, Some("prod"), false).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn replace_requires_current_version() {
        let db = InMemoryDatabase::new();
        let created = db.create_resource(res("web", Some("prod"), &[]), G, V, P, Some("prod"), false).await.unwrap();

        let mut stale = created.clone();
        stale.metadata.resource_version = Some("999".into());
        let err = db.replace_resource(stale, G, V, P, Some("prod"), false).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // nothing changed
        let live = db.get_resource(G, V, P, "web", Some("prod")).await.unwrap().unwrap();
        assert_eq!(live.metadata.resource_version, created.metadata.resource_version);

        let mut fresh = created.clone();
        fresh.content.insert("spec".into(), json!({ "replicas": 3 }));
        let replaced = db.replace_resource(fresh, G, V, P, Some("prod"), false).await.unwrap();
        assert_eq!(replaced.metadata.resource_version.as_deref(), Some("2"));
        assert_eq!(replaced.metadata.uid, created.metadata.uid);
    }

    #[tokio::test]
    async fn list_filters_pages_and_orders() {
        let db = InMemoryDatabase::new();
        for (name, ns, labels) in [
            ("a", "prod", vec![("app", "web")]),
            ("b", "prod", vec![("app", "db")]),
            ("c", "dev", vec![("app", "web")]),
        ] {
            db.create_resource(res(name, Some(ns), &labels), G, V, P, Some(ns), false).await.unwrap();
        }
        let all = db.list_resources(G, V, P, None, &[], None, None).await.unwrap();
        assert_eq!(all.items.len(), 3);
        assert!(all.continuation.is_none());

        let prod = db.list_resources(G, V, P, Some("prod"), &[], None, None).await.unwrap();
        assert_eq!(prod.items.len(), 2);

        let web = db
            .list_resources(G, V, P, None, &[LabelSelector::equals("app", "web")], None, None)
            .await
            .unwrap();
        assert_eq!(web.items.len(), 2);

        // paging
        let page1 = db.list_resources(G, V, P, None, &[], Some(2), None).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        let token = page1.continuation.unwrap();
        let page2 = db.list_resources(G, V, P, None, &[], Some(2), Some(&token)).await.unwrap();
        assert_eq!(page2.items.len(), 1);
        assert!(page2.continuation.is_none());
        let mut names: Vec<String> =
            page1.items.iter().chain(page2.items.iter()).map(|r| r.qualified_name()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        names.dedup();
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn patch_applies_and_guards_version() {
        let db = InMemoryDatabase::new();
        db.create_resource(res("web", Some("prod"), &[]), G, V, P, Some("prod"), false).await.unwrap();
        let patch: keel_patch::Patch = serde_json::from_value(json!({
            "type": "JsonPatch",
            "document": [ { "op": "replace", "path": "/spec/replicas", "value": 3 } ]
        }))
        .unwrap();
        let patched =
            db.patch_resource(&patch, G, V, P, "web", Some("prod"), Some("1"), false).await.unwrap();
        assert_eq!(patched.spec().unwrap()["replicas"], 3);
        assert_eq!(patched.metadata.resource_version.as_deref(), Some("2"));

        // a patch forcing a stale resourceVersion is rejected
        let stale: keel_patch::Patch = serde_json::from_value(json!({
            "type": "JsonPatch",
            "document": [ { "op": "replace", "path": "/metadata/resourceVersion", "value": "1" } ]
        }))
        .unwrap();
        let err =
            db.patch_resource(&stale, G, V, P, "web", Some("prod"), None, false).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn patch_against_stale_version_conflicts() {
        let db = InMemoryDatabase::new();
        let created = db.create_resource(res("web", Some("prod"), &[]), G, V, P, Some("prod"), false).await.unwrap();

        // another writer lands first
        let mut concurrent = created.clone();
        concurrent.content.insert("spec".into(), json!({ "replicas": 10 }));
        db.replace_resource(concurrent, G, V, P, Some("prod"), false).await.unwrap();

        let patch: keel_patch::Patch = serde_json::from_value(json!({
            "type": "JsonPatch",
            "document": [ { "op": "replace", "path": "/spec/replicas", "value": 3 } ]
        }))
        .unwrap();
        let err = db
            .patch_resource(&patch, G, V, P, "web", Some("prod"), created.metadata.resource_version.as_deref(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // the concurrent write survives untouched
        let live = db.get_resource(G, V, P, "web", Some("prod")).await.unwrap().unwrap();
        assert_eq!(live.spec().unwrap()["replicas"], 10);
    }

    #[tokio::test]
    async fn dry_run_skips_commit_and_events() {
        let db = InMemoryDatabase::new();
        let mut watch = db.watch_resources(G, V, P, None, &[]).await.unwrap();
        let stamped = db.create_resource(res("ghost", Some("prod"), &[]), G, V, P, Some("prod"), true).await.unwrap();
        assert!(stamped.metadata.resource_version.is_some());
        assert!(db.get_resource(G, V, P, "ghost", Some("prod")).await.unwrap().is_none());
        // commit something real so the watch has exactly one event
        db.create_resource(res("real", Some("prod"), &[]), G, V, P, Some("prod"), false).await.unwrap();
        let ev = watch.rx.recv().await.unwrap();
        assert_eq!(ev.resource.metadata.name, "real");
    }

    #[tokio::test]
    async fn watch_scopes_by_namespace_and_selector() {
        let db = InMemoryDatabase::new();
        let mut watch = db
            .watch_resources(G, V, P, Some("prod"), &[LabelSelector::equals("app", "web")])
            .await
            .unwrap();
        db.create_resource(res("no-label", Some("prod"), &[]), G, V, P, Some("prod"), false).await.unwrap();
        db.create_resource(res("wrong-ns", Some("dev"), &[("app", "web")]), G, V, P, Some("dev"), false).await.unwrap();
        db.create_resource(res("match", Some("prod"), &[("app", "web")]), G, V, P, Some("prod"), false).await.unwrap();
        let ev = watch.rx.recv().await.unwrap();
        assert_eq!(ev.event_type, keel_core::ResourceWatchEventType::Created);
        assert_eq!(ev.resource.metadata.name, "match");
    }

    #[tokio::test]
    async fn delete_returns_snapshot_and_emits() {
        let db = InMemoryDatabase::new();
        db.create_resource(res("web", Some("prod"), &[]), G, V, P, Some("prod"), false).await.unwrap();
        let mut watch = db.watch_resources(G, V, P, None, &[]).await.unwrap();
        let removed = db.delete_resource(G, V, P, "web", Some("prod"), false).await.unwrap();
        assert_eq!(removed.metadata.name, "web");
        assert!(db.get_resource(G, V, P, "web", Some("prod")).await.unwrap().is_none());
        let ev = watch.rx.recv().await.unwrap();
        assert_eq!(ev.event_type, keel_core::ResourceWatchEventType::Deleted);
        // missing delete is a typed problem
        let err = db.delete_resource(G, V, P, "web", Some("prod"), false).await.unwrap_err();
        assert!(err.as_problem().is_some());
    }

    #[tokio::test]
    async fn sub_resource_replace_touches_only_that_field() {
        let db = InMemoryDatabase::new();
        let created = db.create_resource(res("web", Some("prod"), &[]), G, V, P, Some("prod"), false).await.unwrap();
        let mut status_update = created.clone();
        status_update.content.insert("status".into(), json!({ "readyReplicas": 1 }));
        status_update.content.insert("spec".into(), json!({ "replicas": 99 })); // must be ignored
        let next = db.replace_sub_resource(status_update, G, V, P, "status", Some("prod"), false).await.unwrap();
        assert_eq!(next.sub_resource("status").unwrap()["readyReplicas"], 1);
        assert_eq!(next.spec().unwrap()["replicas"], 1);
    }
}
