//! Keel reconciliation controller: keeps an in-memory cache of one
//! collection scope converged with the repository.
//!
//! A single writer task owns the cache. It folds live watch events in as
//! they arrive and runs a full relist on a timer to catch anything the
//! watch missed. Readers get lock-free snapshots via `ArcSwap`; event
//! consumers subscribe to a broadcast of the raw watch feed.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use keel_core::{LabelSelector, Resource, ResourceWatchEvent, Result};
use keel_repo::Repository;
use keel_store::CancelHandle;

const DEFAULT_RECONCILE_SECS: u64 = 30;
const DEFAULT_PAGE_SIZE: usize = 500;
const EVENT_BUS_CAP: usize = 1024;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// What to converge on: one (group, version, plural) collection, optionally
/// narrowed to a namespace and a label selection.
#[derive(Debug, Clone)]
pub struct ResourceControllerOptions {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub namespace: Option<String>,
    pub label_selectors: Vec<LabelSelector>,
    pub reconciliation_interval: Duration,
    pub page_size: usize,
}

impl ResourceControllerOptions {
    /// Defaults come from the environment: `KEEL_RECONCILE_SECS` for the
    /// relist period, `KEEL_LIST_PAGE` for the listing page size.
    pub fn new(group: &str, version: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
            namespace: None,
            label_selectors: Vec::new(),
            reconciliation_interval: Duration::from_secs(env_u64(
                "KEEL_RECONCILE_SECS",
                DEFAULT_RECONCILE_SECS,
            )),
            page_size: env_u64("KEEL_LIST_PAGE", DEFAULT_PAGE_SIZE as u64) as usize,
        }
    }

    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn with_label_selectors(mut self, selectors: Vec<LabelSelector>) -> Self {
        self.label_selectors = selectors;
        self
    }

    pub fn with_reconciliation_interval(mut self, interval: Duration) -> Self {
        self.reconciliation_interval = interval;
        self
    }
}

/// Immutable point-in-time view of the cache. `epoch` increments on every
/// publish, so readers can cheaply detect movement.
#[derive(Debug, Clone, Default)]
pub struct ControllerSnapshot {
    pub epoch: u64,
    pub resources: Vec<Resource>,
}

impl ControllerSnapshot {
    pub fn get(&self, qualified_name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.qualified_name() == qualified_name)
    }
}

/// Compare one full listing against `cache` and fold the drift in,
/// returning the synthetic events describing what changed. Pages through
/// the repository using continuation tokens.
pub async fn reconcile(
    repo: &Repository,
    options: &ResourceControllerOptions,
    cache: &mut FxHashMap<String, Resource>,
) -> Result<Vec<ResourceWatchEvent>> {
    let t0 = Instant::now();
    let mut events = Vec::new();
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut continuation: Option<String> = None;

    loop {
        let page = repo
            .list(
                &options.group,
                &options.version,
                &options.plural,
                options.namespace.as_deref(),
                &options.label_selectors,
                Some(options.page_size),
                continuation.as_deref(),
            )
            .await?;
        for resource in page.items {
            let key = resource.qualified_name();
            seen.insert(key.clone());
            match cache.get(&key) {
                None => {
                    events.push(ResourceWatchEvent::created(resource.clone()));
                    cache.insert(key, resource);
                }
                Some(known) if known.metadata.resource_version != resource.metadata.resource_version => {
                    events.push(ResourceWatchEvent::updated(resource.clone()));
                    cache.insert(key, resource);
                }
                Some(_) => {}
            }
        }
        continuation = page.continuation;
        if continuation.is_none() {
            break;
        }
    }

    // anything cached but no longer listed was deleted behind our back
    let gone: Vec<String> = cache.keys().filter(|k| !seen.contains(*k)).cloned().collect();
    for key in gone {
        if let Some(resource) = cache.remove(&key) {
            events.push(ResourceWatchEvent::deleted(resource));
        }
    }

    histogram!("keel_controller_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
    debug!(
        plural = %options.plural,
        drift = events.len(),
        cached = cache.len(),
        took_ms = %t0.elapsed().as_millis(),
        "controller: reconcile pass"
    );
    Ok(events)
}

fn fold_event(cache: &mut FxHashMap<String, Resource>, event: &ResourceWatchEvent) {
    use keel_core::ResourceWatchEventType::*;
    let key = event.resource.qualified_name();
    match event.event_type {
        Created | Updated => {
            cache.insert(key, event.resource.clone());
        }
        Deleted => {
            cache.remove(&key);
        }
    }
}

fn publish(
    snapshot: &ArcSwap<ControllerSnapshot>,
    cache: &FxHashMap<String, Resource>,
    epoch: &mut u64,
) {
    *epoch += 1;
    let mut resources: Vec<Resource> = cache.values().cloned().collect();
    resources.sort_by_key(|r| r.qualified_name());
    snapshot.store(Arc::new(ControllerSnapshot { epoch: *epoch, resources }));
}

/// A running controller. Dropping it (or calling [`stop`](Self::stop))
/// aborts the writer task.
pub struct ResourceController {
    snapshot: Arc<ArcSwap<ControllerSnapshot>>,
    events: broadcast::Sender<ResourceWatchEvent>,
    cancel: CancelHandle,
}

impl ResourceController {
    /// Prime the cache with a full reconcile pass, open the watch, and
    /// hand both to the single writer task.
    pub async fn start(repo: Arc<Repository>, options: ResourceControllerOptions) -> Result<Self> {
        let t0 = Instant::now();
        let mut cache: FxHashMap<String, Resource> = FxHashMap::default();
        reconcile(&repo, &options, &mut cache).await?;

        let watch = repo
            .watch(
                &options.group,
                &options.version,
                &options.plural,
                options.namespace.as_deref(),
                &options.label_selectors,
            )
            .await?;

        let snapshot = Arc::new(ArcSwap::from_pointee(ControllerSnapshot::default()));
        let (events, _) = broadcast::channel(EVENT_BUS_CAP);
        let mut epoch = 0u64;
        publish(&snapshot, &cache, &mut epoch);
        info!(
            plural = %options.plural,
            primed = cache.len(),
            took_ms = %t0.elapsed().as_millis(),
            "controller: started"
        );

        let snapshot_writer = Arc::clone(&snapshot);
        let bus = events.clone();
        let task = tokio::spawn(async move {
            // Bind the whole handle so disjoint capture doesn't drop the
            // watch's CancelHandle (which would abort the forwarder task).
            let mut watch = watch;
            let mut ticker = tokio::time::interval(options.reconciliation_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    maybe = watch.rx.recv() => {
                        let Some(event) = maybe else {
                            warn!(plural = %options.plural, "controller: watch closed, stopping");
                            break;
                        };
                        counter!("keel_controller_events_total", 1u64);
                        fold_event(&mut cache, &event);
                        publish(&snapshot_writer, &cache, &mut epoch);
                        let _ = bus.send(event);
                    }
                    _ = ticker.tick() => {
                        match reconcile(&repo, &options, &mut cache).await {
                            Ok(drift) if !drift.is_empty() => {
                                counter!("keel_controller_drift_total", drift.len() as u64);
                                publish(&snapshot_writer, &cache, &mut epoch);
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!(plural = %options.plural, error = %err, "controller: reconcile failed, keeping last cache");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { snapshot, events, cancel: CancelHandle::new(task) })
    }

    pub fn snapshot(&self) -> Arc<ControllerSnapshot> {
        self.snapshot.load_full()
    }

    /// Subscribe to the event feed. Slow consumers may observe
    /// `Lagged` and should fall back to [`snapshot`](Self::snapshot).
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceWatchEvent> {
        self.events.subscribe()
    }

    pub fn stop(self) {
        self.cancel.cancel();
    }
}
