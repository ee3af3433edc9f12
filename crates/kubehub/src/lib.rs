//! Knamespacer kubehub: the cluster gateway the controller talks through, and the watch adapter.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::{api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use kube::{
    api::{Api, ListParams, PostParams},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, ResourceExt,
};
use knamespacer_core::{ChangeKind, ClusterNamespace, NamespaceEvent};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "testing"))]
pub mod memory;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryGateway;

/// Default bound on a single watch session before the watcher resubscribes.
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 60;

/// Upper bound on a watch session; must stay under the client's read timeout.
pub const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

fn clamp_watch_timeout(secs: u32) -> u32 {
    secs.clamp(1, MAX_WATCH_TIMEOUT_SECS)
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("namespace {0} not found")]
    NotFound(String),
    #[error("namespace {0} already exists")]
    AlreadyExists(String),
    #[error("namespace {0} was modified concurrently")]
    Conflict(String),
    #[error("kube api: {0}")]
    Kube(#[from] kube::Error),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    fn classify(err: kube::Error, name: &str) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => GatewayError::NotFound(name.to_string()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                GatewayError::AlreadyExists(name.to_string())
            }
            kube::Error::Api(ae) if ae.code == 409 => GatewayError::Conflict(name.to_string()),
            other => GatewayError::Kube(other),
        }
    }
}

/// Everything the controller needs from the cluster. One instance is built at startup and shared.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<ClusterNamespace>, GatewayError>;

    async fn get_namespace(&self, name: &str) -> Result<ClusterNamespace, GatewayError>;

    async fn create_namespace(&self, name: &str) -> Result<(), GatewayError>;

    /// Write annotations and labels of `ns`. Pinned to `ns.resource_version` when set.
    async fn update_namespace(&self, ns: &ClusterNamespace) -> Result<(), GatewayError>;

    /// Push namespace change events into `tx` in arrival order. Transient disconnects are
    /// absorbed here; returns when the stream ends or `tx` is closed.
    async fn watch_namespaces(&self, tx: mpsc::Sender<NamespaceEvent>) -> Result<(), GatewayError>;
}

/// Build the kube client: in-cluster config first, then the local kubeconfig.
pub async fn get_kube_client() -> Result<Client> {
    debug!("loading kubernetes client config");
    Client::try_default().await.context("creating kubernetes client")
}

pub fn snapshot_from(ns: &Namespace) -> ClusterNamespace {
    let meta = &ns.metadata;
    let terminating = meta.deletion_timestamp.is_some()
        || ns.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Terminating");
    ClusterNamespace {
        name: meta.name.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone(),
        terminating,
    }
}

/// Gateway over the real API server.
pub struct KubeGateway {
    api: Api<Namespace>,
    watch_timeout_secs: u32,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client), watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS }
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        let clamped = clamp_watch_timeout(secs);
        if clamped != secs {
            warn!(requested = secs, using = clamped, "watch timeout out of range; clamped");
        }
        self.watch_timeout_secs = clamped;
        self
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn list_namespaces(&self) -> Result<Vec<ClusterNamespace>, GatewayError> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(snapshot_from).collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<ClusterNamespace, GatewayError> {
        match self.api.get(name).await {
            Ok(ns) => Ok(snapshot_from(&ns)),
            Err(e) => Err(GatewayError::classify(e, name)),
        }
    }

    async fn create_namespace(&self, name: &str) -> Result<(), GatewayError> {
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            ..Default::default()
        };
        self.api
            .create(&PostParams::default(), &ns)
            .await
            .map_err(|e| GatewayError::classify(e, name))?;
        Ok(())
    }

    async fn update_namespace(&self, ns: &ClusterNamespace) -> Result<(), GatewayError> {
        // Only metadata is ours; spec and the rest of the object come from the live read.
        let mut live = self.api.get(&ns.name).await.map_err(|e| GatewayError::classify(e, &ns.name))?;
        live.metadata.annotations = Some(ns.annotations.clone());
        live.metadata.labels = Some(ns.labels.clone());
        if let Some(rv) = &ns.resource_version {
            live.metadata.resource_version = Some(rv.clone());
        }
        live.metadata.managed_fields = None;
        self.api
            .replace(&ns.name, &PostParams::default(), &live)
            .await
            .map_err(|e| GatewayError::classify(e, &ns.name))?;
        Ok(())
    }

    async fn watch_namespaces(&self, tx: mpsc::Sender<NamespaceEvent>) -> Result<(), GatewayError> {
        let cfg = watcher::Config::default().timeout(self.watch_timeout_secs);
        let stream = watcher::watcher(self.api.clone(), cfg).default_backoff();
        futures::pin_mut!(stream);
        let mut tracker = EventTracker::default();
        info!(timeout_secs = self.watch_timeout_secs, "namespace watcher started");
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = tx.closed() => {
                    debug!("event receiver closed; stopping namespace watcher");
                    return Ok(());
                }
            };
            match next {
                Some(Ok(ev)) => {
                    for out in tracker.observe(ev) {
                        counter!("watch_events_total", 1u64, "kind" => out.kind.as_str());
                        if tx.send(out).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Some(Err(e)) => {
                    // Session drops and expired versions land here; the watcher relists on its own.
                    counter!("watch_errors_total", 1u64);
                    warn!(error = %e, "namespace watch interrupted; resubscribing");
                }
                None => break,
            }
        }
        warn!("namespace watch stream ended");
        Ok(())
    }
}

/// Turns raw watcher events into Added/Modified/Deleted by remembering which names were seen.
#[derive(Debug, Default)]
pub struct EventTracker {
    seen: BTreeSet<String>,
}

impl EventTracker {
    pub fn observe(&mut self, ev: Event<Namespace>) -> Vec<NamespaceEvent> {
        match ev {
            Event::Applied(ns) => vec![self.applied(ns.name_any())],
            Event::Deleted(ns) => {
                let name = ns.name_any();
                self.seen.remove(&name);
                vec![NamespaceEvent::new(ChangeKind::Deleted, name)]
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "namespace watch relisted");
                let listed: BTreeSet<String> = list.iter().map(|ns| ns.name_any()).collect();
                // Anything we knew about that is gone from the relist was deleted during the gap.
                let gone: Vec<String> = self.seen.difference(&listed).cloned().collect();
                let mut out: Vec<NamespaceEvent> = gone
                    .into_iter()
                    .map(|name| {
                        self.seen.remove(&name);
                        NamespaceEvent::new(ChangeKind::Deleted, name)
                    })
                    .collect();
                out.extend(list.iter().map(|ns| self.applied(ns.name_any())));
                out
            }
        }
    }

    fn applied(&mut self, name: String) -> NamespaceEvent {
        let kind = if self.seen.insert(name.clone()) { ChangeKind::Added } else { ChangeKind::Modified };
        NamespaceEvent::new(kind, name)
    }
}
