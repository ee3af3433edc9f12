//! Knamespacer controller: bootstrap, per-namespace reconcile and the serial control loop.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use knamespacer_core::{merge_namespace, ChangeKind, ConfigResolver, NamespaceEvent};
use knamespacer_kubehub::ClusterGateway;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod bootstrap;
mod error;
pub mod source;

pub use bootstrap::{missing_namespaces, Bootstrapper};
pub use error::ReconcileError;
pub use source::spawn_event_source;

/// Default capacity of the reconcile queue.
pub const DEFAULT_QUEUE_CAP: usize = 1024;

/// A unit of work naming one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub name: String,
    /// Watch event that produced this request, if any.
    pub cause: Option<ChangeKind>,
}

impl ReconcileRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), cause: None }
    }
}

impl From<NamespaceEvent> for ReconcileRequest {
    fn from(ev: NamespaceEvent) -> Self {
        Self { name: ev.name, cause: Some(ev.kind) }
    }
}

/// `Startup` until the bootstrap pass has run once, then `Steady` for the rest of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Startup,
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No policy entry for this namespace.
    Unmanaged,
    /// Policy has no mode; nothing written.
    NoMode,
    /// Already in the desired state; nothing written.
    Unchanged,
    Updated,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Unmanaged => "unmanaged",
            Outcome::NoMode => "no_mode",
            Outcome::Unchanged => "unchanged",
            Outcome::Updated => "updated",
        }
    }
}

pub struct Reconciler {
    gateway: Arc<dyn ClusterGateway>,
    resolver: Arc<ConfigResolver>,
    bootstrapper: Bootstrapper,
    phase: Phase,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn ClusterGateway>, resolver: Arc<ConfigResolver>) -> Self {
        Self { bootstrapper: Bootstrapper::new(gateway.clone()), gateway, resolver, phase: Phase::Startup }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the bootstrap pass if it has not run yet. Failures are logged and do not block `Steady`.
    pub async fn ensure_bootstrapped(&mut self) {
        if self.phase == Phase::Steady {
            return;
        }
        match self.bootstrapper.create_missing(&self.resolver).await {
            Ok(created) => info!(created = created.len(), "bootstrap complete"),
            Err(e) => error!(error = %e, "unable to create some configured namespaces"),
        }
        self.phase = Phase::Steady;
    }

    /// Bring one namespace to its effective policy.
    pub async fn reconcile(&mut self, name: &str) -> Result<Outcome, ReconcileError> {
        self.ensure_bootstrapped().await;

        let policy = match self.resolver.resolve(name) {
            Ok(p) => p,
            Err(e) => {
                debug!(ns = %name, reason = %e, "no policy configured; skipping");
                return Ok(Outcome::Unmanaged);
            }
        };

        let current = self
            .gateway
            .get_namespace(name)
            .await
            .map_err(|source| ReconcileError::ClusterRead { name: name.to_string(), source })?;

        let Some(merged) = merge_namespace(&current, &policy) else {
            info!(ns = %name, "policy has no mode; leaving metadata untouched");
            return Ok(Outcome::NoMode);
        };
        if merged.matches(&current) {
            debug!(ns = %name, "metadata already in desired state");
            return Ok(Outcome::Unchanged);
        }

        let next = current.with_metadata(merged);
        debug!(ns = %name, annotations = ?next.annotations, labels = ?next.labels, "writing namespace metadata");
        self.gateway
            .update_namespace(&next)
            .await
            .map_err(|source| ReconcileError::ClusterWrite { name: name.to_string(), source })?;
        info!(ns = %name, mode = ?policy.mode, "namespace metadata updated");
        Ok(Outcome::Updated)
    }

    /// Reconcile with logging and metrics; errors end here. Writes are not retried.
    pub async fn handle(&mut self, req: &ReconcileRequest) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        info!(ns = %req.name, cause = ?req.cause, "processing namespace");
        let res = self.reconcile(&req.name).await;
        match &res {
            Ok(outcome) => {
                counter!("reconcile_total", 1u64, "outcome" => outcome.as_str());
                debug!(ns = %req.name, outcome = outcome.as_str(), "reconcile done");
            }
            Err(e) => {
                counter!("reconcile_errors_total", 1u64, "kind" => e.kind());
                error!(ns = %req.name, error = %e, "reconcile failed; skipping");
            }
        }
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }
}

/// Handle to the reconcile task. Dropping it also stops the loop.
pub struct ReconcilerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<Reconciler>,
}

impl ReconcilerHandle {
    /// Stop the loop, abandoning an in-flight reconcile at its next await point.
    pub async fn shutdown(self) -> Option<Reconciler> {
        let _ = self.stop.send(true);
        self.join.await.ok()
    }

    /// Wait for the loop to end on its own (queue closed).
    pub async fn join(self) -> Option<Reconciler> {
        let ReconcilerHandle { stop, join } = self;
        let out = join.await.ok();
        drop(stop);
        out
    }
}

/// Spawn the single consumer. Requests are handled strictly one at a time, in queue order.
/// The bootstrap pass runs before the first request is taken.
pub fn spawn_reconciler(mut reconciler: Reconciler, cap: usize) -> (mpsc::Sender<ReconcileRequest>, ReconcilerHandle) {
    let (tx, mut rx) = mpsc::channel::<ReconcileRequest>(cap.max(1));
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => {
                warn!("shutdown during bootstrap");
                return reconciler;
            }
            _ = reconciler.ensure_bootstrapped() => {}
        }
        loop {
            let req = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                maybe = rx.recv() => match maybe {
                    Some(req) => req,
                    None => {
                        debug!("reconcile queue closed");
                        break;
                    }
                },
            };
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    warn!(ns = %req.name, "shutdown during reconcile; abandoning");
                    break;
                }
                _ = reconciler.handle(&req) => {}
            }
        }
        info!("reconcile loop stopped");
        reconciler
    });

    (tx, ReconcilerHandle { stop: stop_tx, join })
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub queue_cap: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self { queue_cap: DEFAULT_QUEUE_CAP }
    }
}

/// Wire the event source to the reconciler and run until `shutdown` resolves.
pub async fn run_controller<F>(
    gateway: Arc<dyn ClusterGateway>,
    resolver: Arc<ConfigResolver>,
    opts: ControllerOptions,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let reconciler = Reconciler::new(gateway.clone(), resolver);
    let (requests, handle) = spawn_reconciler(reconciler, opts.queue_cap);
    let mut source = spawn_event_source(gateway, requests, opts.queue_cap);
    info!(queue_cap = opts.queue_cap, "controller running");

    tokio::select! {
        _ = shutdown => info!("shutdown requested"),
        _ = &mut source => warn!("event source stopped"),
    }
    source.abort();
    handle.shutdown().await;
    info!("controller stopped");
}
