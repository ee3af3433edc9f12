//! Event source: turns the namespace watch into reconcile requests, one per event, in order.

use std::sync::Arc;
use std::time::Duration;

use knamespacer_core::NamespaceEvent;
use knamespacer_kubehub::ClusterGateway;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ReconcileRequest;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Subscribe to namespace events and forward each as a `ReconcileRequest`. When a watch
/// ends it resubscribes until `requests` is closed.
pub fn spawn_event_source(
    gateway: Arc<dyn ClusterGateway>,
    requests: mpsc::Sender<ReconcileRequest>,
    cap: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (ev_tx, mut ev_rx) = mpsc::channel::<NamespaceEvent>(cap.max(1));
            let forward = {
                let requests = requests.clone();
                async move {
                    loop {
                        let ev = tokio::select! {
                            ev = ev_rx.recv() => match ev {
                                Some(ev) => ev,
                                None => return true,
                            },
                            // Dropping ev_rx here ends the watch through its own closed() arm
                            _ = requests.closed() => return false,
                        };
                        debug!(ns = %ev.name, kind = %ev.kind, "namespace event");
                        if requests.send(ReconcileRequest::from(ev)).await.is_err() {
                            return false;
                        }
                    }
                }
            };
            let (watched, open) = tokio::join!(gateway.watch_namespaces(ev_tx), forward);
            if let Err(e) = watched {
                warn!(error = %e, "namespace watch failed");
            }
            if !open || requests.is_closed() {
                info!("reconcile queue closed; stopping event source");
                break;
            }
            warn!(delay_ms = RESUBSCRIBE_DELAY.as_millis() as u64, "namespace watch ended; resubscribing");
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    })
}
