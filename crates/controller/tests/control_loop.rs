#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use knamespacer_controller::{spawn_reconciler, Phase, ReconcileRequest, Reconciler};
use knamespacer_core::{ClusterNamespace, ConfigResolver, NamespaceEvent};
use knamespacer_kubehub::{ClusterGateway, GatewayError, MemoryGateway};
use tokio::sync::{mpsc, Notify};

const POLICY: &str = r#"
defaultNamespaceSettings:
  mode: upsert
  labels:
    team: platform
namespaces:
  - name: a
  - name: b
  - name: c
"#;

fn reconciler(gw: &Arc<MemoryGateway>) -> Reconciler {
    let resolver = Arc::new(ConfigResolver::from_yaml_str(POLICY).unwrap());
    Reconciler::new(gw.clone(), resolver)
}

#[tokio::test]
async fn requests_are_handled_one_at_a_time_in_queue_order() {
    let gw = Arc::new(MemoryGateway::new());
    let (tx, handle) = spawn_reconciler(reconciler(&gw), 2);
    for name in ["c", "a", "missing", "b"] {
        tx.send(ReconcileRequest::named(name)).await.unwrap();
    }
    drop(tx);

    let r = tokio::time::timeout(Duration::from_secs(2), handle.join()).await.unwrap().unwrap();
    assert_eq!(r.phase(), Phase::Steady);
    assert_eq!(gw.create_calls(), vec!["a", "b", "c"]);
    assert_eq!(gw.update_calls(), vec!["c", "a", "b"]);
}

#[tokio::test]
async fn failures_do_not_stop_the_loop() {
    let gw = Arc::new(MemoryGateway::new());
    gw.fail_get("a");
    gw.fail_update("b");
    let (tx, handle) = spawn_reconciler(reconciler(&gw), 4);
    for name in ["a", "b", "c"] {
        tx.send(ReconcileRequest::named(name)).await.unwrap();
    }
    drop(tx);

    tokio::time::timeout(Duration::from_secs(2), handle.join()).await.unwrap().unwrap();
    assert_eq!(gw.update_calls(), vec!["c"]);
    assert_eq!(gw.namespace("c").unwrap().labels.get("team").map(String::as_str), Some("platform"));
}

#[tokio::test]
async fn shutdown_stops_an_idle_loop() {
    let gw = Arc::new(MemoryGateway::new());
    let (tx, handle) = spawn_reconciler(reconciler(&gw), 4);
    let r = tokio::time::timeout(Duration::from_secs(2), handle.shutdown()).await.unwrap().unwrap();
    assert!(tx.is_closed());
    assert!(tx.send(ReconcileRequest::named("a")).await.is_err());
    drop(r);
}

/// All configured namespaces exist; reads hang until cancelled.
#[derive(Default)]
struct HangingReads {
    entered: Notify,
}

#[async_trait]
impl ClusterGateway for HangingReads {
    async fn list_namespaces(&self) -> Result<Vec<ClusterNamespace>, GatewayError> {
        Ok(["a", "b", "c"].into_iter().map(ClusterNamespace::new).collect())
    }

    async fn get_namespace(&self, _name: &str) -> Result<ClusterNamespace, GatewayError> {
        self.entered.notify_one();
        std::future::pending().await
    }

    async fn create_namespace(&self, name: &str) -> Result<(), GatewayError> {
        Err(GatewayError::AlreadyExists(name.to_string()))
    }

    async fn update_namespace(&self, ns: &ClusterNamespace) -> Result<(), GatewayError> {
        Err(GatewayError::Rejected(format!("update {}", ns.name)))
    }

    async fn watch_namespaces(&self, tx: mpsc::Sender<NamespaceEvent>) -> Result<(), GatewayError> {
        tx.closed().await;
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_cancels_an_in_flight_gateway_call() {
    let gw = Arc::new(HangingReads::default());
    let resolver = Arc::new(ConfigResolver::from_yaml_str(POLICY).unwrap());
    let (tx, handle) = spawn_reconciler(Reconciler::new(gw.clone(), resolver), 4);
    tx.send(ReconcileRequest::named("a")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), gw.entered.notified()).await.expect("read never started");
    let r = tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .expect("shutdown waited on the hung read")
        .unwrap();
    assert_eq!(r.phase(), Phase::Steady);
}
