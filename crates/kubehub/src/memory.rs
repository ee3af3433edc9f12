//! In-memory cluster gateway for tests. Built with the `testing` feature.
//!
//! Mirrors the API server behaviour the controller relies on: resource versions bump on every
//! real change, writes pinned to a stale version conflict, and no-op updates emit no event.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use knamespacer_core::{ChangeKind, ClusterNamespace, NamespaceEvent};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{ClusterGateway, GatewayError};

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, ClusterNamespace>,
    next_rv: u64,
    fail_get: HashSet<String>,
    fail_create: HashSet<String>,
    fail_update: HashSet<String>,
    creates: Vec<String>,
    updates: Vec<String>,
    subscribers: Vec<mpsc::UnboundedSender<NamespaceEvent>>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn emit(&mut self, kind: ChangeKind, name: &str) {
        let ev = NamespaceEvent::new(kind, name);
        self.subscribers.retain(|s| s.send(ev.clone()).is_ok());
    }
}

#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespaces<I>(items: I) -> Self
    where
        I: IntoIterator<Item = ClusterNamespace>,
    {
        let gw = Self::new();
        for ns in items {
            gw.insert(ns);
        }
        gw
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace a namespace as an outside actor would, emitting the matching event.
    pub fn insert(&self, mut ns: ClusterNamespace) {
        let mut st = self.lock();
        ns.resource_version = Some(st.bump());
        let kind = if st.namespaces.contains_key(&ns.name) { ChangeKind::Modified } else { ChangeKind::Added };
        let name = ns.name.clone();
        st.namespaces.insert(name.clone(), ns);
        st.emit(kind, &name);
    }

    pub fn delete(&self, name: &str) {
        let mut st = self.lock();
        if st.namespaces.remove(name).is_some() {
            st.emit(ChangeKind::Deleted, name);
        }
    }

    pub fn fail_get(&self, name: &str) {
        self.lock().fail_get.insert(name.to_string());
    }

    pub fn fail_create(&self, name: &str) {
        self.lock().fail_create.insert(name.to_string());
    }

    pub fn fail_update(&self, name: &str) {
        self.lock().fail_update.insert(name.to_string());
    }

    pub fn namespace(&self, name: &str) -> Option<ClusterNamespace> {
        self.lock().namespaces.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().namespaces.keys().cloned().collect()
    }

    /// Names passed to `create_namespace`, including failed attempts.
    pub fn create_calls(&self) -> Vec<String> {
        self.lock().creates.clone()
    }

    /// Names accepted by `update_namespace`, including no-op writes.
    pub fn update_calls(&self) -> Vec<String> {
        self.lock().updates.clone()
    }
}

#[async_trait]
impl ClusterGateway for MemoryGateway {
    async fn list_namespaces(&self) -> Result<Vec<ClusterNamespace>, GatewayError> {
        Ok(self.lock().namespaces.values().cloned().collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<ClusterNamespace, GatewayError> {
        let st = self.lock();
        if st.fail_get.contains(name) {
            return Err(GatewayError::Rejected(format!("get {}", name)));
        }
        st.namespaces.get(name).cloned().ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    async fn create_namespace(&self, name: &str) -> Result<(), GatewayError> {
        let mut st = self.lock();
        st.creates.push(name.to_string());
        if st.fail_create.contains(name) {
            return Err(GatewayError::Rejected(format!("create {}", name)));
        }
        if st.namespaces.get(name).is_some_and(|ns| !ns.is_placeholder()) {
            return Err(GatewayError::AlreadyExists(name.to_string()));
        }
        let mut ns = ClusterNamespace::new(name);
        ns.resource_version = Some(st.bump());
        st.namespaces.insert(name.to_string(), ns);
        st.emit(ChangeKind::Added, name);
        Ok(())
    }

    async fn update_namespace(&self, ns: &ClusterNamespace) -> Result<(), GatewayError> {
        let mut st = self.lock();
        if st.fail_update.contains(&ns.name) {
            return Err(GatewayError::Rejected(format!("update {}", ns.name)));
        }
        let live = st
            .namespaces
            .get(&ns.name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(ns.name.clone()))?;
        if ns.resource_version.is_some() && ns.resource_version != live.resource_version {
            return Err(GatewayError::Conflict(ns.name.clone()));
        }
        st.updates.push(ns.name.clone());
        if live.annotations == ns.annotations && live.labels == ns.labels {
            debug!(ns = %ns.name, "update is a no-op");
            return Ok(());
        }
        let mut next = live;
        next.annotations = ns.annotations.clone();
        next.labels = ns.labels.clone();
        next.resource_version = Some(st.bump());
        st.namespaces.insert(ns.name.clone(), next);
        st.emit(ChangeKind::Modified, &ns.name);
        Ok(())
    }

    async fn watch_namespaces(&self, tx: mpsc::Sender<NamespaceEvent>) -> Result<(), GatewayError> {
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        {
            // Initial listing, like a fresh watch
            let mut st = self.lock();
            for name in st.namespaces.keys() {
                let _ = sub_tx.send(NamespaceEvent::new(ChangeKind::Added, name.clone()));
            }
            st.subscribers.push(sub_tx);
        }
        loop {
            tokio::select! {
                ev = sub_rx.recv() => match ev {
                    Some(ev) => {
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tx.closed() => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let gw = MemoryGateway::with_namespaces([ClusterNamespace::new("a")]);
        let snap = gw.get_namespace("a").await.unwrap();
        gw.insert(ClusterNamespace::new("a"));
        let mut write = snap.clone();
        write.labels.insert("x".into(), "y".into());
        assert!(matches!(gw.update_namespace(&write).await, Err(GatewayError::Conflict(_))));
    }

    #[tokio::test]
    async fn create_rejects_live_but_replaces_placeholder() {
        let mut dying = ClusterNamespace::new("old");
        dying.terminating = true;
        let gw = MemoryGateway::with_namespaces([ClusterNamespace::new("live"), dying]);
        assert!(matches!(gw.create_namespace("live").await, Err(GatewayError::AlreadyExists(_))));
        gw.create_namespace("old").await.unwrap();
        assert!(!gw.namespace("old").unwrap().terminating);
    }

    #[tokio::test]
    async fn watch_replays_existing_then_streams_changes() {
        let gw = std::sync::Arc::new(MemoryGateway::with_namespaces([ClusterNamespace::new("a")]));
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn({
            let gw = gw.clone();
            async move { gw.watch_namespaces(tx).await }
        });
        assert_eq!(rx.recv().await, Some(NamespaceEvent::new(ChangeKind::Added, "a")));
        gw.create_namespace("b").await.unwrap();
        gw.delete("a");
        assert_eq!(rx.recv().await, Some(NamespaceEvent::new(ChangeKind::Added, "b")));
        assert_eq!(rx.recv().await, Some(NamespaceEvent::new(ChangeKind::Deleted, "a")));
        drop(rx);
        task.await.unwrap().unwrap();
    }
}
