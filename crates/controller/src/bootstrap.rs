//! One-shot creation of configured namespaces that are missing from the cluster.

use std::collections::HashSet;
use std::sync::Arc;

use knamespacer_core::{ClusterNamespace, ConfigResolver};
use knamespacer_kubehub::ClusterGateway;
use metrics::counter;
use tracing::{error, info};

use crate::ReconcileError;

/// Configured names with no usable counterpart in `existing`, in configuration order.
/// Terminating or empty objects do not count as existing.
pub fn missing_namespaces<'a, I>(configured: I, existing: &[ClusterNamespace]) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let present: HashSet<&str> = existing
        .iter()
        .filter(|ns| !ns.is_placeholder())
        .map(|ns| ns.name.as_str())
        .collect();
    configured
        .into_iter()
        .filter(|name| !present.contains(name))
        .map(str::to_string)
        .collect()
}

pub struct Bootstrapper {
    gateway: Arc<dyn ClusterGateway>,
}

impl Bootstrapper {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }

    /// Create every missing configured namespace. All names are attempted; failures are
    /// reported together once the pass is done. Returns the names that were created.
    pub async fn create_missing(&self, resolver: &ConfigResolver) -> Result<Vec<String>, ReconcileError> {
        let existing = self.gateway.list_namespaces().await.map_err(ReconcileError::ClusterList)?;
        let missing = missing_namespaces(resolver.configured_names(), &existing);
        if missing.is_empty() {
            info!("all configured namespaces already exist");
            return Ok(Vec::new());
        }
        info!(missing = ?missing, "creating configured namespaces that do not exist in cluster");

        let mut created = Vec::with_capacity(missing.len());
        let mut failures = Vec::new();
        for name in missing {
            match self.gateway.create_namespace(&name).await {
                Ok(()) => {
                    counter!("bootstrap_created_total", 1u64);
                    info!(ns = %name, "namespace created");
                    created.push(name);
                }
                Err(e) => {
                    counter!("bootstrap_failed_total", 1u64);
                    error!(ns = %name, error = %e, "unable to create namespace");
                    failures.push((name, e));
                }
            }
        }
        if failures.is_empty() {
            Ok(created)
        } else {
            Err(ReconcileError::PartialBootstrap { created, failures })
        }
    }
}
