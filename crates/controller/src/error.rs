use knamespacer_kubehub::GatewayError;

/// Per-namespace failures. None of these stop the control loop.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("reading namespace {name}: {source}")]
    ClusterRead {
        name: String,
        #[source]
        source: GatewayError,
    },
    #[error("writing namespace {name}: {source}")]
    ClusterWrite {
        name: String,
        #[source]
        source: GatewayError,
    },
    #[error("listing namespaces: {0}")]
    ClusterList(#[source] GatewayError),
    #[error("failed to create {} namespace(s): {}", .failures.len(), failed_names(.failures))]
    PartialBootstrap {
        created: Vec<String>,
        failures: Vec<(String, GatewayError)>,
    },
}

impl ReconcileError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::ClusterRead { .. } => "cluster_read",
            ReconcileError::ClusterWrite { .. } => "cluster_write",
            ReconcileError::ClusterList(_) => "cluster_list",
            ReconcileError::PartialBootstrap { .. } => "partial_bootstrap",
        }
    }
}

fn failed_names(failures: &[(String, GatewayError)]) -> String {
    failures.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>().join(", ")
}
