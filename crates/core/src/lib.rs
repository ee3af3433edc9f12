//! Knamespacer core types: namespace snapshots, change events, policies and merge modes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod merge;
pub mod policy;

pub use merge::{merge_namespace, MergedMetadata, Mode};
pub use policy::{ConfigResolver, EffectivePolicy, NamespacePolicy, PolicyError, PolicySet};

/// Annotation or label key/value pairs. Ordered to match the kube wire types.
pub type Metadata = BTreeMap<String, String>;

/// Point-in-time view of a cluster namespace. Never cached across reconciles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNamespace {
    pub name: String,
    /// Absent on the wire is represented as empty.
    pub annotations: Metadata,
    pub labels: Metadata,
    /// Version the snapshot was read at; writes are pinned to it when present.
    pub resource_version: Option<String>,
    /// Deletion in progress (deletion timestamp set or phase `Terminating`).
    pub terminating: bool,
}

impl ClusterNamespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// An object that exists on the server but cannot stand in for the configured namespace.
    pub fn is_placeholder(&self) -> bool {
        self.name.is_empty() || self.terminating
    }

    /// Copy of this snapshot carrying new metadata; identity fields are kept.
    pub fn with_metadata(&self, merged: MergedMetadata) -> Self {
        Self {
            name: self.name.clone(),
            annotations: merged.annotations,
            labels: merged.labels,
            resource_version: self.resource_version.clone(),
            terminating: self.terminating,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A namespace lifecycle change as delivered by the watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEvent {
    pub kind: ChangeKind,
    pub name: String,
}

impl NamespaceEvent {
    pub fn new(kind: ChangeKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into() }
    }
}

pub mod prelude {
    pub use super::{
        ChangeKind, ClusterNamespace, ConfigResolver, EffectivePolicy, Metadata, MergedMetadata, Mode,
        NamespaceEvent, NamespacePolicy, PolicyError, PolicySet,
    };
}
