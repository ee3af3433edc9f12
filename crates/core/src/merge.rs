//! Metadata merge modes. Every function returns a fresh map; inputs are only borrowed.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ClusterNamespace, EffectivePolicy, Metadata};

/// How configured metadata interacts with metadata already on a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Replace wholesale with the configured map.
    Sync,
    /// Add missing keys and overwrite existing ones.
    Upsert,
    /// Add missing keys only.
    Insert,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Sync => "sync",
            Mode::Upsert => "upsert",
            Mode::Insert => "insert",
        }
    }

    pub fn apply(self, existing: &Metadata, desired: &Metadata) -> Metadata {
        match self {
            Mode::Sync => sync(existing, desired),
            Mode::Upsert => upsert(existing, desired),
            Mode::Insert => insert(existing, desired),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Mode::Sync),
            "upsert" => Ok(Mode::Upsert),
            "insert" => Ok(Mode::Insert),
            other => Err(format!("unknown mode {:?} (expect sync, upsert or insert)", other)),
        }
    }
}

pub fn sync(_existing: &Metadata, desired: &Metadata) -> Metadata {
    desired.clone()
}

pub fn upsert(existing: &Metadata, desired: &Metadata) -> Metadata {
    let mut out = existing.clone();
    out.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

pub fn insert(existing: &Metadata, desired: &Metadata) -> Metadata {
    let mut out = existing.clone();
    for (k, v) in desired {
        out.entry(k.clone()).or_insert_with(|| v.clone());
    }
    out
}

/// Unset mode is identity.
pub fn merge(mode: Option<Mode>, existing: &Metadata, desired: &Metadata) -> Metadata {
    match mode {
        Some(m) => m.apply(existing, desired),
        None => existing.clone(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedMetadata {
    pub annotations: Metadata,
    pub labels: Metadata,
}

impl MergedMetadata {
    pub fn matches(&self, ns: &ClusterNamespace) -> bool {
        self.annotations == ns.annotations && self.labels == ns.labels
    }
}

/// Annotations and labels merged independently under the policy's mode.
/// `None` when the policy has no mode and nothing should be written.
pub fn merge_namespace(ns: &ClusterNamespace, policy: &EffectivePolicy) -> Option<MergedMetadata> {
    let mode = Some(policy.mode?);
    Some(MergedMetadata {
        annotations: merge(mode, &ns.annotations, &policy.annotations),
        labels: merge(mode, &ns.labels, &policy.labels),
    })
}
