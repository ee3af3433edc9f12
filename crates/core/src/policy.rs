//! Policy document (`defaultNamespaceSettings` + `namespaces`) and per-namespace resolution.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::{Metadata, Mode};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("reading policy file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing policy file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate namespace entry: {0}")]
    DuplicateName(String),
    #[error("namespace entry #{0} has an empty name")]
    EmptyName(usize),
    #[error("namespace {0} not found in configuration")]
    NotFound(String),
}

impl PolicyError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PolicyError::NotFound(_))
    }
}

/// One entry of the policy file. Every field except `name` may be left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespacePolicy {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "mode_or_unset")]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub annotations: Option<Metadata>,
    #[serde(default)]
    pub labels: Option<Metadata>,
}

/// `null` and `""` both mean unset; anything else must be a known mode.
fn mode_or_unset<'de, D>(de: D) -> Result<Option<Mode>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// The parsed policy file, as written by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySet {
    /// `name` is ignored here.
    #[serde(rename = "defaultNamespaceSettings", default)]
    pub default: NamespacePolicy,
    #[serde(default)]
    pub namespaces: Vec<NamespacePolicy>,
}

impl PolicySet {
    pub fn from_yaml_str(s: &str) -> Result<Self, PolicyError> {
        Ok(serde_yaml::from_str(s)?)
    }
}

/// A policy after per-field default substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub name: String,
    pub mode: Option<Mode>,
    pub annotations: Metadata,
    pub labels: Metadata,
}

/// Validated, immutable policy set answering "what should namespace X look like".
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    set: PolicySet,
}

impl ConfigResolver {
    pub fn new(set: PolicySet) -> Result<Self, PolicyError> {
        let mut seen = HashSet::new();
        for (idx, entry) in set.namespaces.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(PolicyError::EmptyName(idx));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(PolicyError::DuplicateName(entry.name.clone()));
            }
        }
        Ok(Self { set })
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, PolicyError> {
        Self::new(PolicySet::from_yaml_str(s)?)
    }

    /// Read and validate the policy file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        info!(path = %path.display(), "reading policy file");
        let contents = std::fs::read_to_string(path)
            .map_err(|source| PolicyError::Read { path: path.to_path_buf(), source })?;
        let resolver = Self::from_yaml_str(&contents)?;
        debug!(default = ?resolver.set.default, "policy defaults");
        debug!(namespaces = ?resolver.set.namespaces, "policy entries");
        Ok(resolver)
    }

    pub fn policies(&self) -> &PolicySet {
        &self.set
    }

    /// Names of all configured namespaces, in file order.
    pub fn configured_names(&self) -> impl Iterator<Item = &str> {
        self.set.namespaces.iter().map(|p| p.name.as_str())
    }

    /// Effective policy for `name`; `NotFound` means the namespace is unmanaged.
    pub fn resolve(&self, name: &str) -> Result<EffectivePolicy, PolicyError> {
        let entry = self
            .set
            .namespaces
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| PolicyError::NotFound(name.to_string()))?;
        let default = &self.set.default;
        Ok(EffectivePolicy {
            name: entry.name.clone(),
            mode: entry.mode.or(default.mode),
            annotations: entry
                .annotations
                .as_ref()
                .or(default.annotations.as_ref())
                .cloned()
                .unwrap_or_default(),
            labels: entry
                .labels
                .as_ref()
                .or(default.labels.as_ref())
                .cloned()
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
defaultNamespaceSettings:
  mode: upsert
  annotations:
    default: annotation
  labels:
    default: label
namespaces:
  - name: one
    mode: sync
    annotations:
      foo: one
    labels:
      bar: one
  - name: three
    mode: insert
    labels:
      add: new
  - name: four
  - name: empty-mode
    mode: ""
    annotations: {}
"#;

    fn m(pairs: &[(&str, &str)]) -> Metadata {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn resolves_explicit_entry() {
        let r = ConfigResolver::from_yaml_str(SAMPLE).unwrap();
        let p = r.resolve("one").unwrap();
        assert_eq!(p.mode, Some(Mode::Sync));
        assert_eq!(p.annotations, m(&[("foo", "one")]));
        assert_eq!(p.labels, m(&[("bar", "one")]));
    }

    #[test]
    fn substitutes_defaults_per_field() {
        let r = ConfigResolver::from_yaml_str(SAMPLE).unwrap();
        let three = r.resolve("three").unwrap();
        assert_eq!(three.mode, Some(Mode::Insert));
        assert_eq!(three.annotations, m(&[("default", "annotation")]));
        assert_eq!(three.labels, m(&[("add", "new")]));

        let four = r.resolve("four").unwrap();
        assert_eq!(four.mode, Some(Mode::Upsert));
        assert_eq!(four.annotations, m(&[("default", "annotation")]));
        assert_eq!(four.labels, m(&[("default", "label")]));
    }

    #[test]
    fn empty_map_is_not_substituted_but_empty_mode_is() {
        let r = ConfigResolver::from_yaml_str(SAMPLE).unwrap();
        let p = r.resolve("empty-mode").unwrap();
        assert_eq!(p.mode, Some(Mode::Upsert));
        assert!(p.annotations.is_empty());
        assert_eq!(p.labels, m(&[("default", "label")]));
    }

    #[test]
    fn mode_stays_unset_without_default() {
        let r = ConfigResolver::from_yaml_str("namespaces:\n  - name: bare\n").unwrap();
        let p = r.resolve("bare").unwrap();
        assert_eq!(p.mode, None);
        assert!(p.annotations.is_empty() && p.labels.is_empty());
    }

    #[test]
    fn unlisted_name_is_not_found() {
        let r = ConfigResolver::from_yaml_str(SAMPLE).unwrap();
        let err = r.resolve("kube-system").unwrap_err();
        assert!(err.is_not_found(), "err={}", err);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let top = "defaultNamespaceSettings: {}\nnamespace: []\n";
        assert!(matches!(PolicySet::from_yaml_str(top), Err(PolicyError::Parse(_))));
        let nested = "namespaces:\n  - name: a\n    label:\n      x: y\n";
        assert!(matches!(PolicySet::from_yaml_str(nested), Err(PolicyError::Parse(_))));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let e = PolicySet::from_yaml_str("namespaces:\n  - name: a\n    mode: replace\n").unwrap_err();
        assert!(e.to_string().contains("unknown mode"), "e={}", e);
    }

    #[test]
    fn duplicate_and_empty_names_are_rejected() {
        let dup = "namespaces:\n  - name: a\n  - name: a\n";
        assert!(matches!(ConfigResolver::from_yaml_str(dup), Err(PolicyError::DuplicateName(n)) if n == "a"));
        let empty = "namespaces:\n  - name: a\n  - mode: sync\n";
        assert!(matches!(ConfigResolver::from_yaml_str(empty), Err(PolicyError::EmptyName(1))));
    }

    #[test]
    fn configured_names_keep_file_order() {
        let r = ConfigResolver::from_yaml_str(SAMPLE).unwrap();
        let names: Vec<_> = r.configured_names().collect();
        assert_eq!(names, vec!["one", "three", "four", "empty-mode"]);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ConfigResolver::load("/nonexistent/knamespacer.yaml").unwrap_err();
        assert!(matches!(err, PolicyError::Read { .. }));
    }
}
