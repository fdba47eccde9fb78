//! Typed documents for the grounding store
//!
//! Each document kind persisted by the store is an explicit record with a
//! fixed serde schema. `BTreeMap`/`BTreeSet` keep the JSON output stable
//! across runs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Reserved sentinel label for longforms with no grounding.
pub const UNGROUNDED: &str = "ungrounded";

/// Mapping from longform phrase to grounding label, owned by one shortform.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct GroundingMap {
    entries: BTreeMap<String, String>,
}

impl GroundingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, longform: impl Into<String>, label: impl Into<String>) {
        self.entries.insert(longform.into(), label.into());
    }

    pub fn get(&self, longform: &str) -> Option<&str> {
        self.entries.get(longform).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    /// All labels appearing as values, including the sentinel.
    pub fn labels(&self) -> BTreeSet<String> {
        self.entries.values().cloned().collect()
    }

    /// Labels appearing as values, excluding the sentinel.
    pub fn grounded_labels(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|l| *l != UNGROUNDED)
            .cloned()
            .collect()
    }

    /// Rewrite every value through the given label mapping.
    pub fn map_labels<F>(&self, mut f: F) -> GroundingMap
    where
        F: FnMut(&str) -> String,
    {
        GroundingMap {
            entries: self
                .entries
                .iter()
                .map(|(lf, label)| (lf.clone(), f(label)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for GroundingMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        GroundingMap {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Mapping from grounding label (never the sentinel) to human-readable name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct NamesMap {
    entries: BTreeMap<String, String>,
}

impl NamesMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>, name: impl Into<String>) {
        self.entries.insert(label.into(), name.into());
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.entries.get(label).map(String::as_str)
    }

    pub fn remove(&mut self, label: &str) -> Option<String> {
        self.entries.remove(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for NamesMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        NamesMap {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Set of labels marked as positive classes for training.
///
/// Serializes as a sorted JSON array, matching the list layout of the
/// stored `pos_labels` documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct PosLabelSet {
    labels: BTreeSet<String>,
}

impl PosLabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Symmetric-difference toggle of one label.
    pub fn toggle(&mut self, label: &str) {
        if !self.labels.remove(label) {
            self.labels.insert(label.to_string());
        }
    }

    /// Keep only labels present in `keep`.
    pub fn retain_within(&mut self, keep: &BTreeSet<String>) {
        self.labels.retain(|l| keep.contains(l));
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.labels.iter()
    }

    pub fn as_set(&self) -> &BTreeSet<String> {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl FromIterator<String> for PosLabelSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        PosLabelSet {
            labels: iter.into_iter().collect(),
        }
    }
}

/// The aggregated per-model document set: one grounding map per shortform
/// trained together, a shared names map, and shared positive labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatedBundle {
    pub grounding_dict: BTreeMap<String, GroundingMap>,
    pub names: NamesMap,
    pub pos_labels: PosLabelSet,
}

impl AggregatedBundle {
    pub fn shortforms(&self) -> BTreeSet<String> {
        self.grounding_dict.keys().cloned().collect()
    }

    /// Every label appearing as a value in any grounding map, sentinel included.
    pub fn label_set(&self) -> BTreeSet<String> {
        self.grounding_dict
            .values()
            .flat_map(|gm| gm.labels())
            .collect()
    }

    /// Every non-sentinel label appearing as a value in any grounding map.
    pub fn grounded_label_set(&self) -> BTreeSet<String> {
        self.grounding_dict
            .values()
            .flat_map(|gm| gm.grounded_labels())
            .collect()
    }
}

/// Persisted classifier artifact.
///
/// Only the views needed for alignment checks are typed. `params` carries
/// the trainer's internals (learned coefficients and the like) and must
/// survive a commit untouched: coefficients stay keyed by position in
/// `labels`, so a rename rewrites label annotations in place and never
/// reorders them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClassifierArtifact {
    /// Class labels in the trainer's positional order.
    pub labels: Vec<String>,
    pub shortforms: Vec<String>,
    pub pos_labels: BTreeSet<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ClassifierArtifact {
    pub fn label_set(&self) -> BTreeSet<String> {
        self.labels.iter().cloned().collect()
    }

    pub fn shortform_set(&self) -> BTreeSet<String> {
        self.shortforms.iter().cloned().collect()
    }
}

/// Miner output for one shortform: candidate longforms with mining scores.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ScoredLongforms {
    entries: Vec<(String, f64)>,
}

impl ScoredLongforms {
    pub fn new(entries: Vec<(String, f64)>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, f64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
