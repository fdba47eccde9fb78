//! Invariant checks over in-memory documents
//!
//! Pure functions only; the commit coordinator decides what a failure
//! means. Each check reports the violated invariant and the entity
//! involved so a gated commit can be logged precisely.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::models::{AggregatedBundle, ClassifierArtifact, NamesMap, PosLabelSet};

/// The invariants a committed document set must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invariant {
    /// A longform shared between shortforms carries one grounding.
    GroundingAgreement,
    /// The names map keys exactly the non-sentinel labels in use.
    NamesCompleteness,
    /// Positive labels appear in some grounding map.
    PositiveLabelContainment,
    /// The classifier's exposed views match the bundle.
    ClassifierAlignment,
    /// Per-shortform names files shared between bundles agree.
    CrossBundleNameAgreement,
}

impl std::fmt::Display for Invariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invariant::GroundingAgreement => write!(f, "grounding agreement"),
            Invariant::NamesCompleteness => write!(f, "names completeness"),
            Invariant::PositiveLabelContainment => write!(f, "positive-label containment"),
            Invariant::ClassifierAlignment => write!(f, "classifier alignment"),
            Invariant::CrossBundleNameAgreement => write!(f, "cross-bundle name agreement"),
        }
    }
}

/// A failed invariant check, carrying the offending entities.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsistencyError {
    #[error("grounding agreement violated: longform {longform:?} maps to both {first:?} and {second:?}")]
    GroundingConflict {
        longform: String,
        first: String,
        second: String,
    },

    #[error("names completeness violated: missing names for {missing:?}, stale names for {extra:?}")]
    NamesOutOfSync {
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("positive-label containment violated: {labels:?} appear in no grounding map")]
    PosLabelsNotContained { labels: Vec<String> },

    #[error("classifier alignment violated: classifier labels {classifier:?} != bundle labels {bundle:?}")]
    ClassifierLabelsMisaligned {
        classifier: Vec<String>,
        bundle: Vec<String>,
    },

    #[error("classifier alignment violated: classifier shortforms {classifier:?} != bundle shortforms {bundle:?}")]
    ClassifierShortformsMisaligned {
        classifier: Vec<String>,
        bundle: Vec<String>,
    },

    #[error(
        "classifier alignment violated: classifier positive labels {classifier:?} != {expected:?}"
    )]
    ClassifierPosLabelsMisaligned {
        classifier: Vec<String>,
        expected: Vec<String>,
    },

    #[error("cross-bundle name agreement violated: label {label:?} named both {first:?} and {second:?}")]
    NameDisagreement {
        label: String,
        first: String,
        second: String,
    },
}

impl ConsistencyError {
    /// Which invariant the failure belongs to.
    pub fn invariant(&self) -> Invariant {
        match self {
            ConsistencyError::GroundingConflict { .. } => Invariant::GroundingAgreement,
            ConsistencyError::NamesOutOfSync { .. } => Invariant::NamesCompleteness,
            ConsistencyError::PosLabelsNotContained { .. } => Invariant::PositiveLabelContainment,
            ConsistencyError::ClassifierLabelsMisaligned { .. }
            | ConsistencyError::ClassifierShortformsMisaligned { .. }
            | ConsistencyError::ClassifierPosLabelsMisaligned { .. } => {
                Invariant::ClassifierAlignment
            }
            ConsistencyError::NameDisagreement { .. } => Invariant::CrossBundleNameAgreement,
        }
    }
}

/// True iff no key appears with two distinct values across the given
/// mappings. Key presence in only one map is always consistent, as are
/// repeated agreeing writes of the same value. Order-independent.
pub fn merge_consistent<'a, I, M>(maps: I) -> bool
where
    I: IntoIterator<Item = M>,
    M: IntoIterator<Item = (&'a String, &'a String)>,
{
    find_merge_conflict(maps).is_none()
}

/// The offending `(key, value, value)` witness when mappings disagree.
pub fn find_merge_conflict<'a, I, M>(maps: I) -> Option<(String, String, String)>
where
    I: IntoIterator<Item = M>,
    M: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut seen: BTreeMap<&'a str, &'a str> = BTreeMap::new();
    for map in maps {
        for (key, value) in map {
            match seen.get(key.as_str()) {
                Some(prev) if *prev != value.as_str() => {
                    return Some((key.clone(), (*prev).to_string(), value.clone()));
                }
                _ => {
                    seen.insert(key, value);
                }
            }
        }
    }
    None
}

/// Grounding agreement: the same longform must carry the same grounding in
/// every shortform's grounding map within the bundle.
pub fn check_grounding_dict(bundle: &AggregatedBundle) -> Result<(), ConsistencyError> {
    match find_merge_conflict(bundle.grounding_dict.values().map(|gm| gm.iter())) {
        None => Ok(()),
        Some((longform, first, second)) => Err(ConsistencyError::GroundingConflict {
            longform,
            first,
            second,
        }),
    }
}

/// Names completeness: the names map keys equal exactly the non-sentinel
/// labels appearing across the bundle's grounding maps.
pub fn check_names_complete(
    names: &NamesMap,
    bundle: &AggregatedBundle,
) -> Result<(), ConsistencyError> {
    let expected = bundle.grounded_label_set();
    let actual = names.keys();
    if expected == actual {
        return Ok(());
    }
    Err(ConsistencyError::NamesOutOfSync {
        missing: expected.difference(&actual).cloned().collect(),
        extra: actual.difference(&expected).cloned().collect(),
    })
}

/// Positive-label containment: every positive label appears as a value in
/// some grounding map.
pub fn check_pos_labels_contained(
    bundle: &AggregatedBundle,
    pos_labels: &PosLabelSet,
) -> Result<(), ConsistencyError> {
    let groundings = bundle.grounded_label_set();
    let stray: Vec<String> = pos_labels
        .iter()
        .filter(|l| !groundings.contains(*l))
        .cloned()
        .collect();
    if stray.is_empty() {
        Ok(())
    } else {
        Err(ConsistencyError::PosLabelsNotContained { labels: stray })
    }
}

/// Classifier alignment: the classifier's exposed label, shortform, and
/// positive-label views all match the bundle. Three independent equality
/// checks; the first mismatch is reported with both sides.
pub fn check_classifier_aligned(
    classifier: &ClassifierArtifact,
    bundle: &AggregatedBundle,
    pos_labels: &PosLabelSet,
) -> Result<(), ConsistencyError> {
    let bundle_labels = bundle.label_set();
    let classifier_labels = classifier.label_set();
    if classifier_labels != bundle_labels {
        return Err(ConsistencyError::ClassifierLabelsMisaligned {
            classifier: classifier_labels.into_iter().collect(),
            bundle: bundle_labels.into_iter().collect(),
        });
    }

    let bundle_shortforms = bundle.shortforms();
    let classifier_shortforms = classifier.shortform_set();
    if classifier_shortforms != bundle_shortforms {
        return Err(ConsistencyError::ClassifierShortformsMisaligned {
            classifier: classifier_shortforms.into_iter().collect(),
            bundle: bundle_shortforms.into_iter().collect(),
        });
    }

    let expected: BTreeSet<String> = pos_labels.as_set().clone();
    if classifier.pos_labels != expected {
        return Err(ConsistencyError::ClassifierPosLabelsMisaligned {
            classifier: classifier.pos_labels.iter().cloned().collect(),
            expected: expected.into_iter().collect(),
        });
    }

    Ok(())
}

/// Cross-bundle name agreement: shortforms shared between bundles must
/// agree on the display name of every shared label.
pub fn check_names_agreement<'a, I>(names_maps: I) -> Result<(), ConsistencyError>
where
    I: IntoIterator<Item = &'a NamesMap>,
{
    match find_merge_conflict(names_maps.into_iter().map(|nm| nm.iter())) {
        None => Ok(()),
        Some((label, first, second)) => Err(ConsistencyError::NameDisagreement {
            label,
            first,
            second,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroundingMap, UNGROUNDED};

    fn map(pairs: &[(&str, &str)]) -> GroundingMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn merge_consistent_is_order_independent() {
        let d1 = map(&[("a", "1"), ("b", "2")]);
        let d2 = map(&[("a", "1"), ("c", "3")]);
        assert_eq!(
            merge_consistent([d1.iter(), d2.iter()]),
            merge_consistent([d2.iter(), d1.iter()])
        );

        let d3 = map(&[("a", "2")]);
        assert_eq!(
            merge_consistent([d1.iter(), d3.iter()]),
            merge_consistent([d3.iter(), d1.iter()])
        );
    }

    #[test]
    fn merge_consistent_detects_conflicts_only() {
        let d1 = map(&[("a", "1"), ("b", "2")]);
        let d2 = map(&[("a", "1"), ("c", "3")]);
        assert!(merge_consistent([d1.iter(), d2.iter()]));

        let d3 = map(&[("a", "2")]);
        assert!(!merge_consistent([d1.iter(), d3.iter()]));
    }

    #[test]
    fn repeated_agreeing_writes_are_consistent() {
        // Three sources all recording the same value for the same key.
        let d = map(&[("a", "1")]);
        assert!(merge_consistent([d.iter(), d.iter(), d.iter()]));
    }

    fn bundle(shortforms: &[(&str, &[(&str, &str)])]) -> AggregatedBundle {
        AggregatedBundle {
            grounding_dict: shortforms
                .iter()
                .map(|(sf, pairs)| (sf.to_string(), map(pairs)))
                .collect(),
            names: NamesMap::new(),
            pos_labels: PosLabelSet::new(),
        }
    }

    #[test]
    fn grounding_dict_conflict_names_the_longform() {
        let b = bundle(&[
            ("ER", &[("estrogen receptor", "HGNC:3467")]),
            ("ESR", &[("estrogen receptor", "MESH:D011960")]),
        ]);
        match check_grounding_dict(&b) {
            Err(ConsistencyError::GroundingConflict { longform, .. }) => {
                assert_eq!(longform, "estrogen receptor");
            }
            other => panic!("expected GroundingConflict, got {other:?}"),
        }
    }

    #[test]
    fn names_completeness_ignores_sentinel() {
        let b = bundle(&[(
            "ER",
            &[
                ("estrogen receptor", "HGNC:3467"),
                ("emergency room", UNGROUNDED),
            ],
        )]);
        let mut names = NamesMap::new();
        names.insert("HGNC:3467", "ESR1");
        assert!(check_names_complete(&names, &b).is_ok());

        names.insert("MESH:D011960", "Receptors, Estrogen");
        match check_names_complete(&names, &b) {
            Err(ConsistencyError::NamesOutOfSync { extra, missing }) => {
                assert_eq!(extra, vec!["MESH:D011960".to_string()]);
                assert!(missing.is_empty());
            }
            other => panic!("expected NamesOutOfSync, got {other:?}"),
        }
    }

    #[test]
    fn stray_pos_label_is_reported() {
        let b = bundle(&[("ER", &[("estrogen receptor", "HGNC:3467")])]);
        let pos: PosLabelSet = ["HGNC:9999".to_string()].into_iter().collect();
        match check_pos_labels_contained(&b, &pos) {
            Err(ConsistencyError::PosLabelsNotContained { labels }) => {
                assert_eq!(labels, vec!["HGNC:9999".to_string()]);
            }
            other => panic!("expected PosLabelsNotContained, got {other:?}"),
        }
    }

    #[test]
    fn classifier_label_drift_fails_alignment() {
        // Classifier still exposes a label no grounding map carries.
        let b = bundle(&[(
            "ER",
            &[
                ("estrogen receptor", "G1"),
                ("emergency room", UNGROUNDED),
            ],
        )]);
        let classifier = ClassifierArtifact {
            labels: vec!["G1".into(), "G2".into(), UNGROUNDED.into()],
            shortforms: vec!["ER".into()],
            pos_labels: BTreeSet::new(),
            params: serde_json::Value::Null,
        };
        let err = check_classifier_aligned(&classifier, &b, &PosLabelSet::new()).unwrap_err();
        assert_eq!(err.invariant(), Invariant::ClassifierAlignment);
        assert!(matches!(
            err,
            ConsistencyError::ClassifierLabelsMisaligned { .. }
        ));
    }

    #[test]
    fn names_agreement_across_shortforms() {
        let mut a = NamesMap::new();
        a.insert("HGNC:3467", "ESR1");
        let mut b = NamesMap::new();
        b.insert("HGNC:3467", "ESR1");
        b.insert("MESH:D001799", "Blood Sedimentation");
        assert!(check_names_agreement([&a, &b]).is_ok());

        let mut c = NamesMap::new();
        c.insert("HGNC:3467", "estrogen receptor 1");
        match check_names_agreement([&a, &c]) {
            Err(ConsistencyError::NameDisagreement { label, .. }) => {
                assert_eq!(label, "HGNC:3467");
            }
            other => panic!("expected NameDisagreement, got {other:?}"),
        }
    }
}
