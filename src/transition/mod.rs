//! Label rename/merge transitions
//!
//! A `Transition` maps labels as they existed at session start to their
//! edited replacements. It is always keyed off the original label, so a
//! label renamed twice in one session composes into a single entry and the
//! stored documents (which still carry the original labels) can be
//! rewritten in one pass at commit time.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{AggregatedBundle, ClassifierArtifact, NamesMap, PosLabelSet, UNGROUNDED};

/// Errors raised while building or applying a transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("the sentinel label {UNGROUNDED:?} cannot be renamed")]
    SentinelRenamed,

    #[error("cannot rename {from:?} into the sentinel label {UNGROUNDED:?}")]
    RenameToSentinel { from: String },

    #[error("labels merged into {target:?} carry different names {names:?} and no rename supplied a name for the target")]
    MergeNameConflict { target: String, names: Vec<String> },
}

/// Mapping from original grounding label to its replacement.
///
/// Non-injective entries express a merge. The sentinel is a fixed point:
/// it always maps to itself and nothing else may map onto it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Transition {
    map: BTreeMap<String, String>,
    /// Explicit display names supplied alongside a rename, keyed by the
    /// rename's target label. Wins over names inherited from unedited
    /// labels when a merge must pick one.
    merge_names: BTreeMap<String, String>,
}

impl Transition {
    /// The identity transition over the given session-start labels.
    pub fn identity<I>(labels: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut map: BTreeMap<String, String> =
            labels.into_iter().map(|l| (l.clone(), l)).collect();
        map.insert(UNGROUNDED.to_string(), UNGROUNDED.to_string());
        Self {
            map,
            merge_names: BTreeMap::new(),
        }
    }

    /// Where a session-start label points now.
    pub fn resolve(&self, label: &str) -> String {
        self.map
            .get(label)
            .cloned()
            .unwrap_or_else(|| label.to_string())
    }

    /// Record a rename of `original` (the label as it existed at session
    /// start) to `new_label`, with an optional explicit display name for
    /// the target.
    pub fn rename(
        &mut self,
        original: &str,
        new_label: &str,
        explicit_name: Option<&str>,
    ) -> Result<(), TransitionError> {
        if original == UNGROUNDED {
            return Err(TransitionError::SentinelRenamed);
        }
        if new_label == UNGROUNDED {
            return Err(TransitionError::RenameToSentinel {
                from: original.to_string(),
            });
        }
        self.map
            .insert(original.to_string(), new_label.to_string());
        if let Some(name) = explicit_name {
            self.merge_names.insert(new_label.to_string(), name.to_string());
        }
        Ok(())
    }

    /// Session-start labels currently resolving to `current`. More than
    /// one means a merge.
    pub fn originals_of(&self, current: &str) -> Vec<String> {
        self.map
            .iter()
            .filter(|(_, new)| new.as_str() == current)
            .map(|(old, _)| old.clone())
            .collect()
    }

    /// Name supplied by the last explicit rename onto `target`, if any.
    pub fn explicit_name(&self, target: &str) -> Option<&str> {
        self.merge_names.get(target).map(String::as_str)
    }

    pub fn is_identity(&self) -> bool {
        self.map.iter().all(|(old, new)| old == new)
    }

    /// The non-trivial entries, old label first.
    pub fn renames(&self) -> impl Iterator<Item = (&String, &String)> {
        self.map.iter().filter(|(old, new)| old != new)
    }

    /// Rewrite a names map keyed by session-start labels into the new
    /// label space.
    ///
    /// When several old labels merge onto one target the engine never
    /// silently picks a survivor: an explicit rename-supplied name wins;
    /// failing that, sources that already agree keep their shared name and
    /// anything else is a [`TransitionError::MergeNameConflict`].
    pub fn rekey_names(&self, names: &NamesMap) -> Result<NamesMap, TransitionError> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (label, name) in names.iter() {
            grouped
                .entry(self.resolve(label))
                .or_default()
                .push(name.clone());
        }

        let mut rekeyed = NamesMap::new();
        for (target, mut candidates) in grouped {
            if let Some(explicit) = self.explicit_name(&target) {
                rekeyed.insert(target, explicit);
                continue;
            }
            candidates.sort();
            candidates.dedup();
            match candidates.as_slice() {
                [single] => rekeyed.insert(target, single.clone()),
                _ => {
                    return Err(TransitionError::MergeNameConflict {
                        target,
                        names: candidates,
                    })
                }
            }
        }
        Ok(rekeyed)
    }

    /// Apply the transition to a bundle and its classifier artifact.
    ///
    /// Grounding-map values and the positive-label set are rewritten
    /// through the mapping (the latter deduplicates on merge), the names
    /// map is rekeyed with merge-conflict detection, and the classifier's
    /// positional label array is rewritten element-wise. Classifier
    /// internals are untouched: coefficients stay keyed by position.
    pub fn apply(
        &self,
        bundle: &AggregatedBundle,
        classifier: &ClassifierArtifact,
    ) -> Result<(AggregatedBundle, ClassifierArtifact), TransitionError> {
        let grounding_dict = bundle
            .grounding_dict
            .iter()
            .map(|(sf, gm)| (sf.clone(), gm.map_labels(|l| self.resolve(l))))
            .collect();

        let pos_labels: PosLabelSet = bundle
            .pos_labels
            .iter()
            .map(|l| self.resolve(l))
            .collect();

        let names = self.rekey_names(&bundle.names)?;

        let new_bundle = AggregatedBundle {
            grounding_dict,
            names,
            pos_labels: pos_labels.clone(),
        };

        let new_classifier = ClassifierArtifact {
            labels: classifier.labels.iter().map(|l| self.resolve(l)).collect(),
            shortforms: classifier.shortforms.clone(),
            pos_labels: classifier.pos_labels.iter().map(|l| self.resolve(l)).collect(),
            params: classifier.params.clone(),
        };

        Ok((new_bundle, new_classifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GroundingMap;
    use std::collections::BTreeSet;

    fn sample_bundle() -> (AggregatedBundle, ClassifierArtifact) {
        let mut gm = GroundingMap::new();
        gm.insert("lf1", "G1");
        gm.insert("lf2", "G2");
        let mut names = NamesMap::new();
        names.insert("G1", "n1");
        names.insert("G2", "n2");
        let bundle = AggregatedBundle {
            grounding_dict: [("SF".to_string(), gm)].into_iter().collect(),
            names,
            pos_labels: ["G1".to_string()].into_iter().collect(),
        };
        let classifier = ClassifierArtifact {
            labels: vec!["G1".into(), "G2".into(), UNGROUNDED.into()],
            shortforms: vec!["SF".into()],
            pos_labels: ["G1".to_string()].into_iter().collect::<BTreeSet<_>>(),
            params: serde_json::json!({"coef": [0.1, 0.2, 0.7]}),
        };
        (bundle, classifier)
    }

    #[test]
    fn sentinel_is_a_fixed_point() {
        let t = Transition::identity(["G1".to_string()]);
        assert_eq!(t.resolve(UNGROUNDED), UNGROUNDED);

        let mut t = t;
        assert_eq!(
            t.rename(UNGROUNDED, "G2", None),
            Err(TransitionError::SentinelRenamed)
        );
        assert_eq!(
            t.rename("G1", UNGROUNDED, None),
            Err(TransitionError::RenameToSentinel {
                from: "G1".to_string()
            })
        );
        // No entry maps onto the sentinel from elsewhere.
        assert!(t.renames().all(|(_, new)| new.as_str() != UNGROUNDED));
    }

    #[test]
    fn identity_application_is_a_no_op() {
        let (bundle, classifier) = sample_bundle();
        let t = Transition::identity(bundle.grounded_label_set());
        let (new_bundle, new_classifier) = t.apply(&bundle, &classifier).unwrap();
        assert_eq!(new_bundle, bundle);
        assert_eq!(new_classifier, classifier);
    }

    #[test]
    fn rename_rekeys_names_and_preserves_positions() {
        let (bundle, classifier) = sample_bundle();
        let mut t = Transition::identity(bundle.grounded_label_set());
        t.rename("G2", "G3", None).unwrap();

        let (new_bundle, new_classifier) = t.apply(&bundle, &classifier).unwrap();
        assert_eq!(new_bundle.names.get("G1"), Some("n1"));
        assert_eq!(new_bundle.names.get("G3"), Some("n2"));
        assert_eq!(new_bundle.names.get("G2"), None);
        // Positional label array rewritten in place, params untouched.
        assert_eq!(
            new_classifier.labels,
            vec!["G1".to_string(), "G3".to_string(), UNGROUNDED.to_string()]
        );
        assert_eq!(new_classifier.params, classifier.params);
    }

    #[test]
    fn chained_renames_stay_keyed_to_the_original_label() {
        let (bundle, classifier) = sample_bundle();
        let mut t = Transition::identity(bundle.grounded_label_set());
        t.rename("G2", "G3", None).unwrap();
        t.rename("G2", "G4", None).unwrap();

        // One entry, original to latest; G3 never leaks into the result.
        assert_eq!(t.resolve("G2"), "G4");
        let (new_bundle, _) = t.apply(&bundle, &classifier).unwrap();
        assert!(!new_bundle.grounded_label_set().contains("G3"));
        assert!(new_bundle.grounded_label_set().contains("G4"));
    }

    #[test]
    fn merge_without_a_name_is_a_conflict() {
        let (bundle, classifier) = sample_bundle();
        let mut t = Transition::identity(bundle.grounded_label_set());
        t.rename("G2", "G1", None).unwrap();

        match t.apply(&bundle, &classifier) {
            Err(TransitionError::MergeNameConflict { target, names }) => {
                assert_eq!(target, "G1");
                assert_eq!(names, vec!["n1".to_string(), "n2".to_string()]);
            }
            other => panic!("expected MergeNameConflict, got {other:?}"),
        }
    }

    #[test]
    fn explicit_rename_name_resolves_a_merge() {
        let (bundle, classifier) = sample_bundle();
        let mut t = Transition::identity(bundle.grounded_label_set());
        t.rename("G2", "G1", Some("merged name")).unwrap();

        let (new_bundle, _) = t.apply(&bundle, &classifier).unwrap();
        assert_eq!(new_bundle.names.get("G1"), Some("merged name"));
        assert_eq!(new_bundle.names.len(), 1);
        // Positive labels deduplicate under the merge.
        assert_eq!(new_bundle.pos_labels.len(), 1);
        assert!(new_bundle.pos_labels.contains("G1"));
    }

    #[test]
    fn agreeing_merged_names_are_not_a_conflict() {
        let mut names = NamesMap::new();
        names.insert("G1", "shared");
        names.insert("G2", "shared");
        let mut t = Transition::identity(["G1".to_string(), "G2".to_string()]);
        t.rename("G2", "G1", None).unwrap();

        let rekeyed = t.rekey_names(&names).unwrap();
        assert_eq!(rekeyed.get("G1"), Some("shared"));
    }
}
