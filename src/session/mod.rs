//! Fix-session state machine and commit coordinator
//!
//! A fix session loads an aggregated model bundle, accepts rename/merge
//! edits and positive-label toggles entirely in memory, and commits by
//! validating every invariant over the transitioned documents before a
//! single byte is written. The store has no native transaction, so the
//! coordinator buffers all output documents and flushes them only after
//! every check passes; a crash mid-flush can leave a partially updated
//! store, which is the one known gap in the all-or-nothing story.

use std::collections::BTreeMap;

use tracing::{error, info};

use crate::consistency::{
    check_classifier_aligned, check_grounding_dict, check_names_agreement, check_names_complete,
    check_pos_labels_contained, ConsistencyError,
};
use crate::models::{AggregatedBundle, ClassifierArtifact, NamesMap, PosLabelSet, UNGROUNDED};
use crate::store::{GroundingStore, StoreError};
use crate::transition::{Transition, TransitionError};

/// Lifecycle of a fix session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Loaded,
    Editing,
    Committed,
    Aborted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Loaded => write!(f, "loaded"),
            SessionState::Editing => write!(f, "editing"),
            SessionState::Committed => write!(f, "committed"),
            SessionState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Session and commit errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is {state}, cannot {action}")]
    WrongState {
        state: SessionState,
        action: &'static str,
    },

    #[error("no grounding labeled {0:?} in this session")]
    UnknownLabel(String),

    #[error("the sentinel label {UNGROUNDED:?} cannot carry a display name")]
    SentinelNamed,

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Inconsistent(#[from] ConsistencyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Merge-name conflicts gate a commit like any inconsistency but are
    /// surfaced distinctly so a caller can prompt for a resolving name.
    pub fn is_merge_name_conflict(&self) -> bool {
        matches!(
            self,
            SessionError::Transition(TransitionError::MergeNameConflict { .. })
        )
    }
}

/// Record of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub session_id: uuid::Uuid,
    pub model: String,
    pub committed_at: i64,
    /// Non-trivial label renames applied, old label first.
    pub renames: Vec<(String, String)>,
    pub documents_written: usize,
}

/// Everything a commit will write, fully built and validated in memory.
struct CommitOutputs {
    bundle: AggregatedBundle,
    classifier: ClassifierArtifact,
    shortform_names: BTreeMap<String, NamesMap>,
    shortform_pos: BTreeMap<String, PosLabelSet>,
}

/// One user's in-progress fix of an aggregated model.
pub struct FixSession<'a> {
    store: &'a GroundingStore,
    id: uuid::Uuid,
    model: String,
    bundle: AggregatedBundle,
    classifier: ClassifierArtifact,
    transition: Transition,
    /// Display-name edits, keyed by session-start label.
    working_names: NamesMap,
    /// Positive labels in the current (already-transitioned) label space.
    working_pos: PosLabelSet,
    /// Representative longform per session-start label, display hint only.
    top_longforms: BTreeMap<String, String>,
    state: SessionState,
}

impl<'a> FixSession<'a> {
    /// Load the aggregated bundle and classifier for `model` and start a
    /// session with the identity transition.
    pub fn load(store: &'a GroundingStore, model: &str) -> Result<Self, SessionError> {
        let bundle = store.read_bundle(model)?;
        let classifier = store.read_classifier(model)?;
        let transition = Transition::identity(bundle.grounded_label_set());
        let top_longforms = representative_longforms(store, &bundle)?;

        let session = Self {
            store,
            id: uuid::Uuid::new_v4(),
            model: model.to_string(),
            working_names: bundle.names.clone(),
            working_pos: bundle.pos_labels.clone(),
            bundle,
            classifier,
            transition,
            top_longforms,
            state: SessionState::Loaded,
        };
        info!(
            session = %session.id,
            model,
            shortforms = session.bundle.grounding_dict.len(),
            labels = session.bundle.grounded_label_set().len(),
            "fix session loaded"
        );
        Ok(session)
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Grounded labels as the session currently displays them.
    pub fn current_labels(&self) -> Vec<String> {
        self.bundle
            .grounded_label_set()
            .iter()
            .map(|l| self.transition.resolve(l))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Representative longform per current label: the highest-scoring
    /// longform (by training-time mining score) still mapped to the label.
    pub fn representative_longforms(&self) -> BTreeMap<String, String> {
        self.top_longforms
            .iter()
            .map(|(label, lf)| (self.transition.resolve(label), lf.clone()))
            .collect()
    }

    fn ensure_editable(&mut self, action: &'static str) -> Result<(), SessionError> {
        match self.state {
            SessionState::Loaded | SessionState::Editing => {
                self.state = SessionState::Editing;
                Ok(())
            }
            state => Err(SessionError::WrongState { state, action }),
        }
    }

    /// Session-start labels behind a displayed label.
    fn originals_of(&self, current: &str) -> Result<Vec<String>, SessionError> {
        let originals = self.transition.originals_of(current);
        if originals.is_empty() {
            return Err(SessionError::UnknownLabel(current.to_string()));
        }
        Ok(originals)
    }

    /// Rename the displayed label `current` to `new_label`, optionally
    /// supplying a display name for the target. The edit composes into the
    /// transition keyed by the session-start label, so renaming twice never
    /// loses the path back to the stored documents.
    pub fn rename(
        &mut self,
        current: &str,
        new_label: &str,
        new_name: Option<&str>,
    ) -> Result<(), SessionError> {
        self.ensure_editable("rename")?;
        if current == UNGROUNDED {
            return Err(TransitionError::SentinelRenamed.into());
        }
        for original in self.originals_of(current)? {
            self.transition.rename(&original, new_label, new_name)?;
        }
        // Positive membership follows the label under its new spelling.
        if self.working_pos.contains(current) {
            self.working_pos.toggle(current);
            self.working_pos.insert(new_label);
        }
        Ok(())
    }

    /// Set the display name of the displayed label `current` without
    /// renaming it.
    pub fn set_name(&mut self, current: &str, name: &str) -> Result<(), SessionError> {
        self.ensure_editable("set a name")?;
        if current == UNGROUNDED {
            return Err(SessionError::SentinelNamed);
        }
        let originals = self.originals_of(current)?;
        for original in &originals {
            self.working_names.insert(original.clone(), name);
        }
        if originals.len() > 1 {
            // The label is already a merge target; the explicit name
            // resolves any pending conflict for it.
            self.transition.rename(&originals[0], current, Some(name))?;
        }
        Ok(())
    }

    /// Toggle positive membership of a displayed label. Independent of the
    /// transition: operates on the current label set.
    pub fn toggle_positive(&mut self, current: &str) -> Result<(), SessionError> {
        self.ensure_editable("toggle a positive label")?;
        let known = self
            .bundle
            .grounded_label_set()
            .iter()
            .any(|l| self.transition.resolve(l) == current);
        if !known {
            return Err(SessionError::UnknownLabel(current.to_string()));
        }
        self.working_pos.toggle(current);
        Ok(())
    }

    /// Resume editing after an aborted commit; the prior committed state is
    /// untouched and the session's edits are still in place.
    pub fn resume_editing(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Aborted => {
                self.state = SessionState::Editing;
                Ok(())
            }
            state => Err(SessionError::WrongState {
                state,
                action: "resume editing",
            }),
        }
    }

    /// Run the full validation pipeline without writing anything.
    pub fn validate(&self) -> Result<(), SessionError> {
        self.validated_outputs().map(|_| ())
    }

    /// Build every output document in memory and check, in order:
    /// grounding agreement, positive-label containment, names
    /// completeness, classifier alignment, then cross-bundle name
    /// agreement over the per-shortform names files a commit would
    /// overwrite.
    fn validated_outputs(&self) -> Result<CommitOutputs, SessionError> {
        let mut working = self.bundle.clone();
        working.names = self.working_names.clone();

        let (mut bundle, mut classifier) = self.transition.apply(&working, &self.classifier)?;

        // Positive toggles live in the current label space and supersede
        // the transitioned stored set; the classifier's exposed view must
        // follow for the alignment check to mean anything.
        bundle.pos_labels = self.working_pos.clone();
        classifier.pos_labels = self.working_pos.as_set().clone();

        check_grounding_dict(&bundle)?;
        check_pos_labels_contained(&bundle, &bundle.pos_labels)?;
        check_names_complete(&bundle.names, &bundle)?;
        check_classifier_aligned(&classifier, &bundle, &bundle.pos_labels)?;

        let mut shortform_names = BTreeMap::new();
        let mut shortform_pos = BTreeMap::new();
        for (shortform, grounding_map) in &bundle.grounding_dict {
            let stored = self.store.read_names(shortform)?;
            // Session name edits propagate into the pre-aggregation files,
            // keyed by the same session-start labels.
            let edited: NamesMap = stored
                .iter()
                .map(|(label, name)| {
                    let name = self.working_names.get(label).unwrap_or(name.as_str());
                    (label.clone(), name.to_string())
                })
                .collect();
            let rekeyed = self.transition.rekey_names(&edited)?;

            let mut pos = bundle.pos_labels.clone();
            pos.retain_within(&grounding_map.grounded_labels());

            shortform_names.insert(shortform.clone(), rekeyed);
            shortform_pos.insert(shortform.clone(), pos);
        }
        check_names_agreement(shortform_names.values())?;

        Ok(CommitOutputs {
            bundle,
            classifier,
            shortform_names,
            shortform_pos,
        })
    }

    /// Validate fully, then replace the whole document set: per-shortform
    /// documents first, then the bundle's own copies, then the classifier
    /// with its rewritten label array. Any failure before the flush leaves
    /// the store untouched and the session aborted-but-resumable.
    pub fn commit(&mut self) -> Result<CommitReceipt, SessionError> {
        match self.state {
            SessionState::Loaded | SessionState::Editing => {}
            state => {
                return Err(SessionError::WrongState {
                    state,
                    action: "commit",
                })
            }
        }

        let _lock = self.store.lock_model(&self.model)?;

        let outputs = match self.validated_outputs() {
            Ok(outputs) => outputs,
            Err(e) => {
                error!(
                    session = %self.id,
                    model = %self.model,
                    error = %e,
                    "commit aborted, no documents written"
                );
                self.state = SessionState::Aborted;
                return Err(e);
            }
        };

        let mut staged = self.store.begin_staged();
        for (shortform, grounding_map) in &outputs.bundle.grounding_dict {
            staged.stage_shortform(
                shortform,
                grounding_map,
                &outputs.shortform_names[shortform],
                &outputs.shortform_pos[shortform],
            )?;
        }
        staged.stage_bundle(&self.model, &outputs.bundle)?;
        staged.stage_classifier(&self.model, &outputs.classifier)?;

        let documents_written = staged.staged_len();
        staged.flush()?;

        let receipt = CommitReceipt {
            session_id: self.id,
            model: self.model.clone(),
            committed_at: chrono::Utc::now().timestamp(),
            renames: self
                .transition
                .renames()
                .map(|(old, new)| (old.clone(), new.clone()))
                .collect(),
            documents_written,
        };
        info!(
            session = %self.id,
            model = %self.model,
            renames = receipt.renames.len(),
            documents = documents_written,
            "commit complete"
        );
        self.state = SessionState::Committed;
        Ok(receipt)
    }
}

/// Sum mining scores per longform across the bundle's shortforms and pick
/// the highest-scoring longform for each non-sentinel label. Missing
/// longforms documents degrade to zero scores; the hint is read-only.
fn representative_longforms(
    store: &GroundingStore,
    bundle: &AggregatedBundle,
) -> Result<BTreeMap<String, String>, SessionError> {
    let mut scores: BTreeMap<String, f64> = BTreeMap::new();
    for shortform in bundle.grounding_dict.keys() {
        match store.read_longforms(shortform) {
            Ok(longforms) => {
                for (longform, score) in longforms.iter() {
                    *scores.entry(longform.clone()).or_default() += score;
                }
            }
            Err(StoreError::MissingDocument { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for grounding_map in bundle.grounding_dict.values() {
        for (longform, label) in grounding_map.iter() {
            if label != UNGROUNDED {
                grouped.entry(label.clone()).or_default().push(longform.clone());
            }
        }
    }

    Ok(grouped
        .into_iter()
        .filter_map(|(label, longforms)| {
            longforms
                .into_iter()
                .max_by(|a, b| {
                    let sa = scores.get(a).copied().unwrap_or(0.0);
                    let sb = scores.get(b).copied().unwrap_or(0.0);
                    sa.total_cmp(&sb)
                })
                .map(|top| (label, top))
        })
        .collect())
}
