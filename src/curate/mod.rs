//! Curation sessions producing per-shortform documents
//!
//! A curation session walks the mined candidate longforms for one
//! shortform, collects (name, grounding) decisions, and finalizes them
//! into the per-shortform document set that training later aggregates.
//! All state is held in the session value; nothing persists until
//! `finalize`.

use anyhow::{Context, Result};

use crate::models::{GroundingMap, NamesMap, PosLabelSet, UNGROUNDED};
use crate::store::{GroundingStore, StoreError};

/// A grounding suggestion for one longform phrase.
///
/// Produced by an external suggestion service; either field may be absent
/// when the service finds nothing usable. Implementations are responsible
/// for their own caching (by exact input text) if lookups are expensive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Suggestion {
    pub name: Option<String>,
    pub grounding: Option<String>,
}

/// External grounding-suggestion service.
pub trait GroundingSuggester {
    fn suggest(&mut self, longform: &str) -> Result<Suggestion>;
}

/// Namespaces whose labels start out as positive training classes.
const POSITIVE_NAMESPACES: [&str; 2] = ["HGNC:", "FPLX:"];

/// One candidate longform under curation. An empty grounding means
/// "ungrounded so far" and becomes the sentinel at finalize time.
#[derive(Debug, Clone)]
pub struct CurationRow {
    pub longform: String,
    pub score: f64,
    pub name: String,
    pub grounding: String,
}

/// In-memory curation state for one shortform.
pub struct CurationSession {
    shortform: String,
    rows: Vec<CurationRow>,
    pos_labels: PosLabelSet,
}

impl CurationSession {
    /// Start a session from the mined longforms for `shortform`.
    ///
    /// Prefers the previously finalized documents when the store has them;
    /// falls back to querying the suggester for every candidate above the
    /// score cutoff when it reports them missing. The cutoff gates fresh
    /// suggestions only: a resumed session sees every mined longform, so
    /// re-finalizing cannot drop rows curated under a lower cutoff.
    pub fn start(
        store: &GroundingStore,
        shortform: &str,
        score_cutoff: f64,
        suggester: Option<&mut dyn GroundingSuggester>,
    ) -> Result<Self> {
        let mined = store
            .read_longforms(shortform)
            .with_context(|| format!("no mined longforms for {shortform:?}"))?;

        match store.read_grounding_map(shortform) {
            Ok(grounding_map) => {
                let candidates = mined.iter().cloned().collect();
                Self::from_stored(store, shortform, candidates, &grounding_map)
            }
            Err(StoreError::MissingDocument { .. }) => {
                let candidates: Vec<(String, f64)> = mined
                    .iter()
                    .filter(|(_, score)| *score > score_cutoff)
                    .cloned()
                    .collect();
                match suggester {
                    Some(suggester) => Self::from_suggestions(shortform, candidates, suggester),
                    None => Ok(Self::blank(shortform, candidates)),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn from_stored(
        store: &GroundingStore,
        shortform: &str,
        candidates: Vec<(String, f64)>,
        grounding_map: &GroundingMap,
    ) -> Result<Self> {
        let names = store.read_names(shortform)?;
        let pos_labels = store.read_pos_labels(shortform)?;
        let rows = candidates
            .into_iter()
            .map(|(longform, score)| {
                let grounding = match grounding_map.get(&longform) {
                    Some(UNGROUNDED) | None => String::new(),
                    Some(label) => label.to_string(),
                };
                let name = names.get(&grounding).unwrap_or("").to_string();
                CurationRow {
                    longform,
                    score,
                    name,
                    grounding,
                }
            })
            .collect();
        let mut session = Self {
            shortform: shortform.to_string(),
            rows,
            pos_labels,
        };
        // Stored positives may outlive their groundings (a mined-longforms
        // refresh can drop a row); finalize must never write a positive
        // label its own grounding map lacks.
        session.retain_pos_within_groundings();
        Ok(session)
    }

    fn from_suggestions(
        shortform: &str,
        candidates: Vec<(String, f64)>,
        suggester: &mut dyn GroundingSuggester,
    ) -> Result<Self> {
        let mut rows = Vec::with_capacity(candidates.len());
        for (longform, score) in candidates {
            let suggestion = suggester
                .suggest(&longform)
                .with_context(|| format!("suggestion lookup failed for {longform:?}"))?;
            rows.push(CurationRow {
                longform,
                score,
                name: suggestion.name.unwrap_or_default(),
                grounding: suggestion.grounding.unwrap_or_default(),
            });
        }
        let pos_labels = rows
            .iter()
            .map(|r| r.grounding.as_str())
            .filter(|g| POSITIVE_NAMESPACES.iter().any(|ns| g.starts_with(ns)))
            .map(String::from)
            .collect();
        Ok(Self {
            shortform: shortform.to_string(),
            rows,
            pos_labels,
        })
    }

    fn blank(shortform: &str, candidates: Vec<(String, f64)>) -> Self {
        Self {
            shortform: shortform.to_string(),
            rows: candidates
                .into_iter()
                .map(|(longform, score)| CurationRow {
                    longform,
                    score,
                    name: String::new(),
                    grounding: String::new(),
                })
                .collect(),
            pos_labels: PosLabelSet::new(),
        }
    }

    pub fn shortform(&self) -> &str {
        &self.shortform
    }

    pub fn rows(&self) -> &[CurationRow] {
        &self.rows
    }

    pub fn pos_labels(&self) -> &PosLabelSet {
        &self.pos_labels
    }

    /// Assign a (name, grounding) pair to a selection of rows.
    pub fn assign(&mut self, indices: &[usize], name: &str, grounding: &str) -> Result<()> {
        if name.trim().is_empty() || grounding.trim().is_empty() {
            anyhow::bail!("both a name and a grounding are required");
        }
        for &index in indices {
            let row = self
                .rows
                .get_mut(index)
                .with_context(|| format!("no curation row at index {index}"))?;
            row.name = name.trim().to_string();
            row.grounding = grounding.trim().to_string();
        }
        self.retain_pos_within_groundings();
        Ok(())
    }

    /// Clear one row's grounding; it finalizes as the sentinel.
    pub fn delete(&mut self, index: usize) -> Result<()> {
        let row = self
            .rows
            .get_mut(index)
            .with_context(|| format!("no curation row at index {index}"))?;
        row.name.clear();
        row.grounding.clear();
        self.retain_pos_within_groundings();
        Ok(())
    }

    /// Toggle positive membership of a label.
    pub fn toggle_positive(&mut self, label: &str) {
        self.pos_labels.toggle(label);
    }

    // Positive labels can only refer to groundings still assigned to a row.
    fn retain_pos_within_groundings(&mut self) {
        let surviving = self
            .rows
            .iter()
            .filter(|r| !r.grounding.is_empty())
            .map(|r| r.grounding.clone())
            .collect();
        self.pos_labels.retain_within(&surviving);
    }

    /// Write the finalized per-shortform document set through the store.
    pub fn finalize(&self, store: &GroundingStore) -> Result<()> {
        let grounding_map: GroundingMap = self
            .rows
            .iter()
            .map(|r| {
                let label = if r.grounding.is_empty() {
                    UNGROUNDED.to_string()
                } else {
                    r.grounding.clone()
                };
                (r.longform.clone(), label)
            })
            .collect();
        let names: NamesMap = self
            .rows
            .iter()
            .filter(|r| !r.grounding.is_empty() && !r.name.is_empty())
            .map(|r| (r.grounding.clone(), r.name.clone()))
            .collect();

        store
            .write_shortform_docs(&self.shortform, &grounding_map, &names, &self.pos_labels)
            .with_context(|| format!("failed to finalize curation for {:?}", self.shortform))
    }
}
