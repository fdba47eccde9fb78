//! Grounding document store
//!
//! Read/write access to the per-shortform and per-model JSON documents.
//! No business logic lives here: the store validates identifiers, maps
//! them onto the filesystem key-space, and gives the commit coordinator a
//! staging buffer it can flush atomically (tmp file + rename per document).

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::GroundfixPaths;
use crate::models::{
    AggregatedBundle, ClassifierArtifact, GroundingMap, NamesMap, PosLabelSet, ScoredLongforms,
};

/// Document kinds the store knows about, used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    Longforms,
    GroundingMap,
    Names,
    PosLabels,
    GroundingDict,
    Classifier,
}

impl std::fmt::Display for DocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocKind::Longforms => write!(f, "longforms"),
            DocKind::GroundingMap => write!(f, "grounding_map"),
            DocKind::Names => write!(f, "names"),
            DocKind::PosLabels => write!(f, "pos_labels"),
            DocKind::GroundingDict => write!(f, "grounding_dict"),
            DocKind::Classifier => write!(f, "model"),
        }
    }
}

/// Store-level errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no stored {kind} document for {id:?}")]
    MissingDocument { kind: DocKind, id: String },

    #[error("invalid identifier {id:?}: {reason}")]
    InvalidIdentifier { id: String, reason: String },

    #[error("another commit holds the lock for model {model:?}")]
    Locked { model: String },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed document at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Validate an identifier destined for the storage key-space.
///
/// Shortforms, model names, and grounding labels all pass through here
/// before any document mutation. The key-space excludes path separators,
/// control characters, and dot-prefixed names.
pub fn validate_identifier(id: &str) -> Result<(), StoreError> {
    let reject = |reason: &str| {
        Err(StoreError::InvalidIdentifier {
            id: id.to_string(),
            reason: reason.to_string(),
        })
    };
    if id.is_empty() {
        return reject("empty identifier");
    }
    if id.starts_with('.') {
        return reject("leading dot");
    }
    let valid = regex::Regex::new(r"^[^/\\\x00-\x1f]+$").unwrap();
    if !valid.is_match(id) {
        return reject("contains a path separator or control character");
    }
    Ok(())
}

/// Escape an identifier into a filename safe for case-insensitive
/// filesystems. Lowercase letters and filename-hostile punctuation get an
/// `_` escape so `"ER"` and `"er"` never collide.
pub fn escape_filename(id: &str) -> String {
    let mut out = String::with_capacity(id.len() * 2);
    for c in id.chars() {
        match c {
            '?' => out.push_str("_2"),
            '%' => out.push_str("_3"),
            '*' => out.push_str("_4"),
            ':' => out.push_str("_5"),
            '|' => out.push_str("_6"),
            '"' => out.push_str("_7"),
            '<' => out.push_str("_8"),
            '>' => out.push_str("_9"),
            '.' => out.push_str("_,"),
            '_' => out.push_str("__"),
            c if c.is_lowercase() => {
                out.push('_');
                out.extend(c.to_uppercase());
            }
            c => out.push(c),
        }
    }
    out
}

/// Invert [`escape_filename`]. Unknown escape sequences are passed through
/// untouched rather than rejected; listing should never fail on a stray
/// file.
pub fn unescape_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != '_' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('2') => out.push('?'),
            Some('3') => out.push('%'),
            Some('4') => out.push('*'),
            Some('5') => out.push(':'),
            Some('6') => out.push('|'),
            Some('7') => out.push('"'),
            Some('8') => out.push('<'),
            Some('9') => out.push('>'),
            Some(',') => out.push('.'),
            Some('_') => out.push('_'),
            Some(c) if c.is_uppercase() => out.extend(c.to_lowercase()),
            Some(c) => {
                out.push('_');
                out.push(c);
            }
            None => out.push('_'),
        }
    }
    out
}

/// Handle to the on-disk document tree.
pub struct GroundingStore {
    longforms_dir: PathBuf,
    groundings_dir: PathBuf,
    models_dir: PathBuf,
}

impl GroundingStore {
    pub fn open(paths: &GroundfixPaths) -> Self {
        Self {
            longforms_dir: paths.longforms.clone(),
            groundings_dir: paths.groundings.clone(),
            models_dir: paths.models.clone(),
        }
    }

    fn shortform_dir(&self, shortform: &str) -> PathBuf {
        self.groundings_dir.join(escape_filename(shortform))
    }

    fn model_dir(&self, model: &str) -> PathBuf {
        self.models_dir.join(escape_filename(model))
    }

    fn longforms_path(&self, shortform: &str) -> PathBuf {
        self.longforms_dir
            .join(format!("{}.json", escape_filename(shortform)))
    }

    fn shortform_doc(&self, shortform: &str, kind: DocKind) -> PathBuf {
        self.shortform_dir(shortform).join(format!("{kind}.json"))
    }

    fn model_doc(&self, model: &str, kind: DocKind) -> PathBuf {
        self.model_dir(model).join(format!("{kind}.json"))
    }

    /// Mined longform scores for one shortform.
    pub fn read_longforms(&self, shortform: &str) -> Result<ScoredLongforms, StoreError> {
        validate_identifier(shortform)?;
        let path = self.longforms_path(shortform);
        read_json(&path)?.ok_or_else(|| StoreError::MissingDocument {
            kind: DocKind::Longforms,
            id: shortform.to_string(),
        })
    }

    pub fn write_longforms(
        &self,
        shortform: &str,
        longforms: &ScoredLongforms,
    ) -> Result<(), StoreError> {
        validate_identifier(shortform)?;
        write_json(&self.longforms_path(shortform), longforms)
    }

    pub fn read_grounding_map(&self, shortform: &str) -> Result<GroundingMap, StoreError> {
        validate_identifier(shortform)?;
        let path = self.shortform_doc(shortform, DocKind::GroundingMap);
        read_json(&path)?.ok_or_else(|| StoreError::MissingDocument {
            kind: DocKind::GroundingMap,
            id: shortform.to_string(),
        })
    }

    pub fn read_names(&self, shortform: &str) -> Result<NamesMap, StoreError> {
        validate_identifier(shortform)?;
        let path = self.shortform_doc(shortform, DocKind::Names);
        read_json(&path)?.ok_or_else(|| StoreError::MissingDocument {
            kind: DocKind::Names,
            id: shortform.to_string(),
        })
    }

    pub fn read_pos_labels(&self, shortform: &str) -> Result<PosLabelSet, StoreError> {
        validate_identifier(shortform)?;
        let path = self.shortform_doc(shortform, DocKind::PosLabels);
        read_json(&path)?.ok_or_else(|| StoreError::MissingDocument {
            kind: DocKind::PosLabels,
            id: shortform.to_string(),
        })
    }

    /// Write a finalized per-shortform document set. Used when a curation
    /// session finalizes; commits of an aggregated model go through
    /// [`GroundingStore::begin_staged`] instead.
    pub fn write_shortform_docs(
        &self,
        shortform: &str,
        grounding_map: &GroundingMap,
        names: &NamesMap,
        pos_labels: &PosLabelSet,
    ) -> Result<(), StoreError> {
        validate_shortform_docs(shortform, grounding_map, names, pos_labels)?;
        let mut staged = self.begin_staged();
        staged.stage_shortform(shortform, grounding_map, names, pos_labels)?;
        staged.flush()
    }

    /// The aggregated per-model document set (grounding dict, names,
    /// positive labels).
    pub fn read_bundle(&self, model: &str) -> Result<AggregatedBundle, StoreError> {
        validate_identifier(model)?;
        let missing = |kind| StoreError::MissingDocument {
            kind,
            id: model.to_string(),
        };
        let grounding_dict = read_json(&self.model_doc(model, DocKind::GroundingDict))?
            .ok_or_else(|| missing(DocKind::GroundingDict))?;
        let names =
            read_json(&self.model_doc(model, DocKind::Names))?.ok_or_else(|| missing(DocKind::Names))?;
        let pos_labels = read_json(&self.model_doc(model, DocKind::PosLabels))?
            .ok_or_else(|| missing(DocKind::PosLabels))?;
        Ok(AggregatedBundle {
            grounding_dict,
            names,
            pos_labels,
        })
    }

    pub fn read_classifier(&self, model: &str) -> Result<ClassifierArtifact, StoreError> {
        validate_identifier(model)?;
        let path = self.model_doc(model, DocKind::Classifier);
        read_json(&path)?.ok_or_else(|| StoreError::MissingDocument {
            kind: DocKind::Classifier,
            id: model.to_string(),
        })
    }

    /// Write a freshly trained model bundle. Training-side convenience and
    /// test fixture path; fix-session commits stage instead.
    pub fn write_model_docs(
        &self,
        model: &str,
        bundle: &AggregatedBundle,
        classifier: &ClassifierArtifact,
    ) -> Result<(), StoreError> {
        validate_identifier(model)?;
        let mut staged = self.begin_staged();
        staged.stage_bundle(model, bundle)?;
        staged.stage_classifier(model, classifier)?;
        staged.flush()
    }

    pub fn list_shortforms(&self) -> Result<Vec<String>, StoreError> {
        list_dir_names(&self.groundings_dir)
    }

    pub fn list_models(&self) -> Result<Vec<String>, StoreError> {
        list_dir_names(&self.models_dir)
    }

    /// Advisory per-model lock held for the duration of a commit.
    pub fn lock_model(&self, model: &str) -> Result<ModelLock, StoreError> {
        validate_identifier(model)?;
        let dir = self.model_dir(model);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join("commit.lock");
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(ModelLock { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StoreError::Locked {
                model: model.to_string(),
            }),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Begin buffering writes for an all-or-nothing flush.
    pub fn begin_staged(&self) -> StagedCommit<'_> {
        StagedCommit {
            store: self,
            writes: Vec::new(),
        }
    }
}

/// In-memory staging buffer for a document-set replacement.
///
/// Every document is serialized at stage time; nothing touches disk until
/// [`StagedCommit::flush`], which writes a `.tmp` sibling and renames it
/// into place, in staging order.
pub struct StagedCommit<'a> {
    store: &'a GroundingStore,
    writes: Vec<(PathBuf, String)>,
}

impl StagedCommit<'_> {
    fn stage(&mut self, path: PathBuf, doc: &impl Serialize) -> Result<(), StoreError> {
        let body = serde_json::to_string(doc).map_err(|source| StoreError::Malformed {
            path: path.clone(),
            source,
        })?;
        self.writes.push((path, body));
        Ok(())
    }

    /// Stage the full per-shortform document set.
    pub fn stage_shortform(
        &mut self,
        shortform: &str,
        grounding_map: &GroundingMap,
        names: &NamesMap,
        pos_labels: &PosLabelSet,
    ) -> Result<(), StoreError> {
        validate_shortform_docs(shortform, grounding_map, names, pos_labels)?;
        self.stage(
            self.store.shortform_doc(shortform, DocKind::GroundingMap),
            grounding_map,
        )?;
        self.stage(self.store.shortform_doc(shortform, DocKind::Names), names)?;
        self.stage(
            self.store.shortform_doc(shortform, DocKind::PosLabels),
            pos_labels,
        )
    }

    /// Stage the aggregated bundle's own document copies.
    pub fn stage_bundle(&mut self, model: &str, bundle: &AggregatedBundle) -> Result<(), StoreError> {
        validate_identifier(model)?;
        for (shortform, grounding_map) in &bundle.grounding_dict {
            validate_identifier(shortform)?;
            for (_, label) in grounding_map.iter() {
                validate_identifier(label)?;
            }
        }
        self.stage(
            self.store.model_doc(model, DocKind::GroundingDict),
            &bundle.grounding_dict,
        )?;
        self.stage(self.store.model_doc(model, DocKind::Names), &bundle.names)?;
        self.stage(
            self.store.model_doc(model, DocKind::PosLabels),
            &bundle.pos_labels,
        )
    }

    pub fn stage_classifier(
        &mut self,
        model: &str,
        classifier: &ClassifierArtifact,
    ) -> Result<(), StoreError> {
        validate_identifier(model)?;
        self.stage(self.store.model_doc(model, DocKind::Classifier), classifier)
    }

    /// Write everything staged so far, in staging order.
    pub fn flush(self) -> Result<(), StoreError> {
        for (path, body) in self.writes {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, &body).map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
            fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })?;
        }
        Ok(())
    }

    pub fn staged_len(&self) -> usize {
        self.writes.len()
    }
}

/// Advisory lock file, removed on drop.
#[derive(Debug)]
pub struct ModelLock {
    path: PathBuf,
}

impl Drop for ModelLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn validate_shortform_docs(
    shortform: &str,
    grounding_map: &GroundingMap,
    names: &NamesMap,
    pos_labels: &PosLabelSet,
) -> Result<(), StoreError> {
    validate_identifier(shortform)?;
    for (_, label) in grounding_map.iter() {
        validate_identifier(label)?;
    }
    for (label, _) in names.iter() {
        validate_identifier(label)?;
    }
    for label in pos_labels.iter() {
        validate_identifier(label)?;
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json(path: &Path, doc: &impl Serialize) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let body = serde_json::to_string(doc).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, body).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn list_dir_names(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(unescape_filename(name.trim_end_matches(".json")));
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_distinguishes_case() {
        assert_ne!(escape_filename("ER"), escape_filename("er"));
        assert_eq!(escape_filename("er"), "_E_R");
        assert_eq!(escape_filename("ER"), "ER");
    }

    #[test]
    fn escape_handles_punctuation_and_escape_char() {
        assert_eq!(escape_filename("HGNC:3467"), "HGNC_53467");
        assert_eq!(escape_filename("a_b"), "_A___B");
        assert_eq!(escape_filename("v1.2"), "V1_,2");
    }

    #[test]
    fn escape_round_trips() {
        for id in ["ER", "er", "HGNC:3467", "a_b", "v1.2", "Tak1"] {
            assert_eq!(unescape_filename(&escape_filename(id)), id);
        }
    }

    #[test]
    fn identifier_validation_rejects_key_space_violations() {
        assert!(validate_identifier("ER").is_ok());
        assert!(validate_identifier("HGNC:3467").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a/b").is_err());
        assert!(validate_identifier("a\\b").is_err());
        assert!(validate_identifier(".hidden").is_err());
        assert!(validate_identifier("a\x07b").is_err());
    }

    #[test]
    fn missing_document_is_distinguished() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = crate::config::GroundfixPaths::under(tmp.path().to_path_buf());
        paths.ensure_dirs().unwrap();
        let store = GroundingStore::open(&paths);

        match store.read_grounding_map("ER") {
            Err(StoreError::MissingDocument {
                kind: DocKind::GroundingMap,
                ..
            }) => {}
            other => panic!("expected MissingDocument, got {other:?}"),
        }
    }

    #[test]
    fn staged_flush_round_trips() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = crate::config::GroundfixPaths::under(tmp.path().to_path_buf());
        paths.ensure_dirs().unwrap();
        let store = GroundingStore::open(&paths);

        let mut gm = GroundingMap::new();
        gm.insert("estrogen receptor", "HGNC:3467");
        let mut names = NamesMap::new();
        names.insert("HGNC:3467", "ESR1");
        let pos: PosLabelSet = ["HGNC:3467".to_string()].into_iter().collect();

        store.write_shortform_docs("ER", &gm, &names, &pos).unwrap();

        assert_eq!(store.read_grounding_map("ER").unwrap(), gm);
        assert_eq!(store.read_names("ER").unwrap(), names);
        assert_eq!(store.read_pos_labels("ER").unwrap(), pos);
        assert_eq!(store.list_shortforms().unwrap(), vec!["ER".to_string()]);
    }

    #[test]
    fn staging_buffers_until_flush() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = crate::config::GroundfixPaths::under(tmp.path().to_path_buf());
        paths.ensure_dirs().unwrap();
        let store = GroundingStore::open(&paths);

        let mut gm = GroundingMap::new();
        gm.insert("estrogen receptor", "HGNC:3467");
        let mut staged = store.begin_staged();
        staged
            .stage_shortform("ER", &gm, &NamesMap::new(), &PosLabelSet::new())
            .unwrap();

        // Nothing on disk until flush.
        assert!(store.read_grounding_map("ER").is_err());
        staged.flush().unwrap();
        assert_eq!(store.read_grounding_map("ER").unwrap(), gm);
    }

    #[test]
    fn model_lock_is_exclusive_and_released_on_drop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = crate::config::GroundfixPaths::under(tmp.path().to_path_buf());
        paths.ensure_dirs().unwrap();
        let store = GroundingStore::open(&paths);

        let lock = store.lock_model("er_model").unwrap();
        match store.lock_model("er_model") {
            Err(StoreError::Locked { .. }) => {}
            other => panic!("expected Locked, got {other:?}"),
        }
        drop(lock);
        assert!(store.lock_model("er_model").is_ok());
    }
}
