//! CLI commands for groundfix

use anyhow::{bail, Context, Result};

use crate::config::{load_config, save_config, Config, GroundfixPaths};
use crate::curate::CurationSession;
use crate::consistency::{
    check_classifier_aligned, check_grounding_dict, check_names_agreement, check_names_complete,
    check_pos_labels_contained,
};
use crate::session::FixSession;
use crate::store::GroundingStore;

/// Initialize groundfix for first-time setup
pub fn init() -> Result<()> {
    let paths = GroundfixPaths::new()?;

    if paths.is_initialized() {
        println!("groundfix is already initialized at {}", paths.root.display());
        return Ok(());
    }

    println!("Initializing groundfix at {}...", paths.root.display());

    paths.ensure_dirs()?;
    println!("  Created data directories");

    let config = Config::default();
    save_config(&config)?;
    println!("  Created config.toml");

    println!();
    println!("groundfix initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  groundfix list                 List curated shortforms and models");
    println!("  groundfix check <model>        Check a model's documents");
    println!("  groundfix fix <model> ...      Rename or merge groundings");

    Ok(())
}

/// List curated shortforms and aggregated models
pub fn list() -> Result<()> {
    let paths = GroundfixPaths::new()?;
    ensure_initialized(&paths)?;
    let store = GroundingStore::open(&paths);

    let shortforms = store.list_shortforms()?;
    let models = store.list_models()?;

    if shortforms.is_empty() && models.is_empty() {
        println!("Nothing curated yet.");
        return Ok(());
    }

    println!("Shortforms ({}):", shortforms.len());
    for shortform in &shortforms {
        println!("  {shortform}");
    }
    println!();
    println!("Models ({}):", models.len());
    for model in &models {
        println!("  {model}");
    }

    Ok(())
}

/// Show an aggregated model's documents
pub fn show(model: &str, json: bool) -> Result<()> {
    let paths = GroundfixPaths::new()?;
    ensure_initialized(&paths)?;
    let store = GroundingStore::open(&paths);

    let bundle = store
        .read_bundle(model)
        .with_context(|| format!("model not found: {model}"))?;
    let classifier = store.read_classifier(model)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&bundle)?);
        return Ok(());
    }

    println!("Model: {model}");
    println!("{}", "=".repeat(50));
    println!("Shortforms: {}", bundle.grounding_dict.len());
    for (shortform, grounding_map) in &bundle.grounding_dict {
        println!("  {:<12} {} longforms", shortform, grounding_map.len());
    }
    println!();
    println!("Groundings: {}", bundle.grounded_label_set().len());
    for label in bundle.grounded_label_set() {
        let name = bundle.names.get(&label).unwrap_or("?");
        let marker = if bundle.pos_labels.contains(&label) {
            "+"
        } else {
            " "
        };
        println!("  {marker} {:<20} {name}", label);
    }
    println!();
    println!("Classifier labels: {}", classifier.labels.len());

    Ok(())
}

/// Check a stored model's documents against every invariant
pub fn check(model: &str) -> Result<()> {
    let paths = GroundfixPaths::new()?;
    ensure_initialized(&paths)?;
    let store = GroundingStore::open(&paths);

    let bundle = store
        .read_bundle(model)
        .with_context(|| format!("model not found: {model}"))?;
    let classifier = store.read_classifier(model)?;

    println!("Checking model: {model}");
    println!();

    let mut failures = 0;
    let mut report = |label: &str, result: std::result::Result<(), String>| match result {
        Ok(()) => println!("  ✓ {label}"),
        Err(e) => {
            failures += 1;
            println!("  ✗ {label}");
            println!("      {e}");
        }
    };

    report(
        "grounding agreement",
        check_grounding_dict(&bundle).map_err(|e| e.to_string()),
    );
    report(
        "positive-label containment",
        check_pos_labels_contained(&bundle, &bundle.pos_labels).map_err(|e| e.to_string()),
    );
    report(
        "names completeness",
        check_names_complete(&bundle.names, &bundle).map_err(|e| e.to_string()),
    );
    report(
        "classifier alignment",
        check_classifier_aligned(&classifier, &bundle, &bundle.pos_labels)
            .map_err(|e| e.to_string()),
    );

    let mut shortform_names = Vec::new();
    for shortform in bundle.grounding_dict.keys() {
        shortform_names.push(
            store
                .read_names(shortform)
                .with_context(|| format!("missing names document for {shortform}"))?,
        );
    }
    report(
        "cross-bundle name agreement",
        check_names_agreement(shortform_names.iter()).map_err(|e| e.to_string()),
    );

    println!();
    if failures == 0 {
        println!("All checks passed.");
        Ok(())
    } else {
        bail!("{failures} check(s) failed");
    }
}

/// Rename/merge groundings in a model and commit the transitioned
/// document set.
///
/// Edits apply in this order: renames, display-name edits, positive
/// toggles. Rename specs are `OLD=NEW` or `OLD=NEW=NAME`; name specs are
/// `LABEL=NAME`.
pub fn fix(
    model: &str,
    renames: &[String],
    set_names: &[String],
    toggles: &[String],
    dry_run: bool,
) -> Result<()> {
    let paths = GroundfixPaths::new()?;
    ensure_initialized(&paths)?;
    let store = GroundingStore::open(&paths);

    let mut session = FixSession::load(&store, model)
        .with_context(|| format!("failed to load fix session for {model}"))?;

    for spec in renames {
        let (old, new, name) = parse_rename_spec(spec)?;
        session
            .rename(old, new, name)
            .with_context(|| format!("rename {spec:?} rejected"))?;
    }
    for spec in set_names {
        let (label, name) = parse_name_spec(spec)?;
        session
            .set_name(label, name)
            .with_context(|| format!("name edit {spec:?} rejected"))?;
    }
    for label in toggles {
        session
            .toggle_positive(label)
            .with_context(|| format!("positive toggle {label:?} rejected"))?;
    }

    if dry_run {
        session.validate()?;
        println!("Validation passed; no documents written (dry run).");
        println!("Labels after transition:");
        for (label, longform) in session.representative_longforms() {
            println!("  {:<20} e.g. {longform}", label);
        }
        return Ok(());
    }

    let receipt = session.commit()?;
    println!("Committed model: {}", receipt.model);
    println!("  Session:   {}", receipt.session_id);
    println!("  Documents: {}", receipt.documents_written);
    if receipt.renames.is_empty() {
        println!("  No label renames (names/positives only)");
    } else {
        println!("  Renames:");
        for (old, new) in &receipt.renames {
            println!("    {old} → {new}");
        }
    }

    Ok(())
}

/// Curate the mined longforms for a shortform and finalize its documents.
///
/// Assign specs are `LONGFORM=NAME=GROUNDING`; `--delete` clears a
/// longform's grounding so it finalizes as ungrounded.
pub fn curate(
    shortform: &str,
    assigns: &[String],
    deletes: &[String],
    toggles: &[String],
    dry_run: bool,
) -> Result<()> {
    let paths = GroundfixPaths::new()?;
    ensure_initialized(&paths)?;
    let store = GroundingStore::open(&paths);
    let config = load_config()?;

    let mut session = CurationSession::start(&store, shortform, config.score_cutoff, None)
        .with_context(|| format!("failed to start curation for {shortform}"))?;

    for spec in assigns {
        let (longform, name, grounding) = parse_assign_spec(spec)?;
        let index = row_index(&session, longform)?;
        session
            .assign(&[index], name, grounding)
            .with_context(|| format!("assignment {spec:?} rejected"))?;
    }
    for longform in deletes {
        let index = row_index(&session, longform)?;
        session.delete(index)?;
    }
    for label in toggles {
        session.toggle_positive(label);
    }

    println!("Shortform: {shortform}");
    for row in session.rows() {
        let grounding = if row.grounding.is_empty() {
            "(ungrounded)"
        } else {
            row.grounding.as_str()
        };
        println!(
            "  {:<30} {:>7.1}  {:<20} {}",
            row.longform, row.score, grounding, row.name
        );
    }

    if dry_run {
        println!();
        println!("Nothing written (dry run).");
        return Ok(());
    }

    session.finalize(&store)?;
    println!();
    println!("Finalized documents for {shortform}.");
    Ok(())
}

fn row_index(session: &CurationSession, longform: &str) -> Result<usize> {
    session
        .rows()
        .iter()
        .position(|r| r.longform == longform)
        .with_context(|| format!("no mined longform {longform:?} above the score cutoff"))
}

fn parse_assign_spec(spec: &str) -> Result<(&str, &str, &str)> {
    let mut parts = spec.splitn(3, '=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(longform), Some(name), Some(grounding))
            if !longform.is_empty() && !name.is_empty() && !grounding.is_empty() =>
        {
            Ok((longform, name, grounding))
        }
        _ => bail!("invalid assign spec {spec:?}, expected LONGFORM=NAME=GROUNDING"),
    }
}

fn parse_rename_spec(spec: &str) -> Result<(&str, &str, Option<&str>)> {
    let mut parts = spec.splitn(3, '=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(old), Some(new), name) if !old.is_empty() && !new.is_empty() => {
            Ok((old, new, name.filter(|n| !n.is_empty())))
        }
        _ => bail!("invalid rename spec {spec:?}, expected OLD=NEW or OLD=NEW=NAME"),
    }
}

fn parse_name_spec(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once('=') {
        Some((label, name)) if !label.is_empty() && !name.is_empty() => Ok((label, name)),
        _ => bail!("invalid name spec {spec:?}, expected LABEL=NAME"),
    }
}

fn ensure_initialized(paths: &GroundfixPaths) -> Result<()> {
    if !paths.is_initialized() {
        bail!("groundfix not initialized. Run `groundfix init` first.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_spec_parsing() {
        assert_eq!(
            parse_rename_spec("HGNC:1=HGNC:2").unwrap(),
            ("HGNC:1", "HGNC:2", None)
        );
        assert_eq!(
            parse_rename_spec("HGNC:1=HGNC:2=merged name").unwrap(),
            ("HGNC:1", "HGNC:2", Some("merged name"))
        );
        assert!(parse_rename_spec("HGNC:1").is_err());
        assert!(parse_rename_spec("=HGNC:2").is_err());
    }

    #[test]
    fn assign_spec_parsing() {
        assert_eq!(
            parse_assign_spec("estrogen receptor=ESR1=HGNC:3467").unwrap(),
            ("estrogen receptor", "ESR1", "HGNC:3467")
        );
        assert!(parse_assign_spec("estrogen receptor=ESR1").is_err());
        assert!(parse_assign_spec("=ESR1=HGNC:3467").is_err());
    }

    #[test]
    fn name_spec_parsing() {
        assert_eq!(
            parse_name_spec("HGNC:3467=ESR1").unwrap(),
            ("HGNC:3467", "ESR1")
        );
        assert!(parse_name_spec("HGNC:3467").is_err());
    }
}
