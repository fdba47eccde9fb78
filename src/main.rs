//! groundfix - grounding curation and fix engine
//!
//! Keeps the denormalized grounding documents behind a shortform
//! disambiguation model consistent through rename/merge commits.

mod commands;
mod config;
mod consistency;
mod curate;
mod models;
mod session;
mod store;
mod transition;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "groundfix")]
#[command(author, version, about = "Curate groundings and fix trained models without breaking their documents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize groundfix (first-time setup)
    Init,

    /// List curated shortforms and aggregated models
    List,

    /// Curate the mined longforms for a shortform
    Curate {
        /// Shortform term
        shortform: String,

        /// Assign a grounding: LONGFORM=NAME=GROUNDING (repeatable)
        #[arg(long = "assign", value_name = "SPEC")]
        assigns: Vec<String>,

        /// Clear a longform's grounding (repeatable)
        #[arg(long = "delete", value_name = "LONGFORM")]
        deletes: Vec<String>,

        /// Toggle a label's positive membership (repeatable)
        #[arg(long = "toggle-pos", value_name = "LABEL")]
        toggles: Vec<String>,

        /// Print the curation rows without finalizing
        #[arg(long)]
        dry_run: bool,
    },

    /// Show an aggregated model's documents
    Show {
        /// Model name
        model: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a model's stored documents against every invariant
    Check {
        /// Model name
        model: String,
    },

    /// Rename or merge groundings and commit the whole document set
    Fix {
        /// Model name
        model: String,

        /// Rename a grounding: OLD=NEW or OLD=NEW=NAME (repeatable)
        #[arg(long = "rename", value_name = "SPEC")]
        renames: Vec<String>,

        /// Set a display name: LABEL=NAME (repeatable)
        #[arg(long = "set-name", value_name = "SPEC")]
        set_names: Vec<String>,

        /// Toggle a label's positive membership (repeatable)
        #[arg(long = "toggle-pos", value_name = "LABEL")]
        toggles: Vec<String>,

        /// Validate only; write nothing
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => commands::init(),
        Commands::List => commands::list(),
        Commands::Curate {
            shortform,
            assigns,
            deletes,
            toggles,
            dry_run,
        } => commands::curate(&shortform, &assigns, &deletes, &toggles, dry_run),
        Commands::Show { model, json } => commands::show(&model, json),
        Commands::Check { model } => commands::check(&model),
        Commands::Fix {
            model,
            renames,
            set_names,
            toggles,
            dry_run,
        } => commands::fix(&model, &renames, &set_names, &toggles, dry_run),
    }
}
