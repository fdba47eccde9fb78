//! Configuration management for groundfix
//!
//! Handles the ~/.groundfix/ directory structure and config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Override for the data directory; defaults to ~/.groundfix/data.
    pub data_dir: Option<PathBuf>,
    /// Mining-score cutoff below which candidate longforms are not offered
    /// to a curation session.
    #[serde(default = "default_score_cutoff")]
    pub score_cutoff: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            score_cutoff: default_score_cutoff(),
        }
    }
}

fn default_score_cutoff() -> f64 {
    1.0
}

/// Returns the path to the groundfix home directory (~/.groundfix)
pub fn groundfix_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".groundfix"))
}

/// Paths to all groundfix directories
pub struct GroundfixPaths {
    pub root: PathBuf,
    pub config: PathBuf,
    pub data: PathBuf,
    pub longforms: PathBuf,
    pub groundings: PathBuf,
    pub models: PathBuf,
}

impl GroundfixPaths {
    /// Build the path set for `~/.groundfix`, honoring the `data_dir`
    /// override from `config.toml` when one is set.
    pub fn new() -> Result<Self> {
        let root = groundfix_home()?;
        let config = read_config_file(&root.join("config.toml"))?;
        Ok(Self::with_config(root, &config))
    }

    /// Build the path set under an explicit root. Tests point this at a
    /// temporary directory.
    pub fn under(root: PathBuf) -> Self {
        Self::with_config(root, &Config::default())
    }

    pub fn with_config(root: PathBuf, config: &Config) -> Self {
        let data = config
            .data_dir
            .clone()
            .unwrap_or_else(|| root.join("data"));
        Self {
            config: root.join("config.toml"),
            longforms: data.join("longforms"),
            groundings: data.join("groundings"),
            models: data.join("models"),
            data,
            root,
        }
    }

    /// Create all directories if they don't exist
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root).context("Failed to create groundfix root")?;
        fs::create_dir_all(&self.longforms).context("Failed to create longforms directory")?;
        fs::create_dir_all(&self.groundings).context("Failed to create groundings directory")?;
        fs::create_dir_all(&self.models).context("Failed to create models directory")?;
        Ok(())
    }

    /// Check whether groundfix has been initialized
    pub fn is_initialized(&self) -> bool {
        self.config.exists() && self.data.exists()
    }
}

/// Load configuration from disk
pub fn load_config() -> Result<Config> {
    let root = groundfix_home()?;
    read_config_file(&root.join("config.toml"))
}

fn read_config_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path).context("Failed to read config.toml")?;
    toml::from_str(&content).context("Failed to parse config.toml")
}

/// Save configuration to disk
pub fn save_config(config: &Config) -> Result<()> {
    let paths = GroundfixPaths::new()?;
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(&paths.config, content).context("Failed to write config.toml")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_data_dir_sits_under_the_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = GroundfixPaths::under(tmp.path().to_path_buf());
        assert_eq!(paths.data, tmp.path().join("data"));
        assert_eq!(paths.groundings, tmp.path().join("data").join("groundings"));
    }

    #[test]
    fn data_dir_override_relocates_the_data_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        let elsewhere = tmp.path().join("elsewhere");
        let config = Config {
            data_dir: Some(elsewhere.clone()),
            ..Config::default()
        };

        let paths = GroundfixPaths::with_config(tmp.path().to_path_buf(), &config);
        assert_eq!(paths.data, elsewhere);
        assert_eq!(paths.longforms, elsewhere.join("longforms"));
        assert_eq!(paths.models, elsewhere.join("models"));
        // config.toml stays at the root so the override can be found.
        assert_eq!(paths.config, tmp.path().join("config.toml"));
    }

    #[test]
    fn data_dir_override_round_trips_through_toml() {
        let config = Config {
            data_dir: Some(PathBuf::from("/srv/groundfix-data")),
            ..Config::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        let paths = GroundfixPaths::with_config(PathBuf::from("/home/u/.groundfix"), &parsed);
        assert_eq!(paths.data, PathBuf::from("/srv/groundfix-data"));
    }
}
