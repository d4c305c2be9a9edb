//! JSON settings file for the `hypersweep` binary.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use hs_optimizer::SpaceConfig;
use hs_types::SearchConfig;

pub const CONFIG_ENV: &str = "HYPERSWEEP_CONFIG";
pub const OUTPUT_DIR_ENV: &str = "HYPERSWEEP_OUTPUT_DIR";
pub const DEFAULT_CONFIG_PATH: &str = "hypersweep.json";

/// Which training routine the binary runs for each trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutineSettings {
    /// External program; parameters are passed as `--name value`.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Built-in synthetic model, useful for trying out search settings.
    Synthetic {
        #[serde(default = "default_epochs")]
        epochs: u64,
        #[serde(default)]
        epoch_delay_ms: u64,
    },
}

fn default_epochs() -> u64 {
    5
}

impl Default for RoutineSettings {
    fn default() -> Self {
        Self::Synthetic {
            epochs: default_epochs(),
            epoch_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub search: SearchConfig,
    pub space: SpaceConfig,
    #[serde(default)]
    pub routine: RoutineSettings,
    /// Root directory for per-trial outputs and the search summary.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing settings in {}", path.display()))
    }

    /// Replace the output directory when an override is given.
    pub fn with_output_dir_override(mut self, output_dir: Option<String>) -> Self {
        if let Some(dir) = output_dir.filter(|d| !d.is_empty()) {
            self.output_dir = PathBuf::from(dir);
        }
        self
    }
}

/// Settings path: first argument, then `HYPERSWEEP_CONFIG`, then the default.
pub fn resolve_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
