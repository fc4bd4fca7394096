//! Configuration loading and persistence.
//!
//! Settings resolve in three layers: the config file (JSON in the platform
//! config dir), `TASKMILL_*` environment variables, and finally CLI flags
//! applied by `main.rs`. Protocol-level values (queue bound, idle timeout)
//! are deliberately *not* configurable — peers must agree on them, so they
//! live in [`crate::constants`].

use std::path::PathBuf;
use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration shared by the broker, node, and client subcommands.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// TCP port the broker listens on (0 = ephemeral, used by tests).
    pub port: u16,
    /// Base directory for all on-disk state (`serverFiles/`, `nodeFiles/`,
    /// `clientFiles/` live underneath).
    pub data_dir: PathBuf,
    /// Interpreter used by nodes to run source-form processors.
    pub interpreter: String,
    /// Number of new results between client checkpoint rewrites.
    pub checkpoint_frequency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8111,
            data_dir: PathBuf::from("."),
            interpreter: "python3".to_string(),
            checkpoint_frequency: 10,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `TASKMILL_CONFIG_DIR` overrides the platform default so tests and
    /// multi-instance deployments stay isolated.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("TASKMILL_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join("taskmill")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("read {}", config_path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("TASKMILL_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.port = port;
            }
        }

        if let Ok(data_dir) = std::env::var("TASKMILL_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(interpreter) = std::env::var("TASKMILL_INTERPRETER") {
            self.interpreter = interpreter;
        }

        if let Ok(frequency) = std::env::var("TASKMILL_CHECKPOINT_FREQUENCY") {
            if let Ok(frequency) = frequency.parse::<usize>() {
                self.checkpoint_frequency = frequency;
            }
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Directory holding uploaded processors, one subdirectory per client.
    pub fn server_files_dir(&self) -> PathBuf {
        self.data_dir.join("serverFiles")
    }

    /// Node-side processor cache and execution scratch space.
    pub fn node_files_dir(&self) -> PathBuf {
        self.data_dir.join("nodeFiles")
    }

    /// Client-side output and checkpoint directory.
    pub fn client_files_dir(&self) -> PathBuf {
        self.data_dir.join("clientFiles")
    }

    /// A config rooted at `dir` with defaults otherwise — the shape every
    /// test wants.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            data_dir: dir.to_path_buf(),
            ..Self::default()
        }
    }
}
