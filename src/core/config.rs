//! Configuration file handling: a small TOML file in the platform config
//! directory, written atomically.

use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::api::GenerationOptions;
use crate::core::constants::DEFAULT_BASE_URL;

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        /// Path to the configuration file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        /// Path to the configuration file with invalid TOML.
        path: PathBuf,
        /// The TOML deserialization error.
        source: toml::de::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "Failed to parse config at {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Generation defaults forwarded to the runtime with every request.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy)]
pub struct GenerationDefaults {
    pub temperature: Option<f32>,
    pub num_ctx: Option<u32>,
    pub num_predict: Option<i32>,
}

impl GenerationDefaults {
    pub fn to_options(self) -> Option<GenerationOptions> {
        let options = GenerationOptions {
            temperature: self.temperature,
            num_ctx: self.num_ctx,
            num_predict: self.num_predict,
        };
        if options.is_empty() {
            None
        } else {
            Some(options)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    /// Base URL of the local model runtime.
    pub base_url: Option<String>,
    /// Model used when none is given on the command line.
    pub default_model: Option<String>,
    /// Override for the history database location.
    pub history_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "generation_defaults_are_empty")]
    pub generation: GenerationDefaults,
}

fn generation_defaults_are_empty(defaults: &GenerationDefaults) -> bool {
    defaults.to_options().is_none()
}

impl Config {
    pub fn load() -> Result<Config, Box<dyn StdError>> {
        Self::load_from_path(&Self::config_path())
    }

    pub fn load_from_path(config_path: &PathBuf) -> Result<Config, Box<dyn StdError>> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
                path: config_path.clone(),
                source,
            })?;
            let config: Config =
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: config_path.clone(),
                    source,
                })?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(&self) -> Result<(), Box<dyn StdError>> {
        self.save_to_path(&Self::config_path())
    }

    pub(crate) fn save_to_path(&self, config_path: &Path) -> Result<(), Box<dyn StdError>> {
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };

        temp_file.write_all(contents.as_bytes())?;
        temp_file.as_file_mut().sync_all()?;
        temp_file
            .persist(config_path)
            .map_err(|err| -> Box<dyn StdError> { Box::new(err) })?;
        Ok(())
    }

    pub(crate) fn config_path() -> PathBuf {
        let proj_dirs = ProjectDirs::from("org", "permacommons", "brazier")
            .expect("Failed to determine config directory");
        proj_dirs.config_dir().join("config.toml")
    }

    /// Effective runtime base URL.
    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    /// Effective history database path: the configured override, or a file
    /// in the platform data directory.
    pub fn history_path(&self) -> PathBuf {
        if let Some(path) = &self.history_path {
            return path.clone();
        }
        let proj_dirs = ProjectDirs::from("org", "permacommons", "brazier")
            .expect("Failed to determine data directory");
        proj_dirs.data_dir().join("history.sqlite3")
    }

    pub fn print_all(&self) {
        println!(
            "base-url: {}",
            self.base_url.as_deref().unwrap_or("(default)")
        );
        println!(
            "default-model: {}",
            self.default_model.as_deref().unwrap_or("(unset)")
        );
        match &self.history_path {
            Some(path) => println!("history-path: {}", path.display()),
            None => println!("history-path: (default)"),
        }
    }
}
