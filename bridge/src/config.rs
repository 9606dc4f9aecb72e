//! Bridge configuration.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use witness::ptrauth::{PointerAuth, NoPointerAuth, BlendPointerAuth};

/// Environment variable naming a TOML configuration file.
pub const CONFIG_ENV_VAR: &str = "GENOPT_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Maximum number of integer lanes a value may be split into to be passed directly.
    ///
    /// Zero forces every value to be passed indirectly.
    pub max_direct_lanes: usize,

    /// Log every cross-runtime call at debug, rather than trace, level.
    pub trace_calls: bool,

    pub pointer_auth: PointerAuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_direct_lanes: 4,
            trace_calls: false,
            pointer_auth: PointerAuthConfig::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "scheme", rename_all = "kebab-case")]
pub enum PointerAuthConfig {
    None,
    Blend {
        key: u64,
    },
}

impl Default for PointerAuthConfig {
    fn default() -> Self {
        PointerAuthConfig::None
    }
}

impl PointerAuthConfig {
    pub fn scheme(self) -> Box<dyn PointerAuth> {
        match self {
            PointerAuthConfig::None => Box::new(NoPointerAuth),
            PointerAuthConfig::Blend { key } => Box::new(BlendPointerAuth::new(key)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },

    #[error("parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
                   .map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        Self::from_toml_str(&s)
    }

    /// Loads the file named by `GENOPT_CONFIG`, or the defaults if it isn't set.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
