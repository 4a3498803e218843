//! Runner configuration: which external command hosts each classifier package.
//!
//! ```toml
//! [allsorts]
//! program = "python3"
//! args = ["-m", "allsorts_runner"]
//! ```

use crate::types::ModelFamily;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read runner configuration '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML runner configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Runner configuration has no [{0}] section.")]
    MissingSection(&'static str),
}

/// An external program plus its fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// A `Command` ready for the caller's own arguments to be appended.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub allsorts: Option<CommandSpec>,
    #[serde(default)]
    pub tallsorts: Option<CommandSpec>,
    #[serde(default)]
    pub bridge: Option<CommandSpec>,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// The host command for `family`, or an error naming the missing section.
    pub fn command_for(&self, family: ModelFamily) -> Result<&CommandSpec, ConfigError> {
        let section = match family {
            ModelFamily::AllSorts => &self.allsorts,
            ModelFamily::TallSorts => &self.tallsorts,
            ModelFamily::Bridge => &self.bridge,
        };
        section
            .as_ref()
            .ok_or(ConfigError::MissingSection(family.config_key()))
    }
}
