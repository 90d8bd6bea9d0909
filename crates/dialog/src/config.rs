//! Dialog configuration: figment-layered defaults, a JSON settings file, and
//! `PARLEY_` environment overrides.

use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "dialog.json";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogConfig {
    /// Total initial-load attempts before the dialog surfaces a failure.
    #[serde(default = "default_max_initial_attempts")]
    pub max_initial_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * retry_base_delay_ms`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// How many recent messages the push feed covers.
    #[serde(default = "default_feed_window")]
    pub feed_window: usize,
    /// Prepended to relative media paths when resolving attachments.
    #[serde(default = "default_media_base_url")]
    pub media_base_url: String,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            max_initial_attempts: default_max_initial_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            feed_window: default_feed_window(),
            media_base_url: default_media_base_url(),
        }
    }
}

fn default_max_initial_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_feed_window() -> usize {
    10
}

fn default_media_base_url() -> String {
    "https://storage.googleapis.com/".to_string()
}

impl DialogConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Defaults, then the settings file, then `PARLEY_` environment
    /// variables. A broken file logs and falls back to defaults rather than
    /// blocking the dialog.
    pub fn load_from(path: &PathBuf) -> Self {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<Self>() {
            Ok(config) => config.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse dialog config from {:?}: {}. using defaults",
                    path,
                    error
                );
                Self::default()
            }
        }
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    pub fn persist(&self, path: &PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-config-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(self).context(SerializeConfigSnafu {
            stage: "serialize-config-json",
        })?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-config-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
            stage: "rename-temporary-config-file",
            from: temp_path,
            to: path.clone(),
        })?;

        tracing::info!("saved dialog config to {:?}", path);
        Ok(())
    }

    fn normalized(mut self) -> Self {
        self.max_initial_attempts = self.max_initial_attempts.max(1);
        self.feed_window = self.feed_window.max(1);
        self.media_base_url = self.media_base_url.trim().to_string();
        self
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to create config directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize dialog config on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write config file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to move config file from {from:?} to {to:?} on `{stage}`: {source}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
