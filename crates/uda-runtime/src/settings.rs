use std::path::PathBuf;

use serde::Serialize;
use uda_ingest::DEFAULT_RETRIEVAL_LIMIT;

use crate::logging::LogFormat;

pub const ENV_API_HOST: &str = "API_HOST";
pub const ENV_API_PORT: &str = "API_PORT";
pub const ENV_DATA_DIR: &str = "DATA_DIR";
pub const ENV_STORAGE_DIR: &str = "STORAGE_DIR";
pub const ENV_DLQ_FILE: &str = "DLQ_FILE";
pub const ENV_DEFAULT_SECURITY_TAGS: &str = "DEFAULT_SECURITY_TAGS";
pub const ENV_LOG: &str = "UDA_LOG";
pub const ENV_LOG_FORMAT: &str = "UDA_LOG_FORMAT";
pub const ENV_RETRIEVAL_LIMIT: &str = "UDA_RETRIEVAL_LIMIT";
pub const ENV_CORPUS: &str = "UDA_CORPUS";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SettingsError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration read from environment variables.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Settings {
    pub api_host: String,
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub dlq_file: PathBuf,
    pub default_security_tags: Vec<String>,
    pub log_filter: String,
    pub log_format: LogFormat,
    pub retrieval_limit: usize,
    pub corpus_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            data_dir: PathBuf::from("./data"),
            storage_dir: PathBuf::from("./storage"),
            dlq_file: PathBuf::from("./storage/dlq.jsonl"),
            default_security_tags: vec!["public".to_string()],
            log_filter: "info".to_string(),
            log_format: LogFormat::Pipe,
            retrieval_limit: DEFAULT_RETRIEVAL_LIMIT,
            corpus_file: None,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// # Errors
    /// Returns an error when a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset or blank keys keep their defaults.
    ///
    /// When `STORAGE_DIR` is set without `DLQ_FILE`, the dead-letter file
    /// lives inside the storage directory. A relative `UDA_CORPUS` names a
    /// file inside `DATA_DIR`.
    ///
    /// # Errors
    /// Returns an error when a variable is set to an unparseable value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut settings = Self::default();

        if let Some(host) = get(ENV_API_HOST) {
            settings.api_host = host;
        }
        if let Some(port) = get(ENV_API_PORT) {
            settings.api_port = port.parse().map_err(|err: std::num::ParseIntError| {
                SettingsError::InvalidValue {
                    key: ENV_API_PORT,
                    value: port.clone(),
                    reason: err.to_string(),
                }
            })?;
        }
        if let Some(dir) = get(ENV_DATA_DIR) {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get(ENV_STORAGE_DIR) {
            settings.storage_dir = PathBuf::from(dir);
            settings.dlq_file = settings.storage_dir.join("dlq.jsonl");
        }
        if let Some(file) = get(ENV_DLQ_FILE) {
            settings.dlq_file = PathBuf::from(file);
        }
        if let Some(tags) = get(ENV_DEFAULT_SECURITY_TAGS) {
            settings.default_security_tags = parse_tags(&tags);
        }
        if let Some(filter) = get(ENV_LOG) {
            settings.log_filter = filter;
        }
        if let Some(format) = get(ENV_LOG_FORMAT) {
            settings.log_format =
                LogFormat::parse(&format).ok_or_else(|| SettingsError::InvalidValue {
                    key: ENV_LOG_FORMAT,
                    value: format.clone(),
                    reason: "expected pipe or json".to_string(),
                })?;
        }
        if let Some(limit) = get(ENV_RETRIEVAL_LIMIT) {
            settings.retrieval_limit = match limit.parse::<usize>() {
                Ok(value) if value > 0 => value,
                Ok(_) => {
                    return Err(SettingsError::InvalidValue {
                        key: ENV_RETRIEVAL_LIMIT,
                        value: limit,
                        reason: "must be greater than zero".to_string(),
                    })
                }
                Err(err) => {
                    return Err(SettingsError::InvalidValue {
                        key: ENV_RETRIEVAL_LIMIT,
                        value: limit,
                        reason: err.to_string(),
                    })
                }
            };
        }
        if let Some(corpus) = get(ENV_CORPUS) {
            settings.corpus_file = Some(settings.data_dir.join(corpus));
        }

        Ok(settings)
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}
