//! Runtime configuration: models directory, context parameters, download
//! tuning.
//!
//! Defaults suit a phone-sized model. Each value can be overridden from the
//! environment (a `.env` file is honoured):
//!   GUFFTALK_MODELS_DIR, GUFFTALK_CONTEXT_SIZE, GUFFTALK_GPU_LAYERS,
//!   GUFFTALK_USE_MLOCK, GUFFTALK_DOWNLOAD_RESUME_ATTEMPTS

use crate::error::ConfigError;
use crate::llm::ContextParams;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Emit a progress report at most every this many bytes.
    pub progress_interval_bytes: u64,
    /// Range-resume attempts within one transfer before giving up.
    pub max_resume_attempts: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            progress_interval_bytes: 512 * 1024,
            max_resume_attempts: 3,
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub models_dir: PathBuf,
    pub context: ContextParams,
    pub download: DownloadConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            models_dir: Self::default_models_dir(),
            context: ContextParams::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl AppConfig {
    /// Platform data directory, e.g. `~/.local/share/gufftalk/models` on Linux.
    pub fn default_models_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gufftalk")
            .join("models")
    }

    /// Defaults overridden by the process environment and `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            log::debug!("[CONFIG] Loaded {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(dir) = lookup("GUFFTALK_MODELS_DIR").filter(|d| !d.trim().is_empty()) {
            config.models_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse(&lookup, "GUFFTALK_CONTEXT_SIZE")? {
            config.context.context_size = v;
        }
        if let Some(v) = parse(&lookup, "GUFFTALK_GPU_LAYERS")? {
            config.context.gpu_layers = v;
        }
        if let Some(v) = parse_bool(&lookup, "GUFFTALK_USE_MLOCK")? {
            config.context.use_mlock = v;
        }
        if let Some(v) = parse(&lookup, "GUFFTALK_DOWNLOAD_RESUME_ATTEMPTS")? {
            config.download.max_resume_attempts = v;
        }
        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => {
            let parsed = raw.trim().parse::<T>();
            match parsed {
                Ok(v) => Ok(Some(v)),
                Err(_) => Err(ConfigError::InvalidValue { key, value: raw }),
            }
        }
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { key, value: raw }),
        },
    }
}
