use focus_core::{SessionConfig, codec::CAPTURE_FRAME_SIZE};
use gemini_realtime::{DEFAULT_MODEL, DEFAULT_URL};
use secrecy::SecretString;
use std::{path::PathBuf, str::FromStr, time::Duration};
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub gemini_api_key: SecretString,
    pub gemini_model: String,
    pub gemini_voice: String,
    pub gemini_url: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub data_dir: PathBuf,
    pub user_name: String,
    pub capture_frame_size: usize,
    pub end_session_grace: Duration,
    pub tool_drain_timeout: Duration,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;
        let gemini_model = var_or("GEMINI_MODEL", DEFAULT_MODEL);
        let gemini_voice = var_or("GEMINI_VOICE", "Charon");
        let gemini_url = var_or("GEMINI_URL", DEFAULT_URL);

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = PathBuf::from(var_or("PROMPTS_PATH", "./prompts"));
        let data_dir = PathBuf::from(var_or("DATA_DIR", "./data"));
        let user_name = var_or("USER_NAME", "Boss");

        let capture_frame_size = parse_var("CAPTURE_FRAME_SIZE", CAPTURE_FRAME_SIZE)?;
        if capture_frame_size == 0 {
            return Err(ConfigError::InvalidValue(
                "CAPTURE_FRAME_SIZE".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let end_session_grace = Duration::from_millis(parse_var("END_SESSION_GRACE_MS", 1500)?);
        let tool_drain_timeout = Duration::from_millis(parse_var("TOOL_DRAIN_TIMEOUT_MS", 5000)?);

        let input_device = std::env::var("INPUT_DEVICE").ok().filter(|s| !s.is_empty());
        let output_device = std::env::var("OUTPUT_DEVICE").ok().filter(|s| !s.is_empty());

        Ok(Self {
            gemini_api_key,
            gemini_model,
            gemini_voice,
            gemini_url,
            log_level,
            prompts_path,
            data_dir,
            user_name,
            capture_frame_size,
            end_session_grace,
            tool_drain_timeout,
            input_device,
            output_device,
        })
    }

    /// The session parameters derived from this configuration.
    pub fn session_config(&self, prompt_template: String) -> SessionConfig {
        SessionConfig {
            frame_size: self.capture_frame_size,
            voice: self.gemini_voice.clone(),
            prompt_template,
            end_session_grace: self.end_session_grace,
            tool_drain_timeout: self.tool_drain_timeout,
            ..SessionConfig::default()
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}
