//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__HOST, APP_RECOGNITION__ENDPOINT, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! Environment keys use a double underscore between the section and the
//! field, so multi-word field names survive:
//! `APP_SESSION__MAX_SESSIONS_PER_USER` maps to
//! `session.max_sessions_per_user`.
//!
//! `HOST` and `PORT` without the prefix are honored too, for deployment
//! platforms that inject them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub recognition: RecognitionConfig,
    pub synthesis: SynthesisConfig,
    pub generation: GenerationConfig,
}

/// Server binding settings.
///
/// - `host = "127.0.0.1"`: localhost only (development)
/// - `host = "0.0.0.0"`: accept connections from any address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Session admission and lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Concurrent voice sessions allowed per user id.
    pub max_sessions_per_user: usize,
    /// Quiet period after a barge-in before new turns are accepted.
    pub stop_cooldown_ms: u64,
}

/// Streaming speech-recognition vendor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// WebSocket endpoint of the recognition vendor.
    pub endpoint: String,
    /// BCP-47 language tag sent with each stream.
    pub language: String,
    /// Sample rate of the inbound PCM16 audio, in hertz.
    pub sample_rate: u32,
}

/// Speech-synthesis vendor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// HTTP endpoint of the synthesis vendor.
    pub endpoint: String,
    pub language: String,
    /// Vendor voice name.
    pub voice: String,
    /// Output sample rate requested from the vendor, in hertz.
    pub sample_rate: u32,
    /// Output encoding requested from the vendor.
    pub encoding: String,
}

/// Text-generation endpoint settings.
///
/// With an empty `endpoint` the server runs in echo mode: each final
/// transcript is spoken back verbatim. Useful for wiring up clients before
/// the generation backend exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub endpoint: String,
    /// Bearer token for the generation endpoint.
    pub api_key: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            session: SessionConfig {
                max_sessions_per_user: 3,
                stop_cooldown_ms: 100,
            },
            recognition: RecognitionConfig {
                endpoint: "ws://127.0.0.1:9000/v1/listen".to_string(),
                language: "en-US".to_string(),
                sample_rate: 16000,
            },
            synthesis: SynthesisConfig {
                endpoint: "http://127.0.0.1:9001/v1/synthesize".to_string(),
                language: "en-US".to_string(),
                voice: "en-US-Standard-A".to_string(),
                sample_rate: 24000,
                encoding: "LINEAR16".to_string(),
            },
            generation: GenerationConfig {
                endpoint: String::new(),
                api_key: String::new(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: override server host
    /// - `APP_RECOGNITION__ENDPOINT=wss://stt.vendor.com/v1/listen`
    /// - `APP_GENERATION__API_KEY=...`
    /// - `HOST` / `PORT`: deployment-platform overrides
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // APP_SERVER__HOST becomes server.host. The section separator is
            // a double underscore so that field names containing single
            // underscores stay intact.
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup beats failing on the first
    /// connection.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.max_sessions_per_user == 0 {
            return Err(anyhow::anyhow!(
                "Max sessions per user must be greater than 0"
            ));
        }

        if self.recognition.endpoint.is_empty() {
            return Err(anyhow::anyhow!("Recognition endpoint must be configured"));
        }

        if self.recognition.sample_rate == 0 || self.synthesis.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if !self.generation.endpoint.is_empty() && self.generation.api_key.is_empty() {
            return Err(anyhow::anyhow!(
                "Generation endpoint is configured but no API key was provided"
            ));
        }

        Ok(())
    }

    /// Copy with the generation API key blanked, for config reporting.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.generation.api_key.is_empty() {
            copy.generation.api_key = "***".to_string();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.max_sessions_per_user, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.max_sessions_per_user = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.recognition.endpoint.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generation_key_required_with_endpoint() {
        let mut config = AppConfig::default();
        config.generation.endpoint = "https://gen.example.com/v1/stream".to_string();
        assert!(config.validate().is_err());

        config.generation.api_key = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_reach_multiword_keys() {
        // Field names with single underscores must survive the env mapping.
        std::env::set_var("APP_SESSION__MAX_SESSIONS_PER_USER", "7");
        std::env::set_var("APP_GENERATION__API_KEY", "from-env");

        let result = AppConfig::load();

        std::env::remove_var("APP_SESSION__MAX_SESSIONS_PER_USER");
        std::env::remove_var("APP_GENERATION__API_KEY");

        let config = result.unwrap();
        assert_eq!(config.session.max_sessions_per_user, 7);
        assert_eq!(config.generation.api_key, "from-env");
    }

    #[test]
    fn test_redaction_hides_api_key() {
        let mut config = AppConfig::default();
        config.generation.api_key = "secret".to_string();
        let redacted = config.redacted();
        assert_eq!(redacted.generation.api_key, "***");
        assert_eq!(redacted.server.port, config.server.port);
    }
}
