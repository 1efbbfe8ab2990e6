use std::{env, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConsoleError;

const DEFAULT_BASE_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    /// Where narration clips are served from; falls back to the backend URL.
    pub base_url: Option<String>,
    pub voice: Option<String>,
    pub batch_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            voice: None,
            batch_size: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub base_url: String,
    /// Applies to REST calls only. The evaluation stream has no timeout.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    pub human_review: bool,
    #[serde(with = "millis")]
    pub approval_poll_interval: Duration,
    #[serde(with = "millis")]
    pub policy_poll_interval: Duration,
    pub audio: AudioConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            human_review: false,
            approval_poll_interval: Duration::from_millis(750),
            policy_poll_interval: Duration::from_secs(5),
            audio: AudioConfig::default(),
        }
    }
}

impl ConsoleConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_human_review(mut self, enabled: bool) -> Self {
        self.human_review = enabled;
        self
    }

    /// Turns review on when `requested`; a configured `true` is never cleared.
    pub fn request_human_review(mut self, requested: bool) -> Self {
        self.human_review |= requested;
        self
    }

    /// Overrides the backend URL, validated like a loaded one.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Result<Self, ConsoleError> {
        self.base_url = base_url.into();
        self.validate()?;
        Ok(self)
    }

    pub fn with_policy_poll_interval(mut self, interval: Duration) -> Self {
        self.policy_poll_interval = interval;
        self
    }

    pub fn with_audio(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }

    pub fn without_audio(mut self) -> Self {
        self.audio.enabled = false;
        self
    }

    pub fn from_env() -> Result<Self, ConsoleError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Loads a YAML file and then lets environment variables override it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConsoleError> {
        let content = fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConsoleError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn audio_base_url(&self) -> &str {
        self.audio.base_url.as_deref().unwrap_or(&self.base_url)
    }

    fn apply_env(&mut self) -> Result<(), ConsoleError> {
        if let Ok(base_url) = env::var("OFFERDECK_BASE_URL") {
            self.base_url = base_url;
        }
        if let Ok(timeout_ms) = env::var("OFFERDECK_REQUEST_TIMEOUT_MS") {
            let ms = timeout_ms.parse::<u64>().map_err(|_| {
                ConsoleError::InvalidConfig(format!(
                    "OFFERDECK_REQUEST_TIMEOUT_MS must be an integer, got `{timeout_ms}`"
                ))
            })?;
            self.request_timeout = Duration::from_millis(ms);
        }
        if let Ok(flag) = env::var("OFFERDECK_HUMAN_REVIEW") {
            self.human_review = parse_flag("OFFERDECK_HUMAN_REVIEW", &flag)?;
        }
        if let Ok(flag) = env::var("OFFERDECK_AUDIO") {
            self.audio.enabled = parse_flag("OFFERDECK_AUDIO", &flag)?;
        }
        if let Ok(voice) = env::var("OFFERDECK_TTS_VOICE") {
            self.audio.voice = Some(voice);
        }

        self.validate()
    }

    fn validate(&self) -> Result<(), ConsoleError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConsoleError::InvalidConfig(format!(
                "base_url must be an http(s) URL, got `{}`",
                self.base_url
            )));
        }
        if self.audio.batch_size == 0 {
            return Err(ConsoleError::InvalidConfig(
                "audio.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConsoleError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConsoleError::InvalidConfig(format!(
            "{name} must be a boolean, got `{other}`"
        ))),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config = ConsoleConfig::from_yaml_str(
            "base_url: https://offers.example.com\nhuman_review: true\naudio:\n  voice: nova\n",
        )
        .expect("config should parse");

        assert_eq!(config.base_url, "https://offers.example.com");
        assert!(config.human_review);
        assert_eq!(config.audio.voice.as_deref(), Some("nova"));
        assert_eq!(config.audio.batch_size, 4);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.audio_base_url(), "https://offers.example.com");
    }

    #[test]
    fn rejects_non_http_base_url() {
        let error = ConsoleConfig::from_yaml_str("base_url: ftp://nope\n").unwrap_err();
        assert!(matches!(error, ConsoleError::InvalidConfig(_)));
    }

    #[test]
    fn durations_are_read_as_milliseconds() {
        let config = ConsoleConfig::from_yaml_str("policy_poll_interval: 2500\n").unwrap();
        assert_eq!(config.policy_poll_interval, Duration::from_millis(2500));
    }

    #[test]
    fn review_request_never_clears_configured_review() {
        let configured = ConsoleConfig::from_yaml_str("human_review: true\n").unwrap();
        assert!(configured.request_human_review(false).human_review);
        assert!(ConsoleConfig::default().request_human_review(true).human_review);
        assert!(!ConsoleConfig::default().request_human_review(false).human_review);
    }

    #[test]
    fn base_url_override_is_validated() {
        let config = ConsoleConfig::default()
            .with_base_url("https://offers.example.com")
            .unwrap();
        assert_eq!(config.base_url, "https://offers.example.com");

        let error = ConsoleConfig::default().with_base_url("localhost:8000").unwrap_err();
        assert!(matches!(error, ConsoleError::InvalidConfig(_)));
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert!(parse_flag("X", "on").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(parse_flag("X", "maybe").is_err());
    }
}
