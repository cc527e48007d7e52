//! Engine configuration: a TOML file plus `PAGI_REALTIME_*` environment overrides.
//!
//! ```toml
//! [primary]
//! name = "live-primary"
//! url = "wss://voice.example/v1/live"
//!
//! [backup]
//! name = "live-backup"
//! url = "wss://voice-backup.example/v1/live"
//!
//! [barge_in]
//! min_legible_words = 2
//!
//! [[tools]]
//! name = "lookup_order"
//! url = "http://localhost:8080/tools/lookup_order"
//! ```

use crate::codec::DEFAULT_WIRE_SAMPLE_RATE;
use crate::error::ConfigError;
use crate::playback::PlaybackConfig;
use crate::tools::{ExternalToolDefinition, ToolDeclaration};
use crate::transport::{Endpoint, SessionSetup};
use crate::turn::BargeInConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

fn default_wire_sample_rate() -> u32 {
    DEFAULT_WIRE_SAMPLE_RATE
}

fn default_capture_frame_size() -> usize {
    4096
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Microphone side of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Rate of PCM sent to the model (default: 16000 Hz)
    #[serde(default = "default_wire_sample_rate")]
    pub wire_sample_rate: u32,

    /// Samples per captured frame for native capture (default: 4096)
    #[serde(default = "default_capture_frame_size")]
    pub capture_frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            wire_sample_rate: default_wire_sample_rate(),
            capture_frame_size: default_capture_frame_size(),
        }
    }
}

/// Connection setup shared by both endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Per-endpoint connect timeout (default: 10s)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub system_instruction: Option<String>,

    #[serde(default)]
    pub voice: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            system_instruction: None,
            voice: None,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub barge_in: BargeInConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub primary: Endpoint,

    #[serde(default)]
    pub backup: Option<Endpoint>,

    /// Externally defined tools
    #[serde(default)]
    pub tools: Vec<ExternalToolDefinition>,
}

impl EngineConfig {
    /// Default path for the engine configuration file
    pub fn default_path() -> PathBuf {
        PathBuf::from("pagi_realtime.toml")
    }

    /// Load from `path`, apply env overrides and validate.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        info!("⚙️ Loaded realtime config from {}", path.display());
        Ok(config)
    }

    /// Parse without env overrides or validation.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `PAGI_REALTIME_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the process env in production).
    ///
    /// Recognised keys: `PAGI_REALTIME_PRIMARY_URL`, `PAGI_REALTIME_PRIMARY_MODEL`,
    /// `PAGI_REALTIME_BACKUP_URL`, `PAGI_REALTIME_BACKUP_MODEL`, `PAGI_REALTIME_API_KEY`,
    /// `PAGI_REALTIME_CONNECT_TIMEOUT_MS`, `PAGI_REALTIME_BARGE_IN_WORDS`,
    /// `PAGI_REALTIME_SETTLE_DELAY_MS`, `PAGI_REALTIME_WIRE_SAMPLE_RATE`, `PAGI_REALTIME_VOICE`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env_string(&lookup, key);

        if let Some(url) = get("PAGI_REALTIME_PRIMARY_URL") {
            self.primary.url = url;
        }
        if let Some(model) = get("PAGI_REALTIME_PRIMARY_MODEL") {
            self.primary.model = Some(model);
        }
        if let Some(url) = get("PAGI_REALTIME_BACKUP_URL") {
            self.backup
                .get_or_insert_with(|| Endpoint::new("backup", ""))
                .url = url;
        }
        if let (Some(model), Some(backup)) = (get("PAGI_REALTIME_BACKUP_MODEL"), self.backup.as_mut()) {
            backup.model = Some(model);
        }
        if let Some(key) = get("PAGI_REALTIME_API_KEY") {
            for endpoint in std::iter::once(&mut self.primary).chain(self.backup.as_mut()) {
                if endpoint.api_key.is_none() {
                    endpoint.api_key = Some(key.clone());
                }
            }
        }
        if let Some(voice) = get("PAGI_REALTIME_VOICE") {
            self.connection.voice = Some(voice);
        }

        env_parse(&lookup, "PAGI_REALTIME_CONNECT_TIMEOUT_MS", &mut self.connection.connect_timeout_ms);
        env_parse(&lookup, "PAGI_REALTIME_BARGE_IN_WORDS", &mut self.barge_in.min_legible_words);
        env_parse(&lookup, "PAGI_REALTIME_SETTLE_DELAY_MS", &mut self.playback.settle_delay_ms);
        env_parse(&lookup, "PAGI_REALTIME_WIRE_SAMPLE_RATE", &mut self.audio.wire_sample_rate);

        if self.primary.name.is_empty() {
            self.primary.name = "primary".to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary.url.trim().is_empty() {
            return Err(ConfigError::Invalid("primary endpoint url is empty".to_string()));
        }
        if let Some(backup) = &self.backup {
            if backup.url.trim().is_empty() {
                return Err(ConfigError::Invalid("backup endpoint url is empty".to_string()));
            }
        }
        if self.barge_in.min_legible_words == 0 {
            return Err(ConfigError::Invalid(
                "barge_in.min_legible_words must be at least 1".to_string(),
            ));
        }
        if self.audio.wire_sample_rate == 0 || self.playback.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample rates must be non-zero".to_string()));
        }
        if self.playback.channels == 0 {
            return Err(ConfigError::Invalid("playback.channels must be at least 1".to_string()));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection.connect_timeout_ms must be non-zero".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(ConfigError::Invalid("tool name is empty".to_string()));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate tool '{}'", tool.name)));
            }
        }
        Ok(())
    }

    /// Connection setup offered to both endpoints.
    pub fn session_setup(&self, tool_declarations: Vec<ToolDeclaration>) -> SessionSetup {
        SessionSetup {
            input_sample_rate: self.audio.wire_sample_rate,
            output_sample_rate: self.playback.sample_rate,
            tool_declarations,
            system_instruction: self.connection.system_instruction.clone(),
            voice: self.connection.voice.clone(),
        }
    }
}

fn env_string<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = env_string(lookup, key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring {}={:?}: not a valid number", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [primary]
        name = "live"
        url = "wss://primary.test/live"
    "#;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let config = EngineConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.audio.wire_sample_rate, 16_000);
        assert_eq!(config.barge_in.min_legible_words, 2);
        assert_eq!(config.playback.settle_delay_ms, 200);
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(10));
        assert!(config.backup.is_none());
        assert!(config.tools.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn full_file_parses() {
        let config = EngineConfig::from_toml_str(
            r#"
            [primary]
            name = "live"
            url = "wss://primary.test/live"
            model = "voice-large"

            [backup]
            name = "fallback"
            url = "wss://backup.test/live"

            [barge_in]
            min_legible_words = 3
            fillers = ["um", "erm"]

            [playback]
            settle_delay_ms = 350

            [[tools]]
            name = "lookup_order"
            description = "Find an order"
            url = "http://localhost:9000/lookup"
            "#,
        )
        .unwrap();
        assert_eq!(config.backup.as_ref().map(|b| b.name.as_str()), Some("fallback"));
        assert_eq!(config.barge_in.min_legible_words, 3);
        assert_eq!(config.barge_in.fillers, vec!["um", "erm"]);
        assert_eq!(config.playback.settle_delay(), Duration::from_millis(350));
        assert_eq!(config.playback.sample_rate, 24_000);
        assert_eq!(config.tools[0].timeout_ms, 10_000);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = EngineConfig::from_toml_str(MINIMAL).unwrap();
        config.apply_overrides_from(lookup(&[
            ("PAGI_REALTIME_PRIMARY_URL", "wss://override.test"),
            ("PAGI_REALTIME_BACKUP_URL", "wss://backup-env.test"),
            ("PAGI_REALTIME_API_KEY", "secret"),
            ("PAGI_REALTIME_BARGE_IN_WORDS", "4"),
            ("PAGI_REALTIME_SETTLE_DELAY_MS", "not-a-number"),
        ]));

        assert_eq!(config.primary.url, "wss://override.test");
        let backup = config.backup.as_ref().unwrap();
        assert_eq!(backup.url, "wss://backup-env.test");
        assert_eq!(backup.api_key.as_deref(), Some("secret"));
        assert_eq!(config.primary.api_key.as_deref(), Some("secret"));
        assert_eq!(config.barge_in.min_legible_words, 4);
        assert_eq!(config.playback.settle_delay_ms, 200);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = EngineConfig::from_toml_str(MINIMAL).unwrap();
        config.barge_in.min_legible_words = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = EngineConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("primary endpoint url"));

        let mut config = EngineConfig::from_toml_str(MINIMAL).unwrap();
        let tool = ExternalToolDefinition {
            name: "dup".to_string(),
            description: String::new(),
            parameters: serde_json::json!({}),
            url: None,
            timeout_ms: 1_000,
        };
        config.tools = vec![tool.clone(), tool];
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn load_from_path_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = EngineConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.primary.name, "live");

        let missing = EngineConfig::load_from_path(Path::new("/nonexistent/pagi_realtime.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        broken.write_all(b"[primary\nurl=").unwrap();
        assert!(matches!(
            EngineConfig::load_from_path(broken.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn session_setup_mirrors_config() {
        let config = EngineConfig::from_toml_str(MINIMAL).unwrap();
        let setup = config.session_setup(vec![ToolDeclaration::builtin("web_search").unwrap()]);
        assert_eq!(setup.input_sample_rate, 16_000);
        assert_eq!(setup.output_sample_rate, 24_000);
        assert_eq!(setup.tool_declarations.len(), 1);
    }
}
