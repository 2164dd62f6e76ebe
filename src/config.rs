//! Configuration management for the CDMA connection controller

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocols::dtmf::DtmfToneType;
use crate::services::call_waiting::CALL_WAITING_TIMEOUT;
use crate::services::emergency::dialable_number;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub general: GeneralConfig,
    pub dtmf: DtmfConfig,
    pub call_waiting: CallWaitingConfig,
    pub connection: ConnectionConfig,
    pub emergency: EmergencyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtmfConfig {
    /// Unset means the platform default (normal tones)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone_type: Option<DtmfToneType>,
    #[serde(default)]
    pub burst_on_length_ms: u32,
    #[serde(default)]
    pub burst_off_length_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallWaitingConfig {
    pub timeout_ms: u64,
}

impl CallWaitingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CallWaitingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: CALL_WAITING_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub allow_mute: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    pub numbers: Vec<String>,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            numbers: vec!["911".to_string(), "112".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for daily rolling log files; console only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    pub file_prefix: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

impl ControllerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let mut settings = config::Config::builder();

        // CDMA__CALL_WAITING__TIMEOUT_MS=30000 and friends
        settings = settings.add_source(
            config::Environment::with_prefix("CDMA")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("emergency.numbers")
                .try_parsing(true),
        );

        let config = settings.build()?;
        let controller_config = config.try_deserialize()?;
        Ok(controller_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.call_waiting.timeout_ms == 0 {
            return Err(Error::parse("Call waiting timeout must be non-zero"));
        }

        for number in &self.emergency.numbers {
            if number.is_empty() || dialable_number(number) != *number {
                return Err(Error::parse(format!("Invalid emergency number: {}", number)));
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::parse("Invalid log level")),
        }

        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig {
                node_id: "cdma-connection-1".to_string(),
                description: "CDMA call signaling controller".to_string(),
            },
            dtmf: DtmfConfig {
                tone_type: None,
                burst_on_length_ms: 0,
                burst_off_length_ms: 0,
            },
            call_waiting: CallWaitingConfig::default(),
            connection: ConnectionConfig { allow_mute: true },
            emergency: EmergencyConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                directory: None,
                file_prefix: "cdma-connection".to_string(),
                format: LogFormat::Full,
            },
        }
    }
}
