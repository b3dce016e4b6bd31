//! Runtime tunables: ports, timeouts and pacing.
//!
//! Every field has a receiver-proven default. A JSON file may override any
//! subset, e.g.
//!
//! ```json
//! { "transfer": { "command_ms": 8000 }, "telnet": { "max_retries": 2 } }
//! ```
//!
//! Durations are stored in milliseconds and exposed as [`Duration`]s.

use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::{CalError, Result};
use crate::exchange::RetryPolicy;

/// Binary control port.
pub const CONTROL_PORT: u16 = 1256;

/// Legacy line-text control port.
pub const TELNET_PORT: u16 = 23;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// Coefficient and parameter upload over the binary port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub port: u16,
    pub connect_ms: u64,
    pub command_ms: u64,
    pub finalize_ms: u64,
    pub enter_calibration_ms: u64,
    pub init_coefs_ms: u64,
    /// Window after a fire-and-forget send in which a rejection still counts.
    pub non_ack_packet_ms: u64,
    pub exit_on_error_ms: u64,
    /// Pause after each sample-rate batch and each channel.
    pub packet_pacing_ms: u64,
    /// Pause between target curves.
    pub curve_pacing_ms: u64,
    /// Largest SET_SETDAT frame in bytes.
    pub setdat_threshold: usize,
    /// Abort a JSON status query once this many bytes arrive without a parse.
    pub json_buffer_limit: usize,
    pub target_curves: Vec<u8>,
    pub sample_rates: Vec<u8>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            port: CONTROL_PORT,
            connect_ms: 5000,
            command_ms: 5000,
            finalize_ms: 15000,
            enter_calibration_ms: 3000,
            init_coefs_ms: 10000,
            non_ack_packet_ms: 50,
            exit_on_error_ms: 3000,
            packet_pacing_ms: 20,
            curve_pacing_ms: 100,
            setdat_threshold: 510,
            json_buffer_limit: 8 * 1024,
            target_curves: vec![0x00, 0x01],
            sample_rates: vec![0x00, 0x01, 0x02],
        }
    }
}

impl TransferConfig {
    pub fn connect(&self) -> Duration {
        ms(self.connect_ms)
    }
    pub fn command(&self) -> Duration {
        ms(self.command_ms)
    }
    pub fn finalize(&self) -> Duration {
        ms(self.finalize_ms)
    }
    pub fn enter_calibration(&self) -> Duration {
        ms(self.enter_calibration_ms)
    }
    pub fn init_coefs(&self) -> Duration {
        ms(self.init_coefs_ms)
    }
    pub fn non_ack_packet(&self) -> Duration {
        ms(self.non_ack_packet_ms)
    }
    pub fn exit_on_error(&self) -> Duration {
        ms(self.exit_on_error_ms)
    }
    pub fn packet_pacing(&self) -> Duration {
        ms(self.packet_pacing_ms)
    }
    pub fn curve_pacing(&self) -> Duration {
        ms(self.curve_pacing_ms)
    }
}

/// Line-text setup channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetConfig {
    pub port: u16,
    pub connect_ms: u64,
    pub command_ms: u64,
    pub query_ms: u64,
    pub preset_query_ms: u64,
    pub power_on_delay_ms: u64,
    pub set_settle_ms: u64,
    pub max_retries: u32,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            port: TELNET_PORT,
            connect_ms: 5000,
            command_ms: 3000,
            query_ms: 3500,
            preset_query_ms: 5000,
            power_on_delay_ms: 5000,
            set_settle_ms: 750,
            max_retries: 0,
        }
    }
}

impl TelnetConfig {
    pub fn connect(&self) -> Duration {
        ms(self.connect_ms)
    }
    pub fn command(&self) -> Duration {
        ms(self.command_ms)
    }
    pub fn query(&self) -> Duration {
        ms(self.query_ms)
    }
    pub fn preset_query(&self) -> Duration {
        ms(self.preset_query_ms)
    }
    pub fn power_on_delay(&self) -> Duration {
        ms(self.power_on_delay_ms)
    }
    pub fn set_settle(&self) -> Duration {
        ms(self.set_settle_ms)
    }

    /// Retry schedule for timed-out commands.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_retries)
    }
}

/// Microphone measurement commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    pub port: u16,
    pub connect_ms: u64,
    pub command_ms: u64,
    pub enter_calibration_ms: u64,
    /// Idle limit while a channel sweep is running.
    pub start_channel_ms: u64,
    /// Idle limit between impulse-response packets.
    pub get_response_ms: u64,
    pub init_delay_ms: u64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            port: CONTROL_PORT,
            connect_ms: 5000,
            command_ms: 10000,
            enter_calibration_ms: 3000,
            start_channel_ms: 12000,
            get_response_ms: 20000,
            init_delay_ms: 15000,
        }
    }
}

impl MeasurementConfig {
    pub fn connect(&self) -> Duration {
        ms(self.connect_ms)
    }
    pub fn command(&self) -> Duration {
        ms(self.command_ms)
    }
    pub fn enter_calibration(&self) -> Duration {
        ms(self.enter_calibration_ms)
    }
    pub fn start_channel(&self) -> Duration {
        ms(self.start_channel_ms)
    }
    pub fn get_response(&self) -> Duration {
        ms(self.get_response_ms)
    }
    pub fn init_delay(&self) -> Duration {
        ms(self.init_delay_ms)
    }
}

/// All tunables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transfer: TransferConfig,
    pub telnet: TelnetConfig,
    pub measurement: MeasurementConfig,
}

impl Config {
    /// Parse a JSON override document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load overrides from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CalError::Config(format!("cannot read {}: {e}", path.display())))?;
        debug!("loaded configuration from {}", path.display());
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.transfer.target_curves.is_empty() || self.transfer.sample_rates.is_empty() {
            return Err(CalError::Config(
                "target_curves and sample_rates must not be empty".into(),
            ));
        }
        if self.transfer.setdat_threshold < 64 {
            return Err(CalError::Config(format!(
                "setdat_threshold {} leaves no room for parameters",
                self.transfer.setdat_threshold
            )));
        }
        Ok(())
    }
}
