//! Microphone measurement commands.
//!
//! A measurement cycle tells the receiver which position and channels are
//! being measured (`SET_POSNUM`), runs one sweep per channel (`START_CHNL`)
//! and then downloads each channel's impulse response (`GET_RESPON`).

use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::channels::measurement_order;
use crate::coefficients::{decode_coefficients, DeviceDataType};
use crate::config::MeasurementConfig;
use crate::errors::{CalError, Result};
use crate::exchange::{AckMatcher, Connection, JsonMatcher, Match, ReassemblyMatcher, ReportMatcher};
use crate::frame::{command, Frame};
use crate::transport::{TcpTransport, Transport};

const JSON_LIMIT: usize = 8 * 1024;

/// Keys that mark the final report of a channel sweep.
const FINAL_REPORT_KEYS: &[&str] = &["SpConnect", "ChReport"];

/// Fixed-point receivers measure at most this many subwoofers.
pub const FIXED_MAX_SUBWOOFERS: usize = 2;

/// Final report of one channel sweep.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ChannelReport {
    #[serde(rename = "SpConnect", default)]
    pub sp_connect: Option<Value>,
    #[serde(rename = "ChReport", default)]
    pub ch_report: Option<Value>,
    /// `"N"` normal, `"R"` reversed.
    #[serde(rename = "Polarity", default)]
    pub polarity: Option<String>,
    /// Scale to apply to this channel's impulse response.
    #[serde(rename = "ResponseCoef", default)]
    pub response_coef: Option<f64>,
    /// Speaker to microphone distance in cm.
    #[serde(rename = "Distance", default)]
    pub distance: Option<f64>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl ChannelReport {
    pub fn polarity_inverted(&self) -> bool {
        self.polarity.as_deref() == Some("R")
    }
}

/// Refuse layouts a fixed-point receiver cannot measure.
pub fn check_subwoofer_limit(data_type: DeviceDataType, subwoofers: usize) -> Result<()> {
    if data_type.is_fixed() && subwoofers > FIXED_MAX_SUBWOOFERS {
        return Err(CalError::Config(format!(
            "receiver supports at most {FIXED_MAX_SUBWOOFERS} subwoofers, {subwoofers} configured"
        )));
    }
    Ok(())
}

/// Multiply by `coef` unless it is absent or exactly 1.
fn apply_response_coef(samples: &mut [f64], coef: Option<f64>) {
    if let Some(c) = coef.filter(|c| *c != 1.0) {
        samples.iter_mut().for_each(|s| *s *= c);
    }
}

/// `SET_POSNUM` payload. The receiver firmware expects one extra `}`.
pub fn position_payload(position: u32, channels: &[String]) -> Result<String> {
    let ordered = measurement_order(channels);
    let mut text = serde_json::to_string(&json!({"Position": position, "ChSetup": ordered}))?;
    text.push('}');
    Ok(text)
}

/// Measurement command channel to one receiver.
#[derive(Debug)]
pub struct MeasurementSession<T: Transport> {
    conn: Connection<T>,
    config: MeasurementConfig,
}

impl MeasurementSession<TcpTransport> {
    pub async fn connect(host: &str, config: MeasurementConfig) -> Result<Self> {
        let transport = TcpTransport::connect_port(host, config.port, config.connect()).await?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> MeasurementSession<T> {
    pub fn new(transport: T, config: MeasurementConfig) -> Self {
        Self {
            conn: Connection::new(transport),
            config,
        }
    }

    async fn acked(&self, label: &str, frame: Frame, timeout: Duration) -> Result<()> {
        let bytes = frame.encode()?;
        self.conn
            .exchange(label, &bytes, timeout, AckMatcher::expect_ack())
            .await
            .map(|_| ())
    }

    /// Word format of measurement data. Defaults to float when the receiver
    /// does not say.
    pub async fn data_type(&self) -> Result<DeviceDataType> {
        let bytes = Frame::bare(command::GET_AVRINF).encode()?;
        let reply = self
            .conn
            .exchange(
                command::GET_AVRINF,
                &bytes,
                self.config.command(),
                JsonMatcher::new(JSON_LIMIT),
            )
            .await?;
        let dtype = match &reply {
            Match::Json(v) => v.get("DType").and_then(Value::as_str),
            _ => None,
        };
        match dtype {
            Some(d) if DeviceDataType::requires_init(d) => Ok(DeviceDataType::Fixed),
            Some(_) => Ok(DeviceDataType::Float),
            None => {
                warn!("receiver did not report DType, assuming float");
                Ok(DeviceDataType::Float)
            }
        }
    }

    pub async fn enter_calibration(&self) -> Result<()> {
        self.acked(
            command::ENTER_AUDY,
            Frame::bare(command::ENTER_AUDY),
            self.config.enter_calibration(),
        )
        .await
    }

    pub async fn exit_calibration(&self) -> Result<()> {
        self.acked(
            command::EXIT_AUDMD,
            Frame::bare(command::EXIT_AUDMD),
            self.config.command(),
        )
        .await
    }

    /// Announce the microphone position and the channels to measure there.
    pub async fn set_position(&self, position: u32, channels: &[String]) -> Result<()> {
        let payload = position_payload(position, channels)?;
        info!("position {position}: measuring {} channels", channels.len());
        self.acked(
            command::SET_POSNUM,
            Frame::json(command::SET_POSNUM, &payload),
            self.config.command(),
        )
        .await
    }

    /// Run the sweep for one channel and return its final report.
    pub async fn start_channel(&self, id: &str) -> Result<ChannelReport> {
        let payload = serde_json::to_string(&json!({ "Channel": id }))?;
        let bytes = Frame::json(command::START_CHNL, &payload).encode()?;
        let label = format!("{} {id}", command::START_CHNL);
        let reply = self
            .conn
            .exchange(
                &label,
                &bytes,
                self.config.start_channel(),
                ReportMatcher::new(FINAL_REPORT_KEYS),
            )
            .await?;
        let report: ChannelReport = match reply {
            Match::Json(value) => serde_json::from_value(value)?,
            other => {
                return Err(CalError::Malformed(format!("{label}: unexpected reply {other:?}")))
            }
        };
        if report.polarity_inverted() {
            let advice = if id.starts_with("SW") {
                "check the phase switch on the subwoofer (should be 0 or Normal)"
            } else {
                "check the speaker wiring (+ to + and - to -)"
            };
            warn!("receiver reports inverted polarity on {id}; {advice}");
        }
        debug!("{id}: sweep complete");
        Ok(report)
    }

    /// Download and decode the impulse response measured for `id`.
    ///
    /// `response_coef` comes from the channel's [`ChannelReport`].
    pub async fn impulse_response(
        &self,
        id: &str,
        data_type: DeviceDataType,
        response_coef: Option<f64>,
    ) -> Result<Vec<f64>> {
        let payload = serde_json::to_string(&json!({ "ChData": id }))?;
        let bytes = Frame::json(command::GET_RESPON, &payload).encode()?;
        let reply = self
            .conn
            .exchange(
                command::GET_RESPON,
                &bytes,
                self.config.get_response(),
                ReassemblyMatcher::new(command::GET_RESPON),
            )
            .await?;
        let raw = match reply {
            Match::Payload(raw) => raw,
            other => {
                return Err(CalError::Malformed(format!(
                    "{}: unexpected reply {other:?}",
                    command::GET_RESPON
                )))
            }
        };
        let mut samples = decode_coefficients(&raw, data_type);
        apply_response_coef(&mut samples, response_coef);
        if !samples.is_empty() && samples.iter().all(|s| *s == 0.0) {
            warn!("all-zero response for {id}; the channel may be disconnected or muted");
        }
        info!("{id}: {} samples", samples.len());
        Ok(samples)
    }

    pub async fn close(&self) -> Result<()> {
        self.conn.close().await
    }
}
