//! Receiver status, calibration files and the SET_SETDAT parameter list.

use std::collections::HashSet;
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::channels::{normalize_channel_id, ChannelSlot, EqVariant};
use crate::errors::{CalError, Result};

// ============================================================================
// Receiver replies
// ============================================================================

/// Fields of the `GET_AVRINF` reply this crate uses.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AvrInfo {
    #[serde(rename = "DType", default)]
    pub dtype: Option<String>,
    #[serde(rename = "EQType", default)]
    pub eq_type: Option<String>,
    #[serde(rename = "CoefWaitTime", default)]
    pub coef_wait_time: Option<CoefWaitTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct CoefWaitTime {
    /// Milliseconds the receiver needs around INIT_COEFS.
    #[serde(rename = "Init", default)]
    pub init: u64,
}

impl AvrInfo {
    pub fn init_wait_ms(&self) -> u64 {
        self.coef_wait_time.map_or(0, |w| w.init)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SwSetup {
    /// Sent as a number or a numeric string depending on firmware.
    #[serde(rename = "SWNum", default)]
    pub sw_num: Option<Value>,
}

/// Fields of the `GET_AVRSTS` reply this crate uses.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AvrStatus {
    /// One single-key object per channel: id to speaker type, `"N"` if unused.
    #[serde(rename = "ChSetup", default)]
    pub ch_setup: Option<Vec<Map<String, Value>>>,
    #[serde(rename = "AmpAssign", default)]
    pub amp_assign: Option<Value>,
    #[serde(rename = "AssignBin", default)]
    pub assign_bin: Option<String>,
    #[serde(rename = "SWSetup", default)]
    pub sw_setup: Option<SwSetup>,
}

impl AvrStatus {
    fn setup_entries(&self) -> Result<&[Map<String, Value>]> {
        self.ch_setup
            .as_deref()
            .ok_or_else(|| CalError::Config("ChSetup missing from receiver status".into()))
    }

    /// Ids of channels the receiver has configured, in reported order.
    pub fn active_channels(&self) -> Result<Vec<String>> {
        Ok(self
            .setup_entries()?
            .iter()
            .filter_map(|entry| entry.iter().next())
            .filter(|(_, kind)| kind.as_str() != Some("N"))
            .map(|(id, _)| id.clone())
            .collect())
    }

    /// Speaker type the receiver reports for `id`.
    pub fn speaker_type(&self, id: &str) -> Result<String> {
        let entry = self
            .setup_entries()?
            .iter()
            .find_map(|entry| entry.iter().next().filter(|(k, _)| k.as_str() == id))
            .ok_or_else(|| CalError::Config(format!("no setup entry for active channel {id}")))?;
        match entry.1.as_str() {
            Some(kind) if !kind.is_empty() => Ok(kind.to_string()),
            _ => Err(CalError::Config(format!(
                "receiver reported an invalid type for {id}: {}",
                entry.1
            ))),
        }
    }

    /// Subwoofer count, when the receiver reports one above zero.
    pub fn subwoofer_count(&self) -> Option<u64> {
        let raw = self.sw_setup.as_ref()?.sw_num.as_ref()?;
        let n = match raw {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }?;
        (n > 0).then_some(n)
    }
}

// ============================================================================
// Calibration file
// ============================================================================

/// A JSON scalar that firmware and tools write either as a number or text.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Text form with integral numbers written without a fraction.
    pub fn to_text(&self) -> String {
        match self {
            Scalar::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.trim().to_string(),
        }
    }

    fn is_full_range(&self) -> bool {
        matches!(self, Scalar::Text(s) if s.trim().eq_ignore_ascii_case("F"))
    }
}

/// Per-channel settings and filters produced by the optimizer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationChannel {
    pub command_id: String,
    #[serde(default)]
    pub speaker_type: Option<String>,
    #[serde(default)]
    pub distance_in_meters: Option<f64>,
    #[serde(default)]
    pub trim_adjustment_in_dbs: Option<f64>,
    #[serde(default)]
    pub xover: Option<Scalar>,
    /// Reference curve filter.
    #[serde(default)]
    pub filter: Vec<f64>,
    /// Flat curve filter.
    #[serde(default, rename = "filterLV")]
    pub filter_lv: Vec<f64>,
}

impl CalibrationChannel {
    /// Id after upper-casing and subwoofer alias normalization.
    pub fn mapped_id(&self) -> String {
        normalize_channel_id(&self.command_id.to_ascii_uppercase()).to_string()
    }
}

/// Calibration file (`.oca`) as written by the optimizer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CalibrationFile {
    #[serde(rename = "eqType")]
    pub eq_type: i64,
    pub channels: Vec<CalibrationChannel>,
    #[serde(rename = "lpfForLFE")]
    pub lpf_for_lfe: Scalar,
    #[serde(rename = "bassMode")]
    pub bass_mode: String,
    #[serde(rename = "isNewModel", default)]
    pub is_new_model: bool,
    #[serde(rename = "ampAssignInfo", default)]
    pub amp_assign_info: Option<String>,
    #[serde(rename = "hasGriffinLiteDSP", default)]
    pub has_griffin_lite_dsp: bool,
    #[serde(rename = "targetModelName", default)]
    pub target_model_name: Option<String>,
}

impl CalibrationFile {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: CalibrationFile = serde_json::from_str(text)?;
        if file.channels.is_empty() {
            return Err(CalError::Config("calibration file has no channels".into()));
        }
        file.variant()?;
        Ok(file)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CalError::Config(format!("cannot read {}: {e}", path.display())))?;
        let file = Self::from_json_str(&text)?;
        info!(
            "loaded calibration {} ({} channels, {})",
            path.display(),
            file.channels.len(),
            file.variant()?
        );
        Ok(file)
    }

    pub fn variant(&self) -> Result<EqVariant> {
        EqVariant::from_eq_type(self.eq_type)
    }

    /// Channel whose normalized id equals `mapped_id`.
    pub fn channel(&self, mapped_id: &str) -> Option<&CalibrationChannel> {
        self.channels.iter().find(|ch| ch.mapped_id() == mapped_id)
    }
}

// ============================================================================
// Channel comparison
// ============================================================================

/// Check the calibration file against the receiver's active channels.
///
/// Returns the receiver channels the file does not cover; their settings are
/// left untouched.
///
/// # Errors
///
/// `Config` when the file names a channel the receiver does not have active.
pub fn compare_channels(calibration: &CalibrationFile, active: &[String]) -> Result<Vec<String>> {
    let on_receiver: HashSet<String> = active
        .iter()
        .map(|id| normalize_channel_id(&id.to_ascii_uppercase()).to_string())
        .collect();
    let in_file: HashSet<String> = calibration.channels.iter().map(|c| c.mapped_id()).collect();

    let missing: Vec<&str> = calibration
        .channels
        .iter()
        .filter(|c| !on_receiver.contains(&c.mapped_id()))
        .map(|c| c.command_id.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(CalError::Config(format!(
            "channels [{}] are not active on the receiver (active: [{}])",
            missing.join(", "),
            active.join(", ")
        )));
    }

    let extra: Vec<String> = active
        .iter()
        .filter(|id| !in_file.contains(normalize_channel_id(&id.to_ascii_uppercase())))
        .cloned()
        .collect();
    if !extra.is_empty() {
        warn!(
            "receiver channels [{}] are not in the calibration file and will not be modified",
            extra.join(", ")
        );
    }
    Ok(extra)
}

/// Warn when the amplifier map in the file differs from the receiver's.
/// Returns whether both were present and equal.
pub fn check_assign_bin(calibration: &CalibrationFile, status: &AvrStatus) -> bool {
    match (&calibration.amp_assign_info, &status.assign_bin) {
        (Some(file), Some(receiver)) if file.trim() == receiver.trim() => {
            info!("amplifier assignment map matches the receiver");
            true
        }
        (Some(file), Some(receiver)) => {
            warn!(
                "AssignBin mismatch: file {} vs receiver {}; amp assign settings changed since \
                 the calibration was made, proceeding with the receiver's configuration",
                file.trim(),
                receiver.trim()
            );
            false
        }
        _ => {
            warn!("AssignBin comparison skipped (missing in calibration file or receiver status)");
            false
        }
    }
}

// ============================================================================
// Parameter list
// ============================================================================

const XOVER_RANGE: std::ops::RangeInclusive<f64> = 40.0..=250.0;

/// Round half up, as the receiver tools do.
fn round_half_up(v: f64) -> i64 {
    (v + 0.5).floor() as i64
}

fn entry(id: &str, value: Value) -> Value {
    let mut m = Map::new();
    m.insert(id.to_string(), value);
    Value::Object(m)
}

fn crossover_value(id: &str, channel: &CalibrationChannel, kind: &str, new_model: bool) -> Result<Option<Value>> {
    if kind == "E" || (new_model && kind == "L") {
        return Ok(Some(json!("F")));
    }
    let xover = channel
        .xover
        .as_ref()
        .ok_or_else(|| CalError::Config(format!("crossover missing for {id}")))?;
    if xover.is_full_range() {
        warn!("{id} is a small speaker with an \"F\" crossover, crossover left unset");
        return Ok(None);
    }
    match xover.as_number() {
        Some(hz) if XOVER_RANGE.contains(&hz) => Ok(Some(if hz.fract() == 0.0 {
            json!(hz as i64)
        } else {
            json!(hz)
        })),
        _ => Err(CalError::Config(format!(
            "crossover {} for {id} is outside 40..=250 Hz",
            xover.to_text()
        ))),
    }
}

/// Assemble the ordered SET_SETDAT parameters for the channels in `slots`.
///
/// # Errors
///
/// `Config` when the receiver status lacks its amp assignment, when the
/// file names a channel the receiver does not know, or when a scheduled
/// channel is missing from the file or carries invalid settings.
pub fn build_parameters(
    status: &AvrStatus,
    calibration: &CalibrationFile,
    slots: &[ChannelSlot],
) -> Result<Vec<(String, Value)>> {
    let (Some(amp_assign), Some(assign_bin)) = (&status.amp_assign, &status.assign_bin) else {
        return Err(CalError::Config(
            "AmpAssign or AssignBin missing from receiver status".into(),
        ));
    };

    let known: HashSet<String> = status
        .setup_entries()?
        .iter()
        .filter_map(|e| e.keys().next())
        .map(|id| normalize_channel_id(id).to_string())
        .collect();
    for ch in &calibration.channels {
        if !known.contains(&ch.mapped_id()) {
            return Err(CalError::Config(format!(
                "channel {} ({}) is not recognized by the receiver",
                ch.mapped_id(),
                ch.command_id
            )));
        }
    }

    let mut sp_config = Vec::new();
    let mut distance = Vec::new();
    let mut level = Vec::new();
    let mut crossover = Vec::new();
    for slot in slots {
        let id = slot.mapped_id.as_str();
        status.speaker_type(&slot.id)?;
        let channel = calibration.channel(id).ok_or_else(|| {
            CalError::Config(format!("channel {id} is active on the receiver but not in the calibration file"))
        })?;

        let kind = channel.speaker_type.as_deref().unwrap_or_default();
        if !matches!(kind, "S" | "E" | "L") {
            return Err(CalError::Config(format!(
                "invalid speakerType {kind:?} for {id}, expected S, E or L"
            )));
        }
        sp_config.push(entry(id, json!(kind)));

        let meters = channel
            .distance_in_meters
            .ok_or_else(|| CalError::Config(format!("distance missing for {id}")))?;
        distance.push(entry(id, json!(round_half_up(meters * 100.0))));

        let trim = channel
            .trim_adjustment_in_dbs
            .ok_or_else(|| CalError::Config(format!("trim missing for {id}")))?;
        level.push(entry(id, json!(round_half_up(trim * 10.0))));

        if let Some(x) = crossover_value(id, channel, kind, calibration.is_new_model)? {
            crossover.push(entry(id, x));
        }
    }

    let mut params: Vec<(String, Value)> = vec![
        ("AmpAssign".into(), amp_assign.clone()),
        ("AssignBin".into(), json!(assign_bin)),
    ];
    for (key, list) in [
        ("SpConfig", sp_config),
        ("Distance", distance),
        ("ChLevel", level),
        ("Crossover", crossover),
    ] {
        if !list.is_empty() {
            params.push((key.into(), Value::Array(list)));
        }
    }
    params.extend(
        [
            ("AudyFinFlg", json!("NotFin")),
            ("AudyDynEq", json!(false)),
            ("AudyEqRef", json!(0)),
            ("AudyDynVol", json!(false)),
            ("AudyDynSet", json!("L")),
            ("AudyMultEq", json!(true)),
            ("AudyEqSet", json!("Flat")),
            ("AudyLfc", json!(false)),
            ("AudyLfcLev", json!(3)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v)),
    );
    if let Some(n) = status.subwoofer_count() {
        params.push((
            "SWSetup".into(),
            json!({"SWNum": n, "SWMode": "Standard", "SWLayout": "N/A"}),
        ));
    }
    debug!("built {} SET_SETDAT parameters for {} channels", params.len(), slots.len());
    Ok(params)
}
