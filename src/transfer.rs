//! Calibration upload over the binary control port.
//!
//! [`AvrSession`] wraps one connection and exposes each protocol step;
//! [`run_transfer`] sequences them and guarantees a best-effort exit from
//! calibration mode when any step after entry fails.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::channels::{is_subwoofer, transfer_order, ChannelSlot, EqVariant};
use crate::coefficients::{encode_coefficients, DeviceDataType};
use crate::config::TransferConfig;
use crate::errors::{CalError, Result};
use crate::exchange::{AckMatcher, Connection, JsonMatcher, Match};
use crate::fragment::{batch_parameters, coefficient_frames, TransferPlan};
use crate::frame::{command, Frame};
use crate::multirate::convert_xt32;
use crate::params::{
    build_parameters, check_assign_bin, compare_channels, AvrInfo, AvrStatus, CalibrationChannel,
    CalibrationFile,
};
use crate::transport::{TcpTransport, Transport};

/// Curve byte of the Reference target curve, sent from `filter`.
pub const CURVE_REFERENCE: u8 = 0x01;

/// Curve byte of the Flat target curve, sent from `filterLV`.
pub const CURVE_FLAT: u8 = 0x00;

pub fn curve_name(curve: u8) -> &'static str {
    if curve == CURVE_REFERENCE {
        "Reference"
    } else {
        "Flat"
    }
}

// ============================================================================
// Session
// ============================================================================

/// Binary command channel to one receiver.
#[derive(Debug)]
pub struct AvrSession<T: Transport> {
    conn: Connection<T>,
    config: TransferConfig,
    in_calibration: bool,
}

impl AvrSession<TcpTransport> {
    /// Connect to the receiver's control port.
    pub async fn connect(host: &str, config: TransferConfig) -> Result<Self> {
        let transport = TcpTransport::connect_port(host, config.port, config.connect()).await?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> AvrSession<T> {
    pub fn new(transport: T, config: TransferConfig) -> Self {
        Self {
            conn: Connection::new(transport),
            config,
            in_calibration: false,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// True between a successful ENTER_AUDY and the matching EXIT_AUDMD.
    pub fn in_calibration(&self) -> bool {
        self.in_calibration
    }

    async fn send_frame(&self, label: &str, frame: &Frame, timeout: Duration) -> Result<()> {
        let bytes = frame.encode()?;
        self.conn
            .exchange(label, &bytes, timeout, AckMatcher::expect_ack())
            .await
            .map(|_| ())
    }

    /// Send `frame` without waiting for an ACK. A NAK or ERROR arriving
    /// within the short non-ACK window still fails the send.
    pub async fn send_unacknowledged(&self, label: &str, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        self.conn
            .exchange(
                label,
                &bytes,
                self.config.non_ack_packet(),
                AckMatcher::fire_and_forget(),
            )
            .await
            .map(|_| ())
    }

    /// Send a parameterless command and wait for its ACK.
    pub async fn command(&self, name: &str, timeout: Duration) -> Result<()> {
        self.send_frame(name, &Frame::bare(name), timeout).await
    }

    /// Send a parameterless query and parse the JSON it returns.
    pub async fn query_json(&self, name: &str) -> Result<Value> {
        let bytes = Frame::bare(name).encode()?;
        let matcher = JsonMatcher::new(self.config.json_buffer_limit);
        match self
            .conn
            .exchange(name, &bytes, self.config.command(), matcher)
            .await?
        {
            Match::Json(v) => Ok(v),
            other => Err(CalError::Malformed(format!("{name}: unexpected reply {other:?}"))),
        }
    }

    async fn query<R: DeserializeOwned>(&self, name: &str) -> Result<R> {
        Ok(serde_json::from_value(self.query_json(name).await?)?)
    }

    pub async fn avr_info(&self) -> Result<AvrInfo> {
        self.query(command::GET_AVRINF).await
    }

    pub async fn avr_status(&self) -> Result<AvrStatus> {
        self.query(command::GET_AVRSTS).await
    }

    pub async fn enter_calibration(&mut self) -> Result<()> {
        self.command(command::ENTER_AUDY, self.config.enter_calibration())
            .await?;
        self.in_calibration = true;
        info!("receiver entered calibration mode");
        Ok(())
    }

    pub async fn exit_calibration(&mut self, timeout: Duration) -> Result<()> {
        self.command(command::EXIT_AUDMD, timeout).await?;
        self.in_calibration = false;
        info!("receiver left calibration mode");
        Ok(())
    }

    /// Upload the SET_SETDAT parameters, packed into as few frames as fit.
    pub async fn send_parameters(&self, params: &[(String, Value)]) -> Result<usize> {
        let batches = batch_parameters(params, self.config.setdat_threshold)?;
        let total = batches.len();
        for (i, json) in batches.iter().enumerate() {
            let label = format!("{} {}/{}", command::SET_SETDAT, i + 1, total);
            self.send_frame(&label, &Frame::json(command::SET_SETDAT, json), self.config.command())
                .await?;
        }
        tokio::time::sleep(self.config.packet_pacing()).await;
        debug!("sent {} parameters in {total} frames", params.len());
        Ok(total)
    }

    /// INIT_COEFS for fixed-point receivers, bracketed by the receiver's
    /// reported settling time.
    pub async fn init_coefficients(&self, init_wait: Duration) -> Result<()> {
        tokio::time::sleep(init_wait * 3).await;
        self.command(command::INIT_COEFS, self.config.init_coefs())
            .await?;
        tokio::time::sleep(init_wait).await;
        Ok(())
    }

    /// Upload one curve of one channel at every configured sample rate.
    /// Returns the number of frames sent.
    pub async fn send_channel_coefficients(
        &self,
        slot: &ChannelSlot,
        curve: u8,
        coefficients: &[f64],
        data_type: DeviceDataType,
    ) -> Result<usize> {
        if coefficients.is_empty() {
            warn!("{} {}: no coefficients, skipped", slot.id, curve_name(curve));
            return Ok(0);
        }
        let plan = TransferPlan::new(coefficients.len())?;
        let words = encode_coefficients(coefficients, data_type);
        let mut sent = 0;
        for &rate in &self.config.sample_rates {
            let frames = coefficient_frames(&words, &plan, curve, rate, slot.byte)?;
            for (i, bytes) in frames.iter().enumerate() {
                let label = format!(
                    "{} {}/{} ({} {} SR{rate})",
                    command::SET_COEFDT,
                    i + 1,
                    frames.len(),
                    slot.id,
                    curve_name(curve)
                );
                self.conn
                    .exchange(&label, bytes, self.config.command(), AckMatcher::expect_ack())
                    .await?;
            }
            sent += frames.len();
            tokio::time::sleep(self.config.packet_pacing()).await;
        }
        Ok(sent)
    }

    /// Commit the upload and leave calibration mode. A failed exit is only
    /// logged since the calibration itself is already stored.
    pub async fn finalize(&mut self) -> Result<()> {
        self.command(command::FINZ_COEFS, self.config.finalize())
            .await?;
        tokio::time::sleep(self.config.packet_pacing()).await;
        self.send_frame(
            "SET_SETDAT AudyFinFlg",
            &Frame::json(command::SET_SETDAT, r#"{"AudyFinFlg":"Fin"}"#),
            self.config.command(),
        )
        .await?;
        tokio::time::sleep(self.config.packet_pacing()).await;
        if let Err(e) = self.exit_calibration(self.config.command()).await {
            warn!("EXIT_AUDMD failed after finalize ({e}); the receiver may need a power cycle");
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.is_connected().await
    }

    pub async fn close(&self) -> Result<()> {
        self.conn.close().await
    }
}

// ============================================================================
// Filter preparation
// ============================================================================

/// Filters for one channel in the form the receiver takes them.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedFilters {
    /// Sent as curve 0x01.
    pub reference: Vec<f64>,
    /// Sent as curve 0x00.
    pub flat: Vec<f64>,
}

impl PreparedFilters {
    pub fn for_curve(&self, curve: u8) -> &[f64] {
        if curve == CURVE_REFERENCE {
            &self.reference
        } else {
            &self.flat
        }
    }
}

/// Decimate XT32 filters; check the fixed lengths other engines expect.
pub fn prepare_filters(channel: &CalibrationChannel, variant: EqVariant) -> PreparedFilters {
    let mapped = channel.mapped_id();
    if variant == EqVariant::Xt32 {
        return PreparedFilters {
            reference: convert_xt32(&channel.filter),
            flat: convert_xt32(&channel.filter_lv),
        };
    }
    if let Some(expected) = variant.expected_float_count(is_subwoofer(&mapped)) {
        for (name, f) in [("filter", &channel.filter), ("filterLV", &channel.filter_lv)] {
            if f.len() != expected {
                warn!(
                    "{variant} {mapped} {name} has {} values, expected {expected}; \
                     the receiver may reject or truncate it",
                    f.len()
                );
            }
        }
    }
    PreparedFilters {
        reference: channel.filter.clone(),
        flat: channel.filter_lv.clone(),
    }
}

// ============================================================================
// Orchestration
// ============================================================================

/// What a completed transfer did.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSummary {
    pub data_type: DeviceDataType,
    /// Channels uploaded, in upload order.
    pub channels: Vec<String>,
    /// Active receiver channels the calibration did not cover.
    pub untouched: Vec<String>,
    pub parameter_frames: usize,
    pub coefficient_frames: usize,
}

/// Upload `calibration` to the receiver behind `session`.
///
/// On failure after calibration mode was entered, EXIT_AUDMD is attempted
/// with the short error timeout before the original error is returned.
/// The connection is closed either way.
pub async fn run_transfer<T: Transport>(
    session: &mut AvrSession<T>,
    calibration: &CalibrationFile,
) -> Result<TransferSummary> {
    let outcome = transfer_steps(session, calibration).await;
    if let Err(e) = &outcome {
        error!("calibration transfer failed: {e}");
        if session.in_calibration() && session.is_connected().await {
            warn!("attempting to exit calibration mode after error");
            let timeout = session.config().exit_on_error();
            match session.exit_calibration(timeout).await {
                Ok(()) => warn!("calibration mode exited after error"),
                Err(exit) => error!(
                    "failed to exit calibration mode ({exit}); power-cycle the receiver"
                ),
            }
        } else if session.in_calibration() {
            warn!("connection lost inside calibration mode; power-cycle the receiver if it is stuck");
        }
    }
    if let Err(e) = session.close().await {
        warn!("closing control connection: {e}");
    }
    outcome
}

async fn transfer_steps<T: Transport>(
    session: &mut AvrSession<T>,
    calibration: &CalibrationFile,
) -> Result<TransferSummary> {
    let variant = calibration.variant()?;
    let info = session.avr_info().await?;
    let status = session.avr_status().await?;
    let dtype = info.dtype.clone().unwrap_or_default();
    let data_type = DeviceDataType::from_dtype(&dtype);
    let active = status.active_channels()?;
    info!(
        "receiver data type {}, active channels [{}]",
        if dtype.is_empty() { "unknown" } else { dtype.as_str() },
        active.join(", ")
    );

    let untouched = compare_channels(calibration, &active)?;
    check_assign_bin(calibration, &status);

    let covered: Vec<String> = active
        .iter()
        .filter(|id| !untouched.contains(id))
        .cloned()
        .collect();
    let slots = transfer_order(&covered, variant, calibration.has_griffin_lite_dsp);
    if slots.is_empty() && !covered.is_empty() {
        return Err(CalError::Config(
            "no active channel has a protocol byte mapping".into(),
        ));
    }
    // Validate before touching the receiver.
    let params = build_parameters(&status, calibration, &slots)?;

    session.enter_calibration().await?;
    let parameter_frames = session.send_parameters(&params).await?;

    if DeviceDataType::requires_init(&dtype) {
        let wait = Duration::from_millis(info.init_wait_ms());
        session.init_coefficients(wait).await?;
    }

    let mut prepared: HashMap<&str, PreparedFilters> = HashMap::new();
    for slot in &slots {
        match calibration.channel(&slot.mapped_id) {
            Some(ch) if !ch.filter.is_empty() && !ch.filter_lv.is_empty() => {
                prepared.insert(slot.id.as_str(), prepare_filters(ch, variant));
            }
            _ => warn!("{}: filters missing in calibration file, skipped", slot.id),
        }
    }

    let mut coefficient_frames = 0;
    let curves = session.config().target_curves.clone();
    for curve in curves {
        info!("uploading {} curve filters", curve_name(curve));
        for slot in &slots {
            let Some(filters) = prepared.get(slot.id.as_str()) else {
                continue;
            };
            debug!("channel {} (byte {:#04x})", slot.id, slot.byte);
            coefficient_frames += session
                .send_channel_coefficients(slot, curve, filters.for_curve(curve), data_type)
                .await?;
            tokio::time::sleep(session.config().packet_pacing()).await;
        }
        tokio::time::sleep(session.config().curve_pacing()).await;
    }

    session.finalize().await?;
    info!("all calibration settings transferred");
    Ok(TransferSummary {
        data_type,
        channels: slots
            .iter()
            .filter(|s| prepared.contains_key(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect(),
        untouched,
        parameter_frames,
        coefficient_frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode, Decoded};
    use crate::mock::{MockTransport, SentLog};

    fn fast_config() -> TransferConfig {
        TransferConfig {
            command_ms: 100,
            finalize_ms: 100,
            enter_calibration_ms: 100,
            init_coefs_ms: 100,
            exit_on_error_ms: 100,
            packet_pacing_ms: 0,
            curve_pacing_ms: 0,
            ..TransferConfig::default()
        }
    }

    fn json_reply(cmd: &str, json: &str) -> Vec<u8> {
        let mut f = Frame::json(cmd, json);
        f.marker = crate::frame::DEVICE_MARKER;
        f.encode().unwrap()
    }

    fn sent_commands(log: &SentLog) -> Vec<String> {
        log.all()
            .iter()
            .map(|b| match decode(b) {
                Decoded::Frame { frame, .. } => frame.command,
                _ => panic!("host sent an undecodable frame"),
            })
            .collect()
    }

    const INFO: &str = r#"{"DType":"float","EQType":"MultEQ","CoefWaitTime":{"Init":0}}"#;
    const STATUS: &str = r#"{"ChSetup":[{"FL":"S"},{"FR":"S"},{"SWMIX1":"E"}],
        "AmpAssign":"Standard","AssignBin":"00","SWSetup":{"SWNum":1}}"#;

    fn calibration() -> CalibrationFile {
        let ch = |id: &str, kind: &str, n: usize| {
            serde_json::json!({
                "commandId": id, "speakerType": kind, "distanceInMeters": 3.0,
                "trimAdjustmentInDbs": 0.0, "xover": 80,
                "filter": vec![0.25; n], "filterLV": vec![0.5; n]
            })
        };
        let doc = serde_json::json!({
            "eqType": 0, "lpfForLFE": 120, "bassMode": "LFE", "ampAssignInfo": "00",
            "channels": [ch("FL", "S", 128), ch("FR", "S", 128), ch("SW1", "E", 512)]
        });
        CalibrationFile::from_json_str(&doc.to_string()).unwrap()
    }

    /// Script the replies for a complete MultEQ float transfer.
    fn script_happy_path(mock: &mut MockTransport) {
        mock.reply(&json_reply("GET_AVRINF", INFO));
        mock.reply(&json_reply("GET_AVRSTS", STATUS));
        mock.reply(b"ACK"); // ENTER_AUDY
        mock.reply(b"ACK"); // SET_SETDAT
        // 2 curves x (FL, FR: 2 packets; SW1: 5 packets) x 3 sample rates
        for _ in 0..(2 * (2 + 2 + 5) * 3) {
            mock.reply(b"ACK");
        }
        mock.reply_chunks(vec![b"INPROGRESS".to_vec(), b"ACK".to_vec()]); // FINZ_COEFS
        mock.reply(b"ACK"); // AudyFinFlg
        mock.reply(b"ACK"); // EXIT_AUDMD
    }

    #[tokio::test]
    async fn full_transfer_sequence() {
        let mut mock = MockTransport::new();
        script_happy_path(&mut mock);
        let log = mock.sent_log();
        let mut session = AvrSession::new(mock, fast_config());

        let summary = run_transfer(&mut session, &calibration()).await.unwrap();
        assert_eq!(summary.data_type, DeviceDataType::Float);
        assert_eq!(summary.channels, vec!["FL", "FR", "SWMIX1"]);
        assert_eq!(summary.coefficient_frames, 54);
        assert_eq!(summary.parameter_frames, 1);
        assert!(summary.untouched.is_empty());

        let cmds = sent_commands(&log);
        assert_eq!(&cmds[..4], &["GET_AVRINF", "GET_AVRSTS", "ENTER_AUDY", "SET_SETDAT"]);
        assert!(cmds[4..58].iter().all(|c| c == "SET_COEFDT"));
        assert_eq!(&cmds[58..], &["FINZ_COEFS", "SET_SETDAT", "EXIT_AUDMD"]);
        assert!(!session.in_calibration());
    }

    #[tokio::test]
    async fn first_coefficient_packet_carries_curve_rate_and_channel() {
        let mut mock = MockTransport::new();
        script_happy_path(&mut mock);
        let log = mock.sent_log();
        let mut session = AvrSession::new(mock, fast_config());
        run_transfer(&mut session, &calibration()).await.unwrap();

        let Decoded::Frame { frame, .. } = decode(&log.all()[4]) else {
            panic!("bad frame");
        };
        // Flat curve first, sample rate 0, FL.
        let fl = crate::channels::channel_byte("FL", EqVariant::MultEq, false).unwrap();
        assert_eq!(&frame.payload[..4], &[CURVE_FLAT, 0x00, fl, 0x00]);
        assert_eq!(&frame.payload[4..8], &0.5f32.to_le_bytes());
        assert_eq!((frame.seq, frame.last_seq), (0, 1));
    }

    #[tokio::test]
    async fn rejection_after_entry_exits_calibration_mode() {
        let mut mock = MockTransport::new();
        mock.reply(&json_reply("GET_AVRINF", INFO));
        mock.reply(&json_reply("GET_AVRSTS", STATUS));
        mock.reply(b"ACK"); // ENTER_AUDY
        mock.reply(b"NAK"); // SET_SETDAT
        mock.reply(b"ACK"); // EXIT_AUDMD
        let log = mock.sent_log();
        let mut session = AvrSession::new(mock, fast_config());

        let err = run_transfer(&mut session, &calibration()).await.unwrap_err();
        assert!(matches!(err, CalError::ProtocolReject { .. }));
        assert_eq!(sent_commands(&log).last().unwrap(), "EXIT_AUDMD");
        assert!(!session.in_calibration());
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn failure_before_entry_sends_no_exit() {
        let mut mock = MockTransport::new();
        mock.reply(&json_reply("GET_AVRINF", INFO));
        mock.reply(&json_reply(
            "GET_AVRSTS",
            r#"{"ChSetup":[{"FL":"S"}],"AmpAssign":"Standard","AssignBin":"00"}"#,
        ));
        let log = mock.sent_log();
        let mut session = AvrSession::new(mock, fast_config());

        // FR and SW1 are not active on the receiver.
        assert!(matches!(
            run_transfer(&mut session, &calibration()).await,
            Err(CalError::Config(_))
        ));
        assert_eq!(sent_commands(&log), vec!["GET_AVRINF", "GET_AVRSTS"]);
    }

    #[tokio::test]
    async fn fixed_point_receivers_get_init_coefs() {
        let mut mock = MockTransport::new();
        mock.reply(&json_reply(
            "GET_AVRINF",
            r#"{"DType":"fixedA","CoefWaitTime":{"Init":1}}"#,
        ));
        mock.reply(&json_reply("GET_AVRSTS", STATUS));
        mock.reply(b"ACK").reply(b"ACK"); // ENTER_AUDY, SET_SETDAT
        mock.silence(); // INIT_COEFS times out
        mock.reply(b"ACK"); // EXIT_AUDMD
        let log = mock.sent_log();
        let mut session = AvrSession::new(mock, fast_config());

        let err = run_transfer(&mut session, &calibration()).await.unwrap_err();
        assert!(err.is_timeout());
        let cmds = sent_commands(&log);
        assert_eq!(&cmds[4..], &["INIT_COEFS", "EXIT_AUDMD"]);
    }

    #[tokio::test]
    async fn exit_failure_after_finalize_is_not_fatal() {
        let mut mock = MockTransport::new();
        mock.reply(b"ACK").reply(b"ACK").silence();
        let mut session = AvrSession::new(mock, fast_config());
        session.in_calibration = true;
        session.finalize().await.unwrap();
        assert!(session.in_calibration());
    }

    #[tokio::test]
    async fn json_query_parses_reply() {
        let mut mock = MockTransport::new();
        mock.reply(&json_reply("GET_AVRINF", INFO));
        let session = AvrSession::new(mock, fast_config());
        let info = session.avr_info().await.unwrap();
        assert_eq!(info.dtype.as_deref(), Some("float"));
    }

    #[tokio::test]
    async fn unacknowledged_send_passes_on_silence_and_fails_on_nak() {
        let mut mock = MockTransport::new();
        mock.silence();
        mock.reply(b"NAK");
        let log = mock.sent_log();
        let session = AvrSession::new(mock, fast_config());
        let frame = Frame::json(command::SET_SETDAT, r#"{"AudyDynEq":false}"#);

        session.send_unacknowledged("SET_SETDAT", &frame).await.unwrap();
        let err = session.send_unacknowledged("SET_SETDAT", &frame).await.unwrap_err();
        assert!(matches!(err, CalError::ProtocolReject { .. }), "{err:?}");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn xt32_filters_are_decimated() {
        let ch = CalibrationChannel {
            command_id: "SW1".into(),
            speaker_type: Some("E".into()),
            distance_in_meters: Some(1.0),
            trim_adjustment_in_dbs: Some(0.0),
            xover: None,
            filter: vec![0.0; 16055],
            filter_lv: vec![0.0; 100],
        };
        let p = prepare_filters(&ch, EqVariant::Xt32);
        assert_eq!(p.reference.len(), 704);
        assert_eq!(p.flat.len(), 100);

        let p = prepare_filters(&ch, EqVariant::Xt);
        assert_eq!(p.for_curve(CURVE_REFERENCE).len(), 16055);
        assert_eq!(p.for_curve(CURVE_FLAT).len(), 100);
    }
}
