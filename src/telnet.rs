//! Receiver setup over the line-text control port.
//!
//! Before an upload the receiver must be powered on, on the intended preset,
//! and have its bass management matching what the calibration assumed.
//! Commands are short ASCII lines terminated by CR; replies are lines.
//! Settings that cannot be confirmed are reported, never fatal.

use std::time::Duration;

use log::{debug, info, warn};

use crate::config::TelnetConfig;
use crate::errors::{CalError, Result};
use crate::exchange::{Connection, LineMatcher, LinePattern, Match};
use crate::params::CalibrationFile;
use crate::transport::{TcpTransport, Transport};

/// What [`TelnetSession::prepare_receiver`] applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelnetSettings {
    /// LFE low-pass frequency in Hz.
    pub lpf_for_lfe: String,
    /// Subwoofer mode, e.g. `LFE` or `L+M`.
    pub bass_mode: String,
    pub is_new_model: bool,
    /// Front bass-extraction crossover for `L+M` on newer models.
    pub xover: Option<String>,
    /// Preset (1 or 2) to store the calibration in; the current one if unset.
    pub preset: Option<u8>,
}

impl TelnetSettings {
    pub fn from_calibration(calibration: &CalibrationFile, preset: Option<u8>) -> Self {
        Self {
            lpf_for_lfe: calibration.lpf_for_lfe.to_text(),
            bass_mode: calibration.bass_mode.clone(),
            is_new_model: calibration.is_new_model,
            xover: calibration
                .channels
                .first()
                .and_then(|c| c.xover.as_ref())
                .map(|x| x.to_text()),
            preset,
        }
    }
}

/// Outcome of [`TelnetSession::prepare_receiver`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareReport {
    /// The receiver was off and a power-on was sent.
    pub powered_on: bool,
    /// Preset the calibration will land in, if the receiver has presets.
    pub preset: Option<u8>,
    /// Commands whose effect could not be confirmed.
    pub unconfirmed: Vec<String>,
}

/// One setting and how to confirm it.
struct SettingStep {
    set: String,
    /// Confirm by the receiver echoing the command.
    echo: bool,
    /// Query and the reply that proves the setting took.
    verify: Option<(String, LinePattern)>,
}

fn zero_pad3(v: &str) -> String {
    format!("{:0>3}", v.trim())
}

fn setting_steps(settings: &TelnetSettings) -> Result<Vec<SettingStep>> {
    let mode = settings.bass_mode.trim().to_uppercase();
    let lpf = zero_pad3(&settings.lpf_for_lfe);
    let query_mode = |cmd: &str| -> Result<Option<(String, LinePattern)>> {
        let pattern = LinePattern::regex(&format!("^{cmd} {}(\\r)?$", regex::escape(&mode)))?;
        Ok(Some((format!("{cmd} ?"), pattern)))
    };
    let lpf_step = SettingStep {
        set: format!("SSLFL {lpf}"),
        echo: false,
        verify: Some((
            "SSLFL ?".into(),
            LinePattern::regex(&format!("^SSLFL\\s?{}(\\r)?$", regex::escape(&lpf)))?,
        )),
    };

    let mut steps = Vec::new();
    if !settings.is_new_model {
        steps.push(SettingStep {
            set: "PSSWL OFF".into(),
            echo: true,
            verify: None,
        });
        steps.push(SettingStep {
            set: format!("SSSWM {mode}"),
            echo: false,
            verify: query_mode("SSSWM")?,
        });
    } else {
        steps.push(SettingStep {
            set: format!("SSSWO {mode}"),
            echo: false,
            verify: query_mode("SSSWO")?,
        });
        if let (true, Some(xover)) = (mode == "L+M", &settings.xover) {
            steps.push(SettingStep {
                set: "SSCFRFRO FUL".into(),
                echo: true,
                verify: None,
            });
            steps.push(SettingStep {
                set: format!("SSBELFRO {}", zero_pad3(xover)),
                echo: true,
                verify: None,
            });
        }
    }
    steps.push(lpf_step);
    Ok(steps)
}

fn line_reply(cmd: &str, reply: Match) -> Result<String> {
    match reply {
        Match::Line(line) => Ok(line),
        other => Err(CalError::Malformed(format!(
            "{cmd}: expected a reply line, got {other:?}"
        ))),
    }
}

/// Line-text command channel to one receiver.
#[derive(Debug)]
pub struct TelnetSession<T: Transport> {
    conn: Connection<T>,
    config: TelnetConfig,
}

impl TelnetSession<TcpTransport> {
    pub async fn connect(host: &str, config: TelnetConfig) -> Result<Self> {
        let transport = TcpTransport::connect_port(host, config.port, config.connect()).await?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> TelnetSession<T> {
    pub fn new(transport: T, config: TelnetConfig) -> Self {
        Self {
            conn: Connection::new(transport),
            config,
        }
    }

    /// Send `cmd` and return the first reply line matching `pattern`.
    /// Timeouts are retried per the configured retry policy.
    pub async fn execute(&self, cmd: &str, pattern: LinePattern, timeout: Duration) -> Result<String> {
        let request = format!("{cmd}\r");
        let reply = self
            .conn
            .exchange_retrying(cmd, request.as_bytes(), timeout, self.config.retry_policy(), || {
                LineMatcher::new(pattern.clone())
            })
            .await?;
        line_reply(cmd, reply)
    }

    /// Send `cmd` without waiting for any reply.
    pub async fn silent_set(&self, cmd: &str) -> Result<()> {
        self.conn
            .send_only(cmd, format!("{cmd}\r").as_bytes())
            .await
    }

    async fn power_state(&self) -> Result<String> {
        self.execute("ZM?", LinePattern::regex("ZM(ON|OFF)")?, self.config.command())
            .await
    }

    /// Current preset, or `None` if the receiver has no presets.
    async fn current_preset(&self) -> Option<u8> {
        let pattern = match LinePattern::regex(r"^SPPR\s*(1|2)(\r)?$") {
            Ok(p) => p,
            Err(e) => {
                warn!("{e}");
                return None;
            }
        };
        match self.execute("SPPR ?", pattern, self.config.preset_query()).await {
            Ok(line) => {
                let preset = line
                    .chars()
                    .rev()
                    .find(char::is_ascii_digit)
                    .and_then(|c| c.to_digit(10))
                    .and_then(|d| u8::try_from(d).ok());
                if preset.is_none() {
                    warn!("SPPR reply {line:?} carries no preset number, assuming no presets");
                }
                preset
            }
            Err(e) if e.is_timeout() => {
                info!("no reply to SPPR ?, receiver has no presets");
                None
            }
            Err(e) => {
                warn!("SPPR ? failed ({e}), assuming no presets");
                None
            }
        }
    }

    async fn select_preset(&self, current: u8, wanted: Option<u8>) -> Result<u8> {
        let target = match wanted {
            Some(p @ (1 | 2)) => p,
            Some(other) => {
                warn!("preset {other} is not 1 or 2, keeping preset {current}");
                current
            }
            None => current,
        };
        if target == current {
            info!("receiver is on preset {current}");
            return Ok(current);
        }
        let pattern = LinePattern::regex(&format!(r"^SPPR\s*{target}(\r)?$"))?;
        match self
            .execute(&format!("SPPR {target}"), pattern, self.config.preset_query())
            .await
        {
            Ok(_) => {
                info!("switched to preset {target}");
                Ok(target)
            }
            Err(e) => {
                warn!("could not switch to preset {target} ({e}), staying on preset {current}");
                Ok(current)
            }
        }
    }

    async fn apply(&self, step: &SettingStep) -> Result<bool> {
        let mut confirmed = false;
        if step.echo {
            match self
                .execute(&step.set, LinePattern::echo(&step.set)?, self.config.command())
                .await
            {
                Ok(_) => confirmed = true,
                Err(e) if step.verify.is_none() => {
                    // Older receivers apply PSSWL OFF without echoing it.
                    if step.set == "PSSWL OFF" {
                        confirmed = true;
                    } else {
                        warn!("no echo for {:?} ({e}) and no query to verify it", step.set);
                    }
                }
                Err(e) => debug!("no echo for {:?} ({e}), verifying by query", step.set),
            }
        } else {
            self.silent_set(&step.set).await?;
        }

        match &step.verify {
            Some((query, pattern)) if !confirmed => {
                tokio::time::sleep(self.config.set_settle()).await;
                match self.execute(query, pattern.clone(), self.config.query()).await {
                    Ok(line) => {
                        debug!("{:?} confirmed by {line:?}", step.set);
                        confirmed = true;
                    }
                    Err(e) => warn!("{:?} not confirmed by {query:?} ({e})", step.set),
                }
            }
            None if !step.echo => {
                tokio::time::sleep(self.config.set_settle()).await;
                confirmed = true;
            }
            _ => {}
        }
        Ok(confirmed)
    }

    /// Power on, pick the preset and apply bass management settings.
    ///
    /// # Errors
    ///
    /// Only when the power state cannot be read or a command cannot be
    /// written; unconfirmed settings are listed in the report instead.
    pub async fn prepare_receiver(&self, settings: &TelnetSettings) -> Result<PrepareReport> {
        let mut report = PrepareReport::default();

        let power = self.power_state().await?;
        if power.to_uppercase().contains("ZMOFF") {
            info!("receiver is off, powering on");
            self.execute("ZMON", LinePattern::regex("ZMON")?, self.config.command())
                .await?;
            report.powered_on = true;
            tokio::time::sleep(self.config.power_on_delay()).await;
            let power = self.power_state().await?;
            if !power.to_uppercase().contains("ZMON") {
                warn!("receiver did not report ON after ZMON, proceeding");
            }
        }

        if let Some(current) = self.current_preset().await {
            report.preset = Some(self.select_preset(current, settings.preset).await?);
        }

        for step in setting_steps(settings)? {
            if !self.apply(&step).await? {
                warn!("setting {:?} could not be confirmed, check it on the receiver", step.set);
                report.unconfirmed.push(step.set);
            }
        }
        Ok(report)
    }

    pub async fn close(&self) -> Result<()> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    #[test]
    fn only_line_replies_are_accepted() {
        assert_eq!(line_reply("ZM?", Match::Line("ZMON".into())).unwrap(), "ZMON");
        assert!(matches!(
            line_reply("ZM?", Match::Ack),
            Err(CalError::Malformed(_))
        ));
        assert!(matches!(
            line_reply("ZM?", Match::Sent),
            Err(CalError::Malformed(_))
        ));
    }

    fn session(mock: MockTransport) -> TelnetSession<MockTransport> {
        let config = TelnetConfig {
            command_ms: 50,
            query_ms: 50,
            preset_query_ms: 50,
            power_on_delay_ms: 0,
            set_settle_ms: 0,
            ..TelnetConfig::default()
        };
        TelnetSession::new(mock, config)
    }

    fn settings(new_model: bool, mode: &str) -> TelnetSettings {
        TelnetSettings {
            lpf_for_lfe: "80".into(),
            bass_mode: mode.into(),
            is_new_model: new_model,
            xover: Some("60".into()),
            preset: None,
        }
    }

    #[test]
    fn older_model_steps() {
        let steps = setting_steps(&settings(false, " lfe ")).unwrap();
        let sets: Vec<&str> = steps.iter().map(|s| s.set.as_str()).collect();
        assert_eq!(sets, vec!["PSSWL OFF", "SSSWM LFE", "SSLFL 080"]);
        let (q, p) = steps[2].verify.as_ref().unwrap();
        assert_eq!(q, "SSLFL ?");
        assert!(p.matches("SSLFL080"));
        assert!(p.matches("sslfl 080"));
        assert!(!p.matches("SSLFL 120"));
    }

    #[test]
    fn newer_model_l_plus_m_steps() {
        let steps = setting_steps(&settings(true, "L+M")).unwrap();
        let sets: Vec<&str> = steps.iter().map(|s| s.set.as_str()).collect();
        assert_eq!(sets, vec!["SSSWO L+M", "SSCFRFRO FUL", "SSBELFRO 060", "SSLFL 080"]);
        let (_, p) = steps[0].verify.as_ref().unwrap();
        assert!(p.matches("SSSWO L+M"));
        assert!(!p.matches("SSSWO LLM"));

        let steps = setting_steps(&settings(true, "LFE")).unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[tokio::test]
    async fn powers_on_selects_preset_and_applies_settings() {
        let mut mock = MockTransport::new();
        mock.reply(b"ZMOFF\r")
            .reply(b"ZMON\r")
            .reply(b"ZMON\r")
            .reply(b"SPPR 1\r")
            .reply(b"SPPR 2\r")
            .reply(b"PSSWL OFF\r")
            .silence()
            .reply(b"MV50\rSSSWM LFE\r")
            .silence()
            .reply(b"SSLFL 080\r");
        let log = mock.sent_log();
        let s = session(mock);

        let mut wanted = settings(false, "LFE");
        wanted.preset = Some(2);
        let report = s.prepare_receiver(&wanted).await.unwrap();
        assert!(report.powered_on);
        assert_eq!(report.preset, Some(2));
        assert!(report.unconfirmed.is_empty());
        assert_eq!(
            log.lines(),
            vec![
                "ZM?", "ZMON", "ZM?", "SPPR ?", "SPPR 2", "PSSWL OFF", "SSSWM LFE", "SSSWM ?",
                "SSLFL 080", "SSLFL ?",
            ]
        );
    }

    #[tokio::test]
    async fn unconfirmed_settings_are_reported_not_fatal() {
        let mut mock = MockTransport::new();
        mock.reply(b"ZMON\r")
            .silence() // SPPR ?: no presets
            .silence() // PSSWL OFF: no echo, still counted
            .silence()
            .reply(b"SSSWM MIX\r") // wrong mode
            .silence()
            .reply(b"SSLFL 080\r");
        let s = session(mock);
        let report = s.prepare_receiver(&settings(false, "LFE")).await.unwrap();
        assert!(!report.powered_on);
        assert_eq!(report.preset, None);
        assert_eq!(report.unconfirmed, vec!["SSSWM LFE"]);
    }

    #[tokio::test]
    async fn failed_preset_switch_keeps_current() {
        let mut mock = MockTransport::new();
        mock.reply(b"SPPR 1\r").silence();
        let s = session(mock);
        assert_eq!(s.select_preset(1, Some(2)).await.unwrap(), 1);
        assert_eq!(s.select_preset(1, Some(7)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn power_query_failure_is_an_error() {
        let mut mock = MockTransport::new();
        mock.silence();
        let s = session(mock);
        assert!(s.prepare_receiver(&settings(true, "LFE")).await.unwrap_err().is_timeout());
    }
}
