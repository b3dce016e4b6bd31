//! Request/response exchanges over one connection.
//!
//! An exchange writes one request and then feeds every inbound chunk to a
//! [`ResponseMatcher`] until the matcher resolves it, the idle deadline
//! passes, or the peer hangs up. The binary ACK scan, line-text patterns,
//! JSON status replies, measurement reports and sequenced multi-frame
//! responses are all matchers driven by the same loop.
//!
//! A [`Connection`] holds its transport behind an async mutex that is held
//! for the whole exchange, so at most one request is outstanding per
//! connection.

use std::time::Duration;

use log::{debug, trace, warn};
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::{CalError, Result};
use crate::fragment::Reassembler;
use crate::frame::{self, Decoded};
use crate::transport::Transport;

const READ_CHUNK: usize = 4096;

/// Inbound bytes the ACK scan tolerates before warning.
const ACK_BUFFER_WARN: usize = 2048;

// ============================================================================
// Matching
// ============================================================================

/// Successful resolution of an exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Match {
    /// The receiver acknowledged.
    Ack,
    /// Fire-and-forget send; nothing rejected it in time.
    Sent,
    /// The line that satisfied a text pattern.
    Line(String),
    /// A parsed JSON reply.
    Json(Value),
    /// A reassembled multi-frame payload.
    Payload(Vec<u8>),
}

/// Verdict after one inbound chunk.
#[derive(Debug)]
pub enum Scan {
    /// Keep waiting on the current deadline.
    Pending,
    /// Keep waiting and restart the idle deadline.
    Extend,
    Matched(Match),
    /// The receiver refused the request; carries the offending text.
    Rejected(String),
    Failed(CalError),
}

/// Strategy that decides when an exchange is over.
pub trait ResponseMatcher: Send {
    fn scan(&mut self, chunk: &[u8]) -> Scan;

    /// Called once when the idle deadline passes.
    fn expire(&mut self, command: &str, waited: Duration) -> Result<Match> {
        Err(CalError::Timeout {
            command: command.to_string(),
            waited,
        })
    }
}

/// Binary-channel acknowledgement scan.
///
/// Any `NAK`, `NACK` or `ERROR` in the accumulated reply rejects, even when
/// an `ACK` shows up in the same buffer. `INPROGRESS` restarts the deadline.
#[derive(Debug)]
pub struct AckMatcher {
    expect_ack: bool,
    buffer: Vec<u8>,
    warned: bool,
}

impl AckMatcher {
    pub fn expect_ack() -> Self {
        Self {
            expect_ack: true,
            buffer: Vec::new(),
            warned: false,
        }
    }

    /// Resolve as sent when the deadline passes without a rejection.
    pub fn fire_and_forget() -> Self {
        Self {
            expect_ack: false,
            ..Self::expect_ack()
        }
    }
}

impl ResponseMatcher for AckMatcher {
    fn scan(&mut self, chunk: &[u8]) -> Scan {
        self.buffer.extend_from_slice(chunk);
        let text = String::from_utf8_lossy(&self.buffer);

        if let Some(token) = ["NAK", "NACK", "ERROR"].iter().find(|t| text.contains(*t)) {
            return Scan::Rejected((*token).to_string());
        }
        if self.expect_ack && text.contains("ACK") {
            return Scan::Matched(Match::Ack);
        }
        if self.expect_ack && self.buffer.len() > ACK_BUFFER_WARN && !self.warned {
            warn!("{} bytes received without ACK", self.buffer.len());
            self.warned = true;
        }
        if text.contains("INPROGRESS") {
            return Scan::Extend;
        }
        Scan::Pending
    }

    fn expire(&mut self, command: &str, waited: Duration) -> Result<Match> {
        if self.expect_ack {
            Err(CalError::Timeout {
                command: command.to_string(),
                waited,
            })
        } else {
            Ok(Match::Sent)
        }
    }
}

/// How a text line is tested.
#[derive(Debug, Clone)]
pub enum LinePattern {
    /// Whole trimmed line equals the text.
    Exact(String),
    /// Case-insensitive substring.
    Contains(String),
    Regex(Regex),
}

impl LinePattern {
    /// Case-insensitive regex.
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(&format!("(?i){pattern}"))
            .map(LinePattern::Regex)
            .map_err(|e| CalError::Config(format!("bad line pattern {pattern:?}: {e}")))
    }

    /// Case-insensitive match on a line that starts with `prefix` literally.
    pub fn echo(prefix: &str) -> Result<Self> {
        Self::regex(&format!("^{}", regex::escape(prefix)))
    }

    pub fn matches(&self, line: &str) -> bool {
        match self {
            LinePattern::Exact(s) => line == s,
            LinePattern::Contains(s) => line.to_uppercase().contains(&s.to_uppercase()),
            LinePattern::Regex(re) => re.is_match(line),
        }
    }
}

/// Line-text scan: resolves on the first complete, non-empty line that
/// matches the pattern.
#[derive(Debug)]
pub struct LineMatcher {
    pattern: LinePattern,
    partial: String,
}

impl LineMatcher {
    pub fn new(pattern: LinePattern) -> Self {
        Self {
            pattern,
            partial: String::new(),
        }
    }
}

impl ResponseMatcher for LineMatcher {
    fn scan(&mut self, chunk: &[u8]) -> Scan {
        self.partial.push_str(&String::from_utf8_lossy(chunk));
        while let Some(end) = self.partial.find(['\r', '\n']) {
            let line: String = self.partial.drain(..=end).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if self.pattern.matches(line) {
                return Scan::Matched(Match::Line(line.to_string()));
            }
            trace!("unmatched line {line:?}");
        }
        Scan::Pending
    }
}

/// JSON status reply carried as the payload of one device frame.
///
/// Inbound bytes go through the frame decoder, so header and checksum bytes
/// never reach the JSON parser. Corrupt frames are skipped.
#[derive(Debug)]
pub struct JsonMatcher {
    buffer: Vec<u8>,
    received: usize,
    limit: usize,
}

impl JsonMatcher {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            received: 0,
            limit,
        }
    }
}

impl ResponseMatcher for JsonMatcher {
    fn scan(&mut self, chunk: &[u8]) -> Scan {
        self.buffer.extend_from_slice(chunk);
        self.received += chunk.len();
        loop {
            match frame::decode(&self.buffer) {
                Decoded::Incomplete => break,
                Decoded::Corrupt { error, consumed } => {
                    trace!("skipping {consumed} bytes: {error}");
                    self.buffer.drain(..consumed);
                }
                Decoded::Frame { frame, consumed } => {
                    self.buffer.drain(..consumed);
                    match serde_json::from_slice::<Value>(&frame.payload) {
                        Ok(value) => return Scan::Matched(Match::Json(value)),
                        Err(e) => warn!("{} reply is not JSON: {e}", frame.command),
                    }
                }
            }
        }
        if self.received > self.limit {
            return Scan::Failed(CalError::Malformed(format!(
                "{} bytes received without a complete JSON reply (limit {})",
                self.received, self.limit
            )));
        }
        Scan::Pending
    }
}

/// Stream of brace-delimited JSON reports; resolves on the first object
/// that carries one of `keys` with a truthy value. Every complete object
/// restarts the idle deadline.
#[derive(Debug)]
pub struct ReportMatcher {
    buffer: Vec<u8>,
    keys: &'static [&'static str],
}

impl ReportMatcher {
    pub fn new(keys: &'static [&'static str]) -> Self {
        Self {
            buffer: Vec::new(),
            keys,
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// End index of the brace-balanced object starting at `start`.
fn balanced_end(buf: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, &b) in buf.iter().enumerate().skip(start) {
        match b {
            b'{' => depth += 1,
            b'}' => depth -= 1,
            _ => {}
        }
        if depth == 0 {
            return Some(i);
        }
    }
    None
}

impl ResponseMatcher for ReportMatcher {
    fn scan(&mut self, chunk: &[u8]) -> Scan {
        self.buffer.extend_from_slice(chunk);
        let mut verdict = Scan::Pending;
        while let Some(start) = self.buffer.iter().position(|&b| b == b'{') {
            let Some(end) = balanced_end(&self.buffer, start) else {
                break;
            };
            let object: Vec<u8> = self.buffer.drain(..=end).skip(start).collect();
            match serde_json::from_slice::<Value>(&object) {
                Ok(report) => {
                    if self.keys.iter().any(|k| report.get(k).is_some_and(truthy)) {
                        return Scan::Matched(Match::Json(report));
                    }
                    trace!("interim report {report}");
                    verdict = Scan::Extend;
                }
                Err(e) => warn!("discarding unparsable report: {e}"),
            }
        }
        verdict
    }
}

/// Sequenced multi-frame response. Any inbound data restarts the deadline;
/// at idle expiry a gap is reported as `MissingPacket`.
#[derive(Debug)]
pub struct ReassemblyMatcher {
    reassembler: Reassembler,
}

impl ReassemblyMatcher {
    pub fn new(command: &str) -> Self {
        Self {
            reassembler: Reassembler::new(command),
        }
    }
}

impl ResponseMatcher for ReassemblyMatcher {
    fn scan(&mut self, chunk: &[u8]) -> Scan {
        self.reassembler.feed(chunk);
        match self.reassembler.assemble() {
            Some(payload) => Scan::Matched(Match::Payload(payload)),
            None => Scan::Extend,
        }
    }

    fn expire(&mut self, command: &str, waited: Duration) -> Result<Match> {
        match self.reassembler.gap_error() {
            Some(gap) => Err(gap),
            None => Err(CalError::Timeout {
                command: command.to_string(),
                waited,
            }),
        }
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Bounded retry for timed-out exchanges with linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub step: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        max_retries: 0,
        base: Duration::ZERO,
        step: Duration::ZERO,
    };

    /// `300 ms + attempt * 200 ms` between attempts.
    pub fn linear(max_retries: u32) -> Self {
        Self {
            max_retries,
            base: Duration::from_millis(300),
            step: Duration::from_millis(200),
        }
    }

    /// Pause after failed attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base + self.step * attempt
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One receiver connection with exclusive, sequential exchanges.
#[derive(Debug)]
pub struct Connection<T: Transport> {
    transport: Mutex<T>,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Mutex::new(transport),
        }
    }

    /// Send `request` and wait for `matcher` to resolve.
    ///
    /// `idle` bounds the wait for each step; a matcher that returns
    /// [`Scan::Extend`] restarts it.
    pub async fn exchange<M: ResponseMatcher>(
        &self,
        label: &str,
        request: &[u8],
        idle: Duration,
        mut matcher: M,
    ) -> Result<Match> {
        let mut transport = self.transport.lock().await;
        debug!("{label}: sending {} bytes", request.len());
        transport.send(request).await?;

        let mut buf = vec![0u8; READ_CHUNK];
        let mut deadline = Instant::now() + idle;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.resolve(label, matcher.expire(label, idle));
            }
            let n = match transport.receive(&mut buf, remaining).await {
                Ok(n) => n,
                Err(e) if e.is_timeout() => {
                    return self.resolve(label, matcher.expire(label, idle));
                }
                Err(e) => {
                    warn!("{label}: {e}");
                    return Err(e);
                }
            };
            match matcher.scan(&buf[..n]) {
                Scan::Pending => {}
                Scan::Extend => deadline = Instant::now() + idle,
                Scan::Matched(m) => return self.resolve(label, Ok(m)),
                Scan::Rejected(response) => {
                    warn!("{label}: rejected ({response})");
                    return Err(CalError::ProtocolReject {
                        command: label.to_string(),
                        response,
                    });
                }
                Scan::Failed(e) => return Err(e),
            }
        }
    }

    fn resolve(&self, label: &str, outcome: Result<Match>) -> Result<Match> {
        match &outcome {
            Ok(m) => debug!("{label}: resolved {}", summary(m)),
            Err(e) => debug!("{label}: failed: {e}"),
        }
        outcome
    }

    /// Run an exchange, retrying timeouts per `policy`.
    pub async fn exchange_retrying<M, F>(
        &self,
        label: &str,
        request: &[u8],
        idle: Duration,
        policy: RetryPolicy,
        make_matcher: F,
    ) -> Result<Match>
    where
        M: ResponseMatcher,
        F: Fn() -> M,
    {
        let mut attempt = 0;
        loop {
            match self.exchange(label, request, idle, make_matcher()).await {
                Err(e) if e.is_timeout() && attempt < policy.max_retries => {
                    let pause = policy.backoff(attempt);
                    debug!("{label}: attempt {} timed out, retrying in {pause:?}", attempt + 1);
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Write without waiting for any reply.
    pub async fn send_only(&self, label: &str, request: &[u8]) -> Result<()> {
        let mut transport = self.transport.lock().await;
        debug!("{label}: sending {} bytes (no reply expected)", request.len());
        transport.send(request).await
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.lock().await.close().await
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    pub fn into_inner(self) -> T {
        self.transport.into_inner()
    }
}

fn summary(m: &Match) -> String {
    match m {
        Match::Ack => "ACK".into(),
        Match::Sent => "sent".into(),
        Match::Line(l) => format!("line {l:?}"),
        Match::Json(_) => "JSON reply".into(),
        Match::Payload(p) => format!("{} byte payload", p.len()),
    }
}
