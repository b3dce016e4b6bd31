//! Splitting outbound transfers into frames and reassembling inbound ones.

use std::collections::BTreeMap;

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::coefficients::WORD_LEN;
use crate::errors::{CalError, Result};
use crate::frame::{self, command, Decoded, Frame, FRAME_OVERHEAD};

// ============================================================================
// Constants
// ============================================================================

/// Coefficients carried by the first packet, after the 4-byte header.
pub const FIRST_PACKET_FLOATS: usize = 127;

/// Coefficients carried by every later packet.
pub const MID_PACKET_FLOATS: usize = 128;

/// Largest SET_SETDAT frame the receiver accepts.
pub const SETDAT_THRESHOLD: usize = 510;

// ============================================================================
// Coefficient transfer plan
// ============================================================================

/// Packet layout for one coefficient array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub total_floats: usize,
    pub packet_count: usize,
    pub first_packet_floats: usize,
    pub mid_packet_floats: usize,
    pub last_packet_floats: usize,
    /// Value of the frame's last-sequence byte.
    pub last_seq: u8,
}

impl TransferPlan {
    /// Lay out `total_floats` coefficients.
    ///
    /// # Errors
    ///
    /// `ProtocolLimitExceeded` when more than 256 packets would be needed.
    pub fn new(total_floats: usize) -> Result<Self> {
        if total_floats == 0 {
            return Ok(Self {
                total_floats: 0,
                packet_count: 0,
                first_packet_floats: 0,
                mid_packet_floats: MID_PACKET_FLOATS,
                last_packet_floats: 0,
                last_seq: 0,
            });
        }

        let first = total_floats.min(FIRST_PACKET_FLOATS);
        let remaining = total_floats - first;
        let extra = remaining.div_ceil(MID_PACKET_FLOATS);
        let packet_count = 1 + extra;
        let last_packet_floats = if extra == 0 {
            first
        } else {
            match remaining % MID_PACKET_FLOATS {
                0 => MID_PACKET_FLOATS,
                r => r,
            }
        };

        let last_seq = u8::try_from(packet_count - 1).map_err(|_| {
            CalError::ProtocolLimitExceeded {
                packets: packet_count,
            }
        })?;

        Ok(Self {
            total_floats,
            packet_count,
            first_packet_floats: first,
            mid_packet_floats: MID_PACKET_FLOATS,
            last_packet_floats,
            last_seq,
        })
    }

    /// Number of coefficients packet `index` carries.
    pub fn floats_in_packet(&self, index: usize) -> usize {
        if index >= self.packet_count {
            0
        } else if index == 0 {
            self.first_packet_floats
        } else if index == self.packet_count - 1 {
            self.last_packet_floats
        } else {
            self.mid_packet_floats
        }
    }
}

/// Build the SET_COEFDT frames for one channel, curve and sample rate.
///
/// `words` holds the already-encoded 4-byte coefficient words. Packet 0 is
/// prefixed with `[curve, sample_rate, channel_byte, 0x00]`.
pub fn coefficient_frames(
    words: &[u8],
    plan: &TransferPlan,
    curve: u8,
    sample_rate: u8,
    channel_byte: u8,
) -> Result<Vec<Vec<u8>>> {
    if words.len() != plan.total_floats * WORD_LEN {
        return Err(CalError::Malformed(format!(
            "{} coefficient bytes do not match a plan of {} words",
            words.len(),
            plan.total_floats
        )));
    }

    let mut frames = Vec::with_capacity(plan.packet_count);
    let mut offset = 0usize;
    for index in 0..plan.packet_count {
        let n = plan.floats_in_packet(index) * WORD_LEN;
        let mut payload = Vec::with_capacity(n + 4);
        if index == 0 {
            payload.extend_from_slice(&[curve, sample_rate, channel_byte, 0x00]);
        }
        payload.extend_from_slice(&words[offset..offset + n]);
        offset += n;

        // packet_count <= 256 is guaranteed by the plan.
        let seq = index as u8;
        frames.push(Frame::new(command::SET_COEFDT, payload, seq, plan.last_seq).encode()?);
    }
    debug_assert_eq!(offset, words.len());
    Ok(frames)
}

// ============================================================================
// SET_SETDAT batching
// ============================================================================

/// Greedy packer for JSON settings frames.
///
/// Parameters are added in order to the current object; when the frame for
/// the candidate object would exceed the threshold the current object is
/// flushed and a new one starts with the parameter that did not fit.
#[derive(Debug)]
pub struct ParameterBatcher {
    command: &'static str,
    threshold: usize,
    current: Map<String, Value>,
    batches: Vec<String>,
}

impl ParameterBatcher {
    pub fn new(threshold: usize) -> Self {
        Self {
            command: command::SET_SETDAT,
            threshold,
            current: Map::new(),
            batches: Vec::new(),
        }
    }

    fn frame_len(&self, json: &str) -> usize {
        FRAME_OVERHEAD + self.command.len() + json.len()
    }

    /// Add one parameter.
    ///
    /// # Errors
    ///
    /// `ParameterTooLarge` when the parameter alone does not fit one frame.
    pub fn push(&mut self, key: &str, value: Value) -> Result<()> {
        let mut candidate = self.current.clone();
        candidate.insert(key.to_string(), value.clone());
        let json = serde_json::to_string(&candidate)?;
        let size = self.frame_len(&json);
        if size <= self.threshold {
            self.current = candidate;
            return Ok(());
        }

        let mut alone = Map::new();
        alone.insert(key.to_string(), value);
        let alone_json = serde_json::to_string(&alone)?;
        let alone_size = self.frame_len(&alone_json);
        if self.current.is_empty() || alone_size > self.threshold {
            return Err(CalError::ParameterTooLarge {
                key: key.to_string(),
                size: alone_size,
                limit: self.threshold,
            });
        }

        let flushed = serde_json::to_string(&self.current)?;
        debug!(
            "{} batch {} closed at {} bytes",
            self.command,
            self.batches.len() + 1,
            self.frame_len(&flushed)
        );
        self.batches.push(flushed);
        self.current = alone;
        Ok(())
    }

    /// Close the last batch and return every JSON payload in send order.
    pub fn finish(mut self) -> Result<Vec<String>> {
        if !self.current.is_empty() {
            self.batches.push(serde_json::to_string(&self.current)?);
        }
        Ok(self.batches)
    }
}

/// Pack an ordered parameter list into SET_SETDAT payloads.
pub fn batch_parameters(params: &[(String, Value)], threshold: usize) -> Result<Vec<String>> {
    let mut batcher = ParameterBatcher::new(threshold);
    for (key, value) in params {
        batcher.push(key, value.clone())?;
    }
    batcher.finish()
}

// ============================================================================
// Inbound reassembly
// ============================================================================

/// Collects a sequenced multi-frame response.
///
/// The sequence range is learned from the first valid frame; duplicates keep
/// the first payload seen. Corrupt frames are dropped.
#[derive(Debug)]
pub struct Reassembler {
    command: String,
    buffer: Vec<u8>,
    last_seq: Option<u8>,
    parts: BTreeMap<u8, Vec<u8>>,
}

impl Reassembler {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            buffer: Vec::new(),
            last_seq: None,
            parts: BTreeMap::new(),
        }
    }

    /// Record one decoded frame. Returns false for a duplicate.
    pub fn insert(&mut self, frame: Frame) -> bool {
        let last = *self.last_seq.get_or_insert(frame.last_seq);
        if frame.seq > last {
            warn!(
                "{}: packet {} beyond announced last sequence {}, ignored",
                self.command, frame.seq, last
            );
            return false;
        }
        if self.parts.contains_key(&frame.seq) {
            debug!("{}: duplicate packet {} ignored", self.command, frame.seq);
            return false;
        }
        self.parts.insert(frame.seq, frame.payload);
        true
    }

    /// Append received bytes and decode every complete frame they finish.
    /// Returns true if at least one new packet was recorded.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        self.buffer.extend_from_slice(bytes);
        let mut progressed = false;
        loop {
            match frame::decode(&self.buffer) {
                Decoded::Incomplete => break,
                Decoded::Frame { frame, consumed } => {
                    self.buffer.drain(..consumed);
                    progressed |= self.insert(frame);
                }
                Decoded::Corrupt { error, consumed } => {
                    warn!("{}: dropping corrupt frame: {}", self.command, error);
                    self.buffer.drain(..consumed);
                }
            }
        }
        progressed
    }

    pub fn is_complete(&self) -> bool {
        match self.last_seq {
            Some(last) => self.parts.len() == last as usize + 1,
            None => false,
        }
    }

    /// First sequence number not yet received.
    pub fn first_missing(&self) -> Option<usize> {
        let last = self.last_seq?;
        (0..=last).find(|s| !self.parts.contains_key(s)).map(usize::from)
    }

    /// Concatenate the payloads in sequence order once complete.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        Some(self.parts.values().flatten().copied().collect())
    }

    /// Error describing why the response is unusable at stream idle.
    pub fn gap_error(&self) -> Option<CalError> {
        self.first_missing().map(|index| CalError::MissingPacket {
            command: self.command.clone(),
            index,
        })
    }
}
