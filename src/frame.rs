//! Binary frame codec for the receiver control port.
//!
//! Every request and response on the binary channel is one checksum-framed
//! packet:
//!
//! ```text
//! offset 0        marker (0x54 host, 0x52 device)
//! offset 1..2     total length, big-endian, including the checksum byte
//! offset 3        sequence number
//! offset 4        last sequence number
//! offset 5..N     ASCII command name, 0x00 terminated
//! offset N+1..N+2 parameter length, big-endian
//! offset N+3..    parameter bytes (JSON text or raw coefficient words)
//! last byte       sum of all preceding bytes mod 256
//! ```
//!
//! The codec is pure: [`encode`] builds a frame, [`decode`] parses the first
//! frame at the head of a receive buffer and reports how many bytes it spans.

use log::trace;

use crate::errors::{CalError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Marker byte of frames sent by the host.
pub const HOST_MARKER: u8 = 0x54;

/// Marker byte of frames originated by the receiver.
pub const DEVICE_MARKER: u8 = 0x52;

/// Fixed header/trailer bytes around the command name and parameters:
/// marker, length, seq, last seq, name terminator, parameter length, checksum.
pub const FRAME_OVERHEAD: usize = 1 + 2 + 1 + 1 + 1 + 2 + 1;

/// Largest frame the 16-bit length field can describe.
pub const MAX_FRAME_LEN: usize = 0xFFFF;

/// Command names understood by the receiver.
pub mod command {
    pub const GET_AVRINF: &str = "GET_AVRINF";
    pub const GET_AVRSTS: &str = "GET_AVRSTS";
    pub const ENTER_AUDY: &str = "ENTER_AUDY";
    pub const EXIT_AUDMD: &str = "EXIT_AUDMD";
    pub const SET_SETDAT: &str = "SET_SETDAT";
    pub const SET_COEFDT: &str = "SET_COEFDT";
    pub const INIT_COEFS: &str = "INIT_COEFS";
    pub const FINZ_COEFS: &str = "FINZ_COEFS";
    pub const SET_POSNUM: &str = "SET_POSNUM";
    pub const START_CHNL: &str = "START_CHNL";
    pub const GET_RESPON: &str = "GET_RESPON";
}

// ============================================================================
// Frame
// ============================================================================

/// One decoded (or to-be-encoded) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub marker: u8,
    pub seq: u8,
    pub last_seq: u8,
    pub command: String,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a host-originated frame.
    pub fn new(command: impl Into<String>, payload: Vec<u8>, seq: u8, last_seq: u8) -> Self {
        Self {
            marker: HOST_MARKER,
            seq,
            last_seq,
            command: command.into(),
            payload,
        }
    }

    /// A single-packet frame with an empty parameter block.
    pub fn bare(command: &str) -> Self {
        Self::new(command, Vec::new(), 0, 0)
    }

    /// A single-packet frame whose parameters are the given JSON text.
    pub fn json(command: &str, json: &str) -> Self {
        Self::new(command, json.as_bytes().to_vec(), 0, 0)
    }

    /// Size of this frame on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.command.len() + self.payload.len()
    }

    /// Serialize the frame, appending the checksum.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_FRAME_LEN {
            return Err(CalError::PacketTooLarge {
                size: self.payload.len(),
            });
        }
        if self.command.bytes().any(|b| b == 0x00 || !b.is_ascii()) {
            return Err(CalError::Malformed(format!(
                "command name {:?} must be ASCII without NUL",
                self.command
            )));
        }
        let total = self.encoded_len();
        if total > MAX_FRAME_LEN {
            return Err(CalError::PacketTooLarge { size: total });
        }

        let mut buf = Vec::with_capacity(total);
        buf.push(self.marker);
        buf.extend_from_slice(&(total as u16).to_be_bytes());
        buf.push(self.seq);
        buf.push(self.last_seq);
        buf.extend_from_slice(self.command.as_bytes());
        buf.push(0x00);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.push(checksum(&buf));
        debug_assert_eq!(buf.len(), total);

        trace!(
            "encoded {} seq={}/{} len={}",
            self.command,
            self.seq,
            self.last_seq,
            total
        );
        Ok(buf)
    }
}

/// Build a host frame in one call.
pub fn encode(command: &str, payload: &[u8], seq: u8, last_seq: u8) -> Result<Vec<u8>> {
    Frame::new(command, payload.to_vec(), seq, last_seq).encode()
}

/// Sum of all bytes mod 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

// ============================================================================
// Decoding
// ============================================================================

/// Outcome of parsing the head of a receive buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A valid frame spanning `consumed` bytes.
    Frame { frame: Frame, consumed: usize },
    /// The buffer does not yet hold the whole frame.
    Incomplete,
    /// The head of the buffer is corrupt. Drop `consumed` bytes and keep going.
    Corrupt { error: CalError, consumed: usize },
}

/// Parse the first frame in `buf`.
pub fn decode(buf: &[u8]) -> Decoded {
    let Some(&marker) = buf.first() else {
        return Decoded::Incomplete;
    };
    if marker != HOST_MARKER && marker != DEVICE_MARKER {
        return Decoded::Corrupt {
            error: CalError::Malformed(format!("unknown marker {marker:#04X}")),
            consumed: 1,
        };
    }
    if buf.len() < 3 {
        return Decoded::Incomplete;
    }
    let total = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if total < FRAME_OVERHEAD {
        // Length field cannot describe a frame; resync one byte at a time.
        return Decoded::Corrupt {
            error: CalError::Malformed(format!("length field {total} below minimum frame size")),
            consumed: 1,
        };
    }
    if buf.len() < total {
        return Decoded::Incomplete;
    }

    let data = &buf[..total];
    let expected = checksum(&data[..total - 1]);
    let actual = data[total - 1];
    if expected != actual {
        return Decoded::Corrupt {
            error: CalError::ChecksumMismatch { expected, actual },
            consumed: total,
        };
    }

    match parse_body(data) {
        Ok(frame) => {
            trace!(
                "decoded {} seq={}/{} payload={}",
                frame.command,
                frame.seq,
                frame.last_seq,
                frame.payload.len()
            );
            Decoded::Frame {
                frame,
                consumed: total,
            }
        }
        Err(error) => Decoded::Corrupt {
            error,
            consumed: total,
        },
    }
}

/// Parse a checksum-verified frame of exactly `data.len()` bytes.
fn parse_body(data: &[u8]) -> Result<Frame> {
    let marker = data[0];
    let body_end = data.len() - 1;
    let name_end = data[5..body_end]
        .iter()
        .position(|&b| b == 0x00)
        .map(|p| p + 5)
        .ok_or_else(|| CalError::Malformed("no command name terminator".into()))?;
    if name_end + 3 > body_end {
        return Err(CalError::Malformed(
            "too short for parameter length field".into(),
        ));
    }
    let param_len = u16::from_be_bytes([data[name_end + 1], data[name_end + 2]]) as usize;
    let payload_start = name_end + 3;
    if payload_start + param_len > body_end {
        return Err(CalError::Malformed(format!(
            "parameter length {param_len} exceeds frame boundary"
        )));
    }
    let command = String::from_utf8_lossy(&data[5..name_end]).into_owned();

    Ok(Frame {
        marker,
        seq: data[3],
        last_seq: data[4],
        command,
        payload: data[payload_start..payload_start + param_len].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unwrap_frame(decoded: Decoded) -> (Frame, usize) {
        match decoded {
            Decoded::Frame { frame, consumed } => (frame, consumed),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn bare_commands_match_known_wire_bytes() {
        let cases = [
            (command::GET_AVRINF, "54001300004745545f415652494e460000006c"),
            (command::GET_AVRSTS, "54001300004745545f41565253545300000089"),
            (command::ENTER_AUDY, "5400130000454e5445525f4155445900000077"),
            (command::EXIT_AUDMD, "5400130000455849545f4155444d440000006b"),
            (command::INIT_COEFS, "5400130000494e49545f434f4546530000006a"),
            (command::FINZ_COEFS, "540013000046494e5a5f434f4546530000006d"),
        ];
        for (name, hex) in cases {
            let bytes = Frame::bare(name).encode().unwrap();
            let rendered: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            assert_eq!(rendered, hex, "{name}");
        }
    }

    #[test]
    fn round_trip_preserves_fields() {
        let cases: [(&str, &[u8], u8, u8); 4] = [
            ("SET_SETDAT", br#"{"AudyFinFlg":"Fin"}"#, 0, 0),
            ("SET_COEFDT", &[0x00, 0x01, 0x02, 0x00, 0xAA, 0xBB], 4, 9),
            ("X", &[], 255, 255),
            ("GET_RESPON", &[0u8; 600], 1, 2),
        ];
        for (name, payload, seq, last) in cases {
            let bytes = encode(name, payload, seq, last).unwrap();
            let (frame, consumed) = unwrap_frame(decode(&bytes));
            assert_eq!(consumed, bytes.len());
            assert_eq!(frame.command, name);
            assert_eq!(frame.payload, payload);
            assert_eq!(frame.seq, seq);
            assert_eq!(frame.last_seq, last);
            assert_eq!(frame.marker, HOST_MARKER);
        }
    }

    #[test]
    fn length_field_counts_checksum() {
        let bytes = encode("ABC", b"xyz", 0, 0).unwrap();
        assert_eq!(bytes.len(), FRAME_OVERHEAD + 6);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]) as usize, bytes.len());
        assert_eq!(*bytes.last().unwrap(), checksum(&bytes[..bytes.len() - 1]));
    }

    #[test]
    fn single_byte_corruption_is_detected() {
        let bytes = encode("SET_SETDAT", br#"{"Distance":[{"FL":300}]}"#, 0, 0).unwrap();
        // Skip the marker and length field: those change how the head is framed.
        for i in 3..bytes.len() {
            let mut corrupt = bytes.clone();
            corrupt[i] ^= 0x5A;
            match decode(&corrupt) {
                Decoded::Corrupt {
                    error: CalError::ChecksumMismatch { .. },
                    consumed,
                } => assert_eq!(consumed, bytes.len()),
                other => panic!("byte {i}: expected checksum mismatch, got {other:?}"),
            }
        }
    }

    #[test]
    fn short_buffer_is_incomplete() {
        let bytes = encode("GET_AVRSTS", &[], 0, 0).unwrap();
        assert!(matches!(decode(&bytes[..2]), Decoded::Incomplete));
        assert!(matches!(decode(&bytes[..bytes.len() - 1]), Decoded::Incomplete));
    }

    #[test]
    fn trailing_bytes_are_left_for_the_next_frame() {
        let mut bytes = encode("A", b"1", 0, 1).unwrap();
        let first_len = bytes.len();
        bytes.extend(encode("A", b"2", 1, 1).unwrap());
        let (frame, consumed) = unwrap_frame(decode(&bytes));
        assert_eq!(consumed, first_len);
        assert_eq!(frame.payload, b"1");
        let (frame, _) = unwrap_frame(decode(&bytes[consumed..]));
        assert_eq!(frame.payload, b"2");
    }

    #[test]
    fn device_marker_is_accepted() {
        let mut bytes = encode("GET_RESPON", &[1, 2, 3, 4], 0, 0).unwrap();
        bytes[0] = DEVICE_MARKER;
        let n = bytes.len();
        bytes[n - 1] = checksum(&bytes[..n - 1]);
        let (frame, _) = unwrap_frame(decode(&bytes));
        assert_eq!(frame.marker, DEVICE_MARKER);
    }

    fn with_valid_checksum(mut body: Vec<u8>) -> Vec<u8> {
        let total = body.len() + 1;
        body[1..3].copy_from_slice(&(total as u16).to_be_bytes());
        let sum = checksum(&body);
        body.push(sum);
        body
    }

    #[test]
    fn missing_terminator_is_malformed() {
        let bytes = with_valid_checksum(vec![0x54, 0, 0, 0, 0, b'A', b'B', b'C', b'D', b'E']);
        assert!(matches!(
            decode(&bytes),
            Decoded::Corrupt {
                error: CalError::Malformed(_),
                ..
            }
        ));
    }

    #[test]
    fn oversized_parameter_length_is_malformed() {
        let bytes = with_valid_checksum(vec![0x54, 0, 0, 0, 0, b'A', 0x00, 0x00, 0x09, 1, 2]);
        assert!(matches!(
            decode(&bytes),
            Decoded::Corrupt {
                error: CalError::Malformed(_),
                ..
            }
        ));
    }

    #[test]
    fn impossible_length_resyncs_by_one_byte() {
        let buf = [0x54, 0x00, 0x02, 0x00, 0x00];
        match decode(&buf) {
            Decoded::Corrupt { consumed, .. } => assert_eq!(consumed, 1),
            other => panic!("expected corrupt, got {other:?}"),
        }
    }

    #[test]
    fn leading_junk_is_skipped_byte_by_byte() {
        // 0xFF 0xFF would read as a 64 KiB length if taken at face value.
        let mut buf = vec![0x00, 0xFF, 0xFF];
        let frame = encode("ENTER_AUDY", &[], 0, 0).unwrap();
        buf.extend_from_slice(&frame);

        let mut offset = 0;
        loop {
            match decode(&buf[offset..]) {
                Decoded::Corrupt { consumed, .. } => {
                    assert_eq!(consumed, 1);
                    offset += consumed;
                }
                Decoded::Frame { frame, consumed } => {
                    assert_eq!(frame.command, "ENTER_AUDY");
                    assert_eq!(offset + consumed, buf.len());
                    break;
                }
                Decoded::Incomplete => panic!("stalled at offset {offset}"),
            }
        }
        assert_eq!(offset, 3);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_FRAME_LEN - 5];
        assert!(matches!(
            encode("SET_COEFDT", &payload, 0, 0),
            Err(CalError::PacketTooLarge { .. })
        ));
    }
}
