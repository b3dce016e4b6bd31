//! Control-protocol engine for uploading room-correction filters to
//! networked AV receivers.
//!
//! Receivers expose two TCP control channels:
//!
//! - a checksum-framed binary protocol on port 1256 ([`frame`]) used to read
//!   receiver status, run microphone measurements and upload settings and
//!   filter coefficients, and
//! - a CR-terminated line protocol on port 23 ([`telnet`]) used for power,
//!   preset and bass-management setup.
//!
//! Both run through one exchange engine ([`exchange`]): a request is written
//! and a matcher strategy consumes the reply stream until it resolves, the
//! idle deadline passes or the peer hangs up. Only one exchange is ever
//! outstanding per connection.
//!
//! # Upload pipeline
//!
//! 1. [`params`] turns receiver status plus a calibration file into the
//!    ordered `SET_SETDAT` parameter list, packed by [`fragment`].
//! 2. [`channels`] orders the channels and resolves their protocol bytes.
//! 3. [`multirate`] decimates XT32 filters to the receiver's banded layout.
//! 4. [`coefficients`] encodes words; [`fragment`] splits them into
//!    `SET_COEFDT` packets.
//! 5. [`transfer::run_transfer`] sequences it all and leaves calibration
//!    mode on any failure.

pub mod channels;
pub mod coefficients;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod fragment;
pub mod frame;
pub mod logging;
pub mod measurement;
pub mod multirate;
pub mod params;
pub mod taps;
pub mod telnet;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod mock;

pub use config::Config;
pub use errors::{CalError, Result};
pub use exchange::{Connection, LinePattern, Match, ResponseMatcher, RetryPolicy};
pub use frame::Frame;
pub use params::{AvrInfo, AvrStatus, CalibrationFile};
pub use transfer::{run_transfer, AvrSession, TransferSummary};
pub use transport::{TcpTransport, Transport};
