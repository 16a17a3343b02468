//! Ledger HID report framing.
//!
//! APDUs travel over USB HID in fixed 64-byte reports. A message (a command
//! APDU on the way in, `data || SW` on the way out) is prefixed with its
//! 2-byte big-endian length and streamed across as many reports as needed:
//!
//! ```text
//! first report:  | channel (2B) | tag 0x05 | seq 0x0000 | len (2B) | 57B of message |
//! next reports:  | channel (2B) | tag 0x05 | seq (2B)   |            59B of message |
//! ```
//!
//! The last report is zero padded. Both directions use the same layout.
//!
//! # Example
//!
//! ```
//! use ledger_evm_signer_core::ledger::framing::{Reassembler, wrap};
//!
//! let message = vec![0xAB; 100];
//! let reports = wrap(&message);
//! assert_eq!(reports.len(), 2);
//!
//! let mut reassembler = Reassembler::new();
//! assert_eq!(reassembler.push(&reports[0]).unwrap(), None);
//! assert_eq!(reassembler.push(&reports[1]).unwrap(), Some(message));
//! ```

use core::time::Duration;
use std::time::Instant;

use tracing::trace;

use super::Transport;
use super::apdu::{Apdu, ApduResponse};
use crate::error::{Error, Result};

/// Size of one HID report.
pub const REPORT_SIZE: usize = 64;

/// Channel id used for APDU traffic.
pub const CHANNEL: u16 = 0x0101;

/// Tag of an APDU report.
pub const TAG_APDU: u8 = 0x05;

const HEADER_LEN: usize = 5;

/// A single HID report.
pub type Report = [u8; REPORT_SIZE];

/// Splits a message into HID reports.
#[must_use]
pub fn wrap(message: &[u8]) -> Vec<Report> {
    // Length prefix is 2 bytes; no Ledger message comes close to 64 KiB.
    let len = u16::try_from(message.len()).unwrap_or(u16::MAX);
    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);

    framed
        .chunks(REPORT_SIZE - HEADER_LEN)
        .enumerate()
        .map(|(seq, chunk)| {
            let mut report = [0u8; REPORT_SIZE];
            report[..2].copy_from_slice(&CHANNEL.to_be_bytes());
            report[2] = TAG_APDU;
            report[3..5].copy_from_slice(&u16::try_from(seq).unwrap_or(u16::MAX).to_be_bytes());
            report[HEADER_LEN..HEADER_LEN + chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect()
}

/// Rebuilds a message from the HID reports it was split into.
#[derive(Debug, Default)]
pub struct Reassembler {
    expected: Option<usize>,
    next_seq: u16,
    buf: Vec<u8>,
}

impl Reassembler {
    /// Creates an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one report; returns the message once it is complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] for a short report, a foreign channel
    /// or tag, or an out-of-order sequence number.
    pub fn push(&mut self, report: &[u8]) -> Result<Option<Vec<u8>>> {
        if report.len() < HEADER_LEN + 2 {
            return Err(Error::ProtocolError(format!(
                "HID report of {} bytes is too short",
                report.len()
            )));
        }

        let channel = u16::from_be_bytes([report[0], report[1]]);
        let seq = u16::from_be_bytes([report[3], report[4]]);
        if channel != CHANNEL || report[2] != TAG_APDU {
            return Err(Error::ProtocolError(format!(
                "unexpected channel {channel:#06x} / tag {:#04x}",
                report[2]
            )));
        }
        if seq != self.next_seq {
            return Err(Error::ProtocolError(format!(
                "report sequence {seq}, expected {}",
                self.next_seq
            )));
        }
        self.next_seq = self.next_seq.wrapping_add(1);

        let mut body = &report[HEADER_LEN..];
        let expected = match self.expected {
            Some(expected) => expected,
            None => {
                let expected = usize::from(u16::from_be_bytes([body[0], body[1]]));
                body = &body[2..];
                self.expected = Some(expected);
                expected
            }
        };

        let take = body.len().min(expected - self.buf.len());
        self.buf.extend_from_slice(&body[..take]);

        if self.buf.len() == expected {
            self.expected = None;
            self.next_seq = 0;
            Ok(Some(core::mem::take(&mut self.buf)))
        } else {
            Ok(None)
        }
    }
}

/// Sends one APDU and waits at most `timeout` for its response.
///
/// # Errors
///
/// - [`Error::Timeout`] if the device does not finish answering in time
/// - [`Error::Transport`] if the HID device fails
/// - [`Error::ProtocolError`] for a malformed reply
pub(crate) fn exchange(
    transport: &mut dyn Transport,
    apdu: &Apdu,
    timeout: Duration,
) -> Result<ApduResponse> {
    let started = Instant::now();
    let reports = wrap(&apdu.to_bytes());
    trace!(
        ins = apdu.ins(),
        p1 = apdu.p1(),
        len = apdu.data().len(),
        reports = reports.len(),
        "sending APDU"
    );
    for report in &reports {
        transport.write(report)?;
    }

    let mut reassembler = Reassembler::new();
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(Error::Timeout(timeout));
        }
        let Some(report) = transport.read(remaining)? else {
            return Err(Error::Timeout(timeout));
        };
        if let Some(message) = reassembler.push(&report)? {
            let response = ApduResponse::from_bytes(&message)?;
            trace!(
                status = response.status_word(),
                len = response.data().len(),
                "received APDU response"
            );
            return Ok(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_report_layout() {
        let reports = wrap(&[0xE0, 0x06, 0x00, 0x00, 0x00]);
        assert_eq!(reports.len(), 1);

        let r = &reports[0];
        assert_eq!(&r[..5], &[0x01, 0x01, 0x05, 0x00, 0x00]);
        assert_eq!(&r[5..7], &[0x00, 0x05]);
        assert_eq!(&r[7..12], &[0xE0, 0x06, 0x00, 0x00, 0x00]);
        assert!(r[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn report_count_and_sequence() {
        // 57 bytes fit the first report, 59 each after that
        assert_eq!(wrap(&[0; 57]).len(), 1);
        assert_eq!(wrap(&[0; 58]).len(), 2);
        assert_eq!(wrap(&[0; 57 + 59]).len(), 2);
        assert_eq!(wrap(&[0; 57 + 59 + 1]).len(), 3);

        let reports = wrap(&[0x11; 260]);
        for (i, report) in reports.iter().enumerate() {
            assert_eq!(usize::from(u16::from_be_bytes([report[3], report[4]])), i);
        }
    }

    #[test]
    fn roundtrip_various_lengths() {
        for len in [0usize, 1, 2, 56, 57, 58, 115, 116, 117, 260, 1000] {
            let message: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut reassembler = Reassembler::new();
            let mut out = None;
            for report in wrap(&message) {
                assert!(out.is_none(), "message completed early at len {len}");
                out = reassembler.push(&report).unwrap();
            }
            assert_eq!(out, Some(message), "len {len}");
        }
    }

    #[test]
    fn reassembler_takes_consecutive_messages() {
        let first: Vec<u8> = (0..130u8).collect();
        let second = vec![0x90, 0x00];
        let third = vec![0x5A; 59];

        let mut reassembler = Reassembler::new();
        for message in [&first, &second, &third] {
            let reports = wrap(message);
            let (last, rest) = reports.split_last().unwrap();
            for report in rest {
                assert_eq!(reassembler.push(report).unwrap(), None);
            }
            assert_eq!(reassembler.push(last).unwrap().as_ref(), Some(message));
        }
    }

    #[test]
    fn rejects_foreign_channel() {
        let mut report = wrap(&[1, 2, 3])[0];
        report[1] = 0x02;
        assert!(matches!(
            Reassembler::new().push(&report),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn rejects_out_of_order_sequence() {
        let reports = wrap(&[0x22; 200]);
        let mut reassembler = Reassembler::new();
        reassembler.push(&reports[0]).unwrap();
        assert!(matches!(
            reassembler.push(&reports[2]),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn rejects_short_report() {
        assert!(Reassembler::new().push(&[0x01, 0x01, 0x05]).is_err());
    }
}
