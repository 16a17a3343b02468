//! APDU (Application Protocol Data Unit) command and response types.
//!
//! The Ledger Ethereum app speaks short APDUs only:
//!
//! ```text
//! | CLA | INS | P1 | P2 | Lc | Data     |
//! |-----|-----|----|----|----|----------|
//! | 1B  | 1B  | 1B | 1B | 1B | 0..=255B |
//! ```
//!
//! Responses are the reply data followed by a 2-byte status word:
//!
//! ```text
//! | Data | SW1 | SW2 |
//! |------|-----|-----|
//! | Var  | 1B  | 1B  |
//! ```
//!
//! An [`Apdu`] never carries more than [`Apdu::MAX_DATA`] bytes. Requests
//! that need more are split by the signing pipeline into several APDUs; this
//! module refuses oversize payloads instead of truncating them.
//!
//! # Example
//!
//! ```
//! use ledger_evm_signer_core::ledger::{Apdu, ApduResponse};
//!
//! let apdu = Apdu::new(0xE0, 0x06, 0x00, 0x00, vec![]).unwrap();
//! assert_eq!(apdu.to_bytes(), vec![0xE0, 0x06, 0x00, 0x00, 0x00]);
//!
//! let response = ApduResponse::from_bytes(&[0x01, 0x01, 0x09, 0x00, 0x90, 0x00]).unwrap();
//! assert!(response.is_success());
//! ```

use core::fmt;

use crate::error::{Error, Result};

/// Ledger status words.
pub mod status {
    /// Success.
    pub const OK: u16 = 0x9000;
    /// The user refused on the device.
    pub const CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
    /// The user refused, or the command is not allowed in this state.
    pub const COMMAND_NOT_ALLOWED: u16 = 0x6986;
    /// Wrong data length.
    pub const WRONG_LENGTH: u16 = 0x6700;
    /// Invalid data in the command.
    pub const INVALID_DATA: u16 = 0x6A80;
    /// Incorrect P1 or P2.
    pub const INCORRECT_P1_P2: u16 = 0x6B00;
    /// Instruction not supported by the app.
    pub const INS_NOT_SUPPORTED: u16 = 0x6D00;
    /// Class not supported (wrong app open).
    pub const CLA_NOT_SUPPORTED: u16 = 0x6E00;
    /// No app open (dashboard).
    pub const APP_NOT_OPEN: u16 = 0x6E01;
    /// No app open (newer dashboards).
    pub const APP_NOT_OPEN_DASHBOARD: u16 = 0x6511;
    /// The device is locked.
    pub const LOCKED_DEVICE: u16 = 0x5515;
}

/// An APDU command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
}

impl Apdu {
    /// Maximum short APDU data length.
    pub const MAX_DATA: usize = 255;

    /// Creates a new APDU command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] if `data` is longer than
    /// [`Apdu::MAX_DATA`].
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Result<Self> {
        if data.len() > Self::MAX_DATA {
            return Err(Error::ProtocolError(format!(
                "APDU payload of {} bytes exceeds {}",
                data.len(),
                Self::MAX_DATA
            )));
        }
        Ok(Self {
            cla,
            ins,
            p1,
            p2,
            data,
        })
    }

    /// Parses a serialized command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] if the header is short or `Lc`
    /// disagrees with the data length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let [cla, ins, p1, p2, lc, data @ ..] = bytes else {
            return Err(Error::ProtocolError(format!(
                "APDU of {} bytes is shorter than its header",
                bytes.len()
            )));
        };
        if usize::from(*lc) != data.len() {
            return Err(Error::ProtocolError(format!(
                "APDU Lc is {lc} but carries {} bytes",
                data.len()
            )));
        }
        Self::new(*cla, *ins, *p1, *p2, data.to_vec())
    }

    /// Returns the class byte.
    #[must_use]
    pub const fn cla(&self) -> u8 {
        self.cla
    }

    /// Returns the instruction byte.
    #[must_use]
    pub const fn ins(&self) -> u8 {
        self.ins
    }

    /// Returns parameter 1.
    #[must_use]
    pub const fn p1(&self) -> u8 {
        self.p1
    }

    /// Returns parameter 2.
    #[must_use]
    pub const fn p2(&self) -> u8 {
        self.p2
    }

    /// Returns the command data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes the APDU; `Lc` is always present.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 + self.data.len());
        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        // `new` caps the length at 255.
        bytes.push(u8::try_from(self.data.len()).unwrap_or(u8::MAX));
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// An APDU response from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    data: Vec<u8>,
    sw1: u8,
    sw2: u8,
}

impl ApduResponse {
    /// Success status word (0x9000).
    pub const SW_SUCCESS: u16 = status::OK;

    /// Creates a response from its parts.
    #[must_use]
    pub const fn new(data: Vec<u8>, status_word: u16) -> Self {
        let [sw1, sw2] = status_word.to_be_bytes();
        Self { data, sw1, sw2 }
    }

    /// Splits raw reply bytes into data and status word.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] if fewer than 2 bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let [data @ .., sw1, sw2] = bytes else {
            return Err(Error::ProtocolError(format!(
                "response of {} bytes has no status word",
                bytes.len()
            )));
        };
        Ok(Self {
            data: data.to_vec(),
            sw1: *sw1,
            sw2: *sw2,
        })
    }

    /// Serializes the response as `data || SW1 || SW2`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 2);
        bytes.extend_from_slice(&self.data);
        bytes.push(self.sw1);
        bytes.push(self.sw2);
        bytes
    }

    /// Returns the response data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the response and returns the data.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Returns the full status word as a [`u16`].
    #[must_use]
    pub const fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// Checks if the response indicates success (`SW = 0x9000`).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status_word() == Self::SW_SUCCESS
    }

    /// Checks the response status and returns an error if not successful.
    ///
    /// # Errors
    ///
    /// Returns the error [`ApduResponse::to_error`] maps the status word to.
    pub fn check(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self.to_error())
        }
    }

    /// Converts the status word to an error.
    ///
    /// | Status word                        | Error                            |
    /// |------------------------------------|----------------------------------|
    /// | `6985`, `6986`                     | [`Error::UserRejected`]          |
    /// | `6D00`, `6E00`, `6E01`, `6511`     | [`Error::UnsupportedOperation`]  |
    /// | anything else                      | [`Error::ProtocolError`]         |
    #[must_use]
    pub fn to_error(&self) -> Error {
        let sw = self.status_word();
        match sw {
            status::CONDITIONS_NOT_SATISFIED | status::COMMAND_NOT_ALLOWED => Error::UserRejected,
            status::INS_NOT_SUPPORTED => {
                Error::UnsupportedOperation("instruction not supported by the app".to_string())
            }
            status::CLA_NOT_SUPPORTED
            | status::APP_NOT_OPEN
            | status::APP_NOT_OPEN_DASHBOARD => {
                Error::UnsupportedOperation("the Ethereum app is not open".to_string())
            }
            _ => Error::ProtocolError(format!(
                "device returned status {sw:#06x} ({})",
                describe(sw)
            )),
        }
    }
}

impl fmt::Display for ApduResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes, status {:#06x}",
            self.data.len(),
            self.status_word()
        )
    }
}

fn describe(sw: u16) -> &'static str {
    match sw {
        status::WRONG_LENGTH => "wrong length",
        status::INVALID_DATA => "invalid data",
        status::INCORRECT_P1_P2 => "incorrect parameters",
        status::LOCKED_DEVICE => "device locked",
        _ => "unknown status",
    }
}
