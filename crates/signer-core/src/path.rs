//! BIP-32 / BIP-44 derivation paths.
//!
//! A [`DerivationPath`] is an ordered list of 32-bit child indices, each
//! optionally hardened (top bit set). The Ledger Ethereum app expects it as
//! one depth byte followed by every index in big-endian order:
//!
//! ```text
//! | depth | index 0 (BE) | index 1 (BE) | ... |
//! |-------|--------------|--------------|-----|
//! | 1B    | 4B           | 4B           | ... |
//! ```
//!
//! # Example
//!
//! ```
//! use ledger_evm_signer_core::DerivationPath;
//!
//! let path: DerivationPath = "m/44'/60'/0'/0/0".parse().unwrap();
//! let bytes = path.to_bytes();
//! assert_eq!(bytes[0], 5);
//! assert_eq!(&bytes[1..5], &[0x80, 0x00, 0x00, 0x2C]);
//! assert_eq!(DerivationPath::from_bytes(&bytes).unwrap(), path);
//! ```

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::{Error, Result};

/// Bit marking a hardened child index.
pub const HARDENED: u32 = 0x8000_0000;

/// The device refuses paths deeper than this.
pub const MAX_DEPTH: usize = 10;

/// A parsed, immutable derivation path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    /// The root of the default Ethereum account tree, `m/44'/60'/0'/0`.
    pub const DEFAULT_BASE: [u32; 4] = [HARDENED | 44, HARDENED | 60, HARDENED, 0];

    /// Creates a path from raw segment integers (hardened bit already applied).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] for an empty path or one deeper than
    /// [`MAX_DEPTH`].
    pub fn new(segments: Vec<u32>) -> Result<Self> {
        if segments.is_empty() {
            return Err(Error::InvalidPath("path has no segments".to_string()));
        }
        if segments.len() > MAX_DEPTH {
            return Err(Error::InvalidPath(format!(
                "path depth {} exceeds {MAX_DEPTH}",
                segments.len()
            )));
        }
        Ok(Self(segments))
    }

    /// Returns the default Ethereum account path `m/44'/60'/0'/0/{index}`.
    #[must_use]
    pub fn ethereum(index: u32) -> Self {
        let mut segments = Self::DEFAULT_BASE.to_vec();
        segments.push(index);
        Self(segments)
    }

    /// Returns the segments, hardened bit included.
    #[must_use]
    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Encodes the path the way the device expects it.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + 4 * self.0.len());
        debug_assert!(self.0.len() <= MAX_DEPTH, "every constructor bounds the depth");
        bytes.push(u8::try_from(self.0.len()).unwrap_or(u8::MAX));
        for segment in &self.0 {
            bytes.extend_from_slice(&segment.to_be_bytes());
        }
        bytes
    }

    /// Decodes a path from its device encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] if the length byte disagrees with the
    /// buffer size or the path is empty.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&depth, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::InvalidPath("empty encoding".to_string()))?;

        if rest.len() != 4 * usize::from(depth) {
            return Err(Error::InvalidPath(format!(
                "depth byte says {depth} segments, found {} bytes",
                rest.len()
            )));
        }

        let segments = rest
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(segments)
    }
}

impl FromStr for DerivationPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .trim()
            .strip_prefix("m/")
            .ok_or_else(|| Error::InvalidPath(format!("{s:?} does not start with \"m/\"")))?;

        let segments = rest
            .split('/')
            .map(|component| parse_segment(component, s))
            .collect::<Result<Vec<_>>>()?;

        Self::new(segments)
    }
}

fn parse_segment(component: &str, full: &str) -> Result<u32> {
    let component = component.trim();
    let (digits, hardened) = match component
        .strip_suffix('\'')
        .or_else(|| component.strip_suffix('h'))
    {
        Some(digits) => (digits, true),
        None => (component, false),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidPath(format!(
            "segment {component:?} of {full:?} is not numeric"
        )));
    }

    let index: u32 = digits
        .parse()
        .map_err(|_| Error::InvalidPath(format!("segment {component:?} is out of range")))?;

    if index & HARDENED != 0 {
        return Err(Error::InvalidPath(format!(
            "segment {component:?} is out of range"
        )));
    }

    Ok(if hardened { index | HARDENED } else { index })
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for segment in &self.0 {
            if segment & HARDENED == 0 {
                write!(f, "/{segment}")?;
            } else {
                write!(f, "/{}'", segment & !HARDENED)?;
            }
        }
        Ok(())
    }
}

impl Serialize for DerivationPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> CoreResult<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> CoreResult<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

type CoreResult<T, E> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_default_path() {
        let path: DerivationPath = "m/44'/60'/0'/0/0".parse().unwrap();
        assert_eq!(
            path.segments(),
            &[0x8000_002C, 0x8000_003C, 0x8000_0000, 0, 0]
        );
        assert_eq!(path, DerivationPath::ethereum(0));
    }

    #[test]
    fn encode_matches_device_layout() {
        let path: DerivationPath = "m/44'/60'/0'/0/1".parse().unwrap();
        let bytes = path.to_bytes();

        assert_eq!(bytes.len(), 21);
        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[1..5], &[0x80, 0x00, 0x00, 0x2C]);
        assert_eq!(&bytes[5..9], &[0x80, 0x00, 0x00, 0x3C]);
        assert_eq!(&bytes[17..21], &[0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn string_and_binary_roundtrip() {
        for text in [
            "m/44'/60'/0'/0/0",
            "m/44'/60'/0'/0/1",
            "m/44'/60'/5'",
            "m/0",
            "m/2147483647'/1/2/3",
        ] {
            let path: DerivationPath = text.parse().unwrap();
            assert_eq!(path.to_string(), text);
            assert_eq!(DerivationPath::from_bytes(&path.to_bytes()).unwrap(), path);
        }
    }

    #[test]
    fn deepest_path_encodes_its_depth() {
        let deepest = DerivationPath::new(vec![7; MAX_DEPTH]).unwrap();
        let bytes = deepest.to_bytes();
        assert_eq!(bytes[0], 10);
        assert_eq!(bytes.len(), 1 + 4 * MAX_DEPTH);

        assert!(matches!(
            DerivationPath::new(vec![7; MAX_DEPTH + 1]),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn h_suffix_is_hardened() {
        let a: DerivationPath = "m/44h/60h/0h/0/0".parse().unwrap();
        assert_eq!(a, DerivationPath::ethereum(0));
    }

    #[test]
    fn rejects_missing_root() {
        assert!(matches!(
            "44'/60'/0'/0/0".parse::<DerivationPath>(),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn rejects_empty_path() {
        assert!(matches!("m/".parse::<DerivationPath>(), Err(Error::InvalidPath(_))));
        assert!(matches!("m".parse::<DerivationPath>(), Err(Error::InvalidPath(_))));
        assert!(matches!(
            DerivationPath::new(vec![]),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_segment() {
        for bad in ["m/44'/x/0", "m/44'//0", "m/-1", "m/44''", "m/0x10"] {
            assert!(
                matches!(bad.parse::<DerivationPath>(), Err(Error::InvalidPath(_))),
                "{bad} should fail"
            );
        }
    }

    #[test]
    fn rejects_out_of_range_segment() {
        assert!("m/2147483648".parse::<DerivationPath>().is_err());
        assert!("m/4294967296".parse::<DerivationPath>().is_err());
    }

    #[test]
    fn from_bytes_rejects_bad_length() {
        assert!(DerivationPath::from_bytes(&[]).is_err());
        assert!(DerivationPath::from_bytes(&[2, 0, 0, 0, 1]).is_err());
        assert!(DerivationPath::from_bytes(&[0]).is_err());
    }

    #[test]
    fn serde_as_string() {
        let path = DerivationPath::ethereum(3);
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"m/44'/60'/0'/0/3\"");
        let back: DerivationPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}
