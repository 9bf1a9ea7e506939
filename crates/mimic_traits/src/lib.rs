pub mod config;
pub mod error;

pub use config::{Timeouts, TransportConfig};
pub use error::{MimicError, ParseError, Result};

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Verbatim ClientHello bytes as sent by a client or supplied by the operator.
///
/// Either a full TLS record (`16 03 0x ...`) or a bare handshake message is accepted
/// by the parser; the registry stores whatever was read off the wire.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HandshakeDescription(Bytes);

impl HandshakeDescription {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Decodes the hex form used by configuration documents. Whitespace is ignored.
    pub fn from_hex(data: &str) -> std::result::Result<Self, ParseError> {
        let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        let compact = compact
            .strip_prefix("0x")
            .unwrap_or(&compact)
            .to_string();
        hex::decode(&compact).map(Self::new).map_err(|e| match e {
            hex::FromHexError::InvalidHexCharacter { c, index } => {
                ParseError::new(index / 2, format!("invalid hex character {c:?}"))
            }
            hex::FromHexError::OddLength => {
                ParseError::new(compact.len() / 2, "odd number of hex digits")
            }
            other => ParseError::new(0, other.to_string()),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for HandshakeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandshakeDescription({} bytes)", self.0.len())
    }
}

/// Looks up the most recently captured ClientHello for a server name.
///
/// Injected into the transport factory so that it never depends on how captures are stored.
pub type FingerprintLookup = Arc<dyn Fn(&str) -> Option<HandshakeDescription> + Send + Sync>;

/// A lookup that never finds anything.
pub fn no_fingerprints() -> FingerprintLookup {
    Arc::new(|_| None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let desc = HandshakeDescription::from_hex("16 03 01 00 2a").unwrap();
        assert_eq!(desc.as_bytes(), &[0x16, 0x03, 0x01, 0x00, 0x2a]);
        assert_eq!(desc.to_hex(), "160301002a");
    }

    #[test]
    fn invalid_hex_reports_position() {
        let err = HandshakeDescription::from_hex("1603zz").unwrap_err();
        assert_eq!(err.offset, 2);
        assert!(err.reason.contains("invalid hex character"));

        let err = HandshakeDescription::from_hex("160").unwrap_err();
        assert!(err.reason.contains("odd"));
    }
}
