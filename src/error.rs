//! Error types.

use crate::apdu::StatusWords;
use std::fmt;

/// Result type with the `openpgp-token` crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Kinds of errors raised by the card protocol layers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The channel was never established or has been lost, or a command was
    /// attempted before the OpenPGP application was selected.
    Connection(String),

    /// GET DATA returned a corrupt BER-TLV structure.
    MalformedTlv(&'static str),

    /// VERIFY returned a non-success status word.
    ///
    /// `tries` carries the remaining attempts when the card reported them
    /// (status `63Cx`); `Some(0)` means the PIN slot is blocked. Cached
    /// credentials proven wrong by this error must not be replayed.
    Pin {
        /// Remaining verification attempts, if the card reported them.
        tries: Option<u8>,
    },

    /// A command other than VERIFY returned a non-success status word.
    CardOperation {
        /// Raw status word reported by the card.
        sw: u16,
    },

    /// The key fingerprint reported by the card does not match the key the
    /// caller expected to operate with. Always fatal: there is no safe
    /// recovery other than aborting before the wrong physical key signs or
    /// decrypts anything.
    FingerprintMismatch {
        /// Key slot whose fingerprint was checked.
        slot: crate::card::KeySlot,
    },

    /// A digest passed to PSO:COMPUTE DIGITAL SIGNATURE does not have the
    /// length its declared hash algorithm produces.
    WrongDigestLength {
        /// Digest length the declared algorithm produces.
        expected: usize,
        /// Length actually supplied.
        actual: usize,
    },

    /// PC/SC layer error.
    Pcsc(pcsc::Error),
}

impl Error {
    /// Short name for this error kind.
    pub fn name(&self) -> &'static str {
        match self {
            Error::Connection(_) => "connection",
            Error::MalformedTlv(_) => "malformed-tlv",
            Error::Pin { .. } => "pin",
            Error::CardOperation { .. } => "card-operation",
            Error::FingerprintMismatch { .. } => "fingerprint-mismatch",
            Error::WrongDigestLength { .. } => "wrong-digest-length",
            Error::Pcsc(_) => "pcsc",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(msg) => write!(f, "card channel unavailable: {}", msg),
            Error::MalformedTlv(msg) => write!(f, "malformed TLV response: {}", msg),
            Error::Pin { tries: Some(0) } => write!(f, "PIN rejected: slot is blocked"),
            Error::Pin { tries: Some(n) } => {
                write!(f, "PIN rejected: {} attempt(s) remaining", n)
            }
            Error::Pin { tries: None } => write!(f, "PIN rejected"),
            Error::CardOperation { sw } => {
                write!(f, "card error {:04x}: {}", sw, StatusWords::from(*sw))
            }
            Error::FingerprintMismatch { slot } => write!(
                f,
                "card holds a different key in the {} slot than expected",
                slot
            ),
            Error::WrongDigestLength { expected, actual } => write!(
                f,
                "digest length {} does not match the declared hash algorithm ({} expected)",
                actual, expected
            ),
            Error::Pcsc(err) => write!(f, "PC/SC error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<pcsc::Error> for Error {
    fn from(err: pcsc::Error) -> Self {
        Error::Pcsc(err)
    }
}
