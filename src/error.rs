//! All possible non-I/O protocol errors.

use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io;

/// Enumeration of all possible non-I/O protocol errors.
///
/// Every variant is fatal at connection scope: the session is closed and the
/// peer is told nothing, so tampering cannot be distinguished from a dropped
/// link. I/O errors from the underlying transport are not represented here;
/// they surface as plain [`io::Error`] values and upper layers may retry
/// against a different bridge.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// A record's truncated HMAC did not match the receiver's current
    /// ratchet key.
    ///
    /// This covers both active tampering and a desynchronised ratchet
    /// (e.g. a dropped or reordered record); the two are indistinguishable
    /// on purpose.
    MacMismatch,

    /// A record body decrypted to fewer than the two bytes needed for the
    /// real-length prefix, or the real length claimed more payload than the
    /// body holds.
    TruncatedBody {
        /// Decrypted body length (or claimed payload length) that failed
        /// validation.
        len: usize,
    },

    /// The caller asked to send a payload longer than a record can carry.
    OversizedPayload {
        /// The refused payload length.
        len: usize,
    },

    /// No nowcookie in the sweep window opened the hello's sealed public key.
    ///
    /// Either the peer holds a different cookie, or its clock is more than
    /// the tolerated skew away from ours.
    NoValidCookie,

    /// A hello envelope was too short to contain a nonce and sealed key.
    HelloTooShort {
        /// The received length.
        len: usize,
    },

    /// AEAD open of a tunnel packet failed.
    AeadFailed,

    /// A tunnel packet was shorter than its nonce.
    PacketTooShort {
        /// The received length.
        len: usize,
    },

    /// A tunnel packet carried a sequence number that was already accepted
    /// or fell behind the replay window.
    Replay {
        /// The rejected sequence number.
        sn: u64,
    },

    /// A length-prefixed control value ended before its declared length.
    CodecTruncated,

    /// A length-prefixed control value violated the canonical encoding
    /// (non-minimal length prefix, leading zero in an integer, or an
    /// over-long integer).
    CodecMalformed,

    /// A control value decoded to a different kind than the caller expected
    /// (e.g. a list where a byte string was required).
    CodecUnexpected,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::MacMismatch => write!(f, "record MAC mismatch"),
            Error::TruncatedBody { len } => write!(f, "truncated record body: {} bytes", len),
            Error::OversizedPayload { len } => {
                write!(f, "payload of {} bytes exceeds record capacity", len)
            }
            Error::NoValidCookie => write!(f, "no valid cookie"),
            Error::HelloTooShort { len } => write!(f, "hello too short: {} bytes", len),
            Error::AeadFailed => write!(f, "packet failed authenticated decryption"),
            Error::PacketTooShort { len } => write!(f, "packet too short: {} bytes", len),
            Error::Replay { sn } => write!(f, "blocking replay of sequence number {}", sn),
            Error::CodecTruncated => write!(f, "control value truncated"),
            Error::CodecMalformed => write!(f, "control value malformed"),
            Error::CodecUnexpected => write!(f, "control value of unexpected kind"),
        }
    }
}

impl error::Error for Error {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::other(e)
    }
}

#[cfg(test)]
mod test {
    use std::io::ErrorKind;

    use super::*;

    #[test]
    fn test_roundtrip_through_io_error() {
        let io_err: io::Error = Error::MacMismatch.into();
        assert_eq!(io_err.kind(), ErrorKind::Other);
        let inner = io_err
            .get_ref()
            .and_then(|e| e.downcast_ref::<Error>())
            .unwrap();
        assert_eq!(*inner, Error::MacMismatch);
    }
}
