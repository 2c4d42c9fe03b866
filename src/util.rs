//! Keys and identifiers.

use core::fmt;

use snafu::{ResultExt, Snafu};

/// Failed to decode an identifier from z-base-32.
#[derive(Debug, Snafu)]
#[snafu(display("identifier is not valid z-base-32"))]
pub struct IdentifierDecodeError {
    source: z32::Z32Error,
}

/// Decoded key bytes did not have the length of an ed25519 public key.
#[derive(Debug, Snafu)]
#[snafu(display("public key must be 32 bytes, but got {len} byte(s)"))]
pub struct InvalidKeyLength {
    len: usize,
}

/// Raw bytes of an ed25519 public key, the address of a record.
#[derive(
    derive_more::From, derive_more::Into, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub struct PublicKeyBytes([u8; 32]);

impl PublicKeyBytes {
    pub fn to_z32(&self) -> String {
        z32::encode(&self.0)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_identifier(&self) -> Identifier {
        Identifier(self.to_z32())
    }
}

impl fmt::Display for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_z32())
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({})", self.to_z32())
    }
}

impl TryFrom<&[u8]> for PublicKeyBytes {
    type Error = InvalidKeyLength;
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; 32] = value
            .try_into()
            .map_err(|_| InvalidKeyLengthSnafu { len: value.len() }.build())?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8; 32]> for PublicKeyBytes {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

/// The z-base-32 form of a public key, as supplied by callers.
///
/// An identifier is kept verbatim: it is the cache key and the DHT target, and it is
/// only decoded to key bytes when a lookup actually needs them.
#[derive(Clone, PartialEq, Eq, Hash, derive_more::Display, derive_more::Debug)]
#[display("{_0}")]
#[debug("Identifier({_0})")]
pub struct Identifier(String);

impl Identifier {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the identifier to raw bytes.
    ///
    /// This only fails for input outside of the z-base-32 alphabet. The result is not
    /// guaranteed to have the length of a public key, see [`Self::to_public_key`].
    pub fn decode(&self) -> Result<Vec<u8>, IdentifierDecodeError> {
        z32::decode(self.0.as_bytes()).context(IdentifierDecodeSnafu)
    }

    /// Decode the identifier to public key bytes.
    ///
    /// The outer error is a decoding failure, the inner one a length mismatch.
    pub fn to_public_key(
        &self,
    ) -> Result<Result<PublicKeyBytes, InvalidKeyLength>, IdentifierDecodeError> {
        let bytes = self.decode()?;
        Ok(PublicKeyBytes::try_from(bytes.as_slice()))
    }
}
