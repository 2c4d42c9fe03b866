//! Signed records, their wire layout and their verification.
//!
//! A record binds an opaque value and a sequence number to an ed25519 public key. The
//! signature covers the [BEP44] signable form of the value, which differs from the flat
//! layout used on the wire:
//!
//! ```text
//! signable: "3:seqi" <seq> "e1:v" <len> ":" <value>
//! wire:     <signature: 64> <seq: u64 big endian> <value>
//! ```
//!
//! [BEP44]: https://www.bittorrent.org/beps/bep_0044.html

use bytes::{BufMut, Bytes, BytesMut};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use snafu::{ResultExt, Snafu, ensure};

use crate::util::{Identifier, InvalidKeyLength, PublicKeyBytes};

pub mod bencode;

/// Default upper bound for the size of a record value, in bytes.
pub const DEFAULT_RECORD_SIZE_LIMIT: usize = 1000;

/// Length of the signature and sequence number that precede the value on the wire.
pub const WIRE_HEADER_LEN: usize = SIGNATURE_LEN + 8;

const SIGNATURE_LEN: usize = 64;

/// Error returned when a byte slice is too short to hold the wire layout.
#[derive(Debug, Snafu)]
#[snafu(display("expected at least {WIRE_HEADER_LEN} bytes, got {len}"))]
pub struct WireError {
    len: usize,
}

/// Reasons a record is refused.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ValidationError {
    #[snafu(display("missing required field `{field}`"))]
    MissingField { field: &'static str },
    #[snafu(display("value of {size} bytes exceeds the limit of {limit} bytes"))]
    TooLarge { size: usize, limit: usize },
    #[snafu(display("malformed record body"))]
    MalformedBody { source: WireError },
    #[snafu(display("identifier does not decode to a public key"))]
    KeyLength { source: InvalidKeyLength },
    #[snafu(display("public key is not a valid ed25519 point"))]
    InvalidPublicKey { source: ed25519_dalek::SignatureError },
    #[snafu(display("signature is invalid"))]
    InvalidSignature { source: ed25519_dalek::SignatureError },
}

/// The canonical signed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Public key owning the record.
    pub key: PublicKeyBytes,
    /// Opaque payload.
    pub value: Bytes,
    /// Caller supplied sequence number.
    pub seq: i64,
    /// Signature over [`signable`] of `seq` and `value`.
    pub signature: [u8; 64],
}

/// The externally visible part of a [`Record`]: everything but the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Opaque payload.
    pub value: Bytes,
    /// Sequence number.
    pub seq: i64,
    /// Signature.
    pub signature: [u8; 64],
}

/// A record in the shape the DHT put operation expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPutItem {
    /// Public key the item is stored under.
    pub key: PublicKeyBytes,
    /// Raw value, bencoded by the DHT client.
    pub value: Bytes,
    /// Sequence number.
    pub seq: i64,
    /// Signature.
    pub signature: [u8; 64],
}

/// Build the BEP44 signable bytes for an unsalted mutable item.
pub fn signable(seq: i64, value: &[u8]) -> Vec<u8> {
    let mut out = format!("3:seqi{seq}e1:v").into_bytes();
    out.extend_from_slice(&bencode::encode_bytes(value));
    out
}

impl Record {
    /// Sign `value` at `seq` with `signing_key`.
    pub fn new_signed(signing_key: &SigningKey, value: impl Into<Bytes>, seq: i64) -> Self {
        let value = value.into();
        let signature = signing_key.sign(&signable(seq, &value)).to_bytes();
        Self {
            key: signing_key.verifying_key().to_bytes().into(),
            value,
            seq,
            signature,
        }
    }

    /// Assemble a record from a key and the wire form of its response.
    pub fn from_parts(key: PublicKeyBytes, response: Response) -> Self {
        Self {
            key,
            value: response.value,
            seq: response.seq,
            signature: response.signature,
        }
    }

    /// Parse a publish request body for the record addressed by `id`.
    ///
    /// Only structural problems are reported here, the signature is checked by
    /// [`Self::validate`].
    pub fn from_request(key: &[u8], body: &[u8]) -> Result<Self, ValidationError> {
        let key = PublicKeyBytes::try_from(key).context(KeyLengthSnafu)?;
        let response = Response::from_bytes(body).context(MalformedBodySnafu)?;
        Ok(Self::from_parts(key, response))
    }

    /// The identifier this record is addressed by.
    pub fn identifier(&self) -> Identifier {
        self.key.to_identifier()
    }

    /// Check that all fields are set, the value fits into `max_size` and the signature
    /// verifies.
    pub fn validate(&self, max_size: usize) -> Result<(), ValidationError> {
        ensure!(!self.value.is_empty(), MissingFieldSnafu { field: "v" });
        ensure!(self.seq != 0, MissingFieldSnafu { field: "seq" });
        ensure!(
            self.key.as_bytes() != &[0u8; 32],
            MissingFieldSnafu { field: "k" }
        );
        ensure!(
            self.signature != [0u8; SIGNATURE_LEN],
            MissingFieldSnafu { field: "sig" }
        );
        ensure!(
            self.value.len() <= max_size,
            TooLargeSnafu {
                size: self.value.len(),
                limit: max_size
            }
        );
        let key = VerifyingKey::from_bytes(self.key.as_bytes()).context(InvalidPublicKeySnafu)?;
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&signable(self.seq, &self.value), &signature)
            .context(InvalidSignatureSnafu)?;
        Ok(())
    }

    pub fn to_response(&self) -> Response {
        Response {
            value: self.value.clone(),
            seq: self.seq,
            signature: self.signature,
        }
    }

    pub fn to_network_item(&self) -> NetworkPutItem {
        NetworkPutItem {
            key: self.key,
            value: self.value.clone(),
            seq: self.seq,
            signature: self.signature,
        }
    }
}

impl Response {
    /// Encode to the wire layout.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(WIRE_HEADER_LEN + self.value.len());
        buf.put_slice(&self.signature);
        buf.put_u64(self.seq as u64);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    /// Decode from the wire layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        ensure!(bytes.len() >= WIRE_HEADER_LEN, WireSnafu { len: bytes.len() });
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[..SIGNATURE_LEN]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[SIGNATURE_LEN..WIRE_HEADER_LEN]);
        Ok(Self {
            value: Bytes::copy_from_slice(&bytes[WIRE_HEADER_LEN..]),
            seq: u64::from_be_bytes(seq) as i64,
            signature,
        })
    }
}
