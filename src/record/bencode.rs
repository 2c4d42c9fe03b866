//! Just enough bencode for BEP44 byte strings.

use snafu::{Snafu, ensure};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum BencodeError {
    #[snafu(display("missing length prefix"))]
    MissingPrefix,
    #[snafu(display("invalid length prefix"))]
    InvalidPrefix,
    #[snafu(display("declared length {declared} does not match {actual} remaining byte(s)"))]
    LengthMismatch { declared: usize, actual: usize },
}

/// Encode a byte string as `<len>:<bytes>`.
pub fn encode_bytes(value: &[u8]) -> Vec<u8> {
    let prefix = value.len().to_string();
    let mut out = Vec::with_capacity(prefix.len() + 1 + value.len());
    out.extend_from_slice(prefix.as_bytes());
    out.push(b':');
    out.extend_from_slice(value);
    out
}

/// Decode a single bencoded byte string, rejecting trailing data.
pub fn decode_bytes(encoded: &[u8]) -> Result<&[u8], BencodeError> {
    let colon = encoded
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| MissingPrefixSnafu.build())?;
    let prefix = &encoded[..colon];
    ensure!(
        !prefix.is_empty() && prefix.iter().all(u8::is_ascii_digit),
        InvalidPrefixSnafu
    );
    // leading zeros are not canonical bencode
    ensure!(prefix == b"0" || prefix[0] != b'0', InvalidPrefixSnafu);
    let declared: usize = std::str::from_utf8(prefix)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| InvalidPrefixSnafu.build())?;
    let rest = &encoded[colon + 1..];
    ensure!(
        rest.len() == declared,
        LengthMismatchSnafu {
            declared,
            actual: rest.len()
        }
    );
    Ok(rest)
}
