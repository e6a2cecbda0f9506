//! Order-preserving encodings for use in keys.
//!
//! Vec<u8>:       0x00 is escaped with 0x00 0xff, terminated with 0x00 0x00.
//! u64:           Big-endian binary representation.
//! u64 (desc):    Bitwise complement of the big-endian representation, so
//!                that larger values order before smaller ones.
//!
//! The byte encoding sorts identically to a raw bytewise comparison of the
//! unencoded input, while remaining unambiguous when concatenated with other
//! encoded values.

use crate::error::{Error, Result};

/// Encodes a byte vector. 0x00 is escaped as 0x00 0xff, and 0x00 0x00 is used as a terminator.
/// See: https://activesphere.com/blog/2018/08/17/order-preserving-serialization
pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    // flat_map() obscures Iterator.size_hint(), so we explicitly allocate.
    let mut encoded = Vec::with_capacity(bytes.len() + 2);
    encoded.extend(
        bytes
            .iter()
            .flat_map(|b| match b {
                0x00 => vec![0x00, 0xff],
                b => vec![*b],
            })
            .chain(vec![0x00, 0x00]),
    );
    encoded
}

/// Decodes a byte vector from a slice and shortens the slice. See encode_bytes() for format.
pub fn take_bytes(bytes: &mut &[u8]) -> Result<Vec<u8>> {
    // Since we're generally decoding keys, and these are short, we begin allocating at half of
    // the byte size.
    let mut decoded = Vec::with_capacity(bytes.len() / 2);
    let mut iter = bytes.iter().enumerate();
    let taken = loop {
        match iter.next().map(|(_, b)| b) {
            Some(0x00) => match iter.next() {
                Some((i, 0x00)) => break i + 1,        // 0x00 0x00 is terminator
                Some((_, 0xff)) => decoded.push(0x00), // 0x00 0xff is escape sequence for 0x00
                Some((_, b)) => {
                    return Err(Error::Internal(format!("Invalid byte escape {:?}", b)))
                }
                None => return Err(Error::Internal("Unexpected end of bytes".into())),
            },
            Some(b) => decoded.push(*b),
            None => return Err(Error::Internal("Unexpected end of bytes".into())),
        }
    };
    *bytes = &bytes[taken..];
    Ok(decoded)
}

/// Encodes a u64. Simply uses the big-endian form, which preserves order.
pub fn encode_u64(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Decodes a u64. See encode_u64() for format.
pub fn decode_u64(bytes: [u8; 8]) -> u64 {
    u64::from_be_bytes(bytes)
}

/// Decodes a u64 from a slice and shrinks the slice.
pub fn take_u64(bytes: &mut &[u8]) -> Result<u64> {
    if bytes.len() < 8 {
        return Err(Error::Internal(format!("Unable to decode u64 from {} bytes", bytes.len())));
    }
    let mut buf = [0; 8];
    buf.copy_from_slice(&bytes[0..8]);
    let n = decode_u64(buf);
    *bytes = &bytes[8..];
    Ok(n)
}

/// Encodes a u64 in descending order, by taking the bitwise complement of the
/// big-endian form. Larger values thus sort before smaller ones.
pub fn encode_u64_desc(n: u64) -> [u8; 8] {
    encode_u64(!n)
}

/// Decodes a descending u64 from a slice and shrinks the slice. See encode_u64_desc() for format.
pub fn take_u64_desc(bytes: &mut &[u8]) -> Result<u64> {
    Ok(!take_u64(bytes)?)
}
