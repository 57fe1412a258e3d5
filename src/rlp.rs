//! Recursive-length-prefix codec for bridge control messages.
//!
//! Control verbs inside a relay session (`"ping"`, `"conn"`, `"conn/e2e"`)
//! and the tunnel's sequence-numbered frames are encoded with the same
//! length-prefix scheme the deployed fleet uses. Only the subset exercised
//! by the protocol is implemented: byte strings, unsigned integers
//! (minimal big-endian) and lists.
//!
//! Decoding is strict: non-minimal length prefixes, leading zeros in
//! integers and over-long integers are rejected rather than normalised.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Longest byte string a peer may send as a single control value.
///
/// Control values are verbs, host names and cookies; tunnel frames relayed
/// as byte strings stay under the record payload cap as well.
pub const MAX_ITEM_LEN: usize = 65536;

/// Appends the encoding of a byte string to `out`.
pub fn encode_bytes(out: &mut Vec<u8>, b: &[u8]) {
    if b.len() == 1 && b[0] < 0x80 {
        out.push(b[0]);
    } else {
        encode_length(out, b.len(), 0x80);
        out.extend_from_slice(b);
    }
}

/// Appends the encoding of an unsigned integer to `out`.
///
/// Integers are byte strings holding the minimal big-endian form of the
/// value; zero encodes as the empty string.
pub fn encode_uint(out: &mut Vec<u8>, value: u64) {
    let be = value.to_be_bytes();
    let first = be.iter().position(|&b| b != 0).unwrap_or(be.len());
    encode_bytes(out, &be[first..]);
}

/// Appends the encoding of a list to `out`, given the already-encoded
/// concatenation of its items.
pub fn encode_list(out: &mut Vec<u8>, items: &[u8]) {
    encode_length(out, items.len(), 0xc0);
    out.extend_from_slice(items);
}

fn encode_length(out: &mut Vec<u8>, len: usize, offset: u8) {
    if len <= 55 {
        out.push(offset + len as u8);
    } else {
        let be = (len as u64).to_be_bytes();
        let first = be.iter().position(|&b| b != 0).unwrap_or(be.len());
        out.push(offset + 55 + (be.len() - first) as u8);
        out.extend_from_slice(&be[first..]);
    }
}

/// Incremental decoder over an in-memory buffer.
///
/// Items are consumed front to back; [`Decoder::list`] returns a nested
/// decoder scoped to the list payload.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// True if every item has been consumed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Decodes the next item as a byte string.
    pub fn bytes(&mut self) -> Result<&'a [u8], Error> {
        let (header, rest) = split_first(self.buf)?;
        let (value, rest) = match header {
            0x00..=0x7f => (&self.buf[..1], rest),
            0x80..=0xbf => {
                let (len, rest) = decode_length(header, 0x80, rest)?;
                if header == 0x81 && rest.first().is_some_and(|&b| b < 0x80) {
                    // A lone byte below 0x80 must be encoded as itself.
                    return Err(Error::CodecMalformed);
                }
                split_at(rest, len)?
            }
            _ => return Err(Error::CodecUnexpected),
        };
        self.buf = rest;
        Ok(value)
    }

    /// Decodes the next item as an unsigned integer.
    pub fn uint(&mut self) -> Result<u64, Error> {
        let bytes = self.bytes()?;
        if bytes.len() > 8 || bytes.first() == Some(&0) {
            return Err(Error::CodecMalformed);
        }
        let mut be = [0u8; 8];
        be[8 - bytes.len()..].copy_from_slice(bytes);
        Ok(u64::from_be_bytes(be))
    }

    /// Decodes the next item as a list, returning a decoder over its items.
    pub fn list(&mut self) -> Result<Decoder<'a>, Error> {
        let (header, rest) = split_first(self.buf)?;
        if header < 0xc0 {
            return Err(Error::CodecUnexpected);
        }
        let (len, rest) = decode_length(header, 0xc0, rest)?;
        let (payload, rest) = split_at(rest, len)?;
        self.buf = rest;
        Ok(Decoder::new(payload))
    }
}

fn split_first(buf: &[u8]) -> Result<(u8, &[u8]), Error> {
    match buf.split_first() {
        Some((&b, rest)) => Ok((b, rest)),
        None => Err(Error::CodecTruncated),
    }
}

fn split_at(buf: &[u8], mid: usize) -> Result<(&[u8], &[u8]), Error> {
    if buf.len() < mid {
        return Err(Error::CodecTruncated);
    }
    Ok(buf.split_at(mid))
}

/// Decodes the length following a `header` byte in the range starting at
/// `offset`, returning the length and the remaining buffer.
fn decode_length(header: u8, offset: u8, buf: &[u8]) -> Result<(usize, &[u8]), Error> {
    let header = header - offset;
    if header <= 55 {
        return Ok((header as usize, buf));
    }
    let len_len = (header - 55) as usize;
    let (len_bytes, rest) = split_at(buf, len_len)?;
    if len_len > 8 || len_bytes.first() == Some(&0) {
        return Err(Error::CodecMalformed);
    }
    let mut be = [0u8; 8];
    be[8 - len_bytes.len()..].copy_from_slice(len_bytes);
    let len = u64::from_be_bytes(be) as usize;
    if len <= 55 {
        // Must have used the short form.
        return Err(Error::CodecMalformed);
    }
    Ok((len, rest))
}

/// Reads one byte-string item from `reader`.
///
/// Used for control verbs, which arrive one value at a time over a relay
/// session. Items longer than [`MAX_ITEM_LEN`] are refused.
pub async fn read_bytes<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let header = reader.read_u8().await?;
    let len = match header {
        0x00..=0x7f => return Ok(vec![header]),
        0x80..=0xb7 => (header - 0x80) as usize,
        0xb8..=0xbf => {
            let len_len = (header - 0xb7) as usize;
            let mut be = [0u8; 8];
            reader.read_exact(&mut be[8 - len_len..]).await?;
            if be[8 - len_len] == 0 {
                return Err(Error::CodecMalformed.into());
            }
            let len = u64::from_be_bytes(be) as usize;
            if len <= 55 {
                return Err(Error::CodecMalformed.into());
            }
            len
        }
        _ => return Err(Error::CodecUnexpected.into()),
    };
    if len > MAX_ITEM_LEN {
        return Err(Error::CodecMalformed.into());
    }
    let mut value = vec![0u8; len];
    reader.read_exact(&mut value).await?;
    if value.len() == 1 && value[0] < 0x80 {
        return Err(Error::CodecMalformed.into());
    }
    Ok(value)
}

/// Reads one unsigned-integer item from `reader`.
pub async fn read_uint<R>(reader: &mut R) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_bytes(reader).await?;
    if bytes.len() > 8 || bytes.first() == Some(&0) {
        return Err(Error::CodecMalformed.into());
    }
    let mut be = [0u8; 8];
    be[8 - bytes.len()..].copy_from_slice(&bytes);
    Ok(u64::from_be_bytes(be))
}

/// Writes one byte-string item to `writer` as a single write.
pub async fn write_bytes<W>(writer: &mut W, b: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(b.len() + 9);
    encode_bytes(&mut out, b);
    writer.write_all(&out).await
}

/// Writes one unsigned-integer item to `writer` as a single write.
pub async fn write_uint<W>(writer: &mut W, value: u64) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(9);
    encode_uint(&mut out, value);
    writer.write_all(&out).await
}
