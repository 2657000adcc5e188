//! Git packet-line framing.
//!
//! Each packet is prefixed with a 4-character hex length that includes the
//! prefix itself:
//!
//! - `0000` -- flush packet (end of a section)
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet

use std::str;

use anyhow::{Context, Result, bail};

/// Largest packet git will accept, prefix included.
pub const MAX_PKT_LEN: usize = 65520;

/// Wire form of a flush packet.
pub const FLUSH: &[u8] = b"0000";

/// A single packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A data packet containing arbitrary bytes.
    Data(Vec<u8>),
    /// Flush packet (`0000`).
    Flush,
    /// Delimiter packet (`0001`).
    Delimiter,
    /// Response-end packet (`0002`).
    ResponseEnd,
}

/// Encode `data` as a packet line.
pub fn encode_data(data: &[u8]) -> Result<Vec<u8>> {
    let total_len = data.len() + 4;
    if total_len > MAX_PKT_LEN {
        bail!("packet-line data too large ({total_len} bytes)");
    }
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    Ok(buf)
}

/// Append `data` to `out` as one packet line.
pub fn push_data(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    out.extend(encode_data(data)?);
    Ok(())
}

/// Sequential reader over a buffer of packet lines.
///
/// Unlike a lenient scanner this fails on any malformed prefix, so truncated
/// server responses surface as errors instead of silently short reads.
pub struct PktReader<'a> {
    /// Input buffer.
    data: &'a [u8],
    /// Offset of the next unread byte.
    pos: usize,
}

impl<'a> PktReader<'a> {
    /// Read packets from `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Decode the next packet, or `None` at the end of input.
    pub fn next_pkt(&mut self) -> Result<Option<PktLine>> {
        let rest = self.remaining();
        if rest.is_empty() {
            return Ok(None);
        }
        let (len, pkt) = decode_one(rest)
            .with_context(|| format!("malformed packet line at offset {}", self.pos))?;
        self.pos += len;
        Ok(Some(pkt))
    }

    /// Decode packets up to and including the next flush, returning the data payloads.
    pub fn read_section(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        loop {
            match self.next_pkt()? {
                Some(PktLine::Data(data)) => lines.push(data),
                Some(PktLine::Flush) => return Ok(lines),
                Some(other) => bail!("unexpected {other:?} packet"),
                None => bail!("stream ended before flush packet"),
            }
        }
    }
}

/// Decode one packet from the start of `data`, returning its wire length.
fn decode_one(data: &[u8]) -> Result<(usize, PktLine)> {
    if data.len() < 4 {
        bail!("truncated length prefix");
    }
    let len_hex = str::from_utf8(&data[..4]).context("non-UTF-8 length prefix")?;
    let len = usize::from_str_radix(len_hex, 16)
        .with_context(|| format!("invalid length prefix '{len_hex}'"))?;
    match len {
        0 => Ok((4, PktLine::Flush)),
        1 => Ok((4, PktLine::Delimiter)),
        2 => Ok((4, PktLine::ResponseEnd)),
        3 => bail!("invalid length prefix 0003"),
        n if n > data.len() => {
            bail!("truncated packet: declared {n} bytes, {} available", data.len())
        }
        n => Ok((n, PktLine::Data(data[4..n].to_vec()))),
    }
}

/// Offset just past the first flush packet in `data`, if it is complete.
///
/// Used to find where a streamed ref advertisement ends.
pub fn section_end(data: &[u8]) -> Result<Option<usize>> {
    let mut pos = 0;
    while data.len() >= pos + 4 {
        let len_hex = str::from_utf8(&data[pos..pos + 4]).context("non-UTF-8 length prefix")?;
        let len = usize::from_str_radix(len_hex, 16)
            .with_context(|| format!("invalid length prefix '{len_hex}'"))?;
        match len {
            0 => return Ok(Some(pos + 4)),
            1 | 2 => pos += 4,
            3 => bail!("invalid length prefix 0003"),
            n => pos += n,
        }
    }
    Ok(None)
}

/// Strip one trailing newline from a text payload.
pub fn trim_newline(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\n").unwrap_or(data)
}
