//! Reading and writing git packfiles (version 2).

use std::{
    collections::HashMap,
    io::{Read, Write},
};

use anyhow::{Context, Result, bail, ensure};
use flate2::{Compression, bufread::ZlibDecoder, write::ZlibEncoder};
use sha1::{Digest, Sha1};

use crate::object::{OID_LEN, Object, ObjectId, ObjectKind};

/// Pack type number for an offset delta.
const OFS_DELTA: u8 = 6;
/// Pack type number for a reference delta.
const REF_DELTA: u8 = 7;
/// Size of the `PACK` header.
const HEADER_LEN: usize = 12;
/// Largest buffer reserved up front from a size the pack claims.
const MAX_PREALLOC: usize = 1 << 20;

/// An entry as stored in the pack, before delta resolution.
enum RawEntry {
    /// A whole object.
    Full(ObjectKind, Vec<u8>),
    /// Delta instructions against `base`.
    Delta(DeltaBase, Vec<u8>),
}

/// Where a delta's base object lives.
#[derive(Clone, Copy)]
enum DeltaBase {
    /// Pack offset of the base entry.
    Offset(usize),
    /// Id of the base object.
    Id(ObjectId),
}

/// Bounds-checked cursor over the pack bytes.
struct Cursor<'a> {
    /// Whole pack.
    data: &'a [u8],
    /// Next unread offset.
    pos: usize,
}

impl Cursor<'_> {
    /// Read one byte.
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .with_context(|| format!("pack truncated at offset {}", self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    /// Read `n` bytes.
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self.pos + n;
        ensure!(end <= self.data.len(), "pack truncated at offset {}", self.pos);
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Inflate one zlib stream expected to produce `size` bytes.
    fn inflate(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(&self.data[self.pos..]);
        let mut out = Vec::with_capacity(size.min(MAX_PREALLOC));
        // One byte past the claimed size is enough to detect a mismatch.
        let limit = u64::try_from(size)?.saturating_add(1);
        decoder
            .by_ref()
            .take(limit)
            .read_to_end(&mut out)
            .with_context(|| format!("corrupt zlib stream at offset {}", self.pos))?;
        ensure!(
            out.len() == size,
            "entry at offset {} inflated to {} bytes, expected {size}",
            self.pos,
            out.len()
        );
        self.pos += usize::try_from(decoder.total_in())?;
        Ok(out)
    }
}

/// Add the 7-bit group `part` at `shift` to `value`, failing if bits would be lost.
fn push_varint_bits(value: usize, part: u8, shift: u32) -> Option<usize> {
    let part = usize::from(part & 0x7f);
    let shifted = part.checked_shl(shift)?;
    (shifted >> shift == part).then_some(value | shifted)
}

/// Decode a packfile into fully resolved objects.
///
/// Deltas (both offset and reference) must have their base inside the same
/// pack. The trailing checksum is verified.
pub fn parse_pack(data: &[u8]) -> Result<Vec<Object>> {
    ensure!(
        data.len() >= HEADER_LEN + OID_LEN,
        "pack is too short ({} bytes)",
        data.len()
    );
    let (body, trailer) = data.split_at(data.len() - OID_LEN);
    let digest = Sha1::digest(body);
    ensure!(digest.as_slice() == trailer, "pack checksum mismatch");

    ensure!(&body[..4] == b"PACK", "missing PACK signature");
    let version = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    ensure!(version == 2 || version == 3, "unsupported pack version {version}");
    let count = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);

    let mut cursor = Cursor {
        data: body,
        pos: HEADER_LEN,
    };
    let mut entries = Vec::new();
    for _ in 0..count {
        let offset = cursor.pos;
        entries.push((offset, read_entry(&mut cursor, offset)?));
    }
    ensure!(
        cursor.pos == body.len(),
        "{} trailing bytes after last pack entry",
        body.len() - cursor.pos
    );

    resolve(entries)
}

/// Read the entry starting at `offset`.
fn read_entry(cursor: &mut Cursor<'_>, offset: usize) -> Result<RawEntry> {
    let mut c = cursor.byte()?;
    let kind = (c >> 4) & 0x07;
    let mut size = usize::from(c & 0x0f);
    let mut shift = 4;
    while c & 0x80 != 0 {
        c = cursor.byte()?;
        size = push_varint_bits(size, c, shift)
            .with_context(|| format!("entry size overflows at offset {offset}"))?;
        shift += 7;
    }

    match kind {
        OFS_DELTA => {
            let mut c = cursor.byte()?;
            let mut back = usize::from(c & 0x7f);
            while c & 0x80 != 0 {
                c = cursor.byte()?;
                back = back
                    .checked_add(1)
                    .and_then(|b| b.checked_mul(0x80))
                    .with_context(|| format!("delta base offset overflows at offset {offset}"))?
                    | usize::from(c & 0x7f);
            }
            let base_offset = offset
                .checked_sub(back)
                .with_context(|| format!("delta base before start of pack at offset {offset}"))?;
            Ok(RawEntry::Delta(
                DeltaBase::Offset(base_offset),
                cursor.inflate(size)?,
            ))
        }
        REF_DELTA => {
            let base = ObjectId::from_bytes(cursor.take(OID_LEN)?)?;
            Ok(RawEntry::Delta(DeltaBase::Id(base), cursor.inflate(size)?))
        }
        code => {
            let kind = ObjectKind::from_pack_code(code)
                .with_context(|| format!("invalid object type {code} at offset {offset}"))?;
            Ok(RawEntry::Full(kind, cursor.inflate(size)?))
        }
    }
}

/// Resolve delta chains until every entry is a whole object.
fn resolve(entries: Vec<(usize, RawEntry)>) -> Result<Vec<Object>> {
    let by_offset: HashMap<usize, usize> = entries
        .iter()
        .enumerate()
        .map(|(index, (offset, _))| (*offset, index))
        .collect();
    let mut resolved: Vec<Option<Object>> = vec![None; entries.len()];
    let mut by_id: HashMap<ObjectId, usize> = HashMap::new();
    let mut pending = Vec::new();

    for (index, (_, entry)) in entries.into_iter().enumerate() {
        match entry {
            RawEntry::Full(kind, data) => {
                let object = Object::new(kind, data);
                by_id.insert(object.id(), index);
                resolved[index] = Some(object);
            }
            RawEntry::Delta(base, delta) => pending.push((index, base, delta)),
        }
    }

    // Each pass resolves at least one level of every delta chain.
    while !pending.is_empty() {
        let before = pending.len();
        let mut still_pending = Vec::new();
        for (index, base, delta) in pending {
            let base_index = match base {
                DeltaBase::Offset(offset) => Some(
                    *by_offset
                        .get(&offset)
                        .with_context(|| format!("no pack entry at offset {offset}"))?,
                ),
                DeltaBase::Id(id) => by_id.get(&id).copied(),
            };
            let Some(base_object) = base_index.and_then(|i| resolved[i].as_ref()) else {
                still_pending.push((index, base, delta));
                continue;
            };
            let data = apply_delta(base_object.data(), &delta)
                .with_context(|| format!("failed to apply delta against {}", base_object.id()))?;
            let object = Object::new(base_object.kind(), data);
            by_id.insert(object.id(), index);
            resolved[index] = Some(object);
        }
        if still_pending.len() == before {
            let missing: Vec<String> = still_pending
                .iter()
                .filter_map(|(_, base, _)| match base {
                    DeltaBase::Id(id) => Some(id.to_string()),
                    DeltaBase::Offset(_) => None,
                })
                .collect();
            bail!(
                "pack has {} unresolvable deltas (missing bases: {})",
                still_pending.len(),
                missing.join(", ")
            );
        }
        pending = still_pending;
    }

    Ok(resolved.into_iter().flatten().collect())
}

/// Read a little-endian base-128 size from the start of a delta.
fn delta_size(delta: &[u8], pos: &mut usize) -> Result<usize> {
    let mut size = 0usize;
    let mut shift = 0;
    loop {
        let c = *delta.get(*pos).context("delta header truncated")?;
        *pos += 1;
        size = push_varint_bits(size, c, shift).context("delta size overflows")?;
        shift += 7;
        if c & 0x80 == 0 {
            return Ok(size);
        }
    }
}

/// Apply git delta instructions to `base`.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let source_size = delta_size(delta, &mut pos)?;
    ensure!(
        source_size == base.len(),
        "delta expects a {source_size}-byte base, got {}",
        base.len()
    );
    let target_size = delta_size(delta, &mut pos)?;
    let mut out = Vec::with_capacity(target_size.min(MAX_PREALLOC));

    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;
        if op & 0x80 != 0 {
            let mut offset = 0usize;
            let mut size = 0usize;
            for bit in 0..4 {
                if op & (1 << bit) != 0 {
                    offset |= usize::from(*delta.get(pos).context("copy op truncated")?) << (8 * bit);
                    pos += 1;
                }
            }
            for bit in 0..3 {
                if op & (0x10 << bit) != 0 {
                    size |= usize::from(*delta.get(pos).context("copy op truncated")?) << (8 * bit);
                    pos += 1;
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let end = offset
                .checked_add(size)
                .filter(|end| *end <= base.len())
                .context("copy op outside of base")?;
            out.extend_from_slice(&base[offset..end]);
        } else if op != 0 {
            let len = usize::from(op);
            let data = delta.get(pos..pos + len).context("insert op truncated")?;
            out.extend_from_slice(data);
            pos += len;
        } else {
            bail!("reserved delta opcode 0");
        }
        ensure!(
            out.len() <= target_size,
            "delta output exceeds its {target_size}-byte target"
        );
    }

    ensure!(
        out.len() == target_size,
        "delta produced {} bytes, expected {target_size}",
        out.len()
    );
    Ok(out)
}

/// Encode `objects` as an undeltified version 2 pack.
pub fn write_pack(objects: &[Object]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(b"PACK");
    out.extend_from_slice(&2u32.to_be_bytes());
    let count = u32::try_from(objects.len()).context("too many objects for one pack")?;
    out.extend_from_slice(&count.to_be_bytes());

    for object in objects {
        let mut size = object.data().len();
        let mut c = (object.kind().pack_code() << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size != 0 {
            out.push(c | 0x80);
            c = (size & 0x7f) as u8;
            size >>= 7;
        }
        out.push(c);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(object.data())?;
        out.extend(encoder.finish()?);
    }

    let digest = Sha1::digest(&out);
    out.extend_from_slice(&digest);
    Ok(out)
}
