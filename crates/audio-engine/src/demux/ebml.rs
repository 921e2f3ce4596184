//! EBML variable-length integers and element headers.
//!
//! The number of leading zero bits in the first byte selects the width of a vint:
//! - element ids keep their marker bit and are 1..=4 bytes wide
//! - sizes drop the marker bit and are 1..=8 bytes wide; an all-ones payload means the size is
//!   unknown and is reported as [`UNKNOWN_SIZE`], which must never be used in arithmetic
//!
//! Container elements are walked with a [`Budget`]: each child's header and payload are
//! subtracted from the parent's remaining size, and the walk ends when the budget is exhausted.

use crate::error::DemuxError;
use crate::source::{ByteSource, ByteSourceExt};

pub const UNKNOWN_SIZE: u64 = u64::MAX;

const MAX_ID_WIDTH: usize = 4;
const MAX_SIZE_WIDTH: usize = 8;
/// Upper bound for binary payloads read into memory (codec private data, blocks).
pub const MAX_BINARY_SIZE: u64 = 16 * 1024 * 1024;

fn vint_width(first: u8) -> usize {
    first.leading_zeros() as usize + 1
}

/// Decode an element id, returning the id (marker bit included) and its width.
pub fn decode_id(bytes: &[u8]) -> Option<(u32, usize)> {
    let first = *bytes.first()?;
    let width = vint_width(first);
    if width > MAX_ID_WIDTH || bytes.len() < width {
        return None;
    }
    let id = bytes[..width].iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);
    Some((id, width))
}

/// Decode an unsigned size, returning the value (or [`UNKNOWN_SIZE`]) and its width.
pub fn decode_size(bytes: &[u8]) -> Option<(u64, usize)> {
    let first = *bytes.first()?;
    let width = vint_width(first);
    if width > MAX_SIZE_WIDTH || bytes.len() < width {
        return None;
    }
    let mask = (0xffu16 >> width) as u8;
    let value = bytes[1..width]
        .iter()
        .fold((first & mask) as u64, |acc, b| (acc << 8) | *b as u64);
    if value == all_ones(width) {
        return Some((UNKNOWN_SIZE, width));
    }
    Some((value, width))
}

/// Decode a signed vint as used by EBML lacing (value biased by half the range).
pub fn decode_signed(bytes: &[u8]) -> Option<(i64, usize)> {
    let first = *bytes.first()?;
    let width = vint_width(first);
    if width > MAX_SIZE_WIDTH || bytes.len() < width {
        return None;
    }
    let mask = (0xffu16 >> width) as u8;
    let raw = bytes[1..width]
        .iter()
        .fold((first & mask) as u64, |acc, b| (acc << 8) | *b as u64);
    let bias = (1i64 << (7 * width - 1)) - 1;
    Some((raw as i64 - bias, width))
}

fn all_ones(width: usize) -> u64 {
    (1u64 << (7 * width)) - 1
}

/// Smallest width able to carry `value` without colliding with the unknown-size pattern.
pub fn size_width(value: u64) -> usize {
    (1..=MAX_SIZE_WIDTH)
        .find(|w| value < all_ones(*w))
        .unwrap_or(MAX_SIZE_WIDTH)
}

pub fn encode_id(id: u32) -> Vec<u8> {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
    bytes[skip..].to_vec()
}

/// Encode a size, using `width` bytes when given. [`UNKNOWN_SIZE`] encodes as all ones.
pub fn encode_size(value: u64, width: Option<usize>) -> Vec<u8> {
    let width = width
        .unwrap_or_else(|| if value == UNKNOWN_SIZE { 1 } else { size_width(value) })
        .clamp(1, MAX_SIZE_WIDTH);
    let payload = if value == UNKNOWN_SIZE { all_ones(width) } else { value };
    let mut bytes = payload.to_be_bytes()[MAX_SIZE_WIDTH - width..].to_vec();
    bytes[0] |= 0x80 >> (width - 1);
    bytes
}

pub fn encode_signed(value: i64) -> Vec<u8> {
    let width = (1..=MAX_SIZE_WIDTH)
        .find(|w| {
            let bias = (1i64 << (7 * w - 1)) - 1;
            value >= -bias && value <= bias
        })
        .unwrap_or(MAX_SIZE_WIDTH);
    let bias = (1i64 << (7 * width - 1)) - 1;
    encode_size((value + bias) as u64, Some(width))
}

/// A parsed element header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub id: u32,
    /// Payload size, or [`UNKNOWN_SIZE`].
    pub size: u64,
    /// Absolute offset of the payload.
    pub offset: u64,
    pub header_len: u64,
}

impl Element {
    pub fn is_unknown_size(&self) -> bool {
        self.size == UNKNOWN_SIZE
    }

    /// Absolute offset just past the payload.
    pub fn end(&self) -> Option<u64> {
        (!self.is_unknown_size()).then(|| self.offset + self.size)
    }
}

pub fn read_id<S: ByteSource + ?Sized>(src: &mut S) -> Result<(u32, usize), DemuxError> {
    let mut buf = [0u8; MAX_ID_WIDTH];
    src.read_exact(&mut buf[..1])?;
    let width = vint_width(buf[0]);
    if width > MAX_ID_WIDTH {
        return Err(DemuxError::malformed(buf[0] as u32, "invalid element id"));
    }
    src.read_exact(&mut buf[1..width])?;
    decode_id(&buf[..width]).ok_or(DemuxError::malformed(buf[0] as u32, "invalid element id"))
}

pub fn read_size<S: ByteSource + ?Sized>(src: &mut S, id: u32) -> Result<(u64, usize), DemuxError> {
    let mut buf = [0u8; MAX_SIZE_WIDTH];
    src.read_exact(&mut buf[..1])?;
    let width = vint_width(buf[0]);
    if width > MAX_SIZE_WIDTH {
        return Err(DemuxError::malformed(id, "invalid element size"));
    }
    src.read_exact(&mut buf[1..width])?;
    decode_size(&buf[..width]).ok_or(DemuxError::malformed(id, "invalid element size"))
}

pub fn read_element<S: ByteSource + ?Sized>(src: &mut S) -> Result<Element, DemuxError> {
    let (id, id_len) = read_id(src)?;
    let (size, size_len) = read_size(src, id)?;
    let offset = src.tell()?;
    Ok(Element {
        id,
        size,
        offset,
        header_len: (id_len + size_len) as u64,
    })
}

/// Remaining payload of a container element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    remaining: Option<u64>,
}

impl Budget {
    pub fn of(element: &Element) -> Self {
        Self {
            remaining: element.end().map(|_| element.size),
        }
    }

    pub fn unbounded() -> Self {
        Self { remaining: None }
    }

    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    pub fn is_bounded(&self) -> bool {
        self.remaining.is_some()
    }

    /// Subtract a whole child (header and payload) from the budget.
    pub fn consume(&mut self, child: &Element) -> Result<(), DemuxError> {
        if let Some(remaining) = self.remaining.as_mut() {
            if child.is_unknown_size() {
                return Err(DemuxError::malformed(child.id, "unknown size inside sized parent"));
            }
            let used = child.header_len + child.size;
            if used > *remaining {
                return Err(DemuxError::Overrun { id: child.id });
            }
            *remaining -= used;
        }
        Ok(())
    }

    pub fn consume_bytes(&mut self, n: u64) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(n);
        }
    }
}

/// Skip whatever `visit` left unread of `element`'s payload.
pub fn finish_element<S: ByteSource + ?Sized>(src: &mut S, element: &Element) -> Result<(), DemuxError> {
    let Some(end) = element.end() else {
        return Ok(());
    };
    let pos = src.tell()?;
    if pos > end {
        return Err(DemuxError::Overrun { id: element.id });
    }
    src.skip(end - pos)?;
    Ok(())
}

/// Walk the children of `parent`, calling `visit` for each child header.
///
/// `visit` may read any prefix of a child's payload; the rest is skipped. Unknown-size parents
/// are walked until end of stream.
pub fn for_each_child<S, F>(src: &mut S, parent: &Element, mut visit: F) -> Result<(), DemuxError>
where
    S: ByteSource + ?Sized,
    F: FnMut(&mut S, &Element) -> Result<(), DemuxError>,
{
    let mut budget = Budget::of(parent);
    loop {
        match budget.remaining() {
            Some(0) => break,
            // Too short for another header: padding.
            Some(r) if r < 2 => {
                src.skip(r)?;
                break;
            }
            _ => {}
        }
        let child = match read_element(src) {
            Ok(child) => child,
            Err(DemuxError::Source(crate::error::SourceError::Eof)) if !budget.is_bounded() => break,
            Err(e) => return Err(e),
        };
        budget.consume(&child)?;
        visit(src, &child)?;
        finish_element(src, &child)?;
    }
    Ok(())
}

pub fn read_uint<S: ByteSource + ?Sized>(src: &mut S, element: &Element) -> Result<u64, DemuxError> {
    if element.size > 8 {
        return Err(DemuxError::malformed(element.id, "integer wider than 8 bytes"));
    }
    let mut value = 0u64;
    for _ in 0..element.size {
        value = (value << 8) | src.read_u8()? as u64;
    }
    Ok(value)
}

pub fn read_int<S: ByteSource + ?Sized>(src: &mut S, element: &Element) -> Result<i64, DemuxError> {
    let raw = read_uint(src, element)?;
    if element.size == 0 || element.size == 8 {
        return Ok(raw as i64);
    }
    let shift = 64 - 8 * element.size as u32;
    Ok(((raw << shift) as i64) >> shift)
}

pub fn read_float<S: ByteSource + ?Sized>(src: &mut S, element: &Element) -> Result<f64, DemuxError> {
    match element.size {
        0 => Ok(0.0),
        4 => Ok(src.read_f32_be()? as f64),
        8 => Ok(src.read_f64_be()?),
        _ => Err(DemuxError::malformed(element.id, "float must be 4 or 8 bytes")),
    }
}

pub fn read_binary<S: ByteSource + ?Sized>(src: &mut S, element: &Element) -> Result<Vec<u8>, DemuxError> {
    if element.size > MAX_BINARY_SIZE {
        return Err(DemuxError::malformed(element.id, "binary payload too large"));
    }
    let mut data = vec![0u8; element.size as usize];
    src.read_exact(&mut data)?;
    Ok(data)
}

pub fn read_string<S: ByteSource + ?Sized>(src: &mut S, element: &Element) -> Result<String, DemuxError> {
    let data = read_binary(src, element)?;
    let text = String::from_utf8_lossy(&data);
    Ok(text.trim_end_matches('\0').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StreamSource;
    use std::io::Cursor;

    #[test]
    fn size_round_trip_over_id_widths() {
        let ids = [0xec_u32, 0x4282, 0x2ad7b1, 0x1a45dfa3];
        let sizes = [0u64, 127, 128, (1 << 21) - 2, UNKNOWN_SIZE];
        for id in ids {
            for size in sizes {
                let mut bytes = encode_id(id);
                assert_eq!(bytes.len(), (32 - id.leading_zeros() as usize).div_ceil(8));
                bytes.extend(encode_size(size, None));
                let (got_id, id_len) = decode_id(&bytes).unwrap();
                let (got_size, _) = decode_size(&bytes[id_len..]).unwrap();
                assert_eq!(got_id, id);
                assert_eq!(got_size, size, "id {id:#x}");
            }
        }
    }

    #[test]
    fn all_ones_payload_means_unknown() {
        assert_eq!(decode_size(&[0xff]), Some((UNKNOWN_SIZE, 1)));
        assert_eq!(decode_size(&[0x01, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]), Some((UNKNOWN_SIZE, 8)));
        // 127 does not fit one byte because 0xff is reserved.
        assert_eq!(encode_size(127, None), vec![0x40, 0x7f]);
        assert_eq!(decode_size(&[0x40, 0x7f]), Some((127, 2)));
    }

    #[test]
    fn rejects_invalid_first_bytes() {
        assert!(decode_id(&[0x08, 0, 0, 0, 0]).is_none());
        assert!(decode_size(&[0x00, 1, 2]).is_none());
        assert!(decode_size(&[0x40]).is_none());
    }

    #[test]
    fn signed_round_trip() {
        for v in [-8191i64, -64, -1, 0, 1, 63, 64, 8191, 100_000] {
            let bytes = encode_signed(v);
            assert_eq!(decode_signed(&bytes), Some((v, bytes.len())));
        }
    }

    #[test]
    fn walks_children_with_budget() {
        // parent(0x1a45dfa3) { 0x4282 "webm", 0xec void(2) }
        let mut body = encode_id(0x4282);
        body.extend(encode_size(4, None));
        body.extend(b"webm");
        body.extend(encode_id(0xec));
        body.extend(encode_size(2, None));
        body.extend([0, 0]);
        let mut bytes = encode_id(0x1a45dfa3);
        bytes.extend(encode_size(body.len() as u64, None));
        bytes.extend(&body);
        bytes.extend([0xaa]); // trailing byte outside the parent

        let mut src = StreamSource::new(Cursor::new(bytes));
        let parent = read_element(&mut src).unwrap();
        let mut seen = Vec::new();
        for_each_child(&mut src, &parent, |src, child| {
            if child.id == 0x4282 {
                seen.push(read_string(src, child)?);
            } else {
                seen.push(format!("{:#x}", child.id));
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["webm".to_string(), "0xec".to_string()]);
        assert_eq!(src.read_u8().unwrap(), 0xaa);
    }

    #[test]
    fn child_overrunning_parent_is_an_error() {
        let mut bytes = encode_id(0x1a45dfa3);
        bytes.extend(encode_size(3, None));
        bytes.extend(encode_id(0xec));
        bytes.extend(encode_size(5, None));
        bytes.extend([0; 5]);
        let mut src = StreamSource::new(Cursor::new(bytes));
        let parent = read_element(&mut src).unwrap();
        let err = for_each_child(&mut src, &parent, |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, DemuxError::Overrun { id: 0xec }));
    }

    #[test]
    fn integer_readers() {
        let mut src = StreamSource::new(Cursor::new(vec![0xff, 0xfe, 0x01, 0x00]));
        let el = Element { id: 0xfb, size: 2, offset: 0, header_len: 2 };
        assert_eq!(read_int(&mut src, &el).unwrap(), -2);
        assert_eq!(read_uint(&mut src, &el).unwrap(), 256);
    }
}
