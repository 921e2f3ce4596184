//! Matroska block lacing.
//!
//! A laced block stores `count - 1` in its first byte followed by the sizes of every frame but
//! the last; the last frame takes whatever remains of the block. Sizes that do not add up to the
//! block payload are a hard error.

use crate::demux::ebml;
use crate::error::DemuxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lacing {
    None,
    Xiph,
    Fixed,
    Ebml,
}

impl Lacing {
    /// Lacing mode from the block flags byte (bits 1-2).
    pub fn from_flags(flags: u8) -> Lacing {
        match (flags >> 1) & 0x3 {
            0 => Lacing::None,
            1 => Lacing::Xiph,
            2 => Lacing::Fixed,
            _ => Lacing::Ebml,
        }
    }

    pub fn flag_bits(self) -> u8 {
        match self {
            Lacing::None => 0,
            Lacing::Xiph => 1 << 1,
            Lacing::Fixed => 2 << 1,
            Lacing::Ebml => 3 << 1,
        }
    }
}

const LACE_ID: u32 = 0xa3;

fn mismatch(laced: usize, available: usize) -> DemuxError {
    DemuxError::LaceMismatch { laced, available }
}

/// Split the lace header off `data` (the block payload after the flags byte).
///
/// Returns the frame sizes and the length of the lace header.
pub fn decode(lacing: Lacing, data: &[u8]) -> Result<(Vec<usize>, usize), DemuxError> {
    if lacing == Lacing::None {
        return Ok((vec![data.len()], 0));
    }
    let Some(&count_minus_one) = data.first() else {
        return Err(DemuxError::malformed(LACE_ID, "missing lace count"));
    };
    let count = count_minus_one as usize + 1;
    let mut pos = 1;
    let mut sizes = Vec::with_capacity(count);

    match lacing {
        Lacing::None => unreachable!("handled above"),
        Lacing::Xiph => {
            for _ in 0..count - 1 {
                let mut size = 0usize;
                loop {
                    let Some(&b) = data.get(pos) else {
                        return Err(DemuxError::malformed(LACE_ID, "truncated xiph lace"));
                    };
                    pos += 1;
                    size += b as usize;
                    if b != 0xff {
                        break;
                    }
                }
                sizes.push(size);
            }
        }
        Lacing::Fixed => {
            let payload = data.len() - pos;
            if payload % count != 0 {
                return Err(mismatch(payload - payload % count, payload));
            }
            sizes.resize(count, payload / count);
            return Ok((sizes, pos));
        }
        Lacing::Ebml => {
            if count > 1 {
                let (first, width) = ebml::decode_size(&data[pos..])
                    .filter(|(v, _)| *v != ebml::UNKNOWN_SIZE)
                    .ok_or(DemuxError::malformed(LACE_ID, "bad ebml lace size"))?;
                pos += width;
                let mut prev = first as i64;
                sizes.push(first as usize);
                for _ in 1..count - 1 {
                    let (delta, width) = ebml::decode_signed(&data[pos..])
                        .ok_or(DemuxError::malformed(LACE_ID, "bad ebml lace delta"))?;
                    pos += width;
                    prev = prev
                        .checked_add(delta)
                        .ok_or(DemuxError::malformed(LACE_ID, "lace size overflow"))?;
                    let size = usize::try_from(prev)
                        .map_err(|_| DemuxError::malformed(LACE_ID, "negative lace size"))?;
                    sizes.push(size);
                }
            }
        }
    }

    let available = data.len() - pos;
    let laced = sizes
        .iter()
        .try_fold(0usize, |total, &size| total.checked_add(size))
        .ok_or(mismatch(usize::MAX, available))?;
    if laced > available {
        return Err(mismatch(laced, available));
    }
    sizes.push(available - laced);
    Ok((sizes, pos))
}

/// Build the lace header for `sizes`. The last size is implied by the block length.
pub fn encode(lacing: Lacing, sizes: &[usize]) -> Vec<u8> {
    let mut out = Vec::new();
    if lacing == Lacing::None || sizes.is_empty() {
        return out;
    }
    out.push((sizes.len() - 1) as u8);
    let head = &sizes[..sizes.len() - 1];
    match lacing {
        Lacing::None | Lacing::Fixed => {}
        Lacing::Xiph => {
            for &size in head {
                out.extend(std::iter::repeat_n(0xff, size / 255));
                out.push((size % 255) as u8);
            }
        }
        Lacing::Ebml => {
            if let Some((&first, rest)) = head.split_first() {
                out.extend(ebml::encode_size(first as u64, None));
                let mut prev = first as i64;
                for &size in rest {
                    out.extend(ebml::encode_signed(size as i64 - prev));
                    prev = size as i64;
                }
            }
        }
    }
    out
}
