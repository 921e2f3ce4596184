//! Sample conversion applied right before a device write.
//!
//! Only the conversions a device negotiation can lead to are supported: float to integer,
//! packed 24-bit to integer, 16-bit to float, and mono duplicated to stereo on top of any of
//! them. Stream data is always in native byte order by the time it reaches the output stage.

use crate::format::{AudioFormat, sample};

fn native(af: &AudioFormat) -> u16 {
    let mut f = *af;
    if !f.is_native_order() {
        f.swap();
    }
    f.format
}

/// True when `src` can be written to a device configured for `dst`.
pub fn supported(src: &AudioFormat, dst: &AudioFormat) -> bool {
    if src.rate != dst.rate {
        return false;
    }
    let channels_ok = src.channels == dst.channels || (src.channels == 1 && dst.channels == 2);
    if !channels_ok || !src.is_native_order() || !dst.is_native_order() {
        return false;
    }
    let (s, d) = (native(src), native(dst));
    s == d
        || matches!(
            (s, d),
            (sample::FLOAT, sample::S16)
                | (sample::FLOAT, sample::S32)
                | (sample::S24_3, sample::S16)
                | (sample::S24_3, sample::S32)
                | (sample::S16, sample::FLOAT)
        )
}

/// True when writing `src` to `dst` needs no conversion at all.
pub fn is_identity(src: &AudioFormat, dst: &AudioFormat) -> bool {
    src.format == dst.format && src.channels == dst.channels && src.rate == dst.rate
}

fn read_sample(format: u16, bytes: &[u8]) -> f32 {
    match format {
        sample::FLOAT => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        sample::S16 => i16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
        sample::S32 => i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0,
        sample::S24_3 => {
            let raw = if cfg!(target_endian = "little") {
                i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]])
            } else {
                i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0])
            };
            raw as f32 / 2_147_483_648.0
        }
        _ => 0.0,
    }
}

fn write_sample(format: u16, value: f32, out: &mut Vec<u8>) {
    let v = value.clamp(-1.0, 1.0);
    match format {
        sample::FLOAT => out.extend_from_slice(&v.to_ne_bytes()),
        sample::S16 => out.extend_from_slice(&((v * 32767.0).round() as i16).to_ne_bytes()),
        sample::S32 => out.extend_from_slice(&((v as f64 * 2_147_483_647.0).round() as i32).to_ne_bytes()),
        _ => {}
    }
}

/// Integer to integer paths keep full precision instead of going through `f32`.
fn s24_3_to_int(bytes: &[u8], dst: u16, out: &mut Vec<u8>) {
    let raw = if cfg!(target_endian = "little") {
        i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]])
    } else {
        i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0])
    };
    match dst {
        sample::S32 => out.extend_from_slice(&raw.to_ne_bytes()),
        _ => out.extend_from_slice(&((raw >> 16) as i16).to_ne_bytes()),
    }
}

/// Convert `input` (whole frames of `src`) into `out` in the `dst` layout.
///
/// The caller checks [`supported`] first; unsupported pairs produce no output.
pub fn convert(src: &AudioFormat, dst: &AudioFormat, input: &[u8], out: &mut Vec<u8>) {
    out.clear();
    let (sf, df) = (native(src), native(dst));
    let width = src.packing();
    let frame = src.frame_size();
    if frame == 0 {
        return;
    }
    let duplicate = src.channels == 1 && dst.channels == 2;
    out.reserve(input.len() / frame * dst.frame_size());

    for chunk in input.chunks_exact(frame) {
        for s in chunk.chunks_exact(width) {
            let copies = if duplicate { 2 } else { 1 };
            for _ in 0..copies {
                if sf == df {
                    out.extend_from_slice(s);
                } else if sf == sample::S24_3 {
                    s24_3_to_int(s, df, out);
                } else {
                    write_sample(df, read_sample(sf, s), out);
                }
            }
        }
    }
}

/// Scale samples in place. Only float and 16-bit data carry gain; other formats pass through.
pub fn apply_gain(af: &AudioFormat, data: &mut [u8], scale: f32) {
    if (scale - 1.0).abs() < f32::EPSILON {
        return;
    }
    match native(af) {
        sample::FLOAT => {
            for s in data.chunks_exact_mut(4) {
                let v = f32::from_ne_bytes([s[0], s[1], s[2], s[3]]) * scale;
                s.copy_from_slice(&v.to_ne_bytes());
            }
        }
        sample::S16 => {
            for s in data.chunks_exact_mut(2) {
                let v = i16::from_ne_bytes([s[0], s[1]]) as f32 * scale;
                s.copy_from_slice(&(v.clamp(-32768.0, 32767.0) as i16).to_ne_bytes());
            }
        }
        _ => {}
    }
}

/// Read interleaved samples of a float or 16-bit stream as `f32`.
pub fn to_f32(af: &AudioFormat, data: &[u8]) -> Vec<f32> {
    let width = af.packing().max(1);
    let format = native(af);
    data.chunks_exact(width).map(|s| read_sample(format, s)).collect()
}

/// Encode `samples` in the layout of a float or 16-bit stream.
pub fn from_f32(af: &AudioFormat, samples: &[f32], out: &mut Vec<u8>) {
    let format = native(af);
    for &s in samples {
        write_sample(format, s, out);
    }
}
