//! UTF-8 / UTF-16 string transcoding.
//!
//! Host strings are sequences of UTF-16 code units; the guest stores UTF-8.
//! When the host provides native transcoders (see [`HostFeatures`]) the
//! codec uses them. Otherwise it falls back to the manual transcoders below,
//! which produce the same bytes for every well-formed string.

use alloc::string::String;
use alloc::vec::Vec;

use crate::bridge::Bridge;
use crate::error::BridgeResult;
use crate::slot;
use crate::HostFeatures;

/// Combine a UTF-16 unit in 0xD800..=0xDFFF with the unit after it.
///
/// Any unit in the surrogate range is treated as a lead; a missing trail
/// counts as zero.
fn code_point(units: &[u16], i: &mut usize) -> u32 {
    let u = units[*i] as u32;
    if (0xD800..=0xDFFF).contains(&u) {
        *i += 1;
        let trail = units.get(*i).copied().unwrap_or(0) as u32;
        0x10000 + ((u & 0x3FF) << 10) | (trail & 0x3FF)
    } else {
        u
    }
}

fn encoded_len(cp: u32) -> usize {
    match cp {
        0..=0x7F => 1,
        0x80..=0x7FF => 2,
        0x800..=0xFFFF => 3,
        0x1_0000..=0x1F_FFFF => 4,
        0x20_0000..=0x3FF_FFFF => 5,
        _ => 6,
    }
}

/// Number of UTF-8 bytes [`encode_utf16`] will produce.
pub fn utf8_len(units: &[u16]) -> usize {
    let mut len = 0;
    let mut i = 0;
    while i < units.len() {
        len += encoded_len(code_point(units, &mut i));
        i += 1;
    }
    len
}

/// Manual UTF-16 to UTF-8 encoder.
///
/// Surrogate pairs are joined into one code point before encoding. The 5
/// and 6 byte forms follow RFC 2279.
pub fn encode_utf16(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(utf8_len(units));
    let mut i = 0;
    while i < units.len() {
        let u = code_point(units, &mut i);
        i += 1;
        match encoded_len(u) {
            1 => out.push(u as u8),
            2 => {
                out.push(0xC0 | (u >> 6) as u8);
                out.push(0x80 | (u & 63) as u8);
            }
            3 => {
                out.push(0xE0 | (u >> 12) as u8);
                out.push(0x80 | ((u >> 6) & 63) as u8);
                out.push(0x80 | (u & 63) as u8);
            }
            4 => {
                out.push(0xF0 | (u >> 18) as u8);
                out.push(0x80 | ((u >> 12) & 63) as u8);
                out.push(0x80 | ((u >> 6) & 63) as u8);
                out.push(0x80 | (u & 63) as u8);
            }
            5 => {
                out.push(0xF8 | (u >> 24) as u8);
                out.push(0x80 | ((u >> 18) & 63) as u8);
                out.push(0x80 | ((u >> 12) & 63) as u8);
                out.push(0x80 | ((u >> 6) & 63) as u8);
                out.push(0x80 | (u & 63) as u8);
            }
            _ => {
                out.push(0xFC | (u >> 30) as u8);
                out.push(0x80 | ((u >> 24) & 63) as u8);
                out.push(0x80 | ((u >> 18) & 63) as u8);
                out.push(0x80 | ((u >> 12) & 63) as u8);
                out.push(0x80 | ((u >> 6) & 63) as u8);
                out.push(0x80 | (u & 63) as u8);
            }
        }
    }
    out
}

/// Manual UTF-8 to UTF-16 decoder.
///
/// Code points at or above 0x10000 become surrogate pairs. A sequence cut
/// short by the end of input reads its missing bytes as zero.
pub fn decode_to_utf16(bytes: &[u8]) -> Vec<u16> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied();
    while let Some(x) = iter.next() {
        if x < 0x80 {
            out.push(x as u16);
            continue;
        }
        let init = (x & (0x7F >> 2)) as u32;
        let y = iter.next().unwrap_or(0) as u32;
        let mut ch = (init << 6) | (y & 63);
        if x >= 0xE0 {
            let z = iter.next().unwrap_or(0) as u32;
            let y_z = ((y & 63) << 6) | (z & 63);
            ch = (init << 12) | y_z;
            if x >= 0xF0 {
                let w = iter.next().unwrap_or(0) as u32;
                ch = ((init & 7) << 18) | ((y_z << 6) | (w & 63));
                out.push((0xD7C0 + (ch >> 10)) as u16);
                ch = 0xDC00 + (ch & 0x3FF);
            }
        }
        out.push(ch as u16);
    }
    out
}

/// Encode a host string as UTF-8.
pub fn encode(text: &str, features: HostFeatures) -> Vec<u8> {
    if features.contains(HostFeatures::NATIVE_UTF8_ENCODER) {
        text.as_bytes().to_vec()
    } else {
        let units: Vec<u16> = text.encode_utf16().collect();
        encode_utf16(&units)
    }
}

/// Decode guest UTF-8 into a host string.
pub fn decode(bytes: &[u8], features: HostFeatures) -> String {
    if features.contains(HostFeatures::NATIVE_UTF8_DECODER) {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        String::from_utf16_lossy(&decode_to_utf16(bytes))
    }
}

/// Stage `text` in guest memory and write its (ptr, len) pair at `address`.
///
/// The empty string allocates nothing and is written as (0, 0).
pub fn store(bridge: &Bridge, address: u32, text: &str) -> BridgeResult<()> {
    let bytes = encode(text, bridge.config().features);
    let len = bytes.len() as u32;
    let mut ptr = 0;
    if len > 0 {
        ptr = bridge.alloc(len)?;
        bridge.views().buffer().write(ptr, &bytes)?;
    }
    let views = bridge.views();
    let word = |index| {
        slot::word(address, index).ok_or_else(|| views.out_of_bounds(address, slot::SLOT_SIZE))
    };
    views.heapu32().store(word(0)?, ptr)?;
    views.heapu32().store(word(1)?, len)?;
    Ok(())
}

/// Read `len` UTF-8 bytes at `ptr` as a host string.
pub fn load(bridge: &Bridge, ptr: u32, len: u32) -> BridgeResult<String> {
    let bytes = bridge.views().buffer().read_vec(ptr, len)?;
    Ok(decode(&bytes, bridge.config().features))
}

// ── Tests ────────────────────────────────────────────────────────────
