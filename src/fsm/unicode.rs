//! Unicode code-point ranges lowered to UTF-8 byte DFAs.
//!
//! A requested `[min_cp, max_cp]` range is split along UTF-8 byte-length
//! boundaries; each length class produces the canonical byte DFA whose lead
//! byte stays in the allowed prefix band and whose continuation bytes stay
//! in `0x80..=0xBF`, clamped at the split boundaries so no invalid sequence
//! is accepted.

use crate::fsm::{FsmWithStartEnd, StateId};

const MAX_1_BYTE_CP: u32 = 0x7F;
const MAX_2_BYTE_CP: u32 = 0x7FF;
const MAX_3_BYTE_CP: u32 = 0xFFFF;
const MAX_CP: u32 = 0x10_FFFF;

/// Pack the UTF-8 encoding of `cp` into a big-endian `u32`
/// (e.g. U+0080 → `0xC280`).
#[must_use]
pub fn packed_utf8(cp: u32) -> u32 {
    if cp <= MAX_1_BYTE_CP {
        cp
    } else if cp <= MAX_2_BYTE_CP {
        ((0xC0 | (cp >> 6)) << 8) | (0x80 | (cp & 0x3F))
    } else if cp <= MAX_3_BYTE_CP {
        ((0xE0 | (cp >> 12)) << 16) | ((0x80 | ((cp >> 6) & 0x3F)) << 8) | (0x80 | (cp & 0x3F))
    } else {
        ((0xF0 | (cp >> 18)) << 24)
            | ((0x80 | ((cp >> 12) & 0x3F)) << 16)
            | ((0x80 | ((cp >> 6) & 0x3F)) << 8)
            | (0x80 | (cp & 0x3F))
    }
}

/// Add transitions from `from` to `to` accepting exactly the UTF-8
/// encodings of code points in `[min_cp, max_cp]`.
pub fn add_character_range(
    fsm: &mut FsmWithStartEnd,
    from: StateId,
    to: StateId,
    min_cp: u32,
    max_cp: u32,
) {
    let min_cp = min_cp.min(MAX_CP);
    let max_cp = max_cp.min(MAX_CP);
    if min_cp > max_cp {
        return;
    }
    // Split along the byte-length bands, then work on packed encodings.
    let bands = [
        (0u32, MAX_1_BYTE_CP),
        (MAX_1_BYTE_CP + 1, MAX_2_BYTE_CP),
        (MAX_2_BYTE_CP + 1, MAX_3_BYTE_CP),
        (MAX_3_BYTE_CP + 1, MAX_CP),
    ];
    for (band_lo, band_hi) in bands {
        let lo = min_cp.max(band_lo);
        let hi = max_cp.min(band_hi);
        if lo > hi {
            continue;
        }
        add_same_length_range(fsm, from, to, packed_utf8(lo), packed_utf8(hi));
    }
}

fn byte_at(packed: u32, idx: u32) -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    {
        (packed >> (8 * idx)) as u8
    }
}

/// Add a range of packed encodings that all share one byte length.
fn add_same_length_range(fsm: &mut FsmWithStartEnd, from: StateId, to: StateId, min: u32, max: u32) {
    // ASCII: a single byte-range edge.
    if byte_at(max, 1) == 0 {
        fsm.fsm_mut().add_edge(from, to, byte_at(min, 0), byte_at(max, 0));
        return;
    }

    // Find the index of the lead byte (the highest non-zero byte of max).
    let lead = if byte_at(max, 3) != 0 {
        3
    } else if byte_at(max, 2) != 0 {
        2
    } else {
        1
    };
    let suffix_mask: u32 = (1u32 << (8 * lead)) - 1;
    // Full continuation bands for the suffix, e.g. 0x8080 and 0xBFBF.
    let mut band_min: u32 = 0;
    let mut band_max: u32 = 0;
    for i in 0..lead {
        band_min |= 0x80 << (8 * i);
        band_max |= 0xBF << (8 * i);
    }

    let mut lead_min = byte_at(min, lead);
    let mut lead_max = byte_at(max, lead);

    if lead_min == lead_max {
        // One shared lead byte; recurse on the continuation suffix.
        let mid = fsm.add_state();
        fsm.fsm_mut().add_edge(from, mid, lead_min, lead_max);
        add_same_length_range(fsm, mid, to, min & suffix_mask, max & suffix_mask);
        return;
    }

    if (min & suffix_mask) == band_min {
        // The min suffix covers the full band: fold into the middle part.
        lead_min -= 1;
    } else {
        let mid = fsm.add_state();
        fsm.fsm_mut().add_edge(from, mid, byte_at(min, lead), byte_at(min, lead));
        add_same_length_range(fsm, mid, to, min & suffix_mask, band_max);
    }

    if (max & suffix_mask) == band_max {
        lead_max += 1;
    } else {
        let mid = fsm.add_state();
        fsm.fsm_mut().add_edge(from, mid, byte_at(max, lead), byte_at(max, lead));
        add_same_length_range(fsm, mid, to, band_min, max & suffix_mask);
    }

    if lead_max - lead_min > 1 {
        // Middle lead bytes take any continuation suffix.
        let mut current = fsm.add_state();
        fsm.fsm_mut().add_edge(from, current, lead_min + 1, lead_max - 1);
        for i in 0..lead {
            let next = if i + 1 == lead { to } else { fsm.add_state() };
            fsm.fsm_mut().add_edge(current, next, 0x80, 0xBF);
            current = next;
        }
    }
}

/// Build the FSM of a character class (optionally negated, optionally
/// starred). A negative class complements a 128-bit ASCII mask and admits
/// all code points at or above U+0080 wholesale; the caller has already
/// restricted them when needed.
#[must_use]
pub fn character_class_fsm(ranges: &[(u32, u32)], negated: bool, star: bool) -> FsmWithStartEnd {
    let mut fsm = FsmWithStartEnd::new();
    let start = fsm.add_state();
    fsm.set_start(start);
    let end = if star { start } else { fsm.add_state() };
    fsm.add_end_state(end);

    if negated {
        let mut ascii = [false; 128];
        for &(lo, hi) in ranges {
            let hi = hi.min(127);
            for cp in lo..=hi {
                if cp < 128 {
                    ascii[cp as usize] = true;
                }
            }
        }
        let mut cp = 0usize;
        while cp < 128 {
            if ascii[cp] {
                cp += 1;
                continue;
            }
            let mut hi = cp;
            while hi + 1 < 128 && !ascii[hi + 1] {
                hi += 1;
            }
            #[allow(clippy::cast_possible_truncation)]
            fsm.fsm_mut().add_edge(start, end, cp as u8, hi as u8);
            cp = hi + 1;
        }
        add_character_range(&mut fsm, start, end, 0x80, 0x10_FFFF);
    } else {
        for &(lo, hi) in ranges {
            add_character_range(&mut fsm, start, end, lo, hi);
        }
    }
    fsm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_fsm(min_cp: u32, max_cp: u32) -> FsmWithStartEnd {
        let mut fsm = FsmWithStartEnd::new();
        let start = fsm.add_state();
        let end = fsm.add_state();
        fsm.set_start(start);
        fsm.add_end_state(end);
        add_character_range(&mut fsm, start, end, min_cp, max_cp);
        fsm
    }

    fn check_roundtrip(min_cp: u32, max_cp: u32, probes: &[u32]) {
        let fsm = range_fsm(min_cp, max_cp);
        for &cp in probes {
            let Some(c) = char::from_u32(cp) else { continue };
            let mut buf = [0u8; 4];
            let encoded = c.encode_utf8(&mut buf).as_bytes();
            let expected = cp >= min_cp && cp <= max_cp;
            assert_eq!(
                fsm.accepts(encoded),
                expected,
                "cp U+{cp:04X} in [U+{min_cp:04X}, U+{max_cp:04X}]"
            );
        }
    }

    #[test]
    fn test_ascii_range() {
        check_roundtrip(b'a'.into(), b'z'.into(), &[0x60, 0x61, 0x6D, 0x7A, 0x7B, 0x41]);
    }

    #[test]
    fn test_cross_length_range() {
        // Spans the 1-byte/2-byte and 2-byte/3-byte boundaries
        check_roundtrip(
            0x40,
            0x1000,
            &[0x3F, 0x40, 0x7F, 0x80, 0x7FF, 0x800, 0xFFF, 0x1000, 0x1001],
        );
    }

    #[test]
    fn test_astral_range() {
        check_roundtrip(
            0x1F600,
            0x1F64F,
            &[0x1F5FF, 0x1F600, 0x1F620, 0x1F64F, 0x1F650, 0x10000],
        );
    }

    #[test]
    fn test_full_unicode() {
        check_roundtrip(0, 0x10_FFFF, &[0, 0x41, 0x7F, 0x80, 0xFFFF, 0x10000, 0x10_FFFF]);
    }

    #[test]
    fn test_invalid_bytes_rejected() {
        let fsm = range_fsm(0, 0x10_FFFF);
        // Lone continuation byte, overlong lead, truncated sequence
        assert!(!fsm.accepts(&[0x80]));
        assert!(!fsm.accepts(&[0xC2]));
        assert!(!fsm.accepts(&[0xE0, 0x80]));
    }

    #[test]
    fn test_packed_encoding() {
        assert_eq!(packed_utf8(0x7F), 0x7F);
        assert_eq!(packed_utf8(0x80), 0xC280);
        assert_eq!(packed_utf8(0x800), 0xE0A080);
        assert_eq!(packed_utf8(0x10000), 0xF090_8080);
        assert_eq!(packed_utf8(0x10_FFFF), 0xF48F_BFBF);
    }
}
