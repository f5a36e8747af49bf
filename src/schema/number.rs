//! Numeric range → regex decomposition
//!
//! Factors an integer interval into length-aligned sub-ranges and emits a
//! union of digit-class patterns that covers it exactly, with common-prefix
//! compression. Floats reuse the same digit-walk machinery: the integral
//! part goes through the integer decomposition and fractional parts are
//! compared as zero-padded fixed-width digit strings bounded by a
//! precision.

use std::fmt::Write as _;

/// Default fractional precision for float ranges.
pub const FLOAT_PRECISION: usize = 6;

/// A digit-range class followed by `free_digits` unconstrained digits.
fn digit_range_pattern(lo: u8, hi: u8, free_digits: usize) -> String {
    let mut out = String::new();
    if lo == hi {
        out.push(lo as char);
    } else {
        let _ = write!(out, "[{}-{}]", lo as char, hi as char);
    }
    match free_digits {
        0 => {}
        1 => out.push_str("\\d"),
        n => {
            let _ = write!(out, "\\d{{{n}}}");
        }
    }
    out
}

/// Patterns covering all positive integers in `[lower, upper]`
/// (`1 <= lower <= upper`).
fn positive_sub_range_patterns(lower: i64, upper: i64) -> Vec<String> {
    debug_assert!(1 <= lower && lower <= upper);
    let mut patterns = Vec::new();
    let lower_str = lower.to_string();
    let upper_str = upper.to_string();

    for len in lower_str.len()..=upper_str.len() {
        let digit_min: i64 = format!("1{}", "0".repeat(len - 1)).parse().unwrap_or(i64::MAX);
        let digit_max: i64 = "9".repeat(len).parse().unwrap_or(i64::MAX);
        let start = lower.max(digit_min);
        let end = upper.min(digit_max);
        if start > end {
            continue;
        }
        if start == digit_min && end == digit_max {
            if len == 1 {
                patterns.push("[1-9]".to_string());
            } else {
                patterns.push(format!("[1-9]\\d{{{}}}", len - 1));
            }
            continue;
        }
        patterns.extend(same_length_patterns(&start.to_string(), &end.to_string()));
    }
    patterns
}

/// Patterns covering `[start, end]` where both digit strings have the same
/// length. Works on arbitrary digit strings (leading zeros allowed).
fn same_length_patterns(start_str: &str, end_str: &str) -> Vec<String> {
    debug_assert_eq!(start_str.len(), end_str.len());
    let start = start_str.as_bytes();
    let end = end_str.as_bytes();
    let len = start.len();

    let mut lcp = 0;
    while lcp < len && start[lcp] == end[lcp] {
        lcp += 1;
    }
    if lcp == len {
        return vec![start_str.to_string()];
    }

    let prefix = &start_str[..lcp];
    let mut patterns = Vec::new();

    let lo_digit = start[lcp];
    let hi_digit = end[lcp];
    if hi_digit - lo_digit > 1 {
        patterns.push(format!(
            "{prefix}{}",
            digit_range_pattern(lo_digit + 1, hi_digit - 1, len - lcp - 1)
        ));
    }
    patterns.extend(lower_boundary_patterns(start_str, lcp));
    patterns.extend(upper_boundary_patterns(end_str, lcp));
    patterns
}

/// `start` itself plus everything of its length above it that shares the
/// digits up to and including position `from`.
fn lower_boundary_patterns(start_str: &str, from: usize) -> Vec<String> {
    let start = start_str.as_bytes();
    let len = start.len();
    let mut patterns = vec![start_str.to_string()];
    for i in (from + 1..len).rev() {
        if start[i] < b'9' {
            patterns.push(format!(
                "{}{}",
                &start_str[..i],
                digit_range_pattern(start[i] + 1, b'9', len - i - 1)
            ));
        }
    }
    patterns
}

/// `end` itself plus everything of its length below it that shares the
/// digits up to and including position `from`.
fn upper_boundary_patterns(end_str: &str, from: usize) -> Vec<String> {
    let end = end_str.as_bytes();
    let len = end.len();
    let mut patterns = vec![end_str.to_string()];
    for i in (from + 1..len).rev() {
        if end[i] > b'0' {
            patterns.push(format!(
                "{}{}",
                &end_str[..i],
                digit_range_pattern(b'0', end[i] - 1, len - i - 1)
            ));
        }
    }
    patterns
}

fn positive_range_regex(lower: i64, upper: i64) -> String {
    format!("({})", positive_sub_range_patterns(lower, upper).join("|"))
}

/// Regex matching exactly the integers in the given (half-)bounded range.
#[must_use]
pub fn integer_range_regex(start: Option<i64>, end: Option<i64>) -> String {
    let parts = integer_range_parts(start, end);
    if parts.is_empty() {
        return "^()$".to_string();
    }
    format!("^({})$", parts.join("|"))
}

/// The alternation parts of [`integer_range_regex`], unanchored.
fn integer_range_parts(start: Option<i64>, end: Option<i64>) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    match (start, end) {
        (None, None) => {
            parts.push("-[1-9]\\d*".to_string());
            parts.push("0".to_string());
            parts.push("[1-9]\\d*".to_string());
        }
        (Some(start), None) => {
            if start <= 0 {
                if start < 0 {
                    parts.push(format!("-{}", positive_range_regex(1, -start)));
                }
                parts.push("0".to_string());
                parts.push("[1-9]\\d*".to_string());
            } else {
                let len = start.to_string().len();
                let nines: i64 = "9".repeat(len).parse().unwrap_or(i64::MAX);
                parts.push(positive_range_regex(start, nines));
                parts.push(format!("[1-9]\\d{{{len},}}"));
            }
        }
        (None, Some(end)) => {
            if end >= 0 {
                parts.push("-[1-9]\\d*".to_string());
                parts.push("0".to_string());
                if end > 0 {
                    parts.push(positive_range_regex(1, end));
                }
            } else {
                let len = (-end).to_string().len();
                let nines: i64 = "9".repeat(len).parse().unwrap_or(i64::MAX);
                parts.push(format!("-{}", positive_range_regex(-end, nines)));
                parts.push(format!("-[1-9]\\d{{{len},}}"));
            }
        }
        (Some(start), Some(end)) => {
            if start > end {
                return Vec::new();
            }
            if start < 0 {
                let negative_end = end.min(-1);
                parts.push(format!("-{}", positive_range_regex(-negative_end, -start)));
            }
            if start <= 0 && end >= 0 {
                parts.push("0".to_string());
            }
            if end > 0 {
                parts.push(positive_range_regex(start.max(1), end));
            }
        }
    }
    parts
}

// ==================== Float ranges ====================

fn format_float(value: f64, precision: usize) -> String {
    #[allow(clippy::cast_possible_truncation)]
    if value == (value as i64) as f64 {
        return (value as i64).to_string();
    }
    let mut s = format!("{value:.precision$}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

/// Fractional digits of `|value|`, trailing zeros stripped; empty for
/// integral values.
fn fraction_digits(value: f64, precision: usize) -> String {
    let s = format_float(value.abs(), precision);
    match s.find('.') {
        Some(dot) => s[dot + 1..].to_string(),
        None => String::new(),
    }
}

fn pad_fraction(frac: &str, precision: usize) -> String {
    let mut s = frac.to_string();
    while s.len() < precision {
        s.push('0');
    }
    s
}

/// Rewrite a fixed-width pattern so trailing free digits may be truncated.
/// Safe because the decomposition guarantees every completion of the
/// classed prefix (zero-padded included) lies inside the range.
fn make_truncatable(pattern: &str) -> String {
    if let Some(stripped) = pattern.strip_suffix("\\d") {
        return format!("{stripped}\\d?");
    }
    if let Some(open) = pattern.rfind("\\d{") {
        if pattern.ends_with('}') {
            let count = &pattern[open + 3..pattern.len() - 1];
            if count.chars().all(|c| c.is_ascii_digit()) {
                return format!("{}\\d{{0,{count}}}", &pattern[..open]);
            }
        }
    }
    pattern.to_string()
}

/// Patterns (each starting with `\.`) matching fractional suffixes whose
/// value lies in `[fa, fb]`, with at most `precision` digits. `fa`/`fb`
/// are trailing-zero-stripped digit strings; an empty string is the zero
/// fraction. Bare (fraction-less) forms are the caller's business.
fn fraction_between(fa: &str, fb: &str, precision: usize) -> Vec<String> {
    let fa_pad = pad_fraction(fa, precision);
    let fb_pad = pad_fraction(fb, precision);
    debug_assert!(fa_pad <= fb_pad, "inverted fraction range");
    let mut patterns = Vec::new();
    let exact = |digits: &str, patterns: &mut Vec<String>| {
        if digits.is_empty() {
            // The zero fraction: ".0", ".00", ...
            patterns.push(format!("\\.0{{1,{precision}}}"));
        } else {
            let free_zeros = precision - digits.len();
            if free_zeros == 0 {
                patterns.push(format!("\\.{digits}"));
            } else {
                patterns.push(format!("\\.{digits}0{{0,{free_zeros}}}"));
            }
        }
    };
    if fa_pad == fb_pad {
        exact(fa, &mut patterns);
        return patterns;
    }
    for raw in same_length_patterns(&fa_pad, &fb_pad) {
        if raw == fa_pad {
            exact(fa, &mut patterns);
        } else if raw == fb_pad {
            exact(fb, &mut patterns);
        } else {
            patterns.push(format!("\\.{}", make_truncatable(&raw)));
        }
    }
    patterns
}

fn all_nines(precision: usize) -> String {
    "9".repeat(precision)
}

/// Patterns for unsigned decimal strings with value in `[lo, hi]`
/// (`0 <= lo`, `hi` unbounded when `None`), fractions up to `precision`
/// digits.
#[allow(clippy::cast_possible_truncation)]
fn unsigned_decimal_patterns(lo: f64, hi: Option<f64>, precision: usize) -> Vec<String> {
    debug_assert!(lo >= 0.0);
    let frac_opt = format!("(\\.\\d{{1,{precision}}})?");
    let lo_int = lo.trunc() as i64;
    let lo_frac = fraction_digits(lo, precision);
    let mut parts = Vec::new();

    let push_boundary_low = |parts: &mut Vec<String>| {
        // Integral part lo_int, fractions >= lo_frac
        for p in fraction_between(&lo_frac, &all_nines(precision), precision) {
            parts.push(format!("{lo_int}{p}"));
        }
    };

    match hi {
        None => {
            if lo_frac.is_empty() {
                parts.extend(
                    integer_range_parts(Some(lo_int), None)
                        .into_iter()
                        .map(|p| format!("{p}{frac_opt}")),
                );
            } else {
                push_boundary_low(&mut parts);
                parts.extend(
                    integer_range_parts(Some(lo_int + 1), None)
                        .into_iter()
                        .map(|p| format!("{p}{frac_opt}")),
                );
            }
        }
        Some(hi) => {
            debug_assert!(lo <= hi);
            let hi_int = hi.trunc() as i64;
            let hi_frac = fraction_digits(hi, precision);
            if lo_int == hi_int {
                if lo_frac.is_empty() {
                    parts.push(lo_int.to_string());
                }
                for p in fraction_between(&lo_frac, &hi_frac, precision) {
                    parts.push(format!("{lo_int}{p}"));
                }
            } else {
                // Low boundary
                let free_lo = if lo_frac.is_empty() {
                    lo_int
                } else {
                    push_boundary_low(&mut parts);
                    lo_int + 1
                };
                // Free middle integers with any fraction
                if free_lo <= hi_int - 1 {
                    parts.extend(
                        integer_range_parts(Some(free_lo), Some(hi_int - 1))
                            .into_iter()
                            .map(|p| format!("{p}{frac_opt}")),
                    );
                }
                // High boundary: bare hi_int plus fractions <= hi_frac
                parts.push(hi_int.to_string());
                for p in fraction_between("", &hi_frac, precision) {
                    parts.push(format!("{hi_int}{p}"));
                }
            }
        }
    }
    parts
}

/// Regex matching decimal numbers in the given range, with up to
/// `precision` fractional digits. Bounds are treated as inclusive.
#[must_use]
pub fn float_range_regex(start: Option<f64>, end: Option<f64>, precision: usize) -> String {
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return "^()$".to_string();
        }
    }
    let frac_opt = format!("(\\.\\d{{1,{precision}}})?");
    let mut parts: Vec<String> = Vec::new();

    let negative_side_empty = end.is_some_and(|e| e >= 0.0) && start.is_some_and(|s| s >= 0.0);
    let positive_side_empty = end.is_some_and(|e| e < 0.0);

    if positive_side_empty {
        // Entirely negative: magnitudes run from |end| up to |start|
        let mag_lo = -end.expect("end is negative");
        let mag_hi = start.map(|s| -s);
        for p in unsigned_decimal_patterns(mag_lo, mag_hi, precision) {
            parts.push(format!("-{p}"));
        }
    } else {
        // Negative side down to start (or unbounded)
        if !negative_side_empty {
            match start {
                Some(start) if start < 0.0 => {
                    for p in unsigned_decimal_patterns(0.0, Some(-start), precision) {
                        if p != "0" {
                            parts.push(format!("-{p}"));
                        }
                    }
                }
                Some(_) => {}
                None => {
                    parts.push(format!("-[1-9]\\d*{frac_opt}"));
                    parts.push(format!("-0\\.\\d{{1,{precision}}}"));
                }
            }
        }
        // Positive side from max(start, 0) up to end (or unbounded)
        let pos_lo = start.map_or(0.0, |s| s.max(0.0));
        for p in unsigned_decimal_patterns(pos_lo, end, precision) {
            parts.push(p);
        }
    }

    if parts.is_empty() {
        return "^()$".to_string();
    }
    format!("^({})$", parts.join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regex::RegexFsmBuilder;

    fn matches(pattern: &str, input: &str) -> bool {
        RegexFsmBuilder::build(pattern)
            .expect("pattern compiles")
            .accepts(input.as_bytes())
    }

    #[test]
    fn test_unbounded() {
        let p = integer_range_regex(None, None);
        assert!(matches(&p, "0"));
        assert!(matches(&p, "-17"));
        assert!(matches(&p, "123456"));
        assert!(!matches(&p, "1.5"));
        assert!(!matches(&p, "-0"));
        assert!(!matches(&p, "007"));
    }

    #[test]
    fn test_bounded_small_range() {
        let p = integer_range_regex(Some(-5), Some(12));
        for i in -20i64..=20 {
            assert_eq!(
                matches(&p, &i.to_string()),
                (-5..=12).contains(&i),
                "value {i} in [-5, 12], pattern {p}"
            );
        }
        assert!(!matches(&p, "3.0"));
        assert!(!matches(&p, "-0"));
    }

    #[test]
    fn test_bounded_multi_length() {
        let p = integer_range_regex(Some(7), Some(1234));
        for i in [6, 7, 9, 10, 55, 99, 100, 101, 999, 1000, 1199, 1234, 1235, 2000] {
            assert_eq!(
                matches(&p, &i.to_string()),
                (7..=1234).contains(&i),
                "value {i}, pattern {p}"
            );
        }
    }

    #[test]
    fn test_lower_bound_only() {
        let p = integer_range_regex(Some(42), None);
        for (value, expected) in [
            ("41", false),
            ("42", true),
            ("99", true),
            ("100", true),
            ("5000", true),
            ("7", false),
            ("-1", false),
        ] {
            assert_eq!(matches(&p, value), expected, "value {value}, pattern {p}");
        }
    }

    #[test]
    fn test_upper_bound_only_negative() {
        let p = integer_range_regex(None, Some(-3));
        for (value, expected) in [
            ("-3", true),
            ("-2", false),
            ("-10", true),
            ("-100", true),
            ("0", false),
            ("3", false),
        ] {
            assert_eq!(matches(&p, value), expected, "value {value}, pattern {p}");
        }
    }

    #[test]
    fn test_empty_range() {
        assert_eq!(integer_range_regex(Some(5), Some(3)), "^()$");
    }

    #[test]
    fn test_float_range_same_sign() {
        let p = float_range_regex(Some(1.5), Some(3.25), FLOAT_PRECISION);
        for (value, expected) in [
            ("1.5", true),
            ("1.50", true),
            ("1.4", false),
            ("1.75", true),
            ("1", false),
            ("2", true),
            ("2.999999", true),
            ("3", true),
            ("3.2", true),
            ("3.25", true),
            ("3.250", true),
            ("3.3", false),
            ("3.26", false),
            ("4", false),
        ] {
            assert_eq!(matches(&p, value), expected, "value {value}, pattern {p}");
        }
    }

    #[test]
    fn test_float_range_crossing_zero() {
        let p = float_range_regex(Some(-1.5), Some(0.5), FLOAT_PRECISION);
        for (value, expected) in [
            ("-1.5", true),
            ("-1.6", false),
            ("-2", false),
            ("-1", true),
            ("-0.7", true),
            ("0", true),
            ("0.5", true),
            ("0.51", false),
            ("1", false),
        ] {
            assert_eq!(matches(&p, value), expected, "value {value}, pattern {p}");
        }
    }

    #[test]
    fn test_float_range_negative() {
        let p = float_range_regex(Some(-3.5), Some(-2.25), FLOAT_PRECISION);
        for (value, expected) in [
            ("-3.5", true),
            ("-3.6", false),
            ("-3", true),
            ("-2.5", true),
            ("-2.25", true),
            ("-2.2", false),
            ("-2", false),
            ("2.5", false),
        ] {
            assert_eq!(matches(&p, value), expected, "value {value}, pattern {p}");
        }
    }

    #[test]
    fn test_float_unbounded() {
        let p = float_range_regex(None, None, FLOAT_PRECISION);
        assert!(matches(&p, "-12.75"));
        assert!(matches(&p, "3"));
        assert!(matches(&p, "0"));
        assert!(!matches(&p, "1.1234567"));
    }

    #[test]
    fn test_float_lower_bound_only() {
        let p = float_range_regex(Some(2.5), None, FLOAT_PRECISION);
        for (value, expected) in [
            ("2.5", true),
            ("2.49", false),
            ("2", false),
            ("3", true),
            ("100.125", true),
            ("-5", false),
        ] {
            assert_eq!(matches(&p, value), expected, "value {value}, pattern {p}");
        }
    }
}
