// tardis is the shared library implementing the Tardis backup server core.
// Copyright (C) 2026  Tardis Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Human-readable byte size and duration formatting/parsing.

use crate::error::TardisError;

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

const MINUTE: u64 = 1;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;

/// Parses a human size of the form `<digits>[.<digits>][KMG][B]?` into bytes.
/// A bare number with no suffix is taken as an exact byte count.
pub fn parse_size(s: &str) -> Result<u64, TardisError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(TardisError::Usage("empty size".to_string()));
    }

    let mut end = s.len();
    let bytes = s.as_bytes();

    if bytes[end - 1].to_ascii_uppercase() == b'B' {
        end -= 1;
    }
    if end == 0 {
        return Err(TardisError::Usage(format!("invalid size \"{s}\"")));
    }

    let (number_part, multiplier) = match bytes[end - 1].to_ascii_uppercase() {
        b'K' => (&s[..end - 1], KIB),
        b'M' => (&s[..end - 1], MIB),
        b'G' => (&s[..end - 1], GIB),
        b'0'..=b'9' => (&s[..end], 1),
        _ => return Err(TardisError::Usage(format!("unknown size suffix in \"{s}\""))),
    };

    let value: f64 = number_part
        .parse()
        .map_err(|_| TardisError::Usage(format!("invalid size \"{s}\"")))?;
    if value < 0.0 {
        return Err(TardisError::Usage(format!("negative size \"{s}\"")));
    }

    Ok((value * multiplier as f64).round() as u64)
}

/// Reports whether `s` would be accepted by [`parse_size`].
pub fn is_size(s: &str) -> bool {
    parse_size(s).is_ok()
}

/// Formats a byte count the way the spec requires:
/// - `n < 1024` → `"nB"`
/// - `n < 2^20` → `"⌊n/1024⌋K"` (fractional KB dropped)
/// - `n < 2^30` → `"n/2^20M"` with one decimal, `.0` stripped
/// - else → `"n/2^30G"` with one decimal, `.0` stripped
pub fn format_size(n: u64) -> String {
    if n < KIB {
        format!("{n}B")
    } else if n < MIB {
        format!("{}K", n / KIB)
    } else if n < GIB {
        format!("{}M", strip_trailing_zero(n as f64 / MIB as f64))
    } else {
        format!("{}G", strip_trailing_zero(n as f64 / GIB as f64))
    }
}

fn strip_trailing_zero(v: f64) -> String {
    let s = format!("{v:.1}");
    s.strip_suffix(".0").map(str::to_string).unwrap_or(s)
}

/// Breaks `m` minutes into weeks/days/hours/minutes, omitting zero
/// components, pluralising with `s`, joined by `", "`.
pub fn format_minutes(total: u64) -> String {
    if total == 0 {
        return "0 minutes".to_string();
    }

    let weeks = total / WEEK;
    let rem = total % WEEK;
    let days = rem / DAY;
    let rem = rem % DAY;
    let hours = rem / HOUR;
    let minutes = rem % HOUR;

    let mut parts = Vec::new();
    for (value, unit) in [
        (weeks, "week"),
        (days, "day"),
        (hours, "hour"),
        (minutes, "minute"),
    ] {
        if value > 0 {
            parts.push(pluralize(value, unit));
        }
    }

    parts.join(", ")
}

fn pluralize(value: u64, unit: &str) -> String {
    if value == 1 {
        format!("{value} {unit}")
    } else {
        format!("{value} {unit}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("512B").unwrap(), 512);
    }

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_size("1K").unwrap(), KIB);
        assert_eq!(parse_size("2.5M").unwrap(), (2.5 * MIB as f64) as u64);
        assert_eq!(parse_size("40G").unwrap(), 40 * GIB);
        assert_eq!(parse_size("40GB").unwrap(), 40 * GIB);
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(parse_size("10X").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn formats_under_1024_exactly() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(1023), "1023B");
    }

    #[test]
    fn formats_kilobytes_truncated() {
        assert_eq!(format_size(1024), "1K");
        assert_eq!(format_size(1024 * 3 / 2), "1K");
    }

    #[test]
    fn formats_megabytes_and_gigabytes() {
        assert_eq!(format_size(MIB), "1M");
        assert_eq!(format_size(MIB + MIB / 2), "1.5M");
        assert_eq!(format_size(42_949_672_960), "40G");
    }

    #[test]
    fn round_trips_within_rounding() {
        for n in [0u64, 1, 512, 1023, 1024, 5_000_000, 42_949_672_960] {
            let formatted = format_size(n);
            let parsed = parse_size(&formatted).unwrap();
            let scale = if n < KIB {
                1
            } else if n < MIB {
                KIB
            } else if n < GIB {
                MIB
            } else {
                GIB
            };
            assert!(
                parsed.abs_diff(n) <= scale,
                "n={n} formatted={formatted} parsed={parsed}"
            );
        }
    }

    #[test]
    fn formats_minutes_with_components_omitted() {
        assert_eq!(format_minutes(0), "0 minutes");
        assert_eq!(format_minutes(1), "1 minute");
        assert_eq!(format_minutes(90), "1 hour, 30 minutes");
        assert_eq!(
            format_minutes(WEEK + 2 * DAY + 3 * HOUR + 4),
            "1 week, 2 days, 3 hours, 4 minutes"
        );
    }

    #[test]
    fn is_size_matches_parse_size() {
        assert!(is_size("1.5G"));
        assert!(!is_size("nope"));
    }
}
