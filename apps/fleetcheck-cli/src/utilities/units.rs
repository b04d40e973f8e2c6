//! Unit normalization for tool output. Downstream threshold checks work on
//! plain numbers, so size strings become bytes and durations become
//! milliseconds here.

/// Converts a size string like "108.45 KB" or "1.5 GB" to bytes.
/// Unknown formats and "0 bytes" map to 0.
pub fn parse_size_to_bytes(size: &str) -> u64 {
    let size = size.replace(',', "");
    let size = size.trim();
    if size.is_empty() || size == "0" {
        return 0;
    }

    let mut parts = size.split_whitespace();
    let (Some(number), Some(unit)) = (parts.next(), parts.next()) else {
        return 0;
    };
    let Ok(value) = number.parse::<f64>() else {
        return 0;
    };

    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "B" | "BYTES" => 1,
        "KB" | "KIB" => 1024,
        "MB" | "MIB" => 1024 * 1024,
        "GB" | "GIB" => 1024 * 1024 * 1024,
        "TB" | "TIB" => 1024u64.pow(4),
        _ => 1,
    };
    (value * multiplier as f64) as u64
}

/// Formats a byte count for report fragments, e.g. "1.50 GB".
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[(&str, u64)] = &[
        ("TB", 1024u64.pow(4)),
        ("GB", 1024u64.pow(3)),
        ("MB", 1024 * 1024),
        ("KB", 1024),
    ];
    for (unit, size) in UNITS {
        if bytes >= *size {
            return format!("{:.2} {}", bytes as f64 / *size as f64, unit);
        }
    }
    format!("{bytes} B")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_to_bytes() {
        assert_eq!(parse_size_to_bytes("108.45 KB"), 111052);
        assert_eq!(parse_size_to_bytes("512 MB"), 536870912);
        assert_eq!(parse_size_to_bytes("1.5 GiB"), 1610612736);
        assert_eq!(parse_size_to_bytes("0 bytes"), 0);
        assert_eq!(parse_size_to_bytes(""), 0);
        assert_eq!(parse_size_to_bytes("garbage"), 0);
    }

    #[test]
    fn test_format_bytes_round_trip_magnitude() {
        assert_eq!(format_bytes(536870912), "512.00 MB");
        assert_eq!(format_bytes(42), "42 B");
    }
}
