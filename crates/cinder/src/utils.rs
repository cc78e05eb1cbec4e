//! Utility functions

/// Format a byte count with binary units, trimming trailing zeros.
pub fn to_human_readable(mut n: f64) -> String {
    let units = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    let mut u = 0;

    while n >= 1024.0 && u < units.len() - 1 {
        n /= 1024.0;
        u += 1;
    }

    let formatted = format!("{n:.2}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", units[u])
}

/// Same as [`to_human_readable`], per second.
pub fn to_human_rate(n: f64) -> String {
    format!("{}/s", to_human_readable(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_size() {
        assert_eq!(to_human_readable(0.0), "0 B");
        assert_eq!(to_human_readable(740.0), "740 B");
        assert_eq!(to_human_readable(1024.0), "1 KiB");
        assert_eq!(to_human_readable(1536.0), "1.5 KiB");
        assert_eq!(to_human_readable(256.0 * 1024.0 * 1024.0), "256 MiB");
        assert_eq!(to_human_rate(2048.0), "2 KiB/s");
    }
}
