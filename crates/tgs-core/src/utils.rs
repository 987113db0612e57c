use chrono::{DateTime, NaiveTime, Utc};
use sha2::{Digest, Sha256};

// ============== Timestamp Helpers ==============

/// Midnight (UTC) of the day containing `now`.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Compact local-free timestamp for generated file names.
pub fn file_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

// ============== Hashing ==============

/// Hex SHA-256 over the given parts, joined with a unit separator so
/// `("1", "23")` and `("12", "3")` never collide.
pub fn digest_parts(parts: &[&str]) -> String {
    let mut h = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            h.update([0x1f]);
        }
        h.update(part.as_bytes());
    }
    let digest = h.finalize();
    hex_prefix(&digest, 64)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(len);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
        if out.len() >= len {
            out.truncate(len);
            break;
        }
    }
    out
}

// ============== Text Helpers ==============

/// Trim and collapse empty strings to `None`.
pub fn non_empty_trimmed(s: Option<&str>) -> Option<String> {
    let t = s?.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn digest_separates_parts() {
        assert_ne!(digest_parts(&["1", "23"]), digest_parts(&["12", "3"]));
        assert_eq!(digest_parts(&["a", "b"]).len(), 64);
    }

    #[test]
    fn start_of_day_truncates_time() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 17, 45, 12).unwrap();
        let sod = start_of_day(now);
        assert_eq!(sod, Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 0).unwrap());
    }

    #[test]
    fn non_empty_trimmed_collapses_whitespace() {
        assert_eq!(non_empty_trimmed(Some("  hi ")), Some("hi".to_string()));
        assert_eq!(non_empty_trimmed(Some("   ")), None);
        assert_eq!(non_empty_trimmed(None), None);
    }
}
