use chrono::{DateTime, Utc};

const UNITS: [(u64, &str); 4] = [
    (1 << 40, "TiB"),
    (1 << 30, "GiB"),
    (1 << 20, "MiB"),
    (1 << 10, "KiB"),
];

pub fn human_bytes(bytes: u64) -> String {
    for (size, unit) in UNITS {
        if bytes >= size {
            return format!("{:.1} {}", bytes as f64 / size as f64, unit);
        }
    }
    format!("{} B", bytes)
}

/// Elapsed time since `since`, e.g. "5 minutes".
pub fn human_duration_since(since: DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(since);
    let plural = |n: i64, unit: &str| format!("{} {}{}", n, unit, if n == 1 { "" } else { "s" });

    if elapsed.num_days() > 0 {
        plural(elapsed.num_days(), "day")
    } else if elapsed.num_hours() > 0 {
        plural(elapsed.num_hours(), "hour")
    } else if elapsed.num_minutes() > 0 {
        plural(elapsed.num_minutes(), "minute")
    } else {
        plural(elapsed.num_seconds().max(0), "second")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(5 * (1 << 30)), "5.0 GiB");
    }

    #[test]
    fn test_human_duration_since() {
        assert_eq!(human_duration_since(Utc::now() - Duration::minutes(1)), "1 minute");
        assert_eq!(human_duration_since(Utc::now() - Duration::hours(3)), "3 hours");
    }
}
