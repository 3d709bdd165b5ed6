/// URL helpers for feed sources
pub mod url {
    use url::Url;

    /// Host part of a feed URL, used to name feeds configured without one.
    pub fn extract_domain(url_str: &str) -> Option<String> {
        Url::parse(url_str).ok()?.domain().map(str::to_string)
    }

    /// Feeds are only fetched over http(s).
    pub fn is_valid_rss_url(url_str: &str) -> bool {
        Url::parse(url_str).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
    }
}

/// Duration helpers for the scheduler
pub mod time {
    use chrono::Duration;

    /// Coarse human form of a wait, e.g. `45s`, `9m`, `2h`.
    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.num_seconds();
        match secs {
            s if s < 60 => format!("{}s", s),
            s if s < 3600 => format!("{}m", s / 60),
            s if s < 86400 => format!("{}h", s / 3600),
            s => format!("{}d", s / 86400),
        }
    }

    /// Parse a compact duration such as `90s`, `10m` or `1h30m`.
    pub fn parse_compact_duration(s: &str) -> Option<std::time::Duration> {
        let mut total = 0u64;
        let mut digits = String::new();

        for c in s.trim().chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let value: u64 = digits.parse().ok()?;
            digits.clear();
            let unit = match c {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                'd' => 86400,
                _ => return None,
            };
            total = total.checked_add(value.checked_mul(unit)?)?;
        }

        if !digits.is_empty() || total == 0 {
            return None;
        }
        Some(std::time::Duration::from_secs(total))
    }
}
