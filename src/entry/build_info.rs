use chrono::TimeZone as _;

pub fn build_host() -> &'static str {
    option_env!("SCENTRY_BUILD_HOST").unwrap_or("unknown")
}

pub fn git_rev() -> &'static str {
    option_env!("SCENTRY_GIT_REV").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("SCENTRY_BUILD_TIME").unwrap_or("unknown")
}

/// `epoch:<secs>` or RFC 3339 as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(secs) = raw
        .strip_prefix("epoch:")
        .and_then(|e| e.trim().parse::<i64>().ok())
    {
        let dt = chrono::Utc
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
        return dt.format("%Y-%m-%d %H:%M:%S").to_string();
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt
            .with_timezone(&chrono::Utc)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
    }
    raw.replace('T', " ").trim_end_matches('Z').to_string()
}

pub fn banner() -> String {
    format!(
        "scentry {} rev={} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        git_rev(),
        build_host(),
        format_build_time_pretty(build_time_raw())
    )
}
