use chrono::Duration;

pub fn format_rate_limit_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Describe a trailing window the way detail messages read ("the last hour").
pub fn describe_window(window: Duration) -> String {
    let seconds = window.num_seconds();
    match seconds {
        3600 => "the last hour".to_string(),
        86400 => "the last day".to_string(),
        s if s > 0 && s % 3600 == 0 => format!("the last {} hours", s / 3600),
        s if s > 0 && s % 60 == 0 => format!("the last {} minutes", s / 60),
        s => format!("the last {} seconds", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_window() {
        assert_eq!(describe_window(Duration::hours(1)), "the last hour");
        assert_eq!(describe_window(Duration::hours(6)), "the last 6 hours");
        assert_eq!(describe_window(Duration::minutes(30)), "the last 30 minutes");
        assert_eq!(describe_window(Duration::seconds(45)), "the last 45 seconds");
    }
}
