//! Shared helpers for the stagehand crate.

/// Case-insensitive check whether `haystack` contains any of `needles`.
pub fn contains_any<S: AsRef<str>>(haystack: &str, needles: &[S]) -> bool {
    let lowered = haystack.to_lowercase();
    needles
        .iter()
        .any(|n| !n.as_ref().is_empty() && lowered.contains(&n.as_ref().to_lowercase()))
}

/// Format a duration compactly, e.g. `1h 4m`, `3m 12s`, `45s`, `250ms`.
pub fn format_duration(duration: std::time::Duration) -> String {
    let total = duration.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if total == 0 {
        format!("{}ms", duration.as_millis())
    } else if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serialize an optional `Duration` as whole milliseconds.
pub mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Serialize a `Duration` as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_contains_any_is_case_insensitive() {
        assert!(contains_any("Precedent Analysis", &["precedent"]));
        assert!(contains_any("LAW SEARCH", &["search", "xyz"]));
        assert!(!contains_any("facts", &["parties"]));
    }

    #[test]
    fn test_contains_any_ignores_empty_needles() {
        assert!(!contains_any("anything", &[""]));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(192)), "3m 12s");
        assert_eq!(format_duration(Duration::from_secs(3840)), "1h 4m");
    }

    #[test]
    fn test_duration_millis_serde() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrapper {
            #[serde(with = "duration_millis")]
            d: Duration,
        }
        let json = serde_json::to_string(&Wrapper {
            d: Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(json, r#"{"d":1500}"#);
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.d, Duration::from_millis(1500));
    }
}
