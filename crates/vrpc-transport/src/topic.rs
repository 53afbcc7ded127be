//! MQTT-style topic filter matching

use crate::error::{Result, TransportError};

/// Check whether `topic` matches the subscription `filter`.
///
/// `+` matches exactly one level, `#` matches the remaining levels (including
/// none) and is only valid as the last level.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subscription filter
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(TransportError::InvalidTopic(filter.to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (idx, level) in levels.iter().enumerate() {
        let is_last = idx == levels.len() - 1;
        if level.contains('#') && (*level != "#" || !is_last) {
            return Err(TransportError::InvalidTopic(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(TransportError::InvalidTopic(filter.to_string()));
        }
    }

    Ok(())
}
