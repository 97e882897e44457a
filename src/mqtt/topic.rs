//! Topic names are what a PUBLISH is sent to; topic filters are what a
//! SUBSCRIBE asks for and may contain the `+` (one level) and `#` (all
//! remaining levels) wildcards.

use super::MAX_TOPIC_LEN;

/// Why a topic name or filter was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Zero-length topic
    Empty,
    /// Longer than [`MAX_TOPIC_LEN`]
    TooLong,
    /// A wildcard in a topic name, or a misplaced wildcard in a filter
    InvalidWildcard,
    /// Contains U+0000
    NullCharacter,
}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NullCharacter);
    }
    Ok(())
}

/// Validate a topic name for PUBLISH.
pub fn validate_name(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::InvalidWildcard);
    }
    Ok(())
}

/// Validate a topic filter for SUBSCRIBE and UNSUBSCRIBE.
///
/// `#` must be the last level and occupy it alone; `+` must occupy a whole
/// level.
pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    check_common(filter)?;
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        match level {
            "#" if is_last => {}
            "+" => {}
            other if other.contains(['+', '#']) => return Err(TopicError::InvalidWildcard),
            _ => {}
        }
    }
    Ok(())
}

/// Whether `topic` is matched by `filter`.
///
/// Both are assumed valid. Filters starting with a wildcard never match
/// topics beginning with `$`.
///
/// ```rust
/// use libmqtt::mqtt::topic::matches;
///
/// assert!(matches("sensors/+/temp", "sensors/kitchen/temp"));
/// assert!(matches("sensors/#", "sensors"));
/// assert!(!matches("#", "$SYS/uptime"));
/// ```
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
