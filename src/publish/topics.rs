//! MQTT topic construction and matching.

/// Replacement for a missing or empty serial
pub const UNKNOWN_SERIAL: &str = "unknown";

/// Raw archival topic: `<root>/<serial>/osd`
pub fn raw_topic(root: &str, serial: &str) -> String {
    format!("{}/{}/osd", root, sanitize_level(serial))
}

/// Canonical record topic: `<root>/normalized`
pub fn normalized_topic(root: &str) -> String {
    format!("{}/normalized", root)
}

/// Make a device-supplied string safe to use as one topic level
///
/// Level separators, wildcards and NUL are replaced with `_` so a hostile
/// serial cannot publish outside its own subtree.
pub fn sanitize_level(serial: &str) -> String {
    let trimmed = serial.trim();
    if trimmed.is_empty() {
        return UNKNOWN_SERIAL.to_string();
    }

    trimmed
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' | '\0' => '_',
            other => other,
        })
        .collect()
}

/// Whether `topic` is a valid publish topic (no wildcards, no NUL)
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}

/// Whether `filter` is a valid subscription filter
///
/// `+` must fill a whole level and `#` must be the whole last level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}

/// Whether a subscription `filter` matches a concrete `topic`
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');

    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            literal => match topic_levels.next() {
                Some(t) if t == literal => {}
                _ => return false,
            },
        }
    }

    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_topic() {
        assert_eq!(
            raw_topic("thing/product", "1581F5BKD225D00A0A2N"),
            "thing/product/1581F5BKD225D00A0A2N/osd"
        );
    }

    #[test]
    fn test_raw_topic_sanitizes_serial() {
        assert_eq!(raw_topic("autel", "a/b"), "autel/a_b/osd");
        assert_eq!(raw_topic("autel", "#"), "autel/_/osd");
        assert_eq!(raw_topic("autel", "x+y"), "autel/x_y/osd");
        assert_eq!(raw_topic("autel", ""), "autel/unknown/osd");
        assert_eq!(raw_topic("autel", "   "), "autel/unknown/osd");
    }

    #[test]
    fn test_normalized_topic() {
        assert_eq!(normalized_topic("telemetry"), "telemetry/normalized");
    }

    #[test]
    fn test_valid_topic() {
        assert!(is_valid_topic("thing/product"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("thing/+"));
        assert!(!is_valid_topic("thing/#"));
    }

    #[test]
    fn test_valid_filter() {
        assert!(is_valid_filter("#"));
        assert!(is_valid_filter("+"));
        assert!(is_valid_filter("thing/product/+/osd"));
        assert!(is_valid_filter("thing/#"));
        assert!(!is_valid_filter(""));
        assert!(!is_valid_filter("thing/#/osd"));
        assert!(!is_valid_filter("thing/pro+duct"));
        assert!(!is_valid_filter("thing/product#"));
    }

    #[test]
    fn test_filter_matches() {
        assert!(filter_matches("thing/product/+/osd", "thing/product/SN1/osd"));
        assert!(!filter_matches("thing/product/+/osd", "thing/product/SN1/events"));
        assert!(!filter_matches("thing/product/+/osd", "thing/product/osd"));
        assert!(!filter_matches("thing/product/+/osd", "thing/product/SN1/osd/extra"));
        assert!(filter_matches("#", "telemetry/normalized"));
        assert!(filter_matches("thing/#", "thing/product/SN1/osd"));
        assert!(filter_matches("thing/#", "thing"));
        assert!(filter_matches("telemetry/normalized", "telemetry/normalized"));
        assert!(!filter_matches("telemetry", "telemetry/normalized"));
    }
}
