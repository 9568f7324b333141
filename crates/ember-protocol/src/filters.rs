//! MQTT topic filter matching.
//!
//! Implements the MQTT 3.1.1 wildcard rules: `+` matches exactly one
//! topic level, `#` matches the remainder of the topic (including the
//! parent level itself). Topics beginning with `$` are never matched by
//! a filter whose first level is a wildcard, so a plain `#` subscription
//! cannot swallow broker-reserved topics.

/// Returns true when `topic` matches the subscription `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // `#` consumes everything that remains, including nothing.
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(want), Some(got)) if want == got => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b/x"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("+/b/c", "a/b/c"));
        assert!(!topic_matches("a/+", "a/b/c"));
        // `+` must match exactly one level, not zero.
        assert!(!topic_matches("a/+/c", "a/c"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/b/#", "a/b"));
        assert!(topic_matches("#", "a/b/c"));
        assert!(!topic_matches("a/#", "b/c"));
    }

    #[test]
    fn combined_wildcards() {
        assert!(topic_matches(
            "$aws/things/+/jobs/#",
            "$aws/things/ab:cd:ef/jobs/$next/get/accepted"
        ));
        assert!(topic_matches(
            "$aws/things/+/streams/#",
            "$aws/things/ab:cd:ef/streams/fw-001/data/cbor"
        ));
        assert!(!topic_matches(
            "$aws/things/+/jobs/#",
            "$aws/things/ab:cd:ef/streams/fw-001/data/cbor"
        ));
    }

    #[test]
    fn dollar_topics_hidden_from_leading_wildcards() {
        assert!(!topic_matches("#", "$aws/things/x/shadow/update/delta"));
        assert!(!topic_matches("+/things/x", "$aws/things/x"));
        // Explicit `$aws` prefix still matches.
        assert!(topic_matches(
            "$aws/things/x/shadow/update/#",
            "$aws/things/x/shadow/update/delta"
        ));
    }

    #[test]
    fn shadow_response_filters() {
        let filter = "$aws/things/ab:cd/shadow/name/config/get/#";
        assert!(topic_matches(
            filter,
            "$aws/things/ab:cd/shadow/name/config/get/accepted"
        ));
        assert!(topic_matches(
            filter,
            "$aws/things/ab:cd/shadow/name/config/get/rejected"
        ));
        assert!(!topic_matches(
            filter,
            "$aws/things/ab:cd/shadow/name/config/update/accepted"
        ));
    }
}
