//! Topic matching.
//!
//! Topics are dotted strings (`downloadManager.downloadUpdateGame`,
//! `client.42.progress`). Subscription patterns use the same grammar plus
//! `#`, which matches any remainder (zero or more segments). `#` is only
//! meaningful as the final segment.

/// Whether `topic` matches the subscription `pattern`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segs = pattern.split('.');
    let mut topic_segs = topic.split('.');

    loop {
        match (pattern_segs.next(), topic_segs.next()) {
            (Some("#"), _) => return true,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("a.b.c", "a.b.c"));
        assert!(!topic_matches("a.b.c", "a.b"));
        assert!(!topic_matches("a.b", "a.b.c"));
        assert!(!topic_matches("a.b.c", "a.b.x"));
    }

    #[test]
    fn test_hash_matches_remainder() {
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("client.42.#", "client.42.progress"));
        assert!(topic_matches("client.42.#", "client.42.finalStatus"));
        assert!(topic_matches("client.42.#", "client.42.a.b.c"));
        assert!(!topic_matches("client.42.#", "client.43.progress"));
    }

    #[test]
    fn test_hash_matches_zero_segments() {
        assert!(topic_matches("client.42.#", "client.42"));
    }

    #[test]
    fn test_broadcast_convention() {
        assert!(topic_matches("_broadcast.#", "_broadcast.ping"));
        assert!(!topic_matches("_broadcast.#", "downloadManager.ping"));
    }

    #[test]
    fn test_single_segment() {
        assert!(topic_matches("ping", "ping"));
        assert!(!topic_matches("ping", "pong"));
    }
}
