//! Topic-style routing key patterns.
//!
//! Keys and patterns are dot-separated words. In a pattern `*` matches
//! exactly one word and `#` matches zero or more words, so
//! `*.sd15_webui.worker` matches `api.sd15_webui.worker`.

/// Whether `routing_key` matches the binding `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((word, rest)) => match key.split_first() {
            Some((k, key_rest)) if *word == "*" || word == k => matches_words(rest, key_rest),
            _ => false,
        },
    }
}
