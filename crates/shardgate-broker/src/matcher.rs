//! AMQP topic matching.
//!
//! Patterns and keys are dot-separated words. `*` matches exactly one word,
//! `#` matches zero or more words.

/// Whether `routing_key` matches binding `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            if rest.is_empty() {
                return true;
            }
            (0..=key.len()).any(|skip| match_words(rest, &key[skip..]))
        }
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => match_words(rest, key_rest),
            _ => false,
        },
    }
}
