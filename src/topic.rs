// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Topic pattern matching.
//!
//! Patterns and topics are `.`-separated segments. `*` matches exactly one
//! segment and `#` matches zero or more. The same rules drive handler lookup
//! in the dispatcher and topic-exchange routing in the in-memory transport.

/// Returns true when `topic` is matched by `pattern`.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = topic.split('.').collect();
    matches_segments(&pattern, &topic)
}

fn matches_segments(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"#", rest)) => {
            if rest.is_empty() {
                return true;
            }
            (0..=topic.len()).any(|skip| matches_segments(rest, &topic[skip..]))
        }
        Some((&"*", rest)) => !topic.is_empty() && matches_segments(rest, &topic[1..]),
        Some((segment, rest)) => match topic.split_first() {
            Some((head, tail)) => head == segment && matches_segments(rest, tail),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_any_number_of_segments() {
        assert!(matches("#", "a"));
        assert!(matches("#", "a.b.c"));
        assert!(matches("this.is.#", "this.is.a.test"));
        assert!(matches("this.is.#", "this.is.sparta"));
        assert!(matches("this.is.#", "this.is"));
        assert!(!matches("this.is.#", "that.is.sparta"));
        assert!(matches("a.#.z", "a.z"));
        assert!(matches("a.#.z", "a.b.c.z"));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        assert!(matches("*.topic", "my-queue.topic"));
        assert!(!matches("*.topic", "topic"));
        assert!(!matches("*.topic", "a.b.topic"));
        assert!(matches("q.*", "q.left"));
    }

    #[test]
    fn literal_segments_must_be_equal() {
        assert!(matches("left", "left"));
        assert!(!matches("left", "right"));
        assert!(!matches("a.b", "a.b.c"));
    }
}
