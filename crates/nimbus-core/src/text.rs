//! UTF-8-safe string truncation for log previews.

/// Truncate a string to at most `max_bytes` bytes at a char boundary.
#[inline]
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate `s` and append `suffix` if the original exceeds `max_bytes`.
///
/// The returned string is at most `max_bytes` bytes long, suffix included.
pub fn truncate_with_suffix(s: &str, max_bytes: usize, suffix: &str) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let body_budget = max_bytes.saturating_sub(suffix.len());
    format!("{}{suffix}", truncate_str(s, body_budget))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_untouched() {
        assert_eq!(truncate_str("hello", 10), "hello");
    }

    #[test]
    fn snaps_back_to_char_boundary() {
        // '成' is 3 bytes
        assert_eq!(truncate_str("ab成本", 3), "ab");
        assert_eq!(truncate_str("ab成本", 5), "ab成");
    }

    #[test]
    fn suffix_counts_toward_budget() {
        assert_eq!(truncate_with_suffix("hello world", 8, "..."), "hello...");
        assert_eq!(truncate_with_suffix("hi", 8, "..."), "hi");
    }
}
