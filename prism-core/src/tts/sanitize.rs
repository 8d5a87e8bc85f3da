//! Text cleanup before synthesis.
//!
//! Order matters: URLs first (their `/` and `.` would otherwise be spoken),
//! then symbol words, then everything else unspeakable becomes a space.
//! Each stage produces only characters the later stages leave alone, so the
//! transform is idempotent.

use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:https?://|www\.)\S+").expect("valid url regex")
});

static UNSPEAKABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s.,?!\-]").expect("valid strip regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

const URL_REPLACEMENT: &str = " URL omitted ";

const SYMBOL_WORDS: &[(char, &str)] = &[
    ('+', " plus "),
    ('=', " equals "),
    ('*', " times "),
    ('/', " divided by "),
    ('<', " less than "),
    ('>', " greater than "),
    ('@', " at "),
    ('#', " hashtag "),
    ('$', " dollar "),
    ('%', " percent "),
    ('&', " and "),
    ('|', " or "),
    ('_', " underscore "),
];

/// Make `text` suitable for a voice: no URLs, symbols spelled out,
/// whitespace collapsed.
pub fn sanitize_for_speech(text: &str) -> String {
    let without_urls = URL_RE.replace_all(text, URL_REPLACEMENT);

    let mut spoken = String::with_capacity(without_urls.len() + 16);
    for ch in without_urls.chars() {
        match SYMBOL_WORDS.iter().find(|(sym, _)| *sym == ch) {
            Some((_, word)) => spoken.push_str(word),
            None => spoken.push(ch),
        }
    }

    let stripped = UNSPEAKABLE_RE.replace_all(&spoken, " ");
    WHITESPACE_RE.replace_all(&stripped, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_and_percent_are_spoken() {
        let out = sanitize_for_speech("Check https://x.com now! 50%");
        assert!(!out.contains("https://"), "{out}");
        assert!(!out.contains("x.com"), "{out}");
        assert!(out.contains("URL omitted"), "{out}");
        assert!(out.contains("50 percent"), "{out}");
        assert_eq!(out, "Check URL omitted now! 50 percent");
    }

    #[test]
    fn www_links_are_omitted() {
        assert_eq!(
            sanitize_for_speech("see www.example.org/docs for more"),
            "see URL omitted for more"
        );
    }

    #[test]
    fn symbols_become_words() {
        assert_eq!(sanitize_for_speech("2+2=4"), "2 plus 2 equals 4");
        assert_eq!(sanitize_for_speech("a < b > c"), "a less than b greater than c");
        assert_eq!(sanitize_for_speech("me@home #1 $5"), "me at home hashtag 1 dollar 5");
        assert_eq!(sanitize_for_speech("snake_case"), "snake underscore case");
    }

    #[test]
    fn markdown_noise_is_stripped() {
        assert_eq!(
            sanitize_for_speech("`code` (aside) [link] ~tilde~"),
            "code aside link tilde"
        );
    }

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(sanitize_for_speech("  hello \n\t world  "), "hello world");
        assert_eq!(sanitize_for_speech("   "), "");
    }

    #[test]
    fn sanitizing_twice_changes_nothing() {
        for input in [
            "Check https://x.com now! 50%",
            "a+b*c/d = e & f | g",
            "email me@example.com_now",
            "plain sentence, already clean.",
            "weird ~`^ chars {here}",
        ] {
            let once = sanitize_for_speech(input);
            assert_eq!(sanitize_for_speech(&once), once, "input: {input}");
        }
    }
}
