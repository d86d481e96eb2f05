// Text cleanup helpers shared by the feed ingestor and report renderers.

use once_cell::sync::Lazy;
use regex::Regex;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("invalid tag regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("invalid ws regex"));

/// Strip HTML tags, decode common entities, and collapse whitespace.
pub fn clean_html(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let stripped = HTML_TAG.replace_all(text, "");
    let decoded = decode_entities(&stripped);
    WHITESPACE.replace_all(decoded.trim(), " ").into_owned()
}

/// Decode the entity set that shows up in RSS summaries
pub fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Truncate to at most `max_chars` characters (not bytes), appending an
/// ellipsis when content was dropped.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut result: String = text.chars().take(keep).collect();
    result.push_str("...");
    result
}

/// First `max_chars` characters without an ellipsis (for ids and queries)
pub fn prefix_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_decodes_entities() {
        let raw = "<p>央行宣布&nbsp;<b>降准</b> &amp; 降息</p>";
        assert_eq!(clean_html(raw), "央行宣布 降准 & 降息");
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(clean_html("a\n\n  b\t c"), "a b c");
    }

    #[test]
    fn truncation_is_char_safe_for_cjk() {
        let text = "中国人民银行决定下调存款准备金率";
        let truncated = truncate_chars(text, 8);
        assert_eq!(truncated.chars().count(), 8);
        assert!(truncated.ends_with("..."));

        // Short text passes through untouched
        assert_eq!(truncate_chars("短", 8), "短");
    }

    #[test]
    fn prefix_keeps_exact_char_count() {
        assert_eq!(prefix_chars("abcdef", 3), "abc");
        assert_eq!(prefix_chars("央行降准公告", 2), "央行");
    }
}
