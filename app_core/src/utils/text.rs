use once_cell::sync::Lazy;
use regex::Regex;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

/// Removes HTML tags from product descriptions before they become pin copy.
pub fn clean_html(text: &str) -> String {
    HTML_TAG.replace_all(text, "").trim().to_string()
}

/// Truncates text to `max_length` characters, preferring a word boundary
/// when the boundary does not cost more than 30% of the budget.
pub fn truncate_text(text: &str, max_length: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_length {
        return text.to_string();
    }

    let truncated: String = chars[..max_length].iter().collect();
    let cut = match truncated.rfind(' ') {
        Some(last_space) if last_space > max_length * 7 / 10 => &truncated[..last_space],
        _ => truncated.as_str(),
    };

    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_html_strips_tags_and_whitespace() {
        assert_eq!(
            clean_html("<p>Soft <b>cotton</b> hoodie</p>  "),
            "Soft cotton hoodie"
        );
        assert_eq!(clean_html(""), "");
    }

    #[test]
    fn test_truncate_keeps_short_text_untouched() {
        assert_eq!(truncate_text("Blue Mug", 100), "Blue Mug");
    }

    #[test]
    fn test_truncate_breaks_at_word_boundary() {
        let text = "Premium organic cotton oversized hoodie with embroidered detail";
        let truncated = truncate_text(text, 30);
        assert!(truncated.len() <= 33);
        assert!(truncated.ends_with("..."));
        assert!(!truncated.trim_end_matches("...").ends_with(' '));
    }

    #[test]
    fn test_truncate_hard_cuts_unbroken_text() {
        let text = "a".repeat(600);
        let truncated = truncate_text(&text, 500);
        assert_eq!(truncated.chars().count(), 503);
    }
}
