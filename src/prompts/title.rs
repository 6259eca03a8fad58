//! Conversation title prompt and cleanup

use crate::providers::Prompt;

/// Builds the title request for a conversation transcript
///
/// # Examples
///
/// ```
/// use threadline::prompts::title_prompt;
///
/// let prompt = title_prompt("User: What is Rust?");
/// assert!(prompt.text.ends_with("User: What is Rust?"));
/// ```
pub fn title_prompt(transcript: &str) -> Prompt {
    Prompt::new(format!(
        "Generate a short, descriptive title (max. 3 words and plain text) \
for the following conversation:\n\n{}",
        transcript
    ))
}

/// Normalizes a generated title
///
/// Keeps the first non-empty line, strips surrounding quotes and a trailing
/// period, and truncates to `max_chars` characters. Returns `None` when
/// nothing usable is left.
///
/// # Examples
///
/// ```
/// use threadline::prompts::clean_title;
///
/// assert_eq!(clean_title("  \"Rust Basics\"\n", 60).as_deref(), Some("Rust Basics"));
/// assert_eq!(clean_title("   ", 60), None);
/// ```
pub fn clean_title(raw: &str, max_chars: usize) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let unquoted = line
        .trim_matches(|c| matches!(c, '"' | '\'' | '`' | '*'))
        .trim()
        .trim_end_matches('.')
        .trim();
    if unquoted.is_empty() {
        return None;
    }
    Some(unquoted.chars().take(max_chars).collect::<String>().trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_prompt_contains_instruction() {
        let prompt = title_prompt("User: hi");
        assert!(prompt.text.starts_with("Generate a short, descriptive title"));
        assert!(prompt.system.is_none());
    }

    #[test]
    fn test_clean_title_strips_quotes_and_period() {
        assert_eq!(clean_title("'Weekend Plans.'", 60).as_deref(), Some("Weekend Plans"));
        assert_eq!(clean_title("**Bold Title**", 60).as_deref(), Some("Bold Title"));
    }

    #[test]
    fn test_clean_title_uses_first_line() {
        assert_eq!(
            clean_title("\n\nTrip Ideas\nSecond line", 60).as_deref(),
            Some("Trip Ideas")
        );
    }

    #[test]
    fn test_clean_title_truncates_by_chars() {
        assert_eq!(clean_title("Ünïcödé Title", 3).as_deref(), Some("Ünï"));
    }

    #[test]
    fn test_clean_title_empty_after_cleanup() {
        assert_eq!(clean_title("\"\"", 60), None);
    }
}
