//! Language helpers: capture locale selection and spoken exit phrases.

/// Recognizer locale for a detected language code. Vietnamese maps to `vi-VN`,
/// everything else to `en-US`.
pub fn locale_for(language: &str) -> &'static str {
    if primary_subtag(language).eq_ignore_ascii_case("vi") {
        "vi-VN"
    } else {
        "en-US"
    }
}

/// Normalize a language tag as reported by the server ("VI", "vi-VN", " en ").
/// Returns `None` for an empty tag.
pub fn normalize_language(language: &str) -> Option<String> {
    let primary = primary_subtag(language);
    if primary.is_empty() {
        None
    } else {
        Some(primary.to_ascii_lowercase())
    }
}

fn primary_subtag(language: &str) -> &str {
    language
        .trim()
        .split(['-', '_'])
        .next()
        .unwrap_or("")
}

/// Lowercase, trim, and strip trailing punctuation so "Tạm biệt!" matches "tạm biệt".
fn normalize_phrase(text: &str) -> String {
    text.trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c == '…')
        .trim()
        .to_lowercase()
}

/// True when the whole utterance is one of the configured exit phrases.
pub fn is_exit_phrase(text: &str, exit_phrases: &[String]) -> bool {
    let spoken = normalize_phrase(text);
    !spoken.is_empty()
        && exit_phrases
            .iter()
            .any(|phrase| normalize_phrase(phrase) == spoken)
}
