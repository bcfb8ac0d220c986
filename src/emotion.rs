//! Mood tag parsing for LLM replies.
//!
//! The dialog model is instructed to append `[mood:xxx]` to its replies.
//! Tags may appear anywhere in the text; the last one wins and all of them
//! are stripped before the text reaches the device or the synthesizer.

use regex::Regex;
use std::sync::LazyLock;

/// `[mood:happy]` matches; `[mood: happy]` (with a space) does not.
static MOOD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[mood:(\w+)\]").unwrap_or_else(|e| panic!("mood regex: {e}")));

/// Moods the device can render.
///
/// The first eight are emitted by the LLM via mood tags; the last three are
/// push-side decorators used on `care` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mood {
    Happy,
    Sad,
    Thinking,
    Angry,
    Sleepy,
    Surprised,
    Tsundere,
    #[default]
    Neutral,
    Caring,
    Gentle,
    Excited,
}

impl Mood {
    /// Wire name of the mood.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Thinking => "thinking",
            Self::Angry => "angry",
            Self::Sleepy => "sleepy",
            Self::Surprised => "surprised",
            Self::Tsundere => "tsundere",
            Self::Neutral => "neutral",
            Self::Caring => "caring",
            Self::Gentle => "gentle",
            Self::Excited => "excited",
        }
    }

    /// Parse an LLM-emitted tag word. Only the eight model moods are
    /// recognized; anything else is [`Mood::Neutral`].
    fn from_tag(word: &str) -> Option<Self> {
        match word {
            "happy" => Some(Self::Happy),
            "sad" => Some(Self::Sad),
            "thinking" => Some(Self::Thinking),
            "angry" => Some(Self::Angry),
            "sleepy" => Some(Self::Sleepy),
            "surprised" => Some(Self::Surprised),
            "tsundere" => Some(Self::Tsundere),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract the mood from `text` and return it with the cleaned text.
///
/// The mood is the word of the **last** `[mood:xxx]` tag when it names a
/// recognized mood, otherwise [`Mood::Neutral`]. Every tag is removed from
/// the returned text, which is then trimmed.
pub fn extract(text: &str) -> (Mood, String) {
    let mut mood = Mood::Neutral;
    let mut matched = false;
    for caps in MOOD_PATTERN.captures_iter(text) {
        matched = true;
        mood = caps
            .get(1)
            .and_then(|m| Mood::from_tag(m.as_str()))
            .unwrap_or(Mood::Neutral);
    }
    if !matched {
        return (Mood::Neutral, text.to_owned());
    }
    let cleaned = MOOD_PATTERN.replace_all(text, "").trim().to_owned();
    (mood, cleaned)
}

/// Remove every mood tag from `text` and trim the result.
pub fn strip(text: &str) -> String {
    extract(text).1
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn no_tag_is_neutral_and_untrimmed() {
        let (mood, cleaned) = extract("你好呀");
        assert_eq!(mood, Mood::Neutral);
        assert_eq!(cleaned, "你好呀");
    }

    #[test]
    fn trailing_tag_extracted_and_stripped() {
        let (mood, cleaned) = extract("今天真不错！[mood:happy]");
        assert_eq!(mood, Mood::Happy);
        assert_eq!(cleaned, "今天真不错！");
    }

    #[test]
    fn last_tag_wins() {
        let (mood, cleaned) = extract("[mood:sad]开始[mood:angry]中间[mood:happy]结尾");
        assert_eq!(mood, Mood::Happy);
        assert_eq!(cleaned, "开始中间结尾");
    }

    #[test]
    fn unrecognized_word_is_neutral_but_still_stripped() {
        let (mood, cleaned) = extract("嗯[mood:confused]");
        assert_eq!(mood, Mood::Neutral);
        assert_eq!(cleaned, "嗯");
    }

    #[test]
    fn spaced_tag_is_not_recognized() {
        let (mood, cleaned) = extract("你好[mood: happy]");
        assert_eq!(mood, Mood::Neutral);
        assert_eq!(cleaned, "你好[mood: happy]");
    }

    #[test]
    fn tag_only_text_strips_to_empty() {
        let (mood, cleaned) = extract("[mood:sleepy]");
        assert_eq!(mood, Mood::Sleepy);
        assert!(cleaned.is_empty());
    }

    #[test]
    fn strip_removes_all_tags() {
        assert_eq!(strip("a[mood:happy]b[mood:sad]c"), "abc");
    }

    #[test]
    fn mood_wire_names() {
        assert_eq!(Mood::Caring.as_str(), "caring");
        assert_eq!(Mood::Gentle.to_string(), "gentle");
        assert_eq!(Mood::default(), Mood::Neutral);
    }
}
