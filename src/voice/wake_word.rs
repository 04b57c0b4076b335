//! Wake phrase detection
//!
//! Matching runs on finalized transcripts only. The phrase is matched
//! case-insensitively on whitespace-collapsed text and tolerates punctuation
//! between and after its words, so "Hey, assistant?" matches "hey assistant".

use regex::Regex;

use crate::{Error, Result};

/// A transcript segment from the speech-to-text service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    /// False while the service may still revise the segment
    pub is_final: bool,
}

impl Transcript {
    /// A finalized segment
    #[must_use]
    pub fn finalized(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }

    /// A segment that may still be revised
    #[must_use]
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }
}

/// Compiled wake phrase matcher
#[derive(Debug, Clone)]
pub struct WakePhrase {
    phrase: String,
    pattern: Regex,
}

impl WakePhrase {
    /// Compile a wake phrase
    ///
    /// # Errors
    ///
    /// Returns error if the phrase is empty after normalization
    pub fn new(phrase: &str) -> Result<Self> {
        let phrase = normalize(phrase);
        let words: Vec<String> = phrase
            .split(' ')
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .map(regex::escape)
            .collect();

        if words.is_empty() {
            return Err(Error::Config("wake phrase must contain a word".to_string()));
        }

        // Words separated by any run of whitespace/punctuation, bounded on both sides
        let pattern = format!(r"(?i)\b{}\b[[:punct:]]*", words.join(r"[\s[:punct:]]+"));
        let pattern = Regex::new(&pattern)
            .map_err(|e| Error::Config(format!("invalid wake phrase: {e}")))?;

        tracing::debug!(wake_phrase = %phrase, "wake phrase compiled");
        Ok(Self { phrase, pattern })
    }

    /// Normalized phrase
    #[must_use]
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// Check if text contains the wake phrase
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(&normalize(text))
    }

    /// Check a transcript segment; non-final segments never match
    #[must_use]
    pub fn matches_transcript(&self, transcript: &Transcript) -> bool {
        transcript.is_final && self.matches(&transcript.text)
    }

    /// Remove the first occurrence of the phrase, returning the remaining command
    ///
    /// Returns `None` when the phrase is absent. Later occurrences are kept.
    #[must_use]
    pub fn strip(&self, text: &str) -> Option<String> {
        let normalized = normalize(text);
        let found = self.pattern.find(&normalized)?;

        let mut command = String::with_capacity(normalized.len());
        command.push_str(normalized[..found.start()].trim_end());
        let rest = normalized[found.end()..].trim_start_matches(|c: char| {
            c.is_whitespace() || c == ',' || c == '.'
        });
        if !command.is_empty() && !rest.is_empty() {
            command.push(' ');
        }
        command.push_str(rest);

        Some(command.trim().to_string())
    }
}

/// Case-insensitive match of `configured_phrase` in `text`
#[must_use]
pub fn matches(text: &str, configured_phrase: &str) -> bool {
    WakePhrase::new(configured_phrase).is_ok_and(|p| p.matches(text))
}

/// Trim and collapse whitespace runs to single spaces
#[must_use]
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
