//! Turn-taking management for conversational flow
//!
//! Accumulates the user's and the assistant's transcripts for one exchange and
//! decides when user speech counts as a barge-in. A single grunt or a false VAD
//! trigger must not cut the assistant off, so interruption waits for a minimum
//! number of legible words.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

fn default_min_legible_words() -> usize {
    2
}

fn default_fillers() -> Vec<String> {
    ["um", "uh", "ah", "eh", "oh", "mm", "hm", "hmm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Configuration for barge-in detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BargeInConfig {
    /// Legible words needed in the current turn before playback is cut (default: 2)
    #[serde(default = "default_min_legible_words")]
    pub min_legible_words: usize,

    /// Tokens never counted as words, compared case-insensitively
    #[serde(default = "default_fillers")]
    pub fillers: Vec<String>,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            min_legible_words: default_min_legible_words(),
            fillers: default_fillers(),
        }
    }
}

/// A finished exchange handed to the caller on turn completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTurn {
    pub input_transcript: String,
    pub output_transcript: String,
    pub interrupted: bool,
    pub timestamp: DateTime<Utc>,
}

/// Result of feeding user transcript text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeIn {
    /// Keep playing.
    None,
    /// Threshold crossed this call; cancel playback now.
    Interrupt { legible_words: usize },
}

/// Count tokens with at least two alphabetic characters that are not fillers.
pub fn count_legible_words(text: &str, fillers: &[String]) -> usize {
    text.split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_alphabetic())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|word| word.chars().count() >= 2)
        .filter(|word| !fillers.iter().any(|f| f.eq_ignore_ascii_case(word)))
        .count()
}

/// Per-turn transcript accumulator with the barge-in heuristic.
#[derive(Debug, Clone)]
pub struct TurnTracker {
    config: BargeInConfig,
    input: String,
    output: String,
    interrupted: bool,
}

impl TurnTracker {
    pub fn new(config: BargeInConfig) -> Self {
        Self {
            config,
            input: String::new(),
            output: String::new(),
            interrupted: false,
        }
    }

    pub fn input_transcript(&self) -> &str {
        &self.input
    }

    pub fn output_transcript(&self) -> &str {
        &self.output
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Legible words in the current turn's accumulated input.
    pub fn legible_words(&self) -> usize {
        count_legible_words(&self.input, &self.config.fillers)
    }

    /// Append user transcript text. While the assistant is speaking this may fire a
    /// barge-in, at most once per turn.
    pub fn push_input(&mut self, text: &str, assistant_speaking: bool) -> BargeIn {
        self.input.push_str(text);

        if !assistant_speaking || self.interrupted {
            return BargeIn::None;
        }

        let legible_words = self.legible_words();
        if legible_words >= self.config.min_legible_words {
            self.interrupted = true;
            info!("⚡ Barge-in: {} legible word(s), silencing assistant", legible_words);
            return BargeIn::Interrupt { legible_words };
        }

        debug!(legible_words, "user speech below barge-in threshold");
        BargeIn::None
    }

    /// Append assistant transcript text.
    pub fn push_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    /// The model reported an interruption. Honoured only while buffers are playing,
    /// once the local threshold has been crossed for this turn and no barge-in has
    /// fired yet. Returns true when playback should be cancelled; only then is the
    /// turn marked interrupted.
    pub fn model_interrupted(&mut self, playing: bool) -> bool {
        if self.interrupted {
            debug!("model interruption after barge-in; already handled this turn");
            return false;
        }
        if !playing {
            debug!("ignoring model interruption with nothing playing");
            return false;
        }
        let legible_words = self.legible_words();
        if legible_words >= self.config.min_legible_words {
            self.interrupted = true;
            info!("⚡ Model interruption accepted ({} legible word(s))", legible_words);
            true
        } else {
            debug!(legible_words, "ignoring model interruption below threshold");
            false
        }
    }

    /// Hand back the accumulated pair and reset both transcripts together.
    pub fn complete(&mut self) -> CompletedTurn {
        let turn = CompletedTurn {
            input_transcript: std::mem::take(&mut self.input),
            output_transcript: std::mem::take(&mut self.output),
            interrupted: std::mem::replace(&mut self.interrupted, false),
            timestamp: Utc::now(),
        };
        info!(
            interrupted = turn.interrupted,
            "🎯 Turn completed ({} input chars, {} output chars)",
            turn.input_transcript.len(),
            turn.output_transcript.len()
        );
        turn
    }

    /// Drop all state without emitting a turn.
    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.interrupted = false;
    }
}

impl Default for TurnTracker {
    fn default() -> Self {
        Self::new(BargeInConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legible_word_rules() {
        let fillers = default_fillers();
        assert_eq!(count_legible_words("", &fillers), 0);
        assert_eq!(count_legible_words("a I", &fillers), 0);
        assert_eq!(count_legible_words("um uh ah Hmm", &fillers), 0);
        assert_eq!(count_legible_words("wait, stop!", &fillers), 2);
        assert_eq!(count_legible_words("no... 42 ok", &fillers), 2);
        assert_eq!(count_legible_words("UM, hello", &fillers), 1);
    }

    #[test]
    fn fires_on_second_legible_word_exactly_once() {
        let mut tracker = TurnTracker::default();

        assert_eq!(tracker.push_input("um ", true), BargeIn::None);
        assert_eq!(tracker.push_input("hello ", true), BargeIn::None);
        assert_eq!(
            tracker.push_input("there ", true),
            BargeIn::Interrupt { legible_words: 2 }
        );
        assert_eq!(tracker.push_input("friend ", true), BargeIn::None);
        assert_eq!(tracker.push_input("really ", true), BargeIn::None);
        assert!(tracker.is_interrupted());
    }

    #[test]
    fn fillers_never_interrupt() {
        let mut tracker = TurnTracker::default();
        for word in ["um ", "uh ", "ah ", "um ", "uh ", "ah "] {
            assert_eq!(tracker.push_input(word, true), BargeIn::None);
        }
        assert!(!tracker.is_interrupted());
    }

    #[test]
    fn no_barge_in_while_assistant_silent() {
        let mut tracker = TurnTracker::default();
        assert_eq!(tracker.push_input("hello there friend", false), BargeIn::None);
        assert!(!tracker.is_interrupted());
    }

    #[test]
    fn model_interruption_requires_local_threshold() {
        let mut tracker = TurnTracker::default();
        tracker.push_input("hey", false);
        assert!(!tracker.model_interrupted(true));
        tracker.push_input(" listen", false);
        assert!(tracker.model_interrupted(true));
        assert!(tracker.is_interrupted());
        // Suppressed for the rest of the turn.
        assert!(!tracker.model_interrupted(true));
    }

    #[test]
    fn model_interruption_with_nothing_playing_keeps_barge_in_armed() {
        let mut tracker = TurnTracker::default();
        tracker.push_input("tell me", false);
        assert!(!tracker.model_interrupted(false));
        assert!(!tracker.is_interrupted());

        assert!(matches!(
            tracker.push_input(" wait stop please", true),
            BargeIn::Interrupt { .. }
        ));
        assert!(tracker.complete().interrupted);
    }

    #[test]
    fn completion_clears_both_transcripts_together() {
        let mut tracker = TurnTracker::default();
        tracker.push_input("what time is it", false);
        tracker.push_output("It is noon.");
        let turn = tracker.complete();

        assert_eq!(turn.input_transcript, "what time is it");
        assert_eq!(turn.output_transcript, "It is noon.");
        assert!(!turn.interrupted);
        assert!(tracker.input_transcript().is_empty());
        assert!(tracker.output_transcript().is_empty());
    }

    #[test]
    fn threshold_is_configurable_and_rearms_next_turn() {
        let mut tracker = TurnTracker::new(BargeInConfig {
            min_legible_words: 3,
            ..Default::default()
        });
        assert_eq!(tracker.push_input("stop right", true), BargeIn::None);
        assert!(matches!(tracker.push_input(" now", true), BargeIn::Interrupt { .. }));
        assert!(tracker.complete().interrupted);

        assert_eq!(tracker.push_input("one two", true), BargeIn::None);
        assert!(matches!(tracker.push_input(" three", true), BargeIn::Interrupt { .. }));
    }
}
