//! # Text Filter Chain
//!
//! Post-processing applied to recognizer output before punctuation.
//!
//! ## Stages:
//! - **Repeat suppression**: caps runs of identical tokens, then runs of
//!   identical characters in the rendered text
//! - **Low-information rejection**: empties transcripts made of very few
//!   distinct units (decoder loops, hum transcribed as one syllable)
//! - **Script mismatch**: strips characters foreign to the identified
//!   language, only when identification is confident enough
//!
//! Stages run in the configured order. Rejections yield empty text, never errors.

use crate::pipeline::script::{is_unspaced, mismatch_pattern};
use crate::runtime::{LanguageGuess, Token, Transcript};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Repeat,
    LowInfo,
    ScriptMismatch,
}

/// Filter thresholds, the `filters` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub repeat_filter_enabled: bool,
    pub max_consecutive_token_repeats: usize,
    pub max_consecutive_char_repeats: usize,
    /// Minimum unit count before the low-information check applies
    pub low_info_min_units: usize,
    pub low_info_unique_ratio: f64,
    pub script_mismatch_filter_enabled: bool,
    pub script_mismatch_min_confidence: f32,
    pub order: Vec<FilterStage>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            repeat_filter_enabled: true,
            max_consecutive_token_repeats: 8,
            max_consecutive_char_repeats: 6,
            low_info_min_units: 24,
            low_info_unique_ratio: 0.16,
            script_mismatch_filter_enabled: true,
            script_mismatch_min_confidence: 0.80,
            order: vec![FilterStage::Repeat, FilterStage::LowInfo, FilterStage::ScriptMismatch],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextFilterChain {
    config: FilterConfig,
}

impl TextFilterChain {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Run every configured stage over `transcript`.
    ///
    /// `language` is only supplied by the combined pipeline; without it the
    /// script-mismatch stage is skipped.
    pub fn apply(
        &self,
        mut transcript: Transcript,
        language: Option<&LanguageGuess>,
    ) -> Transcript {
        for stage in &self.config.order {
            if transcript.text.is_empty() && transcript.tokens.is_empty() {
                break;
            }
            transcript = match stage {
                FilterStage::Repeat => self.suppress_repeats(transcript),
                FilterStage::LowInfo => self.reject_low_information(transcript),
                FilterStage::ScriptMismatch => match language {
                    Some(language) => self.filter_script_mismatch(transcript, language),
                    None => transcript,
                },
            };
        }
        transcript
    }

    /// Cap token runs, re-render, then cap character runs.
    pub fn suppress_repeats(&self, mut transcript: Transcript) -> Transcript {
        if !self.config.repeat_filter_enabled {
            return transcript;
        }
        let char_cap = self.config.max_consecutive_char_repeats;

        if transcript.tokens.is_empty() {
            let words: Vec<Token> =
                transcript.text.split_whitespace().map(Token::untimed).collect();
            let words = collapse_token_runs(words, self.config.max_consecutive_token_repeats);
            transcript.text = collapse_char_runs(&render_tokens(&words), char_cap);
            return transcript;
        }

        let tokens =
            collapse_token_runs(transcript.tokens, self.config.max_consecutive_token_repeats);
        transcript.text = collapse_char_runs(&render_tokens(&tokens), char_cap);
        transcript.tokens = tokens
            .into_iter()
            .map(|mut token| {
                token.text = collapse_char_runs(&token.text, char_cap);
                token
            })
            .collect();
        transcript
    }

    /// Empty the transcript when too few of its units are distinct.
    ///
    /// Units are the tokens when present, otherwise non-whitespace characters.
    pub fn reject_low_information(&self, transcript: Transcript) -> Transcript {
        let units: Vec<String> = if transcript.tokens.is_empty() {
            transcript.text.chars().filter(|c| !c.is_whitespace()).map(String::from).collect()
        } else {
            transcript.tokens.iter().map(|t| t.text.to_lowercase()).collect()
        };

        let total = units.len();
        if total == 0 || total < self.config.low_info_min_units {
            return transcript;
        }

        let unique = units.iter().collect::<HashSet<_>>().len();
        let ratio = unique as f64 / total as f64;
        if ratio < self.config.low_info_unique_ratio {
            debug!(total, unique, ratio, "Rejected low-information transcript");
            return Transcript {
                text: String::new(),
                tokens: Vec::new(),
                confidence: transcript.confidence,
            };
        }
        transcript
    }

    /// Remove characters foreign to the identified language.
    pub fn filter_script_mismatch(
        &self,
        mut transcript: Transcript,
        language: &LanguageGuess,
    ) -> Transcript {
        let Some(pattern) = self.mismatch_pattern(language) else {
            return transcript;
        };

        transcript.text = self.strip(&pattern, &transcript.text);
        transcript.tokens = transcript
            .tokens
            .into_iter()
            .filter_map(|mut token| {
                token.text = self.strip(&pattern, &token.text);
                (!token.text.is_empty()).then_some(token)
            })
            .collect();
        transcript
    }

    /// Script-filter a finished sentence (after punctuation).
    pub fn filter_sentence(&self, text: &str, language: &LanguageGuess) -> String {
        match self.mismatch_pattern(language) {
            Some(pattern) => self.strip(&pattern, text),
            None => text.to_string(),
        }
    }

    fn mismatch_pattern(&self, language: &LanguageGuess) -> Option<Regex> {
        if !self.config.script_mismatch_filter_enabled
            || language.confidence < self.config.script_mismatch_min_confidence
        {
            return None;
        }
        mismatch_pattern(&language.lang)
    }

    fn strip(&self, pattern: &Regex, text: &str) -> String {
        let removed = pattern.replace_all(text, "");
        removed.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Truncate runs of identical tokens to at most `cap`.
pub fn collapse_token_runs(tokens: Vec<Token>, cap: usize) -> Vec<Token> {
    let mut kept: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut run = 0;
    for token in tokens {
        match kept.last() {
            Some(previous) if previous.text == token.text => run += 1,
            _ => run = 1,
        }
        if run <= cap {
            kept.push(token);
        }
    }
    kept
}

/// Truncate runs of an identical character to at most `cap`.
pub fn collapse_char_runs(text: &str, cap: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous = None;
    let mut run = 0;
    for c in text.chars() {
        if Some(c) == previous {
            run += 1;
        } else {
            previous = Some(c);
            run = 1;
        }
        if run <= cap {
            out.push(c);
        }
    }
    out
}

/// Join tokens into text: spaced, except between two unspaced-script characters.
pub fn render_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        let text = token.text.trim();
        if text.is_empty() {
            continue;
        }
        let joins_tight = match (out.chars().last(), text.chars().next()) {
            (Some(last), Some(first)) => is_unspaced(last) && is_unspaced(first),
            _ => true,
        };
        if !out.is_empty() && !joins_tight {
            out.push(' ');
        }
        out.push_str(text);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(words: &[&str]) -> Transcript {
        Transcript {
            text: words.join(" "),
            tokens: words.iter().map(|w| Token::untimed(*w)).collect(),
            confidence: Some(0.9),
        }
    }

    fn guess(lang: &str, confidence: f32) -> LanguageGuess {
        LanguageGuess { lang: lang.to_string(), confidence }
    }

    #[test]
    fn test_ten_repeated_tokens_capped_at_eight() {
        let chain = TextFilterChain::new(FilterConfig::default());
        let result = chain.suppress_repeats(tokens(&["A"; 10]));

        assert_eq!(result.tokens.len(), 8);
        assert_eq!(result.text.matches('A').count(), 8);
    }

    #[test]
    fn test_char_runs_collapsed_after_rendering() {
        let chain = TextFilterChain::new(FilterConfig::default());
        let result = chain.suppress_repeats(tokens(&["哈哈哈哈哈哈哈哈哈哈", "好"]));
        assert_eq!(result.text, "哈哈哈哈哈哈好");
    }

    #[test]
    fn test_repeat_filter_on_plain_text() {
        let chain = TextFilterChain::new(FilterConfig::default());
        let transcript = Transcript {
            text: "no no no no no no no no no no soooooooooo".into(),
            ..Default::default()
        };
        let result = chain.suppress_repeats(transcript);
        assert_eq!(result.text, "no no no no no no no no soooooo");
    }

    #[test]
    fn test_repeat_filter_disabled_is_noop() {
        let chain = TextFilterChain::new(FilterConfig {
            repeat_filter_enabled: false,
            ..Default::default()
        });
        let result = chain.suppress_repeats(tokens(&["A"; 10]));
        assert_eq!(result.tokens.len(), 10);
    }

    #[test]
    fn test_low_information_thirty_units_three_unique_discarded() {
        let chain = TextFilterChain::new(FilterConfig::default());
        let words: Vec<&str> = ["la", "da", "di"].iter().copied().cycle().take(30).collect();
        let result = chain.reject_low_information(tokens(&words));

        assert!(result.text.is_empty());
        assert!(result.tokens.is_empty());
    }

    #[test]
    fn test_low_information_below_minimum_kept() {
        let chain = TextFilterChain::new(FilterConfig::default());
        let words: Vec<&str> = ["la", "da", "di"].iter().copied().cycle().take(10).collect();
        let result = chain.reject_low_information(tokens(&words));
        assert_eq!(result.tokens.len(), 10);
    }

    #[test]
    fn test_low_information_counts_chars_without_tokens() {
        let chain = TextFilterChain::new(FilterConfig::default());
        let transcript = Transcript { text: "ab".repeat(20), ..Default::default() };
        assert!(chain.reject_low_information(transcript).text.is_empty());

        let varied = Transcript {
            text: "the quick brown fox jumps over".into(),
            ..Default::default()
        };
        assert!(!chain.reject_low_information(varied).text.is_empty());
    }

    #[test]
    fn test_script_filter_applies_at_high_confidence() {
        let chain = TextFilterChain::new(FilterConfig::default());
        let mixed = tokens(&["hello", "你好", "world"]);
        let result = chain.filter_script_mismatch(mixed, &guess("en", 0.90));

        assert_eq!(result.text, "hello world");
        let kept: Vec<&str> = result.tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(kept, vec!["hello", "world"]);
    }

    #[test]
    fn test_script_filter_skipped_at_low_confidence() {
        let chain = TextFilterChain::new(FilterConfig::default());
        let mixed = tokens(&["hello", "你好", "world"]);
        let result = chain.filter_script_mismatch(mixed, &guess("en", 0.5));
        assert_eq!(result.text, "hello 你好 world");
        assert_eq!(result.tokens.len(), 3);
    }

    #[test]
    fn test_script_filter_unknown_language_untouched() {
        let chain = TextFilterChain::new(FilterConfig::default());
        let result = chain.filter_script_mismatch(tokens(&["hello", "你好"]), &guess("xx", 0.99));
        assert_eq!(result.text, "hello 你好");
    }

    #[test]
    fn test_apply_without_language_skips_script_stage() {
        let chain = TextFilterChain::new(FilterConfig::default());
        let result = chain.apply(tokens(&["hello", "你好"]), None);
        assert_eq!(result.text, "hello 你好");
    }

    #[test]
    fn test_apply_respects_configured_order() {
        // Low-info before repeat sees all 30 units and rejects.
        let config = FilterConfig {
            low_info_min_units: 24,
            low_info_unique_ratio: 0.5,
            order: vec![FilterStage::LowInfo, FilterStage::Repeat],
            ..Default::default()
        };
        let chain = TextFilterChain::new(config.clone());
        assert!(chain.apply(tokens(&["A"; 30]), None).text.is_empty());

        // Repeat first leaves 8 units, under the minimum, so the text survives.
        let chain = TextFilterChain::new(FilterConfig {
            order: vec![FilterStage::Repeat, FilterStage::LowInfo],
            ..config
        });
        assert_eq!(chain.apply(tokens(&["A"; 30]), None).tokens.len(), 8);
    }

    #[test]
    fn test_render_tokens_spacing() {
        let mixed = vec![Token::untimed("你"), Token::untimed("好"), Token::untimed("world")];
        assert_eq!(render_tokens(&mixed), "你好 world");
    }
}
