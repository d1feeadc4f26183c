//! Rule-based punctuation restoration.
//!
//! Capitalizes sentence starts and the English pronoun "i", and closes the text
//! with a terminal mark: `?` for English questions, `。`/`？` for CJK text,
//! `.` otherwise. Text that already ends with a terminal mark keeps it.

use crate::pipeline::script::is_unspaced;
use crate::runtime::backend::PunctuationRestorer;
use crate::runtime::{ModelError, Precision};

const TERMINAL_MARKS: [char; 6] = ['.', '?', '!', '。', '？', '！'];

const QUESTION_OPENERS: [&str; 20] = [
    "what", "why", "how", "who", "whom", "whose", "where", "when", "which", "is", "are", "am", "do",
    "does", "did", "can", "could", "would", "will", "should",
];

const CJK_QUESTION_PARTICLES: [char; 3] = ['吗', '呢', 'か'];

#[derive(Debug, Default)]
pub struct RulePunctuator;

impl RulePunctuator {
    pub fn new() -> Self {
        Self
    }

    pub fn punctuate(&self, text: &str) -> String {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return String::new();
        }

        let mut out = words
            .iter()
            .enumerate()
            .map(|(i, word)| {
                if i > 0 && *word == "i" {
                    "I".to_string()
                } else {
                    (*word).to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        out = capitalize_first(&out);

        let Some(last) = out.chars().last() else {
            return out;
        };
        if TERMINAL_MARKS.contains(&last) {
            return out;
        }

        if is_unspaced(last) {
            out.push(if CJK_QUESTION_PARTICLES.contains(&last) { '？' } else { '。' });
        } else if QUESTION_OPENERS.contains(&words[0].to_lowercase().as_str()) {
            out.push('?');
        } else {
            out.push('.');
        }
        out
    }
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl PunctuationRestorer for RulePunctuator {
    fn restore(&self, text: &str, _precision: Precision) -> Result<String, ModelError> {
        Ok(self.punctuate(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_gets_period() {
        assert_eq!(RulePunctuator::new().punctuate("hello  world"), "Hello world.");
    }

    #[test]
    fn test_question_gets_question_mark() {
        assert_eq!(RulePunctuator::new().punctuate("how are you"), "How are you?");
        assert_eq!(RulePunctuator::new().punctuate("can i help"), "Can I help?");
    }

    #[test]
    fn test_existing_terminal_mark_kept() {
        assert_eq!(RulePunctuator::new().punctuate("wow!"), "Wow!");
    }

    #[test]
    fn test_cjk_marks() {
        let punctuator = RulePunctuator::new();
        assert_eq!(punctuator.punctuate("今天天气很好"), "今天天气很好。");
        assert_eq!(punctuator.punctuate("你好吗"), "你好吗？");
    }

    #[test]
    fn test_blank_input() {
        assert_eq!(RulePunctuator::new().punctuate("   "), "");
    }
}
