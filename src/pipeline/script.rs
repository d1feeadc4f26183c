//! Language → Unicode script mapping used by the script-mismatch filter.

use regex::Regex;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

type ScriptSet = &'static [&'static str];

/// Scripts a language is written in, as regex script property names.
///
/// Returns `None` for languages without a known mapping; those are never filtered.
pub fn scripts_for(lang: &str) -> Option<ScriptSet> {
    let base = lang
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();

    let scripts: ScriptSet = match base.as_str() {
        "en" | "fr" | "de" | "es" | "it" | "pt" | "nl" | "sv" | "da" | "no" | "nb" | "nn" | "fi"
        | "pl" | "cs" | "sk" | "sl" | "hr" | "ro" | "hu" | "tr" | "id" | "ms" | "vi" | "tl" | "ca"
        | "eu" | "gl" | "et" | "lv" | "lt" | "sq" | "af" | "sw" | "is" | "cy" | "ga" | "mt" | "az"
        | "uz" | "la" => &["Latin"],
        "zh" | "yue" => &["Han"],
        "ja" => &["Han", "Hiragana", "Katakana"],
        "ko" => &["Hangul", "Han"],
        "ru" | "uk" | "be" | "bg" | "mk" | "sr" | "kk" | "mn" | "tg" => &["Cyrillic"],
        "ar" | "fa" | "ur" | "ps" => &["Arabic"],
        "hi" | "mr" | "ne" | "sa" => &["Devanagari"],
        "bn" | "as" => &["Bengali"],
        "ta" => &["Tamil"],
        "te" => &["Telugu"],
        "gu" => &["Gujarati"],
        "pa" => &["Gurmukhi"],
        "el" => &["Greek"],
        "he" | "yi" => &["Hebrew"],
        "th" => &["Thai"],
        "ka" => &["Georgian"],
        "hy" => &["Armenian"],
        "km" => &["Khmer"],
        "lo" => &["Lao"],
        "my" => &["Myanmar"],
        "am" => &["Ethiopic"],
        _ => return None,
    };
    Some(scripts)
}

/// Compiled patterns, one per script set.
fn patterns() -> &'static Mutex<HashMap<ScriptSet, Regex>> {
    static PATTERNS: OnceLock<Mutex<HashMap<ScriptSet, Regex>>> = OnceLock::new();
    PATTERNS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Regex matching every character foreign to `lang`.
///
/// Punctuation, digits and combining marks (the Common and Inherited scripts)
/// always pass. Each script set is compiled once per process.
pub fn mismatch_pattern(lang: &str) -> Option<Regex> {
    let scripts = scripts_for(lang)?;
    let mut cache = patterns().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(pattern) = cache.get(scripts) {
        return Some(pattern.clone());
    }

    let allowed: String = scripts.iter().map(|script| format!(r"\p{{{}}}", script)).collect();
    let pattern = Regex::new(&format!(r"[^\s\p{{Common}}\p{{Inherited}}{}]", allowed)).ok()?;
    cache.insert(scripts, pattern.clone());
    Some(pattern)
}

/// True for characters rendered without spaces between words.
pub fn is_unspaced(c: char) -> bool {
    matches!(c as u32,
        0x3000..=0x303F
        | 0x3040..=0x30FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xF900..=0xFAFF
        | 0xFF00..=0xFFEF
        | 0x0E00..=0x0E7F
    )
}
