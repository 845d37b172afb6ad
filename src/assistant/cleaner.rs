//! Normalization of completed response text into plain spoken text.
//!
//! Model output occasionally carries fragments of the JSON it was wrapped in
//! (`"role":"assistant","content":...`, stray braces, a whole JSON object).
//! [`clean`] runs an ordered set of independent passes over the text until it
//! stops changing. Every pass is total and only ever shortens the text, so the
//! loop terminates and the result is a fixed point: `clean(clean(x)) == clean(x)`.

use crate::error::BridgeError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::LazyLock;

static PROTOCOL_PREAMBLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)^\s*("role"\s*:\s*"assistant"\s*,\s*"content"\s*:\s*|text\s*:\s*|response"\s*:\s*|input_type"\s*:\s*"[^"]+"\s*,\s*"confidence"\s*:\s*[\d.]+\s*\})+"#,
    )
    .expect("protocol preamble pattern is valid")
});

static KEY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\s*"?[a-z_]+"\s*:\s*"#).expect("key prefix pattern is valid")
});

static TRAILING_CLOSERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s,}\]]+$").expect("trailing pattern is valid"));

static LEADING_OPENERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s{\[]+").expect("leading pattern is valid"));

/// Script the spoken text is expected to be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetScript {
    /// Hiragana, katakana and CJK ideographs.
    Japanese,
}

impl TargetScript {
    pub fn contains(self, c: char) -> bool {
        match self {
            TargetScript::Japanese => matches!(c,
                '\u{3005}'                  // 々
                | '\u{3040}'..='\u{309F}'   // hiragana
                | '\u{30A0}'..='\u{30FF}'   // katakana
                | '\u{3400}'..='\u{4DBF}'
                | '\u{4E00}'..='\u{9FFF}'
                | '\u{FF66}'..='\u{FF9F}'), // half-width katakana
        }
    }
}

impl FromStr for TargetScript {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "japanese" | "ja" => Ok(TargetScript::Japanese),
            other => Err(BridgeError::Config(format!("unknown speech script '{}'", other))),
        }
    }
}

/// Cleans `raw` with the script-independent passes.
pub fn clean(raw: &str) -> String {
    clean_for_script(raw, None)
}

/// Cleans `raw`, additionally dropping any leading run of characters outside
/// `script` when a script is given.
pub fn clean_for_script(raw: &str, script: Option<TargetScript>) -> String {
    let mut current = raw.trim().to_string();
    // Each changing round strictly shortens the text.
    for _ in 0..=current.len() {
        let next = clean_once(&current, script);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn clean_once(text: &str, script: Option<TargetScript>) -> String {
    if text.is_empty() {
        return String::new();
    }
    let text = strip_preamble(text);
    if let Some(value) = structured_value(&text) {
        return value.trim().to_string();
    }
    let text = strip_trailing_artifacts(&text);
    let text = strip_leading_artifacts(&text);
    let text = match script {
        Some(script) => strip_foreign_prefix(&text, script),
        None => text,
    };
    text.trim().to_string()
}

/// (a) Protocol wrappers such as `"role":"assistant","content":` or `text:`,
/// applied until none is left at the start.
pub(crate) fn strip_preamble(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let stripped = PROTOCOL_PREAMBLE.replace(&current, "");
        let stripped = KEY_PREFIX.replace(&stripped, "").into_owned();
        if stripped == current {
            return current;
        }
        current = stripped;
    }
}

/// (b) A payload that is entirely JSON: an object yields its `message`,
/// `content` or `text` string field, a string literal yields its value.
pub(crate) fn structured_value(text: &str) -> Option<String> {
    match serde_json::from_str::<serde_json::Value>(text.trim()).ok()? {
        serde_json::Value::Object(map) => ["message", "content", "text"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()).map(str::to_string)),
        serde_json::Value::String(s) => Some(s),
        _ => None,
    }
}

/// (c) Trailing `,` `}` `]` runs, and a trailing quote left without a partner.
pub(crate) fn strip_trailing_artifacts(text: &str) -> String {
    let mut out = TRAILING_CLOSERS.replace(text, "").into_owned();
    if out.ends_with('"') && out.matches('"').count() % 2 == 1 {
        out.pop();
    }
    out
}

/// (d) Leading `{` `[` runs, and a leading quote left without a partner.
pub(crate) fn strip_leading_artifacts(text: &str) -> String {
    let out = LEADING_OPENERS.replace(text, "");
    if out.starts_with('"') && out.matches('"').count() % 2 == 1 {
        out[1..].to_string()
    } else {
        out.into_owned()
    }
}

/// (e) Everything before the first character of `script`. Text without any
/// such character is left alone.
pub(crate) fn strip_foreign_prefix(text: &str, script: TargetScript) -> String {
    match text.char_indices().find(|(_, c)| script.contains(*c)) {
        Some((idx, _)) => text[idx..].to_string(),
        None => text.to_string(),
    }
}
