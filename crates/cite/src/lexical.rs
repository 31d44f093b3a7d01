//! Overlap-based support checks. Every span returned here is a byte range of
//! the chunk text, so slicing it yields an exact substring.

use extract::normalizer::parse_number;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::LazyLock;

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+(?:\.[0-9]+)?").expect("valid word regex"));

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d*\.?\d+").expect("valid number regex"));

/// Share of value tokens that must appear in a sentence for text support.
pub const TOKEN_OVERLAP: f32 = 0.6;

/// Sentence spans, trimmed. A period only ends a sentence when followed by
/// whitespace or the end of text, so decimals stay intact.
pub fn sentences(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => Some(i),
            '.' | '!' | '?' => match chars.peek() {
                None => Some(i + c.len_utf8()),
                Some((_, next)) if next.is_whitespace() => Some(i + c.len_utf8()),
                _ => None,
            },
            _ => None,
        };
        if let Some(end) = boundary {
            push_trimmed(text, start..end, &mut spans);
            start = end;
        }
    }
    push_trimmed(text, start..text.len(), &mut spans);
    spans
}

fn push_trimmed(text: &str, range: Range<usize>, spans: &mut Vec<Range<usize>>) {
    let slice = &text[range.clone()];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead + trail < slice.len() {
        spans.push(range.start + lead..range.end - trail);
    }
}

fn words(text: &str) -> HashSet<String> {
    WORD.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

fn numbers_in(sentence: &str) -> Vec<f64> {
    let mut found: Vec<f64> = NUMBER
        .find_iter(sentence)
        .filter_map(|m| m.as_str().replace(',', "").parse().ok())
        .collect();
    // Picks up forms like "10<sup>4</sup>" and "5 x 10^3"
    if let Some(v) = parse_number(sentence) {
        found.push(v);
    }
    found
}

fn numbers_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-6_f64.max(a.abs().max(b.abs()) * 1e-6)
}

/// Does `sentence` support `value`?
pub fn sentence_supports(value: &Value, sentence: &str) -> bool {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(target) => numbers_in(sentence).into_iter().any(|v| numbers_match(v, target)),
            None => false,
        },
        Value::String(s) => text_supports(s, sentence),
        Value::Bool(_) | Value::Null => false,
        other => text_supports(&other.to_string(), sentence),
    }
}

/// `needle` occurs in `haystack` with no letter or digit on either side, so
/// "Pt" does not match inside "adopted".
fn contains_phrase(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(i, m)| {
        let before = haystack[..i].chars().next_back();
        let after = haystack[i + m.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn text_supports(value: &str, sentence: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return false;
    }
    if contains_phrase(&sentence.to_lowercase(), &value.to_lowercase()) {
        return true;
    }
    let value_words = words(value);
    if value_words.is_empty() {
        return false;
    }
    let sentence_words = words(sentence);
    let hits = value_words.iter().filter(|w| sentence_words.contains(*w)).count();
    hits as f32 / value_words.len() as f32 >= TOKEN_OVERLAP
}

/// First sentence of `text` that supports `value`.
pub fn supporting_span(value: &Value, text: &str) -> Option<Range<usize>> {
    sentences(text)
        .into_iter()
        .find(|span| sentence_supports(value, &text[span.clone()]))
}

/// The sentence sharing the most words with `values`; used when an outside
/// judge vouches for a chunk but no sentence matches lexically.
pub fn best_overlap_span(values: &[&Value], text: &str) -> Option<Range<usize>> {
    let wanted: HashSet<String> = values
        .iter()
        .flat_map(|v| match v {
            Value::String(s) => words(s),
            other => words(&other.to_string()),
        })
        .collect();

    let spans = sentences(text);
    let mut best: Option<(usize, Range<usize>)> = None;
    for span in spans {
        let overlap = words(&text[span.clone()]).intersection(&wanted).count();
        if best.as_ref().is_none_or(|(b, _)| overlap > *b) {
            best = Some((overlap, span));
        }
    }
    best.map(|(_, span)| span)
}
