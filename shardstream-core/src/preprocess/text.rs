//! Text normalisation helpers shared by the preprocessors

use regex::Regex;
use std::sync::LazyLock;

use super::tokenizer::{END_OF_CHUNK, IMAGE_MARKER};

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));
static PUNCTUATION_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\W+$").expect("static regex"));

/// Words that end in a period without ending a sentence
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "inc", "ltd", "co", "corp",
    "no", "fig", "vol", "al", "e.g", "i.e", "u.s", "jan", "feb", "mar", "apr", "jun", "jul",
    "aug", "sep", "sept", "oct", "nov", "dec",
];

/// Collapse every whitespace run to a single space
pub fn normalize_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").into_owned()
}

/// True when `text` is non-empty and has no word characters
pub fn is_punctuation_only(text: &str) -> bool {
    PUNCTUATION_ONLY.is_match(text)
}

/// Split prose into trimmed sentences.
///
/// A sentence ends at `.`, `!` or `?` (plus any closing quotes or brackets)
/// followed by whitespace, unless the period closes a known abbreviation or a
/// single-letter initial, or the next word starts in lower case.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        let (_, ch) = chars[i];
        if !matches!(ch, '.' | '!' | '?') {
            i += 1;
            continue;
        }

        let mut end = i + 1;
        while end < chars.len() && is_sentence_closer(chars[end].1) {
            end += 1;
        }
        let followed_by_space = end < chars.len() && chars[end].1.is_whitespace();
        if !followed_by_space {
            i = end;
            continue;
        }

        let next_word = chars[end..].iter().map(|&(_, c)| c).find(|c| !c.is_whitespace());
        let continues_lower = next_word.is_some_and(|c| c.is_lowercase());
        if (ch == '.' && is_abbreviation(&text[start..chars[i].0])) || continues_lower {
            i = end;
            continue;
        }

        let byte_end = chars[end].0;
        push_trimmed(&mut sentences, &text[start..byte_end]);
        start = byte_end;
        i = end;
    }

    push_trimmed(&mut sentences, &text[start..]);
    sentences
}

fn is_sentence_closer(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '"' | '\'' | ')' | ']' | '\u{201D}' | '\u{2019}')
}

fn push_trimmed(out: &mut Vec<String>, sentence: &str) {
    let trimmed = sentence.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn is_abbreviation(before_period: &str) -> bool {
    let word = before_period
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or("")
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    let single_letter = word.chars().count() == 1 && word.chars().all(char::is_alphabetic);
    single_letter || ABBREVIATIONS.contains(&word.as_str())
}

/// Join segments and tidy the markers around them.
///
/// The leading end-of-chunk marker is dropped, spaces next to markers are
/// removed, and an end-of-chunk plus `eos` is appended.
pub fn assemble_marked_text(segments: &[String], eos: &str) -> String {
    let joined = segments.join(" ");
    let text = joined
        .replacen(END_OF_CHUNK, "", 1)
        .replace(&format!(" {}", END_OF_CHUNK), END_OF_CHUNK)
        .replace(&format!("{} ", IMAGE_MARKER), IMAGE_MARKER)
        .replace(&format!(" {}", IMAGE_MARKER), IMAGE_MARKER);
    format!("{}{}{}", text, END_OF_CHUNK, eos)
}

/// Marker placed before each image or masked span
pub fn chunk_image_marker() -> String {
    format!("{}{}", END_OF_CHUNK, IMAGE_MARKER)
}
