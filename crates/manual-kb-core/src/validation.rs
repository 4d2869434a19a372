//! Grounding checks for generated content.
//!
//! Everything here is pure: no I/O, no errors. A keyword or sentence is
//! grounded when its normalized form (lowercased, whitespace runs collapsed)
//! appears verbatim inside the normalized source text.

use serde::Serialize;

use crate::models::ManualContent;

const TERMINATORS: [char; 4] = ['.', '!', '?', '。'];

/// Result of one grounding check. `ok` is true iff `missing` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub missing: Vec<String>,
}

impl ValidationOutcome {
    fn from_missing(missing: Vec<String>) -> Self {
        Self {
            ok: missing.is_empty(),
            missing,
        }
    }
}

/// Lowercase and collapse every whitespace run to a single space.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Check that every keyword occurs in the source. Blank keywords are ignored.
pub fn validate_keywords_in_source<S: AsRef<str>>(
    keywords: &[S],
    source_text: &str,
) -> ValidationOutcome {
    let source = normalize(source_text);
    let missing = keywords
        .iter()
        .map(|k| k.as_ref())
        .filter(|k| {
            let needle = normalize(k);
            !needle.is_empty() && !source.contains(&needle)
        })
        .map(|k| k.trim().to_string())
        .collect();
    ValidationOutcome::from_missing(missing)
}

/// Check that every sentence of `generated_text` occurs in the source.
///
/// Missing sentences are reported as they appear in the generated text,
/// without their terminator.
pub fn validate_sentences_subset_of_source(
    generated_text: &str,
    source_text: &str,
) -> ValidationOutcome {
    let source = normalize(source_text);
    let missing = split_sentences(generated_text)
        .into_iter()
        .filter(|s| !source.contains(&normalize(s)))
        .map(str::to_string)
        .collect();
    ValidationOutcome::from_missing(missing)
}

/// Split on `.`, `!`, `?`, `。`, and line breaks.
///
/// A period between two digits (`1.5`, `v2.0`) does not end a sentence.
/// Returned slices are trimmed and exclude terminators; blank sentences are
/// dropped.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;
    let mut chars = text.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        let boundary = match ch {
            '\n' | '!' | '?' | '。' => true,
            '.' => {
                let decimal = prev.is_some_and(|p| p.is_ascii_digit())
                    && chars.peek().is_some_and(|(_, next)| next.is_ascii_digit());
                !decimal
            }
            _ => false,
        };
        if boundary {
            push_sentence(&mut sentences, &text[start..i]);
            start = i + ch.len_utf8();
        }
        prev = Some(ch);
    }
    push_sentence(&mut sentences, &text[start..]);
    sentences
}

fn push_sentence<'a>(out: &mut Vec<&'a str>, raw: &'a str) {
    let s = raw.trim().trim_end_matches(|c: char| TERMINATORS.contains(&c)).trim();
    if !s.is_empty() {
        out.push(s);
    }
}

/// Grounding results for the three checked fields of a generated draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroundingReport {
    pub keywords: ValidationOutcome,
    pub background: ValidationOutcome,
    pub guideline: ValidationOutcome,
}

impl GroundingReport {
    pub fn check(content: &ManualContent, source_text: &str) -> Self {
        Self {
            keywords: validate_keywords_in_source(&content.keywords, source_text),
            background: validate_sentences_subset_of_source(&content.background, source_text),
            guideline: validate_sentences_subset_of_source(&content.guideline, source_text),
        }
    }

    pub fn is_grounded(&self) -> bool {
        self.keywords.ok && self.background.ok && self.guideline.ok
    }

    /// Human-readable findings, one per ungrounded item.
    pub fn findings(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.extend(
            self.keywords
                .missing
                .iter()
                .map(|k| format!("keyword not in source: {}", k)),
        );
        out.extend(
            self.background
                .missing
                .iter()
                .map(|s| format!("background sentence not in source: {}", s)),
        );
        out.extend(
            self.guideline
                .missing
                .iter()
                .map(|s| format!("guideline sentence not in source: {}", s)),
        );
        out
    }
}
