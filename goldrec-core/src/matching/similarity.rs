//! Pluggable string comparison used by the fuzzy and relational tiers.

use super::normalize::normalize_name;

/// Scores how alike two strings are, from 0.0 (unrelated) to 1.0 (same).
pub trait Similarity: Send + Sync {
    /// Similarity of `a` and `b` in [0.0, 1.0].
    fn similarity(&self, a: &str, b: &str) -> f64;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Jaro-Winkler over normalized person names.
#[derive(Debug, Clone, Copy, Default)]
pub struct JaroWinklerNames;

impl Similarity for JaroWinklerNames {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a = normalize_name(a);
        let b = normalize_name(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        strsim::jaro_winkler(&a, &b)
    }

    fn name(&self) -> &'static str {
        "jaro_winkler"
    }
}

/// Normalized Levenshtein over normalized names.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevenshteinNames;

impl Similarity for LevenshteinNames {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a = normalize_name(a);
        let b = normalize_name(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        strsim::normalized_levenshtein(&a, &b)
    }

    fn name(&self) -> &'static str {
        "levenshtein"
    }
}

/// Phonetic equality: 1.0 when both strings share a Soundex code.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoundexEquality;

impl Similarity for SoundexEquality {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        match (soundex(a), soundex(b)) {
            (Some(a), Some(b)) if a == b => 1.0,
            _ => 0.0,
        }
    }

    fn name(&self) -> &'static str {
        "soundex"
    }
}

/// American Soundex code (letter + three digits), or `None` when the input
/// has no ASCII letters.
pub fn soundex(word: &str) -> Option<String> {
    let letters: Vec<char> = word
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let first = *letters.first()?;

    let mut code = String::with_capacity(4);
    code.push(first);
    let mut previous = soundex_digit(first);

    for &c in &letters[1..] {
        match soundex_digit(c) {
            Some(digit) if Some(digit) != previous => {
                code.push(digit);
                if code.len() == 4 {
                    break;
                }
                previous = Some(digit);
            }
            Some(_) => {}
            // H and W do not separate equal codes; vowels do
            None if matches!(c, 'H' | 'W') => {}
            None => previous = None,
        }
    }

    while code.len() < 4 {
        code.push('0');
    }
    Some(code)
}

fn soundex_digit(c: char) -> Option<char> {
    match c {
        'B' | 'F' | 'P' | 'V' => Some('1'),
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
        'D' | 'T' => Some('3'),
        'L' => Some('4'),
        'M' | 'N' => Some('5'),
        'R' => Some('6'),
        _ => None,
    }
}
