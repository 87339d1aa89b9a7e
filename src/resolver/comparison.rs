//! String similarity helpers used to match provider titles
//!
//! Sorensen-Dice is used for manga searches, Levenshtein for online streams
//! where provider titles are short and close to the query.

use std::collections::HashMap;

/// Best candidate found by a comparison
#[derive(Debug, Clone, PartialEq)]
pub struct SorensenDiceResult {
    pub original_value: String,
    pub value: String,
    pub rating: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevenshteinResult {
    pub original_value: String,
    pub value: String,
    pub distance: usize,
}

/// Lowercase, strip punctuation and collapse whitespace.
pub fn normalize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(|c| c.to_lowercase())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn bigrams(s: &str) -> HashMap<(char, char), usize> {
    let chars: Vec<char> = s.chars().collect();
    let mut counts = HashMap::new();
    for pair in chars.windows(2) {
        *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    counts
}

/// Sorensen-Dice coefficient over character bigrams of the normalized strings.
///
/// Repeated bigrams count once per occurrence.
pub fn sorensen_dice(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);

    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a == b {
        return 1.0;
    }
    if a.chars().count() < 2 || b.chars().count() < 2 {
        return 0.0;
    }

    let a_grams = bigrams(&a);
    let mut b_grams = bigrams(&b);
    let a_total: usize = a_grams.values().sum();
    let b_total: usize = b_grams.values().sum();

    let mut intersection = 0;
    for (gram, count) in a_grams {
        if let Some(other) = b_grams.get_mut(&gram) {
            let shared = count.min(*other);
            intersection += shared;
            *other -= shared;
        }
    }

    (2 * intersection) as f64 / (a_total + b_total) as f64
}

/// Case-insensitive edit distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Find the candidate with the highest Sorensen-Dice rating against `value`.
pub fn find_best_match_with_sorensen_dice<S: AsRef<str>>(
    value: &str,
    candidates: &[S],
) -> Option<SorensenDiceResult> {
    let mut best: Option<SorensenDiceResult> = None;
    for candidate in candidates {
        let candidate = candidate.as_ref();
        let rating = sorensen_dice(value, candidate);
        if best.as_ref().map_or(true, |b| rating > b.rating) {
            best = Some(SorensenDiceResult {
                original_value: candidate.to_string(),
                value: value.to_string(),
                rating,
            });
        }
    }
    best
}

/// Find the candidate with the lowest Levenshtein distance to `value`.
pub fn find_best_match_with_levenshtein<S: AsRef<str>>(
    value: &str,
    candidates: &[S],
) -> Option<LevenshteinResult> {
    let mut best: Option<LevenshteinResult> = None;
    for candidate in candidates {
        let candidate = candidate.as_ref();
        let distance = levenshtein(value, candidate);
        if best.as_ref().map_or(true, |b| distance < b.distance) {
            best = Some(LevenshteinResult {
                original_value: candidate.to_string(),
                value: value.to_string(),
                distance,
            });
        }
    }
    best
}

fn is_latin(c: char) -> bool {
    c.is_ascii() || matches!(c, '\u{00C0}'..='\u{024F}' | '\u{1E00}'..='\u{1EFF}')
}

/// Whether the majority of non-whitespace characters are Latin.
pub fn is_mostly_latin(s: &str) -> bool {
    let mut total = 0;
    let mut latin = 0;
    for c in s.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        if is_latin(c) {
            latin += 1;
        }
    }
    total > 0 && latin * 2 > total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  One-Punch   Man! "), "one punch man");
        assert_eq!(normalize("Re:Zero"), "re zero");
    }

    #[test]
    fn test_sorensen_dice() {
        assert_eq!(sorensen_dice("Night", "night"), 1.0);
        assert_eq!(sorensen_dice("abc", "xyz"), 0.0);

        // "night" -> ni ig gh ht, "nacht" -> na ac ch ht
        let score = sorensen_dice("night", "nacht");
        assert!((score - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sorensen_dice_counts_repeated_bigrams() {
        // "aaaa" -> aa x3, "aa" -> aa x1: 2 * 1 / (3 + 1)
        let score = sorensen_dice("aaaa", "aa");
        assert!((score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("Naruto", "naruto"), 0);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn test_best_match() {
        let candidates = ["Boku no Hero Academia", "One Piece", "One Punch Man"];

        let best = find_best_match_with_sorensen_dice("one piece", &candidates);
        assert!(best.is_some());
        let best = best.unwrap();
        assert_eq!(best.original_value, "One Piece");
        assert_eq!(best.rating, 1.0);

        let best = find_best_match_with_levenshtein("One Punch-Man", &candidates).unwrap();
        assert_eq!(best.original_value, "One Punch Man");
        assert_eq!(best.distance, 1);
    }

    #[test]
    fn test_is_mostly_latin() {
        assert!(is_mostly_latin("Shingeki no Kyojin"));
        assert!(is_mostly_latin("Pokémon"));
        assert!(!is_mostly_latin("進撃の巨人"));
        assert!(!is_mostly_latin(""));
    }
}
