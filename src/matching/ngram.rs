// src/matching/ngram.rs
use std::collections::HashMap;

/// Overlapping character n-grams of `text`, in order.
///
/// Text shorter than `n` is returned whole as a single gram. Empty text and
/// `n == 0` produce nothing.
pub fn ngrams(text: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || n == 0 {
        return Vec::new();
    }
    if chars.len() < n {
        return vec![text.to_string()];
    }
    chars.windows(n).map(|w| w.iter().collect()).collect()
}

/// Whitespace separated word tokens.
pub fn word_tokens(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

pub fn frequencies<I: IntoIterator<Item = String>>(tokens: I) -> HashMap<String, f64> {
    let mut freq = HashMap::new();
    for token in tokens {
        *freq.entry(token).or_insert(0.0) += 1.0;
    }
    freq
}

/// Cosine similarity of two frequency vectors; 0.0 when either is empty.
pub fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .iter()
        .filter_map(|(token, x)| large.get(token).map(|y| x * y))
        .sum();
    let mag_a: f64 = a.values().map(|x| x * x).sum();
    let mag_b: f64 = b.values().map(|x| x * x).sum();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b).sqrt()).clamp(0.0, 1.0)
}

/// N-gram frequency cosine similarity of two strings, symmetric and in [0, 1].
pub fn similarity(a: &str, b: &str, n: usize) -> f64 {
    cosine(&frequencies(ngrams(a, n)), &frequencies(ngrams(b, n)))
}
