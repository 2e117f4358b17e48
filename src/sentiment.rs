use anyhow::Result;
use once_cell::sync::Lazy;
use std::collections::HashMap;

static LEXICON: Lazy<HashMap<String, f64>> = Lazy::new(|| {
    let raw = include_str!("../sentiment_lexicon.json");
    // Compile-time asset; a parse failure degrades to an empty lexicon (all neutral).
    serde_json::from_str::<HashMap<String, f64>>(raw).unwrap_or_else(|e| {
        tracing::error!(error = %e, "sentiment lexicon is not valid JSON");
        HashMap::new()
    })
});

/// Pure `text -> polarity` capability. Implementations return a value in
/// [-1.0, 1.0]; an `Err` is mapped to a neutral score by the caller.
pub trait PolarityScorer: Send + Sync {
    fn polarity(&self, text: &str) -> Result<f64>;
}

/// Lexicon scorer: mean valence of the sentiment-bearing tokens.
#[derive(Debug, Clone, Default)]
pub struct LexiconScorer;

impl LexiconScorer {
    pub fn new() -> Self {
        Self
    }

    #[inline]
    fn word_valence(&self, w: &str) -> Option<f64> {
        LEXICON.get(w).copied()
    }

    /// Returns (polarity, number of scored tokens).
    /// Negation: a negator within the previous 1..=3 tokens flips the sign
    /// of the word's valence and halves it.
    pub fn score_text(&self, text: &str) -> (f64, usize) {
        let tokens: Vec<String> = tokenize(text).collect();
        let mut sum = 0.0f64;
        let mut hits = 0usize;

        for i in 0..tokens.len() {
            let Some(base) = self.word_valence(tokens[i].as_str()) else {
                continue;
            };
            let negated = (1..=3).any(|k| i >= k && is_negator(tokens[i - k].as_str()));
            sum += if negated { -0.5 * base } else { base };
            hits += 1;
        }

        if hits == 0 {
            return (0.0, 0);
        }
        let mean = (sum / hits as f64).clamp(-1.0, 1.0);
        (round4(mean), hits)
    }
}

impl PolarityScorer for LexiconScorer {
    fn polarity(&self, text: &str) -> Result<f64> {
        Ok(self.score_text(text).0)
    }
}

/// Round to 4 decimals; folds -0.0 into 0.0.
pub fn round4(x: f64) -> f64 {
    let r = (x * 10_000.0).round() / 10_000.0;
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

/// Alphanumeric tokens, lower-case.
fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

// Apostrophes are stripped during normalization, hence "isnt"/"dont".
fn is_negator(tok: &str) -> bool {
    matches!(
        tok,
        "not"
            | "no"
            | "never"
            | "isnt"
            | "wasnt"
            | "arent"
            | "wont"
            | "cant"
            | "cannot"
            | "dont"
            | "doesnt"
            | "didnt"
            | "without"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_text_scores_zero() {
        let s = LexiconScorer::new();
        assert_eq!(s.score_text("the cat sat on a mat"), (0.0, 0));
        assert_eq!(s.score_text(""), (0.0, 0));
    }

    #[test]
    fn positive_and_negative_words() {
        let s = LexiconScorer::new();
        assert!(s.polarity("what a great day").unwrap() > 0.0);
        assert!(s.polarity("this is terrible news").unwrap() < 0.0);
    }

    #[test]
    fn negation_flips_sign() {
        let s = LexiconScorer::new();
        let pos = s.polarity("good").unwrap();
        let neg = s.polarity("not good").unwrap();
        assert!(pos > 0.0);
        assert!(neg < 0.0);
    }

    #[test]
    fn result_is_bounded_and_rounded() {
        let s = LexiconScorer::new();
        let p = s.polarity("excellent amazing wonderful best").unwrap();
        assert!((-1.0..=1.0).contains(&p));
        assert_eq!(p, round4(p));
    }
}
