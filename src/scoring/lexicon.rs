use super::{Scorer, ScoringError, MAX_SCORE, MIN_SCORE};
use async_trait::async_trait;
use std::collections::HashSet;

const POSITIVE: &[&str] = &[
    "bullish", "moon", "gain", "gains", "great", "good", "love", "win", "winning", "up",
    "rally", "strong", "profit", "happy", "excited", "amazing", "soaring", "hodl",
];

const NEGATIVE: &[&str] = &[
    "bearish", "crash", "loss", "losses", "bad", "hate", "lose", "down", "dump", "weak",
    "scam", "fear", "sad", "terrible", "falling", "panic", "rekt", "worried",
];

/// Local word-counting scorer for offline runs.
///
/// Each positive word adds `weight`, each negative word subtracts it, and the
/// total is clamped to the score range.
#[derive(Debug, Clone)]
pub struct LexiconScorer {
    positive: HashSet<&'static str>,
    negative: HashSet<&'static str>,
    weight: f64,
}

impl Default for LexiconScorer {
    fn default() -> Self {
        Self {
            positive: POSITIVE.iter().copied().collect(),
            negative: NEGATIVE.iter().copied().collect(),
            weight: 2.5,
        }
    }
}

impl LexiconScorer {
    pub fn score_text(&self, text: &str) -> f64 {
        let total: f64 = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| {
                let w = w.to_lowercase();
                if self.positive.contains(w.as_str()) {
                    self.weight
                } else if self.negative.contains(w.as_str()) {
                    -self.weight
                } else {
                    0.0
                }
            })
            .sum();
        total.clamp(MIN_SCORE, MAX_SCORE)
    }
}

#[async_trait]
impl Scorer for LexiconScorer {
    async fn score(&self, text: &str) -> Result<f64, ScoringError> {
        Ok(self.score_text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_words() {
        let scorer = LexiconScorer::default();
        assert_eq!(scorer.score_text("Bitcoin to the MOON, so bullish!"), 5.0);
        assert_eq!(scorer.score_text("crash incoming"), -2.5);
        assert_eq!(scorer.score_text("gains then losses"), 0.0);
        assert_eq!(scorer.score_text("nothing to see here"), 0.0);
    }

    #[test]
    fn test_clamped_to_range() {
        let scorer = LexiconScorer::default();
        assert_eq!(scorer.score_text("good good good good good good"), MAX_SCORE);
        assert_eq!(scorer.score_text("rekt rekt rekt rekt rekt rekt"), MIN_SCORE);
    }
}
