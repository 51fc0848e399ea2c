use serde::{Deserialize, Serialize};

pub const COMPLETE_THRESHOLD: f64 = 95.0;
pub const EXPANSION_THRESHOLD: f64 = 90.0;
pub const OVER_THRESHOLD: f64 = 105.0;

/// Counts whitespace-separated words.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// A word budget paired with the measured length of the text it governs.
///
/// Values of this type are always derived from content on demand; nothing in
/// the manuscript stores an `actual` count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WordCountTarget {
    pub target: usize,
    pub actual: usize,
}

impl WordCountTarget {
    pub fn new(target: usize, actual: usize) -> Self {
        Self { target, actual }
    }

    pub fn measure(target: usize, text: &str) -> Self {
        Self::new(target, count_words(text))
    }

    /// Percentage of the target reached. A zero target counts as fully met.
    pub fn completion(&self) -> f64 {
        if self.target == 0 {
            return 100.0;
        }
        self.actual as f64 / self.target as f64 * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.completion() >= COMPLETE_THRESHOLD
    }

    pub fn needs_expansion(&self) -> bool {
        self.completion() < EXPANSION_THRESHOLD
    }

    pub fn is_over(&self) -> bool {
        self.completion() > OVER_THRESHOLD
    }

    pub fn remaining(&self) -> usize {
        self.target.saturating_sub(self.actual)
    }
}

impl std::ops::Add for WordCountTarget {
    type Output = WordCountTarget;

    fn add(self, rhs: Self) -> Self::Output {
        WordCountTarget {
            target: self.target + rhs.target,
            actual: self.actual + rhs.actual,
        }
    }
}

impl std::iter::Sum for WordCountTarget {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(WordCountTarget::default(), |acc, next| acc + next)
    }
}

/// Returns the last `n` words of `text`, joined by single spaces.
pub fn tail_words(text: &str, n: usize) -> String {
    let words = text.split_whitespace().collect::<Vec<_>>();
    let start = words.len().saturating_sub(n);
    words[start..].join(" ")
}

/// Returns the first `n` words of `text`, joined by single spaces.
pub fn head_words(text: &str, n: usize) -> String {
    text.split_whitespace()
        .take(n)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_is_ratio_of_actual_to_target() {
        let cases = [(1500, 750, 50.0), (1000, 1000, 100.0), (200, 300, 150.0)];
        for (target, actual, expected) in cases {
            let wc = WordCountTarget::new(target, actual);
            assert!(
                (wc.completion() - expected).abs() < f64::EPSILON,
                "target={target} actual={actual}"
            );
        }
    }

    #[test]
    fn zero_target_counts_as_complete() {
        let wc = WordCountTarget::new(0, 0);
        assert_eq!(wc.completion(), 100.0);
        assert!(wc.is_complete());
        assert!(!wc.needs_expansion());
        assert!(!wc.is_over());

        let wc = WordCountTarget::new(0, 40);
        assert_eq!(wc.completion(), 100.0);
    }

    #[test]
    fn thresholds_follow_completion_bands() {
        // 94% is neither complete nor in need of expansion.
        let wc = WordCountTarget::new(100, 94);
        assert!(!wc.is_complete());
        assert!(!wc.needs_expansion());

        let wc = WordCountTarget::new(100, 95);
        assert!(wc.is_complete());

        let wc = WordCountTarget::new(100, 89);
        assert!(wc.needs_expansion());

        let wc = WordCountTarget::new(100, 90);
        assert!(!wc.needs_expansion());

        let wc = WordCountTarget::new(100, 105);
        assert!(!wc.is_over());
        let wc = WordCountTarget::new(100, 106);
        assert!(wc.is_over());
    }

    #[test]
    fn remaining_saturates_at_zero() {
        assert_eq!(WordCountTarget::new(1500, 500).remaining(), 1000);
        assert_eq!(WordCountTarget::new(1500, 1600).remaining(), 0);
    }

    #[test]
    fn count_words_ignores_extra_whitespace() {
        assert_eq!(count_words("  one two\n\nthree\tfour  "), 4);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn head_and_tail_words_slice_text() {
        let text = "a b c d e f";
        assert_eq!(head_words(text, 2), "a b");
        assert_eq!(tail_words(text, 2), "e f");
        assert_eq!(tail_words(text, 10), "a b c d e f");
    }

    #[test]
    fn sum_adds_targets_and_actuals() {
        let total: WordCountTarget = [WordCountTarget::new(10, 5), WordCountTarget::new(20, 7)]
            .into_iter()
            .sum();
        assert_eq!(total, WordCountTarget::new(30, 12));
    }
}
