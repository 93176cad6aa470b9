use serde::{Deserialize, Serialize};

/// Quality measurements attached to a generation run and its newsletter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Overall quality score (0.0-1.0). The alert evaluator averages this.
    pub confidence: f64,
    /// Mean signal strength of the selected items (0.0-1.0)
    pub signal_strength: f64,
    /// Citations that resolve to a selected item
    pub citation_count: u32,
    pub word_count: u32,
}

/// Words in a newsletter body, split on whitespace.
pub fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Arithmetic mean, `None` for an empty input.
pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .fold((0.0_f64, 0_u32), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}
