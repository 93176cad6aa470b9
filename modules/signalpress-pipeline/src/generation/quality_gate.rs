use std::collections::HashSet;

use signalpress_common::config::QualityConfig;
use signalpress_common::{mean, word_count};

use crate::traits::{Draft, SelectedItem, Synthesis};

#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Pass,
    /// Usable, but below target. The run continues and the reason is recorded.
    Degraded(String),
    /// Unusable. The run stops.
    Fail(String),
}

impl GateVerdict {
    fn from_reasons(reasons: Vec<String>) -> Self {
        if reasons.is_empty() {
            GateVerdict::Pass
        } else {
            GateVerdict::Degraded(reasons.join("; "))
        }
    }
}

/// Outcome of the writing gate plus the measurements it took.
#[derive(Debug, Clone, PartialEq)]
pub struct WritingCheck {
    pub verdict: GateVerdict,
    pub resolved_citations: u32,
    pub unresolved_citations: u32,
    pub word_count: u32,
}

/// Threshold checks at each generation step boundary.
#[derive(Debug, Clone)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn check_selection(&self, items: &[SelectedItem]) -> GateVerdict {
        if items.len() < self.config.min_selected_items {
            return GateVerdict::Fail(format!(
                "only {} items selected, need at least {}",
                items.len(),
                self.config.min_selected_items
            ));
        }
        let avg = mean(items.iter().map(|i| i.signal_strength)).unwrap_or(0.0);
        if avg < self.config.min_avg_signal_strength {
            return GateVerdict::Degraded(format!(
                "average signal strength {avg:.2} below {:.2}",
                self.config.min_avg_signal_strength
            ));
        }
        GateVerdict::Pass
    }

    pub fn check_synthesis(&self, synthesis: &Synthesis) -> GateVerdict {
        if synthesis.themes.is_empty() {
            return GateVerdict::Fail("synthesis produced no themes".to_string());
        }
        let coherence = synthesis.coherence;
        if coherence < self.config.coherence_floor {
            return GateVerdict::Fail(format!(
                "coherence {coherence:.2} below floor {:.2}",
                self.config.coherence_floor
            ));
        }
        if coherence < self.config.min_coherence {
            return GateVerdict::Degraded(format!(
                "coherence {coherence:.2} below {:.2}",
                self.config.min_coherence
            ));
        }
        GateVerdict::Pass
    }

    pub fn check_writing(&self, draft: &Draft, selected: &[SelectedItem]) -> WritingCheck {
        let known: HashSet<i64> = selected.iter().map(|i| i.item_id).collect();
        let resolved = draft
            .citations
            .iter()
            .filter(|c| known.contains(&c.item_id))
            .count() as u32;
        let unresolved = draft.citations.len() as u32 - resolved;
        let words = word_count(&draft.body);

        let verdict = if resolved < self.config.min_citations {
            GateVerdict::Fail(format!(
                "only {resolved} citations resolve to selected items, need at least {}",
                self.config.min_citations
            ))
        } else {
            let mut reasons = Vec::new();
            if unresolved > 0 {
                reasons.push(format!("{unresolved} citations do not resolve to selected items"));
            }
            if words < self.config.min_words || words > self.config.max_words {
                reasons.push(format!(
                    "word count {words} outside {}-{}",
                    self.config.min_words, self.config.max_words
                ));
            }
            GateVerdict::from_reasons(reasons)
        };

        WritingCheck {
            verdict,
            resolved_citations: resolved,
            unresolved_citations: unresolved,
            word_count: words,
        }
    }
}
