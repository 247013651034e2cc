//! Average-precision metrics for multi-label evaluation.
//!
//! Scores are ranked per class with a small deterministic tie-break
//! (see [`tie_break`]) and integrated with the standard step
//! precision-recall integral. Entries carrying the ignore label are
//! excluded before ranking.

use serde::{Deserialize, Serialize};

use crate::IGNORE_LABEL;

/// Epsilon subtracted from positive scores before ranking.
pub const TIE_BREAK_EPS: f32 = 1e-5;

/// Deterministic tie-break comparator input.
///
/// Lowers a positive example's score by `TIE_BREAK_EPS` so that a
/// positive tied with a negative at the same raw score ranks below it,
/// yielding a conservative AP under ties.
pub fn tie_break(score: f32, label: u8) -> f32 {
    score - TIE_BREAK_EPS * f32::from(label)
}

/// Computes average precision over a ranked list of adjusted scores.
///
/// Labels must be 0 or 1; callers filter ignore entries and apply the
/// tie-break beforehand. Tied adjusted scores are grouped, so the
/// integral is evaluated once per distinct threshold. Returns 0.0 when
/// the list contains no positives.
pub fn average_precision(labels: &[u8], adjusted_scores: &[f32]) -> f64 {
    debug_assert_eq!(labels.len(), adjusted_scores.len());

    let num_pos = labels.iter().filter(|&&l| l == 1).count();
    if num_pos == 0 {
        return 0.0;
    }

    let mut order: Vec<usize> = (0..labels.len()).collect();
    order.sort_by(|&a, &b| {
        adjusted_scores[b]
            .partial_cmp(&adjusted_scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ap = 0.0;
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut prev_recall = 0.0;

    for (rank, &idx) in order.iter().enumerate() {
        if labels[idx] == 1 {
            tp += 1;
        } else {
            fp += 1;
        }

        // Close the group at the last entry of each distinct threshold.
        let next = order.get(rank + 1);
        let boundary = match next {
            Some(&n) => adjusted_scores[n] != adjusted_scores[idx],
            None => true,
        };
        if boundary {
            let precision = tp as f64 / (tp + fp) as f64;
            let recall = tp as f64 / num_pos as f64;
            ap += (recall - prev_recall) * precision;
            prev_recall = recall;
        }
    }

    ap
}

/// Computes one class's AP from raw accumulated scores and ground truth.
///
/// Drops entries whose label is the ignore sentinel, applies the
/// tie-break adjustment, then integrates.
pub fn class_average_precision(labels: &[u8], scores: &[f32]) -> f64 {
    debug_assert_eq!(labels.len(), scores.len());

    let mut kept_labels = Vec::with_capacity(labels.len());
    let mut kept_scores = Vec::with_capacity(scores.len());
    for (&label, &score) in labels.iter().zip(scores.iter()) {
        if label != IGNORE_LABEL {
            kept_labels.push(label);
            kept_scores.push(tie_break(score, label));
        }
    }

    average_precision(&kept_labels, &kept_scores)
}

/// Per-class APs and their mean for one evaluation combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApReport {
    /// AP per class, in class order
    pub per_class: Vec<f64>,
    /// Arithmetic mean over classes
    pub mean: f64,
}

impl ApReport {
    /// Builds a report from per-class APs.
    pub fn from_per_class(per_class: Vec<f64>) -> Self {
        let mean = if per_class.is_empty() {
            0.0
        } else {
            per_class.iter().sum::<f64>() / per_class.len() as f64
        };
        Self { per_class, mean }
    }

    /// Formats the report as one output line: the mean followed by each
    /// per-class AP to two decimal places, space-separated.
    pub fn summary_line(&self) -> String {
        let per_class = self
            .per_class
            .iter()
            .map(|ap| format!("{ap:.2}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!("{}  {}", self.mean, per_class)
    }
}
