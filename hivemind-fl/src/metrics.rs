//! Training convergence and coordinator statistics
//!
//! Tracks per-model accuracy over completed rounds and summarises the
//! coordinator state for hosts and dashboards.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use hivemind_common::ModelType;

use crate::round::{RoundRecord, RoundStatus};

/// Convergence detector over a moving window of accuracy values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceDetector {
    /// Window size for the moving average
    window_size: usize,
    /// Recent accuracy values
    history: VecDeque<f64>,
    /// Convergence threshold (relative change)
    threshold: f64,
}

impl ConvergenceDetector {
    /// Creates a new convergence detector
    pub fn new(window_size: usize, threshold: f64) -> Self {
        let window_size = window_size.max(2);
        Self {
            window_size,
            history: VecDeque::with_capacity(window_size),
            threshold,
        }
    }

    /// Records the accuracy after a round
    pub fn record(&mut self, accuracy: f64) {
        if self.history.len() >= self.window_size {
            self.history.pop_front();
        }
        self.history.push_back(accuracy);
    }

    /// Converged when the two halves of a full window differ by less than
    /// the threshold, relative to the older half
    pub fn has_converged(&self) -> bool {
        if self.history.len() < self.window_size {
            return false;
        }
        let half = self.window_size / 2;
        let older = self.history.iter().take(half).sum::<f64>() / half as f64;
        let newer = self.history.iter().skip(half).sum::<f64>() / (self.window_size - half) as f64;
        if older == 0.0 {
            return false;
        }
        ((newer - older) / older).abs() < self.threshold
    }

    /// Current moving average
    pub fn moving_average(&self) -> Option<f64> {
        if self.history.is_empty() {
            None
        } else {
            Some(self.history.iter().sum::<f64>() / self.history.len() as f64)
        }
    }
}

impl Default for ConvergenceDetector {
    fn default() -> Self {
        Self::new(10, 0.01)
    }
}

/// Direction of a model's accuracy over recent rounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccuracyTrend {
    Improving,
    Stable,
    Degrading,
    /// Fewer than two completed rounds
    Unknown,
}

impl AccuracyTrend {
    /// Trend over the last ten completed rounds of `history`
    pub fn from_history(history: &[RoundRecord]) -> Self {
        let accuracies: Vec<f64> = history
            .iter()
            .filter(|r| r.status == RoundStatus::Completed)
            .filter_map(|r| r.accuracy_after)
            .collect();
        if accuracies.len() < 2 {
            return AccuracyTrend::Unknown;
        }

        let recent = &accuracies[accuracies.len().saturating_sub(10)..];
        let half = recent.len() / 2;
        let first = recent[..half].iter().sum::<f64>() / half as f64;
        let second = recent[half..].iter().sum::<f64>() / (recent.len() - half) as f64;

        if second > first * 1.05 {
            AccuracyTrend::Improving
        } else if second < first * 0.95 {
            AccuracyTrend::Degrading
        } else {
            AccuracyTrend::Stable
        }
    }
}

/// Statistics of one model type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub model_type: ModelType,
    pub version: u64,
    pub accuracy: f64,
    pub rounds_completed: u64,
    pub rounds_failed: u64,
    pub samples_processed: u64,
    pub privacy_budget_used: f64,
    pub privacy_budget_remaining: f64,
    /// Status of the non-terminal round, if one exists
    pub active_round: Option<RoundStatus>,
    /// Updates held for the next round
    pub queued_updates: usize,
    pub last_convergence_delta: Option<f64>,
    pub trend: AccuracyTrend,
    pub converged: bool,
}

impl fmt::Display for ModelStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{}: accuracy {:.4}, rounds {}/{} failed, samples {}, epsilon {:.4} ({:.4} left), trend {:?}, converged {}",
            self.model_type,
            self.version,
            self.accuracy,
            self.rounds_completed,
            self.rounds_failed,
            self.samples_processed,
            self.privacy_budget_used,
            self.privacy_budget_remaining,
            self.trend,
            self.converged,
        )
    }
}

/// Coordinator-wide statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiveMindStats {
    pub models: Vec<ModelStats>,
    pub workers: usize,
    pub buffered_experiences: usize,
    /// Epsilon charged by the privacy engine across all models
    pub privacy_spent: f64,
    pub urgent_broadcasts: u64,
}

impl fmt::Display for HiveMindStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Workers: {}, Buffered: {}, Epsilon spent: {:.4}, Urgent broadcasts: {}",
            self.workers, self.buffered_experiences, self.privacy_spent, self.urgent_broadcasts,
        )?;
        for model in &self.models {
            writeln!(f, "  {model}")?;
        }
        Ok(())
    }
}
