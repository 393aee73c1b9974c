use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Compressions kept for the rolling ratio average.
pub const RATIO_WINDOW: usize = 100;

/// Running compression statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionMetrics {
    pub compressions: u64,
    pub messages_removed: u64,
    pub bytes_saved: u64,
    /// Mean of `tokens_after / tokens_before` over the last
    /// [`RATIO_WINDOW`] compressions.
    pub average_compression_ratio: f64,
    pub last_compression: Option<DateTime<Utc>>,
    #[serde(skip)]
    recent_ratios: VecDeque<f64>,
}

impl CompressionMetrics {
    pub fn record(&mut self, messages_removed: usize, bytes_saved: usize, ratio: f64) {
        self.compressions += 1;
        self.messages_removed += messages_removed as u64;
        self.bytes_saved += bytes_saved as u64;
        self.last_compression = Some(Utc::now());

        if self.recent_ratios.len() == RATIO_WINDOW {
            self.recent_ratios.pop_front();
        }
        self.recent_ratios.push_back(ratio);
        self.average_compression_ratio =
            self.recent_ratios.iter().sum::<f64>() / self.recent_ratios.len() as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_average_is_rolling() {
        let mut m = CompressionMetrics::default();
        m.record(3, 100, 0.5);
        m.record(1, 50, 0.3);
        assert_eq!(m.compressions, 2);
        assert_eq!(m.messages_removed, 4);
        assert_eq!(m.bytes_saved, 150);
        assert!((m.average_compression_ratio - 0.4).abs() < 1e-9);
        assert!(m.last_compression.is_some());

        for _ in 0..RATIO_WINDOW {
            m.record(0, 0, 1.0);
        }
        assert_eq!(m.average_compression_ratio, 1.0);
    }
}
