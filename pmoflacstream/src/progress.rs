//! Stream facts and progress accounting.

use std::sync::{
    OnceLock,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

use crate::pcm::StreamFormat;

/// Snapshot of a session's progress.
///
/// `percentage` and `total_seconds` are NaN while the total sample count is
/// unknown; `current_seconds` is NaN until the sample rate is known.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Progress {
    pub position: u64,
    pub total_samples: Option<u64>,
    pub percentage: f64,
    pub total_seconds: f64,
    pub current_seconds: f64,
}

/// Caches the stream facts once and counts processed sample-frames.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    format: OnceLock<StreamFormat>,
    processed: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the stream facts. Returns false when they were already known;
    /// the first announcement wins.
    pub fn set_format(&self, format: StreamFormat) -> bool {
        self.format.set(format).is_ok()
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.format.get().copied()
    }

    pub fn add_samples(&self, samples: u64) {
        self.processed.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn processed_samples(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Progress {
        let position = self.processed_samples();
        let format = self.format();
        let total_samples = format.and_then(|f| f.total_samples).filter(|&t| t > 0);
        let sample_rate = format.map(|f| f.sample_rate as f64).unwrap_or(f64::NAN);

        let (percentage, total_seconds) = match total_samples {
            Some(total) => (
                position as f64 / total as f64 * 100.0,
                total as f64 / sample_rate,
            ),
            None => (f64::NAN, f64::NAN),
        };

        Progress {
            position,
            total_samples,
            percentage,
            total_seconds,
            current_seconds: position as f64 / sample_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(total: Option<u64>) -> StreamFormat {
        StreamFormat {
            channels: 2,
            bits_per_sample: 16,
            sample_rate: 1000,
            total_samples: total,
            is_32bit: false,
        }
    }

    #[test]
    fn first_format_wins() {
        let tracker = ProgressTracker::new();
        assert!(tracker.set_format(format(Some(10))));
        assert!(!tracker.set_format(format(Some(99))));
        assert_eq!(tracker.format().unwrap().total_samples, Some(10));
    }

    #[test]
    fn progress_with_known_total() {
        let tracker = ProgressTracker::new();
        tracker.set_format(format(Some(4000)));
        tracker.add_samples(1000);
        let progress = tracker.snapshot();
        assert_eq!(progress.position, 1000);
        assert_eq!(progress.percentage, 25.0);
        assert_eq!(progress.total_seconds, 4.0);
        assert_eq!(progress.current_seconds, 1.0);
    }

    #[test]
    fn progress_with_unknown_total_is_nan() {
        let tracker = ProgressTracker::new();
        tracker.set_format(format(None));
        tracker.add_samples(500);
        let progress = tracker.snapshot();
        assert!(progress.percentage.is_nan());
        assert!(progress.total_seconds.is_nan());
        assert_eq!(progress.current_seconds, 0.5);
    }
}
