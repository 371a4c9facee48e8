use crate::api::ProgressResponse;

/// Tracks pull progress so only whole-percent changes get logged
#[derive(Debug, Default)]
pub struct PullProgress {
    last_total: Option<u64>,
    last_percent: Option<u64>,
}

impl PullProgress {
    /// Feed one progress record; returns the floored percentage when it changed.
    ///
    /// Records without a positive `completed` are ignored. The percentage is
    /// computed against the most recent positive `total` seen.
    pub fn update(&mut self, record: &ProgressResponse) -> Option<u64> {
        if let Some(total) = record.total.filter(|t| *t > 0) {
            self.last_total = Some(total);
        }
        let completed = record.completed.filter(|c| *c > 0)?;
        let total = self.last_total?;

        let percent = (completed.saturating_mul(100) / total).min(100);
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }
}

/// Bytes as gigabytes (1024^3) with one decimal
pub fn format_gb(bytes: u64) -> String {
    format!("{:.1}", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total: Option<u64>, completed: Option<u64>) -> ProgressResponse {
        ProgressResponse {
            status: "pulling".to_string(),
            total,
            completed,
            ..Default::default()
        }
    }

    #[test]
    fn test_reports_only_on_change() {
        let mut progress = PullProgress::default();
        assert_eq!(progress.update(&record(Some(1000), Some(10))), Some(1));
        assert_eq!(progress.update(&record(Some(1000), Some(15))), None);
        assert_eq!(progress.update(&record(Some(1000), Some(20))), Some(2));
        assert_eq!(progress.update(&record(Some(1000), Some(999))), Some(99));
        assert_eq!(progress.update(&record(Some(1000), Some(1000))), Some(100));
        assert_eq!(progress.update(&record(Some(1000), Some(1000))), None);
    }

    #[test]
    fn test_ignores_records_without_completed() {
        let mut progress = PullProgress::default();
        assert_eq!(progress.update(&record(None, None)), None);
        assert_eq!(progress.update(&record(Some(1000), None)), None);
        assert_eq!(progress.update(&record(Some(1000), Some(0))), None);
        assert_eq!(progress.update(&record(None, Some(500))), Some(50));
    }

    #[test]
    fn test_completed_before_any_total() {
        let mut progress = PullProgress::default();
        assert_eq!(progress.update(&record(None, Some(500))), None);
    }

    #[test]
    fn test_new_layer_restarts_percentage() {
        let mut progress = PullProgress::default();
        assert_eq!(progress.update(&record(Some(100), Some(100))), Some(100));
        assert_eq!(progress.update(&record(Some(400), Some(100))), Some(25));
    }

    #[test]
    fn test_format_gb() {
        assert_eq!(format_gb(0), "0.0");
        assert_eq!(format_gb(1024 * 1024 * 1024), "1.0");
        assert_eq!(format_gb(2019393189), "1.9");
    }
}
