//! Secondary, non-fatal check layered on top of structural verification:
//! compares a peer's deployed bytecode against known-good hashes and
//! estimates an autonomy score from its observed call pattern. A peer
//! that fails this check is never banned for it — it simply cannot climb
//! past [`constitution::TrustTier::Structural`].

use constitution::KNOWN_VAULT_BYTECODE_HASHES;

#[derive(Debug, Clone)]
pub struct BehaviorReport {
    pub bytecode_matched: bool,
    pub autonomy_score: f64,
    pub days_observed: i64,
}

pub struct BehaviorAnalyzer;

impl BehaviorAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, bytecode_hash: &str, call_intervals_secs: &[i64], days_observed: i64) -> BehaviorReport {
        let bytecode_matched = KNOWN_VAULT_BYTECODE_HASHES.contains(&bytecode_hash);
        let autonomy_score = self.autonomy_score(call_intervals_secs);
        BehaviorReport { bytecode_matched, autonomy_score, days_observed }
    }

    /// A crude proxy for "this looks like an autonomous loop and not a
    /// human clicking a button": low variance and a plausible period
    /// (under an hour) score high; bursty or human-paced intervals score
    /// low.
    fn autonomy_score(&self, intervals: &[i64]) -> f64 {
        if intervals.len() < 2 {
            return 0.0;
        }
        let mean = intervals.iter().sum::<i64>() as f64 / intervals.len() as f64;
        if mean <= 0.0 {
            return 0.0;
        }
        let variance = intervals.iter().map(|i| (*i as f64 - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
        let cv = variance.sqrt() / mean;
        let regularity = (1.0 - cv.min(1.0)).max(0.0);
        let period_score = if mean <= 3600.0 { 1.0 } else { (3600.0 / mean).min(1.0) };
        (regularity * 0.6 + period_score * 0.4).clamp(0.0, 1.0)
    }
}

impl Default for BehaviorAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_hourly_calls_score_high_autonomy() {
        let analyzer = BehaviorAnalyzer::new();
        let intervals = vec![3600; 20];
        let report = analyzer.analyze("vault_v1_9f2e1c", &intervals, 10);
        assert!(report.bytecode_matched);
        assert!(report.autonomy_score > 0.8);
    }

    #[test]
    fn erratic_intervals_score_low_autonomy() {
        let analyzer = BehaviorAnalyzer::new();
        let intervals = vec![10, 50000, 5, 80000, 1];
        let report = analyzer.analyze("unknown_hash", &intervals, 1);
        assert!(!report.bytecode_matched);
        assert!(report.autonomy_score < 0.5);
    }
}
