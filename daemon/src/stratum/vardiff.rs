// Variable-difficulty retargeting.
//
// Each session aims for one share every target_time seconds. At most
// every retarget_time seconds the observed rate is compared to the
// target and the difficulty scaled by the ratio, clamped to the
// configured band. Changes inside the hysteresis band are suppressed so
// a noisy miner does not get difficulty pushes on every share.

use minepool_common::time::TimestampMillis;

use crate::config::{VarDiffConfig, VARDIFF_HYSTERESIS};

pub struct VarDiff {
    config: VarDiffConfig,
    last_retarget: TimestampMillis,
    valid_since_retarget: u64,
}

impl VarDiff {
    /// `now` anchors the first window at connect time
    pub fn new(config: VarDiffConfig, now: TimestampMillis) -> Self {
        Self {
            config,
            last_retarget: now,
            valid_since_retarget: 0,
        }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.config
    }

    /// Count one accepted share toward the current window
    pub fn record_valid_share(&mut self) {
        self.valid_since_retarget += 1;
    }

    /// Evaluate a retarget. Returns the difficulty to apply when the
    /// candidate moved outside the hysteresis band.
    pub fn retarget(&mut self, current: f64, now: TimestampMillis) -> Option<f64> {
        let elapsed_secs = now.saturating_sub(self.last_retarget) as f64 / 1000.0;
        if elapsed_secs < self.config.retarget_time_secs as f64 {
            return None;
        }
        if self.valid_since_retarget == 0 {
            return None;
        }

        let target_shares = elapsed_secs / self.config.target_time_secs as f64;
        let ratio = target_shares / self.valid_since_retarget as f64;
        let candidate = (current * ratio).clamp(self.config.min, self.config.max);

        // Window consumed whether or not the change is applied
        self.last_retarget = now;
        self.valid_since_retarget = 0;

        if ((candidate - current).abs() / current) > VARDIFF_HYSTERESIS {
            Some(candidate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VarDiffConfig {
        VarDiffConfig {
            min: 8.0,
            max: 512.0,
            target_time_secs: 10,
            retarget_time_secs: 60,
        }
    }

    #[test]
    fn test_no_retarget_inside_window() {
        let mut vd = VarDiff::new(config(), 0);
        vd.record_valid_share();
        assert_eq!(vd.retarget(32.0, 59_000), None);
    }

    #[test]
    fn test_no_retarget_without_shares() {
        let mut vd = VarDiff::new(config(), 0);
        assert_eq!(vd.retarget(32.0, 120_000), None);
    }

    #[test]
    fn test_scales_by_target_over_actual() {
        let mut vd = VarDiff::new(config(), 0);
        // 6 shares in 120s against a 12-share target: ratio 2
        for _ in 0..6 {
            vd.record_valid_share();
        }
        let new = vd.retarget(32.0, 120_000).unwrap();
        assert!((new - 64.0).abs() < 1e-9);
    }

    #[test]
    fn test_hysteresis_suppresses_small_moves() {
        let mut vd = VarDiff::new(config(), 0);
        // 11 shares in 120s against a 12-share target: ratio ~1.09,
        // inside the 10% band
        for _ in 0..11 {
            vd.record_valid_share();
        }
        assert_eq!(vd.retarget(32.0, 120_000), None);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let mut vd = VarDiff::new(config(), 0);
        vd.record_valid_share();
        // One share in 20 minutes: enormous ratio, clamped to max
        let new = vd.retarget(32.0, 1_200_000).unwrap();
        assert_eq!(new, 512.0);

        let mut vd = VarDiff::new(config(), 0);
        for _ in 0..1000 {
            vd.record_valid_share();
        }
        // A flood of shares drags the candidate to the floor
        let new = vd.retarget(32.0, 60_000).unwrap();
        assert_eq!(new, 8.0);
    }

    #[test]
    fn test_window_resets_after_evaluation() {
        let mut vd = VarDiff::new(config(), 0);
        for _ in 0..6 {
            vd.record_valid_share();
        }
        assert!(vd.retarget(32.0, 120_000).is_some());
        // The next evaluation needs a fresh window and fresh shares
        assert_eq!(vd.retarget(64.0, 130_000), None);
        vd.record_valid_share();
        assert_eq!(vd.retarget(64.0, 170_000), None);
    }
}
