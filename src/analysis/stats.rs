//! Order statistics over a sensor's recent history.

use serde::{Deserialize, Serialize};

use crate::detect::AlarmClass;

/// Multiplier applied to the IQR to derive the outer fences.
pub const IQR_FENCE: f64 = 1.5;

/// Percentile of `sorted` (ascending) using linear interpolation between
/// closest ranks. `p` is in `[0, 100]`.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Adaptive band computed from prior points only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IqrBand {
    pub q1: f64,
    pub q3: f64,
    pub lower: f64,
    pub upper: f64,
    pub min: f64,
    pub max: f64,
}

impl IqrBand {
    /// Build the band from history. Returns `None` for an empty history;
    /// NaN values are ignored.
    pub fn from_history(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let q1 = percentile(&sorted, 25.0)?;
        let q3 = percentile(&sorted, 75.0)?;
        let iqr = q3 - q1;

        Some(Self {
            q1,
            q3,
            lower: q1 - IQR_FENCE * iqr,
            upper: q3 + IQR_FENCE * iqr,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        })
    }

    pub fn iqr(&self) -> f64 {
        self.q3 - self.q1
    }

    /// First matching rule wins. Beyond a fence, a value that is also beyond
    /// every prior point escalates to the double level.
    pub fn classify(&self, v: f64) -> AlarmClass {
        if v < self.lower {
            if v < self.min {
                AlarmClass::LowLow
            } else {
                AlarmClass::Low
            }
        } else if v > self.upper {
            if v > self.max {
                AlarmClass::HighHigh
            } else {
                AlarmClass::High
            }
        } else if v < self.q1 {
            AlarmClass::Low
        } else if v > self.q3 {
            AlarmClass::High
        } else {
            AlarmClass::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [10.0, 12.0, 14.0, 16.0];
        assert_eq!(percentile(&sorted, 25.0), Some(11.5));
        assert_eq!(percentile(&sorted, 75.0), Some(14.5));
        assert_eq!(percentile(&sorted, 0.0), Some(10.0));
        assert_eq!(percentile(&sorted, 100.0), Some(16.0));
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[7.0], 25.0), Some(7.0));
    }

    #[test]
    fn test_band_ignores_input_order() {
        let a = IqrBand::from_history(&[16.0, 10.0, 14.0, 12.0]).unwrap();
        let b = IqrBand::from_history(&[10.0, 12.0, 14.0, 16.0]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.iqr(), 3.0);
        assert_eq!(a.lower, 7.0);
        assert_eq!(a.upper, 19.0);
    }

    #[test]
    fn test_classify_rules() {
        let band = IqrBand::from_history(&[10.0, 12.0, 14.0, 16.0]).unwrap();
        assert_eq!(band.classify(13.0), AlarmClass::Ok);
        assert_eq!(band.classify(11.5), AlarmClass::Ok);
        assert_eq!(band.classify(15.0), AlarmClass::High);
        assert_eq!(band.classify(18.0), AlarmClass::High);
        assert_eq!(band.classify(100.0), AlarmClass::HighHigh);
        assert_eq!(band.classify(8.0), AlarmClass::Low);
        assert_eq!(band.classify(5.0), AlarmClass::LowLow);
    }

    #[test]
    fn test_outside_fence_but_within_history_is_single_level() {
        // Flat history with one low outlier: fences collapse onto 10.
        let band = IqrBand::from_history(&[0.0, 10.0, 10.0, 10.0, 10.0, 10.0]).unwrap();
        assert_eq!(band.classify(5.0), AlarmClass::Low);
        assert_eq!(band.classify(-1.0), AlarmClass::LowLow);
        assert_eq!(band.classify(10.0), AlarmClass::Ok);
    }
}
