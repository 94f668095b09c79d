use serde::{Deserialize, Serialize};

use crate::error::PagebeatError;

/// Scores at or above this are good.
pub const SCORE_GOOD_THRESHOLD: f64 = 0.9;
/// Scores at or above this (but below good) need improvement; below is poor.
pub const SCORE_AVERAGE_THRESHOLD: f64 = 0.5;

/// Performance score as reported by the measurement API, 0.0 to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(f64);

impl Score {
    pub fn new(value: f64) -> Result<Self, PagebeatError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(PagebeatError::Validation(format!(
                "Score must be between 0.0 and 1.0, got: {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Integer percentage 0-100, as persisted and shown to consumers.
    pub fn to_percentage(&self) -> i16 {
        (self.0 * 100.0).round() as i16
    }

    pub fn is_passing(&self) -> bool {
        self.0 >= SCORE_GOOD_THRESHOLD
    }

    /// Color bucket used by the report template.
    pub fn color(&self) -> &'static str {
        if self.0 >= SCORE_GOOD_THRESHOLD {
            "green"
        } else if self.0 >= SCORE_AVERAGE_THRESHOLD {
            "orange"
        } else {
            "red"
        }
    }

    pub fn label(&self) -> &'static str {
        if self.0 >= SCORE_GOOD_THRESHOLD {
            "Good"
        } else if self.0 >= SCORE_AVERAGE_THRESHOLD {
            "Needs Improvement"
        } else {
            "Poor"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_percentage_rounds() {
        assert_eq!(Score::new(0.85).unwrap().to_percentage(), 85);
        assert_eq!(Score::new(1.0).unwrap().to_percentage(), 100);
        assert_eq!(Score::new(0.0).unwrap().to_percentage(), 0);
        assert_eq!(Score::new(0.874).unwrap().to_percentage(), 87);
    }

    #[test]
    fn test_color_buckets() {
        assert_eq!(Score::new(0.95).unwrap().color(), "green");
        assert_eq!(Score::new(0.90).unwrap().color(), "green");
        assert_eq!(Score::new(0.89).unwrap().color(), "orange");
        assert_eq!(Score::new(0.50).unwrap().color(), "orange");
        assert_eq!(Score::new(0.49).unwrap().color(), "red");
    }

    #[test]
    fn test_labels() {
        assert_eq!(Score::new(0.92).unwrap().label(), "Good");
        assert_eq!(Score::new(0.6).unwrap().label(), "Needs Improvement");
        assert_eq!(Score::new(0.1).unwrap().label(), "Poor");
    }

    #[test]
    fn test_passing_boundary() {
        assert!(Score::new(0.90).unwrap().is_passing());
        assert!(!Score::new(0.89).unwrap().is_passing());
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(Score::new(1.5).is_err());
        assert!(Score::new(-0.1).is_err());
        let err = Score::new(1.5).unwrap_err();
        assert!(err.message().contains("between 0.0 and 1.0"));
    }
}
