use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static SPACED_UNIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^([\d.]+)\s+(s|ms)$").unwrap());
static COMPACT_MS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^([\d.]+)ms$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Milliseconds,
    Unitless,
}

/// A single timing or layout metric parsed from the measurement API's
/// localized display value ("1.8 s", "500 ms", "0.05").
///
/// Timing values normalize to milliseconds. Values without a recognized
/// unit stay unitless (layout-shift scores); unparseable input collapses
/// to 0 rather than failing the stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    value: f64,
    unit: MetricUnit,
}

impl MetricValue {
    pub fn from_display_value(raw: &str) -> Self {
        // Localized display values use non-breaking spaces before units.
        let cleaned = raw.replace('\u{00A0}', " ");
        let cleaned = cleaned.trim();

        if let Some(caps) = SPACED_UNIT_RE.captures(cleaned) {
            let number: f64 = caps[1].parse().unwrap_or(0.0);
            let value = if caps[2].eq_ignore_ascii_case("s") {
                number * 1000.0
            } else {
                number
            };
            return Self {
                value,
                unit: MetricUnit::Milliseconds,
            };
        }

        if let Some(caps) = COMPACT_MS_RE.captures(cleaned) {
            return Self {
                value: caps[1].parse().unwrap_or(0.0),
                unit: MetricUnit::Milliseconds,
            };
        }

        Self {
            value: cleaned.parse().unwrap_or(0.0),
            unit: MetricUnit::Unitless,
        }
    }

    pub fn to_milliseconds(&self) -> f64 {
        self.value
    }

    pub fn to_seconds(&self) -> f64 {
        match self.unit {
            MetricUnit::Milliseconds => self.value / 1000.0,
            MetricUnit::Unitless => self.value,
        }
    }

    /// Human-readable form used in reports and webhook payloads.
    /// Timings at or above 100ms render in seconds with one decimal.
    pub fn format(&self) -> String {
        match self.unit {
            MetricUnit::Milliseconds if self.value >= 100.0 => {
                format!("{:.1} s", self.value / 1000.0)
            }
            MetricUnit::Milliseconds => format!("{:.0} ms", self.value),
            MetricUnit::Unitless if self.value < 1.0 => format!("{:.3}", self.value),
            MetricUnit::Unitless => format!("{:.1}", self.value),
        }
    }
}
