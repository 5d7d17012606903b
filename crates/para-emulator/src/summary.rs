//! Run summary written when the simulation terminates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationTotals {
    pub devices: usize,
    pub duration_minutes: u64,
    pub total_points: u64,
    pub registered_devices: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub simulation: SimulationTotals,
    /// Completion time, RFC 3339
    pub timestamp: String,
}

impl RunSummary {
    pub fn new(totals: SimulationTotals, completed_at: DateTime<Utc>) -> Self {
        Self {
            simulation: totals,
            timestamp: completed_at.to_rfc3339(),
        }
    }

    /// Write as pretty-printed JSON, replacing any previous file.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to encode run summary")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run summary to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn written_summary_has_the_results_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let summary = RunSummary::new(
            SimulationTotals {
                devices: 20,
                duration_minutes: 5,
                total_points: 1234,
                registered_devices: 19,
            },
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        );

        summary.write(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["simulation"]["devices"], 20);
        assert_eq!(json["simulation"]["duration_minutes"], 5);
        assert_eq!(json["simulation"]["total_points"], 1234);
        assert_eq!(json["simulation"]["registered_devices"], 19);
        assert_eq!(json["timestamp"], "2025-06-01T12:00:00+00:00");
    }

    #[test]
    fn unwritable_path_is_an_error() {
        let summary = RunSummary::new(
            SimulationTotals {
                devices: 1,
                duration_minutes: 1,
                total_points: 0,
                registered_devices: 0,
            },
            Utc::now(),
        );
        assert!(summary.write(Path::new("/nonexistent/dir/results.json")).is_err());
    }
}
