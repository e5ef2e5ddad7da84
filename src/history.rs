// Verdicts of earlier runs, the input for flaky-case detection.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compare::Verdict;
use crate::error::ConfigError;

pub const MAX_RUNS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRun {
    pub run_id: String,
    pub finished_at: String,
    #[serde(default)]
    pub verdicts: BTreeMap<String, Verdict>,
}

impl HistoryRun {
    pub fn new(verdicts: BTreeMap<String, Verdict>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            finished_at: Utc::now().to_rfc3339(),
            verdicts,
        }
    }
}

/// Oldest run first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunHistory {
    #[serde(default)]
    pub runs: Vec<HistoryRun>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureStats {
    pub observations: usize,
    pub failures: usize,
    pub passes: usize,
}

impl FailureStats {
    pub fn failure_rate(&self) -> f64 {
        if self.observations == 0 {
            0.0
        } else {
            self.failures as f64 / self.observations as f64
        }
    }
}

impl RunHistory {
    /// A missing file is an empty history.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, text)
    }

    pub fn record(&mut self, run: HistoryRun) {
        self.runs.push(run);
        if self.runs.len() > MAX_RUNS {
            let excess = self.runs.len() - MAX_RUNS;
            self.runs.drain(..excess);
        }
    }

    /// Verdict counts over the most recent `window` runs that include the case.
    pub fn stats(&self, case_id: &str, window: usize) -> FailureStats {
        let mut stats = FailureStats {
            observations: 0,
            failures: 0,
            passes: 0,
        };

        for verdict in self
            .runs
            .iter()
            .rev()
            .filter_map(|run| run.verdicts.get(case_id))
            .take(window)
        {
            stats.observations += 1;
            if verdict.is_pass() {
                stats.passes += 1;
            } else {
                stats.failures += 1;
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(pairs: &[(&str, Verdict)]) -> HistoryRun {
        HistoryRun::new(pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }

    #[test]
    fn stats_use_most_recent_window() {
        let mut h = RunHistory::default();
        h.record(run(&[("a", Verdict::Fail)]));
        h.record(run(&[("a", Verdict::Fail)]));
        h.record(run(&[("b", Verdict::Pass)]));
        h.record(run(&[("a", Verdict::Pass)]));
        h.record(run(&[("a", Verdict::Error)]));

        let s = h.stats("a", 3);
        assert_eq!(s.observations, 3);
        assert_eq!(s.failures, 2);
        assert_eq!(s.passes, 1);
        assert!((s.failure_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(h.stats("missing", 10).observations, 0);
    }

    #[test]
    fn record_caps_length() {
        let mut h = RunHistory::default();
        for _ in 0..(MAX_RUNS + 5) {
            h.record(run(&[]));
        }
        assert_eq!(h.runs.len(), MAX_RUNS);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/history.json");
        let mut h = RunHistory::default();
        h.record(run(&[("x", Verdict::Pass)]));
        h.save(&path).unwrap();

        let loaded = RunHistory::load(&path).unwrap();
        assert_eq!(loaded.runs.len(), 1);
        assert_eq!(loaded.runs[0].verdicts.get("x"), Some(&Verdict::Pass));
        assert!(RunHistory::load(&dir.path().join("none.json")).unwrap().runs.is_empty());
    }
}
