// Run report assembly. Results arrive in completion order tagged with their
// dispatch slot; the report lists them in dispatch order with verdicts
// recomputed from case + result.

pub mod console;
pub mod junit;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::analyzer::AnalysisReport;
use crate::case::TestCase;
use crate::compare::{judge, Verdict};
use crate::error::{AggregationError, RunError};
use crate::harness::pool::PoolOutcome;
use crate::harness::{CaseResult, CaseRun, Tally};
use crate::prioritize::{PlannedCase, SelectionMeta};

/// Verdict as shown to people: recording-mode passes are kept apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Fail,
    Error,
    Recorded,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Status::Pass => "PASS",
            Status::Fail => "FAIL",
            Status::Error => "ERROR",
            Status::Recorded => "RECORDED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub case: TestCase,
    pub result: CaseResult,
    pub verdict: Verdict,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_normalized: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_normalized: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tally: Option<Tally>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    /// Also counted in `pass`.
    pub recorded: usize,
    /// Planned but never dispatched.
    pub not_run: usize,
}

/// Identity and timing of a run, supplied by the caller so that
/// aggregation itself stays deterministic.
#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub suite_name: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunMeta {
    pub fn start(suite_name: &str) -> Self {
        let now = Utc::now();
        Self {
            suite_name: suite_name.to_string(),
            run_id: Uuid::new_v4().to_string(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(flatten)]
    pub meta: RunMeta,
    pub truncated: bool,
    pub summary: Summary,
    /// Dispatch order.
    pub entries: Vec<ReportEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_run: Vec<String>,
    pub selection: SelectionMeta,
}

impl RunReport {
    pub fn all_passed(&self) -> bool {
        !self.truncated && self.summary.fail == 0 && self.summary.error == 0
    }

    pub fn verdicts(&self) -> impl Iterator<Item = (&str, Verdict)> {
        self.entries
            .iter()
            .map(|e| (e.case.id.as_str(), e.verdict))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), RunError> {
        let text = self.to_json().map_err(|e| report_error(path, e))?;
        write_report(path, &text)
    }
}

pub(crate) fn write_report(path: &Path, text: &str) -> Result<(), RunError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| report_error(path, e))?;
        }
    }
    fs::write(path, text).map_err(|e| report_error(path, e))
}

pub(crate) fn report_error(path: &Path, e: impl ToString) -> RunError {
    RunError::Report {
        path: path.to_path_buf(),
        detail: e.to_string(),
    }
}

/// Builds the report. Every dispatched slot must carry exactly one run for
/// the case planned in that slot; every analysis must belong to a
/// dispatched case that did not pass.
pub fn aggregate(
    meta: RunMeta,
    planned: &[PlannedCase],
    outcome: PoolOutcome,
    analyses: Vec<AnalysisReport>,
    selection: SelectionMeta,
) -> Result<RunReport, AggregationError> {
    let dispatched = outcome.dispatched.min(planned.len());
    let mut slots: Vec<Option<CaseRun>> = vec![None; dispatched];

    for (slot, run) in outcome.runs {
        let Some(cell) = slots.get_mut(slot) else {
            return Err(AggregationError::UnknownSlot { slot });
        };
        let expected = &planned[slot].case.id;
        if &run.result.case_id != expected {
            return Err(AggregationError::MismatchedResult {
                slot,
                expected: expected.clone(),
                found: run.result.case_id,
            });
        }
        if cell.is_some() {
            return Err(AggregationError::DuplicateResult {
                case_id: expected.clone(),
            });
        }
        *cell = Some(run);
    }

    let mut by_case: HashMap<String, AnalysisReport> = HashMap::new();
    for analysis in analyses {
        if by_case.contains_key(&analysis.case_id) {
            return Err(AggregationError::StrayAnalysis {
                case_id: analysis.case_id,
            });
        }
        by_case.insert(analysis.case_id.clone(), analysis);
    }

    let mut summary = Summary::default();
    let mut entries = Vec::with_capacity(dispatched);

    for (planned_case, run) in planned.iter().zip(slots) {
        let case = &planned_case.case;
        let run = run.ok_or_else(|| AggregationError::MissingResult {
            case_id: case.id.clone(),
        })?;

        let judgement = judge(case, &run.result);
        let status = match judgement.verdict {
            Verdict::Pass if judgement.recorded => Status::Recorded,
            Verdict::Pass => Status::Pass,
            Verdict::Fail => Status::Fail,
            Verdict::Error => Status::Error,
        };

        let analysis = by_case.remove(&case.id);
        if analysis.is_some() && judgement.verdict.is_pass() {
            return Err(AggregationError::StrayAnalysis {
                case_id: case.id.clone(),
            });
        }

        summary.total += 1;
        match judgement.verdict {
            Verdict::Pass => summary.pass += 1,
            Verdict::Fail => summary.fail += 1,
            Verdict::Error => summary.error += 1,
        }
        if judgement.recorded {
            summary.recorded += 1;
        }

        entries.push(ReportEntry {
            case: case.clone(),
            result: run.result,
            verdict: judgement.verdict,
            status,
            reason: judgement.reason,
            expected_normalized: judgement.expected_normalized,
            actual_normalized: judgement.actual_normalized,
            attempts: run.attempts,
            tally: run.tally,
            analysis,
        });
    }

    if let Some(case_id) = by_case.into_keys().min() {
        return Err(AggregationError::StrayAnalysis { case_id });
    }

    let not_run: Vec<String> = planned[dispatched..]
        .iter()
        .map(|p| p.case.id.clone())
        .collect();
    summary.not_run = not_run.len();

    Ok(RunReport {
        meta,
        truncated: outcome.truncated || !not_run.is_empty(),
        summary,
        entries,
        not_run,
        selection,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalysisReport;
    use crate::case::{CaseInput, Expectation};
    use crate::harness::ExecutionFault;
    use crate::normalize::Pipeline;
    use std::collections::BTreeSet;

    fn planned(id: &str, expected: Option<&str>) -> PlannedCase {
        PlannedCase {
            case: TestCase {
                id: id.into(),
                input: CaseInput::Text(String::new()),
                expected: expected.map(|s| Expectation {
                    stdout: Some(s.into()),
                    exit_code: None,
                }),
                normalizers: Pipeline::parse(&["strip"]).unwrap(),
                tags: BTreeSet::new(),
                source: None,
                timeout_secs: None,
            },
            samples: 1,
        }
    }

    fn run(id: &str, stdout: &str) -> CaseRun {
        CaseRun {
            result: CaseResult {
                case_id: id.into(),
                stdout: stdout.into(),
                stderr: String::new(),
                exit_code: Some(0),
                duration: Duration::from_millis(1),
                timed_out: false,
                fault: None,
            },
            attempts: 1,
            tally: None,
        }
    }

    fn analysis(id: &str) -> AnalysisReport {
        AnalysisReport {
            case_id: id.into(),
            analyzer: "test".into(),
            attempts: 1,
            analysis_failed: false,
            failure_reason: None,
            root_cause: Some("cause".into()),
            suggested_fix: Some("fix".into()),
            confidence: None,
            request_hash: None,
        }
    }

    fn outcome(runs: Vec<(usize, CaseRun)>, dispatched: usize, truncated: bool) -> PoolOutcome {
        PoolOutcome {
            runs,
            dispatched,
            truncated,
        }
    }

    #[test]
    fn entries_follow_dispatch_order() {
        let plan = vec![planned("a", Some("1")), planned("b", Some("2")), planned("c", None)];
        let runs = vec![(2, run("c", "x")), (0, run("a", "1\n")), (1, run("b", "3"))];
        let report = aggregate(
            RunMeta::start("s"),
            &plan,
            outcome(runs, 3, false),
            vec![analysis("b")],
            SelectionMeta::default(),
        )
        .unwrap();

        let ids: Vec<&str> = report.entries.iter().map(|e| e.case.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(report.entries[0].status, Status::Pass);
        assert_eq!(report.entries[1].status, Status::Fail);
        assert_eq!(report.entries[2].status, Status::Recorded);
        assert!(report.entries[1].analysis.is_some());
        assert_eq!(
            report.summary,
            Summary { total: 3, pass: 2, fail: 1, error: 0, recorded: 1, not_run: 0 }
        );
        assert!(!report.all_passed());
    }

    #[test]
    fn missing_result_is_fatal() {
        let plan = vec![planned("a", Some("1")), planned("b", Some("2"))];
        let err = aggregate(
            RunMeta::start("s"),
            &plan,
            outcome(vec![(0, run("a", "1"))], 2, false),
            vec![],
            SelectionMeta::default(),
        )
        .unwrap_err();
        assert_eq!(err, AggregationError::MissingResult { case_id: "b".into() });
    }

    #[test]
    fn duplicate_and_unknown_slots_are_fatal() {
        let plan = vec![planned("a", Some("1"))];
        let err = aggregate(
            RunMeta::start("s"),
            &plan,
            outcome(vec![(0, run("a", "1")), (0, run("a", "1"))], 1, false),
            vec![],
            SelectionMeta::default(),
        )
        .unwrap_err();
        assert_eq!(err, AggregationError::DuplicateResult { case_id: "a".into() });

        let err = aggregate(
            RunMeta::start("s"),
            &plan,
            outcome(vec![(0, run("a", "1")), (4, run("z", "1"))], 1, false),
            vec![],
            SelectionMeta::default(),
        )
        .unwrap_err();
        assert_eq!(err, AggregationError::UnknownSlot { slot: 4 });

        let err = aggregate(
            RunMeta::start("s"),
            &plan,
            outcome(vec![(0, run("q", "1"))], 1, false),
            vec![],
            SelectionMeta::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AggregationError::MismatchedResult { slot: 0, .. }));
    }

    #[test]
    fn analysis_of_passing_case_is_rejected() {
        let plan = vec![planned("a", Some("1"))];
        let err = aggregate(
            RunMeta::start("s"),
            &plan,
            outcome(vec![(0, run("a", "1"))], 1, false),
            vec![analysis("a")],
            SelectionMeta::default(),
        )
        .unwrap_err();
        assert_eq!(err, AggregationError::StrayAnalysis { case_id: "a".into() });
    }

    #[test]
    fn truncated_run_lists_undispatched_cases() {
        let plan = vec![planned("a", Some("1")), planned("b", Some("2")), planned("c", Some("3"))];
        let report = aggregate(
            RunMeta::start("s"),
            &plan,
            outcome(vec![(0, run("a", "1"))], 1, true),
            vec![],
            SelectionMeta::default(),
        )
        .unwrap();

        assert!(report.truncated);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.not_run, ["b", "c"]);
        assert_eq!(report.summary.not_run, 2);
        assert!(!report.all_passed());
    }

    #[test]
    fn faulted_result_reports_error_status() {
        let plan = vec![planned("a", Some("1"))];
        let mut r = run("a", "1");
        r.result.timed_out = true;
        r.result.fault = Some(ExecutionFault::Timeout { limit_ms: 2000 });
        let report = aggregate(
            RunMeta::start("s"),
            &plan,
            outcome(vec![(0, r)], 1, false),
            vec![],
            SelectionMeta::default(),
        )
        .unwrap();

        assert_eq!(report.entries[0].status, Status::Error);
        assert_eq!(report.summary.error, 1);
        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"ERROR\""));
        assert!(json.contains("\"suite_name\": \"s\""));
    }
}
