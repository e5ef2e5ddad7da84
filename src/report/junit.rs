use std::path::Path;

use quick_junit::{NonSuccessKind, Property, Report, TestCase, TestCaseStatus, TestSuite};

use crate::error::RunError;
use crate::report::{report_error, write_report, ReportEntry, RunReport, Status};

const STDERR_TAIL: usize = 2_000;

pub fn to_junit(report: &RunReport) -> Result<String, quick_junit::SerializeError> {
    let mut suite = TestSuite::new(report.meta.suite_name.clone());
    suite.set_time(report.meta.elapsed());
    suite.add_property(Property::new("run_id", report.meta.run_id.clone()));
    suite.add_property(Property::new(
        "duplicates_dropped",
        report.selection.duplicates_dropped.to_string(),
    ));
    if report.truncated {
        suite.add_property(Property::new("truncated", "true"));
        suite.add_property(Property::new("not_run", report.summary.not_run.to_string()));
    }

    for entry in &report.entries {
        suite.add_test_case(test_case(&report.meta.suite_name, entry));
    }

    let mut out = Report::new(report.meta.suite_name.clone());
    out.set_time(report.meta.elapsed());
    out.add_test_suite(suite);
    out.to_string()
}

pub fn write_junit(report: &RunReport, path: &Path) -> Result<(), RunError> {
    let xml = to_junit(report).map_err(|e| report_error(path, e))?;
    write_report(path, &xml)
}

fn test_case(suite_name: &str, entry: &ReportEntry) -> TestCase {
    let status = match entry.status {
        Status::Pass | Status::Recorded => TestCaseStatus::success(),
        Status::Fail => failure(NonSuccessKind::Failure, entry),
        Status::Error => failure(NonSuccessKind::Error, entry),
    };

    let mut tc = TestCase::new(entry.case.id.clone(), status);
    tc.set_classname(suite_name.to_string());
    tc.set_time(entry.result.duration);

    if entry.status == Status::Recorded {
        tc.set_system_out(format!(
            "recorded (no expectation)\n{}",
            entry.result.stdout
        ));
    }
    if !entry.result.stderr.is_empty() {
        tc.set_system_err(tail(&entry.result.stderr));
    }
    tc
}

fn failure(kind: NonSuccessKind, entry: &ReportEntry) -> TestCaseStatus {
    let message = entry
        .reason
        .clone()
        .unwrap_or_else(|| entry.verdict.to_string());

    let mut status = TestCaseStatus::non_success(kind);
    status
        .set_message(message)
        .set_description(description(entry));
    status
}

fn description(entry: &ReportEntry) -> String {
    let mut out = String::new();

    out.push_str(&format!("Input:\n{}\n\n", entry.case.input.as_text()));
    if let Some(expected) = &entry.expected_normalized {
        out.push_str(&format!("Expected (normalized):\n{expected}\n\n"));
    }
    let actual = entry
        .actual_normalized
        .as_deref()
        .unwrap_or(&entry.result.stdout);
    out.push_str(&format!("Actual (normalized):\n{actual}\n\n"));

    let code = entry
        .result
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".into());
    out.push_str(&format!("Exit code: {code}\n"));
    if entry.attempts > 1 {
        out.push_str(&format!("Attempts: {}\n", entry.attempts));
    }

    if !entry.result.stderr.trim().is_empty() {
        out.push_str(&format!("\nStderr:\n{}\n", tail(&entry.result.stderr)));
    }

    if let Some(analysis) = &entry.analysis {
        if analysis.analysis_failed {
            out.push_str(&format!(
                "\nAnalysis failed: {}\n",
                analysis.failure_reason.as_deref().unwrap_or("unknown")
            ));
        } else {
            out.push_str("\n--- Analysis ---\n");
            if let Some(cause) = &analysis.root_cause {
                out.push_str(&format!("Root cause: {cause}\n"));
            }
            if let Some(fix) = &analysis.suggested_fix {
                out.push_str(&format!("Suggested fix: {fix}\n"));
            }
            if let Some(c) = analysis.confidence {
                out.push_str(&format!("Confidence: {c:.2}\n"));
            }
        }
    }

    out
}

fn tail(s: &str) -> String {
    let count = s.chars().count();
    if count <= STDERR_TAIL {
        return s.to_string();
    }
    s.chars().skip(count - STDERR_TAIL).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalysisReport;
    use crate::case::{CaseInput, Expectation, TestCase as Case};
    use crate::compare::Verdict;
    use crate::harness::CaseResult;
    use crate::normalize::Pipeline;
    use crate::prioritize::SelectionMeta;
    use crate::report::{RunMeta, Summary};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn entry(id: &str, status: Status, verdict: Verdict) -> ReportEntry {
        ReportEntry {
            case: Case {
                id: id.into(),
                input: CaseInput::Text("5\n3\n".into()),
                expected: Some(Expectation {
                    stdout: Some("8".into()),
                    exit_code: None,
                }),
                normalizers: Pipeline::default(),
                tags: BTreeSet::new(),
                source: None,
                timeout_secs: None,
            },
            result: CaseResult {
                case_id: id.into(),
                stdout: "9".into(),
                stderr: "warn: x".into(),
                exit_code: Some(0),
                duration: Duration::from_millis(120),
                timed_out: false,
                fault: None,
            },
            verdict,
            status,
            reason: (!verdict.is_pass()).then(|| "output mismatch".to_string()),
            expected_normalized: Some("8".into()),
            actual_normalized: Some("9".into()),
            attempts: 1,
            tally: None,
            analysis: None,
        }
    }

    fn report(entries: Vec<ReportEntry>, truncated: bool) -> RunReport {
        RunReport {
            meta: RunMeta::start("agent-tests"),
            truncated,
            summary: Summary::default(),
            entries,
            not_run: Vec::new(),
            selection: SelectionMeta::default(),
        }
    }

    #[test]
    fn failure_carries_diff_and_analysis() {
        let mut failing = entry("t1", Status::Fail, Verdict::Fail);
        failing.analysis = Some(AnalysisReport {
            case_id: "t1".into(),
            analyzer: "test".into(),
            attempts: 1,
            analysis_failed: false,
            failure_reason: None,
            root_cause: Some("adds one too many".into()),
            suggested_fix: Some("drop the +1".into()),
            confidence: Some(0.9),
            request_hash: None,
        });
        let xml = to_junit(&report(
            vec![entry("t0", Status::Pass, Verdict::Pass), failing],
            false,
        ))
        .unwrap();

        assert!(xml.contains("<testsuite name=\"agent-tests\""));
        assert!(xml.contains("tests=\"2\""));
        assert!(xml.contains("failures=\"1\""));
        assert!(xml.contains("output mismatch"));
        assert!(xml.contains("Root cause: adds one too many"));
    }

    #[test]
    fn error_and_truncation_are_marked() {
        let xml = to_junit(&report(vec![entry("t2", Status::Error, Verdict::Error)], true)).unwrap();
        assert!(xml.contains("errors=\"1\""));
        assert!(xml.contains("name=\"truncated\""));
    }
}
