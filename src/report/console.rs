// Human-readable run report for the terminal.

use std::io::{self, Write};

use similar::TextDiff;

use crate::prioritize::{DropReason, FlakyAction};
use crate::report::{ReportEntry, RunReport, Status};

const STDERR_LINES: usize = 10;

pub fn render<W: Write>(report: &RunReport, out: &mut W) -> io::Result<()> {
    for entry in &report.entries {
        render_entry(entry, out)?;
    }

    render_selection(report, out)?;

    let s = &report.summary;
    writeln!(out)?;
    writeln!(
        out,
        "Total: {}  PASS: {}  FAIL: {}  ERROR: {}  RECORDED: {}  ({:.2}s)",
        s.total,
        s.pass,
        s.fail,
        s.error,
        s.recorded,
        report.meta.elapsed().as_secs_f64()
    )?;
    if report.truncated {
        writeln!(out, "RUN TRUNCATED: {} planned case(s) not run", s.not_run)?;
    }
    Ok(())
}

fn render_entry<W: Write>(entry: &ReportEntry, out: &mut W) -> io::Result<()> {
    let code = entry
        .result
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".into());
    write!(
        out,
        "[{}] {} ({:.2}s, code={})",
        entry.status.label(),
        entry.case.id,
        entry.result.duration.as_secs_f64(),
        code
    )?;
    if entry.attempts > 1 {
        write!(out, " attempts={}", entry.attempts)?;
    }
    writeln!(out)?;

    if matches!(entry.status, Status::Pass | Status::Recorded) {
        return Ok(());
    }

    if let Some(reason) = &entry.reason {
        writeln!(out, "  reason: {reason}")?;
    }

    if let (Some(expected), Some(actual)) = (&entry.expected_normalized, &entry.actual_normalized) {
        if expected != actual {
            let diff = TextDiff::from_lines(expected.as_str(), actual.as_str())
                .unified_diff()
                .header("expected", "actual")
                .to_string();
            for line in diff.lines() {
                writeln!(out, "  {line}")?;
            }
        }
    }

    let stderr = entry.result.stderr.trim_end();
    if !stderr.is_empty() {
        writeln!(out, "  stderr:")?;
        let lines: Vec<&str> = stderr.lines().collect();
        let skip = lines.len().saturating_sub(STDERR_LINES);
        for line in &lines[skip..] {
            writeln!(out, "    {line}")?;
        }
    }

    if let Some(analysis) = &entry.analysis {
        if analysis.analysis_failed {
            writeln!(
                out,
                "  analysis failed: {}",
                analysis.failure_reason.as_deref().unwrap_or("unknown")
            )?;
        } else {
            if let Some(cause) = &analysis.root_cause {
                writeln!(out, "  root cause: {cause}")?;
            }
            if let Some(fix) = analysis.suggested_fix.as_deref().filter(|f| !f.is_empty()) {
                writeln!(out, "  suggested fix: {fix}")?;
            }
        }
    }

    Ok(())
}

fn render_selection<W: Write>(report: &RunReport, out: &mut W) -> io::Result<()> {
    let meta = &report.selection;
    if meta.dropped.is_empty() && meta.flaky.is_empty() {
        return Ok(());
    }

    writeln!(out)?;
    writeln!(
        out,
        "Selection: {} loaded, {} selected, {} duplicate(s) dropped",
        meta.loaded, meta.selected, meta.duplicates_dropped
    )?;
    for dropped in &meta.dropped {
        let why = match &dropped.reason {
            DropReason::Duplicate { of } => format!("duplicate of {of}"),
            DropReason::ConflictingExpectation { of } => {
                format!("duplicate of {of} with a different expectation")
            }
            DropReason::Flaky { failure_rate, .. } => {
                format!("flaky ({:.0}% failing), excluded", failure_rate * 100.0)
            }
            DropReason::OverBudget => "over case budget".to_string(),
        };
        writeln!(out, "  dropped {}: {why}", dropped.case_id)?;
    }
    for flaky in meta.flaky.iter().filter(|f| f.action == FlakyAction::Sampled) {
        writeln!(
            out,
            "  flaky {}: {:.0}% failing over {} run(s), sampled",
            flaky.case_id,
            flaky.failure_rate * 100.0,
            flaky.observations
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{CaseInput, Expectation, TestCase};
    use crate::compare::Verdict;
    use crate::harness::CaseResult;
    use crate::normalize::Pipeline;
    use crate::prioritize::{DroppedCase, SelectionMeta};
    use crate::report::{RunMeta, Summary};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn failing_entry() -> ReportEntry {
        ReportEntry {
            case: TestCase {
                id: "sum".into(),
                input: CaseInput::Text("1\n2\n".into()),
                expected: Some(Expectation {
                    stdout: Some("3".into()),
                    exit_code: None,
                }),
                normalizers: Pipeline::default(),
                tags: BTreeSet::new(),
                source: None,
                timeout_secs: None,
            },
            result: CaseResult {
                case_id: "sum".into(),
                stdout: "4".into(),
                stderr: "line1\nline2\n".into(),
                exit_code: Some(0),
                duration: Duration::from_millis(10),
                timed_out: false,
                fault: None,
            },
            verdict: Verdict::Fail,
            status: Status::Fail,
            reason: Some("output mismatch".into()),
            expected_normalized: Some("3".into()),
            actual_normalized: Some("4".into()),
            attempts: 1,
            tally: None,
            analysis: None,
        }
    }

    #[test]
    fn renders_diff_totals_and_truncation() {
        let report = RunReport {
            meta: RunMeta::start("s"),
            truncated: true,
            summary: Summary {
                total: 1,
                fail: 1,
                not_run: 2,
                ..Summary::default()
            },
            entries: vec![failing_entry()],
            not_run: vec!["b".into(), "c".into()],
            selection: SelectionMeta {
                loaded: 4,
                selected: 3,
                duplicates_dropped: 1,
                dropped: vec![DroppedCase {
                    case_id: "d".into(),
                    reason: DropReason::Duplicate { of: "sum".into() },
                }],
                flaky: Vec::new(),
            },
        };

        let mut buf = Vec::new();
        render(&report, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("[FAIL] sum (0.01s, code=0)"));
        assert!(text.contains("-3"));
        assert!(text.contains("+4"));
        assert!(text.contains("    line2"));
        assert!(text.contains("dropped d: duplicate of sum"));
        assert!(text.contains("FAIL: 1"));
        assert!(text.contains("RUN TRUNCATED: 2 planned case(s) not run"));
    }
}
