// Verdicts. A verdict is never stored on its own; it is recomputed from the
// case, its result and the case's normalizers whenever it is needed.

use std::fmt;

use serde::Serialize;

use crate::case::TestCase;
use crate::harness::CaseResult;
use crate::normalize::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    Error,
}

impl Verdict {
    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }

    /// Ordering used when one verdict has to stand for several.
    pub fn severity(self) -> u8 {
        match self {
            Verdict::Pass => 0,
            Verdict::Fail => 1,
            Verdict::Error => 2,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
            Verdict::Error => write!(f, "ERROR"),
        }
    }
}

/// The full outcome of judging one result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Judgement {
    pub verdict: Verdict,
    /// PASS by convention because the case has no expectation.
    pub recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_normalized: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_normalized: Option<String>,
}

/// Normalizes both sides identically and compares for exact equality.
pub fn compare(expected: &str, actual: &str, normalizers: &Pipeline) -> Verdict {
    if normalizers.apply(expected) == normalizers.apply(actual) {
        Verdict::Pass
    } else {
        Verdict::Fail
    }
}

pub fn judge(case: &TestCase, result: &CaseResult) -> Judgement {
    if result.timed_out || result.fault.is_some() {
        let reason = result
            .fault
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "timed out".to_string());
        return Judgement {
            verdict: Verdict::Error,
            recorded: false,
            reason: Some(reason),
            expected_normalized: None,
            actual_normalized: None,
        };
    }

    let Some(expected) = case.expected.as_ref() else {
        return Judgement {
            verdict: Verdict::Pass,
            recorded: true,
            reason: None,
            expected_normalized: None,
            actual_normalized: Some(case.normalizers.apply(&result.stdout)),
        };
    };

    let mut reasons = Vec::new();
    let mut expected_normalized = None;
    let mut actual_normalized = None;

    if let Some(want) = expected.stdout.as_deref() {
        if !compare(want, &result.stdout, &case.normalizers).is_pass() {
            reasons.push("output mismatch".to_string());
        }
        expected_normalized = Some(case.normalizers.apply(want));
        actual_normalized = Some(case.normalizers.apply(&result.stdout));
    }

    if let Some(want) = expected.exit_code {
        if result.exit_code != Some(want) {
            reasons.push(format!(
                "exit code {} (expected {want})",
                result
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".into())
            ));
        }
    }

    let verdict = if reasons.is_empty() {
        Verdict::Pass
    } else {
        Verdict::Fail
    };

    Judgement {
        verdict,
        recorded: false,
        reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
        expected_normalized,
        actual_normalized,
    }
}
