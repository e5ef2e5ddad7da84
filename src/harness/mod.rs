// Executes test cases against the program under test.
//
// One `CaseResult` per invocation; retries and flaky-case sampling produce
// further invocations whose results replace or accompany the first one
// according to the configured policy.

pub mod pool;
pub mod process;

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::case::TestCase;
use crate::compare::{judge, Verdict};
use crate::config::{ExecutionConfig, ProgramConfig, ReplacePolicy};

/// Why a result could not be judged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFault {
    Timeout { limit_ms: u64 },
    Spawn { detail: String },
    Crashed { signal: Option<i32> },
    Undecodable { stream: String, detail: String },
    OutputLimit { limit_bytes: usize },
    Internal { detail: String },
}

impl fmt::Display for ExecutionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFault::Timeout { limit_ms } => {
                write!(f, "timed out after {:.3}s", *limit_ms as f64 / 1000.0)
            }
            ExecutionFault::Spawn { detail } => write!(f, "failed to start program: {detail}"),
            ExecutionFault::Crashed { signal: Some(sig) } => {
                write!(f, "program terminated by signal {sig}")
            }
            ExecutionFault::Crashed { signal: None } => write!(f, "program terminated abnormally"),
            ExecutionFault::Undecodable { stream, detail } => {
                write!(f, "{stream} is not valid UTF-8: {detail}")
            }
            ExecutionFault::OutputLimit { limit_bytes } => {
                write!(f, "output exceeded {limit_bytes} bytes")
            }
            ExecutionFault::Internal { detail } => write!(f, "harness error: {detail}"),
        }
    }
}

/// Output of one invocation. Built once and never modified.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub case_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<ExecutionFault>,
}

impl CaseResult {
    pub fn faulted(case_id: &str, fault: ExecutionFault, duration: Duration) -> Self {
        Self {
            case_id: case_id.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration,
            timed_out: matches!(fault, ExecutionFault::Timeout { .. }),
            fault: Some(fault),
        }
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub pass: u32,
    pub fail: u32,
    pub error: u32,
}

impl Tally {
    pub fn add(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Pass => self.pass += 1,
            Verdict::Fail => self.fail += 1,
            Verdict::Error => self.error += 1,
        }
    }

    pub fn count(&self, verdict: Verdict) -> u32 {
        match verdict {
            Verdict::Pass => self.pass,
            Verdict::Fail => self.fail,
            Verdict::Error => self.error,
        }
    }

    /// Most frequent verdict; ties go to the more severe one.
    pub fn dominant(&self) -> Verdict {
        [Verdict::Error, Verdict::Fail, Verdict::Pass]
            .into_iter()
            .max_by_key(|v| (self.count(*v), v.severity()))
            .unwrap_or(Verdict::Error)
    }
}

/// Everything the harness produced for one dispatched case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseRun {
    pub result: CaseResult,
    pub attempts: u32,
    /// Verdicts of every invocation when there was more than one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tally: Option<Tally>,
}

pub struct Harness {
    program: ProgramConfig,
    execution: ExecutionConfig,
}

impl Harness {
    pub fn new(program: ProgramConfig, execution: ExecutionConfig) -> Self {
        Self { program, execution }
    }

    pub fn timeout_for(&self, case: &TestCase) -> Duration {
        case.timeout().unwrap_or_else(|| self.program.default_timeout())
    }

    /// A single invocation of the program for `case`.
    pub fn execute(&self, case: &TestCase) -> CaseResult {
        let timeout = self.timeout_for(case);
        let limit = self.execution.max_output_bytes;

        let raw = match process::invoke(&self.program, &case.input, timeout, limit) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(case = %case.id, error = %e, "could not run program");
                return CaseResult::faulted(
                    &case.id,
                    ExecutionFault::Spawn {
                        detail: e.to_string(),
                    },
                    Duration::ZERO,
                );
            }
        };

        let stderr = String::from_utf8_lossy(&raw.stderr).into_owned();
        let (stdout, decode_fault) = match String::from_utf8(raw.stdout) {
            Ok(s) => (s, None),
            Err(e) => {
                let detail = e.utf8_error().to_string();
                let lossy = String::from_utf8_lossy(e.as_bytes()).into_owned();
                (
                    lossy,
                    Some(ExecutionFault::Undecodable {
                        stream: "stdout".into(),
                        detail,
                    }),
                )
            }
        };

        let fault = if raw.timed_out {
            Some(ExecutionFault::Timeout {
                limit_ms: timeout.as_millis() as u64,
            })
        } else if raw.exit_code.is_none() {
            Some(ExecutionFault::Crashed { signal: raw.signal })
        } else if raw.stdout_truncated {
            Some(ExecutionFault::OutputLimit { limit_bytes: limit })
        } else {
            decode_fault
        };

        debug!(
            case = %case.id,
            exit_code = ?raw.exit_code,
            timed_out = raw.timed_out,
            elapsed_ms = raw.duration.as_millis() as u64,
            "invocation finished"
        );

        CaseResult {
            case_id: case.id.clone(),
            stdout,
            stderr,
            exit_code: raw.exit_code,
            duration: raw.duration,
            timed_out: raw.timed_out,
            fault,
        }
    }

    /// Runs a case to completion: once, with retries for non-PASS results,
    /// or `samples` times for a flaky case.
    pub fn run_case(&self, case: &TestCase, samples: u32, cancel: &CancelToken) -> CaseRun {
        if samples > 1 {
            self.sample(case, samples, cancel)
        } else {
            self.with_retries(case, cancel)
        }
    }

    fn with_retries(&self, case: &TestCase, cancel: &CancelToken) -> CaseRun {
        let first = self.execute(case);
        let mut verdict = judge(case, &first).verdict;
        let mut kept = first;
        let mut attempts = 1;
        let mut tally = Tally::default();
        tally.add(verdict);

        while !verdict.is_pass() && attempts <= self.execution.retry_attempts {
            if cancel.is_cancelled() {
                break;
            }
            debug!(case = %case.id, attempt = attempts + 1, "retrying");
            let next = self.execute(case);
            verdict = judge(case, &next).verdict;
            tally.add(verdict);
            attempts += 1;
            if self.execution.retry_policy == ReplacePolicy::Latest {
                kept = next;
            }
        }

        CaseRun {
            result: kept,
            attempts,
            tally: (attempts > 1).then_some(tally),
        }
    }

    fn sample(&self, case: &TestCase, samples: u32, cancel: &CancelToken) -> CaseRun {
        let mut tally = Tally::default();
        let mut runs: Vec<(Verdict, CaseResult)> = Vec::new();

        for i in 0..samples {
            if i > 0 && cancel.is_cancelled() {
                break;
            }
            let result = self.execute(case);
            let verdict = judge(case, &result).verdict;
            tally.add(verdict);
            runs.push((verdict, result));
        }

        let dominant = tally.dominant();
        let attempts = runs.len() as u32;
        let result = runs
            .into_iter()
            .rev()
            .find(|(v, _)| *v == dominant)
            .map(|(_, r)| r)
            .unwrap_or_else(|| {
                CaseResult::faulted(
                    &case.id,
                    ExecutionFault::Internal {
                        detail: "no samples were taken".into(),
                    },
                    Duration::ZERO,
                )
            });

        CaseRun {
            result,
            attempts,
            tally: Some(tally),
        }
    }
}
