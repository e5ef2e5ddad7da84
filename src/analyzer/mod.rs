// Failure analysis. Non-PASS cases are handed to an `Analyzer` after
// judging; whatever it returns is attached to the report as advice and
// never feeds back into a verdict.

pub mod client;
pub mod prompt;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::case::TestCase;
use crate::compare::{Judgement, Verdict};
use crate::config::AnalyzerConfig;
use crate::harness::CaseResult;

const BACKOFF_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalyzerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("analyzer returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("unreadable analyzer response: {0}")]
    Parse(String),

    #[error("analyzer timed out")]
    Timeout,

    #[error("run cancelled")]
    Cancelled,

    #[error("analyzer panicked")]
    Panicked,
}

impl AnalyzerError {
    fn is_retryable(&self) -> bool {
        match self {
            AnalyzerError::Transport(_) | AnalyzerError::Timeout | AnalyzerError::Parse(_) => true,
            AnalyzerError::Status { code, .. } => *code == 429 || *code >= 500,
            AnalyzerError::Cancelled | AnalyzerError::Panicked => false,
        }
    }
}

/// Read-only view of a finished case.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub command: String,
    pub case: TestCase,
    pub result: CaseResult,
    pub verdict: Verdict,
    pub reason: Option<String>,
    pub expected_normalized: Option<String>,
    pub actual_normalized: Option<String>,
}

impl AnalysisRequest {
    pub fn new(command: &str, case: &TestCase, result: &CaseResult, judgement: &Judgement) -> Self {
        Self {
            command: command.to_string(),
            case: case.clone(),
            result: result.clone(),
            verdict: judgement.verdict,
            reason: judgement.reason.clone(),
            expected_normalized: judgement.expected_normalized.clone(),
            actual_normalized: judgement.actual_normalized.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisText {
    pub root_cause: String,
    pub suggested_fix: String,
    pub confidence: Option<f64>,
    pub request_hash: Option<String>,
}

pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    /// Must return promptly once `cancel` fires.
    fn analyze(
        &self,
        request: &AnalysisRequest,
        cancel: &CancelToken,
    ) -> Result<AnalysisText, AnalyzerError>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnalysisReport {
    pub case_id: String,
    pub analyzer: String,
    pub attempts: u32,
    pub analysis_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<String>,
}

impl AnalysisReport {
    fn completed(case_id: &str, analyzer: &str, attempts: u32, text: AnalysisText) -> Self {
        Self {
            case_id: case_id.to_string(),
            analyzer: analyzer.to_string(),
            attempts,
            analysis_failed: false,
            failure_reason: None,
            root_cause: Some(text.root_cause),
            suggested_fix: Some(text.suggested_fix),
            confidence: text.confidence,
            request_hash: text.request_hash,
        }
    }

    fn failed(case_id: &str, analyzer: &str, attempts: u32, reason: String) -> Self {
        Self {
            case_id: case_id.to_string(),
            analyzer: analyzer.to_string(),
            attempts,
            analysis_failed: true,
            failure_reason: Some(reason),
            root_cause: None,
            suggested_fix: None,
            confidence: None,
            request_hash: None,
        }
    }
}

/// Sends non-PASS cases to the analyzer with bounded time and attempts.
pub struct FailureRouter {
    analyzer: Arc<dyn Analyzer>,
    config: AnalyzerConfig,
}

impl FailureRouter {
    pub fn new(analyzer: Arc<dyn Analyzer>, config: AnalyzerConfig) -> Self {
        Self { analyzer, config }
    }

    /// One report per request, in request order. PASS requests are skipped
    /// by the caller; this never fails.
    pub fn route(&self, requests: Vec<AnalysisRequest>, cancel: &CancelToken) -> Vec<AnalysisReport> {
        if requests.is_empty() {
            return Vec::new();
        }

        let total = requests.len();
        let workers = self.config.workers.max(1).min(total);
        info!(cases = total, workers, analyzer = self.analyzer.name(), "analyzing failures");

        let (job_tx, job_rx) = unbounded::<(usize, Arc<AnalysisRequest>)>();
        let (out_tx, out_rx) = unbounded::<(usize, AnalysisReport)>();

        for (idx, req) in requests.into_iter().enumerate() {
            // Receiver is alive in this scope.
            let _ = job_tx.send((idx, Arc::new(req)));
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let out_tx = out_tx.clone();
                scope.spawn(move || {
                    for (idx, req) in job_rx.iter() {
                        let report = self.analyze_one(req, cancel);
                        let _ = out_tx.send((idx, report));
                    }
                });
            }
        });
        drop(out_tx);

        let mut reports: Vec<(usize, AnalysisReport)> = out_rx.iter().collect();
        reports.sort_by_key(|(idx, _)| *idx);
        reports.into_iter().map(|(_, r)| r).collect()
    }

    fn analyze_one(&self, req: Arc<AnalysisRequest>, cancel: &CancelToken) -> AnalysisReport {
        let name = self.analyzer.name().to_string();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = AnalyzerError::Cancelled;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                last_error = AnalyzerError::Cancelled;
                break;
            }
            attempts = attempt;

            match self.attempt(&req, cancel) {
                Ok(text) => {
                    debug!(case = %req.case.id, attempt, "analysis complete");
                    return AnalysisReport::completed(&req.case.id, &name, attempts, text);
                }
                Err(e) => {
                    warn!(case = %req.case.id, attempt, error = %e, "analysis attempt failed");
                    let retry = e.is_retryable();
                    last_error = e;
                    if !retry || attempt == max_attempts {
                        break;
                    }
                    let backoff = self.config.backoff() * 2u32.saturating_pow(attempt - 1);
                    sleep_unless_cancelled(backoff, cancel);
                }
            }
        }

        AnalysisReport::failed(&req.case.id, &name, attempts, last_error.to_string())
    }

    /// Runs one call on its own thread so a stuck analyzer cannot hold a
    /// router worker past the attempt timeout.
    fn attempt(
        &self,
        req: &Arc<AnalysisRequest>,
        cancel: &CancelToken,
    ) -> Result<AnalysisText, AnalyzerError> {
        let timeout = self.config.timeout();
        let token = cancel.child_with_timeout(timeout);
        let (tx, rx) = bounded(1);

        let analyzer = Arc::clone(&self.analyzer);
        let req = Arc::clone(req);
        thread::Builder::new()
            .name("analyzer-call".into())
            .spawn(move || {
                let out = panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(&req, &token)))
                    .unwrap_or(Err(AnalyzerError::Panicked));
                let _ = tx.send(out);
            })
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;

        match rx.recv_timeout(timeout) {
            Ok(out) => out,
            Err(RecvTimeoutError::Timeout) => Err(AnalyzerError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(AnalyzerError::Panicked),
        }
    }
}

fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) {
    let until = Instant::now() + total;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= until {
            break;
        }
        thread::sleep(BACKOFF_POLL.min(until - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{CaseInput, Expectation};
    use crate::normalize::Pipeline;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted<F> {
        calls: AtomicU32,
        respond: F,
    }

    impl<F> Scripted<F>
    where
        F: Fn(u32, &AnalysisRequest) -> Result<AnalysisText, AnalyzerError> + Send + Sync,
    {
        fn new(respond: F) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                respond,
            })
        }
    }

    impl<F> Analyzer for Scripted<F>
    where
        F: Fn(u32, &AnalysisRequest) -> Result<AnalysisText, AnalyzerError> + Send + Sync,
    {
        fn name(&self) -> &str {
            "scripted"
        }

        fn analyze(
            &self,
            request: &AnalysisRequest,
            _cancel: &CancelToken,
        ) -> Result<AnalysisText, AnalyzerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.respond)(n, request)
        }
    }

    fn config(max_attempts: u32, timeout_secs: f64) -> AnalyzerConfig {
        AnalyzerConfig {
            max_attempts,
            timeout_secs,
            backoff_ms: 1,
            workers: 2,
            ..AnalyzerConfig::default()
        }
    }

    fn request(id: &str) -> AnalysisRequest {
        let case = TestCase {
            id: id.into(),
            input: CaseInput::Text("1 2".into()),
            expected: Some(Expectation {
                stdout: Some("3".into()),
                exit_code: Some(0),
            }),
            normalizers: Pipeline::default(),
            tags: BTreeSet::new(),
            source: None,
            timeout_secs: None,
        };
        let result = CaseResult {
            case_id: id.into(),
            stdout: "4".into(),
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::from_millis(5),
            timed_out: false,
            fault: None,
        };
        let judgement = crate::compare::judge(&case, &result);
        AnalysisRequest::new("./prog", &case, &result, &judgement)
    }

    fn text(cause: &str) -> AnalysisText {
        AnalysisText {
            root_cause: cause.into(),
            suggested_fix: "fix it".into(),
            confidence: Some(0.5),
            request_hash: None,
        }
    }

    #[test]
    fn retries_transient_errors() {
        let analyzer = Scripted::new(|n, _| {
            if n < 2 {
                Err(AnalyzerError::Transport("reset".into()))
            } else {
                Ok(text("off by one"))
            }
        });
        let router = FailureRouter::new(analyzer.clone(), config(3, 5.0));
        let reports = router.route(vec![request("a")], &CancelToken::new());

        assert_eq!(reports.len(), 1);
        assert!(!reports[0].analysis_failed);
        assert_eq!(reports[0].attempts, 2);
        assert_eq!(reports[0].root_cause.as_deref(), Some("off by one"));
    }

    #[test]
    fn exhausted_attempts_mark_analysis_failed() {
        let analyzer = Scripted::new(|_, _| Err(AnalyzerError::Status { code: 503, body: "busy".into() }));
        let router = FailureRouter::new(analyzer.clone(), config(3, 5.0));
        let reports = router.route(vec![request("a")], &CancelToken::new());

        assert!(reports[0].analysis_failed);
        assert_eq!(reports[0].attempts, 3);
        assert!(reports[0].failure_reason.as_deref().unwrap_or("").contains("503"));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let analyzer = Scripted::new(|_, _| Err(AnalyzerError::Status { code: 401, body: "no key".into() }));
        let router = FailureRouter::new(analyzer.clone(), config(3, 5.0));
        let reports = router.route(vec![request("a")], &CancelToken::new());

        assert!(reports[0].analysis_failed);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slow_analyzer_times_out() {
        let analyzer = Scripted::new(|_, _| {
            thread::sleep(Duration::from_millis(500));
            Ok(text("late"))
        });
        let router = FailureRouter::new(analyzer, config(1, 0.05));
        let started = Instant::now();
        let reports = router.route(vec![request("a")], &CancelToken::new());

        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(reports[0].analysis_failed);
        assert_eq!(reports[0].failure_reason.as_deref(), Some("analyzer timed out"));
    }

    #[test]
    fn panicking_analyzer_is_contained() {
        let analyzer = Scripted::new(|_, _| panic!("boom"));
        let router = FailureRouter::new(analyzer, config(2, 5.0));
        let reports = router.route(vec![request("a"), request("b")], &CancelToken::new());

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.analysis_failed));
    }

    #[test]
    fn reports_follow_request_order() {
        let analyzer = Scripted::new(|_, req| {
            if req.case.id == "first" {
                thread::sleep(Duration::from_millis(50));
            }
            Ok(text(&req.case.id))
        });
        let router = FailureRouter::new(analyzer, config(1, 5.0));
        let reports = router.route(
            vec![request("first"), request("second"), request("third")],
            &CancelToken::new(),
        );

        let ids: Vec<&str> = reports.iter().map(|r| r.case_id.as_str()).collect();
        assert_eq!(ids, ["first", "second", "third"]);
    }

    #[test]
    fn cancelled_run_skips_analysis() {
        let analyzer = Scripted::new(|_, _| Ok(text("unused")));
        let router = FailureRouter::new(analyzer.clone(), config(3, 5.0));
        let cancel = CancelToken::new();
        cancel.cancel();
        let reports = router.route(vec![request("a")], &cancel);

        assert!(reports[0].analysis_failed);
        assert_eq!(reports[0].attempts, 0);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }
}
