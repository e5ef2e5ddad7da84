// One run end to end: select, execute, analyze failures, aggregate, emit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::analyzer::client::LlmAnalyzer;
use crate::analyzer::{AnalysisReport, AnalysisRequest, Analyzer, FailureRouter};
use crate::cancel::CancelToken;
use crate::case::TestCase;
use crate::compare::judge;
use crate::config::{ReportConfig, RunConfig};
use crate::error::RunResult;
use crate::harness::pool::{run_pool, PoolOutcome};
use crate::harness::Harness;
use crate::history::{HistoryRun, RunHistory};
use crate::prioritize::{PlannedCase, Prioritizer, Selection};
use crate::report::junit::write_junit;
use crate::report::{aggregate, report_error, RunMeta, RunReport};

/// Dedup, flaky handling and ordering without executing anything.
pub fn plan(config: &RunConfig, cases: Vec<TestCase>) -> RunResult<Selection> {
    let history = load_history(&config.report)?;
    Ok(Prioritizer::new(config.selection.clone()).select(cases, history.as_ref()))
}

fn load_history(report: &ReportConfig) -> RunResult<Option<RunHistory>> {
    match &report.history {
        Some(path) => Ok(Some(RunHistory::load(path)?)),
        None => Ok(None),
    }
}

pub struct Runner {
    config: RunConfig,
    analyzer: Option<Arc<dyn Analyzer>>,
}

impl Runner {
    /// Fails fast on an invalid configuration.
    pub fn new(config: RunConfig) -> RunResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            analyzer: None,
        })
    }

    /// Builds the configured LLM analyzer when analysis is enabled. A
    /// client that cannot be built disables analysis for the run.
    pub fn with_default_analyzer(mut self) -> Self {
        if !self.config.analyzer.enabled {
            return self;
        }
        match LlmAnalyzer::new(&self.config.analyzer) {
            Ok(a) => self.analyzer = Some(Arc::new(a)),
            Err(e) => warn!(error = %e, "analyzer unavailable, continuing without analysis"),
        }
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// `cancel` stops dispatch when fired; the run timeout, if any, is
    /// layered on top of it. Analysis of finished cases still happens after
    /// a run timeout but not after an explicit cancel.
    pub fn run(&self, cases: Vec<TestCase>, cancel: &CancelToken) -> RunResult<RunReport> {
        let mut history = load_history(&self.config.report)?;
        let selection = Prioritizer::new(self.config.selection.clone()).select(cases, history.as_ref());
        let mut meta = RunMeta::start(&self.config.report.suite_name);

        info!(
            run_id = %meta.run_id,
            planned = selection.planned.len(),
            dropped = selection.meta.dropped.len(),
            "run started"
        );

        let dispatch_token = match self.config.execution.run_timeout_secs {
            Some(secs) => cancel.child_with_timeout(Duration::from_secs_f64(secs)),
            None => cancel.clone(),
        };

        let outcome = self.execute(&selection.planned, &dispatch_token);
        let analyses = self.analyze(&selection.planned, &outcome, cancel);

        meta.finish();
        let report = aggregate(meta, &selection.planned, outcome, analyses, selection.meta)?;

        info!(
            total = report.summary.total,
            pass = report.summary.pass,
            fail = report.summary.fail,
            error = report.summary.error,
            truncated = report.truncated,
            "run finished"
        );

        self.write_outputs(&report)?;
        if self.config.report.record_history {
            if let (Some(path), Some(h)) = (&self.config.report.history, history.as_mut()) {
                let verdicts: BTreeMap<String, _> = report
                    .verdicts()
                    .map(|(id, v)| (id.to_string(), v))
                    .collect();
                h.record(HistoryRun::new(verdicts));
                h.save(path).map_err(|e| report_error(path, e))?;
            }
        }

        Ok(report)
    }

    fn execute(&self, planned: &[PlannedCase], cancel: &CancelToken) -> PoolOutcome {
        let harness = Harness::new(self.config.program.clone(), self.config.execution.clone());
        run_pool(planned, self.config.execution.workers, cancel, |p| {
            harness.run_case(&p.case, p.samples, cancel)
        })
    }

    fn analyze(
        &self,
        planned: &[PlannedCase],
        outcome: &PoolOutcome,
        cancel: &CancelToken,
    ) -> Vec<AnalysisReport> {
        let Some(analyzer) = self.analyzer.as_ref().filter(|_| self.config.analyzer.enabled) else {
            return Vec::new();
        };

        let mut finished: Vec<_> = outcome
            .runs
            .iter()
            .filter_map(|(slot, run)| planned.get(*slot).map(|p| (*slot, &p.case, &run.result)))
            .collect();
        finished.sort_by_key(|(slot, _, _)| *slot);

        let requests: Vec<AnalysisRequest> = finished
            .into_iter()
            .filter_map(|(_, case, result)| {
                let judgement = judge(case, result);
                (!judgement.verdict.is_pass()).then(|| {
                    AnalysisRequest::new(&self.config.program.command, case, result, &judgement)
                })
            })
            .collect();

        FailureRouter::new(Arc::clone(analyzer), self.config.analyzer.clone()).route(requests, cancel)
    }

    fn write_outputs(&self, report: &RunReport) -> RunResult<()> {
        if let Some(path) = &self.config.report.json {
            report.write_json(path)?;
            info!(path = %path.display(), "JSON report written");
        }
        if let Some(path) = &self.config.report.junit {
            write_junit(report, path)?;
            info!(path = %path.display(), "JUnit report written");
        }
        Ok(())
    }
}

