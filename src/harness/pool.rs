// Bounded worker pool. Cases are handed out one at a time in priority
// order; results come back in completion order and carry the dispatch slot
// so the report can restore the original order.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, SendTimeoutError};
use tracing::{debug, error, info};

use crate::cancel::CancelToken;
use crate::harness::{CaseResult, CaseRun, ExecutionFault};
use crate::prioritize::PlannedCase;

const DISPATCH_POLL: Duration = Duration::from_millis(50);

/// Append-only collection shared by the workers.
#[derive(Default)]
pub struct ResultCollector {
    entries: Mutex<Vec<(usize, CaseRun)>>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, slot: usize, run: CaseRun) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push((slot, run)),
            // A worker that panicked while holding the lock cannot have left
            // a half-written push behind.
            Err(poisoned) => poisoned.into_inner().push((slot, run)),
        }
    }

    pub fn into_entries(self) -> Vec<(usize, CaseRun)> {
        match self.entries.into_inner() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug)]
pub struct PoolOutcome {
    /// (dispatch slot, run) in completion order.
    pub runs: Vec<(usize, CaseRun)>,
    /// Number of cases handed to a worker; slots `0..dispatched`.
    pub dispatched: usize,
    pub truncated: bool,
}

/// Runs `exec` over `cases` with `workers` threads. Once `cancel` fires no
/// further case is dispatched; cases already running are left to finish.
pub fn run_pool<F>(
    cases: &[PlannedCase],
    workers: usize,
    cancel: &CancelToken,
    exec: F,
) -> PoolOutcome
where
    F: Fn(&PlannedCase) -> CaseRun + Sync,
{
    let workers = workers.max(1).min(cases.len().max(1));
    let collector = ResultCollector::new();
    let mut dispatched = 0usize;
    let mut truncated = false;

    info!(cases = cases.len(), workers, "dispatching cases");

    thread::scope(|scope| {
        let (tx, rx) = bounded::<(usize, &PlannedCase)>(0);

        for worker in 0..workers {
            let rx = rx.clone();
            let collector = &collector;
            let exec = &exec;
            scope.spawn(move || {
                for (slot, planned) in rx.iter() {
                    debug!(worker, slot, case = %planned.case.id, "case started");
                    let run = panic::catch_unwind(AssertUnwindSafe(|| exec(planned)))
                        .unwrap_or_else(|_| {
                            error!(case = %planned.case.id, "harness panicked while running case");
                            CaseRun {
                                result: CaseResult::faulted(
                                    &planned.case.id,
                                    ExecutionFault::Internal {
                                        detail: "harness panicked".into(),
                                    },
                                    Duration::ZERO,
                                ),
                                attempts: 1,
                                tally: None,
                            }
                        });
                    collector.push(slot, run);
                }
            });
        }
        drop(rx);

        'dispatch: for (slot, planned) in cases.iter().enumerate() {
            let mut job = (slot, planned);
            loop {
                if cancel.is_cancelled() {
                    truncated = true;
                    break 'dispatch;
                }
                match tx.send_timeout(job, DISPATCH_POLL) {
                    Ok(()) => {
                        dispatched += 1;
                        break;
                    }
                    Err(SendTimeoutError::Timeout(back)) => job = back,
                    Err(SendTimeoutError::Disconnected(_)) => {
                        truncated = true;
                        break 'dispatch;
                    }
                }
            }
        }

        drop(tx);
    });

    if truncated {
        info!(
            dispatched,
            skipped = cases.len() - dispatched,
            "run cancelled, dispatch stopped"
        );
    }

    PoolOutcome {
        runs: collector.into_entries(),
        dispatched,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{CaseInput, TestCase};
    use crate::normalize::Pipeline;
    use std::collections::BTreeSet;

    fn plan(ids: &[&str]) -> Vec<PlannedCase> {
        ids.iter()
            .map(|id| PlannedCase {
                case: TestCase {
                    id: id.to_string(),
                    input: CaseInput::Text(String::new()),
                    expected: None,
                    normalizers: Pipeline::default(),
                    tags: BTreeSet::new(),
                    source: None,
                    timeout_secs: None,
                },
                samples: 1,
            })
            .collect()
    }

    fn ok(id: &str) -> CaseRun {
        CaseRun {
            result: CaseResult {
                case_id: id.to_string(),
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
                duration: Duration::ZERO,
                timed_out: false,
                fault: None,
            },
            attempts: 1,
            tally: None,
        }
    }

    #[test]
    fn every_case_comes_back_with_its_slot() {
        let cases = plan(&["a", "b", "c", "d"]);
        let outcome = run_pool(&cases, 3, &CancelToken::new(), |p| {
            if p.case.id == "a" {
                thread::sleep(Duration::from_millis(80));
            }
            ok(&p.case.id)
        });

        assert_eq!(outcome.dispatched, 4);
        assert!(!outcome.truncated);
        let mut slots: Vec<(usize, String)> = outcome
            .runs
            .iter()
            .map(|(s, r)| (*s, r.result.case_id.clone()))
            .collect();
        // "a" is slow, so it cannot have completed first.
        assert_ne!(slots[0].1, "a");
        slots.sort();
        assert_eq!(
            slots,
            vec![(0, "a".into()), (1, "b".into()), (2, "c".into()), (3, "d".into())]
        );
    }

    #[test]
    fn panicking_case_becomes_internal_fault() {
        let cases = plan(&["boom", "fine"]);
        let outcome = run_pool(&cases, 2, &CancelToken::new(), |p| {
            if p.case.id == "boom" {
                panic!("exec blew up");
            }
            ok(&p.case.id)
        });

        assert_eq!(outcome.runs.len(), 2);
        let boom = outcome.runs.iter().find(|(s, _)| *s == 0).unwrap();
        assert!(matches!(
            boom.1.result.fault,
            Some(ExecutionFault::Internal { .. })
        ));
    }

    #[test]
    fn cancellation_stops_dispatch() {
        let cases = plan(&["a", "b", "c"]);
        let cancel = CancelToken::new();
        let outcome = run_pool(&cases, 1, &cancel, |p| {
            cancel.cancel();
            thread::sleep(Duration::from_millis(100));
            ok(&p.case.id)
        });

        assert!(outcome.truncated);
        assert_eq!(outcome.dispatched, 1);
        assert_eq!(outcome.runs.len(), 1);
    }
}
