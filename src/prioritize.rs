// Dedup & prioritization: shrinks the loaded case set, flags flaky cases
// from run history, orders the remainder for tag coverage and applies the
// size budget. Every case that does not make it into the plan is recorded
// with the reason.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::case::{CaseInput, TestCase};
use crate::config::{FlakyPolicy, SelectionConfig};
use crate::history::RunHistory;

#[derive(Debug, Clone)]
pub struct PlannedCase {
    pub case: TestCase,
    /// Invocations to take; above 1 only for sampled flaky cases.
    pub samples: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    Duplicate { of: String },
    ConflictingExpectation { of: String },
    Flaky { failure_rate: f64, observations: usize },
    OverBudget,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedCase {
    pub case_id: String,
    #[serde(flatten)]
    pub reason: DropReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlakyAction {
    Excluded,
    Sampled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlakyCase {
    pub case_id: String,
    pub failure_rate: f64,
    pub observations: usize,
    pub action: FlakyAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelectionMeta {
    pub loaded: usize,
    pub selected: usize,
    pub duplicates_dropped: usize,
    pub dropped: Vec<DroppedCase>,
    pub flaky: Vec<FlakyCase>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub planned: Vec<PlannedCase>,
    pub meta: SelectionMeta,
}

pub struct Prioritizer {
    config: SelectionConfig,
}

impl Prioritizer {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    pub fn select(&self, cases: Vec<TestCase>, history: Option<&RunHistory>) -> Selection {
        let mut meta = SelectionMeta {
            loaded: cases.len(),
            ..SelectionMeta::default()
        };

        let unique = if self.config.dedup {
            dedup(cases, &mut meta)
        } else {
            cases
        };

        let mut planned = Vec::with_capacity(unique.len());
        for case in unique {
            match history.and_then(|h| self.flaky_verdict(h, &case)) {
                Some((rate, observations)) => match self.config.flaky_policy {
                    FlakyPolicy::Exclude => {
                        meta.flaky.push(FlakyCase {
                            case_id: case.id.clone(),
                            failure_rate: rate,
                            observations,
                            action: FlakyAction::Excluded,
                        });
                        meta.dropped.push(DroppedCase {
                            case_id: case.id,
                            reason: DropReason::Flaky {
                                failure_rate: rate,
                                observations,
                            },
                        });
                    }
                    FlakyPolicy::Sample => {
                        meta.flaky.push(FlakyCase {
                            case_id: case.id.clone(),
                            failure_rate: rate,
                            observations,
                            action: FlakyAction::Sampled,
                        });
                        planned.push(PlannedCase {
                            case,
                            samples: self.config.flaky_samples.max(1),
                        });
                    }
                },
                None => planned.push(PlannedCase { case, samples: 1 }),
            }
        }

        let mut ordered = coverage_order(planned);

        if let Some(max) = self.config.max_cases {
            if ordered.len() > max {
                for p in ordered.drain(max..) {
                    meta.dropped.push(DroppedCase {
                        case_id: p.case.id,
                        reason: DropReason::OverBudget,
                    });
                }
            }
        }

        meta.selected = ordered.len();
        info!(
            loaded = meta.loaded,
            selected = meta.selected,
            duplicates = meta.duplicates_dropped,
            flaky = meta.flaky.len(),
            "case selection finished"
        );

        Selection {
            planned: ordered,
            meta,
        }
    }

    /// `Some((failure_rate, observations))` when history marks the case flaky.
    fn flaky_verdict(&self, history: &RunHistory, case: &TestCase) -> Option<(f64, usize)> {
        let stats = history.stats(&case.id, self.config.flaky_window);
        if stats.observations < self.config.flaky_min_runs.max(1) {
            return None;
        }
        let rate = stats.failure_rate();
        // A case that never passes is failing consistently, not flaky.
        if rate > self.config.flaky_threshold && stats.passes > 0 {
            debug!(case = %case.id, rate, observations = stats.observations, "flaky case");
            Some((rate, stats.observations))
        } else {
            None
        }
    }
}

/// Identity of a case for deduplication: its input with CRLF line endings
/// folded to LF, the input form, and the canonical normalizer list.
pub fn dedup_key(case: &TestCase) -> String {
    let mut h = Sha256::new();
    match &case.input {
        CaseInput::Text(text) => {
            h.update(b"text\0");
            h.update(text.replace("\r\n", "\n").as_bytes());
        }
        CaseInput::Args(args) => {
            h.update(b"args\0");
            for a in args {
                h.update(a.as_bytes());
                h.update(b"\0");
            }
        }
    }
    h.update(b"\0");
    h.update(case.normalizers.canonical().as_bytes());
    hex::encode(h.finalize())
}

fn dedup(cases: Vec<TestCase>, meta: &mut SelectionMeta) -> Vec<TestCase> {
    let mut kept: Vec<TestCase> = Vec::with_capacity(cases.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for case in cases {
        let key = dedup_key(&case);
        match index.get(&key) {
            Some(&i) => {
                let representative = &kept[i];
                let reason = if representative.expected == case.expected {
                    DropReason::Duplicate {
                        of: representative.id.clone(),
                    }
                } else {
                    DropReason::ConflictingExpectation {
                        of: representative.id.clone(),
                    }
                };
                debug!(case = %case.id, kept = %representative.id, "duplicate dropped");
                meta.duplicates_dropped += 1;
                meta.dropped.push(DroppedCase {
                    case_id: case.id,
                    reason,
                });
            }
            None => {
                index.insert(key, kept.len());
                kept.push(case);
            }
        }
    }

    kept
}

/// Round-robin across tag groups so that a truncated prefix still covers
/// as many groups as possible. A case belongs to the group of its smallest
/// tag; untagged cases share one group. Groups take turns in order of first
/// appearance and keep their internal order.
fn coverage_order(cases: Vec<PlannedCase>) -> Vec<PlannedCase> {
    let total = cases.len();
    let mut group_of: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<std::collections::VecDeque<PlannedCase>> = Vec::new();

    for p in cases {
        let key = p.case.tags.iter().next().cloned().unwrap_or_default();
        let idx = *group_of.entry(key).or_insert_with(|| {
            groups.push(std::collections::VecDeque::new());
            groups.len() - 1
        });
        groups[idx].push_back(p);
    }

    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        for g in groups.iter_mut() {
            if let Some(p) = g.pop_front() {
                out.push(p);
            }
        }
    }
    out
}
