use std::path::PathBuf;

/// Problems found while loading cases or configuration. Always fatal and
/// always raised before the first case is dispatched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("no test files matched {pattern}")]
    NoMatch { pattern: String },

    #[error("case {case_id}: missing required field `{field}`")]
    MissingField { case_id: String, field: &'static str },

    #[error("case {case_id}: field `{field}` {detail}")]
    InvalidField {
        case_id: String,
        field: &'static str,
        detail: String,
    },

    #[error("unknown normalizer `{name}`")]
    UnknownNormalizer { name: String },

    #[error("invalid pattern in `{normalizer}`: {detail}")]
    InvalidPattern { normalizer: String, detail: String },

    #[error("duplicate case id `{case_id}` (also defined in {first_seen})")]
    DuplicateId { case_id: String, first_seen: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Attaches a case id to a normalizer error raised while parsing that case.
    pub fn for_case(self, case_id: &str) -> Self {
        match self {
            ConfigError::UnknownNormalizer { name } => ConfigError::InvalidField {
                case_id: case_id.to_string(),
                field: "normalizers",
                detail: format!("names unknown normalizer `{name}`"),
            },
            ConfigError::InvalidPattern { normalizer, detail } => ConfigError::InvalidField {
                case_id: case_id.to_string(),
                field: "normalizers",
                detail: format!("`{normalizer}` has an invalid pattern: {detail}"),
            },
            other => other,
        }
    }
}

/// Broken internal invariants detected while assembling the report.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("case {case_id} was dispatched but produced no result")]
    MissingResult { case_id: String },

    #[error("result at slot {slot} does not belong to any dispatched case")]
    UnknownSlot { slot: usize },

    #[error("case {case_id} produced more than one result")]
    DuplicateResult { case_id: String },

    #[error("result slot {slot} carries case id {found}, expected {expected}")]
    MismatchedResult {
        slot: usize,
        expected: String,
        found: String,
    },

    #[error("analysis for {case_id} does not match a dispatched non-passing case")]
    StrayAnalysis { case_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("internal aggregation failure: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("report output failed for {path}: {detail}")]
    Report { path: PathBuf, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RunResult<T> = Result<T, RunError>;
