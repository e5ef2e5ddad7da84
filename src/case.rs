// Test-case model and case-file loading.
//
// Two file shapes are accepted. The canonical one is a mapping from case id
// to its definition; the legacy one is an older list format (`name` +
// `normalize` flags). Both end up as `TestCase`.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::config::is_valid_timeout;
use crate::error::ConfigError;
use crate::normalize::{Normalizer, Pipeline};

/// What is fed to the program under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaseInput {
    Text(String),
    Args(Vec<String>),
}

impl CaseInput {
    pub fn as_text(&self) -> String {
        match self {
            CaseInput::Text(s) => s.clone(),
            CaseInput::Args(args) => args.join(" "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Expectation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestCase {
    pub id: String,
    pub input: CaseInput,
    /// `None` puts the case in recording mode: the output is captured but
    /// not judged.
    pub expected: Option<Expectation>,
    #[serde(serialize_with = "serialize_pipeline")]
    pub normalizers: Pipeline,
    pub tags: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

impl TestCase {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn is_recording(&self) -> bool {
        self.expected.is_none()
    }
}

fn serialize_pipeline<S: Serializer>(p: &Pipeline, s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(p.steps().iter().map(|n| n.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawExpected {
    Text(String),
    Full {
        stdout: Option<String>,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Deserialize)]
struct RawCase {
    input: Option<CaseInput>,
    expected: Option<RawExpected>,
    #[serde(default)]
    normalizers: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    source: Option<String>,
    timeout: Option<f64>,
    exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct LegacyNormalize {
    regex_extract: Option<String>,
    strip: Option<bool>,
    #[serde(default)]
    collapse_ws: bool,
    #[serde(default)]
    lower: bool,
    #[serde(default)]
    sort_lines: bool,
}

#[derive(Debug, Deserialize)]
struct LegacyCase {
    name: Option<String>,
    input: Option<String>,
    expected: Option<String>,
    timeout: Option<f64>,
    normalize: Option<LegacyNormalize>,
    #[serde(default)]
    tags: Vec<String>,
    source: Option<String>,
}

/// Expands glob patterns and loads every matching file, in pattern order.
/// Case ids must be unique across all files.
pub fn load_patterns(patterns: &[String]) -> Result<Vec<TestCase>, ConfigError> {
    let mut paths: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let literal = Path::new(pattern);
        if literal.exists() {
            paths.push(literal.to_path_buf());
            continue;
        }

        let matches = glob::glob(pattern).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let mut found: Vec<PathBuf> = matches.filter_map(Result::ok).collect();
        if found.is_empty() {
            return Err(ConfigError::NoMatch {
                pattern: pattern.clone(),
            });
        }
        found.sort();
        paths.extend(found);
    }

    let mut cases = Vec::new();
    let mut seen: HashMap<String, String> = HashMap::new();

    for path in paths {
        let origin = path.display().to_string();
        for case in load_file(&path)? {
            if let Some(first) = seen.get(&case.id) {
                return Err(ConfigError::DuplicateId {
                    case_id: case.id,
                    first_seen: first.clone(),
                });
            }
            seen.insert(case.id.clone(), origin.clone());
            cases.push(case);
        }
    }

    Ok(cases)
}

pub fn load_file(path: &Path) -> Result<Vec<TestCase>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "yaml" | "yml"))
        .unwrap_or(false);

    let doc = if is_yaml {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&raw).map_err(|e| parse_error(path, e.to_string()))?;
        serde_json::to_value(yaml).map_err(|e| parse_error(path, e.to_string()))?
    } else {
        serde_json::from_str(&raw).map_err(|e| parse_error(path, e.to_string()))?
    };

    parse_document(doc).map_err(|e| match e {
        ConfigError::Parse { detail, .. } => parse_error(path, detail),
        other => other,
    })
}

/// Parses an already-decoded document. Order of the returned cases is the
/// order of the document.
pub fn parse_document(doc: Value) -> Result<Vec<TestCase>, ConfigError> {
    let cases = match doc {
        Value::Object(map) => map
            .into_iter()
            .map(|(id, body)| parse_canonical(id, body))
            .collect::<Result<Vec<_>, _>>()?,
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, body)| parse_legacy(i + 1, body))
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(parse_error(
                Path::new("<document>"),
                "expected a mapping of case id to case, or a list of cases".into(),
            ))
        }
    };

    let mut seen: HashMap<&str, ()> = HashMap::new();
    for case in &cases {
        if seen.insert(case.id.as_str(), ()).is_some() {
            return Err(ConfigError::DuplicateId {
                case_id: case.id.clone(),
                first_seen: "the same file".into(),
            });
        }
    }

    Ok(cases)
}

fn parse_canonical(id: String, body: Value) -> Result<TestCase, ConfigError> {
    if id.trim().is_empty() {
        return Err(ConfigError::Invalid("case id cannot be empty".into()));
    }
    if !body.is_object() {
        return Err(ConfigError::InvalidField {
            case_id: id,
            field: "<case>",
            detail: "must be a mapping".into(),
        });
    }

    let raw: RawCase = serde_json::from_value(body).map_err(|e| ConfigError::InvalidField {
        case_id: id.clone(),
        field: "<case>",
        detail: e.to_string(),
    })?;

    let input = raw.input.ok_or_else(|| ConfigError::MissingField {
        case_id: id.clone(),
        field: "input",
    })?;

    let mut expected = match raw.expected {
        None => None,
        Some(RawExpected::Text(stdout)) => Some(Expectation {
            stdout: Some(stdout),
            exit_code: None,
        }),
        Some(RawExpected::Full { stdout, exit_code }) => {
            if stdout.is_none() && exit_code.is_none() {
                return Err(ConfigError::InvalidField {
                    case_id: id,
                    field: "expected",
                    detail: "must name `stdout` or `exit_code`".into(),
                });
            }
            Some(Expectation { stdout, exit_code })
        }
    };

    if let Some(code) = raw.exit_code {
        let exp = expected.get_or_insert(Expectation {
            stdout: None,
            exit_code: None,
        });
        exp.exit_code = Some(code);
    }

    let normalizers = Pipeline::parse(&raw.normalizers).map_err(|e| e.for_case(&id))?;
    let timeout_secs = validate_timeout(&id, raw.timeout)?;

    Ok(TestCase {
        id,
        input,
        expected,
        normalizers,
        tags: raw.tags.into_iter().collect(),
        source: raw.source,
        timeout_secs,
    })
}

fn parse_legacy(position: usize, body: Value) -> Result<TestCase, ConfigError> {
    let fallback_id = format!("case_{position}");
    let raw: LegacyCase = serde_json::from_value(body).map_err(|e| ConfigError::InvalidField {
        case_id: fallback_id.clone(),
        field: "<case>",
        detail: e.to_string(),
    })?;

    let id = raw.name.unwrap_or(fallback_id);
    let input = raw.input.ok_or_else(|| ConfigError::MissingField {
        case_id: id.clone(),
        field: "input",
    })?;

    let mut steps = Vec::new();
    match raw.normalize {
        Some(n) => {
            if let Some(pattern) = n.regex_extract.filter(|p| !p.is_empty()) {
                // Legacy patterns let `.` cross line breaks.
                let step = Normalizer::parse(&format!("regex_first((?s){pattern})"))
                    .map_err(|e| e.for_case(&id))?;
                steps.push(step);
            }
            if n.strip.unwrap_or(true) {
                steps.push(Normalizer::Strip);
            }
            if n.collapse_ws {
                steps.push(Normalizer::CollapseWs);
            }
            if n.lower {
                steps.push(Normalizer::Lower);
            }
            if n.sort_lines {
                steps.push(Normalizer::RstripLines);
                steps.push(Normalizer::SortLines);
            }
        }
        None => steps.push(Normalizer::Strip),
    }

    // The legacy format always expected a clean exit.
    let expected = raw.expected.map(|stdout| Expectation {
        stdout: Some(stdout),
        exit_code: Some(0),
    });

    let timeout_secs = validate_timeout(&id, raw.timeout)?;

    Ok(TestCase {
        id,
        input: CaseInput::Text(input),
        expected,
        normalizers: Pipeline::new(steps),
        tags: raw.tags.into_iter().collect(),
        source: raw.source,
        timeout_secs,
    })
}

fn validate_timeout(id: &str, timeout: Option<f64>) -> Result<Option<f64>, ConfigError> {
    match timeout {
        Some(t) if !is_valid_timeout(t) => Err(ConfigError::InvalidField {
            case_id: id.to_string(),
            field: "timeout",
            detail: format!("must be a positive number of seconds, got {t}"),
        }),
        other => Ok(other),
    }
}

fn parse_error(path: &Path, detail: String) -> ConfigError {
    ConfigError::Parse {
        path: path.to_path_buf(),
        detail,
    }
}
