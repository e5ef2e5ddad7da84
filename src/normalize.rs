// Pure text transforms applied to expected and actual output before comparison.

use std::fmt;

use regex::Regex;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub enum Normalizer {
    Strip,
    CollapseWs,
    Lower,
    SortLines,
    /// Trailing whitespace removed from every line.
    RstripLines,
    /// Concatenation of every non-overlapping match. When the pattern has
    /// capturing groups, the groups of each match are joined instead.
    RegexExtract(Regex),
    /// Capture group 1 of the first match, or the input unchanged when the
    /// pattern does not match. Used by legacy case files.
    RegexFirst(Regex),
}

impl Normalizer {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();

        if let Some((name, pattern)) = split_call(spec) {
            let build = |pattern: &str| {
                Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                    normalizer: spec.to_string(),
                    detail: e.to_string(),
                })
            };

            return match name {
                "regex_extract" => Ok(Normalizer::RegexExtract(build(pattern)?)),
                "regex_first" => Ok(Normalizer::RegexFirst(build(pattern)?)),
                _ => Err(ConfigError::UnknownNormalizer {
                    name: name.to_string(),
                }),
            };
        }

        match spec {
            "strip" => Ok(Normalizer::Strip),
            "collapse_ws" => Ok(Normalizer::CollapseWs),
            "lower" => Ok(Normalizer::Lower),
            "sort_lines" => Ok(Normalizer::SortLines),
            "rstrip_lines" => Ok(Normalizer::RstripLines),
            _ => Err(ConfigError::UnknownNormalizer {
                name: spec.to_string(),
            }),
        }
    }

    pub fn apply(&self, input: &str) -> String {
        match self {
            Normalizer::Strip => input.trim().to_string(),
            Normalizer::CollapseWs => collapse_ws(input),
            Normalizer::Lower => input.to_lowercase(),
            Normalizer::SortLines => {
                let mut lines: Vec<&str> = input.lines().collect();
                lines.sort_unstable();
                lines.join("\n")
            }
            Normalizer::RstripLines => input
                .lines()
                .map(str::trim_end)
                .collect::<Vec<_>>()
                .join("\n"),
            Normalizer::RegexExtract(re) => extract_all(re, input),
            Normalizer::RegexFirst(re) => match re.captures(input) {
                Some(caps) => caps
                    .get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                None => input.to_string(),
            },
        }
    }
}

impl fmt::Display for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Normalizer::Strip => write!(f, "strip"),
            Normalizer::CollapseWs => write!(f, "collapse_ws"),
            Normalizer::Lower => write!(f, "lower"),
            Normalizer::SortLines => write!(f, "sort_lines"),
            Normalizer::RstripLines => write!(f, "rstrip_lines"),
            Normalizer::RegexExtract(re) => write!(f, "regex_extract({})", re.as_str()),
            Normalizer::RegexFirst(re) => write!(f, "regex_first({})", re.as_str()),
        }
    }
}

impl PartialEq for Normalizer {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for Normalizer {}

/// An ordered list of transforms. Order is kept exactly as configured;
/// nothing is reordered or deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    steps: Vec<Normalizer>,
}

impl Pipeline {
    pub fn new(steps: Vec<Normalizer>) -> Self {
        Self { steps }
    }

    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        let steps = names
            .iter()
            .map(|n| Normalizer::parse(n.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }

    pub fn apply(&self, input: &str) -> String {
        self.steps
            .iter()
            .fold(input.to_string(), |acc, step| step.apply(&acc))
    }

    pub fn steps(&self) -> &[Normalizer] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Stable textual form, used for dedup keys and reports.
    pub fn canonical(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn split_call(spec: &str) -> Option<(&str, &str)> {
    let open = spec.find('(')?;
    if !spec.ends_with(')') {
        return None;
    }
    let name = spec[..open].trim();
    let arg = &spec[open + 1..spec.len() - 1];
    Some((name, arg))
}

fn collapse_ws(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_ws = false;

    for c in input.chars() {
        if c.is_whitespace() {
            if !in_ws {
                out.push(' ');
            }
            in_ws = true;
        } else {
            out.push(c);
            in_ws = false;
        }
    }

    out
}

fn extract_all(re: &Regex, input: &str) -> String {
    let has_groups = re.captures_len() > 1;
    let mut out = String::new();

    for caps in re.captures_iter(input) {
        if has_groups {
            for group in caps.iter().skip(1).flatten() {
                out.push_str(group.as_str());
            }
        } else if let Some(m) = caps.get(0) {
            out.push_str(m.as_str());
        }
    }

    out
}
