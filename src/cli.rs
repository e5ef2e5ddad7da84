use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use tracing::info;

use crate::cancel::CancelToken;
use crate::case::load_patterns;
use crate::config::{InputChannel, RunConfig};
use crate::prioritize::{DropReason, Selection};
use crate::report::console;
use crate::runner::{plan, Runner};
use crate::scaffold;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, help = "Command under test, e.g. 'python3 prog.py' or './bin'")]
    pub cmd: Option<String>,

    #[arg(
        long,
        required = true,
        num_args = 1..,
        help = "Case files (.json/.yaml) or glob patterns"
    )]
    pub tests: Vec<String>,

    #[arg(long, help = "Config file (default: <config dir>/agentest/config.toml)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Write a JUnit XML report to this path")]
    pub junit: Option<PathBuf>,

    #[arg(long, help = "Write the full JSON run report to this path")]
    pub json: Option<PathBuf>,

    #[arg(long, default_value_t = false, help = "Disable LLM failure analysis")]
    pub no_llm: bool,

    #[arg(long, help = "Parallel workers")]
    pub workers: Option<usize>,

    #[arg(long, help = "Default per-case timeout in seconds")]
    pub timeout: Option<f64>,

    #[arg(long, help = "Stop dispatching new cases after this many seconds")]
    pub run_timeout: Option<f64>,

    #[arg(long, help = "Keep at most this many cases after prioritization")]
    pub max_cases: Option<usize>,

    #[arg(long, help = "Extra attempts for cases that do not pass")]
    pub retries: Option<u32>,

    #[arg(long, help = "Run history JSON used for flaky-case detection")]
    pub history: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = false,
        help = "Append this run's verdicts to the history file"
    )]
    pub record_history: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Deliver string input as whitespace-split arguments instead of stdin"
    )]
    pub args: bool,

    #[arg(long, help = "Suite name used in reports")]
    pub suite: Option<String>,
}

impl RunArgs {
    /// CLI flags win over the config file.
    pub fn apply(&self, cfg: &mut RunConfig) {
        if let Some(cmd) = &self.cmd {
            cfg.program.command = cmd.clone();
        }
        if self.args {
            cfg.program.input_channel = InputChannel::Args;
        }
        if let Some(t) = self.timeout {
            cfg.program.timeout_secs = t;
        }
        if let Some(w) = self.workers {
            cfg.execution.workers = w;
        }
        if let Some(t) = self.run_timeout {
            cfg.execution.run_timeout_secs = Some(t);
        }
        if let Some(r) = self.retries {
            cfg.execution.retry_attempts = r;
        }
        if let Some(n) = self.max_cases {
            cfg.selection.max_cases = Some(n);
        }
        if self.no_llm {
            cfg.analyzer.enabled = false;
        }
        if let Some(p) = &self.junit {
            cfg.report.junit = Some(p.clone());
        }
        if let Some(p) = &self.json {
            cfg.report.json = Some(p.clone());
        }
        if let Some(p) = &self.history {
            cfg.report.history = Some(p.clone());
        }
        if self.record_history {
            cfg.report.record_history = true;
        }
        if let Some(s) = &self.suite {
            cfg.report.suite_name = s.clone();
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    #[arg(long, required = true, num_args = 1.., help = "Case files or glob patterns")]
    pub tests: Vec<String>,

    #[arg(long, help = "Config file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Run history JSON used for flaky-case detection")]
    pub history: Option<PathBuf>,

    #[arg(long, help = "Keep at most this many cases after prioritization")]
    pub max_cases: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = ".", help = "Directory to write the sample files into")]
    pub dir: PathBuf,

    #[arg(long, default_value_t = false, help = "Overwrite existing files")]
    pub force: bool,
}

pub fn run(args: RunArgs) -> Result<ExitCode, Box<dyn Error>> {
    let mut cfg = RunConfig::load(args.config.as_deref())?;
    cfg.analyzer.apply_env();
    args.apply(&mut cfg);

    let cases = load_patterns(&args.tests)?;
    info!(cases = cases.len(), "cases loaded");

    let runner = Runner::new(cfg)?.with_default_analyzer();

    let cancel = CancelToken::new();
    cancel.register_signals()?;

    let report = runner.run(cases, &cancel)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    console::render(&report, &mut out)?;
    out.flush()?;

    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

pub fn check(args: CheckArgs) -> Result<ExitCode, Box<dyn Error>> {
    let mut cfg = RunConfig::load(args.config.as_deref())?;
    if let Some(p) = args.history {
        cfg.report.history = Some(p);
    }
    if let Some(n) = args.max_cases {
        cfg.selection.max_cases = Some(n);
    }

    let cases = load_patterns(&args.tests)?;
    let selection = plan(&cfg, cases)?;
    print_plan(&selection);
    Ok(ExitCode::SUCCESS)
}

pub fn init(args: InitArgs) -> Result<ExitCode, Box<dyn Error>> {
    let written = scaffold::init(&args.dir, args.force)?;
    for path in &written {
        println!("wrote {}", path.display());
    }
    println!(
        "\nTry:\n  agentest run --cmd \"python3 {}\" --tests {} --no-llm",
        args.dir.join(scaffold::PROGRAM_FILE).display(),
        args.dir.join(scaffold::CASES_FILE).display()
    );
    Ok(ExitCode::SUCCESS)
}

fn print_plan(selection: &Selection) {
    let meta = &selection.meta;
    println!(
        "{} loaded, {} selected, {} duplicate(s) dropped",
        meta.loaded, meta.selected, meta.duplicates_dropped
    );

    for (i, p) in selection.planned.iter().enumerate() {
        let tags: Vec<&str> = p.case.tags.iter().map(String::as_str).collect();
        let mut line = format!("{:>4}. {}", i + 1, p.case.id);
        if !tags.is_empty() {
            line.push_str(&format!(" [{}]", tags.join(", ")));
        }
        if p.samples > 1 {
            line.push_str(&format!(" (flaky, {} samples)", p.samples));
        }
        if p.case.is_recording() {
            line.push_str(" (recording)");
        }
        println!("{line}");
    }

    for d in &meta.dropped {
        let why = match &d.reason {
            DropReason::Duplicate { of } => format!("duplicate of {of}"),
            DropReason::ConflictingExpectation { of } => {
                format!("duplicate of {of} with a different expectation")
            }
            DropReason::Flaky {
                failure_rate,
                observations,
            } => format!(
                "flaky: {:.0}% failing over {observations} run(s)",
                failure_rate * 100.0
            ),
            DropReason::OverBudget => "over case budget".into(),
        };
        println!("   - {} ({why})", d.case_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrap {
        #[command(flatten)]
        run: RunArgs,
    }

    #[test]
    fn flags_override_config() {
        let w = Wrap::parse_from([
            "agentest",
            "--cmd",
            "./prog",
            "--tests",
            "a.json",
            "b/*.yaml",
            "--workers",
            "3",
            "--no-llm",
            "--args",
            "--run-timeout",
            "30",
        ]);
        let mut cfg = RunConfig::default();
        w.run.apply(&mut cfg);

        assert_eq!(w.run.tests, ["a.json", "b/*.yaml"]);
        assert_eq!(cfg.program.command, "./prog");
        assert_eq!(cfg.execution.workers, 3);
        assert_eq!(cfg.execution.run_timeout_secs, Some(30.0));
        assert_eq!(cfg.program.input_channel, InputChannel::Args);
        assert!(!cfg.analyzer.enabled);
        assert_eq!(cfg.report.suite_name, "agent-tests");
    }
}
