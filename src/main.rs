use std::error::Error;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use agentest::cli::{self, CheckArgs, InitArgs, RunArgs};
use agentest::logger::{self, Verbosity};

#[derive(Parser)]
#[command(
    name = "agentest",
    version,
    about = "Batch test harness for black-box programs, with output normalization and LLM-assisted failure analysis."
)]
struct Cli {
    #[arg(short, long, global = true, help = "Debug logging")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Only log errors")]
    quiet: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run cases against a program and report verdicts
    Run(RunArgs),
    /// Validate case files and print the prioritized plan without running
    Check(CheckArgs),
    /// Write a sample case file and program
    Init(InitArgs),
}

fn dispatch(command: CliCommand) -> Result<ExitCode, Box<dyn Error>> {
    match command {
        CliCommand::Run(args) => cli::run(args),
        CliCommand::Check(args) => cli::check(args),
        CliCommand::Init(args) => cli::init(args),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init(Verbosity::from_flags(cli.verbose, cli.quiet));

    match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}
