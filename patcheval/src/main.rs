//! Classify a git commit range with a local language model.
//!
//! `patcheval run <start> [<end>] [resume <checkpoint>]` walks the range,
//! `patcheval report <checkpoint>` summarizes a finished or partial run and
//! `patcheval validate` checks the config and prompt templates.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use patcheval::cancel::{CancelToken, Cancelled, install_signal_handler};
use patcheval::exit_codes;
use patcheval::io::config::{DEFAULT_CONFIG_FILE, load_config};
use patcheval::io::prompt::PromptRenderer;
use patcheval::logging;
use patcheval::report::Report;
use patcheval::run::{RunArgs, run_from_config};

const RESUME_KEYWORD: &str = "resume";

#[derive(Parser)]
#[command(
    name = "patcheval",
    version,
    about = "Classify git commits through a plan of language-model stages"
)]
struct Cli {
    /// Path to the TOML config.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug diagnostics on stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify commits: `run <start> [<end>] [resume <checkpoint>]`.
    Run {
        #[arg(required = true, num_args = 1..=4, value_name = "ARGS")]
        args: Vec<String>,
    },
    /// Print a verdict table for a checkpoint log.
    Report { checkpoint: PathBuf },
    /// Check the config and the prompt template of every planned stage.
    Validate,
}

fn main() {
    let code = match run() {
        Ok(()) => exit_codes::OK,
        Err(err) if err.downcast_ref::<Cancelled>().is_some() => {
            eprintln!("{err}; persisted results remain valid, pass the checkpoint to `resume`");
            exit_codes::INTERRUPTED
        }
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match cli.command {
        Command::Run { args } => cmd_run(&cli.config, &args),
        Command::Report { checkpoint } => cmd_report(&checkpoint),
        Command::Validate => cmd_validate(&cli.config),
    }
}

fn cmd_run(config: &Path, args: &[String]) -> Result<()> {
    let run_args = parse_run_args(args)?;
    let cfg = load_config(config)?;
    let cancel = CancelToken::new();
    install_signal_handler(cancel.clone())?;
    run_from_config(&cfg, &run_args, &cancel)?;
    Ok(())
}

fn cmd_report(checkpoint: &Path) -> Result<()> {
    let report = Report::load(checkpoint)?;
    println!("{}", checkpoint.display());
    print!("{}", report.render());
    Ok(())
}

fn cmd_validate(config: &Path) -> Result<()> {
    let cfg = load_config(config)?;
    let plan = cfg.compile_plan()?;
    let stages = plan.stage_names();
    PromptRenderer::load_dir(&cfg.prompts_dir, &stages)?
        .ensure_templates(&stages)
        .with_context(|| format!("prompt templates in {}", cfg.prompts_dir.display()))?;
    println!(
        "{}: ok ({} stages, {} outcomes)",
        config.display(),
        stages.len(),
        plan.outcomes.len()
    );
    Ok(())
}

/// `<start> [<end>] [resume <checkpoint>]`.
fn parse_run_args(args: &[String]) -> Result<RunArgs> {
    let (refs, resume) = match args.iter().position(|arg| arg == RESUME_KEYWORD) {
        Some(at) => match &args[at + 1..] {
            [file] => (&args[..at], Some(PathBuf::from(file))),
            _ => bail!("usage: run <start> [<end>] [resume <checkpoint>]: `resume` takes one file"),
        },
        None => (args, None),
    };
    match refs {
        [start] => Ok(RunArgs {
            start: start.clone(),
            end: None,
            resume,
        }),
        [start, end] => Ok(RunArgs {
            start: start.clone(),
            end: Some(end.clone()),
            resume,
        }),
        [] => bail!("usage: run <start> [<end>] [resume <checkpoint>]: missing start ref"),
        _ => bail!("usage: run <start> [<end>] [resume <checkpoint>]: too many refs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn end_defaults_to_start() {
        let parsed = parse_run_args(&args(&["v6.1"])).expect("parse");
        assert_eq!(parsed.start, "v6.1");
        assert_eq!(parsed.end_ref(), "v6.1");
        assert_eq!(parsed.resume, None);
    }

    #[test]
    fn parses_range_and_resume() {
        let parsed =
            parse_run_args(&args(&["v6.1", "v6.2", "resume", "logs/x/checkpoint.jsonl"]))
                .expect("parse");
        assert_eq!(parsed.end.as_deref(), Some("v6.2"));
        assert_eq!(
            parsed.resume,
            Some(PathBuf::from("logs/x/checkpoint.jsonl"))
        );
        let parsed = parse_run_args(&args(&["v6.1", "resume", "c.jsonl"])).expect("parse");
        assert_eq!(parsed.end, None);
        assert!(parsed.resume.is_some());
    }

    #[test]
    fn rejects_malformed_run_args() {
        assert!(parse_run_args(&args(&["resume", "c.jsonl"])).is_err());
        assert!(parse_run_args(&args(&["v1", "resume"])).is_err());
        assert!(parse_run_args(&args(&["v1", "v2", "v3"])).is_err());
    }

    #[test]
    fn cli_requires_a_start_ref() {
        assert!(Cli::try_parse_from(["patcheval", "run"]).is_err());
        let cli = Cli::try_parse_from(["patcheval", "--verbose", "run", "v6.1", "v6.2"])
            .expect("parse");
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("patcheval.toml"));
        assert!(matches!(cli.command, Command::Run { ref args } if args.len() == 2));
    }

    #[test]
    fn cli_parses_report_and_global_config() {
        let cli = Cli::try_parse_from(["patcheval", "report", "c.jsonl", "--config", "alt.toml"])
            .expect("parse");
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        assert!(matches!(cli.command, Command::Report { .. }));
    }
}
