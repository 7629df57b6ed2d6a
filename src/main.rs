use std::panic;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::{ConfigError, JudgeConfig};
use crate::constants::*;
use crate::core::domain::{
    CommandInvocation, CompareConfig, JudgeSettings, JudgeTask, RunConfig, TestcaseFiles,
    TestcaseTimeLimit, TimeLimit,
};
use crate::core::meta::{CompareMetadata, ExecutionMetadata, MetaParseError};
use crate::core::pipeline::running::{JudgingEvent, handle_running};
use crate::core::pipeline::testcase::TestcaseRunner;
use crate::core::verdict::{Verdict, VerdictInput, determine_verdict, verdict_message};
use crate::native::process::{RunOptions, run_command};
use crate::native::sandbox::NativeSandbox;

mod config;
mod constants;
mod core;
mod native;


#[derive(Parser, Debug)]
#[command(name = "judgehost", version, about = "Judges compiled submissions against testcases")]
struct Cli {
    /// User to run submissions and compare scripts as
    #[arg(long, env = "RUNUSER", global = true)]
    runuser: Option<String>,

    /// Group to run as, defaults to the primary group of the run user
    #[arg(long, env = "RUNGROUP", global = true)]
    rungroup: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Judge a program on a list of testcases
    Judge(JudgeArgs),
    /// Recompute a verdict from stored meta files
    Verdict(VerdictArgs),
}

#[derive(Args, Debug)]
struct JudgeArgs {
    #[arg(long)]
    program: PathBuf,

    /// Directory the pass directories are created in
    #[arg(long)]
    workdir: PathBuf,

    /// Input and reference output of one testcase, in rank order
    #[arg(long = "testcase", value_name = "IN,OUT", value_parser = parse_testcase, required = true)]
    testcases: Vec<(PathBuf, PathBuf)>,

    #[arg(long, value_name = "S[:H]")]
    cpu: TimeLimit,

    #[arg(long, value_name = "S[:H]")]
    wall: TimeLimit,

    /// Run script, or the interactive validator with --combined
    #[arg(long)]
    run: PathBuf,

    #[arg(long)]
    compare: PathBuf,

    #[arg(long)]
    combined: bool,

    #[arg(long, allow_hyphen_values = true)]
    compare_args: Option<String>,

    #[arg(long, value_name = "KB", default_value_t = DEFAULT_MEMORY_LIMIT)]
    memory_limit: u64,

    #[arg(long, value_name = "KB", default_value_t = DEFAULT_OUTPUT_LIMIT)]
    output_limit: u64,

    #[arg(long, default_value_t = DEFAULT_PROCESS_LIMIT)]
    process_limit: u64,

    #[arg(long, value_name = "S", default_value_t = DEFAULT_SCRIPT_TIMELIMIT)]
    script_timelimit: u64,

    #[arg(long, value_name = "KB", default_value_t = DEFAULT_SCRIPT_MEMORY_LIMIT)]
    script_memory_limit: u64,

    #[arg(long, value_name = "KB", default_value_t = DEFAULT_SCRIPT_FILESIZE_LIMIT)]
    script_filesize_limit: u64,

    /// Stop judging as soon as the final result is known
    #[arg(long, env = "JUDGEHOST_LAZY_EVAL")]
    lazy_eval: bool,
}

#[derive(Args, Debug)]
struct VerdictArgs {
    #[arg(long)]
    program_meta: PathBuf,

    #[arg(long)]
    compare_meta: PathBuf,

    #[arg(long)]
    combined: bool,

    /// Defaults to the stdout byte count of the program meta file
    #[arg(long)]
    program_output_size: Option<u64>,

    #[arg(long)]
    compare_timed_out: bool,

    #[arg(long, value_name = "KB", default_value_t = DEFAULT_OUTPUT_LIMIT)]
    output_limit: u64,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("processes of run user `{0}` are still running")]
    RunUserBusy(String),
    #[error("checking for processes of `{user}` failed with exitcode {code}")]
    ProcessCheck { user: String, code: i32 },
    #[error("judging pipeline stopped unexpectedly")]
    PipelineClosed,
    #[error("cannot read `{path}`: {msg}")]
    Read { path: String, msg: String },
    #[error("invalid meta file `{path}`: {source}")]
    Meta {
        path: String,
        #[source]
        source: MetaParseError,
    },
}

fn parse_testcase(raw: &str) -> Result<(PathBuf, PathBuf), String> {
    match raw.split_once(',') {
        Some((input, output)) if !input.is_empty() && !output.is_empty() => {
            Ok((input.into(), output.into()))
        }
        _ => Err(format!("expected IN,OUT but got `{}`", raw)),
    }
}

#[tokio::main]
#[tracing::instrument]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Judge(args) => judge(cli.runuser.as_deref(), cli.rungroup.as_deref(), args).await,
        Command::Verdict(args) => recompute_verdict(args),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("judgehost: {}", e);
            ExitCode::from(2)
        }
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}

/// Leftovers of an earlier run could interfere with the next one.
async fn ensure_run_user_idle(user: &str) -> Result<(), CliError> {
    let outcome = run_command(
        &CommandInvocation::new(["pgrep", "-u", user]),
        RunOptions {
            log_nonzero_exit: false,
        },
    )
    .await;
    match outcome.exit_code {
        0 => Err(CliError::RunUserBusy(user.to_string())),
        1 => Ok(()),
        code => Err(CliError::ProcessCheck {
            user: user.to_string(),
            code,
        }),
    }
}

fn judge_task(args: JudgeArgs) -> JudgeTask {
    JudgeTask {
        id: Uuid::new_v4(),
        program: args.program,
        workdir: args.workdir,
        testcases: args
            .testcases
            .into_iter()
            .zip(1..)
            .map(|((input, output), rank)| TestcaseFiles {
                rank,
                input,
                output,
            })
            .collect(),
        settings: JudgeSettings {
            timelimit: TestcaseTimeLimit {
                cpu: args.cpu,
                wall: args.wall,
            },
            run_runpath: args.run,
            compare_runpath: args.compare,
            combined_run_compare: args.combined,
            compare_args: args.compare_args,
            run_config: RunConfig {
                memory_limit: args.memory_limit,
                output_limit: args.output_limit,
                process_limit: args.process_limit,
            },
            compare_config: CompareConfig {
                script_timelimit: args.script_timelimit,
                script_memory_limit: args.script_memory_limit,
                script_filesize_limit: args.script_filesize_limit,
            },
        },
    }
}

/// Judges one submission and reports whether it was correct.
async fn judge(runuser: Option<&str>, rungroup: Option<&str>, args: JudgeArgs) -> Result<bool, CliError> {
    let config = Arc::new(JudgeConfig::resolve(runuser, rungroup, args.lazy_eval)?);
    match &config.run_identity {
        Some(identity) => {
            ensure_run_user_idle(&identity.user).await?;
            tracing::info!(
                "Running programs as {}:{} (uid {}, gid {})",
                identity.user,
                identity.group,
                identity.uid,
                identity.gid
            );
        }
        None => tracing::warn!("No run user configured, programs run with our own privileges"),
    }

    let task = judge_task(args);
    tracing::info!("Judging {} as task {}", task.program.display(), task.id);

    let runner = Arc::new(TestcaseRunner::new(config.clone(), Arc::new(NativeSandbox::new())));
    let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let (task_tx, task_rx) = mpsc::channel(1);
    handle_running(event_tx, task_rx, runner, config);

    task_tx.send(task).await.map_err(|_| CliError::PipelineClosed)?;
    drop(task_tx);

    let mut correct = false;
    while let Some(event) = event_rx.recv().await {
        match event {
            JudgingEvent::TestcaseJudged { rank, outcome, .. } => {
                println!(
                    "testcase {:03}: {} {}",
                    rank,
                    outcome.verdict,
                    outcome.message.unwrap_or_default()
                );
            }
            JudgingEvent::Finished {
                result,
                runs,
                started_at,
                finished_at,
                ..
            } => {
                println!(
                    "result: {} after {} run(s) in {} ms",
                    result.map_or("none", Verdict::as_str),
                    runs,
                    (finished_at - started_at).num_milliseconds()
                );
                correct = result == Some(Verdict::Correct);
            }
        }
    }
    Ok(correct)
}

fn read_meta<T>(path: &Path) -> Result<T, CliError>
where
    T: FromStr<Err = MetaParseError>,
{
    let raw = std::fs::read_to_string(path).map_err(|e| CliError::Read {
        path: path.display().to_string(),
        msg: e.to_string(),
    })?;
    raw.parse().map_err(|source| CliError::Meta {
        path: path.display().to_string(),
        source,
    })
}

fn recompute_verdict(args: VerdictArgs) -> Result<bool, CliError> {
    let program_meta: ExecutionMetadata = read_meta(&args.program_meta)?;
    let compare_meta: CompareMetadata = read_meta(&args.compare_meta)?;

    let input = VerdictInput {
        program_out_size: args.program_output_size.unwrap_or(program_meta.stdout_bytes),
        program_meta,
        compare_meta,
        compare_exitcode: compare_meta.exit_code,
        combined_run_compare: args.combined,
        compare_timed_out: args.compare_timed_out,
    };
    let verdict = determine_verdict(&input);
    println!("{}", verdict);
    if let Some(message) = verdict_message(
        verdict,
        &input.program_meta,
        &input.compare_meta,
        input.combined_run_compare,
        args.output_limit,
    ) {
        println!("{}", message);
    }
    Ok(verdict == Verdict::Correct)
}
