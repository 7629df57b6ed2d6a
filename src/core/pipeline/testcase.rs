use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{AccessFlags, Gid, Uid, access, chown};

use crate::config::JudgeConfig;
use crate::constants::{COMPARE_ERR, COMPARE_META, COMPARE_OUT, PROGRAM_ERR, PROGRAM_META, PROGRAM_OUT};
use crate::core::domain::{CommandInvocation, ResourceLimits, TestcaseDescriptor};
use crate::core::meta::{CompareMetadata, ExecutionMetadata};
use crate::core::traits::sandbox::{Sandbox, SandboxError, SandboxRequest};
use crate::core::verdict::{Verdict, VerdictInput, determine_verdict, verdict_message};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("input file `{0}` is missing or not readable")]
    InputUnreadable(String),
    #[error("reference output `{0}` is missing or not readable")]
    OutputUnreadable(String),
    #[error("pass directory `{0}` does not exist")]
    PassdirMissing(String),
    #[error("pass directory `{0}` is not writable")]
    PassdirNotWritable(String),
    #[error("pass directory `{0}` is not searchable")]
    PassdirNotSearchable(String),
    #[error("`{0}` is missing or not executable")]
    NotExecutable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TestcaseError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("I/O on `{path}` failed: {msg}")]
    Io { path: String, msg: String },
    #[error("blocking task failed: {0}")]
    Blocking(String),
}

impl TestcaseError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        TestcaseError::Io {
            path: display(path),
            msg: err.to_string(),
        }
    }
}

/// Verdict of one testcase plus everything needed to audit it.
#[derive(Clone, Debug, PartialEq)]
pub struct TestcaseOutcome {
    pub verdict: Verdict,
    pub message: Option<String>,
    pub program_meta: Option<ExecutionMetadata>,
    pub compare_meta: Option<CompareMetadata>,
    pub program_output_size: u64,
}

impl TestcaseOutcome {
    pub fn internal_error() -> Self {
        TestcaseOutcome {
            verdict: Verdict::InternalError,
            message: None,
            program_meta: None,
            compare_meta: None,
            program_output_size: 0,
        }
    }
}

fn has_mode_bits(path: &Path, bits: u32) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.permissions().mode() & bits != 0)
}

fn is_readable_file(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::R_OK).is_ok()
}

// access(2) lets root through regardless of mode, so the bits are checked too.
fn is_executable_file(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok() && has_mode_bits(path, 0o111)
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Checks that every file a testcase needs is in place before anything runs.
pub fn check_preconditions(testcase: &TestcaseDescriptor) -> Result<(), PreconditionError> {
    if !is_readable_file(&testcase.input) {
        return Err(PreconditionError::InputUnreadable(display(&testcase.input)));
    }
    if !is_readable_file(&testcase.output) {
        return Err(PreconditionError::OutputUnreadable(display(&testcase.output)));
    }

    let passdir = &testcase.passdir;
    if !passdir.is_dir() {
        return Err(PreconditionError::PassdirMissing(display(passdir)));
    }
    if access(passdir.as_path(), AccessFlags::W_OK).is_err() || !has_mode_bits(passdir, 0o222) {
        return Err(PreconditionError::PassdirNotWritable(display(passdir)));
    }
    if access(passdir.as_path(), AccessFlags::X_OK).is_err() || !has_mode_bits(passdir, 0o111) {
        return Err(PreconditionError::PassdirNotSearchable(display(passdir)));
    }

    let mut executables = vec![testcase.program_path(), testcase.run_runpath.clone()];
    if !testcase.combined_run_compare {
        executables.push(testcase.compare_runpath.clone());
    }
    match executables.into_iter().find(|path| !is_executable_file(path)) {
        Some(path) => Err(PreconditionError::NotExecutable(display(&path))),
        None => Ok(()),
    }
}

fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Arguments shared by compare scripts and interactive validators.
fn validator_args(testcase: &TestcaseDescriptor) -> Vec<String> {
    let mut args = vec![
        arg(&testcase.input),
        arg(&testcase.output),
        format!("{}/", testcase.feedback_dir().display()),
    ];
    args.extend(testcase.compare_args().map(String::from));
    args
}

/// What the run and compare steps produced, before a verdict is drawn.
struct Judged {
    program_meta: ExecutionMetadata,
    compare_meta: CompareMetadata,
    compare_timed_out: bool,
}

/// Runs a submission against single testcases.
#[derive(Debug, Clone)]
pub struct TestcaseRunner {
    config: Arc<JudgeConfig>,
    sandbox: Arc<dyn Sandbox>,
}

impl TestcaseRunner {
    pub fn new(config: Arc<JudgeConfig>, sandbox: Arc<dyn Sandbox>) -> Self {
        TestcaseRunner { config, sandbox }
    }

    /// Judges one testcase. Never fails: anything going wrong on our side
    /// ends up as an internal error.
    #[tracing::instrument(skip(self, testcase), fields(passdir = %testcase.passdir.display()))]
    pub async fn run_testcase(&self, testcase: &TestcaseDescriptor) -> TestcaseOutcome {
        match self.judge(testcase).await {
            Ok(outcome) => {
                tracing::info!(
                    "Testcase judged: {} ({})",
                    outcome.verdict,
                    outcome.message.as_deref().unwrap_or_default()
                );
                outcome
            }
            Err(e) => {
                tracing::error!("Internal error while judging testcase: {}", e);
                TestcaseOutcome::internal_error()
            }
        }
    }

    pub async fn testcase_run_internal(&self, testcase: &TestcaseDescriptor) -> Verdict {
        self.run_testcase(testcase).await.verdict
    }

    async fn judge(&self, testcase: &TestcaseDescriptor) -> Result<TestcaseOutcome, TestcaseError> {
        let checked = testcase.clone();
        tokio::task::spawn_blocking(move || check_preconditions(&checked))
            .await
            .map_err(|e| TestcaseError::Blocking(e.to_string()))??;

        self.prepare_feedback_dir(testcase).await?;

        let judged = if testcase.combined_run_compare {
            self.run_combined(testcase).await?
        } else {
            let program_meta = self.run_program(testcase).await?;
            self.run_compare(testcase, program_meta).await?
        };

        let compare_meta_path = testcase.pass_file(COMPARE_META);
        tokio::fs::write(&compare_meta_path, judged.compare_meta.to_string())
            .await
            .map_err(|e| TestcaseError::io(&compare_meta_path, e))?;

        let program_out = testcase.pass_file(PROGRAM_OUT);
        let program_output_size = tokio::fs::metadata(&program_out)
            .await
            .map_err(|e| TestcaseError::io(&program_out, e))?
            .len();

        let input = VerdictInput {
            program_meta: judged.program_meta,
            compare_meta: judged.compare_meta,
            compare_exitcode: judged.compare_meta.exit_code,
            combined_run_compare: testcase.combined_run_compare,
            program_out_size: program_output_size,
            compare_timed_out: judged.compare_timed_out,
        };
        let verdict = determine_verdict(&input);
        let message = verdict_message(
            verdict,
            &input.program_meta,
            &input.compare_meta,
            input.combined_run_compare,
            testcase.run_config.output_limit,
        );

        Ok(TestcaseOutcome {
            verdict,
            message,
            program_meta: Some(input.program_meta),
            compare_meta: Some(input.compare_meta),
            program_output_size,
        })
    }

    /// Compare scripts run as the restricted user, so that user must be able
    /// to write its feedback files.
    async fn prepare_feedback_dir(&self, testcase: &TestcaseDescriptor) -> Result<(), TestcaseError> {
        let feedback_dir = testcase.feedback_dir();
        tokio::fs::create_dir_all(&feedback_dir)
            .await
            .map_err(|e| TestcaseError::io(&feedback_dir, e))?;

        let Some(identity) = &self.config.run_identity else {
            return Ok(());
        };
        let (uid, gid) = (Uid::from_raw(identity.uid), Gid::from_raw(identity.gid));
        let dir = feedback_dir.clone();
        tokio::task::spawn_blocking(move || chown(dir.as_path(), Some(uid), Some(gid)))
            .await
            .map_err(|e| TestcaseError::Blocking(e.to_string()))?
            .map_err(|e| TestcaseError::io(&feedback_dir, e.into()))?;
        tracing::debug!(
            "Handed {} to {}:{}",
            feedback_dir.display(),
            identity.user,
            identity.group
        );
        Ok(())
    }

    async fn run_program(&self, testcase: &TestcaseDescriptor) -> Result<ExecutionMetadata, TestcaseError> {
        let request = SandboxRequest {
            command: CommandInvocation::new([
                arg(&testcase.run_runpath),
                arg(&testcase.program_path()),
            ])
            .stdin_file(&testcase.input)
            .stdout_file(testcase.pass_file(PROGRAM_OUT))
            .stderr_file(testcase.pass_file(PROGRAM_ERR))
            .current_dir(testcase.execdir()),
            limits: ResourceLimits::for_run(&testcase.timelimit, &testcase.run_config),
            identity: self.config.run_identity.clone(),
            meta_path: Some(testcase.pass_file(PROGRAM_META)),
        };
        tracing::debug!("Running program: {:?}", request.command.argv);
        Ok(self.sandbox.execute(&request).await?)
    }

    async fn run_compare(
        &self,
        testcase: &TestcaseDescriptor,
        program_meta: ExecutionMetadata,
    ) -> Result<Judged, TestcaseError> {
        let mut argv = vec![arg(&testcase.compare_runpath)];
        argv.extend(validator_args(testcase));

        let request = SandboxRequest {
            command: CommandInvocation::new(argv)
                .stdin_file(testcase.pass_file(PROGRAM_OUT))
                .stdout_file(testcase.pass_file(COMPARE_OUT))
                .stderr_file(testcase.pass_file(COMPARE_ERR))
                .current_dir(&testcase.passdir),
            limits: ResourceLimits::for_compare(&testcase.compare_config),
            identity: self.config.run_identity.clone(),
            meta_path: None,
        };
        tracing::debug!("Comparing output: {:?}", request.command.argv);
        let meta = self.sandbox.execute(&request).await?;

        Ok(Judged {
            program_meta,
            compare_meta: CompareMetadata {
                exit_code: meta.exit_code,
                validator_exited_first: false,
            },
            compare_timed_out: meta.time_result.is_timelimit(),
        })
    }

    async fn run_combined(&self, testcase: &TestcaseDescriptor) -> Result<Judged, TestcaseError> {
        let mut validator_argv = vec![arg(&testcase.run_runpath)];
        validator_argv.extend(validator_args(testcase));

        let validator = SandboxRequest {
            command: CommandInvocation::new(validator_argv)
                .stderr_file(testcase.pass_file(COMPARE_ERR))
                .current_dir(&testcase.passdir),
            limits: ResourceLimits::for_compare(&testcase.compare_config),
            identity: self.config.run_identity.clone(),
            meta_path: None,
        };
        let program = SandboxRequest {
            command: CommandInvocation::new([arg(&testcase.program_path())])
                .stderr_file(testcase.pass_file(PROGRAM_ERR))
                .current_dir(testcase.execdir()),
            limits: ResourceLimits::for_run(&testcase.timelimit, &testcase.run_config),
            identity: self.config.run_identity.clone(),
            meta_path: Some(testcase.pass_file(PROGRAM_META)),
        };
        tracing::debug!(
            "Running {:?} against validator {:?}",
            program.command.argv,
            validator.command.argv
        );

        let program_output: PathBuf = testcase.pass_file(PROGRAM_OUT);
        let outcome = self
            .sandbox
            .execute_interactive(&program, &validator, &program_output)
            .await?;

        Ok(Judged {
            program_meta: outcome.program,
            compare_meta: CompareMetadata {
                exit_code: outcome.validator.exit_code,
                validator_exited_first: outcome.validator_exited_first,
            },
            compare_timed_out: outcome.validator.time_result.is_timelimit(),
        })
    }
}
