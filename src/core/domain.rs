use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::constants::{EXECDIR, FEEDBACK_DIR, PROGRAM};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StdinSource {
    #[default]
    Null,
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// A program plus its arguments and where its standard streams go.
///
/// Streams without a target are captured in memory by the process runner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandInvocation {
    pub argv: Vec<String>,
    pub stdin: StdinSource,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl CommandInvocation {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandInvocation {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn stdin_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stdin = StdinSource::File(path.as_ref().into());
        self
    }

    pub fn stdin_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = StdinSource::Bytes(data.into());
        self
    }

    pub fn stdout_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stdout = Some(path.as_ref().into());
        self
    }

    pub fn stderr_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stderr = Some(path.as_ref().into());
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.working_dir = Some(path.as_ref().into());
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseLimitError {
    #[error("time limit `{0}` is not a positive number of seconds")]
    InvalidSeconds(String),
    #[error("hard time limit {hard} is below soft limit {soft}")]
    HardBelowSoft { soft: String, hard: String },
}

/// A soft/hard pair. Exceeding `soft` is reported, reaching `hard` kills.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeLimit {
    pub soft: Duration,
    pub hard: Duration,
}

impl TimeLimit {
    pub fn new(soft: Duration, hard: Duration) -> Self {
        TimeLimit { soft, hard }
    }

    pub fn exact(limit: Duration) -> Self {
        TimeLimit {
            soft: limit,
            hard: limit,
        }
    }

    pub fn from_secs(soft: u64, hard: u64) -> Self {
        TimeLimit::new(Duration::from_secs(soft), Duration::from_secs(hard))
    }
}

fn parse_seconds(raw: &str) -> Result<Duration, ParseLimitError> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ParseLimitError::InvalidSeconds(raw.to_string()))?;
    if secs <= 0.0 {
        return Err(ParseLimitError::InvalidSeconds(raw.to_string()));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| ParseLimitError::InvalidSeconds(raw.to_string()))
}

impl FromStr for TimeLimit {
    type Err = ParseLimitError;

    /// Accepts `S` or `S:H`, both in (fractional) seconds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (soft_raw, hard_raw) = s.split_once(':').unwrap_or((s, s));
        let soft = parse_seconds(soft_raw)?;
        let hard = parse_seconds(hard_raw)?;
        if hard < soft {
            return Err(ParseLimitError::HardBelowSoft {
                soft: soft_raw.to_string(),
                hard: hard_raw.to_string(),
            });
        }
        Ok(TimeLimit { soft, hard })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestcaseTimeLimit {
    pub cpu: TimeLimit,
    pub wall: TimeLimit,
}

/// Problem specific limits for the run step. Sizes are in kB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunConfig {
    pub memory_limit: u64,
    pub output_limit: u64,
    pub process_limit: u64,
}

/// Limits for the compare step. `script_timelimit` is in seconds, sizes in kB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompareConfig {
    pub script_timelimit: u64,
    pub script_memory_limit: u64,
    pub script_filesize_limit: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_time: TimeLimit,
    pub wall_time: TimeLimit,
    pub memory_bytes: Option<u64>,
    pub output_bytes: Option<u64>,
    pub process_count: Option<u64>,
}

impl ResourceLimits {
    pub fn for_run(timelimit: &TestcaseTimeLimit, config: &RunConfig) -> Self {
        ResourceLimits {
            cpu_time: timelimit.cpu,
            wall_time: timelimit.wall,
            memory_bytes: Some(config.memory_limit.saturating_mul(1024)),
            output_bytes: Some(config.output_limit.saturating_mul(1024)),
            process_count: Some(config.process_limit),
        }
    }

    pub fn for_compare(config: &CompareConfig) -> Self {
        let limit = TimeLimit::exact(Duration::from_secs(config.script_timelimit));
        ResourceLimits {
            cpu_time: limit,
            wall_time: limit,
            memory_bytes: Some(config.script_memory_limit.saturating_mul(1024)),
            output_bytes: Some(config.script_filesize_limit.saturating_mul(1024)),
            process_count: None,
        }
    }
}

/// The restricted account programs are executed as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunIdentity {
    pub user: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
}

/// Everything needed to judge one submission against one testcase.
#[derive(Clone, Debug, PartialEq)]
pub struct TestcaseDescriptor {
    pub input: PathBuf,
    pub output: PathBuf,
    pub timelimit: TestcaseTimeLimit,
    pub passdir: PathBuf,
    pub run_runpath: PathBuf,
    pub combined_run_compare: bool,
    pub compare_runpath: PathBuf,
    pub compare_args: Option<String>,
    pub run_config: RunConfig,
    pub compare_config: CompareConfig,
}

impl TestcaseDescriptor {
    pub fn execdir(&self) -> PathBuf {
        self.passdir.join(EXECDIR)
    }

    pub fn program_path(&self) -> PathBuf {
        self.execdir().join(PROGRAM)
    }

    pub fn feedback_dir(&self) -> PathBuf {
        self.passdir.join(FEEDBACK_DIR)
    }

    pub fn pass_file(&self, name: &str) -> PathBuf {
        self.passdir.join(name)
    }

    pub fn compare_args(&self) -> impl Iterator<Item = &str> {
        self.compare_args
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestcaseFiles {
    pub rank: u32,
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Per-problem settings shared by every testcase of a judging.
#[derive(Clone, Debug, PartialEq)]
pub struct JudgeSettings {
    pub timelimit: TestcaseTimeLimit,
    pub run_runpath: PathBuf,
    pub compare_runpath: PathBuf,
    pub combined_run_compare: bool,
    pub compare_args: Option<String>,
    pub run_config: RunConfig,
    pub compare_config: CompareConfig,
}

/// A compiled submission together with the testcases it must be judged on.
#[derive(Clone, Debug, PartialEq)]
pub struct JudgeTask {
    pub id: Uuid,
    pub program: PathBuf,
    pub workdir: PathBuf,
    pub testcases: Vec<TestcaseFiles>,
    pub settings: JudgeSettings,
}

impl JudgeTask {
    pub fn passdir(&self, testcase: &TestcaseFiles) -> PathBuf {
        self.workdir.join(format!("testcase{:03}", testcase.rank))
    }

    pub fn descriptor(&self, testcase: &TestcaseFiles) -> TestcaseDescriptor {
        TestcaseDescriptor {
            input: testcase.input.clone(),
            output: testcase.output.clone(),
            timelimit: self.settings.timelimit,
            passdir: self.passdir(testcase),
            run_runpath: self.settings.run_runpath.clone(),
            combined_run_compare: self.settings.combined_run_compare,
            compare_runpath: self.settings.compare_runpath.clone(),
            compare_args: self.settings.compare_args.clone(),
            run_config: self.settings.run_config,
            compare_config: self.settings.compare_config,
        }
    }
}
