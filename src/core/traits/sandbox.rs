use std::path::{Path, PathBuf};

use crate::core::domain::{CommandInvocation, ResourceLimits, RunIdentity};
use crate::core::meta::ExecutionMetadata;

/// One program to execute under confinement.
#[derive(Clone, Debug, PartialEq)]
pub struct SandboxRequest {
    pub command: CommandInvocation,
    pub limits: ResourceLimits,
    pub identity: Option<RunIdentity>,
    /// Where to leave a copy of the resulting metadata, if anywhere.
    pub meta_path: Option<PathBuf>,
}

/// Result of a program and an interactive validator talking to each other.
#[derive(Clone, Debug, PartialEq)]
pub struct InteractiveOutcome {
    pub program: ExecutionMetadata,
    pub validator: ExecutionMetadata,
    pub validator_exited_first: bool,
}

/// Failures that leave no usable metadata behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("refusing to execute an empty command")]
    EmptyCommand,
    #[error("failed to confine or spawn `{program}`: {msg}")]
    Spawn { program: String, msg: String },
    #[error("failed to wait for pid {pid}: {msg}")]
    Wait { pid: i32, msg: String },
    #[error("sandbox I/O failure: {msg}")]
    Io { msg: String },
}

impl SandboxError {
    pub fn io(err: std::io::Error) -> Self {
        SandboxError::Io {
            msg: err.to_string(),
        }
    }
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    async fn execute(&self, request: &SandboxRequest) -> Result<ExecutionMetadata, SandboxError>;

    /// Runs `program` and `validator` with each one's stdout feeding the
    /// other's stdin. Program output is also copied to `program_output`.
    async fn execute_interactive(
        &self,
        program: &SandboxRequest,
        validator: &SandboxRequest,
        program_output: &Path,
    ) -> Result<InteractiveOutcome, SandboxError>;
}
