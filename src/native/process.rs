use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::constants::{NOT_SPAWNED_EXITCODE, PIPE_BUFFER_SIZE};
use crate::core::domain::{CommandInvocation, StdinSource};

#[derive(Clone, Copy, Debug)]
pub struct RunOptions {
    pub log_nonzero_exit: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            log_nonzero_exit: true,
        }
    }
}

/// What became of a command run through [`run_command`].
///
/// Streams that were redirected to a file are left empty here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutcome {
    fn not_spawned() -> Self {
        CommandOutcome {
            success: false,
            exit_code: NOT_SPAWNED_EXITCODE,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

/// A `std::process::Command` with stdio wired up according to an invocation.
pub(crate) struct PreparedCommand {
    pub command: std::process::Command,
    pub stdin_data: Option<Vec<u8>>,
    pub stdin_bytes: u64,
    pub stdout_sink: Option<File>,
    pub stderr_sink: Option<File>,
}

/// Builds the command for `invocation`.
///
/// With `pump_outputs` stdout and stderr are always pipes and their redirect
/// targets are handed back as sinks, so the caller can meter what passes.
/// Otherwise redirect targets become the child's stdio directly.
pub(crate) fn prepare(invocation: &CommandInvocation, pump_outputs: bool) -> io::Result<PreparedCommand> {
    let (program, args) = invocation
        .argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    let mut command = std::process::Command::new(program);
    command.args(args);
    if let Some(dir) = &invocation.working_dir {
        command.current_dir(dir);
    }

    let mut stdin_data = None;
    let stdin_bytes = match &invocation.stdin {
        StdinSource::Null => {
            command.stdin(Stdio::null());
            0
        }
        StdinSource::File(path) => {
            let file = File::open(path)?;
            let len = file.metadata()?.len();
            command.stdin(Stdio::from(file));
            len
        }
        StdinSource::Bytes(data) => {
            command.stdin(Stdio::piped());
            stdin_data = Some(data.clone());
            data.len() as u64
        }
    };

    let mut stdout_sink = None;
    match (&invocation.stdout, pump_outputs) {
        (Some(path), false) => {
            command.stdout(Stdio::from(File::create(path)?));
        }
        (target, _) => {
            command.stdout(Stdio::piped());
            stdout_sink = target.as_ref().map(File::create).transpose()?;
        }
    }

    let mut stderr_sink = None;
    match (&invocation.stderr, pump_outputs) {
        (Some(path), false) => {
            command.stderr(Stdio::from(File::create(path)?));
        }
        (target, _) => {
            command.stderr(Stdio::piped());
            stderr_sink = target.as_ref().map(File::create).transpose()?;
        }
    }

    Ok(PreparedCommand {
        command,
        stdin_data,
        stdin_bytes,
        stdout_sink,
        stderr_sink,
    })
}

pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => NOT_SPAWNED_EXITCODE,
    }
}

/// Runs `invocation` to completion.
///
/// Stdin is fed while stdout and stderr are drained, so a child producing
/// more than a pipe buffer of output never blocks against us. Failing to
/// spawn is reported like any other failure, with exit code -1.
#[tracing::instrument(skip(options))]
pub async fn run_command(invocation: &CommandInvocation, options: RunOptions) -> CommandOutcome {
    if invocation.argv.is_empty() {
        tracing::warn!("Refusing to run an empty command");
        return CommandOutcome::not_spawned();
    }
    let command_line = invocation.argv.iter().join(" ");

    match run_to_completion(invocation).await {
        Ok(outcome) => {
            if !outcome.success && options.log_nonzero_exit {
                tracing::warn!(
                    "Command `{}` exited with non-zero exitcode {}",
                    command_line,
                    outcome.exit_code
                );
            }
            outcome
        }
        Err(e) => {
            tracing::warn!("Failed to run command `{}`: {}", command_line, e);
            CommandOutcome::not_spawned()
        }
    }
}

async fn run_to_completion(invocation: &CommandInvocation) -> io::Result<CommandOutcome> {
    let prepared = prepare(invocation, false)?;
    let mut child = tokio::process::Command::from(prepared.command)
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin_data = prepared.stdin_data;

    let feed = async move {
        if let (Some(mut pipe), Some(data)) = (stdin, stdin_data) {
            match pipe.write_all(&data).await {
                // The child is free to stop reading early.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }
        Ok::<_, io::Error>(())
    };

    let (_, stdout, stderr, status) =
        tokio::try_join!(feed, read_all(stdout), read_all(stderr), child.wait())?;

    let exit_code = exit_code(status);
    Ok(CommandOutcome {
        success: exit_code == 0,
        exit_code,
        stdout,
        stderr,
    })
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct StreamStats {
    /// Bytes read from the child.
    pub total: u64,
    /// Bytes that made it into the sink.
    pub passed: u64,
}

impl StreamStats {
    pub fn truncated(&self) -> bool {
        self.passed < self.total
    }
}

/// Drains `reader` to EOF, forwarding at most `cap` bytes into `sink`.
///
/// Everything past the cap is read and discarded so the writer never stalls.
pub(crate) fn pump<R: Read, W: Write>(
    mut reader: R,
    mut sink: Option<W>,
    cap: Option<u64>,
) -> io::Result<StreamStats> {
    let mut stats = StreamStats::default();
    let mut buf = [0u8; PIPE_BUFFER_SIZE];
    let mut sink_error = None;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        stats.total += n as u64;

        let room = cap.map_or(n as u64, |cap| cap.saturating_sub(stats.passed));
        let forward = (n as u64).min(room) as usize;
        if forward == 0 {
            continue;
        }
        if let Some(writer) = sink.as_mut() {
            if let Err(e) = writer.write_all(&buf[..forward]) {
                sink_error = Some(e);
                sink = None;
                continue;
            }
        }
        stats.passed += forward as u64;
    }

    if let Some(mut writer) = sink {
        writer.flush()?;
    }
    match sink_error {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}
