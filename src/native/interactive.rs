use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{ChildStdin, ChildStdout, Stdio};
use std::thread;
use std::time::Instant;

use crate::constants::PIPE_BUFFER_SIZE;
use crate::core::traits::sandbox::{InteractiveOutcome, SandboxError, SandboxRequest};
use crate::native::process::{self, PreparedCommand, StreamStats};
use crate::native::sandbox::{join, spawn_confined, write_meta};

fn prepare_piped(request: &SandboxRequest) -> Result<PreparedCommand, SandboxError> {
    let program = request.command.program().ok_or(SandboxError::EmptyCommand)?;
    let mut prepared = process::prepare(&request.command, true).map_err(|e| SandboxError::Spawn {
        program: program.to_string(),
        msg: e.to_string(),
    })?;
    prepared.command.stdin(Stdio::piped());
    Ok(prepared)
}

fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Writes to a peer that may hang up at any time. Once it has, further data
/// is dropped.
fn write_peer(peer: &mut Option<ChildStdin>, data: &[u8]) -> io::Result<()> {
    let Some(pipe) = peer.as_mut() else {
        return Ok(());
    };
    match pipe.write_all(data) {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            *peer = None;
            Ok(())
        }
        other => other,
    }
}

/// Program stdout goes to the validator unchanged and, up to `cap` bytes,
/// into the program output file.
fn tee_program_output(
    mut reader: ChildStdout,
    mut validator: Option<ChildStdin>,
    mut progout: File,
    cap: Option<u64>,
) -> io::Result<StreamStats> {
    let mut stats = StreamStats::default();
    let mut buf = [0u8; PIPE_BUFFER_SIZE];
    loop {
        let n = read_chunk(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        stats.total += n as u64;
        write_peer(&mut validator, &buf[..n])?;

        let room = cap.map_or(n as u64, |cap| cap.saturating_sub(stats.passed));
        let forward = (n as u64).min(room) as usize;
        if forward > 0 {
            progout.write_all(&buf[..forward])?;
            stats.passed += forward as u64;
        }
    }
    progout.flush()?;
    Ok(stats)
}

/// Validator stdout goes to the program. Returns the byte count and when the
/// validator closed its end.
fn forward_validator_output(
    mut reader: ChildStdout,
    mut program: Option<ChildStdin>,
) -> io::Result<(u64, Instant)> {
    let mut total = 0u64;
    let mut buf = [0u8; PIPE_BUFFER_SIZE];
    loop {
        let n = read_chunk(&mut reader, &mut buf)?;
        if n == 0 {
            return Ok((total, Instant::now()));
        }
        total += n as u64;
        write_peer(&mut program, &buf[..n])?;
    }
}

fn missing_pipe(what: &str) -> SandboxError {
    SandboxError::Io {
        msg: format!("{} pipe was not set up", what),
    }
}

pub(crate) fn execute_blocking(
    program: &SandboxRequest,
    validator: &SandboxRequest,
    program_output: &Path,
) -> Result<InteractiveOutcome, SandboxError> {
    let mut validator_cmd = prepare_piped(validator)?;
    let mut program_cmd = prepare_piped(program)?;
    let progout = File::create(program_output).map_err(SandboxError::io)?;

    let (mut validator_child, validator_confined) =
        spawn_confined(&mut validator_cmd.command, validator)?;
    let (mut program_child, program_confined) =
        match spawn_confined(&mut program_cmd.command, program) {
            Ok(spawned) => spawned,
            Err(e) => {
                validator_confined.abort();
                return Err(e);
            }
        };

    let (Some(program_stdout), Some(validator_stdout)) =
        (program_child.stdout.take(), validator_child.stdout.take())
    else {
        program_confined.abort();
        validator_confined.abort();
        return Err(missing_pipe("stdout"));
    };

    let validator_stdin = validator_child.stdin.take();
    let program_cap = program.limits.output_bytes;
    let tee = thread::spawn(move || {
        tee_program_output(program_stdout, validator_stdin, progout, program_cap)
    });
    let program_stdin = program_child.stdin.take();
    let forward = thread::spawn(move || forward_validator_output(validator_stdout, program_stdin));

    let program_stderr = program_child.stderr.take();
    let program_stderr_sink = program_cmd.stderr_sink.take();
    let program_stderr_pump = thread::spawn(move || match program_stderr {
        Some(pipe) => process::pump(pipe, program_stderr_sink, program_cap),
        None => Ok(StreamStats::default()),
    });
    let validator_stderr = validator_child.stderr.take();
    let validator_stderr_sink = validator_cmd.stderr_sink.take();
    let validator_cap = validator.limits.output_bytes;
    let validator_stderr_pump = thread::spawn(move || match validator_stderr {
        Some(pipe) => process::pump(pipe, validator_stderr_sink, validator_cap),
        None => Ok(StreamStats::default()),
    });

    let program_reaper = thread::spawn(move || program_confined.wait());
    let validator_reaped = validator_confined.wait();
    let program_reaped = program_reaper.join().map_err(|_| SandboxError::Io {
        msg: "program reaper panicked".to_string(),
    })?;

    let program_stdout = join(tee, "program output tee");
    let validator_stdout = join(forward, "validator output forwarder");
    let program_stderr = join(program_stderr_pump, "program stderr pump");
    let validator_stderr = join(validator_stderr_pump, "validator stderr pump");

    let (program_reaped, validator_reaped) = (program_reaped?, validator_reaped?);
    let (program_stdout, (validator_stdout_bytes, validator_eof)) =
        (program_stdout?, validator_stdout?);
    let (program_stderr, validator_stderr) = (program_stderr?, validator_stderr?);

    let validator_gone = validator_eof.min(validator_reaped.finished_at);
    let validator_exited_first = validator_gone < program_reaped.finished_at;

    let program_meta = program_reaped.metadata(
        &program.limits,
        validator_stdout_bytes,
        program_stdout,
        program_stderr,
    );
    let validator_stdout = StreamStats {
        total: validator_stdout_bytes,
        passed: validator_stdout_bytes,
    };
    let validator_meta = validator_reaped.metadata(
        &validator.limits,
        program_stdout.total,
        validator_stdout,
        validator_stderr,
    );
    write_meta(program, &program_meta)?;
    write_meta(validator, &validator_meta)?;

    tracing::debug!(
        "Interactive run done: program exitcode {}, validator exitcode {}, validator exited first: {}",
        program_meta.exit_code,
        validator_meta.exit_code,
        validator_exited_first
    );

    Ok(InteractiveOutcome {
        program: program_meta,
        validator: validator_meta,
        validator_exited_first,
    })
}
