use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdin, Command};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Gid, Pid, Uid, setgid, setgroups, setuid};

use crate::core::domain::{ResourceLimits, RunIdentity};
use crate::core::meta::{ExecutionMetadata, OutputTruncated, TimeResult, TimeUsed};
use crate::core::traits::sandbox::{InteractiveOutcome, Sandbox, SandboxError, SandboxRequest};
use crate::native::interactive;
use crate::native::process::{self, StreamStats};

/// Confines programs with plain rlimits, a process group and a wall clock
/// watchdog, then reports what they used via `wait4`.
#[derive(Clone, Debug, Default)]
pub struct NativeSandbox;

impl NativeSandbox {
    pub fn new() -> Self {
        NativeSandbox
    }
}

#[async_trait::async_trait]
impl Sandbox for NativeSandbox {
    #[tracing::instrument(skip(self))]
    async fn execute(&self, request: &SandboxRequest) -> Result<ExecutionMetadata, SandboxError> {
        let request = request.clone();
        tokio::task::spawn_blocking(move || execute_blocking(&request))
            .await
            .map_err(|e| SandboxError::Io { msg: e.to_string() })?
    }

    #[tracing::instrument(skip(self))]
    async fn execute_interactive(
        &self,
        program: &SandboxRequest,
        validator: &SandboxRequest,
        program_output: &Path,
    ) -> Result<InteractiveOutcome, SandboxError> {
        let program = program.clone();
        let validator = validator.clone();
        let program_output = program_output.to_path_buf();
        tokio::task::spawn_blocking(move || {
            interactive::execute_blocking(&program, &validator, &program_output)
        })
        .await
        .map_err(|e| SandboxError::Io { msg: e.to_string() })?
    }
}

fn execute_blocking(request: &SandboxRequest) -> Result<ExecutionMetadata, SandboxError> {
    let program = request
        .command
        .program()
        .ok_or(SandboxError::EmptyCommand)?
        .to_string();

    let mut prepared = process::prepare(&request.command, true).map_err(|e| SandboxError::Spawn {
        program: program.clone(),
        msg: e.to_string(),
    })?;
    let (mut child, confined) = spawn_confined(&mut prepared.command, request)?;

    let feeder = feed_stdin(child.stdin.take(), prepared.stdin_data.take());
    let cap = request.limits.output_bytes;
    let stdout = child.stdout.take();
    let stdout_sink = prepared.stdout_sink.take();
    let stdout_pump = thread::spawn(move || match stdout {
        Some(pipe) => process::pump(pipe, stdout_sink, cap),
        None => Ok(StreamStats::default()),
    });
    let stderr = child.stderr.take();
    let stderr_sink = prepared.stderr_sink.take();
    let stderr_pump = thread::spawn(move || match stderr {
        Some(pipe) => process::pump(pipe, stderr_sink, cap),
        None => Ok(StreamStats::default()),
    });

    let reaped = confined.wait();
    let stdout = join(stdout_pump, "stdout pump");
    let stderr = join(stderr_pump, "stderr pump");
    join(feeder, "stdin feeder")?;
    let (reaped, stdout, stderr) = (reaped?, stdout?, stderr?);

    let meta = reaped.metadata(&request.limits, prepared.stdin_bytes, stdout, stderr);
    tracing::debug!(
        "`{}` finished with exitcode {} ({:?})",
        program,
        meta.exit_code,
        meta.time_result
    );
    write_meta(request, &meta)?;
    Ok(meta)
}

pub(crate) fn write_meta(request: &SandboxRequest, meta: &ExecutionMetadata) -> Result<(), SandboxError> {
    if let Some(path) = &request.meta_path {
        std::fs::write(path, meta.to_string()).map_err(SandboxError::io)?;
    }
    Ok(())
}

pub(crate) fn join<T>(handle: JoinHandle<io::Result<T>>, what: &str) -> Result<T, SandboxError> {
    handle
        .join()
        .map_err(|_| SandboxError::Io {
            msg: format!("{} panicked", what),
        })?
        .map_err(SandboxError::io)
}

fn feed_stdin(pipe: Option<ChildStdin>, data: Option<Vec<u8>>) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        if let (Some(mut pipe), Some(data)) = (pipe, data) {
            match pipe.write_all(&data) {
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }
        Ok(())
    })
}

/// Whole seconds for `RLIMIT_CPU`, rounded up and never zero.
fn cpu_rlimit_secs(limit: Duration) -> u64 {
    let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
    secs.max(1)
}

/// Runs in the forked child between `fork` and `exec`.
fn confine(limits: &ResourceLimits, identity: Option<(u32, u32)>) -> io::Result<()> {
    let cpu = cpu_rlimit_secs(limits.cpu_time.hard);
    // SIGXCPU at the soft limit, SIGKILL one second later.
    setrlimit(Resource::RLIMIT_CPU, cpu, cpu + 1)?;
    if let Some(bytes) = limits.memory_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if let Some(bytes) = limits.output_bytes {
        setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
    }
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;

    if let Some((uid, gid)) = identity {
        // The process count is per user, so it only means something once we
        // are a dedicated user.
        if let Some(count) = limits.process_count {
            setrlimit(Resource::RLIMIT_NPROC, count, count)?;
        }
        let gid = Gid::from_raw(gid);
        setgroups(&[gid])?;
        setgid(gid)?;
        setuid(Uid::from_raw(uid))?;
    }
    Ok(())
}

/// Applies confinement to `command` and starts it in its own process group.
pub(crate) fn spawn_confined(
    command: &mut Command,
    request: &SandboxRequest,
) -> Result<(Child, ConfinedChild), SandboxError> {
    let limits = request.limits;
    let identity = request
        .identity
        .as_ref()
        .map(|RunIdentity { uid, gid, .. }| (*uid, *gid));
    command.process_group(0);
    unsafe {
        command.pre_exec(move || confine(&limits, identity));
    }

    let child = command.spawn().map_err(|e| SandboxError::Spawn {
        program: request.command.program().unwrap_or_default().to_string(),
        msg: e.to_string(),
    })?;
    let pid = Pid::from_raw(child.id() as i32);
    tracing::debug!("Spawned {:?} as pid {}", request.command.argv, pid);

    let confined = ConfinedChild {
        pid,
        started: Instant::now(),
        watchdog: Watchdog::start(pid, limits.wall_time.hard),
    };
    Ok((child, confined))
}

struct Watchdog {
    done: mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    fn start(pgid: Pid, timeout: Duration) -> Self {
        let (done, done_rx) = mpsc::channel();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                flag.store(true, Ordering::SeqCst);
                tracing::debug!("Wall clock limit hit, killing process group {}", pgid);
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        });
        Watchdog {
            done,
            fired,
            handle,
        }
    }

    /// Returns whether the watchdog had to kill.
    fn stop(self) -> bool {
        let _ = self.done.send(());
        let _ = self.handle.join();
        self.fired.load(Ordering::SeqCst)
    }
}

/// A running confined process that still has to be reaped.
pub(crate) struct ConfinedChild {
    pid: Pid,
    started: Instant,
    watchdog: Watchdog,
}

/// How a confined process ended, straight from `wait4`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Reaped {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory_bytes: u64,
    pub killed_on_wall_time: bool,
    pub finished_at: Instant,
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

impl ConfinedChild {
    /// Kills the whole group and reaps the leader, discarding the result.
    pub fn abort(self) {
        let _ = killpg(self.pid, Signal::SIGKILL);
        let _ = self.wait();
    }

    /// Reaps the process and kills whatever is left of its group.
    pub fn wait(self) -> Result<Reaped, SandboxError> {
        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let result = loop {
            let rc = unsafe { libc::wait4(self.pid.as_raw(), &mut status, 0, &mut usage) };
            if rc == self.pid.as_raw() {
                break Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                break Err(SandboxError::Wait {
                    pid: self.pid.as_raw(),
                    msg: err.to_string(),
                });
            }
        };
        let finished_at = Instant::now();
        let killed_on_wall_time = self.watchdog.stop();
        // Orphaned children would keep our pipes open.
        let _ = killpg(self.pid, Signal::SIGKILL);
        result?;

        let (exit_code, signal) = if libc::WIFSIGNALED(status) {
            let signal = libc::WTERMSIG(status);
            (128 + signal, Some(signal))
        } else {
            (libc::WEXITSTATUS(status), None)
        };

        Ok(Reaped {
            exit_code,
            signal,
            cpu_time: timeval(usage.ru_utime) + timeval(usage.ru_stime),
            wall_time: finished_at.duration_since(self.started),
            memory_bytes: (usage.ru_maxrss.max(0) as u64).saturating_mul(1024),
            killed_on_wall_time,
            finished_at,
        })
    }
}

impl Reaped {
    pub fn classify(&self, limits: &ResourceLimits) -> (TimeResult, TimeUsed) {
        let cpu_killed = self.signal == Some(libc::SIGXCPU)
            || (self.signal == Some(libc::SIGKILL) && self.cpu_time >= limits.cpu_time.hard);

        if self.killed_on_wall_time {
            return (TimeResult::Hard, TimeUsed::Wall);
        }
        if cpu_killed {
            return (TimeResult::Hard, TimeUsed::Cpu);
        }
        if self.cpu_time > limits.cpu_time.soft {
            return (TimeResult::Soft, TimeUsed::Cpu);
        }
        if self.wall_time > limits.wall_time.soft {
            return (TimeResult::Soft, TimeUsed::Wall);
        }
        (TimeResult::Pass, TimeUsed::Cpu)
    }

    pub fn metadata(
        &self,
        limits: &ResourceLimits,
        stdin_bytes: u64,
        stdout: StreamStats,
        stderr: StreamStats,
    ) -> ExecutionMetadata {
        let (time_result, time_used) = self.classify(limits);
        ExecutionMetadata {
            exit_code: self.exit_code,
            signal: self.signal,
            cpu_time: self.cpu_time,
            wall_time: self.wall_time,
            memory_bytes: self.memory_bytes,
            time_used,
            time_result,
            output_truncated: OutputTruncated {
                stdout: stdout.truncated(),
                stderr: stderr.truncated(),
            },
            stdin_bytes,
            stdout_bytes: stdout.total,
            stderr_bytes: stderr.total,
        }
    }
}
