//! Process sandbox.
//!
//! [`run`] forks a single child, applies resource limits and stream
//! redirections, and traces it syscall-by-syscall against a
//! [`SyscallPolicy`]. The child is torn down before return on every path.
//!
//! [`run`] installs a process-wide `SIGALRM` handler for the wall-clock
//! limit, so it must not be used from more than one thread at a time.
//! [`run_isolated`] lifts that restriction by performing the whole traced
//! run in a forked grandchild and shipping the [`ExitStat`] back over a
//! pipe; it is the variant the job-server workers use.
//!
//! [`spawn`] is the untraced sibling used for compiler invocations: rlimits
//! and redirections apply, but the wall-clock limit is enforced by polling
//! instead of signals, which keeps it safe to call concurrently.

pub mod policy;

pub use policy::{CheckerPolicy, DefaultPolicy, SyscallPolicy};

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{self, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{0}")]
    Os(#[from] Errno),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("isolated sandbox failed: {0}")]
    Isolated(String),
}

/// Where a standard stream of the child should point.
#[derive(Debug)]
pub enum StdioRedirect {
    Inherit,
    Close,
    File(File),
}

impl StdioRedirect {
    fn raw_fd(&self) -> Option<i32> {
        match self {
            StdioRedirect::Inherit => None,
            StdioRedirect::Close => Some(-1),
            StdioRedirect::File(f) => Some(f.as_raw_fd()),
        }
    }
}

/// Per-run limits and redirections. Constructed per run, consumed once.
#[derive(Debug, Default)]
pub struct SandboxOptions {
    /// Wall-clock limit enforced by a kill timer.
    pub time_limit: Option<Duration>,
    /// CPU-time limit enforced by `RLIMIT_CPU` (rounded up to seconds).
    pub cpu_time_limit: Option<Duration>,
    /// Address-space limit in bytes (`RLIMIT_AS`).
    pub memory_limit: Option<u64>,
    /// Cap on bytes the child may write to a file (`RLIMIT_FSIZE`).
    pub output_limit: Option<u64>,
    pub stdin: StdioRedirect,
    pub stdout: StdioRedirect,
    pub stderr: StdioRedirect,
}

impl Default for StdioRedirect {
    fn default() -> Self {
        StdioRedirect::Close
    }
}

/// How the child left the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitOutcome {
    Exited(i32),
    Signaled(i32),
}

impl WaitOutcome {
    fn from_status(status: libc::c_int) -> Self {
        if libc::WIFSIGNALED(status) {
            WaitOutcome::Signaled(libc::WTERMSIG(status))
        } else {
            WaitOutcome::Exited(libc::WEXITSTATUS(status))
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, WaitOutcome::Exited(0))
    }

    pub fn killed_by(&self, sig: Signal) -> bool {
        matches!(self, WaitOutcome::Signaled(s) if *s == sig as i32)
    }
}

impl std::fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitOutcome::Exited(code) => write!(f, "exited with {code}"),
            WaitOutcome::Signaled(sig) => match Signal::try_from(*sig) {
                Ok(s) => write!(f, "killed by {s}"),
                Err(_) => write!(f, "killed by signal {sig}"),
            },
        }
    }
}

/// Structured exit report of a sandboxed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitStat {
    pub outcome: WaitOutcome,
    pub cpu_time: Duration,
    pub wall_time: Duration,
    /// Peak resident set in bytes, from the kernel's rusage accounting.
    pub memory_peak: u64,
    /// Bytes found in the redirected stdout file after the run.
    pub output_size: u64,
    /// Diagnostic annotation, e.g. `forbidden syscall: 41`.
    pub message: Option<String>,
}

// The wall-clock timer kills this pid from the SIGALRM handler. Only one
// traced run may be active per process; run_isolated provides that.
static TRACEE_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn alarm_handler(_: libc::c_int) {
    let pid = TRACEE_PID.load(Ordering::Relaxed);
    if pid > 0 {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

/// Arms `ITIMER_REAL` to SIGKILL `pid` after `limit`; disarms on drop.
struct WallTimer {
    old_action: Option<SigAction>,
}

impl WallTimer {
    fn arm(pid: Pid, limit: Duration) -> Result<Self, SandboxError> {
        TRACEE_PID.store(pid.as_raw(), Ordering::Relaxed);
        let action = SigAction::new(
            SigHandler::Handler(alarm_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let old_action = unsafe { signal::sigaction(Signal::SIGALRM, &action)? };

        let timer = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            it_value: libc::timeval {
                tv_sec: limit.as_secs() as libc::time_t,
                tv_usec: libc::suseconds_t::from(limit.subsec_micros()),
            },
        };
        let mut old = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, &mut old) };
        Errno::result(rc)?;
        Ok(WallTimer {
            old_action: Some(old_action),
        })
    }
}

impl Drop for WallTimer {
    fn drop(&mut self) {
        let zero = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            it_value: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        let mut old = unsafe { std::mem::zeroed() };
        unsafe {
            libc::setitimer(libc::ITIMER_REAL, &zero, &mut old);
        }
        if let Some(old_action) = self.old_action.take() {
            unsafe {
                let _ = signal::sigaction(Signal::SIGALRM, &old_action);
            }
        }
        TRACEE_PID.store(0, Ordering::Relaxed);
    }
}

fn wait4(pid: Pid) -> nix::Result<(libc::c_int, libc::rusage)> {
    let mut status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut rusage) };
        match Errno::result(rc) {
            Ok(_) => return Ok((status, rusage)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
}

fn cpu_time_of(rusage: &libc::rusage) -> Duration {
    timeval_to_duration(rusage.ru_utime) + timeval_to_duration(rusage.ru_stime)
}

fn redirect(stream: &StdioRedirect, target: i32) {
    match stream.raw_fd() {
        None => {}
        Some(-1) => {
            let _ = unistd::close(target);
        }
        Some(fd) => {
            let _ = unistd::dup2(fd, target);
        }
    }
}

fn to_cstring(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).unwrap_or_default()
}

/// Runs in the forked child: limits, redirections, tracing request, exec.
/// Never returns on success.
fn child_exec(exec: &Path, args: &[String], opts: &SandboxOptions, traced: bool) -> ! {
    if let Some(limit) = opts.memory_limit {
        let _ = setrlimit(Resource::RLIMIT_AS, limit, limit);
    }
    if let Some(limit) = opts.cpu_time_limit {
        let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
        let _ = setrlimit(Resource::RLIMIT_CPU, secs, secs);
    }
    if let Some(limit) = opts.output_limit {
        let _ = setrlimit(Resource::RLIMIT_FSIZE, limit, limit);
    }

    redirect(&opts.stdin, libc::STDIN_FILENO);
    redirect(&opts.stdout, libc::STDOUT_FILENO);
    redirect(&opts.stderr, libc::STDERR_FILENO);

    let exec_c = to_cstring(exec);
    let argv: Vec<CString> = args
        .iter()
        .map(|a| CString::new(a.as_str()).unwrap_or_default())
        .collect();

    if traced {
        if ptrace::traceme().is_err() {
            unsafe { libc::_exit(254) };
        }
        let _ = signal::raise(Signal::SIGSTOP);
        let _ = unistd::execv(&exec_c, &argv);
    } else {
        let _ = unistd::execvp(&exec_c, &argv);
    }
    unsafe { libc::_exit(254) };
}

enum SyscallWait {
    /// Stopped at a syscall boundary (`SIGTRAP | 0x80`).
    Stop,
    /// The child is gone; final status and rusage.
    Gone(libc::c_int, libc::rusage),
}

fn wait_for_syscall(pid: Pid) -> Result<SyscallWait, SandboxError> {
    loop {
        ptrace::syscall(pid, None)?;
        let (status, rusage) = wait4(pid)?;
        if libc::WIFSTOPPED(status) {
            if libc::WSTOPSIG(status) == libc::SIGTRAP | 0x80 {
                return Ok(SyscallWait::Stop);
            }
            // Some other stop (signal delivery); keep stepping.
            continue;
        }
        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            return Ok(SyscallWait::Gone(status, rusage));
        }
    }
}

fn output_size_of(opts: &SandboxOptions) -> u64 {
    match &opts.stdout {
        StdioRedirect::File(f) => f.metadata().map(|m| m.len()).unwrap_or(0),
        _ => 0,
    }
}

/// Executes `exec` under the syscall policy and the limits in `opts`.
///
/// Exactly one process is created and it is reaped before return on every
/// path. Not safe to call from multiple threads at once; see [`run_isolated`].
pub fn run(
    exec: &Path,
    args: &[String],
    opts: SandboxOptions,
    policy: &mut dyn SyscallPolicy,
) -> Result<ExitStat, SandboxError> {
    let child = match unsafe { unistd::fork() }? {
        ForkResult::Child => child_exec(exec, args, &opts, true),
        ForkResult::Parent { child } => child,
    };

    // Wait for the child's self-stop, then install trace options.
    let (_, _) = wait4(child)?;
    if let Err(e) = ptrace::setoptions(
        child,
        ptrace::Options::PTRACE_O_TRACESYSGOOD | ptrace::Options::PTRACE_O_EXITKILL,
    ) {
        let _ = signal::kill(child, Signal::SIGKILL);
        let _ = wait4(child);
        return Err(e.into());
    }

    let timer = match opts.time_limit {
        Some(limit) => Some(WallTimer::arm(child, limit)?),
        None => None,
    };
    let started = Instant::now();

    let result = trace_loop(child, policy);
    let wall_time = started.elapsed();
    drop(timer);

    let (status, rusage, message) = match result {
        Ok(v) => v,
        Err(e) => {
            let _ = signal::kill(child, Signal::SIGKILL);
            let _ = wait4(child);
            return Err(e);
        }
    };

    Ok(ExitStat {
        outcome: WaitOutcome::from_status(status),
        cpu_time: cpu_time_of(&rusage),
        wall_time,
        memory_peak: (rusage.ru_maxrss.max(0) as u64) * 1024,
        output_size: output_size_of(&opts),
        message,
    })
}

fn trace_loop(
    child: Pid,
    policy: &mut dyn SyscallPolicy,
) -> Result<(libc::c_int, libc::rusage, Option<String>), SandboxError> {
    loop {
        // Entry to the next syscall.
        match wait_for_syscall(child)? {
            SyscallWait::Gone(status, rusage) => return Ok((status, rusage, None)),
            SyscallWait::Stop => {}
        }

        let regs = ptrace::getregs(child)?;
        let syscall_nr = regs.orig_rax;

        if !policy.check(child, syscall_nr) {
            let _ = signal::kill(child, Signal::SIGKILL);
            let (status, rusage) = wait4(child)?;
            return Ok((
                status,
                rusage,
                Some(format!("forbidden syscall: {syscall_nr}")),
            ));
        }

        // Step through the syscall's return.
        match wait_for_syscall(child)? {
            SyscallWait::Gone(status, rusage) => return Ok((status, rusage, None)),
            SyscallWait::Stop => {}
        }
    }
}

/// Thread-safe variant of [`run`]: the traced run happens in a forked
/// grandchild so that the process-wide timer and ptrace state stay isolated;
/// the `ExitStat` comes back over a pipe.
pub fn run_isolated(
    exec: &Path,
    args: &[String],
    opts: SandboxOptions,
    policy: &mut dyn SyscallPolicy,
) -> Result<ExitStat, SandboxError> {
    let (read_fd, write_fd) = unistd::pipe()?;

    let supervisor = match unsafe { unistd::fork() }? {
        ForkResult::Child => {
            drop(read_fd);
            let result: Result<ExitStat, String> =
                run(exec, args, opts, policy).map_err(|e| e.to_string());
            let mut pipe = File::from(write_fd);
            let ok = serde_json::to_writer(&mut pipe, &result).is_ok();
            drop(pipe);
            unsafe { libc::_exit(if ok { 0 } else { 1 }) };
        }
        ForkResult::Parent { child } => child,
    };
    drop(write_fd);

    let mut buf = Vec::new();
    let mut pipe = File::from(read_fd);
    let read_res = pipe.read_to_end(&mut buf);
    let (status, _) = wait4(supervisor)?;

    read_res?;
    if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 || buf.is_empty() {
        return Err(SandboxError::Isolated(
            "sandbox supervisor died before reporting".into(),
        ));
    }
    let result: Result<ExitStat, String> = serde_json::from_slice(&buf)
        .map_err(|e| SandboxError::Isolated(format!("bad report: {e}")))?;
    result.map_err(SandboxError::Isolated)
}

/// Untraced, rlimit-bounded process execution used for compiler runs.
///
/// The wall-clock limit is enforced by polling `waitpid(WNOHANG)` rather
/// than a process-wide timer, so concurrent calls are fine.
pub fn spawn(
    exec: &Path,
    args: &[String],
    opts: SandboxOptions,
) -> Result<ExitStat, SandboxError> {
    let child = match unsafe { unistd::fork() }? {
        ForkResult::Child => child_exec(exec, args, &opts, false),
        ForkResult::Parent { child } => child,
    };

    let started = Instant::now();
    let deadline = opts.time_limit.map(|limit| started + limit);

    let (status, rusage) = loop {
        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::wait4(child.as_raw(), &mut status, libc::WNOHANG, &mut rusage) };
        match Errno::result(rc) {
            Ok(0) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    let _ = signal::kill(child, Signal::SIGKILL);
                    break wait4(child)?;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(_) => break (status, rusage),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    };

    Ok(ExitStat {
        outcome: WaitOutcome::from_status(status),
        cpu_time: cpu_time_of(&rusage),
        wall_time: started.elapsed(),
        memory_peak: (rusage.ru_maxrss.max(0) as u64) * 1024,
        output_size: output_size_of(&opts),
        message: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_outcome_classifies_raw_statuses() {
        // Crafted like the kernel does: exit code in bits 8..16.
        let exited_zero = 0;
        assert_eq!(WaitOutcome::from_status(exited_zero), WaitOutcome::Exited(0));
        let exited_three = 3 << 8;
        assert_eq!(
            WaitOutcome::from_status(exited_three),
            WaitOutcome::Exited(3)
        );
        let killed = libc::SIGKILL;
        assert_eq!(
            WaitOutcome::from_status(killed),
            WaitOutcome::Signaled(libc::SIGKILL)
        );
        assert!(WaitOutcome::Signaled(libc::SIGKILL as i32).killed_by(Signal::SIGKILL));
        assert!(!WaitOutcome::Exited(0).killed_by(Signal::SIGKILL));
    }

    #[test]
    fn exit_stat_round_trips_through_json() {
        let stat = ExitStat {
            outcome: WaitOutcome::Signaled(9),
            cpu_time: Duration::from_millis(1234),
            wall_time: Duration::from_millis(2000),
            memory_peak: 64 << 20,
            output_size: 42,
            message: Some("forbidden syscall: 41".into()),
        };
        let json = serde_json::to_string(&stat).unwrap();
        let back: ExitStat = serde_json::from_str(&json).unwrap();
        assert_eq!(back.outcome, stat.outcome);
        assert_eq!(back.cpu_time, stat.cpu_time);
        assert_eq!(back.memory_peak, stat.memory_peak);
        assert_eq!(back.message.as_deref(), Some("forbidden syscall: 41"));
    }
}
