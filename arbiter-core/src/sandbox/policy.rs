//! Syscall policies for traced runs.
//!
//! A policy is a three-part table: unconditionally `allowed` syscalls,
//! `limited` syscalls with a residual budget, and the architecture the
//! numbers belong to. The architecture is auto-detected from the child's
//! ELF on the first and second check, which covers the pre-exec and
//! post-exec images.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::io::IoSliceMut;
use std::path::PathBuf;

use nix::sys::ptrace;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;

/// Decides whether the child may perform a syscall. Called at every
/// syscall-entry stop with the raw syscall number.
pub trait SyscallPolicy {
    fn check(&mut self, pid: Pid, syscall: u64) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arch {
    I386,
    X8664,
}

impl Arch {
    fn index(self) -> usize {
        match self {
            Arch::I386 => 0,
            Arch::X8664 => 1,
        }
    }
}

/// Reads the ELF class byte of `/proc/<pid>/exe`. Falls back to i386 when
/// the image cannot be inspected, matching the stricter table.
fn detect_arch(pid: Pid) -> Arch {
    let path = format!("/proc/{}/exe", pid.as_raw());
    let class = File::open(path).ok().and_then(|mut f| {
        f.seek(SeekFrom::Start(4)).ok()?;
        let mut byte = [0u8; 1];
        f.read_exact(&mut byte).ok()?;
        Some(byte[0])
    });
    match class {
        Some(2) => Arch::X8664,
        _ => Arch::I386,
    }
}

// i386 syscall numbers.
const ALLOWED_I386: &[u64] = &[
    1,   // exit
    3,   // read
    4,   // write
    6,   // close
    45,  // brk
    54,  // ioctl
    90,  // mmap
    91,  // munmap
    108, // fstat
    192, // mmap2
    197, // fstat64
    252, // exit_group
];

const LIMITED_I386: &[(u64, u32)] = &[
    (11, 1),  // execve
    (33, 1),  // access
    (85, 1),  // readlink
    (122, 1), // uname
    (243, 1), // set_thread_area
];

// x86_64 syscall numbers.
const ALLOWED_X8664: &[u64] = &[
    0,   // read
    1,   // write
    3,   // close
    5,   // fstat
    9,   // mmap
    11,  // munmap
    12,  // brk
    16,  // ioctl
    60,  // exit
    231, // exit_group
];

const LIMITED_X8664: &[(u64, u32)] = &[
    (21, 1),  // access
    (59, 1),  // execve
    (63, 1),  // uname
    (89, 1),  // readlink
    (158, 1), // arch_prctl
    (205, 1), // set_thread_area
];

const SYS_OPEN: [u64; 2] = [5, 2];
const SYS_OPENAT: [u64; 2] = [295, 257];

/// Minimal policy for judged solutions. Everything outside the tables is
/// forbidden.
pub struct DefaultPolicy {
    arch: Arch,
    checks_done: u32,
    limited: [Vec<(u64, i64)>; 2],
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultPolicy {
    pub fn new() -> Self {
        DefaultPolicy {
            arch: Arch::I386,
            checks_done: 0,
            limited: [
                LIMITED_I386.iter().map(|&(nr, n)| (nr, i64::from(n))).collect(),
                LIMITED_X8664.iter().map(|&(nr, n)| (nr, i64::from(n))).collect(),
            ],
        }
    }

    fn refresh_arch(&mut self, pid: Pid) {
        // First call sees the pre-exec image, second the post-exec one.
        if self.checks_done < 2 {
            self.arch = detect_arch(pid);
        }
        self.checks_done = self.checks_done.saturating_add(1);
    }

    fn table_check(&mut self, syscall: u64) -> bool {
        let idx = self.arch.index();
        let allowed = match self.arch {
            Arch::I386 => ALLOWED_I386,
            Arch::X8664 => ALLOWED_X8664,
        };
        if allowed.contains(&syscall) {
            return true;
        }
        for entry in &mut self.limited[idx] {
            if entry.0 == syscall {
                entry.1 -= 1;
                return entry.1 >= 0;
            }
        }
        false
    }
}

impl SyscallPolicy for DefaultPolicy {
    fn check(&mut self, pid: Pid, syscall: u64) -> bool {
        self.refresh_arch(pid);
        self.table_check(syscall)
    }
}

/// Policy for checker programs: the default tables plus `open`/`openat`
/// restricted to an explicit allow-list of file paths (the checker is
/// handed the test input, the correct output and the submitter's output).
pub struct CheckerPolicy {
    inner: DefaultPolicy,
    allowed_paths: Vec<PathBuf>,
}

impl CheckerPolicy {
    pub fn new(allowed_paths: Vec<PathBuf>) -> Self {
        CheckerPolicy {
            inner: DefaultPolicy::new(),
            allowed_paths,
        }
    }

    fn open_path_allowed(&self, pid: Pid, syscall: u64) -> bool {
        let idx = self.inner.arch.index();
        let regs = match ptrace::getregs(pid) {
            Ok(regs) => regs,
            Err(_) => return false,
        };
        // Path argument register: open -> arg0, openat -> arg1; for i386
        // children the 32-bit registers alias the low halves.
        let addr = if syscall == SYS_OPEN[idx] {
            match self.inner.arch {
                Arch::I386 => regs.rbx,
                Arch::X8664 => regs.rdi,
            }
        } else {
            match self.inner.arch {
                Arch::I386 => regs.rcx,
                Arch::X8664 => regs.rsi,
            }
        };

        let Some(path) = read_child_path(pid, addr as usize) else {
            return false;
        };
        let path = PathBuf::from(path);
        self.allowed_paths.iter().any(|p| *p == path)
    }
}

impl SyscallPolicy for CheckerPolicy {
    fn check(&mut self, pid: Pid, syscall: u64) -> bool {
        self.inner.refresh_arch(pid);
        let idx = self.inner.arch.index();
        if syscall == SYS_OPEN[idx] || syscall == SYS_OPENAT[idx] {
            return self.open_path_allowed(pid, syscall);
        }
        self.inner.table_check(syscall)
    }
}

const PATH_READ_MAX: usize = 4096;

/// Reads a NUL-terminated path out of the child's memory.
fn read_child_path(pid: Pid, addr: usize) -> Option<String> {
    if addr == 0 {
        return None;
    }
    let mut buf = vec![0u8; PATH_READ_MAX];
    let read = {
        let mut local = [IoSliceMut::new(&mut buf)];
        let remote = [RemoteIoVec {
            base: addr,
            len: PATH_READ_MAX,
        }];
        process_vm_readv(pid, &mut local, &remote).ok()?
    };
    let nul = buf[..read].iter().position(|&b| b == 0)?;
    String::from_utf8(buf[..nul].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x86_64_policy() -> DefaultPolicy {
        let mut p = DefaultPolicy::new();
        p.arch = Arch::X8664;
        p.checks_done = 2; // Freeze detection.
        p
    }

    #[test]
    fn allowed_syscalls_pass_indefinitely() {
        let mut p = x86_64_policy();
        for _ in 0..100 {
            assert!(p.table_check(0)); // read
            assert!(p.table_check(1)); // write
            assert!(p.table_check(231)); // exit_group
        }
    }

    #[test]
    fn limited_syscall_budget_is_consumed() {
        let mut p = x86_64_policy();
        assert!(p.table_check(59)); // first execve passes
        assert!(!p.table_check(59)); // the second is forbidden
        assert!(!p.table_check(59));
    }

    #[test]
    fn unknown_syscalls_are_forbidden() {
        let mut p = x86_64_policy();
        assert!(!p.table_check(2)); // open
        assert!(!p.table_check(41)); // socket
        assert!(!p.table_check(57)); // fork
    }

    #[test]
    fn i386_table_is_independent() {
        let mut p = DefaultPolicy::new();
        p.checks_done = 2;
        assert_eq!(p.arch, Arch::I386);
        assert!(p.table_check(4)); // write on i386
        assert!(p.table_check(1)); // exit on i386
        assert!(!p.table_check(60)); // x86_64 exit number means nothing here
    }
}
