//! Judging library: sandboxed execution of untrusted programs, compiler
//! drivers, checker invocation, problem-package handling and the judge
//! worker that turns a package plus a solution into a [`judge::JudgeReport`].
//!
//! Everything here is synchronous. Tracing a child with ptrace must stay on
//! one OS thread, so async callers are expected to enter through
//! `tokio::task::spawn_blocking` (or equivalent) and use the isolated
//! sandbox variant.

pub mod checker;
pub mod compile;
pub mod judge;
pub mod package;
pub mod sandbox;
pub mod simfile;

pub use compile::SolutionLanguage;
pub use judge::{JudgeReport, JudgeWorker, TestStatus};
pub use sandbox::{ExitStat, SandboxOptions, StdioRedirect};
pub use simfile::Simfile;
