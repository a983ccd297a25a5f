//! Compiler drivers.
//!
//! Each language's compiler runs as an rlimit-bounded child via
//! [`sandbox::spawn`], optionally inside a proot filesystem jail, with its
//! stderr captured into an anonymous temporary file and truncated to
//! [`COMPILATION_ERRORS_MAX_LENGTH`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::sandbox::{self, SandboxError, SandboxOptions, StdioRedirect};

pub const COMPILATION_ERRORS_MAX_LENGTH: u64 = 32 << 10;

pub const COMPILATION_TIME_LIMIT: Duration = Duration::from_secs(30);
pub const COMPILATION_MEMORY_LIMIT: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation failed:\n{diagnostics}")]
    Failed { diagnostics: String },
    #[error("{0}")]
    Sandbox(#[from] SandboxError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolutionLanguage {
    C,
    Cpp,
    Pascal,
    Python,
    Rust,
}

impl SolutionLanguage {
    pub fn from_filename(path: &str) -> Option<SolutionLanguage> {
        let ext = Path::new(path).extension()?.to_str()?;
        match ext {
            "c" => Some(SolutionLanguage::C),
            "cc" | "cpp" | "cxx" => Some(SolutionLanguage::Cpp),
            "pas" | "pp" => Some(SolutionLanguage::Pascal),
            "py" => Some(SolutionLanguage::Python),
            "rs" => Some(SolutionLanguage::Rust),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SolutionLanguage::C => "C",
            SolutionLanguage::Cpp => "C++",
            SolutionLanguage::Pascal => "Pascal",
            SolutionLanguage::Python => "Python",
            SolutionLanguage::Rust => "Rust",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub time_limit: Duration,
    pub memory_limit: u64,
    pub max_diagnostics_len: u64,
    /// Path to the `proot` binary; when set the compiler runs jailed to its
    /// working set.
    pub proot_path: Option<PathBuf>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            time_limit: COMPILATION_TIME_LIMIT,
            memory_limit: COMPILATION_MEMORY_LIMIT,
            max_diagnostics_len: COMPILATION_ERRORS_MAX_LENGTH,
            proot_path: None,
        }
    }
}

fn compiler_argv(lang: SolutionLanguage, source: &str, dest: &str) -> Vec<String> {
    let args: Vec<&str> = match lang {
        SolutionLanguage::C => vec![
            "gcc", "-O2", "-static", "-std=gnu11", source, "-o", dest, "-lm",
        ],
        SolutionLanguage::Cpp => vec![
            "g++", "-O2", "-static", "-std=c++17", source, "-o", dest,
        ],
        SolutionLanguage::Pascal => {
            // fpc takes the output name as a glued flag before the source.
            let mut args: Vec<String> = ["fpc", "-O2", "-XS", "-Xt"]
                .into_iter()
                .map(str::to_string)
                .collect();
            args.push(format!("-o{dest}"));
            args.push(source.to_string());
            return args;
        }
        SolutionLanguage::Python => vec!["python3", "-m", "py_compile", source],
        SolutionLanguage::Rust => vec!["rustc", "-O", "--edition=2021", source, "-o", dest],
    };
    args.into_iter().map(str::to_string).collect()
}

/// Compiles `source` into the executable at `dest`.
///
/// Returns `CompileError::Failed` with the compiler's stderr (truncated to
/// `max_diagnostics_len`) on a non-zero compiler exit.
pub fn compile(
    source: &Path,
    dest: &Path,
    lang: SolutionLanguage,
    opts: &CompileOptions,
) -> Result<(), CompileError> {
    let source_str = source.to_string_lossy().into_owned();
    let dest_str = dest.to_string_lossy().into_owned();

    let mut argv = compiler_argv(lang, &source_str, &dest_str);
    if let Some(proot) = &opts.proot_path {
        let mut jailed = vec![proot.to_string_lossy().into_owned(), "-v".into(), "-1".into()];
        jailed.extend(argv);
        argv = jailed;
    }
    debug!(command = ?argv, "compiling");

    let diagnostics_file = tempfile::tempfile()?;
    let mut diagnostics_reader = diagnostics_file.try_clone()?;

    let exec = PathBuf::from(&argv[0]);
    let stat = sandbox::spawn(
        &exec,
        &argv,
        SandboxOptions {
            time_limit: Some(opts.time_limit),
            cpu_time_limit: Some(opts.time_limit),
            memory_limit: Some(opts.memory_limit),
            output_limit: None,
            stdin: StdioRedirect::Close,
            stdout: StdioRedirect::Close,
            stderr: StdioRedirect::File(diagnostics_file),
        },
    )?;

    if !stat.outcome.success() {
        diagnostics_reader.seek(SeekFrom::Start(0))?;
        let mut diagnostics = String::new();
        diagnostics_reader
            .take(opts.max_diagnostics_len)
            .read_to_string(&mut diagnostics)
            .unwrap_or(0);
        if diagnostics.is_empty() {
            diagnostics = format!("compiler {}", stat.outcome);
        }
        return Err(CompileError::Failed { diagnostics });
    }

    if lang == SolutionLanguage::Python {
        install_python_program(source, dest)?;
    }
    Ok(())
}

/// Python "compilation" is a syntax check; the runnable artifact is the
/// source behind an interpreter shebang.
fn install_python_program(source: &Path, dest: &Path) -> Result<(), CompileError> {
    let body = std::fs::read(source)?;
    let mut out = File::create(dest)?;
    if !body.starts_with(b"#!") {
        out.write_all(b"#!/usr/bin/env python3\n")?;
    }
    out.write_all(&body)?;
    let mut perms = out.metadata()?.permissions();
    perms.set_mode(0o755);
    out.set_permissions(perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_from_filename() {
        assert_eq!(
            SolutionLanguage::from_filename("prog/sum.cpp"),
            Some(SolutionLanguage::Cpp)
        );
        assert_eq!(
            SolutionLanguage::from_filename("a.c"),
            Some(SolutionLanguage::C)
        );
        assert_eq!(
            SolutionLanguage::from_filename("solve.py"),
            Some(SolutionLanguage::Python)
        );
        assert_eq!(
            SolutionLanguage::from_filename("main.rs"),
            Some(SolutionLanguage::Rust)
        );
        assert_eq!(SolutionLanguage::from_filename("README"), None);
        assert_eq!(SolutionLanguage::from_filename("archive.zip"), None);
    }

    #[test]
    fn compiler_argv_names_the_right_toolchains() {
        let argv = compiler_argv(SolutionLanguage::Cpp, "s.cpp", "exe");
        assert_eq!(argv[0], "g++");
        assert!(argv.contains(&"-static".to_string()));
        let argv = compiler_argv(SolutionLanguage::Rust, "s.rs", "exe");
        assert_eq!(argv[0], "rustc");
        let argv = compiler_argv(SolutionLanguage::Python, "s.py", "exe");
        assert_eq!(argv[..3], ["python3", "-m", "py_compile"]);
    }
}
