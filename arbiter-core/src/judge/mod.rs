//! The judge worker.
//!
//! Drives one package + one solution through compile, per-test sandboxed
//! execution, checker verification and group scoring, producing a
//! [`JudgeReport`]. A partial report is emitted through the caller's
//! callback after every test so that clients can show progress.

mod report;

pub use report::{classify, GroupReport, JudgeReport, TestReport, TestStatus};

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

use crate::checker::{self, CheckerVerdict};
use crate::compile::{self, CompileError, CompileOptions, SolutionLanguage};
use crate::package::{Package, PackageError};
use crate::sandbox::{self, DefaultPolicy, SandboxError, SandboxOptions, StdioRedirect};
use crate::simfile::{Simfile, SimfileError, TestGroup};

/// Slope of the runtime score cut. From a runtime of zero to half the limit
/// the ratio clamps to 1; from there it decays linearly and bottoms out at
/// zero.
pub const SCORE_CUT_LAMBDA: f64 = 2.0;

/// Cap on bytes a solution may write to its output file.
pub const SOLUTION_OUTPUT_LIMIT: u64 = 100 << 20;

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("{0}")]
    Package(#[from] PackageError),
    #[error("{0}")]
    Simfile(#[from] SimfileError),
    #[error("{0}")]
    Sandbox(#[from] SandboxError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("solution or checker has not been compiled")]
    NotCompiled,
}

fn io_err(path: &Path, source: std::io::Error) -> JudgeError {
    JudgeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Sink for the human-readable judging log.
pub trait JudgeLog {
    fn line(&mut self, msg: &str);
}

/// Logs through `tracing` only; useful when no job log is around.
#[derive(Default)]
pub struct TracingJudgeLog;

impl JudgeLog for TracingJudgeLog {
    fn line(&mut self, msg: &str) {
        debug!(target: "judge", "{msg}");
    }
}

pub struct JudgeWorker {
    package: Package,
    simfile: Simfile,
    work: TempDir,
    solution_exe: Option<PathBuf>,
    checker_exe: Option<PathBuf>,
    compile_options: CompileOptions,
}

impl JudgeWorker {
    /// Opens a package; `simfile_override` replaces the package's manifest
    /// (used while a new manifest is being constructed).
    pub fn load_package(
        package_path: &Path,
        simfile_override: Option<&str>,
    ) -> Result<JudgeWorker, JudgeError> {
        let package = Package::open(package_path)?;
        let simfile = match simfile_override {
            Some(text) => Simfile::parse(text)?,
            None => package.read_simfile()?,
        };
        let work = TempDir::new().map_err(|e| io_err(Path::new("tempdir"), e))?;
        Ok(JudgeWorker {
            package,
            simfile,
            work,
            solution_exe: None,
            checker_exe: None,
            compile_options: CompileOptions::default(),
        })
    }

    pub fn simfile(&self) -> &Simfile {
        &self.simfile
    }

    pub fn set_compile_options(&mut self, opts: CompileOptions) {
        self.compile_options = opts;
    }

    pub fn compile_solution(
        &mut self,
        source: &Path,
        lang: SolutionLanguage,
    ) -> Result<(), CompileError> {
        let dest = self.work.path().join("solution");
        compile::compile(source, &dest, lang, &self.compile_options)?;
        self.solution_exe = Some(dest);
        Ok(())
    }

    /// Compiles a solution shipped inside the package (the model solution).
    pub fn compile_solution_from_package(&mut self, rel: &str) -> Result<(), CompileError> {
        let lang = SolutionLanguage::from_filename(rel).ok_or_else(|| CompileError::Failed {
            diagnostics: format!("unknown solution language: {rel}"),
        })?;
        let source = self
            .package
            .entry_path(rel)
            .map_err(|e| CompileError::Failed {
                diagnostics: e.to_string(),
            })?;
        self.compile_solution(&source, lang)
    }

    pub fn compile_checker(&mut self) -> Result<(), CompileError> {
        let lang = SolutionLanguage::from_filename(&self.simfile.checker).ok_or_else(|| {
            CompileError::Failed {
                diagnostics: format!("unknown checker language: {}", self.simfile.checker),
            }
        })?;
        let source = self
            .package
            .entry_path(&self.simfile.checker)
            .map_err(|e| CompileError::Failed {
                diagnostics: e.to_string(),
            })?;
        let dest = self.work.path().join("checker");
        compile::compile(&source, &dest, lang, &self.compile_options)?;
        self.checker_exe = Some(dest);
        Ok(())
    }

    /// Judges the solution. With `final_run == false` only the zero-scored
    /// sample groups run; with `true` all groups run. `partial` receives a
    /// report after every test, with not-yet-run tests marked `Skipped`.
    pub fn judge(
        &self,
        final_run: bool,
        log: &mut dyn JudgeLog,
        partial: &mut dyn FnMut(&JudgeReport),
    ) -> Result<JudgeReport, JudgeError> {
        let solution = self.solution_exe.as_deref().ok_or(JudgeError::NotCompiled)?;
        let checker = self.checker_exe.as_deref().ok_or(JudgeError::NotCompiled)?;

        let groups: Vec<&TestGroup> = self
            .simfile
            .groups
            .iter()
            .filter(|g| final_run || g.points == 0)
            .collect();

        log.line(&format!(
            "Judging ({}): {{",
            if final_run { "final" } else { "initial" }
        ));

        let memory_limit = self.simfile.memory_limit_bytes();
        let answer_path = self.work.path().join("answer");
        let checker_scratch = self.work.path().join("checker_out");

        // Scaffold the report up front so partial reports can show pending
        // tests as skipped.
        let mut report = JudgeReport {
            groups: groups
                .iter()
                .map(|g| GroupReport {
                    score: 0,
                    max_score: g.points,
                    tests: g
                        .tests
                        .iter()
                        .map(|t| TestReport {
                            name: t.name.clone(),
                            status: TestStatus::Skipped,
                            runtime: Duration::ZERO,
                            time_limit: t.time_limit,
                            memory_consumed: 0,
                            memory_limit,
                            comment: String::new(),
                        })
                        .collect(),
                })
                .collect(),
        };

        for (group_idx, group) in groups.iter().enumerate() {
            let mut ratio: f64 = 1.0;

            for (test_idx, test) in group.tests.iter().enumerate() {
                let input_path = self.package.input_path(&test.name);
                let stdin = File::open(&input_path).map_err(|e| io_err(&input_path, e))?;
                let stdout = File::create(&answer_path).map_err(|e| io_err(&answer_path, e))?;

                let mut policy = DefaultPolicy::new();
                let stat = sandbox::run_isolated(
                    solution,
                    &[solution.to_string_lossy().into_owned()],
                    SandboxOptions {
                        time_limit: Some(test.time_limit),
                        cpu_time_limit: Some(test.time_limit),
                        memory_limit: Some(memory_limit),
                        output_limit: Some(SOLUTION_OUTPUT_LIMIT),
                        stdin: StdioRedirect::File(stdin),
                        stdout: StdioRedirect::File(stdout),
                        stderr: StdioRedirect::Close,
                    },
                    &mut policy,
                )?;

                let mut status = classify(
                    &stat,
                    test.time_limit,
                    memory_limit,
                    Some(SOLUTION_OUTPUT_LIMIT),
                );
                let mut comment = String::new();
                if status == TestStatus::Rte {
                    comment = match &stat.message {
                        Some(msg) => format!("{} ({msg})", stat.outcome),
                        None => stat.outcome.to_string(),
                    };
                }

                let mut checker_ratio = 1.0;
                if status == TestStatus::Ok {
                    let outcome = checker::run_checker(
                        checker,
                        &input_path,
                        &self.package.correct_output_path(&test.name),
                        &answer_path,
                        &checker_scratch,
                    )?;
                    match outcome.verdict {
                        CheckerVerdict::Passed { ratio } => checker_ratio = ratio,
                        CheckerVerdict::WrongAnswer => {
                            status = TestStatus::Wa;
                            comment = outcome.comment;
                        }
                        CheckerVerdict::Error(desc) => {
                            status = TestStatus::CheckerError;
                            comment = desc;
                        }
                    }
                }

                let test_ratio = if status == TestStatus::Ok {
                    score_cut(stat.wall_time, test.time_limit) * checker_ratio
                } else {
                    0.0
                };
                ratio = ratio.min(test_ratio);

                log.line(&format!(
                    "  {:<12} {:.2} / {:.2} s  {} / {} KiB  Status: {}{}",
                    test.name,
                    stat.wall_time.as_secs_f64(),
                    test.time_limit.as_secs_f64(),
                    stat.memory_peak >> 10,
                    memory_limit >> 10,
                    status.short(),
                    if comment.is_empty() {
                        String::new()
                    } else {
                        format!(" ({comment})")
                    },
                ));

                {
                    let entry = &mut report.groups[group_idx].tests[test_idx];
                    entry.status = status;
                    entry.runtime = stat.wall_time;
                    entry.memory_consumed = stat.memory_peak;
                    entry.comment = comment;
                }
                report.groups[group_idx].score = group_score(group.points, ratio);

                partial(&report);
            }

            log.line(&format!(
                "Score: {} / {} (ratio: {ratio:.4})",
                report.groups[group_idx].score, group.points
            ));
        }

        log.line(&format!(
            "Total score: {} / {}",
            report.total_score(),
            report.max_score()
        ));
        log.line("}");

        Ok(report)
    }
}

/// Runtime-to-ratio curve:
/// `clamp01(1 + SCORE_CUT_LAMBDA * (1 - 2 * runtime / time_limit))`.
pub fn score_cut(runtime: Duration, time_limit: Duration) -> f64 {
    if time_limit.is_zero() {
        return 0.0;
    }
    let r = runtime.as_secs_f64() / time_limit.as_secs_f64();
    (1.0 + SCORE_CUT_LAMBDA * (1.0 - 2.0 * r)).clamp(0.0, 1.0)
}

fn group_score(points: i64, ratio: f64) -> i64 {
    (points as f64 * ratio).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    const TL: Duration = Duration::from_secs(1);

    #[test]
    fn score_cut_is_flat_then_decays() {
        // Up to half the limit the ratio is a full 1.
        assert_eq!(score_cut(Duration::ZERO, TL), 1.0);
        assert_eq!(score_cut(Duration::from_millis(250), TL), 1.0);
        assert_eq!(score_cut(Duration::from_millis(500), TL), 1.0);
        // Decay past the midpoint.
        let at_625 = score_cut(Duration::from_millis(625), TL);
        assert!((at_625 - 0.5).abs() < 1e-9);
        let at_750 = score_cut(Duration::from_millis(750), TL);
        assert!(at_750.abs() < 1e-9);
        // Beyond the cut everything clamps to zero.
        assert_eq!(score_cut(TL, TL), 0.0);
        assert_eq!(score_cut(Duration::from_secs(3), TL), 0.0);
    }

    #[test]
    fn group_scores_round() {
        assert_eq!(group_score(100, 1.0), 100);
        assert_eq!(group_score(100, 0.0), 0);
        assert_eq!(group_score(100, 0.456), 46);
        assert_eq!(group_score(0, 1.0), 0);
    }
}
