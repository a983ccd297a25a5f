//! Checker invocation.
//!
//! After a solution has produced its output, the checker runs as
//! `checker <input> <correct_output> <submitter_output>` under the checker
//! syscall policy, which permits opening exactly those three files. Its
//! exit code carries the verdict: `0` passes (optionally with a decimal
//! score ratio on stdout for partial credit), `1` is a wrong answer, and
//! anything else is a judge-level checker error.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::sandbox::{
    self, CheckerPolicy, SandboxError, SandboxOptions, StdioRedirect, WaitOutcome,
};

pub const CHECKER_TIME_LIMIT: Duration = Duration::from_secs(10);
pub const CHECKER_MEMORY_LIMIT: u64 = 256 << 20;

/// Longest checker comment kept verbatim; anything longer is cut and
/// suffixed with `...`.
pub const CHECKER_COMMENT_MAX: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum CheckerVerdict {
    /// Test passes with the given score ratio in `[0, 1]`.
    Passed { ratio: f64 },
    WrongAnswer,
    /// Judge-level fault: the checker misbehaved.
    Error(String),
}

#[derive(Debug, Clone)]
pub struct CheckerOutcome {
    pub verdict: CheckerVerdict,
    /// Bounded excerpt of the checker's stdout.
    pub comment: String,
}

/// Runs the checker over one test. `scratch` receives the checker's stdout
/// and is truncated first.
pub fn run_checker(
    checker_exe: &Path,
    input: &Path,
    correct_output: &Path,
    submitter_output: &Path,
    scratch: &Path,
) -> Result<CheckerOutcome, SandboxError> {
    let stdout = File::create(scratch)?;

    let argv = vec![
        checker_exe.to_string_lossy().into_owned(),
        input.to_string_lossy().into_owned(),
        correct_output.to_string_lossy().into_owned(),
        submitter_output.to_string_lossy().into_owned(),
    ];
    let mut policy = CheckerPolicy::new(vec![
        input.to_path_buf(),
        correct_output.to_path_buf(),
        submitter_output.to_path_buf(),
    ]);

    let stat = sandbox::run_isolated(
        checker_exe,
        &argv,
        SandboxOptions {
            time_limit: Some(CHECKER_TIME_LIMIT),
            cpu_time_limit: Some(CHECKER_TIME_LIMIT),
            memory_limit: Some(CHECKER_MEMORY_LIMIT),
            output_limit: None,
            stdin: StdioRedirect::Close,
            stdout: StdioRedirect::File(stdout),
            stderr: StdioRedirect::Close,
        },
        &mut policy,
    )?;

    let comment = read_comment(scratch);
    let verdict = match stat.outcome {
        WaitOutcome::Exited(0) => CheckerVerdict::Passed {
            ratio: parse_ratio(&comment),
        },
        WaitOutcome::Exited(1) => CheckerVerdict::WrongAnswer,
        outcome => {
            let mut desc = format!("checker {outcome}");
            if let Some(msg) = &stat.message {
                desc.push_str(" (");
                desc.push_str(msg);
                desc.push(')');
            }
            CheckerVerdict::Error(desc)
        }
    };

    Ok(CheckerOutcome { verdict, comment })
}

/// First token of the checker's stdout as a ratio in `[0, 1]`; a missing or
/// malformed value means full credit.
fn parse_ratio(comment: &str) -> f64 {
    comment
        .split_whitespace()
        .next()
        .and_then(|tok| tok.parse::<f64>().ok())
        .filter(|r| (0.0..=1.0).contains(r))
        .unwrap_or(1.0)
}

fn read_comment(path: &Path) -> String {
    let mut buf = vec![0u8; CHECKER_COMMENT_MAX + 4];
    let read = File::open(path)
        .and_then(|mut f| f.read(&mut buf))
        .unwrap_or(0);
    let mut text = String::from_utf8_lossy(&buf[..read]).into_owned();
    truncate_comment(&mut text);
    text
}

fn truncate_comment(text: &mut String) {
    text.truncate(text.trim_end().len());
    if text.len() > CHECKER_COMMENT_MAX {
        let mut cut = CHECKER_COMMENT_MAX;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_parsing() {
        assert_eq!(parse_ratio("0.5 close enough"), 0.5);
        assert_eq!(parse_ratio("1"), 1.0);
        assert_eq!(parse_ratio("0"), 0.0);
        // Out-of-range or missing values mean full credit.
        assert_eq!(parse_ratio("2.5"), 1.0);
        assert_eq!(parse_ratio("ok"), 1.0);
        assert_eq!(parse_ratio(""), 1.0);
    }

    #[test]
    fn comments_are_trimmed_and_bounded() {
        let mut short = String::from("wrong at token 3  \n");
        truncate_comment(&mut short);
        assert_eq!(short, "wrong at token 3");

        let mut long = "x".repeat(CHECKER_COMMENT_MAX + 50);
        truncate_comment(&mut long);
        assert_eq!(long.len(), CHECKER_COMMENT_MAX + 3);
        assert!(long.ends_with("..."));

        let mut exact = "y".repeat(CHECKER_COMMENT_MAX);
        truncate_comment(&mut exact);
        assert_eq!(exact.len(), CHECKER_COMMENT_MAX);
        assert!(!exact.ends_with("..."));
    }
}
