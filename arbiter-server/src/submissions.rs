//! Submission model and status aggregation.

use arbiter_core::compile::SolutionLanguage;
use arbiter_core::judge::{JudgeReport, TestStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubmissionStatus {
    Ok = 0,
    Wa = 1,
    Tle = 2,
    Mle = 3,
    Ole = 4,
    Rte = 5,
    CompilationError = 6,
    CheckerCompilationError = 7,
    JudgeError = 8,
    Pending = 9,
}

impl SubmissionStatus {
    pub fn from_u8(value: u8) -> Option<SubmissionStatus> {
        use SubmissionStatus::*;
        Some(match value {
            0 => Ok,
            1 => Wa,
            2 => Tle,
            3 => Mle,
            4 => Ole,
            5 => Rte,
            6 => CompilationError,
            7 => CheckerCompilationError,
            8 => JudgeError,
            9 => Pending,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            SubmissionStatus::Ok => "OK",
            SubmissionStatus::Wa => "Wrong answer",
            SubmissionStatus::Tle => "Time limit exceeded",
            SubmissionStatus::Mle => "Memory limit exceeded",
            SubmissionStatus::Ole => "Output size limit exceeded",
            SubmissionStatus::Rte => "Runtime error",
            SubmissionStatus::CompilationError => "Compilation failed",
            SubmissionStatus::CheckerCompilationError => "Checker compilation failed",
            SubmissionStatus::JudgeError => "Judge error",
            SubmissionStatus::Pending => "Pending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubmissionKind {
    Normal = 0,
    /// A solution shipped in the problem package; never a user's entry.
    ProblemSolution = 1,
}

impl SubmissionKind {
    pub fn from_u8(value: u8) -> Option<SubmissionKind> {
        Some(match value {
            0 => SubmissionKind::Normal,
            1 => SubmissionKind::ProblemSolution,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

pub fn language_as_u8(lang: SolutionLanguage) -> u8 {
    match lang {
        SolutionLanguage::C => 0,
        SolutionLanguage::Cpp => 1,
        SolutionLanguage::Pascal => 2,
        SolutionLanguage::Python => 3,
        SolutionLanguage::Rust => 4,
    }
}

pub fn language_from_u8(value: u8) -> Option<SolutionLanguage> {
    Some(match value {
        0 => SolutionLanguage::C,
        1 => SolutionLanguage::Cpp,
        2 => SolutionLanguage::Pascal,
        3 => SolutionLanguage::Python,
        4 => SolutionLanguage::Rust,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRow {
    pub id: i64,
    pub created_at: String,
    pub file_id: i64,
    pub user_id: Option<i64>,
    pub problem_id: i64,
    pub contest_problem_id: Option<i64>,
    pub contest_round_id: Option<i64>,
    pub contest_id: Option<i64>,
    pub kind: SubmissionKind,
    pub language: SolutionLanguage,
    pub initial_status: SubmissionStatus,
    pub full_status: SubmissionStatus,
    pub score: Option<i64>,
    pub last_judgment_began_at: Option<String>,
    pub initial_report: String,
    pub final_report: String,
    pub problem_final: bool,
    pub contest_problem_final: bool,
    pub contest_problem_initial_final: bool,
}

/// Submission status of a judge report: the worst test status, with a
/// checker error anywhere surfacing as a judge error.
pub fn status_of_report(report: &JudgeReport) -> SubmissionStatus {
    match report.worst_status() {
        TestStatus::CheckerError => SubmissionStatus::JudgeError,
        TestStatus::Mle => SubmissionStatus::Mle,
        TestStatus::Ole => SubmissionStatus::Ole,
        TestStatus::Rte => SubmissionStatus::Rte,
        TestStatus::Tle => SubmissionStatus::Tle,
        TestStatus::Wa => SubmissionStatus::Wa,
        TestStatus::Ok | TestStatus::Skipped => SubmissionStatus::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::judge::{GroupReport, TestReport};
    use std::time::Duration;

    fn report_with(statuses: &[TestStatus]) -> JudgeReport {
        JudgeReport {
            groups: vec![GroupReport {
                score: 0,
                max_score: 100,
                tests: statuses
                    .iter()
                    .enumerate()
                    .map(|(i, &status)| TestReport {
                        name: format!("t{i}"),
                        status,
                        runtime: Duration::ZERO,
                        time_limit: Duration::from_secs(1),
                        memory_consumed: 0,
                        memory_limit: 64 << 20,
                        comment: String::new(),
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn checker_error_maps_to_judge_error() {
        let r = report_with(&[TestStatus::Ok, TestStatus::CheckerError, TestStatus::Mle]);
        assert_eq!(status_of_report(&r), SubmissionStatus::JudgeError);
    }

    #[test]
    fn worst_status_wins() {
        let r = report_with(&[TestStatus::Wa, TestStatus::Tle, TestStatus::Ok]);
        assert_eq!(status_of_report(&r), SubmissionStatus::Tle);
        let r = report_with(&[TestStatus::Ok, TestStatus::Skipped]);
        assert_eq!(status_of_report(&r), SubmissionStatus::Ok);
    }

    #[test]
    fn status_round_trips_through_u8() {
        for v in 0..=9 {
            let status = SubmissionStatus::from_u8(v).unwrap();
            assert_eq!(status.as_u8(), v);
        }
        assert_eq!(SubmissionStatus::from_u8(10), None);
    }
}
