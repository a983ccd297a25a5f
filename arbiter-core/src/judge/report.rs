//! Judge report structure and test classification.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::{ExitStat, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    Ok,
    Wa,
    Tle,
    Mle,
    Ole,
    Rte,
    CheckerError,
    Skipped,
}

impl TestStatus {
    /// Severity used for submission-status aggregation; higher loses.
    pub fn severity(&self) -> u8 {
        match self {
            TestStatus::Skipped => 0,
            TestStatus::Ok => 1,
            TestStatus::Wa => 2,
            TestStatus::Tle => 3,
            TestStatus::Rte => 4,
            TestStatus::Ole => 5,
            TestStatus::Mle => 6,
            TestStatus::CheckerError => 7,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TestStatus::Ok => "OK",
            TestStatus::Wa => "Wrong answer",
            TestStatus::Tle => "Time limit exceeded",
            TestStatus::Mle => "Memory limit exceeded",
            TestStatus::Ole => "Output size limit exceeded",
            TestStatus::Rte => "Runtime error",
            TestStatus::CheckerError => "Checker error",
            TestStatus::Skipped => "Pending",
        }
    }

    pub fn short(&self) -> &'static str {
        match self {
            TestStatus::Ok => "OK",
            TestStatus::Wa => "WA",
            TestStatus::Tle => "TLE",
            TestStatus::Mle => "MLE",
            TestStatus::Ole => "OLE",
            TestStatus::Rte => "RTE",
            TestStatus::CheckerError => "CHECKER ERROR",
            TestStatus::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub status: TestStatus,
    pub runtime: Duration,
    pub time_limit: Duration,
    pub memory_consumed: u64,
    pub memory_limit: u64,
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupReport {
    pub score: i64,
    pub max_score: i64,
    pub tests: Vec<TestReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeReport {
    /// Declaration order of the Simfile.
    pub groups: Vec<GroupReport>,
}

impl JudgeReport {
    pub fn total_score(&self) -> i64 {
        self.groups.iter().map(|g| g.score).sum()
    }

    pub fn max_score(&self) -> i64 {
        self.groups.iter().map(|g| g.max_score).sum()
    }

    /// Worst test status across the whole report, by severity. An empty
    /// report is `Skipped`.
    pub fn worst_status(&self) -> TestStatus {
        self.groups
            .iter()
            .flat_map(|g| &g.tests)
            .map(|t| t.status)
            .max_by_key(|s| s.severity())
            .unwrap_or(TestStatus::Skipped)
    }
}

/// Classifies one solution run against the test's limits.
///
/// MLE takes priority over everything, then OLE; a clean exit within the
/// caps is OK; TLE requires the kill signal (the wall timer), anything else
/// that went wrong is RTE.
pub fn classify(
    stat: &ExitStat,
    time_limit: Duration,
    memory_limit: u64,
    output_limit: Option<u64>,
) -> TestStatus {
    if stat.memory_peak >= memory_limit {
        return TestStatus::Mle;
    }
    if matches!(stat.outcome, WaitOutcome::Signaled(sig) if sig == libc::SIGXFSZ)
        || output_limit.is_some_and(|cap| stat.output_size > cap)
    {
        return TestStatus::Ole;
    }
    match stat.outcome {
        WaitOutcome::Exited(0) => TestStatus::Ok,
        WaitOutcome::Signaled(_) if stat.wall_time >= time_limit => TestStatus::Tle,
        _ => TestStatus::Rte,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(outcome: WaitOutcome, wall_ms: u64, memory: u64, output: u64) -> ExitStat {
        ExitStat {
            outcome,
            cpu_time: Duration::from_millis(wall_ms),
            wall_time: Duration::from_millis(wall_ms),
            memory_peak: memory,
            output_size: output,
            message: None,
        }
    }

    const TL: Duration = Duration::from_secs(1);
    const ML: u64 = 64 << 20;

    #[test]
    fn clean_exit_within_limits_is_ok() {
        let s = stat(WaitOutcome::Exited(0), 200, 1 << 20, 10);
        assert_eq!(classify(&s, TL, ML, Some(1 << 20)), TestStatus::Ok);
    }

    #[test]
    fn killed_at_exactly_the_limit_is_tle() {
        let s = stat(WaitOutcome::Signaled(libc::SIGKILL), 1000, 1 << 20, 0);
        assert_eq!(classify(&s, TL, ML, None), TestStatus::Tle);
    }

    #[test]
    fn signal_before_the_limit_is_rte() {
        let s = stat(WaitOutcome::Signaled(libc::SIGSEGV), 100, 1 << 20, 0);
        assert_eq!(classify(&s, TL, ML, None), TestStatus::Rte);
    }

    #[test]
    fn nonzero_exit_is_rte() {
        let s = stat(WaitOutcome::Exited(1), 100, 1 << 20, 0);
        assert_eq!(classify(&s, TL, ML, None), TestStatus::Rte);
    }

    #[test]
    fn memory_over_limit_beats_rte() {
        let s = stat(WaitOutcome::Signaled(libc::SIGSEGV), 100, ML, 0);
        assert_eq!(classify(&s, TL, ML, None), TestStatus::Mle);
    }

    #[test]
    fn output_at_the_cap_is_ok_one_byte_more_is_ole() {
        let cap = 1000;
        let at_cap = stat(WaitOutcome::Exited(0), 100, 1 << 20, cap);
        assert_eq!(classify(&at_cap, TL, ML, Some(cap)), TestStatus::Ok);
        let over = stat(WaitOutcome::Exited(0), 100, 1 << 20, cap + 1);
        assert_eq!(classify(&over, TL, ML, Some(cap)), TestStatus::Ole);
        // The fsize rlimit stops the child at the cap with SIGXFSZ.
        let truncated = stat(WaitOutcome::Signaled(libc::SIGXFSZ), 100, 1 << 20, cap);
        assert_eq!(classify(&truncated, TL, ML, Some(cap)), TestStatus::Ole);
    }

    #[test]
    fn worst_status_uses_severity_order() {
        let report = JudgeReport {
            groups: vec![GroupReport {
                score: 0,
                max_score: 100,
                tests: vec![
                    TestReport {
                        name: "t1".into(),
                        status: TestStatus::Wa,
                        runtime: Duration::ZERO,
                        time_limit: TL,
                        memory_consumed: 0,
                        memory_limit: ML,
                        comment: String::new(),
                    },
                    TestReport {
                        name: "t2".into(),
                        status: TestStatus::Mle,
                        runtime: Duration::ZERO,
                        time_limit: TL,
                        memory_consumed: 0,
                        memory_limit: ML,
                        comment: String::new(),
                    },
                    TestReport {
                        name: "t3".into(),
                        status: TestStatus::Tle,
                        runtime: Duration::ZERO,
                        time_limit: TL,
                        memory_consumed: 0,
                        memory_limit: ML,
                        comment: String::new(),
                    },
                ],
            }],
        };
        assert_eq!(report.worst_status(), TestStatus::Mle);
        assert!(TestStatus::CheckerError.severity() > TestStatus::Mle.severity());
        assert!(TestStatus::Ok.severity() > TestStatus::Skipped.severity());
    }
}
