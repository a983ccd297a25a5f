//! The job model: typed persistent task records and the conflict rules that
//! keep incompatible jobs from running at the same time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Closed set of background operations. The integer values are stable; rows
/// reference them without a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobType {
    JudgeSubmission = 0,
    RejudgeSubmission = 1,
    AddProblem = 2,
    ReuploadProblem = 3,
    EditProblem = 4,
    DeleteProblem = 5,
    MergeProblems = 6,
    ReselectFinalSubmissionsInContestProblem = 7,
    DeleteUser = 8,
    MergeUsers = 9,
    DeleteContest = 10,
    DeleteContestRound = 11,
    DeleteContestProblem = 12,
    ChangeProblemStatement = 13,
    ResetProblemTimeLimitsUsingModelSolution = 14,
    DeleteInternalFile = 15,
}

impl JobType {
    pub fn from_u8(value: u8) -> Option<JobType> {
        use JobType::*;
        Some(match value {
            0 => JudgeSubmission,
            1 => RejudgeSubmission,
            2 => AddProblem,
            3 => ReuploadProblem,
            4 => EditProblem,
            5 => DeleteProblem,
            6 => MergeProblems,
            7 => ReselectFinalSubmissionsInContestProblem,
            8 => DeleteUser,
            9 => MergeUsers,
            10 => DeleteContest,
            11 => DeleteContestRound,
            12 => DeleteContestProblem,
            13 => ChangeProblemStatement,
            14 => ResetProblemTimeLimitsUsingModelSolution,
            15 => DeleteInternalFile,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Higher wins; ties dispatch in id order.
    pub fn default_priority(self) -> i32 {
        use JobType::*;
        match self {
            DeleteInternalFile => 30,
            DeleteProblem | DeleteUser | DeleteContest | DeleteContestRound
            | DeleteContestProblem | MergeProblems | MergeUsers
            | ReselectFinalSubmissionsInContestProblem => 20,
            JudgeSubmission | AddProblem | ReuploadProblem | ChangeProblemStatement
            | ResetProblemTimeLimitsUsingModelSolution => 10,
            RejudgeSubmission => 4,
            EditProblem => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobStatus {
    Pending = 0,
    InProgress = 1,
    Done = 2,
    Failed = 3,
    Cancelled = 4,
}

impl JobStatus {
    pub fn from_u8(value: u8) -> Option<JobStatus> {
        Some(match value {
            0 => JobStatus::Pending,
            1 => JobStatus::InProgress,
            2 => JobStatus::Done,
            3 => JobStatus::Failed,
            4 => JobStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: i64,
    pub created_at: String,
    pub creator: Option<i64>,
    pub file_id: Option<i64>,
    pub kind: JobType,
    pub priority: i32,
    pub status: JobStatus,
    pub aux_id: Option<i64>,
    pub aux_id_2: Option<i64>,
    pub log: String,
}

/// A job to insert; status starts PENDING.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub created_at: String,
    pub creator: Option<i64>,
    pub file_id: Option<i64>,
    pub kind: JobType,
    pub priority: i32,
    pub aux_id: Option<i64>,
    pub aux_id_2: Option<i64>,
}

impl NewJob {
    pub fn new(kind: JobType, created_at: impl Into<String>) -> NewJob {
        NewJob {
            created_at: created_at.into(),
            creator: None,
            file_id: None,
            kind,
            priority: kind.default_priority(),
            aux_id: None,
            aux_id_2: None,
        }
    }

    pub fn aux(mut self, aux_id: i64) -> NewJob {
        self.aux_id = Some(aux_id);
        self
    }

    pub fn aux2(mut self, aux_id_2: i64) -> NewJob {
        self.aux_id_2 = Some(aux_id_2);
        self
    }

    pub fn file(mut self, file_id: i64) -> NewJob {
        self.file_id = Some(file_id);
        self
    }

    pub fn priority(mut self, priority: i32) -> NewJob {
        self.priority = priority;
        self
    }

    pub fn creator(mut self, creator: Option<i64>) -> NewJob {
        self.creator = creator;
        self
    }
}

// ── Conflict rules ──

/// Types that mutate a single problem's package or row.
const PROBLEM_MUTATORS: [JobType; 5] = [
    JobType::ReuploadProblem,
    JobType::EditProblem,
    JobType::DeleteProblem,
    JobType::ResetProblemTimeLimitsUsingModelSolution,
    JobType::ChangeProblemStatement,
];

/// What a single in-progress job excludes from dispatch, derived from its
/// type and aux ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictRule {
    /// Judging a submission blocks (re)judging the same submission.
    Judge { submission_id: i64 },
    /// A problem mutation blocks other mutations of the same problem and
    /// merges touching it.
    ProblemOp { problem_id: i64 },
    /// A merge blocks mutations and merges touching either side.
    MergeProblems { donor: i64, target: i64 },
    /// Final reselection and contest-problem deletion exclude each other on
    /// the same contest problem.
    ContestProblemOp { contest_problem_id: i64 },
    DeleteUser { user_id: i64 },
    MergeUsers { donor: i64, target: i64 },
    /// Same-type exclusion on the same aux id.
    SameType { kind: JobType, aux_id: i64 },
}

impl ConflictRule {
    /// The rule an in-progress job contributes, if any (ADD_PROBLEM collides
    /// with nothing).
    pub fn for_job(kind: JobType, aux_id: Option<i64>, aux_id_2: Option<i64>) -> Option<ConflictRule> {
        use JobType::*;
        let aux = aux_id?;
        Some(match kind {
            JudgeSubmission | RejudgeSubmission => ConflictRule::Judge { submission_id: aux },
            AddProblem => return None,
            ReuploadProblem | EditProblem | DeleteProblem
            | ResetProblemTimeLimitsUsingModelSolution | ChangeProblemStatement => {
                ConflictRule::ProblemOp { problem_id: aux }
            }
            MergeProblems => ConflictRule::MergeProblems {
                donor: aux,
                target: aux_id_2?,
            },
            ReselectFinalSubmissionsInContestProblem | DeleteContestProblem => {
                ConflictRule::ContestProblemOp {
                    contest_problem_id: aux,
                }
            }
            DeleteUser => ConflictRule::DeleteUser { user_id: aux },
            MergeUsers => ConflictRule::MergeUsers {
                donor: aux,
                target: aux_id_2?,
            },
            DeleteContest | DeleteContestRound | DeleteInternalFile => {
                ConflictRule::SameType { kind, aux_id: aux }
            }
        })
    }

    /// Whether a pending job with this shape must wait for the rule's owner.
    pub fn blocks(&self, kind: JobType, aux_id: Option<i64>, aux_id_2: Option<i64>) -> bool {
        use JobType::*;
        let aux_is = |v: i64| aux_id == Some(v);
        let aux2_is = |v: i64| aux_id_2 == Some(v);
        match *self {
            ConflictRule::Judge { submission_id } => {
                matches!(kind, JudgeSubmission | RejudgeSubmission) && aux_is(submission_id)
            }
            ConflictRule::ProblemOp { problem_id } => {
                (PROBLEM_MUTATORS.contains(&kind) && aux_is(problem_id))
                    || (kind == MergeProblems && (aux_is(problem_id) || aux2_is(problem_id)))
            }
            ConflictRule::MergeProblems { donor, target } => {
                (PROBLEM_MUTATORS.contains(&kind) && (aux_is(donor) || aux_is(target)))
                    || (kind == MergeProblems
                        && (aux_is(donor) || aux_is(target) || aux2_is(donor) || aux2_is(target)))
            }
            ConflictRule::ContestProblemOp { contest_problem_id } => {
                matches!(
                    kind,
                    ReselectFinalSubmissionsInContestProblem | DeleteContestProblem
                ) && aux_is(contest_problem_id)
            }
            ConflictRule::DeleteUser { user_id } => {
                (kind == DeleteUser && aux_is(user_id))
                    || (kind == MergeUsers && (aux_is(user_id) || aux2_is(user_id)))
            }
            ConflictRule::MergeUsers { donor, target } => {
                (kind == DeleteUser && (aux_is(donor) || aux_is(target)))
                    || (kind == MergeUsers
                        && (aux_is(donor) || aux_is(target) || aux2_is(donor) || aux2_is(target)))
            }
            ConflictRule::SameType { kind: owner, aux_id } => kind == owner && aux_is(aux_id),
        }
    }

    /// SQL predicate excluding blocked pending jobs; pre-built once per
    /// in-progress job.
    pub fn to_sql(&self) -> String {
        use JobType::*;
        let mutators = || {
            PROBLEM_MUTATORS
                .iter()
                .map(|t| t.as_u8().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        match *self {
            ConflictRule::Judge { submission_id } => format!(
                "NOT (type IN ({}, {}) AND aux_id={submission_id})",
                JudgeSubmission.as_u8(),
                RejudgeSubmission.as_u8()
            ),
            ConflictRule::ProblemOp { problem_id } => format!(
                "NOT ((type IN ({}) AND aux_id={problem_id}) OR (type={} AND \
                 (aux_id={problem_id} OR aux_id_2={problem_id})))",
                mutators(),
                MergeProblems.as_u8()
            ),
            ConflictRule::MergeProblems { donor, target } => format!(
                "NOT ((type IN ({}) AND aux_id IN ({donor}, {target})) OR (type={} AND \
                 (aux_id IN ({donor}, {target}) OR aux_id_2 IN ({donor}, {target}))))",
                mutators(),
                MergeProblems.as_u8()
            ),
            ConflictRule::ContestProblemOp { contest_problem_id } => format!(
                "NOT (type IN ({}, {}) AND aux_id={contest_problem_id})",
                ReselectFinalSubmissionsInContestProblem.as_u8(),
                DeleteContestProblem.as_u8()
            ),
            ConflictRule::DeleteUser { user_id } => format!(
                "NOT ((type={} AND aux_id={user_id}) OR (type={} AND \
                 (aux_id={user_id} OR aux_id_2={user_id})))",
                DeleteUser.as_u8(),
                MergeUsers.as_u8()
            ),
            ConflictRule::MergeUsers { donor, target } => format!(
                "NOT ((type={} AND aux_id IN ({donor}, {target})) OR (type={} AND \
                 (aux_id IN ({donor}, {target}) OR aux_id_2 IN ({donor}, {target}))))",
                DeleteUser.as_u8(),
                MergeUsers.as_u8()
            ),
            ConflictRule::SameType { kind, aux_id } => {
                format!("NOT (type={} AND aux_id={aux_id})", kind.as_u8())
            }
        }
    }
}

/// The set of conflict predicates for the currently in-progress jobs, keyed
/// by job id. Guarded by a mutex in the dispatcher; held only for O(1)
/// insert/remove/snapshot.
#[derive(Debug, Default)]
pub struct ConflictFilter {
    rules: BTreeMap<i64, ConflictRule>,
}

impl ConflictFilter {
    pub fn add_in_progress_job(&mut self, job: &JobRow) {
        if let Some(rule) = ConflictRule::for_job(job.kind, job.aux_id, job.aux_id_2) {
            self.rules.insert(job.id, rule);
        }
    }

    pub fn remove_in_progress_job(&mut self, job_id: i64) {
        self.rules.remove(&job_id);
    }

    pub fn snapshot(&self) -> ConflictSnapshot {
        let sql = if self.rules.is_empty() {
            "TRUE".to_string()
        } else {
            self.rules
                .values()
                .map(ConflictRule::to_sql)
                .collect::<Vec<_>>()
                .join(" AND ")
        };
        ConflictSnapshot {
            rules: self.rules.values().cloned().collect(),
            sql,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Immutable view of the filter taken under the lock and evaluated outside
/// it.
#[derive(Debug, Clone)]
pub struct ConflictSnapshot {
    rules: Vec<ConflictRule>,
    sql: String,
}

impl ConflictSnapshot {
    pub fn admits(&self, kind: JobType, aux_id: Option<i64>, aux_id_2: Option<i64>) -> bool {
        !self.rules.iter().any(|r| r.blocks(kind, aux_id, aux_id_2))
    }

    /// `WHERE`-fragment form, `TRUE` when no job is in progress.
    pub fn sql_condition(&self) -> &str {
        &self.sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(kind: JobType, aux: i64) -> ConflictRule {
        ConflictRule::for_job(kind, Some(aux), None).unwrap()
    }

    #[test]
    fn judge_blocks_only_same_submission() {
        let r = rule(JobType::JudgeSubmission, 42);
        assert!(r.blocks(JobType::JudgeSubmission, Some(42), None));
        assert!(r.blocks(JobType::RejudgeSubmission, Some(42), None));
        assert!(!r.blocks(JobType::JudgeSubmission, Some(43), None));
        assert!(!r.blocks(JobType::DeleteProblem, Some(42), None));
    }

    #[test]
    fn add_problem_collides_with_nothing() {
        assert_eq!(ConflictRule::for_job(JobType::AddProblem, Some(1), None), None);
    }

    #[test]
    fn problem_ops_block_merges_on_either_side() {
        let r = rule(JobType::DeleteProblem, 7);
        assert!(r.blocks(JobType::ReuploadProblem, Some(7), None));
        assert!(r.blocks(JobType::DeleteProblem, Some(7), None));
        assert!(r.blocks(JobType::MergeProblems, Some(7), Some(9)));
        assert!(r.blocks(JobType::MergeProblems, Some(3), Some(7)));
        assert!(!r.blocks(JobType::MergeProblems, Some(3), Some(9)));
        assert!(!r.blocks(JobType::JudgeSubmission, Some(7), None));
    }

    #[test]
    fn merge_problems_blocks_both_sides() {
        let r = ConflictRule::for_job(JobType::MergeProblems, Some(3), Some(5)).unwrap();
        assert!(r.blocks(JobType::ChangeProblemStatement, Some(3), None));
        assert!(r.blocks(JobType::ResetProblemTimeLimitsUsingModelSolution, Some(5), None));
        assert!(r.blocks(JobType::MergeProblems, Some(5), Some(8)));
        assert!(r.blocks(JobType::MergeProblems, Some(8), Some(3)));
        assert!(!r.blocks(JobType::DeleteProblem, Some(8), None));
    }

    #[test]
    fn user_rules_mirror_problem_rules() {
        let del = rule(JobType::DeleteUser, 11);
        assert!(del.blocks(JobType::DeleteUser, Some(11), None));
        assert!(del.blocks(JobType::MergeUsers, Some(11), Some(12)));
        assert!(del.blocks(JobType::MergeUsers, Some(12), Some(11)));
        assert!(!del.blocks(JobType::DeleteUser, Some(12), None));

        let merge = ConflictRule::for_job(JobType::MergeUsers, Some(1), Some(2)).unwrap();
        assert!(merge.blocks(JobType::DeleteUser, Some(1), None));
        assert!(merge.blocks(JobType::DeleteUser, Some(2), None));
        assert!(merge.blocks(JobType::MergeUsers, Some(9), Some(2)));
        assert!(!merge.blocks(JobType::DeleteUser, Some(3), None));
    }

    #[test]
    fn same_type_rules_are_keyed_on_aux() {
        let r = rule(JobType::DeleteInternalFile, 100);
        assert!(r.blocks(JobType::DeleteInternalFile, Some(100), None));
        assert!(!r.blocks(JobType::DeleteInternalFile, Some(101), None));
        assert!(!r.blocks(JobType::DeleteContest, Some(100), None));
    }

    #[test]
    fn reselect_and_delete_contest_problem_exclude_each_other() {
        let r = rule(JobType::ReselectFinalSubmissionsInContestProblem, 4);
        assert!(r.blocks(JobType::DeleteContestProblem, Some(4), None));
        assert!(r.blocks(JobType::ReselectFinalSubmissionsInContestProblem, Some(4), None));
        assert!(!r.blocks(JobType::DeleteContestProblem, Some(5), None));
    }

    #[test]
    fn snapshot_condition_is_true_when_idle() {
        let filter = ConflictFilter::default();
        assert_eq!(filter.snapshot().sql_condition(), "TRUE");
        assert!(filter.snapshot().admits(JobType::JudgeSubmission, Some(1), None));
    }

    #[test]
    fn snapshot_renders_all_predicates() {
        let mut filter = ConflictFilter::default();
        filter.add_in_progress_job(&JobRow {
            id: 1,
            created_at: String::new(),
            creator: None,
            file_id: None,
            kind: JobType::JudgeSubmission,
            priority: 10,
            status: JobStatus::InProgress,
            aux_id: Some(42),
            aux_id_2: None,
            log: String::new(),
        });
        filter.add_in_progress_job(&JobRow {
            id: 2,
            created_at: String::new(),
            creator: None,
            file_id: None,
            kind: JobType::DeleteContest,
            priority: 20,
            status: JobStatus::InProgress,
            aux_id: Some(7),
            aux_id_2: None,
            log: String::new(),
        });
        let snap = filter.snapshot();
        assert!(snap.sql_condition().contains("aux_id=42"));
        assert!(snap.sql_condition().contains(" AND "));
        assert!(!snap.admits(JobType::RejudgeSubmission, Some(42), None));
        assert!(snap.admits(JobType::RejudgeSubmission, Some(41), None));
        filter.remove_in_progress_job(1);
        assert!(filter.snapshot().admits(JobType::RejudgeSubmission, Some(42), None));
    }
}
