//! Persistence seam.
//!
//! The dispatcher and every job handler operate exclusively through this
//! trait, enabling pluggable backends: [`memory::MemoryStore`] for tests
//! and [`postgres::PgStore`] for production.
//!
//! Methods are composite on purpose: each one is a single transactional
//! unit in the Postgres backend (REPEATABLE READ, deadlock-retried) and a
//! single mutex-held mutation in the memory backend. `apply_*` methods
//! perform a handler's whole effect *and* mark the job terminal in the same
//! transaction; when they report that a target row is missing they have
//! changed nothing, and the handler finishes the job itself.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;

use arbiter_core::compile::SolutionLanguage;

use crate::jobs::{ConflictSnapshot, JobRow, JobStatus, NewJob};
use crate::submissions::{SubmissionRow, SubmissionStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct ProblemRow {
    pub id: i64,
    pub file_id: i64,
    pub simfile: String,
    pub name: String,
    pub label: String,
    pub owner_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserBrief {
    pub id: i64,
    pub username: String,
    /// 0 = admin, 1 = teacher, 2 = normal; lower means more permissions.
    pub kind: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContestProblemBrief {
    pub id: i64,
    pub name: String,
    pub problem_id: i64,
    pub problem_name: String,
    pub contest_round_id: i64,
    pub contest_round_name: String,
    pub contest_id: i64,
    pub contest_name: String,
}

/// Everything the judge handler needs about a submission, fetched together
/// with the owning problem and the job's creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeContext {
    pub submission_file_id: i64,
    pub submission_user_id: Option<i64>,
    pub problem_id: i64,
    pub problem_file_id: i64,
    pub contest_problem_id: Option<i64>,
    pub language: SolutionLanguage,
    pub last_judgment_began_at: Option<String>,
    pub job_created_at: String,
}

/// Statuses, score and report blobs written back to a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeUpdate {
    pub initial_status: SubmissionStatus,
    pub full_status: SubmissionStatus,
    pub score: Option<i64>,
    pub initial_report: String,
    pub final_report: String,
}

/// Arguments of an ADD_PROBLEM / REUPLOAD_PROBLEM job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProblemUploadArgs {
    pub package_file_id: Option<i64>,
    pub name: Option<String>,
    pub label: Option<String>,
    pub memory_limit_mib: Option<u64>,
    pub fixed_time_limit_ms: Option<u64>,
    pub reset_time_limits: bool,
    pub ignore_existing_simfile: bool,
    pub seek_new_tests: bool,
    pub reset_scoring: bool,
}

/// One package solution staged as a PROBLEM_SOLUTION submission.
#[derive(Debug, Clone)]
pub struct SolutionSeed {
    pub file_id: i64,
    pub language: SolutionLanguage,
    pub filename: String,
}

/// The assembled effect of a problem upload, applied in one transaction.
#[derive(Debug, Clone)]
pub struct ProblemUpload {
    /// `Some` for REUPLOAD_PROBLEM; the package and solutions of this
    /// problem are replaced.
    pub existing_problem_id: Option<i64>,
    pub name: String,
    pub label: String,
    pub simfile: String,
    pub package_file_id: i64,
    pub owner_id: Option<i64>,
    pub solutions: Vec<SolutionSeed>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeProblemsArgs {
    pub donor_problem_id: i64,
    pub target_problem_id: i64,
    pub rejudge_transferred_submissions: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeStatementArgs {
    pub new_statement_file_id: i64,
    pub path_for_new_statement: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteProblemOutcome {
    Done,
    NotFound,
    /// A contest problem still attaches the problem; nothing was changed.
    AttachedToContest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Done,
    DonorMissing,
    TargetMissing,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ── Job queue ──

    async fn enqueue(&self, job: NewJob) -> Result<i64>;
    async fn job(&self, id: i64) -> Result<Option<JobRow>>;
    /// Crash recovery: every IN_PROGRESS row goes back to PENDING.
    async fn reset_in_progress_jobs(&self) -> Result<u64>;
    /// Head of the queue among pending jobs the filter admits, ordered
    /// `priority DESC, id ASC`.
    async fn next_pending_job(&self, filter: &ConflictSnapshot) -> Result<Option<JobRow>>;
    async fn set_job_in_progress(&self, id: i64) -> Result<()>;
    /// Terminal transition; the status and the final log share one
    /// transaction.
    async fn finish_job(&self, id: i64, status: JobStatus, log: &str) -> Result<()>;
    async fn update_job_log(&self, id: i64, log: &str) -> Result<()>;

    // ── Internal files ──

    async fn create_internal_file(&self, created_at: &str) -> Result<i64>;

    // ── Reads used for validation and job-log lines ──

    async fn problem(&self, id: i64) -> Result<Option<ProblemRow>>;
    async fn submission(&self, id: i64) -> Result<Option<SubmissionRow>>;
    async fn user_brief(&self, id: i64) -> Result<Option<UserBrief>>;
    async fn contest_name(&self, id: i64) -> Result<Option<String>>;
    async fn contest_round_name(&self, id: i64) -> Result<Option<String>>;
    async fn contest_problem_brief(&self, id: i64) -> Result<Option<ContestProblemBrief>>;
    async fn problem_upload_args(&self, job_id: i64) -> Result<Option<ProblemUploadArgs>>;
    async fn merge_problems_args(&self, job_id: i64) -> Result<Option<MergeProblemsArgs>>;
    async fn change_statement_args(&self, job_id: i64) -> Result<Option<ChangeStatementArgs>>;

    // ── Judging ──

    async fn judge_context(&self, job_id: i64, submission_id: i64)
        -> Result<Option<JudgeContext>>;
    async fn begin_judgment(&self, submission_id: i64, at: &str) -> Result<()>;
    /// Writes statuses/score/reports, recomputes final flags and flushes the
    /// job log; with `terminal` set the job row is finished in the same
    /// transaction. A vanished submission only updates the job row.
    async fn apply_judge_update(
        &self,
        submission_id: i64,
        update: &JudgeUpdate,
        job_id: i64,
        log: &str,
        terminal: Option<JobStatus>,
    ) -> Result<()>;

    // ── Handler effects ──

    /// Returns the (created or reuploaded) problem id, or `None` when a
    /// reupload target has disappeared.
    async fn apply_problem_upload(
        &self,
        job_id: i64,
        upload: &ProblemUpload,
        now: &str,
        log: &str,
    ) -> Result<Option<i64>>;
    async fn apply_change_statement(
        &self,
        job_id: i64,
        problem_id: i64,
        new_file_id: i64,
        new_simfile: &str,
        now: &str,
        log: &str,
    ) -> Result<bool>;
    async fn apply_reset_time_limits(
        &self,
        job_id: i64,
        problem_id: i64,
        new_file_id: i64,
        new_simfile: &str,
        now: &str,
        log: &str,
    ) -> Result<bool>;
    async fn apply_delete_problem(
        &self,
        job_id: i64,
        problem_id: i64,
        now: &str,
        log: &str,
    ) -> Result<DeleteProblemOutcome>;
    async fn apply_delete_user(&self, job_id: i64, user_id: i64, now: &str, log: &str)
        -> Result<bool>;
    async fn apply_delete_contest(
        &self,
        job_id: i64,
        contest_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool>;
    async fn apply_delete_contest_round(
        &self,
        job_id: i64,
        contest_round_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool>;
    async fn apply_delete_contest_problem(
        &self,
        job_id: i64,
        contest_problem_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool>;
    /// Deletes the row; unlinking the disk object is the handler's business.
    async fn apply_delete_internal_file(&self, job_id: i64, file_id: i64, log: &str)
        -> Result<()>;
    async fn apply_merge_problems(
        &self,
        job_id: i64,
        args: &MergeProblemsArgs,
        now: &str,
        log: &str,
    ) -> Result<MergeOutcome>;
    async fn apply_merge_users(
        &self,
        job_id: i64,
        donor_user_id: i64,
        target_user_id: i64,
        now: &str,
        log: &str,
    ) -> Result<MergeOutcome>;
    async fn apply_reselect_final(
        &self,
        job_id: i64,
        contest_problem_id: i64,
        log: &str,
    ) -> Result<bool>;
}
