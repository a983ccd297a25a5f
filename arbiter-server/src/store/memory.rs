//! In-memory backend.
//!
//! One mutex over plain tables; every trait method is a single critical
//! section, which gives it the same atomicity the Postgres backend gets
//! from transactions. Used by the test suite and useful as a reference
//! model for the SQL.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::jobs::{ConflictSnapshot, JobRow, JobStatus, JobType, NewJob};
use crate::submissions::{SubmissionKind, SubmissionRow, SubmissionStatus};

use super::{
    ChangeStatementArgs, ContestProblemBrief, DeleteProblemOutcome, JudgeContext, JudgeUpdate,
    MergeOutcome, MergeProblemsArgs, ProblemRow, ProblemUpload, ProblemUploadArgs, Store,
    UserBrief,
};

#[derive(Debug, Clone)]
pub struct ContestRoundRow {
    pub id: i64,
    pub contest_id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ContestProblemRow {
    pub id: i64,
    pub contest_id: i64,
    pub contest_round_id: i64,
    pub problem_id: i64,
    pub name: String,
}

#[derive(Debug, Default)]
struct Db {
    jobs: BTreeMap<i64, JobRow>,
    upload_args: BTreeMap<i64, ProblemUploadArgs>,
    merge_args: BTreeMap<i64, MergeProblemsArgs>,
    statement_args: BTreeMap<i64, ChangeStatementArgs>,
    internal_files: BTreeMap<i64, String>,
    users: BTreeMap<i64, UserBrief>,
    sessions: BTreeMap<String, i64>,
    problems: BTreeMap<i64, ProblemRow>,
    problem_tags: BTreeMap<i64, Vec<String>>,
    submissions: BTreeMap<i64, SubmissionRow>,
    contests: BTreeMap<i64, String>,
    contest_rounds: BTreeMap<i64, ContestRoundRow>,
    contest_problems: BTreeMap<i64, ContestProblemRow>,
    /// (contest_id, user_id) -> mode; lower mode means fewer permissions.
    contest_users: BTreeMap<(i64, i64), u8>,
}

fn next_id<V>(table: &BTreeMap<i64, V>) -> i64 {
    table.keys().next_back().copied().unwrap_or(0) + 1
}

fn enqueue_row(db: &mut Db, job: NewJob) -> i64 {
    let id = next_id(&db.jobs);
    db.jobs.insert(
        id,
        JobRow {
            id,
            created_at: job.created_at,
            creator: job.creator,
            file_id: job.file_id,
            kind: job.kind,
            priority: job.priority,
            status: JobStatus::Pending,
            aux_id: job.aux_id,
            aux_id_2: job.aux_id_2,
            log: String::new(),
        },
    );
    id
}

fn enqueue_delete_file(db: &mut Db, file_id: i64, now: &str) {
    let job = NewJob::new(JobType::DeleteInternalFile, now).aux(file_id);
    enqueue_row(db, job);
}

fn finish_row(db: &mut Db, job_id: i64, status: JobStatus, log: &str) -> Result<()> {
    match db.jobs.get_mut(&job_id) {
        Some(job) => {
            job.status = status;
            job.log = log.to_string();
            Ok(())
        }
        None => bail!("job {job_id} does not exist"),
    }
}

/// Recomputes the score-bearing ("final") submission flags for one
/// (user, problem) and optionally (user, contest problem) pair.
fn update_final(
    db: &mut Db,
    user_id: Option<i64>,
    problem_id: i64,
    contest_problem_id: Option<i64>,
) {
    let Some(user) = user_id else {
        return;
    };

    let best_for_problem = db
        .submissions
        .values()
        .filter(|s| {
            s.user_id == Some(user)
                && s.problem_id == problem_id
                && s.kind == SubmissionKind::Normal
                && s.score.is_some()
        })
        .max_by_key(|s| (s.score, s.id))
        .map(|s| s.id);
    for s in db.submissions.values_mut() {
        if s.user_id == Some(user) && s.problem_id == problem_id {
            s.problem_final = Some(s.id) == best_for_problem;
        }
    }

    let Some(cp) = contest_problem_id else {
        return;
    };
    let best_full = db
        .submissions
        .values()
        .filter(|s| {
            s.user_id == Some(user)
                && s.contest_problem_id == Some(cp)
                && s.kind == SubmissionKind::Normal
                && s.score.is_some()
        })
        .max_by_key(|s| (s.score, s.id))
        .map(|s| s.id);
    let best_initial = db
        .submissions
        .values()
        .filter(|s| {
            s.user_id == Some(user)
                && s.contest_problem_id == Some(cp)
                && s.kind == SubmissionKind::Normal
                && s.initial_status != SubmissionStatus::Pending
        })
        .max_by_key(|s| (s.initial_status == SubmissionStatus::Ok, s.id))
        .map(|s| s.id);
    for s in db.submissions.values_mut() {
        if s.user_id == Some(user) && s.contest_problem_id == Some(cp) {
            s.contest_problem_final = Some(s.id) == best_full;
            s.contest_problem_initial_final = Some(s.id) == best_initial;
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    db: Mutex<Db>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    // ── Test fixtures ──

    pub async fn seed_internal_file(&self, created_at: &str) -> i64 {
        let mut db = self.db.lock().await;
        let id = next_id(&db.internal_files);
        db.internal_files.insert(id, created_at.to_string());
        id
    }

    pub async fn seed_user(&self, user: UserBrief) {
        self.db.lock().await.users.insert(user.id, user);
    }

    pub async fn seed_problem(&self, problem: ProblemRow) {
        self.db.lock().await.problems.insert(problem.id, problem);
    }

    pub async fn seed_submission(&self, submission: SubmissionRow) {
        self.db
            .lock()
            .await
            .submissions
            .insert(submission.id, submission);
    }

    pub async fn seed_contest(&self, id: i64, name: &str) {
        self.db.lock().await.contests.insert(id, name.to_string());
    }

    pub async fn seed_contest_round(&self, round: ContestRoundRow) {
        self.db.lock().await.contest_rounds.insert(round.id, round);
    }

    pub async fn seed_contest_problem(&self, cp: ContestProblemRow) {
        self.db.lock().await.contest_problems.insert(cp.id, cp);
    }

    pub async fn seed_contest_user(&self, contest_id: i64, user_id: i64, mode: u8) {
        self.db
            .lock()
            .await
            .contest_users
            .insert((contest_id, user_id), mode);
    }

    pub async fn seed_problem_tag(&self, problem_id: i64, tag: &str) {
        self.db
            .lock()
            .await
            .problem_tags
            .entry(problem_id)
            .or_default()
            .push(tag.to_string());
    }

    pub async fn set_upload_args(&self, job_id: i64, args: ProblemUploadArgs) {
        self.db.lock().await.upload_args.insert(job_id, args);
    }

    pub async fn set_merge_args(&self, job_id: i64, args: MergeProblemsArgs) {
        self.db.lock().await.merge_args.insert(job_id, args);
    }

    pub async fn set_statement_args(&self, job_id: i64, args: ChangeStatementArgs) {
        self.db.lock().await.statement_args.insert(job_id, args);
    }

    /// Force a job status directly, e.g. to seed IN_PROGRESS rows for the
    /// crash-recovery scenario.
    pub async fn force_job_status(&self, job_id: i64, status: JobStatus) {
        if let Some(job) = self.db.lock().await.jobs.get_mut(&job_id) {
            job.status = status;
        }
    }

    // ── Test inspection ──

    pub async fn all_jobs(&self) -> Vec<JobRow> {
        self.db.lock().await.jobs.values().cloned().collect()
    }

    pub async fn jobs_of_type(&self, kind: JobType) -> Vec<JobRow> {
        self.db
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.kind == kind)
            .cloned()
            .collect()
    }

    pub async fn all_submissions(&self) -> Vec<SubmissionRow> {
        self.db.lock().await.submissions.values().cloned().collect()
    }

    pub async fn problem_exists(&self, id: i64) -> bool {
        self.db.lock().await.problems.contains_key(&id)
    }

    pub async fn user_exists(&self, id: i64) -> bool {
        self.db.lock().await.users.contains_key(&id)
    }

    pub async fn internal_file_exists(&self, id: i64) -> bool {
        self.db.lock().await.internal_files.contains_key(&id)
    }

    pub async fn contest_problem_rows(&self) -> Vec<ContestProblemRow> {
        self.db
            .lock()
            .await
            .contest_problems
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<i64> {
        Ok(enqueue_row(&mut *self.db.lock().await, job))
    }

    async fn job(&self, id: i64) -> Result<Option<JobRow>> {
        Ok(self.db.lock().await.jobs.get(&id).cloned())
    }

    async fn reset_in_progress_jobs(&self) -> Result<u64> {
        let mut db = self.db.lock().await;
        let mut reset = 0;
        for job in db.jobs.values_mut() {
            if job.status == JobStatus::InProgress {
                job.status = JobStatus::Pending;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn next_pending_job(&self, filter: &ConflictSnapshot) -> Result<Option<JobRow>> {
        let db = self.db.lock().await;
        let mut pending: Vec<&JobRow> = db
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|j| (std::cmp::Reverse(j.priority), j.id));
        Ok(pending
            .into_iter()
            .find(|j| filter.admits(j.kind, j.aux_id, j.aux_id_2))
            .cloned())
    }

    async fn set_job_in_progress(&self, id: i64) -> Result<()> {
        let mut db = self.db.lock().await;
        match db.jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::InProgress;
                Ok(())
            }
            None => bail!("job {id} does not exist"),
        }
    }

    async fn finish_job(&self, id: i64, status: JobStatus, log: &str) -> Result<()> {
        finish_row(&mut *self.db.lock().await, id, status, log)
    }

    async fn update_job_log(&self, id: i64, log: &str) -> Result<()> {
        let mut db = self.db.lock().await;
        match db.jobs.get_mut(&id) {
            Some(job) => {
                job.log = log.to_string();
                Ok(())
            }
            None => bail!("job {id} does not exist"),
        }
    }

    async fn create_internal_file(&self, created_at: &str) -> Result<i64> {
        let mut db = self.db.lock().await;
        let id = next_id(&db.internal_files);
        db.internal_files.insert(id, created_at.to_string());
        Ok(id)
    }

    async fn problem(&self, id: i64) -> Result<Option<ProblemRow>> {
        Ok(self.db.lock().await.problems.get(&id).cloned())
    }

    async fn submission(&self, id: i64) -> Result<Option<SubmissionRow>> {
        Ok(self.db.lock().await.submissions.get(&id).cloned())
    }

    async fn user_brief(&self, id: i64) -> Result<Option<UserBrief>> {
        Ok(self.db.lock().await.users.get(&id).cloned())
    }

    async fn contest_name(&self, id: i64) -> Result<Option<String>> {
        Ok(self.db.lock().await.contests.get(&id).cloned())
    }

    async fn contest_round_name(&self, id: i64) -> Result<Option<String>> {
        Ok(self
            .db
            .lock()
            .await
            .contest_rounds
            .get(&id)
            .map(|r| r.name.clone()))
    }

    async fn contest_problem_brief(&self, id: i64) -> Result<Option<ContestProblemBrief>> {
        let db = self.db.lock().await;
        let Some(cp) = db.contest_problems.get(&id) else {
            return Ok(None);
        };
        let (Some(problem), Some(round), Some(contest)) = (
            db.problems.get(&cp.problem_id),
            db.contest_rounds.get(&cp.contest_round_id),
            db.contests.get(&cp.contest_id),
        ) else {
            return Ok(None);
        };
        Ok(Some(ContestProblemBrief {
            id: cp.id,
            name: cp.name.clone(),
            problem_id: cp.problem_id,
            problem_name: problem.name.clone(),
            contest_round_id: cp.contest_round_id,
            contest_round_name: round.name.clone(),
            contest_id: cp.contest_id,
            contest_name: contest.clone(),
        }))
    }

    async fn problem_upload_args(&self, job_id: i64) -> Result<Option<ProblemUploadArgs>> {
        let db = self.db.lock().await;
        let Some(mut args) = db.upload_args.get(&job_id).cloned() else {
            return Ok(None);
        };
        if args.package_file_id.is_none() {
            args.package_file_id = db.jobs.get(&job_id).and_then(|j| j.file_id);
        }
        Ok(Some(args))
    }

    async fn merge_problems_args(&self, job_id: i64) -> Result<Option<MergeProblemsArgs>> {
        let db = self.db.lock().await;
        if let Some(args) = db.merge_args.get(&job_id) {
            return Ok(Some(args.clone()));
        }
        // Fall back to the job's aux ids with rejudging off.
        let Some(job) = db.jobs.get(&job_id) else {
            return Ok(None);
        };
        match (job.aux_id, job.aux_id_2) {
            (Some(donor), Some(target)) => Ok(Some(MergeProblemsArgs {
                donor_problem_id: donor,
                target_problem_id: target,
                rejudge_transferred_submissions: false,
            })),
            _ => Ok(None),
        }
    }

    async fn change_statement_args(&self, job_id: i64) -> Result<Option<ChangeStatementArgs>> {
        let db = self.db.lock().await;
        if let Some(args) = db.statement_args.get(&job_id) {
            return Ok(Some(args.clone()));
        }
        let Some(job) = db.jobs.get(&job_id) else {
            return Ok(None);
        };
        Ok(job.file_id.map(|file_id| ChangeStatementArgs {
            new_statement_file_id: file_id,
            path_for_new_statement: String::new(),
        }))
    }

    async fn judge_context(
        &self,
        job_id: i64,
        submission_id: i64,
    ) -> Result<Option<JudgeContext>> {
        let db = self.db.lock().await;
        let Some(submission) = db.submissions.get(&submission_id) else {
            return Ok(None);
        };
        let Some(problem) = db.problems.get(&submission.problem_id) else {
            return Ok(None);
        };
        let Some(job) = db.jobs.get(&job_id) else {
            return Ok(None);
        };
        Ok(Some(JudgeContext {
            submission_file_id: submission.file_id,
            submission_user_id: submission.user_id,
            problem_id: submission.problem_id,
            problem_file_id: problem.file_id,
            contest_problem_id: submission.contest_problem_id,
            language: submission.language,
            last_judgment_began_at: submission.last_judgment_began_at.clone(),
            job_created_at: job.created_at.clone(),
        }))
    }

    async fn begin_judgment(&self, submission_id: i64, at: &str) -> Result<()> {
        let mut db = self.db.lock().await;
        if let Some(submission) = db.submissions.get_mut(&submission_id) {
            submission.last_judgment_began_at = Some(at.to_string());
        }
        Ok(())
    }

    async fn apply_judge_update(
        &self,
        submission_id: i64,
        update: &JudgeUpdate,
        job_id: i64,
        log: &str,
        terminal: Option<JobStatus>,
    ) -> Result<()> {
        let mut db = self.db.lock().await;
        let target = db.submissions.get_mut(&submission_id).map(|s| {
            s.initial_status = update.initial_status;
            s.full_status = update.full_status;
            s.score = update.score;
            s.initial_report = update.initial_report.clone();
            s.final_report = update.final_report.clone();
            (s.user_id, s.problem_id, s.contest_problem_id)
        });
        if let Some((user_id, problem_id, contest_problem_id)) = target {
            update_final(&mut db, user_id, problem_id, contest_problem_id);
        }
        match terminal {
            Some(status) => finish_row(&mut db, job_id, status, log)?,
            None => {
                if let Some(job) = db.jobs.get_mut(&job_id) {
                    job.log = log.to_string();
                }
            }
        }
        Ok(())
    }

    async fn apply_problem_upload(
        &self,
        job_id: i64,
        upload: &ProblemUpload,
        now: &str,
        log: &str,
    ) -> Result<Option<i64>> {
        let mut db = self.db.lock().await;

        let problem_id = match upload.existing_problem_id {
            Some(problem_id) => {
                let Some(problem) = db.problems.get(&problem_id).cloned() else {
                    return Ok(None);
                };
                enqueue_delete_file(&mut db, problem.file_id, now);
                let old_solutions: Vec<SubmissionRow> = db
                    .submissions
                    .values()
                    .filter(|s| {
                        s.problem_id == problem_id && s.kind == SubmissionKind::ProblemSolution
                    })
                    .cloned()
                    .collect();
                for solution in old_solutions {
                    enqueue_delete_file(&mut db, solution.file_id, now);
                    db.submissions.remove(&solution.id);
                }
                let problem = db.problems.get_mut(&problem_id).expect("checked above");
                problem.file_id = upload.package_file_id;
                problem.simfile = upload.simfile.clone();
                problem.name = upload.name.clone();
                problem.label = upload.label.clone();
                problem.updated_at = now.to_string();
                problem_id
            }
            None => {
                let problem_id = next_id(&db.problems);
                db.problems.insert(
                    problem_id,
                    ProblemRow {
                        id: problem_id,
                        file_id: upload.package_file_id,
                        simfile: upload.simfile.clone(),
                        name: upload.name.clone(),
                        label: upload.label.clone(),
                        owner_id: upload.owner_id,
                        created_at: now.to_string(),
                        updated_at: now.to_string(),
                    },
                );
                problem_id
            }
        };

        for seed in &upload.solutions {
            let submission_id = next_id(&db.submissions);
            db.submissions.insert(
                submission_id,
                SubmissionRow {
                    id: submission_id,
                    created_at: now.to_string(),
                    file_id: seed.file_id,
                    user_id: None,
                    problem_id,
                    contest_problem_id: None,
                    contest_round_id: None,
                    contest_id: None,
                    kind: SubmissionKind::ProblemSolution,
                    language: seed.language,
                    initial_status: SubmissionStatus::Pending,
                    full_status: SubmissionStatus::Pending,
                    score: None,
                    last_judgment_began_at: None,
                    initial_report: String::new(),
                    final_report: String::new(),
                    problem_final: false,
                    contest_problem_final: false,
                    contest_problem_initial_final: false,
                },
            );
            let job = NewJob::new(JobType::JudgeSubmission, now)
                .aux(submission_id)
                .priority(JobType::JudgeSubmission.default_priority() + 1);
            enqueue_row(&mut db, job);
        }

        finish_row(&mut db, job_id, JobStatus::Done, log)?;
        Ok(Some(problem_id))
    }

    async fn apply_change_statement(
        &self,
        job_id: i64,
        problem_id: i64,
        new_file_id: i64,
        new_simfile: &str,
        now: &str,
        log: &str,
    ) -> Result<bool> {
        let mut db = self.db.lock().await;
        let Some(problem) = db.problems.get(&problem_id).cloned() else {
            return Ok(false);
        };
        enqueue_delete_file(&mut db, problem.file_id, now);
        let problem = db.problems.get_mut(&problem_id).expect("checked above");
        problem.file_id = new_file_id;
        problem.simfile = new_simfile.to_string();
        problem.updated_at = now.to_string();
        finish_row(&mut db, job_id, JobStatus::Done, log)?;
        Ok(true)
    }

    async fn apply_reset_time_limits(
        &self,
        job_id: i64,
        problem_id: i64,
        new_file_id: i64,
        new_simfile: &str,
        now: &str,
        log: &str,
    ) -> Result<bool> {
        // Same row updates as a statement change, different payload.
        self.apply_change_statement(job_id, problem_id, new_file_id, new_simfile, now, log)
            .await
    }

    async fn apply_delete_problem(
        &self,
        job_id: i64,
        problem_id: i64,
        now: &str,
        log: &str,
    ) -> Result<DeleteProblemOutcome> {
        let mut db = self.db.lock().await;
        if db
            .contest_problems
            .values()
            .any(|cp| cp.problem_id == problem_id)
        {
            return Ok(DeleteProblemOutcome::AttachedToContest);
        }
        let Some(problem) = db.problems.get(&problem_id).cloned() else {
            return Ok(DeleteProblemOutcome::NotFound);
        };

        enqueue_delete_file(&mut db, problem.file_id, now);
        let submission_files: Vec<i64> = db
            .submissions
            .values()
            .filter(|s| s.problem_id == problem_id)
            .map(|s| s.file_id)
            .collect();
        for file_id in submission_files {
            enqueue_delete_file(&mut db, file_id, now);
        }

        db.submissions.retain(|_, s| s.problem_id != problem_id);
        db.problem_tags.remove(&problem_id);
        db.problems.remove(&problem_id);

        finish_row(&mut db, job_id, JobStatus::Done, log)?;
        Ok(DeleteProblemOutcome::Done)
    }

    async fn apply_delete_user(
        &self,
        job_id: i64,
        user_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool> {
        let mut db = self.db.lock().await;
        if !db.users.contains_key(&user_id) {
            return Ok(false);
        }

        let submission_files: Vec<i64> = db
            .submissions
            .values()
            .filter(|s| s.user_id == Some(user_id))
            .map(|s| s.file_id)
            .collect();
        for file_id in submission_files {
            enqueue_delete_file(&mut db, file_id, now);
        }

        db.submissions.retain(|_, s| s.user_id != Some(user_id));
        db.sessions.retain(|_, uid| *uid != user_id);
        db.contest_users.retain(|(_, uid), _| *uid != user_id);
        for problem in db.problems.values_mut() {
            if problem.owner_id == Some(user_id) {
                problem.owner_id = None;
            }
        }
        for job in db.jobs.values_mut() {
            if job.creator == Some(user_id) {
                job.creator = None;
            }
        }
        db.users.remove(&user_id);

        finish_row(&mut db, job_id, JobStatus::Done, log)?;
        Ok(true)
    }

    async fn apply_delete_contest(
        &self,
        job_id: i64,
        contest_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool> {
        let mut db = self.db.lock().await;
        if !db.contests.contains_key(&contest_id) {
            return Ok(false);
        }

        let submission_files: Vec<i64> = db
            .submissions
            .values()
            .filter(|s| s.contest_id == Some(contest_id))
            .map(|s| s.file_id)
            .collect();
        for file_id in submission_files {
            enqueue_delete_file(&mut db, file_id, now);
        }

        db.submissions.retain(|_, s| s.contest_id != Some(contest_id));
        db.contest_problems.retain(|_, cp| cp.contest_id != contest_id);
        db.contest_rounds.retain(|_, r| r.contest_id != contest_id);
        db.contest_users.retain(|(cid, _), _| *cid != contest_id);
        db.contests.remove(&contest_id);

        finish_row(&mut db, job_id, JobStatus::Done, log)?;
        Ok(true)
    }

    async fn apply_delete_contest_round(
        &self,
        job_id: i64,
        contest_round_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool> {
        let mut db = self.db.lock().await;
        if !db.contest_rounds.contains_key(&contest_round_id) {
            return Ok(false);
        }

        let submission_files: Vec<i64> = db
            .submissions
            .values()
            .filter(|s| s.contest_round_id == Some(contest_round_id))
            .map(|s| s.file_id)
            .collect();
        for file_id in submission_files {
            enqueue_delete_file(&mut db, file_id, now);
        }

        db.submissions
            .retain(|_, s| s.contest_round_id != Some(contest_round_id));
        db.contest_problems
            .retain(|_, cp| cp.contest_round_id != contest_round_id);
        db.contest_rounds.remove(&contest_round_id);

        finish_row(&mut db, job_id, JobStatus::Done, log)?;
        Ok(true)
    }

    async fn apply_delete_contest_problem(
        &self,
        job_id: i64,
        contest_problem_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool> {
        let mut db = self.db.lock().await;
        if !db.contest_problems.contains_key(&contest_problem_id) {
            return Ok(false);
        }

        let submission_files: Vec<i64> = db
            .submissions
            .values()
            .filter(|s| s.contest_problem_id == Some(contest_problem_id))
            .map(|s| s.file_id)
            .collect();
        for file_id in submission_files {
            enqueue_delete_file(&mut db, file_id, now);
        }

        db.submissions
            .retain(|_, s| s.contest_problem_id != Some(contest_problem_id));
        db.contest_problems.remove(&contest_problem_id);

        finish_row(&mut db, job_id, JobStatus::Done, log)?;
        Ok(true)
    }

    async fn apply_delete_internal_file(
        &self,
        job_id: i64,
        file_id: i64,
        log: &str,
    ) -> Result<()> {
        let mut db = self.db.lock().await;
        // The row may already be gone; the job still completes.
        db.internal_files.remove(&file_id);
        finish_row(&mut db, job_id, JobStatus::Done, log)
    }

    async fn apply_merge_problems(
        &self,
        job_id: i64,
        args: &MergeProblemsArgs,
        now: &str,
        log: &str,
    ) -> Result<MergeOutcome> {
        let mut db = self.db.lock().await;
        let Some(donor) = db.problems.get(&args.donor_problem_id).cloned() else {
            return Ok(MergeOutcome::DonorMissing);
        };
        if !db.problems.contains_key(&args.target_problem_id) {
            return Ok(MergeOutcome::TargetMissing);
        }
        let donor_id = args.donor_problem_id;
        let target_id = args.target_problem_id;

        // Contest problems follow the target.
        for cp in db.contest_problems.values_mut() {
            if cp.problem_id == donor_id {
                cp.problem_id = target_id;
            }
        }

        // The donor's package and its package solutions are garbage now.
        enqueue_delete_file(&mut db, donor.file_id, now);
        let donor_solutions: Vec<SubmissionRow> = db
            .submissions
            .values()
            .filter(|s| s.problem_id == donor_id && s.kind == SubmissionKind::ProblemSolution)
            .cloned()
            .collect();
        for solution in donor_solutions {
            enqueue_delete_file(&mut db, solution.file_id, now);
            db.submissions.remove(&solution.id);
        }

        // Finals to recompute after the transfer.
        let mut finals: Vec<(Option<i64>, Option<i64>)> = db
            .submissions
            .values()
            .filter(|s| s.problem_id == donor_id)
            .map(|s| (s.user_id, s.contest_problem_id))
            .collect();
        finals.sort();
        finals.dedup();

        if args.rejudge_transferred_submissions {
            let transferred: Vec<i64> = db
                .submissions
                .values()
                .filter(|s| s.problem_id == donor_id)
                .map(|s| s.id)
                .collect();
            for submission_id in transferred {
                let job = NewJob::new(JobType::RejudgeSubmission, now).aux(submission_id);
                enqueue_row(&mut db, job);
            }
        }

        for s in db.submissions.values_mut() {
            if s.problem_id == donor_id {
                s.problem_id = target_id;
            }
        }

        for (user_id, contest_problem_id) in finals {
            update_final(&mut db, user_id, target_id, contest_problem_id);
        }

        // Tags transfer unless the target already carries them.
        let donor_tags = db.problem_tags.remove(&donor_id).unwrap_or_default();
        let target_tags = db.problem_tags.entry(target_id).or_default();
        for tag in donor_tags {
            if !target_tags.contains(&tag) {
                target_tags.push(tag);
            }
        }

        db.problems.remove(&donor_id);

        finish_row(&mut db, job_id, JobStatus::Done, log)?;
        Ok(MergeOutcome::Done)
    }

    async fn apply_merge_users(
        &self,
        job_id: i64,
        donor_user_id: i64,
        target_user_id: i64,
        now: &str,
        log: &str,
    ) -> Result<MergeOutcome> {
        let _ = now;
        let mut db = self.db.lock().await;
        let Some(donor) = db.users.get(&donor_user_id).cloned() else {
            return Ok(MergeOutcome::DonorMissing);
        };
        let Some(target) = db.users.get(&target_user_id).cloned() else {
            return Ok(MergeOutcome::TargetMissing);
        };

        // Lower kind value means more permissions; keep the stronger one.
        if donor.kind < target.kind {
            db.users.get_mut(&target_user_id).expect("checked above").kind = donor.kind;
        }

        for uid in db.sessions.values_mut() {
            if *uid == donor_user_id {
                *uid = target_user_id;
            }
        }
        for problem in db.problems.values_mut() {
            if problem.owner_id == Some(donor_user_id) {
                problem.owner_id = Some(target_user_id);
            }
        }

        // Contest memberships: keep the strongest mode per contest.
        let donor_memberships: Vec<(i64, u8)> = db
            .contest_users
            .iter()
            .filter(|((_, uid), _)| *uid == donor_user_id)
            .map(|((cid, _), mode)| (*cid, *mode))
            .collect();
        for (contest_id, mode) in donor_memberships {
            db.contest_users.remove(&(contest_id, donor_user_id));
            let entry = db
                .contest_users
                .entry((contest_id, target_user_id))
                .or_insert(mode);
            *entry = (*entry).max(mode);
        }

        let mut finals: Vec<(i64, Option<i64>)> = db
            .submissions
            .values()
            .filter(|s| s.user_id == Some(donor_user_id))
            .map(|s| (s.problem_id, s.contest_problem_id))
            .collect();
        finals.sort();
        finals.dedup();

        for s in db.submissions.values_mut() {
            if s.user_id == Some(donor_user_id) {
                s.user_id = Some(target_user_id);
            }
        }
        for (problem_id, contest_problem_id) in finals {
            update_final(&mut db, Some(target_user_id), problem_id, contest_problem_id);
        }

        for job in db.jobs.values_mut() {
            if job.creator == Some(donor_user_id) {
                job.creator = Some(target_user_id);
            }
        }

        db.users.remove(&donor_user_id);

        finish_row(&mut db, job_id, JobStatus::Done, log)?;
        Ok(MergeOutcome::Done)
    }

    async fn apply_reselect_final(
        &self,
        job_id: i64,
        contest_problem_id: i64,
        log: &str,
    ) -> Result<bool> {
        let mut db = self.db.lock().await;
        let Some(cp) = db.contest_problems.get(&contest_problem_id).cloned() else {
            return Ok(false);
        };
        let mut users: Vec<i64> = db
            .submissions
            .values()
            .filter(|s| s.contest_problem_id == Some(contest_problem_id))
            .filter_map(|s| s.user_id)
            .collect();
        users.sort();
        users.dedup();
        for user in users {
            update_final(&mut db, Some(user), cp.problem_id, Some(contest_problem_id));
        }
        finish_row(&mut db, job_id, JobStatus::Done, log)?;
        Ok(true)
    }
}
