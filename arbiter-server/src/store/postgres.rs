//! PostgreSQL backend.
//!
//! Every composite operation runs inside a `REPEATABLE READ` transaction
//! and is retried on serialization failures and deadlocks (SQLSTATE 40001 /
//! 40P01) with a short backoff, up to [`DEADLOCK_RETRIES`] attempts.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::jobs::{ConflictSnapshot, JobRow, JobStatus, JobType, NewJob};
use crate::submissions::{
    language_from_u8, SubmissionKind, SubmissionRow, SubmissionStatus,
};

use super::{
    ChangeStatementArgs, ContestProblemBrief, DeleteProblemOutcome, JudgeContext, JudgeUpdate,
    MergeOutcome, MergeProblemsArgs, ProblemRow, ProblemUpload, ProblemUploadArgs, Store,
    UserBrief,
};

pub const DEADLOCK_RETRIES: u32 = 128;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> PgStore {
        PgStore { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run job-server migrations")?;
        Ok(())
    }
}

fn is_retryable(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

/// Retries `op` while the database reports a deadlock-like error.
async fn with_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) && attempts < DEADLOCK_RETRIES => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(5 * u64::from(attempts.min(20)))).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn begin_repeatable_read(
    pool: &PgPool,
) -> std::result::Result<Transaction<'_, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

// ── Row mapping ──

fn job_from_row(row: &PgRow) -> std::result::Result<JobRow, sqlx::Error> {
    let kind: i16 = row.try_get("type")?;
    let status: i16 = row.try_get("status")?;
    Ok(JobRow {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        creator: row.try_get("creator")?,
        file_id: row.try_get("file_id")?,
        kind: JobType::from_u8(kind as u8).ok_or_else(|| sqlx::Error::Decode(
            format!("unknown job type {kind}").into(),
        ))?,
        priority: row.try_get("priority")?,
        status: JobStatus::from_u8(status as u8).ok_or_else(|| sqlx::Error::Decode(
            format!("unknown job status {status}").into(),
        ))?,
        aux_id: row.try_get("aux_id")?,
        aux_id_2: row.try_get("aux_id_2")?,
        log: row.try_get("log")?,
    })
}

fn submission_from_row(row: &PgRow) -> std::result::Result<SubmissionRow, sqlx::Error> {
    let kind: i16 = row.try_get("kind")?;
    let language: i16 = row.try_get("language")?;
    let initial_status: i16 = row.try_get("initial_status")?;
    let full_status: i16 = row.try_get("full_status")?;
    let decode = |msg: String| sqlx::Error::Decode(msg.into());
    Ok(SubmissionRow {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        file_id: row.try_get("file_id")?,
        user_id: row.try_get("user_id")?,
        problem_id: row.try_get("problem_id")?,
        contest_problem_id: row.try_get("contest_problem_id")?,
        contest_round_id: row.try_get("contest_round_id")?,
        contest_id: row.try_get("contest_id")?,
        kind: SubmissionKind::from_u8(kind as u8)
            .ok_or_else(|| decode(format!("unknown submission kind {kind}")))?,
        language: language_from_u8(language as u8)
            .ok_or_else(|| decode(format!("unknown language {language}")))?,
        initial_status: SubmissionStatus::from_u8(initial_status as u8)
            .ok_or_else(|| decode(format!("unknown status {initial_status}")))?,
        full_status: SubmissionStatus::from_u8(full_status as u8)
            .ok_or_else(|| decode(format!("unknown status {full_status}")))?,
        score: row.try_get("score")?,
        last_judgment_began_at: row.try_get("last_judgment_began_at")?,
        initial_report: row.try_get("initial_report")?,
        final_report: row.try_get("final_report")?,
        problem_final: row.try_get("problem_final")?,
        contest_problem_final: row.try_get("contest_problem_final")?,
        contest_problem_initial_final: row.try_get("contest_problem_initial_final")?,
    })
}

fn problem_from_row(row: &PgRow) -> std::result::Result<ProblemRow, sqlx::Error> {
    Ok(ProblemRow {
        id: row.try_get("id")?,
        file_id: row.try_get("file_id")?,
        simfile: row.try_get("simfile")?,
        name: row.try_get("name")?,
        label: row.try_get("label")?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ── Shared statement helpers ──

async fn insert_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    job: &NewJob,
) -> std::result::Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO jobs (created_at, creator, file_id, type, priority, status, aux_id, \
         aux_id_2, log) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '') RETURNING id",
    )
    .bind(&job.created_at)
    .bind(job.creator)
    .bind(job.file_id)
    .bind(i16::from(job.kind.as_u8()))
    .bind(job.priority)
    .bind(i16::from(JobStatus::Pending.as_u8()))
    .bind(job.aux_id)
    .bind(job.aux_id_2)
    .fetch_one(&mut **tx)
    .await?;
    row.try_get("id")
}

/// `INSERT INTO jobs ... SELECT file_id FROM <source>` — schedules a
/// DELETE_INTERNAL_FILE job for every file the source query yields.
async fn schedule_file_deletions_tx(
    tx: &mut Transaction<'_, Postgres>,
    source_sql: &str,
    source_id: i64,
    now: &str,
) -> std::result::Result<(), sqlx::Error> {
    let sql = format!(
        "INSERT INTO jobs (created_at, creator, file_id, type, priority, status, aux_id, \
         aux_id_2, log) SELECT $1, NULL, NULL, $2, $3, $4, file_id, NULL, '' FROM {source_sql}"
    );
    sqlx::query(&sql)
        .bind(now)
        .bind(i16::from(JobType::DeleteInternalFile.as_u8()))
        .bind(JobType::DeleteInternalFile.default_priority())
        .bind(i16::from(JobStatus::Pending.as_u8()))
        .bind(source_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn finish_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    status: JobStatus,
    log: &str,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET status=$1, log=$2 WHERE id=$3")
        .bind(i16::from(status.as_u8()))
        .bind(log)
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Recomputes final-submission flags for one user on one problem and
/// optionally one contest problem.
async fn update_final_tx(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Option<i64>,
    problem_id: i64,
    contest_problem_id: Option<i64>,
) -> std::result::Result<(), sqlx::Error> {
    let Some(user_id) = user_id else {
        return Ok(());
    };
    let normal = i16::from(SubmissionKind::Normal.as_u8());

    sqlx::query(
        "UPDATE submissions SET problem_final = (id = (SELECT id FROM submissions WHERE \
         user_id=$1 AND problem_id=$2 AND kind=$3 AND score IS NOT NULL ORDER BY score DESC, \
         id DESC LIMIT 1)) WHERE user_id=$1 AND problem_id=$2",
    )
    .bind(user_id)
    .bind(problem_id)
    .bind(normal)
    .execute(&mut **tx)
    .await?;

    let Some(cp) = contest_problem_id else {
        return Ok(());
    };
    sqlx::query(
        "UPDATE submissions SET contest_problem_final = (id = (SELECT id FROM submissions \
         WHERE user_id=$1 AND contest_problem_id=$2 AND kind=$3 AND score IS NOT NULL \
         ORDER BY score DESC, id DESC LIMIT 1)) WHERE user_id=$1 AND contest_problem_id=$2",
    )
    .bind(user_id)
    .bind(cp)
    .bind(normal)
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        "UPDATE submissions SET contest_problem_initial_final = (id = (SELECT id FROM \
         submissions WHERE user_id=$1 AND contest_problem_id=$2 AND kind=$3 AND \
         initial_status <> $4 ORDER BY (initial_status = $5) DESC, id DESC LIMIT 1)) \
         WHERE user_id=$1 AND contest_problem_id=$2",
    )
    .bind(user_id)
    .bind(cp)
    .bind(normal)
    .bind(i16::from(SubmissionStatus::Pending.as_u8()))
    .bind(i16::from(SubmissionStatus::Ok.as_u8()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn enqueue(&self, job: NewJob) -> Result<i64> {
        with_retry(|| {
            let job = job.clone();
            async move {
                let mut tx = begin_repeatable_read(&self.pool).await?;
                let id = insert_job_tx(&mut tx, &job).await?;
                tx.commit().await?;
                Ok(id)
            }
        })
        .await
    }

    async fn job(&self, id: i64) -> Result<Option<JobRow>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    async fn reset_in_progress_jobs(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE jobs SET status=$1 WHERE status=$2")
            .bind(i16::from(JobStatus::Pending.as_u8()))
            .bind(i16::from(JobStatus::InProgress.as_u8()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn next_pending_job(&self, filter: &ConflictSnapshot) -> Result<Option<JobRow>> {
        // The filter's predicates are built from integer ids only, so they
        // are safe to splice into the statement.
        let sql = format!(
            "SELECT * FROM jobs WHERE status={} AND {} ORDER BY priority DESC, id ASC LIMIT 1",
            JobStatus::Pending.as_u8(),
            filter.sql_condition(),
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    async fn set_job_in_progress(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET status=$1 WHERE id=$2")
            .bind(i16::from(JobStatus::InProgress.as_u8()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_job(&self, id: i64, status: JobStatus, log: &str) -> Result<()> {
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            finish_job_tx(&mut tx, id, status, log).await?;
            tx.commit().await
        })
        .await
    }

    async fn update_job_log(&self, id: i64, log: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET log=$1 WHERE id=$2")
            .bind(log)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_internal_file(&self, created_at: &str) -> Result<i64> {
        let row = sqlx::query("INSERT INTO internal_files (created_at) VALUES ($1) RETURNING id")
            .bind(created_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn problem(&self, id: i64) -> Result<Option<ProblemRow>> {
        let row = sqlx::query("SELECT * FROM problems WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(problem_from_row).transpose()?)
    }

    async fn submission(&self, id: i64) -> Result<Option<SubmissionRow>> {
        let row = sqlx::query("SELECT * FROM submissions WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(submission_from_row).transpose()?)
    }

    async fn user_brief(&self, id: i64) -> Result<Option<UserBrief>> {
        let row = sqlx::query("SELECT id, username, kind FROM users WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| -> std::result::Result<UserBrief, sqlx::Error> {
                let kind: i16 = row.try_get("kind")?;
                Ok(UserBrief {
                    id: row.try_get("id")?,
                    username: row.try_get("username")?,
                    kind: kind as u8,
                })
            })
            .transpose()?)
    }

    async fn contest_name(&self, id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT name FROM contests WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("name")).transpose()?)
    }

    async fn contest_round_name(&self, id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT name FROM contest_rounds WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("name")).transpose()?)
    }

    async fn contest_problem_brief(&self, id: i64) -> Result<Option<ContestProblemBrief>> {
        let row = sqlx::query(
            "SELECT cp.id, cp.name, cp.problem_id, p.name AS problem_name, \
             cp.contest_round_id, r.name AS contest_round_name, cp.contest_id, \
             c.name AS contest_name \
             FROM contest_problems cp \
             JOIN contest_rounds r ON r.id = cp.contest_round_id \
             JOIN contests c ON c.id = cp.contest_id \
             JOIN problems p ON p.id = cp.problem_id \
             WHERE cp.id=$1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|row| -> std::result::Result<ContestProblemBrief, sqlx::Error> {
                Ok(ContestProblemBrief {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    problem_id: row.try_get("problem_id")?,
                    problem_name: row.try_get("problem_name")?,
                    contest_round_id: row.try_get("contest_round_id")?,
                    contest_round_name: row.try_get("contest_round_name")?,
                    contest_id: row.try_get("contest_id")?,
                    contest_name: row.try_get("contest_name")?,
                })
            })
            .transpose()?)
    }

    async fn problem_upload_args(&self, job_id: i64) -> Result<Option<ProblemUploadArgs>> {
        let row = sqlx::query(
            "SELECT j.file_id, u.name, u.label, u.memory_limit_mib, u.fixed_time_limit_ms, \
             u.reset_time_limits, u.ignore_existing_simfile, u.seek_new_tests, u.reset_scoring \
             FROM jobs j LEFT JOIN problem_upload_jobs u ON u.id = j.id WHERE j.id=$1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|row| -> std::result::Result<ProblemUploadArgs, sqlx::Error> {
                Ok(ProblemUploadArgs {
                    package_file_id: row.try_get("file_id")?,
                    name: row.try_get("name")?,
                    label: row.try_get("label")?,
                    memory_limit_mib: row
                        .try_get::<Option<i64>, _>("memory_limit_mib")?
                        .map(|v| v as u64),
                    fixed_time_limit_ms: row
                        .try_get::<Option<i64>, _>("fixed_time_limit_ms")?
                        .map(|v| v as u64),
                    reset_time_limits: row
                        .try_get::<Option<bool>, _>("reset_time_limits")?
                        .unwrap_or(false),
                    ignore_existing_simfile: row
                        .try_get::<Option<bool>, _>("ignore_existing_simfile")?
                        .unwrap_or(false),
                    seek_new_tests: row
                        .try_get::<Option<bool>, _>("seek_new_tests")?
                        .unwrap_or(false),
                    reset_scoring: row
                        .try_get::<Option<bool>, _>("reset_scoring")?
                        .unwrap_or(false),
                })
            })
            .transpose()?)
    }

    async fn merge_problems_args(&self, job_id: i64) -> Result<Option<MergeProblemsArgs>> {
        let row = sqlx::query(
            "SELECT j.aux_id, j.aux_id_2, m.rejudge_transferred_submissions \
             FROM jobs j LEFT JOIN merge_problems_jobs m ON m.id = j.id WHERE j.id=$1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let (Some(donor), Some(target)) = (
            row.try_get::<Option<i64>, _>("aux_id")?,
            row.try_get::<Option<i64>, _>("aux_id_2")?,
        ) else {
            return Ok(None);
        };
        Ok(Some(MergeProblemsArgs {
            donor_problem_id: donor,
            target_problem_id: target,
            rejudge_transferred_submissions: row
                .try_get::<Option<bool>, _>("rejudge_transferred_submissions")?
                .unwrap_or(false),
        }))
    }

    async fn change_statement_args(&self, job_id: i64) -> Result<Option<ChangeStatementArgs>> {
        let row = sqlx::query(
            "SELECT j.file_id, c.path_for_new_statement \
             FROM jobs j LEFT JOIN change_problem_statement_jobs c ON c.id = j.id WHERE j.id=$1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let Some(file_id) = row.try_get::<Option<i64>, _>("file_id")? else {
            return Ok(None);
        };
        Ok(Some(ChangeStatementArgs {
            new_statement_file_id: file_id,
            path_for_new_statement: row
                .try_get::<Option<String>, _>("path_for_new_statement")?
                .unwrap_or_default(),
        }))
    }

    async fn judge_context(
        &self,
        job_id: i64,
        submission_id: i64,
    ) -> Result<Option<JudgeContext>> {
        let row = sqlx::query(
            "SELECT s.file_id AS submission_file_id, s.user_id, s.problem_id, \
             p.file_id AS problem_file_id, s.contest_problem_id, s.language, \
             s.last_judgment_began_at, j.created_at AS job_created_at \
             FROM submissions s \
             JOIN problems p ON p.id = s.problem_id \
             JOIN jobs j ON j.id = $1 \
             WHERE s.id=$2",
        )
        .bind(job_id)
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|row| -> std::result::Result<JudgeContext, sqlx::Error> {
                let language: i16 = row.try_get("language")?;
                Ok(JudgeContext {
                    submission_file_id: row.try_get("submission_file_id")?,
                    submission_user_id: row.try_get("user_id")?,
                    problem_id: row.try_get("problem_id")?,
                    problem_file_id: row.try_get("problem_file_id")?,
                    contest_problem_id: row.try_get("contest_problem_id")?,
                    language: language_from_u8(language as u8).ok_or_else(|| {
                        sqlx::Error::Decode(format!("unknown language {language}").into())
                    })?,
                    last_judgment_began_at: row.try_get("last_judgment_began_at")?,
                    job_created_at: row.try_get("job_created_at")?,
                })
            })
            .transpose()?)
    }

    async fn begin_judgment(&self, submission_id: i64, at: &str) -> Result<()> {
        sqlx::query("UPDATE submissions SET last_judgment_began_at=$1 WHERE id=$2")
            .bind(at)
            .bind(submission_id)
            .execute(&self.pool)
            .await?;
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
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;

            let target = sqlx::query(
                "SELECT user_id, problem_id, contest_problem_id FROM submissions WHERE id=$1",
            )
            .bind(submission_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(target) = target {
                sqlx::query(
                    "UPDATE submissions SET initial_status=$1, full_status=$2, score=$3, \
                     initial_report=$4, final_report=$5 WHERE id=$6",
                )
                .bind(i16::from(update.initial_status.as_u8()))
                .bind(i16::from(update.full_status.as_u8()))
                .bind(update.score)
                .bind(&update.initial_report)
                .bind(&update.final_report)
                .bind(submission_id)
                .execute(&mut *tx)
                .await?;
                update_final_tx(
                    &mut tx,
                    target.try_get("user_id")?,
                    target.try_get("problem_id")?,
                    target.try_get("contest_problem_id")?,
                )
                .await?;
            }

            match terminal {
                Some(status) => finish_job_tx(&mut tx, job_id, status, log).await?,
                None => {
                    sqlx::query("UPDATE jobs SET log=$1 WHERE id=$2")
                        .bind(log)
                        .bind(job_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            tx.commit().await
        })
        .await
    }

    async fn apply_problem_upload(
        &self,
        job_id: i64,
        upload: &ProblemUpload,
        now: &str,
        log: &str,
    ) -> Result<Option<i64>> {
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            let solution_kind = i16::from(SubmissionKind::ProblemSolution.as_u8());

            let problem_id = match upload.existing_problem_id {
                Some(problem_id) => {
                    let exists = sqlx::query("SELECT 1 FROM problems WHERE id=$1")
                        .bind(problem_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                    if exists.is_none() {
                        tx.rollback().await?;
                        return Ok(None);
                    }
                    schedule_file_deletions_tx(&mut tx, "problems WHERE id=$5", problem_id, now)
                        .await?;
                    let sql = format!(
                        "submissions WHERE problem_id=$5 AND kind={solution_kind}"
                    );
                    schedule_file_deletions_tx(&mut tx, &sql, problem_id, now).await?;
                    sqlx::query("DELETE FROM submissions WHERE problem_id=$1 AND kind=$2")
                        .bind(problem_id)
                        .bind(solution_kind)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(
                        "UPDATE problems SET file_id=$1, simfile=$2, name=$3, label=$4, \
                         updated_at=$5 WHERE id=$6",
                    )
                    .bind(upload.package_file_id)
                    .bind(&upload.simfile)
                    .bind(&upload.name)
                    .bind(&upload.label)
                    .bind(now)
                    .bind(problem_id)
                    .execute(&mut *tx)
                    .await?;
                    problem_id
                }
                None => {
                    let row = sqlx::query(
                        "INSERT INTO problems (file_id, simfile, name, label, owner_id, \
                         created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $6) \
                         RETURNING id",
                    )
                    .bind(upload.package_file_id)
                    .bind(&upload.simfile)
                    .bind(&upload.name)
                    .bind(&upload.label)
                    .bind(upload.owner_id)
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await?;
                    row.try_get::<i64, _>("id")?
                }
            };

            for seed in &upload.solutions {
                let row = sqlx::query(
                    "INSERT INTO submissions (created_at, file_id, user_id, problem_id, \
                     contest_problem_id, contest_round_id, contest_id, kind, language, \
                     initial_status, full_status, score, initial_report, final_report) \
                     VALUES ($1, $2, NULL, $3, NULL, NULL, NULL, $4, $5, $6, $6, NULL, '', '') \
                     RETURNING id",
                )
                .bind(now)
                .bind(seed.file_id)
                .bind(problem_id)
                .bind(solution_kind)
                .bind(i16::from(crate::submissions::language_as_u8(seed.language)))
                .bind(i16::from(SubmissionStatus::Pending.as_u8()))
                .fetch_one(&mut *tx)
                .await?;
                let submission_id: i64 = row.try_get("id")?;
                let job = NewJob::new(JobType::JudgeSubmission, now)
                    .aux(submission_id)
                    .priority(JobType::JudgeSubmission.default_priority() + 1);
                insert_job_tx(&mut tx, &job).await?;
            }

            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await?;
            Ok(Some(problem_id))
        })
        .await
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
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            let exists = sqlx::query("SELECT 1 FROM problems WHERE id=$1")
                .bind(problem_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                tx.rollback().await?;
                return Ok(false);
            }
            schedule_file_deletions_tx(&mut tx, "problems WHERE id=$5", problem_id, now).await?;
            sqlx::query(
                "UPDATE problems SET file_id=$1, simfile=$2, updated_at=$3 WHERE id=$4",
            )
            .bind(new_file_id)
            .bind(new_simfile)
            .bind(now)
            .bind(problem_id)
            .execute(&mut *tx)
            .await?;
            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
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
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            let attached = sqlx::query("SELECT 1 FROM contest_problems WHERE problem_id=$1 LIMIT 1")
                .bind(problem_id)
                .fetch_optional(&mut *tx)
                .await?;
            if attached.is_some() {
                tx.rollback().await?;
                return Ok(DeleteProblemOutcome::AttachedToContest);
            }
            let exists = sqlx::query("SELECT 1 FROM problems WHERE id=$1")
                .bind(problem_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                tx.rollback().await?;
                return Ok(DeleteProblemOutcome::NotFound);
            }

            schedule_file_deletions_tx(&mut tx, "problems WHERE id=$5", problem_id, now).await?;
            schedule_file_deletions_tx(&mut tx, "submissions WHERE problem_id=$5", problem_id, now)
                .await?;
            // Submissions and tags go away via foreign keys.
            sqlx::query("DELETE FROM problems WHERE id=$1")
                .bind(problem_id)
                .execute(&mut *tx)
                .await?;

            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await?;
            Ok(DeleteProblemOutcome::Done)
        })
        .await
    }

    async fn apply_delete_user(
        &self,
        job_id: i64,
        user_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool> {
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            let exists = sqlx::query("SELECT 1 FROM users WHERE id=$1")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                tx.rollback().await?;
                return Ok(false);
            }
            schedule_file_deletions_tx(&mut tx, "submissions WHERE user_id=$5", user_id, now)
                .await?;
            // Sessions, contest memberships and submissions cascade; owned
            // problems and created jobs fall back to NULL.
            sqlx::query("DELETE FROM users WHERE id=$1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn apply_delete_contest(
        &self,
        job_id: i64,
        contest_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool> {
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            let exists = sqlx::query("SELECT 1 FROM contests WHERE id=$1")
                .bind(contest_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                tx.rollback().await?;
                return Ok(false);
            }
            schedule_file_deletions_tx(&mut tx, "submissions WHERE contest_id=$5", contest_id, now)
                .await?;
            sqlx::query("DELETE FROM contests WHERE id=$1")
                .bind(contest_id)
                .execute(&mut *tx)
                .await?;
            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn apply_delete_contest_round(
        &self,
        job_id: i64,
        contest_round_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool> {
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            let exists = sqlx::query("SELECT 1 FROM contest_rounds WHERE id=$1")
                .bind(contest_round_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                tx.rollback().await?;
                return Ok(false);
            }
            schedule_file_deletions_tx(
                &mut tx,
                "submissions WHERE contest_round_id=$5",
                contest_round_id,
                now,
            )
            .await?;
            sqlx::query("DELETE FROM contest_rounds WHERE id=$1")
                .bind(contest_round_id)
                .execute(&mut *tx)
                .await?;
            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn apply_delete_contest_problem(
        &self,
        job_id: i64,
        contest_problem_id: i64,
        now: &str,
        log: &str,
    ) -> Result<bool> {
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            let exists = sqlx::query("SELECT 1 FROM contest_problems WHERE id=$1")
                .bind(contest_problem_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                tx.rollback().await?;
                return Ok(false);
            }
            schedule_file_deletions_tx(
                &mut tx,
                "submissions WHERE contest_problem_id=$5",
                contest_problem_id,
                now,
            )
            .await?;
            sqlx::query("DELETE FROM contest_problems WHERE id=$1")
                .bind(contest_problem_id)
                .execute(&mut *tx)
                .await?;
            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn apply_delete_internal_file(
        &self,
        job_id: i64,
        file_id: i64,
        log: &str,
    ) -> Result<()> {
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            // The row may already be deleted.
            sqlx::query("DELETE FROM internal_files WHERE id=$1")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await
        })
        .await
    }

    async fn apply_merge_problems(
        &self,
        job_id: i64,
        args: &MergeProblemsArgs,
        now: &str,
        log: &str,
    ) -> Result<MergeOutcome> {
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            let donor_id = args.donor_problem_id;
            let target_id = args.target_problem_id;
            let solution_kind = i16::from(SubmissionKind::ProblemSolution.as_u8());

            let donor = sqlx::query("SELECT 1 FROM problems WHERE id=$1")
                .bind(donor_id)
                .fetch_optional(&mut *tx)
                .await?;
            if donor.is_none() {
                tx.rollback().await?;
                return Ok(MergeOutcome::DonorMissing);
            }
            let target = sqlx::query("SELECT 1 FROM problems WHERE id=$1")
                .bind(target_id)
                .fetch_optional(&mut *tx)
                .await?;
            if target.is_none() {
                tx.rollback().await?;
                return Ok(MergeOutcome::TargetMissing);
            }

            sqlx::query("UPDATE contest_problems SET problem_id=$1 WHERE problem_id=$2")
                .bind(target_id)
                .bind(donor_id)
                .execute(&mut *tx)
                .await?;

            schedule_file_deletions_tx(&mut tx, "problems WHERE id=$5", donor_id, now).await?;
            let sql = format!("submissions WHERE problem_id=$5 AND kind={solution_kind}");
            schedule_file_deletions_tx(&mut tx, &sql, donor_id, now).await?;
            sqlx::query("DELETE FROM submissions WHERE problem_id=$1 AND kind=$2")
                .bind(donor_id)
                .bind(solution_kind)
                .execute(&mut *tx)
                .await?;

            let finals = sqlx::query(
                "SELECT DISTINCT user_id, contest_problem_id FROM submissions WHERE problem_id=$1",
            )
            .bind(donor_id)
            .fetch_all(&mut *tx)
            .await?;

            if args.rejudge_transferred_submissions {
                sqlx::query(
                    "INSERT INTO jobs (created_at, creator, file_id, type, priority, status, \
                     aux_id, aux_id_2, log) SELECT $1, NULL, NULL, $2, $3, $4, id, NULL, '' \
                     FROM submissions WHERE problem_id=$5 ORDER BY id",
                )
                .bind(now)
                .bind(i16::from(JobType::RejudgeSubmission.as_u8()))
                .bind(JobType::RejudgeSubmission.default_priority())
                .bind(i16::from(JobStatus::Pending.as_u8()))
                .bind(donor_id)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query("UPDATE submissions SET problem_id=$1 WHERE problem_id=$2")
                .bind(target_id)
                .bind(donor_id)
                .execute(&mut *tx)
                .await?;

            for row in &finals {
                update_final_tx(
                    &mut tx,
                    row.try_get("user_id")?,
                    target_id,
                    row.try_get("contest_problem_id")?,
                )
                .await?;
            }

            // Duplicate tags stay with the donor and disappear with it.
            sqlx::query(
                "INSERT INTO problem_tags (problem_id, name) SELECT $1, name FROM problem_tags \
                 WHERE problem_id=$2 ON CONFLICT DO NOTHING",
            )
            .bind(target_id)
            .bind(donor_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM problems WHERE id=$1")
                .bind(donor_id)
                .execute(&mut *tx)
                .await?;

            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await?;
            Ok(MergeOutcome::Done)
        })
        .await
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
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;

            let donor = sqlx::query("SELECT kind FROM users WHERE id=$1")
                .bind(donor_user_id)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(donor) = donor else {
                tx.rollback().await?;
                return Ok(MergeOutcome::DonorMissing);
            };
            let target = sqlx::query("SELECT kind FROM users WHERE id=$1")
                .bind(target_user_id)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(target) = target else {
                tx.rollback().await?;
                return Ok(MergeOutcome::TargetMissing);
            };

            // Lower kind value means more permissions.
            let donor_kind: i16 = donor.try_get("kind")?;
            let target_kind: i16 = target.try_get("kind")?;
            if donor_kind < target_kind {
                sqlx::query("UPDATE users SET kind=$1 WHERE id=$2")
                    .bind(donor_kind)
                    .bind(target_user_id)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query("UPDATE sessions SET user_id=$1 WHERE user_id=$2")
                .bind(target_user_id)
                .bind(donor_user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE problems SET owner_id=$1 WHERE owner_id=$2")
                .bind(target_user_id)
                .bind(donor_user_id)
                .execute(&mut *tx)
                .await?;

            // Keep the stronger contest mode where both sides are members,
            // then move memberships the target lacks.
            sqlx::query(
                "UPDATE contest_users tcu SET mode = dcu.mode FROM contest_users dcu \
                 WHERE tcu.user_id=$1 AND dcu.user_id=$2 \
                 AND dcu.contest_id = tcu.contest_id AND dcu.mode > tcu.mode",
            )
            .bind(target_user_id)
            .bind(donor_user_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO contest_users (contest_id, user_id, mode) \
                 SELECT contest_id, $1, mode FROM contest_users WHERE user_id=$2 \
                 ON CONFLICT DO NOTHING",
            )
            .bind(target_user_id)
            .bind(donor_user_id)
            .execute(&mut *tx)
            .await?;

            let finals = sqlx::query(
                "SELECT DISTINCT problem_id, contest_problem_id FROM submissions WHERE user_id=$1",
            )
            .bind(donor_user_id)
            .fetch_all(&mut *tx)
            .await?;

            sqlx::query("UPDATE submissions SET user_id=$1 WHERE user_id=$2")
                .bind(target_user_id)
                .bind(donor_user_id)
                .execute(&mut *tx)
                .await?;

            for row in &finals {
                update_final_tx(
                    &mut tx,
                    Some(target_user_id),
                    row.try_get("problem_id")?,
                    row.try_get("contest_problem_id")?,
                )
                .await?;
            }

            sqlx::query("UPDATE jobs SET creator=$1 WHERE creator=$2")
                .bind(target_user_id)
                .bind(donor_user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM users WHERE id=$1")
                .bind(donor_user_id)
                .execute(&mut *tx)
                .await?;

            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await?;
            Ok(MergeOutcome::Done)
        })
        .await
    }

    async fn apply_reselect_final(
        &self,
        job_id: i64,
        contest_problem_id: i64,
        log: &str,
    ) -> Result<bool> {
        with_retry(|| async move {
            let mut tx = begin_repeatable_read(&self.pool).await?;
            let cp = sqlx::query("SELECT problem_id FROM contest_problems WHERE id=$1")
                .bind(contest_problem_id)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(cp) = cp else {
                tx.rollback().await?;
                return Ok(false);
            };
            let problem_id: i64 = cp.try_get("problem_id")?;

            let users = sqlx::query(
                "SELECT DISTINCT user_id FROM submissions \
                 WHERE contest_problem_id=$1 AND user_id IS NOT NULL",
            )
            .bind(contest_problem_id)
            .fetch_all(&mut *tx)
            .await?;
            for row in &users {
                update_final_tx(
                    &mut tx,
                    row.try_get("user_id")?,
                    problem_id,
                    Some(contest_problem_id),
                )
                .await?;
            }

            finish_job_tx(&mut tx, job_id, JobStatus::Done, log).await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
    }
}
