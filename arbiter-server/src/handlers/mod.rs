//! Job handlers, one per job type.
//!
//! A handler receives the store, the file store, the runtime config and a
//! job log bundled in [`HandlerCtx`], performs its effect through a
//! composite store operation (which also marks the job DONE), and returns
//! a [`HandlerOutcome`]. `Cancelled` and `Failed` mean the job row has not
//! been touched yet; the worker wrapper writes the terminal status together
//! with the final log. Any `Err` or panic is a job fault and ends FAILED.

pub mod delete;
pub mod judge;
pub mod limits;
pub mod merge;
pub mod reselect;
pub mod statement;
pub mod upload;

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::files::FileStore;
use crate::jobs::{JobRow, JobType};
use crate::logger::JobLog;
use crate::notify;
use crate::store::Store;

pub struct HandlerCtx {
    pub store: Arc<dyn Store>,
    pub files: Arc<FileStore>,
    pub config: Arc<RuntimeConfig>,
    pub log: JobLog,
}

impl HandlerCtx {
    /// Wakes the dispatcher after this handler inserted new jobs.
    pub fn notify_job_server(&self) {
        if let Err(e) = notify::notify_job_server(&self.files.notify_path()) {
            warn!("failed to touch the notify file: {e}");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The composite store operation already marked the job DONE.
    Finished,
    /// Superseded or pointless; not a failure.
    Cancelled(String),
    Failed(String),
}

fn aux_of(job: &JobRow) -> Result<i64> {
    match job.aux_id {
        Some(aux) => Ok(aux),
        None => bail!("job {} of type {:?} has no aux_id", job.id, job.kind),
    }
}

fn aux2_of(job: &JobRow) -> Result<i64> {
    match job.aux_id_2 {
        Some(aux) => Ok(aux),
        None => bail!("job {} of type {:?} has no aux_id_2", job.id, job.kind),
    }
}

pub async fn run_handler(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    match job.kind {
        JobType::JudgeSubmission | JobType::RejudgeSubmission => {
            judge::judge_submission(ctx, job).await
        }
        JobType::AddProblem => upload::add_problem(ctx, job).await,
        JobType::ReuploadProblem => upload::reupload_problem(ctx, job).await,
        JobType::EditProblem => Ok(HandlerOutcome::Cancelled(
            "Problem editing is not supported yet.".into(),
        )),
        JobType::DeleteProblem => delete::delete_problem(ctx, job).await,
        JobType::MergeProblems => merge::merge_problems(ctx, job).await,
        JobType::ReselectFinalSubmissionsInContestProblem => {
            reselect::reselect_final_submissions(ctx, job).await
        }
        JobType::DeleteUser => delete::delete_user(ctx, job).await,
        JobType::MergeUsers => merge::merge_users(ctx, job).await,
        JobType::DeleteContest => delete::delete_contest(ctx, job).await,
        JobType::DeleteContestRound => delete::delete_contest_round(ctx, job).await,
        JobType::DeleteContestProblem => delete::delete_contest_problem(ctx, job).await,
        JobType::ChangeProblemStatement => statement::change_problem_statement(ctx, job).await,
        JobType::ResetProblemTimeLimitsUsingModelSolution => {
            limits::reset_problem_time_limits(ctx, job).await
        }
        JobType::DeleteInternalFile => delete::delete_internal_file(ctx, job).await,
    }
}
