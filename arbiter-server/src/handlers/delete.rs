//! Entity deletion handlers.
//!
//! Each one logs what is about to disappear, schedules DELETE_INTERNAL_FILE
//! jobs for every internal file the entity transitively owns, and deletes
//! the row; referential integrity removes the dependents. A missing target
//! fails the job with a readable message.

use anyhow::Result;

use crate::config::utc_datetime;
use crate::jobs::JobRow;
use crate::store::DeleteProblemOutcome;

use super::{aux_of, HandlerCtx, HandlerOutcome};

fn user_kind_label(kind: u8) -> &'static str {
    match kind {
        0 => "admin",
        1 => "teacher",
        _ => "normal",
    }
}

pub async fn delete_problem(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let problem_id = aux_of(job)?;
    let Some(problem) = ctx.store.problem(problem_id).await? else {
        return Ok(HandlerOutcome::Failed("Problem does not exist".into()));
    };
    ctx.log
        .line(format!("Deleted problem Simfile:\n{}", problem.simfile));

    let outcome = ctx
        .store
        .apply_delete_problem(job.id, problem_id, &utc_datetime(), &ctx.log.snapshot())
        .await?;
    match outcome {
        DeleteProblemOutcome::Done => {
            ctx.notify_job_server();
            Ok(HandlerOutcome::Finished)
        }
        DeleteProblemOutcome::NotFound => {
            Ok(HandlerOutcome::Failed("Problem does not exist".into()))
        }
        DeleteProblemOutcome::AttachedToContest => Ok(HandlerOutcome::Failed(
            "There exists a contest problem that uses (attaches) this problem. You have to \
             delete all of them to be able to delete this problem."
                .into(),
        )),
    }
}

pub async fn delete_user(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let user_id = aux_of(job)?;
    let Some(user) = ctx.store.user_brief(user_id).await? else {
        return Ok(HandlerOutcome::Failed(format!(
            "User with id {user_id} does not exist"
        )));
    };
    ctx.log.line(format!("username: {}", user.username));
    ctx.log.line(format!("type: {}", user_kind_label(user.kind)));

    if ctx
        .store
        .apply_delete_user(job.id, user_id, &utc_datetime(), &ctx.log.snapshot())
        .await?
    {
        ctx.notify_job_server();
        Ok(HandlerOutcome::Finished)
    } else {
        Ok(HandlerOutcome::Failed(format!(
            "User with id {user_id} does not exist"
        )))
    }
}

pub async fn delete_contest(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let contest_id = aux_of(job)?;
    let Some(name) = ctx.store.contest_name(contest_id).await? else {
        return Ok(HandlerOutcome::Failed(format!(
            "Contest with id {contest_id} does not exist"
        )));
    };
    ctx.log.line(format!("Contest: {name} ({contest_id})"));

    if ctx
        .store
        .apply_delete_contest(job.id, contest_id, &utc_datetime(), &ctx.log.snapshot())
        .await?
    {
        ctx.notify_job_server();
        Ok(HandlerOutcome::Finished)
    } else {
        Ok(HandlerOutcome::Failed(format!(
            "Contest with id {contest_id} does not exist"
        )))
    }
}

pub async fn delete_contest_round(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let contest_round_id = aux_of(job)?;
    let Some(name) = ctx.store.contest_round_name(contest_round_id).await? else {
        return Ok(HandlerOutcome::Failed(format!(
            "Contest round with id {contest_round_id} does not exist"
        )));
    };
    ctx.log
        .line(format!("Contest round: {name} ({contest_round_id})"));

    if ctx
        .store
        .apply_delete_contest_round(
            job.id,
            contest_round_id,
            &utc_datetime(),
            &ctx.log.snapshot(),
        )
        .await?
    {
        ctx.notify_job_server();
        Ok(HandlerOutcome::Finished)
    } else {
        Ok(HandlerOutcome::Failed(format!(
            "Contest round with id {contest_round_id} does not exist"
        )))
    }
}

pub async fn delete_contest_problem(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let contest_problem_id = aux_of(job)?;
    let Some(brief) = ctx.store.contest_problem_brief(contest_problem_id).await? else {
        return Ok(HandlerOutcome::Failed(format!(
            "Contest problem with id {contest_problem_id} does not exist or the contest \
             hierarchy is broken (likely the former)."
        )));
    };
    ctx.log
        .line(format!("Contest: {} ({})", brief.contest_name, brief.contest_id));
    ctx.log.line(format!(
        "Contest round: {} ({})",
        brief.contest_round_name, brief.contest_round_id
    ));
    ctx.log.line(format!(
        "Contest problem: {} ({contest_problem_id})",
        brief.name
    ));
    ctx.log.line(format!(
        "Attached problem: {} ({})",
        brief.problem_name, brief.problem_id
    ));

    if ctx
        .store
        .apply_delete_contest_problem(
            job.id,
            contest_problem_id,
            &utc_datetime(),
            &ctx.log.snapshot(),
        )
        .await?
    {
        ctx.notify_job_server();
        Ok(HandlerOutcome::Finished)
    } else {
        Ok(HandlerOutcome::Failed(format!(
            "Contest problem with id {contest_problem_id} does not exist or the contest \
             hierarchy is broken (likely the former)."
        )))
    }
}

pub async fn delete_internal_file(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let file_id = aux_of(job)?;
    ctx.log.line(format!("Internal file ID: {file_id}"));
    // The disk object may already be gone; that is fine.
    if let Err(e) = ctx.files.remove(file_id) {
        ctx.log.line(format!("unlink failed: {e}"));
    }
    ctx.store
        .apply_delete_internal_file(job.id, file_id, &ctx.log.snapshot())
        .await?;
    Ok(HandlerOutcome::Finished)
}
