//! MERGE_PROBLEMS / MERGE_USERS.
//!
//! Everything referencing the donor id moves to the target id inside one
//! transaction; unique-key collisions are skipped, final submissions are
//! recomputed for every transferred pair, and the donor row is deleted
//! last. MERGE_PROBLEMS optionally schedules a rejudge of every transferred
//! submission.

use anyhow::Result;

use crate::config::utc_datetime;
use crate::jobs::JobRow;
use crate::store::MergeOutcome;

use super::{aux2_of, aux_of, HandlerCtx, HandlerOutcome};

pub async fn merge_problems(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let Some(args) = ctx.store.merge_problems_args(job.id).await? else {
        return Ok(HandlerOutcome::Failed("missing merge arguments".into()));
    };
    let Some(donor) = ctx.store.problem(args.donor_problem_id).await? else {
        return Ok(HandlerOutcome::Failed(
            "Problem to delete does not exist".into(),
        ));
    };
    ctx.log.line(format!(
        "Merged problem (donor) Simfile:\n{}",
        donor.simfile
    ));

    let outcome = ctx
        .store
        .apply_merge_problems(job.id, &args, &utc_datetime(), &ctx.log.snapshot())
        .await?;
    match outcome {
        MergeOutcome::Done => {
            ctx.notify_job_server();
            Ok(HandlerOutcome::Finished)
        }
        MergeOutcome::DonorMissing => Ok(HandlerOutcome::Failed(
            "Problem to delete does not exist".into(),
        )),
        MergeOutcome::TargetMissing => Ok(HandlerOutcome::Failed(
            "Target problem does not exist".into(),
        )),
    }
}

pub async fn merge_users(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let donor_user_id = aux_of(job)?;
    let target_user_id = aux2_of(job)?;
    let Some(donor) = ctx.store.user_brief(donor_user_id).await? else {
        return Ok(HandlerOutcome::Failed(
            "User to delete does not exist".into(),
        ));
    };
    ctx.log
        .line(format!("Merged user's username: {}", donor.username));

    let outcome = ctx
        .store
        .apply_merge_users(
            job.id,
            donor_user_id,
            target_user_id,
            &utc_datetime(),
            &ctx.log.snapshot(),
        )
        .await?;
    match outcome {
        MergeOutcome::Done => {
            ctx.notify_job_server();
            Ok(HandlerOutcome::Finished)
        }
        MergeOutcome::DonorMissing => Ok(HandlerOutcome::Failed(
            "User to delete does not exist".into(),
        )),
        MergeOutcome::TargetMissing => {
            Ok(HandlerOutcome::Failed("Target user does not exist".into()))
        }
    }
}
