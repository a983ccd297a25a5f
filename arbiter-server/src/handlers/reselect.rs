//! RESELECT_FINAL_SUBMISSIONS_IN_CONTEST_PROBLEM.

use anyhow::Result;

use crate::jobs::JobRow;

use super::{aux_of, HandlerCtx, HandlerOutcome};

pub async fn reselect_final_submissions(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let contest_problem_id = aux_of(job)?;
    if let Some(brief) = ctx.store.contest_problem_brief(contest_problem_id).await? {
        ctx.log.line(format!(
            "Reselecting final submissions in contest problem {} ({contest_problem_id})",
            brief.name
        ));
    }

    if ctx
        .store
        .apply_reselect_final(job.id, contest_problem_id, &ctx.log.snapshot())
        .await?
    {
        Ok(HandlerOutcome::Finished)
    } else {
        Ok(HandlerOutcome::Failed(format!(
            "Contest problem with id {contest_problem_id} does not exist"
        )))
    }
}
