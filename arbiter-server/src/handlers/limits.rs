//! RESET_PROBLEM_TIME_LIMITS_USING_MODEL_SOLUTION.
//!
//! Judges the package's model solution and rewrites the package with a
//! Simfile whose time limits derive from the measured runtimes.

use anyhow::{Context, Result};

use arbiter_core::package::{ConstructOptions, EntrySource, Package, PackageError};

use crate::config::utc_datetime;
use crate::files::FileRemover;
use crate::jobs::JobRow;

use super::upload::{build_simfile, compile_options_of};
use super::{aux_of, HandlerCtx, HandlerOutcome};

pub async fn reset_problem_time_limits(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let problem_id = aux_of(job)?;
    let Some(problem) = ctx.store.problem(problem_id).await? else {
        return Ok(HandlerOutcome::Failed(format!(
            "Problem with id {problem_id} does not exist"
        )));
    };
    ctx.log
        .line(format!("Resetting time limits of problem {problem_id}..."));

    let package_path = ctx.files.path_of(problem.file_id);
    let options = ConstructOptions {
        reset_time_limits: true,
        ..ConstructOptions::default()
    };
    let compile_options = compile_options_of(ctx);
    let log = ctx.log.clone();
    let simfile = {
        let package_path = package_path.clone();
        tokio::task::spawn_blocking(move || {
            build_simfile(&package_path, options, compile_options, log)
        })
        .await??
    };
    let simfile = match simfile {
        Ok(simfile) => simfile,
        Err(reason) => return Ok(HandlerOutcome::Failed(reason)),
    };

    let now = utc_datetime();
    let new_file_id = ctx.store.create_internal_file(&now).await?;
    let new_package_path = ctx.files.path_of(new_file_id);
    let simfile_text = simfile.dump();
    {
        let dest = new_package_path.clone();
        let simfile_text = simfile_text.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PackageError> {
            Package::open(package_path)?.rewrite(
                &dest,
                &[],
                &[("Simfile", EntrySource::Bytes(simfile_text.into_bytes()))],
            )
        })
        .await?
        .context("failed to rewrite the package")?;
    }
    let remover = FileRemover::new(&new_package_path);

    let applied = ctx
        .store
        .apply_reset_time_limits(
            job.id,
            problem_id,
            new_file_id,
            &simfile_text,
            &now,
            &ctx.log.snapshot(),
        )
        .await?;
    if !applied {
        return Ok(HandlerOutcome::Failed(format!(
            "Problem with id {problem_id} does not exist"
        )));
    }
    remover.cancel();
    ctx.notify_job_server();
    Ok(HandlerOutcome::Finished)
}
