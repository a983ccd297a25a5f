//! CHANGE_PROBLEM_STATEMENT.
//!
//! Rewrites the problem's package with exactly one entry replaced: the old
//! statement goes away, the attached upload becomes the new statement, and
//! the Simfile's `statement` field follows. The old package file is freed
//! through a DELETE_INTERNAL_FILE job.

use std::path::{Component, Path};

use anyhow::{Context, Result};

use arbiter_core::package::{EntrySource, Package, PackageError};
use arbiter_core::simfile::Simfile;

use crate::config::utc_datetime;
use crate::files::FileRemover;
use crate::jobs::JobRow;

use super::{aux_of, HandlerCtx, HandlerOutcome};

pub async fn change_problem_statement(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let problem_id = aux_of(job)?;
    let Some(args) = ctx.store.change_statement_args(job.id).await? else {
        return Ok(HandlerOutcome::Failed(
            "the job has no new statement file attached".into(),
        ));
    };

    let Some(problem) = ctx.store.problem(problem_id).await? else {
        return Ok(HandlerOutcome::Cancelled(format!(
            "The problem with id {problem_id} does not exist"
        )));
    };
    let mut simfile = match Simfile::parse(&problem.simfile) {
        Ok(simfile) => simfile,
        Err(e) => {
            return Ok(HandlerOutcome::Failed(format!(
                "the problem's Simfile does not parse: {e}"
            )));
        }
    };

    let old_statement = simfile.statement.clone();
    let new_statement = if args.path_for_new_statement.is_empty() {
        old_statement.clone()
    } else {
        match sanitize_entry_path(&args.path_for_new_statement) {
            Some(path) => path,
            None => {
                return Ok(HandlerOutcome::Failed(format!(
                    "invalid statement path: {}",
                    args.path_for_new_statement
                )));
            }
        }
    };
    if new_statement == "Simfile" {
        return Ok(HandlerOutcome::Cancelled(
            "Invalid new statement path - it would overwrite the Simfile".into(),
        ));
    }
    simfile.statement = new_statement.clone();
    ctx.log.line(format!(
        "Replacing statement {old_statement} with {new_statement}"
    ));

    let now = utc_datetime();
    let new_file_id = ctx.store.create_internal_file(&now).await?;
    let new_package_path = ctx.files.path_of(new_file_id);
    let simfile_text = simfile.dump();
    {
        let src = ctx.files.path_of(problem.file_id);
        let dest = new_package_path.clone();
        let statement_source = ctx.files.path_of(args.new_statement_file_id);
        let simfile_text = simfile_text.clone();
        let old_statement = old_statement.clone();
        let new_statement = new_statement.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PackageError> {
            Package::open(src)?.rewrite(
                &dest,
                &[old_statement.as_str()],
                &[
                    ("Simfile", EntrySource::Bytes(simfile_text.into_bytes())),
                    (new_statement.as_str(), EntrySource::File(statement_source)),
                ],
            )
        })
        .await?
        .context("failed to rewrite the package")?;
    }
    let remover = FileRemover::new(&new_package_path);

    let applied = ctx
        .store
        .apply_change_statement(
            job.id,
            problem_id,
            new_file_id,
            &simfile_text,
            &now,
            &ctx.log.snapshot(),
        )
        .await?;
    if !applied {
        return Ok(HandlerOutcome::Cancelled(format!(
            "The problem with id {problem_id} does not exist"
        )));
    }
    remover.cancel();
    ctx.notify_job_server();
    Ok(HandlerOutcome::Finished)
}

/// Normalizes a user-supplied package path to a plain relative one.
fn sanitize_entry_path(path: &str) -> Option<String> {
    let trimmed = path.trim_start_matches('/');
    let ok = !trimmed.is_empty()
        && Path::new(trimmed)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    ok.then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_paths_are_normalized() {
        assert_eq!(sanitize_entry_path("doc/v2.pdf"), Some("doc/v2.pdf".into()));
        assert_eq!(sanitize_entry_path("/doc/v2.pdf"), Some("doc/v2.pdf".into()));
        assert_eq!(sanitize_entry_path("../escape"), None);
        assert_eq!(sanitize_entry_path(""), None);
    }
}
