//! ADD_PROBLEM / REUPLOAD_PROBLEM.
//!
//! Consumes an uploaded package, constructs a clean Simfile (judging the
//! model solution to derive time limits when requested), writes the package
//! under a fresh internal file, installs or replaces the problem row and
//! stages every declared solution as a PROBLEM_SOLUTION submission with a
//! judge job. Replaced files are freed through DELETE_INTERNAL_FILE jobs.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use arbiter_core::compile::{CompileError, CompileOptions, SolutionLanguage};
use arbiter_core::judge::JudgeWorker;
use arbiter_core::package::{
    construct_simfile, reset_time_limits_using_reports, ConstructOptions, Construction, Package,
    PackageError,
};
use arbiter_core::simfile::Simfile;

use crate::config::utc_datetime;
use crate::files::FileRemover;
use crate::jobs::JobRow;
use crate::logger::JobLog;
use crate::store::{ProblemUpload, ProblemUploadArgs, SolutionSeed};

use super::{aux_of, HandlerCtx, HandlerOutcome};

pub async fn add_problem(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    upload_problem(ctx, job, None).await
}

pub async fn reupload_problem(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let problem_id = aux_of(job)?;
    upload_problem(ctx, job, Some(problem_id)).await
}

async fn upload_problem(
    ctx: &HandlerCtx,
    job: &JobRow,
    existing_problem_id: Option<i64>,
) -> Result<HandlerOutcome> {
    let Some(args) = ctx.store.problem_upload_args(job.id).await? else {
        return Ok(HandlerOutcome::Failed("missing upload arguments".into()));
    };
    let Some(package_file_id) = args.package_file_id else {
        return Ok(HandlerOutcome::Failed(
            "the job has no uploaded package attached".into(),
        ));
    };

    // Construct the Simfile, judging the model solution if time limits have
    // to be derived from it.
    let package_path = ctx.files.path_of(package_file_id);
    let construct_options = construct_options_of(&args);
    let compile_options = compile_options_of(ctx);
    let log = ctx.log.clone();
    let simfile = {
        let package_path = package_path.clone();
        tokio::task::spawn_blocking(move || {
            build_simfile(&package_path, construct_options, compile_options, log)
        })
        .await??
    };
    let simfile = match simfile {
        Ok(simfile) => simfile,
        Err(reason) => return Ok(HandlerOutcome::Failed(reason)),
    };

    let now = utc_datetime();
    ctx.log.line("Creating package with a new Simfile...");
    let new_package_file_id = ctx.store.create_internal_file(&now).await?;
    let new_package_path = ctx.files.path_of(new_package_file_id);
    let simfile_text = simfile.dump();
    {
        let src = package_path.clone();
        let dest = new_package_path.clone();
        let simfile_text = simfile_text.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PackageError> {
            Package::open(src)?.rewrite(
                &dest,
                &[],
                &[(
                    "Simfile",
                    arbiter_core::package::EntrySource::Bytes(simfile_text.into_bytes()),
                )],
            )
        })
        .await?
        .context("failed to write the new package")?;
    }
    let mut removers = vec![FileRemover::new(&new_package_path)];

    // Stage the package solutions as internal files.
    ctx.log.line("Submitting solutions...");
    let package = Package::open(&package_path)?;
    let mut solutions = Vec::new();
    for solution in &simfile.solutions {
        ctx.log.line(format!("Submitting: {solution}"));
        let Some(language) = SolutionLanguage::from_filename(solution) else {
            return Ok(HandlerOutcome::Failed(format!(
                "unknown language of solution: {solution}"
            )));
        };
        let file_id = ctx.store.create_internal_file(&now).await?;
        let dest = ctx.files.path_of(file_id);
        std::fs::copy(package.entry_path(solution)?, &dest)
            .with_context(|| format!("failed to stage solution {solution}"))?;
        removers.push(FileRemover::new(dest));
        solutions.push(SolutionSeed {
            file_id,
            language,
            filename: solution.clone(),
        });
    }

    let upload = ProblemUpload {
        existing_problem_id,
        name: simfile.name.clone(),
        label: simfile.label.clone(),
        simfile: simfile_text,
        package_file_id: new_package_file_id,
        owner_id: job.creator,
        solutions,
    };
    ctx.log.line(match existing_problem_id {
        Some(problem_id) => format!("Reuploading problem {problem_id}: {}", simfile.name),
        None => format!("Adding problem: {}", simfile.name),
    });
    let applied = ctx
        .store
        .apply_problem_upload(job.id, &upload, &now, &ctx.log.snapshot())
        .await?;
    let Some(_problem_id) = applied else {
        return Ok(HandlerOutcome::Failed(format!(
            "problem {} does not exist",
            existing_problem_id.unwrap_or_default()
        )));
    };

    for remover in removers {
        remover.cancel();
    }
    ctx.notify_job_server();
    Ok(HandlerOutcome::Finished)
}

fn construct_options_of(args: &ProblemUploadArgs) -> ConstructOptions {
    ConstructOptions {
        name: args.name.clone(),
        label: args.label.clone(),
        memory_limit_mib: args.memory_limit_mib,
        fixed_time_limit: args.fixed_time_limit_ms.map(Duration::from_millis),
        reset_time_limits: args.reset_time_limits,
        ignore_existing_simfile: args.ignore_existing_simfile,
        seek_new_tests: args.seek_new_tests,
        reset_scoring: args.reset_scoring,
    }
}

pub(crate) fn compile_options_of(ctx: &HandlerCtx) -> CompileOptions {
    CompileOptions {
        time_limit: ctx.config.compile_time_limit(),
        proot_path: ctx.config.proot_path.clone(),
        ..CompileOptions::default()
    }
}

/// Runs the package-conversion flow. The outer error is a job fault; the
/// inner `Err(String)` is a well-formed failure (bad package, compilation
/// error) that fails the job with a readable log.
pub(crate) fn build_simfile(
    package_path: &Path,
    options: ConstructOptions,
    compile_options: CompileOptions,
    log: JobLog,
) -> Result<std::result::Result<Simfile, String>> {
    let package = match Package::open(package_path) {
        Ok(package) => package,
        Err(e) => return Ok(Err(format!("cannot open the package: {e}"))),
    };
    let mut simfile = match construct_simfile(&package, &options) {
        Ok(Construction::Complete(simfile)) => return Ok(Ok(simfile)),
        Ok(Construction::NeedsModelSolutionJudge(simfile)) => simfile,
        Err(e) => return Ok(Err(format!("package conversion failed: {e}"))),
    };

    log.line("Loading the problem package for judging the model solution...");
    let mut judge_worker = JudgeWorker::load_package(package_path, Some(&simfile.dump()))?;
    judge_worker.set_compile_options(compile_options);
    let model_solution = simfile.model_solution().to_string();
    log.line(format!("Judging the model solution: {model_solution}"));

    log.line("Compiling solution...");
    match judge_worker.compile_solution_from_package(&model_solution) {
        Ok(()) => {}
        Err(CompileError::Failed { diagnostics }) => {
            return Ok(Err(format!("model solution compilation failed:\n{diagnostics}")));
        }
        Err(e) => return Err(e.into()),
    }
    log.line("Compiling checker...");
    match judge_worker.compile_checker() {
        Ok(()) => {}
        Err(CompileError::Failed { diagnostics }) => {
            return Ok(Err(format!("checker compilation failed:\n{diagnostics}")));
        }
        Err(e) => return Err(e.into()),
    }

    log.line("Judging...");
    let mut judge_log = log.clone();
    let initial = judge_worker.judge(false, &mut judge_log, &mut |_| {})?;
    let final_ = judge_worker.judge(true, &mut judge_log, &mut |_| {})?;
    reset_time_limits_using_reports(&mut simfile, &[&initial, &final_]);
    Ok(Ok(simfile))
}
