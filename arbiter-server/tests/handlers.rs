//! Handler-level scenarios against the memory store: judge cancellation,
//! file deletion idempotence, entity deletion, merging and statement
//! replacement.

mod common;

use arbiter_server::handlers::{run_handler, HandlerOutcome};
use arbiter_server::jobs::{JobStatus, JobType, NewJob};
use arbiter_server::store::{
    ChangeStatementArgs, JudgeUpdate, MergeProblemsArgs, Store,
};
use arbiter_server::submissions::{SubmissionKind, SubmissionStatus};

use common::{problem_row, submission_row, Fixture, T0, T1};

#[tokio::test]
async fn superseded_rejudge_is_cancelled_without_touching_the_submission() {
    let fx = Fixture::new();
    let problem = fx.problem_with_package(1).await;
    let source_file = fx.store.seed_internal_file(T0).await;
    let mut submission = submission_row(42, problem.id, source_file);
    // Judged after the job below was created.
    submission.last_judgment_began_at = Some(T1.to_string());
    submission.full_status = SubmissionStatus::Ok;
    submission.score = Some(100);
    fx.store.seed_submission(submission.clone()).await;

    let job = fx
        .enqueue(NewJob::new(JobType::RejudgeSubmission, T0).aux(42))
        .await;
    let ctx = fx.ctx();
    let outcome = run_handler(&ctx, &job).await.unwrap();
    let HandlerOutcome::Cancelled(reason) = outcome else {
        panic!("expected cancellation, got {outcome:?}");
    };
    assert!(reason.contains("Skipping judging"));

    let after = fx.store.submission(42).await.unwrap().unwrap();
    assert_eq!(after, submission);
}

#[tokio::test]
async fn judging_a_deleted_submission_is_cancelled() {
    let fx = Fixture::new();
    let job = fx
        .enqueue(NewJob::new(JobType::JudgeSubmission, T0).aux(999))
        .await;
    let ctx = fx.ctx();
    let outcome = run_handler(&ctx, &job).await.unwrap();
    assert_eq!(
        outcome,
        HandlerOutcome::Cancelled("Submission has been deleted.".into())
    );
}

#[tokio::test]
async fn deleting_an_internal_file_twice_is_idempotent() {
    let fx = Fixture::new();
    let file_id = fx.store.seed_internal_file(T0).await;
    fx.files.save(file_id, b"package blob").unwrap();

    let first = fx
        .enqueue(NewJob::new(JobType::DeleteInternalFile, T0).aux(file_id))
        .await;
    let second = fx
        .enqueue(NewJob::new(JobType::DeleteInternalFile, T0).aux(file_id))
        .await;

    for job in [&first, &second] {
        let ctx = fx.ctx();
        assert_eq!(run_handler(&ctx, job).await.unwrap(), HandlerOutcome::Finished);
        let row = fx.store.job(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Done);
    }
    assert!(!fx.files.path_of(file_id).exists());
    assert!(!fx.store.internal_file_exists(file_id).await);
}

#[tokio::test]
async fn delete_problem_schedules_deletions_for_every_owned_file() {
    let fx = Fixture::new();
    let problem = fx.problem_with_package(3).await;
    let sub_file = fx.store.seed_internal_file(T0).await;
    fx.store
        .seed_submission(submission_row(10, problem.id, sub_file))
        .await;

    let job = fx
        .enqueue(NewJob::new(JobType::DeleteProblem, T0).aux(problem.id))
        .await;
    let ctx = fx.ctx();
    assert_eq!(run_handler(&ctx, &job).await.unwrap(), HandlerOutcome::Finished);

    let file_jobs = fx.store.jobs_of_type(JobType::DeleteInternalFile).await;
    let targeted: Vec<i64> = file_jobs.iter().filter_map(|j| j.aux_id).collect();
    assert!(targeted.contains(&problem.file_id));
    assert!(targeted.contains(&sub_file));
    assert!(!fx.store.problem_exists(problem.id).await);
    assert!(fx.store.all_submissions().await.is_empty());
    let row = fx.store.job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Done);
    assert!(row.log.contains("Deleted problem Simfile:"));
}

#[tokio::test]
async fn delete_problem_attached_to_a_contest_fails() {
    let fx = Fixture::new();
    let problem = fx.problem_with_package(3).await;
    fx.store.seed_contest(1, "Open Cup").await;
    fx.store
        .seed_contest_round(arbiter_server::store::memory::ContestRoundRow {
            id: 1,
            contest_id: 1,
            name: "Round 1".into(),
        })
        .await;
    fx.store
        .seed_contest_problem(arbiter_server::store::memory::ContestProblemRow {
            id: 1,
            contest_id: 1,
            contest_round_id: 1,
            problem_id: problem.id,
            name: "A".into(),
        })
        .await;

    let job = fx
        .enqueue(NewJob::new(JobType::DeleteProblem, T0).aux(problem.id))
        .await;
    let ctx = fx.ctx();
    let outcome = run_handler(&ctx, &job).await.unwrap();
    let HandlerOutcome::Failed(reason) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(reason.contains("contest problem"));
    assert!(fx.store.problem_exists(problem.id).await);
}

#[tokio::test]
async fn merge_problems_transfers_and_schedules_rejudges() {
    let fx = Fixture::new();
    let donor = fx.problem_with_package(3).await;
    let target = fx.problem_with_package(5).await;
    fx.store
        .seed_user(arbiter_server::store::UserBrief {
            id: 1,
            username: "alice".into(),
            kind: 2,
        })
        .await;

    // A package solution and two user submissions on the donor.
    let solution_file = fx.store.seed_internal_file(T0).await;
    let mut solution = submission_row(20, donor.id, solution_file);
    solution.kind = SubmissionKind::ProblemSolution;
    fx.store.seed_submission(solution).await;
    for (id, score) in [(21, 50), (22, 70)] {
        let file = fx.store.seed_internal_file(T0).await;
        let mut submission = submission_row(id, donor.id, file);
        submission.user_id = Some(1);
        submission.score = Some(score);
        submission.full_status = SubmissionStatus::Wa;
        fx.store.seed_submission(submission).await;
    }

    let job = fx
        .enqueue(
            NewJob::new(JobType::MergeProblems, T0)
                .aux(donor.id)
                .aux2(target.id),
        )
        .await;
    fx.store
        .set_merge_args(
            job.id,
            MergeProblemsArgs {
                donor_problem_id: donor.id,
                target_problem_id: target.id,
                rejudge_transferred_submissions: true,
            },
        )
        .await;

    let ctx = fx.ctx();
    assert_eq!(run_handler(&ctx, &job).await.unwrap(), HandlerOutcome::Finished);

    // Donor package and solution files are scheduled for deletion.
    let file_jobs = fx.store.jobs_of_type(JobType::DeleteInternalFile).await;
    let targeted: Vec<i64> = file_jobs.iter().filter_map(|j| j.aux_id).collect();
    assert!(targeted.contains(&donor.file_id));
    assert!(targeted.contains(&solution_file));

    // Rejudges for the transferred (non-solution) submissions only.
    let rejudges = fx.store.jobs_of_type(JobType::RejudgeSubmission).await;
    let mut rejudged: Vec<i64> = rejudges.iter().filter_map(|j| j.aux_id).collect();
    rejudged.sort();
    assert_eq!(rejudged, vec![21, 22]);

    // Submissions moved; the donor row is gone; finals recomputed.
    let submissions = fx.store.all_submissions().await;
    assert!(submissions.iter().all(|s| s.problem_id == target.id));
    assert!(submissions.iter().all(|s| s.kind == SubmissionKind::Normal));
    assert!(!fx.store.problem_exists(donor.id).await);
    let best = fx.store.submission(22).await.unwrap().unwrap();
    assert!(best.problem_final);
    let worse = fx.store.submission(21).await.unwrap().unwrap();
    assert!(!worse.problem_final);

    let row = fx.store.job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Done);
}

#[tokio::test]
async fn merge_users_keeps_the_stronger_account() {
    let fx = Fixture::new();
    fx.store
        .seed_user(arbiter_server::store::UserBrief {
            id: 1,
            username: "donor".into(),
            kind: 0, // admin
        })
        .await;
    fx.store
        .seed_user(arbiter_server::store::UserBrief {
            id: 2,
            username: "target".into(),
            kind: 2, // normal
        })
        .await;
    let problem = fx.problem_with_package(1).await;
    let file = fx.store.seed_internal_file(T0).await;
    let mut submission = submission_row(30, problem.id, file);
    submission.user_id = Some(1);
    submission.score = Some(90);
    fx.store.seed_submission(submission).await;

    let job = fx
        .enqueue(NewJob::new(JobType::MergeUsers, T0).aux(1).aux2(2))
        .await;
    let ctx = fx.ctx();
    assert_eq!(run_handler(&ctx, &job).await.unwrap(), HandlerOutcome::Finished);

    assert!(!fx.store.user_exists(1).await);
    let target = fx.store.user_brief(2).await.unwrap().unwrap();
    assert_eq!(target.kind, 0); // inherited the stronger type
    let moved = fx.store.submission(30).await.unwrap().unwrap();
    assert_eq!(moved.user_id, Some(2));
    assert!(moved.problem_final);
}

#[tokio::test]
async fn delete_user_schedules_file_deletions_and_cascades() {
    let fx = Fixture::new();
    fx.store
        .seed_user(arbiter_server::store::UserBrief {
            id: 9,
            username: "mallory".into(),
            kind: 2,
        })
        .await;
    let problem = fx.problem_with_package(1).await;
    let file = fx.store.seed_internal_file(T0).await;
    let mut submission = submission_row(50, problem.id, file);
    submission.user_id = Some(9);
    fx.store.seed_submission(submission).await;

    let job = fx.enqueue(NewJob::new(JobType::DeleteUser, T0).aux(9)).await;
    let ctx = fx.ctx();
    assert_eq!(run_handler(&ctx, &job).await.unwrap(), HandlerOutcome::Finished);

    assert!(!fx.store.user_exists(9).await);
    assert!(fx.store.all_submissions().await.is_empty());
    let targeted: Vec<i64> = fx
        .store
        .jobs_of_type(JobType::DeleteInternalFile)
        .await
        .iter()
        .filter_map(|j| j.aux_id)
        .collect();
    assert_eq!(targeted, vec![file]);
    let row = fx.store.job(job.id).await.unwrap().unwrap();
    assert!(row.log.contains("username: mallory"));
}

#[tokio::test]
async fn change_statement_rewrites_the_package() {
    let fx = Fixture::new();
    let problem = fx.problem_with_package(1).await;

    // Materialize the package directory for the problem's internal file.
    let pkg = fx.files.path_of(problem.file_id);
    for (rel, content) in [
        ("Simfile", problem.simfile.as_str()),
        ("doc/statement.pdf", "old statement"),
        ("check/checker.cpp", "int main() {}"),
        ("prog/model.cpp", "int main() {}"),
        ("tests/test1a.in", "1 2\n"),
        ("tests/test1a.out", "3\n"),
    ] {
        let path = pkg.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    // The uploaded replacement statement.
    let statement_file = fx.store.seed_internal_file(T0).await;
    fx.files.save(statement_file, b"new statement").unwrap();

    let job = fx
        .enqueue(
            NewJob::new(JobType::ChangeProblemStatement, T0)
                .aux(problem.id)
                .file(statement_file),
        )
        .await;
    fx.store
        .set_statement_args(
            job.id,
            ChangeStatementArgs {
                new_statement_file_id: statement_file,
                path_for_new_statement: "doc/v2.pdf".into(),
            },
        )
        .await;

    let ctx = fx.ctx();
    assert_eq!(run_handler(&ctx, &job).await.unwrap(), HandlerOutcome::Finished);

    let updated = fx.store.problem(problem.id).await.unwrap().unwrap();
    assert_ne!(updated.file_id, problem.file_id);
    assert!(updated.simfile.contains("statement: doc/v2.pdf"));

    let new_pkg = fx.files.path_of(updated.file_id);
    assert_eq!(
        std::fs::read(new_pkg.join("doc/v2.pdf")).unwrap(),
        b"new statement"
    );
    assert!(!new_pkg.join("doc/statement.pdf").exists());
    // Unchanged entries are byte-identical.
    assert_eq!(
        std::fs::read(new_pkg.join("tests/test1a.in")).unwrap(),
        std::fs::read(pkg.join("tests/test1a.in")).unwrap()
    );
    // The old package is freed asynchronously, not synchronously.
    assert!(pkg.exists());
    let targeted: Vec<i64> = fx
        .store
        .jobs_of_type(JobType::DeleteInternalFile)
        .await
        .iter()
        .filter_map(|j| j.aux_id)
        .collect();
    assert_eq!(targeted, vec![problem.file_id]);
}

#[tokio::test]
async fn judge_updates_recompute_final_flags() {
    let fx = Fixture::new();
    fx.store
        .seed_user(arbiter_server::store::UserBrief {
            id: 1,
            username: "alice".into(),
            kind: 2,
        })
        .await;
    let problem = fx.problem_with_package(1).await;
    for (id, score) in [(60, Some(40)), (61, None)] {
        let file = fx.store.seed_internal_file(T0).await;
        let mut submission = submission_row(id, problem.id, file);
        submission.user_id = Some(1);
        submission.score = score;
        fx.store.seed_submission(submission).await;
    }
    let job = fx
        .enqueue(NewJob::new(JobType::JudgeSubmission, T0).aux(61))
        .await;

    // Submission 61 gets judged to a better score than 60.
    fx.store
        .apply_judge_update(
            61,
            &JudgeUpdate {
                initial_status: SubmissionStatus::Ok,
                full_status: SubmissionStatus::Ok,
                score: Some(100),
                initial_report: "<table></table>".into(),
                final_report: "<table></table>".into(),
            },
            job.id,
            "judged\n",
            Some(JobStatus::Done),
        )
        .await
        .unwrap();

    let winner = fx.store.submission(61).await.unwrap().unwrap();
    assert!(winner.problem_final);
    assert_eq!(winner.score, Some(100));
    let loser = fx.store.submission(60).await.unwrap().unwrap();
    assert!(!loser.problem_final);
    let row = fx.store.job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Done);
    assert_eq!(row.log, "judged\n");
}

#[tokio::test]
async fn problem_row_fixture_parses_as_a_simfile() {
    // Keep the fixture manifest in sync with the parser.
    let problem = problem_row(1, 1);
    let simfile = arbiter_core::simfile::Simfile::parse(&problem.simfile).unwrap();
    assert_eq!(simfile.groups.len(), 1);
    assert_eq!(simfile.groups[0].points, 100);
}
