//! Shared fixtures: a memory store, a tempdir-backed file store and a
//! handler context wired together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arbiter_core::compile::SolutionLanguage;
use arbiter_server::config::RuntimeConfig;
use arbiter_server::files::FileStore;
use arbiter_server::handlers::HandlerCtx;
use arbiter_server::jobs::{JobRow, NewJob};
use arbiter_server::logger::JobLog;
use arbiter_server::store::memory::MemoryStore;
use arbiter_server::store::{ProblemRow, Store};
use arbiter_server::submissions::{SubmissionKind, SubmissionRow, SubmissionStatus};
use tempfile::TempDir;

pub const T0: &str = "2026-01-01 10:00:00";
pub const T1: &str = "2026-01-01 11:00:00";

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub files: Arc<FileStore>,
    pub config: Arc<RuntimeConfig>,
    _tmp: TempDir,
}

impl Fixture {
    pub fn new() -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let files = Arc::new(FileStore::new(tmp.path()).expect("file store"));
        let config = Arc::new(RuntimeConfig {
            job_server_workers: 2,
            data_dir: PathBuf::from(tmp.path()),
            proot_path: None,
            compile_time_limit_secs: 30,
        });
        Fixture {
            store: Arc::new(MemoryStore::new()),
            files,
            config,
            _tmp: tmp,
        }
    }

    pub fn store_dyn(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn ctx(&self) -> HandlerCtx {
        HandlerCtx {
            store: self.store_dyn(),
            files: self.files.clone(),
            config: self.config.clone(),
            log: JobLog::new(),
        }
    }

    pub async fn enqueue(&self, job: NewJob) -> JobRow {
        let id = self.store.enqueue(job).await.expect("enqueue");
        self.store.job(id).await.expect("job").expect("job exists")
    }

    pub async fn problem_with_package(&self, problem_id: i64) -> ProblemRow {
        let file_id = self.store.seed_internal_file(T0).await;
        let problem = problem_row(problem_id, file_id);
        self.store.seed_problem(problem.clone()).await;
        problem
    }
}

pub fn problem_row(id: i64, file_id: i64) -> ProblemRow {
    ProblemRow {
        id,
        file_id,
        simfile: format!(
            "name: Problem {id}\nlabel: p{id}\nstatement: doc/statement.pdf\n\
             checker: check/checker.cpp\nmemory_limit: 64\n\
             solutions: [prog/model.cpp]\nlimits: [\n        test1a 1.00\n]\n\
             scoring: [\n        1 100\n]\n"
        ),
        name: format!("Problem {id}"),
        label: format!("p{id}"),
        owner_id: None,
        created_at: T0.to_string(),
        updated_at: T0.to_string(),
    }
}

pub fn submission_row(id: i64, problem_id: i64, file_id: i64) -> SubmissionRow {
    SubmissionRow {
        id,
        created_at: T0.to_string(),
        file_id,
        user_id: None,
        problem_id,
        contest_problem_id: None,
        contest_round_id: None,
        contest_id: None,
        kind: SubmissionKind::Normal,
        language: SolutionLanguage::Cpp,
        initial_status: SubmissionStatus::Pending,
        full_status: SubmissionStatus::Pending,
        score: None,
        last_judgment_began_at: None,
        initial_report: String::new(),
        final_report: String::new(),
        problem_final: false,
        contest_problem_final: false,
        contest_problem_initial_final: false,
    }
}

/// Polls the job table until `done` accepts it or a timeout elapses.
pub async fn wait_for_jobs<F>(store: &MemoryStore, what: &str, mut done: F)
where
    F: FnMut(&[JobRow]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let jobs = store.all_jobs().await;
        if done(&jobs) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what} (jobs: {jobs:?})");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
