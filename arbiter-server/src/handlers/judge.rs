//! JUDGE_SUBMISSION / REJUDGE_SUBMISSION.
//!
//! The judge worker is synchronous, so the heavy part runs under
//! `spawn_blocking` and streams partial reports back over a channel; every
//! received report becomes a submission update so clients can watch
//! progress. The terminal DONE status is written together with the last
//! update in one transaction.

use anyhow::Result;
use tokio::sync::mpsc;

use arbiter_core::compile::{CompileError, CompileOptions};
use arbiter_core::judge::{JudgeReport, JudgeWorker};

use crate::config::utc_datetime;
use crate::jobs::{JobRow, JobStatus};
use crate::store::JudgeUpdate;
use crate::submissions::{status_of_report, SubmissionStatus};

use super::{aux_of, HandlerCtx, HandlerOutcome};

enum JudgeEvent {
    /// A (possibly partial) report of the initial or the final phase.
    Report { final_phase: bool, report: JudgeReport },
}

enum JudgeOutcome {
    CompilationError(String),
    CheckerCompilationError(String),
    Judged,
}

pub async fn judge_submission(ctx: &HandlerCtx, job: &JobRow) -> Result<HandlerOutcome> {
    let submission_id = aux_of(job)?;

    let Some(jc) = ctx.store.judge_context(job.id, submission_id).await? else {
        return Ok(HandlerOutcome::Cancelled("Submission has been deleted.".into()));
    };
    if let Some(began_at) = &jc.last_judgment_began_at {
        if *began_at > jc.job_created_at {
            return Ok(HandlerOutcome::Cancelled(
                "Skipping judging of the submission because it has already been judged after \
                 this job was scheduled."
                    .into(),
            ));
        }
    }
    ctx.store
        .begin_judgment(submission_id, &utc_datetime())
        .await?;
    ctx.log.line(format!(
        "Judging submission {submission_id} (problem: {})",
        jc.problem_id
    ));

    let package_path = ctx.files.path_of(jc.problem_file_id);
    let solution_path = ctx.files.path_of(jc.submission_file_id);
    let language = jc.language;
    let compile_options = CompileOptions {
        time_limit: ctx.config.compile_time_limit(),
        proot_path: ctx.config.proot_path.clone(),
        ..CompileOptions::default()
    };
    let log = ctx.log.clone();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let worker = tokio::task::spawn_blocking(move || -> Result<JudgeOutcome> {
        let mut log = log;
        log.line("Loading problem package...");
        let mut judge_worker = JudgeWorker::load_package(&package_path, None)?;
        judge_worker.set_compile_options(compile_options);
        log.line("... done.");

        log.line("Compiling solution...");
        match judge_worker.compile_solution(&solution_path, language) {
            Ok(()) => log.line("... done."),
            Err(CompileError::Failed { diagnostics }) => {
                log.line(format!("... failed:\n{diagnostics}"));
                return Ok(JudgeOutcome::CompilationError(diagnostics));
            }
            Err(e) => return Err(e.into()),
        }

        log.line("Compiling checker...");
        match judge_worker.compile_checker() {
            Ok(()) => log.line("... done."),
            Err(CompileError::Failed { diagnostics }) => {
                log.line(format!("... failed:\n{diagnostics}"));
                return Ok(JudgeOutcome::CheckerCompilationError(diagnostics));
            }
            Err(e) => return Err(e.into()),
        }

        for final_phase in [false, true] {
            let tx = events_tx.clone();
            let report = judge_worker.judge(final_phase, &mut log, &mut |partial| {
                let _ = tx.send(JudgeEvent::Report {
                    final_phase,
                    report: partial.clone(),
                });
            })?;
            let _ = events_tx.send(JudgeEvent::Report {
                final_phase,
                report,
            });
        }
        Ok(JudgeOutcome::Judged)
    });

    // Apply each streamed report; the worker keeps running meanwhile.
    let mut initial_status = SubmissionStatus::Pending;
    let mut initial_report_html = String::new();
    let mut last_update: Option<JudgeUpdate> = None;
    while let Some(JudgeEvent::Report { final_phase, report }) = events_rx.recv().await {
        let update = if !final_phase {
            initial_status = status_of_report(&report);
            initial_report_html = render_report_html(&report);
            JudgeUpdate {
                initial_status,
                full_status: if initial_status != SubmissionStatus::Ok {
                    initial_status
                } else {
                    SubmissionStatus::Pending
                },
                score: None,
                initial_report: initial_report_html.clone(),
                final_report: String::new(),
            }
        } else {
            JudgeUpdate {
                initial_status,
                full_status: status_of_report(&report),
                score: Some(report.total_score()),
                initial_report: initial_report_html.clone(),
                final_report: render_report_html(&report),
            }
        };
        ctx.store
            .apply_judge_update(submission_id, &update, job.id, &ctx.log.snapshot(), None)
            .await?;
        last_update = Some(update);
    }

    let final_update = match worker.await?? {
        JudgeOutcome::CompilationError(diagnostics) => JudgeUpdate {
            initial_status: SubmissionStatus::CompilationError,
            full_status: SubmissionStatus::CompilationError,
            score: None,
            initial_report: format!(
                "<pre class=\"compilation-errors\">{}</pre>",
                html_escape(&diagnostics)
            ),
            final_report: String::new(),
        },
        JudgeOutcome::CheckerCompilationError(_) => JudgeUpdate {
            initial_status: SubmissionStatus::CheckerCompilationError,
            full_status: SubmissionStatus::CheckerCompilationError,
            score: None,
            initial_report: String::new(),
            final_report: String::new(),
        },
        JudgeOutcome::Judged => match last_update {
            Some(update) => update,
            // No groups at all; an empty report still judges to OK.
            None => JudgeUpdate {
                initial_status: SubmissionStatus::Ok,
                full_status: SubmissionStatus::Ok,
                score: Some(0),
                initial_report: String::new(),
                final_report: String::new(),
            },
        },
    };
    ctx.store
        .apply_judge_update(
            submission_id,
            &final_update,
            job.id,
            &ctx.log.snapshot(),
            Some(JobStatus::Done),
        )
        .await?;
    Ok(HandlerOutcome::Finished)
}

pub(crate) fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Renders the submission-facing report table plus the per-test comments.
pub(crate) fn render_report_html(report: &JudgeReport) -> String {
    use std::fmt::Write;

    if report.groups.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    out.push_str(
        "<table class=\"table\"><thead><tr><th class=\"test\">Test</th>\
         <th class=\"result\">Result</th><th class=\"time\">Time [s]</th>\
         <th class=\"memory\">Memory [KiB]</th><th class=\"points\">Score</th></tr></thead>\
         <tbody>",
    );
    let mut there_are_comments = false;
    for group in &report.groups {
        let mut first = true;
        for test in &group.tests {
            let _ = write!(
                out,
                "<tr><td>{}</td><td class=\"status\">{}</td><td>{:.2} / {:.2}</td>\
                 <td>{} / {}</td>",
                html_escape(&test.name),
                test.status.label(),
                test.runtime.as_secs_f64(),
                test.time_limit.as_secs_f64(),
                test.memory_consumed >> 10,
                test.memory_limit >> 10,
            );
            if first {
                first = false;
                let _ = write!(
                    out,
                    "<td class=\"groupscore\" rowspan=\"{}\">{} / {}</td>",
                    group.tests.len(),
                    group.score,
                    group.max_score,
                );
            }
            out.push_str("</tr>");
            if !test.comment.is_empty() {
                there_are_comments = true;
            }
        }
    }
    out.push_str("</tbody></table>");

    if there_are_comments {
        out.push_str("<ul class=\"tests-comments\">");
        for group in &report.groups {
            for test in &group.tests {
                if !test.comment.is_empty() {
                    let _ = write!(
                        out,
                        "<li><span class=\"test-id\">{}</span>{}</li>",
                        html_escape(&test.name),
                        html_escape(&test.comment),
                    );
                }
            }
        }
        out.push_str("</ul>");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::judge::{GroupReport, TestReport, TestStatus};
    use std::time::Duration;

    #[test]
    fn escaping_covers_markup_characters() {
        assert_eq!(
            html_escape("a < b && \"c\""),
            "a &lt; b &amp;&amp; &quot;c&quot;"
        );
    }

    #[test]
    fn report_html_contains_tests_scores_and_comments() {
        let report = JudgeReport {
            groups: vec![GroupReport {
                score: 60,
                max_score: 100,
                tests: vec![
                    TestReport {
                        name: "sum1a".into(),
                        status: TestStatus::Ok,
                        runtime: Duration::from_millis(120),
                        time_limit: Duration::from_secs(1),
                        memory_consumed: 2 << 20,
                        memory_limit: 64 << 20,
                        comment: String::new(),
                    },
                    TestReport {
                        name: "sum1b".into(),
                        status: TestStatus::Wa,
                        runtime: Duration::from_millis(80),
                        time_limit: Duration::from_secs(1),
                        memory_consumed: 2 << 20,
                        memory_limit: 64 << 20,
                        comment: "wrong at token 2".into(),
                    },
                ],
            }],
        };
        let html = render_report_html(&report);
        assert!(html.contains("sum1a"));
        assert!(html.contains("60 / 100"));
        assert!(html.contains("Wrong answer"));
        assert!(html.contains("wrong at token 2"));
        assert!(html.contains("rowspan=\"2\""));
        assert_eq!(render_report_html(&JudgeReport { groups: vec![] }), "");
    }
}
