//! The per-job log buffer.
//!
//! Handlers append human-readable progress lines; every line is mirrored to
//! `tracing` immediately, and the whole buffer is flushed into the job
//! row's `log` column at checkpoints. The buffer is cheap to clone and safe
//! to write from the blocking judge thread.

use std::sync::{Arc, Mutex};

use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct JobLog {
    buf: Arc<Mutex<String>>,
}

impl JobLog {
    pub fn new() -> JobLog {
        JobLog::default()
    }

    pub fn line(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        info!(target: "job", "{msg}");
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.push_str(msg);
        buf.push('\n');
    }

    pub fn snapshot(&self) -> String {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl arbiter_core::judge::JudgeLog for JobLog {
    fn line(&mut self, msg: &str) {
        JobLog::line(self, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_accumulate_newline_terminated() {
        let log = JobLog::new();
        log.line("Loading problem package...");
        log.line("... done.");
        assert_eq!(log.snapshot(), "Loading problem package...\n... done.\n");
    }

    #[test]
    fn clones_share_the_buffer() {
        let log = JobLog::new();
        let clone = log.clone();
        clone.line("from the blocking thread");
        assert!(log.snapshot().contains("blocking thread"));
    }
}
