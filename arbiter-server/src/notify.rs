//! The notify file: a file-based wakeup channel between job producers and
//! the dispatcher.
//!
//! Producers truncate/touch `var/job_server.notify` after committing an
//! insert into the jobs table; the contents are irrelevant. The dispatcher
//! holds an inotify watch on the file and treats any modification as "scan
//! for new jobs".

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Signals the job server that new jobs may be available.
pub fn notify_job_server(notify_path: &Path) -> io::Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(notify_path)
        .map(|_| ())
}

/// Starts watching the notify file. Returns a channel that yields one unit
/// per observed modification; the watcher thread lives until the receiver
/// is dropped.
pub fn watch(notify_path: PathBuf) -> anyhow::Result<mpsc::UnboundedReceiver<()>> {
    // Make sure the file exists before the watch is registered.
    notify_job_server(&notify_path)
        .with_context(|| format!("failed to create {}", notify_path.display()))?;

    let inotify = Inotify::init(InitFlags::empty()).context("inotify_init()")?;
    inotify
        .add_watch(
            &notify_path,
            AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_ATTRIB | AddWatchFlags::IN_CLOSE_WRITE,
        )
        .with_context(|| format!("failed to watch {}", notify_path.display()))?;

    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("notify-watcher".into())
        .spawn(move || loop {
            match inotify.read_events() {
                Ok(events) => {
                    debug!(count = events.len(), "notify file touched");
                    if tx.send(()).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("notify watcher stopped: {e}");
                    return;
                }
            }
        })
        .context("failed to spawn the notify watcher thread")?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_creates_and_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("job_server.notify");
        notify_job_server(&path).unwrap();
        assert!(path.exists());
        std::fs::write(&path, b"leftover").unwrap();
        notify_job_server(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn watcher_wakes_on_touch() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("job_server.notify");
        let mut rx = watch(path.clone()).unwrap();
        notify_job_server(&path).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher did not wake")
            .expect("watcher channel closed");
    }
}
