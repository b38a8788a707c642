//! External programs run under a deadline.
//!
//! A fallback tier that misses its deadline is abandoned by the chain, so the
//! child it started has to be killed here or it would outlive the turn.

use std::io::{self, Read};
use std::process::{Child, Command, Output};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(10);

/// Like [`Command::output`], but kills the child once `timeout` has passed.
///
/// A killed child is reported as an error of kind [`io::ErrorKind::TimedOut`].
pub fn output_with_deadline(command: &mut Command, timeout: Duration) -> io::Result<Output> {
    let mut child = command.spawn()?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                kill(&mut child);
                // readers finish on their own once every writer of the pipe is gone
                drop((stdout, stderr));
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("killed after {} ms", timeout.as_millis()),
                ));
            }
            Ok(None) => thread::sleep(POLL),
            Err(e) => {
                kill(&mut child);
                return Err(e);
            }
        }
    };

    Ok(Output {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!(pid = child.id(), error = %e, "kill failed, child already gone");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = child.id(), error = %e, "failed to reap killed child");
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            tracing::debug!(error = %e, "child pipe read failed");
        }
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match reader.map(JoinHandle::join) {
        Some(Ok(buf)) => buf,
        Some(Err(_)) => {
            tracing::error!("child pipe reader panicked");
            Vec::new()
        }
        None => Vec::new(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[test]
    fn test_collects_output_of_finished_child() {
        let output = output_with_deadline(
            Command::new("sh")
                .args(["-c", "printf hello; printf oops >&2"])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped()),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello");
        assert_eq!(output.stderr, b"oops");
    }

    #[test]
    fn test_overdue_child_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 2; touch '{}'", marker.display());

        let started = Instant::now();
        let err = output_with_deadline(
            Command::new("sh").args(["-c", &script]).stdout(Stdio::piped()),
            Duration::from_millis(200),
        )
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(2500));
        assert!(!marker.exists(), "killed child kept running");
    }
}
