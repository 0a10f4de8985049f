//! Concurrent log and pipe tailing.
//!
//! Tailers run as background tasks and stream output lines to the caller's
//! sink while a job executes. All tailers belonging to one job share a single
//! cancellation token, signaled exactly once when the job is known complete.

use std::path::PathBuf;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::job::PrintCallback;

/// Backoff while waiting for a watched file to be created.
const CREATE_BACKOFF: Duration = Duration::from_millis(10);

/// Poll interval for newly appended file content.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stream a live pipe line by line into the sink until EOF or cancellation.
pub async fn tail_pipe<R>(reader: R, sink: PrintCallback, token: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => sink(&line),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "pipe tail ended on read error");
                    break;
                }
            }
        }
    }
}

/// Watch a file that may not exist yet and stream newly appended lines into
/// the sink until cancelled.
///
/// Waits for the file to be created (short fixed backoff), then polls for
/// appended content on a short fixed interval. On cancellation any content
/// that arrived since the last poll is drained before the task exits, so no
/// line written before completion is lost.
pub async fn tail_file(path: PathBuf, sink: PrintCallback, token: CancellationToken) {
    loop {
        if fs::metadata(&path).await.is_ok() {
            break;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(CREATE_BACKOFF) => {}
        }
    }

    let mut offset = 0usize;
    let mut pending = String::new();
    loop {
        emit_new(&path, &mut offset, &mut pending, &sink).await;
        tokio::select! {
            _ = token.cancelled() => {
                emit_new(&path, &mut offset, &mut pending, &sink).await;
                if !pending.is_empty() {
                    sink(&pending);
                }
                return;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

/// Read content appended since the last call and emit every complete line.
async fn emit_new(path: &PathBuf, offset: &mut usize, pending: &mut String, sink: &PrintCallback) {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "file tail read failed");
            return;
        }
    };
    if data.len() <= *offset {
        return;
    }
    pending.push_str(&String::from_utf8_lossy(&data[*offset..]));
    *offset = data.len();

    while let Some(newline) = pending.find('\n') {
        let line: String = pending.drain(..=newline).collect();
        sink(line.trim_end_matches('\n'));
    }
}
