//! Supervision of an external encoder process.

use super::EncodeError;
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Number of diagnostic stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// What a successful run left behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    /// Last diagnostic lines written to stderr.
    pub stderr_tail: String,
}

/// Run `cmd` to completion.
///
/// Every stderr line is passed to `on_line`; lines for which it returns
/// `true` are treated as progress and left out of the error tail. The child
/// is killed when `cancel` fires or `deadline` elapses, and when the future
/// is dropped.
pub async fn run_process<F>(
    mut cmd: Command,
    deadline: Option<Duration>,
    cancel: CancellationToken,
    mut on_line: F,
) -> Result<ProcessOutput, EncodeError>
where
    F: FnMut(&str) -> bool + Send,
{
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;
    let mut segments = child
        .stderr
        .take()
        .map(|stderr| BufReader::new(stderr).split(b'\n'));
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    let limit = deadline.unwrap_or_default();
    let expired = async {
        match deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expired);

    loop {
        let segment = async {
            match segments.as_mut() {
                Some(segments) => segments.next_segment().await.ok().flatten(),
                None => None,
            }
        };

        tokio::select! {
            segment = segment => {
                let Some(bytes) = segment else { break };
                let text = String::from_utf8_lossy(&bytes);
                // Stats lines are separated by carriage returns
                for line in text.split('\r').map(str::trim).filter(|l| !l.is_empty()) {
                    if !on_line(line) {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.to_string());
                    }
                }
            }
            _ = cancel.cancelled() => {
                kill(&mut child).await;
                return Err(EncodeError::Cancelled);
            }
            _ = &mut expired => {
                kill(&mut child).await;
                return Err(EncodeError::Timeout(limit));
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            kill(&mut child).await;
            return Err(EncodeError::Cancelled);
        }
        _ = &mut expired => {
            kill(&mut child).await;
            return Err(EncodeError::Timeout(limit));
        }
    };

    let stderr_tail = tail.into_iter().collect::<Vec<_>>().join("\n");
    if status.success() {
        Ok(ProcessOutput { stderr_tail })
    } else {
        match status.code() {
            Some(code) => Err(EncodeError::Failed {
                code,
                stderr: stderr_tail,
            }),
            None => Err(EncodeError::Terminated {
                stderr: stderr_tail,
            }),
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Failed to kill encoder process");
    }
}
