use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use super::{FailureClass, PlayerControl, ProgressSnapshot, StatusError, StatusReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollRequest {
    LaunchProbe { generation: u64 },
    Status { generation: u64 },
}

/// Worker result posted back to the session loop. `generation` identifies the
/// session that issued the query so stale replies can be dropped.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PollerMessage {
    LaunchProbe {
        generation: u64,
        playing: bool,
    },
    Status {
        generation: u64,
        result: Result<StatusReport, StatusError>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PollVerdict {
    Snapshot(ProgressSnapshot),
    Ignore(StatusError),
    Fatal(StatusError, FailureClass),
}

pub(crate) fn judge_poll_result(
    result: Result<StatusReport, StatusError>,
    since_launch: Duration,
    grace: Duration,
) -> PollVerdict {
    match result {
        Ok(report) => PollVerdict::Snapshot(ProgressSnapshot::new(
            report.current_time,
            report.duration,
            report.eof,
        )),
        Err(err) => {
            let class = err.classify(since_launch, grace);
            if class.ends_session() {
                PollVerdict::Fatal(err, class)
            } else {
                PollVerdict::Ignore(err)
            }
        }
    }
}

/// Fires player queries without blocking the caller. Each query runs on its
/// own thread with its own timeout; the reply arrives on the session channel.
pub(crate) struct ProgressPoller {
    player: Arc<dyn PlayerControl>,
    tx: mpsc::Sender<PollerMessage>,
    query_timeout: Duration,
}

impl ProgressPoller {
    pub(crate) fn new(
        player: Arc<dyn PlayerControl>,
        tx: mpsc::Sender<PollerMessage>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            player,
            tx,
            query_timeout,
        }
    }

    pub(crate) fn dispatch(&self, request: PollRequest) {
        let player = Arc::clone(&self.player);
        let tx = self.tx.clone();
        let timeout = self.query_timeout;
        std::thread::spawn(move || {
            let message = match request {
                PollRequest::LaunchProbe { generation } => PollerMessage::LaunchProbe {
                    generation,
                    playing: player.is_playing(timeout),
                },
                PollRequest::Status { generation } => PollerMessage::Status {
                    generation,
                    result: player.query_status(timeout),
                },
            };
            // The session loop may already be gone; late replies are dropped.
            let _ = tx.send(message);
        });
    }
}
