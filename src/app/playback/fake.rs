use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};

use super::{PlayerControl, StartRequest, StatusError, StatusReport};

/// Scripted player: statuses are handed out in order, then queries time out.
#[derive(Default)]
pub(crate) struct FakePlayer {
    starts: Mutex<Vec<StartRequest>>,
    statuses: Mutex<VecDeque<Result<StatusReport, StatusError>>>,
    stops: AtomicUsize,
    queries: AtomicUsize,
    playing: AtomicBool,
    fail_start: AtomicBool,
}

impl FakePlayer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub(crate) fn push_status(&self, result: Result<StatusReport, StatusError>) {
        self.statuses.lock().expect("lock statuses").push_back(result);
    }

    pub(crate) fn push_position(&self, current_time: f64, duration: f64, eof: bool) {
        self.push_status(Ok(StatusReport {
            current_time,
            duration,
            eof,
        }));
    }

    pub(crate) fn starts(&self) -> Vec<StartRequest> {
        self.starts.lock().expect("lock starts").clone()
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl PlayerControl for FakePlayer {
    fn start(&self, request: &StartRequest) -> Result<()> {
        if self.fail_start.swap(false, Ordering::SeqCst) {
            bail!("No such file or directory (os error 2)");
        }
        self.starts
            .lock()
            .expect("lock starts")
            .push(request.clone());
        Ok(())
    }

    fn is_playing(&self, _timeout: Duration) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn query_status(&self, _timeout: Duration) -> Result<StatusReport, StatusError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .expect("lock statuses")
            .pop_front()
            .unwrap_or(Err(StatusError::DeadlineExceeded))
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }
}
