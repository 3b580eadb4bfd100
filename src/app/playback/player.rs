use std::io;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;

use crate::app::catalog::Subtitle;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StartRequest {
    pub(crate) url: String,
    pub(crate) title: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) referer: Option<String>,
    pub(crate) start_offset: f64,
    pub(crate) audio_index: Option<u32>,
    pub(crate) subtitle: Option<Subtitle>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct StatusReport {
    pub(crate) current_time: f64,
    pub(crate) duration: f64,
    pub(crate) eof: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum StatusError {
    #[error("status query timed out")]
    DeadlineExceeded,
    #[error("player not initialized")]
    NotInitialized,
    /// Named pipe or socket handle closed underneath us.
    #[error("player IPC pipe closed: {0}")]
    PipeClosed(String),
    #[error("player IPC unreachable: {0}")]
    Disconnected(String),
    #[error("player IPC error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureClass {
    Transient,
    Fatal,
    PlatformFatal,
}

impl FailureClass {
    pub(crate) fn ends_session(self) -> bool {
        !matches!(self, Self::Transient)
    }
}

impl StatusError {
    /// First matching rule wins. Unrecognized failures stay transient so a
    /// flaky IPC read never ends a session on its own.
    pub(crate) fn classify(&self, since_launch: Duration, grace: Duration) -> FailureClass {
        match self {
            Self::DeadlineExceeded => FailureClass::Transient,
            Self::NotInitialized if since_launch < grace => FailureClass::Transient,
            Self::PipeClosed(_) => FailureClass::PlatformFatal,
            Self::Disconnected(_) => FailureClass::Fatal,
            Self::NotInitialized | Self::Other(_) => FailureClass::Transient,
        }
    }

    pub(crate) fn from_io(err: &io::Error) -> Self {
        if let Some(closed) = platform_pipe_closed(err) {
            return closed;
        }
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::DeadlineExceeded,
            io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => {
                Self::PipeClosed(err.to_string())
            }
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotFound
            | io::ErrorKind::NotConnected => Self::Disconnected(err.to_string()),
            _ => Self::Other(err.to_string()),
        }
    }
}

#[cfg(windows)]
fn platform_pipe_closed(err: &io::Error) -> Option<StatusError> {
    const ERROR_INVALID_HANDLE: i32 = 6;
    const ERROR_BROKEN_PIPE: i32 = 109;
    const ERROR_NO_DATA: i32 = 232;
    const ERROR_PIPE_NOT_CONNECTED: i32 = 233;

    match err.raw_os_error()? {
        ERROR_INVALID_HANDLE | ERROR_BROKEN_PIPE | ERROR_NO_DATA | ERROR_PIPE_NOT_CONNECTED => {
            Some(StatusError::PipeClosed(err.to_string()))
        }
        _ => None,
    }
}

#[cfg(not(windows))]
fn platform_pipe_closed(err: &io::Error) -> Option<StatusError> {
    // EBADF: the socket fd was torn down while a query was in flight.
    (err.raw_os_error() == Some(libc::EBADF)).then(|| StatusError::PipeClosed(err.to_string()))
}

/// Control surface of an external player process.
pub(crate) trait PlayerControl: Send + Sync {
    /// Spawns playback and returns once the request is sent.
    fn start(&self, request: &StartRequest) -> Result<()>;
    /// Whether the player is reporting a playback position yet.
    fn is_playing(&self, timeout: Duration) -> bool;
    fn query_status(&self, timeout: Duration) -> Result<StatusReport, StatusError>;
    fn stop(&self) -> Result<()>;
}
