use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use super::process::{detach_process_group, reap_in_background};
use super::{PlayerControl, StartRequest, StatusError, StatusReport};

const QUIT_TIMEOUT: Duration = Duration::from_millis(500);
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// External mpv process driven over its JSON IPC socket (a named pipe on
/// Windows). Every query opens a fresh connection, so a hung reply can only
/// ever stall the worker thread that issued it.
pub(crate) struct MpvPlayer {
    bin: PathBuf,
    ipc_path: PathBuf,
    child: Mutex<Option<Child>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    next_request_id: AtomicU64,
}

impl MpvPlayer {
    pub(crate) fn new(bin: PathBuf, ipc_path: PathBuf) -> Self {
        Self {
            bin,
            ipc_path,
            child: Mutex::new(None),
            reaper: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        }
    }

    fn lock_child(&self) -> std::sync::MutexGuard<'_, Option<Child>> {
        self.child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn child_running(&self) -> bool {
        let mut guard = self.lock_child();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn request(
        &self,
        conn: &mut IpcConnection,
        command: Value,
        deadline: Instant,
    ) -> Result<Value, StatusError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut line = json!({ "command": command, "request_id": request_id }).to_string();
        line.push('\n');
        conn.send(line.as_bytes())
            .map_err(|err| StatusError::from_io(&err))?;

        loop {
            if Instant::now() >= deadline {
                return Err(StatusError::DeadlineExceeded);
            }
            let reply = conn.read_line().map_err(|err| StatusError::from_io(&err))?;
            let Ok(parsed) = serde_json::from_str::<Value>(&reply) else {
                return Err(StatusError::Other(format!("malformed IPC reply: {reply}")));
            };
            // Async events share the socket with replies.
            if parsed.get("request_id").and_then(Value::as_u64) == Some(request_id) {
                return property_from_reply(&parsed);
            }
        }
    }

    fn get_property(
        &self,
        conn: &mut IpcConnection,
        name: &str,
        deadline: Instant,
    ) -> Result<Value, StatusError> {
        self.request(conn, json!(["get_property", name]), deadline)
    }

    fn lock_reaper(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks until a previously stopped player has been reaped.
    fn wait_for_reaper(&self) {
        let handle = self.lock_reaper().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            log::warn!("player reaper thread panicked");
        }
    }

    fn remove_socket(&self) {
        if cfg!(unix)
            && let Err(err) = fs::remove_file(&self.ipc_path)
            && err.kind() != io::ErrorKind::NotFound
        {
            log::debug!("failed to remove {}: {err}", self.ipc_path.display());
        }
    }
}

pub(crate) fn mpv_args(ipc_path: &Path, request: &StartRequest) -> Vec<String> {
    let mut args = vec![
        format!("--input-ipc-server={}", ipc_path.display()),
        "--force-window=immediate".to_string(),
        "--keep-open=yes".to_string(),
        "--idle=no".to_string(),
        format!("--force-media-title={}", request.title),
    ];
    if request.start_offset > 0.0 {
        args.push(format!("--start={:.3}", request.start_offset));
    }
    if let Some(index) = request.audio_index {
        // mpv track ids are 1-based.
        args.push(format!("--aid={}", index + 1));
    }
    if let Some(subtitle) = &request.subtitle {
        args.push(format!("--sub-file={}", subtitle.url));
    }
    if let Some(referer) = request.referer.as_deref().filter(|r| !r.is_empty()) {
        args.push(format!("--referrer={referer}"));
    }
    for (name, value) in &request.headers {
        args.push(format!("--http-header-fields-append={name}: {value}"));
    }
    args.push("--".to_string());
    args.push(request.url.clone());
    args
}

/// Fire-and-forget `quit`; the reaper escalates if it is not honoured.
fn send_quit(ipc_path: &Path, request_id: u64) {
    let mut line = json!({ "command": ["quit"], "request_id": request_id }).to_string();
    line.push('\n');
    let sent = IpcConnection::open(ipc_path, QUIT_TIMEOUT)
        .and_then(|mut conn| conn.send(line.as_bytes()));
    if let Err(err) = sent {
        log::debug!("mpv quit command not delivered: {err}");
    }
}

fn property_from_reply(reply: &Value) -> Result<Value, StatusError> {
    match reply.get("error").and_then(Value::as_str) {
        Some("success") => Ok(reply.get("data").cloned().unwrap_or(Value::Null)),
        Some("property unavailable") => Err(StatusError::NotInitialized),
        Some(other) => Err(StatusError::Other(other.to_string())),
        None => Err(StatusError::Other("IPC reply without status".to_string())),
    }
}

fn as_seconds(value: &Value) -> Result<f64, StatusError> {
    value.as_f64().ok_or(StatusError::NotInitialized)
}

impl PlayerControl for MpvPlayer {
    fn start(&self, request: &StartRequest) -> Result<()> {
        // The old instance must be gone before its socket path is reused.
        self.wait_for_reaper();
        let mut guard = self.lock_child();
        if let Some(mut previous) = guard.take() {
            log::warn!("replacing a player that was still running");
            let _ = previous.kill();
            let _ = previous.wait();
        }
        self.remove_socket();

        let mut cmd = Command::new(&self.bin);
        cmd.args(mpv_args(&self.ipc_path, request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach_process_group(&mut cmd);

        log::info!("launching {} for {}", self.bin.display(), request.title);
        log::debug!("stream url: {}", request.url);
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.bin.display()))?;
        *guard = Some(child);
        Ok(())
    }

    fn is_playing(&self, timeout: Duration) -> bool {
        if !self.child_running() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let Ok(mut conn) = IpcConnection::open(&self.ipc_path, timeout) else {
            return false;
        };
        self.get_property(&mut conn, "time-pos", deadline)
            .is_ok_and(|value| value.as_f64().is_some())
    }

    fn query_status(&self, timeout: Duration) -> Result<StatusReport, StatusError> {
        let deadline = Instant::now() + timeout;
        let mut conn = IpcConnection::open(&self.ipc_path, timeout)
            .map_err(|err| StatusError::from_io(&err))?;

        let current_time = as_seconds(&self.get_property(&mut conn, "time-pos", deadline)?)?;
        let duration = as_seconds(&self.get_property(&mut conn, "duration", deadline)?)?;
        let eof = match self.get_property(&mut conn, "eof-reached", deadline) {
            Ok(value) => value.as_bool().unwrap_or(false),
            Err(StatusError::NotInitialized) => false,
            Err(err) => return Err(err),
        };
        Ok(StatusReport {
            current_time,
            duration,
            eof,
        })
    }

    /// Returns immediately; quitting, termination and reaping happen on a
    /// worker thread.
    fn stop(&self) -> Result<()> {
        let Some(child) = self.lock_child().take() else {
            return Ok(());
        };
        let ipc_path = self.ipc_path.clone();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let handle = reap_in_background(child, EXIT_GRACE, move || {
            send_quit(&ipc_path, request_id);
        });
        *self.lock_reaper() = Some(handle);
        Ok(())
    }
}

impl Drop for MpvPlayer {
    fn drop(&mut self) {
        if let Some(mut child) = self.lock_child().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.wait_for_reaper();
        self.remove_socket();
    }
}

struct IpcConnection {
    reader: BufReader<IpcStream>,
}

#[cfg(unix)]
type IpcStream = std::os::unix::net::UnixStream;

#[cfg(not(unix))]
type IpcStream = fs::File;

impl IpcConnection {
    #[cfg(unix)]
    fn open(path: &Path, timeout: Duration) -> io::Result<Self> {
        let stream = IpcStream::connect(path)?;
        let timeout = timeout.max(Duration::from_millis(1));
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    // Named pipes opened as files have no per-call timeout; the worker
    // thread's reply is dropped by the session loop if it arrives late.
    #[cfg(not(unix))]
    fn open(path: &Path, _timeout: Duration) -> io::Result<Self> {
        let stream = fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(bytes)?;
        stream.flush()
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "player closed the IPC connection",
            ));
        }
        Ok(line)
    }
}
