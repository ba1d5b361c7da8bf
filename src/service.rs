use std::io::Read;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::embed::Embedder;
use crate::error::{EmberError, Result};
use crate::protocol::{
    read_frame, write_frame, EmbedPayload, EmbedReply, HealthReply, Op, Request, Response, Status,
    RECV_BUFFER_BYTES,
};

/// How long a spawning parent waits for the child to report healthy.
const READY_TIMEOUT: Duration = Duration::from_secs(20);
/// Coarse polling interval during the ready wait.
const READY_POLL: Duration = Duration::from_millis(500);
/// The pid record is only written after the child survives this long.
const FIRST_INSTANT: Duration = Duration::from_millis(150);
/// Grace period between the shutdown request / SIGTERM / SIGKILL stages.
const STOP_GRACE: Duration = Duration::from_millis(1500);
/// Accept-loop sleep while idle-polling the non-blocking listener.
const ACCEPT_POLL: Duration = Duration::from_millis(100);
/// Error backoff starts here and doubles, capped below.
const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

pub struct ServerOptions {
    pub socket_path: std::path::PathBuf,
    pub pid_path: std::path::PathBuf,
    pub idle_timeout: Duration,
}

/// Serve embed requests until shut down or idle for `idle_timeout`.
///
/// The model is loaded before the socket is bound, so a successful health
/// probe implies readiness. The listener is non-blocking; accept timeouts
/// are routine and persistent errors back off instead of busy-looping.
pub fn run_server(embedder: &dyn Embedder, opts: &ServerOptions) -> Result<()> {
    embedder.warm()?;

    if let Some(dir) = opts.socket_path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| EmberError::EmbedderFailure(format!("create runtime dir: {e}")))?;
    }

    // A live server on this socket means a second instance was asked for.
    if probe_health(&opts.socket_path).is_some() {
        return Err(EmberError::EmbedderFailure(
            "an embedding service is already listening on this socket".into(),
        ));
    }
    let _ = std::fs::remove_file(&opts.socket_path);

    let listener = UnixListener::bind(&opts.socket_path)
        .map_err(|e| EmberError::EmbedderFailure(format!("bind {}: {e}", opts.socket_path.display())))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| EmberError::EmbedderFailure(format!("set_nonblocking: {e}")))?;

    // Record our own pid so health recovery works even if the spawner's
    // record was lost.
    let _ = std::fs::write(&opts.pid_path, std::process::id().to_string());

    tracing::info!(
        "embedding service ready on {} (model {}, idle timeout {}s)",
        opts.socket_path.display(),
        embedder.name(),
        opts.idle_timeout.as_secs()
    );

    let mut last_request = Instant::now();
    let mut backoff = BACKOFF_MIN;
    let mut shutdown = false;

    while !shutdown {
        match listener.accept() {
            Ok((stream, _)) => {
                backoff = BACKOFF_MIN;
                last_request = Instant::now();
                shutdown = handle_connection(embedder, stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if last_request.elapsed() >= opts.idle_timeout {
                    tracing::info!(
                        "no requests for {}s, shutting down",
                        opts.idle_timeout.as_secs()
                    );
                    break;
                }
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                tracing::warn!("accept error: {e}; backing off {}ms", backoff.as_millis());
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }

    let _ = std::fs::remove_file(&opts.socket_path);
    let _ = std::fs::remove_file(&opts.pid_path);
    Ok(())
}

/// One request per connection. Returns true when the peer asked us to stop.
fn handle_connection(embedder: &dyn Embedder, mut stream: UnixStream) -> bool {
    // Some platforms hand accepted sockets the listener's non-blocking flag.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(10)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(10)));

    let req: Request = match read_frame(&mut stream) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("unreadable request: {e}");
            return false;
        }
    };

    let (resp, shutdown) = match req.op {
        Op::Health => (
            Response::ok(
                serde_json::to_value(HealthReply {
                    model: embedder.name().to_string(),
                    dim: embedder.dim(),
                    fingerprint: embedder.fingerprint(),
                    pid: std::process::id(),
                })
                .unwrap_or(serde_json::Value::Null),
            ),
            false,
        ),
        Op::Embed => match serde_json::from_value::<EmbedPayload>(req.payload) {
            Ok(payload) if !payload.texts.is_empty() => match embedder.embed(&payload.texts) {
                Ok(vectors) => (
                    Response::ok(
                        serde_json::to_value(EmbedReply {
                            dim: embedder.dim(),
                            vectors,
                        })
                        .unwrap_or(serde_json::Value::Null),
                    ),
                    false,
                ),
                Err(e) => (Response::err("embedder_failure", e.to_string()), false),
            },
            Ok(_) => (
                Response::err("bad_request", "embed payload must carry at least one text"),
                false,
            ),
            Err(e) => (Response::err("bad_request", format!("bad embed payload: {e}")), false),
        },
        Op::Shutdown => (Response::ok(serde_json::Value::Null), true),
    };

    if let Err(e) = write_frame(&mut stream, &resp) {
        tracing::warn!("failed to write response: {e}");
    }

    // The contract is one message per connection; anything else is a
    // protocol violation that gets logged and discarded.
    let _ = stream.set_nonblocking(true);
    let mut extra = [0u8; RECV_BUFFER_BYTES];
    if let Ok(n) = stream.read(&mut extra) {
        if n > 0 {
            tracing::warn!("protocol violation: {n} extra bytes on connection, discarded");
        }
    }

    shutdown
}

/// Short-leash health probe; `None` when nothing healthy is listening.
pub fn probe_health(socket_path: &Path) -> Option<HealthReply> {
    let stream = UnixStream::connect(socket_path).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(2))).ok()?;
    stream.set_write_timeout(Some(Duration::from_secs(2))).ok()?;
    let mut stream = stream;
    write_frame(
        &mut stream,
        &Request {
            op: Op::Health,
            payload: serde_json::Value::Null,
        },
    )
    .ok()?;
    let resp: Response = read_frame(&mut stream).ok()?;
    if resp.status != Status::Ok {
        return None;
    }
    serde_json::from_value(resp.payload).ok()
}

/// Bring up the embedding server as a detached child of this process and
/// wait until it answers health probes.
///
/// The child's stderr goes to a log file next to the socket; if the child
/// dies during the ready wait, the log tail becomes the reported error and
/// the pid record is cleaned up again.
pub fn spawn_server(
    root: &Path,
    model: &str,
    socket_path: &Path,
    pid_path: &Path,
    idle_secs: u64,
) -> Result<()> {
    let exe = std::env::current_exe()
        .map_err(|e| EmberError::EmbedderFailure(format!("cannot locate own binary: {e}")))?;

    let runtime_dir = socket_path
        .parent()
        .ok_or_else(|| EmberError::EmbedderFailure("socket path has no parent".into()))?;
    std::fs::create_dir_all(runtime_dir)
        .map_err(|e| EmberError::EmbedderFailure(format!("create runtime dir: {e}")))?;

    let log_path = runtime_dir.join("embed.log");
    let log_file = std::fs::File::create(&log_path)
        .map_err(|e| EmberError::EmbedderFailure(format!("create server log: {e}")))?;

    tracing::info!("starting embedding service (model {model})");
    let mut child = Command::new(&exe)
        .args([
            "embed-server",
            "--root",
            &root.to_string_lossy(),
            "--model",
            model,
            "--idle-secs",
            &idle_secs.to_string(),
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log_file))
        .spawn()
        .map_err(|e| EmberError::EmbedderFailure(format!("spawn embedding service: {e}")))?;

    // Only record the pid once the child survived the first instant; a
    // child that dies immediately must not leave a stale record behind.
    std::thread::sleep(FIRST_INSTANT);
    if let Ok(Some(status)) = child.try_wait() {
        return Err(startup_failure(&log_path, status.code()));
    }
    let _ = std::fs::write(pid_path, child.id().to_string());

    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        if probe_health(socket_path).is_some() {
            return Ok(());
        }
        if let Ok(Some(status)) = child.try_wait() {
            let _ = std::fs::remove_file(pid_path);
            return Err(startup_failure(&log_path, status.code()));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            let _ = std::fs::remove_file(pid_path);
            return Err(EmberError::EmbedderFailure(format!(
                "embedding service did not become ready within {}s",
                READY_TIMEOUT.as_secs()
            )));
        }
        std::thread::sleep(READY_POLL);
    }
}

fn startup_failure(log_path: &Path, code: Option<i32>) -> EmberError {
    let tail = std::fs::read_to_string(log_path)
        .map(|s| {
            let lines: Vec<&str> = s.lines().rev().take(10).collect();
            lines.into_iter().rev().collect::<Vec<_>>().join("\n")
        })
        .unwrap_or_default();
    EmberError::EmbedderFailure(format!(
        "embedding service exited during startup (code {:?}): {}",
        code,
        if tail.is_empty() { "<no output>" } else { &tail }
    ))
}

/// Stop a running server: graceful shutdown request, then SIGTERM, then
/// SIGKILL. Success is observed process death, not signal delivery; records
/// are removed only after confirmed death.
pub fn stop_server(socket_path: &Path, pid_path: &Path) -> Result<()> {
    // Best-effort graceful request.
    if let Ok(stream) = UnixStream::connect(socket_path) {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut stream = stream;
        let _ = write_frame(
            &mut stream,
            &Request {
                op: Op::Shutdown,
                payload: serde_json::Value::Null,
            },
        );
        let _: std::io::Result<Response> = read_frame(&mut stream);
    }

    let pid: Option<i32> = std::fs::read_to_string(pid_path)
        .ok()
        .and_then(|s| s.trim().parse().ok());

    let Some(pid) = pid else {
        // No record; nothing to confirm dead.
        let _ = std::fs::remove_file(socket_path);
        return Ok(());
    };

    if wait_for_death(pid, STOP_GRACE) {
        remove_records(socket_path, pid_path);
        return Ok(());
    }

    unsafe { libc::kill(pid, libc::SIGTERM) };
    if wait_for_death(pid, STOP_GRACE) {
        remove_records(socket_path, pid_path);
        return Ok(());
    }

    tracing::warn!("embedding service (pid {pid}) ignored SIGTERM, sending SIGKILL");
    unsafe { libc::kill(pid, libc::SIGKILL) };
    if wait_for_death(pid, Duration::from_secs(2)) {
        remove_records(socket_path, pid_path);
        return Ok(());
    }

    Err(EmberError::EmbedderFailure(format!(
        "embedding service (pid {pid}) did not die"
    )))
}

fn remove_records(socket_path: &Path, pid_path: &Path) {
    let _ = std::fs::remove_file(socket_path);
    let _ = std::fs::remove_file(pid_path);
}

fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

fn wait_for_death(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    !pid_alive(pid)
}
