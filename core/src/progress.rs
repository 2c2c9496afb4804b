//! Progress Service.
//!
//! Out-of-process request/reply endpoint aggregating progress updates from
//! concurrently executing stages (and their child workers) into a single
//! stream of human-readable lines. Grounded directly on
//! `eqasim/pipeline/progress.py`'s `ProgressServer`/`ProgressClient`/
//! `PipelineProgress` -- every tracked field and the print format come from
//! there. Transport is newline-delimited JSON over a loopback TCP socket,
//! the idiomatic Rust substitute for the source's ZeroMQ REQ/REP pair
//! (SPEC_FULL.md §11.4).

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::ProgressError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Message {
    Initialize {
        uuid: String,
        total: Option<u64>,
        desc: Option<String>,
        interval: Option<f64>,
    },
    Update {
        uuid: String,
        count: Option<u64>,
    },
    Finalize {
        uuid: String,
    },
    Close,
}

/// Open-and-close a listening socket to discover a free local port, exactly
/// as the source's `get_random_port()` does.
pub fn pick_free_port() -> Result<u16, ProgressError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(ProgressError::Bind)?;
    let port = listener.local_addr().map_err(ProgressError::Bind)?.port();
    drop(listener);
    Ok(port)
}

struct Tracker {
    total: Option<u64>,
    desc: Option<String>,
    current: u64,
    interval: f64,
    start_time: Instant,
    last_print: Option<Instant>,
}

fn format_line(desc: Option<&str>, current: u64, total: Option<u64>, start_time: Instant) -> String {
    let mut parts = vec![desc.unwrap_or("Progress").to_string()];

    match total {
        None => parts.push(format!("[{}]", current)),
        Some(total) => {
            let total_str = total.to_string();
            let current_str = current.to_string();
            let padded = format!("{:>width$}", current_str, width = total_str.len());
            let fraction = current as f64 / total as f64;
            parts.push(format!("{}/{} ({:>7.2}%)", padded, total, 100.0 * fraction));

            let ticks = (fraction * 10.0).round().clamp(0.0, 10.0) as usize;
            parts.push(format!("[{}{}]", "#".repeat(ticks), " ".repeat(10 - ticks)));
        }
    }

    let runtime = start_time.elapsed().as_secs_f64().max(f64::EPSILON);
    let speed = current as f64 / runtime;

    if speed >= 1.0 {
        parts.push(format!("{:.2} it/s", speed));
    } else {
        parts.push(format!("{:.2} s/it", 1.0 / speed));
    }

    parts.join(" ")
}

type SharedState = std::sync::Arc<Mutex<HashMap<String, Tracker>>>;

async fn process_message(state: &SharedState, message: Message) {
    match message {
        Message::Initialize { uuid, total, desc, interval } => {
            let mut trackers = state.lock().await;
            trackers.insert(
                uuid,
                Tracker {
                    total,
                    desc,
                    current: 0,
                    interval: interval.unwrap_or(1.0),
                    start_time: Instant::now(),
                    last_print: None,
                },
            );
        }
        Message::Update { uuid, count } => {
            let mut trackers = state.lock().await;
            if let Some(tracker) = trackers.get_mut(&uuid) {
                tracker.current += count.unwrap_or(1);

                let should_print = match tracker.last_print {
                    None => true,
                    Some(last) => last.elapsed().as_secs_f64() > tracker.interval,
                };

                if should_print {
                    println!(
                        "{}",
                        format_line(tracker.desc.as_deref(), tracker.current, tracker.total, tracker.start_time)
                    );
                    tracker.last_print = Some(Instant::now());
                }
            }
            // Unknown uuid is silently ignored.
        }
        Message::Finalize { uuid } => {
            let mut trackers = state.lock().await;
            if let Some(tracker) = trackers.remove(&uuid) {
                println!(
                    "{}",
                    format_line(tracker.desc.as_deref(), tracker.current, tracker.total, tracker.start_time)
                );
            }
            // Unknown uuid is silently ignored.
        }
        Message::Close => {
            // Handled by the caller via the shutdown channel.
        }
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    state: SharedState,
    shutdown: mpsc::Sender<()>,
) -> Result<(), ProgressError> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader};

    let (read_half, mut write_half) = socket.into_split();
    let mut reader = AsyncBufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await.map_err(ProgressError::Io)?;
        if bytes_read == 0 {
            break; // client closed the connection
        }

        let message: Message = serde_json::from_str(line.trim_end()).map_err(ProgressError::Malformed)?;
        let is_close = matches!(message, Message::Close);

        process_message(&state, message).await;

        write_half.write_all(b"{}\n").await.map_err(ProgressError::Io)?;

        if is_close {
            let _ = shutdown.send(()).await;
            break;
        }
    }

    Ok(())
}

/// Run the progress server's accept loop until a `close` message is
/// received. Single-threaded in the sense that every message is processed
/// to completion (under a shared mutex) before the next one starts, exactly
/// as the source's blocking `socket.recv_json()` loop.
pub async fn run_server(port: u16) -> Result<(), ProgressError> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(ProgressError::Bind)?;
    let state: SharedState = std::sync::Arc::new(Mutex::new(HashMap::new()));
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, _) = accepted.map_err(ProgressError::Io)?;
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(socket, state, shutdown_tx).await;
                });
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

/// A single request/reply connection to a running progress server.
struct ProgressConnection {
    stream: TcpStream,
}

impl ProgressConnection {
    fn connect(port: u16) -> Result<Self, ProgressError> {
        let stream = TcpStream::connect(("127.0.0.1", port)).map_err(ProgressError::Connect)?;
        Ok(Self { stream })
    }

    fn send(&mut self, message: &Message) -> Result<(), ProgressError> {
        let mut line = serde_json::to_string(message).map_err(ProgressError::Malformed)?;
        line.push('\n');
        self.stream.write_all(line.as_bytes()).map_err(ProgressError::Io)?;

        let mut reader = BufReader::new(&self.stream);
        let mut reply = String::new();
        reader.read_line(&mut reply).map_err(ProgressError::Io)?;
        Ok(())
    }
}

/// A client-owned handle to one named progress tracker, bound to the
/// Progress Service at `port`. Acquires the tracker on creation (via
/// `initialize`) and releases it on drop (via `finalize`), matching the
/// source's `PipelineProgress.__enter__`/`__exit__`.
pub struct ProgressHandle {
    conn: ProgressConnection,
    uuid: String,
    port: u16,
    finalized: bool,
}

impl ProgressHandle {
    pub(crate) fn new(
        port: u16,
        desc: Option<String>,
        total: Option<u64>,
        interval: Option<f64>,
    ) -> Result<Self, ProgressError> {
        let uuid = Uuid::new_v4().to_string();
        let mut conn = ProgressConnection::connect(port)?;
        conn.send(&Message::Initialize { uuid: uuid.clone(), total, desc, interval })?;
        Ok(Self { conn, uuid, port, finalized: false })
    }

    /// Increment this tracker's counter by `count` (default 1).
    pub fn update(&mut self, count: Option<u64>) -> Result<(), ProgressError> {
        self.conn.send(&Message::Update { uuid: self.uuid.clone(), count })
    }

    /// Derive another handle bound to the *same* uuid, skipping
    /// re-initialization, so that multiple workers in a pool can share one
    /// counter -- matches the source's `PipelineProgress.parallel()`.
    pub fn parallel(&self) -> Result<ProgressHandle, ProgressError> {
        let conn = ProgressConnection::connect(self.port)?;
        Ok(ProgressHandle { conn, uuid: self.uuid.clone(), port: self.port, finalized: false })
    }

    fn finalize_now(&mut self) {
        if !self.finalized {
            let _ = self.conn.send(&Message::Finalize { uuid: self.uuid.clone() });
            self.finalized = true;
        }
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        self.finalize_now();
    }
}

/// Owns the out-of-process Progress Service for the lifetime of one engine
/// run: spawns it before the first stage runs, joins it after the last.
pub struct ProgressService {
    child: std::process::Child,
    port: u16,
}

impl ProgressService {
    /// Spawn the progress server as a genuinely separate OS process by
    /// re-invoking the current executable with a hidden
    /// `--progress-server <port>` argument, mirroring the source's
    /// `multiprocessing.Process(target=run_server)`.
    pub fn spawn() -> Result<Self, ProgressError> {
        let port = pick_free_port()?;
        let exe = std::env::current_exe().map_err(ProgressError::Spawn)?;
        let child = std::process::Command::new(exe)
            .arg("--progress-server")
            .arg(port.to_string())
            .spawn()
            .map_err(ProgressError::Spawn)?;
        Ok(Self { child, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send `close` and join the child process.
    pub fn close_and_join(mut self) -> Result<(), ProgressError> {
        let mut conn = ProgressConnection::connect(self.port)?;
        conn.send(&Message::Close)?;
        self.child.wait().map_err(ProgressError::Io)?;
        Ok(())
    }
}
