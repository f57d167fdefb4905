//! PTY-backed remote terminal sessions keyed by request uuid
//!
//! Each session runs a shell under its own PTY. Output is read on a dedicated IO
//! thread, framed as SenML (`name = "term"`) and handed to the injected sink for
//! `channels/<ctrl>/messages/res/term/<uuid>`. A ticker counts `remaining` down
//! and a supervisor reaps the session once it reaches zero. Remote input and PTY
//! output both reset the countdown.

use crate::error::{AgentError, Result};
use crate::mqtt::Target;
use crate::senml;
use async_trait::async_trait;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_SHELL: &str = "bash";
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

const READ_BUFFER_BYTES: usize = 1024;
const OUTPUT_QUEUE: usize = 64;
const TEARDOWN_WAIT: Duration = Duration::from_secs(2);

/// Where terminal output frames are delivered
#[async_trait]
pub trait TerminalSink: Send + Sync {
    async fn publish(&self, target: Target, payload: Vec<u8>) -> Result<()>;
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

struct Session {
    generation: u64,
    pid: Option<u32>,
    timeout: Duration,
    remaining: Arc<Mutex<Duration>>,
    writer: SharedWriter,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    cancel: watch::Sender<bool>,
    forwarder: JoinHandle<()>,
    ticker: JoinHandle<()>,
    reaped: oneshot::Receiver<()>,
}

struct Inner {
    sessions: Mutex<HashMap<String, Session>>,
    // serializes opens so a uuid never gets two shells
    opening: tokio::sync::Mutex<()>,
    sink: Arc<dyn TerminalSink>,
    shell: String,
    tick: Duration,
    next_generation: AtomicU64,
}

/// Owner of every live terminal session
#[derive(Clone)]
pub struct TerminalManager {
    inner: Arc<Inner>,
}

impl TerminalManager {
    pub fn new(sink: Arc<dyn TerminalSink>) -> Self {
        Self::with_options(sink, DEFAULT_SHELL, DEFAULT_TICK)
    }

    /// Custom shell and countdown tick (tests run `sh` on a short tick)
    pub fn with_options(sink: Arc<dyn TerminalSink>, shell: &str, tick: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                opening: tokio::sync::Mutex::new(()),
                sink,
                shell: shell.to_string(),
                tick,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Start a session for `uuid` unless one is already running
    pub async fn open(&self, uuid: &str, timeout: Duration) -> Result<()> {
        let _opening = self.inner.opening.lock().await;
        if self.contains(uuid) {
            debug!(uuid, "terminal session already open");
            return Ok(());
        }

        let shell = self.inner.shell.clone();
        let io_uuid = uuid.to_string();
        let spawned = tokio::task::spawn_blocking(move || spawn_shell(&shell, &io_uuid))
            .await
            .map_err(|e| AgentError::TerminalStartFailed(e.to_string()))??;

        // the supervisor must not look the session up before it is inserted
        let mut sessions = self.inner.sessions.lock();
        let session = self.start_session(uuid, timeout, spawned);
        info!(uuid, pid = ?session.pid, "terminal session opened");
        sessions.insert(uuid.to_string(), session);
        Ok(())
    }

    /// Write remote input to the session's PTY, opening it first if needed
    pub async fn write(&self, uuid: &str, timeout: Duration, bytes: Vec<u8>) -> Result<()> {
        self.open(uuid, timeout).await?;
        let writer = {
            let sessions = self.inner.sessions.lock();
            let session = sessions
                .get(uuid)
                .ok_or_else(|| AgentError::NoSuchTerminalSession(uuid.to_string()))?;
            *session.remaining.lock() = session.timeout;
            session.writer.clone()
        };

        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock();
            writer.write_all(&bytes)?;
            writer.flush()
        })
        .await
        .map_err(|e| AgentError::TerminalWriteFailed(e.to_string()))?
        .map_err(|e| AgentError::TerminalWriteFailed(format!("{uuid}: {e}")))
    }

    /// Tear down the session for `uuid`
    pub async fn close(&self, uuid: &str) -> Result<()> {
        let session = self
            .inner
            .sessions
            .lock()
            .remove(uuid)
            .ok_or_else(|| AgentError::NoSuchTerminalSession(uuid.to_string()))?;
        teardown(uuid, session).await;
        info!(uuid, "terminal session closed");
        Ok(())
    }

    /// Child pid of the live session, if any
    pub fn pid(&self, uuid: &str) -> Option<u32> {
        self.inner.sessions.lock().get(uuid).and_then(|s| s.pid)
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.inner.sessions.lock().contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Session)> = self.inner.sessions.lock().drain().collect();
        for (uuid, session) in drained {
            teardown(&uuid, session).await;
        }
    }

    fn start_session(&self, uuid: &str, timeout: Duration, spawned: Spawned) -> Session {
        let Spawned {
            pid,
            killer,
            master,
            writer,
            chunks: chunk_rx,
            reaped: reaped_rx,
        } = spawned;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let remaining = Arc::new(Mutex::new(timeout));
        let (cancel, cancel_rx) = watch::channel(false);
        let exited = Arc::new(Notify::new());
        let (done_tx, done_rx) = oneshot::channel();

        let forwarder = tokio::spawn(forward_output(
            uuid.to_string(),
            chunk_rx,
            cancel_rx,
            remaining.clone(),
            timeout,
            self.inner.sink.clone(),
            exited.clone(),
        ));
        let ticker = tokio::spawn(count_down(remaining.clone(), self.inner.tick, exited, done_tx));

        let inner = Arc::downgrade(&self.inner);
        let supervised = uuid.to_string();
        tokio::spawn(async move {
            if done_rx.await.is_err() {
                // closed explicitly, the ticker was aborted
                return;
            }
            let Some(inner) = inner.upgrade() else { return };
            let expired = {
                let mut sessions = inner.sessions.lock();
                match sessions.get(&supervised) {
                    Some(s) if s.generation == generation => sessions.remove(&supervised),
                    _ => None,
                }
            };
            if let Some(session) = expired {
                teardown(&supervised, session).await;
                info!(uuid = %supervised, "terminal session expired");
            }
        });

        Session {
            generation,
            pid,
            timeout,
            remaining,
            writer: Arc::new(Mutex::new(writer)),
            master,
            killer,
            cancel,
            forwarder,
            ticker,
            reaped: reaped_rx,
        }
    }
}

/// A shell running under a fresh PTY, with its IO thread started
struct Spawned {
    pid: Option<u32>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    chunks: mpsc::Receiver<Vec<u8>>,
    reaped: oneshot::Receiver<()>,
}

/// Open a PTY and fork the shell onto it. Blocking.
fn spawn_shell(shell: &str, uuid: &str) -> Result<Spawned> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| AgentError::TerminalStartFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(shell);
    cmd.env("TERM", "xterm");
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| AgentError::TerminalStartFailed(format!("{shell}: {e}")))?;
    // the child holds its own copy; ours would keep the PTY from reporting EOF
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| AgentError::TerminalStartFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| AgentError::TerminalStartFailed(e.to_string()))?;

    let (chunk_tx, chunk_rx) = mpsc::channel(OUTPUT_QUEUE);
    let (reaped_tx, reaped_rx) = oneshot::channel();
    let io_uuid = uuid.to_string();
    thread::Builder::new()
        .name(format!("term-io-{uuid}"))
        .spawn(move || {
            pump_output(reader, chunk_tx);
            if let Err(e) = child.wait() {
                debug!(uuid = %io_uuid, "waiting for shell failed: {}", e);
            }
            let _ = reaped_tx.send(());
        })
        .map_err(|e| AgentError::TerminalStartFailed(e.to_string()))?;

    Ok(Spawned {
        pid,
        killer,
        master: pair.master,
        writer,
        chunks: chunk_rx,
        reaped: reaped_rx,
    })
}

/// Stop the tasks, kill and reap the shell
async fn teardown(uuid: &str, session: Session) {
    let Session {
        mut killer,
        cancel,
        forwarder,
        ticker,
        reaped,
        master,
        writer,
        ..
    } = session;

    let _ = cancel.send(true);
    ticker.abort();
    if let Err(e) = killer.kill() {
        debug!(uuid, "kill failed (shell already gone?): {}", e);
    }
    drop(writer);
    drop(master);

    if tokio::time::timeout(TEARDOWN_WAIT, forwarder).await.is_err() {
        warn!(uuid, "terminal output forwarder did not stop in time");
    }
    if tokio::time::timeout(TEARDOWN_WAIT, reaped).await.is_err() {
        warn!(uuid, "terminal shell was not reaped in time");
    }
}

/// Blocking PTY read loop; ends on EOF, read error, or a dropped receiver
fn pump_output(mut reader: Box<dyn Read + Send>, chunks: mpsc::Sender<Vec<u8>>) {
    let mut buffer = [0u8; READ_BUFFER_BYTES];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if chunks.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

async fn forward_output(
    uuid: String,
    mut chunks: mpsc::Receiver<Vec<u8>>,
    mut cancel: watch::Receiver<bool>,
    remaining: Arc<Mutex<Duration>>,
    timeout: Duration,
    sink: Arc<dyn TerminalSink>,
    exited: Arc<Notify>,
) {
    let mut pending = Vec::new();
    loop {
        let chunk = tokio::select! {
            chunk = chunks.recv() => chunk,
            _ = cancel.changed() => None,
        };
        let Some(chunk) = chunk else { break };
        if *cancel.borrow() {
            break;
        }
        *remaining.lock() = timeout;

        pending.extend_from_slice(&chunk);
        let complete = take_complete_utf8(&mut pending);
        if !complete.is_empty() {
            publish_output(&uuid, sink.as_ref(), &complete).await;
        }
    }

    if !*cancel.borrow() {
        if !pending.is_empty() {
            publish_output(&uuid, sink.as_ref(), &pending).await;
        }
        debug!(uuid = %uuid, "terminal output ended");
        exited.notify_one();
    }
}

async fn publish_output(uuid: &str, sink: &dyn TerminalSink, bytes: &[u8]) {
    let payload = match senml::encode(uuid, "term", &String::from_utf8_lossy(bytes)) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(uuid, "failed to frame terminal output: {}", e);
            return;
        }
    };
    if let Err(e) = sink.publish(Target::terminal(uuid), payload).await {
        warn!(uuid, "failed to publish terminal output: {}", e);
    }
}

/// Take everything up to a trailing incomplete UTF-8 sequence, which stays
/// in `pending` for the next read to finish
fn take_complete_utf8(pending: &mut Vec<u8>) -> Vec<u8> {
    let split = match std::str::from_utf8(pending) {
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        _ => pending.len(),
    };
    let tail = pending.split_off(split);
    std::mem::replace(pending, tail)
}

async fn count_down(
    remaining: Arc<Mutex<Duration>>,
    tick: Duration,
    exited: Arc<Notify>,
    done: oneshot::Sender<()>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let expired = {
                    let mut left = remaining.lock();
                    *left = left.saturating_sub(tick);
                    left.is_zero()
                };
                if expired {
                    break;
                }
            }
            _ = exited.notified() => break,
        }
    }
    let _ = done.send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<(Target, Vec<u8>)>>,
    }

    #[async_trait]
    impl TerminalSink for Collect {
        async fn publish(&self, target: Target, payload: Vec<u8>) -> Result<()> {
            self.frames.lock().push((target, payload));
            Ok(())
        }
    }

    fn manager(tick: Duration) -> (TerminalManager, Arc<Collect>) {
        let sink = Arc::new(Collect::default());
        (TerminalManager::with_options(sink.clone(), "sh", tick), sink)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (terminals, _) = manager(DEFAULT_TICK);
        terminals.open("T1", Duration::from_secs(30)).await.unwrap();
        let pid = terminals.pid("T1");
        assert!(pid.is_some());

        terminals.open("T1", Duration::from_secs(30)).await.unwrap();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals.pid("T1"), pid);

        terminals.close("T1").await.unwrap();
        assert!(terminals.is_empty());
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let (terminals, _) = manager(DEFAULT_TICK);
        let err = terminals.close("nope").await.unwrap_err();
        assert!(matches!(err, AgentError::NoSuchTerminalSession(_)));
    }

    #[tokio::test]
    async fn test_write_streams_output() {
        let (terminals, sink) = manager(DEFAULT_TICK);
        terminals
            .write("T1", Duration::from_secs(30), b"echo marker-$((40+2))\n".to_vec())
            .await
            .unwrap();

        let seen = wait_until(|| {
            sink.frames.lock().iter().any(|(target, payload)| {
                *target == Target::terminal("T1")
                    && senml::decode(payload)
                        .map(|f| f.name == "term" && f.string_value.contains("marker-42"))
                        .unwrap_or(false)
            })
        })
        .await;
        assert!(seen);

        terminals.close("T1").await.unwrap();
        let published = sink.frames.lock().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.frames.lock().len(), published);
    }

    #[tokio::test]
    async fn test_idle_session_expires_and_reopens_fresh() {
        let (terminals, _) = manager(Duration::from_millis(50));
        terminals.open("T2", Duration::from_millis(150)).await.unwrap();
        let first = terminals.pid("T2");

        assert!(wait_until(|| !terminals.contains("T2")).await);

        terminals.open("T2", Duration::from_secs(30)).await.unwrap();
        let second = terminals.pid("T2");
        assert!(second.is_some());
        assert_ne!(first, second);
        terminals.shutdown().await;
        assert!(terminals.is_empty());
    }

    #[tokio::test]
    async fn test_shell_exit_tears_session_down() {
        let (terminals, _) = manager(DEFAULT_TICK);
        terminals
            .write("T3", Duration::from_secs(30), b"exit\n".to_vec())
            .await
            .unwrap();
        assert!(wait_until(|| !terminals.contains("T3")).await);
    }

    #[tokio::test]
    async fn test_concurrent_opens_spawn_one_shell() {
        let (terminals, _) = manager(DEFAULT_TICK);
        let (a, b) = tokio::join!(
            terminals.open("T5", Duration::from_secs(30)),
            terminals.open("T5", Duration::from_secs(30)),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(terminals.len(), 1);
        terminals.shutdown().await;
    }

    #[test]
    fn test_incomplete_utf8_tail_is_held_back() {
        let text = "hé".as_bytes();
        let mut pending = text[..2].to_vec();
        assert_eq!(take_complete_utf8(&mut pending), b"h");
        assert_eq!(pending, vec![0xC3]);

        pending.extend_from_slice(&text[2..]);
        assert_eq!(take_complete_utf8(&mut pending), "é".as_bytes());
        assert!(pending.is_empty());

        // invalid bytes are not held back
        let mut pending = vec![b'a', 0xFF, b'b'];
        assert_eq!(take_complete_utf8(&mut pending), vec![b'a', 0xFF, b'b']);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_multibyte_output_split_across_reads() {
        let sink = Arc::new(Collect::default());
        let (tx, rx) = mpsc::channel(4);
        let (_cancel, cancel_rx) = watch::channel(false);
        let forwarder = tokio::spawn(forward_output(
            "T4".to_string(),
            rx,
            cancel_rx,
            Arc::new(Mutex::new(Duration::from_secs(5))),
            Duration::from_secs(5),
            sink.clone(),
            Arc::new(Notify::new()),
        ));

        let text = "héllo €".as_bytes();
        for chunk in [&text[..2], &text[2..7], &text[7..]] {
            tx.send(chunk.to_vec()).await.unwrap();
        }
        drop(tx);
        forwarder.await.unwrap();

        let frames: Vec<String> = sink
            .frames
            .lock()
            .iter()
            .map(|(_, payload)| senml::decode(payload).unwrap().string_value)
            .collect();
        assert!(frames.iter().all(|f| !f.contains('\u{FFFD}')));
        assert_eq!(frames.concat(), "héllo €");
    }
}
