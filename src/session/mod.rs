//! Transport session: one persistent Unix-socket channel to the
//! privileged daemon, shared by every concurrent logical call.
//!
//! The session owns at most one live connection. Any number of calls
//! may be dispatched concurrently; each registers a [`PendingCall`]
//! under a fresh correlation id, writes one request frame, and parks on
//! its own wake signal. A single receive loop reads frames strictly in
//! arrival order and routes each to its owning call by `rqid`.
//! Disconnecting (explicit, or after an I/O failure) wakes every
//! outstanding call with a connection-lost failure; nothing is left
//! parked.

pub mod elevation;
pub mod message;
pub mod registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::session::message::Message;
use crate::session::registry::CallRegistry;

/// Default socket name under the runtime directory.
const SOCKET_NAME: &str = "pax.sock";

/// What a fragment handler tells the dispatcher after each fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// More fragments expected; keep waiting.
    Continue,
    /// This was the final fragment; the call is complete.
    Done,
    /// The daemon announced it is restarting; the call must be
    /// re-issued from scratch once the service settles.
    Restarting,
}

/// How a dispatched call ended, short of a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEnd {
    Completed,
    Restarting,
}

/// Session tunables. The defaults mirror the daemon's: 25 connection
/// attempts at 400ms each before giving up.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base channel path for an unelevated session.
    pub socket_path: PathBuf,
    /// Privileged helper launched to open an elevated channel.
    pub elevation_helper: PathBuf,
    pub connect_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            elevation_helper: PathBuf::from("/usr/libexec/pax-elevate"),
            connect_attempts: 25,
            connect_timeout: Duration::from_millis(400),
        }
    }
}

/// Default socket path: runtime dir when available, `/tmp` otherwise.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(SOCKET_NAME)
}

struct SessionState {
    writer: Option<Arc<Mutex<OwnedWriteHalf>>>,
    receive_task: Option<JoinHandle<()>>,
    /// Current channel path; swapped by elevation.
    socket_path: PathBuf,
    elevated: bool,
    /// Bumped on every successful connect so a stale receive loop
    /// cannot tear down its successor.
    generation: u64,
}

/// One client session. Construct once and share via `Arc`; connection
/// happens lazily on the first call.
pub struct Session {
    config: SessionConfig,
    state: Mutex<SessionState>,
    registry: CallRegistry,
    /// Held shared by connects, exclusively by elevation.
    elevation_gate: RwLock<()>,
    restarting: AtomicBool,
    next_rqid: AtomicU64,
}

impl Session {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let socket_path = config.socket_path.clone();
        Arc::new(Self {
            config,
            state: Mutex::new(SessionState {
                writer: None,
                receive_task: None,
                socket_path,
                elevated: false,
                generation: 0,
            }),
            registry: CallRegistry::new(),
            elevation_gate: RwLock::new(()),
            restarting: AtomicBool::new(false),
            next_rqid: AtomicU64::new(1),
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.writer.is_some()
    }

    pub async fn is_elevated(&self) -> bool {
        self.state.lock().await.elevated
    }

    /// True between a daemon restart announcement and the next
    /// successful reconnect.
    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::Acquire)
    }

    pub(crate) fn mark_restarting(&self) {
        self.restarting.store(true, Ordering::Release);
    }

    /// Idempotent connect. Returns immediately when a channel is
    /// already up; otherwise runs the bounded attempt loop under the
    /// session lock, so concurrent callers await the same attempt
    /// instead of racing their own.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        // Elevation excludes new connects for its whole duration.
        let _gate = self.elevation_gate.read().await;
        let mut state = self.state.lock().await;
        if state.writer.is_some() {
            return Ok(());
        }

        let stream = self.try_connect(&state.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();

        state.generation += 1;
        let generation = state.generation;
        let session_id = format!("{}/{}", std::process::id(), generation);
        tracing::debug!(%session_id, path = %state.socket_path.display(), "connected");

        let hello = Message::new("StartSession")
            .add("client", std::process::id())
            .add("id", &session_id)
            .add("rqid", &session_id);
        let mut line = hello.encode();
        line.push('\n');
        write_half.write_all(line.as_bytes()).await?;

        state.writer = Some(Arc::new(Mutex::new(write_half)));
        state.receive_task = Some(tokio::spawn(
            self.clone().receive_loop(read_half, generation),
        ));
        self.restarting.store(false, Ordering::Release);
        Ok(())
    }

    async fn try_connect(&self, path: &Path) -> Result<UnixStream> {
        for attempt in 0..self.config.connect_attempts {
            let started = tokio::time::Instant::now();
            match timeout(self.config.connect_timeout, UnixStream::connect(path)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    tracing::trace!(attempt, error = %e, "connect attempt failed");
                    // burn the rest of the attempt window before retrying
                    let elapsed = started.elapsed();
                    if elapsed < self.config.connect_timeout {
                        tokio::time::sleep(self.config.connect_timeout - elapsed).await;
                    }
                }
                Err(_) => tracing::trace!(attempt, "connect attempt timed out"),
            }
        }
        Err(Error::ServiceUnavailable(format!(
            "no daemon at {} after {} attempts",
            path.display(),
            self.config.connect_attempts
        )))
    }

    /// The single receive loop for one connection. One read is
    /// outstanding at a time; a frame is fully decoded and routed
    /// before the next read begins, so fragments reach their calls
    /// strictly in arrival order.
    async fn receive_loop(self: Arc<Self>, read_half: OwnedReadHalf, generation: u64) {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    tracing::debug!("daemon closed the channel");
                    break;
                }
                Ok(_) => {
                    let frame = match Message::decode(&line) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(error = %e, "undecodable frame, tearing down");
                            break;
                        }
                    };
                    self.route(frame);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "channel read failed");
                    break;
                }
            }
        }
        self.disconnect_if_current(generation).await;
    }

    fn route(&self, frame: Message) {
        let Some(rqid) = frame.rqid() else {
            // No protocol version negotiation exists; frames we cannot
            // correlate are dropped, as the daemon has always done.
            tracing::trace!(op = frame.op(), "dropping uncorrelated frame");
            return;
        };
        match self.registry.lookup(rqid) {
            Some(call) => call.enqueue(frame),
            None => tracing::trace!(rqid, op = frame.op(), "dropping orphan frame"),
        }
    }

    /// Dispatches one logical call: registers a pending call, sends the
    /// request frame carrying the fresh `rqid`, then drains response
    /// fragments through `on_fragment` until it reports the call done
    /// or the daemon announces a restart. A disconnect while parked
    /// fails the call with `ServiceUnavailable`.
    pub async fn perform_call<F>(&self, request: Message, mut on_fragment: F) -> Result<CallEnd>
    where
        F: FnMut(Message) -> Result<FragmentOutcome>,
    {
        let rqid = self.next_rqid.fetch_add(1, Ordering::Relaxed);
        let call = self.registry.register(rqid)?;
        let _guard = UnregisterOnDrop {
            registry: &self.registry,
            rqid,
        };

        self.send(request.set_rqid(rqid)).await?;

        loop {
            while let Some(fragment) = call.dequeue() {
                match on_fragment(fragment)? {
                    FragmentOutcome::Continue => {}
                    FragmentOutcome::Done => return Ok(CallEnd::Completed),
                    FragmentOutcome::Restarting => {
                        self.mark_restarting();
                        return Ok(CallEnd::Restarting);
                    }
                }
            }
            if !call.is_working() {
                return Err(Error::ServiceUnavailable(
                    "connection lost while waiting for a response".into(),
                ));
            }
            call.wait().await;
        }
    }

    /// Writes one frame. Frame writes are serialized under the write
    /// half's lock so concurrent calls never interleave on the wire.
    async fn send(&self, frame: Message) -> Result<()> {
        let writer = self
            .state
            .lock()
            .await
            .writer
            .clone()
            .ok_or_else(|| Error::ServiceUnavailable("session is not connected".into()))?;
        let mut line = frame.encode();
        line.push('\n');
        let mut writer = writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Closes the channel and cancels every outstanding call.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        Self::teardown(&mut state, &self.registry);
    }

    /// Teardown driven by a receive loop that observed EOF or an error;
    /// a no-op when that loop's connection has already been replaced.
    async fn disconnect_if_current(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation == generation {
            Self::teardown(&mut state, &self.registry);
        }
    }

    fn teardown(state: &mut SessionState, registry: &CallRegistry) {
        if state.writer.take().is_some() {
            tracing::debug!("disconnecting session");
        }
        // Invalidate the live receive loop's generation so a late EOF
        // from it cannot tear down a successor connection.
        state.generation += 1;
        // Wake parked dispatchers first; each unregisters itself.
        registry.reset_all();
        if let Some(task) = state.receive_task.take() {
            task.abort();
        }
    }

    async fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }
}

impl SessionState {
    fn switch_channel(&mut self, path: PathBuf) {
        self.socket_path = path;
        self.elevated = true;
    }

    fn clear_elevated(&mut self) {
        self.elevated = false;
    }
}

struct UnregisterOnDrop<'a> {
    registry: &'a CallRegistry,
    rqid: u64,
}

impl Drop for UnregisterOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.rqid);
    }
}
