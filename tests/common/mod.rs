//! A scripted in-process daemon bound to a real Unix socket, used by
//! the loopback tests to exercise the session layer over the wire.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use pax::session::message::Message;

/// State shared between a running daemon and the test body.
#[derive(Default)]
pub struct DaemonState {
    /// Every `StartSession` frame received, across all connections.
    pub hellos: StdMutex<Vec<Message>>,
    /// Number of `get-config` requests served.
    pub config_calls: AtomicUsize,
}

pub struct FakeDaemon {
    pub socket_path: PathBuf,
    pub state: Arc<DaemonState>,
    accept_task: JoinHandle<()>,
    _dir: Option<tempfile::TempDir>,
}

impl FakeDaemon {
    /// Starts a daemon on a fresh socket in its own temp directory.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pax.sock");
        Self::start_inner(path, Some(dir)).await
    }

    /// Starts a daemon on a caller-chosen path (elevated channels).
    pub async fn start_at(path: &Path) -> Self {
        Self::start_inner(path.to_path_buf(), None).await
    }

    async fn start_inner(path: PathBuf, dir: Option<tempfile::TempDir>) -> Self {
        let listener = UnixListener::bind(&path).expect("bind fake daemon socket");
        let state = Arc::new(DaemonState::default());
        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream, accept_state.clone()));
            }
        });
        Self {
            socket_path: path,
            state,
            accept_task,
            _dir: dir,
        }
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_connection(stream: UnixStream, state: Arc<DaemonState>) {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = Message::decode(&line) else {
            continue;
        };
        tokio::spawn(handle_request(request, writer.clone(), state.clone()));
    }
}

async fn handle_request(
    request: Message,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    state: Arc<DaemonState>,
) {
    let rqid = request.get("rqid").unwrap_or_default().to_string();
    match request.op() {
        "StartSession" => {
            state.hellos.lock().unwrap().push(request.clone());
            send(&writer, Message::new("session-started").add("rqid", &rqid)).await;
        }
        // Streams `n` numbered fragments, yielding between each so
        // concurrent calls interleave on the wire.
        "count" => {
            let n: usize = request.get("n").and_then(|v| v.parse().ok()).unwrap_or(0);
            for i in 0..n {
                send(
                    &writer,
                    Message::new("value").add("value", i).add("rqid", &rqid),
                )
                .await;
                tokio::task::yield_now().await;
            }
            send(&writer, Message::new("done").add("rqid", &rqid)).await;
        }
        // A fragment addressed to a request id nobody issued, then a
        // proper completion.
        "orphan-then-done" => {
            send(
                &writer,
                Message::new("value")
                    .add("value", "stray")
                    .add("rqid", "987654321"),
            )
            .await;
            send(&writer, Message::new("done").add("rqid", &rqid)).await;
        }
        // Deliberately leaves the caller parked forever.
        "never" => {}
        // First call is answered with a restart notice; the retry on
        // the next connection succeeds.
        "get-config" => {
            if state.config_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                send(&writer, Message::new("restarting").add("rqid", &rqid)).await;
            } else {
                send(
                    &writer,
                    Message::new("value").add("value", "ok").add("rqid", &rqid),
                )
                .await;
                send(&writer, Message::new("done").add("rqid", &rqid)).await;
            }
        }
        "find-packages" => {
            send(
                &writer,
                Message::new("package")
                    .add("canonical", "zlib-1.2.8.0-x64-820d50196d4e8857")
                    .add("installed", "true")
                    .add("rqid", &rqid),
            )
            .await;
            send(&writer, Message::new("done").add("rqid", &rqid)).await;
        }
        _ => {
            send(&writer, Message::new("done").add("rqid", &rqid)).await;
        }
    }
}

async fn send(writer: &Mutex<OwnedWriteHalf>, frame: Message) {
    let mut line = frame.encode();
    line.push('\n');
    let mut writer = writer.lock().await;
    let _ = writer.write_all(line.as_bytes()).await;
}
