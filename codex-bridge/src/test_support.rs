//! Test doubles for the app-server: a scripted peer over in-memory pipes and
//! shell scripts spawned in place of the real binary.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

use crate::bridge::protocol::{Envelope, Request, RequestId, RpcError};
use crate::bridge::transport::MessageTransport;
#[cfg(unix)]
pub(crate) use script::ScriptSpawner;

pub(crate) struct FakeAppServer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

/// A transport wired to a fake app-server. Dropping the fake closes the child's output.
pub(crate) fn fake_app_server() -> (Arc<MessageTransport>, FakeAppServer) {
    let (ours, theirs) = tokio::io::duplex(256 * 1024);
    let (our_read, our_write) = tokio::io::split(ours);
    let (their_read, their_write) = tokio::io::split(theirs);
    let transport = Arc::new(MessageTransport::new(our_write, our_read));
    let fake = FakeAppServer {
        lines: BufReader::new(their_read).lines(),
        writer: their_write,
    };
    (transport, fake)
}

impl FakeAppServer {
    pub(crate) async fn recv(&mut self) -> Envelope {
        let line = self
            .lines
            .next_line()
            .await
            .expect("read from bridge")
            .expect("bridge closed its side");
        serde_json::from_str(&line).expect("bridge wrote valid JSON")
    }

    pub(crate) async fn recv_request(&mut self) -> Request {
        match self.recv().await {
            Envelope::Request(req) => req,
            other => panic!("expected request, got {other:?}"),
        }
    }

    pub(crate) async fn send(&mut self, envelope: Envelope) {
        let line = serde_json::to_string(&envelope).expect("serialize envelope");
        self.send_raw(&line).await;
    }

    pub(crate) async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub(crate) async fn reply(&mut self, id: RequestId, result: Value) {
        self.send(Envelope::response(id, Ok(result))).await;
    }

    pub(crate) async fn reply_error(&mut self, id: RequestId, error: RpcError) {
        self.send(Envelope::response(id, Err(error))).await;
    }

    pub(crate) async fn notify(&mut self, method: &str, params: Value) {
        self.send(Envelope::notification(method, params)).await;
    }
}

#[cfg(unix)]
mod script {
    use std::path::{Path, PathBuf};
    use std::process::Stdio;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::process::{Child, Command};

    use crate::supervisor::{ChildSpawner, SpawnError};

    /// Runs a shell script in place of the app-server; `$1` is a side-channel file.
    pub(crate) struct ScriptSpawner {
        script: &'static str,
        side_channel: PathBuf,
        remaining: AtomicUsize,
    }

    impl ScriptSpawner {
        pub(crate) fn new(script: &'static str, side_channel: PathBuf) -> Self {
            Self {
                script,
                side_channel,
                remaining: AtomicUsize::new(usize::MAX),
            }
        }

        /// Fail every spawn after the first `n`.
        pub(crate) fn with_spawn_limit(self, n: usize) -> Self {
            self.remaining.store(n, Ordering::SeqCst);
            self
        }
    }

    impl ChildSpawner for ScriptSpawner {
        fn spawn(&self, _program: &Path) -> Result<Child, SpawnError> {
            let allowed = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "spawn limit reached",
                )
                .into());
            }

            let child = Command::new("sh")
                .arg("-c")
                .arg(self.script)
                .arg("sh")
                .arg(&self.side_channel)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            Ok(child)
        }
    }
}
